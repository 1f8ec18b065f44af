//! Error types for unisql.

use thiserror::Error;

/// The main error type for unisql operations.
#[derive(Debug, Error)]
pub enum UnisqlError {
    /// Invalid dialect or connection parameters, raised before connecting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The native handle could not be established, or was lost.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// No usable driver, or an unsupported capability of the environment.
    #[error("Environment error: {0}")]
    Environment(String),

    /// The backend rejected a statement.
    #[error("SQL error: {message} (SQL: {translated})")]
    Sql {
        message: String,
        original: String,
        translated: String,
    },

    /// A SELECT/FROM structure or a canonical pseudo-function could not be parsed.
    #[error("Parse error: {message} (in: {input})")]
    Parse { input: String, message: String },

    /// A result expected to contain rows is empty.
    #[error("No results: {0}")]
    NoResults(String),

    /// Iteration advanced past the last row, or the result was released.
    #[error("No remaining rows: {0}")]
    NoRemainingRows(String),

    /// API misuse.
    #[error("Programmer error: {0}")]
    Programmer(String),

    /// A value could not be escaped or unescaped.
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema cache (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl UnisqlError {
    /// Create a parse error for the given input.
    pub fn parse(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            input: input.into(),
            message: message.into(),
        }
    }

    /// Create an SQL error carrying both sides of the translation.
    pub fn sql(
        message: impl Into<String>,
        original: impl Into<String>,
        translated: impl Into<String>,
    ) -> Self {
        Self::Sql {
            message: message.into(),
            original: original.into(),
            translated: translated.into(),
        }
    }

    pub fn programmer(message: impl Into<String>) -> Self {
        Self::Programmer(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn environment(message: impl Into<String>) -> Self {
        Self::Environment(message.into())
    }

    /// Whether the error must abort the calling operation without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Connectivity(_) | Self::Environment(_)
        )
    }
}

/// Result type alias for unisql operations.
pub type UnisqlResult<T> = Result<T, UnisqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UnisqlError::parse("FROM (SELECT 1)", "subqueries are not supported");
        assert_eq!(
            err.to_string(),
            "Parse error: subqueries are not supported (in: FROM (SELECT 1))"
        );
    }

    #[test]
    fn test_sql_error_carries_translation() {
        let err = UnisqlError::sql("syntax error", "SELECT TRUE", "SELECT 1");
        match &err {
            UnisqlError::Sql { original, translated, .. } => {
                assert_eq!(original, "SELECT TRUE");
                assert_eq!(translated, "SELECT 1");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_fatal());
        assert!(UnisqlError::environment("no driver").is_fatal());
    }
}
