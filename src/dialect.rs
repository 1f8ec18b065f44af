//! Supported backends and the native drivers that can serve them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{UnisqlError, UnisqlResult};

/// Supported SQL dialects.
///
/// A dialect is fixed when a connection is created and drives every
/// translation and escaping decision for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    MySQL,
    Postgres,
    SQLite,
    SqlServer,
}

impl Default for Dialect {
    fn default() -> Self {
        Self::SQLite
    }
}

impl Dialect {
    pub const ALL: [Dialect; 4] = [
        Dialect::MySQL,
        Dialect::Postgres,
        Dialect::SQLite,
        Dialect::SqlServer,
    ];

    /// Short lowercase name, as used in URLs and config files.
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::MySQL => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::SQLite => "sqlite",
            Dialect::SqlServer => "mssql",
        }
    }

    /// Whether `LIMIT n OFFSET m` is understood natively.
    pub fn supports_limit_offset(&self) -> bool {
        !matches!(self, Dialect::SqlServer)
    }

    /// Whether `FOREIGN KEY` clauses are enforced without extra work.
    pub fn enforces_foreign_keys(&self) -> bool {
        !matches!(self, Dialect::SQLite)
    }

    /// Whether the backend has a native boolean literal.
    pub fn has_boolean_literals(&self) -> bool {
        matches!(self, Dialect::MySQL | Dialect::Postgres)
    }

    /// Whether a backslash escapes the next character inside string literals.
    pub fn has_backslash_escapes(&self) -> bool {
        matches!(self, Dialect::MySQL)
    }

    /// Default TCP port, if the backend is networked.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Dialect::MySQL => Some(3306),
            Dialect::Postgres => Some(5432),
            Dialect::SQLite => None,
            Dialect::SqlServer => Some(1433),
        }
    }

    /// Quote an identifier for this dialect.
    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            Dialect::MySQL => format!("`{}`", name.replace('`', "``")),
            Dialect::Postgres | Dialect::SQLite => format!("\"{}\"", name.replace('"', "\"\"")),
            Dialect::SqlServer => format!("[{}]", name.replace(']', "]]")),
        }
    }

    /// Native drivers able to serve this dialect, most preferred first.
    pub fn drivers(&self) -> &'static [Driver] {
        match self {
            Dialect::MySQL => &[Driver::SqlxMySql],
            Dialect::Postgres => &[Driver::SqlxPostgres],
            Dialect::SQLite => &[Driver::SqlxSqlite],
            Dialect::SqlServer => &[Driver::Tiberius],
        }
    }

    /// Pick the first driver compiled into this build.
    pub fn resolve_driver(&self) -> UnisqlResult<Driver> {
        self.drivers()
            .iter()
            .copied()
            .find(Driver::is_available)
            .ok_or_else(|| {
                UnisqlError::environment(format!(
                    "no usable driver for {} (tried: {})",
                    self,
                    self.drivers()
                        .iter()
                        .map(|d| d.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = UnisqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Dialect::MySQL),
            "postgres" | "postgresql" | "pgsql" => Ok(Dialect::Postgres),
            "sqlite" | "sqlite3" => Ok(Dialect::SQLite),
            "mssql" | "sqlserver" | "sqlsrv" => Ok(Dialect::SqlServer),
            other => Err(UnisqlError::configuration(format!(
                "unknown dialect '{other}'. Expected: mysql, postgres, sqlite, or mssql"
            ))),
        }
    }
}

/// Native client library backing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    SqlxMySql,
    SqlxPostgres,
    SqlxSqlite,
    Tiberius,
}

impl Driver {
    pub fn name(&self) -> &'static str {
        match self {
            Driver::SqlxMySql => "sqlx-mysql",
            Driver::SqlxPostgres => "sqlx-postgres",
            Driver::SqlxSqlite => "sqlx-sqlite",
            Driver::Tiberius => "tiberius",
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            Driver::SqlxMySql | Driver::SqlxPostgres | Driver::SqlxSqlite => true,
            Driver::Tiberius => cfg!(feature = "mssql"),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
