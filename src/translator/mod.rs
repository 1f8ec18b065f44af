//! Canonical SQL to dialect SQL.
//!
//! Translation runs in fixed steps: substitution rules over raw SQL runs,
//! then the temporal pseudo-functions, then `LIMIT` emulation, then
//! `CREATE TABLE` restructuring. Quoted literals are never touched.
//!
//! # Example
//!
//! ```rust,ignore
//! use unisql::prelude::*;
//!
//! let stmt = translate("SELECT * FROM t WHERE flag = TRUE LIMIT 5", Dialect::SqlServer)?;
//! assert_eq!(stmt.translated(), "SELECT TOP 5 * FROM t WHERE flag = 1");
//! ```

mod create_table;
mod limit;
mod rules;
mod temporal;

pub use create_table::{parent_trigger_names, TRIGGER_PREFIX};
pub use limit::ROW_NUMBER_COLUMN;
pub use rules::{rules, Rule, RuleSet};

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::Dialect;
use crate::error::UnisqlResult;
use crate::tokenizer::{map_quoted_runs, split_statements, standard_literal};

static BEGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*BEGIN(\s+TRANSACTION)?\s*;?\s*$").expect("valid regex"));
static COMMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*COMMIT(\s+TRANSACTION)?\s*;?\s*$").expect("valid regex"));
static ROLLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*ROLLBACK(\s+TRANSACTION)?\s*;?\s*$").expect("valid regex"));

static CREATE_TABLE_AS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^\s*CREATE\s+(?:TEMP(?:ORARY)?\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|[\w$]+)\.)?(?:"[^"]+"|`[^`]+`|\[[^\]]+\]|[\w$]+)\s+AS\b"#,
    )
    .expect("valid regex")
});

/// What a statement does, as far as execution bookkeeping cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    AlterTable,
    DropTable,
    Begin,
    Commit,
    Rollback,
    Other,
}

impl StatementKind {
    /// Classify a statement by its leading keywords.
    pub fn of(sql: &str) -> Self {
        if BEGIN.is_match(sql) {
            return StatementKind::Begin;
        }
        if COMMIT.is_match(sql) {
            return StatementKind::Commit;
        }
        if ROLLBACK.is_match(sql) {
            return StatementKind::Rollback;
        }
        let mut words = sql.split_whitespace().map(|w| w.to_ascii_uppercase());
        let first = words.next().unwrap_or_default();
        let first = first.trim_start_matches('(');
        let second = words.next().unwrap_or_default();
        let third = words.next().unwrap_or_default();
        match first {
            "SELECT" | "WITH" | "SHOW" | "PRAGMA" | "EXPLAIN" | "VALUES" => StatementKind::Select,
            "INSERT" | "REPLACE" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            "CREATE" if second == "TABLE" || third == "TABLE" => StatementKind::CreateTable,
            "ALTER" if second == "TABLE" => StatementKind::AlterTable,
            "DROP" if second == "TABLE" => StatementKind::DropTable,
            _ => StatementKind::Other,
        }
    }

    /// Whether executing this statement can change table metadata.
    pub fn changes_schema(&self) -> bool {
        matches!(
            self,
            StatementKind::CreateTable | StatementKind::AlterTable | StatementKind::DropTable
        )
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback
        )
    }
}

/// A statement translated for one dialect.
///
/// Immutable once built. `follow_ups` are extra statements that must run
/// right after the main one, such as the triggers enforcing foreign keys on
/// SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    original: String,
    translated: String,
    follow_ups: Vec<String>,
    dialect: Dialect,
    kind: StatementKind,
}

impl Statement {
    /// A statement that runs exactly as written.
    pub fn verbatim(sql: impl Into<String>, dialect: Dialect) -> Self {
        let sql = sql.into();
        Self {
            kind: StatementKind::of(&sql),
            translated: sql.clone(),
            original: sql,
            follow_ups: Vec::new(),
            dialect,
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn translated(&self) -> &str {
        &self.translated
    }

    pub fn follow_ups(&self) -> &[String] {
        &self.follow_ups
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.translated)?;
        for extra in &self.follow_ups {
            write!(f, ";\n{extra}")?;
        }
        Ok(())
    }
}

/// Translates canonical SQL for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct Translator {
    dialect: Dialect,
}

impl Translator {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Translate one statement.
    pub fn translate(&self, sql: &str) -> UnisqlResult<Statement> {
        let original = sql.trim();
        let original = original.strip_suffix(';').unwrap_or(original).trim_end();
        let kind = StatementKind::of(original);
        let dialect = self.dialect;

        if kind == StatementKind::Begin {
            let translated = match dialect {
                Dialect::SqlServer => "BEGIN TRANSACTION",
                _ => "BEGIN",
            };
            return Ok(self.build(original, translated.to_string(), Vec::new(), kind));
        }

        // `CREATE TABLE t AS SELECT ...` has no column definitions to restructure.
        let ddl = match kind {
            StatementKind::CreateTable => !CREATE_TABLE_AS.is_match(original),
            StatementKind::AlterTable => true,
            _ => false,
        };
        let mut sql = rules(dialect).apply(original, ddl);
        sql = temporal::rewrite(&sql, dialect)?;

        if kind == StatementKind::Select && !dialect.supports_limit_offset() {
            sql = limit::rewrite(&sql)?;
        }

        let mut follow_ups = Vec::new();
        if kind == StatementKind::CreateTable && ddl {
            match dialect {
                Dialect::SQLite => {
                    let (table, triggers) = create_table::sqlite(&sql)?;
                    sql = table;
                    follow_ups = triggers;
                }
                Dialect::MySQL => sql = create_table::mysql(&sql)?,
                Dialect::Postgres | Dialect::SqlServer => {}
            }
        }

        if !dialect.has_backslash_escapes() {
            sql = map_quoted_runs(&sql, standard_literal);
            for follow_up in &mut follow_ups {
                *follow_up = map_quoted_runs(follow_up, standard_literal);
            }
        }

        let stmt = self.build(original, sql, follow_ups, kind);
        tracing::debug!(dialect = %dialect, original = stmt.original(), translated = stmt.translated(), "translated statement");
        Ok(stmt)
    }

    /// Split on top-level `;` and translate each statement.
    pub fn translate_all(&self, sql: &str) -> UnisqlResult<Vec<Statement>> {
        split_statements(sql)
            .iter()
            .map(|stmt| self.translate(stmt))
            .collect()
    }

    fn build(&self, original: &str, translated: String, follow_ups: Vec<String>, kind: StatementKind) -> Statement {
        Statement {
            original: original.to_string(),
            translated,
            follow_ups,
            dialect: self.dialect,
            kind,
        }
    }
}

/// Translate one canonical statement for `dialect`.
pub fn translate(sql: &str, dialect: Dialect) -> UnisqlResult<Statement> {
    Translator::new(dialect).translate(sql)
}
