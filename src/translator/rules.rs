//! Per-dialect substitution rules.
//!
//! Rules are plain data: an ordered list of pattern -> replacement pairs,
//! applied to raw SQL runs only (never inside quoted literals). Expression
//! rules apply to every statement; type rules only to table definitions.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::Dialect;
use crate::tokenizer::map_sql_runs;

/// One substitution.
#[derive(Debug)]
pub struct Rule {
    pub pattern: Regex,
    pub replacement: &'static str,
}

impl Rule {
    fn new(pattern: &str, replacement: &'static str) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("valid rule pattern"),
            replacement,
        }
    }
}

/// The rules of one dialect.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub expressions: Vec<Rule>,
    pub types: Vec<Rule>,
}

impl RuleSet {
    /// Apply expression rules, plus type rules when `ddl` is set.
    pub fn apply(&self, sql: &str, ddl: bool) -> String {
        map_sql_runs(sql, |run| {
            let mut out = run.to_string();
            let rules = self
                .expressions
                .iter()
                .chain(self.types.iter().filter(|_| ddl));
            for rule in rules {
                if rule.pattern.is_match(&out) {
                    out = rule.pattern.replace_all(&out, rule.replacement).into_owned();
                }
            }
            out
        })
    }
}

static MYSQL: Lazy<RuleSet> = Lazy::new(|| RuleSet {
    expressions: vec![Rule::new(r"(?i)\brandom\s*\(", "RAND(")],
    types: vec![
        Rule::new(r"(?i)\bblob\b", "LONGBLOB"),
        Rule::new(r"(?i)\btext\b", "MEDIUMTEXT"),
        Rule::new(r"(?i)\btimestamp\b", "DATETIME"),
        Rule::new(r"(?i)\bfloat\b", "DOUBLE"),
        Rule::new(r"(?i)\bAUTOINCREMENT\b", "AUTO_INCREMENT"),
    ],
});

static POSTGRES: Lazy<RuleSet> = Lazy::new(|| RuleSet {
    expressions: vec![Rule::new(r"(?i)\bLIKE\b", "ILIKE")],
    types: vec![
        Rule::new(r"(?i)\bblob\b", "BYTEA"),
        Rule::new(r"(?i)\bfloat\b", "DOUBLE PRECISION"),
        Rule::new(r"(?i)\bbigint\s+AUTOINCREMENT\b", "BIGSERIAL"),
        Rule::new(r"(?i)\binteger\s+AUTOINCREMENT\b", "SERIAL"),
        Rule::new(r"(?i)\s*\bAUTOINCREMENT\b", ""),
    ],
});

static SQLITE: Lazy<RuleSet> = Lazy::new(|| RuleSet {
    expressions: vec![
        Rule::new(r"(?i)\bTRUE\b", "1"),
        Rule::new(r"(?i)\bFALSE\b", "0"),
    ],
    types: Vec::new(),
});

static MSSQL: Lazy<RuleSet> = Lazy::new(|| RuleSet {
    expressions: vec![
        Rule::new(r"(?i)\bTRUE\b", "1"),
        Rule::new(r"(?i)\bFALSE\b", "0"),
        Rule::new(r"(?i)\brandom\s*\(", "RAND("),
        Rule::new(r"(?i)\blength\s*\(", "LEN("),
        Rule::new(r"(?i)\bsubstr\s*\(", "SUBSTRING("),
        Rule::new(r"\|\|", "+"),
    ],
    types: vec![
        Rule::new(r"(?i)\bboolean\b", "BIT"),
        Rule::new(r"(?i)\btext\b", "NVARCHAR(MAX)"),
        Rule::new(r"(?i)\bvarchar\b", "NVARCHAR"),
        Rule::new(r"(?i)\bchar\b", "NCHAR"),
        Rule::new(r"(?i)\bblob\b", "VARBINARY(MAX)"),
        Rule::new(r"(?i)\btimestamp\b", "DATETIME2"),
        Rule::new(r"(?i)\bAUTOINCREMENT\b", "IDENTITY(1,1)"),
        Rule::new(r"(?i)\bON\s+(DELETE|UPDATE)\s+RESTRICT\b", "ON $1 NO ACTION"),
    ],
});

/// The rule set of a dialect.
pub fn rules(dialect: Dialect) -> &'static RuleSet {
    match dialect {
        Dialect::MySQL => &MYSQL,
        Dialect::Postgres => &POSTGRES,
        Dialect::SQLite => &SQLITE,
        Dialect::SqlServer => &MSSQL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rules_skip_literals() {
        for dialect in Dialect::ALL {
            let sql = "SELECT 'TRUE || random( LIKE text' || name FROM t WHERE a LIKE 'b'";
            let out = rules(dialect).apply(sql, true);
            assert!(out.contains("'TRUE || random( LIKE text'"), "{dialect}: {out}");
            assert!(out.contains("'b'"), "{dialect}: {out}");
        }
    }

    #[test]
    fn test_type_rules_only_for_ddl() {
        let sql = "SELECT CAST(x AS text) FROM t";
        assert_eq!(rules(Dialect::SqlServer).apply(sql, false), sql);
        assert_eq!(
            rules(Dialect::SqlServer).apply(sql, true),
            "SELECT CAST(x AS NVARCHAR(MAX)) FROM t"
        );
    }

    #[test]
    fn test_rules_are_idempotent_on_output() {
        let sql = "CREATE TABLE t (a text, b varchar(5), c boolean, d blob, e timestamp, f float)";
        for dialect in Dialect::ALL {
            let once = rules(dialect).apply(sql, true);
            assert_eq!(rules(dialect).apply(&once, true), once, "{dialect}");
        }
    }

    #[test]
    fn test_mssql_restrict() {
        assert_eq!(
            rules(Dialect::SqlServer).apply("REFERENCES a(id) ON DELETE RESTRICT", true),
            "REFERENCES a(id) ON DELETE NO ACTION"
        );
    }
}
