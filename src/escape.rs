//! Canonical values to SQL literals and back.
//!
//! Every `escape_*` turns `None` into `NULL`. The `unescape_*` functions
//! accept either a literal produced by the matching `escape_*` or the raw
//! value a backend returns, so `unescape_x(&escape_x(v)) == v`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::dialect::Dialect;
use crate::error::{UnisqlError, UnisqlResult};
use crate::tokenizer::{map_quoted_runs, standard_literal};
use crate::value::{hex, Value};

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIME_FORMAT: &str = "%H:%M:%S";
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TIME_INPUTS: &[&str] = &["%H:%M:%S%.f", "%H:%M:%S", "%H:%M", "%I:%M:%S %p", "%I:%M %p"];
const TIMESTAMP_INPUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Literal conversion for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct Escaper {
    dialect: Dialect,
}

impl Escaper {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Quote text as a canonical literal, ready for translation.
    ///
    /// Backslashes are doubled, so a value ending in `\\` cannot escape
    /// the closing quote.
    pub fn escape_string<'a>(&self, value: impl Into<Option<&'a str>>) -> String {
        let Some(value) = value.into() else {
            return "NULL".to_string();
        };
        let escaped = value.replace('\\', "\\\\").replace('\'', "''");
        if self.dialect == Dialect::SqlServer && !value.is_ascii() {
            return format!("N'{escaped}'");
        }
        format!("'{escaped}'")
    }

    /// Quote text in the backend's own literal syntax, for SQL that is
    /// sent without translation.
    pub fn escape_native_string(&self, value: &str) -> String {
        let literal = self.escape_string(value);
        if self.dialect.has_backslash_escapes() {
            literal
        } else {
            map_quoted_runs(&literal, standard_literal)
        }
    }

    pub fn unescape_string(&self, literal: &str) -> String {
        let trimmed = literal.trim();
        let quoted = trimmed.strip_prefix('N').filter(|s| s.starts_with('\'')).unwrap_or(trimmed);
        let Some(inner) = quoted
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .filter(|_| quoted.len() >= 2)
        else {
            return literal.to_string();
        };

        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    out.push('\'');
                }
                '\\' if self.dialect == Dialect::MySQL => match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('0') => out.push('\0'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                },
                '\\' if matches!(chars.peek(), Some('\'' | '\\')) => out.extend(chars.next()),
                _ => out.push(c),
            }
        }
        out
    }

    pub fn escape_blob<'a>(&self, value: impl Into<Option<&'a [u8]>>) -> String {
        let Some(bytes) = value.into() else {
            return "NULL".to_string();
        };
        let hex = hex(bytes);
        match self.dialect {
            Dialect::MySQL => format!("x'{hex}'"),
            Dialect::Postgres => format!("decode('{hex}', 'hex')"),
            Dialect::SQLite => format!("X'{hex}'"),
            Dialect::SqlServer => format!("0x{hex}"),
        }
    }

    /// Decode any blob literal form, or PostgreSQL's `\x..` text output.
    pub fn unescape_blob(&self, literal: &str) -> UnisqlResult<Vec<u8>> {
        let text = literal.trim();
        let digits = if let Some(rest) = text.strip_prefix("decode('") {
            rest.strip_suffix("', 'hex')").unwrap_or(rest)
        } else if let Some(rest) = text
            .strip_prefix("x'")
            .or_else(|| text.strip_prefix("X'"))
        {
            rest.strip_suffix('\'').unwrap_or(rest)
        } else if let Some(rest) = text.strip_prefix("0x").or_else(|| text.strip_prefix("\\x")) {
            rest
        } else {
            return Ok(text.as_bytes().to_vec());
        };
        decode_hex(digits)
    }

    pub fn escape_boolean(&self, value: impl Into<Option<bool>>) -> String {
        match (value.into(), self.dialect.has_boolean_literals()) {
            (None, _) => "NULL".to_string(),
            (Some(true), true) => "TRUE".to_string(),
            (Some(false), true) => "FALSE".to_string(),
            (Some(b), false) => (b as i32).to_string(),
        }
    }

    pub fn unescape_boolean(&self, literal: &str) -> UnisqlResult<bool> {
        match strip_quotes(literal).to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "y" | "yes" | "on" => Ok(true),
            "0" | "f" | "false" | "n" | "no" | "off" => Ok(false),
            other => Err(UnisqlError::validation(format!("'{other}' is not a boolean"))),
        }
    }

    pub fn escape_integer(&self, value: impl Into<Option<i64>>) -> String {
        value
            .into()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "NULL".to_string())
    }

    pub fn unescape_integer(&self, literal: &str) -> UnisqlResult<i64> {
        let text = strip_quotes(literal);
        text.parse()
            .map_err(|_| UnisqlError::validation(format!("'{text}' is not an integer")))
    }

    pub fn escape_float(&self, value: impl Into<Option<f64>>) -> UnisqlResult<String> {
        match value.into() {
            None => Ok("NULL".to_string()),
            Some(f) if f.is_finite() => Ok(format!("{f:?}")),
            Some(f) => Err(UnisqlError::validation(format!("{f} has no SQL representation"))),
        }
    }

    pub fn unescape_float(&self, literal: &str) -> UnisqlResult<f64> {
        let text = strip_quotes(literal);
        text.parse()
            .map_err(|_| UnisqlError::validation(format!("'{text}' is not a number")))
    }

    /// `'YYYY-MM-DD'`. Timestamps are accepted and truncated to the date.
    pub fn escape_date<'a>(&self, value: impl Into<Option<&'a str>>) -> UnisqlResult<String> {
        match value.into() {
            None => Ok("NULL".to_string()),
            Some(text) => Ok(format!("'{}'", parse_date(text)?.format(DATE_FORMAT))),
        }
    }

    pub fn unescape_date(&self, literal: &str) -> UnisqlResult<String> {
        Ok(parse_date(strip_quotes(literal))?.format(DATE_FORMAT).to_string())
    }

    /// `'HH:MM:SS'`. Fractional seconds are dropped.
    pub fn escape_time<'a>(&self, value: impl Into<Option<&'a str>>) -> UnisqlResult<String> {
        match value.into() {
            None => Ok("NULL".to_string()),
            Some(text) => Ok(format!("'{}'", parse_time(text)?.format(TIME_FORMAT))),
        }
    }

    pub fn unescape_time(&self, literal: &str) -> UnisqlResult<String> {
        Ok(parse_time(strip_quotes(literal))?.format(TIME_FORMAT).to_string())
    }

    /// `'YYYY-MM-DD HH:MM:SS'`; SQL Server gets the ISO 8601 `T` separator,
    /// the one form it reads the same under every language setting.
    pub fn escape_timestamp<'a>(&self, value: impl Into<Option<&'a str>>) -> UnisqlResult<String> {
        let Some(text) = value.into() else {
            return Ok("NULL".to_string());
        };
        let timestamp = parse_timestamp(text)?;
        let format = match self.dialect {
            Dialect::SqlServer => "%Y-%m-%dT%H:%M:%S",
            _ => TIMESTAMP_FORMAT,
        };
        Ok(format!("'{}'", timestamp.format(format)))
    }

    pub fn unescape_timestamp(&self, literal: &str) -> UnisqlResult<String> {
        Ok(parse_timestamp(strip_quotes(literal))?
            .format(TIMESTAMP_FORMAT)
            .to_string())
    }

    /// Escape a dynamic value by its variant.
    pub fn escape_value(&self, value: &Value) -> UnisqlResult<String> {
        Ok(match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => self.escape_boolean(*b),
            Value::Int(i) => self.escape_integer(*i),
            Value::Float(f) => self.escape_float(*f)?,
            Value::Text(s) => self.escape_string(s.as_str()),
            Value::Blob(b) => self.escape_blob(b.as_slice()),
        })
    }
}

fn strip_quotes(literal: &str) -> &str {
    let text = literal.trim();
    text.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(text)
        .trim()
}

fn decode_hex(digits: &str) -> UnisqlResult<Vec<u8>> {
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return Err(UnisqlError::validation(format!("invalid hex blob '{digits}'")));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| UnisqlError::validation(format!("invalid hex blob '{digits}'")))
        })
        .collect()
}

fn parse_timestamp(text: &str) -> UnisqlResult<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_INPUTS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.naive_local())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| UnisqlError::validation(format!("'{text}' is not a valid timestamp")))
}

fn parse_date(text: &str) -> UnisqlResult<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .ok()
        .or_else(|| parse_timestamp(text).ok().map(|ts| ts.date()))
        .ok_or_else(|| UnisqlError::validation(format!("'{text}' is not a valid date")))
}

fn parse_time(text: &str) -> UnisqlResult<NaiveTime> {
    let text = text.trim();
    TIME_INPUTS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(text, format).ok())
        .ok_or_else(|| UnisqlError::validation(format!("'{text}' is not a valid time")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn all() -> impl Iterator<Item = Escaper> {
        Dialect::ALL.into_iter().map(Escaper::new)
    }

    #[test]
    fn test_null_is_null_everywhere() {
        for e in all() {
            assert_eq!(e.escape_string(None), "NULL");
            assert_eq!(e.escape_blob(None), "NULL");
            assert_eq!(e.escape_boolean(None), "NULL");
            assert_eq!(e.escape_integer(None), "NULL");
            assert_eq!(e.escape_float(None).unwrap(), "NULL");
            assert_eq!(e.escape_date(None).unwrap(), "NULL");
            assert_eq!(e.escape_time(None).unwrap(), "NULL");
            assert_eq!(e.escape_timestamp(None).unwrap(), "NULL");
            assert_eq!(e.escape_value(&Value::Null).unwrap(), "NULL");
        }
    }

    #[test]
    fn test_string_escaping() {
        assert_eq!(Escaper::new(Dialect::Postgres).escape_string("it's"), "'it''s'");
        assert_eq!(Escaper::new(Dialect::MySQL).escape_string("a\\'b"), "'a\\\\''b'");
        assert_eq!(Escaper::new(Dialect::SQLite).escape_string("C:\\"), "'C:\\\\'");
        assert_eq!(Escaper::new(Dialect::SqlServer).escape_string("café"), "N'café'");
        assert_eq!(Escaper::new(Dialect::SqlServer).escape_string("cafe"), "'cafe'");
    }

    #[test]
    fn test_string_round_trip() {
        for e in all() {
            for s in ["", "plain", "it's", "back\\slash", "C:\\", "naïve ''quotes''"] {
                assert_eq!(e.unescape_string(&e.escape_string(s)), s);
            }
        }
    }

    #[test]
    fn test_trailing_backslash_keeps_next_literal_intact() {
        for dialect in Dialect::ALL {
            let e = Escaper::new(dialect);
            let sql = format!("INSERT INTO t (a, b) VALUES ({}, 'TRUE')", e.escape_string("C:\\"));
            let stmt = crate::translator::translate(&sql, dialect).unwrap();
            assert!(stmt.translated().ends_with(", 'TRUE')"), "{dialect}: {}", stmt.translated());
        }
    }

    #[test]
    fn test_native_string() {
        assert_eq!(Escaper::new(Dialect::Postgres).escape_native_string("C:\\ it's"), "'C:\\ it''s'");
        assert_eq!(Escaper::new(Dialect::MySQL).escape_native_string("C:\\"), "'C:\\\\'");
        assert_eq!(Escaper::new(Dialect::SqlServer).escape_native_string("é\\"), "N'é\\'");
    }

    #[test]
    fn test_blob_forms() {
        let bytes: &[u8] = &[0, 1, 0xab, 0xff];
        assert_eq!(Escaper::new(Dialect::MySQL).escape_blob(bytes), "x'0001abff'");
        assert_eq!(Escaper::new(Dialect::SQLite).escape_blob(bytes), "X'0001abff'");
        assert_eq!(Escaper::new(Dialect::SqlServer).escape_blob(bytes), "0x0001abff");
        assert_eq!(
            Escaper::new(Dialect::Postgres).escape_blob(bytes),
            "decode('0001abff', 'hex')"
        );
        for e in all() {
            assert_eq!(e.unescape_blob(&e.escape_blob(bytes)).unwrap(), bytes);
        }
        assert_eq!(
            Escaper::new(Dialect::Postgres).unescape_blob("\\x0001").unwrap(),
            vec![0, 1]
        );
        assert!(Escaper::new(Dialect::MySQL).unescape_blob("x'zz'").is_err());
    }

    #[test]
    fn test_scalar_round_trips() {
        for e in all() {
            for b in [true, false] {
                assert_eq!(e.unescape_boolean(&e.escape_boolean(b)).unwrap(), b);
            }
            for n in [0, -1, i64::MAX, i64::MIN] {
                assert_eq!(e.unescape_integer(&e.escape_integer(n)).unwrap(), n);
            }
            for f in [0.0, -1.5, 1e300, 0.1 + 0.2] {
                assert_eq!(e.unescape_float(&e.escape_float(f).unwrap()).unwrap(), f);
            }
        }
        assert_eq!(Escaper::new(Dialect::SQLite).escape_boolean(true), "1");
        assert_eq!(Escaper::new(Dialect::Postgres).escape_boolean(false), "FALSE");
        assert!(Escaper::new(Dialect::MySQL).escape_float(f64::NAN).is_err());
    }

    #[test]
    fn test_temporal_round_trips() {
        for e in all() {
            let date = "2024-02-29";
            assert_eq!(e.unescape_date(&e.escape_date(date).unwrap()).unwrap(), date);
            let time = "23:59:01";
            assert_eq!(e.unescape_time(&e.escape_time(time).unwrap()).unwrap(), time);
            let ts = "2024-02-29 23:59:01";
            assert_eq!(e.unescape_timestamp(&e.escape_timestamp(ts).unwrap()).unwrap(), ts);
        }
    }

    #[test]
    fn test_temporal_normalization() {
        let e = Escaper::new(Dialect::MySQL);
        assert_eq!(e.escape_date("2024-01-02 10:00:00").unwrap(), "'2024-01-02'");
        assert_eq!(e.escape_time("7:05").unwrap(), "'07:05:00'");
        assert_eq!(e.escape_timestamp("2024-01-02").unwrap(), "'2024-01-02 00:00:00'");
        assert_eq!(
            Escaper::new(Dialect::SqlServer)
                .escape_timestamp("2024-01-02 03:04:05")
                .unwrap(),
            "'2024-01-02T03:04:05'"
        );
    }

    #[test]
    fn test_unparsable_temporal_is_validation_error() {
        let e = Escaper::new(Dialect::Postgres);
        assert!(matches!(e.escape_date("2024-13-01"), Err(UnisqlError::Validation(_))));
        assert!(matches!(e.escape_time("25:00"), Err(UnisqlError::Validation(_))));
        assert!(matches!(e.escape_timestamp("yesterday"), Err(UnisqlError::Validation(_))));
    }
}
