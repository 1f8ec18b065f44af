//! Rewriting of the `diff_seconds(a, b)` and `add_interval(expr, 'spec')`
//! pseudo-functions into each dialect's date arithmetic.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::Dialect;
use crate::error::{UnisqlError, UnisqlResult};
use crate::tokenizer::{mask_quoted, matching_paren, split_top_level, unquote};

static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(diff_seconds|add_interval)\s*\(").expect("valid regex"));

static INTERVAL_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([+-]?\d+)\s*(second|minute|hour|day|week|month|year)s?$").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Unit {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "second" => Some(Unit::Second),
            "minute" => Some(Unit::Minute),
            "hour" => Some(Unit::Hour),
            "day" => Some(Unit::Day),
            "week" => Some(Unit::Week),
            "month" => Some(Unit::Month),
            "year" => Some(Unit::Year),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Unit::Second => "second",
            Unit::Minute => "minute",
            Unit::Hour => "hour",
            Unit::Day => "day",
            Unit::Week => "week",
            Unit::Month => "month",
            Unit::Year => "year",
        }
    }
}

/// Parse `'+1 year -2 days'` into signed amounts.
fn parse_interval(spec: &str) -> Option<Vec<(i64, Unit)>> {
    let words: Vec<&str> = spec
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return None;
    }

    let mut parts = Vec::new();
    let mut i = 0;
    while i < words.len() {
        // Amount and unit may be written together ("3days") or apart.
        let (candidate, used) = if INTERVAL_PART.is_match(words[i]) {
            (words[i].to_string(), 1)
        } else if i + 1 < words.len() {
            (format!("{} {}", words[i], words[i + 1]), 2)
        } else {
            return None;
        };
        let caps = INTERVAL_PART.captures(&candidate)?;
        let amount: i64 = caps[1].parse().ok()?;
        parts.push((amount, Unit::parse(&caps[2])?));
        i += used;
    }
    Some(parts)
}

fn diff_seconds(dialect: Dialect, a: &str, b: &str) -> String {
    match dialect {
        Dialect::MySQL => format!("TIMESTAMPDIFF(SECOND, {a}, {b})"),
        Dialect::Postgres => {
            format!("EXTRACT(EPOCH FROM (CAST({b} AS TIMESTAMP) - CAST({a} AS TIMESTAMP)))")
        }
        Dialect::SQLite => format!("(strftime('%s', {b}) - strftime('%s', {a}))"),
        Dialect::SqlServer => format!("DATEDIFF(second, {a}, {b})"),
    }
}

fn add_interval(dialect: Dialect, expr: &str, parts: &[(i64, Unit)]) -> String {
    match dialect {
        Dialect::MySQL => parts.iter().fold(expr.to_string(), |acc, (n, unit)| {
            format!("DATE_ADD({acc}, INTERVAL {n} {})", unit.name().to_uppercase())
        }),
        Dialect::Postgres => {
            let spec: Vec<String> = parts
                .iter()
                .map(|(n, unit)| format!("{n} {}", unit.name()))
                .collect();
            format!("(CAST({expr} AS TIMESTAMP) + INTERVAL '{}')", spec.join(" "))
        }
        Dialect::SQLite => {
            let modifiers: Vec<String> = parts
                .iter()
                .map(|(n, unit)| match unit {
                    Unit::Week => format!("'{:+} days'", n * 7),
                    _ => format!("'{:+} {}s'", n, unit.name()),
                })
                .collect();
            format!("datetime({expr}, {})", modifiers.join(", "))
        }
        Dialect::SqlServer => parts.iter().fold(expr.to_string(), |acc, (n, unit)| {
            format!("DATEADD({}, {n}, {acc})", unit.name())
        }),
    }
}

/// Rewrite every pseudo-function call, innermost first.
pub fn rewrite(sql: &str, dialect: Dialect) -> UnisqlResult<String> {
    let mut sql = sql.to_string();

    loop {
        let masked = mask_quoted(&sql);
        let Some(caps) = CALL.captures_iter(&masked).last() else {
            return Ok(sql);
        };
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        let name = caps[1].to_ascii_lowercase();
        let open = whole.end - 1;
        let close = matching_paren(&masked, open).ok_or_else(|| {
            UnisqlError::parse(&sql, format!("unbalanced parentheses in {name}()"))
        })?;

        let args: Vec<&str> = split_top_level(&sql[open + 1..close], ',')
            .into_iter()
            .map(str::trim)
            .collect();
        if args.len() != 2 || args.iter().any(|a| a.is_empty()) {
            return Err(UnisqlError::parse(
                &sql,
                format!("{name}() takes exactly two arguments"),
            ));
        }

        let replacement = if name == "diff_seconds" {
            diff_seconds(dialect, args[0], args[1])
        } else {
            let spec = args[1];
            if !(spec.starts_with('\'') && spec.ends_with('\'') && spec.len() >= 2) {
                return Err(UnisqlError::parse(
                    &sql,
                    "add_interval() expects a quoted interval such as '+1 day'",
                ));
            }
            let parts = parse_interval(&unquote(spec)).ok_or_else(|| {
                UnisqlError::parse(&sql, format!("invalid interval {spec}"))
            })?;
            add_interval(dialect, args[0], &parts)
        };

        sql.replace_range(whole.start..=close, &replacement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_diff_seconds_per_dialect() {
        let sql = "SELECT diff_seconds(created_at, '2024-01-01 00:00:00') FROM t";
        assert_eq!(
            rewrite(sql, Dialect::MySQL).unwrap(),
            "SELECT TIMESTAMPDIFF(SECOND, created_at, '2024-01-01 00:00:00') FROM t"
        );
        assert_eq!(
            rewrite(sql, Dialect::Postgres).unwrap(),
            "SELECT EXTRACT(EPOCH FROM (CAST('2024-01-01 00:00:00' AS TIMESTAMP) - CAST(created_at AS TIMESTAMP))) FROM t"
        );
        assert_eq!(
            rewrite(sql, Dialect::SQLite).unwrap(),
            "SELECT (strftime('%s', '2024-01-01 00:00:00') - strftime('%s', created_at)) FROM t"
        );
        assert_eq!(
            rewrite(sql, Dialect::SqlServer).unwrap(),
            "SELECT DATEDIFF(second, created_at, '2024-01-01 00:00:00') FROM t"
        );
    }

    #[test]
    fn test_add_interval_per_dialect() {
        let sql = "SELECT add_interval(d, '+1 year -2 weeks') FROM t";
        assert_eq!(
            rewrite(sql, Dialect::MySQL).unwrap(),
            "SELECT DATE_ADD(DATE_ADD(d, INTERVAL 1 YEAR), INTERVAL -2 WEEK) FROM t"
        );
        assert_eq!(
            rewrite(sql, Dialect::Postgres).unwrap(),
            "SELECT (CAST(d AS TIMESTAMP) + INTERVAL '1 year -2 week') FROM t"
        );
        assert_eq!(
            rewrite(sql, Dialect::SQLite).unwrap(),
            "SELECT datetime(d, '+1 years', '-14 days') FROM t"
        );
        assert_eq!(
            rewrite(sql, Dialect::SqlServer).unwrap(),
            "SELECT DATEADD(week, -2, DATEADD(year, 1, d)) FROM t"
        );
    }

    #[test]
    fn test_nested_calls() {
        let sql = "SELECT diff_seconds(a, add_interval(a, '3 days'))";
        assert_eq!(
            rewrite(sql, Dialect::SqlServer).unwrap(),
            "SELECT DATEDIFF(second, a, DATEADD(day, 3, a))"
        );
    }

    #[test]
    fn test_call_inside_literal_untouched() {
        let sql = "SELECT 'diff_seconds(a, b)'";
        assert_eq!(rewrite(sql, Dialect::MySQL).unwrap(), sql);
    }

    #[test]
    fn test_bad_interval() {
        assert!(matches!(
            rewrite("SELECT add_interval(d, 'soon')", Dialect::MySQL),
            Err(UnisqlError::Parse { .. })
        ));
        assert!(matches!(
            rewrite("SELECT add_interval(d, days)", Dialect::MySQL),
            Err(UnisqlError::Parse { .. })
        ));
        assert!(matches!(
            rewrite("SELECT diff_seconds(a)", Dialect::MySQL),
            Err(UnisqlError::Parse { .. })
        ));
    }
}
