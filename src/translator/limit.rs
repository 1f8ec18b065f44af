//! `LIMIT n [OFFSET m]` emulation for SQL Server.
//!
//! Without an offset the limit becomes `SELECT TOP n`. With one, the query
//! is wrapped in a row-numbering subquery:
//!
//! ```text
//! SELECT * FROM (
//!     SELECT <columns>, ROW_NUMBER() OVER (ORDER BY <order>) AS unisql__row_number
//!     FROM ...
//! ) AS unisql__limited
//! WHERE unisql__row_number > m AND unisql__row_number <= m + n
//! ORDER BY unisql__row_number
//! ```
//!
//! The synthetic column is removed from delivered rows by the result
//! iterator. A query that already selects a column of that name is not
//! supported.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{UnisqlError, UnisqlResult};
use crate::tokenizer::{find_top_level_keyword, mask_quoted};

/// Name of the synthetic ordinal column.
pub const ROW_NUMBER_COLUMN: &str = "unisql__row_number";

const SUBQUERY_ALIAS: &str = "unisql__limited";

static LIMIT_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^LIMIT\s+(\S+)(?:\s+OFFSET\s+(\S+))?\s*$").expect("valid regex")
});

static SELECT_HEAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*SELECT(\s+DISTINCT)?\s+").expect("valid regex"));

fn parse_count(sql: &str, text: &str, what: &str) -> UnisqlResult<u64> {
    text.parse()
        .map_err(|_| UnisqlError::parse(sql, format!("{what} must be a non-negative integer, got '{text}'")))
}

/// Rewrite a top-level `LIMIT` of a SELECT; other statements pass through.
pub fn rewrite(sql: &str) -> UnisqlResult<String> {
    let masked = mask_quoted(sql);
    let Some(head) = SELECT_HEAD.captures(&masked) else {
        return Ok(sql.to_string());
    };

    // The last top-level LIMIT is the statement's own.
    let mut limit_at = None;
    let mut from = 0;
    while let Some((start, end)) = find_top_level_keyword(&masked, "LIMIT", from) {
        limit_at = Some(start);
        from = end;
    }
    let Some(limit_at) = limit_at else {
        return Ok(sql.to_string());
    };

    let clause = sql[limit_at..].trim();
    let caps = LIMIT_CLAUSE
        .captures(clause)
        .ok_or_else(|| UnisqlError::parse(sql, "LIMIT must be the last clause: LIMIT n [OFFSET m]"))?;
    let limit = parse_count(sql, &caps[1], "LIMIT")?;
    let offset = caps
        .get(2)
        .map(|m| parse_count(sql, m.as_str(), "OFFSET"))
        .transpose()?
        .unwrap_or(0);

    let body = sql[..limit_at].trim_end();
    let head_end = head.get(0).map(|m| m.end()).unwrap_or(0);
    let distinct = head.get(1).is_some();

    // Past BIGINT, a limit means "every row"; MySQL spells it 2^64 - 1.
    let bounded = |n: u64| Some(n).filter(|&n| n <= i64::MAX as u64);

    if offset == 0 {
        if bounded(limit).is_none() {
            return Ok(body.to_string());
        }
        let keyword = if distinct { "SELECT DISTINCT" } else { "SELECT" };
        return Ok(format!("{keyword} TOP {limit} {}", &body[head_end..]));
    }

    let body_masked = &masked[..body.len()];
    let from_at = find_top_level_keyword(body_masked, "FROM", head_end)
        .map(|(s, _)| s)
        .ok_or_else(|| UnisqlError::parse(sql, "LIMIT with OFFSET requires a FROM clause"))?;
    let (inner, order) = match find_top_level_keyword(body_masked, "ORDER BY", from_at) {
        Some((s, e)) => (body[..s].trim_end(), body[e..].trim()),
        None => (body, "(SELECT 1)"),
    };

    let columns = inner[head_end..from_at].trim_end();
    let rest = &inner[from_at..];
    let keyword = if distinct { "SELECT DISTINCT" } else { "SELECT" };

    let window = match offset.checked_add(limit).and_then(bounded) {
        Some(end) => format!("{ROW_NUMBER_COLUMN} > {offset} AND {ROW_NUMBER_COLUMN} <= {end}"),
        None => format!("{ROW_NUMBER_COLUMN} > {offset}"),
    };
    Ok(format!(
        "SELECT * FROM ({keyword} {columns}, ROW_NUMBER() OVER (ORDER BY {order}) AS {ROW_NUMBER_COLUMN} {rest}) AS {SUBQUERY_ALIAS} \
         WHERE {window} ORDER BY {ROW_NUMBER_COLUMN}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_limit_becomes_top() {
        assert_eq!(
            rewrite("SELECT id, name FROM users ORDER BY name LIMIT 5").unwrap(),
            "SELECT TOP 5 id, name FROM users ORDER BY name"
        );
        assert_eq!(
            rewrite("select distinct name from users limit 3 offset 0").unwrap(),
            "SELECT DISTINCT TOP 3 name from users"
        );
    }

    #[test]
    fn test_offset_uses_row_number() {
        assert_eq!(
            rewrite("SELECT * FROM t ORDER BY created DESC, id LIMIT 5 OFFSET 10").unwrap(),
            "SELECT * FROM (SELECT *, ROW_NUMBER() OVER (ORDER BY created DESC, id) AS unisql__row_number FROM t) AS unisql__limited \
             WHERE unisql__row_number > 10 AND unisql__row_number <= 15 ORDER BY unisql__row_number"
        );
    }

    #[test]
    fn test_unbounded_limit() {
        assert_eq!(
            rewrite("SELECT * FROM t ORDER BY id LIMIT 18446744073709551615 OFFSET 5").unwrap(),
            "SELECT * FROM (SELECT *, ROW_NUMBER() OVER (ORDER BY id) AS unisql__row_number FROM t) AS unisql__limited \
             WHERE unisql__row_number > 5 ORDER BY unisql__row_number"
        );
        assert_eq!(
            rewrite("SELECT * FROM t ORDER BY id LIMIT 18446744073709551615").unwrap(),
            "SELECT * FROM t ORDER BY id"
        );
        assert!(rewrite("SELECT * FROM t LIMIT 9223372036854775807 OFFSET 1")
            .unwrap()
            .contains("unisql__row_number > 1 ORDER BY"));
    }

    #[test]
    fn test_offset_without_order() {
        let sql = rewrite("SELECT a FROM t WHERE b = 'LIMIT 1' LIMIT 2 OFFSET 4").unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT a, ROW_NUMBER() OVER (ORDER BY (SELECT 1)) AS unisql__row_number FROM t WHERE b = 'LIMIT 1') AS unisql__limited \
             WHERE unisql__row_number > 4 AND unisql__row_number <= 6 ORDER BY unisql__row_number"
        );
    }

    #[test]
    fn test_subquery_limit_untouched() {
        let sql = "SELECT * FROM t WHERE id IN (SELECT id FROM u LIMIT 1)";
        assert_eq!(rewrite(sql).unwrap(), sql);
    }

    #[test]
    fn test_non_integer_limit() {
        assert!(matches!(
            rewrite("SELECT * FROM t LIMIT ten"),
            Err(UnisqlError::Parse { .. })
        ));
    }

    #[test]
    fn test_non_select_passes_through() {
        let sql = "DELETE FROM t WHERE id = 1";
        assert_eq!(rewrite(sql).unwrap(), sql);
    }
}
