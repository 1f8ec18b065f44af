//! Per-dialect metadata queries.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{column_info, normalize_default};
use super::{from_create_table, ColumnInfo, ColumnType, FkAction, ForeignKey, KeySet};
use crate::connection::Connection;
use crate::ddl::{check_valid_values, literal_list, CreateIndex, CreateTable};
use crate::dialect::Dialect;
use crate::error::{UnisqlError, UnisqlResult};
use crate::result::Row;
use crate::tokenizer::map_sql_runs;
use crate::value::Value;

/// MySQL charset introducers in front of literals: `_utf8mb4'draft'`.
static CHARSET_INTRODUCER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b_[a-z0-9]+$").expect("valid regex"));

/// `CHECK ((status)::text = ANY ((ARRAY['a'::character varying, ...])::text[]))`
static PG_ANY_ARRAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^\s*CHECK\s*\(\s*\(*\s*"?([\w$]+)"?\s*\)?(?:::[\w ]+)?\s*=\s*ANY\s*\(\s*\(?\s*ARRAY\[(.*?)\]"#)
        .expect("valid regex")
});

pub(super) fn tables(conn: &mut Connection) -> UnisqlResult<Vec<String>> {
    let sql = match conn.dialect() {
        Dialect::MySQL => "SHOW FULL TABLES WHERE Table_type = 'BASE TABLE'",
        Dialect::Postgres => {
            "SELECT table_name::text AS name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             ORDER BY table_name"
        }
        Dialect::SQLite => {
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        Dialect::SqlServer => {
            "SELECT TABLE_NAME AS name FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA = SCHEMA_NAME() \
             ORDER BY TABLE_NAME"
        }
    };
    Ok(conn
        .query_rows(sql)?
        .iter()
        .filter_map(|row| row.values().next().and_then(as_text))
        .collect())
}

pub(super) fn table(
    conn: &mut Connection,
    table: &str,
) -> UnisqlResult<(IndexMap<String, ColumnInfo>, KeySet)> {
    let fetched = match conn.dialect() {
        Dialect::MySQL => mysql(conn, table)?,
        Dialect::SQLite => sqlite(conn, table)?,
        Dialect::Postgres | Dialect::SqlServer => catalog(conn, table)?,
    };
    tracing::debug!(
        table,
        columns = fetched.0.len(),
        foreign_keys = fetched.1.foreign.len(),
        "fetched table metadata"
    );
    Ok(fetched)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(text) => Some(text.clone()),
        Value::Blob(bytes) => String::from_utf8(bytes.clone()).ok(),
        other => Some(other.to_string()),
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(as_text)
}

fn int(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

fn missing(table: &str) -> UnisqlError {
    UnisqlError::programmer(format!("table '{table}' does not exist"))
}

fn mysql(conn: &mut Connection, table: &str) -> UnisqlResult<(IndexMap<String, ColumnInfo>, KeySet)> {
    let sql = format!("SHOW CREATE TABLE {}", Dialect::MySQL.quote_identifier(table));
    let rows = conn.query_rows(&sql)?;
    let ddl = rows
        .first()
        .and_then(|row| text(row, "Create Table").or_else(|| row.values().nth(1).and_then(as_text)))
        .ok_or_else(|| missing(table))?;
    let ddl = map_sql_runs(&ddl, |run| CHARSET_INTRODUCER.replace(run, "").into_owned());
    Ok(from_create_table(Dialect::MySQL, &CreateTable::parse(&ddl)?))
}

fn sqlite_ddl(conn: &mut Connection, table: &str) -> UnisqlResult<Option<String>> {
    let sql = format!(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = {}",
        conn.escaper().escape_native_string(table)
    );
    Ok(conn.query_rows(&sql)?.first().and_then(|row| text(row, "sql")))
}

fn sqlite(conn: &mut Connection, table: &str) -> UnisqlResult<(IndexMap<String, ColumnInfo>, KeySet)> {
    let ddl = sqlite_ddl(conn, table)?.ok_or_else(|| missing(table))?;
    let (columns, mut keys) = from_create_table(Dialect::SQLite, &CreateTable::parse(&ddl)?);

    let sql = format!(
        "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = {} AND sql IS NOT NULL",
        conn.escaper().escape_native_string(table)
    );
    for row in conn.query_rows(&sql)? {
        let Some(index) = text(&row, "sql").as_deref().and_then(CreateIndex::parse) else {
            continue;
        };
        if index.unique && !keys.unique.contains(&index.columns) {
            keys.unique.push(index.columns);
        }
    }

    // `REFERENCES parent` without a column means the parent's primary key.
    for fk in keys.foreign.iter_mut().filter(|fk| fk.foreign_column.is_empty()) {
        let primary = match sqlite_ddl(conn, &fk.foreign_table)? {
            Some(ddl) => CreateTable::parse(&ddl)?.primary_key(),
            None => Vec::new(),
        };
        fk.foreign_column = match primary.as_slice() {
            [single] => single.clone(),
            _ => "rowid".to_string(),
        };
    }
    Ok((columns, keys))
}

/// Catalog queries for the dialects that answer through
/// `information_schema`.
struct CatalogQueries {
    columns: String,
    constraints: String,
    foreign_keys: String,
    checks: String,
}

fn catalog_queries(dialect: Dialect, table: &str) -> CatalogQueries {
    if dialect == Dialect::Postgres {
        CatalogQueries {
            columns: format!(
                "SELECT column_name::text AS name, data_type::text AS data_type, udt_name::text AS udt_name, \
                 is_nullable::text AS is_nullable, column_default::text AS column_default, \
                 character_maximum_length::int AS max_length, numeric_scale::int AS scale, \
                 is_identity::text AS is_identity \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = {table} \
                 ORDER BY ordinal_position"
            ),
            constraints: format!(
                "SELECT tc.constraint_type::text AS kind, tc.constraint_name::text AS name, \
                 kcu.column_name::text AS column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_schema = tc.constraint_schema \
                  AND kcu.constraint_name = tc.constraint_name \
                  AND kcu.table_name = tc.table_name \
                 WHERE tc.table_schema = current_schema() AND tc.table_name = {table} \
                   AND tc.constraint_type IN ('PRIMARY KEY', 'UNIQUE') \
                 ORDER BY tc.constraint_name, kcu.ordinal_position"
            ),
            foreign_keys: format!(
                "SELECT kcu.column_name::text AS column_name, ccu.table_name::text AS foreign_table, \
                 ccu.column_name::text AS foreign_column, rc.delete_rule::text AS on_delete, \
                 rc.update_rule::text AS on_update \
                 FROM information_schema.referential_constraints rc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_schema = rc.constraint_schema \
                  AND kcu.constraint_name = rc.constraint_name \
                 JOIN information_schema.key_column_usage ccu \
                   ON ccu.constraint_schema = rc.unique_constraint_schema \
                  AND ccu.constraint_name = rc.unique_constraint_name \
                  AND ccu.ordinal_position = kcu.ordinal_position \
                 WHERE kcu.table_schema = current_schema() AND kcu.table_name = {table} \
                 ORDER BY kcu.constraint_name, kcu.ordinal_position"
            ),
            checks: format!(
                "SELECT pg_get_constraintdef(c.oid) AS def FROM pg_constraint c \
                 JOIN pg_class t ON t.oid = c.conrelid \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 WHERE c.contype = 'c' AND n.nspname = current_schema() AND t.relname = {table}"
            ),
        }
    } else {
        CatalogQueries {
            columns: format!(
                "SELECT c.COLUMN_NAME AS name, c.DATA_TYPE AS data_type, c.DATA_TYPE AS udt_name, \
                 c.IS_NULLABLE AS is_nullable, c.COLUMN_DEFAULT AS column_default, \
                 c.CHARACTER_MAXIMUM_LENGTH AS max_length, c.NUMERIC_SCALE AS scale, \
                 CASE COLUMNPROPERTY(OBJECT_ID(QUOTENAME(c.TABLE_SCHEMA) + '.' + QUOTENAME(c.TABLE_NAME)), \
                   c.COLUMN_NAME, 'IsIdentity') WHEN 1 THEN 'YES' ELSE 'NO' END AS is_identity \
                 FROM INFORMATION_SCHEMA.COLUMNS c \
                 WHERE c.TABLE_SCHEMA = SCHEMA_NAME() AND c.TABLE_NAME = {table} \
                 ORDER BY c.ORDINAL_POSITION"
            ),
            constraints: format!(
                "SELECT tc.CONSTRAINT_TYPE AS kind, tc.CONSTRAINT_NAME AS name, kcu.COLUMN_NAME AS column_name \
                 FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
                   ON kcu.CONSTRAINT_SCHEMA = tc.CONSTRAINT_SCHEMA \
                  AND kcu.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
                  AND kcu.TABLE_NAME = tc.TABLE_NAME \
                 WHERE tc.TABLE_SCHEMA = SCHEMA_NAME() AND tc.TABLE_NAME = {table} \
                   AND tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'UNIQUE') \
                 ORDER BY tc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION"
            ),
            foreign_keys: format!(
                "SELECT kcu.COLUMN_NAME AS column_name, ccu.TABLE_NAME AS foreign_table, \
                 ccu.COLUMN_NAME AS foreign_column, rc.DELETE_RULE AS on_delete, rc.UPDATE_RULE AS on_update \
                 FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
                   ON kcu.CONSTRAINT_SCHEMA = rc.CONSTRAINT_SCHEMA \
                  AND kcu.CONSTRAINT_NAME = rc.CONSTRAINT_NAME \
                 JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE ccu \
                   ON ccu.CONSTRAINT_SCHEMA = rc.UNIQUE_CONSTRAINT_SCHEMA \
                  AND ccu.CONSTRAINT_NAME = rc.UNIQUE_CONSTRAINT_NAME \
                  AND ccu.ORDINAL_POSITION = kcu.ORDINAL_POSITION \
                 WHERE kcu.TABLE_SCHEMA = SCHEMA_NAME() AND kcu.TABLE_NAME = {table} \
                 ORDER BY kcu.CONSTRAINT_NAME, kcu.ORDINAL_POSITION"
            ),
            checks: format!(
                "SELECT cc.CHECK_CLAUSE AS def FROM INFORMATION_SCHEMA.CHECK_CONSTRAINTS cc \
                 JOIN INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
                   ON tc.CONSTRAINT_SCHEMA = cc.CONSTRAINT_SCHEMA \
                  AND tc.CONSTRAINT_NAME = cc.CONSTRAINT_NAME \
                 WHERE tc.TABLE_SCHEMA = SCHEMA_NAME() AND tc.TABLE_NAME = {table}"
            ),
        }
    }
}

fn catalog(conn: &mut Connection, table: &str) -> UnisqlResult<(IndexMap<String, ColumnInfo>, KeySet)> {
    let dialect = conn.dialect();
    let queries = catalog_queries(dialect, &conn.escaper().escape_native_string(table));

    let column_rows = conn.query_rows(&queries.columns)?;
    if column_rows.is_empty() {
        return Err(missing(table));
    }
    let mut columns = IndexMap::new();
    for row in &column_rows {
        let Some(name) = text(row, "name") else {
            continue;
        };
        columns.insert(name, catalog_column(dialect, row));
    }

    let mut keys = KeySet::default();
    let mut unique: IndexMap<String, Vec<String>> = IndexMap::new();
    for row in conn.query_rows(&queries.constraints)? {
        let (Some(kind), Some(name), Some(column)) =
            (text(&row, "kind"), text(&row, "name"), text(&row, "column_name"))
        else {
            continue;
        };
        if kind.eq_ignore_ascii_case("PRIMARY KEY") {
            keys.primary.push(column);
        } else {
            unique.entry(name).or_default().push(column);
        }
    }
    keys.unique = unique.into_values().collect();

    for row in conn.query_rows(&queries.foreign_keys)? {
        let (Some(column), Some(foreign_table), Some(foreign_column)) = (
            text(&row, "column_name"),
            text(&row, "foreign_table"),
            text(&row, "foreign_column"),
        ) else {
            continue;
        };
        let action = |key: &str| {
            text(&row, key)
                .as_deref()
                .and_then(FkAction::parse)
                .unwrap_or_default()
        };
        keys.foreign.push(ForeignKey {
            column,
            foreign_table,
            foreign_column,
            on_delete: action("on_delete"),
            on_update: action("on_update"),
        });
    }

    for row in conn.query_rows(&queries.checks)? {
        let Some(def) = text(&row, "def") else {
            continue;
        };
        for (name, info) in columns.iter_mut() {
            if info.valid_values.is_none() {
                info.valid_values = check_values(dialect, &def, name);
            }
        }
    }

    // A single-column primary key is never nullable, even when the catalog
    // reports the column without its own NOT NULL.
    if let [pk] = keys.primary.as_slice() {
        if let Some(info) = columns.get_mut(pk) {
            info.not_null = true;
        }
    }
    Ok((columns, keys))
}

fn catalog_column(dialect: Dialect, row: &Row) -> ColumnInfo {
    let data_type = text(row, "data_type").unwrap_or_default();
    let max_length = int(row, "max_length");
    let native = match (dialect, data_type.as_str()) {
        (Dialect::Postgres, "USER-DEFINED" | "ARRAY") => text(row, "udt_name").unwrap_or_default(),
        (Dialect::SqlServer, _) if max_length == Some(-1) => format!("{data_type}(max)"),
        _ => data_type,
    };

    let mut info = column_info(dialect, &native);
    if info.max_length.is_none() {
        info.max_length = max_length.and_then(|n| u32::try_from(n).ok());
    }
    if info.column_type == ColumnType::Float {
        info.decimal_places = int(row, "scale").and_then(|n| u32::try_from(n).ok());
    }
    info.not_null = text(row, "is_nullable").is_some_and(|v| v.eq_ignore_ascii_case("NO"));

    let default = text(row, "column_default");
    let serial = default
        .as_deref()
        .is_some_and(|d| d.trim_start().to_ascii_lowercase().starts_with("nextval("));
    info.auto_increment =
        serial || text(row, "is_identity").is_some_and(|v| v.eq_ignore_ascii_case("YES"));
    if !info.auto_increment {
        info.default = default.as_deref().and_then(normalize_default);
    }
    info
}

fn check_values(dialect: Dialect, def: &str, column: &str) -> Option<Vec<String>> {
    match dialect {
        Dialect::Postgres => {
            if let Some(caps) = PG_ANY_ARRAY.captures(def) {
                if caps[1].eq_ignore_ascii_case(column) {
                    return literal_list(&caps[2]);
                }
                return None;
            }
            let body = def.trim_start();
            let body = body
                .get(..5)
                .filter(|kw| kw.eq_ignore_ascii_case("CHECK"))
                .map(|_| &body[5..])
                .unwrap_or(body);
            check_valid_values(body, column)
        }
        _ => check_valid_values(def, column),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_pg_any_array_check() {
        let def = "CHECK (((status)::text = ANY ((ARRAY['draft'::character varying, 'live'::character varying])::text[])))";
        assert_eq!(
            check_values(Dialect::Postgres, def, "status"),
            Some(vec!["draft".to_string(), "live".to_string()])
        );
        assert_eq!(check_values(Dialect::Postgres, def, "title"), None);

        let def = "CHECK ((kind = ANY (ARRAY['a'::text, 'b'::text])))";
        assert_eq!(
            check_values(Dialect::Postgres, def, "kind"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_mssql_or_check() {
        let def = "([status]='draft' OR [status]='live')";
        assert_eq!(
            check_values(Dialect::SqlServer, def, "status"),
            Some(vec!["draft".to_string(), "live".to_string()])
        );
    }

    #[test]
    fn test_catalog_column_serial() {
        let info = catalog_column(
            Dialect::Postgres,
            &row(&[
                ("data_type", Value::Text("integer".into())),
                ("is_nullable", Value::Text("NO".into())),
                ("column_default", Value::Text("nextval('users_id_seq'::regclass)".into())),
                ("is_identity", Value::Text("NO".into())),
            ]),
        );
        assert_eq!(info.column_type, ColumnType::Integer);
        assert!(info.auto_increment);
        assert!(info.not_null);
        assert_eq!(info.default, None);
    }

    #[test]
    fn test_catalog_column_lengths_and_defaults() {
        let info = catalog_column(
            Dialect::Postgres,
            &row(&[
                ("data_type", Value::Text("character varying".into())),
                ("is_nullable", Value::Text("YES".into())),
                ("column_default", Value::Text("'draft'::character varying".into())),
                ("max_length", Value::Int(20)),
            ]),
        );
        assert_eq!(info.column_type, ColumnType::Varchar);
        assert_eq!(info.max_length, Some(20));
        assert_eq!(info.default, Some(Value::Text("draft".into())));
        assert!(!info.not_null);

        let info = catalog_column(
            Dialect::SqlServer,
            &row(&[
                ("data_type", Value::Text("nvarchar".into())),
                ("max_length", Value::Int(-1)),
                ("is_nullable", Value::Text("YES".into())),
            ]),
        );
        assert_eq!(info.column_type, ColumnType::Text);
        assert_eq!(info.max_length, None);
    }

    #[test]
    fn test_charset_introducer_stripped() {
        let ddl = "CREATE TABLE t (s enum('a','b') DEFAULT _utf8mb4'a', CHECK (s IN (_utf8mb4'a',_utf8mb4'b')))";
        let cleaned = map_sql_runs(ddl, |run| CHARSET_INTRODUCER.replace(run, "").into_owned());
        assert_eq!(
            cleaned,
            "CREATE TABLE t (s enum('a','b') DEFAULT 'a', CHECK (s IN ('a','b')))"
        );
    }
}
