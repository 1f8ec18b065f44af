//! Native type names to canonical [`ColumnType`]s.

use super::{ColumnInfo, ColumnType};
use crate::ddl::literal_list;
use crate::dialect::Dialect;
use crate::tokenizer::unquote;
use crate::value::Value;

use ColumnType::*;

const MYSQL_TYPES: &[(&str, ColumnType)] = &[
    ("varchar", Varchar),
    ("char", Char),
    ("enum", Varchar),
    ("set", Varchar),
    ("tinytext", Text),
    ("text", Text),
    ("mediumtext", Text),
    ("longtext", Text),
    ("tinyint(1)", Boolean),
    ("bool", Boolean),
    ("bit", Boolean),
    ("tinyint", Integer),
    ("smallint", Integer),
    ("mediumint", Integer),
    ("int", Integer),
    ("bigint", Integer),
    ("year", Integer),
    ("decimal", Float),
    ("numeric", Float),
    ("float", Float),
    ("double", Float),
    ("real", Float),
    ("datetime", Timestamp),
    ("timestamp", Timestamp),
    ("date", Date),
    ("time", Time),
    ("tinyblob", Blob),
    ("blob", Blob),
    ("mediumblob", Blob),
    ("longblob", Blob),
    ("binary", Blob),
    ("varbinary", Blob),
];

const POSTGRES_TYPES: &[(&str, ColumnType)] = &[
    ("character varying", Varchar),
    ("varchar", Varchar),
    ("character", Char),
    ("char", Char),
    ("bpchar", Char),
    ("text", Text),
    ("citext", Text),
    ("smallint", Integer),
    ("integer", Integer),
    ("int2", Integer),
    ("int4", Integer),
    ("int8", Integer),
    ("bigint", Integer),
    ("smallserial", Integer),
    ("serial", Integer),
    ("bigserial", Integer),
    ("numeric", Float),
    ("decimal", Float),
    ("real", Float),
    ("double precision", Float),
    ("float4", Float),
    ("float8", Float),
    ("timestamp", Timestamp),
    ("date", Date),
    ("time", Time),
    ("boolean", Boolean),
    ("bool", Boolean),
    ("bytea", Blob),
];

const SQLITE_TYPES: &[(&str, ColumnType)] = &[
    ("varchar", Varchar),
    ("nvarchar", Varchar),
    ("varying character", Varchar),
    ("character varying", Varchar),
    ("char", Char),
    ("nchar", Char),
    ("native character", Char),
    ("character", Char),
    ("text", Text),
    ("clob", Text),
    ("tinyint", Integer),
    ("smallint", Integer),
    ("mediumint", Integer),
    ("int", Integer),
    ("integer", Integer),
    ("bigint", Integer),
    ("float", Float),
    ("real", Float),
    ("double", Float),
    ("numeric", Float),
    ("decimal", Float),
    ("timestamp", Timestamp),
    ("datetime", Timestamp),
    ("date", Date),
    ("time", Time),
    ("boolean", Boolean),
    ("bool", Boolean),
    ("blob", Blob),
];

const MSSQL_TYPES: &[(&str, ColumnType)] = &[
    ("nvarchar(max)", Text),
    ("varchar(max)", Text),
    ("nvarchar", Varchar),
    ("varchar", Varchar),
    ("nchar", Char),
    ("char", Char),
    ("ntext", Text),
    ("text", Text),
    ("xml", Text),
    ("tinyint", Integer),
    ("smallint", Integer),
    ("int", Integer),
    ("bigint", Integer),
    ("bit", Boolean),
    ("decimal", Float),
    ("numeric", Float),
    ("money", Float),
    ("smallmoney", Float),
    ("float", Float),
    ("real", Float),
    ("datetime2", Timestamp),
    ("datetime", Timestamp),
    ("smalldatetime", Timestamp),
    ("datetimeoffset", Timestamp),
    ("date", Date),
    ("time", Time),
    ("varbinary", Blob),
    ("binary", Blob),
    ("image", Blob),
];

fn table_for(dialect: Dialect) -> &'static [(&'static str, ColumnType)] {
    match dialect {
        Dialect::MySQL => MYSQL_TYPES,
        Dialect::Postgres => POSTGRES_TYPES,
        Dialect::SQLite => SQLITE_TYPES,
        Dialect::SqlServer => MSSQL_TYPES,
    }
}

/// Map a native type name to its canonical type. The longest matching
/// prefix wins; unmatched names pass through as [`ColumnType::Other`].
pub fn map_native_type(dialect: Dialect, native: &str) -> ColumnType {
    let lower = native.trim().to_ascii_lowercase();
    table_for(dialect)
        .iter()
        .filter(|(prefix, _)| lower.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, ty)| ty.clone())
        .unwrap_or_else(|| Other(lower.clone()))
}

/// Numbers inside the first parenthesis: `decimal(10,2)` -> `[10, 2]`.
fn type_params(native: &str) -> Vec<u32> {
    let Some(open) = native.find('(') else {
        return Vec::new();
    };
    let Some(close) = native[open..].find(')') else {
        return Vec::new();
    };
    native[open + 1..open + close]
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .collect()
}

/// Build column metadata implied by a native type declaration.
pub(crate) fn column_info(dialect: Dialect, native: &str) -> ColumnInfo {
    let column_type = map_native_type(dialect, native);
    let mut info = ColumnInfo::new(column_type.clone());
    let params = type_params(native);

    match column_type {
        Varchar | Char => {
            info.max_length = params.first().copied();
            let lower = native.trim_start().to_ascii_lowercase();
            if lower.starts_with("enum(") || lower.starts_with("set(") {
                if let (Some(open), Some(close)) = (native.find('('), native.rfind(')')) {
                    info.valid_values = literal_list(&native[open + 1..close]);
                }
                info.max_length = info
                    .valid_values
                    .as_ref()
                    .and_then(|v| v.iter().map(|s| s.chars().count() as u32).max());
            }
        }
        Float => {
            info.decimal_places = params.get(1).copied();
        }
        _ => {}
    }
    info
}

/// Normalize a raw default expression into a value.
///
/// Literals are unquoted and numbers parsed; `NULL` means no default. Other
/// expressions such as `CURRENT_TIMESTAMP` are kept verbatim as text.
pub(crate) fn normalize_default(raw: &str) -> Option<Value> {
    let mut expr = raw.trim();
    // SQL Server wraps defaults in parentheses: ((0)), ('abc')
    while expr.starts_with('(') && expr.ends_with(')') && expr.len() >= 2 {
        expr = expr[1..expr.len() - 1].trim();
    }
    // PostgreSQL casts: 'abc'::character varying
    let expr = match expr.rfind("::") {
        Some(pos) if expr.starts_with('\'') && expr[..pos].ends_with('\'') => &expr[..pos],
        _ => expr,
    };
    let expr = expr.strip_prefix('N').filter(|e| e.starts_with('\'')).unwrap_or(expr);

    if expr.is_empty() || expr.eq_ignore_ascii_case("NULL") {
        return None;
    }
    if expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2 {
        return Some(Value::Text(unquote(expr)));
    }
    if expr.eq_ignore_ascii_case("true") {
        return Some(Value::Bool(true));
    }
    if expr.eq_ignore_ascii_case("false") {
        return Some(Value::Bool(false));
    }
    if let Ok(i) = expr.parse::<i64>() {
        return Some(Value::Int(i));
    }
    if let Ok(f) = expr.parse::<f64>() {
        return Some(Value::Float(f));
    }
    Some(Value::Text(expr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(map_native_type(Dialect::MySQL, "tinyint(1)"), Boolean);
        assert_eq!(map_native_type(Dialect::MySQL, "tinyint(4)"), Integer);
        assert_eq!(map_native_type(Dialect::MySQL, "datetime"), Timestamp);
        assert_eq!(map_native_type(Dialect::MySQL, "date"), Date);
        assert_eq!(map_native_type(Dialect::SqlServer, "nvarchar(max)"), Text);
        assert_eq!(map_native_type(Dialect::SqlServer, "nvarchar(20)"), Varchar);
        assert_eq!(
            map_native_type(Dialect::Postgres, "timestamp without time zone"),
            Timestamp
        );
        assert_eq!(map_native_type(Dialect::Postgres, "double precision"), Float);
    }

    #[test]
    fn test_unmapped_passes_through() {
        assert_eq!(
            map_native_type(Dialect::Postgres, "interval"),
            Other("interval".to_string())
        );
        assert_eq!(
            map_native_type(Dialect::Postgres, "UUID"),
            Other("uuid".to_string())
        );
    }

    #[test]
    fn test_column_info_params() {
        let info = column_info(Dialect::MySQL, "decimal(10,2)");
        assert_eq!(info.column_type, Float);
        assert_eq!(info.decimal_places, Some(2));

        let info = column_info(Dialect::MySQL, "enum('small','medium')");
        assert_eq!(info.column_type, Varchar);
        assert_eq!(
            info.valid_values,
            Some(vec!["small".to_string(), "medium".to_string()])
        );
        assert_eq!(info.max_length, Some(6));
    }

    #[test]
    fn test_normalize_default() {
        assert_eq!(normalize_default("((0))"), Some(Value::Int(0)));
        assert_eq!(normalize_default("('it''s')"), Some(Value::Text("it's".into())));
        assert_eq!(
            normalize_default("'x'::character varying"),
            Some(Value::Text("x".into()))
        );
        assert_eq!(normalize_default("NULL"), None);
        assert_eq!(normalize_default("1.5"), Some(Value::Float(1.5)));
        assert_eq!(
            normalize_default("CURRENT_TIMESTAMP"),
            Some(Value::Text("CURRENT_TIMESTAMP".into()))
        );
    }
}
