use std::str::FromStr;

use futures::StreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Column, Connection, Either, Executor, Row as _, SqliteConnection, TypeInfo, ValueRef};

use super::{DriverError, ExecResult, RowSink};
use crate::connection::ConnectOptions;
use crate::result::Row;
use crate::value::Value;

pub(crate) const MEMORY: &str = ":memory:";

pub(super) async fn connect(options: &ConnectOptions) -> Result<SqliteConnection, DriverError> {
    let connect = if options.database == MEMORY {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        SqliteConnectOptions::new()
            .filename(&options.database)
            .create_if_missing(true)
    };
    // Referential integrity comes from generated triggers instead.
    let connect = connect.foreign_keys(false);
    Ok(SqliteConnection::connect_with(&connect).await?)
}

pub(super) async fn run(conn: &mut SqliteConnection, sql: &str) -> Result<ExecResult, DriverError> {
    let mut out = ExecResult::default();
    let mut results = (&mut *conn).fetch_many(sql);
    while let Some(item) = results.next().await {
        match item? {
            Either::Left(done) => {
                out.affected += done.rows_affected();
                if done.last_insert_rowid() != 0 {
                    out.insert_id = Some(done.last_insert_rowid());
                }
            }
            Either::Right(row) => out.rows.push(decode_row(&row)?),
        }
    }
    Ok(out)
}

pub(super) async fn stream(conn: &mut SqliteConnection, sql: &str, mut sink: RowSink) {
    let mut rows = (&mut *conn).fetch(sql);
    while let Some(row) = rows.next().await {
        let row = row.map_err(DriverError::from).and_then(|row| decode_row(&row));
        if !sink.forward(row).await {
            break;
        }
    }
}

fn decode_row(row: &SqliteRow) -> Result<Row, DriverError> {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let i = column.ordinal();
        out.insert(column.name().to_string(), decode_value(row, i)?);
    }
    Ok(out)
}

/// SQLite is dynamically typed: decode by the storage class of the value
/// itself, not the declared column type.
fn decode_value(row: &SqliteRow, i: usize) -> Result<Value, DriverError> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();
    let value = match storage.as_str() {
        "INTEGER" => Value::Int(row.try_get_unchecked::<i64, _>(i)?),
        "REAL" => Value::Float(row.try_get_unchecked::<f64, _>(i)?),
        "BLOB" => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(i)?),
        _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
    };
    Ok(value)
}
