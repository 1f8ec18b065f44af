use futures::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::types::chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::types::Decimal;
use sqlx::{Column, Connection, Either, Executor, MySqlConnection, Row as _, TypeInfo, ValueRef};

use super::{DriverError, ExecResult, RowSink};
use crate::connection::ConnectOptions;
use crate::escape::{DATE_FORMAT, TIMESTAMP_FORMAT, TIME_FORMAT};
use crate::result::Row;
use crate::value::Value;

pub(super) async fn connect(options: &ConnectOptions) -> Result<MySqlConnection, DriverError> {
    let mut connect = MySqlConnectOptions::new()
        .host(options.host_or_default())
        .port(options.port_or_default())
        .database(&options.database);
    if let Some(user) = &options.username {
        connect = connect.username(user);
    }
    if let Some(password) = &options.password {
        connect = connect.password(password);
    }
    Ok(MySqlConnection::connect_with(&connect).await?)
}

pub(super) async fn run(conn: &mut MySqlConnection, sql: &str) -> Result<ExecResult, DriverError> {
    let mut out = ExecResult::default();
    let mut results = (&mut *conn).fetch_many(sql);
    while let Some(item) = results.next().await {
        match item? {
            Either::Left(done) => {
                out.affected += done.rows_affected();
                if done.last_insert_id() > 0 {
                    out.insert_id = i64::try_from(done.last_insert_id()).ok();
                }
            }
            Either::Right(row) => out.rows.push(decode_row(&row)?),
        }
    }
    Ok(out)
}

pub(super) async fn stream(conn: &mut MySqlConnection, sql: &str, mut sink: RowSink) {
    let mut rows = (&mut *conn).fetch(sql);
    while let Some(row) = rows.next().await {
        let row = row.map_err(DriverError::from).and_then(|row| decode_row(&row));
        if !sink.forward(row).await {
            break;
        }
    }
}

fn decode_row(row: &MySqlRow) -> Result<Row, DriverError> {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let i = column.ordinal();
        out.insert(column.name().to_string(), decode_value(row, i)?);
    }
    Ok(out)
}

fn decode_value(row: &MySqlRow, i: usize) -> Result<Value, DriverError> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(i)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            Value::Int(row.try_get_unchecked::<i64, _>(i)?)
        }
        name if name.ends_with("UNSIGNED") => {
            let unsigned = row.try_get_unchecked::<u64, _>(i)?;
            i64::try_from(unsigned)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(unsigned.to_string()))
        }
        "FLOAT" | "DOUBLE" => Value::Float(row.try_get_unchecked::<f64, _>(i)?),
        "DECIMAL" => Value::Text(row.try_get::<Decimal, _>(i)?.to_string()),
        "DATE" => Value::Text(row.try_get::<NaiveDate, _>(i)?.format(DATE_FORMAT).to_string()),
        "TIME" => Value::Text(row.try_get::<NaiveTime, _>(i)?.format(TIME_FORMAT).to_string()),
        "DATETIME" | "TIMESTAMP" => Value::Text(
            row.try_get::<NaiveDateTime, _>(i)?
                .format(TIMESTAMP_FORMAT)
                .to_string(),
        ),
        name if name.contains("BLOB") || name.contains("BINARY") || name == "BIT" => {
            Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(i)?)
        }
        _ => match row.try_get_unchecked::<String, _>(i) {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(i)?),
        },
    };
    Ok(value)
}
