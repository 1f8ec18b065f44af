use futures::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, Uuid};
use sqlx::{Column, Connection, Either, Executor, PgConnection, Row as _, TypeInfo, ValueRef};

use super::{DriverError, ExecResult, RowSink};
use crate::connection::ConnectOptions;
use crate::escape::{DATE_FORMAT, TIMESTAMP_FORMAT, TIME_FORMAT};
use crate::result::Row;
use crate::value::Value;

pub(super) async fn connect(options: &ConnectOptions) -> Result<PgConnection, DriverError> {
    let mut connect = PgConnectOptions::new()
        .host(options.host_or_default())
        .port(options.port_or_default())
        .database(&options.database);
    if let Some(user) = &options.username {
        connect = connect.username(user);
    }
    if let Some(password) = &options.password {
        connect = connect.password(password);
    }
    Ok(PgConnection::connect_with(&connect).await?)
}

pub(super) async fn run(conn: &mut PgConnection, sql: &str) -> Result<ExecResult, DriverError> {
    let mut out = ExecResult::default();
    let mut results = (&mut *conn).fetch_many(sql);
    while let Some(item) = results.next().await {
        match item? {
            Either::Left(done) => out.affected += done.rows_affected(),
            Either::Right(row) => out.rows.push(decode_row(&row)?),
        }
    }
    Ok(out)
}

pub(super) async fn stream(conn: &mut PgConnection, sql: &str, mut sink: RowSink) {
    let mut rows = (&mut *conn).fetch(sql);
    while let Some(row) = rows.next().await {
        let row = row.map_err(DriverError::from).and_then(|row| decode_row(&row));
        if !sink.forward(row).await {
            break;
        }
    }
}

fn decode_row(row: &PgRow) -> Result<Row, DriverError> {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let i = column.ordinal();
        out.insert(column.name().to_string(), decode_value(row, i)?);
    }
    Ok(out)
}

fn decode_value(row: &PgRow, i: usize) -> Result<Value, DriverError> {
    let raw = row.try_get_raw(i)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => Value::Bool(row.try_get::<bool, _>(i)?),
        "INT2" => Value::Int(row.try_get::<i16, _>(i)?.into()),
        "INT4" => Value::Int(row.try_get::<i32, _>(i)?.into()),
        "INT8" => Value::Int(row.try_get::<i64, _>(i)?),
        "FLOAT4" => Value::Float(row.try_get::<f32, _>(i)?.into()),
        "FLOAT8" => Value::Float(row.try_get::<f64, _>(i)?),
        "NUMERIC" => Value::Text(row.try_get::<Decimal, _>(i)?.to_string()),
        "BYTEA" => Value::Blob(row.try_get::<Vec<u8>, _>(i)?),
        "DATE" => Value::Text(row.try_get::<NaiveDate, _>(i)?.format(DATE_FORMAT).to_string()),
        "TIME" => Value::Text(row.try_get::<NaiveTime, _>(i)?.format(TIME_FORMAT).to_string()),
        "TIMESTAMP" => Value::Text(
            row.try_get::<NaiveDateTime, _>(i)?
                .format(TIMESTAMP_FORMAT)
                .to_string(),
        ),
        "TIMESTAMPTZ" => Value::Text(
            row.try_get::<DateTime<Utc>, _>(i)?
                .naive_utc()
                .format(TIMESTAMP_FORMAT)
                .to_string(),
        ),
        "UUID" => Value::Text(row.try_get::<Uuid, _>(i)?.to_string()),
        // Text, names, enums, json and anything exotic arrive as their text form.
        _ => Value::Text(row.try_get_unchecked::<String, _>(i)?),
    };
    Ok(value)
}
