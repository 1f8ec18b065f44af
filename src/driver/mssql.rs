use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::StreamExt;
use tiberius::{AuthMethod, ColumnData, Config, FromSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{DriverError, ExecResult, RowSink};
use crate::connection::ConnectOptions;
use crate::escape::{DATE_FORMAT, TIMESTAMP_FORMAT, TIME_FORMAT};
use crate::result::Row;
use crate::tokenizer::{find_top_level_keyword, mask_quoted};
use crate::translator::StatementKind;
use crate::value::Value;

pub(crate) type Client = tiberius::Client<Compat<TcpStream>>;

impl From<tiberius::error::Error> for DriverError {
    fn from(err: tiberius::error::Error) -> Self {
        let lost_connection = matches!(
            err,
            tiberius::error::Error::Io { .. } | tiberius::error::Error::Tls(_)
        );
        Self {
            message: err.to_string(),
            lost_connection,
        }
    }
}

pub(super) async fn connect(options: &ConnectOptions) -> Result<Client, DriverError> {
    let mut config = Config::new();
    config.host(options.host_or_default());
    config.port(options.port_or_default());
    config.database(&options.database);
    config.authentication(AuthMethod::sql_server(
        options.username.as_deref().unwrap_or("sa"),
        options.password.as_deref().unwrap_or_default(),
    ));
    config.trust_cert();

    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| DriverError {
            message: e.to_string(),
            lost_connection: true,
        })?;
    let _ = tcp.set_nodelay(true);
    Ok(tiberius::Client::connect(config, tcp.compat_write()).await?)
}

/// Whether a statement hands back rows rather than just a count.
///
/// tiberius reports affected-row counts only through `execute`, which
/// discards rows, so each statement takes one path or the other.
fn returns_rows(sql: &str, kind: StatementKind) -> bool {
    if kind == StatementKind::Select {
        return true;
    }
    let first = sql.split_whitespace().next().unwrap_or_default();
    if first.eq_ignore_ascii_case("EXEC") || first.eq_ignore_ascii_case("EXECUTE") {
        return true;
    }
    find_top_level_keyword(&mask_quoted(sql), "OUTPUT", 0).is_some()
}

pub(super) async fn run(
    client: &mut Client,
    sql: &str,
    kind: StatementKind,
) -> Result<ExecResult, DriverError> {
    let mut out = ExecResult::default();
    if returns_rows(sql, kind) {
        let results = client.simple_query(sql).await?.into_results().await?;
        for row in results.into_iter().flatten() {
            out.rows.push(decode_row(&row)?);
        }
        if kind != StatementKind::Select {
            out.affected = out.rows.len() as u64;
        }
    } else {
        let done = client.execute(sql, &[]).await?;
        out.affected = done.rows_affected().iter().sum();
    }
    if kind == StatementKind::Insert {
        out.insert_id = last_identity(client).await?;
    }
    Ok(out)
}

async fn last_identity(client: &mut Client) -> Result<Option<i64>, DriverError> {
    let row = client
        .simple_query("SELECT CAST(@@IDENTITY AS BIGINT) AS id")
        .await?
        .into_row()
        .await?;
    match row {
        Some(row) => Ok(row.try_get::<i64, _>(0)?),
        None => Ok(None),
    }
}

pub(super) async fn stream(client: &mut Client, sql: &str, mut sink: RowSink) {
    let query = match client.simple_query(sql).await {
        Ok(query) => query,
        Err(err) => {
            sink.fail(err.into()).await;
            return;
        }
    };
    let mut rows = query.into_row_stream();
    while let Some(row) = rows.next().await {
        let row = row.map_err(DriverError::from).and_then(|row| decode_row(&row));
        if !sink.forward(row).await {
            break;
        }
    }
    // Unread TDS tokens would be taken as the reply to the next statement.
    while let Some(Ok(_)) = rows.next().await {}
}

pub(super) async fn close(client: Client) -> Result<(), DriverError> {
    Ok(client.close().await?)
}

fn decode_row(row: &tiberius::Row) -> Result<Row, DriverError> {
    let mut out = Row::with_capacity(row.columns().len());
    for (column, data) in row.cells() {
        out.insert(column.name().to_string(), decode_value(data)?);
    }
    Ok(out)
}

fn decode_value(data: &ColumnData<'static>) -> Result<Value, DriverError> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| Value::Int(v.into())),
        ColumnData::I16(v) => v.map(|v| Value::Int(v.into())),
        ColumnData::I32(v) => v.map(|v| Value::Int(v.into())),
        ColumnData::I64(v) => v.map(Value::Int),
        ColumnData::F32(v) => v.map(|v| Value::Float(v.into())),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|v| Value::Text(v.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|v| Value::Text(v.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|v| Value::Blob(v.to_vec())),
        ColumnData::Numeric(v) => v.as_ref().map(|v| Value::Text(v.to_string())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|v| Value::Text(v.clone().into_owned().into_string())),
        ColumnData::Date(_) => NaiveDate::from_sql(data)?
            .map(|d| Value::Text(d.format(DATE_FORMAT).to_string())),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?
            .map(|t| Value::Text(t.format(TIME_FORMAT).to_string())),
        ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(data)?
            .map(|t| Value::Text(t.naive_utc().format(TIMESTAMP_FORMAT).to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?
                .map(|t| Value::Text(t.format(TIMESTAMP_FORMAT).to_string()))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("SELECT 1", StatementKind::Select));
        assert!(returns_rows("exec dbo.report @year = 2024", StatementKind::Other));
        assert!(returns_rows(
            "INSERT INTO t (a) OUTPUT inserted.id VALUES (1)",
            StatementKind::Insert
        ));
        assert!(!returns_rows(
            "MERGE INTO t USING s ON t.id = s.id WHEN MATCHED THEN UPDATE SET t.a = s.a;",
            StatementKind::Other
        ));
        assert!(!returns_rows("UPDATE t SET note = 'OUTPUT'", StatementKind::Update));
        assert!(!returns_rows("TRUNCATE TABLE t", StatementKind::Other));
    }
}
