//! Native client handles.
//!
//! sqlx serves MySQL, Postgres and SQLite. SQL Server goes through
//! tiberius when the `mssql` feature is on. Statements are sent as plain
//! text without parameters, so every backend runs them through its simple
//! query protocol.

mod mysql;
mod postgres;
mod sqlite;

#[cfg(feature = "mssql")]
mod mssql;

pub(crate) use sqlite::MEMORY as SQLITE_MEMORY;

use sqlx::Connection as _;
use tokio::sync::{mpsc, watch};

use crate::connection::ConnectOptions;
use crate::dialect::Driver;
use crate::error::{UnisqlError, UnisqlResult};
use crate::result::Row;
use crate::translator::{Statement, StatementKind};

/// Rows and counters of one statement, fully collected.
#[derive(Debug, Default)]
pub(crate) struct ExecResult {
    pub rows: Vec<Row>,
    pub affected: u64,
    pub insert_id: Option<i64>,
}

/// A failure reported by a native client.
#[derive(Debug, Clone)]
pub struct DriverError {
    pub message: String,
    /// The handle is unusable afterwards.
    pub lost_connection: bool,
}

impl DriverError {
    pub(crate) fn into_error(self, statement: &Statement) -> UnisqlError {
        if self.lost_connection {
            UnisqlError::connectivity(format!(
                "connection lost while running '{}': {}",
                statement.translated(),
                self.message
            ))
        } else {
            UnisqlError::sql(self.message, statement.original(), statement.translated())
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        let lost_connection = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::Protocol(_)
                | sqlx::Error::WorkerCrashed
                | sqlx::Error::PoolClosed
        );
        let message = match err.as_database_error() {
            Some(db) => db.message().to_string(),
            None => err.to_string(),
        };
        Self {
            message,
            lost_connection,
        }
    }
}

/// An open native handle.
pub(crate) enum NativeConnection {
    MySql(sqlx::MySqlConnection),
    Postgres(sqlx::PgConnection),
    Sqlite(sqlx::SqliteConnection),
    #[cfg(feature = "mssql")]
    SqlServer(mssql::Client),
}

impl NativeConnection {
    pub async fn connect(driver: Driver, options: &ConnectOptions) -> UnisqlResult<Self> {
        let connectivity = |err: DriverError| {
            UnisqlError::connectivity(format!("could not connect to {options}: {err}"))
        };
        match driver {
            Driver::SqlxMySql => mysql::connect(options)
                .await
                .map(Self::MySql)
                .map_err(connectivity),
            Driver::SqlxPostgres => postgres::connect(options)
                .await
                .map(Self::Postgres)
                .map_err(connectivity),
            Driver::SqlxSqlite => sqlite::connect(options)
                .await
                .map(Self::Sqlite)
                .map_err(connectivity),
            #[cfg(feature = "mssql")]
            Driver::Tiberius => mssql::connect(options)
                .await
                .map(Self::SqlServer)
                .map_err(connectivity),
            #[cfg(not(feature = "mssql"))]
            Driver::Tiberius => Err(UnisqlError::environment(
                "this build has no SQL Server driver; enable the `mssql` feature",
            )),
        }
    }

    /// Run one statement and collect everything it returns.
    pub async fn run(&mut self, sql: &str, kind: StatementKind) -> Result<ExecResult, DriverError> {
        match self {
            Self::MySql(conn) => mysql::run(conn, sql).await,
            Self::Postgres(conn) => postgres::run(conn, sql).await,
            Self::Sqlite(conn) => sqlite::run(conn, sql).await,
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::run(client, sql, kind).await,
        }
        .map(|mut result| {
            if kind != StatementKind::Insert {
                result.insert_id = None;
            }
            result
        })
    }

    /// Stream the rows of a query into `sink` until it is drained, the
    /// receiving side goes away or the result is released. The first error
    /// ends the stream.
    pub async fn stream(&mut self, sql: &str, sink: RowSink) {
        match self {
            Self::MySql(conn) => mysql::stream(conn, sql, sink).await,
            Self::Postgres(conn) => postgres::stream(conn, sql, sink).await,
            Self::Sqlite(conn) => sqlite::stream(conn, sql, sink).await,
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::stream(client, sql, sink).await,
        }
    }

    pub async fn close(self) -> Result<(), DriverError> {
        match self {
            Self::MySql(conn) => conn.close().await.map_err(DriverError::from),
            Self::Postgres(conn) => conn.close().await.map_err(DriverError::from),
            Self::Sqlite(conn) => conn.close().await.map_err(DriverError::from),
            #[cfg(feature = "mssql")]
            Self::SqlServer(client) => mssql::close(client).await,
        }
    }
}

/// Where a streaming query delivers its rows.
pub(crate) struct RowSink {
    tx: mpsc::Sender<Result<Row, DriverError>>,
    released: watch::Receiver<bool>,
}

impl RowSink {
    pub(crate) fn new(tx: mpsc::Sender<Result<Row, DriverError>>, released: watch::Receiver<bool>) -> Self {
        Self { tx, released }
    }

    /// Forward one decoded row. Returns false once streaming must stop:
    /// after an error, when the reader is gone, or when the result is
    /// released while the channel is full.
    async fn forward(&mut self, row: Result<Row, DriverError>) -> bool {
        let failed = row.is_err();
        if *self.released.borrow() {
            return false;
        }
        let sent = tokio::select! {
            sent = self.tx.send(row) => sent.is_ok(),
            _ = self.released.changed() => false,
        };
        sent && !failed
    }

    /// Report a failure that happened before the first row.
    pub(crate) async fn fail(&self, err: DriverError) {
        let _ = self.tx.send(Err(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row() -> Result<Row, DriverError> {
        Ok(Row::new())
    }

    #[tokio::test]
    async fn test_release_unblocks_a_full_sink() {
        let (tx, mut rx) = mpsc::channel(1);
        let (release, on_release) = watch::channel(false);
        let mut sink = RowSink::new(tx, on_release);
        assert!(sink.forward(row()).await);

        let blocked = tokio::spawn(async move { sink.forward(row()).await });
        tokio::task::yield_now().await;
        let _ = release.send(true);
        assert!(!blocked.await.unwrap());

        assert_eq!(rx.recv().await.map(|r| r.is_ok()), Some(true));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_errors_end_the_stream() {
        let (tx, mut rx) = mpsc::channel(4);
        let (_release, on_release) = watch::channel(false);
        let mut sink = RowSink::new(tx, on_release);
        let failure = DriverError {
            message: "boom".to_string(),
            lost_connection: false,
        };
        assert!(!sink.forward(Err(failure)).await);
        assert_eq!(rx.recv().await.and_then(|r| r.err()).map(|e| e.message), Some("boom".to_string()));
    }
}
