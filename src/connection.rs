//! Connection manager.
//!
//! A [`Connection`] owns one native handle, translates every statement into
//! its dialect before sending it, tracks transactions, and hands results back
//! as [`ResultIterator`]s.
//!
//! # Example
//!
//! ```rust,ignore
//! use unisql::prelude::*;
//!
//! let mut conn = Connection::open("sqlite::memory:")?;
//! conn.execute("CREATE TABLE users (id integer PRIMARY KEY, active boolean)")?;
//! let outcome = conn.execute("INSERT INTO users (active) VALUES (TRUE)")?.into_single()?;
//! assert_eq!(outcome.auto_increment(), Some(1));
//! ```

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::Regex;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::ddl::{qualified_identifier, CreateTable};
use crate::dialect::{Dialect, Driver};
use crate::driver::{DriverError, ExecResult, NativeConnection, RowSink, SQLITE_MEMORY};
use crate::error::{UnisqlError, UnisqlResult};
use crate::escape::Escaper;
use crate::result::{Cursor, NativeResult, ResultIterator, Row};
use crate::schema::{Introspector, SchemaCache, SchemaSource};
use crate::translator::{parent_trigger_names, Statement, StatementKind, Translator};
use crate::value::Value;

/// Rows buffered ahead of an unbuffered reader.
const UNBUFFERED_CAPACITY: usize = 32;

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

static INSERT_INTO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*INSERT\s+(?:OR\s+\w+\s+)?INTO\s+").expect("valid regex")
});

static DROP_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?").expect("valid regex")
});

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub dialect: Dialect,
    /// Database name, or the file path for SQLite (`:memory:` for a
    /// private in-memory database).
    pub database: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Statements slower than this are logged at warn level.
    pub slow_query_threshold: Option<Duration>,
    /// File backing the schema cache between runs.
    pub schema_cache: Option<PathBuf>,
}

impl ConnectOptions {
    pub fn new(dialect: Dialect, database: impl Into<String>) -> Self {
        Self {
            dialect,
            database: database.into(),
            host: None,
            port: None,
            username: None,
            password: None,
            slow_query_threshold: None,
            schema_cache: None,
        }
    }

    /// A private in-memory SQLite database.
    pub fn sqlite_memory() -> Self {
        Self::new(Dialect::SQLite, SQLITE_MEMORY)
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }

    pub fn schema_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_cache = Some(path.into());
        self
    }

    pub(crate) fn host_or_default(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    pub(crate) fn port_or_default(&self) -> u16 {
        self.port
            .or_else(|| self.dialect.default_port())
            .unwrap_or_default()
    }

    /// Parse a connection URL.
    ///
    /// Accepts `postgres://`, `postgresql://`, `mysql://`, `mariadb://`,
    /// `mssql://`, `sqlserver://`, `sqlite://path` and `sqlite::memory:`.
    pub fn from_url(url: &str) -> UnisqlResult<Self> {
        if let Some(rest) = url.strip_prefix("sqlite:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            let path = path.split('?').next().unwrap_or_default();
            let database = if path.is_empty() || path == SQLITE_MEMORY {
                SQLITE_MEMORY.to_string()
            } else {
                path.to_string()
            };
            return Ok(Self::new(Dialect::SQLite, database));
        }

        let parsed = Url::parse(url)
            .map_err(|e| UnisqlError::configuration(format!("invalid connection URL: {e}")))?;
        let dialect = Dialect::from_str(parsed.scheme())?;
        let database = parsed.path().trim_start_matches('/');
        if database.is_empty() {
            return Err(UnisqlError::configuration(format!(
                "connection URL for {dialect} names no database"
            )));
        }

        let mut options = Self::new(dialect, decode(database));
        options.host = parsed.host_str().map(str::to_string);
        options.port = parsed.port();
        if !parsed.username().is_empty() {
            options.username = Some(decode(parsed.username()));
        }
        options.password = parsed.password().map(decode);
        Ok(options)
    }

    fn validate(&self) -> UnisqlResult<()> {
        if self.database.trim().is_empty() {
            return Err(UnisqlError::configuration("no database given"));
        }
        if self.port == Some(0) {
            return Err(UnisqlError::configuration("port 0 is not a valid port"));
        }
        Ok(())
    }
}

fn decode(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

impl fmt::Display for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dialect == Dialect::SQLite {
            return write!(f, "sqlite:{}", self.database);
        }
        write!(f, "{}://", self.dialect)?;
        if let Some(user) = &self.username {
            f.write_str(user)?;
            if self.password.is_some() {
                f.write_str(":***")?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}:{}/{}", self.host_or_default(), self.port_or_default(), self.database)
    }
}

/// What one statement did.
#[derive(Debug)]
pub struct QueryOutcome {
    statement: Statement,
    result: ResultIterator,
    affected_rows: u64,
    count: usize,
    auto_increment: Option<i64>,
    elapsed: Duration,
}

impl QueryOutcome {
    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Rows returned.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Identity generated by an INSERT, if any.
    pub fn auto_increment(&self) -> Option<i64> {
        self.auto_increment
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn result(&mut self) -> &mut ResultIterator {
        &mut self.result
    }

    pub fn into_result(self) -> ResultIterator {
        self.result
    }

    pub fn rows(mut self) -> UnisqlResult<Vec<Row>> {
        self.result.fetch_all_rows()
    }
}

/// Outcome of [`Connection::execute`]: one entry per statement.
#[derive(Debug)]
pub enum Execution {
    Single(QueryOutcome),
    Batch(Vec<QueryOutcome>),
}

impl Execution {
    pub fn into_outcomes(self) -> Vec<QueryOutcome> {
        match self {
            Execution::Single(outcome) => vec![outcome],
            Execution::Batch(outcomes) => outcomes,
        }
    }

    /// The outcome of a single statement; a batch is a programmer error.
    pub fn into_single(self) -> UnisqlResult<QueryOutcome> {
        match self {
            Execution::Single(outcome) => Ok(outcome),
            Execution::Batch(outcomes) => Err(UnisqlError::programmer(format!(
                "expected one statement, executed {}",
                outcomes.len()
            ))),
        }
    }
}

struct Unbuffered {
    released: Arc<AtomicBool>,
    release: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

/// A synchronous connection to one database.
///
/// Not meant for concurrent use; wrap it in a mutex to share it between
/// threads.
pub struct Connection {
    options: ConnectOptions,
    driver: Driver,
    runtime: Runtime,
    native: Arc<Mutex<Option<NativeConnection>>>,
    connected: bool,
    translator: Translator,
    escaper: Escaper,
    schema_cache: Arc<SchemaCache>,
    in_transaction: bool,
    query_time: Duration,
    unbuffered: Option<Unbuffered>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("options", &self.options.to_string())
            .field("driver", &self.driver)
            .field("connected", &self.connected)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl Connection {
    /// Validate the options and pick a driver. Does not connect yet.
    pub fn new(options: ConnectOptions) -> UnisqlResult<Self> {
        options.validate()?;
        let driver = options.dialect.resolve_driver()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("unisql-driver")
            .enable_all()
            .build()
            .map_err(|e| UnisqlError::environment(format!("cannot start the driver runtime: {e}")))?;
        let schema_cache = match &options.schema_cache {
            Some(path) => SchemaCache::open(path)?,
            None => SchemaCache::new(),
        };
        Ok(Self {
            translator: Translator::new(options.dialect),
            escaper: Escaper::new(options.dialect),
            options,
            driver,
            runtime,
            native: Arc::new(Mutex::new(None)),
            connected: false,
            schema_cache: Arc::new(schema_cache),
            in_transaction: false,
            query_time: Duration::ZERO,
            unbuffered: None,
        })
    }

    /// Parse `url`, then connect.
    pub fn open(url: &str) -> UnisqlResult<Self> {
        let mut conn = Self::new(ConnectOptions::from_url(url)?)?;
        conn.connect()?;
        Ok(conn)
    }

    /// Share a schema cache with other connections to the same database.
    pub fn with_schema_cache(mut self, cache: Arc<SchemaCache>) -> Self {
        self.schema_cache = cache;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.options.dialect
    }

    pub fn driver(&self) -> Driver {
        self.driver
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Total time spent running statements.
    pub fn query_time(&self) -> Duration {
        self.query_time
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn escaper(&self) -> &Escaper {
        &self.escaper
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    /// Metadata access through this connection.
    pub fn schema(&mut self) -> Introspector<'_> {
        Introspector::new(self)
    }

    /// Establish the native handle. A no-op when already connected.
    pub fn connect(&mut self) -> UnisqlResult<()> {
        if self.connected {
            return Ok(());
        }
        if self.options.dialect == Dialect::SQLite && self.options.database != SQLITE_MEMORY {
            check_sqlite_file(Path::new(&self.options.database))?;
        }

        let native = self
            .runtime
            .block_on(NativeConnection::connect(self.driver, &self.options))?;
        *self.runtime.block_on(self.native.lock()) = Some(native);
        self.connected = true;
        tracing::info!(database = %self.options, driver = %self.driver, "connected");

        if self.options.dialect == Dialect::MySQL {
            self.query_rows(
                "SET SESSION sql_mode = CONCAT_WS(',', NULLIF(@@sql_mode, ''), 'PIPES_AS_CONCAT')",
            )?;
        }
        Ok(())
    }

    /// Close the native handle. Later statements reconnect.
    pub fn close(&mut self) -> UnisqlResult<()> {
        self.release_unbuffered();
        let native = Arc::clone(&self.native);
        let taken = self.runtime.block_on(async move { native.lock().await.take() });
        self.connected = false;
        self.in_transaction = false;
        if let Some(native) = taken {
            self.runtime
                .block_on(native.close())
                .map_err(|e| UnisqlError::connectivity(format!("error while closing: {e}")))?;
            tracing::info!(database = %self.options, "connection closed");
        }
        Ok(())
    }

    /// Translate and run `sql`, which may hold several `;`-separated
    /// statements. They run in order; the first failure stops the batch.
    pub fn execute(&mut self, sql: &str) -> UnisqlResult<Execution> {
        let statements = self.translator.translate_all(sql)?;
        if statements.is_empty() {
            return Err(UnisqlError::programmer("no statement to execute"));
        }
        if statements.len() == 1 {
            let statement = statements.into_iter().next().ok_or_else(|| {
                UnisqlError::programmer("no statement to execute")
            })?;
            return self.execute_statement(statement).map(Execution::Single);
        }
        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            outcomes.push(self.execute_statement(statement)?);
        }
        Ok(Execution::Batch(outcomes))
    }

    /// Run one already translated statement.
    pub fn execute_statement(&mut self, statement: Statement) -> UnisqlResult<QueryOutcome> {
        if statement.dialect() != self.dialect() {
            return Err(UnisqlError::programmer(format!(
                "statement was translated for {}, connection speaks {}",
                statement.dialect(),
                self.dialect()
            )));
        }
        self.check_transaction(statement.kind())?;
        self.release_unbuffered();
        self.connect()?;

        let cleanup = if self.dialect() == Dialect::SQLite && statement.kind() == StatementKind::DropTable {
            self.sqlite_trigger_cleanup(&statement)?
        } else {
            Vec::new()
        };

        let start = Instant::now();
        let result = self.run_native(&statement, statement.translated())?;
        for follow_up in statement.follow_ups() {
            self.run_native(&statement, follow_up)?;
        }
        for drop in &cleanup {
            self.run_native(&statement, drop)?;
        }
        let elapsed = start.elapsed();
        self.record(&statement, elapsed);

        match statement.kind() {
            StatementKind::Begin => self.in_transaction = true,
            StatementKind::Commit | StatementKind::Rollback => self.in_transaction = false,
            kind if kind.changes_schema() => self.schema_cache.flush(),
            _ => {}
        }

        let auto_increment = match statement.kind() {
            StatementKind::Insert if self.dialect() == Dialect::Postgres => {
                self.postgres_insert_id(&statement)?
            }
            StatementKind::Insert => result.insert_id,
            _ => None,
        };

        let count = result.rows.len();
        let native = if self.driver == Driver::Tiberius {
            NativeResult::EmulatedArray(result.rows)
        } else {
            NativeResult::Array(result.rows)
        };
        Ok(QueryOutcome {
            result: ResultIterator::new(native, statement.clone(), result.affected),
            statement,
            affected_rows: result.affected,
            count,
            auto_increment,
            elapsed,
        })
    }

    /// Run a SELECT and stream its rows.
    ///
    /// Only one unbuffered result can be open per connection: starting
    /// another statement of any kind releases it. Statements other than a
    /// plain SELECT run buffered.
    pub fn execute_unbuffered(&mut self, sql: &str) -> UnisqlResult<ResultIterator> {
        let statement = self.translator.translate(sql)?;
        if statement.kind() != StatementKind::Select || !statement.follow_ups().is_empty() {
            return Ok(self.execute_statement(statement)?.into_result());
        }
        self.release_unbuffered();
        self.connect()?;

        let (tx, rx) = mpsc::channel(UNBUFFERED_CAPACITY);
        let (release, on_release) = watch::channel(false);
        let sink = RowSink::new(tx, on_release);
        let released = Arc::new(AtomicBool::new(false));
        let native = Arc::clone(&self.native);
        let sql = statement.translated().to_string();

        let start = Instant::now();
        let pump = self.runtime.spawn(async move {
            let mut guard = native.lock_owned().await;
            match guard.as_mut() {
                Some(native) => native.stream(&sql, sink).await,
                None => sink.fail(closed()).await,
            }
        });
        self.record(&statement, start.elapsed());

        self.unbuffered = Some(Unbuffered {
            released: Arc::clone(&released),
            release,
            pump,
        });
        Ok(ResultIterator::new(
            NativeResult::Cursor(Cursor::new(rx, released)),
            statement,
            0,
        ))
    }

    /// Run `sql` exactly as written and collect its rows. Used for catalog
    /// queries; no translation and no transaction tracking.
    pub(crate) fn query_rows(&mut self, sql: &str) -> UnisqlResult<Vec<Row>> {
        self.release_unbuffered();
        self.connect()?;
        let statement = Statement::verbatim(sql, self.dialect());
        Ok(self.run_native(&statement, sql)?.rows)
    }

    fn check_transaction(&self, kind: StatementKind) -> UnisqlResult<()> {
        match kind {
            StatementKind::Begin if self.in_transaction => Err(UnisqlError::programmer(
                "a transaction is already in progress; nested transactions are not supported",
            )),
            StatementKind::Commit | StatementKind::Rollback if !self.in_transaction => {
                Err(UnisqlError::programmer(format!(
                    "cannot {} with no transaction in progress",
                    if kind == StatementKind::Commit { "COMMIT" } else { "ROLLBACK" }
                )))
            }
            _ => Ok(()),
        }
    }

    fn run_native(&mut self, statement: &Statement, sql: &str) -> UnisqlResult<ExecResult> {
        let native = Arc::clone(&self.native);
        let kind = statement.kind();
        let result = self.runtime.block_on(async move {
            let mut guard = native.lock().await;
            match guard.as_mut() {
                Some(native) => native.run(sql, kind).await,
                None => Err(closed()),
            }
        });
        result.map_err(|err| {
            if err.lost_connection {
                self.connected = false;
            }
            err.into_error(statement)
        })
    }

    fn record(&mut self, statement: &Statement, elapsed: Duration) {
        self.query_time += elapsed;
        if let Some(threshold) = self.options.slow_query_threshold {
            if elapsed > threshold {
                tracing::warn!(
                    target: "unisql::slow_query",
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    sql = statement.translated(),
                    "slow query"
                );
            }
        }
    }

    fn release_unbuffered(&mut self) {
        if let Some(unbuffered) = self.unbuffered.take() {
            unbuffered.released.store(true, Ordering::Release);
            // The pump stops forwarding and leaves the native handle ready
            // for the next statement.
            let _ = unbuffered.release.send(true);
            let _ = self.runtime.block_on(unbuffered.pump);
            tracing::debug!("released unbuffered result");
        }
    }

    /// `currval` of the serial column of the table just inserted into.
    fn postgres_insert_id(&mut self, statement: &Statement) -> UnisqlResult<Option<i64>> {
        let Some(table) = statement_target(&INSERT_INTO, statement.translated()) else {
            return Ok(None);
        };
        let columns = match self.schema().get_columns(&table) {
            Ok(columns) => columns,
            Err(UnisqlError::Programmer(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let Some(column) = columns
            .iter()
            .find(|(_, info)| info.auto_increment)
            .map(|(name, _)| name.clone())
        else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT currval(pg_get_serial_sequence({}, {})) AS id",
            self.escaper.escape_native_string(&table),
            self.escaper.escape_native_string(&column)
        );
        // currval fails when the INSERT supplied its own id; keep an open
        // transaction usable if it does.
        if self.in_transaction {
            self.query_rows("SAVEPOINT unisql_insert_id")?;
        }
        let id = match self.query_rows(&sql) {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("id"))
                .and_then(Value::as_i64),
            Err(UnisqlError::Sql { .. }) => {
                if self.in_transaction {
                    self.query_rows("ROLLBACK TO SAVEPOINT unisql_insert_id")?;
                }
                None
            }
            Err(err) => return Err(err),
        };
        if self.in_transaction {
            self.query_rows("RELEASE SAVEPOINT unisql_insert_id")?;
        }
        Ok(id)
    }

    /// DROP TRIGGER statements for the triggers other tables carry on
    /// behalf of the foreign keys of the table being dropped.
    fn sqlite_trigger_cleanup(&mut self, statement: &Statement) -> UnisqlResult<Vec<String>> {
        let Some(table) = statement_target(&DROP_TABLE, statement.translated()) else {
            return Ok(Vec::new());
        };
        let rows = self.query_rows(&format!(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = {}",
            self.escaper.escape_native_string(&table)
        ))?;
        let Some(ddl) = rows.first().and_then(|row| row.get("sql")).and_then(Value::as_str) else {
            return Ok(Vec::new());
        };
        let create = CreateTable::parse(ddl)?;
        Ok(create
            .foreign_keys()
            .into_iter()
            .flat_map(|(column, _)| parent_trigger_names(&table, &column))
            .map(|name| format!("DROP TRIGGER IF EXISTS {}", Dialect::SQLite.quote_identifier(&name)))
            .collect())
    }

    pub fn escape_string<'a>(&self, value: impl Into<Option<&'a str>>) -> String {
        self.escaper.escape_string(value)
    }

    pub fn escape_blob<'a>(&self, value: impl Into<Option<&'a [u8]>>) -> String {
        self.escaper.escape_blob(value)
    }

    pub fn escape_boolean(&self, value: impl Into<Option<bool>>) -> String {
        self.escaper.escape_boolean(value)
    }

    pub fn escape_integer(&self, value: impl Into<Option<i64>>) -> String {
        self.escaper.escape_integer(value)
    }

    pub fn escape_float(&self, value: impl Into<Option<f64>>) -> UnisqlResult<String> {
        self.escaper.escape_float(value)
    }

    pub fn escape_date<'a>(&self, value: impl Into<Option<&'a str>>) -> UnisqlResult<String> {
        self.escaper.escape_date(value)
    }

    pub fn escape_time<'a>(&self, value: impl Into<Option<&'a str>>) -> UnisqlResult<String> {
        self.escaper.escape_time(value)
    }

    pub fn escape_timestamp<'a>(&self, value: impl Into<Option<&'a str>>) -> UnisqlResult<String> {
        self.escaper.escape_timestamp(value)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close connection");
        }
    }
}

fn closed() -> DriverError {
    DriverError {
        message: "the connection is closed".to_string(),
        lost_connection: true,
    }
}

/// Table named right after `prefix` in `sql`.
fn statement_target(prefix: &Regex, sql: &str) -> Option<String> {
    let head = prefix.find(sql)?;
    qualified_identifier(&sql[head.end()..]).ok().map(|(_, name)| name)
}

fn check_sqlite_file(path: &Path) -> UnisqlResult<()> {
    let Ok(mut file) = std::fs::File::open(path) else {
        return Ok(());
    };
    if file.metadata().map(|m| m.len() == 0).unwrap_or(true) {
        return Ok(());
    }
    let mut header = [0u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) if &header == SQLITE_HEADER => Ok(()),
        _ => Err(UnisqlError::environment(format!(
            "{} is not a SQLite 3 database file",
            path.display()
        ))),
    }
}
