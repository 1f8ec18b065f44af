//! One iteration contract over buffered and streamed query results.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::driver::DriverError;
use crate::error::{UnisqlError, UnisqlResult};
use crate::translator::{Statement, ROW_NUMBER_COLUMN};
use crate::value::Value;

/// One row, columns in select order.
pub type Row = IndexMap<String, Value>;

/// Rows streamed from an open server cursor.
///
/// Fed by a background task holding the native handle. The connection
/// marks the cursor released when another statement needs the handle.
pub struct Cursor {
    rx: mpsc::Receiver<Result<Row, DriverError>>,
    released: Arc<AtomicBool>,
}

impl Cursor {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Row, DriverError>>, released: Arc<AtomicBool>) -> Self {
        Self { rx, released }
    }

    fn pull(&mut self, statement: &Statement) -> UnisqlResult<Option<Row>> {
        if self.released.load(Ordering::Acquire) {
            return Err(UnisqlError::NoRemainingRows(
                "the result was released by a newer query on the same connection".to_string(),
            ));
        }
        match self.rx.blocking_recv() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(err)) => Err(err.into_error(statement)),
            None if self.released.load(Ordering::Acquire) => Err(UnisqlError::NoRemainingRows(
                "the result was released by a newer query on the same connection".to_string(),
            )),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

/// The native shape behind a [`ResultIterator`].
#[derive(Debug)]
pub enum NativeResult {
    /// Streamed, forward-only.
    Cursor(Cursor),
    /// Fully buffered by the driver.
    Array(Vec<Row>),
    /// Assembled row by row from a driver without native buffering.
    EmulatedArray(Vec<Row>),
}

/// Iterates the rows of one statement.
///
/// Buffered results support random access through [`seek`](Self::seek).
/// Unbuffered results move forward only.
#[derive(Debug)]
pub struct ResultIterator {
    native: NativeResult,
    statement: Statement,
    affected: u64,
    position: usize,
    /// Cursor only: the row at `position` once pulled, `None` at the end.
    current: Option<Option<Row>>,
    finished: bool,
}

fn strip_synthetic(mut row: Row) -> Row {
    row.shift_remove(ROW_NUMBER_COLUMN);
    row
}

impl ResultIterator {
    pub(crate) fn new(native: NativeResult, statement: Statement, affected: u64) -> Self {
        let native = match native {
            NativeResult::Array(rows) => {
                NativeResult::Array(rows.into_iter().map(strip_synthetic).collect())
            }
            NativeResult::EmulatedArray(rows) => {
                NativeResult::EmulatedArray(rows.into_iter().map(strip_synthetic).collect())
            }
            cursor => cursor,
        };
        Self {
            native,
            statement,
            affected,
            position: 0,
            current: None,
            finished: false,
        }
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn native(&self) -> &NativeResult {
        &self.native
    }

    pub fn is_buffered(&self) -> bool {
        !matches!(self.native, NativeResult::Cursor(_))
    }

    /// Zero-based index of the current row.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of returned rows.
    ///
    /// Unknown while streaming, so asking an unbuffered result is an error.
    pub fn row_count(&self) -> UnisqlResult<usize> {
        match &self.native {
            NativeResult::Array(rows) | NativeResult::EmulatedArray(rows) => Ok(rows.len()),
            NativeResult::Cursor(_) => Err(UnisqlError::programmer(
                "the row count of an unbuffered result is unknown until it is consumed",
            )),
        }
    }

    /// Rows changed by the statement. Always 0 for unbuffered results.
    pub fn affected_rows(&self) -> u64 {
        self.affected
    }

    fn no_row(&self) -> UnisqlError {
        UnisqlError::NoRemainingRows(format!(
            "there are no rows at position {} of the result of: {}",
            self.position,
            self.statement.original()
        ))
    }

    /// The current row, pulling it from the cursor if needed.
    pub fn current(&mut self) -> UnisqlResult<&Row> {
        if let NativeResult::Cursor(cursor) = &mut self.native {
            // A released cursor must not hand out a row it pulled earlier.
            if self.current.is_none() || cursor.released.load(Ordering::Acquire) {
                let row = cursor.pull(&self.statement)?.map(strip_synthetic);
                self.current = Some(row);
            }
        }
        let row = match &self.native {
            NativeResult::Array(rows) | NativeResult::EmulatedArray(rows) => rows.get(self.position),
            NativeResult::Cursor(_) => self.current.as_ref().and_then(Option::as_ref),
        };
        match row {
            Some(row) => Ok(row),
            None => Err(self.no_row()),
        }
    }

    /// Move to the next row.
    pub fn advance(&mut self) {
        self.position += 1;
        self.current = None;
    }

    /// Whether a row exists at the current position.
    pub fn valid(&mut self) -> UnisqlResult<bool> {
        match self.current().map(|_| ()) {
            Ok(()) => Ok(true),
            Err(UnisqlError::NoRemainingRows(_)) if !self.released() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn released(&self) -> bool {
        match &self.native {
            NativeResult::Cursor(cursor) => cursor.released.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Jump to row `index`.
    ///
    /// Buffered results accept any index in `0..row_count()`. Unbuffered results
    /// only move forward, skipping rows.
    pub fn seek(&mut self, index: usize) -> UnisqlResult<()> {
        if self.is_buffered() {
            let count = self.row_count()?;
            if index >= count {
                return Err(UnisqlError::programmer(format!(
                    "cannot seek to row {index} of a result with {count} rows"
                )));
            }
            self.position = index;
            self.finished = false;
            return Ok(());
        }
        if index < self.position {
            return Err(UnisqlError::programmer(
                "an unbuffered result cannot be rewound once a row has been consumed",
            ));
        }
        while self.position < index {
            self.reach(index)?;
            self.advance();
        }
        self.reach(index)
    }

    fn reach(&mut self, index: usize) -> UnisqlResult<()> {
        match self.current().map(|_| ()) {
            Ok(()) => Ok(()),
            Err(UnisqlError::NoRemainingRows(_)) if !self.released() => Err(
                UnisqlError::programmer(format!("row {index} is past the end of the result")),
            ),
            Err(err) => Err(err),
        }
    }

    /// Back to the first row.
    pub fn rewind(&mut self) -> UnisqlResult<()> {
        if !self.is_buffered() && self.position > 0 {
            return Err(UnisqlError::programmer(
                "an unbuffered result cannot be rewound once a row has been consumed",
            ));
        }
        self.position = 0;
        self.finished = false;
        Ok(())
    }

    /// Fail with `NoResults` if the statement returned nothing.
    pub fn ensure_rows(&mut self) -> UnisqlResult<()> {
        let empty = if self.is_buffered() {
            self.row_count()? == 0
        } else {
            self.position == 0 && !self.valid()?
        };
        if empty {
            return Err(UnisqlError::NoResults(format!(
                "no rows were returned for: {}",
                self.statement.original()
            )));
        }
        Ok(())
    }

    /// The current row, then advance.
    pub fn fetch_row(&mut self) -> UnisqlResult<Row> {
        let row = if self.is_buffered() {
            self.current()?.clone()
        } else {
            self.current()?;
            self.current.take().flatten().ok_or_else(|| self.no_row())?
        };
        self.advance();
        Ok(row)
    }

    /// Every row from the current position on.
    pub fn fetch_all_rows(&mut self) -> UnisqlResult<Vec<Row>> {
        let mut rows = Vec::new();
        while self.valid()? {
            rows.push(self.fetch_row()?);
        }
        Ok(rows)
    }

    /// First column of the current row.
    pub fn fetch_scalar(&mut self) -> UnisqlResult<Value> {
        let row = self.current()?;
        row.values()
            .next()
            .cloned()
            .ok_or_else(|| UnisqlError::programmer("the current row has no columns"))
    }
}

impl Iterator for ResultIterator {
    type Item = UnisqlResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.valid() {
            Ok(true) => Some(self.fetch_row()),
            Ok(false) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
