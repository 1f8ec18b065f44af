//! # unisql
//!
//! Write SQL once in a small canonical dialect and run it unchanged on
//! MySQL, PostgreSQL, SQLite and SQL Server.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use unisql::prelude::*;
//!
//! // Translate only
//! let stmt = unisql::translate("SELECT * FROM users WHERE active = TRUE LIMIT 5 OFFSET 10", Dialect::SqlServer)?;
//! println!("{}", stmt.translated());
//!
//! // Or run it
//! let mut conn = Connection::open("sqlite://app.db")?;
//! for row in conn.execute_unbuffered("SELECT id, email FROM users")? {
//!     println!("{:?}", row?);
//! }
//! ```
//!
//! ## Canonical dialect
//!
//! | Canonical            | Meaning                                   |
//! |----------------------|-------------------------------------------|
//! | `varchar` ... `blob` | Ten portable column types                 |
//! | `TRUE` / `FALSE`     | Boolean literals                          |
//! | `AUTOINCREMENT`      | Identity column                           |
//! | `diff_seconds(a, b)` | Seconds from `b` to `a`                   |
//! | `add_interval(e, s)` | `e` shifted by `'+1 year -2 days'` etc.   |
//! | `LIMIT n OFFSET m`   | Row window, emulated where unsupported    |
//! | `a \|\| b`           | String concatenation                      |

pub mod clause;
pub mod config;
pub mod connection;
pub mod ddl;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod escape;
pub mod result;
pub mod schema;
pub mod tokenizer;
pub mod translator;
pub mod value;

pub mod prelude {
    pub use crate::clause::{
        parse_joins, parse_select_clauses, Clause, ClauseMap, FromClause, JoinDescriptor, JoinType,
        OnClause,
    };
    pub use crate::connection::{ConnectOptions, Connection, Execution, QueryOutcome};
    pub use crate::dialect::{Dialect, Driver};
    pub use crate::error::*;
    pub use crate::escape::Escaper;
    pub use crate::result::{NativeResult, ResultIterator, Row};
    pub use crate::schema::{
        ColumnInfo, ColumnType, FkAction, ForeignKey, Introspector, KeySet, Relationship,
        RelationshipKind, Relationships, SchemaCache, SchemaSource, StaticSchema,
    };
    pub use crate::translator::{Statement, StatementKind, Translator};
    pub use crate::value::Value;
}

/// Translate canonical SQL into `dialect`.
///
/// # Example
///
/// ```
/// use unisql::dialect::Dialect;
///
/// let stmt = unisql::translate("SELECT * FROM t WHERE flag = TRUE", Dialect::SQLite).unwrap();
/// assert_eq!(stmt.translated(), "SELECT * FROM t WHERE flag = 1");
/// ```
pub fn translate(sql: &str, dialect: dialect::Dialect) -> error::UnisqlResult<translator::Statement> {
    translator::translate(sql, dialect)
}
