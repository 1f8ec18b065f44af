//! Schema introspection.
//!
//! Column and key metadata is fetched from each backend in whatever form it
//! offers (catalog views, `SHOW CREATE TABLE`, stored DDL), normalized into
//! [`ColumnInfo`] and [`KeySet`], memoized in a [`SchemaCache`], and used to
//! derive table [`Relationships`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut conn = Connection::open("sqlite::memory:")?;
//! let mut schema = conn.schema();
//! let rels = schema.get_relationships("users")?;
//! for rel in &rels.one_to_many {
//!     println!("{} -> {}.{}", rel.column, rel.related_table, rel.related_column);
//! }
//! ```

mod cache;
mod fetch;
mod types;

pub use cache::SchemaCache;
pub use types::map_native_type;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::connection::Connection;
use crate::ddl::CreateTable;
use crate::dialect::Dialect;
use crate::error::{UnisqlError, UnisqlResult};
use crate::value::Value;

/// Canonical column types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Varchar,
    Char,
    Text,
    Integer,
    Float,
    Timestamp,
    Date,
    Time,
    Boolean,
    Blob,
    /// A native type with no canonical equivalent, passed through lowercased.
    Other(String),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Varchar => "varchar",
            ColumnType::Char => "char",
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Boolean => "boolean",
            ColumnType::Blob => "blob",
            ColumnType::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// Normalized metadata of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub not_null: bool,
    pub default: Option<Value>,
    pub max_length: Option<u32>,
    pub decimal_places: Option<u32>,
    pub valid_values: Option<Vec<String>>,
    pub auto_increment: bool,
}

impl ColumnInfo {
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            column_type,
            not_null: false,
            default: None,
            max_length: None,
            decimal_places: None,
            valid_values: None,
            auto_increment: false,
        }
    }
}

/// Referential action of a foreign key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FkAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl FkAction {
    /// Parse `CASCADE`, `set null`, `NO_ACTION` and similar spellings.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s
            .split(|c: char| c.is_whitespace() || c == '_')
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        match normalized.as_str() {
            "NO ACTION" => Some(FkAction::NoAction),
            "RESTRICT" => Some(FkAction::Restrict),
            "CASCADE" => Some(FkAction::Cascade),
            "SET NULL" => Some(FkAction::SetNull),
            "SET DEFAULT" => Some(FkAction::SetDefault),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            FkAction::NoAction => "NO ACTION",
            FkAction::Restrict => "RESTRICT",
            FkAction::Cascade => "CASCADE",
            FkAction::SetNull => "SET NULL",
            FkAction::SetDefault => "SET DEFAULT",
        }
    }
}

/// A single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub foreign_table: String,
    pub foreign_column: String,
    pub on_delete: FkAction,
    pub on_update: FkAction,
}

/// Primary, unique and foreign keys of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    pub primary: Vec<String>,
    pub unique: Vec<Vec<String>>,
    pub foreign: Vec<ForeignKey>,
}

impl KeySet {
    /// Whether `column` alone forms a unique or primary key.
    pub fn is_single_unique(&self, column: &str) -> bool {
        let single = |cols: &Vec<String>| cols.len() == 1 && cols[0] == column;
        single(&self.primary) || self.unique.iter().any(single)
    }
}

/// Kind of a derived relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

/// A relationship between `table` and `related_table`.
///
/// `column` always belongs to `table` and `related_column` to
/// `related_table`. Many-to-many relationships also name the join table and
/// its two columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub table: String,
    pub column: String,
    pub related_table: String,
    pub related_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_related_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<FkAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_update: Option<FkAction>,
}

/// Relationships of one table, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationships {
    pub one_to_one: Vec<Relationship>,
    pub many_to_one: Vec<Relationship>,
    pub one_to_many: Vec<Relationship>,
    pub many_to_many: Vec<Relationship>,
}

impl Relationships {
    /// All relationships with their kind.
    pub fn iter(&self) -> impl Iterator<Item = (RelationshipKind, &Relationship)> {
        self.one_to_one
            .iter()
            .map(|r| (RelationshipKind::OneToOne, r))
            .chain(self.many_to_one.iter().map(|r| (RelationshipKind::ManyToOne, r)))
            .chain(self.one_to_many.iter().map(|r| (RelationshipKind::OneToMany, r)))
            .chain(self.many_to_many.iter().map(|r| (RelationshipKind::ManyToMany, r)))
    }

    /// The name distinguishing one path to `related_table` from the others:
    /// the foreign key column, or the join table for many-to-many.
    pub fn route(kind: RelationshipKind, rel: &Relationship) -> &str {
        match kind {
            // Only the referenced side of a one-to-one carries actions.
            RelationshipKind::OneToOne if rel.on_delete.is_some() => &rel.related_column,
            RelationshipKind::OneToOne | RelationshipKind::ManyToOne => &rel.column,
            RelationshipKind::OneToMany => &rel.related_column,
            RelationshipKind::ManyToMany => rel.join_table.as_deref().unwrap_or(&rel.related_table),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Anything that can answer schema questions.
///
/// Implemented by the live [`Introspector`] and by [`StaticSchema`].
pub trait SchemaSource {
    fn get_tables(&mut self) -> UnisqlResult<Vec<String>>;
    fn get_columns(&mut self, table: &str) -> UnisqlResult<IndexMap<String, ColumnInfo>>;
    fn get_keys(&mut self, table: &str) -> UnisqlResult<KeySet>;

    fn get_column(&mut self, table: &str, column: &str) -> UnisqlResult<ColumnInfo> {
        self.get_columns(table)?
            .shift_remove(column)
            .ok_or_else(|| {
                UnisqlError::programmer(format!("column '{column}' does not exist in table '{table}'"))
            })
    }

    fn get_relationships(&mut self, table: &str) -> UnisqlResult<Relationships> {
        derive_relationships(self, table)
    }
}

fn is_join_table(column_count: usize, keys: &KeySet) -> bool {
    column_count == 2
        && keys.primary.len() == 2
        && keys.foreign.len() == 2
        && keys
            .primary
            .iter()
            .all(|pk| keys.foreign.iter().any(|fk| &fk.column == pk))
}

/// Derive the relationships of `table` from the keys of every table.
///
/// A join table (two columns, both primary key and both foreign key) yields
/// one many-to-many relationship per side and nothing else. Any other
/// foreign key yields many-to-one on the referencing side and one-to-many on
/// the referenced side, or one-to-one on both sides when the column is a
/// single-column unique key.
pub fn derive_relationships<S: SchemaSource + ?Sized>(
    source: &mut S,
    table: &str,
) -> UnisqlResult<Relationships> {
    let tables = source.get_tables()?;
    if !tables.iter().any(|t| t == table) {
        return Err(UnisqlError::programmer(format!("table '{table}' does not exist")));
    }

    let mut shapes = Vec::with_capacity(tables.len());
    for name in &tables {
        let keys = source.get_keys(name)?;
        let column_count = source.get_columns(name)?.len();
        let join = is_join_table(column_count, &keys);
        shapes.push((name.as_str(), keys, join));
    }

    let mut rels = Relationships::default();

    for (name, keys, join) in &shapes {
        if *join {
            for (i, fk) in keys.foreign.iter().enumerate() {
                if fk.foreign_table != table {
                    continue;
                }
                let other = &keys.foreign[1 - i];
                rels.many_to_many.push(Relationship {
                    table: table.to_string(),
                    column: fk.foreign_column.clone(),
                    related_table: other.foreign_table.clone(),
                    related_column: other.foreign_column.clone(),
                    join_table: Some(name.to_string()),
                    join_column: Some(fk.column.clone()),
                    join_related_column: Some(other.column.clone()),
                    on_delete: Some(fk.on_delete),
                    on_update: Some(fk.on_update),
                });
            }
            continue;
        }

        if *name == table {
            for fk in &keys.foreign {
                let rel = Relationship {
                    table: table.to_string(),
                    column: fk.column.clone(),
                    related_table: fk.foreign_table.clone(),
                    related_column: fk.foreign_column.clone(),
                    join_table: None,
                    join_column: None,
                    join_related_column: None,
                    on_delete: None,
                    on_update: None,
                };
                if keys.is_single_unique(&fk.column) {
                    rels.one_to_one.push(rel);
                } else {
                    rels.many_to_one.push(rel);
                }
            }
        }

        for fk in keys.foreign.iter().filter(|fk| fk.foreign_table == table) {
            let rel = Relationship {
                table: table.to_string(),
                column: fk.foreign_column.clone(),
                related_table: name.to_string(),
                related_column: fk.column.clone(),
                join_table: None,
                join_column: None,
                join_related_column: None,
                on_delete: Some(fk.on_delete),
                on_update: Some(fk.on_update),
            };
            if keys.is_single_unique(&fk.column) {
                rels.one_to_one.push(rel);
            } else {
                rels.one_to_many.push(rel);
            }
        }
    }

    Ok(rels)
}

/// Convert a parsed `CREATE TABLE` into column and key metadata.
pub(crate) fn from_create_table(
    dialect: Dialect,
    table: &CreateTable,
) -> (IndexMap<String, ColumnInfo>, KeySet) {
    let mut columns = IndexMap::new();
    let primary = table.primary_key();

    let table_checks: Vec<&str> = table
        .constraints
        .iter()
        .filter_map(|c| match c {
            crate::ddl::TableConstraint::Check { expr, .. } => Some(expr.as_str()),
            _ => None,
        })
        .collect();

    for def in &table.columns {
        let mut info = types::column_info(dialect, &def.type_name);
        let single_pk = primary.len() == 1 && primary[0].eq_ignore_ascii_case(&def.name);
        info.not_null = def.not_null || (single_pk && dialect != Dialect::SQLite);
        info.auto_increment = def.auto_increment
            || (dialect == Dialect::SQLite
                && single_pk
                && def.type_name.eq_ignore_ascii_case("integer"));
        if dialect == Dialect::SQLite && single_pk && info.auto_increment {
            info.not_null = true;
        }
        info.default = def.default.as_deref().and_then(types::normalize_default);
        if info.valid_values.is_none() {
            info.valid_values = def
                .check
                .iter()
                .map(String::as_str)
                .chain(table_checks.iter().copied())
                .find_map(|expr| crate::ddl::check_valid_values(expr, &def.name));
        }
        columns.insert(def.name.clone(), info);
    }

    let foreign = table
        .foreign_keys()
        .into_iter()
        .map(|(column, reference)| ForeignKey {
            column,
            // Empty when the clause names no column; resolved to the
            // referenced primary key once that table is known.
            foreign_column: reference.columns.first().cloned().unwrap_or_default(),
            foreign_table: reference.table,
            on_delete: reference.on_delete,
            on_update: reference.on_update,
        })
        .collect();

    let keys = KeySet {
        primary,
        unique: table.unique_keys(),
        foreign,
    };
    (columns, keys)
}

/// An in-memory schema built from `CREATE TABLE` text.
///
/// Lets the join resolver and the CLI work without a live connection.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema {
    tables: IndexMap<String, (IndexMap<String, ColumnInfo>, KeySet)>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a script of `CREATE TABLE` statements.
    pub fn from_ddl(dialect: Dialect, script: &str) -> UnisqlResult<Self> {
        let mut schema = Self::new();
        for stmt in crate::tokenizer::split_statements(script) {
            let table = CreateTable::parse(&stmt)?;
            let (columns, keys) = from_create_table(dialect, &table);
            schema.insert(table.name, columns, keys);
        }
        let primaries: IndexMap<String, Vec<String>> = schema
            .tables
            .iter()
            .map(|(name, (_, keys))| (name.clone(), keys.primary.clone()))
            .collect();
        for (_, keys) in schema.tables.values_mut() {
            for fk in keys.foreign.iter_mut().filter(|fk| fk.foreign_column.is_empty()) {
                if let Some(pk) = primaries.get(&fk.foreign_table).filter(|pk| pk.len() == 1) {
                    fk.foreign_column = pk[0].clone();
                }
            }
        }
        Ok(schema)
    }

    pub fn insert(&mut self, table: impl Into<String>, columns: IndexMap<String, ColumnInfo>, keys: KeySet) {
        self.tables.insert(table.into(), (columns, keys));
    }

    fn table(&self, table: &str) -> UnisqlResult<&(IndexMap<String, ColumnInfo>, KeySet)> {
        self.tables
            .get(table)
            .ok_or_else(|| UnisqlError::programmer(format!("table '{table}' does not exist")))
    }
}

impl SchemaSource for StaticSchema {
    fn get_tables(&mut self) -> UnisqlResult<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    fn get_columns(&mut self, table: &str) -> UnisqlResult<IndexMap<String, ColumnInfo>> {
        Ok(self.table(table)?.0.clone())
    }

    fn get_keys(&mut self, table: &str) -> UnisqlResult<KeySet> {
        Ok(self.table(table)?.1.clone())
    }
}

/// Live schema access through a connection, memoized in its [`SchemaCache`].
pub struct Introspector<'c> {
    conn: &'c mut Connection,
}

impl<'c> Introspector<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        Self { conn }
    }

    /// Drop every memoized entry so the next lookup refetches.
    pub fn flush(&mut self) {
        self.conn.schema_cache().flush();
    }

    fn ensure_table(&mut self, table: &str) -> UnisqlResult<()> {
        if self.get_tables()?.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(UnisqlError::programmer(format!("table '{table}' does not exist")))
        }
    }

    fn fetch_table(&mut self, table: &str) -> UnisqlResult<()> {
        self.ensure_table(table)?;
        let (columns, keys) = fetch::table(self.conn, table)?;
        self.conn.schema_cache().put_table(table, columns, keys);
        Ok(())
    }
}

impl SchemaSource for Introspector<'_> {
    fn get_tables(&mut self) -> UnisqlResult<Vec<String>> {
        if let Some(tables) = self.conn.schema_cache().tables() {
            return Ok(tables);
        }
        let tables = fetch::tables(self.conn)?;
        self.conn.schema_cache().put_tables(tables.clone());
        Ok(tables)
    }

    fn get_columns(&mut self, table: &str) -> UnisqlResult<IndexMap<String, ColumnInfo>> {
        if self.conn.schema_cache().columns(table).is_none() {
            self.fetch_table(table)?;
        }
        self.conn
            .schema_cache()
            .columns(table)
            .ok_or_else(|| UnisqlError::programmer(format!("table '{table}' does not exist")))
    }

    fn get_keys(&mut self, table: &str) -> UnisqlResult<KeySet> {
        if self.conn.schema_cache().keys(table).is_none() {
            self.fetch_table(table)?;
        }
        self.conn
            .schema_cache()
            .keys(table)
            .ok_or_else(|| UnisqlError::programmer(format!("table '{table}' does not exist")))
    }
}
