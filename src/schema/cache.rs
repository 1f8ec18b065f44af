//! Memoized schema metadata, optionally persisted to a JSON file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{ColumnInfo, KeySet};
use crate::error::{UnisqlError, UnisqlResult};

/// The persisted shape of the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CacheData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tables: Option<Vec<String>>,
    #[serde(default)]
    columns: IndexMap<String, IndexMap<String, ColumnInfo>>,
    #[serde(default)]
    keys: IndexMap<String, KeySet>,
}

/// Manually supplied metadata, merged over fetched metadata.
#[derive(Debug, Default)]
struct Overrides {
    columns: IndexMap<String, IndexMap<String, ColumnInfo>>,
    keys: IndexMap<String, KeySet>,
}

/// Table metadata shared by one or more connections to the same database.
///
/// Lookups take a shared lock; populating a table takes the write lock only
/// for the insert of that table's columns and keys together. Entries live until [`flush`](Self::flush).
/// A cache created with [`open`](Self::open) is written back on
/// [`persist`](Self::persist) or drop, and only if something changed.
#[derive(Debug, Default)]
pub struct SchemaCache {
    data: RwLock<CacheData>,
    overrides: RwLock<Overrides>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl SchemaCache {
    /// An in-memory cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache backed by `path`, primed from it when the file exists.
    pub fn open(path: impl AsRef<Path>) -> UnisqlResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let meta = std::fs::metadata(&path)?;
            if meta.permissions().readonly() {
                return Err(UnisqlError::environment(format!(
                    "schema cache file {} is not writable",
                    path.display()
                )));
            }
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                CacheData::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            CacheData::default()
        };
        tracing::debug!(path = %path.display(), tables = data.columns.len(), "schema cache loaded");
        Ok(Self {
            data: RwLock::new(data),
            overrides: RwLock::new(Overrides::default()),
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn tables(&self) -> Option<Vec<String>> {
        self.data.read().tables.clone()
    }

    pub fn put_tables(&self, tables: Vec<String>) {
        self.data.write().tables = Some(tables);
        self.touch();
    }

    /// Columns of `table` with overrides applied.
    pub fn columns(&self, table: &str) -> Option<IndexMap<String, ColumnInfo>> {
        let mut columns = self.data.read().columns.get(table).cloned()?;
        if let Some(extra) = self.overrides.read().columns.get(table) {
            for (name, info) in extra {
                columns.insert(name.clone(), info.clone());
            }
        }
        Some(columns)
    }

    /// Store the columns and keys of `table` under one write.
    pub fn put_table(&self, table: &str, columns: IndexMap<String, ColumnInfo>, keys: KeySet) {
        let mut data = self.data.write();
        data.columns.insert(table.to_string(), columns);
        data.keys.insert(table.to_string(), keys);
        drop(data);
        self.touch();
    }

    /// Keys of `table`, replaced wholesale by an override if one exists.
    pub fn keys(&self, table: &str) -> Option<KeySet> {
        let keys = self.data.read().keys.get(table).cloned()?;
        Some(self.overrides.read().keys.get(table).cloned().unwrap_or(keys))
    }

    /// Override (or add) one column's metadata.
    pub fn override_column(&self, table: &str, column: &str, info: ColumnInfo) {
        self.overrides
            .write()
            .columns
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), info);
    }

    /// Override a table's keys.
    pub fn override_keys(&self, table: &str, keys: KeySet) {
        self.overrides.write().keys.insert(table.to_string(), keys);
    }

    /// Forget every fetched entry. Overrides are kept.
    pub fn flush(&self) {
        let mut data = self.data.write();
        if *data != CacheData::default() {
            *data = CacheData::default();
            self.touch();
        }
    }

    /// Write the cache file if anything changed since it was loaded.
    pub fn persist(&self) -> UnisqlResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.is_dirty() {
            return Ok(());
        }
        let json = serde_json::to_string(&*self.data.read())?;
        std::fs::write(path, json)?;
        self.dirty.store(false, Ordering::Release);
        tracing::debug!(path = %path.display(), "schema cache written");
        Ok(())
    }
}

impl Drop for SchemaCache {
    fn drop(&mut self) {
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to write schema cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, ForeignKey, FkAction};
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    fn sample_columns() -> IndexMap<String, ColumnInfo> {
        let mut id = ColumnInfo::new(ColumnType::Integer);
        id.auto_increment = true;
        id.not_null = true;
        let mut name = ColumnInfo::new(ColumnType::Varchar);
        name.max_length = Some(50);
        name.default = Some(Value::Text("anon".into()));
        let mut score = ColumnInfo::new(ColumnType::Float);
        score.default = Some(Value::Float(1.5));
        IndexMap::from([
            ("id".to_string(), id),
            ("name".to_string(), name),
            ("score".to_string(), score),
        ])
    }

    #[test]
    fn test_overrides_take_precedence() {
        let cache = SchemaCache::new();
        cache.put_table("users", sample_columns(), KeySet::default());
        let mut name = ColumnInfo::new(ColumnType::Text);
        name.not_null = true;
        cache.override_column("users", "name", name.clone());

        let columns = cache.columns("users").unwrap();
        assert_eq!(columns["name"], name);
        assert_eq!(columns.len(), 3);
    }

    #[test]
    fn test_readers_never_see_half_a_table() {
        let cache = SchemaCache::new();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200 {
                    cache.put_table(&format!("t{i}"), sample_columns(), KeySet::default());
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    for i in 0..200 {
                        let table = format!("t{i}");
                        if cache.columns(&table).is_some() {
                            assert!(cache.keys(&table).is_some(), "{table}");
                        }
                    }
                });
            }
        });
        assert_eq!(cache.columns("t199"), Some(sample_columns()));
    }

    #[test]
    fn test_flush_forgets_entries() {
        let cache = SchemaCache::new();
        cache.put_tables(vec!["users".into()]);
        cache.put_table("users", sample_columns(), KeySet::default());
        cache.flush();
        assert!(cache.columns("users").is_none());
        assert!(cache.tables().is_none());
    }

    #[test]
    fn test_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let keys = KeySet {
            primary: vec!["id".into()],
            unique: vec![vec!["name".into()]],
            foreign: vec![ForeignKey {
                column: "team_id".into(),
                foreign_table: "teams".into(),
                foreign_column: "id".into(),
                on_delete: FkAction::Cascade,
                on_update: FkAction::NoAction,
            }],
        };

        {
            let cache = SchemaCache::open(&path).unwrap();
            assert!(!cache.is_dirty());
            cache.put_table("users", sample_columns(), keys.clone());
        }

        let cache = SchemaCache::open(&path).unwrap();
        assert_eq!(cache.columns("users"), Some(sample_columns()));
        assert_eq!(cache.keys("users"), Some(keys));
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_clean_cache_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let cache = SchemaCache::open(&path).unwrap();
        cache.persist().unwrap();
        assert!(!path.exists());
    }
}
