//! Named connection profiles.
//!
//! Read from `./unisql.toml`, falling back to `<config dir>/unisql/config.toml`:
//!
//! ```toml
//! default = "local"
//!
//! [connections.local]
//! url = "sqlite://app.db"
//!
//! [connections.reporting]
//! url = "postgres://report@db.internal/warehouse"
//! slow_query_ms = 250
//! schema_cache = "/var/cache/unisql/warehouse.json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::connection::ConnectOptions;
use crate::error::{UnisqlError, UnisqlResult};

pub const LOCAL_CONFIG: &str = "unisql.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default: Option<String>,
    #[serde(default)]
    pub connections: IndexMap<String, Profile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub url: String,
    pub slow_query_ms: Option<u64>,
    pub schema_cache: Option<PathBuf>,
}

impl Profile {
    pub fn connect_options(&self) -> UnisqlResult<ConnectOptions> {
        let mut options = ConnectOptions::from_url(&self.url)?;
        options.slow_query_threshold = self.slow_query_ms.map(Duration::from_millis);
        options.schema_cache = self.schema_cache.clone();
        Ok(options)
    }
}

impl Config {
    /// Load the first config file found. No file means an empty config.
    pub fn load() -> UnisqlResult<Self> {
        match Self::locate() {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    fn locate() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("unisql").join("config.toml"))
            .filter(|path| path.exists())
    }

    pub fn from_file(path: &Path) -> UnisqlResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| UnisqlError::configuration(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> UnisqlResult<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| UnisqlError::configuration(format!("invalid config: {e}")))?;
        if let Some(default) = &config.default {
            if !config.connections.contains_key(default) {
                return Err(UnisqlError::configuration(format!(
                    "default profile '{default}' is not defined"
                )));
            }
        }
        Ok(config)
    }

    /// Options for the named profile, or the default one.
    pub fn profile(&self, name: Option<&str>) -> UnisqlResult<ConnectOptions> {
        let name = name.or(self.default.as_deref()).ok_or_else(|| {
            UnisqlError::configuration("no profile named and no default profile configured")
        })?;
        self.connections
            .get(name)
            .ok_or_else(|| UnisqlError::configuration(format!("unknown profile '{name}'")))?
            .connect_options()
    }
}
