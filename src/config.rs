use crate::error::OlapError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Write-ahead logs at or above this size are dropped before open; replaying
/// them can take long enough to look like a hang.
pub const DEFAULT_WAL_SIZE_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Runtime configuration for an [`crate::OlapManager`].
///
/// Deserializes from the driver property map, so unknown keys are ignored and
/// every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OlapConfig {
    /// Engine DSN. Empty or `:memory:` means an in-memory database; anything
    /// else is a file path optionally followed by `?key=value` options.
    pub dsn: String,
    /// Total connection budget. One slot is reserved for meta queries, the
    /// rest (at least one) for OLAP queries.
    pub pool_size: usize,
    pub allow_host_access: bool,
    /// Store each table in its own versioned database file.
    pub external_table_storage: bool,
    /// Root for external table storage. Defaults to `<db>.tables` next to the
    /// database file. Recovery owns every subdirectory of the root.
    pub external_storage_path: Option<PathBuf>,
    /// Fail on a database file written by an incompatible engine version
    /// instead of deleting and recreating it.
    pub error_on_incompatible_version: bool,
    pub wal_size_threshold_bytes: u64,
    /// Upper bound on waiting for a connection. `None` waits until cancelled.
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for OlapConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            pool_size: std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(2))
                .unwrap_or(2),
            allow_host_access: false,
            external_table_storage: false,
            external_storage_path: None,
            error_on_incompatible_version: false,
            wal_size_threshold_bytes: DEFAULT_WAL_SIZE_THRESHOLD_BYTES,
            acquire_timeout_ms: None,
        }
    }
}

impl OlapConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            dsn: path.into().display().to_string(),
            ..Self::default()
        }
    }

    /// Builds a config from driver properties such as
    /// `{"dsn": "main.db", "pool_size": 4, "external_table_storage": true}`.
    pub fn from_properties(
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, OlapError> {
        let config: OlapConfig = serde_json::from_value(serde_json::Value::Object(properties))
            .map_err(|e| OlapError::InvalidConfig {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_external_table_storage(mut self, enabled: bool) -> Self {
        self.external_table_storage = enabled;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn validate(&self) -> Result<(), OlapError> {
        if self.pool_size == 0 {
            return Err(OlapError::InvalidConfig {
                message: "pool_size must be > 0".into(),
            });
        }
        if self.wal_size_threshold_bytes == 0 {
            return Err(OlapError::InvalidConfig {
                message: "wal_size_threshold_bytes must be > 0".into(),
            });
        }
        if self.acquire_timeout_ms == Some(0) {
            return Err(OlapError::InvalidConfig {
                message: "acquire_timeout_ms must be > 0 when set".into(),
            });
        }
        if self.external_table_storage && self.storage_root().is_none() {
            return Err(OlapError::InvalidConfig {
                message: "external_table_storage requires a file-backed dsn or external_storage_path"
                    .into(),
            });
        }
        Ok(())
    }

    /// Database file path, or `None` for an in-memory database.
    pub fn db_file_path(&self) -> Option<PathBuf> {
        let path = self.dsn.split('?').next().unwrap_or_default();
        if path.is_empty() || path == ":memory:" {
            None
        } else {
            Some(PathBuf::from(path))
        }
    }

    pub fn is_file_backed(&self) -> bool {
        self.db_file_path().is_some()
    }

    pub fn tmp_dir_path(&self) -> Option<PathBuf> {
        self.db_file_path().map(|p| sibling(&p, ".tmp"))
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.db_file_path().map(|p| sibling(&p, ".wal"))
    }

    /// Root directory for external table storage.
    pub fn storage_root(&self) -> Option<PathBuf> {
        if let Some(path) = &self.external_storage_path {
            return Some(path.clone());
        }
        self.db_file_path().map(|p| match p.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        })
    }

    /// Capacity of the OLAP pool: the total budget minus the meta slot.
    pub fn olap_capacity(&self) -> usize {
        self.pool_size.saturating_sub(1).max(1)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

fn sibling(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
