//! Key-value configuration stores implementing [`ConfigPort`].
//!
//! - [`MemoryConfig`]: process-local map, for tests and simulation runs.
//! - [`JsonFileConfig`]: one flat JSON object on disk.  Every `set` writes
//!   a temporary file next to the target and renames it over, so a crash
//!   never leaves a half-written document.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{error, info, warn};
use serde_json::Value;

use crate::app::ports::{ConfigError, ConfigPort};
use crate::sync::lock;

// ───────────────────────────────────────────────────────────────
// In-memory store
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryConfig {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigPort for MemoryConfig {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        lock(&self.values).insert(key.to_owned(), value);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// JSON file store
// ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct JsonFileConfig {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileConfig {
    /// Open `path`.  A missing file is an empty store; it is created on
    /// the first `set`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<BTreeMap<String, Value>>(&text).map_err(|e| {
                error!("Config file {} is corrupted: {e}", path.display());
                ConfigError::Corrupted
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                error!("Reading config file {} failed: {e}", path.display());
                return Err(ConfigError::IoError);
            }
        };
        info!("Config store {} ({} keys)", path.display(), values.len());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(values).map_err(|_| ConfigError::IoError)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let written = fs::File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(text.as_bytes())?;
                f.sync_all()
            })
            .and_then(|()| fs::rename(&tmp, &self.path));
        written.map_err(|e| {
            error!("Writing config file {} failed: {e}", self.path.display());
            let _ = fs::remove_file(&tmp);
            ConfigError::IoError
        })
    }
}

impl ConfigPort for JsonFileConfig {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut values = lock(&self.values);
        let previous = values.insert(key.to_owned(), value);
        if let Err(e) = self.persist(&values) {
            // Keep memory in step with disk.
            match previous {
                Some(v) => values.insert(key.to_owned(), v),
                None => values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}
