//! Runtime configuration: recognized-key JSON file with hot-reload on mtime
//! change and atomic (temp-file + rename) writes.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),
    #[error("configuration key {key} has the wrong type: {detail}")]
    TypeMismatch { key: String, detail: String },
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write configuration file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The full set of recognized configuration keys, mirroring the JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "BUFFER_TIME")]
    pub buffer_time: f64,
    #[serde(rename = "DELAY")]
    pub delay: f64,
    #[serde(rename = "TYPING_DELAY")]
    pub typing_delay: f64,
    #[serde(rename = "INACTIVITY_TIMEOUT")]
    pub inactivity_timeout: u64,
    #[serde(rename = "GREET_PERIOD")]
    pub greet_period: u64,
    #[serde(rename = "UPDATE_BD_PERIOD")]
    pub update_bd_period: u64,
    #[serde(rename = "FLOOD_WAIT")]
    pub flood_wait: u64,
    #[serde(rename = "TIMEZONE")]
    pub timezone: String,
    #[serde(rename = "MORNING")]
    pub morning: u32,
    #[serde(rename = "NIGHT")]
    pub night: u32,
    #[serde(rename = "SECOND_GREET")]
    pub second_greet: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            buffer_time: 2.0,
            delay: 5.0,
            typing_delay: 0.1,
            inactivity_timeout: 600,
            greet_period: 300,
            update_bd_period: 3600,
            flood_wait: 60,
            timezone: "Europe/Moscow".to_string(),
            morning: 9,
            night: 21,
            second_greet: true,
        }
    }
}

fn known_keys() -> HashSet<&'static str> {
    [
        "BUFFER_TIME",
        "DELAY",
        "TYPING_DELAY",
        "INACTIVITY_TIMEOUT",
        "GREET_PERIOD",
        "UPDATE_BD_PERIOD",
        "FLOOD_WAIT",
        "TIMEZONE",
        "MORNING",
        "NIGHT",
        "SECOND_GREET",
    ]
    .into_iter()
    .collect()
}

impl AppConfig {
    /// Parses a JSON document, rejecting any key not in the recognized set.
    /// Missing keys fall back to the default for that field: we diff the key
    /// set by hand before binding into the typed struct, since `serde`'s own
    /// `deny_unknown_fields` would reject the renamed keys too eagerly when
    /// merging partial documents.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let map = value.as_object().cloned().unwrap_or_default();
        let known = known_keys();
        for key in map.keys() {
            if !known.contains(key.as_str()) {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
        }

        let mut merged = serde_json::to_value(AppConfig::default())?
            .as_object()
            .cloned()
            .unwrap_or_default();
        for (k, v) in map {
            merged.insert(k, v);
        }
        let config: AppConfig = serde_json::from_value(serde_json::Value::Object(merged))
            .map_err(ConfigError::Malformed)?;
        Ok(config)
    }

    /// Loads from `path`, returning the default configuration if the file
    /// does not exist yet.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Writes atomically: serialize to a sibling temp file, then rename over
    /// the target. Renames within the same directory are atomic on POSIX
    /// filesystems, so readers never observe a partially-written file.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        let rendered = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &rendered).map_err(|source| ConfigError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, path).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

struct Snapshot {
    config: AppConfig,
    mtime: Option<SystemTime>,
}

/// Holds the current configuration snapshot plus the file's last-observed
/// mtime behind a single mutex. Every read stats the file; if the mtime
/// advanced since the last read, the file is reloaded and the snapshot
/// swapped atomically before returning, so concurrent readers never observe
/// a torn update.
pub struct ConfigHandle {
    path: PathBuf,
    inner: Mutex<Snapshot>,
}

impl ConfigHandle {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = AppConfig::load_from(&path)?;
        let mtime = fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        Ok(Self {
            path,
            inner: Mutex::new(Snapshot { config, mtime }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current configuration, reloading from disk first if the
    /// file's mtime has advanced since the last read.
    pub fn get(&self) -> Result<AppConfig, ConfigError> {
        let current_mtime = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        let mut guard = self.inner.lock().unwrap();
        if current_mtime != guard.mtime {
            let reloaded = AppConfig::load_from(&self.path)?;
            tracing::info!(path = %self.path.display(), "configuration reloaded");
            guard.config = reloaded;
            guard.mtime = current_mtime;
        }
        Ok(guard.config.clone())
    }

    /// Updates a subset of fields and writes the result back atomically,
    /// refreshing the in-memory snapshot and mtime.
    pub fn update(&self, new_config: AppConfig) -> Result<(), ConfigError> {
        new_config.save_to(&self.path)?;
        let mtime = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        let mut guard = self.inner.lock().unwrap();
        guard.config = new_config;
        guard.mtime = mtime;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_system() {
        let c = AppConfig::default();
        assert_eq!(c.buffer_time, 2.0);
        assert_eq!(c.inactivity_timeout, 600);
        assert_eq!(c.greet_period, 300);
        assert_eq!(c.timezone, "Europe/Moscow");
        assert!(c.second_greet);
    }

    #[test]
    fn parse_rejects_unknown_key() {
        let raw = r#"{"BUFFER_TIME": 3.0, "NOT_A_KEY": 1}"#;
        let err = AppConfig::parse(raw).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "NOT_A_KEY"));
    }

    #[test]
    fn parse_merges_over_defaults() {
        let raw = r#"{"BUFFER_TIME": 3.5, "MORNING": 8}"#;
        let c = AppConfig::parse(raw).unwrap();
        assert_eq!(c.buffer_time, 3.5);
        assert_eq!(c.morning, 8);
        // untouched fields keep defaults
        assert_eq!(c.night, 21);
    }

    #[test]
    fn load_from_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        let c = AppConfig::load_from(&path).unwrap();
        assert_eq!(c, AppConfig::default());
    }

    #[test]
    fn round_trip_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut c = AppConfig::default();
        c.buffer_time = 9.5;
        c.timezone = "UTC".to_string();
        c.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, c);
    }

    #[test]
    fn save_to_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        AppConfig::default().save_to(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert!(path.exists());
    }

    #[test]
    fn handle_reloads_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        AppConfig::default().save_to(&path).unwrap();

        let handle = ConfigHandle::load(&path).unwrap();
        let first = handle.get().unwrap();
        assert_eq!(first.buffer_time, 2.0);

        // Ensure the mtime actually advances on filesystems with coarse
        // resolution before rewriting the file.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut updated = AppConfig::default();
        updated.buffer_time = 42.0;
        updated.save_to(&path).unwrap();

        let second = handle.get().unwrap();
        assert_eq!(second.buffer_time, 42.0);
    }

    #[test]
    fn handle_update_writes_and_refreshes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let handle = ConfigHandle::load(&path).unwrap();

        let mut updated = AppConfig::default();
        updated.morning = 7;
        handle.update(updated.clone()).unwrap();

        assert_eq!(handle.get().unwrap(), updated);
        assert_eq!(AppConfig::load_from(&path).unwrap(), updated);
    }
}
