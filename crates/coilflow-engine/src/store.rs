/*!
 * Durable storage of the last-used connection profile.
 */
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use coilflow_devices::ConnectionProfile;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// Load and save the single connection profile record
#[async_trait]
pub trait ProfileStore: Send + Sync + std::fmt::Debug {
    /// The stored profile, `None` if nothing was saved yet
    async fn load(&self) -> Result<Option<ConnectionProfile>>;

    /// Replace the stored profile
    async fn save(&self, profile: &ConnectionProfile) -> Result<()>;
}

/// Load the stored profile, falling back to `default` when it is absent or unreadable
pub async fn load_or_default(store: &dyn ProfileStore, default: ConnectionProfile) -> ConnectionProfile {
    match store.load().await {
        Ok(Some(profile)) => {
            debug!("Loaded stored connection profile {}", profile);
            profile
        }
        Ok(None) => {
            debug!("No stored connection profile, using {}", default);
            default
        }
        Err(e) => {
            warn!("Ignoring unreadable connection profile ({}), using {}", e, default);
            default
        }
    }
}

/// Profile kept as a JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonFileProfileStore {
    path: PathBuf,
}

impl JsonFileProfileStore {
    /// Store backed by `path`
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ProfileStore for JsonFileProfileStore {
    async fn load(&self) -> Result<Option<ConnectionProfile>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BridgeError::store(format!("cannot read {}: {}", self.path.display(), e)))
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| BridgeError::store(format!("cannot parse {}: {}", self.path.display(), e)))
    }

    async fn save(&self, profile: &ConnectionProfile) -> Result<()> {
        let json = serde_json::to_string_pretty(profile)?;
        let fail = |e: std::io::Error| BridgeError::store(format!("cannot write {}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(fail)?;
            }
        }

        // Readers see either the old or the new record, never a torn one
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await.map_err(fail)?;
        tokio::fs::rename(&temp, &self.path).await.map_err(fail)?;
        debug!("Saved connection profile to {}", self.path.display());
        Ok(())
    }
}

/// Profile kept in memory
#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profile: Mutex<Option<ConnectionProfile>>,
}

impl MemoryProfileStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents
    pub fn profile(&self) -> Option<ConnectionProfile> {
        self.profile.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load(&self) -> Result<Option<ConnectionProfile>> {
        Ok(self.profile())
    }

    async fn save(&self, profile: &ConnectionProfile) -> Result<()> {
        *self.profile.lock().unwrap_or_else(PoisonError::into_inner) = Some(profile.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileProfileStore::new(dir.path().join("plc-connection.json"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileProfileStore::new(dir.path().join("data").join("plc-connection.json"));
        let profile = ConnectionProfile::serial("/dev/ttyUSB1", 19200).with_unit_id(4);

        store.save(&profile).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(profile));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plc-connection.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = JsonFileProfileStore::new(&path);

        assert!(matches!(store.load().await, Err(BridgeError::Store(_))));

        let default = ConnectionProfile::network("localhost", 502);
        assert_eq!(load_or_default(&store, default.clone()).await, default);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryProfileStore::new();
        let default = ConnectionProfile::network("localhost", 502);
        assert_eq!(load_or_default(&store, default.clone()).await, default);

        let saved = ConnectionProfile::network("10.0.0.9", 1502);
        store.save(&saved).await.unwrap();
        assert_eq!(load_or_default(&store, default).await, saved);
    }
}
