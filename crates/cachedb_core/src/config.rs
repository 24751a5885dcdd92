//! Store configuration.

use crate::clock::{SystemTimeSource, TimeSource};
use crate::types::DeviceId;
use std::path::PathBuf;
use std::sync::Arc;

/// Where the journal lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A directory holding `journal.log` and `LOCK`.
    Directory(PathBuf),
    /// Process memory only. Same semantics, no durability.
    InMemory,
}

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Journal location.
    pub location: StoreLocation,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fsync the journal on every commit (safer but slower).
    /// Otherwise commits are flushed to the OS.
    pub sync_on_commit: bool,

    /// Device id for a newly created store. Ignored when the journal
    /// already records one.
    pub device_id: Option<DeviceId>,

    /// Physical time for the hybrid clock.
    pub time_source: Arc<dyn TimeSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            location: StoreLocation::InMemory,
            create_if_missing: true,
            sync_on_commit: true,
            device_id: None,
            time_source: Arc::new(SystemTimeSource),
        }
    }
}

impl Config {
    /// A file-backed configuration rooted at `path`.
    #[must_use]
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::Directory(path.into()),
            ..Self::default()
        }
    }

    /// An ephemeral in-memory configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// True for [`StoreLocation::InMemory`].
    #[must_use]
    pub fn is_in_memory(&self) -> bool {
        self.location == StoreLocation::InMemory
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync the journal on every commit.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Pins the device id of a new store.
    #[must_use]
    pub fn device_id(mut self, id: DeviceId) -> Self {
        self.device_id = Some(id);
        self
    }

    /// Replaces the clock's time source.
    #[must_use]
    pub fn time_source(mut self, source: Arc<dyn TimeSource>) -> Self {
        self.time_source = source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.is_in_memory());
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.device_id, None);
    }

    #[test]
    fn builder_pattern() {
        let device = DeviceId::new();
        let config = Config::directory("/tmp/cache")
            .create_if_missing(false)
            .sync_on_commit(false)
            .device_id(device);

        assert_eq!(
            config.location,
            StoreLocation::Directory(PathBuf::from("/tmp/cache"))
        );
        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.device_id, Some(device));
    }
}
