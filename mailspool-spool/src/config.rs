use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{
    backends::{FileBackingStore, MemoryBackingStore},
    r#trait::BackingStore,
};

const fn default_watch() -> bool {
    true
}

/// Configuration for the spool backing store
///
/// File-backed spool in RON config:
/// ```ron
/// spool: File(
///     path: "/var/spool/mailspool",
/// ),
/// ```
///
/// Memory-backed spool with a capacity limit:
/// ```ron
/// spool: Memory(
///     capacity: Some(1000),
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum SpoolConfig {
    /// File-based spool (production)
    File {
        path: PathBuf,
        /// Publish changes made to the directory by other processes
        #[serde(default = "default_watch")]
        watch: bool,
    },
    /// Memory-based spool (testing/development)
    Memory {
        /// Maximum number of entries to store (omit for unlimited)
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("/var/spool/mailspool"),
            watch: default_watch(),
        }
    }
}

impl SpoolConfig {
    /// Get the filesystem path for file-backed spools, if applicable
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File { path, .. } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Build and initialise the configured backing store
    ///
    /// # Errors
    /// If the file spool path is invalid or cannot be initialised
    pub fn into_backing_store(self) -> crate::Result<Arc<dyn BackingStore>> {
        match self {
            Self::File { path, watch } => {
                let mut store = FileBackingStore::builder()
                    .path(path)
                    .watch(watch)
                    .build()?;
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity: None } => Ok(Arc::new(MemoryBackingStore::new())),
            Self::Memory {
                capacity: Some(capacity),
            } => Ok(Arc::new(MemoryBackingStore::with_capacity(capacity))),
        }
    }
}
