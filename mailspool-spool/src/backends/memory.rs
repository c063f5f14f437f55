use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::SystemTime,
};

use async_trait::async_trait;
use mailspool_common::internal;

use crate::{
    SpoolError,
    entry::{Content, RetryState, SpoolEntry},
    feed::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChangePublisher},
    r#trait::BackingStore,
    types::{EntryId, EntryRef, NodeKind, Origin, SpoolPath},
};

/// In-memory backing store implementation
///
/// Entries are kept in a `HashMap` behind an `RwLock`, and every mutation is
/// published on a broadcast change feed exactly like the file store does.
/// Intended for tests and for transient deployments where losing the queue
/// on restart is acceptable.
///
/// # Capacity Management
/// The store can be configured with a maximum number of entries. Creating an
/// entry beyond that fails with [`SpoolError::Internal`].
#[derive(Debug, Clone)]
pub struct MemoryBackingStore {
    entries: Arc<RwLock<HashMap<EntryRef, SpoolEntry>>>,
    publisher: ChangePublisher,
    /// Maximum number of entries to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    /// Create a new empty memory-backed store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            publisher: ChangePublisher::default(),
            capacity: None,
        }
    }

    /// Create a new memory-backed store with a capacity limit
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Current number of entries across all folders
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the configured capacity (None = unlimited)
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Insert an entry exactly as given, without publishing any change
    ///
    /// This is how a persisted queue is loaded back, and lets callers seed
    /// states a producer never creates directly (pending retries, entries
    /// whose content was never written).
    ///
    /// # Errors
    /// If the store's lock is poisoned
    pub fn restore(&self, entry: SpoolEntry) -> crate::Result<()> {
        self.entries.write()?.insert(entry.entry.clone(), entry);
        Ok(())
    }
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn create(
        &self,
        folder: &SpoolPath,
        id: Option<EntryId>,
        content: Content,
        origin: Origin,
    ) -> crate::Result<EntryRef> {
        let entry = folder.entry(id.unwrap_or_else(EntryId::generate));

        {
            let mut entries = self.entries.write()?;

            if entries.contains_key(&entry) {
                return Err(SpoolError::AlreadyExists(entry));
            }

            if let Some(cap) = self.capacity
                && entries.len() >= cap
            {
                return Err(SpoolError::Internal(format!(
                    "Memory spool capacity exceeded: {}/{cap} entries",
                    entries.len(),
                )));
            }

            entries.insert(
                entry.clone(),
                SpoolEntry {
                    entry: entry.clone(),
                    created_at: SystemTime::now(),
                    content: None,
                    retry: None,
                },
            );
        }
        self.publisher.publish(vec![ChangeEvent::new(
            ChangeKind::Added,
            entry.path(),
            NodeKind::Entry,
            origin,
        )]);

        match self.entries.write()?.get_mut(&entry) {
            Some(stored) => stored.content = Some(content),
            // Removed between the two steps, nothing left to complete
            None => return Err(SpoolError::NotFound(entry)),
        }
        self.publisher.publish(vec![ChangeEvent::new(
            ChangeKind::Added,
            entry.content_path(),
            NodeKind::Content,
            origin,
        )]);

        internal!(level = DEBUG, "Spooled entry {entry} in memory");

        Ok(entry)
    }

    async fn get(&self, entry: &EntryRef) -> crate::Result<Option<SpoolEntry>> {
        Ok(self.entries.read()?.get(entry).cloned())
    }

    async fn delete(&self, entry: &EntryRef, origin: Origin) -> crate::Result<bool> {
        let removed = self.entries.write()?.remove(entry).is_some();

        if removed {
            self.publisher.publish(vec![ChangeEvent::new(
                ChangeKind::Removed,
                entry.path(),
                NodeKind::Entry,
                origin,
            )]);
        }

        Ok(removed)
    }

    async fn list(&self, folder: &SpoolPath) -> crate::Result<Vec<EntryRef>> {
        let mut refs: Vec<_> = self
            .entries
            .read()?
            .keys()
            .filter(|entry| &entry.folder == folder)
            .cloned()
            .collect();
        refs.sort();

        Ok(refs)
    }

    async fn list_due(&self, folder: &SpoolPath, now: SystemTime) -> crate::Result<Vec<EntryRef>> {
        let mut refs: Vec<_> = self
            .entries
            .read()?
            .values()
            .filter(|stored| &stored.entry.folder == folder && stored.is_due(now))
            .map(|stored| stored.entry.clone())
            .collect();
        refs.sort();

        Ok(refs)
    }

    async fn set_retry_metadata(
        &self,
        entry: &EntryRef,
        retry: RetryState,
        origin: Origin,
    ) -> crate::Result<()> {
        match self.entries.write()?.get_mut(entry) {
            Some(stored) => stored.retry = Some(retry),
            None => return Err(SpoolError::NotFound(entry.clone())),
        }

        self.publisher.publish(vec![ChangeEvent::new(
            ChangeKind::Modified,
            entry.path(),
            NodeKind::Entry,
            origin,
        )]);

        Ok(())
    }

    async fn ensure_folder(&self, _folder: &SpoolPath) -> crate::Result<()> {
        Ok(())
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed {
        self.publisher.subscribe(filter)
    }
}
