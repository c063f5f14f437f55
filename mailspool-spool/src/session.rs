use std::sync::Arc;

use mailspool_common::internal;

use crate::{
    Result, SpoolError,
    entry::{RetryState, SpoolEntry},
    r#trait::BackingStore,
    types::{EntryRef, Origin},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingChange {
    Delete(EntryRef),
    SetRetry(EntryRef, RetryState),
}

/// A scoped unit of work against the store
///
/// Reads go straight to the store, with this session's own unsaved changes
/// layered on top. Mutations are buffered and applied in order by
/// [`SpoolSession::save`], all tagged with the session's [`Origin`].
/// A session dropped with unsaved changes discards them.
#[derive(Debug)]
pub struct SpoolSession {
    store: Arc<dyn BackingStore>,
    origin: Origin,
    pending: Vec<PendingChange>,
}

impl SpoolSession {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, origin: Origin) -> Self {
        Self {
            store,
            origin,
            pending: Vec::new(),
        }
    }

    /// Read an entry as this session currently sees it
    ///
    /// # Errors
    /// If the store fails to read the entry
    pub async fn get(&self, entry: &EntryRef) -> Result<Option<SpoolEntry>> {
        let mut retry = None;
        for change in &self.pending {
            match change {
                PendingChange::Delete(deleted) if deleted == entry => return Ok(None),
                PendingChange::SetRetry(updated, state) if updated == entry => {
                    retry = Some(*state);
                }
                _ => {}
            }
        }

        let stored = self.store.get(entry).await?;
        Ok(stored.map(|stored| SpoolEntry {
            retry: retry.or(stored.retry),
            ..stored
        }))
    }

    pub fn delete(&mut self, entry: &EntryRef) {
        self.pending.push(PendingChange::Delete(entry.clone()));
    }

    pub fn set_retry_metadata(&mut self, entry: &EntryRef, retry: RetryState) {
        self.pending
            .push(PendingChange::SetRetry(entry.clone(), retry));
    }

    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply buffered changes in the order they were made
    ///
    /// Deleting an entry that is already gone is not an error. On the first
    /// failure the remaining changes are dropped and the error returned.
    ///
    /// # Errors
    /// The first store error encountered
    pub async fn save(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let total = pending.len();

        for (applied, change) in pending.into_iter().enumerate() {
            let result = match &change {
                PendingChange::Delete(entry) => {
                    self.store.delete(entry, self.origin).await.map(|_| ())
                }
                PendingChange::SetRetry(entry, retry) => {
                    self.store
                        .set_retry_metadata(entry, *retry, self.origin)
                        .await
                }
            };

            if let Err(err) = result {
                let skipped = total - applied - 1;
                if skipped > 0 {
                    internal!(
                        level = WARN,
                        "Dropping {skipped} unsaved spool changes after failure"
                    );
                }
                return Err(err);
            }
        }

        Ok(())
    }
}

impl Drop for SpoolSession {
    fn drop(&mut self) {
        if self.has_pending_changes() {
            internal!(
                level = WARN,
                "Spool session dropped with {} unsaved changes",
                self.pending.len()
            );
        }
    }
}

/// Whether a save failure only means the entry was already gone
#[must_use]
pub const fn is_missing(err: &SpoolError) -> bool {
    matches!(err, SpoolError::NotFound(_))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::{Duration, SystemTime};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{Content, MemoryBackingStore, SpoolPath};

    async fn seeded() -> (Arc<MemoryBackingStore>, EntryRef) {
        let store = Arc::new(MemoryBackingStore::new());
        let entry = store
            .create(
                &SpoolPath::default(),
                None,
                Content::rfc822(&b"Subject: s\r\n\r\n"[..]),
                Origin::Producer,
            )
            .await
            .unwrap();
        (store, entry)
    }

    fn retry(count: u32) -> RetryState {
        RetryState {
            retry_count: count,
            next_attempt_at: SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(count)),
        }
    }

    #[tokio::test]
    async fn changes_are_invisible_to_the_store_until_saved() {
        let (store, entry) = seeded().await;
        let mut session = SpoolSession::new(store.clone(), Origin::Queue);

        session.set_retry_metadata(&entry, retry(1));
        assert_eq!(session.get(&entry).await.unwrap().unwrap().retry, Some(retry(1)));
        assert_eq!(store.get(&entry).await.unwrap().unwrap().retry, None);

        session.save().await.unwrap();
        assert!(!session.has_pending_changes());
        assert_eq!(store.get(&entry).await.unwrap().unwrap().retry, Some(retry(1)));
    }

    #[tokio::test]
    async fn pending_delete_hides_the_entry() {
        let (store, entry) = seeded().await;
        let mut session = SpoolSession::new(store.clone(), Origin::Queue);

        session.delete(&entry);
        assert_eq!(session.get(&entry).await.unwrap(), None);
        assert!(store.get(&entry).await.unwrap().is_some());

        session.save().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn deleting_a_missing_entry_saves_cleanly() {
        let (store, entry) = seeded().await;
        store.delete(&entry, Origin::Client).await.unwrap();

        let mut session = SpoolSession::new(store, Origin::Queue);
        session.delete(&entry);

        assert!(session.save().await.is_ok());
    }

    #[tokio::test]
    async fn retry_on_missing_entry_fails_the_save() {
        let (store, entry) = seeded().await;
        store.delete(&entry, Origin::Client).await.unwrap();

        let mut session = SpoolSession::new(store, Origin::Queue);
        session.set_retry_metadata(&entry, retry(2));

        let err = session.save().await.unwrap_err();
        assert!(is_missing(&err));
        assert!(!session.has_pending_changes());
    }
}
