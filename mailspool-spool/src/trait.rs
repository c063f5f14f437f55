use std::time::SystemTime;

use async_trait::async_trait;

use crate::{
    Result,
    entry::{Content, RetryState, SpoolEntry},
    feed::{ChangeFeed, ChangeFilter},
    types::{EntryId, EntryRef, Origin, SpoolPath},
};

/// Storage behind the spool
///
/// Entries live in folders. Each entry has metadata (creation time and the
/// optional retry state) and a content child holding the payload. Every
/// mutation is published on the store's change feed, tagged with the
/// [`Origin`] the caller passed in.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Create an entry in `folder`
    ///
    /// Creation is two-step: the entry node is written and published first,
    /// then its content child. Subscribers interested in complete entries
    /// should watch for the content child.
    ///
    /// # Errors
    /// [`SpoolError::AlreadyExists`](crate::SpoolError::AlreadyExists) if an
    /// explicit `id` is already taken, or any storage failure
    async fn create(
        &self,
        folder: &SpoolPath,
        id: Option<EntryId>,
        content: Content,
        origin: Origin,
    ) -> Result<EntryRef>;

    /// Read an entry, `None` if it does not exist
    ///
    /// # Errors
    /// If the entry exists but cannot be read
    async fn get(&self, entry: &EntryRef) -> Result<Option<SpoolEntry>>;

    /// Remove an entry and its content
    ///
    /// Returns `false` when there was nothing to delete.
    ///
    /// # Errors
    /// If the entry exists but cannot be removed
    async fn delete(&self, entry: &EntryRef, origin: Origin) -> Result<bool>;

    /// All entries in `folder`, complete or not, in id order
    ///
    /// # Errors
    /// If the folder cannot be listed
    async fn list(&self, folder: &SpoolPath) -> Result<Vec<EntryRef>>;

    /// Entries in `folder` whose next attempt is strictly before `now` and
    /// whose content is a recognised message
    ///
    /// # Errors
    /// If the folder cannot be listed
    async fn list_due(&self, folder: &SpoolPath, now: SystemTime) -> Result<Vec<EntryRef>>;

    /// Persist retry state on an existing entry
    ///
    /// # Errors
    /// [`SpoolError::NotFound`](crate::SpoolError::NotFound) if the entry is
    /// gone, or any storage failure
    async fn set_retry_metadata(
        &self,
        entry: &EntryRef,
        retry: RetryState,
        origin: Origin,
    ) -> Result<()>;

    /// Make sure `folder` exists so it can be listed and watched
    ///
    /// # Errors
    /// If the folder cannot be created
    async fn ensure_folder(&self, folder: &SpoolPath) -> Result<()>;

    /// Subscribe to changes matching `filter`
    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed;
}
