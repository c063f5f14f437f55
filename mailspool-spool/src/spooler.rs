use std::sync::Arc;

use mailspool_common::internal;
use mailspool_tracing::traced;

use crate::{
    Result,
    entry::Content,
    r#trait::BackingStore,
    types::{EntryId, EntryRef, Origin, SpoolPath},
};

/// Producer-facing handle for queueing outbound mail
///
/// Messages must already be fully composed RFC-822 documents.
#[derive(Debug, Clone)]
pub struct Spooler {
    store: Arc<dyn BackingStore>,
    folder: SpoolPath,
}

impl Spooler {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, folder: SpoolPath) -> Self {
        Self { store, folder }
    }

    #[must_use]
    pub const fn folder(&self) -> &SpoolPath {
        &self.folder
    }

    /// Queue a message under a freshly generated id
    ///
    /// # Errors
    /// If the store cannot persist the entry
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all), timing(precision = "ms"))]
    pub async fn spool_raw(&self, message: impl Into<Arc<[u8]>>) -> Result<EntryRef> {
        let entry = self
            .store
            .create(&self.folder, None, Content::rfc822(message), Origin::Producer)
            .await?;

        internal!(level = DEBUG, "Queued {entry}");
        Ok(entry)
    }

    /// Queue a message under a caller supplied id
    ///
    /// # Errors
    /// [`SpoolError::AlreadyExists`](crate::SpoolError::AlreadyExists) if the
    /// id is taken, or any store failure
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self, message)), timing(precision = "ms"))]
    pub async fn spool_raw_with_id(
        &self,
        id: EntryId,
        message: impl Into<Arc<[u8]>>,
    ) -> Result<EntryRef> {
        let entry = self
            .store
            .create(
                &self.folder,
                Some(id),
                Content::rfc822(message),
                Origin::Producer,
            )
            .await?;

        internal!(level = DEBUG, "Queued {entry}");
        Ok(entry)
    }

    /// Withdraw a queued message before it is delivered
    ///
    /// Returns `false` if it was already gone.
    ///
    /// # Errors
    /// If the store fails to remove the entry
    pub async fn cancel(&self, entry: &EntryRef) -> Result<bool> {
        let removed = self.store.delete(entry, Origin::Client).await?;

        if removed {
            internal!(level = INFO, "Cancelled {entry}");
        }

        Ok(removed)
    }
}
