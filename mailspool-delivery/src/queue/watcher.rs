//! Turns store change notifications into queue work.

use mailspool_common::{Signal, internal, tracing::warn};
use mailspool_spool::{
    ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, EntryRef, FeedError, NodeKind, Origin,
    SpoolPath, ValidationError,
};
use tokio::sync::{broadcast, mpsc};

use super::{WorkItem, sweep::RetrySweep};

/// Watches one spool folder for completed and cancelled entries
///
/// An entry is created in two steps, entry node then content child, so only
/// the content child appearing (or being rewritten) means a message is ready.
/// An entry node removed by anyone other than the queue itself is a
/// cancellation.
#[derive(Debug, Clone)]
pub struct ChangeWatcher {
    folder: SpoolPath,
}

impl ChangeWatcher {
    #[must_use]
    pub const fn new(folder: SpoolPath) -> Self {
        Self { folder }
    }

    /// Subscription filter covering everything this watcher decodes
    #[must_use]
    pub fn filter(&self) -> ChangeFilter {
        ChangeFilter::new(self.folder.as_str(), [NodeKind::Entry, NodeKind::Content])
    }

    /// Decode a single notification
    ///
    /// # Errors
    /// If the notification's path does not name an entry in this folder
    pub fn decode(&self, event: &ChangeEvent) -> Result<Option<WorkItem>, ValidationError> {
        let (entry, node) = EntryRef::parse_node(&self.folder, &event.path)?;

        if entry.id.is_hidden() {
            return Ok(None);
        }

        let item = match (event.kind, node) {
            (ChangeKind::Added | ChangeKind::Modified, NodeKind::Content) => {
                Some(WorkItem::Deliver(entry))
            }
            (ChangeKind::Removed, NodeKind::Entry) if event.origin != Origin::Queue => {
                Some(WorkItem::Discard(entry))
            }
            _ => None,
        };

        Ok(item)
    }

    /// Decode a batch, skipping notifications that fail to decode
    pub fn decode_batch(&self, events: &[ChangeEvent]) -> Vec<WorkItem> {
        events
            .iter()
            .filter_map(|event| match self.decode(event) {
                Ok(item) => item,
                Err(err) => {
                    warn!(path = %event.path, error = %err, "Ignoring undecodable change notification");
                    None
                }
            })
            .collect()
    }

    /// Forward work from `feed` to the driver until shutdown
    ///
    /// If the feed lags, notifications were lost, so the folder is rescanned
    /// through `sweep`.
    pub async fn run(
        &self,
        mut feed: ChangeFeed,
        tx: mpsc::Sender<WorkItem>,
        sweep: &RetrySweep,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        internal!("Watching {} for changes", self.folder);

        loop {
            tokio::select! {
                batch = feed.recv() => match batch {
                    Ok(events) => {
                        for item in self.decode_batch(&events) {
                            if tx.send(item).await.is_err() {
                                internal!(level = DEBUG, "Queue driver gone, change watcher stopping");
                                return;
                            }
                        }
                    }
                    Err(FeedError::Lagged(skipped)) => {
                        warn!(
                            folder = %self.folder,
                            skipped,
                            "Change feed lagged, rescanning spool folder"
                        );
                        sweep.recover(&tx).await;
                    }
                    Err(FeedError::Closed) => {
                        warn!(folder = %self.folder, "Change feed closed, change watcher stopping");
                        return;
                    }
                },
                _ = shutdown.recv() => {
                    internal!("Change watcher received shutdown signal");
                    return;
                }
            }
        }
    }
}
