//! Periodic pickup of entries whose retry is due.

use std::{sync::Arc, time::Duration};

use mailspool_common::{
    Signal, internal,
    tracing::{debug, error, info, warn},
};
use mailspool_spool::{BackingStore, SpoolPath};
use tokio::sync::{broadcast, mpsc};

use super::WorkItem;
use crate::clock::Clock;

/// Feeds due retries (and, on recovery, missed first attempts) to the driver
#[derive(Debug, Clone)]
pub struct RetrySweep {
    store: Arc<dyn BackingStore>,
    folder: SpoolPath,
    clock: Arc<dyn Clock>,
}

impl RetrySweep {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, folder: SpoolPath, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            folder,
            clock,
        }
    }

    /// Submit every due entry, returning how many were submitted
    ///
    /// A failed query is logged and the tick skipped.
    pub async fn tick(&self, tx: &mpsc::Sender<WorkItem>) -> usize {
        let due = match self.store.list_due(&self.folder, self.clock.now()).await {
            Ok(due) => due,
            Err(err) => {
                error!(folder = %self.folder, error = %err, "Failed to query due retries");
                return 0;
            }
        };

        let mut submitted = 0;
        for entry in due {
            if entry.id.is_hidden() {
                continue;
            }
            if tx.send(WorkItem::Deliver(entry)).await.is_err() {
                break;
            }
            submitted += 1;
        }

        if submitted > 0 {
            debug!(folder = %self.folder, submitted, "Submitted due retries");
        }

        submitted
    }

    /// Submit every complete entry that is waiting for a first attempt or a
    /// due retry
    ///
    /// Used at startup and whenever change notifications were lost. Entries
    /// still being written, or waiting on a future retry, are left alone.
    pub async fn recover(&self, tx: &mpsc::Sender<WorkItem>) -> usize {
        let entries = match self.store.list(&self.folder).await {
            Ok(entries) => entries,
            Err(err) => {
                error!(folder = %self.folder, error = %err, "Failed to list spool folder for recovery");
                return 0;
            }
        };

        let now = self.clock.now();
        let mut submitted = 0;

        for entry in entries {
            if entry.id.is_hidden() {
                continue;
            }

            let stored = match self.store.get(&entry).await {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(err) => {
                    warn!(entry = %entry, error = %err, "Skipping unreadable entry during recovery");
                    continue;
                }
            };

            let pending = stored.has_message() && stored.retry.is_none_or(|retry| retry.is_due(now));
            if !pending {
                continue;
            }

            if tx.send(WorkItem::Deliver(entry)).await.is_err() {
                break;
            }
            submitted += 1;
        }

        info!(folder = %self.folder, submitted, "Recovered pending spool entries");
        submitted
    }

    /// Tick every `period` until shutdown
    ///
    /// The first tick happens one period after start, recovery covers
    /// startup. Ticks never overlap.
    pub async fn run(
        &self,
        period: Duration,
        tx: mpsc::Sender<WorkItem>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.tick(&tx).await;
                    if tx.is_closed() {
                        internal!(level = DEBUG, "Queue driver gone, retry sweep stopping");
                        return;
                    }
                }
                _ = shutdown.recv() => {
                    internal!("Retry sweep received shutdown signal");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::SystemTime;

    use mailspool_spool::{Content, EntryId, MemoryBackingStore, Origin, RetryState, SpoolEntry};

    use super::*;
    use crate::clock::ManualClock;

    const MESSAGE: &[u8] = b"To: bob@example.com\r\n\r\nhello\r\n";

    fn drain(rx: &mut mpsc::Receiver<WorkItem>) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn tick_submits_only_due_entries() {
        let store = Arc::new(MemoryBackingStore::new());
        let folder = SpoolPath::default();
        let clock = ManualClock::new();
        let now = clock.now();

        let due = store
            .create(&folder, None, Content::rfc822(MESSAGE), Origin::Producer)
            .await
            .unwrap();
        let later = store
            .create(&folder, None, Content::rfc822(MESSAGE), Origin::Producer)
            .await
            .unwrap();
        let fresh = store
            .create(&folder, None, Content::rfc822(MESSAGE), Origin::Producer)
            .await
            .unwrap();

        store
            .set_retry_metadata(
                &due,
                RetryState {
                    retry_count: 1,
                    next_attempt_at: now - Duration::from_secs(1),
                },
                Origin::Queue,
            )
            .await
            .unwrap();
        store
            .set_retry_metadata(
                &later,
                RetryState {
                    retry_count: 1,
                    next_attempt_at: now + Duration::from_secs(3600),
                },
                Origin::Queue,
            )
            .await
            .unwrap();

        let sweep = RetrySweep::new(store, folder, Arc::new(clock));
        let (tx, mut rx) = mpsc::channel(16);

        assert_eq!(sweep.tick(&tx).await, 1);
        assert_eq!(drain(&mut rx), vec![WorkItem::Deliver(due.clone())]);

        assert_eq!(sweep.recover(&tx).await, 2);
        let recovered = drain(&mut rx);
        assert!(recovered.contains(&WorkItem::Deliver(due)));
        assert!(recovered.contains(&WorkItem::Deliver(fresh)));
        assert!(!recovered.contains(&WorkItem::Deliver(later)));
    }

    #[tokio::test]
    async fn recovery_skips_incomplete_and_hidden_entries() {
        let store = Arc::new(MemoryBackingStore::new());
        let folder = SpoolPath::default();

        store
            .restore(SpoolEntry {
                entry: folder.entry(EntryId::new("half-written").unwrap()),
                created_at: SystemTime::now(),
                content: None,
                retry: None,
            })
            .unwrap();
        store
            .create(
                &folder,
                Some(EntryId::new(".hidden").unwrap()),
                Content::rfc822(MESSAGE),
                Origin::Producer,
            )
            .await
            .unwrap();

        let sweep = RetrySweep::new(store, folder, Arc::new(ManualClock::new()));
        let (tx, mut rx) = mpsc::channel(16);

        assert_eq!(sweep.recover(&tx).await, 0);
        assert!(drain(&mut rx).is_empty());
    }
}
