//! Delivery queue: the producers of work and the driver that executes it
//!
//! The [`ChangeWatcher`] and the [`RetrySweep`] both emit [`WorkItem`]s on
//! one channel; the [`QueueDriver`] runs a [`DeliveryAttempt`] for each,
//! with a bounded number in flight and at most one per entry.

pub mod sweep;
pub mod watcher;

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use mailspool_common::{
    Signal, internal,
    tracing::{error, info, warn},
};
use mailspool_spool::{BackingStore, EntryRef, Origin};
use tokio::{
    sync::{Semaphore, broadcast, mpsc},
    task::JoinSet,
};

pub use self::{sweep::RetrySweep, watcher::ChangeWatcher};
use crate::processor::attempt::DeliveryAttempt;

/// Default number of attempts allowed to run at once
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Default time to wait for in-flight attempts on shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Attempt delivery of the entry
    Deliver(EntryRef),
    /// The entry was cancelled, make sure it is gone
    Discard(EntryRef),
}

/// Removes an entry from the in-flight set when its attempt finishes
struct InFlightGuard {
    in_flight: Arc<DashMap<EntryRef, ()>>,
    entry: EntryRef,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.entry);
    }
}

#[derive(Debug)]
pub struct QueueDriver {
    attempt: Arc<DeliveryAttempt>,
    store: Arc<dyn BackingStore>,
    in_flight: Arc<DashMap<EntryRef, ()>>,
    permits: Arc<Semaphore>,
    shutdown_timeout: Duration,
}

impl QueueDriver {
    #[must_use]
    pub fn new(attempt: Arc<DeliveryAttempt>, store: Arc<dyn BackingStore>) -> Self {
        Self {
            attempt,
            store,
            in_flight: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Execute work from `rx` until shutdown or until every producer is gone
    ///
    /// On the way out, running attempts get up to the shutdown timeout to
    /// finish. Any still running after that are left to complete on their own.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<WorkItem>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => self.dispatch(item, &mut tasks),
                    None => {
                        internal!(level = DEBUG, "All work producers gone, queue driver stopping");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "Delivery task failed");
                    }
                }
                _ = shutdown.recv() => {
                    internal!("Queue driver received shutdown signal");
                    break;
                }
            }
        }

        self.drain(tasks).await;
    }

    fn dispatch(&self, item: WorkItem, tasks: &mut JoinSet<()>) {
        match item {
            WorkItem::Deliver(entry) => {
                match self.in_flight.entry(entry.clone()) {
                    Entry::Occupied(_) => {
                        internal!(level = DEBUG, "Attempt for {entry} already in flight");
                        return;
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(());
                    }
                }

                let guard = InFlightGuard {
                    in_flight: self.in_flight.clone(),
                    entry,
                };
                let attempt = self.attempt.clone();
                let permits = self.permits.clone();

                tasks.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    attempt.attempt(&guard.entry).await;
                    drop(guard);
                });
            }
            WorkItem::Discard(entry) => {
                let store = self.store.clone();

                tasks.spawn(async move {
                    match store.delete(&entry, Origin::Queue).await {
                        Ok(true) => info!(entry = %entry, "Removed remains of cancelled entry"),
                        Ok(false) => info!(entry = %entry, "Queued entry cancelled"),
                        Err(err) => {
                            warn!(entry = %entry, error = %err, "Failed to clean up cancelled entry");
                        }
                    }
                });
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        internal!(
            "Waiting up to {}s for {} delivery tasks",
            self.shutdown_timeout.as_secs(),
            tasks.len()
        );

        let finished = tokio::time::timeout(self.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if finished.is_ok() {
            internal!("All in-flight deliveries completed");
        } else {
            warn!(
                remaining = tasks.len(),
                "Shutdown timeout exceeded, remaining deliveries continue unsupervised"
            );
            tasks.detach_all();
        }
    }
}
