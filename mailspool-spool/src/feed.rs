//! Store change notifications
//!
//! Every backing store publishes batches of [`ChangeEvent`]s on a broadcast
//! channel. A [`ChangeFeed`] is one subscriber's view of that channel,
//! restricted to a path prefix and a set of node kinds. Delivery is
//! at-least-once from the consumer's point of view: a slow subscriber can
//! fall behind and lose batches, which [`FeedError::Lagged`] reports so the
//! consumer can rescan the store.

use std::{collections::HashSet, sync::Arc};

use tokio::sync::broadcast;

use crate::types::{NodeKind, Origin};

/// Default buffer of not-yet-consumed batches per store
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub node: NodeKind,
    pub origin: Origin,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(kind: ChangeKind, path: impl Into<String>, node: NodeKind, origin: Origin) -> Self {
        Self {
            kind,
            path: path.into(),
            node,
            origin,
        }
    }
}

pub type ChangeBatch = Arc<Vec<ChangeEvent>>;

/// Which notifications a subscriber is interested in
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    prefix: String,
    nodes: HashSet<NodeKind>,
}

impl ChangeFilter {
    /// Everything strictly below `prefix`, for the given node kinds
    pub fn new(prefix: impl AsRef<str>, nodes: impl IntoIterator<Item = NodeKind>) -> Self {
        let prefix = prefix.as_ref().trim_end_matches('/');

        Self {
            prefix: format!("{prefix}/"),
            nodes: nodes.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.nodes.contains(&event.node) && event.path.starts_with(&self.prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// The subscriber fell behind and this many batches were dropped
    #[error("change feed lagged, {0} batches dropped")]
    Lagged(u64),

    /// The store publishing to this feed is gone
    #[error("change feed closed")]
    Closed,
}

/// Publishing half, owned by a backing store
#[derive(Debug, Clone)]
pub struct ChangePublisher {
    sender: broadcast::Sender<ChangeBatch>,
}

impl ChangePublisher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a batch. Batches nobody is listening for are dropped.
    pub fn publish(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }

        let _ = self.sender.send(Arc::new(events));
    }

    #[must_use]
    pub fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed {
        ChangeFeed {
            receiver: self.sender.subscribe(),
            filter,
        }
    }
}

impl Default for ChangePublisher {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

/// A filtered subscription to a store's changes
#[derive(Debug)]
pub struct ChangeFeed {
    receiver: broadcast::Receiver<ChangeBatch>,
    filter: ChangeFilter,
}

impl ChangeFeed {
    /// Wait for the next batch containing at least one matching event
    ///
    /// # Errors
    /// [`FeedError::Lagged`] if batches were dropped since the last call, in
    /// which case the feed keeps going from the oldest retained batch.
    /// [`FeedError::Closed`] once the store is dropped.
    pub async fn recv(&mut self) -> Result<Vec<ChangeEvent>, FeedError> {
        loop {
            let batch = match self.receiver.recv().await {
                Ok(batch) => batch,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(FeedError::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            };

            let matching: Vec<_> = batch
                .iter()
                .filter(|event| self.filter.matches(event))
                .cloned()
                .collect();

            if !matching.is_empty() {
                return Ok(matching);
            }
        }
    }

    #[must_use]
    pub const fn filter(&self) -> &ChangeFilter {
        &self.filter
    }
}
