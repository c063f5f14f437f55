use std::{sync::Arc, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::types::{EntryRef, MESSAGE_RFC822};

/// Payload child of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub mime_type: String,
    pub data: Arc<[u8]>,
}

impl Content {
    /// A fully composed RFC-822 message
    #[must_use]
    pub fn rfc822(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            mime_type: String::from(MESSAGE_RFC822),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn is_message(&self) -> bool {
        self.mime_type == MESSAGE_RFC822
    }
}

/// Retry bookkeeping, absent until the first failed delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub next_attempt_at: SystemTime,
}

impl RetryState {
    /// Whether the sweep should pick this entry up at `now`
    #[must_use]
    pub fn is_due(&self, now: SystemTime) -> bool {
        self.next_attempt_at < now
    }
}

/// A spooled entry as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    pub entry: EntryRef,
    pub created_at: SystemTime,
    /// `None` while a two-step create has not written the payload yet
    pub content: Option<Content>,
    pub retry: Option<RetryState>,
}

impl SpoolEntry {
    /// Complete entries carry a recognised message payload
    #[must_use]
    pub fn has_message(&self) -> bool {
        self.content.as_ref().is_some_and(Content::is_message)
    }

    /// Eligible for the retry sweep at `now`
    #[must_use]
    pub fn is_due(&self, now: SystemTime) -> bool {
        self.has_message() && self.retry.is_some_and(|retry| retry.is_due(now))
    }
}
