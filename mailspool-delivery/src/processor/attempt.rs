//! A single delivery attempt for one spooled entry.

use std::{sync::Arc, time::Duration};

use mailspool_common::{
    internal,
    tracing::{error, info, warn},
};
use mailspool_spool::{
    BackingStore, EntryRef, Origin, RetryState, SpoolSession, session::is_missing,
};
use mailspool_tracing::traced;

use crate::{
    clock::{Clock, SystemClock},
    error::{DeliveryError, PermanentError, TemporaryError},
    message,
    policy::{RetryDecision, RetryPolicy},
    transport::MailTransport,
};

/// Upper bound on a whole transport call unless configured otherwise
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// What an attempt did with its entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The entry was already gone, nothing was sent
    Missing,
    /// A retry is scheduled for later, nothing was sent
    NotDue(RetryState),
    /// Sent and deleted
    Delivered,
    /// Nobody to send to, deleted
    NoRecipients,
    /// Could never be delivered, deleted
    PermanentFailure(String),
    /// Transient failure, retry state persisted
    Retrying(RetryState),
    /// Transient failure with the retry budget spent, deleted
    Exhausted,
    /// The entry could not be read, it is left for a later attempt
    StoreUnavailable(String),
}

/// Delivers one entry and records the result in the store
///
/// Attempts are idempotent: an entry deleted by a previous attempt is simply
/// reported as [`Outcome::Missing`], and one whose retry is still in the
/// future as [`Outcome::NotDue`], so duplicate triggers are harmless.
#[derive(Debug)]
pub struct DeliveryAttempt {
    store: Arc<dyn BackingStore>,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    test_recipient: Option<String>,
    send_timeout: Duration,
}

impl DeliveryAttempt {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            store,
            transport,
            policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            test_recipient: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver every message to `recipient` instead of its own recipients
    #[must_use]
    pub fn with_test_recipient(mut self, recipient: Option<String>) -> Self {
        self.test_recipient = recipient;
        self
    }

    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Try to deliver `entry`, then delete it or schedule a retry
    ///
    /// Never fails: every problem is classified into an [`Outcome`] and
    /// logged. Store updates are flushed once at the end, and a failed flush
    /// is logged rather than reported.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self), fields(entry = %entry)), timing(precision = "ms"))]
    pub async fn attempt(&self, entry: &EntryRef) -> Outcome {
        let mut session = SpoolSession::new(self.store.clone(), Origin::Queue);
        let outcome = self.run(&mut session, entry).await;

        if let Err(err) = session.save().await {
            if is_missing(&err) {
                internal!(
                    level = DEBUG,
                    "Entry {entry} disappeared before its outcome could be recorded"
                );
            } else {
                error!(entry = %entry, error = %err, "Failed to record delivery outcome");
            }
        }

        outcome
    }

    async fn run(&self, session: &mut SpoolSession, entry: &EntryRef) -> Outcome {
        let stored = match session.get(entry).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                internal!(level = DEBUG, "Entry {entry} is gone, nothing to deliver");
                return Outcome::Missing;
            }
            Err(err) => {
                error!(entry = %entry, error = %err, "Failed to read spooled entry");
                return Outcome::StoreUnavailable(err.to_string());
            }
        };

        if let Some(retry) = stored.retry
            && retry.next_attempt_at > self.clock.now()
        {
            internal!(level = DEBUG, "Entry {entry} is not due for retry yet");
            return Outcome::NotDue(retry);
        }

        let data = match &stored.content {
            Some(content) if content.is_message() => content.data.clone(),
            Some(content) => {
                return Self::discard(
                    session,
                    entry,
                    &PermanentError::InconsistentEntry(format!(
                        "unsupported content type {}",
                        content.mime_type
                    )),
                );
            }
            None => {
                return Self::discard(
                    session,
                    entry,
                    &PermanentError::InconsistentEntry(String::from("entry has no content")),
                );
            }
        };

        let outbound = match message::prepare(&data, self.test_recipient.as_deref()) {
            Ok(outbound) => outbound,
            Err(DeliveryError::Permanent(PermanentError::NoRecipients)) => {
                warn!(entry = %entry, "Message has no recipients, discarding");
                session.delete(entry);
                return Outcome::NoRecipients;
            }
            Err(DeliveryError::Permanent(err)) => return Self::discard(session, entry, &err),
            Err(err) => return self.schedule_retry(session, entry, stored.retry, &err),
        };

        let result = tokio::time::timeout(self.send_timeout, self.transport.send(&outbound))
            .await
            .unwrap_or_else(|_| {
                Err(TemporaryError::Timeout(format!(
                    "no answer within {}s",
                    self.send_timeout.as_secs()
                ))
                .into())
            });

        match result {
            Ok(()) => {
                info!(
                    entry = %entry,
                    recipients = outbound.recipients.len(),
                    "Message delivered"
                );
                session.delete(entry);
                Outcome::Delivered
            }
            Err(DeliveryError::Permanent(err)) => Self::discard(session, entry, &err),
            Err(err) => self.schedule_retry(session, entry, stored.retry, &err),
        }
    }

    fn discard(session: &mut SpoolSession, entry: &EntryRef, reason: &PermanentError) -> Outcome {
        error!(entry = %entry, reason = %reason, "Permanent delivery failure, discarding");
        session.delete(entry);
        Outcome::PermanentFailure(reason.to_string())
    }

    fn schedule_retry(
        &self,
        session: &mut SpoolSession,
        entry: &EntryRef,
        current: Option<RetryState>,
        err: &DeliveryError,
    ) -> Outcome {
        match self.policy.record_failure(current, self.clock.now()) {
            RetryDecision::Keep(retry) => {
                info!(
                    entry = %entry,
                    error = %err,
                    retry_count = retry.retry_count,
                    "Delivery failed, retry scheduled"
                );
                session.set_retry_metadata(entry, retry);
                Outcome::Retrying(retry)
            }
            RetryDecision::Discard => {
                warn!(
                    entry = %entry,
                    error = %err,
                    retries = self.policy.max_retries,
                    "Delivery retries exhausted, discarding"
                );
                session.delete(entry);
                Outcome::Exhausted
            }
        }
    }
}
