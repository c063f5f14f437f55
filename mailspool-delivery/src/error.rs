//! Typed error handling for delivery operations.
//!
//! Every failed attempt is classified as one of:
//! - Permanent failures (unusable message, 5xx SMTP codes) - delete, don't retry
//! - Temporary failures (network trouble, 4xx SMTP codes) - retry with backoff
//! - System errors - problems with this process rather than the message

use mailspool_spool::SpoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Failures that no amount of retrying will fix.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermanentError {
    /// The payload is not a structurally valid message.
    #[error("Unparseable message: {0}")]
    Unparseable(String),

    /// The message resolves to zero recipients.
    #[error("Message has no recipients")]
    NoRecipients,

    /// The entry has no payload, or one the queue cannot send.
    #[error("Inconsistent spool entry: {0}")]
    InconsistentEntry(String),

    /// The server rejected the message outright.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// Failures worth another try later.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemporaryError {
    /// Failed to establish or keep a connection to the relay.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The relay did not answer in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The relay returned a 4xx reply.
    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    /// The SMTP envelope could not be built from the message addresses.
    #[error("Invalid envelope: {0}")]
    Envelope(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    /// Delivery processor not initialized.
    #[error("Delivery processor not initialized: {0}")]
    NotInitialized(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl From<SpoolError> for DeliveryError {
    fn from(err: SpoolError) -> Self {
        Self::System(err.into())
    }
}
