//! Delivery queue for the mail spool
//!
//! This crate provides functionality to:
//! - Watch a spool folder for newly completed messages
//! - Attempt delivery through a [`MailTransport`] (SMTP by default)
//! - Schedule retries with exponential backoff and jitter
//! - Sweep the spool for retries that have come due

pub mod clock;
mod error;
pub mod message;
pub mod policy;
pub mod processor;
pub mod queue;
mod smtp;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DeliveryError, PermanentError, SystemError, TemporaryError};
pub use message::OutboundMessage;
pub use policy::{RetryDecision, RetryPolicy};
pub use processor::{
    DeliveryProcessor,
    attempt::{DeliveryAttempt, Outcome},
};
pub use queue::{ChangeWatcher, QueueDriver, RetrySweep, WorkItem};
pub use smtp::{SmtpConfig, SmtpMailTransport};
pub use transport::MailTransport;
