//! Delivery policies, kept apart from the orchestration that applies them.
//!
//! - [`RetryPolicy`]: when to try again after a transient failure, and when to give up

pub mod retry;

pub use retry::{RetryDecision, RetryPolicy};
