use async_trait::async_trait;

use crate::{error::DeliveryError, message::OutboundMessage};

/// Something that can hand a prepared message to the outside world
///
/// Implementations classify their own failures: a
/// [`DeliveryError::Permanent`] means the message must never be retried,
/// anything else is worth another attempt later.
#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// If the message was not accepted
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}
