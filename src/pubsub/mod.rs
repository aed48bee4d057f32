//! Upstream subscription abstraction.

pub mod gcp;
pub mod message;

use async_trait::async_trait;

use crate::error::SubscriptionError;

pub use gcp::GcpSubscription;
pub use message::{AckGuard, Acknowledger, InboundMessage};

/// A pull-based source of messages.
///
/// Implementations must be safe to share across tasks; the relay calls
/// `receive` from a single intake task while delivery tasks acknowledge.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Wait for the next message.
    ///
    /// Callers race this against their own cancellation; returning
    /// `SubscriptionError::Cancelled` is also treated as a clean stop.
    async fn receive(&self) -> Result<InboundMessage, SubscriptionError>;

    /// Like `receive`, but the caller can dispatch at most `prefetch`
    /// messages right away. Batching backends must not buffer more than
    /// that, or buffered messages outlive their ack deadline.
    async fn receive_with_prefetch(
        &self,
        prefetch: usize,
    ) -> Result<InboundMessage, SubscriptionError> {
        let _ = prefetch;
        self.receive().await
    }

    /// Release the subscription, flushing any pending acknowledgements.
    async fn shutdown(&self) -> Result<(), SubscriptionError>;
}
