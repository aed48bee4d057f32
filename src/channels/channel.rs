//! Delivery sink trait.

use async_trait::async_trait;

use crate::error::ChannelError;

/// Posts a line of text to a destination channel.
///
/// One call is one delivery attempt. Implementations must not retry
/// internally; the relay treats any error as final for that message.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Sink name used in logs.
    fn name(&self) -> &str;

    /// Post `text` to `channel`.
    async fn post(&self, channel: &str, text: &str) -> Result<(), ChannelError>;

    /// Verify credentials and connectivity.
    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
