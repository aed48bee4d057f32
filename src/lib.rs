//! pubsub-relay — relays Pub/Sub messages to a chat channel.

pub mod channels;
pub mod config;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod pubsub;
pub mod relay;
pub mod server;
