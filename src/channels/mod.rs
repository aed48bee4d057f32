//! Delivery sinks for relayed messages.

pub mod channel;
pub mod slack;

pub use channel::DeliverySink;
pub use slack::SlackSink;
