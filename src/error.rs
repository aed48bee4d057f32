//! Error types for the relay.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors from the upstream subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// Receive was interrupted by shutdown. Not a failure.
    #[error("Receive cancelled")]
    Cancelled,

    #[error("Subscription {name} pull failed: {reason}")]
    PullFailed { name: String, reason: String },

    #[error("Subscription {name} acknowledge failed: {reason}")]
    AckFailed { name: String, reason: String },

    #[error("Invalid message {id}: {reason}")]
    InvalidMessage { id: String, reason: String },

    #[error("Failed to obtain access token: {0}")]
    Auth(String),

    #[error("Subscription {name} is shut down")]
    Closed { name: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Delivery sink errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Problems reading the recency attribute of a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("key '{0}' not found in message metadata")]
    MissingKey(String),

    #[error("unable to convert '{key}' metadata value {value:?}")]
    Unparsable { key: String, value: String },
}

/// Errors surfaced by the relay loop to the error-event consumer.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Receive(#[from] SubscriptionError),

    #[error(transparent)]
    Delivery(#[from] ChannelError),
}
