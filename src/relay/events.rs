//! Error events — counted, then forwarded to a single logging consumer.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

use crate::error::RelayError;
use crate::metrics::RelayMetrics;

/// A failure plus the stage that produced it.
#[derive(Debug)]
pub struct ErrorEvent {
    pub context: String,
    pub error: RelayError,
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.error)
    }
}

/// Producer half of the error stream. Cheap to clone.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<ErrorEvent>,
    metrics: Arc<RelayMetrics>,
}

/// Create a bounded error stream.
pub fn error_channel(
    capacity: usize,
    metrics: Arc<RelayMetrics>,
) -> (ErrorReporter, mpsc::Receiver<ErrorEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ErrorReporter { tx, metrics }, rx)
}

impl ErrorReporter {
    /// Count one failure and forward it without waiting.
    ///
    /// When the consumer is behind, the event is dropped and the drop is
    /// counted; the error counter is incremented either way.
    pub fn report(&self, error: impl Into<RelayError>, context: impl Into<String>) {
        self.metrics.inc_errors();

        let event = ErrorEvent {
            context: context.into(),
            error: error.into(),
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.metrics.inc_error_events_dropped();
                warn!(context = %event.context, "Error channel full, dropping error event");
            }
            Err(TrySendError::Closed(event)) => {
                self.metrics.inc_error_events_dropped();
                error!(context = %event.context, error = %event.error, "Error consumer gone");
            }
        }
    }
}

/// Log every event until all reporters are dropped.
pub async fn log_error_events(mut rx: mpsc::Receiver<ErrorEvent>) {
    while let Some(event) = rx.recv().await {
        error!(context = %event.context, error = %event.error, "received error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChannelError, SubscriptionError};

    fn metrics() -> Arc<RelayMetrics> {
        Arc::new(RelayMetrics::new("test").unwrap())
    }

    #[tokio::test]
    async fn report_counts_and_forwards() {
        let metrics = metrics();
        let (reporter, mut rx) = error_channel(8, Arc::clone(&metrics));

        reporter.report(
            SubscriptionError::PullFailed {
                name: "sub".into(),
                reason: "503".into(),
            },
            "receiving message from subscription",
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.context, "receiving message from subscription");
        assert!(matches!(event.error, RelayError::Receive(_)));
        assert!(event.to_string().starts_with("receiving message from subscription: "));
        assert_eq!(metrics.errors_total(), 1);
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let metrics = metrics();
        let (reporter, _rx) = error_channel(1, Arc::clone(&metrics));

        for _ in 0..3 {
            reporter.report(
                ChannelError::SendFailed {
                    name: "slack".into(),
                    reason: "boom".into(),
                },
                "posting",
            );
        }

        assert_eq!(metrics.errors_total(), 3);
        assert_eq!(metrics.error_events_dropped_total(), 2);
    }

    #[test]
    fn closed_consumer_still_counts() {
        let metrics = metrics();
        let (reporter, rx) = error_channel(4, Arc::clone(&metrics));
        drop(rx);

        reporter.report(
            ChannelError::RateLimited {
                name: "slack".into(),
                retry_after: None,
            },
            "posting",
        );
        assert_eq!(metrics.errors_total(), 1);
        assert_eq!(metrics.error_events_dropped_total(), 1);
    }

    #[tokio::test]
    async fn consumer_exits_when_reporters_drop() {
        let (reporter, rx) = error_channel(4, metrics());
        reporter.report(SubscriptionError::Cancelled, "ctx");
        drop(reporter);
        // Returns once the only event is drained and the channel closes.
        log_error_events(rx).await;
    }
}
