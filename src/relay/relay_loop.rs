//! Relay loop — receive, dispatch, deliver, acknowledge.
//!
//! One intake loop pulls messages off the subscription. Every message is
//! handed to its own task, so a slow or failing delivery never stalls
//! intake. A semaphore caps the number of deliveries in flight; the intake
//! takes a permit *before* receiving, so a received message is dispatched
//! immediately, and asks the subscription to prefetch no more messages
//! than there are permits free.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::DeliverySink;
use crate::config::RelaySettings;
use crate::error::SubscriptionError;
use crate::metadata::MetadataExtractor;
use crate::pubsub::{AckGuard, InboundMessage, Subscription};
use crate::relay::events::ErrorReporter;
use crate::relay::recency::RecencyFilter;

/// Context attached to intake failures.
pub const RECEIVE_ERROR_CONTEXT: &str = "receiving message from subscription";

/// Terminal result of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// Outside the recency window and stale messages are skipped.
    RecencyRejected,
    /// The publish time could not be read; delivered anyway.
    DeliveredWithWarning,
    DeliveryFailed,
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::RecencyRejected => "recency_rejected",
            Self::DeliveredWithWarning => "delivered_with_warning",
            Self::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Append the rendered metadata to the body, if there is any.
pub fn compose_text(body: &str, metadata: &str) -> String {
    if metadata.is_empty() {
        body.to_string()
    } else {
        format!("{body} ({metadata})")
    }
}

/// Per-message work, shared by all delivery tasks.
struct Delivery {
    sink: Arc<dyn DeliverySink>,
    channel: String,
    extractor: MetadataExtractor,
    recency: Option<RecencyFilter>,
    skip_stale: bool,
    reporter: ErrorReporter,
}

impl Delivery {
    /// Handle one message. The guard acknowledges on every return path.
    async fn handle(&self, message: AckGuard) -> RelayOutcome {
        let id = message.id().unwrap_or("-").to_string();
        let mut warned = false;

        if let Some(filter) = &self.recency {
            match filter.is_recent(message.metadata()) {
                Ok(true) => {}
                Ok(false) if self.skip_stale => {
                    info!(
                        id = %id,
                        max_age = ?filter.max_age(),
                        "Skipping message older than recency window"
                    );
                    return RelayOutcome::RecencyRejected;
                }
                Ok(false) => {
                    info!(
                        id = %id,
                        max_age = ?filter.max_age(),
                        "Message older than recency window"
                    );
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "determining publish time");
                    warned = true;
                }
            }
        }

        let text = compose_text(
            &message.body_text(),
            &self.extractor.extract_string(message.metadata()),
        );

        match self.sink.post(&self.channel, &text).await {
            Ok(()) => {
                debug!(id = %id, channel = %self.channel, "Relayed message");
                if warned {
                    RelayOutcome::DeliveredWithWarning
                } else {
                    RelayOutcome::Delivered
                }
            }
            Err(e) => {
                self.reporter.report(
                    e,
                    format!("posting message to destination channel {:?}", self.channel),
                );
                RelayOutcome::DeliveryFailed
            }
        }
    }
}

/// Relays messages from a subscription to a delivery sink.
pub struct Relay {
    subscription: Arc<dyn Subscription>,
    delivery: Arc<Delivery>,
    in_flight: Arc<Semaphore>,
    shutdown_timeout: Duration,
}

impl Relay {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        sink: Arc<dyn DeliverySink>,
        settings: RelaySettings,
        reporter: ErrorReporter,
    ) -> Self {
        let delivery = Delivery {
            sink,
            channel: settings.channel,
            extractor: MetadataExtractor::new(settings.metadata_keys),
            recency: settings.ignore_messages_older_than.map(RecencyFilter::new),
            skip_stale: settings.skip_stale_messages,
            reporter,
        };
        Self {
            subscription,
            delivery: Arc::new(delivery),
            in_flight: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    /// Handle a single message inline, acknowledging it before returning.
    pub async fn relay_one(&self, message: InboundMessage) -> RelayOutcome {
        self.delivery.handle(AckGuard::new(message)).await
    }

    /// Run until `cancel` fires, then wait (bounded) for in-flight deliveries.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            subscription = %self.subscription.name(),
            sink = %self.delivery.sink.name(),
            channel = %self.delivery.channel,
            "Relay started"
        );

        let mut tasks: JoinSet<RelayOutcome> = JoinSet::new();

        loop {
            while let Some(finished) = tasks.try_join_next() {
                log_finished(finished);
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.in_flight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Our own permit plus every free one.
            let prefetch = self.in_flight.available_permits() + 1;
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.subscription.receive_with_prefetch(prefetch) => received,
            };

            match received {
                Ok(message) => {
                    debug!(
                        id = message.id().unwrap_or("-"),
                        body = %message.body_text(),
                        metadata = ?message.metadata(),
                        "Received message"
                    );
                    let delivery = Arc::clone(&self.delivery);
                    tasks.spawn(async move {
                        let _permit = permit;
                        delivery.handle(AckGuard::new(message)).await
                    });
                }
                Err(SubscriptionError::Cancelled) => break,
                Err(SubscriptionError::Closed { name }) => {
                    error!(subscription = %name, "Subscription closed, stopping relay");
                    break;
                }
                Err(e) => self.delivery.reporter.report(e, RECEIVE_ERROR_CONTEXT),
            }
        }

        self.drain(tasks).await;
        info!("Relay stopped");
    }

    async fn drain(&self, mut tasks: JoinSet<RelayOutcome>) {
        if tasks.is_empty() {
            return;
        }

        info!(in_flight = tasks.len(), "Waiting for in-flight deliveries");
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(finished) = tasks.join_next().await {
                log_finished(finished);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout = ?self.shutdown_timeout,
                "Deliveries still running after shutdown timeout, detaching"
            );
            tasks.detach_all();
        }
    }
}

fn log_finished(finished: Result<RelayOutcome, JoinError>) {
    match finished {
        Ok(outcome) => debug!(outcome = outcome.label(), "Delivery task finished"),
        Err(e) => error!("Delivery task failed: {e}"),
    }
}
