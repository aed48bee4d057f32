//! Google Cloud Pub/Sub subscription over the REST v1 API.
//!
//! Native implementation of pull + acknowledge:
//! - `receive()` pulls a batch, buffers it, and hands out one message at a time;
//!   the batch is capped by the caller's prefetch so nothing sits buffered
//!   while its ack deadline runs
//! - a failed pull is returned only after a backoff delay (100ms doubling to 10s)
//! - acknowledgements are queued by ack id and flushed in batches by a
//!   background task, so acknowledging never blocks a delivery task
//! - `shutdown()` stops the acker after a final flush

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{InboundMessage, Subscription};
use crate::config::{PubsubAuth, PubsubConfig};
use crate::error::SubscriptionError;

/// GCE metadata server token endpoint.
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// OAuth scope requested for service-account tokens.
const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

/// Refresh cached tokens this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The Pub/Sub API rejects acknowledge calls with more ids than this.
const MAX_ACK_IDS_PER_REQUEST: usize = 2500;

/// First delay after a failed pull.
const PULL_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// Ceiling for the pull backoff.
const PULL_BACKOFF_MAX: Duration = Duration::from_secs(10);

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

// ── Token source ────────────────────────────────────────────────────

/// Supplies bearer tokens for Pub/Sub requests.
pub struct TokenSource {
    auth: PubsubAuth,
    service_account: Option<CustomServiceAccount>,
    client: reqwest::Client,
    metadata_url: String,
    cached: Mutex<Option<(SecretString, Instant)>>,
}

impl TokenSource {
    /// Build a token source. A service-account key file is read and
    /// validated here, so a bad path fails at startup.
    pub fn new(auth: PubsubAuth, client: reqwest::Client) -> Result<Self, SubscriptionError> {
        let service_account = match &auth {
            PubsubAuth::ServiceAccountKey(path) => Some(
                CustomServiceAccount::from_file(path).map_err(|e| {
                    SubscriptionError::Auth(format!(
                        "loading service account key {}: {e}",
                        path.display()
                    ))
                })?,
            ),
            _ => None,
        };
        Ok(Self {
            auth,
            service_account,
            client,
            metadata_url: METADATA_TOKEN_URL.to_string(),
            cached: Mutex::new(None),
        })
    }

    /// Point the metadata-server lookup somewhere else.
    pub fn with_metadata_url(mut self, url: impl Into<String>) -> Self {
        self.metadata_url = url.into();
        self
    }

    /// Current bearer token, or `None` when no auth is configured.
    pub async fn bearer(&self) -> Result<Option<SecretString>, SubscriptionError> {
        match &self.auth {
            PubsubAuth::None => Ok(None),
            PubsubAuth::StaticToken(token) => Ok(Some(token.clone())),
            PubsubAuth::ServiceAccountKey(_) => self.service_account_token().await.map(Some),
            PubsubAuth::MetadataServer => self.metadata_token().await.map(Some),
        }
    }

    /// Token signed with the key file; `gcp_auth` caches it until expiry.
    async fn service_account_token(&self) -> Result<SecretString, SubscriptionError> {
        let Some(account) = &self.service_account else {
            return Err(SubscriptionError::Auth("service account key not loaded".into()));
        };
        let token = account
            .token(&[PUBSUB_SCOPE])
            .await
            .map_err(|e| SubscriptionError::Auth(e.to_string()))?;
        Ok(SecretString::from(token.as_str().to_string()))
    }

    async fn metadata_token(&self) -> Result<SecretString, SubscriptionError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < *expires_at {
                return Ok(token.clone());
            }
        }

        let resp = self
            .client
            .get(&self.metadata_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| SubscriptionError::Auth(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SubscriptionError::Auth(format!(
                "metadata server returned {status}: {body}"
            )));
        }

        let token: MetadataToken = resp
            .json()
            .await
            .map_err(|e| SubscriptionError::Auth(e.to_string()))?;

        debug!(expires_in = token.expires_in, "Fetched access token from metadata server");

        let secret = SecretString::from(token.access_token);
        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        *cached = Some((secret.clone(), expires_at));
        Ok(secret)
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// Shared HTTP plumbing for pull and acknowledge.
struct Api {
    client: reqwest::Client,
    tokens: TokenSource,
    base_url: String,
    name: String,
}

impl Api {
    fn url(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.base_url)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
    ) -> Result<reqwest::RequestBuilder, SubscriptionError> {
        let mut req = self.client.request(method, url);
        if let Some(token) = self.tokens.bearer().await? {
            req = req.bearer_auth(token.expose_secret());
        }
        Ok(req)
    }

    async fn pull(&self, max_messages: u32) -> Result<PullResponse, SubscriptionError> {
        let resp = self
            .request(reqwest::Method::POST, self.url(":pull"))
            .await?
            .json(&serde_json::json!({ "maxMessages": max_messages }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SubscriptionError::PullFailed {
                name: self.name.clone(),
                reason: format!("{status}: {body}"),
            });
        }

        Ok(resp.json().await?)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SubscriptionError> {
        for chunk in ack_ids.chunks(MAX_ACK_IDS_PER_REQUEST) {
            let resp = self
                .request(reqwest::Method::POST, self.url(":acknowledge"))
                .await?
                .json(&serde_json::json!({ "ackIds": chunk }))
                .send()
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(SubscriptionError::AckFailed {
                    name: self.name.clone(),
                    reason: format!("{status}: {body}"),
                });
            }
        }
        Ok(())
    }
}

/// Exponential delay between failed pulls.
#[derive(Debug)]
struct PullBackoff {
    current: Option<Duration>,
}

impl PullBackoff {
    fn new() -> Self {
        Self { current: None }
    }

    /// Delay to wait after the next failure.
    fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            Some(d) => (d * 2).min(PULL_BACKOFF_MAX),
            None => PULL_BACKOFF_INITIAL,
        };
        self.current = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Pulled-but-not-handed-out messages plus pull health.
struct PullState {
    buffer: VecDeque<Result<InboundMessage, SubscriptionError>>,
    backoff: PullBackoff,
}

/// A Pub/Sub subscription consumed through the REST API.
pub struct GcpSubscription {
    api: Arc<Api>,
    max_messages: u32,
    state: Mutex<PullState>,
    ack_tx: mpsc::UnboundedSender<String>,
    acker: std::sync::Mutex<Option<JoinHandle<()>>>,
    stop_acker: CancellationToken,
    closed: AtomicBool,
}

impl GcpSubscription {
    /// Open the subscription, verifying it exists and credentials work.
    pub async fn open(config: PubsubConfig) -> Result<Self, SubscriptionError> {
        let client = reqwest::Client::new();
        let tokens = TokenSource::new(config.auth.clone(), client.clone())?;
        Self::open_with(config, client, tokens).await
    }

    /// Open with an explicit HTTP client and token source.
    pub async fn open_with(
        config: PubsubConfig,
        client: reqwest::Client,
        tokens: TokenSource,
    ) -> Result<Self, SubscriptionError> {
        let name = config.subscription_path();
        let api = Arc::new(Api {
            client,
            tokens,
            base_url: format!("{}/v1/{name}", config.endpoint),
            name,
        });

        let resp = api
            .request(reqwest::Method::GET, api.url(""))
            .await?
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SubscriptionError::PullFailed {
                name: api.name.clone(),
                reason: format!("opening subscription: {status}: {body}"),
            });
        }

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let stop_acker = CancellationToken::new();
        let acker = tokio::spawn(run_acker(
            Arc::clone(&api),
            ack_rx,
            stop_acker.clone(),
            config.ack_batch_size.max(1),
            config.ack_flush_interval,
        ));

        info!(subscription = %api.name, "Opened Pub/Sub subscription");

        Ok(Self {
            api,
            max_messages: config.max_messages.max(1),
            state: Mutex::new(PullState {
                buffer: VecDeque::new(),
                backoff: PullBackoff::new(),
            }),
            ack_tx,
            acker: std::sync::Mutex::new(Some(acker)),
            stop_acker,
            closed: AtomicBool::new(false),
        })
    }

    fn decode(&self, received: ReceivedMessage) -> Result<InboundMessage, SubscriptionError> {
        let ReceivedMessage { ack_id, message } = received;

        let body = match base64::engine::general_purpose::STANDARD.decode(message.data.as_bytes()) {
            Ok(body) => body,
            Err(e) => {
                // Undecodable payloads would only be redelivered forever.
                let _ = self.ack_tx.send(ack_id);
                return Err(SubscriptionError::InvalidMessage {
                    id: message.message_id,
                    reason: format!("data is not valid base64: {e}"),
                });
            }
        };

        let ack_tx = self.ack_tx.clone();
        let msg = InboundMessage::new(body, message.attributes, move || {
            if ack_tx.send(ack_id).is_err() {
                warn!("Acknowledgement dropped: subscription already shut down");
            }
        });

        Ok(if message.message_id.is_empty() {
            msg
        } else {
            msg.with_id(message.message_id)
        })
    }
}

#[async_trait]
impl Subscription for GcpSubscription {
    fn name(&self) -> &str {
        &self.api.name
    }

    async fn receive(&self) -> Result<InboundMessage, SubscriptionError> {
        self.receive_with_prefetch(self.max_messages as usize).await
    }

    async fn receive_with_prefetch(
        &self,
        prefetch: usize,
    ) -> Result<InboundMessage, SubscriptionError> {
        let batch = u32::try_from(prefetch)
            .unwrap_or(u32::MAX)
            .clamp(1, self.max_messages);

        let mut state = self.state.lock().await;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(SubscriptionError::Closed {
                    name: self.api.name.clone(),
                });
            }

            if let Some(next) = state.buffer.pop_front() {
                return next;
            }

            match self.api.pull(batch).await {
                Ok(pulled) => {
                    state.backoff.reset();
                    debug!(
                        subscription = %self.api.name,
                        requested = batch,
                        count = pulled.received_messages.len(),
                        "Pulled messages"
                    );
                    for received in pulled.received_messages {
                        state.buffer.push_back(self.decode(received));
                    }
                }
                Err(e) => {
                    let delay = state.backoff.next_delay();
                    drop(state);
                    debug!(subscription = %self.api.name, delay = ?delay, "Pull failed, backing off");
                    tokio::time::sleep(delay).await;
                    return Err(e);
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), SubscriptionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Buffered messages were never handed out; let them redeliver.
        self.state.lock().await.buffer.clear();

        self.stop_acker.cancel();
        let handle = self
            .acker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| SubscriptionError::AckFailed {
                name: self.api.name.clone(),
                reason: format!("acker task failed: {e}"),
            })?;
        }

        info!(subscription = %self.api.name, "Pub/Sub subscription shut down");
        Ok(())
    }
}

/// Batch acknowledgements until stopped, then flush what is left.
async fn run_acker(
    api: Arc<Api>,
    mut rx: mpsc::UnboundedReceiver<String>,
    stop: CancellationToken,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut pending: Vec<String> = Vec::new();
    let mut tick = tokio::time::interval(flush_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = rx.recv() => match received {
                Some(ack_id) => {
                    pending.push(ack_id);
                    if pending.len() >= batch_size {
                        flush(&api, &mut pending).await;
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                if !pending.is_empty() {
                    flush(&api, &mut pending).await;
                }
            }
        }
    }

    while let Ok(ack_id) = rx.try_recv() {
        pending.push(ack_id);
    }
    if !pending.is_empty() {
        flush(&api, &mut pending).await;
    }
    debug!(subscription = %api.name, "Acker stopped");
}

async fn flush(api: &Api, pending: &mut Vec<String>) {
    let ack_ids = std::mem::take(pending);
    match api.acknowledge(&ack_ids).await {
        Ok(()) => debug!(subscription = %api.name, count = ack_ids.len(), "Acknowledged messages"),
        // The messages will be redelivered once their ack deadline passes.
        Err(e) => warn!(subscription = %api.name, count = ack_ids.len(), "Acknowledge failed: {e}"),
    }
}
