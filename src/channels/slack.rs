//! Slack sink — posts through the Web API `chat.postMessage` method.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::DeliverySink;
use crate::config::SlackConfig;
use crate::error::ChannelError;

const SLACK: &str = "slack";

/// Upper bound on a single Web API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack API error codes that mean the token is unusable.
const AUTH_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "token_expired",
];

/// Envelope shared by every Slack Web API response.
#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Slack delivery sink.
pub struct SlackSink {
    token: SecretString,
    api_url: String,
    client: reqwest::Client,
}

impl SlackSink {
    pub fn new(config: SlackConfig) -> Result<Self, ChannelError> {
        Self::with_timeout(config, REQUEST_TIMEOUT)
    }

    /// Build a sink whose Web API calls give up after `timeout`.
    pub fn with_timeout(config: SlackConfig, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            token: config.token,
            api_url: config.api_url,
            client,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.api_url)
    }

    /// Call a Web API method and map the response envelope to an error.
    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: SLACK.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ChannelError::RateLimited {
                name: SLACK.into(),
                retry_after,
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: SLACK.into(),
                reason: format!("{method} returned {status}: {body}"),
            });
        }

        let envelope: SlackResponse = resp.json().await.map_err(|e| ChannelError::SendFailed {
            name: SLACK.into(),
            reason: format!("invalid {method} response: {e}"),
        })?;

        if envelope.ok {
            return Ok(());
        }

        let code = envelope.error.unwrap_or_else(|| "unknown_error".to_string());
        Err(classify_error(code))
    }
}

/// Map a Slack `error` code to a channel error.
fn classify_error(code: String) -> ChannelError {
    if code == "ratelimited" {
        ChannelError::RateLimited {
            name: SLACK.into(),
            retry_after: None,
        }
    } else if AUTH_ERRORS.contains(&code.as_str()) {
        ChannelError::AuthFailed {
            name: SLACK.into(),
            reason: code,
        }
    } else {
        ChannelError::SendFailed {
            name: SLACK.into(),
            reason: code,
        }
    }
}

#[async_trait]
impl DeliverySink for SlackSink {
    fn name(&self) -> &str {
        SLACK
    }

    async fn post(&self, channel: &str, text: &str) -> Result<(), ChannelError> {
        let body = serde_json::json!({
            "channel": channel,
            "text": text,
        });
        self.call("chat.postMessage", &body).await?;
        tracing::debug!(channel, "Posted message to Slack");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        self.call("auth.test", &serde_json::json!({})).await
    }
}

// ── Tests ───────────────────────────────────────────────────────────
