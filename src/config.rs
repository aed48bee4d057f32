//! Configuration types.
//!
//! Everything is read from environment variables. `from_lookup` takes the
//! lookup as a closure so tests never touch the process environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Slack channel when `SLACK_CHANNEL` is unset.
pub const DEFAULT_SLACK_CHANNEL: &str = "chatops-dev";

/// Default metrics namespace (prefix).
pub const DEFAULT_METRICS_NAMESPACE: &str = "pubsubslack";

/// Default Pub/Sub REST endpoint.
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Default Slack Web API base URL.
pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api";

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log filter directive (`LOGLEVEL`), e.g. `debug` or `pubsub_relay=trace`.
    /// Falls back to `RUST_LOG` when unset.
    pub log_level: Option<String>,
    /// Address the health/metrics server binds to.
    pub listen_addr: SocketAddr,
    /// Prefix for exported metric names.
    pub metrics_namespace: String,
    pub pubsub: PubsubConfig,
    pub slack: SlackConfig,
    pub relay: RelaySettings,
}

/// How the Pub/Sub client authenticates.
#[derive(Debug, Clone)]
pub enum PubsubAuth {
    /// No credentials (local emulator).
    None,
    /// A pre-issued OAuth2 access token.
    StaticToken(SecretString),
    /// Sign token requests with a service-account key file
    /// (`GOOGLE_APPLICATION_CREDENTIALS`).
    ServiceAccountKey(PathBuf),
    /// Fetch tokens from the GCE metadata server.
    MetadataServer,
}

/// Pub/Sub subscription settings.
#[derive(Debug, Clone)]
pub struct PubsubConfig {
    pub project: String,
    pub subscription: String,
    /// Base URL, without the `/v1` suffix.
    pub endpoint: String,
    pub auth: PubsubAuth,
    /// Upper bound on messages returned by a single pull.
    pub max_messages: u32,
    /// Acks are flushed once this many are pending...
    pub ack_batch_size: usize,
    /// ...or after this long, whichever comes first.
    pub ack_flush_interval: Duration,
}

impl PubsubConfig {
    /// Fully-qualified subscription resource name.
    pub fn subscription_path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project, self.subscription
        )
    }
}

/// Slack sink settings.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub token: SecretString,
    pub api_url: String,
}

/// Settings consumed by the relay loop itself.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Destination channel for every relayed message.
    pub channel: String,
    /// Allow-listed metadata keys appended to the message body.
    pub metadata_keys: Vec<String>,
    /// Recency window. `None` disables the publish-time check.
    pub ignore_messages_older_than: Option<Duration>,
    /// Drop messages outside the recency window instead of only logging them.
    pub skip_stale_messages: bool,
    /// Maximum number of concurrent deliveries.
    pub max_in_flight: usize,
    /// Capacity of the error-event channel.
    pub error_channel_capacity: usize,
    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            channel: DEFAULT_SLACK_CHANNEL.to_string(),
            metadata_keys: Vec::new(),
            ignore_messages_older_than: Some(Duration::from_secs(600)), // 10 minutes
            skip_stale_messages: false,
            max_in_flight: 64,
            error_channel_capacity: 1024,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let project = require("GCP_PROJECT")?;
        let subscription = require("PUBSUB_SUBSCRIPTION")?;
        let slack_token = get("SLACK_TOKEN").ok_or_else(|| ConfigError::MissingRequired {
            key: "SLACK_TOKEN".into(),
            hint: "No Slack token provided.".into(),
        })?;

        let log_level = get("LOGLEVEL");

        let listen_addr = parse_listen_addr(&get("LISTEN_ADDR").unwrap_or_else(|| ":8080".into()))?;

        let metrics_namespace =
            get("METRICS_NAMESPACE").unwrap_or_else(|| DEFAULT_METRICS_NAMESPACE.to_string());

        let (endpoint, auth) = match get("PUBSUB_EMULATOR_HOST") {
            Some(host) => (format!("http://{host}"), PubsubAuth::None),
            None => {
                let endpoint =
                    get("PUBSUB_ENDPOINT").unwrap_or_else(|| DEFAULT_PUBSUB_ENDPOINT.to_string());
                let auth = match (
                    get("GOOGLE_OAUTH_ACCESS_TOKEN"),
                    get("GOOGLE_APPLICATION_CREDENTIALS"),
                ) {
                    (Some(token), _) => PubsubAuth::StaticToken(SecretString::from(token)),
                    (None, Some(path)) => PubsubAuth::ServiceAccountKey(PathBuf::from(path)),
                    (None, None) => PubsubAuth::MetadataServer,
                };
                (endpoint, auth)
            }
        };

        let pubsub = PubsubConfig {
            project,
            subscription,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth,
            max_messages: parse_or("PUBSUB_MAX_MESSAGES", get("PUBSUB_MAX_MESSAGES"), 100)?,
            ack_batch_size: parse_or("PUBSUB_ACK_BATCH_SIZE", get("PUBSUB_ACK_BATCH_SIZE"), 100)?,
            ack_flush_interval: duration_or(
                "PUBSUB_ACK_FLUSH_INTERVAL",
                get("PUBSUB_ACK_FLUSH_INTERVAL"),
                Duration::from_secs(1),
            )?,
        };

        let slack = SlackConfig {
            token: SecretString::from(slack_token),
            api_url: get("SLACK_API_URL")
                .unwrap_or_else(|| DEFAULT_SLACK_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        };

        let defaults = RelaySettings::default();

        let ignore_messages_older_than = match get("IGNORE_MESSAGES_OLDER_THAN") {
            Some(raw) => {
                let window = parse_duration(&raw).map_err(|message| ConfigError::InvalidValue {
                    key: "IGNORE_MESSAGES_OLDER_THAN".into(),
                    message,
                })?;
                (!window.is_zero()).then_some(window)
            }
            None => defaults.ignore_messages_older_than,
        };

        let metadata_keys: Vec<String> = get("METADATA_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let max_in_flight: usize =
            parse_or("MAX_IN_FLIGHT", get("MAX_IN_FLIGHT"), defaults.max_in_flight)?;
        if max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_IN_FLIGHT".into(),
                message: "must be at least 1".into(),
            });
        }

        let error_channel_capacity: usize = parse_or(
            "ERROR_CHANNEL_CAPACITY",
            get("ERROR_CHANNEL_CAPACITY"),
            defaults.error_channel_capacity,
        )?;
        if error_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ERROR_CHANNEL_CAPACITY".into(),
                message: "must be at least 1".into(),
            });
        }

        let relay = RelaySettings {
            channel: get("SLACK_CHANNEL").unwrap_or(defaults.channel),
            metadata_keys,
            ignore_messages_older_than,
            skip_stale_messages: parse_bool("SKIP_STALE_MESSAGES", get("SKIP_STALE_MESSAGES"))?,
            max_in_flight,
            error_channel_capacity,
            shutdown_timeout: duration_or(
                "SHUTDOWN_TIMEOUT",
                get("SHUTDOWN_TIMEOUT"),
                defaults.shutdown_timeout,
            )?,
        };

        Ok(Self {
            log_level,
            listen_addr,
            metrics_namespace,
            pubsub,
            slack,
            relay,
        })
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn duration_or(key: &str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match raw {
        Some(raw) => parse_duration(&raw).map_err(|message| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

/// Accepts `host:port` or a bare `:port` (binds all interfaces).
fn parse_listen_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let full = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    full.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
        key: "LISTEN_ADDR".into(),
        message: e.to_string(),
    })
}

/// Parse a duration such as `10m`, `1h30m`, `1.5s` or `250ms`.
///
/// A bare `0` is accepted. Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".into());
    }

    let mut total_nanos = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {raw:?}"))?;
        if num_len == 0 {
            return Err(format!("invalid duration {raw:?}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {raw:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 6e10,
            "h" => 3.6e12,
            unit => return Err(format!("unknown unit {unit:?} in duration {raw:?}")),
        };
        rest = &rest[unit_len..];
        total_nanos += value * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(format!("duration {raw:?} out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("GCP_PROJECT", "my-project"),
        ("PUBSUB_SUBSCRIPTION", "deploys"),
        ("SLACK_TOKEN", "xoxb-test"),
    ];

    #[test]
    fn defaults_applied() {
        let cfg = Config::from_lookup(lookup(REQUIRED)).unwrap();
        assert_eq!(cfg.relay.channel, "chatops-dev");
        assert_eq!(cfg.metrics_namespace, "pubsubslack");
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(
            cfg.relay.ignore_messages_older_than,
            Some(Duration::from_secs(600))
        );
        assert!(!cfg.relay.skip_stale_messages);
        assert!(cfg.relay.metadata_keys.is_empty());
        assert_eq!(cfg.log_level, None);
        assert_eq!(cfg.pubsub.endpoint, DEFAULT_PUBSUB_ENDPOINT);
        assert!(matches!(cfg.pubsub.auth, PubsubAuth::MetadataServer));
        assert_eq!(
            cfg.pubsub.subscription_path(),
            "projects/my-project/subscriptions/deploys"
        );
        assert_eq!(cfg.slack.token.expose_secret(), "xoxb-test");
    }

    #[test]
    fn missing_project_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("PUBSUB_SUBSCRIPTION", "deploys"),
            ("SLACK_TOKEN", "xoxb-test"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "GCP_PROJECT"));
    }

    #[test]
    fn missing_slack_token_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("GCP_PROJECT", "p"),
            ("PUBSUB_SUBSCRIPTION", "s"),
            ("SLACK_TOKEN", "   "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref key, .. } if key == "SLACK_TOKEN"));
    }

    #[test]
    fn overrides_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("SLACK_CHANNEL", "deploys"),
            ("LISTEN_ADDR", "127.0.0.1:9090"),
            ("IGNORE_MESSAGES_OLDER_THAN", "1h30m"),
            ("SKIP_STALE_MESSAGES", "true"),
            ("METADATA_KEYS", "env, service,,region"),
            ("MAX_IN_FLIGHT", "8"),
            ("GOOGLE_OAUTH_ACCESS_TOKEN", "ya29.token"),
        ]);
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.relay.channel, "deploys");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(
            cfg.relay.ignore_messages_older_than,
            Some(Duration::from_secs(5400))
        );
        assert!(cfg.relay.skip_stale_messages);
        assert_eq!(cfg.relay.metadata_keys, vec!["env", "service", "region"]);
        assert_eq!(cfg.relay.max_in_flight, 8);
        assert!(matches!(cfg.pubsub.auth, PubsubAuth::StaticToken(_)));
    }

    #[test]
    fn application_credentials_select_key_file() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("GOOGLE_APPLICATION_CREDENTIALS", "/etc/gcp/relay-sa.json"));
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert!(matches!(
            cfg.pubsub.auth,
            PubsubAuth::ServiceAccountKey(ref path) if path == std::path::Path::new("/etc/gcp/relay-sa.json")
        ));

        // An explicit access token still wins.
        pairs.push(("GOOGLE_OAUTH_ACCESS_TOKEN", "ya29.token"));
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert!(matches!(cfg.pubsub.auth, PubsubAuth::StaticToken(_)));
    }

    #[test]
    fn emulator_disables_auth() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PUBSUB_EMULATOR_HOST", "localhost:8085"));
        pairs.push(("GOOGLE_APPLICATION_CREDENTIALS", "/etc/gcp/relay-sa.json"));
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.pubsub.endpoint, "http://localhost:8085");
        assert!(matches!(cfg.pubsub.auth, PubsubAuth::None));
    }

    #[test]
    fn zero_window_disables_recency() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("IGNORE_MESSAGES_OLDER_THAN", "0"));
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(cfg.relay.ignore_messages_older_than, None);
    }

    #[test]
    fn invalid_values_rejected() {
        for (key, value) in [
            ("IGNORE_MESSAGES_OLDER_THAN", "ten minutes"),
            ("MAX_IN_FLIGHT", "0"),
            ("MAX_IN_FLIGHT", "lots"),
            ("SKIP_STALE_MESSAGES", "maybe"),
            ("LISTEN_ADDR", "nowhere"),
        ] {
            let mut pairs = REQUIRED.to_vec();
            pairs.push((key, value));
            let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { key: ref k, .. } if k == key),
                "{key}={value} gave {err}"
            );
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("m").is_err());
    }
}
