//! Publish-time recency check.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ExtractionError;

/// Attribute holding the producer's publish time, in Unix seconds.
pub const PUBLISH_TIME_METADATA_KEY: &str = "publish_time";

/// Decides whether a message is within the configured freshness window.
#[derive(Debug, Clone, Copy)]
pub struct RecencyFilter {
    max_age: Duration,
}

impl RecencyFilter {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Recency relative to the wall clock.
    pub fn is_recent(&self, metadata: &HashMap<String, String>) -> Result<bool, ExtractionError> {
        self.is_recent_at(metadata, Utc::now())
    }

    /// True when the message was published strictly after `now - max_age`.
    pub fn is_recent_at(
        &self,
        metadata: &HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<bool, ExtractionError> {
        let published = publish_time(metadata)?;
        let cutoff = chrono::Duration::from_std(self.max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age));
        // A window too large to represent admits everything.
        Ok(cutoff.is_none_or(|cutoff| published > cutoff))
    }
}

/// Read the publish time attribute.
pub fn publish_time(metadata: &HashMap<String, String>) -> Result<DateTime<Utc>, ExtractionError> {
    let raw = metadata
        .get(PUBLISH_TIME_METADATA_KEY)
        .ok_or_else(|| ExtractionError::MissingKey(PUBLISH_TIME_METADATA_KEY.to_string()))?;

    let unparsable = || ExtractionError::Unparsable {
        key: PUBLISH_TIME_METADATA_KEY.to_string(),
        value: raw.clone(),
    };

    let secs: i64 = raw.trim().parse().map_err(|_| unparsable())?;
    DateTime::from_timestamp(secs, 0).ok_or_else(unparsable)
}
