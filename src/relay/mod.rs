//! Message relay pipeline.
//!
//! Every message received from the subscription flows through:
//! 1. `RecencyFilter`: publish-time check (annotation unless configured to skip)
//! 2. `MetadataExtractor`: allow-listed attributes appended to the body
//! 3. `DeliverySink::post()`: one delivery attempt
//! 4. Acknowledgement: always, whatever happened above
//!
//! Failures are counted and forwarded as `ErrorEvent`s; none stop the loop.

pub mod events;
pub mod recency;
pub mod relay_loop;

pub use events::{ErrorEvent, ErrorReporter, error_channel, log_error_events};
pub use recency::{PUBLISH_TIME_METADATA_KEY, RecencyFilter};
pub use relay_loop::{Relay, RelayOutcome, compose_text};
