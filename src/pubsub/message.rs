//! Inbound message type and acknowledgement plumbing.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

/// Signals the subscription that a message need not be redelivered.
///
/// Consumes itself, so an acknowledger fires at most once.
pub trait Acknowledger: Send + 'static {
    fn ack(self: Box<Self>);
}

impl<F> Acknowledger for F
where
    F: FnOnce() + Send + 'static,
{
    fn ack(self: Box<Self>) {
        (*self)()
    }
}

/// A message received from the subscription.
pub struct InboundMessage {
    id: Option<String>,
    body: Vec<u8>,
    metadata: HashMap<String, String>,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        body: impl Into<Vec<u8>>,
        metadata: HashMap<String, String>,
        acker: impl Acknowledger,
    ) -> Self {
        Self {
            id: None,
            body: body.into(),
            metadata,
            acker: Box::new(acker),
        }
    }

    /// Attach the transport's message id (used only for log context).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as text; invalid UTF-8 is replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Acknowledge the message.
    pub fn ack(self) {
        self.acker.ack();
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("body", &self.body_text())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Holds a message and acknowledges it when dropped.
///
/// Every exit path of the holder, including early returns and unwinding,
/// acknowledges exactly once.
pub struct AckGuard {
    message: Option<InboundMessage>,
}

impl AckGuard {
    pub fn new(message: InboundMessage) -> Self {
        Self {
            message: Some(message),
        }
    }
}

impl Deref for AckGuard {
    type Target = InboundMessage;

    fn deref(&self) -> &InboundMessage {
        match &self.message {
            Some(message) => message,
            // Only `drop` takes the message out.
            None => unreachable!("AckGuard used after drop"),
        }
    }
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            message.ack();
        }
    }
}
