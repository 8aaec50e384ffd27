//! Message types for mqlink
//!
//! `PendingMessage` is what sits in a producer's backlog; `InboundMessage`
//! is what a consumer receives from the broker.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-side identifier for an outbound message, used for log correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message waiting in the producer backlog
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Client-side identifier
    pub id: MessageId,

    /// Message body (raw bytes)
    pub payload: Bytes,

    /// When the application handed the message over
    pub enqueued_at: DateTime<Utc>,
}

impl PendingMessage {
    /// Create a new pending message with the given payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            payload: payload.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Time spent since the message was enqueued
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Opaque broker handle identifying one delivery for acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message delivered by the broker to a consumer
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Message body (raw bytes)
    pub payload: Bytes,

    /// Tag to acknowledge this delivery with
    pub delivery_tag: DeliveryTag,

    /// Whether the broker has delivered this message before
    pub redelivered: bool,
}

impl InboundMessage {
    /// Get the payload as a string (if valid UTF-8)
    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_message_creation() {
        let a = PendingMessage::new("Hello, World!");
        let b = PendingMessage::new(Bytes::from_static(b"Hello, World!"));
        assert_eq!(a.payload, b.payload);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_inbound_payload_as_str() {
        let msg = InboundMessage {
            payload: Bytes::from_static(b"x"),
            delivery_tag: DeliveryTag(7),
            redelivered: false,
        };
        assert_eq!(msg.payload_as_str(), Some("x"));

        let binary = InboundMessage {
            payload: Bytes::from_static(&[0xff, 0xfe]),
            ..msg
        };
        assert_eq!(binary.payload_as_str(), None);
    }
}
