//! Internal message types for Porchlight.
//!
//! These types are used internally for routing and delivery.

use bytes::Bytes;
use porchlight_protocol::QoS;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An immutable published message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Publishing connection, `None` when published by the broker itself.
    pub source: Option<String>,
    /// Target topic.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Delivery guarantee requested by the publisher.
    pub qos: QoS,
    /// Whether the topic should keep this payload for late subscribers.
    pub retain: bool,
    /// Milliseconds since the Unix epoch when the message was created.
    pub timestamp: u64,
}

impl Message {
    /// Create a new at-most-once, non-retained message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            source: None,
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            timestamp: now_millis(),
        }
    }

    /// Set the source connection.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the delivery guarantee.
    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the retain flag.
    #[must_use]
    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

/// A message on its way to one subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The shared message.
    pub message: Arc<Message>,
    /// Effective QoS: the lower of the subscription's and the publisher's.
    pub qos: QoS,
    /// Delivered from the retained slot on subscribe rather than live.
    pub retained: bool,
}

impl Delivery {
    /// Create a live delivery.
    #[must_use]
    pub fn new(message: Arc<Message>, qos: QoS) -> Self {
        Self {
            message,
            qos,
            retained: false,
        }
    }

    /// Create a delivery from the retained slot.
    #[must_use]
    pub fn from_retained(message: Arc<Message>, qos: QoS) -> Self {
        Self {
            message,
            qos,
            retained: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("package_exists", br#"{"present":true}"#.to_vec());
        assert_eq!(msg.topic, "package_exists");
        assert_eq!(msg.qos, QoS::AtMostOnce);
        assert!(!msg.retain);
        assert!(msg.source.is_none());
    }

    #[test]
    fn test_message_builders() {
        let msg = Message::new("led_flashing", b"{}".to_vec())
            .with_source("conn-1")
            .with_qos(QoS::AtLeastOnce)
            .retained(true);

        assert_eq!(msg.source.as_deref(), Some("conn-1"));
        assert_eq!(msg.qos, QoS::AtLeastOnce);
        assert!(msg.retain);
        assert_eq!(msg.payload_size(), 2);
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
    }
}
