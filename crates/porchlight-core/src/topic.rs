//! Topic abstraction for Porchlight.
//!
//! A topic is a named channel holding its subscribers and the last
//! retained message.

use crate::message::{Delivery, Message};
use porchlight_protocol::{min_qos, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Per-connection delivery queue.
///
/// Unbounded so the publishing task never waits on a slow subscriber, and
/// FIFO so messages from one publisher arrive in publish order.
pub type Outbox = mpsc::UnboundedSender<Delivery>;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if name.starts_with('$') {
        return Err("Topic names starting with '$' are reserved");
    }
    if name.contains(['+', '#']) {
        return Err("Wildcard topics are not supported");
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("Topic name contains invalid characters");
    }
    Ok(())
}

#[derive(Debug)]
struct Subscriber {
    qos: QoS,
    outbox: Outbox,
}

/// A topic for pub/sub messaging.
#[derive(Debug)]
pub struct Topic {
    name: String,
    retained: Option<Arc<Message>>,
    subscribers: HashMap<String, Subscriber>,
}

impl Topic {
    /// Create a new, empty topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retained: None,
            subscribers: HashMap::new(),
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    /// The retained message, if any.
    #[must_use]
    pub fn retained(&self) -> Option<&Arc<Message>> {
        self.retained.as_ref()
    }

    /// Subscribe a connection to this topic.
    ///
    /// The retained message is queued to the outbox before the connection
    /// joins the subscriber set. Subscribing again replaces the granted QoS.
    /// Returns `true` if a retained message was delivered.
    pub fn subscribe(&mut self, connection_id: impl Into<String>, qos: QoS, outbox: Outbox) -> bool {
        let conn_id = connection_id.into();

        let delivered = match &self.retained {
            Some(message) => {
                let delivery = Delivery::from_retained(message.clone(), min_qos(qos, message.qos));
                outbox.send(delivery).is_ok()
            }
            None => false,
        };

        self.subscribers.insert(conn_id.clone(), Subscriber { qos, outbox });
        debug!(topic = %self.name, connection = %conn_id, retained = delivered, "Connection subscribed");
        delivered
    }

    /// Unsubscribe a connection from this topic.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, connection_id: &str) -> bool {
        let removed = self.subscribers.remove(connection_id).is_some();
        if removed {
            debug!(topic = %self.name, connection = %connection_id, "Connection unsubscribed");
        }
        removed
    }

    /// Publish a message to this topic.
    ///
    /// A retained message replaces the retained slot; a retained message
    /// with an empty payload clears it. Returns the number of subscribers
    /// the message was queued to.
    pub fn publish(&mut self, message: Arc<Message>) -> usize {
        if message.retain {
            if message.payload.is_empty() {
                self.retained = None;
                trace!(topic = %self.name, "Cleared retained message");
            } else {
                self.retained = Some(message.clone());
            }
        }

        let mut delivered = 0;
        for subscriber in self.subscribers.values() {
            let delivery = Delivery::new(message.clone(), min_qos(subscriber.qos, message.qos));
            if subscriber.outbox.send(delivery).is_ok() {
                delivered += 1;
            }
        }

        trace!(topic = %self.name, recipients = delivered, "Publishing message");
        delivered
    }
}
