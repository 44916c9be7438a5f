//! Topic router for Porchlight.
//!
//! The router owns the topic table and the admitted connections, fans
//! published messages out to subscriber outboxes, and reports every
//! lifecycle event to its listeners.

use crate::events::{BrokerEvent, Listeners};
use crate::message::Message;
use crate::topic::{validate_topic_name, Outbox, Topic};
use dashmap::DashMap;
use porchlight_protocol::QoS;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid topic name.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// The connection was never registered or already left.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Not subscribed to topic.
    #[error("Not subscribed to topic: {0}")]
    NotSubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum number of topics reached.
    #[error("Maximum topics reached")]
    MaxTopicsReached,
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum number of topics.
    pub max_topics: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_topics: 1_000,
            max_subscriptions_per_connection: 32,
        }
    }
}

/// The narrow publishing interface handed to components that only emit
/// messages.
pub trait Publisher: Send + Sync {
    /// Route a message to the subscribers of its topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be routed.
    fn publish(&self, message: Message) -> Result<usize, RouterError>;
}

#[derive(Debug)]
struct ConnectionEntry {
    client_id: String,
    outbox: Outbox,
    topics: HashSet<String>,
}

/// The central topic router.
pub struct Router {
    /// Topics indexed by name.
    topics: DashMap<String, Topic>,
    /// Admitted connections indexed by connection ID.
    connections: DashMap<String, ConnectionEntry>,
    /// Event listeners.
    listeners: Listeners,
    /// Configuration.
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            connections: DashMap::new(),
            listeners: Listeners::default(),
            config,
        }
    }

    /// Register an event listener.
    ///
    /// The receiver sees every event emitted after this call, in emission order.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<BrokerEvent> {
        self.listeners.listen()
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            topic_count: self.topics.len(),
            connection_count: self.connections.len(),
            total_subscriptions: self.connections.iter().map(|c| c.topics.len()).sum(),
            retained_count: self.topics.iter().filter(|t| t.retained().is_some()).count(),
            listener_count: self.listeners.len(),
        }
    }

    /// Admit a connection.
    pub fn register(&self, connection_id: &str, client_id: &str, outbox: Outbox) {
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                client_id: client_id.to_string(),
                outbox,
                topics: HashSet::new(),
            },
        );
        debug!(connection = %connection_id, client = %client_id, "Registered connection");

        self.listeners.emit(BrokerEvent::Connected {
            connection_id: connection_id.to_string(),
            client_id: client_id.to_string(),
        });
    }

    /// Remove a connection and all of its subscriptions.
    ///
    /// Returns the client ID the connection was registered with.
    pub fn deregister(&self, connection_id: &str) -> Option<String> {
        let (_, entry) = self.connections.remove(connection_id)?;

        for topic_name in &entry.topics {
            if let Some(mut topic) = self.topics.get_mut(topic_name) {
                topic.unsubscribe(connection_id);
            }
        }
        debug!(connection = %connection_id, client = %entry.client_id, "Deregistered connection");

        self.listeners.emit(BrokerEvent::Disconnected {
            connection_id: connection_id.to_string(),
            client_id: entry.client_id.clone(),
        });
        Some(entry.client_id)
    }

    /// Subscribe a connection to a topic.
    ///
    /// The retained message, if any, is queued to the connection before it
    /// joins the subscriber set. Returns `true` if a retained message was
    /// queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid, the connection is
    /// unknown, or limits are exceeded.
    pub fn subscribe(
        &self,
        connection_id: &str,
        topic_name: &str,
        qos: QoS,
    ) -> Result<bool, RouterError> {
        validate_topic_name(topic_name).map_err(RouterError::InvalidTopic)?;

        let mut conn = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RouterError::UnknownConnection(connection_id.to_string()))?;

        let resubscribe = conn.topics.contains(topic_name);
        if !resubscribe && conn.topics.len() >= self.config.max_subscriptions_per_connection {
            return Err(RouterError::MaxSubscriptionsReached);
        }

        let mut topic = self.topic_entry(topic_name)?;
        let retained = topic.subscribe(connection_id, qos, conn.outbox.clone());
        conn.topics.insert(topic_name.to_string());

        debug!(
            topic = %topic_name,
            connection = %connection_id,
            subscribers = topic.subscriber_count(),
            "Subscribed"
        );
        drop(topic);
        drop(conn);

        self.listeners.emit(BrokerEvent::Subscribed {
            connection_id: connection_id.to_string(),
            topic: topic_name.to_string(),
        });
        Ok(retained)
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, topic_name: &str) -> Result<(), RouterError> {
        let removed = self
            .connections
            .get_mut(connection_id)
            .map(|mut conn| conn.topics.remove(topic_name))
            .unwrap_or(false);
        if !removed {
            return Err(RouterError::NotSubscribed(topic_name.to_string()));
        }

        if let Some(mut topic) = self.topics.get_mut(topic_name) {
            topic.unsubscribe(connection_id);
        }
        debug!(topic = %topic_name, connection = %connection_id, "Unsubscribed");
        Ok(())
    }

    /// Publish a message to its topic.
    ///
    /// Publishing to a topic without subscribers is not an error; a retained
    /// message still updates the retained slot. Returns the number of
    /// subscribers the message was queued to.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid or the topic table is full.
    pub fn publish(&self, message: Message) -> Result<usize, RouterError> {
        validate_topic_name(&message.topic).map_err(RouterError::InvalidTopic)?;

        let message = Arc::new(message);
        let count = self.topic_entry(&message.topic)?.publish(message.clone());
        trace!(topic = %message.topic, recipients = count, retain = message.retain, "Published message");

        self.listeners.emit(BrokerEvent::Published(message));
        Ok(count)
    }

    /// Publish a raw payload from the broker itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn publish_to(
        &self,
        topic_name: &str,
        payload: impl Into<bytes::Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<usize, RouterError> {
        self.publish(
            Message::new(topic_name, payload)
                .with_qos(qos)
                .retained(retain),
        )
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn topic_exists(&self, topic_name: &str) -> bool {
        self.topics.contains_key(topic_name)
    }

    /// Get the subscriber count for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic_name: &str) -> usize {
        self.topics
            .get(topic_name)
            .map(|t| t.subscriber_count())
            .unwrap_or(0)
    }

    /// Get the retained message for a topic.
    #[must_use]
    pub fn retained(&self, topic_name: &str) -> Option<Arc<Message>> {
        self.topics.get(topic_name).and_then(|t| t.retained().cloned())
    }

    /// Get or lazily create a topic.
    fn topic_entry(
        &self,
        topic_name: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, Topic>, RouterError> {
        if let Some(topic) = self.topics.get_mut(topic_name) {
            return Ok(topic);
        }
        if self.topics.len() >= self.config.max_topics {
            return Err(RouterError::MaxTopicsReached);
        }

        Ok(self
            .topics
            .entry(topic_name.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic_name, "Creating new topic");
                Topic::new(topic_name)
            }))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for Router {
    fn publish(&self, message: Message) -> Result<usize, RouterError> {
        Router::publish(self, message)
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of known topics.
    pub topic_count: usize,
    /// Number of admitted connections.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
    /// Number of topics holding a retained message.
    pub retained_count: usize,
    /// Number of registered listeners.
    pub listener_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Delivery;

    fn connect(router: &Router, id: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        router.register(id, &format!("client-{id}"), tx);
        rx
    }

    #[test]
    fn test_router_subscribe_unsubscribe() {
        let router = Router::new();
        let _rx = connect(&router, "conn-1");

        router.subscribe("conn-1", "led_flashing", QoS::AtLeastOnce).unwrap();
        assert!(router.topic_exists("led_flashing"));
        assert_eq!(router.subscriber_count("led_flashing"), 1);

        router.unsubscribe("conn-1", "led_flashing").unwrap();
        assert_eq!(router.subscriber_count("led_flashing"), 0);
        assert!(matches!(
            router.unsubscribe("conn-1", "led_flashing"),
            Err(RouterError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_router_publish() {
        let router = Router::new();
        let mut rx1 = connect(&router, "conn-1");
        let mut rx2 = connect(&router, "conn-2");
        router.subscribe("conn-1", "test", QoS::AtMostOnce).unwrap();
        router.subscribe("conn-2", "test", QoS::AtMostOnce).unwrap();

        let count = router
            .publish_to("test", b"hello".to_vec(), QoS::AtMostOnce, false)
            .unwrap();
        assert_eq!(count, 2);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_publish_without_subscribers_keeps_retained() {
        let router = Router::new();
        let count = router
            .publish_to("led_flashing", br#"{"flashing":false}"#.to_vec(), QoS::AtLeastOnce, true)
            .unwrap();
        assert_eq!(count, 0);

        let mut rx = connect(&router, "late");
        assert!(router.subscribe("late", "led_flashing", QoS::AtLeastOnce).unwrap());
        let delivery = rx.try_recv().unwrap();
        assert!(delivery.retained);
        assert_eq!(&delivery.message.payload[..], br#"{"flashing":false}"#);
    }

    #[test]
    fn test_per_publisher_order_preserved() {
        let router = Router::new();
        let mut rx = connect(&router, "sub");
        router.subscribe("sub", "seq", QoS::AtLeastOnce).unwrap();

        for i in 0..50u32 {
            router
                .publish(Message::new("seq", i.to_string()).with_source("pub"))
                .unwrap();
        }
        for i in 0..50u32 {
            let delivery = rx.try_recv().unwrap();
            assert_eq!(delivery.message.payload, bytes::Bytes::from(i.to_string()));
        }
    }

    #[test]
    fn test_router_invalid_topic() {
        let router = Router::new();
        let _rx = connect(&router, "conn-1");

        assert!(router.subscribe("conn-1", "", QoS::AtMostOnce).is_err());
        assert!(router.subscribe("conn-1", "a/#", QoS::AtMostOnce).is_err());
        assert!(router
            .publish_to("a/+/b", b"x".to_vec(), QoS::AtMostOnce, false)
            .is_err());
    }

    #[test]
    fn test_subscribe_unknown_connection() {
        let router = Router::new();
        assert!(matches!(
            router.subscribe("ghost", "test", QoS::AtMostOnce),
            Err(RouterError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_resubscribe_is_not_an_error() {
        let router = Router::new();
        let _rx = connect(&router, "conn-1");
        router.subscribe("conn-1", "test", QoS::AtMostOnce).unwrap();
        router.subscribe("conn-1", "test", QoS::AtLeastOnce).unwrap();
        assert_eq!(router.subscriber_count("test"), 1);
    }

    #[test]
    fn test_max_subscriptions() {
        let router = Router::with_config(RouterConfig {
            max_topics: 10,
            max_subscriptions_per_connection: 1,
        });
        let _rx = connect(&router, "conn-1");
        router.subscribe("conn-1", "one", QoS::AtMostOnce).unwrap();
        assert!(matches!(
            router.subscribe("conn-1", "two", QoS::AtMostOnce),
            Err(RouterError::MaxSubscriptionsReached)
        ));
    }

    #[test]
    fn test_deregister_removes_subscriptions() {
        let router = Router::new();
        let _rx = connect(&router, "conn-1");
        router.subscribe("conn-1", "channel-1", QoS::AtMostOnce).unwrap();
        router.subscribe("conn-1", "channel-2", QoS::AtMostOnce).unwrap();

        assert_eq!(router.deregister("conn-1").as_deref(), Some("client-conn-1"));
        assert_eq!(router.subscriber_count("channel-1"), 0);
        assert_eq!(router.subscriber_count("channel-2"), 0);
        assert!(router.deregister("conn-1").is_none());
    }

    #[test]
    fn test_listeners_see_lifecycle() {
        let router = Router::new();
        let mut events = router.listen();

        let _rx = connect(&router, "conn-1");
        router.subscribe("conn-1", "user_handled", QoS::AtLeastOnce).unwrap();
        router
            .publish_to("user_handled", br#"{"handled":true}"#.to_vec(), QoS::AtLeastOnce, false)
            .unwrap();
        router.deregister("conn-1");

        assert!(matches!(events.try_recv(), Ok(BrokerEvent::Connected { .. })));
        assert!(matches!(events.try_recv(), Ok(BrokerEvent::Subscribed { .. })));
        match events.try_recv() {
            Ok(BrokerEvent::Published(msg)) => assert_eq!(msg.topic, "user_handled"),
            other => panic!("Expected Published, got {:?}", other),
        }
        match events.try_recv() {
            Ok(BrokerEvent::Disconnected { client_id, .. }) => {
                assert_eq!(client_id, "client-conn-1")
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
    }

    #[test]
    fn test_router_stats() {
        let router = Router::new();
        let _rx1 = connect(&router, "conn-1");
        let _rx2 = connect(&router, "conn-2");
        router.subscribe("conn-1", "channel-1", QoS::AtMostOnce).unwrap();
        router.subscribe("conn-1", "channel-2", QoS::AtMostOnce).unwrap();
        router.subscribe("conn-2", "channel-1", QoS::AtMostOnce).unwrap();
        router
            .publish_to("channel-2", b"x".to_vec(), QoS::AtMostOnce, true)
            .unwrap();

        let stats = router.stats();
        assert_eq!(stats.topic_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.retained_count, 1);
    }
}
