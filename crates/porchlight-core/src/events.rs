//! Broker lifecycle events.
//!
//! Every connect, disconnect, subscribe and publish handled by the router is
//! emitted to the registered listeners. This is the only way the rest of
//! the system observes broker traffic.

use crate::message::Message;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// An observable broker event.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// An authenticated connection was admitted.
    Connected {
        /// Broker-assigned connection ID.
        connection_id: String,
        /// Client identifier from CONNECT.
        client_id: String,
    },
    /// A connection went away.
    Disconnected {
        /// Broker-assigned connection ID.
        connection_id: String,
        /// Client identifier from CONNECT.
        client_id: String,
    },
    /// A connection subscribed to a topic.
    Subscribed {
        /// Broker-assigned connection ID.
        connection_id: String,
        /// Topic name.
        topic: String,
    },
    /// A message was routed.
    Published(Arc<Message>),
}

/// Registered event listeners.
#[derive(Debug, Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    senders: DashMap<u64, mpsc::UnboundedSender<BrokerEvent>>,
}

impl Listeners {
    /// Register a new listener.
    pub(crate) fn listen(&self) -> mpsc::UnboundedReceiver<BrokerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.senders.insert(id, tx);
        rx
    }

    /// Send an event to every listener, pruning the ones that hung up.
    pub(crate) fn emit(&self, event: BrokerEvent) {
        let mut closed = Vec::new();
        for entry in self.senders.iter() {
            if entry.value().send(event.clone()).is_err() {
                closed.push(*entry.key());
            }
        }

        for id in closed {
            self.senders.remove(&id);
            trace!(listener = id, "Pruned closed listener");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_every_listener() {
        let listeners = Listeners::default();
        let mut rx1 = listeners.listen();
        let mut rx2 = listeners.listen();

        listeners.emit(BrokerEvent::Subscribed {
            connection_id: "conn-1".into(),
            topic: "led_flashing".into(),
        });

        assert!(matches!(rx1.try_recv(), Ok(BrokerEvent::Subscribed { .. })));
        assert!(matches!(rx2.try_recv(), Ok(BrokerEvent::Subscribed { .. })));
    }

    #[test]
    fn test_closed_listener_pruned() {
        let listeners = Listeners::default();
        let rx = listeners.listen();
        let _keep = listeners.listen();
        drop(rx);

        listeners.emit(BrokerEvent::Connected {
            connection_id: "conn-1".into(),
            client_id: "ESP8266-Button-1a2b".into(),
        });
        assert_eq!(listeners.len(), 1);
    }
}
