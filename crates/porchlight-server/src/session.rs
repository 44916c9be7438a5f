//! Per-connection MQTT session.
//!
//! A session owns one authenticated connection. It multiplexes packets from
//! the client, deliveries queued by the router, the keep-alive deadline and
//! the retransmission tick on a single task, so the connection is only ever
//! written from one place.

use porchlight_core::{Delivery, Message, RouterError};
use porchlight_protocol::{
    min_qos, packet_name, Packet, PubAck, PubComp, PubRec, Publish, QoS, SubAck, Subscribe,
    SubscribeReasonCode, UnsubAck, Unsubscribe,
};
use porchlight_transport::{ClientInfo, Connection, TransportError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::handlers::AppState;
use crate::metrics;

/// Highest QoS the broker grants or delivers with.
const MAX_QOS: QoS = QoS::AtLeastOnce;

/// What to do after handling one input.
enum Flow {
    Continue,
    Close(&'static str),
}

/// An outbound publish waiting for PUBACK.
struct Inflight {
    publish: Publish,
    sent_at: Instant,
}

pub(crate) struct Session {
    conn: Box<dyn Connection>,
    connection_id: String,
    client: ClientInfo,
    state: Arc<AppState>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    takeover: Arc<Notify>,
    inflight: BTreeMap<u16, Inflight>,
    awaiting_release: HashSet<u16>,
    last_packet_id: u16,
    last_activity: Instant,
}

impl Session {
    pub(crate) fn new(
        conn: Box<dyn Connection>,
        client: ClientInfo,
        state: Arc<AppState>,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        takeover: Arc<Notify>,
    ) -> Self {
        Self {
            connection_id: conn.id().to_string(),
            conn,
            client,
            state,
            deliveries,
            takeover,
            inflight: BTreeMap::new(),
            awaiting_release: HashSet::new(),
            last_packet_id: 0,
            last_activity: Instant::now(),
        }
    }

    /// Serve the connection until it ends; returns why it ended.
    pub(crate) async fn run(&mut self) -> &'static str {
        let keep_alive = self.client.keep_alive;
        let mut retry = time::interval(self.state.config.limits.retry_interval());
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Clients get one and a half keep-alive periods before being dropped.
            let idle_deadline = self.last_activity + keep_alive * 3 / 2;

            let flow = tokio::select! {
                biased;

                () = self.takeover.notified() => Flow::Close("session taken over"),

                received = self.conn.recv() => match received {
                    Ok(Some(packet)) => {
                        self.last_activity = Instant::now();
                        self.handle_packet(packet).await
                    }
                    Ok(None) => Flow::Close("connection closed"),
                    Err(e) => {
                        debug!(connection = %self.connection_id, error = %e, "Receive failed");
                        metrics::record_error("receive");
                        Flow::Close("receive failed")
                    }
                },

                Some(delivery) = self.deliveries.recv() => self.deliver(delivery).await,

                () = time::sleep_until(idle_deadline), if !keep_alive.is_zero() => {
                    warn!(
                        connection = %self.connection_id,
                        client = %self.client.client_id,
                        keep_alive_secs = keep_alive.as_secs(),
                        "Keep-alive expired"
                    );
                    Flow::Close("keep-alive timeout")
                }

                _ = retry.tick() => self.retransmit().await,
            };

            if let Flow::Close(reason) = flow {
                return reason;
            }
        }
    }

    /// Close the underlying connection.
    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.conn.close().await {
            debug!(connection = %self.connection_id, error = %e, "Close failed");
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Flow {
        trace!(connection = %self.connection_id, packet = packet_name(&packet), "Received packet");

        let result = match packet {
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PubAck(ack) => {
                if self.inflight.remove(&ack.pkid).is_none() {
                    debug!(connection = %self.connection_id, pkid = ack.pkid, "PUBACK for unknown packet");
                }
                Ok(Flow::Continue)
            }
            Packet::PubRel(rel) => {
                self.awaiting_release.remove(&rel.pkid);
                self.send(Packet::PubComp(PubComp::new(rel.pkid))).await
            }
            Packet::Subscribe(subscribe) => self.on_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe).await,
            Packet::PingReq => self.send(Packet::PingResp).await,
            Packet::Disconnect => Ok(Flow::Close("client disconnected")),
            Packet::PubRec(_) | Packet::PubComp(_) => {
                // Deliveries never exceed QoS 1.
                debug!(connection = %self.connection_id, "Ignoring QoS 2 acknowledgment");
                Ok(Flow::Continue)
            }
            other => {
                warn!(
                    connection = %self.connection_id,
                    packet = packet_name(&other),
                    "Unexpected packet from client"
                );
                metrics::record_error("protocol");
                Ok(Flow::Close("protocol violation"))
            }
        };

        result.unwrap_or_else(|e| {
            debug!(connection = %self.connection_id, error = %e, "Send failed");
            Flow::Close("send failed")
        })
    }

    async fn on_publish(&mut self, publish: Publish) -> Result<Flow, TransportError> {
        metrics::record_message(publish.payload.len(), "inbound");
        let pkid = publish.pkid;
        let qos = publish.qos;

        // A repeated QoS 2 packet ID before PUBREL is a redelivery.
        let duplicate = qos == QoS::ExactlyOnce && !self.awaiting_release.insert(pkid);

        if duplicate {
            debug!(connection = %self.connection_id, pkid, "Dropping duplicate QoS 2 publish");
        } else {
            let message = Message::new(publish.topic, publish.payload)
                .with_source(self.connection_id.as_str())
                .with_qos(qos)
                .retained(publish.retain);
            let topic = message.topic.clone();

            match self.state.router.publish(message) {
                Ok(recipients) => {
                    debug!(connection = %self.connection_id, topic = %topic, recipients, "Published");
                }
                Err(RouterError::InvalidTopic(reason)) => {
                    warn!(connection = %self.connection_id, topic = %topic, reason, "Rejected publish");
                    metrics::record_error("invalid_topic");
                    return Ok(Flow::Close("invalid publish topic"));
                }
                Err(e) => {
                    warn!(connection = %self.connection_id, topic = %topic, error = %e, "Publish failed");
                    metrics::record_error("publish");
                }
            }
        }

        match qos {
            QoS::AtMostOnce => Ok(Flow::Continue),
            QoS::AtLeastOnce => self.send(Packet::PubAck(PubAck::new(pkid))).await,
            QoS::ExactlyOnce => self.send(Packet::PubRec(PubRec::new(pkid))).await,
        }
    }

    async fn on_subscribe(&mut self, subscribe: Subscribe) -> Result<Flow, TransportError> {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());

        for filter in &subscribe.filters {
            let granted = min_qos(filter.qos, MAX_QOS);
            match self
                .state
                .router
                .subscribe(&self.connection_id, &filter.path, granted)
            {
                Ok(retained) => {
                    debug!(
                        connection = %self.connection_id,
                        topic = %filter.path,
                        qos = granted as u8,
                        retained,
                        "Subscribed"
                    );
                    return_codes.push(SubscribeReasonCode::Success(granted));
                }
                Err(e) => {
                    warn!(connection = %self.connection_id, topic = %filter.path, error = %e, "Subscribe refused");
                    return_codes.push(SubscribeReasonCode::Failure);
                }
            }
        }
        metrics::set_router_stats(&self.state.router.stats());

        self.send(Packet::SubAck(SubAck::new(subscribe.pkid, return_codes)))
            .await
    }

    async fn on_unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<Flow, TransportError> {
        for topic in &unsubscribe.topics {
            if let Err(e) = self.state.router.unsubscribe(&self.connection_id, topic) {
                debug!(connection = %self.connection_id, topic = %topic, error = %e, "Unsubscribe ignored");
            }
        }
        metrics::set_router_stats(&self.state.router.stats());

        self.send(Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)))
            .await
    }

    async fn deliver(&mut self, delivery: Delivery) -> Flow {
        let qos = min_qos(delivery.qos, MAX_QOS);
        let message = &delivery.message;
        let mut publish = Publish::new(message.topic.as_str(), qos, message.payload.to_vec());
        publish.retain = delivery.retained;

        if qos != QoS::AtMostOnce {
            if self.inflight.len() >= self.state.config.limits.max_inflight {
                warn!(
                    connection = %self.connection_id,
                    inflight = self.inflight.len(),
                    "Client stopped acknowledging deliveries"
                );
                metrics::record_error("inflight_full");
                return Flow::Close("in-flight window exhausted");
            }

            publish.pkid = self.next_packet_id();
            self.inflight.insert(
                publish.pkid,
                Inflight {
                    publish: publish.clone(),
                    sent_at: Instant::now(),
                },
            );
        }

        metrics::record_message(message.payload_size(), "outbound");
        match self.send(Packet::Publish(publish)).await {
            Ok(flow) => flow,
            Err(e) => {
                debug!(connection = %self.connection_id, error = %e, "Delivery failed");
                Flow::Close("send failed")
            }
        }
    }

    /// Resend every delivery that has waited a full retry interval.
    async fn retransmit(&mut self) -> Flow {
        let retry_after = self.state.config.limits.retry_interval();
        let now = Instant::now();

        let due: Vec<u16> = self
            .inflight
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= retry_after)
            .map(|(pkid, _)| *pkid)
            .collect();

        for pkid in due {
            let publish = match self.inflight.get_mut(&pkid) {
                Some(entry) => {
                    entry.sent_at = now;
                    let mut publish = entry.publish.clone();
                    publish.dup = true;
                    publish
                }
                None => continue,
            };

            debug!(connection = %self.connection_id, pkid, "Retransmitting unacknowledged publish");
            if self.send(Packet::Publish(publish)).await.is_err() {
                return Flow::Close("send failed");
            }
        }

        Flow::Continue
    }

    fn next_packet_id(&mut self) -> u16 {
        loop {
            self.last_packet_id = self.last_packet_id.wrapping_add(1);
            if self.last_packet_id != 0 && !self.inflight.contains_key(&self.last_packet_id) {
                return self.last_packet_id;
            }
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<Flow, TransportError> {
        trace!(connection = %self.connection_id, packet = packet_name(&packet), "Sending packet");
        self.conn.send(packet).await?;
        Ok(Flow::Continue)
    }
}
