//! Package-notification coordinator.
//!
//! The coordinator is the single writer of the notification state. It
//! consumes presence reports and acknowledgments from the broker's event
//! stream and publishes a retained notify signal:
//!
//! ```text
//! flashing = presence_detected && !cooldown_active
//! ```
//!
//! The cooldown timer is a deadline kept in the state together with a
//! generation number. The run loop sleeps until the deadline and feeds a
//! `CooldownExpired` event back into [`Coordinator::handle`]; an expiry
//! carrying an old generation is ignored, so a restarted or cancelled
//! cooldown can never be ended by a timer that belonged to an earlier one.

use chrono::{DateTime, Local};
use porchlight_core::{BrokerEvent, Message, Publisher};
use porchlight_protocol::{
    decode_payload, encode_payload, Acknowledgment, NotifySignal, PresenceReport, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics;
use crate::snapshot::{CooldownSnapshot, SnapshotWriter};

/// Longest cooldown the timer can represent; longer settings are capped.
const MAX_COOLDOWN: Duration = Duration::from_secs(86_400 * 365 * 30);

/// An input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A presence report from the capture pipeline.
    Presence(bool),
    /// A button acknowledged the notification.
    Acknowledged,
    /// The cooldown with this generation reached its deadline.
    CooldownExpired { generation: u64 },
}

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No package.
    Idle,
    /// Package present, buttons are flashing.
    Notifying,
    /// Package present but acknowledged; flashing suppressed.
    Suppressed,
}

#[derive(Debug, Clone)]
struct Cooldown {
    generation: u64,
    deadline: Instant,
    started_at: DateTime<Local>,
}

/// The coordinator's state.
///
/// A cooldown is only ever active while presence is detected.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorState {
    presence_detected: bool,
    cooldown: Option<Cooldown>,
}

impl CoordinatorState {
    /// Whether the last presence report said a package is there.
    #[must_use]
    pub fn presence_detected(&self) -> bool {
        self.presence_detected
    }

    /// Whether an acknowledgment is currently suppressing the notification.
    #[must_use]
    pub fn cooldown_active(&self) -> bool {
        self.cooldown.is_some()
    }

    /// Deadline of the active cooldown.
    #[must_use]
    pub fn cooldown_deadline(&self) -> Option<Instant> {
        self.cooldown.as_ref().map(|c| c.deadline)
    }

    /// Generation of the active cooldown.
    #[must_use]
    pub fn cooldown_generation(&self) -> Option<u64> {
        self.cooldown.as_ref().map(|c| c.generation)
    }

    /// The notify signal implied by this state.
    #[must_use]
    pub fn flashing(&self) -> bool {
        self.presence_detected && self.cooldown.is_none()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        match (self.presence_detected, self.cooldown.is_some()) {
            (false, _) => Phase::Idle,
            (true, false) => Phase::Notifying,
            (true, true) => Phase::Suppressed,
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub presence_topic: String,
    pub ack_topic: String,
    pub notify_topic: String,
    /// How long an acknowledgment suppresses the notification.
    pub cooldown: Duration,
    /// Whether an acknowledgment during a cooldown starts it over.
    pub restart_on_ack: bool,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            presence_topic: config.topics.presence.clone(),
            ack_topic: config.topics.acknowledgment.clone(),
            notify_topic: config.topics.notify.clone(),
            cooldown: config.cooldown.duration(),
            restart_on_ack: config.cooldown.restart_on_ack,
        }
    }
}

/// The notification state machine.
pub struct Coordinator {
    state: CoordinatorState,
    settings: CoordinatorSettings,
    publisher: Arc<dyn Publisher>,
    snapshots: Arc<dyn SnapshotWriter>,
    next_generation: u64,
}

impl Coordinator {
    /// Create a coordinator in the idle state.
    pub fn new(
        settings: CoordinatorSettings,
        publisher: Arc<dyn Publisher>,
        snapshots: Arc<dyn SnapshotWriter>,
    ) -> Self {
        Self {
            state: CoordinatorState::default(),
            settings,
            publisher,
            snapshots,
            next_generation: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    /// Publish the initial signal so late subscribers see a defined value.
    pub fn announce(&self) {
        info!(topic = %self.settings.notify_topic, "Publishing initial notify signal");
        self.broadcast();
    }

    /// Translate a broker event into a state machine input.
    ///
    /// Malformed payloads are logged and dropped.
    pub fn interpret(&self, event: &BrokerEvent) -> Option<CoordinatorEvent> {
        let BrokerEvent::Published(message) = event else {
            return None;
        };

        if message.topic == self.settings.presence_topic {
            match decode_payload::<PresenceReport>(&message.payload) {
                Ok(report) => Some(CoordinatorEvent::Presence(report.present)),
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        source = ?message.source,
                        error = %e,
                        "Dropping malformed presence report"
                    );
                    metrics::record_malformed_payload(&message.topic);
                    None
                }
            }
        } else if message.topic == self.settings.ack_topic {
            match decode_payload::<Acknowledgment>(&message.payload) {
                Ok(ack) if ack.handled => Some(CoordinatorEvent::Acknowledged),
                Ok(_) => {
                    debug!(source = ?message.source, "Ignoring acknowledgment with handled=false");
                    None
                }
                Err(e) => {
                    warn!(
                        topic = %message.topic,
                        source = ?message.source,
                        error = %e,
                        "Dropping malformed acknowledgment"
                    );
                    metrics::record_malformed_payload(&message.topic);
                    None
                }
            }
        } else {
            None
        }
    }

    /// Apply one event.
    pub fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Presence(present) => self.on_presence(present),
            CoordinatorEvent::Acknowledged => self.on_acknowledged(),
            CoordinatorEvent::CooldownExpired { generation } => {
                self.on_cooldown_expired(generation);
            }
        }

        debug!(
            ?event,
            phase = ?self.state.phase(),
            cooldown = self.state.cooldown_active(),
            "Coordinator event handled"
        );
    }

    /// Run until the event stream closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        self.announce();

        loop {
            let timer = self
                .state
                .cooldown_deadline()
                .zip(self.state.cooldown_generation());

            let event = match timer {
                Some((deadline, generation)) => tokio::select! {
                    received = events.recv() => match received {
                        Some(event) => self.interpret(&event),
                        None => break,
                    },
                    () = time::sleep_until(deadline) => {
                        Some(CoordinatorEvent::CooldownExpired { generation })
                    }
                },
                None => match events.recv().await {
                    Some(event) => self.interpret(&event),
                    None => break,
                },
            };

            if let Some(event) = event {
                self.handle(event);
            }
        }

        info!("Coordinator stopped: broker event stream closed");
    }

    fn on_presence(&mut self, present: bool) {
        if self.state.presence_detected != present {
            info!(present, "Package presence changed");
        }
        self.state.presence_detected = present;

        if !present && self.state.cooldown.is_some() {
            self.clear_cooldown("package removed");
        }

        // Every report refreshes the signal, even when nothing changed.
        self.broadcast();
    }

    fn on_acknowledged(&mut self) {
        if !self.state.presence_detected() {
            debug!("Ignoring acknowledgment: no package present");
            return;
        }
        if self.state.cooldown.is_some() && !self.settings.restart_on_ack {
            debug!("Ignoring acknowledgment: cooldown already running");
            return;
        }

        self.start_cooldown();
        self.broadcast();
    }

    fn on_cooldown_expired(&mut self, generation: u64) {
        match self.state.cooldown_generation() {
            Some(current) if current == generation => {}
            current => {
                debug!(generation, current = ?current, "Ignoring stale cooldown expiry");
                return;
            }
        }

        self.clear_cooldown("cooldown elapsed");
        self.broadcast();
    }

    fn start_cooldown(&mut self) {
        let restarted = self.state.cooldown.is_some();
        self.next_generation += 1;

        let now = Instant::now();
        let deadline = now
            .checked_add(self.settings.cooldown.min(MAX_COOLDOWN))
            .unwrap_or(now);
        let cooldown = Cooldown {
            generation: self.next_generation,
            deadline,
            started_at: Local::now(),
        };
        self.snapshots
            .record(CooldownSnapshot::new(true, cooldown.started_at));
        self.state.cooldown = Some(cooldown);

        metrics::record_cooldown_started(restarted);
        info!(
            generation = self.next_generation,
            restarted,
            duration_secs = self.settings.cooldown.as_secs(),
            "Cooldown started"
        );
    }

    fn clear_cooldown(&mut self, reason: &'static str) {
        if let Some(cooldown) = self.state.cooldown.take() {
            info!(generation = cooldown.generation, reason, "Cooldown ended");
            self.snapshots
                .record(CooldownSnapshot::new(false, Local::now()));
        }
    }

    fn broadcast(&self) {
        let flashing = self.state.flashing();
        let payload = match encode_payload(&NotifySignal { flashing }) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode notify signal");
                metrics::record_error("notify_encode");
                return;
            }
        };

        let message = Message::new(self.settings.notify_topic.clone(), payload)
            .with_qos(QoS::AtLeastOnce)
            .retained(true);

        match self.publisher.publish(message) {
            Ok(recipients) => {
                debug!(flashing, recipients, "Notify signal published");
                metrics::set_notify_signal(flashing);
            }
            Err(e) => {
                error!(topic = %self.settings.notify_topic, error = %e, "Failed to publish notify signal");
                metrics::record_error("notify_publish");
            }
        }
    }
}
