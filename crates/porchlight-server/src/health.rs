//! Health reporting.
//!
//! A [`HealthTracker`] consumes broker events and keeps the inputs of the
//! verdict (fleet registry and last presence report) in a `watch` channel.
//! The HTTP handlers evaluate a [`HealthReport`] from the latest inputs on
//! every request.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use porchlight_core::BrokerEvent;
use porchlight_protocol::{decode_payload, PresenceReport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::Config;
use crate::fleet::FleetRegistry;
use crate::metrics;

/// Reason code: no recent presence report.
pub const CAPTURE_STALE: &str = "capture_stale";

/// Reason code: too few buttons for longer than the grace period.
pub const FLEET_BELOW_MINIMUM: &str = "fleet_below_minimum";

/// Health thresholds.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Topic whose publishes count as capture activity.
    pub presence_topic: String,
    /// Maximum age of the last presence report.
    pub capture_window: Duration,
    /// How long the fleet may stay below minimum.
    pub fleet_grace: Duration,
    /// Baseline for capture freshness before the first report.
    pub started_at: DateTime<Utc>,
}

impl HealthSettings {
    #[must_use]
    pub fn from_config(config: &Config, started_at: DateTime<Utc>) -> Self {
        Self {
            presence_topic: config.topics.presence.clone(),
            capture_window: config.health.capture_window(),
            fleet_grace: config.fleet.grace(),
            started_at,
        }
    }
}

/// Everything the verdict is computed from.
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub fleet: FleetRegistry,
    pub last_capture_at: Option<DateTime<Utc>>,
}

/// Keeps [`HealthInputs`] current from the broker event stream.
pub struct HealthTracker {
    settings: Arc<HealthSettings>,
    inputs: watch::Sender<HealthInputs>,
}

impl HealthTracker {
    /// Create a tracker and the receiver the HTTP handlers read from.
    pub fn new(
        settings: Arc<HealthSettings>,
        fleet: FleetRegistry,
    ) -> (Self, watch::Receiver<HealthInputs>) {
        let (inputs, rx) = watch::channel(HealthInputs {
            fleet,
            last_capture_at: None,
        });
        (Self { settings, inputs }, rx)
    }

    /// Apply one broker event.
    pub fn observe(&self, event: &BrokerEvent, now: DateTime<Utc>) {
        match event {
            BrokerEvent::Connected {
                connection_id,
                client_id,
            } => self.inputs.send_modify(|inputs| {
                if inputs.fleet.connected(connection_id, client_id, now) {
                    metrics::set_fleet_connected(inputs.fleet.count());
                }
            }),
            BrokerEvent::Disconnected { connection_id, .. } => {
                self.inputs.send_modify(|inputs| {
                    if inputs.fleet.disconnected(connection_id, now).is_some() {
                        metrics::set_fleet_connected(inputs.fleet.count());
                    }
                });
            }
            BrokerEvent::Published(message) if message.topic == self.settings.presence_topic => {
                match decode_payload::<PresenceReport>(&message.payload) {
                    Ok(_) => self
                        .inputs
                        .send_modify(|inputs| inputs.last_capture_at = Some(now)),
                    Err(e) => {
                        debug!(topic = %message.topic, error = %e, "Ignoring unreadable presence report");
                    }
                }
            }
            _ => {}
        }
    }

    /// Run until the event stream closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            self.observe(&event, Utc::now());
        }
        info!("Health tracker stopped: broker event stream closed");
    }
}

/// The health document served on `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub reasons: Vec<&'static str>,
    pub capture: CaptureHealth,
    pub fleet: FleetHealth,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureHealth {
    /// RFC 3339 time of the last presence report, if any arrived.
    pub last_message_at: Option<String>,
    /// Age of the last report, or time since start if none arrived.
    pub seconds_ago: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetHealth {
    pub count: usize,
    pub required: usize,
    pub below_for_sec: Option<u64>,
}

impl HealthReport {
    /// Compute the verdict at `now`.
    #[must_use]
    pub fn evaluate(inputs: &HealthInputs, settings: &HealthSettings, now: DateTime<Utc>) -> Self {
        let baseline = inputs.last_capture_at.unwrap_or(settings.started_at);
        let capture_age = (now - baseline).to_std().unwrap_or_default();
        let fleet = inputs.fleet.status(now, settings.fleet_grace);

        let mut reasons = Vec::new();
        let mut details = Vec::new();

        if capture_age >= settings.capture_window {
            reasons.push(CAPTURE_STALE);
            details.push(format!(
                "no presence report for {}s (window {}s)",
                capture_age.as_secs(),
                settings.capture_window.as_secs()
            ));
        }

        if !fleet.healthy {
            reasons.push(FLEET_BELOW_MINIMUM);
            details.push(format!(
                "{} of {} buttons connected for {}s (grace {}s)",
                fleet.count,
                fleet.required,
                fleet.below_for.unwrap_or_default().as_secs(),
                settings.fleet_grace.as_secs()
            ));
        }

        Self {
            healthy: reasons.is_empty(),
            reason: (!details.is_empty()).then(|| details.join("; ")),
            reasons,
            capture: CaptureHealth {
                last_message_at: inputs
                    .last_capture_at
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
                seconds_ago: capture_age.as_secs(),
            },
            fleet: FleetHealth {
                count: fleet.count,
                required: fleet.required,
                below_for_sec: fleet.below_for.map(|d| d.as_secs()),
            },
        }
    }
}

/// Shared state of the health routes.
#[derive(Clone)]
pub struct HealthApi {
    inputs: watch::Receiver<HealthInputs>,
    settings: Arc<HealthSettings>,
}

impl HealthApi {
    #[must_use]
    pub fn new(inputs: watch::Receiver<HealthInputs>, settings: Arc<HealthSettings>) -> Self {
        Self { inputs, settings }
    }
}

/// Build the health HTTP routes.
pub fn router(api: HealthApi) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ping", get(ping_handler))
        .with_state(api)
}

/// Health check handler.
async fn health_handler(State(api): State<HealthApi>) -> (StatusCode, Json<HealthReport>) {
    let report = HealthReport::evaluate(&api.inputs.borrow(), &api.settings, Utc::now());

    let status = if report.healthy {
        StatusCode::OK
    } else {
        debug!(reasons = ?report.reasons, "Reporting unhealthy");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

async fn ping_handler() -> &'static str {
    "pong"
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use porchlight_core::Message;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn settings(started_at: DateTime<Utc>) -> Arc<HealthSettings> {
        Arc::new(HealthSettings {
            presence_topic: "package_exists".to_string(),
            capture_window: Duration::from_secs(300),
            fleet_grace: Duration::from_secs(120),
            started_at,
        })
    }

    fn connected(connection_id: &str, client_id: &str) -> BrokerEvent {
        BrokerEvent::Connected {
            connection_id: connection_id.to_string(),
            client_id: client_id.to_string(),
        }
    }

    fn presence() -> BrokerEvent {
        BrokerEvent::Published(Arc::new(Message::new(
            "package_exists",
            r#"{"present":false}"#,
        )))
    }

    #[test]
    fn test_fresh_start_is_healthy() {
        let settings = settings(at(0));
        let (_tracker, inputs) =
            HealthTracker::new(settings.clone(), FleetRegistry::new("ESP8266-Button-", 1, at(0)));

        let report = HealthReport::evaluate(&inputs.borrow(), &settings, at(30));
        assert!(report.healthy);
        assert!(report.reasons.is_empty());
        assert_eq!(report.capture.last_message_at, None);
        assert_eq!(report.capture.seconds_ago, 30);
        assert_eq!(report.fleet.below_for_sec, Some(30));
    }

    #[test]
    fn test_tracker_follows_events() {
        let settings = settings(at(0));
        let (tracker, inputs) =
            HealthTracker::new(settings.clone(), FleetRegistry::new("ESP8266-Button-", 1, at(0)));

        tracker.observe(&connected("conn_1", "ESP8266-Button-1"), at(10));
        tracker.observe(&connected("conn_2", "capture"), at(10));
        tracker.observe(&presence(), at(20));

        let report = HealthReport::evaluate(&inputs.borrow(), &settings, at(1000));
        assert_eq!(report.fleet.count, 1);
        assert_eq!(report.fleet.below_for_sec, None);
        assert_eq!(report.capture.seconds_ago, 980);
        assert!(report.capture.last_message_at.is_some());
        assert_eq!(report.reasons, vec![CAPTURE_STALE]);
        assert!(!report.healthy);

        tracker.observe(
            &BrokerEvent::Disconnected {
                connection_id: "conn_1".to_string(),
                client_id: "ESP8266-Button-1".to_string(),
            },
            at(1000),
        );
        tracker.observe(&presence(), at(1000));

        let report = HealthReport::evaluate(&inputs.borrow(), &settings, at(1100));
        assert!(report.healthy, "within grace: {:?}", report.reason);

        let report = HealthReport::evaluate(&inputs.borrow(), &settings, at(1130));
        assert_eq!(report.reasons, vec![FLEET_BELOW_MINIMUM]);
        assert_eq!(report.fleet.below_for_sec, Some(130));
    }

    #[test]
    fn test_unreadable_presence_does_not_refresh_capture() {
        let settings = settings(at(0));
        let (tracker, inputs) =
            HealthTracker::new(settings.clone(), FleetRegistry::new("ESP8266-Button-", 0, at(0)));

        tracker.observe(&presence(), at(100));
        tracker.observe(
            &BrokerEvent::Published(Arc::new(Message::new("package_exists", "not json"))),
            at(1000),
        );

        let report = HealthReport::evaluate(&inputs.borrow(), &settings, at(1001));
        assert!(!report.healthy);
        assert_eq!(report.reasons, vec![CAPTURE_STALE]);
        assert_eq!(report.capture.seconds_ago, 901);
        assert_eq!(
            report.capture.last_message_at,
            Some(at(100).to_rfc3339_opts(SecondsFormat::Millis, true))
        );
    }

    #[test]
    fn test_report_shape() {
        let settings = settings(at(0));
        let (_tracker, inputs) =
            HealthTracker::new(settings.clone(), FleetRegistry::new("ESP8266-Button-", 2, at(0)));

        let report = HealthReport::evaluate(&inputs.borrow(), &settings, at(400));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["healthy"], false);
        assert_eq!(json["reasons"][0], "capture_stale");
        assert_eq!(json["reasons"][1], "fleet_below_minimum");
        assert!(json["reason"].as_str().unwrap().contains("0 of 2 buttons"));
        assert_eq!(json["capture"]["lastMessageAt"], serde_json::Value::Null);
        assert_eq!(json["capture"]["secondsAgo"], 400);
        assert_eq!(json["fleet"]["count"], 0);
        assert_eq!(json["fleet"]["required"], 2);
        assert_eq!(json["fleet"]["belowForSec"], 400);
    }

    #[tokio::test]
    async fn test_health_handler_status_codes() {
        let now = Utc::now();
        let settings = settings(now);

        let (tracker, inputs) =
            HealthTracker::new(settings.clone(), FleetRegistry::new("ESP8266-Button-", 0, now));
        let (status, Json(report)) =
            health_handler(State(HealthApi::new(inputs, settings.clone()))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report.healthy);
        drop(tracker);

        let stale = Arc::new(HealthSettings {
            started_at: now - chrono::Duration::seconds(600),
            ..(*settings).clone()
        });
        let (_tracker, inputs) =
            HealthTracker::new(stale.clone(), FleetRegistry::new("ESP8266-Button-", 0, now));
        let (status, Json(report)) = health_handler(State(HealthApi::new(inputs, stale))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.reasons, vec![CAPTURE_STALE]);
    }

    #[tokio::test]
    async fn test_ping() {
        assert_eq!(ping_handler().await, "pong");
    }
}
