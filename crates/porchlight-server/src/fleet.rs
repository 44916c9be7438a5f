//! Button fleet tracking.
//!
//! The fleet is the set of connected clients whose client ID starts with the
//! configured prefix. The registry remembers when the fleet first dropped
//! below the required size so the health check can allow a grace period for
//! reconnects.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A connected button.
#[derive(Debug, Clone)]
pub struct FleetMember {
    /// Client identifier from CONNECT.
    pub client_id: String,
    /// When the button connected.
    pub connected_at: DateTime<Utc>,
}

/// How the fleet looks at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetStatus {
    /// Connected monitored buttons.
    pub count: usize,
    /// Required number of buttons.
    pub required: usize,
    /// How long the fleet has been below minimum, if it is.
    pub below_for: Option<Duration>,
    /// Whether the fleet is within its grace period or above minimum.
    pub healthy: bool,
}

/// Connected buttons keyed by connection ID.
#[derive(Debug, Clone)]
pub struct FleetRegistry {
    prefix: String,
    required: usize,
    members: HashMap<String, FleetMember>,
    below_since: Option<DateTime<Utc>>,
}

impl FleetRegistry {
    /// Create an empty registry.
    ///
    /// An empty fleet with `required > 0` is below minimum from `now`.
    #[must_use]
    pub fn new(prefix: impl Into<String>, required: usize, now: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.into(),
            required,
            members: HashMap::new(),
            below_since: (required > 0).then_some(now),
        }
    }

    /// Whether a client ID belongs to the monitored fleet.
    #[must_use]
    pub fn is_monitored(&self, client_id: &str) -> bool {
        client_id.starts_with(&self.prefix)
    }

    /// Get the number of connected buttons.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Record a connection.
    ///
    /// Returns `true` if the client is a monitored button.
    pub fn connected(&mut self, connection_id: &str, client_id: &str, now: DateTime<Utc>) -> bool {
        if !self.is_monitored(client_id) {
            return false;
        }

        self.members.insert(
            connection_id.to_string(),
            FleetMember {
                client_id: client_id.to_string(),
                connected_at: now,
            },
        );
        debug!(connection = %connection_id, client = %client_id, count = self.count(), "Button joined fleet");
        self.recompute(now);
        true
    }

    /// Record a disconnection.
    ///
    /// Returns the departed member, if the connection was a button.
    pub fn disconnected(&mut self, connection_id: &str, now: DateTime<Utc>) -> Option<FleetMember> {
        let member = self.members.remove(connection_id)?;
        debug!(
            connection = %connection_id,
            client = %member.client_id,
            connected_secs = (now - member.connected_at).num_seconds(),
            count = self.count(),
            "Button left fleet"
        );
        self.recompute(now);
        Some(member)
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        if self.count() < self.required {
            if self.below_since.is_none() {
                warn!(
                    count = self.count(),
                    required = self.required,
                    "Button fleet dropped below minimum"
                );
                self.below_since = Some(now);
            }
        } else if self.below_since.take().is_some() {
            info!(count = self.count(), required = self.required, "Button fleet recovered");
        }
    }

    /// Evaluate the fleet at `now`.
    ///
    /// The fleet is unhealthy once it has stayed below minimum for `grace`
    /// or longer.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>, grace: Duration) -> FleetStatus {
        let below_for = self
            .below_since
            .map(|since| (now - since).to_std().unwrap_or_default());

        FleetStatus {
            count: self.count(),
            required: self.required,
            below_for,
            healthy: below_for.map_or(true, |d| d < grace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PREFIX: &str = "ESP8266-Button-";
    const GRACE: Duration = Duration::from_secs(120);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_empty_fleet_is_below_minimum_from_start() {
        let fleet = FleetRegistry::new(PREFIX, 1, at(0));
        assert_eq!(fleet.status(at(0), GRACE).below_for, Some(Duration::ZERO));

        let status = fleet.status(at(60), GRACE);
        assert_eq!(status.below_for, Some(Duration::from_secs(60)));
        assert!(status.healthy);

        assert!(!fleet.status(at(121), GRACE).healthy);
    }

    #[test]
    fn test_no_requirement_is_always_healthy() {
        let fleet = FleetRegistry::new(PREFIX, 0, at(0));
        let status = fleet.status(at(10_000), GRACE);
        assert!(status.healthy);
        assert_eq!(status.below_for, None);
    }

    #[test]
    fn test_only_prefixed_clients_count() {
        let mut fleet = FleetRegistry::new(PREFIX, 1, at(0));

        assert!(!fleet.connected("conn_1", "capture-pipeline", at(1)));
        assert_eq!(fleet.count(), 0);

        assert!(fleet.connected("conn_2", "ESP8266-Button-a1b2", at(2)));
        assert_eq!(fleet.count(), 1);
        assert_eq!(fleet.status(at(2), GRACE).below_for, None);

        assert!(fleet.disconnected("conn_1", at(3)).is_none());
        assert_eq!(fleet.count(), 1);
    }

    #[test]
    fn test_grace_period_after_drop() {
        let mut fleet = FleetRegistry::new(PREFIX, 2, at(0));
        fleet.connected("conn_1", "ESP8266-Button-1", at(1));
        fleet.connected("conn_2", "ESP8266-Button-2", at(2));
        assert!(fleet.status(at(500), GRACE).healthy);

        let left = fleet.disconnected("conn_2", at(1000)).unwrap();
        assert_eq!(left.client_id, "ESP8266-Button-2");
        assert_eq!(fleet.status(at(1000), GRACE).below_for, Some(Duration::ZERO));

        assert!(fleet.status(at(1100), GRACE).healthy);
        let status = fleet.status(at(1121), GRACE);
        assert!(!status.healthy);
        assert_eq!(status.count, 1);
        assert_eq!(status.required, 2);

        // A further drop does not move the start of the outage.
        fleet.disconnected("conn_1", at(1200));
        assert_eq!(
            fleet.status(at(1200), GRACE).below_for,
            Some(Duration::from_secs(200))
        );

        fleet.connected("conn_3", "ESP8266-Button-1", at(1300));
        fleet.connected("conn_4", "ESP8266-Button-2", at(1301));
        assert_eq!(fleet.status(at(1301), GRACE).below_for, None);
        assert!(fleet.status(at(1302), GRACE).healthy);
    }

    #[test]
    fn test_recovery_within_grace_is_never_unhealthy() {
        let mut fleet = FleetRegistry::new(PREFIX, 2, at(0));
        fleet.connected("conn_1", "ESP8266-Button-1", at(1));
        fleet.connected("conn_2", "ESP8266-Button-2", at(2));

        fleet.disconnected("conn_2", at(1000));
        for secs in [1000, 1030, 1060, 1090, 1119] {
            let status = fleet.status(at(secs), GRACE);
            assert!(status.healthy, "unhealthy at {secs}s");
            assert_eq!(status.count, 1);
        }

        fleet.connected("conn_3", "ESP8266-Button-2", at(1119));
        for secs in [1119, 1120, 1500, 10_000] {
            let status = fleet.status(at(secs), GRACE);
            assert!(status.healthy, "unhealthy at {secs}s after recovery");
            assert_eq!(status.below_for, None);
            assert_eq!(status.count, 2);
        }
    }
}
