//! JSON payloads carried on the well-known topics.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Default topic for presence reports from the capture pipeline.
pub const DEFAULT_PRESENCE_TOPIC: &str = "package_exists";

/// Default topic for acknowledgments from button clients.
pub const DEFAULT_ACK_TOPIC: &str = "user_handled";

/// Default topic for the derived notify signal.
pub const DEFAULT_NOTIFY_TOPIC: &str = "led_flashing";

/// Whether a package is currently observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceReport {
    /// Package observed.
    #[serde(alias = "exists")]
    pub present: bool,
    /// ISO-8601 time the observation was made.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A human handled the notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    /// `false` (or absent) means no acknowledgment.
    #[serde(default)]
    pub handled: bool,
    /// Firmware sends its uptime in milliseconds, other tools an ISO-8601 string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Value>,
}

/// The derived signal every button follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySignal {
    /// LED should flash.
    pub flashing: bool,
}

/// Parse a JSON payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Payload`] if the body is not valid JSON for `T`.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize a JSON payload.
///
/// # Errors
///
/// Returns [`ProtocolError::Payload`] if serialization fails.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_accepts_exists_alias() {
        let report: PresenceReport =
            decode_payload(br#"{"exists": true, "timestamp": "2024-05-01T10:00:00Z"}"#).unwrap();
        assert!(report.present);
        assert_eq!(report.timestamp.as_deref(), Some("2024-05-01T10:00:00Z"));

        let report: PresenceReport = decode_payload(br#"{"present": false}"#).unwrap();
        assert!(!report.present);
    }

    #[test]
    fn test_presence_requires_flag() {
        assert!(decode_payload::<PresenceReport>(br#"{"timestamp": "x"}"#).is_err());
        assert!(decode_payload::<PresenceReport>(b"not json").is_err());
    }

    #[test]
    fn test_acknowledgment_timestamp_shapes() {
        let ack: Acknowledgment = decode_payload(br#"{"handled": true, "timestamp": 123456}"#).unwrap();
        assert!(ack.handled);

        let ack: Acknowledgment =
            decode_payload(br#"{"handled": true, "timestamp": "2024-05-01T10:00:00Z"}"#).unwrap();
        assert!(ack.handled);

        let ack: Acknowledgment = decode_payload(b"{}").unwrap();
        assert!(!ack.handled);
    }

    #[test]
    fn test_notify_signal_shape() {
        let bytes = encode_payload(&NotifySignal { flashing: true }).unwrap();
        assert_eq!(&bytes[..], br#"{"flashing":true}"#);
    }
}
