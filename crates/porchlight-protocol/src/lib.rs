//! # porchlight-protocol
//!
//! Wire contract for the Porchlight notification broker.
//!
//! Clients speak MQTT 3.1.1 over TCP. This crate wraps the packet codec
//! with streaming buffer helpers and defines the JSON payloads exchanged
//! on the three well-known topics:
//!
//! | Topic | Payload |
//! |---|---|
//! | `package_exists` | [`PresenceReport`] |
//! | `user_handled` | [`Acknowledgment`] |
//! | `led_flashing` (retained) | [`NotifySignal`] |
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use porchlight_protocol::{codec, Packet, Publish, QoS};
//!
//! let mut publish = Publish::new("led_flashing", QoS::AtLeastOnce, br#"{"flashing":true}"#.to_vec());
//! publish.pkid = 1;
//! let mut buf = BytesMut::new();
//! codec::encode_into(&Packet::Publish(publish), &mut buf).unwrap();
//! let decoded = codec::decode_from(&mut buf, codec::DEFAULT_MAX_PACKET_SIZE).unwrap();
//! assert!(matches!(decoded, Some(Packet::Publish(_))));
//! ```

pub mod codec;
pub mod payload;

pub use codec::{
    decode_from, encode, encode_into, min_qos, packet_name, ConnAck, Connect, ConnectReturnCode,
    Login, Packet, ProtocolError, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
    Subscribe, SubscribeFilter, SubscribeReasonCode, UnsubAck, Unsubscribe,
};
pub use payload::{
    decode_payload, encode_payload, Acknowledgment, NotifySignal, PresenceReport,
    DEFAULT_ACK_TOPIC, DEFAULT_NOTIFY_TOPIC, DEFAULT_PRESENCE_TOPIC,
};
