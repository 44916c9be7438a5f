//! Packet framing for the Porchlight broker.
//!
//! Packets are MQTT 3.1.1 control packets. Parsing and serialization of the
//! individual packet bodies is delegated to `rumqttc`'s `mqttbytes` module;
//! this module adds the streaming buffer handling the transport needs.

use bytes::{BufMut, Bytes, BytesMut};
use rumqttc::mqttbytes;
use thiserror::Error;

pub use rumqttc::{
    ConnAck, Connect, ConnectReturnCode, Login, Packet, PubAck, PubComp, PubRec, PubRel, Publish,
    QoS, SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode, UnsubAck, Unsubscribe,
};

/// Default maximum packet size (64 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// Fixed two-byte encodings of the packets that carry no body.
const PINGREQ: [u8; 2] = [0xC0, 0x00];
const PINGRESP: [u8; 2] = [0xD0, 0x00];
const DISCONNECT: [u8; 2] = [0xE0, 0x00];

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The packet could not be parsed or serialized.
    #[error("Malformed packet: {0}")]
    Malformed(#[from] mqttbytes::Error),

    /// A JSON payload could not be parsed or serialized.
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Try to decode a packet from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(packet))` if a complete packet was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
/// The buffer is left untouched when more data is needed.
///
/// # Errors
///
/// Returns an error if the packet exceeds `max_packet_size` or is invalid.
pub fn decode_from(
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<Packet>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    match mqttbytes::v4::read(buf, max_packet_size) {
        Ok(packet) => Ok(Some(packet)),
        Err(mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
        Err(e) => Err(ProtocolError::Malformed(e)),
    }
}

/// Encode a packet into an existing buffer.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_into(packet: &Packet, buf: &mut BytesMut) -> Result<usize, ProtocolError> {
    let written = match packet {
        Packet::Connect(p) => p.write(buf)?,
        Packet::ConnAck(p) => p.write(buf)?,
        Packet::Publish(p) => p.write(buf)?,
        Packet::PubAck(p) => p.write(buf)?,
        Packet::PubRec(p) => p.write(buf)?,
        Packet::PubRel(p) => p.write(buf)?,
        Packet::PubComp(p) => p.write(buf)?,
        Packet::Subscribe(p) => p.write(buf)?,
        Packet::SubAck(p) => p.write(buf)?,
        Packet::Unsubscribe(p) => p.write(buf)?,
        Packet::UnsubAck(p) => p.write(buf)?,
        Packet::PingReq => put_fixed(buf, &PINGREQ),
        Packet::PingResp => put_fixed(buf, &PINGRESP),
        Packet::Disconnect => put_fixed(buf, &DISCONNECT),
    };
    Ok(written)
}

/// Encode a packet to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(64);
    encode_into(packet, &mut buf)?;
    Ok(buf.freeze())
}

fn put_fixed(buf: &mut BytesMut, bytes: &[u8; 2]) -> usize {
    buf.put_slice(bytes);
    bytes.len()
}

/// The lower of two QoS levels.
#[must_use]
pub fn min_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) <= (b as u8) {
        a
    } else {
        b
    }
}

/// Human-readable packet name for logging.
#[must_use]
pub fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}
