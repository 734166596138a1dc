//! Message types shared with the collaborator contracts.
//!
//! These are the non-codec types the worker core exchanges with the
//! packet codec, the subscription store and the auth plugin. Wire
//! encoding and decoding live entirely in the codec collaborator.

use bytes::Bytes;

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse a wire-level QoS value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Negotiated protocol version of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (protocol level 3).
    V31 = 3,
    /// MQTT 3.1.1 (protocol level 4).
    V311 = 4,
    /// MQTT 5.0 (protocol level 5).
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            3 => Some(ProtocolVersion::V31),
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::V5
    }
}

/// MQTT v5 user property.
pub type UserProperty = (String, String);

/// An application message routed through the subscription store.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
    pub user_properties: Vec<UserProperty>,
}

impl Message {
    /// Convenience constructor for broker-originated messages ($SYS, wills).
    pub fn new(topic: impl Into<String>, qos: QoS, retain: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain,
            payload: payload.into(),
            user_properties: Vec::new(),
        }
    }
}

/// A last-will message supplied at connect time, published when the
/// client disconnects ungracefully.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub message: Message,
    /// MQTT v5 will delay interval in seconds. 0 means publish immediately.
    pub delay_interval: u32,
}

impl WillMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            delay_interval: 0,
        }
    }
}

/// Why a client is being (or has been) disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a protocol DISCONNECT; the will is discarded.
    NormalDisconnect,
    /// No packet received within 1.5 times the negotiated keep-alive.
    KeepAliveTimeout,
    /// Malformed or out-of-order packet.
    ProtocolError,
    /// Login rejected by the auth plugin.
    AuthenticationFailed,
    /// ACL rejected an operation that requires disconnect.
    NotAuthorized,
    /// Write buffer exceeded its hard limit.
    BufferOverflow,
    /// Peer reset or closed the connection.
    ConnectionReset,
    /// A newer connection with the same client-id took over the session.
    SessionTakeover,
    /// Broker is shutting down.
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::NormalDisconnect => "normal disconnect",
            DisconnectReason::KeepAliveTimeout => "keep-alive timeout",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::AuthenticationFailed => "authentication failed",
            DisconnectReason::NotAuthorized => "not authorized",
            DisconnectReason::BufferOverflow => "write buffer overflow",
            DisconnectReason::ConnectionReset => "connection reset",
            DisconnectReason::SessionTakeover => "session takeover",
            DisconnectReason::ServerShutdown => "server shutdown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_protocol_version_from_u8() {
        assert_eq!(ProtocolVersion::from_u8(4), Some(ProtocolVersion::V311));
        assert!(ProtocolVersion::from_u8(5).unwrap().is_v5());
        assert_eq!(ProtocolVersion::from_u8(6), None);
    }

    #[test]
    fn test_qos_ordering() {
        // Effective delivery QoS is min(publish, subscription)
        assert!(QoS::AtMostOnce < QoS::AtLeastOnce);
        assert_eq!(std::cmp::min(QoS::ExactlyOnce, QoS::AtLeastOnce), QoS::AtLeastOnce);
    }
}
