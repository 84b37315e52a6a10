use crate::endpoint::state::ConnectionState;
use crate::protocol::v5::reason_codes::ReasonCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors raised by the protocol engine
///
/// # Error Categories
///
/// - **Wire**: `MalformedPacket`, `InvalidPacketType`, `PacketTooLarge`
/// - **Protocol flow**: `ProtocolViolation`, `UnsupportedProtocolVersion`, `ClientIdentifierNotValid`
/// - **Timers**: `HandshakeTimeout`, `KeepAliveTimeout`
/// - **Facade misuse**: `InvalidStateTransition`, `PacketIdNotFound`, `InvalidArgument`
/// - **Lifecycle**: `RejectedByRouter`, `SessionTakenOver`, `ConnectionClosed`, `Io`
///
/// Connection-fatal variants end the connection task; the others are handed
/// back to the caller of the facade method that caused them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("No CONNECT received before the handshake deadline")]
    HandshakeTimeout,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Rejected by router: {0:?}")]
    RejectedByRouter(ReasonCode),

    #[error("Invalid state transition: cannot {operation} while {state:?}")]
    InvalidStateTransition {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Packet too large: size {size} exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Packet ID exhausted")]
    PacketIdExhausted,

    #[error("Packet identifier not found: {0}")]
    PacketIdNotFound(u16),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Client identifier not valid")]
    ClientIdentifierNotValid,

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid reason code: {0}")]
    InvalidReasonCode(u8),

    #[error("Duplicate property ID: {0}")]
    DuplicatePropertyId(u8),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session taken over by a new connection")]
    SessionTakenOver,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl MqttError {
    /// Returns true for errors that end the connection they occurred on
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::MalformedPacket(_)
                | Self::ProtocolViolation(_)
                | Self::HandshakeTimeout
                | Self::KeepAliveTimeout
                | Self::RejectedByRouter(_)
                | Self::UnsupportedProtocolVersion(_)
                | Self::InvalidPacketType(_)
                | Self::DuplicatePropertyId(_)
                | Self::InvalidQoS(_)
                | Self::InvalidReasonCode(_)
                | Self::SessionTakenOver
                | Self::ConnectionClosed
        )
    }

    /// Reason code sent in a v5 DISCONNECT when this error closes the connection
    #[must_use]
    pub fn disconnect_reason(&self) -> Option<ReasonCode> {
        match self {
            Self::ProtocolViolation(_) => Some(ReasonCode::ProtocolError),
            Self::KeepAliveTimeout => Some(ReasonCode::KeepAliveTimeout),
            Self::SessionTakenOver => Some(ReasonCode::SessionTakenOver),
            Self::PacketTooLarge { .. } => Some(ReasonCode::PacketTooLarge),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MqttError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MqttError::ConnectionClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for MqttError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        MqttError::ConnectionClosed
    }
}

// Error conversions for BeBytes compatibility
impl From<String> for MqttError {
    fn from(msg: String) -> Self {
        MqttError::MalformedPacket(msg)
    }
}

impl From<&str> for MqttError {
    fn from(msg: &str) -> Self {
        MqttError::MalformedPacket(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = MqttError::InvalidTopicName("test/+/topic".to_string());
        assert_eq!(err.to_string(), "Invalid topic name: test/+/topic");

        let err = MqttError::PacketTooLarge {
            size: 1000,
            max: 500,
        };
        assert_eq!(
            err.to_string(),
            "Packet too large: size 1000 exceeds maximum 500"
        );

        let err = MqttError::InvalidStateTransition {
            operation: "accept",
            state: ConnectionState::Established,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot accept while Established"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let mqtt_err: MqttError = io_err.into();
        match mqtt_err {
            MqttError::Io(e) => assert!(e.contains("reset by peer")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MqttError::MalformedPacket("x".into()).is_fatal());
        assert!(MqttError::KeepAliveTimeout.is_fatal());
        assert!(!MqttError::PacketIdExhausted.is_fatal());
        assert!(!MqttError::PacketTooLarge { size: 2, max: 1 }.is_fatal());
        assert!(!MqttError::InvalidStateTransition {
            operation: "reject",
            state: ConnectionState::Closed,
        }
        .is_fatal());
    }

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            MqttError::ProtocolViolation("second CONNECT".into()).disconnect_reason(),
            Some(ReasonCode::ProtocolError)
        );
        assert_eq!(
            MqttError::KeepAliveTimeout.disconnect_reason(),
            Some(ReasonCode::KeepAliveTimeout)
        );
        assert_eq!(MqttError::HandshakeTimeout.disconnect_reason(), None);
        assert_eq!(
            MqttError::MalformedPacket("bad".into()).disconnect_reason(),
            None
        );
    }
}
