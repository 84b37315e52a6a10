//! MQTT Protocol Constants
//!
//! This module defines constants for MQTT packet types and flags to avoid magic numbers
//! throughout the codebase.

use crate::PacketType;

/// Fixed header byte 1 values (packet type << 4 | flags)
pub mod fixed_header {
    /// CONNECT packet fixed header (0x10)
    pub const CONNECT: u8 = (super::PacketType::Connect as u8) << 4;

    /// CONNACK packet fixed header (0x20)
    pub const CONNACK: u8 = (super::PacketType::ConnAck as u8) << 4;

    /// PUBLISH packet fixed header base (0x30) - flags vary
    pub const PUBLISH_BASE: u8 = (super::PacketType::Publish as u8) << 4;

    /// PUBREL packet fixed header (0x62) - has required flags
    pub const PUBREL: u8 = (super::PacketType::PubRel as u8) << 4 | 0x02;

    /// SUBSCRIBE packet fixed header (0x82) - has required flags
    pub const SUBSCRIBE: u8 = (super::PacketType::Subscribe as u8) << 4 | 0x02;

    /// UNSUBSCRIBE packet fixed header (0xA2) - has required flags
    pub const UNSUBSCRIBE: u8 = (super::PacketType::Unsubscribe as u8) << 4 | 0x02;

    /// PINGREQ packet fixed header (0xC0)
    pub const PINGREQ: u8 = (super::PacketType::PingReq as u8) << 4;

    /// PINGRESP packet fixed header (0xD0)
    pub const PINGRESP: u8 = (super::PacketType::PingResp as u8) << 4;
}

/// Masks for extracting fields from fixed header
pub mod masks {
    /// Mask for extracting packet type from fixed header byte 1 (0xF0)
    pub const PACKET_TYPE: u8 = 0xF0;

    /// Mask for extracting flags from fixed header byte 1 (0x0F)
    pub const FLAGS: u8 = 0x0F;

    /// Mask for checking continuation bit in variable byte integer (0x80)
    pub const CONTINUATION_BIT: u8 = 0x80;

    /// Mask for extracting value from variable byte integer (0x7F)
    pub const VARIABLE_BYTE_VALUE: u8 = 0x7F;
}

/// Flag nibble required by PUBREL, SUBSCRIBE and UNSUBSCRIBE
pub const REQUIRED_FLAGS_0010: u8 = 0x02;

/// Subscription option masks
pub mod subscription {
    /// Mask for `QoS` bits (bits 0-1)
    pub const QOS_MASK: u8 = 0x03;

    /// Mask for No Local flag (bit 2)
    pub const NO_LOCAL_MASK: u8 = 0x04;

    /// Mask for Retain As Published flag (bit 3)
    pub const RETAIN_AS_PUBLISHED_MASK: u8 = 0x08;

    /// Mask for Retain Handling (bits 4-5)
    pub const RETAIN_HANDLING_MASK: u8 = 0x30;

    /// Shift for Retain Handling
    pub const RETAIN_HANDLING_SHIFT: u8 = 4;

    /// Mask for reserved bits (bits 6-7)
    pub const RESERVED_BITS_MASK: u8 = 0xC0;

    /// Reserved bits of a v3.x requested `QoS` byte (bits 2-7)
    pub const V3_RESERVED_BITS_MASK: u8 = 0xFC;
}

/// CONNECT flags masks
pub mod connect_flags {
    /// Mask for clearing Will `QoS` bits (bits 3-4)
    pub const WILL_QOS_CLEAR_MASK: u8 = !0x18;
    /// Mask for extracting Will `QoS` (bits 3-4 shifted)
    pub const WILL_QOS_MASK: u8 = 0x03;
    /// Shift for Will `QoS`
    pub const WILL_QOS_SHIFT: u8 = 3;
}

/// PUBLISH flags masks
pub mod publish_flags {
    /// Mask for clearing `QoS` bits (bits 1-2)
    pub const QOS_CLEAR_MASK: u8 = !0x06;
    /// Mask for extracting `QoS` (bits 1-2 shifted)
    pub const QOS_MASK: u8 = 0x03;
    /// Shift for `QoS`
    pub const QOS_SHIFT: u8 = 1;
}

/// String and size limits
pub mod limits {
    /// Maximum string length in MQTT (65535)
    pub const MAX_STRING_LENGTH: u16 = u16::MAX;

    /// Default policy limit for client identifiers (128 characters)
    pub const MAX_CLIENT_ID_LENGTH: usize = 128;

    /// Client identifier limit imposed by MQTT 3.1
    pub const V3_1_MAX_CLIENT_ID_LENGTH: usize = 23;

    /// Largest remaining length a 4-byte variable integer can carry
    pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

    /// Fixed header byte plus the longest remaining length encoding
    pub const MAX_FIXED_HEADER_LEN: usize = 5;
}

/// Protocol names carried in the CONNECT variable header
pub mod protocol_name {
    /// Name used by MQTT 3.1.1 and 5.0
    pub const MQTT: &str = "MQTT";
    /// Legacy name used by MQTT 3.1
    pub const MQISDP: &str = "MQIsdp";
}

/// Endpoint defaults
pub mod defaults {
    use std::time::Duration;

    /// Time a fresh connection has to deliver its CONNECT
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Multiplier applied to the negotiated keep-alive
    pub const KEEP_ALIVE_TOLERANCE: f64 = 1.5;

    /// Capacity of the per-connection event channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 100;

    /// Initial read buffer size for a connection
    pub const READ_BUFFER_SIZE: usize = 4096;
}
