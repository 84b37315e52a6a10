//! Flag bits of CONNECT, PUBLISH and CONNACK, decomposed with `BeBytes`

use crate::constants::{connect_flags, publish_flags};
use bebytes::BeBytes;

/// Bits of the CONNECT flags byte
///
/// Bit 1 is called clean-session in 3.x and clean-start in 5.0; the wire
/// position is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
#[bebytes(flags)]
pub enum ConnectFlags {
    /// Reserved bit - must be 0
    Reserved = 0x01,
    CleanStart = 0x02,
    WillFlag = 0x04,
    WillQoS0 = 0x08,
    WillQoS1 = 0x10,
    WillRetain = 0x20,
    PasswordFlag = 0x40,
    UsernameFlag = 0x80,
}

impl ConnectFlags {
    /// Extract Will `QoS` value from flags
    #[must_use]
    pub fn extract_will_qos(flags: u8) -> u8 {
        (flags >> connect_flags::WILL_QOS_SHIFT) & connect_flags::WILL_QOS_MASK
    }

    /// Create flags byte with Will `QoS` value
    #[must_use]
    pub fn with_will_qos(flags: u8, qos: u8) -> u8 {
        (flags & connect_flags::WILL_QOS_CLEAR_MASK)
            | ((qos & connect_flags::WILL_QOS_MASK) << connect_flags::WILL_QOS_SHIFT)
    }
}

/// Bits of the PUBLISH fixed header flag nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
#[bebytes(flags)]
pub enum PublishFlags {
    Retain = 0x01,
    QoS0 = 0x02,
    QoS1 = 0x04,
    /// Set on redelivery of a message the peer may already have seen
    Dup = 0x08,
}

impl PublishFlags {
    #[must_use]
    pub fn extract_qos(flags: u8) -> u8 {
        (flags >> publish_flags::QOS_SHIFT) & publish_flags::QOS_MASK
    }

    #[must_use]
    pub fn with_qos(flags: u8, qos: u8) -> u8 {
        (flags & publish_flags::QOS_CLEAR_MASK)
            | ((qos & publish_flags::QOS_MASK) << publish_flags::QOS_SHIFT)
    }
}

/// Connect acknowledge flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
#[bebytes(flags)]
pub enum ConnAckFlags {
    SessionPresent = 0x01,
}
