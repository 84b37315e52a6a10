use crate::constants::protocol_name;
use crate::error::{MqttError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol revision negotiated by CONNECT
///
/// The discriminant is the protocol level byte carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1")]
    V3_1 = 3,
    #[serde(rename = "3.1.1")]
    V3_1_1 = 4,
    #[serde(rename = "5.0")]
    V5 = 5,
}

impl ProtocolVersion {
    pub const ALL: [Self; 3] = [Self::V3_1, Self::V3_1_1, Self::V5];

    #[must_use]
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Name written in the CONNECT variable header for this revision
    #[must_use]
    pub fn protocol_name(self) -> &'static str {
        match self {
            Self::V3_1 => protocol_name::MQISDP,
            Self::V3_1_1 | Self::V5 => protocol_name::MQTT,
        }
    }

    #[must_use]
    pub fn is_v5(self) -> bool {
        self == Self::V5
    }

    /// Resolves the revision from the CONNECT protocol name and level
    ///
    /// # Errors
    ///
    /// An unknown name is `MalformedPacket`. A known name with a level it
    /// does not pair with is `UnsupportedProtocolVersion`, which the
    /// handshake answers with a version-mismatch CONNACK.
    pub fn from_name_and_level(name: &str, level: u8) -> Result<Self> {
        match (name, level) {
            (protocol_name::MQISDP, 3) => Ok(Self::V3_1),
            (protocol_name::MQTT, 4) => Ok(Self::V3_1_1),
            (protocol_name::MQTT, 5) => Ok(Self::V5),
            (protocol_name::MQISDP | protocol_name::MQTT, _) => {
                Err(MqttError::UnsupportedProtocolVersion(level))
            }
            _ => Err(MqttError::MalformedPacket(format!(
                "Invalid protocol name: {name}"
            ))),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::V3_1 => "3.1",
            Self::V3_1_1 => "3.1.1",
            Self::V5 => "5.0",
        };
        f.write_str(label)
    }
}
