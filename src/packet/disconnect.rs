use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties};
use crate::protocol::v5::reason_codes::{ReasonCode, NORMAL_DISCONNECTION};
use crate::protocol::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT DISCONNECT packet
///
/// 3.x DISCONNECT has an empty body and always decodes as a normal
/// disconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectPacket {
    pub reason_code: ReasonCode,
    /// DISCONNECT properties (v5.0 only)
    pub properties: Properties,
}

impl DisconnectPacket {
    #[must_use]
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn normal() -> Self {
        Self::new(NORMAL_DISCONNECTION)
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, seconds: u32) -> Self {
        self.properties.set_session_expiry_interval(seconds);
        self
    }

    #[must_use]
    pub fn with_reason_string(mut self, reason: String) -> Self {
        self.properties.set_reason_string(reason);
        self
    }

    /// True when the client asked for its will to be published anyway
    #[must_use]
    pub fn keeps_will(&self) -> bool {
        self.reason_code == ReasonCode::DisconnectWithWillMessage
    }
}

impl MqttPacket for DisconnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Disconnect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if !version.is_v5() {
            return Ok(());
        }

        // normal disconnection with no properties may omit the whole body
        if self.reason_code != NORMAL_DISCONNECTION || !self.properties.is_empty() {
            buf.put_u8(u8::from(self.reason_code));
            if !self.properties.is_empty() {
                self.properties.encode(buf)?;
            }
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if !version.is_v5() || !buf.has_remaining() {
            return Ok(Self::normal());
        }

        let raw = buf.get_u8();
        let reason_code = ReasonCode::from_u8(raw)
            .filter(|code| code.is_valid_for_disconnect())
            .ok_or_else(|| {
                MqttError::MalformedPacket(format!("Invalid DISCONNECT reason code: 0x{raw:02X}"))
            })?;

        let properties = if buf.has_remaining() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::DISCONNECT, "DISCONNECT")?;
            properties
        } else {
            Properties::default()
        };

        Ok(Self {
            reason_code,
            properties,
        })
    }
}
