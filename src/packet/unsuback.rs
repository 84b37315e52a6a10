use crate::error::{MqttError, Result};
use crate::packet::{decode_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties};
use crate::protocol::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT UNSUBACK packet
///
/// 3.x UNSUBACK has no payload; `reason_codes` is empty after decoding one
/// and ignored when encoding one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAckPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<UnsubAckReasonCode>,
    /// UNSUBACK properties (v5.0 only)
    pub properties: Properties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnsubAckReasonCode {
    Success = 0x00,
    NoSubscriptionExisted = 0x11,
    UnspecifiedError = 0x80,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    TopicFilterInvalid = 0x8F,
    PacketIdentifierInUse = 0x91,
}

impl UnsubAckReasonCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Success),
            0x11 => Some(Self::NoSubscriptionExisted),
            0x80 => Some(Self::UnspecifiedError),
            0x83 => Some(Self::ImplementationSpecificError),
            0x87 => Some(Self::NotAuthorized),
            0x8F => Some(Self::TopicFilterInvalid),
            0x91 => Some(Self::PacketIdentifierInUse),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::NoSubscriptionExisted)
    }
}

impl UnsubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_codes: Vec::new(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_reason_codes(mut self, codes: Vec<UnsubAckReasonCode>) -> Self {
        self.reason_codes = codes;
        self
    }
}

impl MqttPacket for UnsubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::UnsubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        buf.put_u16(self.packet_id);
        if !version.is_v5() {
            return Ok(());
        }

        if self.reason_codes.is_empty() {
            return Err(MqttError::InvalidArgument(
                "v5 UNSUBACK must contain at least one reason code".to_string(),
            ));
        }
        self.properties.encode(buf)?;
        for code in &self.reason_codes {
            buf.put_u8(*code as u8);
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = decode_packet_id(buf, "UNSUBACK")?;
        if !version.is_v5() {
            return Ok(Self::new(packet_id));
        }

        let properties = Properties::decode(buf)?;
        properties.validate_for(allowed::ACK, "UNSUBACK")?;

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "v5 UNSUBACK must contain at least one reason code".to_string(),
            ));
        }
        let mut reason_codes = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            let byte = buf.get_u8();
            reason_codes.push(UnsubAckReasonCode::from_u8(byte).ok_or_else(|| {
                MqttError::MalformedPacket(format!("Invalid UNSUBACK reason code: 0x{byte:02X}"))
            })?);
        }

        Ok(Self {
            packet_id,
            reason_codes,
            properties,
        })
    }
}
