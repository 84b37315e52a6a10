use crate::error::{MqttError, Result};
use crate::packet::{decode_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties};
use crate::protocol::ProtocolVersion;
use crate::QoS;
use bytes::{Buf, BufMut};

/// MQTT SUBACK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckPacket {
    pub packet_id: u16,
    /// One entry per filter of the SUBSCRIBE, same order
    pub reason_codes: Vec<SubAckReasonCode>,
    /// SUBACK properties (v5.0 only)
    pub properties: Properties,
}

/// Per-filter SUBACK result
///
/// 3.x only distinguishes the three grants from a generic failure (0x80),
/// so every failure code is written as 0x80 on those connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubAckReasonCode {
    GrantedQoS0 = 0x00,
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    UnspecifiedError = 0x80,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    TopicFilterInvalid = 0x8F,
    PacketIdentifierInUse = 0x91,
    QuotaExceeded = 0x97,
    SharedSubscriptionsNotSupported = 0x9E,
    SubscriptionIdentifiersNotSupported = 0xA1,
    WildcardSubscriptionsNotSupported = 0xA2,
}

impl SubAckReasonCode {
    #[must_use]
    pub fn from_qos(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => Self::GrantedQoS0,
            QoS::AtLeastOnce => Self::GrantedQoS1,
            QoS::ExactlyOnce => Self::GrantedQoS2,
        }
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::GrantedQoS0),
            0x01 => Some(Self::GrantedQoS1),
            0x02 => Some(Self::GrantedQoS2),
            0x80 => Some(Self::UnspecifiedError),
            0x83 => Some(Self::ImplementationSpecificError),
            0x87 => Some(Self::NotAuthorized),
            0x8F => Some(Self::TopicFilterInvalid),
            0x91 => Some(Self::PacketIdentifierInUse),
            0x97 => Some(Self::QuotaExceeded),
            0x9E => Some(Self::SharedSubscriptionsNotSupported),
            0xA1 => Some(Self::SubscriptionIdentifiersNotSupported),
            0xA2 => Some(Self::WildcardSubscriptionsNotSupported),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.granted_qos().is_some()
    }

    #[must_use]
    pub fn granted_qos(&self) -> Option<QoS> {
        match self {
            Self::GrantedQoS0 => Some(QoS::AtMostOnce),
            Self::GrantedQoS1 => Some(QoS::AtLeastOnce),
            Self::GrantedQoS2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Lowers a grant to at most `requested`; failures pass through
    #[must_use]
    pub fn clamp_to(self, requested: QoS) -> Self {
        match self.granted_qos() {
            Some(granted) if granted > requested => Self::from_qos(requested),
            _ => self,
        }
    }

    fn to_wire(self, version: ProtocolVersion) -> u8 {
        if version.is_v5() || self.is_success() {
            self as u8
        } else {
            Self::UnspecifiedError as u8
        }
    }
}

impl SubAckPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_codes: Vec::new(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_reason_codes(mut self, codes: Vec<SubAckReasonCode>) -> Self {
        self.reason_codes = codes;
        self
    }

    #[must_use]
    pub fn add_reason_code(mut self, code: SubAckReasonCode) -> Self {
        self.reason_codes.push(code);
        self
    }
}

impl MqttPacket for SubAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::SubAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if self.reason_codes.is_empty() {
            return Err(MqttError::InvalidArgument(
                "SUBACK must contain at least one reason code".to_string(),
            ));
        }

        buf.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buf)?;
        }
        for code in &self.reason_codes {
            buf.put_u8(code.to_wire(version));
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = decode_packet_id(buf, "SUBACK")?;

        let properties = if version.is_v5() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::ACK, "SUBACK")?;
            properties
        } else {
            Properties::default()
        };

        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "SUBACK must contain at least one reason code".to_string(),
            ));
        }

        let mut reason_codes = Vec::with_capacity(buf.remaining());
        while buf.has_remaining() {
            let byte = buf.get_u8();
            let code = SubAckReasonCode::from_u8(byte)
                .filter(|code| version.is_v5() || code.to_wire(version) == byte)
                .ok_or_else(|| {
                    MqttError::MalformedPacket(format!("Invalid SUBACK reason code: 0x{byte:02X}"))
                })?;
            reason_codes.push(code);
        }

        Ok(Self {
            packet_id,
            reason_codes,
            properties,
        })
    }
}
