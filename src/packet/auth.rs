use crate::error::{MqttError, Result};
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties, PropertyId, PropertyValue};
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::protocol::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes};

/// AUTH packet for MQTT v5.0 enhanced authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    /// `Success`, `ContinueAuthentication` or `ReAuthenticate`
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl AuthPacket {
    #[must_use]
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::default(),
        }
    }

    /// Builds a `ContinueAuthentication` step for `method`
    #[must_use]
    pub fn continue_authentication(method: impl Into<String>, data: Option<Bytes>) -> Self {
        let mut packet = Self::new(ReasonCode::ContinueAuthentication);
        packet.properties.set_authentication_method(method.into());
        if let Some(data) = data {
            // a fresh container cannot already hold authentication data
            let _ = packet
                .properties
                .add(PropertyId::AuthenticationData, PropertyValue::BinaryData(data));
        }
        packet
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        self.properties.authentication_method()
    }

    #[must_use]
    pub fn authentication_data(&self) -> Option<&Bytes> {
        match self.properties.get(PropertyId::AuthenticationData) {
            Some(PropertyValue::BinaryData(data)) => Some(data),
            _ => None,
        }
    }

    fn is_valid_reason_code(code: ReasonCode) -> bool {
        matches!(
            code,
            ReasonCode::Success | ReasonCode::ContinueAuthentication | ReasonCode::ReAuthenticate
        )
    }
}

impl MqttPacket for AuthPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Auth
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if !version.is_v5() {
            return Err(MqttError::InvalidArgument(format!(
                "AUTH is not defined for MQTT {version}"
            )));
        }
        if self.reason_code == ReasonCode::Success && self.properties.is_empty() {
            return Ok(());
        }
        buf.put_u8(u8::from(self.reason_code));
        self.properties.encode(buf)
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        _version: ProtocolVersion,
    ) -> Result<Self> {
        if !buf.has_remaining() {
            return Ok(Self::new(ReasonCode::Success));
        }

        let raw = buf.get_u8();
        let reason_code = ReasonCode::from_u8(raw)
            .filter(|code| Self::is_valid_reason_code(*code))
            .ok_or_else(|| {
                MqttError::MalformedPacket(format!("Invalid AUTH reason code: 0x{raw:02X}"))
            })?;

        let properties = if buf.has_remaining() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::AUTH, "AUTH")?;
            properties
        } else {
            Properties::default()
        };

        if reason_code != ReasonCode::Success && properties.authentication_method().is_none() {
            return Err(MqttError::MalformedPacket(
                "AUTH without an authentication method".to_string(),
            ));
        }

        Ok(Self {
            reason_code,
            properties,
        })
    }
}
