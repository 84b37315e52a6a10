use crate::error::{MqttError, Result};
use crate::flags::ConnAckFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties};
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::protocol::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT CONNACK packet
///
/// The reason code is always held as a v5 [`ReasonCode`]; 3.x connections
/// put the closest return code on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckPacket {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    /// CONNACK properties (v5.0 only)
    pub properties: Properties,
}

impl ConnAckPacket {
    #[must_use]
    pub fn new(session_present: bool, reason_code: ReasonCode) -> Self {
        Self {
            session_present,
            reason_code,
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn with_receive_maximum(mut self, max: u16) -> Self {
        self.properties.set_receive_maximum(max);
        self
    }

    #[must_use]
    pub fn with_assigned_client_id(mut self, id: String) -> Self {
        self.properties.set_assigned_client_identifier(id);
        self
    }

    #[must_use]
    pub fn with_server_keep_alive(mut self, keep_alive: u16) -> Self {
        self.properties.set_server_keep_alive(keep_alive);
        self
    }

    #[must_use]
    pub fn with_session_expiry_interval(mut self, interval: u32) -> Self {
        self.properties.set_session_expiry_interval(interval);
        self
    }

    #[must_use]
    pub fn with_reason_string(mut self, reason: String) -> Self {
        self.properties.set_reason_string(reason);
        self
    }
}

impl MqttPacket for ConnAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnAck
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        // a refused connection never reports a session
        let session_present = self.session_present && self.reason_code == ReasonCode::Success;
        buf.put_u8(if session_present {
            ConnAckFlags::SessionPresent as u8
        } else {
            0
        });

        if version.is_v5() {
            buf.put_u8(u8::from(self.reason_code));
            self.properties.encode(buf)?;
        } else {
            buf.put_u8(self.reason_code.to_v3_connect_return_code());
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(MqttError::MalformedPacket(
                "CONNACK is shorter than 2 bytes".to_string(),
            ));
        }

        let flags = buf.get_u8();
        if flags & !(ConnAckFlags::SessionPresent as u8) != 0 {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid CONNACK flags 0x{flags:02X}"
            )));
        }
        let session_present = ConnAckFlags::decompose(flags).contains(&ConnAckFlags::SessionPresent);

        let raw = buf.get_u8();
        let reason_code = if version.is_v5() {
            ReasonCode::from_u8(raw).filter(|code| code.is_valid_for_connack())
        } else {
            ReasonCode::from_v3_connect_return_code(raw)
        }
        .ok_or_else(|| {
            MqttError::MalformedPacket(format!("Invalid CONNACK return code 0x{raw:02X}"))
        })?;

        let properties = if version.is_v5() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::CONNACK, "CONNACK")?;
            properties
        } else {
            Properties::default()
        };

        Ok(Self {
            session_present,
            reason_code,
            properties,
        })
    }
}
