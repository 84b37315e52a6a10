use crate::encoding::{decode_binary, decode_string, encode_binary, encode_string};
use crate::error::{MqttError, Result};
use crate::flags::ConnectFlags;
use crate::packet::{FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties};
use crate::protocol::ProtocolVersion;
use crate::types::WillMessage;
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

/// MQTT CONNECT packet
///
/// The protocol revision travels inside the packet, so decoding ignores the
/// version the caller passes and reports the one the client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    /// Clean Session in 3.x, Clean Start in 5.0
    pub clean_start: bool,
    /// Keep alive interval in seconds, 0 disables it
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<WillMessage>,
    /// CONNECT properties (v5.0 only)
    pub properties: Properties,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(protocol_version: ProtocolVersion, client_id: impl Into<String>) -> Self {
        Self {
            protocol_version,
            clean_start: true,
            keep_alive: 0,
            client_id: client_id.into(),
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.will = Some(will);
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    fn connect_flags(&self) -> u8 {
        let mut flags = 0u8;

        if self.clean_start {
            flags |= ConnectFlags::CleanStart as u8;
        }

        if let Some(ref will) = self.will {
            flags |= ConnectFlags::WillFlag as u8;
            flags = ConnectFlags::with_will_qos(flags, will.qos as u8);
            if will.retain {
                flags |= ConnectFlags::WillRetain as u8;
            }
        }

        if self.username.is_some() {
            flags |= ConnectFlags::UsernameFlag as u8;
        }

        if self.password.is_some() {
            flags |= ConnectFlags::PasswordFlag as u8;
        }

        flags
    }
}

impl MqttPacket for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, _version: ProtocolVersion) -> Result<()> {
        let version = self.protocol_version;
        encode_string(buf, version.protocol_name())?;
        buf.put_u8(version.level());
        buf.put_u8(self.connect_flags());
        buf.put_u16(self.keep_alive);

        if version.is_v5() {
            self.properties.encode(buf)?;
        }

        encode_string(buf, &self.client_id)?;

        if let Some(ref will) = self.will {
            if version.is_v5() {
                will.properties.encode(buf)?;
            }
            encode_string(buf, &will.topic)?;
            encode_binary(buf, &will.payload)?;
        }

        if let Some(ref username) = self.username {
            encode_string(buf, username)?;
        }

        if let Some(ref password) = self.password {
            encode_binary(buf, password)?;
        }

        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        _version: ProtocolVersion,
    ) -> Result<Self> {
        let protocol_version = Self::decode_protocol_header(buf)?;
        let (flags, keep_alive) = Self::decode_connect_flags_and_keepalive(buf, protocol_version)?;

        let properties = if protocol_version.is_v5() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::CONNECT, "CONNECT")?;
            properties
        } else {
            Properties::default()
        };

        let client_id = decode_string(buf)?;
        let will = Self::decode_will(buf, &flags, protocol_version)?;
        let (username, password) = Self::decode_credentials(buf, &flags)?;

        Ok(Self {
            protocol_version,
            clean_start: flags.clean_start,
            keep_alive,
            client_id,
            username,
            password,
            will,
            properties,
        })
    }
}

struct DecodedConnectFlags {
    clean_start: bool,
    will_flag: bool,
    will_qos: u8,
    will_retain: bool,
    username_flag: bool,
    password_flag: bool,
}

impl ConnectPacket {
    /// Reads the protocol name and level
    ///
    /// A recognised name with a level it does not go with is reported as
    /// `UnsupportedProtocolVersion` so the caller can still answer with a
    /// CONNACK; an unknown name is malformed.
    fn decode_protocol_header<B: Buf>(buf: &mut B) -> Result<ProtocolVersion> {
        let protocol_name = decode_string(buf)?;
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Missing protocol level".to_string(),
            ));
        }
        ProtocolVersion::from_name_and_level(&protocol_name, buf.get_u8())
    }

    fn decode_connect_flags_and_keepalive<B: Buf>(
        buf: &mut B,
        protocol_version: ProtocolVersion,
    ) -> Result<(DecodedConnectFlags, u16)> {
        if buf.remaining() < 3 {
            return Err(MqttError::MalformedPacket(
                "Missing connect flags or keep alive".to_string(),
            ));
        }
        let flags = buf.get_u8();
        let decomposed = ConnectFlags::decompose(flags);

        if decomposed.contains(&ConnectFlags::Reserved) {
            return Err(MqttError::MalformedPacket(
                "Reserved flag bit must be 0".to_string(),
            ));
        }

        let decoded = DecodedConnectFlags {
            clean_start: decomposed.contains(&ConnectFlags::CleanStart),
            will_flag: decomposed.contains(&ConnectFlags::WillFlag),
            will_qos: ConnectFlags::extract_will_qos(flags),
            will_retain: decomposed.contains(&ConnectFlags::WillRetain),
            username_flag: decomposed.contains(&ConnectFlags::UsernameFlag),
            password_flag: decomposed.contains(&ConnectFlags::PasswordFlag),
        };

        if !decoded.will_flag && (decoded.will_qos != 0 || decoded.will_retain) {
            return Err(MqttError::MalformedPacket(
                "Will QoS or retain set without the will flag".to_string(),
            ));
        }
        if decoded.will_qos > 2 {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid will QoS {}",
                decoded.will_qos
            )));
        }
        if !protocol_version.is_v5() && decoded.password_flag && !decoded.username_flag {
            return Err(MqttError::MalformedPacket(
                "Password flag set without username flag".to_string(),
            ));
        }

        let keep_alive = buf.get_u16();
        Ok((decoded, keep_alive))
    }

    fn decode_will<B: Buf>(
        buf: &mut B,
        flags: &DecodedConnectFlags,
        protocol_version: ProtocolVersion,
    ) -> Result<Option<WillMessage>> {
        if !flags.will_flag {
            return Ok(None);
        }

        let properties = if protocol_version.is_v5() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::WILL, "CONNECT will")?;
            properties
        } else {
            Properties::default()
        };

        let topic = decode_string(buf)?;
        let payload = decode_binary(buf)?;
        let qos = QoS::try_from(flags.will_qos)?;

        Ok(Some(
            WillMessage::new(topic, payload)
                .with_qos(qos)
                .with_retain(flags.will_retain)
                .with_properties(properties),
        ))
    }

    fn decode_credentials<B: Buf>(
        buf: &mut B,
        flags: &DecodedConnectFlags,
    ) -> Result<(Option<String>, Option<Bytes>)> {
        let username = if flags.username_flag {
            Some(decode_string(buf)?)
        } else {
            None
        };
        let password = if flags.password_flag {
            Some(decode_binary(buf)?)
        } else {
            None
        };
        Ok((username, password))
    }
}
