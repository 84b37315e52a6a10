use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::flags::PublishFlags;
use crate::packet::{decode_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties, PropertyId, PropertyValue};
use crate::protocol::ProtocolVersion;
use crate::QoS;
use bytes::{Buf, BufMut, Bytes};

/// MQTT PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic_name: String,
    /// Present exactly when `qos` is above 0
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Set on redelivery of a message the peer may already have seen
    pub dup: bool,
    /// PUBLISH properties (v5.0 only)
    pub properties: Properties,
}

impl PublishPacket {
    /// Creates a PUBLISH without a packet identifier
    ///
    /// QoS 1 and 2 packets need [`PublishPacket::with_packet_id`] before
    /// they can be encoded.
    #[must_use]
    pub fn new(topic_name: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic_name: topic_name.into(),
            packet_id: None,
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            properties: Properties::default(),
        }
    }

    /// Sets the packet identifier; ignored for QoS 0
    #[must_use]
    pub fn with_packet_id(mut self, id: u16) -> Self {
        if self.qos != QoS::AtMostOnce {
            self.packet_id = Some(id);
        }
        self
    }

    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn topic_alias(&self) -> Option<u16> {
        match self.properties.get(PropertyId::TopicAlias) {
            Some(PropertyValue::TwoByteInteger(alias)) => Some(*alias),
            _ => None,
        }
    }

    /// Checks the flag nibble of a PUBLISH fixed header
    ///
    /// QoS 3 and DUP on a QoS 0 message are both malformed.
    #[must_use]
    pub fn validate_flags(flags: u8) -> bool {
        match PublishFlags::extract_qos(flags) {
            0 => !PublishFlags::decompose(flags).contains(&PublishFlags::Dup),
            1 | 2 => true,
            _ => false,
        }
    }
}

impl MqttPacket for PublishPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Publish
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.dup && self.qos != QoS::AtMostOnce {
            flags |= PublishFlags::Dup as u8;
        }
        flags = PublishFlags::with_qos(flags, self.qos as u8);
        if self.retain {
            flags |= PublishFlags::Retain as u8;
        }
        flags
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        encode_string(buf, &self.topic_name)?;

        if self.qos != QoS::AtMostOnce {
            let packet_id = self.packet_id.filter(|id| *id != 0).ok_or_else(|| {
                MqttError::InvalidArgument("PUBLISH with QoS > 0 needs a packet identifier".into())
            })?;
            buf.put_u16(packet_id);
        }

        if version.is_v5() {
            self.properties.encode(buf)?;
        }

        buf.put_slice(&self.payload);
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let flags = PublishFlags::decompose(fixed_header.flags);
        let qos_val = PublishFlags::extract_qos(fixed_header.flags);
        let qos = QoS::try_from(qos_val)
            .map_err(|_| MqttError::MalformedPacket(format!("Invalid PUBLISH QoS {qos_val}")))?;

        let topic_name = decode_string(buf)?;

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(decode_packet_id(buf, "PUBLISH")?)
        };

        let properties = if version.is_v5() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::PUBLISH, "PUBLISH")?;
            properties
        } else {
            Properties::default()
        };

        if topic_name.is_empty() && !properties.contains(PropertyId::TopicAlias) {
            return Err(MqttError::MalformedPacket(
                "PUBLISH topic name is empty".to_string(),
            ));
        }

        let payload = buf.copy_to_bytes(buf.remaining());

        Ok(Self {
            topic_name,
            packet_id,
            payload,
            qos,
            retain: flags.contains(&PublishFlags::Retain),
            dup: flags.contains(&PublishFlags::Dup),
            properties,
        })
    }
}
