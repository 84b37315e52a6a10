use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{decode_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties};
use crate::protocol::ProtocolVersion;
use crate::validation::is_valid_topic_filter;
use bytes::{Buf, BufMut};

/// MQTT UNSUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    /// Never empty on the wire
    pub filters: Vec<String>,
    /// UNSUBSCRIBE properties (v5.0 only)
    pub properties: Properties,
}

impl UnsubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }
}

impl MqttPacket for UnsubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Unsubscribe
    }

    fn flags(&self) -> u8 {
        crate::constants::REQUIRED_FLAGS_0010
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::InvalidArgument(
                "UNSUBSCRIBE needs at least one topic filter".to_string(),
            ));
        }

        buf.put_u16(self.packet_id);
        if version.is_v5() {
            self.properties.encode(buf)?;
        }
        for filter in &self.filters {
            encode_string(buf, filter)?;
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = decode_packet_id(buf, "UNSUBSCRIBE")?;

        let properties = if version.is_v5() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::UNSUBSCRIBE, "UNSUBSCRIBE")?;
            properties
        } else {
            Properties::default()
        };

        let mut filters = Vec::new();
        while buf.has_remaining() {
            let filter = decode_string(buf)?;
            if !is_valid_topic_filter(&filter) {
                return Err(MqttError::MalformedPacket(format!(
                    "Invalid topic filter '{filter}'"
                )));
            }
            filters.push(filter);
        }

        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "UNSUBSCRIBE carries no topic filters".to_string(),
            ));
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }
}
