use crate::error::Result;
use crate::packet::{decode_ack_body, encode_ack_body, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::protocol::ProtocolVersion;
use bytes::{Buf, BufMut};

/// MQTT PUBCOMP packet: final step of the QoS 2 handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubCompPacket {
    pub packet_id: u16,
    /// Always `Success` on 3.x connections
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PubCompPacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self::new_with_reason(packet_id, ReasonCode::Success)
    }

    #[must_use]
    pub fn new_with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Properties::default(),
        }
    }
}

impl MqttPacket for PubCompPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::PubComp
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        encode_ack_body(buf, self.packet_id, self.reason_code, &self.properties, version)
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let (packet_id, reason_code, properties) =
            decode_ack_body(buf, "PUBCOMP", version, ReasonCode::is_valid_for_release)?;
        Ok(Self {
            packet_id,
            reason_code,
            properties,
        })
    }
}
