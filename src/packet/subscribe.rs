use crate::constants::subscription::V3_RESERVED_BITS_MASK;
use crate::encoding::{decode_string, encode_string};
use crate::error::{MqttError, Result};
use crate::packet::{decode_packet_id, FixedHeader, MqttPacket, PacketType};
use crate::protocol::v5::properties::{allowed, Properties, PropertyId, PropertyValue};
use crate::protocol::ProtocolVersion;
use crate::validation::is_valid_topic_filter;
use crate::QoS;
use bebytes::BeBytes;
use bytes::{Buf, BufMut};

/// Options byte following each filter in SUBSCRIBE
///
/// 3.x only uses the QoS bits; the rest are v5 additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Maximum QoS the client will accept on this subscription
    pub qos: QoS,
    /// Messages published by this connection are not echoed back
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAtSubscribe = 0,
    SendAtSubscribeIfNew = 1,
    DoNotSend = 2,
}

/// Bit layout of the options byte, MSB first
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct SubscriptionOptionsBits {
    /// Must be 0
    #[bits(2)]
    pub reserved_bits: u8,
    #[bits(2)]
    pub retain_handling: u8,
    #[bits(1)]
    pub retain_as_published: u8,
    #[bits(1)]
    pub no_local: u8,
    #[bits(2)]
    pub qos: u8,
}

impl SubscriptionOptionsBits {
    #[must_use]
    pub fn from_options(options: &SubscriptionOptions) -> Self {
        Self {
            reserved_bits: 0,
            retain_handling: options.retain_handling as u8,
            retain_as_published: u8::from(options.retain_as_published),
            no_local: u8::from(options.no_local),
            qos: options.qos as u8,
        }
    }

    /// Converts the raw bit fields, rejecting reserved values
    ///
    /// # Errors
    ///
    /// `MalformedPacket` for set reserved bits, QoS 3 or retain handling 3
    pub fn to_options(&self) -> Result<SubscriptionOptions> {
        if self.reserved_bits != 0 {
            return Err(MqttError::MalformedPacket(
                "Reserved bits in subscription options must be 0".to_string(),
            ));
        }

        let qos = QoS::try_from(self.qos).map_err(|_| {
            MqttError::MalformedPacket(format!(
                "Invalid QoS value in subscription options: {}",
                self.qos
            ))
        })?;

        let retain_handling = match self.retain_handling {
            0 => RetainHandling::SendAtSubscribe,
            1 => RetainHandling::SendAtSubscribeIfNew,
            2 => RetainHandling::DoNotSend,
            other => {
                return Err(MqttError::MalformedPacket(format!(
                    "Invalid retain handling value: {other}"
                )))
            }
        };

        Ok(SubscriptionOptions {
            qos,
            no_local: self.no_local != 0,
            retain_as_published: self.retain_as_published != 0,
            retain_handling,
        })
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::new(QoS::AtMostOnce)
    }
}

impl SubscriptionOptions {
    #[must_use]
    pub fn new(qos: QoS) -> Self {
        Self {
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::SendAtSubscribe,
        }
    }

    #[must_use]
    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    #[must_use]
    pub fn with_retain_as_published(mut self, retain_as_published: bool) -> Self {
        self.retain_as_published = retain_as_published;
        self
    }

    #[must_use]
    pub fn with_retain_handling(mut self, retain_handling: RetainHandling) -> Self {
        self.retain_handling = retain_handling;
        self
    }

    /// Encodes the options byte; 3.x keeps only the QoS bits
    #[must_use]
    pub fn encode(&self, version: ProtocolVersion) -> u8 {
        if version.is_v5() {
            SubscriptionOptionsBits::from_options(self).to_be_bytes()[0]
        } else {
            self.qos as u8
        }
    }

    /// Decodes the options byte for `version`
    ///
    /// # Errors
    ///
    /// `MalformedPacket` when bits reserved in that version are set
    pub fn decode(byte: u8, version: ProtocolVersion) -> Result<Self> {
        if !version.is_v5() && byte & V3_RESERVED_BITS_MASK != 0 {
            return Err(MqttError::MalformedPacket(format!(
                "Reserved bits set in MQTT {version} requested QoS byte 0x{byte:02X}"
            )));
        }
        let (bits, _consumed) = SubscriptionOptionsBits::try_from_be_bytes(&[byte])
            .map_err(|e| MqttError::MalformedPacket(format!("Invalid subscription options: {e}")))?;
        bits.to_options()
    }
}

/// Topic filter with subscription options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    /// May contain `+` and `#` wildcards
    pub filter: String,
    pub options: SubscriptionOptions,
}

impl TopicFilter {
    #[must_use]
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self::with_options(filter, SubscriptionOptions::new(qos))
    }

    #[must_use]
    pub fn with_options(filter: impl Into<String>, options: SubscriptionOptions) -> Self {
        Self {
            filter: filter.into(),
            options,
        }
    }
}

/// MQTT SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    /// Never empty on the wire
    pub filters: Vec<TopicFilter>,
    /// SUBSCRIBE properties (v5.0 only)
    pub properties: Properties,
}

impl SubscribePacket {
    #[must_use]
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            filters: Vec::new(),
            properties: Properties::default(),
        }
    }

    #[must_use]
    pub fn add_filter(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.filters.push(TopicFilter::new(filter, qos));
        self
    }

    #[must_use]
    pub fn add_filter_with_options(mut self, filter: TopicFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// v5 subscription identifier, if the client attached one
    #[must_use]
    pub fn subscription_identifier(&self) -> Option<u32> {
        match self.properties.get(PropertyId::SubscriptionIdentifier) {
            Some(PropertyValue::VariableByteInteger(id)) => Some(*id),
            _ => None,
        }
    }
}

impl MqttPacket for SubscribePacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Subscribe
    }

    fn flags(&self) -> u8 {
        crate::constants::REQUIRED_FLAGS_0010
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        if self.filters.is_empty() {
            return Err(MqttError::InvalidArgument(
                "SUBSCRIBE needs at least one topic filter".to_string(),
            ));
        }
        buf.put_u16(self.packet_id);

        if version.is_v5() {
            self.properties.encode(buf)?;
        }

        for filter in &self.filters {
            encode_string(buf, &filter.filter)?;
            buf.put_u8(filter.options.encode(version));
        }
        Ok(())
    }

    fn decode_body<B: Buf>(
        buf: &mut B,
        _fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet_id = decode_packet_id(buf, "SUBSCRIBE")?;

        let properties = if version.is_v5() {
            let properties = Properties::decode(buf)?;
            properties.validate_for(allowed::SUBSCRIBE, "SUBSCRIBE")?;
            if matches!(
                properties.get(PropertyId::SubscriptionIdentifier),
                Some(PropertyValue::VariableByteInteger(0))
            ) {
                return Err(MqttError::MalformedPacket(
                    "Subscription identifier must not be 0".to_string(),
                ));
            }
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
            if !buf.has_remaining() {
                return Err(MqttError::MalformedPacket(format!(
                    "Missing subscription options for '{filter}'"
                )));
            }
            let options = SubscriptionOptions::decode(buf.get_u8(), version)?;
            filters.push(TopicFilter { filter, options });
        }

        if filters.is_empty() {
            return Err(MqttError::MalformedPacket(
                "SUBSCRIBE carries no topic filters".to_string(),
            ));
        }

        Ok(Self {
            packet_id,
            filters,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{decode_packet, Packet};
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn decode(bytes: &[u8], version: ProtocolVersion) -> Result<SubscribePacket> {
        match decode_packet(bytes, version, 1024)? {
            Some((Packet::Subscribe(packet), _)) => Ok(packet),
            other => panic!("unexpected decode result {other:?}"),
        }
    }

    #[test]
    fn test_options_bits_layout() {
        let options = SubscriptionOptions::new(QoS::ExactlyOnce)
            .with_no_local(true)
            .with_retain_as_published(true)
            .with_retain_handling(RetainHandling::DoNotSend);
        assert_eq!(options.encode(ProtocolVersion::V5), 0b0010_1110);
        assert_eq!(options.encode(ProtocolVersion::V3_1_1), 0x02);
        assert_eq!(
            SubscriptionOptions::decode(0b0010_1110, ProtocolVersion::V5).unwrap(),
            options
        );
    }

    #[test]
    fn test_options_reserved_values_rejected() {
        assert!(SubscriptionOptions::decode(0xC0, ProtocolVersion::V5).is_err());
        assert!(SubscriptionOptions::decode(0x03, ProtocolVersion::V5).is_err());
        assert!(SubscriptionOptions::decode(0x30, ProtocolVersion::V5).is_err());
        // v5-only bits are reserved in 3.x
        assert!(SubscriptionOptions::decode(0x04, ProtocolVersion::V3_1_1).is_err());
        assert!(SubscriptionOptions::decode(0x04, ProtocolVersion::V5).is_ok());
    }

    #[test]
    fn test_v311_wire_layout() {
        let packet = SubscribePacket::new(1).add_filter("a/+", QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V3_1_1).unwrap();
        assert_eq!(
            &buf[..],
            &[0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'+', 0x01]
        );
        assert_eq!(decode(&buf, ProtocolVersion::V3_1_1).unwrap(), packet);
    }

    #[test]
    fn test_v5_round_trip_with_identifier() {
        let mut packet = SubscribePacket::new(42)
            .add_filter("sensors/#", QoS::ExactlyOnce)
            .add_filter_with_options(TopicFilter::with_options(
                "cmd/dev1",
                SubscriptionOptions::new(QoS::AtLeastOnce).with_no_local(true),
            ));
        packet
            .properties
            .add(
                PropertyId::SubscriptionIdentifier,
                PropertyValue::VariableByteInteger(7),
            )
            .unwrap();

        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V5).unwrap();
        let decoded = decode(&buf, ProtocolVersion::V5).unwrap();
        assert_eq!(decoded.subscription_identifier(), Some(7));
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_empty_payload_is_malformed() {
        assert!(matches!(
            decode(&[0x82, 0x02, 0x00, 0x01], ProtocolVersion::V3_1_1),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_wrong_fixed_header_flags() {
        assert!(decode_packet(
            &[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00],
            ProtocolVersion::V3_1_1,
            64
        )
        .is_err());
    }

    #[test]
    fn test_invalid_filter_is_malformed() {
        let packet = SubscribePacket::new(1).add_filter("a/b#", QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, ProtocolVersion::V3_1_1).unwrap();
        assert!(decode(&buf, ProtocolVersion::V3_1_1).is_err());
    }

    proptest! {
        #[test]
        fn prop_options_bits_round_trip(
            qos in 0u8..=2,
            no_local in any::<bool>(),
            retain_as_published in any::<bool>(),
            retain_handling in 0u8..=2,
        ) {
            let byte = (retain_handling << 4)
                | (u8::from(retain_as_published) << 3)
                | (u8::from(no_local) << 2)
                | qos;
            let options = SubscriptionOptions::decode(byte, ProtocolVersion::V5).unwrap();
            prop_assert_eq!(options.encode(ProtocolVersion::V5), byte);
        }
    }
}
