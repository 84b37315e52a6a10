//! Version-aware MQTT packet codec
//!
//! [`decode_packet`] works on a possibly partial byte stream and reports
//! `Ok(None)` until a whole packet is buffered; anything structurally wrong
//! is `MalformedPacket`. [`encode_packet`] writes a complete packet and
//! fails with `PacketTooLarge` if the remaining length does not fit the
//! 4-byte variable integer.

pub mod auth;
pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod puback;
pub mod pubcomp;
pub mod publish;
pub mod pubrec;
pub mod pubrel;
pub mod suback;
pub mod subscribe;
pub mod unsuback;
pub mod unsubscribe;

use crate::constants::{limits, masks, REQUIRED_FLAGS_0010};
use crate::encoding::{encode_variable_int, peek_variable_int, variable_int_len};
use crate::error::{MqttError, Result};
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::protocol::ProtocolVersion;
use bebytes::BeBytes;
use bytes::{Buf, BufMut, BytesMut};

/// Packet identifier followed by a reason code, shared by the v5 forms of
/// PUBACK, PUBREC, PUBREL and PUBCOMP
#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub struct AckPacketHeader {
    #[bebytes(big_endian)]
    pub packet_id: u16,
    pub reason_code: u8,
}

impl AckPacketHeader {
    #[must_use]
    pub fn create(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code: u8::from(reason_code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BeBytes)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        // TryFrom is generated by BeBytes
        Self::try_from(value).ok()
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// MQTT packet fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    #[must_use]
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: u32) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Encodes the fixed header
    ///
    /// # Errors
    ///
    /// Returns `PacketTooLarge` if the remaining length exceeds 268,435,455
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let byte1 = (u8::from(self.packet_type) << 4) | (self.flags & masks::FLAGS);
        buf.put_u8(byte1);
        encode_variable_int(buf, self.remaining_length)
    }

    /// Reads a fixed header from the front of a partial stream
    ///
    /// Returns the header and its encoded length, or `Ok(None)` when the
    /// remaining-length bytes are still incomplete.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` for packet type 0, a 5-byte remaining length or
    /// flags the packet type does not permit
    pub fn peek(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&byte1) = bytes.first() else {
            return Ok(None);
        };
        let Some((remaining_length, len_bytes)) = peek_variable_int(&bytes[1..])? else {
            return Ok(None);
        };

        let type_bits = (byte1 & masks::PACKET_TYPE) >> 4;
        let packet_type = PacketType::from_u8(type_bits).ok_or_else(|| {
            MqttError::MalformedPacket(format!("Invalid packet type: {type_bits}"))
        })?;
        let header = Self::new(packet_type, byte1 & masks::FLAGS, remaining_length);
        if !header.validate_flags() {
            return Err(MqttError::MalformedPacket(format!(
                "Invalid flags 0x{:02X} for {packet_type:?}",
                header.flags
            )));
        }
        Ok(Some((header, 1 + len_bytes)))
    }

    /// Validates the flags for the packet type
    #[must_use]
    pub fn validate_flags(&self) -> bool {
        match self.packet_type {
            PacketType::Publish => publish::PublishPacket::validate_flags(self.flags),
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => {
                self.flags == REQUIRED_FLAGS_0010
            }
            _ => self.flags == 0,
        }
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + variable_int_len(self.remaining_length)
    }
}

/// Tagged union over every MQTT packet kind
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Box<connect::ConnectPacket>),
    ConnAck(connack::ConnAckPacket),
    Publish(publish::PublishPacket),
    PubAck(puback::PubAckPacket),
    PubRec(pubrec::PubRecPacket),
    PubRel(pubrel::PubRelPacket),
    PubComp(pubcomp::PubCompPacket),
    Subscribe(subscribe::SubscribePacket),
    SubAck(suback::SubAckPacket),
    Unsubscribe(unsubscribe::UnsubscribePacket),
    UnsubAck(unsuback::UnsubAckPacket),
    PingReq,
    PingResp,
    Disconnect(disconnect::DisconnectPacket),
    Auth(auth::AuthPacket),
}

impl Packet {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::ConnAck(_) => PacketType::ConnAck,
            Self::Publish(_) => PacketType::Publish,
            Self::PubAck(_) => PacketType::PubAck,
            Self::PubRec(_) => PacketType::PubRec,
            Self::PubRel(_) => PacketType::PubRel,
            Self::PubComp(_) => PacketType::PubComp,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::SubAck(_) => PacketType::SubAck,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::UnsubAck(_) => PacketType::UnsubAck,
            Self::PingReq => PacketType::PingReq,
            Self::PingResp => PacketType::PingResp,
            Self::Disconnect(_) => PacketType::Disconnect,
            Self::Auth(_) => PacketType::Auth,
        }
    }

    /// Decode a packet body based on the packet type
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails
    pub fn decode_from_body<B: Buf>(
        fixed_header: &FixedHeader,
        buf: &mut B,
        version: ProtocolVersion,
    ) -> Result<Self> {
        let packet = match fixed_header.packet_type {
            PacketType::Connect => Self::Connect(Box::new(connect::ConnectPacket::decode_body(
                buf,
                fixed_header,
                version,
            )?)),
            PacketType::ConnAck => {
                Self::ConnAck(connack::ConnAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::Publish => {
                Self::Publish(publish::PublishPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubAck => {
                Self::PubAck(puback::PubAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubRec => {
                Self::PubRec(pubrec::PubRecPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubRel => {
                Self::PubRel(pubrel::PubRelPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PubComp => {
                Self::PubComp(pubcomp::PubCompPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::Subscribe => Self::Subscribe(subscribe::SubscribePacket::decode_body(
                buf,
                fixed_header,
                version,
            )?),
            PacketType::SubAck => {
                Self::SubAck(suback::SubAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::Unsubscribe => Self::Unsubscribe(
                unsubscribe::UnsubscribePacket::decode_body(buf, fixed_header, version)?,
            ),
            PacketType::UnsubAck => {
                Self::UnsubAck(unsuback::UnsubAckPacket::decode_body(buf, fixed_header, version)?)
            }
            PacketType::PingReq => Self::PingReq,
            PacketType::PingResp => Self::PingResp,
            PacketType::Disconnect => Self::Disconnect(disconnect::DisconnectPacket::decode_body(
                buf,
                fixed_header,
                version,
            )?),
            PacketType::Auth => {
                if !version.is_v5() {
                    return Err(MqttError::MalformedPacket(format!(
                        "AUTH is not defined for MQTT {version}"
                    )));
                }
                Self::Auth(auth::AuthPacket::decode_body(buf, fixed_header, version)?)
            }
        };
        Ok(packet)
    }

    /// Encodes the complete packet for `version`
    ///
    /// # Errors
    ///
    /// `PacketTooLarge` if the packet cannot be framed, otherwise any field
    /// encoding error
    pub fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        match self {
            Self::Connect(p) => p.encode(buf, version),
            Self::ConnAck(p) => p.encode(buf, version),
            Self::Publish(p) => p.encode(buf, version),
            Self::PubAck(p) => p.encode(buf, version),
            Self::PubRec(p) => p.encode(buf, version),
            Self::PubRel(p) => p.encode(buf, version),
            Self::PubComp(p) => p.encode(buf, version),
            Self::Subscribe(p) => p.encode(buf, version),
            Self::SubAck(p) => p.encode(buf, version),
            Self::Unsubscribe(p) => p.encode(buf, version),
            Self::UnsubAck(p) => p.encode(buf, version),
            Self::PingReq | Self::PingResp => {
                FixedHeader::new(self.packet_type(), 0, 0).encode(buf)
            }
            Self::Disconnect(p) => p.encode(buf, version),
            Self::Auth(p) => p.encode(buf, version),
        }
    }

    /// Size of the packet on the wire for `version`
    ///
    /// # Errors
    ///
    /// Same as [`Packet::encode`]
    pub fn encoded_len(&self, version: ProtocolVersion) -> Result<usize> {
        let mut scratch = BytesMut::new();
        self.encode(&mut scratch, version)?;
        Ok(scratch.len())
    }
}

/// Decodes one packet from the front of `bytes`
///
/// Returns the packet and the number of bytes it occupied, or `Ok(None)` if
/// `bytes` does not yet hold a whole packet. `max_packet_size` bounds the
/// full packet length and is checked as soon as the fixed header is known.
///
/// # Errors
///
/// `MalformedPacket` for invalid framing or content, `PacketTooLarge` when
/// the announced size exceeds `max_packet_size`, and
/// `UnsupportedProtocolVersion` for a CONNECT naming a revision this codec
/// does not speak
pub fn decode_packet(
    bytes: &[u8],
    version: ProtocolVersion,
    max_packet_size: usize,
) -> Result<Option<(Packet, usize)>> {
    let Some((header, header_len)) = FixedHeader::peek(bytes)? else {
        return Ok(None);
    };

    let total_len = header_len + header.remaining_length as usize;
    if total_len > max_packet_size {
        return Err(MqttError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        });
    }
    if bytes.len() < total_len {
        return Ok(None);
    }

    let mut body = &bytes[header_len..total_len];
    let packet = Packet::decode_from_body(&header, &mut body, version)?;
    if body.has_remaining() {
        return Err(MqttError::MalformedPacket(format!(
            "{} trailing bytes after {:?}",
            body.remaining(),
            header.packet_type
        )));
    }
    Ok(Some((packet, total_len)))
}

/// Appends the encoded packet to `buf`
///
/// # Errors
///
/// See [`Packet::encode`]
pub fn encode_packet(packet: &Packet, version: ProtocolVersion, buf: &mut BytesMut) -> Result<()> {
    packet.encode(buf, version)
}

/// Trait for MQTT packets
pub trait MqttPacket: Sized {
    fn packet_type(&self) -> PacketType;

    /// Returns the fixed header flags
    fn flags(&self) -> u8 {
        0
    }

    /// Encodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be encoded
    fn encode_body<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()>;

    /// Decodes the packet body (without fixed header)
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` if the body is invalid for `version`
    fn decode_body<B: Buf>(
        buf: &mut B,
        fixed_header: &FixedHeader,
        version: ProtocolVersion,
    ) -> Result<Self>;

    /// Encodes the complete packet (with fixed header)
    ///
    /// # Errors
    ///
    /// Returns `PacketTooLarge` if the body exceeds the remaining-length limit
    fn encode<B: BufMut>(&self, buf: &mut B, version: ProtocolVersion) -> Result<()> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body, version)?;

        let remaining_length = u32::try_from(body.len())
            .ok()
            .filter(|len| *len as usize <= limits::MAX_REMAINING_LENGTH)
            .ok_or(MqttError::PacketTooLarge {
                size: body.len(),
                max: limits::MAX_REMAINING_LENGTH,
            })?;

        FixedHeader::new(self.packet_type(), self.flags(), remaining_length).encode(buf)?;
        buf.put_slice(&body);
        Ok(())
    }
}

/// Reads the 2-byte packet identifier, rejecting zero
pub(crate) fn decode_packet_id<B: Buf>(buf: &mut B, packet: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(format!(
            "{packet} is missing its packet identifier"
        )));
    }
    match buf.get_u16() {
        0 => Err(MqttError::MalformedPacket(format!(
            "{packet} packet identifier must be non-zero"
        ))),
        id => Ok(id),
    }
}

/// Writes the body shared by PUBACK, PUBREC, PUBREL and PUBCOMP
///
/// 3.x carries only the identifier. v5 appends the reason code and
/// properties, omitting them when they hold their defaults.
pub(crate) fn encode_ack_body<B: BufMut>(
    buf: &mut B,
    packet_id: u16,
    reason_code: ReasonCode,
    properties: &crate::protocol::v5::properties::Properties,
    version: ProtocolVersion,
) -> Result<()> {
    if !version.is_v5() || (reason_code == ReasonCode::Success && properties.is_empty()) {
        buf.put_u16(packet_id);
        return Ok(());
    }
    buf.put_slice(&AckPacketHeader::create(packet_id, reason_code).to_be_bytes());
    if !properties.is_empty() {
        properties.encode(buf)?;
    }
    Ok(())
}

/// Reads the body shared by PUBACK, PUBREC, PUBREL and PUBCOMP
pub(crate) fn decode_ack_body<B: Buf>(
    buf: &mut B,
    packet: &str,
    version: ProtocolVersion,
    is_valid: fn(ReasonCode) -> bool,
) -> Result<(u16, ReasonCode, crate::protocol::v5::properties::Properties)> {
    use crate::protocol::v5::properties::{allowed, Properties};

    let packet_id = decode_packet_id(buf, packet)?;
    if !version.is_v5() || !buf.has_remaining() {
        return Ok((packet_id, ReasonCode::Success, Properties::default()));
    }

    let raw = buf.get_u8();
    let reason_code = ReasonCode::from_u8(raw)
        .filter(|code| is_valid(*code))
        .ok_or_else(|| {
            MqttError::MalformedPacket(format!("Invalid {packet} reason code: 0x{raw:02X}"))
        })?;
    let properties = if buf.has_remaining() {
        Properties::decode(buf)?
    } else {
        Properties::default()
    };
    properties.validate_for(allowed::ACK, packet)?;
    Ok((packet_id, reason_code, properties))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::puback::PubAckPacket;
    use crate::packet::publish::PublishPacket;
    use crate::QoS;

    const V5: ProtocolVersion = ProtocolVersion::V5;
    const V311: ProtocolVersion = ProtocolVersion::V3_1_1;

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(1), Some(PacketType::Connect));
        assert_eq!(PacketType::from_u8(15), Some(PacketType::Auth));
        assert_eq!(PacketType::from_u8(0), None);
        assert_eq!(PacketType::from_u8(16), None);
    }

    #[test]
    fn test_fixed_header_peek() {
        let mut buf = BytesMut::new();
        FixedHeader::new(PacketType::Publish, 0x0D, 321)
            .encode(&mut buf)
            .unwrap();

        let (header, len) = FixedHeader::peek(&buf).unwrap().unwrap();
        assert_eq!(header.packet_type, PacketType::Publish);
        assert_eq!(header.flags, 0x0D);
        assert_eq!(header.remaining_length, 321);
        assert_eq!(len, 3);
        assert_eq!(header.encoded_len(), 3);

        assert_eq!(FixedHeader::peek(&buf[..2]).unwrap(), None);
        assert_eq!(FixedHeader::peek(&[]).unwrap(), None);
    }

    #[test]
    fn test_fixed_header_remaining_length_limit() {
        let mut buf = BytesMut::new();
        let err = FixedHeader::new(PacketType::Publish, 0, limits::MAX_REMAINING_LENGTH as u32 + 1)
            .encode(&mut buf)
            .unwrap_err();
        assert!(matches!(err, MqttError::PacketTooLarge { .. }));
    }

    #[test]
    fn test_validate_flags() {
        assert!(FixedHeader::new(PacketType::Connect, 0, 0).validate_flags());
        assert!(!FixedHeader::new(PacketType::Connect, 1, 0).validate_flags());
        assert!(FixedHeader::new(PacketType::Subscribe, 0x02, 0).validate_flags());
        assert!(!FixedHeader::new(PacketType::Subscribe, 0x00, 0).validate_flags());
        assert!(FixedHeader::new(PacketType::PubRel, 0x02, 0).validate_flags());
        // QoS 3 is never valid
        assert!(!FixedHeader::new(PacketType::Publish, 0x06, 0).validate_flags());
        // DUP on QoS 0
        assert!(!FixedHeader::new(PacketType::Publish, 0x08, 0).validate_flags());
        assert!(FixedHeader::new(PacketType::Publish, 0x0D, 0).validate_flags());
    }

    #[test]
    fn test_decode_reports_incomplete_input() {
        let packet = Packet::Publish(
            PublishPacket::new("a/b", &b"payload"[..], QoS::AtLeastOnce).with_packet_id(7),
        );
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, V311).unwrap();

        for cut in 0..buf.len() {
            assert_eq!(
                decode_packet(&buf[..cut], V311, limits::MAX_REMAINING_LENGTH).unwrap(),
                None,
                "cut at {cut}"
            );
        }
        let (decoded, used) = decode_packet(&buf, V311, limits::MAX_REMAINING_LENGTH)
            .unwrap()
            .unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_decode_two_packets_back_to_back() {
        let mut buf = BytesMut::new();
        Packet::PingReq.encode(&mut buf, V5).unwrap();
        Packet::PubAck(PubAckPacket::new(3)).encode(&mut buf, V5).unwrap();

        let (first, used) = decode_packet(&buf, V5, 1024).unwrap().unwrap();
        assert_eq!(first, Packet::PingReq);
        let (second, _) = decode_packet(&buf[used..], V5, 1024).unwrap().unwrap();
        assert_eq!(second, Packet::PubAck(PubAckPacket::new(3)));
    }

    #[test]
    fn test_decode_invalid_packet_type_is_malformed() {
        assert!(matches!(
            decode_packet(&[0x00, 0x00], V5, 1024),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_decode_oversized_before_body_arrives() {
        // header announces 200 bytes, only the header is buffered
        let bytes = [0x30, 0xC8, 0x01];
        assert_eq!(
            decode_packet(&bytes, V5, 100),
            Err(MqttError::PacketTooLarge { size: 203, max: 100 })
        );
    }

    #[test]
    fn test_decode_trailing_bytes_is_malformed() {
        // PINGREQ announcing one byte of body
        assert!(matches!(
            decode_packet(&[0xC0, 0x01, 0x00], V5, 1024),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_auth_rejected_before_v5() {
        assert!(matches!(
            decode_packet(&[0xF0, 0x00], V311, 1024),
            Err(MqttError::MalformedPacket(_))
        ));
        let (packet, _) = decode_packet(&[0xF0, 0x00], V5, 1024).unwrap().unwrap();
        assert!(matches!(packet, Packet::Auth(_)));
    }

    #[test]
    fn test_encoded_len_matches_encode() {
        let packet = Packet::Publish(PublishPacket::new("t", &b"xyz"[..], QoS::AtMostOnce));
        let mut buf = BytesMut::new();
        packet.encode(&mut buf, V5).unwrap();
        assert_eq!(packet.encoded_len(V5).unwrap(), buf.len());
    }

    #[test]
    fn test_ack_header_bebytes_layout() {
        let header = AckPacketHeader::create(0x1234, ReasonCode::NoMatchingSubscribers);
        assert_eq!(header.to_be_bytes(), vec![0x12, 0x34, 0x10]);
        let (decoded, used) = AckPacketHeader::try_from_be_bytes(&[0x12, 0x34, 0x10]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(used, 3);
    }
}
