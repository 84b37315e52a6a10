use crate::encoding::{
    binary_len, decode_binary, decode_string, decode_string_pair, decode_variable_int,
    encode_binary, encode_string, encode_variable_int, string_len, variable_int_len,
};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;

/// MQTT v5.0 Property Identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl PropertyId {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        let id = match value {
            0x01 => Self::PayloadFormatIndicator,
            0x02 => Self::MessageExpiryInterval,
            0x03 => Self::ContentType,
            0x08 => Self::ResponseTopic,
            0x09 => Self::CorrelationData,
            0x0B => Self::SubscriptionIdentifier,
            0x11 => Self::SessionExpiryInterval,
            0x12 => Self::AssignedClientIdentifier,
            0x13 => Self::ServerKeepAlive,
            0x15 => Self::AuthenticationMethod,
            0x16 => Self::AuthenticationData,
            0x17 => Self::RequestProblemInformation,
            0x18 => Self::WillDelayInterval,
            0x19 => Self::RequestResponseInformation,
            0x1A => Self::ResponseInformation,
            0x1C => Self::ServerReference,
            0x1F => Self::ReasonString,
            0x21 => Self::ReceiveMaximum,
            0x22 => Self::TopicAliasMaximum,
            0x23 => Self::TopicAlias,
            0x24 => Self::MaximumQoS,
            0x25 => Self::RetainAvailable,
            0x26 => Self::UserProperty,
            0x27 => Self::MaximumPacketSize,
            0x28 => Self::WildcardSubscriptionAvailable,
            0x29 => Self::SubscriptionIdentifierAvailable,
            0x2A => Self::SharedSubscriptionAvailable,
            _ => return None,
        };
        Some(id)
    }

    /// Checks if this property can appear multiple times in a packet
    #[must_use]
    pub fn allows_multiple(self) -> bool {
        matches!(self, Self::UserProperty | Self::SubscriptionIdentifier)
    }

    #[must_use]
    pub fn value_type(self) -> PropertyValueType {
        match self {
            Self::PayloadFormatIndicator
            | Self::RequestProblemInformation
            | Self::RequestResponseInformation
            | Self::MaximumQoS
            | Self::RetainAvailable
            | Self::WildcardSubscriptionAvailable
            | Self::SubscriptionIdentifierAvailable
            | Self::SharedSubscriptionAvailable => PropertyValueType::Byte,

            Self::ServerKeepAlive
            | Self::ReceiveMaximum
            | Self::TopicAliasMaximum
            | Self::TopicAlias => PropertyValueType::TwoByteInteger,

            Self::MessageExpiryInterval
            | Self::SessionExpiryInterval
            | Self::WillDelayInterval
            | Self::MaximumPacketSize => PropertyValueType::FourByteInteger,

            Self::SubscriptionIdentifier => PropertyValueType::VariableByteInteger,

            Self::ContentType
            | Self::ResponseTopic
            | Self::AssignedClientIdentifier
            | Self::AuthenticationMethod
            | Self::ResponseInformation
            | Self::ServerReference
            | Self::ReasonString => PropertyValueType::Utf8String,

            Self::CorrelationData | Self::AuthenticationData => PropertyValueType::BinaryData,

            Self::UserProperty => PropertyValueType::Utf8StringPair,
        }
    }
}

/// Property sets each packet kind may carry
pub mod allowed {
    use super::PropertyId::{self, *};

    pub const CONNECT: &[PropertyId] = &[
        SessionExpiryInterval,
        AuthenticationMethod,
        AuthenticationData,
        RequestProblemInformation,
        RequestResponseInformation,
        ReceiveMaximum,
        TopicAliasMaximum,
        UserProperty,
        MaximumPacketSize,
    ];

    pub const WILL: &[PropertyId] = &[
        PayloadFormatIndicator,
        MessageExpiryInterval,
        ContentType,
        ResponseTopic,
        CorrelationData,
        WillDelayInterval,
        UserProperty,
    ];

    pub const CONNACK: &[PropertyId] = &[
        SessionExpiryInterval,
        AssignedClientIdentifier,
        ServerKeepAlive,
        AuthenticationMethod,
        AuthenticationData,
        ResponseInformation,
        ServerReference,
        ReasonString,
        ReceiveMaximum,
        TopicAliasMaximum,
        MaximumQoS,
        RetainAvailable,
        UserProperty,
        MaximumPacketSize,
        WildcardSubscriptionAvailable,
        SubscriptionIdentifierAvailable,
        SharedSubscriptionAvailable,
    ];

    pub const PUBLISH: &[PropertyId] = &[
        PayloadFormatIndicator,
        MessageExpiryInterval,
        ContentType,
        ResponseTopic,
        CorrelationData,
        SubscriptionIdentifier,
        TopicAlias,
        UserProperty,
    ];

    /// PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK, UNSUBACK
    pub const ACK: &[PropertyId] = &[ReasonString, UserProperty];

    pub const SUBSCRIBE: &[PropertyId] = &[SubscriptionIdentifier, UserProperty];

    pub const UNSUBSCRIBE: &[PropertyId] = &[UserProperty];

    pub const DISCONNECT: &[PropertyId] = &[
        SessionExpiryInterval,
        ServerReference,
        ReasonString,
        UserProperty,
    ];

    pub const AUTH: &[PropertyId] = &[
        AuthenticationMethod,
        AuthenticationData,
        ReasonString,
        UserProperty,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyValueType {
    Byte,
    TwoByteInteger,
    FourByteInteger,
    VariableByteInteger,
    BinaryData,
    Utf8String,
    Utf8StringPair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Byte(u8),
    TwoByteInteger(u16),
    FourByteInteger(u32),
    VariableByteInteger(u32),
    BinaryData(Bytes),
    Utf8String(String),
    Utf8StringPair(String, String),
}

impl PropertyValue {
    #[must_use]
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            Self::Byte(_) => PropertyValueType::Byte,
            Self::TwoByteInteger(_) => PropertyValueType::TwoByteInteger,
            Self::FourByteInteger(_) => PropertyValueType::FourByteInteger,
            Self::VariableByteInteger(_) => PropertyValueType::VariableByteInteger,
            Self::BinaryData(_) => PropertyValueType::BinaryData,
            Self::Utf8String(_) => PropertyValueType::Utf8String,
            Self::Utf8StringPair(_, _) => PropertyValueType::Utf8StringPair,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Byte(_) => 1,
            Self::TwoByteInteger(_) => 2,
            Self::FourByteInteger(_) => 4,
            Self::VariableByteInteger(v) => variable_int_len(*v),
            Self::BinaryData(v) => binary_len(v),
            Self::Utf8String(v) => string_len(v),
            Self::Utf8StringPair(k, v) => string_len(k) + string_len(v),
        }
    }

    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Self::Byte(v) => buf.put_u8(*v),
            Self::TwoByteInteger(v) => buf.put_u16(*v),
            Self::FourByteInteger(v) => buf.put_u32(*v),
            Self::VariableByteInteger(v) => encode_variable_int(buf, *v)?,
            Self::BinaryData(v) => encode_binary(buf, v)?,
            Self::Utf8String(v) => encode_string(buf, v)?,
            Self::Utf8StringPair(k, v) => {
                encode_string(buf, k)?;
                encode_string(buf, v)?;
            }
        }
        Ok(())
    }

    fn decode<B: Buf>(value_type: PropertyValueType, buf: &mut B) -> Result<Self> {
        let fixed_width = match value_type {
            PropertyValueType::Byte => 1,
            PropertyValueType::TwoByteInteger => 2,
            PropertyValueType::FourByteInteger => 4,
            _ => 0,
        };
        if buf.remaining() < fixed_width {
            return Err(MqttError::MalformedPacket(format!(
                "Insufficient data for {value_type:?} property"
            )));
        }
        Ok(match value_type {
            PropertyValueType::Byte => Self::Byte(buf.get_u8()),
            PropertyValueType::TwoByteInteger => Self::TwoByteInteger(buf.get_u16()),
            PropertyValueType::FourByteInteger => Self::FourByteInteger(buf.get_u32()),
            PropertyValueType::VariableByteInteger => {
                Self::VariableByteInteger(decode_variable_int(buf)?)
            }
            PropertyValueType::BinaryData => Self::BinaryData(decode_binary(buf)?),
            PropertyValueType::Utf8String => Self::Utf8String(decode_string(buf)?),
            PropertyValueType::Utf8StringPair => {
                let (k, v) = decode_string_pair(buf)?;
                Self::Utf8StringPair(k, v)
            }
        })
    }
}

/// Container for MQTT v5.0 properties
///
/// Encoding order is by identifier, so two containers holding the same
/// values always produce the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    properties: HashMap<PropertyId, Vec<PropertyValue>>,
}

impl Properties {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property value
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a type mismatch and `DuplicatePropertyId`
    /// when a single-valued property is already present
    pub fn add(&mut self, id: PropertyId, value: PropertyValue) -> Result<()> {
        if value.value_type() != id.value_type() {
            return Err(MqttError::InvalidArgument(format!(
                "Property {id:?} expects type {:?}, got {:?}",
                id.value_type(),
                value.value_type()
            )));
        }
        if !id.allows_multiple() && self.properties.contains_key(&id) {
            return Err(MqttError::DuplicatePropertyId(id as u8));
        }
        self.properties.entry(id).or_default().push(value);
        Ok(())
    }

    /// Replaces every value of a property with `value`
    fn set(&mut self, id: PropertyId, value: PropertyValue) {
        debug_assert_eq!(value.value_type(), id.value_type());
        self.properties.insert(id, vec![value]);
    }

    #[must_use]
    pub fn get(&self, id: PropertyId) -> Option<&PropertyValue> {
        self.properties.get(&id).and_then(|v| v.first())
    }

    #[must_use]
    pub fn get_all(&self, id: PropertyId) -> &[PropertyValue] {
        self.properties.get(&id).map_or(&[][..], Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, id: PropertyId) -> bool {
        self.properties.contains_key(&id)
    }

    pub fn remove(&mut self, id: PropertyId) {
        self.properties.remove(&id);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PropertyId, &PropertyValue)> + '_ {
        self.properties
            .iter()
            .flat_map(|(id, values)| values.iter().map(move |value| (*id, value)))
    }

    /// Fails when a property outside `allowed` is present
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` naming the offending property
    pub fn validate_for(&self, allowed: &[PropertyId], packet: &str) -> Result<()> {
        match self.properties.keys().find(|id| !allowed.contains(id)) {
            Some(id) => Err(MqttError::MalformedPacket(format!(
                "Property {id:?} is not allowed in {packet}"
            ))),
            None => Ok(()),
        }
    }

    /// Encodes the property length followed by all properties
    ///
    /// # Errors
    ///
    /// Returns an error if a value fails to encode
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let body_len = self.body_len();
        encode_variable_int(
            buf,
            u32::try_from(body_len).map_err(|_| MqttError::PacketTooLarge {
                size: body_len,
                max: crate::encoding::VARIABLE_INT_MAX as usize,
            })?,
        )?;

        let mut sorted: Vec<_> = self.properties.iter().collect();
        sorted.sort_by_key(|(id, _)| **id);
        for (id, values) in sorted {
            for value in values {
                encode_variable_int(buf, u32::from(*id as u8))?;
                value.encode(buf)?;
            }
        }
        Ok(())
    }

    /// Decodes a length-prefixed property list
    ///
    /// Unknown identifiers, repeated single-valued identifiers and truncated
    /// values are all malformed.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPacket` as described above
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let props_len = decode_variable_int(buf)? as usize;
        if buf.remaining() < props_len {
            return Err(MqttError::MalformedPacket(format!(
                "Insufficient data for properties: expected {props_len}, got {}",
                buf.remaining()
            )));
        }

        let mut props_buf = buf.copy_to_bytes(props_len);
        let mut properties = Self::new();

        while props_buf.has_remaining() {
            let raw_id = decode_variable_int(&mut props_buf)?;
            let id = u8::try_from(raw_id)
                .ok()
                .and_then(PropertyId::from_u8)
                .ok_or_else(|| {
                    MqttError::MalformedPacket(format!("Unknown property identifier 0x{raw_id:02X}"))
                })?;
            let value = PropertyValue::decode(id.value_type(), &mut props_buf)?;
            properties.add(id, value).map_err(|_| {
                MqttError::MalformedPacket(format!("Property {id:?} included more than once"))
            })?;
        }

        Ok(properties)
    }

    /// Encoded length including the length prefix
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let body_len = self.body_len();
        variable_int_len(u32::try_from(body_len).unwrap_or(u32::MAX)) + body_len
    }

    fn body_len(&self) -> usize {
        self.iter()
            .map(|(id, value)| variable_int_len(u32::from(id as u8)) + value.encoded_len())
            .sum()
    }

    fn get_u32(&self, id: PropertyId) -> Option<u32> {
        match self.get(id) {
            Some(PropertyValue::FourByteInteger(v) | PropertyValue::VariableByteInteger(v)) => {
                Some(*v)
            }
            _ => None,
        }
    }

    fn get_u16(&self, id: PropertyId) -> Option<u16> {
        match self.get(id) {
            Some(PropertyValue::TwoByteInteger(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_str(&self, id: PropertyId) -> Option<&str> {
        match self.get(id) {
            Some(PropertyValue::Utf8String(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn session_expiry_interval(&self) -> Option<u32> {
        self.get_u32(PropertyId::SessionExpiryInterval)
    }

    pub fn set_session_expiry_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::SessionExpiryInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    #[must_use]
    pub fn receive_maximum(&self) -> Option<u16> {
        self.get_u16(PropertyId::ReceiveMaximum)
    }

    pub fn set_receive_maximum(&mut self, value: u16) {
        self.set(PropertyId::ReceiveMaximum, PropertyValue::TwoByteInteger(value));
    }

    #[must_use]
    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.get_u32(PropertyId::MaximumPacketSize)
    }

    pub fn set_maximum_packet_size(&mut self, value: u32) {
        self.set(
            PropertyId::MaximumPacketSize,
            PropertyValue::FourByteInteger(value),
        );
    }

    #[must_use]
    pub fn assigned_client_identifier(&self) -> Option<&str> {
        self.get_str(PropertyId::AssignedClientIdentifier)
    }

    pub fn set_assigned_client_identifier(&mut self, id: String) {
        self.set(
            PropertyId::AssignedClientIdentifier,
            PropertyValue::Utf8String(id),
        );
    }

    #[must_use]
    pub fn server_keep_alive(&self) -> Option<u16> {
        self.get_u16(PropertyId::ServerKeepAlive)
    }

    pub fn set_server_keep_alive(&mut self, seconds: u16) {
        self.set(
            PropertyId::ServerKeepAlive,
            PropertyValue::TwoByteInteger(seconds),
        );
    }

    #[must_use]
    pub fn will_delay_interval(&self) -> Option<u32> {
        self.get_u32(PropertyId::WillDelayInterval)
    }

    pub fn set_will_delay_interval(&mut self, seconds: u32) {
        self.set(
            PropertyId::WillDelayInterval,
            PropertyValue::FourByteInteger(seconds),
        );
    }

    #[must_use]
    pub fn reason_string(&self) -> Option<&str> {
        self.get_str(PropertyId::ReasonString)
    }

    pub fn set_reason_string(&mut self, reason: String) {
        self.set(PropertyId::ReasonString, PropertyValue::Utf8String(reason));
    }

    #[must_use]
    pub fn authentication_method(&self) -> Option<&str> {
        self.get_str(PropertyId::AuthenticationMethod)
    }

    pub fn set_authentication_method(&mut self, method: String) {
        self.set(
            PropertyId::AuthenticationMethod,
            PropertyValue::Utf8String(method),
        );
    }

    /// Adds a user property (can be called multiple times)
    pub fn add_user_property(&mut self, key: String, value: String) {
        self.properties
            .entry(PropertyId::UserProperty)
            .or_default()
            .push(PropertyValue::Utf8StringPair(key, value));
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.get_all(PropertyId::UserProperty)
            .iter()
            .filter_map(|value| match value {
                PropertyValue::Utf8StringPair(k, v) => Some((k.as_str(), v.as_str())),
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_encode_is_sorted_by_identifier() {
        let mut props = Properties::new();
        props.set_receive_maximum(10);
        props.set_session_expiry_interval(60);

        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[0x08, 0x11, 0x00, 0x00, 0x00, 0x3C, 0x21, 0x00, 0x0A]
        );
        assert_eq!(buf.len(), props.encoded_len());
    }

    #[test]
    fn test_decode_round_trip_with_user_properties() {
        let mut props = Properties::new();
        props.set_reason_string("quota".to_string());
        props.add_user_property("a".to_string(), "1".to_string());
        props.add_user_property("a".to_string(), "2".to_string());

        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        let decoded = Properties::decode(&mut buf).unwrap();

        assert_eq!(decoded.reason_string(), Some("quota"));
        let users: Vec<_> = decoded.user_properties().collect();
        assert_eq!(users, vec![("a", "1"), ("a", "2")]);
    }

    #[test]
    fn test_unknown_identifier_is_malformed() {
        let mut buf = BytesMut::from(&[0x02u8, 0x7F, 0x00][..]);
        assert!(matches!(
            Properties::decode(&mut buf),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_repeated_single_valued_identifier_is_malformed() {
        let mut buf = BytesMut::from(&[0x06u8, 0x21, 0x00, 0x01, 0x21, 0x00, 0x02][..]);
        assert!(matches!(
            Properties::decode(&mut buf),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_truncated_value_is_malformed() {
        let mut buf = BytesMut::from(&[0x02u8, 0x11, 0x00][..]);
        assert!(Properties::decode(&mut buf).is_err());
    }

    #[test]
    fn test_add_type_mismatch_and_duplicate() {
        let mut props = Properties::new();
        assert!(props
            .add(PropertyId::ReceiveMaximum, PropertyValue::Byte(1))
            .is_err());
        props
            .add(PropertyId::ReceiveMaximum, PropertyValue::TwoByteInteger(1))
            .unwrap();
        assert_eq!(
            props.add(PropertyId::ReceiveMaximum, PropertyValue::TwoByteInteger(2)),
            Err(MqttError::DuplicatePropertyId(0x21))
        );
    }

    #[test]
    fn test_validate_for_packet() {
        let mut props = Properties::new();
        props.set_assigned_client_identifier("x".to_string());
        assert!(props.validate_for(allowed::CONNACK, "CONNACK").is_ok());
        assert!(props.validate_for(allowed::CONNECT, "CONNECT").is_err());
    }

    #[test]
    fn test_setters_replace() {
        let mut props = Properties::new();
        props.set_server_keep_alive(5);
        props.set_server_keep_alive(7);
        assert_eq!(props.server_keep_alive(), Some(7));
        assert_eq!(props.get_all(PropertyId::ServerKeepAlive).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_numeric_properties_survive_decode(
            expiry in any::<u32>(),
            receive_max in 1u16..,
            packet_size in 1u32..,
        ) {
            let mut props = Properties::new();
            props.set_session_expiry_interval(expiry);
            props.set_receive_maximum(receive_max);
            props.set_maximum_packet_size(packet_size);

            let mut buf = BytesMut::new();
            props.encode(&mut buf).unwrap();
            let decoded = Properties::decode(&mut buf).unwrap();
            prop_assert_eq!(decoded, props);
        }
    }
}
