//! v5 reason codes and their 3.x return code equivalents

use serde::{Deserialize, Serialize};

/// Reason codes carried by v5 acknowledgements and DISCONNECT
///
/// 3.x connections only know the CONNACK return codes 0-5 and the SUBACK
/// failure code 0x80; see [`ReasonCode::to_v3_connect_return_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    // Success codes (0x00 - 0x7F)
    Success = 0x00, // Also used for NormalDisconnection and GrantedQoS0
    GrantedQoS1 = 0x01,
    GrantedQoS2 = 0x02,
    DisconnectWithWillMessage = 0x04,
    NoMatchingSubscribers = 0x10,
    NoSubscriptionExisted = 0x11,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,

    // Error codes (0x80 - 0xFF)
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    UnsupportedProtocolVersion = 0x84,
    ClientIdentifierNotValid = 0x85,
    BadUsernameOrPassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    Banned = 0x8A,
    ServerShuttingDown = 0x8B,
    BadAuthenticationMethod = 0x8C,
    KeepAliveTimeout = 0x8D,
    SessionTakenOver = 0x8E,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    PacketIdentifierInUse = 0x91,
    PacketIdentifierNotFound = 0x92,
    ReceiveMaximumExceeded = 0x93,
    TopicAliasInvalid = 0x94,
    PacketTooLarge = 0x95,
    MessageRateTooHigh = 0x96,
    QuotaExceeded = 0x97,
    AdministrativeAction = 0x98,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    SharedSubscriptionsNotSupported = 0x9E,
    ConnectionRateExceeded = 0x9F,
    MaximumConnectTime = 0xA0,
    SubscriptionIdentifiersNotSupported = 0xA1,
    WildcardSubscriptionsNotSupported = 0xA2,
}

// Aliases for ReasonCode::Success (0x00) used in different contexts
pub const NORMAL_DISCONNECTION: ReasonCode = ReasonCode::Success;
pub const GRANTED_QOS_0: ReasonCode = ReasonCode::Success;

/// 3.x CONNACK return codes
pub mod v3_return_code {
    pub const ACCEPTED: u8 = 0x00;
    pub const UNACCEPTABLE_PROTOCOL_VERSION: u8 = 0x01;
    pub const IDENTIFIER_REJECTED: u8 = 0x02;
    pub const SERVER_UNAVAILABLE: u8 = 0x03;
    pub const BAD_USERNAME_OR_PASSWORD: u8 = 0x04;
    pub const NOT_AUTHORIZED: u8 = 0x05;
}

impl From<ReasonCode> for u8 {
    fn from(code: ReasonCode) -> Self {
        code as u8
    }
}

impl ReasonCode {
    #[must_use]
    pub fn is_success(&self) -> bool {
        u8::from(*self) < 0x80
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        u8::from(*self) >= 0x80
    }

    /// Maps a reason code onto the closest 3.x CONNACK return code
    #[must_use]
    pub fn to_v3_connect_return_code(self) -> u8 {
        match self {
            Self::Success => v3_return_code::ACCEPTED,
            Self::UnsupportedProtocolVersion => v3_return_code::UNACCEPTABLE_PROTOCOL_VERSION,
            Self::ClientIdentifierNotValid => v3_return_code::IDENTIFIER_REJECTED,
            Self::ServerUnavailable | Self::ServerBusy => v3_return_code::SERVER_UNAVAILABLE,
            Self::BadUsernameOrPassword => v3_return_code::BAD_USERNAME_OR_PASSWORD,
            _ => v3_return_code::NOT_AUTHORIZED,
        }
    }

    /// Inverse of [`ReasonCode::to_v3_connect_return_code`]
    #[must_use]
    pub fn from_v3_connect_return_code(code: u8) -> Option<Self> {
        match code {
            v3_return_code::ACCEPTED => Some(Self::Success),
            v3_return_code::UNACCEPTABLE_PROTOCOL_VERSION => Some(Self::UnsupportedProtocolVersion),
            v3_return_code::IDENTIFIER_REJECTED => Some(Self::ClientIdentifierNotValid),
            v3_return_code::SERVER_UNAVAILABLE => Some(Self::ServerUnavailable),
            v3_return_code::BAD_USERNAME_OR_PASSWORD => Some(Self::BadUsernameOrPassword),
            v3_return_code::NOT_AUTHORIZED => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    /// Codes a v5 CONNACK may carry
    #[must_use]
    pub fn is_valid_for_connack(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::UnspecifiedError
                | Self::MalformedPacket
                | Self::ProtocolError
                | Self::ImplementationSpecificError
                | Self::UnsupportedProtocolVersion
                | Self::ClientIdentifierNotValid
                | Self::BadUsernameOrPassword
                | Self::NotAuthorized
                | Self::ServerUnavailable
                | Self::ServerBusy
                | Self::Banned
                | Self::BadAuthenticationMethod
                | Self::TopicNameInvalid
                | Self::PacketTooLarge
                | Self::QuotaExceeded
                | Self::PayloadFormatInvalid
                | Self::RetainNotSupported
                | Self::QoSNotSupported
                | Self::UseAnotherServer
                | Self::ServerMoved
                | Self::ConnectionRateExceeded
        )
    }

    /// Codes a v5 PUBACK or PUBREC may carry
    #[must_use]
    pub fn is_valid_for_publish_ack(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::NoMatchingSubscribers
                | Self::UnspecifiedError
                | Self::ImplementationSpecificError
                | Self::NotAuthorized
                | Self::TopicNameInvalid
                | Self::PacketIdentifierInUse
                | Self::QuotaExceeded
                | Self::PayloadFormatInvalid
        )
    }

    /// Codes a v5 PUBREL or PUBCOMP may carry
    #[must_use]
    pub fn is_valid_for_release(self) -> bool {
        matches!(self, Self::Success | Self::PacketIdentifierNotFound)
    }

    /// Codes a v5 DISCONNECT may carry
    #[must_use]
    pub fn is_valid_for_disconnect(self) -> bool {
        !matches!(
            self,
            Self::GrantedQoS1
                | Self::GrantedQoS2
                | Self::NoMatchingSubscribers
                | Self::NoSubscriptionExisted
                | Self::ContinueAuthentication
                | Self::ReAuthenticate
                | Self::ClientIdentifierNotValid
                | Self::BadUsernameOrPassword
                | Self::ServerUnavailable
                | Self::Banned
                | Self::BadAuthenticationMethod
                | Self::UnsupportedProtocolVersion
                | Self::PacketIdentifierInUse
                | Self::PacketIdentifierNotFound
        )
    }

    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Success),
            0x01 => Some(Self::GrantedQoS1),
            0x02 => Some(Self::GrantedQoS2),
            0x04 => Some(Self::DisconnectWithWillMessage),
            0x10 => Some(Self::NoMatchingSubscribers),
            0x11 => Some(Self::NoSubscriptionExisted),
            0x18 => Some(Self::ContinueAuthentication),
            0x19 => Some(Self::ReAuthenticate),
            0x80 => Some(Self::UnspecifiedError),
            0x81 => Some(Self::MalformedPacket),
            0x82 => Some(Self::ProtocolError),
            0x83 => Some(Self::ImplementationSpecificError),
            0x84 => Some(Self::UnsupportedProtocolVersion),
            0x85 => Some(Self::ClientIdentifierNotValid),
            0x86 => Some(Self::BadUsernameOrPassword),
            0x87 => Some(Self::NotAuthorized),
            0x88 => Some(Self::ServerUnavailable),
            0x89 => Some(Self::ServerBusy),
            0x8A => Some(Self::Banned),
            0x8B => Some(Self::ServerShuttingDown),
            0x8C => Some(Self::BadAuthenticationMethod),
            0x8D => Some(Self::KeepAliveTimeout),
            0x8E => Some(Self::SessionTakenOver),
            0x8F => Some(Self::TopicFilterInvalid),
            0x90 => Some(Self::TopicNameInvalid),
            0x91 => Some(Self::PacketIdentifierInUse),
            0x92 => Some(Self::PacketIdentifierNotFound),
            0x93 => Some(Self::ReceiveMaximumExceeded),
            0x94 => Some(Self::TopicAliasInvalid),
            0x95 => Some(Self::PacketTooLarge),
            0x96 => Some(Self::MessageRateTooHigh),
            0x97 => Some(Self::QuotaExceeded),
            0x98 => Some(Self::AdministrativeAction),
            0x99 => Some(Self::PayloadFormatInvalid),
            0x9A => Some(Self::RetainNotSupported),
            0x9B => Some(Self::QoSNotSupported),
            0x9C => Some(Self::UseAnotherServer),
            0x9D => Some(Self::ServerMoved),
            0x9E => Some(Self::SharedSubscriptionsNotSupported),
            0x9F => Some(Self::ConnectionRateExceeded),
            0xA0 => Some(Self::MaximumConnectTime),
            0xA1 => Some(Self::SubscriptionIdentifiersNotSupported),
            0xA2 => Some(Self::WildcardSubscriptionsNotSupported),
            _ => None,
        }
    }
}
