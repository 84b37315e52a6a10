//! Events a connection reports to the application
//!
//! Events arrive on one bounded channel in the order the underlying
//! packets were received. [`EndpointEvent::Closed`] is always the last
//! event of a connection.

use crate::error::MqttError;
use crate::packet::auth::AuthPacket;
use crate::packet::disconnect::DisconnectPacket;
use crate::packet::suback::SubAckReasonCode;
use crate::packet::subscribe::TopicFilter;
use crate::protocol::v5::properties::Properties;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::protocol::ProtocolVersion;
use crate::types::{Message, WillMessage};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// CONNECT as presented for the accept/reject decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Identifier the session will be stored under, possibly generated
    pub client_id: String,
    /// True when `client_id` was generated because the client sent none
    pub assigned_client_id: bool,
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    /// Keep alive in effect, after any server override
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<WillMessage>,
    /// CONNECT properties (v5.0 only)
    pub properties: Properties,
    /// A prior session for `client_id` exists and can be resumed with
    /// `accept(true)`
    pub session_available: bool,
}

/// SUBSCRIBE waiting for `subscribe_acknowledge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub packet_id: u16,
    pub filters: Vec<TopicFilter>,
    pub subscription_identifier: Option<u32>,
    pub properties: Properties,
}

impl SubscribeRequest {
    /// Grants every filter the QoS it asked for
    #[must_use]
    pub fn requested_grants(&self) -> Vec<SubAckReasonCode> {
        self.filters
            .iter()
            .map(|filter| SubAckReasonCode::from_qos(filter.options.qos))
            .collect()
    }
}

/// UNSUBSCRIBE waiting for `unsubscribe_acknowledge`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

/// Decision on an inbound QoS 1 or 2 PUBLISH
///
/// The connection reads nothing further until the handle is resolved.
/// Dropping it accepts the message.
#[derive(Debug)]
pub struct PublishAck {
    reply: Option<oneshot::Sender<ReasonCode>>,
}

impl PublishAck {
    pub(crate) fn new() -> (Self, oneshot::Receiver<ReasonCode>) {
        let (tx, rx) = oneshot::channel();
        (Self { reply: Some(tx) }, rx)
    }

    pub fn accept(mut self) {
        self.resolve(ReasonCode::Success);
    }

    /// Answers with `reason_code` on v5 connections
    ///
    /// Codes that cannot appear in PUBACK/PUBREC are sent as
    /// `UnspecifiedError`. 3.x acknowledgements carry no reason code, so
    /// there the message is acknowledged as usual.
    pub fn reject(mut self, reason_code: ReasonCode) {
        let code = if reason_code.is_valid_for_publish_ack() {
            reason_code
        } else {
            ReasonCode::UnspecifiedError
        };
        self.resolve(code);
    }

    fn resolve(&mut self, reason_code: ReasonCode) {
        if let Some(reply) = self.reply.take() {
            // the connection may already be gone
            let _ = reply.send(reason_code);
        }
    }
}

impl Drop for PublishAck {
    fn drop(&mut self) {
        self.resolve(ReasonCode::Success);
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent DISCONNECT with this reason code
    ClientDisconnect(ReasonCode),
    /// Application called `disconnect`
    ServerDisconnect(ReasonCode),
    /// CONNECT refused with this code, by the application or by validation
    Rejected(ReasonCode),
    HandshakeTimeout,
    KeepAliveTimeout,
    /// Another connection claimed the same client identifier
    TakenOver,
    /// Stream ended without DISCONNECT
    TransportClosed,
    /// Protocol, codec or I/O failure
    Error(MqttError),
}

impl CloseReason {
    /// Reason code announced in the server's v5 DISCONNECT, if one is sent
    #[must_use]
    pub(crate) fn disconnect_code(&self) -> Option<ReasonCode> {
        match self {
            Self::KeepAliveTimeout => Some(ReasonCode::KeepAliveTimeout),
            Self::TakenOver => Some(ReasonCode::SessionTakenOver),
            Self::Error(err) => err.disconnect_reason(),
            _ => None,
        }
    }

    /// Whether an armed will is dispatched
    #[must_use]
    pub fn dispatches_will(&self) -> bool {
        match self {
            Self::ClientDisconnect(code) => *code == ReasonCode::DisconnectWithWillMessage,
            Self::Rejected(_) | Self::HandshakeTimeout => false,
            _ => true,
        }
    }
}

/// Everything a connection reports, in arrival order
#[derive(Debug)]
pub enum EndpointEvent {
    /// Valid CONNECT, waiting for `accept` or `reject`
    Connect(ConnectInfo),
    /// CONNACK written; the connection now processes packets
    Established { session_present: bool },
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    /// Inbound application message; QoS 1 and 2 carry an acknowledgement
    Publish {
        message: Message,
        ack: Option<PublishAck>,
    },
    /// PUBACK for a server-initiated QoS 1 message
    PublishAcknowledge { packet_id: u16, reason_code: ReasonCode },
    /// PUBREC for a server-initiated QoS 2 message; a success code waits
    /// for `publish_release`, an error code ends the exchange
    PublishReceived { packet_id: u16, reason_code: ReasonCode },
    /// PUBREL for an inbound QoS 2 message; PUBCOMP has been written
    PublishRelease(u16),
    /// PUBCOMP for a server-initiated QoS 2 message
    PublishComplete { packet_id: u16, reason_code: ReasonCode },
    Ping,
    /// v5 AUTH packet received on an established connection
    Auth(AuthPacket),
    Disconnect(DisconnectPacket),
    /// Will of a connection that ended abnormally
    Will(WillMessage),
    Closed(CloseReason),
}

/// Receiving side of a connection's event channel
#[derive(Debug)]
pub struct EndpointEvents {
    receiver: mpsc::Receiver<EndpointEvent>,
}

impl EndpointEvents {
    pub(crate) fn new(receiver: mpsc::Receiver<EndpointEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` after `Closed` has been received
    pub async fn recv(&mut self) -> Option<EndpointEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<EndpointEvent> {
        self.receiver.try_recv().ok()
    }

    #[must_use]
    pub fn into_inner(self) -> mpsc::Receiver<EndpointEvent> {
        self.receiver
    }
}
