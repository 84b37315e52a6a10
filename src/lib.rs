//! # MQTT broker-side protocol engine
//!
//! Terminates an MQTT 3.1, 3.1.1 or 5.0 client byte stream: decodes packets,
//! drives the CONNECT handshake, keeps per-client sessions and runs the QoS
//! 0/1/2 acknowledgement flows in both directions.
//!
//! Each connection is served by one task that owns the transport, so packets
//! are processed strictly in arrival order. The application talks to that
//! task through an [`Endpoint`] handle and observes it through an ordered
//! stream of [`EndpointEvent`]s, or hands everything to a [`Router`]
//! implementation via [`serve`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqtt_endpoint::{Endpoint, EndpointConfig, EndpointEvent, SessionRegistry};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:1883").await?;
//!     let registry = SessionRegistry::new();
//!
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let (endpoint, mut events) =
//!             Endpoint::spawn(stream, EndpointConfig::default(), registry.clone())?;
//!
//!         tokio::spawn(async move {
//!             while let Some(event) = events.recv().await {
//!                 match event {
//!                     EndpointEvent::Connect(_) => endpoint.accept(false)?,
//!                     EndpointEvent::Subscribe(request) => {
//!                         let granted = request.requested_grants();
//!                         endpoint.subscribe_acknowledge(request.packet_id, granted).await?;
//!                     }
//!                     EndpointEvent::Closed(_) => break,
//!                     _ => {}
//!                 }
//!             }
//!             Ok::<_, mqtt_endpoint::MqttError>(())
//!         });
//!     }
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod constants;
pub mod encoding;
pub mod endpoint;
pub mod error;
pub mod flags;
pub mod packet;
pub mod packet_id;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;
pub mod validation;

pub use endpoint::config::EndpointConfig;
pub use endpoint::events::{
    CloseReason, ConnectInfo, EndpointEvent, EndpointEvents, PublishAck, SubscribeRequest,
    UnsubscribeRequest,
};
pub use endpoint::facade::{Delivery, Endpoint};
pub use endpoint::handler::ClientHandler;
pub use endpoint::router::{serve, AcceptAllRouter, AuthDecision, Router};
pub use endpoint::state::ConnectionState;
pub use error::{MqttError, Result};
pub use packet::publish::PublishPacket;
pub use packet::suback::SubAckReasonCode;
pub use packet::subscribe::{RetainHandling, SubscriptionOptions};
pub use packet::{decode_packet, encode_packet, FixedHeader, Packet, PacketType};
pub use protocol::v5::properties::{Properties, PropertyId, PropertyValue, PropertyValueType};
pub use protocol::v5::reason_codes::ReasonCode;
pub use protocol::ProtocolVersion;
pub use session::{Session, SessionRegistry};
pub use types::{Message, MessageProperties, WillMessage};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}
