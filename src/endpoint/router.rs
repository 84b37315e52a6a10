//! Router callbacks and the loop that feeds them
//!
//! [`serve`] is the batteries-included way to run a connection: it spawns
//! the connection task and answers every event through a [`Router`].

use crate::endpoint::config::EndpointConfig;
use crate::endpoint::events::{
    CloseReason, ConnectInfo, EndpointEvent, SubscribeRequest, UnsubscribeRequest,
};
use crate::endpoint::facade::Endpoint;
use crate::error::{MqttError, Result};
use crate::packet::suback::SubAckReasonCode;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::session::SessionRegistry;
use crate::types::{Message, WillMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Outcome of [`Router::authenticate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// Resume the stored session when `session_present` is true and one
    /// is available
    Accept { session_present: bool },
    Reject(ReasonCode),
}

/// Application policy for a connection driven by [`serve`]
#[async_trait]
pub trait Router: Send + Sync {
    async fn authenticate(&self, connect: &ConnectInfo) -> AuthDecision;

    /// One reason code per requested filter
    async fn on_subscribe(&self, client_id: &str, request: &SubscribeRequest)
        -> Vec<SubAckReasonCode>;

    async fn on_unsubscribe(&self, _client_id: &str, _request: &UnsubscribeRequest) {}

    /// Reason code for the PUBACK/PUBREC of a QoS 1 or 2 message; ignored
    /// for QoS 0
    async fn on_publish(&self, client_id: &str, message: &Message) -> ReasonCode;

    async fn on_will(&self, client_id: &str, will: &WillMessage);

    /// CONNACK has been sent; `endpoint` can be kept to publish later
    async fn on_established(&self, _client_id: &str, _endpoint: &Endpoint) {}

    /// The connection resumed a stored session and replayed its in-flight
    /// messages
    async fn on_session_resumed(&self, _client_id: &str, _endpoint: &Endpoint) {}

    /// `client_id` is `None` when the connection ended before CONNECT was
    /// validated
    async fn on_closed(&self, _client_id: Option<&str>, _reason: &CloseReason) {}
}

/// Accepts every client, grants every subscription and drops wills
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllRouter;

#[async_trait]
impl Router for AcceptAllRouter {
    async fn authenticate(&self, connect: &ConnectInfo) -> AuthDecision {
        AuthDecision::Accept {
            session_present: connect.session_available,
        }
    }

    async fn on_subscribe(
        &self,
        _client_id: &str,
        request: &SubscribeRequest,
    ) -> Vec<SubAckReasonCode> {
        request.requested_grants()
    }

    async fn on_publish(&self, _client_id: &str, _message: &Message) -> ReasonCode {
        ReasonCode::Success
    }

    async fn on_will(&self, _client_id: &str, _will: &WillMessage) {}
}

/// Serves `stream` until it closes, answering every event through `router`
///
/// Successful PUBRECs for server-initiated QoS 2 messages are released
/// automatically. Facade errors raised while answering are logged; the
/// connection reports anything fatal through its close reason.
///
/// # Errors
///
/// `Configuration` if `config` does not validate
pub async fn serve<S, R>(
    stream: S,
    config: EndpointConfig,
    registry: SessionRegistry,
    router: Arc<R>,
) -> Result<CloseReason>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    R: Router + ?Sized,
{
    let (endpoint, mut events) = Endpoint::spawn(stream, config, registry)?;
    let connection_id = endpoint.connection_id();
    let mut client_id = String::new();

    while let Some(event) = events.recv().await {
        let outcome = match event {
            EndpointEvent::Connect(info) => {
                client_id.clone_from(&info.client_id);
                match router.authenticate(&info).await {
                    AuthDecision::Accept { session_present } => endpoint.accept(session_present),
                    AuthDecision::Reject(reason_code) => endpoint.reject(reason_code),
                }
            }
            EndpointEvent::Established { session_present } => {
                router.on_established(&client_id, &endpoint).await;
                if session_present {
                    router.on_session_resumed(&client_id, &endpoint).await;
                }
                Ok(())
            }
            EndpointEvent::Subscribe(request) => {
                let granted = router.on_subscribe(&client_id, &request).await;
                endpoint
                    .subscribe_acknowledge(request.packet_id, granted)
                    .await
            }
            EndpointEvent::Unsubscribe(request) => {
                router.on_unsubscribe(&client_id, &request).await;
                endpoint.unsubscribe_acknowledge(request.packet_id).await
            }
            EndpointEvent::Publish { message, ack } => {
                let reason_code = router.on_publish(&client_id, &message).await;
                if let Some(ack) = ack {
                    if reason_code.is_error() {
                        ack.reject(reason_code);
                    } else {
                        ack.accept();
                    }
                }
                Ok(())
            }
            EndpointEvent::PublishReceived {
                packet_id,
                reason_code,
            } if !reason_code.is_error() => endpoint.publish_release(packet_id).await,
            EndpointEvent::Will(will) => {
                router.on_will(&client_id, &will).await;
                Ok(())
            }
            EndpointEvent::Closed(reason) => {
                let client_id = endpoint.client_id();
                router.on_closed(client_id.as_deref(), &reason).await;
                return Ok(reason);
            }
            other => {
                debug!(connection_id, event = ?other, "Event needs no answer");
                Ok(())
            }
        };

        if let Err(err) = outcome {
            warn!(connection_id, client_id = %client_id, error = %err, "Router answer failed");
        }
    }

    // the task always sends Closed before dropping its sender
    Err(MqttError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::subscribe::TopicFilter;
    use crate::protocol::v5::properties::Properties;
    use crate::protocol::ProtocolVersion;
    use crate::QoS;

    #[tokio::test]
    async fn test_accept_all_router() {
        let router = AcceptAllRouter;
        let connect = ConnectInfo {
            client_id: "c1".to_string(),
            assigned_client_id: false,
            protocol_version: ProtocolVersion::V5,
            clean_start: false,
            keep_alive: 30,
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
            session_available: true,
        };
        assert_eq!(
            router.authenticate(&connect).await,
            AuthDecision::Accept {
                session_present: true
            }
        );

        let request = SubscribeRequest {
            packet_id: 4,
            filters: vec![TopicFilter::new("a/#", QoS::AtLeastOnce)],
            subscription_identifier: None,
            properties: Properties::default(),
        };
        assert_eq!(
            router.on_subscribe("c1", &request).await,
            vec![SubAckReasonCode::GrantedQoS1]
        );
    }
}
