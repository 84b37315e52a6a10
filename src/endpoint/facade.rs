//! Application handle for one connection

use crate::endpoint::config::EndpointConfig;
use crate::endpoint::events::EndpointEvents;
use crate::endpoint::handler::{next_connection_id, ClientHandler, Command, Decision, Identity};
use crate::endpoint::state::{ConnectionState, SharedState};
use crate::error::{MqttError, Result};
use crate::packet::publish::PublishPacket;
use crate::packet::suback::SubAckReasonCode;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::protocol::ProtocolVersion;
use crate::session::SessionRegistry;
use crate::QoS;
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

/// Completion of a server-initiated PUBLISH
///
/// QoS 0 completes as soon as the packet is written. QoS 1 completes on
/// PUBACK, QoS 2 on PUBCOMP or on a v5 PUBREC carrying an error code.
#[derive(Debug)]
pub struct Delivery {
    /// Identifier assigned to a QoS 1 or 2 message
    pub packet_id: Option<u16>,
    pub(crate) completion: oneshot::Receiver<Result<ReasonCode>>,
}

impl Delivery {
    /// Waits for the exchange to finish and returns the client's reason code
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` if the connection ends first. A persistent session
    /// keeps the message and retransmits it on resume.
    pub async fn wait(self) -> Result<ReasonCode> {
        self.completion.await?
    }
}

/// Cloneable handle to a running connection
///
/// Every method is a request to the connection task. Requests that write
/// to the client only succeed while the connection is `Established`.
#[derive(Debug, Clone)]
pub struct Endpoint {
    connection_id: u64,
    state: SharedState,
    identity: Arc<OnceLock<Identity>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Endpoint {
    /// Builds the handle, the event stream and the connection task without
    /// starting it
    ///
    /// # Errors
    ///
    /// `Configuration` if `config` does not validate
    pub fn build<S>(
        stream: S,
        config: EndpointConfig,
        registry: SessionRegistry,
    ) -> Result<(Self, EndpointEvents, ClientHandler<S>)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let connection_id = next_connection_id();
        let state = SharedState::new();
        let identity = Arc::new(OnceLock::new());
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handler = ClientHandler::new(
            connection_id,
            stream,
            config,
            registry,
            state.clone(),
            Arc::clone(&identity),
            events_tx,
            commands_rx,
        );
        let endpoint = Self {
            connection_id,
            state,
            identity,
            commands: commands_tx,
        };
        Ok((endpoint, EndpointEvents::new(events_rx), handler))
    }

    /// Starts serving `stream` on a new task
    ///
    /// # Errors
    ///
    /// `Configuration` if `config` does not validate
    pub fn spawn<S>(
        stream: S,
        config: EndpointConfig,
        registry: SessionRegistry,
    ) -> Result<(Self, EndpointEvents)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (endpoint, events, handler) = Self::build(stream, config, registry)?;
        debug!(connection_id = endpoint.connection_id, "Spawning connection task");
        tokio::spawn(handler.run());
        Ok((endpoint, events))
    }

    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Client identifier, once CONNECT has been validated
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.identity.get().map(|identity| identity.client_id.clone())
    }

    #[must_use]
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.identity.get().map(|identity| identity.protocol_version)
    }

    /// Accepts the pending CONNECT
    ///
    /// `session_present` asks to resume the stored session; it is honoured
    /// only if one exists and the client did not request a clean start.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` unless a CONNECT is waiting for a decision,
    /// which also rejects a second `accept` or `reject`
    pub fn accept(&self, session_present: bool) -> Result<()> {
        self.decide("accept", ConnectionState::Accepted, Decision::Accept { session_present })
    }

    /// Refuses the pending CONNECT with `reason_code`
    ///
    /// 3.x clients receive the matching CONNACK return code.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a success code, `InvalidStateTransition` unless
    /// a CONNECT is waiting for a decision
    pub fn reject(&self, reason_code: ReasonCode) -> Result<()> {
        if !reason_code.is_error() {
            return Err(MqttError::InvalidArgument(format!(
                "{reason_code:?} cannot refuse a connection"
            )));
        }
        self.decide("reject", ConnectionState::Rejected, Decision::Reject(reason_code))
    }

    fn decide(&self, operation: &'static str, to: ConnectionState, decision: Decision) -> Result<()> {
        self.state
            .transition(ConnectionState::Validating, to)
            .map_err(|state| MqttError::InvalidStateTransition { operation, state })?;
        self.commands.send(Command::Decide(decision))?;
        Ok(())
    }

    /// Sends an application message to the client
    ///
    /// # Errors
    ///
    /// `InvalidTopicName`, `PacketIdExhausted`, `PacketTooLarge` when the
    /// client's maximum packet size would be exceeded, and
    /// `InvalidStateTransition` or `ConnectionClosed` outside `Established`
    #[instrument(skip(self, payload), fields(connection_id = self.connection_id), level = "debug")]
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        duplicate: bool,
    ) -> Result<Delivery> {
        let publish = PublishPacket::new(topic, payload, qos)
            .with_retain(retain)
            .with_dup(duplicate);
        self.publish_packet(publish).await
    }

    /// Sends a prepared PUBLISH; any packet identifier it carries is
    /// replaced by one from the session
    ///
    /// # Errors
    ///
    /// Same as [`Endpoint::publish`]
    pub async fn publish_packet(&self, mut publish: PublishPacket) -> Result<Delivery> {
        self.ensure_established("publish")?;
        publish.packet_id = None;
        self.request(|reply| Command::Publish { publish, reply }).await
    }

    /// Answers a pending SUBSCRIBE, one reason code per topic filter
    ///
    /// Granted QoS levels above the requested ones are lowered to the
    /// request.
    ///
    /// # Errors
    ///
    /// `PacketIdNotFound` for an unknown request, `InvalidArgument` when the
    /// number of codes does not match the number of filters
    pub async fn subscribe_acknowledge(
        &self,
        packet_id: u16,
        granted: Vec<SubAckReasonCode>,
    ) -> Result<()> {
        self.ensure_established("subscribe_acknowledge")?;
        self.request(|reply| Command::SubscribeAck {
            packet_id,
            granted,
            reply,
        })
        .await
    }

    /// Answers a pending UNSUBSCRIBE
    ///
    /// # Errors
    ///
    /// `PacketIdNotFound` for an unknown request
    pub async fn unsubscribe_acknowledge(&self, packet_id: u16) -> Result<()> {
        self.ensure_established("unsubscribe_acknowledge")?;
        self.request(|reply| Command::UnsubscribeAck { packet_id, reply })
            .await
    }

    /// Sends PUBREL for a server-initiated QoS 2 message the client has
    /// acknowledged with PUBREC
    ///
    /// # Errors
    ///
    /// `PacketIdNotFound` for an unknown identifier, `InvalidArgument` when
    /// the exchange is not waiting for a release
    pub async fn publish_release(&self, packet_id: u16) -> Result<()> {
        self.ensure_established("publish_release")?;
        self.request(|reply| Command::PublishRelease { packet_id, reply })
            .await
    }

    /// Closes the connection from the server side
    ///
    /// v5 clients receive DISCONNECT with `reason_code`; 3.x connections
    /// are simply closed. The will is dispatched.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` or `ConnectionClosed` outside `Established`
    pub async fn disconnect(&self, reason_code: ReasonCode) -> Result<()> {
        self.ensure_established("disconnect")?;
        self.request(|reply| Command::Disconnect { reason_code, reply })
            .await
    }

    fn ensure_established(&self, operation: &'static str) -> Result<()> {
        match self.state.get() {
            ConnectionState::Established => Ok(()),
            state if state.is_closing() => Err(MqttError::ConnectionClosed),
            state => Err(MqttError::InvalidStateTransition { operation, state }),
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply))?;
        response.await?
    }
}
