//! Connection task
//!
//! One `ClientHandler` owns the transport, the session and every piece of
//! per-connection protocol state. It reads packets strictly in order and
//! performs every write, so acknowledgements leave in the order the
//! protocol requires. The [`Endpoint`](super::facade::Endpoint) handle
//! reaches it through a command channel.

use crate::constants::limits;
use crate::endpoint::config::EndpointConfig;
use crate::endpoint::events::{
    CloseReason, ConnectInfo, EndpointEvent, PublishAck, SubscribeRequest, UnsubscribeRequest,
};
use crate::endpoint::facade::Delivery;
use crate::endpoint::state::{ConnectionState, SharedState};
use crate::error::{MqttError, Result};
use crate::packet::connack::ConnAckPacket;
use crate::packet::connect::ConnectPacket;
use crate::packet::disconnect::DisconnectPacket;
use crate::packet::puback::PubAckPacket;
use crate::packet::pubcomp::PubCompPacket;
use crate::packet::pubrec::PubRecPacket;
use crate::packet::pubrel::PubRelPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::suback::{SubAckPacket, SubAckReasonCode};
use crate::packet::subscribe::{SubscribePacket, TopicFilter};
use crate::packet::unsuback::{UnsubAckPacket, UnsubAckReasonCode};
use crate::packet::unsubscribe::UnsubscribePacket;
use crate::packet::Packet;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::protocol::ProtocolVersion;
use crate::session::{InFlightStage, Session, SessionRegistry, Subscription, TakeoverNotice};
use crate::transport::{PacketReader, PacketWriter};
use crate::types::Message;
use crate::validation::{validate_client_id, validate_topic_name};
use crate::QoS;
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Client identifier and revision, fixed once CONNECT has been validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Identity {
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
}

#[derive(Debug)]
pub(crate) enum Decision {
    Accept { session_present: bool },
    Reject(ReasonCode),
}

/// Requests from the facade, each answered on its own oneshot
#[derive(Debug)]
pub(crate) enum Command {
    Decide(Decision),
    Publish {
        publish: PublishPacket,
        reply: oneshot::Sender<Result<Delivery>>,
    },
    SubscribeAck {
        packet_id: u16,
        granted: Vec<SubAckReasonCode>,
        reply: oneshot::Sender<Result<()>>,
    },
    UnsubscribeAck {
        packet_id: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    PublishRelease {
        packet_id: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reason_code: ReasonCode,
        reply: oneshot::Sender<Result<()>>,
    },
}

type Flow<T = ()> = ControlFlow<CloseReason, T>;

/// Hands a command result back and keeps connection-fatal errors for the
/// connection itself
fn respond<T>(reply: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<Flow> {
    let fatal = match &result {
        Err(err) if err.is_fatal() => Some(err.clone()),
        _ => None,
    };
    // the caller may have stopped waiting
    let _ = reply.send(result);
    match fatal {
        Some(err) => Err(err),
        None => Ok(ControlFlow::Continue(())),
    }
}

/// Drives one client connection from the first byte to close
pub struct ClientHandler<S> {
    connection_id: u64,
    config: EndpointConfig,
    reader: PacketReader<ReadHalf<S>>,
    writer: PacketWriter<WriteHalf<S>>,
    version: ProtocolVersion,
    state: SharedState,
    identity: Arc<OnceLock<Identity>>,
    registry: SessionRegistry,
    events: mpsc::Sender<EndpointEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    decision: Option<Decision>,
    takeover_tx: mpsc::UnboundedSender<TakeoverNotice>,
    takeover_rx: mpsc::UnboundedReceiver<TakeoverNotice>,
    takeover_ack: Option<oneshot::Sender<()>>,
    session: Option<Session>,
    owns_session: bool,
    connack_sent: bool,
    keep_alive: Option<Duration>,
    keep_alive_deadline: Option<Instant>,
    /// v5 Maximum Packet Size announced by the client
    peer_max_packet_size: Option<usize>,
    pending_subscribes: HashMap<u16, Vec<TopicFilter>>,
    pending_unsubscribes: HashMap<u16, Vec<String>>,
    deliveries: HashMap<u16, oneshot::Sender<Result<ReasonCode>>>,
}

impl<S> ClientHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connection_id: u64,
        stream: S,
        config: EndpointConfig,
        registry: SessionRegistry,
        state: SharedState,
        identity: Arc<OnceLock<Identity>>,
        events: mpsc::Sender<EndpointEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        // CONNECT names its own revision; this is only the framing default
        let version = ProtocolVersion::V3_1_1;
        let (takeover_tx, takeover_rx) = mpsc::unbounded_channel();
        Self {
            connection_id,
            reader: PacketReader::new(read_half, version, config.max_message_size),
            writer: PacketWriter::new(write_half),
            config,
            version,
            state,
            identity,
            registry,
            events,
            commands,
            commands_open: true,
            decision: None,
            takeover_tx,
            takeover_rx,
            takeover_ack: None,
            session: None,
            owns_session: false,
            connack_sent: false,
            keep_alive: None,
            keep_alive_deadline: None,
            peer_max_packet_size: None,
            pending_subscribes: HashMap::new(),
            pending_unsubscribes: HashMap::new(),
            deliveries: HashMap::new(),
        }
    }

    /// Runs the connection to completion and reports why it ended
    ///
    /// `EndpointEvent::Closed` carrying the same reason is the last event
    /// emitted.
    pub async fn run(mut self) -> CloseReason {
        let reason = match self.serve_connection().await {
            Ok(reason) => reason,
            Err(MqttError::HandshakeTimeout) => CloseReason::HandshakeTimeout,
            Err(MqttError::KeepAliveTimeout) => CloseReason::KeepAliveTimeout,
            Err(MqttError::SessionTakenOver) => CloseReason::TakenOver,
            Err(err) => {
                match &err {
                    MqttError::Io(_) => error!(connection_id = self.connection_id, error = %err, "Transport failure"),
                    _ => warn!(connection_id = self.connection_id, error = %err, "Closing connection"),
                }
                CloseReason::Error(err)
            }
        };
        self.close(reason).await
    }

    async fn serve_connection(&mut self) -> Result<CloseReason> {
        let connect = match self.await_connect().await? {
            ControlFlow::Continue(connect) => connect,
            ControlFlow::Break(reason) => return Ok(reason),
        };
        if let ControlFlow::Break(reason) = self.handshake(*connect).await? {
            return Ok(reason);
        }
        self.process().await
    }

    async fn await_connect(&mut self) -> Result<Flow<Box<ConnectPacket>>> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        tokio::select! {
            () = sleep_until(deadline) => {
                warn!(connection_id = self.connection_id, "No CONNECT before the handshake deadline");
                Err(MqttError::HandshakeTimeout)
            }
            packet = self.reader.read_packet() => match packet {
                Ok(Some(Packet::Connect(connect))) => Ok(ControlFlow::Continue(connect)),
                Ok(Some(other)) => Err(MqttError::ProtocolViolation(format!(
                    "{:?} received before CONNECT",
                    other.packet_type()
                ))),
                Ok(None) => Ok(ControlFlow::Break(CloseReason::TransportClosed)),
                Err(MqttError::UnsupportedProtocolVersion(level)) => {
                    warn!(connection_id = self.connection_id, level, "Unsupported protocol level");
                    Ok(ControlFlow::Break(
                        self.refuse(ReasonCode::UnsupportedProtocolVersion).await,
                    ))
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Writes a negative CONNACK for a CONNECT that failed the version or
    /// identifier checks, before the application has seen it
    async fn refuse(&mut self, reason_code: ReasonCode) -> CloseReason {
        if let Err(state) = self
            .state
            .transition(ConnectionState::AwaitingConnect, ConnectionState::Rejected)
        {
            warn!(connection_id = self.connection_id, ?state, "Refusing CONNECT from unexpected state");
        }
        self.write_refusal(reason_code).await
    }

    async fn write_refusal(&mut self, reason_code: ReasonCode) -> CloseReason {
        let connack = Packet::ConnAck(ConnAckPacket::new(false, reason_code));
        if let Err(err) = self.write(&connack).await {
            debug!(connection_id = self.connection_id, error = %err, "Failed to write refusal");
        }
        CloseReason::Rejected(reason_code)
    }

    async fn handshake(&mut self, connect: ConnectPacket) -> Result<Flow> {
        self.version = connect.protocol_version;
        self.reader.set_version(self.version);

        if !self.config.supports(self.version) {
            warn!(
                connection_id = self.connection_id,
                version = %self.version,
                "Protocol version disabled by configuration"
            );
            return Ok(ControlFlow::Break(
                self.refuse(ReasonCode::UnsupportedProtocolVersion).await,
            ));
        }

        let (client_id, assigned) = if connect.client_id.is_empty() {
            // 3.1 has no server-assigned identifiers
            if !(connect.clean_start
                && self.config.auto_client_id
                && self.version != ProtocolVersion::V3_1)
            {
                warn!(connection_id = self.connection_id, "Empty client identifier refused");
                return Ok(ControlFlow::Break(
                    self.refuse(ReasonCode::ClientIdentifierNotValid).await,
                ));
            }
            (Uuid::new_v4().to_string(), true)
        } else {
            if validate_client_id(
                &connect.client_id,
                self.version,
                self.config.max_client_id_length,
            )
            .is_err()
            {
                warn!(
                    connection_id = self.connection_id,
                    client_id = %connect.client_id,
                    "Client identifier refused"
                );
                return Ok(ControlFlow::Break(
                    self.refuse(ReasonCode::ClientIdentifierNotValid).await,
                ));
            }
            (connect.client_id.clone(), false)
        };

        let keep_alive = match self.config.server_keep_alive {
            Some(server) if self.version.is_v5() => server,
            _ => connect.keep_alive,
        };
        let expiry_interval = if self.version.is_v5() {
            connect.properties.session_expiry_interval().unwrap_or(0)
        } else {
            0
        };
        self.peer_max_packet_size = connect
            .properties
            .maximum_packet_size()
            .and_then(|max| usize::try_from(max).ok());

        let _ = self.identity.set(Identity {
            client_id: client_id.clone(),
            protocol_version: self.version,
        });

        let session_available =
            !connect.clean_start && self.registry.has_session(&client_id).await;
        let fresh = Session::new(client_id.as_str(), self.version, connect.clean_start)
            .with_keep_alive(keep_alive)
            .with_will(connect.will.clone())
            .with_expiry_interval(expiry_interval);

        info!(
            connection_id = self.connection_id,
            client_id = %client_id,
            version = %self.version,
            clean_start = connect.clean_start,
            keep_alive,
            "CONNECT received"
        );

        let info = ConnectInfo {
            client_id,
            assigned_client_id: assigned,
            protocol_version: self.version,
            clean_start: connect.clean_start,
            keep_alive,
            username: connect.username,
            password: connect.password,
            will: connect.will,
            properties: connect.properties,
            session_available,
        };
        // only now can the application decide
        self.state
            .transition(ConnectionState::AwaitingConnect, ConnectionState::Validating)
            .map_err(|state| MqttError::InvalidStateTransition {
                operation: "validate CONNECT",
                state,
            })?;
        if let ControlFlow::Break(reason) = self.emit(EndpointEvent::Connect(info)).await? {
            return Ok(ControlFlow::Break(reason));
        }

        let decision = loop {
            if let Some(decision) = self.decision.take() {
                break decision;
            }
            match self.commands.recv().await {
                Some(command) => {
                    if let ControlFlow::Break(reason) = self.on_command(command).await? {
                        return Ok(ControlFlow::Break(reason));
                    }
                }
                // every handle is gone, nobody can decide any more
                None => return Err(MqttError::ConnectionClosed),
            }
        };

        match decision {
            Decision::Reject(reason_code) => {
                info!(connection_id = self.connection_id, reason = ?reason_code, "CONNECT rejected");
                Ok(ControlFlow::Break(self.write_refusal(reason_code).await))
            }
            Decision::Accept { session_present } => {
                self.establish(fresh, session_present, assigned).await
            }
        }
    }

    async fn establish(&mut self, fresh: Session, resume: bool, assigned: bool) -> Result<Flow> {
        let client_id = fresh.client_id().to_string();
        let keep_alive = fresh.keep_alive();
        let claim = self
            .registry
            .claim(&client_id, self.connection_id, self.takeover_tx.clone())
            .await;
        self.owns_session = true;
        if claim.took_over {
            info!(connection_id = self.connection_id, client_id = %client_id, "Took over existing connection");
        }

        let (session, session_present) = match claim.session {
            Some(stored) if resume && !fresh.clean_start() => (stored.resume_with(fresh), true),
            _ => (fresh, false),
        };
        self.session = Some(session);

        let mut connack = ConnAckPacket::new(session_present, ReasonCode::Success);
        if self.version.is_v5() {
            if assigned {
                connack = connack.with_assigned_client_id(client_id.clone());
            }
            if let Some(server_keep_alive) = self.config.server_keep_alive {
                connack = connack.with_server_keep_alive(server_keep_alive);
            }
            if self.config.receive_maximum < u16::MAX {
                connack = connack.with_receive_maximum(self.config.receive_maximum);
            }
            if self.config.max_message_size < limits::MAX_REMAINING_LENGTH {
                connack.properties.set_maximum_packet_size(
                    u32::try_from(self.config.max_message_size).unwrap_or(u32::MAX),
                );
            }
        }
        self.write(&Packet::ConnAck(connack)).await?;
        self.connack_sent = true;

        self.state
            .transition(ConnectionState::Accepted, ConnectionState::Established)
            .map_err(|state| MqttError::InvalidStateTransition {
                operation: "establish",
                state,
            })?;
        self.keep_alive = self.config.keep_alive_deadline(keep_alive);
        self.reset_keep_alive();
        info!(
            connection_id = self.connection_id,
            client_id = %client_id,
            session_present,
            "Connection established"
        );

        if let ControlFlow::Break(reason) = self
            .emit(EndpointEvent::Established { session_present })
            .await?
        {
            return Ok(ControlFlow::Break(reason));
        }

        if session_present {
            let replay = self.session_mut()?.inflight_mut().replay(Instant::now());
            if !replay.is_empty() {
                debug!(
                    connection_id = self.connection_id,
                    count = replay.len(),
                    "Replaying in-flight messages"
                );
            }
            for packet in &replay {
                self.write(packet).await?;
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn process(&mut self) -> Result<CloseReason> {
        loop {
            let keep_alive_deadline = self.keep_alive_deadline;
            let flow = tokio::select! {
                biased;
                notice = self.takeover_rx.recv() => {
                    self.takeover_ack = notice.map(|notice| notice.ack);
                    return Err(MqttError::SessionTakenOver);
                }
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.on_command(command).await?,
                    None => {
                        self.commands_open = false;
                        ControlFlow::Continue(())
                    }
                },
                () = sleep_until(keep_alive_deadline.unwrap_or_else(Instant::now)), if keep_alive_deadline.is_some() => {
                    warn!(connection_id = self.connection_id, "Keep alive timeout");
                    return Err(MqttError::KeepAliveTimeout);
                }
                packet = self.reader.read_packet() => match packet? {
                    Some(packet) => {
                        self.reset_keep_alive();
                        self.on_packet(packet).await?
                    }
                    None => return Ok(CloseReason::TransportClosed),
                },
            };
            if let ControlFlow::Break(reason) = flow {
                return Ok(reason);
            }
        }
    }

    /// Awaits `wait` while still answering commands and takeover notices
    async fn wait_for<F: Future>(&mut self, wait: F) -> Result<Flow<F::Output>> {
        tokio::pin!(wait);
        loop {
            tokio::select! {
                biased;
                notice = self.takeover_rx.recv() => {
                    self.takeover_ack = notice.map(|notice| notice.ack);
                    return Err(MqttError::SessionTakenOver);
                }
                output = &mut wait => return Ok(ControlFlow::Continue(output)),
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => {
                        if let ControlFlow::Break(reason) = self.on_command(command).await? {
                            return Ok(ControlFlow::Break(reason));
                        }
                    }
                    None => self.commands_open = false,
                },
            }
        }
    }

    async fn emit(&mut self, event: EndpointEvent) -> Result<Flow> {
        let events = self.events.clone();
        let reserved = self.wait_for(events.reserve()).await?;
        let flow = match reserved {
            ControlFlow::Continue(Ok(permit)) => {
                permit.send(event);
                ControlFlow::Continue(())
            }
            ControlFlow::Continue(Err(_)) => {
                debug!(connection_id = self.connection_id, "Event receiver dropped");
                ControlFlow::Continue(())
            }
            ControlFlow::Break(reason) => ControlFlow::Break(reason),
        };
        Ok(flow)
    }

    async fn write(&mut self, packet: &Packet) -> Result<()> {
        if self.state.get().is_closing() {
            return Err(MqttError::ConnectionClosed);
        }
        self.writer.write_packet(packet, self.version).await
    }

    fn reset_keep_alive(&mut self) {
        let now = Instant::now();
        self.keep_alive_deadline = self.keep_alive.map(|timeout| now + timeout);
        if let Some(session) = self.session.as_mut() {
            session.touch(now);
        }
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(MqttError::ConnectionClosed)
    }

    fn ensure_established(&self, operation: &'static str) -> Result<()> {
        match self.state.get() {
            ConnectionState::Established => Ok(()),
            state if state.is_closing() => Err(MqttError::ConnectionClosed),
            state => Err(MqttError::InvalidStateTransition { operation, state }),
        }
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<Flow> {
        debug!(
            connection_id = self.connection_id,
            packet_type = ?packet.packet_type(),
            "Packet received"
        );
        match packet {
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PubAck(puback) => {
                self.session_mut()?.inflight_mut().on_puback(puback.packet_id)?;
                self.finish_delivery(puback.packet_id, puback.reason_code);
                self.emit(EndpointEvent::PublishAcknowledge {
                    packet_id: puback.packet_id,
                    reason_code: puback.reason_code,
                })
                .await
            }
            Packet::PubRec(pubrec) => self.on_pubrec(pubrec).await,
            Packet::PubRel(pubrel) => {
                self.session_mut()?.inflight_mut().on_pubrel(pubrel.packet_id)?;
                self.write(&Packet::PubComp(PubCompPacket::new(pubrel.packet_id)))
                    .await?;
                self.emit(EndpointEvent::PublishRelease(pubrel.packet_id))
                    .await
            }
            Packet::PubComp(pubcomp) => {
                self.session_mut()?.inflight_mut().on_pubcomp(pubcomp.packet_id)?;
                self.finish_delivery(pubcomp.packet_id, pubcomp.reason_code);
                self.emit(EndpointEvent::PublishComplete {
                    packet_id: pubcomp.packet_id,
                    reason_code: pubcomp.reason_code,
                })
                .await
            }
            Packet::Subscribe(subscribe) => self.on_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe).await,
            Packet::PingReq => {
                self.write(&Packet::PingResp).await?;
                self.emit(EndpointEvent::Ping).await
            }
            Packet::Disconnect(disconnect) => self.on_disconnect(disconnect).await,
            Packet::Auth(auth) => self.emit(EndpointEvent::Auth(auth)).await,
            Packet::Connect(_) => Err(MqttError::ProtocolViolation(
                "second CONNECT on an established connection".to_string(),
            )),
            other => Err(MqttError::ProtocolViolation(format!(
                "{:?} is never sent by a client",
                other.packet_type()
            ))),
        }
    }

    async fn on_publish(&mut self, publish: PublishPacket) -> Result<Flow> {
        if publish.topic_alias().is_some() {
            // Topic Alias Maximum is never announced, so it is 0
            return Err(MqttError::ProtocolViolation(
                "topic alias received but none are allowed".to_string(),
            ));
        }
        validate_topic_name(&publish.topic_name)
            .map_err(|err| MqttError::ProtocolViolation(err.to_string()))?;

        let qos = publish.qos;
        let Some(packet_id) = publish.packet_id.filter(|_| qos != QoS::AtMostOnce) else {
            return self
                .emit(EndpointEvent::Publish {
                    message: Message::from(publish),
                    ack: None,
                })
                .await;
        };

        let dup = publish.dup;
        let inflight = self.session_mut()?.inflight_mut();
        if !dup {
            inflight.forget_acknowledged(packet_id);
        } else if let Some(reason_code) = inflight
            .acknowledged(packet_id)
            .filter(|_| qos == QoS::AtLeastOnce)
        {
            debug!(
                connection_id = self.connection_id,
                packet_id, "Retransmitted QoS 1 PUBLISH, repeating PUBACK"
            );
            self.write(&Packet::PubAck(PubAckPacket::new_with_reason(
                packet_id,
                reason_code,
            )))
            .await?;
            return Ok(ControlFlow::Continue(()));
        }

        if qos == QoS::ExactlyOnce && self.session_mut()?.inflight().is_awaiting_pubrel(packet_id) {
            debug!(
                connection_id = self.connection_id,
                packet_id, "Retransmitted QoS 2 PUBLISH, repeating PUBREC"
            );
            self.write(&Packet::PubRec(PubRecPacket::new(packet_id)))
                .await?;
            return Ok(ControlFlow::Continue(()));
        }

        let (ack, decision) = PublishAck::new();
        if let ControlFlow::Break(reason) = self
            .emit(EndpointEvent::Publish {
                message: Message::from(publish),
                ack: Some(ack),
            })
            .await?
        {
            return Ok(ControlFlow::Break(reason));
        }
        let reason_code = match self.wait_for(decision).await? {
            ControlFlow::Continue(decided) => decided.unwrap_or(ReasonCode::Success),
            ControlFlow::Break(reason) => return Ok(ControlFlow::Break(reason)),
        };
        // reading resumes here, so the silence window starts over
        self.reset_keep_alive();

        if qos == QoS::AtLeastOnce {
            self.session_mut()?
                .inflight_mut()
                .record_acknowledged(packet_id, reason_code);
            self.write(&Packet::PubAck(PubAckPacket::new_with_reason(
                packet_id,
                reason_code,
            )))
            .await?;
        } else {
            if !(self.version.is_v5() && reason_code.is_error()) {
                self.session_mut()?
                    .inflight_mut()
                    .record_inbound(packet_id, Instant::now());
            }
            self.write(&Packet::PubRec(PubRecPacket::new_with_reason(
                packet_id,
                reason_code,
            )))
            .await?;
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn on_pubrec(&mut self, pubrec: PubRecPacket) -> Result<Flow> {
        let packet_id = pubrec.packet_id;
        if self.version.is_v5() && pubrec.reason_code.is_error() {
            let inflight = self.session_mut()?.inflight_mut();
            match inflight.outbound(packet_id).map(|entry| entry.stage) {
                Some(InFlightStage::AwaitingPubRec) => {
                    inflight.release_outbound(packet_id);
                }
                _ => {
                    return Err(MqttError::ProtocolViolation(format!(
                        "PUBREC for packet id {packet_id} that is not awaiting one"
                    )))
                }
            }
            self.finish_delivery(packet_id, pubrec.reason_code);
        } else {
            self.session_mut()?.inflight_mut().on_pubrec(packet_id)?;
        }
        self.emit(EndpointEvent::PublishReceived {
            packet_id,
            reason_code: pubrec.reason_code,
        })
        .await
    }

    async fn on_subscribe(&mut self, subscribe: SubscribePacket) -> Result<Flow> {
        if self.pending_subscribes.contains_key(&subscribe.packet_id) {
            return Err(MqttError::ProtocolViolation(format!(
                "SUBSCRIBE reuses pending packet id {}",
                subscribe.packet_id
            )));
        }
        self.pending_subscribes
            .insert(subscribe.packet_id, subscribe.filters.clone());
        let request = SubscribeRequest {
            packet_id: subscribe.packet_id,
            subscription_identifier: subscribe.subscription_identifier(),
            filters: subscribe.filters,
            properties: subscribe.properties,
        };
        self.emit(EndpointEvent::Subscribe(request)).await
    }

    async fn on_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Result<Flow> {
        if self.pending_unsubscribes.contains_key(&unsubscribe.packet_id) {
            return Err(MqttError::ProtocolViolation(format!(
                "UNSUBSCRIBE reuses pending packet id {}",
                unsubscribe.packet_id
            )));
        }
        self.pending_unsubscribes
            .insert(unsubscribe.packet_id, unsubscribe.filters.clone());
        let request = UnsubscribeRequest {
            packet_id: unsubscribe.packet_id,
            filters: unsubscribe.filters,
            properties: unsubscribe.properties,
        };
        self.emit(EndpointEvent::Unsubscribe(request)).await
    }

    async fn on_disconnect(&mut self, disconnect: DisconnectPacket) -> Result<Flow> {
        if self.version.is_v5() {
            if let Some(expiry) = disconnect.properties.session_expiry_interval() {
                let session = self.session_mut()?;
                if session.expiry_interval() == 0 && expiry > 0 {
                    return Err(MqttError::ProtocolViolation(
                        "DISCONNECT cannot raise a zero session expiry interval".to_string(),
                    ));
                }
                session.set_expiry_interval(expiry);
            }
        }

        let reason_code = disconnect.reason_code;
        info!(
            connection_id = self.connection_id,
            reason = ?reason_code,
            "Client disconnected"
        );
        if let ControlFlow::Break(reason) = self.emit(EndpointEvent::Disconnect(disconnect)).await? {
            return Ok(ControlFlow::Break(reason));
        }
        Ok(ControlFlow::Break(CloseReason::ClientDisconnect(reason_code)))
    }

    /// Releases the identifier of a finished outbound exchange and
    /// completes its delivery handle
    fn finish_delivery(&mut self, packet_id: u16, reason_code: ReasonCode) {
        if let Some(session) = self.session.as_mut() {
            session.packet_ids_mut().release(packet_id);
        }
        if let Some(completion) = self.deliveries.remove(&packet_id) {
            let _ = completion.send(Ok(reason_code));
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Decide(decision) => {
                self.decision = Some(decision);
                Ok(ControlFlow::Continue(()))
            }
            Command::Publish { publish, reply } => {
                let result = self.publish(publish).await;
                respond(reply, result)
            }
            Command::SubscribeAck {
                packet_id,
                granted,
                reply,
            } => {
                let result = self.subscribe_acknowledge(packet_id, granted).await;
                respond(reply, result)
            }
            Command::UnsubscribeAck { packet_id, reply } => {
                let result = self.unsubscribe_acknowledge(packet_id).await;
                respond(reply, result)
            }
            Command::PublishRelease { packet_id, reply } => {
                let result = self.publish_release(packet_id).await;
                respond(reply, result)
            }
            Command::Disconnect { reason_code, reply } => {
                if let Err(err) = self.ensure_established("disconnect") {
                    let _ = reply.send(Err(err));
                    return Ok(ControlFlow::Continue(()));
                }
                let reason_code = if reason_code.is_valid_for_disconnect() {
                    reason_code
                } else {
                    ReasonCode::UnspecifiedError
                };
                let result = if self.version.is_v5() {
                    self.write(&Packet::Disconnect(DisconnectPacket::new(reason_code)))
                        .await
                } else {
                    Ok(())
                };
                let _ = reply.send(result.clone());
                info!(
                    connection_id = self.connection_id,
                    reason = ?reason_code,
                    "Disconnecting client"
                );
                result.map(|()| ControlFlow::Break(CloseReason::ServerDisconnect(reason_code)))
            }
        }
    }

    fn check_size(&self, packet: &Packet) -> Result<()> {
        let size = packet.encoded_len(self.version)?;
        match self.peer_max_packet_size {
            Some(max) if size > max => Err(MqttError::PacketTooLarge { size, max }),
            _ => Ok(()),
        }
    }

    async fn publish(&mut self, publish: PublishPacket) -> Result<Delivery> {
        self.ensure_established("publish")?;
        validate_topic_name(&publish.topic_name)?;
        let (completion_tx, completion) = oneshot::channel();

        if publish.qos == QoS::AtMostOnce {
            let packet = Packet::Publish(publish);
            self.check_size(&packet)?;
            self.write(&packet).await?;
            let _ = completion_tx.send(Ok(ReasonCode::Success));
            return Ok(Delivery {
                packet_id: None,
                completion,
            });
        }

        let packet_id = self.session_mut()?.packet_ids_mut().allocate()?;
        let publish = publish.with_packet_id(packet_id);
        let packet = Packet::Publish(publish.clone());
        if let Err(err) = self.check_size(&packet) {
            self.session_mut()?.packet_ids_mut().release(packet_id);
            return Err(err);
        }

        self.session_mut()?
            .inflight_mut()
            .insert_outbound(publish, Instant::now())?;
        self.deliveries.insert(packet_id, completion_tx);
        self.write(&packet).await?;
        debug!(connection_id = self.connection_id, packet_id, "PUBLISH sent");

        Ok(Delivery {
            packet_id: Some(packet_id),
            completion,
        })
    }

    async fn subscribe_acknowledge(
        &mut self,
        packet_id: u16,
        granted: Vec<SubAckReasonCode>,
    ) -> Result<()> {
        self.ensure_established("subscribe_acknowledge")?;
        let expected = self
            .pending_subscribes
            .get(&packet_id)
            .map(Vec::len)
            .ok_or(MqttError::PacketIdNotFound(packet_id))?;
        if granted.len() != expected {
            return Err(MqttError::InvalidArgument(format!(
                "{} reason codes for {expected} topic filters",
                granted.len()
            )));
        }

        let filters = self
            .pending_subscribes
            .remove(&packet_id)
            .unwrap_or_default();
        let codes: Vec<SubAckReasonCode> = filters
            .iter()
            .zip(granted)
            .map(|(filter, code)| code.clamp_to(filter.options.qos))
            .collect();

        let session = self.session_mut()?;
        for (filter, code) in filters.into_iter().zip(&codes) {
            if let Some(qos) = code.granted_qos() {
                session
                    .subscriptions_mut()
                    .add(Subscription::new(filter.filter, filter.options, qos));
            }
        }

        self.write(&Packet::SubAck(
            SubAckPacket::new(packet_id).with_reason_codes(codes),
        ))
        .await
    }

    async fn unsubscribe_acknowledge(&mut self, packet_id: u16) -> Result<()> {
        self.ensure_established("unsubscribe_acknowledge")?;
        let filters = self
            .pending_unsubscribes
            .remove(&packet_id)
            .ok_or(MqttError::PacketIdNotFound(packet_id))?;

        let session = self.session_mut()?;
        let codes = filters
            .iter()
            .map(|filter| {
                if session.subscriptions_mut().remove(filter) {
                    UnsubAckReasonCode::Success
                } else {
                    UnsubAckReasonCode::NoSubscriptionExisted
                }
            })
            .collect();

        self.write(&Packet::UnsubAck(
            UnsubAckPacket::new(packet_id).with_reason_codes(codes),
        ))
        .await
    }

    async fn publish_release(&mut self, packet_id: u16) -> Result<()> {
        self.ensure_established("publish_release")?;
        let inflight = self.session_mut()?.inflight_mut();
        match inflight.outbound(packet_id).map(|entry| entry.stage) {
            Some(InFlightStage::AwaitingPubComp) => {
                inflight.touch_outbound(packet_id, Instant::now());
            }
            Some(stage) => {
                return Err(MqttError::InvalidArgument(format!(
                    "packet id {packet_id} is {stage:?}, not released"
                )))
            }
            None => return Err(MqttError::PacketIdNotFound(packet_id)),
        }
        self.write(&Packet::PubRel(PubRelPacket::new(packet_id)))
            .await
    }

    /// The single close path; every way out of the connection ends here
    async fn close(mut self, reason: CloseReason) -> CloseReason {
        // queued commands are answered with ConnectionClosed
        self.commands.close();
        while self.commands.try_recv().is_ok() {}

        if self.connack_sent && self.version.is_v5() {
            if let Some(code) = reason.disconnect_code() {
                if let Err(err) = self
                    .write(&Packet::Disconnect(DisconnectPacket::new(code)))
                    .await
                {
                    debug!(connection_id = self.connection_id, error = %err, "Final DISCONNECT not written");
                }
            }
        }
        self.state.begin_close();
        let _ = self.writer.shutdown().await;

        let will = if reason.dispatches_will() {
            self.session.as_mut().and_then(Session::take_will)
        } else {
            None
        };

        if self.owns_session {
            if let Some(identity) = self.identity.get() {
                let now = Instant::now();
                let stored = self.session.take().and_then(|mut session| {
                    if reason == CloseReason::TakenOver {
                        session.hand_over(now);
                        Some(session)
                    } else if session.persists() {
                        session.mark_disconnected(now);
                        Some(session)
                    } else {
                        None
                    }
                });
                self.registry
                    .release(&identity.client_id, self.connection_id, stored)
                    .await;
            }
        }

        // notices that raced with our own close
        self.takeover_rx.close();
        while let Ok(notice) = self.takeover_rx.try_recv() {
            let _ = notice.ack.send(());
        }
        if let Some(ack) = self.takeover_ack.take() {
            let _ = ack.send(());
        }
        self.deliveries.clear();

        if let Some(will) = will {
            info!(
                connection_id = self.connection_id,
                topic = %will.topic,
                "Dispatching will"
            );
            let _ = self.events.send(EndpointEvent::Will(will)).await;
        }

        info!(connection_id = self.connection_id, reason = ?reason, "Connection closed");
        let _ = self.events.send(EndpointEvent::Closed(reason.clone())).await;
        self.state.mark_closed();
        reason
    }
}

impl<S> std::fmt::Debug for ClientHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandler")
            .field("connection_id", &self.connection_id)
            .field("version", &self.version)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}
