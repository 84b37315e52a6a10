//! Raw MQTT client over an in-memory duplex stream

#![allow(dead_code)]

use bytes::BytesMut;
use mqtt_endpoint::packet::connect::ConnectPacket;
use mqtt_endpoint::transport::PacketReader;
use mqtt_endpoint::{
    encode_packet, Endpoint, EndpointConfig, EndpointEvent, EndpointEvents, Packet,
    ProtocolVersion, SessionRegistry,
};
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of a test connection; writes raw bytes, reads decoded packets
pub struct TestClient {
    reader: PacketReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    pub version: ProtocolVersion,
}

impl TestClient {
    pub fn new(stream: DuplexStream, version: ProtocolVersion) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: PacketReader::new(read_half, version, 1024 * 1024),
            writer: write_half,
            version,
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        encode_packet(&packet, self.version, &mut buf).expect("encode");
        self.send_raw(&buf).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    /// Next packet from the server, `None` once it closed the stream
    pub async fn recv(&mut self) -> Option<Packet> {
        timeout(DEFAULT_TIMEOUT, self.reader.read_packet())
            .await
            .expect("timed out waiting for a packet")
            .ok()
            .flatten()
    }

    pub async fn expect(&mut self) -> Packet {
        self.recv().await.expect("server closed the stream")
    }

    pub async fn expect_closed(&mut self) {
        assert_eq!(self.recv().await, None);
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

pub fn connect_packet(version: ProtocolVersion, client_id: &str) -> ConnectPacket {
    ConnectPacket::new(version, client_id).with_keep_alive(60)
}

/// Honours `RUST_LOG` when debugging a test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawns an endpoint and returns it with the client side of its stream
pub fn start(
    config: EndpointConfig,
    registry: SessionRegistry,
    version: ProtocolVersion,
) -> (Endpoint, EndpointEvents, TestClient) {
    init_tracing();
    let (client, server) = duplex(64 * 1024);
    let (endpoint, events) = Endpoint::spawn(server, config, registry).expect("valid config");
    (endpoint, events, TestClient::new(client, version))
}

pub async fn next_event(events: &mut EndpointEvents) -> EndpointEvent {
    timeout(DEFAULT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

/// Sends `connect`, accepts it and reads the CONNACK
///
/// Returns the CONNACK's session present flag.
pub async fn handshake(
    endpoint: &Endpoint,
    events: &mut EndpointEvents,
    client: &mut TestClient,
    connect: ConnectPacket,
    resume: bool,
) -> bool {
    client.send(Packet::Connect(Box::new(connect))).await;
    match next_event(events).await {
        EndpointEvent::Connect(_) => {}
        other => panic!("expected Connect, got {other:?}"),
    }
    endpoint.accept(resume).expect("accept");

    let session_present = match client.expect().await {
        Packet::ConnAck(connack) => {
            assert!(!connack.reason_code.is_error());
            connack.session_present
        }
        other => panic!("expected CONNACK, got {other:?}"),
    };
    match next_event(events).await {
        EndpointEvent::Established { session_present: reported } => {
            assert_eq!(reported, session_present);
        }
        other => panic!("expected Established, got {other:?}"),
    }
    session_present
}

/// Starts an endpoint and completes a clean handshake for `client_id`
pub async fn connected(
    version: ProtocolVersion,
    client_id: &str,
) -> (Endpoint, EndpointEvents, TestClient) {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), version);
    handshake(
        &endpoint,
        &mut events,
        &mut client,
        connect_packet(version, client_id),
        false,
    )
    .await;
    (endpoint, events, client)
}

/// Drains events until `Closed` and returns everything seen before it
pub async fn drain_until_closed(
    events: &mut EndpointEvents,
) -> (Vec<EndpointEvent>, mqtt_endpoint::CloseReason) {
    let mut seen = Vec::new();
    loop {
        match next_event(events).await {
            EndpointEvent::Closed(reason) => return (seen, reason),
            other => seen.push(other),
        }
    }
}
