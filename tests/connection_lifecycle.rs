mod common;

use bytes::BytesMut;
use common::{connect_packet, connected, drain_until_closed, handshake, next_event, start};
use mqtt_endpoint::packet::disconnect::DisconnectPacket;
use mqtt_endpoint::packet::subscribe::SubscribePacket;
use mqtt_endpoint::{
    encode_packet, CloseReason, ConnectionState, EndpointConfig, EndpointEvent, MqttError, Packet,
    ProtocolVersion, QoS, ReasonCode, SessionRegistry, WillMessage,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_closes_silently() {
    let config = EndpointConfig::default().with_handshake_timeout(Duration::from_secs(2));
    let (endpoint, mut events, mut client) =
        start(config, SessionRegistry::new(), ProtocolVersion::V5);

    let (seen, reason) = drain_until_closed(&mut events).await;
    assert!(seen.is_empty());
    assert_eq!(reason, CloseReason::HandshakeTimeout);
    client.expect_closed().await;
    assert_eq!(endpoint.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_accept_v5() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);

    client
        .send(Packet::Connect(Box::new(connect_packet(
            ProtocolVersion::V5,
            "sensor-1",
        ))))
        .await;
    let EndpointEvent::Connect(info) = next_event(&mut events).await else {
        panic!("expected Connect");
    };
    assert_eq!(info.client_id, "sensor-1");
    assert_eq!(info.protocol_version, ProtocolVersion::V5);
    assert!(!info.session_available);
    assert_eq!(endpoint.state(), ConnectionState::Validating);
    assert_eq!(endpoint.client_id().as_deref(), Some("sensor-1"));

    endpoint.accept(false).unwrap();
    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.reason_code, ReasonCode::Success);
    assert!(!connack.session_present);
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Established {
            session_present: false
        }
    ));
    assert_eq!(endpoint.state(), ConnectionState::Established);
}

#[tokio::test]
async fn test_second_decision_is_refused() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V3_1_1);

    assert!(matches!(
        endpoint.accept(false),
        Err(MqttError::InvalidStateTransition { .. })
    ));

    handshake(
        &endpoint,
        &mut events,
        &mut client,
        connect_packet(ProtocolVersion::V3_1_1, "c1"),
        false,
    )
    .await;
    assert!(matches!(
        endpoint.accept(false),
        Err(MqttError::InvalidStateTransition { .. })
    ));
    assert!(matches!(
        endpoint.reject(ReasonCode::NotAuthorized),
        Err(MqttError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn test_reject_v3_maps_return_code() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V3_1_1);

    client
        .send(Packet::Connect(Box::new(connect_packet(
            ProtocolVersion::V3_1_1,
            "c1",
        ))))
        .await;
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Connect(_)
    ));
    assert!(matches!(
        endpoint.reject(ReasonCode::Success),
        Err(MqttError::InvalidArgument(_))
    ));
    endpoint.reject(ReasonCode::BadUsernameOrPassword).unwrap();

    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.reason_code, ReasonCode::BadUsernameOrPassword);
    client.expect_closed().await;

    let (_, reason) = drain_until_closed(&mut events).await;
    assert_eq!(
        reason,
        CloseReason::Rejected(ReasonCode::BadUsernameOrPassword)
    );
}

#[tokio::test]
async fn test_unknown_protocol_level() {
    let (_endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V3_1_1);

    // CONNECT "MQTT" level 7, clean session, keep alive 60, client id "a"
    client
        .send_raw(&[
            0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x07, 0x02, 0x00, 0x3C, 0x00, 0x01,
            b'a',
        ])
        .await;

    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.reason_code, ReasonCode::UnsupportedProtocolVersion);
    client.expect_closed().await;

    let (seen, reason) = drain_until_closed(&mut events).await;
    assert!(seen.is_empty());
    assert_eq!(
        reason,
        CloseReason::Rejected(ReasonCode::UnsupportedProtocolVersion)
    );
}

#[tokio::test]
async fn test_disabled_version_is_refused() {
    let config = EndpointConfig::default().with_supported_versions([ProtocolVersion::V5]);
    let (_endpoint, mut events, mut client) =
        start(config, SessionRegistry::new(), ProtocolVersion::V3_1_1);

    client
        .send(Packet::Connect(Box::new(connect_packet(
            ProtocolVersion::V3_1_1,
            "old-device",
        ))))
        .await;
    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.reason_code, ReasonCode::UnsupportedProtocolVersion);

    let (seen, _) = drain_until_closed(&mut events).await;
    assert!(seen.is_empty());
}

#[tokio::test]
async fn test_accept_before_validation_is_refused() {
    let config = EndpointConfig::default().with_supported_versions([ProtocolVersion::V5]);
    let (endpoint, mut events, mut client) =
        start(config, SessionRegistry::new(), ProtocolVersion::V3_1_1);

    client
        .send(Packet::Connect(Box::new(connect_packet(
            ProtocolVersion::V3_1_1,
            "old-device",
        ))))
        .await;
    // the CONNECT never reaches the application, so there is nothing to accept
    assert!(matches!(
        endpoint.accept(true),
        Err(MqttError::InvalidStateTransition { .. })
    ));

    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.reason_code, ReasonCode::UnsupportedProtocolVersion);
    assert!(matches!(
        endpoint.accept(true),
        Err(MqttError::InvalidStateTransition { .. })
    ));

    let (seen, reason) = drain_until_closed(&mut events).await;
    assert!(seen.is_empty());
    assert_eq!(
        reason,
        CloseReason::Rejected(ReasonCode::UnsupportedProtocolVersion)
    );
    assert_eq!(endpoint.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_empty_client_id_refused_on_v3_1() {
    let (_endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V3_1);

    client
        .send(Packet::Connect(Box::new(connect_packet(ProtocolVersion::V3_1, ""))))
        .await;
    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.reason_code, ReasonCode::ClientIdentifierNotValid);

    let (seen, reason) = drain_until_closed(&mut events).await;
    assert!(seen.is_empty());
    assert_eq!(
        reason,
        CloseReason::Rejected(ReasonCode::ClientIdentifierNotValid)
    );
}

#[tokio::test]
async fn test_pipelined_subscribe_waits_for_accept() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);

    let mut buf = BytesMut::new();
    encode_packet(
        &Packet::Connect(Box::new(connect_packet(ProtocolVersion::V5, "c1"))),
        ProtocolVersion::V5,
        &mut buf,
    )
    .unwrap();
    encode_packet(
        &Packet::Subscribe(SubscribePacket::new(1).add_filter("cmd/#", QoS::AtLeastOnce)),
        ProtocolVersion::V5,
        &mut buf,
    )
    .unwrap();
    client.send_raw(&buf).await;

    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Connect(_)
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_none());

    endpoint.accept(false).unwrap();
    assert!(matches!(client.expect().await, Packet::ConnAck(_)));
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Established { .. }
    ));
    let EndpointEvent::Subscribe(request) = next_event(&mut events).await else {
        panic!("expected Subscribe");
    };
    assert_eq!(request.packet_id, 1);
    assert_eq!(request.filters.len(), 1);
}

#[tokio::test]
async fn test_empty_client_id_is_assigned_on_v5() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);

    client
        .send(Packet::Connect(Box::new(connect_packet(ProtocolVersion::V5, ""))))
        .await;
    let EndpointEvent::Connect(info) = next_event(&mut events).await else {
        panic!("expected Connect");
    };
    assert!(info.assigned_client_id);
    assert!(!info.client_id.is_empty());
    endpoint.accept(false).unwrap();

    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(
        connack.properties.assigned_client_identifier(),
        Some(info.client_id.as_str())
    );
}

#[tokio::test]
async fn test_empty_client_id_without_clean_start() {
    let (_endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V3_1_1);

    client
        .send(Packet::Connect(Box::new(
            connect_packet(ProtocolVersion::V3_1_1, "").with_clean_start(false),
        )))
        .await;
    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.reason_code, ReasonCode::ClientIdentifierNotValid);

    let (seen, reason) = drain_until_closed(&mut events).await;
    assert!(seen.is_empty());
    assert_eq!(
        reason,
        CloseReason::Rejected(ReasonCode::ClientIdentifierNotValid)
    );
}

#[tokio::test]
async fn test_packet_before_connect_is_violation() {
    let (_endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);

    client.send(Packet::PingReq).await;
    client.expect_closed().await;
    let (_, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(
        reason,
        CloseReason::Error(MqttError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_second_connect_gets_protocol_error() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    client
        .send(Packet::Connect(Box::new(connect_packet(ProtocolVersion::V5, "c1"))))
        .await;
    let Packet::Disconnect(disconnect) = client.expect().await else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(disconnect.reason_code, ReasonCode::ProtocolError);
    client.expect_closed().await;

    let (_, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(
        reason,
        CloseReason::Error(MqttError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_ping() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    client.send(Packet::PingReq).await;
    assert_eq!(client.expect().await, Packet::PingResp);
    assert!(matches!(next_event(&mut events).await, EndpointEvent::Ping));
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_timeout_dispatches_will() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);
    let connect = connect_packet(ProtocolVersion::V5, "c1")
        .with_keep_alive(10)
        .with_will(WillMessage::new("status/c1", &b"offline"[..]));
    handshake(&endpoint, &mut events, &mut client, connect, false).await;

    // 1.5 x 10s of silence
    let (seen, reason) = drain_until_closed(&mut events).await;
    assert_eq!(reason, CloseReason::KeepAliveTimeout);
    assert!(matches!(
        seen.as_slice(),
        [EndpointEvent::Will(will)] if will.topic == "status/c1"
    ));

    let Packet::Disconnect(disconnect) = client.expect().await else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(disconnect.reason_code, ReasonCode::KeepAliveTimeout);
}

#[tokio::test(start_paused = true)]
async fn test_traffic_defers_keep_alive() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V3_1_1);
    let connect = connect_packet(ProtocolVersion::V3_1_1, "c1").with_keep_alive(4);
    handshake(&endpoint, &mut events, &mut client, connect, false).await;

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(5)).await;
        client.send(Packet::PingReq).await;
        assert_eq!(client.expect().await, Packet::PingResp);
        assert!(matches!(next_event(&mut events).await, EndpointEvent::Ping));
    }
    assert_eq!(endpoint.state(), ConnectionState::Established);
}

#[tokio::test(start_paused = true)]
async fn test_server_keep_alive_override() {
    let config = EndpointConfig::default().with_server_keep_alive(2);
    let (endpoint, mut events, mut client) =
        start(config, SessionRegistry::new(), ProtocolVersion::V5);

    client
        .send(Packet::Connect(Box::new(
            connect_packet(ProtocolVersion::V5, "c1").with_keep_alive(600),
        )))
        .await;
    let EndpointEvent::Connect(info) = next_event(&mut events).await else {
        panic!("expected Connect");
    };
    assert_eq!(info.keep_alive, 2);
    endpoint.accept(false).unwrap();

    let Packet::ConnAck(connack) = client.expect().await else {
        panic!("expected CONNACK");
    };
    assert_eq!(connack.properties.server_keep_alive(), Some(2));

    let (_, reason) = drain_until_closed(&mut events).await;
    assert_eq!(reason, CloseReason::KeepAliveTimeout);
}

#[tokio::test]
async fn test_normal_disconnect_discards_will() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);
    let connect = connect_packet(ProtocolVersion::V5, "c1")
        .with_will(WillMessage::new("status/c1", &b"offline"[..]));
    handshake(&endpoint, &mut events, &mut client, connect, false).await;

    client
        .send(Packet::Disconnect(DisconnectPacket::new(ReasonCode::Success)))
        .await;
    let (seen, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(seen.as_slice(), [EndpointEvent::Disconnect(_)]));
    assert_eq!(reason, CloseReason::ClientDisconnect(ReasonCode::Success));
    client.expect_closed().await;
}

#[tokio::test]
async fn test_disconnect_with_will_message() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);
    let connect = connect_packet(ProtocolVersion::V5, "c1")
        .with_will(WillMessage::new("status/c1", &b"gone"[..]));
    handshake(&endpoint, &mut events, &mut client, connect, false).await;

    client
        .send(Packet::Disconnect(DisconnectPacket::new(
            ReasonCode::DisconnectWithWillMessage,
        )))
        .await;
    let (seen, _) = drain_until_closed(&mut events).await;
    assert!(matches!(
        seen.as_slice(),
        [EndpointEvent::Disconnect(_), EndpointEvent::Will(_)]
    ));
}

#[tokio::test]
async fn test_transport_loss_dispatches_will() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V3_1_1);
    let connect = connect_packet(ProtocolVersion::V3_1_1, "c1")
        .with_will(WillMessage::new("status/c1", &b"lost"[..]));
    handshake(&endpoint, &mut events, &mut client, connect, false).await;

    client.close().await;
    let (seen, reason) = drain_until_closed(&mut events).await;
    assert_eq!(reason, CloseReason::TransportClosed);
    assert!(matches!(seen.as_slice(), [EndpointEvent::Will(_)]));
}

#[tokio::test]
async fn test_server_disconnect() {
    let (endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    endpoint
        .disconnect(ReasonCode::AdministrativeAction)
        .await
        .unwrap();
    let Packet::Disconnect(disconnect) = client.expect().await else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(disconnect.reason_code, ReasonCode::AdministrativeAction);
    client.expect_closed().await;

    let (_, reason) = drain_until_closed(&mut events).await;
    assert_eq!(
        reason,
        CloseReason::ServerDisconnect(ReasonCode::AdministrativeAction)
    );
    assert!(matches!(
        endpoint.disconnect(ReasonCode::Success).await,
        Err(MqttError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_disconnect_cannot_raise_zero_expiry() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    client
        .send(Packet::Disconnect(
            DisconnectPacket::new(ReasonCode::Success).with_session_expiry_interval(60),
        ))
        .await;
    let Packet::Disconnect(disconnect) = client.expect().await else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(disconnect.reason_code, ReasonCode::ProtocolError);
    let (_, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(
        reason,
        CloseReason::Error(MqttError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_invalid_config_is_refused() {
    let (_client, server) = tokio::io::duplex(64);
    let config = EndpointConfig::default().with_event_channel_capacity(0);
    assert!(matches!(
        mqtt_endpoint::Endpoint::spawn(server, config, SessionRegistry::new()),
        Err(MqttError::Configuration(_))
    ));
}
