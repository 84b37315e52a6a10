mod common;

use common::{connect_packet, connected, drain_until_closed, handshake, next_event, start};
use mqtt_endpoint::packet::puback::PubAckPacket;
use mqtt_endpoint::packet::pubcomp::PubCompPacket;
use mqtt_endpoint::packet::pubrec::PubRecPacket;
use mqtt_endpoint::packet::pubrel::PubRelPacket;
use mqtt_endpoint::{
    CloseReason, ConnectionState, EndpointConfig, EndpointEvent, MqttError, Packet, Properties,
    PropertyId, PropertyValue, ProtocolVersion, PublishPacket, QoS, ReasonCode, SessionRegistry,
};
use std::time::Duration;

fn inbound(topic: &str, qos: QoS, packet_id: u16) -> Packet {
    Packet::Publish(PublishPacket::new(topic, &b"22.5"[..], qos).with_packet_id(packet_id))
}

#[tokio::test]
async fn test_inbound_qos0_has_no_ack() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    client
        .send(Packet::Publish(PublishPacket::new(
            "sensors/t",
            &b"1"[..],
            QoS::AtMostOnce,
        )))
        .await;
    let EndpointEvent::Publish { message, ack } = next_event(&mut events).await else {
        panic!("expected Publish");
    };
    assert_eq!(message.topic, "sensors/t");
    assert!(ack.is_none());
}

#[tokio::test]
async fn test_inbound_qos1_waits_for_decision() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    client.send(inbound("sensors/t", QoS::AtLeastOnce, 7)).await;
    client.send(Packet::PingReq).await;

    let EndpointEvent::Publish { message, ack } = next_event(&mut events).await else {
        panic!("expected Publish");
    };
    assert_eq!(message.qos, QoS::AtLeastOnce);

    // the PINGREQ behind the PUBLISH is not read until the ack is decided
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_none());

    ack.expect("QoS 1 carries an ack").accept();
    assert_eq!(
        client.expect().await,
        Packet::PubAck(PubAckPacket::new_with_reason(7, ReasonCode::Success))
    );
    assert_eq!(client.expect().await, Packet::PingResp);
    assert!(matches!(next_event(&mut events).await, EndpointEvent::Ping));
}

#[tokio::test]
async fn test_inbound_qos1_rejected_on_v5() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    client.send(inbound("restricted", QoS::AtLeastOnce, 2)).await;
    let EndpointEvent::Publish { ack, .. } = next_event(&mut events).await else {
        panic!("expected Publish");
    };
    ack.unwrap().reject(ReasonCode::NotAuthorized);

    let Packet::PubAck(puback) = client.expect().await else {
        panic!("expected PUBACK");
    };
    assert_eq!(puback.packet_id, 2);
    assert_eq!(puback.reason_code, ReasonCode::NotAuthorized);
}

#[tokio::test]
async fn test_inbound_qos1_retransmission_not_redelivered() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    let first = PublishPacket::new("sensors/t", &b"1"[..], QoS::AtLeastOnce).with_packet_id(5);
    client.send(Packet::Publish(first.clone())).await;
    client.send(Packet::Publish(first.clone().with_dup(true))).await;

    let EndpointEvent::Publish { ack, .. } = next_event(&mut events).await else {
        panic!("expected Publish");
    };
    ack.unwrap().accept();

    // both copies are answered, only the first reaches the application
    for _ in 0..2 {
        let Packet::PubAck(puback) = client.expect().await else {
            panic!("expected PUBACK");
        };
        assert_eq!(puback.packet_id, 5);
    }
    client.send(Packet::PingReq).await;
    assert_eq!(client.expect().await, Packet::PingResp);
    assert!(matches!(next_event(&mut events).await, EndpointEvent::Ping));

    // a fresh PUBLISH may reuse the identifier
    client.send(Packet::Publish(first)).await;
    let EndpointEvent::Publish { message, ack } = next_event(&mut events).await else {
        panic!("expected Publish");
    };
    assert_eq!(message.topic, "sensors/t");
    ack.unwrap().accept();
    assert!(matches!(client.expect().await, Packet::PubAck(_)));
}

#[tokio::test]
async fn test_inbound_qos1_retransmission_repeats_reason_code() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    let publish = PublishPacket::new("restricted", &b"1"[..], QoS::AtLeastOnce).with_packet_id(9);
    client.send(Packet::Publish(publish.clone())).await;
    let EndpointEvent::Publish { ack, .. } = next_event(&mut events).await else {
        panic!("expected Publish");
    };
    ack.unwrap().reject(ReasonCode::NotAuthorized);
    let expected = Packet::PubAck(PubAckPacket::new_with_reason(9, ReasonCode::NotAuthorized));
    assert_eq!(client.expect().await, expected);

    client.send(Packet::Publish(publish.with_dup(true))).await;
    assert_eq!(client.expect().await, expected);
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_inbound_qos2_exactly_once() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    client.send(inbound("orders", QoS::ExactlyOnce, 3)).await;
    let EndpointEvent::Publish { ack, .. } = next_event(&mut events).await else {
        panic!("expected Publish");
    };
    drop(ack);
    assert_eq!(client.expect().await, Packet::PubRec(PubRecPacket::new(3)));

    // retransmission before PUBREL is acknowledged again but not delivered
    let Packet::Publish(publish) = inbound("orders", QoS::ExactlyOnce, 3) else {
        unreachable!()
    };
    client.send(Packet::Publish(publish.with_dup(true))).await;
    assert_eq!(client.expect().await, Packet::PubRec(PubRecPacket::new(3)));

    client.send(Packet::PubRel(PubRelPacket::new(3))).await;
    assert_eq!(client.expect().await, Packet::PubComp(PubCompPacket::new(3)));
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::PublishRelease(3)
    ));

    // after PUBCOMP the identifier starts a new message
    client.send(inbound("orders", QoS::ExactlyOnce, 3)).await;
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::Publish { .. }
    ));
}

#[tokio::test]
async fn test_pubrel_for_unknown_id_is_violation() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    client.send(Packet::PubRel(PubRelPacket::new(42))).await;
    client.expect_closed().await;
    let (_, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(
        reason,
        CloseReason::Error(MqttError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_topic_alias_is_refused() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    let mut properties = Properties::default();
    properties
        .add(PropertyId::TopicAlias, PropertyValue::TwoByteInteger(1))
        .unwrap();
    client
        .send(Packet::Publish(
            PublishPacket::new("a", &b"x"[..], QoS::AtMostOnce).with_properties(properties),
        ))
        .await;

    let Packet::Disconnect(disconnect) = client.expect().await else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(disconnect.reason_code, ReasonCode::ProtocolError);
    let (_, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(reason, CloseReason::Error(_)));
}

#[tokio::test]
async fn test_outbound_qos0() {
    let (endpoint, _events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    let delivery = endpoint
        .publish("cmd/c1", &b"reboot"[..], QoS::AtMostOnce, false, false)
        .await
        .unwrap();
    assert_eq!(delivery.packet_id, None);
    assert_eq!(delivery.wait().await.unwrap(), ReasonCode::Success);

    let Packet::Publish(publish) = client.expect().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.topic_name, "cmd/c1");
    assert_eq!(publish.packet_id, None);
}

#[tokio::test]
async fn test_outbound_qos1() {
    let (endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    let delivery = endpoint
        .publish("cmd/c1", &b"on"[..], QoS::AtLeastOnce, true, false)
        .await
        .unwrap();
    let packet_id = delivery.packet_id.expect("QoS 1 has an id");

    let Packet::Publish(publish) = client.expect().await else {
        panic!("expected PUBLISH");
    };
    assert_eq!(publish.packet_id, Some(packet_id));
    assert!(publish.retain);
    assert!(!publish.dup);

    client
        .send(Packet::PubAck(PubAckPacket::new_with_reason(
            packet_id,
            ReasonCode::NoMatchingSubscribers,
        )))
        .await;
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::PublishAcknowledge { packet_id: id, reason_code: ReasonCode::NoMatchingSubscribers } if id == packet_id
    ));
    assert_eq!(
        delivery.wait().await.unwrap(),
        ReasonCode::NoMatchingSubscribers
    );
}

#[tokio::test]
async fn test_outbound_qos2() {
    let (endpoint, mut events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    let delivery = endpoint
        .publish("cmd/c1", &b"once"[..], QoS::ExactlyOnce, false, false)
        .await
        .unwrap();
    let packet_id = delivery.packet_id.unwrap();
    assert!(matches!(client.expect().await, Packet::Publish(_)));

    // nothing to release before PUBREC
    assert!(matches!(
        endpoint.publish_release(packet_id).await,
        Err(MqttError::InvalidArgument(_))
    ));

    client.send(Packet::PubRec(PubRecPacket::new(packet_id))).await;
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::PublishReceived { .. }
    ));
    endpoint.publish_release(packet_id).await.unwrap();
    assert_eq!(client.expect().await, Packet::PubRel(PubRelPacket::new(packet_id)));

    client.send(Packet::PubComp(PubCompPacket::new(packet_id))).await;
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::PublishComplete { .. }
    ));
    assert_eq!(delivery.wait().await.unwrap(), ReasonCode::Success);

    assert!(matches!(
        endpoint.publish_release(packet_id).await,
        Err(MqttError::PacketIdNotFound(_))
    ));
}

#[tokio::test]
async fn test_outbound_qos2_error_pubrec_ends_exchange() {
    let (endpoint, mut events, mut client) = connected(ProtocolVersion::V5, "c1").await;

    let delivery = endpoint
        .publish("cmd/c1", &b"x"[..], QoS::ExactlyOnce, false, false)
        .await
        .unwrap();
    let packet_id = delivery.packet_id.unwrap();
    assert!(matches!(client.expect().await, Packet::Publish(_)));

    client
        .send(Packet::PubRec(PubRecPacket::new_with_reason(
            packet_id,
            ReasonCode::QuotaExceeded,
        )))
        .await;
    assert!(matches!(
        next_event(&mut events).await,
        EndpointEvent::PublishReceived {
            reason_code: ReasonCode::QuotaExceeded,
            ..
        }
    ));
    assert_eq!(delivery.wait().await.unwrap(), ReasonCode::QuotaExceeded);
    assert!(matches!(
        endpoint.publish_release(packet_id).await,
        Err(MqttError::PacketIdNotFound(_))
    ));
}

#[tokio::test]
async fn test_unexpected_puback_is_violation() {
    let (_endpoint, mut events, mut client) = connected(ProtocolVersion::V3_1_1, "c1").await;

    client.send(Packet::PubAck(PubAckPacket::new(9))).await;
    client.expect_closed().await;
    let (_, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(
        reason,
        CloseReason::Error(MqttError::ProtocolViolation(_))
    ));
}

#[tokio::test]
async fn test_publish_over_client_maximum_packet_size() {
    let (endpoint, mut events, mut client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);
    let mut properties = Properties::default();
    properties.set_maximum_packet_size(64);
    let connect = connect_packet(ProtocolVersion::V5, "small").with_properties(properties);
    handshake(&endpoint, &mut events, &mut client, connect, false).await;

    let result = endpoint
        .publish("big", vec![0u8; 200], QoS::AtLeastOnce, false, false)
        .await;
    assert!(matches!(result, Err(MqttError::PacketTooLarge { .. })));

    // the connection is unaffected and small messages still go out
    let delivery = endpoint
        .publish("small", &b"ok"[..], QoS::AtMostOnce, false, false)
        .await
        .unwrap();
    delivery.wait().await.unwrap();
    assert!(matches!(client.expect().await, Packet::Publish(_)));
    assert_eq!(endpoint.state(), ConnectionState::Established);
}

#[tokio::test]
async fn test_oversized_inbound_packet_closes() {
    let config = EndpointConfig::default().with_max_message_size(128);
    let (endpoint, mut events, mut client) =
        start(config, SessionRegistry::new(), ProtocolVersion::V5);
    handshake(
        &endpoint,
        &mut events,
        &mut client,
        connect_packet(ProtocolVersion::V5, "c1"),
        false,
    )
    .await;

    client
        .send(Packet::Publish(PublishPacket::new(
            "big",
            vec![0u8; 512],
            QoS::AtMostOnce,
        )))
        .await;
    let Packet::Disconnect(disconnect) = client.expect().await else {
        panic!("expected DISCONNECT");
    };
    assert_eq!(disconnect.reason_code, ReasonCode::PacketTooLarge);
    let (_, reason) = drain_until_closed(&mut events).await;
    assert!(matches!(
        reason,
        CloseReason::Error(MqttError::PacketTooLarge { .. })
    ));
}

#[tokio::test]
async fn test_publish_before_established() {
    let (endpoint, _events, _client) =
        start(EndpointConfig::default(), SessionRegistry::new(), ProtocolVersion::V5);
    assert!(matches!(
        endpoint
            .publish("a", &b""[..], QoS::AtMostOnce, false, false)
            .await,
        Err(MqttError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn test_publish_invalid_topic() {
    let (endpoint, _events, _client) = connected(ProtocolVersion::V5, "c1").await;
    assert!(matches!(
        endpoint
            .publish("a/+", &b""[..], QoS::AtLeastOnce, false, false)
            .await,
        Err(MqttError::InvalidTopicName(_))
    ));
}
