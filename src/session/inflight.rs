//! Per-session store of unfinished QoS 1 and QoS 2 exchanges

use crate::error::{MqttError, Result};
use crate::packet::publish::PublishPacket;
use crate::packet::pubrel::PubRelPacket;
use crate::packet::Packet;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::QoS;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server
    Inbound,
    /// Server to client
    Outbound,
}

/// Acknowledgement an in-flight exchange is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightStage {
    /// Outbound QoS 1 PUBLISH written
    AwaitingPubAck,
    /// Outbound QoS 2 PUBLISH written
    AwaitingPubRec,
    /// Outbound QoS 2 PUBREL written
    AwaitingPubComp,
    /// Inbound QoS 2 PUBREC written
    AwaitingPubRel,
}

impl InFlightStage {
    #[must_use]
    pub fn direction(self) -> Direction {
        match self {
            Self::AwaitingPubRel => Direction::Inbound,
            _ => Direction::Outbound,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub packet_id: u16,
    pub stage: InFlightStage,
    pub qos: QoS,
    pub retry_count: u32,
    pub last_sent: Instant,
    /// Kept for redelivery until the exchange completes; inbound entries
    /// only remember the identifier
    pub publish: Option<PublishPacket>,
    /// Insertion order, used to replay in the original send order
    pub sequence: u64,
}

/// In-flight entries keyed by direction and packet identifier
///
/// Each direction has its own identifier space. An identifier is live in
/// at most one entry per direction.
#[derive(Debug, Clone, Default)]
pub struct InFlightStore {
    outbound: HashMap<u16, InFlightMessage>,
    inbound: HashMap<u16, InFlightMessage>,
    /// Inbound QoS 1 identifiers already answered, with the PUBACK code sent
    acknowledged: HashMap<u16, ReasonCode>,
    next_sequence: u64,
}

impl InFlightStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Records a server-initiated QoS 1 or 2 PUBLISH that has just been written
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for QoS 0, a missing identifier, or an identifier
    /// that is already in flight
    pub fn insert_outbound(&mut self, publish: PublishPacket, now: Instant) -> Result<()> {
        let stage = match publish.qos {
            QoS::AtMostOnce => {
                return Err(MqttError::InvalidArgument(
                    "QoS 0 messages are not tracked".to_string(),
                ))
            }
            QoS::AtLeastOnce => InFlightStage::AwaitingPubAck,
            QoS::ExactlyOnce => InFlightStage::AwaitingPubRec,
        };
        let packet_id = publish.packet_id.ok_or_else(|| {
            MqttError::InvalidArgument("in-flight PUBLISH without packet id".to_string())
        })?;
        if self.outbound.contains_key(&packet_id) {
            return Err(MqttError::InvalidArgument(format!(
                "packet id {packet_id} already in flight"
            )));
        }

        let sequence = self.next_sequence();
        self.outbound.insert(
            packet_id,
            InFlightMessage {
                packet_id,
                stage,
                qos: publish.qos,
                retry_count: 0,
                last_sent: now,
                publish: Some(publish),
                sequence,
            },
        );
        Ok(())
    }

    fn take_outbound(&mut self, packet_id: u16, expected: InFlightStage, ack: &str) -> Result<InFlightMessage> {
        match self.outbound.get(&packet_id) {
            Some(entry) if entry.stage == expected => {}
            Some(entry) => {
                return Err(MqttError::ProtocolViolation(format!(
                    "{ack} for packet id {packet_id} in stage {:?}",
                    entry.stage
                )))
            }
            None => {
                return Err(MqttError::ProtocolViolation(format!(
                    "{ack} for unknown packet id {packet_id}"
                )))
            }
        }
        self.outbound
            .remove(&packet_id)
            .ok_or(MqttError::PacketIdNotFound(packet_id))
    }

    /// Completes a QoS 1 delivery
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if `packet_id` is not awaiting PUBACK
    pub fn on_puback(&mut self, packet_id: u16) -> Result<InFlightMessage> {
        self.take_outbound(packet_id, InFlightStage::AwaitingPubAck, "PUBACK")
    }

    /// Moves a QoS 2 delivery to the release step
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if `packet_id` is not awaiting PUBREC
    pub fn on_pubrec(&mut self, packet_id: u16) -> Result<()> {
        match self.outbound.get_mut(&packet_id) {
            Some(entry) if entry.stage == InFlightStage::AwaitingPubRec => {
                entry.stage = InFlightStage::AwaitingPubComp;
                Ok(())
            }
            Some(entry) => Err(MqttError::ProtocolViolation(format!(
                "PUBREC for packet id {packet_id} in stage {:?}",
                entry.stage
            ))),
            None => Err(MqttError::ProtocolViolation(format!(
                "PUBREC for unknown packet id {packet_id}"
            ))),
        }
    }

    /// Completes a QoS 2 delivery
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if `packet_id` is not awaiting PUBCOMP
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Result<InFlightMessage> {
        self.take_outbound(packet_id, InFlightStage::AwaitingPubComp, "PUBCOMP")
    }

    /// Drops an outbound entry regardless of its stage
    pub fn release_outbound(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        self.outbound.remove(&packet_id)
    }

    /// Marks that PUBREL has been written for `packet_id`
    pub fn touch_outbound(&mut self, packet_id: u16, now: Instant) {
        if let Some(entry) = self.outbound.get_mut(&packet_id) {
            entry.last_sent = now;
        }
    }

    #[must_use]
    pub fn outbound(&self, packet_id: u16) -> Option<&InFlightMessage> {
        self.outbound.get(&packet_id)
    }

    /// Records an inbound QoS 2 identifier after PUBREC has been decided
    ///
    /// Returns false if the identifier was already recorded.
    pub fn record_inbound(&mut self, packet_id: u16, now: Instant) -> bool {
        if self.inbound.contains_key(&packet_id) {
            return false;
        }
        let sequence = self.next_sequence();
        self.inbound.insert(
            packet_id,
            InFlightMessage {
                packet_id,
                stage: InFlightStage::AwaitingPubRel,
                qos: QoS::ExactlyOnce,
                retry_count: 0,
                last_sent: now,
                publish: None,
                sequence,
            },
        );
        true
    }

    #[must_use]
    pub fn is_awaiting_pubrel(&self, packet_id: u16) -> bool {
        self.inbound.contains_key(&packet_id)
    }

    /// Releases an inbound QoS 2 identifier
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if `packet_id` was never recorded
    pub fn on_pubrel(&mut self, packet_id: u16) -> Result<()> {
        self.inbound
            .remove(&packet_id)
            .map(|_| ())
            .ok_or_else(|| {
                MqttError::ProtocolViolation(format!("PUBREL for unknown packet id {packet_id}"))
            })
    }

    /// Remembers the PUBACK written for an inbound QoS 1 identifier
    pub fn record_acknowledged(&mut self, packet_id: u16, reason_code: ReasonCode) {
        self.acknowledged.insert(packet_id, reason_code);
    }

    /// PUBACK code already sent for `packet_id`, if the client has not
    /// reused the identifier since
    #[must_use]
    pub fn acknowledged(&self, packet_id: u16) -> Option<ReasonCode> {
        self.acknowledged.get(&packet_id).copied()
    }

    /// Forgets an answered QoS 1 identifier once the client starts a new
    /// exchange with it
    pub fn forget_acknowledged(&mut self, packet_id: u16) {
        self.acknowledged.remove(&packet_id);
    }

    #[must_use]
    pub fn contains(&self, direction: Direction, packet_id: u16) -> bool {
        match direction {
            Direction::Inbound => self.inbound.contains_key(&packet_id),
            Direction::Outbound => self.outbound.contains_key(&packet_id),
        }
    }

    #[must_use]
    pub fn len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Inbound => self.inbound.len(),
            Direction::Outbound => self.outbound.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    /// Packets to resend after a session resumes, in original send order
    ///
    /// Unacknowledged PUBLISHes come back with DUP set and their retry
    /// count bumped; released QoS 2 exchanges come back as PUBREL.
    pub fn replay(&mut self, now: Instant) -> Vec<Packet> {
        let mut pending: Vec<&mut InFlightMessage> = self.outbound.values_mut().collect();
        pending.sort_by_key(|entry| entry.sequence);

        let mut packets = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry.stage {
                InFlightStage::AwaitingPubAck | InFlightStage::AwaitingPubRec => {
                    let Some(publish) = entry.publish.as_ref() else {
                        continue;
                    };
                    entry.retry_count += 1;
                    entry.last_sent = now;
                    packets.push(Packet::Publish(publish.clone().with_dup(true)));
                }
                InFlightStage::AwaitingPubComp => {
                    entry.retry_count += 1;
                    entry.last_sent = now;
                    packets.push(Packet::PubRel(PubRelPacket::new(entry.packet_id)));
                }
                InFlightStage::AwaitingPubRel => {}
            }
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(id: u16, qos: QoS) -> PublishPacket {
        PublishPacket::new("t", &b"payload"[..], qos).with_packet_id(id)
    }

    #[test]
    fn test_qos1_outbound_flow() {
        let mut store = InFlightStore::new();
        store
            .insert_outbound(publish(1, QoS::AtLeastOnce), Instant::now())
            .unwrap();
        assert_eq!(
            store.outbound(1).unwrap().stage,
            InFlightStage::AwaitingPubAck
        );

        let entry = store.on_puback(1).unwrap();
        assert_eq!(entry.packet_id, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_qos2_outbound_flow() {
        let mut store = InFlightStore::new();
        store
            .insert_outbound(publish(9, QoS::ExactlyOnce), Instant::now())
            .unwrap();

        store.on_pubrec(9).unwrap();
        assert_eq!(
            store.outbound(9).unwrap().stage,
            InFlightStage::AwaitingPubComp
        );
        store.on_pubcomp(9).unwrap();
        assert_eq!(store.len(Direction::Outbound), 0);
    }

    #[test]
    fn test_wrong_stage_is_violation() {
        let mut store = InFlightStore::new();
        store
            .insert_outbound(publish(1, QoS::AtLeastOnce), Instant::now())
            .unwrap();
        store
            .insert_outbound(publish(2, QoS::ExactlyOnce), Instant::now())
            .unwrap();

        assert!(matches!(
            store.on_pubrec(1),
            Err(MqttError::ProtocolViolation(_))
        ));
        assert!(matches!(
            store.on_puback(2),
            Err(MqttError::ProtocolViolation(_))
        ));
        assert!(matches!(
            store.on_pubcomp(2),
            Err(MqttError::ProtocolViolation(_))
        ));
        assert!(matches!(
            store.on_puback(3),
            Err(MqttError::ProtocolViolation(_))
        ));
        // failed acknowledgements leave entries untouched
        assert_eq!(store.len(Direction::Outbound), 2);
    }

    #[test]
    fn test_duplicate_outbound_id_rejected() {
        let mut store = InFlightStore::new();
        store
            .insert_outbound(publish(5, QoS::AtLeastOnce), Instant::now())
            .unwrap();
        assert!(store
            .insert_outbound(publish(5, QoS::ExactlyOnce), Instant::now())
            .is_err());
        assert!(store
            .insert_outbound(PublishPacket::new("t", &b""[..], QoS::AtMostOnce), Instant::now())
            .is_err());
    }

    #[test]
    fn test_inbound_qos2() {
        let mut store = InFlightStore::new();
        assert!(store.record_inbound(4, Instant::now()));
        assert!(!store.record_inbound(4, Instant::now()));
        assert!(store.is_awaiting_pubrel(4));

        // directions have separate id spaces
        store
            .insert_outbound(publish(4, QoS::AtLeastOnce), Instant::now())
            .unwrap();
        assert!(store.contains(Direction::Inbound, 4));
        assert!(store.contains(Direction::Outbound, 4));

        store.on_pubrel(4).unwrap();
        assert!(!store.is_awaiting_pubrel(4));
        assert!(matches!(
            store.on_pubrel(4),
            Err(MqttError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_replay_in_send_order() {
        let mut store = InFlightStore::new();
        let now = Instant::now();
        store.insert_outbound(publish(30, QoS::ExactlyOnce), now).unwrap();
        store.insert_outbound(publish(10, QoS::AtLeastOnce), now).unwrap();
        store.insert_outbound(publish(20, QoS::ExactlyOnce), now).unwrap();
        store.on_pubrec(20).unwrap();
        store.record_inbound(7, now);

        let packets = store.replay(now);
        assert_eq!(packets.len(), 3);
        match &packets[0] {
            Packet::Publish(p) => {
                assert_eq!(p.packet_id, Some(30));
                assert!(p.dup);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &packets[1] {
            Packet::Publish(p) => assert_eq!(p.packet_id, Some(10)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(packets[2], Packet::PubRel(PubRelPacket::new(20)));

        assert_eq!(store.outbound(10).unwrap().retry_count, 1);
        store.replay(now);
        assert_eq!(store.outbound(10).unwrap().retry_count, 2);
    }

    #[test]
    fn test_acknowledged_qos1_ids() {
        let mut store = InFlightStore::new();
        assert_eq!(store.acknowledged(5), None);

        store.record_acknowledged(5, ReasonCode::NotAuthorized);
        assert_eq!(store.acknowledged(5), Some(ReasonCode::NotAuthorized));
        // answered ids are not exchanges in flight
        assert!(store.is_empty());
        assert!(!store.is_awaiting_pubrel(5));

        store.forget_acknowledged(5);
        assert_eq!(store.acknowledged(5), None);
    }

    #[test]
    fn test_release_outbound() {
        let mut store = InFlightStore::new();
        store
            .insert_outbound(publish(3, QoS::ExactlyOnce), Instant::now())
            .unwrap();
        assert!(store.release_outbound(3).is_some());
        assert!(store.release_outbound(3).is_none());
    }
}
