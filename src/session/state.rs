use crate::packet_id::PacketIdAllocator;
use crate::protocol::ProtocolVersion;
use crate::session::inflight::InFlightStore;
use crate::session::subscription::SubscriptionManager;
use crate::types::WillMessage;
use std::time::Duration;
use tokio::time::Instant;

/// Session expiry interval that never expires
pub const NEVER_EXPIRES: u32 = u32::MAX;

/// State kept for one client identifier
///
/// Connection-scoped attributes (version, keep alive, will) are refreshed
/// from every CONNECT; subscriptions, in-flight exchanges and the packet id
/// allocator survive a resume.
#[derive(Debug, Clone)]
pub struct Session {
    client_id: String,
    protocol_version: ProtocolVersion,
    clean_start: bool,
    keep_alive: u16,
    will: Option<WillMessage>,
    /// v5 session expiry interval in seconds
    expiry_interval: u32,
    created_at: Instant,
    last_activity: Instant,
    disconnected_at: Option<Instant>,
    /// Released by a connection that was taken over
    handed_over: bool,
    subscriptions: SubscriptionManager,
    inflight: InFlightStore,
    packet_ids: PacketIdAllocator,
}

impl Session {
    #[must_use]
    pub fn new(client_id: impl Into<String>, protocol_version: ProtocolVersion, clean_start: bool) -> Self {
        let now = Instant::now();
        Self {
            client_id: client_id.into(),
            protocol_version,
            clean_start,
            keep_alive: 0,
            will: None,
            expiry_interval: 0,
            created_at: now,
            last_activity: now,
            disconnected_at: None,
            handed_over: false,
            subscriptions: SubscriptionManager::new(),
            inflight: InFlightStore::new(),
            packet_ids: PacketIdAllocator::new(),
        }
    }

    #[must_use]
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    #[must_use]
    pub fn with_will(mut self, will: Option<WillMessage>) -> Self {
        self.will = will;
        self
    }

    #[must_use]
    pub fn with_expiry_interval(mut self, seconds: u32) -> Self {
        self.expiry_interval = seconds;
        self
    }

    /// Carries the connection-scoped attributes of `fresh` into this
    /// resumed session, keeping subscriptions and in-flight state
    #[must_use]
    pub fn resume_with(mut self, fresh: Session) -> Self {
        self.protocol_version = fresh.protocol_version;
        self.clean_start = fresh.clean_start;
        self.keep_alive = fresh.keep_alive;
        self.will = fresh.will;
        self.expiry_interval = fresh.expiry_interval;
        self.last_activity = fresh.last_activity;
        self.disconnected_at = None;
        self.handed_over = false;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    #[must_use]
    pub fn clean_start(&self) -> bool {
        self.clean_start
    }

    #[must_use]
    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, seconds: u16) {
        self.keep_alive = seconds;
    }

    #[must_use]
    pub fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }

    /// Disarms the will and hands it out, so it is dispatched at most once
    pub fn take_will(&mut self) -> Option<WillMessage> {
        self.will.take()
    }

    #[must_use]
    pub fn expiry_interval(&self) -> u32 {
        self.expiry_interval
    }

    pub fn set_expiry_interval(&mut self, seconds: u32) {
        self.expiry_interval = seconds;
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn mark_disconnected(&mut self, now: Instant) {
        self.disconnected_at = Some(now);
    }

    /// Marks the session as released for a connection taking it over
    ///
    /// Such a session is kept for the successor whether or not it would
    /// otherwise persist.
    pub fn hand_over(&mut self, now: Instant) {
        self.disconnected_at = Some(now);
        self.handed_over = true;
    }

    #[must_use]
    pub fn disconnected_at(&self) -> Option<Instant> {
        self.disconnected_at
    }

    /// Whether the session outlives its connection
    ///
    /// 3.x keeps it when clean session is 0; v5 keeps it while the expiry
    /// interval is non-zero.
    #[must_use]
    pub fn persists(&self) -> bool {
        if self.protocol_version.is_v5() {
            self.expiry_interval > 0
        } else {
            !self.clean_start
        }
    }

    /// Whether a stored session has outlived its expiry interval at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        let Some(disconnected_at) = self.disconnected_at else {
            return false;
        };
        if self.handed_over {
            return false;
        }
        if !self.persists() {
            return true;
        }
        if !self.protocol_version.is_v5() || self.expiry_interval == NEVER_EXPIRES {
            return false;
        }
        now.saturating_duration_since(disconnected_at)
            >= Duration::from_secs(u64::from(self.expiry_interval))
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionManager {
        &mut self.subscriptions
    }

    #[must_use]
    pub fn inflight(&self) -> &InFlightStore {
        &self.inflight
    }

    pub fn inflight_mut(&mut self) -> &mut InFlightStore {
        &mut self.inflight
    }

    pub fn packet_ids_mut(&mut self) -> &mut PacketIdAllocator {
        &mut self.packet_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::subscribe::SubscriptionOptions;
    use crate::session::subscription::Subscription;
    use crate::QoS;

    #[test]
    fn test_v3_persistence_follows_clean_session() {
        assert!(!Session::new("c", ProtocolVersion::V3_1_1, true).persists());
        assert!(Session::new("c", ProtocolVersion::V3_1_1, false).persists());
    }

    #[test]
    fn test_v5_persistence_follows_expiry() {
        let session = Session::new("c", ProtocolVersion::V5, false);
        assert!(!session.persists());
        assert!(session.with_expiry_interval(30).persists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_measured_from_disconnect() {
        let mut session = Session::new("c", ProtocolVersion::V5, false).with_expiry_interval(60);
        assert!(!session.is_expired(Instant::now()));

        session.mark_disconnected(Instant::now());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!session.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(session.is_expired(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_interval_never_expires() {
        let mut session =
            Session::new("c", ProtocolVersion::V5, false).with_expiry_interval(NEVER_EXPIRES);
        session.mark_disconnected(Instant::now());
        tokio::time::advance(Duration::from_secs(10 * 365 * 24 * 3600)).await;
        assert!(!session.is_expired(Instant::now()));
    }

    #[test]
    fn test_resume_keeps_subscriptions() {
        let mut stored = Session::new("c", ProtocolVersion::V3_1_1, false)
            .with_will(Some(WillMessage::new("old", &b"x"[..])));
        stored.subscriptions_mut().add(Subscription::new(
            "a/+",
            SubscriptionOptions::new(QoS::AtLeastOnce),
            QoS::AtLeastOnce,
        ));
        stored.mark_disconnected(Instant::now());

        let fresh = Session::new("c", ProtocolVersion::V5, false)
            .with_keep_alive(30)
            .with_expiry_interval(120);
        let resumed = stored.resume_with(fresh);

        assert_eq!(resumed.protocol_version(), ProtocolVersion::V5);
        assert_eq!(resumed.keep_alive(), 30);
        assert!(resumed.will().is_none());
        assert!(resumed.disconnected_at().is_none());
        assert!(resumed.subscriptions().contains("a/+"));
    }

    #[test]
    fn test_handed_over_session_survives() {
        let mut session = Session::new("c", ProtocolVersion::V5, true);
        session.hand_over(Instant::now());
        assert!(!session.persists());
        assert!(!session.is_expired(Instant::now()));

        let mut plain = Session::new("c", ProtocolVersion::V5, true);
        plain.mark_disconnected(Instant::now());
        assert!(plain.is_expired(Instant::now()));
    }

    #[test]
    fn test_take_will_once() {
        let mut session = Session::new("c", ProtocolVersion::V3_1_1, true)
            .with_will(Some(WillMessage::new("w", &b"bye"[..])));
        assert!(session.take_will().is_some());
        assert!(session.take_will().is_none());
    }
}
