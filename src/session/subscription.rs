use crate::packet::subscribe::SubscriptionOptions;
use crate::QoS;
use std::collections::HashMap;

/// A subscription granted to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic_filter: String,
    /// Options as requested in SUBSCRIBE; `options.qos` is the requested QoS
    pub options: SubscriptionOptions,
    /// QoS granted in SUBACK, never above `options.qos`
    pub granted_qos: QoS,
}

impl Subscription {
    #[must_use]
    pub fn new(topic_filter: impl Into<String>, options: SubscriptionOptions, granted_qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            options,
            granted_qos: granted_qos.min(options.qos),
        }
    }
}

/// Subscriptions of one session, keyed by topic filter
///
/// Adding a filter that is already present replaces the previous entry,
/// which is how a repeated SUBSCRIBE updates options.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    subscriptions: HashMap<String, Subscription>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `subscription`, returning the entry it replaced
    pub fn add(&mut self, subscription: Subscription) -> Option<Subscription> {
        self.subscriptions
            .insert(subscription.topic_filter.clone(), subscription)
    }

    /// Removes a subscription, returning whether it existed
    pub fn remove(&mut self, topic_filter: &str) -> bool {
        self.subscriptions.remove(topic_filter).is_some()
    }

    #[must_use]
    pub fn get(&self, topic_filter: &str) -> Option<&Subscription> {
        self.subscriptions.get(topic_filter)
    }

    #[must_use]
    pub fn contains(&self, topic_filter: &str) -> bool {
        self.subscriptions.contains_key(topic_filter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> + '_ {
        self.subscriptions.values()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
