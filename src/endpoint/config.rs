//! Endpoint configuration
//!
//! Options applied to every connection served by the engine.

use crate::constants::{defaults, limits};
use crate::error::{MqttError, Result};
use crate::protocol::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Time allowed between accepting the stream and a complete CONNECT
    pub handshake_timeout: Duration,

    /// Protocol revisions this endpoint accepts
    pub supported_versions: Vec<ProtocolVersion>,

    /// Largest inbound packet, fixed header included
    pub max_message_size: usize,

    /// Multiplier applied to the keep-alive interval before the client is
    /// considered gone
    pub keep_alive_tolerance: f64,

    /// Longest client identifier accepted
    pub max_client_id_length: usize,

    /// Assign an identifier to clients that connect with an empty one
    pub auto_client_id: bool,

    /// Keep-alive imposed on v5 clients, announced in CONNACK
    pub server_keep_alive: Option<u16>,

    /// Capacity of the per-connection event channel
    pub event_channel_capacity: usize,

    /// Inbound QoS 1/2 window announced to v5 clients
    pub receive_maximum: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: defaults::HANDSHAKE_TIMEOUT,
            supported_versions: ProtocolVersion::ALL.to_vec(),
            max_message_size: limits::MAX_REMAINING_LENGTH,
            keep_alive_tolerance: defaults::KEEP_ALIVE_TOLERANCE,
            max_client_id_length: limits::MAX_CLIENT_ID_LENGTH,
            auto_client_id: true,
            server_keep_alive: None,
            event_channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
            receive_maximum: u16::MAX,
        }
    }
}

impl EndpointConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_supported_versions(mut self, versions: impl Into<Vec<ProtocolVersion>>) -> Self {
        self.supported_versions = versions.into();
        self
    }

    #[must_use]
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub fn with_keep_alive_tolerance(mut self, tolerance: f64) -> Self {
        self.keep_alive_tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_max_client_id_length(mut self, length: usize) -> Self {
        self.max_client_id_length = length;
        self
    }

    #[must_use]
    pub fn with_auto_client_id(mut self, enabled: bool) -> Self {
        self.auto_client_id = enabled;
        self
    }

    #[must_use]
    pub fn with_server_keep_alive(mut self, seconds: u16) -> Self {
        self.server_keep_alive = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_receive_maximum(mut self, receive_maximum: u16) -> Self {
        self.receive_maximum = receive_maximum;
        self
    }

    #[must_use]
    pub fn supports(&self, version: ProtocolVersion) -> bool {
        self.supported_versions.contains(&version)
    }

    /// Silence allowed before a keep-alive timeout, `None` when disabled
    #[must_use]
    pub fn keep_alive_deadline(&self, keep_alive: u16) -> Option<Duration> {
        if keep_alive == 0 {
            return None;
        }
        Some(Duration::from_secs(u64::from(keep_alive)).mul_f64(self.keep_alive_tolerance))
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first invalid option
    pub fn validate(&self) -> Result<&Self> {
        if self.handshake_timeout.is_zero() {
            return Err(MqttError::Configuration(
                "handshake_timeout must be greater than 0".to_string(),
            ));
        }

        if !self.keep_alive_tolerance.is_finite() || self.keep_alive_tolerance < 1.0 {
            return Err(MqttError::Configuration(
                "keep_alive_tolerance must be at least 1.0".to_string(),
            ));
        }

        if self.supported_versions.is_empty() {
            return Err(MqttError::Configuration(
                "supported_versions must not be empty".to_string(),
            ));
        }

        if self.max_message_size < limits::MAX_FIXED_HEADER_LEN {
            return Err(MqttError::Configuration(format!(
                "max_message_size must be at least {} bytes",
                limits::MAX_FIXED_HEADER_LEN
            )));
        }

        if self.event_channel_capacity == 0 {
            return Err(MqttError::Configuration(
                "event_channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.receive_maximum == 0 {
            return Err(MqttError::Configuration(
                "receive_maximum must be greater than 0".to_string(),
            ));
        }

        Ok(self)
    }
}
