//! Connection lifecycle shared between the connection task and its handles

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of one connection
///
/// `AwaitingConnect -> Validating -> {Accepted, Rejected}`, then
/// `Accepted -> Established -> Closing -> Closed` or
/// `Rejected -> Closing -> Closed`. A CONNECT that fails the version or
/// client identifier checks goes straight from `AwaitingConnect` to
/// `Rejected`. Any state may move to `Closing` when the connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    AwaitingConnect = 0,
    Validating = 1,
    Accepted = 2,
    Rejected = 3,
    Established = 4,
    Closing = 5,
    Closed = 6,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::AwaitingConnect,
            1 => Self::Validating,
            2 => Self::Accepted,
            3 => Self::Rejected,
            4 => Self::Established,
            5 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Nothing may be written to the transport from these states
    #[must_use]
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Atomic cell holding a [`ConnectionState`]
///
/// Every transition is a compare-and-swap from an expected state, so two
/// racing transitions (a timer and an application call, say) cannot both
/// succeed.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<AtomicU8>,
}

impl SharedState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(ConnectionState::AwaitingConnect as u8)),
        }
    }

    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`
    ///
    /// # Errors
    ///
    /// Returns the actual state if it was not `from`
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Enters `Closing` from any state short of it
    ///
    /// Returns false if the connection was already closing or closed.
    pub fn begin_close(&self) -> bool {
        let mut current = self.inner.load(Ordering::Acquire);
        loop {
            if ConnectionState::from_u8(current).is_closing() {
                return false;
            }
            match self.inner.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn mark_closed(&self) {
        self.inner.store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
