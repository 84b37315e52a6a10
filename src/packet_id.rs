//! Packet identifier allocation for server-initiated QoS 1/2 deliveries

use crate::error::{MqttError, Result};
use std::collections::HashSet;

/// Hands out identifiers in 1..=65535 that are not currently in flight
///
/// The allocator belongs to a session and is only touched by the task that
/// owns that session, so it needs no synchronisation.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: HashSet<u16>,
}

impl PacketIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
        }
    }

    /// Reserves the next free identifier, scanning forward with wraparound
    ///
    /// # Errors
    ///
    /// Returns `PacketIdExhausted` when all 65,535 identifiers are in flight
    pub fn allocate(&mut self) -> Result<u16> {
        if self.in_use.len() >= usize::from(u16::MAX) {
            return Err(MqttError::PacketIdExhausted);
        }
        loop {
            let candidate = self.next_id;
            self.next_id = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if self.in_use.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    pub fn release(&mut self, id: u16) -> bool {
        self.in_use.remove(&id)
    }

    #[must_use]
    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
