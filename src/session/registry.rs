//! Client identifier to session map shared by all connections

use crate::session::state::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::debug;

/// Asks the connection that owns a session to close and hand it back
///
/// The owner releases the session to the registry first and then
/// completes `ack`. Dropping the notice unacknowledged is treated the same
/// way once the owner has gone.
#[derive(Debug)]
pub struct TakeoverNotice {
    pub ack: oneshot::Sender<()>,
}

#[derive(Debug)]
struct Owner {
    connection_id: u64,
    takeover: mpsc::UnboundedSender<TakeoverNotice>,
}

#[derive(Debug, Default)]
struct Slot {
    session: Option<Session>,
    owner: Option<Owner>,
}

impl Slot {
    fn is_vacant(&self) -> bool {
        self.session.is_none() && self.owner.is_none()
    }
}

/// Result of [`SessionRegistry::claim`]
#[derive(Debug)]
pub struct Claim {
    /// Stored session for the identifier, if one existed and had not expired
    pub session: Option<Session>,
    /// Whether a live connection had to be closed first
    pub took_over: bool,
}

/// Sessions by client identifier, with at most one owning connection each
///
/// Cloning is cheap and every clone sees the same map. The lock is never
/// held while waiting for a previous owner to close.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live or stored, unexpired session exists for `client_id`
    pub async fn has_session(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let slots = self.slots.lock().await;
        slots.get(client_id).is_some_and(|slot| {
            slot.owner.is_some()
                || slot
                    .session
                    .as_ref()
                    .is_some_and(|session| !session.is_expired(now))
        })
    }

    /// Makes `connection_id` the owner of `client_id`
    ///
    /// A connection that currently owns the identifier is sent a
    /// [`TakeoverNotice`] and awaited; by the time this returns it has
    /// written its session back, which is then handed out here. Expired
    /// sessions are discarded on the way.
    pub async fn claim(
        &self,
        client_id: &str,
        connection_id: u64,
        takeover: mpsc::UnboundedSender<TakeoverNotice>,
    ) -> Claim {
        let mut took_over = false;
        loop {
            let (previous, ack_rx) = {
                let mut slots = self.slots.lock().await;
                let slot = slots.entry(client_id.to_string()).or_default();

                let other = slot
                    .owner
                    .as_ref()
                    .filter(|owner| owner.connection_id != connection_id)
                    .map(|owner| (owner.connection_id, owner.takeover.clone()));

                match other {
                    Some((previous, notify)) => {
                        let (ack_tx, ack_rx) = oneshot::channel();
                        if notify.send(TakeoverNotice { ack: ack_tx }).is_err() {
                            // owner task is gone without releasing
                            slot.owner = None;
                            continue;
                        }
                        (previous, ack_rx)
                    }
                    None => {
                        let now = Instant::now();
                        let session = slot.session.take().filter(|session| {
                            let expired = session.is_expired(now);
                            if expired {
                                debug!(client_id = %client_id, "Discarding expired session");
                            }
                            !expired
                        });
                        slot.owner = Some(Owner {
                            connection_id,
                            takeover,
                        });
                        return Claim { session, took_over };
                    }
                }
            };

            debug!(
                client_id = %client_id,
                previous_connection = previous,
                connection_id,
                "Taking over session"
            );
            took_over = true;
            if ack_rx.await.is_err() {
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots.get_mut(client_id) {
                    if slot
                        .owner
                        .as_ref()
                        .is_some_and(|owner| owner.connection_id == previous)
                    {
                        slot.owner = None;
                    }
                }
            }
        }
    }

    /// Returns ownership of `client_id`
    ///
    /// `session` is stored for a later resume, or `None` to discard the
    /// state. Ownership is cleared only after the session is written, and
    /// only if `connection_id` still owns the slot.
    pub async fn release(&self, client_id: &str, connection_id: u64, session: Option<Session>) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(client_id) else {
            if let Some(session) = session {
                slots.insert(
                    client_id.to_string(),
                    Slot {
                        session: Some(session),
                        owner: None,
                    },
                );
            }
            return;
        };

        match &slot.owner {
            Some(owner) if owner.connection_id != connection_id => {
                debug!(
                    client_id = %client_id,
                    connection_id,
                    "Session already owned by another connection, dropping state"
                );
                return;
            }
            _ => {}
        }

        slot.session = session;
        slot.owner = None;
        if slot.is_vacant() {
            slots.remove(client_id);
        }
    }

    /// Number of stored sessions not currently owned by a connection
    pub async fn stored_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter(|slot| slot.owner.is_none() && slot.session.is_some())
            .count()
    }

    /// Drops stored sessions whose expiry interval has elapsed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            if slot.owner.is_none() {
                if let Some(session) = &slot.session {
                    return !session.is_expired(now);
                }
            }
            !slot.is_vacant()
        });
        before - slots.len()
    }
}
