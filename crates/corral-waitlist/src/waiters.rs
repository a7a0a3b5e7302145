//! In-process waiter registry.
//!
//! Callers blocked on a ticket register a single-shot completion sink
//! here; the director (or a local release) fires every sink for a ticket
//! when its status changes. The registry is process-local: each
//! control-plane instance only resolves waits registered with it.
//!
//! The map is guarded by a mutex held only for map work; completion
//! values travel over `oneshot` channels, so firing never blocks on a
//! slow reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::oneshot;
use uuid::Uuid;

use corral_core::{Error, Result};

use crate::ticket::TicketStatus;

/// Registry of pending waiters keyed by ticket uuid.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    inner: Mutex<HashMap<Uuid, Vec<Slot>>>,
    next_token: AtomicU64,
}

#[derive(Debug)]
struct Slot {
    token: u64,
    tx: oneshot::Sender<TicketStatus>,
}

impl WaiterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new waiter for `ticket_uuid`.
    ///
    /// The returned [`Waiter`] removes its own slot on drop, so a caller
    /// that disconnects before resolution does not disturb other waiters.
    #[must_use]
    pub fn register(self: &Arc<Self>, ticket_uuid: Uuid) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        self.lock()
            .entry(ticket_uuid)
            .or_default()
            .push(Slot { token, tx });

        Waiter {
            ticket_uuid,
            token,
            rx: Some(rx),
            registry: Arc::downgrade(self),
        }
    }

    /// Resolves every pending waiter for `ticket_uuid` with `status`.
    ///
    /// The slot set is removed atomically, so firing twice for the same
    /// ticket is a no-op. Returns the number of waiters notified.
    pub fn fire(&self, ticket_uuid: Uuid, status: TicketStatus) -> usize {
        let slots = self.lock().remove(&ticket_uuid).unwrap_or_default();
        let mut notified = 0;
        for slot in slots {
            // A receiver dropped mid-flight is a disconnected caller.
            if slot.tx.send(status).is_ok() {
                notified += 1;
            }
        }
        notified
    }

    /// Drops every pending sink for `ticket_uuid` without resolving it.
    ///
    /// Used when a ticket is deleted out from under its waiters; their
    /// channels close and the wait surfaces as not-found.
    pub fn cancel_all(&self, ticket_uuid: Uuid) -> usize {
        self.lock().remove(&ticket_uuid).map_or(0, |slots| slots.len())
    }

    /// Returns the number of pending waiters for `ticket_uuid`.
    #[must_use]
    pub fn pending(&self, ticket_uuid: Uuid) -> usize {
        self.lock().get(&ticket_uuid).map_or(0, Vec::len)
    }

    /// Returns every ticket uuid with at least one pending waiter.
    ///
    /// The director uses this to notice tickets resolved by another
    /// process: such tickets leave the non-terminal sweep view without
    /// any local fire.
    #[must_use]
    pub fn pending_tickets(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    fn remove_slot(&self, ticket_uuid: Uuid, token: u64) {
        let mut inner = self.lock();
        if let Some(slots) = inner.get_mut(&ticket_uuid) {
            slots.retain(|slot| slot.token != token);
            if slots.is_empty() {
                inner.remove(&ticket_uuid);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<Slot>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A registered waiter; resolves exactly once.
#[derive(Debug)]
pub struct Waiter {
    ticket_uuid: Uuid,
    token: u64,
    rx: Option<oneshot::Receiver<TicketStatus>>,
    registry: Weak<WaiterRegistry>,
}

impl Waiter {
    /// The ticket this waiter is blocked on.
    #[must_use]
    pub fn ticket_uuid(&self) -> Uuid {
        self.ticket_uuid
    }

    /// Blocks until the ticket resolves and returns its new status.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the ticket was removed while waiting,
    /// `Error::Internal` if the waiter was already consumed.
    pub async fn wait(mut self) -> Result<TicketStatus> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::internal("waiter already consumed"));
        };
        match rx.await {
            Ok(status) => Ok(status),
            Err(_) => Err(Error::NotFound(format!(
                "ticket {} removed while waiting",
                self.ticket_uuid
            ))),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // No-op when the slot was already consumed by fire/cancel.
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_slot(self.ticket_uuid, self.token);
        }
    }
}
