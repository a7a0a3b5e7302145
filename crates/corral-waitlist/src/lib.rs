//! # corral-waitlist
//!
//! The waitlist serializes conflicting operations against scoped resources
//! on a fleet of servers. When two requests target the same
//! `(server, scope, id)` triple, only one holds an *active* ticket at a
//! time; the rest wait in FIFO order.
//!
//! Queues are shared cluster-wide through the store contract in
//! `corral-core`; each control-plane process runs one [`Director`] that
//! expires overdue tickets, promotes queue heads, and resolves the
//! process-local waiters in its [`WaiterRegistry`]. Client-initiated
//! mutations go through the [`QueueManager`].
//!
//! ## Invariants
//!
//! - Per `(server_uuid, scope, id)`, at most one ticket is `active`.
//! - Queues are FIFO by `(created_at, uuid)`; the uuid tie-break makes the
//!   order total regardless of wall-clock resolution.
//! - Terminal statuses (`expired`, `finished`) never change.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod director;
pub mod queue;
pub mod ticket;
pub mod waiters;

pub use director::{
    DEFAULT_SWEEP_INTERVAL, Director, DirectorConfig, DirectorHandle, Poke, SweepStats,
};
pub use queue::{ListOptions, MAX_LIST_LIMIT, QueueManager, WaitOutcome};
pub use ticket::{
    NewTicket, QueueKey, TICKETS_BUCKET, Ticket, TicketRecord, TicketStatus, ticket_key,
};
pub use waiters::{Waiter, WaiterRegistry};
