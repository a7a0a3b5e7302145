//! Per-queue ticket management under optimistic concurrency.
//!
//! The queue manager owns every client-initiated ticket mutation: create,
//! release, delete, and listing. Queue ordering is derived, not stored:
//! the set of non-terminal tickets sharing `(server_uuid, scope, id)`,
//! ordered by `(created_at, uuid)` ascending.
//!
//! Writes are etag-guarded; the retry budget for contended releases lives
//! here, not in the HTTP layer.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use corral_core::observability::waitlist_span;
use corral_core::{
    Error, Filter, FindOptions, KvStore, PutPrecondition, PutResult, Result, SortField, SortOrder,
};

use crate::director::Poke;
use crate::ticket::{
    NewTicket, Ticket, TicketRecord, TicketStatus, TICKETS_BUCKET, fields, ticket_key,
};
use crate::waiters::{Waiter, WaiterRegistry};

/// Default and maximum page size for ticket listings.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Bounded retry budget for contended releases.
const RELEASE_MAX_ATTEMPTS: u32 = 5;

const RELEASE_BACKOFF_BASE: Duration = Duration::from_millis(25);
const RELEASE_BACKOFF_MAX: Duration = Duration::from_millis(400);

const TICKETS_CREATED_TOTAL: &str = "waitlist_tickets_created_total";
const RELEASE_CONFLICTS_TOTAL: &str = "waitlist_release_conflicts_total";

/// Options for listing a server's tickets.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Maximum tickets to return; defaults to and is capped at
    /// [`MAX_LIST_LIMIT`].
    pub limit: usize,
    /// Number of tickets to skip.
    pub offset: usize,
    /// Document field to sort on.
    pub attribute: String,
    /// Sort direction.
    pub order: SortOrder,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: MAX_LIST_LIMIT,
            offset: 0,
            attribute: fields::CREATED_AT.to_string(),
            order: SortOrder::Asc,
        }
    }
}

/// Outcome of registering a wait against a ticket.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The ticket was already active or terminal at registration time.
    Resolved(TicketStatus),
    /// The ticket is still queued; block on the waiter.
    Pending(Waiter),
}

/// Issues strictly increasing creation stamps at millisecond resolution.
///
/// Storage truncates timestamps to milliseconds, so two same-process
/// creations landing in one millisecond would otherwise tie and fall back
/// to the uuid tie-break. Advancing past the last issued stamp keeps
/// same-process creation order and queue order identical.
#[derive(Debug, Default)]
struct CreationClock {
    last_millis: std::sync::Mutex<Option<i64>>,
}

impl CreationClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        let mut last = self
            .last_millis
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stamp = chrono::Utc::now().timestamp_millis();
        if let Some(prev) = *last {
            if stamp <= prev {
                stamp = prev + 1;
            }
        }
        *last = Some(stamp);
        chrono::DateTime::from_timestamp_millis(stamp).unwrap_or_else(chrono::Utc::now)
    }
}

/// Manages ticket lifecycle for every queue in the store.
pub struct QueueManager {
    store: Arc<dyn KvStore>,
    waiters: Arc<WaiterRegistry>,
    poke: Poke,
    clock: CreationClock,
}

impl QueueManager {
    /// Creates a queue manager over the given store and waiter registry.
    ///
    /// The `poke` handle lets the manager nudge the director after writes
    /// that should be re-observed promptly (release, delete).
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, waiters: Arc<WaiterRegistry>, poke: Poke) -> Self {
        Self {
            store,
            waiters,
            poke,
            clock: CreationClock::default(),
        }
    }

    /// Creates a ticket and returns its uuid plus a snapshot of its queue.
    ///
    /// The ticket is durable before this returns; the snapshot lists the
    /// uuids of every non-terminal ticket in the queue, in queue order.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for bad parameters,
    /// `Error::StoreUnavailable` on transport failure.
    pub async fn create(&self, params: NewTicket) -> Result<(Uuid, Vec<Uuid>)> {
        let span = waitlist_span("create", &params.server_uuid.to_string());
        self.do_create(params).instrument(span).await
    }

    async fn do_create(&self, params: NewTicket) -> Result<(Uuid, Vec<Uuid>)> {
        let now = self.clock.now();
        let ticket = Ticket::create(params, now)?;
        let key = ticket_key(ticket.uuid);

        match self
            .store
            .put(
                TICKETS_BUCKET,
                &key,
                ticket.encode()?,
                PutPrecondition::DoesNotExist,
            )
            .await?
        {
            PutResult::Stored { .. } => {}
            PutResult::EtagMismatch { .. } => {
                return Err(Error::internal(format!(
                    "ticket uuid collision on {}",
                    ticket.uuid
                )));
            }
        }

        metrics::counter!(TICKETS_CREATED_TOTAL).increment(1);
        tracing::info!(
            ticket_uuid = %ticket.uuid,
            server_uuid = %ticket.server_uuid,
            scope = %ticket.scope,
            id = %ticket.id,
            "Created waitlist ticket"
        );

        let queue = self.queue_snapshot(&ticket).await?;
        self.poke.poke();
        Ok((ticket.uuid, queue))
    }

    /// Fetches a ticket by uuid.
    ///
    /// # Errors
    ///
    /// Returns `Error::ResourceNotFound` if no such ticket exists.
    pub async fn get(&self, uuid: Uuid) -> Result<Ticket> {
        Ok(self.load(uuid).await?.ticket)
    }

    /// Releases a ticket, transitioning it to `finished`.
    ///
    /// Releasing an already-terminal ticket is a no-op that reports the
    /// terminal status. A still-queued ticket may be released (the caller
    /// abandoned its intent); it leaves the queue without ever holding it.
    ///
    /// # Errors
    ///
    /// Returns `Error::ResourceNotFound` for an unknown ticket,
    /// `Error::Conflict` when the retry budget is exhausted under
    /// contention.
    pub async fn release(&self, uuid: Uuid) -> Result<TicketStatus> {
        let span = waitlist_span("release", &uuid.to_string());
        self.do_release(uuid).instrument(span).await
    }

    async fn do_release(&self, uuid: Uuid) -> Result<TicketStatus> {
        let mut backoff = RELEASE_BACKOFF_BASE;

        for attempt in 1..=RELEASE_MAX_ATTEMPTS {
            let record = self.load(uuid).await?;
            if record.ticket.status.is_terminal() {
                return Ok(record.ticket.status);
            }

            let mut ticket = record.ticket;
            ticket.transition(TicketStatus::Finished, chrono::Utc::now())?;

            match self
                .store
                .put(
                    TICKETS_BUCKET,
                    &ticket_key(uuid),
                    ticket.encode()?,
                    PutPrecondition::MatchesEtag(record.etag),
                )
                .await?
            {
                PutResult::Stored { .. } => {
                    tracing::info!(ticket_uuid = %uuid, "Released waitlist ticket");
                    self.waiters.fire(uuid, TicketStatus::Finished);
                    self.poke.poke();
                    return Ok(TicketStatus::Finished);
                }
                PutResult::EtagMismatch { .. } => {
                    metrics::counter!(RELEASE_CONFLICTS_TOTAL).increment(1);
                    tracing::debug!(
                        ticket_uuid = %uuid,
                        attempt,
                        "Release lost an etag race, re-reading"
                    );
                    if attempt < RELEASE_MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RELEASE_BACKOFF_MAX);
                    }
                }
            }
        }

        Err(Error::conflict(format!(
            "release of ticket {uuid} contended after {RELEASE_MAX_ATTEMPTS} attempts"
        )))
    }

    /// Deletes a ticket unconditionally.
    ///
    /// Pending local waiters are cancelled without being resolved; their
    /// waits surface as not-found.
    ///
    /// # Errors
    ///
    /// Returns `Error::ResourceNotFound` if no such ticket exists.
    pub async fn delete(&self, uuid: Uuid) -> Result<()> {
        // Existence check first so the caller gets not-found, not silence.
        let _ = self.load(uuid).await?;
        self.store.delete(TICKETS_BUCKET, &ticket_key(uuid)).await?;

        tracing::info!(ticket_uuid = %uuid, "Deleted waitlist ticket");
        self.waiters.cancel_all(uuid);
        self.poke.poke();
        Ok(())
    }

    /// Deletes every ticket for a server.
    ///
    /// Destructive; requires `force`. Returns the number of tickets
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns `Error::PreconditionFailed` when `force` is false.
    pub async fn delete_for_server(&self, server_uuid: Uuid, force: bool) -> Result<usize> {
        if !force {
            return Err(Error::PreconditionFailed {
                message: format!(
                    "refusing to delete all tickets for server {server_uuid} without force"
                ),
            });
        }

        let filter = Filter::new().eq(fields::SERVER_UUID, server_uuid.to_string());
        let records = self
            .store
            .find(TICKETS_BUCKET, &filter, &FindOptions::default())
            .await?;

        let mut deleted = 0;
        for record in &records {
            let ticket = TicketRecord::decode(record)?.ticket;
            self.store
                .delete(TICKETS_BUCKET, &ticket_key(ticket.uuid))
                .await?;
            self.waiters.cancel_all(ticket.uuid);
            deleted += 1;
        }

        tracing::info!(
            server_uuid = %server_uuid,
            deleted,
            "Deleted all waitlist tickets for server"
        );
        self.poke.poke();
        Ok(deleted)
    }

    /// Lists a server's tickets, terminal ones included.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for a limit outside
    /// `1..=MAX_LIST_LIMIT`.
    pub async fn list(&self, server_uuid: Uuid, options: &ListOptions) -> Result<Vec<Ticket>> {
        if options.limit == 0 || options.limit > MAX_LIST_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT} (got {})",
                options.limit
            )));
        }

        let filter = Filter::new().eq(fields::SERVER_UUID, server_uuid.to_string());
        let find = FindOptions {
            sort: vec![
                SortField {
                    field: options.attribute.clone(),
                    order: options.order,
                },
                SortField::asc(fields::UUID),
            ],
            limit: Some(options.limit),
            offset: options.offset,
        };

        let records = self.store.find(TICKETS_BUCKET, &filter, &find).await?;
        records
            .iter()
            .map(|record| Ok(TicketRecord::decode(record)?.ticket))
            .collect()
    }

    /// Registers a wait against a ticket.
    ///
    /// If the ticket is already `active`, `expired`, or `finished` the
    /// outcome is pre-resolved. Otherwise a waiter is registered and the
    /// status re-read once, so a promotion landing between the first read
    /// and registration cannot strand the caller.
    ///
    /// # Errors
    ///
    /// Returns `Error::ResourceNotFound` if no such ticket exists.
    pub async fn wait(&self, uuid: Uuid) -> Result<WaitOutcome> {
        let record = self.load(uuid).await?;
        if record.ticket.status != TicketStatus::Queued {
            return Ok(WaitOutcome::Resolved(record.ticket.status));
        }

        let waiter = self.waiters.register(uuid);

        let record = self.load(uuid).await?;
        if record.ticket.status != TicketStatus::Queued {
            return Ok(WaitOutcome::Resolved(record.ticket.status));
        }

        Ok(WaitOutcome::Pending(waiter))
    }

    async fn load(&self, uuid: Uuid) -> Result<TicketRecord> {
        match self.store.get(TICKETS_BUCKET, &ticket_key(uuid)).await {
            Ok(record) => TicketRecord::decode(&record),
            Err(Error::NotFound(_)) => Err(Error::resource_not_found("ticket", uuid)),
            Err(e) => Err(e),
        }
    }

    /// Reads the ordered queue snapshot for a ticket's queue.
    async fn queue_snapshot(&self, ticket: &Ticket) -> Result<Vec<Uuid>> {
        let filter = Filter::new()
            .eq(fields::SERVER_UUID, ticket.server_uuid.to_string())
            .eq(fields::SCOPE, ticket.scope.as_str())
            .eq(fields::ID, ticket.id.as_str())
            .one_of(fields::STATUS, vec![json!("queued"), json!("active")]);
        let options = FindOptions::sorted(vec![
            SortField::asc(fields::CREATED_AT),
            SortField::asc(fields::UUID),
        ]);

        let records = self.store.find(TICKETS_BUCKET, &filter, &options).await?;
        records
            .iter()
            .map(|record| Ok(TicketRecord::decode(record)?.ticket.uuid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use corral_core::MemoryStore;
    use serde_json::Map;

    fn manager() -> QueueManager {
        QueueManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(WaiterRegistry::new()),
            Poke::noop(),
        )
    }

    fn params(server_uuid: Uuid, scope: &str, id: &str) -> NewTicket {
        NewTicket {
            server_uuid,
            scope: scope.into(),
            id: id.into(),
            expires_at: Utc::now() + ChronoDuration::seconds(60),
            action: "provision".into(),
            extra: Map::new(),
            req_id: "req-1".into(),
        }
    }

    #[tokio::test]
    async fn test_create_returns_queue_in_order() {
        let manager = manager();
        let server = Uuid::new_v4();

        let (first, queue) = manager
            .create(params(server, "vm", "vm-1"))
            .await
            .expect("create first");
        assert_eq!(queue, vec![first]);

        let (second, queue) = manager
            .create(params(server, "vm", "vm-1"))
            .await
            .expect("create second");
        assert_eq!(queue, vec![first, second]);
    }

    #[tokio::test]
    async fn test_create_then_get_round_trips() {
        let manager = manager();
        let server = Uuid::new_v4();
        let mut p = params(server, "image", "img-9");
        p.extra
            .insert("origin".into(), serde_json::Value::String("cn-api".into()));
        let expires_at = p.expires_at;

        let (uuid, _) = manager.create(p).await.expect("create");
        let ticket = manager.get(uuid).await.expect("get");

        assert_eq!(ticket.scope, "image");
        assert_eq!(ticket.id, "img-9");
        assert_eq!(ticket.action, "provision");
        assert_eq!(ticket.extra["origin"], "cn-api");
        // Timestamps round to millis in storage.
        assert_eq!(ticket.expires_at.timestamp_millis(), expires_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_on_terminal() {
        let manager = manager();
        let server = Uuid::new_v4();
        let (uuid, _) = manager
            .create(params(server, "vm", "vm-1"))
            .await
            .expect("create");

        assert_eq!(
            manager.release(uuid).await.expect("first release"),
            TicketStatus::Finished
        );
        assert_eq!(
            manager.release(uuid).await.expect("second release"),
            TicketStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_release_unknown_is_not_found() {
        let manager = manager();
        let err = manager.release(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let manager = manager();
        let err = manager.delete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_for_server_requires_force() {
        let manager = manager();
        let server = Uuid::new_v4();
        manager
            .create(params(server, "vm", "vm-1"))
            .await
            .expect("create");

        let err = manager.delete_for_server(server, false).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));

        let deleted = manager
            .delete_for_server(server, true)
            .await
            .expect("forced delete");
        assert_eq!(deleted, 1);
        assert!(manager
            .list(server, &ListOptions::default())
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn test_list_rejects_oversized_limit() {
        let manager = manager();
        let options = ListOptions {
            limit: MAX_LIST_LIMIT + 1,
            ..ListOptions::default()
        };
        let err = manager.list(Uuid::new_v4(), &options).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_list_scopes_to_server() {
        let manager = manager();
        let server_a = Uuid::new_v4();
        let server_b = Uuid::new_v4();

        manager
            .create(params(server_a, "vm", "vm-1"))
            .await
            .expect("create a");
        manager
            .create(params(server_b, "vm", "vm-1"))
            .await
            .expect("create b");

        let tickets = manager
            .list(server_a, &ListOptions::default())
            .await
            .expect("list");
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].server_uuid, server_a);
    }

    #[tokio::test]
    async fn test_wait_unknown_is_not_found() {
        let manager = manager();
        let err = manager.wait(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_creation_stamps_are_strictly_increasing() {
        let manager = manager();
        let server = Uuid::new_v4();

        let mut previous = None;
        for _ in 0..5 {
            let (uuid, _) = manager
                .create(params(server, "vm", "vm-1"))
                .await
                .expect("create");
            let created_at = manager.get(uuid).await.expect("get").created_at;
            if let Some(previous) = previous {
                assert!(created_at > previous);
            }
            previous = Some(created_at);
        }
    }

    #[tokio::test]
    async fn test_wait_on_terminal_is_pre_resolved() {
        let manager = manager();
        let server = Uuid::new_v4();
        let (uuid, _) = manager
            .create(params(server, "vm", "vm-1"))
            .await
            .expect("create");
        manager.release(uuid).await.expect("release");

        match manager.wait(uuid).await.expect("wait") {
            WaitOutcome::Resolved(status) => assert_eq!(status, TicketStatus::Finished),
            WaitOutcome::Pending(_) => panic!("expected pre-resolved wait"),
        }
    }
}
