//! The waitlist director.
//!
//! One director runs per control-plane process. It periodically scans the
//! non-terminal tickets in the store, expires overdue ones, promotes the
//! head of each idle queue to `active`, and resolves local waiters.
//!
//! The director never assumes it is alone: other processes run their own
//! directors against the same store, coordinating only through etag-guarded
//! writes. A lost write race means another director already handled the
//! ticket; the next sweep re-observes the store and converges.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

use corral_core::observability::director_span;
use corral_core::{
    Error, Filter, FindOptions, KvStore, PutPrecondition, PutResult, Result, SortField,
};

use crate::ticket::{TicketRecord, TicketStatus, TICKETS_BUCKET, fields, ticket_key};
use crate::waiters::WaiterRegistry;

/// Default sweep cadence.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const SWEEPS_TOTAL: &str = "waitlist_director_sweeps_total";
const PROMOTIONS_TOTAL: &str = "waitlist_director_promotions_total";
const EXPIRATIONS_TOTAL: &str = "waitlist_director_expirations_total";
const SWEEP_CONFLICTS_TOTAL: &str = "waitlist_director_conflicts_total";

/// Director configuration.
#[derive(Debug, Clone)]
pub struct DirectorConfig {
    /// Interval between sweeps.
    pub sweep_interval: Duration,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Handle for nudging the director into an early sweep.
///
/// Pokes coalesce: while a sweep is already pending, further pokes are
/// dropped.
#[derive(Debug, Clone)]
pub struct Poke(mpsc::Sender<()>);

impl Poke {
    /// Requests a prompt sweep (best-effort).
    pub fn poke(&self) {
        let _ = self.0.try_send(());
    }

    /// A poke handle connected to nothing, for components wired without a
    /// director (tests, offline tooling).
    #[must_use]
    pub fn noop() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self(tx)
    }
}

/// Counters from a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Non-terminal tickets observed.
    pub scanned: usize,
    /// Tickets transitioned to `expired`.
    pub expired: usize,
    /// Tickets promoted to `active`.
    pub promoted: usize,
    /// Etag races lost to concurrent writers.
    pub conflicts: usize,
}

/// The per-process waitlist director.
pub struct Director {
    store: Arc<dyn KvStore>,
    waiters: Arc<WaiterRegistry>,
    config: DirectorConfig,
    poke_tx: Poke,
    poke_rx: mpsc::Receiver<()>,
}

impl Director {
    /// Creates a director and the poke handle wired to it.
    #[must_use]
    pub fn new(
        store: Arc<dyn KvStore>,
        waiters: Arc<WaiterRegistry>,
        config: DirectorConfig,
    ) -> (Self, Poke) {
        let (tx, rx) = mpsc::channel(1);
        let poke = Poke(tx);
        let director = Self {
            store,
            waiters,
            config,
            poke_tx: poke.clone(),
            poke_rx: rx,
        };
        (director, poke)
    }

    /// Runs one sweep over all non-terminal tickets.
    ///
    /// Public so tests and operational tooling can drive the director
    /// deterministically instead of racing the clock.
    ///
    /// # Errors
    ///
    /// Returns store and decode errors; etag races are counted, not
    /// errors.
    pub async fn sweep(&self) -> Result<SweepStats> {
        self.sweep_once().instrument(director_span("sweep")).await
    }

    async fn sweep_once(&self) -> Result<SweepStats> {
        metrics::counter!(SWEEPS_TOTAL).increment(1);

        let filter =
            Filter::new().one_of(fields::STATUS, vec![json!("queued"), json!("active")]);
        let options = FindOptions::sorted(vec![
            SortField::asc(fields::SERVER_UUID),
            SortField::asc(fields::SCOPE),
            SortField::asc(fields::ID),
            SortField::asc(fields::CREATED_AT),
            SortField::asc(fields::UUID),
        ]);
        let records = self.store.find(TICKETS_BUCKET, &filter, &options).await?;

        let mut stats = SweepStats {
            scanned: records.len(),
            ..SweepStats::default()
        };
        let now = Utc::now();

        // Partition into queues; records arrive sorted by queue key.
        let mut queues: Vec<Vec<TicketRecord>> = Vec::new();
        let mut observed: HashSet<Uuid> = HashSet::with_capacity(records.len());
        let mut last_key = None;
        for record in &records {
            let decoded = TicketRecord::decode(record)?;
            observed.insert(decoded.ticket.uuid);
            let key = decoded.ticket.queue_key();
            if last_key.as_ref() == Some(&key) {
                if let Some(members) = queues.last_mut() {
                    members.push(decoded);
                }
            } else {
                last_key = Some(key);
                queues.push(vec![decoded]);
            }
        }

        for mut members in queues {
            let mut dirty = false;

            // Expire overdue tickets first so an expired head does not
            // block promotion within the same sweep.
            for member in &mut members {
                if member.ticket.status != TicketStatus::Expired
                    && member.ticket.is_expired_at(now)
                {
                    match self.try_transition(member, TicketStatus::Expired, now).await? {
                        Some(updated) => {
                            stats.expired += 1;
                            metrics::counter!(EXPIRATIONS_TOTAL).increment(1);
                            self.waiters.fire(updated.ticket.uuid, TicketStatus::Expired);
                            *member = updated;
                        }
                        None => {
                            stats.conflicts += 1;
                            dirty = true;
                        }
                    }
                }
            }

            // A lost race means this queue's view is stale; re-observe it
            // next sweep rather than promoting against stale state.
            if dirty {
                continue;
            }

            let has_active = members
                .iter()
                .any(|m| m.ticket.status == TicketStatus::Active);
            if has_active {
                continue;
            }

            if let Some(head) = members
                .iter()
                .find(|m| m.ticket.status == TicketStatus::Queued)
            {
                match self.try_transition(head, TicketStatus::Active, now).await? {
                    Some(updated) => {
                        stats.promoted += 1;
                        metrics::counter!(PROMOTIONS_TOTAL).increment(1);
                        tracing::debug!(
                            ticket_uuid = %updated.ticket.uuid,
                            queue = %updated.ticket.queue_key(),
                            "Promoted queue head to active"
                        );
                        self.waiters.fire(updated.ticket.uuid, TicketStatus::Active);
                    }
                    None => {
                        stats.conflicts += 1;
                    }
                }
            }
        }

        self.reconcile_absent_waiters(&observed).await?;

        Ok(stats)
    }

    /// Resolves local waiters whose tickets left the non-terminal view.
    ///
    /// A ticket released by another process reaches `finished` without any
    /// local fire; a ticket deleted elsewhere disappears entirely. Both
    /// would strand local waiters until the caller disconnected.
    async fn reconcile_absent_waiters(&self, observed: &HashSet<Uuid>) -> Result<()> {
        for uuid in self.waiters.pending_tickets() {
            if observed.contains(&uuid) {
                continue;
            }
            match self.store.get(TICKETS_BUCKET, &ticket_key(uuid)).await {
                Ok(record) => {
                    let decoded = TicketRecord::decode(&record)?;
                    if decoded.ticket.status.is_terminal() {
                        self.waiters.fire(uuid, decoded.ticket.status);
                    }
                    // A non-terminal ticket here was created after the
                    // sweep's find; the next sweep observes it.
                }
                Err(Error::NotFound(_)) => {
                    self.waiters.cancel_all(uuid);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Spawns the sweep loop and returns its lifecycle handle.
    ///
    /// The loop runs one sweep immediately to catch up on expirations
    /// incurred while the process was down, then sweeps on the configured
    /// cadence and on pokes. Dropping the handle stops the loop.
    #[must_use]
    pub fn spawn(self) -> DirectorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let poke = self.poke_tx.clone();
        let task = tokio::spawn(self.run(stop_rx));

        DirectorHandle {
            poke,
            stop: stop_tx,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; fold it into the startup
        // sweep.
        ticker.tick().await;

        tracing::info!(
            interval = ?self.config.sweep_interval,
            "Waitlist director started"
        );
        self.sweep_logged().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.poke_rx.recv() => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.sweep_logged().await;
        }

        tracing::info!("Waitlist director stopped");
    }

    async fn sweep_logged(&self) {
        match self.sweep().await {
            Ok(stats) if stats.expired > 0 || stats.promoted > 0 || stats.conflicts > 0 => {
                tracing::info!(
                    scanned = stats.scanned,
                    expired = stats.expired,
                    promoted = stats.promoted,
                    conflicts = stats.conflicts,
                    "Waitlist sweep completed"
                );
            }
            Ok(stats) => {
                tracing::debug!(scanned = stats.scanned, "Waitlist sweep completed");
            }
            Err(e) => {
                tracing::error!(error = %e, "Waitlist sweep failed");
            }
        }
    }

    /// Attempts an etag-guarded status transition.
    ///
    /// Returns the updated record, or `None` when a concurrent writer won
    /// the race.
    async fn try_transition(
        &self,
        record: &TicketRecord,
        to: TicketStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<TicketRecord>> {
        let mut ticket = record.ticket.clone();
        ticket.transition(to, now)?;

        match self
            .store
            .put(
                TICKETS_BUCKET,
                &ticket_key(ticket.uuid),
                ticket.encode()?,
                PutPrecondition::MatchesEtag(record.etag.clone()),
            )
            .await?
        {
            PutResult::Stored { etag } => Ok(Some(TicketRecord { ticket, etag })),
            PutResult::EtagMismatch { .. } => {
                metrics::counter!(SWEEP_CONFLICTS_TOTAL).increment(1);
                tracing::debug!(
                    ticket_uuid = %record.ticket.uuid,
                    to = %to,
                    "Sweep transition lost an etag race"
                );
                Ok(None)
            }
        }
    }
}

/// Lifecycle handle for a spawned director.
///
/// Dropping the handle stops the sweep loop.
#[derive(Debug)]
pub struct DirectorHandle {
    poke: Poke,
    stop: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DirectorHandle {
    /// Requests a prompt sweep (best-effort).
    pub fn poke(&self) {
        self.poke.poke();
    }

    /// Returns a poke handle for wiring into collaborators.
    #[must_use]
    pub fn poker(&self) -> Poke {
        self.poke.clone()
    }

    /// Signals the sweep loop to stop without waiting for it.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stops the sweep loop and waits for it to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueManager;
    use crate::ticket::NewTicket;
    use chrono::Duration as ChronoDuration;
    use corral_core::MemoryStore;
    use serde_json::Map;
    use uuid::Uuid;

    fn fixture() -> (Arc<dyn KvStore>, QueueManager, Director) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let waiters = Arc::new(WaiterRegistry::new());
        let (director, poke) =
            Director::new(store.clone(), waiters.clone(), DirectorConfig::default());
        let manager = QueueManager::new(store.clone(), waiters, poke);
        (store, manager, director)
    }

    fn params(server_uuid: Uuid, scope: &str, id: &str, ttl_secs: i64) -> NewTicket {
        NewTicket {
            server_uuid,
            scope: scope.into(),
            id: id.into(),
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs),
            action: String::new(),
            extra: Map::new(),
            req_id: String::new(),
        }
    }

    #[tokio::test]
    async fn test_sweep_promotes_only_the_head() {
        let (_store, manager, director) = fixture();
        let server = Uuid::new_v4();

        let (first, _) = manager
            .create(params(server, "vm", "a", 60))
            .await
            .expect("create first");
        let (second, _) = manager
            .create(params(server, "vm", "a", 60))
            .await
            .expect("create second");

        let stats = director.sweep().await.expect("sweep");
        assert_eq!(stats.promoted, 1);

        assert_eq!(
            manager.get(first).await.expect("get").status,
            TicketStatus::Active
        );
        assert_eq!(
            manager.get(second).await.expect("get").status,
            TicketStatus::Queued
        );

        // A second sweep changes nothing while the head is held.
        let stats = director.sweep().await.expect("sweep");
        assert_eq!(stats, SweepStats { scanned: 2, ..SweepStats::default() });
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue_and_promotes_successor() {
        let (store, manager, director) = fixture();
        let server = Uuid::new_v4();

        let (first, _) = manager
            .create(params(server, "vm", "a", 60))
            .await
            .expect("create first");
        let (second, _) = manager
            .create(params(server, "vm", "a", 60))
            .await
            .expect("create second");

        director.sweep().await.expect("sweep");

        // Force the active head past its deadline.
        rewind_expiry(&store, &manager, first).await;

        let stats = director.sweep().await.expect("sweep");
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.promoted, 1);
        assert_eq!(
            manager.get(first).await.expect("get").status,
            TicketStatus::Expired
        );
        assert_eq!(
            manager.get(second).await.expect("get").status,
            TicketStatus::Active
        );
    }

    #[tokio::test]
    async fn test_independent_queues_promote_independently() {
        let (_store, manager, director) = fixture();
        let server = Uuid::new_v4();

        let (a, _) = manager
            .create(params(server, "vm", "a", 60))
            .await
            .expect("create a");
        let (b, _) = manager
            .create(params(server, "vm", "b", 60))
            .await
            .expect("create b");

        let stats = director.sweep().await.expect("sweep");
        assert_eq!(stats.promoted, 2);
        assert_eq!(
            manager.get(a).await.expect("get").status,
            TicketStatus::Active
        );
        assert_eq!(
            manager.get(b).await.expect("get").status,
            TicketStatus::Active
        );
    }

    /// Rewrites a ticket's expiry into the past, bypassing the manager.
    async fn rewind_expiry(store: &Arc<dyn KvStore>, manager: &QueueManager, uuid: Uuid) {
        let mut rewritten = manager.get(uuid).await.expect("get");
        rewritten.expires_at = Utc::now() - ChronoDuration::seconds(1);
        store
            .put(
                TICKETS_BUCKET,
                &ticket_key(uuid),
                rewritten.encode().expect("encode"),
                PutPrecondition::None,
            )
            .await
            .expect("rewrite");
    }
}
