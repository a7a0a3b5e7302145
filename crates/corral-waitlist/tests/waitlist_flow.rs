//! End-to-end waitlist flows over the in-memory store.
//!
//! These tests drive the director deterministically via `sweep()` where
//! ordering matters, and through a spawned sweep loop where liveness is
//! the point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Map;
use uuid::Uuid;

use corral_core::{KvStore, MemoryStore};
use corral_waitlist::{
    Director, DirectorConfig, ListOptions, NewTicket, QueueManager, TicketStatus, WaitOutcome,
    WaiterRegistry,
};

struct Harness {
    manager: Arc<QueueManager>,
    director: Director,
}

fn harness() -> Harness {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let waiters = Arc::new(WaiterRegistry::new());
    let (director, poke) = Director::new(store.clone(), waiters.clone(), DirectorConfig::default());
    let manager = Arc::new(QueueManager::new(store, waiters, poke));
    Harness { manager, director }
}

fn ticket(server: Uuid, scope: &str, id: &str, ttl_ms: i64) -> NewTicket {
    NewTicket {
        server_uuid: server,
        scope: scope.into(),
        id: id.into(),
        expires_at: Utc::now() + ChronoDuration::milliseconds(ttl_ms),
        action: "provision".into(),
        extra: Map::new(),
        req_id: "req-test".into(),
    }
}

#[tokio::test]
async fn basic_fifo_promotion_and_release() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (t1, queue) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    assert_eq!(queue, vec![t1]);
    let (t2, queue) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    assert_eq!(queue, vec![t1, t2]);

    h.director.sweep().await?;
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Active);
    assert_eq!(h.manager.get(t2).await?.status, TicketStatus::Queued);

    h.manager.release(t1).await?;
    h.director.sweep().await?;
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Finished);
    assert_eq!(h.manager.get(t2).await?.status, TicketStatus::Active);
    Ok(())
}

#[tokio::test]
async fn fifo_order_is_stable_across_releases() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let mut created = Vec::new();
    for _ in 0..3 {
        let (uuid, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
        created.push(uuid);
    }

    // Drain the queue; promotion must follow creation order.
    for expected in &created {
        h.director.sweep().await?;
        let active: Vec<Uuid> = h
            .manager
            .list(server, &ListOptions::default())
            .await?
            .into_iter()
            .filter(|t| t.status == TicketStatus::Active)
            .map(|t| t.uuid)
            .collect();
        assert_eq!(active, vec![*expected]);
        h.manager.release(*expected).await?;
    }
    Ok(())
}

#[tokio::test]
async fn expiry_takes_the_head_and_promotes_the_next() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (t1, _) = h.manager.create(ticket(server, "vm", "a", 40)).await?;
    let (t2, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;

    h.director.sweep().await?;
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Active);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let stats = h.director.sweep().await?;
    assert_eq!(stats.expired, 1);
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Expired);
    assert_eq!(h.manager.get(t2).await?.status, TicketStatus::Active);
    Ok(())
}

#[tokio::test]
async fn queued_ticket_past_deadline_expires_without_activation() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (t1, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (t2, _) = h.manager.create(ticket(server, "vm", "a", 40)).await?;

    h.director.sweep().await?;
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.director.sweep().await?;

    // t2 expired while queued; t1 still holds the queue untouched.
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Active);
    assert_eq!(h.manager.get(t2).await?.status, TicketStatus::Expired);
    Ok(())
}

#[tokio::test]
async fn scopes_and_ids_partition_queues() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (vm_a, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (vm_b, _) = h.manager.create(ticket(server, "vm", "b", 60_000)).await?;
    let (img_a, _) = h
        .manager
        .create(ticket(server, "image", "a", 60_000))
        .await?;

    let stats = h.director.sweep().await?;
    assert_eq!(stats.promoted, 3);
    for uuid in [vm_a, vm_b, img_a] {
        assert_eq!(h.manager.get(uuid).await?.status, TicketStatus::Active);
    }
    Ok(())
}

#[tokio::test]
async fn terminal_statuses_are_immutable() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (t1, _) = h.manager.create(ticket(server, "vm", "a", 40)).await?;
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.director.sweep().await?;
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Expired);

    // Release on an expired ticket is a no-op reporting the terminal state.
    assert_eq!(h.manager.release(t1).await?, TicketStatus::Expired);
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Expired);

    // Further sweeps never resurrect it.
    h.director.sweep().await?;
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Expired);
    Ok(())
}

#[tokio::test]
async fn concurrent_releases_never_double_promote() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (t1, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (t2, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (t3, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    h.director.sweep().await?;

    let m1 = h.manager.clone();
    let m2 = h.manager.clone();
    let (r1, r2) = tokio::join!(m1.release(t1), m2.release(t1));

    // One writer wins; the other observes the terminal record (no-op
    // success) or exhausts its retry budget. Either way t1 is finished.
    for outcome in [r1, r2] {
        match outcome {
            Ok(status) => assert_eq!(status, TicketStatus::Finished),
            Err(e) => assert!(matches!(e, corral_core::Error::Conflict { .. })),
        }
    }
    assert_eq!(h.manager.get(t1).await?.status, TicketStatus::Finished);

    h.director.sweep().await?;
    let statuses: Vec<TicketStatus> = vec![
        h.manager.get(t2).await?.status,
        h.manager.get(t3).await?.status,
    ];
    assert_eq!(statuses, vec![TicketStatus::Active, TicketStatus::Queued]);
    Ok(())
}

#[tokio::test]
async fn release_of_queued_ticket_leaves_queue_intact() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (t1, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (t2, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (t3, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    h.director.sweep().await?;

    // Abandon the middle of the queue before it ever activates.
    assert_eq!(h.manager.release(t2).await?, TicketStatus::Finished);

    h.manager.release(t1).await?;
    h.director.sweep().await?;
    assert_eq!(h.manager.get(t3).await?.status, TicketStatus::Active);
    Ok(())
}

#[tokio::test]
async fn waiters_resolve_on_promotion_and_expiry() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    let (t1, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (t2, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    h.director.sweep().await?;

    let WaitOutcome::Pending(waiter) = h.manager.wait(t2).await? else {
        panic!("t2 should still be queued");
    };

    // Pre-resolved path: t1 is already active.
    let WaitOutcome::Resolved(status) = h.manager.wait(t1).await? else {
        panic!("t1 wait should pre-resolve");
    };
    assert_eq!(status, TicketStatus::Active);

    h.manager.release(t1).await?;
    h.director.sweep().await?;
    assert_eq!(waiter.wait().await?, TicketStatus::Active);

    // Expiry resolves waiters the same way.
    let (t3, _) = h.manager.create(ticket(server, "vm", "other", 40)).await?;
    let WaitOutcome::Pending(expiry_waiter) = h.manager.wait(t3).await? else {
        panic!("t3 should still be queued");
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.director.sweep().await?;
    assert_eq!(expiry_waiter.wait().await?, TicketStatus::Expired);
    Ok(())
}

#[tokio::test]
async fn spawned_director_resolves_waits_without_manual_sweeps() -> Result<()> {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let waiters = Arc::new(WaiterRegistry::new());
    let (director, poke) = Director::new(
        store.clone(),
        waiters.clone(),
        DirectorConfig {
            sweep_interval: Duration::from_millis(20),
        },
    );
    let manager = Arc::new(QueueManager::new(store, waiters, poke));
    let handle = director.spawn();

    let server = Uuid::new_v4();
    let (t1, _) = manager.create(ticket(server, "vm", "a", 60_000)).await?;

    let outcome = manager.wait(t1).await?;
    let status = match outcome {
        WaitOutcome::Resolved(status) => status,
        WaitOutcome::Pending(waiter) => {
            tokio::time::timeout(Duration::from_millis(500), waiter.wait()).await??
        }
    };
    assert_eq!(status, TicketStatus::Active);

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn waiters_resolve_when_another_process_releases() -> Result<()> {
    // Two control-plane processes sharing one store: each has its own
    // manager, registry, and director.
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

    let waiters_a = Arc::new(WaiterRegistry::new());
    let (director_a, poke_a) =
        Director::new(store.clone(), waiters_a.clone(), DirectorConfig::default());
    let manager_a = QueueManager::new(store.clone(), waiters_a, poke_a);

    let waiters_b = Arc::new(WaiterRegistry::new());
    let (director_b, poke_b) =
        Director::new(store.clone(), waiters_b.clone(), DirectorConfig::default());
    let manager_b = QueueManager::new(store.clone(), waiters_b, poke_b);

    let server = Uuid::new_v4();
    let (t1, _) = manager_a.create(ticket(server, "vm", "a", 60_000)).await?;
    director_a.sweep().await?;

    // Process B blocks on a still-queued ticket.
    let (t2, _) = manager_b.create(ticket(server, "vm", "a", 60_000)).await?;
    let WaitOutcome::Pending(waiter) = manager_b.wait(t2).await? else {
        panic!("t2 should still be queued");
    };

    // Process A releases both tickets; B never fires locally.
    manager_a.release(t1).await?;
    manager_a.release(t2).await?;

    director_b.sweep().await?;
    assert_eq!(waiter.wait().await?, TicketStatus::Finished);
    Ok(())
}

#[tokio::test]
async fn delete_cancels_pending_waiters() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();

    // Occupy the queue so the second ticket stays queued.
    let (_t1, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    let (t2, _) = h.manager.create(ticket(server, "vm", "a", 60_000)).await?;
    h.director.sweep().await?;

    let WaitOutcome::Pending(waiter) = h.manager.wait(t2).await? else {
        panic!("t2 should still be queued");
    };

    h.manager.delete(t2).await?;
    let err = waiter.wait().await.unwrap_err();
    assert!(matches!(err, corral_core::Error::NotFound(_)));
    Ok(())
}

#[tokio::test]
async fn force_delete_clears_every_queue_for_the_server() -> Result<()> {
    let h = harness();
    let server = Uuid::new_v4();
    let other = Uuid::new_v4();

    for id in ["a", "b", "c"] {
        h.manager.create(ticket(server, "vm", id, 60_000)).await?;
    }
    let (kept, _) = h.manager.create(ticket(other, "vm", "a", 60_000)).await?;

    let deleted = h.manager.delete_for_server(server, true).await?;
    assert_eq!(deleted, 3);
    assert!(h
        .manager
        .list(server, &ListOptions::default())
        .await?
        .is_empty());

    // Other servers' tickets are untouched.
    assert_eq!(h.manager.get(kept).await?.uuid, kept);
    Ok(())
}
