use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pool::{DripFactory, Lease, Pool, PoolError, PoolEvent, PoolEventKind, PoolOptions};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
#[error("mock failure")]
struct MockError;

#[derive(Default)]
struct MockFactory {
    created: AtomicU64,
    destroyed: AtomicUsize,
    fail: AtomicBool,
    events: Mutex<Vec<PoolEventKind>>,
}

#[async_trait]
impl DripFactory for MockFactory {
    type Conn = u64;
    type Error = MockError;

    async fn create(&self) -> Result<u64, MockError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MockError);
        }
        Ok(self.created.fetch_add(1, Ordering::SeqCst))
    }

    fn healthy(&self, _conn: &u64, err: Option<&MockError>) -> bool {
        err.is_none()
    }

    fn destroy(&self, _conn: &u64) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn notify(&self, event: &PoolEvent) {
        self.events.lock().push(event.kind);
    }
}

fn pool(max_drip: usize, max_used: usize) -> Pool<MockFactory> {
    Pool::new(MockFactory::default(), PoolOptions { max_drip, max_used })
}

async fn wait_for_waiters(pool: &Pool<MockFactory>, n: usize) {
    while pool.waiters() != n {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Checkout and balancing
// ============================================================================

#[tokio::test]
async fn test_released_drip_is_reused() {
    let pool = pool(2, 1);

    let lease = pool.try_get().await.unwrap();
    let first = *lease;
    lease.release(None);

    let lease = pool.try_get().await.unwrap();
    assert_eq!(*lease, first);
    assert_eq!(pool.factory().created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shares_drip_below_max_used_before_creating() {
    let pool = pool(2, 2);

    let a = pool.try_get().await.unwrap();
    let b = pool.try_get().await.unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(pool.len(), 1);

    // First drip is at its cap, so a second one is created.
    let c = pool.try_get().await.unwrap();
    assert_ne!(c.id(), a.id());
    assert_eq!(pool.len(), 2);

    // Least-used drip wins.
    let d = pool.try_get().await.unwrap();
    assert_eq!(d.id(), c.id());
    assert_eq!(pool.in_use(), 4);
}

#[tokio::test]
async fn test_zero_max_used_is_unbounded() {
    let pool = pool(1, 0);

    let leases = take_many(&pool, 100).await;
    assert_eq!(leases.len(), 100);
    assert_eq!(pool.len(), 1);
}

async fn take_many(pool: &Pool<MockFactory>, n: usize) -> Vec<Lease<MockFactory>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(pool.try_get().await.unwrap());
    }
    out
}

#[tokio::test]
async fn test_max_drip_clamped_to_one() {
    let pool = pool(0, 1);
    assert_eq!(pool.options().max_drip, 1);
    let _lease = pool.try_get().await.unwrap();
    assert!(matches!(pool.try_get().await, Err(PoolError::Full)));
}

// ============================================================================
// Saturation and waiting
// ============================================================================

#[tokio::test]
async fn test_full_without_waiting() {
    let pool = pool(2, 1);
    let _a = pool.try_get().await.unwrap();
    let _b = pool.try_get().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), pool.try_get())
        .await
        .expect("try_get must not block");
    assert!(matches!(result, Err(PoolError::Full)));
    assert_eq!(pool.len(), 2);
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let pool = pool(1, 1);
    let held = pool.try_get().await.unwrap();

    let (got_tx, mut got_rx) = mpsc::unbounded_channel();
    let mut releases = Vec::new();

    for (n, name) in ["first", "second"].into_iter().enumerate() {
        let p = pool.clone();
        let got_tx = got_tx.clone();
        let (release_tx, mut release_rx) = mpsc::unbounded_channel::<()>();
        releases.push(release_tx);
        tokio::spawn(async move {
            let lease = p.get(true, None).await.unwrap();
            got_tx.send(name).unwrap();
            release_rx.recv().await;
            lease.release(None);
        });
        wait_for_waiters(&pool, n + 1).await;
    }

    held.release(None);
    assert_eq!(got_rx.recv().await, Some("first"));
    assert_eq!(pool.waiters(), 1);

    releases[0].send(()).unwrap();
    assert_eq!(got_rx.recv().await, Some("second"));
    assert_eq!(pool.waiters(), 0);
    releases[1].send(()).unwrap();
}

#[tokio::test]
async fn test_newcomer_does_not_overtake_woken_waiter() {
    let pool = pool(1, 1);
    let held = pool.try_get().await.unwrap();
    let id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get(true, None).await.map(|l| l.id()) })
    };
    wait_for_waiters(&pool, 1).await;

    // The release hands the drip to the parked caller, not to whoever
    // asks next.
    held.release(None);
    assert!(matches!(pool.try_get().await, Err(PoolError::Full)));

    assert_eq!(waiter.await.unwrap().unwrap(), id);
    assert!(pool.try_get().await.is_ok());
}

#[tokio::test]
async fn test_newcomer_parks_behind_queue() {
    let pool = pool(1, 1);
    let held = pool.try_get().await.unwrap();

    let (got_tx, mut got_rx) = mpsc::unbounded_channel();
    for (n, name) in ["early", "late"].into_iter().enumerate() {
        let p = pool.clone();
        let got_tx = got_tx.clone();
        tokio::spawn(async move {
            let lease = p.get(true, None).await.unwrap();
            got_tx.send(name).unwrap();
            drop(lease);
        });
        wait_for_waiters(&pool, n + 1).await;
    }

    held.release(None);
    assert_eq!(got_rx.recv().await, Some("early"));
    assert_eq!(got_rx.recv().await, Some("late"));
    assert_eq!(pool.waiters(), 0);
}

#[tokio::test]
async fn test_spare_room_passed_to_next_waiter() {
    let pool = pool(2, 1);
    let a = pool.try_get().await.unwrap();
    let b = pool.try_get().await.unwrap();

    let mut waiters = Vec::new();
    for n in 0..2 {
        let p = pool.clone();
        waiters.push(tokio::spawn(async move { p.get(true, None).await.map(|l| l.id()) }));
        wait_for_waiters(&pool, n + 1).await;
    }

    // Both drips come back at once; each waiter gets one.
    a.release(Some(&MockError));
    b.release(None);
    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter must be served")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout() {
    let pool = pool(1, 1);
    let _held = pool.try_get().await.unwrap();

    let result = pool.get(true, Some(Duration::from_millis(100))).await;
    assert!(matches!(result, Err(PoolError::WaitTimeout)));
    assert!(result.unwrap_err().is_exhausted());
    assert_eq!(pool.waiters(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wait_succeeds_before_deadline() {
    let pool = pool(1, 1);
    let held = pool.try_get().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get(true, Some(Duration::from_secs(3))).await.map(|l| l.id()) })
    };
    wait_for_waiters(&pool, 1).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let id = held.id();
    held.release(None);

    assert_eq!(waiter.await.unwrap().unwrap(), id);
}

#[tokio::test]
async fn test_cancelled_waiter_passes_wakeup_on() {
    let pool = pool(1, 1);
    let held = pool.try_get().await.unwrap();

    let cancelled = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get(true, None).await.map(|l| l.id()) })
    };
    wait_for_waiters(&pool, 1).await;
    let survivor = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get(true, None).await.map(|l| l.id()) })
    };
    wait_for_waiters(&pool, 2).await;

    cancelled.abort();
    let _ = cancelled.await;
    held.release(None);

    let id = tokio::time::timeout(Duration::from_secs(5), survivor)
        .await
        .expect("survivor must be woken")
        .unwrap()
        .unwrap();
    assert_eq!(id, 0);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_unhealthy_idle_drip_destroyed() {
    let pool = pool(1, 1);

    let lease = pool.try_get().await.unwrap();
    let broken = lease.id();
    lease.release(Some(&MockError));

    assert_eq!(pool.len(), 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);

    let lease = pool.try_get().await.unwrap();
    assert_ne!(lease.id(), broken);

    let events = pool.factory().events.lock().clone();
    assert_eq!(
        events,
        vec![
            PoolEventKind::NewDrip,
            PoolEventKind::RemoveDrip,
            PoolEventKind::DestroyDrip,
            PoolEventKind::NewDrip,
        ]
    );
}

#[tokio::test]
async fn test_unhealthy_busy_drip_destroyed_at_last_release() {
    let pool = pool(2, 2);

    let a = pool.try_get().await.unwrap();
    let b = pool.try_get().await.unwrap();
    let broken = a.id();
    assert_eq!(broken, b.id());

    a.release(Some(&MockError));
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 0);

    // The evicted drip is never handed out again.
    let c = pool.try_get().await.unwrap();
    assert_ne!(c.id(), broken);

    b.release(None);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.len(), 1);
}

#[tokio::test]
async fn test_dropped_lease_released_healthy() {
    let pool = pool(1, 1);
    {
        let _lease = pool.try_get().await.unwrap();
        assert_eq!(pool.in_use(), 1);
    }
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.len(), 1);
    assert!(pool.try_get().await.is_ok());
}

#[tokio::test]
async fn test_create_failure() {
    let pool = pool(1, 1);
    pool.factory().fail.store(true, Ordering::SeqCst);

    let result = pool.try_get().await;
    assert!(matches!(result, Err(PoolError::Create(MockError))));
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.factory().events.lock().as_slice(), &[PoolEventKind::NewDripFailure]);

    // The reserved slot was given back.
    pool.factory().fail.store(false, Ordering::SeqCst);
    assert!(pool.try_get().await.is_ok());
}

// ============================================================================
// Close
// ============================================================================

#[tokio::test]
async fn test_close_destroys_idle_drips() {
    let pool = pool(1, 1);
    pool.try_get().await.unwrap().release(None);

    pool.close();
    assert!(pool.is_closed());
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    assert!(matches!(pool.try_get().await, Err(PoolError::Closed)));
    assert_eq!(pool.factory().events.lock().last(), Some(&PoolEventKind::Closed));
}

#[tokio::test]
async fn test_close_fails_waiters_and_defers_busy_drips() {
    let pool = pool(2, 1);
    let a = pool.try_get().await.unwrap();
    let b = pool.try_get().await.unwrap();

    let blocked = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get(true, None).await.map(|l| l.id()) })
    };
    wait_for_waiters(&pool, 1).await;

    pool.close();
    assert!(matches!(blocked.await.unwrap(), Err(PoolError::Closed)));
    assert_eq!(pool.waiters(), 0);

    // Busy drips survive until their lease comes back.
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 0);
    a.release(None);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    drop(b);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.factory().events.lock().last(), Some(&PoolEventKind::DestroyDrip));
}
