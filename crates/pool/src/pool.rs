//! The pool and its leases.
//!
//! # Architecture
//!
//! - Live drips sit in a priority queue keyed by use-count, so the least-used
//!   drip is always at the top (ties go to the oldest drip)
//! - Callers that find every drip saturated park on a per-waiter one-shot
//!   channel; a release wakes exactly the earliest parked caller
//! - Unhealthy drips leave the queue immediately and are destroyed when
//!   their last lease comes back
//!
//! One mutex guards the queue, the drip table and the waiter queue. It is
//! never held across an `.await`, and factory callbacks run outside it.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::PoolError;
use crate::event::{PoolEvent, PoolEventKind};
use crate::factory::DripFactory;

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum number of live drips. Clamped to at least one.
    pub max_drip: usize,
    /// Maximum concurrent leases per drip. Zero means unbounded.
    pub max_used: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_drip: 10,
            max_used: 50,
        }
    }
}

/// Balancing key: fewest uses first, then oldest drip.
type Rank = (Reverse<usize>, Reverse<u64>);

fn rank(id: u64, used: usize) -> Rank {
    (Reverse(used), Reverse(id))
}

struct Drip<C> {
    conn: Arc<C>,
    used: usize,
    /// False once evicted from the balancing queue.
    live: bool,
}

struct State<C> {
    drips: HashMap<u64, Drip<C>>,
    balance: PriorityQueue<u64, Rank>,
    next_drip: u64,
    /// Creations in flight; they count against `max_drip`.
    creating: usize,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
    /// Waiters signalled but not yet back for their drip.
    woken: usize,
    next_ticket: u64,
    closed: bool,
}

impl<C> State<C> {
    /// Wakes the earliest waiter still listening.
    fn wake_one(&mut self) -> bool {
        while let Some((_, tx)) = self.waiters.pop_front() {
            if tx.send(()).is_ok() {
                self.woken += 1;
                return true;
            }
        }
        false
    }

    /// True when a checkout or a creation could succeed right now.
    fn has_room(&self, options: &PoolOptions) -> bool {
        let free = match self.balance.peek() {
            Some((_, &(Reverse(used), _))) => options.max_used == 0 || used < options.max_used,
            None => false,
        };
        free || self.balance.len() + self.creating < options.max_drip
    }

    /// Hands leftover room to the next waiter once a caller has been served.
    fn pass_on(&mut self, options: &PoolOptions) {
        if !self.waiters.is_empty() && self.has_room(options) {
            self.wake_one();
        }
    }
}

struct Shared<F: DripFactory> {
    factory: F,
    options: PoolOptions,
    state: Mutex<State<F::Conn>>,
}

impl<F: DripFactory> Shared<F> {
    fn emit(&self, event: PoolEvent) {
        metrics::counter!("pool_events_total", "event" => event.kind.as_str()).increment(1);
        debug!(event = %event, "pool event");
        self.factory.notify(&event);
    }

    fn release(&self, id: u64, err: Option<&F::Error>) {
        let mut events = Vec::with_capacity(2);
        let destroyed = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(drip) = state.drips.get_mut(&id) else {
                return;
            };
            drip.used = drip.used.saturating_sub(1);
            let used = drip.used;

            if drip.live {
                if !state.closed && self.factory.healthy(&drip.conn, err) {
                    state.balance.change_priority(&id, rank(id, used));
                } else {
                    drip.live = false;
                    state.balance.remove(&id);
                    events.push(PoolEvent::new(PoolEventKind::RemoveDrip, Some(id), state.balance.len()));
                }
            }

            let destroyed = if !drip.live && used == 0 {
                state.drips.remove(&id).map(|d| d.conn)
            } else {
                None
            };
            state.wake_one();
            destroyed.map(|conn| (conn, state.balance.len()))
        };

        if let Some((conn, drip_count)) = destroyed {
            self.factory.destroy(&conn);
            events.push(PoolEvent::new(PoolEventKind::DestroyDrip, Some(id), drip_count));
        }
        for event in events {
            self.emit(event);
        }
    }
}

enum Step<F: DripFactory> {
    Ready(Lease<F>),
    Create,
    Park(u64, oneshot::Receiver<()>),
}

/// Health-aware, load-balancing pool of connections to one endpoint.
///
/// Cloning a `Pool` yields another handle to the same pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::new(factory, PoolOptions { max_drip: 4, max_used: 8 });
///
/// // Wait at most 3 seconds for a free connection.
/// let lease = pool.get(true, Some(Duration::from_secs(3))).await?;
/// let result = lease.call(request).await;
///
/// // Report the outcome so broken connections get evicted.
/// lease.release(result.as_ref().err());
/// ```
pub struct Pool<F: DripFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: DripFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: DripFactory> Pool<F> {
    pub fn new(factory: F, options: PoolOptions) -> Self {
        let options = PoolOptions {
            max_drip: options.max_drip.max(1),
            ..options
        };
        Self {
            shared: Arc::new(Shared {
                factory,
                options,
                state: Mutex::new(State {
                    drips: HashMap::with_capacity(options.max_drip),
                    balance: PriorityQueue::with_capacity(options.max_drip),
                    next_drip: 0,
                    creating: 0,
                    waiters: VecDeque::new(),
                    woken: 0,
                    next_ticket: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    pub fn options(&self) -> PoolOptions {
        self.shared.options
    }

    /// Number of live drips.
    pub fn len(&self) -> usize {
        self.shared.state.lock().balance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of callers parked waiting for a drip.
    pub fn waiters(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }

    /// Leases currently out, evicted drips included.
    pub fn in_use(&self) -> usize {
        self.shared.state.lock().drips.values().map(|d| d.used).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Non-blocking checkout: fails with `PoolError::Full` when saturated.
    pub async fn try_get(&self) -> Result<Lease<F>, PoolError<F::Error>> {
        self.get(false, None).await
    }

    /// Checks out a drip.
    ///
    /// 1. Lease the least-used live drip if it is below `max_used`
    /// 2. Otherwise create a new drip if fewer than `max_drip` are live
    /// 3. Otherwise fail with `Full` when `wait` is false, or park FIFO until
    ///    a release (bounded by `timeout` when given, `WaitTimeout` after it)
    ///
    /// A new caller never overtakes parked ones: while anyone is parked or
    /// woken but not yet served, it goes straight to step 3.
    pub async fn get(&self, wait: bool, timeout: Option<Duration>) -> Result<Lease<F>, PoolError<F::Error>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let options = self.shared.options;
        let mut requeue = None;

        loop {
            let step = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                let first_in_line = if requeue.is_some() {
                    state.woken = state.woken.saturating_sub(1);
                    true
                } else {
                    state.waiters.is_empty() && state.woken == 0
                };

                let lease = if first_in_line { self.checkout(&mut state) } else { None };
                if let Some(lease) = lease {
                    state.pass_on(&options);
                    Step::Ready(lease)
                } else if first_in_line && state.balance.len() + state.creating < options.max_drip {
                    state.creating += 1;
                    state.pass_on(&options);
                    Step::Create
                } else if !wait {
                    return Err(PoolError::Full);
                } else {
                    let (tx, rx) = oneshot::channel();
                    // A woken caller that lost the race keeps its place in line.
                    let ticket = match requeue.take() {
                        Some(ticket) => {
                            state.waiters.push_front((ticket, tx));
                            ticket
                        }
                        None => {
                            let ticket = state.next_ticket;
                            state.next_ticket += 1;
                            state.waiters.push_back((ticket, tx));
                            ticket
                        }
                    };
                    Step::Park(ticket, rx)
                }
            };

            match step {
                Step::Ready(lease) => return Ok(lease),
                Step::Create => return self.create().await,
                Step::Park(ticket, rx) => {
                    if self.park(ticket, rx, deadline).await? {
                        requeue = Some(ticket);
                    }
                }
            }
        }
    }

    fn checkout(&self, state: &mut State<F::Conn>) -> Option<Lease<F>> {
        let (&id, &(Reverse(used), _)) = state.balance.peek()?;
        let max_used = self.shared.options.max_used;
        if max_used > 0 && used >= max_used {
            return None;
        }
        let drip = state.drips.get_mut(&id)?;
        drip.used += 1;
        let conn = Arc::clone(&drip.conn);
        state.balance.change_priority(&id, rank(id, used + 1));
        Some(Lease::new(Arc::clone(&self.shared), id, conn))
    }

    /// Returns `true` when woken by a release, `false` when the pool dropped
    /// the waiter queue (closing).
    async fn park(
        &self,
        ticket: u64,
        rx: oneshot::Receiver<()>,
        deadline: Option<Instant>,
    ) -> Result<bool, PoolError<F::Error>> {
        let mut waiter = Waiter {
            shared: &self.shared,
            ticket,
            done: false,
        };
        let woken = match deadline {
            None => rx.await.is_ok(),
            Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(result) => result.is_ok(),
                Err(_) => return Err(PoolError::WaitTimeout),
            },
        };
        waiter.done = true;
        Ok(woken)
    }

    async fn create(&self) -> Result<Lease<F>, PoolError<F::Error>> {
        let mut slot = Creating {
            shared: &self.shared,
            armed: true,
        };
        let result = self.shared.factory.create().await;

        let mut events = Vec::with_capacity(1);
        let (outcome, orphan) = {
            let mut state = self.shared.state.lock();
            slot.armed = false;
            state.creating -= 1;
            match result {
                Ok(conn) if state.closed => {
                    state.wake_one();
                    (Err(PoolError::Closed), Some(conn))
                }
                Ok(conn) => {
                    let id = state.next_drip;
                    state.next_drip += 1;
                    let conn = Arc::new(conn);
                    state.drips.insert(
                        id,
                        Drip {
                            conn: Arc::clone(&conn),
                            used: 1,
                            live: true,
                        },
                    );
                    state.balance.push(id, rank(id, 1));
                    state.pass_on(&self.shared.options);
                    events.push(PoolEvent::new(PoolEventKind::NewDrip, Some(id), state.balance.len()));
                    (Ok(Lease::new(Arc::clone(&self.shared), id, conn)), None)
                }
                Err(err) => {
                    state.wake_one();
                    events.push(PoolEvent::new(PoolEventKind::NewDripFailure, None, state.balance.len()));
                    (Err(PoolError::Create(err)), None)
                }
            }
        };

        if let Some(conn) = orphan {
            self.shared.factory.destroy(&conn);
        }
        for event in events {
            self.shared.emit(event);
        }
        outcome
    }

    /// Closes the pool.
    ///
    /// Parked callers fail with `Closed`, idle drips are destroyed now and
    /// busy drips are destroyed when their last lease is released.
    pub fn close(&self) {
        let idle = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the senders wakes every parked caller.
            state.waiters.clear();
            state.woken = 0;
            state.balance.clear();
            for drip in state.drips.values_mut() {
                drip.live = false;
            }
            let idle: Vec<u64> = state
                .drips
                .iter()
                .filter(|(_, d)| d.used == 0)
                .map(|(id, _)| *id)
                .collect();
            idle.into_iter()
                .filter_map(|id| state.drips.remove(&id).map(|d| (id, d.conn)))
                .collect::<Vec<_>>()
        };

        for (id, conn) in idle {
            self.shared.factory.destroy(&conn);
            self.shared.emit(PoolEvent::new(PoolEventKind::DestroyDrip, Some(id), 0));
        }
        self.shared.emit(PoolEvent::new(PoolEventKind::Closed, None, 0));
    }
}

impl<F: DripFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("drips", &state.balance.len())
            .field("evicted", &(state.drips.len() - state.balance.len()))
            .field("creating", &state.creating)
            .field("waiters", &state.waiters.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Removes a parked caller that gave up (timeout or cancellation). If a
/// release already woke it, the wakeup is handed to the next waiter.
struct Waiter<'a, F: DripFactory> {
    shared: &'a Shared<F>,
    ticket: u64,
    done: bool,
}

impl<F: DripFactory> Drop for Waiter<'_, F> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.shared.state.lock();
        let before = state.waiters.len();
        let ticket = self.ticket;
        state.waiters.retain(|(t, _)| *t != ticket);
        if state.waiters.len() == before && !state.closed {
            // Already dequeued by a wakeup this caller will never claim.
            state.woken = state.woken.saturating_sub(1);
            state.wake_one();
        }
    }
}

/// Gives back a reserved creation slot if `create` is cancelled mid-flight.
struct Creating<'a, F: DripFactory> {
    shared: &'a Shared<F>,
    armed: bool,
}

impl<F: DripFactory> Drop for Creating<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state.lock();
            state.creating -= 1;
            state.wake_one();
        }
    }
}

/// A checked-out drip.
///
/// Return it with [`release`](Self::release) to report how the use went;
/// dropping a lease releases it as healthy.
pub struct Lease<F: DripFactory> {
    shared: Arc<Shared<F>>,
    id: u64,
    conn: Arc<F::Conn>,
    returned: bool,
}

impl<F: DripFactory> Lease<F> {
    fn new(shared: Arc<Shared<F>>, id: u64, conn: Arc<F::Conn>) -> Self {
        Self {
            shared,
            id,
            conn,
            returned: false,
        }
    }

    /// Drip id, unique within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conn(&self) -> &F::Conn {
        &self.conn
    }

    /// Returns the drip. `err` is the error the use ended with, if any; the
    /// factory's health predicate decides whether the drip survives it.
    pub fn release(mut self, err: Option<&F::Error>) {
        self.returned = true;
        self.shared.release(self.id, err);
    }
}

impl<F: DripFactory> Deref for Lease<F> {
    type Target = F::Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<F: DripFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if !self.returned {
            self.shared.release(self.id, None);
        }
    }
}

impl<F: DripFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("drip", &self.id).finish()
    }
}
