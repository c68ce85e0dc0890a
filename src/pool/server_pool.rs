//! Connection Pool for One Server
//!
//! Every connection a [`Pool`] owns is either idle (sitting in the ready-list)
//! or busy (held by a caller between `acquire` and `release`).
//!
//! ## Acquire
//!
//! ```text
//! acquire()
//!   │
//!   ├─ idle connection in the ready-list? ──────────> take it (evict if dead)
//!   │
//!   ├─ below max? ──> reserve a slot, open directly ─> return it
//!   │
//!   └─ at max ──> wait on the ready-list until a release (or drain) wakes us
//! ```
//!
//! ## Reconnection
//!
//! A background task replaces discarded connections while the pool is below
//! `min` or callers are waiting. Failed opens back off exponentially; after
//! `max_failures` consecutive failures the pool is marked degraded and the
//! task stops. A later successful direct open from `acquire` recovers it.

use crate::connection::{Connection, PoolStats, ServerAddress};
use crate::error::{DriverError, Result};
use crate::pool::backoff::Backoff;
use crate::pool::config::PoolConfig;
use crate::queue::RendezvousQueue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

/// Health of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Healthy,
    /// Reconnection gave up after too many consecutive failures
    Degraded,
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolHealth::Healthy => f.write_str("healthy"),
            PoolHealth::Degraded => f.write_str("degraded"),
        }
    }
}

/// Idle connections; `None` is the sentinel that wakes waiters on drain or
/// degradation.
type ReadyList = RendezvousQueue<Option<Arc<Connection>>>;

struct PoolState {
    /// Every live connection, idle or busy, by id
    connections: HashMap<u64, Arc<Connection>>,
    /// Opens in progress; they count against `max`
    opening: usize,
    draining: bool,
    health: PoolHealth,
    /// Consecutive failed opens
    failures: u32,
    backoff: Backoff,
    /// A background reconnect task is running
    reconnecting: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.connections.len() + self.opening
    }
}

/// A bounded set of connections to one server.
pub struct Pool {
    server: ServerAddress,
    config: PoolConfig,
    ready: ReadyList,
    state: Mutex<PoolState>,
    released: Notify,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<PoolStats>,
}

/// Capacity held for one open in progress. Dropping it without `commit`
/// gives the capacity back and lets waiters claim it.
struct Reservation<'a> {
    pool: &'a Arc<Pool>,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, state: &mut PoolState) {
        state.opening -= 1;
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock_state();
            state.opening -= 1;
            self.pool.refill(&mut state);
            drop(state);
            self.pool.released.notify_waiters();
        }
    }
}

impl Pool {
    /// Creates an empty pool. Call [`fill`](Self::fill) to open `min` connections.
    pub fn new(server: ServerAddress, config: PoolConfig, stats: Arc<PoolStats>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let backoff = Backoff::new(config.backoff_base, config.backoff_cap);
        Arc::new(Self {
            server,
            config,
            ready: ReadyList::new(),
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                opening: 0,
                draining: false,
                health: PoolHealth::Healthy,
                failures: 0,
                backoff,
                reconnecting: false,
            }),
            released: Notify::new(),
            shutdown_tx,
            stats,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn server(&self) -> &ServerAddress {
        &self.server
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    pub fn health(&self) -> PoolHealth {
        self.lock_state().health
    }

    pub fn is_draining(&self) -> bool {
        self.lock_state().draining
    }

    /// Live connections, idle and busy.
    pub fn connection_count(&self) -> usize {
        self.lock_state().connections.len()
    }

    /// Connections waiting in the ready-list.
    pub fn idle_count(&self) -> usize {
        self.ready.len()
    }

    /// Connections currently held by callers.
    pub fn busy_count(&self) -> usize {
        self.connection_count().saturating_sub(self.idle_count())
    }

    /// Callers suspended in `acquire`.
    pub fn waiting(&self) -> usize {
        self.ready.waiting()
    }

    /// Starts opening connections in the background until `min` are open.
    pub fn fill(self: &Arc<Self>) {
        let mut state = self.lock_state();
        self.refill(&mut state);
    }

    /// Takes a connection, opening one if below `max` or waiting for a release.
    pub async fn acquire(self: &Arc<Self>) -> Result<Arc<Connection>> {
        loop {
            if let Some(entry) = self.ready.try_pull() {
                match entry {
                    Some(conn) if conn.is_open() => return Ok(conn),
                    Some(conn) => {
                        self.discard(conn).await;
                        continue;
                    }
                    None => continue,
                }
            }

            let pending = {
                let mut state = self.lock_state();
                if state.draining {
                    return Err(DriverError::PoolDraining);
                }
                if state.total() < self.config.max {
                    state.opening += 1;
                    None
                } else {
                    // Registered under the state lock so a concurrent discard
                    // or drain cannot miss this waiter.
                    Some(self.ready.pull())
                }
            };

            let Some(pull) = pending else {
                let reservation = Reservation {
                    pool: self,
                    armed: true,
                };
                return self.open_direct(reservation).await;
            };

            debug!(server = %self.server, max = self.config.max, "pool at capacity, waiting");
            let entry = match self.config.acquire_timeout {
                Some(limit) => match tokio::time::timeout(limit, pull).await {
                    Ok(entry) => entry,
                    Err(_) => {
                        return Err(DriverError::PoolExhausted {
                            max: self.config.max,
                        })
                    }
                },
                None => pull.await,
            };

            match entry {
                Some(conn) if conn.is_open() => return Ok(conn),
                Some(conn) => self.discard(conn).await,
                None => return Err(self.wake_reason()),
            }
        }
    }

    /// Error for a waiter woken by the `None` sentinel.
    fn wake_reason(&self) -> DriverError {
        let state = self.lock_state();
        if state.draining {
            DriverError::PoolDraining
        } else {
            DriverError::Unavailable(format!(
                "{} unreachable after {} attempts",
                self.server, state.failures
            ))
        }
    }

    async fn open_direct(
        self: &Arc<Self>,
        reservation: Reservation<'_>,
    ) -> Result<Arc<Connection>> {
        let result = Connection::open(
            self.server.clone(),
            self.config.connection.clone(),
            Arc::clone(&self.stats),
        )
        .await;

        let conn = {
            let mut state = self.lock_state();
            reservation.commit(&mut state);
            match result {
                Ok(conn) if !state.draining => {
                    state.connections.insert(conn.id(), Arc::clone(&conn));
                    self.record_success(&mut state);
                    return Ok(conn);
                }
                Ok(conn) => conn,
                Err(e) => {
                    self.record_failure(&mut state, &e);
                    self.refill(&mut state);
                    return Err(e);
                }
            }
        };

        conn.close().await;
        self.released.notify_waiters();
        Err(DriverError::PoolDraining)
    }

    /// Returns a connection to the pool.
    ///
    /// Open connections go back on the ready-list. Closed ones are discarded
    /// and replaced if needed. During drain every released connection is closed.
    pub async fn release(self: &Arc<Self>, conn: Arc<Connection>) {
        if conn.is_open() {
            let state = self.lock_state();
            if !state.draining && state.connections.contains_key(&conn.id()) {
                let stats = Arc::clone(&self.stats);
                self.ready.push_with(Some(conn), move || stats.ready_claimed());
                return;
            }
        }
        self.discard(conn).await;
    }

    /// Drops a busy connection from the books without closing it, for callers
    /// that cannot await [`release`](Self::release).
    pub(crate) fn forget(self: &Arc<Self>, conn: &Connection) {
        let mut state = self.lock_state();
        if state.connections.remove(&conn.id()).is_none() {
            return;
        }
        self.released.notify_waiters();
        self.refill(&mut state);
    }

    /// Closes and forgets a connection, scheduling a replacement when needed.
    async fn discard(self: &Arc<Self>, conn: Arc<Connection>) {
        conn.close().await;

        let mut state = self.lock_state();
        if state.connections.remove(&conn.id()).is_none() {
            return;
        }
        debug!(
            server = %self.server,
            conn = conn.id(),
            remaining = state.connections.len(),
            "connection discarded"
        );
        self.released.notify_waiters();
        self.refill(&mut state);
    }

    /// Puts freed capacity to use: starts the reconnect task when connections
    /// are wanted, or fails waiters of a degraded pool with nothing left.
    fn refill(self: &Arc<Self>, state: &mut PoolState) {
        if state.draining {
            return;
        }
        if state.health == PoolHealth::Degraded {
            if state.connections.is_empty() {
                self.ready.destroy(None);
            }
            return;
        }
        if state.reconnecting || !self.wants_connection(state) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.reconnecting = true;
                self.spawn_reconnect(&handle);
            }
            Err(_) => warn!(server = %self.server, "no runtime to reconnect on"),
        }
    }

    /// True while below `min`, or while callers wait and there is room.
    fn wants_connection(&self, state: &PoolState) -> bool {
        if state.draining || state.health == PoolHealth::Degraded {
            return false;
        }
        state.total() < self.config.min
            || (self.ready.waiting() > 0 && state.total() < self.config.max)
    }

    fn spawn_reconnect(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        let pool = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        handle.spawn(async move { pool.reconnect_loop(shutdown_rx).await });
    }

    /// Background opener. Exits when no more connections are wanted.
    async fn reconnect_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let (reservation, delay) = {
                let mut state = self.lock_state();
                if !self.wants_connection(&state) {
                    state.reconnecting = false;
                    return;
                }
                state.opening += 1;
                let delay = if state.failures == 0 {
                    Duration::ZERO
                } else {
                    state.backoff.next_delay()
                };
                let reservation = Reservation {
                    pool: &self,
                    armed: true,
                };
                (reservation, delay)
            };

            if !delay.is_zero() {
                debug!(server = %self.server, ?delay, "reconnecting after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        drop(reservation);
                        self.lock_state().reconnecting = false;
                        return;
                    }
                }
            }

            let result = Connection::open(
                self.server.clone(),
                self.config.connection.clone(),
                Arc::clone(&self.stats),
            )
            .await;

            let unneeded = {
                let mut state = self.lock_state();
                reservation.commit(&mut state);
                match result {
                    Ok(conn) if !state.draining => {
                        state.connections.insert(conn.id(), Arc::clone(&conn));
                        self.record_success(&mut state);
                        let stats = Arc::clone(&self.stats);
                        self.ready.push_with(Some(conn), move || stats.ready_claimed());
                        None
                    }
                    Ok(conn) => Some(conn),
                    Err(e) => {
                        if self.record_failure(&mut state, &e) {
                            state.reconnecting = false;
                            return;
                        }
                        None
                    }
                }
            };

            if let Some(conn) = unneeded {
                conn.close().await;
                self.released.notify_waiters();
            }
        }
    }

    fn record_success(&self, state: &mut PoolState) {
        state.failures = 0;
        state.backoff.reset();
        if state.health == PoolHealth::Degraded {
            state.health = PoolHealth::Healthy;
            info!(server = %self.server, "pool recovered");
        }
    }

    /// Counts a failed open. Returns true once the pool is degraded.
    fn record_failure(&self, state: &mut PoolState, err: &DriverError) -> bool {
        state.failures = state.failures.saturating_add(1);
        warn!(
            server = %self.server,
            failures = state.failures,
            error = %err,
            "failed to open connection"
        );

        if state.failures < self.config.max_failures {
            return state.health == PoolHealth::Degraded;
        }
        if state.health == PoolHealth::Healthy {
            state.health = PoolHealth::Degraded;
            error!(
                server = %self.server,
                failures = state.failures,
                "pool degraded, giving up on reconnection"
            );
        }
        if state.connections.is_empty() {
            self.ready.destroy(None);
        }
        true
    }

    /// Stops new acquires, waits for busy connections, and closes everything.
    ///
    /// Busy connections still out when `drain_timeout` elapses are closed,
    /// failing their outstanding requests with `ConnectionClosed`.
    pub async fn drain(&self) {
        self.lock_state().draining = true;
        let _ = self.shutdown_tx.send(true);

        let woken = self.ready.destroy(None);
        self.close_idle().await;

        let busy = self.connection_count();
        info!(server = %self.server, busy, woken, "draining pool");

        let released = self.wait_released();
        match self.config.drain_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, released).await.is_err() {
                    let remaining: Vec<_> = self.lock_state().connections.drain().collect();
                    warn!(
                        server = %self.server,
                        remaining = remaining.len(),
                        "drain timed out, closing busy connections"
                    );
                    for (_, conn) in remaining {
                        conn.close().await;
                    }
                }
            }
            None => released.await,
        }

        self.close_idle().await;
        self.ready.destroy(None);
        info!(server = %self.server, "pool drained");
    }

    async fn close_idle(&self) {
        while let Some(entry) = self.ready.try_pull() {
            if let Some(conn) = entry {
                conn.close().await;
                self.lock_state().connections.remove(&conn.id());
            }
        }
    }

    /// Resolves once no connection is owned or being opened.
    async fn wait_released(&self) {
        loop {
            let notified = self.released.notified();
            {
                let state = self.lock_state();
                if state.connections.is_empty() && state.opening == 0 {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Pool")
            .field("server", &self.server)
            .field("connections", &state.connections.len())
            .field("opening", &state.opening)
            .field("draining", &state.draining)
            .field("health", &state.health)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::test_support::{dead_address, TestServer};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min,
            max,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(5),
            drain_timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        }
    }

    fn pool(server: ServerAddress, config: PoolConfig) -> Arc<Pool> {
        Pool::new(server, config, Arc::new(PoolStats::new()))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_third_acquire_waits_for_release() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 2));

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.busy_count(), 2);

        let third = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());
        assert_eq!(pool.waiting(), 1);
        assert_eq!(server.accepted(), 2);

        pool.release(Arc::clone(&first)).await;
        let third = third.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&third, &first));
        assert_eq!(pool.connection_count(), 2);
        assert_eq!(pool.stats().ready_claims.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 4));

        let conn = pool.acquire().await.unwrap();
        pool.release(Arc::clone(&conn)).await;
        assert_eq!(pool.idle_count(), 1);

        let again = pool.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_acquire_timeout_reports_exhaustion() {
        let server = TestServer::start().await;
        let pool = pool(
            server.address(),
            PoolConfig {
                acquire_timeout: Some(Duration::from_millis(30)),
                ..config(0, 1)
            },
        );

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(DriverError::PoolExhausted { max: 1 })));
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_fill_opens_min_connections() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(3, 5));
        pool.fill();

        eventually(|| pool.idle_count() == 3).await;
        assert_eq!(pool.connection_count(), 3);
        assert_eq!(server.accepted(), 3);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_is_evicted() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 2));

        let conn = pool.acquire().await.unwrap();
        pool.release(Arc::clone(&conn)).await;
        conn.close().await;

        let fresh = pool.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
        assert!(fresh.is_open());
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_mid_flight_failure_is_isolated_and_replaced() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(2, 2));

        let doomed = pool.acquire().await.unwrap();
        let healthy = pool.acquire().await.unwrap();

        let unrelated = {
            let healthy = Arc::clone(&healthy);
            tokio::spawn(async move {
                healthy
                    .run(&Query::new(json!({"sleep": 100, "echo": "fine"})))
                    .await
            })
        };

        let result = doomed.run(&Query::new(json!({"die": true}))).await;
        assert!(matches!(result, Err(DriverError::ConnectionClosed)));
        pool.release(doomed).await;

        let unrelated = unrelated.await.unwrap().unwrap();
        assert_eq!(unrelated.atom(), Some(&json!("fine")));

        // min = 2, so the dead connection is replaced in the background
        eventually(|| pool.connection_count() == 2 && pool.idle_count() == 1).await;
        assert_eq!(server.accepted(), 3);
    }

    #[tokio::test]
    async fn test_waiter_gets_replacement_when_connection_dies() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 1));

        let conn = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.close().await;
        pool.release(conn).await;

        let replacement = waiter.await.unwrap().unwrap();
        assert!(replacement.is_open());
        assert_eq!(server.accepted(), 2);
    }

    #[tokio::test]
    async fn test_drain_waits_for_busy_connections() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 2));

        let busy = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(Arc::clone(&idle)).await;

        let in_flight = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let result = busy
                    .run(&Query::new(json!({"sleep": 80, "echo": "done"})))
                    .await;
                pool.release(busy).await;
                result
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.drain().await;

        let result = in_flight.await.unwrap().unwrap();
        assert_eq!(result.atom(), Some(&json!("done")));
        assert_eq!(pool.connection_count(), 0);
        assert!(!idle.is_open());
        assert!(matches!(pool.acquire().await, Err(DriverError::PoolDraining)));
    }

    #[tokio::test]
    async fn test_drain_timeout_force_closes() {
        let server = TestServer::start().await;
        let pool = pool(
            server.address(),
            PoolConfig {
                drain_timeout: Some(Duration::from_millis(50)),
                ..config(0, 1)
            },
        );

        let conn = pool.acquire().await.unwrap();
        let stuck = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.run(&Query::new(json!({"silent": true}))).await })
        };
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.drain().await;

        assert!(matches!(
            stuck.await.unwrap(),
            Err(DriverError::ConnectionClosed)
        ));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DriverError::PoolDraining)
        ));
        assert!(!conn.is_open());
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_degrade_pool() {
        let pool = pool(
            dead_address().await,
            PoolConfig {
                max_failures: 3,
                ..config(1, 1)
            },
        );
        pool.fill();

        eventually(|| pool.health() == PoolHealth::Degraded).await;
        assert_eq!(pool.stats().connect_failures.load(Ordering::Relaxed), 3);
        assert_eq!(pool.connection_count(), 0);

        // direct opens still try, and report the transport error
        assert!(matches!(pool.acquire().await, Err(DriverError::Io(_))));
    }

    #[tokio::test]
    async fn test_degraded_pool_releases_waiters() {
        let server = TestServer::start().await;
        let pool = pool(
            server.address(),
            PoolConfig {
                max_failures: 1,
                ..config(0, 1)
            },
        );

        // Pretend an open is in flight so the next caller has to wait.
        pool.lock_state().opening = 1;
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        eventually(|| pool.waiting() == 1).await;

        {
            let mut state = pool.lock_state();
            state.opening = 0;
            assert!(pool.record_failure(&mut state, &DriverError::ConnectionClosed));
        }
        assert_eq!(pool.health(), PoolHealth::Degraded);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DriverError::Unavailable(_))
        ));

        // A successful direct open brings the pool back.
        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(pool.health(), PoolHealth::Healthy);
    }

    #[tokio::test]
    async fn test_failed_open_hands_capacity_to_waiter() {
        let pool = pool(
            dead_address().await,
            PoolConfig {
                max_failures: 2,
                ..config(0, 1)
            },
        );

        // Hold the only slot as an open in progress, then queue a caller.
        pool.lock_state().opening = 1;
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        eventually(|| pool.waiting() == 1).await;

        let reservation = Reservation {
            pool: &pool,
            armed: true,
        };
        assert!(matches!(
            pool.open_direct(reservation).await,
            Err(DriverError::Io(_))
        ));

        // The freed slot is retried for the waiter until the pool gives up.
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter stranded after failed open")
            .unwrap();
        assert!(matches!(result, Err(DriverError::Unavailable(_))));
        assert_eq!(pool.health(), PoolHealth::Degraded);
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_open_hands_capacity_to_waiter() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 1));

        pool.lock_state().opening = 1;
        let reservation = Reservation {
            pool: &pool,
            armed: true,
        };
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        eventually(|| pool.waiting() == 1).await;

        // Same as an acquire future dropped mid-open.
        drop(reservation);

        let conn = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter stranded after cancelled open")
            .unwrap()
            .unwrap();
        assert!(conn.is_open());
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_exceed_max() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 4));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let callers: Vec<_> = (0..10)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    let conn = pool.acquire().await?;
                    gate.acquire().await.unwrap().forget();
                    let id = conn.id();
                    pool.release(conn).await;
                    Ok::<_, DriverError>(id)
                })
            })
            .collect();

        eventually(|| pool.waiting() == 6 && pool.connection_count() == 4).await;
        assert_eq!(server.accepted(), 4);
        assert_eq!(pool.busy_count(), 4);

        gate.add_permits(10);
        let mut ids = Vec::new();
        for caller in callers {
            ids.push(caller.await.unwrap().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert!(ids.len() <= 4);
        assert_eq!(server.accepted(), 4);
        assert_eq!(pool.connection_count(), 4);
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let server = TestServer::start().await;
        let pool = pool(server.address(), config(0, 2));

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();

        let mut waiters = Vec::new();
        for queued in 1..=3 {
            let handle = {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire().await })
            };
            waiters.push(handle);
            eventually(|| pool.waiting() == queued).await;
        }
        assert_eq!(server.accepted(), 2);
        let mut waiters = waiters.into_iter();
        let mut next = || {
            let handle = waiters.next().unwrap();
            async move {
                tokio::time::timeout(Duration::from_secs(2), handle)
                    .await
                    .expect("earliest waiter not served")
                    .unwrap()
                    .unwrap()
            }
        };

        pool.release(Arc::clone(&first)).await;
        assert!(Arc::ptr_eq(&next().await, &first));

        pool.release(Arc::clone(&second)).await;
        let got = next().await;
        assert!(Arc::ptr_eq(&got, &second));

        pool.release(got).await;
        assert!(Arc::ptr_eq(&next().await, &second));
        assert_eq!(server.accepted(), 2);
    }

    #[tokio::test]
    async fn test_burst_against_dead_server_strands_no_caller() {
        let pool = pool(
            dead_address().await,
            PoolConfig {
                max_failures: 3,
                ..config(0, 1)
            },
        );

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.acquire().await })
            })
            .collect();

        for caller in callers {
            let result = tokio::time::timeout(Duration::from_secs(2), caller)
                .await
                .expect("caller stranded")
                .unwrap();
            assert!(matches!(
                result,
                Err(DriverError::Io(_)) | Err(DriverError::Unavailable(_))
            ));
        }
        assert_eq!(pool.waiting(), 0);
        assert_eq!(pool.connection_count(), 0);
    }
}
