//! Pool Master
//!
//! Routes queries across one pool per server and coordinates drain.

use crate::connection::{Connection, PoolStats};
use crate::error::{DriverError, Result};
use crate::pool::config::{PoolConfig, SelectionPolicy};
use crate::pool::server_pool::{Pool, PoolHealth};
use crate::protocol::Response;
use crate::query::Query;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Validates `config`, builds one pool per server and starts filling them.
///
/// Returns as soon as the pools exist; connections open in the background.
pub async fn connect_pool(config: PoolConfig) -> Result<PoolMaster> {
    config.validate()?;

    let stats = Arc::new(PoolStats::new());
    let pools: Vec<Arc<Pool>> = config
        .servers
        .iter()
        .map(|server| Pool::new(server.clone(), config.clone(), Arc::clone(&stats)))
        .collect();

    for pool in &pools {
        pool.fill();
    }

    info!(
        pools = pools.len(),
        min = config.min,
        max = config.max,
        "connection pools created"
    );

    Ok(PoolMaster {
        pools,
        policy: config.policy,
        cursor: AtomicUsize::new(0),
        draining: AtomicBool::new(false),
        stats,
    })
}

/// Entry point for running queries against a set of servers.
#[derive(Debug)]
pub struct PoolMaster {
    pools: Vec<Arc<Pool>>,
    policy: SelectionPolicy,
    cursor: AtomicUsize,
    draining: AtomicBool,
    stats: Arc<PoolStats>,
}

/// A connection on loan from a pool. Returned to the pool when dropped, so a
/// cancelled `run` never strands it.
struct Lease {
    pool: Arc<Pool>,
    conn: Option<Arc<Connection>>,
}

impl Lease {
    fn connection(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref()
    }

    async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn).await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.release(conn).await });
            }
            Err(_) => {
                warn!(
                    conn = conn.id(),
                    server = %pool.server(),
                    "no runtime to release connection, dropping it"
                );
                pool.forget(&conn);
            }
        }
    }
}

impl PoolMaster {
    /// Runs a query on a connection from one of the pools.
    ///
    /// A query that fails because its connection closed mid-flight is retried
    /// once on a freshly acquired connection.
    pub async fn run(&self, query: &Query) -> Result<Response> {
        if self.is_draining() {
            return Err(DriverError::PoolDraining);
        }
        // Reject bad options before a connection might be opened.
        query.compile()?;

        match self.run_once(query).await {
            Err(e) if e.is_connection_lost() && !self.is_draining() => {
                debug!(error = %e, "connection lost mid-query, retrying once");
                self.run_once(query).await
            }
            result => result,
        }
    }

    async fn run_once(&self, query: &Query) -> Result<Response> {
        let pool = self.select()?;
        let conn = pool.acquire().await?;
        let lease = Lease {
            pool,
            conn: Some(conn),
        };

        let result = match lease.connection() {
            Some(conn) => conn.run(query).await,
            None => Err(DriverError::ConnectionClosed),
        };
        lease.release().await;
        result
    }

    /// Picks a pool by policy, preferring healthy pools over degraded ones.
    fn select(&self) -> Result<Arc<Pool>> {
        let open: Vec<&Arc<Pool>> = self.pools.iter().filter(|p| !p.is_draining()).collect();
        if open.is_empty() {
            return Err(DriverError::PoolDraining);
        }

        let healthy: Vec<&Arc<Pool>> = open
            .iter()
            .copied()
            .filter(|p| p.health() == PoolHealth::Healthy)
            .collect();
        let candidates = if healthy.is_empty() { open } else { healthy };

        let chosen = match self.policy {
            SelectionPolicy::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[i]
            }
            SelectionPolicy::LeastBusy => candidates
                .iter()
                .copied()
                .min_by_key(|p| p.busy_count())
                .unwrap_or(candidates[0]),
        };
        Ok(Arc::clone(chosen))
    }

    /// Rejects new work, then drains every pool concurrently.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);

        let mut tasks = JoinSet::new();
        for pool in &self.pools {
            let pool = Arc::clone(pool);
            tasks.spawn(async move { pool.drain().await });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "pool drain task failed");
            }
        }

        info!(pools = self.pools.len(), "all pools drained");
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// True if any pool is healthy and accepting work.
    pub fn is_healthy(&self) -> bool {
        !self.is_draining()
            && self
                .pools
                .iter()
                .any(|p| p.health() == PoolHealth::Healthy)
    }

    /// Live connections across all pools.
    pub fn connection_count(&self) -> usize {
        self.pools.iter().map(|p| p.connection_count()).sum()
    }

    /// Idle connections across all pools.
    pub fn idle_count(&self) -> usize {
        self.pools.iter().map(|p| p.idle_count()).sum()
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    /// Counters shared by every pool of this master.
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }
}
