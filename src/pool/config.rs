//! Pool Configuration

use crate::connection::{ConnectionOptions, ServerAddress};
use crate::error::{DriverError, Result};
use std::time::Duration;

/// How the pool master picks a pool for each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Rotate through the pools in order
    #[default]
    RoundRobin,
    /// Pick the pool with the fewest busy connections
    LeastBusy,
}

/// Configuration for [`connect_pool`](crate::pool::connect_pool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// One pool is created per server
    pub servers: Vec<ServerAddress>,

    /// Connections each pool keeps open (default: 1)
    pub min: usize,

    /// Upper bound on connections per pool (default: 10)
    pub max: usize,

    /// First reconnection delay (default: 100ms)
    pub backoff_base: Duration,

    /// Largest reconnection delay (default: 10s)
    pub backoff_cap: Duration,

    /// Consecutive failed opens before a pool is marked degraded (default: 8)
    pub max_failures: u32,

    /// Bound on waiting for busy connections during drain (default: 5s)
    pub drain_timeout: Option<Duration>,

    /// Bound on waiting for an idle connection (default: wait forever)
    pub acquire_timeout: Option<Duration>,

    pub policy: SelectionPolicy,

    pub connection: ConnectionOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerAddress::default()],
            min: 1,
            max: 10,
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(10),
            max_failures: 8,
            drain_timeout: Some(Duration::from_secs(5)),
            acquire_timeout: None,
            policy: SelectionPolicy::RoundRobin,
            connection: ConnectionOptions::default(),
        }
    }
}

impl PoolConfig {
    /// Rejects configurations no pool can honour.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(DriverError::Validation("no servers configured".to_string()));
        }
        if self.max == 0 {
            return Err(DriverError::Validation(
                "max connections must be at least 1".to_string(),
            ));
        }
        if self.min > self.max {
            return Err(DriverError::Validation(format!(
                "min connections ({}) exceeds max ({})",
                self.min, self.max
            )));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(DriverError::Validation(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff_base, self.backoff_cap
            )));
        }
        Ok(())
    }
}
