//! # docpool - An Async Connection-Pooling Driver for Document Databases
//!
//! docpool talks to a document database over persistent TCP connections using a
//! token-multiplexed JSON query protocol. It delivers each query to a live
//! connection, routes every response back to the exact caller that issued it,
//! and recovers from connection loss, pool exhaustion and shutdown.
//!
//! ## Features
//!
//! - **Multiplexing**: many queries in flight per connection, correlated by token
//! - **Pooling**: bounded pools per server, grown on demand, refilled with backoff
//! - **Fair hand-off**: callers waiting for a connection or a response are served FIFO
//! - **Graceful drain**: stop new work, let in-flight queries finish, close everything
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               docpool                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────────┐ │
//! │  │ PoolMaster  │───>│    Pool     │───>│        Connection            │ │
//! │  │ (routing,   │    │ (ready-list,│    │ ┌────────┐ ┌──────────────┐  │ │
//! │  │  drain)     │    │  backoff)   │    │ │ tokens │ │ reader task  │  │ │
//! │  └─────────────┘    └──────┬──────┘    │ └───┬────┘ └──────┬───────┘  │ │
//! │                            │           └─────┼─────────────┼──────────┘ │
//! │                            ▼                 ▼             ▼            │
//! │                  ┌───────────────────────────────┐  ┌──────────────┐    │
//! │                  │      RendezvousQueue<T>       │  │  protocol    │    │
//! │                  │  (ready-list, reply slots)    │  │ frame parser │    │
//! │                  └───────────────────────────────┘  └──────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use docpool::{connect_pool, PoolConfig, Query};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> docpool::Result<()> {
//!     let master = connect_pool(PoolConfig {
//!         servers: vec!["db1:28015".parse()?, "db2:28015".parse()?],
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     let response = master.run(&Query::new(json!([59, []]))).await?;
//!     println!("{:?}", response.results);
//!
//!     master.drain().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`queue`]: the FIFO rendezvous primitive everything else is built on
//! - [`protocol`]: frames, handshake, and response decoding
//! - [`query`]: query terms, run options, and compilation
//! - [`connection`]: one multiplexed TCP session
//! - [`pool`]: per-server pools and the routing pool master
//! - [`error`]: the driver error taxonomy

pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod queue;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for convenience
pub use connection::{Connection, ConnectionOptions, ConnectionState, PoolStats, ServerAddress};
pub use error::{DriverError, Result};
pub use pool::{connect_pool, Pool, PoolConfig, PoolHealth, PoolMaster, SelectionPolicy};
pub use protocol::{Response, ResponseType};
pub use query::Query;
pub use queue::RendezvousQueue;

/// The port database servers listen on for client drivers
pub const DEFAULT_PORT: u16 = 28015;

/// The host used when no server is configured
pub const DEFAULT_HOST: &str = "localhost";

/// Version of docpool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
