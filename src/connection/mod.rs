//! Server Connection Module
//!
//! A [`Connection`] is one TCP session to one server, multiplexing any number
//! of concurrent queries over tokens.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Connection                           │
//! │                                                             │
//! │   callers ──> token table ──> writer (tokio Mutex) ──> TCP  │
//! │                   ▲                                         │
//! │                   │ one RendezvousQueue per token           │
//! │                   │                                         │
//! │   reader task <───┴──────────────────────────────────── TCP │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Writes** are serialized through a single async mutex so frames never
//!   interleave on the socket.
//! - **Reads** happen on one spawned task that parses frames with the same
//!   `BytesMut` parse-and-split loop the protocol tests exercise.
//! - **Teardown** flushes every outstanding request with
//!   [`DriverError::ConnectionClosed`](crate::DriverError::ConnectionClosed).
//!
//! ## Example
//!
//! ```ignore
//! use docpool::connection::{Connection, ConnectionOptions, PoolStats, ServerAddress};
//! use docpool::Query;
//! use std::sync::Arc;
//!
//! let conn = Connection::open(
//!     ServerAddress::default(),
//!     ConnectionOptions::default(),
//!     Arc::new(PoolStats::new()),
//! )
//! .await?;
//! let response = conn.run(&Query::new(serde_json::json!([59, []]))).await?;
//! ```

mod handler;
mod options;
mod state;
mod stats;

pub use handler::Connection;
pub use options::{ConnectionOptions, ServerAddress};
pub use state::ConnectionState;
pub use stats::PoolStats;
