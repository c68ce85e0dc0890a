//! Connection Pooling
//!
//! ```text
//!                         PoolMaster::run(query)
//!                                  │
//!                     select a pool (round-robin / least-busy)
//!                 ┌────────────────┼────────────────┐
//!                 ▼                ▼                ▼
//!           ┌──────────┐     ┌──────────┐     ┌──────────┐
//!           │  Pool A  │     │  Pool B  │     │  Pool C  │
//!           │ ready ▢▢ │     │ ready ▢  │     │ ready    │
//!           │ busy  ■  │     │ busy  ■■ │     │ busy ■■■ │
//!           └──────────┘     └──────────┘     └──────────┘
//!                 │ acquire ─> Connection::run ─> release
//! ```
//!
//! - A [`Pool`] owns the connections to one server and hands them out
//!   through its ready-list, growing up to `max` on demand.
//! - A [`PoolMaster`] owns one pool per server, routes each query, retries
//!   once on connection loss, and drains all pools together.
//!
//! There is no process-wide default pool; [`connect_pool`] returns the master
//! and callers pass it where queries are run.

mod backoff;
mod config;
mod master;
mod server_pool;

pub use backoff::Backoff;
pub use config::{PoolConfig, SelectionPolicy};
pub use master::{connect_pool, PoolMaster};
pub use server_pool::{Pool, PoolHealth};
