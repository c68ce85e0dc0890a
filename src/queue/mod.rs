//! Rendezvous Queue Module
//!
//! The hand-off primitive every other layer of the driver is built on.
//!
//! ## Where It Is Used
//!
//! ```text
//!   Connection reader task                 Pool::release()
//!          │ push(response)                      │ push(connection)
//!          ▼                                     ▼
//!   ┌───────────────────┐               ┌───────────────────┐
//!   │ per-token slot    │               │ pool ready-list   │
//!   │ RendezvousQueue   │               │ RendezvousQueue   │
//!   └─────────┬─────────┘               └─────────┬─────────┘
//!             │ pull()                            │ pull()
//!             ▼                                   ▼
//!   caller awaiting a query result      caller awaiting an idle connection
//! ```
//!
//! ## Guarantees
//!
//! - **FIFO**: buffered values and waiting consumers are both served oldest first
//! - **Exactly once**: a value goes to one consumer, a waiter is resolved once
//! - **Safe teardown**: `destroy(sentinel)` unblocks every waiter and keeps buffered values

pub mod rendezvous;

pub use rendezvous::{OnClaim, Pull, RendezvousQueue};
