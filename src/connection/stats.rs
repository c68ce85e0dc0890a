//! Connection Statistics
//!
//! Counters shared by every connection of a pool. All updates are relaxed
//! atomic increments; the numbers are for observation, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a pool and its connections
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of connections opened
    pub connections_opened: AtomicU64,
    /// Total number of connections closed
    pub connections_closed: AtomicU64,
    /// Failed connection attempts
    pub connect_failures: AtomicU64,
    /// Frames written (queries, continues, stops)
    pub queries_sent: AtomicU64,
    /// Frames received
    pub responses_received: AtomicU64,
    /// Frames whose token matched no outstanding request
    pub unmatched_frames: AtomicU64,
    /// Connections handed out from the ready-list
    pub ready_claims: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_sent(&self, bytes: usize) {
        self.queries_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unmatched_frame(&self) {
        self.unmatched_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ready_claimed(&self) {
        self.ready_claims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Connections opened and not yet closed.
    pub fn live_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }
}
