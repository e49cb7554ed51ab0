//! Benchmark session state: pipeline credit accounting and ack validation.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::SessionConfig;
use crate::endpoint::Endpoint;
use crate::latency::LatencyRing;
use crate::wire::{self, Ack};

/// Per-shard session state, mutated only by the owning shard.
#[derive(Debug)]
pub struct BenchSession {
    /// Immutable session parameters.
    pub config: SessionConfig,
    /// Server-assigned session id; zero before the handshake.
    pub session_id: u64,
    /// Remote data endpoint, resolved during discovery.
    pub client: Option<Endpoint>,
    /// Cumulative bytes issued.
    pub total_size: u64,
    /// Cumulative requests issued.
    pub total_count: u64,
    /// Bytes currently in flight.
    pub unacked_size: u64,
    /// Requests currently in flight.
    pub unacked_count: u64,
    /// Largest cumulative count observed in any accepted ack.
    pub last_acked_total: u64,
}

impl BenchSession {
    /// Create a fresh session for the given configuration.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            session_id: 0,
            client: None,
            total_size: 0,
            total_count: 0,
            unacked_size: 0,
            unacked_count: 0,
            last_acked_total: 0,
        }
    }

    /// The dual credit predicate: both the byte and the count budget must
    /// have headroom for another request.
    #[inline]
    pub fn can_send(&self) -> bool {
        self.unacked_size < self.config.pipeline_size as u64
            && self.unacked_count < self.config.pipeline_count as u64
    }

    /// Account for one issued request. Returns the request's cumulative
    /// number (1-based), which is also its latency-ring key.
    pub fn note_send(&mut self) -> u64 {
        let size = self.config.response_size as u64;
        self.total_size += size;
        self.total_count += 1;
        self.unacked_size += size;
        self.unacked_count += 1;
        self.total_count
    }

    /// Validate and apply one inbound ack.
    ///
    /// Malformed acks are dropped with a warning, with two deliberate
    /// exceptions: a stale ack (cumulative count at or below the last
    /// accepted one) and a checksum mismatch are logged and then processed
    /// anyway. Latency samples for every newly covered request are handed to
    /// `on_sample`; credit is recomputed from the server's cumulative
    /// totals. Returns whether the ack was applied.
    pub fn apply_ack(
        &mut self,
        ack: &Ack,
        now: Instant,
        ring: &LatencyRing,
        mut on_sample: impl FnMut(Duration),
    ) -> bool {
        if ack.session_id != self.session_id {
            warn!(
                have = self.session_id,
                recv = ack.session_id,
                "received ack for unknown session"
            );
            return false;
        }
        if ack.total_count > self.total_count {
            warn!(
                have = self.total_count,
                recv = ack.total_count,
                "received ack for too many requests"
            );
            return false;
        }
        if ack.total_count <= self.last_acked_total {
            // Tolerated: stale acks are logged but still applied.
            warn!(
                total = self.total_count,
                unacked = self.unacked_count,
                recv = ack.total_count,
                "received ack that is too old"
            );
        }
        if ack.total_size > self.total_size {
            warn!(
                have = self.total_size,
                recv = ack.total_size,
                "received ack for too much data"
            );
            return false;
        }
        let expected = wire::expected_checksum(ack.total_count);
        if ack.checksum != expected {
            warn!(got = ack.checksum, expected, "ack checksum mismatch");
        }

        // Every request in [first un-acked, ack.total_count) is newly
        // covered; the range is empty for stale acks.
        let first_unacked = self.total_count - self.unacked_count;
        for req_num in first_unacked..ack.total_count {
            let issued = ring.issued_at(req_num);
            on_sample(now.saturating_duration_since(issued));
        }

        self.unacked_count = self.total_count - ack.total_count;
        self.unacked_size = self.total_size - ack.total_size;
        self.last_acked_total = self.last_acked_total.max(ack.total_count);
        true
    }
}

/// One-shot notifier used to wake the suspended sender when credit is
/// restored.
///
/// At most one awakener may be outstanding; installation asserts this.
#[derive(Debug, Default)]
pub struct SendWaiter {
    pending: bool,
}

impl SendWaiter {
    /// Create an idle waiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the awakener. Panics if one is already pending.
    pub fn install(&mut self) {
        assert!(!self.pending, "send waiter already installed");
        self.pending = true;
    }

    /// Wake the sender. Idempotent.
    pub fn fulfil(&mut self) {
        self.pending = false;
    }

    /// Whether the sender is currently suspended on this waiter.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending
    }
}
