//! §4.2 heartbeat handler. Every open connection must answer a `0xfc` with a
//! single `0xfb` octet within tens of milliseconds, sent directly on the
//! wire rather than through the batcher (§4.3 emission must yield control
//! between messages for exactly this reason). Grounded on
//! `original_source/ping.py` and `multi_conn_patch.py`'s receiver loop,
//! which both reply to ping inline and count consecutive failures.

use std::time::Duration;

use crate::wire::OP_PONG;

/// Three consecutive failed pong sends mark a connection unhealthy (§4.2).
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub const PONG_BYTES: [u8; 1] = [OP_PONG];

/// §7 "Ping timeout": no ping received for this long marks the connection
/// dead and triggers a reconnect.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-connection heartbeat bookkeeping. Owns no I/O itself — the
/// connection's receive loop calls `record_success`/`record_failure` around
/// its own direct socket write of `PONG_BYTES`, and reads
/// `seconds_since_last_ping` to enforce `PING_TIMEOUT`.
#[derive(Debug)]
pub struct HeartbeatTracker {
    consecutive_failures: u32,
    pings_seen: u64,
    /// Seeded at connection-open time (not `None`) so a connection that
    /// never receives a single ping is still timed out after `PING_TIMEOUT`
    /// rather than being treated as perpetually fresh.
    last_ping_at: tokio::time::Instant,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
            pings_seen: 0,
            last_ping_at: tokio::time::Instant::now(),
        }
    }

    pub fn on_ping(&mut self) {
        self.pings_seen += 1;
        self.last_ping_at = tokio::time::Instant::now();
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Returns `true` if this connection has now crossed the unhealthy
    /// threshold and should be torn down by its owning `Connection`.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
    }

    pub fn seconds_since_last_ping(&self) -> f64 {
        self.last_ping_at.elapsed().as_secs_f64()
    }

    /// §7 "Ping timeout | No ping received for 60 s".
    pub fn timed_out(&self) -> bool {
        self.last_ping_at.elapsed() >= PING_TIMEOUT
    }
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_marks_unhealthy() {
        let mut tracker = HeartbeatTracker::new();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut tracker = HeartbeatTracker::new();
        tracker.record_failure();
        tracker.record_failure();
        tracker.record_success();
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }
}
