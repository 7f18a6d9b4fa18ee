//! §4.5 connection pool. One receive-capable connection plus `K`
//! (0..=15) send-only connections, each independently supervised with its
//! own reconnect backoff so closing one never stalls the others. Grounded
//! on `original_source/multi_conn_patch.py`'s `handle_websocket_multi`
//! (one read-write + N write-only `websockets.connect` calls) and the
//! teacher's `master.rs`/`worker.rs` split of one coordinating core plus N
//! worker tasks.
//!
//! Strategy choice (§4.5 allows either): this pool shares a *single* global
//! send queue (`Batcher`) across every connection, so any connection's
//! sender-loop tick can drain it — the simplest way to satisfy "no frame
//! starvation" and "fair use of all connections" without the scheduler
//! needing to know how many connections exist.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::batcher::Batcher;
use crate::connection::{run_connection, ConnectionContext, ConnectionRole};

/// Reconnect backoff policy (§4.10): starts at 1s, doubles on each
/// consecutive short-lived (<10s) connection, halves after a >=30s
/// lifetime, resets to the floor after >=60s, capped at 60s.
pub struct Backoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: Duration::from_secs(1),
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
        }
    }

    pub fn observe(&mut self, lifetime: Duration) {
        if lifetime >= Duration::from_secs(60) {
            self.current = self.floor;
        } else if lifetime >= Duration::from_secs(30) {
            self.current = (self.current / 2).max(self.floor);
        } else if lifetime < Duration::from_secs(10) {
            self.current = (self.current * 2).min(self.ceiling);
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionPool {
    rw_url: String,
    wo_url: String,
    writeonly_count: usize,
    pub batcher: Arc<Batcher>,
    ctx: ConnectionContext,
    active_connections: Arc<AtomicUsize>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ConnectionPool {
    pub fn new(base_ws_url: &str, writeonly_count: usize, ctx: ConnectionContext) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            rw_url: format!("{base_ws_url}/api/paintboard/ws"),
            wo_url: format!("{base_ws_url}/api/paintboard/ws?writeonly=1"),
            writeonly_count: writeonly_count.clamp(0, 15),
            batcher: Batcher::new(),
            ctx,
            active_connections: Arc::new(AtomicUsize::new(0)),
            stop_tx,
            tasks: Vec::new(),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Open the one read-write connection and the configured write-only
    /// connections, each supervised independently.
    pub fn start(&mut self) {
        self.tasks.push(self.spawn_supervised(0, self.rw_url.clone(), ConnectionRole::ReadWrite));
        for i in 0..self.writeonly_count {
            self.tasks
                .push(self.spawn_supervised(i + 1, self.wo_url.clone(), ConnectionRole::WriteOnly));
        }
    }

    fn spawn_supervised(
        &self,
        id: usize,
        url: String,
        role: ConnectionRole,
    ) -> tokio::task::JoinHandle<()> {
        let batcher = self.batcher.clone();
        let ctx = self.ctx.clone();
        let stop_rx = self.stop_tx.subscribe();
        let active = self.active_connections.clone();

        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                active.fetch_add(1, Ordering::Relaxed);
                let lifetime = run_connection(id, &url, role, batcher.clone(), ctx.clone(), stop_rx.clone()).await;
                active.fetch_sub(1, Ordering::Relaxed);

                if *stop_rx.borrow() {
                    break;
                }
                backoff.observe(lifetime);
                log::warn!(
                    "connection {id} ({role:?}): reconnecting in {:.1}s",
                    backoff.current().as_secs_f64()
                );
                tokio::time::sleep(backoff.current()).await;
            }
        })
    }

    /// Force every connection closed and reopened, preserving everything
    /// external to the pool (scheduler state, target map, canvas mirror,
    /// token manager) — only in-flight tasks and the shared batcher's queue
    /// are abandoned (§4.10). Implemented by restarting the whole pool's
    /// supervised tasks and draining `batcher` in place — the `Arc` is
    /// shared with the scheduler, which enqueues into it directly, so it
    /// can't be swapped for a fresh one here.
    pub async fn reconnect_all(&mut self) {
        self.stop_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        let dropped = self.batcher.clear().await;
        if dropped > 0 {
            log::warn!("reconnect_all: dropped {dropped} queued frame(s) from the abandoned batcher queue");
        }
        self.stop_tx.send_replace(false);
        self.start();
    }

    pub async fn shutdown(mut self) {
        self.stop_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_on_short_lifetime() {
        let mut b = Backoff::new();
        b.observe(Duration::from_secs(2));
        assert_eq!(b.current(), Duration::from_secs(2));
        b.observe(Duration::from_secs(2));
        assert_eq!(b.current(), Duration::from_secs(4));
    }

    #[test]
    fn backoff_halves_on_medium_lifetime() {
        let mut b = Backoff::new();
        b.observe(Duration::from_secs(2));
        b.observe(Duration::from_secs(2));
        b.observe(Duration::from_secs(2));
        assert_eq!(b.current(), Duration::from_secs(8));
        b.observe(Duration::from_secs(45));
        assert_eq!(b.current(), Duration::from_secs(4));
    }

    #[test]
    fn backoff_resets_on_long_lifetime() {
        let mut b = Backoff::new();
        b.observe(Duration::from_secs(2));
        b.observe(Duration::from_secs(2));
        assert_eq!(b.current(), Duration::from_secs(4));
        b.observe(Duration::from_secs(90));
        assert_eq!(b.current(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_capped() {
        let mut b = Backoff::new();
        for _ in 0..10 {
            b.observe(Duration::from_secs(1));
        }
        assert_eq!(b.current(), Duration::from_secs(60));
    }
}
