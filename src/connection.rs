//! §4.4 connection. One WebSocket with lifecycle, sender loop (§4.3), and a
//! receive loop that differs by role: the receive-capable connection
//! dispatches `0xfa`/`0xff` into the canvas mirror and token manager, a
//! send-only connection's receive loop only answers `0xfc` and detects
//! close. Grounded on `clawde-io-apps`'s `relay/mod.rs` (`connect_async`,
//! `SplitSink`/`SplitStream`, `tokio::select!` racing sender against
//! receiver) adapted from JSON text frames to this crate's binary opcode
//! stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::batcher::{Batcher, DEFAULT_TICK_MS};
use crate::canvas::CanvasMirror;
use crate::heartbeat::{HeartbeatTracker, PONG_BYTES};
use crate::stats::Stats;
use crate::token::TokenManager;
use crate::wire::{self, PaintResultStatus, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    ReadWrite,
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Draining,
    Closed,
}

/// Shared collaborators a connection's receive loop dispatches into. Only
/// the read-write connection's loop actually touches `canvas`; a
/// write-only connection still carries the reference (Open Question in
/// SPEC_FULL §D: write-only connections may receive `0xff` and use it to
/// reset `fail_count`) but never sees `0xfa` from the server by contract.
#[derive(Clone)]
pub struct ConnectionContext {
    pub canvas: Arc<CanvasMirror>,
    pub tokens: Arc<TokenManager>,
    pub stats: Arc<Stats>,
    /// Forwards decoded `0xff` paint-result records to the scheduler's
    /// `ActiveTask` resolver, which knows the uid a `paint_id` belongs to
    /// (a connection doesn't — the wire format carries no uid on results).
    pub paint_results: mpsc::UnboundedSender<(u32, PaintResultStatus)>,
}

pub struct Connection {
    pub id: usize,
    pub role: ConnectionRole,
    pub batcher: Arc<Batcher>,
    state: RwLock<ConnectionState>,
    healthy: AtomicBool,
    pub opened_at: Instant,
}

impl Connection {
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

/// Connect, then run the connection's sender and receiver loops until the
/// socket closes or `stop` fires. Returns the lifetime of the connection
/// (used by the supervisor's backoff policy, §4.10).
///
/// `batcher` may be a dedicated per-connection queue or a single queue
/// shared by the whole pool (§4.5 — either strategy is acceptable); this
/// function doesn't care which.
pub async fn run_connection(
    id: usize,
    url: &str,
    role: ConnectionRole,
    batcher: Arc<Batcher>,
    ctx: ConnectionContext,
    mut stop: watch::Receiver<bool>,
) -> Duration {
    let conn = Arc::new(Connection {
        id,
        role,
        batcher: batcher.clone(),
        state: RwLock::new(ConnectionState::Opening),
        healthy: AtomicBool::new(true),
        opened_at: Instant::now(),
    });

    let (ws_stream, _) = match tokio_tungstenite::connect_async(url).await {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("connection {id} ({role:?}): failed to open: {e}");
            return Duration::ZERO;
        }
    };
    *conn.state.write().await = ConnectionState::Open;
    log::info!("connection {id} ({role:?}): open");

    let (sink, mut stream) = ws_stream.split();
    // Both loops below write to the same socket half (the sender drains the
    // batcher, the receiver writes pongs inline) so the sink is shared behind
    // a lock rather than split a second time — `tungstenite` gives one
    // writable half per connection (§4.2/§4.3 both need direct wire access).
    let sink = Arc::new(tokio::sync::Mutex::new(sink));
    let mut heartbeat = HeartbeatTracker::new();

    let sender = async {
        let mut tick = Duration::from_millis(DEFAULT_TICK_MS);
        loop {
            conn.batcher.wait_for_work(tick).await;
            match conn.batcher.drain_batch().await {
                Some(message) if !message.is_empty() => {
                    if sink.lock().await.send(Message::Binary(message)).await.is_err() {
                        break;
                    }
                    // Yield so an interleaved ping can be answered between
                    // messages (§4.3: "Emission must yield control between
                    // messages").
                    tokio::task::yield_now().await;
                }
                _ => {}
            }
            // Adapt the tick downward under sustained throughput, bounded
            // at `MIN_TICK_MS` (§4.3).
            if conn.batcher.len().await > 0 {
                tick = (tick / 2).max(Duration::from_millis(crate::batcher::MIN_TICK_MS));
            } else {
                tick = Duration::from_millis(DEFAULT_TICK_MS);
            }
        }
    };

    let receiver = async {
        // §7 "Ping timeout": polled independently of `stream.next()` so a
        // connection that stops pinging but never errors or closes is still
        // caught (the read future would otherwise sit pending forever).
        let mut ping_check = tokio::time::interval(Duration::from_secs(5));
        ping_check.tick().await; // first tick fires immediately; skip it

        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = ping_check.tick() => {
                    if heartbeat.timed_out() {
                        log::warn!(
                            "connection {id}: no ping received for {:.0}s, marking dead",
                            heartbeat.seconds_since_last_ping()
                        );
                        conn.healthy.store(false, Ordering::Relaxed);
                        break;
                    }
                    continue;
                }
            };

            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    log::warn!("connection {id}: receive error: {e}");
                    break;
                }
                None => break,
            };

            let bytes = match msg {
                Message::Binary(b) => b,
                Message::Close(_) => break,
                _ => continue,
            };

            for event in wire::decode_stream(&bytes) {
                match event {
                    ServerEvent::Ping => {
                        heartbeat.on_ping();
                        // Bypass the batcher entirely — direct write within
                        // tens of milliseconds (§4.2).
                        match sink.lock().await.send(Message::Binary(PONG_BYTES.to_vec())).await {
                            Ok(()) => heartbeat.record_success(),
                            Err(e) => {
                                log::warn!("connection {id}: pong send failed: {e}");
                                if heartbeat.record_failure() {
                                    conn.healthy.store(false, Ordering::Relaxed);
                                    return;
                                }
                            }
                        }
                    }
                    ServerEvent::BoardUpdate { pos, color } => {
                        if role == ConnectionRole::ReadWrite {
                            ctx.canvas.set(pos, color).await;
                            ctx.stats.observe_board_update(pos, color).await;
                        }
                    }
                    ServerEvent::PaintResult { paint_id, status } => {
                        // Open Question (SPEC_FULL §D): write-only
                        // connections may receive these too; treated
                        // identically here since resolution is by paint_id,
                        // not connection.
                        ctx.stats.counters.record_result(matches!(status, PaintResultStatus::Success));
                        let _ = ctx.paint_results.send((paint_id, status));
                    }
                }
            }
        }
    };

    *conn.state.write().await = ConnectionState::Open;
    tokio::select! {
        _ = sender => {}
        _ = receiver => {}
        _ = stop.changed() => {
            *conn.state.write().await = ConnectionState::Draining;
        }
    }

    *conn.state.write().await = ConnectionState::Closed;
    let lifetime = conn.opened_at.elapsed();
    log::info!("connection {id} ({role:?}): closed after {:.1}s", lifetime.as_secs_f64());
    lifetime
}
