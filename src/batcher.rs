//! §4.3 per-connection batcher. Coalesces 31-byte paint frames into single
//! binary messages capped at 32,000 bytes (server max is 32,768; the margin
//! avoids edge rejection). Grounded on `original_source/main.py`'s
//! `append_to_queue`/`get_merged_data`/`send_paint_data`; queue shape (one
//! producer — the scheduler — one consumer — the sender loop) follows the
//! teacher's `spsc.rs` single-producer/single-consumer ring buffer, but uses
//! a plain `VecDeque` behind a `tokio::sync::Mutex` instead of the teacher's
//! unsafe fixed-capacity ring: this queue is never the bottleneck (§5/§9 say
//! throughput is bounded by network and cooldown, not CPU), so the unsafe
//! lock-free structure buys nothing here.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::wire::PAINT_FRAME_LEN;

/// Keep messages comfortably under the server's 32,768-byte hard limit.
pub const MAX_BATCH_BYTES: usize = 32_000;

/// Default sender-loop wake interval; adapted downward under high throughput
/// per §4.3 ("adapted downward when credential throughput allows").
pub const DEFAULT_TICK_MS: u64 = 10;
pub const MIN_TICK_MS: u64 = 2;

pub struct Batcher {
    queue: Mutex<VecDeque<[u8; PAINT_FRAME_LEN]>>,
    notify: Notify,
}

impl Batcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Enqueue one paint frame and wake the sender loop if it's sleeping on
    /// the interval timer.
    pub async fn enqueue(&self, frame: [u8; PAINT_FRAME_LEN]) {
        self.queue.lock().await.push_back(frame);
        self.notify.notify_one();
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Wait until either a frame is enqueued or `tick` elapses.
    pub async fn wait_for_work(&self, tick: std::time::Duration) {
        if !self.is_empty().await {
            return;
        }
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(tick) => {}
        }
    }

    /// Drop every queued frame without sending it, returning how many were
    /// dropped. Used on a pool-wide reconnect (§4.10): stale frames queued
    /// against connections that are about to be torn down must not carry
    /// over into the replacement connections.
    pub async fn clear(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Dequeue frames into one message, never exceeding `MAX_BATCH_BYTES` and
    /// never splitting a 31-byte frame (§3 Invariants). Returns `None` when
    /// the queue is empty.
    pub async fn drain_batch(&self) -> Option<Vec<u8>> {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return None;
        }

        let mut message = Vec::new();
        while let Some(frame) = queue.front() {
            if message.len() + PAINT_FRAME_LEN > MAX_BATCH_BYTES {
                break;
            }
            message.extend_from_slice(frame);
            queue.pop_front();
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> [u8; PAINT_FRAME_LEN] {
        let mut f = [0u8; PAINT_FRAME_LEN];
        f[0] = tag;
        f
    }

    #[tokio::test]
    async fn drains_nothing_when_empty() {
        let batcher = Batcher::new();
        assert!(batcher.drain_batch().await.is_none());
    }

    #[tokio::test]
    async fn drain_batch_never_exceeds_cap_and_never_splits_a_frame() {
        let batcher = Batcher::new();
        let per_message_cap = MAX_BATCH_BYTES / PAINT_FRAME_LEN;
        let total = per_message_cap + 5;
        for i in 0..total {
            batcher.enqueue(frame((i % 256) as u8)).await;
        }

        let first = batcher.drain_batch().await.unwrap();
        assert!(first.len() <= MAX_BATCH_BYTES);
        assert_eq!(first.len() % PAINT_FRAME_LEN, 0);

        let second = batcher.drain_batch().await.unwrap();
        assert_eq!(second.len(), 5 * PAINT_FRAME_LEN);

        assert!(batcher.drain_batch().await.is_none());
    }

    #[tokio::test]
    async fn preserves_enqueue_order_within_a_connection() {
        let batcher = Batcher::new();
        for i in 0..4u8 {
            batcher.enqueue(frame(i)).await;
        }
        let message = batcher.drain_batch().await.unwrap();
        for i in 0..4usize {
            assert_eq!(message[i * PAINT_FRAME_LEN], i as u8);
        }
    }
}
