//! §4.8 canvas mirror. Populated at startup from the full board snapshot,
//! thereafter mutated only by decoded `0xfa` board-update records. Grounded
//! on the teacher's `canvas.rs` (single owned pixel buffer, `set_pixel`)
//! simplified from its RCU buffer-pool (built for many lock-free server
//! workers) down to one `RwLock<HashMap>` — this crate has one writer (the
//! receive loop) and one reader class (the scheduler), not a worker farm.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

use crate::wire::{Color, Pos};
use crate::{CANVAS_HEIGHT, CANVAS_WIDTH};

pub const SNAPSHOT_BYTES: usize = CANVAS_WIDTH as usize * CANVAS_HEIGHT as usize * 3;

pub struct CanvasMirror {
    pixels: RwLock<HashMap<Pos, Color>>,
    target_domain: RwLock<Arc<HashSet<Pos>>>,
    changed: Notify,
}

impl CanvasMirror {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pixels: RwLock::new(HashMap::new()),
            target_domain: RwLock::new(Arc::new(HashSet::new())),
            changed: Notify::new(),
        })
    }

    /// Parse a `getboard` HTTP body: 1,800,000 bytes of row-major RGB
    /// triples, 1000-pixel row stride, 600 rows (§6).
    pub async fn load_snapshot(&self, body: &[u8]) -> Result<(), String> {
        if body.len() != SNAPSHOT_BYTES {
            return Err(format!(
                "snapshot body is {} bytes, expected {}",
                body.len(),
                SNAPSHOT_BYTES
            ));
        }
        let mut pixels = self.pixels.write().await;
        pixels.clear();
        pixels.reserve(CANVAS_WIDTH as usize * CANVAS_HEIGHT as usize);
        for y in 0..CANVAS_HEIGHT {
            for x in 0..CANVAS_WIDTH {
                let idx = (y as usize * CANVAS_WIDTH as usize + x as usize) * 3;
                let color = Color::new(body[idx], body[idx + 1], body[idx + 2]);
                pixels.insert(Pos::new(x, y), color);
            }
        }
        Ok(())
    }

    /// Install the set of coordinates the composer's `TargetMap` claims, so
    /// `set` knows when to wake the scheduler (§4.8: "Wakes the scheduler on
    /// every 0xfa that falls within the current TargetMap's domain").
    pub async fn set_target_domain(&self, domain: Arc<HashSet<Pos>>) {
        *self.target_domain.write().await = domain;
    }

    pub async fn get(&self, pos: Pos) -> Option<Color> {
        self.pixels.read().await.get(&pos).copied()
    }

    /// Apply a decoded board-update. Notifies the scheduler only when `pos`
    /// is inside the current target domain, matching §4.8's precise wake
    /// condition rather than waking on every unrelated pixel on the canvas.
    pub async fn set(&self, pos: Pos, color: Color) {
        self.pixels.write().await.insert(pos, color);
        if self.target_domain.read().await.contains(&pos) {
            self.changed.notify_waiters();
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.pixels.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.pixels.read().await.len()
    }

    /// Scheduler suspension point: wait until a relevant `0xfa` lands or
    /// `timeout` elapses, whichever comes first.
    pub async fn wait_for_change(&self, timeout: std::time::Duration) {
        tokio::select! {
            _ = self.changed.notified() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

impl Default for CanvasMirror {
    fn default() -> Self {
        // `Arc::new` wrapping is only meaningful via `new()`; `Default` here
        // exists so `CanvasMirror` can appear in `#[derive(Default)]` test
        // fixtures without an Arc.
        Self {
            pixels: RwLock::new(HashMap::new()),
            target_domain: RwLock::new(Arc::new(HashSet::new())),
            changed: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_snapshot_rejects_wrong_length() {
        let mirror = CanvasMirror::new();
        let err = mirror.load_snapshot(&[0u8; 10]).await.unwrap_err();
        assert!(err.contains("1800000") || err.contains("expected"));
    }

    #[tokio::test]
    async fn load_snapshot_populates_row_major() {
        let mirror = CanvasMirror::new();
        let mut body = vec![0u8; SNAPSHOT_BYTES];
        // pixel (2, 1): row 1, col 2
        let idx = (1 * CANVAS_WIDTH as usize + 2) * 3;
        body[idx] = 10;
        body[idx + 1] = 20;
        body[idx + 2] = 30;
        mirror.load_snapshot(&body).await.unwrap();
        assert_eq!(mirror.get(Pos::new(2, 1)).await, Some(Color::new(10, 20, 30)));
        assert_eq!(mirror.get(Pos::new(0, 0)).await, Some(Color::new(0, 0, 0)));
    }

    #[tokio::test]
    async fn set_then_get_returns_latest_color() {
        let mirror = CanvasMirror::new();
        let pos = Pos::new(10, 20);
        mirror.set(pos, Color::new(255, 0, 0)).await;
        assert_eq!(mirror.get(pos).await, Some(Color::new(255, 0, 0)));
    }
}
