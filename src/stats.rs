//! Shared read-mostly progress/coverage struct (§9 Design Notes: "a single
//! read-mostly struct published atomically from the scheduler/progress
//! task; the UI collaborator polls or subscribes"). Also carries the
//! per-credential coverage/resistance metric from
//! `original_source/main.py`'s `user_last_snapshot` (SPEC_FULL §C.1), kept
//! here rather than in `token.rs` because it's a pure observability signal,
//! not something the scheduler consults to decide assignments.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::RwLock;

use crate::wire::{Color, Pos};

/// How many of a credential's own recent confirmed paints to remember for
/// the resistance metric. Matches the original's `SNAPSHOT_SIZE`.
pub const SNAPSHOT_SIZE: usize = 100;

/// Monotonically increasing counters, safe to read from any task without a
/// lock. Mirrors the "shared stats struct" §4.9's stall detector reads.
#[derive(Debug, Default)]
pub struct Counters {
    pub frames_submitted: AtomicU64,
    pub paint_results_success: AtomicU64,
    pub paint_results_failed: AtomicU64,
    pub board_updates_observed: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    /// Confirmed successful writes (`0xff` status `0xef`) — the counter
    /// §4.9's stall detector and §4.11's efficiency measurement both need,
    /// as distinct from `frames_submitted` (which advances at enqueue time
    /// regardless of whether anything ever lands, §4.6).
    pub fn paint_results_success(&self) -> u64 {
        self.paint_results_success.load(Ordering::Relaxed)
    }

    pub fn board_updates_observed(&self) -> u64 {
        self.board_updates_observed.load(Ordering::Relaxed)
    }

    pub fn record_submitted(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result(&self, success: bool) {
        if success {
            self.paint_results_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.paint_results_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_board_update(&self) {
        self.board_updates_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-uid recent-paint snapshot and derived resistance percentage
/// (SPEC_FULL §C.1): the fraction of a credential's own recent confirmed
/// paints that have since been overwritten by someone else.
#[derive(Debug, Clone, Default)]
pub struct CredentialCoverage {
    pub uid: u32,
    pub recent: VecDeque<(Pos, Color)>,
    pub overwritten: usize,
}

impl CredentialCoverage {
    fn new(uid: u32) -> Self {
        Self {
            uid,
            recent: VecDeque::with_capacity(SNAPSHOT_SIZE),
            overwritten: 0,
        }
    }

    fn record_paint(&mut self, pos: Pos, color: Color) {
        if self.recent.len() >= SNAPSHOT_SIZE {
            self.recent.pop_front();
        }
        self.recent.push_back((pos, color));
    }

    /// Called when a `0xfa` observes `pos` now holding a color different
    /// from what this credential last painted there.
    fn note_possible_overwrite(&mut self, pos: Pos, new_color: Color) {
        if let Some(&(_, last_color)) = self.recent.iter().find(|(p, _)| *p == pos) {
            if last_color != new_color {
                self.overwritten += 1;
            }
        }
    }

    pub fn resistance_pct(&self) -> f32 {
        if self.recent.is_empty() {
            return 100.0;
        }
        let surviving = self.recent.len().saturating_sub(self.overwritten);
        100.0 * surviving as f32 / self.recent.len() as f32
    }
}

/// Progress snapshot published for UI/CLI consumers (§9: "published
/// atomically", polled rather than locked piecemeal).
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total_targets: usize,
    pub matched: usize,
    pub ready_credentials: usize,
    pub active_connections: usize,
    pub frames_submitted: u64,
}

pub struct Stats {
    pub counters: Counters,
    coverage: RwLock<HashMap<u32, CredentialCoverage>>,
    progress: RwLock<ProgressSnapshot>,
    started_at: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            coverage: RwLock::new(HashMap::new()),
            progress: RwLock::new(ProgressSnapshot::default()),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub async fn record_submission(&self, uid: u32, pos: Pos, color: Color) {
        self.counters.record_submitted();
        let mut coverage = self.coverage.write().await;
        coverage
            .entry(uid)
            .or_insert_with(|| CredentialCoverage::new(uid))
            .record_paint(pos, color);
    }

    /// Called by the canvas mirror's board-update dispatch so every
    /// credential's coverage table can check whether its own recent work
    /// was just overwritten by someone else.
    pub async fn observe_board_update(&self, pos: Pos, color: Color) {
        self.counters.record_board_update();
        let mut coverage = self.coverage.write().await;
        for entry in coverage.values_mut() {
            entry.note_possible_overwrite(pos, color);
        }
    }

    pub async fn resistance_pct(&self, uid: u32) -> Option<f32> {
        self.coverage.read().await.get(&uid).map(|c| c.resistance_pct())
    }

    pub async fn publish_progress(&self, snapshot: ProgressSnapshot) {
        *self.progress.write().await = snapshot;
    }

    pub async fn progress(&self) -> ProgressSnapshot {
        self.progress.read().await.clone()
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resistance_drops_when_overwritten() {
        let stats = Stats::new();
        let pos = Pos::new(1, 1);
        let red = Color::new(255, 0, 0);
        let blue = Color::new(0, 0, 255);

        stats.record_submission(7, pos, red).await;
        assert_eq!(stats.resistance_pct(7).await, Some(100.0));

        // Someone else paints over it with a different color.
        stats.observe_board_update(pos, blue).await;
        assert_eq!(stats.resistance_pct(7).await, Some(0.0));
    }

    #[tokio::test]
    async fn matching_board_update_is_not_an_overwrite() {
        let stats = Stats::new();
        let pos = Pos::new(2, 2);
        let red = Color::new(255, 0, 0);

        stats.record_submission(7, pos, red).await;
        stats.observe_board_update(pos, red).await;
        assert_eq!(stats.resistance_pct(7).await, Some(100.0));
    }
}
