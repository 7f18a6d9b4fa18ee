//! §4.9 scheduler — the design center. A single cooperative loop matching
//! ready credentials to divergent pixels; CPU is not the bottleneck
//! (network and cooldown are), so this never needs to be parallelized
//! across cores. Grounded on the teacher's `master.rs` drain loop
//! (restructured around divergence scanning instead of a cooldown bitset)
//! and `original_source/main.py`'s per-cooldown ready-set allocation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};

use crate::batcher::Batcher;
use crate::canvas::CanvasMirror;
use crate::composer::TargetMap;
use crate::config::ScanMode;
use crate::stats::Stats;
use crate::token::TokenManager;
use crate::wire::{Color, PaintFrame, PaintResultStatus, Pos};

/// Kept only for a few seconds to correlate a later `0xff` back to the
/// credential/color that caused it (§3 `ActiveTask`). Never consulted to
/// decide future assignments.
#[derive(Debug, Clone)]
struct ActiveTask {
    pos: Pos,
    color: Color,
    uid: u32,
    submitted_at: Instant,
}

const ACTIVE_TASK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_GC_INTERVAL_ITERATIONS: u64 = 1000;

pub struct Scheduler {
    target: Arc<TargetMap>,
    canvas: Arc<CanvasMirror>,
    tokens: Arc<TokenManager>,
    batcher: Arc<Batcher>,
    stats: Arc<Stats>,
    layer_scan_mode: HashMap<usize, ScanMode>,
    cooldown: Duration,

    locks: Mutex<HashMap<Pos, Instant>>,
    active_tasks: Mutex<HashMap<u32, ActiveTask>>,
    /// Strict/loop re-queue bookkeeping (SPEC_FULL §D): positions needing
    /// priority attention ahead of the plain scan-cursor order. Strict
    /// pushes to the front, loop pushes to the back.
    priority_queue: Mutex<VecDeque<Pos>>,

    paint_id_counter: AtomicU32,
    scan_cursor: std::sync::atomic::AtomicUsize,
    iterations: AtomicU64,
}

impl Scheduler {
    pub fn new(
        target: Arc<TargetMap>,
        canvas: Arc<CanvasMirror>,
        tokens: Arc<TokenManager>,
        batcher: Arc<Batcher>,
        stats: Arc<Stats>,
        layer_scan_mode: HashMap<usize, ScanMode>,
        cooldown_seconds: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            canvas,
            tokens,
            batcher,
            stats,
            layer_scan_mode,
            cooldown: Duration::from_secs_f64(cooldown_seconds.max(0.0)),
            locks: Mutex::new(HashMap::new()),
            active_tasks: Mutex::new(HashMap::new()),
            priority_queue: Mutex::new(VecDeque::new()),
            paint_id_counter: AtomicU32::new(0),
            scan_cursor: std::sync::atomic::AtomicUsize::new(0),
            iterations: AtomicU64::new(0),
        })
    }

    fn next_paint_id(&self) -> u32 {
        self.paint_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// One allocation pass (§4.9 steps 1-6). Returns the number of
    /// assignments made, so the caller (`run`) can decide whether to sleep.
    async fn tick(&self, now: Instant) -> usize {
        let ready = self.tokens.ready_credentials(now).await;
        if ready.is_empty() {
            return 0;
        }
        let ready_count = ready.len();

        let total_targets = self.target.len();
        let k = if ready_count <= 50 { 20 } else { 50 };
        let max_steps = total_targets.min(ready_count.saturating_mul(k));

        let mut assigned = 0usize;
        let mut ready_iter_idx = 0usize;

        // Priority re-queue positions (strict/loop) get first claim on this
        // tick's ready credentials, ahead of the plain scan order.
        {
            let mut priority = self.priority_queue.lock().await;
            while ready_iter_idx < ready.len() {
                let Some(pos) = priority.pop_front() else { break };
                if !self.needs_write(pos, now).await {
                    continue;
                }
                let uid = ready[ready_iter_idx];
                ready_iter_idx += 1;
                self.assign(pos, uid, now).await;
                assigned += 1;
            }
        }

        if total_targets > 0 {
            let cursor = self.scan_cursor.load(Ordering::Relaxed);
            for step in 0..max_steps {
                if ready_iter_idx >= ready.len() {
                    break;
                }
                let idx = (cursor + step) % total_targets;
                let pos = self.target.scan_order[idx];
                if !self.needs_write(pos, now).await {
                    continue;
                }
                let uid = ready[ready_iter_idx];
                ready_iter_idx += 1;
                self.assign(pos, uid, now).await;
                assigned += 1;
            }
            self.scan_cursor
                .store((cursor + max_steps) % total_targets, Ordering::Relaxed);
        }

        let iteration = self.iterations.fetch_add(1, Ordering::Relaxed);
        if iteration % LOCK_GC_INTERVAL_ITERATIONS == 0 {
            self.gc_expired_locks(now).await;
        }
        self.expire_active_tasks(now).await;

        assigned
    }

    async fn needs_write(&self, pos: Pos, now: Instant) -> bool {
        let Some(target_color) = self.target.get(pos) else {
            return false;
        };
        if self.canvas.get(pos).await == Some(target_color) {
            return false;
        }
        let locks = self.locks.lock().await;
        match locks.get(&pos) {
            Some(deadline) => *deadline <= now,
            None => true,
        }
    }

    async fn assign(&self, pos: Pos, uid: u32, now: Instant) {
        let Some(color) = self.target.get(pos) else { return };
        let Some(token) = self.tokens.token_for(uid).await else { return };
        let paint_id = self.next_paint_id();

        let frame = PaintFrame {
            pos,
            color,
            uid,
            token,
            paint_id,
        };
        self.batcher.enqueue(frame.encode()).await;
        self.stats.record_submission(uid, pos, color).await;

        self.active_tasks.lock().await.insert(
            paint_id,
            ActiveTask {
                pos,
                color,
                uid,
                submitted_at: now,
            },
        );

        // Cooldown starts at enqueue time, not server acknowledgment (§4.6,
        // §5 ordering guarantees).
        self.tokens.mark_used(uid, now).await;
        self.locks.lock().await.insert(pos, now + self.cooldown);
    }

    async fn gc_expired_locks(&self, now: Instant) {
        let mut locks = self.locks.lock().await;
        let expired: Vec<Pos> = locks
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(pos, _)| *pos)
            .collect();
        for pos in &expired {
            locks.remove(pos);
        }
        drop(locks);

        for pos in expired {
            let Some(owner) = self.target.owner_of(pos) else { continue };
            if self.layer_scan_mode.get(&owner) != Some(&ScanMode::Strict) {
                continue;
            }
            let target_color = self.target.get(pos);
            if self.canvas.get(pos).await != target_color {
                self.priority_queue.lock().await.push_front(pos);
            }
        }
    }

    async fn expire_active_tasks(&self, now: Instant) {
        let mut tasks = self.active_tasks.lock().await;
        tasks.retain(|_, task| now.duration_since(task.submitted_at) < ACTIVE_TASK_TIMEOUT);
    }

    /// Consume a decoded `0xff` paint result: reset/advance the owning
    /// credential's `fail_count`, re-issue its token on `TokenInvalid`, and
    /// — for `loop`-mode layers — push the position to the back of the
    /// priority queue on any failure (§4.9 scan_mode, SPEC_FULL §D).
    pub async fn handle_paint_result(&self, paint_id: u32, status: PaintResultStatus) {
        let task = self.active_tasks.lock().await.get(&paint_id).cloned();
        let Some(task) = task else { return };

        match status {
            PaintResultStatus::Success => {
                self.tokens.mark_result(task.uid, true).await;
            }
            PaintResultStatus::TokenInvalid => {
                self.tokens.mark_invalid(task.uid);
            }
            PaintResultStatus::Cooldown => {
                // Silently ignored — expected under race conditions (§7).
            }
            PaintResultStatus::ServerError | PaintResultStatus::Unauthorized | PaintResultStatus::Malformed => {
                self.tokens.mark_result(task.uid, false).await;
                if let Some(owner) = self.target.owner_of(task.pos) {
                    if self.layer_scan_mode.get(&owner) == Some(&ScanMode::Loop) {
                        let target_color = self.target.get(task.pos);
                        if self.canvas.get(task.pos).await != target_color {
                            self.priority_queue.lock().await.push_back(task.pos);
                        }
                    }
                }
            }
            PaintResultStatus::Unknown(_) => {}
        }
    }

    /// Drives the paint-result channel (receiver side of
    /// `ConnectionContext::paint_results`) until the sender side is dropped.
    pub async fn run_result_drain(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(u32, PaintResultStatus)>) {
        while let Some((paint_id, status)) = rx.recv().await {
            self.handle_paint_result(paint_id, status).await;
        }
    }

    /// The cooperative allocation loop (§4.9 step 2: spin with a ~1ms sleep
    /// when nothing is ready). Runs until `stop` fires.
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }
            let now = Instant::now();
            let assigned = self.tick(now).await;
            if assigned == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                    _ = self.canvas.wait_for_change(Duration::from_millis(1)) => {}
                    _ = stop.changed() => {}
                }
            }
        }
    }

    pub async fn divergence_count(&self, now: Instant) -> usize {
        let mut count = 0;
        for &pos in &self.target.scan_order {
            if self.needs_write(pos, now).await {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::PaintboardClient;
    use std::collections::HashSet;

    fn single_pixel_target(pos: Pos, color: Color) -> Arc<TargetMap> {
        let mut colors = HashMap::new();
        let mut owner = HashMap::new();
        colors.insert(pos, color);
        owner.insert(pos, 0);
        Arc::new(TargetMap {
            colors,
            owner,
            scan_order: vec![pos],
            per_layer: vec![VecDeque::from(vec![pos])],
            domain: Arc::new(HashSet::from([pos])),
        })
    }

    async fn manager_with_credential(uid: u32, cooldown: f64) -> Arc<TokenManager> {
        let client = Arc::new(PaintboardClient::new("https://example.invalid").unwrap());
        let manager = TokenManager::new(client, cooldown, 3600);
        manager.credentials.write().await.insert(
            uid,
            crate::token::Credential {
                uid,
                access_key: "key".into(),
                token: [1u8; 16],
                issued_at: Instant::now(),
                invalid_count: 0,
                fail_count: 0,
                last_use: None,
                invalid: false,
            },
        );
        manager
    }

    #[tokio::test]
    async fn single_divergent_pixel_gets_exactly_one_assignment_per_cooldown() {
        let pos = Pos::new(10, 20);
        let color = Color::new(255, 0, 0);
        let target = single_pixel_target(pos, color);
        let canvas = CanvasMirror::new();
        canvas.set_target_domain(target.domain.clone()).await;
        let tokens = manager_with_credential(42, 1.0).await;
        let batcher = Batcher::new();
        let stats = Arc::new(Stats::new());

        let scheduler = Scheduler::new(
            target.clone(),
            canvas.clone(),
            tokens.clone(),
            batcher.clone(),
            stats,
            HashMap::new(),
            1.0,
        );

        let now = Instant::now();
        let assigned = scheduler.tick(now).await;
        assert_eq!(assigned, 1);

        let message = batcher.drain_batch().await.unwrap();
        let frame = PaintFrame::decode(&message).unwrap();
        assert_eq!(frame.pos, pos);
        assert_eq!(frame.color, color);
        assert_eq!(frame.uid, 42);

        // Cooldown still in effect: nothing new to assign immediately after.
        let assigned_again = scheduler.tick(now + Duration::from_millis(100)).await;
        assert_eq!(assigned_again, 0);
    }

    #[tokio::test]
    async fn matching_pixel_is_never_assigned() {
        let pos = Pos::new(1, 1);
        let color = Color::new(9, 9, 9);
        let target = single_pixel_target(pos, color);
        let canvas = CanvasMirror::new();
        canvas.set_target_domain(target.domain.clone()).await;
        canvas.set(pos, color).await;
        let tokens = manager_with_credential(7, 1.0).await;
        let batcher = Batcher::new();
        let stats = Arc::new(Stats::new());

        let scheduler = Scheduler::new(target, canvas, tokens, batcher, stats, HashMap::new(), 1.0);
        let assigned = scheduler.tick(Instant::now()).await;
        assert_eq!(assigned, 0);
    }

    #[tokio::test]
    async fn token_invalid_result_triggers_refresh_request() {
        let pos = Pos::new(5, 5);
        let color = Color::new(1, 2, 3);
        let target = single_pixel_target(pos, color);
        let canvas = CanvasMirror::new();
        canvas.set_target_domain(target.domain.clone()).await;
        let tokens = manager_with_credential(3, 1.0).await;
        let batcher = Batcher::new();
        let stats = Arc::new(Stats::new());

        let scheduler = Scheduler::new(target, canvas, tokens, batcher, stats, HashMap::new(), 1.0);
        let now = Instant::now();
        scheduler.tick(now).await;

        let paint_id = 0u32; // first paint_id issued
        scheduler.handle_paint_result(paint_id, PaintResultStatus::TokenInvalid).await;
        // No panic / no assignment change is the observable contract here;
        // `TokenManager::mark_invalid` behavior is covered in token.rs tests.
    }
}
