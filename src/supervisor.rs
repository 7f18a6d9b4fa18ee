//! §4.10 supervisor. Owns the pool, scheduler, token refresher, and (when
//! enabled) the estimator; fetches the initial snapshot with retry, starts
//! everything, then runs the periodic health check that detects stalls and
//! triggers reconnects. Grounded on `clawde-io-apps`'s `relay/mod.rs`
//! `sleep_backoff` and `connectivity/monitor.rs`'s degradation tracking,
//! generalized from "one relay connection" to "the whole pool + scheduler".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::canvas::CanvasMirror;
use crate::composer;
use crate::config::Config;
use crate::connection::ConnectionContext;
use crate::error::{PainterError, Result};
use crate::http::PaintboardClient;
use crate::image;
use crate::pool::ConnectionPool;
use crate::scheduler::Scheduler;
use crate::stats::Stats;
use crate::token::TokenManager;

/// Snapshot fetch retry: exponential backoff capped at 8s over four
/// attempts (§5 Cancellation & timeouts).
const SNAPSHOT_RETRY_ATTEMPTS: u32 = 4;
const SNAPSHOT_RETRY_CAP: Duration = Duration::from_secs(8);

/// Stall detection window (§4.9, §7): if successful-frame counters haven't
/// advanced for this long while ready credentials exist, force a reconnect
/// of the pool.
const STALL_WINDOW: Duration = Duration::from_secs(120);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub struct Supervisor {
    config: Config,
    base_url: String,
    ws_url: String,
    client: Arc<PaintboardClient>,
    canvas: Arc<CanvasMirror>,
    tokens: Arc<TokenManager>,
    stats: Arc<Stats>,
    stop_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: Config, base_url: String, ws_url: String) -> Result<Self> {
        let client = Arc::new(PaintboardClient::new(base_url.clone())?);
        let tokens = TokenManager::new(
            client.clone(),
            config.user_cooldown_seconds,
            config.token_refresh_interval_seconds,
        );
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            base_url,
            ws_url,
            client,
            canvas: CanvasMirror::new(),
            tokens,
            stats: Arc::new(Stats::new()),
            stop_tx,
        })
    }

    pub fn stop_handle(&self) -> watch::Sender<bool> {
        self.stop_tx.clone()
    }

    /// Runs the painter to completion (until `stop` fires). Returns a fatal
    /// error for the conditions §7 names as fatal.
    pub async fn run(mut self) -> Result<()> {
        let _proxy_guard = crate::proxy::DirectConnectionGuard::install(host_of(&self.base_url));

        log::info!("issuing tokens for {} configured users", self.config.users.len());
        self.tokens
            .issue_initial(&self.config.users, self.config.max_enabled_tokens)
            .await;
        if self.tokens.active_count().await == 0 {
            return Err(PainterError::NoCredentials);
        }

        let layers = image::load_layers(&self.config.images);
        let target = Arc::new(composer::compose(&layers, self.config.ignore_semitransparent));
        if target.is_empty() {
            return Err(PainterError::EmptyTargetMap);
        }
        self.canvas.set_target_domain(target.domain.clone()).await;

        let layer_scan_mode: HashMap<usize, crate::config::ScanMode> =
            layers.iter().map(|l| (l.config_index, l.scan_mode)).collect();

        self.fetch_snapshot_with_retry().await;

        let (paint_results_tx, paint_results_rx) = mpsc::unbounded_channel();
        let ctx = ConnectionContext {
            canvas: self.canvas.clone(),
            tokens: self.tokens.clone(),
            stats: self.stats.clone(),
            paint_results: paint_results_tx,
        };

        let writeonly = self.config.writeonly_connections;
        let mut pool = ConnectionPool::new(&self.ws_url, writeonly, ctx);
        pool.start();

        let scheduler = Scheduler::new(
            target.clone(),
            self.canvas.clone(),
            self.tokens.clone(),
            pool.batcher.clone(),
            self.stats.clone(),
            layer_scan_mode,
            self.config.user_cooldown_seconds,
        );

        let scheduler_task = tokio::spawn(scheduler.clone().run(self.stop_tx.subscribe()));
        let result_drain_task = tokio::spawn(scheduler.clone().run_result_drain(paint_results_rx));
        let refresh_task = tokio::spawn(self.tokens.clone().run_refresh_loop(self.stop_tx.subscribe()));

        self.health_loop(&mut pool).await;

        self.stop_tx.send_replace(true);
        scheduler_task.abort();
        result_drain_task.abort();
        refresh_task.abort();
        pool.shutdown().await;

        Ok(())
    }

    async fn fetch_snapshot_with_retry(&self) {
        let mut delay = Duration::from_millis(500);
        for attempt in 1..=SNAPSHOT_RETRY_ATTEMPTS {
            match self.client.fetch_snapshot().await {
                Ok(body) => {
                    if let Err(e) = self.canvas.load_snapshot(&body).await {
                        log::error!("snapshot body rejected: {e}");
                    } else {
                        log::info!("initial snapshot loaded");
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("snapshot fetch attempt {attempt}/{SNAPSHOT_RETRY_ATTEMPTS} failed: {e}");
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(SNAPSHOT_RETRY_CAP);
        }
        log::error!("snapshot unavailable after retries; mirror stays empty, all targets appear divergent");
    }

    /// Periodic health check: detect zero-growth stalls and force a
    /// pool-wide reconnect, without touching scheduler/target/canvas/token
    /// state (§4.10).
    async fn health_loop(&self, pool: &mut ConnectionPool) {
        let mut stop = self.stop_tx.subscribe();
        // Keyed on *successful* writes (§4.9 "successful-frame counters",
        // §7 "Successful writes haven't advanced"), not `frames_submitted`:
        // that counter advances at enqueue time regardless of whether the
        // read connection is even alive, so it would never detect a stall.
        let mut last_success_count = self.stats.counters.paint_results_success();
        let mut last_progress_at = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }

            let current = self.stats.counters.paint_results_success();
            if current != last_success_count {
                last_success_count = current;
                last_progress_at = Instant::now();
                continue;
            }

            let ready = self.tokens.ready_credentials(Instant::now()).await;
            if !ready.is_empty() && last_progress_at.elapsed() >= STALL_WINDOW {
                log::warn!(
                    "zero-growth stall: no successful writes for {:.0}s with {} credentials ready, reconnecting",
                    last_progress_at.elapsed().as_secs_f64(),
                    ready.len()
                );
                pool.reconnect_all().await;
                self.stats.counters.record_reconnect();
                last_progress_at = Instant::now();
            }
        }
    }
}

fn host_of(base_url: &str) -> &str {
    base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(base_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_of_strips_scheme_and_path() {
        assert_eq!(host_of("https://paintboard.example.com/api"), "paintboard.example.com");
        assert_eq!(host_of("paintboard.example.com"), "paintboard.example.com");
    }
}
