//! §4.11 token-count estimator, `-test` mode. Paints a known two-color
//! probe image against the live canvas, samples occupancy until a steady
//! state is detected (or a safety timeout), and reports the opponent's
//! effective token count under four efficiency assumptions. No example
//! repo implements this measurement; the statistics below follow spec §4.11
//! directly, using this crate's own painting pipeline (composer/canvas/
//! scheduler/pool) to actually run the probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::canvas::CanvasMirror;
use crate::composer;
use crate::config::{DrawMode, ScanMode, UserEntry};
use crate::connection::ConnectionContext;
use crate::error::Result;
use crate::http::PaintboardClient;
use crate::image::{ImageLayer, LayerKind};
use crate::pool::ConnectionPool;
use crate::scheduler::Scheduler;
use crate::stats::Stats;
use crate::token::TokenManager;

pub const PROBE_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy)]
pub struct ProbeRegion {
    pub start_x: i32,
    pub start_y: i32,
}

/// Threshold `source` (resized to 50x50) to two colors by perceptual
/// brightness at 0.5 (§4.11 step 2). Brightness uses the standard Rec.601
/// luma weights, matching how `kleinesfilmroellchen-hyperflut`'s
/// preprocessing computes luma for its cutoff mode.
pub fn generate_probe_pixels(source: &image::DynamicImage, light: crate::wire::Color, dark: crate::wire::Color) -> Vec<[u8; 4]> {
    let resized = source.resize_exact(PROBE_SIZE, PROBE_SIZE, image::imageops::FilterType::Lanczos3);
    let rgba = resized.to_rgba8();
    rgba.pixels()
        .map(|p| {
            let luma = 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32;
            let color = if luma / 255.0 >= 0.5 { light } else { dark };
            [color.r, color.g, color.b, 255]
        })
        .collect()
}

fn probe_layer(region: ProbeRegion, pixels: Vec<[u8; 4]>) -> ImageLayer {
    ImageLayer {
        kind: LayerKind::File,
        config_index: 0,
        origin_x: region.start_x,
        origin_y: region.start_y,
        width: PROBE_SIZE,
        height: PROBE_SIZE,
        pixels,
        // horizontal order chosen for efficiency, not aesthetics (§4.11 step 3).
        draw_mode: DrawMode::Horizontal,
        scan_mode: ScanMode::Normal,
        weight: 1.0,
        enabled: true,
    }
}

/// One occupancy sample: fraction of the probe's target pixels currently
/// matching, taken at a point in time.
#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    occupancy: f64,
}

/// Steady-state detector (§4.11 step 5). Tracks the running sample history
/// and decides, on each new sample, whether the process has settled.
struct SteadyStateDetector {
    frame_interval: Duration,
    samples: Vec<Sample>,
}

impl SteadyStateDetector {
    fn new(frame_interval: Duration) -> Self {
        Self {
            frame_interval,
            samples: Vec::new(),
        }
    }

    fn push(&mut self, occupancy: f64) {
        self.samples.push(Sample {
            at: Instant::now(),
            occupancy,
        });
    }

    fn min_samples(&self) -> usize {
        let per_60s = (60.0 / self.frame_interval.as_secs_f64()).ceil() as usize;
        20.max(per_60s)
    }

    fn window_len(&self) -> usize {
        let per_30s = (30.0 / self.frame_interval.as_secs_f64()).ceil() as usize;
        10.max(per_30s)
    }

    fn cv_threshold(mean: f64) -> f64 {
        if mean < 0.4 {
            0.30
        } else if mean < 0.7 {
            0.35
        } else {
            0.40
        }
    }

    /// A clear linear trend over the last >= 10 samples blocks steady-state
    /// (§4.11 step 5: "|slope| > 0.5%/frame over >= 10 samples").
    fn has_clear_trend(&self) -> bool {
        if self.samples.len() < 10 {
            return false;
        }
        let recent = &self.samples[self.samples.len() - 10..];
        let slope = linear_slope(recent);
        slope.abs() > 0.005
    }

    /// Returns `p_hat` (mean of the last 10 samples) once steady state is
    /// detected, else `None`.
    fn check(&self) -> Option<f64> {
        if self.samples.len() < self.min_samples() {
            return None;
        }
        let window = self.window_len().min(self.samples.len());
        let recent = &self.samples[self.samples.len() - window..];

        let max_occupancy = recent.iter().fold(f64::MIN, |m, s| m.max(s.occupancy));
        let earlier_max = self.samples[..self.samples.len() - window]
            .iter()
            .fold(f64::MIN, |m, s| m.max(s.occupancy));
        if max_occupancy > earlier_max + 1e-9 {
            return None; // still advancing
        }

        let mean: f64 = recent.iter().map(|s| s.occupancy).sum::<f64>() / recent.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        let variance: f64 = recent.iter().map(|s| (s.occupancy - mean).powi(2)).sum::<f64>() / recent.len() as f64;
        let cv = variance.sqrt() / mean;
        if cv > Self::cv_threshold(mean) {
            return None;
        }

        if self.has_clear_trend() {
            return None;
        }

        let tail = &self.samples[self.samples.len().saturating_sub(10)..];
        Some(tail.iter().map(|s| s.occupancy).sum::<f64>() / tail.len() as f64)
    }
}

fn linear_slope(samples: &[Sample]) -> f64 {
    let n = samples.len() as f64;
    let t0 = samples[0].at;
    let xs: Vec<f64> = samples.iter().map(|s| s.at.duration_since(t0).as_secs_f64()).collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.occupancy).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let cov: f64 = xs.iter().zip(&ys).map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let var: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    if var <= 0.0 {
        0.0
    } else {
        cov / var
    }
}

/// Safety timeout bounds (§4.11 step 6): `[180s, 600s]`, scaling with
/// cooldown so a slow-cooldown run is given proportionally longer to
/// settle. Open Question (not pinned by spec.md): this crate uses
/// `6 * cooldown_seconds` clamped to the stated range.
fn safety_timeout(cooldown_seconds: f64) -> Duration {
    Duration::from_secs_f64((6.0 * cooldown_seconds).clamp(180.0, 600.0))
}

#[derive(Debug, Clone)]
pub struct EstimatorReport {
    pub p_hat: f64,
    pub eta_m: f64,
    pub n_e_times_eta_e: f64,
    /// N_e under each of the four efficiency assumptions (§4.11 step 8).
    pub interpretations: HashMap<&'static str, f64>,
    pub steady_state_reached: bool,
    pub samples_taken: usize,
}

fn interpretations(n_e_eta_e: f64, eta_m: f64, overlap_ratio: f64) -> HashMap<&'static str, f64> {
    let mut map = HashMap::new();
    map.insert("eta_e=1", n_e_eta_e);
    map.insert("eta_e=eta_m", n_e_eta_e / eta_m);
    map.insert("eta_e=0.5", n_e_eta_e / 0.5);
    map.insert("eta_e=eta_m*overlap_area/enemy_area", n_e_eta_e / (eta_m * overlap_ratio).max(f64::EPSILON));
    map
}

pub struct EstimatorConfig {
    pub region: ProbeRegion,
    pub light: crate::wire::Color,
    pub dark: crate::wire::Color,
    pub source_image_path: String,
    pub token_count: u32,
    pub users: Vec<UserEntry>,
    pub cooldown_seconds: f64,
    /// Ratio of our probe's overlap area with the opponent's claimed area
    /// to the opponent's total claimed area; defaults to 1.0 (full overlap
    /// assumed) when unknown, per the fourth interpretation in §4.11 step 8.
    pub overlap_area_ratio: f64,
}

/// Runs the full estimation procedure against a live server (§4.11
/// steps 1-8): composes the probe as a single target layer, issues tokens
/// for the configured subset of `token_count` credentials, opens a
/// dedicated connection pool + scheduler, and samples occupancy until
/// steady state or the safety timeout.
pub async fn run(
    base_url: &str,
    ws_url: &str,
    config: EstimatorConfig,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> Result<EstimatorReport> {
    let source = image::open(&config.source_image_path)?;
    let pixels = generate_probe_pixels(&source, config.light, config.dark);
    let layer = probe_layer(config.region, pixels);
    let target = Arc::new(composer::compose(&[layer], false));

    let canvas = CanvasMirror::new();
    canvas.set_target_domain(target.domain.clone()).await;

    let client = Arc::new(PaintboardClient::new(base_url)?);
    if let Ok(snapshot) = client.fetch_snapshot().await {
        let _ = canvas.load_snapshot(&snapshot).await;
    }

    let tokens = TokenManager::new(client, config.cooldown_seconds, 3600);
    let users: Vec<UserEntry> = config.users.into_iter().take(config.token_count as usize).collect();
    tokens.issue_initial(&users, 0).await;

    let (paint_results_tx, paint_results_rx) = mpsc::unbounded_channel();
    let stats = Arc::new(Stats::new());
    let ctx = ConnectionContext {
        canvas: canvas.clone(),
        tokens: tokens.clone(),
        stats: stats.clone(),
        paint_results: paint_results_tx,
    };

    let mut pool = ConnectionPool::new(ws_url, 1, ctx);
    pool.start();

    let scheduler = Scheduler::new(
        target.clone(),
        canvas.clone(),
        tokens.clone(),
        pool.batcher.clone(),
        stats.clone(),
        HashMap::new(),
        config.cooldown_seconds,
    );
    let scheduler_task = tokio::spawn(scheduler.clone().run(stop.clone()));
    let result_drain_task = tokio::spawn(scheduler.clone().run_result_drain(paint_results_rx));

    let frame_interval = Duration::from_secs_f64((0.2 * config.cooldown_seconds).max(0.5));
    let timeout = safety_timeout(config.cooldown_seconds);
    let started_at = Instant::now();
    let mut detector = SteadyStateDetector::new(frame_interval);

    let mut p_hat = 0.0;
    let mut steady_state_reached = false;

    loop {
        if *stop.borrow() || started_at.elapsed() >= timeout {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(frame_interval) => {}
            _ = stop.changed() => { continue; }
        }

        let divergence = scheduler.divergence_count(Instant::now()).await;
        let total = target.len().max(1);
        let occupancy = 1.0 - (divergence as f64 / total as f64);
        detector.push(occupancy);

        if let Some(p) = detector.check() {
            p_hat = p;
            steady_state_reached = true;
            break;
        }
    }

    if !steady_state_reached {
        p_hat = detector
            .samples
            .iter()
            .rev()
            .take(10)
            .map(|s| s.occupancy)
            .sum::<f64>()
            / detector.samples.iter().rev().take(10).count().max(1) as f64;
    }

    let elapsed = started_at.elapsed().as_secs_f64().max(1.0);
    // §4.11 step 7 wants the *confirmed* write rate, not the enqueue rate:
    // `frames_submitted` advances as soon as the scheduler hands a frame to
    // the batcher and would hold eta_m near 1.0 regardless of how many of
    // those frames actually land, masking real contention.
    let successes = stats.counters.paint_results_success() as f64;
    let observed_success_rate = successes / elapsed;
    let eta_m = observed_success_rate / (config.token_count as f64 / config.cooldown_seconds.max(f64::EPSILON));

    let n_e_eta_e = if p_hat > 0.0 {
        config.token_count as f64 * eta_m * (1.0 - p_hat) / p_hat
    } else {
        0.0
    };

    stop.borrow_and_update();
    scheduler_task.abort();
    result_drain_task.abort();
    pool.shutdown().await;

    Ok(EstimatorReport {
        p_hat,
        eta_m,
        n_e_times_eta_e: n_e_eta_e,
        interpretations: interpretations(n_e_eta_e, eta_m, config.overlap_area_ratio),
        steady_state_reached,
        samples_taken: detector.samples.len(),
    })
}
