//! CLI entry point (§6 External Interfaces). Parses arguments, loads
//! `config.json`, installs logging the way `kleinesfilmroellchen-hyperflut`
//! does (`env_logger` + `LevelFilter` toggled by a debug flag), and hands off
//! to `painter::run`/`painter::estimator::run`.

use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use painter::config::Config;

/// CLI surface (§6). Long flags (`--cli`, `--debug`, ...) replace the
/// original's single-dash argparse convention with clap's standard
/// double-dash form — see DESIGN.md's Open Question resolutions.
#[derive(Parser, Debug)]
#[command(name = "painter", about = "Collaborative pixel-board painting client")]
struct Args {
    /// Path to config.json.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Disable the operator UI; this crate never starts one, so this flag is
    /// accepted for CLI-surface parity and is otherwise a no-op.
    #[arg(long)]
    cli: bool,
    /// Raise log verbosity to DEBUG.
    #[arg(long)]
    debug: bool,
    /// Enter estimator mode (§4.11) instead of running the painter.
    #[arg(long)]
    test: bool,
    /// UI port; accepted for CLI-surface parity, unused since the UI is an
    /// external collaborator (§1).
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Interactive single-connection painting mode; not part of this core's
    /// spec (§6) — parsed and reported, not implemented.
    #[arg(long)]
    hand: bool,
    /// Base HTTP origin of the paintboard service.
    #[arg(long, default_value = "https://paintboard.example.com")]
    base_url: String,
    /// Base WebSocket origin (the `/api/paintboard/ws` path is appended).
    #[arg(long, default_value = "wss://paintboard.example.com")]
    ws_url: String,
}

fn init_logging(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new()
        .format_timestamp_secs()
        .filter_level(level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    if args.hand {
        log::warn!("-hand interactive single-connection mode is not implemented by this core");
        return Ok(());
    }

    let config = Config::load_or_default(&args.config);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("received interrupt, shutting down");
            let _ = stop_tx.send(true);
        }
    });

    if args.test {
        run_estimator(&args, config, stop_rx).await
    } else {
        run_painter(args, config, stop_rx).await
    }
}

async fn run_painter(
    args: Args,
    config: Config,
    stop_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if args.auto_restart_deadline(&config).is_some() {
        log::info!(
            "auto-restart configured for every {} minutes (process-level re-exec, §4.10)",
            config.auto_restart_minutes
        );
    }

    match painter::run(config, args.base_url.clone(), args.ws_url.clone(), stop_rx).await {
        Ok(()) => {
            log::info!("painter stopped normally");
            Ok(())
        }
        Err(e) => {
            log::error!("fatal: {e}");
            Err(e.into())
        }
    }
}

async fn run_estimator(
    args: &Args,
    config: Config,
    stop_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use painter::estimator::{EstimatorConfig, ProbeRegion};
    use painter::wire::Color;

    log::info!("entering estimator mode (-test)");
    let estimator_config = EstimatorConfig {
        region: ProbeRegion { start_x: 0, start_y: 0 },
        light: Color::new(255, 255, 255),
        dark: Color::new(0, 0, 0),
        source_image_path: "probe.png".to_string(),
        token_count: config.users.len() as u32,
        users: config.users.clone(),
        cooldown_seconds: config.user_cooldown_seconds,
        overlap_area_ratio: 1.0,
    };

    let report = painter::estimator::run(&args.base_url, &args.ws_url, estimator_config, stop_rx).await?;
    log::info!(
        "estimator report: p_hat={:.3} eta_m={:.3} steady_state={} samples={}",
        report.p_hat,
        report.eta_m,
        report.steady_state_reached,
        report.samples_taken
    );
    for (assumption, n_e) in &report.interpretations {
        log::info!("  N_e under {assumption}: {n_e:.1}");
    }
    Ok(())
}

impl Args {
    /// `None` when auto-restart is disabled (`auto_restart_minutes == 0`,
    /// §6 default 30, 0 disables). Process-level re-exec itself is a
    /// deployment technique orthogonal to the core design (§9) and is not
    /// wired up by this binary; the interval is only logged here.
    fn auto_restart_deadline(&self, config: &Config) -> Option<std::time::Duration> {
        if config.auto_restart_minutes == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(config.auto_restart_minutes * 60))
        }
    }
}
