//! Painter engine crate root. Re-exports each spec component as its own
//! module (§2 component table) and wires them together behind
//! [`run`]/[`run_estimator`], the two entry points `main.rs` dispatches to.

pub mod batcher;
pub mod canvas;
pub mod composer;
pub mod config;
pub mod connection;
pub mod error;
pub mod estimator;
pub mod heartbeat;
pub mod http;
pub mod image;
pub mod pool;
pub mod proxy;
pub mod scheduler;
pub mod stats;
pub mod supervisor;
pub mod token;
pub mod wire;

/// Canvas width in pixels (§3 Data model).
pub const CANVAS_WIDTH: u16 = 1000;
/// Canvas height in pixels (§3 Data model).
pub const CANVAS_HEIGHT: u16 = 600;

pub use error::{PainterError, Result};

/// Run the painter to completion against `base_url`/`ws_url`, driven by
/// `config`, until `stop` fires or a fatal condition (§7) is hit.
pub async fn run(
    config: config::Config,
    base_url: String,
    ws_url: String,
    stop: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let supervisor = supervisor::Supervisor::new(config, base_url, ws_url)?;
    let stop_tx = supervisor.stop_handle();
    // Forward the caller's stop signal into the supervisor's own watch
    // channel so a single Ctrl-C handler in `main.rs` can drain everything.
    let mut forward_stop = stop;
    tokio::spawn(async move {
        loop {
            if *forward_stop.borrow() {
                let _ = stop_tx.send(true);
                break;
            }
            if forward_stop.changed().await.is_err() {
                break;
            }
        }
    });
    supervisor.run().await
}
