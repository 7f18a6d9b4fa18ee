use thiserror::Error;

/// Crate-wide error type. Most failure modes here are non-fatal per spec §7
/// (the caller logs and continues); the variants that ARE fatal are called
/// out at their construction sites in `main.rs`.
#[derive(Debug, Error)]
pub enum PainterError {
    #[error("config error: {0}")]
    Config(String),

    #[error("snapshot fetch failed: {0}")]
    Snapshot(#[from] reqwest::Error),

    #[error("token issuance failed for uid {uid}: {reason}")]
    TokenIssuance { uid: u32, reason: String },

    #[error("no credentials could be issued")]
    NoCredentials,

    #[error("image layer produced zero target pixels")]
    EmptyTargetMap,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, PainterError>;
