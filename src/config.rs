//! `config.json` model, defaults, and load/save. Grounded on
//! `original_source/main.py`'s `load_config`/`save_config`: missing or
//! malformed config is never fatal — a usable default is written back to
//! disk and the painter continues (spec §7, "Config parse" row).

use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_paint_interval_ms() -> u64 {
    20
}
fn default_round_interval_seconds() -> u64 {
    30
}
fn default_user_cooldown_seconds() -> f64 {
    30.0
}
fn default_auto_restart_minutes() -> u64 {
    30
}
fn default_token_refresh_interval_seconds() -> u64 {
    3600
}
fn default_writeonly_connections() -> usize {
    1
}
fn default_thread_workers() -> usize {
    1
}
fn default_weight() -> f64 {
    1.0
}
fn default_enabled() -> bool {
    true
}
fn default_draw_mode() -> DrawMode {
    DrawMode::Horizontal
}
fn default_scan_mode() -> ScanMode {
    ScanMode::Normal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawMode {
    Horizontal,
    Concentric,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Normal,
    Strict,
    Loop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub uid: u32,
    pub access_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImageSource {
    /// An on-disk image file. Matches the config's default `image_path` key;
    /// `#[serde(untagged)]` would lose the discriminant needed for `type:
    /// "attack"`, so file layers are simply the entries with `image_path`
    /// and no explicit `type`.
    File { image_path: String },
    Attack {
        width: u32,
        height: u32,
        dot_count: u32,
        attack_kind: AttackKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackKind {
    White,
    Green,
    Random,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub dot_count: Option<u32>,
    #[serde(default)]
    pub attack_kind: Option<AttackKind>,
    pub start_x: i32,
    pub start_y: i32,
    #[serde(default = "default_draw_mode")]
    pub draw_mode: DrawMode,
    #[serde(default = "default_scan_mode")]
    pub scan_mode: ScanMode,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ImageConfig {
    pub fn source(&self) -> Result<ImageSource, String> {
        if self.kind.as_deref() == Some("attack") {
            Ok(ImageSource::Attack {
                width: self.width.unwrap_or(0),
                height: self.height.unwrap_or(0),
                dot_count: self.dot_count.unwrap_or(0),
                attack_kind: self.attack_kind.unwrap_or(AttackKind::Random),
            })
        } else {
            match &self.image_path {
                Some(path) => Ok(ImageSource::File {
                    image_path: path.clone(),
                }),
                None => Err("image layer has neither image_path nor type: attack".into()),
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default = "default_paint_interval_ms")]
    pub paint_interval_ms: u64,
    #[serde(default = "default_round_interval_seconds")]
    pub round_interval_seconds: u64,
    #[serde(default = "default_user_cooldown_seconds")]
    pub user_cooldown_seconds: f64,
    #[serde(default = "default_auto_restart_minutes")]
    pub auto_restart_minutes: u64,
    #[serde(default)]
    pub max_enabled_tokens: usize,
    #[serde(default = "default_token_refresh_interval_seconds")]
    pub token_refresh_interval_seconds: u64,
    #[serde(default = "default_writeonly_connections")]
    pub writeonly_connections: usize,
    #[serde(default = "default_thread_workers")]
    pub thread_workers: usize,
    #[serde(default)]
    pub process_workers: usize,
    #[serde(default)]
    pub ignore_semitransparent: bool,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
}

impl Config {
    /// Clamp the fields spec §6 specifies bounds for.
    pub fn normalize(&mut self) {
        self.writeonly_connections = self.writeonly_connections.clamp(1, 16);
        self.thread_workers = self.thread_workers.clamp(1, 32);
        self.process_workers = self.process_workers.clamp(0, 16);
    }

    fn default_for_bootstrap() -> Self {
        Config {
            users: vec![UserEntry {
                uid: 114514,
                access_key: "AAAAAAA".into(),
            }],
            paint_interval_ms: 20,
            round_interval_seconds: 3,
            user_cooldown_seconds: 3.0,
            auto_restart_minutes: 30,
            max_enabled_tokens: 0,
            token_refresh_interval_seconds: 3600,
            writeonly_connections: 1,
            thread_workers: 1,
            process_workers: 0,
            ignore_semitransparent: false,
            images: vec![ImageConfig {
                image_path: Some("image.png".into()),
                kind: None,
                width: None,
                height: None,
                dot_count: None,
                attack_kind: None,
                start_x: 66,
                start_y: 64,
                draw_mode: DrawMode::Concentric,
                scan_mode: ScanMode::Normal,
                weight: 1.0,
                enabled: true,
            }],
        }
    }

    /// Load `path`, writing and returning a usable default if it's missing
    /// or malformed. Never returns an error — per spec §7 this is the one
    /// failure category whose policy is "write defaults, continue".
    pub fn load_or_default(path: &Path) -> Self {
        let loaded = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<Config>(&text).ok());

        let mut config = match loaded {
            Some(cfg) => cfg,
            None => {
                log::warn!(
                    "{} missing or malformed, writing defaults",
                    path.display()
                );
                let defaults = Self::default_for_bootstrap();
                if let Ok(text) = serde_json::to_string_pretty(&BootstrapView(&defaults)) {
                    let _ = std::fs::write(path, text);
                }
                defaults
            }
        };
        config.normalize();
        config
    }
}

/// `Config` only derives `Deserialize` (it is never round-tripped through
/// serialization except at bootstrap); this thin wrapper gives the one-time
/// default-writing path a `Serialize` impl without dragging that derive
/// (and its implied stability contract) onto the live config type.
struct BootstrapView<'a>(&'a Config);

impl<'a> Serialize for BootstrapView<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let cfg = self.0;
        let mut s = serializer.serialize_struct("Config", 5)?;
        s.serialize_field(
            "users",
            &cfg.users
                .iter()
                .map(|u| serde_json::json!({"uid": u.uid, "access_key": u.access_key}))
                .collect::<Vec<_>>(),
        )?;
        s.serialize_field("paint_interval_ms", &cfg.paint_interval_ms)?;
        s.serialize_field("round_interval_seconds", &cfg.round_interval_seconds)?;
        s.serialize_field("user_cooldown_seconds", &cfg.user_cooldown_seconds)?;
        s.serialize_field(
            "images",
            &cfg.images
                .iter()
                .map(|i| {
                    serde_json::json!({
                        "image_path": i.image_path,
                        "start_x": i.start_x,
                        "start_y": i.start_y,
                        "draw_mode": i.draw_mode,
                        "weight": i.weight,
                        "enabled": i.enabled,
                    })
                })
                .collect::<Vec<_>>(),
        )?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_bootstraps_defaults() {
        let dir = std::env::temp_dir().join(format!("painter-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let _ = std::fs::remove_file(&path);

        let cfg = Config::load_or_default(&path);
        assert_eq!(cfg.users.len(), 1);
        assert!(path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn normalize_clamps_connection_counts() {
        let mut cfg = Config::default_for_bootstrap();
        cfg.writeonly_connections = 999;
        cfg.thread_workers = 0;
        cfg.process_workers = 999;
        cfg.normalize();
        assert_eq!(cfg.writeonly_connections, 16);
        assert_eq!(cfg.thread_workers, 1);
        assert_eq!(cfg.process_workers, 16);
    }
}
