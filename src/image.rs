//! Image layer loading and attack-layer synthesis, feeding §4.7's composer.
//! File decoding follows `kleinesfilmroellchen-hyperflut`'s `image_manager.rs`
//! (load via the `image` crate, convert to RGBA8); attack-layer pixel
//! generation is a direct port of `original_source/tool.py`'s
//! `_gen_attack_pixels`, seeded deterministically by `(width, height)` per
//! spec §3 `ImageLayer`.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{AttackKind, DrawMode, ImageConfig, ImageSource, ScanMode};
use crate::error::{PainterError, Result};
use crate::wire::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    File,
    Attack,
}

/// One configured layer, decoded into an absolute-origin RGBA pixel grid
/// (§3 `ImageLayer`). `pixels` is row-major, width*height long.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    pub kind: LayerKind,
    pub config_index: usize,
    pub origin_x: i32,
    pub origin_y: i32,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[u8; 4]>,
    pub draw_mode: DrawMode,
    pub scan_mode: ScanMode,
    pub weight: f64,
    pub enabled: bool,
}

impl ImageLayer {
    #[inline]
    pub fn pixel_at(&self, x: u32, y: u32) -> [u8; 4] {
        self.pixels[(y * self.width + x) as usize]
    }
}

/// Load every enabled layer from config, in config order (the composer
/// re-sorts by weight afterward). A file layer whose path doesn't exist or
/// doesn't decode is skipped with a warning, matching
/// `original_source/tool.py`'s `load_all_images` ("跳过不存在的图片").
pub fn load_layers(images: &[ImageConfig]) -> Vec<ImageLayer> {
    let mut layers = Vec::with_capacity(images.len());
    for (index, cfg) in images.iter().enumerate() {
        if !cfg.enabled {
            continue;
        }
        let source = match cfg.source() {
            Ok(source) => source,
            Err(reason) => {
                log::warn!("skipping image layer {index}: {reason}");
                continue;
            }
        };
        match source {
            ImageSource::Attack {
                width,
                height,
                dot_count,
                attack_kind,
            } => match gen_attack_pixels(width, height, dot_count, attack_kind) {
                Some(pixels) => layers.push(ImageLayer {
                    kind: LayerKind::Attack,
                    config_index: index,
                    origin_x: cfg.start_x,
                    origin_y: cfg.start_y,
                    width,
                    height,
                    pixels,
                    draw_mode: cfg.draw_mode,
                    scan_mode: cfg.scan_mode,
                    weight: cfg.weight,
                    enabled: true,
                }),
                None => log::warn!("skipping attack layer {index}: invalid dimensions"),
            },
            ImageSource::File { image_path } => match load_file_layer(&image_path) {
                Ok((pixels, width, height)) => layers.push(ImageLayer {
                    kind: LayerKind::File,
                    config_index: index,
                    origin_x: cfg.start_x,
                    origin_y: cfg.start_y,
                    width,
                    height,
                    pixels,
                    draw_mode: cfg.draw_mode,
                    scan_mode: cfg.scan_mode,
                    weight: cfg.weight,
                    enabled: true,
                }),
                Err(e) => log::warn!("skipping image layer {index} ({image_path}): {e}"),
            },
        }
    }
    layers
}

fn load_file_layer(path: &str) -> Result<(Vec<[u8; 4]>, u32, u32)> {
    if !Path::new(path).is_file() {
        return Err(PainterError::Config(format!("image not found: {path}")));
    }
    let img = image::open(path)?.to_rgba8();
    let (width, height) = img.dimensions();
    let pixels = img.pixels().map(|p| p.0).collect();
    Ok((pixels, width, height))
}

/// Deterministic synthetic attack layer: `dot_count` single opaque pixels
/// scattered over a transparent background, seeded by `(width, height)` so
/// two runs against the same config produce the identical layer (§3, §8
/// "Round-trip / idempotence"). Default `dot_count` mirrors the original's
/// ~2%-of-area heuristic when the config omits it.
pub fn gen_attack_pixels(
    width: u32,
    height: u32,
    dot_count: u32,
    kind: AttackKind,
) -> Option<Vec<[u8; 4]>> {
    if width == 0 || height == 0 {
        return None;
    }
    let total = (width as u64 * height as u64) as usize;
    let dot_count = if dot_count == 0 {
        (total / 50).max(1)
    } else {
        dot_count as usize
    };

    let seed = attack_seed(width, height);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut pixels = vec![[0u8, 0, 0, 0]; total];
    let mut used = std::collections::HashSet::new();
    for _ in 0..dot_count {
        let mut placed = None;
        for _ in 0..5 {
            let x = rng.gen_range(0..width);
            let y = rng.gen_range(0..height);
            let idx = (y * width + x) as usize;
            if used.insert(idx) {
                placed = Some(idx);
                break;
            }
        }
        let Some(idx) = placed else { continue };
        let color = match kind {
            AttackKind::White => Color::new(255, 255, 255),
            AttackKind::Green => Color::new(0, 255, 0),
            AttackKind::Random => Color::new(rng.gen(), rng.gen(), rng.gen()),
        };
        pixels[idx] = [color.r, color.g, color.b, 255];
    }
    Some(pixels)
}

/// Deterministic seed for both attack-pixel placement and (separately, in
/// `composer.rs`) the `random` draw-order shuffle. Ported from
/// `original_source/tool.py`'s two distinct per-purpose seed formulas.
fn attack_seed(width: u32, height: u32) -> u64 {
    (width as u64).wrapping_mul(1_315_423_911) ^ (height as u64).wrapping_mul(2_654_435_761)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attack_pixels_are_deterministic() {
        let a = gen_attack_pixels(20, 20, 8, AttackKind::White).unwrap();
        let b = gen_attack_pixels(20, 20, 8, AttackKind::White).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn attack_pixels_default_dot_count_is_about_two_percent() {
        let pixels = gen_attack_pixels(100, 100, 0, AttackKind::Green).unwrap();
        let opaque = pixels.iter().filter(|p| p[3] == 255).count();
        assert_eq!(opaque, 200); // 100*100/50
    }

    #[test]
    fn zero_sized_attack_layer_is_none() {
        assert!(gen_attack_pixels(0, 10, 5, AttackKind::White).is_none());
    }
}
