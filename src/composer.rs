//! §4.7 target composer. Folds the configured `ImageLayer`s (including
//! synthetic attack layers) into one authoritative `TargetMap`, in
//! descending-weight order, first claim wins. Grounded on
//! `original_source/tool.py`'s `merge_target_maps`/`get_draw_order`/
//! `build_target_map`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DrawMode;
use crate::image::ImageLayer;
use crate::wire::{Color, Pos};
use crate::{CANVAS_HEIGHT, CANVAS_WIDTH};

/// Authoritative desired color per claimed coordinate, plus the bookkeeping
/// the scheduler and stats layers need: which layer claimed each
/// coordinate, and both a flat concatenated scan order and a per-layer
/// index (SPEC_FULL §C.2 — auxiliary index for `scan_mode` bookkeeping).
pub struct TargetMap {
    pub(crate) colors: HashMap<Pos, Color>,
    pub(crate) owner: HashMap<Pos, usize>,
    /// Concatenated scan order: layers visited in descending-weight order,
    /// each contributing its own claimed positions in its own draw order.
    pub scan_order: Vec<Pos>,
    pub per_layer: Vec<VecDeque<Pos>>,
    pub domain: Arc<HashSet<Pos>>,
}

impl TargetMap {
    pub fn get(&self, pos: Pos) -> Option<Color> {
        self.colors.get(&pos).copied()
    }

    pub fn owner_of(&self, pos: Pos) -> Option<usize> {
        self.owner.get(&pos).copied()
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

/// Relative draw order for one layer's `width x height` grid (§4.7).
pub fn draw_order(mode: DrawMode, width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut coords: Vec<(u32, u32)> = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .collect();

    match mode {
        DrawMode::Horizontal => coords,
        DrawMode::Concentric => {
            let cx = (width as f64 - 1.0) / 2.0;
            let cy = (height as f64 - 1.0) / 2.0;
            coords.sort_by(|a, b| {
                let da = chebyshev(a.0, a.1, cx, cy);
                let db = chebyshev(b.0, b.1, cx, cy);
                da.partial_cmp(&db)
                    .unwrap()
                    .then_with(|| a.1.cmp(&b.1))
                    .then_with(|| a.0.cmp(&b.0))
            });
            coords
        }
        DrawMode::Random => {
            let seed = (width as u64) * 10_007 + (height as u64) * 97;
            let mut rng = StdRng::seed_from_u64(seed);
            // Fisher-Yates, matching `random.Random.shuffle`'s behavior of a
            // reproducible permutation for a fixed seed (exact shuffle
            // algorithm need not match Python's bit-for-bit; determinism
            // within this crate's own runs is what §8 tests).
            for i in (1..coords.len()).rev() {
                let j = rng.gen_range(0..=i);
                coords.swap(i, j);
            }
            coords
        }
    }
}

fn chebyshev(x: u32, y: u32, cx: f64, cy: f64) -> f64 {
    (x as f64 - cx).abs().max((y as f64 - cy).abs())
}

/// Build the `TargetMap` from every enabled layer. Layers are visited in
/// descending weight order (ties broken by config index, ascending, for
/// determinism); a coordinate is claimed by the first (highest-weight)
/// layer that covers it with a non-transparent pixel.
pub fn compose(layers: &[ImageLayer], ignore_semitransparent: bool) -> TargetMap {
    let mut ordered: Vec<&ImageLayer> = layers.iter().filter(|l| l.enabled).collect();
    ordered.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap()
            .then_with(|| a.config_index.cmp(&b.config_index))
    });

    let mut colors = HashMap::new();
    let mut owner = HashMap::new();
    let mut scan_order = Vec::new();
    let mut per_layer = Vec::with_capacity(ordered.len());

    for layer in ordered {
        let order = draw_order(layer.draw_mode, layer.width, layer.height);
        let mut claimed = VecDeque::new();

        for (rel_x, rel_y) in order {
            let pixel = layer.pixel_at(rel_x, rel_y);
            let alpha = pixel[3];
            if alpha == 0 {
                continue;
            }
            if ignore_semitransparent && alpha < 255 {
                continue;
            }

            let abs_x = layer.origin_x + rel_x as i32;
            let abs_y = layer.origin_y + rel_y as i32;
            if abs_x < 0 || abs_y < 0 || abs_x >= CANVAS_WIDTH as i32 || abs_y >= CANVAS_HEIGHT as i32 {
                continue;
            }
            let pos = Pos::new(abs_x as u16, abs_y as u16);

            if colors.contains_key(&pos) {
                continue; // already claimed by a higher-weight layer
            }
            colors.insert(pos, Color::new(pixel[0], pixel[1], pixel[2]));
            owner.insert(pos, layer.config_index);
            scan_order.push(pos);
            claimed.push_back(pos);
        }

        per_layer.push(claimed);
    }

    let domain = Arc::new(colors.keys().copied().collect());

    TargetMap {
        colors,
        owner,
        scan_order,
        per_layer,
        domain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanMode;
    use crate::image::LayerKind;

    fn solid_layer(
        config_index: usize,
        origin_x: i32,
        origin_y: i32,
        width: u32,
        height: u32,
        color: Color,
        weight: f64,
    ) -> ImageLayer {
        ImageLayer {
            kind: LayerKind::File,
            config_index,
            origin_x,
            origin_y,
            width,
            height,
            pixels: vec![[color.r, color.g, color.b, 255]; (width * height) as usize],
            draw_mode: DrawMode::Horizontal,
            scan_mode: ScanMode::Normal,
            weight,
            enabled: true,
        }
    }

    #[test]
    fn every_claimed_coordinate_is_in_canvas() {
        let layer = solid_layer(0, -5, -5, 20, 20, Color::new(1, 2, 3), 1.0);
        let target = compose(&[layer], false);
        for pos in target.scan_order.iter() {
            assert!(pos.in_canvas());
        }
        // 5 rows/cols clipped off the negative side of a 20x20 square.
        assert_eq!(target.len(), 15 * 15);
    }

    #[test]
    fn higher_weight_layer_wins_overlap() {
        let a = solid_layer(0, 0, 0, 10, 10, Color::new(255, 0, 0), 2.0);
        let b = solid_layer(1, 5, 5, 10, 10, Color::new(0, 0, 255), 1.0);
        let target = compose(&[a, b], false);

        assert_eq!(target.get(Pos::new(3, 3)), Some(Color::new(255, 0, 0)));
        assert_eq!(target.get(Pos::new(7, 7)), Some(Color::new(255, 0, 0)));
        assert_eq!(target.get(Pos::new(12, 12)), Some(Color::new(0, 0, 255)));
    }

    #[test]
    fn alpha_zero_always_skipped_semitransparent_conditionally() {
        let mut layer = solid_layer(0, 0, 0, 2, 1, Color::new(9, 9, 9), 1.0);
        layer.pixels[0][3] = 0; // fully transparent
        layer.pixels[1][3] = 128; // semitransparent

        let permissive = compose(&[layer.clone()], false);
        assert!(permissive.get(Pos::new(0, 0)).is_none());
        assert!(permissive.get(Pos::new(1, 0)).is_some());

        let strict = compose(&[layer], true);
        assert!(strict.get(Pos::new(0, 0)).is_none());
        assert!(strict.get(Pos::new(1, 0)).is_none());
    }

    #[test]
    fn compose_is_deterministic_across_runs() {
        let layer = solid_layer(0, 0, 0, 12, 12, Color::new(4, 5, 6), 1.0);
        let mut random_layer = layer.clone();
        random_layer.draw_mode = DrawMode::Random;

        let a = compose(&[random_layer.clone()], false);
        let b = compose(&[random_layer], false);
        assert_eq!(a.scan_order, b.scan_order);
    }

    #[test]
    fn concentric_order_is_ascending_chebyshev_distance() {
        let order = draw_order(DrawMode::Concentric, 3, 3);
        // Center (1,1) must come first for a 3x3 grid.
        assert_eq!(order[0], (1, 1));
    }
}
