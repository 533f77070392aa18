//! 学習時のデータ拡張
//!
//! 左右反転・回転・ズームを CHW 形式の画素配列に対して行います。
//! 推論時には使用しません。

use burn::config::Config;
use rand::Rng;
use std::f64::consts::PI;

/// データ拡張設定（モデル設定の一部として保存される）
#[derive(Config, Debug)]
pub struct AugmentationConfig {
    /// ランダム左右反転 (p = 0.5)
    #[config(default = true)]
    pub horizontal_flip: bool,
    /// 最大回転量（1回転に対する割合）
    #[config(default = 0.08)]
    pub max_rotation: f64,
    /// 最大ズーム量（割合）
    #[config(default = 0.15)]
    pub max_zoom: f64,
}

impl AugmentationConfig {
    pub fn is_identity(&self) -> bool {
        !self.horizontal_flip && self.max_rotation == 0.0 && self.max_zoom == 0.0
    }
}

/// 1枚分のランダム変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    pub flip: bool,
    /// ラジアン
    pub angle: f64,
    pub zoom: f64,
}

impl AugmentParams {
    pub fn identity() -> Self {
        Self {
            flip: false,
            angle: 0.0,
            zoom: 1.0,
        }
    }

    pub fn sample<R: Rng>(config: &AugmentationConfig, rng: &mut R) -> Self {
        let flip = config.horizontal_flip && rng.gen_bool(0.5);
        let angle = if config.max_rotation > 0.0 {
            rng.gen_range(-config.max_rotation..=config.max_rotation) * 2.0 * PI
        } else {
            0.0
        };
        let zoom = if config.max_zoom > 0.0 {
            1.0 + rng.gen_range(-config.max_zoom..=config.max_zoom)
        } else {
            1.0
        };
        Self { flip, angle, zoom }
    }
}

/// 設定に従ってランダムに拡張した画素配列を返す
pub fn augment<R: Rng>(
    pixels: &[f32],
    size: usize,
    config: &AugmentationConfig,
    rng: &mut R,
) -> Vec<f32> {
    if config.is_identity() {
        return pixels.to_vec();
    }
    apply(pixels, size, AugmentParams::sample(config, rng))
}

/// 変換パラメータを適用する（双線形補間、範囲外は反射）
pub fn apply(pixels: &[f32], size: usize, params: AugmentParams) -> Vec<f32> {
    let plane = size * size;
    let channels = pixels.len() / plane.max(1);
    let mut out = vec![0.0f32; pixels.len()];
    let center = (size as f64 - 1.0) / 2.0;
    let (sin, cos) = params.angle.sin_cos();

    for y in 0..size {
        for x in 0..size {
            let mut dx = x as f64 - center;
            let dy = y as f64 - center;
            if params.flip {
                dx = -dx;
            }
            // 出力座標 -> 入力座標（逆変換）
            let sx = center + params.zoom * (cos * dx + sin * dy);
            let sy = center + params.zoom * (-sin * dx + cos * dy);
            let sx = reflect(sx, size);
            let sy = reflect(sy, size);

            let x0 = sx.floor() as usize;
            let y0 = sy.floor() as usize;
            let x1 = (x0 + 1).min(size - 1);
            let y1 = (y0 + 1).min(size - 1);
            let wx = (sx - x0 as f64) as f32;
            let wy = (sy - y0 as f64) as f32;

            for c in 0..channels {
                let base = c * plane;
                let p00 = pixels[base + y0 * size + x0];
                let p01 = pixels[base + y0 * size + x1];
                let p10 = pixels[base + y1 * size + x0];
                let p11 = pixels[base + y1 * size + x1];
                let top = p00 + (p01 - p00) * wx;
                let bottom = p10 + (p11 - p10) * wx;
                out[base + y * size + x] = top + (bottom - top) * wy;
            }
        }
    }
    out
}

/// 画素中心座標を [0, size-1] に反射で折り返す
fn reflect(coord: f64, size: usize) -> f64 {
    let len = size as f64;
    let period = 2.0 * len;
    let mut u = (coord + 0.5).rem_euclid(period);
    if u >= len {
        u = period - u;
    }
    (u - 0.5).clamp(0.0, len - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn gradient_image(size: usize) -> Vec<f32> {
        let mut pixels = Vec::with_capacity(3 * size * size);
        for c in 0..3 {
            for y in 0..size {
                for x in 0..size {
                    pixels.push((c * 50 + y * 10 + x) as f32);
                }
            }
        }
        pixels
    }

    #[test]
    fn test_identity_params_keep_pixels() {
        let pixels = gradient_image(8);
        let out = apply(&pixels, 8, AugmentParams::identity());
        for (a, b) in pixels.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_flip_mirrors_rows() {
        let size = 6;
        let pixels = gradient_image(size);
        let params = AugmentParams {
            flip: true,
            ..AugmentParams::identity()
        };
        let out = apply(&pixels, size, params);
        for y in 0..size {
            for x in 0..size {
                let expected = pixels[y * size + (size - 1 - x)];
                assert!((out[y * size + x] - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_random_augment_preserves_shape_and_range() {
        let size = 16;
        let pixels = gradient_image(size);
        let config = AugmentationConfig::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let out = augment(&pixels, size, &config, &mut rng);
            assert_eq!(out.len(), pixels.len());
            let max = pixels.iter().cloned().fold(f32::MIN, f32::max);
            assert!(out.iter().all(|v| *v >= 0.0 && *v <= max + 1e-3));
        }
    }

    #[test]
    fn test_disabled_config_is_identity() {
        let config = AugmentationConfig::new()
            .with_horizontal_flip(false)
            .with_max_rotation(0.0)
            .with_max_zoom(0.0);
        assert!(config.is_identity());
        let pixels = gradient_image(4);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(augment(&pixels, 4, &config, &mut rng), pixels);
    }

    #[test]
    fn test_reflect_stays_in_bounds() {
        assert_eq!(reflect(-0.5, 4), 0.0);
        assert_eq!(reflect(4.0, 4), 3.0);
        assert!((reflect(-1.0, 4) - 0.0).abs() < 1e-9);
        assert!((reflect(1.25, 4) - 1.25).abs() < 1e-9);
    }
}
