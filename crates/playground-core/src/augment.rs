//! Batch image augmentations on `[batch, channels, height, width]` float
//! tensors with values in `[0, 1]`.
//!
//! Random parameters are drawn once per call from the caller's RNG, so the
//! whole batch shares them and a seeded RNG reproduces a run exactly.

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use crate::error::{ModelError, Result};

pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

// RGB <-> YIQ, used for hue rotation.
const RGB_TO_YIQ: [[f64; 3]; 3] = [
    [0.299, 0.587, 0.114],
    [0.596, -0.274, -0.322],
    [0.211, -0.523, 0.312],
];
const YIQ_TO_RGB: [[f64; 3]; 3] = [
    [1.0, 0.956, 0.621],
    [1.0, -0.272, -0.647],
    [1.0, -1.106, 1.703],
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AugmentOp {
    ColorJitter {
        brightness: f64,
        contrast: f64,
        saturation: f64,
        hue: f64,
    },
    RandomGrayscale {
        p: f64,
    },
    HorizontalFlip {
        p: f64,
    },
    GaussianBlur {
        kernel_size: i64,
        sigma_min: f64,
        sigma_max: f64,
    },
    Normalize {
        mean: Vec<f64>,
        std: Vec<f64>,
    },
    RandomApply {
        p: f64,
        inner: Box<AugmentOp>,
    },
}

impl AugmentOp {
    pub fn imagenet_normalize() -> Self {
        AugmentOp::Normalize {
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
        }
    }

    pub fn validate(&self, channels: i64) -> Result<()> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));
        match self {
            AugmentOp::ColorJitter {
                brightness,
                contrast,
                saturation,
                hue,
            } => {
                if *brightness < 0.0 || *contrast < 0.0 || *saturation < 0.0 {
                    return invalid("color jitter strengths must be non-negative".to_string());
                }
                if !(0.0..=0.5).contains(hue) {
                    return invalid(format!("hue jitter must lie in [0, 0.5], got {}", hue));
                }
            }
            AugmentOp::RandomGrayscale { p } | AugmentOp::HorizontalFlip { p } => {
                if !(0.0..=1.0).contains(p) {
                    return invalid(format!("probability must lie in [0, 1], got {}", p));
                }
            }
            AugmentOp::GaussianBlur {
                kernel_size,
                sigma_min,
                sigma_max,
            } => {
                if *kernel_size <= 0 || kernel_size % 2 == 0 {
                    return invalid(format!("blur kernel size must be odd and positive, got {}", kernel_size));
                }
                if *sigma_min <= 0.0 || sigma_max < sigma_min {
                    return invalid(format!("invalid blur sigma range [{}, {}]", sigma_min, sigma_max));
                }
            }
            AugmentOp::Normalize { mean, std } => {
                let len_ok = |v: &Vec<f64>| v.len() == 1 || v.len() as i64 == channels;
                if !len_ok(mean) || !len_ok(std) {
                    return invalid(format!(
                        "normalize needs 1 or {} values, got mean {:?} and std {:?}",
                        channels, mean, std
                    ));
                }
                if std.iter().any(|&s| s <= 0.0) {
                    return invalid("normalize std must be positive".to_string());
                }
            }
            AugmentOp::RandomApply { p, inner } => {
                if !(0.0..=1.0).contains(p) {
                    return invalid(format!("probability must lie in [0, 1], got {}", p));
                }
                inner.validate(channels)?;
            }
        }
        Ok(())
    }

    pub fn apply(&self, images: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        match self {
            AugmentOp::ColorJitter {
                brightness,
                contrast,
                saturation,
                hue,
            } => color_jitter(images, *brightness, *contrast, *saturation, *hue, rng),
            AugmentOp::RandomGrayscale { p } => {
                if rng.gen::<f64>() < *p {
                    to_grayscale(images)
                } else {
                    images.shallow_clone()
                }
            }
            AugmentOp::HorizontalFlip { p } => {
                if rng.gen::<f64>() < *p {
                    images.flip([3])
                } else {
                    images.shallow_clone()
                }
            }
            AugmentOp::GaussianBlur {
                kernel_size,
                sigma_min,
                sigma_max,
            } => {
                let sigma = if sigma_max > sigma_min {
                    rng.gen_range(*sigma_min..*sigma_max)
                } else {
                    *sigma_min
                };
                gaussian_blur(images, *kernel_size, sigma)
            }
            AugmentOp::Normalize { mean, std } => normalize(images, mean, std),
            AugmentOp::RandomApply { p, inner } => {
                if rng.gen::<f64>() > *p {
                    images.shallow_clone()
                } else {
                    inner.apply(images, rng)
                }
            }
        }
    }
}

/// Ordered list of augmentation ops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Augment {
    pub ops: Vec<AugmentOp>,
}

impl Augment {
    pub fn new(ops: Vec<AugmentOp>) -> Self {
        Self { ops }
    }

    /// Default view augmentation of BYOL-style learners.
    pub fn byol_default() -> Self {
        Self::new(vec![
            AugmentOp::RandomApply {
                p: 0.3,
                inner: Box::new(AugmentOp::ColorJitter {
                    brightness: 0.8,
                    contrast: 0.8,
                    saturation: 0.8,
                    hue: 0.2,
                }),
            },
            AugmentOp::RandomGrayscale { p: 0.2 },
            AugmentOp::HorizontalFlip { p: 0.5 },
            AugmentOp::RandomApply {
                p: 0.2,
                inner: Box::new(AugmentOp::GaussianBlur {
                    kernel_size: 3,
                    sigma_min: 1.0,
                    sigma_max: 2.0,
                }),
            },
            AugmentOp::imagenet_normalize(),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn validate(&self, channels: i64) -> Result<()> {
        self.ops.iter().try_for_each(|op| op.validate(channels))
    }

    pub fn apply(&self, images: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        self.ops
            .iter()
            .fold(images.shallow_clone(), |x, op| op.apply(&x, rng))
    }
}

/// Crop a random area and aspect ratio, then resize to `size x size`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomResizedCrop {
    pub size: i64,
    pub scale: (f64, f64),
    pub ratio: (f64, f64),
}

impl RandomResizedCrop {
    pub fn new(size: i64, scale: (f64, f64)) -> Self {
        Self {
            size,
            scale,
            ratio: (3.0 / 4.0, 4.0 / 3.0),
        }
    }

    /// Returns `(top, left, crop_height, crop_width)`.
    pub fn params(&self, height: i64, width: i64, rng: &mut dyn RngCore) -> (i64, i64, i64, i64) {
        let area = (height * width) as f64;
        let (log_lo, log_hi) = (self.ratio.0.ln(), self.ratio.1.ln());

        for _ in 0..10 {
            let target_area = area * uniform(rng, self.scale.0, self.scale.1);
            let aspect = uniform(rng, log_lo, log_hi).exp();
            let w = (target_area * aspect).sqrt().round() as i64;
            let h = (target_area / aspect).sqrt().round() as i64;
            if 0 < w && w <= width && 0 < h && h <= height {
                let top = rng.gen_range(0..=height - h);
                let left = rng.gen_range(0..=width - w);
                return (top, left, h, w);
            }
        }

        // centre crop fallback
        let in_ratio = width as f64 / height as f64;
        let (h, w) = if in_ratio < self.ratio.0 {
            ((width as f64 / self.ratio.0).round() as i64, width)
        } else if in_ratio > self.ratio.1 {
            (height, (height as f64 * self.ratio.1).round() as i64)
        } else {
            (height, width)
        };
        let (h, w) = (h.clamp(1, height), w.clamp(1, width));
        ((height - h) / 2, (width - w) / 2, h, w)
    }

    pub fn apply(&self, images: &Tensor, rng: &mut dyn RngCore) -> Tensor {
        let size = images.size();
        let (top, left, h, w) = self.params(size[2], size[3], rng);
        images
            .narrow(2, top, h)
            .narrow(3, left, w)
            .upsample_bilinear2d([self.size, self.size], false, None, None)
    }
}

fn uniform(rng: &mut dyn RngCore, lo: f64, hi: f64) -> f64 {
    if hi > lo {
        rng.gen_range(lo..hi)
    } else {
        lo
    }
}

fn jitter_factor(rng: &mut dyn RngCore, strength: f64) -> Option<f64> {
    (strength > 0.0).then(|| uniform(rng, (1.0 - strength).max(0.0), 1.0 + strength))
}

/// Luma of an RGB batch: [batch, 1, height, width]. Other channel counts
/// fall back to the channel mean.
pub fn luma(images: &Tensor) -> Tensor {
    if images.size()[1] != 3 {
        return images.mean_dim(Some(&[1][..]), true, Kind::Float);
    }
    let weights = Tensor::from_slice(&RGB_TO_YIQ[0])
        .to_kind(images.kind())
        .to_device(images.device())
        .view([1, 3, 1, 1]);
    (images * weights).sum_dim_intlist(Some(&[1][..]), true, images.kind())
}

pub fn to_grayscale(images: &Tensor) -> Tensor {
    let channels = images.size()[1];
    if channels != 3 {
        return images.shallow_clone();
    }
    luma(images).expand([-1, channels, -1, -1], false).contiguous()
}

fn blend(images: &Tensor, other: &Tensor, factor: f64) -> Tensor {
    (images * factor + other * (1.0 - factor)).clamp(0.0, 1.0)
}

pub fn adjust_brightness(images: &Tensor, factor: f64) -> Tensor {
    (images * factor).clamp(0.0, 1.0)
}

pub fn adjust_contrast(images: &Tensor, factor: f64) -> Tensor {
    let mean = luma(images).mean_dim(Some(&[1, 2, 3][..]), true, Kind::Float);
    blend(images, &mean, factor)
}

pub fn adjust_saturation(images: &Tensor, factor: f64) -> Tensor {
    if images.size()[1] != 3 {
        return images.shallow_clone();
    }
    blend(images, &luma(images), factor)
}

/// Rotate chroma by `factor` turns in YIQ space.
pub fn adjust_hue(images: &Tensor, factor: f64) -> Tensor {
    if images.size()[1] != 3 {
        return images.shallow_clone();
    }
    let theta = factor * 2.0 * std::f64::consts::PI;
    let (sin, cos) = theta.sin_cos();
    let rotation = [[1.0, 0.0, 0.0], [0.0, cos, -sin], [0.0, sin, cos]];

    let m = matmul3(&YIQ_TO_RGB, &matmul3(&rotation, &RGB_TO_YIQ));
    let flat: Vec<f64> = m.iter().flatten().copied().collect();
    let m = Tensor::from_slice(&flat)
        .view([3, 3])
        .to_kind(images.kind())
        .to_device(images.device());

    // out[b, i, h, w] = sum_j m[i, j] * x[b, j, h, w]
    images
        .permute([0, 2, 3, 1])
        .matmul(&m.tr())
        .permute([0, 3, 1, 2])
        .clamp(0.0, 1.0)
}

fn matmul3(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

fn color_jitter(
    images: &Tensor,
    brightness: f64,
    contrast: f64,
    saturation: f64,
    hue: f64,
    rng: &mut dyn RngCore,
) -> Tensor {
    let mut order = [0usize, 1, 2, 3];
    order.shuffle(rng);

    let brightness = jitter_factor(rng, brightness);
    let contrast = jitter_factor(rng, contrast);
    let saturation = jitter_factor(rng, saturation);
    let hue = (hue > 0.0).then(|| uniform(rng, -hue, hue));

    let mut x = images.shallow_clone();
    for op in order {
        x = match op {
            0 => brightness.map_or(x.shallow_clone(), |f| adjust_brightness(&x, f)),
            1 => contrast.map_or(x.shallow_clone(), |f| adjust_contrast(&x, f)),
            2 => saturation.map_or(x.shallow_clone(), |f| adjust_saturation(&x, f)),
            _ => hue.map_or(x.shallow_clone(), |f| adjust_hue(&x, f)),
        };
    }
    x
}

pub fn gaussian_kernel(kernel_size: i64, sigma: f64) -> Vec<f64> {
    let center = (kernel_size / 2) as f64;
    let raw: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / total).collect()
}

pub fn gaussian_blur(images: &Tensor, kernel_size: i64, sigma: f64) -> Tensor {
    let channels = images.size()[1];
    let kernel_1d = gaussian_kernel(kernel_size, sigma);
    let kernel_2d: Vec<f64> = kernel_1d
        .iter()
        .flat_map(|a| kernel_1d.iter().map(move |b| a * b))
        .collect();
    let weight = Tensor::from_slice(&kernel_2d)
        .view([1, 1, kernel_size, kernel_size])
        .expand([channels, 1, kernel_size, kernel_size], false)
        .to_kind(images.kind())
        .to_device(images.device());

    let pad = kernel_size / 2;
    images
        .reflection_pad2d([pad, pad, pad, pad])
        .conv2d(&weight, None::<Tensor>, [1, 1], [0, 0], [1, 1], channels)
}

pub fn normalize(images: &Tensor, mean: &[f64], std: &[f64]) -> Tensor {
    let channels = images.size()[1];
    let stats = |values: &[f64]| {
        let values: Vec<f64> = if values.len() == 1 {
            vec![values[0]; channels as usize]
        } else {
            values.to_vec()
        };
        Tensor::from_slice(&values)
            .to_kind(images.kind())
            .to_device(images.device())
            .view([1, -1, 1, 1])
    };
    if !(mean.len() == 1 || mean.len() as i64 == channels) || !(std.len() == 1 || std.len() as i64 == channels) {
        log::warn!(
            "skipping normalize: {} channels but {} means and {} stds",
            channels,
            mean.len(),
            std.len()
        );
        return images.shallow_clone();
    }
    (images - stats(mean)) / stats(std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::Device;

    fn batch(channels: i64) -> Tensor {
        tch::manual_seed(0);
        Tensor::rand([2, channels, 8, 8], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn zero_hue_rotation_is_near_identity() {
        let x = batch(3);
        let y = adjust_hue(&x, 0.0);
        assert!(y.allclose(&x, 1e-2, 1e-2, false));
    }

    #[test]
    fn grayscale_has_equal_channels() {
        let g = to_grayscale(&batch(3));
        assert_eq!(g.size(), vec![2, 3, 8, 8]);
        let diff = (g.narrow(1, 0, 1) - g.narrow(1, 2, 1)).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn gaussian_kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel(5, 1.5);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((k[0] - k[4]).abs() < 1e-12);
        assert!(k[2] > k[1]);
    }

    #[test]
    fn blur_of_constant_image_is_constant() {
        let x = Tensor::full([1, 3, 6, 6], 0.25, (Kind::Float, Device::Cpu));
        let y = gaussian_blur(&x, 3, 1.0);
        assert_eq!(y.size(), vec![1, 3, 6, 6]);
        assert!(y.allclose(&x, 1e-5, 1e-5, false));
    }

    #[test]
    fn normalize_uses_per_channel_stats() {
        let x = Tensor::full([1, 3, 2, 2], 0.5, (Kind::Float, Device::Cpu));
        let y = normalize(&x, &[0.5, 0.0, 0.25], &[1.0, 0.5, 0.25]);
        let expected = [0.0, 1.0, 1.0];
        for (c, e) in expected.iter().enumerate() {
            let v = y.double_value(&[0, c as i64, 0, 0]);
            assert!((v - e).abs() < 1e-6);
        }
    }

    #[test]
    fn resized_crop_has_target_size_and_valid_params() {
        let crop = RandomResizedCrop::new(6, (0.05, 0.4));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let (top, left, h, w) = crop.params(20, 12, &mut rng);
            assert!(top >= 0 && left >= 0 && h > 0 && w > 0);
            assert!(top + h <= 20 && left + w <= 12);
        }
        let y = crop.apply(&batch(3), &mut rng);
        assert_eq!(y.size(), vec![2, 3, 6, 6]);
    }

    #[test]
    fn fallback_crop_clamps_extreme_aspect_ratios() {
        // An impossible scale range forces the centre-crop fallback.
        let crop = RandomResizedCrop {
            size: 4,
            scale: (5.0, 6.0),
            ratio: (3.0 / 4.0, 4.0 / 3.0),
        };
        let mut rng = StdRng::seed_from_u64(0);
        let (top, left, h, w) = crop.params(10, 40, &mut rng);
        assert_eq!((h, w), (10, 13));
        assert_eq!((top, left), (0, 13));
    }

    #[test]
    fn byol_pipeline_is_reproducible_and_valid() {
        let augment = Augment::byol_default();
        assert!(augment.validate(3).is_ok());
        let x = batch(3);
        let a = augment.apply(&x, &mut StdRng::seed_from_u64(11));
        let b = augment.apply(&x, &mut StdRng::seed_from_u64(11));
        assert_eq!(a.size(), x.size());
        assert!(a.allclose(&b, 1e-6, 1e-6, false));
    }

    #[test]
    fn single_channel_images_skip_colour_ops() {
        let x = batch(1);
        let jitter = AugmentOp::ColorJitter {
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.8,
            hue: 0.2,
        };
        let y = jitter.apply(&x, &mut StdRng::seed_from_u64(1));
        assert!(y.allclose(&x, 1e-6, 1e-6, false));
        assert!(AugmentOp::imagenet_normalize().validate(1).is_err());
    }

    #[test]
    fn ops_deserialize_from_tagged_yaml_like_json() {
        let op: AugmentOp = serde_json::from_str(
            r#"{"op": "random_apply", "p": 0.5, "inner": {"op": "horizontal_flip", "p": 1.0}}"#,
        )
        .unwrap();
        assert_eq!(
            op,
            AugmentOp::RandomApply {
                p: 0.5,
                inner: Box::new(AugmentOp::HorizontalFlip { p: 1.0 }),
            }
        );
    }
}
