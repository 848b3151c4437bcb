use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxVitConfig {
    /// Number of output classes of the classification head.
    pub num_classes: i64,
    /// Channel width of the first stage. Stage `i` uses `dim * 2^i`.
    pub dim: i64,
    /// Number of MaxViT blocks in each stage.
    pub depth: Vec<i64>,
    /// Width of a single attention head.
    pub dim_head: i64,
    /// Width of the convolutional stem (defaults to `dim`).
    pub dim_conv_stem: Option<i64>,
    /// Side length of the attention windows and of the dilated grid.
    pub window_size: i64,
    /// Hidden width multiplier of the MBConv inverted bottleneck.
    pub mbconv_expansion_rate: f64,
    /// Squeeze-excitation bottleneck ratio.
    pub mbconv_shrinkage_rate: f64,
    /// Dropout used inside attention and feed-forward layers.
    pub dropout: f64,
    /// Number of input image channels.
    pub channels: i64,
    /// Register tokens prepended to every attention window.
    pub num_register_tokens: i64,
}

impl Default for MaxVitConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            dim: 64,
            depth: vec![2, 2],
            dim_head: 32,
            dim_conv_stem: None,
            window_size: 7,
            mbconv_expansion_rate: 4.0,
            mbconv_shrinkage_rate: 0.25,
            dropout: 0.1,
            channels: 3,
            num_register_tokens: 4,
        }
    }
}

impl MaxVitConfig {
    pub fn num_stages(&self) -> usize {
        self.depth.len()
    }

    pub fn stem_dim(&self) -> i64 {
        self.dim_conv_stem.unwrap_or(self.dim)
    }

    pub fn stage_dims(&self) -> Vec<i64> {
        (0..self.depth.len() as u32).map(|i| self.dim * 2i64.pow(i)).collect()
    }

    /// Channel width of the feature map entering the classification head.
    pub fn feature_dim(&self) -> i64 {
        self.stage_dims().last().copied().unwrap_or(self.dim)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));

        if self.depth.is_empty() {
            return invalid("depth needs at least one stage".to_string());
        }
        if self.depth.iter().any(|&d| d <= 0) {
            return invalid(format!("every stage needs at least one block, got {:?}", self.depth));
        }
        if self.num_register_tokens <= 0 {
            return invalid("num_register_tokens must be positive".to_string());
        }
        if self.dim <= 0 || self.dim_head <= 0 || self.num_classes <= 0 || self.channels <= 0 {
            return invalid("dim, dim_head, num_classes and channels must be positive".to_string());
        }
        if self.dim % self.dim_head != 0 {
            return invalid(format!(
                "dimension {} should be divisible by dimension per head {}",
                self.dim, self.dim_head
            ));
        }
        if self.window_size <= 0 {
            return invalid("window_size must be positive".to_string());
        }
        if let Some(stem) = self.dim_conv_stem {
            if stem <= 0 {
                return invalid("dim_conv_stem must be positive".to_string());
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must lie in [0, 1), got {}", self.dropout));
        }
        if self.mbconv_expansion_rate <= 0.0 || self.mbconv_shrinkage_rate <= 0.0 {
            return invalid("mbconv expansion and shrinkage rates must be positive".to_string());
        }
        Ok(())
    }

    /// The stem and every stage halve the resolution, and each stage must
    /// tile into whole windows.
    pub fn validate_image_size(&self, image_size: i64) -> Result<()> {
        let multiple = self.window_size * 2i64.pow(self.num_stages() as u32 + 1);
        if image_size <= 0 || image_size % multiple != 0 {
            return Err(ModelError::ImageSize {
                size: image_size,
                multiple,
            });
        }
        Ok(())
    }
}

/// Smallest area fraction a local (student) crop may cover.
pub const LOCAL_LOWER_CROP_SCALE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EsVitConfig {
    /// Side length of the local and global crops fed to the encoders.
    pub image_size: i64,
    /// Hidden width of the projection heads.
    pub projection_hidden_size: i64,
    /// Output width (number of prototypes) of both projection heads.
    pub num_classes_k: i64,
    /// Number of layers in each projection head.
    pub projection_layers: i64,
    pub student_temp: f64,
    pub teacher_temp: f64,
    /// Upper bound of the area fraction for local (student) crops.
    pub local_upper_crop_scale: f64,
    /// Lower bound of the area fraction for global (teacher) crops.
    pub global_lower_crop_scale: f64,
    /// EMA decay of the teacher weights.
    pub moving_average_decay: f64,
    /// EMA decay of the teacher centres.
    pub center_moving_average_decay: f64,
}

impl Default for EsVitConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            projection_hidden_size: 256,
            num_classes_k: 65336,
            projection_layers: 4,
            student_temp: 0.9,
            teacher_temp: 0.04,
            local_upper_crop_scale: 0.4,
            global_lower_crop_scale: 0.5,
            moving_average_decay: 0.9,
            center_moving_average_decay: 0.9,
        }
    }
}

impl EsVitConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));

        if self.image_size <= 0 || self.projection_hidden_size <= 0 || self.num_classes_k <= 0 {
            return invalid("image_size, projection_hidden_size and num_classes_k must be positive".to_string());
        }
        if self.projection_layers < 1 {
            return invalid("projection_layers must be at least 1".to_string());
        }
        if self.student_temp <= 0.0 || self.teacher_temp <= 0.0 {
            return invalid("temperatures must be positive".to_string());
        }
        for (name, decay) in [
            ("moving_average_decay", self.moving_average_decay),
            ("center_moving_average_decay", self.center_moving_average_decay),
        ] {
            if !(0.0..=1.0).contains(&decay) {
                return invalid(format!("{} must lie in [0, 1], got {}", name, decay));
            }
        }
        for (name, scale) in [
            ("local_upper_crop_scale", self.local_upper_crop_scale),
            ("global_lower_crop_scale", self.global_lower_crop_scale),
        ] {
            if scale <= 0.0 || scale > 1.0 {
                return invalid(format!("{} must lie in (0, 1], got {}", name, scale));
            }
        }
        if self.local_upper_crop_scale <= LOCAL_LOWER_CROP_SCALE {
            return invalid(format!(
                "local_upper_crop_scale must exceed {}, got {}",
                LOCAL_LOWER_CROP_SCALE, self.local_upper_crop_scale
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_dims_double_per_stage() {
        let config = MaxVitConfig {
            dim: 32,
            depth: vec![1, 2, 1],
            ..Default::default()
        };
        assert_eq!(config.stage_dims(), vec![32, 64, 128]);
        assert_eq!(config.feature_dim(), 128);
        assert_eq!(config.stem_dim(), 32);
    }

    #[test]
    fn rejects_head_mismatch_and_missing_registers() {
        let config = MaxVitConfig {
            dim: 48,
            dim_head: 32,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MaxVitConfig {
            num_register_tokens: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MaxVitConfig {
            depth: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn image_size_must_tile_into_windows() {
        let config = MaxVitConfig {
            depth: vec![1, 1],
            window_size: 2,
            ..Default::default()
        };
        // stem + two stages -> /8, windows of 2 -> multiple of 16
        assert!(config.validate_image_size(32).is_ok());
        assert!(config.validate_image_size(16).is_ok());
        match config.validate_image_size(24) {
            Err(ModelError::ImageSize { multiple, .. }) => assert_eq!(multiple, 16),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn es_vit_defaults_are_valid() {
        assert!(EsVitConfig::default().validate().is_ok());
        let bad = EsVitConfig {
            teacher_temp: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn local_crops_need_room_above_the_lower_scale() {
        let config = EsVitConfig {
            local_upper_crop_scale: 0.03,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = EsVitConfig {
            local_upper_crop_scale: LOCAL_LOWER_CROP_SCALE,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: MaxVitConfig = serde_json::from_str(r#"{"num_classes": 3, "depth": [1]}"#).unwrap();
        assert_eq!(config.num_classes, 3);
        assert_eq!(config.window_size, 7);
        assert_eq!(config.num_register_tokens, 4);
    }
}
