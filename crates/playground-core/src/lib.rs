pub mod attention;
pub mod augment;
pub mod backbone;
pub mod config;
pub mod error;
pub mod es_vit;
pub mod max_vit;
pub mod mbconv;
pub mod safetensors_util;

pub use augment::{Augment, AugmentOp, RandomResizedCrop};
pub use backbone::Backbone;
pub use config::{EsVitConfig, MaxVitConfig};
pub use error::{ModelError, Result};
pub use es_vit::EsVitLearner;
pub use max_vit::MaxVit;
