use tch::{nn, Kind, Tensor};

use crate::attention::WindowAttention;
use crate::backbone::Backbone;
use crate::config::MaxVitConfig;
use crate::error::Result;
use crate::mbconv::MBConv;

/// FeedForward block (MLP) with a pre-norm.
#[derive(Debug)]
pub struct FeedForward {
    norm: nn::LayerNorm,
    fc: nn::Linear,
    proj: nn::Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(vs: &nn::Path, dim: i64, mult: i64, dropout: f64) -> Self {
        let inner_dim = dim * mult;
        Self {
            norm: nn::layer_norm(vs / "norm", vec![dim], Default::default()),
            fc: nn::linear(vs / "fc", dim, inner_dim, Default::default()),
            proj: nn::linear(vs / "proj", inner_dim, dim, Default::default()),
            dropout,
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.norm)
            .apply(&self.fc)
            .gelu("none")
            .dropout(self.dropout, train)
            .apply(&self.proj)
            .dropout(self.dropout, train)
    }
}

/// One MaxViT block: MBConv, block (local window) attention, then grid
/// (dilated, global) attention. Each attention sees the block's register
/// tokens prepended to every window.
#[derive(Debug)]
pub struct MaxVitBlock {
    conv: MBConv,
    block_attn: WindowAttention,
    block_ff: FeedForward,
    grid_attn: WindowAttention,
    grid_ff: FeedForward,
    register_tokens: Tensor,
    window_size: i64,
    num_registers: i64,
}

impl MaxVitBlock {
    fn new(vs: &nn::Path, config: &MaxVitConfig, dim_in: i64, dim: i64, downsample: bool) -> Self {
        let conv = MBConv::new(
            &(vs / "conv"),
            dim_in,
            dim,
            downsample,
            config.mbconv_expansion_rate,
            config.mbconv_shrinkage_rate,
            0.0,
        );
        let attn = |name: &str| {
            WindowAttention::new(
                &(vs / name),
                dim,
                config.dim_head,
                config.dropout,
                config.window_size,
                config.num_register_tokens,
            )
        };
        let block_attn = attn("block_attn");
        let grid_attn = attn("grid_attn");
        let block_ff = FeedForward::new(&(vs / "block_ff"), dim, 4, config.dropout);
        let grid_ff = FeedForward::new(&(vs / "grid_ff"), dim, 4, config.dropout);

        let register_tokens = vs.var(
            "register_tokens",
            &[config.num_register_tokens, dim],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        );

        Self {
            conv,
            block_attn,
            block_ff,
            grid_attn,
            grid_ff,
            register_tokens,
            window_size: config.window_size,
            num_registers: config.num_register_tokens,
        }
    }

    /// x: [batch, dim_in, height, width]
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let x = self.conv.forward_t(x, train);
        let size = x.size();
        let shape = [size[0], size[1], size[2], size[3]];
        let (w, r, d) = (self.window_size, self.num_registers, shape[1]);

        let tokens = block_partition(&x, w);
        let windows = tokens.size()[0];
        let registers = self.register_tokens.unsqueeze(0).expand([windows, r, d], false);

        let seq = Tensor::cat(&[registers, tokens], 1);
        let seq = self.block_attn.forward_t(&seq, train) + &seq;
        let seq = self.block_ff.forward_t(&seq, train) + &seq;

        let registers = pool_registers(&seq.narrow(1, 0, r), shape[0]);
        let x = block_merge(&seq.narrow(1, r, w * w), shape, w);

        let seq = Tensor::cat(&[registers, grid_partition(&x, w)], 1);
        let seq = self.grid_attn.forward_t(&seq, train) + &seq;

        let tokens = seq.narrow(1, r, w * w);
        let tokens = self.grid_ff.forward_t(&tokens, train) + &tokens;
        grid_merge(&tokens, shape, w)
    }
}

/// b d (x w1) (y w2) -> (b x y) (w1 w2) d
fn block_partition(x: &Tensor, w: i64) -> Tensor {
    let size = x.size();
    let (b, d, nx, ny) = (size[0], size[1], size[2] / w, size[3] / w);
    x.view([b, d, nx, w, ny, w])
        .permute([0, 2, 4, 3, 5, 1])
        .reshape([b * nx * ny, w * w, d])
}

/// Inverse of [`block_partition`] for a `[b, d, height, width]` map.
fn block_merge(tokens: &Tensor, shape: [i64; 4], w: i64) -> Tensor {
    let [b, d, height, width] = shape;
    tokens
        .reshape([b, height / w, width / w, w, w, d])
        .permute([0, 5, 1, 3, 2, 4])
        .reshape([b, d, height, width])
}

/// b d (w1 x) (w2 y) -> (b x y) (w1 w2) d
fn grid_partition(x: &Tensor, w: i64) -> Tensor {
    let size = x.size();
    let (b, d, nx, ny) = (size[0], size[1], size[2] / w, size[3] / w);
    x.view([b, d, w, nx, w, ny])
        .permute([0, 3, 5, 2, 4, 1])
        .reshape([b * nx * ny, w * w, d])
}

/// Inverse of [`grid_partition`] for a `[b, d, height, width]` map.
fn grid_merge(tokens: &Tensor, shape: [i64; 4], w: i64) -> Tensor {
    let [b, d, height, width] = shape;
    tokens
        .reshape([b, height / w, width / w, w, w, d])
        .permute([0, 5, 3, 1, 4, 2])
        .reshape([b, d, height, width])
}

/// Averages `[(b n) r d]` registers over the `n` windows of each image and
/// hands the mean back to every window of that image.
fn pool_registers(registers: &Tensor, batch: i64) -> Tensor {
    let size = registers.size();
    let (r, d) = (size[1], size[2]);
    let n = size[0] / batch;
    registers
        .reshape([batch, n, r, d])
        .mean_dim(Some(&[1][..]), true, Kind::Float)
        .expand([batch, n, r, d], false)
        .reshape([batch * n, r, d])
}

/// MaxViT image classifier with register tokens.
#[derive(Debug)]
pub struct MaxVit {
    stem_conv1: nn::Conv2D,
    stem_conv2: nn::Conv2D,
    blocks: Vec<MaxVitBlock>,
    head_norm: nn::LayerNorm,
    head: nn::Linear,
    pub config: MaxVitConfig,
}

impl MaxVit {
    pub fn new(vs: &nn::Path, config: &MaxVitConfig) -> Result<Self> {
        config.validate()?;

        let stem_dim = config.stem_dim();
        let stem = vs / "conv_stem";
        let stem_conv1 = nn::conv2d(
            &stem / "0",
            config.channels,
            stem_dim,
            3,
            nn::ConvConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );
        let stem_conv2 = nn::conv2d(
            &stem / "1",
            stem_dim,
            stem_dim,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );

        let stage_dims = config.stage_dims();
        let mut dim_in = stem_dim;
        let mut blocks = Vec::new();
        for (stage, (&dim, &depth)) in stage_dims.iter().zip(config.depth.iter()).enumerate() {
            for k in 0..depth {
                let is_first = k == 0;
                let block_dim_in = if is_first { dim_in } else { dim };
                let path = vs / "layers" / blocks.len();
                blocks.push(MaxVitBlock::new(&path, config, block_dim_in, dim, is_first));
                log::debug!("stage {} block {}: {} -> {}", stage, k, block_dim_in, dim);
            }
            dim_in = dim;
        }

        let feature_dim = config.feature_dim();
        let head_norm = nn::layer_norm(vs / "head_norm", vec![feature_dim], Default::default());
        let head = nn::linear(vs / "head", feature_dim, config.num_classes, Default::default());

        Ok(Self {
            stem_conv1,
            stem_conv2,
            blocks,
            head_norm,
            head,
            config: config.clone(),
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl Backbone for MaxVit {
    fn features(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = xs.apply(&self.stem_conv1).apply(&self.stem_conv2);
        for block in &self.blocks {
            x = block.forward_t(&x, train);
        }
        x
    }

    fn feature_dim(&self) -> i64 {
        self.config.feature_dim()
    }
}

impl nn::ModuleT for MaxVit {
    /// Returns logits: [batch, num_classes]
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.features(xs, train)
            .mean_dim(Some(&[2, 3][..]), false, Kind::Float)
            .apply(&self.head_norm)
            .apply(&self.head)
    }
}
