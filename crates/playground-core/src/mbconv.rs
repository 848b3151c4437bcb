use tch::{nn, Kind, Tensor};

/// Channel gating from globally pooled features.
#[derive(Debug)]
pub struct SqueezeExcitation {
    reduce: nn::Linear,
    expand: nn::Linear,
}

impl SqueezeExcitation {
    pub fn new(vs: &nn::Path, dim: i64, shrinkage_rate: f64) -> Self {
        let hidden_dim = ((dim as f64) * shrinkage_rate) as i64;
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        Self {
            reduce: nn::linear(vs / "reduce", dim, hidden_dim.max(1), no_bias),
            expand: nn::linear(vs / "expand", hidden_dim.max(1), dim, no_bias),
        }
    }

    /// x: [batch, channels, height, width]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        let size = x.size();
        let gate = x
            .mean_dim(Some(&[2, 3][..]), false, Kind::Float)
            .apply(&self.reduce)
            .silu()
            .apply(&self.expand)
            .sigmoid()
            .view([size[0], size[1], 1, 1]);
        x * gate
    }
}

/// Per-sample stochastic depth.
#[derive(Debug, Clone, Copy)]
pub struct Dropsample {
    prob: f64,
}

impl Dropsample {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        if self.prob == 0.0 || !train {
            return x.shallow_clone();
        }
        let keep_mask = Tensor::rand([x.size()[0], 1, 1, 1], (Kind::Float, x.device()))
            .gt(self.prob)
            .to_kind(x.kind());
        x * keep_mask / (1.0 - self.prob)
    }
}

/// Inverted bottleneck: pointwise expand, depthwise 3x3, squeeze-excitation,
/// pointwise project.
#[derive(Debug)]
pub struct MBConv {
    expand: nn::Conv2D,
    bn_expand: nn::BatchNorm,
    depthwise: nn::Conv2D,
    bn_depthwise: nn::BatchNorm,
    se: SqueezeExcitation,
    project: nn::Conv2D,
    bn_project: nn::BatchNorm,
    residual: Option<Dropsample>,
}

impl MBConv {
    pub fn new(
        vs: &nn::Path,
        dim_in: i64,
        dim_out: i64,
        downsample: bool,
        expansion_rate: f64,
        shrinkage_rate: f64,
        dropout: f64,
    ) -> Self {
        let hidden_dim = (expansion_rate * dim_out as f64) as i64;
        let stride = if downsample { 2 } else { 1 };

        let expand = nn::conv2d(vs / "expand", dim_in, hidden_dim, 1, Default::default());
        let bn_expand = nn::batch_norm2d(vs / "bn_expand", hidden_dim, Default::default());
        let depthwise = nn::conv2d(
            vs / "depthwise",
            hidden_dim,
            hidden_dim,
            3,
            nn::ConvConfig {
                stride,
                padding: 1,
                groups: hidden_dim,
                ..Default::default()
            },
        );
        let bn_depthwise = nn::batch_norm2d(vs / "bn_depthwise", hidden_dim, Default::default());
        let se = SqueezeExcitation::new(&(vs / "se"), hidden_dim, shrinkage_rate);
        let project = nn::conv2d(vs / "project", hidden_dim, dim_out, 1, Default::default());
        let bn_project = nn::batch_norm2d(vs / "bn_project", dim_out, Default::default());

        let residual = (dim_in == dim_out && !downsample).then(|| Dropsample::new(dropout));

        Self {
            expand,
            bn_expand,
            depthwise,
            bn_depthwise,
            se,
            project,
            bn_project,
            residual,
        }
    }

    pub fn is_residual(&self) -> bool {
        self.residual.is_some()
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let h = x
            .apply(&self.expand)
            .apply_t(&self.bn_expand, train)
            .gelu("none")
            .apply(&self.depthwise)
            .apply_t(&self.bn_depthwise, train)
            .gelu("none");
        let out = self
            .se
            .forward(&h)
            .apply(&self.project)
            .apply_t(&self.bn_project, train);

        match &self.residual {
            Some(dropsample) => dropsample.forward_t(&out, train) + x,
            None => out,
        }
    }
}
