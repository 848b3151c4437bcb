use tch::Tensor;

/// A network that exposes its last spatial feature map, which is what the
/// self-supervised learners attach their projection heads to.
pub trait Backbone: std::fmt::Debug {
    /// Feature map just before the classification head: [batch, channels, height, width]
    fn features(&self, xs: &Tensor, train: bool) -> Tensor;

    /// Number of channels returned by [`Backbone::features`].
    fn feature_dim(&self) -> i64;
}
