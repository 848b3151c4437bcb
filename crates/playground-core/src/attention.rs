use tch::{nn, Kind, Tensor};

/// Flattened `[n, n]` table of relative position bias indices for a
/// `window_size x window_size` window preceded by `num_registers` register
/// tokens, where `n = num_registers + window_size^2`.
///
/// Window cells index into `(2w - 1)^2` relative offsets. Every pair that
/// involves a register token maps to the extra slot `(2w - 1)^2`.
pub fn relative_position_indices(window_size: i64, num_registers: i64) -> Vec<i64> {
    let w = window_size;
    let span = 2 * w - 1;
    let register_slot = span * span;
    let n = num_registers + w * w;

    let mut indices = Vec::with_capacity((n * n) as usize);
    for i in 0..n {
        for j in 0..n {
            if i < num_registers || j < num_registers {
                indices.push(register_slot);
                continue;
            }
            let (pi, pj) = (i - num_registers, j - num_registers);
            let (i1, i2) = (pi / w, pi % w);
            let (j1, j2) = (pj / w, pj % w);
            indices.push((i1 - j1 + w - 1) * span + (i2 - j2 + w - 1));
        }
    }
    indices
}

/// Multi-head self attention over one window (or grid cell) of tokens with
/// register tokens and a learned relative position bias.
#[derive(Debug)]
pub struct WindowAttention {
    norm: nn::LayerNorm,
    to_qkv: nn::Linear,
    to_out: nn::Linear,
    rel_pos_bias: nn::Embedding,
    rel_pos_indices: Tensor,
    heads: i64,
    scale: f64,
    dropout: f64,
}

impl WindowAttention {
    pub fn new(
        vs: &nn::Path,
        dim: i64,
        dim_head: i64,
        dropout: f64,
        window_size: i64,
        num_registers: i64,
    ) -> Self {
        let heads = dim / dim_head;
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };

        let norm = nn::layer_norm(vs / "norm", vec![dim], Default::default());
        let to_qkv = nn::linear(vs / "to_qkv", dim, dim * 3, no_bias);
        let to_out = nn::linear(vs / "to_out", dim, dim, no_bias);

        let num_rel_pos_bias = (2 * window_size - 1) * (2 * window_size - 1);
        let rel_pos_bias = nn::embedding(
            vs / "rel_pos_bias",
            num_rel_pos_bias + 1,
            heads,
            Default::default(),
        );

        let n = num_registers + window_size * window_size;
        let rel_pos_indices = Tensor::from_slice(&relative_position_indices(window_size, num_registers))
            .view([n, n])
            .to_device(vs.device());

        Self {
            norm,
            to_qkv,
            to_out,
            rel_pos_bias,
            rel_pos_indices,
            heads,
            scale: (dim_head as f64).powf(-0.5),
            dropout,
        }
    }

    /// x: [batch, registers + window^2, dim]
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let size = x.size();
        let (b, n, c) = (size[0], size[1], size[2]);
        let head_size = c / self.heads;

        let x = x.apply(&self.norm);
        let qkv = x.apply(&self.to_qkv).chunk(3, -1);

        let split_heads = |t: &Tensor| t.view([b, n, self.heads, head_size]).transpose(1, 2);
        let q = split_heads(&qkv[0]) * self.scale;
        let k = split_heads(&qkv[1]);
        let v = split_heads(&qkv[2]);

        let sim = q.matmul(&k.transpose(-2, -1));

        // [n, n, heads] -> [heads, n, n]
        let bias = self.rel_pos_indices.apply(&self.rel_pos_bias).permute([2, 0, 1]);
        let sim = sim + bias;

        let attn = sim.softmax(-1, Kind::Float).dropout(self.dropout, train);
        let out = attn.matmul(&v);

        out.transpose(1, 2)
            .contiguous()
            .view([b, n, c])
            .apply(&self.to_out)
            .dropout(self.dropout, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn register_rows_and_columns_share_one_slot() {
        let w = 3;
        let r = 2;
        let n = (r + w * w) as usize;
        let idx = relative_position_indices(w, r);
        assert_eq!(idx.len(), n * n);

        let slot = (2 * w - 1) * (2 * w - 1);
        for i in 0..n {
            for j in 0..n {
                if i < r as usize || j < r as usize {
                    assert_eq!(idx[i * n + j], slot);
                } else {
                    assert!(idx[i * n + j] < slot);
                }
            }
        }
    }

    #[test]
    fn diagonal_is_zero_offset() {
        let w = 4;
        let n = (w * w) as usize;
        // Without registers, i == j maps to the centre offset (w-1, w-1).
        let idx = relative_position_indices(w, 0);
        let centre = (w - 1) * (2 * w - 1) + (w - 1);
        for i in 0..n {
            assert_eq!(idx[i * n + i], centre);
        }
        // Cell (0,0) relative to (w-1, w-1) is the smallest offset.
        assert_eq!(idx[n - 1], 0);
    }

    #[test]
    fn forward_preserves_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let attn = WindowAttention::new(&vs.root(), 16, 8, 0.0, 2, 1);
        let x = Tensor::randn([3, 5, 16], (Kind::Float, Device::Cpu));
        let y = attn.forward_t(&x, false);
        assert_eq!(y.size(), vec![3, 5, 16]);
    }
}
