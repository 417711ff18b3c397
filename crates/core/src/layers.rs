//! Building-block layers of the trajectory models.
//!
//! All layers operate on the last axis (features) and keep any number of
//! leading batch axes, so the same `Dense` serves `(batch, steps, d)` and
//! `(batch, K, steps, d)` inputs.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::activation::Activation;
use crate::transform::TransformLayer;

// ── Dense ───────────────────────────────────────────────────────────────────

/// Fully-connected layer with an activation.
pub struct Dense {
    linear: Linear,
    activation: Activation,
    out_dim: usize,
}

impl Dense {
    pub fn new(in_dim: usize, out_dim: usize, activation: Activation, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear: linear(in_dim, out_dim, vb)?,
            activation,
            out_dim,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let last = dims[dims.len() - 1];
        let rows = x.elem_count() / last.max(1);
        let y = self.linear.forward(&x.reshape((rows, last))?)?;
        let y = self.activation.apply(&y)?;
        let mut out_dims = dims;
        let n = out_dims.len();
        out_dims[n - 1] = self.out_dim;
        y.reshape(out_dims)
    }
}

// ── TrajEncoding ────────────────────────────────────────────────────────────

/// Optional time-axis transform followed by a dense embedding.
pub struct TrajEncoding {
    transform: Option<TransformLayer>,
    fc: Dense,
}

impl TrajEncoding {
    /// `input_units` is the channel count *before* the transform.
    pub fn new(
        input_units: usize,
        output_units: usize,
        activation: Activation,
        transform: Option<TransformLayer>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_dim = match &transform {
            Some(t) => t.tshape().1,
            None => input_units,
        };
        Ok(Self {
            fc: Dense::new(in_dim, output_units, activation, vb.pp("fc"))?,
            transform,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.transform {
            Some(t) => self.fc.forward(&t.forward(x)?),
            None => self.fc.forward(x),
        }
    }
}

// ── Bilinear pieces ─────────────────────────────────────────────────────────

/// Outer product of two feature vectors: `(.., a) × (.., b) → (.., a, b)`.
pub struct OuterLayer {
    a_dim: usize,
    b_dim: usize,
}

impl OuterLayer {
    pub fn new(a_dim: usize, b_dim: usize) -> Self {
        Self { a_dim, b_dim }
    }

    pub fn forward(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        debug_assert_eq!(a.dim(D::Minus1)?, self.a_dim);
        debug_assert_eq!(b.dim(D::Minus1)?, self.b_dim);
        a.unsqueeze(D::Minus1)?.broadcast_mul(&b.unsqueeze(a.rank() - 1)?)
    }
}

/// 2D max pooling over the last two axes of a rank-4 tensor.
pub struct MaxPooling2D {
    size: (usize, usize),
}

impl MaxPooling2D {
    pub fn new(size: (usize, usize)) -> Self {
        Self { size }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.contiguous()?.max_pool2d(self.size)
    }
}

/// Flatten the last `axes` axes into one.
pub struct Flatten {
    axes: usize,
}

impl Flatten {
    pub fn new(axes: usize) -> Self {
        Self { axes }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let rank = x.rank();
        if self.axes <= 1 || self.axes > rank {
            return Ok(x.clone());
        }
        x.flatten(rank - self.axes, rank - 1)
    }
}

// ── GraphConv ───────────────────────────────────────────────────────────────

/// Graph convolution: `fc(adj @ features)`.
///
/// `features`: `(batch, n, d_in)`, `adj`: `(batch, m, n)` → `(batch, m, d_out)`.
pub struct GraphConv {
    fc: Dense,
}

impl GraphConv {
    pub fn new(in_dim: usize, out_dim: usize, activation: Activation, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc: Dense::new(in_dim, out_dim, activation, vb.pp("fc"))?,
        })
    }

    pub fn forward(&self, features: &Tensor, adj: &Tensor) -> Result<Tensor> {
        let x = adj.contiguous()?.matmul(&features.contiguous()?)?;
        self.fc.forward(&x)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
