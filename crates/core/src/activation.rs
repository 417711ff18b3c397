//! Activations and the transformer feed-forward block.
//!
//! | Activation | Formula | Used by |
//! |------------|---------|---------|
//! | Linear     | x | decoder output, attention projections |
//! | ReLU       | max(0, x) | trajectory encoding, feed-forward |
//! | Tanh       | tanh(x) | bilinear / fusion / noise encodings |

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::Dense;

/// Pointwise activation applied after a dense projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
}

impl Activation {
    #[inline]
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear => Ok(x.clone()),
            Self::Relu => x.relu(),
            Self::Tanh => x.tanh(),
        }
    }
}

// ── Feed-Forward ────────────────────────────────────────────────────────────

/// Two-projection FFN of a transformer layer:
///
/// ```text
/// out = W_down( relu( W_up(x) ) )
/// ```
pub struct FeedForward {
    w_up: Dense,
    w_down: Dense,
}

impl FeedForward {
    pub fn new(d_model: usize, dff: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_up: Dense::new(d_model, dff, Activation::Relu, vb.pp("w_up"))?,
            w_down: Dense::new(dff, d_model, Activation::Linear, vb.pp("w_down"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.w_down.forward(&self.w_up.forward(x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn activations_pointwise() {
        let x = Tensor::new(&[-1.0f32, 0.0, 2.0], &Device::Cpu).unwrap();
        assert_eq!(
            Activation::Relu.apply(&x).unwrap().to_vec1::<f32>().unwrap(),
            vec![0.0, 0.0, 2.0]
        );
        assert_eq!(
            Activation::Linear.apply(&x).unwrap().to_vec1::<f32>().unwrap(),
            vec![-1.0, 0.0, 2.0]
        );
        let t = Activation::Tanh.apply(&x).unwrap().to_vec1::<f32>().unwrap();
        assert!((t[2] - 2.0f32.tanh()).abs() < 1e-6);
    }
}
