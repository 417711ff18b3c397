//! Multi-head scaled dot-product attention.
//!
//! Separate Q, K and V projections so the same layer serves encoder
//! self-attention and decoder cross-attention. Attention is unmasked: every
//! query step sees the whole memory.

use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::activation::Activation;
use crate::layers::Dense;

/// Multi-head attention over `(batch, steps, d_model)` sequences.
pub struct MultiHeadAttention {
    q_proj: Dense,
    k_proj: Dense,
    v_proj: Dense,
    c_proj: Dense,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(candle_core::Error::Msg(format!(
                "d_model ({d_model}) must be divisible by num_heads ({num_heads})"
            )));
        }
        let head_dim = d_model / num_heads;
        Ok(Self {
            q_proj: Dense::new(d_model, d_model, Activation::Linear, vb.pp("q_proj"))?,
            k_proj: Dense::new(d_model, d_model, Activation::Linear, vb.pp("k_proj"))?,
            v_proj: Dense::new(d_model, d_model, Activation::Linear, vb.pp("v_proj"))?,
            c_proj: Dense::new(d_model, d_model, Activation::Linear, vb.pp("c_proj"))?,
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `query`: `(b, tq, d)`, `memory`: `(b, tk, d)` → `(b, tq, d)`.
    pub fn forward(&self, query: &Tensor, memory: &Tensor) -> Result<Tensor> {
        let (b, tq, c) = query.dims3()?;
        let tk = memory.dim(1)?;

        let q = self.split_heads(&self.q_proj.forward(query)?, b, tq)?;
        let k = self.split_heads(&self.k_proj.forward(memory)?, b, tk)?;
        let v = self.split_heads(&self.v_proj.forward(memory)?, b, tk)?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;

        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, tq, c))?;
        self.c_proj.forward(&y)
    }

    /// `(b, t, d)` → `(b, heads, t, head_dim)`.
    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn cross_attention_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadAttention::new(16, 4, vb).unwrap();
        let q = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu).unwrap();
        let m = Tensor::randn(0f32, 1.0, (2, 9, 16), &Device::Cpu).unwrap();
        assert_eq!(attn.forward(&q, &m).unwrap().dims(), &[2, 5, 16]);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MultiHeadAttention::new(10, 4, vb).is_err());
    }

    #[test]
    fn output_ignores_memory_order() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = MultiHeadAttention::new(8, 2, vb).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
        let m = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu).unwrap();
        let reversed = Tensor::new(&[3u32, 2, 1, 0], &Device::Cpu).unwrap();
        let m_rev = m.index_select(&reversed, 1).unwrap();

        let a = attn.forward(&q, &m).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = attn.forward(&q, &m_rev).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (u, v) in a.iter().zip(&b) {
            assert!((u - v).abs() < 1e-5);
        }
    }
}
