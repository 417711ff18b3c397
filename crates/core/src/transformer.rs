//! Encoder–decoder transformer used as a feature extractor (no output head).
//!
//! Inputs and targets are continuous features, so both sides embed through
//! a dense projection scaled by `√d_model` plus sinusoidal positions. Layers
//! are post-norm:
//!
//! ```text
//! enc:  x = LN(x + MHA(x, x));           x = LN(x + FFN(x))
//! dec:  y = LN(y + MHA(y, y));           y = LN(y + MHA(y, enc))
//!       y = LN(y + FFN(y))
//! ```

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{layer_norm, LayerNorm, LayerNormConfig, Module, VarBuilder};

use crate::activation::{Activation, FeedForward};
use crate::attention::MultiHeadAttention;
use crate::layers::Dense;

/// Sizes of a [`Transformer`].
#[derive(Debug, Clone, Copy)]
pub struct TransformerConfig {
    pub num_layers: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub dff: usize,
    /// Feature size of the encoder input.
    pub input_dim: usize,
    /// Feature size of the decoder input.
    pub target_dim: usize,
    /// Longest sequence the positional table covers.
    pub max_len: usize,
    pub layer_norm_eps: f64,
}

fn norm(config: &TransformerConfig, vb: VarBuilder) -> Result<LayerNorm> {
    let cfg = LayerNormConfig {
        eps: config.layer_norm_eps,
        ..Default::default()
    };
    layer_norm(config.d_model, cfg, vb)
}

// ── Encoder ─────────────────────────────────────────────────────────────────

struct EncoderLayer {
    attn: MultiHeadAttention,
    ln1: LayerNorm,
    ffn: FeedForward,
    ln2: LayerNorm,
}

impl EncoderLayer {
    fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: MultiHeadAttention::new(config.d_model, config.num_heads, vb.pp("attn"))?,
            ln1: norm(config, vb.pp("ln1"))?,
            ffn: FeedForward::new(config.d_model, config.dff, vb.pp("mlp"))?,
            ln2: norm(config, vb.pp("ln2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.ln1.forward(&(x + self.attn.forward(x, x)?)?)?;
        self.ln2.forward(&(&x + self.ffn.forward(&x)?)?)
    }
}

// ── Decoder ─────────────────────────────────────────────────────────────────

struct DecoderLayer {
    self_attn: MultiHeadAttention,
    ln1: LayerNorm,
    cross_attn: MultiHeadAttention,
    ln2: LayerNorm,
    ffn: FeedForward,
    ln3: LayerNorm,
}

impl DecoderLayer {
    fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let (d, h) = (config.d_model, config.num_heads);
        Ok(Self {
            self_attn: MultiHeadAttention::new(d, h, vb.pp("self_attn"))?,
            ln1: norm(config, vb.pp("ln1"))?,
            cross_attn: MultiHeadAttention::new(d, h, vb.pp("cross_attn"))?,
            ln2: norm(config, vb.pp("ln2"))?,
            ffn: FeedForward::new(d, config.dff, vb.pp("mlp"))?,
            ln3: norm(config, vb.pp("ln3"))?,
        })
    }

    fn forward(&self, y: &Tensor, enc: &Tensor) -> Result<Tensor> {
        let y = self.ln1.forward(&(y + self.self_attn.forward(y, y)?)?)?;
        let y = self.ln2.forward(&(&y + self.cross_attn.forward(&y, enc)?)?)?;
        self.ln3.forward(&(&y + self.ffn.forward(&y)?)?)
    }
}

// ── Transformer ─────────────────────────────────────────────────────────────

pub struct Transformer {
    input_embed: Dense,
    target_embed: Dense,
    encoder: Vec<EncoderLayer>,
    decoder: Vec<DecoderLayer>,
    positions: Tensor,
    embed_scale: f64,
}

impl Transformer {
    pub fn new(config: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        let encoder = (0..config.num_layers)
            .map(|i| EncoderLayer::new(config, vb.pp(format!("enc.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let decoder = (0..config.num_layers)
            .map(|i| DecoderLayer::new(config, vb.pp(format!("dec.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            input_embed: Dense::new(config.input_dim, d, Activation::Linear, vb.pp("input_embed"))?,
            target_embed: Dense::new(
                config.target_dim,
                d,
                Activation::Linear,
                vb.pp("target_embed"),
            )?,
            encoder,
            decoder,
            positions: positional_encoding(config.max_len, d, vb.device())?,
            embed_scale: (d as f64).sqrt(),
        })
    }

    /// `inputs`: `(b, ti, input_dim)`, `targets`: `(b, tt, target_dim)`
    /// → decoder features `(b, tt, d_model)`.
    pub fn forward(&self, inputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let mut x = self.embed(&self.input_embed, inputs)?;
        for layer in &self.encoder {
            x = layer.forward(&x)?;
        }
        let mut y = self.embed(&self.target_embed, targets)?;
        for layer in &self.decoder {
            y = layer.forward(&y, &x)?;
        }
        Ok(y)
    }

    fn embed(&self, fc: &Dense, x: &Tensor) -> Result<Tensor> {
        let t = x.dim(1)?;
        if t > self.positions.dim(0)? {
            return Err(candle_core::Error::Msg(format!(
                "sequence of {t} steps exceeds the positional table ({})",
                self.positions.dim(0)?
            )));
        }
        let e = fc.forward(x)?.affine(self.embed_scale, 0.0)?;
        e.broadcast_add(&self.positions.narrow(0, 0, t)?)
    }
}

/// Sinusoidal table `(max_len, d)`: `sin` on even channels, `cos` on odd.
fn positional_encoding(max_len: usize, d: usize, device: &Device) -> Result<Tensor> {
    let mut table = Vec::with_capacity(max_len * d);
    for pos in 0..max_len {
        for i in 0..d {
            let rate = 1.0 / 10000f64.powf((2 * (i / 2)) as f64 / d as f64);
            let angle = pos as f64 * rate;
            table.push(if i % 2 == 0 { angle.sin() } else { angle.cos() } as f32);
        }
    }
    Tensor::from_vec(table, (max_len, d), device)?.to_dtype(DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn config() -> TransformerConfig {
        TransformerConfig {
            num_layers: 2,
            d_model: 16,
            num_heads: 4,
            dff: 32,
            input_dim: 16,
            target_dim: 4,
            max_len: 8,
            layer_norm_eps: 1e-6,
        }
    }

    #[test]
    fn decoder_features_follow_targets() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let t = Transformer::new(&config(), vb).unwrap();
        let inputs = Tensor::randn(0f32, 1.0, (3, 8, 16), &Device::Cpu).unwrap();
        let targets = Tensor::randn(0f32, 1.0, (3, 6, 4), &Device::Cpu).unwrap();
        assert_eq!(t.forward(&inputs, &targets).unwrap().dims(), &[3, 6, 16]);
    }

    #[test]
    fn too_long_sequence_is_an_error() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let t = Transformer::new(&config(), vb).unwrap();
        let inputs = Tensor::zeros((1, 9, 16), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(t.forward(&inputs, &targets).is_err());
    }

    #[test]
    fn positions_start_with_sin0_cos0() {
        let p = positional_encoding(4, 6, &Device::Cpu).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(p[0], vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert!((p[1][0] - 1f32.sin()).abs() < 1e-6);
    }
}
