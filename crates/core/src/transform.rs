//! Time-axis transforms for trajectory encoding / decoding.
//!
//! The FFT variant is a dense DFT expressed as two constant matmuls, so it
//! lives on the autodiff tape like any other op:
//!
//! ```text
//! Re[k] =  Σ_t x[t]·cos(2πkt/T)        x[t] = (Σ_k Re[k]·cos(2πkt/T)
//! Im[k] = -Σ_t x[t]·sin(2πkt/T)               - Im[k]·sin(2πkt/T)) / T
//! ```
//!
//! The spectrum is stored as `[Re, Im]` along the channel axis, so a
//! `(steps, C)` trajectory becomes `(steps, 2C)`.

use candle_core::{DType, Device, Result, Tensor, D};

use traj_common::TransformKind;

#[derive(Debug, Clone)]
pub struct TransformLayer {
    kind: TransformKind,
    steps: usize,
    channels: usize,
    /// `(cos, sin)` DFT matrices, `(steps, steps)` each.
    dft: Option<(Tensor, Tensor)>,
}

impl TransformLayer {
    /// Transform for `(…, steps, channels)` inputs.
    pub fn new(kind: TransformKind, shape: (usize, usize), device: &Device) -> Result<Self> {
        let (steps, channels) = shape;
        let dft = match kind {
            TransformKind::None => None,
            TransformKind::Fft => Some(dft_matrices(steps, device)?),
        };
        Ok(Self {
            kind,
            steps,
            channels,
            dft,
        })
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    /// Shape `(steps, channels)` of the transformed representation.
    pub fn tshape(&self) -> (usize, usize) {
        match self.kind {
            TransformKind::None => (self.steps, self.channels),
            TransformKind::Fft => (self.steps, 2 * self.channels),
        }
    }

    /// `(…, steps, channels)` → `(…, steps, tchannels)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let Some((cos, sin)) = &self.dft else {
            return Ok(x.clone());
        };
        let x = x.contiguous()?;
        let re = cos.broadcast_matmul(&x)?;
        let im = sin.broadcast_matmul(&x)?.neg()?;
        Tensor::cat(&[&re, &im], D::Minus1)
    }

    /// `(…, steps, tchannels)` → `(…, steps, channels)`.
    pub fn inverse(&self, x: &Tensor) -> Result<Tensor> {
        let Some((cos, sin)) = &self.dft else {
            return Ok(x.clone());
        };
        let c = self.channels;
        let re = x.narrow(D::Minus1, 0, c)?.contiguous()?;
        let im = x.narrow(D::Minus1, c, c)?.contiguous()?;
        let y = (cos.broadcast_matmul(&re)? - sin.broadcast_matmul(&im)?)?;
        y.affine(1.0 / self.steps as f64, 0.0)
    }
}

fn dft_matrices(steps: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let n = steps as f64;
    let mut cos = Vec::with_capacity(steps * steps);
    let mut sin = Vec::with_capacity(steps * steps);
    for k in 0..steps {
        for t in 0..steps {
            let a = 2.0 * std::f64::consts::PI * (k * t) as f64 / n;
            cos.push(a.cos() as f32);
            sin.push(a.sin() as f32);
        }
    }
    let cos = Tensor::from_vec(cos, (steps, steps), device)?.to_dtype(DType::F32)?;
    let sin = Tensor::from_vec(sin, (steps, steps), device)?.to_dtype(DType::F32)?;
    Ok((cos, sin))
}
