//! Pre-/post-processing of observed trajectories.
//!
//! Steps run in the order Move → Scale → Rotate on the observation and are
//! undone in reverse order on predictions:
//!
//! | Step   | Forward | Inverse |
//! |--------|---------|---------|
//! | Move   | `x - ref` (ref = last observed point) | `y + ref` |
//! | Scale  | `x / s` (s = observed travel length) | `y · s` |
//! | Rotate | `x @ R(θ)`, heading θ → +x | `y @ R(θ)ᵀ` |
//!
//! Per-sample constants are computed on the CPU; applying them is ordinary
//! tensor math, so gradients flow through [`Processor::postprocess`].

use candle_core::{Device, Result, Tensor, D};

use traj_common::Preprocess;

/// Travel lengths below this are treated as standing still.
const MIN_TRAVEL: f32 = 1e-2;

/// Per-batch constants captured by [`Processor::preprocess`].
#[derive(Debug, Clone)]
pub struct ProcessState {
    /// Unprocessed last observed points, `(b, 1, 2)`.
    pub ref_points: Tensor,
    /// Scale divisors, `(b, 1, 1)`; `None` when scaling is off.
    pub scales: Option<Tensor>,
    /// Rotation matrices `(b, 2, 2)`; `None` when rotation is off.
    pub rotation: Option<Tensor>,
    /// Heading angles (radians) that were rotated away.
    pub angles: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Processor {
    flags: Preprocess,
}

impl Processor {
    pub fn new(flags: Preprocess) -> Self {
        Self { flags }
    }

    pub fn flags(&self) -> Preprocess {
        self.flags
    }

    /// `obs`: `(b, obs_frames, 2)` → processed observation and its state.
    pub fn preprocess(&self, obs: &Tensor) -> Result<(Tensor, ProcessState)> {
        let device = obs.device();
        let (b, t, _) = obs.dims3()?;
        let rows = obs.to_device(&Device::Cpu)?.to_vec3::<f32>()?;

        let ref_points = obs.narrow(1, t - 1, 1)?;
        let mut x = obs.clone();
        if self.flags.moving {
            x = x.broadcast_sub(&ref_points)?;
        }

        let mut state = ProcessState {
            ref_points,
            scales: None,
            rotation: None,
            angles: None,
        };

        if self.flags.scale {
            let scales: Vec<f32> = rows
                .iter()
                .map(|r| {
                    let (dx, dy) = heading(r);
                    let s = (dx * dx + dy * dy).sqrt();
                    if s < MIN_TRAVEL { 1.0 } else { s }
                })
                .collect();
            let scales = Tensor::from_vec(scales, (b, 1, 1), device)?;
            x = x.broadcast_div(&scales)?;
            state.scales = Some(scales);
        }

        if self.flags.rotate {
            let angles: Vec<f32> = rows
                .iter()
                .map(|r| {
                    let (dx, dy) = heading(r);
                    dy.atan2(dx)
                })
                .collect();
            let rotation = rotation_matrices(&angles, device)?;
            x = x.contiguous()?.matmul(&rotation)?;
            state.rotation = Some(rotation);
            state.angles = Some(angles);
        }

        Ok((x, state))
    }

    /// Undo preprocessing on predictions `(b, …, steps, 2)`.
    pub fn postprocess(&self, y: &Tensor, state: &ProcessState) -> Result<Tensor> {
        let extra = y.rank().saturating_sub(3);
        let mut y = y.clone();
        if let Some(rotation) = &state.rotation {
            let rt = expand(&rotation.t()?.contiguous()?, extra)?;
            y = y.contiguous()?.broadcast_matmul(&rt)?;
        }
        if let Some(scales) = &state.scales {
            y = y.broadcast_mul(&expand(scales, extra)?)?;
        }
        if self.flags.moving {
            y = y.broadcast_add(&expand(&state.ref_points, extra)?)?;
        }
        Ok(y)
    }
}

/// Observed displacement from the first to the last frame.
fn heading(rows: &[Vec<f32>]) -> (f32, f32) {
    match (rows.first(), rows.last()) {
        (Some(a), Some(b)) => (b[0] - a[0], b[1] - a[1]),
        _ => (0.0, 0.0),
    }
}

/// Row-vector rotation by `-θ`: `[[cos θ, -sin θ], [sin θ, cos θ]]`.
fn rotation_matrices(angles: &[f32], device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = angles
        .iter()
        .flat_map(|a| {
            let (s, c) = a.sin_cos();
            [c, -s, s, c]
        })
        .collect();
    Tensor::from_vec(data, (angles.len(), 2, 2), device)
}

/// Insert `extra` unit axes after the batch axis so `(b, m, n)` broadcasts
/// against `(b, …, steps, 2)`.
fn expand(x: &Tensor, extra: usize) -> Result<Tensor> {
    let mut x = x.clone();
    for _ in 0..extra {
        x = x.unsqueeze(1)?;
    }
    Ok(x)
}

/// Rotate 2D points `(…, 2)` by `-angle` per batch row (`angles.len() == b`).
pub fn rotate_points(points: &Tensor, angles: &[f32]) -> Result<Tensor> {
    let extra = points.rank().saturating_sub(3);
    let r = expand(&rotation_matrices(angles, points.device())?, extra)?;
    points.contiguous()?.broadcast_matmul(&r)
}

/// Last observed point of every sample, `(b, 2)`.
pub fn last_points(obs: &Tensor) -> Result<Tensor> {
    let t = obs.dim(D::Minus2)?;
    obs.narrow(D::Minus2, t - 1, 1)?.squeeze(D::Minus2)
}
