//! Second-stage handlers that turn key-point proposals into full futures.

use candle_core::{Device, Result, Tensor};

use traj_common::{InputType, ModelConfig};

use crate::model::{ModelOutput, TrajModel};
use crate::process::last_points;

/// Parameter-free handler: piecewise-linear interpolation through the last
/// observed point and the proposed key points.
///
/// Frames after the last key point hold its value. Inputs are the declared
/// [`input_types`](TrajModel::input_types) followed by the proposals
/// `(b, K, n_key, 2)`.
pub struct LinearHandler {
    input_types: Vec<InputType>,
    /// `(pred_frames, n_key + 1)`; column 0 weights the last observation.
    weights: Tensor,
}

impl LinearHandler {
    pub fn new(config: &ModelConfig, device: &Device) -> anyhow::Result<Self> {
        let keys = config.key_points()?;
        if keys.is_empty() || keys.windows(2).any(|w| w[0] >= w[1]) {
            anyhow::bail!("linear handler needs strictly increasing key points, got {keys:?}");
        }
        let weights = interpolation_matrix(&keys, config.pred_frames);
        let weights = Tensor::from_vec(weights, (config.pred_frames, keys.len() + 1), device)?;
        Ok(Self {
            input_types: vec![InputType::Obs],
            weights,
        })
    }
}

/// Row `f` blends the two anchors around frame `f`; anchor 0 sits at
/// frame -1 (the last observation), anchor `i + 1` at `keys[i]`.
fn interpolation_matrix(keys: &[usize], pred_frames: usize) -> Vec<f32> {
    let cols = keys.len() + 1;
    let times: Vec<f32> = std::iter::once(-1.0)
        .chain(keys.iter().map(|k| *k as f32))
        .collect();
    let mut m = vec![0f32; pred_frames * cols];
    for f in 0..pred_frames {
        let t = f as f32;
        let row = &mut m[f * cols..(f + 1) * cols];
        match times.windows(2).position(|w| t <= w[1]) {
            Some(seg) => {
                let (t0, t1) = (times[seg], times[seg + 1]);
                let a = (t - t0) / (t1 - t0);
                row[seg] = 1.0 - a;
                row[seg + 1] = a;
            }
            None => row[cols - 1] = 1.0,
        }
    }
    m
}

impl TrajModel for LinearHandler {
    fn name(&self) -> &str {
        "linear"
    }

    fn input_types(&self) -> &[InputType] {
        &self.input_types
    }

    fn forward(&self, inputs: &[Tensor], _training: bool) -> Result<ModelOutput> {
        let (obs, proposals) = match inputs {
            [obs, .., proposals] => (obs, proposals),
            _ => {
                return Err(candle_core::Error::Msg(
                    "linear handler expects observations and proposals".into(),
                ))
            }
        };
        let (b, k, _, dim) = proposals.dims4()?;
        let last = last_points(obs)?
            .reshape((b, 1, 1, dim))?
            .broadcast_as((b, k, 1, dim))?;
        let anchors = Tensor::cat(&[&last, proposals], 2)?.contiguous()?;
        let prediction = self
            .weights
            .to_dtype(anchors.dtype())?
            .broadcast_matmul(&anchors)?;
        Ok(ModelOutput::new(prediction))
    }
}
