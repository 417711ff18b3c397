//! Transformer-based agent models (`ev`, `evsc`, `evspc`).
//!
//! Pipeline for one batch:
//!
//! 1. Preprocess the observation (move / scale / rotate).
//! 2. Trajectory embedding: transform → dense → outer product → 2×2 max
//!    pooling → flatten → dense, giving `(b, obs, d/2)` bilinear features.
//! 3. Optional circle: SocialCircle (and PhysicalCircle), encoded to
//!    `(b, obs, d/2)` and fused with the trajectory features.
//! 4. For every noise repeat: encode `z ~ N(0, 1)`, concatenate, run the
//!    transformer, mix `Kc` styles with a learned adjacency (graph conv) and
//!    decode key-point spectra, then invert the transform.
//! 5. Concatenate repeats and undo preprocessing.
//!
//! Output: `(b, K·Kc, n_key, dim)` key-point predictions in world
//! coordinates, plus the fused circle and neighbour bearings as aux outputs.

use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;

use traj_common::{InputType, ModelConfig};

use crate::activation::Activation;
use crate::circle::{CircleFusionLayer, PhysicalCircleLayer, SocialCircleLayer};
use crate::layers::{Dense, Flatten, GraphConv, MaxPooling2D, OuterLayer, TrajEncoding};
use crate::model::{ModelOutput, TrajModel};
use crate::process::Processor;
use crate::transform::TransformLayer;
use crate::transformer::{Transformer, TransformerConfig};

/// Which context circle feeds the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircleMode {
    None,
    Social,
    SocialPhysical,
}

/// Circle branch: descriptors, their encoder and the fusion dense layer.
struct CircleBranch {
    social: SocialCircleLayer,
    physical: Option<(PhysicalCircleLayer, CircleFusionLayer)>,
    encoder: TrajEncoding,
    concat_fc: Dense,
    use_empty_seg_maps: bool,
}

pub struct EvAgentModel {
    name: &'static str,
    input_types: Vec<InputType>,
    processor: Processor,

    t1: TransformLayer,
    it1: TransformLayer,
    te: TrajEncoding,

    outer: OuterLayer,
    pooling: MaxPooling2D,
    flatten: Flatten,
    outer_fc: Dense,

    circle: Option<CircleBranch>,

    ie: TrajEncoding,
    transformer: Transformer,
    ms_fc: Dense,
    ms_conv: GraphConv,
    decoder_fc1: Dense,
    decoder_fc2: Dense,

    d_id: usize,
    kc: usize,
    k: usize,
    k_train: usize,
    tsteps_de: usize,
    tchannels_de: usize,
}

impl EvAgentModel {
    pub fn new(config: &ModelConfig, mode: CircleMode, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let d = config.feature_dim;
        let dim = config.dim;
        let n_key = config
            .key_points()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?
            .len();

        let t1 = TransformLayer::new(config.transform, (config.obs_frames, dim), &device)?;
        let it1 = TransformLayer::new(config.transform, (n_key, dim), &device)?;
        let (tsteps_en, tchannels_en) = t1.tshape();
        let (tsteps_de, tchannels_de) = it1.tshape();

        let te = TrajEncoding::new(dim, d / 2, Activation::Relu, Some(t1.clone()), vb.pp("te"))?;

        let circle = match mode {
            CircleMode::None => None,
            CircleMode::Social | CircleMode::SocialPhysical => {
                let social = SocialCircleLayer::new(config);
                let physical = (mode == CircleMode::SocialPhysical).then(|| {
                    let fusion = CircleFusionLayer::new(&social);
                    (PhysicalCircleLayer::new(config), fusion)
                });
                let circle_dim = match &physical {
                    Some((_, fusion)) => fusion.dim(),
                    None => social.dim(),
                };
                let steps = config.obs_frames.max(config.partitions);
                let ts = TransformLayer::new(config.circle_transform, (steps, circle_dim), &device)?;
                Some(CircleBranch {
                    encoder: TrajEncoding::new(
                        circle_dim,
                        d / 2,
                        Activation::Relu,
                        Some(ts),
                        vb.pp("tse"),
                    )?,
                    concat_fc: Dense::new(d, d / 2, Activation::Tanh, vb.pp("concat_fc"))?,
                    social,
                    physical,
                    use_empty_seg_maps: config.use_empty_seg_maps,
                })
            }
        };

        let transformer = Transformer::new(
            &TransformerConfig {
                num_layers: config.transformer_layers,
                d_model: d,
                num_heads: config.transformer_heads,
                dff: config.transformer_dff,
                input_dim: d,
                target_dim: tchannels_en,
                max_len: tsteps_en.max(config.obs_frames),
                layer_norm_eps: config.layer_norm_eps,
            },
            vb.pp("transformer"),
        )?;

        let (name, input_types) = match mode {
            CircleMode::None => ("ev", vec![InputType::Obs]),
            CircleMode::Social => ("evsc", vec![InputType::Obs, InputType::Neighbor]),
            CircleMode::SocialPhysical => (
                "evspc",
                vec![
                    InputType::Obs,
                    InputType::Neighbor,
                    InputType::Map,
                    InputType::MapPara,
                ],
            ),
        };

        let pooled = (d / 4) * (d / 4);
        Ok(Self {
            name,
            input_types,
            processor: Processor::new(config.preprocess_flags()),
            te,
            outer: OuterLayer::new(d / 2, d / 2),
            pooling: MaxPooling2D::new((2, 2)),
            flatten: Flatten::new(2),
            outer_fc: Dense::new(pooled, d / 2, Activation::Tanh, vb.pp("outer_fc"))?,
            circle,
            ie: TrajEncoding::new(config.depth, d / 2, Activation::Tanh, None, vb.pp("ie"))?,
            transformer,
            ms_fc: Dense::new(d, config.kc, Activation::Tanh, vb.pp("ms_fc"))?,
            ms_conv: GraphConv::new(d, d, Activation::Linear, vb.pp("ms_conv"))?,
            decoder_fc1: Dense::new(d, d, Activation::Tanh, vb.pp("decoder_fc1"))?,
            decoder_fc2: Dense::new(
                d,
                tsteps_de * tchannels_de,
                Activation::Linear,
                vb.pp("decoder_fc2"),
            )?,
            t1,
            it1,
            d_id: config.depth,
            kc: config.kc,
            k: config.k.max(1),
            k_train: config.k_train.max(1),
            tsteps_de,
            tchannels_de,
        })
    }

    fn input<'a>(&self, inputs: &'a [Tensor], kind: InputType) -> Result<&'a Tensor> {
        self.input_types
            .iter()
            .position(|t| *t == kind)
            .and_then(|i| inputs.get(i))
            .ok_or_else(|| {
                candle_core::Error::Msg(format!("{}: missing `{}` input", self.name, kind.name()))
            })
    }

    /// Bilinear trajectory features `(b, obs, d/2)`.
    fn embed_trajectory(&self, obs: &Tensor) -> Result<Tensor> {
        let f = self.te.forward(obs)?;
        let f = self.outer.forward(&f, &f)?;
        let f = self.pooling.forward(&f)?;
        let f = self.flatten.forward(&f)?;
        self.outer_fc.forward(&f)
    }
}

impl TrajModel for EvAgentModel {
    fn name(&self) -> &str {
        self.name
    }

    fn input_types(&self) -> &[InputType] {
        &self.input_types
    }

    fn forward(&self, inputs: &[Tensor], training: bool) -> Result<ModelOutput> {
        let raw_obs = self.input(inputs, InputType::Obs)?;
        let (obs, state) = self.processor.preprocess(raw_obs)?;
        let f_traj = self.embed_trajectory(&obs)?;

        let mut aux = Vec::new();
        let f_behavior = match &self.circle {
            None => f_traj,
            Some(branch) => {
                let nei = self.input(inputs, InputType::Neighbor)?;
                let angles = state.angles.as_deref();
                let (social, f_direction) = branch.social.forward(raw_obs, nei, angles)?;
                let circle = match &branch.physical {
                    None => social,
                    Some((physical, fusion)) => {
                        let mut maps = self.input(inputs, InputType::Map)?.clone();
                        if branch.use_empty_seg_maps {
                            maps = maps.zeros_like()?;
                        }
                        let paras = self.input(inputs, InputType::MapPara)?;
                        let pc = physical.forward(&maps, paras, raw_obs, angles)?;
                        fusion.forward(&social, &pc)?
                    }
                };
                let f_social = branch.encoder.forward(&circle)?;
                aux.push(circle);
                aux.push(f_direction);
                branch
                    .concat_fc
                    .forward(&Tensor::cat(&[&f_traj, &f_social], D::Minus1)?)?
            }
        };

        let traj_targets = self.t1.forward(&obs)?;
        let (b, steps, _) = f_behavior.dims3()?;
        let repeats = if training { self.k_train } else { self.k };

        let mut all_predictions = Vec::with_capacity(repeats);
        for _ in 0..repeats {
            let z = Tensor::randn(0f32, 1f32, (b, steps, self.d_id), f_behavior.device())?;
            let f_z = self.ie.forward(&z)?;
            let f_final = Tensor::cat(&[&f_behavior, &f_z], D::Minus1)?;

            let f_tran = self.transformer.forward(&f_final, &traj_targets)?;

            // (b, steps, Kc) → (b, Kc, steps)
            let adj = self.ms_fc.forward(&f_final)?.transpose(1, 2)?;
            let f_multi = self.ms_conv.forward(&f_tran, &adj)?;

            let y = self.decoder_fc1.forward(&f_multi)?;
            let y = self.decoder_fc2.forward(&y)?;
            let y = y.reshape((b, self.kc, self.tsteps_de, self.tchannels_de))?;
            all_predictions.push(self.it1.inverse(&y)?);
        }

        let y = Tensor::cat(&all_predictions, 1)?;
        let prediction = self.processor.postprocess(&y, &state)?;
        Ok(ModelOutput { prediction, aux })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use traj_common::INIT_POSITION;

    fn config() -> ModelConfig {
        ModelConfig {
            obs_frames: 4,
            pred_frames: 6,
            key_points: "1_3_5".into(),
            feature_dim: 16,
            depth: 4,
            kc: 3,
            k: 2,
            k_train: 1,
            transformer_layers: 1,
            transformer_heads: 2,
            transformer_dff: 16,
            partitions: 4,
            max_agents: 2,
            preprocess: "111".into(),
            ..Default::default()
        }
    }

    fn obs(b: usize) -> Tensor {
        Tensor::arange(0f32, (b * 4 * 2) as f32, &Device::Cpu)
            .unwrap()
            .reshape((b, 4, 2))
            .unwrap()
    }

    fn neighbours(b: usize) -> Tensor {
        let mut data = vec![1.0f32; b * 4 * 2];
        data.extend(vec![INIT_POSITION; b * 4 * 2]);
        Tensor::from_vec(data, (2, b, 4, 2), &Device::Cpu)
            .unwrap()
            .transpose(0, 1)
            .unwrap()
            .contiguous()
            .unwrap()
    }

    fn build(mode: CircleMode) -> (VarMap, EvAgentModel) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = EvAgentModel::new(&config(), mode, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn ev_prediction_shape_follows_repeats() {
        let (_vm, model) = build(CircleMode::None);
        let train = model.forward(&[obs(3)], true).unwrap();
        assert_eq!(train.prediction.dims(), &[3, 3, 3, 2]);
        let test = model.forward(&[obs(3)], false).unwrap();
        assert_eq!(test.prediction.dims(), &[3, 6, 3, 2]);
        assert!(test.aux.is_empty());
    }

    #[test]
    fn evsc_returns_circle_and_bearings() {
        let (_vm, model) = build(CircleMode::Social);
        let out = model.forward(&[obs(2), neighbours(2)], false).unwrap();
        assert_eq!(out.prediction.dims(), &[2, 6, 3, 2]);
        assert_eq!(out.aux[0].dims(), &[2, 4, 3]);
        assert_eq!(out.aux[1].dims(), &[2, 2]);
    }

    #[test]
    fn evspc_fuses_physical_circle() {
        let (_vm, model) = build(CircleMode::SocialPhysical);
        let maps = Tensor::zeros((2, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let paras = Tensor::new(&[[1.0f32, 1.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0]], &Device::Cpu)
            .unwrap();
        let out = model
            .forward(&[obs(2), neighbours(2), maps, paras], true)
            .unwrap();
        assert_eq!(out.prediction.dims(), &[2, 3, 3, 2]);
        assert_eq!(out.aux[0].dims(), &[2, 4, 6]);
    }

    #[test]
    fn missing_inputs_are_reported() {
        let (_vm, model) = build(CircleMode::Social);
        assert!(model.forward(&[obs(1)], false).is_err());
    }
}
