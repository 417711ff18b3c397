//! Model interface and the agent-model registry.
//!
//! Every trajectory model consumes a list of input tensors, ordered as its
//! [`TrajModel::input_types`], and returns a [`ModelOutput`] whose first
//! element is the prediction `(batch, K, steps, dim)`.

use std::fmt;

use candle_core::{Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use traj_common::{InputType, ModelConfig};

use crate::agent::{CircleMode, EvAgentModel};

/// Prediction plus model-specific auxiliary tensors (circles, proposals…).
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub prediction: Tensor,
    pub aux: Vec<Tensor>,
}

impl ModelOutput {
    pub fn new(prediction: Tensor) -> Self {
        Self {
            prediction,
            aux: Vec::new(),
        }
    }
}

/// A trajectory predictor.
pub trait TrajModel {
    /// Registry name, e.g. `"evsc"`.
    fn name(&self) -> &str;

    /// Tensor kinds `forward` expects, in order.
    fn input_types(&self) -> &[InputType];

    /// `inputs` follow [`input_types`](Self::input_types). `training`
    /// selects `K_train` instead of `K` noise repeats.
    fn forward(&self, inputs: &[Tensor], training: bool) -> Result<ModelOutput>;
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Agent models known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Transformer agent without interaction context.
    Ev,
    /// With SocialCircle.
    Evsc,
    /// With SocialCircle and PhysicalCircle.
    Evspc,
}

impl AgentKind {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ev" => Ok(Self::Ev),
            "evsc" => Ok(Self::Evsc),
            "evspc" => Ok(Self::Evspc),
            other => anyhow::bail!("unknown model `{other}` (expected ev|evsc|evspc)"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ev => "ev",
            Self::Evsc => "evsc",
            Self::Evspc => "evspc",
        }
    }

    pub fn circle_mode(&self) -> CircleMode {
        match self {
            Self::Ev => CircleMode::None,
            Self::Evsc => CircleMode::Social,
            Self::Evspc => CircleMode::SocialPhysical,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Build the agent model registered under `kind`.
pub fn build_agent_model(
    kind: AgentKind,
    config: &ModelConfig,
    vb: VarBuilder,
) -> anyhow::Result<Box<dyn TrajModel>> {
    config.validate()?;
    let model = EvAgentModel::new(config, kind.circle_mode(), vb)?;
    Ok(Box::new(model))
}

/// Total number of trainable scalars in `varmap`.
pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn kinds_roundtrip_names() {
        for kind in [AgentKind::Ev, AgentKind::Evsc, AgentKind::Evspc] {
            assert_eq!(AgentKind::from_str(kind.name()).unwrap(), kind);
        }
        assert_eq!(AgentKind::from_str("EVSC").unwrap(), AgentKind::Evsc);
        assert!(AgentKind::from_str("vanilla").is_err());
    }

    #[test]
    fn registry_builds_models_with_parameters() {
        let config = ModelConfig {
            feature_dim: 16,
            transformer_heads: 2,
            transformer_layers: 1,
            transformer_dff: 16,
            kc: 2,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = build_agent_model(AgentKind::Evsc, &config, vb).unwrap();
        assert_eq!(model.name(), "evsc");
        assert_eq!(model.input_types(), &[InputType::Obs, InputType::Neighbor]);
        assert!(count_parameters(&varmap) > 0);
    }
}
