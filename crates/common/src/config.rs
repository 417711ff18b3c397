//! Model configuration and input-type vocabulary.
//!
//! Serialised as JSON next to trained weights. Every field has a default so
//! a minimal `{}` JSON produces a working (if small) EV model over ETH-UCY
//! style 8→12 frame samples.

use serde::{Deserialize, Serialize};

// ── Input types ─────────────────────────────────────────────────────────────

/// Tensor kinds a model can request from an [`AgentManager`](crate::AgentManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputType {
    /// Observed trajectory `(batch, obs, dim)`.
    Obs,
    /// Neighbours' observed trajectories `(batch, max_agents, obs, dim)`.
    Neighbor,
    /// Segmentation map `(batch, h, w)`.
    Map,
    /// Map parameters `(batch, 4)`: `[W0, W1, b0, b1]`; cell = `W · real + b`.
    MapPara,
    /// Destination (last ground-truth point) `(batch, 1, dim)`.
    Dest,
    /// Ground-truth future `(batch, pred, dim)`.
    Gt,
}

impl InputType {
    /// Resolve a model-input keyword. Order of checks matters: `map_para`
    /// must resolve to [`InputType::MapPara`] before the `map` rule fires.
    pub fn from_keyword(word: &str) -> Option<Self> {
        let w = word.to_ascii_lowercase();
        if w.contains("traj") || w.contains("obs") {
            Some(Self::Obs)
        } else if w.contains("nei") {
            Some(Self::Neighbor)
        } else if w.contains("para") {
            Some(Self::MapPara)
        } else if w.contains("context") || w.contains("map") {
            Some(Self::Map)
        } else if w.contains("des") || w.contains("inten") {
            Some(Self::Dest)
        } else if w.contains("gt") || w.contains("pred") {
            Some(Self::Gt)
        } else {
            None
        }
    }

    /// Resolve a label keyword (only trajectories and destinations are labels).
    pub fn label_from_keyword(word: &str) -> Option<Self> {
        let w = word.to_ascii_lowercase();
        if w.contains("traj") || w.contains("gt") || w.contains("pred") {
            Some(Self::Gt)
        } else if w.contains("des") || w.contains("inten") {
            Some(Self::Dest)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Obs => "TRAJ",
            Self::Neighbor => "NEI",
            Self::Map => "MAP",
            Self::MapPara => "MAPPARA",
            Self::Dest => "DEST",
            Self::Gt => "GT",
        }
    }
}

/// Parse a list of keywords, skipping (and logging) unknown ones.
pub fn parse_input_types(words: &[&str]) -> Vec<InputType> {
    words
        .iter()
        .filter_map(|w| {
            let t = InputType::from_keyword(w);
            if t.is_none() {
                tracing::warn!(keyword = %w, "unknown input keyword ignored");
            }
            t
        })
        .collect()
}

// ── Transform / preprocess switches ─────────────────────────────────────────

/// Transform applied along the time axis before encoding / after decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    None,
    #[default]
    Fft,
}

impl TransformKind {
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "fft" => Ok(Self::Fft),
            other => anyhow::bail!("unsupported transform type `{other}` (use none|fft)"),
        }
    }
}

/// Move / scale / rotate preprocessing flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Preprocess {
    pub moving: bool,
    pub scale: bool,
    pub rotate: bool,
}

impl Preprocess {
    /// Parse a `"111"`-style flag string (move, scale, rotate). Missing
    /// trailing digits count as off.
    pub fn parse(flags: &str) -> Self {
        let bit = |i: usize| flags.as_bytes().get(i) == Some(&b'1');
        Self {
            moving: bit(0),
            scale: bit(1),
            rotate: bit(2),
        }
    }
}

// ── Model config ────────────────────────────────────────────────────────────

/// Hyper-parameters shared by the agent models, the handler and the data
/// pipeline. Backwards-compatible: missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    // ── Sample geometry ─────────────────────────────────────────────────────
    /// Number of observed frames.
    pub obs_frames: usize,
    /// Number of predicted frames.
    pub pred_frames: usize,
    /// Coordinate dimension (2 for `coordinate` annotations).
    pub dim: usize,
    /// Sliding-window stride (in annotated frames) when sampling agents.
    pub step: usize,
    /// Maximum number of neighbours stored per agent.
    pub max_agents: usize,
    /// Indices of predicted frames the agent model forecasts, `"3_7_11"`.
    /// Empty string means every prediction frame.
    pub key_points: String,

    // ── Network sizes ───────────────────────────────────────────────────────
    /// Feature dimension `d`. Must be divisible by 4.
    pub feature_dim: usize,
    /// Noise vector depth `d_id`.
    pub depth: usize,
    /// Style channels per noise sample.
    #[serde(rename = "Kc")]
    pub kc: usize,
    /// Noise repeats at test time.
    #[serde(rename = "K")]
    pub k: usize,
    /// Noise repeats during training.
    #[serde(rename = "K_train")]
    pub k_train: usize,
    /// Time-axis transform for trajectories.
    #[serde(rename = "T")]
    pub transform: TransformKind,
    /// Time-axis transform for the circle encodings.
    #[serde(rename = "Ts")]
    pub circle_transform: TransformKind,
    /// Move / scale / rotate flags, e.g. `"100"`.
    pub preprocess: String,
    pub transformer_layers: usize,
    pub transformer_heads: usize,
    pub transformer_dff: usize,
    pub layer_norm_eps: f64,

    // ── SocialCircle ────────────────────────────────────────────────────────
    pub partitions: usize,
    pub use_velocity: bool,
    pub use_distance: bool,
    pub use_direction: bool,
    /// Neighbour speed divided by the target's own speed.
    pub rel_speed: bool,
    pub use_move_direction: bool,

    // ── PhysicalCircle ──────────────────────────────────────────────────────
    /// Vision radius, in multiples of the target's observed travel length.
    pub vision_radius: f32,
    /// Replace segmentation maps with zeros (ablation switch).
    pub use_empty_seg_maps: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            obs_frames: 8,
            pred_frames: 12,
            dim: 2,
            step: 1,
            max_agents: 50,
            key_points: String::new(),
            feature_dim: 128,
            depth: 16,
            kc: 20,
            k: 1,
            k_train: 1,
            transform: TransformKind::Fft,
            circle_transform: TransformKind::None,
            preprocess: "100".to_string(),
            transformer_layers: 4,
            transformer_heads: 8,
            transformer_dff: 512,
            layer_norm_eps: 1e-6,
            partitions: 8,
            use_velocity: true,
            use_distance: true,
            use_direction: true,
            rel_speed: false,
            use_move_direction: false,
            vision_radius: 2.0,
            use_empty_seg_maps: false,
        }
    }
}

impl ModelConfig {
    /// Predicted-frame indices forecast by the agent model.
    pub fn key_points(&self) -> anyhow::Result<Vec<usize>> {
        if self.key_points.trim().is_empty() {
            return Ok((0..self.pred_frames).collect());
        }
        let mut out = Vec::new();
        for part in self.key_points.split('_') {
            let idx: usize = part
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("bad key point `{part}`: {e}"))?;
            if idx >= self.pred_frames {
                anyhow::bail!(
                    "key point {idx} out of range for pred_frames={}",
                    self.pred_frames
                );
            }
            out.push(idx);
        }
        Ok(out)
    }

    pub fn preprocess_flags(&self) -> Preprocess {
        Preprocess::parse(&self.preprocess)
    }

    /// Number of SocialCircle factors per partition.
    pub fn social_circle_dim(&self) -> usize {
        [
            self.use_velocity,
            self.use_distance,
            self.use_direction,
            self.use_move_direction,
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }

    /// Check internal consistency before building a model.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.feature_dim == 0 || self.feature_dim % 4 != 0 {
            anyhow::bail!("feature_dim ({}) must be a positive multiple of 4", self.feature_dim);
        }
        if self.transformer_heads == 0 {
            anyhow::bail!("transformer_heads must be at least 1");
        }
        if self.feature_dim % self.transformer_heads != 0 {
            anyhow::bail!(
                "feature_dim ({}) must be divisible by transformer_heads ({})",
                self.feature_dim,
                self.transformer_heads
            );
        }
        if self.partitions == 0 || self.partitions > self.obs_frames {
            anyhow::bail!(
                "partitions ({}) must be in 1..={} (obs_frames)",
                self.partitions,
                self.obs_frames
            );
        }
        if self.social_circle_dim() == 0 {
            anyhow::bail!("SocialCircle needs at least one factor enabled");
        }
        self.key_points()?;
        Ok(())
    }

    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_keywords_resolve_like_the_model_declarations() {
        assert_eq!(InputType::from_keyword("obs"), Some(InputType::Obs));
        assert_eq!(InputType::from_keyword("trajectory"), Some(InputType::Obs));
        assert_eq!(InputType::from_keyword("nei"), Some(InputType::Neighbor));
        assert_eq!(InputType::from_keyword("map_para"), Some(InputType::MapPara));
        assert_eq!(InputType::from_keyword("map"), Some(InputType::Map));
        assert_eq!(InputType::from_keyword("context"), Some(InputType::Map));
        assert_eq!(InputType::from_keyword("destination"), Some(InputType::Dest));
        assert_eq!(InputType::from_keyword("gt"), Some(InputType::Gt));
        assert_eq!(InputType::from_keyword("unknown"), None);

        assert_eq!(InputType::label_from_keyword("pred"), Some(InputType::Gt));
        assert_eq!(InputType::label_from_keyword("inten"), Some(InputType::Dest));
        assert_eq!(InputType::label_from_keyword("map"), None);
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let loaded: ModelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded.obs_frames, 8);
        assert_eq!(loaded.pred_frames, 12);
        assert_eq!(loaded.kc, 20);
        assert_eq!(loaded.transform, TransformKind::Fft);
    }

    #[test]
    fn renamed_fields_round_trip() {
        let json = r#"{"Kc": 5, "K": 3, "K_train": 2, "T": "none", "partitions": 4}"#;
        let loaded: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!((loaded.kc, loaded.k, loaded.k_train), (5, 3, 2));
        assert_eq!(loaded.transform, TransformKind::None);
        let back = serde_json::to_string(&loaded).unwrap();
        assert!(back.contains("\"K_train\":2"));
    }

    #[test]
    fn key_points_default_and_explicit() {
        let mut c = ModelConfig::default();
        assert_eq!(c.key_points().unwrap(), (0..12).collect::<Vec<_>>());
        c.key_points = "3_7_11".into();
        assert_eq!(c.key_points().unwrap(), vec![3, 7, 11]);
        c.key_points = "3_12".into();
        assert!(c.key_points().is_err());
    }

    #[test]
    fn preprocess_flags() {
        let p = Preprocess::parse("101");
        assert!(p.moving && !p.scale && p.rotate);
        assert_eq!(Preprocess::parse(""), Preprocess::default());
    }

    #[test]
    fn validate_rejects_bad_partitions() {
        let c = ModelConfig {
            partitions: 9,
            ..Default::default()
        };
        assert!(c.validate().is_err());
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let heads: ModelConfig = serde_json::from_str(r#"{"transformer_heads": 0}"#).unwrap();
        let err = heads.validate().unwrap_err();
        assert!(err.to_string().contains("transformer_heads"));

        let dim: ModelConfig = serde_json::from_str(r#"{"feature_dim": 0}"#).unwrap();
        assert!(dim.validate().is_err());
    }
}
