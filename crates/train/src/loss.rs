//! Losses and metrics on predicted trajectories.
//!
//! Predictions are `(batch, K, steps, dim)` (or `(batch, steps, dim)`,
//! treated as `K = 1`); ground truth is `(batch, pred_frames, dim)`.
//!
//! | Name | Value |
//! |------|-------|
//! | `ADE` | mean over steps of the L2 error, min over K, mean over batch |
//! | `FDE` | `ADE` on the final step only |
//! | `Diff` | mean of `ADE` on the 0th … n-th order differences |
//! | `l2` | `ADE` restricted to the key-point frames |
//! | `AvgKey` | same as `l2`, reported as a metric |

use std::collections::BTreeMap;

use candle_core::{Result, Tensor, D};

/// One loss / metric term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    Ade,
    Fde,
    /// Difference loss up to the given order.
    Diff(usize),
    KeyL2,
    AvgKey,
}

impl LossKind {
    pub fn name(&self) -> String {
        match self {
            Self::Ade => "ADE".into(),
            Self::Fde => "FDE".into(),
            Self::Diff(order) => format!("Diff{order}"),
            Self::KeyL2 => "l2".into(),
            Self::AvgKey => "AvgKey".into(),
        }
    }

    /// Parse `ade`, `fde`, `diff` / `diff3`, `l2`, `avgkey`.
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.to_ascii_lowercase();
        Ok(match s.as_str() {
            "ade" => Self::Ade,
            "fde" => Self::Fde,
            "l2" => Self::KeyL2,
            "avgkey" => Self::AvgKey,
            "diff" => Self::Diff(2),
            _ => match s.strip_prefix("diff").map(str::parse::<usize>) {
                Some(Ok(order)) => Self::Diff(order),
                _ => anyhow::bail!("unknown loss `{s}`"),
            },
        })
    }

    /// Evaluate on one batch. `keys` are the key-point frame indices.
    pub fn compute(&self, pred: &Tensor, gt: &Tensor, keys: &[usize]) -> Result<Tensor> {
        match self {
            Self::Ade => ade(pred, gt),
            Self::Fde => fde(pred, gt),
            Self::Diff(order) => diff(pred, gt, *order),
            Self::KeyL2 | Self::AvgKey => {
                let (pred, gt) = restrict_to_keys(pred, gt, keys)?;
                ade(&pred, &gt)
            }
        }
    }
}

/// Lift `(b, T, d)` predictions to `(b, 1, T, d)`.
fn with_k_axis(pred: &Tensor) -> Result<Tensor> {
    if pred.rank() == 3 {
        pred.unsqueeze(1)
    } else {
        Ok(pred.clone())
    }
}

/// `ADE` (K = 1) or `minADE`.
pub fn ade(pred: &Tensor, gt: &Tensor) -> Result<Tensor> {
    let pred = with_k_axis(pred)?;
    let err = pred.broadcast_sub(&gt.unsqueeze(1)?)?;
    let dist = (err.sqr()?.sum(D::Minus1)? + 1e-12)?.sqrt()?;
    // (b, K, T) → (b, K) → (b,)
    let per_k = dist.mean(D::Minus1)?;
    per_k.min(D::Minus1)?.mean_all()
}

/// `FDE` (K = 1) or `minFDE`.
pub fn fde(pred: &Tensor, gt: &Tensor) -> Result<Tensor> {
    let pred = with_k_axis(pred)?;
    let t = pred.dim(2)?;
    let tg = gt.dim(1)?;
    ade(&pred.narrow(2, t - 1, 1)?, &gt.narrow(1, tg - 1, 1)?)
}

/// Mean of `ADE` over the 0th … `order`-th backward differences.
pub fn diff(pred: &Tensor, gt: &Tensor, order: usize) -> Result<Tensor> {
    let mut p = with_k_axis(pred)?;
    let mut g = gt.clone();
    let mut total = ade(&p, &g)?;
    for _ in 0..order {
        let tp = p.dim(2)?;
        let tg = g.dim(1)?;
        if tp < 2 || tg < 2 {
            break;
        }
        p = (p.narrow(2, 1, tp - 1)? - p.narrow(2, 0, tp - 1)?)?;
        g = (g.narrow(1, 1, tg - 1)? - g.narrow(1, 0, tg - 1)?)?;
        total = (total + ade(&p, &g)?)?;
    }
    total.affine(1.0 / (order + 1) as f64, 0.0)
}

/// Pick key-point frames from the ground truth, and from the prediction
/// when it still spans every frame.
fn restrict_to_keys(pred: &Tensor, gt: &Tensor, keys: &[usize]) -> Result<(Tensor, Tensor)> {
    let pred = with_k_axis(pred)?;
    let frames = gt.dim(1)?;
    if keys.is_empty() || keys.len() == frames {
        return Ok((pred, gt.clone()));
    }
    let ids: Vec<u32> = keys.iter().map(|k| *k as u32).collect();
    let ids = Tensor::from_vec(ids, keys.len(), gt.device())?;
    let gt = gt.index_select(&ids, 1)?;
    let pred = if pred.dim(2)? == frames {
        pred.index_select(&ids, 2)?
    } else {
        pred
    };
    Ok((pred, gt))
}

// ── LossSet ─────────────────────────────────────────────────────────────────

/// Whether a [`LossSet`] is used as the training objective or as a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossMode {
    Loss,
    Metric,
}

/// Weighted list of loss terms.
#[derive(Debug, Clone)]
pub struct LossSet {
    items: Vec<(LossKind, f64)>,
    keys: Vec<usize>,
    /// Multiplies metric values (dataset scale back to metres).
    scale: f64,
}

impl LossSet {
    pub fn new(items: Vec<(LossKind, f64)>, keys: Vec<usize>) -> Self {
        Self {
            items,
            keys,
            scale: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn items(&self) -> &[(LossKind, f64)] {
        &self.items
    }

    /// Weighted sum of every term plus a name → value dictionary.
    /// In [`LossMode::Metric`] values are multiplied by the dataset scale.
    pub fn apply(
        &self,
        pred: &Tensor,
        gt: &Tensor,
        mode: LossMode,
    ) -> Result<(Tensor, BTreeMap<String, f32>)> {
        let coe = match mode {
            LossMode::Loss => 1.0,
            LossMode::Metric => self.scale,
        };
        let mut dict = BTreeMap::new();
        let mut total: Option<Tensor> = None;
        for (kind, weight) in &self.items {
            let value = kind.compute(pred, gt, &self.keys)?.affine(coe, 0.0)?;
            dict.insert(kind.name(), value.to_scalar::<f32>()?);
            let weighted = value.affine(*weight, 0.0)?;
            total = Some(match total {
                None => weighted,
                Some(prev) => (prev + weighted)?,
            });
        }
        match total {
            Some(t) => Ok((t, dict)),
            None => Err(candle_core::Error::Msg("empty loss set".into())),
        }
    }
}
