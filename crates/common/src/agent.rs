//! Annotations, agent sampling and the on-disk agent cache.
//!
//! A clip's processed annotation file holds `frame,id,x,y` records. Agents
//! are sliding windows of `obs_frames + pred_frames` consecutive annotated
//! frames of one id, together with every other id seen during the observed
//! frames (the neighbours).
//!
//! Sampling is done once per clip; the result is cached next to the
//! annotation file as safetensors and reloaded on the next run.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, IndexOp, Tensor};
use serde::Deserialize;

use crate::config::ModelConfig;
use crate::registry::ClipInfo;

/// Fill value for neighbour positions that do not exist.
pub const INIT_POSITION: f32 = 1e8;

/// Positions with any coordinate above this magnitude are padding.
pub const PADDING_THRESHOLD: f32 = INIT_POSITION / 10.0;

// ── Annotations ─────────────────────────────────────────────────────────────

/// One `frame,id,x,y` record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Annotation {
    pub frame: u32,
    pub id: u32,
    pub pos: [f32; 2],
}

/// Row layout of a processed annotation file.
#[derive(Debug, Deserialize)]
struct AnnotationRecord {
    frame: u32,
    id: u32,
    x: f32,
    y: f32,
}

/// Read a processed annotation file. Blank lines are skipped; frame and id
/// must be non-negative integers.
pub fn read_annotations(path: &Path) -> anyhow::Result<Vec<Annotation>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;
    reader
        .deserialize::<AnnotationRecord>()
        .map(|row| {
            let row = row.with_context(|| format!("parse {}", path.display()))?;
            Ok(Annotation {
                frame: row.frame,
                id: row.id,
                pos: [row.x, row.y],
            })
        })
        .collect()
}

// ── Agent ───────────────────────────────────────────────────────────────────

/// One training / test sample. Immutable once built or loaded.
#[derive(Debug, Clone)]
pub struct Agent {
    pub clip: String,
    pub id: u32,
    /// Frame indices of the observed + predicted window.
    pub frames: Vec<u32>,
    /// `(obs_frames, dim)`.
    pub obs: Tensor,
    /// `(pred_frames, dim)`.
    pub gt: Tensor,
    /// `(max_agents, obs_frames, dim)`, padded with [`INIT_POSITION`].
    pub neighbors: Tensor,
    /// Segmentation map `(h, w)` of the clip, when loaded.
    pub seg_map: Option<Tensor>,
    /// Map parameters `(4,)` of the clip, when loaded.
    pub map_paras: Option<Tensor>,
}

impl Agent {
    /// Frame index of the last observed step.
    pub fn last_obs_frame(&self, obs_frames: usize) -> u32 {
        self.frames[obs_frames.min(self.frames.len()) - 1]
    }

    /// Attach the clip's segmentation map and parameters.
    pub fn with_map(mut self, seg_map: Tensor, map_paras: Tensor) -> Self {
        self.seg_map = Some(seg_map);
        self.map_paras = Some(map_paras);
        self
    }
}

// ── Sampling ────────────────────────────────────────────────────────────────

/// Sample agents from a clip's annotations.
pub fn sample_agents(
    clip: &ClipInfo,
    records: &[Annotation],
    config: &ModelConfig,
) -> anyhow::Result<Vec<Agent>> {
    if clip.dimension != 2 || config.dim != 2 {
        anyhow::bail!(
            "clip `{}`: only 2D coordinate annotations are supported (clip dim {}, model dim {})",
            clip.name,
            clip.dimension,
            config.dim
        );
    }
    let frame_step = clip.paras[0].max(1) as u32;
    let total = config.obs_frames + config.pred_frames;
    let stride = config.step.max(1);

    // id → (frame → pos), frame → [(id, pos)]
    let mut tracks: BTreeMap<u32, BTreeMap<u32, [f32; 2]>> = BTreeMap::new();
    let mut by_frame: HashMap<u32, Vec<(u32, [f32; 2])>> = HashMap::new();
    for r in records {
        tracks.entry(r.id).or_default().insert(r.frame, r.pos);
        by_frame.entry(r.frame).or_default().push((r.id, r.pos));
    }

    let device = Device::Cpu;
    let mut agents = Vec::new();
    for (&id, track) in &tracks {
        let frames: Vec<u32> = track.keys().copied().collect();
        if frames.len() < total {
            continue;
        }
        let mut start = 0usize;
        while start + total <= frames.len() {
            let window = &frames[start..start + total];
            let contiguous = window
                .windows(2)
                .all(|w| w[1] == w[0] + frame_step);
            if !contiguous {
                start += 1;
                continue;
            }

            let points: Vec<f32> = window.iter().flat_map(|f| track[f]).collect();
            let obs_points = points[..config.obs_frames * 2].to_vec();
            let gt_points = points[config.obs_frames * 2..].to_vec();

            let obs_window = &window[..config.obs_frames];
            let neighbors = neighbor_positions(id, obs_window, &by_frame, config.max_agents);

            agents.push(Agent {
                clip: clip.name.clone(),
                id,
                frames: window.to_vec(),
                obs: Tensor::from_vec(obs_points, (config.obs_frames, 2), &device)?,
                gt: Tensor::from_vec(gt_points, (config.pred_frames, 2), &device)?,
                neighbors: Tensor::from_vec(
                    neighbors,
                    (config.max_agents, config.obs_frames, 2),
                    &device,
                )?,
                seg_map: None,
                map_paras: None,
            });
            start += stride;
        }
    }
    Ok(agents)
}

/// Flattened `(max_agents, obs, 2)` neighbour positions around `target`.
fn neighbor_positions(
    target: u32,
    obs_window: &[u32],
    by_frame: &HashMap<u32, Vec<(u32, [f32; 2])>>,
    max_agents: usize,
) -> Vec<f32> {
    let mut tracks: BTreeMap<u32, Vec<[f32; 2]>> = BTreeMap::new();
    for (t, frame) in obs_window.iter().enumerate() {
        let Some(present) = by_frame.get(frame) else {
            continue;
        };
        for &(id, pos) in present {
            if id == target {
                continue;
            }
            let track = tracks
                .entry(id)
                .or_insert_with(|| vec![[INIT_POSITION; 2]; obs_window.len()]);
            track[t] = pos;
        }
    }

    let mut out = vec![INIT_POSITION; max_agents * obs_window.len() * 2];
    for (slot, track) in tracks.values().take(max_agents).enumerate() {
        for (t, pos) in track.iter().enumerate() {
            let base = (slot * obs_window.len() + t) * 2;
            out[base] = pos[0];
            out[base + 1] = pos[1];
        }
    }
    out
}

// ── Cache ───────────────────────────────────────────────────────────────────

/// Cache file for a clip under the current sampling settings.
pub fn cache_path(clip: &ClipInfo, config: &ModelConfig) -> PathBuf {
    let dir = clip
        .annpath
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    dir.join(format!(
        "agent_{}to{}_s{}_n{}.safetensors",
        config.obs_frames, config.pred_frames, config.step, config.max_agents
    ))
}

/// Save sampled agents as one safetensors file.
pub fn save_agents(path: &Path, agents: &[Agent]) -> anyhow::Result<()> {
    if agents.is_empty() {
        anyhow::bail!("refusing to cache an empty agent list at {}", path.display());
    }
    let stack = |f: &dyn Fn(&Agent) -> Tensor| -> candle_core::Result<Tensor> {
        let ts: Vec<Tensor> = agents.iter().map(f).collect();
        Tensor::stack(&ts, 0)
    };
    let n = agents.len();
    let window = agents[0].frames.len();
    let frames: Vec<u32> = agents.iter().flat_map(|a| a.frames.iter().copied()).collect();
    let ids: Vec<u32> = agents.iter().map(|a| a.id).collect();

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("obs".into(), stack(&|a: &Agent| a.obs.clone())?);
    tensors.insert("gt".into(), stack(&|a: &Agent| a.gt.clone())?);
    tensors.insert("nei".into(), stack(&|a: &Agent| a.neighbors.clone())?);
    tensors.insert(
        "frames".into(),
        Tensor::from_vec(frames, (n, window), &Device::Cpu)?,
    );
    tensors.insert("ids".into(), Tensor::from_vec(ids, n, &Device::Cpu)?);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("save agents to {}", path.display()))?;
    Ok(())
}

/// Load agents written by [`save_agents`].
pub fn load_agents(path: &Path, clip_name: &str) -> anyhow::Result<Vec<Agent>> {
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("load agents from {}", path.display()))?;
    let mut take = |name: &str| {
        tensors
            .remove(name)
            .ok_or_else(|| anyhow::anyhow!("{}: missing tensor `{name}`", path.display()))
    };
    let obs = take("obs")?;
    let gt = take("gt")?;
    let nei = take("nei")?;
    let frames = take("frames")?.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    let ids = take("ids")?.to_dtype(DType::U32)?.to_vec1::<u32>()?;

    let mut agents = Vec::with_capacity(ids.len());
    for (i, (id, frames)) in ids.into_iter().zip(frames).enumerate() {
        agents.push(Agent {
            clip: clip_name.to_string(),
            id,
            frames,
            obs: obs.i(i)?,
            gt: gt.i(i)?,
            neighbors: nei.i(i)?,
            seg_map: None,
            map_paras: None,
        });
    }
    Ok(agents)
}

/// Load the clip's agents from cache, or sample and cache them.
pub fn load_or_sample(clip: &ClipInfo, config: &ModelConfig) -> anyhow::Result<Vec<Agent>> {
    let path = cache_path(clip, config);
    if path.exists() {
        tracing::debug!(clip = %clip.name, path = %path.display(), "loading cached agents");
        return load_agents(&path, &clip.name);
    }
    let records = read_annotations(&clip.annpath)?;
    let agents = sample_agents(clip, &records, config)?;
    if agents.is_empty() {
        tracing::warn!(clip = %clip.name, "no agents sampled; nothing cached");
        return Ok(agents);
    }
    save_agents(&path, &agents)?;
    tracing::info!(clip = %clip.name, agents = agents.len(), path = %path.display(), "agents cached");
    Ok(agents)
}

// ── Tests ───────────────────────────────────────────────────────────────────
