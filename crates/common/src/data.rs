//! Data pipeline: agent collections, tensor datasets, batching.
//!
//! * **[`AgentManager`]** — ordered agents of one or more clips plus the
//!   input/label types a model asked for; stacks them into tensors.
//! * **[`TensorDataset`]** — aligned tensors sharing a leading dimension;
//!   yields `(inputs…, label)` batches, optionally shuffled.
//! * **[`DatasetManager`]** — resolves clips through the [`Registry`] and
//!   loads (or samples and caches) their agents.

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::agent::{load_or_sample, Agent};
use crate::config::{InputType, ModelConfig};
use crate::maps::{load_or_make_map, pad_maps};
use crate::registry::{DatasetSplit, Registry};

// ── AgentManager ────────────────────────────────────────────────────────────

/// Ordered collection of agents and the tensor types assembled from them.
#[derive(Debug, Clone, Default)]
pub struct AgentManager {
    agents: Vec<Agent>,
    input_types: Vec<InputType>,
    label_types: Vec<InputType>,
}

impl AgentManager {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self {
            agents,
            ..Default::default()
        }
    }

    pub fn set_types(&mut self, input_types: &[InputType], label_types: &[InputType]) {
        self.input_types = input_types.to_vec();
        self.label_types = label_types.to_vec();
    }

    pub fn input_types(&self) -> &[InputType] {
        &self.input_types
    }

    pub fn label_types(&self) -> &[InputType] {
        &self.label_types
    }

    pub fn append(&mut self, other: AgentManager) {
        self.agents.extend(other.agents);
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Stack one tensor of type `kind` over all agents (on CPU).
    pub fn inputs_by_type(&self, kind: InputType) -> anyhow::Result<Tensor> {
        if self.agents.is_empty() {
            anyhow::bail!("no agents to build `{}` inputs from", kind.name());
        }
        let mut per_agent: Vec<Tensor> = self
            .agents
            .iter()
            .map(|a| agent_tensor(a, kind))
            .collect::<anyhow::Result<_>>()?;
        if kind == InputType::Map {
            // clips may carry maps of different sizes
            per_agent = pad_maps(&per_agent)?;
        }
        Ok(Tensor::stack(&per_agent, 0)?)
    }

    /// Build `(inputs…, label)` with the first label type as the label.
    pub fn to_tensor_dataset(&self) -> anyhow::Result<TensorDataset> {
        let label = self
            .label_types
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no label type set"))?;
        let mut tensors = Vec::with_capacity(self.input_types.len() + 1);
        for kind in &self.input_types {
            tensors.push(self.inputs_by_type(*kind)?);
        }
        tensors.push(self.inputs_by_type(label)?);
        TensorDataset::new(tensors)
    }
}

fn agent_tensor(agent: &Agent, kind: InputType) -> anyhow::Result<Tensor> {
    let missing = || {
        anyhow::anyhow!(
            "agent {} of clip `{}` has no {} input (segmentation map not loaded)",
            agent.id,
            agent.clip,
            kind.name()
        )
    };
    Ok(match kind {
        InputType::Obs => agent.obs.clone(),
        InputType::Neighbor => agent.neighbors.clone(),
        InputType::Gt => agent.gt.clone(),
        InputType::Dest => {
            let t = agent.gt.dim(0)?;
            agent.gt.narrow(0, t - 1, 1)?
        }
        InputType::Map => agent.seg_map.clone().ok_or_else(missing)?,
        InputType::MapPara => agent.map_paras.clone().ok_or_else(missing)?,
    })
}

// ── TensorDataset ───────────────────────────────────────────────────────────

/// Aligned tensors sharing their first dimension.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    tensors: Vec<Tensor>,
    len: usize,
}

impl TensorDataset {
    pub fn new(tensors: Vec<Tensor>) -> anyhow::Result<Self> {
        let len = match tensors.first() {
            Some(t) => t.dim(0)?,
            None => anyhow::bail!("tensor dataset needs at least one tensor"),
        };
        for t in &tensors {
            if t.dim(0)? != len {
                anyhow::bail!(
                    "tensor dataset: leading dims differ ({} vs {})",
                    t.dim(0)?,
                    len
                );
            }
        }
        Ok(Self { tensors, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// Number of batches `batches(batch_size, _)` yields.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len.div_ceil(batch_size.max(1))
    }

    /// Yield batches of at most `batch_size` rows; the last batch may be
    /// smaller. With `shuffle`, rows are drawn in a fresh random order.
    pub fn batches(
        &self,
        batch_size: usize,
        shuffle: bool,
    ) -> impl Iterator<Item = candle_core::Result<Vec<Tensor>>> + '_ {
        let batch_size = batch_size.max(1);
        let order: Option<Vec<u32>> = shuffle.then(|| {
            let mut idx: Vec<u32> = (0..self.len as u32).collect();
            idx.shuffle(&mut rand::thread_rng());
            idx
        });
        let mut start = 0usize;
        std::iter::from_fn(move || {
            if start >= self.len {
                return None;
            }
            let n = batch_size.min(self.len - start);
            let batch = match &order {
                Some(order) => {
                    let ids = Tensor::from_slice(&order[start..start + n], n, &Device::Cpu);
                    ids.and_then(|ids| {
                        self.tensors
                            .iter()
                            .map(|t| t.index_select(&ids.to_device(t.device())?, 0))
                            .collect()
                    })
                }
                None => self.tensors.iter().map(|t| t.narrow(0, start, n)).collect(),
            };
            start += n;
            Some(batch)
        })
    }
}

// ── DatasetManager ──────────────────────────────────────────────────────────

/// Whether clips are loaded for training (clip order shuffled) or testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Train,
    Test,
}

/// Loads agents of a dataset split's clips.
pub struct DatasetManager<'a> {
    registry: &'a Registry,
    config: &'a ModelConfig,
    split: DatasetSplit,
    input_types: Vec<InputType>,
    label_types: Vec<InputType>,
}

impl<'a> DatasetManager<'a> {
    pub fn new(
        registry: &'a Registry,
        config: &'a ModelConfig,
        dataset: &str,
        split: &str,
    ) -> anyhow::Result<Self> {
        let split = registry.load_split(dataset, split)?;
        Ok(Self {
            registry,
            config,
            split,
            input_types: vec![InputType::Obs],
            label_types: vec![InputType::Gt],
        })
    }

    pub fn split(&self) -> &DatasetSplit {
        &self.split
    }

    pub fn set_types(&mut self, input_types: &[InputType], label_types: &[InputType]) {
        self.input_types = input_types.to_vec();
        self.label_types = label_types.to_vec();
    }

    fn needs_maps(&self) -> bool {
        self.input_types
            .iter()
            .any(|t| matches!(t, InputType::Map | InputType::MapPara))
    }

    /// Load agents of the given clips. Clips are prepared in parallel.
    pub fn load(&self, clips: &[String], mode: LoadMode) -> anyhow::Result<AgentManager> {
        let mut clips = clips.to_vec();
        if mode == LoadMode::Train {
            clips.shuffle(&mut rand::thread_rng());
        }
        let needs_maps = self.needs_maps();
        let dataset = self.split.dataset.clone();

        let per_clip: Vec<Vec<Agent>> = clips
            .par_iter()
            .map(|name| -> anyhow::Result<Vec<Agent>> {
                let info = self.registry.load_clip(&dataset, name)?;
                let agents = load_or_sample(&info, self.config)?;
                if !needs_maps {
                    return Ok(agents);
                }
                let (map, paras) = load_or_make_map(&info)?;
                Ok(agents
                    .into_iter()
                    .map(|a| a.with_map(map.clone(), paras.clone()))
                    .collect())
            })
            .collect::<anyhow::Result<_>>()?;

        let mut manager = AgentManager::default();
        for (name, agents) in clips.iter().zip(per_clip) {
            tracing::info!(clip = %name, agents = agents.len(), ?mode, "clip loaded");
            manager.append(AgentManager::new(agents));
        }
        manager.set_types(&self.input_types, &self.label_types);
        Ok(manager)
    }

    /// Train agents and validation agents of the split.
    pub fn load_auto(&self) -> anyhow::Result<(AgentManager, AgentManager)> {
        let train = self.load(&self.split.train, LoadMode::Train)?;
        let val_clips = if self.split.val.is_empty() {
            &self.split.test
        } else {
            &self.split.val
        };
        let val = self.load(val_clips, LoadMode::Test)?;
        Ok((train, val))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_agent(id: u32, offset: f32) -> Agent {
        let dev = Device::Cpu;
        Agent {
            clip: "toy".into(),
            id,
            frames: vec![0, 10, 20, 30],
            obs: Tensor::new(&[[offset, 0.0f32], [offset + 1.0, 0.0]], &dev).unwrap(),
            gt: Tensor::new(&[[offset + 2.0, 0.0f32], [offset + 3.0, 0.0]], &dev).unwrap(),
            neighbors: Tensor::zeros((1, 2, 2), candle_core::DType::F32, &dev).unwrap(),
            seg_map: None,
            map_paras: None,
        }
    }

    #[test]
    fn tensors_by_type_and_dataset() {
        let mut m = AgentManager::new((0..5).map(|i| toy_agent(i, i as f32)).collect());
        m.set_types(&[InputType::Obs, InputType::Neighbor], &[InputType::Gt]);
        let ds = m.to_tensor_dataset().unwrap();
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.tensors().len(), 3);
        assert_eq!(ds.tensors()[1].dims(), &[5, 1, 2, 2]);

        let dest = m.inputs_by_type(InputType::Dest).unwrap();
        assert_eq!(dest.dims(), &[5, 1, 2]);
        assert_eq!(dest.to_vec3::<f32>().unwrap()[4][0], vec![7.0, 0.0]);
    }

    #[test]
    fn missing_map_is_an_error() {
        let m = AgentManager::new(vec![toy_agent(0, 0.0)]);
        assert!(m.inputs_by_type(InputType::Map).is_err());
    }

    fn write_clip(reg: &Registry, root: &std::path::Path, name: &str, frames: u32, segmap: Option<std::path::PathBuf>) {
        let annpath = root.join(name).join("ann.csv");
        std::fs::create_dir_all(annpath.parent().unwrap()).unwrap();
        let lines: String = (0..frames).map(|k| format!("{},1,{}.0,0.0\n", k * 10, k)).collect();
        std::fs::write(&annpath, lines).unwrap();
        let info = crate::registry::ClipInfo {
            name: name.into(),
            annpath,
            order: [0, 1],
            paras: [10, 25],
            video_path: None,
            scale: 1.0,
            scale_vis: 1.0,
            dimension: 2,
            anntype: "coordinate".into(),
            matrix: vec![],
            segmap,
        };
        reg.save_clip("toy", &info).unwrap();
    }

    #[test]
    fn registry_clips_load_with_maps() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path().join("configs"));
        let data = dir.path().join("data");

        let scene = data.join("scene.safetensors");
        let map = Tensor::zeros((4, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        let paras = Tensor::new(&[1.0f32, 1.0, 0.0, 0.0], &Device::Cpu).unwrap();
        crate::maps::save_seg_map(&scene, &map, &paras).unwrap();
        write_clip(&reg, &data, "a", 5, Some(scene));
        write_clip(&reg, &data, "b", 6, None);
        let split = DatasetSplit {
            dataset: "toy".into(),
            train: vec!["a".into(), "b".into()],
            test: vec!["b".into()],
            val: vec![],
            scale: 1.0,
            dimension: 2,
            anntype: "coordinate".into(),
            kind: "meter".into(),
        };
        reg.save_split("toy", &split).unwrap();

        let config = ModelConfig {
            obs_frames: 2,
            pred_frames: 2,
            max_agents: 3,
            partitions: 2,
            ..Default::default()
        };
        let mut manager = DatasetManager::new(&reg, &config, "toy", "toy").unwrap();
        let types = [InputType::Obs, InputType::Neighbor, InputType::Map, InputType::MapPara];
        manager.set_types(&types, &[InputType::Gt]);
        let (train, val) = manager.load_auto().unwrap();

        // 5 frames → 2 windows, 6 frames → 3 windows; val falls back to test
        assert_eq!(train.len(), 5);
        assert_eq!(val.len(), 3);
        assert!(val.agents().iter().all(|a| a.clip == "b"));
        assert!(data.join("b").join(crate::maps::TRAJECTORY_MAP_FILE).exists());

        let maps = train.inputs_by_type(InputType::Map).unwrap();
        let (n, h, w) = maps.dims3().unwrap();
        assert_eq!((n, h), (5, 100));
        assert!(w >= 6);
        assert_eq!(train.inputs_by_type(InputType::MapPara).unwrap().dims(), &[5, 4]);

        // the configured 4×6 map keeps its cells, padding is obstacle
        let k = train.agents().iter().position(|a| a.clip == "a").unwrap();
        let first = maps.get(k).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(first[3][5], 0.0);
        assert_eq!(first[4][0], 1.0);
        assert_eq!(first[0][6], 1.0);

        let ds = train.to_tensor_dataset().unwrap();
        assert_eq!(ds.tensors().len(), 5);
    }

    #[test]
    fn missing_configured_map_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path().join("configs"));
        let data = dir.path().join("data");
        write_clip(&reg, &data, "a", 5, Some(data.join("nowhere.safetensors")));
        let split = DatasetSplit {
            dataset: "toy".into(),
            train: vec!["a".into()],
            test: vec!["a".into()],
            val: vec![],
            scale: 1.0,
            dimension: 2,
            anntype: "coordinate".into(),
            kind: "meter".into(),
        };
        reg.save_split("toy", &split).unwrap();
        let config = ModelConfig {
            obs_frames: 2,
            pred_frames: 2,
            partitions: 2,
            ..Default::default()
        };
        let mut manager = DatasetManager::new(&reg, &config, "toy", "toy").unwrap();
        manager.set_types(&[InputType::Obs, InputType::Map], &[InputType::Gt]);
        assert!(manager.load(&split.train, LoadMode::Test).is_err());
        // without maps the same clip loads
        manager.set_types(&[InputType::Obs], &[InputType::Gt]);
        assert_eq!(manager.load(&split.train, LoadMode::Test).unwrap().len(), 2);
    }

    #[test]
    fn batches_cover_every_row_once() {
        let mut m = AgentManager::new((0..7).map(|i| toy_agent(i, i as f32 * 10.0)).collect());
        m.set_types(&[InputType::Obs], &[InputType::Gt]);
        let ds = m.to_tensor_dataset().unwrap();
        assert_eq!(ds.num_batches(3), 3);

        for shuffle in [false, true] {
            let mut seen: Vec<f32> = Vec::new();
            let mut sizes = Vec::new();
            for batch in ds.batches(3, shuffle) {
                let batch = batch.unwrap();
                sizes.push(batch[0].dim(0).unwrap());
                // inputs and labels stay aligned
                let obs = batch[0].to_vec3::<f32>().unwrap();
                let gt = batch[1].to_vec3::<f32>().unwrap();
                for (o, g) in obs.iter().zip(&gt) {
                    assert_eq!(o[0][0] + 2.0, g[0][0]);
                    seen.push(o[0][0]);
                }
            }
            assert_eq!(sizes, vec![3, 3, 1]);
            seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
            assert_eq!(seen, (0..7).map(|i| i as f32 * 10.0).collect::<Vec<_>>());
        }
    }
}
