//! Structure: encapsulates the full train / validate / test loop.
//!
//! Decouples the compute graph (model forward + loss) from the bookkeeping
//! around it: the moving-average objective, validation scheduling,
//! best-checkpoint selection and result files.
//!
//! ```text
//! Idle → Training{0} → Validating{0} → Training{1} → … → Done
//!                  ╰──────────── non-finite loss ───────────→ Aborted
//! ```
//!
//! Log directory layout:
//!
//! | File | Written |
//! |------|---------|
//! | `args.json` | at training start |
//! | `metrics.csv` | one line per validation |
//! | `<model_name>_epoch<e>.safetensors` | when validation metric ≤ best |
//! | `best_metric.json` | with every saved checkpoint |
//! | `<model_name>.safetensors` | when training finishes |

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use traj_common::{AgentManager, DatasetManager, InputType, LoadMode, ModelConfig, Registry, TensorDataset};
use traj_core::{build_agent_model, count_parameters, AgentKind, TrajModel};

use crate::loss::{LossKind, LossMode, LossSet};
use crate::results::{append_report, write_predictions, TestReport};

pub const ARGS_FILE: &str = "args.json";
pub const BEST_FILE: &str = "best_metric.json";
pub const METRICS_FILE: &str = "metrics.csv";

// ── Config ──────────────────────────────────────────────────────────────────

/// Training hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    /// Validation starts once `epoch + 1 >= start_test_percent · epochs`.
    pub start_test_percent: f64,
    /// Validate every `test_step` epochs.
    pub test_step: usize,
    /// Global gradient-norm clip; `0` disables clipping.
    pub grad_clip_max_norm: f64,
    pub log_dir: PathBuf,
    pub model_name: String,
    /// Log directory whose best weights are loaded before training starts.
    pub restore: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            epochs: 500,
            lr: 1e-3,
            start_test_percent: 0.0,
            test_step: 1,
            grad_clip_max_norm: 0.0,
            log_dir: PathBuf::from("logs"),
            model_name: "model".to_string(),
            restore: None,
        }
    }
}

/// Everything needed to rebuild a structure: saved as `args.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArgs {
    /// Registered model name (`ev`, `evsc`, `evspc`).
    pub model: String,
    pub dataset: String,
    pub split: String,
    /// Root of the dataset registry.
    pub dataset_root: PathBuf,
    pub model_config: ModelConfig,
    pub trainer: TrainerConfig,
}

impl RunArgs {
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(ARGS_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(ARGS_FILE);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("no {ARGS_FILE} in `{}`", dir.display()))?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ── Loop state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    Idle,
    Training { epoch: usize },
    Validating { epoch: usize },
    Done,
    Aborted,
}

/// Which test clips `run_test` evaluates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMode {
    /// One clip: the given one, or the split's first test clip.
    One(Option<String>),
    /// Every test clip separately.
    All,
    /// All test clips together.
    Mix,
}

impl TestMode {
    pub fn from_str(mode: &str, clip: Option<String>) -> anyhow::Result<Self> {
        match mode {
            "one" => Ok(Self::One(clip)),
            "all" => Ok(Self::All),
            "mix" => Ok(Self::Mix),
            other => anyhow::bail!("unknown test mode `{other}` (expected one|all|mix)"),
        }
    }
}

/// Exponential moving average of the batch loss.
///
/// The optimised target is `0.7 · loss + 0.3 · previous`, where the previous
/// average is a constant. Starts at 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossMovingAverage {
    value: f32,
}

impl LossMovingAverage {
    pub const LOSS_WEIGHT: f32 = 0.7;

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn next_value(previous: f32, loss: f32) -> f32 {
        Self::LOSS_WEIGHT * loss + (1.0 - Self::LOSS_WEIGHT) * previous
    }

    /// Advance with a scalar loss tensor and return the new target tensor.
    pub fn update(&mut self, loss: &Tensor) -> candle_core::Result<Tensor> {
        let previous = ((1.0 - Self::LOSS_WEIGHT) * self.value) as f64;
        let target = loss.affine(Self::LOSS_WEIGHT as f64, previous)?;
        self.value = target.to_scalar::<f32>()?;
        Ok(target)
    }
}

/// Best validation metric so far and the epoch it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestCheckpoint {
    pub metric: f32,
    pub epoch: Option<usize>,
}

impl Default for BestCheckpoint {
    fn default() -> Self {
        Self {
            metric: f32::INFINITY,
            epoch: None,
        }
    }
}

impl BestCheckpoint {
    /// Record `metric` if it is finite and not worse than the best; ties
    /// keep the newer epoch. Returns whether a checkpoint should be written.
    pub fn observe(&mut self, metric: f32, epoch: usize) -> bool {
        if metric.is_finite() && metric <= self.metric {
            self.metric = metric;
            self.epoch = Some(epoch);
            true
        } else {
            false
        }
    }

    pub fn load(dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = dir.join(BEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&std::fs::read_to_string(path)?)?))
    }

    fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::write(dir.join(BEST_FILE), serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Batch-size-weighted mean of per-batch values; `None` for no samples.
pub fn weighted_average(parts: &[(f32, usize)]) -> Option<f32> {
    let total: usize = parts.iter().map(|(_, n)| n).sum();
    if total == 0 {
        return None;
    }
    let sum: f64 = parts.iter().map(|(v, n)| *v as f64 * *n as f64).sum();
    Some((sum / total as f64) as f32)
}

/// Whether epoch `epoch` (0-based, just finished) is validated: once
/// `epoch + 1` completed epochs reach `start_test_percent · epochs`, every
/// `test_step`-th epoch, at most once.
pub fn validation_due(epoch: usize, config: &TrainerConfig, tested: &HashSet<usize>) -> bool {
    (epoch + 1) as f64 >= config.start_test_percent * config.epochs as f64
        && epoch % config.test_step.max(1) == 0
        && !tested.contains(&epoch)
}

/// Losses of one optimisation step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub loss: f32,
    pub moving_average: f32,
    pub terms: BTreeMap<String, f32>,
}

/// Outcome of [`Structure::train`].
#[derive(Debug, Clone, Copy)]
pub struct TrainSummary {
    pub best: BestCheckpoint,
    pub epochs: usize,
}

/// Metric value plus per-term dictionary, weighted over batches.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub metric: f32,
    pub terms: BTreeMap<String, f32>,
    /// Stacked predictions when requested.
    pub predictions: Option<Tensor>,
}

// ── Structure ───────────────────────────────────────────────────────────────

/// The training engine. Owns the model, its variables and the optimiser.
pub struct Structure {
    model: Box<dyn TrajModel>,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    loss: LossSet,
    metrics: LossSet,
    label_types: Vec<InputType>,
    args: RunArgs,
    state: TrainState,
    device: Device,
}

impl Structure {
    /// Build the agent model named in `args` with freshly initialised
    /// weights. Agents train on key points (`l2`) and report `AvgKey` and
    /// `FDE`.
    pub fn new(args: RunArgs, device: Device) -> anyhow::Result<Self> {
        let kind = AgentKind::from_str(&args.model)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = build_agent_model(kind, &args.model_config, vb)?;
        let keys = args.model_config.key_points()?;
        let loss = LossSet::new(vec![(LossKind::KeyL2, 1.0)], keys.clone());
        let metrics = LossSet::new(vec![(LossKind::AvgKey, 1.0), (LossKind::Fde, 0.0)], keys);
        Self::from_parts(model, varmap, args, loss, metrics, device)
    }

    /// Assemble a structure around an already-built model.
    pub fn from_parts(
        model: Box<dyn TrajModel>,
        varmap: VarMap,
        args: RunArgs,
        loss: LossSet,
        metrics: LossSet,
        device: Device,
    ) -> anyhow::Result<Self> {
        let vars = varmap.all_vars();
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: args.trainer.lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        tracing::info!(
            model = model.name(),
            params = count_parameters(&varmap),
            inputs = ?model.input_types().iter().map(|t| t.name()).collect::<Vec<_>>(),
            "structure ready"
        );
        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            loss,
            metrics,
            label_types: vec![InputType::Gt],
            args,
            state: TrainState::Idle,
            device,
        })
    }

    /// Rebuild from `<dir>/args.json` and load the best weights in `dir`.
    pub fn load(dir: &Path, device: Device) -> anyhow::Result<Self> {
        let mut args = RunArgs::load(dir)?;
        args.trainer.log_dir = dir.to_path_buf();
        let mut structure = Self::new(args, device)?;
        structure.load_best_model(dir)?;
        Ok(structure)
    }

    pub fn model(&self) -> &dyn TrajModel {
        self.model.as_ref()
    }

    /// Take the model, its variables and the run arguments apart.
    pub fn into_parts(self) -> (Box<dyn TrajModel>, VarMap, RunArgs) {
        (self.model, self.varmap, self.args)
    }

    pub fn args(&self) -> &RunArgs {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut RunArgs {
        &mut self.args
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Scale metrics back to dataset units.
    pub fn set_metric_scale(&mut self, scale: f64) {
        self.metrics = self.metrics.clone().with_scale(scale);
    }

    fn log_dir(&self) -> &Path {
        &self.args.trainer.log_dir
    }

    pub fn save_args(&self) -> anyhow::Result<PathBuf> {
        self.args.save(self.log_dir())
    }

    /// `(inputs…, label)` batch on the structure's device.
    fn split_batch(&self, batch: &[Tensor]) -> anyhow::Result<(Vec<Tensor>, Tensor)> {
        let (label, inputs) = batch
            .split_last()
            .ok_or_else(|| anyhow::anyhow!("empty batch"))?;
        let inputs = inputs
            .iter()
            .map(|t| t.to_device(&self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((inputs, label.to_device(&self.device)?))
    }

    /// One optimiser step on a `(inputs…, label)` batch.
    pub fn step(
        &mut self,
        batch: &[Tensor],
        average: &mut LossMovingAverage,
    ) -> anyhow::Result<StepMetrics> {
        let (inputs, label) = self.split_batch(batch)?;
        let output = self.model.forward(&inputs, true)?;
        let (loss, terms) = self.loss.apply(&output.prediction, &label, LossMode::Loss)?;
        let loss_val = loss.to_scalar::<f32>()?;
        if !loss_val.is_finite() {
            self.state = TrainState::Aborted;
            tracing::error!(loss = loss_val, ?terms, "non-finite loss, stopping training");
            anyhow::bail!("non-finite loss ({loss_val}) in terms {terms:?}");
        }

        let target = average.update(&loss)?;
        let mut grads = target.backward()?;
        if self.args.trainer.grad_clip_max_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.args.trainer.grad_clip_max_norm)?;
        }
        self.optimizer.step(&grads)?;

        Ok(StepMetrics {
            loss: loss_val,
            moving_average: average.value(),
            terms,
        })
    }

    /// Load the split's train and validation agents as tensor datasets.
    pub fn load_datasets(&mut self) -> anyhow::Result<(TensorDataset, TensorDataset)> {
        let registry = Registry::new(&self.args.dataset_root);
        let mut manager = DatasetManager::new(
            &registry,
            &self.args.model_config,
            &self.args.dataset,
            &self.args.split,
        )?;
        manager.set_types(self.model.input_types(), &self.label_types);
        let scale = manager.split().scale as f64;
        let (train, val) = manager.load_auto()?;
        self.set_metric_scale(scale);
        tracing::info!(train = train.len(), val = val.len(), "datasets loaded");
        Ok((train.to_tensor_dataset()?, val.to_tensor_dataset()?))
    }

    /// Load datasets from the registry and train on them.
    pub fn fit(&mut self) -> anyhow::Result<TrainSummary> {
        let (train, val) = self.load_datasets()?;
        self.train(&train, &val)
    }

    /// Run the full training loop.
    pub fn train(&mut self, train: &TensorDataset, val: &TensorDataset) -> anyhow::Result<TrainSummary> {
        if train.is_empty() {
            anyhow::bail!("no training samples");
        }
        let config = self.args.trainer.clone();
        let log_dir = config.log_dir.clone();
        std::fs::create_dir_all(&log_dir)?;
        self.save_args()?;

        if let Some(dir) = &config.restore {
            let path = self.load_best_model(dir)?;
            tracing::info!(path = %path.display(), "training resumes from restored weights");
        }

        let mut metrics_file = std::fs::File::create(log_dir.join(METRICS_FILE))?;
        writeln!(metrics_file, "epoch,metric,{}", self.metric_names().join(","))?;

        let batches_per_epoch = train.num_batches(config.batch_size);
        let pb = ProgressBar::new((config.epochs * batches_per_epoch) as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );

        tracing::info!(
            epochs = config.epochs,
            batch_size = config.batch_size,
            samples = train.len(),
            log_dir = %log_dir.display(),
            "start training"
        );

        let mut average = LossMovingAverage::default();
        let mut best = BestCheckpoint::default();
        let mut tested = HashSet::new();

        for epoch in 0..config.epochs {
            self.state = TrainState::Training { epoch };
            for batch in train.batches(config.batch_size, true) {
                let m = self.step(&batch?, &mut average)?;
                pb.inc(1);
                pb.set_message(format!(
                    "epoch {epoch} loss {:.4} best {:.4}",
                    m.moving_average, best.metric
                ));
            }

            if !validation_due(epoch, &config, &tested) {
                continue;
            }
            self.state = TrainState::Validating { epoch };
            let eval = self.evaluate(val, false)?;
            tested.insert(epoch);

            let values: Vec<String> = self
                .metric_names()
                .iter()
                .map(|n| eval.terms.get(n).copied().unwrap_or(f32::NAN).to_string())
                .collect();
            writeln!(metrics_file, "{epoch},{},{}", eval.metric, values.join(","))?;

            if best.observe(eval.metric, epoch) {
                let path = log_dir.join(format!("{}_epoch{epoch}.safetensors", config.model_name));
                self.varmap.save(&path)?;
                best.save(&log_dir)?;
                tracing::info!(epoch, metric = eval.metric, path = %path.display(), "best checkpoint saved");
            } else {
                tracing::info!(epoch, metric = eval.metric, best = best.metric, "validation");
            }
        }
        pb.finish_with_message("done");

        let final_path = log_dir.join(format!("{}.safetensors", config.model_name));
        self.varmap.save(&final_path)?;
        self.state = TrainState::Done;
        tracing::info!(best_metric = best.metric, best_epoch = ?best.epoch, "training finished");
        Ok(TrainSummary {
            best,
            epochs: config.epochs,
        })
    }

    fn metric_names(&self) -> Vec<String> {
        self.metrics.items().iter().map(|(k, _)| k.name()).collect()
    }

    /// Batch-size-weighted metrics over a dataset, without gradients.
    pub fn evaluate(&self, ds: &TensorDataset, keep_predictions: bool) -> anyhow::Result<Evaluation> {
        let mut metric_parts = Vec::new();
        let mut term_parts: BTreeMap<String, Vec<(f32, usize)>> = BTreeMap::new();
        let mut predictions = Vec::new();

        for batch in ds.batches(self.args.trainer.batch_size, false) {
            let (inputs, label) = self.split_batch(&batch?)?;
            let n = label.dim(0)?;
            let output = self.model.forward(&inputs, false)?;
            let prediction = output.prediction.detach();
            let (metric, terms) = self.metrics.apply(&prediction, &label, LossMode::Metric)?;
            metric_parts.push((metric.to_scalar::<f32>()?, n));
            for (name, value) in terms {
                term_parts.entry(name).or_default().push((value, n));
            }
            if keep_predictions {
                predictions.push(prediction.to_device(&Device::Cpu)?);
            }
        }

        let metric = weighted_average(&metric_parts)
            .ok_or_else(|| anyhow::anyhow!("cannot evaluate on an empty dataset"))?;
        let terms = term_parts
            .into_iter()
            .filter_map(|(name, parts)| weighted_average(&parts).map(|v| (name, v)))
            .collect();
        let predictions = if keep_predictions {
            Some(Tensor::cat(&predictions, 0)?)
        } else {
            None
        };
        Ok(Evaluation {
            metric,
            terms,
            predictions,
        })
    }

    /// Test on the given agents; writes predictions and appends the report.
    pub fn test(&self, agents: &AgentManager, clips: &[String]) -> anyhow::Result<TestReport> {
        let mut agents = agents.clone();
        agents.set_types(self.model.input_types(), &self.label_types);
        let ds = agents.to_tensor_dataset()?;
        let eval = self.evaluate(&ds, true)?;

        let report = TestReport {
            model: self.model.name().to_string(),
            dataset: self.args.dataset.clone(),
            split: self.args.split.clone(),
            clips: clips.to_vec(),
            agents: agents.len(),
            metrics: eval.terms.clone(),
        };
        tracing::info!(clips = ?clips, metric = eval.metric, metrics = ?eval.terms, "test results");

        let log_dir = self.log_dir();
        if let Some(predictions) = &eval.predictions {
            write_predictions(&log_dir.join("predictions"), agents.agents(), predictions)?;
        }
        append_report(log_dir, &report)?;
        Ok(report)
    }

    /// Test according to `mode` on the split's test clips.
    pub fn run_test(&mut self, mode: &TestMode) -> anyhow::Result<Vec<TestReport>> {
        let registry = Registry::new(&self.args.dataset_root);
        let config = self.args.model_config.clone();
        let mut manager =
            DatasetManager::new(&registry, &config, &self.args.dataset, &self.args.split)?;
        manager.set_types(self.model.input_types(), &self.label_types);
        self.set_metric_scale(manager.split().scale as f64);

        let test_clips = manager.split().test.clone();
        let groups: Vec<Vec<String>> = match mode {
            TestMode::One(clip) => {
                let clip = match clip {
                    Some(c) => c.clone(),
                    None => test_clips
                        .first()
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("split has no test clips"))?,
                };
                vec![vec![clip]]
            }
            TestMode::All => test_clips.iter().map(|c| vec![c.clone()]).collect(),
            TestMode::Mix => vec![test_clips],
        };

        let mut reports = Vec::with_capacity(groups.len());
        for clips in groups {
            let agents = manager.load(&clips, LoadMode::Test)?;
            reports.push(self.test(&agents, &clips)?);
        }
        Ok(reports)
    }

    /// Load `<model_name>_epoch<best>.safetensors` per `best_metric.json`,
    /// falling back to `<model_name>.safetensors`. The model name is taken
    /// from `dir`'s `args.json` when there is one.
    pub fn load_best_model(&mut self, dir: &Path) -> anyhow::Result<PathBuf> {
        let name = match RunArgs::load(dir) {
            Ok(args) => args.trainer.model_name,
            Err(_) => self.args.trainer.model_name.clone(),
        };
        let path = match BestCheckpoint::load(dir)? {
            Some(BestCheckpoint {
                epoch: Some(epoch), ..
            }) => dir.join(format!("{name}_epoch{epoch}.safetensors")),
            _ => dir.join(format!("{name}.safetensors")),
        };
        self.varmap
            .load(&path)
            .with_context(|| format!("loading weights from {}", path.display()))?;
        tracing::info!(path = %path.display(), "weights loaded");
        Ok(path)
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Clip gradients so their global L2 norm ≤ `max_norm`.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<()> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt().max(1e-12);
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::ade;

    fn model_config() -> ModelConfig {
        ModelConfig {
            obs_frames: 4,
            pred_frames: 4,
            feature_dim: 16,
            depth: 4,
            kc: 2,
            transformer_layers: 1,
            transformer_heads: 2,
            transformer_dff: 16,
            partitions: 4,
            ..Default::default()
        }
    }

    fn run_args(dir: &Path, epochs: usize) -> RunArgs {
        RunArgs {
            model: "ev".into(),
            dataset: "toy".into(),
            split: "toy".into(),
            dataset_root: dir.join("dataset_configs"),
            model_config: model_config(),
            trainer: TrainerConfig {
                batch_size: 3,
                epochs,
                lr: 1e-3,
                log_dir: dir.join("logs"),
                model_name: "toy".into(),
                ..Default::default()
            },
        }
    }

    /// Straight walkers along +x at different speeds.
    fn dataset(n: usize, poison: bool) -> TensorDataset {
        let mut obs = Vec::new();
        let mut gt = Vec::new();
        for i in 0..n {
            let v = 0.2 + 0.1 * i as f32;
            for t in 0..4 {
                obs.extend([v * t as f32, 0.0]);
                gt.extend([v * (t + 4) as f32, 0.0]);
            }
        }
        if poison {
            obs[0] = f32::NAN;
        }
        let obs = Tensor::from_vec(obs, (n, 4, 2), &Device::Cpu).unwrap();
        let gt = Tensor::from_vec(gt, (n, 4, 2), &Device::Cpu).unwrap();
        TensorDataset::new(vec![obs, gt]).unwrap()
    }

    #[test]
    fn moving_average_closed_form() {
        let losses = [2.0f32, 1.0, 4.0, 0.5];
        let mut avg = LossMovingAverage::default();
        for l in losses {
            avg.update(&Tensor::new(l, &Device::Cpu).unwrap()).unwrap();
        }
        // Σ 0.7 · 0.3^(n-1-i) · loss_i
        let n = losses.len();
        let expected: f32 = losses
            .iter()
            .enumerate()
            .map(|(i, l)| 0.7 * 0.3f32.powi((n - 1 - i) as i32) * l)
            .sum();
        assert!((avg.value() - expected).abs() < 1e-5);
        assert!((LossMovingAverage::next_value(1.0, 2.0) - 1.7).abs() < 1e-6);
    }

    #[test]
    fn moving_average_gradient_is_scaled_loss_gradient() {
        let x = Var::new(&[3.0f32], &Device::Cpu).unwrap();
        let mut avg = LossMovingAverage::default();
        avg.update(&Tensor::new(10f32, &Device::Cpu).unwrap()).unwrap();
        let loss = x.as_tensor().sqr().unwrap().sum_all().unwrap();
        let target = avg.update(&loss).unwrap();
        let grads = target.backward().unwrap();
        let g = grads.get(x.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        // d(0.7 · x²)/dx = 1.4 x
        assert!((g[0] - 4.2).abs() < 1e-5);
    }

    #[test]
    fn checkpoint_iff_not_worse() {
        let mut best = BestCheckpoint::default();
        let metrics = [3.0f32, 2.0, 2.0, 5.0, 1.0];
        let saved: Vec<bool> = metrics
            .iter()
            .enumerate()
            .map(|(e, m)| best.observe(*m, e))
            .collect();
        assert_eq!(saved, vec![true, true, true, false, true]);
        assert_eq!(best, BestCheckpoint { metric: 1.0, epoch: Some(4) });

        let mut tie = BestCheckpoint::default();
        tie.observe(2.0, 0);
        tie.observe(2.0, 1);
        assert_eq!(tie.epoch, Some(1));
        assert!(!tie.observe(f32::NAN, 2));
    }

    #[test]
    fn infinite_metric_never_becomes_best() {
        let dir = tempfile::tempdir().unwrap();
        let mut best = BestCheckpoint::default();
        assert!(!best.observe(f32::INFINITY, 0));
        assert!(!best.observe(f32::NEG_INFINITY, 1));
        assert_eq!(best.epoch, None);

        assert!(best.observe(2.5, 3));
        assert!(!best.observe(f32::INFINITY, 4));
        best.save(dir.path()).unwrap();
        assert_eq!(BestCheckpoint::load(dir.path()).unwrap(), Some(best));
    }

    #[test]
    fn weighted_metric_is_batching_invariant() {
        let ds = dataset(7, false);
        let pred = (ds.tensors()[1].clone() + 0.5).unwrap();
        let full = ade(&pred, &ds.tensors()[1]).unwrap().to_scalar::<f32>().unwrap();
        let offset = TensorDataset::new(vec![pred, ds.tensors()[1].clone()]).unwrap();
        for bs in [1, 2, 3, 7] {
            let parts: Vec<(f32, usize)> = offset
                .batches(bs, false)
                .map(|b| {
                    let b = b.unwrap();
                    let v = ade(&b[0], &b[1]).unwrap().to_scalar::<f32>().unwrap();
                    (v, b[0].dim(0).unwrap())
                })
                .collect();
            let w = weighted_average(&parts).unwrap();
            assert!((w - full).abs() < 1e-5, "batch size {bs}: {w} vs {full}");
        }
        assert!(weighted_average(&[]).is_none());
    }

    #[test]
    fn validation_schedule() {
        let config = TrainerConfig {
            epochs: 10,
            start_test_percent: 0.5,
            test_step: 2,
            ..Default::default()
        };
        let mut tested = HashSet::new();
        let due: Vec<usize> = (0..10).filter(|e| validation_due(*e, &config, &tested)).collect();
        assert_eq!(due, vec![4, 6, 8]);
        tested.insert(4);
        assert!(!validation_due(4, &config, &tested));
    }

    #[test]
    fn training_writes_best_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(dir.path(), 2);
        let log_dir = args.trainer.log_dir.clone();
        let mut structure = Structure::new(args, Device::Cpu).unwrap();
        assert_eq!(structure.state(), TrainState::Idle);

        let summary = structure.train(&dataset(6, false), &dataset(4, false)).unwrap();
        assert_eq!(structure.state(), TrainState::Done);

        let best = BestCheckpoint::load(&log_dir).unwrap().unwrap();
        assert_eq!(best, summary.best);
        let epoch = best.epoch.unwrap();
        assert!(log_dir.join(format!("toy_epoch{epoch}.safetensors")).exists());
        assert!(log_dir.join("toy.safetensors").exists());
        assert!(log_dir.join(ARGS_FILE).exists());

        let csv = std::fs::read_to_string(log_dir.join(METRICS_FILE)).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.starts_with("epoch,metric,AvgKey,FDE"));

        let reloaded = Structure::load(&log_dir, Device::Cpu).unwrap();
        let eval = reloaded.evaluate(&dataset(4, false), true).unwrap();
        assert!(eval.metric.is_finite());
        assert_eq!(eval.predictions.unwrap().dims(), &[4, 2, 4, 2]);
    }

    fn weights(path: &Path) -> BTreeMap<String, Vec<f32>> {
        candle_core::safetensors::load(path, &Device::Cpu)
            .unwrap()
            .into_iter()
            .map(|(k, t)| (k, t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    #[test]
    fn training_resumes_from_restored_weights() {
        let first = tempfile::tempdir().unwrap();
        let args = run_args(first.path(), 1);
        let first_logs = args.trainer.log_dir.clone();
        Structure::new(args, Device::Cpu)
            .unwrap()
            .train(&dataset(6, false), &dataset(4, false))
            .unwrap();
        let epoch = BestCheckpoint::load(&first_logs).unwrap().unwrap().epoch.unwrap();
        let restored = weights(&first_logs.join(format!("toy_epoch{epoch}.safetensors")));

        // zero epochs: the final weights are exactly the restored ones
        let second = tempfile::tempdir().unwrap();
        let mut args = run_args(second.path(), 0);
        args.trainer.restore = Some(first_logs.clone());
        args.trainer.model_name = "resumed".into();
        let second_logs = args.trainer.log_dir.clone();
        let mut structure = Structure::new(args, Device::Cpu).unwrap();
        structure.train(&dataset(6, false), &dataset(4, false)).unwrap();
        assert_eq!(weights(&second_logs.join("resumed.safetensors")), restored);

        // a fresh initialisation does not match
        let fresh = Structure::new(run_args(second.path(), 0), Device::Cpu).unwrap();
        let fresh_path = second.path().join("fresh.safetensors");
        fresh.varmap().save(&fresh_path).unwrap();
        assert_ne!(weights(&fresh_path), restored);

        let mut missing = run_args(second.path(), 1);
        missing.trainer.restore = Some(second.path().join("nowhere"));
        let mut structure = Structure::new(missing, Device::Cpu).unwrap();
        assert!(structure.train(&dataset(6, false), &dataset(4, false)).is_err());
    }

    #[test]
    fn non_finite_loss_aborts_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(dir.path(), 3);
        let log_dir = args.trainer.log_dir.clone();
        let mut structure = Structure::new(args, Device::Cpu).unwrap();

        let err = structure
            .train(&dataset(3, true), &dataset(3, false))
            .unwrap_err();
        assert!(err.to_string().contains("non-finite loss"));
        assert_eq!(structure.state(), TrainState::Aborted);
        assert!(!log_dir.join(BEST_FILE).exists());
        assert!(!log_dir.join("toy.safetensors").exists());
    }

    #[test]
    fn test_modes_parse() {
        assert_eq!(TestMode::from_str("mix", None).unwrap(), TestMode::Mix);
        assert_eq!(
            TestMode::from_str("one", Some("zara1".into())).unwrap(),
            TestMode::One(Some("zara1".into()))
        );
        assert!(TestMode::from_str("some", None).is_err());
    }
}
