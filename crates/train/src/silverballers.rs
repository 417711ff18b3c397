//! Two-stage test structure: a trained agent proposes key points and a
//! handler interpolates the full future.
//!
//! The agent is restored from its log directory (`args.json` plus best
//! weights); dataset, split and frame settings are inherited from it.

use std::path::PathBuf;

use candle_core::Device;

use traj_core::{LinearHandler, SilverballersModel, TrajModel};

use crate::loss::{LossKind, LossSet};
use crate::trainer::{RunArgs, Structure};

/// Settings of a two-stage run.
#[derive(Debug, Clone)]
pub struct SilverballersArgs {
    /// Log directory of the trained agent.
    pub agent_dir: PathBuf,
    /// Handler name; only `linear` is available.
    pub handler: String,
    /// Requested batch size, clamped to the agent's.
    pub batch_size: Option<usize>,
    /// Where results go; defaults to the agent's log directory.
    pub log_dir: Option<PathBuf>,
}

fn build_handler(name: &str, args: &RunArgs, device: &Device) -> anyhow::Result<Box<dyn TrajModel>> {
    match name {
        "linear" | "l" => Ok(Box::new(LinearHandler::new(&args.model_config, device)?)),
        other => anyhow::bail!("unknown handler `{other}` (expected linear)"),
    }
}

/// Compose the agent and handler into a test-only [`Structure`].
pub fn build_structure(args: &SilverballersArgs, device: Device) -> anyhow::Result<Structure> {
    let agent = Structure::load(&args.agent_dir, device.clone())?;
    let (agent_model, varmap, mut run_args) = agent.into_parts();

    let handler = build_handler(&args.handler, &run_args, &device)?;
    let model = SilverballersModel::new(agent_model, handler);

    let agent_batch = run_args.trainer.batch_size;
    run_args.trainer.batch_size = args
        .batch_size
        .map_or(agent_batch, |b| b.clamp(1, agent_batch));
    if let Some(dir) = &args.log_dir {
        run_args.trainer.log_dir = dir.clone();
    }
    run_args.model = model.name().to_string();

    tracing::info!(
        model = model.name(),
        dataset = %run_args.dataset,
        split = %run_args.split,
        batch_size = run_args.trainer.batch_size,
        "two-stage structure ready"
    );

    let loss = LossSet::new(vec![(LossKind::Ade, 1.0)], Vec::new());
    let metrics = LossSet::new(vec![(LossKind::Ade, 1.0), (LossKind::Fde, 0.0)], Vec::new());
    Structure::from_parts(Box::new(model), varmap, run_args, loss, metrics, device)
}
