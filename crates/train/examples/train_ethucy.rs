//! Example: train an `evsc` agent on one ETH-UCY leave-one-out split.
//!
//! Prerequisites:
//!   1. Download the ETH-UCY `true_pos_.csv` files into `data/ethucy/<clip>/`.
//!   2. Convert: `cargo run -p traj-cli -- prepare-ethucy --source data/ethucy`
//!
//! Run:
//!   cargo run -p traj-train --example train_ethucy -- --split zara1 --epochs 50

use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;

use traj_common::ModelConfig;
use traj_train::{RunArgs, Structure, TestMode, TrainerConfig};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "zara1")]
    split: String,
    #[arg(long, default_value = "dataset_configs")]
    dataset_root: PathBuf,
    #[arg(long, default_value = "logs/evsc_ethucy")]
    log_dir: PathBuf,
    #[arg(long, default_value = "evsc")]
    model: String,
    #[arg(long, default_value = "1000")]
    batch_size: usize,
    #[arg(long, default_value = "50")]
    epochs: usize,
    #[arg(long, default_value = "1e-3")]
    lr: f64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let run_args = RunArgs {
        model: args.model.clone(),
        dataset: traj_common::registry::ethucy::DATASET.to_string(),
        split: args.split.clone(),
        dataset_root: args.dataset_root,
        model_config: ModelConfig {
            key_points: "3_7_11".to_string(),
            preprocess: "111".to_string(),
            ..Default::default()
        },
        trainer: TrainerConfig {
            batch_size: args.batch_size,
            epochs: args.epochs,
            lr: args.lr,
            log_dir: args.log_dir,
            model_name: args.model,
            ..Default::default()
        },
    };

    let device = Device::cuda_if_available(0)?;
    let mut structure = Structure::new(run_args, device)?;
    let summary = structure.fit()?;
    tracing::info!(best_metric = summary.best.metric, best_epoch = ?summary.best.epoch, "trained");

    let log_dir = structure.args().trainer.log_dir.clone();
    structure.load_best_model(&log_dir)?;
    for report in structure.run_test(&TestMode::Mix)? {
        tracing::info!(clips = ?report.clips, metrics = ?report.metrics, "test");
    }
    Ok(())
}
