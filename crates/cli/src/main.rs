use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};

use traj_common::registry::{ethucy, Registry};
use traj_common::ModelConfig;
use traj_train::{build_silverballers, RunArgs, SilverballersArgs, Structure, TestMode, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "traj", about = "Trajectory prediction with SocialCircle / PhysicalCircle agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train an agent model (ev / evsc / evspc) on a dataset split.
    Train(TrainArgs),
    /// Test a trained agent restored from its log directory.
    Test(TestArgs),
    /// Test a trained agent composed with a second-stage handler.
    Silverballers(SilverballersCliArgs),
    /// Convert raw ETH-UCY annotations and write clip / split descriptors.
    PrepareEthucy(PrepareArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Agent type: ev, evsc or evspc.
    #[arg(long, default_value = "evsc")]
    model: String,
    #[arg(long, default_value = "dataset_configs")]
    dataset_root: PathBuf,
    #[arg(long, default_value = "ETH-UCY")]
    dataset: String,
    #[arg(long, default_value = "zara1")]
    split: String,
    /// Model configuration JSON; defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "5000")]
    batch_size: usize,
    #[arg(long, default_value = "500")]
    epochs: usize,
    #[arg(long, default_value = "1e-3")]
    lr: f64,
    /// Fraction of epochs after which validation starts.
    #[arg(long, default_value = "0.0")]
    start_test_percent: f64,
    #[arg(long, default_value = "1")]
    test_step: usize,
    /// Clip gradients to this global norm (0 disables).
    #[arg(long, default_value = "0.0")]
    grad_clip_max_norm: f64,
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    /// Log directory whose best weights are loaded before training.
    #[arg(long)]
    restore: Option<PathBuf>,
    /// Test mode run after training: one, all or mix.
    #[arg(long, default_value = "mix", value_parser = ["one", "all", "mix"])]
    test_mode: String,
}

// ── Test ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TestArgs {
    /// Log directory holding `args.json` and the weights.
    #[arg(long)]
    load: PathBuf,
    #[arg(long, default_value = "mix", value_parser = ["one", "all", "mix"])]
    test_mode: String,
    /// Clip tested in `one` mode; defaults to the split's first test clip.
    #[arg(long)]
    clip: Option<String>,
}

#[derive(Parser, Debug)]
struct SilverballersCliArgs {
    /// Log directory of the trained agent.
    #[arg(long)]
    loada: PathBuf,
    /// Second-stage handler.
    #[arg(long, default_value = "linear")]
    loadb: String,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long, default_value = "mix", value_parser = ["one", "all", "mix"])]
    test_mode: String,
    #[arg(long)]
    clip: Option<String>,
}

#[derive(Parser, Debug)]
struct PrepareArgs {
    /// Directory holding `<clip>/true_pos_.csv` sources.
    #[arg(long)]
    source: PathBuf,
    /// Where converted `ann_meter.csv` files go.
    #[arg(long, default_value = "dataset_processed")]
    processed: PathBuf,
    #[arg(long, default_value = "dataset_configs")]
    dataset_root: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Test(args) => cmd_test(args),
        Command::Silverballers(args) => cmd_silverballers(args),
        Command::PrepareEthucy(args) => cmd_prepare(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let model_config = match &args.config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig::default(),
    };
    let test_mode = TestMode::from_str(&args.test_mode, None)?;
    let run_args = RunArgs {
        model: args.model.clone(),
        dataset: args.dataset,
        split: args.split,
        dataset_root: args.dataset_root,
        model_config,
        trainer: TrainerConfig {
            batch_size: args.batch_size,
            epochs: args.epochs,
            lr: args.lr,
            start_test_percent: args.start_test_percent,
            test_step: args.test_step,
            grad_clip_max_norm: args.grad_clip_max_norm,
            log_dir: args.log_dir.clone(),
            model_name: args.model,
            restore: args.restore,
        },
    };

    let device = Device::cuda_if_available(0)?;
    let mut structure = Structure::new(run_args, device)?;
    let summary = structure.fit()?;
    tracing::info!(
        best_metric = summary.best.metric,
        best_epoch = ?summary.best.epoch,
        epochs = summary.epochs,
        "training finished"
    );

    structure.load_best_model(&args.log_dir)?;
    report(structure.run_test(&test_mode)?);
    Ok(())
}

fn cmd_test(args: TestArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let mut structure = Structure::load(&args.load, device)?;
    let mode = TestMode::from_str(&args.test_mode, args.clip)?;
    report(structure.run_test(&mode)?);
    Ok(())
}

fn cmd_silverballers(args: SilverballersCliArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let mode = TestMode::from_str(&args.test_mode, args.clip)?;
    let sb_args = SilverballersArgs {
        agent_dir: args.loada,
        handler: args.loadb,
        batch_size: args.batch_size,
        log_dir: args.log_dir,
    };
    let mut structure = build_silverballers(&sb_args, device)?;
    report(structure.run_test(&mode)?);
    Ok(())
}

fn cmd_prepare(args: PrepareArgs) -> Result<()> {
    let registry = Registry::new(&args.dataset_root);
    ethucy::prepare(&args.source, &args.processed, &registry)?;
    tracing::info!(root = %args.dataset_root.display(), "ETH-UCY descriptors written");
    Ok(())
}

fn report(reports: Vec<traj_train::TestReport>) {
    for r in reports {
        let metrics = r
            .metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{} on {}: {metrics} ({} agents)", r.model, r.clips.join("+"), r.agents);
    }
}
