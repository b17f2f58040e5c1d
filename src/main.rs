use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use saliency_train::checkpoint::list_checkpoints;
use saliency_train::cli::{CheckpointsArgs, Cli, Commands, TrainArgs};
use saliency_train::training::train;

#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
type Backend = burn::backend::Autodiff<burn_ndarray::NdArray<f32>>;

#[cfg(feature = "wgpu-backend")]
type Backend = burn::backend::Autodiff<burn_wgpu::Wgpu>;

#[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
type Backend = burn::backend::Autodiff<burn_tch::LibTorch<f32>>;

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train_command(args),
        Commands::Checkpoints(args) => checkpoints_command(args),
    }
}

fn train_command(args: TrainArgs) -> Result<()> {
    let config = args.into_run_config();
    let device = Default::default();

    let summary = train::<Backend>(config, &device)?;
    if summary.already_complete {
        info!(
            "Nothing to do: checkpoint already at epoch {}",
            summary.progress.current_epoch
        );
    } else {
        info!(
            "Trained {} steps, now at epoch {} (global step {}), {} checkpoints written",
            summary.optimizer_steps,
            summary.progress.current_epoch,
            summary.progress.global_step,
            summary.checkpoints.len()
        );
    }
    Ok(())
}

fn checkpoints_command(args: CheckpointsArgs) -> Result<()> {
    let run_dir = args.run_dir();
    let checkpoints = list_checkpoints(&run_dir)?;
    if checkpoints.is_empty() {
        info!("No checkpoints in {:?}", run_dir);
    }
    for (path, epoch, global_step) in checkpoints {
        println!("epoch {:>3}  step {:>9}  {}", epoch, global_step, path.display());
    }
    Ok(())
}
