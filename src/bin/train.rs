//! Command-line entry point: train or evaluate one (data, model, loss)
//! experiment.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use neural_process::config::{DataName, ExperimentConfig, LossName, ModelName};
use neural_process::data::build_process;
use neural_process::logging::setup_logging;
use neural_process::training::{plot, Trainer};

#[derive(Parser)]
#[command(
    name = "train",
    about = "Train and evaluate neural process models on synthetic 1-D regression tasks"
)]
struct Args {
    /// Synthetic dataset
    #[arg(long, value_enum)]
    data: DataName,

    /// Model architecture
    #[arg(long, value_enum)]
    model: ModelName,

    /// Training objective
    #[arg(long, value_enum)]
    loss: LossName,

    /// Override the number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Require the latest checkpoint to sit at this epoch before resuming
    /// (0 forces a fresh start)
    #[arg(long)]
    start_epoch: Option<usize>,

    /// Evaluate the best checkpoint on all regimes instead of training
    #[arg(long)]
    evaluate: bool,

    /// Render this many task fits after training or evaluation
    #[arg(long, default_value_t = 0)]
    plots: usize,

    /// Output root for checkpoints and plots
    #[arg(long, default_value = "_experiments")]
    root: PathBuf,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let mut config = ExperimentConfig::build(args.data, args.model, args.loss)?;
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    info!(key = %config.key(), "experiment configured");

    let mut trainer = Trainer::new(config.clone(), &args.root)?;
    if args.evaluate {
        trainer.load_best()?;
        trainer.evaluate_regimes()?;
    } else {
        match args.start_epoch {
            Some(0) => {}
            Some(epoch) => {
                trainer.resume()?;
                anyhow::ensure!(
                    trainer.start_epoch() == epoch,
                    "latest checkpoint is at epoch {}, not {}",
                    trainer.start_epoch(),
                    epoch
                );
            }
            None => {
                trainer.resume()?;
            }
        }
        trainer.train()?;
        trainer.evaluate_regimes()?;
    }

    if args.plots > 0 {
        render_plots(&mut trainer, &config, args.plots)?;
    }

    Ok(())
}

fn render_plots(trainer: &mut Trainer, config: &ExperimentConfig, count: usize) -> Result<()> {
    let mut rng = rand::thread_rng();
    let process = build_process(config.data);
    let dir = trainer.store().dir().to_path_buf();

    let tasks: Vec<_> = (0..count)
        .map(|_| trainer.generator().sample_batch(&mut rng))
        .collect();
    for (i, task) in tasks.iter().enumerate() {
        let path = dir.join(format!("fit-{:02}.png", i));
        plot::render_fit(
            trainer.model_mut(),
            process.as_ref(),
            task,
            0,
            6,
            &mut rng,
            &path,
        )?;
        info!(path = %path.display(), "rendered fit");
    }
    Ok(())
}
