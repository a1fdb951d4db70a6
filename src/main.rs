//! nn-runner CLI
//!
//! ```bash
//! # Train the MNIST CNN on IDX files
//! nn-runner mnist --data-dir ./data/mnist
//!
//! # Continue an earlier reverse-function run
//! nn-runner reverse --mode resume --run-suffix 20180116T212902
//!
//! # Segment plant images with a saved FC-DenseNet
//! nn-runner densenet --config plant.json --mode use-saved
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::error;

use nn_runner::core::{RunConfig, TrainingMode};
use nn_runner::runners::{run_fc_densenet, run_mnist, run_reverse_function, RunReport};
use nn_runner::Result;

/// Train, evaluate and run neural networks
#[derive(Parser, Debug)]
#[command(name = "nn-runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// CNN classifier on MNIST (synthetic digits without a data directory)
    Mnist(RunArgs),
    /// Attention encoder-decoder learning to reverse strings
    Reverse(RunArgs),
    /// FC-DenseNet foreground segmentation on image patches
    Densenet(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON run configuration; the subcommand's defaults otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// start, resume or use-saved
    #[arg(short, long)]
    mode: Option<TrainingMode>,

    /// Dataset directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Timestamp suffix of an earlier run whose directories are reused
    #[arg(long)]
    run_suffix: Option<String>,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,
}

impl RunArgs {
    fn resolve(self, defaults: fn() -> RunConfig) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => defaults(),
        };
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        if self.run_suffix.is_some() {
            config.run_suffix = self.run_suffix;
        }
        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        Ok(config)
    }
}

fn run(command: Command) -> Result<RunReport> {
    match command {
        Command::Mnist(args) => run_mnist(&args.resolve(RunConfig::for_mnist)?),
        Command::Reverse(args) => run_reverse_function(&args.resolve(RunConfig::for_reverse_function)?),
        Command::Densenet(args) => run_fc_densenet(&args.resolve(RunConfig::for_fc_densenet)?),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(report) => {
            println!(
                "loss = {:.4}, accuracy = {:.4} (model: {})",
                report.evaluation.loss,
                report.evaluation.accuracy,
                report.dirs.model.display()
            );
            for line in &report.inferences {
                println!("{}", line);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
