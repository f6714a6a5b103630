use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    backend::{wgpu::WgpuDevice, Autodiff, Wgpu},
    config::Config,
    optim::AdamConfig,
};
use clap::{Args, Parser, Subcommand};
use model::ClassifierConfig;
use training::TrainingConfig;

pub mod backbone;
pub mod charts;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod logging;
pub mod model;
pub mod module;
pub mod pipeline;
pub mod split;
pub mod training;

type Backend = Wgpu<f32, i32>;
type AutodiffBackend = Autodiff<Backend>;

/// Cats vs. dogs classifier: a frozen MobileNetV2 backbone with a small
/// trainable head.
#[derive(Parser, Debug)]
#[command(name = "dogs-vs-cats", version, about)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct SplitArgs {
    /// Flat folder of `cat.N.jpg` / `dog.N.jpg` images
    #[arg(long, default_value = "data/train")]
    source: PathBuf,

    /// Root of the `train|valid|test / cats|dogs` tree to create
    #[arg(long, default_value = "data/dogs_vs_cats_small_dataset")]
    output: PathBuf,

    /// Remove an existing tree instead of failing
    #[arg(long)]
    overwrite: bool,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "artifact")]
    artifact_dir: PathBuf,

    /// Pretrained backbone record, without the `.mpk` extension
    #[arg(long, default_value = "weights/mobilenet_v2")]
    backbone_weights: PathBuf,

    /// Training configuration JSON; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    #[arg(long, default_value = "data/dogs_vs_cats_small_dataset")]
    data_dir: PathBuf,

    #[arg(long, default_value = "artifact")]
    artifact_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy the raw images into train/valid/test splits (80/10/10)
    Split(SplitArgs),

    /// Fine-tune the classification head
    Train {
        #[arg(long, default_value = "data/dogs_vs_cats_small_dataset")]
        data_dir: PathBuf,

        #[command(flatten)]
        args: TrainArgs,
    },

    /// Score the saved model and write the confusion matrix and report
    Evaluate(EvaluateArgs),

    /// Classify a single image with the saved model
    Predict {
        #[arg(long, default_value = "artifact")]
        artifact_dir: PathBuf,

        #[arg(long)]
        image: PathBuf,
    },

    /// Split, train and evaluate in one go; trains on the split output
    Run {
        #[command(flatten)]
        split: SplitArgs,

        #[command(flatten)]
        train: TrainArgs,
    },
}

fn training_config(args: &TrainArgs) -> Result<TrainingConfig> {
    let config = match &args.config {
        Some(path) => TrainingConfig::load(path)
            .map_err(|err| anyhow::anyhow!("{err:?}"))
            .with_context(|| format!("reading {}", path.display()))?,
        None => TrainingConfig::new(ClassifierConfig::new(), AdamConfig::new()),
    };

    let config = match args.epochs {
        Some(epochs) => config.with_epoch_count(epochs),
        None => config,
    };
    let config = match args.batch_size {
        Some(batch_size) => config.with_batch_size(batch_size),
        None => config,
    };
    let config = match args.learning_rate {
        Some(learning_rate) => config.with_learning_rate(learning_rate),
        None => config,
    };

    Ok(config)
}

fn split(args: &SplitArgs) -> Result<()> {
    pipeline::split_dataset(&args.source, &args.output, args.overwrite)
        .with_context(|| format!("splitting {}", args.source.display()))?;
    Ok(())
}

fn train(data_dir: &Path, args: &TrainArgs, device: &WgpuDevice) -> Result<()> {
    let config = training_config(args)?;
    pipeline::train_model::<AutodiffBackend>(
        data_dir,
        &args.artifact_dir,
        &config,
        &args.backbone_weights,
        device.clone(),
    )
    .context("training failed")?;
    Ok(())
}

fn evaluate(data_dir: &Path, artifact_dir: &Path, device: &WgpuDevice) -> Result<()> {
    let summary = pipeline::evaluate_model::<Backend>(data_dir, artifact_dir, device.clone())
        .context("evaluation failed")?;

    println!("Validation loss = {:.4}", summary.valid.loss);
    println!("Validation Accuracy = {:.4}", summary.valid.accuracy);
    println!();
    println!("Test loss = {:.4}", summary.test.loss);
    println!("Test Accuracy = {:.4}", summary.test.accuracy);
    println!();
    println!("Classification Report:");
    println!("{}", summary.report);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose).map_err(anyhow::Error::msg)?;

    let device = WgpuDevice::default();

    match &cli.command {
        Command::Split(args) => split(args),
        Command::Train { data_dir, args } => train(data_dir, args, &device),
        Command::Evaluate(args) => evaluate(&args.data_dir, &args.artifact_dir, &device),
        Command::Predict { artifact_dir, image } => {
            let prediction = pipeline::classify_image::<Backend>(artifact_dir, image, device)
                .with_context(|| format!("classifying {}", image.display()))?;
            println!("This is a {}!", prediction.class_name.trim_end_matches('s'));
            Ok(())
        }
        Command::Run { split: split_args, train: train_args } => {
            let data_dir = split_args.output.as_path();
            split(split_args)?;
            train(data_dir, train_args, &device)?;
            evaluate(data_dir, &train_args.artifact_dir, &device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_the_pipeline_literals() {
        let cli = Cli::parse_from(["dogs-vs-cats", "train"]);
        let Command::Train { data_dir, args } = cli.command else {
            panic!("expected train");
        };

        assert_eq!(data_dir, PathBuf::from("data/dogs_vs_cats_small_dataset"));
        let config = training_config(&args).unwrap();
        assert_eq!(config.epoch_count, 10);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.image_size, 224);
        assert_eq!(config.learning_rate, 1.0e-3);
        assert_eq!(config.model.head.hidden, 256);
        assert_eq!(config.model.head.dropout, 0.4);
    }

    #[test]
    fn flags_override_config_fields() {
        let cli = Cli::parse_from([
            "dogs-vs-cats",
            "-v",
            "train",
            "--epochs",
            "3",
            "--batch-size",
            "16",
            "--learning-rate",
            "0.01",
        ]);
        assert!(cli.verbose);
        let Command::Train { args, .. } = cli.command else {
            panic!("expected train");
        };

        let config = training_config(&args).unwrap();
        assert_eq!(config.epoch_count, 3);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.learning_rate, 0.01);
    }

    #[test]
    fn run_takes_split_and_train_flags() {
        let cli = Cli::parse_from([
            "dogs-vs-cats",
            "run",
            "--source",
            "raw",
            "--overwrite",
            "--epochs",
            "1",
        ]);
        let Command::Run { split, train } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(split.source, PathBuf::from("raw"));
        assert!(split.overwrite);
        assert_eq!(train.epochs, Some(1));
    }

    #[test]
    fn run_has_a_single_data_tree() {
        let cli = Cli::parse_from([
            "dogs-vs-cats",
            "run",
            "--source",
            "raw",
            "--output",
            "/tmp/my_split",
        ]);
        let Command::Run { split, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(split.output, PathBuf::from("/tmp/my_split"));

        let separate = Cli::try_parse_from(["dogs-vs-cats", "run", "--data-dir", "elsewhere"]);
        assert!(separate.is_err());
    }

    #[test]
    fn train_reads_its_own_data_dir() {
        let cli = Cli::parse_from(["dogs-vs-cats", "train", "--data-dir", "tree"]);
        let Command::Train { data_dir, .. } = cli.command else {
            panic!("expected train");
        };
        assert_eq!(data_dir, PathBuf::from("tree"));
    }
}
