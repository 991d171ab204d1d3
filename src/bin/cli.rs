//! Siamese CLI - train and evaluate embedding models from the command line

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use siamese::{
    api,
    config::{get_config, load_config_from_file, update_config, SiameseConfig},
    error::{SiameseError, SiameseResult},
    init_with_level,
    nn::{LossKind, ModelKind, PairMining},
    training::CheckpointFormat,
    version,
};

#[derive(Parser)]
#[command(name = "siamese")]
#[command(about = "Contrastive and triplet-loss embedding learning")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Set random seed for deterministic behavior
    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an embedding model
    Train {
        /// Number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(long)]
        lr: Option<f32>,

        /// Embedding network (mlp, conv)
        #[arg(short, long)]
        model: Option<ModelKind>,

        /// Training objective (triplet, contrastive)
        #[arg(short, long)]
        loss: Option<LossKind>,

        /// Hinge margin
        #[arg(long)]
        margin: Option<f32>,

        /// Pair selection for the contrastive loss (label_aware, reverse_rotate)
        #[arg(long)]
        pair_mining: Option<PairMining>,

        /// Directory with MNIST IDX files; synthetic data is used otherwise
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Cap on examples read per split
        #[arg(long)]
        limit: Option<usize>,

        /// Write checkpoints to this directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Checkpoint encoding (json, bincode)
        #[arg(long)]
        format: Option<CheckpointFormat>,
    },

    /// Evaluate a saved checkpoint on the test split
    Evaluate {
        /// Checkpoint file
        checkpoint: PathBuf,

        /// Directory with MNIST IDX files; synthetic data is used otherwise
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the effective configuration, or write it to a file
    Config {
        /// Output path for the configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_with_level(match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    });

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = ?e.code(), "{}", e);
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> SiameseResult<()> {
    // Load configuration if provided
    if let Some(config_path) = &cli.config {
        load_config_from_file(config_path)?;
    }

    // Set seed if provided
    if let Some(seed) = cli.seed {
        update_config(|c| c.training.seed = seed)?;
        info!("Random seed set to {}", seed);
    }

    match cli.command {
        Commands::Train {
            epochs,
            batch_size,
            lr,
            model,
            loss,
            margin,
            pair_mining,
            data_dir,
            limit,
            checkpoint_dir,
            format,
        } => {
            update_config(|c| {
                if let Some(epochs) = epochs {
                    c.training.epochs = epochs;
                }
                if let Some(batch_size) = batch_size {
                    c.training.batch_size = batch_size;
                }
                if let Some(lr) = lr {
                    c.training.learning_rate = lr;
                }
                if let Some(model) = model {
                    c.model.kind = model;
                }
                if let Some(loss) = loss {
                    c.loss.kind = loss;
                }
                if let Some(margin) = margin {
                    c.loss.margin = margin;
                }
                if let Some(pair_mining) = pair_mining {
                    c.loss.pair_mining = pair_mining;
                }
                if data_dir.is_some() {
                    c.data.data_dir = data_dir;
                }
                if limit.is_some() {
                    c.data.limit = limit;
                }
                if let Some(dir) = checkpoint_dir {
                    c.checkpoint.enabled = true;
                    c.checkpoint.dir = dir;
                }
                if let Some(format) = format {
                    c.checkpoint.format = format;
                }
            })?;
            train(&get_config())?;
        }

        Commands::Evaluate { checkpoint, data_dir } => {
            if data_dir.is_some() {
                update_config(|c| c.data.data_dir = data_dir)?;
            }
            evaluate(&get_config(), &checkpoint)?;
        }

        Commands::Config { output } => {
            show_config(&get_config(), output.as_deref())?;
        }
    }

    Ok(())
}

fn train(config: &SiameseConfig) -> SiameseResult<()> {
    info!(
        model = %config.model.kind,
        loss = %config.loss.kind,
        epochs = config.training.epochs,
        batch_size = config.training.batch_size,
        "starting training"
    );

    let mut run = api::train(config)?;
    let parameters = run.model.num_parameters();

    let last = run
        .epochs
        .last()
        .ok_or_else(|| SiameseError::InvalidData("training finished without running an epoch".to_string()))?;
    println!("epochs:          {}", run.epochs.len());
    println!("final loss:      {:.4}", last.train_loss);
    match run.evaluation {
        Some(evaluation) => {
            println!("test loss:       {:.4}", evaluation.loss);
            println!("test accuracy:   {:.2}%", evaluation.accuracy * 100.0);
        }
        None => println!("test split:      not found, evaluation skipped"),
    }
    println!("parameters:      {}", parameters);
    if config.checkpoint.enabled {
        println!("checkpoints in:  {}", config.checkpoint.dir.display());
    }
    Ok(())
}

fn evaluate(config: &SiameseConfig, checkpoint: &Path) -> SiameseResult<()> {
    info!("Evaluating checkpoint {:?}", checkpoint);
    let result = api::evaluate_checkpoint(config, checkpoint)?;
    println!("triplets:  {}", result.triplets);
    println!("loss:      {:.4}", result.loss);
    println!("accuracy:  {:.2}%", result.accuracy * 100.0);
    Ok(())
}

fn show_config(config: &SiameseConfig, output: Option<&Path>) -> SiameseResult<()> {
    match output {
        Some(path) => {
            config.to_file(path)?;
            info!("Configuration saved to {:?}", path);
        }
        None => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}
