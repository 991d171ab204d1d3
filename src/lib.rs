//! Siamese - contrastive and triplet-loss embedding learning
//!
//! Features:
//! - Feed-forward and convolutional embedding networks with hand-written backward passes
//! - A triplet sampler with a bounded retry budget and an explicit random source
//! - Triplet margin and contrastive losses with analytic gradients
//! - A synchronous trainer with SGD/Adam, early stopping and checkpoints
//! - MNIST IDX loading and synthetic clustered data

pub mod error;
pub mod tensor;
pub mod ops;
pub mod nn;
pub mod data;
pub mod training;
pub mod config;

pub use error::{SiameseError, SiameseResult};
pub use tensor::{Shape, Tensor};
pub use nn::{
    ContrastiveLoss, ConvNet, EmbeddingModel, FeedForwardNet, Loss, LossKind, ModelKind, PairMining,
    TripletLoss,
};
pub use data::{Dataset, InMemoryDataset, LabeledExample, Triplet, TripletSampler};
pub use training::{Trainer, evaluate_triplets};
pub use config::{ConfigBuilder, SiameseConfig};

// High-level API
pub mod api {
    use std::path::Path;
    use std::sync::Arc;

    use rand::{rngs::StdRng, SeedableRng};
    use tracing::{info, warn};

    use crate::{
        config::SiameseConfig,
        data::{load_mnist, Dataset, MnistSplit, TripletSampler},
        error::SiameseResult,
        nn::{EmbeddingModel, LossKind},
        training::{evaluate_triplets, Checkpoint, EpochResult, EvaluationResult, Trainer},
    };

    /// Model, per-epoch results and a final evaluation
    #[derive(Debug)]
    pub struct TrainingRun {
        pub model: Box<dyn EmbeddingModel>,
        pub epochs: Vec<EpochResult>,
        /// `None` when `data.data_dir` holds no test split
        pub evaluation: Option<EvaluationResult>,
    }

    /// MNIST from `data.data_dir` when set, otherwise the configured synthetic blobs
    pub fn load_dataset(config: &SiameseConfig, split: MnistSplit) -> SiameseResult<Arc<dyn Dataset>> {
        match &config.data.data_dir {
            Some(dir) => Ok(Arc::new(load_mnist(dir, split, config.data.limit)?)),
            None => {
                let offset = match split {
                    MnistSplit::Train => 0,
                    MnistSplit::Test => 1,
                };
                // both splits share class centers; only the noise differs
                let mut centers_rng = StdRng::seed_from_u64(config.training.seed);
                let dataset = config.data.synthetic.generate_with(
                    &mut centers_rng,
                    &mut StdRng::seed_from_u64(config.training.seed.wrapping_add(offset + 1)),
                )?;
                info!(examples = dataset.len(), split = ?split, "using synthetic data");
                Ok(Arc::new(dataset))
            }
        }
    }

    /// Build, train and evaluate a model as configured
    pub fn train(config: &SiameseConfig) -> SiameseResult<TrainingRun> {
        config.validate()?;
        let seed = config.training.seed;
        let train_set = load_dataset(config, MnistSplit::Train)?;

        let mut model = config.model.kind.build(&mut StdRng::seed_from_u64(seed))?;
        let mut trainer = Trainer::new(config.clone())?;

        let epochs = match config.loss.kind {
            LossKind::Triplet => {
                let mut sampler = TripletSampler::new(Arc::clone(&train_set), StdRng::seed_from_u64(seed))?
                    .with_max_retries(config.sampler.max_retries)?;
                trainer.train_triplets(model.as_mut(), &mut sampler)?
            }
            LossKind::Contrastive => trainer.train_contrastive(model.as_mut(), train_set)?,
        };

        let evaluation = match &config.data.data_dir {
            Some(dir) if !MnistSplit::Test.is_present(dir) => {
                warn!(dir = %dir.display(), "no test split found, skipping evaluation");
                None
            }
            _ => {
                let test_set = load_dataset(config, MnistSplit::Test)?;
                Some(evaluate(config, model.as_mut(), test_set)?)
            }
        };
        Ok(TrainingRun { model, epochs, evaluation })
    }

    /// Evaluate a model on triplets drawn from `dataset`
    pub fn evaluate(
        config: &SiameseConfig,
        model: &mut dyn EmbeddingModel,
        dataset: Arc<dyn Dataset>,
    ) -> SiameseResult<EvaluationResult> {
        let mut sampler = TripletSampler::new(dataset, StdRng::seed_from_u64(config.training.seed))?
            .with_max_retries(config.sampler.max_retries)?;
        let result = evaluate_triplets(model, &mut sampler, config.training.batch_size, config.loss.margin)?;
        info!(loss = result.loss, accuracy = result.accuracy, triplets = result.triplets, "evaluation");
        Ok(result)
    }

    /// Evaluate a saved checkpoint on the configured test split
    pub fn evaluate_checkpoint(config: &SiameseConfig, path: &Path) -> SiameseResult<EvaluationResult> {
        let checkpoint = Checkpoint::load(path)?;
        let mut model = checkpoint.build_model()?;
        let test_set = load_dataset(config, MnistSplit::Test)?;
        evaluate(config, model.as_mut(), test_set)
    }
}

/// Install a `tracing` subscriber printing events up to `level`.
///
/// Does nothing when a global subscriber is already set.
pub fn init_with_level(level: tracing::Level) {
    if tracing_subscriber::fmt().with_max_level(level).try_init().is_ok() {
        tracing::debug!("siamese {} logging initialized", version());
    }
}

/// Initialize logging at `INFO`
pub fn init() {
    init_with_level(tracing::Level::INFO);
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_level(tracing::Level::DEBUG);
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
