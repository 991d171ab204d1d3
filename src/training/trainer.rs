//! Synchronous trainer for triplet and contrastive embedding learning

use std::sync::Arc;
use std::time::Instant;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    config::SiameseConfig,
    data::{Batch, BatchSampler, DataLoader, Dataset, TripletSampler},
    error::{ErrorContext, SiameseError, SiameseResult, WithContext},
    nn::{pairwise_distance, ContrastiveLoss, EmbeddingModel, Loss, TripletLoss},
    tensor::Tensor,
};
use super::{
    checkpoints::{Checkpoint, CheckpointManager},
    metrics::{MetricTracker, RunningMean},
    optimizers::Optimizer,
    CallbackAction, EarlyStopping, EpochResult, TrainingCallback,
};

/// Training state
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub step: usize,
    pub best_loss: f32,
    pub learning_rate: f32,
    pub train_loss: f32,
    pub total_examples: usize,
}

impl TrainingState {
    fn new(learning_rate: f32) -> Self {
        Self {
            epoch: 0,
            step: 0,
            best_loss: f32::INFINITY,
            learning_rate,
            train_loss: 0.0,
            total_examples: 0,
        }
    }
}

/// Mean triplet loss and the share of triplets already ordered correctly
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationResult {
    pub loss: f32,
    /// Fraction of triplets with `d(a, p) < d(a, n)`
    pub accuracy: f32,
    pub triplets: usize,
}

/// Main trainer struct
pub struct Trainer {
    config: SiameseConfig,
    state: TrainingState,
    optimizer: Box<dyn Optimizer>,
    batches: BatchSampler,
    rng: StdRng,
    checkpoint_manager: Option<CheckpointManager>,
    metric_tracker: MetricTracker,
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl Trainer {
    /// Create a new trainer with configuration
    pub fn new(config: SiameseConfig) -> SiameseResult<Self> {
        config.validate()?;
        let training = &config.training;
        let optimizer = training.optimizer.create_optimizer(training.learning_rate);
        let batches = BatchSampler::new(training.batch_size)?
            .with_shuffle(training.shuffle)
            .with_drop_last(training.drop_last);
        let checkpoint_manager = config.checkpoint.enabled.then(|| {
            CheckpointManager::new(&config.checkpoint.dir)
                .with_format(config.checkpoint.format)
                .with_max_checkpoints(config.checkpoint.keep)
        });

        let mut callbacks: Vec<Box<dyn TrainingCallback>> = Vec::new();
        if let Some(patience) = training.early_stopping_patience {
            callbacks.push(Box::new(EarlyStopping::new(patience, training.early_stopping_min_delta)));
        }

        Ok(Self {
            state: TrainingState::new(training.learning_rate),
            rng: StdRng::seed_from_u64(training.seed),
            optimizer,
            batches,
            checkpoint_manager,
            metric_tracker: MetricTracker::new(),
            callbacks,
            config,
        })
    }

    /// Add a training callback
    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn metrics(&self) -> &MetricTracker {
        &self.metric_tracker
    }

    pub fn optimizer_mut(&mut self) -> &mut dyn Optimizer {
        self.optimizer.as_mut()
    }

    /// Train on sampler triples.
    ///
    /// Each step embeds anchors, positives and negatives as one `3 * batch`
    /// batch, so a single forward and backward pass serves all three roles.
    pub fn train_triplets<D: Dataset, R: Rng>(
        &mut self,
        model: &mut dyn EmbeddingModel,
        sampler: &mut TripletSampler<D, R>,
    ) -> SiameseResult<Vec<EpochResult>> {
        let loss_fn = TripletLoss::new(self.config.loss.margin)?;
        info!(
            model = %model.kind(),
            examples = sampler.len(),
            labels = sampler.num_labels(),
            epochs = self.config.training.epochs,
            "starting triplet training"
        );
        let len = sampler.len();
        let batches = self.batches;
        let plan = move |rng: &mut StdRng| batches.plan(len, rng).into_iter().map(Ok::<_, SiameseError>);
        self.run(model, len, plan, |model, indices: Vec<usize>| {
            let batch = sampler.get_batch(&indices)?;
            let inputs = batch.concatenated()?;
            let embeddings = model.forward(&inputs).with_context(|| {
                ErrorContext::new("embed triplet batch")
                    .with_shape(inputs.shape().to_string())
                    .with_hint(format!("{} models expect {} inputs", model.kind(), model.input_shape()))
            })?;
            let parts = embeddings.split_rows(3)?;
            let output = loss_fn.forward_backward(&parts[0], &parts[1], &parts[2])?;
            let grads = &output.grads;
            let grad = Tensor::concat_rows(&[&grads.anchor, &grads.positive, &grads.negative])?;
            model.backward(&grad)?;
            Ok(Some((output.loss, indices.len())))
        })
    }

    /// Train with pairs mined inside each labeled batch
    pub fn train_contrastive(
        &mut self,
        model: &mut dyn EmbeddingModel,
        dataset: Arc<dyn Dataset>,
    ) -> SiameseResult<Vec<EpochResult>> {
        let loss_fn = ContrastiveLoss::new(self.config.loss.margin)?
            .with_pair_mining(self.config.loss.pair_mining);
        info!(
            model = %model.kind(),
            examples = dataset.len(),
            epochs = self.config.training.epochs,
            mining = %loss_fn.pair_mining(),
            "starting contrastive training"
        );
        let len = dataset.len();
        let loader = DataLoader::with_sampler(dataset, self.batches);
        self.run(model, len, |rng: &mut StdRng| loader.iter(rng), |model, batch: Batch| {
            let embeddings = model.forward(&batch.inputs)?;
            let output = match loss_fn.forward_labeled(&embeddings, &batch.labels) {
                Ok(output) => output,
                Err(SiameseError::LabelNotFound { label, .. }) => {
                    warn!(label, size = batch.len(), "skipping batch with a single label");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            model.backward(&output.grad_embeddings)?;
            Ok(Some((output.loss, batch.len())))
        })
    }

    /// Epoch loop shared by both training modes.
    ///
    /// `epoch_batches` orders one epoch from the trainer's rng. `step` runs
    /// forward and backward for one batch and returns its loss and example
    /// count, or `None` when the batch was skipped.
    fn run<T, E, I, F>(
        &mut self,
        model: &mut dyn EmbeddingModel,
        len: usize,
        mut epoch_batches: E,
        mut step: F,
    ) -> SiameseResult<Vec<EpochResult>>
    where
        E: FnMut(&mut StdRng) -> I,
        I: Iterator<Item = SiameseResult<T>>,
        F: FnMut(&mut dyn EmbeddingModel, T) -> SiameseResult<Option<(f32, usize)>>,
    {
        if len == 0 {
            return Err(SiameseError::InvalidData("Cannot train on an empty dataset".to_string()));
        }
        for callback in &mut self.callbacks {
            callback.on_train_start(&self.state)?;
        }

        let mut results = Vec::new();
        let first_epoch = self.state.epoch;
        for epoch in first_epoch..first_epoch + self.config.training.epochs {
            self.state.epoch = epoch;
            let epoch_start = Instant::now();
            let mut epoch_loss = RunningMean::default();
            let mut skipped = 0;

            for batch in epoch_batches(&mut self.rng) {
                let batch = batch?;
                model.zero_grad();
                let Some((loss, examples)) = step(&mut *model, batch)? else {
                    skipped += 1;
                    continue;
                };
                if !loss.is_finite() {
                    return Err(SiameseError::operation_error(
                        "train",
                        &format!("loss became {} at step {}", loss, self.state.step),
                    ));
                }
                self.optimizer.step(&mut model.parameters())?;

                self.state.step += 1;
                self.state.total_examples += examples;
                epoch_loss.add(loss, examples);
                if self.config.training.log_frequency > 0 && self.state.step % self.config.training.log_frequency == 0 {
                    debug!(epoch, step = self.state.step, loss, "training step");
                }
            }

            let train_loss = epoch_loss.mean().ok_or_else(|| {
                SiameseError::InvalidData(format!("Epoch {} had no usable batches", epoch))
            })?;
            self.state.train_loss = train_loss;
            self.state.learning_rate = self.optimizer.learning_rate();

            self.metric_tracker.record_scalar("loss", train_loss);
            self.metric_tracker.record_scalar("learning_rate", self.state.learning_rate);
            self.metric_tracker.record_timing("epoch", epoch_start.elapsed());
            for _ in 0..skipped {
                self.metric_tracker.increment_counter("skipped_batches");
            }
            let metrics = self.metric_tracker.step();

            let result = EpochResult {
                epoch,
                step: self.state.step,
                train_loss,
                skipped_batches: skipped,
                duration: metrics.get_timing("epoch").unwrap_or_default(),
                metrics,
            };
            info!(epoch, loss = train_loss, duration_ms = result.duration.as_millis() as u64, "epoch finished");

            self.save_checkpoints(model, &result)?;

            let mut stop = false;
            for callback in &mut self.callbacks {
                if callback.on_epoch_end(&result, &self.state)? == CallbackAction::Stop {
                    stop = true;
                }
            }
            results.push(result);
            if stop {
                info!(epoch, "stopping early");
                break;
            }
        }
        self.state.epoch = results.last().map_or(first_epoch, |r| r.epoch + 1);
        info!(
            epochs = results.len(),
            steps = self.state.step,
            elapsed_ms = self.metric_tracker.total_time().as_millis() as u64,
            "training finished"
        );

        for callback in &mut self.callbacks {
            callback.on_train_end(&self.state)?;
        }
        Ok(results)
    }

    fn save_checkpoints(&mut self, model: &mut dyn EmbeddingModel, result: &EpochResult) -> SiameseResult<()> {
        let improved = result.train_loss < self.state.best_loss;
        if improved {
            self.state.best_loss = result.train_loss;
        }
        let Some(manager) = &self.checkpoint_manager else {
            return Ok(());
        };

        let checkpoint = Checkpoint::from_model(
            model,
            result.epoch,
            result.step,
            result.train_loss,
            self.state.learning_rate,
        )
        .with_metrics(result.metrics.clone());

        if (result.epoch + 1) % self.config.checkpoint.frequency == 0 {
            manager.save_checkpoint(&checkpoint, &CheckpointManager::periodic_name(result.epoch))?;
            manager.cleanup_old_checkpoints()?;
        }
        if improved {
            manager.save_checkpoint(&checkpoint, "best")?;
        }
        Ok(())
    }

    /// Continue from a checkpoint: restores parameters, epoch and step counters,
    /// best loss and learning rate.
    ///
    /// Optimizer state (Adam moments and step count) and the shuffle rng are
    /// not stored in checkpoints, so a resumed run starts those afresh and does
    /// not replay an uninterrupted run exactly.
    pub fn resume_from(&mut self, checkpoint: &Checkpoint, model: &mut dyn EmbeddingModel) -> SiameseResult<()> {
        checkpoint.restore(model)?;
        self.state.epoch = checkpoint.epoch + 1;
        self.state.step = checkpoint.step;
        self.state.best_loss = checkpoint.loss;
        self.optimizer.set_learning_rate(checkpoint.learning_rate);
        self.state.learning_rate = checkpoint.learning_rate;
        info!(epoch = self.state.epoch, step = self.state.step, "resumed from checkpoint");
        warn!(
            optimizer = self.optimizer.name(),
            "optimizer state and shuffle order start fresh after resuming"
        );
        Ok(())
    }
}

/// Mean triplet loss and triplet accuracy over one pass of the sampler, without updates
pub fn evaluate_triplets<D: Dataset, R: Rng>(
    model: &mut dyn EmbeddingModel,
    sampler: &mut TripletSampler<D, R>,
    batch_size: usize,
    margin: f32,
) -> SiameseResult<EvaluationResult> {
    let loss_fn = TripletLoss::new(margin)?;
    let mut rng = StdRng::seed_from_u64(0);
    let mut loss = RunningMean::default();
    let mut correct = 0;
    let mut triplets = 0;

    for indices in BatchSampler::new(batch_size)?.plan(sampler.len(), &mut rng) {
        let batch = sampler.get_batch(&indices)?;
        let embeddings = model.forward(&batch.concatenated()?)?;
        let parts = embeddings.split_rows(3)?;
        loss.add(loss_fn.forward(&parts[0], &parts[1], &parts[2])?, indices.len());

        let d_pos = pairwise_distance(&parts[0], &parts[1])?;
        let d_neg = pairwise_distance(&parts[0], &parts[2])?;
        correct += d_pos.iter().zip(&d_neg).filter(|(p, n)| p < n).count();
        triplets += indices.len();
    }

    let loss = loss
        .mean()
        .ok_or_else(|| SiameseError::InvalidData("Cannot evaluate an empty dataset".to_string()))?;
    Ok(EvaluationResult {
        loss,
        accuracy: correct as f32 / triplets as f32,
        triplets,
    })
}

impl std::fmt::Debug for Trainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("state", &self.state)
            .field("optimizer", &self.optimizer.name())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Mean training loss of every finished epoch, in order
pub fn loss_history(results: &[EpochResult]) -> Vec<f32> {
    results.iter().map(|r| r.train_loss).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::data::{InMemoryDataset, LabeledExample, SyntheticBlobs};
    use crate::nn::{ModelKind, PairMining};
    use crate::tensor::Shape;
    use std::sync::{Arc, Mutex};

    fn blobs(samples_per_class: usize) -> InMemoryDataset {
        SyntheticBlobs {
            num_classes: 3,
            samples_per_class,
            noise_std: 0.05,
            input_shape: vec![1, 28, 28],
        }
        .generate(&mut StdRng::seed_from_u64(1))
        .unwrap()
    }

    fn config(epochs: usize) -> SiameseConfig {
        ConfigBuilder::new()
            .training(|t| {
                t.epochs = epochs;
                t.batch_size = 6;
                t.learning_rate = 1e-3;
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_triplet_training_reduces_loss() {
        let mut model = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(0)).unwrap();
        let mut sampler = TripletSampler::new(blobs(6), StdRng::seed_from_u64(2)).unwrap();
        let mut trainer = Trainer::new(config(8)).unwrap();

        let results = trainer.train_triplets(model.as_mut(), &mut sampler).unwrap();
        assert_eq!(results.len(), 8);
        let history = loss_history(&results);
        assert!(history.iter().all(|&l| l >= 0.0));
        assert!(history[7] < history[0]);
        assert_eq!(trainer.state().step, 8 * 3);
        assert_eq!(trainer.metrics().scalar_history("loss"), history);
    }

    #[test]
    fn test_contrastive_training_runs() {
        let mut model = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(0)).unwrap();
        let dataset = blobs(4);
        let mut config = config(2);
        config.loss.pair_mining = PairMining::ReverseRotate;
        let mut trainer = Trainer::new(config).unwrap();
        let results = trainer.train_contrastive(model.as_mut(), Arc::new(dataset)).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.train_loss.is_finite()));
        // 12 examples in batches of 6, every example counted once per epoch
        assert_eq!(trainer.state().step, 4);
        assert_eq!(trainer.state().total_examples, 24);
        assert_eq!(results[1].metrics.get_timing("epoch"), Some(results[1].duration));
    }

    #[test]
    fn test_contrastive_skips_single_label_batches() {
        let examples = (0..4)
            .map(|i| LabeledExample::new(Tensor::full(Shape::new([1, 28, 28]), i as f32 * 0.1), i / 3))
            .collect();
        let dataset = InMemoryDataset::new(examples).unwrap();
        let mut model = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(0)).unwrap();
        let mut config = config(1);
        config.training.batch_size = 3;
        config.training.shuffle = false;
        let mut trainer = Trainer::new(config).unwrap();

        // batches [0, 1, 2] (all label 0) and [3] are both unusable
        assert!(trainer.train_contrastive(model.as_mut(), Arc::new(dataset)).is_err());
    }

    #[derive(Debug)]
    struct Recorder(Arc<Mutex<Vec<usize>>>);

    impl TrainingCallback for Recorder {
        fn on_epoch_end(&mut self, result: &EpochResult, _state: &TrainingState) -> SiameseResult<CallbackAction> {
            self.0.lock().unwrap().push(result.epoch);
            Ok(CallbackAction::Continue)
        }
    }

    #[test]
    fn test_callbacks_and_early_stopping() {
        let mut model = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(0)).unwrap();
        let mut sampler = TripletSampler::new(blobs(2), StdRng::seed_from_u64(2)).unwrap();
        let mut config = config(20);
        // a zero learning rate never improves, so patience runs out
        config.training.optimizer = crate::training::OptimizerConfig::sgd();
        config.training.early_stopping_patience = Some(2);
        config.training.early_stopping_min_delta = 10.0;
        let mut trainer = Trainer::new(config).unwrap();
        trainer.optimizer_mut().set_learning_rate(0.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        trainer.add_callback(Box::new(Recorder(Arc::clone(&seen))));

        let results = trainer.train_triplets(model.as_mut(), &mut sampler).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_checkpoints_written_and_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(3);
        config.checkpoint.enabled = true;
        config.checkpoint.dir = dir.path().to_path_buf();
        config.checkpoint.keep = 2;

        let mut model = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(0)).unwrap();
        let mut sampler = TripletSampler::new(blobs(2), StdRng::seed_from_u64(2)).unwrap();
        let mut trainer = Trainer::new(config.clone()).unwrap();
        trainer.train_triplets(model.as_mut(), &mut sampler).unwrap();

        let manager = CheckpointManager::new(dir.path());
        let names = manager.list_checkpoints().unwrap();
        assert!(names.contains(&"best".to_string()));
        assert_eq!(names.iter().filter(|n| n.starts_with("epoch_")).count(), 2);

        let last = manager.load_checkpoint("epoch_0002").unwrap();
        assert_eq!(last.epoch, 2);
        let mut restored = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(5)).unwrap();
        let mut resumed = Trainer::new(config).unwrap();
        resumed.resume_from(&last, restored.as_mut()).unwrap();
        assert_eq!(resumed.state().epoch, 3);
        assert_eq!(resumed.state().step, last.step);
        assert_eq!(resumed.state().best_loss, last.loss);
        assert_eq!(resumed.state().learning_rate, last.learning_rate);
        assert_eq!(restored.state_dict(), model.state_dict());
    }

    #[test]
    fn test_evaluate_triplets() {
        let mut model = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(0)).unwrap();
        let mut sampler = TripletSampler::new(blobs(3), StdRng::seed_from_u64(2)).unwrap();
        let result = evaluate_triplets(model.as_mut(), &mut sampler, 4, 1.0).unwrap();
        assert_eq!(result.triplets, 9);
        assert!(result.loss >= 0.0);
        assert!((0.0..=1.0).contains(&result.accuracy));
    }
}
