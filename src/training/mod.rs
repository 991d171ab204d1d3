//! Training infrastructure
//!
//! This module provides:
//! - A synchronous trainer for triplet and contrastive objectives
//! - SGD and Adam optimizers
//! - Epoch callbacks and early stopping
//! - Training metrics
//! - Checkpointing and resumption

pub mod trainer;
pub mod optimizers;
pub mod metrics;
pub mod checkpoints;

pub use trainer::{evaluate_triplets, loss_history, EvaluationResult, Trainer, TrainingState};
pub use optimizers::{Adam, Optimizer, OptimizerConfig, Sgd};
pub use metrics::{MetricTracker, RunningMean, TrainingMetrics};
pub use checkpoints::{Checkpoint, CheckpointFormat, CheckpointManager, CHECKPOINT_FORMAT_VERSION};

use std::time::Duration;

use tracing::info;

use crate::error::SiameseResult;

/// Outcome of one training epoch
#[derive(Debug, Clone)]
pub struct EpochResult {
    pub epoch: usize,
    pub step: usize,
    pub train_loss: f32,
    pub skipped_batches: usize,
    pub duration: Duration,
    pub metrics: TrainingMetrics,
}

/// Whether training should go on after a callback ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Training callbacks for custom behavior during training
pub trait TrainingCallback: Send {
    /// Called at the start of training
    fn on_train_start(&mut self, _state: &TrainingState) -> SiameseResult<()> {
        Ok(())
    }

    /// Called at the end of training
    fn on_train_end(&mut self, _state: &TrainingState) -> SiameseResult<()> {
        Ok(())
    }

    /// Called at the end of each epoch
    fn on_epoch_end(&mut self, result: &EpochResult, state: &TrainingState) -> SiameseResult<CallbackAction>;
}

/// Early stopping callback
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    best_loss: f32,
    wait_count: usize,
    stopped: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best_loss: f32::INFINITY,
            wait_count: 0,
            stopped: false,
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stopped
    }
}

impl TrainingCallback for EarlyStopping {
    fn on_epoch_end(&mut self, result: &EpochResult, _state: &TrainingState) -> SiameseResult<CallbackAction> {
        if result.train_loss < self.best_loss - self.min_delta {
            self.best_loss = result.train_loss;
            self.wait_count = 0;
        } else {
            self.wait_count += 1;
            if self.wait_count >= self.patience {
                self.stopped = true;
                info!(
                    patience = self.patience,
                    best_loss = self.best_loss,
                    "early stopping triggered"
                );
            }
        }
        Ok(if self.stopped {
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        })
    }
}
