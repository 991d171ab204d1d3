//! Configuration management for training runs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    data::{SyntheticBlobs, DEFAULT_MAX_RETRIES},
    error::{SiameseError, SiameseResult},
    nn::{validate_margin, LossKind, ModelKind, PairMining, DEFAULT_MARGIN},
    training::{CheckpointFormat, OptimizerConfig},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub optimizer: OptimizerConfig,
    pub seed: u64,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Log every N steps
    pub log_frequency: usize,
    pub early_stopping_patience: Option<usize>,
    pub early_stopping_min_delta: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 64,
            learning_rate: 1e-3,
            optimizer: OptimizerConfig::default(),
            seed: 42,
            shuffle: true,
            drop_last: false,
            log_frequency: 100,
            early_stopping_patience: None,
            early_stopping_min_delta: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub kind: LossKind,
    pub margin: f32,
    pub pair_mining: PairMining,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            kind: LossKind::Triplet,
            margin: DEFAULT_MARGIN,
            pair_mining: PairMining::LabelAware,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub max_retries: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: ModelKind,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { kind: ModelKind::Mlp }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the MNIST IDX files; synthetic data is used when unset
    pub data_dir: Option<PathBuf>,
    /// Cap on the number of examples read per split
    pub limit: Option<usize>,
    pub synthetic: SyntheticBlobs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub format: CheckpointFormat,
    /// Save a periodic checkpoint every N epochs
    pub frequency: usize,
    /// Periodic checkpoints to keep on disk
    pub keep: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("checkpoints"),
            format: CheckpointFormat::Json,
            frequency: 1,
            keep: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiameseConfig {
    pub training: TrainingConfig,
    pub loss: LossConfig,
    pub sampler: SamplerConfig,
    pub model: ModelConfig,
    pub data: DataConfig,
    pub checkpoint: CheckpointConfig,
}

impl SiameseConfig {
    /// Reject settings no training run could use
    pub fn validate(&self) -> SiameseResult<()> {
        let training = &self.training;
        if training.epochs == 0 {
            return Err(SiameseError::ConfigurationError("training.epochs must be at least 1".to_string()));
        }
        if training.batch_size == 0 {
            return Err(SiameseError::ConfigurationError("training.batch_size must be at least 1".to_string()));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(SiameseError::ConfigurationError(format!(
                "training.learning_rate must be positive, got {}",
                training.learning_rate
            )));
        }
        training.optimizer.validate()?;
        validate_margin(self.loss.margin)?;
        if self.sampler.max_retries == 0 {
            return Err(SiameseError::ConfigurationError("sampler.max_retries must be at least 1".to_string()));
        }
        if self.checkpoint.enabled && self.checkpoint.frequency == 0 {
            return Err(SiameseError::ConfigurationError("checkpoint.frequency must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> SiameseResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SiameseConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> SiameseResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Configuration manager backed by an optional JSON file
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: SiameseConfig,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> SiameseResult<()> {
        self.config = SiameseConfig::from_file(path)?;
        self.config_file = Some(path.to_path_buf());
        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> SiameseResult<()> {
        self.config.to_file(path)?;
        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> SiameseConfig {
        self.config.clone()
    }

    /// Apply `f` and keep the result only if it validates; persists when a file is attached
    pub fn update_config<F>(&mut self, f: F) -> SiameseResult<()>
    where
        F: FnOnce(&mut SiameseConfig),
    {
        let mut updated = self.config.clone();
        f(&mut updated);
        updated.validate()?;
        self.config = updated;

        if let Some(ref path) = self.config_file {
            self.save_to_file(path)?;
        }
        Ok(())
    }

    pub fn set_config(&mut self, config: SiameseConfig) -> SiameseResult<()> {
        self.update_config(|current| *current = config)
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: Arc<RwLock<ConfigManager>> = Arc::new(RwLock::new(ConfigManager::new()));
}

/// Get the global configuration
pub fn get_config() -> SiameseConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> SiameseResult<()>
where
    F: FnOnce(&mut SiameseConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> SiameseResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Create a configuration builder for easy setup
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: SiameseConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn training(mut self, f: impl FnOnce(&mut TrainingConfig)) -> Self {
        f(&mut self.config.training);
        self
    }

    pub fn loss(mut self, f: impl FnOnce(&mut LossConfig)) -> Self {
        f(&mut self.config.loss);
        self
    }

    pub fn sampler(mut self, f: impl FnOnce(&mut SamplerConfig)) -> Self {
        f(&mut self.config.sampler);
        self
    }

    pub fn model(mut self, f: impl FnOnce(&mut ModelConfig)) -> Self {
        f(&mut self.config.model);
        self
    }

    pub fn data(mut self, f: impl FnOnce(&mut DataConfig)) -> Self {
        f(&mut self.config.data);
        self
    }

    pub fn checkpoint(mut self, f: impl FnOnce(&mut CheckpointConfig)) -> Self {
        f(&mut self.config.checkpoint);
        self
    }

    pub fn build(self) -> SiameseResult<SiameseConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn apply(self) -> SiameseResult<()> {
        let config = self.build()?;
        update_config(|current| *current = config)
    }
}
