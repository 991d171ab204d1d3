//! Checkpoint management for training

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{SiameseError, SiameseResult},
    nn::{EmbeddingModel, ModelKind},
    tensor::Tensor,
    training::metrics::TrainingMetrics,
};

/// Version written into every checkpoint
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Prefix of periodic checkpoints, which are subject to cleanup
const PERIODIC_PREFIX: &str = "epoch_";

/// On-disk encoding of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointFormat {
    #[default]
    Json,
    Bincode,
}

impl CheckpointFormat {
    pub fn extension(self) -> &'static str {
        match self {
            CheckpointFormat::Json => "json",
            CheckpointFormat::Bincode => "bin",
        }
    }

    fn from_path(path: &Path) -> SiameseResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(CheckpointFormat::Json),
            Some("bin") => Ok(CheckpointFormat::Bincode),
            _ => Err(SiameseError::InvalidInput(format!(
                "Cannot infer checkpoint format of {}",
                path.display()
            ))),
        }
    }
}

impl Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointFormat::Json => write!(f, "json"),
            CheckpointFormat::Bincode => write!(f, "bincode"),
        }
    }
}

impl FromStr for CheckpointFormat {
    type Err = SiameseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(CheckpointFormat::Json),
            "bincode" | "bin" => Ok(CheckpointFormat::Bincode),
            other => Err(SiameseError::InvalidInput(format!("Unknown checkpoint format: {}", other))),
        }
    }
}

/// Training checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub model_kind: ModelKind,
    pub model_state: BTreeMap<String, Tensor>,
    pub epoch: usize,
    pub step: usize,
    pub loss: f32,
    pub learning_rate: f32,
    pub metrics: TrainingMetrics,
}

impl Checkpoint {
    /// Snapshot the model's parameters
    pub fn from_model(
        model: &mut dyn EmbeddingModel,
        epoch: usize,
        step: usize,
        loss: f32,
        learning_rate: f32,
    ) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            model_kind: model.kind(),
            model_state: model.state_dict(),
            epoch,
            step,
            loss,
            learning_rate,
            metrics: TrainingMetrics::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: TrainingMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build a fresh model of the recorded kind and load the parameters into it
    pub fn build_model(&self) -> SiameseResult<Box<dyn EmbeddingModel>> {
        use rand::{rngs::StdRng, SeedableRng};
        // initial weights are overwritten by the load below
        let mut model = self.model_kind.build(&mut StdRng::seed_from_u64(0))?;
        self.restore(model.as_mut())?;
        Ok(model)
    }

    /// Copy the stored parameters into an existing model of the same kind
    pub fn restore(&self, model: &mut dyn EmbeddingModel) -> SiameseResult<()> {
        if model.kind() != self.model_kind {
            return Err(SiameseError::InvalidData(format!(
                "Checkpoint holds a {} model, cannot restore into {}",
                self.model_kind,
                model.kind()
            )));
        }
        model.load_state_dict(&self.model_state)
    }

    fn check_version(&self) -> SiameseResult<()> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(SiameseError::InvalidData(format!(
                "Unsupported checkpoint format version {} (expected {})",
                self.format_version, CHECKPOINT_FORMAT_VERSION
            )));
        }
        Ok(())
    }

    /// Write to `path`, choosing the encoding from its extension
    pub fn save(&self, path: &Path) -> SiameseResult<()> {
        let bytes = match CheckpointFormat::from_path(path)? {
            CheckpointFormat::Json => serde_json::to_vec_pretty(self)?,
            CheckpointFormat::Bincode => bincode::serialize(self)?,
        };
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Read from `path`, choosing the decoding from its extension
    pub fn load(path: &Path) -> SiameseResult<Self> {
        let bytes = fs::read(path)?;
        let checkpoint: Checkpoint = match CheckpointFormat::from_path(path)? {
            CheckpointFormat::Json => serde_json::from_slice(&bytes)?,
            CheckpointFormat::Bincode => bincode::deserialize(&bytes)?,
        };
        checkpoint.check_version()?;
        Ok(checkpoint)
    }
}

/// Checkpoint manager
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    format: CheckpointFormat,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            format: CheckpointFormat::Json,
            max_checkpoints: 5,
        }
    }

    pub fn with_format(mut self, format: CheckpointFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_max_checkpoints(mut self, max_checkpoints: usize) -> Self {
        self.max_checkpoints = max_checkpoints;
        self
    }

    /// Name used for the periodic checkpoint of `epoch`
    pub fn periodic_name(epoch: usize) -> String {
        format!("{}{:04}", PERIODIC_PREFIX, epoch)
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.{}", name, self.format.extension()))
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint, name: &str) -> SiameseResult<PathBuf> {
        fs::create_dir_all(&self.checkpoint_dir)?;
        let path = self.path_for(name);
        checkpoint.save(&path)?;
        info!(path = %path.display(), epoch = checkpoint.epoch, loss = checkpoint.loss, "saved checkpoint");
        Ok(path)
    }

    pub fn load_checkpoint(&self, name: &str) -> SiameseResult<Checkpoint> {
        let path = self.path_for(name);
        let checkpoint = Checkpoint::load(&path)?;
        debug!(path = %path.display(), "loaded checkpoint");
        Ok(checkpoint)
    }

    /// Names (without extension) of checkpoints in this manager's format, sorted
    pub fn list_checkpoints(&self) -> SiameseResult<Vec<String>> {
        let mut checkpoints = Vec::new();
        if !self.checkpoint_dir.exists() {
            return Ok(checkpoints);
        }
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.format.extension()) {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                checkpoints.push(name.to_string());
            }
        }
        checkpoints.sort();
        Ok(checkpoints)
    }

    /// Keep only the newest `max_checkpoints` periodic checkpoints; named ones such as `best` are never removed
    pub fn cleanup_old_checkpoints(&self) -> SiameseResult<usize> {
        let periodic: Vec<String> = self
            .list_checkpoints()?
            .into_iter()
            .filter(|name| name.starts_with(PERIODIC_PREFIX))
            .collect();
        if periodic.len() <= self.max_checkpoints {
            return Ok(0);
        }
        let excess = periodic.len() - self.max_checkpoints;
        for name in &periodic[..excess] {
            let path = self.path_for(name);
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "removed old checkpoint");
        }
        Ok(excess)
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn format(&self) -> CheckpointFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn checkpoint(kind: ModelKind, epoch: usize) -> Checkpoint {
        let mut model = kind.build(&mut StdRng::seed_from_u64(epoch as u64)).unwrap();
        Checkpoint::from_model(model.as_mut(), epoch, epoch * 10, 0.5, 1e-3)
    }

    #[test]
    fn test_json_and_bincode_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        for format in [CheckpointFormat::Json, CheckpointFormat::Bincode] {
            let manager = CheckpointManager::new(dir.path()).with_format(format);
            let original = checkpoint(ModelKind::Mlp, 3);
            let path = manager.save_checkpoint(&original, "best").unwrap();
            assert_eq!(path.extension().unwrap(), format.extension());
            let loaded = manager.load_checkpoint("best").unwrap();
            assert_eq!(loaded, original);
        }
    }

    #[test]
    fn test_restore_into_model() {
        let saved = checkpoint(ModelKind::Conv, 1);
        let mut model = ModelKind::Conv.build(&mut StdRng::seed_from_u64(99)).unwrap();
        saved.restore(model.as_mut()).unwrap();
        assert_eq!(model.state_dict(), saved.model_state);

        let mut rebuilt = saved.build_model().unwrap();
        assert_eq!(rebuilt.state_dict(), saved.model_state);

        let mut other = ModelKind::Mlp.build(&mut StdRng::seed_from_u64(0)).unwrap();
        assert!(saved.restore(other.as_mut()).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut stale = checkpoint(ModelKind::Mlp, 0);
        stale.format_version = 7;
        let path = dir.path().join("stale.json");
        stale.save(&path).unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(SiameseError::InvalidData(_))));
        assert!(Checkpoint::load(&dir.path().join("x.ckpt")).is_err());
    }

    #[test]
    fn test_cleanup_keeps_newest_periodic() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path()).with_max_checkpoints(2);
        let ckpt = checkpoint(ModelKind::Mlp, 0);
        for epoch in 0..4 {
            manager.save_checkpoint(&ckpt, &CheckpointManager::periodic_name(epoch)).unwrap();
        }
        manager.save_checkpoint(&ckpt, "best").unwrap();

        assert_eq!(manager.cleanup_old_checkpoints().unwrap(), 2);
        assert_eq!(
            manager.list_checkpoints().unwrap(),
            vec!["best".to_string(), "epoch_0002".to_string(), "epoch_0003".to_string()]
        );
    }
}
