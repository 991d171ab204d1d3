use std::fs;
use std::path::Path;

use siamese::{
    api,
    config::ConfigBuilder,
    data::{MnistSplit, SyntheticBlobs},
    nn::{LossKind, ModelKind, PairMining},
    training::{CheckpointFormat, CheckpointManager},
    Dataset, SiameseConfig, SiameseError,
};
use tempfile::tempdir;

fn small_blobs() -> SyntheticBlobs {
    SyntheticBlobs {
        num_classes: 3,
        samples_per_class: 4,
        noise_std: 0.05,
        input_shape: vec![1, 28, 28],
    }
}

fn config(epochs: usize) -> SiameseConfig {
    ConfigBuilder::new()
        .training(|t| {
            t.epochs = epochs;
            t.batch_size = 4;
            t.seed = 7;
        })
        .data(|d| d.synthetic = small_blobs())
        .build()
        .unwrap()
}

/// Writes `count` 28x28 images whose pixels all equal their label, in IDX format
fn write_idx_split(dir: &Path, split: MnistSplit, labels: &[u8]) {
    let (images_name, labels_name) = match split {
        MnistSplit::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
        MnistSplit::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
    };

    let mut images = Vec::new();
    for word in [0x0803u32, labels.len() as u32, 28, 28] {
        images.extend_from_slice(&word.to_be_bytes());
    }
    for &label in labels {
        images.extend(std::iter::repeat(label * 80).take(28 * 28));
    }
    fs::write(dir.join(images_name), images).unwrap();

    let mut label_bytes = Vec::new();
    for word in [0x0801u32, labels.len() as u32] {
        label_bytes.extend_from_slice(&word.to_be_bytes());
    }
    label_bytes.extend_from_slice(labels);
    fs::write(dir.join(labels_name), label_bytes).unwrap();
}

#[test]
fn test_train_triplet_on_synthetic_data() {
    let run = api::train(&config(3)).unwrap();

    assert_eq!(run.epochs.len(), 3);
    assert!(run.epochs.iter().all(|e| e.train_loss >= 0.0 && e.train_loss.is_finite()));
    let evaluation = run.evaluation.unwrap();
    assert_eq!(evaluation.triplets, 12);
    assert!(evaluation.accuracy > 0.5);
    assert_eq!(run.model.kind(), ModelKind::Mlp);
}

#[test]
fn test_train_contrastive_on_synthetic_data() {
    let mut config = config(2);
    config.loss.kind = LossKind::Contrastive;
    config.loss.pair_mining = PairMining::LabelAware;

    let run = api::train(&config).unwrap();
    assert_eq!(run.epochs.len(), 2);
    assert!(run.epochs.iter().all(|e| e.train_loss.is_finite()));
}

#[test]
fn test_train_conv_model() {
    let mut config = config(1);
    config.model.kind = ModelKind::Conv;
    config.data.synthetic.samples_per_class = 2;

    let run = api::train(&config).unwrap();
    assert_eq!(run.model.kind(), ModelKind::Conv);
    assert_eq!(run.evaluation.unwrap().triplets, 6);
}

#[test]
fn test_synthetic_splits_share_classes() {
    let config = config(1);
    let train = api::load_dataset(&config, MnistSplit::Train).unwrap();
    let test = api::load_dataset(&config, MnistSplit::Test).unwrap();
    assert_eq!(train.len(), test.len());

    let a = train.get(0).unwrap();
    let b = test.get(0).unwrap();
    assert_eq!(a.label, b.label);
    assert_ne!(a.input, b.input);
    let gap = a.input.sub(&b.input).unwrap().row_norms()[0];
    assert!(gap < 5.0);
}

#[test]
fn test_checkpoint_saved_and_evaluated() {
    for format in [CheckpointFormat::Json, CheckpointFormat::Bincode] {
        let dir = tempdir().unwrap();
        let mut config = config(3);
        config.checkpoint.enabled = true;
        config.checkpoint.dir = dir.path().to_path_buf();
        config.checkpoint.format = format;
        config.checkpoint.keep = 2;

        let run = api::train(&config).unwrap();

        let manager = CheckpointManager::new(dir.path()).with_format(format);
        let names = manager.list_checkpoints().unwrap();
        assert!(names.contains(&"best".to_string()));
        assert_eq!(names.iter().filter(|n| n.starts_with("epoch_")).count(), 2);

        // same test split and seed as the training run's own evaluation
        let best = manager.path_for("best");
        let evaluation = api::evaluate_checkpoint(&config, &best).unwrap();
        assert_eq!(Some(evaluation.triplets), run.evaluation.map(|e| e.triplets));
        assert!(evaluation.loss.is_finite());
    }
}

#[test]
fn test_train_on_idx_files() {
    let dir = tempdir().unwrap();
    write_idx_split(dir.path(), MnistSplit::Train, &[0, 1, 2, 0, 1, 2, 0, 1]);
    write_idx_split(dir.path(), MnistSplit::Test, &[2, 1, 0, 2]);

    let mut config = config(2);
    config.data.data_dir = Some(dir.path().to_path_buf());

    let train = api::load_dataset(&config, MnistSplit::Train).unwrap();
    assert_eq!(train.len(), 8);
    assert_eq!(train.label(2).unwrap(), 2);
    assert_eq!(train.get(1).unwrap().input.as_slice()[0], 80.0 / 255.0);

    let run = api::train(&config).unwrap();
    assert_eq!(run.evaluation.unwrap().triplets, 4);

    config.data.limit = Some(3);
    assert_eq!(api::load_dataset(&config, MnistSplit::Train).unwrap().len(), 3);
}

#[test]
fn test_train_only_data_dir_skips_evaluation() {
    let dir = tempdir().unwrap();
    write_idx_split(dir.path(), MnistSplit::Train, &[0, 1, 2, 0, 1, 2]);
    assert!(MnistSplit::Train.is_present(dir.path()));
    assert!(!MnistSplit::Test.is_present(dir.path()));

    let mut config = config(1);
    config.data.data_dir = Some(dir.path().to_path_buf());
    let run = api::train(&config).unwrap();
    assert_eq!(run.epochs.len(), 1);
    assert!(run.evaluation.is_none());
}

#[test]
fn test_missing_data_dir_is_an_io_error() {
    let dir = tempdir().unwrap();
    let mut config = config(1);
    config.data.data_dir = Some(dir.path().join("absent"));
    assert!(matches!(api::train(&config), Err(SiameseError::IoError(_))));
}

#[test]
fn test_single_class_triplet_training_fails() {
    let mut config = config(1);
    config.data.synthetic.num_classes = 1;
    assert!(matches!(
        api::train(&config),
        Err(SiameseError::LabelNotFound { role: "negative", .. })
    ));
}
