use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::{seq::SliceRandom, Rng};
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{SiameseError, SiameseResult},
    tensor::{Shape, Tensor},
};

/// Default number of random draws per positive or negative search
pub const DEFAULT_MAX_RETRIES: usize = 1000;

/// Base trait for all datasets
pub trait Dataset: Send + Sync {
    /// Get the length of the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get an item at the specified index
    fn get(&self, index: usize) -> SiameseResult<LabeledExample>;

    /// Label of an item, without materializing its input
    fn label(&self, index: usize) -> SiameseResult<usize> {
        Ok(self.get(index)?.label)
    }

    /// Shape of a single input, without the batch dimension
    fn input_shape(&self) -> Shape;

    /// Stack several items into one batch
    fn get_batch(&self, indices: &[usize]) -> SiameseResult<Batch> {
        let items = indices
            .iter()
            .map(|&index| self.get(index))
            .collect::<SiameseResult<Vec<_>>>()?;
        let inputs: Vec<&Tensor> = items.iter().map(|item| &item.input).collect();
        Ok(Batch {
            inputs: Tensor::stack(&inputs)?,
            labels: items.iter().map(|item| item.label).collect(),
        })
    }
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> SiameseResult<LabeledExample> {
        (**self).get(index)
    }

    fn label(&self, index: usize) -> SiameseResult<usize> {
        (**self).label(index)
    }

    fn input_shape(&self) -> Shape {
        (**self).input_shape()
    }

    fn get_batch(&self, indices: &[usize]) -> SiameseResult<Batch> {
        (**self).get_batch(indices)
    }
}

/// One input with its integer class label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledExample {
    pub input: Tensor,
    pub label: usize,
}

impl LabeledExample {
    pub fn new(input: Tensor, label: usize) -> Self {
        Self { input, label }
    }
}

/// Stacked inputs `[batch, ...]` with one label per row
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// In-memory dataset
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    examples: Vec<LabeledExample>,
    input_shape: Shape,
}

impl InMemoryDataset {
    /// Every example must share one input shape
    pub fn new(examples: Vec<LabeledExample>) -> SiameseResult<Self> {
        let input_shape = examples
            .first()
            .map(|example| example.input.shape().clone())
            .ok_or_else(|| SiameseError::InvalidData("Dataset has no examples".to_string()))?;
        if let Some(bad) = examples.iter().find(|e| e.input.shape() != &input_shape) {
            return Err(SiameseError::shape_error(
                &input_shape.to_string(),
                &bad.input.shape().to_string(),
                Some("every example in a dataset must share one input shape"),
            ));
        }
        Ok(Self { examples, input_shape })
    }

    /// Build from a flat `[count * example_len]` buffer and matching labels
    pub fn from_flat(data: Vec<f32>, labels: Vec<usize>, input_shape: Shape) -> SiameseResult<Self> {
        let example_len = input_shape.total_elements();
        if example_len == 0 || data.len() != labels.len() * example_len {
            return Err(SiameseError::InvalidData(format!(
                "{} values cannot be split into {} examples of shape {}",
                data.len(),
                labels.len(),
                input_shape
            )));
        }
        let examples = data
            .chunks(example_len)
            .zip(labels)
            .map(|(chunk, label)| {
                Tensor::from_vec(chunk.to_vec(), input_shape.clone()).map(|input| LabeledExample::new(input, label))
            })
            .collect::<SiameseResult<Vec<_>>>()?;
        Self::new(examples)
    }

    pub fn labels(&self) -> Vec<usize> {
        self.examples.iter().map(|e| e.label).collect()
    }

    /// Number of distinct labels
    pub fn num_classes(&self) -> usize {
        label_counts(self.examples.iter().map(|e| e.label)).len()
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.examples.len()
    }

    fn get(&self, index: usize) -> SiameseResult<LabeledExample> {
        self.examples
            .get(index)
            .cloned()
            .ok_or(SiameseError::IndexOutOfRange { index, len: self.examples.len() })
    }

    fn label(&self, index: usize) -> SiameseResult<usize> {
        self.examples
            .get(index)
            .map(|e| e.label)
            .ok_or(SiameseError::IndexOutOfRange { index, len: self.examples.len() })
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }
}

fn label_counts(labels: impl Iterator<Item = usize>) -> BTreeMap<usize, usize> {
    let mut counts = BTreeMap::new();
    for label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    counts
}

/// Anchor, positive and negative inputs drawn for one dataset index
#[derive(Debug, Clone, PartialEq)]
pub struct Triplet {
    pub anchor: Tensor,
    pub positive: Tensor,
    pub negative: Tensor,
    pub label: usize,
    pub positive_index: usize,
    pub negative_index: usize,
}

/// A batch of triplets, each role stacked to `[batch, ...]`
#[derive(Debug, Clone, PartialEq)]
pub struct TripletBatch {
    pub anchor: Tensor,
    pub positive: Tensor,
    pub negative: Tensor,
}

impl TripletBatch {
    pub fn len(&self) -> usize {
        self.anchor.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Anchor, positive and negative rows concatenated into one `3 * batch` tensor
    pub fn concatenated(&self) -> SiameseResult<Tensor> {
        Tensor::concat_rows(&[&self.anchor, &self.positive, &self.negative])
    }
}

/// Draws `(anchor, positive, negative)` triples by rejection sampling.
///
/// The anchor at index `i` is always `dataset[i]`. Positive and negative
/// indices are drawn uniformly until the label condition holds, at most
/// `max_retries` times each. The positive may be the anchor itself.
#[derive(Debug)]
pub struct TripletSampler<D, R> {
    dataset: D,
    rng: R,
    labels: Vec<usize>,
    label_counts: BTreeMap<usize, usize>,
    max_retries: usize,
}

impl<D: Dataset, R: Rng> TripletSampler<D, R> {
    pub fn new(dataset: D, rng: R) -> SiameseResult<Self> {
        let labels = (0..dataset.len())
            .map(|index| dataset.label(index))
            .collect::<SiameseResult<Vec<_>>>()?;
        let label_counts = label_counts(labels.iter().copied());
        if label_counts.len() < 2 {
            warn!(
                "dataset has {} distinct label(s); negatives cannot be drawn",
                label_counts.len()
            );
        }
        Ok(Self {
            dataset,
            rng,
            labels,
            label_counts,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> SiameseResult<Self> {
        if max_retries == 0 {
            return Err(SiameseError::ConfigurationError(
                "max_retries must be at least 1".to_string(),
            ));
        }
        self.max_retries = max_retries;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Number of distinct labels seen at construction
    pub fn num_labels(&self) -> usize {
        self.label_counts.len()
    }

    /// Draw a triplet for the anchor at `index`
    pub fn get(&mut self, index: usize) -> SiameseResult<Triplet> {
        let len = self.labels.len();
        let label = *self
            .labels
            .get(index)
            .ok_or(SiameseError::IndexOutOfRange { index, len })?;

        let positive_index = self.draw("positive", label, |l| l == label)?;
        let negative_index = self.draw("negative", label, |l| l != label)?;

        Ok(Triplet {
            anchor: self.dataset.get(index)?.input,
            positive: self.dataset.get(positive_index)?.input,
            negative: self.dataset.get(negative_index)?.input,
            label,
            positive_index,
            negative_index,
        })
    }

    /// Draw triplets for several anchors and stack each role
    pub fn get_batch(&mut self, indices: &[usize]) -> SiameseResult<TripletBatch> {
        let triplets = indices
            .iter()
            .map(|&index| self.get(index))
            .collect::<SiameseResult<Vec<_>>>()?;
        let anchors: Vec<&Tensor> = triplets.iter().map(|t| &t.anchor).collect();
        let positives: Vec<&Tensor> = triplets.iter().map(|t| &t.positive).collect();
        let negatives: Vec<&Tensor> = triplets.iter().map(|t| &t.negative).collect();
        Ok(TripletBatch {
            anchor: Tensor::stack(&anchors)?,
            positive: Tensor::stack(&positives)?,
            negative: Tensor::stack(&negatives)?,
        })
    }

    fn draw(
        &mut self,
        role: &'static str,
        label: usize,
        accept: impl Fn(usize) -> bool,
    ) -> SiameseResult<usize> {
        let candidates: usize = self
            .label_counts
            .iter()
            .filter(|&(&l, _)| accept(l))
            .map(|(_, &count)| count)
            .sum();
        if candidates == 0 {
            return Err(SiameseError::LabelNotFound { role, label, attempts: 0 });
        }

        let len = self.labels.len();
        for attempt in 1..=self.max_retries {
            let candidate = self.rng.gen_range(0..len);
            if accept(self.labels[candidate]) {
                if past_half_budget(attempt, self.max_retries) {
                    warn!(role, label, attempt, budget = self.max_retries, "triplet draw used over half its retry budget");
                }
                return Ok(candidate);
            }
        }
        Err(SiameseError::LabelNotFound {
            role,
            label,
            attempts: self.max_retries,
        })
    }
}

fn past_half_budget(attempt: usize, budget: usize) -> bool {
    attempt * 2 > budget
}

/// Splits `0..len` into batches of indices for one epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSampler {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl BatchSampler {
    pub fn new(batch_size: usize) -> SiameseResult<Self> {
        if batch_size == 0 {
            return Err(SiameseError::ConfigurationError("batch_size must be at least 1".to_string()));
        }
        Ok(Self {
            batch_size,
            shuffle: false,
            drop_last: false,
        })
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Index batches for one pass over `len` items
    pub fn plan<R: Rng + ?Sized>(&self, len: usize, rng: &mut R) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..len).collect();
        if self.shuffle {
            indices.shuffle(rng);
        }
        indices
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Number of batches `plan` yields for `len` items
    pub fn num_batches(&self, len: usize) -> usize {
        if self.drop_last {
            len / self.batch_size
        } else {
            (len + self.batch_size - 1) / self.batch_size
        }
    }
}

/// Data loader yielding stacked batches in a fixed or shuffled order
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    sampler: BatchSampler,
}

impl DataLoader {
    pub fn new(dataset: Arc<dyn Dataset>, batch_size: usize) -> SiameseResult<Self> {
        Ok(Self {
            dataset,
            sampler: BatchSampler::new(batch_size)?,
        })
    }

    /// Batch with an existing sampler's size, shuffle and drop-last settings
    pub fn with_sampler(dataset: Arc<dyn Dataset>, sampler: BatchSampler) -> Self {
        Self { dataset, sampler }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.sampler = self.sampler.with_shuffle(shuffle);
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.sampler = self.sampler.with_drop_last(drop_last);
        self
    }

    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.sampler.batch_size
    }

    pub fn num_batches(&self) -> usize {
        self.sampler.num_batches(self.dataset.len())
    }

    /// Iterate one epoch; the order is fixed when the iterator is created
    pub fn iter<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIter<'_> {
        DataLoaderIter {
            dataset: self.dataset.as_ref(),
            batches: self.sampler.plan(self.dataset.len(), rng).into_iter(),
        }
    }
}

/// Iterator for data loader
pub struct DataLoaderIter<'a> {
    dataset: &'a dyn Dataset,
    batches: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = SiameseResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        Some(self.dataset.get_batch(&indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// Which MNIST split to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MnistSplit {
    Train,
    Test,
}

impl MnistSplit {
    /// Whether both IDX files of this split exist in `dir`
    pub fn is_present(self, dir: &Path) -> bool {
        let (images, labels) = self.file_names();
        dir.join(images).is_file() && dir.join(labels).is_file()
    }

    fn file_names(self) -> (&'static str, &'static str) {
        match self {
            MnistSplit::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
            MnistSplit::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
        }
    }
}

fn read_be_u32(data: &[u8], offset: &mut usize, path: &Path) -> SiameseResult<u32> {
    let bytes = data
        .get(*offset..*offset + 4)
        .ok_or_else(|| SiameseError::InvalidData(format!("{}: truncated IDX header", path.display())))?;
    *offset += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read an IDX3 image file, scaling bytes to `[0, 1]`.
///
/// Returns the flat pixel buffer and the per-image shape `[1, rows, cols]`.
pub fn read_idx_images(path: &Path, limit: Option<usize>) -> SiameseResult<(Vec<f32>, Shape)> {
    let data = fs::read(path)?;
    let mut offset = 0;
    let magic = read_be_u32(&data, &mut offset, path)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(SiameseError::InvalidData(format!(
            "{}: expected IDX image magic {:#010x}, found {:#010x}",
            path.display(),
            IDX_IMAGES_MAGIC,
            magic
        )));
    }
    let total = read_be_u32(&data, &mut offset, path)? as usize;
    let rows = read_be_u32(&data, &mut offset, path)? as usize;
    let cols = read_be_u32(&data, &mut offset, path)? as usize;

    let count = limit.map_or(total, |limit| limit.min(total));
    let end = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .and_then(|bytes| bytes.checked_add(offset))
        .ok_or_else(|| {
            SiameseError::InvalidData(format!("{}: image header dimensions overflow", path.display()))
        })?;
    let pixels = data
        .get(offset..end)
        .ok_or_else(|| SiameseError::InvalidData(format!("{}: image data is truncated", path.display())))?;
    let images = pixels.iter().map(|&b| b as f32 / 255.0).collect();
    Ok((images, Shape::new([1, rows, cols])))
}

/// Read an IDX1 label file
pub fn read_idx_labels(path: &Path, limit: Option<usize>) -> SiameseResult<Vec<usize>> {
    let data = fs::read(path)?;
    let mut offset = 0;
    let magic = read_be_u32(&data, &mut offset, path)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(SiameseError::InvalidData(format!(
            "{}: expected IDX label magic {:#010x}, found {:#010x}",
            path.display(),
            IDX_LABELS_MAGIC,
            magic
        )));
    }
    let total = read_be_u32(&data, &mut offset, path)? as usize;
    let count = limit.map_or(total, |limit| limit.min(total));
    let labels = data
        .get(offset..offset + count)
        .ok_or_else(|| SiameseError::InvalidData(format!("{}: label data is truncated", path.display())))?;
    Ok(labels.iter().map(|&b| b as usize).collect())
}

/// Load an MNIST split from the standard IDX files in `dir`
pub fn load_mnist(dir: &Path, split: MnistSplit, limit: Option<usize>) -> SiameseResult<InMemoryDataset> {
    let (images_name, labels_name) = split.file_names();
    let images_path: PathBuf = dir.join(images_name);
    let labels_path: PathBuf = dir.join(labels_name);

    let (images, shape) = read_idx_images(&images_path, limit)?;
    let labels = read_idx_labels(&labels_path, limit)?;
    let image_count = images.len() / shape.total_elements().max(1);
    if image_count != labels.len() {
        return Err(SiameseError::InvalidData(format!(
            "{} images but {} labels in {}",
            image_count,
            labels.len(),
            dir.display()
        )));
    }
    info!(split = ?split, examples = labels.len(), "loaded MNIST");
    InMemoryDataset::from_flat(images, labels, shape)
}

/// Gaussian clusters shaped like images, one cluster per class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticBlobs {
    pub num_classes: usize,
    pub samples_per_class: usize,
    pub noise_std: f32,
    pub input_shape: Vec<usize>,
}

impl Default for SyntheticBlobs {
    fn default() -> Self {
        Self {
            num_classes: 10,
            samples_per_class: 20,
            noise_std: 0.1,
            input_shape: vec![1, 28, 28],
        }
    }
}

impl SyntheticBlobs {
    /// Class centers are uniform in `[0, 1]`; examples are interleaved by class
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> SiameseResult<InMemoryDataset> {
        let centers = self.centers(rng)?;
        self.sample(&centers, rng)
    }

    /// Like [`SyntheticBlobs::generate`], drawing centers and noise from separate sources.
    ///
    /// Two datasets built from equally seeded `centers` sources share their
    /// classes, which is how a matching train/test pair is produced.
    pub fn generate_with<C: Rng + ?Sized, N: Rng + ?Sized>(
        &self,
        centers: &mut C,
        noise: &mut N,
    ) -> SiameseResult<InMemoryDataset> {
        let centers = self.centers(centers)?;
        self.sample(&centers, noise)
    }

    fn shape(&self) -> SiameseResult<Shape> {
        if self.num_classes == 0 || self.samples_per_class == 0 {
            return Err(SiameseError::ConfigurationError(
                "synthetic data needs at least one class and one sample per class".to_string(),
            ));
        }
        let shape = Shape::new(self.input_shape.clone());
        if !shape.is_valid() {
            return Err(SiameseError::ConfigurationError(format!("invalid synthetic input shape {}", shape)));
        }
        Ok(shape)
    }

    fn centers<R: Rng + ?Sized>(&self, rng: &mut R) -> SiameseResult<Vec<Vec<f32>>> {
        let len = self.shape()?.total_elements();
        let unit = Uniform::new(0.0f32, 1.0);
        Ok((0..self.num_classes)
            .map(|_| (0..len).map(|_| unit.sample(rng)).collect())
            .collect())
    }

    fn sample<R: Rng + ?Sized>(&self, centers: &[Vec<f32>], rng: &mut R) -> SiameseResult<InMemoryDataset> {
        let shape = self.shape()?;
        let noise = Normal::new(0.0f32, self.noise_std)
            .map_err(|e| SiameseError::ConfigurationError(format!("invalid noise_std {}: {}", self.noise_std, e)))?;

        let mut examples = Vec::with_capacity(self.num_classes * self.samples_per_class);
        for _ in 0..self.samples_per_class {
            for (label, center) in centers.iter().enumerate() {
                let data = center.iter().map(|&c| c + noise.sample(rng)).collect();
                examples.push(LabeledExample::new(Tensor::from_vec(data, shape.clone())?, label));
            }
        }
        debug!(
            classes = self.num_classes,
            examples = examples.len(),
            "generated synthetic blobs"
        );
        InMemoryDataset::new(examples)
    }
}
