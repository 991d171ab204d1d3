//! Embedding models
//!
//! Both networks map a batch of `[1, 28, 28]` images to 10-dimensional
//! embeddings. They are plain layer stacks: the forward pass caches what the
//! backward pass needs, and gradients flow back through the same stack in
//! reverse order.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{SiameseError, SiameseResult},
    nn::layers::{ConvLayer, DenseLayer},
    ops::{FlattenOp, Param, TensorOperation},
    tensor::{Shape, Tensor},
};

/// Per-example input shape shared by both models
pub const IMAGE_SHAPE: [usize; 3] = [1, 28, 28];

/// Dimension of the produced embeddings
pub const EMBEDDING_DIM: usize = 10;

/// Which embedding network to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// 784 → 256 → 64 → 10 fully connected stack
    Mlp,
    /// Two conv/pool blocks followed by a 784 → 10 projection
    Conv,
}

impl ModelKind {
    pub fn build<R: Rng + ?Sized>(self, rng: &mut R) -> SiameseResult<Box<dyn EmbeddingModel>> {
        Ok(match self {
            ModelKind::Mlp => Box::new(FeedForwardNet::mnist(rng)?),
            ModelKind::Conv => Box::new(ConvNet::mnist(rng)?),
        })
    }
}

impl Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Mlp => write!(f, "mlp"),
            ModelKind::Conv => write!(f, "conv"),
        }
    }
}

impl FromStr for ModelKind {
    type Err = SiameseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mlp" | "feedforward" | "dense" => Ok(ModelKind::Mlp),
            "conv" | "cnn" => Ok(ModelKind::Conv),
            other => Err(SiameseError::InvalidInput(format!("Unknown model kind: {}", other))),
        }
    }
}

/// A network mapping a batch of inputs to a batch of embeddings
pub trait EmbeddingModel: Debug + Send {
    fn kind(&self) -> ModelKind;

    /// Shape of one example, without the batch dimension
    fn input_shape(&self) -> Shape;

    fn embedding_dim(&self) -> usize;

    fn layers(&self) -> &[Box<dyn TensorOperation>];

    fn layers_mut(&mut self) -> &mut [Box<dyn TensorOperation>];

    /// Embed a `[batch, ...input_shape]` (or already flattened) batch
    fn forward(&mut self, batch: &Tensor) -> SiameseResult<Tensor> {
        let expected = self.input_shape();
        if batch.row_len() != expected.total_elements() || batch.rows() == 0 {
            return Err(SiameseError::shape_error(
                &format!("a non-empty batch of {} examples", expected),
                &batch.shape().to_string(),
                None,
            ));
        }
        let mut dims = vec![batch.rows()];
        dims.extend_from_slice(expected.as_slice());
        let mut output = batch.clone().reshape(Shape::new(dims))?;
        for layer in self.layers_mut() {
            output = layer.forward(&output)?;
        }
        Ok(output)
    }

    /// Back-propagate the gradient of the loss with respect to the embeddings
    fn backward(&mut self, grad_embeddings: &Tensor) -> SiameseResult<()> {
        let mut grad = grad_embeddings.clone();
        for layer in self.layers_mut().iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(())
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        self.layers_mut()
            .iter_mut()
            .flat_map(|layer| layer.parameters())
            .collect()
    }

    fn zero_grad(&mut self) {
        for layer in self.layers_mut() {
            layer.zero_grad();
        }
    }

    fn num_parameters(&mut self) -> usize {
        self.parameters().iter().map(|p| p.value.numel()).sum()
    }

    /// Named copy of every parameter, keyed `layers.{index}.{name}`
    fn state_dict(&mut self) -> BTreeMap<String, Tensor> {
        let mut state = BTreeMap::new();
        for (index, layer) in self.layers_mut().iter_mut().enumerate() {
            for param in layer.parameters() {
                state.insert(format!("layers.{}.{}", index, param.name), param.value.clone());
            }
        }
        state
    }

    /// Overwrite parameters from a state dict; every parameter must be present with its exact shape
    fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor>) -> SiameseResult<()> {
        let mut expected = 0;
        for (index, layer) in self.layers_mut().iter_mut().enumerate() {
            for param in layer.parameters() {
                let key = format!("layers.{}.{}", index, param.name);
                let value = state
                    .get(&key)
                    .ok_or_else(|| SiameseError::InvalidData(format!("Missing parameter {}", key)))?;
                if value.shape() != param.value.shape() {
                    return Err(SiameseError::shape_error(
                        &param.value.shape().to_string(),
                        &value.shape().to_string(),
                        Some(&format!("parameter {} was saved from a different architecture", key)),
                    ));
                }
                *param.value = value.clone();
                expected += 1;
            }
        }
        if expected != state.len() {
            return Err(SiameseError::InvalidData(format!(
                "State dict has {} entries but the model has {} parameters",
                state.len(),
                expected
            )));
        }
        Ok(())
    }
}

/// Feed-forward embedding network
#[derive(Debug)]
pub struct FeedForwardNet {
    pub layers: Vec<Box<dyn TensorOperation>>,
    input_size: usize,
    output_size: usize,
}

impl FeedForwardNet {
    pub fn new(input_size: usize) -> Self {
        Self {
            layers: vec![Box::new(FlattenOp::new())],
            input_size,
            output_size: input_size,
        }
    }

    pub fn add_dense_layer<R: Rng + ?Sized>(
        mut self,
        output_size: usize,
        activation: bool,
        rng: &mut R,
    ) -> SiameseResult<Self> {
        let layer = DenseLayer::new(self.output_size, output_size, activation, rng)?;
        self.output_size = output_size;
        self.layers.push(Box::new(layer));
        Ok(self)
    }

    /// 784 → 256 → 64 → 10
    pub fn mnist<R: Rng + ?Sized>(rng: &mut R) -> SiameseResult<Self> {
        Self::new(IMAGE_SHAPE.iter().product())
            .add_dense_layer(256, true, rng)?
            .add_dense_layer(64, true, rng)?
            .add_dense_layer(EMBEDDING_DIM, false, rng)
    }
}

impl EmbeddingModel for FeedForwardNet {
    fn kind(&self) -> ModelKind {
        ModelKind::Mlp
    }

    fn input_shape(&self) -> Shape {
        Shape::new([self.input_size])
    }

    fn embedding_dim(&self) -> usize {
        self.output_size
    }

    fn layers(&self) -> &[Box<dyn TensorOperation>] {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut [Box<dyn TensorOperation>] {
        &mut self.layers
    }
}

/// Convolutional embedding network
#[derive(Debug)]
pub struct ConvNet {
    pub layers: Vec<Box<dyn TensorOperation>>,
    input_shape: Shape,
    output_size: usize,
}

impl ConvNet {
    /// Conv(1→8) → pool → Conv(8→16) → pool → flatten (16·7·7) → dense 10
    pub fn mnist<R: Rng + ?Sized>(rng: &mut R) -> SiameseResult<Self> {
        let input_shape = Shape::new(IMAGE_SHAPE);
        let layers: Vec<Box<dyn TensorOperation>> = vec![
            Box::new(ConvLayer::new(1, 8, 3, 1, true, rng)?),
            Box::new(ConvLayer::new(8, 16, 3, 1, true, rng)?),
            Box::new(FlattenOp::new()),
            Box::new(DenseLayer::new(16 * 7 * 7, EMBEDDING_DIM, false, rng)?),
        ];
        Ok(Self {
            layers,
            input_shape,
            output_size: EMBEDDING_DIM,
        })
    }
}

impl EmbeddingModel for ConvNet {
    fn kind(&self) -> ModelKind {
        ModelKind::Conv
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }

    fn embedding_dim(&self) -> usize {
        self.output_size
    }

    fn layers(&self) -> &[Box<dyn TensorOperation>] {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut [Box<dyn TensorOperation>] {
        &mut self.layers
    }
}
