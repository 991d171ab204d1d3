//! Neural network layers

use rand::Rng;

use crate::{
    error::SiameseResult,
    ops::{Conv2dOp, LinearOp, MaxPool2dOp, Param, ReLUOp, TensorOperation},
    tensor::{Shape, Tensor},
};

/// Dense layer: linear projection with optional ReLU
#[derive(Debug, Clone)]
pub struct DenseLayer {
    linear: LinearOp,
    activation: Option<ReLUOp>,
}

impl DenseLayer {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        output_size: usize,
        activation: bool,
        rng: &mut R,
    ) -> SiameseResult<Self> {
        let linear = LinearOp::new(input_size, output_size, rng)?;
        let activation = activation.then(ReLUOp::new);
        Ok(Self { linear, activation })
    }

    pub fn output_size(&self) -> usize {
        self.linear.output_size()
    }
}

impl TensorOperation for DenseLayer {
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor> {
        let mut output = self.linear.forward(input)?;
        if let Some(ref mut activation) = self.activation {
            output = activation.forward(&output)?;
        }
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor> {
        let grad = match self.activation {
            Some(ref mut activation) => activation.backward(grad_output)?,
            None => grad_output.clone(),
        };
        self.linear.backward(&grad)
    }

    fn name(&self) -> &'static str {
        "DenseLayer"
    }

    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape> {
        self.linear.output_shape(input_shape)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        self.linear.parameters()
    }
}

/// Convolutional layer: conv, ReLU, then optional 2x2 max pooling
#[derive(Debug, Clone)]
pub struct ConvLayer {
    conv: Conv2dOp,
    activation: ReLUOp,
    pooling: Option<MaxPool2dOp>,
}

impl ConvLayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        pooling: bool,
        rng: &mut R,
    ) -> SiameseResult<Self> {
        let conv = Conv2dOp::new(in_channels, out_channels, kernel_size, 1, padding, rng)?;
        let pooling = pooling.then(|| MaxPool2dOp::new(2));
        Ok(Self {
            conv,
            activation: ReLUOp::new(),
            pooling,
        })
    }
}

impl TensorOperation for ConvLayer {
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor> {
        let output = self.conv.forward(input)?;
        let mut output = self.activation.forward(&output)?;
        if let Some(ref mut pooling) = self.pooling {
            output = pooling.forward(&output)?;
        }
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor> {
        let grad = match self.pooling {
            Some(ref mut pooling) => pooling.backward(grad_output)?,
            None => grad_output.clone(),
        };
        let grad = self.activation.backward(&grad)?;
        self.conv.backward(&grad)
    }

    fn name(&self) -> &'static str {
        "ConvLayer"
    }

    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape> {
        let shape = self.conv.output_shape(input_shape)?;
        match self.pooling {
            Some(ref pooling) => pooling.output_shape(&shape),
            None => Ok(shape),
        }
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        self.conv.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_dense_layer() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut dense = DenseLayer::new(3, 4, true, &mut rng).unwrap();
        let input = Tensor::full(Shape::new([2, 3]), 1.0);
        let out = dense.forward(&input).unwrap();
        assert_eq!(out.shape().dims, vec![2, 4]);
        assert!(out.as_slice().iter().all(|&v| v >= 0.0));
        let dx = dense.backward(&Tensor::full(Shape::new([2, 4]), 1.0)).unwrap();
        assert_eq!(dx.shape().dims, vec![2, 3]);
        assert_eq!(dense.parameters().len(), 2);
    }

    #[test]
    fn test_conv_layer() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut conv = ConvLayer::new(1, 4, 3, 1, true, &mut rng).unwrap();
        let input = Tensor::full(Shape::new([2, 1, 8, 8]), 0.5);
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape().dims, vec![2, 4, 4, 4]);
        assert_eq!(conv.output_shape(input.shape()).unwrap(), *out.shape());
        let dx = conv.backward(&Tensor::full(out.shape().clone(), 1.0)).unwrap();
        assert_eq!(dx.shape(), input.shape());
    }
}
