//! Activation functions

use crate::{
    error::{SiameseError, SiameseResult},
    ops::core::{missing_forward, TensorOperation},
    tensor::{Shape, Tensor},
};

/// Rectified linear unit, applied element-wise to any shape
#[derive(Debug, Clone, Default)]
pub struct ReLUOp {
    mask: Option<Vec<bool>>,
}

impl ReLUOp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TensorOperation for ReLUOp {
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor> {
        self.mask = Some(input.as_slice().iter().map(|&v| v > 0.0).collect());
        Ok(input.map(|v| v.max(0.0)))
    }

    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor> {
        let mask = self.mask.as_ref().ok_or_else(|| missing_forward(self.name()))?;
        if mask.len() != grad_output.numel() {
            return Err(SiameseError::shape_error(
                &format!("{} gradient elements", mask.len()),
                &grad_output.shape().to_string(),
                None,
            ));
        }
        let data = grad_output
            .as_slice()
            .iter()
            .zip(mask)
            .map(|(&g, &active)| if active { g } else { 0.0 })
            .collect();
        Tensor::from_vec(data, grad_output.shape().clone())
    }

    fn name(&self) -> &'static str {
        "ReLUOp"
    }

    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape> {
        Ok(input_shape.clone())
    }
}

/// Collapses every dimension after the batch dimension
#[derive(Debug, Clone, Default)]
pub struct FlattenOp {
    input_shape: Option<Shape>,
}

impl FlattenOp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TensorOperation for FlattenOp {
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor> {
        let shape = self.output_shape(input.shape())?;
        self.input_shape = Some(input.shape().clone());
        input.clone().reshape(shape)
    }

    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor> {
        let shape = self.input_shape.clone().ok_or_else(|| missing_forward(self.name()))?;
        grad_output.clone().reshape(shape)
    }

    fn name(&self) -> &'static str {
        "FlattenOp"
    }

    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape> {
        Ok(Shape::new([input_shape.rows(), input_shape.row_len()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_forward_backward() {
        let mut op = ReLUOp::new();
        let input = Tensor::from_vec(vec![-1.0, 0.0, 2.0], Shape::new([1, 3])).unwrap();
        assert_eq!(op.forward(&input).unwrap().as_slice(), &[0.0, 0.0, 2.0]);
        let grad = Tensor::full(Shape::new([1, 3]), 1.0);
        assert_eq!(op.backward(&grad).unwrap().as_slice(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_flatten_roundtrips_gradient_shape() {
        let mut op = FlattenOp::new();
        let input = Tensor::zeros(Shape::new([2, 1, 28, 28]));
        let out = op.forward(&input).unwrap();
        assert_eq!(out.shape().dims, vec![2, 784]);
        let dx = op.backward(&out).unwrap();
        assert_eq!(dx.shape().dims, vec![2, 1, 28, 28]);
    }
}
