//! Core operation traits and fundamental types

use std::fmt::Debug;

use crate::{
    error::SiameseResult,
    tensor::{Shape, Tensor},
};

/// A trainable parameter together with its accumulated gradient
#[derive(Debug)]
pub struct Param<'a> {
    pub name: &'static str,
    pub value: &'a mut Tensor,
    pub grad: &'a mut Tensor,
}

/// Differentiable tensor operation.
///
/// `forward` caches whatever `backward` needs, so a `backward` call always
/// refers to the most recent `forward`. Parameter gradients accumulate until
/// [`TensorOperation::zero_grad`] is called.
pub trait TensorOperation: Debug + Send {
    /// Compute the output for a batch, caching intermediate state
    fn forward(&mut self, input: &Tensor) -> SiameseResult<Tensor>;

    /// Propagate `grad_output` back to the input of the last `forward`
    fn backward(&mut self, grad_output: &Tensor) -> SiameseResult<Tensor>;

    /// Get operation name for debugging
    fn name(&self) -> &'static str;

    /// Get output shape for given input
    fn output_shape(&self, input_shape: &Shape) -> SiameseResult<Shape>;

    /// Trainable parameters, empty for parameter-free operations
    fn parameters(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }

    /// Reset accumulated parameter gradients to zero
    fn zero_grad(&mut self) {
        for param in self.parameters() {
            param.grad.fill(0.0);
        }
    }
}

/// Error for a `backward` call that has no matching `forward`
pub(crate) fn missing_forward(operation: &str) -> crate::error::SiameseError {
    crate::error::SiameseError::operation_error(operation, "backward called before forward")
}
