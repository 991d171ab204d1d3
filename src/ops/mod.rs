//! Differentiable primitive operations with hand-written backward passes

pub mod core;
pub mod linear;
pub mod conv;
pub mod activation;

pub use self::core::{Param, TensorOperation};
pub use activation::{FlattenOp, ReLUOp};
pub use conv::{Conv2dOp, MaxPool2dOp};
pub use linear::LinearOp;
