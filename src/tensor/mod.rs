//! Dense CPU tensors
//!
//! A deliberately small tensor type: a row-major `f32` buffer with a runtime
//! shape. The leading dimension is always the batch dimension, which is what
//! the layers, losses and data loaders in this crate operate on.

pub mod core;
pub mod ops;

pub use self::core::{Shape, Tensor};
