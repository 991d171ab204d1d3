//! Batch-level tensor operations used by layers, losses and loaders

use crate::error::{SiameseError, SiameseResult};
use super::core::{Shape, Tensor};

impl Tensor {
    /// Stack equally shaped tensors along a new leading dimension
    pub fn stack(items: &[&Tensor]) -> SiameseResult<Tensor> {
        let first = items
            .first()
            .ok_or_else(|| SiameseError::InvalidInput("Cannot stack an empty list of tensors".to_string()))?;
        let item_shape = first.shape().clone();
        let mut data = Vec::with_capacity(items.len() * item_shape.total_elements());
        for item in items {
            if item.shape() != &item_shape {
                return Err(SiameseError::shape_error(
                    &item_shape.to_string(),
                    &item.shape().to_string(),
                    Some("every stacked example must share one input shape"),
                ));
            }
            data.extend_from_slice(item.as_slice());
        }
        let mut dims = Vec::with_capacity(item_shape.rank() + 1);
        dims.push(items.len());
        dims.extend_from_slice(item_shape.as_slice());
        Tensor::from_vec(data, Shape::new(dims))
    }

    /// Concatenate along the leading dimension
    pub fn concat_rows(parts: &[&Tensor]) -> SiameseResult<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| SiameseError::InvalidInput("Cannot concatenate an empty list of tensors".to_string()))?;
        let trailing = &first.shape().as_slice()[1..];
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if &part.shape().as_slice()[1..] != trailing {
                return Err(SiameseError::shape_error(
                    &first.shape().to_string(),
                    &part.shape().to_string(),
                    Some("concatenated tensors must agree on every dimension but the first"),
                ));
            }
            rows += part.rows();
            data.extend_from_slice(part.as_slice());
        }
        Tensor::from_vec(data, first.shape().with_rows(rows))
    }

    /// Split the leading dimension into `parts` equal chunks
    pub fn split_rows(&self, parts: usize) -> SiameseResult<Vec<Tensor>> {
        if parts == 0 || self.rows() % parts != 0 {
            return Err(SiameseError::shape_error(
                &format!("a leading dimension divisible by {}", parts),
                &self.shape().to_string(),
                None,
            ));
        }
        let rows = self.rows() / parts;
        let chunk = rows * self.row_len();
        self.as_slice()
            .chunks(chunk.max(1))
            .take(parts)
            .map(|data| Tensor::from_vec(data.to_vec(), self.shape().with_rows(rows)))
            .collect()
    }

    /// Gather rows by index, in the given order
    pub fn select_rows(&self, indices: &[usize]) -> SiameseResult<Tensor> {
        let mut data = Vec::with_capacity(indices.len() * self.row_len());
        for &index in indices {
            if index >= self.rows() {
                return Err(SiameseError::IndexOutOfRange { index, len: self.rows() });
            }
            data.extend_from_slice(self.row(index));
        }
        Tensor::from_vec(data, self.shape().with_rows(indices.len()))
    }

    /// In-place `self += alpha * other`
    pub fn add_scaled(&mut self, other: &Tensor, alpha: f32) -> SiameseResult<()> {
        if self.shape() != other.shape() {
            return Err(SiameseError::shape_error(
                &self.shape().to_string(),
                &other.shape().to_string(),
                None,
            ));
        }
        for (a, &b) in self.as_slice_mut().iter_mut().zip(other.as_slice()) {
            *a += alpha * b;
        }
        Ok(())
    }

    /// Element-wise difference, `self - other`
    pub fn sub(&self, other: &Tensor) -> SiameseResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(SiameseError::shape_error(
                &self.shape().to_string(),
                &other.shape().to_string(),
                None,
            ));
        }
        let data = self
            .as_slice()
            .iter()
            .zip(other.as_slice())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_vec(data, self.shape().clone())
    }

    /// Apply `f` to every element
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        let data = self.as_slice().iter().map(|&v| f(v)).collect();
        Tensor::from_raw(data, self.shape().clone())
    }

    /// Euclidean norm of every row
    pub fn row_norms(&self) -> Vec<f32> {
        self.iter_rows()
            .map(|row| row.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect()
    }

    pub fn sum(&self) -> f32 {
        self.as_slice().iter().sum()
    }

    pub fn mean(&self) -> f32 {
        if self.numel() == 0 {
            0.0
        } else {
            self.sum() / self.numel() as f32
        }
    }
}
