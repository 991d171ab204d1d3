//! Core tensor types and fundamental operations

use std::fmt::{self, Display};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{SiameseError, SiameseResult};

/// Runtime shape of a dense row-major tensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn total_elements(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_valid(&self) -> bool {
        !self.dims.is_empty() && self.dims.iter().all(|&d| d > 0)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Size of the leading (batch) dimension.
    pub fn rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Number of elements in one row, i.e. the product of all trailing dimensions.
    pub fn row_len(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    /// Same trailing dimensions with a different leading dimension.
    pub fn with_rows(&self, rows: usize) -> Self {
        let mut dims = self.dims.clone();
        if let Some(first) = dims.first_mut() {
            *first = rows;
        }
        Self { dims }
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.dims
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

/// Dense `f32` tensor stored in row-major order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    /// Tensor filled with zeros
    pub fn zeros(shape: Shape) -> Self {
        let data = vec![0.0; shape.total_elements()];
        Self { data, shape }
    }

    /// Tensor filled with a constant
    pub fn full(shape: Shape, value: f32) -> Self {
        let data = vec![value; shape.total_elements()];
        Self { data, shape }
    }

    /// Create from vector, checking the element count against the shape
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> SiameseResult<Self> {
        if data.len() != shape.total_elements() {
            return Err(SiameseError::InvalidInput(format!(
                "Data length {} doesn't match shape {} ({} elements)",
                data.len(),
                shape,
                shape.total_elements()
            )));
        }
        Ok(Self { data, shape })
    }

    /// Build a `[rows.len(), cols]` matrix from equally sized rows
    pub fn from_rows(rows: &[Vec<f32>]) -> SiameseResult<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != cols) {
            return Err(SiameseError::shape_error(
                &format!("rows of length {}", cols),
                "rows of differing length",
                None,
            ));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::from_vec(data, Shape::new([rows.len(), cols]))
    }

    /// Samples from `N(0, std^2)` using the caller's random source
    pub fn randn<R: Rng + ?Sized>(shape: Shape, std: f32, rng: &mut R) -> SiameseResult<Self> {
        let normal = Normal::new(0.0f32, std)
            .map_err(|e| SiameseError::InvalidInput(format!("Invalid standard deviation {}: {}", std, e)))?;
        let data = (0..shape.total_elements()).map(|_| normal.sample(rng)).collect();
        Ok(Self { data, shape })
    }

    /// Assemble without re-checking; callers guarantee `data.len() == shape.total_elements()`.
    pub(super) fn from_raw(data: Vec<f32>, shape: Shape) -> Self {
        debug_assert_eq!(data.len(), shape.total_elements());
        Self { data, shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn row_len(&self) -> usize {
        self.shape.row_len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_slice_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Borrow the `index`-th row (leading-dimension slice)
    pub fn row(&self, index: usize) -> &[f32] {
        let len = self.row_len();
        &self.data[index * len..(index + 1) * len]
    }

    /// Iterate over rows of the leading dimension
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        let len = self.row_len().max(1);
        self.data.chunks(len)
    }

    /// View the same buffer with a different shape of equal size
    pub fn reshape(self, shape: Shape) -> SiameseResult<Self> {
        if shape.total_elements() != self.data.len() {
            return Err(SiameseError::shape_error(
                &format!("{} elements", self.data.len()),
                &format!("shape {} with {} elements", shape, shape.total_elements()),
                Some("reshape must preserve the element count"),
            ));
        }
        Ok(Self { data: self.data, shape })
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_shape_creation() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(shape.total_elements(), 24);
        assert_eq!(shape.rows(), 2);
        assert_eq!(shape.row_len(), 12);
        assert!(shape.is_valid());
        assert_eq!(shape.to_string(), "[2, 3, 4]");
    }

    #[test]
    fn test_shape_validation() {
        assert!(!Shape::new([2, 0, 4]).is_valid());
        assert!(!Shape::new(Vec::new()).is_valid());
        assert_eq!(Shape::new([5, 1, 28, 28]).with_rows(3).dims, vec![3, 1, 28, 28]);
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], Shape::new([2, 2])).is_err());
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new([2, 2])).unwrap();
        assert_eq!(t.row(1), &[3.0, 4.0]);
        assert_eq!(t.iter_rows().count(), 2);
    }

    #[test]
    fn test_reshape_preserves_count() {
        let t = Tensor::zeros(Shape::new([2, 1, 2, 2]));
        let flat = t.clone().reshape(Shape::new([2, 4])).unwrap();
        assert_eq!(flat.shape().dims, vec![2, 4]);
        assert!(t.reshape(Shape::new([3, 3])).is_err());
    }

    #[test]
    fn test_randn_is_reproducible() {
        let a = Tensor::randn(Shape::new([4, 4]), 0.1, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = Tensor::randn(Shape::new([4, 4]), 0.1, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        assert!(Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0]]).is_err());
        let t = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(t.shape().dims, vec![2, 2]);
    }
}
