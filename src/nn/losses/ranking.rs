//! Triplet margin loss for metric learning

use crate::{error::SiameseResult, tensor::Tensor};
use super::{margin_hinge, validate_margin, Loss, LossOutput, Reduction, DEFAULT_MARGIN};

/// Triplet margin loss over sampled `(anchor, positive, negative)` embeddings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletLoss {
    margin: f32,
    reduction: Reduction,
}

impl TripletLoss {
    pub fn new(margin: f32) -> SiameseResult<Self> {
        Ok(Self {
            margin: validate_margin(margin)?,
            reduction: Reduction::Mean,
        })
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }
}

impl Default for TripletLoss {
    fn default() -> Self {
        Self {
            margin: DEFAULT_MARGIN,
            reduction: Reduction::Mean,
        }
    }
}

impl Loss for TripletLoss {
    fn forward_backward(
        &self,
        anchor: &Tensor,
        positive: &Tensor,
        negative: &Tensor,
    ) -> SiameseResult<LossOutput> {
        margin_hinge(anchor, positive, negative, self.margin, self.reduction)
    }

    fn name(&self) -> &'static str {
        "TripletLoss"
    }

    fn margin(&self) -> f32 {
        self.margin
    }

    fn reduction(&self) -> Reduction {
        self.reduction
    }
}
