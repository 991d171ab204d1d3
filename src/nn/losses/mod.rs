//! Margin losses over embedding distances
//!
//! Both losses share one hinge: for every row `max(0, ||a - p|| - ||a - n|| + margin)`,
//! reduced over the batch. They differ only in where `(a, p, n)` come from:
//! [`TripletLoss`] consumes triples drawn by the sampler, while
//! [`ContrastiveLoss`] mines them from a labeled batch of embeddings.

pub mod contrastive;
pub mod ranking;

pub use contrastive::*;
pub use ranking::*;

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    error::{SiameseError, SiameseResult},
    tensor::Tensor,
};

/// Default hinge margin
pub const DEFAULT_MARGIN: f32 = 1.0;

/// Distances below this are treated as zero when computing gradients
const DISTANCE_EPS: f32 = 1e-12;

/// Reduction applied to per-row hinge values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Average over the batch
    #[default]
    Mean,
    /// Sum over the batch
    Sum,
}

/// Which loss drives training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    #[default]
    Triplet,
    Contrastive,
}

impl Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossKind::Triplet => write!(f, "triplet"),
            LossKind::Contrastive => write!(f, "contrastive"),
        }
    }
}

impl FromStr for LossKind {
    type Err = SiameseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "triplet" | "triplet_margin" => Ok(LossKind::Triplet),
            "contrastive" | "pairwise" => Ok(LossKind::Contrastive),
            other => Err(SiameseError::InvalidInput(format!("Unknown loss: {}", other))),
        }
    }
}

/// Gradients of a reduced loss with respect to each of its three inputs
#[derive(Debug, Clone, PartialEq)]
pub struct TripletGradients {
    pub anchor: Tensor,
    pub positive: Tensor,
    pub negative: Tensor,
}

/// Loss value together with its gradients
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput {
    pub loss: f32,
    pub grads: TripletGradients,
}

/// Base trait for margin losses over `(anchor, positive, negative)` batches
pub trait Loss: Send + Sync {
    /// Compute the reduced loss value
    fn forward(&self, anchor: &Tensor, positive: &Tensor, negative: &Tensor) -> SiameseResult<f32> {
        Ok(self.forward_backward(anchor, positive, negative)?.loss)
    }

    /// Compute the reduced loss and its gradients in one pass
    fn forward_backward(
        &self,
        anchor: &Tensor,
        positive: &Tensor,
        negative: &Tensor,
    ) -> SiameseResult<LossOutput>;

    fn name(&self) -> &'static str;

    fn margin(&self) -> f32;

    fn reduction(&self) -> Reduction;
}

/// Reject negative or non-finite margins
pub fn validate_margin(margin: f32) -> SiameseResult<f32> {
    if !margin.is_finite() || margin < 0.0 {
        return Err(SiameseError::ConfigurationError(format!(
            "Margin must be a finite non-negative number, got {}",
            margin
        )));
    }
    Ok(margin)
}

/// Euclidean distance between matching rows of two `[batch, dim]` tensors
pub fn pairwise_distance(x: &Tensor, y: &Tensor) -> SiameseResult<Vec<f32>> {
    Ok(x.sub(y)?.row_norms())
}

fn check_triplet_shapes(anchor: &Tensor, positive: &Tensor, negative: &Tensor) -> SiameseResult<()> {
    if anchor.shape().rank() != 2 {
        return Err(SiameseError::shape_error(
            "[batch, dim] embeddings",
            &anchor.shape().to_string(),
            None,
        ));
    }
    for (role, other) in [("positive", positive), ("negative", negative)] {
        if other.shape() != anchor.shape() {
            return Err(SiameseError::shape_error(
                &anchor.shape().to_string(),
                &other.shape().to_string(),
                Some(&format!("{} batch must match the anchor batch", role)),
            ));
        }
    }
    if anchor.rows() == 0 {
        return Err(SiameseError::InvalidInput("Loss over an empty batch".to_string()));
    }
    Ok(())
}

/// Shared hinge over `(a, p, n)` rows with analytic gradients
pub(crate) fn margin_hinge(
    anchor: &Tensor,
    positive: &Tensor,
    negative: &Tensor,
    margin: f32,
    reduction: Reduction,
) -> SiameseResult<LossOutput> {
    check_triplet_shapes(anchor, positive, negative)?;

    let batch = anchor.rows();
    let scale = match reduction {
        Reduction::Mean => 1.0 / batch as f32,
        Reduction::Sum => 1.0,
    };

    let diff_pos = anchor.sub(positive)?;
    let diff_neg = anchor.sub(negative)?;
    let d_pos = diff_pos.row_norms();
    let d_neg = diff_neg.row_norms();

    let mut grad_anchor = Tensor::zeros(anchor.shape().clone());
    let mut grad_positive = Tensor::zeros(anchor.shape().clone());
    let mut grad_negative = Tensor::zeros(anchor.shape().clone());
    let dim = anchor.row_len();

    let mut total = 0.0;
    for row in 0..batch {
        let hinge = d_pos[row] - d_neg[row] + margin;
        if hinge <= 0.0 {
            continue;
        }
        total += hinge;

        let range = row * dim..(row + 1) * dim;
        let inv_pos = if d_pos[row] > DISTANCE_EPS { scale / d_pos[row] } else { 0.0 };
        let inv_neg = if d_neg[row] > DISTANCE_EPS { scale / d_neg[row] } else { 0.0 };
        let dp = &diff_pos.as_slice()[range.clone()];
        let dn = &diff_neg.as_slice()[range.clone()];
        let ga = &mut grad_anchor.as_slice_mut()[range.clone()];
        for k in 0..dim {
            ga[k] = dp[k] * inv_pos - dn[k] * inv_neg;
        }
        let gp = &mut grad_positive.as_slice_mut()[range.clone()];
        for k in 0..dim {
            gp[k] = -dp[k] * inv_pos;
        }
        let gn = &mut grad_negative.as_slice_mut()[range];
        for k in 0..dim {
            gn[k] = dn[k] * inv_neg;
        }
    }

    Ok(LossOutput {
        loss: total * scale,
        grads: TripletGradients {
            anchor: grad_anchor,
            positive: grad_positive,
            negative: grad_negative,
        },
    })
}
