//! Contrastive (pairwise) loss with in-batch pair mining

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{SiameseError, SiameseResult},
    tensor::Tensor,
};
use super::{margin_hinge, validate_margin, Loss, LossOutput, Reduction, DEFAULT_MARGIN};

/// How positives and negatives are chosen inside a labeled batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairMining {
    /// Positive shares the anchor's label, negative does not
    #[default]
    LabelAware,
    /// Positive is the reversed batch, negative the batch rolled by one.
    /// Ignores labels entirely.
    ReverseRotate,
}

/// Row indices selected as positive and negative for every anchor row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairIndices {
    pub positive: Vec<usize>,
    pub negative: Vec<usize>,
}

impl PairMining {
    pub fn mine(&self, labels: &[usize]) -> SiameseResult<PairIndices> {
        let batch = labels.len();
        if batch == 0 {
            return Err(SiameseError::InvalidInput("Cannot mine pairs from an empty batch".to_string()));
        }
        match self {
            PairMining::ReverseRotate => Ok(PairIndices {
                positive: (0..batch).map(|i| batch - 1 - i).collect(),
                negative: (0..batch).map(|i| (i + batch - 1) % batch).collect(),
            }),
            PairMining::LabelAware => {
                let mut positive = Vec::with_capacity(batch);
                let mut negative = Vec::with_capacity(batch);
                for (i, &label) in labels.iter().enumerate() {
                    // scan forward cyclically so every anchor pairs with its nearest successor
                    let successors = (1..batch).map(|offset| (i + offset) % batch);
                    let pos = successors
                        .clone()
                        .find(|&j| labels[j] == label)
                        .unwrap_or(i);
                    let neg = successors
                        .clone()
                        .find(|&j| labels[j] != label)
                        .ok_or(SiameseError::LabelNotFound {
                            role: "negative",
                            label,
                            attempts: batch - 1,
                        })?;
                    positive.push(pos);
                    negative.push(neg);
                }
                Ok(PairIndices { positive, negative })
            }
        }
    }
}

impl Display for PairMining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairMining::LabelAware => write!(f, "label_aware"),
            PairMining::ReverseRotate => write!(f, "reverse_rotate"),
        }
    }
}

impl FromStr for PairMining {
    type Err = SiameseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "label_aware" | "labels" => Ok(PairMining::LabelAware),
            "reverse_rotate" | "legacy" => Ok(PairMining::ReverseRotate),
            other => Err(SiameseError::InvalidInput(format!("Unknown pair mining strategy: {}", other))),
        }
    }
}

/// Loss and the gradient with respect to the whole embedding batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLossOutput {
    pub loss: f32,
    pub grad_embeddings: Tensor,
}

/// Contrastive hinge loss: `max(0, d(a, p) - d(a, n) + margin)` averaged over the batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContrastiveLoss {
    margin: f32,
    reduction: Reduction,
    mining: PairMining,
}

impl ContrastiveLoss {
    pub fn new(margin: f32) -> SiameseResult<Self> {
        Ok(Self {
            margin: validate_margin(margin)?,
            ..Self::default()
        })
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_pair_mining(mut self, mining: PairMining) -> Self {
        if mining == PairMining::ReverseRotate {
            warn!("reverse_rotate pair mining ignores labels; positives and negatives may share or differ in class arbitrarily");
        }
        self.mining = mining;
        self
    }

    pub fn pair_mining(&self) -> PairMining {
        self.mining
    }

    /// Mine pairs inside a labeled batch, then compute the hinge.
    ///
    /// Each row acts as an anchor once. Gradients from the rows reused as
    /// positives or negatives are accumulated back onto those rows.
    pub fn forward_labeled(&self, embeddings: &Tensor, labels: &[usize]) -> SiameseResult<BatchLossOutput> {
        if labels.len() != embeddings.rows() {
            return Err(SiameseError::shape_error(
                &format!("{} labels", embeddings.rows()),
                &format!("{} labels", labels.len()),
                Some("every embedding row needs exactly one label"),
            ));
        }
        let pairs = self.mining.mine(labels)?;
        let positive = embeddings.select_rows(&pairs.positive)?;
        let negative = embeddings.select_rows(&pairs.negative)?;
        let output = margin_hinge(embeddings, &positive, &negative, self.margin, self.reduction)?;

        let mut grad_embeddings = output.grads.anchor;
        let dim = embeddings.row_len();
        for (grads, indices) in [
            (&output.grads.positive, &pairs.positive),
            (&output.grads.negative, &pairs.negative),
        ] {
            for (row, &target) in indices.iter().enumerate() {
                let src = grads.row(row);
                let dst = &mut grad_embeddings.as_slice_mut()[target * dim..(target + 1) * dim];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += s;
                }
            }
        }

        Ok(BatchLossOutput {
            loss: output.loss,
            grad_embeddings,
        })
    }
}

impl Default for ContrastiveLoss {
    fn default() -> Self {
        Self {
            margin: DEFAULT_MARGIN,
            reduction: Reduction::Mean,
            mining: PairMining::LabelAware,
        }
    }
}

impl Loss for ContrastiveLoss {
    fn forward_backward(
        &self,
        anchor: &Tensor,
        positive: &Tensor,
        negative: &Tensor,
    ) -> SiameseResult<LossOutput> {
        margin_hinge(anchor, positive, negative, self.margin, self.reduction)
    }

    fn name(&self) -> &'static str {
        "ContrastiveLoss"
    }

    fn margin(&self) -> f32 {
        self.margin
    }

    fn reduction(&self) -> Reduction {
        self.reduction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;
    use rand::{rngs::StdRng, SeedableRng};

    fn rows(data: &[&[f32]]) -> Tensor {
        Tensor::from_rows(&data.iter().map(|r| r.to_vec()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_margin_examples() {
        let loss = ContrastiveLoss::new(0.5).unwrap();
        let zero = rows(&[&[0.0, 0.0]]);
        let unit = rows(&[&[1.0, 0.0]]);
        assert_eq!(loss.forward(&zero, &zero, &unit).unwrap(), 0.0);
        assert!((loss.forward(&zero, &unit, &zero).unwrap() - 1.5).abs() < 1e-6);
        assert_eq!(ContrastiveLoss::default().forward(&unit, &unit, &unit).unwrap(), 1.0);
    }

    #[test]
    fn test_label_aware_mining_respects_labels() {
        let labels = [0, 1, 0, 2, 1];
        let pairs = PairMining::LabelAware.mine(&labels).unwrap();
        for i in 0..labels.len() {
            assert_eq!(labels[pairs.positive[i]], labels[i]);
            assert_ne!(labels[pairs.negative[i]], labels[i]);
        }
        // label 2 appears once, so its positive is itself
        assert_eq!(pairs.positive[3], 3);
    }

    #[test]
    fn test_label_aware_mining_needs_two_labels() {
        let result = PairMining::LabelAware.mine(&[4, 4, 4]);
        assert!(matches!(
            result,
            Err(SiameseError::LabelNotFound { role: "negative", label: 4, .. })
        ));
    }

    #[test]
    fn test_reverse_rotate_mining() {
        let pairs = PairMining::ReverseRotate.mine(&[0, 0, 0, 0]).unwrap();
        assert_eq!(pairs.positive, vec![3, 2, 1, 0]);
        assert_eq!(pairs.negative, vec![3, 0, 1, 2]);
    }

    #[test]
    fn test_forward_labeled_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let embeddings = Tensor::randn(Shape::new([6, 3]), 0.3, &mut rng).unwrap();
        let labels = [0, 1, 2, 0, 1, 2];
        let loss = ContrastiveLoss::default();
        let out = loss.forward_labeled(&embeddings, &labels).unwrap();
        assert!(out.loss >= 0.0);

        let h = 1e-3;
        for k in 0..embeddings.numel() {
            let mut plus = embeddings.clone();
            plus.as_slice_mut()[k] += h;
            let mut minus = embeddings.clone();
            minus.as_slice_mut()[k] -= h;
            let lp = loss.forward_labeled(&plus, &labels).unwrap().loss;
            let lm = loss.forward_labeled(&minus, &labels).unwrap().loss;
            let numeric = (lp - lm) / (2.0 * h);
            assert!((numeric - out.grad_embeddings.as_slice()[k]).abs() < 1e-2);
        }
    }

    #[test]
    fn test_forward_labeled_rejects_label_count() {
        let embeddings = Tensor::zeros(Shape::new([3, 2]));
        let result = ContrastiveLoss::default().forward_labeled(&embeddings, &[0, 1]);
        assert!(matches!(result, Err(SiameseError::ShapeError(_))));
    }

    #[test]
    fn test_pair_mining_parsing() {
        assert_eq!("label-aware".parse::<PairMining>().unwrap(), PairMining::LabelAware);
        assert_eq!("reverse_rotate".parse::<PairMining>().unwrap(), PairMining::ReverseRotate);
        assert_eq!(PairMining::ReverseRotate.to_string(), "reverse_rotate");
    }
}
