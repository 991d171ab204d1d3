use rand::{rngs::StdRng, Rng, SeedableRng};

use siamese::{
    data::{InMemoryDataset, LabeledExample, TripletSampler},
    nn::{ContrastiveLoss, Loss, TripletLoss},
    Dataset, Shape, SiameseError, Tensor,
};

fn dataset(labels: &[usize]) -> InMemoryDataset {
    let examples = labels
        .iter()
        .enumerate()
        .map(|(i, &label)| LabeledExample::new(Tensor::full(Shape::new([1, 2, 2]), i as f32), label))
        .collect();
    InMemoryDataset::new(examples).unwrap()
}

fn random_rows(rng: &mut StdRng, rows: usize, cols: usize) -> Tensor {
    let data = (0..rows * cols).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
    Tensor::from_vec(data, Shape::new([rows, cols])).unwrap()
}

#[test]
fn test_sampled_triplets_respect_labels() {
    let labels: Vec<usize> = (0..60).map(|i| (i * 7) % 5).collect();
    let mut sampler = TripletSampler::new(dataset(&labels), StdRng::seed_from_u64(11)).unwrap();

    for index in 0..labels.len() {
        let triplet = sampler.get(index).unwrap();
        assert_eq!(triplet.label, labels[index]);
        assert_eq!(labels[triplet.positive_index], labels[index]);
        assert_ne!(labels[triplet.negative_index], labels[index]);
        assert_eq!(triplet.anchor, sampler.dataset().get(index).unwrap().input);
        assert_eq!(triplet.negative, sampler.dataset().get(triplet.negative_index).unwrap().input);
    }
}

#[test]
fn test_sampler_is_reproducible_for_a_seed() {
    let labels = [0, 1, 2, 0, 1, 2, 0, 1];
    let mut first = TripletSampler::new(dataset(&labels), StdRng::seed_from_u64(3)).unwrap();
    let mut second = TripletSampler::new(dataset(&labels), StdRng::seed_from_u64(3)).unwrap();
    for index in 0..labels.len() {
        assert_eq!(first.get(index).unwrap(), second.get(index).unwrap());
    }
}

#[test]
fn test_sampler_errors() {
    let mut sampler = TripletSampler::new(dataset(&[4, 4, 4]), StdRng::seed_from_u64(0)).unwrap();
    assert!(matches!(
        sampler.get(0),
        Err(SiameseError::LabelNotFound { role: "negative", label: 4, attempts: 0 })
    ));
    assert!(matches!(
        sampler.get(3),
        Err(SiameseError::IndexOutOfRange { index: 3, len: 3 })
    ));

    // a lone label still has itself as a positive
    let mut sampler = TripletSampler::new(dataset(&[0, 1]), StdRng::seed_from_u64(0)).unwrap();
    let triplet = sampler.get(1).unwrap();
    assert_eq!(triplet.positive_index, 1);
    assert_eq!(triplet.negative_index, 0);
}

#[test]
fn test_batch_shapes() {
    let mut sampler = TripletSampler::new(dataset(&[0, 1, 0, 1, 2]), StdRng::seed_from_u64(5)).unwrap();
    let batch = sampler.get_batch(&[0, 2, 4]).unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.anchor.shape().dims, vec![3, 1, 2, 2]);
    assert_eq!(batch.concatenated().unwrap().shape().dims, vec![9, 1, 2, 2]);
}

#[test]
fn test_losses_are_non_negative_and_translation_invariant() {
    let mut rng = StdRng::seed_from_u64(21);
    let triplet = TripletLoss::default();
    let contrastive = ContrastiveLoss::new(0.5).unwrap();

    for _ in 0..20 {
        let a = random_rows(&mut rng, 5, 4);
        let p = random_rows(&mut rng, 5, 4);
        let n = random_rows(&mut rng, 5, 4);
        let shift = rng.gen_range(-10.0f32..10.0);

        for loss in [&triplet as &dyn Loss, &contrastive as &dyn Loss] {
            let value = loss.forward(&a, &p, &n).unwrap();
            assert!(value >= 0.0);
            let shifted = loss
                .forward(&a.map(|v| v + shift), &p.map(|v| v + shift), &n.map(|v| v + shift))
                .unwrap();
            assert!((value - shifted).abs() < 1e-3, "{} vs {}", value, shifted);
        }
    }
}

#[test]
fn test_triplet_loss_reference_values() {
    let a = Tensor::from_rows(&[vec![0.0, 0.0]]).unwrap();
    let near = Tensor::from_rows(&[vec![1.0, 0.0]]).unwrap();

    // identical inputs give exactly the margin
    assert_eq!(TripletLoss::default().forward(&a, &a, &a).unwrap(), 1.0);

    let half = TripletLoss::new(0.5).unwrap();
    assert_eq!(half.forward(&a, &a, &near).unwrap(), 0.0);
    assert!((half.forward(&a, &near, &a).unwrap() - 1.5).abs() < 1e-6);
}

#[test]
fn test_mismatched_shapes_are_rejected() {
    let a = Tensor::zeros(Shape::new([2, 3]));
    let p = Tensor::zeros(Shape::new([2, 3]));
    let n = Tensor::zeros(Shape::new([3, 3]));
    assert!(matches!(
        TripletLoss::default().forward(&a, &p, &n),
        Err(SiameseError::ShapeError(_))
    ));
}
