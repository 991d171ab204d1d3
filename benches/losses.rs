use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, SeedableRng};

use siamese::{
    data::{SyntheticBlobs, TripletSampler},
    nn::{ContrastiveLoss, Loss, ModelKind, TripletLoss},
    Shape, Tensor,
};

fn triplet_loss(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let mut group = c.benchmark_group("triplet_loss");
    let loss = TripletLoss::default();
    for batch in [16, 64, 256] {
        let shape = Shape::new([batch, 10]);
        let a = Tensor::randn(shape.clone(), 1.0, &mut rng).unwrap();
        let p = Tensor::randn(shape.clone(), 1.0, &mut rng).unwrap();
        let n = Tensor::randn(shape, 1.0, &mut rng).unwrap();
        group.bench_with_input(BenchmarkId::new("forward_backward", batch), &batch, |b, _| {
            b.iter(|| black_box(loss.forward_backward(&a, &p, &n).unwrap()))
        });
    }
    group.finish();
}

fn contrastive_loss(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let mut group = c.benchmark_group("contrastive_loss");
    let loss = ContrastiveLoss::default();
    for batch in [16, 64, 256] {
        let embeddings = Tensor::randn(Shape::new([batch, 10]), 1.0, &mut rng).unwrap();
        let labels: Vec<usize> = (0..batch).map(|i| i % 10).collect();
        group.bench_with_input(BenchmarkId::new("labeled", batch), &batch, |b, _| {
            b.iter(|| black_box(loss.forward_labeled(&embeddings, &labels).unwrap()))
        });
    }
    group.finish();
}

fn sampling_and_embedding(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let dataset = SyntheticBlobs::default().generate(&mut rng).unwrap();
    let mut sampler = TripletSampler::new(dataset, StdRng::seed_from_u64(1)).unwrap();
    let indices: Vec<usize> = (0..32).collect();

    c.bench_function("sample_triplet_batch_32", |b| {
        b.iter(|| black_box(sampler.get_batch(&indices).unwrap()))
    });

    let mut group = c.benchmark_group("embed_triplet_batch_32");
    let batch = sampler.get_batch(&indices).unwrap().concatenated().unwrap();
    for kind in [ModelKind::Mlp, ModelKind::Conv] {
        let mut model = kind.build(&mut rng).unwrap();
        group.bench_with_input(BenchmarkId::new("forward", kind), &kind, |b, _| {
            b.iter(|| black_box(model.forward(&batch).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(bench_losses, triplet_loss, contrastive_loss, sampling_and_embedding);
criterion_main!(bench_losses);
