use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use cb_data::CovarianceMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::hint::black_box;

fn bench_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("covariance_sampling");

    for size in [4usize, 16, 64] {
        let mut rng = StdRng::seed_from_u64(size as u64);
        let cov = CovarianceMatrix::random(size, 1.0, &mut rng).unwrap();
        // Force the Cholesky factor up front so the loop measures the
        // draw, not the first-call factorization.
        cov.sample(&mut rng).unwrap();

        group.bench_with_input(BenchmarkId::new("single", size), &size, |b, _| {
            let mut rng = StdRng::seed_from_u64(1);
            b.iter(|| black_box(cov.sample(&mut rng).unwrap()))
        });

        group.bench_with_input(BenchmarkId::new("batch_100", size), &size, |b, _| {
            let mut rng = StdRng::seed_from_u64(1);
            b.iter(|| black_box(cov.sample_batch(100, &mut rng).unwrap()))
        });
    }

    group.finish();
}

fn bench_chi_square(c: &mut Criterion) {
    let mut group = c.benchmark_group("covariance_chi_square");

    for size in [4usize, 16, 64] {
        let mut rng = StdRng::seed_from_u64(size as u64);
        let cov = CovarianceMatrix::random(size, 1.0, &mut rng).unwrap();
        let (delta, _) = cov.sample(&mut rng).unwrap();

        group.bench_with_input(BenchmarkId::new("packed", size), &size, |b, _| {
            b.iter(|| black_box(cov.chi_square(black_box(&delta)).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sampling, bench_chi_square);
criterion_main!(benches);
