use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use patch_match as pm;
use std::time::{Duration, Instant};

fn feature_grid(channels: usize, size: usize) -> pm::FeatureGrid {
    let dims = pm::Dims::square(size);
    let step = std::f32::consts::FRAC_PI_2 / (size * size) as f32;
    pm::FeatureGrid::from_fn(channels, dims, |c, y, x| {
        let theta = (y * size + x) as f32 * step;
        (theta + c as f32 * 0.7).cos()
    })
}

fn patch_match(c: &mut Criterion) {
    static DIM: usize = 16;

    let mut group = c.benchmark_group("patch_match");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        // Build the grids once to reduce variation between runs, though
        // we still do a memcpy each run
        let source = feature_grid(8, *dim);
        let target = feature_grid(8, *dim);

        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, _dim| {
            b.iter_custom(|iters| {
                let mut total_elapsed = Duration::new(0, 0);
                for _i in 0..iters {
                    let mut sess = pm::Session::builder()
                        .add_source(source.clone())
                        .seed(120)
                        .max_iterations(8)
                        .build()
                        .unwrap();

                    let start = Instant::now();
                    black_box(sess.run(&target, None)).unwrap();
                    total_elapsed += start.elapsed();
                }

                total_elapsed
            });
        });
    }
    group.finish();
}

fn exhaustive(c: &mut Criterion) {
    static DIM: usize = 16;

    let mut group = c.benchmark_group("exhaustive");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM].iter() {
        let source = feature_grid(8, *dim);
        let target = feature_grid(8, *dim);

        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, _dim| {
            b.iter_custom(|iters| {
                let mut total_elapsed = Duration::new(0, 0);
                for _i in 0..iters {
                    let mut sess = pm::Session::builder()
                        .add_source(source.clone())
                        .seed(120)
                        .build()
                        .unwrap();

                    let start = Instant::now();
                    black_box(sess.run_exhaustive(&target, 1)).unwrap();
                    total_elapsed += start.elapsed();
                }

                total_elapsed
            });
        });
    }
    group.finish();
}

criterion_group!(benches, patch_match, exhaustive);
criterion_main!(benches);
