use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use shared_bitmap::{Bitmap, CHUNK_BITS};

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("ClaimRelease");

    for nbits in [CHUNK_BITS, 16 * CHUNK_BITS, 256 * CHUNK_BITS] {
        let mut bitmap = Bitmap::new(nbits);
        bitmap.set_range(0, nbits);

        group.bench_with_input(BenchmarkId::new("find_and_clear", nbits), &nbits, |b, _| {
            b.iter(|| {
                let idx = bitmap.try_find_and_clear(black_box(0)).unwrap();
                bitmap.set(idx);
            })
        });

        group.bench_with_input(BenchmarkId::new("find_and_clear8", nbits), &nbits, |b, _| {
            b.iter(|| {
                let idx = bitmap.try_find_and_clear8(black_box(0)).unwrap();
                bitmap.set_n(idx, 8);
            })
        });

        group.bench_with_input(
            BenchmarkId::new("find_and_clear_n_32", nbits),
            &nbits,
            |b, _| {
                b.iter(|| {
                    let idx = bitmap.try_find_and_clear_n(black_box(0), 32).unwrap();
                    bitmap.set_n(idx, 32);
                })
            },
        );
    }

    group.finish();

    let mut group = c.benchmark_group("PointOps");

    let bitmap = Bitmap::new(256 * CHUNK_BITS);
    group.bench_function("set_clear", |b| {
        b.iter(|| {
            bitmap.set(black_box(12345));
            bitmap.clear(black_box(12345));
        })
    });

    let mut scan = Bitmap::new(256 * CHUNK_BITS);
    scan.set_range(0, 256 * CHUNK_BITS);
    group.bench_function("for_each_set_full", |b| {
        b.iter(|| {
            let mut count = 0usize;
            scan.for_each_set(|_| {
                count += 1;
                true
            });
            black_box(count)
        })
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .warm_up_time(std::time::Duration::from_millis(500))
        .sample_size(50);
    targets = criterion_benchmark
}

criterion_main!(benches);
