use cask_core::digest::digest_bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn make_payload(size: usize) -> Vec<u8> {
    let mut v = vec![0u8; size];
    for (i, b) in v.iter_mut().enumerate() {
        *b = (i as u32 % 251) as u8;
    }
    v
}

fn bench_digest_bytes(c: &mut Criterion) {
    let sizes = [1 * 1024, 64 * 1024, 1 * 1024 * 1024, 10 * 1024 * 1024];
    let mut group = c.benchmark_group("digest_bytes");
    for &sz in &sizes {
        let data = make_payload(sz);
        group.bench_with_input(BenchmarkId::from_parameter(sz), &data, |b, d| {
            b.iter(|| {
                let _ = black_box(digest_bytes(d));
            })
        });
    }
    group.finish();
}

criterion_group!(digest, bench_digest_bytes);
criterion_main!(digest);
