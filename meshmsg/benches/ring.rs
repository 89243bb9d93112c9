use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use meshmsg::ring::RingBuffer;

fn bench_ring(c: &mut Criterion) {
    let rb = RingBuffer::new(8, 64 << 10);

    c.bench_function("ring_get_put_64", |b| {
        b.iter(|| {
            let block = rb.get(black_box(64)).unwrap();
            unsafe { rb.put(block) };
        })
    });

    c.bench_function("ring_get_put_4k", |b| {
        b.iter(|| {
            let block = rb.get(black_box(4096)).unwrap();
            unsafe { rb.put(block) };
        })
    });

    c.bench_function("ring_burst_16", |b| {
        b.iter(|| {
            let blocks: Vec<_> = (0..16).map(|_| rb.get(black_box(512)).unwrap()).collect();
            for block in blocks {
                unsafe { rb.put(block) };
            }
        })
    });
}

criterion_group!(benches, bench_ring);
criterion_main!(benches);
