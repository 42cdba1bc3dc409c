//! Benchmarks for the slab pool hot paths.
//!
//! Run with: cargo bench --bench slab

use std::ptr::NonNull;
use std::sync::Arc;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use slabpool::{ItemHeader, ItemStore, SlabConfig, SlabPool};

struct NullStore;

impl ItemStore for NullStore {
    unsafe fn unlink_item(&self, _item: NonNull<ItemHeader>, _key_hash: u64) {}
    fn evictions_snapshot(&self, _out: &mut [u64]) {}
}

fn bench_classify(c: &mut Criterion) {
    let pool = SlabPool::new(
        SlabConfig::new().limit_bytes(0),
        Arc::new(NullStore),
    );

    let mut group = c.benchmark_group("slab/classify");
    group.throughput(Throughput::Elements(1));
    group.bench_function("mixed", |b| {
        let mut size = 1usize;
        b.iter(|| {
            let id = pool.classify(black_box(size));
            black_box(id);
            size = size * 7 % (1024 * 1024);
            if size == 0 {
                size = 1;
            }
        });
    });
    group.finish();
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("slab/alloc_free");

    for item_size in [100usize, 1024, 16 * 1024] {
        let pool = SlabPool::new(
            SlabConfig::new().limit_bytes(0),
            Arc::new(NullStore),
        );
        let id = pool.classify(item_size);

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("{item_size}B"), |b| {
            b.iter(|| {
                let it = pool.alloc(black_box(item_size), id).unwrap();
                // SAFETY: it came from alloc on this pool
                unsafe { pool.free(it, item_size, id) };
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_classify, bench_alloc_free);
criterion_main!(benches);
