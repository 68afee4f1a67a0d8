//! Allocator benchmarks.
//!
//! Compares the sbmalloc pipelines against the system allocator for the
//! usual shapes: tight alloc/free cycles across the size spectrum, burst
//! allocation, and multi-thread churn on a single size class.

use std::ptr::NonNull;
use std::thread;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, 131072];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("sbmalloc", size), &size, |b, &sz| {
            b.iter(|| {
                let p = sbmalloc_core::allocate(sz).expect("alloc");
                // SAFETY: p is live and ours.
                unsafe { sbmalloc_core::deallocate(criterion::black_box(p)) };
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("sbmalloc/1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<NonNull<u8>> = (0..1000)
                .map(|_| sbmalloc_core::allocate(64).expect("alloc"))
                .collect();
            for p in ptrs {
                // SAFETY: p is live and ours.
                unsafe { sbmalloc_core::deallocate(p) };
            }
        });
    });
    group.bench_function("system/1000x64B", |b| {
        b.iter(|| {
            let allocs: Vec<Vec<u8>> = (0..1000).map(|_| vec![0u8; 64]).collect();
            criterion::black_box(allocs);
        });
    });

    group.finish();
}

fn bench_threaded_churn(c: &mut Criterion) {
    const THREADS: usize = 4;
    const OPS: usize = 2000;

    let mut group = c.benchmark_group("threaded_churn");
    group.bench_function(format!("sbmalloc/{THREADS}x{OPS}x256B"), |b| {
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        for _ in 0..OPS {
                            let p = sbmalloc_core::allocate(256).expect("alloc");
                            // SAFETY: p is live and ours.
                            unsafe { sbmalloc_core::deallocate(p) };
                        }
                    });
                }
            });
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_threaded_churn
);
criterion_main!(benches);
