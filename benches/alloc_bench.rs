//! Microbenchmarks for the allocation hot paths

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use strata_alloc::{
    FitPolicy, FreeList, FreeListConfig, LockFreeBump, LockFreePage, Provider, Strategy,
    UnsynchronizedPage,
};

fn bench_bump_find(c: &mut Criterion) {
    let provider = LockFreePage::new();

    c.bench_function("bump_find_64", |b| {
        b.iter_batched(
            || LockFreeBump::new(&provider),
            |bump| {
                for _ in 0..128 {
                    bump.find_sized(64).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_freelist_find_release(c: &mut Criterion) {
    let provider = LockFreePage::new();

    let mut group = c.benchmark_group("freelist");
    for fit in [FitPolicy::FirstFit, FitPolicy::BestFit, FitPolicy::WorstFit] {
        group.bench_function(format!("{:?}", fit), |b| {
            let list = FreeList::with_config(
                &provider,
                FreeListConfig {
                    fit,
                    ..FreeListConfig::default()
                },
            );
            b.iter(|| {
                let mut held = [core::ptr::NonNull::dangling(); 16];
                for slot in &mut held {
                    *slot = list.find_sized(48).unwrap();
                }
                for slot in held {
                    list.release(slot).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_provider_churn(c: &mut Criterion) {
    c.bench_function("lock_free_provide_release", |b| {
        let provider = LockFreePage::new();
        b.iter(|| {
            let page = provider.provide(1).unwrap();
            provider.release(page).unwrap();
        });
    });

    c.bench_function("unsynchronized_provide_release", |b| {
        let provider = UnsynchronizedPage::new();
        b.iter(|| {
            let page = provider.provide(1).unwrap();
            provider.release(page).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_bump_find,
    bench_freelist_find_release,
    bench_provider_churn
);
criterion_main!(benches);
