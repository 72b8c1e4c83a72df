//! Engine operation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use incridx_bench::document;
use incridx_core::{FileContent, FileId, ReadPolicy, TaskContext};
use incridx_testkit::prelude::*;

/// Benchmark one update transaction for documents of growing size.
fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_transaction");

    for words in [8usize, 64, 512].iter() {
        group.throughput(Throughput::Elements(*words as u64));
        group.bench_with_input(BenchmarkId::from_parameter(words), words, |b, &words| {
            let engine = TestEngine::with_config(test_config().sanity_checks(false));
            let ctx = TaskContext::new();
            let versions: Vec<FileContent> = (0..16)
                .map(|seed| FileContent::persisted(document(words, 1000, seed)))
                .collect();
            let mut round = 0;
            b.iter(|| {
                let content = &versions[round % versions.len()];
                round += 1;
                engine.index_file(FileId::new(1), black_box(content), &ctx).unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark indexing many small files with periodic flushes.
fn bench_bulk_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_index");
    group.sample_size(10);

    for files in [100u32, 1000].iter() {
        group.throughput(Throughput::Elements(u64::from(*files)));
        group.bench_with_input(BenchmarkId::from_parameter(files), files, |b, &files| {
            b.iter(|| {
                let engine = TestEngine::with_config(test_config().sanity_checks(false));
                for file in 1..=files {
                    engine.index_text(file, &document(16, 500, file as usize));
                }
                engine.flush_all().unwrap()
            });
        });
    }

    group.finish();
}

/// Benchmark point queries against warm and cold caches.
fn bench_point_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_query");

    for cache in [16usize, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("cache", cache), cache, |b, &cache| {
            let engine = TestEngine::with_config(test_config().cache_capacity(cache));
            for file in 1..=500u32 {
                engine.index_text(file, &document(16, 1000, file as usize));
            }
            engine.flush_all().unwrap();

            let keys: Vec<String> = (0..1000).map(|i| format!("w{i}")).collect();
            let mut idx = 0;
            b.iter(|| {
                let key = &keys[(idx * 13) % keys.len()];
                idx += 1;
                black_box(engine.get_files(&engine.words, key, ReadPolicy::FailFast).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_update, bench_bulk_index, bench_point_query);

criterion_main!(benches);
