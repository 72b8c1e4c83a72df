//! Storage backend benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use incridx_bench::payload;
use incridx_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tempfile::TempDir;

/// Benchmark in-memory appends.
fn bench_inmemory_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("inmemory_append");

    for size in [64, 256, 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut backend = InMemoryBackend::new();
            let data = payload(size);
            b.iter(|| black_box(backend.append(black_box(&data)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark file appends followed by a flush, the pattern of a log flush.
fn bench_file_append_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_append_flush");
    group.sample_size(20);

    for records in [1usize, 64].iter() {
        group.throughput(Throughput::Elements(*records as u64));
        group.bench_with_input(BenchmarkId::from_parameter(records), records, |b, &records| {
            let dir = TempDir::new().unwrap();
            let mut backend = FileBackend::open_with_create_dirs(&dir.path().join("bench.log")).unwrap();
            let data = payload(128);
            b.iter(|| {
                for _ in 0..records {
                    backend.append(black_box(&data)).unwrap();
                }
                backend.flush().unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark scattered reads from a populated file.
fn bench_file_random_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_random_read");

    let dir = TempDir::new().unwrap();
    let mut backend = FileBackend::open_with_create_dirs(&dir.path().join("bench.log")).unwrap();
    let record = payload(256);
    let offsets: Vec<u64> = (0..1000).map(|_| backend.append(&record).unwrap()).collect();
    backend.flush().unwrap();

    group.bench_function("1000_records", |b| {
        let mut idx = 0;
        b.iter(|| {
            let offset = offsets[(idx * 7) % offsets.len()];
            idx += 1;
            black_box(backend.read_at(black_box(offset), record.len()).unwrap())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_inmemory_append,
    bench_file_append_flush,
    bench_file_random_read,
);

criterion_main!(benches);
