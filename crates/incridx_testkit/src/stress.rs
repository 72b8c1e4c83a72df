//! Concurrency stress helpers.
//!
//! These drive an engine from several threads at once and report
//! throughput; correctness is checked afterwards with the consistency
//! helpers.

use incridx_core::{Engine, FileContent, FileId, IndexDefinition, IndexRef, ReadPolicy, TaskContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Operations per thread.
    pub ops_per_thread: usize,
    /// Distinct file ids shared by all threads.
    pub files: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 200,
            files: 32,
        }
    }
}

/// Runs `task(thread_index)` on `threads` threads released together.
pub fn run_concurrently<F>(threads: usize, task: F)
where
    F: Fn(usize) + Sync,
{
    let barrier = Barrier::new(threads);
    thread::scope(|scope| {
        for i in 0..threads {
            let barrier = &barrier;
            let task = &task;
            scope.spawn(move || {
                barrier.wait();
                task(i);
            });
        }
    });
}

fn synthetic_text(thread: usize, op: usize) -> String {
    let words = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];
    (0..3).map(|i| words[(thread + op + i * op) % words.len()]).collect::<Vec<_>>().join(" ")
}

/// Indexes overlapping files from several threads at once.
pub fn stress_concurrent_indexing(engine: &Engine, config: &StressConfig) -> StressResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    run_concurrently(config.threads, |thread| {
        let ctx = TaskContext::new();
        for op in 0..config.ops_per_thread {
            let file = FileId::new((thread * config.ops_per_thread + op) as u32 % config.files.max(1) + 1);
            let content = FileContent::persisted(synthetic_text(thread, op).into_bytes());
            match engine.index_file(file, &content, &ctx) {
                Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                Err(_) => failed.fetch_add(1, Ordering::Relaxed),
            };
        }
    });

    StressResult::new(successful.into_inner(), failed.into_inner(), start.elapsed())
}

/// Runs point queries on some threads while others index.
pub fn stress_mixed<D>(engine: &Engine, index: &IndexRef<D>, keys: &[D::Key], config: &StressConfig) -> StressResult
where
    D: IndexDefinition,
{
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    run_concurrently(config.threads.max(2), |thread| {
        let ctx = TaskContext::new();
        for op in 0..config.ops_per_thread {
            let outcome = if thread % 2 == 0 {
                let file = FileId::new(op as u32 % config.files.max(1) + 1);
                let content = FileContent::persisted(synthetic_text(thread, op).into_bytes());
                engine.index_file(file, &content, &ctx).map(drop)
            } else if keys.is_empty() {
                Ok(())
            } else {
                engine
                    .get_files(index, &keys[op % keys.len()], ReadPolicy::WaitForRebuild)
                    .map(drop)
            };
            match outcome {
                Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                Err(_) => failed.fetch_add(1, Ordering::Relaxed),
            };
        }
    });

    StressResult::new(successful.into_inner(), failed.into_inner(), start.elapsed())
}
