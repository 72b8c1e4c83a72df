//! Periodic flushing of unflushed indices.
//!
//! Each round visits indices round-robin from where the previous round
//! stopped and flushes at most `flush_quota` of them. The flusher never
//! waits for an index lock: an index whose lock is busy is reported as
//! contended and skipped for a number of rounds that grows linearly with
//! consecutive contentions, up to a cap.

use crate::config::Config;
use crate::error::CoreResult;
use crate::index::FlushAttempt;
use crate::registry::IndexRegistry;
use crate::stats::EngineStats;
use crate::types::IndexId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Default, Clone, Copy)]
struct Backoff {
    contentions: u32,
    skip: u32,
}

/// Counts from one flush round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundReport {
    /// Indices whose state was written.
    pub flushed: usize,
    /// Indices whose lock was busy.
    pub contended: usize,
    /// Indices skipped because of back-off.
    pub skipped: usize,
    /// Indices whose flush failed.
    pub failed: usize,
}

/// Round-robin flush scheduling state.
#[derive(Debug)]
pub(crate) struct FlushScheduler {
    quota: usize,
    step: u32,
    max_backoff: u32,
    cursor: usize,
    backoff: HashMap<IndexId, Backoff>,
}

impl FlushScheduler {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            quota: config.flush_quota.max(1),
            step: config.flush_backoff_step,
            max_backoff: config.max_flush_backoff,
            cursor: 0,
            backoff: HashMap::new(),
        }
    }

    /// Runs one round. Never blocks on an index lock.
    pub(crate) fn run_round(&mut self, registry: &IndexRegistry, stats: &EngineStats) -> RoundReport {
        let mut report = RoundReport::default();
        let count = registry.len();
        if count == 0 {
            return report;
        }

        let mut attempted = 0;
        let mut visited = 0;
        for handle in registry.handles().iter().cycle().skip(self.cursor % count).take(count) {
            if attempted >= self.quota {
                break;
            }
            visited += 1;

            let backoff = self.backoff.entry(handle.id().clone()).or_default();
            if backoff.skip > 0 {
                backoff.skip -= 1;
                report.skipped += 1;
                continue;
            }
            if !handle.has_unflushed() {
                continue;
            }

            attempted += 1;
            match handle.try_flush() {
                Ok(FlushAttempt::Flushed) => {
                    report.flushed += 1;
                    *backoff = Backoff::default();
                }
                Ok(FlushAttempt::Contended) => {
                    report.contended += 1;
                    stats.record_contended_flush();
                    backoff.contentions = backoff.contentions.saturating_add(1);
                    backoff.skip = self.step.saturating_mul(backoff.contentions).min(self.max_backoff);
                    debug!(index = %handle.id(), skip = backoff.skip, "flush contended, backing off");
                }
                Ok(FlushAttempt::Clean | FlushAttempt::NotReady) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(index = %handle.id(), error = %e, "background flush failed");
                }
            }
        }

        self.cursor = (self.cursor + visited) % count;
        report
    }
}

/// Background thread driving a [`FlushScheduler`].
#[derive(Debug)]
pub(crate) struct BackgroundFlusher {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundFlusher {
    pub(crate) fn start(
        registry: Arc<IndexRegistry>,
        scheduler: Arc<Mutex<FlushScheduler>>,
        stats: Arc<EngineStats>,
        interval: Duration,
    ) -> CoreResult<Self> {
        let (stop, signal) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("incridx-flusher".to_string())
            .spawn(move || loop {
                match signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let report = scheduler.lock().run_round(&registry, &stats);
                        if report != RoundReport::default() {
                            debug!(?report, "flush round finished");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        debug!(?interval, "background flusher started");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it to exit. Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("background flusher panicked");
            }
        }
    }
}

impl Drop for BackgroundFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}
