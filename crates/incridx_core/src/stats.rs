//! Engine statistics.
//!
//! ```rust,ignore
//! let snapshot = engine.stats().snapshot();
//! println!("updates: {}, contended flushes: {}", snapshot.updates, snapshot.contended_flushes);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct EngineStats {
    updates: AtomicU64,
    removals: AtomicU64,
    queries: AtomicU64,
    keys_scanned: AtomicU64,
    flushes: AtomicU64,
    contended_flushes: AtomicU64,
    compactions: AtomicU64,
    rebuilds: AtomicU64,
    cancelled_scans: AtomicU64,
    errors: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_keys_scanned(&self, keys: u64) {
        self.keys_scanned.fetch_add(keys, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_contended_flush(&self) {
        self.contended_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled_scan(&self) {
        self.cancelled_scans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed update transactions.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Completed removal transactions.
    pub fn removals(&self) -> u64 {
        self.removals.load(Ordering::Relaxed)
    }

    /// Queries served.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Keys handed to `process_keys` processors.
    pub fn keys_scanned(&self) -> u64 {
        self.keys_scanned.load(Ordering::Relaxed)
    }

    /// Index flushes performed.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Background flush attempts that backed off because the index was busy.
    pub fn contended_flushes(&self) -> u64 {
        self.contended_flushes.load(Ordering::Relaxed)
    }

    /// Table logs rewritten by compaction.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Index rebuilds performed.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Scans stopped by cancellation.
    pub fn cancelled_scans(&self) -> u64 {
        self.cancelled_scans.load(Ordering::Relaxed)
    }

    /// Failed transactions and queries.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            updates: self.updates(),
            removals: self.removals(),
            queries: self.queries(),
            keys_scanned: self.keys_scanned(),
            flushes: self.flushes(),
            contended_flushes: self.contended_flushes(),
            compactions: self.compactions(),
            rebuilds: self.rebuilds(),
            cancelled_scans: self.cancelled_scans(),
            errors: self.errors(),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Completed update transactions.
    pub updates: u64,
    /// Completed removal transactions.
    pub removals: u64,
    /// Queries served.
    pub queries: u64,
    /// Keys handed to `process_keys` processors.
    pub keys_scanned: u64,
    /// Index flushes performed.
    pub flushes: u64,
    /// Background flush attempts that backed off.
    pub contended_flushes: u64,
    /// Table logs rewritten by compaction.
    pub compactions: u64,
    /// Index rebuilds performed.
    pub rebuilds: u64,
    /// Scans stopped by cancellation.
    pub cancelled_scans: u64,
    /// Failed transactions and queries.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(EngineStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = EngineStats::new();
        stats.record_update();
        stats.record_update();
        stats.record_keys_scanned(40);
        stats.record_contended_flush();

        let snap = stats.snapshot();
        assert_eq!(snap.updates, 2);
        assert_eq!(snap.keys_scanned, 40);
        assert_eq!(snap.contended_flushes, 1);
        assert_eq!(snap.rebuilds, 0);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(EngineStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        stats.record_query();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.queries(), 800);
    }
}
