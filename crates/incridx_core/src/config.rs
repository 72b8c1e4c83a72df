//! Engine configuration.

use std::time::Duration;

/// An optional storage extension whose format version participates in the
/// engine-wide common version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageExtension {
    /// Extension name, for diagnostics.
    pub name: String,
    /// Format version of the extension.
    pub version: u32,
}

/// Configuration for opening an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the engine root if it doesn't exist.
    pub create_if_missing: bool,

    /// Base engine version; bumping it invalidates every index.
    pub engine_version: u32,

    /// Storage extensions folded into the common version.
    pub extensions: Vec<StorageExtension>,

    /// Minimum creation-stamp increment applied by `rewrite_version`.
    pub stamp_resolution: i64,

    /// Number of entries each inverted storage keeps in its LRU cache.
    pub cache_capacity: usize,

    /// How often the background flusher wakes up.
    pub flush_interval: Duration,

    /// Maximum number of indices flushed per flusher tick.
    pub flush_quota: usize,

    /// Ticks added to an index's back-off after each contended flush attempt.
    pub flush_backoff_step: u32,

    /// Upper bound on the ticks an index is skipped after contention.
    pub max_flush_backoff: u32,

    /// Whether to start the background flush thread.
    pub background_flush: bool,

    /// Orphan dirty-file queue length that triggers trimming.
    pub orphan_queue_max_size: usize,

    /// Keys visited between cancellation checks during scans.
    pub scan_batch_size: usize,

    /// Whether to verify forward/inverted agreement after each transaction.
    pub sanity_checks: bool,

    /// Garbage share of a table log above which a flush compacts it.
    pub compaction_garbage_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            engine_version: 1,
            extensions: Vec::new(),
            stamp_resolution: 1,
            cache_capacity: 1024,
            flush_interval: Duration::from_secs(5),
            flush_quota: 4,
            flush_backoff_step: 1,
            max_flush_backoff: 8,
            background_flush: true,
            orphan_queue_max_size: 65_536,
            scan_batch_size: 256,
            sanity_checks: false,
            compaction_garbage_ratio: 0.5,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the engine root if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the base engine version.
    #[must_use]
    pub const fn engine_version(mut self, version: u32) -> Self {
        self.engine_version = version;
        self
    }

    /// Adds a storage extension.
    #[must_use]
    pub fn extension(mut self, name: impl Into<String>, version: u32) -> Self {
        self.extensions.push(StorageExtension {
            name: name.into(),
            version,
        });
        self
    }

    /// Sets the creation-stamp resolution.
    #[must_use]
    pub const fn stamp_resolution(mut self, ticks: i64) -> Self {
        self.stamp_resolution = if ticks < 1 { 1 } else { ticks };
        self
    }

    /// Sets the per-index LRU capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, entries: usize) -> Self {
        self.cache_capacity = entries;
        self
    }

    /// Sets the flusher interval.
    #[must_use]
    pub const fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the number of indices flushed per tick.
    #[must_use]
    pub const fn flush_quota(mut self, quota: usize) -> Self {
        self.flush_quota = quota;
        self
    }

    /// Sets whether the background flush thread runs.
    #[must_use]
    pub const fn background_flush(mut self, value: bool) -> Self {
        self.background_flush = value;
        self
    }

    /// Sets the orphan queue trim threshold.
    #[must_use]
    pub const fn orphan_queue_max_size(mut self, size: usize) -> Self {
        self.orphan_queue_max_size = size;
        self
    }

    /// Sets the scan batch size.
    #[must_use]
    pub const fn scan_batch_size(mut self, keys: usize) -> Self {
        self.scan_batch_size = if keys == 0 { 1 } else { keys };
        self
    }

    /// Enables or disables post-transaction sanity checks.
    #[must_use]
    pub const fn sanity_checks(mut self, value: bool) -> Self {
        self.sanity_checks = value;
        self
    }

    /// Sets the linear flush back-off step and its cap, in ticks.
    #[must_use]
    pub const fn flush_backoff(mut self, step: u32, max: u32) -> Self {
        self.flush_backoff_step = step;
        self.max_flush_backoff = max;
        self
    }

    /// Sets the garbage share above which a table log is compacted at flush.
    #[must_use]
    pub const fn compaction_garbage_ratio(mut self, ratio: f64) -> Self {
        self.compaction_garbage_ratio = ratio;
        self
    }

    /// Returns the engine-wide common version.
    ///
    /// Combines the base version with every extension's version, so adding,
    /// removing or upgrading an extension changes the result.
    #[must_use]
    pub fn common_version(&self) -> u32 {
        let mut extensions: Vec<_> = self.extensions.iter().collect();
        extensions.sort_by(|a, b| a.name.cmp(&b.name));
        extensions.iter().fold(self.engine_version, |acc, ext| {
            acc.wrapping_mul(31)
                .wrapping_add(ext.version)
                .wrapping_add(ext.name.len() as u32)
        })
    }
}
