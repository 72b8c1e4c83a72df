//! Two-state buffering gate.
//!
//! Writers enter the gate in one of two modes. Persistent writers update the
//! on-disk forward and inverted tables; buffered writers update in-memory
//! overlays used for speculative (unsaved) content. The modes exclude each
//! other: the gate counter moves away from zero only in the direction of the
//! mode already inside, and a caller of the other mode blocks until the
//! counter returns to zero.
//!
//! When the last buffered writer leaves, the drain hook runs before anyone
//! can enter again. The engine uses it to drop every index's overlay so
//! speculative data never outlives its scope.

use crate::content::ContentKind;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

const DRAINING: i64 = i64::MIN;

/// Where index writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferMode {
    /// Writes reach the persistent tables.
    Persistent,
    /// Writes go to per-index in-memory overlays.
    Buffered,
}

impl BufferMode {
    const fn delta(self) -> i64 {
        match self {
            Self::Persistent => -1,
            Self::Buffered => 1,
        }
    }

    const fn admits(self, state: i64) -> bool {
        match self {
            Self::Persistent => state <= 0 && state != DRAINING,
            Self::Buffered => state >= 0,
        }
    }
}

impl From<ContentKind> for BufferMode {
    fn from(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Persisted => Self::Persistent,
            ContentKind::Speculative => Self::Buffered,
        }
    }
}

type DrainHook = Box<dyn Fn() + Send + Sync>;

/// Exclusive gate between persistent and buffered writers.
pub struct BufferingGate {
    state: AtomicI64,
    wait_lock: Mutex<()>,
    changed: Condvar,
    drain_hook: Option<DrainHook>,
}

impl fmt::Debug for BufferingGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferingGate")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for BufferingGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferingGate {
    /// Creates an open gate without a drain hook.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicI64::new(0),
            wait_lock: Mutex::new(()),
            changed: Condvar::new(),
            drain_hook: None,
        }
    }

    /// Creates a gate that runs `hook` whenever the last buffered writer leaves.
    #[must_use]
    pub fn with_drain_hook(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            drain_hook: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    /// Returns the mode currently inside the gate, if any.
    #[must_use]
    pub fn active_mode(&self) -> Option<BufferMode> {
        match self.state.load(Ordering::Acquire) {
            0 | DRAINING => None,
            n if n > 0 => Some(BufferMode::Buffered),
            _ => Some(BufferMode::Persistent),
        }
    }

    /// Returns how many writers are inside the gate.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        match self.state.load(Ordering::Acquire) {
            DRAINING => 0,
            n => usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX),
        }
    }

    fn try_acquire(&self, mode: BufferMode) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !mode.admits(current) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + mode.delta(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 0 {
                        debug!(?mode, "buffering gate switched mode");
                    }
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Enters the gate, blocking while the other mode is inside.
    pub fn enter(&self, mode: BufferMode) -> BufferingGuard<'_> {
        loop {
            if self.try_acquire(mode) {
                return BufferingGuard { gate: self, mode };
            }
            let mut guard = self.wait_lock.lock();
            if self.try_acquire(mode) {
                return BufferingGuard { gate: self, mode };
            }
            self.changed.wait(&mut guard);
        }
    }

    /// Enters the gate only if that does not require waiting.
    #[must_use]
    pub fn try_enter(&self, mode: BufferMode) -> Option<BufferingGuard<'_>> {
        self.try_acquire(mode)
            .then(|| BufferingGuard { gate: self, mode })
    }

    fn release(&self, mode: BufferMode) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if mode == BufferMode::Buffered && current == 1 {
                if self
                    .state
                    .compare_exchange_weak(1, DRAINING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    current = self.state.load(Ordering::Acquire);
                    continue;
                }
                if let Some(hook) = &self.drain_hook {
                    hook();
                }
                debug!("buffering gate drained");
                let _guard = self.wait_lock.lock();
                self.state.store(0, Ordering::Release);
                self.changed.notify_all();
                return;
            }

            let next = current - mode.delta();
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if next == 0 {
                        let _guard = self.wait_lock.lock();
                        self.changed.notify_all();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Membership in the [`BufferingGate`]; leaving happens on drop.
#[derive(Debug)]
#[must_use = "the gate is left as soon as the guard is dropped"]
pub struct BufferingGuard<'a> {
    gate: &'a BufferingGate,
    mode: BufferMode,
}

impl BufferingGuard<'_> {
    /// Returns the mode this guard holds.
    #[must_use]
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Leaves the gate.
    pub fn leave(self) {}
}

impl Drop for BufferingGuard<'_> {
    fn drop(&mut self) {
        self.gate.release(self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_mode_nests() {
        let gate = BufferingGate::new();
        let a = gate.enter(BufferMode::Buffered);
        let b = gate.enter(BufferMode::Buffered);
        assert_eq!(gate.active_mode(), Some(BufferMode::Buffered));
        assert_eq!(gate.occupancy(), 2);
        assert!(gate.try_enter(BufferMode::Persistent).is_none());
        drop(a);
        assert_eq!(gate.occupancy(), 1);
        assert!(gate.try_enter(BufferMode::Persistent).is_none());
        b.leave();
        assert_eq!(gate.active_mode(), None);
        assert_eq!(gate.occupancy(), 0);
        assert!(gate.try_enter(BufferMode::Persistent).is_some());
    }

    #[test]
    fn drain_hook_runs_once_per_buffered_period() {
        let drains = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drains);
        let gate = BufferingGate::with_drain_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        {
            let _a = gate.enter(BufferMode::Buffered);
            let _b = gate.enter(BufferMode::Buffered);
        }
        drop(gate.enter(BufferMode::Persistent));
        drop(gate.enter(BufferMode::Buffered));

        assert_eq!(drains.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn opposite_mode_blocks_until_exit() {
        let gate = Arc::new(BufferingGate::new());
        let held = gate.enter(BufferMode::Persistent);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let guard = gate.enter(BufferMode::Buffered);
                tx.send(guard.mode()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(held);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            BufferMode::Buffered
        );
        waiter.join().unwrap();
        assert_eq!(gate.active_mode(), None);
    }

    #[test]
    fn content_kind_selects_mode() {
        assert_eq!(BufferMode::from(ContentKind::Persisted), BufferMode::Persistent);
        assert_eq!(BufferMode::from(ContentKind::Speculative), BufferMode::Buffered);
    }
}
