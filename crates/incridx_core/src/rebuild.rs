//! Per-index rebuild state machine.
//!
//! ```text
//! Ok ──request──▶ RequiresRebuild ──CAS (one winner)──▶ RebuildInProgress ──finish──▶ Ok
//!                        ▲                                      │
//!                        └──────────── rebuild failed ──────────┘
//! ```
//!
//! Only the thread that wins the compare-and-swap out of `RequiresRebuild`
//! may clear the index. Everybody else either fails fast with
//! [`CoreError::IndexNotReady`](crate::CoreError::IndexNotReady) or blocks
//! until the rebuild settles, depending on the caller's [`ReadPolicy`].

use crate::types::IndexId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::warn;

/// Rebuild status of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebuildStatus {
    /// The index is consistent and accepts reads and writes.
    Ok,
    /// The index is known to be inconsistent and waits for a rebuild.
    RequiresRebuild,
    /// One thread is clearing the index.
    RebuildInProgress,
}

impl RebuildStatus {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::RequiresRebuild => 1,
            Self::RebuildInProgress => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::RequiresRebuild,
            _ => Self::RebuildInProgress,
        }
    }
}

impl fmt::Display for RebuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::RequiresRebuild => "requires rebuild",
            Self::RebuildInProgress => "rebuild in progress",
        };
        f.write_str(s)
    }
}

/// How a query reacts to an index that is not [`RebuildStatus::Ok`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    /// Return `IndexNotReady` immediately.
    #[default]
    FailFast,
    /// Rebuild the index if nobody else is, otherwise wait for it.
    WaitForRebuild,
}

/// Result of a rebuild attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// This caller cleared the index.
    Performed,
    /// Another thread holds the rebuild; this caller backed off.
    AlreadyInProgress,
}

/// Host callbacks around index rebuilds.
///
/// Called on the thread that triggered the transition, so implementations
/// should return quickly and must not call back into the same index.
pub trait IndexEventListener: Send + Sync {
    /// The index was found inconsistent and will be cleared.
    fn on_rebuild_required(&self, _index: &IndexId) {}

    /// This thread won the rebuild and is about to clear the index.
    fn on_rebuild_started(&self, _index: &IndexId) {}

    /// The index was cleared; every file has to be indexed again.
    fn on_rebuild_finished(&self, _index: &IndexId) {}
}

/// Atomic rebuild status plus a condition variable for waiters.
#[derive(Debug)]
pub struct RebuildState {
    status: AtomicU8,
    settle_lock: Mutex<()>,
    settled: Condvar,
}

impl Default for RebuildState {
    fn default() -> Self {
        Self::new()
    }
}

impl RebuildState {
    /// Creates a state in [`RebuildStatus::Ok`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RebuildStatus::Ok.to_u8()),
            settle_lock: Mutex::new(()),
            settled: Condvar::new(),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> RebuildStatus {
        RebuildStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Returns true if the index accepts reads and writes.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status() == RebuildStatus::Ok
    }

    /// Moves `Ok` to `RequiresRebuild`, logging the cause.
    ///
    /// Returns false if the index already required or was undergoing a
    /// rebuild.
    pub fn request(&self, index: &str, cause: &dyn fmt::Display) -> bool {
        let transitioned = self
            .status
            .compare_exchange(
                RebuildStatus::Ok.to_u8(),
                RebuildStatus::RequiresRebuild.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            warn!(index, cause = %cause, "index requires rebuild");
        }
        transitioned
    }

    /// Tries to claim the rebuild.
    ///
    /// Exactly one caller observing `RequiresRebuild` gets the guard.
    #[must_use]
    pub fn try_begin(&self) -> Option<RebuildGuard<'_>> {
        self.status
            .compare_exchange(
                RebuildStatus::RequiresRebuild.to_u8(),
                RebuildStatus::RebuildInProgress.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| RebuildGuard {
                state: self,
                finished: false,
            })
    }

    /// Blocks while a rebuild is in progress and returns the settled status.
    pub fn wait_while_in_progress(&self) -> RebuildStatus {
        let mut guard = self.settle_lock.lock();
        loop {
            let status = self.status();
            if status != RebuildStatus::RebuildInProgress {
                return status;
            }
            self.settled.wait(&mut guard);
        }
    }

    fn settle(&self, status: RebuildStatus) {
        let _guard = self.settle_lock.lock();
        self.status.store(status.to_u8(), Ordering::Release);
        self.settled.notify_all();
    }
}

/// Exclusive right to rebuild one index.
///
/// [`RebuildGuard::finish`] returns the index to `Ok`. Dropping the guard
/// without finishing puts it back to `RequiresRebuild` so a later caller
/// can try again.
#[derive(Debug)]
#[must_use = "dropping the guard without finish() leaves the index requiring a rebuild"]
pub struct RebuildGuard<'a> {
    state: &'a RebuildState,
    finished: bool,
}

impl RebuildGuard<'_> {
    /// Marks the rebuild complete.
    pub fn finish(mut self) {
        self.finished = true;
        self.state.settle(RebuildStatus::Ok);
    }
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.settle(RebuildStatus::RequiresRebuild);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn full_cycle() {
        let state = RebuildState::new();
        assert!(state.try_begin().is_none());

        assert!(state.request("words", &"bad crc"));
        assert!(!state.request("words", &"again"));
        assert_eq!(state.status(), RebuildStatus::RequiresRebuild);

        let guard = state.try_begin().unwrap();
        assert_eq!(state.status(), RebuildStatus::RebuildInProgress);
        assert!(state.try_begin().is_none());
        guard.finish();
        assert!(state.is_ok());
    }

    #[test]
    fn abandoned_guard_requires_rebuild_again() {
        let state = RebuildState::new();
        state.request("words", &"io");
        drop(state.try_begin().unwrap());
        assert_eq!(state.status(), RebuildStatus::RequiresRebuild);
    }

    #[test]
    fn exactly_one_thread_wins() {
        let state = Arc::new(RebuildState::new());
        state.request("words", &"test");
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    barrier.wait();
                    if let Some(guard) = state.try_begin() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        guard.finish();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(state.is_ok());
    }

    #[test]
    fn waiters_wake_when_rebuild_finishes() {
        let state = Arc::new(RebuildState::new());
        state.request("words", &"test");
        let guard_state = Arc::clone(&state);

        let (tx, rx) = std::sync::mpsc::channel();
        let rebuilder = thread::spawn(move || {
            let guard = guard_state.try_begin().unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
            guard.finish();
        });

        rx.recv().unwrap();
        assert_eq!(state.wait_while_in_progress(), RebuildStatus::Ok);
        rebuilder.join().unwrap();
    }
}
