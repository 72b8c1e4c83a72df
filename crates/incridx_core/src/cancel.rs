//! Cancellation tokens and per-task context.
//!
//! Long scans poll a [`CancellationToken`] between batches and unwind with
//! [`Cancelled`] through ordinary `Result` propagation. A [`TaskContext`]
//! travels down the call chain of one indexing or query task and records
//! which indices that task is currently inside, so an update or scan issued
//! from within another operation on the same index fails fast instead of
//! deadlocking on the index lock.

use crate::error::{CoreError, CoreResult};
use crate::types::IndexId;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The operation stopped because its token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// A cloneable, thread-safe cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every operation holding a clone of this token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` if cancellation was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// State carried by a single indexing or query task.
///
/// Not `Sync`: each task owns its context and passes it by reference.
#[derive(Debug, Default)]
pub struct TaskContext {
    token: CancellationToken,
    active: RefCell<Vec<IndexId>>,
}

impl TaskContext {
    /// Creates a context with a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context observing the given token.
    #[must_use]
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            active: RefCell::default(),
        }
    }

    /// Returns the task's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Polls the cancellation token.
    pub fn check_cancelled(&self) -> Result<(), Cancelled> {
        self.token.check()
    }

    /// Returns true if this task is currently inside `index`.
    #[must_use]
    pub fn is_active(&self, index: &IndexId) -> bool {
        self.active.borrow().contains(index)
    }

    /// Fails with [`CoreError::Reentrant`] if this task is inside `index`.
    pub fn ensure_not_active(&self, index: &IndexId) -> CoreResult<()> {
        if self.is_active(index) {
            return Err(CoreError::Reentrant {
                index: index.to_string(),
            });
        }
        Ok(())
    }

    /// Marks `index` as in use by this task until the marker drops.
    pub fn enter(&self, index: &IndexId) -> CoreResult<ActiveMarker<'_>> {
        self.ensure_not_active(index)?;
        self.active.borrow_mut().push(index.clone());
        Ok(ActiveMarker {
            context: self,
            index: index.clone(),
        })
    }
}

/// Clears a [`TaskContext`] in-progress marker on drop.
#[derive(Debug)]
pub struct ActiveMarker<'a> {
    context: &'a TaskContext,
    index: IndexId,
}

impl Drop for ActiveMarker<'_> {
    fn drop(&mut self) {
        let mut active = self.context.active.borrow_mut();
        if let Some(pos) = active.iter().rposition(|id| *id == self.index) {
            active.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cancellation_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(Cancelled));
    }

    #[test]
    fn marker_blocks_reentry_until_dropped() {
        let ctx = TaskContext::new();
        let words = IndexId::new("words");
        let names = IndexId::new("names");

        let marker = ctx.enter(&words).unwrap();
        assert!(ctx.is_active(&words));
        assert!(matches!(
            ctx.enter(&words),
            Err(CoreError::Reentrant { .. })
        ));

        // Other indices stay available.
        let other = ctx.enter(&names).unwrap();
        drop(other);

        drop(marker);
        assert!(!ctx.is_active(&words));
        assert!(ctx.ensure_not_active(&words).is_ok());
    }

    #[test]
    fn context_observes_external_token() {
        let token = CancellationToken::new();
        let ctx = TaskContext::with_token(token.clone());
        token.cancel();
        assert!(ctx.check_cancelled().is_err());
    }
}
