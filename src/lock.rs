//! Mutual exclusion with a bounded wait.
//!
//! [`BoundedLock`] wraps the data that must only be touched by one thread at a
//! time (for a controller: its transport and protocol state) and hands out a
//! [`LockScope`] that releases on every exit path. Acquisition never blocks
//! forever: after the timeout the caller gets a [`LockTimeout`] carrying the
//! diagnostic message it supplied.
//!
//! # Re-entrant calls
//!
//! There is no hidden re-entrancy. A caller that already holds the scope and
//! needs to call a lower-level operation that would normally lock again passes
//! the protected data down explicitly with [`LockScope::reborrow`] or
//! [`LockScope::assume_held`].
//!
//! ```
//! use lab_daq::lock::{BoundedLock, LockScope};
//! use std::time::Duration;
//!
//! fn bump(counter: LockScope<'_, u32>) {
//!     let mut counter = counter;
//!     *counter += 1;
//! }
//!
//! let lock = BoundedLock::new(0u32);
//! let mut scope = lock.acquire(Duration::from_millis(10), "counter busy").unwrap();
//! bump(scope.reborrow());
//! assert_eq!(*scope, 1);
//! ```

use crate::error::DaqError;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Failure to obtain a [`BoundedLock`] in time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (waited {waited:?})")]
pub struct LockTimeout {
    /// Message supplied by the caller describing what was being attempted.
    pub message: String,
    /// How long the caller waited.
    pub waited: Duration,
}

impl From<LockTimeout> for DaqError {
    fn from(timeout: LockTimeout) -> Self {
        DaqError::LockTimeout {
            message: timeout.message,
            waited: timeout.waited,
        }
    }
}

/// A mutex whose acquisition is always bounded by a timeout.
#[derive(Debug, Default)]
pub struct BoundedLock<T> {
    inner: Mutex<T>,
}

impl<T> BoundedLock<T> {
    /// Wraps `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Attempts exclusive acquisition for at most `timeout`.
    ///
    /// On failure the returned [`LockTimeout`] carries `on_timeout` so the
    /// caller can report it without rebuilding context.
    pub fn acquire(
        &self,
        timeout: Duration,
        on_timeout: impl Into<String>,
    ) -> Result<LockScope<'_, T>, LockTimeout> {
        match self.inner.try_lock_for(timeout) {
            Some(guard) => Ok(LockScope::Acquired(guard)),
            None => Err(LockTimeout {
                message: on_timeout.into(),
                waited: timeout,
            }),
        }
    }

    /// Non-blocking acquisition.
    pub fn try_acquire(&self) -> Option<LockScope<'_, T>> {
        self.inner.try_lock().map(LockScope::Acquired)
    }

    /// True while some scope holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// Exclusive access to the data behind a [`BoundedLock`].
///
/// `Acquired` owns the underlying guard and unlocks on drop. `Assumed` is a
/// borrow handed down by a caller that already holds the lock; dropping it
/// releases nothing.
pub enum LockScope<'a, T> {
    /// The lock was taken by this scope.
    Acquired(MutexGuard<'a, T>),
    /// The caller vouches that the lock is already held further up the stack.
    Assumed(&'a mut T),
}

impl<'a, T> LockScope<'a, T> {
    /// Builds a scope over data the caller has already locked.
    ///
    /// Taking `&mut T` means the only way to obtain the reference is through an
    /// existing scope, so the claim cannot be made without actually holding it.
    pub fn assume_held(data: &'a mut T) -> Self {
        LockScope::Assumed(data)
    }

    /// Lends this scope to a sub-operation without releasing it.
    pub fn reborrow(&mut self) -> LockScope<'_, T> {
        LockScope::Assumed(&mut **self)
    }

    /// True if dropping this scope will release the lock.
    pub fn owns_lock(&self) -> bool {
        matches!(self, LockScope::Acquired(_))
    }
}

impl<T> Deref for LockScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            LockScope::Acquired(guard) => &**guard,
            LockScope::Assumed(data) => &**data,
        }
    }
}

impl<T> DerefMut for LockScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            LockScope::Acquired(guard) => &mut **guard,
            LockScope::Assumed(data) => &mut **data,
        }
    }
}
