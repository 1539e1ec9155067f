//! Std user space implementations.

/// Reuse the `Mutex` and `MutexGuard` implementation.
///
/// Used for short critical sections that never block.
pub use spin::{Mutex, MutexGuard};

/// Reuse `HashMap` and `HashSet` in `hashbrown` crate.
pub use hashbrown::{HashMap, HashSet};

/// Reuse `spawn` and `JoinHandle` in `std::thread`.
pub use std::thread::{spawn, JoinHandle};

pub use std::boxed::Box;
pub use std::string::{String, ToString};
pub use std::sync::{Arc, Weak};
pub use std::vec::Vec;

use core::fmt;
use std::sync::PoisonError;

/// Guard of a `CvarMutex`.
pub type CvarMutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;

/// A sleeping mutex that can be paired with a `Condvar`.
///
/// Unlike `std::sync::Mutex`, the lock is never poisoned: a panic while
/// holding it leaves the data accessible to other threads, the same as
/// with `Mutex`.
pub struct CvarMutex<T> {
    inner: std::sync::Mutex<T>,
}

impl<T> CvarMutex<T> {
    /// Constructs a new `CvarMutex`.
    pub fn new(t: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(t),
        }
    }

    /// Acquires the lock, blocking the current thread until it is available.
    pub fn lock(&self) -> CvarMutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: fmt::Debug> fmt::Debug for CvarMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CvarMutex").field("inner", &self.inner).finish()
    }
}

/// A condition variable.
#[derive(Default)]
pub struct Condvar {
    inner: std::sync::Condvar,
}

impl Condvar {
    /// Constructs a new `Condvar`.
    pub fn new() -> Self {
        Self {
            inner: std::sync::Condvar::new(),
        }
    }

    /// Blocks the current thread until this condition variable receives a notification.
    ///
    /// It may also wake up spuriously, so callers must re-check their condition.
    pub fn wait<'a, T>(&self, guard: CvarMutexGuard<'a, T>) -> CvarMutexGuard<'a, T> {
        self.inner
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes a single waiter up, if any.
    pub fn notify_one(&self) {
        self.inner.notify_one()
    }

    /// Wakes all waiters up, if any.
    pub fn notify_all(&self) {
        self.inner.notify_all()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
