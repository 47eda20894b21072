//! Long-term locks for block payloads.
//!
//! A [SleepLock] is held across storage I/O, so its hold duration is
//! unbounded (disk latency). Contending threads must therefore park and
//! yield the processor rather than spin; the bucket spin locks, by
//! contrast, are only ever held for O(1) list operations.

use std::{
    ops::{Deref, DerefMut},
    sync::{Mutex, MutexGuard, PoisonError},
};

/// A blocking mutual-exclusion lock whose guard may be held across a
/// suspending operation.
///
/// Holding the lock is represented by possession of the [SleepGuard], so
/// "released without being held" is unrepresentable. A panicking holder
/// does not wedge the lock: poison is absorbed and the next borrower
/// proceeds with whatever state the panicking thread left behind, which
/// for a block payload is at worst stale bytes that the validity flag
/// forces to be reloaded.
pub struct SleepLock<T> {
    inner: Mutex<T>,
}

impl<T> SleepLock<T> {
    /// Creates a lock holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquires the lock, parking the calling thread until it is free.
    pub fn lock(&self) -> SleepGuard<'_, T> {
        SleepGuard {
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Exclusive access to the value behind a [SleepLock], released on drop.
pub struct SleepGuard<'a, T> {
    inner: MutexGuard<'a, T>,
}

impl<T> Deref for SleepGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for SleepGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
