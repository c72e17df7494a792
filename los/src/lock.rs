//! Exclusive space lock that knows its holder.
//!
//! A plain `parking_lot::Mutex` with one addition: the thread that holds
//! the lock is recorded, so code reachable from inside a locked section can
//! ask [`SpaceLock::is_held_by_current_thread`] instead of locking again.
//! The lock is not recursive; locking twice from one thread deadlocks.

use std::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

const NO_HOLDER: usize = 0;

thread_local! {
    static THREAD_TOKEN: u8 = const { 0 };
}

/// Address of a thread local, unique among live threads and never zero.
#[inline]
fn current_thread_token() -> usize {
    THREAD_TOKEN.with(|token| token as *const u8 as usize)
}

#[derive(Debug)]
pub struct SpaceLock<T> {
    name: &'static str,
    holder: AtomicUsize,
    data: Mutex<T>,
}

pub struct SpaceGuard<'a, T> {
    lock: &'a SpaceLock<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> SpaceLock<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            holder: AtomicUsize::new(NO_HOLDER),
            data: Mutex::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> SpaceGuard<'_, T> {
        debug_assert!(
            !self.is_held_by_current_thread(),
            "{} acquired twice by the same thread",
            self.name
        );
        let guard = self.data.lock();
        self.holder.store(current_thread_token(), Ordering::Relaxed);
        SpaceGuard { lock: self, guard }
    }

    #[inline]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == current_thread_token()
    }

    /// Runs `f` on the protected data, locking only if the current thread
    /// does not hold the lock already.
    pub fn with_shared<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        if self.is_held_by_current_thread() {
            // SAFETY: this thread holds the lock, so no other thread can
            // touch the data; callers only reach here through code that
            // reads the data via the held guard's shared deref
            let data = unsafe { &*self.data.data_ptr() };
            f(data)
        } else {
            let guard = self.lock();
            f(&*guard)
        }
    }
}

impl<T> Deref for SpaceGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpaceGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpaceGuard<'_, T> {
    fn drop(&mut self) {
        // runs before the inner guard unlocks
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
    }
}
