/* Global lock levels and an ordered mutex wrapper */

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::time::Instant;

use log::error;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::runtime::error::RuntimeError;

/// Locks must be taken in decreasing level order: a thread may only acquire
/// a lock whose level is below every lock it already holds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    ThreadSuspendCountLock = 0,
    ParkLock,
    AbortLock,
    HeapLock,
    InterpreterCacheLock,
    ThreadListLock,
    RuntimeShutdownLock,
}

impl LockLevel {
    pub const COUNT: usize = 7;

    pub fn name(&self) -> &'static str {
        match self {
            LockLevel::ThreadSuspendCountLock => "thread_suspend_count_lock",
            LockLevel::ParkLock => "park_lock",
            LockLevel::AbortLock => "abort_lock",
            LockLevel::HeapLock => "heap_lock",
            LockLevel::InterpreterCacheLock => "interpreter_cache_lock",
            LockLevel::ThreadListLock => "thread_list_lock",
            LockLevel::RuntimeShutdownLock => "runtime_shutdown_lock",
        }
    }

    fn from_index(i: usize) -> LockLevel {
        match i {
            0 => LockLevel::ThreadSuspendCountLock,
            1 => LockLevel::ParkLock,
            2 => LockLevel::AbortLock,
            3 => LockLevel::HeapLock,
            4 => LockLevel::InterpreterCacheLock,
            5 => LockLevel::ThreadListLock,
            _ => LockLevel::RuntimeShutdownLock,
        }
    }
}

thread_local! {
    // One bit per level currently held by this OS thread.
    static HELD_LEVELS: Cell<u32> = const { Cell::new(0) };
}

/// Levels held by the calling OS thread, lowest first.
pub fn held_levels() -> Vec<LockLevel> {
    let mask = HELD_LEVELS.with(|h| h.get());
    (0..LockLevel::COUNT).filter(|i| mask & (1 << i) != 0).map(LockLevel::from_index).collect()
}

pub fn is_held(level: LockLevel) -> bool {
    HELD_LEVELS.with(|h| h.get() & (1 << level as u32) != 0)
}

/// Check that `level` may be acquired given the locks this thread holds.
pub fn check_acquire(level: LockLevel) -> Result<(), RuntimeError> {
    let mask = HELD_LEVELS.with(|h| h.get());
    let lowest_held = (0..LockLevel::COUNT).find(|i| mask & (1 << i) != 0);
    match lowest_held {
        Some(i) if i <= level as usize => Err(RuntimeError::LockLevelViolation {
            acquiring: level.name(),
            held: LockLevel::from_index(i).name(),
        }),
        _ => Ok(()),
    }
}

fn mark_held(level: LockLevel, held: bool) {
    HELD_LEVELS.with(|h| {
        let bit = 1 << level as u32;
        h.set(if held { h.get() | bit } else { h.get() & !bit });
    });
}

/// A `parking_lot` mutex that records its level in the holder's table and,
/// in debug builds, refuses out-of-order acquisition.
#[derive(Debug)]
pub struct LevelMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> LevelMutex<T> {
    pub const fn new(level: LockLevel, value: T) -> LevelMutex<T> {
        LevelMutex { level, inner: Mutex::new(value) }
    }

    pub fn level(&self) -> LockLevel {
        self.level
    }

    pub fn lock(&self) -> LevelGuard<'_, T> {
        if cfg!(debug_assertions) {
            if let Err(e) = check_acquire(self.level) {
                error!("{}", e);
                panic!("{}", e);
            }
        }
        let guard = self.inner.lock();
        mark_held(self.level, true);
        LevelGuard { level: self.level, guard }
    }

    pub fn try_lock(&self) -> Option<LevelGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        mark_held(self.level, true);
        Some(LevelGuard { level: self.level, guard })
    }
}

pub struct LevelGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> LevelGuard<'_, T> {
    /// Block on `cond`, releasing the lock while waiting.
    pub fn wait(&mut self, cond: &Condvar) {
        mark_held(self.level, false);
        cond.wait(&mut self.guard);
        mark_held(self.level, true);
    }

    /// Like `wait` with a deadline; returns true on timeout.
    pub fn wait_until(&mut self, cond: &Condvar, deadline: Instant) -> bool {
        mark_held(self.level, false);
        let r = cond.wait_until(&mut self.guard, deadline);
        mark_held(self.level, true);
        r.timed_out()
    }
}

impl<T> Deref for LevelGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LevelGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for LevelGuard<'_, T> {
    fn drop(&mut self) {
        mark_held(self.level, false);
    }
}

/// The process-wide locks every thread-list operation goes through.
#[derive(Debug)]
pub struct GlobalLocks {
    pub thread_suspend_count_lock: LevelMutex<()>,
    /// Signalled whenever a suspend count drops or a flip function finishes.
    pub resume_cond: Condvar,
    pub runtime_shutdown_lock: LevelMutex<bool>,
    pub abort_lock: LevelMutex<()>,
}

impl GlobalLocks {
    pub fn new() -> GlobalLocks {
        GlobalLocks {
            thread_suspend_count_lock: LevelMutex::new(LockLevel::ThreadSuspendCountLock, ()),
            resume_cond: Condvar::new(),
            runtime_shutdown_lock: LevelMutex::new(LockLevel::RuntimeShutdownLock, false),
            abort_lock: LevelMutex::new(LockLevel::AbortLock, ()),
        }
    }
}

impl Default for GlobalLocks {
    fn default() -> Self {
        GlobalLocks::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descending_order_is_allowed()
    {
        let list = LevelMutex::new(LockLevel::ThreadListLock, 1);
        let tsc = LevelMutex::new(LockLevel::ThreadSuspendCountLock, 2);
        let a = list.lock();
        let b = tsc.lock();
        assert_eq!(*a + *b, 3);
        assert_eq!(held_levels(), vec![LockLevel::ThreadSuspendCountLock, LockLevel::ThreadListLock]);
        drop(b);
        drop(a);
        assert!(held_levels().is_empty());
    }

    #[test]
    fn inversion_is_reported()
    {
        let tsc = LevelMutex::new(LockLevel::ThreadSuspendCountLock, ());
        let _g = tsc.lock();
        assert!(matches!(check_acquire(LockLevel::ThreadListLock), Err(RuntimeError::LockLevelViolation { .. })));
        assert!(is_held(LockLevel::ThreadSuspendCountLock));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "violates lock ordering")]
    fn inversion_panics_in_debug()
    {
        let tsc = LevelMutex::new(LockLevel::ThreadSuspendCountLock, ());
        let list = LevelMutex::new(LockLevel::ThreadListLock, ());
        let _a = tsc.lock();
        let _b = list.lock();
    }
}
