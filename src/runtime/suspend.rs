/* Suspend barriers, checkpoint closures and flip functions */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::locks::{is_held, LockLevel};
use crate::runtime::thread::Thread;
use crate::runtime::thread_state::{StateAndFlags, ThreadFlag, ThreadState};

const BARRIER_MAGIC: u32 = 0x5355_5342;

/// Work run on a thread at a safepoint, or on its behalf while it is suspended.
pub trait Closure: Send + Sync {
    fn run(&self, thread: &Thread);
}

impl<F> Closure for F
where
    F: Fn(&Thread) + Send + Sync,
{
    fn run(&self, thread: &Thread) {
        self(thread)
    }
}

/// A counted latch. Each suspending thread decrements it once; the requester
/// waits for zero.
#[derive(Debug)]
pub struct SuspendBarrier {
    magic: AtomicU32,
    pending: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SuspendBarrier {
    pub fn new(count: i32) -> Arc<SuspendBarrier> {
        Arc::new(SuspendBarrier {
            magic: AtomicU32::new(BARRIER_MAGIC),
            pending: AtomicI32::new(count),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    fn check_magic(&self) -> RuntimeResult<()> {
        let found = self.magic.load(Ordering::Relaxed);
        if found != BARRIER_MAGIC {
            return Err(RuntimeError::BarrierMagicMismatch { found });
        }
        Ok(())
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn add(&self, n: i32) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrement; the last decrement wakes the waiter.
    pub fn pass(&self) -> RuntimeResult<()> {
        self.check_magic()?;
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _g = self.lock.lock();
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Spin with backoff, then sleep on the condition until `timeout` runs out.
    pub fn wait(&self, thread_id: u32, timeout: Duration, spins: u32) -> RuntimeResult<()> {
        self.check_magic()?;
        let backoff = Backoff::new();
        for _ in 0..spins {
            if self.pending() <= 0 {
                return Ok(());
            }
            backoff.snooze();
        }

        let start = Instant::now();
        let deadline = start + timeout;
        let mut g = self.lock.lock();
        while self.pending() > 0 {
            if self.cond.wait_until(&mut g, deadline).timed_out() && self.pending() > 0 {
                return Err(RuntimeError::SuspendTimeout {
                    thread_id,
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self) {
        self.magic.store(0xdead_beef, Ordering::Relaxed);
    }
}

impl Drop for SuspendBarrier {
    fn drop(&mut self) {
        self.magic.store(0, Ordering::Relaxed);
    }
}

/// Runs the wrapped closure, then passes a one-shot barrier the requester waits on.
pub struct BarrierClosure {
    inner: Arc<dyn Closure>,
    barrier: Arc<SuspendBarrier>,
}

impl BarrierClosure {
    pub fn new(inner: Arc<dyn Closure>) -> BarrierClosure {
        BarrierClosure { inner, barrier: SuspendBarrier::new(1) }
    }

    pub fn wait(&self, thread_id: u32, timeout: Duration, spins: u32) -> RuntimeResult<()> {
        self.barrier.wait(thread_id, timeout, spins)
    }
}

impl Closure for BarrierClosure {
    fn run(&self, thread: &Thread) {
        self.inner.run(thread);
        if let Err(e) = self.barrier.pass() {
            thread.runtime().fatal(&e);
        }
    }
}

/// The installed checkpoint and the FIFO behind it.
#[derive(Default)]
pub struct CheckpointQueue {
    slot: Option<Arc<dyn Closure>>,
    overflow: VecDeque<Arc<dyn Closure>>,
}

impl CheckpointQueue {
    fn install(&mut self, closure: &Arc<dyn Closure>) -> RuntimeResult<()> {
        if self.slot.is_some() {
            return Err(RuntimeError::CheckpointAlreadyInstalled);
        }
        self.slot = Some(closure.clone());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slot.iter().count() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

impl Thread {
    /// Queue `closure` to run on this thread at its next poll. Fails if the
    /// thread is not `Runnable`. Caller holds the suspend-count lock.
    pub fn request_checkpoint(&self, closure: Arc<dyn Closure>) -> bool {
        debug_assert!(is_held(LockLevel::ThreadSuspendCountLock));
        let word = &self.tls32.state_and_flags;
        let old = word.load(Ordering::Relaxed);
        if old.state() != ThreadState::Runnable {
            return false;
        }
        let mut queue = self.checkpoints.lock();
        if word.compare_exchange(old, old.with_flag(ThreadFlag::CHECKPOINT_REQUEST), Ordering::SeqCst).is_err() {
            return false;
        }
        if let Err(RuntimeError::CheckpointAlreadyInstalled) = queue.install(&closure) {
            queue.overflow.push_back(closure);
        }
        trace!("thread {} checkpoint queued ({} pending)", self.id(), queue.len());
        true
    }

    pub fn pending_checkpoints(&self) -> usize {
        self.checkpoints.lock().len()
    }

    /// Take the installed checkpoint and run it. The request flag is cleared
    /// only once the overflow queue is drained.
    pub(crate) fn run_checkpoint_function(&self) {
        let closure = {
            let _tsc = self.runtime().locks().thread_suspend_count_lock.lock();
            let mut queue = self.checkpoints.lock();
            let closure = queue.slot.take();
            match queue.overflow.pop_front() {
                Some(next) => queue.slot = Some(next),
                None => {
                    self.tls32.state_and_flags.clear_flag(ThreadFlag::CHECKPOINT_REQUEST, Ordering::Release);
                }
            }
            closure
        };
        if let Some(c) = closure {
            trace!("thread {} running checkpoint", self.id());
            c.run(self);
        }
    }

    pub(crate) fn run_empty_checkpoint(&self) {
        self.tls32.state_and_flags.clear_flag(ThreadFlag::EMPTY_CHECKPOINT_REQUEST, Ordering::AcqRel);
        if let Some(barrier) = self.runtime().thread_list().empty_checkpoint_barrier() {
            if let Err(e) = barrier.pass() {
                self.runtime().fatal(&e);
            }
        }
    }

    /// Add `barrier` to the list this thread passes when it stops being
    /// `Runnable`. Returns false (and installs nothing) if it already stopped.
    pub(crate) fn install_suspend_barrier(&self, barrier: &Arc<SuspendBarrier>) -> bool {
        debug_assert!(is_held(LockLevel::ThreadSuspendCountLock));
        let word = &self.tls32.state_and_flags;
        let mut barriers = self.active_barriers.lock();
        loop {
            let old = word.load(Ordering::Acquire);
            if old.state() != ThreadState::Runnable {
                return false;
            }
            barrier.add(1);
            match word.compare_exchange(old, old.with_flag(ThreadFlag::ACTIVE_SUSPEND_BARRIER), Ordering::SeqCst) {
                Ok(_) => {
                    barriers.push(barrier.clone());
                    return true;
                }
                Err(_) => barrier.add(-1),
            }
        }
    }

    pub(crate) fn pass_active_suspend_barriers(&self) {
        let barriers = {
            let _tsc = self.runtime().locks().thread_suspend_count_lock.lock();
            let mut list = self.active_barriers.lock();
            self.tls32.state_and_flags.clear_flag(ThreadFlag::ACTIVE_SUSPEND_BARRIER, Ordering::Release);
            std::mem::take(&mut *list)
        };
        for b in barriers {
            if let Err(e) = b.pass() {
                self.runtime().fatal(&e);
            }
        }
    }

    /// Install a flip closure. All threads must be suspended.
    pub fn set_flip_function(&self, closure: Arc<dyn Closure>) {
        debug_assert!(!self.state().is_runnable());
        *self.flip_function.lock() = Some(closure);
        self.tls32.state_and_flags.set_flag(ThreadFlag::PENDING_FLIP_FUNCTION, Ordering::Release);
    }

    /// Run this thread's pending flip function on `runner`, unless someone else
    /// claimed it first. Returns true if this call ran it.
    pub fn ensure_flip_function_started(&self, runner: Option<&Thread>) -> bool {
        let word = &self.tls32.state_and_flags;
        loop {
            let old = word.load(Ordering::Acquire);
            if !old.is_flag_set(ThreadFlag::PENDING_FLIP_FUNCTION) {
                return false;
            }
            let running = old.without_flag(ThreadFlag::PENDING_FLIP_FUNCTION).with_flag(ThreadFlag::RUNNING_FLIP_FUNCTION);
            if word.compare_exchange(old, running, Ordering::SeqCst).is_ok() {
                self.run_flip_function(runner);
                return true;
            }
        }
    }

    fn run_flip_function(&self, runner: Option<&Thread>) {
        let closure = self.flip_function.lock().take();
        if let Some(c) = closure {
            debug!("running flip function of thread {} on {:?}", self.id(), runner.map(Thread::id));
            c.run(self);
        }
        self.tls32.state_and_flags.clear_flag(ThreadFlag::RUNNING_FLIP_FUNCTION, Ordering::Release);
        let _tsc = self.runtime().locks().thread_suspend_count_lock.lock();
        self.runtime().locks().resume_cond.notify_all();
    }

    /// Block until a flip function being run by another thread completes.
    pub fn wait_for_flip_function(&self) {
        let locks = self.runtime().locks();
        let mut tsc = locks.thread_suspend_count_lock.lock();
        while self.tls32.state_and_flags.load(Ordering::Acquire).is_flag_set(ThreadFlag::RUNNING_FLIP_FUNCTION) {
            tsc.wait(&locks.resume_cond);
        }
    }

    /// Adjust the suspend count and keep `SUSPEND_REQUEST` in step with it.
    /// Caller holds the suspend-count lock.
    pub(crate) fn modify_suspend_count(&self, delta: i32) {
        debug_assert!(is_held(LockLevel::ThreadSuspendCountLock));
        let old = self.tls32.suspend_count.fetch_add(delta, Ordering::Relaxed);
        let new = old + delta;
        if new < 0 {
            error!("thread {} suspend count went negative ({})", self.id(), new);
            self.tls32.suspend_count.store(0, Ordering::Relaxed);
        }
        if old <= 0 && new > 0 {
            self.tls32.state_and_flags.set_flag(ThreadFlag::SUSPEND_REQUEST, Ordering::SeqCst);
        } else if old > 0 && new <= 0 {
            self.tls32.state_and_flags.clear_flag(ThreadFlag::SUSPEND_REQUEST, Ordering::SeqCst);
        }
    }
}

pub(crate) fn describe_flags(word: StateAndFlags) -> String {
    let names: Vec<&str> = word.flags().iter_names().map(|(n, _)| n).collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn barrier_releases_after_last_pass() {
        let barrier = SuspendBarrier::new(2);
        let passed = AtomicUsize::new(0);
        crossbeam::scope(|s| {
            for _ in 0..2 {
                s.spawn(|_| {
                    passed.fetch_add(1, Ordering::SeqCst);
                    barrier.pass().unwrap();
                });
            }
            barrier.wait(1, Duration::from_secs(5), 4).unwrap();
            assert_eq!(passed.load(Ordering::SeqCst), 2);
        })
        .unwrap();
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn barrier_times_out() {
        let barrier = SuspendBarrier::new(1);
        match barrier.wait(9, Duration::from_millis(20), 0) {
            Err(RuntimeError::SuspendTimeout { thread_id, .. }) => assert_eq!(thread_id, 9),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn corrupt_barrier_is_detected() {
        let barrier = SuspendBarrier::new(1);
        barrier.corrupt();
        assert_eq!(barrier.pass(), Err(RuntimeError::BarrierMagicMismatch { found: 0xdead_beef }));
    }
}
