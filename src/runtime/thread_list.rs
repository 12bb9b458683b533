/* The set of attached threads and the operations that stop or visit them */

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, trace};
use parking_lot::Mutex;

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::locks::{LevelMutex, LockLevel};
use crate::runtime::suspend::{BarrierClosure, Closure, SuspendBarrier};
use crate::runtime::thread::Thread;
use crate::runtime::thread_state::{ThreadFlag, ThreadState};
use crate::runtime::Runtime;

pub struct ThreadList {
    runtime: Weak<Runtime>,
    list: LevelMutex<Vec<Arc<Thread>>>,
    /// Outstanding `suspend_all` calls; new threads start with this count.
    suspend_all_count: AtomicI32,
    empty_checkpoint_barrier: Mutex<Option<Arc<SuspendBarrier>>>,
    empty_checkpoint_serial: Mutex<()>,
}

fn is_requester(t: &Thread, requester: Option<&Thread>) -> bool {
    requester.is_some_and(|r| r.id() == t.id())
}

impl ThreadList {
    pub(crate) fn new(runtime: Weak<Runtime>) -> ThreadList {
        ThreadList {
            runtime,
            list: LevelMutex::new(LockLevel::ThreadListLock, vec![]),
            suspend_all_count: AtomicI32::new(0),
            empty_checkpoint_barrier: Mutex::new(None),
            empty_checkpoint_serial: Mutex::new(()),
        }
    }

    fn runtime(&self) -> Arc<Runtime> {
        match self.runtime.upgrade() {
            Some(rt) => rt,
            None => {
                error!("thread list used after its runtime was dropped");
                std::process::abort()
            }
        }
    }

    pub(crate) fn register(&self, thread: &Arc<Thread>) -> RuntimeResult<()> {
        let rt = self.runtime();
        let shutting_down = rt.locks().runtime_shutdown_lock.lock();
        if *shutting_down {
            return Err(RuntimeError::ThreadNotAttached);
        }
        let mut list = self.list.lock();
        let _tsc = rt.locks().thread_suspend_count_lock.lock();
        let pending = self.suspend_all_count.load(Ordering::Relaxed);
        if pending > 0 {
            thread.modify_suspend_count(pending);
        }
        list.push(thread.clone());
        Ok(())
    }

    /// Remove `thread`, firing its exit flags before the record is released.
    pub(crate) fn unregister(&self, thread: &Thread) {
        let rt = self.runtime();
        let _shutdown = rt.locks().runtime_shutdown_lock.lock();
        let mut list = self.list.lock();
        thread.signal_exit_flags();
        list.retain(|t| t.id() != thread.id());
        thread.set_state(ThreadState::Terminated);
        let _tsc = rt.locks().thread_suspend_count_lock.lock();
        rt.locks().resume_cond.notify_all();
    }

    pub fn find(&self, tid: u32) -> Option<Arc<Thread>> {
        self.list.lock().iter().find(|t| t.id() == tid).cloned()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.list.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub(crate) fn empty_checkpoint_barrier(&self) -> Option<Arc<SuspendBarrier>> {
        self.empty_checkpoint_barrier.lock().clone()
    }

    fn wait_timeout(&self, rt: &Runtime) -> (Duration, u32) {
        let opts = rt.options();
        (Duration::from_millis(opts.suspend_timeout), opts.suspend_backoff_spins)
    }

    /// Wait on `barrier`, moving a runnable requester out of `Runnable`
    /// for the duration. A timeout is fatal.
    fn wait_barrier(&self, rt: &Runtime, requester: Option<&Thread>, state: ThreadState, tid: u32, barrier: &SuspendBarrier) {
        let (timeout, spins) = self.wait_timeout(rt);
        let wait = || barrier.wait(tid, timeout, spins);
        let r = match requester {
            Some(r) if r.state().is_runnable() => r.with_state(state, wait),
            _ => wait(),
        };
        if let Err(e) = r {
            rt.fatal(&e);
        }
    }

    /// Stop every thread but the requester at its next safepoint.
    pub fn suspend_all(&self, requester: Option<&Thread>) {
        let rt = self.runtime();
        let barrier = SuspendBarrier::new(0);
        let mut first_runnable = None;
        {
            let list = self.list.lock();
            let _tsc = rt.locks().thread_suspend_count_lock.lock();
            self.suspend_all_count.fetch_add(1, Ordering::Relaxed);
            for t in list.iter().filter(|t| !is_requester(t, requester)) {
                t.modify_suspend_count(1);
                if t.install_suspend_barrier(&barrier) {
                    first_runnable.get_or_insert(t.id());
                    t.trigger_suspend();
                }
            }
        }
        if let Some(tid) = first_runnable {
            self.wait_barrier(&rt, requester, ThreadState::WaitingForSuspendBarrier, tid, &barrier);
        }
        debug!("all threads suspended");
    }

    pub fn resume_all(&self, requester: Option<&Thread>) {
        let rt = self.runtime();
        let list = self.list.lock();
        let _tsc = rt.locks().thread_suspend_count_lock.lock();
        self.suspend_all_count.fetch_sub(1, Ordering::Relaxed);
        for t in list.iter().filter(|t| !is_requester(t, requester)) {
            t.modify_suspend_count(-1);
        }
        rt.locks().resume_cond.notify_all();
        debug!("all threads resumed");
    }

    /// Suspend one thread and wait until it has left `Runnable`.
    pub fn suspend_thread_by_id(&self, tid: u32, requester: Option<&Thread>) -> RuntimeResult<Arc<Thread>> {
        let rt = self.runtime();
        let barrier = SuspendBarrier::new(0);
        let (target, installed) = {
            let list = self.list.lock();
            let target = list.iter().find(|t| t.id() == tid).cloned().ok_or(RuntimeError::ThreadDied { thread_id: tid })?;
            let _tsc = rt.locks().thread_suspend_count_lock.lock();
            target.modify_suspend_count(1);
            let installed = target.install_suspend_barrier(&barrier);
            (target, installed)
        };
        if installed {
            target.trigger_suspend();
            self.wait_barrier(&rt, requester, ThreadState::WaitingForSuspendBarrier, tid, &barrier);
        }
        debug!("thread {} suspended", tid);
        Ok(target)
    }

    pub fn resume(&self, thread: &Thread) {
        let rt = self.runtime();
        let _tsc = rt.locks().thread_suspend_count_lock.lock();
        thread.modify_suspend_count(-1);
        rt.locks().resume_cond.notify_all();
    }

    /// Run `closure` once for every thread. Runnable threads run it themselves
    /// at their next poll; the others are held suspended while the requester
    /// runs it on their behalf. Returns the number of threads covered.
    pub fn run_checkpoint(&self, closure: Arc<dyn Closure>, requester: Option<&Thread>) -> usize {
        let rt = self.runtime();
        let mut on_behalf = vec![];
        let mut count = 0;
        {
            let list = self.list.lock();
            let _tsc = rt.locks().thread_suspend_count_lock.lock();
            for t in list.iter().filter(|t| !is_requester(t, requester)) {
                count += 1;
                loop {
                    if t.request_checkpoint(closure.clone()) {
                        t.trigger_suspend();
                        break;
                    }
                    t.modify_suspend_count(1);
                    if !t.state().is_runnable() {
                        on_behalf.push(t.clone());
                        break;
                    }
                    // It became runnable under us; ask again.
                    t.modify_suspend_count(-1);
                }
            }
        }
        trace!("checkpoint: {} queued, {} run on behalf", count - on_behalf.len(), on_behalf.len());

        for t in &on_behalf {
            closure.run(t);
        }
        if let Some(r) = requester {
            closure.run(r);
            count += 1;
        }

        if !on_behalf.is_empty() {
            let _tsc = rt.locks().thread_suspend_count_lock.lock();
            for t in &on_behalf {
                t.modify_suspend_count(-1);
            }
            rt.locks().resume_cond.notify_all();
        }
        count
    }

    /// `run_checkpoint`, then wait until every thread has finished the closure.
    pub fn run_checkpoint_and_wait(&self, closure: Arc<dyn Closure>, requester: Option<&Thread>) -> usize {
        let rt = self.runtime();
        let barrier = SuspendBarrier::new(0);
        let done = barrier.clone();
        let counted: Arc<dyn Closure> = Arc::new(move |t: &Thread| {
            closure.run(t);
            if let Err(e) = done.pass() {
                t.runtime().fatal(&e);
            }
        });
        let count = self.run_checkpoint(counted, requester);
        barrier.add(count as i32);
        let tid = requester.map_or(0, Thread::id);
        self.wait_barrier(&rt, requester, ThreadState::WaitingForCheckPointsToRun, tid, &barrier);
        count
    }

    /// Run `closure` for thread `tid` and wait for it. Runs it locally when the
    /// requester is the target, through a checkpoint when the target is
    /// runnable, and on the target's behalf while holding it suspended
    /// otherwise. False if the thread is gone.
    pub fn request_synchronous_checkpoint(&self, tid: u32, closure: Arc<dyn Closure>, requester: Option<&Thread>) -> bool {
        if let Some(r) = requester.filter(|r| r.id() == tid) {
            closure.run(r);
            return true;
        }
        let rt = self.runtime();
        loop {
            let list = self.list.lock();
            let Some(target) = list.iter().find(|t| t.id() == tid).cloned() else {
                return false;
            };
            let tsc = rt.locks().thread_suspend_count_lock.lock();
            if target.state().is_runnable() {
                let barrier_closure = Arc::new(BarrierClosure::new(closure.clone()));
                if target.request_checkpoint(barrier_closure.clone()) {
                    target.trigger_suspend();
                    drop(tsc);
                    drop(list);
                    let (timeout, spins) = self.wait_timeout(&rt);
                    let wait = || barrier_closure.wait(tid, timeout, spins);
                    let r = match requester {
                        Some(r) if r.state().is_runnable() => r.with_state(ThreadState::WaitingForCheckPointsToRun, wait),
                        _ => wait(),
                    };
                    if let Err(e) = r {
                        rt.fatal(&e);
                    }
                    return true;
                }
                continue;
            }

            target.modify_suspend_count(1);
            if target.state().is_runnable() {
                target.modify_suspend_count(-1);
                continue;
            }
            drop(tsc);
            drop(list);
            closure.run(&target);
            let _tsc = rt.locks().thread_suspend_count_lock.lock();
            target.modify_suspend_count(-1);
            rt.locks().resume_cond.notify_all();
            return true;
        }
    }

    /// A no-op checkpoint: returns once every runnable thread has polled.
    pub fn run_empty_checkpoint(&self, requester: Option<&Thread>) {
        let rt = self.runtime();
        let _serial = self.empty_checkpoint_serial.lock();
        let barrier = SuspendBarrier::new(0);
        *self.empty_checkpoint_barrier.lock() = Some(barrier.clone());
        {
            let list = self.list.lock();
            for t in list.iter().filter(|t| !is_requester(t, requester)) {
                let word = &t.tls32.state_and_flags;
                loop {
                    let old = word.load(Ordering::Acquire);
                    if !old.state().is_runnable() {
                        break;
                    }
                    barrier.add(1);
                    if word.compare_exchange(old, old.with_flag(ThreadFlag::EMPTY_CHECKPOINT_REQUEST), Ordering::SeqCst).is_ok() {
                        t.trigger_suspend();
                        break;
                    }
                    barrier.add(-1);
                }
            }
        }
        let tid = requester.map_or(0, Thread::id);
        self.wait_barrier(&rt, requester, ThreadState::WaitingForCheckPointsToRun, tid, &barrier);
        *self.empty_checkpoint_barrier.lock() = None;
    }

    /// Suspend everyone, install `closure` as each thread's flip function,
    /// resume, then make sure every flip has run. The requester's own roots
    /// are flipped directly.
    pub fn flip(&self, closure: Arc<dyn Closure>, requester: Option<&Thread>) -> usize {
        self.suspend_all(requester);
        let others: Vec<Arc<Thread>> = {
            let list = self.list.lock();
            list.iter().filter(|t| !is_requester(t, requester)).cloned().collect()
        };
        for t in &others {
            t.set_flip_function(closure.clone());
        }
        if let Some(r) = requester {
            closure.run(r);
        }
        self.resume_all(requester);

        let mut ran_here = 0;
        for t in &others {
            if t.ensure_flip_function_started(requester) {
                ran_here += 1;
            }
        }
        for t in &others {
            t.wait_for_flip_function();
        }
        debug!("flip done: {} of {} thread flips run by the requester", ran_here, others.len());
        others.len() + requester.map_or(0, |_| 1)
    }

    pub fn dump(&self) -> String {
        self.list.lock().iter().map(|t| t.dump_line()).collect::<Vec<_>>().join("\n")
    }

    /// `dump` that gives up rather than block on the list lock.
    pub fn try_dump(&self) -> String {
        match self.list.try_lock() {
            Some(list) => list.iter().map(|t| t.dump_line()).collect::<Vec<_>>().join("\n"),
            None => "(thread list lock held; no dump)".to_string(),
        }
    }
}
