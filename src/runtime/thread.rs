/* The per-thread record: state word, TLAB, stack, roots and parking */

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::interpreter::cache::InterpreterCache;
use crate::runtime::class_linker::WellKnownClass;
use crate::runtime::error::RuntimeResult;
use crate::runtime::locks::{LevelGuard, LevelMutex, LockLevel};
use crate::runtime::object::{raw_of, ClassId, ObjRef, RefSlot};
use crate::runtime::stack_guard::StackGuard;
use crate::runtime::suspend::{describe_flags, CheckpointQueue, Closure, SuspendBarrier};
use crate::runtime::thread_state::{AtomicStateAndFlags, ThreadFlag, ThreadState};
use crate::runtime::tlab::{tlab_allocate, Tlab};
use crate::runtime::Runtime;
use crate::stack::{Frame, ManagedStack};

const PERMIT_AVAILABLE: i32 = 0;
const NO_PERMIT: i32 = 1;
const NO_PERMIT_WAITER: i32 = 2;

/// Any non-null value: the trigger page is readable.
const TRIGGER_ARMED: usize = 1;

/// Where a thread's native stack lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSpec {
    pub begin: usize,
    pub size: usize,
}

/// 32-bit thread-local fields, read by compiled code at fixed offsets.
#[repr(C)]
#[derive(Debug)]
pub struct Tls32 {
    pub state_and_flags: AtomicStateAndFlags,
    /// Only changed under the suspend-count lock.
    pub suspend_count: AtomicI32,
    pub tid: u32,
    pub park_state: AtomicI32,
    pub interrupted: AtomicBool,
    pub daemon: bool,
}

/// Pointer-sized thread-local fields, read by compiled code at fixed offsets.
#[repr(C)]
#[derive(Debug)]
pub struct TlsPtr {
    pub tlab: Tlab,
    pub exception: RefSlot,
    /// Depth of the managed stack.
    pub managed_stack_top: AtomicUsize,
    pub suspend_trigger: AtomicUsize,
    pub stack_end: AtomicUsize,
}

/// Set on every registered flag when its thread exits.
#[derive(Debug, Default)]
pub struct ThreadExitFlag {
    exited: AtomicBool,
}

impl ThreadExitFlag {
    pub fn new() -> Arc<ThreadExitFlag> {
        Arc::new(ThreadExitFlag::default())
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// A fixed-size group of strong roots held by native code.
#[derive(Debug, Clone)]
pub struct HandleScope {
    pub(crate) refs: Vec<u32>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    scope: usize,
    index: usize,
}

#[repr(C)]
pub struct Thread {
    pub tls32: Tls32,
    pub tlsptr: TlsPtr,
    name: String,
    runtime: Arc<Runtime>,
    pub(crate) checkpoints: Mutex<CheckpointQueue>,
    pub(crate) active_barriers: Mutex<Vec<Arc<SuspendBarrier>>>,
    pub(crate) flip_function: Mutex<Option<Arc<dyn Closure>>>,
    exit_flags: Mutex<Vec<Arc<ThreadExitFlag>>>,
    park_lock: LevelMutex<()>,
    park_cond: Condvar,
    stack: Mutex<ManagedStack>,
    stack_guard: Mutex<StackGuard>,
    pub(crate) peer: RefSlot,
    pub(crate) async_exception: RefSlot,
    pub(crate) wait_monitor: RefSlot,
    pub(crate) jni_locals: Mutex<Vec<u32>>,
    pub(crate) jni_monitors: Mutex<Vec<u32>>,
    pub(crate) handle_scopes: Mutex<Vec<HandleScope>>,
    interpreter_cache: LevelMutex<InterpreterCache>,
    throwing_oome: AtomicBool,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tls32.tid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Thread {
    /// Create a thread record in `Native` state and add it to the thread list.
    pub fn attach(runtime: &Arc<Runtime>, name: &str, stack: StackSpec, daemon: bool) -> RuntimeResult<Arc<Thread>> {
        let options = runtime.options();
        let mut guard = StackGuard::new(stack.begin, stack.size, options)?;
        guard.install(|_| ());
        let stack_end = guard.stack_end();
        let tid = runtime.next_thread_id();

        let thread = Arc::new(Thread {
            tls32: Tls32 {
                state_and_flags: AtomicStateAndFlags::new(ThreadState::Native),
                suspend_count: AtomicI32::new(0),
                tid,
                park_state: AtomicI32::new(NO_PERMIT),
                interrupted: AtomicBool::new(false),
                daemon,
            },
            tlsptr: TlsPtr {
                tlab: Tlab::default(),
                exception: RefSlot::null(),
                managed_stack_top: AtomicUsize::new(0),
                suspend_trigger: AtomicUsize::new(TRIGGER_ARMED),
                stack_end: AtomicUsize::new(stack_end),
            },
            name: name.to_string(),
            runtime: runtime.clone(),
            checkpoints: Mutex::new(CheckpointQueue::default()),
            active_barriers: Mutex::new(vec![]),
            flip_function: Mutex::new(None),
            exit_flags: Mutex::new(vec![]),
            park_lock: LevelMutex::new(LockLevel::ParkLock, ()),
            park_cond: Condvar::new(),
            stack: Mutex::new(ManagedStack::new()),
            stack_guard: Mutex::new(guard),
            peer: RefSlot::null(),
            async_exception: RefSlot::null(),
            wait_monitor: RefSlot::null(),
            jni_locals: Mutex::new(vec![]),
            jni_monitors: Mutex::new(vec![]),
            handle_scopes: Mutex::new(vec![]),
            interpreter_cache: LevelMutex::new(LockLevel::InterpreterCacheLock, InterpreterCache::new(options.interpreter_cache_size)),
            throwing_oome: AtomicBool::new(false),
        });
        runtime.thread_list().register(&thread)?;
        debug!("attached thread {} \"{}\"", tid, name);
        Ok(thread)
    }

    /// Leave `Runnable` if needed and drop out of the thread list.
    pub fn detach(&self) {
        if self.state().is_runnable() {
            self.transition_from_runnable_to_suspended(ThreadState::Native);
        }
        self.runtime.thread_list().unregister(self);
        debug!("detached thread {}", self.id());
    }

    pub fn id(&self) -> u32 {
        self.tls32.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_daemon(&self) -> bool {
        self.tls32.daemon
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn state(&self) -> ThreadState {
        self.tls32.state_and_flags.load(Ordering::Relaxed).state()
    }

    pub fn suspend_count(&self) -> i32 {
        self.tls32.suspend_count.load(Ordering::Relaxed)
    }

    pub fn is_flag_set(&self, flag: ThreadFlag) -> bool {
        self.tls32.state_and_flags.load(Ordering::Acquire).is_flag_set(flag)
    }

    /// Change between two non-runnable states.
    pub fn set_state(&self, state: ThreadState) {
        debug_assert!(!state.is_runnable() && !self.state().is_runnable());
        self.tls32.state_and_flags.set_state(state);
    }

    /// Leave `Runnable`. Pending checkpoints run first; suspend barriers
    /// registered while we were runnable are passed once the state is published.
    pub fn transition_from_runnable_to_suspended(&self, new_state: ThreadState) {
        debug_assert!(!new_state.is_runnable());
        let word = &self.tls32.state_and_flags;
        let published = loop {
            let old = word.load(Ordering::Acquire);
            debug_assert_eq!(old.state(), ThreadState::Runnable, "thread {} not runnable", self.id());
            if old.is_flag_set(ThreadFlag::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
                continue;
            }
            if old.is_flag_set(ThreadFlag::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
                continue;
            }
            if word.compare_exchange(old, old.with_state(new_state), Ordering::SeqCst).is_ok() {
                break old;
            }
        };
        trace!("thread {} Runnable -> {:?}", self.id(), new_state);
        if published.is_flag_set(ThreadFlag::ACTIVE_SUSPEND_BARRIER) {
            self.pass_active_suspend_barriers();
        }
    }

    /// Become `Runnable`, waiting out any suspend request and running (or
    /// waiting for) a pending flip function first. Returns the old state.
    pub fn transition_from_suspended_to_runnable(&self) -> ThreadState {
        let word = &self.tls32.state_and_flags;
        let locks = self.runtime.locks();
        loop {
            let old = word.load(Ordering::Acquire);
            debug_assert!(!old.state().is_runnable());
            if old.is_flag_set(ThreadFlag::SUSPEND_REQUEST) {
                let mut tsc = locks.thread_suspend_count_lock.lock();
                while self.suspend_count() > 0 {
                    tsc.wait(&locks.resume_cond);
                }
                continue;
            }
            if old.is_flag_set(ThreadFlag::PENDING_FLIP_FUNCTION) {
                self.ensure_flip_function_started(Some(self));
                continue;
            }
            if old.is_flag_set(ThreadFlag::RUNNING_FLIP_FUNCTION) {
                self.wait_for_flip_function();
                continue;
            }
            if word.compare_exchange(old, old.with_state(ThreadState::Runnable), Ordering::SeqCst).is_ok() {
                trace!("thread {} {:?} -> Runnable", self.id(), old.state());
                return old.state();
            }
        }
    }

    /// Run `f` in `state`, returning to the current state afterwards.
    pub fn with_state<R, F: FnOnce() -> R>(&self, state: ThreadState, f: F) -> R {
        let old = self.state();
        if old.is_runnable() {
            self.transition_from_runnable_to_suspended(state);
            let r = f();
            self.transition_from_suspended_to_runnable();
            r
        } else {
            self.set_state(state);
            let r = f();
            self.set_state(old);
            r
        }
    }

    /// The safepoint poll.
    pub fn check_suspend(&self) {
        debug_assert!(
            !self.is_flag_set(ThreadFlag::SUSPENSION_IMMUNE),
            "thread {} polled inside a suspension-immune region",
            self.id()
        );
        loop {
            let word = self.tls32.state_and_flags.load(Ordering::Acquire);
            if word.is_flag_set(ThreadFlag::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if word.is_flag_set(ThreadFlag::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else if word.is_any_of(ThreadFlag::SUSPEND_REQUEST | ThreadFlag::ACTIVE_SUSPEND_BARRIER) {
                self.transition_from_runnable_to_suspended(ThreadState::Suspended);
                self.transition_from_suspended_to_runnable();
            } else {
                break;
            }
        }
    }

    /// Run `f` with polling forbidden.
    pub fn suspension_immune<R, F: FnOnce() -> R>(&self, f: F) -> R {
        self.tls32.state_and_flags.set_flag(ThreadFlag::SUSPENSION_IMMUNE, Ordering::Relaxed);
        let r = f();
        self.tls32.state_and_flags.clear_flag(ThreadFlag::SUSPENSION_IMMUNE, Ordering::Relaxed);
        r
    }

    /// Make the next implicit check fault.
    pub fn trigger_suspend(&self) {
        self.tlsptr.suspend_trigger.store(0, Ordering::Release);
    }

    /// The read compiled code performs at a poll site. A null trigger stands
    /// in for the protected page: the fault handler re-arms it and polls.
    pub fn implicit_suspend_check(&self) -> bool {
        if self.tlsptr.suspend_trigger.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.tlsptr.suspend_trigger.store(TRIGGER_ARMED, Ordering::Release);
        self.check_suspend();
        true
    }

    // Exceptions

    pub fn exception(&self) -> Option<ObjRef> {
        self.tlsptr.exception.get()
    }

    pub fn is_exception_pending(&self) -> bool {
        self.exception().is_some()
    }

    pub fn set_exception(&self, exception: Option<ObjRef>) {
        self.tlsptr.exception.set(exception);
    }

    pub fn clear_exception(&self) {
        self.tlsptr.exception.set(None);
        self.throwing_oome.store(false, Ordering::Release);
    }

    /// Allocate and install a new exception of `class`. Allocation failure
    /// leaves the pre-allocated OOME pending instead.
    pub fn throw_new(&self, class: ClassId) {
        let size = self.runtime.class_linker().instance_size(class);
        if let Ok(obj) = tlab_allocate(self, class, size) {
            trace!("thread {} throws {}", self.id(), self.runtime.describe_class(class));
            self.set_exception(Some(obj));
        }
    }

    pub fn throw_well_known(&self, which: WellKnownClass) {
        self.throw_new(self.runtime.class_linker().well_known(which));
    }

    pub fn throw_out_of_memory(&self, requested: usize) {
        if self.throwing_oome.swap(true, Ordering::AcqRel) {
            debug!("thread {} recursive out of memory ({} bytes) suppressed", self.id(), requested);
            return;
        }
        warn!("thread {} out of memory allocating {} bytes", self.id(), requested);
        self.set_exception(Some(self.runtime.pre_allocated_oome()));
    }

    /// Install the pre-allocated overflow error and open the reserved region
    /// so the handler has stack to run on.
    pub fn throw_stack_overflow(&self) {
        {
            let mut guard = self.stack_guard.lock();
            if guard.is_reserved_open() {
                error!("thread {} recursive stack overflow", self.id());
            }
            guard.open_reserved();
            self.tlsptr.stack_end.store(guard.stack_end(), Ordering::Release);
        }
        debug!("thread {} stack overflow", self.id());
        self.set_exception(Some(self.runtime.pre_allocated_soe()));
    }

    /// Close the reserved region once an overflow has been handled.
    pub fn reset_stack_overflow(&self) {
        let mut guard = self.stack_guard.lock();
        if guard.is_reserved_open() {
            guard.close_reserved();
            self.tlsptr.stack_end.store(guard.stack_end(), Ordering::Release);
        }
    }

    /// Account a frame of `bytes` against the guarded stack; overflow installs
    /// the stack overflow error and fails.
    pub fn push_native_frame(&self, bytes: usize) -> RuntimeResult<()> {
        let r = self.stack_guard.lock().push_frame(bytes);
        if r.is_err() {
            self.throw_stack_overflow();
        }
        r
    }

    pub fn pop_native_frame(&self, bytes: usize) {
        self.stack_guard.lock().pop_frame(bytes);
    }

    pub fn stack_guard(&self) -> MutexGuard<'_, StackGuard> {
        self.stack_guard.lock()
    }

    // Managed stack

    pub fn stack(&self) -> MutexGuard<'_, ManagedStack> {
        self.stack.lock()
    }

    pub fn push_frame(&self, frame: Frame) -> usize {
        let mut stack = self.stack.lock();
        stack.push(frame);
        self.publish_stack_top(&stack)
    }

    pub fn pop_frame(&self) -> Option<Frame> {
        let mut stack = self.stack.lock();
        let frame = stack.pop();
        self.publish_stack_top(&stack);
        frame
    }

    pub fn publish_stack_top(&self, stack: &ManagedStack) -> usize {
        let depth = stack.depth();
        self.tlsptr.managed_stack_top.store(depth, Ordering::Release);
        depth
    }

    pub fn interpreter_cache(&self) -> LevelGuard<'_, InterpreterCache> {
        self.interpreter_cache.lock()
    }

    // Roots held outside the managed stack

    pub fn peer(&self) -> Option<ObjRef> {
        self.peer.get()
    }

    pub fn set_peer(&self, peer: Option<ObjRef>) {
        self.peer.set(peer);
    }

    pub fn set_async_exception(&self, exception: Option<ObjRef>) {
        self.async_exception.set(exception);
    }

    /// Move a pending asynchronous exception into the exception slot.
    pub fn install_async_exception(&self) -> bool {
        match self.async_exception.take() {
            Some(e) => {
                self.set_exception(Some(e));
                true
            }
            None => false,
        }
    }

    pub fn set_wait_monitor(&self, monitor: Option<ObjRef>) {
        self.wait_monitor.set(monitor);
    }

    pub fn add_jni_local(&self, obj: ObjRef) -> usize {
        let mut locals = self.jni_locals.lock();
        locals.push(obj.raw());
        locals.len() - 1
    }

    pub fn jni_local(&self, index: usize) -> Option<ObjRef> {
        self.jni_locals.lock().get(index).and_then(|r| ObjRef::from_raw(*r))
    }

    pub fn jni_monitor_enter(&self, obj: ObjRef) {
        self.jni_monitors.lock().push(obj.raw());
    }

    pub fn jni_monitor_exit(&self, obj: ObjRef) -> bool {
        let mut monitors = self.jni_monitors.lock();
        match monitors.iter().rposition(|r| *r == obj.raw()) {
            Some(i) => {
                monitors.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn push_handle_scope(&self, capacity: usize) {
        self.handle_scopes.lock().push(HandleScope { refs: Vec::with_capacity(capacity), capacity });
    }

    pub fn pop_handle_scope(&self) {
        self.handle_scopes.lock().pop();
    }

    /// Root `obj` in the innermost handle scope; `None` when it is full.
    pub fn new_handle(&self, obj: Option<ObjRef>) -> Option<Handle> {
        let mut scopes = self.handle_scopes.lock();
        let scope = scopes.len().checked_sub(1)?;
        let top = &mut scopes[scope];
        if top.refs.len() >= top.capacity {
            return None;
        }
        top.refs.push(raw_of(obj));
        Some(Handle { scope, index: top.refs.len() - 1 })
    }

    pub fn handle(&self, handle: Handle) -> Option<ObjRef> {
        let scopes = self.handle_scopes.lock();
        scopes.get(handle.scope).and_then(|s| s.refs.get(handle.index)).and_then(|r| ObjRef::from_raw(*r))
    }

    // Exit notification

    pub fn notify_on_thread_exit(&self, flag: &Arc<ThreadExitFlag>) {
        self.exit_flags.lock().push(flag.clone());
    }

    pub fn unregister_exit_flag(&self, flag: &Arc<ThreadExitFlag>) {
        self.exit_flags.lock().retain(|f| !Arc::ptr_eq(f, flag));
    }

    pub(crate) fn signal_exit_flags(&self) {
        for f in self.exit_flags.lock().drain(..) {
            f.exited.store(true, Ordering::Release);
        }
    }

    // Parking

    /// Block until unparked, interrupted or timed out. `time` is an absolute
    /// wall-clock deadline in ms when `is_absolute`, else a relative timeout
    /// in ns where 0 means no timeout. Spurious wakeups return early.
    pub fn park(&self, is_absolute: bool, time: i64) {
        let park_state = &self.tls32.park_state;
        if park_state.compare_exchange(PERMIT_AVAILABLE, NO_PERMIT, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            return;
        }
        let deadline = if is_absolute {
            let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
            if time <= now_ms {
                return;
            }
            Some(Instant::now() + Duration::from_millis((time - now_ms) as u64))
        } else if time > 0 {
            Some(Instant::now() + Duration::from_nanos(time as u64))
        } else if time < 0 {
            return;
        } else {
            None
        };

        let wait_state = if deadline.is_some() { ThreadState::TimedWaiting } else { ThreadState::Waiting };
        self.with_state(wait_state, || {
            let mut g = self.park_lock.lock();
            if self.tls32.interrupted.load(Ordering::Acquire) {
                return;
            }
            if park_state.compare_exchange(NO_PERMIT, NO_PERMIT_WAITER, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
                match deadline {
                    Some(d) => {
                        g.wait_until(&self.park_cond, d);
                    }
                    None => g.wait(&self.park_cond),
                }
            }
        });
        // Consume a permit that arrived while waiting; otherwise just drop the waiter mark.
        park_state.store(NO_PERMIT, Ordering::Release);
    }

    pub fn unpark(&self) {
        if self.tls32.park_state.swap(PERMIT_AVAILABLE, Ordering::Release) == NO_PERMIT_WAITER {
            let _g = self.park_lock.lock();
            self.park_cond.notify_all();
        }
    }

    pub fn interrupt(&self) {
        self.tls32.interrupted.store(true, Ordering::SeqCst);
        let _g = self.park_lock.lock();
        self.park_cond.notify_all();
    }

    /// Test and clear.
    pub fn interrupted(&self) -> bool {
        self.tls32.interrupted.swap(false, Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.tls32.interrupted.load(Ordering::SeqCst)
    }

    /// One dump line: tid, name, state, flags and suspend count.
    pub fn dump_line(&self) -> String {
        let word = self.tls32.state_and_flags.load(Ordering::Relaxed);
        let mut s = String::new();
        let _ = write!(
            s,
            "tid={} \"{}\" state={:?} flags={} suspend_count={}",
            self.id(),
            self.name,
            word.state(),
            describe_flags(word),
            self.suspend_count()
        );
        if self.is_daemon() {
            s.push_str(" daemon");
        }
        s
    }
}

static NEXT_ANON: AtomicU32 = AtomicU32::new(1);

/// Synthetic stack placement for threads that do not track a real stack.
pub fn default_stack_spec(size: usize) -> StackSpec {
    let slot = NEXT_ANON.fetch_add(1, Ordering::Relaxed) as usize;
    StackSpec { begin: slot << 24, size }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_runtime;

    #[test]
    fn park_consumes_permit() {
        let rt = test_runtime();
        let t = Thread::attach(&rt, "parker", default_stack_spec(64 * 1024), false).unwrap();
        t.unpark();
        // Permit available: returns immediately.
        t.park(false, 0);
        assert_eq!(t.tls32.park_state.load(Ordering::Relaxed), NO_PERMIT);
        // Relative timeout with no permit.
        let start = Instant::now();
        t.park(false, 5_000_000);
        assert!(start.elapsed() < Duration::from_secs(5));
        t.detach();
    }

    #[test]
    fn interrupt_wakes_parked_thread() {
        let rt = test_runtime();
        let t = Thread::attach(&rt, "sleeper", default_stack_spec(64 * 1024), false).unwrap();
        crossbeam::scope(|s| {
            s.spawn(|_| {
                t.transition_from_suspended_to_runnable();
                t.park(false, 0);
                t.transition_from_runnable_to_suspended(ThreadState::Native);
            });
            while t.state() != ThreadState::Waiting {
                std::thread::yield_now();
            }
            t.interrupt();
        })
        .unwrap();
        assert!(t.interrupted());
        assert!(!t.is_interrupted());
        t.detach();
    }

    #[test]
    fn handle_scopes_hold_roots() {
        let rt = test_runtime();
        let t = Thread::attach(&rt, "handles", default_stack_spec(64 * 1024), false).unwrap();
        assert_eq!(t.new_handle(ObjRef::from_raw(8)), None);
        t.push_handle_scope(1);
        let h = t.new_handle(ObjRef::from_raw(8)).unwrap();
        assert_eq!(t.new_handle(ObjRef::from_raw(16)), None);
        assert_eq!(t.handle(h).map(ObjRef::raw), Some(8));
        t.pop_handle_scope();
        assert_eq!(t.handle(h), None);
        t.detach();
    }

    #[test]
    fn exit_flags_fire_on_detach() {
        let rt = test_runtime();
        let t = Thread::attach(&rt, "short-lived", default_stack_spec(64 * 1024), false).unwrap();
        let flag = ThreadExitFlag::new();
        t.notify_on_thread_exit(&flag);
        assert!(!flag.has_exited());
        t.detach();
        assert!(flag.has_exited());
        assert!(rt.thread_list().find(t.id()).is_none());
    }

    #[test]
    fn implicit_check_runs_poll_once() {
        let rt = test_runtime();
        let t = Thread::attach(&rt, "poller", default_stack_spec(64 * 1024), false).unwrap();
        t.transition_from_suspended_to_runnable();
        assert!(!t.implicit_suspend_check());
        t.trigger_suspend();
        assert!(t.implicit_suspend_check());
        assert!(!t.implicit_suspend_check());
        t.detach();
        assert!(t.dump_line().contains("state=Terminated"));
    }
}
