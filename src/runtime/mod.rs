//! The runtime instance: thread list, global locks, collaborators and the
//! process-wide objects every thread shares.

pub mod class_linker;
pub mod entrypoints;
pub mod error;
pub mod heap;
pub mod locks;
pub mod object;
pub mod options;
pub mod roots;
pub mod stack_guard;
pub mod suspend;
pub mod thread;
pub mod thread_list;
pub mod thread_state;
pub mod tlab;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::exception::deopt::DeoptimizationStats;
use crate::runtime::class_linker::{ClassLinker, WellKnownClass};
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::heap::HeapHooks;
use crate::runtime::locks::GlobalLocks;
use crate::runtime::object::{ClassId, ObjRef};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::roots::RootVisitor;
use crate::runtime::suspend::Closure;
use crate::runtime::thread::Thread;
use crate::runtime::thread_list::ThreadList;

pub type AbortHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type UncaughtExceptionHandler = Arc<dyn Fn(&Thread, ObjRef) + Send + Sync>;

pub struct Runtime {
    options: RuntimeOptions,
    locks: GlobalLocks,
    thread_list: ThreadList,
    heap: Arc<dyn HeapHooks>,
    class_linker: Arc<dyn ClassLinker>,
    next_thread_id: AtomicU32,
    pre_allocated_oome: ObjRef,
    pre_allocated_soe: ObjRef,
    abort_hook: Mutex<Option<AbortHook>>,
    uncaught_handler: Mutex<Option<UncaughtExceptionHandler>>,
    interned: Mutex<HashMap<String, ObjRef>>,
    class_objects: Mutex<HashMap<ClassId, ObjRef>>,
    deopt_stats: DeoptimizationStats,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("options", &self.options).field("threads", &self.thread_list.len()).finish()
    }
}

/// Allocate a permanent object straight from the heap.
fn allocate_permanent(heap: &dyn HeapHooks, class: ClassId, bytes: usize) -> RuntimeResult<ObjRef> {
    let addr = heap.allocate_large(bytes).ok_or(RuntimeError::OutOfMemory { requested: bytes })?;
    heap.init_object(addr, class, bytes);
    ObjRef::from_raw(addr as u32).ok_or(RuntimeError::OutOfMemory { requested: bytes })
}

impl Runtime {
    /// Build a runtime. The throwables delivered when allocation is impossible
    /// (out of memory, stack overflow) are allocated here, up front.
    pub fn new(options: RuntimeOptions, heap: Arc<dyn HeapHooks>, class_linker: Arc<dyn ClassLinker>) -> RuntimeResult<Arc<Runtime>> {
        let oome_class = class_linker.well_known(WellKnownClass::OutOfMemoryError);
        let soe_class = class_linker.well_known(WellKnownClass::StackOverflowError);
        let pre_allocated_oome = allocate_permanent(heap.as_ref(), oome_class, class_linker.instance_size(oome_class))?;
        let pre_allocated_soe = allocate_permanent(heap.as_ref(), soe_class, class_linker.instance_size(soe_class))?;
        info!("runtime starting, tlab {} bytes, suspend timeout {} ms", options.tlab_size, options.suspend_timeout);
        Ok(Arc::new_cyclic(|weak| Runtime {
            options,
            locks: GlobalLocks::new(),
            thread_list: ThreadList::new(weak.clone()),
            heap,
            class_linker,
            next_thread_id: AtomicU32::new(1),
            pre_allocated_oome,
            pre_allocated_soe,
            abort_hook: Mutex::new(None),
            uncaught_handler: Mutex::new(None),
            interned: Mutex::new(HashMap::new()),
            class_objects: Mutex::new(HashMap::new()),
            deopt_stats: DeoptimizationStats::default(),
        }))
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn locks(&self) -> &GlobalLocks {
        &self.locks
    }

    pub fn thread_list(&self) -> &ThreadList {
        &self.thread_list
    }

    pub fn heap(&self) -> &dyn HeapHooks {
        self.heap.as_ref()
    }

    pub fn class_linker(&self) -> &dyn ClassLinker {
        self.class_linker.as_ref()
    }

    pub fn next_thread_id(&self) -> u32 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn pre_allocated_oome(&self) -> ObjRef {
        self.pre_allocated_oome
    }

    pub fn pre_allocated_soe(&self) -> ObjRef {
        self.pre_allocated_soe
    }

    pub fn deoptimization_stats(&self) -> &DeoptimizationStats {
        &self.deopt_stats
    }

    pub fn describe_class(&self, class: ClassId) -> String {
        self.class_linker.descriptor(class).unwrap_or_else(|| format!("<class #{}>", class.0))
    }

    /// The class of `obj` as the heap recorded it.
    pub fn class_of(&self, obj: ObjRef) -> Option<ClassId> {
        self.heap.class_of(obj)
    }

    /// The permanent string object for `s`.
    pub fn intern(&self, s: &str) -> RuntimeResult<ObjRef> {
        let mut interned = self.interned.lock();
        if let Some(obj) = interned.get(s) {
            return Ok(*obj);
        }
        let class = self.class_linker.well_known(WellKnownClass::String);
        let obj = allocate_permanent(self.heap.as_ref(), class, self.class_linker.instance_size(class) + 2 * s.len())?;
        interned.insert(s.to_string(), obj);
        Ok(obj)
    }

    /// The permanent `Class` object standing for `class`.
    pub fn class_object(&self, class: ClassId) -> RuntimeResult<ObjRef> {
        let mut objects = self.class_objects.lock();
        if let Some(obj) = objects.get(&class) {
            return Ok(*obj);
        }
        let meta = self.class_linker.well_known(WellKnownClass::Class);
        let obj = allocate_permanent(self.heap.as_ref(), meta, self.class_linker.instance_size(meta))?;
        objects.insert(class, obj);
        Ok(obj)
    }

    // Fatal paths

    pub fn set_abort_hook(&self, hook: AbortHook) {
        *self.abort_hook.lock() = Some(hook);
    }

    /// Log `reason` with a thread dump, run the abort hook, then abort the process.
    pub fn abort(&self, reason: &str) -> ! {
        let dump = self.thread_list.try_dump();
        let hook = {
            let _serial = self.locks.abort_lock.lock();
            error!("runtime aborting: {}", reason);
            for line in dump.lines() {
                error!("  {}", line);
            }
            self.abort_hook.lock().clone()
        };
        if let Some(hook) = hook {
            hook(reason);
        }
        std::process::abort()
    }

    pub fn fatal(&self, e: &RuntimeError) -> ! {
        self.abort(&e.to_string())
    }

    // Uncaught exceptions

    pub fn set_uncaught_exception_handler(&self, handler: UncaughtExceptionHandler) {
        *self.uncaught_handler.lock() = Some(handler);
    }

    /// Hand an exception no frame caught to the uncaught-exception handler
    /// and clear it from the thread.
    pub fn handle_uncaught(&self, thread: &Thread, exception: ObjRef) {
        let handler = self.uncaught_handler.lock().clone();
        let class = self.class_of(exception).map(|c| self.describe_class(c)).unwrap_or_default();
        error!("thread {} \"{}\" terminated by uncaught {}", thread.id(), thread.name(), class);
        if let Some(h) = handler {
            h(thread, exception);
        }
        thread.clear_exception();
    }

    // Collector entry points

    pub fn dump_threads(&self) -> String {
        self.thread_list.dump()
    }

    /// Visit the roots of every attached thread. The caller has suspended them.
    pub fn for_each_thread_root<V: RootVisitor + ?Sized>(&self, visitor: &mut V) -> usize {
        let precise = self.options.precise_roots;
        self.thread_list.threads().iter().map(|t| t.visit_roots(visitor, precise)).sum()
    }

    /// Sweep every thread's interpreter cache; returns the entries cleared.
    pub fn sweep_interpreter_cache<F>(&self, mut is_marked: F) -> usize
    where
        F: FnMut(ObjRef) -> Option<ObjRef>,
    {
        let cleared: usize = self.thread_list.threads().iter().map(|t| t.interpreter_cache().sweep(&mut is_marked)).sum();
        debug!("interpreter cache sweep cleared {} entries", cleared);
        cleared
    }

    /// Run `closure` once for every thread while the others are stopped,
    /// each before that thread next runs managed code.
    pub fn thread_flip(&self, closure: Arc<dyn Closure>, requester: Option<&Thread>) -> usize {
        self.thread_list.flip(closure, requester)
    }
}
