//! Scenario tests spanning several modules, and the fixtures they share.

mod catch_lookup;
mod exceptions;
mod interpreter;
mod roots;
mod suspension;

use std::sync::Arc;

use crate::dex::builder::DexBuilder;
use crate::dex::{DexFile, LoadOptions};
use crate::runtime::class_linker::{ClassTable, LoadedDex};
use crate::runtime::heap::BumpHeap;
use crate::runtime::options::RuntimeOptions;
use crate::runtime::thread::{default_stack_spec, Thread};
use crate::runtime::Runtime;

pub(crate) const TEST_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// A runtime whose fatal paths panic instead of aborting the test process.
pub(crate) fn test_runtime() -> Arc<Runtime> {
    test_runtime_with(RuntimeOptions { suspend_timeout: 5_000, ..Default::default() }).0
}

/// `test_runtime` with explicit options, also returning the class table so
/// tests can define classes and methods.
pub(crate) fn test_runtime_with(options: RuntimeOptions) -> (Arc<Runtime>, Arc<ClassTable>) {
    let classes = Arc::new(ClassTable::new());
    let rt = Runtime::new(options, Arc::new(BumpHeap::new(TEST_HEAP_SIZE)), classes.clone()).unwrap();
    rt.set_abort_hook(Arc::new(|reason: &str| panic!("runtime abort: {}", reason)));
    (rt, classes)
}

/// Attach a thread and make it `Runnable`.
pub(crate) fn runnable_thread(rt: &Arc<Runtime>, name: &str) -> Arc<Thread> {
    let t = Thread::attach(rt, name, default_stack_spec(256 * 1024), false).unwrap();
    t.transition_from_suspended_to_runnable();
    t
}

/// Build `b`, open it, and define its classes in `classes`.
pub(crate) fn load(classes: &ClassTable, b: &DexBuilder) -> LoadedDex {
    let bytes = b.build().unwrap();
    let dex = DexFile::open(&bytes, &LoadOptions::default()).unwrap();
    classes.load_dex(&dex).unwrap()
}
