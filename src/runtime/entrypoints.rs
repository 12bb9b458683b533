/* What compiled code sees of the runtime: thread field offsets and the
 * entry points it calls with nothing but the thread */

use std::sync::Arc;

use log::trace;
use memoffset::offset_of;
use once_cell::sync::Lazy;

use crate::exception::deopt::{
    deoptimize_partial_fragment, deoptimize_single_frame, discard_return_context, push_return_context, DeoptimizationKind,
};
use crate::exception::handler::{self, LongJumpContext};
use crate::interpreter::enter_from_deoptimize;
use crate::runtime::error::RuntimeResult;
use crate::runtime::object::JValue;
use crate::runtime::thread::{Thread, Tls32, TlsPtr};
use crate::runtime::tlab::Tlab;
use crate::stack::method::Method;
use crate::stack::quick_frame::QuickFrame;
use crate::stack::Frame;

/// The callee-save frame every entry point pushes first.
static SAVE_EVERYTHING: Lazy<Arc<Method>> = Lazy::new(|| Arc::new(Method::runtime_method("<save everything>")));

/// Byte offset of the packed state-and-flags word.
pub fn thread_local_state_offset() -> usize {
    offset_of!(Thread, tls32) + offset_of!(Tls32, state_and_flags)
}

/// Byte offset of the TLAB bump pointer.
pub fn tlab_pos_offset() -> usize {
    offset_of!(Thread, tlsptr) + offset_of!(TlsPtr, tlab) + offset_of!(Tlab, pos)
}

pub fn exception_offset() -> usize {
    offset_of!(Thread, tlsptr) + offset_of!(TlsPtr, exception)
}

pub fn top_of_managed_stack_offset() -> usize {
    offset_of!(Thread, tlsptr) + offset_of!(TlsPtr, managed_stack_top)
}

fn push_save_frame(thread: &Thread) -> usize {
    let mut stack = thread.stack();
    let depth = stack.depth();
    stack.push(Frame::Quick(QuickFrame::new(SAVE_EVERYTHING.clone(), 0, 0)));
    thread.publish_stack_top(&stack);
    depth
}

fn pop_save_frame(thread: &Thread, depth: usize) {
    let mut stack = thread.stack();
    stack.truncate(depth);
    thread.publish_stack_top(&stack);
}

/// Explicit suspend check from compiled code.
pub fn test_suspend(thread: &Thread) {
    let depth = push_save_frame(thread);
    thread.check_suspend();
    pop_save_frame(thread, depth);
}

/// Replace the compiled frames on top of the stack with interpreter frames
/// and finish them in the interpreter. Returns what the oldest replaced
/// frame returns.
pub fn deoptimize(thread: &Thread) -> RuntimeResult<JValue> {
    push_save_frame(thread);
    let frames = deoptimize_partial_fragment(thread, DeoptimizationKind::FullFrame)?;
    trace!("thread {} deoptimized {} frames at an explicit request", thread.id(), frames);
    enter_from_deoptimize(thread)
}

/// A callee returned `value` into a compiled frame that must not continue:
/// deoptimize that frame and finish it in the interpreter, which takes
/// `value` as the invoke's result.
pub fn deoptimize_after_return(thread: &Thread, value: JValue, is_reference: bool) -> RuntimeResult<JValue> {
    let depth = push_save_frame(thread);
    push_return_context(thread, value, is_reference);
    if let Err(e) = deoptimize_single_frame(thread, DeoptimizationKind::Debugging) {
        discard_return_context(thread);
        pop_save_frame(thread, depth);
        return Err(e);
    }
    trace!("thread {} deoptimized a frame on return", thread.id());
    enter_from_deoptimize(thread)
}

/// Deliver the pending exception; compiled code long-jumps to the result.
pub fn deliver_exception(thread: &Thread) -> RuntimeResult<LongJumpContext> {
    push_save_frame(thread);
    handler::deliver_exception(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use crate::runtime::thread::default_stack_spec;
    use crate::stack::walker::{count_frames, WalkKind};
    use crate::tests::test_runtime;

    unsafe fn field<T>(thread: &Thread, offset: usize) -> &T {
        &*((thread as *const Thread as *const u8).add(offset) as *const T)
    }

    #[test]
    fn offsets_address_the_live_fields() {
        let rt = test_runtime();
        let t = Thread::attach(&rt, "abi", default_stack_spec(64 * 1024), false).unwrap();
        assert_eq!(thread_local_state_offset(), 0);
        t.tlsptr.tlab.pos.store(0x1234, Ordering::Relaxed);
        t.push_frame(Frame::Quick(QuickFrame::new(SAVE_EVERYTHING.clone(), 0, 0)));
        unsafe {
            assert_eq!(field::<AtomicUsize>(&t, tlab_pos_offset()).load(Ordering::Relaxed), 0x1234);
            assert_eq!(field::<AtomicUsize>(&t, top_of_managed_stack_offset()).load(Ordering::Relaxed), 1);
            assert_eq!(field::<AtomicU32>(&t, exception_offset()).load(Ordering::Relaxed), 0);
        }
        t.set_exception(Some(rt.pre_allocated_oome()));
        let raw = unsafe { field::<AtomicU32>(&t, exception_offset()).load(Ordering::Relaxed) };
        assert_eq!(raw, rt.pre_allocated_oome().raw());
        t.clear_exception();
        t.detach();
    }

    #[test]
    fn test_suspend_leaves_no_frame_behind() {
        let rt = test_runtime();
        let t = Thread::attach(&rt, "poll", default_stack_spec(64 * 1024), false).unwrap();
        t.transition_from_suspended_to_runnable();
        test_suspend(&t);
        assert_eq!(t.stack().depth(), 0);
        push_save_frame(&t);
        // runtime frames never show up in a walk
        assert_eq!(count_frames(&t.stack(), WalkKind::IncludeInlinedFrames), 0);
        t.detach();
    }
}
