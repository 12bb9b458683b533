/* Finding the frame that catches a pending exception and unwinding to it */

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::dex::catch_table::find_catch_handler;
use crate::exception::deopt::{deoptimize_in_place, DeoptimizationKind};
use crate::runtime::class_linker::WellKnownClass;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::object::{ClassId, ObjRef};
use crate::runtime::thread::Thread;
use crate::stack::method::Method;
use crate::stack::quick_frame::NUM_REGISTERS;
use crate::stack::walker::{frames, stack_map_at, FrameKind, FrameRef, WalkKind};
use crate::stack::{Frame, ManagedStack};

/// Where control resumes once delivery has unwound the stack. The frame at
/// `stack_index` is the newest one left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LongJumpContext {
    /// Interpreter frame whose `dex_pc` now points at the handler.
    Interpreter { stack_index: usize, dex_pc: u32 },
    /// Compiled frame resuming at the handler's entry with these registers.
    Compiled { stack_index: usize, native_pc: u32, registers: [u64; NUM_REGISTERS] },
}

impl LongJumpContext {
    pub fn stack_index(&self) -> usize {
        match self {
            LongJumpContext::Interpreter { stack_index, .. } | LongJumpContext::Compiled { stack_index, .. } => *stack_index,
        }
    }
}

/// Address of the handler in `method` at `dex_pc` that accepts
/// `exception_class`, or `None` if the exception leaves the method.
/// Handler types that cannot be resolved never match.
pub fn find_catch(thread: &Thread, method: &Method, dex_pc: u32, exception_class: ClassId) -> Option<u32> {
    let code = method.code()?;
    let linker = thread.runtime().class_linker();
    let handler = find_catch_handler(code.as_ref(), dex_pc, |type_idx| match linker.resolve_type(method, type_idx) {
        Some(catch_class) => linker.is_subclass_of(exception_class, catch_class),
        None => {
            warn!("{}: catch type #{} at dex pc {} does not resolve", method.pretty_name(), type_idx, dex_pc);
            false
        }
    })?;
    trace!("{} catches at {:#x} for dex pc {}", method.pretty_name(), handler.address, dex_pc);
    Some(handler.address)
}

enum Found {
    Interpreted { stack_index: usize, dex_pc: u32 },
    CompiledCatch { stack_index: usize, handler: u32 },
    NeedsInterpreter { stack_index: usize },
}

/// First frame, newest first, with a handler for `class`. Compiled frames at
/// the stack indices in `failed` already refused to deoptimize.
fn search(thread: &Thread, walk: &[FrameRef], class: ClassId, force_interpreter: bool, failed: &[usize]) -> Option<Found> {
    for f in walk {
        let Some(dex_pc) = f.dex_pc else { continue };
        let Some(handler) = find_catch(thread, &f.method, dex_pc, class) else { continue };
        match f.kind {
            FrameKind::Shadow => return Some(Found::Interpreted { stack_index: f.stack_index, dex_pc: handler }),
            FrameKind::Quick | FrameKind::Inlined => {
                let stack = thread.stack();
                let physical = match stack.frame(f.stack_index) {
                    Some(Frame::Quick(q)) => q.method.clone(),
                    _ => continue,
                };
                let has_catch_map = physical.compiled().is_some_and(|c| c.code_info.catch_stack_map_for_dex_pc(handler).is_some());
                let wants_interpreter = f.is_inlined() || force_interpreter || !has_catch_map;
                let deoptimizable = physical.is_deoptimizable() && !failed.contains(&f.stack_index);
                if wants_interpreter && deoptimizable {
                    return Some(Found::NeedsInterpreter { stack_index: f.stack_index });
                }
                if wants_interpreter {
                    warn!("{} cannot be deoptimized to run its handler", physical.pretty_name());
                }
                if f.kind == FrameKind::Quick && has_catch_map {
                    return Some(Found::CompiledCatch { stack_index: f.stack_index, handler });
                }
            }
        }
    }
    None
}

/// Move dex register values from where the throwing safepoint kept them to
/// where the compiled handler expects them, and point the frame at it.
fn enter_compiled_handler(stack: &mut ManagedStack, index: usize, handler: u32) -> Option<LongJumpContext> {
    let Some(Frame::Quick(q)) = stack.frame_mut(index) else { return None };
    let method: Arc<Method> = q.method.clone();
    let throw_map = stack_map_at(&method, q.native_pc)?;
    let catch_map = method.compiled()?.code_info.catch_stack_map_for_dex_pc(handler)?;
    let values: Vec<Option<u32>> = catch_map
        .dex_registers
        .iter()
        .enumerate()
        .map(|(vreg, _)| throw_map.dex_registers.get(vreg).and_then(|l| q.read_location(*l)))
        .collect();
    for (location, value) in catch_map.dex_registers.iter().zip(values) {
        if let Some(v) = value {
            q.write_location(*location, v);
        }
    }
    q.native_pc = catch_map.native_pc;
    Some(LongJumpContext::Compiled { stack_index: index, native_pc: q.native_pc, registers: q.registers })
}

/// Deliver the thread's pending exception: find the catching frame, unwind
/// everything above it and describe where execution resumes. The exception
/// stays pending for the handler's move-exception. With no handler anywhere
/// the stack is emptied, the uncaught-exception handler runs and
/// `UnhandledException` comes back.
pub fn deliver_exception(thread: &Thread) -> RuntimeResult<LongJumpContext> {
    let runtime = thread.runtime();
    let Some(exception) = thread.exception() else {
        runtime.abort(&format!("thread {} delivering without a pending exception", thread.id()))
    };
    let class = exception_class(thread, exception);
    let force_interpreter = runtime.options().force_interpret_on_exception;
    let mut failed: Vec<usize> = vec![];

    loop {
        let walk = frames(&thread.stack(), WalkKind::IncludeInlinedFrames);
        let found = search(thread, &walk, class, force_interpreter, &failed);
        let mut stack = thread.stack();
        match found {
            Some(Found::Interpreted { stack_index, dex_pc }) => {
                stack.truncate(stack_index + 1);
                if let Some(Frame::Shadow(id)) = stack.frame(stack_index).cloned() {
                    if let Some(f) = stack.shadow_mut(id) {
                        f.dex_pc = dex_pc;
                        f.resume_after_invoke = false;
                    }
                }
                thread.publish_stack_top(&stack);
                thread.set_exception(Some(exception));
                debug!("thread {} resumes interpreter frame {} at dex pc {}", thread.id(), stack_index, dex_pc);
                return Ok(LongJumpContext::Interpreter { stack_index, dex_pc });
            }
            Some(Found::CompiledCatch { stack_index, handler }) => {
                stack.truncate(stack_index + 1);
                thread.publish_stack_top(&stack);
                thread.set_exception(Some(exception));
                if let Some(ctx) = enter_compiled_handler(&mut stack, stack_index, handler) {
                    debug!("thread {} resumes compiled frame {} at handler {:#x}", thread.id(), stack_index, handler);
                    return Ok(ctx);
                }
                // Maps vanished between search and unwind; the walk below
                // cannot be trusted either.
                drop(stack);
                runtime.abort("catch stack map disappeared during exception delivery")
            }
            Some(Found::NeedsInterpreter { stack_index }) => match deoptimize_in_place(&mut stack, stack_index) {
                Ok(count) => {
                    stack.truncate(stack_index + count);
                    thread.publish_stack_top(&stack);
                    runtime.deoptimization_stats().record(DeoptimizationKind::Exception);
                    debug!("thread {} deoptimized frame {} to run a handler", thread.id(), stack_index);
                    // The interpreter frames are searched on the next pass.
                }
                Err(e) => {
                    warn!("thread {}: {}, looking for another handler", thread.id(), e);
                    failed.push(stack_index);
                }
            },
            None => {
                stack.truncate(0);
                thread.publish_stack_top(&stack);
                drop(stack);
                runtime.handle_uncaught(thread, exception);
                return Err(RuntimeError::UnhandledException { thread_id: thread.id(), class: class.0 });
            }
        }
    }
}

/// The class handlers are matched against; unknown objects count as `Throwable`.
pub fn exception_class(thread: &Thread, exception: ObjRef) -> ClassId {
    let runtime = thread.runtime();
    runtime.class_of(exception).unwrap_or_else(|| runtime.class_linker().well_known(WellKnownClass::Throwable))
}
