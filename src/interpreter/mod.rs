//! A shadow-frame interpreter for the integer, control-flow, monitor and
//! invoke subset of the instruction set.
//!
//! Every instruction runs with the thread's stack locked only for as long as
//! it touches the frame. Work that can reach a safepoint (invokes,
//! allocation, throwing, backward branches) is returned as a [`Step`] and done
//! after the lock is released, so a checkpoint running at the poll can walk
//! the stack.
//!
//! An exception nobody in the frame catches pops the frame with the
//! exception left pending on the thread; callers check
//! `Thread::is_exception_pending`. `Err` is reserved for malformed code and
//! runtime failures.

pub mod cache;

use std::sync::Arc;

use log::{debug, trace};

use crate::bytecode::instruction::Instruction;
use crate::dex::code_item::MethodCode;
use crate::exception::handler::{exception_class, find_catch};
use crate::interpreter::cache::CachedValue;
use crate::runtime::class_linker::WellKnownClass;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::object::{ClassId, JValue, ObjRef};
use crate::runtime::thread::Thread;
use crate::runtime::thread_state::ThreadState;
use crate::runtime::tlab::tlab_allocate;
use crate::stack::method::Method;
use crate::stack::quick_frame::QuickFrame;
use crate::stack::shadow_frame::{ShadowFrame, ShadowFrameId};
use crate::stack::Frame;

/// Native stack one interpreted call accounts for on top of its vregs.
const FRAME_OVERHEAD: usize = 128;

/// What an instruction asks of the loop once the stack lock is released.
#[derive(Debug)]
enum Step {
    Next(u32),
    Branch(u32),
    Return(JValue),
    /// Throw a fresh instance of a runtime exception class.
    Raise(WellKnownClass),
    Throw(ObjRef),
    /// An exception is already pending on the thread.
    Pending,
    Invoke { callee: Arc<Method>, args: Vec<JValue>, next: u32 },
    NewInstance { class: ClassId, dst: usize, next: u32 },
    MonitorEnter { obj: ObjRef, next: u32 },
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

/// Operation order shared by the 23x, 2addr and lit8 groups.
const BINOPS: [BinOp; 11] =
    [BinOp::Add, BinOp::Sub, BinOp::Mul, BinOp::Div, BinOp::Rem, BinOp::And, BinOp::Or, BinOp::Xor, BinOp::Shl, BinOp::Shr, BinOp::Ushr];

/// `None` on division by zero.
fn int_op(op: BinOp, a: i32, b: i32) -> Option<i32> {
    if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
        return None;
    }
    Some(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => a.wrapping_div(b),
        BinOp::Rem => a.wrapping_rem(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32 & 0x1f),
        BinOp::Shr => a.wrapping_shr(b as u32 & 0x1f),
        BinOp::Ushr => ((a as u32) >> (b as u32 & 0x1f)) as i32,
    })
}

/// Shifts take their distance from an int register.
fn long_op(op: BinOp, a: i64, b: i64) -> Option<i64> {
    if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
        return None;
    }
    Some(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => a.wrapping_div(b),
        BinOp::Rem => a.wrapping_rem(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32 & 0x3f),
        BinOp::Shr => a.wrapping_shr(b as u32 & 0x3f),
        BinOp::Ushr => ((a as u64) >> (b as u32 & 0x3f)) as i64,
    })
}

fn invalid(method: &Method, dex_pc: u32) -> RuntimeError {
    RuntimeError::InvalidBytecode { method: method.pretty_name(), dex_pc }
}

/// The safepoint poll, skipped when the thread is not running managed code.
fn poll(thread: &Thread) {
    if thread.state().is_runnable() {
        thread.check_suspend();
    }
}

fn decode<'a>(method: &Method, code: &'a MethodCode, dex_pc: u32) -> RuntimeResult<Instruction<'a>> {
    Instruction::at(&code.insns, dex_pc).map_err(|_| invalid(method, dex_pc))
}

/// Lay `args` (one value per parameter, `this` first) into the in-registers.
fn place_args(frame: &mut ShadowFrame, method: &Method, ins_size: usize, args: &[JValue]) {
    let mut reg = frame.num_vregs().saturating_sub(ins_size);
    let mut args = args.iter();
    if !method.is_static() {
        if let Some(this) = args.next() {
            frame.set_vreg_ref(reg, this.as_ref());
            reg += 1;
        }
    }
    for (c, value) in method.shorty().chars().skip(1).zip(args) {
        match c {
            'L' => frame.set_vreg_ref(reg, value.as_ref()),
            'J' | 'D' => {
                frame.set_vreg_long(reg, value.as_long());
                reg += 1;
            }
            _ => frame.set_vreg(reg, value.as_int()),
        }
        reg += 1;
    }
}

/// Run `method` with `args` on `thread` and return what it returned. A
/// method that throws returns a zero value with the exception pending.
pub fn execute(thread: &Thread, method: &Arc<Method>, args: &[JValue]) -> RuntimeResult<JValue> {
    poll(thread);
    if method.is_native() {
        return invoke_native(thread, method, args);
    }
    let code = method.code().ok_or_else(|| invalid(method, 0))?.clone();
    let mut frame = ShadowFrame::new(method.clone(), code.registers_size as usize);
    place_args(&mut frame, method, code.ins_size as usize, args);

    let bytes = FRAME_OVERHEAD + 4 * frame.num_vregs();
    if thread.push_native_frame(bytes).is_err() {
        debug!("thread {} overflowed entering {}", thread.id(), method.pretty_name());
        return Ok(JValue::default());
    }
    let (depth, id) = {
        let mut stack = thread.stack();
        let depth = stack.depth();
        let id = stack.push_shadow(frame);
        thread.publish_stack_top(&stack);
        (depth, id)
    };
    let result = run(thread, id);
    {
        let mut stack = thread.stack();
        stack.truncate(depth);
        thread.publish_stack_top(&stack);
    }
    thread.pop_native_frame(bytes);
    result
}

/// Call a native method with its arguments spilled into a native frame, so
/// the references among them stay visible as roots during the call.
fn invoke_native(thread: &Thread, method: &Arc<Method>, args: &[JValue]) -> RuntimeResult<JValue> {
    let body = method.native().ok_or_else(|| invalid(method, 0))?.clone();
    let spill = args.len() * 8;
    let mut q = QuickFrame::new(method.clone(), 0, spill);
    let mut off = 0;
    let kinds = (!method.is_static()).then_some('L').into_iter().chain(method.shorty().chars().skip(1));
    for (c, value) in kinds.zip(args) {
        let (lo, hi) = value.halves();
        q.write_u32(off, lo);
        off += 4;
        if c == 'J' || c == 'D' {
            q.write_u32(off, hi);
            off += 4;
        }
    }
    let depth = {
        let mut stack = thread.stack();
        let depth = stack.depth();
        stack.push(Frame::Quick(q));
        thread.publish_stack_top(&stack);
        depth
    };
    trace!("thread {} calls native {}", thread.id(), method.pretty_name());
    let value = thread.with_state(ThreadState::Native, || body(thread, args));
    let mut stack = thread.stack();
    stack.truncate(depth);
    thread.publish_stack_top(&stack);
    Ok(value)
}

/// Handler in the frame's method for the pending exception at `dex_pc`.
fn catch_in_frame(thread: &Thread, method: &Method, dex_pc: u32) -> Option<u32> {
    let exception = thread.exception()?;
    let handler = find_catch(thread, method, dex_pc, exception_class(thread, exception))?;
    if exception == thread.runtime().pre_allocated_soe() {
        thread.reset_stack_overflow();
    }
    Some(handler)
}

/// Interpret the pushed frame `id` from its `dex_pc` until it returns or an
/// exception leaves it.
fn run(thread: &Thread, id: ShadowFrameId) -> RuntimeResult<JValue> {
    let (method, mut pc, resume) = {
        let mut stack = thread.stack();
        let frame = stack.shadow_mut(id).ok_or(RuntimeError::ThreadNotAttached)?;
        let resume = std::mem::take(&mut frame.resume_after_invoke);
        (frame.method.clone(), frame.dex_pc, resume)
    };
    let code = method.code().ok_or_else(|| invalid(&method, pc))?.clone();

    let mut step = if thread.is_exception_pending() {
        Step::Pending
    } else if resume {
        Step::Next(pc + decode(&method, &code, pc)?.size_in_code_units() as u32)
    } else {
        Step::Next(pc)
    };

    loop {
        match step {
            Step::Next(next) => pc = next,
            Step::Branch(target) => {
                if target <= pc {
                    poll(thread);
                }
                pc = target;
            }
            Step::Return(value) => return Ok(value),
            Step::Raise(which) => {
                thread.throw_well_known(which);
                step = Step::Pending;
                continue;
            }
            Step::Throw(obj) => {
                thread.set_exception(Some(obj));
                step = Step::Pending;
                continue;
            }
            Step::Pending => match catch_in_frame(thread, &method, pc) {
                Some(handler) => pc = handler,
                None => {
                    trace!("exception leaves {} at dex pc {}", method.pretty_name(), pc);
                    if let Some(frame) = thread.stack().shadow_mut(id) {
                        frame.lock_count.clear();
                    }
                    return Ok(JValue::default());
                }
            },
            Step::Invoke { callee, args, next } => {
                let value = execute(thread, &callee, &args)?;
                if let Some(frame) = thread.stack().shadow_mut(id) {
                    frame.result = value;
                }
                if thread.is_exception_pending() {
                    step = Step::Pending;
                    continue;
                }
                pc = next;
            }
            Step::NewInstance { class, dst, next } => {
                poll(thread);
                let size = thread.runtime().class_linker().instance_size(class);
                match tlab_allocate(thread, class, size) {
                    Ok(obj) => {
                        if let Some(frame) = thread.stack().shadow_mut(id) {
                            frame.set_vreg_ref(dst, Some(obj));
                        }
                        pc = next;
                    }
                    Err(RuntimeError::OutOfMemory { .. }) => {
                        step = Step::Pending;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            Step::MonitorEnter { obj, next } => {
                poll(thread);
                if let Some(frame) = thread.stack().shadow_mut(id) {
                    frame.lock_count.push(obj.raw());
                }
                pc = next;
            }
        }

        step = {
            let mut stack = thread.stack();
            let frame = stack.shadow_mut(id).ok_or(RuntimeError::ThreadNotAttached)?;
            frame.dex_pc = pc;
            interpret_one(thread, &method, &code, frame, pc)?
        };
    }
}

fn resolve<F>(thread: &Thread, method: &Method, dex_pc: u32, opcode: u8, f: F) -> Result<CachedValue, WellKnownClass>
where
    F: FnOnce() -> Result<CachedValue, WellKnownClass>,
{
    if let Some(v) = thread.interpreter_cache().get(method.id(), dex_pc) {
        return Ok(v);
    }
    let v = f()?;
    thread.interpreter_cache().set(method.id(), dex_pc, opcode, v.clone());
    Ok(v)
}

fn branch(method: &Method, pc: u32, offset: i32) -> RuntimeResult<Step> {
    let target = pc as i64 + offset as i64;
    u32::try_from(target).map(Step::Branch).map_err(|_| invalid(method, pc))
}

/// Execute one instruction against `frame`.
fn interpret_one(thread: &Thread, method: &Arc<Method>, code: &MethodCode, frame: &mut ShadowFrame, pc: u32) -> RuntimeResult<Step> {
    let inst = decode(method, code, pc)?;
    let next = pc + inst.size_in_code_units() as u32;
    let op = inst.opcode();
    let (a, b, c) = (inst.vreg_a() as usize, inst.vreg_b() as usize, inst.vreg_c() as usize);
    let runtime = thread.runtime();
    let linker = runtime.class_linker();

    match op {
        0x00 => {}
        // move, move/from16, move/16
        0x01..=0x03 => frame.set_vreg(a, frame.vreg(b)),
        0x04..=0x06 => frame.set_vreg_long(a, frame.vreg_long(b)),
        0x07..=0x09 => frame.set_vreg_ref(a, frame.vreg_ref(b)),
        0x0a => frame.set_vreg(a, frame.result.as_int()),
        0x0b => frame.set_vreg_long(a, frame.result.as_long()),
        0x0c => frame.set_vreg_ref(a, frame.result.as_ref()),
        0x0d => {
            frame.set_vreg_ref(a, thread.exception());
            thread.clear_exception();
        }
        0x0e..=0x11 => {
            if !frame.lock_count.is_empty() {
                return Ok(Step::Raise(WellKnownClass::IllegalMonitorStateException));
            }
            let value = match op {
                0x0e => JValue::default(),
                0x0f => JValue::from_int(frame.vreg(a)),
                0x10 => JValue::from_long(frame.vreg_long(a)),
                _ => JValue::from_ref(frame.vreg_ref(a)),
            };
            return Ok(Step::Return(value));
        }
        0x12..=0x15 => frame.set_vreg(a, inst.literal().ok_or_else(|| invalid(method, pc))? as i32),
        0x16..=0x19 => frame.set_vreg_long(a, inst.literal().ok_or_else(|| invalid(method, pc))?),
        // const-string, const-string/jumbo
        0x1a | 0x1b => {
            let idx = inst.index().ok_or_else(|| invalid(method, pc))?;
            let value = resolve(thread, method, pc, op, || {
                let s = linker.resolve_string(method, idx).ok_or(WellKnownClass::NoClassDefFoundError)?;
                runtime.intern(&s).map(CachedValue::Object).map_err(|_| WellKnownClass::OutOfMemoryError)
            });
            match value {
                Ok(CachedValue::Object(obj)) => frame.set_vreg_ref(a, Some(obj)),
                Ok(_) => return Err(invalid(method, pc)),
                Err(which) => return Ok(Step::Raise(which)),
            }
        }
        0x1c => {
            let idx = inst.index().ok_or_else(|| invalid(method, pc))?;
            let value = resolve(thread, method, pc, op, || {
                let class = linker.resolve_type(method, idx).ok_or(WellKnownClass::NoClassDefFoundError)?;
                runtime.class_object(class).map(CachedValue::Object).map_err(|_| WellKnownClass::OutOfMemoryError)
            });
            match value {
                Ok(CachedValue::Object(obj)) => frame.set_vreg_ref(a, Some(obj)),
                Ok(_) => return Err(invalid(method, pc)),
                Err(which) => return Ok(Step::Raise(which)),
            }
        }
        0x1d => {
            return Ok(match frame.vreg_ref(a) {
                Some(obj) => Step::MonitorEnter { obj, next },
                None => Step::Raise(WellKnownClass::NullPointerException),
            });
        }
        0x1e => {
            let Some(obj) = frame.vreg_ref(a) else {
                return Ok(Step::Raise(WellKnownClass::NullPointerException));
            };
            match frame.lock_count.iter().rposition(|raw| *raw == obj.raw()) {
                Some(i) => {
                    frame.lock_count.remove(i);
                }
                None => return Ok(Step::Raise(WellKnownClass::IllegalMonitorStateException)),
            }
        }
        0x22 => {
            let idx = inst.index().ok_or_else(|| invalid(method, pc))?;
            let value = resolve(thread, method, pc, op, || {
                linker.resolve_type(method, idx).map(CachedValue::Class).ok_or(WellKnownClass::NoClassDefFoundError)
            });
            return Ok(match value {
                Ok(CachedValue::Class(class)) => Step::NewInstance { class, dst: a, next },
                Ok(_) => return Err(invalid(method, pc)),
                Err(which) => Step::Raise(which),
            });
        }
        0x27 => {
            return Ok(match frame.vreg_ref(a) {
                Some(obj) => Step::Throw(obj),
                None => Step::Raise(WellKnownClass::NullPointerException),
            });
        }
        0x28..=0x2a => return branch(method, pc, inst.branch_offset().ok_or_else(|| invalid(method, pc))?),
        0x2b | 0x2c => {
            let offset = inst.branch_offset().ok_or_else(|| invalid(method, pc))?;
            let payload_pc = u32::try_from(pc as i64 + offset as i64).map_err(|_| invalid(method, pc))?;
            let payload = decode(method, code, payload_pc)?;
            let key = frame.vreg(a);
            let target = if op == 0x2b { payload.packed_switch_target(key) } else { payload.sparse_switch_target(key) };
            if let Some(t) = target {
                return branch(method, pc, t);
            }
        }
        // if-eq .. if-le
        0x32..=0x37 => {
            let (x, y) = (frame.vreg(a), frame.vreg(b));
            let taken = match op {
                0x32 => x == y,
                0x33 => x != y,
                0x34 => x < y,
                0x35 => x >= y,
                0x36 => x > y,
                _ => x <= y,
            };
            if taken {
                return branch(method, pc, inst.branch_offset().ok_or_else(|| invalid(method, pc))?);
            }
        }
        // if-eqz .. if-lez
        0x38..=0x3d => {
            let x = frame.vreg(a);
            let taken = match op {
                0x38 => x == 0,
                0x39 => x != 0,
                0x3a => x < 0,
                0x3b => x >= 0,
                0x3c => x > 0,
                _ => x <= 0,
            };
            if taken {
                return branch(method, pc, inst.branch_offset().ok_or_else(|| invalid(method, pc))?);
            }
        }
        // invoke-virtual, invoke-direct, invoke-static and their ranges
        0x6e | 0x70 | 0x71 | 0x74 | 0x76 | 0x77 => return invoke_step(thread, method, &inst, frame, next),
        0x7b => frame.set_vreg(a, frame.vreg(b).wrapping_neg()),
        0x7c => frame.set_vreg(a, !frame.vreg(b)),
        0x7d => frame.set_vreg_long(a, frame.vreg_long(b).wrapping_neg()),
        0x7e => frame.set_vreg_long(a, !frame.vreg_long(b)),
        0x81 => frame.set_vreg_long(a, frame.vreg(b) as i64),
        0x84 => frame.set_vreg(a, frame.vreg_long(b) as i32),
        0x90..=0x9a => match int_op(BINOPS[(op - 0x90) as usize], frame.vreg(b), frame.vreg(c)) {
            Some(v) => frame.set_vreg(a, v),
            None => return Ok(Step::Raise(WellKnownClass::ArithmeticException)),
        },
        0x9b..=0xa5 => {
            let binop = BINOPS[(op - 0x9b) as usize];
            let rhs = match binop {
                BinOp::Shl | BinOp::Shr | BinOp::Ushr => frame.vreg(c) as i64,
                _ => frame.vreg_long(c),
            };
            match long_op(binop, frame.vreg_long(b), rhs) {
                Some(v) => frame.set_vreg_long(a, v),
                None => return Ok(Step::Raise(WellKnownClass::ArithmeticException)),
            }
        }
        0xb0..=0xba => match int_op(BINOPS[(op - 0xb0) as usize], frame.vreg(a), frame.vreg(b)) {
            Some(v) => frame.set_vreg(a, v),
            None => return Ok(Step::Raise(WellKnownClass::ArithmeticException)),
        },
        0xbb..=0xc5 => {
            let binop = BINOPS[(op - 0xbb) as usize];
            let rhs = match binop {
                BinOp::Shl | BinOp::Shr | BinOp::Ushr => frame.vreg(b) as i64,
                _ => frame.vreg_long(b),
            };
            match long_op(binop, frame.vreg_long(a), rhs) {
                Some(v) => frame.set_vreg_long(a, v),
                None => return Ok(Step::Raise(WellKnownClass::ArithmeticException)),
            }
        }
        // lit16 stops at xor; lit8 adds the shifts. Index 1 is rsub.
        0xd0..=0xd7 | 0xd8..=0xe2 => {
            let k = usize::from(if op >= 0xd8 { op - 0xd8 } else { op - 0xd0 });
            let lit = inst.literal().ok_or_else(|| invalid(method, pc))? as i32;
            let v = frame.vreg(b);
            let result = if k == 1 { Some(lit.wrapping_sub(v)) } else { int_op(BINOPS[k], v, lit) };
            match result {
                Some(r) => frame.set_vreg(a, r),
                None => return Ok(Step::Raise(WellKnownClass::ArithmeticException)),
            }
        }
        _ => return Err(invalid(method, pc)),
    }
    Ok(Step::Next(next))
}

/// Resolve the callee and gather its arguments.
fn invoke_step(thread: &Thread, method: &Arc<Method>, inst: &Instruction<'_>, frame: &ShadowFrame, next: u32) -> RuntimeResult<Step> {
    let pc = inst.dex_pc();
    let op = inst.opcode();
    let idx = inst.index().ok_or_else(|| invalid(method, pc))?;
    let runtime = thread.runtime();
    let linker = runtime.class_linker();
    let resolved = match resolve(thread, method, pc, op, || {
        linker.resolve_method(method, idx).map(CachedValue::Method).ok_or(WellKnownClass::NoSuchMethodError)
    }) {
        Ok(CachedValue::Method(m)) => m,
        Ok(_) => return Err(invalid(method, pc)),
        Err(which) => return Ok(Step::Raise(which)),
    };

    let regs = inst.arg_registers();
    let mut regs = regs.iter().map(|r| *r as usize);
    let mut args = vec![];
    let mut callee = resolved.clone();
    if !resolved.is_static() {
        let this = regs.next().and_then(|r| frame.vreg_ref(r));
        let Some(this) = this else {
            return Ok(Step::Raise(WellKnownClass::NullPointerException));
        };
        if matches!(op, 0x6e | 0x74) {
            if let Some(m) = runtime.class_of(this).and_then(|class| linker.find_virtual_method(class, resolved.name(), resolved.signature())) {
                callee = m;
            }
        }
        args.push(JValue::from_ref(Some(this)));
    }
    for c in resolved.shorty().chars().skip(1) {
        let Some(r) = regs.next() else {
            return Err(invalid(method, pc));
        };
        args.push(match c {
            'L' => JValue::from_ref(frame.vreg_ref(r)),
            'J' | 'D' => {
                regs.next();
                JValue::from_long(frame.vreg_long(r))
            }
            _ => JValue::from_int(frame.vreg(r)),
        });
    }
    Ok(Step::Invoke { callee, args, next })
}

/// Run interpreter frames a deoptimization left stacked on the thread,
/// innermost first, handing each frame's result to the frame below it.
/// Returns what the outermost frame returned.
pub fn enter_from_deoptimize(thread: &Thread) -> RuntimeResult<JValue> {
    let (chain, base) = {
        let mut stack = thread.stack();
        let record = stack
            .pop_stacked_shadow_frame()
            .ok_or(RuntimeError::NotDeoptimizable { method: "<no deoptimized frames>".to_string() })?;
        let top = record.top;
        let context = stack.pop_deoptimization_context().unwrap_or_default();
        let chain = stack.arena().chain(top);
        if context.from_return {
            if let Some(innermost) = stack.shadow_mut(top) {
                innermost.result = context.return_value;
                innermost.resume_after_invoke = true;
            }
        }
        trace!("thread {} takes {:?} record, from return: {}", thread.id(), record.kind, context.from_return);
        if context.pending_exception.is_some() {
            thread.set_exception(context.pending_exception);
        }
        let base = stack.depth();
        for id in chain.iter().rev() {
            stack.push_allocated(*id);
        }
        thread.publish_stack_top(&stack);
        (chain, base)
    };
    debug!("thread {} resumes {} deoptimized frames", thread.id(), chain.len());

    let mut value = JValue::default();
    for (i, id) in chain.iter().enumerate() {
        if i > 0 {
            if let Some(frame) = thread.stack().shadow_mut(*id) {
                frame.result = value;
            }
        }
        value = run(thread, *id)?;
        let mut stack = thread.stack();
        stack.truncate(base + chain.len() - 1 - i);
        thread.publish_stack_top(&stack);
    }
    Ok(value)
}
