/* Replacing compiled frames with equivalent interpreter frames */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::object::{JValue, ObjRef};
use crate::runtime::thread::Thread;
use crate::stack::method::Method;
use crate::stack::quick_frame::QuickFrame;
use crate::stack::shadow_frame::{DeoptimizationContextRecord, ShadowFrame, ShadowFrameId, StackedShadowFrameType};
use crate::stack::stack_map::{DexRegisterLocation, StackMap};
use crate::stack::walker::stack_map_at;
use crate::stack::{Frame, ManagedStack};

/// Why compiled code gave up on a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptimizationKind {
    InlineCache,
    BoundsCheck,
    ClassHierarchy,
    Debugging,
    FullFrame,
    /// The exception path needed the interpreter to run a handler.
    Exception,
}

impl DeoptimizationKind {
    pub const ALL: [DeoptimizationKind; 6] = [
        DeoptimizationKind::InlineCache,
        DeoptimizationKind::BoundsCheck,
        DeoptimizationKind::ClassHierarchy,
        DeoptimizationKind::Debugging,
        DeoptimizationKind::FullFrame,
        DeoptimizationKind::Exception,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeoptimizationKind::InlineCache => "inline-cache",
            DeoptimizationKind::BoundsCheck => "bounds-check",
            DeoptimizationKind::ClassHierarchy => "class-hierarchy",
            DeoptimizationKind::Debugging => "debugging",
            DeoptimizationKind::FullFrame => "full-frame",
            DeoptimizationKind::Exception => "exception",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

/// Per-kind deoptimization counters.
#[derive(Debug, Default)]
pub struct DeoptimizationStats {
    counts: [AtomicU32; 6],
}

impl DeoptimizationStats {
    pub fn record(&self, kind: DeoptimizationKind) {
        self.counts[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, kind: DeoptimizationKind) -> u32 {
        self.counts[kind.slot()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// `kind=count` pairs for every kind seen at least once.
    pub fn dump(&self) -> String {
        DeoptimizationKind::ALL
            .iter()
            .filter(|k| self.count(**k) > 0)
            .map(|k| format!("{}={}", k.name(), self.count(*k)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn not_deoptimizable(method: &Method) -> RuntimeError {
    RuntimeError::NotDeoptimizable { method: method.pretty_name() }
}

/// Whether the stack map says `location` holds a reference.
fn holds_reference(map: &StackMap, location: DexRegisterLocation) -> bool {
    match location {
        DexRegisterLocation::InStack(off) => off >= 0 && map.is_stack_slot_ref(off as usize / 4),
        DexRegisterLocation::InRegister(r) => r < 32 && map.register_mask & (1 << r) != 0,
        DexRegisterLocation::None | DexRegisterLocation::Constant(_) => false,
    }
}

fn interpreter_frame(method: &Arc<Method>, dex_pc: u32, q: &QuickFrame, map: &StackMap, locations: &[DexRegisterLocation]) -> RuntimeResult<ShadowFrame> {
    let code = method.code().ok_or_else(|| not_deoptimizable(method))?;
    let mut frame = ShadowFrame::new(method.clone(), code.registers_size as usize);
    frame.dex_pc = dex_pc;
    for (vreg, location) in locations.iter().enumerate().take(frame.num_vregs()) {
        // Dead registers stay zero.
        let Some(value) = q.read_location(*location) else { continue };
        if holds_reference(map, *location) {
            frame.set_vreg_ref(vreg, ObjRef::from_raw(value));
        } else {
            frame.set_vreg(vreg, value as i32);
        }
    }
    Ok(frame)
}

/// The interpreter frames equivalent to compiled frame `q` at its current
/// safepoint: the outer method first, then one per inlined callee. Every
/// frame but the innermost sits on the invoke of the next one.
pub fn build_shadow_frames(q: &QuickFrame) -> RuntimeResult<Vec<ShadowFrame>> {
    let method = &q.method;
    if !method.is_deoptimizable() {
        return Err(not_deoptimizable(method));
    }
    let compiled = method.compiled().ok_or_else(|| not_deoptimizable(method))?;
    let map = stack_map_at(method, q.native_pc).ok_or_else(|| not_deoptimizable(method))?;

    let mut frames = vec![interpreter_frame(method, map.dex_pc, q, map, &map.dex_registers)?];
    for info in &map.inline_infos {
        let callee = compiled.inlined_methods.get(info.method_index as usize).ok_or_else(|| not_deoptimizable(method))?;
        frames.push(interpreter_frame(callee, info.dex_pc, q, map, &info.dex_registers)?);
    }
    let n = frames.len();
    for f in &mut frames[..n - 1] {
        f.resume_after_invoke = true;
    }
    trace!("{} at native pc {:#x} rebuilt as {} interpreter frames", method.pretty_name(), q.native_pc, n);
    Ok(frames)
}

/// Put `frames` (oldest first) in the arena linked newest to oldest, and
/// return the newest. The oldest links nowhere until it is pushed.
fn allocate_chain(stack: &mut ManagedStack, frames: Vec<ShadowFrame>) -> Option<ShadowFrameId> {
    let mut top = None;
    for mut f in frames {
        f.link = top;
        top = Some(stack.arena_mut().alloc(f));
    }
    top
}

/// Index of the newest frame below any runtime stubs on top.
fn newest_method_frame(stack: &ManagedStack) -> Option<usize> {
    (0..stack.depth()).rev().find(|i| !matches!(stack.frame(*i), Some(Frame::Quick(q)) if q.method.is_runtime_method()))
}

fn quick_at(stack: &ManagedStack, index: usize) -> Option<&QuickFrame> {
    match stack.frame(index) {
        Some(Frame::Quick(q)) if !q.method.is_native() && !q.method.is_runtime_method() => Some(q),
        _ => None,
    }
}

/// Move `frames` off the stack into a stacked record, paired with a context
/// record carrying the pending exception. A return value saved by
/// `push_return_context` becomes that context. Everything from `from` up is
/// popped.
fn stack_chain(thread: &Thread, stack: &mut ManagedStack, from: usize, frames: Vec<ShadowFrame>, kind: StackedShadowFrameType) {
    stack.truncate(from);
    let count = frames.len();
    let pending = thread.exception();
    match stack.unpaired_return_context_mut() {
        Some(saved) => saved.pending_exception = saved.pending_exception.or(pending),
        None => stack.push_deoptimization_context(DeoptimizationContextRecord {
            pending_exception: pending,
            ..Default::default()
        }),
    }
    if let Some(top) = allocate_chain(stack, frames) {
        stack.push_stacked_shadow_frame(top, kind);
    }
    thread.set_exception(None);
    thread.publish_stack_top(stack);
    debug!("thread {} stacked {} deoptimized frames", thread.id(), count);
}

/// Deoptimize the newest compiled frame. Its interpreter frames wait in a
/// stacked record until `interpreter::enter_from_deoptimize` runs them.
pub fn deoptimize_single_frame(thread: &Thread, kind: DeoptimizationKind) -> RuntimeResult<()> {
    let mut stack = thread.stack();
    let index = newest_method_frame(&stack).ok_or(RuntimeError::NotDeoptimizable { method: "<empty stack>".to_string() })?;
    let frames = match quick_at(&stack, index) {
        Some(q) => build_shadow_frames(q)?,
        None => return Err(RuntimeError::NotDeoptimizable { method: describe_frame(&stack, index) }),
    };
    stack_chain(thread, &mut stack, index, frames, StackedShadowFrameType::SingleFrameDeoptimization);
    thread.runtime().deoptimization_stats().record(kind);
    Ok(())
}

/// Deoptimize every compiled frame from the newest down to the first
/// interpreter, native or runtime frame. Returns the number of interpreter
/// frames produced.
pub fn deoptimize_partial_fragment(thread: &Thread, kind: DeoptimizationKind) -> RuntimeResult<usize> {
    let mut stack = thread.stack();
    let top = newest_method_frame(&stack).ok_or(RuntimeError::NotDeoptimizable { method: "<empty stack>".to_string() })?;
    let mut bottom = top + 1;
    while bottom > 0 && quick_at(&stack, bottom - 1).is_some() {
        bottom -= 1;
    }
    if bottom > top {
        return Err(RuntimeError::NotDeoptimizable { method: describe_frame(&stack, top) });
    }

    let mut frames = vec![];
    for index in bottom..=top {
        if let Some(q) = quick_at(&stack, index) {
            let mut chain = build_shadow_frames(q)?;
            // Older physical frames were calling the next one up.
            if index < top {
                if let Some(innermost) = chain.last_mut() {
                    innermost.resume_after_invoke = true;
                }
            }
            frames.append(&mut chain);
        }
    }
    let count = frames.len();
    stack_chain(thread, &mut stack, bottom, frames, StackedShadowFrameType::Deoptimization);
    thread.runtime().deoptimization_stats().record(kind);
    Ok(count)
}

/// Replace the compiled frame at `index` with its interpreter frames, in place.
/// Returns how many frames now stand where it stood.
pub(crate) fn deoptimize_in_place(stack: &mut ManagedStack, index: usize) -> RuntimeResult<usize> {
    let frames = match quick_at(stack, index) {
        Some(q) => build_shadow_frames(q)?,
        None => return Err(RuntimeError::NotDeoptimizable { method: describe_frame(stack, index) }),
    };
    let mut link = stack.frames()[..index].iter().rev().find_map(|f| match f {
        Frame::Shadow(id) => Some(*id),
        Frame::Quick(_) => None,
    });
    let mut replacement = Vec::with_capacity(frames.len());
    for mut f in frames {
        f.link = link;
        let id = stack.arena_mut().alloc(f);
        link = Some(id);
        replacement.push(Frame::Shadow(id));
    }
    let count = replacement.len();
    stack.splice(index, replacement);
    Ok(count)
}

/// Record a value returned into a frame that is about to be deoptimized.
/// The next deoptimization on this thread pairs its frames with it, and the
/// interpreter hands it to the innermost frame as the invoke's result.
pub fn push_return_context(thread: &Thread, value: JValue, is_reference: bool) {
    let mut stack = thread.stack();
    let record = DeoptimizationContextRecord {
        return_value: value,
        return_is_reference: is_reference,
        pending_exception: thread.exception(),
        from_return: true,
    };
    match stack.unpaired_return_context_mut() {
        Some(saved) => {
            warn!("thread {} replaces a return value no deoptimization claimed", thread.id());
            *saved = record;
        }
        None => stack.push_deoptimization_context(record),
    }
    thread.set_exception(None);
}

/// Drop a return value saved by `push_return_context` that no deoptimization
/// claimed, putting its pending exception back on the thread.
pub fn discard_return_context(thread: &Thread) {
    let mut stack = thread.stack();
    if stack.unpaired_return_context_mut().is_none() {
        return;
    }
    if let Some(record) = stack.pop_deoptimization_context() {
        if record.pending_exception.is_some() {
            thread.set_exception(record.pending_exception);
        }
    }
}

fn describe_frame(stack: &ManagedStack, index: usize) -> String {
    match stack.frame(index) {
        Some(Frame::Quick(q)) => q.method.pretty_name(),
        Some(Frame::Shadow(id)) => stack.shadow(*id).map(|f| f.method.pretty_name()).unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::code_item::MethodCode;
    use crate::runtime::object::ClassId;
    use crate::stack::method::CompiledCode;
    use crate::stack::stack_map::{CodeInfo, InlineInfo};

    fn managed(name: &str, registers: u16) -> Method {
        Method::new(ClassId(1), "LFoo;", name, "()I", 0).with_code(MethodCode { registers_size: registers, ..Default::default() })
    }

    fn compiled_frame() -> QuickFrame {
        let callee = Arc::new(managed("callee", 2));
        let map = StackMap {
            native_pc: 0x10,
            dex_pc: 4,
            stack_mask: 1 << 1,
            dex_registers: vec![
                DexRegisterLocation::InStack(0),
                DexRegisterLocation::InStack(4),
                DexRegisterLocation::Constant(-1),
            ],
            inline_infos: vec![InlineInfo { method_index: 0, dex_pc: 2, dex_registers: vec![DexRegisterLocation::None, DexRegisterLocation::InRegister(2)] }],
            ..Default::default()
        };
        let method = Arc::new(managed("caller", 3).with_compiled(CompiledCode {
            code_info: CodeInfo { frame_size: 8, stack_maps: vec![map], ..Default::default() },
            inlined_methods: vec![callee],
            deoptimizable: true,
        }));
        let mut q = QuickFrame::new(method, 0x10, 8);
        q.write_u32(0, 7);
        q.write_u32(4, 0x40);
        q.registers[2] = 9;
        q
    }

    #[test]
    fn frames_follow_the_stack_map() {
        let frames = build_shadow_frames(&compiled_frame()).unwrap();
        assert_eq!(frames.len(), 2);
        let (outer, inner) = (&frames[0], &frames[1]);
        assert_eq!(outer.method.name(), "caller");
        assert_eq!(outer.dex_pc, 4);
        assert!(outer.resume_after_invoke);
        assert_eq!(outer.vreg(0), 7);
        assert!(!outer.is_reference(0));
        assert_eq!(outer.vreg_ref(1).map(ObjRef::raw), Some(0x40));
        assert_eq!(outer.vreg(2), -1);
        assert_eq!(inner.method.name(), "callee");
        assert_eq!(inner.dex_pc, 2);
        assert!(!inner.resume_after_invoke);
        assert_eq!(inner.vreg(0), 0);
        assert_eq!(inner.vreg(1), 9);
    }

    #[test]
    fn methods_without_maps_refuse() {
        let m = Arc::new(managed("plain", 1));
        let err = build_shadow_frames(&QuickFrame::new(m, 0, 0)).unwrap_err();
        assert!(matches!(err, RuntimeError::NotDeoptimizable { .. }));
        let mut q = compiled_frame();
        q.native_pc = 0x99;
        assert!(build_shadow_frames(&q).is_err());
    }

    #[test]
    fn in_place_replacement_links_to_caller() {
        let mut stack = ManagedStack::new();
        let below = stack.push_shadow(ShadowFrame::new(Arc::new(managed("bottom", 1)), 1));
        stack.push(Frame::Quick(compiled_frame()));
        assert_eq!(deoptimize_in_place(&mut stack, 1).unwrap(), 2);
        assert_eq!(stack.depth(), 3);
        let top = stack.top_shadow().unwrap();
        let chain = stack.arena().chain(top);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2], below);
        assert!(deoptimize_in_place(&mut stack, 0).is_err());
    }

    #[test]
    fn stats_count_by_kind() {
        let stats = DeoptimizationStats::default();
        stats.record(DeoptimizationKind::Debugging);
        stats.record(DeoptimizationKind::Debugging);
        stats.record(DeoptimizationKind::Exception);
        assert_eq!(stats.count(DeoptimizationKind::Debugging), 2);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.dump(), "debugging=2 exception=1");
    }
}
