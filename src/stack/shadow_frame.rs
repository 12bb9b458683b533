/* Interpreter frames and the records that carry them across a deoptimization */

use std::sync::Arc;

use crate::runtime::object::{JValue, ObjRef};
use crate::stack::method::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowFrameId(u32);

impl ShadowFrameId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// An interpreter frame. Every vreg has a parallel reference slot that is
/// non-zero only while the vreg holds a reference.
#[derive(Debug, Clone)]
pub struct ShadowFrame {
    pub method: Arc<Method>,
    pub dex_pc: u32,
    vregs: Vec<u32>,
    refs: Vec<u32>,
    /// The next frame out: the caller, or the next record in a deoptimized chain.
    pub link: Option<ShadowFrameId>,
    /// Objects locked by monitor-enter in this frame.
    pub lock_count: Vec<u32>,
    /// Continue after the invoke at `dex_pc` with `result` instead of executing it.
    pub resume_after_invoke: bool,
    pub result: JValue,
}

impl ShadowFrame {
    pub fn new(method: Arc<Method>, num_vregs: usize) -> ShadowFrame {
        ShadowFrame {
            method,
            dex_pc: 0,
            vregs: vec![0; num_vregs],
            refs: vec![0; num_vregs],
            link: None,
            lock_count: vec![],
            resume_after_invoke: false,
            result: JValue::default(),
        }
    }

    pub fn num_vregs(&self) -> usize {
        self.vregs.len()
    }

    pub fn vreg(&self, i: usize) -> i32 {
        self.vregs.get(i).copied().unwrap_or(0) as i32
    }

    pub fn set_vreg(&mut self, i: usize, v: i32) {
        if let (Some(slot), Some(r)) = (self.vregs.get_mut(i), self.refs.get_mut(i)) {
            *slot = v as u32;
            *r = 0;
        }
    }

    pub fn vreg_long(&self, i: usize) -> i64 {
        JValue::from_halves(self.vreg(i) as u32, self.vreg(i + 1) as u32).as_long()
    }

    pub fn set_vreg_long(&mut self, i: usize, v: i64) {
        let (lo, hi) = JValue::from_long(v).halves();
        self.set_vreg(i, lo as i32);
        self.set_vreg(i + 1, hi as i32);
    }

    pub fn vreg_ref(&self, i: usize) -> Option<ObjRef> {
        self.refs.get(i).and_then(|r| ObjRef::from_raw(*r))
    }

    pub fn set_vreg_ref(&mut self, i: usize, obj: Option<ObjRef>) {
        let raw = obj.map_or(0, ObjRef::raw);
        if let (Some(slot), Some(r)) = (self.vregs.get_mut(i), self.refs.get_mut(i)) {
            *slot = raw;
            *r = raw;
        }
    }

    pub fn is_reference(&self, i: usize) -> bool {
        self.refs.get(i).is_some_and(|r| *r != 0)
    }

    /// Visit reference vregs, replacing any the callback relocates.
    pub fn visit_refs<F>(&mut self, mut f: F)
    where
        F: FnMut(usize, ObjRef) -> Option<ObjRef>,
    {
        for i in 0..self.refs.len() {
            if let Some(obj) = ObjRef::from_raw(self.refs[i]) {
                if let Some(new) = f(i, obj) {
                    self.refs[i] = new.raw();
                    self.vregs[i] = new.raw();
                }
            }
        }
    }
}

/// Shadow frames live here; ids are recycled through a free list.
#[derive(Debug, Default)]
pub struct ShadowFrameArena {
    slots: Vec<Option<ShadowFrame>>,
    free: Vec<u32>,
}

impl ShadowFrameArena {
    pub fn alloc(&mut self, frame: ShadowFrame) -> ShadowFrameId {
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(frame);
                ShadowFrameId(i)
            }
            None => {
                self.slots.push(Some(frame));
                ShadowFrameId(self.slots.len() as u32 - 1)
            }
        }
    }

    pub fn free(&mut self, id: ShadowFrameId) -> Option<ShadowFrame> {
        let frame = self.slots.get_mut(id.index())?.take();
        if frame.is_some() {
            self.free.push(id.0);
        }
        frame
    }

    pub fn get(&self, id: ShadowFrameId) -> Option<&ShadowFrame> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ShadowFrameId) -> Option<&mut ShadowFrame> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Ids along a `link` chain starting at `top`.
    pub fn chain(&self, top: ShadowFrameId) -> Vec<ShadowFrameId> {
        let mut out = vec![];
        let mut next = Some(top);
        while let Some(id) = next {
            if out.contains(&id) {
                break;
            }
            out.push(id);
            next = self.get(id).and_then(|f| f.link);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackedShadowFrameType {
    /// Built from a compiled frame and waiting for the interpreter.
    Deoptimization,
    /// Built for a single frame asked to deoptimize on return.
    SingleFrameDeoptimization,
}

/// A chain of shadow frames, innermost first, parked on the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackedShadowFrameRecord {
    pub top: ShadowFrameId,
    pub kind: StackedShadowFrameType,
}

/// What the interpreter needs to resume correctly after a deoptimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeoptimizationContextRecord {
    pub return_value: JValue,
    pub return_is_reference: bool,
    pub pending_exception: Option<ObjRef>,
    /// Deoptimized after the innermost frame's callee returned.
    pub from_return: bool,
}

/// Installed by a debugger to replace a frame's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebuggerShadowFrame {
    pub frame_index: usize,
    pub frame: ShadowFrameId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::object::ClassId;

    fn method() -> Arc<Method> {
        Arc::new(Method::new(ClassId(1), "LFoo;", "f", "()V", 0))
    }

    #[test]
    fn scalar_writes_clear_reference_slots() {
        let mut f = ShadowFrame::new(method(), 4);
        f.set_vreg_ref(0, ObjRef::from_raw(0x40));
        assert!(f.is_reference(0));
        f.set_vreg(0, 7);
        assert!(!f.is_reference(0));
        f.set_vreg_long(2, -5);
        assert_eq!(f.vreg_long(2), -5);

        f.set_vreg_ref(1, ObjRef::from_raw(0x80));
        f.visit_refs(|i, _| (i == 1).then(|| ObjRef::from_raw(0x100)).flatten());
        assert_eq!(f.vreg_ref(1).map(ObjRef::raw), Some(0x100));
        assert_eq!(f.vreg(1), 0x100);
    }

    #[test]
    fn arena_recycles_ids() {
        let mut arena = ShadowFrameArena::default();
        let a = arena.alloc(ShadowFrame::new(method(), 1));
        let mut inner = ShadowFrame::new(method(), 1);
        inner.link = Some(a);
        let b = arena.alloc(inner);
        assert_eq!(arena.chain(b), vec![b, a]);
        assert!(arena.free(a).is_some());
        assert!(arena.free(a).is_none());
        let c = arena.alloc(ShadowFrame::new(method(), 1));
        assert_eq!(c, a);
        assert_eq!(arena.live(), 2);
    }
}
