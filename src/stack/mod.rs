//! Per-thread managed stacks: interpreter (shadow) frames, compiled (quick)
//! frames, the records deoptimization leaves behind, and the walker over them.

pub mod method;
pub mod quick_frame;
pub mod shadow_frame;
pub mod stack_map;
pub mod walker;

use crate::stack::quick_frame::QuickFrame;
use crate::stack::shadow_frame::{
    DebuggerShadowFrame, DeoptimizationContextRecord, ShadowFrame, ShadowFrameArena, ShadowFrameId, StackedShadowFrameRecord,
    StackedShadowFrameType,
};

/// One entry on a managed stack.
#[derive(Debug, Clone)]
pub enum Frame {
    Shadow(ShadowFrameId),
    Quick(QuickFrame),
}

impl Frame {
    pub fn is_shadow(&self) -> bool {
        matches!(self, Frame::Shadow(_))
    }
}

/// Frames in push order (oldest first), plus the arena that owns shadow frames.
#[derive(Debug, Default)]
pub struct ManagedStack {
    frames: Vec<Frame>,
    arena: ShadowFrameArena,
    stacked_shadow_frames: Vec<StackedShadowFrameRecord>,
    deoptimization_contexts: Vec<DeoptimizationContextRecord>,
    debugger_frames: Vec<DebuggerShadowFrame>,
}

impl ManagedStack {
    pub fn new() -> ManagedStack {
        ManagedStack::default()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn frame_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pop the newest frame. A shadow frame's arena slot is released.
    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        if let Frame::Shadow(id) = frame {
            self.arena.free(id);
        }
        Some(frame)
    }

    /// Pop the newest frame if it is a shadow frame and hand it back.
    pub fn pop_shadow(&mut self) -> Option<ShadowFrame> {
        match self.frames.last() {
            Some(Frame::Shadow(id)) => {
                let id = *id;
                self.frames.pop();
                self.arena.free(id)
            }
            _ => None,
        }
    }

    /// Drop every frame above `depth`.
    pub fn truncate(&mut self, depth: usize) {
        while self.frames.len() > depth {
            self.pop();
        }
    }

    /// Push an interpreter frame linked to the newest shadow frame below it.
    pub fn push_shadow(&mut self, mut frame: ShadowFrame) -> ShadowFrameId {
        frame.link = self.top_shadow();
        let id = self.arena.alloc(frame);
        self.frames.push(Frame::Shadow(id));
        id
    }

    /// Push a frame that is already in the arena, relinking it to the frame below.
    pub fn push_allocated(&mut self, id: ShadowFrameId) {
        let link = self.top_shadow();
        if let Some(f) = self.arena.get_mut(id) {
            f.link = link;
        }
        self.frames.push(Frame::Shadow(id));
    }

    /// Replace the frame at `index` with `replacement`, oldest first.
    pub fn splice(&mut self, index: usize, replacement: Vec<Frame>) -> Option<Frame> {
        if index >= self.frames.len() {
            return None;
        }
        self.frames.splice(index..=index, replacement).next()
    }

    pub fn top_shadow(&self) -> Option<ShadowFrameId> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::Shadow(id) => Some(*id),
            Frame::Quick(_) => None,
        })
    }

    pub fn arena(&self) -> &ShadowFrameArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ShadowFrameArena {
        &mut self.arena
    }

    pub fn shadow(&self, id: ShadowFrameId) -> Option<&ShadowFrame> {
        self.arena.get(id)
    }

    pub fn shadow_mut(&mut self, id: ShadowFrameId) -> Option<&mut ShadowFrame> {
        self.arena.get_mut(id)
    }

    // Deoptimization records

    pub fn push_stacked_shadow_frame(&mut self, top: ShadowFrameId, kind: StackedShadowFrameType) {
        self.stacked_shadow_frames.push(StackedShadowFrameRecord { top, kind });
    }

    /// Pop the newest record, whatever its kind.
    pub fn pop_stacked_shadow_frame(&mut self) -> Option<StackedShadowFrameRecord> {
        self.stacked_shadow_frames.pop()
    }

    pub fn stacked_shadow_frames(&self) -> &[StackedShadowFrameRecord] {
        &self.stacked_shadow_frames
    }

    pub fn push_deoptimization_context(&mut self, record: DeoptimizationContextRecord) {
        self.deoptimization_contexts.push(record);
    }

    pub fn pop_deoptimization_context(&mut self) -> Option<DeoptimizationContextRecord> {
        self.deoptimization_contexts.pop()
    }

    /// The newest context record if it holds a return value no stacked
    /// frames have been paired with yet.
    pub fn unpaired_return_context_mut(&mut self) -> Option<&mut DeoptimizationContextRecord> {
        if self.deoptimization_contexts.len() <= self.stacked_shadow_frames.len() {
            return None;
        }
        self.deoptimization_contexts.last_mut().filter(|r| r.from_return)
    }

    pub fn deoptimization_contexts(&self) -> &[DeoptimizationContextRecord] {
        &self.deoptimization_contexts
    }

    pub fn deoptimization_contexts_mut(&mut self) -> &mut [DeoptimizationContextRecord] {
        &mut self.deoptimization_contexts
    }

    // Debugger frames

    /// Install `frame` as the debugger's view of the frame at `frame_index`,
    /// replacing any earlier one.
    pub fn set_debugger_shadow_frame(&mut self, frame_index: usize, frame: ShadowFrame) -> ShadowFrameId {
        self.remove_debugger_shadow_frame(frame_index);
        let id = self.arena.alloc(frame);
        self.debugger_frames.push(DebuggerShadowFrame { frame_index, frame: id });
        id
    }

    pub fn debugger_shadow_frame(&self, frame_index: usize) -> Option<ShadowFrameId> {
        self.debugger_frames.iter().find(|d| d.frame_index == frame_index).map(|d| d.frame)
    }

    pub fn remove_debugger_shadow_frame(&mut self, frame_index: usize) -> bool {
        match self.debugger_frames.iter().position(|d| d.frame_index == frame_index) {
            Some(i) => {
                let d = self.debugger_frames.remove(i);
                self.arena.free(d.frame);
                true
            }
            None => false,
        }
    }

    pub fn debugger_frames(&self) -> &[DebuggerShadowFrame] {
        &self.debugger_frames
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runtime::object::ClassId;
    use crate::stack::method::Method;

    fn method(name: &str) -> Arc<Method> {
        Arc::new(Method::new(ClassId(1), "LFoo;", name, "()V", 0))
    }

    #[test]
    fn shadow_frames_link_across_quick_frames() {
        let mut stack = ManagedStack::new();
        let a = stack.push_shadow(ShadowFrame::new(method("a"), 2));
        stack.push(Frame::Quick(QuickFrame::new(method("b"), 0, 8)));
        let c = stack.push_shadow(ShadowFrame::new(method("c"), 2));
        assert_eq!(stack.shadow(c).and_then(|f| f.link), Some(a));
        assert_eq!(stack.depth(), 3);

        assert_eq!(stack.pop_shadow().map(|f| f.method.name().to_string()), Some("c".to_string()));
        assert!(stack.pop_shadow().is_none());
        stack.truncate(0);
        assert_eq!(stack.arena().live(), 0);
    }

    #[test]
    fn stacked_records_pop_newest_first() {
        let mut stack = ManagedStack::new();
        let older = stack.arena_mut().alloc(ShadowFrame::new(method("d"), 1));
        let newer = stack.arena_mut().alloc(ShadowFrame::new(method("d2"), 1));
        stack.push_stacked_shadow_frame(older, StackedShadowFrameType::Deoptimization);
        stack.push_stacked_shadow_frame(newer, StackedShadowFrameType::SingleFrameDeoptimization);
        let first = stack.pop_stacked_shadow_frame().unwrap();
        assert_eq!((first.top, first.kind), (newer, StackedShadowFrameType::SingleFrameDeoptimization));
        assert_eq!(stack.pop_stacked_shadow_frame().map(|r| r.top), Some(older));
        assert!(stack.pop_stacked_shadow_frame().is_none());

        stack.push_deoptimization_context(DeoptimizationContextRecord { from_return: true, ..Default::default() });
        assert!(stack.unpaired_return_context_mut().is_some());
        stack.push_stacked_shadow_frame(older, StackedShadowFrameType::Deoptimization);
        assert!(stack.unpaired_return_context_mut().is_none());

        let dbg = stack.set_debugger_shadow_frame(4, ShadowFrame::new(method("e"), 1));
        assert_eq!(stack.debugger_shadow_frame(4), Some(dbg));
        assert!(stack.remove_debugger_shadow_frame(4));
        assert!(stack.debugger_frames().is_empty());
    }
}
