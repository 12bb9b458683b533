/* Walk a managed stack, materializing inlined frames on request */

use std::sync::Arc;

use crate::stack::method::Method;
use crate::stack::shadow_frame::ShadowFrameId;
use crate::stack::stack_map::StackMap;
use crate::stack::{Frame, ManagedStack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkKind {
    IncludeInlinedFrames,
    SkipInlinedFrames,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Shadow,
    Quick,
    Inlined,
}

/// What a walk reports for one frame.
#[derive(Debug, Clone)]
pub struct FrameRef {
    pub kind: FrameKind,
    pub method: Arc<Method>,
    /// Index of the owning entry in the managed stack.
    pub stack_index: usize,
    pub dex_pc: Option<u32>,
    pub native_pc: Option<u32>,
    pub frame_size: usize,
    /// 0 for the physical frame, `n` for the n-th inlined callee.
    pub inline_depth: usize,
    pub shadow: Option<ShadowFrameId>,
}

impl FrameRef {
    pub fn is_inlined(&self) -> bool {
        self.kind == FrameKind::Inlined
    }
}

pub trait StackVisitor {
    /// Return false to stop the walk.
    fn visit_frame(&mut self, frame: &FrameRef) -> bool;
}

impl<F> StackVisitor for F
where
    F: FnMut(&FrameRef) -> bool,
{
    fn visit_frame(&mut self, frame: &FrameRef) -> bool {
        self(frame)
    }
}

/// Stack map describing `method` at `native_pc`, if it was compiled.
pub fn stack_map_at(method: &Method, native_pc: u32) -> Option<&StackMap> {
    method.compiled()?.code_info.stack_map_for_native_pc(native_pc)
}

/// Frames of one stack entry, newest first.
fn expand(stack: &ManagedStack, index: usize, kind: WalkKind) -> Vec<FrameRef> {
    let frame = match stack.frame(index) {
        Some(f) => f,
        None => return vec![],
    };
    match frame {
        Frame::Shadow(id) => match stack.shadow(*id) {
            Some(sf) => vec![FrameRef {
                kind: FrameKind::Shadow,
                method: sf.method.clone(),
                stack_index: index,
                dex_pc: Some(sf.dex_pc),
                native_pc: None,
                frame_size: sf.num_vregs() * 4,
                inline_depth: 0,
                shadow: Some(*id),
            }],
            None => vec![],
        },
        Frame::Quick(q) => {
            if q.method.is_runtime_method() {
                return vec![];
            }
            let map = stack_map_at(&q.method, q.native_pc);
            let mut out = vec![];
            if let (WalkKind::IncludeInlinedFrames, Some(map), Some(compiled)) = (kind, map, q.method.compiled()) {
                for (depth, info) in map.inline_infos.iter().enumerate().rev() {
                    if let Some(m) = compiled.inlined_methods.get(info.method_index as usize) {
                        out.push(FrameRef {
                            kind: FrameKind::Inlined,
                            method: m.clone(),
                            stack_index: index,
                            dex_pc: Some(info.dex_pc),
                            native_pc: Some(q.native_pc),
                            frame_size: 0,
                            inline_depth: depth + 1,
                            shadow: None,
                        });
                    }
                }
            }
            out.push(FrameRef {
                kind: FrameKind::Quick,
                method: q.method.clone(),
                stack_index: index,
                dex_pc: map.map(|m| m.dex_pc),
                native_pc: Some(q.native_pc),
                frame_size: q.frame_size(),
                inline_depth: 0,
                shadow: None,
            });
            out
        }
    }
}

/// Visit every frame of `stack` in `order` until the visitor stops.
/// Runtime transition methods are never reported.
pub fn walk_stack<V: StackVisitor + ?Sized>(stack: &ManagedStack, kind: WalkKind, order: WalkOrder, visitor: &mut V) {
    let n = stack.depth();
    for i in 0..n {
        let index = match order {
            WalkOrder::NewestFirst => n - 1 - i,
            WalkOrder::OldestFirst => i,
        };
        let mut frames = expand(stack, index, kind);
        if order == WalkOrder::OldestFirst {
            frames.reverse();
        }
        for f in &frames {
            if !visitor.visit_frame(f) {
                return;
            }
        }
    }
}

/// Every frame, newest first.
pub fn frames(stack: &ManagedStack, kind: WalkKind) -> Vec<FrameRef> {
    let mut out = vec![];
    walk_stack(stack, kind, WalkOrder::NewestFirst, &mut |f: &FrameRef| {
        out.push(f.clone());
        true
    });
    out
}

/// Number of frames a walk of `kind` reports.
pub fn count_frames(stack: &ManagedStack, kind: WalkKind) -> usize {
    let mut n = 0;
    walk_stack(stack, kind, WalkOrder::NewestFirst, &mut |_: &FrameRef| {
        n += 1;
        true
    });
    n
}
