/* Enumerating a thread's roots for a collector, rewriting any it relocates */

use log::trace;
use parking_lot::Mutex;

use crate::runtime::object::{ObjRef, RefSlot};
use crate::runtime::thread::Thread;
use crate::stack::method::Method;
use crate::stack::shadow_frame::ShadowFrameId;
use crate::stack::walker::stack_map_at;
use crate::stack::{Frame, ManagedStack};

/// Reported instead of a dex register when roots are visited imprecisely.
pub const IMPRECISE_VREG: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    ThreadObject,
    PendingException,
    AsyncException,
    MonitorWait,
    JniLocal,
    JniMonitor,
    HandleScope,
    JavaFrame,
    FrameLock,
    DeclaringClass,
    JniTransition,
    DeoptContext,
    StackedShadowFrame,
    DebuggerFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    pub kind: RootKind,
    pub thread_id: u32,
    /// Dex register holding the root, or `IMPRECISE_VREG`.
    pub vreg: i32,
}

/// Called once per root; returning `Some` rewrites the slot in place.
pub trait RootVisitor {
    fn visit_root(&mut self, obj: ObjRef, info: &RootInfo) -> Option<ObjRef>;
}

impl<F> RootVisitor for F
where
    F: FnMut(ObjRef, &RootInfo) -> Option<ObjRef>,
{
    fn visit_root(&mut self, obj: ObjRef, info: &RootInfo) -> Option<ObjRef> {
        self(obj, info)
    }
}

struct Visit<'v, V: RootVisitor + ?Sized> {
    visitor: &'v mut V,
    thread_id: u32,
    precise: bool,
    count: usize,
}

impl<V: RootVisitor + ?Sized> Visit<'_, V> {
    fn info(&self, kind: RootKind, vreg: i32) -> RootInfo {
        RootInfo { kind, thread_id: self.thread_id, vreg: if self.precise { vreg } else { IMPRECISE_VREG } }
    }

    fn raw(&mut self, raw: &mut u32, kind: RootKind, vreg: i32) {
        if let Some(obj) = ObjRef::from_raw(*raw) {
            self.count += 1;
            let info = self.info(kind, vreg);
            if let Some(new) = self.visitor.visit_root(obj, &info) {
                *raw = new.raw();
            }
        }
    }

    fn slot(&mut self, slot: &RefSlot, kind: RootKind) {
        if let Some(obj) = slot.get() {
            self.count += 1;
            let info = self.info(kind, IMPRECISE_VREG);
            if let Some(new) = self.visitor.visit_root(obj, &info) {
                slot.set(Some(new));
            }
        }
    }

    fn table(&mut self, table: &Mutex<Vec<u32>>, kind: RootKind) {
        for raw in table.lock().iter_mut() {
            self.raw(raw, kind, IMPRECISE_VREG);
        }
    }

    fn declaring_class(&mut self, method: &Method) {
        self.slot(method.declaring_class_root(), RootKind::DeclaringClass);
    }

    fn shadow_frame(&mut self, stack: &mut ManagedStack, id: ShadowFrameId, kind: RootKind) {
        let Some(frame) = stack.shadow_mut(id) else {
            return;
        };
        let method = frame.method.clone();
        let (thread_id, precise) = (self.thread_id, self.precise);
        let visitor = &mut *self.visitor;
        let mut count = 0;
        frame.visit_refs(|vreg, obj| {
            count += 1;
            let info = RootInfo { kind, thread_id, vreg: if precise { vreg as i32 } else { IMPRECISE_VREG } };
            visitor.visit_root(obj, &info)
        });
        self.count += count;
        for raw in frame.lock_count.iter_mut() {
            self.raw(raw, RootKind::FrameLock, IMPRECISE_VREG);
        }
        self.declaring_class(&method);
    }

    fn frames(&mut self, stack: &mut ManagedStack) {
        for index in 0..stack.depth() {
            let id = match stack.frame_mut(index) {
                Some(Frame::Shadow(id)) => *id,
                Some(Frame::Quick(q)) => {
                    let method = q.method.clone();
                    if method.is_runtime_method() {
                        continue;
                    }
                    if method.is_native() {
                        for off in q.native_reference_args() {
                            if let Some(mut raw) = q.read_u32(off) {
                                self.raw(&mut raw, RootKind::JniTransition, IMPRECISE_VREG);
                                q.write_u32(off, raw);
                            }
                        }
                    } else if let Some(map) = stack_map_at(&method, q.native_pc) {
                        let (thread_id, precise) = (self.thread_id, self.precise);
                        let visitor = &mut *self.visitor;
                        let mut count = 0;
                        q.visit_refs(map, |loc, obj| {
                            count += 1;
                            let vreg = match (precise, map.dex_register_at(loc)) {
                                (true, Some(r)) => r as i32,
                                _ => IMPRECISE_VREG,
                            };
                            visitor.visit_root(obj, &RootInfo { kind: RootKind::JavaFrame, thread_id, vreg })
                        });
                        self.count += count;
                        if let Some(compiled) = method.compiled() {
                            for info in &map.inline_infos {
                                if let Some(m) = compiled.inlined_methods.get(info.method_index as usize) {
                                    self.declaring_class(m);
                                }
                            }
                        }
                    }
                    self.declaring_class(&method);
                    continue;
                }
                None => continue,
            };
            self.shadow_frame(stack, id, RootKind::JavaFrame);
        }
    }

    fn deoptimization_records(&mut self, stack: &mut ManagedStack) {
        for i in 0..stack.deoptimization_contexts().len() {
            let mut record = stack.deoptimization_contexts()[i];
            if record.return_is_reference {
                let mut raw = record.return_value.0 as u32;
                self.raw(&mut raw, RootKind::DeoptContext, IMPRECISE_VREG);
                record.return_value.0 = raw as u64;
            }
            let mut raw = record.pending_exception.map_or(0, ObjRef::raw);
            self.raw(&mut raw, RootKind::DeoptContext, IMPRECISE_VREG);
            record.pending_exception = ObjRef::from_raw(raw);
            stack.deoptimization_contexts_mut()[i] = record;
        }

        let tops: Vec<ShadowFrameId> = stack.stacked_shadow_frames().iter().map(|r| r.top).collect();
        for top in tops {
            for id in stack.arena().chain(top) {
                self.shadow_frame(stack, id, RootKind::StackedShadowFrame);
            }
        }

        let debugger: Vec<ShadowFrameId> = stack.debugger_frames().iter().map(|d| d.frame).collect();
        for id in debugger {
            self.shadow_frame(stack, id, RootKind::DebuggerFrame);
        }
    }
}

impl Thread {
    /// Report every root this thread holds. In imprecise mode every stack
    /// root carries `IMPRECISE_VREG`. The caller suspends the thread first.
    /// Returns the number of roots reported.
    pub fn visit_roots<V: RootVisitor + ?Sized>(&self, visitor: &mut V, precise: bool) -> usize {
        let mut v = Visit { visitor, thread_id: self.id(), precise, count: 0 };
        v.slot(&self.peer, RootKind::ThreadObject);
        v.slot(&self.tlsptr.exception, RootKind::PendingException);
        v.slot(&self.async_exception, RootKind::AsyncException);
        v.slot(&self.wait_monitor, RootKind::MonitorWait);
        v.table(&self.jni_locals, RootKind::JniLocal);
        v.table(&self.jni_monitors, RootKind::JniMonitor);
        for scope in self.handle_scopes.lock().iter_mut() {
            for raw in scope.refs.iter_mut() {
                v.raw(raw, RootKind::HandleScope, IMPRECISE_VREG);
            }
        }
        {
            let mut stack = self.stack();
            v.frames(&mut stack);
            v.deoptimization_records(&mut stack);
        }
        trace!("thread {} reported {} roots", self.id(), v.count);
        v.count
    }
}
