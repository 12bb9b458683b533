use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dex::code_item::MethodCode;
use crate::dex::dex_file::{ACC_NATIVE, ACC_STATIC};
use crate::runtime::object::{ClassId, JValue, ObjRef};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::roots::{RootInfo, RootKind, IMPRECISE_VREG};
use crate::runtime::thread::Thread;
use crate::stack::method::{CompiledCode, Method};
use crate::stack::quick_frame::QuickFrame;
use crate::stack::shadow_frame::{DeoptimizationContextRecord, ShadowFrame, StackedShadowFrameType};
use crate::stack::stack_map::{CodeInfo, DexRegisterLocation, StackMap};
use crate::stack::Frame;
use crate::tests::{runnable_thread, test_runtime_with};

const MOVED: u32 = 0x10_0000;

fn obj(raw: u32) -> ObjRef {
    ObjRef::from_raw(raw).unwrap()
}

fn managed(name: &str, registers: u16) -> Arc<Method> {
    Arc::new(Method::new(ClassId(1), "Lapp/Roots;", name, "()V", ACC_STATIC).with_code(MethodCode::new(registers, 0, vec![0x000e])))
}

fn frame_with_ref(name: &str, vreg: usize, raw: u32) -> ShadowFrame {
    let mut f = ShadowFrame::new(managed(name, 3), 3);
    f.set_vreg_ref(vreg, Some(obj(raw)));
    f
}

/// Give `t` one root of every kind. Each raw value names its kind.
fn populate(t: &Thread) {
    t.set_peer(Some(obj(0x100)));
    t.set_exception(Some(obj(0x200)));
    t.set_async_exception(Some(obj(0x300)));
    t.set_wait_monitor(Some(obj(0x400)));
    t.add_jni_local(obj(0x500));
    t.jni_monitor_enter(obj(0x600));
    t.push_handle_scope(2);
    t.new_handle(Some(obj(0x700))).unwrap();

    let mut interpreted = frame_with_ref("interpreted", 2, 0x800);
    interpreted.set_vreg(0, 5);
    interpreted.lock_count.push(0x900);

    let map = StackMap {
        native_pc: 0x10,
        stack_mask: 1 << 1,
        register_mask: 1 << 3,
        dex_registers: vec![DexRegisterLocation::InStack(4), DexRegisterLocation::InRegister(3)],
        ..Default::default()
    };
    let compiled = Arc::new(Method::new(ClassId(1), "Lapp/Roots;", "compiled", "()V", ACC_STATIC).with_code(MethodCode::new(2, 0, vec![0x000e])).with_compiled(
        CompiledCode { code_info: CodeInfo { frame_size: 8, stack_maps: vec![map], ..Default::default() }, inlined_methods: vec![], deoptimizable: true },
    ));
    let mut quick = QuickFrame::new(compiled, 0x10, 8);
    quick.write_u32(4, 0xa00);
    quick.registers[3] = 0xb00;

    let native = Arc::new(Method::new(ClassId(1), "Lapp/Roots;", "hold", "(Ljava/lang/Object;I)V", ACC_STATIC | ACC_NATIVE));
    let mut transition = QuickFrame::new(native, 0, 8);
    transition.write_u32(0, 0x1100);
    transition.write_u32(4, 0x77);

    let mut stack = t.stack();
    stack.push_shadow(interpreted);
    stack.push(Frame::Quick(quick));
    stack.push(Frame::Quick(transition));
    stack.push_deoptimization_context(DeoptimizationContextRecord {
        return_value: JValue::from_ref(Some(obj(0xd00))),
        return_is_reference: true,
        pending_exception: Some(obj(0xc00)),
        from_return: true,
    });
    let stacked = stack.arena_mut().alloc(frame_with_ref("stacked", 0, 0xe00));
    stack.push_stacked_shadow_frame(stacked, StackedShadowFrameType::Deoptimization);
    stack.set_debugger_shadow_frame(0, frame_with_ref("debugged", 1, 0xf00));
    t.publish_stack_top(&stack);
}

fn collect(t: &Thread, precise: bool) -> (Vec<(u32, RootKind, i32)>, usize) {
    let mut seen = vec![];
    let n = t.visit_roots(
        &mut |o: ObjRef, info: &RootInfo| {
            seen.push((o.raw(), info.kind, info.vreg));
            None
        },
        precise,
    );
    seen.sort_by_key(|(raw, ..)| *raw);
    (seen, n)
}

#[test]
fn every_root_kind_is_reported() {
    let (rt, _) = test_runtime_with(RuntimeOptions::default());
    let t = runnable_thread(&rt, "roots");
    populate(&t);

    let (seen, n) = collect(&t, true);
    let expected = vec![
        (0x100, RootKind::ThreadObject, IMPRECISE_VREG),
        (0x200, RootKind::PendingException, IMPRECISE_VREG),
        (0x300, RootKind::AsyncException, IMPRECISE_VREG),
        (0x400, RootKind::MonitorWait, IMPRECISE_VREG),
        (0x500, RootKind::JniLocal, IMPRECISE_VREG),
        (0x600, RootKind::JniMonitor, IMPRECISE_VREG),
        (0x700, RootKind::HandleScope, IMPRECISE_VREG),
        (0x800, RootKind::JavaFrame, 2),
        (0x900, RootKind::FrameLock, IMPRECISE_VREG),
        (0xa00, RootKind::JavaFrame, 0),
        (0xb00, RootKind::JavaFrame, 1),
        (0xc00, RootKind::DeoptContext, IMPRECISE_VREG),
        (0xd00, RootKind::DeoptContext, IMPRECISE_VREG),
        (0xe00, RootKind::StackedShadowFrame, 0),
        (0xf00, RootKind::DebuggerFrame, 1),
        (0x1100, RootKind::JniTransition, IMPRECISE_VREG),
    ];
    assert_eq!(seen, expected);
    assert_eq!(n, expected.len());

    let (imprecise, _) = collect(&t, false);
    assert!(imprecise.iter().all(|(_, _, vreg)| *vreg == IMPRECISE_VREG));
    assert_eq!(imprecise.len(), expected.len());
    t.clear_exception();
    t.detach();
}

#[test]
fn relocated_roots_are_written_back() {
    let (rt, _) = test_runtime_with(RuntimeOptions::default());
    let t = runnable_thread(&rt, "roots");
    populate(&t);

    t.visit_roots(&mut |o: ObjRef, _: &RootInfo| ObjRef::from_raw(o.raw() | MOVED), true);
    let (seen, _) = collect(&t, true);
    assert!(seen.iter().all(|(raw, ..)| raw & MOVED != 0), "{:x?}", seen);

    assert_eq!(t.peer(), Some(obj(0x100 | MOVED)));
    assert_eq!(t.exception(), Some(obj(0x200 | MOVED)));
    assert_eq!(t.jni_local(0), Some(obj(0x500 | MOVED)));
    let stack = t.stack();
    let Some(Frame::Shadow(id)) = stack.frame(0) else { panic!("interpreter frame missing") };
    let interpreted = stack.shadow(*id).unwrap();
    assert_eq!(interpreted.vreg_ref(2), Some(obj(0x800 | MOVED)));
    assert_eq!(interpreted.vreg(0), 5);
    assert_eq!(interpreted.lock_count, vec![0x900 | MOVED]);
    let Some(Frame::Quick(q)) = stack.frame(1) else { panic!("compiled frame missing") };
    assert_eq!(q.read_u32(4), Some(0xa00 | MOVED));
    assert_eq!(q.registers[3], (0xb00 | MOVED) as u64);
    let Some(Frame::Quick(native)) = stack.frame(2) else { panic!("native frame missing") };
    assert_eq!(native.read_u32(0), Some(0x1100 | MOVED));
    // Not a reference argument.
    assert_eq!(native.read_u32(4), Some(0x77));
    let record = stack.deoptimization_contexts()[0];
    assert_eq!(record.pending_exception, Some(obj(0xc00 | MOVED)));
    assert_eq!(record.return_value.as_ref(), Some(obj(0xd00 | MOVED)));
    drop(stack);
    t.clear_exception();
    t.detach();
}

#[test]
fn runtime_visits_every_thread() {
    let (rt, _) = test_runtime_with(RuntimeOptions { precise_roots: false, ..Default::default() });
    let a = runnable_thread(&rt, "a");
    let b = runnable_thread(&rt, "b");
    a.set_peer(Some(obj(0x100)));
    b.set_peer(Some(obj(0x200)));
    b.add_jni_local(obj(0x300));
    {
        let mut stack = b.stack();
        stack.push_shadow(frame_with_ref("f", 1, 0x400));
        b.publish_stack_top(&stack);
    }

    let mut owners = vec![];
    let n = rt.for_each_thread_root(&mut |o: ObjRef, info: &RootInfo| {
        assert_eq!(info.vreg, IMPRECISE_VREG);
        owners.push((o.raw(), info.thread_id));
        None
    });
    assert_eq!(n, 4);
    owners.sort_unstable();
    assert_eq!(owners, vec![(0x100, a.id()), (0x200, b.id()), (0x300, b.id()), (0x400, b.id())]);
    a.detach();
    b.detach();
}

#[test]
fn flip_visits_roots_for_each_thread() {
    let (rt, _) = test_runtime_with(RuntimeOptions::default());
    let a = runnable_thread(&rt, "a");
    let b = runnable_thread(&rt, "b");
    a.set_peer(Some(obj(0x100)));
    b.set_peer(Some(obj(0x200)));
    // b is parked in native code; the flip runs on its behalf.
    b.transition_from_runnable_to_suspended(crate::runtime::thread_state::ThreadState::Native);

    let visited: Arc<Mutex<HashSet<u32>>> = Arc::default();
    let record = visited.clone();
    let n = rt.thread_flip(
        Arc::new(move |t: &Thread| {
            t.visit_roots(&mut |o: ObjRef, _: &RootInfo| ObjRef::from_raw(o.raw() | MOVED), true);
            record.lock().insert(t.id());
        }),
        Some(&a),
    );
    assert_eq!(n, 2);
    assert_eq!(*visited.lock(), [a.id(), b.id()].into_iter().collect());
    assert_eq!(a.peer(), Some(obj(0x100 | MOVED)));
    assert_eq!(b.peer(), Some(obj(0x200 | MOVED)));
    a.detach();
    b.detach();
}
