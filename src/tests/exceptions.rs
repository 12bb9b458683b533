use std::sync::Arc;

use parking_lot::Mutex;

use crate::dex::builder::{CodeSpec, DexBuilder};
use crate::dex::dex_file::ACC_STATIC;
use crate::exception::{deliver_exception, DeoptimizationKind, LongJumpContext};
use crate::runtime::class_linker::WellKnownClass;
use crate::runtime::entrypoints;
use crate::runtime::error::RuntimeError;
use crate::runtime::object::{ClassId, ObjRef};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::thread::Thread;
use crate::runtime::Runtime;
use crate::stack::method::{CompiledCode, Method};
use crate::stack::quick_frame::QuickFrame;
use crate::stack::shadow_frame::ShadowFrame;
use crate::stack::stack_map::{CodeInfo, DexRegisterLocation, InlineInfo, StackMap, StackMapKind};
use crate::stack::Frame;
use crate::tests::{load, runnable_thread, test_runtime_with};

const HANDLER: u32 = 4;
const THROW_SITE: u32 = 0x20;
const CATCH_ENTRY: u32 = 0x80;

struct Fixture {
    rt: Arc<Runtime>,
    thread: Arc<Thread>,
    catcher: Arc<Method>,
    thrower: Arc<Method>,
    outer: Arc<Method>,
}

fn fixture(options: RuntimeOptions) -> Fixture {
    let mut b = DexBuilder::new(35);
    let cls = b.add_class("Lapp/Ex;", Some("Ljava/lang/Object;"));
    let catcher = CodeSpec::new(2, 0, vec![0x0000, 0x0000, 0x0000, 0x0000, 0x000d, 0x000e])
        .try_region(0, 4, &[(Some("Ljava/io/IOException;"), HANDLER)]);
    b.add_method(cls, "catcher", "V", &[], ACC_STATIC, Some(catcher));
    b.add_method(cls, "thrower", "V", &[], ACC_STATIC, Some(CodeSpec::new(1, 0, vec![0x0000, 0x000e])));
    b.add_method(cls, "outer", "V", &[], ACC_STATIC, Some(CodeSpec::new(1, 0, vec![0x0000, 0x0000, 0x000e])));

    let (rt, classes) = test_runtime_with(options);
    let loaded = load(&classes, &b);
    let thread = runnable_thread(&rt, "thrower");
    Fixture {
        rt,
        thread,
        catcher: loaded.method("catcher").unwrap().clone(),
        thrower: loaded.method("thrower").unwrap().clone(),
        outer: loaded.method("outer").unwrap().clone(),
    }
}

fn push_interpreted(t: &Thread, m: &Arc<Method>, dex_pc: u32) {
    let mut stack = t.stack();
    let mut f = ShadowFrame::new(m.clone(), m.code().unwrap().registers_size as usize);
    f.dex_pc = dex_pc;
    stack.push_shadow(f);
    t.publish_stack_top(&stack);
}

/// `catcher` compiled with a throwing safepoint at dex pc 2 and a catch map
/// for its handler that keeps the two vregs in swapped places.
fn compile_catcher(m: &Method, deoptimizable: bool) {
    let throw_map = StackMap {
        native_pc: THROW_SITE,
        dex_pc: 2,
        dex_registers: vec![DexRegisterLocation::InStack(0), DexRegisterLocation::InRegister(1)],
        ..Default::default()
    };
    let catch_map = StackMap {
        native_pc: CATCH_ENTRY,
        dex_pc: HANDLER,
        kind: StackMapKind::Catch,
        dex_registers: vec![DexRegisterLocation::InStack(4), DexRegisterLocation::InStack(0)],
        ..Default::default()
    };
    let compiled = CompiledCode {
        code_info: CodeInfo { frame_size: 8, stack_maps: vec![throw_map, catch_map], ..Default::default() },
        inlined_methods: vec![],
        deoptimizable,
    };
    assert!(m.install_compiled(compiled));
}

/// `catcher` compiled with a callee inlined at its throwing safepoint. The
/// callee has no code item, so the frame can never be rebuilt for the
/// interpreter even though it claims to be deoptimizable.
fn compile_catcher_around_codeless_callee(m: &Method, with_catch_map: bool) {
    let codeless = Arc::new(Method::new(ClassId(1), "Lapp/Ex;", "nocode", "()V", ACC_STATIC));
    let throw_map = StackMap {
        native_pc: THROW_SITE,
        dex_pc: 2,
        dex_registers: vec![DexRegisterLocation::InStack(0), DexRegisterLocation::InRegister(1)],
        inline_infos: vec![InlineInfo { method_index: 0, dex_pc: 0, dex_registers: vec![] }],
        ..Default::default()
    };
    let mut stack_maps = vec![throw_map];
    if with_catch_map {
        stack_maps.push(StackMap {
            native_pc: CATCH_ENTRY,
            dex_pc: HANDLER,
            kind: StackMapKind::Catch,
            dex_registers: vec![DexRegisterLocation::InStack(4), DexRegisterLocation::InStack(0)],
            ..Default::default()
        });
    }
    let compiled = CompiledCode {
        code_info: CodeInfo { frame_size: 8, stack_maps, ..Default::default() },
        inlined_methods: vec![codeless],
        deoptimizable: true,
    };
    assert!(m.install_compiled(compiled));
}

fn catcher_frame(m: &Arc<Method>) -> Frame {
    let mut q = QuickFrame::new(m.clone(), THROW_SITE, 8);
    q.write_u32(0, 7);
    q.registers[1] = 9;
    Frame::Quick(q)
}

fn throw_io(t: &Thread) -> ObjRef {
    t.throw_well_known(WellKnownClass::IoException);
    t.exception().unwrap()
}

#[test]
fn interpreter_handler_receives_control() {
    let f = fixture(RuntimeOptions::default());
    let t = &f.thread;
    push_interpreted(t, &f.catcher, 2);
    push_interpreted(t, &f.thrower, 0);
    let e = throw_io(t);

    let ctx = entrypoints::deliver_exception(t).unwrap();
    assert_eq!(ctx, LongJumpContext::Interpreter { stack_index: 0, dex_pc: HANDLER });
    assert_eq!(t.stack().depth(), 1);
    let top = t.stack().top_shadow().unwrap();
    assert_eq!(t.stack().shadow(top).unwrap().dex_pc, HANDLER);
    // Left pending for move-exception.
    assert_eq!(t.exception(), Some(e));
    t.clear_exception();
    t.detach();
}

#[test]
fn exceptions_outside_the_try_range_keep_unwinding() {
    let f = fixture(RuntimeOptions::default());
    let t = &f.thread;
    let seen = Arc::new(Mutex::new(vec![]));
    let record = seen.clone();
    f.rt.set_uncaught_exception_handler(Arc::new(move |_: &Thread, e: ObjRef| record.lock().push(e)));

    push_interpreted(t, &f.catcher, HANDLER);
    push_interpreted(t, &f.thrower, 0);
    let e = throw_io(t);
    match deliver_exception(t) {
        Err(RuntimeError::UnhandledException { thread_id, .. }) => assert_eq!(thread_id, t.id()),
        other => panic!("expected an unhandled exception, got {:?}", other),
    }
    assert_eq!(t.stack().depth(), 0);
    assert_eq!(*seen.lock(), vec![e]);
    assert!(!t.is_exception_pending());
    t.detach();
}

#[test]
fn compiled_handler_gets_the_catch_environment() {
    let f = fixture(RuntimeOptions::default());
    let t = &f.thread;
    compile_catcher(&f.catcher, false);
    t.push_frame(catcher_frame(&f.catcher));
    push_interpreted(t, &f.thrower, 0);
    throw_io(t);

    let ctx = deliver_exception(t).unwrap();
    let LongJumpContext::Compiled { stack_index, native_pc, .. } = ctx else {
        panic!("expected a compiled handler, got {:?}", ctx);
    };
    assert_eq!((stack_index, native_pc), (0, CATCH_ENTRY));
    let stack = t.stack();
    assert_eq!(stack.depth(), 1);
    let Some(Frame::Quick(q)) = stack.frame(0) else { panic!("compiled frame replaced") };
    assert_eq!(q.native_pc, CATCH_ENTRY);
    assert_eq!(q.read_u32(4), Some(7));
    assert_eq!(q.read_u32(0), Some(9));
    drop(stack);
    assert_eq!(f.rt.deoptimization_stats().total(), 0);
    t.clear_exception();
    t.detach();
}

#[test]
fn forced_interpretation_deoptimizes_the_catching_frame() {
    let f = fixture(RuntimeOptions { force_interpret_on_exception: true, ..Default::default() });
    let t = &f.thread;
    compile_catcher(&f.catcher, true);
    t.push_frame(catcher_frame(&f.catcher));
    push_interpreted(t, &f.thrower, 0);
    throw_io(t);

    let ctx = deliver_exception(t).unwrap();
    assert_eq!(ctx, LongJumpContext::Interpreter { stack_index: 0, dex_pc: HANDLER });
    let stack = t.stack();
    assert_eq!(stack.depth(), 1);
    let Some(Frame::Shadow(id)) = stack.frame(0) else { panic!("frame not deoptimized") };
    let frame = stack.shadow(*id).unwrap();
    assert_eq!((frame.vreg(0), frame.vreg(1)), (7, 9));
    drop(stack);
    assert_eq!(f.rt.deoptimization_stats().count(DeoptimizationKind::Exception), 1);
    t.clear_exception();
    t.detach();
}

#[test]
fn handler_in_an_inlined_frame_runs_interpreted() {
    let f = fixture(RuntimeOptions::default());
    let t = &f.thread;
    let map = StackMap {
        native_pc: THROW_SITE,
        dex_pc: 1,
        dex_registers: vec![DexRegisterLocation::Constant(1)],
        inline_infos: vec![InlineInfo {
            method_index: 0,
            dex_pc: 2,
            dex_registers: vec![DexRegisterLocation::Constant(3), DexRegisterLocation::None],
        }],
        ..Default::default()
    };
    let compiled = CompiledCode {
        code_info: CodeInfo { frame_size: 0, stack_maps: vec![map], ..Default::default() },
        inlined_methods: vec![f.catcher.clone()],
        deoptimizable: true,
    };
    assert!(f.outer.install_compiled(compiled));
    t.push_frame(Frame::Quick(QuickFrame::new(f.outer.clone(), THROW_SITE, 0)));
    throw_io(t);

    let ctx = deliver_exception(t).unwrap();
    assert_eq!(ctx, LongJumpContext::Interpreter { stack_index: 1, dex_pc: HANDLER });
    let stack = t.stack();
    assert_eq!(stack.depth(), 2);
    let Some(Frame::Shadow(inner)) = stack.frame(1) else { panic!("inlined frame not materialized") };
    let inner = stack.shadow(*inner).unwrap();
    assert_eq!(inner.method.name(), "catcher");
    assert_eq!(inner.vreg(0), 3);
    let Some(Frame::Shadow(outer)) = stack.frame(0) else { panic!("outer frame not materialized") };
    assert!(stack.shadow(*outer).unwrap().resume_after_invoke);
    drop(stack);
    t.clear_exception();
    t.detach();
}

#[test]
fn frames_that_cannot_deoptimize_are_skipped() {
    let f = fixture(RuntimeOptions { force_interpret_on_exception: true, ..Default::default() });
    let t = &f.thread;
    // No catch map and not deoptimizable: the handler is unreachable.
    let map = StackMap { native_pc: THROW_SITE, dex_pc: 2, ..Default::default() };
    let compiled = CompiledCode {
        code_info: CodeInfo { frame_size: 0, stack_maps: vec![map], ..Default::default() },
        inlined_methods: vec![],
        deoptimizable: false,
    };
    assert!(f.catcher.install_compiled(compiled));
    push_interpreted(t, &f.catcher, 1);
    t.push_frame(Frame::Quick(QuickFrame::new(f.catcher.clone(), THROW_SITE, 0)));
    throw_io(t);

    // The interpreted activation below still catches.
    let ctx = deliver_exception(t).unwrap();
    assert_eq!(ctx, LongJumpContext::Interpreter { stack_index: 0, dex_pc: HANDLER });
    assert_eq!(t.stack().depth(), 1);
    t.clear_exception();
    t.detach();
}

#[test]
fn failed_deoptimization_keeps_searching_older_frames() {
    let f = fixture(RuntimeOptions::default());
    let t = &f.thread;
    compile_catcher_around_codeless_callee(&f.catcher, false);
    push_interpreted(t, &f.catcher, 2);
    t.push_frame(catcher_frame(&f.catcher));
    let e = throw_io(t);

    let ctx = deliver_exception(t).unwrap();
    assert_eq!(ctx, LongJumpContext::Interpreter { stack_index: 0, dex_pc: HANDLER });
    assert_eq!(t.stack().depth(), 1);
    assert_eq!(t.exception(), Some(e));
    assert_eq!(f.rt.deoptimization_stats().total(), 0);
    t.clear_exception();
    t.detach();
}

#[test]
fn failed_deoptimization_falls_back_to_the_compiled_handler() {
    let f = fixture(RuntimeOptions { force_interpret_on_exception: true, ..Default::default() });
    let t = &f.thread;
    compile_catcher_around_codeless_callee(&f.catcher, true);
    t.push_frame(catcher_frame(&f.catcher));
    push_interpreted(t, &f.thrower, 0);
    let e = throw_io(t);

    let ctx = deliver_exception(t).unwrap();
    let LongJumpContext::Compiled { stack_index, native_pc, .. } = ctx else {
        panic!("expected the compiled handler, got {:?}", ctx);
    };
    assert_eq!((stack_index, native_pc), (0, CATCH_ENTRY));
    let stack = t.stack();
    assert_eq!(stack.depth(), 1);
    let Some(Frame::Quick(q)) = stack.frame(0) else { panic!("compiled frame replaced") };
    assert_eq!((q.read_u32(4), q.read_u32(0)), (Some(7), Some(9)));
    drop(stack);
    assert_eq!(t.exception(), Some(e));
    assert_eq!(f.rt.deoptimization_stats().count(DeoptimizationKind::Exception), 0);
    t.clear_exception();
    t.detach();
}
