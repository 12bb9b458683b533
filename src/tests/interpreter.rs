use std::sync::Arc;

use parking_lot::Mutex;

use crate::dex::builder::{CodeSpec, DexBuilder, RefSpec};
use crate::dex::dex_file::{ACC_NATIVE, ACC_STATIC};
use crate::interpreter::execute;
use crate::runtime::class_linker::{ClassLinker, ClassTable, LoadedDex, WellKnownClass};
use crate::runtime::object::{JValue, ObjRef};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::thread::{default_stack_spec, Thread};
use crate::runtime::thread_state::ThreadState;
use crate::runtime::Runtime;
use crate::stack::method::Method;
use crate::tests::{load, runnable_thread, test_runtime_with};

const CALC: &str = "Lapp/Calc;";

fn program() -> DexBuilder {
    let mut b = DexBuilder::new(35);
    let base = b.add_class("Lapp/Base;", Some("Ljava/lang/Object;"));
    b.add_method(base, "speak", "I", &[], 0, Some(CodeSpec::new(2, 1, vec![0x1012, 0x000f])));
    let derived = b.add_class("Lapp/Derived;", Some("Lapp/Base;"));
    b.add_method(derived, "speak", "I", &[], 0, Some(CodeSpec::new(2, 1, vec![0x2012, 0x000f])));
    let calc = b.add_class(CALC, Some("Ljava/lang/Object;"));
    let mut calc_method = |name: &str, ret: &str, params: &[&str], code: CodeSpec| {
        b.add_method(calc, name, ret, params, ACC_STATIC, Some(code));
    };

    // for (i = 0; i < n; i++) acc += i
    calc_method("sum", "I", &["I"], CodeSpec::new(3, 1, vec![
        0x0012, // const/4 v0, 0
        0x0112, // const/4 v1, 0
        0x2135, 0x0006, // if-ge v1, v2, +6
        0x10b0, // add-int/2addr v0, v1
        0x01d8, 0x0101, // add-int/lit8 v1, v1, 1
        0xfb28, // goto -5
        0x000f, // return v0
    ]));

    // keys 10 and 11 map to 100 and 200, anything else to -1
    calc_method("pick", "I", &["I"], CodeSpec::new(2, 1, vec![
        0x012b, 0x000c, 0x0000, // packed-switch v1, +12
        0xf012, // const/4 v0, -1
        0x000f,
        0x0013, 0x0064, // const/16 v0, 100
        0x000f,
        0x0013, 0x00c8, // const/16 v0, 200
        0x000f,
        0x0000,
        0x0100, 0x0002, 0x000a, 0x0000, 0x0005, 0x0000, 0x0008, 0x0000,
    ]));

    calc_method("sparse", "I", &["I"], CodeSpec::new(2, 1, vec![
        0x012c, 0x000a, 0x0000, // sparse-switch v1, +10
        0x0012, 0x000f, // return 0
        0x1012, 0x000f, // return 1
        0x2012, 0x000f, // return 2
        0x0000,
        0x0200, 0x0002, 0xfffb, 0xffff, 0x03e8, 0x0000, 0x0005, 0x0000, 0x0007, 0x0000,
    ]));

    calc_method(
        "safeDiv",
        "I",
        &["I", "I"],
        CodeSpec::new(3, 2, vec![
            0x0093, 0x0201, // div-int v0, v1, v2
            0x000f,
            0x000d, // move-exception v0
            0xf012, // const/4 v0, -1
            0x000f,
        ])
        .try_region(0, 2, &[(Some("Ljava/lang/ArithmeticException;"), 3)]),
    );
    calc_method("rawDiv", "I", &["I", "I"], CodeSpec::new(3, 2, vec![0x0093, 0x0201, 0x000f]));

    calc_method(
        "throwCatch",
        "I",
        &[],
        CodeSpec::new(2, 0, vec![
            0x0022, 0x0000, // new-instance v0, IOException
            0x0027, // throw v0
            0x010d, // move-exception v1
            0x7012, // const/4 v0, 7
            0x000f,
        ])
        .reference(1, RefSpec::Type("Ljava/io/IOException;".to_string()))
        .try_region(0, 3, &[(Some("Ljava/lang/Exception;"), 3)]),
    );
    calc_method(
        "throwIo",
        "V",
        &[],
        CodeSpec::new(1, 0, vec![0x0022, 0x0000, 0x0027]).reference(1, RefSpec::Type("Ljava/io/IOException;".to_string())),
    );
    calc_method(
        "callsThrower",
        "I",
        &[],
        CodeSpec::new(2, 0, vec![
            0x0071, 0x0000, 0x0000, // invoke-static {}, throwIo()V
            0x0012, 0x000f, // return 0
            0x010d, // move-exception v1
            0x3012, 0x000f, // return 3
        ])
        .reference(1, RefSpec::method(CALC, "throwIo", "V", &[]))
        .try_region(0, 3, &[(Some("Ljava/io/IOException;"), 5)]),
    );

    calc_method("locked", "I", &["Ljava/lang/Object;"], CodeSpec::new(2, 1, vec![
        0x011d, // monitor-enter v1
        0x011e, // monitor-exit v1
        0x1012, 0x000f,
    ]));
    calc_method("leaksLock", "I", &["Ljava/lang/Object;"], CodeSpec::new(2, 1, vec![0x011d, 0x1012, 0x000f]));
    calc_method("exitsUnowned", "I", &["Ljava/lang/Object;"], CodeSpec::new(2, 1, vec![0x011e, 0x1012, 0x000f]));

    calc_method(
        "callNative",
        "I",
        &["I"],
        CodeSpec::new(2, 1, vec![0x1071, 0x0000, 0x0001, 0x000a, 0x000f])
            .outs(1)
            .reference(1, RefSpec::method("Lapp/Host;", "twice", "I", &["I"])),
    );

    for (name, class) in [("dispatchDerived", "Lapp/Derived;"), ("dispatchBase", "Lapp/Base;")] {
        calc_method(
            name,
            "I",
            &[],
            CodeSpec::new(2, 0, vec![
                0x0122, 0x0000, // new-instance v1
                0x106e, 0x0000, 0x0001, // invoke-virtual {v1}, Base.speak()I
                0x000a, 0x000f,
            ])
            .outs(1)
            .reference(1, RefSpec::Type(class.to_string()))
            .reference(3, RefSpec::method("Lapp/Base;", "speak", "I", &[])),
        );
    }

    calc_method(
        "greeting",
        "Ljava/lang/String;",
        &[],
        CodeSpec::new(1, 0, vec![0x001a, 0x0000, 0x0011]).reference(1, RefSpec::String("hello".to_string())),
    );

    calc_method(
        "rec",
        "I",
        &["I"],
        CodeSpec::new(2, 1, vec![0x1071, 0x0000, 0x0001, 0x000a, 0x000f])
            .outs(1)
            .reference(1, RefSpec::method(CALC, "rec", "I", &["I"])),
    );
    calc_method(
        "guarded",
        "I",
        &[],
        CodeSpec::new(2, 0, vec![
            0x0012, // const/4 v0, 0
            0x1071, 0x0000, 0x0000, // invoke-static {v0}, rec(I)I
            0x000a, 0x000f,
            0x010d, // move-exception v1
            0xe012, 0x000f, // return -2
        ])
        .outs(1)
        .reference(2, RefSpec::method(CALC, "rec", "I", &["I"]))
        .try_region(1, 3, &[(Some("Ljava/lang/StackOverflowError;"), 6)]),
    );
    b
}

struct Vm {
    rt: Arc<Runtime>,
    classes: Arc<ClassTable>,
    loaded: LoadedDex,
}

impl Vm {
    fn new() -> Vm {
        let (rt, classes) = test_runtime_with(RuntimeOptions::default());
        let loaded = load(&classes, &program());
        Vm { rt, classes, loaded }
    }

    fn call(&self, t: &Thread, name: &str, args: &[JValue]) -> JValue {
        let m = self.loaded.method(name).unwrap_or_else(|| panic!("no method {}", name));
        execute(t, m, args).unwrap()
    }

    fn int(&self, t: &Thread, name: &str, args: &[i32]) -> i32 {
        let args: Vec<JValue> = args.iter().map(|a| JValue::from_int(*a)).collect();
        self.call(t, name, &args).as_int()
    }

    fn pending_class(&self, t: &Thread) -> Option<String> {
        let e = t.exception()?;
        self.rt.class_of(e).and_then(|c| self.classes.descriptor(c))
    }
}

#[test]
fn loops_and_switches() {
    let vm = Vm::new();
    let t = runnable_thread(&vm.rt, "calc");
    assert_eq!(vm.int(&t, "sum", &[5]), 10);
    assert_eq!(vm.int(&t, "sum", &[100]), 4950);
    assert_eq!(vm.int(&t, "sum", &[0]), 0);

    assert_eq!(vm.int(&t, "pick", &[10]), 100);
    assert_eq!(vm.int(&t, "pick", &[11]), 200);
    assert_eq!(vm.int(&t, "pick", &[9]), -1);
    assert_eq!(vm.int(&t, "pick", &[12]), -1);

    assert_eq!(vm.int(&t, "sparse", &[-5]), 1);
    assert_eq!(vm.int(&t, "sparse", &[1000]), 2);
    assert_eq!(vm.int(&t, "sparse", &[3]), 0);
    assert!(!t.is_exception_pending());
    assert_eq!(t.stack().depth(), 0);
    t.detach();
}

#[test]
fn division_by_zero_raises_arithmetic_exception() {
    let vm = Vm::new();
    let t = runnable_thread(&vm.rt, "calc");
    assert_eq!(vm.int(&t, "safeDiv", &[7, 2]), 3);
    assert_eq!(vm.int(&t, "safeDiv", &[7, 0]), -1);
    assert!(!t.is_exception_pending());

    assert_eq!(vm.int(&t, "rawDiv", &[7, 0]), 0);
    assert_eq!(vm.pending_class(&t).as_deref(), Some("Ljava/lang/ArithmeticException;"));
    assert_eq!(t.stack().depth(), 0);
    t.clear_exception();
    t.detach();
}

#[test]
fn thrown_objects_reach_their_handlers() {
    let vm = Vm::new();
    let t = runnable_thread(&vm.rt, "calc");
    assert_eq!(vm.int(&t, "throwCatch", &[]), 7);
    assert!(!t.is_exception_pending());
    // Thrown in the callee, caught by the caller.
    assert_eq!(vm.int(&t, "callsThrower", &[]), 3);
    assert!(!t.is_exception_pending());

    vm.call(&t, "throwIo", &[]);
    assert_eq!(vm.pending_class(&t).as_deref(), Some("Ljava/io/IOException;"));
    t.clear_exception();
    t.detach();
}

#[test]
fn monitors_must_balance() {
    let vm = Vm::new();
    let t = runnable_thread(&vm.rt, "calc");
    let lock = JValue::from_ref(Some(vm.rt.intern("lock").unwrap()));

    assert_eq!(vm.call(&t, "locked", &[lock]).as_int(), 1);
    assert!(!t.is_exception_pending());

    for name in ["leaksLock", "exitsUnowned"] {
        assert_eq!(vm.call(&t, name, &[lock]).as_int(), 0, "{}", name);
        assert_eq!(vm.pending_class(&t).as_deref(), Some("Ljava/lang/IllegalMonitorStateException;"), "{}", name);
        t.clear_exception();
    }

    vm.call(&t, "locked", &[JValue::from_ref(None)]);
    assert_eq!(vm.pending_class(&t).as_deref(), Some("Ljava/lang/NullPointerException;"));
    t.clear_exception();
    t.detach();
}

#[test]
fn native_methods_run_in_native_state() {
    let vm = Vm::new();
    let host = vm.classes.define_class("Lapp/Host;", Some("Ljava/lang/Object;"));
    let seen: Arc<Mutex<Vec<(ThreadState, usize)>>> = Arc::default();
    let record = seen.clone();
    vm.classes.register_method(Method::new(host, "Lapp/Host;", "twice", "(I)I", ACC_STATIC | ACC_NATIVE).with_native(Arc::new(
        move |t: &Thread, args: &[JValue]| {
            record.lock().push((t.state(), t.stack().depth()));
            JValue::from_int(args[0].as_int() * 2)
        },
    )));

    let t = runnable_thread(&vm.rt, "calc");
    assert_eq!(vm.int(&t, "callNative", &[21]), 42);
    // The caller's frame plus the native frame.
    assert_eq!(*seen.lock(), vec![(ThreadState::Native, 2)]);
    assert_eq!(t.state(), ThreadState::Runnable);
    assert_eq!(t.stack().depth(), 0);
    t.detach();
}

#[test]
fn invoke_virtual_dispatches_on_the_receiver() {
    let vm = Vm::new();
    let t = runnable_thread(&vm.rt, "calc");
    assert_eq!(vm.int(&t, "dispatchDerived", &[]), 2);
    assert_eq!(vm.int(&t, "dispatchBase", &[]), 1);
    t.detach();
}

#[test]
fn const_string_is_cached_until_swept() {
    let vm = Vm::new();
    let t = runnable_thread(&vm.rt, "calc");
    let hello: ObjRef = vm.rt.intern("hello").unwrap();

    assert_eq!(vm.call(&t, "greeting", &[]).as_ref(), Some(hello));
    assert_eq!(vm.call(&t, "greeting", &[]).as_ref(), Some(hello));
    assert_eq!(t.interpreter_cache().hit_rate(), (1, 1));

    assert_eq!(vm.rt.sweep_interpreter_cache(|_| None), 1);
    assert!(t.interpreter_cache().is_empty());
    assert_eq!(vm.call(&t, "greeting", &[]).as_ref(), Some(hello));
    assert_eq!(t.interpreter_cache().hit_rate(), (1, 2));
    t.detach();
}

#[test]
fn deep_recursion_overflows_into_a_handler() {
    let vm = Vm::new();
    let t = Thread::attach(&vm.rt, "small", default_stack_spec(32 * 1024), false).unwrap();
    t.transition_from_suspended_to_runnable();

    for _ in 0..2 {
        assert_eq!(vm.int(&t, "guarded", &[]), -2);
        assert!(!t.is_exception_pending());
        assert!(!t.stack_guard().is_reserved_open());
    }

    vm.int(&t, "rec", &[0]);
    assert_eq!(t.exception(), Some(vm.rt.pre_allocated_soe()));
    assert!(t.stack_guard().is_reserved_open());
    assert_eq!(t.stack().depth(), 0);
    t.clear_exception();
    t.reset_stack_overflow();
    assert!(!t.stack_guard().is_reserved_open());
    assert_eq!(
        vm.rt.class_of(vm.rt.pre_allocated_soe()),
        Some(vm.classes.well_known(WellKnownClass::StackOverflowError))
    );
    t.detach();
}
