use crate::dex::builder::{CodeSpec, DexBuilder};
use crate::dex::catch_table::catch_handlers;
use crate::dex::code_item::{CatchSpec, MethodCode};
use crate::dex::dex_file::ACC_STATIC;
use crate::exception::find_catch;
use crate::runtime::class_linker::{ClassLinker, WellKnownClass};
use crate::runtime::options::RuntimeOptions;
use crate::tests::{load, runnable_thread, test_runtime_with};

const IOE: u32 = 1;
const EXC: u32 = 2;

fn types_at(code: &MethodCode, pc: u32) -> Vec<Option<u32>> {
    catch_handlers(code, pc).map(|h| h.type_idx).collect()
}

#[test]
fn handlers_follow_the_innermost_covering_try() {
    let h = |t, a| CatchSpec { type_idx: Some(t), address: a };
    let code = MethodCode::new(1, 0, vec![0; 32]).with_tries(&[
        (0, 8, vec![h(IOE, 20), h(EXC, 24)]),
        (6, 4, vec![h(IOE, 28)]),
    ]);

    assert_eq!(types_at(&code, 4), vec![Some(IOE), Some(EXC)]);
    assert_eq!(types_at(&code, 8), vec![Some(IOE)]);
    assert_eq!(catch_handlers(&code, 8).next().map(|h| h.address), Some(28));
    assert!(types_at(&code, 11).is_empty());
}

fn thrower() -> DexBuilder {
    let mut b = DexBuilder::new(35);
    let cls = b.add_class("Lapp/Io;", Some("Ljava/lang/Object;"));
    let mut insns = vec![0x0000; 19];
    insns.push(0x000e);
    let code = CodeSpec::new(1, 0, insns)
        .try_region(0, 6, &[(Some("Ljava/io/IOException;"), 10), (Some("Ljava/lang/Exception;"), 12)])
        .try_region(6, 4, &[(Some("Ljava/io/IOException;"), 14)])
        .try_region(10, 2, &[(Some("Lapp/Missing;"), 16), (None, 18)]);
    b.add_method(cls, "f", "V", &[], ACC_STATIC, Some(code));
    b
}

#[test]
fn runtime_lookup_matches_subclasses() {
    let (rt, classes) = test_runtime_with(RuntimeOptions::default());
    let loaded = load(&classes, &thrower());
    let f = loaded.method("f").unwrap();
    let t = runnable_thread(&rt, "catcher");
    let class = |k| classes.well_known(k);

    assert_eq!(find_catch(&t, f, 4, class(WellKnownClass::IoException)), Some(10));
    // ArithmeticException reaches Exception through RuntimeException.
    assert_eq!(find_catch(&t, f, 4, class(WellKnownClass::ArithmeticException)), Some(12));
    assert_eq!(find_catch(&t, f, 4, class(WellKnownClass::StackOverflowError)), None);
    assert_eq!(find_catch(&t, f, 8, class(WellKnownClass::IoException)), Some(14));
    assert_eq!(find_catch(&t, f, 8, class(WellKnownClass::NullPointerException)), None);
    assert_eq!(find_catch(&t, f, 19, class(WellKnownClass::Throwable)), None);
    t.detach();
}

#[test]
fn unresolvable_catch_types_never_match() {
    let (rt, classes) = test_runtime_with(RuntimeOptions::default());
    let loaded = load(&classes, &thrower());
    let f = loaded.method("f").unwrap();
    let t = runnable_thread(&rt, "catcher");
    assert!(classes.find_class("Lapp/Missing;").is_none());
    // The typed handler is skipped; the catch-all still applies.
    assert_eq!(find_catch(&t, f, 10, classes.well_known(WellKnownClass::IoException)), Some(18));
    t.detach();
}
