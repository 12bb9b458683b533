use once_cell::sync::Lazy;

use crate::bytecode::format::{Format, IndexKind, Opcode, OpcodeFlags};

const CONT: OpcodeFlags = OpcodeFlags::CONTINUE;
const THROW: OpcodeFlags = OpcodeFlags::THROW;
const REG: OpcodeFlags = OpcodeFlags::SETS_REGISTER;
const WIDE: OpcodeFlags = OpcodeFlags::SETS_REGISTER.union(OpcodeFlags::SETS_WIDE_REGISTER);
const RESOLVE: OpcodeFlags = OpcodeFlags::THROW.union(OpcodeFlags::WRITES_VERIFY_ERROR);
const INVOKE: OpcodeFlags = OpcodeFlags::CONTINUE
    .union(OpcodeFlags::THROW)
    .union(OpcodeFlags::INVOKE)
    .union(OpcodeFlags::SETS_RESULT)
    .union(OpcodeFlags::WRITES_VERIFY_ERROR);

const fn op(value: u8, name: &'static str, format: Format, index_kind: IndexKind, flags: OpcodeFlags) -> Opcode {
    Opcode::new(value, name, format, index_kind, flags)
}

const fn plain(value: u8, name: &'static str, format: Format, flags: OpcodeFlags) -> Opcode {
    Opcode::new(value, name, format, IndexKind::None, flags)
}

/// Names built at table construction are leaked once so descriptors stay `'static`.
fn leak(name: String) -> &'static str {
    Box::leak(name.into_boxed_str())
}

fn unused(value: u8) -> Opcode {
    Opcode::new(value, leak(format!("unused-{:02x}", value)), Format::Format10x, IndexKind::None, OpcodeFlags::UNUSED)
}

/// Unary ops 0x7b..=0x8f, with whether their result is wide.
const UNOPS: [(&str, bool); 21] = [
    ("neg-int", false), ("not-int", false), ("neg-long", true), ("not-long", true),
    ("neg-float", false), ("neg-double", true), ("int-to-long", true), ("int-to-float", false),
    ("int-to-double", true), ("long-to-int", false), ("long-to-float", false), ("long-to-double", true),
    ("float-to-int", false), ("float-to-long", true), ("float-to-double", true), ("double-to-int", false),
    ("double-to-long", true), ("double-to-float", false), ("int-to-byte", false), ("int-to-char", false),
    ("int-to-short", false),
];

/// Binary ops in encoding order, for both the 23x (0x90) and 2addr (0xb0) blocks.
const BINOPS: [&str; 32] = [
    "add-int", "sub-int", "mul-int", "div-int", "rem-int", "and-int", "or-int", "xor-int", "shl-int", "shr-int", "ushr-int",
    "add-long", "sub-long", "mul-long", "div-long", "rem-long", "and-long", "or-long", "xor-long", "shl-long", "shr-long", "ushr-long",
    "add-float", "sub-float", "mul-float", "div-float", "rem-float",
    "add-double", "sub-double", "mul-double", "div-double", "rem-double",
];

const BINOPS_2ADDR: [&str; 32] = [
    "add-int/2addr", "sub-int/2addr", "mul-int/2addr", "div-int/2addr", "rem-int/2addr", "and-int/2addr", "or-int/2addr",
    "xor-int/2addr", "shl-int/2addr", "shr-int/2addr", "ushr-int/2addr",
    "add-long/2addr", "sub-long/2addr", "mul-long/2addr", "div-long/2addr", "rem-long/2addr", "and-long/2addr", "or-long/2addr",
    "xor-long/2addr", "shl-long/2addr", "shr-long/2addr", "ushr-long/2addr",
    "add-float/2addr", "sub-float/2addr", "mul-float/2addr", "div-float/2addr", "rem-float/2addr",
    "add-double/2addr", "sub-double/2addr", "mul-double/2addr", "div-double/2addr", "rem-double/2addr",
];

const LIT16: [&str; 8] = [
    "add-int/lit16", "rsub-int", "mul-int/lit16", "div-int/lit16", "rem-int/lit16", "and-int/lit16", "or-int/lit16", "xor-int/lit16",
];

const LIT8: [&str; 11] = [
    "add-int/lit8", "rsub-int/lit8", "mul-int/lit8", "div-int/lit8", "rem-int/lit8", "and-int/lit8", "or-int/lit8",
    "xor-int/lit8", "shl-int/lit8", "shr-int/lit8", "ushr-int/lit8",
];

fn binop_flags(name: &str) -> OpcodeFlags {
    let wide = name.contains("-long") || name.contains("-double");
    let throws = name.starts_with("div-int") || name.starts_with("rem-int") || name.starts_with("div-long") || name.starts_with("rem-long");
    let mut flags = CONT | if wide { WIDE } else { REG };
    if throws {
        flags |= THROW;
    }
    flags
}

/// The descriptor table, indexed by opcode value.
pub static OPCODES: Lazy<Vec<Opcode>> = Lazy::new(|| {
    use Format::*;
    use IndexKind as K;

    let mut table: Vec<Opcode> = (0..=255u8).map(unused).collect();
    let fixed = [
        plain(0x00, "nop", Format10x, CONT),
        plain(0x01, "move", Format12x, CONT | REG),
        plain(0x02, "move/from16", Format22x, CONT | REG),
        plain(0x03, "move/16", Format32x, CONT | REG),
        plain(0x04, "move-wide", Format12x, CONT | WIDE),
        plain(0x05, "move-wide/from16", Format22x, CONT | WIDE),
        plain(0x06, "move-wide/16", Format32x, CONT | WIDE),
        plain(0x07, "move-object", Format12x, CONT | REG),
        plain(0x08, "move-object/from16", Format22x, CONT | REG),
        plain(0x09, "move-object/16", Format32x, CONT | REG),
        plain(0x0a, "move-result", Format11x, CONT | REG),
        plain(0x0b, "move-result-wide", Format11x, CONT | WIDE),
        plain(0x0c, "move-result-object", Format11x, CONT | REG),
        plain(0x0d, "move-exception", Format11x, CONT | REG),
        plain(0x0e, "return-void", Format10x, OpcodeFlags::RETURN),
        plain(0x0f, "return", Format11x, OpcodeFlags::RETURN),
        plain(0x10, "return-wide", Format11x, OpcodeFlags::RETURN),
        plain(0x11, "return-object", Format11x, OpcodeFlags::RETURN),
        plain(0x12, "const/4", Format11n, CONT | REG),
        plain(0x13, "const/16", Format21s, CONT | REG),
        plain(0x14, "const", Format31i, CONT | REG),
        plain(0x15, "const/high16", Format21h, CONT | REG),
        plain(0x16, "const-wide/16", Format21s, CONT | WIDE),
        plain(0x17, "const-wide/32", Format31i, CONT | WIDE),
        plain(0x18, "const-wide", Format51l, CONT | WIDE),
        plain(0x19, "const-wide/high16", Format21h, CONT | WIDE),
        op(0x1a, "const-string", Format21c, K::String, CONT | RESOLVE | REG),
        op(0x1b, "const-string/jumbo", Format31c, K::String, CONT | RESOLVE | REG),
        op(0x1c, "const-class", Format21c, K::Type, CONT | RESOLVE | REG),
        plain(0x1d, "monitor-enter", Format11x, CONT | THROW),
        plain(0x1e, "monitor-exit", Format11x, CONT | THROW),
        op(0x1f, "check-cast", Format21c, K::Type, CONT | RESOLVE),
        op(0x20, "instance-of", Format22c, K::Type, CONT | RESOLVE | REG),
        plain(0x21, "array-length", Format12x, CONT | THROW | REG),
        op(0x22, "new-instance", Format21c, K::Type, CONT | RESOLVE | REG),
        op(0x23, "new-array", Format22c, K::Type, CONT | RESOLVE | REG),
        op(0x24, "filled-new-array", Format35c, K::Type, CONT | RESOLVE | OpcodeFlags::SETS_RESULT),
        op(0x25, "filled-new-array/range", Format3rc, K::Type, CONT | RESOLVE | OpcodeFlags::SETS_RESULT),
        plain(0x26, "fill-array-data", Format31t, CONT | THROW),
        plain(0x27, "throw", Format11x, THROW),
        plain(0x28, "goto", Format10t, OpcodeFlags::BRANCH),
        plain(0x29, "goto/16", Format20t, OpcodeFlags::BRANCH),
        plain(0x2a, "goto/32", Format30t, OpcodeFlags::BRANCH),
        plain(0x2b, "packed-switch", Format31t, CONT | OpcodeFlags::SWITCH),
        plain(0x2c, "sparse-switch", Format31t, CONT | OpcodeFlags::SWITCH),
        plain(0x2d, "cmpl-float", Format23x, CONT | REG),
        plain(0x2e, "cmpg-float", Format23x, CONT | REG),
        plain(0x2f, "cmpl-double", Format23x, CONT | REG),
        plain(0x30, "cmpg-double", Format23x, CONT | REG),
        plain(0x31, "cmp-long", Format23x, CONT | REG),
        op(0xfa, "invoke-polymorphic", Format45cc, K::MethodAndProto, INVOKE),
        op(0xfb, "invoke-polymorphic/range", Format4rcc, K::MethodAndProto, INVOKE),
        op(0xfc, "invoke-custom", Format35c, K::CallSite, INVOKE),
        op(0xfd, "invoke-custom/range", Format3rc, K::CallSite, INVOKE),
        op(0xfe, "const-method-handle", Format21c, K::MethodHandle, CONT | RESOLVE | REG),
        op(0xff, "const-method-type", Format21c, K::Proto, CONT | RESOLVE | REG),
    ];
    for o in fixed {
        table[o.value as usize] = o;
    }

    for (i, name) in ["if-eq", "if-ne", "if-lt", "if-ge", "if-gt", "if-le"].into_iter().enumerate() {
        let v = 0x32 + i as u8;
        table[v as usize] = plain(v, name, Format22t, CONT | OpcodeFlags::BRANCH);
    }
    for (i, name) in ["if-eqz", "if-nez", "if-ltz", "if-gez", "if-gtz", "if-lez"].into_iter().enumerate() {
        let v = 0x38 + i as u8;
        table[v as usize] = plain(v, name, Format21t, CONT | OpcodeFlags::BRANCH);
    }

    let kinds = ["", "-wide", "-object", "-boolean", "-byte", "-char", "-short"];
    for (i, suffix) in kinds.into_iter().enumerate() {
        let wide = suffix == "-wide";
        let get = CONT | THROW | if wide { WIDE } else { REG };
        let name = |prefix: &str| leak(format!("{}{}", prefix, suffix));
        let v = 0x44 + i as u8;
        table[v as usize] = plain(v, name("aget"), Format23x, get);
        table[(v + 7) as usize] = plain(v + 7, name("aput"), Format23x, CONT | THROW);
        let v = 0x52 + i as u8;
        table[v as usize] = op(v, name("iget"), Format22c, K::Field, get | OpcodeFlags::WRITES_VERIFY_ERROR);
        table[(v + 7) as usize] = op(v + 7, name("iput"), Format22c, K::Field, CONT | RESOLVE);
        let v = 0x60 + i as u8;
        table[v as usize] = op(v, name("sget"), Format21c, K::Field, get | OpcodeFlags::WRITES_VERIFY_ERROR);
        table[(v + 7) as usize] = op(v + 7, name("sput"), Format21c, K::Field, CONT | RESOLVE);
    }

    for (i, kind) in ["virtual", "super", "direct", "static", "interface"].into_iter().enumerate() {
        let v = 0x6e + i as u8;
        table[v as usize] = op(v, leak(format!("invoke-{}", kind)), Format35c, K::Method, INVOKE);
        let v = 0x74 + i as u8;
        table[v as usize] = op(v, leak(format!("invoke-{}/range", kind)), Format3rc, K::Method, INVOKE);
    }

    for (i, (name, wide)) in UNOPS.into_iter().enumerate() {
        let v = 0x7b + i as u8;
        table[v as usize] = plain(v, name, Format12x, CONT | if wide { WIDE } else { REG });
    }
    for (i, name) in BINOPS.into_iter().enumerate() {
        let v = 0x90 + i as u8;
        table[v as usize] = plain(v, name, Format23x, binop_flags(name));
    }
    for (i, name) in BINOPS_2ADDR.into_iter().enumerate() {
        let v = 0xb0 + i as u8;
        table[v as usize] = plain(v, name, Format12x, binop_flags(name));
    }
    for (i, name) in LIT16.into_iter().enumerate() {
        let v = 0xd0 + i as u8;
        table[v as usize] = plain(v, name, Format22s, binop_flags(name));
    }
    for (i, name) in LIT8.into_iter().enumerate() {
        let v = 0xd8 + i as u8;
        table[v as usize] = plain(v, name, Format22b, binop_flags(name));
    }

    table
});

/// Descriptor for an opcode value.
pub fn instruction_descriptor(opcode: u8) -> &'static Opcode {
    &OPCODES[opcode as usize]
}

pub fn opcode_by_name(name: &str) -> Option<&'static Opcode> {
    OPCODES.iter().find(|o| o.name == name && !o.is_unused())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_value()
    {
        for (i, o) in OPCODES.iter().enumerate() {
            assert_eq!(o.value as usize, i);
        }
        assert_eq!(OPCODES.len(), 256);
    }

    #[test]
    fn spot_check_descriptors()
    {
        let d = instruction_descriptor(0x6e);
        assert_eq!(d.name, "invoke-virtual");
        assert_eq!(d.format, Format::Format35c);
        assert_eq!(d.index_kind, IndexKind::Method);
        assert!(d.is_invoke() && d.can_throw());

        assert_eq!(instruction_descriptor(0x93).name, "div-int");
        assert!(instruction_descriptor(0x93).can_throw());
        assert!(!instruction_descriptor(0x90).can_throw());
        assert!(instruction_descriptor(0x9b).flags.contains(OpcodeFlags::SETS_WIDE_REGISTER));
        assert_eq!(instruction_descriptor(0xcf).name, "rem-double/2addr");
        assert_eq!(instruction_descriptor(0xe2).name, "ushr-int/lit8");
        assert_eq!(instruction_descriptor(0x5a).name, "iput");
        assert_eq!(instruction_descriptor(0x6d).name, "sput-short");
        assert_eq!(instruction_descriptor(0x0e).flags, OpcodeFlags::RETURN);
        assert!(instruction_descriptor(0x28).is_branch() && !instruction_descriptor(0x28).can_continue());
        assert_eq!(instruction_descriptor(0x8f).name, "int-to-short");
    }

    #[test]
    fn gaps_are_unused()
    {
        for v in (0x3e..=0x43).chain([0x73, 0x79, 0x7a]).chain(0xe3..=0xf9) {
            let d = instruction_descriptor(v);
            assert!(d.is_unused(), "{:02x}", v);
            assert_eq!(d.name, format!("unused-{:02x}", v));
        }
        assert_eq!(opcode_by_name("const/high16").map(|o| o.value), Some(0x15));
        assert!(opcode_by_name("unused-3e").is_none());
    }
}
