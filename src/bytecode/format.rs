use bitflags::bitflags;

/// What kind of pool entry an instruction's index operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    None,
    String,
    Type,
    Field,
    Method,
    /// Method index plus a trailing proto index (`invoke-polymorphic`).
    MethodAndProto,
    CallSite,
    MethodHandle,
    Proto,
}

// Per-opcode properties consulted by the verifier, interpreter and walker.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpcodeFlags: u32 {
        /// Control may fall through to the next instruction.
        const CONTINUE = 0x1;
        const THROW = 0x2;
        const BRANCH = 0x4;
        const SWITCH = 0x8;
        const RETURN = 0x10;
        const INVOKE = 0x20;
        /// Operand resolution can fail and is recorded as a verification error.
        const WRITES_VERIFY_ERROR = 0x40;
        const SETS_RESULT = 0x80;
        const SETS_REGISTER = 0x100;
        const SETS_WIDE_REGISTER = 0x200;
        const UNUSED = 0x400;
    }
}

/// Instruction encodings. The digits follow the usual naming: size in code
/// units, register count, then the operand shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Format10t,
    Format10x,
    Format11n,
    Format11x,
    Format12x,
    Format20t,
    Format21c,
    Format21h,
    Format21s,
    Format21t,
    Format22b,
    Format22c,
    Format22s,
    Format22t,
    Format22x,
    Format23x,
    Format30t,
    Format31c,
    Format31i,
    Format31t,
    Format32x,
    Format35c,
    Format3rc,
    Format45cc,
    Format4rcc,
    Format51l,
    PackedSwitchPayload,
    SparseSwitchPayload,
    ArrayPayload,
}

impl Format {
    /// Fixed width in 16-bit code units; 0 for the variable-length payloads.
    pub const fn size_in_code_units(&self) -> usize {
        match self {
            Format::Format10t
            | Format::Format10x
            | Format::Format11n
            | Format::Format11x
            | Format::Format12x => 1,

            Format::Format20t
            | Format::Format21c
            | Format::Format21h
            | Format::Format21s
            | Format::Format21t
            | Format::Format22b
            | Format::Format22c
            | Format::Format22s
            | Format::Format22t
            | Format::Format22x
            | Format::Format23x => 2,

            Format::Format30t
            | Format::Format31c
            | Format::Format31i
            | Format::Format31t
            | Format::Format32x
            | Format::Format35c
            | Format::Format3rc => 3,

            Format::Format45cc | Format::Format4rcc => 4,

            Format::Format51l => 5,

            Format::PackedSwitchPayload | Format::SparseSwitchPayload | Format::ArrayPayload => 0,
        }
    }

    pub const fn is_payload(&self) -> bool {
        matches!(self, Format::PackedSwitchPayload | Format::SparseSwitchPayload | Format::ArrayPayload)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Format::Format10t => "10t",
            Format::Format10x => "10x",
            Format::Format11n => "11n",
            Format::Format11x => "11x",
            Format::Format12x => "12x",
            Format::Format20t => "20t",
            Format::Format21c => "21c",
            Format::Format21h => "21h",
            Format::Format21s => "21s",
            Format::Format21t => "21t",
            Format::Format22b => "22b",
            Format::Format22c => "22c",
            Format::Format22s => "22s",
            Format::Format22t => "22t",
            Format::Format22x => "22x",
            Format::Format23x => "23x",
            Format::Format30t => "30t",
            Format::Format31c => "31c",
            Format::Format31i => "31i",
            Format::Format31t => "31t",
            Format::Format32x => "32x",
            Format::Format35c => "35c",
            Format::Format3rc => "3rc",
            Format::Format45cc => "45cc",
            Format::Format4rcc => "4rcc",
            Format::Format51l => "51l",
            Format::PackedSwitchPayload => "packed-switch-payload",
            Format::SparseSwitchPayload => "sparse-switch-payload",
            Format::ArrayPayload => "array-payload",
        }
    }
}

/// Static description of one opcode value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub value: u8,
    pub name: &'static str,
    pub format: Format,
    pub index_kind: IndexKind,
    pub flags: OpcodeFlags,
}

impl Opcode {
    pub const fn new(value: u8, name: &'static str, format: Format, index_kind: IndexKind, flags: OpcodeFlags) -> Opcode {
        Opcode { value, name, format, index_kind, flags }
    }

    pub fn size_in_code_units(&self) -> usize {
        self.format.size_in_code_units()
    }

    pub fn can_throw(&self) -> bool {
        self.flags.contains(OpcodeFlags::THROW)
    }

    pub fn can_continue(&self) -> bool {
        self.flags.contains(OpcodeFlags::CONTINUE)
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(OpcodeFlags::BRANCH)
    }

    pub fn is_switch(&self) -> bool {
        self.flags.contains(OpcodeFlags::SWITCH)
    }

    pub fn is_return(&self) -> bool {
        self.flags.contains(OpcodeFlags::RETURN)
    }

    pub fn is_invoke(&self) -> bool {
        self.flags.contains(OpcodeFlags::INVOKE)
    }

    pub fn is_unused(&self) -> bool {
        self.flags.contains(OpcodeFlags::UNUSED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_cover_every_encoding()
    {
        assert_eq!(Format::Format10x.size_in_code_units(), 1);
        assert_eq!(Format::Format23x.size_in_code_units(), 2);
        assert_eq!(Format::Format35c.size_in_code_units(), 3);
        assert_eq!(Format::Format45cc.size_in_code_units(), 4);
        assert_eq!(Format::Format51l.size_in_code_units(), 5);
        assert!(Format::ArrayPayload.is_payload());
        assert_eq!(Format::ArrayPayload.size_in_code_units(), 0);
    }
}
