/* Views over single instructions in a method's code units */

use crate::bytecode::format::{Format, IndexKind, Opcode};
use crate::bytecode::opcodes::instruction_descriptor;
use crate::dex::error::DexError;

pub const PACKED_SWITCH_SIGNATURE: u16 = 0x0100;
pub const SPARSE_SWITCH_SIGNATURE: u16 = 0x0200;
pub const ARRAY_DATA_SIGNATURE: u16 = 0x0300;

/// Maximum number of argument registers in a 35c/45cc instruction.
pub const MAX_VAR_ARGS: usize = 5;

/// One decoded instruction, borrowed from its method's `insns`.
#[derive(Debug, Clone, Copy)]
pub struct Instruction<'a>
{
    insns: &'a [u16],
    pc: usize,
}

fn payload_format(unit: u16) -> Option<Format>
{
    match unit {
        PACKED_SWITCH_SIGNATURE => Some(Format::PackedSwitchPayload),
        SPARSE_SWITCH_SIGNATURE => Some(Format::SparseSwitchPayload),
        ARRAY_DATA_SIGNATURE => Some(Format::ArrayPayload),
        _ => None,
    }
}

/// Width of the instruction starting at `insns[pc]`, reading only the
/// header fields a payload needs.
fn width_at(insns: &[u16], pc: usize) -> Result<usize, DexError>
{
    let unit = |i: usize| -> Result<u32, DexError> {
        insns.get(pc + i).map(|u| *u as u32).ok_or_else(|| err!(BadCodeItem, "payload header at {} truncated", pc))
    };
    let first = unit(0)? as u16;
    Ok(match payload_format(first) {
        Some(Format::PackedSwitchPayload) => unit(1)? as usize * 2 + 4,
        Some(Format::SparseSwitchPayload) => unit(1)? as usize * 4 + 2,
        Some(Format::ArrayPayload) => {
            let width = unit(1)? as u64;
            let count = unit(2)? as u64 | (unit(3)? as u64) << 16;
            ((width * count + 1) / 2 + 4) as usize
        }
        _ => instruction_descriptor((first & 0xff) as u8).size_in_code_units(),
    })
}

impl<'a> Instruction<'a>
{
    /// Decode the instruction at `dex_pc`, checking that all of it lies in `insns`.
    pub fn at(insns: &'a [u16], dex_pc: u32) -> Result<Instruction<'a>, DexError>
    {
        let pc = dex_pc as usize;
        if pc >= insns.len() {
            fail!(BadCodeItem, "dex pc {} outside {} code units", pc, insns.len());
        }
        let width = width_at(insns, pc)?;
        if pc + width > insns.len() {
            fail!(BadCodeItem, "instruction at {} needs {} code units, {} remain", pc, width, insns.len() - pc);
        }
        Ok(Instruction { insns, pc })
    }

    pub fn dex_pc(&self) -> u32
    {
        self.pc as u32
    }

    fn fetch(&self, i: usize) -> u16
    {
        self.insns[self.pc + i]
    }

    fn fetch32(&self, i: usize) -> u32
    {
        self.fetch(i) as u32 | (self.fetch(i + 1) as u32) << 16
    }

    fn inst_a(&self) -> u32
    {
        (self.fetch(0) >> 8) as u32 & 0xf
    }

    fn inst_b(&self) -> u32
    {
        (self.fetch(0) >> 12) as u32
    }

    fn inst_aa(&self) -> u32
    {
        (self.fetch(0) >> 8) as u32
    }

    pub fn opcode(&self) -> u8
    {
        (self.fetch(0) & 0xff) as u8
    }

    pub fn descriptor(&self) -> &'static Opcode
    {
        instruction_descriptor(self.opcode())
    }

    pub fn name(&self) -> &'static str
    {
        match self.payload() {
            Some(f) => f.name(),
            None => self.descriptor().name,
        }
    }

    /// The payload kind when this is one of the three data pseudo-instructions.
    pub fn payload(&self) -> Option<Format>
    {
        payload_format(self.fetch(0))
    }

    pub fn format(&self) -> Format
    {
        self.payload().unwrap_or(self.descriptor().format)
    }

    pub fn size_in_code_units(&self) -> usize
    {
        // `at` already checked the width fits.
        width_at(self.insns, self.pc).unwrap_or(1)
    }

    /// The following instruction, `None` at the end of the code.
    pub fn next(&self) -> Result<Option<Instruction<'a>>, DexError>
    {
        let next = self.pc + self.size_in_code_units();
        if next >= self.insns.len() {
            return Ok(None);
        }
        Instruction::at(self.insns, next as u32).map(Some)
    }

    pub fn index_kind(&self) -> IndexKind
    {
        if self.payload().is_some() { IndexKind::None } else { self.descriptor().index_kind }
    }

    pub fn vreg_a(&self) -> u32
    {
        match self.format() {
            Format::Format12x | Format::Format11n | Format::Format22c | Format::Format22s | Format::Format22t => self.inst_a(),
            Format::Format35c | Format::Format45cc => self.inst_b(),
            Format::Format11x | Format::Format21c | Format::Format21h | Format::Format21s | Format::Format21t
            | Format::Format22b | Format::Format22x | Format::Format23x | Format::Format31c | Format::Format31i
            | Format::Format31t | Format::Format3rc | Format::Format4rcc | Format::Format51l => self.inst_aa(),
            Format::Format10t => self.inst_aa(),
            Format::Format20t => self.fetch(1) as u32,
            Format::Format30t => self.fetch32(1),
            Format::Format32x => self.fetch(1) as u32,
            _ => 0,
        }
    }

    /// Raw B field: a register, index, or unextended literal depending on format.
    pub fn vreg_b(&self) -> u32
    {
        match self.format() {
            Format::Format12x | Format::Format11n | Format::Format22c | Format::Format22s | Format::Format22t => self.inst_b(),
            Format::Format21c | Format::Format21h | Format::Format21s | Format::Format21t | Format::Format22x
            | Format::Format35c | Format::Format3rc | Format::Format45cc | Format::Format4rcc => self.fetch(1) as u32,
            Format::Format22b | Format::Format23x => self.fetch(1) as u32 & 0xff,
            Format::Format31c | Format::Format31i | Format::Format31t => self.fetch32(1),
            Format::Format32x => self.fetch(2) as u32,
            Format::Format51l => self.fetch32(1),
            _ => 0,
        }
    }

    pub fn vreg_c(&self) -> u32
    {
        match self.format() {
            Format::Format22b | Format::Format23x => (self.fetch(1) >> 8) as u32,
            Format::Format22c | Format::Format22s | Format::Format22t => self.fetch(1) as u32,
            Format::Format35c | Format::Format45cc => self.fetch(2) as u32 & 0xf,
            Format::Format3rc | Format::Format4rcc => self.fetch(2) as u32,
            _ => 0,
        }
    }

    /// Proto index of 45cc/4rcc.
    pub fn vreg_h(&self) -> u32
    {
        match self.format() {
            Format::Format45cc | Format::Format4rcc => self.fetch(3) as u32,
            _ => 0,
        }
    }

    /// The 64-bit literal of `const-wide`.
    pub fn wide_vreg_b(&self) -> i64
    {
        if self.format() != Format::Format51l {
            return 0;
        }
        (self.fetch32(1) as u64 | (self.fetch32(3) as u64) << 32) as i64
    }

    /// Argument registers of 35c/45cc, in operand order.
    pub fn var_args(&self) -> ([u32; MAX_VAR_ARGS], usize)
    {
        let mut args = [0u32; MAX_VAR_ARGS];
        if !matches!(self.format(), Format::Format35c | Format::Format45cc) {
            return (args, 0);
        }
        let count = (self.inst_b() as usize).min(MAX_VAR_ARGS);
        let regs = self.fetch(2);
        for (i, a) in args.iter_mut().enumerate().take(count.min(4)) {
            *a = ((regs >> (4 * i)) & 0xf) as u32;
        }
        if count == 5 {
            args[4] = self.inst_a();
        }
        (args, count)
    }

    /// Argument registers for either the variadic or the range encoding.
    pub fn arg_registers(&self) -> Vec<u32>
    {
        match self.format() {
            Format::Format3rc | Format::Format4rcc => (self.vreg_c()..self.vreg_c() + self.vreg_a()).collect(),
            _ => {
                let (args, n) = self.var_args();
                args[..n].to_vec()
            }
        }
    }

    /// The pool index operand, if this opcode has one.
    pub fn index(&self) -> Option<u32>
    {
        match self.index_kind() {
            IndexKind::None => None,
            _ => match self.format() {
                Format::Format22c => Some(self.vreg_c()),
                _ => Some(self.vreg_b()),
            },
        }
    }

    /// Sign-extended literal for const and lit formats, with high16 shifts applied.
    pub fn literal(&self) -> Option<i64>
    {
        Some(match self.format() {
            Format::Format11n => ((self.fetch(0) as i16) >> 12) as i64,
            Format::Format21s | Format::Format22s => self.fetch(1) as i16 as i64,
            Format::Format21h if self.opcode() == 0x19 => (self.fetch(1) as i16 as i64) << 48,
            Format::Format21h => ((self.fetch(1) as i16 as i32) << 16) as i64,
            Format::Format22b => ((self.fetch(1) as i16) >> 8) as i64,
            Format::Format31i => self.fetch32(1) as i32 as i64,
            Format::Format51l => self.wide_vreg_b(),
            _ => return None,
        })
    }

    /// Signed branch or payload offset in code units, relative to this instruction.
    pub fn branch_offset(&self) -> Option<i32>
    {
        Some(match self.format() {
            Format::Format10t => (self.fetch(0) >> 8) as u8 as i8 as i32,
            Format::Format20t | Format::Format21t | Format::Format22t => self.fetch(1) as i16 as i32,
            Format::Format30t | Format::Format31t => self.fetch32(1) as i32,
            _ => return None,
        })
    }

    /// Target of `key` in a packed-switch payload, as an offset from the switch.
    pub fn packed_switch_target(&self, key: i32) -> Option<i32>
    {
        if self.payload() != Some(Format::PackedSwitchPayload) {
            return None;
        }
        let size = self.fetch(1) as i64;
        let first_key = self.fetch32(2) as i32 as i64;
        let slot = key as i64 - first_key;
        if slot < 0 || slot >= size {
            return None;
        }
        Some(self.fetch32(4 + slot as usize * 2) as i32)
    }

    /// Target of `key` in a sparse-switch payload; keys are sorted ascending.
    pub fn sparse_switch_target(&self, key: i32) -> Option<i32>
    {
        if self.payload() != Some(Format::SparseSwitchPayload) {
            return None;
        }
        let size = self.fetch(1) as usize;
        let keys: Vec<i32> = (0..size).map(|i| self.fetch32(2 + i * 2) as i32).collect();
        let slot = keys.binary_search(&key).ok()?;
        Some(self.fetch32(2 + size * 2 + slot * 2) as i32)
    }

    /// Element width, element count and raw data of an array payload.
    pub fn array_data(&self) -> Option<(u16, u32, &'a [u16])>
    {
        if self.payload() != Some(Format::ArrayPayload) {
            return None;
        }
        let width = self.fetch(1);
        let count = self.fetch32(2);
        let end = self.pc + self.size_in_code_units();
        Some((width, count, &self.insns[self.pc + 4..end]))
    }
}

/// Walks `insns` instruction by instruction, yielding `(dex_pc, instruction)`.
#[derive(Debug, Clone)]
pub struct InstructionIter<'a>
{
    insns: &'a [u16],
    pc: usize,
    failed: bool,
}

impl<'a> InstructionIter<'a>
{
    pub fn new(insns: &'a [u16]) -> InstructionIter<'a>
    {
        InstructionIter { insns, pc: 0, failed: false }
    }
}

impl<'a> Iterator for InstructionIter<'a>
{
    type Item = Result<Instruction<'a>, DexError>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.failed || self.pc >= self.insns.len() {
            return None;
        }
        match Instruction::at(self.insns, self.pc as u32) {
            Ok(inst) => {
                self.pc += inst.size_in_code_units();
                Some(Ok(inst))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::DexErrorKind;

    #[test]
    fn decodes_register_fields()
    {
        // add-int v1, v2, v3 ; move v4, v5 ; const/4 v0, #-3
        let code = [0x0190, 0x0302, 0x5401, 0xd012];
        let add = Instruction::at(&code, 0).unwrap();
        assert_eq!(add.name(), "add-int");
        assert_eq!((add.vreg_a(), add.vreg_b(), add.vreg_c()), (1, 2, 3));
        let mv = add.next().unwrap().unwrap();
        assert_eq!(mv.dex_pc(), 2);
        assert_eq!((mv.vreg_a(), mv.vreg_b()), (4, 5));
        let c = mv.next().unwrap().unwrap();
        assert_eq!(c.literal(), Some(-3));
        assert!(c.next().unwrap().is_none());
    }

    #[test]
    fn invoke_operands()
    {
        // invoke-static {v0, v1, v2, v3, v4}, method@7
        let code = [0x5471, 0x0007, 0x3210];
        let inv = Instruction::at(&code, 0).unwrap();
        assert_eq!(inv.index_kind(), IndexKind::Method);
        assert_eq!(inv.index(), Some(7));
        let (args, n) = inv.var_args();
        assert_eq!(&args[..n], &[0, 1, 2, 3, 4]);

        // invoke-virtual/range {v10 .. v12}, method@0x1234
        let code = [0x0374, 0x1234, 0x000a];
        let r = Instruction::at(&code, 0).unwrap();
        assert_eq!(r.arg_registers(), vec![10, 11, 12]);
        assert_eq!(r.index(), Some(0x1234));
    }

    #[test]
    fn literals_and_branches()
    {
        let wide = [0x0218, 0x5678, 0x1234, 0xdef0, 0x9abc];
        let i = Instruction::at(&wide, 0).unwrap();
        assert_eq!(i.size_in_code_units(), 5);
        assert_eq!(i.wide_vreg_b(), 0x9abcdef012345678u64 as i64);

        let high = [0x0015, 0x8000];
        assert_eq!(Instruction::at(&high, 0).unwrap().literal(), Some(i32::MIN as i64));
        let high_wide = [0x0019, 0x4000];
        assert_eq!(Instruction::at(&high_wide, 0).unwrap().literal(), Some(0x4000i64 << 48));

        let goto_back = [0xfe28];
        assert_eq!(Instruction::at(&goto_back, 0).unwrap().branch_offset(), Some(-2));
        let lit8 = [0x00d8, 0xff01];
        let l = Instruction::at(&lit8, 0).unwrap();
        assert_eq!((l.vreg_b(), l.literal()), (1, Some(-1)));
    }

    #[test]
    fn payload_sizes()
    {
        // packed-switch-payload, 2 targets, first key 10
        let packed = [PACKED_SWITCH_SIGNATURE, 2, 10, 0, 6, 0, 8, 0];
        let p = Instruction::at(&packed, 0).unwrap();
        assert_eq!(p.size_in_code_units(), 8);
        assert_eq!(p.packed_switch_target(11), Some(8));
        assert_eq!(p.packed_switch_target(12), None);

        let sparse = [SPARSE_SWITCH_SIGNATURE, 2, 0xfffb, 0xffff, 100, 0, 3, 0, 9, 0];
        let s = Instruction::at(&sparse, 0).unwrap();
        assert_eq!(s.size_in_code_units(), 10);
        assert_eq!(s.sparse_switch_target(-5), Some(3));
        assert_eq!(s.sparse_switch_target(100), Some(9));
        assert_eq!(s.sparse_switch_target(7), None);

        // 3 one-byte elements round up to two code units of data
        let array = [ARRAY_DATA_SIGNATURE, 1, 3, 0, 0x0201, 0x0003];
        let a = Instruction::at(&array, 0).unwrap();
        assert_eq!(a.size_in_code_units(), 6);
        assert_eq!(a.array_data(), Some((1, 3, &array[4..6])));
        assert_eq!(a.name(), "array-payload");
    }

    #[test]
    fn truncated_instruction_is_rejected()
    {
        let code = [0x0014, 0x0001];
        assert_eq!(Instruction::at(&code, 0).unwrap_err().kind(), DexErrorKind::BadCodeItem);
        let all: Vec<_> = InstructionIter::new(&[0x0000, 0x000e, 0x0014]).collect();
        assert_eq!(all.len(), 3);
        assert!(all[2].is_err());
    }
}
