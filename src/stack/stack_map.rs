/* Stack maps: where compiled code keeps each dex register at a safepoint */

use crate::dex::error::DexError;
use crate::dex::{read_sleb128, read_uleb128, write_sleb128, write_uleb128};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DexRegisterLocation {
    #[default]
    None,
    /// Byte offset into the quick frame.
    InStack(i32),
    InRegister(u8),
    Constant(i32),
}

impl DexRegisterLocation {
    fn tag(&self) -> u32 {
        match self {
            DexRegisterLocation::None => 0,
            DexRegisterLocation::InStack(_) => 1,
            DexRegisterLocation::InRegister(_) => 2,
            DexRegisterLocation::Constant(_) => 3,
        }
    }

    fn value(&self) -> i32 {
        match *self {
            DexRegisterLocation::None => 0,
            DexRegisterLocation::InStack(o) => o,
            DexRegisterLocation::InRegister(r) => r as i32,
            DexRegisterLocation::Constant(c) => c,
        }
    }

    fn from_parts(tag: u32, value: i32) -> Result<DexRegisterLocation, DexError> {
        Ok(match tag {
            0 => DexRegisterLocation::None,
            1 => DexRegisterLocation::InStack(value),
            2 => DexRegisterLocation::InRegister(value as u8),
            3 => DexRegisterLocation::Constant(value),
            _ => fail!(BadCodeItem, "unknown dex register location kind {}", tag),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackMapKind {
    #[default]
    Default,
    Catch,
    Osr,
}

/// One inlined frame active at a stack map, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InlineInfo {
    pub method_index: u32,
    pub dex_pc: u32,
    pub dex_registers: Vec<DexRegisterLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackMap {
    pub native_pc: u32,
    /// Dex pc in the outer method; the call site when frames are inlined.
    pub dex_pc: u32,
    pub kind: StackMapKind,
    /// Machine registers holding references.
    pub register_mask: u32,
    /// One bit per 4-byte frame slot holding a reference.
    pub stack_mask: u64,
    pub dex_registers: Vec<DexRegisterLocation>,
    pub inline_infos: Vec<InlineInfo>,
}

impl StackMap {
    pub fn is_stack_slot_ref(&self, slot: usize) -> bool {
        slot < 64 && self.stack_mask & (1 << slot) != 0
    }

    pub fn reference_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..64).filter(|s| self.is_stack_slot_ref(*s))
    }

    pub fn reference_registers(&self) -> impl Iterator<Item = u8> + '_ {
        (0..32u8).filter(|r| self.register_mask & (1 << r) != 0)
    }

    /// The dex register, in the outer method, kept at `location`.
    pub fn dex_register_at(&self, location: DexRegisterLocation) -> Option<u16> {
        self.dex_registers.iter().position(|l| *l == location).map(|i| i as u16)
    }

    pub fn inline_depth(&self) -> usize {
        self.inline_infos.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeInfo {
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub stack_maps: Vec<StackMap>,
}

fn write_locations(out: &mut Vec<u8>, locations: &[DexRegisterLocation]) {
    write_uleb128(out, locations.len() as u32);
    for l in locations {
        write_uleb128(out, l.tag());
        write_sleb128(out, l.value());
    }
}

fn read_locations(bytes: &[u8], ix: &mut usize) -> Result<Vec<DexRegisterLocation>, DexError> {
    let n = read_uleb128(bytes, ix)?;
    (0..n)
        .map(|_| {
            let tag = read_uleb128(bytes, ix)?;
            let value = read_sleb128(bytes, ix)?;
            DexRegisterLocation::from_parts(tag, value)
        })
        .collect()
}

impl CodeInfo {
    pub fn stack_map_for_native_pc(&self, native_pc: u32) -> Option<&StackMap> {
        self.stack_maps.iter().find(|m| m.native_pc == native_pc && m.kind != StackMapKind::Catch)
    }

    pub fn stack_map_for_dex_pc(&self, dex_pc: u32, kind: StackMapKind) -> Option<&StackMap> {
        self.stack_maps.iter().find(|m| m.dex_pc == dex_pc && m.kind == kind)
    }

    /// Entry state of the compiled catch handler at `dex_pc`.
    pub fn catch_stack_map_for_dex_pc(&self, dex_pc: u32) -> Option<&StackMap> {
        self.stack_map_for_dex_pc(dex_pc, StackMapKind::Catch)
    }

    /// LEB128 encoding, as embedded after a compiled method's header.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![];
        write_uleb128(&mut out, self.frame_size);
        write_uleb128(&mut out, self.core_spill_mask);
        write_uleb128(&mut out, self.stack_maps.len() as u32);
        for m in &self.stack_maps {
            write_uleb128(&mut out, m.native_pc);
            write_uleb128(&mut out, m.dex_pc);
            write_uleb128(&mut out, m.kind as u32);
            write_uleb128(&mut out, m.register_mask);
            write_uleb128(&mut out, m.stack_mask as u32);
            write_uleb128(&mut out, (m.stack_mask >> 32) as u32);
            write_locations(&mut out, &m.dex_registers);
            write_uleb128(&mut out, m.inline_infos.len() as u32);
            for ii in &m.inline_infos {
                write_uleb128(&mut out, ii.method_index);
                write_uleb128(&mut out, ii.dex_pc);
                write_locations(&mut out, &ii.dex_registers);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<CodeInfo, DexError> {
        let mut ix = 0;
        let frame_size = read_uleb128(bytes, &mut ix)?;
        let core_spill_mask = read_uleb128(bytes, &mut ix)?;
        let n = read_uleb128(bytes, &mut ix)?;
        let mut stack_maps = Vec::with_capacity(n.min(1024) as usize);
        for _ in 0..n {
            let native_pc = read_uleb128(bytes, &mut ix)?;
            let dex_pc = read_uleb128(bytes, &mut ix)?;
            let kind = match read_uleb128(bytes, &mut ix)? {
                0 => StackMapKind::Default,
                1 => StackMapKind::Catch,
                2 => StackMapKind::Osr,
                k => fail!(BadCodeItem, "unknown stack map kind {}", k),
            };
            let register_mask = read_uleb128(bytes, &mut ix)?;
            let lo = read_uleb128(bytes, &mut ix)? as u64;
            let hi = read_uleb128(bytes, &mut ix)? as u64;
            let dex_registers = read_locations(bytes, &mut ix)?;
            let depth = read_uleb128(bytes, &mut ix)?;
            let mut inline_infos = vec![];
            for _ in 0..depth {
                let method_index = read_uleb128(bytes, &mut ix)?;
                let dex_pc = read_uleb128(bytes, &mut ix)?;
                let dex_registers = read_locations(bytes, &mut ix)?;
                inline_infos.push(InlineInfo { method_index, dex_pc, dex_registers });
            }
            stack_maps.push(StackMap { native_pc, dex_pc, kind, register_mask, stack_mask: lo | hi << 32, dex_registers, inline_infos });
        }
        if ix != bytes.len() {
            fail!(BadCodeItem, "{} trailing bytes after code info", bytes.len() - ix);
        }
        Ok(CodeInfo { frame_size, core_spill_mask, stack_maps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::DexErrorKind;

    fn sample() -> CodeInfo {
        CodeInfo {
            frame_size: 32,
            core_spill_mask: 0b1100,
            stack_maps: vec![
                StackMap {
                    native_pc: 0x40,
                    dex_pc: 2,
                    register_mask: 1 << 5,
                    stack_mask: 1 << 3 | 1 << 40,
                    dex_registers: vec![DexRegisterLocation::Constant(-3), DexRegisterLocation::InStack(12), DexRegisterLocation::None],
                    inline_infos: vec![InlineInfo { method_index: 0, dex_pc: 2, dex_registers: vec![DexRegisterLocation::InRegister(5)] }],
                    ..Default::default()
                },
                StackMap { native_pc: 0x80, dex_pc: 7, kind: StackMapKind::Catch, ..Default::default() },
            ],
        }
    }

    #[test]
    fn lookups_by_pc() {
        let info = sample();
        assert_eq!(info.stack_map_for_native_pc(0x40).map(|m| m.dex_pc), Some(2));
        // catch maps are entry states, never a call site
        assert!(info.stack_map_for_native_pc(0x80).is_none());
        assert_eq!(info.catch_stack_map_for_dex_pc(7).map(|m| m.native_pc), Some(0x80));
        let m = &info.stack_maps[0];
        assert_eq!(m.reference_slots().collect::<Vec<_>>(), vec![3, 40]);
        assert_eq!(m.reference_registers().collect::<Vec<_>>(), vec![5]);
        assert_eq!(m.dex_register_at(DexRegisterLocation::InStack(12)), Some(1));
    }

    #[test]
    fn encoding_survives_decode_and_rejects_trailing_bytes() {
        let info = sample();
        let mut bytes = info.encode();
        assert_eq!(CodeInfo::decode(&bytes).unwrap(), info);
        bytes.push(0);
        assert_eq!(CodeInfo::decode(&bytes).unwrap_err().kind(), DexErrorKind::BadCodeItem);
    }
}
