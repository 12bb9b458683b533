/* Compiled-code frames: raw bytes plus the registers saved at the call */

use std::sync::Arc;

use crate::runtime::object::ObjRef;
use crate::stack::method::Method;
use crate::stack::stack_map::{DexRegisterLocation, StackMap};

pub const NUM_REGISTERS: usize = 16;

#[derive(Debug, Clone)]
pub struct QuickFrame {
    pub method: Arc<Method>,
    pub native_pc: u32,
    /// The frame's bytes, little endian, slot 0 at offset 0.
    pub slots: Vec<u8>,
    /// Callee-save and spill registers captured at the safepoint.
    pub registers: [u64; NUM_REGISTERS],
}

impl QuickFrame {
    pub fn new(method: Arc<Method>, native_pc: u32, frame_size: usize) -> QuickFrame {
        QuickFrame { method, native_pc, slots: vec![0; frame_size], registers: [0; NUM_REGISTERS] }
    }

    pub fn frame_size(&self) -> usize {
        self.slots.len()
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let b = self.slots.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> bool {
        match offset.checked_add(4).and_then(|end| self.slots.get_mut(offset..end)) {
            Some(b) => {
                b.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn register(&self, r: u8) -> Option<u64> {
        self.registers.get(r as usize).copied()
    }

    /// Value of a dex register given where the stack map says it lives.
    pub fn read_location(&self, location: DexRegisterLocation) -> Option<u32> {
        match location {
            DexRegisterLocation::None => None,
            DexRegisterLocation::InStack(off) => self.read_u32(usize::try_from(off).ok()?),
            DexRegisterLocation::InRegister(r) => self.register(r).map(|v| v as u32),
            DexRegisterLocation::Constant(c) => Some(c as u32),
        }
    }

    pub fn write_location(&mut self, location: DexRegisterLocation, value: u32) -> bool {
        match location {
            DexRegisterLocation::InStack(off) => usize::try_from(off).is_ok_and(|o| self.write_u32(o, value)),
            DexRegisterLocation::InRegister(r) => match self.registers.get_mut(r as usize) {
                Some(slot) => {
                    *slot = value as u64;
                    true
                }
                None => false,
            },
            DexRegisterLocation::None | DexRegisterLocation::Constant(_) => false,
        }
    }

    /// Reference-holding stack slots and registers per `map`, replacing any
    /// the callback relocates. The callback sees the frame location.
    pub fn visit_refs<F>(&mut self, map: &StackMap, mut f: F)
    where
        F: FnMut(DexRegisterLocation, ObjRef) -> Option<ObjRef>,
    {
        for slot in map.reference_slots() {
            let off = slot * 4;
            if let Some(obj) = self.read_u32(off).and_then(ObjRef::from_raw) {
                if let Some(new) = f(DexRegisterLocation::InStack(off as i32), obj) {
                    self.write_u32(off, new.raw());
                }
            }
        }
        for r in map.reference_registers() {
            if let Some(obj) = self.register(r).and_then(|v| ObjRef::from_raw(v as u32)) {
                if let Some(new) = f(DexRegisterLocation::InRegister(r), obj) {
                    self.registers[r as usize] = new.raw() as u64;
                }
            }
        }
    }

    /// Spilled arguments of a native method, laid out by shorty; yields the
    /// byte offset of every reference argument, `this` first.
    pub fn native_reference_args(&self) -> Vec<usize> {
        let mut offsets = vec![];
        let mut off = 0;
        if !self.method.is_static() {
            offsets.push(off);
            off += 4;
        }
        for c in self.method.shorty().chars().skip(1) {
            match c {
                'L' => {
                    offsets.push(off);
                    off += 4;
                }
                'J' | 'D' => off += 8,
                _ => off += 4,
            }
        }
        offsets.retain(|o| o + 4 <= self.slots.len());
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::object::ClassId;

    #[test]
    fn native_args_follow_shorty() {
        let m = Arc::new(Method::new(ClassId(1), "LFoo;", "n", "(JLjava/lang/Object;I[B)V", 0));
        let q = QuickFrame::new(m, 0, 32);
        // this@0, J@4..12, L@12, I@16, [B@20
        assert_eq!(q.native_reference_args(), vec![0, 12, 20]);
    }

    #[test]
    fn locations_read_and_write() {
        let m = Arc::new(Method::new(ClassId(1), "LFoo;", "c", "()V", 0));
        let mut q = QuickFrame::new(m, 0, 16);
        assert!(q.write_location(DexRegisterLocation::InStack(8), 42));
        assert!(q.write_location(DexRegisterLocation::InRegister(3), 7));
        assert!(!q.write_location(DexRegisterLocation::Constant(1), 7));
        assert!(!q.write_location(DexRegisterLocation::InStack(14), 1));
        assert_eq!(q.read_location(DexRegisterLocation::InStack(8)), Some(42));
        assert_eq!(q.read_location(DexRegisterLocation::InRegister(3)), Some(7));
        assert_eq!(q.read_location(DexRegisterLocation::Constant(-1)), Some(u32::MAX));
        assert_eq!(q.read_location(DexRegisterLocation::None), None);
    }
}
