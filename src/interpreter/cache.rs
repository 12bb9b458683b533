/* Per-thread direct-mapped cache of resolved instruction operands */

use std::sync::Arc;

use crate::bytecode::format::IndexKind;
use crate::bytecode::opcodes::instruction_descriptor;
use crate::runtime::object::{ClassId, ObjRef};
use crate::stack::method::Method;

#[derive(Debug, Clone)]
pub enum CachedValue {
    /// An interned string or class object; weak, cleared by sweeps.
    Object(ObjRef),
    Class(ClassId),
    Method(Arc<Method>),
}

#[derive(Debug, Clone)]
struct Entry {
    method: u32,
    dex_pc: u32,
    opcode: u8,
    value: CachedValue,
}

#[derive(Debug)]
pub struct InterpreterCache {
    entries: Vec<Option<Entry>>,
    hits: u64,
    misses: u64,
}

impl InterpreterCache {
    /// `size` is rounded up to a power of two.
    pub fn new(size: usize) -> InterpreterCache {
        let n = size.max(1).next_power_of_two();
        InterpreterCache { entries: vec![None; n], hits: 0, misses: 0 }
    }

    fn slot(&self, method: u32, dex_pc: u32) -> usize {
        let h = (method.wrapping_mul(0x9e37_79b9) ^ dex_pc) as usize;
        h & (self.entries.len() - 1)
    }

    pub fn get(&mut self, method: u32, dex_pc: u32) -> Option<CachedValue> {
        let i = self.slot(method, dex_pc);
        match &self.entries[i] {
            Some(e) if e.method == method && e.dex_pc == dex_pc => {
                self.hits += 1;
                Some(e.value.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store `value` for the instruction at `dex_pc`, evicting whatever shared the slot.
    pub fn set(&mut self, method: u32, dex_pc: u32, opcode: u8, value: CachedValue) {
        let i = self.slot(method, dex_pc);
        self.entries[i] = Some(Entry { method, dex_pc, opcode, value });
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_rate(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Drop or forward the object references held for string and type
    /// instructions. `is_marked` returns the object's current address when
    /// it survives. Returns the number of entries cleared.
    pub fn sweep<F>(&mut self, mut is_marked: F) -> usize
    where
        F: FnMut(ObjRef) -> Option<ObjRef>,
    {
        let mut cleared = 0;
        for slot in self.entries.iter_mut() {
            let Some(e) = slot else { continue };
            let weak = matches!(instruction_descriptor(e.opcode).index_kind, IndexKind::String | IndexKind::Type);
            if !weak {
                continue;
            }
            if let CachedValue::Object(obj) = e.value {
                match is_marked(obj) {
                    Some(new) => e.value = CachedValue::Object(new),
                    None => {
                        *slot = None;
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }
}
