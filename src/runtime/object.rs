/* Managed references, class ids and raw values */

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

pub const OBJECT_HEADER_SIZE: usize = 8;
pub const OBJECT_ALIGNMENT: usize = 8;

/// A non-null heap reference: the object's byte address in the managed heap.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef(NonZeroU32);

impl ObjRef {
    pub fn from_raw(raw: u32) -> Option<ObjRef> {
        NonZeroU32::new(raw).map(ObjRef)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }

    pub fn addr(self) -> usize {
        self.0.get() as usize
    }
}

/// Encode an optional reference the way slots store it (0 is null).
pub fn raw_of(obj: Option<ObjRef>) -> u32 {
    obj.map_or(0, ObjRef::raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub u32);

/// A reference slot shared between its owner and the GC.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct RefSlot(AtomicU32);

impl RefSlot {
    pub const fn null() -> RefSlot {
        RefSlot(AtomicU32::new(0))
    }

    pub fn get(&self) -> Option<ObjRef> {
        ObjRef::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, obj: Option<ObjRef>) {
        self.0.store(raw_of(obj), Ordering::Release);
    }

    pub fn take(&self) -> Option<ObjRef> {
        ObjRef::from_raw(self.0.swap(0, Ordering::AcqRel))
    }
}

/// An untyped 64-bit value: ints, longs, floats, doubles and references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct JValue(pub u64);

impl JValue {
    pub fn from_int(v: i32) -> JValue {
        JValue(v as u32 as u64)
    }

    pub fn from_long(v: i64) -> JValue {
        JValue(v as u64)
    }

    pub fn from_ref(obj: Option<ObjRef>) -> JValue {
        JValue(raw_of(obj) as u64)
    }

    pub fn as_int(&self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn as_long(&self) -> i64 {
        self.0 as i64
    }

    pub fn as_ref(&self) -> Option<ObjRef> {
        ObjRef::from_raw(self.0 as u32)
    }

    /// Split into the low and high vreg halves of a wide value.
    pub fn halves(&self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }

    pub fn from_halves(lo: u32, hi: u32) -> JValue {
        JValue(lo as u64 | (hi as u64) << 32)
    }
}

pub fn align_object_size(bytes: usize) -> usize {
    (bytes.max(OBJECT_HEADER_SIZE) + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}
