/* Heap collaborator interface and a simple bump-pointer implementation */

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::runtime::locks::{LevelMutex, LockLevel};
use crate::runtime::object::{align_object_size, ClassId, ObjRef, OBJECT_ALIGNMENT};

/// What the runtime core needs from a heap. Collection policy lives elsewhere.
pub trait HeapHooks: Send + Sync {
    /// A fresh TLAB range of at least `min_bytes`, ideally `preferred` bytes.
    fn refill_tlab(&self, thread_id: u32, min_bytes: usize, preferred: usize) -> Option<Range<usize>>;

    /// Allocate outside any TLAB; returns the object's address.
    fn allocate_large(&self, bytes: usize) -> Option<usize>;

    /// Write the header of a freshly allocated object.
    fn init_object(&self, addr: usize, class: ClassId, bytes: usize);

    fn class_of(&self, obj: ObjRef) -> Option<ClassId>;

    fn object_size(&self, obj: ObjRef) -> Option<usize>;
}

/// A fixed arena carved from the bottom up under the heap lock.
#[derive(Debug)]
pub struct BumpHeap {
    words: Box<[AtomicU32]>,
    top: LevelMutex<usize>,
}

impl BumpHeap {
    pub fn new(capacity: usize) -> BumpHeap {
        let words = (0..capacity / 4).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice();
        // Address 0 is null; the first object starts one alignment unit in.
        BumpHeap { words, top: LevelMutex::new(LockLevel::HeapLock, OBJECT_ALIGNMENT) }
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * 4
    }

    pub fn used(&self) -> usize {
        *self.top.lock()
    }

    fn carve(&self, bytes: usize) -> Option<Range<usize>> {
        let mut top = self.top.lock();
        let start = *top;
        let end = start.checked_add(bytes)?;
        if end > self.capacity() || end > u32::MAX as usize {
            return None;
        }
        *top = end;
        Some(start..end)
    }

    fn word(&self, addr: usize) -> Option<&AtomicU32> {
        self.words.get(addr / 4)
    }
}

impl HeapHooks for BumpHeap {
    fn refill_tlab(&self, thread_id: u32, min_bytes: usize, preferred: usize) -> Option<Range<usize>> {
        let want = align_object_size(preferred.max(min_bytes));
        let range = self.carve(want).or_else(|| self.carve(align_object_size(min_bytes)));
        match &range {
            Some(r) => debug!("thread {} tlab refill 0x{:x}..0x{:x}", thread_id, r.start, r.end),
            None => warn!("heap exhausted refilling tlab for thread {} ({} bytes)", thread_id, min_bytes),
        }
        range
    }

    fn allocate_large(&self, bytes: usize) -> Option<usize> {
        self.carve(align_object_size(bytes)).map(|r| r.start)
    }

    fn init_object(&self, addr: usize, class: ClassId, bytes: usize) {
        if let (Some(c), Some(s)) = (self.word(addr), self.word(addr + 4)) {
            c.store(class.0, Ordering::Release);
            s.store(bytes as u32, Ordering::Release);
        }
    }

    fn class_of(&self, obj: ObjRef) -> Option<ClassId> {
        self.word(obj.addr()).map(|w| ClassId(w.load(Ordering::Acquire)))
    }

    fn object_size(&self, obj: ObjRef) -> Option<usize> {
        self.word(obj.addr() + 4).map(|w| w.load(Ordering::Acquire) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carves_until_exhausted()
    {
        let heap = BumpHeap::new(256);
        let a = heap.refill_tlab(1, 16, 128).unwrap();
        assert_eq!(a, 8..136);
        // preferred size no longer fits, the minimum still does
        let b = heap.refill_tlab(1, 64, 128).unwrap();
        assert_eq!(b.len(), 64);
        assert!(heap.refill_tlab(1, 128, 128).is_none());
        assert!(heap.allocate_large(64).is_none());
    }

    #[test]
    fn headers_record_class_and_size()
    {
        let heap = BumpHeap::new(1024);
        let addr = heap.allocate_large(24).unwrap();
        heap.init_object(addr, ClassId(7), 24);
        let obj = ObjRef::from_raw(addr as u32).unwrap();
        assert_eq!(heap.class_of(obj), Some(ClassId(7)));
        assert_eq!(heap.object_size(obj), Some(24));
    }
}
