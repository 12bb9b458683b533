/* Thread-local allocation buffers */

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::object::{align_object_size, ClassId, ObjRef};
use crate::runtime::thread::Thread;

/// `[start, pos, end, limit]`: allocation bumps `pos` up to `end`. `end` sits
/// below `limit` while an allocation sample is armed.
#[repr(C)]
#[derive(Debug, Default)]
pub struct Tlab {
    pub start: AtomicUsize,
    pub pos: AtomicUsize,
    pub end: AtomicUsize,
    pub limit: AtomicUsize,
    sample_offset: AtomicUsize,
    objects: AtomicUsize,
}

impl Tlab {
    /// Install a fresh range, re-arming the sample point if one is recorded.
    pub fn set(&self, range: Range<usize>) {
        let sample = self.sample_offset.load(Ordering::Relaxed);
        let end = match range.start.checked_add(sample) {
            Some(e) if sample > 0 && e < range.end => e,
            _ => range.end,
        };
        self.start.store(range.start, Ordering::Relaxed);
        self.pos.store(range.start, Ordering::Relaxed);
        self.limit.store(range.end, Ordering::Relaxed);
        self.end.store(end, Ordering::Release);
    }

    /// Drop the current range. The sample offset survives so profilers can correlate.
    pub fn reset(&self) {
        for w in [&self.start, &self.pos, &self.end, &self.limit] {
            w.store(0, Ordering::Relaxed);
        }
        self.objects.store(0, Ordering::Relaxed);
    }

    pub fn set_sample_offset(&self, offset: usize) {
        self.sample_offset.store(offset, Ordering::Relaxed);
    }

    pub fn sample_offset(&self) -> usize {
        self.sample_offset.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.end.load(Ordering::Relaxed).saturating_sub(self.pos.load(Ordering::Relaxed))
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    pub fn range(&self) -> Range<usize> {
        self.start.load(Ordering::Relaxed)..self.limit.load(Ordering::Relaxed)
    }

    /// Fast path; only the owning thread calls this.
    fn try_bump(&self, bytes: usize) -> Option<usize> {
        let pos = self.pos.load(Ordering::Relaxed);
        let new_pos = pos.checked_add(bytes)?;
        if pos == 0 || new_pos > self.end.load(Ordering::Relaxed) {
            return None;
        }
        self.pos.store(new_pos, Ordering::Release);
        self.objects.fetch_add(1, Ordering::Relaxed);
        Some(pos)
    }

    /// Past the sample point but still inside the buffer.
    fn take_sample(&self, bytes: usize) -> bool {
        let (pos, end, limit) = (
            self.pos.load(Ordering::Relaxed),
            self.end.load(Ordering::Relaxed),
            self.limit.load(Ordering::Relaxed),
        );
        if end < limit && pos != 0 && pos + bytes <= limit {
            self.end.store(limit, Ordering::Release);
            return true;
        }
        false
    }
}

/// Allocate an object of `bytes` for `class` on `thread`, bump-pointer first.
pub fn tlab_allocate(thread: &Thread, class: ClassId, bytes: usize) -> RuntimeResult<ObjRef> {
    let size = align_object_size(bytes);
    let addr = match thread.tlsptr.tlab.try_bump(size) {
        Some(addr) => addr,
        None => allocate_slow(thread, size)?,
    };
    let heap = thread.runtime().heap();
    heap.init_object(addr, class, size);
    trace!("thread {} allocated {} bytes at 0x{:x}", thread.id(), size, addr);
    ObjRef::from_raw(addr as u32).ok_or(RuntimeError::OutOfMemory { requested: size })
}

fn allocate_slow(thread: &Thread, size: usize) -> RuntimeResult<usize> {
    // The slow path is a suspension point.
    thread.check_suspend();

    let tlab = &thread.tlsptr.tlab;
    if tlab.take_sample(size) {
        debug!("thread {} crossed its allocation sample point", thread.id());
        if let Some(addr) = tlab.try_bump(size) {
            return Ok(addr);
        }
    }

    let runtime = thread.runtime();
    let heap = runtime.heap();
    let tlab_size = runtime.options().tlab_size;
    let addr = if size > tlab_size / 2 {
        heap.allocate_large(size)
    } else {
        heap.refill_tlab(thread.id(), size, tlab_size).and_then(|range| {
            tlab.set(range);
            tlab.try_bump(size)
        })
    };
    match addr {
        Some(a) => Ok(a),
        None => {
            thread.throw_out_of_memory(size);
            Err(RuntimeError::OutOfMemory { requested: size })
        }
    }
}
