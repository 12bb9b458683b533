/* Guarded thread stacks with an implicit overflow check */

use std::ops::Range;

use log::debug;

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::options::{RuntimeOptions, PAGE_SIZE};

/// Smallest usable region a stack must keep above its guard pages.
pub const MIN_USABLE_STACK: usize = 2 * PAGE_SIZE;

/// A thread stack, growing down from `begin + size`:
///
/// ```text
/// begin                                                    begin + size
///   | protected | reserved (implicit check) |   usable ...   |
/// ```
#[derive(Debug)]
pub struct StackGuard {
    begin: usize,
    size: usize,
    protected_size: usize,
    reserved_size: usize,
    reserved_open: bool,
    installed: bool,
    pages_touched: usize,
    sp: usize,
}

fn page_align_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

impl StackGuard {
    pub fn new(begin: usize, size: usize, options: &RuntimeOptions) -> RuntimeResult<StackGuard> {
        let protected_size = page_align_up(options.protected_stack_size);
        let reserved_size = page_align_up(options.reserved_stack_size);
        let required = protected_size + reserved_size + MIN_USABLE_STACK;
        if size < required {
            return Err(RuntimeError::StackTooSmall { size, required });
        }
        Ok(StackGuard {
            begin,
            size,
            protected_size,
            reserved_size,
            reserved_open: false,
            installed: false,
            pages_touched: 0,
            sp: begin + size,
        })
    }

    pub fn protected_range(&self) -> Range<usize> {
        self.begin..self.begin + self.protected_size
    }

    pub fn reserved_range(&self) -> Range<usize> {
        let lo = self.begin + self.protected_size;
        lo..lo + self.reserved_size
    }

    pub fn usable_range(&self) -> Range<usize> {
        self.reserved_range().end..self.begin + self.size
    }

    /// Lowest address code may touch before the implicit check fires.
    pub fn stack_end(&self) -> usize {
        if self.reserved_open {
            self.reserved_range().start
        } else {
            self.reserved_range().end
        }
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn pages_touched(&self) -> usize {
        self.pages_touched
    }

    /// Pre-fault every page from the top of the stack down to the protected
    /// region, then mark the protected region as installed.
    pub fn install<F: FnMut(usize)>(&mut self, mut touch: F) {
        let stop = self.protected_range().end;
        let mut page = (self.begin + self.size - 1) & !(PAGE_SIZE - 1);
        while page >= stop {
            touch(page);
            self.pages_touched += 1;
            match page.checked_sub(PAGE_SIZE) {
                Some(p) => page = p,
                None => break,
            }
        }
        self.installed = true;
        debug!(
            "stack guard at 0x{:x}: protected {} bytes, reserved {} bytes, {} pages touched",
            self.begin, self.protected_size, self.reserved_size, self.pages_touched
        );
    }

    /// The implicit check: would a frame reaching down to `sp` fault?
    pub fn check(&self, sp: usize) -> RuntimeResult<()> {
        if sp < self.stack_end() {
            return Err(RuntimeError::StackOverflow);
        }
        Ok(())
    }

    /// Grow the stack by a frame of `bytes`.
    pub fn push_frame(&mut self, bytes: usize) -> RuntimeResult<()> {
        let new_sp = self.sp.checked_sub(bytes).ok_or(RuntimeError::StackOverflow)?;
        self.check(new_sp)?;
        self.sp = new_sp;
        Ok(())
    }

    pub fn pop_frame(&mut self, bytes: usize) {
        self.sp = (self.sp + bytes).min(self.begin + self.size);
    }

    /// Let the overflow handler run on the reserved pages.
    pub fn open_reserved(&mut self) {
        self.reserved_open = true;
    }

    pub fn close_reserved(&mut self) {
        self.reserved_open = false;
    }

    pub fn is_reserved_open(&self) -> bool {
        self.reserved_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_stack_is_rejected() {
        let opts = RuntimeOptions::default();
        let size = opts.protected_stack_size + opts.reserved_stack_size + 4096;
        match StackGuard::new(0x10_0000, size, &opts) {
            Err(RuntimeError::StackTooSmall { size: s, required }) => {
                assert_eq!(s, size);
                assert!(required > size);
            }
            other => panic!("expected StackTooSmall, got {:?}", other),
        }
        assert!(StackGuard::new(0x10_0000, size + 4096, &opts).is_ok());
    }

    #[test]
    fn touches_pages_downward_and_checks_overflow() {
        let opts = RuntimeOptions::default();
        let mut guard = StackGuard::new(0x10_0000, 8 * PAGE_SIZE, &opts).unwrap();
        let mut touched = vec![];
        guard.install(|p| touched.push(p));
        assert_eq!(touched.len(), 6);
        assert!(touched.windows(2).all(|w| w[0] > w[1]));
        assert!(touched.iter().all(|p| !guard.protected_range().contains(p)));

        let usable = guard.usable_range().len();
        assert!(guard.push_frame(usable).is_ok());
        assert_eq!(guard.push_frame(16), Err(RuntimeError::StackOverflow));
        guard.open_reserved();
        assert!(guard.push_frame(16).is_ok());
        guard.close_reserved();
        guard.pop_frame(16);
        assert_eq!(guard.sp(), guard.usable_range().start);
    }
}
