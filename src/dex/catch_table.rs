/* Try/catch lookup shared by the interpreter and the exception delivery path */

use log::warn;

use crate::dex::code_item::{TryItem, TryTable};
use crate::dex::{read_sleb128, read_uleb128};

/// Above this many try items the lookup switches to binary search.
pub const BINARY_SEARCH_THRESHOLD: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler
{
    /// `None` for a catch-all.
    pub type_idx: Option<u32>,
    pub address: u32,
}

/// Index and contents of the first try item covering `dex_pc`.
pub fn find_try_item<T: TryTable + ?Sized>(table: &T, dex_pc: u32) -> Option<(u32, TryItem)>
{
    let n = table.tries_size();
    if n <= BINARY_SEARCH_THRESHOLD {
        return (0..n).filter_map(|i| table.try_item(i).map(|t| (i, t))).find(|(_, t)| t.contains(dex_pc));
    }

    // Try items are sorted by start address and do not overlap.
    let (mut lo, mut hi) = (0u32, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let t = table.try_item(mid)?;
        if dex_pc < t.start_addr {
            hi = mid;
        } else if dex_pc >= t.end_addr() {
            lo = mid + 1;
        } else {
            return Some((mid, t));
        }
    }
    None
}

/// Byte offset, within the handler list, of the handlers covering `dex_pc`.
pub fn find_catch_handler_offset<T: TryTable + ?Sized>(table: &T, dex_pc: u32) -> Option<u32>
{
    find_try_item(table, dex_pc).map(|(_, t)| t.handler_off as u32)
}

/// Handlers covering `dex_pc`, in declaration order with the catch-all last.
pub fn catch_handlers<T: TryTable + ?Sized>(table: &T, dex_pc: u32) -> CatchHandlerIterator<'_>
{
    match find_catch_handler_offset(table, dex_pc) {
        Some(off) => CatchHandlerIterator::new(table.handler_data(), off as usize),
        None => CatchHandlerIterator::empty(),
    }
}

/// First handler at `dex_pc` whose type satisfies `matches`; catch-alls always match.
pub fn find_catch_handler<T, F>(table: &T, dex_pc: u32, mut matches: F) -> Option<CatchHandler>
where
    T: TryTable + ?Sized,
    F: FnMut(u32) -> bool,
{
    catch_handlers(table, dex_pc).find(|h| match h.type_idx {
        Some(t) => matches(t),
        None => true,
    })
}

/// Decoder over one `encoded_catch_handler`.
#[derive(Debug, Clone)]
pub struct CatchHandlerIterator<'a>
{
    data: &'a [u8],
    ix: usize,
    remaining: u32,
    catch_all: bool,
}

impl<'a> CatchHandlerIterator<'a>
{
    pub fn empty() -> CatchHandlerIterator<'static>
    {
        CatchHandlerIterator { data: &[], ix: 0, remaining: 0, catch_all: false }
    }

    pub fn new(data: &'a [u8], off: usize) -> CatchHandlerIterator<'a>
    {
        let mut ix = off;
        match read_sleb128(data, &mut ix) {
            Ok(size) => CatchHandlerIterator { data, ix, remaining: size.unsigned_abs(), catch_all: size <= 0 },
            Err(e) => {
                warn!("unreadable catch handler at +0x{:x}: {}", off, e);
                CatchHandlerIterator::empty()
            }
        }
    }

    fn stop(&mut self) -> Option<CatchHandler>
    {
        self.remaining = 0;
        self.catch_all = false;
        None
    }
}

impl<'a> Iterator for CatchHandlerIterator<'a>
{
    type Item = CatchHandler;

    fn next(&mut self) -> Option<CatchHandler>
    {
        if self.remaining > 0 {
            self.remaining -= 1;
            let type_idx = read_uleb128(self.data, &mut self.ix);
            let address = read_uleb128(self.data, &mut self.ix);
            return match (type_idx, address) {
                (Ok(t), Ok(a)) => Some(CatchHandler { type_idx: Some(t), address: a }),
                _ => self.stop(),
            };
        }
        if self.catch_all {
            self.catch_all = false;
            return match read_uleb128(self.data, &mut self.ix) {
                Ok(a) => Some(CatchHandler { type_idx: None, address: a }),
                Err(_) => self.stop(),
            };
        }
        None
    }
}
