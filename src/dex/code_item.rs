/* Code items: borrowed view for loaded containers, owned form for the writer and runtime */

use log::warn;

use crate::dex::error::{DexError, ResultExt};
use crate::dex::{read_u2, read_u4, read_sleb128, read_uleb128, read_x, write_sleb128, write_u2, write_u4, write_uleb128};

pub const CODE_ITEM_HEADER_SIZE: usize = 16;
pub const TRY_ITEM_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    pub handler_off: u16, // offset in bytes from the start of the encoded_catch_handler_list
}

impl TryItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<TryItem, DexError> {
        Ok(TryItem {
            start_addr: read_u4(bytes, ix)?,
            insn_count: read_u2(bytes, ix)?,
            handler_off: read_u2(bytes, ix)?,
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_u4(bytes, self.start_addr);
        c += write_u2(bytes, self.insn_count);
        c += write_u2(bytes, self.handler_off);
        c
    }

    pub fn end_addr(&self) -> u32 {
        self.start_addr.saturating_add(self.insn_count as u32)
    }

    pub fn contains(&self, dex_pc: u32) -> bool {
        dex_pc >= self.start_addr && dex_pc < self.end_addr()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTypeAddrPair {
    pub type_idx: u32,
    pub addr: u32,
}

impl EncodedTypeAddrPair {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<EncodedTypeAddrPair, DexError> {
        let type_idx = read_uleb128(bytes, ix)?;
        let addr = read_uleb128(bytes, ix)?;
        Ok(EncodedTypeAddrPair { type_idx, addr })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_uleb128(bytes, self.type_idx);
        c += write_uleb128(bytes, self.addr);
        c
    }
}

/// One `encoded_catch_handler`: typed handlers, then an optional catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCatchHandler {
    pub handlers: Vec<EncodedTypeAddrPair>,
    pub catch_all_addr: Option<u32>,
}

impl EncodedCatchHandler {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<EncodedCatchHandler, DexError> {
        let size = read_sleb128(bytes, ix)?;
        let count = size.unsigned_abs() as usize;
        // each pair needs at least two bytes
        if count > bytes.len().saturating_sub(*ix) / 2 {
            fail!(BadCodeItem, "catch handler with {} entries does not fit at 0x{:x}", count, *ix);
        }
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count { pairs.push(EncodedTypeAddrPair::read(bytes, ix)?); }
        let catch_all_addr = if size <= 0 { Some(read_uleb128(bytes, ix)?) } else { None };
        Ok(EncodedCatchHandler { handlers: pairs, catch_all_addr })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        let size: i32 = if self.catch_all_addr.is_some() { -(self.handlers.len() as i32) } else { self.handlers.len() as i32 };
        c += write_sleb128(bytes, size);
        for p in &self.handlers { c += p.write(bytes); }
        if let Some(addr) = self.catch_all_addr { c += write_uleb128(bytes, addr); }
        c
    }
}

/// Anything that can answer try/catch questions for one method body.
pub trait TryTable {
    fn tries_size(&self) -> u32;
    fn try_item(&self, i: u32) -> Option<TryItem>;
    /// Bytes of the `encoded_catch_handler_list`, starting at its size field.
    fn handler_data(&self) -> &[u8];
}

/// Borrowed view of a `code_item` inside a container.
#[derive(Debug, Clone, Copy)]
pub struct CodeItem<'a>
{
    offset: usize,
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub tries_size: u16,
    pub debug_info_off: u32,
    pub insns_size: u32,
    insns: &'a [u8],
    tries: &'a [u8],
    handlers: &'a [u8],
    handlers_start: usize,
}

impl<'a> CodeItem<'a>
{
    /// Read the fixed part of a code item at `off`, checking that the
    /// instructions and try items fit in `base`.
    pub fn read(base: &'a [u8], off: usize) -> Result<CodeItem<'a>, DexError>
    {
        if off % 4 != 0 {
            fail!(BadCodeItem, "code item at 0x{:x} is not 4-byte aligned", off);
        }
        let mut ix = off;
        let registers_size = read_u2(base, &mut ix)?;
        let ins_size = read_u2(base, &mut ix)?;
        let outs_size = read_u2(base, &mut ix)?;
        let tries_size = read_u2(base, &mut ix)?;
        let debug_info_off = read_u4(base, &mut ix)?;
        let insns_size = read_u4(base, &mut ix)?;

        if ins_size > registers_size {
            fail!(BadCodeItem, "ins_size {} exceeds registers_size {}", ins_size, registers_size);
        }
        let insns_len = (insns_size as usize).checked_mul(2)
            .ok_or_else(|| err!(BadCodeItem, "insns_size {} overflows", insns_size))?;
        let insns = read_x(base, &mut ix, insns_len).context(|| format!("{} code units of instructions", insns_size))?;

        let (tries, handlers, handlers_start) = if tries_size > 0 {
            if (insns_size & 1) != 0 {
                let padding = read_u2(base, &mut ix)?;
                if padding != 0 {
                    warn!("[codeitem] non-zero padding 0x{:04x} at 0x{:x} (code_item_start=0x{:x})", padding, ix - 2, off);
                }
            }
            let tries = read_x(base, &mut ix, tries_size as usize * TRY_ITEM_SIZE).context(|| format!("{} try items", tries_size))?;
            (tries, &base[ix..], ix)
        } else {
            (&base[0..0], &base[0..0], ix)
        };

        Ok(CodeItem { offset: off, registers_size, ins_size, outs_size, tries_size, debug_info_off, insns_size, insns, tries, handlers, handlers_start })
    }

    pub fn offset(&self) -> usize
    {
        self.offset
    }

    /// Raw little-endian instruction bytes.
    pub fn insns(&self) -> &'a [u8]
    {
        self.insns
    }

    pub fn code_unit(&self, pc: u32) -> Option<u16>
    {
        let i = pc as usize * 2;
        let b = self.insns.get(i..i + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn code_units(&self) -> Vec<u16>
    {
        self.insns.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()
    }

    pub fn tries(&self) -> impl Iterator<Item = TryItem> + 'a
    {
        self.tries.chunks_exact(TRY_ITEM_SIZE).map(|c| TryItem {
            start_addr: u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            insn_count: u16::from_le_bytes([c[4], c[5]]),
            handler_off: u16::from_le_bytes([c[6], c[7]]),
        })
    }

    /// Offset of the catch handler list within the base.
    pub fn handlers_start(&self) -> usize
    {
        self.handlers_start
    }

    /// Decode the catch handler list, returning `(offset within list, handler)`
    /// pairs and the list's size in bytes.
    pub fn catch_handlers(&self) -> Result<(Vec<(u32, EncodedCatchHandler)>, usize), DexError>
    {
        if self.tries_size == 0 {
            return Ok((vec![], 0));
        }
        let mut ix = 0;
        let count = read_uleb128(self.handlers, &mut ix).context(|| "encoded_catch_handler_list size".to_string())?;
        if count == 0 || count as usize > self.handlers.len() {
            fail!(BadCodeItem, "encoded_catch_handler_list size {} is implausible", count);
        }
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry_off = ix;
            let h = EncodedCatchHandler::read(self.handlers, &mut ix)
                .context(|| format!("EncodedCatchHandler #{}/{} at +0x{:x}", i + 1, count, entry_off))?;
            out.push((entry_off as u32, h));
        }
        Ok((out, ix))
    }

    /// Offset just past the end of the item, including the handler list.
    pub fn end_offset(&self) -> Result<usize, DexError>
    {
        let (_, handler_len) = self.catch_handlers()?;
        Ok(self.handlers_start + handler_len)
    }

    pub fn to_method_code(&self) -> Result<MethodCode, DexError>
    {
        let (_, len) = self.catch_handlers()?;
        Ok(MethodCode {
            registers_size: self.registers_size,
            ins_size: self.ins_size,
            outs_size: self.outs_size,
            insns: self.code_units(),
            tries: self.tries().collect(),
            handler_data: self.handlers[..len].to_vec(),
            debug_info: None,
        })
    }
}

impl<'a> TryTable for CodeItem<'a>
{
    fn tries_size(&self) -> u32
    {
        self.tries_size as u32
    }

    fn try_item(&self, i: u32) -> Option<TryItem>
    {
        let mut ix = i as usize * TRY_ITEM_SIZE;
        TryItem::read(self.tries, &mut ix).ok()
    }

    fn handler_data(&self) -> &[u8]
    {
        self.handlers
    }
}

/// A typed catch entry used when assembling a try region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchSpec
{
    /// `None` for a catch-all.
    pub type_idx: Option<u32>,
    pub address: u32,
}

/// Owned method body. The runtime executes these, the writer emits them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodCode
{
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
    pub handler_data: Vec<u8>,
    /// Encoded debug info stream, emitted after the code item by the writer.
    pub debug_info: Option<Vec<u8>>,
}

impl MethodCode
{
    pub fn new(registers_size: u16, ins_size: u16, insns: Vec<u16>) -> MethodCode
    {
        MethodCode { registers_size, ins_size, outs_size: 0, insns, ..Default::default() }
    }

    pub fn with_outs(mut self, outs_size: u16) -> MethodCode
    {
        self.outs_size = outs_size;
        self
    }

    pub fn with_debug_info(mut self, stream: Vec<u8>) -> MethodCode
    {
        self.debug_info = Some(stream);
        self
    }

    /// Attach try regions, given in ascending `start_addr` order. Regions
    /// with identical handler lists share one encoded handler.
    pub fn with_tries(mut self, regions: &[(u32, u16, Vec<CatchSpec>)]) -> MethodCode
    {
        let mut groups: Vec<(Vec<CatchSpec>, u16)> = vec![];
        let mut body = vec![];
        let mut offsets = vec![];
        for (_, _, handlers) in regions {
            if let Some((_, off)) = groups.iter().find(|(h, _)| h == handlers) {
                offsets.push(*off);
                continue;
            }
            let typed = handlers.iter().filter_map(|c| c.type_idx.map(|t| EncodedTypeAddrPair { type_idx: t, addr: c.address })).collect();
            let catch_all_addr = handlers.iter().find(|c| c.type_idx.is_none()).map(|c| c.address);
            offsets.push(body.len() as u16);
            groups.push((handlers.clone(), body.len() as u16));
            EncodedCatchHandler { handlers: typed, catch_all_addr }.write(&mut body);
        }

        // handler_off counts from the start of the list, so shift past the size prefix
        let mut data = vec![];
        write_uleb128(&mut data, groups.len() as u32);
        let prefix = data.len() as u16;
        data.extend_from_slice(&body);

        self.tries = regions.iter().zip(offsets)
            .map(|((start, count, _), off)| TryItem { start_addr: *start, insn_count: *count, handler_off: off + prefix })
            .collect();
        self.handler_data = data;
        self
    }

    /// Write the code item. The debug info offset is written as zero and its
    /// position returned so the caller can patch it.
    pub fn write(&self, bytes: &mut Vec<u8>) -> (usize, usize)
    {
        let mut c = 0;
        c += write_u2(bytes, self.registers_size);
        c += write_u2(bytes, self.ins_size);
        c += write_u2(bytes, self.outs_size);
        c += write_u2(bytes, self.tries.len() as u16);

        let debug_off_pos = bytes.len();
        c += write_u4(bytes, 0);

        c += write_u4(bytes, self.insns.len() as u32);
        for i in &self.insns { c += write_u2(bytes, *i); }

        if !self.tries.is_empty() {
            if (self.insns.len() & 1) != 0 {
                c += write_u2(bytes, 0);
            }
            for t in &self.tries { c += t.write(bytes); }
            bytes.extend_from_slice(&self.handler_data);
            c += self.handler_data.len();
        }
        (c, debug_off_pos)
    }
}

impl TryTable for MethodCode
{
    fn tries_size(&self) -> u32
    {
        self.tries.len() as u32
    }

    fn try_item(&self, i: u32) -> Option<TryItem>
    {
        self.tries.get(i as usize).copied()
    }

    fn handler_data(&self) -> &[u8]
    {
        &self.handler_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::DexErrorKind;

    #[test]
    fn test_try_item_roundtrip() {
        let t = TryItem { start_addr: 0x10, insn_count: 4, handler_off: 1 };
        let mut bytes = vec![];
        assert_eq!(t.write(&mut bytes), TRY_ITEM_SIZE);
        let mut ix = 0;
        assert_eq!(TryItem::read(&bytes, &mut ix).unwrap(), t);
        assert!(t.contains(0x13));
        assert!(!t.contains(0x14));
    }

    #[test]
    fn test_encoded_catch_handler_with_catch_all() {
        let h = EncodedCatchHandler {
            handlers: vec![EncodedTypeAddrPair { type_idx: 3, addr: 0x20 }],
            catch_all_addr: Some(0x30),
        };
        let mut bytes = vec![];
        h.write(&mut bytes);
        assert_eq!(bytes[0], 0x7f); // sleb128(-1)
        let mut ix = 0;
        assert_eq!(EncodedCatchHandler::read(&bytes, &mut ix).unwrap(), h);
        assert_eq!(ix, bytes.len());
    }

    #[test]
    fn code_item_view_matches_owned_form()
    {
        let code = MethodCode::new(3, 1, vec![0x0012, 0x0000, 0x000f])
            .with_tries(&[(0, 2, vec![CatchSpec { type_idx: Some(1), address: 2 }, CatchSpec { type_idx: None, address: 2 }])]);
        let mut bytes = vec![];
        code.write(&mut bytes);

        let view = CodeItem::read(&bytes, 0).unwrap();
        assert_eq!(view.insns_size, 3);
        assert_eq!(view.code_unit(2), Some(0x000f));
        assert_eq!(view.tries().count(), 1);
        assert_eq!(view.end_offset().unwrap(), bytes.len());
        assert_eq!(view.to_method_code().unwrap(), code);
    }

    #[test]
    fn truncated_instructions_are_rejected()
    {
        let code = MethodCode::new(1, 0, vec![0x000e, 0x000e]);
        let mut bytes = vec![];
        code.write(&mut bytes);
        bytes.truncate(bytes.len() - 1);
        assert_eq!(CodeItem::read(&bytes, 0).unwrap_err().kind(), DexErrorKind::BadOffset);
        assert_eq!(CodeItem::read(&bytes, 2).unwrap_err().kind(), DexErrorKind::BadCodeItem);
    }
}
