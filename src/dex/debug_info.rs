/* Debug info state machine: line positions and local variable ranges */

use crate::dex::error::{DexError, ResultExt};
use crate::dex::{read_sleb128, read_u1, read_uleb128, read_uleb128p1, write_sleb128, write_u1, write_uleb128, write_uleb128p1};

pub const DBG_END_SEQUENCE: u8 = 0x00;
pub const DBG_ADVANCE_PC: u8 = 0x01;
pub const DBG_ADVANCE_LINE: u8 = 0x02;
pub const DBG_START_LOCAL: u8 = 0x03;
pub const DBG_START_LOCAL_EXTENDED: u8 = 0x04;
pub const DBG_END_LOCAL: u8 = 0x05;
pub const DBG_RESTART_LOCAL: u8 = 0x06;
pub const DBG_SET_PROLOGUE_END: u8 = 0x07;
pub const DBG_SET_EPILOGUE_BEGIN: u8 = 0x08;
pub const DBG_SET_FILE: u8 = 0x09;
pub const DBG_FIRST_SPECIAL: u8 = 0x0a;
pub const DBG_LINE_BASE: i32 = -4;
pub const DBG_LINE_RANGE: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionEntry
{
    pub address: u32,
    pub line: u32,
    /// String index set by `DBG_SET_FILE`; `None` means the class's source file.
    pub source_file: Option<u32>,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEntry
{
    pub start: u32,
    pub end: u32,
    pub register: u16,
    pub name_idx: Option<u32>,
    /// Type index of the declared type.
    pub descriptor_idx: Option<u32>,
    pub signature_idx: Option<u32>,
}

/// What the local decoder needs to know about the owning method.
#[derive(Debug, Clone, Default)]
pub struct MethodLocalsInfo
{
    pub registers_size: u16,
    pub ins_size: u16,
    pub insns_size: u32,
    /// Declaring class type index, for instance methods.
    pub this_type: Option<u32>,
    /// Parameter type indices with a flag for wide (J/D) types.
    pub params: Vec<(u32, bool)>,
}

fn opt_index(v: i32) -> Option<u32>
{
    if v < 0 { None } else { Some(v as u32) }
}

/// A debug info item. Decoding always starts from the beginning of the stream.
#[derive(Debug, Clone)]
pub struct DebugInfoStream<'a>
{
    bytes: &'a [u8],
    offset: usize,
    pub line_start: u32,
    pub parameter_names: Vec<Option<u32>>,
    body: usize,
}

impl<'a> DebugInfoStream<'a>
{
    pub fn read(bytes: &'a [u8], off: usize) -> Result<DebugInfoStream<'a>, DexError>
    {
        let mut ix = off;
        let line_start = read_uleb128(bytes, &mut ix).context(|| format!("debug_info at 0x{:x}", off))?;
        let parameters_size = read_uleb128(bytes, &mut ix)?;
        if parameters_size as usize > bytes.len().saturating_sub(ix) {
            fail!(BadDebugInfo, "debug_info at 0x{:x} declares {} parameters", off, parameters_size);
        }
        let mut parameter_names = Vec::with_capacity(parameters_size as usize);
        for _ in 0..parameters_size {
            parameter_names.push(opt_index(read_uleb128p1(bytes, &mut ix)?));
        }
        Ok(DebugInfoStream { bytes, offset: off, line_start, parameter_names, body: ix })
    }

    pub fn offset(&self) -> usize
    {
        self.offset
    }

    /// Walk every opcode, calling `on_op` with the opcode and its operands.
    fn walk<F>(&self, mut on_op: F) -> Result<usize, DexError>
    where
        F: FnMut(u8, [i32; 4]) -> Result<bool, DexError>,
    {
        let b = self.bytes;
        let mut ix = self.body;
        loop {
            let op = read_u1(b, &mut ix).map_err(|_| err!(BadDebugInfo, "debug_info at 0x{:x} has no end sequence", self.offset))?;
            let args = match op {
                DBG_END_SEQUENCE => return Ok(ix - self.offset),
                DBG_ADVANCE_PC => [read_uleb128(b, &mut ix)? as i32, 0, 0, 0],
                DBG_ADVANCE_LINE => [read_sleb128(b, &mut ix)?, 0, 0, 0],
                DBG_START_LOCAL => [read_uleb128(b, &mut ix)? as i32, read_uleb128p1(b, &mut ix)?, read_uleb128p1(b, &mut ix)?, -1],
                DBG_START_LOCAL_EXTENDED => [
                    read_uleb128(b, &mut ix)? as i32,
                    read_uleb128p1(b, &mut ix)?,
                    read_uleb128p1(b, &mut ix)?,
                    read_uleb128p1(b, &mut ix)?,
                ],
                DBG_END_LOCAL | DBG_RESTART_LOCAL => [read_uleb128(b, &mut ix)? as i32, 0, 0, 0],
                DBG_SET_FILE => [read_uleb128p1(b, &mut ix)?, 0, 0, 0],
                _ => [0; 4],
            };
            if on_op(op, args)? {
                return Ok(ix - self.offset);
            }
        }
    }

    /// Size in bytes of the whole item, checked by decoding it.
    pub fn byte_size(&self) -> Result<usize, DexError>
    {
        self.walk(|_, _| Ok(false))
    }

    /// Emit position events. The visitor returns `true` to stop early.
    pub fn decode_positions<F>(&self, mut visitor: F) -> Result<(), DexError>
    where
        F: FnMut(&PositionEntry) -> bool,
    {
        let mut entry = PositionEntry { address: 0, line: self.line_start, source_file: None, prologue_end: false, epilogue_begin: false };
        self.walk(|op, args| {
            match op {
                DBG_ADVANCE_PC => entry.address = entry.address.wrapping_add(args[0] as u32),
                DBG_ADVANCE_LINE => entry.line = (entry.line as i32).wrapping_add(args[0]) as u32,
                DBG_SET_PROLOGUE_END => entry.prologue_end = true,
                DBG_SET_EPILOGUE_BEGIN => entry.epilogue_begin = true,
                DBG_SET_FILE => entry.source_file = opt_index(args[0]),
                DBG_START_LOCAL | DBG_START_LOCAL_EXTENDED | DBG_END_LOCAL | DBG_RESTART_LOCAL => {}
                _ => {
                    let adjusted = (op - DBG_FIRST_SPECIAL) as i32;
                    entry.address = entry.address.wrapping_add((adjusted / DBG_LINE_RANGE) as u32);
                    entry.line = (entry.line as i32).wrapping_add(DBG_LINE_BASE + adjusted % DBG_LINE_RANGE) as u32;
                    if visitor(&entry) {
                        return Ok(true);
                    }
                    entry.prologue_end = false;
                    entry.epilogue_begin = false;
                }
            }
            Ok(false)
        })?;
        Ok(())
    }

    /// Emit one event per completed local variable range, parameters included.
    pub fn decode_locals<F>(&self, method: &MethodLocalsInfo, mut visitor: F) -> Result<(), DexError>
    where
        F: FnMut(&LocalEntry),
    {
        let regs = method.registers_size as usize;
        let mut live: Vec<Option<LocalEntry>> = vec![None; regs];
        // last local seen per register, for DBG_RESTART_LOCAL
        let mut previous: Vec<Option<LocalEntry>> = vec![None; regs];
        let mut address = 0u32;

        let mut arg_reg = (method.registers_size as usize).saturating_sub(method.ins_size as usize);
        if let Some(this_type) = method.this_type {
            if arg_reg >= regs {
                fail!(BadDebugInfo, "no register for 'this' ({} registers, {} ins)", regs, method.ins_size);
            }
            live[arg_reg] = Some(LocalEntry { start: 0, end: 0, register: arg_reg as u16, name_idx: None, descriptor_idx: Some(this_type), signature_idx: None });
            arg_reg += 1;
        }
        for (i, (type_idx, wide)) in method.params.iter().enumerate() {
            if arg_reg >= regs {
                fail!(BadDebugInfo, "parameter {} has no register ({} registers)", i, regs);
            }
            let name_idx = self.parameter_names.get(i).copied().flatten();
            live[arg_reg] = Some(LocalEntry { start: 0, end: 0, register: arg_reg as u16, name_idx, descriptor_idx: Some(*type_idx), signature_idx: None });
            arg_reg += if *wide { 2 } else { 1 };
        }

        let check_reg = |r: i32| -> Result<usize, DexError> {
            if r < 0 || r as usize >= regs {
                Err(err!(BadDebugInfo, "register v{} out of range ({} registers)", r, regs))
            } else {
                Ok(r as usize)
            }
        };

        self.walk(|op, args| {
            match op {
                DBG_ADVANCE_PC => address = address.wrapping_add(args[0] as u32),
                DBG_START_LOCAL | DBG_START_LOCAL_EXTENDED => {
                    let r = check_reg(args[0])?;
                    if let Some(mut old) = live[r].take() {
                        old.end = address;
                        visitor(&old);
                        previous[r] = Some(old);
                    }
                    live[r] = Some(LocalEntry {
                        start: address,
                        end: 0,
                        register: r as u16,
                        name_idx: opt_index(args[1]),
                        descriptor_idx: opt_index(args[2]),
                        signature_idx: opt_index(args[3]),
                    });
                }
                DBG_END_LOCAL => {
                    let r = check_reg(args[0])?;
                    if let Some(mut old) = live[r].take() {
                        old.end = address;
                        visitor(&old);
                        previous[r] = Some(old);
                    }
                }
                DBG_RESTART_LOCAL => {
                    let r = check_reg(args[0])?;
                    if live[r].is_none() {
                        if let Some(prev) = previous[r] {
                            live[r] = Some(LocalEntry { start: address, end: 0, ..prev });
                        }
                    }
                }
                DBG_ADVANCE_LINE | DBG_SET_PROLOGUE_END | DBG_SET_EPILOGUE_BEGIN | DBG_SET_FILE => {}
                _ => {
                    let adjusted = (op - DBG_FIRST_SPECIAL) as i32;
                    address = address.wrapping_add((adjusted / DBG_LINE_RANGE) as u32);
                }
            }
            Ok(false)
        })?;

        for slot in live.iter_mut() {
            if let Some(mut l) = slot.take() {
                l.end = method.insns_size;
                visitor(&l);
            }
        }
        Ok(())
    }

    /// Line number for `dex_pc`: the last position entry at or before it.
    pub fn line_for_pc(&self, dex_pc: u32) -> Result<Option<u32>, DexError>
    {
        let mut line = None;
        self.decode_positions(|p| {
            if p.address > dex_pc {
                return true;
            }
            line = Some(p.line);
            false
        })?;
        Ok(line)
    }
}

/// Writer for debug info streams.
#[derive(Debug, Clone, Default)]
pub struct DebugInfoBuilder
{
    bytes: Vec<u8>,
    address: u32,
    line: u32,
}

impl DebugInfoBuilder
{
    pub fn new(line_start: u32, parameter_names: &[Option<u32>]) -> DebugInfoBuilder
    {
        let mut bytes = vec![];
        write_uleb128(&mut bytes, line_start);
        write_uleb128(&mut bytes, parameter_names.len() as u32);
        for p in parameter_names {
            write_uleb128p1(&mut bytes, p.map_or(-1, |v| v as i32));
        }
        DebugInfoBuilder { bytes, address: 0, line: line_start }
    }

    /// Emit a position row at `address` / `line`, using a special opcode when possible.
    pub fn position(mut self, address: u32, line: u32) -> Self
    {
        let addr_delta = address.wrapping_sub(self.address) as i32;
        let mut line_delta = line as i32 - self.line as i32;
        if !(DBG_LINE_BASE..DBG_LINE_BASE + DBG_LINE_RANGE).contains(&line_delta) {
            write_u1(&mut self.bytes, DBG_ADVANCE_LINE);
            write_sleb128(&mut self.bytes, line_delta);
            line_delta = 0;
        }
        let mut special = (line_delta - DBG_LINE_BASE) + addr_delta * DBG_LINE_RANGE + DBG_FIRST_SPECIAL as i32;
        if special > 0xff {
            write_u1(&mut self.bytes, DBG_ADVANCE_PC);
            write_uleb128(&mut self.bytes, addr_delta as u32);
            special = (line_delta - DBG_LINE_BASE) + DBG_FIRST_SPECIAL as i32;
        }
        write_u1(&mut self.bytes, special as u8);
        self.address = address;
        self.line = line;
        self
    }

    pub fn advance_pc(mut self, delta: u32) -> Self
    {
        write_u1(&mut self.bytes, DBG_ADVANCE_PC);
        write_uleb128(&mut self.bytes, delta);
        self.address += delta;
        self
    }

    pub fn start_local(mut self, register: u16, name_idx: Option<u32>, type_idx: Option<u32>, signature_idx: Option<u32>) -> Self
    {
        write_u1(&mut self.bytes, if signature_idx.is_some() { DBG_START_LOCAL_EXTENDED } else { DBG_START_LOCAL });
        write_uleb128(&mut self.bytes, register as u32);
        write_uleb128p1(&mut self.bytes, name_idx.map_or(-1, |v| v as i32));
        write_uleb128p1(&mut self.bytes, type_idx.map_or(-1, |v| v as i32));
        if let Some(s) = signature_idx {
            write_uleb128p1(&mut self.bytes, s as i32);
        }
        self
    }

    pub fn end_local(mut self, register: u16) -> Self
    {
        write_u1(&mut self.bytes, DBG_END_LOCAL);
        write_uleb128(&mut self.bytes, register as u32);
        self
    }

    pub fn restart_local(mut self, register: u16) -> Self
    {
        write_u1(&mut self.bytes, DBG_RESTART_LOCAL);
        write_uleb128(&mut self.bytes, register as u32);
        self
    }

    pub fn prologue_end(mut self) -> Self
    {
        write_u1(&mut self.bytes, DBG_SET_PROLOGUE_END);
        self
    }

    pub fn epilogue_begin(mut self) -> Self
    {
        write_u1(&mut self.bytes, DBG_SET_EPILOGUE_BEGIN);
        self
    }

    pub fn set_file(mut self, name_idx: Option<u32>) -> Self
    {
        write_u1(&mut self.bytes, DBG_SET_FILE);
        write_uleb128p1(&mut self.bytes, name_idx.map_or(-1, |v| v as i32));
        self
    }

    pub fn finish(mut self) -> Vec<u8>
    {
        write_u1(&mut self.bytes, DBG_END_SEQUENCE);
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::error::DexErrorKind;

    #[test]
    fn positions_follow_special_opcodes()
    {
        let stream = DebugInfoBuilder::new(10, &[Some(4)])
            .prologue_end()
            .position(0, 10)
            .position(3, 12)
            .position(40, 200)
            .epilogue_begin()
            .position(41, 201)
            .finish();
        let info = DebugInfoStream::read(&stream, 0).unwrap();
        assert_eq!(info.parameter_names, vec![Some(4)]);

        let mut rows = vec![];
        info.decode_positions(|p| {
            rows.push((p.address, p.line, p.prologue_end, p.epilogue_begin));
            false
        }).unwrap();
        assert_eq!(rows, vec![(0, 10, true, false), (3, 12, false, false), (40, 200, false, false), (41, 201, false, true)]);
        assert_eq!(info.line_for_pc(39).unwrap(), Some(12));
        assert_eq!(info.byte_size().unwrap(), stream.len());
    }

    #[test]
    fn locals_cover_parameters_and_restarts()
    {
        // static method, 3 registers, one int parameter in v2
        let stream = DebugInfoBuilder::new(1, &[Some(7)])
            .advance_pc(2)
            .start_local(0, Some(8), Some(1), None)
            .advance_pc(2)
            .end_local(0)
            .advance_pc(1)
            .restart_local(0)
            .finish();
        let info = DebugInfoStream::read(&stream, 0).unwrap();
        let method = MethodLocalsInfo { registers_size: 3, ins_size: 1, insns_size: 9, this_type: None, params: vec![(1, false)] };
        let mut locals = vec![];
        info.decode_locals(&method, |l| locals.push(*l)).unwrap();
        locals.sort_by_key(|l| (l.start, l.register));

        assert_eq!(locals.len(), 3);
        assert_eq!((locals[0].register, locals[0].start, locals[0].end, locals[0].name_idx), (2, 0, 9, Some(7)));
        assert_eq!((locals[1].register, locals[1].start, locals[1].end, locals[1].name_idx), (0, 2, 4, Some(8)));
        assert_eq!((locals[2].register, locals[2].start, locals[2].end, locals[2].name_idx), (0, 5, 9, Some(8)));
    }

    #[test]
    fn absent_names_decode_to_none()
    {
        let stream = DebugInfoBuilder::new(1, &[None, Some(0)]).finish();
        let info = DebugInfoStream::read(&stream, 0).unwrap();
        assert_eq!(info.parameter_names, vec![None, Some(0)]);
    }

    #[test]
    fn malformed_streams_are_rejected()
    {
        let mut stream = DebugInfoBuilder::new(1, &[]).start_local(9, None, None, None).finish();
        let info = DebugInfoStream::read(&stream, 0).unwrap();
        let method = MethodLocalsInfo { registers_size: 2, ..Default::default() };
        assert_eq!(info.decode_locals(&method, |_| {}).unwrap_err().kind(), DexErrorKind::BadDebugInfo);

        stream.pop();
        let info = DebugInfoStream::read(&stream, 0).unwrap();
        assert_eq!(info.byte_size().unwrap_err().kind(), DexErrorKind::BadDebugInfo);
    }
}
