/* Structural verifier: every offset, size and index checked before a view is handed out */

use std::collections::HashSet;
use std::ops::Range;

use log::{debug, warn};
use rangemap::RangeMap;
use sha1::{Digest, Sha1};

use crate::dex::code_item::CodeItem;
use crate::dex::container::LoadOptions;
use crate::dex::debug_info::DebugInfoStream;
use crate::dex::dex_file::*;
use crate::dex::error::{DexError, ResultExt};
use crate::dex::header::{ENDIAN_CONSTANT, REVERSE_ENDIAN_CONSTANT, SIGNATURE_END, SIGNATURE_OFFSET};
use crate::dex::NO_INDEX;

/// Adler32 over everything after the checksum field.
pub fn compute_checksum(file: &[u8]) -> u32
{
    adler::adler32_slice(file.get(SIGNATURE_OFFSET..).unwrap_or(&[]))
}

/// SHA-1 over everything after the signature field.
pub fn compute_signature(file: &[u8]) -> [u8; 20]
{
    let mut hasher = Sha1::new();
    hasher.update(file.get(SIGNATURE_END..).unwrap_or(&[]));
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Verify one dex view. Nothing past this point re-checks structure.
pub fn verify(dex: &DexFile, options: &LoadOptions) -> Result<(), DexError>
{
    let mut v = Verifier::new(dex, options)?;
    v.check_header()?;
    v.check_checksums()?;
    v.check_map_list()?;
    v.check_string_ids()?;
    v.check_type_ids()?;
    v.check_proto_ids()?;
    v.check_field_ids()?;
    v.check_method_ids()?;
    v.check_class_defs()?;
    debug!(
        "verified dex v{} at 0x{:x}: {} strings, {} types, {} methods, {} classes, {} code items",
        dex.version(), dex.begin_offset(), dex.num_string_ids(), dex.num_type_ids(),
        dex.num_method_ids(), dex.num_class_defs(), v.code_items.len()
    );
    Ok(())
}

struct Verifier<'d, 'a>
{
    dex: &'d DexFile<'a>,
    options: &'d LoadOptions,
    /// Bytes of this file, from its header.
    file: &'a [u8],
    /// Data section, relative to the data base.
    data: Range<usize>,
    code_items: HashSet<u32>,
}

impl<'d, 'a> Verifier<'d, 'a>
{
    fn new(dex: &'d DexFile<'a>, options: &'d LoadOptions) -> Result<Self, DexError>
    {
        let h = dex.header();
        let available = dex.container().len() - dex.begin_offset();
        if (h.file_size as usize) > available {
            fail!(BadSize, "file_size 0x{:x} exceeds the 0x{:x} bytes available", h.file_size, available);
        }
        let file = dex.begin();
        let data = dex.data_section();
        let (data_start, data_end) = (data.start as u64, data.end as u64);
        let data_limit = if h.is_container() { dex.data_base().len() as u64 } else { file.len() as u64 };
        if data_end > data_limit {
            fail!(BadOffset, "data section 0x{:x}..0x{:x} extends past 0x{:x}", data_start, data_end, data_limit);
        }
        Ok(Verifier { dex, options, file, data: data_start as usize..data_end as usize, code_items: HashSet::new() })
    }

    fn in_data(&self, what: &str, off: u32, len: usize) -> Result<(), DexError>
    {
        let start = off as usize;
        let end = start.checked_add(len).ok_or_else(|| err!(BadOffset, "{} at 0x{:x} overflows", what, off))?;
        if start < self.data.start || end > self.data.end {
            fail!(BadOffset, "{} at 0x{:x}..0x{:x} outside data section 0x{:x}..0x{:x}", what, start, end, self.data.start, self.data.end);
        }
        Ok(())
    }

    fn check_header(&self) -> Result<(), DexError>
    {
        let h = self.dex.header();
        if h.endian_tag == REVERSE_ENDIAN_CONSTANT {
            fail!(BadMagic, "big-endian dex files are not supported");
        }
        if h.endian_tag != ENDIAN_CONSTANT {
            fail!(BadMagic, "unexpected endian tag 0x{:08x}", h.endian_tag);
        }
        if h.header_size != h.expected_header_size() {
            fail!(BadSize, "header_size 0x{:x} does not match version {} (expected 0x{:x})", h.header_size, h.version(), h.expected_header_size());
        }
        if h.file_size < h.header_size {
            fail!(BadSize, "file_size 0x{:x} smaller than header", h.file_size);
        }
        if h.is_container() {
            if h.file_size > h.container_size {
                fail!(BadSize, "file_size 0x{:x} exceeds container_size 0x{:x}", h.file_size, h.container_size);
            }
            if h.header_offset as usize != self.dex.begin_offset() {
                fail!(BadOffset, "header_offset 0x{:x} but header found at 0x{:x}", h.header_offset, self.dex.begin_offset());
            }
            if h.container_size as usize > self.dex.container().len() {
                fail!(BadSize, "container_size 0x{:x} exceeds the 0x{:x} bytes available", h.container_size, self.dex.container().len());
            }
        }

        let tables = [
            ("link", h.link_size, h.link_off, 1),
            ("string_ids", h.string_ids_size, h.string_ids_off, STRING_ID_ITEM_SIZE),
            ("type_ids", h.type_ids_size, h.type_ids_off, TYPE_ID_ITEM_SIZE),
            ("proto_ids", h.proto_ids_size, h.proto_ids_off, PROTO_ID_ITEM_SIZE),
            ("field_ids", h.field_ids_size, h.field_ids_off, FIELD_ID_ITEM_SIZE),
            ("method_ids", h.method_ids_size, h.method_ids_off, METHOD_ID_ITEM_SIZE),
            ("class_defs", h.class_defs_size, h.class_defs_off, CLASS_DEF_ITEM_SIZE),
        ];
        for (name, size, off, stride) in tables {
            if size == 0 {
                continue;
            }
            if h.type_ids_size > 65536 && name == "type_ids" {
                fail!(BadSize, "{} type ids cannot be addressed by 16-bit indices", h.type_ids_size);
            }
            let end = off as u64 + size as u64 * stride as u64;
            if (off as u64) < h.header_size as u64 || end > h.file_size as u64 {
                fail!(BadOffset, "{} table 0x{:x}+{}x{} outside file of 0x{:x} bytes", name, off, size, stride, h.file_size);
            }
            if name != "link" && off % 4 != 0 {
                fail!(BadOffset, "{} table at 0x{:x} is not 4-byte aligned", name, off);
            }
        }
        Ok(())
    }

    fn check_checksums(&self) -> Result<(), DexError>
    {
        let h = self.dex.header();
        let actual = compute_checksum(self.file);
        if actual != h.checksum {
            if self.options.verify_checksum {
                fail!(BadChecksum, "checksum 0x{:08x} does not match computed 0x{:08x}", h.checksum, actual);
            }
            warn!("dex at 0x{:x}: checksum 0x{:08x} does not match computed 0x{:08x}", self.dex.begin_offset(), h.checksum, actual);
        }
        if self.options.verify_signature && compute_signature(self.file) != h.signature {
            fail!(BadSignature, "SHA-1 signature does not match file contents");
        }
        Ok(())
    }

    fn check_map_list(&self) -> Result<(), DexError>
    {
        let h = self.dex.header();
        if h.map_off == 0 || h.map_off % 4 != 0 {
            fail!(BadMapList, "map_off 0x{:x} is missing or misaligned", h.map_off);
        }
        let map = self.dex.map_list()?;
        self.in_data("map_list", h.map_off, 4 + map.len() * MAP_ITEM_SIZE as usize)?;

        let mut seen = HashSet::new();
        let mut last_off: Option<u32> = None;
        let mut fixed: RangeMap<u64, u16> = RangeMap::new();
        for item in map.iter() {
            let Some(t) = MapItemType::from_code(item.item_type) else {
                fail!(BadMapList, "unknown map item type 0x{:04x}", item.item_type);
            };
            if !seen.insert(item.item_type) {
                fail!(BadMapList, "map item type {:?} listed twice", t);
            }
            if let Some(prev) = last_off {
                if item.offset <= prev {
                    fail!(BadMapList, "map item {:?} at 0x{:x} is out of order", t, item.offset);
                }
            }
            last_off = Some(item.offset);
            if item.size == 0 {
                fail!(BadMapList, "map item {:?} has size 0", t);
            }

            let stride = match t {
                MapItemType::HeaderItem => h.header_size,
                MapItemType::StringIdItem => STRING_ID_ITEM_SIZE,
                MapItemType::TypeIdItem => TYPE_ID_ITEM_SIZE,
                MapItemType::ProtoIdItem => PROTO_ID_ITEM_SIZE,
                MapItemType::FieldIdItem => FIELD_ID_ITEM_SIZE,
                MapItemType::MethodIdItem => METHOD_ID_ITEM_SIZE,
                MapItemType::ClassDefItem => CLASS_DEF_ITEM_SIZE,
                MapItemType::CallSiteIdItem => CALL_SITE_ID_ITEM_SIZE,
                MapItemType::MethodHandleItem => METHOD_HANDLE_ITEM_SIZE,
                _ => 0,
            };
            if stride != 0 {
                let range = item.offset as u64..item.offset as u64 + item.size as u64 * stride as u64;
                if fixed.overlaps(&range) {
                    fail!(BadMapList, "map item {:?} at 0x{:x} overlaps another section", t, item.offset);
                }
                fixed.insert(range, item.item_type);
            } else if t != MapItemType::MapList {
                self.in_data("map item", item.offset, 1).context(|| format!("{:?}", t))?;
            }
        }

        let expected = [
            (MapItemType::HeaderItem, 1, 0),
            (MapItemType::StringIdItem, h.string_ids_size, h.string_ids_off),
            (MapItemType::TypeIdItem, h.type_ids_size, h.type_ids_off),
            (MapItemType::ProtoIdItem, h.proto_ids_size, h.proto_ids_off),
            (MapItemType::FieldIdItem, h.field_ids_size, h.field_ids_off),
            (MapItemType::MethodIdItem, h.method_ids_size, h.method_ids_off),
            (MapItemType::ClassDefItem, h.class_defs_size, h.class_defs_off),
            (MapItemType::MapList, 1, h.map_off),
        ];
        for (t, size, off) in expected {
            match map.find(t) {
                Some(item) if size == 0 => fail!(BadMapList, "map lists {:?} with {} entries but header has none", t, item.size),
                Some(item) if item.size != size || item.offset != off => fail!(
                    BadMapList,
                    "map entry {:?} (0x{:x} x{}) disagrees with header (0x{:x} x{})",
                    t, item.offset, item.size, off, size
                ),
                None if size != 0 => fail!(BadMapList, "map list is missing {:?}", t),
                _ => {}
            }
        }
        Ok(())
    }

    fn check_string_ids(&self) -> Result<(), DexError>
    {
        let mut prev: Option<&[u8]> = None;
        for i in 0..self.dex.num_string_ids() {
            let id = self.dex.string_id(i)?;
            self.in_data("string_data", id.string_data_off, 1).context(|| format!("string_id #{}", i))?;
            let (_, bytes) = self.dex.string_data(i)?;
            let end = id.string_data_off as usize + bytes.len();
            if end >= self.data.end {
                fail!(BadOffset, "string_id #{} data runs past the data section", i);
            }
            if cesu8::from_java_cesu8(bytes).is_err() {
                fail!(BadUtf8, "string_id #{} is not valid modified utf-8", i);
            }
            if let Some(p) = prev {
                if p >= bytes {
                    fail!(BadIndex, "string_id #{} is out of order", i);
                }
            }
            prev = Some(bytes);
        }
        Ok(())
    }

    fn check_string_idx(&self, what: &str, idx: u32) -> Result<(), DexError>
    {
        if idx >= self.dex.num_string_ids() {
            fail!(BadIndex, "{} string index {} out of range ({} strings)", what, idx, self.dex.num_string_ids());
        }
        Ok(())
    }

    fn check_type_idx(&self, what: &str, idx: u32) -> Result<(), DexError>
    {
        if idx >= self.dex.num_type_ids() {
            fail!(BadIndex, "{} type index {} out of range ({} types)", what, idx, self.dex.num_type_ids());
        }
        Ok(())
    }

    fn check_type_list(&self, what: &str, off: u32) -> Result<(), DexError>
    {
        if off == 0 {
            return Ok(());
        }
        if off % 4 != 0 {
            fail!(BadOffset, "{} type list at 0x{:x} is misaligned", what, off);
        }
        let list = self.dex.type_list_at(off).context(|| what.to_string())?;
        self.in_data(what, off, list.byte_size())?;
        for t in list.iter() {
            self.check_type_idx(what, t as u32)?;
        }
        Ok(())
    }

    fn check_type_ids(&self) -> Result<(), DexError>
    {
        let mut prev = None;
        for i in 0..self.dex.num_type_ids() {
            let t = self.dex.type_id(i)?;
            self.check_string_idx(&format!("type_id #{}", i), t.descriptor_idx)?;
            if prev.map_or(false, |p| p >= t.descriptor_idx) {
                fail!(BadIndex, "type_id #{} is out of order", i);
            }
            prev = Some(t.descriptor_idx);
        }
        Ok(())
    }

    fn check_proto_ids(&self) -> Result<(), DexError>
    {
        for i in 0..self.dex.num_proto_ids() {
            let p = self.dex.proto_id(i)?;
            let what = format!("proto_id #{}", i);
            self.check_string_idx(&what, p.shorty_idx)?;
            self.check_type_idx(&what, p.return_type_idx)?;
            self.check_type_list(&what, p.parameters_off)?;
        }
        Ok(())
    }

    fn check_field_ids(&self) -> Result<(), DexError>
    {
        let mut prev_class = 0u16;
        for i in 0..self.dex.num_field_ids() {
            let f = self.dex.field_id(i)?;
            let what = format!("field_id #{}", i);
            self.check_type_idx(&what, f.class_idx as u32)?;
            self.check_type_idx(&what, f.type_idx as u32)?;
            self.check_string_idx(&what, f.name_idx)?;
            if f.class_idx < prev_class {
                fail!(BadIndex, "field_id #{} is out of order", i);
            }
            prev_class = f.class_idx;
        }
        Ok(())
    }

    fn check_method_ids(&self) -> Result<(), DexError>
    {
        let mut prev_class = 0u16;
        for i in 0..self.dex.num_method_ids() {
            let m = self.dex.method_id(i)?;
            let what = format!("method_id #{}", i);
            self.check_type_idx(&what, m.class_idx as u32)?;
            if m.proto_idx as u32 >= self.dex.num_proto_ids() {
                fail!(BadIndex, "{} proto index {} out of range", what, m.proto_idx);
            }
            self.check_string_idx(&what, m.name_idx)?;
            if m.class_idx < prev_class {
                fail!(BadIndex, "method_id #{} is out of order", i);
            }
            prev_class = m.class_idx;
        }
        Ok(())
    }

    fn check_class_defs(&mut self) -> Result<(), DexError>
    {
        for i in 0..self.dex.num_class_defs() {
            let def = self.dex.class_def(i)?;
            let what = format!("class_def #{}", i);
            self.check_type_idx(&what, def.class_idx)?;
            if def.superclass_idx != NO_INDEX {
                self.check_type_idx(&what, def.superclass_idx)?;
            }
            if def.source_file_idx != NO_INDEX {
                self.check_string_idx(&what, def.source_file_idx)?;
            }
            self.check_type_list(&what, def.interfaces_off)?;
            if def.annotations_off != 0 {
                self.in_data("annotations_directory", def.annotations_off, 16).context(|| what.clone())?;
            }
            if def.static_values_off != 0 {
                self.in_data("static_values", def.static_values_off, 1).context(|| what.clone())?;
            }
            if def.class_data_off != 0 {
                self.in_data("class_data", def.class_data_off, 4).context(|| what.clone())?;
                self.check_class_data(i).context(|| what.clone())?;
            }
        }
        Ok(())
    }

    fn check_class_data(&mut self, class_def_idx: u32) -> Result<(), DexError>
    {
        let Some(members) = self.dex.class_data(class_def_idx)? else {
            return Ok(());
        };
        let mut end = 0;
        let mut it = members;
        while let Some(m) = it.next() {
            let m = m?;
            if m.kind.is_method() {
                if m.index >= self.dex.num_method_ids() {
                    fail!(BadIndex, "method index {} out of range", m.index);
                }
                if m.code_off != 0 {
                    self.check_code_item(m.code_off).context(|| format!("method_id #{}", m.index))?;
                }
            } else if m.index >= self.dex.num_field_ids() {
                fail!(BadIndex, "field index {} out of range", m.index);
            }
            end = it.position();
        }
        if end > self.data.end {
            fail!(BadOffset, "class_data runs past the data section");
        }
        Ok(())
    }

    fn check_code_item(&mut self, off: u32) -> Result<(), DexError>
    {
        if !self.code_items.insert(off) {
            return Ok(());
        }
        self.in_data("code_item", off, 16)?;
        let code: CodeItem = self.dex.code_item_at(off)?;
        let (handlers, _) = code.catch_handlers()?;
        let end = code.end_offset()?;
        if end > self.data.end {
            fail!(BadOffset, "code_item at 0x{:x} ends at 0x{:x}, past the data section", off, end);
        }

        let mut prev_end = 0u32;
        for (i, t) in code.tries().enumerate() {
            if t.insn_count == 0 {
                fail!(BadCodeItem, "try item #{} is empty", i);
            }
            if t.start_addr < prev_end {
                fail!(BadCodeItem, "try item #{} overlaps or is out of order", i);
            }
            if t.end_addr() > code.insns_size {
                fail!(BadCodeItem, "try item #{} ends at {} past {} code units", i, t.end_addr(), code.insns_size);
            }
            if !handlers.iter().any(|(o, _)| *o == t.handler_off as u32) {
                fail!(BadCodeItem, "try item #{} handler offset {} does not start a handler", i, t.handler_off);
            }
            prev_end = t.end_addr();
        }
        for (o, h) in &handlers {
            for p in &h.handlers {
                self.check_type_idx("catch handler", p.type_idx)?;
                if p.addr >= code.insns_size {
                    fail!(BadCodeItem, "handler at +{} targets {} past {} code units", o, p.addr, code.insns_size);
                }
            }
            if let Some(a) = h.catch_all_addr {
                if a >= code.insns_size {
                    fail!(BadCodeItem, "catch-all at +{} targets {} past {} code units", o, a, code.insns_size);
                }
            }
        }

        if code.debug_info_off != 0 {
            self.in_data("debug_info", code.debug_info_off, 1)?;
            let info = DebugInfoStream::read(self.dex.data_base(), code.debug_info_off as usize)?;
            let size = info.byte_size()?;
            self.in_data("debug_info", code.debug_info_off, size)?;
        }
        Ok(())
    }
}
