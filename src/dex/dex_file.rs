/* Zero-copy view over one dex file inside a container byte range */

use std::cmp::Ordering;
use std::fmt;

use crate::dex::class_data::{ClassDataIterator, HiddenapiFlags};
use crate::dex::code_item::CodeItem;
use crate::dex::debug_info::{DebugInfoStream, MethodLocalsInfo};
use crate::dex::error::{DexError, ResultExt};
use crate::dex::header::Header;
use crate::dex::{read_u2, read_u4, read_uleb128, read_x, NO_INDEX};

/* Access flags */
pub const ACC_PUBLIC: u32 = 0x1;
pub const ACC_PRIVATE: u32 = 0x2;
pub const ACC_PROTECTED: u32 = 0x4;
pub const ACC_STATIC: u32 = 0x8;
pub const ACC_FINAL: u32 = 0x10;
pub const ACC_SYNCHRONIZED: u32 = 0x20;
pub const ACC_VOLATILE: u32 = 0x40;
pub const ACC_BRIDGE: u32 = 0x40;
pub const ACC_TRANSIENT: u32 = 0x80;
pub const ACC_VARARGS: u32 = 0x80;
pub const ACC_NATIVE: u32 = 0x100;
pub const ACC_INTERFACE: u32 = 0x200;
pub const ACC_ABSTRACT: u32 = 0x400;
pub const ACC_STRICT: u32 = 0x800;
pub const ACC_SYNTHETIC: u32 = 0x1000;
pub const ACC_ANNOTATION: u32 = 0x2000;
pub const ACC_ENUM: u32 = 0x4000;
pub const ACC_CONSTRUCTOR: u32 = 0x10000;
pub const ACC_DECLARED_SYNCHRONIZED: u32 = 0x20000;

pub const STRING_ID_ITEM_SIZE: u32 = 4;
pub const TYPE_ID_ITEM_SIZE: u32 = 4;
pub const PROTO_ID_ITEM_SIZE: u32 = 12;
pub const FIELD_ID_ITEM_SIZE: u32 = 8;
pub const METHOD_ID_ITEM_SIZE: u32 = 8;
pub const CLASS_DEF_ITEM_SIZE: u32 = 32;
pub const MAP_ITEM_SIZE: u32 = 12;
pub const CALL_SITE_ID_ITEM_SIZE: u32 = 4;
pub const METHOD_HANDLE_ITEM_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapItemType
{
    HeaderItem,
    StringIdItem,
    TypeIdItem,
    ProtoIdItem,
    FieldIdItem,
    MethodIdItem,
    ClassDefItem,
    CallSiteIdItem,
    MethodHandleItem,
    MapList,
    TypeList,
    AnnotationSetRefList,
    AnnotationSetItem,
    ClassDataItem,
    CodeItem,
    StringDataItem,
    DebugInfoItem,
    AnnotationItem,
    EncodedArrayItem,
    AnnotationsDirectoryItem,
    HiddenapiClassData,
}

impl MapItemType
{
    pub fn from_code(code: u16) -> Option<MapItemType>
    {
        Some(match code {
            0x0000 => MapItemType::HeaderItem,
            0x0001 => MapItemType::StringIdItem,
            0x0002 => MapItemType::TypeIdItem,
            0x0003 => MapItemType::ProtoIdItem,
            0x0004 => MapItemType::FieldIdItem,
            0x0005 => MapItemType::MethodIdItem,
            0x0006 => MapItemType::ClassDefItem,
            0x0007 => MapItemType::CallSiteIdItem,
            0x0008 => MapItemType::MethodHandleItem,
            0x1000 => MapItemType::MapList,
            0x1001 => MapItemType::TypeList,
            0x1002 => MapItemType::AnnotationSetRefList,
            0x1003 => MapItemType::AnnotationSetItem,
            0x2000 => MapItemType::ClassDataItem,
            0x2001 => MapItemType::CodeItem,
            0x2002 => MapItemType::StringDataItem,
            0x2003 => MapItemType::DebugInfoItem,
            0x2004 => MapItemType::AnnotationItem,
            0x2005 => MapItemType::EncodedArrayItem,
            0x2006 => MapItemType::AnnotationsDirectoryItem,
            0xF000 => MapItemType::HiddenapiClassData,
            _ => return None,
        })
    }

    pub fn code(&self) -> u16
    {
        match self {
            MapItemType::HeaderItem => 0x0000,
            MapItemType::StringIdItem => 0x0001,
            MapItemType::TypeIdItem => 0x0002,
            MapItemType::ProtoIdItem => 0x0003,
            MapItemType::FieldIdItem => 0x0004,
            MapItemType::MethodIdItem => 0x0005,
            MapItemType::ClassDefItem => 0x0006,
            MapItemType::CallSiteIdItem => 0x0007,
            MapItemType::MethodHandleItem => 0x0008,
            MapItemType::MapList => 0x1000,
            MapItemType::TypeList => 0x1001,
            MapItemType::AnnotationSetRefList => 0x1002,
            MapItemType::AnnotationSetItem => 0x1003,
            MapItemType::ClassDataItem => 0x2000,
            MapItemType::CodeItem => 0x2001,
            MapItemType::StringDataItem => 0x2002,
            MapItemType::DebugInfoItem => 0x2003,
            MapItemType::AnnotationItem => 0x2004,
            MapItemType::EncodedArrayItem => 0x2005,
            MapItemType::AnnotationsDirectoryItem => 0x2006,
            MapItemType::HiddenapiClassData => 0xF000,
        }
    }

    /// Items that live in the header-relative id area rather than the data section.
    pub fn is_id_section(&self) -> bool
    {
        (self.code() & 0xF000) == 0 || matches!(self, MapItemType::HeaderItem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapItem
{
    pub item_type: u16,
    pub size: u32,
    pub offset: u32,
}

/// The map list: one entry per section, sorted by offset.
#[derive(Debug, Clone, Copy)]
pub struct MapList<'a>
{
    bytes: &'a [u8],
    count: u32,
}

impl<'a> MapList<'a>
{
    pub fn len(&self) -> usize
    {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool
    {
        self.count == 0
    }

    pub fn get(&self, i: usize) -> Option<MapItem>
    {
        if i >= self.len() {
            return None;
        }
        let mut ix = 4 + i * MAP_ITEM_SIZE as usize;
        let item_type = read_u2(self.bytes, &mut ix).ok()?;
        ix += 2;
        let size = read_u4(self.bytes, &mut ix).ok()?;
        let offset = read_u4(self.bytes, &mut ix).ok()?;
        Some(MapItem { item_type, size, offset })
    }

    pub fn iter(&self) -> impl Iterator<Item = MapItem> + 'a
    {
        let copy = *self;
        (0..copy.len()).filter_map(move |i| copy.get(i))
    }

    pub fn find(&self, t: MapItemType) -> Option<MapItem>
    {
        self.iter().find(|m| m.item_type == t.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringId
{
    pub string_data_off: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeId
{
    pub descriptor_idx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoId
{
    pub shorty_idx: u32,
    pub return_type_idx: u32,
    pub parameters_off: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId
{
    pub class_idx: u16,
    pub type_idx: u16,
    pub name_idx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodId
{
    pub class_idx: u16,
    pub proto_idx: u16,
    pub name_idx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassDef
{
    pub class_idx: u32,
    pub access_flags: u32,
    pub superclass_idx: u32,
    pub interfaces_off: u32,
    pub source_file_idx: u32,
    pub annotations_off: u32,
    pub class_data_off: u32,
    pub static_values_off: u32,
}

impl ClassDef
{
    pub fn superclass(&self) -> Option<u32>
    {
        if self.superclass_idx == NO_INDEX { None } else { Some(self.superclass_idx) }
    }

    pub fn source_file(&self) -> Option<u32>
    {
        if self.source_file_idx == NO_INDEX { None } else { Some(self.source_file_idx) }
    }
}

/// A `type_list`: u4 size followed by u2 type indices.
#[derive(Debug, Clone, Copy)]
pub struct TypeList<'a>
{
    entries: &'a [u8],
}

impl<'a> TypeList<'a>
{
    pub const EMPTY: TypeList<'static> = TypeList { entries: &[] };

    pub(crate) fn read(bytes: &'a [u8], off: usize) -> Result<TypeList<'a>, DexError>
    {
        let mut ix = off;
        let size = read_u4(bytes, &mut ix)? as usize;
        let len = size.checked_mul(2).ok_or_else(|| err!(BadSize, "type_list size {} overflows", size))?;
        let entries = read_x(bytes, &mut ix, len)?;
        Ok(TypeList { entries })
    }

    pub fn len(&self) -> usize
    {
        self.entries.len() / 2
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<u16>
    {
        let b = self.entries.get(i * 2..i * 2 + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + 'a
    {
        self.entries.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]))
    }

    /// Size in bytes, including the u4 length prefix.
    pub fn byte_size(&self) -> usize
    {
        4 + self.entries.len()
    }
}

/// Read-only view of one dex file. Id sections are addressed relative to the
/// view's header, data items relative to the data base (the container start for
/// v41 containers, the header otherwise).
#[derive(Clone)]
pub struct DexFile<'a>
{
    container: &'a [u8],
    begin: usize,
    header: Header,
    data_base: usize,
}

impl<'a> fmt::Debug for DexFile<'a>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("DexFile")
            .field("begin", &self.begin)
            .field("version", &self.header.version())
            .field("file_size", &self.header.file_size)
            .field("string_ids", &self.header.string_ids_size)
            .field("class_defs", &self.header.class_defs_size)
            .finish()
    }
}

impl<'a> DexFile<'a>
{
    /// Build a view without structural verification. Callers must run the
    /// verifier before handing the view out.
    pub(crate) fn open_unverified(container: &'a [u8], begin: usize) -> Result<DexFile<'a>, DexError>
    {
        let Some(rest) = container.get(begin..) else {
            fail!(BadOffset, "header offset 0x{:x} past container end 0x{:x}", begin, container.len());
        };
        let header = Header::parse(rest).context(|| format!("dex header at 0x{:x}", begin))?;
        let data_base = if header.is_container() { 0 } else { begin };
        Ok(DexFile { container, begin, header, data_base })
    }

    /// Verify and open the first dex file in `bytes`.
    pub fn open(bytes: &'a [u8], options: &crate::dex::LoadOptions) -> Result<DexFile<'a>, DexError>
    {
        let dex = DexFile::open_unverified(bytes, 0)?;
        crate::dex::verifier::verify(&dex, options)?;
        Ok(dex)
    }

    pub fn header(&self) -> &Header
    {
        &self.header
    }

    pub fn version(&self) -> u32
    {
        self.header.version()
    }

    /// The bytes of this dex file, starting at its header.
    pub fn begin(&self) -> &'a [u8]
    {
        let end = (self.begin + self.header.file_size as usize).min(self.container.len());
        &self.container[self.begin..end]
    }

    pub fn begin_offset(&self) -> usize
    {
        self.begin
    }

    pub fn container(&self) -> &'a [u8]
    {
        self.container
    }

    /// Base that data-section offsets are relative to.
    pub fn data_base(&self) -> &'a [u8]
    {
        &self.container[self.data_base..]
    }

    pub fn data_base_offset(&self) -> usize
    {
        self.data_base
    }

    /// Replace the data section bounds with those of another sibling.
    pub(crate) fn adopt_data_section(&mut self, data_off: u32, data_size: u32)
    {
        self.header.data_off = data_off;
        self.header.data_size = data_size;
    }

    /// The declared data section, relative to the data base. A v41 file that
    /// declares an empty data section shares the whole container.
    pub fn data_section(&self) -> std::ops::Range<usize>
    {
        if self.header.is_container() && self.header.data_size == 0 {
            return 0..(self.header.container_size as usize).min(self.container.len());
        }
        let start = self.header.data_off as usize;
        start..start.saturating_add(self.header.data_size as usize)
    }

    pub fn num_string_ids(&self) -> u32 { self.header.string_ids_size }
    pub fn num_type_ids(&self) -> u32 { self.header.type_ids_size }
    pub fn num_proto_ids(&self) -> u32 { self.header.proto_ids_size }
    pub fn num_field_ids(&self) -> u32 { self.header.field_ids_size }
    pub fn num_method_ids(&self) -> u32 { self.header.method_ids_size }
    pub fn num_class_defs(&self) -> u32 { self.header.class_defs_size }

    pub fn num_call_site_ids(&self) -> u32
    {
        self.map_list().ok().and_then(|m| m.find(MapItemType::CallSiteIdItem)).map_or(0, |m| m.size)
    }

    pub fn num_method_handles(&self) -> u32
    {
        self.map_list().ok().and_then(|m| m.find(MapItemType::MethodHandleItem)).map_or(0, |m| m.size)
    }

    fn id_record(&self, what: &str, idx: u32, count: u32, off: u32, size: u32) -> Result<usize, DexError>
    {
        if idx >= count {
            fail!(BadIndex, "{} index {} out of range ({} entries)", what, idx, count);
        }
        let pos = self.begin as u64 + off as u64 + idx as u64 * size as u64;
        if pos + size as u64 > self.container.len() as u64 {
            fail!(BadOffset, "{} #{} at 0x{:x} runs past end of file", what, idx, pos);
        }
        Ok(pos as usize)
    }

    pub fn string_id(&self, idx: u32) -> Result<StringId, DexError>
    {
        let mut ix = self.id_record("string_id", idx, self.header.string_ids_size, self.header.string_ids_off, STRING_ID_ITEM_SIZE)?;
        Ok(StringId { string_data_off: read_u4(self.container, &mut ix)? })
    }

    /// `(utf16_length, modified_utf8_bytes)` for a string, without the NUL terminator.
    pub fn string_data(&self, idx: u32) -> Result<(u32, &'a [u8]), DexError>
    {
        let id = self.string_id(idx)?;
        self.string_data_at(id.string_data_off).context(|| format!("string_id #{}", idx))
    }

    pub(crate) fn string_data_at(&self, off: u32) -> Result<(u32, &'a [u8]), DexError>
    {
        let base = self.data_base();
        let mut ix = off as usize;
        let utf16_len = read_uleb128(base, &mut ix)?;
        let Some(rest) = base.get(ix..) else {
            fail!(BadOffset, "string data at 0x{:x} past end of file", off);
        };
        let Some(nul) = rest.iter().position(|&b| b == 0) else {
            fail!(BadUtf8, "string data at 0x{:x} is not NUL terminated", off);
        };
        Ok((utf16_len, &rest[..nul]))
    }

    /// Decode a string from modified UTF-8.
    pub fn string(&self, idx: u32) -> Result<String, DexError>
    {
        let (_, bytes) = self.string_data(idx)?;
        match cesu8::from_java_cesu8(bytes) {
            Ok(s) => Ok(s.into_owned()),
            Err(_) => Err(err!(BadUtf8, "string_id #{} is not valid modified utf-8", idx)),
        }
    }

    pub fn type_id(&self, idx: u32) -> Result<TypeId, DexError>
    {
        let mut ix = self.id_record("type_id", idx, self.header.type_ids_size, self.header.type_ids_off, TYPE_ID_ITEM_SIZE)?;
        Ok(TypeId { descriptor_idx: read_u4(self.container, &mut ix)? })
    }

    pub fn type_descriptor(&self, idx: u32) -> Result<String, DexError>
    {
        let t = self.type_id(idx)?;
        self.string(t.descriptor_idx).context(|| format!("type_id #{}", idx))
    }

    pub fn proto_id(&self, idx: u32) -> Result<ProtoId, DexError>
    {
        let mut ix = self.id_record("proto_id", idx, self.header.proto_ids_size, self.header.proto_ids_off, PROTO_ID_ITEM_SIZE)?;
        Ok(ProtoId {
            shorty_idx: read_u4(self.container, &mut ix)?,
            return_type_idx: read_u4(self.container, &mut ix)?,
            parameters_off: read_u4(self.container, &mut ix)?,
        })
    }

    pub fn proto_parameters(&self, idx: u32) -> Result<TypeList<'a>, DexError>
    {
        let p = self.proto_id(idx)?;
        self.type_list_at(p.parameters_off).context(|| format!("proto_id #{}", idx))
    }

    pub fn proto_shorty(&self, idx: u32) -> Result<String, DexError>
    {
        let p = self.proto_id(idx)?;
        self.string(p.shorty_idx)
    }

    pub fn type_list_at(&self, off: u32) -> Result<TypeList<'a>, DexError>
    {
        if off == 0 {
            return Ok(TypeList::EMPTY);
        }
        TypeList::read(self.data_base(), off as usize)
    }

    pub fn field_id(&self, idx: u32) -> Result<FieldId, DexError>
    {
        let mut ix = self.id_record("field_id", idx, self.header.field_ids_size, self.header.field_ids_off, FIELD_ID_ITEM_SIZE)?;
        Ok(FieldId {
            class_idx: read_u2(self.container, &mut ix)?,
            type_idx: read_u2(self.container, &mut ix)?,
            name_idx: read_u4(self.container, &mut ix)?,
        })
    }

    pub fn method_id(&self, idx: u32) -> Result<MethodId, DexError>
    {
        let mut ix = self.id_record("method_id", idx, self.header.method_ids_size, self.header.method_ids_off, METHOD_ID_ITEM_SIZE)?;
        Ok(MethodId {
            class_idx: read_u2(self.container, &mut ix)?,
            proto_idx: read_u2(self.container, &mut ix)?,
            name_idx: read_u4(self.container, &mut ix)?,
        })
    }

    pub fn method_shorty(&self, method_idx: u32) -> Result<String, DexError>
    {
        let m = self.method_id(method_idx)?;
        self.proto_shorty(m.proto_idx as u32)
    }

    /// `Lpkg/Cls;->name(II)V`, for diagnostics.
    pub fn pretty_method(&self, method_idx: u32) -> Result<String, DexError>
    {
        let m = self.method_id(method_idx)?;
        let class = self.type_descriptor(m.class_idx as u32)?;
        let name = self.string(m.name_idx)?;
        let proto = self.proto_id(m.proto_idx as u32)?;
        let mut s = format!("{}->{}(", class, name);
        for t in self.type_list_at(proto.parameters_off)?.iter() {
            s.push_str(&self.type_descriptor(t as u32)?);
        }
        s.push(')');
        s.push_str(&self.type_descriptor(proto.return_type_idx)?);
        Ok(s)
    }

    pub fn class_def(&self, idx: u32) -> Result<ClassDef, DexError>
    {
        let mut ix = self.id_record("class_def", idx, self.header.class_defs_size, self.header.class_defs_off, CLASS_DEF_ITEM_SIZE)?;
        let b = self.container;
        Ok(ClassDef {
            class_idx: read_u4(b, &mut ix)?,
            access_flags: read_u4(b, &mut ix)?,
            superclass_idx: read_u4(b, &mut ix)?,
            interfaces_off: read_u4(b, &mut ix)?,
            source_file_idx: read_u4(b, &mut ix)?,
            annotations_off: read_u4(b, &mut ix)?,
            class_data_off: read_u4(b, &mut ix)?,
            static_values_off: read_u4(b, &mut ix)?,
        })
    }

    /// Cursor over every class definition, in table order.
    pub fn class_defs(&self) -> ClassDefCursor<'_, 'a>
    {
        ClassDefCursor { dex: self, next: 0 }
    }

    pub fn interfaces(&self, def: &ClassDef) -> Result<TypeList<'a>, DexError>
    {
        self.type_list_at(def.interfaces_off)
    }

    /// Iterate the fields and methods of a class; `None` for marker classes
    /// without class data.
    pub fn class_data(&self, class_def_idx: u32) -> Result<Option<ClassDataIterator<'a>>, DexError>
    {
        let def = self.class_def(class_def_idx)?;
        if def.class_data_off == 0 {
            return Ok(None);
        }
        let flags = self.hiddenapi_flags(class_def_idx)?;
        ClassDataIterator::new(self.data_base(), def.class_data_off as usize, flags).map(Some)
    }

    pub fn code_item_at(&self, off: u32) -> Result<CodeItem<'a>, DexError>
    {
        if off == 0 {
            fail!(BadOffset, "code item offset 0");
        }
        CodeItem::read(self.data_base(), off as usize).context(|| format!("code_item at 0x{:x}", off))
    }

    pub fn debug_info(&self, code: &CodeItem<'a>) -> Result<Option<DebugInfoStream<'a>>, DexError>
    {
        if code.debug_info_off == 0 {
            return Ok(None);
        }
        DebugInfoStream::read(self.data_base(), code.debug_info_off as usize).map(Some)
    }

    /// Register layout for decoding the locals of a method.
    pub fn method_locals_info(&self, method_idx: u32, access_flags: u32, code: &CodeItem<'a>) -> Result<MethodLocalsInfo, DexError>
    {
        let m = self.method_id(method_idx)?;
        let mut params = vec![];
        for t in self.proto_parameters(m.proto_idx as u32)?.iter() {
            let d = self.type_descriptor(t as u32)?;
            params.push((t as u32, d == "J" || d == "D"));
        }
        Ok(MethodLocalsInfo {
            registers_size: code.registers_size,
            ins_size: code.ins_size,
            insns_size: code.insns_size,
            this_type: if access_flags & ACC_STATIC == 0 { Some(m.class_idx as u32) } else { None },
            params,
        })
    }

    pub fn map_list(&self) -> Result<MapList<'a>, DexError>
    {
        let base = self.data_base();
        let mut ix = self.header.map_off as usize;
        let count = read_u4(base, &mut ix).context(|| "map_list".to_string())?;
        let len = (count as u64 * MAP_ITEM_SIZE as u64 + 4) as usize;
        let start = self.header.map_off as usize;
        let Some(bytes) = start.checked_add(len).and_then(|end| base.get(start..end)) else {
            fail!(BadOffset, "map_list with {} entries at 0x{:x} runs past end of file", count, start);
        };
        Ok(MapList { bytes, count })
    }

    /// Hidden-api flags for the fields and methods of a class, when present.
    pub fn hiddenapi_flags(&self, class_def_idx: u32) -> Result<Option<HiddenapiFlags<'a>>, DexError>
    {
        let Some(section) = self.map_list()?.find(MapItemType::HiddenapiClassData) else {
            return Ok(None);
        };
        let base = self.data_base();
        let mut ix = section.offset as usize + 4 + class_def_idx as usize * 4;
        let rel = read_u4(base, &mut ix).context(|| "hiddenapi_class_data".to_string())?;
        if rel == 0 {
            return Ok(None);
        }
        Ok(Some(HiddenapiFlags::new(base, section.offset as usize + rel as usize)))
    }

    fn compare_string(&self, idx: u32, target: &[u8]) -> Result<Ordering, DexError>
    {
        let (_, bytes) = self.string_data(idx)?;
        Ok(bytes.cmp(target))
    }

    /// Binary search the sorted string table for `s`.
    pub fn find_string_id(&self, s: &str) -> Option<u32>
    {
        let target = cesu8::to_java_cesu8(s);
        let (mut lo, mut hi) = (0u32, self.num_string_ids());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.compare_string(mid, &target).ok()? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Binary search the type table, which is sorted by descriptor string index.
    pub fn find_type_id(&self, descriptor: &str) -> Option<u32>
    {
        let string_idx = self.find_string_id(descriptor)?;
        let (mut lo, mut hi) = (0u32, self.num_type_ids());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let t = self.type_id(mid).ok()?;
            match t.descriptor_idx.cmp(&string_idx) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    pub fn find_class_def(&self, descriptor: &str) -> Option<u32>
    {
        let type_idx = self.find_type_id(descriptor)?;
        (0..self.num_class_defs()).find(|&i| self.class_def(i).map(|d| d.class_idx == type_idx).unwrap_or(false))
    }
}

pub struct ClassDefCursor<'d, 'a>
{
    dex: &'d DexFile<'a>,
    next: u32,
}

impl<'d, 'a> Iterator for ClassDefCursor<'d, 'a>
{
    type Item = Result<(u32, ClassDef), DexError>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.next >= self.dex.num_class_defs() {
            return None;
        }
        let idx = self.next;
        self.next += 1;
        Some(self.dex.class_def(idx).map(|d| (idx, d)))
    }
}
