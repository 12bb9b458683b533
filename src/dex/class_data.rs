use crate::dex::error::{DexError, ResultExt};
use crate::dex::{read_uleb128, write_uleb128};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind
{
    StaticField,
    InstanceField,
    DirectMethod,
    VirtualMethod,
}

impl MemberKind
{
    pub fn is_method(&self) -> bool
    {
        matches!(self, MemberKind::DirectMethod | MemberKind::VirtualMethod)
    }
}

/// One decoded field or method entry. `index` is already delta-decoded into
/// an absolute field or method id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassMember
{
    pub kind: MemberKind,
    pub index: u32,
    pub access_flags: u32,
    /// Code item offset; zero for fields and for abstract or native methods.
    pub code_off: u32,
    pub hiddenapi_flags: Option<u32>,
}

/// The uleb128 stream of hidden-api flags for a single class.
#[derive(Debug, Clone)]
pub struct HiddenapiFlags<'a>
{
    bytes: &'a [u8],
    ix: usize,
}

impl<'a> HiddenapiFlags<'a>
{
    pub(crate) fn new(bytes: &'a [u8], ix: usize) -> Self
    {
        HiddenapiFlags { bytes, ix }
    }

    fn next_flag(&mut self) -> Result<u32, DexError>
    {
        read_uleb128(self.bytes, &mut self.ix).context(|| "hiddenapi flags".to_string())
    }
}

/// Streaming decoder over a `class_data_item`.
#[derive(Debug, Clone)]
pub struct ClassDataIterator<'a>
{
    bytes: &'a [u8],
    ix: usize,
    remaining: [u32; 4],
    section: usize,
    last_index: u32,
    hiddenapi: Option<HiddenapiFlags<'a>>,
    failed: bool,
}

impl<'a> ClassDataIterator<'a>
{
    pub(crate) fn new(bytes: &'a [u8], off: usize, hiddenapi: Option<HiddenapiFlags<'a>>) -> Result<Self, DexError>
    {
        let mut ix = off;
        let mut remaining = [0u32; 4];
        for r in remaining.iter_mut() {
            *r = read_uleb128(bytes, &mut ix).context(|| format!("class_data header at 0x{:x}", off))?;
        }
        Ok(ClassDataIterator { bytes, ix, remaining, section: 0, last_index: 0, hiddenapi, failed: false })
    }

    pub fn static_fields_size(&self) -> u32 { self.remaining[0] }
    pub fn instance_fields_size(&self) -> u32 { self.remaining[1] }
    pub fn direct_methods_size(&self) -> u32 { self.remaining[2] }
    pub fn virtual_methods_size(&self) -> u32 { self.remaining[3] }

    /// Byte position of the next undecoded entry.
    pub fn position(&self) -> usize
    {
        self.ix
    }

    fn read_member(&mut self, kind: MemberKind) -> Result<ClassMember, DexError>
    {
        let delta = read_uleb128(self.bytes, &mut self.ix)?;
        let index = self.last_index.checked_add(delta)
            .ok_or_else(|| err!(BadIndex, "class_data member index overflows at 0x{:x}", self.ix))?;
        self.last_index = index;
        let access_flags = read_uleb128(self.bytes, &mut self.ix)?;
        let code_off = if kind.is_method() { read_uleb128(self.bytes, &mut self.ix)? } else { 0 };
        let hiddenapi_flags = match self.hiddenapi.as_mut() {
            Some(h) => Some(h.next_flag()?),
            None => None,
        };
        Ok(ClassMember { kind, index, access_flags, code_off, hiddenapi_flags })
    }

    /// Decode the remainder into per-kind lists.
    pub fn collect_members(self) -> Result<ClassDataItem, DexError>
    {
        let mut item = ClassDataItem::default();
        for m in self {
            let m = m?;
            match m.kind {
                MemberKind::StaticField => item.static_fields.push(m),
                MemberKind::InstanceField => item.instance_fields.push(m),
                MemberKind::DirectMethod => item.direct_methods.push(m),
                MemberKind::VirtualMethod => item.virtual_methods.push(m),
            }
        }
        Ok(item)
    }
}

impl<'a> Iterator for ClassDataIterator<'a>
{
    type Item = Result<ClassMember, DexError>;

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.failed {
            return None;
        }
        while self.section < 4 && self.remaining[self.section] == 0 {
            self.section += 1;
            self.last_index = 0;
        }
        if self.section >= 4 {
            return None;
        }
        let kind = match self.section {
            0 => MemberKind::StaticField,
            1 => MemberKind::InstanceField,
            2 => MemberKind::DirectMethod,
            _ => MemberKind::VirtualMethod,
        };
        self.remaining[self.section] -= 1;
        let r = self.read_member(kind);
        if r.is_err() {
            self.failed = true;
        }
        Some(r)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassDataItem
{
    pub static_fields: Vec<ClassMember>,
    pub instance_fields: Vec<ClassMember>,
    pub direct_methods: Vec<ClassMember>,
    pub virtual_methods: Vec<ClassMember>,
}

impl ClassDataItem
{
    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_uleb128(bytes, self.static_fields.len() as u32);
        c += write_uleb128(bytes, self.instance_fields.len() as u32);
        c += write_uleb128(bytes, self.direct_methods.len() as u32);
        c += write_uleb128(bytes, self.virtual_methods.len() as u32);

        for list in [&self.static_fields, &self.instance_fields, &self.direct_methods, &self.virtual_methods] {
            let mut last = 0;
            for m in list {
                c += write_uleb128(bytes, m.index - last);
                last = m.index;
                c += write_uleb128(bytes, m.access_flags);
                if m.kind.is_method() {
                    c += write_uleb128(bytes, m.code_off);
                }
            }
        }
        c
    }

    pub fn methods(&self) -> impl Iterator<Item = &ClassMember>
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }
}
