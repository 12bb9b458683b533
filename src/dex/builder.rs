/* Minimal dex writer: canonical pools, section layout, checksummed output */

use std::collections::{BTreeSet, HashMap};

use crate::dex::class_data::{ClassDataItem, ClassMember, MemberKind};
use crate::dex::code_item::{CatchSpec, MethodCode};
use crate::dex::dex_file::*;
use crate::dex::error::{DexError, ResultExt};
use crate::dex::header::{magic_for_version, Header, CHECKSUM_OFFSET, CONTAINER_VERSION, ENDIAN_CONSTANT, HEADER_SIZE, HEADER_SIZE_V41, SIGNATURE_OFFSET, SIGNATURE_END};
use crate::dex::verifier::{compute_checksum, compute_signature};
use crate::dex::{write_u2, write_u4, write_uleb128, NO_INDEX};

/// Modified UTF-8 bytes, the sort key for every string in the pool.
fn mutf8(s: &str) -> Vec<u8>
{
    cesu8::to_java_cesu8(s).into_owned()
}

fn align_to(value: usize, alignment: usize) -> usize
{
    (value + alignment - 1) & !(alignment - 1)
}

fn pad_to(buf: &mut Vec<u8>, alignment: usize)
{
    let aligned = align_to(buf.len(), alignment);
    buf.resize(aligned, 0);
}

fn shorty_char(descriptor: &str) -> char
{
    match descriptor.as_bytes().first() {
        Some(b'L') | Some(b'[') => 'L',
        Some(&c) => c as char,
        None => 'V',
    }
}

fn shorty_of(ret: &str, params: &[String]) -> String
{
    let mut s = String::new();
    s.push(shorty_char(ret));
    for p in params {
        s.push(shorty_char(p));
    }
    s
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtoKey
{
    pub ret: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey
{
    pub class: String,
    pub name: String,
    pub type_desc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey
{
    pub class: String,
    pub name: String,
    pub proto: ProtoKey,
}

/// A symbolic reference patched into an instruction's index unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSpec
{
    String(String),
    Type(String),
    Field(FieldKey),
    Method(MethodKey),
}

impl RefSpec
{
    pub fn method(class: &str, name: &str, ret: &str, params: &[&str]) -> RefSpec
    {
        RefSpec::Method(MethodKey {
            class: class.to_string(),
            name: name.to_string(),
            proto: ProtoKey { ret: ret.to_string(), params: params.iter().map(|p| p.to_string()).collect() },
        })
    }

    pub fn field(class: &str, name: &str, type_desc: &str) -> RefSpec
    {
        RefSpec::Field(FieldKey { class: class.to_string(), name: name.to_string(), type_desc: type_desc.to_string() })
    }
}

/// A method body whose index operands and catch types are still symbolic.
#[derive(Debug, Clone)]
pub struct CodeSpec
{
    code: MethodCode,
    tries: Vec<(u32, u16, Vec<(Option<String>, u32)>)>,
    refs: Vec<(usize, RefSpec)>,
}

impl CodeSpec
{
    pub fn new(registers_size: u16, ins_size: u16, insns: Vec<u16>) -> CodeSpec
    {
        CodeSpec { code: MethodCode::new(registers_size, ins_size, insns), tries: vec![], refs: vec![] }
    }

    pub fn outs(mut self, outs_size: u16) -> CodeSpec
    {
        self.code.outs_size = outs_size;
        self
    }

    /// Add a try region; a `None` type is a catch-all.
    pub fn try_region(mut self, start: u32, insn_count: u16, handlers: &[(Option<&str>, u32)]) -> CodeSpec
    {
        let hs = handlers.iter().map(|(t, a)| (t.map(|s| s.to_string()), *a)).collect();
        self.tries.push((start, insn_count, hs));
        self
    }

    /// Patch code unit `unit` with the index of `r` once pools are sorted.
    pub fn reference(mut self, unit: usize, r: RefSpec) -> CodeSpec
    {
        self.refs.push((unit, r));
        self
    }

    pub fn debug_info(mut self, stream: Vec<u8>) -> CodeSpec
    {
        self.code.debug_info = Some(stream);
        self
    }
}

#[derive(Debug, Clone)]
struct FieldSpec
{
    name: String,
    type_desc: String,
    access_flags: u32,
}

#[derive(Debug, Clone)]
struct MethodSpec
{
    name: String,
    ret: String,
    params: Vec<String>,
    access_flags: u32,
    code: Option<CodeSpec>,
}

impl MethodSpec
{
    fn is_direct(&self) -> bool
    {
        self.access_flags & (ACC_STATIC | ACC_PRIVATE | ACC_CONSTRUCTOR) != 0
    }
}

#[derive(Debug, Clone)]
struct ClassSpec
{
    descriptor: String,
    superclass: Option<String>,
    interfaces: Vec<String>,
    access_flags: u32,
    source_file: Option<String>,
    static_fields: Vec<FieldSpec>,
    instance_fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassHandle(usize);

/// Sorted string/type/proto/field/method tables.
#[derive(Debug, Default)]
struct DexIndexPools
{
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    types: Vec<String>,
    type_index: HashMap<String, u32>,
    protos: Vec<ProtoKey>,
    proto_index: HashMap<ProtoKey, u32>,
    fields: Vec<FieldKey>,
    field_index: HashMap<FieldKey, u32>,
    methods: Vec<MethodKey>,
    method_index: HashMap<MethodKey, u32>,
}

impl DexIndexPools
{
    fn string(&self, s: &str) -> Result<u32, DexError>
    {
        self.string_index.get(s).copied().ok_or_else(|| err!(BadIndex, "string {:?} not pooled", s))
    }

    fn type_idx(&self, d: &str) -> Result<u32, DexError>
    {
        self.type_index.get(d).copied().ok_or_else(|| err!(BadIndex, "type {} not pooled", d))
    }

    fn proto(&self, p: &ProtoKey) -> Result<u32, DexError>
    {
        self.proto_index.get(p).copied().ok_or_else(|| err!(BadIndex, "proto {:?} not pooled", p))
    }

    fn field(&self, f: &FieldKey) -> Result<u32, DexError>
    {
        self.field_index.get(f).copied().ok_or_else(|| err!(BadIndex, "field {:?} not pooled", f))
    }

    fn method(&self, m: &MethodKey) -> Result<u32, DexError>
    {
        self.method_index.get(m).copied().ok_or_else(|| err!(BadIndex, "method {:?} not pooled", m))
    }

    fn resolve(&self, r: &RefSpec) -> Result<u32, DexError>
    {
        match r {
            RefSpec::String(s) => self.string(s),
            RefSpec::Type(t) => self.type_idx(t),
            RefSpec::Field(f) => self.field(f),
            RefSpec::Method(m) => self.method(m),
        }
    }
}

#[derive(Debug, Default)]
struct PoolCollector
{
    strings: BTreeSet<String>,
    types: BTreeSet<String>,
    protos: BTreeSet<ProtoKey>,
    fields: BTreeSet<FieldKey>,
    methods: BTreeSet<MethodKey>,
}

impl PoolCollector
{
    fn add_type(&mut self, d: &str)
    {
        self.strings.insert(d.to_string());
        self.types.insert(d.to_string());
    }

    fn add_proto(&mut self, p: &ProtoKey)
    {
        self.strings.insert(shorty_of(&p.ret, &p.params));
        self.add_type(&p.ret);
        for t in &p.params {
            self.add_type(t);
        }
        self.protos.insert(p.clone());
    }

    fn add_field(&mut self, f: &FieldKey)
    {
        self.add_type(&f.class);
        self.add_type(&f.type_desc);
        self.strings.insert(f.name.clone());
        self.fields.insert(f.clone());
    }

    fn add_method(&mut self, m: &MethodKey)
    {
        self.add_type(&m.class);
        self.add_proto(&m.proto);
        self.strings.insert(m.name.clone());
        self.methods.insert(m.clone());
    }

    fn add_ref(&mut self, r: &RefSpec)
    {
        match r {
            RefSpec::String(s) => {
                self.strings.insert(s.clone());
            }
            RefSpec::Type(t) => self.add_type(t),
            RefSpec::Field(f) => self.add_field(f),
            RefSpec::Method(m) => self.add_method(m),
        }
    }

    fn into_pools(self) -> DexIndexPools
    {
        let mut pools = DexIndexPools::default();

        let mut strings: Vec<String> = self.strings.into_iter().collect();
        strings.sort_by_key(|s| mutf8(s));
        for (i, s) in strings.iter().enumerate() {
            pools.string_index.insert(s.clone(), i as u32);
        }
        pools.strings = strings;

        let mut types: Vec<String> = self.types.into_iter().collect();
        types.sort_by_key(|t| pools.string_index[t]);
        for (i, t) in types.iter().enumerate() {
            pools.type_index.insert(t.clone(), i as u32);
        }
        pools.types = types;

        let mut protos: Vec<ProtoKey> = self.protos.into_iter().collect();
        protos.sort_by_key(|p| (pools.type_index[&p.ret], p.params.iter().map(|t| pools.type_index[t]).collect::<Vec<_>>()));
        for (i, p) in protos.iter().enumerate() {
            pools.proto_index.insert(p.clone(), i as u32);
        }
        pools.protos = protos;

        let mut fields: Vec<FieldKey> = self.fields.into_iter().collect();
        fields.sort_by_key(|f| (pools.type_index[&f.class], pools.string_index[&f.name], pools.type_index[&f.type_desc]));
        for (i, f) in fields.iter().enumerate() {
            pools.field_index.insert(f.clone(), i as u32);
        }
        pools.fields = fields;

        let mut methods: Vec<MethodKey> = self.methods.into_iter().collect();
        methods.sort_by_key(|m| (pools.type_index[&m.class], pools.string_index[&m.name], pools.proto_index[&m.proto]));
        for (i, m) in methods.iter().enumerate() {
            pools.method_index.insert(m.clone(), i as u32);
        }
        pools.methods = methods;

        pools
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Section
{
    offset: u32,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct MapEntry
{
    type_code: u16,
    size: u32,
    offset: u32,
}

fn write_map_list(entries: &[MapEntry]) -> Vec<u8>
{
    let mut bytes = Vec::with_capacity(4 + entries.len() * MAP_ITEM_SIZE as usize);
    write_u4(&mut bytes, entries.len() as u32);
    for item in entries {
        write_u2(&mut bytes, item.type_code);
        write_u2(&mut bytes, 0);
        write_u4(&mut bytes, item.size);
        write_u4(&mut bytes, item.offset);
    }
    bytes
}

fn overwrite_header(buf: &mut [u8], header: &Header)
{
    let mut header_bytes = Vec::with_capacity(HEADER_SIZE_V41 as usize);
    header.write(&mut header_bytes);
    buf[..header_bytes.len()].copy_from_slice(&header_bytes);
}

/// Recompute signature, then checksum, of one dex file in place.
pub fn seal(file: &mut [u8])
{
    let signature = compute_signature(file);
    file[SIGNATURE_OFFSET..SIGNATURE_END].copy_from_slice(&signature);
    let checksum = compute_checksum(file);
    file[CHECKSUM_OFFSET..SIGNATURE_OFFSET].copy_from_slice(&checksum.to_le_bytes());
}

/// Assembles a dex file (or a v41 container of several) from class descriptions.
#[derive(Debug, Clone)]
pub struct DexBuilder
{
    version: u32,
    classes: Vec<ClassSpec>,
    extra_strings: BTreeSet<String>,
}

impl DexBuilder
{
    pub fn new(version: u32) -> DexBuilder
    {
        DexBuilder { version, classes: vec![], extra_strings: BTreeSet::new() }
    }

    pub fn add_class(&mut self, descriptor: &str, superclass: Option<&str>) -> ClassHandle
    {
        self.classes.push(ClassSpec {
            descriptor: descriptor.to_string(),
            superclass: superclass.map(|s| s.to_string()),
            interfaces: vec![],
            access_flags: ACC_PUBLIC,
            source_file: None,
            static_fields: vec![],
            instance_fields: vec![],
            methods: vec![],
        });
        ClassHandle(self.classes.len() - 1)
    }

    pub fn set_access_flags(&mut self, cls: ClassHandle, flags: u32)
    {
        self.classes[cls.0].access_flags = flags;
    }

    pub fn add_interface(&mut self, cls: ClassHandle, descriptor: &str)
    {
        self.classes[cls.0].interfaces.push(descriptor.to_string());
    }

    pub fn set_source_file(&mut self, cls: ClassHandle, name: &str)
    {
        self.classes[cls.0].source_file = Some(name.to_string());
    }

    pub fn add_static_field(&mut self, cls: ClassHandle, name: &str, type_desc: &str)
    {
        self.classes[cls.0].static_fields.push(FieldSpec { name: name.to_string(), type_desc: type_desc.to_string(), access_flags: ACC_STATIC });
    }

    pub fn add_instance_field(&mut self, cls: ClassHandle, name: &str, type_desc: &str)
    {
        self.classes[cls.0].instance_fields.push(FieldSpec { name: name.to_string(), type_desc: type_desc.to_string(), access_flags: 0 });
    }

    pub fn add_method(&mut self, cls: ClassHandle, name: &str, ret: &str, params: &[&str], access_flags: u32, code: Option<CodeSpec>)
    {
        self.classes[cls.0].methods.push(MethodSpec {
            name: name.to_string(),
            ret: ret.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            access_flags,
            code,
        });
    }

    pub fn add_string(&mut self, s: &str)
    {
        self.extra_strings.insert(s.to_string());
    }

    fn method_key(class: &ClassSpec, m: &MethodSpec) -> MethodKey
    {
        MethodKey { class: class.descriptor.clone(), name: m.name.clone(), proto: ProtoKey { ret: m.ret.clone(), params: m.params.clone() } }
    }

    fn collect_pools(&self) -> DexIndexPools
    {
        let mut c = PoolCollector::default();
        c.strings.extend(self.extra_strings.iter().cloned());
        for class in &self.classes {
            c.add_type(&class.descriptor);
            if let Some(s) = &class.superclass {
                c.add_type(s);
            }
            for i in &class.interfaces {
                c.add_type(i);
            }
            if let Some(f) = &class.source_file {
                c.strings.insert(f.clone());
            }
            for f in class.static_fields.iter().chain(class.instance_fields.iter()) {
                c.add_field(&FieldKey { class: class.descriptor.clone(), name: f.name.clone(), type_desc: f.type_desc.clone() });
            }
            for m in &class.methods {
                c.add_method(&Self::method_key(class, m));
                if let Some(code) = &m.code {
                    for (_, _, handlers) in &code.tries {
                        for (t, _) in handlers {
                            if let Some(t) = t {
                                c.add_type(t);
                            }
                        }
                    }
                    for (_, r) in &code.refs {
                        c.add_ref(r);
                    }
                }
            }
        }
        c.into_pools()
    }

    fn resolve_code(pools: &DexIndexPools, spec: &CodeSpec) -> Result<MethodCode, DexError>
    {
        let mut code = spec.code.clone();
        for (unit, r) in &spec.refs {
            let idx = pools.resolve(r)?;
            if idx > 0xffff {
                fail!(BadIndex, "index {} of {:?} does not fit a 16-bit operand", idx, r);
            }
            let Some(slot) = code.insns.get_mut(*unit) else {
                fail!(BadCodeItem, "reference patch at unit {} past {} code units", unit, spec.code.insns.len());
            };
            *slot = idx as u16;
        }
        if spec.tries.is_empty() {
            return Ok(code);
        }
        let mut regions = vec![];
        for (start, count, handlers) in &spec.tries {
            let mut catches = vec![];
            for (t, address) in handlers {
                let type_idx = match t {
                    Some(t) => Some(pools.type_idx(t)?),
                    None => None,
                };
                catches.push(CatchSpec { type_idx, address: *address });
            }
            regions.push((*start, *count, catches));
        }
        let debug_info = code.debug_info.take();
        let mut code = code.with_tries(&regions);
        code.debug_info = debug_info;
        Ok(code)
    }

    pub fn build(&self) -> Result<Vec<u8>, DexError>
    {
        if self.version >= CONTAINER_VERSION {
            return DexBuilder::build_container(std::slice::from_ref(self));
        }
        self.emit(0)
    }

    /// Lay several v41 files end to end in one container.
    pub fn build_container(files: &[DexBuilder]) -> Result<Vec<u8>, DexError>
    {
        if files.is_empty() {
            fail!(BadSize, "a container needs at least one dex file");
        }
        let mut container = vec![];
        let mut bounds = vec![];
        for (i, b) in files.iter().enumerate() {
            if b.version < CONTAINER_VERSION {
                fail!(BadVersion, "dex file #{} is version {}; containers need {}", i, b.version, CONTAINER_VERSION);
            }
            let base = container.len();
            let file = b.emit(base as u32).context(|| format!("dex file #{}", i))?;
            bounds.push(base..base + file.len());
            container.extend_from_slice(&file);
        }
        let container_size = container.len() as u32;
        for range in bounds {
            let file = &mut container[range];
            // container_size follows data_off in the v41 header
            file[HEADER_SIZE as usize..HEADER_SIZE as usize + 4].copy_from_slice(&container_size.to_le_bytes());
            seal(file);
        }
        Ok(container)
    }

    /// Emit one file whose header sits at `base` within its container.
    fn emit(&self, base: u32) -> Result<Vec<u8>, DexError>
    {
        let pools = self.collect_pools();
        let is_container = self.version >= CONTAINER_VERSION;
        let header_size = if is_container { HEADER_SIZE_V41 } else { HEADER_SIZE };

        let mut cursor = header_size;
        let mut section = |count: usize, stride: u32| {
            let s = Section { offset: if count > 0 { cursor } else { 0 }, count: count as u32 };
            cursor += count as u32 * stride;
            s
        };
        let string_ids = section(pools.strings.len(), STRING_ID_ITEM_SIZE);
        let type_ids = section(pools.types.len(), TYPE_ID_ITEM_SIZE);
        let proto_ids = section(pools.protos.len(), PROTO_ID_ITEM_SIZE);
        let field_ids = section(pools.fields.len(), FIELD_ID_ITEM_SIZE);
        let method_ids = section(pools.methods.len(), METHOD_ID_ITEM_SIZE);
        let class_defs = section(self.classes.len(), CLASS_DEF_ITEM_SIZE);
        let data_off = align_to(cursor as usize, 4) as u32;

        // data offsets are relative to the container start for v41, the file otherwise
        let mut data: Vec<u8> = vec![];
        let abs = |data: &Vec<u8>| base + data_off + data.len() as u32;
        let mut map = vec![MapEntry { type_code: MapItemType::HeaderItem.code(), size: 1, offset: 0 }];
        for (t, s) in [
            (MapItemType::StringIdItem, string_ids),
            (MapItemType::TypeIdItem, type_ids),
            (MapItemType::ProtoIdItem, proto_ids),
            (MapItemType::FieldIdItem, field_ids),
            (MapItemType::MethodIdItem, method_ids),
            (MapItemType::ClassDefItem, class_defs),
        ] {
            if s.count > 0 {
                map.push(MapEntry { type_code: t.code(), size: s.count, offset: s.offset });
            }
        }

        let mut string_data_offsets = Vec::with_capacity(pools.strings.len());
        for s in &pools.strings {
            string_data_offsets.push(abs(&data));
            write_uleb128(&mut data, s.encode_utf16().count() as u32);
            data.extend_from_slice(&mutf8(s));
            data.push(0);
        }
        if !pools.strings.is_empty() {
            map.push(MapEntry { type_code: MapItemType::StringDataItem.code(), size: pools.strings.len() as u32, offset: string_data_offsets[0] });
        }

        pad_to(&mut data, 4);
        let mut type_lists: HashMap<Vec<u32>, u32> = HashMap::new();
        let mut type_list_order = vec![];
        let mut lists: Vec<Vec<u32>> = pools.protos.iter()
            .map(|p| p.params.iter().map(|t| pools.type_index[t]).collect())
            .collect();
        for class in &self.classes {
            lists.push(class.interfaces.iter().map(|t| pools.type_idx(t)).collect::<Result<Vec<_>, _>>()?);
        }
        for list in lists {
            if list.is_empty() || type_lists.contains_key(&list) {
                continue;
            }
            pad_to(&mut data, 4);
            let off = abs(&data);
            write_u4(&mut data, list.len() as u32);
            for t in &list {
                write_u2(&mut data, *t as u16);
            }
            type_list_order.push(off);
            type_lists.insert(list, off);
        }
        if let Some(first) = type_list_order.first() {
            map.push(MapEntry { type_code: MapItemType::TypeList.code(), size: type_list_order.len() as u32, offset: *first });
        }

        // code items, remembering where each debug_info_off must be patched
        let mut code_offsets: HashMap<(usize, usize), u32> = HashMap::new();
        let mut debug_patches = vec![];
        let mut first_code = None;
        for (ci, class) in self.classes.iter().enumerate() {
            for (mi, m) in class.methods.iter().enumerate() {
                let Some(spec) = &m.code else { continue };
                let code = Self::resolve_code(&pools, spec).context(|| format!("{}->{}", class.descriptor, m.name))?;
                pad_to(&mut data, 4);
                let off = abs(&data);
                first_code.get_or_insert(off);
                let (_, debug_pos) = code.write(&mut data);
                if let Some(stream) = code.debug_info {
                    debug_patches.push((debug_pos, stream));
                }
                code_offsets.insert((ci, mi), off);
            }
        }
        if let Some(first) = first_code {
            map.push(MapEntry { type_code: MapItemType::CodeItem.code(), size: code_offsets.len() as u32, offset: first });
        }

        let mut first_debug = None;
        let debug_count = debug_patches.len() as u32;
        for (pos, stream) in debug_patches {
            let off = abs(&data);
            first_debug.get_or_insert(off);
            data[pos..pos + 4].copy_from_slice(&off.to_le_bytes());
            data.extend_from_slice(&stream);
        }
        if let Some(first) = first_debug {
            map.push(MapEntry { type_code: MapItemType::DebugInfoItem.code(), size: debug_count, offset: first });
        }

        let mut class_data_offsets = vec![0u32; self.classes.len()];
        let mut first_class_data = None;
        let mut class_data_count = 0;
        for (ci, class) in self.classes.iter().enumerate() {
            let item = self.class_data_for(&pools, ci, class, &code_offsets)?;
            if item.static_fields.is_empty() && item.instance_fields.is_empty() && item.direct_methods.is_empty() && item.virtual_methods.is_empty() {
                continue;
            }
            let off = abs(&data);
            first_class_data.get_or_insert(off);
            class_data_offsets[ci] = off;
            class_data_count += 1;
            item.write(&mut data);
        }
        if let Some(first) = first_class_data {
            map.push(MapEntry { type_code: MapItemType::ClassDataItem.code(), size: class_data_count, offset: first });
        }

        pad_to(&mut data, 4);
        let map_off = abs(&data);
        map.push(MapEntry { type_code: MapItemType::MapList.code(), size: 1, offset: map_off });
        map.sort_by_key(|m| m.offset);
        let map_bytes = write_map_list(&map);
        data.extend_from_slice(&map_bytes);

        let mut file = vec![0u8; header_size as usize];
        for off in &string_data_offsets {
            write_u4(&mut file, *off);
        }
        for t in &pools.types {
            write_u4(&mut file, pools.string(t)?);
        }
        for p in &pools.protos {
            write_u4(&mut file, pools.string(&shorty_of(&p.ret, &p.params))?);
            write_u4(&mut file, pools.type_idx(&p.ret)?);
            let params: Vec<u32> = p.params.iter().map(|t| pools.type_index[t]).collect();
            write_u4(&mut file, type_lists.get(&params).copied().unwrap_or(0));
        }
        for f in &pools.fields {
            write_u2(&mut file, pools.type_idx(&f.class)? as u16);
            write_u2(&mut file, pools.type_idx(&f.type_desc)? as u16);
            write_u4(&mut file, pools.string(&f.name)?);
        }
        for m in &pools.methods {
            write_u2(&mut file, pools.type_idx(&m.class)? as u16);
            write_u2(&mut file, pools.proto(&m.proto)? as u16);
            write_u4(&mut file, pools.string(&m.name)?);
        }
        for (ci, class) in self.classes.iter().enumerate() {
            write_u4(&mut file, pools.type_idx(&class.descriptor)?);
            write_u4(&mut file, class.access_flags);
            write_u4(&mut file, match &class.superclass { Some(s) => pools.type_idx(s)?, None => NO_INDEX });
            let interfaces: Vec<u32> = class.interfaces.iter().map(|t| pools.type_index[t]).collect();
            write_u4(&mut file, type_lists.get(&interfaces).copied().unwrap_or(0));
            write_u4(&mut file, match &class.source_file { Some(s) => pools.string(s)?, None => NO_INDEX });
            write_u4(&mut file, 0);
            write_u4(&mut file, class_data_offsets[ci]);
            write_u4(&mut file, 0);
        }
        file.resize(data_off as usize, 0);
        file.extend_from_slice(&data);

        let header = Header {
            magic: magic_for_version(self.version),
            checksum: 0,
            signature: [0; 20],
            file_size: file.len() as u32,
            header_size,
            endian_tag: ENDIAN_CONSTANT,
            link_size: 0,
            link_off: 0,
            map_off,
            string_ids_size: string_ids.count,
            string_ids_off: string_ids.offset,
            type_ids_size: type_ids.count,
            type_ids_off: type_ids.offset,
            proto_ids_size: proto_ids.count,
            proto_ids_off: proto_ids.offset,
            field_ids_size: field_ids.count,
            field_ids_off: field_ids.offset,
            method_ids_size: method_ids.count,
            method_ids_off: method_ids.offset,
            class_defs_size: class_defs.count,
            class_defs_off: class_defs.offset,
            // v41 files share the container's data, declared as 0/0
            data_size: if is_container { 0 } else { data.len() as u32 },
            data_off: if is_container { 0 } else { data_off },
            container_size: file.len() as u32,
            header_offset: base,
        };
        overwrite_header(&mut file, &header);
        seal(&mut file);
        Ok(file)
    }

    fn class_data_for(&self, pools: &DexIndexPools, ci: usize, class: &ClassSpec, code_offsets: &HashMap<(usize, usize), u32>) -> Result<ClassDataItem, DexError>
    {
        let mut item = ClassDataItem::default();
        let field = |f: &FieldSpec, kind| -> Result<ClassMember, DexError> {
            let key = FieldKey { class: class.descriptor.clone(), name: f.name.clone(), type_desc: f.type_desc.clone() };
            Ok(ClassMember { kind, index: pools.field(&key)?, access_flags: f.access_flags, code_off: 0, hiddenapi_flags: None })
        };
        for f in &class.static_fields {
            item.static_fields.push(field(f, MemberKind::StaticField)?);
        }
        for f in &class.instance_fields {
            item.instance_fields.push(field(f, MemberKind::InstanceField)?);
        }
        for (mi, m) in class.methods.iter().enumerate() {
            let kind = if m.is_direct() { MemberKind::DirectMethod } else { MemberKind::VirtualMethod };
            let member = ClassMember {
                kind,
                index: pools.method(&Self::method_key(class, m))?,
                access_flags: m.access_flags,
                code_off: code_offsets.get(&(ci, mi)).copied().unwrap_or(0),
                hiddenapi_flags: None,
            };
            if m.is_direct() { item.direct_methods.push(member) } else { item.virtual_methods.push(member) }
        }
        for list in [&mut item.static_fields, &mut item.instance_fields, &mut item.direct_methods, &mut item.virtual_methods] {
            list.sort_by_key(|m| m.index);
            if list.windows(2).any(|w| w[0].index == w[1].index) {
                fail!(BadIndex, "{} declares the same member twice", class.descriptor);
            }
        }
        Ok(item)
    }
}

/// Id tables and string payloads re-serialized from a decoded view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdTableBytes
{
    pub string_ids: Vec<u8>,
    pub string_data: Vec<Vec<u8>>,
    pub type_ids: Vec<u8>,
    pub field_ids: Vec<u8>,
    pub method_ids: Vec<u8>,
}

/// Re-encode the string, type, field and method tables of `dex` from its
/// decoded records.
pub fn reserialize_id_tables(dex: &DexFile) -> Result<IdTableBytes, DexError>
{
    let mut out = IdTableBytes::default();
    for i in 0..dex.num_string_ids() {
        write_u4(&mut out.string_ids, dex.string_id(i)?.string_data_off);
        let s = dex.string(i)?;
        let mut payload = vec![];
        write_uleb128(&mut payload, s.encode_utf16().count() as u32);
        payload.extend_from_slice(&mutf8(&s));
        payload.push(0);
        out.string_data.push(payload);
    }
    for i in 0..dex.num_type_ids() {
        write_u4(&mut out.type_ids, dex.type_id(i)?.descriptor_idx);
    }
    for i in 0..dex.num_field_ids() {
        let f = dex.field_id(i)?;
        write_u2(&mut out.field_ids, f.class_idx);
        write_u2(&mut out.field_ids, f.type_idx);
        write_u4(&mut out.field_ids, f.name_idx);
    }
    for i in 0..dex.num_method_ids() {
        let m = dex.method_id(i)?;
        write_u2(&mut out.method_ids, m.class_idx);
        write_u2(&mut out.method_ids, m.proto_idx);
        write_u4(&mut out.method_ids, m.name_idx);
    }
    Ok(out)
}
