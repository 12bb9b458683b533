/* Class and method resolution as the core needs it: subtype checks, sizes, dex references */

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::RwLock;

use crate::dex::dex_file::DexFile;
use crate::dex::error::DexError;
use crate::runtime::object::{ClassId, OBJECT_HEADER_SIZE};
use crate::stack::method::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownClass {
    Object,
    String,
    Class,
    Throwable,
    Exception,
    RuntimeException,
    Error,
    ArithmeticException,
    NullPointerException,
    ArrayIndexOutOfBoundsException,
    ClassCastException,
    IllegalMonitorStateException,
    OutOfMemoryError,
    StackOverflowError,
    NoClassDefFoundError,
    NoSuchMethodError,
    IoException,
}

impl WellKnownClass {
    /// Every variant, each listed after its superclass.
    pub const ALL: [WellKnownClass; 17] = [
        WellKnownClass::Object,
        WellKnownClass::String,
        WellKnownClass::Class,
        WellKnownClass::Throwable,
        WellKnownClass::Exception,
        WellKnownClass::RuntimeException,
        WellKnownClass::Error,
        WellKnownClass::ArithmeticException,
        WellKnownClass::NullPointerException,
        WellKnownClass::ArrayIndexOutOfBoundsException,
        WellKnownClass::ClassCastException,
        WellKnownClass::IllegalMonitorStateException,
        WellKnownClass::OutOfMemoryError,
        WellKnownClass::StackOverflowError,
        WellKnownClass::NoClassDefFoundError,
        WellKnownClass::NoSuchMethodError,
        WellKnownClass::IoException,
    ];

    pub fn descriptor(&self) -> &'static str {
        match self {
            WellKnownClass::Object => "Ljava/lang/Object;",
            WellKnownClass::String => "Ljava/lang/String;",
            WellKnownClass::Class => "Ljava/lang/Class;",
            WellKnownClass::Throwable => "Ljava/lang/Throwable;",
            WellKnownClass::Exception => "Ljava/lang/Exception;",
            WellKnownClass::RuntimeException => "Ljava/lang/RuntimeException;",
            WellKnownClass::Error => "Ljava/lang/Error;",
            WellKnownClass::ArithmeticException => "Ljava/lang/ArithmeticException;",
            WellKnownClass::NullPointerException => "Ljava/lang/NullPointerException;",
            WellKnownClass::ArrayIndexOutOfBoundsException => "Ljava/lang/ArrayIndexOutOfBoundsException;",
            WellKnownClass::ClassCastException => "Ljava/lang/ClassCastException;",
            WellKnownClass::IllegalMonitorStateException => "Ljava/lang/IllegalMonitorStateException;",
            WellKnownClass::OutOfMemoryError => "Ljava/lang/OutOfMemoryError;",
            WellKnownClass::StackOverflowError => "Ljava/lang/StackOverflowError;",
            WellKnownClass::NoClassDefFoundError => "Ljava/lang/NoClassDefFoundError;",
            WellKnownClass::NoSuchMethodError => "Ljava/lang/NoSuchMethodError;",
            WellKnownClass::IoException => "Ljava/io/IOException;",
        }
    }

    fn superclass(&self) -> Option<WellKnownClass> {
        use WellKnownClass::*;
        Some(match self {
            Object => return None,
            String | Class | Throwable => Object,
            Exception | Error => Throwable,
            RuntimeException | IoException => Exception,
            ArithmeticException | NullPointerException | ArrayIndexOutOfBoundsException | ClassCastException
            | IllegalMonitorStateException => RuntimeException,
            OutOfMemoryError | StackOverflowError | NoClassDefFoundError | NoSuchMethodError => Error,
        })
    }

    fn is_throwable(&self) -> bool {
        let mut c = Some(*self);
        while let Some(k) = c {
            if k == WellKnownClass::Throwable {
                return true;
            }
            c = k.superclass();
        }
        false
    }
}

/// What the core asks of the class linker. Everything else about classes
/// (fields, vtables, initialization) lives outside.
pub trait ClassLinker: Send + Sync {
    fn well_known(&self, which: WellKnownClass) -> ClassId;

    /// True when `class` is `ancestor` or inherits from it.
    fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool;

    fn instance_size(&self, class: ClassId) -> usize;

    fn descriptor(&self, class: ClassId) -> Option<String>;

    fn resolve_type(&self, referrer: &Method, type_idx: u32) -> Option<ClassId>;

    fn resolve_string(&self, referrer: &Method, string_idx: u32) -> Option<String>;

    fn resolve_method(&self, referrer: &Method, method_idx: u32) -> Option<Arc<Method>>;

    /// Look `name` + `signature` up in `class` and then its superclasses.
    fn find_virtual_method(&self, class: ClassId, name: &str, signature: &str) -> Option<Arc<Method>>;
}

#[derive(Debug)]
struct ClassRecord {
    descriptor: String,
    superclass: Option<ClassId>,
    instance_size: usize,
    methods: Vec<Arc<Method>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MethodRef {
    class: String,
    name: String,
    signature: String,
}

/// The pools of one loaded dex file, indexed the way its instructions index them.
#[derive(Debug, Default)]
struct DexImage {
    types: Vec<String>,
    strings: Vec<String>,
    methods: Vec<MethodRef>,
}

/// Methods a `load_dex` call defined, and the image index they reference.
#[derive(Debug)]
pub struct LoadedDex {
    pub image: u32,
    pub methods: Vec<Arc<Method>>,
}

impl LoadedDex {
    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods.iter().find(|m| m.name() == name)
    }
}

/// A simple in-memory class linker. `ClassId(0)` is reserved for runtime
/// methods; defined classes count from 1.
#[derive(Debug)]
pub struct ClassTable {
    classes: RwLock<Vec<ClassRecord>>,
    by_descriptor: RwLock<HashMap<String, ClassId>>,
    images: RwLock<Vec<DexImage>>,
    well_known: Vec<ClassId>,
}

const DEFAULT_INSTANCE_SIZE: usize = OBJECT_HEADER_SIZE + 8;
const THROWABLE_INSTANCE_SIZE: usize = OBJECT_HEADER_SIZE + 24;

impl ClassTable {
    pub fn new() -> ClassTable {
        let mut table = ClassTable {
            classes: RwLock::new(vec![]),
            by_descriptor: RwLock::new(HashMap::new()),
            images: RwLock::new(vec![]),
            well_known: vec![],
        };
        let mut ids = vec![];
        for k in WellKnownClass::ALL {
            let sup = k.superclass().map(|s| s.descriptor());
            let id = table.define_class(k.descriptor(), sup);
            if k.is_throwable() {
                table.set_instance_size(id, THROWABLE_INSTANCE_SIZE);
            }
            ids.push(id);
        }
        table.well_known = ids;
        table
    }

    pub fn find_class(&self, descriptor: &str) -> Option<ClassId> {
        self.by_descriptor.read().get(descriptor).copied()
    }

    /// Define `descriptor`, or return it if already defined. An unknown
    /// superclass is defined on the way as a direct subclass of Object.
    pub fn define_class(&self, descriptor: &str, superclass: Option<&str>) -> ClassId {
        if let Some(id) = self.find_class(descriptor) {
            return id;
        }
        let sup = superclass.map(|s| match self.find_class(s) {
            Some(id) => id,
            None => {
                let object = WellKnownClass::Object.descriptor();
                self.define_class(s, (s != object).then_some(object))
            }
        });
        let mut classes = self.classes.write();
        let mut by_descriptor = self.by_descriptor.write();
        if let Some(id) = by_descriptor.get(descriptor) {
            return *id;
        }
        classes.push(ClassRecord {
            descriptor: descriptor.to_string(),
            superclass: sup,
            instance_size: DEFAULT_INSTANCE_SIZE,
            methods: vec![],
        });
        let id = ClassId(classes.len() as u32);
        by_descriptor.insert(descriptor.to_string(), id);
        trace!("defined {} as class #{}", descriptor, id.0);
        id
    }

    pub fn superclass(&self, class: ClassId) -> Option<ClassId> {
        self.with_record(class, |r| r.superclass).flatten()
    }

    pub fn set_instance_size(&self, class: ClassId, size: usize) {
        let mut classes = self.classes.write();
        if let Some(r) = Self::slot(class).and_then(|s| classes.get_mut(s)) {
            r.instance_size = size;
        }
    }

    /// Make `method` findable through its declaring class.
    pub fn register_method(&self, method: Method) -> Arc<Method> {
        let method = Arc::new(method);
        if let Some(slot) = Self::slot(method.class()) {
            if let Some(r) = self.classes.write().get_mut(slot) {
                r.methods.push(method.clone());
            }
        }
        method
    }

    /// Define every class in `dex` together with its methods. Method bodies
    /// are copied out, so the returned methods do not borrow `dex`.
    pub fn load_dex(&self, dex: &DexFile) -> Result<LoadedDex, DexError> {
        let mut image = DexImage::default();
        for i in 0..dex.num_type_ids() {
            image.types.push(dex.type_descriptor(i)?);
        }
        for i in 0..dex.num_string_ids() {
            image.strings.push(dex.string(i)?);
        }
        for i in 0..dex.num_method_ids() {
            let id = dex.method_id(i)?;
            let proto = dex.proto_id(id.proto_idx as u32)?;
            let mut signature = String::from("(");
            for t in dex.proto_parameters(id.proto_idx as u32)?.iter() {
                signature.push_str(&dex.type_descriptor(t as u32)?);
            }
            signature.push(')');
            signature.push_str(&dex.type_descriptor(proto.return_type_idx)?);
            image.methods.push(MethodRef {
                class: dex.type_descriptor(id.class_idx as u32)?,
                name: dex.string(id.name_idx)?,
                signature,
            });
        }

        let image_idx = {
            let images = self.images.read();
            images.len() as u32
        };
        let mut methods = vec![];
        for def in dex.class_defs() {
            let (idx, def) = def?;
            let descriptor = dex.type_descriptor(def.class_idx)?;
            let superclass = def.superclass().map(|s| dex.type_descriptor(s)).transpose()?;
            let class = self.define_class(&descriptor, superclass.as_deref());
            let data = match dex.class_data(idx)? {
                Some(it) => it.collect_members()?,
                None => continue,
            };
            self.set_instance_size(class, OBJECT_HEADER_SIZE + 4 * data.instance_fields.len());
            for m in data.methods() {
                let Some(r) = image.methods.get(m.index as usize) else {
                    fail!(BadIndex, "class data names method {} of {}", m.index, image.methods.len());
                };
                let mut method = Method::new(class, &descriptor, &r.name, &r.signature, m.access_flags).with_dex_index(image_idx, m.index);
                if m.code_off != 0 {
                    method = method.with_code(dex.code_item_at(m.code_off)?.to_method_code()?);
                }
                methods.push(self.register_method(method));
            }
        }
        debug!("loaded dex image {}: {} types, {} methods defined", image_idx, image.types.len(), methods.len());
        self.images.write().push(image);
        Ok(LoadedDex { image: image_idx, methods })
    }

    fn slot(class: ClassId) -> Option<usize> {
        (class.0 as usize).checked_sub(1)
    }

    fn with_record<R>(&self, class: ClassId, f: impl FnOnce(&ClassRecord) -> R) -> Option<R> {
        let classes = self.classes.read();
        classes.get(Self::slot(class)?).map(f)
    }

    fn with_image<R>(&self, referrer: &Method, f: impl FnOnce(&DexImage) -> Option<R>) -> Option<R> {
        let images = self.images.read();
        images.get(referrer.dex_image()? as usize).and_then(f)
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        ClassTable::new()
    }
}

impl ClassLinker for ClassTable {
    fn well_known(&self, which: WellKnownClass) -> ClassId {
        let i = WellKnownClass::ALL.iter().position(|k| *k == which).unwrap_or(0);
        self.well_known.get(i).copied().unwrap_or(ClassId(1))
    }

    fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let classes = self.classes.read();
        let mut c = Some(class);
        let mut hops = 0;
        while let Some(id) = c {
            if id == ancestor {
                return true;
            }
            hops += 1;
            if hops > classes.len() {
                break;
            }
            c = Self::slot(id).and_then(|s| classes.get(s)).and_then(|r| r.superclass);
        }
        false
    }

    fn instance_size(&self, class: ClassId) -> usize {
        self.with_record(class, |r| r.instance_size).unwrap_or(DEFAULT_INSTANCE_SIZE)
    }

    fn descriptor(&self, class: ClassId) -> Option<String> {
        self.with_record(class, |r| r.descriptor.clone())
    }

    fn resolve_type(&self, referrer: &Method, type_idx: u32) -> Option<ClassId> {
        let descriptor = self.with_image(referrer, |img| img.types.get(type_idx as usize).cloned())?;
        self.find_class(&descriptor)
    }

    fn resolve_string(&self, referrer: &Method, string_idx: u32) -> Option<String> {
        self.with_image(referrer, |img| img.strings.get(string_idx as usize).cloned())
    }

    fn resolve_method(&self, referrer: &Method, method_idx: u32) -> Option<Arc<Method>> {
        let r = self.with_image(referrer, |img| img.methods.get(method_idx as usize).cloned())?;
        let class = self.find_class(&r.class)?;
        self.find_virtual_method(class, &r.name, &r.signature)
    }

    fn find_virtual_method(&self, class: ClassId, name: &str, signature: &str) -> Option<Arc<Method>> {
        let classes = self.classes.read();
        let mut c = Some(class);
        let mut hops = 0;
        while let Some(id) = c {
            let r = classes.get(Self::slot(id)?)?;
            if let Some(m) = r.methods.iter().find(|m| m.name() == name && m.signature() == signature) {
                return Some(m.clone());
            }
            hops += 1;
            if hops > classes.len() {
                break;
            }
            c = r.superclass;
        }
        None
    }
}
