/* Executable methods as the runtime sees them */

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::dex::code_item::MethodCode;
use crate::dex::dex_file::{ACC_NATIVE, ACC_STATIC};
use crate::dex::NO_INDEX;
use crate::runtime::object::{ClassId, JValue, RefSlot};
use crate::runtime::thread::Thread;
use crate::stack::stack_map::CodeInfo;

static NEXT_METHOD_ID: AtomicU32 = AtomicU32::new(1);

/// Body of a native method.
pub type NativeFn = Arc<dyn Fn(&Thread, &[JValue]) -> JValue + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Managed,
    Native,
    /// Callee-save and transition stubs. Never reported by the frame walker.
    Runtime,
}

/// What a compiler left behind for a method: stack maps plus the methods it inlined.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub code_info: CodeInfo,
    /// Indexed by `InlineInfo::method_index`.
    pub inlined_methods: Vec<Arc<Method>>,
    pub deoptimizable: bool,
}

pub struct Method {
    id: u32,
    class: ClassId,
    class_descriptor: String,
    name: String,
    signature: String,
    shorty: String,
    access_flags: u32,
    kind: MethodKind,
    code: Option<Arc<MethodCode>>,
    compiled: OnceCell<CompiledCode>,
    native: Option<NativeFn>,
    dex_image: u32,
    dex_method_idx: u32,
    /// The declaring class object, kept alive while the method runs.
    declaring_class_root: RefSlot,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method#{}({})", self.id, self.pretty_name())
    }
}

/// `(ILjava/lang/String;)V` to `VIL`.
pub fn shorty_of_signature(signature: &str) -> String {
    let mut params = String::new();
    let mut ret = 'V';
    let mut in_params = false;
    let mut chars = signature.chars().peekable();
    while let Some(c) = chars.next() {
        let short = match c {
            '(' => {
                in_params = true;
                continue;
            }
            ')' => {
                in_params = false;
                continue;
            }
            '[' => {
                while chars.peek() == Some(&'[') {
                    chars.next();
                }
                if chars.next() == Some('L') {
                    for d in chars.by_ref() {
                        if d == ';' {
                            break;
                        }
                    }
                }
                'L'
            }
            'L' => {
                for d in chars.by_ref() {
                    if d == ';' {
                        break;
                    }
                }
                'L'
            }
            other => other,
        };
        if in_params {
            params.push(short);
        } else {
            ret = short;
        }
    }
    format!("{}{}", ret, params)
}

impl Method {
    pub fn new(class: ClassId, class_descriptor: &str, name: &str, signature: &str, access_flags: u32) -> Method {
        Method {
            id: NEXT_METHOD_ID.fetch_add(1, Ordering::Relaxed),
            class,
            class_descriptor: class_descriptor.to_string(),
            name: name.to_string(),
            signature: signature.to_string(),
            shorty: shorty_of_signature(signature),
            access_flags,
            kind: if access_flags & ACC_NATIVE != 0 { MethodKind::Native } else { MethodKind::Managed },
            code: None,
            compiled: OnceCell::new(),
            native: None,
            dex_image: NO_INDEX,
            dex_method_idx: NO_INDEX,
            declaring_class_root: RefSlot::null(),
        }
    }

    /// A stub the walker skips over.
    pub fn runtime_method(name: &str) -> Method {
        let mut m = Method::new(ClassId(0), "", name, "()V", ACC_STATIC);
        m.kind = MethodKind::Runtime;
        m
    }

    pub fn with_code(mut self, code: MethodCode) -> Method {
        self.code = Some(Arc::new(code));
        self
    }

    pub fn with_compiled(mut self, compiled: CompiledCode) -> Method {
        self.compiled = OnceCell::with_value(compiled);
        self
    }

    pub fn with_native(mut self, f: NativeFn) -> Method {
        self.kind = MethodKind::Native;
        self.native = Some(f);
        self
    }

    pub fn with_dex_index(mut self, image: u32, method_idx: u32) -> Method {
        self.dex_image = image;
        self.dex_method_idx = method_idx;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn class_descriptor(&self) -> &str {
        &self.class_descriptor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn shorty(&self) -> &str {
        &self.shorty
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.kind == MethodKind::Native
    }

    pub fn is_runtime_method(&self) -> bool {
        self.kind == MethodKind::Runtime
    }

    pub fn code(&self) -> Option<&Arc<MethodCode>> {
        self.code.as_ref()
    }

    pub fn compiled(&self) -> Option<&CompiledCode> {
        self.compiled.get()
    }

    /// Publish compiled code for an already shared method. Only the first
    /// install wins.
    pub fn install_compiled(&self, compiled: CompiledCode) -> bool {
        self.compiled.set(compiled).is_ok()
    }

    pub fn native(&self) -> Option<&NativeFn> {
        self.native.as_ref()
    }

    pub fn is_deoptimizable(&self) -> bool {
        self.code.is_some() && self.compiled().is_some_and(|c| c.deoptimizable)
    }

    pub fn dex_image(&self) -> Option<u32> {
        (self.dex_image != NO_INDEX).then_some(self.dex_image)
    }

    pub fn dex_method_idx(&self) -> Option<u32> {
        (self.dex_method_idx != NO_INDEX).then_some(self.dex_method_idx)
    }

    pub fn declaring_class_root(&self) -> &RefSlot {
        &self.declaring_class_root
    }

    /// Number of vregs the arguments occupy, `this` included.
    pub fn num_arg_vregs(&self) -> usize {
        let wide = self.shorty.chars().skip(1).map(|c| if c == 'J' || c == 'D' { 2 } else { 1 }).sum::<usize>();
        wide + if self.is_static() { 0 } else { 1 }
    }

    pub fn pretty_name(&self) -> String {
        format!("{}->{}{}", self.class_descriptor, self.name, self.signature)
    }
}
