//! Methods, overloads, try blocks and ref signatures.
//!
//! A method is a named group of overloads distinguished by parameter
//! count and shape. Resolution walks the group's overloads, then the
//! base method chain; an overload accepts `n` arguments when
//! `n >= param_count - optional_param_count && n <= param_count`, or
//! `n >= param_count - 1` for variadic overloads.

use bitflags::bitflags;

use crate::ee::instr::Instr;
use crate::module::token::Token;
use crate::strings::ManagedString;
use crate::types::member::MemberData;
use crate::types::Type;

/// Signature of a native-code method implementation.
pub type NativeMethod = unsafe fn(
    thread: *mut crate::ee::thread::Thread,
    argc: u32,
    args: *mut crate::value::Value,
) -> crate::error::OpResult;

bitflags! {
    /// Overload flags. The low half mirrors the module file format; the
    /// high half is internal state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OverloadFlags: u32 {
        /// The last parameter is variadic.
        const VAR_END      = 0x0000_0001;
        /// The first parameter is variadic.
        const VAR_START    = 0x0000_0002;
        /// The overload has a native-code implementation.
        const NATIVE       = 0x0000_0004;
        /// The overload uses the short header format (no optional
        /// parameters, no locals, max stack 8, no try blocks).
        const SHORT_HEADER = 0x0000_0008;
        const VIRTUAL      = 0x0000_0010;
        const ABSTRACT     = 0x0000_0020;
        /// The overload overrides an inherited method.
        const OVERRIDE     = 0x0000_0040;

        const VARIADIC     = 0x0000_0003;

        // Internal flags follow.

        /// The overload is an instance method.
        const INSTANCE     = 0x0001_0000;
        /// The overload is a constructor.
        const CTOR         = 0x0002_0000;
        /// The bytecode initialiser has processed the overload.
        const INITED       = 0x0004_0000;
    }
}

/// A packed per-parameter bitmap of which parameters take references.
///
/// Bit 0 belongs to the instance slot; parameter *i* (0-based) uses bit
/// *i + 1*. Parameters past bit 31 share the top bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefSignature(pub u32);

impl RefSignature {
    pub const EMPTY: RefSignature = RefSignature(0);

    #[inline]
    fn bit(index: u32) -> u32 {
        1 << index.min(31)
    }

    /// Whether the slot at `index` (0 = instance) is by reference.
    #[inline]
    pub fn is_param_ref(self, index: u32) -> bool {
        self.0 & Self::bit(index) != 0
    }

    #[inline]
    pub fn set_param_ref(&mut self, index: u32) {
        self.0 |= Self::bit(index);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Verifies an invocation's ref pattern against this overload
    /// signature for `arg_count` arguments (instance excluded). Returns
    /// the index of the first mismatched slot, or `None` when everything
    /// agrees.
    pub fn verify(self, invocation: RefSignature, arg_count: u32) -> Option<u32> {
        for i in 0..arg_count {
            if self.is_param_ref(i + 1) != invocation.is_param_ref(i + 1) {
                return Some(i + 1);
            }
        }
        None
    }
}

/// The kind of protection a try block provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryKind {
    Catch = 0x01,
    Finally = 0x02,
    Fault = 0x03,
}

/// One catch clause: the caught type and the handler range.
pub struct CatchBlock {
    pub caught_type_token: Token,
    /// Resolved lazily if the token could not be resolved at load time.
    pub caught_type: *mut Type,
    pub catch_start: usize,
    pub catch_end: usize,
}

/// The handler attached to a try block.
pub enum TryHandler {
    /// Catch clauses, ordered innermost to outermost.
    Catch(Vec<CatchBlock>),
    /// A finally or fault handler range. Both run identically during
    /// unwinding.
    Finally { start: usize, end: usize },
}

/// A protected region of a method body. Offsets start out as byte
/// offsets from the module file and are rewritten to instruction indices
/// by the method initialiser.
pub struct TryBlock {
    pub kind: TryKind,
    pub try_start: usize,
    pub try_end: usize,
    pub handler: TryHandler,
}

impl TryBlock {
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        self.try_start <= offset && offset < self.try_end
    }
}

/// A source location attached to a range of instructions, used when
/// formatting stack traces. Populated by the embedder; the VM itself does
/// not parse debug symbols.
pub struct SourceLocation {
    pub start_instr: usize,
    pub end_instr: usize,
    pub line: i32,
    pub file: *mut ManagedString,
}

/// The body of an overload, in its various stages of life.
pub enum OverloadBody {
    /// Abstract: no body at all.
    None,
    /// Raw on-disk bytecode, before initialisation.
    Raw(Box<[u8]>),
    /// The initialised internal instruction stream.
    Initialized(Box<[Instr]>),
    /// A native-code implementation.
    Native(NativeMethod),
}

/// One overload of a method.
pub struct MethodOverload {
    /// Parameter count, excluding the instance.
    pub param_count: u32,
    pub optional_param_count: u32,
    /// Number of local variable slots.
    pub locals: u32,
    /// Number of instance arguments (0 or 1).
    pub instance_count: u32,
    pub flags: OverloadFlags,
    pub param_names: Vec<*mut ManagedString>,
    pub ref_signature: RefSignature,
    pub try_blocks: Vec<TryBlock>,
    /// Maximum evaluation-stack height; drives frame sizing and the
    /// initialiser's stack validation.
    pub max_stack: u32,
    pub debug_symbols: Option<Box<[SourceLocation]>>,
    pub body: OverloadBody,
    /// The method group this overload belongs to.
    pub group: *mut Method,
    pub decl_type: *mut Type,
}

impl MethodOverload {
    pub fn new(flags: OverloadFlags) -> Self {
        Self {
            param_count: 0,
            optional_param_count: 0,
            locals: 0,
            instance_count: if flags.contains(OverloadFlags::INSTANCE) {
                1
            } else {
                0
            },
            flags,
            param_names: Vec::new(),
            ref_signature: RefSignature::EMPTY,
            try_blocks: Vec::new(),
            max_stack: 0,
            debug_symbols: None,
            body: OverloadBody::None,
            group: std::ptr::null_mut(),
            decl_type: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.flags.intersects(OverloadFlags::VARIADIC)
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags.contains(OverloadFlags::NATIVE)
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(OverloadFlags::ABSTRACT)
    }

    #[inline]
    pub fn is_instance_method(&self) -> bool {
        self.flags.contains(OverloadFlags::INSTANCE)
    }

    #[inline]
    pub fn is_ctor(&self) -> bool {
        self.flags.contains(OverloadFlags::CTOR)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.flags.contains(OverloadFlags::INITED)
    }

    /// Whether the overload accepts `argc` arguments (instance excluded).
    pub fn accepts(&self, argc: u32) -> bool {
        if self.is_variadic() {
            argc + 1 >= self.param_count
        } else {
            argc + self.optional_param_count >= self.param_count && argc <= self.param_count
        }
    }

    /// 1 for instance methods, 0 otherwise.
    #[inline]
    pub fn instance_offset(&self) -> u32 {
        self.instance_count
    }

    /// Parameter count including the instance.
    #[inline]
    pub fn effective_param_count(&self) -> u32 {
        self.param_count + self.instance_count
    }

    /// The initialised instruction stream.
    #[inline]
    pub fn instructions(&self) -> &[Instr] {
        match &self.body {
            OverloadBody::Initialized(code) => code,
            _ => &[],
        }
    }
}

/// A named group of overloads.
pub struct Method {
    pub member: MemberData,
    pub overloads: Vec<MethodOverload>,
    /// The method with the same name declared by the base type, if any.
    pub base_method: *mut Method,
}

impl Method {
    pub fn new(member: MemberData, overloads: Vec<MethodOverload>) -> Box<Method> {
        let mut method = Box::new(Method {
            member,
            overloads,
            base_method: std::ptr::null_mut(),
        });
        let group = &mut *method as *mut Method;
        for overload in method.overloads.iter_mut() {
            overload.group = group;
        }
        method
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.member.is_static()
    }

    /// Whether any overload in the group or its base chain accepts
    /// `argc` arguments.
    pub unsafe fn accepts(&self, argc: u32) -> bool {
        let mut method = self as *const Method;
        while !method.is_null() {
            if (*method).overloads.iter().any(|o| o.accepts(argc)) {
                return true;
            }
            method = (*method).base_method;
        }
        false
    }

    /// Resolves the group to an overload accepting `argc` arguments
    /// (instance excluded), walking the base method chain. Null when no
    /// overload matches.
    pub unsafe fn resolve_overload(&self, argc: u32) -> *mut MethodOverload {
        let mut method = self as *const Method;
        while !method.is_null() {
            for overload in (*method).overloads.iter() {
                if overload.accepts(argc) {
                    return overload as *const MethodOverload as *mut MethodOverload;
                }
            }
            method = (*method).base_method;
        }
        std::ptr::null_mut()
    }

    /// Binds the method and its overloads to a declaring type.
    pub unsafe fn set_decl_type(&mut self, ty: *mut Type) {
        self.member.decl_type = ty;
        for overload in self.overloads.iter_mut() {
            overload.decl_type = ty;
        }
    }
}
