//! The type and member model.
//!
//! Types are built by the module loader and, once initialised, treated as
//! immutable apart from flag updates (operator finalisation, static
//! constructor state) and the lazily-created type token.

pub mod member;
pub mod method;

use bitflags::bitflags;
use parking_lot::ReentrantMutex;
use rustc_hash::FxHashMap;

use crate::ee::thread::Thread;
use crate::error::OpResult;
use crate::gc::statics::StaticRef;
use crate::module::Module;
use crate::strings::{ManagedString, StrKey};
use crate::value::Value;
use crate::vm::Vm;

use member::Member;
use method::{Method, MethodOverload};

bitflags! {
    /// Type flags. The low half mirrors the module file format; the high
    /// half is internal state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        const PUBLIC        = 0x0000_0001;
        const INTERNAL      = 0x0000_0002;
        const ACCESSIBILITY = 0x0000_00FF;

        const ABSTRACT      = 0x0000_0100;
        const SEALED        = 0x0000_0200;
        /// Static types are abstract and sealed.
        const STATIC        = 0x0000_0300;
        const IMPL          = 0x0000_1000;
        /// The type stores its data inline in the value payload.
        const PRIMITIVE     = 0x0000_2000;

        // Internal flags follow.

        /// The type does not use a plain `Value` array for its fields;
        /// the GC walks it through native field descriptors and the
        /// reference-walker callback.
        const CUSTOM_PTR          = 0x0001_0000;
        /// The operator table has been finalised against the base type.
        const OPS_INITED          = 0x0004_0000;
        /// The type has been initialised.
        const INITED              = 0x0008_0000;
        /// The static constructor has run.
        const STATIC_CTOR_RUN     = 0x0010_0000;
        /// The static constructor is running right now.
        const STATIC_CTOR_RUNNING = 0x0020_0000;
        /// The type or a base type has a finaliser.
        const HAS_FINALIZER       = 0x0040_0000;
    }
}

/// The overloadable operators, in opcode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operator {
    Add = 0,
    Sub,
    Or,
    Xor,
    Mul,
    Div,
    Mod,
    And,
    Pow,
    Shl,
    Shr,
    Plus,
    Neg,
    Not,
    Eq,
    Cmp,
}

/// Number of operator slots on every type.
pub const OPERATOR_COUNT: usize = 16;

impl Operator {
    pub fn from_index(index: u8) -> Option<Operator> {
        if (index as usize) < OPERATOR_COUNT {
            // Discriminants are contiguous from zero.
            Some(unsafe { std::mem::transmute::<u8, Operator>(index) })
        } else {
            None
        }
    }

    /// Operand count: 1 for the unary operators, 2 otherwise.
    pub fn arity(self) -> u32 {
        match self {
            Operator::Plus | Operator::Neg | Operator::Not => 1,
            _ => 2,
        }
    }

    /// The operator's source spelling, used in error messages.
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Or => "|",
            Operator::Xor => "^",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Mod => "%",
            Operator::And => "&",
            Operator::Pow => "**",
            Operator::Shl => "<<",
            Operator::Shr => ">>",
            Operator::Plus => "+",
            Operator::Neg => "-",
            Operator::Not => "~",
            Operator::Eq => "==",
            Operator::Cmp => "<=>",
        }
    }
}

/// How the GC should trace a native field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeFieldKind {
    /// The field is a `Value`.
    Value,
    /// The field is a possibly-null `*mut Value`.
    ValuePtr,
    /// The field is a possibly-null `*mut ManagedString`.
    String,
    /// The field points at the instance base of a GC array.
    GcArray,
}

/// A native field descriptor: an offset from the instance base plus the
/// tracing rule.
#[derive(Debug, Clone, Copy)]
pub struct NativeField {
    pub offset: usize,
    pub kind: NativeFieldKind,
}

/// Callback through which a custom-pointer type exposes its managed
/// references to the GC. Receives the base of the type's own fields and a
/// walker to call with each run of values.
pub type ReferenceGetter = unsafe fn(fields_base: *mut u8, walk: &mut dyn FnMut(*mut Value, usize));

/// Finaliser for native types, run at sweep time. Must not allocate
/// managed memory.
pub type Finalizer = unsafe fn(inst_base: *mut u8);

/// A managed type.
pub struct Type {
    pub flags: TypeFlags,

    /// Byte offset of this type's first field within an instance; equals
    /// the sum of the base chain's sizes.
    pub fields_offset: u32,
    /// Size in bytes of this type's own fields (base types excluded).
    pub size: usize,
    /// Number of `Value` instance fields declared by this type. For
    /// custom-pointer types the native field descriptors take over.
    pub field_count: i32,

    pub members: FxHashMap<StrKey, Member>,

    /// Null only for the root type.
    pub base_type: *mut Type,
    /// A peer type granted access to this type's private and protected
    /// members (and vice versa). Must live in the same module.
    pub shared_type: *mut Type,
    pub module: *mut Module,
    pub vm: *mut Vm,

    /// Fully qualified name, e.g. `aves.Object`.
    pub full_name: *mut ManagedString,

    /// The member named `.new`, if any.
    pub instance_ctor: *mut Method,

    pub get_references: Option<ReferenceGetter>,
    pub finalizer: Option<Finalizer>,
    pub native_fields: Vec<NativeField>,

    /// Lazily-created `aves.reflection.Type` instance bound to this type,
    /// held through a static reference so the GC never moves it.
    pub type_token: *mut StaticRef,

    /// Operator implementations; a null slot means the operator is not
    /// supported. Unset slots inherit from the base type when the table
    /// is finalised.
    pub operators: [*mut MethodOverload; OPERATOR_COUNT],

    /// Serialises static constructor runs. Reentrant: the running flag
    /// handles same-thread recursion.
    pub static_ctor_lock: ReentrantMutex<()>,
}

impl Type {
    pub fn new(module: *mut Module, vm: *mut Vm) -> Box<Type> {
        Box::new(Type {
            flags: TypeFlags::empty(),
            fields_offset: 0,
            size: 0,
            field_count: 0,
            members: FxHashMap::default(),
            base_type: std::ptr::null_mut(),
            shared_type: std::ptr::null_mut(),
            module,
            vm,
            full_name: std::ptr::null_mut(),
            instance_ctor: std::ptr::null_mut(),
            get_references: None,
            finalizer: None,
            native_fields: Vec::new(),
            type_token: std::ptr::null_mut(),
            operators: [std::ptr::null_mut(); OPERATOR_COUNT],
            static_ctor_lock: ReentrantMutex::new(()),
        })
    }

    #[inline]
    pub fn is_primitive(&self) -> bool {
        self.flags.contains(TypeFlags::PRIMITIVE)
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        self.flags.contains(TypeFlags::INTERNAL)
    }

    #[inline]
    pub fn has_finalizer(&self) -> bool {
        self.flags.contains(TypeFlags::HAS_FINALIZER)
    }

    #[inline]
    pub fn has_static_ctor_run(&self) -> bool {
        self.flags.contains(TypeFlags::STATIC_CTOR_RUN)
    }

    #[inline]
    pub fn is_static_ctor_running(&self) -> bool {
        self.flags.contains(TypeFlags::STATIC_CTOR_RUNNING)
    }

    /// Total instance size: this type's fields plus the whole base chain.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.fields_offset as usize + self.size
    }

    /// Whether `value` is of `ty` or a type derived from it.
    pub unsafe fn value_is_type(value: &Value, ty: *const Type) -> bool {
        let mut val_type = if value.is_null() {
            std::ptr::null_mut()
        } else {
            value.type_ptr()
        };
        while !val_type.is_null() {
            if val_type as *const Type == ty {
                return true;
            }
            val_type = (*val_type).base_type;
        }
        false
    }

    /// Looks up a member declared by this type only.
    pub unsafe fn get_member(&self, name: *mut ManagedString) -> Option<Member> {
        self.members.get(&StrKey(name)).copied()
    }

    /// Walks the base chain for the first member with the given name that
    /// is accessible from `from_type`. The search stops at the first name
    /// match regardless of accessibility further up the chain.
    pub unsafe fn find_member(
        &self,
        name: *mut ManagedString,
        from_type: *const Type,
    ) -> Option<Member> {
        let inst_type = self as *const Type;
        let mut ty = inst_type;
        while !ty.is_null() {
            if let Some(member) = (*ty).members.get(&StrKey(name)) {
                if member.is_accessible(inst_type, from_type) {
                    return Some(*member);
                }
            }
            ty = (*ty).base_type;
        }
        None
    }

    pub fn get_operator(&self, op: Operator) -> *mut MethodOverload {
        self.operators[op as usize]
    }

    /// Finalises the operator table: unset slots inherit from the base
    /// type. The base type's table must already be finalised.
    pub unsafe fn init_operators(&mut self) {
        self.flags |= TypeFlags::OPS_INITED;
        if self.base_type.is_null() {
            return;
        }
        debug_assert!((*self.base_type).flags.contains(TypeFlags::OPS_INITED));
        for op in 0..OPERATOR_COUNT {
            if self.operators[op].is_null() {
                self.operators[op] = (*self.base_type).operators[op];
            }
        }
    }

    /// Registers a native field descriptor for GC tracing.
    pub fn add_native_field(&mut self, offset: usize, kind: NativeFieldKind) {
        if !self.flags.contains(TypeFlags::INITED) {
            self.native_fields.push(NativeField { offset, kind });
        }
    }

    /// Sets the native instance size, marking the type custom-pointer.
    /// The effective size is rounded up to a multiple of 8.
    pub fn set_instance_size(&mut self, size: usize) {
        if !self.flags.contains(TypeFlags::INITED) {
            self.size = (size + 7) & !7;
            self.flags |= TypeFlags::CUSTOM_PTR;
        }
    }

    pub fn set_finalizer(&mut self, finalizer: Option<Finalizer>) {
        if !self.flags.contains(TypeFlags::INITED) {
            self.finalizer = finalizer;
            if finalizer.is_some() {
                self.flags |= TypeFlags::HAS_FINALIZER;
            } else if !self.base_type.is_null() {
                let inherited =
                    unsafe { (*self.base_type).flags & TypeFlags::HAS_FINALIZER };
                self.flags |= inherited;
            } else {
                self.flags -= TypeFlags::HAS_FINALIZER;
            }
        }
    }

    pub fn set_reference_getter(&mut self, getter: Option<ReferenceGetter>) {
        if !self.flags.contains(TypeFlags::INITED) {
            self.get_references = getter;
        }
    }

    /// Reads the type token, creating it on first request.
    pub unsafe fn get_type_token(&mut self, thread: *mut Thread, result: *mut Value) -> OpResult {
        if self.type_token.is_null() {
            self.load_type_token(thread)?;
        }
        *result = (*self.type_token).read();
        Ok(())
    }

    unsafe fn load_type_token(&mut self, thread: *mut Thread) -> OpResult {
        let vm = &mut *self.vm;
        let gc = vm.gc_ptr();

        // Type tokens can never be collected, so the instance lives in a
        // static reference. Allocate directly: aves.reflection.Type may
        // not have a public constructor.
        let cell = (*gc).add_static_reference(thread, Value::null());
        if cell.is_null() {
            return (*thread).throw_memory_error(None);
        }

        let token_type = vm.types.reflection_type;
        (*gc).alloc_value(
            thread,
            token_type,
            (*token_type).total_size(),
            (*cell).value_ptr(),
        )?;

        let init_type_token = vm
            .functions
            .init_type_token
            .expect("type token initializer not registered");
        init_type_token(thread, (*(*cell).value_ptr()).as_instance(), self as *mut Type)?;

        self.type_token = cell;
        Ok(())
    }

    /// Gives every static field of this type a fresh cell holding null.
    /// Returns false when out of memory.
    pub unsafe fn init_static_fields(&self, thread: *mut Thread) -> bool {
        let gc = (*self.vm).gc_ptr();
        for member in self.members.values() {
            if let Member::Field(field) = member {
                let field = *field;
                if (*field).is_static() && (*field).static_value.is_null() {
                    let cell = (*gc).add_static_reference(thread, Value::null());
                    if cell.is_null() {
                        return false;
                    }
                    (*field).static_value = cell;
                }
            }
        }
        true
    }

    /// Runs the type's static constructor (`.init`) at most once, under
    /// the static-ctor lock. Re-entrant calls on the same thread observe
    /// the running flag and return immediately.
    pub unsafe fn run_static_ctor(&mut self, thread: *mut Thread) -> OpResult {
        let _guard = self.static_ctor_lock.lock();

        if self.has_static_ctor_run() || self.is_static_ctor_running() {
            return Ok(());
        }

        self.flags |= TypeFlags::STATIC_CTOR_RUNNING;

        if !self.init_static_fields(thread) {
            self.flags -= TypeFlags::STATIC_CTOR_RUNNING;
            return (*thread).throw_memory_error(None);
        }

        let init_name = (*self.vm).strings.init_;
        if let Some(member) = self.get_member(init_name) {
            let result = match member {
                Member::Method(method) => {
                    let overload = (*method).resolve_overload(0);
                    if overload.is_null() {
                        (*thread).throw_no_overload_error(0, None)
                    } else {
                        let frame = (*thread).current_frame;
                        let args = (*frame).eval_stack.add((*frame).stack_count as usize);
                        let mut ignore = Value::null();
                        (*thread).invoke_method_overload(overload, 0, args, &mut ignore)
                    }
                }
                // A member named `.init` that is not a method never loads;
                // treat it as absent.
                _ => Ok(()),
            };
            if result.is_err() {
                self.flags -= TypeFlags::STATIC_CTOR_RUNNING;
                return result;
            }
        }

        self.flags -= TypeFlags::STATIC_CTOR_RUNNING;
        self.flags |= TypeFlags::STATIC_CTOR_RUN;
        Ok(())
    }
}

/// The standard types the VM must locate by fully-qualified name, plus
/// the native initialiser each of a subset requires.
pub const STANDARD_TYPE_NAMES: &[(&str, Option<&str>)] = &[
    ("aves.Object", None),
    ("aves.Boolean", None),
    ("aves.Int", None),
    ("aves.UInt", None),
    ("aves.Real", None),
    ("aves.String", None),
    ("aves.List", Some("InitListInstance")),
    ("aves.Hash", Some("InitHashInstance")),
    ("aves.Method", None),
    ("aves.Iterator", None),
    ("aves.reflection.Type", Some("InitTypeToken")),
    ("aves.Error", None),
    ("aves.TypeError", None),
    ("aves.MemoryError", None),
    ("aves.OverflowError", None),
    ("aves.NoOverloadError", None),
    ("aves.DivideByZeroError", None),
    ("aves.NullReferenceError", None),
    ("aves.MemberNotFoundError", None),
];

/// The resolved standard types, filled in as modules load.
pub struct StandardTypes {
    pub object: *mut Type,
    pub boolean: *mut Type,
    pub int: *mut Type,
    pub uint: *mut Type,
    pub real: *mut Type,
    pub string: *mut Type,
    pub list: *mut Type,
    pub hash: *mut Type,
    pub method: *mut Type,
    pub iterator: *mut Type,
    pub reflection_type: *mut Type,
    pub error: *mut Type,
    pub type_error: *mut Type,
    pub memory_error: *mut Type,
    pub overflow_error: *mut Type,
    pub no_overload_error: *mut Type,
    pub divide_by_zero_error: *mut Type,
    pub null_reference_error: *mut Type,
    pub member_not_found_error: *mut Type,
}

impl StandardTypes {
    pub fn new() -> Self {
        Self {
            object: std::ptr::null_mut(),
            boolean: std::ptr::null_mut(),
            int: std::ptr::null_mut(),
            uint: std::ptr::null_mut(),
            real: std::ptr::null_mut(),
            string: std::ptr::null_mut(),
            list: std::ptr::null_mut(),
            hash: std::ptr::null_mut(),
            method: std::ptr::null_mut(),
            iterator: std::ptr::null_mut(),
            reflection_type: std::ptr::null_mut(),
            error: std::ptr::null_mut(),
            type_error: std::ptr::null_mut(),
            memory_error: std::ptr::null_mut(),
            overflow_error: std::ptr::null_mut(),
            no_overload_error: std::ptr::null_mut(),
            divide_by_zero_error: std::ptr::null_mut(),
            null_reference_error: std::ptr::null_mut(),
            member_not_found_error: std::ptr::null_mut(),
        }
    }

    /// The slot a fully-qualified name maps to, if it names a standard
    /// type.
    pub fn slot_by_name(&mut self, name: &str) -> Option<&mut *mut Type> {
        Some(match name {
            "aves.Object" => &mut self.object,
            "aves.Boolean" => &mut self.boolean,
            "aves.Int" => &mut self.int,
            "aves.UInt" => &mut self.uint,
            "aves.Real" => &mut self.real,
            "aves.String" => &mut self.string,
            "aves.List" => &mut self.list,
            "aves.Hash" => &mut self.hash,
            "aves.Method" => &mut self.method,
            "aves.Iterator" => &mut self.iterator,
            "aves.reflection.Type" => &mut self.reflection_type,
            "aves.Error" => &mut self.error,
            "aves.TypeError" => &mut self.type_error,
            "aves.MemoryError" => &mut self.memory_error,
            "aves.OverflowError" => &mut self.overflow_error,
            "aves.NoOverloadError" => &mut self.no_overload_error,
            "aves.DivideByZeroError" => &mut self.divide_by_zero_error,
            "aves.NullReferenceError" => &mut self.null_reference_error,
            "aves.MemberNotFoundError" => &mut self.member_not_found_error,
            _ => return None,
        })
    }

    /// The first standard type that has not been loaded, if any.
    pub fn missing(&mut self) -> Option<&'static str> {
        for (name, _) in STANDARD_TYPE_NAMES {
            if self.slot_by_name(name).map(|s| s.is_null()).unwrap_or(false) {
                return Some(name);
            }
        }
        None
    }
}

impl Default for StandardTypes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_arity() {
        assert_eq!(Operator::Add.arity(), 2);
        assert_eq!(Operator::Neg.arity(), 1);
        assert_eq!(Operator::Plus.arity(), 1);
        assert_eq!(Operator::Not.arity(), 1);
        assert_eq!(Operator::Cmp.arity(), 2);
    }

    #[test]
    fn test_operator_from_index() {
        assert_eq!(Operator::from_index(0), Some(Operator::Add));
        assert_eq!(Operator::from_index(15), Some(Operator::Cmp));
        assert_eq!(Operator::from_index(16), None);
    }

    #[test]
    fn test_standard_type_slots_cover_table() {
        let mut types = StandardTypes::new();
        for (name, _) in STANDARD_TYPE_NAMES {
            assert!(types.slot_by_name(name).is_some(), "missing slot for {name}");
        }
        assert!(types.slot_by_name("aves.Nonsense").is_none());
        assert_eq!(types.missing(), Some("aves.Object"));
    }

    #[test]
    fn test_total_size() {
        let mut ty = Type::new(std::ptr::null_mut(), std::ptr::null_mut());
        ty.fields_offset = 32;
        ty.size = 48;
        assert_eq!(ty.total_size(), 80);
    }
}
