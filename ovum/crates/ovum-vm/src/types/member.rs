//! Type members: fields, methods and properties.
//!
//! A member is a discriminated union over the three kinds, each carrying
//! the same core data (name, flags, declaring type and module). The
//! accessibility rules live here:
//!
//! - public members are visible everywhere;
//! - private members are visible from the declaring type and from its
//!   *shared type* (an opt-in peer in the same module);
//! - protected members are visible from `from_type` when the instance's
//!   type inherits from `from_type` (or its shared type), and `from_type`
//!   (or its shared type) inherits from the member's *originating type* —
//!   for overridable methods the type that first introduced the method,
//!   not the one that overrides it.

use bitflags::bitflags;

use crate::ee::thread::Thread;
use crate::error::OpResult;
use crate::gc::object::GcObject;
use crate::gc::statics::StaticRef;
use crate::module::Module;
use crate::strings::ManagedString;
use crate::types::method::Method;
use crate::types::Type;
use crate::value::Value;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemberFlags: u16 {
        const FIELD     = 0x0001;
        const METHOD    = 0x0002;
        const PROPERTY  = 0x0004;

        const PUBLIC    = 0x0008;
        const PROTECTED = 0x0010;
        const PRIVATE   = 0x0020;

        const ABSTRACT  = 0x0080;
        const VIRTUAL   = 0x0100;
        const SEALED    = 0x0200;

        const INSTANCE  = 0x0400;

        /// The member implements internal behaviour (accessors, operator
        /// overloads, iterator accessors).
        const IMPL      = 0x0800;

        const ACCESS_LEVEL = 0x0038;
        const KIND         = 0x0007;
    }
}

/// Data shared by every member kind.
pub struct MemberData {
    pub name: *mut ManagedString,
    pub flags: MemberFlags,
    /// Null for global functions.
    pub decl_type: *mut Type,
    pub decl_module: *mut Module,
}

impl MemberData {
    pub fn new(
        name: *mut ManagedString,
        flags: MemberFlags,
        decl_type: *mut Type,
        decl_module: *mut Module,
    ) -> Self {
        Self {
            name,
            flags,
            decl_type,
            decl_module,
        }
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        !self.flags.contains(MemberFlags::INSTANCE)
    }

    #[inline]
    pub fn is_public(&self) -> bool {
        self.flags.contains(MemberFlags::PUBLIC)
    }
}

/// A field member. Instance fields store their byte offset from the
/// instance base; static fields get a lazily-created `StaticRef` cell.
pub struct Field {
    pub member: MemberData,
    pub offset: u32,
    pub static_value: *mut StaticRef,
}

impl Field {
    pub fn new(member: MemberData) -> Self {
        Self {
            member,
            offset: 0,
            static_value: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.member.is_static()
    }

    /// Direct pointer to the field's storage inside `instance`.
    #[inline]
    pub unsafe fn field_ptr(&self, instance: &Value) -> *mut Value {
        instance.as_instance().add(self.offset as usize) as *mut Value
    }

    /// Reads the field without any checks, under the object's field lock.
    pub unsafe fn read_field_unchecked(&self, instance: *const Value, result: *mut Value) {
        let gco = GcObject::from_value(&*instance);
        (*gco).field_access.with(|| unsafe {
            *result = *self.field_ptr(&*instance);
        });
    }

    /// Reads the field after a null check and an instance type check.
    pub unsafe fn read_field(
        &self,
        thread: *mut Thread,
        instance: *const Value,
        result: *mut Value,
    ) -> OpResult {
        if (*instance).is_null() {
            return (*thread).throw_null_reference_error(None);
        }
        if !Type::value_is_type(&*instance, self.member.decl_type) {
            return (*thread).throw_type_error(None);
        }
        self.read_field_unchecked(instance, result);
        Ok(())
    }

    /// Reads the field after a null check only.
    pub unsafe fn read_field_fast(
        &self,
        thread: *mut Thread,
        instance: *const Value,
        result: *mut Value,
    ) -> OpResult {
        if (*instance).is_null() {
            return (*thread).throw_null_reference_error(None);
        }
        self.read_field_unchecked(instance, result);
        Ok(())
    }

    /// Writes the field without checks. `args[0]` is the instance,
    /// `args[1]` the value.
    pub unsafe fn write_field_unchecked(&self, args: *mut Value) {
        let instance = &*args;
        let gco = GcObject::from_value(instance);
        (*gco).field_access.with(|| unsafe {
            *self.field_ptr(instance) = *args.add(1);
        });
    }

    pub unsafe fn write_field(&self, thread: *mut Thread, args: *mut Value) -> OpResult {
        let instance = &*args;
        if instance.is_null() {
            return (*thread).throw_null_reference_error(None);
        }
        if !Type::value_is_type(instance, self.member.decl_type) {
            return (*thread).throw_type_error(None);
        }
        self.write_field_unchecked(args);
        Ok(())
    }

    pub unsafe fn write_field_fast(&self, thread: *mut Thread, args: *mut Value) -> OpResult {
        if (*args).is_null() {
            return (*thread).throw_null_reference_error(None);
        }
        self.write_field_unchecked(args);
        Ok(())
    }
}

/// A property member: a getter and/or a setter method.
pub struct Property {
    pub member: MemberData,
    pub getter: *mut Method,
    pub setter: *mut Method,
}

impl Property {
    pub fn new(member: MemberData, getter: *mut Method, setter: *mut Method) -> Self {
        Self {
            member,
            getter,
            setter,
        }
    }
}

/// A member reference: field, method or property.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Field(*mut Field),
    Method(*mut Method),
    Property(*mut Property),
}

impl Member {
    pub unsafe fn data(&self) -> &MemberData {
        match self {
            Member::Field(f) => &(**f).member,
            Member::Method(m) => &(**m).member,
            Member::Property(p) => &(**p).member,
        }
    }

    pub unsafe fn flags(&self) -> MemberFlags {
        self.data().flags
    }

    pub unsafe fn name(&self) -> *mut ManagedString {
        self.data().name
    }

    pub unsafe fn decl_type(&self) -> *mut Type {
        self.data().decl_type
    }

    pub unsafe fn is_static(&self) -> bool {
        self.data().is_static()
    }

    /// Determines whether this member is accessible.
    ///
    /// `inst_type` is the type of the instance the member is accessed on
    /// (null for static access); `from_type` is the type declaring the
    /// accessing method (null for global functions).
    pub unsafe fn is_accessible(&self, inst_type: *const Type, from_type: *const Type) -> bool {
        let data = self.data();

        if data.flags.contains(MemberFlags::PRIVATE) {
            return !from_type.is_null()
                && (data.decl_type == from_type as *mut Type
                    || data.decl_type == (*from_type).shared_type);
        }

        if data.flags.contains(MemberFlags::PROTECTED) {
            if from_type.is_null() {
                return false;
            }
            return if !(*from_type).shared_type.is_null() {
                self.is_accessible_protected_with_shared_type(inst_type, from_type)
            } else {
                self.is_accessible_protected(inst_type, from_type)
            };
        }

        true
    }

    unsafe fn is_accessible_protected(
        &self,
        mut inst_type: *const Type,
        mut from_type: *const Type,
    ) -> bool {
        while !inst_type.is_null() && inst_type != from_type {
            inst_type = (*inst_type).base_type;
        }
        if inst_type.is_null() {
            return false; // the instance type does not inherit from from_type
        }

        let originating = self.originating_type();
        while !from_type.is_null() && from_type != originating as *const Type {
            from_type = (*from_type).base_type;
        }
        !from_type.is_null()
    }

    unsafe fn is_accessible_protected_with_shared_type(
        &self,
        inst_type: *const Type,
        from_type: *const Type,
    ) -> bool {
        let mut temp = inst_type;
        while !temp.is_null() && temp != from_type {
            temp = (*temp).base_type;
        }
        if temp.is_null() {
            let shared = (*from_type).shared_type as *const Type;
            let mut inst = inst_type;
            while !inst.is_null() && inst != shared {
                inst = (*inst).base_type;
            }
            if inst.is_null() {
                return false;
            }
        }

        let originating = self.originating_type() as *const Type;
        let mut temp = from_type;
        while !temp.is_null() && temp != originating {
            temp = (*temp).base_type;
        }
        if temp.is_null() {
            let mut shared = (*from_type).shared_type as *const Type;
            while !shared.is_null() && shared != originating {
                shared = (*shared).base_type;
            }
            if shared.is_null() {
                return false;
            }
        }

        true
    }

    /// The type that first introduced an overridable member: the deepest
    /// base method's declaring type for methods and properties, the
    /// declaring type for fields.
    unsafe fn originating_type(&self) -> *mut Type {
        let method = match self {
            Member::Method(m) => *m,
            Member::Property(p) => {
                if !(**p).getter.is_null() {
                    (**p).getter
                } else {
                    (**p).setter
                }
            }
            Member::Field(f) => return (**f).member.decl_type,
        };

        let mut method = method;
        while !(*method).base_method.is_null() {
            method = (*method).base_method;
        }
        (*method).member.decl_type
    }
}
