//! The tagged value representation.
//!
//! A `Value` is 16 bytes: a pointer-width type tag plus an 8-byte payload.
//! The tag is normally a `*mut Type` (null for the null value). When the
//! low bit of the tag is set, the value is a *reference*:
//!
//! - `LOCAL_REFERENCE`: payload points at a `Value` slot (argument, local
//!   or evaluation-stack slot). Slots never move, so the GC leaves these
//!   alone.
//! - `STATIC_REFERENCE`: payload points at a `StaticRef` cell.
//! - any other odd tag: the bitwise complement of a byte offset from the
//!   GC object's base; payload points at the field inside the instance.
//!   The GC rewrites the payload when the object moves.

use crate::gc::object::GcObject;
use crate::gc::statics::StaticRef;
use crate::strings::ManagedString;
use crate::types::method::Method;
use crate::types::Type;

/// Tag of a reference to a `Value` slot on the call stack.
pub const LOCAL_REFERENCE: usize = usize::MAX; // -1
/// Tag of a reference to a `StaticRef` cell.
pub const STATIC_REFERENCE: usize = usize::MAX - 2; // -3

/// A managed value: type tag + 8-byte payload.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Value {
    tag: usize,
    payload: u64,
}

/// The null value.
pub const NULL_VALUE: Value = Value { tag: 0, payload: 0 };

impl Value {
    #[inline]
    pub fn null() -> Value {
        NULL_VALUE
    }

    #[inline]
    pub fn of_bool(bool_type: *mut Type, value: bool) -> Value {
        Value {
            tag: bool_type as usize,
            payload: value as u64,
        }
    }

    #[inline]
    pub fn of_int(int_type: *mut Type, value: i64) -> Value {
        Value {
            tag: int_type as usize,
            payload: value as u64,
        }
    }

    #[inline]
    pub fn of_uint(uint_type: *mut Type, value: u64) -> Value {
        Value {
            tag: uint_type as usize,
            payload: value,
        }
    }

    #[inline]
    pub fn of_real(real_type: *mut Type, value: f64) -> Value {
        Value {
            tag: real_type as usize,
            payload: value.to_bits(),
        }
    }

    #[inline]
    pub fn of_string(string_type: *mut Type, value: *mut ManagedString) -> Value {
        Value {
            tag: string_type as usize,
            payload: value as u64,
        }
    }

    /// A non-primitive value from its type and instance pointer.
    #[inline]
    pub fn of_instance(ty: *mut Type, instance: *mut u8) -> Value {
        Value {
            tag: ty as usize,
            payload: instance as u64,
        }
    }

    /// A reference to a call-stack slot.
    #[inline]
    pub fn local_reference(slot: *mut Value) -> Value {
        Value {
            tag: LOCAL_REFERENCE,
            payload: slot as u64,
        }
    }

    /// A reference to a static cell.
    #[inline]
    pub fn static_reference(cell: *mut StaticRef) -> Value {
        Value {
            tag: STATIC_REFERENCE,
            payload: cell as u64,
        }
    }

    /// A reference to a field inside a GC object. `byte_offset` is the
    /// offset of the field from the *object base* (header included).
    #[inline]
    pub fn field_reference(byte_offset: usize, field: *mut Value) -> Value {
        Value {
            tag: !byte_offset,
            payload: field as u64,
        }
    }

    // === Inspection ===

    #[inline]
    pub fn type_ptr(&self) -> *mut Type {
        debug_assert!(!self.is_reference());
        self.tag as *mut Type
    }

    #[inline]
    pub fn raw_tag(&self) -> usize {
        self.tag
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.tag == 0
    }

    #[inline]
    pub fn is_reference(&self) -> bool {
        self.tag & 1 != 0
    }

    /// For a field reference, the byte offset from the GC object base.
    #[inline]
    pub fn reference_offset(&self) -> usize {
        debug_assert!(self.is_reference());
        !self.tag
    }

    #[inline]
    pub fn as_bool(&self) -> bool {
        self.payload != 0
    }

    #[inline]
    pub fn as_int(&self) -> i64 {
        self.payload as i64
    }

    #[inline]
    pub fn as_uint(&self) -> u64 {
        self.payload
    }

    #[inline]
    pub fn as_real(&self) -> f64 {
        f64::from_bits(self.payload)
    }

    #[inline]
    pub fn as_string(&self) -> *mut ManagedString {
        self.payload as usize as *mut ManagedString
    }

    #[inline]
    pub fn as_instance(&self) -> *mut u8 {
        self.payload as usize as *mut u8
    }

    #[inline]
    pub fn as_reference_ptr(&self) -> *mut u8 {
        self.payload as usize as *mut u8
    }

    #[inline]
    pub fn as_list(&self) -> *mut ListInst {
        self.payload as usize as *mut ListInst
    }

    #[inline]
    pub fn as_hash(&self) -> *mut HashInst {
        self.payload as usize as *mut HashInst
    }

    #[inline]
    pub fn as_method_inst(&self) -> *mut MethodInst {
        self.payload as usize as *mut MethodInst
    }

    /// Rewrites the payload. Used by the GC when the referent has moved.
    #[inline]
    pub fn set_payload_ptr(&mut self, ptr: *mut u8) {
        self.payload = ptr as u64;
    }

    /// True when the value's type is non-null and, for primitives, the
    /// payload is nonzero. Null is false, `false` is false, zero Ints,
    /// UInts and Reals are false; everything else is true.
    #[inline]
    pub unsafe fn is_true(&self) -> bool {
        if self.tag == 0 {
            return false;
        }
        let ty = self.type_ptr();
        !(*ty).is_primitive() || self.payload != 0
    }

    #[inline]
    pub unsafe fn is_false(&self) -> bool {
        !self.is_true()
    }
}

/// Identity comparison: same type, and same payload (primitives) or same
/// instance pointer (everything else). Two nulls are the same reference.
#[inline]
pub unsafe fn is_same_reference(a: &Value, b: &Value) -> bool {
    if a.tag != b.tag {
        return false;
    }
    if a.tag == 0 {
        return true;
    }
    a.payload == b.payload
}

/// Reads through a reference value into `out`. Field references are read
/// under the owning object's field-access lock.
pub unsafe fn read_reference(reference: *const Value, out: *mut Value) {
    match (*reference).raw_tag() {
        LOCAL_REFERENCE => {
            *out = *((*reference).as_reference_ptr() as *mut Value);
        }
        STATIC_REFERENCE => {
            *out = (*((*reference).as_reference_ptr() as *mut StaticRef)).read();
        }
        _ => {
            let offset = (*reference).reference_offset();
            let gco = (*reference).as_reference_ptr().sub(offset) as *mut GcObject;
            (*gco).field_access.with(|| unsafe {
                *out = *((*reference).as_reference_ptr() as *mut Value);
            });
        }
    }
}

/// Writes through a reference value. Field references are written under the
/// owning object's field-access lock.
pub unsafe fn write_reference(reference: *const Value, value: *const Value) {
    match (*reference).raw_tag() {
        LOCAL_REFERENCE => {
            *((*reference).as_reference_ptr() as *mut Value) = *value;
        }
        STATIC_REFERENCE => {
            (*((*reference).as_reference_ptr() as *mut StaticRef)).write(*value);
        }
        _ => {
            let offset = (*reference).reference_offset();
            let gco = (*reference).as_reference_ptr().sub(offset) as *mut GcObject;
            (*gco).field_access.with(|| unsafe {
                *((*reference).as_reference_ptr() as *mut Value) = *value;
            });
        }
    }
}

// === Native instance layouts ===
//
// These layouts are the contract between the VM core and the native
// standard library. The library's initialiser functions fill them in; the
// core reads them directly (list/hash concatenation, variadic packing,
// function application, bound-method invocation).

/// Instance data of `aves.List`.
#[repr(C)]
pub struct ListInst {
    pub capacity: i32,
    pub length: i32,
    /// Backing storage: a GC value array of `capacity` slots.
    pub values: *mut Value,
}

/// One entry of `aves.Hash`. `hash_code == -1` marks an unused entry.
#[repr(C)]
pub struct HashEntry {
    pub hash_code: i32,
    pub next: i32,
    pub key: Value,
    pub value: Value,
}

/// Instance data of `aves.Hash`.
#[repr(C)]
pub struct HashInst {
    pub capacity: i32,
    pub count: i32,
    /// Backing storage: a GC array of `capacity` entries.
    pub entries: *mut HashEntry,
}

/// Instance data of `aves.Method`: a method group optionally bound to an
/// instance.
#[repr(C)]
pub struct MethodInst {
    pub method: *mut Method,
    pub instance: Value,
}
