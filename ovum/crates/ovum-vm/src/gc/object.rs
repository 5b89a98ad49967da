//! GC object headers.
//!
//! Every managed allocation is preceded by a [`GcObject`] header. The
//! header carries the tricolour mark, the generation, pinning state, the
//! intrusive list links the collector uses to track every object, a
//! spin lock guarding field accesses, and the managed type (or, once the
//! object has been moved out of gen0, the forwarding pointer).
//!
//! Header layout (64-bit):
//!
//! ```text
//! ┌──────────────┬──────────────┐
//! │ flags (u32)  │ pin_count    │
//! ├──────────────┴──────────────┤
//! │ size (usize, incl. header)  │
//! ├──────────────┬──────────────┤
//! │ hash_code    │ field lock   │
//! ├──────────────┴──────────────┤
//! │ prev                        │
//! ├─────────────────────────────┤
//! │ next                        │
//! ├─────────────────────────────┤
//! │ type or forwarding pointer  │
//! └─────────────────────────────┘
//! ```
//!
//! The instance data follows immediately after [`GCO_SIZE`] bytes.

use bitflags::bitflags;

use crate::sync::SpinLock;
use crate::types::Type;

bitflags! {
    /// Flags of a GC object. The two lowest bits hold the colour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcoFlags: u32 {
        /// Mask for extracting the colour.
        const COLOR         = 0x0003;

        /// A string allocated before the standard String type was loaded.
        const EARLY_STRING  = 0x0004;

        /// The object may not be moved. Only meaningful for gen0 objects.
        const PINNED        = 0x0008;

        /// The object lives in generation 0.
        const GEN_0         = 0x0010;
        /// The object lives in generation 1.
        const GEN_1         = 0x0020;
        /// The object lives in the large object heap and never moves.
        const LARGE_OBJECT  = 0x0040;
        /// Mask for extracting the generation.
        const GENERATION    = 0x0070;

        /// Set during a cycle when the object references non-pinned gen0
        /// objects; cleared once those references have been updated.
        const HAS_GEN0_REFS = 0x0080;

        /// The object has been moved to gen1; the type word holds the
        /// forwarding pointer and no other field may be read.
        const MOVED         = 0x0100;

        /// An array of `Value` slots with no managed type.
        const VALUE_ARRAY   = 0x0200;
        /// An array of unmanaged bytes with no managed type.
        const ARRAY         = 0x0400;
    }
}

/// One of the two swappable non-gray colours.
pub const COLOR_A: u32 = 1;
/// The other swappable colour.
pub const COLOR_B: u32 = 2;
/// The gray colour; only present while the mark phase runs.
pub const COLOR_GRAY: u32 = 3;

/// The header that precedes every managed allocation.
#[repr(C)]
pub struct GcObject {
    pub flags: GcoFlags,
    pub pin_count: u32,
    /// Total size in bytes, including this header.
    pub size: usize,
    /// Cached identity hash; 0 means not yet computed.
    pub hash_code: u32,
    /// Guards reads and writes of any field of the instance: a 16-byte
    /// `Value` cannot be copied atomically.
    pub field_access: SpinLock,
    pub prev: *mut GcObject,
    pub next: *mut GcObject,
    /// The managed type, or the forwarding pointer once `MOVED` is set.
    type_or_forward: usize,
}

/// The header size, aligned to 8 bytes. The instance base of an object is
/// its header address plus this.
pub const GCO_SIZE: usize = (std::mem::size_of::<GcObject>() + 7) & !7;

impl GcObject {
    #[inline]
    pub fn color(&self) -> u32 {
        (self.flags & GcoFlags::COLOR).bits()
    }

    #[inline]
    pub fn set_color(&mut self, color: u32) {
        self.flags = (self.flags - GcoFlags::COLOR)
            | GcoFlags::from_bits_retain(color & GcoFlags::COLOR.bits());
    }

    #[inline]
    pub fn generation(&self) -> GcoFlags {
        self.flags & GcoFlags::GENERATION
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(GcoFlags::PINNED)
    }

    #[inline]
    pub fn is_moved(&self) -> bool {
        self.flags.contains(GcoFlags::MOVED)
    }

    #[inline]
    pub fn has_gen0_refs(&self) -> bool {
        self.flags.contains(GcoFlags::HAS_GEN0_REFS)
    }

    #[inline]
    pub fn is_early_string(&self) -> bool {
        self.flags.contains(GcoFlags::EARLY_STRING)
    }

    #[inline]
    pub fn is_value_array(&self) -> bool {
        self.flags.contains(GcoFlags::VALUE_ARRAY)
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.flags
            .intersects(GcoFlags::ARRAY | GcoFlags::VALUE_ARRAY)
    }

    #[inline]
    pub fn type_ptr(&self) -> *mut Type {
        debug_assert!(!self.is_moved());
        self.type_or_forward as *mut Type
    }

    #[inline]
    pub fn set_type(&mut self, ty: *mut Type) {
        self.type_or_forward = ty as usize;
    }

    /// The forwarding pointer. Only valid when `MOVED` is set.
    #[inline]
    pub fn new_address(&self) -> *mut GcObject {
        debug_assert!(self.is_moved());
        self.type_or_forward as *mut GcObject
    }

    #[inline]
    pub fn set_new_address(&mut self, addr: *mut GcObject) {
        self.type_or_forward = addr as usize;
    }

    /// Base address of the instance data.
    #[inline]
    pub fn instance_base(&self) -> *mut u8 {
        unsafe { (self as *const GcObject as *mut u8).add(GCO_SIZE) }
    }

    /// Base address of the fields declared by `ty` inside this instance.
    #[inline]
    pub unsafe fn fields_base(&self, ty: *const Type) -> *mut crate::value::Value {
        self.instance_base().add((*ty).fields_offset as usize) as *mut crate::value::Value
    }

    /// Recovers the header from an instance pointer.
    #[inline]
    pub unsafe fn from_inst(inst: *mut u8) -> *mut GcObject {
        inst.sub(GCO_SIZE) as *mut GcObject
    }

    /// Recovers the header from a non-primitive value.
    #[inline]
    pub unsafe fn from_value(value: &crate::value::Value) -> *mut GcObject {
        Self::from_inst(value.as_instance())
    }

    /// Inserts this object at the head of `list`.
    ///
    /// Does not unlink from any previous list; call `remove_from_list`
    /// first unless the object is known not to be in one.
    pub unsafe fn insert_into_list(&mut self, list: *mut *mut GcObject) {
        self.prev = std::ptr::null_mut();
        self.next = *list;
        if !(*list).is_null() {
            (**list).prev = self as *mut GcObject;
        }
        *list = self as *mut GcObject;
    }

    /// Unlinks this object from `list`. The prev/next fields are left
    /// stale; `insert_into_list` overwrites them.
    pub unsafe fn remove_from_list(&mut self, list: *mut *mut GcObject) {
        let prev = self.prev;
        let next = self.next;

        if *list == self as *mut GcObject {
            *list = next;
        }
        if !prev.is_null() {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_is_aligned() {
        assert_eq!(GCO_SIZE % 8, 0);
        assert!(GCO_SIZE >= std::mem::size_of::<GcObject>());
    }

    #[test]
    fn test_color_round_trip() {
        let mut gco: GcObject = unsafe { std::mem::zeroed() };
        gco.flags = GcoFlags::GEN_0;
        gco.set_color(COLOR_GRAY);
        assert_eq!(gco.color(), COLOR_GRAY);
        assert_eq!(gco.generation(), GcoFlags::GEN_0);
        gco.set_color(COLOR_A);
        assert_eq!(gco.color(), COLOR_A);
    }

    #[test]
    fn test_list_insert_remove() {
        unsafe {
            let mut a: GcObject = std::mem::zeroed();
            let mut b: GcObject = std::mem::zeroed();
            let mut list: *mut GcObject = std::ptr::null_mut();

            a.insert_into_list(&mut list);
            b.insert_into_list(&mut list);
            assert_eq!(list, &mut b as *mut GcObject);
            assert_eq!(b.next, &mut a as *mut GcObject);

            b.remove_from_list(&mut list);
            assert_eq!(list, &mut a as *mut GcObject);
            assert!(a.prev.is_null());

            a.remove_from_list(&mut list);
            assert!(list.is_null());
        }
    }
}
