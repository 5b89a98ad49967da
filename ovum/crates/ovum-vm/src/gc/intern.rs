//! The string intern table.
//!
//! A hash-keyed set of `ManagedString*` with separate chaining through an
//! entry array and a free list, so that entries removed when interned
//! strings die can be reused without shifting. Module strings are interned
//! eagerly at load time; runtime strings on demand.

use crate::strings::{string_equals, string_hash, ManagedString, StringFlags};

use crate::gc::object::GcObject;

#[derive(Clone, Copy)]
struct Entry {
    /// Index of the next entry in the same bucket, or -1.
    next: i32,
    /// Hash of the value, with the sign bit cleared; -1 marks a freed slot.
    hash_code: i32,
    value: *mut ManagedString,
}

const EMPTY_ENTRY: Entry = Entry {
    next: -1,
    hash_code: 0,
    value: std::ptr::null_mut(),
};

pub struct StringTable {
    capacity: i32,
    count: i32,
    free_count: i32,
    free_list: i32,
    buckets: Vec<i32>,
    entries: Vec<Entry>,
}

/// Hash-table sizes, primes roughly doubling.
const PRIMES: &[i32] = &[
    31, 67, 137, 277, 557, 1117, 2237, 4481, 8963, 17929, 35863, 71741, 143483, 286973, 573953,
    1147921, 2295859,
];

fn get_prime(min: i32) -> i32 {
    for &p in PRIMES {
        if p >= min {
            return p;
        }
    }
    // Past the table, settle for the next odd number.
    min | 1
}

impl StringTable {
    pub fn new(capacity: i32) -> Self {
        let capacity = get_prime(capacity.max(1));
        Self {
            capacity,
            count: 0,
            free_count: 0,
            free_list: -1,
            buckets: vec![-1; capacity as usize],
            entries: vec![EMPTY_ENTRY; capacity as usize],
        }
    }

    pub fn len(&self) -> usize {
        (self.count - self.free_count) as usize
    }

    /// Looks up an equal interned string, without interning `value`.
    pub unsafe fn get_interned(&mut self, value: *mut ManagedString) -> *mut ManagedString {
        self.get_value(value, false)
    }

    pub unsafe fn has_interned(&mut self, value: *mut ManagedString) -> bool {
        !self.get_value(value, false).is_null()
    }

    /// Returns the interned string equal to `value`, interning `value`
    /// itself if no equal string is in the table yet.
    pub unsafe fn intern(&mut self, value: *mut ManagedString) -> *mut ManagedString {
        self.get_value(value, true)
    }

    unsafe fn get_value(&mut self, value: *mut ManagedString, add: bool) -> *mut ManagedString {
        let hash_code = string_hash(value) & i32::MAX;

        let mut bucket = (hash_code % self.capacity) as usize;
        let mut i = self.buckets[bucket];
        while i >= 0 {
            let e = &self.entries[i as usize];
            if e.hash_code == hash_code && string_equals(e.value, value) {
                return e.value;
            }
            i = e.next;
        }

        if !add {
            return std::ptr::null_mut();
        }

        let index;
        if self.free_count > 0 {
            index = self.free_list;
            self.free_list = self.entries[index as usize].next;
            self.free_count -= 1;
        } else {
            if self.count == self.capacity {
                self.resize();
                bucket = (hash_code % self.capacity) as usize;
            }
            index = self.count;
            self.count += 1;
        }

        let e = &mut self.entries[index as usize];
        e.next = self.buckets[bucket];
        e.hash_code = hash_code;
        e.value = value;
        self.buckets[bucket] = index;
        (*value).flags |= StringFlags::INTERN;
        value
    }

    /// Removes a dying interned string. Called only during the GC sweep.
    pub unsafe fn remove_intern(&mut self, value: *mut ManagedString) -> bool {
        debug_assert!((*value).flags.contains(StringFlags::INTERN));
        debug_assert!((*value).flags.contains(StringFlags::HASHED));

        let bucket = (((*value).hash_code & i32::MAX) % self.capacity) as usize;
        let mut prev: i32 = -1;
        let mut i = self.buckets[bucket];
        while i >= 0 {
            let next = self.entries[i as usize].next;
            // Pointer identity is enough: the table holds the one interned
            // instance of each value.
            if self.entries[i as usize].value == value {
                if prev < 0 {
                    self.buckets[bucket] = next;
                } else {
                    self.entries[prev as usize].next = next;
                }
                let e = &mut self.entries[i as usize];
                e.hash_code = -1;
                e.next = self.free_list;
                e.value = std::ptr::null_mut();
                self.free_list = i;
                self.free_count += 1;
                (*value).flags -= StringFlags::INTERN;
                return true;
            }
            prev = i;
            i = next;
        }

        false
    }

    /// After the GC moved an interned string out of gen0, repoints the
    /// table entry at the string's new location.
    pub unsafe fn update_intern(&mut self, new_value: *mut ManagedString) {
        let bucket = (((*new_value).hash_code & i32::MAX) % self.capacity) as usize;
        let mut i = self.buckets[bucket];
        while i >= 0 {
            let e = &mut self.entries[i as usize];
            if e.value != new_value && !e.value.is_null() {
                let gco = GcObject::from_inst(e.value as *mut u8);
                if (*gco).is_moved() && (*(*gco).new_address()).instance_base() == new_value as *mut u8
                {
                    e.value = new_value;
                    return;
                }
            }
            i = e.next;
        }
    }

    fn resize(&mut self) {
        let new_size = get_prime(self.capacity * 2);

        let mut new_buckets = vec![-1i32; new_size as usize];
        let mut new_entries = vec![EMPTY_ENTRY; new_size as usize];
        new_entries[..self.count as usize].copy_from_slice(&self.entries[..self.count as usize]);

        for i in 0..self.count {
            let e = &mut new_entries[i as usize];
            if e.hash_code >= 0 {
                let bucket = (e.hash_code % new_size) as usize;
                e.next = new_buckets[bucket];
                new_buckets[bucket] = i;
            }
        }

        self.capacity = new_size;
        self.buckets = new_buckets;
        self.entries = new_entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::alloc_static_str;

    #[test]
    fn test_intern_is_idempotent() {
        unsafe {
            let mut table = StringTable::new(4);
            let a = alloc_static_str("alpha");
            let b = alloc_static_str("alpha");

            let ia = table.intern(a);
            assert_eq!(ia, a);
            assert!((*a).is_interned());

            // An equal string interns to the same instance.
            let ib = table.intern(b);
            assert_eq!(ib, a);
            assert!(!(*b).is_interned());

            let interned_a = table.intern(a);
            assert_eq!(table.intern(interned_a), a);
            assert_eq!(table.len(), 1);
        }
    }

    #[test]
    fn test_get_interned_does_not_add() {
        unsafe {
            let mut table = StringTable::new(4);
            let a = alloc_static_str("beta");
            assert!(table.get_interned(a).is_null());
            assert!(!table.has_interned(a));
            table.intern(a);
            assert_eq!(table.get_interned(a), a);
        }
    }

    #[test]
    fn test_remove_and_reuse_slot() {
        unsafe {
            let mut table = StringTable::new(4);
            let a = alloc_static_str("gamma");
            let b = alloc_static_str("delta");
            table.intern(a);
            table.intern(b);
            assert_eq!(table.len(), 2);

            assert!(table.remove_intern(a));
            assert_eq!(table.len(), 1);
            assert!(!(*a).is_interned());
            assert!(table.get_interned(a).is_null());

            // The freed entry slot is reused.
            let c = alloc_static_str("epsilon");
            table.intern(c);
            assert_eq!(table.len(), 2);
        }
    }

    #[test]
    fn test_resize_keeps_entries() {
        unsafe {
            let mut table = StringTable::new(1);
            let mut strings = Vec::new();
            for i in 0..100 {
                let s = alloc_static_str(&format!("string-{i}"));
                strings.push(s);
                table.intern(s);
            }
            assert_eq!(table.len(), 100);
            for s in strings {
                assert_eq!(table.get_interned(s), s);
            }
        }
    }
}
