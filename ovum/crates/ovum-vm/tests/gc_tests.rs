//! Garbage collector behaviour: survival, promotion, pinning and string
//! interning, driven through a booted VM so real types are in play.

mod common;

use common::*;
use ovum_vm::strings::{string_equals, string_to_rust};
use ovum_vm::value::Value;
use ovum_vm::vm::Vm;

/// Boots a VM whose program module is an empty main; only the aves types
/// matter here.
fn boot_gc_vm(dir: &std::path::Path) -> Box<Vm> {
    let mut pb = ProgramBuilder::new("gc_host");
    let mut a = Asm::new();
    a.retnull();
    pb.main_body(0, 8, vec![], a.into_vec());
    boot_vm(dir, &pb.writer)
}

#[test]
fn test_retained_objects_survive_and_promote() {
    let dir = tempfile::tempdir().unwrap();
    let vm = boot_gc_vm(dir.path());

    unsafe {
        let thread = vm.main_thread_ptr();
        let gc = vm.gc_ptr();
        let error_type = vm.types.error;
        let frame = (*thread).current_frame;

        // Allocate a large batch of small objects, keeping a reference to
        // every tenth one on the evaluation stack (a GC root). The batch
        // far exceeds the nursery, so plenty of cycles run along the way.
        const TOTAL: usize = 100_000;
        const KEEP_EVERY: usize = 10;
        let mut kept = 0u32;
        for i in 0..TOTAL {
            let mut value = Value::null();
            (*gc)
                .alloc_value(thread, error_type, (*error_type).total_size(), &mut value)
                .expect("allocation failed");

            if i % KEEP_EVERY == 0 {
                // Tag the first field so survival can be verified by value.
                let fields = value.as_instance() as *mut Value;
                *fields = Value::of_int(vm.types.int, i as i64);
                (*frame).push(value);
                kept += 1;
            }
        }
        assert_eq!(kept as usize, TOTAL / KEEP_EVERY);

        // One more full cycle: everything retained must survive and end
        // up in gen1; nothing is pinned.
        (*gc).collect(thread, true);

        assert_eq!((*gc).pinned_object_count(), 0);
        for n in 0..kept {
            let value = (*frame).peek(n);
            assert_eq!(value.type_ptr(), error_type);
            assert_eq!((*gc).generation_of(&value), 1);

            let fields = value.as_instance() as *mut Value;
            let tag = *fields;
            assert_eq!(tag.type_ptr(), vm.types.int);
            // Values were pushed in ascending order; peek walks down.
            assert_eq!(
                tag.as_int() as usize,
                (kept - 1 - n) as usize * KEEP_EVERY
            );
        }

        (*frame).stack_count -= kept;
    }
}

#[test]
fn test_pinned_object_does_not_move() {
    let dir = tempfile::tempdir().unwrap();
    let vm = boot_gc_vm(dir.path());

    unsafe {
        let thread = vm.main_thread_ptr();
        let gc = vm.gc_ptr();
        let frame = (*thread).current_frame;

        let mut value = Value::null();
        (*gc)
            .alloc_value(
                thread,
                vm.types.error,
                (*vm.types.error).total_size(),
                &mut value,
            )
            .unwrap();
        (*frame).push(value);
        let slot = (*frame).eval_stack.add((*frame).stack_count as usize - 1);

        assert_eq!((*gc).generation_of(&*slot), 0);
        let original_address = (*slot).as_instance();

        (*gc).pin_value(&*slot);
        (*gc).collect(thread, false);

        // Pinned: same address, still gen0, on the pinned list.
        assert_eq!((*slot).as_instance(), original_address);
        assert_eq!((*gc).generation_of(&*slot), 0);
        assert_eq!((*gc).pinned_object_count(), 1);

        (*gc).unpin_value(&*slot);
        (*gc).collect(thread, false);

        // Unpinned: the object moved into gen1 and the root was fixed up.
        assert_ne!((*slot).as_instance(), original_address);
        assert_eq!((*gc).generation_of(&*slot), 1);
        assert_eq!((*gc).pinned_object_count(), 0);

        (*frame).stack_count -= 1;
    }
}

#[test]
fn test_large_objects_never_move() {
    let dir = tempfile::tempdir().unwrap();
    let vm = boot_gc_vm(dir.path());

    unsafe {
        let thread = vm.main_thread_ptr();
        let gc = vm.gc_ptr();
        let frame = (*thread).current_frame;

        // The array is kept reachable through a list instance; the list
        // is pinned while the array is allocated so the raw pointer into
        // it stays valid across a potential cycle.
        let mut list_value = Value::null();
        (*gc)
            .alloc_value(thread, vm.types.list, (*vm.types.list).total_size(), &mut list_value)
            .unwrap();
        (*frame).push(list_value);
        (*gc).pin_value(&list_value);

        // A value array of 8192 slots is far over the LOH threshold.
        let mut values: *mut Value = std::ptr::null_mut();
        (*gc).alloc_value_array(thread, 8192, &mut values).unwrap();

        let list = list_value.as_list();
        (*list).capacity = 8192;
        (*list).length = 0;
        (*list).values = values;
        (*gc).unpin_value(&list_value);

        let before = (*list).values;
        (*gc).collect(thread, true);

        let list = (*(*frame).eval_stack.add((*frame).stack_count as usize - 1)).as_list();
        assert_eq!((*list).values, before);

        (*frame).stack_count -= 1;
    }
}

#[test]
fn test_intern_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let vm = boot_gc_vm(dir.path());

    unsafe {
        let thread = vm.main_thread_ptr();
        let gc = vm.gc_ptr();
        let frame = (*thread).current_frame;

        let units: Vec<u16> = "intern-me".encode_utf16().collect();
        let s = (*gc).construct_string(thread, units.len() as i32, Some(&units));
        assert!(!s.is_null());
        (*frame).push(Value::of_string(vm.types.string, s));

        // Interning is idempotent.
        let interned = (*gc).intern_string(thread, s);
        assert_eq!(interned, s);
        assert_eq!((*gc).intern_string(thread, interned), interned);
        assert!((*gc).has_interned_string(thread, s));

        // An equal, separately-constructed string resolves to the same
        // interned instance.
        let t = (*gc).construct_string(thread, units.len() as i32, Some(&units));
        assert!(string_equals(s, t));
        assert_eq!((*gc).get_interned_string(thread, t), interned);

        (*frame).stack_count -= 1;
    }
}

#[test]
fn test_interned_string_follows_moves() {
    let dir = tempfile::tempdir().unwrap();
    let vm = boot_gc_vm(dir.path());

    unsafe {
        let thread = vm.main_thread_ptr();
        let gc = vm.gc_ptr();
        let frame = (*thread).current_frame;

        let units: Vec<u16> = "movable".encode_utf16().collect();
        let s = (*gc).construct_string(thread, units.len() as i32, Some(&units));
        (*frame).push(Value::of_string(vm.types.string, s));
        (*gc).intern_string(thread, s);

        // The string starts in gen0; a cycle moves it to gen1 and the
        // intern table must follow.
        (*gc).collect(thread, false);

        let slot = (*frame).eval_stack.add((*frame).stack_count as usize - 1);
        let moved = (*slot).as_string();
        assert_ne!(moved, s);
        assert_eq!(string_to_rust(moved), "movable");
        assert!((*moved).is_interned());
        assert_eq!((*gc).get_interned_string(thread, moved), moved);

        (*frame).stack_count -= 1;
    }
}

#[test]
fn test_object_hash_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let vm = boot_gc_vm(dir.path());

    unsafe {
        let thread = vm.main_thread_ptr();
        let gc = vm.gc_ptr();
        let frame = (*thread).current_frame;

        let mut value = Value::null();
        (*gc)
            .alloc_value(
                thread,
                vm.types.error,
                (*vm.types.error).total_size(),
                &mut value,
            )
            .unwrap();
        (*frame).push(value);

        let hash = (*gc).object_hash_code(&value);
        assert_ne!(hash, 0);
        assert_eq!((*gc).object_hash_code(&value), hash);

        (*frame).stack_count -= 1;
    }
}
