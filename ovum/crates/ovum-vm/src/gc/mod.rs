//! The generational tracing garbage collector.
//!
//! Objects live in one of three places: the bump-allocated gen0 nursery,
//! the chunk-allocated gen1 heap, or the large-object heap. Every object
//! is linked into one of the collector's intrusive lists; between cycles
//! all collectible objects sit on the collect list and pinned gen0
//! survivors on the pinned list.
//!
//! A cycle runs in six phases:
//!
//! 1. merge the pinned list into the collect list and start marking
//! 2. mark the root set (call stacks, static references, module strings,
//!    the current error), moving reached objects to the gray process list
//! 3. drain the process list, walking instance fields and classifying
//!    survivors (gen0 / has-gen0-refs / keep)
//! 4. move unpinned gen0 survivors into gen1, leaving forwarding pointers;
//!    rebuild the pinned list sorted by address
//! 5. fix up every root and every object holding gen0 references
//! 6. sweep the remaining collect list (finalisers, intern-table removal),
//!    collecting gen1 only when its dead-byte estimate crosses the
//!    threshold, then swap the white and black marks
//!
//! Allocation and interning are guarded by the allocation section; a
//! thread that has to wait for it enters an unmanaged region first so a
//! cycle can proceed without it.

pub mod heap;
pub mod intern;
pub mod object;
pub mod statics;

use log::debug;

use crate::ee::thread::Thread;
use crate::error::{OpResult, Trap};
use crate::strings::{ManagedString, StringFlags};
use crate::sync::Section;
use crate::types::{NativeFieldKind, Type, TypeFlags};
use crate::value::{Value, LOCAL_REFERENCE, STATIC_REFERENCE};
use crate::vm::Vm;

use heap::{align_up, Gen0Heap};
use intern::StringTable;
use object::{GcObject, GcoFlags, COLOR_A, COLOR_B, COLOR_GRAY, GCO_SIZE};
use statics::{StaticRef, StaticRefBlock};

/// Collector tunables. The defaults match the sizes the VM was designed
/// around; `validate` rejects configurations the collector cannot run with.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Size of the gen0 nursery in bytes.
    pub gen0_size: usize,
    /// Minimum size (header included) for large-object-heap allocation.
    pub large_object_size: usize,
    /// Dead-byte estimate at which gen1 is collected.
    pub gen1_dead_threshold: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gen0_size: heap::GEN0_SIZE,
            large_object_size: heap::LARGE_OBJECT_SIZE,
            gen1_dead_threshold: heap::GEN1_DEAD_OBJECTS_THRESHOLD,
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.gen0_size < 64 * 1024 {
            return Err("gen0_size must be at least 64 KiB".to_string());
        }
        if self.large_object_size <= GCO_SIZE {
            return Err("large_object_size must exceed the object header size".to_string());
        }
        Ok(())
    }
}

/// Transient lists used during one cycle.
struct CycleLists {
    process: *mut GcObject,
    keep: *mut GcObject,
    /// Survivors from generation 0, pinned ones included.
    gen0_survivors: *mut GcObject,
    /// Non-gen0 survivors holding references to movable gen0 objects.
    with_gen0_refs: *mut GcObject,
    /// Total size of gen1 survivors (LOH excluded).
    gen1_survivor_size: usize,
}

impl CycleLists {
    fn new() -> Self {
        Self {
            process: std::ptr::null_mut(),
            keep: std::ptr::null_mut(),
            gen0_survivors: std::ptr::null_mut(),
            with_gen0_refs: std::ptr::null_mut(),
            gen1_survivor_size: 0,
        }
    }
}

pub struct Gc {
    vm: *mut Vm,
    config: GcConfig,
    gen0: Gen0Heap,
    /// Total size of generation 1, not counting the large object heap.
    gen1_size: usize,
    collect_list: *mut GcObject,
    pinned_list: *mut GcObject,
    /// The colour collectible objects carry right now; swapped with black
    /// every cycle.
    current_white: u32,
    collect_count: u32,
    strings: StringTable,
    static_refs: *mut StaticRefBlock,
    alloc_section: Section,
}

impl Gc {
    pub fn new(config: GcConfig) -> std::io::Result<Box<Gc>> {
        config
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let gen0 = Gen0Heap::new(config.gen0_size)?;
        Ok(Box::new(Gc {
            vm: std::ptr::null_mut(),
            gen0,
            config,
            gen1_size: 0,
            collect_list: std::ptr::null_mut(),
            pinned_list: std::ptr::null_mut(),
            current_white: COLOR_A,
            collect_count: 0,
            strings: StringTable::new(32),
            static_refs: std::ptr::null_mut(),
            alloc_section: Section::new(),
        }))
    }

    pub fn set_vm(&mut self, vm: *mut Vm) {
        self.vm = vm;
    }

    #[inline]
    fn current_black(&self) -> u32 {
        COLOR_A + COLOR_B - self.current_white
    }

    pub fn collect_count(&self) -> u32 {
        self.collect_count
    }

    /// Number of objects currently on the pinned list.
    pub fn pinned_object_count(&self) -> usize {
        let mut count = 0;
        let mut gco = self.pinned_list;
        while !gco.is_null() {
            count += 1;
            gco = unsafe { (*gco).next };
        }
        count
    }

    pub fn gen1_size(&self) -> usize {
        self.gen1_size
    }

    // === Allocation ===

    /// Enters the allocation section. If another thread holds it, this one
    /// enters an unmanaged region while it waits, so a GC cycle triggered
    /// by the lock holder is not deadlocked on us. Must be paired with
    /// `end_alloc`.
    unsafe fn begin_alloc(&self, thread: *mut Thread) {
        if !self.alloc_section.try_enter() {
            if !thread.is_null() {
                (*thread).enter_unmanaged_region();
            }
            self.alloc_section.enter();
            if !thread.is_null() {
                (*thread).leave_unmanaged_region();
            }
        }
    }

    fn end_alloc(&self) {
        self.alloc_section.leave();
    }

    /// Raw allocation: gen0 bump allocation (skipping past any pinned
    /// objects in the way), or the LOH for oversized requests. Returns
    /// null when gen0 is exhausted.
    unsafe fn alloc_raw(&mut self, size: usize) -> *mut GcObject {
        debug_assert!(size >= GCO_SIZE);

        if size >= self.config.large_object_size {
            let chunk = heap::alloc_chunk(align_up(size));
            if chunk.is_null() {
                return std::ptr::null_mut();
            }
            std::ptr::write_bytes(chunk, 0, align_up(size));
            let gco = chunk as *mut GcObject;
            (*gco).flags |= GcoFlags::LARGE_OBJECT;
            return gco;
        }

        // Skip past pinned objects that overlap the proposed region. The
        // pinned list is sorted by address, so one forward walk suffices;
        // skipped objects rejoin the collect list.
        if !self.pinned_list.is_null() {
            let mut pinned = self.pinned_list;
            while !pinned.is_null() {
                let start = pinned as usize;
                let end = start + (*pinned).size;
                let current = self.gen0.current();
                if !(current < end && start < current + size) {
                    break;
                }
                let next = (*pinned).next;
                (*pinned).insert_into_list(&mut self.collect_list);
                self.gen0.set_current(start + align_up((*pinned).size));
                pinned = next;
            }
            self.pinned_list = pinned;
        }

        let raw = self.gen0.bump(align_up(size));
        if raw.is_null() {
            return std::ptr::null_mut();
        }
        let gco = raw as *mut GcObject;
        (*gco).flags |= GcoFlags::GEN_0;
        gco
    }

    /// Gen1 allocation. Not zeroed; the caller copies the old object over.
    unsafe fn alloc_raw_gen1(&mut self, size: usize) -> *mut GcObject {
        heap::alloc_chunk(align_up(size)) as *mut GcObject
    }

    unsafe fn release_raw(&mut self, gco: *mut GcObject) {
        match (*gco).generation() {
            GcoFlags::GEN_1 => {
                self.gen1_size -= (*gco).size;
                heap::free_chunk(gco as *mut u8, align_up((*gco).size));
            }
            GcoFlags::LARGE_OBJECT => {
                heap::free_chunk(gco as *mut u8, align_up((*gco).size));
            }
            _ => {} // gen0 memory is reclaimed wholesale
        }
    }

    /// Allocates a managed object of `size` instance bytes, triggering a
    /// cycle and retrying once on exhaustion.
    pub unsafe fn alloc(
        &mut self,
        thread: *mut Thread,
        ty: *mut Type,
        size: usize,
        output: &mut *mut GcObject,
    ) -> OpResult {
        if usize::MAX - size < GCO_SIZE {
            return (*thread)
                .throw_memory_error(Some("The size of the requested object was too large."));
        }

        self.begin_alloc(thread);

        let size = size + GCO_SIZE;
        let mut gco = self.alloc_raw(size);

        if gco.is_null() {
            // Try to free some memory, then try again.
            self.run_cycle(thread, size >= self.config.large_object_size);
            gco = self.alloc_raw(size);
            if gco.is_null() {
                self.end_alloc();
                return Err(Trap::NoMemory);
            }
        }

        (*gco).size = size;
        (*gco).set_type(ty);
        (*gco).set_color(self.current_white);
        (*gco).insert_into_list(&mut self.collect_list);

        *output = gco;
        self.end_alloc();
        Ok(())
    }

    /// Allocates an object and wraps it in a value.
    pub unsafe fn alloc_value(
        &mut self,
        thread: *mut Thread,
        ty: *mut Type,
        size: usize,
        output: *mut Value,
    ) -> OpResult {
        let mut gco = std::ptr::null_mut();
        self.alloc(thread, ty, size, &mut gco)?;
        *output = Value::of_instance(ty, (*gco).instance_base());
        Ok(())
    }

    /// Allocates a GC array of `length` values, traced slot by slot.
    pub unsafe fn alloc_value_array(
        &mut self,
        thread: *mut Thread,
        length: usize,
        output: &mut *mut Value,
    ) -> OpResult {
        if length > usize::MAX / std::mem::size_of::<Value>() {
            return (*thread).throw_overflow_error(None);
        }
        let mut gco = std::ptr::null_mut();
        self.alloc(
            thread,
            std::ptr::null_mut(),
            length * std::mem::size_of::<Value>(),
            &mut gco,
        )?;
        (*gco).flags |= GcoFlags::VALUE_ARRAY;
        *output = (*gco).instance_base() as *mut Value;
        Ok(())
    }

    /// Allocates a GC array of `length` unmanaged items.
    pub unsafe fn alloc_array(
        &mut self,
        thread: *mut Thread,
        length: usize,
        item_size: usize,
        output: &mut *mut u8,
    ) -> OpResult {
        if item_size > 0 && length > usize::MAX / item_size {
            return (*thread).throw_overflow_error(None);
        }
        let mut gco = std::ptr::null_mut();
        self.alloc(thread, std::ptr::null_mut(), length * item_size, &mut gco)?;
        (*gco).flags |= GcoFlags::ARRAY;
        *output = (*gco).instance_base();
        Ok(())
    }

    // === Construction ===

    /// Allocates an instance of `ty` and invokes its constructor with the
    /// `argc` topmost values of the evaluation stack.
    pub unsafe fn construct(
        &mut self,
        thread: *mut Thread,
        ty: *mut Type,
        argc: u16,
        output: Option<*mut Value>,
    ) -> OpResult {
        let vm = &*self.vm;
        if ty == vm.types.string
            || (*ty).is_primitive()
            || (*ty).flags.contains(TypeFlags::ABSTRACT)
        {
            return (*thread).throw_type_error(None);
        }

        let frame = (*thread).current_frame;
        let args = (*frame)
            .eval_stack
            .add((*frame).stack_count as usize - argc as usize);
        match output {
            Some(out) => self.construct_ll(thread, ty, argc, args, out),
            None => {
                // The instance replaces the consumed arguments on the stack.
                let mut result = Value::null();
                self.construct_ll(thread, ty, argc, args, &mut result)?;
                *args = result;
                (*frame).stack_count += 1;
                Ok(())
            }
        }
    }

    /// Low-level construction: `args` points at the first constructor
    /// argument on the evaluation stack. The new instance is unshifted
    /// under the arguments, the constructor runs, and the instance is
    /// written to `output`.
    pub unsafe fn construct_ll(
        &mut self,
        thread: *mut Thread,
        ty: *mut Type,
        argc: u16,
        args: *mut Value,
        output: *mut Value,
    ) -> OpResult {
        let mut gco: *mut GcObject = std::ptr::null_mut();
        self.alloc(thread, ty, (*ty).total_size(), &mut gco)?;

        // Unshift the new instance under the arguments.
        let mut slot = args.add(argc as usize);
        for _ in 0..argc {
            *slot = *slot.sub(1);
            slot = slot.sub(1);
        }
        *slot = Value::of_instance(ty, (*gco).instance_base());
        let frame = (*thread).current_frame;
        (*frame).stack_count += 1;

        let ctor = (*ty).instance_ctor;
        debug_assert!(!ctor.is_null());
        let overload = (*ctor).resolve_overload(argc as u32);
        debug_assert!(!overload.is_null());

        let mut ignore = Value::null();
        (*thread).invoke_method_overload(overload, argc as u32, slot, &mut ignore)?;

        // The constructor may have triggered a cycle that moved the new
        // instance; its `this` slot was fixed up by the collector, so
        // read the result from there rather than from the stale header.
        *output = *slot;
        Ok(())
    }

    // === Strings ===

    /// Constructs a managed string of `length` code units, copied from
    /// `source` when given, zeroed otherwise. Returns null on failure.
    pub unsafe fn construct_string(
        &mut self,
        thread: *mut Thread,
        length: i32,
        source: Option<&[u16]>,
    ) -> *mut ManagedString {
        let vm = &*self.vm;
        let mut gco: *mut GcObject = std::ptr::null_mut();
        // required_size includes the header and the NUL terminator; the
        // allocation is zeroed, so hash and flags start out clear.
        let size = crate::strings::required_size(length as usize);
        if self.alloc(thread, vm.types.string, size, &mut gco).is_err() {
            return std::ptr::null_mut();
        }

        let s = (*gco).instance_base() as *mut ManagedString;
        (*s).length = length;
        if let Some(source) = source {
            debug_assert!(source.len() >= length as usize);
            std::ptr::copy_nonoverlapping(
                source.as_ptr(),
                &mut (*s).first_char as *mut u16,
                length as usize,
            );
        }
        s
    }

    /// Constructs a string from a Rust string slice.
    pub unsafe fn convert_string(
        &mut self,
        thread: *mut Thread,
        text: &str,
    ) -> *mut ManagedString {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.construct_string(thread, units.len() as i32, Some(&units))
    }

    /// Constructs a module string: placed straight into a gen1 chunk and
    /// pinned, so that it never moves. Module strings are interned by the
    /// loader. Returns null when out of memory.
    pub unsafe fn construct_module_string(
        &mut self,
        _thread: *mut Thread,
        units: &[u16],
    ) -> *mut ManagedString {
        let size = crate::strings::required_size(units.len()) + GCO_SIZE;

        let gco = self.alloc_raw_gen1(size);
        if gco.is_null() {
            return std::ptr::null_mut();
        }
        std::ptr::write_bytes(gco as *mut u8, 0, align_up(size));

        let string_type = (*self.vm).types.string;
        (*gco).size = size;
        (*gco).set_type(string_type);
        (*gco).flags |= GcoFlags::GEN_1 | GcoFlags::PINNED;
        (*gco).set_color(self.current_white);
        if string_type.is_null() {
            (*gco).flags |= GcoFlags::EARLY_STRING;
        }
        (*gco).pin_count += 1;
        self.gen1_size += size;
        (*gco).insert_into_list(&mut self.collect_list);

        let s = (*gco).instance_base() as *mut ManagedString;
        (*s).length = units.len() as i32;
        std::ptr::copy_nonoverlapping(
            units.as_ptr(),
            &mut (*s).first_char as *mut u16,
            units.len(),
        );
        s
    }

    pub unsafe fn get_interned_string(
        &mut self,
        thread: *mut Thread,
        value: *mut ManagedString,
    ) -> *mut ManagedString {
        self.begin_alloc(thread);
        let result = self.strings.get_interned(value);
        self.end_alloc();
        result
    }

    pub unsafe fn has_interned_string(
        &mut self,
        thread: *mut Thread,
        value: *mut ManagedString,
    ) -> bool {
        self.begin_alloc(thread);
        let result = self.strings.has_interned(value);
        self.end_alloc();
        result
    }

    pub unsafe fn intern_string(
        &mut self,
        thread: *mut Thread,
        value: *mut ManagedString,
    ) -> *mut ManagedString {
        self.begin_alloc(thread);
        let result = self.strings.intern(value);
        self.end_alloc();
        result
    }

    // === Static references ===

    /// Claims a new static reference cell holding `value`. Returns null
    /// when out of memory.
    pub unsafe fn add_static_reference(
        &mut self,
        thread: *mut Thread,
        value: Value,
    ) -> *mut StaticRef {
        self.begin_alloc(thread);

        if self.static_refs.is_null() || (*self.static_refs).is_full() {
            let block = StaticRefBlock::new(self.static_refs);
            self.static_refs = Box::into_raw(block);
        }
        let cell = (*self.static_refs).add(value);
        self.end_alloc();
        cell
    }

    // === Pinning ===

    pub unsafe fn pin_value(&mut self, value: &Value) {
        if !value.is_null() && !(*value.type_ptr()).is_primitive() {
            let gco = GcObject::from_value(value);
            (*gco).field_access.with(|| unsafe {
                (*gco).pin_count += 1;
                (*gco).flags |= GcoFlags::PINNED;
            });
        }
    }

    pub unsafe fn unpin_value(&mut self, value: &Value) {
        if !value.is_null() && !(*value.type_ptr()).is_primitive() {
            let gco = GcObject::from_value(value);
            (*gco).field_access.with(|| unsafe {
                (*gco).pin_count -= 1;
                if (*gco).pin_count == 0 {
                    (*gco).flags -= GcoFlags::PINNED;
                }
            });
        }
    }

    /// The generation a value lives in: 0, 1 (gen1 and LOH), or -1 for
    /// primitives.
    pub unsafe fn generation_of(&self, value: &Value) -> i32 {
        if value.is_null() || (*value.type_ptr()).is_primitive() {
            return -1;
        }
        match (*GcObject::from_value(value)).generation() {
            GcoFlags::GEN_0 => 0,
            GcoFlags::GEN_1 | GcoFlags::LARGE_OBJECT => 1,
            _ => -1,
        }
    }

    /// Identity hash of a non-primitive value, derived from the object
    /// address on first request and cached in the header.
    pub unsafe fn object_hash_code(&self, value: &Value) -> u32 {
        if value.is_null() || (*value.type_ptr()).is_primitive() {
            return 0;
        }
        let gco = GcObject::from_value(value);
        if (*gco).hash_code == 0 {
            let addr = (gco as usize as u64) >> 3;
            (*gco).hash_code = (addr as u32) ^ ((addr >> 23) as u32);
        }
        (*gco).hash_code
    }

    // === The cycle ===

    /// Runs a full collection. `collect_gen1` forces gen1 to be swept even
    /// below the dead-byte threshold.
    pub unsafe fn collect(&mut self, thread: *mut Thread, collect_gen1: bool) {
        self.begin_alloc(thread);
        self.run_cycle(thread, collect_gen1);
        self.end_alloc();
    }

    unsafe fn run_cycle(&mut self, thread: *mut Thread, mut collect_gen1: bool) {
        (*thread).begin_gc_cycle();
        self.collect_count += 1;

        // Pinned objects from the previous cycle rejoin the collect list;
        // the pinned list is rebuilt below.
        let mut pinned = self.pinned_list;
        while !pinned.is_null() {
            let next = (*pinned).next;
            (*pinned).insert_into_list(&mut self.collect_list);
            pinned = next;
        }
        self.pinned_list = std::ptr::null_mut();

        let mut lists = CycleLists::new();

        // Phase 2: roots go gray.
        self.mark_root_set(&mut lists);

        // Phase 3: drain the gray list.
        while !lists.process.is_null() {
            let mut item = lists.process;
            while !item.is_null() {
                let next = (*item).next;
                self.process_object_and_fields(&mut lists, item);
                item = next;
            }
        }

        // Phase 4: move gen0 survivors into gen1.
        self.move_gen0_survivors(&mut lists);
        debug_assert!(lists.gen0_survivors.is_null());

        // Phase 5: fix up everything that pointed at moved objects.
        self.update_gen0_references(&mut lists, thread);
        debug_assert!(lists.with_gen0_refs.is_null());

        // Phase 6: sweep.
        if !collect_gen1 {
            collect_gen1 =
                self.gen1_size - lists.gen1_survivor_size >= self.config.gen1_dead_threshold;
        }
        let mut freed = 0usize;
        let mut item = self.collect_list;
        while !item.is_null() {
            let next = (*item).next;
            if collect_gen1 || (*item).generation() != GcoFlags::GEN_1 {
                freed += (*item).size;
                self.release(item);
            } else {
                // Uncollected gen1 object; it goes back on the collect
                // list as black, which becomes white after the swap.
                (*item).insert_into_list(&mut lists.keep);
                (*item).set_color(self.current_black());
            }
            item = next;
        }
        self.collect_list = std::ptr::null_mut();

        // Swap marks and reset the nursery for the next cycle.
        self.current_white = self.current_black();
        self.collect_list = lists.keep;
        self.gen0.reset();

        debug!(
            "gc cycle {} done: freed {} bytes, gen1 {} bytes, gen1 collected: {}",
            self.collect_count, freed, self.gen1_size, collect_gen1
        );

        (*thread).end_gc_cycle();
    }

    unsafe fn mark_root_set(&mut self, lists: &mut CycleLists) {
        let vm = &mut *self.vm;
        let thread = vm.main_thread_ptr();

        // Call stack frames, top to bottom. Arguments precede each frame;
        // locals and the eval stack follow it contiguously. The bottom
        // frame has no method, but values pushed onto it before the main
        // method starts are roots all the same.
        let mut frame = (*thread).current_frame;
        while !frame.is_null() {
            let method = (*frame).method;
            if method.is_null() {
                if (*frame).stack_count > 0 {
                    self.process_local_values(
                        lists,
                        (*frame).eval_stack,
                        (*frame).stack_count as usize,
                    );
                }
            } else {
                let param_count = (*method).effective_param_count() as usize;
                if param_count > 0 {
                    self.process_local_values(
                        lists,
                        (frame as *mut Value).sub(param_count),
                        param_count,
                    );
                }
                let live = (*method).locals as usize + (*frame).stack_count as usize;
                if live > 0 {
                    self.process_local_values(lists, (*frame).locals_ptr(), live);
                }
            }
            frame = (*frame).prev_frame;
        }

        // The current error may only be reachable from here, and a cycle
        // can run inside a finally before the error is caught.
        let mut ignored = false;
        let error = &mut (*thread).current_error as *mut Value;
        self.try_mark_for_processing(lists, error, &mut ignored);

        // Module strings: interned, pinned into gen1, never collected
        // while the module is loaded.
        for &module in (*self.vm).modules.all() {
            self.try_mark_string(lists, (*module).name, &mut ignored);
            for &s in (*module).strings.iter() {
                self.try_mark_string(lists, s, &mut ignored);
            }
        }

        // Static reference blocks.
        let mut block = self.static_refs;
        while !block.is_null() {
            let count = (*block).count;
            let mut has_gen0 = false;
            for i in 0..count {
                let value = (*block).values[i].value_ptr();
                self.try_mark_for_processing(lists, value, &mut has_gen0);
            }
            (*block).has_gen0_refs = has_gen0;
            block = (*block).next;
        }
    }

    /// Walks a run of call-stack slots, which may contain reference
    /// values. Local and static references point at storage examined
    /// through other roots; instance-field references keep the instance
    /// alive and are followed here.
    unsafe fn process_local_values(
        &mut self,
        lists: &mut CycleLists,
        values: *mut Value,
        count: usize,
    ) {
        let mut ignored = false;
        for i in 0..count {
            let v = values.add(i);
            let tag = (*v).raw_tag();
            if tag & 1 != 0 {
                if tag != LOCAL_REFERENCE && tag != STATIC_REFERENCE {
                    let offset = !tag;
                    let gco = ((*v).as_reference_ptr().sub(offset)) as *mut GcObject;
                    if (*gco).color() == self.current_white {
                        self.mark_for_processing(lists, gco);
                    }
                }
            } else {
                self.try_mark_for_processing(lists, v, &mut ignored);
            }
        }
    }

    /// Whether the value's object still carries the white mark. Also
    /// reports whether it points into movable gen0.
    unsafe fn should_process(&self, value: *mut Value, has_gen0_refs: &mut bool) -> bool {
        if (*value).is_null() || (*(*value).type_ptr()).is_primitive() {
            return false;
        }
        if (*value).type_ptr() == (*self.vm).types.string
            && (*(*value).as_string()).flags.contains(StringFlags::STATIC)
        {
            return false;
        }

        let gco = GcObject::from_value(&*value);
        let flags = (*gco).flags;
        if flags.contains(GcoFlags::GEN_0) && !flags.contains(GcoFlags::PINNED) {
            *has_gen0_refs = true;
        }
        (*gco).color() == self.current_white
    }

    unsafe fn try_mark_for_processing(
        &mut self,
        lists: &mut CycleLists,
        value: *mut Value,
        has_gen0_refs: &mut bool,
    ) {
        if self.should_process(value, has_gen0_refs) {
            self.mark_for_processing(lists, GcObject::from_value(&*value));
        }
    }

    unsafe fn try_mark_string(
        &mut self,
        lists: &mut CycleLists,
        s: *mut ManagedString,
        has_gen0_refs: &mut bool,
    ) {
        if !s.is_null() && !(*s).flags.contains(StringFlags::STATIC) {
            let gco = GcObject::from_inst(s as *mut u8);
            if (*gco).flags.contains(GcoFlags::GEN_0) {
                *has_gen0_refs = true;
            }
            if (*gco).color() == self.current_white {
                self.mark_for_processing(lists, gco);
            }
        }
    }

    unsafe fn mark_for_processing(&mut self, lists: &mut CycleLists, gco: *mut GcObject) {
        debug_assert_eq!((*gco).color(), self.current_white);
        (*gco).remove_from_list(&mut self.collect_list);

        let ty = if (*gco).is_moved() {
            std::ptr::null_mut()
        } else {
            (*gco).type_ptr()
        };
        let could_have_fields =
            (*gco).is_value_array() || (!ty.is_null() && (*ty).total_size() > 0);

        if could_have_fields {
            (*gco).insert_into_list(&mut lists.process);
            (*gco).set_color(COLOR_GRAY);
        } else {
            // No instance fields; straight to a survivor list.
            self.add_survivor(lists, gco);
            (*gco).set_color(self.current_black());
        }
    }

    unsafe fn add_survivor(&mut self, lists: &mut CycleLists, gco: *mut GcObject) {
        let list: *mut *mut GcObject = if (*gco).generation() == GcoFlags::GEN_0 {
            &mut lists.gen0_survivors
        } else {
            if (*gco).generation() == GcoFlags::GEN_1 {
                lists.gen1_survivor_size += (*gco).size;
            }
            if (*gco).has_gen0_refs() {
                &mut lists.with_gen0_refs
            } else {
                &mut lists.keep
            }
        };
        (*gco).insert_into_list(list);
    }

    unsafe fn process_object_and_fields(&mut self, lists: &mut CycleLists, gco: *mut GcObject) {
        debug_assert_eq!((*gco).color(), COLOR_GRAY);

        // Blacken first, so cycles through this object terminate.
        (*gco).set_color(self.current_black());

        let mut has_gen0_refs = false;
        if (*gco).is_value_array() {
            let count = ((*gco).size - GCO_SIZE) / std::mem::size_of::<Value>();
            self.process_fields(
                lists,
                (*gco).instance_base() as *mut Value,
                count,
                &mut has_gen0_refs,
            );
        } else if !(*gco).is_array() {
            let mut ty = (*gco).type_ptr();
            while !ty.is_null() {
                if (*ty).flags.contains(TypeFlags::CUSTOM_PTR) {
                    self.process_custom_fields(lists, ty, (*gco).instance_base(), &mut has_gen0_refs);
                } else if (*ty).field_count > 0 {
                    self.process_fields(
                        lists,
                        (*gco).fields_base(ty),
                        (*ty).field_count as usize,
                        &mut has_gen0_refs,
                    );
                }
                ty = (*ty).base_type;
            }
        }

        if has_gen0_refs {
            (*gco).flags |= GcoFlags::HAS_GEN0_REFS;
        }

        (*gco).remove_from_list(&mut lists.process);
        self.add_survivor(lists, gco);
    }

    unsafe fn process_fields(
        &mut self,
        lists: &mut CycleLists,
        fields: *mut Value,
        count: usize,
        has_gen0_refs: &mut bool,
    ) {
        for i in 0..count {
            self.try_mark_for_processing(lists, fields.add(i), has_gen0_refs);
        }
    }

    unsafe fn process_custom_fields(
        &mut self,
        lists: &mut CycleLists,
        ty: *mut Type,
        inst_base: *mut u8,
        has_gen0_refs: &mut bool,
    ) {
        for field in (*ty).native_fields.iter() {
            let field_ptr = inst_base.add(field.offset);
            match field.kind {
                NativeFieldKind::Value => {
                    self.try_mark_for_processing(lists, field_ptr as *mut Value, has_gen0_refs);
                }
                NativeFieldKind::ValuePtr => {
                    let p = *(field_ptr as *mut *mut Value);
                    if !p.is_null() {
                        self.try_mark_for_processing(lists, p, has_gen0_refs);
                    }
                }
                NativeFieldKind::String => {
                    let s = *(field_ptr as *mut *mut ManagedString);
                    self.try_mark_string(lists, s, has_gen0_refs);
                }
                NativeFieldKind::GcArray => {
                    let p = *(field_ptr as *mut *mut u8);
                    if !p.is_null() {
                        let gco = GcObject::from_inst(p);
                        let flags = (*gco).flags;
                        if flags.contains(GcoFlags::GEN_0) && !flags.contains(GcoFlags::PINNED) {
                            *has_gen0_refs = true;
                        }
                        if (*gco).color() == self.current_white {
                            self.mark_for_processing(lists, gco);
                        }
                    }
                }
            }
        }

        if let Some(get_references) = (*ty).get_references {
            let gc = self as *mut Gc;
            let lists = lists as *mut CycleLists;
            let has_gen0 = has_gen0_refs as *mut bool;
            get_references(
                inst_base.add((*ty).fields_offset as usize),
                &mut |values, count| unsafe {
                    (*gc).process_fields(&mut *lists, values, count, &mut *has_gen0);
                },
            );
        }
    }

    // === Moving gen0 survivors ===

    unsafe fn move_gen0_survivors(&mut self, lists: &mut CycleLists) {
        let mut obj = lists.gen0_survivors;
        while !obj.is_null() {
            let next = (*obj).next;
            (*obj).remove_from_list(&mut lists.gen0_survivors);

            if !(*obj).is_pinned() {
                let new_address = self.alloc_raw_gen1((*obj).size);
                if new_address.is_null() {
                    // Gen1 exhaustion mid-move is unrecoverable.
                    std::process::abort();
                }
                std::ptr::copy_nonoverlapping(obj as *const u8, new_address as *mut u8, (*obj).size);
                (*new_address).flags =
                    ((*new_address).flags - GcoFlags::GENERATION) | GcoFlags::GEN_1;
                if (*new_address).has_gen0_refs() {
                    (*new_address).insert_into_list(&mut lists.with_gen0_refs);
                } else {
                    (*new_address).insert_into_list(&mut lists.keep);
                }
                self.gen1_size += (*new_address).size;
                lists.gen1_survivor_size += (*new_address).size;

                (*obj).flags |= GcoFlags::MOVED;
                (*obj).set_new_address(new_address);

                // Interned strings must keep their table entry current.
                let moved_type = (*new_address).type_ptr();
                if moved_type == (*self.vm).types.string || (*new_address).is_early_string() {
                    let s = (*new_address).instance_base() as *mut ManagedString;
                    if (*s).flags.contains(StringFlags::INTERN) {
                        self.strings.update_intern(s);
                    }
                }
            } else {
                self.add_pinned_object(obj);
            }

            obj = next;
        }

        if !self.pinned_list.is_null() {
            let mut last = std::ptr::null_mut();
            self.pinned_list = Self::flatten_pinned_tree(self.pinned_list, &mut last);
            if !last.is_null() {
                (*last).next = std::ptr::null_mut();
            }
        }
    }

    /// Pinned survivors are collected into a binary search tree keyed on
    /// address (prev = left, next = right), then flattened to a sorted
    /// list so the allocator can skip over them in one forward walk.
    unsafe fn add_pinned_object(&mut self, gco: *mut GcObject) {
        (*gco).prev = std::ptr::null_mut();
        (*gco).next = std::ptr::null_mut();

        let mut root: *mut *mut GcObject = &mut self.pinned_list;
        loop {
            if (*root).is_null() {
                *root = gco;
                break;
            } else if gco < *root {
                root = &mut (**root).prev;
            } else {
                root = &mut (**root).next;
            }
        }
    }

    unsafe fn flatten_pinned_tree(
        root: *mut GcObject,
        last_item: &mut *mut GcObject,
    ) -> *mut GcObject {
        let mut first = root;
        *last_item = root;
        if !(*root).prev.is_null() {
            let mut left_last = std::ptr::null_mut();
            first = Self::flatten_pinned_tree((*root).prev, &mut left_last);
            (*left_last).next = root;
            (*root).prev = std::ptr::null_mut();
        }
        if !(*root).next.is_null() {
            (*root).next = Self::flatten_pinned_tree((*root).next, last_item);
        }
        first
    }

    // === Fixing up gen0 references ===

    unsafe fn update_gen0_references(&mut self, lists: &mut CycleLists, _thread: *mut Thread) {
        self.update_root_set();

        let mut gco = lists.with_gen0_refs;
        while !gco.is_null() {
            let next = (*gco).next;
            (*gco).remove_from_list(&mut lists.with_gen0_refs);
            (*gco).insert_into_list(&mut lists.keep);
            self.update_object_fields(gco);
            gco = next;
        }

        // Pinned objects with gen0 refs never made it into the list above.
        let mut gco = self.pinned_list;
        while !gco.is_null() {
            if (*gco).has_gen0_refs() {
                self.update_object_fields(gco);
            }
            gco = (*gco).next;
        }
    }

    unsafe fn update_root_set(&mut self) {
        let thread = (*self.vm).main_thread_ptr();

        let mut frame = (*thread).current_frame;
        while !frame.is_null() {
            let method = (*frame).method;
            if method.is_null() {
                if (*frame).stack_count > 0 {
                    Self::update_locals(
                        (*frame).eval_stack,
                        (*frame).stack_count as usize,
                        self.vm,
                    );
                }
            } else {
                let param_count = (*method).effective_param_count() as usize;
                if param_count > 0 {
                    Self::update_locals(
                        (frame as *mut Value).sub(param_count),
                        param_count,
                        self.vm,
                    );
                }
                let live = (*method).locals as usize + (*frame).stack_count as usize;
                if live > 0 {
                    Self::update_locals((*frame).locals_ptr(), live, self.vm);
                }
            }
            frame = (*frame).prev_frame;
        }

        Self::try_update_ref(&mut (*thread).current_error, self.vm);

        // Module strings are all in gen1; nothing to update there.

        let mut block = self.static_refs;
        while !block.is_null() {
            if (*block).has_gen0_refs {
                for i in 0..(*block).count {
                    Self::try_update_ref(&mut *(*block).values[i].value_ptr(), self.vm);
                }
                (*block).has_gen0_refs = false;
            }
            block = (*block).next;
        }
    }

    unsafe fn should_update_ref(value: &Value, vm: *mut Vm) -> bool {
        if value.is_null() || (*value.type_ptr()).is_primitive() {
            return false;
        }
        if value.type_ptr() == (*vm).types.string
            && (*value.as_string()).flags.contains(StringFlags::STATIC)
        {
            return false;
        }
        (*GcObject::from_value(value)).is_moved()
    }

    unsafe fn try_update_ref(value: &mut Value, vm: *mut Vm) {
        if Self::should_update_ref(value, vm) {
            let new = (*GcObject::from_value(value)).new_address();
            value.set_payload_ptr((*new).instance_base());
        }
    }

    unsafe fn try_update_string_ref(s: *mut *mut ManagedString) {
        if !(*s).is_null() && !(**s).flags.contains(StringFlags::STATIC) {
            let gco = GcObject::from_inst(*s as *mut u8);
            if (*gco).is_moved() {
                *s = (*(*gco).new_address()).instance_base() as *mut ManagedString;
            }
        }
    }

    unsafe fn update_locals(values: *mut Value, count: usize, vm: *mut Vm) {
        for i in 0..count {
            let v = values.add(i);
            let tag = (*v).raw_tag();
            if tag & 1 != 0 {
                // Local and static refs are immovable; field refs are not.
                if tag != LOCAL_REFERENCE && tag != STATIC_REFERENCE {
                    let offset = !tag;
                    let gco = ((*v).as_reference_ptr().sub(offset)) as *mut GcObject;
                    if (*gco).is_moved() {
                        let new = (*gco).new_address();
                        (*v).set_payload_ptr((new as *mut u8).add(offset));
                    }
                }
            } else {
                Self::try_update_ref(&mut *v, vm);
            }
        }
    }

    unsafe fn update_object_fields(&mut self, gco: *mut GcObject) {
        if (*gco).is_value_array() {
            let count = ((*gco).size - GCO_SIZE) / std::mem::size_of::<Value>();
            Self::update_fields((*gco).instance_base() as *mut Value, count, self.vm);
        } else if !(*gco).is_array() {
            let mut ty = (*gco).type_ptr();
            while !ty.is_null() {
                if (*ty).flags.contains(TypeFlags::CUSTOM_PTR) {
                    self.update_custom_fields(ty, (*gco).instance_base());
                } else if (*ty).field_count > 0 {
                    Self::update_fields(
                        (*gco).fields_base(ty),
                        (*ty).field_count as usize,
                        self.vm,
                    );
                }
                ty = (*ty).base_type;
            }
        }

        (*gco).flags -= GcoFlags::HAS_GEN0_REFS;
    }

    unsafe fn update_fields(fields: *mut Value, count: usize, vm: *mut Vm) {
        for i in 0..count {
            Self::try_update_ref(&mut *fields.add(i), vm);
        }
    }

    unsafe fn update_custom_fields(&mut self, ty: *mut Type, inst_base: *mut u8) {
        for field in (*ty).native_fields.iter() {
            let field_ptr = inst_base.add(field.offset);
            match field.kind {
                NativeFieldKind::Value => {
                    Self::try_update_ref(&mut *(field_ptr as *mut Value), self.vm);
                }
                NativeFieldKind::ValuePtr => {
                    let p = *(field_ptr as *mut *mut Value);
                    if !p.is_null() {
                        Self::try_update_ref(&mut *p, self.vm);
                    }
                }
                NativeFieldKind::String => {
                    Self::try_update_string_ref(field_ptr as *mut *mut ManagedString);
                }
                NativeFieldKind::GcArray => {
                    let slot = field_ptr as *mut *mut u8;
                    if !(*slot).is_null() {
                        let gco = GcObject::from_inst(*slot);
                        if (*gco).is_moved() {
                            *slot = (*(*gco).new_address()).instance_base();
                        }
                    }
                }
            }
        }

        if let Some(get_references) = (*ty).get_references {
            let vm = self.vm;
            get_references(
                inst_base.add((*ty).fields_offset as usize),
                &mut |values, count| unsafe {
                    Self::update_fields(values, count, vm);
                },
            );
        }
    }

    // === Sweeping ===

    unsafe fn release(&mut self, gco: *mut GcObject) {
        let string_type = (*self.vm).types.string;
        if (*gco).is_early_string() || (!(*gco).is_moved() && !(*gco).is_array() && (*gco).type_ptr() == string_type)
        {
            let s = (*gco).instance_base() as *mut ManagedString;
            if (*s).flags.contains(StringFlags::INTERN) {
                self.strings.remove_intern(s);
            }
        } else if !(*gco).is_array() && !(*gco).is_moved() && !(*gco).type_ptr().is_null() {
            let ty = (*gco).type_ptr();
            if (*ty).has_finalizer() {
                // Finalisers run bottom-up through the hierarchy. They may
                // not allocate managed memory; resurrection is ignored.
                let mut t = ty;
                while !t.is_null() {
                    if let Some(finalizer) = (*t).finalizer {
                        finalizer((*gco).instance_base());
                    }
                    t = (*t).base_type;
                }
            }
        }

        self.release_raw(gco);
    }

    /// Memory-pressure hints. Declared by the embedder API but not acted
    /// on; the gen1 threshold alone drives full collections.
    pub fn add_memory_pressure(&mut self, _size: usize) {}

    pub fn remove_memory_pressure(&mut self, _size: usize) {}
}

impl Drop for Gc {
    fn drop(&mut self) {
        unsafe {
            // Finalise and free every remaining object.
            for list in [self.collect_list, self.pinned_list] {
                let mut gco = list;
                while !gco.is_null() {
                    let next = (*gco).next;
                    self.release(gco);
                    gco = next;
                }
            }
            self.collect_list = std::ptr::null_mut();
            self.pinned_list = std::ptr::null_mut();

            let mut block = self.static_refs;
            while !block.is_null() {
                let next = (*block).next;
                drop(Box::from_raw(block));
                block = next;
            }
            self.static_refs = std::ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_validates() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_rejects_tiny_nursery() {
        let config = GcConfig {
            gen0_size: 1024,
            ..GcConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_color_swap() {
        let gc = Gc::new(GcConfig::default()).unwrap();
        assert_eq!(gc.current_white, COLOR_A);
        assert_eq!(gc.current_black(), COLOR_B);
    }
}
