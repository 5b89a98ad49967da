//! The managed thread: call stack, frames and the invocation machinery.
//!
//! One native thread drives all managed execution. The call stack is a
//! reserved, page-locked region with a no-access guard page after it, so
//! stack overflow faults instead of corrupting memory. Frames are carved
//! out of the region contiguously:
//!
//! ```text
//! [args][frame header][locals][evaluation stack]
//! ```
//!
//! The header is a whole number of `Value` slots, so every argument,
//! local and stack slot is addressable as a signed `Value`-sized offset
//! from the frame pointer. The method initialiser bakes those offsets
//! into the instruction stream; the GC walks the same layout.

use memmap2::MmapMut;

use crate::error::{OpResult, Trap};
use crate::gc::object::GcObject;
use crate::strings::buffer::StringBuffer;
use crate::strings::{string_equals, ManagedString};
use crate::sync::Section;
use crate::types::member::{Field, Member, MemberFlags};
use crate::types::method::{
    Method, MethodOverload, OverloadBody, OverloadFlags, RefSignature,
};
use crate::types::{Operator, Type};
use crate::value::{
    is_same_reference, ListInst, MethodInst, Value, NULL_VALUE,
};
use crate::vm::Vm;

use super::instr::Slot;

/// Total size of a call stack.
pub const CALL_STACK_SIZE: usize = 1024 * 1024;

const GUARD_SIZE: usize = 4096;

/// The frame header. Must occupy a whole number of `Value` slots.
#[repr(C)]
pub struct StackFrame {
    /// Current evaluation-stack height.
    pub stack_count: u32,
    /// Number of arguments passed, INCLUDING the instance.
    pub argc: u32,
    /// First slot of the evaluation stack (always just above the locals).
    pub eval_stack: *mut Value,
    /// The caller's instruction pointer.
    pub prev_ip: usize,
    pub prev_frame: *mut StackFrame,
    /// The overload this frame is an invocation of; null for the fake
    /// first frame.
    pub method: *mut MethodOverload,
    _pad: usize,
}

/// Frame header size in `Value` slots.
pub const FRAME_SLOTS: i32 =
    (std::mem::size_of::<StackFrame>() / std::mem::size_of::<Value>()) as i32;

impl StackFrame {
    /// First local slot; the evaluation stack follows the locals.
    #[inline]
    pub fn locals_ptr(&self) -> *mut Value {
        unsafe { (self as *const StackFrame as *mut Value).offset(FRAME_SLOTS as isize) }
    }

    /// Resolves a frame-relative slot offset.
    #[inline]
    pub unsafe fn slot(&self, slot: Slot) -> *mut Value {
        (self as *const StackFrame as *mut Value).offset(slot.0 as isize)
    }

    #[inline]
    pub unsafe fn push(&mut self, value: Value) {
        *self.eval_stack.add(self.stack_count as usize) = value;
        self.stack_count += 1;
    }

    #[inline]
    pub unsafe fn pop(&mut self) -> Value {
        debug_assert!(self.stack_count > 0);
        self.stack_count -= 1;
        *self.eval_stack.add(self.stack_count as usize)
    }

    #[inline]
    pub unsafe fn peek(&self, n: u32) -> Value {
        debug_assert!(n < self.stack_count);
        *self.eval_stack.add((self.stack_count - n - 1) as usize)
    }

    /// Removes the value `offset` slots below the top by shifting the
    /// values above it down one slot.
    pub unsafe fn shift(&mut self, offset: u32) {
        let mut p = self
            .eval_stack
            .add((self.stack_count - offset - 1) as usize);
        for _ in 0..offset {
            *p = *p.add(1);
            p = p.add(1);
        }
        self.stack_count -= 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Running,
    SuspendedByGc,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRequest {
    None,
    SuspendForGc,
}

/// The managed thread.
pub struct Thread {
    /// Instruction index into the current overload's internal stream.
    pub ip: usize,
    pub current_frame: *mut StackFrame,
    pub state: ThreadState,
    pub pending_request: ThreadRequest,
    in_unmanaged_region: bool,
    /// The error being propagated. Cleared only after a catch clause has
    /// been exited: the clause may rethrow, and a GC cycle inside a
    /// finally must still reach the error.
    pub current_error: Value,
    pub vm: *mut Vm,
    /// Cached `Hash.item` setter overload, used by hash concatenation.
    hash_set_item: *mut MethodOverload,
    /// Held by the GC while a cycle runs; a suspending thread parks here.
    gc_cycle_section: Section,
    call_stack: MmapMut,
}

impl Thread {
    pub fn new() -> std::io::Result<Box<Thread>> {
        let call_stack = MmapMut::map_anon(CALL_STACK_SIZE + GUARD_SIZE)?;

        #[cfg(unix)]
        unsafe {
            let base = call_stack.as_ptr() as *mut libc::c_void;
            // The guard page turns runaway recursion into an immediate
            // fault instead of silent corruption.
            libc::mprotect(
                (base as *mut u8).add(CALL_STACK_SIZE) as *mut libc::c_void,
                GUARD_SIZE,
                libc::PROT_NONE,
            );
            libc::mlock(base, CALL_STACK_SIZE);
        }

        let mut thread = Box::new(Thread {
            ip: 0,
            current_frame: std::ptr::null_mut(),
            state: ThreadState::Created,
            pending_request: ThreadRequest::None,
            in_unmanaged_region: false,
            current_error: NULL_VALUE,
            vm: std::ptr::null_mut(),
            hash_set_item: std::ptr::null_mut(),
            gc_cycle_section: Section::new(),
            call_stack,
        });
        unsafe {
            thread.push_first_stack_frame();
        }
        Ok(thread)
    }

    pub fn set_vm(&mut self, vm: *mut Vm) {
        self.vm = vm;
    }

    /// Pushes the fake first frame, so values can be pushed before the
    /// main method is invoked.
    unsafe fn push_first_stack_frame(&mut self) {
        let frame = self.call_stack.as_mut_ptr() as *mut StackFrame;
        (*frame).stack_count = 0;
        (*frame).argc = 0;
        (*frame).eval_stack = (*frame).locals_ptr();
        (*frame).prev_ip = 0;
        (*frame).prev_frame = std::ptr::null_mut();
        (*frame).method = std::ptr::null_mut();
        self.current_frame = frame;
    }

    // === Suspension and unmanaged regions ===

    pub fn enter_unmanaged_region(&mut self) {
        self.in_unmanaged_region = true;
    }

    pub fn leave_unmanaged_region(&mut self) {
        self.in_unmanaged_region = false;
        if self.pending_request != ThreadRequest::None {
            self.handle_request();
        }
    }

    pub fn is_in_unmanaged_region(&self) -> bool {
        self.in_unmanaged_region
    }

    pub fn please_suspend_for_gc(&mut self) {
        self.pending_request = ThreadRequest::SuspendForGc;
    }

    pub fn handle_request(&mut self) {
        if self.pending_request == ThreadRequest::SuspendForGc {
            self.suspend_for_gc();
        }
    }

    fn suspend_for_gc(&mut self) {
        self.state = ThreadState::SuspendedByGc;
        // Wait for the cycle to end, then resume.
        self.gc_cycle_section.enter();
        self.state = ThreadState::Running;
        self.pending_request = ThreadRequest::None;
        self.gc_cycle_section.leave();
    }

    /// Called by the GC as a cycle starts on this thread. Provision for
    /// suspending other managed threads; with a single managed thread
    /// there is nobody else to stop.
    pub fn begin_gc_cycle(&mut self) {}

    pub fn end_gc_cycle(&mut self) {}

    // === Convenience stack accessors ===

    #[inline]
    pub unsafe fn push(&mut self, value: Value) {
        (*self.current_frame).push(value);
    }

    #[inline]
    pub unsafe fn push_null(&mut self) {
        (*self.current_frame).push(NULL_VALUE);
    }

    #[inline]
    pub unsafe fn push_bool(&mut self, value: bool) {
        let ty = (*self.vm).types.boolean;
        (*self.current_frame).push(Value::of_bool(ty, value));
    }

    #[inline]
    pub unsafe fn push_int(&mut self, value: i64) {
        let ty = (*self.vm).types.int;
        (*self.current_frame).push(Value::of_int(ty, value));
    }

    #[inline]
    pub unsafe fn push_uint(&mut self, value: u64) {
        let ty = (*self.vm).types.uint;
        (*self.current_frame).push(Value::of_uint(ty, value));
    }

    #[inline]
    pub unsafe fn push_real(&mut self, value: f64) {
        let ty = (*self.vm).types.real;
        (*self.current_frame).push(Value::of_real(ty, value));
    }

    #[inline]
    pub unsafe fn push_string(&mut self, value: *mut ManagedString) {
        let ty = (*self.vm).types.string;
        (*self.current_frame).push(Value::of_string(ty, value));
    }

    #[inline]
    pub unsafe fn pop(&mut self) -> Value {
        (*self.current_frame).pop()
    }

    /// The type declaring the currently-executing method; null in the
    /// fake first frame and in global functions.
    pub unsafe fn current_decl_type(&self) -> *mut Type {
        let method = (*self.current_frame).method;
        if method.is_null() {
            std::ptr::null_mut()
        } else {
            (*method).decl_type
        }
    }

    // === Starting the thread ===

    /// Invokes the program's main overload with `arg_count` values
    /// already pushed onto the first frame.
    pub unsafe fn start(
        &mut self,
        arg_count: u32,
        overload: *mut MethodOverload,
        result: *mut Value,
    ) -> OpResult {
        debug_assert!(self.state == ThreadState::Created);
        debug_assert!(!(*overload).is_instance_method());

        self.state = ThreadState::Running;
        let frame = self.current_frame;
        let args = (*frame)
            .eval_stack
            .add(((*frame).stack_count - arg_count) as usize);
        let r = self.invoke_method_overload(overload, arg_count, args, result);
        self.state = ThreadState::Stopped;
        r
    }

    // === Invocation ===

    /// Pops `argc` arguments plus the callee and invokes it.
    pub unsafe fn invoke(&mut self, argc: u32, result: Option<*mut Value>) -> OpResult {
        let frame = self.current_frame;
        let value = (*frame)
            .eval_stack
            .add(((*frame).stack_count - argc - 1) as usize);
        match result {
            Some(out) => self.invoke_ll(argc, value, out, RefSignature::EMPTY),
            None => {
                self.invoke_ll(argc, value, value, RefSignature::EMPTY)?;
                (*self.current_frame).stack_count += 1;
                Ok(())
            }
        }
    }

    /// Low-level invoke: `value` points at the callee, with `argc`
    /// arguments above it. The callee must be an `aves.Method` instance
    /// or a value whose type has a `.call` member.
    pub unsafe fn invoke_ll(
        &mut self,
        argc: u32,
        value: *mut Value,
        result: *mut Value,
        ref_signature: RefSignature,
    ) -> OpResult {
        if (*value).is_null() {
            return self.throw_null_reference_error(None);
        }

        let vm = &*self.vm;
        let mut overload: *mut MethodOverload = std::ptr::null_mut();

        if (*value).type_ptr() == vm.types.method {
            let method_inst = (*value).as_method_inst();
            overload = (*(*method_inst).method).resolve_overload(argc);
            if !overload.is_null() {
                if !(*method_inst).instance.is_null() {
                    // The bound instance replaces the Method value.
                    *value = (*method_inst).instance;
                } else {
                    // No instance: shift the Method off the stack.
                    (*self.current_frame).shift(argc);
                }
            }
        } else {
            let member =
                (*(*value).type_ptr()).find_member(vm.strings.call_, self.current_decl_type());
            match member {
                Some(Member::Method(method)) => {
                    overload = (*method).resolve_overload(argc);
                }
                _ => return self.throw_type_error(Some("The value is not invokable.")),
            }
        }

        if overload.is_null() {
            return self.throw_no_overload_error(argc, None);
        }

        if ref_signature != (*overload).ref_signature
            && (*overload)
                .ref_signature
                .verify(ref_signature, argc)
                .is_some()
        {
            return self.throw_no_overload_error(
                argc,
                Some("One or more arguments has the wrong referenceness."),
            );
        }

        self.invoke_method_overload(overload, argc, value, result)
    }

    /// Invokes a method group with `argc` arguments on the stack.
    pub unsafe fn invoke_method(
        &mut self,
        method: *mut Method,
        argc: u32,
        result: Option<*mut Value>,
    ) -> OpResult {
        let overload = (*method).resolve_overload(argc);
        if overload.is_null() {
            return self.throw_no_overload_error(argc, None);
        }

        let frame = self.current_frame;
        let args = (*frame)
            .eval_stack
            .add(((*frame).stack_count - argc - (*overload).instance_offset()) as usize);
        match result {
            Some(out) => self.invoke_method_overload(overload, argc, args, out),
            None => {
                self.invoke_method_overload(overload, argc, args, args)?;
                (*self.current_frame).stack_count += 1;
                Ok(())
            }
        }
    }

    /// Looks up `name` on the value `argc + 1` slots below the top and
    /// invokes it.
    pub unsafe fn invoke_member(
        &mut self,
        name: *mut ManagedString,
        argc: u32,
        result: Option<*mut Value>,
    ) -> OpResult {
        let frame = self.current_frame;
        let value = (*frame)
            .eval_stack
            .add(((*frame).stack_count - argc - 1) as usize);
        match result {
            Some(out) => self.invoke_member_ll(name, argc, value, out, RefSignature::EMPTY),
            None => {
                self.invoke_member_ll(name, argc, value, value, RefSignature::EMPTY)?;
                (*self.current_frame).stack_count += 1;
                Ok(())
            }
        }
    }

    pub unsafe fn invoke_member_ll(
        &mut self,
        name: *mut ManagedString,
        argc: u32,
        value: *mut Value,
        result: *mut Value,
        ref_signature: RefSignature,
    ) -> OpResult {
        if (*value).is_null() {
            return self.throw_null_reference_error(None);
        }

        let member = (*(*value).type_ptr()).find_member(name, self.current_decl_type());
        let Some(member) = member else {
            return self.throw_member_not_found_error(name);
        };
        if member.is_static() {
            return self.throw_type_error(Some("Cannot access a static member through an instance."));
        }

        match member {
            Member::Field(field) => {
                // Replace the instance with the field's value, then
                // invoke that.
                (*field).read_field_unchecked(value, value);
                self.invoke_ll(argc, value, result, ref_signature)
            }
            Member::Property(prop) => {
                let getter = (*prop).getter;
                if getter.is_null() {
                    return self.throw_type_error(Some("Cannot get write-only property."));
                }
                let overload = (*getter).resolve_overload(0);
                if overload.is_null() {
                    return self.throw_no_overload_error(0, None);
                }
                // Call the getter on a copy of the instance; the
                // arguments already on the stack must stay put.
                self.push(*value);
                let frame = self.current_frame;
                let getter_args = (*frame)
                    .eval_stack
                    .add(((*frame).stack_count - 1) as usize);
                self.invoke_method_overload(overload, 0, getter_args, value)?;
                // And invoke whatever the getter produced.
                self.invoke_ll(argc, value, result, ref_signature)
            }
            Member::Method(method) => {
                let overload = (*method).resolve_overload(argc);
                if overload.is_null() {
                    return self.throw_no_overload_error(argc, None);
                }
                if ref_signature != (*overload).ref_signature
                    && (*overload)
                        .ref_signature
                        .verify(ref_signature, argc)
                        .is_some()
                {
                    return self.throw_no_overload_error(
                        argc,
                        Some("One or more arguments has the wrong referenceness."),
                    );
                }
                self.invoke_method_overload(overload, argc, value, result)
            }
        }
    }

    /// The core invocation path. `arg_count` excludes the instance;
    /// `args` points at the first argument (instance included when the
    /// overload has one).
    pub unsafe fn invoke_method_overload(
        &mut self,
        overload: *mut MethodOverload,
        mut arg_count: u32,
        args: *mut Value,
        result: *mut Value,
    ) -> OpResult {
        let flags = (*overload).flags;

        if flags.intersects(OverloadFlags::VARIADIC) {
            self.prepare_variadic_args(flags, arg_count, (*overload).param_count)?;
            arg_count = (*overload).param_count;
        }

        let arg_count = arg_count + (*overload).instance_count;

        // This updates current_frame.
        self.push_stack_frame(arg_count, args, overload);

        let mut r: OpResult;
        if flags.contains(OverloadFlags::NATIVE) {
            if self.pending_request != ThreadRequest::None {
                self.handle_request();
            }
            let entry = match &(*overload).body {
                OverloadBody::Native(entry) => *entry,
                _ => unreachable!("native overload without native body"),
            };
            r = entry(self as *mut Thread, arg_count, args);
            // Native methods need not leave a value behind; treat an
            // empty stack as a null return.
            if r.is_ok() && (*self.current_frame).stack_count == 0 {
                *(*self.current_frame).eval_stack = NULL_VALUE;
            }
        } else {
            r = self.ensure_initialized(overload);
            if r.is_ok() {
                self.ip = 0;
                loop {
                    r = self.evaluate();
                    if let Err(Trap::Thrown) = r {
                        match self.find_error_handler(usize::MAX) {
                            Ok(()) => continue, // IP is at the handler
                            Err(e) => r = Err(e),
                        }
                    }
                    break;
                }
            }
        }

        // Restore the caller's frame. The result is copied only after
        // the restore: with zero parameters it may alias this frame's
        // header.
        let frame = self.current_frame;
        self.current_frame = (*frame).prev_frame;
        self.ip = (*frame).prev_ip;
        if r.is_ok() {
            *result = *(*frame).eval_stack;
        }
        r
    }

    unsafe fn ensure_initialized(&mut self, overload: *mut MethodOverload) -> OpResult {
        if (*overload).is_initialized() {
            return Ok(());
        }
        match super::init::initialize_overload(overload) {
            Ok(types) => {
                for ty in types {
                    (*ty).run_static_ctor(self as *mut Thread)?;
                }
                Ok(())
            }
            Err(error) => {
                // A method that fails verification can never run; there
                // is no managed error to translate this into.
                (*self.vm).print_method_init_error(&error);
                std::process::abort();
            }
        }
    }

    /// Pushes a frame for `overload` over its arguments. `arg_count`
    /// includes the instance here.
    unsafe fn push_stack_frame(
        &mut self,
        arg_count: u32,
        args: *mut Value,
        overload: *mut MethodOverload,
    ) {
        debug_assert!((*self.current_frame).stack_count >= arg_count);
        // The arguments leave the caller's evaluation stack.
        (*self.current_frame).stack_count -= arg_count;

        let param_count = (*overload).effective_param_count();
        let local_count = (*overload).locals;
        let new_frame = args.add(param_count as usize) as *mut StackFrame;

        (*new_frame).stack_count = 0;
        (*new_frame).argc = arg_count;
        (*new_frame).eval_stack = (*new_frame).locals_ptr().add(local_count as usize);
        (*new_frame).prev_ip = self.ip;
        (*new_frame).prev_frame = self.current_frame;
        (*new_frame).method = overload;

        // Unpassed optional parameters and all locals start out null.
        for i in arg_count..param_count {
            *args.add(i as usize) = NULL_VALUE;
        }
        let locals = (*new_frame).locals_ptr();
        for i in 0..local_count {
            *locals.add(i as usize) = NULL_VALUE;
        }

        self.current_frame = new_frame;
    }

    /// Packs the variadic arguments into a fresh `aves.List`, replacing
    /// them on the stack. `VAR_END` packs the trailing arguments,
    /// `VAR_START` the leading ones.
    unsafe fn prepare_variadic_args(
        &mut self,
        flags: OverloadFlags,
        arg_count: u32,
        param_count: u32,
    ) -> OpResult {
        let count = if arg_count + 1 >= param_count {
            arg_count + 1 - param_count
        } else {
            0
        };

        let vm = &mut *self.vm;
        let gc = vm.gc_ptr();

        // Build the list without assuming anything about the List
        // constructor: allocate, then let the registered initialiser
        // set up the storage. The list is kept visible to the GC on the
        // stack slot just above the current height during initialisation.
        let frame = self.current_frame;
        let hold = (*frame).stack_count;
        let list_slot = (*frame).eval_stack.add(hold as usize);
        (*gc).alloc_value(
            self as *mut Thread,
            vm.types.list,
            (*vm.types.list).total_size(),
            list_slot,
        )?;
        (*frame).stack_count = hold + 1;
        let init_list = vm
            .functions
            .init_list_instance
            .expect("list initializer not registered");
        let r = init_list(self as *mut Thread, (*list_slot).as_list(), count as i32);
        (*frame).stack_count = hold;
        r?;
        let list_value = *list_slot;
        let list = list_value.as_list();
        (*list).length = count as i32;

        let frame = self.current_frame;
        if count > 0 {
            let value_base;
            if flags.contains(OverloadFlags::VAR_END) {
                // Copy the trailing arguments into the list.
                value_base = (*frame)
                    .eval_stack
                    .add(((*frame).stack_count - count) as usize);
                std::ptr::copy_nonoverlapping(value_base, (*list).values, count as usize);
                // All but one of the packed slots disappear; the last
                // one receives the list.
                *value_base = list_value;
                (*frame).stack_count -= count - 1;
            } else {
                // Copy the leading arguments, then close the gap.
                let first_arg = (*frame)
                    .eval_stack
                    .add(((*frame).stack_count - arg_count) as usize);
                std::ptr::copy_nonoverlapping(first_arg, (*list).values, count as usize);
                let shift = count - 1;
                let mut p = first_arg.add(1);
                for _ in 0..(arg_count - count) {
                    *p = *p.add(shift as usize);
                    p = p.add(1);
                }
                *first_arg = list_value;
                (*frame).stack_count -= shift;
            }
        } else {
            // No items: push (or unshift) an empty list.
            if flags.contains(OverloadFlags::VAR_END) || arg_count == 0 {
                *(*frame).eval_stack.add((*frame).stack_count as usize) = list_value;
            } else {
                let mut p = (*frame).eval_stack.add((*frame).stack_count as usize);
                for _ in 0..arg_count {
                    *p = *p.sub(1);
                    p = p.sub(1);
                }
                *p = list_value;
            }
            (*frame).stack_count += 1;
        }
        Ok(())
    }

    // === Operators, equality, comparison, concatenation ===

    pub unsafe fn invoke_operator(&mut self, op: Operator, result: Option<*mut Value>) -> OpResult {
        let frame = self.current_frame;
        let args = (*frame)
            .eval_stack
            .add(((*frame).stack_count - op.arity()) as usize);
        match result {
            Some(out) => self.invoke_operator_ll(args, op, out),
            None => {
                self.invoke_operator_ll(args, op, args)?;
                (*self.current_frame).stack_count += 1;
                Ok(())
            }
        }
    }

    pub unsafe fn invoke_operator_ll(
        &mut self,
        args: *mut Value,
        op: Operator,
        result: *mut Value,
    ) -> OpResult {
        if (*args).is_null() {
            return self.throw_null_reference_error(None);
        }

        let overload = (*(*args).type_ptr()).get_operator(op);
        if overload.is_null() {
            return self.throw_missing_operator_error(op);
        }

        self.invoke_method_overload(overload, op.arity(), args, result)
    }

    /// The `==` operation: null handling, then the `==` operator, then
    /// the Boolean interpretation of its result.
    pub unsafe fn equals_ll(&mut self, args: *mut Value) -> Result<bool, Trap> {
        if (*args).is_null() || (*args.add(1)).is_null() {
            (*self.current_frame).stack_count -= 2;
            return Ok((*args).raw_tag() == (*args.add(1)).raw_tag());
        }

        let overload = (*(*args).type_ptr()).get_operator(Operator::Eq);
        if overload.is_null() {
            self.throw_missing_operator_error(Operator::Eq)?;
            unreachable!();
        }

        let mut result = NULL_VALUE;
        self.invoke_method_overload(overload, 2, args, &mut result)?;
        Ok(result.is_true())
    }

    /// The `<=>` operation; the operator's result must be an Int.
    /// On success the integer result is left in `*result`.
    pub unsafe fn compare_ll(&mut self, args: *mut Value, result: *mut Value) -> OpResult {
        if (*args).is_null() {
            return self.throw_null_reference_error(None);
        }
        let overload = (*(*args).type_ptr()).get_operator(Operator::Cmp);
        if overload.is_null() {
            return self.throw_type_error(Some("The value is not comparable."));
        }
        self.invoke_method_overload(overload, 2, args, result)?;
        if (*result).is_null() || (*result).type_ptr() != (*self.vm).types.int {
            return self.throw_type_error(Some("The comparison operator must return an Int."));
        }
        Ok(())
    }

    /// The ordered comparisons specialise `<=>` and compare its result
    /// to zero.
    pub unsafe fn compare_ordered_ll(
        &mut self,
        args: *mut Value,
        comparison: super::instr::Comparison,
    ) -> Result<bool, Trap> {
        use super::instr::Comparison;

        if let Comparison::Eq = comparison {
            return self.equals_ll(args);
        }

        let mut result = NULL_VALUE;
        self.compare_ll(args, &mut result)?;
        let ordering = result.as_int();
        Ok(match comparison {
            Comparison::Lt => ordering < 0,
            Comparison::Gt => ordering > 0,
            Comparison::Lte => ordering <= 0,
            Comparison::Gte => ordering >= 0,
            Comparison::Eq => unreachable!(),
        })
    }

    /// Concatenation: two Lists, two Hashes, or stringification plus
    /// string concatenation for everything else.
    pub unsafe fn concat_ll(&mut self, args: *mut Value, result: *mut Value) -> OpResult {
        let vm = &mut *self.vm;
        let gc = vm.gc_ptr();
        let a = args;
        let b = args.add(1);

        if (!(*a).is_null() && (*a).type_ptr() == vm.types.list)
            || (!(*b).is_null() && (*b).type_ptr() == vm.types.list)
        {
            if (*a).is_null() || (*b).is_null() || (*a).type_ptr() != (*b).type_ptr() {
                return self.throw_type_error(Some(
                    "The concatenation operator requires two Lists, two Hashes, \
                     or two values of any other types.",
                ));
            }

            // Keep the output reachable on the slot above the operands
            // while the list initialiser runs.
            let frame = self.current_frame;
            let out_slot = args.add(2);
            (*gc).alloc_value(
                self as *mut Thread,
                vm.types.list,
                (*vm.types.list).total_size(),
                &mut *out_slot,
            )?;
            (*frame).stack_count += 1;

            let length = (*(*a).as_list()).length + (*(*b).as_list()).length;
            let init_list = vm
                .functions
                .init_list_instance
                .expect("list initializer not registered");
            let r = init_list(self as *mut Thread, (*out_slot).as_list(), length);
            if r.is_err() {
                (*frame).stack_count -= 1;
                return r;
            }

            let out_list = (*out_slot).as_list();
            if length > 0 {
                let a_list = (*a).as_list();
                let b_list = (*b).as_list();
                std::ptr::copy_nonoverlapping(
                    (*a_list).values,
                    (*out_list).values,
                    (*a_list).length as usize,
                );
                std::ptr::copy_nonoverlapping(
                    (*b_list).values,
                    (*out_list).values.add((*a_list).length as usize),
                    (*b_list).length as usize,
                );
            }
            (*out_list).length = length;

            *result = *out_slot;
            (*frame).stack_count -= 1;
        } else if (!(*a).is_null() && (*a).type_ptr() == vm.types.hash)
            || (!(*b).is_null() && (*b).type_ptr() == vm.types.hash)
        {
            if (*a).is_null() || (*b).is_null() || (*a).type_ptr() != (*b).type_ptr() {
                return self.throw_type_error(Some(
                    "The concatenation operator requires two Lists, two Hashes, \
                     or two values of any other types.",
                ));
            }

            // The hash sits on the stack above the operands for GC
            // reachability while entries are copied in.
            let frame = self.current_frame;
            let hash_slot = args.add(2);
            (*gc).alloc_value(
                self as *mut Thread,
                vm.types.hash,
                (*vm.types.hash).total_size(),
                &mut *hash_slot,
            )?;
            (*frame).stack_count += 1;

            let capacity = std::cmp::max((*(*a).as_hash()).count, (*(*b).as_hash()).count);
            let init_hash = vm
                .functions
                .init_hash_instance
                .expect("hash initializer not registered");
            let r = init_hash(self as *mut Thread, (*hash_slot).as_hash(), capacity);
            if r.is_err() {
                (*frame).stack_count -= 1;
                return r;
            }

            // Copy by invoking the hash indexer setter for each entry.
            // The setter may allocate, so the source hash is re-read from
            // its stack slot on every iteration in case a cycle moved it.
            let set_item = self.hash_indexer_setter();
            for operand in [a, b] {
                let mut i = 0;
                while i < (*(*operand).as_hash()).count {
                    let entry = (*(*operand).as_hash()).entries.add(i as usize);
                    *hash_slot.add(1) = *hash_slot;
                    *hash_slot.add(2) = (*entry).key;
                    *hash_slot.add(3) = (*entry).value;
                    (*frame).stack_count += 3;
                    // The invocation pops the three effective arguments.
                    let mut ignore = NULL_VALUE;
                    let r = self.invoke_method_overload(set_item, 2, hash_slot.add(1), &mut ignore);
                    if r.is_err() {
                        (*frame).stack_count -= 1;
                        return r;
                    }
                    i += 1;
                }
            }

            *result = *hash_slot;
            (*frame).stack_count -= 1;
        } else {
            // String concatenation: stringify both operands first.
            self.string_from_value(a)?;
            self.string_from_value(b)?;

            let s = crate::strings::concat(self as *mut Thread, (*a).as_string(), (*b).as_string());
            if s.is_null() {
                return Err(Trap::NoMemory);
            }
            *result = Value::of_string(vm.types.string, s);
        }

        (*self.current_frame).stack_count -= 2;
        Ok(())
    }

    /// The `Hash.item` setter, resolved once.
    unsafe fn hash_indexer_setter(&mut self) -> *mut MethodOverload {
        if self.hash_set_item.is_null() {
            let vm = &*self.vm;
            let member = (*vm.types.hash).get_member(vm.strings.item_);
            let overload = match member {
                Some(Member::Property(prop)) if !(*prop).setter.is_null() => {
                    (*(*prop).setter).resolve_overload(2)
                }
                _ => std::ptr::null_mut(),
            };
            debug_assert!(!overload.is_null());
            self.hash_set_item = overload;
        }
        self.hash_set_item
    }

    // === Member access ===

    pub unsafe fn load_member(
        &mut self,
        name: *mut ManagedString,
        result: Option<*mut Value>,
    ) -> OpResult {
        let frame = self.current_frame;
        let inst = (*frame)
            .eval_stack
            .add(((*frame).stack_count - 1) as usize);
        match result {
            Some(out) => self.load_member_ll(inst, name, out),
            None => {
                self.load_member_ll(inst, name, inst)?;
                (*self.current_frame).stack_count += 1;
                Ok(())
            }
        }
    }

    /// Loads `name` from `*instance`: fields read directly, methods box
    /// into a bound `aves.Method`, properties invoke the getter. Pops
    /// the instance.
    pub unsafe fn load_member_ll(
        &mut self,
        instance: *mut Value,
        name: *mut ManagedString,
        result: *mut Value,
    ) -> OpResult {
        if (*instance).is_null() {
            return self.throw_null_reference_error(None);
        }

        let member = (*(*instance).type_ptr()).find_member(name, self.current_decl_type());
        let Some(member) = member else {
            return self.throw_member_not_found_error(name);
        };
        if member.is_static() {
            return self.throw_type_error(Some("Cannot access a static member through an instance."));
        }

        match member {
            Member::Field(field) => {
                (*field).read_field_unchecked(instance, result);
                (*self.current_frame).stack_count -= 1;
                Ok(())
            }
            Member::Method(method) => {
                let vm = &mut *self.vm;
                let gc = vm.gc_ptr();
                let mut output = NULL_VALUE;
                (*gc).alloc_value(
                    self as *mut Thread,
                    vm.types.method,
                    std::mem::size_of::<MethodInst>(),
                    &mut output,
                )?;
                let inst = output.as_method_inst();
                (*inst).instance = *instance;
                (*inst).method = method;
                *result = output;
                (*self.current_frame).stack_count -= 1;
                Ok(())
            }
            Member::Property(prop) => {
                let getter = (*prop).getter;
                if getter.is_null() {
                    return self.throw_type_error(Some("Cannot get write-only property."));
                }
                let overload = (*getter).resolve_overload(0);
                if overload.is_null() {
                    return self.throw_no_overload_error(0, None);
                }
                // The instance is already on the stack.
                self.invoke_method_overload(overload, 0, instance, result)
            }
        }
    }

    pub unsafe fn store_member(&mut self, name: *mut ManagedString) -> OpResult {
        let frame = self.current_frame;
        let args = (*frame)
            .eval_stack
            .add(((*frame).stack_count - 2) as usize);
        self.store_member_ll(args, name)
    }

    /// Stores into `name` on `args[0]` the value `args[1]`. Pops both.
    pub unsafe fn store_member_ll(
        &mut self,
        args: *mut Value,
        name: *mut ManagedString,
    ) -> OpResult {
        if (*args).is_null() {
            return self.throw_null_reference_error(None);
        }

        let member = (*(*args).type_ptr()).find_member(name, self.current_decl_type());
        let Some(member) = member else {
            return self.throw_member_not_found_error(name);
        };
        if member.is_static() {
            return self.throw_type_error(Some("Cannot access a static member through an instance."));
        }

        match member {
            Member::Field(field) => {
                (*field).write_field_unchecked(args);
                (*self.current_frame).stack_count -= 2;
                Ok(())
            }
            Member::Method(_) => self.throw_type_error(Some("Cannot assign to a method.")),
            Member::Property(prop) => {
                let setter = (*prop).setter;
                if setter.is_null() {
                    return self.throw_type_error(Some("Cannot assign to a read-only property."));
                }
                let overload = (*setter).resolve_overload(1);
                if overload.is_null() {
                    return self.throw_no_overload_error(1, None);
                }
                // Instance and value are already on the stack.
                let mut ignore = NULL_VALUE;
                self.invoke_method_overload(overload, 1, args, &mut ignore)
            }
        }
    }

    /// Invokes the indexer getter (`.item`) with `argc` index arguments.
    /// `args[0]` is the instance.
    pub unsafe fn load_indexer_ll(
        &mut self,
        argc: u32,
        args: *mut Value,
        result: *mut Value,
    ) -> OpResult {
        if (*args).is_null() {
            return self.throw_null_reference_error(None);
        }

        let vm = &*self.vm;
        let member = (*(*args).type_ptr()).find_member(vm.strings.item_, self.current_decl_type());
        let Some(Member::Property(prop)) = member else {
            return self.throw_type_error(Some(
                "The type does not contain an indexer, or it is not accessible.",
            ));
        };

        let getter = (*prop).getter;
        if getter.is_null() {
            return self.throw_type_error(Some("Cannot get write-only property."));
        }
        let overload = (*getter).resolve_overload(argc);
        if overload.is_null() {
            return self.throw_no_overload_error(argc, None);
        }
        self.invoke_method_overload(overload, argc, args, result)
    }

    /// Invokes the indexer setter with `argc` index arguments plus the
    /// value. `args[0]` is the instance.
    pub unsafe fn store_indexer_ll(&mut self, argc: u32, args: *mut Value) -> OpResult {
        if (*args).is_null() {
            return self.throw_null_reference_error(None);
        }

        let vm = &*self.vm;
        let member = (*(*args).type_ptr()).find_member(vm.strings.item_, self.current_decl_type());
        let Some(Member::Property(prop)) = member else {
            return self.throw_type_error(Some(
                "The type does not contain an indexer, or it is not accessible.",
            ));
        };

        let setter = (*prop).setter;
        if setter.is_null() {
            return self.throw_type_error(Some("Cannot assign to a read-only property."));
        }
        let overload = (*setter).resolve_overload(argc + 1);
        if overload.is_null() {
            return self.throw_no_overload_error(argc + 1, None);
        }
        let mut ignore = NULL_VALUE;
        self.invoke_method_overload(overload, argc + 1, args, &mut ignore)
    }

    // === Static fields ===

    /// Reads a static field, running the declaring type's static
    /// constructor first if it has not run.
    pub unsafe fn load_static_field(&mut self, field: *mut Field, result: *mut Value) -> OpResult {
        if (*field).static_value.is_null() {
            (*(*field).member.decl_type).run_static_ctor(self as *mut Thread)?;
        }
        *result = (*(*field).static_value).read();
        Ok(())
    }

    pub unsafe fn store_static_field(&mut self, field: *mut Field, value: *const Value) -> OpResult {
        if (*field).static_value.is_null() {
            (*(*field).member.decl_type).run_static_ctor(self as *mut Thread)?;
        }
        (*(*field).static_value).write(*value);
        Ok(())
    }

    // === References ===

    /// Pushes a reference to a field of `*instance`.
    pub unsafe fn load_field_ref_ll(&mut self, instance: *mut Value, field: *mut Field) -> OpResult {
        if (*instance).is_null() {
            return self.throw_null_reference_error(None);
        }
        if !Type::value_is_type(&*instance, (*field).member.decl_type) {
            return self.throw_type_error(None);
        }

        let offset = (*field).offset as usize;
        let reference = Value::field_reference(
            offset + crate::gc::object::GCO_SIZE,
            (*instance).as_instance().add(offset) as *mut Value,
        );
        self.push(reference);
        Ok(())
    }

    /// Pushes a reference to the field named `name` of `*instance`.
    pub unsafe fn load_member_ref_ll(
        &mut self,
        instance: *mut Value,
        name: *mut ManagedString,
    ) -> OpResult {
        if (*instance).is_null() {
            return self.throw_null_reference_error(None);
        }

        let member = (*(*instance).type_ptr()).find_member(name, self.current_decl_type());
        let Some(member) = member else {
            return self.throw_member_not_found_error(name);
        };
        if member.is_static() {
            return self.throw_type_error(Some("Cannot access a static member through an instance."));
        }
        let Member::Field(field) = member else {
            return self.throw_type_error(Some("The specified member is not a field."));
        };

        let offset = (*field).offset as usize;
        let reference = Value::field_reference(
            offset + crate::gc::object::GCO_SIZE,
            (*instance).as_instance().add(offset) as *mut Value,
        );
        self.push(reference);
        Ok(())
    }

    // === Stringification ===

    /// Ensures the top of the stack is a string, invoking `toString` if
    /// necessary. With `result`, the string is popped into it.
    pub unsafe fn to_string(&mut self, result: Option<&mut *mut ManagedString>) -> OpResult {
        let vm = &*self.vm;
        let frame = self.current_frame;
        if (*frame).peek(0).is_null() || (*frame).peek(0).type_ptr() != vm.types.string {
            self.invoke_member(vm.strings.to_string, 0, None)?;
            let frame = self.current_frame;
            if (*frame).peek(0).is_null() || (*frame).peek(0).type_ptr() != vm.types.string {
                return self.throw_type_error(Some("toString must return a string."));
            }
        }

        if let Some(result) = result {
            *result = self.pop().as_string();
        }
        Ok(())
    }

    /// Replaces `*slot` (a stack slot) with its string representation.
    pub unsafe fn string_from_value(&mut self, slot: *mut Value) -> OpResult {
        let vm = &*self.vm;
        if !(*slot).is_null() && (*slot).type_ptr() == vm.types.string {
            return Ok(());
        }
        self.push(*slot);
        let mut s: *mut ManagedString = std::ptr::null_mut();
        self.to_string(Some(&mut s))?;
        *slot = Value::of_string(vm.types.string, s);
        Ok(())
    }

    // === Throwing ===

    /// Establishes the value on top of the stack as the current error,
    /// capturing a stack trace into its `stackTrace` field. A rethrow
    /// preserves the existing error and trace.
    pub unsafe fn throw(&mut self, rethrow: bool) -> OpResult {
        if !rethrow {
            self.current_error = (*self.current_frame).peek(0);
            let trace = self.capture_stack_trace();
            if trace.is_null() {
                return Err(Trap::NoMemory);
            }
            self.store_error_string(
                (*self.vm).strings.stack_trace,
                trace,
            );
        }
        debug_assert!(!self.current_error.is_null());
        Err(Trap::Thrown)
    }

    /// Writes a string into a field of the current error, if the error's
    /// type declares one with that name.
    unsafe fn store_error_string(&mut self, name: *mut ManagedString, value: *mut ManagedString) {
        let error = self.current_error;
        if error.is_null() {
            return;
        }
        let member = (*error.type_ptr()).find_member(name, std::ptr::null());
        if let Some(Member::Field(field)) = member {
            if !(*field).is_static() {
                let gco = GcObject::from_value(&error);
                (*gco).field_access.with(|| unsafe {
                    *(*field).field_ptr(&error) =
                        Value::of_string((*self.vm).types.string, value);
                });
            }
        }
    }

    unsafe fn throw_error_of_type(
        &mut self,
        error_type: *mut Type,
        argc: u16,
        message: Option<&str>,
    ) -> OpResult {
        if error_type.is_null() {
            // Error classes are not loaded yet; nothing managed can be
            // constructed.
            return Err(Trap::NoMemory);
        }
        match message {
            Some(text) => {
                let gc = (*self.vm).gc_ptr();
                let s = (*gc).convert_string(self as *mut Thread, text);
                if s.is_null() {
                    return Err(Trap::NoMemory);
                }
                self.push_string(s);
            }
            None => self.push_null(),
        }
        let gc = (*self.vm).gc_ptr();
        (*gc).construct(self as *mut Thread, error_type, argc, None)?;
        self.throw(false)
    }

    pub unsafe fn throw_error(&mut self, message: Option<&str>) -> OpResult {
        self.throw_error_of_type((*self.vm).types.error, 1, message)
    }

    pub unsafe fn throw_type_error(&mut self, message: Option<&str>) -> OpResult {
        self.throw_error_of_type((*self.vm).types.type_error, 1, message)
    }

    pub unsafe fn throw_memory_error(&mut self, message: Option<&str>) -> OpResult {
        self.throw_error_of_type((*self.vm).types.memory_error, 1, message)
    }

    pub unsafe fn throw_overflow_error(&mut self, message: Option<&str>) -> OpResult {
        self.throw_error_of_type((*self.vm).types.overflow_error, 1, message)
    }

    pub unsafe fn throw_divide_by_zero_error(&mut self, message: Option<&str>) -> OpResult {
        self.throw_error_of_type((*self.vm).types.divide_by_zero_error, 1, message)
    }

    pub unsafe fn throw_null_reference_error(&mut self, message: Option<&str>) -> OpResult {
        self.throw_error_of_type((*self.vm).types.null_reference_error, 1, message)
    }

    pub unsafe fn throw_member_not_found_error(&mut self, member: *mut ManagedString) -> OpResult {
        let error_type = (*self.vm).types.member_not_found_error;
        if error_type.is_null() {
            return Err(Trap::NoMemory);
        }
        self.push_string(member);
        let gc = (*self.vm).gc_ptr();
        (*gc).construct(self as *mut Thread, error_type, 1, None)?;
        self.throw(false)
    }

    /// No-overload errors carry the failing argument count.
    pub unsafe fn throw_no_overload_error(&mut self, argc: u32, message: Option<&str>) -> OpResult {
        let error_type = (*self.vm).types.no_overload_error;
        if error_type.is_null() {
            return Err(Trap::NoMemory);
        }
        self.push_int(argc as i64);
        match message {
            Some(text) => {
                let gc = (*self.vm).gc_ptr();
                let s = (*gc).convert_string(self as *mut Thread, text);
                if s.is_null() {
                    return Err(Trap::NoMemory);
                }
                self.push_string(s);
            }
            None => self.push_null(),
        }
        let gc = (*self.vm).gc_ptr();
        (*gc).construct(self as *mut Thread, error_type, 2, None)?;
        self.throw(false)
    }

    pub unsafe fn throw_missing_operator_error(&mut self, op: Operator) -> OpResult {
        let message = format!(
            "The type does not support the specified operator. (Operator: {})",
            op.symbol()
        );
        self.throw_type_error(Some(&message))
    }

    // === Stack traces ===

    /// Builds the textual stack trace for the current call stack.
    /// Returns null when out of memory.
    pub unsafe fn capture_stack_trace(&mut self) -> *mut ManagedString {
        let mut buf = StringBuffer::with_capacity(1024);

        let mut frame = self.current_frame;
        let mut ip = self.ip;
        while !frame.is_null() && !(*frame).method.is_null() {
            let overload = (*frame).method;
            let group = (*overload).group;

            buf.append_str("  ");

            // Fully qualified method name.
            if !(*group).member.decl_type.is_null() {
                buf.append_string((*(*group).member.decl_type).full_name);
                buf.append_char('.');
            }
            buf.append_string((*group).member.name);
            buf.append_char('(');

            let param_count = (*overload).effective_param_count();
            for i in 0..param_count {
                if i > 0 {
                    buf.append_str(", ");
                }
                if i == 0 && (*overload).is_instance_method() {
                    buf.append_str("this");
                } else {
                    let name_index = (i - (*overload).instance_offset()) as usize;
                    match (&(*overload).param_names).get(name_index) {
                        Some(&name) => buf.append_string(name),
                        None => buf.append_str("?"),
                    }
                }
                buf.append_char('=');

                let arg = (frame as *mut Value).sub(param_count as usize).add(i as usize);
                self.append_argument_type(&mut buf, arg);
            }

            buf.append_char(')');
            self.append_source_location(&mut buf, overload, ip);
            buf.append_char('\n');

            ip = (*frame).prev_ip;
            frame = (*frame).prev_frame;
        }

        let gc = (*self.vm).gc_ptr();
        (*gc).construct_string(self as *mut Thread, buf.len() as i32, Some(buf.units()))
    }

    unsafe fn append_argument_type(&mut self, buf: &mut StringBuffer, arg: *mut Value) {
        let vm = &*self.vm;

        let mut value = *arg;
        if value.is_reference() {
            buf.append_str("ref ");
            let mut target = NULL_VALUE;
            crate::value::read_reference(arg, &mut target);
            value = target;
        }

        if value.is_null() {
            buf.append_str("null");
            return;
        }

        let ty = value.type_ptr();
        buf.append_string((*ty).full_name);

        if ty == vm.types.method {
            // Bound methods print their instance and target group too.
            let inst = value.as_method_inst();
            buf.append_str("(this=");
            let instance = (*inst).instance;
            self.append_argument_type(buf, &instance as *const Value as *mut Value);
            buf.append_str(", ");

            let group = (*inst).method;
            if !(*group).member.decl_type.is_null() {
                buf.append_string((*(*group).member.decl_type).full_name);
                buf.append_char('.');
            }
            buf.append_string((*group).member.name);
            buf.append_char(')');
        }
    }

    unsafe fn append_source_location(
        &self,
        buf: &mut StringBuffer,
        overload: *mut MethodOverload,
        ip: usize,
    ) {
        let Some(symbols) = &(*overload).debug_symbols else {
            return;
        };
        for location in symbols.iter() {
            if location.start_instr <= ip && ip < location.end_instr {
                buf.append_str(" at line ");
                buf.append_int(location.line as i64);
                buf.append_str(" in \"");
                buf.append_string(location.file);
                buf.append_char('"');
                return;
            }
        }
    }

    // === Function application ===

    /// `apply`: `args[0]` is the callee, `args[1]` an `aves.List` of
    /// arguments to unpack.
    pub unsafe fn invoke_apply_ll(&mut self, args: *mut Value, result: *mut Value) -> OpResult {
        let vm = &*self.vm;
        if !Type::value_is_type(&*args.add(1), vm.types.list) {
            return self.throw_type_error(Some(
                "The arguments list in a function application must be of type aves.List.",
            ));
        }
        if (*args).is_null() {
            return self.throw_null_reference_error(None);
        }

        let list: *mut ListInst = (*args.add(1)).as_list();
        let frame = self.current_frame;
        (*frame).stack_count -= 1;
        std::ptr::copy_nonoverlapping(
            (*list).values,
            (*frame).eval_stack.add((*frame).stack_count as usize),
            (*list).length as usize,
        );
        (*frame).stack_count += (*list).length as u32;

        self.invoke_ll((*list).length as u32, args, result, RefSignature::EMPTY)
    }

    /// `sapply`: `args[0]` is an `aves.List` of arguments for a static
    /// method group.
    pub unsafe fn invoke_apply_method_ll(
        &mut self,
        method: *mut Method,
        args: *mut Value,
        result: *mut Value,
    ) -> OpResult {
        let vm = &*self.vm;
        if !Type::value_is_type(&*args, vm.types.list) {
            return self.throw_type_error(Some(
                "The arguments list in a function application must be of type aves.List.",
            ));
        }
        debug_assert!((*method).is_static());

        let list: *mut ListInst = (*args).as_list();
        let length = (*list).length as u32;

        // Resolve first; only then unpack.
        let overload = (*method).resolve_overload(length);
        if overload.is_null() {
            return self.throw_no_overload_error(length, None);
        }

        let frame = self.current_frame;
        (*frame).stack_count -= 1;
        std::ptr::copy_nonoverlapping(
            (*list).values,
            (*frame).eval_stack.add((*frame).stack_count as usize),
            length as usize,
        );
        (*frame).stack_count += length;

        self.invoke_method_overload(overload, length, args, result)
    }

    // === Identity ===

    pub unsafe fn is_same_reference_at(&self, args: *mut Value) -> bool {
        is_same_reference(&*args, &*args.add(1))
    }

    /// Compares a name against the current error's type name; test hook.
    pub unsafe fn error_is(&self, full_name: *mut ManagedString) -> bool {
        !self.current_error.is_null()
            && string_equals((*self.current_error.type_ptr()).full_name, full_name)
    }
}
