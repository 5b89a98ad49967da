//! The evaluator: dispatch over the internal instruction stream, plus the
//! try/catch/finally/fault machinery.
//!
//! Every value-producing instruction was given an output flavour by the
//! initialiser: `Stack` pushes, `Local` writes a slot without touching the
//! height. Instructions that invoke managed code leave their arguments on
//! the evaluation stack and let the invocation machinery pop them, so the
//! GC can always see them.

use crate::error::{OpResult, Trap};
use crate::types::method::{TryHandler, TryKind};
use crate::types::Type;
use crate::value::{
    is_same_reference, read_reference, write_reference, Value, NULL_VALUE,
};

use super::instr::{Comparison, Condition, Instr};
use super::thread::{Thread, ThreadRequest};

impl Thread {
    /// Runs the current frame's method from `self.ip` until it returns,
    /// throws, or ends a handler.
    pub unsafe fn evaluate(&mut self) -> OpResult {
        let frame = self.current_frame;
        let overload = (*frame).method;
        let instrs = (*overload).instructions();

        loop {
            if self.pending_request != ThreadRequest::None {
                self.handle_request();
            }

            let f = self.current_frame;
            let instr = &instrs[self.ip] as *const Instr;
            let next = self.ip + 1;

            match &*instr {
                Instr::Nop => {}

                Instr::Pop => {
                    (*f).stack_count -= 1;
                }

                Instr::Ret => {
                    debug_assert_eq!((*f).stack_count, 1);
                    return Ok(());
                }

                Instr::RetNull => {
                    debug_assert_eq!((*f).stack_count, 0);
                    *(*f).eval_stack = NULL_VALUE;
                    (*f).stack_count = 1;
                    return Ok(());
                }

                Instr::Dup { source, dest } => {
                    let value = *(*f).slot(source.slot());
                    *(*f).slot(dest.slot()) = value;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::Move { source, dest } => {
                    let value = *(*f).slot(source.slot());
                    *(*f).slot(dest.slot()) = value;
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::MoveFromRef { source, dest } => {
                    read_reference((*f).slot(source.slot()), (*f).slot(dest.slot()));
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::MoveToRef { source, dest } => {
                    write_reference((*f).slot(dest.slot()), (*f).slot(source.slot()));
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                }

                Instr::LoadNull { dest } => {
                    *(*f).slot(dest.slot()) = NULL_VALUE;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadBool { dest, value } => {
                    *(*f).slot(dest.slot()) = Value::of_bool((*self.vm).types.boolean, *value);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadInt { dest, value } => {
                    *(*f).slot(dest.slot()) = Value::of_int((*self.vm).types.int, *value);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadUInt { dest, value } => {
                    *(*f).slot(dest.slot()) = Value::of_uint((*self.vm).types.uint, *value);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadReal { dest, value } => {
                    *(*f).slot(dest.slot()) = Value::of_real((*self.vm).types.real, *value);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadString { dest, value } => {
                    *(*f).slot(dest.slot()) = Value::of_string((*self.vm).types.string, *value);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadArgc { dest } => {
                    *(*f).slot(dest.slot()) =
                        Value::of_int((*self.vm).types.int, (*f).argc as i64);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadEnum {
                    dest,
                    enum_type,
                    value,
                } => {
                    *(*f).slot(dest.slot()) = Value::of_int(*enum_type, *value);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::NewObject {
                    args,
                    dest,
                    ctor_type,
                    argc,
                } => {
                    let gc = (*self.vm).gc_ptr();
                    (*gc).construct_ll(
                        self as *mut Thread,
                        *ctor_type,
                        *argc,
                        (*f).slot(*args),
                        (*f).slot(dest.slot()),
                    )?;
                    // The constructor consumed the arguments.
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::CreateList { dest, capacity } => {
                    let vm = &mut *self.vm;
                    let gc = vm.gc_ptr();
                    // The fresh list must stay reachable while the
                    // initialiser allocates its backing storage.
                    let result = (*f).slot(dest.slot());
                    (*gc).alloc_value(
                        self as *mut Thread,
                        vm.types.list,
                        (*vm.types.list).total_size(),
                        result,
                    )?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                    let init_list = vm
                        .functions
                        .init_list_instance
                        .expect("list initializer not registered");
                    init_list(self as *mut Thread, (*result).as_list(), *capacity as i32)?;
                }

                Instr::CreateHash { dest, capacity } => {
                    let vm = &mut *self.vm;
                    let gc = vm.gc_ptr();
                    let result = (*f).slot(dest.slot());
                    (*gc).alloc_value(
                        self as *mut Thread,
                        vm.types.hash,
                        (*vm.types.hash).total_size(),
                        result,
                    )?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                    let init_hash = vm
                        .functions
                        .init_hash_instance
                        .expect("hash initializer not registered");
                    init_hash(self as *mut Thread, (*result).as_hash(), *capacity as i32)?;
                }

                Instr::LoadField {
                    source,
                    dest,
                    field,
                    type_check,
                } => {
                    let instance = (*f).slot(source.slot());
                    let result = (*f).slot(dest.slot());
                    if *type_check {
                        (**field).read_field(self as *mut Thread, instance, result)?;
                    } else {
                        (**field).read_field_fast(self as *mut Thread, instance, result)?;
                    }
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadStaticField { dest, field } => {
                    self.load_static_field(*field, (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadMember { source, dest, name } => {
                    // Pops the instance.
                    self.load_member_ll((*f).slot(source.slot()), *name, (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadIterator { source, dest } => {
                    let iter_name = (*self.vm).strings.iter_;
                    // Pops the instance and all zero of the arguments.
                    self.invoke_member_ll(
                        iter_name,
                        0,
                        (*f).slot(source.slot()),
                        (*f).slot(dest.slot()),
                        Default::default(),
                    )?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadTypeOf { source, dest } => {
                    let instance = (*f).slot(source.slot());
                    if (*instance).is_null() {
                        *(*f).slot(dest.slot()) = NULL_VALUE;
                    } else {
                        (*(*instance).type_ptr())
                            .get_type_token(self as *mut Thread, (*f).slot(dest.slot()))?;
                    }
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadIndexer { args, dest, argc } => {
                    // Pops the instance and the index arguments.
                    self.load_indexer_ll(*argc as u32, (*f).slot(*args), (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadStaticFunction { dest, method } => {
                    let vm = &mut *self.vm;
                    let gc = vm.gc_ptr();
                    let result = (*f).slot(dest.slot());
                    (*gc).alloc_value(
                        self as *mut Thread,
                        vm.types.method,
                        std::mem::size_of::<crate::value::MethodInst>(),
                        result,
                    )?;
                    (*(*result).as_method_inst()).method = *method;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::LoadTypeToken { dest, target_type } => {
                    (*(*target_type)).get_type_token(self as *mut Thread, (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::Call {
                    args,
                    dest,
                    argc,
                    ref_signature,
                } => {
                    // The invocation pops the arguments and the callee.
                    self.invoke_ll(
                        *argc as u32,
                        (*f).slot(*args),
                        (*f).slot(dest.slot()),
                        *ref_signature,
                    )?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::StaticCall {
                    args,
                    dest,
                    argc,
                    overload,
                    ..
                } => {
                    self.invoke_method_overload(
                        *overload,
                        *argc as u32,
                        (*f).slot(*args),
                        (*f).slot(dest.slot()),
                    )?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::CallMember {
                    args,
                    dest,
                    name,
                    argc,
                    ref_signature,
                } => {
                    self.invoke_member_ll(
                        *name,
                        *argc as u32,
                        (*f).slot(*args),
                        (*f).slot(dest.slot()),
                        *ref_signature,
                    )?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::Apply { args, dest } => {
                    self.invoke_apply_ll((*f).slot(*args), (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::StaticApply { args, dest, method } => {
                    self.invoke_apply_method_ll(*method, (*f).slot(*args), (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::InvokeOperator { args, dest, op } => {
                    self.invoke_operator_ll((*f).slot(*args), *op, (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::Equals { args, dest } => {
                    let equal = self.equals_ll((*f).slot(*args))?;
                    *(*f).slot(dest.slot()) = Value::of_bool((*self.vm).types.boolean, equal);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::Compare { args, dest } => {
                    self.compare_ll((*f).slot(*args), (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::CompareOrdered {
                    args,
                    dest,
                    comparison,
                } => {
                    let result = self.compare_ordered_ll((*f).slot(*args), *comparison)?;
                    *(*f).slot(dest.slot()) = Value::of_bool((*self.vm).types.boolean, result);
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::Concat { args, dest } => {
                    self.concat_ll((*f).slot(*args), (*f).slot(dest.slot()))?;
                    if dest.on_stack() {
                        (*f).stack_count += 1;
                    }
                }

                Instr::Branch { target } => {
                    self.ip = *target as usize;
                    continue;
                }

                Instr::Leave { target } => {
                    let target = *target as usize;
                    self.evaluate_leave(target)?;
                    self.ip = target;
                    continue;
                }

                Instr::ConditionalBranch {
                    value,
                    condition,
                    target,
                } => {
                    let v = (*f).slot(value.slot());
                    let taken = match condition {
                        Condition::IfNull => (*v).is_null(),
                        Condition::NotNull => !(*v).is_null(),
                        Condition::IfFalse => (*v).is_false(),
                        Condition::IfTrue => (*v).is_true(),
                    };
                    if value.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    if taken {
                        self.ip = *target as usize;
                        continue;
                    }
                }

                Instr::BranchIfType {
                    value,
                    test_type,
                    target,
                } => {
                    let v = (*f).slot(value.slot());
                    let taken = Type::value_is_type(&*v, *test_type);
                    if value.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    if taken {
                        self.ip = *target as usize;
                        continue;
                    }
                }

                Instr::BranchIfRef {
                    args,
                    negated,
                    target,
                } => {
                    let ops = (*f).slot(*args);
                    let same = is_same_reference(&*ops, &*ops.add(1));
                    (*f).stack_count -= 2;
                    if same != *negated {
                        self.ip = *target as usize;
                        continue;
                    }
                }

                Instr::BranchComparison {
                    args,
                    comparison,
                    negated,
                    target,
                } => {
                    let args = (*f).slot(*args);
                    let result = match comparison {
                        Comparison::Eq => self.equals_ll(args)?,
                        ordered => self.compare_ordered_ll(args, *ordered)?,
                    };
                    if result != *negated {
                        self.ip = *target as usize;
                        continue;
                    }
                }

                Instr::Switch { value, targets } => {
                    let v = (*f).slot(value.slot());
                    if (*v).is_null() || (*v).type_ptr() != (*self.vm).types.int {
                        self.throw_type_error(None)?;
                    }
                    let selector = (*v).as_int();
                    if value.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    if selector >= 0 && (selector as usize) < targets.len() {
                        self.ip = targets[selector as usize] as usize;
                        continue;
                    }
                    // Out of range: fall through to the next instruction.
                }

                Instr::StoreField { args, field } => {
                    (**field).write_field(self as *mut Thread, (*f).slot(*args))?;
                    (*f).stack_count -= 2;
                }

                Instr::StoreStaticField { source, field } => {
                    self.store_static_field(*field, (*f).slot(source.slot()))?;
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                }

                Instr::StoreMember { args, name } => {
                    // Pops the instance and the value.
                    self.store_member_ll((*f).slot(*args), *name)?;
                }

                Instr::StoreIndexer { args, argc } => {
                    // Pops the instance, the index arguments and the value.
                    self.store_indexer_ll(*argc as u32, (*f).slot(*args))?;
                }

                Instr::LoadLocalRef { local } => {
                    let slot = (*f).slot(*local);
                    (*f).push(Value::local_reference(slot));
                }

                Instr::LoadMemberRef { source, name } => {
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    // Pushes the reference.
                    self.load_member_ref_ll((*f).slot(source.slot()), *name)?;
                }

                Instr::LoadFieldRef { source, field } => {
                    if source.on_stack() {
                        (*f).stack_count -= 1;
                    }
                    self.load_field_ref_ll((*f).slot(source.slot()), *field)?;
                }

                Instr::LoadStaticFieldRef { field } => {
                    if (**field).static_value.is_null() {
                        (*(**field).member.decl_type).run_static_ctor(self as *mut Thread)?;
                    }
                    (*f).push(Value::static_reference((**field).static_value));
                }

                Instr::Throw => return self.throw(false),
                Instr::Rethrow => return self.throw(true),

                // Reached through the handler interpreter in
                // find_error_handler or evaluate_leave; returning lets the
                // unwinder continue.
                Instr::EndFinally => return Ok(()),
            }

            self.ip = next;
        }
    }

    /// Looks for a handler for the current error in the current frame,
    /// considering only try blocks before `max_index` (pass `usize::MAX`
    /// for all of them). On success the IP is at the handler's first
    /// instruction and the error is the only value on the stack.
    pub unsafe fn find_error_handler(&mut self, max_index: usize) -> OpResult {
        let frame = self.current_frame;
        let overload = (*frame).method;
        let offset = self.ip;

        let count = max_index.min((*overload).try_blocks.len());
        for t in 0..count {
            let try_block = &(&(*overload).try_blocks)[t] as *const crate::types::method::TryBlock;
            if !(*try_block).contains(offset) {
                continue;
            }

            match &(*try_block).handler {
                TryHandler::Catch(catches) => {
                    for catch in catches.iter() {
                        if Type::value_is_type(&self.current_error, catch.caught_type) {
                            (*frame).stack_count = 1;
                            *(*frame).eval_stack = self.current_error;
                            self.ip = catch.catch_start;
                            return Ok(());
                        }
                    }
                }
                TryHandler::Finally { start, .. } => {
                    // Finally and fault run the same way while an error
                    // propagates. The error is saved around the handler:
                    // the handler body may run a GC cycle or throw and
                    // catch its own errors.
                    let start = *start;
                    (*frame).stack_count = 0;
                    let saved_error = self.current_error;

                    self.ip = start;
                    loop {
                        match self.evaluate() {
                            Ok(()) => break,
                            Err(Trap::Thrown) => {
                                // Try blocks are ordered innermost to
                                // outermost; an error inside the handler
                                // must not find a catch outside it.
                                match self.find_error_handler(t) {
                                    Ok(()) => continue,
                                    Err(e) => return Err(e),
                                }
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    self.ip = offset;
                    self.current_error = saved_error;
                }
            }
            // Keep scanning: an outer block may still handle the error.
        }

        Err(Trap::Thrown)
    }

    /// Runs every finally/fault handler whose protected range contains
    /// the current IP but not the branch target, innermost first. Used
    /// when a `leave` exits one or more try blocks.
    pub unsafe fn evaluate_leave(&mut self, target: usize) -> OpResult {
        let frame = self.current_frame;
        let overload = (*frame).method;
        let ip_offset = self.ip;

        for t in 0..(*overload).try_blocks.len() {
            let try_block = &(&(*overload).try_blocks)[t] as *const crate::types::method::TryBlock;
            let start = match (*try_block).handler {
                TryHandler::Finally { start, .. } => start,
                TryHandler::Catch(_) => continue,
            };
            debug_assert!(matches!(
                (*try_block).kind,
                TryKind::Finally | TryKind::Fault
            ));
            if !(*try_block).contains(ip_offset) || (*try_block).contains(target) {
                continue;
            }

            let prev_ip = self.ip;
            let saved_error = self.current_error;

            self.ip = start;
            loop {
                match self.evaluate() {
                    Ok(()) => break,
                    Err(Trap::Thrown) => match self.find_error_handler(t) {
                        Ok(()) => continue,
                        Err(e) => return Err(e),
                    },
                    Err(e) => return Err(e),
                }
            }

            self.ip = prev_ip;
            self.current_error = saved_error;
        }

        Ok(())
    }
}
