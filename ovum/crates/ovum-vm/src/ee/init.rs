//! The method initialiser.
//!
//! Before an overload's bytecode can run, its on-disk opcode stream is
//! rewritten into the engine's internal instruction stream:
//!
//! 1. parse the raw opcodes front to back, resolving every token to a
//!    pointer (with accessibility, static/instance and constructibility
//!    checks);
//! 2. convert branch targets and try-block boundaries from byte offsets
//!    to instruction indices;
//! 3. abstractly interpret the evaluation stack from the method entry and
//!    from every handler, recording the height at each reachable
//!    instruction, assigning slot offsets to all operands, applying the
//!    peephole rules, and validating reference discipline;
//! 4. compact the stream, dropping removed and unreachable instructions
//!    and renumbering every target;
//! 5. record the types whose static constructors must run before the
//!    method executes.

use std::collections::VecDeque;

use crate::error::{MethodInitError, MethodInitFailure};
use crate::module::token::Token;
use crate::module::Module;
use crate::strings::{string_to_rust, ManagedString};
use crate::types::member::{Field, Member};
use crate::types::method::{
    Method, MethodOverload, OverloadBody, OverloadFlags, RefSignature, TryHandler,
};
use crate::types::{Operator, Type, TypeFlags};

use super::instr::{Comparison, Condition, Instr, Operand, Slot, StackChange};
use super::opcodes as opc;
use super::thread::FRAME_SLOTS;

/// Height markers: not yet visited, or explicitly removed.
const UNVISITED: i32 = -1;
const REMOVED: i32 = -2;

struct ParsedInstr {
    original_offset: u32,
    original_size: u32,
    instr: Instr,
    stack_height: i32,
    has_incoming_branches: bool,
    /// The instruction pushes a reference value.
    pushes_ref: bool,
}

impl ParsedInstr {
    /// A plain local load eligible for input forwarding.
    fn load_local_source(&self) -> Option<Slot> {
        if self.pushes_ref {
            return None;
        }
        match &self.instr {
            Instr::Move {
                source: Operand::Local(slot),
                dest: Operand::Stack(_),
            } => Some(*slot),
            _ => None,
        }
    }

    /// A plain local store eligible for output absorption.
    fn store_local_target(&self) -> Option<Slot> {
        match &self.instr {
            Instr::Move {
                source: Operand::Stack(_),
                dest: Operand::Local(slot),
            } => Some(*slot),
            _ => None,
        }
    }
}

/// Rewrites `overload` into the internal instruction stream. Returns the
/// types whose static constructors must run before the method executes.
pub unsafe fn initialize_overload(
    overload: *mut MethodOverload,
) -> Result<Vec<*mut Type>, MethodInitError> {
    debug_assert!(!(*overload).is_initialized());

    let mut init = Initializer::new(overload);

    init.parse_instructions()?;
    init.relocate_offsets()?;
    init.calculate_stack_heights()?;
    init.compact();

    let instrs: Vec<Instr> = init
        .instrs
        .into_iter()
        .map(|parsed| parsed.instr)
        .collect();
    (*overload).body = OverloadBody::Initialized(instrs.into_boxed_slice());
    (*overload).flags |= OverloadFlags::INITED;

    Ok(init.types_to_initialize)
}

struct Initializer {
    overload: *mut MethodOverload,
    module: *mut Module,
    instrs: Vec<ParsedInstr>,
    has_branches: bool,
    types_to_initialize: Vec<*mut Type>,
}

/// A pending branch in the abstract interpretation queue.
struct PendingBranch {
    first_instr: usize,
    height: u32,
    /// Which stack slots currently hold reference values.
    refs: Vec<bool>,
}

impl Initializer {
    unsafe fn new(overload: *mut MethodOverload) -> Initializer {
        let module = (*(*overload).group).member.decl_module;
        Initializer {
            overload,
            module,
            instrs: Vec::new(),
            has_branches: false,
            types_to_initialize: Vec::new(),
        }
    }

    // === Error helpers ===

    unsafe fn error(&self, message: &str, failure: MethodInitFailure) -> MethodInitError {
        let overload = self.overload;
        let group = (*overload).group;
        let method = if !(*group).member.decl_type.is_null() {
            format!(
                "{}.{}",
                string_to_rust((*(*group).member.decl_type).full_name),
                string_to_rust((*group).member.name)
            )
        } else {
            string_to_rust((*group).member.name)
        };
        MethodInitError {
            method,
            module: string_to_rust((*self.module).name),
            message: message.to_string(),
            failure,
        }
    }

    unsafe fn member_name(member: &Member) -> String {
        let decl_type = member.decl_type();
        if !decl_type.is_null() {
            format!(
                "{}.{}",
                string_to_rust((*decl_type).full_name),
                string_to_rust(member.name())
            )
        } else {
            string_to_rust(member.name())
        }
    }

    // === Token resolution ===

    unsafe fn from_decl_type(&self) -> *mut Type {
        (*self.overload).decl_type
    }

    unsafe fn type_from_token(&self, token: Token) -> Result<*mut Type, MethodInitError> {
        let result = (*self.module).find_type(token);
        if result.is_null() {
            return Err(self.error(
                "Unresolved TypeDef or TypeRef token.",
                MethodInitFailure::UnresolvedToken { token: token.0 },
            ));
        }
        if (*result).is_internal() && (*result).module != self.module {
            return Err(self.error(
                "The type is not accessible from outside its declaring module.",
                MethodInitFailure::InaccessibleType {
                    type_name: string_to_rust((*result).full_name),
                },
            ));
        }
        Ok(result)
    }

    unsafe fn string_from_token(&self, token: Token) -> Result<*mut ManagedString, MethodInitError> {
        let result = (*self.module).find_string(token);
        if result.is_null() {
            return Err(self.error(
                "Unresolved String token.",
                MethodInitFailure::UnresolvedToken { token: token.0 },
            ));
        }
        Ok(result)
    }

    unsafe fn method_from_token(&self, token: Token) -> Result<*mut Method, MethodInitError> {
        let result = (*self.module).find_method(token);
        if result.is_null() {
            return Err(self.error(
                "Unresolved MethodDef, MethodRef, FunctionDef or FunctionRef token.",
                MethodInitFailure::UnresolvedToken { token: token.0 },
            ));
        }

        if (*result).is_static() {
            // Static methods are access-checked here; instance methods
            // go through the member lookup rules at run time.
            let accessible = if !(*result).member.decl_type.is_null() {
                // For static methods, pretend the member is accessed
                // through an instance of the calling type.
                Member::Method(result).is_accessible(self.from_decl_type(), self.from_decl_type())
            } else {
                (*result).member.is_public() || (*result).member.decl_module == self.module
            };
            if !accessible {
                return Err(self.error(
                    "The method is inaccessible from this location.",
                    MethodInitFailure::InaccessibleMember {
                        member: Self::member_name(&Member::Method(result)),
                    },
                ));
            }
        }

        Ok(result)
    }

    /// Resolves a method token to an overload accepting `argc` arguments
    /// (instance included).
    unsafe fn method_overload_from_token(
        &self,
        token: Token,
        argc: u32,
    ) -> Result<*mut MethodOverload, MethodInitError> {
        let method = self.method_from_token(token)?;

        let argc = if (*method).is_static() { argc } else { argc - 1 };
        let overload = (*method).resolve_overload(argc);
        if overload.is_null() {
            return Err(self.error(
                "Could not find an overload that takes the specified number of arguments.",
                MethodInitFailure::NoMatchingOverload {
                    method: Self::member_name(&Member::Method(method)),
                    arg_count: argc,
                },
            ));
        }
        Ok(overload)
    }

    unsafe fn field_from_token(
        &self,
        token: Token,
        should_be_static: bool,
    ) -> Result<*mut Field, MethodInitError> {
        let field = (*self.module).find_field(token);
        if field.is_null() {
            return Err(self.error(
                "Unresolved FieldDef or FieldRef token.",
                MethodInitFailure::UnresolvedToken { token: token.0 },
            ));
        }

        if (*field).is_static()
            && !Member::Field(field).is_accessible(std::ptr::null(), self.from_decl_type())
        {
            return Err(self.error(
                "The field is inaccessible from this location.",
                MethodInitFailure::InaccessibleMember {
                    member: Self::member_name(&Member::Field(field)),
                },
            ));
        }

        if should_be_static != (*field).is_static() {
            return Err(self.error(
                if should_be_static {
                    "The field must be static."
                } else {
                    "The field must be an instance field."
                },
                MethodInitFailure::FieldStaticMismatch {
                    field: Self::member_name(&Member::Field(field)),
                    must_be_static: should_be_static,
                },
            ));
        }

        Ok(field)
    }

    unsafe fn ensure_constructible(&self, ty: *mut Type, argc: u32) -> Result<(), MethodInitError> {
        if (*ty).is_primitive() || (*ty).flags.contains(TypeFlags::ABSTRACT) {
            return Err(self.error(
                "Primitive, abstract and static types cannot be used with the newobj instruction.",
                MethodInitFailure::TypeNotConstructible {
                    type_name: string_to_rust((*ty).full_name),
                },
            ));
        }
        let ctor = (*ty).instance_ctor;
        if ctor.is_null() {
            return Err(self.error(
                "The type does not declare an instance constructor.",
                MethodInitFailure::TypeNotConstructible {
                    type_name: string_to_rust((*ty).full_name),
                },
            ));
        }
        if !Member::Method(ctor).is_accessible(ty, self.from_decl_type()) {
            return Err(self.error(
                "The instance constructor is not accessible from this location.",
                MethodInitFailure::TypeNotConstructible {
                    type_name: string_to_rust((*ty).full_name),
                },
            ));
        }
        if (*ctor).resolve_overload(argc).is_null() {
            return Err(self.error(
                "The instance constructor does not take the specified number of arguments.",
                MethodInitFailure::NoMatchingOverload {
                    method: Self::member_name(&Member::Method(ctor)),
                    arg_count: argc,
                },
            ));
        }
        Ok(())
    }

    unsafe fn add_type_to_initialize(&mut self, ty: *mut Type) {
        if (*ty).has_static_ctor_run() {
            return;
        }
        if !self.types_to_initialize.contains(&ty) {
            self.types_to_initialize.push(ty);
        }
    }

    // === Slot offsets ===

    unsafe fn argument_slot(&self, arg: u32) -> Slot {
        Slot(arg as i32 - (*self.overload).effective_param_count() as i32)
    }

    unsafe fn local_slot(&self, local: u32) -> Slot {
        Slot(FRAME_SLOTS + local as i32)
    }

    unsafe fn stack_slot(&self, height: u32) -> Slot {
        Slot(FRAME_SLOTS + (*self.overload).locals as i32 + height as i32)
    }

    // === Step 1: parsing ===

    unsafe fn parse_instructions(&mut self) -> Result<(), MethodInitError> {
        let code: &[u8] = match &(*self.overload).body {
            OverloadBody::Raw(code) => {
                std::slice::from_raw_parts(code.as_ptr(), code.len())
            }
            _ => return Err(self.error("Method has no bytecode body.", MethodInitFailure::General)),
        };

        let mut reader = BodyReader { code, pos: 0 };
        while !reader.at_end() {
            let start = reader.pos;
            let (instr, pushes_ref) = self.parse_instruction(&mut reader)?;
            self.instrs.push(ParsedInstr {
                original_offset: start as u32,
                original_size: (reader.pos - start) as u32,
                instr,
                stack_height: UNVISITED,
                has_incoming_branches: false,
                pushes_ref,
            });
        }
        Ok(())
    }

    unsafe fn parse_instruction(
        &mut self,
        r: &mut BodyReader<'_>,
    ) -> Result<(Instr, bool), MethodInitError> {
        let stack = Operand::Stack(Slot(0));
        let eof = |s: &Initializer| unsafe {
            s.error("Unexpected end of method body.", MethodInitFailure::General)
        };
        macro_rules! read {
            ($e:expr) => {
                match $e {
                    Some(v) => v,
                    None => return Err(eof(self)),
                }
            };
        }

        let ref_signature = (*self.overload).ref_signature;
        let opcode = read!(r.u8());
        let mut pushes_ref = false;

        let instr = match opcode {
            opc::NOP => Instr::Nop,
            opc::DUP => Instr::Dup {
                source: stack,
                dest: stack,
            },
            opc::POP => Instr::Pop,

            // Arguments. Loading a by-ref parameter reads through the
            // reference; taking a reference of one re-pushes it.
            opc::LDARG_0..=opc::LDARG_3 => {
                self.load_argument(opcode as u32 - opc::LDARG_0 as u32, ref_signature)
            }
            opc::LDARG_S => {
                let n = read!(r.u8()) as u32;
                self.load_argument(n, ref_signature)
            }
            opc::LDARG => {
                let n = read!(r.u16()) as u32;
                self.load_argument(n, ref_signature)
            }
            opc::STARG_S => {
                let n = read!(r.u8()) as u32;
                self.store_argument(n, ref_signature)
            }
            opc::STARG => {
                let n = read!(r.u16()) as u32;
                self.store_argument(n, ref_signature)
            }

            // Locals
            opc::LDLOC_0..=opc::LDLOC_3 => Instr::Move {
                source: Operand::Local(self.local_slot(opcode as u32 - opc::LDLOC_0 as u32)),
                dest: stack,
            },
            opc::STLOC_0..=opc::STLOC_3 => Instr::Move {
                source: stack,
                dest: Operand::Local(self.local_slot(opcode as u32 - opc::STLOC_0 as u32)),
            },
            opc::LDLOC_S => {
                let n = read!(r.u8()) as u32;
                Instr::Move {
                    source: Operand::Local(self.local_slot(n)),
                    dest: stack,
                }
            }
            opc::LDLOC => {
                let n = read!(r.u16()) as u32;
                Instr::Move {
                    source: Operand::Local(self.local_slot(n)),
                    dest: stack,
                }
            }
            opc::STLOC_S => {
                let n = read!(r.u8()) as u32;
                Instr::Move {
                    source: stack,
                    dest: Operand::Local(self.local_slot(n)),
                }
            }
            opc::STLOC => {
                let n = read!(r.u16()) as u32;
                Instr::Move {
                    source: stack,
                    dest: Operand::Local(self.local_slot(n)),
                }
            }

            // Constants
            opc::LDNULL => Instr::LoadNull { dest: stack },
            opc::LDFALSE => Instr::LoadBool {
                dest: stack,
                value: false,
            },
            opc::LDTRUE => Instr::LoadBool {
                dest: stack,
                value: true,
            },
            opc::LDC_I_M1..=opc::LDC_I_8 => Instr::LoadInt {
                dest: stack,
                value: opcode as i64 - opc::LDC_I_0 as i64,
            },
            opc::LDC_I_S => Instr::LoadInt {
                dest: stack,
                value: read!(r.i8()) as i64,
            },
            opc::LDC_I_M => Instr::LoadInt {
                dest: stack,
                value: read!(r.i32()) as i64,
            },
            opc::LDC_I => Instr::LoadInt {
                dest: stack,
                value: read!(r.i64()),
            },
            opc::LDC_U => Instr::LoadUInt {
                dest: stack,
                value: read!(r.u64()),
            },
            opc::LDC_R => Instr::LoadReal {
                dest: stack,
                value: f64::from_bits(read!(r.u64())),
            },
            opc::LDSTR => {
                let value = self.string_from_token(Token(read!(r.u32())))?;
                Instr::LoadString { dest: stack, value }
            }
            opc::LDARGC => Instr::LoadArgc { dest: stack },
            opc::LDENUM_S => {
                let enum_type = self.type_from_token(Token(read!(r.u32())))?;
                let value = read!(r.i32()) as i64;
                Instr::LoadEnum {
                    dest: stack,
                    enum_type,
                    value,
                }
            }
            opc::LDENUM => {
                let enum_type = self.type_from_token(Token(read!(r.u32())))?;
                let value = read!(r.i64());
                Instr::LoadEnum {
                    dest: stack,
                    enum_type,
                    value,
                }
            }

            // Construction
            opc::NEWOBJ_S | opc::NEWOBJ => {
                let ctor_type = self.type_from_token(Token(read!(r.u32())))?;
                let argc = if opcode == opc::NEWOBJ_S {
                    read!(r.u8()) as u16
                } else {
                    read!(r.u16())
                };
                self.ensure_constructible(ctor_type, argc as u32)?;
                Instr::NewObject {
                    args: Slot(0),
                    dest: stack,
                    ctor_type,
                    argc,
                }
            }

            // Invocation
            opc::CALL_0..=opc::CALL_3 => Instr::Call {
                args: Slot(0),
                dest: stack,
                argc: (opcode - opc::CALL_0) as u16,
                ref_signature: RefSignature::EMPTY,
            },
            opc::CALL_S => Instr::Call {
                args: Slot(0),
                dest: stack,
                argc: read!(r.u8()) as u16,
                ref_signature: RefSignature::EMPTY,
            },
            opc::CALL => Instr::Call {
                args: Slot(0),
                dest: stack,
                argc: read!(r.u16()),
                ref_signature: RefSignature::EMPTY,
            },
            opc::SCALL_S | opc::SCALL => {
                let token = Token(read!(r.u32()));
                let argc = if opcode == opc::SCALL_S {
                    read!(r.u8()) as u16
                } else {
                    read!(r.u16())
                };
                let overload = self.method_overload_from_token(token, argc as u32)?;
                Instr::StaticCall {
                    args: Slot(0),
                    dest: stack,
                    argc: argc - (*overload).instance_offset() as u16,
                    stack_args: argc,
                    overload,
                }
            }
            opc::APPLY => Instr::Apply {
                args: Slot(0),
                dest: stack,
            },
            opc::SAPPLY => {
                let method = self.method_from_token(Token(read!(r.u32())))?;
                Instr::StaticApply {
                    args: Slot(0),
                    dest: stack,
                    method,
                }
            }

            // Control flow
            opc::RETNULL => Instr::RetNull,
            opc::RET => Instr::Ret,
            opc::BR_S => Instr::Branch {
                target: read!(r.i8()) as i32 as u32,
            },
            opc::BR => Instr::Branch {
                target: read!(r.i32()) as u32,
            },
            opc::BRNULL_S | opc::BRINST_S | opc::BRFALSE_S | opc::BRTRUE_S => {
                Instr::ConditionalBranch {
                    value: stack,
                    condition: Self::branch_condition(opcode),
                    target: read!(r.i8()) as i32 as u32,
                }
            }
            opc::BRNULL | opc::BRINST | opc::BRFALSE | opc::BRTRUE => {
                Instr::ConditionalBranch {
                    value: stack,
                    condition: Self::branch_condition(opcode),
                    target: read!(r.i32()) as u32,
                }
            }
            opc::BRREF_S | opc::BRNREF_S => Instr::BranchIfRef {
                args: Slot(0),
                negated: opcode & 1 != 0,
                target: read!(r.i8()) as i32 as u32,
            },
            opc::BRREF | opc::BRNREF => Instr::BranchIfRef {
                args: Slot(0),
                negated: opcode & 1 != 0,
                target: read!(r.i32()) as u32,
            },
            opc::BRTYPE_S => {
                let test_type = self.type_from_token(Token(read!(r.u32())))?;
                Instr::BranchIfType {
                    value: stack,
                    test_type,
                    target: read!(r.i8()) as i32 as u32,
                }
            }
            opc::BRTYPE => {
                let test_type = self.type_from_token(Token(read!(r.u32())))?;
                Instr::BranchIfType {
                    value: stack,
                    test_type,
                    target: read!(r.i32()) as u32,
                }
            }
            opc::SWITCH_S | opc::SWITCH => {
                let count = read!(r.u16()) as usize;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    let target = if opcode == opc::SWITCH_S {
                        read!(r.i8()) as i32
                    } else {
                        read!(r.i32())
                    };
                    targets.push(target as u32);
                }
                Instr::Switch {
                    value: stack,
                    targets: targets.into_boxed_slice(),
                }
            }

            // Operators
            opc::ADD..=opc::CMP => {
                let op = Operator::from_index(opcode - opc::ADD)
                    .expect("operator block out of sync");
                Instr::InvokeOperator {
                    args: Slot(0),
                    dest: stack,
                    op,
                }
            }
            opc::LT => Instr::CompareOrdered {
                args: Slot(0),
                dest: stack,
                comparison: Comparison::Lt,
            },
            opc::GT => Instr::CompareOrdered {
                args: Slot(0),
                dest: stack,
                comparison: Comparison::Gt,
            },
            opc::LTE => Instr::CompareOrdered {
                args: Slot(0),
                dest: stack,
                comparison: Comparison::Lte,
            },
            opc::GTE => Instr::CompareOrdered {
                args: Slot(0),
                dest: stack,
                comparison: Comparison::Gte,
            },
            opc::CONCAT => Instr::Concat {
                args: Slot(0),
                dest: stack,
            },

            // Containers
            opc::LIST_0 => Instr::CreateList {
                dest: stack,
                capacity: 0,
            },
            opc::LIST_S => Instr::CreateList {
                dest: stack,
                capacity: read!(r.u8()) as u32,
            },
            opc::LIST => Instr::CreateList {
                dest: stack,
                capacity: read!(r.u32()),
            },
            opc::HASH_0 => Instr::CreateHash {
                dest: stack,
                capacity: 0,
            },
            opc::HASH_S => Instr::CreateHash {
                dest: stack,
                capacity: read!(r.u8()) as u32,
            },
            opc::HASH => Instr::CreateHash {
                dest: stack,
                capacity: read!(r.u32()),
            },

            opc::LDITER => Instr::LoadIterator {
                source: stack,
                dest: stack,
            },
            opc::LDTYPE => Instr::LoadTypeOf {
                source: stack,
                dest: stack,
            },

            // Fields
            opc::LDFLD => {
                let field = self.field_from_token(Token(read!(r.u32())), false)?;
                Instr::LoadField {
                    source: stack,
                    dest: stack,
                    field,
                    type_check: true,
                }
            }
            opc::STFLD => {
                let field = self.field_from_token(Token(read!(r.u32())), false)?;
                Instr::StoreField {
                    args: Slot(0),
                    field,
                }
            }
            opc::LDSFLD => {
                let field = self.field_from_token(Token(read!(r.u32())), true)?;
                self.add_type_to_initialize((*field).member.decl_type);
                Instr::LoadStaticField { dest: stack, field }
            }
            opc::STSFLD => {
                let field = self.field_from_token(Token(read!(r.u32())), true)?;
                self.add_type_to_initialize((*field).member.decl_type);
                Instr::StoreStaticField {
                    source: stack,
                    field,
                }
            }

            // Named member access
            opc::LDMEM => {
                let name = self.string_from_token(Token(read!(r.u32())))?;
                Instr::LoadMember {
                    source: stack,
                    dest: stack,
                    name,
                }
            }
            opc::STMEM => {
                let name = self.string_from_token(Token(read!(r.u32())))?;
                Instr::StoreMember { args: Slot(0), name }
            }

            // Indexers
            opc::LDIDX_1 => Instr::LoadIndexer {
                args: Slot(0),
                dest: stack,
                argc: 1,
            },
            opc::LDIDX_S => Instr::LoadIndexer {
                args: Slot(0),
                dest: stack,
                argc: read!(r.u8()) as u16,
            },
            opc::LDIDX => Instr::LoadIndexer {
                args: Slot(0),
                dest: stack,
                argc: read!(r.u16()),
            },
            opc::STIDX_1 => Instr::StoreIndexer {
                args: Slot(0),
                argc: 1,
            },
            opc::STIDX_S => Instr::StoreIndexer {
                args: Slot(0),
                argc: read!(r.u8()) as u16,
            },
            opc::STIDX => Instr::StoreIndexer {
                args: Slot(0),
                argc: read!(r.u16()),
            },

            opc::LDSFN => {
                let method = self.method_from_token(Token(read!(r.u32())))?;
                Instr::LoadStaticFunction { dest: stack, method }
            }
            opc::LDTYPETKN => {
                let target_type = self.type_from_token(Token(read!(r.u32())))?;
                Instr::LoadTypeToken {
                    dest: stack,
                    target_type,
                }
            }

            // Exception handling
            opc::THROW => Instr::Throw,
            opc::RETHROW => Instr::Rethrow,
            opc::LEAVE_S => Instr::Leave {
                target: read!(r.i8()) as i32 as u32,
            },
            opc::LEAVE => Instr::Leave {
                target: read!(r.i32()) as u32,
            },
            opc::ENDFINALLY => Instr::EndFinally,

            // Member call
            opc::CALLMEM_S | opc::CALLMEM => {
                let name = self.string_from_token(Token(read!(r.u32())))?;
                let argc = if opcode == opc::CALLMEM_S {
                    read!(r.u8()) as u16
                } else {
                    read!(r.u16())
                };
                Instr::CallMember {
                    args: Slot(0),
                    dest: stack,
                    name,
                    argc,
                    ref_signature: RefSignature::EMPTY,
                }
            }

            // References
            opc::LDMEMREF => {
                let name = self.string_from_token(Token(read!(r.u32())))?;
                pushes_ref = true;
                Instr::LoadMemberRef {
                    source: stack,
                    name,
                }
            }
            opc::LDARGREF_S | opc::LDARGREF => {
                let n = if opcode == opc::LDARGREF_S {
                    read!(r.u8()) as u32
                } else {
                    read!(r.u16()) as u32
                };
                pushes_ref = true;
                let ref_index = if (*self.overload).is_instance_method() {
                    n
                } else {
                    n + 1
                };
                if ref_signature.is_param_ref(ref_index) {
                    // The parameter already holds a reference; pass it on.
                    Instr::Move {
                        source: Operand::Local(self.argument_slot(n)),
                        dest: stack,
                    }
                } else {
                    Instr::LoadLocalRef {
                        local: self.argument_slot(n),
                    }
                }
            }
            opc::LDLOCREF_S | opc::LDLOCREF => {
                let n = if opcode == opc::LDLOCREF_S {
                    read!(r.u8()) as u32
                } else {
                    read!(r.u16()) as u32
                };
                pushes_ref = true;
                Instr::LoadLocalRef {
                    local: self.local_slot(n),
                }
            }
            opc::LDFLDREF => {
                let field = self.field_from_token(Token(read!(r.u32())), false)?;
                pushes_ref = true;
                Instr::LoadFieldRef {
                    source: stack,
                    field,
                }
            }
            opc::LDSFLDREF => {
                let field = self.field_from_token(Token(read!(r.u32())), true)?;
                self.add_type_to_initialize((*field).member.decl_type);
                pushes_ref = true;
                Instr::LoadStaticFieldRef { field }
            }

            _ => {
                return Err(self.error("Invalid opcode encountered.", MethodInitFailure::General))
            }
        };

        if matches!(
            instr,
            Instr::Branch { .. }
                | Instr::Leave { .. }
                | Instr::ConditionalBranch { .. }
                | Instr::BranchIfType { .. }
                | Instr::BranchIfRef { .. }
                | Instr::Switch { .. }
        ) {
            self.has_branches = true;
        }

        Ok((instr, pushes_ref))
    }

    fn branch_condition(opcode: u8) -> Condition {
        match opcode {
            opc::BRNULL | opc::BRNULL_S => Condition::IfNull,
            opc::BRINST | opc::BRINST_S => Condition::NotNull,
            opc::BRFALSE | opc::BRFALSE_S => Condition::IfFalse,
            _ => Condition::IfTrue,
        }
    }

    /// `ldarg n`: a plain load, or a read through the reference when the
    /// parameter is by ref.
    unsafe fn load_argument(&self, n: u32, ref_signature: RefSignature) -> Instr {
        let slot = self.argument_slot(n);
        let ref_index = if (*self.overload).is_instance_method() {
            n
        } else {
            n + 1
        };
        if ref_signature.is_param_ref(ref_index) {
            Instr::MoveFromRef {
                source: Operand::Local(slot),
                dest: Operand::Stack(Slot(0)),
            }
        } else {
            Instr::Move {
                source: Operand::Local(slot),
                dest: Operand::Stack(Slot(0)),
            }
        }
    }

    /// `starg n`: a plain store, or a write through the reference when
    /// the parameter is by ref.
    unsafe fn store_argument(&self, n: u32, ref_signature: RefSignature) -> Instr {
        let slot = self.argument_slot(n);
        let ref_index = if (*self.overload).is_instance_method() {
            n
        } else {
            n + 1
        };
        if ref_signature.is_param_ref(ref_index) {
            Instr::MoveToRef {
                source: Operand::Stack(Slot(0)),
                dest: Operand::Local(slot),
            }
        } else {
            Instr::Move {
                source: Operand::Stack(Slot(0)),
                dest: Operand::Local(slot),
            }
        }
    }

    // === Step 2: offsets to instruction indices ===

    /// Finds the instruction starting at `byte_offset`. The end of the
    /// stream is a valid position, one past the last instruction.
    fn find_index(&self, byte_offset: usize) -> Option<usize> {
        let total: usize = self
            .instrs
            .last()
            .map(|i| (i.original_offset + i.original_size) as usize)
            .unwrap_or(0);
        if byte_offset == total {
            return Some(self.instrs.len());
        }
        self.instrs
            .binary_search_by_key(&(byte_offset as u32), |i| i.original_offset)
            .ok()
    }

    unsafe fn relocate_offsets(&mut self) -> Result<(), MethodInitError> {
        if self.has_branches {
            for i in 0..self.instrs.len() {
                let base =
                    (self.instrs[i].original_offset + self.instrs[i].original_size) as i64;

                if let Some(rel) = self.instrs[i].instr.branch_target() {
                    let byte_target = base + rel as i32 as i64;
                    let index = byte_target
                        .try_into()
                        .ok()
                        .and_then(|t: usize| self.find_index(t))
                        .filter(|&t| t < self.instrs.len());
                    let Some(index) = index else {
                        return Err(self.error(
                            "Invalid branch offset.",
                            MethodInitFailure::InvalidBranchOffset { instr_index: i },
                        ));
                    };
                    self.instrs[i].instr.set_branch_target(index as u32);
                    self.instrs[index].has_incoming_branches = true;
                } else if let Instr::Switch { targets, .. } = &self.instrs[i].instr {
                    let mut new_targets = Vec::with_capacity(targets.len());
                    for &rel in targets.iter() {
                        let byte_target = base + rel as i32 as i64;
                        let index = byte_target
                            .try_into()
                            .ok()
                            .and_then(|t: usize| self.find_index(t))
                            .filter(|&t| t < self.instrs.len());
                        let Some(index) = index else {
                            return Err(self.error(
                                "Invalid branch offset.",
                                MethodInitFailure::InvalidBranchOffset { instr_index: i },
                            ));
                        };
                        new_targets.push(index as u32);
                    }
                    for &t in &new_targets {
                        self.instrs[t as usize].has_incoming_branches = true;
                    }
                    if let Instr::Switch { targets, .. } = &mut self.instrs[i].instr {
                        *targets = new_targets.into_boxed_slice();
                    }
                }
            }
        }

        // Try blocks: byte offsets become instruction indices, and catch
        // types unresolved at load time are resolved now.
        let overload = self.overload;
        let mut try_blocks = std::mem::take(&mut (*overload).try_blocks);
        for (t, try_block) in try_blocks.iter_mut().enumerate() {
            let map = |this: &Self, offset: usize| -> Result<usize, MethodInitError> {
                this.find_index(offset).ok_or_else(|| unsafe {
                    this.error(
                        "Invalid try block offset.",
                        MethodInitFailure::InvalidBranchOffset { instr_index: t },
                    )
                })
            };
            try_block.try_start = map(self, try_block.try_start)?;
            try_block.try_end = map(self, try_block.try_end)?;
            match &mut try_block.handler {
                TryHandler::Catch(catches) => {
                    for catch in catches.iter_mut() {
                        if catch.caught_type.is_null() {
                            catch.caught_type = self.type_from_token(catch.caught_type_token)?;
                        }
                        catch.catch_start = map(self, catch.catch_start)?;
                        catch.catch_end = map(self, catch.catch_end)?;
                    }
                }
                TryHandler::Finally { start, end } => {
                    *start = map(self, *start)?;
                    *end = map(self, *end)?;
                }
            }
        }
        (*overload).try_blocks = try_blocks;

        Ok(())
    }

    // === Step 3: abstract interpretation ===

    unsafe fn calculate_stack_heights(&mut self) -> Result<(), MethodInitError> {
        let mut queue: VecDeque<PendingBranch> = VecDeque::new();

        // The first instruction is always reachable. Handlers are only
        // reachable through the unwinder: catches start with the error on
        // the stack, finally and fault handlers with an empty stack.
        queue.push_back(PendingBranch {
            first_instr: 0,
            height: 0,
            refs: Vec::new(),
        });
        for try_block in (*self.overload).try_blocks.iter() {
            match &try_block.handler {
                TryHandler::Catch(catches) => {
                    for catch in catches.iter() {
                        queue.push_back(PendingBranch {
                            first_instr: catch.catch_start,
                            height: 1,
                            refs: vec![false],
                        });
                    }
                }
                TryHandler::Finally { start, .. } => {
                    queue.push_back(PendingBranch {
                        first_instr: *start,
                        height: 0,
                        refs: Vec::new(),
                    });
                }
            }
        }

        while let Some(branch) = queue.pop_front() {
            self.walk_branch(branch, &mut queue)?;
        }

        Ok(())
    }

    unsafe fn walk_branch(
        &mut self,
        branch: PendingBranch,
        queue: &mut VecDeque<PendingBranch>,
    ) -> Result<(), MethodInitError> {
        let max_stack = (*self.overload).max_stack;
        let mut height = branch.height;
        let mut refs = branch.refs;
        refs.resize(height as usize, false);

        let mut index = branch.first_instr;
        let mut prev: Option<usize> = None;

        loop {
            if index >= self.instrs.len() {
                return Err(self.error(
                    "Execution runs off the end of the method.",
                    MethodInitFailure::InvalidBranchOffset {
                        instr_index: index.saturating_sub(1),
                    },
                ));
            }

            let recorded = self.instrs[index].stack_height;
            if recorded >= 0 {
                if recorded as u32 != height {
                    return Err(self.error(
                        "Instruction reached with different stack heights.",
                        MethodInitFailure::InconsistentStack { instr_index: index },
                    ));
                }
                return Ok(()); // branch already visited
            }
            self.instrs[index].stack_height = height as i32;

            let sc = self.instrs[index].instr.stack_change();
            if sc.removed > height {
                return Err(self.error(
                    "There are not enough values on the stack.",
                    MethodInitFailure::InsufficientStack { instr_index: index },
                ));
            }

            self.resolve_operands(index, prev, height, sc)?;
            self.check_and_apply_refs(index, &mut refs, height, sc)?;

            height = height - sc.removed + sc.added;
            if height > max_stack {
                return Err(self.error(
                    "The evaluation stack exceeds the method's declared max stack.",
                    MethodInitFailure::InconsistentStack { instr_index: index },
                ));
            }

            // Branch bookkeeping, fusion and termination.
            match &self.instrs[index].instr {
                Instr::Branch { target } | Instr::Leave { target } => {
                    index = *target as usize;
                    prev = None;
                    continue;
                }
                Instr::ConditionalBranch { condition, target, .. } => {
                    let target = *target as usize;
                    let condition = *condition;
                    queue.push_back(PendingBranch {
                        first_instr: target,
                        height,
                        refs: refs.clone(),
                    });
                    self.try_fuse_comparison(index, prev, condition, target as u32);
                }
                Instr::BranchIfType { target, .. }
                | Instr::BranchIfRef { target, .. } => {
                    queue.push_back(PendingBranch {
                        first_instr: *target as usize,
                        height,
                        refs: refs.clone(),
                    });
                }
                Instr::Switch { targets, .. } => {
                    for &target in targets.iter() {
                        queue.push_back(PendingBranch {
                            first_instr: target as usize,
                            height,
                            refs: refs.clone(),
                        });
                    }
                }
                Instr::Ret | Instr::RetNull | Instr::EndFinally => {
                    if height != 0 {
                        return Err(self.error(
                            "Values remain on the stack at the end of the instruction sequence.",
                            MethodInitFailure::InconsistentStack { instr_index: index },
                        ));
                    }
                    return Ok(());
                }
                Instr::Throw | Instr::Rethrow => return Ok(()),
                _ => {}
            }

            prev = Some(index);
            index += 1;
        }
    }

    /// Assigns input/output slots and applies the local-forwarding and
    /// store/pop absorption rules.
    unsafe fn resolve_operands(
        &mut self,
        index: usize,
        prev: Option<usize>,
        height: u32,
        sc: StackChange,
    ) -> Result<(), MethodInitError> {
        let overload = self.overload;

        let is_dup = matches!(self.instrs[index].instr, Instr::Dup { .. });
        let is_pop = matches!(self.instrs[index].instr, Instr::Pop);
        let store_target = self.instrs[index].store_local_target();
        let has_incoming = self.instrs[index].has_incoming_branches;

        if sc.removed > 0 || self.instrs[index].instr.has_input() {
            // If the previous instruction produced exactly one value (or
            // is a dup) and nothing branches here, a following store can
            // absorb its output, and a following pop can discard it at
            // the source.
            let can_update_prev = prev.is_some_and(|p| {
                let p = &self.instrs[p];
                p.instr.has_output()
                    && (p.instr.stack_change().added == 1 || matches!(p.instr, Instr::Dup { .. }))
            }) && !has_incoming;

            if can_update_prev && store_target.is_some() {
                let target = store_target.unwrap();
                self.instrs[prev.unwrap()]
                    .instr
                    .set_output(Operand::Local(target));
                self.instrs[index].stack_height = REMOVED;
            } else if can_update_prev && is_pop {
                // Write the result into the dead stack slot; nothing is
                // pushed or popped at run time.
                let slot = self.stack_slot(height - 1);
                self.instrs[prev.unwrap()]
                    .instr
                    .set_output(Operand::Local(slot));
                self.instrs[index].stack_height = REMOVED;
            } else {
                let forwardable = prev.is_some_and(|p| {
                    !self.instrs[p].has_incoming_branches
                        && self.instrs[p].load_local_source().is_some()
                }) && self.instrs[index].instr.has_input()
                    && !self.instrs[index].instr.requires_stack_input()
                    && !has_incoming;

                // An input parsed with a `Local` flavour (plain local
                // loads, by-ref argument accesses) is already resolved;
                // only stack-flavoured placeholders receive a slot here.
                let input_unresolved = matches!(
                    self.instrs[index].instr.input(),
                    Some(Operand::Stack(_))
                );

                if forwardable && input_unresolved {
                    let source = self.instrs[prev.unwrap()].load_local_source().unwrap();
                    self.instrs[index]
                        .instr
                        .set_input(Operand::Local(source));
                    self.instrs[prev.unwrap()].stack_height = REMOVED;
                } else {
                    let slot = self.stack_slot(height - sc.removed);
                    if input_unresolved {
                        self.instrs[index].instr.set_input(Operand::Stack(slot));
                    }
                    self.instrs[index].instr.set_args(slot);
                }
            }
        }

        // Outputs parsed with a `Local` flavour (plain local stores,
        // by-ref argument stores) stay put; stack placeholders get the
        // slot the result lands in.
        if matches!(
            self.instrs[index].instr.output(),
            Some(Operand::Stack(_))
        ) && self.instrs[index].stack_height != REMOVED
        {
            let out_height = if is_dup {
                height // the copy lands one above the original
            } else {
                height - sc.removed
            };
            let slot = self.stack_slot(out_height);
            self.instrs[index].instr.set_output(Operand::Stack(slot));
        }

        // With the instance provably `this`, the field type check is
        // redundant.
        if let Some(p) = prev {
            if !has_incoming && (*overload).is_instance_method() {
                let this_slot = self.argument_slot(0);
                let prev_loads_this =
                    self.instrs[p].load_local_source() == Some(this_slot)
                        && self.instrs[p].stack_height != REMOVED;
                if prev_loads_this {
                    if let Instr::LoadField {
                        field, type_check, ..
                    } = &mut self.instrs[index].instr
                    {
                        let mut ty = (*overload).decl_type;
                        while !ty.is_null() {
                            if ty == (**field).member.decl_type {
                                *type_check = false;
                                break;
                            }
                            ty = (*ty).base_type;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Tracks which stack slots hold references, forbids references
    /// where they cannot flow, and computes call-site ref signatures.
    unsafe fn check_and_apply_refs(
        &mut self,
        index: usize,
        refs: &mut Vec<bool>,
        height: u32,
        sc: StackChange,
    ) -> Result<(), MethodInitError> {
        let removed_base = (height - sc.removed) as usize;
        let popped: Vec<bool> = refs[removed_base..height as usize].to_vec();

        // Classify the instruction's attitude to references first; the
        // call forms get their invocation signature computed from the
        // popped slots.
        enum RefRule {
            /// Dynamic call: slot 0 is the callee or instance.
            DynamicCall { argc: usize },
            /// Static call: verify against the resolved overload.
            StaticCall {
                argc: usize,
                instance_slots: usize,
                overload: *mut MethodOverload,
            },
            /// Moves, dup and pop carry references around freely.
            Carries,
            /// Everything else must not consume a reference.
            Forbids,
        }

        let rule = match &self.instrs[index].instr {
            Instr::Call { argc, .. } | Instr::CallMember { argc, .. } => RefRule::DynamicCall {
                argc: *argc as usize,
            },
            Instr::StaticCall {
                argc,
                stack_args,
                overload,
                ..
            } => RefRule::StaticCall {
                argc: *argc as usize,
                instance_slots: (*stack_args - *argc) as usize,
                overload: *overload,
            },
            Instr::Move { .. } | Instr::MoveToRef { .. } | Instr::Dup { .. } | Instr::Pop => {
                RefRule::Carries
            }
            _ => RefRule::Forbids,
        };

        match rule {
            RefRule::DynamicCall { argc } => {
                // popped = [callee/instance, arg0, arg1, ...]
                if popped.first().copied().unwrap_or(false) {
                    return Err(self.error(
                        "A reference cannot be used as the target of an invocation.",
                        MethodInitFailure::StackHasRefs { instr_index: index },
                    ));
                }
                let mut signature = RefSignature::EMPTY;
                for i in 0..argc {
                    if popped.get(i + 1).copied().unwrap_or(false) {
                        signature.set_param_ref(i as u32 + 1);
                    }
                }
                match &mut self.instrs[index].instr {
                    Instr::Call { ref_signature, .. }
                    | Instr::CallMember { ref_signature, .. } => *ref_signature = signature,
                    _ => unreachable!(),
                }
            }
            RefRule::StaticCall {
                argc,
                instance_slots,
                overload,
            } => {
                if instance_slots > 0 && popped.first().copied().unwrap_or(false) {
                    return Err(self.error(
                        "A reference cannot be used as the instance of an invocation.",
                        MethodInitFailure::StackHasRefs { instr_index: index },
                    ));
                }
                let mut signature = RefSignature::EMPTY;
                for i in 0..argc {
                    if popped.get(i + instance_slots).copied().unwrap_or(false) {
                        signature.set_param_ref(i as u32 + 1);
                    }
                }
                if signature != (*overload).ref_signature
                    && (*overload)
                        .ref_signature
                        .verify(signature, argc as u32)
                        .is_some()
                {
                    return Err(self.error(
                        "One or more arguments has the wrong referenceness.",
                        MethodInitFailure::NoMatchingOverload {
                            method: Self::member_name(&Member::Method((*overload).group)),
                            arg_count: argc as u32,
                        },
                    ));
                }
            }
            RefRule::Carries => {}
            RefRule::Forbids => {
                if popped.iter().any(|&r| r) {
                    return Err(self.error(
                        "A reference is not allowed on the stack at this instruction.",
                        MethodInitFailure::StackHasRefs { instr_index: index },
                    ));
                }
            }
        }

        // Pushed slots: a parsed ref producer pushes a reference; moves
        // and dup propagate the flag of the value they carry.
        let parsed = &self.instrs[index];
        let propagated = match &parsed.instr {
            Instr::Move { source, .. } | Instr::Dup { source, .. } => {
                if source.on_stack() {
                    popped.first().copied().unwrap_or(false)
                } else {
                    parsed.pushes_ref
                }
            }
            _ => parsed.pushes_ref,
        };

        refs.truncate(removed_base);
        if matches!(parsed.instr, Instr::Dup { .. }) {
            // Source value stays, copy inherits its flag.
            let flag = popped.first().copied().unwrap_or(false);
            refs.push(flag);
            if parsed.instr.stack_change().added == 2 {
                refs.push(flag);
            }
        } else {
            for _ in 0..parsed.instr.stack_change().added {
                refs.push(propagated);
            }
        }
        // Keep the tracked flags in step with the abstract height even
        // for the absorbed store/pop forms, whose stack change was
        // applied before they were marked for removal.
        let target_len = (height - sc.removed + sc.added) as usize;
        refs.resize(target_len, propagated);
        refs.truncate(target_len);

        Ok(())
    }

    /// Fuses a comparison followed by `brtrue`/`brfalse` into a single
    /// compare-and-branch instruction.
    unsafe fn try_fuse_comparison(
        &mut self,
        index: usize,
        prev: Option<usize>,
        condition: Condition,
        target: u32,
    ) {
        let negated = match condition {
            Condition::IfTrue => false,
            Condition::IfFalse => true,
            _ => return,
        };
        if self.instrs[index].has_incoming_branches {
            return;
        }
        let Some(p) = prev else { return };

        let comparison = match &self.instrs[p].instr {
            Instr::Equals {
                dest: Operand::Stack(_),
                ..
            } => Comparison::Eq,
            Instr::CompareOrdered {
                dest: Operand::Stack(_),
                comparison,
                ..
            } => *comparison,
            _ => return,
        };

        let args = match &self.instrs[p].instr {
            Instr::Equals { args, .. } | Instr::CompareOrdered { args, .. } => *args,
            _ => unreachable!(),
        };

        self.instrs[p].instr = Instr::BranchComparison {
            args,
            comparison,
            negated,
            target,
        };
        self.instrs[index].stack_height = REMOVED;
    }

    // === Step 4: compaction ===

    unsafe fn compact(&mut self) {
        let old_len = self.instrs.len();
        let mut new_indices = vec![0u32; old_len + 1];

        let mut new_index = 0u32;
        for (old_index, parsed) in self.instrs.iter().enumerate() {
            new_indices[old_index] = new_index;
            if parsed.stack_height >= 0 {
                new_index += 1;
            }
        }
        new_indices[old_len] = new_index;

        self.instrs.retain(|parsed| parsed.stack_height >= 0);

        for parsed in self.instrs.iter_mut() {
            if let Some(target) = parsed.instr.branch_target() {
                parsed.instr.set_branch_target(new_indices[target as usize]);
            } else if let Instr::Switch { targets, .. } = &mut parsed.instr {
                for target in targets.iter_mut() {
                    *target = new_indices[*target as usize];
                }
            }
        }

        let overload = self.overload;
        for try_block in (*overload).try_blocks.iter_mut() {
            try_block.try_start = new_indices[try_block.try_start] as usize;
            try_block.try_end = new_indices[try_block.try_end] as usize;
            match &mut try_block.handler {
                TryHandler::Catch(catches) => {
                    for catch in catches.iter_mut() {
                        catch.catch_start = new_indices[catch.catch_start] as usize;
                        catch.catch_end = new_indices[catch.catch_end] as usize;
                    }
                }
                TryHandler::Finally { start, end } => {
                    *start = new_indices[*start] as usize;
                    *end = new_indices[*end] as usize;
                }
            }
        }

        if let Some(symbols) = &mut (*overload).debug_symbols {
            for symbol in symbols.iter_mut() {
                symbol.start_instr = new_indices[symbol.start_instr.min(old_len)] as usize;
                symbol.end_instr = new_indices[symbol.end_instr.min(old_len)] as usize;
            }
        }
    }
}

/// Cursor over a raw method body.
struct BodyReader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.code.len()
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.code.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn i8(&mut self) -> Option<i8> {
        self.u8().map(|b| b as i8)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.code.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.code.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.code.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn i64(&mut self) -> Option<i64> {
        self.u64().map(|v| v as i64)
    }
}
