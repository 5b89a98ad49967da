//! The engine's internal instruction set.
//!
//! The method initialiser decodes the on-disk opcode stream into a vector
//! of these instructions. Branch targets are instruction indices, tokens
//! are resolved pointers, and every operand that names a local, argument
//! or evaluation-stack slot is a signed frame-relative offset in `Value`
//! units, baked in once.
//!
//! Value-producing instructions carry a destination [`Operand`] in one of
//! two flavours: `Stack` pushes the result, `Local` writes it straight
//! into a slot without touching the stack height. Single-input
//! instructions carry the same duality on their source. The initialiser
//! decides the flavours during stack analysis.

use crate::strings::ManagedString;
use crate::types::member::Field;
use crate::types::method::{Method, MethodOverload, RefSignature};
use crate::types::{Operator, Type};

/// A frame-relative slot offset, in `Value` units. Arguments are
/// negative; locals and evaluation-stack slots positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub i32);

/// A resolved operand: a slot, plus whether moving a value through it
/// adjusts the evaluation-stack height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Local(Slot),
    Stack(Slot),
}

impl Operand {
    #[inline]
    pub fn slot(self) -> Slot {
        match self {
            Operand::Local(s) | Operand::Stack(s) => s,
        }
    }

    #[inline]
    pub fn on_stack(self) -> bool {
        matches!(self, Operand::Stack(_))
    }
}

/// The comparisons a fused compare-and-branch can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Gt,
    Lte,
    Gte,
}

/// Conditions of the simple conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    IfNull,
    NotNull,
    IfFalse,
    IfTrue,
}

/// One internal instruction. `args` fields are the resolved slot of the
/// first value of a stack-resident argument block.
pub enum Instr {
    Nop,
    Dup { source: Operand, dest: Operand },
    Pop,
    Ret,
    RetNull,

    Move { source: Operand, dest: Operand },
    /// Reads through the reference stored in `source`.
    MoveFromRef { source: Operand, dest: Operand },
    /// Writes through the reference stored in `dest`.
    MoveToRef { source: Operand, dest: Operand },

    LoadNull { dest: Operand },
    LoadBool { dest: Operand, value: bool },
    LoadInt { dest: Operand, value: i64 },
    LoadUInt { dest: Operand, value: u64 },
    LoadReal { dest: Operand, value: f64 },
    LoadString { dest: Operand, value: *mut ManagedString },
    LoadArgc { dest: Operand },
    LoadEnum { dest: Operand, enum_type: *mut Type, value: i64 },

    NewObject { args: Slot, dest: Operand, ctor_type: *mut Type, argc: u16 },
    CreateList { dest: Operand, capacity: u32 },
    CreateHash { dest: Operand, capacity: u32 },

    LoadField { source: Operand, dest: Operand, field: *mut Field, type_check: bool },
    LoadStaticField { dest: Operand, field: *mut Field },
    LoadMember { source: Operand, dest: Operand, name: *mut ManagedString },
    LoadIterator { source: Operand, dest: Operand },
    LoadTypeOf { source: Operand, dest: Operand },
    LoadIndexer { args: Slot, dest: Operand, argc: u16 },
    LoadStaticFunction { dest: Operand, method: *mut Method },
    LoadTypeToken { dest: Operand, target_type: *mut Type },

    Call { args: Slot, dest: Operand, argc: u16, ref_signature: RefSignature },
    StaticCall {
        args: Slot,
        dest: Operand,
        /// Argument count excluding the instance.
        argc: u16,
        /// Values consumed from the stack: argc plus the instance.
        stack_args: u16,
        overload: *mut MethodOverload,
    },
    CallMember {
        args: Slot,
        dest: Operand,
        name: *mut ManagedString,
        argc: u16,
        ref_signature: RefSignature,
    },
    Apply { args: Slot, dest: Operand },
    StaticApply { args: Slot, dest: Operand, method: *mut Method },

    InvokeOperator { args: Slot, dest: Operand, op: Operator },
    Equals { args: Slot, dest: Operand },
    Compare { args: Slot, dest: Operand },
    CompareOrdered { args: Slot, dest: Operand, comparison: Comparison },
    Concat { args: Slot, dest: Operand },

    Branch { target: u32 },
    Leave { target: u32 },
    ConditionalBranch { value: Operand, condition: Condition, target: u32 },
    BranchIfType { value: Operand, test_type: *mut Type, target: u32 },
    BranchIfRef { args: Slot, negated: bool, target: u32 },
    /// A fused comparison and conditional branch.
    BranchComparison { args: Slot, comparison: Comparison, negated: bool, target: u32 },
    Switch { value: Operand, targets: Box<[u32]> },

    StoreField { args: Slot, field: *mut Field },
    StoreStaticField { source: Operand, field: *mut Field },
    StoreMember { args: Slot, name: *mut ManagedString },
    StoreIndexer { args: Slot, argc: u16 },

    LoadLocalRef { local: Slot },
    LoadMemberRef { source: Operand, name: *mut ManagedString },
    LoadFieldRef { source: Operand, field: *mut Field },
    LoadStaticFieldRef { field: *mut Field },

    Throw,
    Rethrow,
    EndFinally,
}

/// How an instruction changes the evaluation stack, assuming all of its
/// inputs are on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackChange {
    pub removed: u32,
    pub added: u32,
}

impl StackChange {
    pub const EMPTY: StackChange = StackChange {
        removed: 0,
        added: 0,
    };

    pub const fn new(removed: u32, added: u32) -> StackChange {
        StackChange { removed, added }
    }
}

impl Instr {
    /// The stack change implied by the current operand flavours: a
    /// `Stack` input is popped, a `Stack` output pushed, a `Local` on
    /// either side leaves the height alone. Argument blocks are always
    /// stack-resident.
    pub fn stack_change(&self) -> StackChange {
        use Instr::*;

        #[inline]
        fn pop(op: &Operand) -> u32 {
            op.on_stack() as u32
        }
        #[inline]
        fn push(op: &Operand) -> u32 {
            op.on_stack() as u32
        }

        match self {
            Nop => StackChange::EMPTY,
            Dup { source, dest } => StackChange::new(pop(source), pop(source) + push(dest)),
            Pop | Ret | Throw => StackChange::new(1, 0),
            RetNull | Rethrow | EndFinally => StackChange::EMPTY,

            Move { source, dest }
            | MoveFromRef { source, dest }
            | MoveToRef { source, dest } => StackChange::new(pop(source), push(dest)),

            LoadNull { dest }
            | LoadBool { dest, .. }
            | LoadInt { dest, .. }
            | LoadUInt { dest, .. }
            | LoadReal { dest, .. }
            | LoadString { dest, .. }
            | LoadArgc { dest }
            | LoadEnum { dest, .. }
            | CreateList { dest, .. }
            | CreateHash { dest, .. }
            | LoadStaticField { dest, .. }
            | LoadStaticFunction { dest, .. }
            | LoadTypeToken { dest, .. } => StackChange::new(0, push(dest)),

            LoadLocalRef { .. } | LoadStaticFieldRef { .. } => StackChange::new(0, 1),

            NewObject { argc, dest, .. } => StackChange::new(*argc as u32, push(dest)),

            LoadField { source, dest, .. }
            | LoadMember { source, dest, .. }
            | LoadIterator { source, dest }
            | LoadTypeOf { source, dest } => StackChange::new(pop(source), push(dest)),

            LoadMemberRef { source, .. } | LoadFieldRef { source, .. } => {
                StackChange::new(pop(source), 1)
            }

            LoadIndexer { argc, dest, .. } => StackChange::new(*argc as u32 + 1, push(dest)),

            Call { argc, dest, .. } => StackChange::new(*argc as u32 + 1, push(dest)),
            StaticCall {
                stack_args, dest, ..
            } => StackChange::new(*stack_args as u32, push(dest)),
            CallMember { argc, dest, .. } => StackChange::new(*argc as u32 + 1, push(dest)),
            Apply { dest, .. } => StackChange::new(2, push(dest)),
            StaticApply { dest, .. } => StackChange::new(1, push(dest)),

            InvokeOperator { op, dest, .. } => StackChange::new(op.arity(), push(dest)),
            Equals { dest, .. }
            | Compare { dest, .. }
            | CompareOrdered { dest, .. }
            | Concat { dest, .. } => StackChange::new(2, push(dest)),

            Branch { .. } | Leave { .. } => StackChange::EMPTY,
            ConditionalBranch { value, .. } | BranchIfType { value, .. } => {
                StackChange::new(pop(value), 0)
            }
            BranchIfRef { .. } | BranchComparison { .. } => StackChange::new(2, 0),
            Switch { value, .. } => StackChange::new(pop(value), 0),

            StoreField { .. } | StoreMember { .. } => StackChange::new(2, 0),
            StoreStaticField { source, .. } => StackChange::new(pop(source), 0),
            StoreIndexer { argc, .. } => StackChange::new(*argc as u32 + 2, 0),
        }
    }

    /// Whether the instruction has a single-value input operand.
    pub fn has_input(&self) -> bool {
        self.input().is_some()
    }

    pub fn input(&self) -> Option<Operand> {
        use Instr::*;
        match self {
            Dup { source, .. }
            | Move { source, .. }
            | MoveFromRef { source, .. }
            | MoveToRef { source, .. }
            | LoadField { source, .. }
            | LoadMember { source, .. }
            | LoadIterator { source, .. }
            | LoadTypeOf { source, .. }
            | LoadMemberRef { source, .. }
            | LoadFieldRef { source, .. }
            | StoreStaticField { source, .. } => Some(*source),
            ConditionalBranch { value, .. }
            | BranchIfType { value, .. }
            | Switch { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Replaces the single-value input operand.
    pub fn set_input(&mut self, operand: Operand) {
        use Instr::*;
        match self {
            Dup { source, .. }
            | Move { source, .. }
            | MoveFromRef { source, .. }
            | MoveToRef { source, .. }
            | LoadField { source, .. }
            | LoadMember { source, .. }
            | LoadIterator { source, .. }
            | LoadTypeOf { source, .. }
            | LoadMemberRef { source, .. }
            | LoadFieldRef { source, .. }
            | StoreStaticField { source, .. } => *source = operand,
            ConditionalBranch { value, .. }
            | BranchIfType { value, .. }
            | Switch { value, .. } => *value = operand,
            _ => unreachable!("instruction has no input operand"),
        }
    }

    /// Whether the input must live on the evaluation stack. Only the
    /// simple conditional branches, switch and static-field stores may
    /// take their input straight from a local.
    pub fn requires_stack_input(&self) -> bool {
        !matches!(
            self,
            Instr::ConditionalBranch { .. }
                | Instr::BranchIfType { .. }
                | Instr::Switch { .. }
                | Instr::StoreStaticField { .. }
        )
    }

    pub fn has_output(&self) -> bool {
        self.output().is_some()
    }

    pub fn output(&self) -> Option<Operand> {
        use Instr::*;
        match self {
            Dup { dest, .. }
            | Move { dest, .. }
            | MoveFromRef { dest, .. }
            | MoveToRef { dest, .. }
            | LoadNull { dest }
            | LoadBool { dest, .. }
            | LoadInt { dest, .. }
            | LoadUInt { dest, .. }
            | LoadReal { dest, .. }
            | LoadString { dest, .. }
            | LoadArgc { dest }
            | LoadEnum { dest, .. }
            | NewObject { dest, .. }
            | CreateList { dest, .. }
            | CreateHash { dest, .. }
            | LoadField { dest, .. }
            | LoadStaticField { dest, .. }
            | LoadMember { dest, .. }
            | LoadIterator { dest, .. }
            | LoadTypeOf { dest, .. }
            | LoadIndexer { dest, .. }
            | LoadStaticFunction { dest, .. }
            | LoadTypeToken { dest, .. }
            | Call { dest, .. }
            | StaticCall { dest, .. }
            | CallMember { dest, .. }
            | Apply { dest, .. }
            | StaticApply { dest, .. }
            | InvokeOperator { dest, .. }
            | Equals { dest, .. }
            | Compare { dest, .. }
            | CompareOrdered { dest, .. }
            | Concat { dest, .. } => Some(*dest),
            _ => None,
        }
    }

    /// Replaces the output operand. A `Local` flavour makes the
    /// instruction write without pushing.
    pub fn set_output(&mut self, operand: Operand) {
        use Instr::*;
        match self {
            Dup { dest, .. }
            | Move { dest, .. }
            | MoveFromRef { dest, .. }
            | MoveToRef { dest, .. }
            | LoadNull { dest }
            | LoadBool { dest, .. }
            | LoadInt { dest, .. }
            | LoadUInt { dest, .. }
            | LoadReal { dest, .. }
            | LoadString { dest, .. }
            | LoadArgc { dest }
            | LoadEnum { dest, .. }
            | NewObject { dest, .. }
            | CreateList { dest, .. }
            | CreateHash { dest, .. }
            | LoadField { dest, .. }
            | LoadStaticField { dest, .. }
            | LoadMember { dest, .. }
            | LoadIterator { dest, .. }
            | LoadTypeOf { dest, .. }
            | LoadIndexer { dest, .. }
            | LoadStaticFunction { dest, .. }
            | LoadTypeToken { dest, .. }
            | Call { dest, .. }
            | StaticCall { dest, .. }
            | CallMember { dest, .. }
            | Apply { dest, .. }
            | StaticApply { dest, .. }
            | InvokeOperator { dest, .. }
            | Equals { dest, .. }
            | Compare { dest, .. }
            | CompareOrdered { dest, .. }
            | Concat { dest, .. } => *dest = operand,
            _ => unreachable!("instruction has no output operand"),
        }
    }

    /// Replaces the argument-block slot of a multi-input instruction.
    pub fn set_args(&mut self, slot: Slot) {
        use Instr::*;
        match self {
            NewObject { args, .. }
            | LoadIndexer { args, .. }
            | Call { args, .. }
            | StaticCall { args, .. }
            | CallMember { args, .. }
            | Apply { args, .. }
            | StaticApply { args, .. }
            | InvokeOperator { args, .. }
            | Equals { args, .. }
            | Compare { args, .. }
            | CompareOrdered { args, .. }
            | Concat { args, .. }
            | BranchIfRef { args, .. }
            | BranchComparison { args, .. }
            | StoreField { args, .. }
            | StoreMember { args, .. }
            | StoreIndexer { args, .. } => *args = slot,
            _ => {}
        }
    }

    /// The branch target, for single-target branches.
    pub fn branch_target(&self) -> Option<u32> {
        use Instr::*;
        match self {
            Branch { target }
            | Leave { target }
            | ConditionalBranch { target, .. }
            | BranchIfType { target, .. }
            | BranchIfRef { target, .. }
            | BranchComparison { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn set_branch_target(&mut self, new_target: u32) {
        use Instr::*;
        match self {
            Branch { target }
            | Leave { target }
            | ConditionalBranch { target, .. }
            | BranchIfType { target, .. }
            | BranchIfRef { target, .. }
            | BranchComparison { target, .. } => *target = new_target,
            _ => {}
        }
    }

    /// Whether the instruction is an unconditional transfer (plain branch
    /// or leave).
    pub fn is_unconditional_branch(&self) -> bool {
        matches!(self, Instr::Branch { .. } | Instr::Leave { .. })
    }

    pub fn is_switch(&self) -> bool {
        matches!(self, Instr::Switch { .. })
    }

    /// Whether no control flow continues past this instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instr::Ret | Instr::RetNull | Instr::Throw | Instr::Rethrow | Instr::EndFinally
        )
    }
}
