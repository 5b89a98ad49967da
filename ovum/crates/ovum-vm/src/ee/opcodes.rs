//! The on-disk opcode set.
//!
//! This single-byte opcode set is the contract with compiled modules; the
//! method initialiser rewrites it into the engine's internal instruction
//! stream. Several structural properties are load-bearing:
//!
//! - `LDARG_0..LDARG_3`, `LDLOC_0..LDLOC_3`, `STLOC_0..STLOC_3`,
//!   `LDC_I_M1..LDC_I_8` and `CALL_0..CALL_3` are contiguous runs;
//! - `BRREF`/`BRNREF` (and their short forms) are an even/odd pair;
//! - `ADD..CMP` is a contiguous block laid out in [`crate::types::Operator`]
//!   order, so `opcode - ADD` is the operator index.
//!
//! Operand layouts are noted next to each opcode: `ub` unsigned byte,
//! `sb` signed byte, `u2`/`u4`/`u8` little-endian unsigned, `i4`/`i8`
//! signed, `r8` an IEEE double, `tkn` a 32-bit token.

pub const NOP: u8 = 0x00;
pub const DUP: u8 = 0x01;
pub const POP: u8 = 0x02;

// Arguments
pub const LDARG_0: u8 = 0x03;
pub const LDARG_1: u8 = 0x04;
pub const LDARG_2: u8 = 0x05;
pub const LDARG_3: u8 = 0x06;
pub const LDARG_S: u8 = 0x07; // ub:n
pub const LDARG: u8 = 0x08; // u2:n
pub const STARG_S: u8 = 0x09; // ub:n
pub const STARG: u8 = 0x0A; // u2:n

// Locals
pub const LDLOC_0: u8 = 0x0B;
pub const LDLOC_1: u8 = 0x0C;
pub const LDLOC_2: u8 = 0x0D;
pub const LDLOC_3: u8 = 0x0E;
pub const STLOC_0: u8 = 0x0F;
pub const STLOC_1: u8 = 0x10;
pub const STLOC_2: u8 = 0x11;
pub const STLOC_3: u8 = 0x12;
pub const LDLOC_S: u8 = 0x13; // ub:n
pub const LDLOC: u8 = 0x14; // u2:n
pub const STLOC_S: u8 = 0x15; // ub:n
pub const STLOC: u8 = 0x16; // u2:n

// Constants
pub const LDNULL: u8 = 0x17;
pub const LDFALSE: u8 = 0x18;
pub const LDTRUE: u8 = 0x19;
pub const LDC_I_M1: u8 = 0x1A;
pub const LDC_I_0: u8 = 0x1B;
pub const LDC_I_1: u8 = 0x1C;
pub const LDC_I_2: u8 = 0x1D;
pub const LDC_I_3: u8 = 0x1E;
pub const LDC_I_4: u8 = 0x1F;
pub const LDC_I_5: u8 = 0x20;
pub const LDC_I_6: u8 = 0x21;
pub const LDC_I_7: u8 = 0x22;
pub const LDC_I_8: u8 = 0x23;
pub const LDC_I_S: u8 = 0x24; // sb:value
pub const LDC_I_M: u8 = 0x25; // i4:value
pub const LDC_I: u8 = 0x26; // i8:value
pub const LDC_U: u8 = 0x27; // u8:value
pub const LDC_R: u8 = 0x28; // r8:value
pub const LDSTR: u8 = 0x29; // tkn:str
pub const LDARGC: u8 = 0x2A;
pub const LDENUM_S: u8 = 0x2B; // tkn:type  i4:value
pub const LDENUM: u8 = 0x2C; // tkn:type  i8:value

// Construction
pub const NEWOBJ_S: u8 = 0x2D; // tkn:type  ub:argc
pub const NEWOBJ: u8 = 0x2E; // tkn:type  u2:argc

// Invocation
pub const CALL_0: u8 = 0x2F;
pub const CALL_1: u8 = 0x30;
pub const CALL_2: u8 = 0x31;
pub const CALL_3: u8 = 0x32;
pub const CALL_S: u8 = 0x33; // ub:argc
pub const CALL: u8 = 0x34; // u2:argc
pub const SCALL_S: u8 = 0x35; // tkn:func  ub:argc
pub const SCALL: u8 = 0x36; // tkn:func  u2:argc
pub const APPLY: u8 = 0x37;
pub const SAPPLY: u8 = 0x38; // tkn:func

// Control flow
pub const RETNULL: u8 = 0x39;
pub const RET: u8 = 0x3A;
pub const BR_S: u8 = 0x3B; // sb:trg
pub const BRNULL_S: u8 = 0x3C; // sb:trg
pub const BRINST_S: u8 = 0x3D; // sb:trg
pub const BRFALSE_S: u8 = 0x3E; // sb:trg
pub const BRTRUE_S: u8 = 0x3F; // sb:trg
pub const BRREF_S: u8 = 0x40; // sb:trg (even)
pub const BRNREF_S: u8 = 0x41; // sb:trg (odd)
pub const BRTYPE_S: u8 = 0x42; // tkn:type  sb:trg
pub const BR: u8 = 0x43; // i4:trg
pub const BRNULL: u8 = 0x44; // i4:trg
pub const BRINST: u8 = 0x45; // i4:trg
pub const BRFALSE: u8 = 0x46; // i4:trg
pub const BRTRUE: u8 = 0x47; // i4:trg
pub const BRREF: u8 = 0x48; // i4:trg (even)
pub const BRNREF: u8 = 0x49; // i4:trg (odd)
pub const BRTYPE: u8 = 0x4A; // tkn:type  i4:trg
pub const SWITCH_S: u8 = 0x4B; // u2:n  sb:targets...
pub const SWITCH: u8 = 0x4C; // u2:n  i4:targets...

// Operators (contiguous, in Operator order)
pub const ADD: u8 = 0x4D;
pub const SUB: u8 = 0x4E;
pub const OR: u8 = 0x4F;
pub const XOR: u8 = 0x50;
pub const MUL: u8 = 0x51;
pub const DIV: u8 = 0x52;
pub const MOD: u8 = 0x53;
pub const AND: u8 = 0x54;
pub const POW: u8 = 0x55;
pub const SHL: u8 = 0x56;
pub const SHR: u8 = 0x57;
pub const PLUS: u8 = 0x58;
pub const NEG: u8 = 0x59;
pub const NOT: u8 = 0x5A;
pub const EQ: u8 = 0x5B;
pub const CMP: u8 = 0x5C;

// Comparison shorthands and concatenation
pub const LT: u8 = 0x5D;
pub const GT: u8 = 0x5E;
pub const LTE: u8 = 0x5F;
pub const GTE: u8 = 0x60;
pub const CONCAT: u8 = 0x61;

// Containers
pub const LIST_0: u8 = 0x62;
pub const LIST_S: u8 = 0x63; // ub:count
pub const LIST: u8 = 0x64; // u4:count
pub const HASH_0: u8 = 0x65;
pub const HASH_S: u8 = 0x66; // ub:count
pub const HASH: u8 = 0x67; // u4:count

// Reflection
pub const LDITER: u8 = 0x68;
pub const LDTYPE: u8 = 0x69;

// Member access
pub const LDFLD: u8 = 0x6A; // tkn:fld
pub const STFLD: u8 = 0x6B; // tkn:fld
pub const LDSFLD: u8 = 0x6C; // tkn:fld
pub const STSFLD: u8 = 0x6D; // tkn:fld
pub const LDMEM: u8 = 0x6E; // tkn:name
pub const STMEM: u8 = 0x6F; // tkn:name

// Indexers
pub const LDIDX_1: u8 = 0x70;
pub const LDIDX_S: u8 = 0x71; // ub:argc
pub const LDIDX: u8 = 0x72; // u2:argc
pub const STIDX_1: u8 = 0x73;
pub const STIDX_S: u8 = 0x74; // ub:argc
pub const STIDX: u8 = 0x75; // u2:argc

// Function values
pub const LDSFN: u8 = 0x76; // tkn:func

// Type tokens
pub const LDTYPETKN: u8 = 0x77; // tkn:type

// Exception handling
pub const THROW: u8 = 0x78;
pub const RETHROW: u8 = 0x79;
pub const LEAVE_S: u8 = 0x7A; // sb:trg
pub const LEAVE: u8 = 0x7B; // i4:trg
pub const ENDFINALLY: u8 = 0x7C;

// Member call
pub const CALLMEM_S: u8 = 0x7D; // tkn:name  ub:argc
pub const CALLMEM: u8 = 0x7E; // tkn:name  u2:argc

// Reference primitives
pub const LDMEMREF: u8 = 0x7F; // tkn:name
pub const LDARGREF_S: u8 = 0x80; // ub:n
pub const LDARGREF: u8 = 0x81; // u2:n
pub const LDLOCREF_S: u8 = 0x82; // ub:n
pub const LDLOCREF: u8 = 0x83; // u2:n
pub const LDFLDREF: u8 = 0x84; // tkn:fld
pub const LDSFLDREF: u8 = 0x85; // tkn:fld
