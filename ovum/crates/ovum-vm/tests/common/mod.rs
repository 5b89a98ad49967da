//! Shared test harness: a module-file writer, a bytecode assembler, and a
//! minimal `aves` standard library (managed definitions plus the native
//! entry points the VM requires).
//!
//! The integration tests drive the on-disk module format and observe
//! behaviour through the public VM surface, never through the internal
//! instruction stream.

#![allow(dead_code)]

use std::path::Path;

use ovum_vm::ee::thread::Thread;
use ovum_vm::error::{OpResult, Trap};
use ovum_vm::gc::object::GcObject;
use ovum_vm::module::token::kind;
use ovum_vm::strings::{string_compare, string_equals};
use ovum_vm::types::{NativeFieldKind, Type};
use ovum_vm::value::{HashEntry, HashInst, ListInst, Value};
use ovum_vm::vm::{NativeLibrary, Vm, VmStartParams};
use ovum_vm::GcConfig;

// === Binary module writer ===

pub struct FieldDef {
    pub flags: i32,
    pub name: u32,
}

pub enum BodyDef {
    Bytecode(Vec<u8>),
    Native(&'static str),
    None,
}

pub enum TryDef {
    Catch {
        start: u32,
        end: u32,
        /// (caught type token, handler start, handler end)
        catches: Vec<(u32, u32, u32)>,
    },
    Finally {
        start: u32,
        end: u32,
        hstart: u32,
        hend: u32,
    },
    Fault {
        start: u32,
        end: u32,
        hstart: u32,
        hend: u32,
    },
}

pub struct OverloadDef {
    pub flags: u32,
    /// (name token, param flags); flag bit 0 marks a by-ref parameter.
    pub params: Vec<(u32, u32)>,
    pub optional: u16,
    pub locals: u16,
    pub max_stack: u16,
    pub tries: Vec<TryDef>,
    pub body: BodyDef,
}

impl OverloadDef {
    /// A bytecode overload with a full header.
    pub fn bytecode(params: Vec<(u32, u32)>, locals: u16, max_stack: u16, code: Vec<u8>) -> Self {
        OverloadDef {
            flags: 0,
            params,
            optional: 0,
            locals,
            max_stack,
            tries: Vec::new(),
            body: BodyDef::Bytecode(code),
        }
    }

    pub fn native(params: Vec<(u32, u32)>, entry_point: &'static str) -> Self {
        OverloadDef {
            flags: OV_NATIVE,
            params,
            optional: 0,
            locals: 0,
            max_stack: 8,
            tries: Vec::new(),
            body: BodyDef::Native(entry_point),
        }
    }
}

pub struct MethodDef {
    pub flags: u32,
    pub name: u32,
    pub overloads: Vec<OverloadDef>,
}

pub struct PropertyDef {
    pub name: u32,
    /// Local indices into the type's method list.
    pub getter: Option<u32>,
    pub setter: Option<u32>,
}

pub struct TypeDef {
    pub flags: u32,
    pub name: u32,
    pub base: u32,
    pub shared: u32,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub properties: Vec<PropertyDef>,
    /// (operator index, local method index)
    pub operators: Vec<(u8, u32)>,
    pub initer: Option<&'static str>,
}

impl TypeDef {
    pub fn new(flags: u32, name: u32, base: u32) -> Self {
        TypeDef {
            flags,
            name,
            base,
            shared: 0,
            fields: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
            operators: Vec::new(),
            initer: None,
        }
    }
}

pub struct ConstantDef {
    pub flags: u32,
    pub name: u32,
    pub type_token: u32,
    pub value: i64,
}

// File-format flag constants, mirrored from the loader.
pub const FIELD_PUBLIC: i32 = 0x01;
pub const FIELD_PRIVATE: i32 = 0x02;
pub const FIELD_PROTECTED: i32 = 0x04;
pub const FIELD_INSTANCE: i32 = 0x08;
pub const FIELD_HAS_VALUE: i32 = 0x10;

pub const FM_PUBLIC: u32 = 0x01;
pub const FM_PRIVATE: u32 = 0x02;
pub const FM_PROTECTED: u32 = 0x04;
pub const FM_INSTANCE: u32 = 0x08;
pub const FM_CTOR: u32 = 0x10;
pub const FM_IMPL: u32 = 0x20;

pub const OV_VAR_END: u32 = 0x01;
pub const OV_VAR_START: u32 = 0x02;
pub const OV_NATIVE: u32 = 0x04;
pub const OV_SHORT_HEADER: u32 = 0x08;
pub const OV_VIRTUAL: u32 = 0x10;
pub const OV_ABSTRACT: u32 = 0x20;

pub const TYPE_PUBLIC: u32 = 0x01;
pub const TYPE_ABSTRACT: u32 = 0x100;
pub const TYPE_SEALED: u32 = 0x200;
pub const TYPE_PRIMITIVE: u32 = 0x2000;

/// Builds a module file image. Tokens are assigned by order of addition:
/// the n-th string has token `STRING | n+1`, and so on, matching what the
/// loader verifies.
pub struct ModuleWriter {
    pub name: String,
    pub version: [i32; 4],
    pub native_lib: Option<String>,
    strings: Vec<String>,
    module_refs: Vec<(u32, [i32; 4])>,
    type_refs: Vec<(u32, u32)>,
    function_refs: Vec<(u32, u32)>,
    field_refs: Vec<(u32, u32)>,
    method_refs: Vec<(u32, u32)>,
    pub types: Vec<TypeDef>,
    pub functions: Vec<MethodDef>,
    pub constants: Vec<ConstantDef>,
    pub main: u32,
}

impl ModuleWriter {
    pub fn new(name: &str) -> Self {
        ModuleWriter {
            name: name.to_string(),
            version: [1, 0, 0, 0],
            native_lib: None,
            strings: Vec::new(),
            module_refs: Vec::new(),
            type_refs: Vec::new(),
            function_refs: Vec::new(),
            field_refs: Vec::new(),
            method_refs: Vec::new(),
            types: Vec::new(),
            functions: Vec::new(),
            constants: Vec::new(),
            main: 0,
        }
    }

    /// Interns a string into the module's string table; returns its token.
    pub fn string(&mut self, value: &str) -> u32 {
        if let Some(index) = self.strings.iter().position(|s| s == value) {
            return kind::STRING | (index as u32 + 1);
        }
        self.strings.push(value.to_string());
        kind::STRING | (self.strings.len() as u32)
    }

    pub fn add_module_ref(&mut self, name: u32, min_version: [i32; 4]) -> u32 {
        self.module_refs.push((name, min_version));
        kind::MODULE_REF | (self.module_refs.len() as u32)
    }

    pub fn add_type_ref(&mut self, name: u32, module_ref: u32) -> u32 {
        self.type_refs.push((name, module_ref));
        kind::TYPE_REF | (self.type_refs.len() as u32)
    }

    pub fn add_field_ref(&mut self, name: u32, type_ref: u32) -> u32 {
        self.field_refs.push((name, type_ref));
        kind::FIELD_REF | (self.field_refs.len() as u32)
    }

    pub fn add_method_ref(&mut self, name: u32, type_ref: u32) -> u32 {
        self.method_refs.push((name, type_ref));
        kind::METHOD_REF | (self.method_refs.len() as u32)
    }

    pub fn add_type(&mut self, type_def: TypeDef) -> u32 {
        self.types.push(type_def);
        kind::TYPE_DEF | (self.types.len() as u32)
    }

    pub fn add_function(&mut self, function: MethodDef) -> u32 {
        self.functions.push(function);
        kind::FUNCTION_DEF | (self.functions.len() as u32)
    }

    /// The FieldDef token the n-th field added across all types (0-based)
    /// will receive.
    pub fn field_token(index: u32) -> u32 {
        kind::FIELD_DEF | (index + 1)
    }

    /// The MethodDef token the n-th class method added across all types
    /// (0-based) will receive.
    pub fn method_token(index: u32) -> u32 {
        kind::METHOD_DEF | (index + 1)
    }

    pub fn write(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::new();
        let mut method_block: Vec<u8> = Vec::new();

        buf.extend_from_slice(b"OVMM");
        buf.resize(16, 0);

        write_string(&mut buf, &self.name);
        for part in self.version {
            buf.extend_from_slice(&part.to_le_bytes());
        }

        // Empty string map.
        buf.extend_from_slice(&0u32.to_le_bytes());

        match &self.native_lib {
            Some(name) => write_string(&mut buf, name),
            None => buf.extend_from_slice(&0i32.to_le_bytes()),
        }

        let total_fields: usize = self.types.iter().map(|t| t.fields.len()).sum();
        let total_methods: usize = self.types.iter().map(|t| t.methods.len()).sum();
        buf.extend_from_slice(&(self.types.len() as i32).to_le_bytes());
        buf.extend_from_slice(&(self.functions.len() as i32).to_le_bytes());
        buf.extend_from_slice(&(self.constants.len() as i32).to_le_bytes());
        buf.extend_from_slice(&(total_fields as i32).to_le_bytes());
        buf.extend_from_slice(&(total_methods as i32).to_le_bytes());

        let method_start_pos = buf.len();
        buf.extend_from_slice(&0u32.to_le_bytes()); // patched below

        // String table.
        frame(&mut buf, |buf| {
            buf.extend_from_slice(&(self.strings.len() as i32).to_le_bytes());
            for (i, s) in self.strings.iter().enumerate() {
                buf.extend_from_slice(&(kind::STRING | (i as u32 + 1)).to_le_bytes());
                write_string(buf, s);
            }
        });

        // Module refs.
        frame(&mut buf, |buf| {
            buf.extend_from_slice(&(self.module_refs.len() as i32).to_le_bytes());
            for (i, (name, version)) in self.module_refs.iter().enumerate() {
                buf.extend_from_slice(&(kind::MODULE_REF | (i as u32 + 1)).to_le_bytes());
                buf.extend_from_slice(&name.to_le_bytes());
                for part in version {
                    buf.extend_from_slice(&part.to_le_bytes());
                }
            }
        });

        // Type refs, function refs, field refs, method refs.
        for (table, table_kind) in [
            (&self.type_refs, kind::TYPE_REF),
            (&self.function_refs, kind::FUNCTION_REF),
            (&self.field_refs, kind::FIELD_REF),
            (&self.method_refs, kind::METHOD_REF),
        ] {
            frame(&mut buf, |buf| {
                buf.extend_from_slice(&(table.len() as i32).to_le_bytes());
                for (i, (name, owner)) in table.iter().enumerate() {
                    buf.extend_from_slice(&(table_kind | (i as u32 + 1)).to_le_bytes());
                    buf.extend_from_slice(&name.to_le_bytes());
                    buf.extend_from_slice(&owner.to_le_bytes());
                }
            });
        }

        // Type definitions.
        let mut next_field = 0u32;
        let mut next_method = 0u32;
        frame(&mut buf, |buf| {
            buf.extend_from_slice(&(self.types.len() as i32).to_le_bytes());
            for (i, ty) in self.types.iter().enumerate() {
                buf.extend_from_slice(&(kind::TYPE_DEF | (i as u32 + 1)).to_le_bytes());
                buf.extend_from_slice(&ty.flags.to_le_bytes());
                buf.extend_from_slice(&ty.name.to_le_bytes());
                buf.extend_from_slice(&ty.base.to_le_bytes());
                buf.extend_from_slice(&ty.shared.to_le_bytes());
                let member_count =
                    (ty.fields.len() + ty.methods.len() + ty.properties.len()) as i32;
                buf.extend_from_slice(&member_count.to_le_bytes());

                // Fields.
                frame(buf, |buf| {
                    buf.extend_from_slice(&(ty.fields.len() as i32).to_le_bytes());
                    for field in &ty.fields {
                        next_field += 1;
                        buf.extend_from_slice(&(kind::FIELD_DEF | next_field).to_le_bytes());
                        buf.extend_from_slice(&field.flags.to_le_bytes());
                        buf.extend_from_slice(&field.name.to_le_bytes());
                    }
                });

                // Methods.
                let method_base = next_method;
                frame(buf, |buf| {
                    buf.extend_from_slice(&(ty.methods.len() as i32).to_le_bytes());
                    for method in &ty.methods {
                        next_method += 1;
                        buf.extend_from_slice(&(kind::METHOD_DEF | next_method).to_le_bytes());
                        write_method(buf, method, &mut method_block);
                    }
                });

                // Properties.
                frame(buf, |buf| {
                    buf.extend_from_slice(&(ty.properties.len() as i32).to_le_bytes());
                    for prop in &ty.properties {
                        buf.extend_from_slice(&prop.name.to_le_bytes());
                        let getter = prop
                            .getter
                            .map(|g| kind::METHOD_DEF | (method_base + g + 1))
                            .unwrap_or(0);
                        let setter = prop
                            .setter
                            .map(|s| kind::METHOD_DEF | (method_base + s + 1))
                            .unwrap_or(0);
                        buf.extend_from_slice(&getter.to_le_bytes());
                        buf.extend_from_slice(&setter.to_le_bytes());
                    }
                });

                // Operators.
                frame(buf, |buf| {
                    buf.extend_from_slice(&(ty.operators.len() as i32).to_le_bytes());
                    for (op, local_method) in &ty.operators {
                        buf.push(*op);
                        let token = kind::METHOD_DEF | (method_base + local_method + 1);
                        buf.extend_from_slice(&token.to_le_bytes());
                    }
                });

                // Native type initialiser.
                match ty.initer {
                    Some(name) => write_cstring(buf, name),
                    None => buf.extend_from_slice(&0i32.to_le_bytes()),
                }
            }
        });

        // Global functions.
        frame(&mut buf, |buf| {
            buf.extend_from_slice(&(self.functions.len() as i32).to_le_bytes());
            for (i, function) in self.functions.iter().enumerate() {
                buf.extend_from_slice(&(kind::FUNCTION_DEF | (i as u32 + 1)).to_le_bytes());
                write_method(buf, function, &mut method_block);
            }
        });

        // Global constants.
        frame(&mut buf, |buf| {
            buf.extend_from_slice(&(self.constants.len() as i32).to_le_bytes());
            for (i, constant) in self.constants.iter().enumerate() {
                buf.extend_from_slice(&(kind::CONSTANT_DEF | (i as u32 + 1)).to_le_bytes());
                buf.extend_from_slice(&constant.flags.to_le_bytes());
                buf.extend_from_slice(&constant.name.to_le_bytes());
                buf.extend_from_slice(&constant.type_token.to_le_bytes());
                buf.extend_from_slice(&constant.value.to_le_bytes());
            }
        });

        buf.extend_from_slice(&self.main.to_le_bytes());

        // The method block lands at the end; the meta field records the
        // position of its size prefix.
        let method_start = buf.len() as u32;
        buf[method_start_pos..method_start_pos + 4].copy_from_slice(&method_start.to_le_bytes());
        buf.extend_from_slice(&(method_block.len() as u32).to_le_bytes());
        buf.extend_from_slice(&method_block);

        buf
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    buf.extend_from_slice(&(units.len() as i32).to_le_bytes());
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

fn write_cstring(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as i32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// Writes a framed collection: a u32 byte-size prefix patched after the
/// content is known.
fn frame(buf: &mut Vec<u8>, content: impl FnOnce(&mut Vec<u8>)) {
    let size_pos = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    content(buf);
    let size = (buf.len() - size_pos - 4) as u32;
    buf[size_pos..size_pos + 4].copy_from_slice(&size.to_le_bytes());
}

fn write_method(buf: &mut Vec<u8>, method: &MethodDef, method_block: &mut Vec<u8>) {
    buf.extend_from_slice(&method.flags.to_le_bytes());
    buf.extend_from_slice(&method.name.to_le_bytes());
    frame(buf, |buf| {
        buf.extend_from_slice(&(method.overloads.len() as i32).to_le_bytes());
        for overload in &method.overloads {
            let mut flags = overload.flags;
            if matches!(overload.body, BodyDef::Native(_)) {
                flags |= OV_NATIVE;
            }
            if matches!(overload.body, BodyDef::None) {
                flags |= OV_ABSTRACT;
            }
            buf.extend_from_slice(&flags.to_le_bytes());

            buf.extend_from_slice(&(overload.params.len() as u16).to_le_bytes());
            for (name, param_flags) in &overload.params {
                buf.extend_from_slice(&name.to_le_bytes());
                buf.extend_from_slice(&param_flags.to_le_bytes());
            }

            if flags & OV_SHORT_HEADER == 0 {
                buf.extend_from_slice(&overload.optional.to_le_bytes());
                buf.extend_from_slice(&overload.locals.to_le_bytes());
                buf.extend_from_slice(&overload.max_stack.to_le_bytes());
                frame(buf, |buf| {
                    buf.extend_from_slice(&(overload.tries.len() as i32).to_le_bytes());
                    for try_def in &overload.tries {
                        match try_def {
                            TryDef::Catch {
                                start,
                                end,
                                catches,
                            } => {
                                buf.push(0x01);
                                buf.extend_from_slice(&start.to_le_bytes());
                                buf.extend_from_slice(&end.to_le_bytes());
                                frame(buf, |buf| {
                                    buf.extend_from_slice(
                                        &(catches.len() as i32).to_le_bytes(),
                                    );
                                    for (token, cstart, cend) in catches {
                                        buf.extend_from_slice(&token.to_le_bytes());
                                        buf.extend_from_slice(&cstart.to_le_bytes());
                                        buf.extend_from_slice(&cend.to_le_bytes());
                                    }
                                });
                            }
                            TryDef::Finally {
                                start,
                                end,
                                hstart,
                                hend,
                            } => {
                                buf.push(0x02);
                                buf.extend_from_slice(&start.to_le_bytes());
                                buf.extend_from_slice(&end.to_le_bytes());
                                buf.extend_from_slice(&hstart.to_le_bytes());
                                buf.extend_from_slice(&hend.to_le_bytes());
                            }
                            TryDef::Fault {
                                start,
                                end,
                                hstart,
                                hend,
                            } => {
                                buf.push(0x03);
                                buf.extend_from_slice(&start.to_le_bytes());
                                buf.extend_from_slice(&end.to_le_bytes());
                                buf.extend_from_slice(&hstart.to_le_bytes());
                                buf.extend_from_slice(&hend.to_le_bytes());
                            }
                        }
                    }
                });
            }

            match &overload.body {
                BodyDef::Bytecode(code) => {
                    let offset = method_block.len() as u32;
                    method_block.extend_from_slice(code);
                    buf.extend_from_slice(&offset.to_le_bytes());
                    buf.extend_from_slice(&(code.len() as u32).to_le_bytes());
                }
                BodyDef::Native(entry_point) => {
                    write_cstring(buf, entry_point);
                }
                BodyDef::None => {}
            }
        }
    });
}

// === Bytecode assembler ===

/// Emits on-disk bytecode, long operand forms throughout so that byte
/// offsets stay easy to compute in tests.
pub struct Asm {
    buf: Vec<u8>,
}

use ovum_vm::ee::opcodes as opc;

impl Asm {
    pub fn new() -> Self {
        Asm { buf: Vec::new() }
    }

    pub fn pos(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn op(&mut self, opcode: u8) -> &mut Self {
        self.buf.push(opcode);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.op(opc::NOP)
    }
    pub fn dup(&mut self) -> &mut Self {
        self.op(opc::DUP)
    }
    pub fn pop(&mut self) -> &mut Self {
        self.op(opc::POP)
    }
    pub fn ldarg(&mut self, n: u16) -> &mut Self {
        self.op(opc::LDARG).u16(n)
    }
    pub fn starg(&mut self, n: u16) -> &mut Self {
        self.op(opc::STARG).u16(n)
    }
    pub fn ldloc(&mut self, n: u16) -> &mut Self {
        self.op(opc::LDLOC).u16(n)
    }
    pub fn stloc(&mut self, n: u16) -> &mut Self {
        self.op(opc::STLOC).u16(n)
    }
    pub fn ldnull(&mut self) -> &mut Self {
        self.op(opc::LDNULL)
    }
    pub fn ldfalse(&mut self) -> &mut Self {
        self.op(opc::LDFALSE)
    }
    pub fn ldtrue(&mut self) -> &mut Self {
        self.op(opc::LDTRUE)
    }
    pub fn ldc_i(&mut self, v: i64) -> &mut Self {
        self.op(opc::LDC_I).i64(v)
    }
    pub fn ldc_u(&mut self, v: u64) -> &mut Self {
        self.op(opc::LDC_U);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }
    pub fn ldc_r(&mut self, v: f64) -> &mut Self {
        self.op(opc::LDC_R);
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
        self
    }
    pub fn ldstr(&mut self, token: u32) -> &mut Self {
        self.op(opc::LDSTR).u32(token)
    }
    pub fn ldargc(&mut self) -> &mut Self {
        self.op(opc::LDARGC)
    }
    pub fn newobj(&mut self, type_token: u32, argc: u16) -> &mut Self {
        self.op(opc::NEWOBJ).u32(type_token).u16(argc)
    }
    pub fn call(&mut self, argc: u16) -> &mut Self {
        self.op(opc::CALL).u16(argc)
    }
    pub fn scall(&mut self, token: u32, argc: u16) -> &mut Self {
        self.op(opc::SCALL).u32(token).u16(argc)
    }
    pub fn apply(&mut self) -> &mut Self {
        self.op(opc::APPLY)
    }
    pub fn sapply(&mut self, token: u32) -> &mut Self {
        self.op(opc::SAPPLY).u32(token)
    }
    pub fn ret(&mut self) -> &mut Self {
        self.op(opc::RET)
    }
    pub fn retnull(&mut self) -> &mut Self {
        self.op(opc::RETNULL)
    }
    pub fn br(&mut self, rel: i32) -> &mut Self {
        self.op(opc::BR).i32(rel)
    }
    pub fn brfalse(&mut self, rel: i32) -> &mut Self {
        self.op(opc::BRFALSE).i32(rel)
    }
    pub fn brtrue(&mut self, rel: i32) -> &mut Self {
        self.op(opc::BRTRUE).i32(rel)
    }
    pub fn brnull(&mut self, rel: i32) -> &mut Self {
        self.op(opc::BRNULL).i32(rel)
    }
    pub fn brinst(&mut self, rel: i32) -> &mut Self {
        self.op(opc::BRINST).i32(rel)
    }
    pub fn brref(&mut self, rel: i32) -> &mut Self {
        self.op(opc::BRREF).i32(rel)
    }
    pub fn brnref(&mut self, rel: i32) -> &mut Self {
        self.op(opc::BRNREF).i32(rel)
    }
    pub fn switch(&mut self, targets: &[i32]) -> &mut Self {
        self.op(opc::SWITCH).u16(targets.len() as u16);
        for &t in targets {
            self.i32(t);
        }
        self
    }
    pub fn add(&mut self) -> &mut Self {
        self.op(opc::ADD)
    }
    pub fn sub(&mut self) -> &mut Self {
        self.op(opc::SUB)
    }
    pub fn mul(&mut self) -> &mut Self {
        self.op(opc::MUL)
    }
    pub fn div(&mut self) -> &mut Self {
        self.op(opc::DIV)
    }
    pub fn neg(&mut self) -> &mut Self {
        self.op(opc::NEG)
    }
    pub fn eq(&mut self) -> &mut Self {
        self.op(opc::EQ)
    }
    pub fn cmp(&mut self) -> &mut Self {
        self.op(opc::CMP)
    }
    pub fn lt(&mut self) -> &mut Self {
        self.op(opc::LT)
    }
    pub fn gt(&mut self) -> &mut Self {
        self.op(opc::GT)
    }
    pub fn concat(&mut self) -> &mut Self {
        self.op(opc::CONCAT)
    }
    pub fn list(&mut self, count: u32) -> &mut Self {
        self.op(opc::LIST).u32(count)
    }
    pub fn hash(&mut self, count: u32) -> &mut Self {
        self.op(opc::HASH).u32(count)
    }
    pub fn ldfld(&mut self, token: u32) -> &mut Self {
        self.op(opc::LDFLD).u32(token)
    }
    pub fn stfld(&mut self, token: u32) -> &mut Self {
        self.op(opc::STFLD).u32(token)
    }
    pub fn ldsfld(&mut self, token: u32) -> &mut Self {
        self.op(opc::LDSFLD).u32(token)
    }
    pub fn stsfld(&mut self, token: u32) -> &mut Self {
        self.op(opc::STSFLD).u32(token)
    }
    pub fn ldmem(&mut self, token: u32) -> &mut Self {
        self.op(opc::LDMEM).u32(token)
    }
    pub fn stmem(&mut self, token: u32) -> &mut Self {
        self.op(opc::STMEM).u32(token)
    }
    pub fn ldidx(&mut self, argc: u16) -> &mut Self {
        self.op(opc::LDIDX).u16(argc)
    }
    pub fn stidx(&mut self, argc: u16) -> &mut Self {
        self.op(opc::STIDX).u16(argc)
    }
    pub fn ldsfn(&mut self, token: u32) -> &mut Self {
        self.op(opc::LDSFN).u32(token)
    }
    pub fn throw(&mut self) -> &mut Self {
        self.op(opc::THROW)
    }
    pub fn rethrow(&mut self) -> &mut Self {
        self.op(opc::RETHROW)
    }
    pub fn leave(&mut self, rel: i32) -> &mut Self {
        self.op(opc::LEAVE).i32(rel)
    }
    pub fn endfinally(&mut self) -> &mut Self {
        self.op(opc::ENDFINALLY)
    }
    pub fn callmem(&mut self, name_token: u32, argc: u16) -> &mut Self {
        self.op(opc::CALLMEM).u32(name_token).u16(argc)
    }
}

// === The aves native library ===

unsafe fn arg(args: *mut Value, n: usize) -> Value {
    *args.add(n)
}

unsafe fn type_of(thread: *mut Thread) -> &'static ovum_vm::types::StandardTypes {
    &(*(*thread).vm).types
}

unsafe fn expect_int(thread: *mut Thread, value: &Value) -> Result<i64, Trap> {
    if value.is_null() || value.type_ptr() != type_of(thread).int {
        (*thread).throw_type_error(Some("Expected an Int operand."))?;
        unreachable!();
    }
    Ok(value.as_int())
}

unsafe fn expect_uint(thread: *mut Thread, value: &Value) -> Result<u64, Trap> {
    if value.is_null() || value.type_ptr() != type_of(thread).uint {
        (*thread).throw_type_error(Some("Expected a UInt operand."))?;
        unreachable!();
    }
    Ok(value.as_uint())
}

unsafe fn arith_result(thread: *mut Thread, r: ovum_util::ArithmeticResult<i64>) -> OpResult {
    match r {
        Ok(v) => {
            (*thread).push_int(v);
            Ok(())
        }
        Err(ovum_util::ArithmeticError::Overflow) => (*thread).throw_overflow_error(None),
        Err(ovum_util::ArithmeticError::DivideByZero) => {
            (*thread).throw_divide_by_zero_error(None)
        }
    }
}

unsafe fn aves_object_to_string(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let this = arg(args, 0);
    (*thread).push_string((*this.type_ptr()).full_name);
    Ok(())
}

unsafe fn aves_int_op_add(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_int(thread, &arg(args, 0))?;
    let b = expect_int(thread, &arg(args, 1))?;
    arith_result(thread, ovum_util::ops::int_add(a, b))
}

unsafe fn aves_int_op_sub(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_int(thread, &arg(args, 0))?;
    let b = expect_int(thread, &arg(args, 1))?;
    arith_result(thread, ovum_util::ops::int_sub(a, b))
}

unsafe fn aves_int_op_mul(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_int(thread, &arg(args, 0))?;
    let b = expect_int(thread, &arg(args, 1))?;
    arith_result(thread, ovum_util::ops::int_mul(a, b))
}

unsafe fn aves_int_op_div(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_int(thread, &arg(args, 0))?;
    let b = expect_int(thread, &arg(args, 1))?;
    arith_result(thread, ovum_util::ops::int_div(a, b))
}

unsafe fn aves_int_op_mod(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_int(thread, &arg(args, 0))?;
    let b = expect_int(thread, &arg(args, 1))?;
    arith_result(thread, ovum_util::ops::int_rem(a, b))
}

unsafe fn aves_int_op_neg(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_int(thread, &arg(args, 0))?;
    arith_result(thread, ovum_util::ops::int_sub(0, a))
}

unsafe fn aves_int_op_eq(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = arg(args, 0);
    let b = arg(args, 1);
    let equal = !b.is_null() && b.type_ptr() == type_of(thread).int && a.as_int() == b.as_int();
    (*thread).push_bool(equal);
    Ok(())
}

unsafe fn aves_int_op_cmp(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_int(thread, &arg(args, 0))?;
    let b = expect_int(thread, &arg(args, 1))?;
    (*thread).push_int(match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    });
    Ok(())
}

unsafe fn aves_uint_op_add(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = expect_uint(thread, &arg(args, 0))?;
    let b = expect_uint(thread, &arg(args, 1))?;
    match ovum_util::ops::uint_add(a, b) {
        Ok(v) => {
            (*thread).push_uint(v);
            Ok(())
        }
        Err(_) => (*thread).throw_overflow_error(None),
    }
}

unsafe fn aves_uint_op_eq(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = arg(args, 0);
    let b = arg(args, 1);
    let equal = !b.is_null() && b.type_ptr() == type_of(thread).uint && a.as_uint() == b.as_uint();
    (*thread).push_bool(equal);
    Ok(())
}

unsafe fn aves_real_op_add(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = arg(args, 0);
    let b = arg(args, 1);
    if b.is_null() || b.type_ptr() != type_of(thread).real {
        return (*thread).throw_type_error(Some("Expected a Real operand."));
    }
    (*thread).push_real(a.as_real() + b.as_real());
    Ok(())
}

unsafe fn aves_real_op_eq(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = arg(args, 0);
    let b = arg(args, 1);
    let equal =
        !b.is_null() && b.type_ptr() == type_of(thread).real && a.as_real() == b.as_real();
    (*thread).push_bool(equal);
    Ok(())
}

unsafe fn aves_string_op_equals(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = arg(args, 0);
    let b = arg(args, 1);
    let equal = !b.is_null()
        && b.type_ptr() == type_of(thread).string
        && string_equals(a.as_string(), b.as_string());
    (*thread).push_bool(equal);
    Ok(())
}

unsafe fn aves_string_op_cmp(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    let a = arg(args, 0);
    let b = arg(args, 1);
    if b.is_null() || b.type_ptr() != type_of(thread).string {
        return (*thread).throw_type_error(Some("Cannot compare a String with that value."));
    }
    (*thread).push_int(string_compare(a.as_string(), b.as_string()) as i64);
    Ok(())
}

unsafe fn aves_string_to_string(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    (*thread).push(arg(args, 0));
    Ok(())
}

unsafe fn aves_hash_set_item(thread: *mut Thread, _argc: u32, args: *mut Value) -> OpResult {
    use ovum_vm::value::is_same_reference;

    let this = arg(args, 0);
    let key = arg(args, 1);
    let value = arg(args, 2);
    let hash = this.as_hash();

    // Overwrite an existing entry with an identical key.
    for i in 0..(*hash).count {
        let entry = (*hash).entries.add(i as usize);
        if is_same_reference(&(*entry).key, &key) {
            (*entry).value = value;
            (*thread).push_null();
            return Ok(());
        }
    }

    if (*hash).count == (*hash).capacity {
        // Grow the entry array.
        let gc = (*(*thread).vm).gc_ptr();
        let new_capacity = ((*hash).capacity * 2).max(4);
        let mut raw: *mut u8 = std::ptr::null_mut();
        (*gc).alloc_array(
            thread,
            new_capacity as usize,
            std::mem::size_of::<HashEntry>(),
            &mut raw,
        )?;
        let new_entries = raw as *mut HashEntry;
        std::ptr::copy_nonoverlapping(
            (*hash).entries,
            new_entries,
            (*hash).count as usize,
        );
        (*hash).entries = new_entries;
        (*hash).capacity = new_capacity;
    }

    let entry = (*hash).entries.add((*hash).count as usize);
    (*entry).hash_code = 1;
    (*entry).next = -1;
    (*entry).key = key;
    (*entry).value = value;
    (*hash).count += 1;

    (*thread).push_null();
    Ok(())
}

unsafe fn aves_list_init_type(ty: *mut Type) {
    (*ty).set_instance_size(std::mem::size_of::<ListInst>());
    (*ty).add_native_field(8, NativeFieldKind::GcArray); // values
}

unsafe fn aves_hash_init_type(ty: *mut Type) {
    (*ty).set_instance_size(std::mem::size_of::<HashInst>());
    (*ty).add_native_field(8, NativeFieldKind::GcArray); // entries
    (*ty).set_reference_getter(Some(hash_references));
}

unsafe fn hash_references(fields_base: *mut u8, walk: &mut dyn FnMut(*mut Value, usize)) {
    let hash = fields_base as *mut HashInst;
    for i in 0..(*hash).count {
        let entry = (*hash).entries.add(i as usize);
        // Key and value are adjacent in the entry.
        walk(&mut (*entry).key as *mut Value, 2);
    }
}

unsafe fn aves_method_init_type(ty: *mut Type) {
    (*ty).set_instance_size(std::mem::size_of::<ovum_vm::value::MethodInst>());
    (*ty).add_native_field(8, NativeFieldKind::Value); // bound instance
}

unsafe fn aves_type_init_type(ty: *mut Type) {
    (*ty).set_instance_size(16);
}

unsafe fn init_list_instance(thread: *mut Thread, list: *mut ListInst, capacity: i32) -> OpResult {
    let capacity = capacity.max(0);
    let gc = (*(*thread).vm).gc_ptr();

    // The backing-array allocation below may run a cycle; pin the list so
    // it cannot move out from under this raw pointer.
    let gco = GcObject::from_inst(list as *mut u8);
    (*gco).field_access.with(|| unsafe {
        (*gco).pin_count += 1;
        (*gco).flags |= ovum_vm::gc::object::GcoFlags::PINNED;
    });

    let mut values: *mut Value = std::ptr::null_mut();
    let result = (*gc).alloc_value_array(thread, capacity as usize, &mut values);

    (*gco).field_access.with(|| unsafe {
        (*gco).pin_count -= 1;
        if (*gco).pin_count == 0 {
            (*gco).flags -= ovum_vm::gc::object::GcoFlags::PINNED;
        }
    });
    result?;

    (*list).capacity = capacity;
    (*list).length = 0;
    (*list).values = values;
    Ok(())
}

unsafe fn init_hash_instance(thread: *mut Thread, hash: *mut HashInst, capacity: i32) -> OpResult {
    let capacity = capacity.max(4);
    let gc = (*(*thread).vm).gc_ptr();

    let gco = GcObject::from_inst(hash as *mut u8);
    (*gco).field_access.with(|| unsafe {
        (*gco).pin_count += 1;
        (*gco).flags |= ovum_vm::gc::object::GcoFlags::PINNED;
    });

    let mut raw: *mut u8 = std::ptr::null_mut();
    let result = (*gc).alloc_array(
        thread,
        capacity as usize,
        std::mem::size_of::<HashEntry>(),
        &mut raw,
    );

    (*gco).field_access.with(|| unsafe {
        (*gco).pin_count -= 1;
        if (*gco).pin_count == 0 {
            (*gco).flags -= ovum_vm::gc::object::GcoFlags::PINNED;
        }
    });
    result?;

    (*hash).capacity = capacity;
    (*hash).count = 0;
    (*hash).entries = raw as *mut HashEntry;
    Ok(())
}

unsafe fn init_type_token(
    _thread: *mut Thread,
    instance: *mut u8,
    ty: *mut Type,
) -> OpResult {
    *(instance as *mut *mut Type) = ty;
    Ok(())
}

/// The resolved native library backing the test `aves` module.
pub fn aves_native_library() -> NativeLibrary {
    let mut lib = NativeLibrary::new();
    lib.add_method("aves_Object_toString", aves_object_to_string)
        .add_method("aves_Int_opAdd", aves_int_op_add)
        .add_method("aves_Int_opSub", aves_int_op_sub)
        .add_method("aves_Int_opMul", aves_int_op_mul)
        .add_method("aves_Int_opDiv", aves_int_op_div)
        .add_method("aves_Int_opMod", aves_int_op_mod)
        .add_method("aves_Int_opNeg", aves_int_op_neg)
        .add_method("aves_Int_opEq", aves_int_op_eq)
        .add_method("aves_Int_opCmp", aves_int_op_cmp)
        .add_method("aves_UInt_opAdd", aves_uint_op_add)
        .add_method("aves_UInt_opEq", aves_uint_op_eq)
        .add_method("aves_Real_opAdd", aves_real_op_add)
        .add_method("aves_Real_opEq", aves_real_op_eq)
        .add_method("aves_String_opEquals", aves_string_op_equals)
        .add_method("aves_String_opCmp", aves_string_op_cmp)
        .add_method("aves_String_toString", aves_string_to_string)
        .add_method("aves_Hash_setItem", aves_hash_set_item)
        .add_type_initializer("aves_List_init", aves_list_init_type)
        .add_type_initializer("aves_Hash_init", aves_hash_init_type)
        .add_type_initializer("aves_Method_init", aves_method_init_type)
        .add_type_initializer("aves_Type_init", aves_type_init_type);
    lib.init_list_instance = Some(init_list_instance);
    lib.init_hash_instance = Some(init_hash_instance);
    lib.init_type_token = Some(init_type_token);
    lib
}

// === The aves module image ===

/// Well-known token values in the generated aves module, in declaration
/// order. Field tokens: `message` and `stackTrace` of `aves.Error` are
/// the first FieldDefs, `argCount` of NoOverloadError the third.
pub const AVES_FIELD_MESSAGE: u32 = kind::FIELD_DEF | 1;
pub const AVES_FIELD_STACK_TRACE: u32 = kind::FIELD_DEF | 2;
pub const AVES_FIELD_ARG_COUNT: u32 = kind::FIELD_DEF | 3;

const OP_ADD: u8 = 0;
const OP_SUB: u8 = 1;
const OP_MUL: u8 = 4;
const OP_DIV: u8 = 5;
const OP_MOD: u8 = 6;
const OP_NEG: u8 = 12;
const OP_EQ: u8 = 14;
const OP_CMP: u8 = 15;

/// Builds the aves module image: every standard type, the operator
/// methods, and the error constructors.
pub fn build_aves() -> Vec<u8> {
    let mut m = ModuleWriter::new("aves");
    m.native_lib = Some("aves".to_string());

    let new_name = m.string(".new");
    let to_string_name = m.string("toString");
    let item_name = m.string(".item");
    let set_item_name = m.string(".set_item");
    let message_name = m.string("message");
    let stack_trace_name = m.string("stackTrace");
    let arg_count_name = m.string("argCount");
    let value_param = m.string("value");
    let x_param = m.string("x");
    let y_param = m.string("y");

    let object_ctor = MethodDef {
        flags: FM_PUBLIC | FM_INSTANCE | FM_CTOR,
        name: new_name,
        overloads: vec![OverloadDef {
            flags: OV_SHORT_HEADER,
            params: vec![],
            optional: 0,
            locals: 0,
            max_stack: 8,
            tries: vec![],
            body: BodyDef::Bytecode({
                let mut a = Asm::new();
                a.retnull();
                a.into_vec()
            }),
        }],
    };

    // Object's == is reference identity, written in bytecode.
    let object_equals_code = {
        let mut a = Asm::new();
        a.ldarg(0); // 3 bytes @0
        a.ldarg(1); // 3 bytes @3
        a.brref(2); // 5 bytes @6; target @13
        a.ldfalse(); // @11
        a.ret(); // @12
        a.ldtrue(); // @13
        a.ret(); // @14
        a.into_vec()
    };

    let op_equals_name = m.string("opEquals");
    let object = TypeDef {
        flags: TYPE_PUBLIC,
        name: m.string("aves.Object"),
        base: 0,
        shared: 0,
        fields: vec![],
        methods: vec![
            object_ctor,
            MethodDef {
                flags: FM_PUBLIC | FM_IMPL,
                name: op_equals_name,
                overloads: vec![OverloadDef::bytecode(
                    vec![(x_param, 0), (y_param, 0)],
                    0,
                    2,
                    object_equals_code,
                )],
            },
            MethodDef {
                flags: FM_PUBLIC | FM_INSTANCE,
                name: to_string_name,
                overloads: vec![OverloadDef::native(vec![], "aves_Object_toString")],
            },
        ],
        properties: vec![],
        operators: vec![(OP_EQ, 1)],
        initer: None,
    };
    let object_token = m.add_type(object);

    let primitive = TYPE_PUBLIC | TYPE_PRIMITIVE;

    let boolean = TypeDef::new(primitive, m.string("aves.Boolean"), object_token);
    m.add_type(boolean);

    let mut int_type = TypeDef::new(primitive, m.string("aves.Int"), object_token);
    let binary = |name: u32, entry: &'static str| MethodDef {
        flags: FM_PUBLIC | FM_IMPL,
        name,
        overloads: vec![OverloadDef::native(vec![(x_param, 0), (y_param, 0)], entry)],
    };
    let unary = |name: u32, entry: &'static str| MethodDef {
        flags: FM_PUBLIC | FM_IMPL,
        name,
        overloads: vec![OverloadDef::native(vec![(x_param, 0)], entry)],
    };
    let op_add_name = m.string("opAdd");
    let op_sub_name = m.string("opSub");
    let op_mul_name = m.string("opMul");
    let op_div_name = m.string("opDiv");
    let op_mod_name = m.string("opMod");
    let op_neg_name = m.string("opNeg");
    let op_eq_name = m.string("opEq");
    let op_cmp_name = m.string("opCmp");
    int_type.methods = vec![
        binary(op_add_name, "aves_Int_opAdd"),
        binary(op_sub_name, "aves_Int_opSub"),
        binary(op_mul_name, "aves_Int_opMul"),
        binary(op_div_name, "aves_Int_opDiv"),
        binary(op_mod_name, "aves_Int_opMod"),
        unary(op_neg_name, "aves_Int_opNeg"),
        binary(op_eq_name, "aves_Int_opEq"),
        binary(op_cmp_name, "aves_Int_opCmp"),
    ];
    int_type.operators = vec![
        (OP_ADD, 0),
        (OP_SUB, 1),
        (OP_MUL, 2),
        (OP_DIV, 3),
        (OP_MOD, 4),
        (OP_NEG, 5),
        (OP_EQ, 6),
        (OP_CMP, 7),
    ];
    m.add_type(int_type);

    let mut uint_type = TypeDef::new(primitive, m.string("aves.UInt"), object_token);
    uint_type.methods = vec![
        binary(op_add_name, "aves_UInt_opAdd"),
        binary(op_eq_name, "aves_UInt_opEq"),
    ];
    uint_type.operators = vec![(OP_ADD, 0), (OP_EQ, 1)];
    m.add_type(uint_type);

    let mut real_type = TypeDef::new(primitive, m.string("aves.Real"), object_token);
    real_type.methods = vec![
        binary(op_add_name, "aves_Real_opAdd"),
        binary(op_eq_name, "aves_Real_opEq"),
    ];
    real_type.operators = vec![(OP_ADD, 0), (OP_EQ, 1)];
    m.add_type(real_type);

    let mut string_type = TypeDef::new(TYPE_PUBLIC, m.string("aves.String"), object_token);
    string_type.methods = vec![
        binary(op_eq_name, "aves_String_opEquals"),
        binary(op_cmp_name, "aves_String_opCmp"),
        MethodDef {
            flags: FM_PUBLIC | FM_INSTANCE,
            name: to_string_name,
            overloads: vec![OverloadDef::native(vec![], "aves_String_toString")],
        },
    ];
    string_type.operators = vec![(OP_EQ, 0), (OP_CMP, 1)];
    m.add_type(string_type);

    let mut list_type = TypeDef::new(TYPE_PUBLIC, m.string("aves.List"), object_token);
    list_type.initer = Some("aves_List_init");
    m.add_type(list_type);

    let mut hash_type = TypeDef::new(TYPE_PUBLIC, m.string("aves.Hash"), object_token);
    hash_type.initer = Some("aves_Hash_init");
    hash_type.methods = vec![MethodDef {
        flags: FM_PUBLIC | FM_INSTANCE | FM_IMPL,
        name: set_item_name,
        overloads: vec![OverloadDef::native(
            vec![(x_param, 0), (value_param, 0)],
            "aves_Hash_setItem",
        )],
    }];
    hash_type.properties = vec![PropertyDef {
        name: item_name,
        getter: None,
        setter: Some(0),
    }];
    m.add_type(hash_type);

    let mut method_type = TypeDef::new(TYPE_PUBLIC, m.string("aves.Method"), object_token);
    method_type.initer = Some("aves_Method_init");
    m.add_type(method_type);

    let iterator_type = TypeDef::new(TYPE_PUBLIC, m.string("aves.Iterator"), object_token);
    m.add_type(iterator_type);

    let mut reflection_type =
        TypeDef::new(TYPE_PUBLIC, m.string("aves.reflection.Type"), object_token);
    reflection_type.initer = Some("aves_Type_init");
    m.add_type(reflection_type);

    // aves.Error and subclasses. The constructors store the message (and
    // for NoOverloadError the argument count) into the instance fields.
    let error_ctor_code = {
        let mut a = Asm::new();
        a.ldarg(0);
        a.ldarg(1);
        a.stfld(AVES_FIELD_MESSAGE);
        a.retnull();
        a.into_vec()
    };
    let error_ctor = |code: Vec<u8>, params: Vec<(u32, u32)>| MethodDef {
        flags: FM_PUBLIC | FM_INSTANCE | FM_CTOR,
        name: new_name,
        overloads: vec![OverloadDef {
            flags: OV_SHORT_HEADER,
            params,
            optional: 0,
            locals: 0,
            max_stack: 8,
            tries: vec![],
            body: BodyDef::Bytecode(code),
        }],
    };

    let mut error_type = TypeDef::new(TYPE_PUBLIC, m.string("aves.Error"), object_token);
    error_type.fields = vec![
        FieldDef {
            flags: FIELD_PUBLIC | FIELD_INSTANCE,
            name: message_name,
        },
        FieldDef {
            flags: FIELD_PUBLIC | FIELD_INSTANCE,
            name: stack_trace_name,
        },
    ];
    error_type.methods = vec![error_ctor(error_ctor_code.clone(), vec![(value_param, 0)])];
    let error_token = m.add_type(error_type);

    let simple_error = |m: &mut ModuleWriter, name: &str| -> u32 {
        let name_token = m.string(name);
        let mut ty = TypeDef::new(TYPE_PUBLIC, name_token, error_token);
        ty.methods = vec![error_ctor(error_ctor_code.clone(), vec![(value_param, 0)])];
        m.add_type(ty)
    };

    simple_error(&mut m, "aves.TypeError");
    simple_error(&mut m, "aves.MemoryError");
    simple_error(&mut m, "aves.OverflowError");
    simple_error(&mut m, "aves.DivideByZeroError");
    simple_error(&mut m, "aves.NullReferenceError");
    simple_error(&mut m, "aves.MemberNotFoundError");

    // NoOverloadError(.new(argCount, message)) carries the failing count.
    let no_overload_ctor_code = {
        let mut a = Asm::new();
        a.ldarg(0);
        a.ldarg(1);
        a.stfld(AVES_FIELD_ARG_COUNT);
        a.ldarg(0);
        a.ldarg(2);
        a.stfld(AVES_FIELD_MESSAGE);
        a.retnull();
        a.into_vec()
    };
    let mut no_overload = TypeDef::new(TYPE_PUBLIC, m.string("aves.NoOverloadError"), error_token);
    no_overload.fields = vec![FieldDef {
        flags: FIELD_PUBLIC | FIELD_INSTANCE,
        name: arg_count_name,
    }];
    no_overload.methods = vec![error_ctor(
        no_overload_ctor_code,
        vec![(x_param, 0), (value_param, 0)],
    )];
    m.add_type(no_overload);

    m.write()
}

// === VM setup helpers ===

/// Writes the aves image plus a program image into `dir` and boots a VM
/// with the aves natives registered. The program module must reference
/// aves as "aves".
pub fn boot_vm(dir: &Path, program: &ModuleWriter) -> Box<Vm> {
    std::fs::write(dir.join("aves.ovm"), build_aves()).unwrap();
    let program_path = dir.join(format!("{}.ovm", program.name));
    std::fs::write(&program_path, program.write()).unwrap();

    let mut vm = Vm::new_for_embedding(GcConfig::default()).unwrap();
    vm.register_native_library("aves", aves_native_library());
    vm.load_startup(&VmStartParams {
        startup_file: program_path,
        module_path: dir.to_path_buf(),
        args: Vec::new(),
        verbose: false,
        gc: GcConfig::default(),
    })
    .unwrap();
    vm
}

/// A program writer pre-wired with a reference to aves and the type refs
/// the tests commonly need.
pub struct ProgramBuilder {
    pub writer: ModuleWriter,
    pub aves_ref: u32,
    pub type_error_ref: u32,
    pub error_ref: u32,
}

impl ProgramBuilder {
    pub fn new(name: &str) -> Self {
        let mut writer = ModuleWriter::new(name);
        let aves_name = writer.string("aves");
        let aves_ref = writer.add_module_ref(aves_name, [1, 0, 0, 0]);
        let error_name = writer.string("aves.Error");
        let error_ref = writer.add_type_ref(error_name, aves_ref);
        let type_error_name = writer.string("aves.TypeError");
        let type_error_ref = writer.add_type_ref(type_error_name, aves_ref);
        ProgramBuilder {
            writer,
            aves_ref,
            error_ref,
            type_error_ref,
        }
    }

    /// Adds a zero-argument main function with the given body and wires
    /// it as the module's main method.
    pub fn main_body(&mut self, locals: u16, max_stack: u16, tries: Vec<TryDef>, code: Vec<u8>) {
        let main_name = self.writer.string("main");
        let token = self.writer.add_function(MethodDef {
            flags: FM_PUBLIC,
            name: main_name,
            overloads: vec![OverloadDef {
                flags: 0,
                params: vec![],
                optional: 0,
                locals,
                max_stack,
                tries,
                body: BodyDef::Bytecode(code),
            }],
        });
        self.writer.main = token;
    }
}

/// Runs the startup module's main method with zero arguments and returns
/// the raw status plus the returned value.
pub fn run_main(vm: &mut Vm) -> (OpResult, Value) {
    unsafe {
        let module = vm.startup_module();
        assert!(!module.is_null(), "no startup module");
        let main = (*module).main_method();
        assert!(!main.is_null(), "no main method");
        let overload = (*main).resolve_overload(0);
        assert!(!overload.is_null(), "main must accept zero arguments");

        let thread = vm.main_thread_ptr();
        let mut result = Value::null();
        let status = (*thread).start(0, overload, &mut result);
        (status, result)
    }
}

/// The fully qualified name of the current error on the main thread.
pub fn current_error_type(vm: &Vm) -> String {
    unsafe {
        let thread = vm.main_thread_ptr();
        let error = (*thread).current_error;
        assert!(!error.is_null(), "no current error");
        ovum_vm::strings::string_to_rust((*error.type_ptr()).full_name)
    }
}
