//! The module loader.
//!
//! Given a file path and the VM's module pool, produces a fully resolved
//! module with complete type, method, field, string and reference tables,
//! loading transitive dependencies along the way. References are read
//! before definitions, because definitions refer to types, methods and
//! fields through tokens. Dependent modules are opened recursively during
//! ModuleRef resolution; a dependency that is not yet fully opened at
//! that point is a circular dependency.

use log::info;

use crate::error::ModuleLoadError;
use crate::module::reader::ModuleReader;
use crate::module::token::{kind, Token};
use crate::module::{GlobalMember, GlobalMemberKind, Module, ModuleVersion};
use crate::strings::{string_to_rust, ManagedString, StrKey};
use crate::types::member::{Field, Member, MemberData, MemberFlags, Property};
use crate::types::method::{
    CatchBlock, Method, MethodOverload, OverloadBody, OverloadFlags, TryBlock, TryHandler, TryKind,
};
use crate::types::{Operator, Type, TypeFlags, STANDARD_TYPE_NAMES};
use crate::value::Value;
use crate::vm::Vm;

/// The magic bytes every module file starts with.
pub const MAGIC: [u8; 4] = *b"OVMM";

/// Offset of the first real data in the file.
pub const DATA_START: usize = 16;

// Field flags in the file format.
const FIELD_PUBLIC: i32 = 0x01;
const FIELD_PRIVATE: i32 = 0x02;
const FIELD_PROTECTED: i32 = 0x04;
const FIELD_INSTANCE: i32 = 0x08;
const FIELD_HAS_VALUE: i32 = 0x10;

// Method flags in the file format.
const FM_PUBLIC: u32 = 0x01;
const FM_PRIVATE: u32 = 0x02;
const FM_PROTECTED: u32 = 0x04;
const FM_INSTANCE: u32 = 0x08;
const FM_CTOR: u32 = 0x10;
const FM_IMPL: u32 = 0x20;

// Overload flags in the file format.
const OV_VAR_END: u32 = 0x01;
const OV_VAR_START: u32 = 0x02;
const OV_NATIVE: u32 = 0x04;
const OV_SHORT_HEADER: u32 = 0x08;
const OV_VIRTUAL: u32 = 0x10;
const OV_ABSTRACT: u32 = 0x20;
const OV_OVERRIDE: u32 = 0x40;

// Parameter flags in the file format.
const PARAM_BY_REF: u32 = 0x01;

// Constant flags in the file format.
const CONST_PRIVATE: u32 = 0x02;

struct ModuleMeta {
    name: *mut ManagedString,
    version: ModuleVersion,
    native_lib: Option<String>,
    type_count: i32,
    function_count: i32,
    constant_count: i32,
    field_count: i32,
    method_count: i32,
    method_start: u32,
}

/// Opens a module by name: returns it from the pool if already loaded,
/// otherwise locates `<name>.ovm` in the startup directory or the library
/// path and loads it.
pub unsafe fn open_by_name(
    vm: *mut Vm,
    name: *mut ManagedString,
) -> Result<*mut Module, ModuleLoadError> {
    let existing = (*vm).modules.find(name);
    if !existing.is_null() {
        return Ok(existing);
    }

    let file_name = format!("{}.ovm", string_to_rust(name));
    let mut found = None;
    for dir in [&(*vm).startup_path, &(*vm).module_path] {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            found = Some(candidate);
            break;
        }
    }

    let Some(path) = found else {
        return Err(ModuleLoadError::new(
            string_to_rust(name),
            "Could not locate the module file.",
        ));
    };

    if (*vm).verbose {
        info!(
            "loading module '{}' from file '{}'",
            string_to_rust(name),
            path.display()
        );
    }

    let module = open_module(vm, &path)?;

    if (*vm).verbose {
        info!("successfully loaded module '{}'", string_to_rust(name));
    }

    Ok(module)
}

/// Opens and fully resolves a module file.
pub unsafe fn open_module(
    vm: *mut Vm,
    path: &std::path::Path,
) -> Result<*mut Module, ModuleLoadError> {
    let mut reader = ModuleReader::open(path)?;

    verify_magic(&mut reader)?;
    reader.seek(DATA_START);

    let meta = read_module_meta(vm, &mut reader)?;

    // The module joins the pool before it is fully loaded, specifically
    // so that circular dependencies can be detected.
    let mut module = Module::new(meta.name, meta.version, path.to_path_buf());
    module.method_start = meta.method_start;
    if let Some(lib_name) = &meta.native_lib {
        let lib = (*vm).find_native_library(lib_name);
        if lib.is_null() {
            return Err(reader.error("Could not load native library file."));
        }
        module.native_lib = Some(lib);
    }
    let module = Box::into_raw(module);
    (*vm).modules.add(module);

    (*module).types.reserve(meta.type_count.max(0) as usize);
    (*module).functions.reserve(meta.function_count.max(0) as usize);
    (*module).constants.reserve(meta.constant_count.max(0) as usize);
    (*module).fields.reserve(meta.field_count.max(0) as usize);
    (*module).methods.reserve(meta.method_count.max(0) as usize);

    read_string_table(vm, &mut reader, module)?;

    // These must be read in exactly this order.
    read_module_refs(vm, &mut reader, module)?;
    read_type_refs(vm, &mut reader, module)?;
    read_function_refs(vm, &mut reader, module)?;
    read_field_refs(vm, &mut reader, module)?;
    read_method_refs(vm, &mut reader, module)?;

    read_type_defs(vm, &mut reader, module)?;
    read_function_defs(vm, &mut reader, module)?;
    read_constant_defs(vm, &mut reader, module)?;

    let main_token = reader.read_token()?;
    if !main_token.is_none() {
        if main_token.kind() != kind::METHOD_DEF && main_token.kind() != kind::FUNCTION_DEF {
            return Err(reader.error("Main method token ID must be a MethodDef or FunctionDef."));
        }
        let main = (*module).find_method(main_token);
        if main.is_null() {
            return Err(reader.error("Unresolved main method token ID."));
        }
        if (*main).member.flags.contains(MemberFlags::INSTANCE) {
            return Err(reader.error("Main method cannot be an instance method."));
        }
        (*module).main_method = main;
    }

    (*module).fully_opened = true;
    Ok(module)
}

fn verify_magic(reader: &mut ModuleReader) -> Result<(), ModuleLoadError> {
    let magic = reader.read_bytes(4)?;
    if magic != MAGIC {
        return Err(reader.error("Invalid magic number in module file."));
    }
    Ok(())
}

unsafe fn read_module_string(
    vm: *mut Vm,
    reader: &mut ModuleReader,
) -> Result<*mut ManagedString, ModuleLoadError> {
    let units = reader.read_string_data()?;
    let thread = (*vm).main_thread_ptr();
    let gc = (*vm).gc_ptr();
    let s = (*gc).construct_module_string(thread, &units);
    if s.is_null() {
        return Err(reader.error("Not enough memory for module string."));
    }
    Ok((*gc).intern_string(thread, s))
}

unsafe fn read_version(reader: &mut ModuleReader) -> Result<ModuleVersion, ModuleLoadError> {
    Ok(ModuleVersion {
        major: reader.read_i32()?,
        minor: reader.read_i32()?,
        build: reader.read_i32()?,
        revision: reader.read_i32()?,
    })
}

unsafe fn read_module_meta(
    vm: *mut Vm,
    reader: &mut ModuleReader,
) -> Result<ModuleMeta, ModuleLoadError> {
    let name = read_module_string(vm, reader)?;
    let version = read_version(reader)?;

    // The string map is of no interest to the runtime.
    reader.skip_frame()?;

    let native_lib_units = reader.read_string_data()?;
    let native_lib = if native_lib_units.is_empty() {
        None
    } else {
        Some(ovum_util::utf8::utf16_to_string(&native_lib_units))
    };

    let type_count = reader.read_i32()?;
    let function_count = reader.read_i32()?;
    let constant_count = reader.read_i32()?;
    let field_count = reader.read_i32()?;
    let method_count = reader.read_i32()?;
    // Skip the method block's own size prefix.
    let method_start = reader.read_u32()? + std::mem::size_of::<u32>() as u32;

    Ok(ModuleMeta {
        name,
        version,
        native_lib,
        type_count,
        function_count,
        constant_count,
        field_count,
        method_count,
        method_start,
    })
}

/// Checks the token prefix of the next item of a table.
fn expect_token(
    reader: &mut ModuleReader,
    table_len: usize,
    token_kind: u32,
    table: &str,
) -> Result<Token, ModuleLoadError> {
    let token = reader.read_token()?;
    if token != Token::new(token_kind, table_len) {
        return Err(reader.error(format!("Invalid {table} token ID.")));
    }
    Ok(token)
}

unsafe fn read_string_table(
    vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    (*module).strings.reserve(length.max(0) as usize);
    for _ in 0..length {
        expect_token(reader, (*module).strings.len(), kind::STRING, "String")?;
        let value = read_module_string(vm, reader)?;
        (*module).strings.push(value);
    }

    reader.verify_frame(end, "String")
}

unsafe fn read_module_refs(
    vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(reader, (*module).module_refs.len(), kind::MODULE_REF, "ModuleRef")?;

        // A module reference is a name plus a minimum version.
        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID for ModuleRef name."));
        }
        let min_version = read_version(reader)?;

        let dep = open_by_name(vm, name)?;
        if !(*dep).fully_opened {
            return Err(reader.error("Circular dependency detected."));
        }
        if (*dep).version < min_version {
            return Err(reader.error("Dependent module has insufficient version."));
        }

        (*module).module_refs.push(dep);
    }

    reader.verify_frame(end, "ModuleRef")
}

unsafe fn read_type_refs(
    _vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(reader, (*module).type_refs.len(), kind::TYPE_REF, "TypeRef")?;

        // A type reference is a name plus a ModuleRef.
        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID for TypeRef name."));
        }
        let owner = (*module).find_module_ref(reader.read_token()?);
        if owner.is_null() {
            return Err(reader.error("Unresolved ModuleRef token in TypeRef."));
        }

        let ty = (*owner).find_type_by_name(name, false);
        if ty.is_null() {
            return Err(reader.error("Unresolved TypeRef."));
        }
        (*module).type_refs.push(ty);
    }

    reader.verify_frame(end, "TypeRef")
}

unsafe fn read_function_refs(
    _vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(
            reader,
            (*module).function_refs.len(),
            kind::FUNCTION_REF,
            "FunctionRef",
        )?;

        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID for FunctionRef name."));
        }
        let owner = (*module).find_module_ref(reader.read_token()?);
        if owner.is_null() {
            return Err(reader.error("Invalid module token ID in FunctionRef."));
        }

        let func = (*owner).find_global_function(name, false);
        if func.is_null() {
            return Err(reader.error("Unresolved FunctionRef."));
        }
        (*module).function_refs.push(func);
    }

    reader.verify_frame(end, "FunctionRef")
}

unsafe fn read_field_refs(
    _vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(reader, (*module).field_refs.len(), kind::FIELD_REF, "FieldRef")?;

        // A field reference is a name plus a TypeRef.
        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID for FieldRef name."));
        }
        let type_token = reader.read_token()?;
        if type_token.kind() != kind::TYPE_REF {
            return Err(reader.error("FieldRef must contain a TypeRef."));
        }
        let ty = (*module).find_type(type_token);
        if ty.is_null() {
            return Err(reader.error("Unresolved TypeRef token in FieldRef."));
        }

        match (*ty).get_member(name) {
            Some(Member::Field(field)) => (*module).field_refs.push(field),
            Some(_) => return Err(reader.error("FieldRef does not refer to a field.")),
            None => return Err(reader.error("Unresolved FieldRef.")),
        }
    }

    reader.verify_frame(end, "FieldRef")
}

unsafe fn read_method_refs(
    _vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(
            reader,
            (*module).method_refs.len(),
            kind::METHOD_REF,
            "MethodRef",
        )?;

        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID for MethodRef name."));
        }
        let type_token = reader.read_token()?;
        if type_token.kind() != kind::TYPE_REF {
            return Err(reader.error("MethodRef must contain a TypeRef."));
        }
        let ty = (*module).find_type(type_token);
        if ty.is_null() {
            return Err(reader.error("Unresolved TypeRef token in MethodRef."));
        }

        match (*ty).get_member(name) {
            Some(Member::Method(method)) => (*module).method_refs.push(method),
            Some(_) => return Err(reader.error("MethodRef does not refer to a method.")),
            None => return Err(reader.error("Unresolved MethodRef.")),
        }
    }

    reader.verify_frame(end, "MethodRef")
}

unsafe fn read_type_defs(
    vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        let token = expect_token(reader, (*module).types.len(), kind::TYPE_DEF, "TypeDef")?;

        let ty = read_single_type(vm, reader, module, token)?;
        (*module).types.push(ty);
        let internal = (*ty).is_internal();
        if (*module)
            .members
            .insert(
                StrKey((*ty).full_name),
                GlobalMember {
                    internal,
                    kind: GlobalMemberKind::Type(ty),
                },
            )
            .is_some()
        {
            return Err(reader.error("Duplicate global member name."));
        }
    }

    // Finalise the operator tables now that every base chain within this
    // module is complete.
    for &ty in (*module).types.iter() {
        ensure_ops_inited(ty);
    }

    reader.verify_frame(end, "TypeDef")
}

unsafe fn ensure_ops_inited(ty: *mut Type) {
    if (*ty).flags.contains(TypeFlags::OPS_INITED) {
        return;
    }
    if !(*ty).base_type.is_null() {
        ensure_ops_inited((*ty).base_type);
    }
    (*ty).init_operators();
}

unsafe fn read_single_type(
    vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
    type_token: Token,
) -> Result<*mut Type, ModuleLoadError> {
    let flags = TypeFlags::from_bits_retain(reader.read_u32()?);
    let name = (*module).find_string(reader.read_token()?);
    if name.is_null() {
        return Err(reader.error("Could not resolve string ID in TypeDef name."));
    }

    let base_token = reader.read_token()?;
    let shared_token = reader.read_token()?;

    let mut base_type: *mut Type = std::ptr::null_mut();
    if !base_token.is_none() {
        if base_token == type_token {
            return Err(reader.error("A type cannot have itself as its base type."));
        }
        base_type = (*module).find_type(base_token);
        if base_type.is_null() {
            return Err(reader.error("Could not resolve base type ID."));
        }
    }

    let mut shared_type: *mut Type = std::ptr::null_mut();
    if !shared_token.is_none() {
        if shared_token.kind() != kind::TYPE_DEF {
            return Err(reader.error("A shared type must be a TypeDef."));
        }
        if shared_token == type_token {
            return Err(reader.error("A type cannot have itself as its shared type."));
        }
        shared_type = (*module).find_type(shared_token);
        if shared_type.is_null() {
            return Err(reader.error("Could not resolve shared type ID."));
        }
    }

    let _member_count = reader.read_i32()?;

    let mut ty = Type::new(module, vm);
    ty.flags = flags & TypeFlags::ACCESSIBILITY
        | (flags & (TypeFlags::ABSTRACT | TypeFlags::SEALED | TypeFlags::IMPL | TypeFlags::PRIMITIVE));
    ty.base_type = base_type;
    ty.shared_type = shared_type;
    ty.fields_offset = if base_type.is_null() {
        0
    } else {
        (*base_type).fields_offset + (*base_type).size as u32
    };
    ty.full_name = name;
    let ty = Box::into_raw(ty);

    read_fields(reader, module, ty)?;
    read_methods(reader, module, ty)?;
    read_properties(reader, module, ty)?;
    read_operators(reader, module, ty)?;

    // The instance constructor, if declared, is the member named `.new`.
    if let Some(Member::Method(ctor)) = (*ty).get_member((*vm).strings.new_) {
        (*ty).instance_ctor = ctor;
    }

    // Link each method to the base type's method of the same name; this
    // drives overload-resolution fallback and protected-member origins.
    if !base_type.is_null() {
        for member in (*ty).members.values() {
            if let Member::Method(method) = member {
                let method = *method;
                let mut base = base_type;
                while !base.is_null() {
                    if let Some(Member::Method(base_method)) = (*base).get_member((*method).member.name)
                    {
                        (*method).base_method = base_method;
                        break;
                    }
                    base = (*base).base_type;
                }
            }
        }
    }

    // Run the native type initialiser, if one is named.
    if let Some(initer_name) = reader.read_cstring()? {
        let lib = (*module).native_lib.unwrap_or(std::ptr::null());
        let initer = if lib.is_null() {
            None
        } else {
            (*lib).find_type_initializer(&initer_name)
        };
        let Some(initer) = initer else {
            return Err(reader.error("Could not locate type initializer entry point."));
        };
        initer(ty);
    }
    (*ty).flags |= TypeFlags::INITED;

    try_register_standard_type(vm, reader, module, ty)?;
    Ok(ty)
}

unsafe fn read_fields(
    reader: &mut ModuleReader,
    module: *mut Module,
    ty: *mut Type,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(reader, (*module).fields.len(), kind::FIELD_DEF, "FieldDef")?;

        let field_flags = reader.read_i32()?;
        if field_flags & FIELD_HAS_VALUE != 0 && field_flags & FIELD_INSTANCE != 0 {
            return Err(
                reader.error("The field flags hasValue and instance cannot be used together.")
            );
        }

        let mut flags = MemberFlags::FIELD;
        if field_flags & FIELD_PUBLIC != 0 {
            flags |= MemberFlags::PUBLIC;
        } else if field_flags & FIELD_PRIVATE != 0 {
            flags |= MemberFlags::PRIVATE;
        } else if field_flags & FIELD_PROTECTED != 0 {
            flags |= MemberFlags::PROTECTED;
        }
        if field_flags & FIELD_INSTANCE != 0 {
            flags |= MemberFlags::INSTANCE;
        }

        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID in FieldDef name."));
        }

        // Constant values are resolved by the compiler; the runtime only
        // needs the field itself.
        if field_flags & FIELD_HAS_VALUE != 0 {
            reader.skip(std::mem::size_of::<u32>() + std::mem::size_of::<u64>())?;
        }

        let mut field = Box::new(Field::new(MemberData::new(name, flags, ty, module)));
        if !field.is_static() {
            field.offset = (*ty).fields_offset + (*ty).size as u32;
            (*ty).field_count += 1;
            (*ty).size += std::mem::size_of::<Value>();
        }
        let field = Box::into_raw(field);

        if (*ty)
            .members
            .insert(StrKey(name), Member::Field(field))
            .is_some()
        {
            return Err(reader.error("Duplicate member name in type."));
        }
        (*module).fields.push(field);
    }

    reader.verify_frame(end, "FieldDef")
}

unsafe fn read_methods(
    reader: &mut ModuleReader,
    module: *mut Module,
    ty: *mut Type,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(reader, (*module).methods.len(), kind::METHOD_DEF, "MethodDef")?;

        let method = read_single_method(reader, module)?;
        let name = (*method).member.name;
        (*method).set_decl_type(ty);

        if (*ty)
            .members
            .insert(StrKey(name), Member::Method(method))
            .is_some()
        {
            return Err(reader.error("Duplicate member name in type."));
        }
        (*module).methods.push(method);
    }

    reader.verify_frame(end, "MethodDef")
}

unsafe fn read_properties(
    reader: &mut ModuleReader,
    module: *mut Module,
    ty: *mut Type,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID in property name."));
        }
        let getter_token = reader.read_token()?;
        let setter_token = reader.read_token()?;

        let mut flags = MemberFlags::empty();
        let mut getter: *mut Method = std::ptr::null_mut();
        if !getter_token.is_none() {
            if getter_token.kind() != kind::METHOD_DEF {
                return Err(reader.error("Property getter must be a MethodDef."));
            }
            getter = (*module).find_method(getter_token);
            if getter.is_null() {
                return Err(reader.error("Unresolved MethodDef token ID in property getter."));
            }
            if (*getter).member.decl_type != ty {
                return Err(reader.error(
                    "Property getter must refer to a method in the same type as the property.",
                ));
            }
            flags = (*getter).member.flags - (MemberFlags::IMPL | MemberFlags::KIND);
        }

        let mut setter: *mut Method = std::ptr::null_mut();
        if !setter_token.is_none() {
            if setter_token.kind() != kind::METHOD_DEF {
                return Err(reader.error("Property setter must be a MethodDef."));
            }
            setter = (*module).find_method(setter_token);
            if setter.is_null() {
                return Err(reader.error("Unresolved MethodDef token ID in property setter."));
            }
            if (*setter).member.decl_type != ty {
                return Err(reader.error(
                    "Property setter must refer to a method in the same type as the property.",
                ));
            }
            let setter_flags = (*setter).member.flags - (MemberFlags::IMPL | MemberFlags::KIND);
            if !flags.is_empty() && setter_flags != flags {
                return Err(reader.error(
                    "Property getter and setter must have the same accessibility, \
                     and matching abstract, virtual, sealed and instance flags.",
                ));
            }
            flags = setter_flags;
        }

        if getter.is_null() && setter.is_null() {
            return Err(reader.error("Property must have at least one accessor."));
        }

        let prop = Box::into_raw(Box::new(Property::new(
            MemberData::new(name, flags | MemberFlags::PROPERTY, ty, module),
            getter,
            setter,
        )));

        if (*ty)
            .members
            .insert(StrKey(name), Member::Property(prop))
            .is_some()
        {
            return Err(reader.error("Duplicate member name in type."));
        }
    }

    reader.verify_frame(end, "PropertyDef")
}

unsafe fn read_operators(
    reader: &mut ModuleReader,
    module: *mut Module,
    ty: *mut Type,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        let op_index = reader.read_u8()?;
        let Some(op) = Operator::from_index(op_index) else {
            return Err(reader.error("Invalid operator index in OperatorDef."));
        };
        let method_token = reader.read_token()?;

        if method_token.kind() != kind::METHOD_DEF {
            return Err(reader.error("Operator method must be a MethodDef."));
        }
        let method = (*module).find_method(method_token);
        if method.is_null() {
            return Err(reader.error("Unresolved MethodDef token ID in operator."));
        }
        if (*method).member.decl_type != ty {
            return Err(reader.error("Operator method must be in the same type as the operator."));
        }
        if !(*ty).operators[op as usize].is_null() {
            return Err(reader.error("Duplicate operator declaration."));
        }

        let overload = (*method).resolve_overload(op.arity());
        if overload.is_null() {
            return Err(
                reader.error("Operator method must have an overload taking the operator's arity.")
            );
        }
        (*ty).operators[op as usize] = overload;
    }

    reader.verify_frame(end, "OperatorDef")
}

unsafe fn read_single_method(
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<*mut Method, ModuleLoadError> {
    let method_flags = reader.read_u32()?;

    let name = (*module).find_string(reader.read_token()?);
    if name.is_null() {
        return Err(reader.error("Could not resolve string ID in MethodDef or FunctionDef name."));
    }

    let Some(end) = reader.begin_frame()? else {
        return Err(reader.error("Method found without overloads."));
    };
    let overload_count = reader.read_i32()?;
    if overload_count <= 0 {
        return Err(reader.error("Method found without overloads."));
    }

    let mut member_flags = MemberFlags::METHOD;
    if method_flags & FM_PUBLIC != 0 {
        member_flags |= MemberFlags::PUBLIC;
    } else if method_flags & FM_PRIVATE != 0 {
        member_flags |= MemberFlags::PRIVATE;
    } else if method_flags & FM_PROTECTED != 0 {
        member_flags |= MemberFlags::PROTECTED;
    }
    if method_flags & FM_INSTANCE != 0 {
        member_flags |= MemberFlags::INSTANCE;
    }
    if method_flags & FM_IMPL != 0 {
        member_flags |= MemberFlags::IMPL;
    }

    let mut overloads = Vec::with_capacity(overload_count as usize);
    for _ in 0..overload_count {
        overloads.push(read_single_overload(reader, module, method_flags)?);
    }

    reader.verify_frame(end, "overloads")?;

    let method = Method::new(MemberData::new(name, member_flags, std::ptr::null_mut(), module), overloads);
    Ok(Box::into_raw(method))
}

unsafe fn read_single_overload(
    reader: &mut ModuleReader,
    module: *mut Module,
    method_flags: u32,
) -> Result<MethodOverload, ModuleLoadError> {
    let file_flags = reader.read_u32()?;

    let mut flags = OverloadFlags::empty();
    if method_flags & FM_CTOR != 0 {
        flags |= OverloadFlags::CTOR;
    }
    if method_flags & FM_INSTANCE != 0 {
        flags |= OverloadFlags::INSTANCE;
    }
    if file_flags & OV_VAR_END != 0 {
        flags |= OverloadFlags::VAR_END;
    }
    if file_flags & OV_VAR_START != 0 {
        flags |= OverloadFlags::VAR_START;
    }
    if file_flags & OV_VIRTUAL != 0 {
        flags |= OverloadFlags::VIRTUAL;
    }
    if file_flags & OV_ABSTRACT != 0 {
        flags |= OverloadFlags::ABSTRACT;
    }
    if file_flags & OV_OVERRIDE != 0 {
        flags |= OverloadFlags::OVERRIDE;
    }
    if file_flags & OV_SHORT_HEADER != 0 {
        flags |= OverloadFlags::SHORT_HEADER;
    }

    let mut overload = MethodOverload::new(flags);

    // Parameters: a name plus flags; the by-ref bits build the overload's
    // ref signature. Bit 0 of the signature is the instance slot.
    let param_count = reader.read_u16()? as u32;
    overload.param_count = param_count;
    overload.param_names.reserve(param_count as usize);
    for i in 0..param_count {
        let param_name = (*module).find_string(reader.read_token()?);
        if param_name.is_null() {
            return Err(reader.error("Could not resolve string ID in parameter name."));
        }
        overload.param_names.push(param_name);

        let param_flags = reader.read_u32()?;
        if param_flags & PARAM_BY_REF != 0 {
            overload.ref_signature.set_param_ref(i + 1);
        }
    }

    // Header.
    if file_flags & OV_SHORT_HEADER != 0 {
        overload.optional_param_count = 0;
        overload.locals = 0;
        overload.max_stack = 8;
    } else {
        overload.optional_param_count = reader.read_u16()? as u32;
        overload.locals = reader.read_u16()? as u32;
        overload.max_stack = reader.read_u16()? as u32;
        overload.try_blocks = read_try_blocks(reader, module)?;
    }

    // Body.
    if file_flags & OV_ABSTRACT == 0 {
        if file_flags & OV_NATIVE != 0 {
            let Some(entry_point) = reader.read_cstring()? else {
                return Err(reader.error("Could not locate entry point of native method."));
            };
            let lib = (*module).native_lib.unwrap_or(std::ptr::null());
            let entry = if lib.is_null() {
                None
            } else {
                (*lib).find_method(&entry_point)
            };
            let Some(entry) = entry else {
                return Err(reader.error("Could not locate entry point of native method."));
            };
            overload.body = OverloadBody::Native(entry);
            overload.flags |= OverloadFlags::NATIVE;
        } else {
            let offset = reader.read_u32()?;
            let length = reader.read_u32()?;

            let resume = reader.position();
            reader.seek(((*module).method_start + offset) as usize);
            let body = reader.read_bytes(length as usize)?;
            reader.seek(resume);

            overload.body = OverloadBody::Raw(body.into_boxed_slice());
        }
    }

    Ok(overload)
}

unsafe fn read_try_blocks(
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<Vec<TryBlock>, ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(Vec::new());
    };

    let length = reader.read_i32()?;
    let mut tries = Vec::with_capacity(length.max(0) as usize);
    for _ in 0..length {
        let kind_value = reader.read_u8()?;
        let try_start = reader.read_u32()? as usize;
        let try_end = reader.read_u32()? as usize;

        let (kind, handler) = match kind_value {
            0x01 => {
                let mut catches = Vec::new();
                if let Some(catch_end) = reader.begin_frame()? {
                    let catch_length = reader.read_i32()?;
                    catches.reserve(catch_length.max(0) as usize);
                    for _ in 0..catch_length {
                        let caught_type_token = reader.read_token()?;
                        // Resolve eagerly when possible; the method
                        // initialiser retries otherwise.
                        let caught_type = (*module).find_type(caught_type_token);
                        let catch_start = reader.read_u32()? as usize;
                        let catch_end_offset = reader.read_u32()? as usize;
                        catches.push(CatchBlock {
                            caught_type_token,
                            caught_type,
                            catch_start,
                            catch_end: catch_end_offset,
                        });
                    }
                    reader.verify_frame(catch_end, "catch")?;
                }
                (TryKind::Catch, TryHandler::Catch(catches))
            }
            0x02 | 0x03 => {
                let start = reader.read_u32()? as usize;
                let end = reader.read_u32()? as usize;
                let kind = if kind_value == 0x02 {
                    TryKind::Finally
                } else {
                    TryKind::Fault
                };
                (kind, TryHandler::Finally { start, end })
            }
            _ => return Err(reader.error("Invalid try block kind.")),
        };

        tries.push(TryBlock {
            kind,
            try_start,
            try_end,
            handler,
        });
    }

    reader.verify_frame(end, "tries")?;
    Ok(tries)
}

unsafe fn read_function_defs(
    _vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(
            reader,
            (*module).functions.len(),
            kind::FUNCTION_DEF,
            "FunctionDef",
        )?;

        let function = read_single_method(reader, module)?;
        let internal = (*function).member.flags.contains(MemberFlags::PRIVATE);

        if (*module)
            .members
            .insert(
                StrKey((*function).member.name),
                GlobalMember {
                    internal,
                    kind: GlobalMemberKind::Function(function),
                },
            )
            .is_some()
        {
            return Err(reader.error("Duplicate global member name."));
        }
        (*module).functions.push(function);
    }

    reader.verify_frame(end, "FunctionDef")
}

unsafe fn read_constant_defs(
    vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
) -> Result<(), ModuleLoadError> {
    let Some(end) = reader.begin_frame()? else {
        return Ok(());
    };

    let length = reader.read_i32()?;
    for _ in 0..length {
        expect_token(
            reader,
            (*module).constants.len(),
            kind::CONSTANT_DEF,
            "ConstantDef",
        )?;

        let const_flags = reader.read_u32()?;

        let name = (*module).find_string(reader.read_token()?);
        if name.is_null() {
            return Err(reader.error("Could not resolve string ID in ConstantDef name."));
        }
        let type_token = reader.read_token()?;
        let ty = (*module).find_type(type_token);
        if ty.is_null() {
            return Err(reader.error("Unresolved TypeRef or TypeDef token ID in ConstantDef."));
        }
        if ty != (*vm).types.string && !(*ty).is_primitive() {
            return Err(reader.error("ConstantDef type must be primitive or aves.String."));
        }

        let raw_value = reader.read_i64()?;

        let constant = if ty == (*vm).types.string {
            let s = (*module).find_string(Token(raw_value as u32));
            if s.is_null() {
                return Err(reader.error("Unresolved String token ID in ConstantDef."));
            }
            Value::of_string(ty, s)
        } else {
            Value::of_int(ty, raw_value)
        };

        (*module).constants.push(constant);
        if (*module)
            .members
            .insert(
                StrKey(name),
                GlobalMember {
                    internal: const_flags & CONST_PRIVATE != 0,
                    kind: GlobalMemberKind::Constant(constant),
                },
            )
            .is_some()
        {
            return Err(reader.error("Duplicate global member name."));
        }
    }

    reader.verify_frame(end, "ConstantDef")
}

/// Checks whether a freshly-built type is one of the standard types and,
/// if so, records it with the VM. A subset of the standard types also
/// requires an instance initialiser in the module's native library.
unsafe fn try_register_standard_type(
    vm: *mut Vm,
    reader: &mut ModuleReader,
    module: *mut Module,
    ty: *mut Type,
) -> Result<(), ModuleLoadError> {
    let name = string_to_rust((*ty).full_name);
    let Some(&(_, initer_name)) = STANDARD_TYPE_NAMES.iter().find(|(n, _)| *n == name) else {
        return Ok(());
    };

    let slot = (*vm)
        .types
        .slot_by_name(&name)
        .expect("standard type table out of sync");
    if !slot.is_null() {
        return Ok(());
    }
    *slot = ty;

    if let Some(initer_name) = initer_name {
        let lib = (*module).native_lib.unwrap_or(std::ptr::null());
        if lib.is_null() {
            return Err(reader
                .error("Missing instance initializer for standard type in native library."));
        }
        let found = match initer_name {
            "InitListInstance" => {
                (*vm).functions.init_list_instance = (*lib).init_list_instance;
                (*lib).init_list_instance.is_some()
            }
            "InitHashInstance" => {
                (*vm).functions.init_hash_instance = (*lib).init_hash_instance;
                (*lib).init_hash_instance.is_some()
            }
            "InitTypeToken" => {
                (*vm).functions.init_type_token = (*lib).init_type_token;
                (*lib).init_type_token.is_some()
            }
            _ => false,
        };
        if !found {
            return Err(reader
                .error("Missing instance initializer for standard type in native library."));
        }
    }

    Ok(())
}
