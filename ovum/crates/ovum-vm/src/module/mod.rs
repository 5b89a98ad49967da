//! Modules: the unit of loading.
//!
//! A module owns its types, global functions, constants, fields, class
//! methods and string table, plus parallel *ref* tables pointing into
//! other modules. A global-member map keyed by name merges types,
//! functions and constants for cross-module lookup.

pub mod loader;
pub mod reader;
pub mod token;

use indexmap::IndexMap;

use crate::strings::{ManagedString, StrKey};
use crate::types::member::Field;
use crate::types::method::Method;
use crate::types::Type;
use crate::value::Value;
use crate::vm::NativeLibrary;

use token::{kind, Token};

/// A four-part module version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ModuleVersion {
    pub major: i32,
    pub minor: i32,
    pub build: i32,
    pub revision: i32,
}

impl std::fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// A module-level member: a type, a global function or a global constant.
#[derive(Clone, Copy)]
pub enum GlobalMemberKind {
    Type(*mut Type),
    Function(*mut Method),
    Constant(Value),
}

#[derive(Clone, Copy)]
pub struct GlobalMember {
    /// Internal members are visible only within the declaring module.
    pub internal: bool,
    pub kind: GlobalMemberKind,
}

/// A loaded module.
pub struct Module {
    pub name: *mut ManagedString,
    pub version: ModuleVersion,
    pub path: std::path::PathBuf,

    /// Set once the module file has been fully loaded. A dependency with
    /// this still false at resolution time is a circular dependency.
    pub fully_opened: bool,

    // Definition tables, indexed by the low 24 bits of their tokens.
    pub types: Vec<*mut Type>,
    pub functions: Vec<*mut Method>,
    pub constants: Vec<Value>,
    pub fields: Vec<*mut Field>,
    pub methods: Vec<*mut Method>,
    pub strings: Vec<*mut ManagedString>,

    /// Global members by name: types, functions and constants together.
    pub members: IndexMap<StrKey, GlobalMember>,

    // Reference tables, resolved against other modules.
    pub module_refs: Vec<*mut Module>,
    pub type_refs: Vec<*mut Type>,
    pub function_refs: Vec<*mut Method>,
    pub field_refs: Vec<*mut Field>,
    pub method_refs: Vec<*mut Method>,

    /// Offset of the method block in the file, set to 0 after opening.
    pub method_start: u32,
    pub main_method: *mut Method,

    /// The module's native library, resolved from the embedder registry.
    pub native_lib: Option<*const NativeLibrary>,
}

impl Module {
    pub fn new(name: *mut ManagedString, version: ModuleVersion, path: std::path::PathBuf) -> Box<Module> {
        Box::new(Module {
            name,
            version,
            path,
            fully_opened: false,
            types: Vec::new(),
            functions: Vec::new(),
            constants: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            strings: Vec::new(),
            members: IndexMap::new(),
            module_refs: Vec::new(),
            type_refs: Vec::new(),
            function_refs: Vec::new(),
            field_refs: Vec::new(),
            method_refs: Vec::new(),
            method_start: 0,
            main_method: std::ptr::null_mut(),
            native_lib: None,
        })
    }

    // === Lookup by name ===

    pub unsafe fn find_type_by_name(
        &self,
        name: *mut ManagedString,
        include_internal: bool,
    ) -> *mut Type {
        match self.members.get(&StrKey(name)) {
            Some(member) if include_internal || !member.internal => match member.kind {
                GlobalMemberKind::Type(ty) => ty,
                _ => std::ptr::null_mut(),
            },
            _ => std::ptr::null_mut(),
        }
    }

    pub unsafe fn find_global_function(
        &self,
        name: *mut ManagedString,
        include_internal: bool,
    ) -> *mut Method {
        match self.members.get(&StrKey(name)) {
            Some(member) if include_internal || !member.internal => match member.kind {
                GlobalMemberKind::Function(f) => f,
                _ => std::ptr::null_mut(),
            },
            _ => std::ptr::null_mut(),
        }
    }

    pub unsafe fn find_constant(
        &self,
        name: *mut ManagedString,
        include_internal: bool,
    ) -> Option<Value> {
        match self.members.get(&StrKey(name)) {
            Some(member) if include_internal || !member.internal => match member.kind {
                GlobalMemberKind::Constant(value) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    // === Lookup by token ===

    fn table_get<T: Copy>(table: &[T], token: Token) -> Option<T> {
        table.get(token.index()).copied()
    }

    pub fn find_module_ref(&self, token: Token) -> *mut Module {
        if token.is_kind(kind::MODULE_REF) {
            Self::table_get(&self.module_refs, token).unwrap_or(std::ptr::null_mut())
        } else {
            std::ptr::null_mut()
        }
    }

    pub fn find_type(&self, token: Token) -> *mut Type {
        let table = match token.kind() {
            kind::TYPE_DEF => &self.types,
            kind::TYPE_REF => &self.type_refs,
            _ => return std::ptr::null_mut(),
        };
        Self::table_get(table, token).unwrap_or(std::ptr::null_mut())
    }

    pub fn find_method(&self, token: Token) -> *mut Method {
        let table = match token.kind() {
            kind::METHOD_DEF => &self.methods,
            kind::METHOD_REF => &self.method_refs,
            kind::FUNCTION_DEF => &self.functions,
            kind::FUNCTION_REF => &self.function_refs,
            _ => return std::ptr::null_mut(),
        };
        Self::table_get(table, token).unwrap_or(std::ptr::null_mut())
    }

    pub fn find_field(&self, token: Token) -> *mut Field {
        let table = match token.kind() {
            kind::FIELD_DEF => &self.fields,
            kind::FIELD_REF => &self.field_refs,
            _ => return std::ptr::null_mut(),
        };
        Self::table_get(table, token).unwrap_or(std::ptr::null_mut())
    }

    pub fn find_string(&self, token: Token) -> *mut ManagedString {
        if token.is_kind(kind::STRING) {
            Self::table_get(&self.strings, token).unwrap_or(std::ptr::null_mut())
        } else {
            std::ptr::null_mut()
        }
    }

    pub fn find_constant_by_token(&self, token: Token) -> Option<Value> {
        if token.is_kind(kind::CONSTANT_DEF) {
            Self::table_get(&self.constants, token)
        } else {
            None
        }
    }

    pub fn main_method(&self) -> *mut Method {
        self.main_method
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        // Strings are managed by the GC; refs belong to their own
        // modules. Everything defined here is owned here.
        unsafe {
            for &f in &self.functions {
                drop(Box::from_raw(f));
            }
            for &m in &self.methods {
                drop(Box::from_raw(m));
            }
            for &ty in &self.types {
                // Fields and properties are owned by the type's member
                // table; methods were freed through the module tables.
                for member in (*ty).members.values() {
                    match member {
                        crate::types::member::Member::Field(field) => {
                            drop(Box::from_raw(*field));
                        }
                        crate::types::member::Member::Property(prop) => {
                            drop(Box::from_raw(*prop));
                        }
                        crate::types::member::Member::Method(_) => {}
                    }
                }
                drop(Box::from_raw(ty));
            }
        }
    }
}

/// The set of loaded modules, looked up by name.
pub struct ModulePool {
    modules: Vec<*mut Module>,
}

impl ModulePool {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn add(&mut self, module: *mut Module) {
        self.modules.push(module);
    }

    pub unsafe fn find(&self, name: *mut ManagedString) -> *mut Module {
        for &module in &self.modules {
            if crate::strings::string_equals((*module).name, name) {
                return module;
            }
        }
        std::ptr::null_mut()
    }

    pub fn all(&self) -> &[*mut Module] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for ModulePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModulePool {
    fn drop(&mut self) {
        unsafe {
            for &module in &self.modules {
                drop(Box::from_raw(module));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let a = ModuleVersion {
            major: 1,
            minor: 2,
            build: 3,
            revision: 4,
        };
        let b = ModuleVersion {
            major: 1,
            minor: 3,
            build: 0,
            revision: 0,
        };
        assert!(a < b);
        assert_eq!(a, a);
        assert_eq!(a.to_string(), "1.2.3.4");
    }

    #[test]
    fn test_find_by_token_wrong_kind() {
        let module = Module::new(
            std::ptr::null_mut(),
            ModuleVersion::default(),
            std::path::PathBuf::new(),
        );
        assert!(module.find_type(Token::new(kind::STRING, 0)).is_null());
        assert!(module.find_string(Token::new(kind::TYPE_DEF, 0)).is_null());
        assert!(module.find_method(Token::new(kind::FIELD_DEF, 0)).is_null());
    }

    #[test]
    fn test_find_by_token_out_of_range() {
        let module = Module::new(
            std::ptr::null_mut(),
            ModuleVersion::default(),
            std::path::PathBuf::new(),
        );
        assert!(module.find_type(Token::new(kind::TYPE_DEF, 3)).is_null());
        assert!(module.find_field(Token(0x1200_0000)).is_null()); // index 0 means absent
    }
}
