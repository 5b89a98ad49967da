//! Error types for the VM core.
//!
//! Three layers of failure exist:
//!
//! - [`VmError`]: startup-level failures surfaced to the host (module load,
//!   method initialisation, missing main method, missing standard types).
//! - [`Trap`]: the status of a managed operation. `Thrown` means a managed
//!   error value is stored on the current thread and the evaluator's
//!   try/catch/finally machinery takes over.
//! - Managed errors themselves, which are ordinary `aves.Error` instances
//!   and never appear as Rust errors.

use std::fmt;

use thiserror::Error;

/// Result alias for fallible VM-level operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Status of a managed operation.
///
/// `Ok(())` is the success path. A failing operation either set a managed
/// error on the thread (`Thrown`) or ran out of memory in a place where no
/// managed error could be constructed (`NoMemory`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Thrown,
    NoMemory,
}

/// Result alias for managed operations.
pub type OpResult = std::result::Result<(), Trap>;

/// Top-level VM failures.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),

    #[error(transparent)]
    MethodInit(#[from] MethodInitError),

    #[error("startup module does not define a main method")]
    NoMainMethod,

    #[error("main method must take 1 or 0 arguments, and cannot be an instance method")]
    InvalidMainMethod,

    #[error("standard type not loaded: {0}")]
    MissingStandardType(String),

    #[error("out of memory")]
    NoMemory,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A module failed to load. Carries the offending file and a diagnostic.
#[derive(Debug, Error)]
#[error("error loading module '{path}': {message}")]
pub struct ModuleLoadError {
    pub path: String,
    pub message: String,
}

impl ModuleLoadError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Kind-specific detail of a method-initialisation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodInitFailure {
    General,
    InconsistentStack { instr_index: usize },
    InvalidBranchOffset { instr_index: usize },
    InsufficientStack { instr_index: usize },
    StackHasRefs { instr_index: usize },
    InaccessibleMember { member: String },
    FieldStaticMismatch { field: String, must_be_static: bool },
    UnresolvedToken { token: u32 },
    NoMatchingOverload { method: String, arg_count: u32 },
    InaccessibleType { type_name: String },
    TypeNotConstructible { type_name: String },
}

/// A method body could not be initialised.
///
/// The method and module names are captured as plain strings so the error
/// can outlive the VM structures it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInitError {
    pub method: String,
    pub module: String,
    pub message: String,
    pub failure: MethodInitFailure,
}

impl std::error::Error for MethodInitError {}

impl fmt::Display for MethodInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "an error occurred while initializing the method '{}' from module {}: {}",
            self.method, self.module, self.message
        )?;
        match &self.failure {
            MethodInitFailure::General => Ok(()),
            MethodInitFailure::InconsistentStack { instr_index }
            | MethodInitFailure::InvalidBranchOffset { instr_index }
            | MethodInitFailure::InsufficientStack { instr_index }
            | MethodInitFailure::StackHasRefs { instr_index } => {
                write!(f, "\nInstruction index: {instr_index}")
            }
            MethodInitFailure::InaccessibleMember { member } => {
                write!(f, "\nMember: {member}")
            }
            MethodInitFailure::FieldStaticMismatch { field, .. } => {
                write!(f, "\nMember: {field}")
            }
            MethodInitFailure::UnresolvedToken { token } => {
                write!(f, "\nToken: {token:08X}")
            }
            MethodInitFailure::NoMatchingOverload { method, arg_count } => {
                write!(f, "\nMethod: '{method}'\nArgument count: {arg_count}")
            }
            MethodInitFailure::InaccessibleType { type_name }
            | MethodInitFailure::TypeNotConstructible { type_name } => {
                write!(f, "\nType: '{type_name}'")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_load_error_display() {
        let err = ModuleLoadError::new("foo.ovm", "Invalid magic number.");
        assert_eq!(
            err.to_string(),
            "error loading module 'foo.ovm': Invalid magic number."
        );
    }

    #[test]
    fn test_method_init_error_display() {
        let err = MethodInitError {
            method: "aves.Object.toString".to_string(),
            module: "aves".to_string(),
            message: "Unresolved String token.".to_string(),
            failure: MethodInitFailure::UnresolvedToken { token: 0x2000_0001 },
        };
        let text = err.to_string();
        assert!(text.contains("aves.Object.toString"));
        assert!(text.contains("Token: 20000001"));
    }

    #[test]
    fn test_vm_error_from_module_load() {
        let err: VmError = ModuleLoadError::new("a", "b").into();
        assert!(matches!(err, VmError::ModuleLoad(_)));
    }
}
