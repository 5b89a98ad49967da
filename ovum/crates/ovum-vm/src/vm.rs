//! The VM root object.
//!
//! A [`Vm`] owns the garbage collector, the main managed thread, the
//! module pool, the resolved standard types and the native-library
//! registry. It loads the startup module with its transitive
//! dependencies, converts the program arguments into managed strings, and
//! drives the main method to completion.

use std::path::PathBuf;

use log::info;
use rustc_hash::FxHashMap;

use crate::ee::thread::Thread;
use crate::error::{MethodInitError, Result, Trap, VmError};
use crate::gc::statics::StaticRef;
use crate::gc::{Gc, GcConfig};
use crate::module::{loader, Module, ModulePool};
use crate::strings::statics::StaticStrings;
use crate::strings::{string_to_rust, ManagedString};
use crate::types::member::{Member, MemberFlags};
use crate::types::method::{MethodOverload, NativeMethod};
use crate::types::{StandardTypes, Type};
use crate::value::{HashInst, ListInst, Value, NULL_VALUE};

/// Native type initialiser: called while the type is being built, before
/// it is marked initialised.
pub type TypeInitializer = unsafe fn(ty: *mut Type);

/// Fills in a freshly allocated `aves.List` instance. The instance
/// pointer must stay valid across any allocation the initialiser makes;
/// pin the instance around such allocations.
pub type ListInitializer =
    unsafe fn(thread: *mut Thread, list: *mut ListInst, capacity: i32) -> crate::error::OpResult;

/// Fills in a freshly allocated `aves.Hash` instance. The same pinning
/// requirement as [`ListInitializer`] applies.
pub type HashInitializer =
    unsafe fn(thread: *mut Thread, hash: *mut HashInst, capacity: i32) -> crate::error::OpResult;

/// Binds a freshly allocated `aves.reflection.Type` instance to a type.
pub type TypeTokenInitializer =
    unsafe fn(thread: *mut Thread, instance: *mut u8, ty: *mut Type) -> crate::error::OpResult;

/// The initialiser functions the core invokes through registration, never
/// by name.
#[derive(Default)]
pub struct FunctionTable {
    pub init_list_instance: Option<ListInitializer>,
    pub init_hash_instance: Option<HashInitializer>,
    pub init_type_token: Option<TypeTokenInitializer>,
}

/// The resolved entry points of one native library. The embedder
/// registers libraries by name before modules that declare them load;
/// the loader only ever consumes resolved function pointers.
#[derive(Default)]
pub struct NativeLibrary {
    methods: FxHashMap<String, NativeMethod>,
    type_initializers: FxHashMap<String, TypeInitializer>,
    pub init_list_instance: Option<ListInitializer>,
    pub init_hash_instance: Option<HashInitializer>,
    pub init_type_token: Option<TypeTokenInitializer>,
}

impl NativeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_method(&mut self, name: impl Into<String>, method: NativeMethod) -> &mut Self {
        self.methods.insert(name.into(), method);
        self
    }

    pub fn add_type_initializer(
        &mut self,
        name: impl Into<String>,
        initializer: TypeInitializer,
    ) -> &mut Self {
        self.type_initializers.insert(name.into(), initializer);
        self
    }

    pub fn find_method(&self, name: &str) -> Option<NativeMethod> {
        self.methods.get(name).copied()
    }

    pub fn find_type_initializer(&self, name: &str) -> Option<TypeInitializer> {
        self.type_initializers.get(name).copied()
    }
}

/// Startup parameters for a VM instance.
#[derive(Debug, Clone)]
pub struct VmStartParams {
    /// The compiled module to execute.
    pub startup_file: PathBuf,
    /// Directory additional modules are loaded from.
    pub module_path: PathBuf,
    /// Program arguments, passed to the main method as an `aves.List`.
    pub args: Vec<String>,
    /// Print progress during startup.
    pub verbose: bool,
    pub gc: GcConfig,
}

pub struct Vm {
    pub verbose: bool,
    pub types: StandardTypes,
    pub functions: FunctionTable,
    pub strings: StaticStrings,
    /// Directory of the startup file; searched for modules first.
    pub startup_path: PathBuf,
    pub module_path: PathBuf,
    pub modules: ModulePool,

    native_libraries: FxHashMap<String, Box<NativeLibrary>>,
    gc: *mut Gc,
    main_thread: *mut Thread,
    startup_module: *mut Module,
    /// Program arguments as managed strings in static cells.
    arg_values: Vec<*mut StaticRef>,
}

impl Vm {
    /// Creates a VM without loading any modules. The embedder (and the
    /// test suites) can register native libraries and populate standard
    /// types before anything runs.
    pub fn new_for_embedding(gc_config: GcConfig) -> Result<Box<Vm>> {
        let gc = Gc::new(gc_config).map_err(VmError::Io)?;
        let thread = Thread::new().map_err(VmError::Io)?;

        let mut vm = Box::new(Vm {
            verbose: false,
            types: StandardTypes::new(),
            functions: FunctionTable::default(),
            strings: StaticStrings::new(),
            startup_path: PathBuf::new(),
            module_path: PathBuf::new(),
            modules: ModulePool::new(),
            native_libraries: FxHashMap::default(),
            gc: Box::into_raw(gc),
            main_thread: Box::into_raw(thread),
            startup_module: std::ptr::null_mut(),
            arg_values: Vec::new(),
        });

        let vm_ptr = &mut *vm as *mut Vm;
        unsafe {
            (*vm.gc).set_vm(vm_ptr);
            (*vm.main_thread).set_vm(vm_ptr);
        }
        Ok(vm)
    }

    /// Creates a VM and loads the startup module with its dependencies.
    /// Native libraries must be registered through `register_native_library`
    /// before this call for any module that declares one.
    pub fn new(params: VmStartParams) -> Result<Box<Vm>> {
        let mut vm = Self::new_for_embedding(params.gc.clone())?;
        vm.verbose = params.verbose;
        vm.load_startup(&params)?;
        Ok(vm)
    }

    /// Loads the startup module and prepares the argument values. Split
    /// out so embedders that pre-register native libraries can call it on
    /// a VM created with `new_for_embedding`.
    pub fn load_startup(&mut self, params: &VmStartParams) -> Result<()> {
        self.verbose = params.verbose;
        self.startup_path = params
            .startup_file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        self.module_path = params.module_path.clone();

        if self.verbose {
            info!("module path:  {}", self.module_path.display());
            info!("startup file: {}", params.startup_file.display());
        }

        let vm_ptr = self as *mut Vm;
        self.startup_module = unsafe { loader::open_module(vm_ptr, &params.startup_file)? };

        if let Some(missing) = self.types.missing() {
            return Err(VmError::MissingStandardType(missing.to_string()));
        }

        self.init_args(&params.args)?;
        Ok(())
    }

    /// Converts the program arguments into managed strings held by static
    /// references, so the GC can always reach them.
    fn init_args(&mut self, args: &[String]) -> Result<()> {
        let thread = self.main_thread;
        let gc = self.gc;
        for (index, arg) in args.iter().enumerate() {
            unsafe {
                let s = (*gc).convert_string(thread, arg);
                if s.is_null() {
                    return Err(VmError::NoMemory);
                }
                let value = Value::of_string(self.types.string, s);
                let cell = (*gc).add_static_reference(thread, value);
                if cell.is_null() {
                    return Err(VmError::NoMemory);
                }
                self.arg_values.push(cell);
            }
            if self.verbose {
                info!("argument {index}: {arg}");
            }
        }
        Ok(())
    }

    // === Accessors used across the core ===

    #[inline]
    pub fn gc_ptr(&self) -> *mut Gc {
        self.gc
    }

    #[inline]
    pub fn main_thread_ptr(&self) -> *mut Thread {
        self.main_thread
    }

    pub fn startup_module(&self) -> *mut Module {
        self.startup_module
    }

    pub fn register_native_library(&mut self, name: impl Into<String>, library: NativeLibrary) {
        self.native_libraries.insert(name.into(), Box::new(library));
    }

    /// The registered library with the given name, or null.
    pub fn find_native_library(&self, name: &str) -> *const NativeLibrary {
        self.native_libraries
            .get(name)
            .map(|b| &**b as *const NativeLibrary)
            .unwrap_or(std::ptr::null())
    }

    // === Running ===

    /// Invokes the startup module's main method and maps its return value
    /// to a process exit code. Unhandled managed errors are reported to
    /// stderr and yield a nonzero code.
    pub fn run(&mut self) -> Result<i32> {
        let main = unsafe {
            let module = self.startup_module;
            if module.is_null() {
                return Err(VmError::NoMainMethod);
            }
            (*module).main_method()
        };
        if main.is_null() {
            return Err(VmError::NoMainMethod);
        }

        let (overload, argc) = unsafe { self.resolve_main_overload(main)? };

        if self.verbose {
            info!("<<< Begin program output >>>");
        }

        let thread = self.main_thread;
        let mut return_value = NULL_VALUE;
        let result = unsafe { (*thread).start(argc, overload, &mut return_value) };

        let code = match result {
            Ok(()) => unsafe {
                if !return_value.is_null() {
                    let ty = return_value.type_ptr();
                    if ty == self.types.int || ty == self.types.uint {
                        return_value.as_int() as i32
                    } else if ty == self.types.real {
                        return_value.as_real() as i32
                    } else {
                        0
                    }
                } else {
                    0
                }
            },
            Err(Trap::Thrown) => {
                self.print_unhandled_error();
                1
            }
            Err(Trap::NoMemory) => 2,
        };

        if self.verbose {
            info!("<<< End program output >>>");
        }

        Ok(code)
    }

    /// Main takes either one argument (the argument list) or none.
    unsafe fn resolve_main_overload(
        &mut self,
        main: *mut crate::types::method::Method,
    ) -> Result<(*mut MethodOverload, u32)> {
        let thread = self.main_thread;
        let gc = self.gc;

        let one_arg = (*main).resolve_overload(1);
        let (overload, argc) = if !one_arg.is_null() {
            // Pack the program arguments into an aves.List and push it.
            let frame = (*thread).current_frame;
            let slot = (*frame).eval_stack.add((*frame).stack_count as usize);
            (*gc)
                .alloc_value(
                    thread,
                    self.types.list,
                    (*self.types.list).total_size(),
                    slot,
                )
                .map_err(|_| VmError::NoMemory)?;
            (*frame).stack_count += 1;

            let init_list = self
                .functions
                .init_list_instance
                .expect("list initializer not registered");
            let list = (*slot).as_list();
            init_list(thread, list, self.arg_values.len() as i32)
                .map_err(|_| VmError::NoMemory)?;
            for (i, &cell) in self.arg_values.iter().enumerate() {
                *(*list).values.add(i) = (*cell).read();
            }
            (*list).length = self.arg_values.len() as i32;

            (one_arg, 1)
        } else {
            ((*main).resolve_overload(0), 0)
        };

        if overload.is_null() || (*overload).is_instance_method() {
            return Err(VmError::InvalidMainMethod);
        }
        Ok((overload, argc))
    }

    // === Error reporting ===

    pub fn print_method_init_error(&self, error: &MethodInitError) {
        eprintln!("{error}");
    }

    /// Prints the unhandled error's type, message and stack trace. The
    /// message comes from the `message` property when one is readable,
    /// else from the `message` field.
    pub fn print_unhandled_error(&mut self) {
        unsafe {
            let thread = self.main_thread;
            let error = (*thread).current_error;
            if error.is_null() {
                return;
            }

            let type_name = string_to_rust((*error.type_ptr()).full_name);
            let message = self.error_message(&error);
            match &message {
                Some(message) => eprintln!("Unhandled error: {type_name}: {message}"),
                None => eprintln!("Unhandled error: {type_name}"),
            }

            if let Some(trace) = self.error_string_field(&error, self.strings.stack_trace) {
                eprintln!("{trace}");
            }
        }
    }

    unsafe fn error_message(&mut self, error: &Value) -> Option<String> {
        let member = (*error.type_ptr()).find_member(self.strings.message, std::ptr::null());
        if let Some(Member::Property(prop)) = member {
            let getter = (*prop).getter;
            let is_instance = (*prop).member.flags.contains(MemberFlags::INSTANCE);
            if !getter.is_null() && is_instance {
                let thread = self.main_thread;
                (*thread).push(*error);
                let mut result = NULL_VALUE;
                if (*thread)
                    .invoke_method((*prop).getter, 0, Some(&mut result as *mut Value))
                    .is_ok()
                    && !result.is_null()
                    && result.type_ptr() == self.types.string
                {
                    return Some(string_to_rust(result.as_string()));
                }
            }
        }
        self.error_string_field(error, self.strings.message)
    }

    /// Reads a string-typed instance field of an error, if present.
    unsafe fn error_string_field(
        &self,
        error: &Value,
        name: *mut ManagedString,
    ) -> Option<String> {
        let member = (*error.type_ptr()).find_member(name, std::ptr::null())?;
        if let Member::Field(field) = member {
            if !(*field).is_static() {
                let mut value = NULL_VALUE;
                (*field).read_field_unchecked(error, &mut value);
                if !value.is_null() && value.type_ptr() == self.types.string {
                    return Some(string_to_rust(value.as_string()));
                }
            }
        }
        None
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        unsafe {
            // The collector goes first: finalisers and intern-table
            // cleanup still need the type system.
            drop(Box::from_raw(self.gc));
            drop(Box::from_raw(self.main_thread));
            // The module pool frees the types and methods afterwards.
        }
    }
}
