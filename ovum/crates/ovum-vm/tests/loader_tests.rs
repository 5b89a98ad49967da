//! Module loader behaviour: the binary format, reference resolution,
//! standard-type registration and the load-time error conditions.

mod common;

use common::*;
use ovum_vm::error::VmError;
use ovum_vm::strings::string_to_rust;
use ovum_vm::vm::{Vm, VmStartParams};
use ovum_vm::GcConfig;

fn try_boot(dir: &std::path::Path, program: &ModuleWriter) -> Result<Box<Vm>, VmError> {
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
    })?;
    Ok(vm)
}

fn empty_main(pb: &mut ProgramBuilder) {
    let mut a = Asm::new();
    a.retnull();
    pb.main_body(0, 8, vec![], a.into_vec());
}

#[test]
fn test_standard_types_registered() {
    let dir = tempfile::tempdir().unwrap();
    let mut pb = ProgramBuilder::new("loads_fine");
    empty_main(&mut pb);

    let vm = try_boot(dir.path(), &pb.writer).unwrap();
    unsafe {
        assert!(!vm.types.object.is_null());
        assert!(!vm.types.string.is_null());
        assert!(!vm.types.list.is_null());
        assert!(!vm.types.no_overload_error.is_null());
        assert_eq!(
            string_to_rust((*vm.types.object).full_name),
            "aves.Object"
        );
        // The error hierarchy chains back to Object.
        assert_eq!((*vm.types.type_error).base_type, vm.types.error);
        assert_eq!((*vm.types.error).base_type, vm.types.object);
        // Error has two Value fields laid out from the instance base.
        assert_eq!((*vm.types.error).field_count, 2);
        assert_eq!((*vm.types.error).total_size(), 32);
        // The initialiser functions were registered from the native lib.
        assert!(vm.functions.init_list_instance.is_some());
        assert!(vm.functions.init_hash_instance.is_some());
        assert!(vm.functions.init_type_token.is_some());
    }
}

#[test]
fn test_operators_inherit_from_base() {
    let dir = tempfile::tempdir().unwrap();
    let mut pb = ProgramBuilder::new("ops_inherit");
    empty_main(&mut pb);

    let vm = try_boot(dir.path(), &pb.writer).unwrap();
    unsafe {
        use ovum_vm::types::Operator;
        // TypeError declares no operators; == comes from Object.
        let inherited = (*vm.types.type_error).get_operator(Operator::Eq);
        let object_eq = (*vm.types.object).get_operator(Operator::Eq);
        assert!(!inherited.is_null());
        assert_eq!(inherited, object_eq);
        // Int declares its own ==.
        let int_eq = (*vm.types.int).get_operator(Operator::Eq);
        assert!(!int_eq.is_null());
        assert_ne!(int_eq, object_eq);
    }
}

#[test]
fn test_bad_magic_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.ovm");
    std::fs::write(&path, b"NOPE this is not a module").unwrap();

    let mut vm = Vm::new_for_embedding(GcConfig::default()).unwrap();
    let result = vm.load_startup(&VmStartParams {
        startup_file: path,
        module_path: dir.path().to_path_buf(),
        args: Vec::new(),
        verbose: false,
        gc: GcConfig::default(),
    });
    match result {
        Err(VmError::ModuleLoad(e)) => {
            assert!(e.message.contains("magic number"), "{}", e.message);
        }
        other => panic!("expected a module load error, got {other:?}"),
    }
}

#[test]
fn test_missing_dependency_version() {
    // The program demands aves >= 9.0, but the test aves is 1.0.
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ModuleWriter::new("too_new");
    let aves_name = writer.string("aves");
    writer.add_module_ref(aves_name, [9, 0, 0, 0]);

    let result = try_boot(dir.path(), &writer);
    match result {
        Err(VmError::ModuleLoad(e)) => {
            assert!(e.message.contains("insufficient version"), "{}", e.message);
        }
        other => panic!("expected a module load error, got {:?}", other.err()),
    }
}

#[test]
fn test_duplicate_global_member_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut pb = ProgramBuilder::new("dupes");

    let name = pb.writer.string("twice");
    for _ in 0..2 {
        let body = {
            let mut a = Asm::new();
            a.retnull();
            a.into_vec()
        };
        pb.writer.add_function(MethodDef {
            flags: FM_PUBLIC,
            name,
            overloads: vec![OverloadDef::bytecode(vec![], 0, 8, body)],
        });
    }

    let result = try_boot(dir.path(), &pb.writer);
    match result {
        Err(VmError::ModuleLoad(e)) => {
            assert!(e.message.contains("Duplicate global member"), "{}", e.message);
        }
        other => panic!("expected a module load error, got {:?}", other.err()),
    }
}

#[test]
fn test_unresolved_field_ref_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut pb = ProgramBuilder::new("badref");
    let bogus = pb.writer.string("noSuchField");
    pb.writer.add_field_ref(bogus, pb.error_ref);
    empty_main(&mut pb);

    let result = try_boot(dir.path(), &pb.writer);
    match result {
        Err(VmError::ModuleLoad(e)) => {
            assert!(e.message.contains("Unresolved FieldRef"), "{}", e.message);
        }
        other => panic!("expected a module load error, got {:?}", other.err()),
    }
}

#[test]
fn test_missing_standard_types_without_aves() {
    // A standalone module with no aves reference leaves the standard
    // types unloaded.
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ModuleWriter::new("lonely");
    let name = writer.string("main");
    let body = {
        let mut a = Asm::new();
        a.retnull();
        a.into_vec()
    };
    let token = writer.add_function(MethodDef {
        flags: FM_PUBLIC,
        name,
        overloads: vec![OverloadDef::bytecode(vec![], 0, 8, body)],
    });
    writer.main = token;

    let result = try_boot(dir.path(), &writer);
    assert!(matches!(result, Err(VmError::MissingStandardType(_))));
}

#[test]
fn test_main_method_must_not_be_instance() {
    let dir = tempfile::tempdir().unwrap();
    let mut pb = ProgramBuilder::new("instmain");

    let name = pb.writer.string("main");
    let body = {
        let mut a = Asm::new();
        a.retnull();
        a.into_vec()
    };
    let token = pb.writer.add_function(MethodDef {
        flags: FM_PUBLIC | FM_INSTANCE,
        name,
        overloads: vec![OverloadDef::bytecode(vec![], 0, 8, body)],
    });
    pb.writer.main = token;

    let result = try_boot(dir.path(), &pb.writer);
    match result {
        Err(VmError::ModuleLoad(e)) => {
            assert!(e.message.contains("instance method"), "{}", e.message);
        }
        other => panic!("expected a module load error, got {:?}", other.err()),
    }
}

#[test]
fn test_module_strings_are_interned_and_pinned() {
    let dir = tempfile::tempdir().unwrap();
    let mut pb = ProgramBuilder::new("stringy");
    let token = pb.writer.string("a module string");
    let _ = token;
    empty_main(&mut pb);

    let vm = try_boot(dir.path(), &pb.writer).unwrap();
    unsafe {
        let module = vm.startup_module();
        for &s in (*module).strings.iter() {
            assert!((*s).is_interned());
            // Module strings live in gen1 and never move.
            let value = ovum_vm::value::Value::of_string(vm.types.string, s);
            assert_eq!((*vm.gc_ptr()).generation_of(&value), 1);
        }
        assert!((*module)
            .strings
            .iter()
            .any(|&s| string_to_rust(s) == "a module string"));
    }
}
