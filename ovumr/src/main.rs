//! Ovumr - the command-line front-end for the Ovum virtual machine.
//!
//! Usage: `ovumr [VM options] <startup file> [program args...]`
//!
//! The startup file is the compiled Ovum module to execute; everything
//! after it is passed to the hosted program. Modules are loaded from the
//! startup file's directory first, then from the library path, which
//! defaults to `lib` next to the executable.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ovum_vm::{GcConfig, Vm, VmError, VmStartParams};

/// The Ovum virtual machine.
#[derive(Parser, Debug)]
#[command(name = "ovumr")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Executes compiled Ovum modules", long_about = None)]
struct Cli {
    /// Directory that modules are loaded from (default: 'lib' next to
    /// the executable). May occur at most once.
    // Collected as a list: clap treats a repeated scalar as
    // last-value-wins, so check_arguments enforces the at-most-once rule.
    #[arg(short = 'L', long = "lib-path", action = clap::ArgAction::Append)]
    lib_path: Vec<PathBuf>,

    /// Print additional information during startup
    #[arg(short, long)]
    verbose: bool,

    /// The compiled Ovum program to execute
    startup_file: PathBuf,

    /// Arguments passed to the hosted program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    program_args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(message) = check_arguments(&cli) {
        eprintln!("Could not start Ovum: {message}");
        std::process::exit(2);
    }

    init_logging(cli.verbose);

    std::process::exit(match run(cli) {
        Ok(code) => code,
        Err(error) => {
            report_error(&error);
            exit_code_for(&error)
        }
    });
}

/// Constraints clap does not express: the library path may be given at
/// most once.
fn check_arguments(cli: &Cli) -> Result<(), String> {
    if cli.lib_path.len() > 1 {
        return Err("the library path can only be given once".to_string());
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new("warn")
    };

    let subscriber = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(subscriber)
        .try_init();
}

fn run(cli: Cli) -> Result<i32, VmError> {
    // Shared libraries resolve module paths on their own; hand the VM an
    // absolute path so there is no ambiguity about the startup directory.
    let startup_file = cli
        .startup_file
        .canonicalize()
        .map_err(VmError::Io)?;

    let params = VmStartParams {
        startup_file,
        module_path: cli
            .lib_path
            .into_iter()
            .next()
            .unwrap_or_else(default_module_path),
        args: cli.program_args,
        verbose: cli.verbose,
        gc: GcConfig::default(),
    };

    let mut vm = Vm::new(params)?;
    vm.run()
}

/// The default module path is `lib` under the executable's directory.
fn default_module_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("lib")))
        .unwrap_or_else(|| PathBuf::from("lib"))
}

fn report_error(error: &VmError) {
    match error {
        VmError::ModuleLoad(e) => eprintln!("{e}"),
        VmError::MethodInit(e) => eprintln!("{e}"),
        other => eprintln!("Could not start Ovum: {other}"),
    }
}

fn exit_code_for(error: &VmError) -> i32 {
    match error {
        VmError::ModuleLoad(_) => 3,
        VmError::MethodInit(_) => 4,
        VmError::NoMainMethod | VmError::InvalidMainMethod => 5,
        VmError::MissingStandardType(_) => 6,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_startup_file_only() {
        let cli = Cli::parse_from(["ovumr", "program.ovm"]);
        assert_eq!(cli.startup_file, PathBuf::from("program.ovm"));
        assert!(cli.program_args.is_empty());
        assert!(!cli.verbose);
        assert!(cli.lib_path.is_empty());
        assert!(check_arguments(&cli).is_ok());
    }

    #[test]
    fn test_cli_parse_lib_path() {
        let cli = Cli::parse_from(["ovumr", "-L", "/opt/ovum/lib", "program.ovm"]);
        assert_eq!(cli.lib_path, vec![PathBuf::from("/opt/ovum/lib")]);
        assert!(check_arguments(&cli).is_ok());
    }

    #[test]
    fn test_cli_parse_lib_path_at_most_once() {
        // clap accepts the repeat (last-value-wins for scalars), so the
        // constraint lives in check_arguments.
        let cli = Cli::parse_from(["ovumr", "-L", "a", "-L", "b", "program.ovm"]);
        assert_eq!(cli.lib_path.len(), 2);
        assert!(check_arguments(&cli).is_err());
    }

    #[test]
    fn test_cli_parse_verbose() {
        let cli = Cli::parse_from(["ovumr", "-v", "program.ovm"]);
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_parse_program_args_stay_untouched() {
        let cli = Cli::parse_from(["ovumr", "program.ovm", "one", "-v", "--weird"]);
        assert_eq!(cli.program_args, vec!["one", "-v", "--weird"]);
        // The -v belongs to the program, not the VM.
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_requires_startup_file() {
        assert!(Cli::try_parse_from(["ovumr"]).is_err());
    }

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let errors = [
            exit_code_for(&VmError::NoMainMethod),
            exit_code_for(&VmError::MissingStandardType("aves.Object".into())),
            exit_code_for(&VmError::NoMemory),
        ];
        for code in errors {
            assert_ne!(code, 0);
        }
    }
}
