//! Runtime orchestration for program execution
//!
//! The Runtime struct coordinates all components:
//! - Program loading and validation
//! - VM for execution
//! - The Cranelift JIT when enabled and supported by the host
//! - Diagnostics for uncaught errors

use std::path::Path;

use bytecode_system::Program;
use core_types::Value;
use interpreter::{RuntimeConfig, TierStats, VM};
use jit_compiler::JitCompiler;
use tracing::{debug, warn};

use crate::diagnostics::format_diagnostic;
use crate::error::{CliError, CliResult};

/// Status of a run that finished normally
pub const EXIT_OK: i32 = 0;
/// Status of a run that ended with an uncaught error
pub const EXIT_UNCAUGHT: i32 = 1;
/// Status of a program that failed validation or could not be loaded
pub const EXIT_INVALID: i32 = 2;

/// Executes programs with one configuration
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    print_bytecode: bool,
    capture: bool,
    output: Vec<String>,
    diagnostic: Option<String>,
    stats: TierStats,
}

impl Runtime {
    /// Create a runtime
    ///
    /// # Example
    /// ```
    /// use interpreter::RuntimeConfig;
    /// use lev_cli::Runtime;
    ///
    /// let runtime = Runtime::new(RuntimeConfig::default());
    /// assert!(runtime.config().jit);
    /// ```
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: config.normalized(),
            print_bytecode: false,
            capture: false,
            output: Vec::new(),
            diagnostic: None,
            stats: TierStats::default(),
        }
    }

    /// Print each function's bytecode before running
    pub fn with_print_bytecode(mut self, enabled: bool) -> Self {
        self.print_bytecode = enabled;
        self
    }

    /// Collect `say` output instead of writing it to stdout
    pub fn with_captured_output(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Effective configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Output of the last run, when captured
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Report of the last failed run
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// Tier transitions of the last run
    pub fn stats(&self) -> TierStats {
        self.stats
    }

    /// Run a program and return the process exit status.
    ///
    /// 0 on success, 1 on an uncaught error, 2 when the program is
    /// invalid. Failures print a diagnostic to stderr.
    ///
    /// # Example
    /// ```
    /// use bytecode_system::{Assembler, Opcode, Program};
    /// use interpreter::RuntimeConfig;
    /// use lev_cli::Runtime;
    ///
    /// let mut main = Assembler::new("<main>", 0, 0);
    /// main.load_int(1);
    /// main.emit(Opcode::Return);
    /// let program = Program::with_entry(main.finish().unwrap());
    ///
    /// let mut runtime = Runtime::new(RuntimeConfig::interpreted());
    /// assert_eq!(runtime.run(program), 0);
    /// ```
    pub fn run(&mut self, program: Program) -> i32 {
        match self.execute(program) {
            Ok(_) => EXIT_OK,
            Err(err) => self.fail(err),
        }
    }

    /// Load a JSON program file and run it; see [`Runtime::run`].
    pub fn run_file(&mut self, path: &Path) -> i32 {
        match load_program(path) {
            Ok(program) => self.run(program),
            Err(err) => self.fail(err),
        }
    }

    /// Run a program and return the value of its entry function
    ///
    /// # Errors
    ///
    /// [`CliError::InvalidProgram`] before anything runs, or
    /// [`CliError::Runtime`] for an uncaught error.
    pub fn execute(&mut self, program: Program) -> CliResult<Value> {
        self.output.clear();
        self.diagnostic = None;
        self.stats = TierStats::default();

        if self.print_bytecode {
            print_program(&program);
        }
        let mut vm = VM::new(program, self.config.clone())?;
        if self.config.jit {
            match JitCompiler::new() {
                Ok(jit) => vm = vm.with_backend(Box::new(jit)),
                Err(reason) => warn!(%reason, "native code unavailable, interpreting"),
            }
        }
        if self.capture {
            vm.capture_output();
        }

        let result = vm.run();
        self.stats = vm.tier_stats();
        self.output = vm.output().to_vec();
        debug!(
            compilations = self.stats.compilations,
            refusals = self.stats.refusals,
            deopts = self.stats.deopts,
            native_entries = vm.native_entries(),
            "program finished"
        );
        Ok(result?)
    }

    fn fail(&mut self, err: CliError) -> i32 {
        let report = match &err {
            CliError::Runtime(runtime) => format_diagnostic(runtime),
            other => format!("error: {other}"),
        };
        eprintln!("{report}");
        self.diagnostic = Some(report);
        err.exit_code()
    }
}

/// Read a program from a JSON file
///
/// # Errors
///
/// I/O and decoding failures.
pub fn load_program(path: &Path) -> CliResult<Program> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Program::from_json(&text).map_err(|source| CliError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn print_program(program: &Program) {
    for (index, function) in program.functions.iter().enumerate() {
        println!(
            "fn#{index} {} (arity {}, locals {})",
            function.name, function.arity, function.local_count
        );
        for (offset, inst) in function.code.iter().enumerate() {
            println!("  {offset:>4}  {:?}", inst.opcode);
        }
    }
}
