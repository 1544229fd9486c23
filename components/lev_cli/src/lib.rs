//! Levython VM command line library
//!
//! Provides the [`Runtime`] facade that validates and runs bytecode
//! programs, reporting uncaught errors with a traceback, and the argument
//! and configuration handling of the `levython-vm` binary.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod diagnostics;
pub mod error;
pub mod runtime;

pub use cli::{init_logging, load_config, Cli};
pub use diagnostics::format_diagnostic;
pub use error::{CliError, CliResult};
pub use runtime::{load_program, Runtime, EXIT_INVALID, EXIT_OK, EXIT_UNCAUGHT};
