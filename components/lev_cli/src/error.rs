//! Error types for the CLI

use std::path::PathBuf;

use bytecode_system::ProgramError;
use core_types::RuntimeError;
use thiserror::Error;

/// CLI-specific errors
#[derive(Debug, Error)]
pub enum CliError {
    /// Uncaught error while running the program
    #[error("{0}")]
    Runtime(RuntimeError),

    /// Bytecode failed validation
    #[error("invalid program: {0}")]
    InvalidProgram(#[from] ProgramError),

    /// Program file is not valid bytecode JSON
    #[error("cannot decode {path}: {source}")]
    Decode {
        /// File that was read
        path: PathBuf,
        /// JSON error
        source: serde_json::Error,
    },

    /// Configuration file could not be parsed
    #[error("bad configuration in {path}: {source}")]
    Config {
        /// File that was read
        path: PathBuf,
        /// TOML error
        source: toml::de::Error,
    },

    /// File I/O error
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that was accessed
        path: PathBuf,
        /// OS error
        source: std::io::Error,
    },
}

impl CliError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Runtime(_) => 1,
            _ => 2,
        }
    }
}

impl From<RuntimeError> for CliError {
    fn from(err: RuntimeError) -> Self {
        CliError::Runtime(err)
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
