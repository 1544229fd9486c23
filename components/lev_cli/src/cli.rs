//! Command line interface

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use interpreter::RuntimeConfig;
use tracing_subscriber::EnvFilter;

use crate::error::{CliError, CliResult};

/// Levython bytecode VM
#[derive(Debug, Parser)]
#[command(name = "levython-vm", version, about = "Run Levython bytecode programs")]
pub struct Cli {
    /// Bytecode program (JSON)
    pub program: PathBuf,

    /// TOML file with runtime settings
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interpret only
    #[arg(long)]
    pub no_jit: bool,

    /// Calls before a function is compiled
    #[arg(long)]
    pub call_threshold: Option<u64>,

    /// Loop iterations before a loop is compiled
    #[arg(long)]
    pub loop_threshold: Option<u64>,

    /// Guard failures before a region stops speculating
    #[arg(long)]
    pub max_deopts: Option<u32>,

    /// Callees a call-site cache holds before going megamorphic
    #[arg(long)]
    pub ic_limit: Option<usize>,

    /// Largest region, in instructions, the JIT accepts
    #[arg(long)]
    pub max_region_size: Option<usize>,

    /// Deepest call stack before `RecursionError`
    #[arg(long)]
    pub max_call_depth: Option<usize>,

    /// Print bytecode before running
    #[arg(long)]
    pub print_bytecode: bool,

    /// More logging (-v debug, -vv trace); overrides RUST_LOG
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Configuration file values with command line overrides applied
    ///
    /// # Errors
    ///
    /// An unreadable or malformed configuration file.
    pub fn runtime_config(&self) -> CliResult<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => RuntimeConfig::default(),
        };
        if self.no_jit {
            config.jit = false;
        }
        if let Some(threshold) = self.call_threshold {
            config.call_threshold = threshold;
        }
        if let Some(threshold) = self.loop_threshold {
            config.loop_threshold = threshold;
        }
        if let Some(max) = self.max_deopts {
            config.max_deopts = max;
        }
        if let Some(limit) = self.ic_limit {
            config.ic_polymorphic_limit = limit;
        }
        if let Some(size) = self.max_region_size {
            config.max_region_size = size;
        }
        if let Some(depth) = self.max_call_depth {
            config.max_call_depth = depth;
        }
        Ok(config.normalized())
    }
}

/// Read a `RuntimeConfig` from TOML; missing keys keep their defaults.
///
/// # Errors
///
/// I/O failures and unknown or mistyped keys.
pub fn load_config(path: &Path) -> CliResult<RuntimeConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| CliError::Config {
        path: path.to_path_buf(),
        source,
    })
}

/// Install the stderr log subscriber.
///
/// `RUST_LOG` applies unless `verbose` asks for more; the fallback is
/// `warn`.
pub fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    // A subscriber installed by an embedding host wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
