//! Levython VM
//!
//! Entry point of the `levython-vm` binary. Parses CLI arguments and
//! delegates to the Runtime for execution.

use clap::Parser as ClapParser;
use lev_cli::{init_logging, Cli, Runtime, EXIT_INVALID};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match cli.runtime_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_INVALID);
        }
    };

    let mut runtime = Runtime::new(config).with_print_bytecode(cli.print_bytecode);
    let status = runtime.run_file(&cli.program);
    std::process::exit(status);
}
