//! `lox [path]` — REPL when no path is given, file runner otherwise.
//!
//! Exit codes: `0` success, `64` usage error, `65` compile error, `70`
//! runtime error.

use clap::Parser;
use lox_cli::config::Config;
use lox_runtime::{InterpretOutcome, Vm};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A bytecode interpreter for Lox", long_about = None)]
struct Args {
    /// Script to run. Omit to start the REPL.
    file: Option<PathBuf>,

    /// Anything past the first positional is a usage error, not extra scripts.
    #[arg(trailing_var_arg = true, hide = true)]
    extra: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    let config = Config::from_env();
    tracing::debug!(?config, "startup config");

    if !args.extra.is_empty() {
        eprintln!("Usage: lox [path]");
        return ExitCode::from(64);
    }

    let mut vm = Vm::new();
    lox_cli::install_natives(&mut vm);

    let outcome = match args.file {
        Some(path) => lox_cli::run_file(&mut vm, &path),
        None => {
            lox_cli::repl::run(&mut vm);
            InterpretOutcome::Ok
        }
    };

    ExitCode::from(lox_cli::exit_code_for(&outcome) as u8)
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOX_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
