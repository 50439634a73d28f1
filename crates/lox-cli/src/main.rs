//! Thin front end over the `lox` library: argument parsing, stdio wiring,
//! and process exit codes. No language logic lives here.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lox::{GcConfig, LoxError, NoopTracer, TracingTracer, Vm};

/// A single-pass bytecode compiler and stack-based VM for Lox.
#[derive(Parser, Debug)]
#[command(name = "loxc", version, about)]
struct Args {
    /// Script file to execute. Ignored if `-c`/`--command` is given.
    file: Option<PathBuf>,

    /// Execute inline source instead of reading a file.
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Run a full collection before every allocation.
    #[arg(long)]
    stress_gc: bool,

    /// Floor for the collector's initial `next_gc` threshold, in bytes.
    #[arg(long, default_value_t = GcConfig::default().initial_threshold)]
    gc_initial_collection_threshold: usize,

    /// Trace every dispatched instruction and GC run on stderr.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let source = match read_source(&args) {
        Ok(source) => source,
        Err(message) => {
            eprintln!("loxc: {message}");
            return ExitCode::from(66); // EX_NOINPUT
        }
    };

    let config = GcConfig { stress_gc: args.stress_gc, initial_threshold: args.gc_initial_collection_threshold };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let result = run(&source, &mut out, config, args.verbose);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(u8::try_from(err.exit_code()).expect("exit codes fit in a byte"))
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "lox=trace" } else { "lox=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();
}

fn read_source(args: &Args) -> Result<String, String> {
    if let Some(command) = &args.command {
        return Ok(command.clone());
    }
    match &args.file {
        Some(path) => std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display())),
        None => Err("expected a script file or -c/--command".to_string()),
    }
}

fn run(source: &str, out: &mut dyn Write, config: GcConfig, verbose: bool) -> Result<(), LoxError> {
    if verbose {
        let mut vm = Vm::with_tracer(config, TracingTracer);
        let function = vm.compile(source)?;
        vm.interpret(function, out)
    } else {
        let mut vm: Vm<NoopTracer> = Vm::new(config);
        let function = vm.compile(source)?;
        vm.interpret(function, out)
    }
}
