//! `ember` — the command-line entry point: a file runner when given a
//! script path, a minimal line-at-a-time REPL otherwise.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ember_vm::{Config, InterpretError, Vm};
use serde::Deserialize;

const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_INTERNAL: u8 = 71;
const EXIT_IO_ERROR: u8 = 74;

#[derive(Parser)]
#[command(name = "ember")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ember language interpreter", long_about = None)]
struct Args {
    /// Script to run. Omit to start the REPL.
    path: Option<PathBuf>,

    /// Collect on every allocation instead of waiting for the threshold.
    #[arg(long)]
    stress_gc: bool,

    /// Raise the tracing filter to debug.
    #[arg(short, long)]
    verbose: bool,
}

/// Fields an `ember.toml` in the working directory may override; anything
/// absent falls back to [`Config::default`].
#[derive(Deserialize, Default)]
struct FileConfig {
    stress_gc: Option<bool>,
    gc_initial_threshold: Option<usize>,
    gc_growth_factor: Option<usize>,
}

fn load_file_config() -> FileConfig {
    match std::fs::read_to_string("ember.toml") {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            eprintln!("warning: ignoring malformed ember.toml: {e}");
            FileConfig::default()
        }),
        Err(_) => FileConfig::default(),
    }
}

fn build_config(args: &Args) -> Config {
    let file_config = load_file_config();
    let mut config = Config::default();
    if let Some(threshold) = file_config.gc_initial_threshold {
        config.gc_initial_threshold = threshold;
    }
    if let Some(factor) = file_config.gc_growth_factor {
        config.gc_growth_factor = factor;
    }
    config.stress_gc = args.stress_gc || file_config.stress_gc.unwrap_or(false);
    config
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "ember=debug" } else { "ember=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_directive.parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp
            || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            print!("{e}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprint!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    init_logging(args.verbose);
    let config = build_config(&args);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match &args.path {
        Some(path) => run_file(path, config),
        None => run_repl(config),
    }));
    match outcome {
        Ok(code) => code,
        Err(_) => {
            eprintln!("internal error: the interpreter panicked");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

fn run_file(path: &std::path::Path, config: Config) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Could not read '{}': {e}", path.display());
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };

    let module_name = path.to_string_lossy();
    let mut vm = Vm::new(config);
    match vm.interpret(&source, &module_name) {
        Ok(_) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(errors)) => {
            for e in errors {
                eprintln!("{}", e.message);
            }
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        Err(InterpretError::Runtime(e)) => {
            eprint!("{e}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn run_repl(config: Config) -> ExitCode {
    let mut vm = Vm::new(config);
    let stdin = std::io::stdin();
    let mut line_no = 0usize;
    loop {
        print!("> ");
        if std::io::stdout().flush().is_err() {
            return ExitCode::from(EXIT_IO_ERROR);
        }

        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("input error: {e}");
                return ExitCode::from(EXIT_IO_ERROR);
            }
        }

        if line.trim().is_empty() {
            continue;
        }
        line_no += 1;
        let module_name = format!("<repl:{line_no}>");
        match vm.interpret(&line, &module_name) {
            Ok(value) => {
                if !value.is_nil() {
                    println!("{}", ember_vm::natives::display_string(vm.heap(), value));
                }
            }
            Err(InterpretError::Compile(errors)) => {
                for e in errors {
                    eprintln!("{}", e.message);
                }
            }
            Err(InterpretError::Runtime(e)) => eprint!("{e}"),
        }
    }
}
