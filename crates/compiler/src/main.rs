//! Shannon CLI.
//!
//! Compiles and runs `.shn` programs. The process exit code follows the
//! program's conventional `result` variable: 0 for void, the ordinal value
//! for ordinals, 102 for strings (printed to stderr), 103 for anything
//! else; 101 for uncaught runtime errors, 1 for compile errors.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use shannon_runtime::Variant;
use shannonc::{CompilerOptions, Context, ShannonError};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "shannon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Shannon - compile and run .shn programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a .shn program
    Run {
        /// Input .shn source file
        input: PathBuf,

        /// Options file (TOML)
        #[arg(long)]
        options: Option<PathBuf>,

        /// Write a bytecode listing (.lst) next to the source
        #[arg(long)]
        listing: bool,

        /// Strip assert statements
        #[arg(long)]
        no_assert: bool,

        /// Strip dump statements
        #[arg(long)]
        no_dump: bool,

        /// Extra directories searched for 'uses' imports
        #[arg(long = "module-path", value_name = "DIR")]
        module_path: Vec<PathBuf>,

        /// Interpreter stack depth
        #[arg(long)]
        stack_size: Option<usize>,
    },

    /// Compile a .shn program without running it
    Check {
        /// Input .shn source file
        input: PathBuf,

        /// Options file (TOML)
        #[arg(long)]
        options: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            input,
            options,
            listing,
            no_assert,
            no_dump,
            module_path,
            stack_size,
        } => {
            let mut opts = load_options(options);
            opts.listing |= listing;
            if no_assert {
                opts.enable_assert = false;
            }
            if no_dump {
                opts.enable_dump = false;
            }
            if let Some(size) = stack_size {
                opts.stack_size = size;
            }
            for dir in module_path {
                opts.module_path.push(dir.display().to_string());
            }
            if let Some(parent) = input.parent() {
                let dir = parent.display().to_string();
                if !dir.is_empty() {
                    opts.module_path.push(dir);
                }
            }

            let mut ctx = Context::new(opts);
            match ctx.execute(&input) {
                Ok(result) => process::exit(exit_code_for(&result)),
                Err(e) => exit_with_error(e),
            }
        }

        Commands::Check { input, options } => {
            let mut ctx = Context::new(load_options(options));
            match ctx.load_module(&input) {
                Ok(_) => {
                    println!("OK");
                }
                Err(e) => exit_with_error(e),
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}

fn load_options(path: Option<PathBuf>) -> CompilerOptions {
    match path {
        Some(p) => match CompilerOptions::from_path(&p) {
            Ok(opts) => opts,
            Err(msg) => {
                eprintln!("{}", msg);
                process::exit(1);
            }
        },
        None => CompilerOptions::default(),
    }
}

/// The conventional result-to-exit-code mapping.
fn exit_code_for(result: &Variant) -> i32 {
    match result {
        Variant::Void => 0,
        Variant::Ord(v) => *v as i32,
        Variant::Str(s) => {
            eprintln!("{}", s);
            102
        }
        _ => 103,
    }
}

fn exit_with_error(e: ShannonError) -> ! {
    match e {
        ShannonError::Runtime(err) => {
            eprintln!("Error: {}", err);
            process::exit(101);
        }
        other => {
            eprintln!("{}", other);
            process::exit(1);
        }
    }
}
