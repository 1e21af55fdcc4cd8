//! Quill CLI
//!
//! Run scripts, start a REPL, or inspect compiled bytecode:
//!
//! ```text
//! quill run program.quill     # execute a script
//! quill                       # interactive session (also: quill repl)
//! quill dis program.quill     # compile and print the bytecode
//! quill completions zsh       # shell completion scripts
//! ```
//!
//! Exit codes follow the sysexits convention: 65 for a compile error, 70
//! for a runtime error, 74 when the input file cannot be read.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use quill_runtime::{InterpretError, Vm};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "quill")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Quill interpreter - run scripts or start a REPL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a .quill script
    Run {
        /// Input source file
        input: PathBuf,
    },

    /// Start an interactive session
    Repl,

    /// Compile a script and print its bytecode
    Dis {
        /// Input source file
        input: PathBuf,
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
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run { input }) => run_file(&input),
        Some(Commands::Dis { input }) => disassemble_file(&input),
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
        Some(Commands::Repl) | None => repl(),
    }
}

fn read_source(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read '{}': {err}", path.display());
            process::exit(74);
        }
    }
}

fn run_file(path: &Path) {
    let source = read_source(path);
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile) => process::exit(65),
        Err(InterpretError::Runtime) => process::exit(70),
    }
}

fn disassemble_file(path: &Path) {
    let source = read_source(path);
    if quill_runtime::disassemble_source(&source).is_err() {
        process::exit(65);
    }
}

/// One VM for the whole session, so globals persist from line to line.
/// Errors are already reported on stderr; the loop just keeps going.
fn repl() {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not start line editor: {err}");
            process::exit(74);
        }
    };

    let mut vm = Vm::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                let _ = vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        }
    }
}
