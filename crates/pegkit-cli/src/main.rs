//! Command-line front end: compile a grammar, match an input, print the
//! tree. Exit code 0 on a successful match, 1 on a parse failure (with a
//! diagnostic on stderr), 2 on usage or I/O errors.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use pegkit::{Diagnostic, Error, ImportResolver, Options, Peg, Span};

/// Compile a PEG grammar and match an input against it.
#[derive(Parser)]
#[command(name = "pegkit", version, about)]
struct Args {
    /// Grammar file to compile.
    #[arg(short, long)]
    grammar: PathBuf,

    /// Input file to match; stdin when omitted or "-".
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Production to start matching from (default: the grammar's first).
    #[arg(short, long)]
    start: Option<String>,

    /// Disable automatic whitespace handling.
    #[arg(long)]
    no_spaces: bool,

    /// Capture the nodes matched by injected whitespace.
    #[arg(long)]
    capture_spaces: bool,

    /// Inline small definitions (their nodes disappear from the tree).
    #[arg(long)]
    inline: bool,

    /// Match-only mode: report success without building a tree.
    #[arg(long)]
    no_captures: bool,

    /// Abort the match after this many instruction cycles.
    #[arg(long)]
    budget: Option<u64>,

    /// On failure, list the terminals attempted at the failure position.
    #[arg(long)]
    expected: bool,

    /// Print the capture tree as JSON instead of s-expressions.
    #[arg(long)]
    json: bool,

    /// Print the compiled program listing and exit.
    #[arg(long)]
    disassemble: bool,

    /// Write the compiled bytecode module to this path and exit.
    #[arg(long, value_name = "PATH")]
    emit: Option<PathBuf>,
}

/// Resolves `@import` paths relative to the grammar file's directory.
struct FsResolver {
    base: PathBuf,
}

impl ImportResolver for FsResolver {
    fn load(&self, path: &str) -> pegkit::Result<String> {
        fs::read_to_string(self.base.join(path)).map_err(|e| Error::Syntax {
            message: format!("cannot read import \"{path}\": {e}"),
            span: Span::default(),
        })
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("pegkit: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    let source = fs::read_to_string(&args.grammar)
        .with_context(|| format!("cannot read grammar {}", args.grammar.display()))?;
    let resolver = FsResolver {
        base: args
            .grammar
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf(),
    };

    let peg = match Peg::builder()
        .handle_spaces(!args.no_spaces)
        .capture_spaces(args.capture_spaces)
        .inline(args.inline)
        .resolver(&resolver)
        .compile(&source)
    {
        Ok(peg) => peg,
        Err(err) => {
            eprint!("{}", Diagnostic::report(&err, &source));
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(
        "compiled {} into {} instructions",
        args.grammar.display(),
        peg.program().len()
    );

    if args.disassemble {
        print!("{}", peg.program());
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(path) = &args.emit {
        fs::write(path, peg.program().store())
            .with_context(|| format!("cannot write module {}", path.display()))?;
        return Ok(ExitCode::SUCCESS);
    }

    let input = read_input(args.input.as_deref())?;
    let options = Options {
        start: args.start,
        instruction_budget: args.budget,
        collect_expected: args.expected,
        disable_captures: args.no_captures,
        ..Options::default()
    };

    match peg.run_with(&input, &options) {
        Ok(m) => {
            info!("matched {} of {} bytes", m.consumed, input.len());
            if let Some(value) = &m.value {
                if args.json {
                    println!("{}", serde_json::to_string_pretty(value)?);
                } else {
                    println!("{value}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            let text = String::from_utf8_lossy(&input);
            eprint!("{}", Diagnostic::report(&err, &text));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(p) if p.as_os_str() != "-" => {
            fs::read(p).with_context(|| format!("cannot read input {}", p.display()))
        }
        _ => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("cannot read stdin")?;
            Ok(buf)
        }
    }
}
