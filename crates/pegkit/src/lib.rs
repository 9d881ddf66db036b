//! pegkit: a PEG parser generator with a compact bytecode parsing machine.
//!
//! A grammar source file is compiled to a flat program of fixed-width
//! instruction words; a small virtual machine executes that program
//! against a byte slice and produces either a tree of values tagged by
//! production names, or a failure located at the farthest point the match
//! reached.
//!
//! # Quick start
//!
//! ```
//! use pegkit::Peg;
//!
//! let peg = Peg::compile("Greeting <- 'hello' / 'hi'").unwrap();
//! let m = peg.run(b"hello world").unwrap();
//! assert_eq!(m.consumed, 5);
//! ```
//!
//! # Grammar syntax
//!
//! - Productions: `Name <- Expr`; the first production is the default
//!   start symbol.
//! - Ordered choice `a / b`, sequences by juxtaposition.
//! - Prefixes: `&e` (and-predicate), `!e` (not-predicate), `#e`
//!   (lexification: no automatic whitespace inside).
//! - Suffixes: `e?`, `e*`, `e+`, and `e^label` for labeled failures.
//! - Atoms: identifiers, `'single'` or `"double"` quoted literals with
//!   `\n \r \t \\ \' \" \[ \] \-` and `\xHH` escapes, classes `[a-z0-9_]`,
//!   the any-byte dot `.`, groups `( … )`, and list patterns `{ … }`.
//! - `// comments` run to end of line; `@import A, B from "path"` pulls
//!   productions from another grammar file.
//!
//! # Automatic whitespace
//!
//! Productions whose expansion reaches another production are *non-
//! syntactic*: the compiler inserts a call to `Spacing` before every
//! element of their sequences, so `S <- A '+' A` matches `1 + 1`.
//! Terminal-only productions and anything under `#e` are left alone.
//! Define your own `Spacing` production to change what gets skipped.
//!
//! # Labeled failures and recovery
//!
//! `e^label` turns e's failure into a non-backtracking failure carrying
//! `label`. If the grammar defines a production with the label's name, it
//! runs as a recovery expression: it advances the cursor to a
//! re-synchronization point, the skipped region shows up in the tree as an
//! error value, and matching continues.
//!
//! # Matching trees
//!
//! Grammars written with `{ … }` patterns run on the list machine against
//! a previously produced [`Value`] tree instead of bytes, so tree checks
//! and transformations use the same grammar formalism.
//!
//! # Limits
//!
//! A match can be bounded by an instruction budget and a stack-depth cap
//! via [`Options`]; exceeding either aborts with an error. Left-recursive
//! grammars and repetitions over nullable bodies are rejected at compile
//! time, so matches always terminate.

pub mod ast;

mod bytecode;
mod charset;
mod compiler;
mod diagnostic;
mod error;
mod listvm;
mod parser;
mod peg;
mod symbols;
mod value;
mod vm;

pub use bytecode::{Instr, Opcode, Program};
pub use charset::Charset;
pub use compiler::{Compiler, CompilerConfig, ImportResolver, SPACING};
pub use diagnostic::{Diagnostic, Label, Span, line_col};
pub use error::{Error, Result};
pub use listvm::ListVm;
pub use parser::parse;
pub use peg::{Peg, PegBuilder};
pub use symbols::SymbolTable;
pub use value::Value;
pub use vm::{Match, Options, Vm};
