use thiserror::Error;

use crate::diagnostic::Span;

/// Errors produced while compiling a grammar or matching an input.
///
/// Compile-time problems are all `Syntax`; match-time failures split into
/// the ordinary backtracking failure (`Match`), a labeled failure that was
/// thrown and never recovered (`Labeled`), and the two resource-limit
/// failures which are never recoverable (`Timeout`, `StackOverflow`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("syntax error: {message}")]
    Syntax { message: String, span: Span },

    #[error("no match at byte {position}")]
    Match {
        /// Farthest input offset reached by committed consumption.
        position: usize,
        /// Terminals attempted at the farthest failure, rendered as text.
        /// Empty unless `collect_expected` was set.
        expected: Vec<String>,
    },

    #[error("match failed with label '{label}' at byte {position}")]
    Labeled {
        label: String,
        position: usize,
        /// True when a recovery expression ran for this label before the
        /// match ultimately failed.
        recovered: bool,
    },

    #[error("instruction budget of {budget} exhausted")]
    Timeout { budget: u64 },

    #[error("stack depth limit of {limit} exceeded")]
    StackOverflow { limit: usize },

    #[error("malformed bytecode module: {0}")]
    Load(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    /// Convenience constructor used throughout the compiler and parser.
    pub(crate) fn syntax(message: impl Into<String>, span: Span) -> Self {
        Error::Syntax {
            message: message.into(),
            span,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
