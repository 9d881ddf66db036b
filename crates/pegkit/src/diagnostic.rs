//! Human-readable failure reports.
//!
//! This module renders compile and match failures the way Rust's own
//! compiler does: the offending source line, a caret underline at the
//! failure location, and optional notes. The rest of the crate works in
//! byte offsets; the conversion to 1-based line/column happens only here.

use std::fmt;

use crate::error::Error;

/// A byte-offset range `[start, end)` into some source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest span covering both `self` and `other`.
    pub fn cover(&self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Convert a byte offset into a 1-based (line, column) pair.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// A label attached to a span with a message.
#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// A rich diagnostic with source context.
///
/// Built from an [`Error`] plus the text it refers to: the grammar source
/// for compile errors, the matched input for runtime failures.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// The headline message.
    pub message: String,
    /// The source text the labels point into.
    pub source: String,
    /// Labels pointing at specific locations.
    pub labels: Vec<Label>,
    /// Additional notes (e.g. the expected-token set).
    pub notes: Vec<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: String::new(),
            labels: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Set the source text.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a label pointing at `span`.
    pub fn with_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label {
            span,
            message: message.into(),
        });
        self
    }

    /// Add a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Build a diagnostic for a failure, pointing into `source`.
    ///
    /// `source` is the grammar text for `Syntax` errors and the matched
    /// input for everything else.
    pub fn report(err: &Error, source: &str) -> Diagnostic {
        match err {
            Error::Syntax { message, span } => Diagnostic::new(message.clone())
                .with_source(source)
                .with_label(*span, ""),
            Error::Match { position, expected } => {
                let (line, col) = line_col(source, *position);
                let mut d = Diagnostic::new(format!("no match at {line}:{col}"))
                    .with_source(source)
                    .with_label(Span::new(*position, *position + 1), "farthest failure");
                if !expected.is_empty() {
                    d = d.with_note(format!("expected one of: {}", expected.join(", ")));
                }
                d
            }
            Error::Labeled {
                label,
                position,
                recovered,
            } => {
                let (line, col) = line_col(source, *position);
                let mut d = Diagnostic::new(format!("error '{label}' at {line}:{col}"))
                    .with_source(source)
                    .with_label(Span::new(*position, *position + 1), label.clone());
                if *recovered {
                    d = d.with_note("a recovery expression ran but matching still failed");
                }
                d
            }
            other => Diagnostic::new(other.to_string()),
        }
    }

    /// Get the line content for a given line number (1-indexed).
    fn get_line(&self, line_num: usize) -> &str {
        self.source.lines().nth(line_num - 1).unwrap_or("")
    }

    /// Display width needed for line numbers.
    fn line_number_width(&self) -> usize {
        let max_line = self.source.lines().count();
        max_line.to_string().len().max(1)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;

        if self.source.is_empty() || self.labels.is_empty() {
            for note in &self.notes {
                writeln!(f, "  = note: {note}")?;
            }
            return Ok(());
        }

        let width = self.line_number_width();
        writeln!(f, "{:width$} |", "")?;

        for label in &self.labels {
            let (line_num, start_col) = line_col(&self.source, label.span.start);
            let (_, end_col) = line_col(&self.source, label.span.end);
            let line_content = self.get_line(line_num);

            writeln!(f, "{line_num:width$} | {line_content}")?;

            let underline_start = start_col - 1;
            let underline_len = end_col.saturating_sub(start_col).max(1);

            write!(f, "{:width$} | ", "")?;
            write!(f, "{:underline_start$}", "")?;
            for _ in 0..underline_len {
                write!(f, "^")?;
            }
            if !label.message.is_empty() {
                write!(f, " {}", label.message)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "{:width$} |", "")?;

        for note in &self.notes {
            writeln!(f, "  = note: {note}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_is_one_based() {
        let src = "ab\ncd\nef";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 1), (1, 2));
        assert_eq!(line_col(src, 3), (2, 1));
        assert_eq!(line_col(src, 7), (3, 2));
    }

    #[test]
    fn renders_snippet_with_caret() {
        let diag = Diagnostic::new("no match at 1:3")
            .with_source("1+x")
            .with_label(Span::new(2, 3), "farthest failure")
            .with_note("expected one of: '0', '1'");

        let output = diag.to_string();
        assert!(output.contains("error: no match at 1:3"));
        assert!(output.contains("1+x"));
        assert!(output.contains("^ farthest failure"));
        assert!(output.contains("note: expected one of"));
    }

    #[test]
    fn match_report_carries_expected_set() {
        let err = Error::Match {
            position: 0,
            expected: vec!["'a'".into(), "'b'".into()],
        };
        let diag = Diagnostic::report(&err, "c");
        assert!(diag.message.contains("1:1"));
        assert_eq!(diag.notes.len(), 1);
    }
}
