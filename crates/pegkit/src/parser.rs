//! Recursive-descent parser for grammar source files.
//!
//! The metagrammar is fixed: productions `Name <- Expr`, ordered choice
//! `/`, juxtaposed sequences, prefix `&` `!` `#`, suffix `?` `*` `+` and
//! `^label`, atoms (identifier, quoted literal, class, `.`, parenthesized
//! group, `{ … }` list pattern), `//` line comments, and
//! `@import A, B from "path"` headers. The parser works on raw bytes so
//! literals can hold arbitrary `\xHH` escapes.

use crate::ast::{ClassItem, Definition, Expr, Grammar, Import};
use crate::diagnostic::Span;
use crate::error::{Error, Result};

/// Parse a grammar source file into its AST.
pub fn parse(source: &str) -> Result<Grammar> {
    Parser::new(source).grammar()
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Low-level cursor
    // -----------------------------------------------------------------------

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    fn here(&self) -> Span {
        Span::new(self.pos, self.pos + 1)
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::syntax(message, self.here())
    }

    /// Skip whitespace and `//` comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.pos += 1;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Grammar structure
    // -----------------------------------------------------------------------

    fn grammar(&mut self) -> Result<Grammar> {
        let start = self.pos;
        let mut imports = Vec::new();
        let mut defs = Vec::new();

        self.skip_trivia();
        while self.peek() == Some(b'@') {
            imports.push(self.import()?);
            self.skip_trivia();
        }

        while self.peek().is_some() {
            defs.push(self.definition()?);
            self.skip_trivia();
        }

        if defs.is_empty() {
            return Err(Error::syntax(
                "grammar has no definitions",
                Span::new(start, self.pos),
            ));
        }

        Ok(Grammar {
            imports,
            defs,
            span: Span::new(start, self.pos),
        })
    }

    fn import(&mut self) -> Result<Import> {
        let start = self.pos;
        self.expect(b'@')?;
        let keyword = self.identifier()?;
        if keyword != "import" {
            return Err(Error::syntax(
                format!("unknown directive '@{keyword}'"),
                Span::new(start, self.pos),
            ));
        }

        let mut names = Vec::new();
        self.skip_trivia();
        names.push(self.identifier()?);
        self.skip_trivia();
        while self.eat(b',') {
            self.skip_trivia();
            names.push(self.identifier()?);
            self.skip_trivia();
        }

        let keyword = self.identifier()?;
        if keyword != "from" {
            return Err(self.error("expected 'from' in @import"));
        }
        self.skip_trivia();
        let (path, _) = self.literal_bytes()?;
        let path = String::from_utf8(path)
            .map_err(|_| Error::syntax("import path is not valid UTF-8", self.here()))?;

        Ok(Import {
            names,
            from: path,
            span: Span::new(start, self.pos),
        })
    }

    fn definition(&mut self) -> Result<Definition> {
        let start = self.pos;
        let name = self.identifier()?;
        self.skip_trivia();
        if !(self.eat(b'<') && self.eat(b'-')) {
            return Err(self.error(format!("expected '<-' after '{name}'")));
        }
        let expr = self.choice()?;
        Ok(Definition {
            name,
            expr,
            span: Span::new(start, self.pos),
        })
    }

    // -----------------------------------------------------------------------
    // Expressions, lowest to highest precedence
    // -----------------------------------------------------------------------

    fn choice(&mut self) -> Result<Expr> {
        let start = self.pos;
        let first = self.sequence()?;
        self.skip_trivia();
        if self.peek() != Some(b'/') {
            return Ok(first);
        }

        let mut items = vec![first];
        while self.eat(b'/') {
            items.push(self.sequence()?);
            self.skip_trivia();
        }
        Ok(Expr::Choice {
            items,
            span: Span::new(start, self.pos),
        })
    }

    fn sequence(&mut self) -> Result<Expr> {
        self.skip_trivia();
        let start = self.pos;
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if !self.at_sequence_item() {
                break;
            }
            items.push(self.prefixed()?);
        }
        if items.len() == 1 {
            Ok(items.remove(0))
        } else {
            Ok(Expr::Sequence {
                items,
                span: Span::new(start, self.pos),
            })
        }
    }

    /// Would the next token begin a sequence item?
    ///
    /// An identifier followed by `<-` is the next definition's head, not a
    /// reference, so it ends the current sequence.
    fn at_sequence_item(&self) -> bool {
        match self.peek() {
            Some(b'&' | b'!' | b'#' | b'(' | b'{' | b'\'' | b'"' | b'[' | b'.') => true,
            Some(b) if is_ident_start(b) => !self.ident_is_definition_head(),
            _ => false,
        }
    }

    fn ident_is_definition_head(&self) -> bool {
        let mut i = self.pos;
        while i < self.src.len() && is_ident_continue(self.src[i]) {
            i += 1;
        }
        // Skip trivia between the identifier and a possible arrow.
        loop {
            match self.src.get(i) {
                Some(b' ' | b'\t' | b'\r' | b'\n') => i += 1,
                Some(b'/') if self.src.get(i + 1) == Some(&b'/') => {
                    while i < self.src.len() && self.src[i] != b'\n' {
                        i += 1;
                    }
                }
                _ => break,
            }
        }
        self.src.get(i) == Some(&b'<') && self.src.get(i + 1) == Some(&b'-')
    }

    fn prefixed(&mut self) -> Result<Expr> {
        let start = self.pos;
        match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                let expr = Box::new(self.prefixed()?);
                Ok(Expr::And {
                    expr,
                    span: Span::new(start, self.pos),
                })
            }
            Some(b'!') => {
                self.pos += 1;
                let expr = Box::new(self.prefixed()?);
                Ok(Expr::Not {
                    expr,
                    span: Span::new(start, self.pos),
                })
            }
            Some(b'#') => {
                self.pos += 1;
                let expr = Box::new(self.prefixed()?);
                Ok(Expr::Lex {
                    expr,
                    span: Span::new(start, self.pos),
                })
            }
            _ => self.suffixed(),
        }
    }

    fn suffixed(&mut self) -> Result<Expr> {
        let start = self.pos;
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(b'?') => {
                    self.pos += 1;
                    expr = Expr::Optional {
                        expr: Box::new(expr),
                        span: Span::new(start, self.pos),
                    };
                }
                Some(b'*') => {
                    self.pos += 1;
                    expr = Expr::ZeroOrMore {
                        expr: Box::new(expr),
                        span: Span::new(start, self.pos),
                    };
                }
                Some(b'+') => {
                    self.pos += 1;
                    expr = Expr::OneOrMore {
                        expr: Box::new(expr),
                        span: Span::new(start, self.pos),
                    };
                }
                Some(b'^') => {
                    self.pos += 1;
                    // The label must hug the caret; `x^ y` is an
                    // auto-labeled x followed by y.
                    let label = match self.peek() {
                        Some(b) if is_ident_start(b) => Some(self.identifier()?),
                        _ => None,
                    };
                    expr = Expr::Labeled {
                        expr: Box::new(expr),
                        label,
                        span: Span::new(start, self.pos),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        let start = self.pos;
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let expr = self.choice()?;
                self.skip_trivia();
                self.expect(b')')?;
                Ok(expr)
            }
            Some(b'{') => {
                self.pos += 1;
                self.skip_trivia();
                let expr = if self.peek() == Some(b'}') {
                    Expr::empty(Span::new(self.pos, self.pos))
                } else {
                    self.choice()?
                };
                self.skip_trivia();
                self.expect(b'}')?;
                Ok(Expr::ListPat {
                    expr: Box::new(expr),
                    span: Span::new(start, self.pos),
                })
            }
            Some(b'\'' | b'"') => {
                let (bytes, span) = self.literal_bytes()?;
                Ok(Expr::Literal { bytes, span })
            }
            Some(b'[') => self.class(),
            Some(b'.') => {
                self.pos += 1;
                Ok(Expr::Any {
                    span: Span::new(start, self.pos),
                })
            }
            Some(b) if is_ident_start(b) => {
                let name = self.identifier()?;
                Ok(Expr::Identifier {
                    name,
                    span: Span::new(start, self.pos),
                })
            }
            Some(b) => Err(self.error(format!("unexpected character '{}'", b as char))),
            None => Err(self.error("unexpected end of grammar")),
        }
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    fn identifier(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(b) if is_ident_start(b) => self.pos += 1,
            _ => return Err(self.error("expected identifier")),
        }
        while let Some(b) = self.peek() {
            if is_ident_continue(b) {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    /// A single- or double-quoted literal, unescaped to raw bytes.
    fn literal_bytes(&mut self) -> Result<(Vec<u8>, Span)> {
        let start = self.pos;
        let quote = self
            .bump()
            .filter(|b| *b == b'\'' || *b == b'"')
            .ok_or_else(|| self.error("expected string literal"))?;

        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None => {
                    return Err(Error::syntax(
                        "unterminated string literal",
                        Span::new(start, self.pos),
                    ));
                }
                Some(b) if b == quote => break,
                Some(b'\\') => bytes.push(self.escape()?),
                Some(b) => bytes.push(b),
            }
        }
        Ok((bytes, Span::new(start, self.pos)))
    }

    /// The byte named by an escape sequence, cursor already past the `\`.
    fn escape(&mut self) -> Result<u8> {
        match self.bump() {
            Some(b'n') => Ok(b'\n'),
            Some(b'r') => Ok(b'\r'),
            Some(b't') => Ok(b'\t'),
            Some(b @ (b'"' | b'\'' | b'\\' | b'[' | b']' | b'-')) => Ok(b),
            Some(b'x') => {
                let hi = self.hex_digit()?;
                let lo = self.hex_digit()?;
                Ok(hi * 16 + lo)
            }
            Some(b) => Err(self.error(format!("unknown escape '\\{}'", b as char))),
            None => Err(self.error("unterminated escape")),
        }
    }

    fn hex_digit(&mut self) -> Result<u8> {
        match self.bump() {
            Some(b @ b'0'..=b'9') => Ok(b - b'0'),
            Some(b @ b'a'..=b'f') => Ok(b - b'a' + 10),
            Some(b @ b'A'..=b'F') => Ok(b - b'A' + 10),
            _ => Err(self.error("expected hex digit in \\xHH escape")),
        }
    }

    fn class(&mut self) -> Result<Expr> {
        let start = self.pos;
        self.expect(b'[')?;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(Error::syntax(
                        "unterminated character class",
                        Span::new(start, self.pos),
                    ));
                }
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    let lo = self.class_byte()?;
                    if self.peek() == Some(b'-') && self.peek_at(1) != Some(b']') {
                        self.pos += 1;
                        let hi = self.class_byte()?;
                        if lo > hi {
                            return Err(Error::syntax(
                                "class range out of order",
                                Span::new(start, self.pos),
                            ));
                        }
                        items.push(ClassItem::Range(lo, hi));
                    } else {
                        items.push(ClassItem::Single(lo));
                    }
                }
            }
        }
        if items.is_empty() {
            return Err(Error::syntax(
                "empty character class",
                Span::new(start, self.pos),
            ));
        }
        Ok(Expr::Class {
            items,
            span: Span::new(start, self.pos),
        })
    }

    fn class_byte(&mut self) -> Result<u8> {
        match self.bump() {
            Some(b'\\') => self.escape(),
            Some(b) => Ok(b),
            None => Err(self.error("unterminated character class")),
        }
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(g: &Grammar, i: usize) -> &Definition {
        &g.defs[i]
    }

    #[test]
    fn parses_simple_productions() {
        let g = parse("S <- A '+' A\nA <- '0' / '1'\n").unwrap();
        assert_eq!(g.defs.len(), 2);
        assert_eq!(def(&g, 0).name, "S");
        assert!(matches!(def(&g, 0).expr, Expr::Sequence { ref items, .. } if items.len() == 3));
        assert!(matches!(def(&g, 1).expr, Expr::Choice { ref items, .. } if items.len() == 2));
    }

    #[test]
    fn identifier_before_arrow_ends_a_sequence() {
        let g = parse("S <- A B\nB <- 'b'\nA <- 'a'").unwrap();
        assert_eq!(g.defs.len(), 3);
        let Expr::Sequence { items, .. } = &def(&g, 0).expr else {
            panic!("expected sequence");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn precedence_suffix_binds_tighter_than_prefix() {
        let g = parse("S <- !'a'*").unwrap();
        let Expr::Not { expr, .. } = &def(&g, 0).expr else {
            panic!("expected not");
        };
        assert!(matches!(**expr, Expr::ZeroOrMore { .. }));
    }

    #[test]
    fn lex_wraps_labeled_suffix() {
        let g = parse("Ordinal <- Decimal #('st' / 'th')^ord\nDecimal <- [0-9]+").unwrap();
        let Expr::Sequence { items, .. } = &def(&g, 0).expr else {
            panic!("expected sequence");
        };
        let Expr::Lex { expr, .. } = &items[1] else {
            panic!("expected lex");
        };
        assert!(
            matches!(&**expr, Expr::Labeled { label: Some(l), .. } if l == "ord"),
            "got {expr:?}"
        );
    }

    #[test]
    fn bare_caret_takes_no_label_across_space() {
        let g = parse("If <- 'if' LPAR^ Expr\nLPAR <- '('\nExpr <- 'x'").unwrap();
        let Expr::Sequence { items, .. } = &def(&g, 0).expr else {
            panic!("expected sequence");
        };
        assert!(matches!(&items[1], Expr::Labeled { label: None, .. }));
        assert!(matches!(&items[2], Expr::Identifier { name, .. } if name == "Expr"));
    }

    #[test]
    fn escapes_and_hex_in_literals() {
        let g = parse(r#"S <- '\n\t\\\x41\]'"#).unwrap();
        let Expr::Literal { bytes, .. } = &def(&g, 0).expr else {
            panic!("expected literal");
        };
        assert_eq!(bytes, &[b'\n', b'\t', b'\\', b'A', b']']);
    }

    #[test]
    fn classes_with_ranges_singletons_and_escaped_dash() {
        let g = parse(r"S <- [a-z0-9_\-]").unwrap();
        let Expr::Class { items, .. } = &def(&g, 0).expr else {
            panic!("expected class");
        };
        assert_eq!(
            items,
            &[
                ClassItem::Range(b'a', b'z'),
                ClassItem::Range(b'0', b'9'),
                ClassItem::Single(b'_'),
                ClassItem::Single(b'-'),
            ]
        );
    }

    #[test]
    fn comments_are_trivia() {
        let g = parse("// grammar\nS <- 'a' // trailing\n// done\n").unwrap();
        assert_eq!(g.defs.len(), 1);
    }

    #[test]
    fn imports_with_multiple_names() {
        let g = parse("@import Expr, Term from \"exprs.peg\"\nS <- Expr").unwrap();
        assert_eq!(g.imports.len(), 1);
        assert_eq!(g.imports[0].names, vec!["Expr", "Term"]);
        assert_eq!(g.imports[0].from, "exprs.peg");
    }

    #[test]
    fn list_patterns() {
        let g = parse("S <- { 'Prog' { 'Stmt' . }* }").unwrap();
        assert!(matches!(def(&g, 0).expr, Expr::ListPat { .. }));
    }

    #[test]
    fn empty_choice_alternative_is_allowed() {
        let g = parse("S <- 'a' / ").unwrap();
        let Expr::Choice { items, .. } = &def(&g, 0).expr else {
            panic!("expected choice");
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Expr::Sequence { items, .. } if items.is_empty()));
    }

    #[test]
    fn error_positions_point_at_the_problem() {
        let err = parse("S <- 'a\n").unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }));
        let err = parse("S <- @").unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }));
        let err = parse("").unwrap_err();
        assert!(matches!(err, Error::Syntax { .. }));
    }
}
