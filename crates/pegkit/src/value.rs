use std::fmt;

use crate::diagnostic::Span;

/// A node in the tree produced by a successful match.
///
/// Every variant that came out of the string machine carries the span of
/// input bytes it matched. `Nil`, `Bool`, and `Int` are leaves that only
/// appear in trees handed to the list machine, which matches over `Value`
/// trees instead of byte strings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    /// A run of matched bytes (terminal capture).
    Str { text: String, span: Span },
    /// A named production match wrapping its collapsed captures.
    Node {
        name: String,
        inner: Option<Box<Value>>,
        span: Span,
    },
    /// Two or more sibling captures. Never empty and never a singleton;
    /// smaller capture sets collapse (see [`Value::collapse`]).
    List { items: Vec<Value>, span: Span },
    /// A labeled failure that a recovery expression matched past. `inner`
    /// holds whatever the recovery expression captured.
    Error {
        label: String,
        inner: Option<Box<Value>>,
        span: Span,
    },
    Nil,
    Bool(bool),
    Int(i64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str { .. } => "string",
            Value::Node { .. } => "node",
            Value::List { .. } => "list",
            Value::Error { .. } => "error",
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
        }
    }

    /// The input span this value covers. Leaves without provenance report
    /// an empty span.
    pub fn span(&self) -> Span {
        match self {
            Value::Str { span, .. }
            | Value::Node { span, .. }
            | Value::List { span, .. }
            | Value::Error { span, .. } => *span,
            _ => Span::default(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str { text, .. } => Some(text),
            _ => None,
        }
    }

    /// The production name for `Node` values.
    pub fn name(&self) -> Option<&str> {
        match self {
            Value::Node { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Child values, viewed uniformly: a `List` yields its items, other
    /// wrappers yield their single inner value, leaves yield nothing.
    pub fn children(&self) -> &[Value] {
        match self {
            Value::List { items, .. } => items,
            Value::Node { inner: Some(v), .. } | Value::Error { inner: Some(v), .. } => {
                std::slice::from_ref(v)
            }
            _ => &[],
        }
    }

    /// Collapse a capture set into at most one value: empty sets vanish,
    /// singletons stay bare, anything larger becomes a `List`.
    pub fn collapse(mut items: Vec<Value>, span: Span) -> Option<Value> {
        match items.len() {
            0 => None,
            1 => items.pop(),
            _ => Some(Value::List { items, span }),
        }
    }

    /// True if this value or any descendant is an `Error`.
    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    /// Collect every `Error` value in the tree, outermost first.
    pub fn errors(&self) -> Vec<&Value> {
        let mut found = Vec::new();
        self.collect_errors(&mut found);
        found
    }

    fn collect_errors<'a>(&'a self, found: &mut Vec<&'a Value>) {
        if let Value::Error { .. } = self {
            found.push(self);
        }
        let children: &[Value] = match self {
            Value::List { items, .. } => items,
            Value::Node { inner: Some(v), .. } | Value::Error { inner: Some(v), .. } => {
                std::slice::from_ref(v)
            }
            _ => &[],
        };
        for child in children {
            child.collect_errors(found);
        }
    }
}

/// Renders the tree as an s-expression: `(S (A "1") "+" (A "1"))`.
///
/// `List` values splice into their parent's parentheses so the printed
/// shape matches how grammars read.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str { text, span: _ } => write!(f, "{:?}", text),
            Value::Node { name, inner, .. } => {
                write!(f, "({name}")?;
                write_inner(f, inner.as_deref())?;
                write!(f, ")")
            }
            Value::List { items, .. } => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Error { label, inner, .. } => {
                write!(f, "(error^{label}")?;
                write_inner(f, inner.as_deref())?;
                write!(f, ")")
            }
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
        }
    }
}

fn write_inner(f: &mut fmt::Formatter<'_>, inner: Option<&Value>) -> fmt::Result {
    match inner {
        None => Ok(()),
        Some(Value::List { items, .. }) => {
            for item in items {
                write!(f, " {item}")?;
            }
            Ok(())
        }
        Some(v) => write!(f, " {v}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str, start: usize) -> Value {
        Value::Str {
            text: text.to_string(),
            span: Span::new(start, start + text.len()),
        }
    }

    #[test]
    fn collapse_rules() {
        let span = Span::new(0, 2);
        assert_eq!(Value::collapse(vec![], span), None);
        assert_eq!(Value::collapse(vec![s("a", 0)], span), Some(s("a", 0)));
        assert!(matches!(
            Value::collapse(vec![s("a", 0), s("b", 1)], span),
            Some(Value::List { .. })
        ));
    }

    #[test]
    fn display_splices_lists_into_nodes() {
        let tree = Value::Node {
            name: "S".to_string(),
            inner: Some(Box::new(Value::List {
                items: vec![s("1", 0), s("+", 1), s("1", 2)],
                span: Span::new(0, 3),
            })),
            span: Span::new(0, 3),
        };
        assert_eq!(tree.to_string(), r#"(S "1" "+" "1")"#);
    }

    #[test]
    fn errors_are_collected_depth_first() {
        let tree = Value::Node {
            name: "S".to_string(),
            inner: Some(Box::new(Value::Error {
                label: "missing".to_string(),
                inner: None,
                span: Span::new(2, 2),
            })),
            span: Span::new(0, 2),
        };
        assert!(tree.has_errors());
        assert_eq!(tree.errors().len(), 1);
    }
}
