use pegkit::{Options, Peg, Span, Value};

/// The tree `(Prog (Stmt "x") (Stmt "y"))`, built by hand the way the
/// string machine would have produced it.
fn prog_tree() -> Value {
    let stmt = |text: &str, at: usize| Value::Node {
        name: "Stmt".to_string(),
        inner: Some(Box::new(Value::Str {
            text: text.to_string(),
            span: Span::new(at, at + 1),
        })),
        span: Span::new(at, at + 1),
    };
    Value::Node {
        name: "Prog".to_string(),
        inner: Some(Box::new(Value::List {
            items: vec![stmt("x", 0), stmt("y", 1)],
            span: Span::new(0, 2),
        })),
        span: Span::new(0, 2),
    }
}

#[test]
fn structural_match_reconstructs_the_shape() {
    let peg = Peg::compile("S <- { 'Prog' { 'Stmt' . }* }").unwrap();
    let m = peg.run_list(&prog_tree()).unwrap();
    let tree = m.value.unwrap();
    assert_eq!(
        tree.to_string(),
        r#"(S ["Prog" ["Stmt" "x"] ["Stmt" "y"]])"#
    );
}

#[test]
fn tag_mismatch_fails() {
    let peg = Peg::compile("S <- { 'Module' { 'Stmt' . }* }").unwrap();
    assert!(peg.run_list(&prog_tree()).is_err());
}

#[test]
fn unconsumed_children_fail_the_close() {
    // Only one Stmt matched, but Prog has two children.
    let peg = Peg::compile("S <- { 'Prog' { 'Stmt' . } }").unwrap();
    assert!(peg.run_list(&prog_tree()).is_err());
}

#[test]
fn atoms_match_leaf_values() {
    let peg = Peg::compile("S <- { 'Prog' { 'Stmt' 'x' } { 'Stmt' 'y' } }").unwrap();
    assert!(peg.run_list(&prog_tree()).is_ok());

    let peg = Peg::compile("S <- { 'Prog' { 'Stmt' 'x' } { 'Stmt' 'z' } }").unwrap();
    assert!(peg.run_list(&prog_tree()).is_err());
}

#[test]
fn choices_and_predicates_work_structurally() {
    let peg =
        Peg::compile("S <- { 'Prog' ({ 'Decl' . } / { 'Stmt' . })* }").unwrap();
    assert!(peg.run_list(&prog_tree()).is_ok());

    let peg = Peg::compile("S <- &{ 'Prog' .* } { 'Prog' .* }").unwrap();
    assert!(peg.run_list(&prog_tree()).is_ok());
}

#[test]
fn leaves_for_the_list_dialect_compare_textually() {
    let subject = Value::List {
        items: vec![Value::Int(42), Value::Bool(true), Value::Nil],
        span: Span::default(),
    };
    let peg = Peg::compile("S <- { '42' 'true' 'nil' }").unwrap();
    assert!(peg.run_list(&subject).is_ok());
}

#[test]
fn budget_applies_to_structural_matches_too() {
    let peg = Peg::compile("S <- { 'Prog' .* }").unwrap();
    let err = peg
        .run_list_with(
            &prog_tree(),
            &Options {
                instruction_budget: Some(5),
                ..Options::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, pegkit::Error::Timeout { .. }));
}
