use pegkit::{Error, Peg, Value};

const ORDINAL: &str = "\
Ordinal <- Decimal #('st' / 'nd' / 'rd' / 'th')^ord
Decimal <- [1-9][0-9]* / '0'
";

#[test]
fn ordinal_accepts_suffixed_numbers() {
    let peg = Peg::compile(ORDINAL).unwrap();

    let m = peg.run(b" 3rd").unwrap();
    assert_eq!(m.consumed, 4);
    assert_eq!(
        m.value.unwrap().to_string(),
        r#"(Ordinal (Decimal "3") "rd")"#
    );

    let m = peg.run(b"50th").unwrap();
    assert_eq!(m.consumed, 4);
}

#[test]
fn ordinal_reports_the_label_at_the_farthest_consumption() {
    let peg = Peg::compile(ORDINAL).unwrap();

    // The suffix is lexical: no whitespace is skipped in front of it, so
    // both failures sit right after the digit (byte 1, position 2).
    for input in [&b"2 0th"[..], b"2 th"] {
        let err = peg.run(input).unwrap_err();
        let Error::Labeled {
            label,
            position,
            recovered,
        } = &err
        else {
            panic!("expected a labeled failure, got {err:?}");
        };
        assert_eq!(label, "ord");
        assert_eq!(*position, 1);
        assert!(!*recovered);
    }
}

#[test]
fn bare_caret_labels_take_the_reference_name() {
    let grammar = "\
If <- 'if' LPAR^ Expr^ RPAR^ Body
LPAR <- '('
RPAR <- ')'
Expr <- [a-z]+
Body <- [a-z]+
";
    let peg = Peg::compile(grammar).unwrap();
    assert_eq!(peg.run(b"if (x) y").unwrap().consumed, 8);

    let err = peg.run(b"if x").unwrap_err();
    let Error::Labeled {
        label, position, ..
    } = &err
    else {
        panic!("expected a labeled failure, got {err:?}");
    };
    assert_eq!(label, "LPAR");
    // FFP sits after 'if'; the injected whitespace it skipped does not
    // count as committed consumption.
    assert_eq!(*position, 2);
}

#[test]
fn labeled_failures_are_not_undone_by_outer_alternatives() {
    // The first alternative throws; the second would match, but a labeled
    // failure aborts backtracking.
    let peg = Peg::compile("S <- 'a' 'b'^missing / 'ax'").unwrap();
    let err = peg.run(b"ax").unwrap_err();
    assert!(matches!(err, Error::Labeled { ref label, .. } if label == "missing"));
}

#[test]
fn recovery_resynchronizes_and_matching_continues() {
    let grammar = "\
Prog <- Stmt+
Stmt <- Name '=' Name ';'^sync
sync <- (!';' .)* ';'
Name <- [a-z]+
";
    let peg = Peg::compile(grammar).unwrap();
    let m = peg.run(b"a=b;c=d!!;e=f;").unwrap();
    assert_eq!(m.consumed, 14);

    let tree = m.value.unwrap();
    assert!(tree.has_errors());
    let errors = tree.errors();
    assert_eq!(errors.len(), 1);
    let Value::Error { label, span, .. } = errors[0] else {
        unreachable!();
    };
    assert_eq!(label, "sync");
    // From the failed ';' to the end of the recovery's consumption.
    assert_eq!((span.start, span.end), (7, 10));
}

#[test]
fn recovery_output_is_wrapped_in_an_error_value() {
    let grammar = "\
Pair <- '(' Num ','^comma Num ')'
comma <- (![0-9)] .)*
Num <- [0-9]+
";
    let peg = Peg::compile(grammar).unwrap();
    let m = peg.run(b"(1;2)").unwrap();
    assert_eq!(m.consumed, 5);
    let tree = m.value.unwrap();
    let errors = tree.errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], Value::Error { label, .. } if label == "comma"));
}

#[test]
fn a_failing_recovery_keeps_the_original_label() {
    // The recovery insists on a ';' that never comes.
    let grammar = "\
S <- 'a' 'b'^sync
sync <- ';'
";
    let peg = Peg::compile(grammar).unwrap();
    let err = peg.run(b"ax").unwrap_err();
    let Error::Labeled {
        label, recovered, ..
    } = &err
    else {
        panic!("expected a labeled failure, got {err:?}");
    };
    assert_eq!(label, "sync");
    assert!(*recovered);
}

#[test]
fn throws_inside_predicates_abort_the_match() {
    let peg = Peg::compile("S <- !('a'^inner) 'b' / 'a'").unwrap();
    let err = peg.run(b"x").unwrap_err();
    assert!(
        matches!(err, Error::Labeled { ref label, .. } if label == "inner"),
        "{err:?}"
    );
}
