//! The backtracking parsing machine.
//!
//! Executes a compiled [`Program`] against a byte slice. All transient
//! state lives in a [`MatchState`] owned by one `run()` call: the
//! backtrack stack, the call stack, and the capture arena. Failure
//! unwinding truncates the arena to the failing frame's depth, which is
//! how partial captures are discarded without individual frees.
//!
//! The machine is strictly synchronous: a match runs to `Halt`, to an
//! unrecovered failure, or to a resource-limit error. A program is
//! immutable and may be shared by any number of concurrently running
//! machines.

use log::{debug, trace};

use crate::bytecode::{Opcode, Program, rel_target};
use crate::diagnostic::Span;
use crate::error::{Error, Result};
use crate::value::Value;

/// Per-match options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Production to start from; defaults to the grammar's first.
    pub start: Option<String>,
    /// Abort with [`Error::Timeout`] after this many instruction cycles.
    pub instruction_budget: Option<u64>,
    /// Record the terminals attempted at the farthest failure so match
    /// errors can say what would have been accepted.
    pub collect_expected: bool,
    /// Match-only mode: skip all capture bookkeeping and return no tree.
    pub disable_captures: bool,
    /// Hard cap on the backtrack and call stacks.
    pub max_stack_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            start: None,
            instruction_budget: None,
            collect_expected: false,
            disable_captures: false,
            max_stack_depth: 1_000_000,
        }
    }
}

/// A successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// The capture tree, or `None` when nothing was captured (match-only
    /// mode, or a grammar that captures nothing).
    pub value: Option<Value>,
    /// Bytes of input consumed; matching a prefix is not a failure.
    pub consumed: usize,
}

/// The parsing machine. Cheap to construct; borrows the program.
pub struct Vm<'a> {
    program: &'a Program,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self { program }
    }

    /// Match `input` from the start of the program (or `options.start`).
    pub fn run(&self, input: &[u8], options: &Options) -> Result<Match> {
        MatchState::new(self.program, input, options)?.run()
    }
}

/// Instruction index of the preamble's `Halt`; matches started at a named
/// entry point return here.
const HALT_PC: usize = 1;

/// A snapshot taken by `Choice`, restored on failure.
struct BtFrame {
    alt: usize,
    cursor: usize,
    call_depth: usize,
    cap_depth: usize,
    /// Pushed by `ChoiceP`: captures and farthest-failure tracking stay
    /// off until this frame is popped.
    predicate: bool,
}

struct CallFrame {
    ret: usize,
    /// Present when this frame is a running recovery expression.
    recovery: Option<RecoveryFrame>,
}

struct RecoveryFrame {
    label: u16,
    /// Arena length when the recovery started; everything above it is the
    /// recovery's own captures.
    cap_mark: usize,
    /// Cursor where the labeled expression failed.
    start: usize,
}

/// One entry in the capture arena.
enum Cap {
    Open {
        terminal: bool,
        sym: u16,
        start: usize,
    },
    Byte(u8),
    Val(Value),
}

/// A terminal the machine tried at the farthest failure.
#[derive(PartialEq, Eq)]
enum Expected {
    Char(u8),
    Range(u8, u8),
    Set(u16),
    Any,
}

struct MatchState<'a> {
    program: &'a Program,
    input: &'a [u8],

    pc: usize,
    i: usize,
    /// Farthest cursor reached by committed consumption: advanced by
    /// `CapChar`, so predicates and quiet whitespace never move it.
    ffp: usize,
    /// How deep inside predicate entries we are.
    pred_depth: usize,

    bt: Vec<BtFrame>,
    calls: Vec<CallFrame>,
    caps: Vec<Cap>,
    /// Active recoveries, innermost last: (label, backtrack depth at
    /// entry, call depth at entry). A failure that would unwind past the
    /// entry depth aborts the match with the label.
    recoveries: Vec<(u16, usize, usize)>,

    steps: u64,
    budget: Option<u64>,
    collect_expected: bool,
    disable_captures: bool,
    max_depth: usize,

    fail_pos: usize,
    expected: Vec<Expected>,
}

impl<'a> MatchState<'a> {
    fn new(program: &'a Program, input: &'a [u8], options: &Options) -> Result<Self> {
        let (pc, calls) = match &options.start {
            None => (0, Vec::new()),
            Some(name) => {
                let pc = program.entry(name).ok_or_else(|| {
                    Error::Unsupported(format!("unknown start production '{name}'"))
                })?;
                (
                    pc,
                    vec![CallFrame {
                        ret: HALT_PC,
                        recovery: None,
                    }],
                )
            }
        };
        Ok(Self {
            program,
            input,
            pc,
            i: 0,
            ffp: 0,
            pred_depth: 0,
            bt: Vec::new(),
            calls,
            caps: Vec::new(),
            recoveries: Vec::new(),
            steps: 0,
            budget: options.instruction_budget,
            collect_expected: options.collect_expected,
            disable_captures: options.disable_captures,
            max_depth: options.max_stack_depth,
            fail_pos: 0,
            expected: Vec::new(),
        })
    }

    fn run(mut self) -> Result<Match> {
        loop {
            self.steps += 1;
            if let Some(budget) = self.budget
                && self.steps > budget
            {
                return Err(Error::Timeout { budget });
            }

            let instr = self
                .program
                .instr(self.pc)
                .ok_or_else(|| Error::Load(format!("pc {} out of range", self.pc)))?;

            match instr.opcode()? {
                Opcode::Halt => {
                    debug!("halt: consumed {} of {} bytes", self.i, self.input.len());
                    return self.finish();
                }

                // --- Byte matching ---
                Opcode::Char => {
                    let b = instr.uarg() as u8;
                    if self.input.get(self.i) == Some(&b) {
                        self.i += 1;
                        self.pc += 1;
                    } else {
                        self.fail_expected(Expected::Char(b))?;
                    }
                }
                Opcode::Any => {
                    if self.i < self.input.len() {
                        self.i += 1;
                        self.pc += 1;
                    } else {
                        self.fail_expected(Expected::Any)?;
                    }
                }
                Opcode::Span => {
                    let (lo, hi) = instr.pair();
                    let (lo, hi) = (lo as u8, hi as u8);
                    match self.input.get(self.i) {
                        Some(&b) if lo <= b && b <= hi => {
                            self.i += 1;
                            self.pc += 1;
                        }
                        _ => self.fail_expected(Expected::Range(lo, hi))?,
                    }
                }
                Opcode::Set => {
                    let idx = instr.uarg() as u16;
                    let hit = self
                        .program
                        .charset(idx)
                        .zip(self.input.get(self.i))
                        .is_some_and(|(set, &b)| set.contains(b));
                    if hit {
                        self.i += 1;
                        self.pc += 1;
                    } else {
                        self.fail_expected(Expected::Set(idx))?;
                    }
                }

                // --- Backtracking ---
                Opcode::Choice => {
                    self.push_bt(rel_target(self.pc, instr.sarg()), false)?;
                    self.pc += 1;
                }
                Opcode::ChoiceP => {
                    self.push_bt(rel_target(self.pc, instr.sarg()), true)?;
                    self.pred_depth += 1;
                    self.pc += 1;
                }
                Opcode::Commit => {
                    self.pop_bt()?;
                    self.pc = rel_target(self.pc, instr.sarg());
                }
                Opcode::PartialCommit => {
                    let cap_depth = self.caps.len();
                    let cursor = self.i;
                    let frame = self
                        .bt
                        .last_mut()
                        .ok_or_else(|| Error::Load("partial commit without frame".into()))?;
                    frame.cursor = cursor;
                    frame.cap_depth = cap_depth;
                    self.pc = rel_target(self.pc, instr.sarg());
                }
                Opcode::BackCommit => {
                    let frame = self.pop_bt()?;
                    self.i = frame.cursor;
                    self.caps.truncate(frame.cap_depth);
                    self.truncate_calls(frame.call_depth);
                    self.pc = rel_target(self.pc, instr.sarg());
                }
                Opcode::Fail => self.fail()?,
                Opcode::FailTwice => {
                    self.pop_bt()?;
                    self.fail()?;
                }

                // --- Control ---
                Opcode::Jump => {
                    self.pc = instr.uarg() as usize;
                }
                Opcode::Call => {
                    if self.calls.len() >= self.max_depth {
                        return Err(Error::StackOverflow {
                            limit: self.max_depth,
                        });
                    }
                    self.calls.push(CallFrame {
                        ret: self.pc + 1,
                        recovery: None,
                    });
                    self.pc = rel_target(self.pc, instr.sarg());
                }
                Opcode::Return => {
                    let frame = self
                        .calls
                        .pop()
                        .ok_or_else(|| Error::Load("return without call frame".into()))?;
                    if let Some(rec) = frame.recovery {
                        self.finish_recovery(rec);
                    }
                    self.pc = frame.ret;
                }
                Opcode::Throw => self.throw(instr.uarg() as u16)?,

                // --- Captures ---
                Opcode::CapOpen => {
                    if self.capturing() {
                        let (kind, sym) = instr.pair();
                        self.caps.push(Cap::Open {
                            terminal: kind == 1,
                            sym,
                            start: self.i,
                        });
                    }
                    self.pc += 1;
                }
                Opcode::CapClose => {
                    if self.capturing() {
                        self.close_capture()?;
                    }
                    self.pc += 1;
                }
                Opcode::CapChar => {
                    if self.pred_depth == 0 {
                        if self.i > self.ffp {
                            self.ffp = self.i;
                        }
                        if !self.disable_captures && self.i > 0 {
                            self.caps.push(Cap::Byte(self.input[self.i - 1]));
                        }
                    }
                    self.pc += 1;
                }

                Opcode::Open | Opcode::Close | Opcode::Atom => {
                    return Err(Error::Unsupported(
                        "list-matching instruction in a string match".into(),
                    ));
                }
            }
        }
    }

    fn capturing(&self) -> bool {
        !self.disable_captures && self.pred_depth == 0
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    /// Record the terminal attempted at the farthest failure, then fail.
    fn fail_expected(&mut self, expected: Expected) -> Result<()> {
        if self.collect_expected && self.pred_depth == 0 {
            if self.i > self.fail_pos {
                self.fail_pos = self.i;
                self.expected.clear();
            }
            if self.i == self.fail_pos && !self.expected.contains(&expected) {
                self.expected.push(expected);
            }
        }
        self.fail()
    }

    /// Unwind to the nearest backtrack frame, restoring its snapshot.
    ///
    /// A failure inside a running recovery that would unwind past the
    /// recovery's entry depth aborts the whole match with the label: a
    /// labeled failure is not undone by ordinary alternatives.
    fn fail(&mut self) -> Result<()> {
        if let Some(&(label, bt_mark, _)) = self.recoveries.last()
            && self.bt.len() <= bt_mark
        {
            return Err(self.labeled(label, true));
        }
        match self.bt.pop() {
            Some(frame) => {
                if frame.predicate {
                    self.pred_depth -= 1;
                }
                trace!("fail: backtrack to pc {} cursor {}", frame.alt, frame.cursor);
                self.pc = frame.alt;
                self.i = frame.cursor;
                self.caps.truncate(frame.cap_depth);
                self.truncate_calls(frame.call_depth);
                Ok(())
            }
            None => Err(Error::Match {
                position: self.ffp,
                expected: self.render_expected(),
            }),
        }
    }

    /// Raise a labeled failure. With a registered recovery (and outside
    /// predicates) the recovery body runs as a call returning past the
    /// throw; otherwise the label aborts the match.
    fn throw(&mut self, label: u16) -> Result<()> {
        if self.pred_depth == 0
            && let Some(rec_pc) = self.program.recovery_pc(label)
        {
            if self.calls.len() >= self.max_depth {
                return Err(Error::StackOverflow {
                    limit: self.max_depth,
                });
            }
            trace!(
                "throw '{}': recovering at pc {rec_pc}",
                self.program.symbols().name(label)
            );
            self.recoveries.push((label, self.bt.len(), self.calls.len()));
            self.calls.push(CallFrame {
                ret: self.pc + 1,
                recovery: Some(RecoveryFrame {
                    label,
                    cap_mark: self.caps.len(),
                    start: self.i,
                }),
            });
            self.pc = rec_pc;
            Ok(())
        } else {
            Err(self.labeled(label, false))
        }
    }

    fn labeled(&self, label: u16, recovered: bool) -> Error {
        Error::Labeled {
            label: self.program.symbols().name(label).to_string(),
            position: self.ffp,
            recovered,
        }
    }

    /// Wrap everything a recovery body captured into an `Error` value
    /// spanning from the throw point to the recovery's end cursor.
    fn finish_recovery(&mut self, rec: RecoveryFrame) {
        self.recoveries.pop();
        if self.disable_captures {
            return;
        }
        let mut items = Vec::new();
        for cap in self.caps.drain(rec.cap_mark..) {
            if let Cap::Val(v) = cap {
                items.push(v);
            }
        }
        let span = Span::new(rec.start, self.i);
        self.caps.push(Cap::Val(Value::Error {
            label: self.program.symbols().name(rec.label).to_string(),
            inner: Value::collapse(items, span).map(Box::new),
            span,
        }));
    }

    // -----------------------------------------------------------------------
    // Stack plumbing
    // -----------------------------------------------------------------------

    fn push_bt(&mut self, alt: usize, predicate: bool) -> Result<()> {
        if self.bt.len() >= self.max_depth {
            return Err(Error::StackOverflow {
                limit: self.max_depth,
            });
        }
        self.bt.push(BtFrame {
            alt,
            cursor: self.i,
            call_depth: self.calls.len(),
            cap_depth: self.caps.len(),
            predicate,
        });
        Ok(())
    }

    fn pop_bt(&mut self) -> Result<BtFrame> {
        let frame = self
            .bt
            .pop()
            .ok_or_else(|| Error::Load("backtrack stack underflow".into()))?;
        if frame.predicate {
            self.pred_depth -= 1;
        }
        Ok(frame)
    }

    /// Drop call frames above `depth`, keeping the recovery stack in sync.
    fn truncate_calls(&mut self, depth: usize) {
        self.calls.truncate(depth);
        while let Some(&(_, _, call_idx)) = self.recoveries.last() {
            if call_idx >= depth {
                self.recoveries.pop();
            } else {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Captures
    // -----------------------------------------------------------------------

    /// Pop arena entries back to the most recent `Open` and replace them
    /// with the finished `Str` or `Node`.
    fn close_capture(&mut self) -> Result<()> {
        let open_idx = self
            .caps
            .iter()
            .rposition(|c| matches!(c, Cap::Open { .. }))
            .ok_or_else(|| Error::Load("capture close without open".into()))?;
        let (terminal, sym, start) = match &self.caps[open_idx] {
            Cap::Open {
                terminal,
                sym,
                start,
            } => (*terminal, *sym, *start),
            _ => unreachable!("rposition matched an Open"),
        };

        let span = Span::new(start, self.i);
        let value = if terminal {
            let mut text = Vec::new();
            for cap in self.caps.drain(open_idx..).skip(1) {
                if let Cap::Byte(b) = cap {
                    text.push(b);
                }
            }
            Value::Str {
                text: String::from_utf8_lossy(&text).into_owned(),
                span,
            }
        } else {
            let mut items = Vec::new();
            for cap in self.caps.drain(open_idx..).skip(1) {
                if let Cap::Val(v) = cap {
                    items.push(v);
                }
            }
            Value::Node {
                name: self.program.symbols().name(sym).to_string(),
                inner: Value::collapse(items, span).map(Box::new),
                span,
            }
        };
        self.caps.push(Cap::Val(value));
        Ok(())
    }

    fn finish(&mut self) -> Result<Match> {
        let mut items = Vec::new();
        for cap in std::mem::take(&mut self.caps) {
            if let Cap::Val(v) = cap {
                items.push(v);
            }
        }
        Ok(Match {
            value: Value::collapse(items, Span::new(0, self.i)),
            consumed: self.i,
        })
    }

    fn render_expected(&self) -> Vec<String> {
        self.expected
            .iter()
            .map(|e| match e {
                Expected::Char(b) => format!("'{}'", escape_byte(*b)),
                Expected::Range(lo, hi) => {
                    format!("'{}'..'{}'", escape_byte(*lo), escape_byte(*hi))
                }
                Expected::Set(idx) => self
                    .program
                    .charset(*idx)
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_else(|| "[?]".to_string()),
                Expected::Any => "any character".to_string(),
            })
            .collect()
    }
}

fn escape_byte(b: u8) -> String {
    match b {
        b'\n' => "\\n".to_string(),
        b'\r' => "\\r".to_string(),
        b'\t' => "\\t".to_string(),
        b' '..=b'~' => (b as char).to_string(),
        other => format!("\\x{other:02x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;

    fn run(grammar: &str, input: &str) -> Result<Match> {
        run_with(grammar, input, &Options::default())
    }

    fn run_with(grammar: &str, input: &str, options: &Options) -> Result<Match> {
        let program = Compiler::new().compile(grammar)?;
        Vm::new(&program).run(input.as_bytes(), options)
    }

    #[test]
    fn literal_match_and_prefix_consumption() {
        let m = run("S <- 'ab'", "abc").unwrap();
        assert_eq!(m.consumed, 2);
        let tree = m.value.unwrap();
        assert_eq!(tree.to_string(), r#"(S "ab")"#);
    }

    #[test]
    fn ordered_choice_takes_the_first_success() {
        let m = run("S <- 'a' / 'ab'", "ab").unwrap();
        assert_eq!(m.consumed, 1);
    }

    #[test]
    fn failure_reports_farthest_position_and_expected() {
        let options = Options {
            collect_expected: true,
            ..Options::default()
        };
        let err = run_with("S <- 'a' / 'b'", "c", &options).unwrap_err();
        let Error::Match { position, expected } = &err else {
            panic!("expected Match error, got {err:?}");
        };
        assert_eq!(*position, 0);
        assert_eq!(expected, &vec!["'a'".to_string(), "'b'".to_string()]);
    }

    #[test]
    fn predicates_consume_nothing() {
        let m = run("S <- &'ab' 'a' !'c' 'b'", "ab").unwrap();
        assert_eq!(m.consumed, 2);
        // The lookahead leaves no captures behind; the two consuming
        // literals fuse into the definition's single terminal capture.
        assert_eq!(m.value.unwrap().to_string(), r#"(S "ab")"#);
    }

    #[test]
    fn negative_predicate_failure_does_not_move_ffp() {
        let options = Options {
            collect_expected: true,
            ..Options::default()
        };
        // !'ab' scans two bytes before failing, but the report stays at 0.
        let err = run_with("S <- !'ab' 'x'", "ab", &options).unwrap_err();
        let Error::Match { position, .. } = err else {
            panic!("expected Match error");
        };
        assert_eq!(position, 0);
    }

    #[test]
    fn optional_and_repetitions() {
        assert_eq!(run("S <- 'a'? 'b'", "ab").unwrap().consumed, 2);
        assert_eq!(run("S <- 'a'? 'b'", "b").unwrap().consumed, 1);
        assert_eq!(run("S <- 'a'+", "aaab").unwrap().consumed, 3);
        assert!(run("S <- 'a'+", "b").is_err());
        assert_eq!(run("S <- 'a'*", "").unwrap().consumed, 0);
    }

    #[test]
    fn empty_choice_alternative_matches_nothing() {
        let m = run("S <- 'a' / ", "zzz").unwrap();
        assert_eq!(m.consumed, 0);
    }

    #[test]
    fn repetition_backtracks_cleanly_over_partial_iterations() {
        // The second iteration of ('a' 'b') fails halfway; its captures
        // must be discarded while the first iteration's survive.
        assert!(run("S <- ('a' 'b')* 'a'", "abab").is_err());
        let m = run("S <- ('a' 'b')* 'ac'", "abac").unwrap();
        assert_eq!(m.consumed, 4);
        // The failed half-iteration's byte must not appear in the capture.
        assert_eq!(m.value.unwrap().to_string(), r#"(S "abac")"#);
    }

    #[test]
    fn match_only_mode_returns_no_tree() {
        let options = Options {
            disable_captures: true,
            ..Options::default()
        };
        let m = run_with("S <- 'a'+", "aaa", &options).unwrap();
        assert_eq!(m.consumed, 3);
        assert_eq!(m.value, None);
    }

    #[test]
    fn start_symbol_selects_the_entry_point() {
        let grammar = "S <- A '+' A\nA <- '0' / '1'";
        let options = Options {
            start: Some("A".to_string()),
            ..Options::default()
        };
        let m = run_with(grammar, "1", &options).unwrap();
        assert_eq!(m.consumed, 1);
        assert_eq!(m.value.unwrap().name(), Some("A"));
    }

    #[test]
    fn unknown_start_symbol_is_an_error() {
        let err = run_with(
            "S <- 'a'",
            "a",
            &Options {
                start: Some("Nope".to_string()),
                ..Options::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn instruction_budget_aborts_long_matches() {
        let options = Options {
            instruction_budget: Some(50),
            ..Options::default()
        };
        let err = run_with("S <- 'a'*", &"a".repeat(1000), &options).unwrap_err();
        assert_eq!(err, Error::Timeout { budget: 50 });
    }

    #[test]
    fn call_depth_is_capped() {
        let options = Options {
            max_stack_depth: 16,
            ..Options::default()
        };
        let err = run_with("S <- 'a' S / 'a'", &"a".repeat(100), &options).unwrap_err();
        assert_eq!(err, Error::StackOverflow { limit: 16 });
    }

    #[test]
    fn determinism_repeated_runs_agree() {
        let grammar = "S <- A '+' A\nA <- '0' / '1'";
        let program = Compiler::new().compile(grammar).unwrap();
        let vm = Vm::new(&program);
        let a = vm.run(b"1+0", &Options::default()).unwrap();
        let b = vm.run(b"1+0", &Options::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn auto_whitespace_applies_between_sequence_elements() {
        let grammar = "S <- A '+' A\nA <- '0' / '1'";
        let m = run(grammar, "1 + \t1").unwrap();
        assert_eq!(m.consumed, 6);
        // Injected whitespace is not captured.
        assert_eq!(m.value.unwrap().to_string(), r#"(S (A "1") "+" (A "1"))"#);
    }

    #[test]
    fn lexification_suppresses_whitespace() {
        let grammar = "S <- A #('+' A)\nA <- '0' / '1'";
        assert!(run(grammar, "1 + 1").is_err());
        assert!(run(grammar, "1 +1").is_err());
        assert_eq!(run(grammar, "1+1").unwrap().consumed, 3);
    }

    #[test]
    fn syntactic_productions_get_no_injected_whitespace() {
        // S is syntactic: whitespace between the digits is not skipped.
        let grammar = "S <- [0-9] [0-9]";
        assert!(run(grammar, "1 2").is_err());
        assert_eq!(run(grammar, "12").unwrap().consumed, 2);
    }
}
