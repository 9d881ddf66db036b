//! Structural matching over previously produced [`Value`] trees.
//!
//! The list machine runs the same control opcodes as the string machine,
//! but its cursor walks a tree instead of a byte slice: `Open` descends
//! into the current head, `Close` requires the child list exhausted and
//! ascends, and `Atom` consumes a leaf equal to a symbol. A node is viewed
//! as its name followed by its children, so `{ 'Prog' { 'Stmt' . }* }`
//! matches the tree `(Prog (Stmt x) (Stmt y))`.
//!
//! Grammars written for this machine keep whole subtrees as captures,
//! which is what makes tree-to-tree transformations expressible in the
//! same grammar language.

use crate::bytecode::{Opcode, Program, rel_target};
use crate::diagnostic::Span;
use crate::error::{Error, Result};
use crate::value::Value;
use crate::vm::{Match, Options};

/// The list-matching machine. Borrows the program, like [`crate::vm::Vm`].
pub struct ListVm<'a> {
    program: &'a Program,
}

impl<'a> ListVm<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self { program }
    }

    /// Match `subject` from the start of the program (or `options.start`).
    pub fn run(&self, subject: &Value, options: &Options) -> Result<Match> {
        ListState::new(self.program, subject, options)?.run()
    }
}

const HALT_PC: usize = 1;

/// One element the cursor can stand on: a node's leading name tag, or an
/// actual value.
#[derive(Clone, Copy)]
enum Subject<'v> {
    Tag(&'v str, Span),
    Val(&'v Value),
}

/// A level of the structural cursor: the child list being walked and the
/// index of the current head.
#[derive(Clone)]
struct Level<'v> {
    items: Vec<Subject<'v>>,
    idx: usize,
}

struct BtFrame<'v> {
    alt: usize,
    cursor: Vec<Level<'v>>,
    taken: usize,
    call_depth: usize,
    cap_depth: usize,
    predicate: bool,
}

struct CallFrame {
    ret: usize,
}

enum Cap {
    /// Pushed by `CapOpen` (definition and terminal wrappers).
    Node { terminal: bool, sym: u16 },
    /// Pushed by `Open` for a `{ … }` pattern.
    Bracket,
    Val(Value),
}

struct ListState<'a, 'v> {
    program: &'a Program,

    pc: usize,
    cursor: Vec<Level<'v>>,
    /// Total elements consumed; the structural analogue of the input
    /// offset, used for failure positions.
    taken: usize,
    farthest: usize,
    pred_depth: usize,

    bt: Vec<BtFrame<'v>>,
    calls: Vec<CallFrame>,
    caps: Vec<Cap>,

    steps: u64,
    budget: Option<u64>,
    disable_captures: bool,
    max_depth: usize,
}

/// The child list a node exposes to the machine: its name tag first, then
/// its children. Plain lists expose their items directly.
fn enter<'v>(value: &'v Value) -> Option<Vec<Subject<'v>>> {
    match value {
        Value::Node {
            name, span, inner, ..
        } => {
            let mut items = vec![Subject::Tag(name, *span)];
            match inner.as_deref() {
                None => {}
                Some(Value::List { items: kids, .. }) => {
                    items.extend(kids.iter().map(Subject::Val));
                }
                Some(single) => items.push(Subject::Val(single)),
            }
            Some(items)
        }
        Value::List { items, .. } => Some(items.iter().map(Subject::Val).collect()),
        _ => None,
    }
}

/// Leaf text an `Atom` compares against.
fn atom_text(subject: Subject<'_>) -> Option<String> {
    match subject {
        Subject::Tag(name, _) => Some(name.to_string()),
        Subject::Val(Value::Str { text, .. }) => Some(text.clone()),
        Subject::Val(Value::Int(i)) => Some(i.to_string()),
        Subject::Val(Value::Bool(b)) => Some(b.to_string()),
        Subject::Val(Value::Nil) => Some("nil".to_string()),
        Subject::Val(_) => None,
    }
}

fn subject_value(subject: Subject<'_>) -> Value {
    match subject {
        Subject::Tag(name, span) => Value::Str {
            text: name.to_string(),
            span,
        },
        Subject::Val(v) => v.clone(),
    }
}

impl<'a, 'v> ListState<'a, 'v> {
    fn new(program: &'a Program, subject: &'v Value, options: &Options) -> Result<Self> {
        let (pc, calls) = match &options.start {
            None => (0, Vec::new()),
            Some(name) => {
                let pc = program.entry(name).ok_or_else(|| {
                    Error::Unsupported(format!("unknown start production '{name}'"))
                })?;
                (pc, vec![CallFrame { ret: HALT_PC }])
            }
        };
        Ok(Self {
            program,
            pc,
            cursor: vec![Level {
                items: vec![Subject::Val(subject)],
                idx: 0,
            }],
            taken: 0,
            farthest: 0,
            pred_depth: 0,
            bt: Vec::new(),
            calls,
            caps: Vec::new(),
            steps: 0,
            budget: options.instruction_budget,
            disable_captures: options.disable_captures,
            max_depth: options.max_stack_depth,
        })
    }

    fn head(&self) -> Option<Subject<'v>> {
        let level = self.cursor.last()?;
        level.items.get(level.idx).copied()
    }

    fn advance(&mut self) {
        if let Some(level) = self.cursor.last_mut() {
            level.idx += 1;
        }
        self.taken += 1;
        if self.pred_depth == 0 && self.taken > self.farthest {
            self.farthest = self.taken;
        }
    }

    fn capturing(&self) -> bool {
        !self.disable_captures && self.pred_depth == 0
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
                Opcode::Halt => return self.finish(),

                // --- Structural matching ---
                Opcode::Open => match self.head().and_then(|s| {
                    if let Subject::Val(v) = s { enter(v) } else { None }
                }) {
                    Some(items) => {
                        if self.capturing() {
                            self.caps.push(Cap::Bracket);
                        }
                        self.cursor.push(Level { items, idx: 0 });
                        self.pc += 1;
                    }
                    None => self.fail()?,
                },
                Opcode::Close => {
                    let exhausted = self
                        .cursor
                        .last()
                        .is_some_and(|level| level.idx == level.items.len());
                    if exhausted && self.cursor.len() > 1 {
                        self.cursor.pop();
                        self.advance();
                        if self.capturing() {
                            self.close_bracket()?;
                        }
                        self.pc += 1;
                    } else {
                        self.fail()?;
                    }
                }
                Opcode::Atom => {
                    let sym = self.program.symbols().name(instr.uarg() as u16);
                    match self.head() {
                        Some(subject) if atom_text(subject).as_deref() == Some(sym) => {
                            if self.capturing() {
                                self.caps.push(Cap::Val(subject_value(subject)));
                            }
                            self.advance();
                            self.pc += 1;
                        }
                        _ => self.fail()?,
                    }
                }
                Opcode::Any => match self.head() {
                    Some(subject) => {
                        if self.capturing() {
                            self.caps.push(Cap::Val(subject_value(subject)));
                        }
                        self.advance();
                        self.pc += 1;
                    }
                    None => self.fail()?,
                },

                // --- Backtracking, same discipline as the string machine ---
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
                    let cursor = self.cursor.clone();
                    let taken = self.taken;
                    let cap_depth = self.caps.len();
                    let frame = self
                        .bt
                        .last_mut()
                        .ok_or_else(|| Error::Load("partial commit without frame".into()))?;
                    frame.cursor = cursor;
                    frame.taken = taken;
                    frame.cap_depth = cap_depth;
                    self.pc = rel_target(self.pc, instr.sarg());
                }
                Opcode::BackCommit => {
                    let frame = self.pop_bt()?;
                    self.cursor = frame.cursor;
                    self.taken = frame.taken;
                    self.caps.truncate(frame.cap_depth);
                    self.calls.truncate(frame.call_depth);
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
                    self.calls.push(CallFrame { ret: self.pc + 1 });
                    self.pc = rel_target(self.pc, instr.sarg());
                }
                Opcode::Return => {
                    let frame = self
                        .calls
                        .pop()
                        .ok_or_else(|| Error::Load("return without call frame".into()))?;
                    self.pc = frame.ret;
                }
                // Recovery expressions are a string-machine feature; a
                // labeled throw aborts a structural match outright.
                Opcode::Throw => {
                    return Err(Error::Labeled {
                        label: self
                            .program
                            .symbols()
                            .name(instr.uarg() as u16)
                            .to_string(),
                        position: self.farthest,
                        recovered: false,
                    });
                }

                // --- Captures ---
                Opcode::CapOpen => {
                    if self.capturing() {
                        let (kind, sym) = instr.pair();
                        self.caps.push(Cap::Node {
                            terminal: kind == 1,
                            sym,
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

                Opcode::Char | Opcode::Span | Opcode::Set | Opcode::CapChar => {
                    return Err(Error::Unsupported(
                        "byte-matching instruction in a list match".into(),
                    ));
                }
            }
        }
    }

    fn fail(&mut self) -> Result<()> {
        match self.bt.pop() {
            Some(frame) => {
                if frame.predicate {
                    self.pred_depth -= 1;
                }
                self.pc = frame.alt;
                self.cursor = frame.cursor;
                self.taken = frame.taken;
                self.caps.truncate(frame.cap_depth);
                self.calls.truncate(frame.call_depth);
                Ok(())
            }
            None => Err(Error::Match {
                position: self.farthest,
                expected: Vec::new(),
            }),
        }
    }

    fn push_bt(&mut self, alt: usize, predicate: bool) -> Result<()> {
        if self.bt.len() >= self.max_depth {
            return Err(Error::StackOverflow {
                limit: self.max_depth,
            });
        }
        self.bt.push(BtFrame {
            alt,
            cursor: self.cursor.clone(),
            taken: self.taken,
            call_depth: self.calls.len(),
            cap_depth: self.caps.len(),
            predicate,
        });
        Ok(())
    }

    fn pop_bt(&mut self) -> Result<BtFrame<'v>> {
        let frame = self
            .bt
            .pop()
            .ok_or_else(|| Error::Load("backtrack stack underflow".into()))?;
        if frame.predicate {
            self.pred_depth -= 1;
        }
        Ok(frame)
    }

    /// Close the innermost `{ … }` capture into a `List`.
    fn close_bracket(&mut self) -> Result<()> {
        let open_idx = self
            .caps
            .iter()
            .rposition(|c| matches!(c, Cap::Bracket | Cap::Node { .. }))
            .ok_or_else(|| Error::Load("bracket close without open".into()))?;
        if !matches!(self.caps[open_idx], Cap::Bracket) {
            return Err(Error::Load("mismatched capture nesting".into()));
        }
        let mut items = Vec::new();
        for cap in self.caps.drain(open_idx..).skip(1) {
            if let Cap::Val(v) = cap {
                items.push(v);
            }
        }
        let span = cover(&items);
        self.caps.push(Cap::Val(Value::List { items, span }));
        Ok(())
    }

    /// Close the innermost `CapOpen` into a node (or a bare value for
    /// terminal wrappers, which have no bytes to fuse here).
    fn close_capture(&mut self) -> Result<()> {
        let open_idx = self
            .caps
            .iter()
            .rposition(|c| matches!(c, Cap::Bracket | Cap::Node { .. }))
            .ok_or_else(|| Error::Load("capture close without open".into()))?;
        let (terminal, sym) = match &self.caps[open_idx] {
            Cap::Node { terminal, sym } => (*terminal, *sym),
            _ => return Err(Error::Load("mismatched capture nesting".into())),
        };
        let mut items = Vec::new();
        for cap in self.caps.drain(open_idx..).skip(1) {
            if let Cap::Val(v) = cap {
                items.push(v);
            }
        }
        let span = cover(&items);
        if terminal {
            // Terminal wrappers only bracket structural captures here;
            // pass the values through unchanged.
            for v in items {
                self.caps.push(Cap::Val(v));
            }
        } else {
            self.caps.push(Cap::Val(Value::Node {
                name: self.program.symbols().name(sym).to_string(),
                inner: Value::collapse(items, span).map(Box::new),
                span,
            }));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Match> {
        let mut items = Vec::new();
        for cap in std::mem::take(&mut self.caps) {
            if let Cap::Val(v) = cap {
                items.push(v);
            }
        }
        let span = cover(&items);
        Ok(Match {
            value: Value::collapse(items, span),
            consumed: self.taken,
        })
    }
}

fn cover(items: &[Value]) -> Span {
    let mut iter = items.iter().map(Value::span);
    match iter.next() {
        None => Span::default(),
        Some(first) => iter.fold(first, |acc, s| acc.cover(s)),
    }
}
