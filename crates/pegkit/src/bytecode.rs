//! Instruction set and compiled program representation.
//!
//! A program is a header (symbol table, charset table) plus a flat array of
//! fixed-width instruction words. Each word packs a 5-bit operator into the
//! high bits; the remaining 27 bits hold either one signed or unsigned
//! operand or an (11-bit, 16-bit) pair. Relative jump targets are counted
//! from the instruction *following* the jump.
//!
//! The wire form ([`Program::load`] / [`Program::store`]) is big-endian
//! throughout; words are normalized to host order at load time.

use std::fmt;

use crate::charset::Charset;
use crate::error::{Error, Result};
use crate::symbols::SymbolTable;

/// Number of low bits available for operands.
const OPERAND_BITS: u32 = 27;
const OPERAND_MASK: u32 = (1 << OPERAND_BITS) - 1;

/// The machine's operators.
///
/// `Open`, `Close`, and `Atom` only appear in programs compiled from list
/// patterns and are rejected by the string machine (and vice versa for the
/// byte-consuming operators).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Terminate the match; success iff no failure label is active.
    Halt = 0,
    /// Consume one byte if it equals the operand.
    Char = 1,
    /// Consume any one byte.
    Any = 2,
    /// Consume one byte if it lies in the inclusive operand range.
    Span = 3,
    /// Consume one byte if the indexed charset contains it.
    Set = 4,
    /// Push a backtrack frame whose alternative is the relative target.
    Choice = 5,
    /// `Choice` for predicate entry: the frame suppresses captures and
    /// farthest-failure tracking until it is popped.
    ChoiceP = 6,
    /// Pop the top backtrack frame and jump.
    Commit = 7,
    /// Refresh the top backtrack frame with the current cursor and capture
    /// depth, then jump. Emitted inside repetitions.
    PartialCommit = 8,
    /// Pop the top backtrack frame, restore its cursor, then jump. Emitted
    /// on the success path of `&e`.
    BackCommit = 9,
    /// Enter failure handling.
    Fail = 10,
    /// Discard one backtrack frame, then enter failure handling. Emitted
    /// on the success path of `!e`.
    FailTwice = 11,
    /// Jump to an absolute target.
    Jump = 12,
    /// Push a call frame returning past this instruction, jump relative.
    Call = 13,
    /// Pop the current call frame and resume at its return address.
    Return = 14,
    /// Raise a labeled failure carrying the operand symbol.
    Throw = 15,
    /// Push a pending capture marker; operands are (is_terminal, symbol).
    CapOpen = 16,
    /// Commit captures since the paired `CapOpen` into a string or node.
    CapClose = 17,
    /// Append the last consumed byte to the open terminal capture and
    /// advance the farthest-failure position.
    CapChar = 18,
    /// List machine: descend into the children of the current head.
    Open = 19,
    /// List machine: require the child list exhausted, then ascend.
    Close = 20,
    /// List machine: consume the current head if it equals the operand
    /// symbol.
    Atom = 21,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use Opcode::*;
        Ok(match value {
            0 => Halt,
            1 => Char,
            2 => Any,
            3 => Span,
            4 => Set,
            5 => Choice,
            6 => ChoiceP,
            7 => Commit,
            8 => PartialCommit,
            9 => BackCommit,
            10 => Fail,
            11 => FailTwice,
            12 => Jump,
            13 => Call,
            14 => Return,
            15 => Throw,
            16 => CapOpen,
            17 => CapClose,
            18 => CapChar,
            19 => Open,
            20 => Close,
            21 => Atom,
            other => return Err(Error::Load(format!("unknown opcode {other}"))),
        })
    }
}

/// One fixed-width instruction word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instr(u32);

impl Instr {
    pub fn op0(op: Opcode) -> Instr {
        Instr((op as u32) << OPERAND_BITS)
    }

    pub fn op_u(op: Opcode, value: u32) -> Instr {
        debug_assert!(value <= OPERAND_MASK);
        Instr((op as u32) << OPERAND_BITS | (value & OPERAND_MASK))
    }

    pub fn op_s(op: Opcode, value: i32) -> Instr {
        Instr((op as u32) << OPERAND_BITS | (value as u32 & OPERAND_MASK))
    }

    /// Pack an (11-bit, 16-bit) operand pair.
    pub fn op_pair(op: Opcode, a: u16, b: u16) -> Instr {
        debug_assert!(a < (1 << 11));
        Instr((op as u32) << OPERAND_BITS | u32::from(a) << 16 | u32::from(b))
    }

    pub fn opcode(self) -> Result<Opcode> {
        Opcode::try_from((self.0 >> OPERAND_BITS) as u8)
    }

    /// Unsigned 27-bit operand.
    pub fn uarg(self) -> u32 {
        self.0 & OPERAND_MASK
    }

    /// Signed 27-bit operand, sign-extended to 32 bits.
    pub fn sarg(self) -> i32 {
        ((self.0 << 5) as i32) >> 5
    }

    /// The (11-bit, 16-bit) operand pair.
    pub fn pair(self) -> (u16, u16) {
        (((self.0 >> 16) & 0x7ff) as u16, (self.0 & 0xffff) as u16)
    }

    pub fn word(self) -> u32 {
        self.0
    }

    pub fn from_word(word: u32) -> Instr {
        Instr(word)
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Ok(op) => write!(f, "{op:?}({:#010x})", self.0),
            Err(_) => write!(f, "Invalid({:#010x})", self.0),
        }
    }
}

/// Resolve a relative operand at `pc` into an absolute instruction index.
pub fn rel_target(pc: usize, rel: i32) -> usize {
    (pc as i64 + 1 + i64::from(rel)) as usize
}

/// Compute the relative operand that takes `pc` to `target`.
pub fn rel_from(pc: usize, target: usize) -> i32 {
    (target as i64 - pc as i64 - 1) as i32
}

/// An immutable compiled module: symbols, charsets, code, and the two
/// side tables binding labels to recovery bodies and production names to
/// entry points.
///
/// A program carries no interior mutability; any number of machines may
/// execute it concurrently, each owning its own stacks.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub(crate) symbols: SymbolTable,
    pub(crate) charsets: Vec<Charset>,
    pub(crate) code: Vec<Instr>,
    /// Label symbol → pc of the recovery body compiled for it.
    pub(crate) recovery: Vec<(u16, u32)>,
    /// Production symbol → pc of its definition block.
    pub(crate) entries: Vec<(u16, u32)>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn instr(&self, pc: usize) -> Option<Instr> {
        self.code.get(pc).copied()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn charset(&self, idx: u16) -> Option<&Charset> {
        self.charsets.get(idx as usize)
    }

    /// Entry pc for the named production.
    pub fn entry(&self, name: &str) -> Option<usize> {
        let sym = self.symbols.lookup(name)?;
        self.entries
            .iter()
            .find(|(s, _)| *s == sym)
            .map(|(_, pc)| *pc as usize)
    }

    /// Recovery body pc registered for a label symbol.
    pub fn recovery_pc(&self, label: u16) -> Option<usize> {
        self.recovery
            .iter()
            .find(|(s, _)| *s == label)
            .map(|(_, pc)| *pc as usize)
    }

    /// Names of all productions that can serve as a start symbol.
    pub fn production_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(s, _)| self.symbols.name(*s))
    }

    // -----------------------------------------------------------------------
    // Wire format
    // -----------------------------------------------------------------------

    /// Serialize to the big-endian module layout.
    pub fn store(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&(self.symbols.len() as u16).to_be_bytes());
        for name in self.symbols.iter() {
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }

        out.extend_from_slice(&(self.charsets.len() as u16).to_be_bytes());
        for set in &self.charsets {
            out.extend_from_slice(&set.to_bytes());
        }

        out.extend_from_slice(&(self.code.len() as u16).to_be_bytes());
        for instr in &self.code {
            out.extend_from_slice(&instr.word().to_be_bytes());
        }

        out.extend_from_slice(&(self.recovery.len() as u16).to_be_bytes());
        for (label, pc) in &self.recovery {
            out.extend_from_slice(&label.to_be_bytes());
            out.extend_from_slice(&pc.to_be_bytes());
        }

        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for (sym, pc) in &self.entries {
            out.extend_from_slice(&sym.to_be_bytes());
            out.extend_from_slice(&pc.to_be_bytes());
        }

        out
    }

    /// Deserialize and validate a module.
    ///
    /// Every opcode, symbol reference, charset reference, and side-table pc
    /// is checked here so the machines can trust the program wholesale.
    pub fn load(bytes: &[u8]) -> Result<Program> {
        let mut r = Reader { bytes, pos: 0 };

        let n_symbols = r.u16()?;
        let mut symbols = SymbolTable::new();
        for _ in 0..n_symbols {
            let len = r.u8()? as usize;
            let raw = r.take(len)?;
            let name = std::str::from_utf8(raw)
                .map_err(|_| Error::Load("symbol is not valid UTF-8".into()))?;
            symbols.intern(name).map_err(|e| Error::Load(e.to_string()))?;
        }

        let n_charsets = r.u16()?;
        let mut charsets = Vec::with_capacity(n_charsets as usize);
        for _ in 0..n_charsets {
            let raw = r.take(32)?;
            let mut buf = [0u8; 32];
            buf.copy_from_slice(raw);
            charsets.push(Charset::from_bytes(buf));
        }

        let n_instructions = r.u16()?;
        let mut code = Vec::with_capacity(n_instructions as usize);
        for _ in 0..n_instructions {
            code.push(Instr::from_word(r.u32()?));
        }

        let mut recovery = Vec::new();
        if !r.done() {
            let n = r.u16()?;
            for _ in 0..n {
                recovery.push((r.u16()?, r.u32()?));
            }
        }

        let mut entries = Vec::new();
        if !r.done() {
            let n = r.u16()?;
            for _ in 0..n {
                entries.push((r.u16()?, r.u32()?));
            }
        }

        if !r.done() {
            return Err(Error::Load("trailing bytes after module".into()));
        }

        let program = Program {
            symbols,
            charsets,
            code,
            recovery,
            entries,
        };
        program.validate()?;
        Ok(program)
    }

    fn validate(&self) -> Result<()> {
        let n_syms = self.symbols.len() as u32;
        let n_sets = self.charsets.len() as u32;
        let n_code = self.code.len() as u32;

        for (pc, instr) in self.code.iter().enumerate() {
            let op = instr.opcode()?;
            match op {
                Opcode::Set if instr.uarg() >= n_sets => {
                    return Err(Error::Load(format!("pc {pc}: charset index out of range")));
                }
                Opcode::Throw | Opcode::Atom if instr.uarg() >= n_syms => {
                    return Err(Error::Load(format!("pc {pc}: symbol index out of range")));
                }
                Opcode::CapOpen | Opcode::CapClose => {
                    let (kind, sym) = instr.pair();
                    if kind > 1 {
                        return Err(Error::Load(format!("pc {pc}: bad capture kind {kind}")));
                    }
                    if u32::from(sym) >= n_syms {
                        return Err(Error::Load(format!("pc {pc}: symbol index out of range")));
                    }
                }
                _ => {}
            }
        }

        for &(label, pc) in &self.recovery {
            if u32::from(label) >= n_syms || pc >= n_code {
                return Err(Error::Load("recovery binding out of range".into()));
            }
        }
        for &(sym, pc) in &self.entries {
            if u32::from(sym) >= n_syms || pc >= n_code {
                return Err(Error::Load("entry point out of range".into()));
            }
        }
        Ok(())
    }
}

/// Disassembly listing, one instruction per line with resolved targets.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, instr) in self.code.iter().enumerate() {
            if let Some((sym, _)) = self.entries.iter().find(|(_, p)| *p as usize == pc) {
                writeln!(f, "{}:", self.symbols.name(*sym))?;
            }
            write!(f, "  {pc:04}  ")?;
            match instr.opcode() {
                Err(_) => writeln!(f, "invalid {:#010x}", instr.word())?,
                Ok(op) => match op {
                    Opcode::Char => {
                        let b = instr.uarg() as u8;
                        writeln!(f, "char    {:?}", b as char)?
                    }
                    Opcode::Span => {
                        let (lo, hi) = instr.pair();
                        writeln!(f, "span    {:?}-{:?}", (lo as u8) as char, (hi as u8) as char)?
                    }
                    Opcode::Set => {
                        let set = self.charset(instr.uarg() as u16);
                        writeln!(f, "set     {}", set.map(|s| format!("{s:?}")).unwrap_or_default())?
                    }
                    Opcode::Choice | Opcode::ChoiceP | Opcode::Commit | Opcode::PartialCommit
                    | Opcode::BackCommit | Opcode::Call => writeln!(
                        f,
                        "{:<7} -> {:04}",
                        format!("{op:?}").to_lowercase(),
                        rel_target(pc, instr.sarg())
                    )?,
                    Opcode::Jump => writeln!(f, "jump    -> {:04}", instr.uarg())?,
                    Opcode::Throw => {
                        writeln!(f, "throw   ^{}", self.symbols.name(instr.uarg() as u16))?
                    }
                    Opcode::CapOpen | Opcode::CapClose => {
                        let (kind, sym) = instr.pair();
                        let what = if kind == 1 { "term" } else { "node" };
                        writeln!(
                            f,
                            "{:<7} {what} {}",
                            format!("{op:?}").to_lowercase(),
                            self.symbols.name(sym)
                        )?
                    }
                    Opcode::Atom => {
                        writeln!(f, "atom    '{}'", self.symbols.name(instr.uarg() as u16))?
                    }
                    other => writeln!(f, "{}", format!("{other:?}").to_lowercase())?,
                },
            }
        }
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::Load("unexpected end of module".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn done(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_operands_round_trip_at_boundaries() {
        for value in [0, 1, -1, 1000, -1000, (1 << 26) - 1, -(1 << 26)] {
            let instr = Instr::op_s(Opcode::Choice, value);
            assert_eq!(instr.opcode().unwrap(), Opcode::Choice);
            assert_eq!(instr.sarg(), value, "value {value}");
        }
    }

    #[test]
    fn unsigned_operands_round_trip() {
        let instr = Instr::op_u(Opcode::Set, (1 << 27) - 1);
        assert_eq!(instr.uarg(), (1 << 27) - 1);
        assert_eq!(instr.opcode().unwrap(), Opcode::Set);
    }

    #[test]
    fn pair_operands_round_trip() {
        let instr = Instr::op_pair(Opcode::CapOpen, 1, 0xbeef);
        assert_eq!(instr.pair(), (1, 0xbeef));
        let instr = Instr::op_pair(Opcode::Span, b'a'.into(), b'z'.into());
        assert_eq!(instr.pair(), (b'a'.into(), b'z'.into()));
    }

    #[test]
    fn relative_targets_count_from_next_instruction() {
        assert_eq!(rel_target(4, 0), 5);
        assert_eq!(rel_target(4, 3), 8);
        assert_eq!(rel_target(4, -5), 0);
        assert_eq!(rel_from(4, 8), 3);
        assert_eq!(rel_from(4, 0), -5);
    }

    #[test]
    fn module_wire_round_trip() {
        let mut symbols = SymbolTable::new();
        let s = symbols.intern("S").unwrap();
        let mut set = Charset::new();
        set.insert_range(b'a', b'e');
        let program = Program {
            symbols,
            charsets: vec![set],
            code: vec![
                Instr::op_s(Opcode::Call, 1),
                Instr::op0(Opcode::Halt),
                Instr::op_pair(Opcode::CapOpen, 0, s),
                Instr::op_u(Opcode::Set, 0),
                Instr::op0(Opcode::CapChar),
                Instr::op_pair(Opcode::CapClose, 0, s),
                Instr::op0(Opcode::Return),
            ],
            recovery: vec![],
            entries: vec![(s, 2)],
        };

        let bytes = program.store();
        let loaded = Program::load(&bytes).unwrap();
        assert_eq!(loaded.len(), program.len());
        assert_eq!(loaded.entry("S"), Some(2));
        assert_eq!(loaded.instr(3).unwrap().word(), program.instr(3).unwrap().word());
        assert!(loaded.charset(0).unwrap().contains(b'c'));
    }

    #[test]
    fn load_rejects_bad_opcode_and_truncation() {
        let mut symbols = SymbolTable::new();
        symbols.intern("S").unwrap();
        let program = Program {
            symbols,
            charsets: vec![],
            code: vec![Instr::from_word(31 << 27)],
            recovery: vec![],
            entries: vec![],
        };
        let bytes = program.store();
        assert!(matches!(Program::load(&bytes), Err(Error::Load(_))));
        assert!(matches!(Program::load(&bytes[..3]), Err(Error::Load(_))));
    }

    #[test]
    fn load_rejects_out_of_range_references() {
        let program = Program {
            symbols: SymbolTable::new(),
            charsets: vec![],
            code: vec![Instr::op_u(Opcode::Set, 0)],
            recovery: vec![],
            entries: vec![],
        };
        let bytes = program.store();
        assert!(matches!(Program::load(&bytes), Err(Error::Load(_))));
    }
}
