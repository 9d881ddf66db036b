//! Grammar compiler: lowers a parsed grammar into a bytecode [`Program`].
//!
//! Compilation is a fixed pipeline over the whole grammar. Imports are
//! merged in first, then three analyses run over the definition graph
//! (nullability, left recursion, syntacticity), then the AST is rewritten
//! (automatic whitespace injection), and finally a single emission pass
//! produces instruction words, desugaring `e?`, `e+`, and `e^label` on the
//! way down. Jumps are emitted with a zero operand and patched in place
//! once their target is known.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::ast::{ClassItem, Definition, Expr, Grammar};
use crate::bytecode::{Instr, Opcode, Program, rel_from};
use crate::charset::Charset;
use crate::diagnostic::Span;
use crate::error::{Error, Result};
use crate::parser;
use crate::symbols::SymbolTable;

/// Name of the production called by automatic whitespace injection. A
/// grammar may define its own; otherwise a built-in one is synthesized.
pub const SPACING: &str = "Spacing";

/// Compile-time switches.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Inject automatic whitespace into non-syntactic productions.
    pub handle_spaces: bool,
    /// Capture the nodes matched by injected whitespace. Off by default:
    /// the `Spacing` production then compiles without capture
    /// instructions, so whitespace never shows up in the tree and never
    /// moves the reported failure position.
    pub capture_spaces: bool,
    /// Splice small non-recursive definitions into their call sites.
    /// Inlined call sites lose their `Node` wrapper, so this is off by
    /// default.
    pub inline: bool,
    /// Maximum AST node count for an inlining candidate.
    pub inline_threshold: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            handle_spaces: true,
            capture_spaces: false,
            inline: false,
            inline_threshold: 12,
        }
    }
}

/// Loads the source text behind an `@import` path.
///
/// The core never touches the file system; the CLI supplies a
/// filesystem-backed resolver and tests supply in-memory maps.
pub trait ImportResolver {
    fn load(&self, path: &str) -> Result<String>;
}

impl<S: std::hash::BuildHasher> ImportResolver for HashMap<String, String, S> {
    fn load(&self, path: &str) -> Result<String> {
        self.get(path).cloned().ok_or_else(|| {
            Error::syntax(format!("cannot resolve import \"{path}\""), Span::default())
        })
    }
}

/// Compiles grammars into programs.
pub struct Compiler<'r> {
    config: CompilerConfig,
    resolver: Option<&'r dyn ImportResolver>,
}

impl Default for Compiler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'r> Compiler<'r> {
    pub fn new() -> Self {
        Self {
            config: CompilerConfig::default(),
            resolver: None,
        }
    }

    pub fn with_config(config: CompilerConfig) -> Self {
        Self {
            config,
            resolver: None,
        }
    }

    /// Set the resolver consulted for `@import` paths.
    pub fn resolver(mut self, resolver: &'r dyn ImportResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Parse and compile grammar source text.
    pub fn compile(&self, source: &str) -> Result<Program> {
        self.compile_grammar(parser::parse(source)?)
    }

    /// Compile an already-parsed grammar.
    pub fn compile_grammar(&self, mut grammar: Grammar) -> Result<Program> {
        self.resolve_imports(&mut grammar, &mut Vec::new())?;

        if self.config.handle_spaces && !grammar.defs.iter().any(|d| d.name == SPACING) {
            grammar.defs.push(builtin_spacing());
        }

        let index = build_index(&grammar)?;
        check_identifiers(&grammar, &index)?;

        let nullable = compute_nullable(&grammar, &index);
        check_left_recursion(&grammar, &index, &nullable)?;
        check_repetitions(&grammar, &index, &nullable)?;
        let syntactic = compute_syntactic(&grammar);

        if self.config.handle_spaces {
            inject_spacing(&mut grammar, &syntactic);
        }

        let inline_set = if self.config.inline {
            pick_inlinable(&grammar, &index, self.config.inline_threshold)
        } else {
            HashSet::new()
        };

        debug!(
            "compiling {} definitions ({} syntactic, {} inlinable)",
            grammar.defs.len(),
            syntactic.iter().filter(|s| **s).count(),
            inline_set.len()
        );

        let emitter = Emitter {
            config: &self.config,
            grammar: &grammar,
            index: &index,
            syntactic: &syntactic,
            inline_set: &inline_set,
            code: Vec::new(),
            symbols: SymbolTable::new(),
            charsets: Vec::new(),
            def_pcs: vec![0; grammar.defs.len()],
            call_sites: Vec::new(),
            thrown: Vec::new(),
            capturing: true,
            list_ctx: false,
            in_term: false,
            current_sym: 0,
            current_def: 0,
            inline_stack: Vec::new(),
        };
        emitter.emit()
    }

    /// Merge imported productions (and their transitive dependencies) into
    /// the grammar. `stack` holds the chain of in-flight paths for cycle
    /// detection.
    fn resolve_imports(&self, grammar: &mut Grammar, stack: &mut Vec<String>) -> Result<()> {
        let imports = std::mem::take(&mut grammar.imports);
        for import in imports {
            if stack.contains(&import.from) {
                return Err(Error::syntax(
                    format!("import cycle through \"{}\"", import.from),
                    import.span,
                ));
            }
            let resolver = self.resolver.ok_or_else(|| {
                Error::syntax(
                    format!(
                        "cannot resolve import \"{}\": no import resolver configured",
                        import.from
                    ),
                    import.span,
                )
            })?;
            let source = resolver.load(&import.from)?;
            let mut module = parser::parse(&source)?;
            stack.push(import.from.clone());
            self.resolve_imports(&mut module, stack)?;
            stack.pop();

            let module_index: HashMap<&str, &Definition> =
                module.defs.iter().map(|d| (d.name.as_str(), d)).collect();

            let mut wanted: Vec<Definition> = Vec::new();
            let mut seen = HashSet::new();
            let mut queue = import.names.clone();
            while let Some(name) = queue.pop() {
                if !seen.insert(name.clone()) {
                    continue;
                }
                let def = module_index.get(name.as_str()).ok_or_else(|| {
                    Error::syntax(
                        format!("\"{}\" does not define '{}'", import.from, name),
                        import.span,
                    )
                })?;
                collect_identifiers(&def.expr, &mut queue);
                wanted.push((*def).clone());
            }

            for def in wanted {
                match grammar.defs.iter().find(|d| d.name == def.name) {
                    // Identical re-imports (shared dependencies) are fine.
                    Some(existing) if existing.expr == def.expr => {}
                    Some(_) => {
                        return Err(Error::syntax(
                            format!(
                                "imported production '{}' clashes with an existing definition",
                                def.name
                            ),
                            import.span,
                        ));
                    }
                    None => grammar.defs.push(def),
                }
            }
        }
        Ok(())
    }
}

fn builtin_spacing() -> Definition {
    let span = Span::default();
    Definition {
        name: SPACING.to_string(),
        expr: Expr::ZeroOrMore {
            expr: Box::new(Expr::Class {
                items: vec![
                    ClassItem::Single(b' '),
                    ClassItem::Single(b'\t'),
                    ClassItem::Single(b'\r'),
                    ClassItem::Single(b'\n'),
                ],
                span,
            }),
            span,
        },
        span,
    }
}

// ---------------------------------------------------------------------------
// Definition graph analyses
// ---------------------------------------------------------------------------

fn build_index(grammar: &Grammar) -> Result<HashMap<String, usize>> {
    let mut index = HashMap::new();
    for (i, def) in grammar.defs.iter().enumerate() {
        if index.insert(def.name.clone(), i).is_some() {
            return Err(Error::syntax(
                format!("duplicate definition of '{}'", def.name),
                def.span,
            ));
        }
    }
    Ok(index)
}

fn check_identifiers(grammar: &Grammar, index: &HashMap<String, usize>) -> Result<()> {
    fn walk(expr: &Expr, index: &HashMap<String, usize>) -> Result<()> {
        if let Expr::Identifier { name, span } = expr {
            if !index.contains_key(name) {
                return Err(Error::syntax(format!("unknown identifier '{name}'"), *span));
            }
        }
        for child in subexprs(expr) {
            walk(child, index)?;
        }
        Ok(())
    }
    for def in &grammar.defs {
        walk(&def.expr, index)?;
    }
    Ok(())
}

/// Child expressions, uniformly.
fn subexprs(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Sequence { items, .. } | Expr::Choice { items, .. } => items.iter().collect(),
        Expr::ZeroOrMore { expr, .. }
        | Expr::OneOrMore { expr, .. }
        | Expr::Optional { expr, .. }
        | Expr::And { expr, .. }
        | Expr::Not { expr, .. }
        | Expr::Lex { expr, .. }
        | Expr::Labeled { expr, .. }
        | Expr::ListPat { expr, .. } => vec![expr],
        _ => Vec::new(),
    }
}

fn collect_identifiers(expr: &Expr, out: &mut Vec<String>) {
    if let Expr::Identifier { name, .. } = expr {
        out.push(name.clone());
    }
    for child in subexprs(expr) {
        collect_identifiers(child, out);
    }
}

/// Least fixed point of "can match the empty string", per definition.
fn compute_nullable(grammar: &Grammar, index: &HashMap<String, usize>) -> Vec<bool> {
    let mut nullable = vec![false; grammar.defs.len()];
    loop {
        let mut changed = false;
        for (i, def) in grammar.defs.iter().enumerate() {
            if !nullable[i] && expr_nullable(&def.expr, index, &nullable) {
                nullable[i] = true;
                changed = true;
            }
        }
        if !changed {
            return nullable;
        }
    }
}

fn expr_nullable(expr: &Expr, index: &HashMap<String, usize>, nullable: &[bool]) -> bool {
    match expr {
        Expr::Literal { bytes, .. } => bytes.is_empty(),
        Expr::Class { .. } | Expr::Any { .. } | Expr::ListPat { .. } => false,
        Expr::Spacing { .. } => true,
        Expr::Identifier { name, .. } => index
            .get(name)
            .map(|&i| nullable[i])
            .unwrap_or(false),
        Expr::Sequence { items, .. } => {
            items.iter().all(|e| expr_nullable(e, index, nullable))
        }
        Expr::Choice { items, .. } => items.iter().any(|e| expr_nullable(e, index, nullable)),
        Expr::ZeroOrMore { .. } | Expr::Optional { .. } | Expr::And { .. } | Expr::Not { .. } => {
            true
        }
        Expr::OneOrMore { expr, .. } => expr_nullable(expr, index, nullable),
        Expr::Lex { expr, .. } | Expr::Labeled { expr, .. } => {
            expr_nullable(expr, index, nullable)
        }
    }
}

/// Reject `e*` / `e+` whose body can match the empty string; the machine
/// would loop forever on them.
fn check_repetitions(
    grammar: &Grammar,
    index: &HashMap<String, usize>,
    nullable: &[bool],
) -> Result<()> {
    fn walk(
        expr: &Expr,
        index: &HashMap<String, usize>,
        nullable: &[bool],
    ) -> Result<()> {
        if let Expr::ZeroOrMore { expr: body, span } | Expr::OneOrMore { expr: body, span } = expr
        {
            if expr_nullable(body, index, nullable) {
                return Err(Error::syntax(
                    "repetition body can match the empty string",
                    *span,
                ));
            }
        }
        for child in subexprs(expr) {
            walk(child, index, nullable)?;
        }
        Ok(())
    }
    for def in &grammar.defs {
        walk(&def.expr, index, nullable)?;
    }
    Ok(())
}

/// Definitions callable at the very start of `expr`, before any input is
/// consumed. List patterns descend a structural level first, so calls
/// inside them are well-founded and excluded here.
fn left_calls(
    expr: &Expr,
    index: &HashMap<String, usize>,
    nullable: &[bool],
    out: &mut Vec<usize>,
) {
    match expr {
        Expr::Identifier { name, .. } => {
            if let Some(&i) = index.get(name) {
                out.push(i);
            }
        }
        Expr::Sequence { items, .. } => {
            for item in items {
                left_calls(item, index, nullable, out);
                if !expr_nullable(item, index, nullable) {
                    break;
                }
            }
        }
        Expr::Choice { items, .. } => {
            for item in items {
                left_calls(item, index, nullable, out);
            }
        }
        Expr::ZeroOrMore { expr, .. }
        | Expr::OneOrMore { expr, .. }
        | Expr::Optional { expr, .. }
        | Expr::And { expr, .. }
        | Expr::Not { expr, .. }
        | Expr::Lex { expr, .. }
        | Expr::Labeled { expr, .. } => left_calls(expr, index, nullable, out),
        _ => {}
    }
}

fn check_left_recursion(
    grammar: &Grammar,
    index: &HashMap<String, usize>,
    nullable: &[bool],
) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        i: usize,
        grammar: &Grammar,
        index: &HashMap<String, usize>,
        nullable: &[bool],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Result<()> {
        colors[i] = Color::Gray;
        path.push(i);
        let mut calls = Vec::new();
        left_calls(&grammar.defs[i].expr, index, nullable, &mut calls);
        for j in calls {
            match colors[j] {
                Color::Gray => {
                    let start = path.iter().position(|&p| p == j).unwrap_or(0);
                    let cycle: Vec<&str> = path[start..]
                        .iter()
                        .chain(std::iter::once(&j))
                        .map(|&p| grammar.defs[p].name.as_str())
                        .collect();
                    return Err(Error::syntax(
                        format!("left-recursive cycle: {}", cycle.join(" -> ")),
                        grammar.defs[j].span,
                    ));
                }
                Color::White => visit(j, grammar, index, nullable, colors, path)?,
                Color::Black => {}
            }
        }
        path.pop();
        colors[i] = Color::Black;
        Ok(())
    }

    let mut colors = vec![Color::White; grammar.defs.len()];
    for i in 0..grammar.defs.len() {
        if colors[i] == Color::White {
            visit(i, grammar, index, nullable, &mut colors, &mut Vec::new())?;
        }
    }
    Ok(())
}

/// A production is syntactic when its body matches terminals only: a
/// non-terminal reference anywhere makes it non-syntactic and opts it
/// into whitespace injection. Syntactic productions behave like tokens;
/// their callers handle the surrounding space. List patterns count as
/// syntactic because they are structural: whitespace injection has no
/// business inside them.
fn compute_syntactic(grammar: &Grammar) -> Vec<bool> {
    fn expr_syntactic(expr: &Expr) -> bool {
        match expr {
            Expr::Identifier { .. } => false,
            Expr::ListPat { .. } => true,
            Expr::Literal { .. } | Expr::Class { .. } | Expr::Any { .. } | Expr::Spacing { .. } => {
                true
            }
            other => subexprs(other).iter().all(|e| expr_syntactic(e)),
        }
    }

    grammar
        .defs
        .iter()
        .map(|def| expr_syntactic(&def.expr))
        .collect()
}

// ---------------------------------------------------------------------------
// Automatic whitespace injection
// ---------------------------------------------------------------------------

/// Insert `Spacing` calls before every sequence element of non-syntactic
/// productions. Injection never descends into predicates, lexified
/// subtrees, or list patterns, and a `#e` element does not receive the
/// spacing that would otherwise precede it: its boundary is lexical.
/// There is no injection after a sequence's last element.
fn inject_spacing(grammar: &mut Grammar, syntactic: &[bool]) {
    for (i, def) in grammar.defs.iter_mut().enumerate() {
        if syntactic[i] || def.name == SPACING {
            continue;
        }
        let body = std::mem::replace(&mut def.expr, Expr::empty(def.span));
        def.expr = inject_expr(body);
    }
}

fn inject_expr(expr: Expr) -> Expr {
    match expr {
        Expr::Sequence { items, span } => {
            let mut out = Vec::with_capacity(items.len() * 2);
            for item in items {
                if !matches!(item, Expr::Lex { .. } | Expr::ListPat { .. }) {
                    let at = item.span().start;
                    out.push(Expr::Spacing {
                        span: Span::new(at, at),
                    });
                }
                out.push(inject_expr(item));
            }
            Expr::Sequence { items: out, span }
        }
        Expr::Choice { items, span } => Expr::Choice {
            items: items.into_iter().map(inject_expr).collect(),
            span,
        },
        Expr::ZeroOrMore { expr, span } => Expr::ZeroOrMore {
            expr: Box::new(inject_expr(*expr)),
            span,
        },
        Expr::OneOrMore { expr, span } => Expr::OneOrMore {
            expr: Box::new(inject_expr(*expr)),
            span,
        },
        Expr::Optional { expr, span } => Expr::Optional {
            expr: Box::new(inject_expr(*expr)),
            span,
        },
        Expr::Labeled { expr, label, span } => Expr::Labeled {
            expr: Box::new(inject_expr(*expr)),
            label,
            span,
        },
        // Predicates match without consuming and receive no spacing; `#e`
        // and `{ e }` suppress injection for their whole subtree.
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Inlining
// ---------------------------------------------------------------------------

fn expr_size(expr: &Expr) -> usize {
    1 + subexprs(expr).iter().map(|e| expr_size(e)).sum::<usize>()
}

/// Definitions that may be spliced into call sites: small and not part of
/// any call cycle. Every definition keeps its standalone block either way,
/// so entry points and recovery bodies are unaffected.
fn pick_inlinable(
    grammar: &Grammar,
    index: &HashMap<String, usize>,
    threshold: usize,
) -> HashSet<usize> {
    fn reaches(
        from: usize,
        target: usize,
        grammar: &Grammar,
        index: &HashMap<String, usize>,
        seen: &mut HashSet<usize>,
    ) -> bool {
        if !seen.insert(from) {
            return false;
        }
        let mut names = Vec::new();
        collect_identifiers(&grammar.defs[from].expr, &mut names);
        for name in names {
            if let Some(&j) = index.get(&name) {
                if j == target || reaches(j, target, grammar, index, seen) {
                    return true;
                }
            }
        }
        false
    }

    let mut inlinable = HashSet::new();
    for (i, def) in grammar.defs.iter().enumerate() {
        if def.name == SPACING || expr_size(&def.expr) > threshold {
            continue;
        }
        if !reaches(i, i, grammar, index, &mut HashSet::new()) {
            inlinable.insert(i);
        }
    }
    inlinable
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Capture kind operand values for `CapOpen` / `CapClose`.
const CAP_NODE: u16 = 0;
const CAP_TERM: u16 = 1;

struct Emitter<'g> {
    config: &'g CompilerConfig,
    grammar: &'g Grammar,
    index: &'g HashMap<String, usize>,
    syntactic: &'g [bool],
    inline_set: &'g HashSet<usize>,
    code: Vec<Instr>,
    symbols: SymbolTable,
    charsets: Vec<Charset>,
    def_pcs: Vec<u32>,
    /// Call instructions awaiting their target (pc, definition index).
    call_sites: Vec<(usize, usize)>,
    /// Label symbols that appear in a `Throw`.
    thrown: Vec<u16>,
    /// False while emitting a quiet `Spacing` body.
    capturing: bool,
    /// True inside a `{ … }` pattern.
    list_ctx: bool,
    /// True inside a whole-body terminal capture of a leaf definition.
    in_term: bool,
    current_sym: u16,
    current_def: usize,
    inline_stack: Vec<usize>,
}

impl Emitter<'_> {
    fn emit(mut self) -> Result<Program> {
        // Preamble: call the start production, then halt. Matches started
        // at another entry point return straight to the halt.
        self.call_sites.push((0, 0));
        self.push(Instr::op_s(Opcode::Call, 0));
        self.push(Instr::op0(Opcode::Halt));

        for i in 0..self.grammar.defs.len() {
            self.def_pcs[i] = self.code.len() as u32;
            self.emit_def(i)?;
        }

        let call_sites = std::mem::take(&mut self.call_sites);
        for (pc, def) in call_sites {
            let target = self.def_pcs[def] as usize;
            self.code[pc] = Instr::op_s(Opcode::Call, rel_from(pc, target));
        }

        if self.code.len() > u16::MAX as usize {
            return Err(Error::syntax(
                "program exceeds the module instruction limit",
                self.grammar.span,
            ));
        }

        let mut entries = Vec::new();
        for (i, def) in self.grammar.defs.iter().enumerate() {
            let sym = self.symbols.intern(&def.name)?;
            entries.push((sym, self.def_pcs[i]));
        }

        let mut recovery = Vec::new();
        let mut bound: HashSet<u16> = HashSet::new();
        for &label in &self.thrown {
            if !bound.insert(label) {
                continue;
            }
            let name = self.symbols.name(label).to_string();
            if let Some(&def) = self.index.get(&name) {
                recovery.push((label, self.def_pcs[def]));
            }
        }

        debug!(
            "emitted {} instructions, {} symbols, {} charsets",
            self.code.len(),
            self.symbols.len(),
            self.charsets.len()
        );

        Ok(Program {
            symbols: self.symbols,
            charsets: self.charsets,
            code: self.code,
            recovery,
            entries,
        })
    }

    fn emit_def(&mut self, i: usize) -> Result<()> {
        let def = &self.grammar.defs[i];
        let sym = self.symbols.intern(&def.name)?;
        self.current_sym = sym;
        self.current_def = i;

        // A quiet Spacing body carries no capture instructions at all, so
        // injected whitespace neither shows up in the tree nor advances
        // the reported failure position.
        let quiet = def.name == SPACING && !self.config.capture_spaces;
        self.capturing = !quiet;

        // Leaf definitions (terminal-only bodies with no calls) capture
        // their whole match as one string instead of one per atom.
        let leaf = self.capturing && self.syntactic[i] && is_leaf_body(&def.expr);

        if self.capturing {
            self.push(Instr::op_pair(Opcode::CapOpen, CAP_NODE, sym));
        }
        if leaf {
            self.push(Instr::op_pair(Opcode::CapOpen, CAP_TERM, sym));
            self.in_term = true;
        }

        self.emit_expr(&def.expr)?;

        if leaf {
            self.in_term = false;
            self.push(Instr::op_pair(Opcode::CapClose, CAP_TERM, sym));
        }
        if self.capturing {
            self.push(Instr::op_pair(Opcode::CapClose, CAP_NODE, sym));
        }
        self.push(Instr::op0(Opcode::Return));
        self.capturing = true;
        Ok(())
    }

    fn emit_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Sequence { items, .. } => {
                for item in items {
                    self.emit_expr(item)?;
                }
                Ok(())
            }

            Expr::Choice { items, .. } => self.emit_choice(items),

            Expr::ZeroOrMore { expr, .. } => self.emit_star(expr),

            // e+ desugars to e e*.
            Expr::OneOrMore { expr, .. } => {
                self.emit_expr(expr)?;
                self.emit_star(expr)
            }

            // e? desugars to &e e / !e.
            Expr::Optional { expr, .. } => {
                let choice = self.placeholder(Opcode::Choice);
                self.emit_and(expr)?;
                self.emit_expr(expr)?;
                let commit = self.placeholder(Opcode::Commit);
                self.patch(choice, Opcode::Choice);
                self.emit_not(expr)?;
                self.patch(commit, Opcode::Commit);
                Ok(())
            }

            Expr::And { expr, .. } => self.emit_and(expr),
            Expr::Not { expr, .. } => self.emit_not(expr),

            // Lexification only matters to the injection pass.
            Expr::Lex { expr, .. } => self.emit_expr(expr),

            // e^l desugars to e / throw l.
            Expr::Labeled { expr, label, .. } => {
                let name = self.label_name(expr, label);
                let sym = self.symbols.intern(&name)?;
                let choice = self.placeholder(Opcode::Choice);
                self.emit_expr(expr)?;
                let commit = self.placeholder(Opcode::Commit);
                self.patch(choice, Opcode::Choice);
                self.thrown.push(sym);
                self.push(Instr::op_u(Opcode::Throw, u32::from(sym)));
                self.patch(commit, Opcode::Commit);
                Ok(())
            }

            Expr::ListPat { expr, .. } => {
                self.push(Instr::op0(Opcode::Open));
                let saved = self.list_ctx;
                self.list_ctx = true;
                self.emit_expr(expr)?;
                self.list_ctx = saved;
                self.push(Instr::op0(Opcode::Close));
                Ok(())
            }

            Expr::Identifier { name, .. } => {
                let def = self.index[name];
                if self.inline_set.contains(&def) && !self.inline_stack.contains(&def) {
                    self.inline_stack.push(def);
                    let body = &self.grammar.defs[def].expr;
                    self.emit_expr(body)?;
                    self.inline_stack.pop();
                } else {
                    self.call_sites.push((self.code.len(), def));
                    self.push(Instr::op_s(Opcode::Call, 0));
                }
                Ok(())
            }

            Expr::Spacing { .. } => {
                let def = self.index[SPACING];
                self.call_sites.push((self.code.len(), def));
                self.push(Instr::op_s(Opcode::Call, 0));
                Ok(())
            }

            Expr::Literal { bytes, .. } => {
                if self.list_ctx {
                    let text = String::from_utf8_lossy(bytes).into_owned();
                    let sym = self.symbols.intern(&text)?;
                    self.push(Instr::op_u(Opcode::Atom, u32::from(sym)));
                    return Ok(());
                }
                if bytes.is_empty() {
                    return Ok(());
                }
                let wrap = self.atom_wrap();
                for &b in bytes {
                    self.push(Instr::op_u(Opcode::Char, u32::from(b)));
                    self.capchar();
                }
                self.close_wrap(wrap);
                Ok(())
            }

            Expr::Class { items, span } => {
                if self.list_ctx {
                    return Err(Error::syntax(
                        "character class not allowed inside a list pattern",
                        *span,
                    ));
                }
                let wrap = self.atom_wrap();
                self.emit_class(items, *span)?;
                self.capchar();
                self.close_wrap(wrap);
                Ok(())
            }

            Expr::Any { .. } => {
                if self.list_ctx {
                    self.push(Instr::op0(Opcode::Any));
                    return Ok(());
                }
                let wrap = self.atom_wrap();
                self.push(Instr::op0(Opcode::Any));
                self.capchar();
                self.close_wrap(wrap);
                Ok(())
            }
        }
    }

    /// `e*` compiles to `choice Lend; Lbody: <e>; partial_commit Lbody; Lend:`
    /// with the frame pushed once and refreshed per iteration.
    fn emit_star(&mut self, body: &Expr) -> Result<()> {
        let choice = self.placeholder(Opcode::Choice);
        let body_pc = self.code.len();
        self.emit_expr(body)?;
        let pc = self.code.len();
        self.push(Instr::op_s(Opcode::PartialCommit, rel_from(pc, body_pc)));
        self.patch(choice, Opcode::Choice);
        Ok(())
    }

    /// `&e` compiles to `choicep L1; <e>; back_commit L2; L1: fail; L2:`.
    fn emit_and(&mut self, body: &Expr) -> Result<()> {
        let choice = self.placeholder(Opcode::ChoiceP);
        self.emit_expr(body)?;
        let back = self.placeholder(Opcode::BackCommit);
        self.patch(choice, Opcode::ChoiceP);
        self.push(Instr::op0(Opcode::Fail));
        self.patch(back, Opcode::BackCommit);
        Ok(())
    }

    /// `!e` compiles to `choicep L1; <e>; fail_twice; L1:`.
    fn emit_not(&mut self, body: &Expr) -> Result<()> {
        let choice = self.placeholder(Opcode::ChoiceP);
        self.emit_expr(body)?;
        self.push(Instr::op0(Opcode::FailTwice));
        self.patch(choice, Opcode::ChoiceP);
        Ok(())
    }

    fn emit_choice(&mut self, items: &[Expr]) -> Result<()> {
        if items.len() == 1 {
            return self.emit_expr(&items[0]);
        }
        let mut commits = Vec::new();
        for (k, item) in items.iter().enumerate() {
            if k + 1 == items.len() {
                self.emit_expr(item)?;
            } else {
                let choice = self.placeholder(Opcode::Choice);
                self.emit_expr(item)?;
                commits.push(self.placeholder(Opcode::Commit));
                self.patch(choice, Opcode::Choice);
            }
        }
        for commit in commits {
            self.patch(commit, Opcode::Commit);
        }
        Ok(())
    }

    /// A class with one member becomes `char`, one range becomes `span`,
    /// anything else a `set` over a (de-duplicated) charset table entry.
    fn emit_class(&mut self, items: &[ClassItem], span: Span) -> Result<()> {
        match items {
            [ClassItem::Single(b)] => {
                self.push(Instr::op_u(Opcode::Char, u32::from(*b)));
            }
            [ClassItem::Range(lo, hi)] => {
                self.push(Instr::op_pair(Opcode::Span, u16::from(*lo), u16::from(*hi)));
            }
            _ => {
                let mut set = Charset::new();
                for item in items {
                    match *item {
                        ClassItem::Single(b) => set.insert(b),
                        ClassItem::Range(lo, hi) => set.insert_range(lo, hi),
                    }
                }
                let idx = match self.charsets.iter().position(|s| *s == set) {
                    Some(idx) => idx,
                    None => {
                        if self.charsets.len() >= u16::MAX as usize {
                            return Err(Error::syntax("charset table overflow", span));
                        }
                        self.charsets.push(set);
                        self.charsets.len() - 1
                    }
                };
                self.push(Instr::op_u(Opcode::Set, idx as u32));
            }
        }
        Ok(())
    }

    /// Label for `e^label`, deriving one when the caret was bare: a
    /// reference keeps its own name, a literal its text, anything else
    /// falls back to the enclosing definition's name.
    fn label_name(&self, expr: &Expr, label: &Option<String>) -> String {
        if let Some(l) = label {
            return l.clone();
        }
        match expr {
            Expr::Identifier { name, .. } => name.clone(),
            Expr::Literal { bytes, .. } => String::from_utf8_lossy(bytes).into_owned(),
            _ => self.grammar.defs[self.current_def].name.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Instruction plumbing
    // -----------------------------------------------------------------------

    fn push(&mut self, instr: Instr) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    /// Emit `op` with a zero operand; the caller patches it later.
    fn placeholder(&mut self, op: Opcode) -> usize {
        self.push(Instr::op_s(op, 0))
    }

    /// Point the placeholder at `pc` to the next emitted instruction.
    fn patch(&mut self, pc: usize, op: Opcode) {
        let target = self.code.len();
        self.code[pc] = Instr::op_s(op, rel_from(pc, target));
    }

    fn capchar(&mut self) {
        if self.capturing {
            self.push(Instr::op0(Opcode::CapChar));
        }
    }

    /// Open a per-atom terminal capture unless one is already open for the
    /// whole definition body.
    fn atom_wrap(&mut self) -> bool {
        if self.capturing && !self.in_term {
            self.push(Instr::op_pair(Opcode::CapOpen, CAP_TERM, self.current_sym));
            true
        } else {
            false
        }
    }

    fn close_wrap(&mut self, wrap: bool) {
        if wrap {
            self.push(Instr::op_pair(Opcode::CapClose, CAP_TERM, self.current_sym));
        }
    }
}

/// A body the whole-match terminal capture applies to: terminals and
/// control only, no calls and no structural patterns.
fn is_leaf_body(expr: &Expr) -> bool {
    match expr {
        Expr::Identifier { .. } | Expr::Spacing { .. } | Expr::ListPat { .. } => false,
        other => subexprs(other).iter().all(|e| is_leaf_body(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Result<Program> {
        Compiler::new().compile(src)
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let err = compile("S <- 'a'\nS <- 'b'").unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        let err = compile("S <- Missing").unwrap_err();
        assert!(err.to_string().contains("unknown identifier"), "{err}");
    }

    #[test]
    fn left_recursion_is_rejected_with_the_cycle() {
        let err = compile("A <- B 'x'\nB <- A / 'b'").unwrap_err();
        assert!(err.to_string().contains("left-recursive"), "{err}");

        let err = compile("A <- A 'a'").unwrap_err();
        assert!(err.to_string().contains("A -> A"), "{err}");
    }

    #[test]
    fn left_recursion_behind_a_nullable_prefix_is_caught() {
        let err = compile("A <- 'x'? A").unwrap_err();
        assert!(err.to_string().contains("left-recursive"), "{err}");
    }

    #[test]
    fn recursion_that_consumes_first_is_fine() {
        compile("A <- 'x' A / 'x'").unwrap();
    }

    #[test]
    fn nullable_repetition_bodies_are_rejected() {
        for src in ["S <- ('x'?)*", "S <- ('' / 'a')+", "S <- (!'a')*"] {
            let err = compile(src).unwrap_err();
            assert!(err.to_string().contains("repetition"), "{src}: {err}");
        }
    }

    #[test]
    fn recursion_through_list_patterns_is_allowed() {
        compile("Tree <- { 'Node' Tree* }").unwrap();
    }

    #[test]
    fn every_definition_gets_an_entry_point() {
        let program = compile("S <- A '+' A\nA <- '0' / '1'").unwrap();
        assert!(program.entry("S").is_some());
        assert!(program.entry("A").is_some());
        assert!(program.entry("Spacing").is_some());
        assert!(program.entry("Nope").is_none());
    }

    #[test]
    fn spacing_is_not_synthesized_when_disabled() {
        let config = CompilerConfig {
            handle_spaces: false,
            ..CompilerConfig::default()
        };
        let program = Compiler::with_config(config).compile("S <- 'a'").unwrap();
        assert!(program.entry("Spacing").is_none());
    }

    #[test]
    fn user_defined_spacing_wins() {
        let program = compile("S <- A A\nA <- 'a'\nSpacing <- ';'*").unwrap();
        assert!(program.entry("Spacing").is_some());
    }

    #[test]
    fn labels_bind_recovery_to_same_named_definitions() {
        let program =
            compile("S <- 'a' 'b'^sync\nsync <- (!';' .)* ';'").unwrap();
        let sym = program.symbols().lookup("sync").unwrap();
        assert_eq!(program.recovery_pc(sym), program.entry("sync"));
    }

    #[test]
    fn unbound_labels_have_no_recovery() {
        let program = compile("S <- 'a'^oops").unwrap();
        let sym = program.symbols().lookup("oops").unwrap();
        assert_eq!(program.recovery_pc(sym), None);
    }

    #[test]
    fn import_cycles_are_rejected() {
        let mut files = HashMap::new();
        files.insert(
            "a.peg".to_string(),
            "@import B from \"b.peg\"\nA <- B".to_string(),
        );
        files.insert(
            "b.peg".to_string(),
            "@import A from \"a.peg\"\nB <- A".to_string(),
        );
        let err = Compiler::new()
            .resolver(&files)
            .compile("@import A from \"a.peg\"\nS <- A")
            .unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn imports_pull_transitive_dependencies() {
        let mut files = HashMap::new();
        files.insert(
            "num.peg".to_string(),
            "Number <- Digit+\nDigit <- [0-9]".to_string(),
        );
        let program = Compiler::new()
            .resolver(&files)
            .compile("@import Number from \"num.peg\"\nS <- Number")
            .unwrap();
        assert!(program.entry("Number").is_some());
        assert!(program.entry("Digit").is_some());
    }

    #[test]
    fn import_name_clashes_are_rejected() {
        let mut files = HashMap::new();
        files.insert("m.peg".to_string(), "A <- 'x'".to_string());
        let err = Compiler::new()
            .resolver(&files)
            .compile("@import A from \"m.peg\"\nA <- 'y'\nS <- A")
            .unwrap_err();
        assert!(err.to_string().contains("clashes"), "{err}");
    }

    #[test]
    fn imports_without_a_resolver_fail() {
        let err = compile("@import A from \"m.peg\"\nS <- A").unwrap_err();
        assert!(err.to_string().contains("no import resolver"), "{err}");
    }

    #[test]
    fn charsets_are_deduplicated() {
        let program = compile("S <- [abc] [abc] [xyz]").unwrap();
        let mut sets = 0;
        for pc in 0..program.len() {
            if program.instr(pc).unwrap().opcode().unwrap() == Opcode::Set {
                sets += 1;
            }
        }
        assert_eq!(sets, 3);
        assert!(program.charset(0).is_some());
        assert!(program.charset(1).is_some());
        assert!(program.charset(2).is_none());
    }

    #[test]
    fn single_range_classes_become_span_not_set() {
        let program = compile("S <- [a-z]").unwrap();
        let has_span = (0..program.len())
            .any(|pc| program.instr(pc).unwrap().opcode().unwrap() == Opcode::Span);
        assert!(has_span);
        assert!(program.charset(0).is_none());
    }

    #[test]
    fn disassembly_mentions_productions() {
        let program = compile("S <- 'a'").unwrap();
        let listing = program.to_string();
        assert!(listing.contains("S:"), "{listing}");
        assert!(listing.contains("char"), "{listing}");
    }
}
