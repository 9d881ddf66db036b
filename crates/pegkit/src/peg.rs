use crate::bytecode::Program;
use crate::compiler::{Compiler, CompilerConfig, ImportResolver};
use crate::error::Result;
use crate::listvm::ListVm;
use crate::value::Value;
use crate::vm::{Match, Options, Vm};

/// A compiled grammar, ready to match inputs.
///
/// This is the one-stop entry point: it owns the compiled [`Program`] and
/// fronts both machines. For non-default compilation (whitespace handling,
/// inlining, imports) go through [`Peg::builder`].
///
/// # Example
///
/// ```
/// use pegkit::Peg;
///
/// let peg = Peg::compile("S <- A '+' A\nA <- '0' / '1'").unwrap();
/// let m = peg.run(b"1+1").unwrap();
/// assert_eq!(m.consumed, 3);
/// assert_eq!(m.value.unwrap().to_string(), r#"(S (A "1") "+" (A "1"))"#);
/// ```
pub struct Peg {
    program: Program,
}

impl Peg {
    /// Compile grammar source with the default configuration.
    pub fn compile(source: &str) -> Result<Peg> {
        Ok(Peg {
            program: Compiler::new().compile(source)?,
        })
    }

    /// Start a compilation with non-default settings.
    ///
    /// # Example
    ///
    /// ```
    /// use pegkit::Peg;
    ///
    /// // Without whitespace handling, spaces must be matched explicitly.
    /// let source = "S <- A B\nA <- 'a'\nB <- 'b'";
    /// let strict = Peg::builder().handle_spaces(false).compile(source).unwrap();
    /// assert!(strict.run(b"a b").is_err());
    ///
    /// let relaxed = Peg::compile(source).unwrap();
    /// assert!(relaxed.run(b"a b").is_ok());
    /// ```
    pub fn builder<'r>() -> PegBuilder<'r> {
        PegBuilder {
            config: CompilerConfig::default(),
            resolver: None,
        }
    }

    /// Wrap an already-loaded program (see [`Program::load`]).
    pub fn from_program(program: Program) -> Peg {
        Peg { program }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Match `input` from the grammar's first production.
    pub fn run(&self, input: &[u8]) -> Result<Match> {
        self.run_with(input, &Options::default())
    }

    /// Match `input` with explicit [`Options`].
    pub fn run_with(&self, input: &[u8], options: &Options) -> Result<Match> {
        Vm::new(&self.program).run(input, options)
    }

    /// Match a [`Value`] tree with the list machine. The grammar should be
    /// written with `{ … }` patterns.
    pub fn run_list(&self, subject: &Value) -> Result<Match> {
        self.run_list_with(subject, &Options::default())
    }

    pub fn run_list_with(&self, subject: &Value, options: &Options) -> Result<Match> {
        ListVm::new(&self.program).run(subject, options)
    }
}

/// Compilation settings for [`Peg`].
pub struct PegBuilder<'r> {
    config: CompilerConfig,
    resolver: Option<&'r dyn ImportResolver>,
}

impl<'r> PegBuilder<'r> {
    /// Toggle automatic whitespace injection (on by default).
    pub fn handle_spaces(mut self, on: bool) -> Self {
        self.config.handle_spaces = on;
        self
    }

    /// Capture the nodes matched by injected whitespace (off by default).
    pub fn capture_spaces(mut self, on: bool) -> Self {
        self.config.capture_spaces = on;
        self
    }

    /// Inline small non-recursive definitions (off by default; inlined
    /// call sites lose their node wrappers).
    pub fn inline(mut self, on: bool) -> Self {
        self.config.inline = on;
        self
    }

    /// Resolver consulted for `@import` paths.
    pub fn resolver(mut self, resolver: &'r dyn ImportResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn compile(self, source: &str) -> Result<Peg> {
        let mut compiler = Compiler::with_config(self.config);
        if let Some(resolver) = self.resolver {
            compiler = compiler.resolver(resolver);
        }
        Ok(Peg {
            program: compiler.compile(source)?,
        })
    }
}
