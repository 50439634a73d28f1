use std::fmt;

/// A single compile-time error: the source line it was reported at and a
/// human-readable message, following the `[line N] Error: message` format
/// the CLI prints to stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error: {}", self.line, self.message)
    }
}

/// One entry of a runtime stack trace, innermost call first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function_name: String,
    pub line: u32,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] in {}", self.line, self.function_name)
    }
}

/// A failure raised while executing already-compiled bytecode: an undefined
/// variable, a type mismatch, a failed `assert`, and so on. Carries the
/// frames live at the moment of the fault so the CLI can print a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<StackFrame>,
}

impl RuntimeError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), trace: Vec::new() }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// The top-level error domain split: compile errors never reach the VM, and
/// the VM only ever produces runtime errors. Mirrors the
/// compile-then-run-then-report pipeline shape of the crate's error
/// reporting: each stage converts into this type with `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoxError {
    Compile(Vec<Diagnostic>),
    Runtime(RuntimeError),
}

impl fmt::Display for LoxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoxError::Compile(diagnostics) => {
                for (i, d) in diagnostics.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{d}")?;
                }
                Ok(())
            }
            LoxError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoxError {}

impl From<Vec<Diagnostic>> for LoxError {
    fn from(diagnostics: Vec<Diagnostic>) -> Self {
        LoxError::Compile(diagnostics)
    }
}

impl From<RuntimeError> for LoxError {
    fn from(error: RuntimeError) -> Self {
        LoxError::Runtime(error)
    }
}

impl LoxError {
    /// The exit code the CLI reports, following the `sysexits.h` convention
    /// of distinguishing a bad input (`EX_DATAERR`) from a failure while
    /// running it (`EX_SOFTWARE`).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            LoxError::Compile(_) => 65,
            LoxError::Runtime(_) => 70,
        }
    }
}
