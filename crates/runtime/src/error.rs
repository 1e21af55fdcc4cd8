//! Interpreter result types.

/// Why an `interpret` call failed. Diagnostics have already been written to
/// stderr by the time one of these is returned; the variant only tells the
/// caller which exit path to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    /// The source did not compile; no code ran.
    Compile,
    /// Execution raised a runtime error; the VM stack has been reset.
    Runtime,
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile => write!(f, "compile error"),
            InterpretError::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for InterpretError {}
