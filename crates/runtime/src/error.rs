//! Runtime error types.

/// Errors raised by variant accessors, containers and the interpreter.
///
/// `Exit` is not a failure: it is the cooperative program-exit signal and is
/// treated as normal termination by the execution context.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// A variant payload was observed as the wrong kind
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// An ordinal value fell outside its type's bounds
    Range(i64),
    /// Vector/string index out of bounds
    Index(i64),
    /// Dictionary or ordinal-set key not present / out of range
    Key(String),
    DivByZero,
    /// `assert` failed; carries the source condition and position
    Assertion {
        cond: String,
        file: String,
        line: u32,
    },
    /// A compile-time expression referenced a runtime variable
    ConstExprVar,
    /// Dispatch hit an opcode byte outside the frozen table (unreachable
    /// for generator-produced code)
    InvalidOpcode(u8),
    /// The `exit` operator was executed
    Exit,
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::KindMismatch { expected, found } => {
                write!(f, "Variant type mismatch: expected {}, found {}", expected, found)
            }
            RuntimeError::Range(v) => write!(f, "Value out of range: {}", v),
            RuntimeError::Index(i) => write!(f, "Index out of bounds: {}", i),
            RuntimeError::Key(k) => write!(f, "Key not found: {}", k),
            RuntimeError::DivByZero => write!(f, "Division by zero"),
            RuntimeError::Assertion { cond, file, line } => {
                write!(f, "Assertion failed \"{}\" at {}:{}", cond, file, line)
            }
            RuntimeError::ConstExprVar => {
                write!(f, "Variable used in constant expression")
            }
            RuntimeError::InvalidOpcode(b) => write!(f, "Invalid opcode: {:#04x}", b),
            RuntimeError::Exit => write!(f, "Exit called"),
            RuntimeError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<String> for RuntimeError {
    fn from(s: String) -> Self {
        RuntimeError::Other(s)
    }
}
