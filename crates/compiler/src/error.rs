//! Compile-time error types.

use shannon_runtime::RuntimeError;

/// Source position attached to parse errors and to code-generator errors
/// once the front end knows where it was.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.file, self.line)
    }
}

/// Everything that can stop a compilation unit.
///
/// The generator raises location-free errors; the parser wraps them with the
/// position of the statement being compiled before they escape.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Lexical or syntax error
    Parse { loc: SourceLoc, msg: String },
    /// Simulation stack / type system rejected a generator operation
    Type(String),
    UnknownIdent(String),
    Duplicate(String),
    NotLValue(String),
    /// A forward jump outran the signed 16-bit offset
    JumpTooFar,
    Subrange(String),
    ValueOutOfRange(i64),
    /// A compile-time VM run failed; carries the runtime message
    ConstExpr(String),
    /// Guarded invariant failed inside the generator; numeric code for triage
    Internal(u16, &'static str),
    /// Generator error re-wrapped with a position by the front end
    At(SourceLoc, Box<CompileError>),
}

pub type CompileResult<T> = Result<T, CompileError>;

impl CompileError {
    pub fn internal(code: u16, msg: &'static str) -> CompileError {
        CompileError::Internal(code, msg)
    }

    /// Attach a position unless one is already present.
    pub fn at(self, loc: SourceLoc) -> CompileError {
        match self {
            CompileError::Parse { .. } | CompileError::At(..) => self,
            other => CompileError::At(loc, Box::new(other)),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Parse { loc, msg } => write!(f, "{}: {}", loc, msg),
            CompileError::Type(msg) => write!(f, "{}", msg),
            CompileError::UnknownIdent(id) => write!(f, "Unknown identifier: {}", id),
            CompileError::Duplicate(id) => write!(f, "Duplicate identifier: {}", id),
            CompileError::NotLValue(msg) => write!(f, "{}", msg),
            CompileError::JumpTooFar => write!(f, "Jump target is too far away"),
            CompileError::Subrange(msg) => write!(f, "{}", msg),
            CompileError::ValueOutOfRange(v) => write!(f, "Value out of range: {}", v),
            CompileError::ConstExpr(msg) => {
                write!(f, "Error in constant expression: {}", msg)
            }
            CompileError::Internal(code, msg) => {
                write!(f, "Internal error [{:#06x}]: {}", code, msg)
            }
            CompileError::At(loc, inner) => write!(f, "{}: {}", loc, inner),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<RuntimeError> for CompileError {
    fn from(e: RuntimeError) -> Self {
        CompileError::ConstExpr(e.to_string())
    }
}

/// Top-level error for the execution context and the driver.
#[derive(Debug)]
pub enum ShannonError {
    Compile(CompileError),
    Runtime(RuntimeError),
    Io(String),
}

impl std::fmt::Display for ShannonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShannonError::Compile(e) => write!(f, "{}", e),
            ShannonError::Runtime(e) => write!(f, "{}", e),
            ShannonError::Io(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ShannonError {}

impl From<CompileError> for ShannonError {
    fn from(e: CompileError) -> Self {
        ShannonError::Compile(e)
    }
}

impl From<RuntimeError> for ShannonError {
    fn from(e: RuntimeError) -> Self {
        ShannonError::Runtime(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_does_not_rewrap() {
        let loc = SourceLoc { file: "m.shn".into(), line: 3 };
        let e = CompileError::Type("Type mismatch".into()).at(loc.clone());
        let same = e.clone().at(SourceLoc { file: "other".into(), line: 9 });
        assert_eq!(e, same);
    }

    #[test]
    fn test_display_with_location() {
        let loc = SourceLoc { file: "m.shn".into(), line: 3 };
        let e = CompileError::UnknownIdent("foo".into()).at(loc);
        assert_eq!(e.to_string(), "m.shn(3): Unknown identifier: foo");
    }
}
