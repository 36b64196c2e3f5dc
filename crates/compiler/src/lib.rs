//! Shannon compiler library.
//!
//! Source text compiles to bytecode for a stack-based virtual machine and
//! runs inside an execution [`Context`]. The pipeline: lexer → recursive
//! descent parser (`compiler`/`compexpr`) → code generator (`codegen`) →
//! code segments (`codeseg`) interpreted by the VM (`vm`). Reified type
//! descriptors (`typesys`) tie the generator and the interpreter together;
//! constant expressions are folded by running the interpreter at compile
//! time.

pub mod codegen;
pub mod codeseg;
pub mod compexpr;
pub mod compiler;
pub mod context;
pub mod error;
pub mod lexer;
pub mod options;
pub mod symbols;
pub mod typesys;
pub mod vm;

pub use codegen::CodeGen;
pub use codeseg::{CodeSeg, Op};
pub use compiler::Compiler;
pub use context::Context;
pub use error::{CompileError, ShannonError, SourceLoc};
pub use options::CompilerOptions;
pub use typesys::{QueenBee, State, Type, TypeId, TypeRef};

use shannon_runtime::Variant;
use std::path::Path;

/// Compile and run a program file with default options, capturing output.
/// Returns the program result and everything `echo`/`dump` wrote.
pub fn run_file_captured(path: &Path) -> Result<(Variant, String), ShannonError> {
    run_file_captured_with(path, CompilerOptions::default())
}

pub fn run_file_captured_with(
    path: &Path,
    options: CompilerOptions,
) -> Result<(Variant, String), ShannonError> {
    let mut ctx = Context::new(options);
    let mut out: Vec<u8> = Vec::new();
    let result = ctx.execute_with_output(path, &mut out)?;
    Ok((result, String::from_utf8_lossy(&out).to_string()))
}
