//! Scanner and single-pass bytecode compiler: turns Ember source text
//! directly into a top-level function's bytecode, with no intermediate AST.

pub mod compiler;
pub mod opcode;
pub mod scanner;

pub use compiler::{CompileError, Compiler};
pub use opcode::OpCode;
pub use scanner::{Scanner, Token, TokenKind};

use ember_core::handle::{Heap, ObjHandle};
use ember_core::interner::Interner;

/// Compiles `source` into a top-level function handle, or the list of
/// diagnostics collected along the way.
pub fn compile(
    source: &str,
    module_name: &str,
    heap: &mut Heap,
    interner: &mut Interner,
) -> Result<ObjHandle, Vec<CompileError>> {
    Compiler::compile(source, module_name, heap, interner)
}
