#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "bytecode operands are narrowed by design")]
#![expect(clippy::cast_sign_loss, reason = "heap slot indices are always non-negative")]
#![expect(clippy::cast_precision_loss, reason = "int-to-double promotion is part of the language")]
#![expect(clippy::too_many_arguments, reason = "call-frame construction mirrors the VM's own protocol")]
#![expect(clippy::unreadable_literal, reason = "bit-packed opcode constants keep canonical forms")]

mod chunk;
mod compiler;
mod error;
mod heap;
mod lexer;
mod natives;
mod op;
mod tracer;
mod value;
mod vm;

pub use crate::{
    chunk::Chunk,
    error::{Diagnostic, LoxError, RuntimeError, StackFrame},
    heap::{GcConfig, HeapStats},
    lexer::{Lexer, Token, TokenKind},
    op::Opcode,
    tracer::{NoopTracer, TracingTracer, VmTracer},
    value::Value,
    vm::Vm,
};

use std::io::Write;

/// Compiles and runs a complete program, writing its `echo`/`print` output to `out`.
///
/// This is the single entry point embedders and the CLI front end use; it owns the
/// whole compile-then-execute pipeline so callers never have to sequence a
/// compiler and a [`Vm`] by hand.
pub fn run_source(source: &str, out: &mut dyn Write, config: GcConfig) -> Result<(), LoxError> {
    let mut vm = Vm::new(config);
    let function = vm.compile(source)?;
    vm.interpret(function, out)?;
    Ok(())
}
