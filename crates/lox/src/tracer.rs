//! Zero-cost execution tracing hook points.
//!
//! The VM is generic over a [`VmTracer`] implementation so that a production
//! build paying for [`NoopTracer`] monomorphizes every hook away, while a
//! diagnostic build can wire up a tracer that forwards to the `tracing`
//! crate (see `crates/lox-cli` for the `-v` wiring) without the VM's hot
//! loop ever branching on "is tracing enabled".

use crate::op::Opcode;

pub trait VmTracer {
    /// Called immediately before the opcode at `ip` is dispatched.
    fn before_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        let _ = (ip, opcode, stack_depth);
    }

    /// Called when a call frame is pushed, naming the callee.
    fn on_call(&mut self, callee_name: &str, argc: usize) {
        let _ = (callee_name, argc);
    }

    /// Called once a full collection has run.
    fn on_gc(&mut self, bytes_freed: usize, objects_freed: usize) {
        let _ = (bytes_freed, objects_freed);
    }
}

/// The default tracer: every hook is an empty inline function the optimizer
/// removes entirely.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Forwards every hook to the `tracing` crate at `trace`/`debug` level, for
/// use behind the CLI's `-v` flag.
#[derive(Debug, Default)]
pub struct TracingTracer;

impl VmTracer for TracingTracer {
    fn before_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize) {
        tracing::trace!(ip, %opcode, stack_depth, "dispatch");
    }

    fn on_call(&mut self, callee_name: &str, argc: usize) {
        tracing::debug!(callee_name, argc, "call");
    }

    fn on_gc(&mut self, bytes_freed: usize, objects_freed: usize) {
        tracing::debug!(bytes_freed, objects_freed, "gc");
    }
}
