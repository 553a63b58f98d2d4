//! lox-runtime — the object model, the mark-and-sweep memory manager, and
//! the bytecode virtual machine.
//!
//! Layered on top of `lox-core`'s `Value`/`Table`/`ObjString`:
//!
//! - `opcode`/`chunk`: the bytecode format a compiled function's body is
//!   stored as.
//! - `objects`: the remaining heap object variants (functions, closures,
//!   upvalues, classes, instances, bound methods) that need tracing.
//! - `heap`: allocation, string interning, and the tracing collector.
//! - `vm`: the call-frame stack, value stack, and opcode dispatch loop.
//! - `disassemble`: a human-readable bytecode dump, compiled in only under
//!   the `trace-execution` feature.

pub mod chunk;
#[cfg(feature = "trace-execution")]
pub mod disassemble;
pub mod heap;
pub mod objects;
pub mod opcode;
pub mod vm;

pub use chunk::Chunk;
pub use heap::{Heap, MemoryStats};
pub use objects::{
    NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative,
    ObjUpvalue, UpvalueLocation,
};
pub use opcode::OpCode;
pub use vm::{InterpretOutcome, Vm, FRAMES_MAX, STACK_MAX};
