//! The heap object variants that live above `lox-core`: everything with
//! outgoing references the collector has to trace.
//!
//! Each struct follows the same `#[repr(C)]`, `header: GcHeader`-first
//! layout as `ObjString`, so a `*mut GcHeader` obtained by walking the
//! heap's allocation list can be downcast to any of these once `header.kind`
//! says which one it really is. See `gc_header` for why that cast is sound.

use lox_core::{GcHeader, ObjKind, ObjString, Table, Value};
use std::cell::Cell;
use std::ptr::NonNull;

/// A compiled function body: its own `Chunk`, arity, name, and how many
/// upvalues its closures need to capture.
#[repr(C)]
pub struct ObjFunction {
    pub header: GcHeader,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: crate::chunk::Chunk,
    /// `None` for the implicit top-level script function.
    pub name: Option<NonNull<ObjString>>,
}

impl ObjFunction {
    pub fn new(name: Option<NonNull<ObjString>>) -> Self {
        ObjFunction {
            header: GcHeader::new(ObjKind::Function),
            arity: 0,
            upvalue_count: 0,
            chunk: crate::chunk::Chunk::new(),
            name,
        }
    }
}

pub type NativeFn = fn(args: &[Value]) -> Result<Value, String>;

/// A Rust function exposed to Lox code, called directly by the VM's `call`
/// dispatch without pushing a call frame.
#[repr(C)]
pub struct ObjNative {
    pub header: GcHeader,
    pub arity: u8,
    pub function: NativeFn,
}

impl ObjNative {
    pub fn new(arity: u8, function: NativeFn) -> Self {
        ObjNative {
            header: GcHeader::new(ObjKind::Native),
            arity,
            function,
        }
    }
}

/// Either a live reference onto the VM's value stack, or a closed cell that
/// has copied its value out after the enclosing frame popped.
pub enum UpvalueLocation {
    /// Index into the VM's value stack, while the stack slot is still live.
    Open(usize),
    /// The value has been copied out because its stack frame ended.
    Closed(Value),
}

/// A captured variable shared between a closure and its enclosing scope (or
/// between sibling closures capturing the same enclosing local).
#[repr(C)]
pub struct ObjUpvalue {
    pub header: GcHeader,
    pub location: Cell<UpvalueLocation>,
    /// Open upvalues are threaded through this list, sorted by descending
    /// stack slot, so closing every upvalue above a popped frame is a single
    /// walk instead of a full scan.
    pub next_open: Option<NonNull<ObjUpvalue>>,
}

impl ObjUpvalue {
    pub fn new(stack_slot: usize) -> Self {
        ObjUpvalue {
            header: GcHeader::new(ObjKind::Upvalue),
            location: Cell::new(UpvalueLocation::Open(stack_slot)),
            next_open: None,
        }
    }
}

/// A function paired with the upvalues it closed over. What the VM actually
/// calls; `ObjFunction` by itself is only ever wrapped in one of these
/// before use (even the top-level script).
#[repr(C)]
pub struct ObjClosure {
    pub header: GcHeader,
    pub function: NonNull<ObjFunction>,
    pub upvalues: Box<[Option<NonNull<ObjUpvalue>>]>,
}

impl ObjClosure {
    pub fn new(function: NonNull<ObjFunction>, upvalue_count: usize) -> Self {
        ObjClosure {
            header: GcHeader::new(ObjKind::Closure),
            function,
            upvalues: vec![None; upvalue_count].into_boxed_slice(),
        }
    }
}

/// A class. `methods` already contains every inherited method, copied in at
/// `inherit` time — there is no superclass chain to walk at call time.
#[repr(C)]
pub struct ObjClass {
    pub header: GcHeader,
    pub name: NonNull<ObjString>,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: NonNull<ObjString>) -> Self {
        ObjClass {
            header: GcHeader::new(ObjKind::Class),
            name,
            methods: Table::new(),
        }
    }
}

/// An instance of a class: the class it was made from, plus its own field
/// table (fields are per-instance; methods live on the class).
#[repr(C)]
pub struct ObjInstance {
    pub header: GcHeader,
    pub class: NonNull<ObjClass>,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: NonNull<ObjClass>) -> Self {
        ObjInstance {
            header: GcHeader::new(ObjKind::Instance),
            class,
            fields: Table::new(),
        }
    }
}

/// A method looked up off an instance and bound to it, e.g. the value
/// produced by evaluating `instance.method` without calling it. Calling the
/// bound method pushes `receiver` as call-frame slot 0, same as `this` would
/// be for a direct method call.
#[repr(C)]
pub struct ObjBoundMethod {
    pub header: GcHeader,
    pub receiver: Value,
    pub method: NonNull<ObjClosure>,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: NonNull<ObjClosure>) -> Self {
        ObjBoundMethod {
            header: GcHeader::new(ObjKind::BoundMethod),
            receiver,
            method,
        }
    }
}
