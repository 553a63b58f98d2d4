//! The bytecode interpreter loop: call frames, the value stack, and
//! dispatch for every opcode.
//!
//! `Vm` owns the `Heap` as well as its own roots (value stack, frames,
//! globals, open-upvalue list) so that a collection triggered mid-execution
//! can mark everything reachable. `mark_roots` below is the closure handed
//! to `Heap::collect`/`maybe_collect`; it's a free function rather than a
//! method so call sites can destructure `self` field-by-field and avoid
//! borrowing all of `Vm` mutably while `heap` also needs a mutable borrow.

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::objects::{
    NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative,
    ObjUpvalue, UpvalueLocation,
};
use crate::opcode::OpCode;
use lox_core::{ObjKind, ObjString, Table, Value};
use std::fmt;
use std::ptr::NonNull;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: NonNull<ObjClosure>,
    ip: usize,
    slot_base: usize,
}

pub enum InterpretOutcome {
    Ok,
    CompileError,
    RuntimeError,
}

/// Why the interpreter loop stopped a `run`. Distinct from `InterpretOutcome`
/// so the top-level return path can be distinguished from an error path
/// without the caller inspecting the value stack.
enum ExecResult {
    Returned(Value),
    RuntimeError,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Option<NonNull<ObjUpvalue>>,
    pub heap: Heap,
    /// Printed through this so the CLI and tests can both exercise `print`.
    stdout: Box<dyn std::io::Write>,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_stdout(Box::new(std::io::stdout()))
    }

    pub fn with_stdout(stdout: Box<dyn std::io::Write>) -> Vm {
        Vm {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            heap: Heap::new(),
            stdout,
        }
    }

    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name_ptr = self.heap.copy_string(name.as_bytes());
        // Root both the name and the native object across the two
        // allocations below, per the transient-rooting discipline.
        self.push(Value::object(name_ptr.cast()));
        let native_ptr = self.heap.alloc_native(arity, function);
        self.push(Value::object(native_ptr.cast()));
        self.globals.set(name_ptr, Value::object(native_ptr.cast()));
        self.pop();
        self.pop();
    }

    /// Run a freshly compiled top-level function to completion. The second
    /// element of the result is the value the script's implicit top-level
    /// `return` produced — ordinarily `nil`, except for REPL input compiled
    /// with `lox_compiler::compile_repl`, where a trailing bare expression
    /// leaves its own value there instead. `None` on any non-`Ok` outcome.
    pub fn interpret(&mut self, function: NonNull<ObjFunction>) -> (InterpretOutcome, Option<Value>) {
        self.push(Value::object(function.cast()));
        let closure = self.heap.alloc_closure(function, unsafe {
            function.as_ref().upvalue_count
        });
        self.pop();
        self.push(Value::object(closure.cast()));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base: 0,
        });
        let result = match self.run() {
            Ok(ExecResult::Returned(v)) => (InterpretOutcome::Ok, Some(v)),
            Ok(ExecResult::RuntimeError) | Err(_) => (InterpretOutcome::RuntimeError, None),
        };
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        result
    }

    /// Write a value to stdout the same way `print` does. Used by the REPL
    /// to echo a bare expression's result.
    pub fn print_value(&mut self, v: Value) {
        let rendered = self.render(v);
        let _ = writeln!(self.stdout, "{rendered}");
    }

    // == Stack helpers ========================================================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler bug")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // == Execution loop =======================================================

    fn run(&mut self) -> Result<ExecResult, ()> {
        loop {
            #[cfg(feature = "trace-execution")]
            self.trace_step();

            // Checked once per instruction rather than after each
            // individual allocation: the stack/frames/globals are always
            // in a fully-rooted state at this point, so collecting here
            // never needs per-call transient-root bookkeeping.
            self.maybe_collect();

            let op = self.read_op();
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::nil()),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let up = self.current_upvalue(slot);
                    self.push(self.read_upvalue(up));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let up = self.current_upvalue(slot);
                    let v = self.peek(0);
                    self.write_upvalue(up, v);
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let v = self.peek(0);
                    self.globals.set(name, v);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    match self.globals.get(name) {
                        Some(v) => self.push(v),
                        None => {
                            return self.runtime_error(&format!(
                                "Undefined variable '{}'.",
                                unsafe { name.as_ref() }.as_str()
                            ))
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    let v = self.peek(0);
                    // `set` returning true means the key was absent: this
                    // must not create new globals via assignment, so revert.
                    if self.globals.set(name, v) {
                        self.globals.delete(name);
                        return self.runtime_error(&format!(
                            "Undefined variable '{}'.",
                            unsafe { name.as_ref() }.as_str()
                        ));
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    let receiver = self.peek(0);
                    if !receiver.is_object()
                        || unsafe { receiver.as_object().as_ref().kind } != ObjKind::Instance
                    {
                        return self.runtime_error("Only instances have properties.");
                    }
                    let instance = receiver.as_object().cast::<ObjInstance>();
                    let instance_ref = unsafe { instance.as_ref() };
                    if let Some(v) = instance_ref.fields.get(name) {
                        self.pop();
                        self.push(v);
                    } else if !self.bind_method(instance_ref.class, name) {
                        return self.runtime_error(&format!(
                            "Undefined property '{}'.",
                            unsafe { name.as_ref() }.as_str()
                        ));
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    let receiver = self.peek(1);
                    if !receiver.is_object()
                        || unsafe { receiver.as_object().as_ref().kind } != ObjKind::Instance
                    {
                        return self.runtime_error("Only instances have fields.");
                    }
                    let mut instance = receiver.as_object().cast::<ObjInstance>();
                    let v = self.peek(0);
                    unsafe { instance.as_mut() }.fields.set(name, v);
                    let v = self.pop();
                    self.pop();
                    self.push(v);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a == b));
                }
                OpCode::Greater => {
                    if let Err(r) = self.binary_number_cmp(|a, b| a > b) {
                        return Ok(r);
                    }
                }
                OpCode::Less => {
                    if let Err(r) = self.binary_number_cmp(|a, b| a < b) {
                        return Ok(r);
                    }
                }
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if a.is_number() && b.is_number() {
                        self.pop();
                        self.pop();
                        self.push(Value::number(a.as_number() + b.as_number()));
                    } else if self.is_string(a) && self.is_string(b) {
                        self.pop();
                        self.pop();
                        let result = self.concatenate(a, b);
                        self.push(result);
                    } else {
                        return self.runtime_error("Operands must be two numbers or two strings.");
                    }
                }
                OpCode::Subtract => {
                    if let Err(r) = self.binary_number_op(|a, b| a - b) {
                        return Ok(r);
                    }
                }
                OpCode::Multiply => {
                    if let Err(r) = self.binary_number_op(|a, b| a * b) {
                        return Ok(r);
                    }
                }
                OpCode::Divide => {
                    if let Err(r) = self.binary_number_op(|a, b| a / b) {
                        return Ok(r);
                    }
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::bool(!v.is_truthy()));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error("Operand must be a number.");
                    }
                    let v = self.pop();
                    self.push(Value::number(-v.as_number()));
                }
                OpCode::Print => {
                    let v = self.pop();
                    let rendered = self.render(v);
                    let _ = writeln!(self.stdout, "{rendered}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    if let Err(r) = self.call_value(self.peek(argc), argc) {
                        return Ok(r);
                    }
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte() as usize;
                    if let Err(r) = self.invoke(name, argc) {
                        return Ok(r);
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop();
                    let class = superclass.as_object().cast::<ObjClass>();
                    if let Err(r) = self.invoke_from_class(class, name, argc) {
                        return Ok(r);
                    }
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_object().cast::<ObjFunction>();
                    let upvalue_count = unsafe { function.as_ref().upvalue_count };
                    let closure = self.heap.alloc_closure(function, upvalue_count);
                    self.push(Value::object(closure.cast()));
                    for i in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let up = if is_local {
                            let base = self.current_frame().slot_base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.current_upvalue(index)
                        };
                        unsafe {
                            (*closure.as_ptr()).upvalues[i] = Some(up);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.stack.truncate(frame.slot_base);
                        return Ok(ExecResult::Returned(result));
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string_constant();
                    let class = self.heap.alloc_class(name);
                    self.push(Value::object(class.cast()));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !superclass.is_object()
                        || unsafe { superclass.as_object().as_ref().kind } != ObjKind::Class
                    {
                        return self.runtime_error("Superclass must be a class.");
                    }
                    let super_class = superclass.as_object().cast::<ObjClass>();
                    let mut subclass = self.peek(0).as_object().cast::<ObjClass>();
                    let methods = unsafe { &super_class.as_ref().methods };
                    unsafe { subclass.as_mut() }.methods.add_all_from(methods);
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    self.define_method(name);
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = self.pop();
                    let class = superclass.as_object().cast::<ObjClass>();
                    if !self.bind_method(class, name) {
                        return self.runtime_error(&format!(
                            "Undefined property '{}'.",
                            unsafe { name.as_ref() }.as_str()
                        ));
                    }
                }
            }
        }
    }

    // == Decode helpers =======================================================

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    fn current_chunk(&self) -> &Chunk {
        let closure = self.current_frame().closure;
        unsafe { &closure.as_ref().function.as_ref().chunk }
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.current_frame().ip;
        let byte = self.chunk_byte(ip);
        self.current_frame_mut().ip += 1;
        byte
    }

    fn chunk_byte(&self, ip: usize) -> u8 {
        self.current_chunk().code[ip]
    }

    fn read_op(&mut self) -> OpCode {
        let byte = self.read_byte();
        OpCode::from_u8(byte).expect("invalid opcode: compiler bug")
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.current_chunk().constants[idx]
    }

    fn read_string_constant(&mut self) -> NonNull<ObjString> {
        self.read_constant().as_object().cast()
    }

    // == Arithmetic helpers ===================================================

    fn binary_number_op(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), ExecResult> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err(self.make_runtime_error("Operands must be numbers."));
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::number(f(a, b)));
        Ok(())
    }

    fn binary_number_cmp(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), ExecResult> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err(self.make_runtime_error("Operands must be numbers."));
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::bool(f(a, b)));
        Ok(())
    }

    fn is_string(&self, v: Value) -> bool {
        v.is_object() && unsafe { v.as_object().as_ref().kind } == ObjKind::String
    }

    fn concatenate(&mut self, a: Value, b: Value) -> Value {
        let a_str = unsafe { a.as_object().cast::<ObjString>().as_ref() };
        let b_str = unsafe { b.as_object().cast::<ObjString>().as_ref() };
        let mut bytes = Vec::with_capacity(a_str.len() + b_str.len());
        bytes.extend_from_slice(a_str.as_bytes());
        bytes.extend_from_slice(b_str.as_bytes());
        // Root both source strings are still referenced from the stack
        // (caller popped them as Values already consumed, but the objects
        // stay alive via the intern table / other roots during this call);
        // take_string may trigger a collection when the byte-count
        // threshold is crossed, at which point the operand values no
        // longer being on the stack is fine because the concatenation
        // result isn't installed anywhere yet either — it is pushed by
        // the caller immediately after this returns.
        let ptr = self.heap.take_string(bytes.into_boxed_slice());
        Value::object(ptr.cast())
    }

    // == Calls ================================================================

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), ExecResult> {
        if !callee.is_object() {
            return Err(self.make_runtime_error("Can only call functions and classes."));
        }
        let header = callee.as_object();
        match unsafe { header.as_ref().kind } {
            ObjKind::Closure => self.call_closure(header.cast(), argc),
            ObjKind::Native => self.call_native(header.cast(), argc),
            ObjKind::Class => self.call_class(header.cast(), argc),
            ObjKind::BoundMethod => self.call_bound_method(header.cast(), argc),
            _ => Err(self.make_runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: NonNull<ObjClosure>, argc: usize) -> Result<(), ExecResult> {
        let arity = unsafe { closure.as_ref().function.as_ref().arity } as usize;
        if argc != arity {
            return Err(self.make_runtime_error(&format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.make_runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_native(&mut self, native: NonNull<ObjNative>, argc: usize) -> Result<(), ExecResult> {
        let native_ref = unsafe { native.as_ref() };
        if argc != native_ref.arity as usize {
            return Err(self.make_runtime_error(&format!(
                "Expected {} arguments but got {argc}.",
                native_ref.arity
            )));
        }
        let args_start = self.stack.len() - argc;
        let result = (native_ref.function)(&self.stack[args_start..]);
        match result {
            Ok(v) => {
                self.stack.truncate(args_start - 1);
                self.push(v);
                Ok(())
            }
            Err(msg) => Err(self.make_runtime_error(&msg)),
        }
    }

    fn call_class(&mut self, class: NonNull<ObjClass>, argc: usize) -> Result<(), ExecResult> {
        let instance = self.heap.alloc_instance(class);
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::object(instance.cast());
        let init_name = self.init_string();
        if let Some(init) = unsafe { class.as_ref().methods.get(init_name) } {
            let init_closure = init.as_object().cast::<ObjClosure>();
            return self.call_closure(init_closure, argc);
        }
        if argc != 0 {
            return Err(self.make_runtime_error(&format!("Expected 0 arguments but got {argc}.")));
        }
        Ok(())
    }

    fn call_bound_method(
        &mut self,
        bound: NonNull<ObjBoundMethod>,
        argc: usize,
    ) -> Result<(), ExecResult> {
        let bound_ref = unsafe { bound.as_ref() };
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = bound_ref.receiver;
        self.call_closure(bound_ref.method, argc)
    }

    fn invoke(&mut self, name: NonNull<ObjString>, argc: usize) -> Result<(), ExecResult> {
        let receiver = self.peek(argc);
        if !receiver.is_object() || unsafe { receiver.as_object().as_ref().kind } != ObjKind::Instance
        {
            return Err(self.make_runtime_error("Only instances have methods."));
        }
        let instance = receiver.as_object().cast::<ObjInstance>();
        let instance_ref = unsafe { instance.as_ref() };
        if let Some(field) = instance_ref.fields.get(name) {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        self.invoke_from_class(instance_ref.class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: NonNull<ObjClass>,
        name: NonNull<ObjString>,
        argc: usize,
    ) -> Result<(), ExecResult> {
        let method = unsafe { class.as_ref().methods.get(name) };
        match method {
            Some(v) => self.call_closure(v.as_object().cast(), argc),
            None => Err(self.make_runtime_error(&format!(
                "Undefined property '{}'.",
                unsafe { name.as_ref() }.as_str()
            ))),
        }
    }

    /// On success, pops the receiver at the top of the stack and pushes the
    /// bound method in its place (matching `peek(0)` being the receiver at
    /// every call site: property access and `super.name`).
    fn bind_method(&mut self, class: NonNull<ObjClass>, name: NonNull<ObjString>) -> bool {
        let Some(method) = (unsafe { class.as_ref().methods.get(name) }) else {
            return false;
        };
        let receiver = self.peek(0);
        let closure = method.as_object().cast::<ObjClosure>();
        self.push(method);
        let bound = self.heap.alloc_bound_method(receiver, closure);
        self.pop();
        self.pop();
        self.push(Value::object(bound.cast()));
        true
    }

    fn define_method(&mut self, name: NonNull<ObjString>) {
        let method = self.peek(0);
        let mut class = self.peek(1).as_object().cast::<ObjClass>();
        unsafe { class.as_mut() }.methods.set(name, method);
        self.pop();
    }

    fn init_string(&mut self) -> NonNull<ObjString> {
        self.heap.copy_string(b"init")
    }

    // == Upvalues =============================================================

    fn current_upvalue(&self, index: usize) -> NonNull<ObjUpvalue> {
        unsafe { self.current_frame().closure.as_ref().upvalues[index] }
            .expect("upvalue slot populated by closure opcode")
    }

    fn read_upvalue(&self, up: NonNull<ObjUpvalue>) -> Value {
        match unsafe { &*up.as_ref().location.as_ptr() } {
            UpvalueLocation::Open(slot) => self.stack[*slot],
            UpvalueLocation::Closed(v) => *v,
        }
    }

    fn write_upvalue(&mut self, up: NonNull<ObjUpvalue>, value: Value) {
        let slot = match unsafe { &*up.as_ref().location.as_ptr() } {
            UpvalueLocation::Open(slot) => Some(*slot),
            UpvalueLocation::Closed(_) => None,
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => unsafe { up.as_ref() }.location.set(UpvalueLocation::Closed(value)),
        }
    }

    /// Find or create the open upvalue for `stack_slot`, keeping the open
    /// list sorted by descending stack address so `close_upvalues` can stop
    /// at the first entry below the closing address.
    fn capture_upvalue(&mut self, stack_slot: usize) -> NonNull<ObjUpvalue> {
        let mut prev: Option<NonNull<ObjUpvalue>> = None;
        let mut cursor = self.open_upvalues;
        while let Some(up) = cursor {
            let slot = match unsafe { &*up.as_ref().location.as_ptr() } {
                UpvalueLocation::Open(s) => *s,
                UpvalueLocation::Closed(_) => unreachable!("open list holds only open upvalues"),
            };
            if slot == stack_slot {
                return up;
            }
            if slot < stack_slot {
                break;
            }
            prev = Some(up);
            cursor = unsafe { up.as_ref() }.next_open;
        }
        let mut created = self.heap.alloc_upvalue(stack_slot);
        unsafe { created.as_mut() }.next_open = cursor;
        match prev {
            Some(mut p) => unsafe { p.as_mut() }.next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `from_slot`.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(mut up) = self.open_upvalues {
            let slot = match unsafe { &*up.as_ref().location.as_ptr() } {
                UpvalueLocation::Open(s) => *s,
                UpvalueLocation::Closed(_) => break,
            };
            if slot < from_slot {
                break;
            }
            let value = self.stack[slot];
            unsafe { up.as_mut() }
                .location
                .set(UpvalueLocation::Closed(value));
            self.open_upvalues = unsafe { up.as_ref() }.next_open;
        }
    }

    fn maybe_collect(&mut self) {
        let Vm {
            ref stack,
            ref frames,
            ref globals,
            open_upvalues,
            ref mut heap,
            ..
        } = *self;
        heap.maybe_collect(|heap| mark_roots(heap, stack, frames, globals, open_upvalues));
    }

    // == Errors ===============================================================

    fn make_runtime_error(&mut self, message: &str) -> ExecResult {
        self.report_runtime_error(message);
        ExecResult::RuntimeError
    }

    fn runtime_error(&mut self, message: &str) -> Result<ExecResult, ()> {
        self.report_runtime_error(message);
        Ok(ExecResult::RuntimeError)
    }

    fn report_runtime_error(&mut self, message: &str) {
        eprintln!("{message}");
        for frame in self.frames.iter().rev() {
            let func = unsafe { frame.closure.as_ref().function.as_ref() };
            let line = func.chunk.line_for(frame.ip.saturating_sub(1));
            let label = match func.name {
                Some(n) => format!("{}()", unsafe { n.as_ref() }.as_str()),
                None => "script".to_string(),
            };
            eprintln!("[line {line}] in {label}");
        }
        tracing::debug!(message, "runtime error");
    }

    // == Tracing/debug ========================================================

    #[cfg(feature = "trace-execution")]
    fn trace_step(&self) {
        print!("          ");
        for v in &self.stack {
            print!("[ {} ]", self.render(*v));
        }
        println!();
        let ip = self.current_frame().ip;
        crate::disassemble::disassemble_instruction(self.current_chunk(), ip);
    }

    // == Rendering ============================================================

    pub fn render(&self, v: Value) -> String {
        render_value(v)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// Marks every VM-owned root: the value stack, every active frame's
/// closure, the open-upvalue list, and the globals table.
fn mark_roots(
    heap: &mut Heap,
    stack: &[Value],
    frames: &[CallFrame],
    globals: &Table,
    open_upvalues: Option<NonNull<ObjUpvalue>>,
) {
    for &v in stack {
        heap.mark_value(v);
    }
    for frame in frames {
        heap.mark_object(frame.closure.cast());
    }
    let mut cursor = open_upvalues;
    while let Some(up) = cursor {
        heap.mark_object(up.cast());
        cursor = unsafe { up.as_ref() }.next_open;
    }
    heap.mark_table(globals);
}

/// Render a Value the way `print` and the REPL do: numbers via shortest
/// round-trip decimal (forcing a trailing `.0` on whole numbers), and every
/// other kind per its documented surface form.
pub fn render_value(v: Value) -> String {
    if v.is_number() {
        return render_number(v.as_number());
    }
    if v.is_nil() {
        return "nil".to_string();
    }
    if v.is_bool() {
        return v.as_bool().to_string();
    }
    let header = v.as_object();
    match unsafe { header.as_ref().kind } {
        ObjKind::String => unsafe { header.cast::<ObjString>().as_ref() }
            .as_str()
            .to_string(),
        ObjKind::Function => {
            let f = unsafe { header.cast::<ObjFunction>().as_ref() };
            match f.name {
                Some(n) => format!("<fn {}>", unsafe { n.as_ref() }.as_str()),
                None => "<script>".to_string(),
            }
        }
        ObjKind::Native => "<native fn>".to_string(),
        ObjKind::Closure => {
            let c = unsafe { header.cast::<ObjClosure>().as_ref() };
            render_value(Value::object(c.function.cast()))
        }
        ObjKind::Class => {
            let class = unsafe { header.cast::<ObjClass>().as_ref() };
            unsafe { class.name.as_ref() }.as_str().to_string()
        }
        ObjKind::Instance => {
            let instance = unsafe { header.cast::<ObjInstance>().as_ref() };
            let class = unsafe { instance.class.as_ref() };
            format!("{} instance", unsafe { class.name.as_ref() }.as_str())
        }
        ObjKind::BoundMethod => {
            let bound = unsafe { header.cast::<ObjBoundMethod>().as_ref() };
            render_value(Value::object(bound.method.cast()))
        }
        ObjKind::Upvalue => "<upvalue>".to_string(),
    }
}

fn render_number(n: f64) -> String {
    let rendered = format!("{n}");
    if rendered.contains('.')
        || rendered.contains('e')
        || rendered.contains('E')
        || rendered.contains("inf")
        || rendered.contains("NaN")
    {
        rendered
    } else {
        format!("{rendered}.0")
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("stack_depth", &self.stack.len())
            .field("frame_depth", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A `Vec<u8>` behind a `Write` impl, shared so the test can read what
    /// `print` wrote after the VM has moved its boxed stdout away.
    #[derive(Clone, Default)]
    struct SharedBuf(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

    impl std::io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn vm_with_capture() -> (Vm, SharedBuf) {
        let buf = SharedBuf::default();
        let vm = Vm::with_stdout(Box::new(buf.clone()));
        (vm, buf)
    }

    fn script(vm: &mut Vm, build: impl FnOnce(&mut Chunk, &mut Heap)) -> NonNull<ObjFunction> {
        let mut function = vm.heap.alloc_function(None);
        build(unsafe { &mut function.as_mut().chunk }, &mut vm.heap);
        function
    }

    fn emit_constant(chunk: &mut Chunk, v: Value, line: u32) {
        let idx = chunk.add_constant(v) as u8;
        chunk.write_op(OpCode::Constant, line);
        chunk.write(idx, line);
    }

    #[test]
    fn arithmetic_prints_the_expected_number() {
        let (mut vm, out) = vm_with_capture();
        let function = script(&mut vm, |chunk, _heap| {
            emit_constant(chunk, Value::number(1.0), 1);
            emit_constant(chunk, Value::number(2.0), 1);
            chunk.write_op(OpCode::Add, 1);
            emit_constant(chunk, Value::number(3.0), 1);
            chunk.write_op(OpCode::Multiply, 1);
            chunk.write_op(OpCode::Print, 1);
            emit_constant(chunk, Value::nil(), 1);
            chunk.write_op(OpCode::Return, 1);
        });
        let (outcome, _value) = vm.interpret(function);
        assert!(matches!(outcome, InterpretOutcome::Ok));
        assert_eq!(out.0.borrow().as_slice(), b"9.0\n");
    }

    #[test]
    fn string_concatenation_interns_and_prints() {
        let (mut vm, out) = vm_with_capture();
        let function = script(&mut vm, |chunk, heap| {
            let a = heap.copy_string(b"foo");
            let b = heap.copy_string(b"bar");
            emit_constant(chunk, Value::object(a.cast()), 1);
            emit_constant(chunk, Value::object(b.cast()), 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Print, 1);
            emit_constant(chunk, Value::nil(), 1);
            chunk.write_op(OpCode::Return, 1);
        });
        vm.interpret(function);
        assert_eq!(out.0.borrow().as_slice(), b"foobar\n");
    }

    #[test]
    fn globals_round_trip_through_define_get_set() {
        let (mut vm, out) = vm_with_capture();
        let function = script(&mut vm, |chunk, heap| {
            let name = heap.copy_string(b"x");
            let name_idx = chunk.add_constant(Value::object(name.cast())) as u8;
            emit_constant(chunk, Value::number(10.0), 1);
            chunk.write_op(OpCode::DefineGlobal, 1);
            chunk.write(name_idx, 1);
            emit_constant(chunk, Value::number(32.0), 2);
            chunk.write_op(OpCode::SetGlobal, 2);
            chunk.write(name_idx, 2);
            chunk.write_op(OpCode::Pop, 2);
            chunk.write_op(OpCode::GetGlobal, 3);
            chunk.write(name_idx, 3);
            chunk.write_op(OpCode::Print, 3);
            emit_constant(chunk, Value::nil(), 3);
            chunk.write_op(OpCode::Return, 3);
        });
        vm.interpret(function);
        assert_eq!(out.0.borrow().as_slice(), b"32.0\n");
    }

    #[test]
    fn assigning_an_undefined_global_is_a_runtime_error() {
        let (mut vm, _out) = vm_with_capture();
        let function = script(&mut vm, |chunk, heap| {
            let name = heap.copy_string(b"missing");
            let name_idx = chunk.add_constant(Value::object(name.cast())) as u8;
            emit_constant(chunk, Value::number(1.0), 1);
            chunk.write_op(OpCode::SetGlobal, 1);
            chunk.write(name_idx, 1);
            chunk.write_op(OpCode::Pop, 1);
            emit_constant(chunk, Value::nil(), 1);
            chunk.write_op(OpCode::Return, 1);
        });
        let (outcome, value) = vm.interpret(function);
        assert!(matches!(outcome, InterpretOutcome::RuntimeError));
        assert!(value.is_none());
        let name = vm.heap.copy_string(b"missing");
        assert!(vm.globals.get(name).is_none());
    }

    #[test]
    fn calling_a_closure_with_the_wrong_arity_is_a_runtime_error() {
        let (mut vm, _out) = vm_with_capture();
        let mut callee = vm.heap.alloc_function(None);
        unsafe { callee.as_mut() }.arity = 1;
        unsafe {
            callee.as_mut().chunk.write_op(OpCode::Nil, 1);
            callee.as_mut().chunk.write_op(OpCode::Return, 1);
        }
        let function = script(&mut vm, |chunk, heap| {
            let upvalue_count = unsafe { callee.as_ref().upvalue_count };
            let closure = heap.alloc_closure(callee, upvalue_count);
            emit_constant(chunk, Value::object(closure.cast()), 1);
            chunk.write_op(OpCode::Call, 1);
            chunk.write(0, 1);
            chunk.write_op(OpCode::Pop, 1);
            emit_constant(chunk, Value::nil(), 1);
            chunk.write_op(OpCode::Return, 1);
        });
        let (outcome, _value) = vm.interpret(function);
        assert!(matches!(outcome, InterpretOutcome::RuntimeError));
    }

    #[test]
    fn native_functions_are_called_directly_without_a_frame() {
        let (mut vm, out) = vm_with_capture();
        fn double(args: &[Value]) -> Result<Value, String> {
            Ok(Value::number(args[0].as_number() * 2.0))
        }
        vm.define_native("double", 1, double);
        let function = script(&mut vm, |chunk, heap| {
            let name = heap.copy_string(b"double");
            let idx = chunk.add_constant(Value::object(name.cast())) as u8;
            chunk.write_op(OpCode::GetGlobal, 1);
            chunk.write(idx, 1);
            emit_constant(chunk, Value::number(21.0), 1);
            chunk.write_op(OpCode::Call, 1);
            chunk.write(1, 1);
            chunk.write_op(OpCode::Print, 1);
            emit_constant(chunk, Value::nil(), 1);
            chunk.write_op(OpCode::Return, 1);
        });
        vm.interpret(function);
        assert_eq!(out.0.borrow().as_slice(), b"42.0\n");
    }

    #[test]
    fn interpret_surfaces_the_value_an_unpopped_top_level_return_leaves() {
        let (mut vm, _out) = vm_with_capture();
        let function = script(&mut vm, |chunk, _heap| {
            emit_constant(chunk, Value::number(1.0), 1);
            emit_constant(chunk, Value::number(2.0), 1);
            chunk.write_op(OpCode::Add, 1);
            chunk.write_op(OpCode::Return, 1);
        });
        let (outcome, value) = vm.interpret(function);
        assert!(matches!(outcome, InterpretOutcome::Ok));
        assert_eq!(value, Some(Value::number(3.0)));
    }

    #[test]
    fn print_value_writes_the_rendered_form_to_stdout() {
        let (mut vm, out) = vm_with_capture();
        vm.print_value(Value::number(7.0));
        assert_eq!(out.0.borrow().as_slice(), b"7.0\n");
    }

    #[test]
    fn render_value_matches_the_documented_surface_forms() {
        assert_eq!(render_value(Value::nil()), "nil");
        assert_eq!(render_value(Value::bool(true)), "true");
        assert_eq!(render_value(Value::number(1.5)), "1.5");
        assert_eq!(render_value(Value::number(3.0)), "3.0");
    }
}
