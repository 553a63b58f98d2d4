//! The memory manager: allocation, string interning, and the tri-color
//! mark-and-sweep collector.
//!
//! `Heap` does not know about the VM's value stack or the compiler's
//! function-under-construction chain — those are roots owned elsewhere.
//! Collection is driven by whoever holds those roots: `collect` takes a
//! closure that marks them, then the heap traces from there on its own.
//! That keeps this module free of a dependency on `lox-compiler` or on the
//! VM's frame/stack types, at the cost of every call site remembering to
//! pass its roots in. See `vm::mark_roots` for the VM side of that contract.
//!
//! Every object is linked onto a single intrusive list (`objects`, newest
//! first) the moment it's allocated, and `ObjString`s are additionally
//! interned into `strings` so that two equal byte sequences become the same
//! object. Transient rooting — keeping a just-allocated object alive across
//! an allocation that might trigger a collection before it lands in a
//! permanent slot — is the caller's job (the VM's value stack is the usual
//! rooted slot); see the module doc on `crate::vm`.

use crate::objects::{
    NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative,
    ObjUpvalue, UpvalueLocation,
};
use lox_core::{GcHeader, ObjKind, ObjString, Table, Value};
use std::mem::size_of;
use std::ptr::NonNull;

/// Byte-count threshold before the first collection.
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

pub struct Heap {
    objects: Option<NonNull<GcHeader>>,
    pub strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    gray_stack: Vec<NonNull<GcHeader>>,
    /// Forces a collection before every allocation rather than waiting for
    /// the threshold. Wired to the `stress-gc` crate feature.
    pub stress_gc: bool,
    allocation_count: u64,
    collection_count: u64,
}

/// A point-in-time read of the collector's counters, for `tracing` events
/// and embedder diagnostics. A multi-threaded host would aggregate this kind
/// of data across worker threads with a lock-free registry; this interpreter
/// has exactly one thread (§5 rules out concurrency), so a plain struct read
/// straight off the owning `Heap` is the whole story (no concurrency here).
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub live_bytes: usize,
    pub allocation_count: u64,
    pub collection_count: u64,
    pub next_gc_threshold: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            gray_stack: Vec::new(),
            stress_gc: cfg!(feature = "stress-gc"),
            allocation_count: 0,
            collection_count: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            live_bytes: self.bytes_allocated,
            allocation_count: self.allocation_count,
            collection_count: self.collection_count,
            next_gc_threshold: self.next_gc,
        }
    }

    pub fn needs_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Run a collection if the threshold (or `stress_gc`) calls for it.
    /// `mark_roots` is only invoked if a collection actually runs.
    pub fn maybe_collect(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        if self.needs_collect() {
            self.collect(mark_roots);
        }
    }

    pub fn collect(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        let before = self.bytes_allocated;
        mark_roots(self);
        self.trace_references();
        self.sweep_intern_table();
        let freed = self.sweep();
        self.bytes_allocated -= freed;
        self.next_gc = (self.bytes_allocated * 2).max(INITIAL_GC_THRESHOLD);
        self.collection_count += 1;
        tracing::debug!(
            before,
            after = self.bytes_allocated,
            freed,
            next_gc = self.next_gc,
            collection_count = self.collection_count,
            "gc cycle"
        );
    }

    // == Allocation ==========================================================

    fn track<T>(&mut self, boxed: Box<T>) -> NonNull<T> {
        let leaked = NonNull::from(Box::leak(boxed));
        self.bytes_allocated += size_of::<T>();
        self.allocation_count += 1;
        let header: NonNull<GcHeader> = leaked.cast();
        // Safety: T is #[repr(C)] with `header: GcHeader` as its first
        // field, so this cast lands exactly on that field.
        unsafe {
            (*header.as_ptr()).next = self.objects;
        }
        self.objects = Some(header);
        leaked
    }

    pub fn alloc_function(&mut self, name: Option<NonNull<ObjString>>) -> NonNull<ObjFunction> {
        self.track(Box::new(ObjFunction::new(name)))
    }

    pub fn alloc_native(&mut self, arity: u8, function: NativeFn) -> NonNull<ObjNative> {
        self.track(Box::new(ObjNative::new(arity, function)))
    }

    pub fn alloc_closure(
        &mut self,
        function: NonNull<ObjFunction>,
        upvalue_count: usize,
    ) -> NonNull<ObjClosure> {
        self.track(Box::new(ObjClosure::new(function, upvalue_count)))
    }

    pub fn alloc_upvalue(&mut self, stack_slot: usize) -> NonNull<ObjUpvalue> {
        self.track(Box::new(ObjUpvalue::new(stack_slot)))
    }

    pub fn alloc_class(&mut self, name: NonNull<ObjString>) -> NonNull<ObjClass> {
        self.track(Box::new(ObjClass::new(name)))
    }

    pub fn alloc_instance(&mut self, class: NonNull<ObjClass>) -> NonNull<ObjInstance> {
        self.track(Box::new(ObjInstance::new(class)))
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: NonNull<ObjClosure>,
    ) -> NonNull<ObjBoundMethod> {
        self.track(Box::new(ObjBoundMethod::new(receiver, method)))
    }

    /// Adopt an owned byte buffer as a string, interning it. If an equal
    /// string already exists, the incoming buffer is dropped and the
    /// canonical object is returned.
    pub fn take_string(&mut self, bytes: Box<[u8]>) -> NonNull<ObjString> {
        let hash = lox_core::fnv1a_hash(&bytes);
        if let Some(existing) = self.strings.find_string(&bytes, hash) {
            return existing;
        }
        let ptr = self.track(Box::new(ObjString::new(bytes)));
        self.strings.set(ptr, Value::nil());
        ptr
    }

    /// Copy `bytes` into a fresh buffer before interning. Use `take_string`
    /// instead when the caller already owns a buffer nobody else needs.
    pub fn copy_string(&mut self, bytes: &[u8]) -> NonNull<ObjString> {
        self.take_string(Box::from(bytes))
    }

    // == Marking ==============================================================

    pub fn mark_value(&mut self, value: Value) {
        if value.is_object() {
            self.mark_object(value.as_object());
        }
    }

    pub fn mark_object(&mut self, ptr: NonNull<GcHeader>) {
        let already_marked = unsafe { (*ptr.as_ptr()).marked };
        if already_marked {
            return;
        }
        unsafe {
            (*ptr.as_ptr()).marked = true;
        }
        self.gray_stack.push(ptr);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key.cast());
            self.mark_value(value);
        }
    }

    fn trace_references(&mut self) {
        while let Some(ptr) = self.gray_stack.pop() {
            // Safety: every pointer on the gray stack came from
            // `mark_object`, which only pushes pointers obtained from a
            // live `Value` or table entry — both always point at an object
            // still on `self.objects`.
            unsafe { self.blacken(ptr) };
        }
    }

    unsafe fn blacken(&mut self, ptr: NonNull<GcHeader>) {
        match (*ptr.as_ptr()).kind {
            ObjKind::String | ObjKind::Native => {}
            ObjKind::Upvalue => {
                let up = ptr.cast::<ObjUpvalue>();
                let loc = (*up.as_ptr()).location.as_ptr();
                if let UpvalueLocation::Closed(v) = &*loc {
                    self.mark_value(*v);
                }
            }
            ObjKind::Function => {
                let f = &*ptr.cast::<ObjFunction>().as_ptr();
                if let Some(name) = f.name {
                    self.mark_object(name.cast());
                }
                for c in &f.chunk.constants {
                    self.mark_value(*c);
                }
            }
            ObjKind::Closure => {
                let c = &*ptr.cast::<ObjClosure>().as_ptr();
                self.mark_object(c.function.cast());
                for up in c.upvalues.iter().flatten() {
                    self.mark_object(up.cast());
                }
            }
            ObjKind::Class => {
                let class = &*ptr.cast::<ObjClass>().as_ptr();
                self.mark_object(class.name.cast());
                self.mark_table(&class.methods);
            }
            ObjKind::Instance => {
                let instance = &*ptr.cast::<ObjInstance>().as_ptr();
                self.mark_object(instance.class.cast());
                self.mark_table(&instance.fields);
            }
            ObjKind::BoundMethod => {
                let bound = &*ptr.cast::<ObjBoundMethod>().as_ptr();
                self.mark_value(bound.receiver);
                self.mark_object(bound.method.cast());
            }
        }
    }

    // == Sweeping =============================================================

    /// Drop intern-table entries whose key wasn't reached during marking, so
    /// the intern table doesn't keep otherwise-dead strings alive.
    fn sweep_intern_table(&mut self) {
        let dead: Vec<NonNull<ObjString>> = self
            .strings
            .iter()
            .map(|(k, _)| k)
            .filter(|k| unsafe { !k.as_ref().header.marked })
            .collect();
        for key in dead {
            self.strings.delete(key);
        }
    }

    /// Walk the intrusive allocation list, freeing unmarked objects and
    /// clearing the mark bit on survivors. Returns the number of bytes freed.
    fn sweep(&mut self) -> usize {
        let mut previous: Option<NonNull<GcHeader>> = None;
        let mut current = self.objects;
        let mut freed = 0usize;
        while let Some(ptr) = current {
            let (marked, next) = unsafe { ((*ptr.as_ptr()).marked, (*ptr.as_ptr()).next) };
            if marked {
                unsafe {
                    (*ptr.as_ptr()).marked = false;
                }
                previous = Some(ptr);
            } else {
                match previous {
                    Some(prev) => unsafe {
                        (*prev.as_ptr()).next = next;
                    },
                    None => self.objects = next,
                }
                freed += unsafe { self.free_object(ptr) };
            }
            current = next;
        }
        freed
    }

    /// # Safety
    /// `ptr` must not be referenced again after this call; it is unlinked
    /// from the allocation list by the caller before this runs.
    unsafe fn free_object(&mut self, ptr: NonNull<GcHeader>) -> usize {
        macro_rules! drop_as {
            ($t:ty) => {{
                drop(Box::from_raw(ptr.cast::<$t>().as_ptr()));
                size_of::<$t>()
            }};
        }
        match (*ptr.as_ptr()).kind {
            ObjKind::String => drop_as!(ObjString),
            ObjKind::Function => drop_as!(ObjFunction),
            ObjKind::Native => drop_as!(ObjNative),
            ObjKind::Closure => drop_as!(ObjClosure),
            ObjKind::Upvalue => drop_as!(ObjUpvalue),
            ObjKind::Class => drop_as!(ObjClass),
            ObjKind::Instance => drop_as!(ObjInstance),
            ObjKind::BoundMethod => drop_as!(ObjBoundMethod),
        }
    }
}

impl Drop for Heap {
    /// Frees every remaining object when the heap itself goes away (process
    /// exit or REPL teardown), mirroring the explicit `init`/`free` pairing
    /// the design calls for without requiring callers to remember to do it.
    fn drop(&mut self) {
        let mut current = self.objects.take();
        while let Some(ptr) = current {
            let next = unsafe { (*ptr.as_ptr()).next };
            unsafe {
                self.free_object(ptr);
            }
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_the_same_object_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.copy_string(b"hello");
        let b = heap.copy_string(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn take_string_drops_duplicate_buffer() {
        let mut heap = Heap::new();
        let a = heap.take_string(Box::from(&b"dup"[..]));
        let b = heap.take_string(Box::from(&b"dup"[..]));
        assert_eq!(a, b);
    }

    #[test]
    fn unreachable_objects_are_collected() {
        let mut heap = Heap::new();
        let before = {
            heap.copy_string(b"garbage");
            heap.bytes_allocated()
        };
        assert!(before > 0);
        heap.collect(|_heap| {
            // no external roots: everything is garbage
        });
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let mut heap = Heap::new();
        let kept = heap.copy_string(b"kept");
        heap.copy_string(b"garbage");
        heap.collect(|heap| heap.mark_object(kept.cast()));
        assert_eq!(heap.strings.find_string(b"kept", lox_core::fnv1a_hash(b"kept")), Some(kept));
        assert_eq!(heap.strings.find_string(b"garbage", lox_core::fnv1a_hash(b"garbage")), None);
    }
}
