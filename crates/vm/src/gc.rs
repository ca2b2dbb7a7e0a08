//! Tracing mark-sweep collector.
//!
//! A straightforward tri-color mark using an explicit gray stack (no
//! recursion, so deep object graphs can't blow the native stack) followed by
//! a sweep over the arena. Collection is triggered by the VM either every
//! allocation (`Config::stress_gc`) or once `bytes_allocated` crosses a
//! doubling threshold.
//!
//! # Roots
//!
//! 1. Every value on every live fiber's value stack.
//! 2. Every call frame's closure handle.
//! 3. Every open upvalue handle.
//! 4. The globals table (keys and values).
//! 5. The modules table (keys and values), transitively pulling in each
//!    module's exported value table.
//! 6. The running fiber handle, whose `caller` chain transitively roots
//!    every suspended fiber up the call chain.
//! 7. Temporary roots: values a native is mid-way through assembling, via
//!    [`crate::vm::Vm::temp_roots`] (covers natives that allocate more than
//!    one object before returning).
//! 8. Every `Abstract` object's attached value table, plus whatever extra
//!    handles its gray callback reports — both handled in [`blacken`], since
//!    an `Abstract` is only ever reached after something else roots it.
//! 9. The intern table is deliberately *not* a root: after marking,
//!    [`Interner::retain_live`] drops any entry whose string didn't survive
//!    via one of the roots above, which is how interning's bookkeeping
//!    stays in sync with real reachability.
//!
//! There is no "compiler chain" root: compilation always finishes (or fails)
//! before the VM resumes running user code, so no collection can observe a
//! partially built `Function` object hanging off of an in-progress
//! `Compiler`. If the REPL grows an incremental compile-while-running mode,
//! that invariant will need revisiting.

use ember_core::handle::{Heap, ObjHandle};
use ember_core::interner::Interner;
use ember_core::object::Object;
use ember_core::table::Table;
use ember_core::value::Value;

pub struct CollectionStats {
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

fn mark_value(heap: &mut Heap, gray: &mut Vec<ObjHandle>, value: Value) {
    if value.is_obj() {
        mark_handle(heap, gray, value.as_obj());
    }
}

fn mark_handle(heap: &mut Heap, gray: &mut Vec<ObjHandle>, handle: ObjHandle) {
    if heap.mark(handle) {
        gray.push(handle);
    }
}

fn mark_value_table(heap: &mut Heap, gray: &mut Vec<ObjHandle>, table: &Table<Value, Value>) {
    let entries: Vec<(Value, Value)> = table.iter().map(|(k, v)| (*k, *v)).collect();
    for (k, v) in entries {
        mark_value(heap, gray, k);
        mark_value(heap, gray, v);
    }
}

fn mark_named_table(heap: &mut Heap, gray: &mut Vec<ObjHandle>, table: &Table<ObjHandle, Value>) {
    let entries: Vec<(ObjHandle, Value)> = table.iter().map(|(k, v)| (*k, *v)).collect();
    for (k, v) in entries {
        mark_handle(heap, gray, k);
        mark_value(heap, gray, v);
    }
}

/// Blacken one gray object: read out every handle/value it references, then
/// mark each (graying anything not already dark). Reads happen through an
/// immutable borrow that ends before any `heap.mark` call, so there's no
/// conflict with the `&mut Heap` marking needs.
fn blacken(heap: &mut Heap, gray: &mut Vec<ObjHandle>, handle: ObjHandle) {
    match heap.get(handle) {
        Object::String(_) | Object::Native(_) | Object::File(_) => {}
        Object::List(l) => {
            let items = l.items.clone();
            for v in items {
                mark_value(heap, gray, v);
            }
        }
        Object::Dict(d) => {
            let table = d.table.clone();
            mark_value_table(heap, gray, &table);
        }
        Object::Set(s) => {
            let table = s.table.clone();
            let keys: Vec<Value> = table.keys().copied().collect();
            for k in keys {
                mark_value(heap, gray, k);
            }
        }
        Object::Function(f) => {
            let name = f.name;
            let module = f.module;
            let constants = f.chunk.constants.clone();
            if let Some(n) = name {
                mark_handle(heap, gray, n);
            }
            if let Some(m) = module {
                mark_handle(heap, gray, m);
            }
            for c in constants {
                mark_value(heap, gray, c);
            }
        }
        Object::Closure(c) => {
            let function = c.function;
            let upvalues = c.upvalues.clone();
            mark_handle(heap, gray, function);
            for uv in upvalues {
                mark_handle(heap, gray, uv);
            }
        }
        Object::Upvalue(u) => {
            let closed = u.closed;
            mark_value(heap, gray, closed);
        }
        Object::Class(c) => {
            let name = c.name;
            let superclass = c.superclass;
            let methods = c.methods.clone();
            let private_methods = c.private_methods.clone();
            let abstract_methods = c.abstract_methods.clone();
            let class_variables = c.class_variables.clone();
            if let Some(n) = name {
                mark_handle(heap, gray, n);
            }
            if let Some(s) = superclass {
                mark_handle(heap, gray, s);
            }
            mark_named_table(heap, gray, &methods);
            mark_named_table(heap, gray, &private_methods);
            mark_named_table(heap, gray, &abstract_methods);
            mark_named_table(heap, gray, &class_variables);
        }
        Object::Instance(i) => {
            let class = i.class;
            let public_fields = i.public_fields.clone();
            let private_fields = i.private_fields.clone();
            if let Some(c) = class {
                mark_handle(heap, gray, c);
            }
            mark_named_table(heap, gray, &public_fields);
            mark_named_table(heap, gray, &private_fields);
        }
        Object::Enum(e) => {
            let name = e.name;
            let values = e.values.clone();
            if let Some(n) = name {
                mark_handle(heap, gray, n);
            }
            mark_named_table(heap, gray, &values);
        }
        Object::Module(m) => {
            let name = m.name;
            let values = m.values.clone();
            if let Some(n) = name {
                mark_handle(heap, gray, n);
            }
            mark_named_table(heap, gray, &values);
        }
        Object::BoundMethod(b) => {
            let receiver = b.receiver;
            let method = b.method;
            mark_value(heap, gray, receiver);
            mark_handle(heap, gray, method);
        }
        Object::Result(r) => {
            let v = match r {
                ember_core::object::ObjResult::Success(v) => *v,
                ember_core::object::ObjResult::Error(v) => *v,
            };
            mark_value(heap, gray, v);
        }
        Object::Abstract(a) => {
            let values = a.values.clone();
            let mut extra = Vec::new();
            if let Some(gray_fn) = a.gray {
                gray_fn(a, &mut |h| extra.push(h));
            }
            mark_named_table(heap, gray, &values);
            for h in extra {
                mark_handle(heap, gray, h);
            }
        }
        Object::Fiber(f) => {
            let stack = f.stack.clone();
            let frame_closures: Vec<ObjHandle> = f.frames.iter().map(|fr| fr.closure).collect();
            let open_upvalues = f.open_upvalues.clone();
            let caller = f.caller;
            for v in stack {
                mark_value(heap, gray, v);
            }
            for c in frame_closures {
                mark_handle(heap, gray, c);
            }
            for uv in open_upvalues {
                mark_handle(heap, gray, uv);
            }
            if let Some(caller) = caller {
                mark_handle(heap, gray, caller);
            }
        }
    }
}

/// Runs one full mark-sweep cycle. `roots` is every handle/value the caller
/// considers directly reachable (globals, modules, the running fiber,
/// temporary roots); the fiber's own stack/frames/upvalues are then pulled
/// in transitively by [`blacken`].
pub fn collect(
    heap: &mut Heap,
    interner: &mut Interner,
    root_values: &[Value],
    root_handles: &[ObjHandle],
) -> CollectionStats {
    let mut gray: Vec<ObjHandle> = Vec::new();
    for v in root_values {
        mark_value(heap, &mut gray, *v);
    }
    for h in root_handles {
        mark_handle(heap, &mut gray, *h);
    }
    while let Some(handle) = gray.pop() {
        blacken(heap, &mut gray, handle);
    }

    interner.retain_live(|h| heap.is_marked(h));

    let bytes_before = heap.bytes_allocated;
    let freed = heap.sweep();
    CollectionStats {
        objects_freed: freed.len(),
        bytes_freed: bytes_before.saturating_sub(heap.bytes_allocated),
    }
}
