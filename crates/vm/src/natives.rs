//! Native interface concrete instantiation.
//!
//! Every native is a plain `fn(&mut dyn VmContext, argc, argv) -> Value`
//! bound into a table the same way the compiler's `OP_DEFINE_GLOBAL` binds
//! any other global. The non-goal stdlib modules (http, socket, base64,
//! datetime, hashlib, random, path, system) are not implemented; this file
//! carries the registration machinery plus the handful of natives the
//! language's own semantics actually exercise.

use std::time::{SystemTime, UNIX_EPOCH};

use ember_core::handle::Heap;
use ember_core::object::{Object, ObjString, VmContext};
use ember_core::value::Value;

/// Renders `value` the way `print`/string coercion show it: objects print
/// their contents, not a handle.
pub fn display_string(heap: &Heap, value: Value) -> String {
    if value.is_number() {
        let n = value.as_number();
        if n == n.trunc() && n.is_finite() && n.abs() < 1e15 {
            format!("{}", n as i64)
        } else {
            format!("{n}")
        }
    } else if value.is_bool() {
        value.as_bool().to_string()
    } else if value.is_nil() {
        "nil".to_string()
    } else if value.is_obj() {
        let handle = value.as_obj();
        match heap.get(handle) {
            Object::String(s) => s.value.clone(),
            Object::List(l) => {
                let items: Vec<String> = l.items.iter().map(|v| display_repr(heap, *v)).collect();
                format!("[{}]", items.join(", "))
            }
            Object::Dict(d) => {
                let entries: Vec<String> = d
                    .table
                    .iter()
                    .map(|(k, v)| format!("{}: {}", display_repr(heap, *k), display_repr(heap, *v)))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
            Object::Set(s) => {
                let items: Vec<String> = s.table.keys().map(|k| display_repr(heap, *k)).collect();
                format!("{{{}}}", items.join(", "))
            }
            Object::Function(fun) => match fun.name {
                Some(name) => format!("<fn {}>", string_contents(heap, name)),
                None => "<script>".to_string(),
            },
            Object::Closure(c) => {
                let fun = heap.get(c.function);
                match fun {
                    Object::Function(f) => match f.name {
                        Some(name) => format!("<fn {}>", string_contents(heap, name)),
                        None => "<script>".to_string(),
                    },
                    _ => "<closure>".to_string(),
                }
            }
            Object::Class(c) => match c.name {
                Some(name) => string_contents(heap, name),
                None => "<class>".to_string(),
            },
            Object::Instance(i) => match i.class.and_then(|c| match heap.get(c) {
                Object::Class(cls) => cls.name,
                _ => None,
            }) {
                Some(name) => format!("<{} instance>", string_contents(heap, name)),
                None => "<instance>".to_string(),
            },
            Object::Enum(e) => match e.name {
                Some(name) => string_contents(heap, name),
                None => "<enum>".to_string(),
            },
            Object::Module(m) => format!("<module {}>", m.path),
            Object::BoundMethod(_) => "<bound method>".to_string(),
            Object::Result(r) => match r {
                ember_core::object::ObjResult::Success(v) => {
                    format!("Success({})", display_repr(heap, *v))
                }
                ember_core::object::ObjResult::Error(v) => {
                    format!("Error({})", display_repr(heap, *v))
                }
            },
            Object::Native(_) => "<native fn>".to_string(),
            Object::Abstract(a) => format!("<{}>", (a.type_name)(a)),
            Object::Fiber(_) => "<fiber>".to_string(),
            Object::File(f) => format!("<file {}>", f.path),
        }
    } else {
        "empty".to_string()
    }
}

/// Like [`display_string`] but quotes string elements, the way list/dict
/// contents are shown versus a bare top-level string.
fn display_repr(heap: &Heap, value: Value) -> String {
    if value.is_obj() {
        if let Object::String(s) = heap.get(value.as_obj()) {
            return format!("\"{}\"", s.value);
        }
    }
    display_string(heap, value)
}

fn string_contents(heap: &Heap, handle: ember_core::handle::ObjHandle) -> String {
    match heap.get(handle) {
        Object::String(s) => s.value.clone(),
        _ => String::new(),
    }
}

pub fn native_clock(_vm: &mut dyn VmContext, _argc: usize, _argv: &[Value]) -> Value {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Value::number(elapsed.as_secs_f64())
}

pub fn native_type(vm: &mut dyn VmContext, argc: usize, argv: &[Value]) -> Value {
    if argc != 1 {
        vm.raise("type() takes exactly 1 argument.".to_string());
        return Value::empty();
    }
    let v = argv[0];
    let name = if v.is_number() {
        "number"
    } else if v.is_bool() {
        "bool"
    } else if v.is_nil() {
        "nil"
    } else if v.is_obj() {
        vm.heap().get(v.as_obj()).type_name()
    } else {
        "empty"
    };
    let handle = vm.alloc(Object::String(ObjString::new(name.to_string())));
    Value::obj(handle)
}

pub fn native_str(vm: &mut dyn VmContext, argc: usize, argv: &[Value]) -> Value {
    if argc != 1 {
        vm.raise("str() takes exactly 1 argument.".to_string());
        return Value::empty();
    }
    let s = display_string(vm.heap(), argv[0]);
    let handle = vm.alloc(Object::String(ObjString::new(s)));
    Value::obj(handle)
}

pub fn native_num(vm: &mut dyn VmContext, argc: usize, argv: &[Value]) -> Value {
    if argc != 1 {
        vm.raise("num() takes exactly 1 argument.".to_string());
        return Value::empty();
    }
    let v = argv[0];
    if v.is_number() {
        return v;
    }
    if v.is_obj() {
        if let Object::String(s) = vm.heap().get(v.as_obj()) {
            return match s.value.trim().parse::<f64>() {
                Ok(n) => Value::number(n),
                Err(_) => Value::nil(),
            };
        }
    }
    Value::nil()
}

pub fn native_print(vm: &mut dyn VmContext, _argc: usize, argv: &[Value]) -> Value {
    for v in argv {
        print!("{}", display_string(vm.heap(), *v));
    }
    Value::nil()
}

pub fn native_println(vm: &mut dyn VmContext, _argc: usize, argv: &[Value]) -> Value {
    for v in argv {
        println!("{}", display_string(vm.heap(), *v));
    }
    Value::nil()
}

pub fn native_eprint(vm: &mut dyn VmContext, _argc: usize, argv: &[Value]) -> Value {
    for v in argv {
        eprint!("{}", display_string(vm.heap(), *v));
    }
    Value::nil()
}

pub fn native_eprintln(vm: &mut dyn VmContext, _argc: usize, argv: &[Value]) -> Value {
    for v in argv {
        eprintln!("{}", display_string(vm.heap(), *v));
    }
    Value::nil()
}

/// `(name, arity, function)` triples for every global native, the shape
/// `Vm::define_native_globals` walks to populate the globals table at
/// startup.
pub const GLOBAL_NATIVES: &[(&str, Option<u8>, ember_core::object::NativeFn)] = &[
    ("clock", Some(0), native_clock),
    ("type", Some(1), native_type),
    ("str", Some(1), native_str),
    ("num", Some(1), native_num),
    ("print", None, native_print),
    ("println", None, native_println),
    ("eprint", None, native_eprint),
    ("eprintln", None, native_eprintln),
];
