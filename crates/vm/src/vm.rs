//! Stack-based bytecode interpreter.
//!
//! One dispatch loop walks a chunk's bytes, each opcode handler pushing and
//! popping the active fiber's value stack directly. There is no recursive
//! `run()` reentry except for module loading, which is
//! a VM-internal concern, not a native calling back in — natives only ever
//! see the narrow [`VmContext`] surface and can't reach the frame stack.

use std::collections::VecDeque;

use ember_compiler::{CompileError, OpCode};
use ember_core::handle::{Heap, ObjHandle};
use ember_core::interner::Interner;
use ember_core::object::{
    CallFrame, ClassType, FiberState, Object, ObjBoundMethod, ObjClass, ObjClosure, ObjDict,
    ObjEnum, ObjFiber, ObjInstance, ObjList, ObjModule, ObjNative, ObjSet, ObjUpvalue,
    UpvalueLocation, VmContext,
};
use ember_core::table::Table;
use ember_core::value::Value;

use crate::config::Config;
use crate::error::{RuntimeError, StackFrame};
use crate::gc;
use crate::natives::GLOBAL_NATIVES;

const STACK_MAX: usize = 16_384;

#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl From<RuntimeError> for InterpretError {
    fn from(e: RuntimeError) -> Self {
        InterpretError::Runtime(e)
    }
}

/// A fiber's state as it's checked out of the heap and actively running.
/// Other, suspended fibers keep their stack/frames/upvalues in their own
/// [`ObjFiber`] heap object; the running one's live copy is here instead,
/// which is why GC roots (gc.rs) mark these fields directly rather than
/// reading them back out through `current_fiber`.
pub struct Vm {
    heap: Heap,
    interner: Interner,
    /// One globals table per nested module compile/run (import opcodes push
    /// a fresh table for the module being loaded); `globals_stack.last()` is
    /// always the table in scope for `OP_GET_GLOBAL`/`OP_DEFINE_GLOBAL`.
    globals_stack: Vec<Table<ObjHandle, Value>>,
    modules: Table<ObjHandle, ObjHandle>,
    config: Config,
    gc_threshold: usize,

    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: VecDeque<ObjHandle>,
    current_fiber: Option<ObjHandle>,
    fiber_stack: Vec<ObjHandle>,
    last_imported_module: Option<ObjHandle>,
    temp_roots: Vec<Value>,
    pending_error: Option<String>,
}

enum CallOutcome {
    Continue,
    /// Returned from the outermost frame of the whole program (not a nested
    /// call): execution is over, with this value.
    Done(Value),
}

impl Vm {
    pub fn new(config: Config) -> Self {
        let gc_threshold = config.gc_initial_threshold;
        let mut vm = Vm {
            heap: Heap::new(),
            interner: Interner::new(),
            globals_stack: vec![Table::new()],
            modules: Table::new(),
            config,
            gc_threshold,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            open_upvalues: VecDeque::new(),
            current_fiber: None,
            fiber_stack: Vec::new(),
            last_imported_module: None,
            temp_roots: Vec::new(),
            pending_error: None,
        };
        vm.define_native_globals();
        vm.define_fiber_global();
        vm
    }

    fn define_native_globals(&mut self) {
        for (name, arity, function) in GLOBAL_NATIVES {
            let name_handle = self.interner.intern(&mut self.heap, name);
            let native = ObjNative {
                name: name_handle,
                arity: *arity,
                function: *function,
            };
            let handle = self.heap.alloc(Object::Native(native), 16);
            self.globals_stack
                .last_mut()
                .unwrap()
                .insert(name_handle, Value::obj(handle));
        }
    }

    /// `Fiber` isn't a user-definable class; it's a builtin namespace
    /// carrying the `new`/`yield` static entry points that `invoke()`
    /// special-cases by name. Registering it as a plain `Object::Class`
    /// lets ordinary `Fiber.new(...)`/`Fiber.yield(...)` call syntax resolve
    /// through the same `OP_INVOKE` path every other method call uses.
    fn define_fiber_global(&mut self) {
        let name_handle = self.interner.intern(&mut self.heap, "Fiber");
        let class = ObjClass::new(Some(name_handle), None, ClassType::Default);
        let handle = self.heap.alloc(Object::Class(class), 64);
        self.globals_stack
            .last_mut()
            .unwrap()
            .insert(name_handle, Value::obj(handle));
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Compiles and runs `source` as the top-level program, returning the
    /// value of its last bare expression statement (`nil` if none) or the
    /// first error encountered.
    pub fn interpret(&mut self, source: &str, module_name: &str) -> Result<Value, InterpretError> {
        let function =
            ember_compiler::compile(source, module_name, &mut self.heap, &mut self.interner)
                .map_err(InterpretError::Compile)?;
        let closure = self
            .heap
            .alloc(Object::Closure(ObjClosure { function, upvalues: Vec::new() }), 32);
        let fiber = self.heap.alloc(Object::Fiber(ObjFiber::new(closure)), 64);
        self.current_fiber = Some(fiber);
        self.stack.clear();
        self.stack.push(Value::obj(closure));
        self.frames = vec![CallFrame { closure, ip: 0, slots_base: 0 }];
        self.open_upvalues.clear();

        let result = self.run();
        result.map_err(InterpretError::Runtime)
    }

    // ---- bytecode access -------------------------------------------------

    fn function_handle(&self, closure: ObjHandle) -> ObjHandle {
        match self.heap.get(closure) {
            Object::Closure(c) => c.function,
            _ => panic!("call frame closure is not a Closure object"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("active frame");
        let closure = frame.closure;
        let ip = frame.ip;
        frame.ip += 1;
        let function = self.function_handle(closure);
        match self.heap.get(function) {
            Object::Function(f) => f.chunk.code[ip],
            _ => unreachable!(),
        }
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self, index: u8) -> Value {
        let closure = self.frames.last().unwrap().closure;
        let function = self.function_handle(closure);
        match self.heap.get(function) {
            Object::Function(f) => f.chunk.constants[index as usize],
            _ => unreachable!(),
        }
    }

    fn globals(&mut self) -> &mut Table<ObjHandle, Value> {
        self.globals_stack.last_mut().unwrap()
    }

    // ---- stack helpers -------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: compiler emitted unbalanced pops")
    }

    fn peek(&self, distance_from_top: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance_from_top]
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut frames = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.function_handle(frame.closure);
            let (line, name) = match self.heap.get(function) {
                Object::Function(f) => {
                    let line = f.chunk.lines.line_for_offset(frame.ip.saturating_sub(1));
                    let name = f
                        .name
                        .map(|h| match self.heap.get(h) {
                            Object::String(s) => s.value.clone(),
                            _ => String::new(),
                        })
                        .unwrap_or_default();
                    (line, name)
                }
                _ => (0, String::new()),
            };
            frames.push(StackFrame { line, function_name: name });
        }
        RuntimeError::new(message, frames)
    }

    // ---- the dispatch loop -------------------------------------------------

    fn run(&mut self) -> Result<Value, RuntimeError> {
        let base_frame_depth = self.frames.len() - 1;
        loop {
            self.maybe_collect();

            let byte = self.read_byte();
            let op = match OpCode::from_u8(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(format!("corrupt bytecode: opcode {byte}"))),
            };

            match self.execute(op, base_frame_depth)? {
                CallOutcome::Continue => {}
                CallOutcome::Done(value) => return Ok(value),
            }

            if let Some(message) = self.pending_error.take() {
                return Err(self.runtime_error(message));
            }
        }
    }

    fn execute(&mut self, op: OpCode, base_frame_depth: usize) -> Result<CallOutcome, RuntimeError> {
        use OpCode::*;
        match op {
            Constant => {
                let idx = self.read_byte();
                let v = self.read_constant(idx);
                self.push(v)?;
            }
            Nil => self.push(Value::nil())?,
            True => self.push(Value::bool(true))?,
            False => self.push(Value::bool(false))?,
            Pop => {
                self.pop();
            }

            GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().slots_base;
                self.push(self.stack[base + slot])?;
            }
            SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().slots_base;
                self.stack[base + slot] = self.peek(0);
            }
            GetUpvalue => {
                let slot = self.read_byte() as usize;
                let closure = self.frames.last().unwrap().closure;
                let upvalue_handle = match self.heap.get(closure) {
                    Object::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let value = self.read_upvalue(upvalue_handle);
                self.push(value)?;
            }
            SetUpvalue => {
                let slot = self.read_byte() as usize;
                let closure = self.frames.last().unwrap().closure;
                let upvalue_handle = match self.heap.get(closure) {
                    Object::Closure(c) => c.upvalues[slot],
                    _ => unreachable!(),
                };
                let value = self.peek(0);
                self.write_upvalue(upvalue_handle, value);
            }
            GetGlobal => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                match self.globals().get(&name).copied() {
                    Some(v) => self.push(v)?,
                    None => {
                        let msg = format!("Undefined variable '{}'.", self.string_at(name));
                        return Err(self.runtime_error(msg));
                    }
                }
            }
            DefineGlobal => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let value = self.pop();
                self.globals().insert(name, value);
            }
            SetGlobal => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let value = self.peek(0);
                if self.globals().get(&name).is_none() {
                    let msg = format!("Undefined variable '{}'.", self.string_at(name));
                    return Err(self.runtime_error(msg));
                }
                self.globals().insert(name, value);
            }

            GetProperty => self.get_property(false)?,
            GetPropertyNoPop => self.get_property(true)?,
            SetProperty => self.set_property(false)?,
            GetPrivateProperty => self.get_private_property()?,
            SetPrivateProperty => self.set_private_property()?,
            GetSuper => self.get_super()?,

            Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::bool(values_equal(a, b)))?;
            }
            NotEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::bool(!values_equal(a, b)))?;
            }
            Greater => self.compare(|a, b| a > b)?,
            GreaterEqual => self.compare(|a, b| a >= b)?,
            Less => self.compare(|a, b| a < b)?,
            LessEqual => self.compare(|a, b| a <= b)?,

            Add => self.add()?,
            Subtract => self.arithmetic("-", |a, b| a - b)?,
            Multiply => self.arithmetic("*", |a, b| a * b)?,
            Divide => self.arithmetic("/", |a, b| a / b)?,
            Modulo => self.arithmetic("%", |a, b| a.rem_euclid(b))?,
            Power => self.arithmetic("**", f64::powf)?,

            BitAnd => self.bitwise(|a, b| a & b)?,
            BitOr => self.bitwise(|a, b| a | b)?,
            BitXor => self.bitwise(|a, b| a ^ b)?,
            ShiftLeft => self.bitwise(|a, b| a << (b & 63))?,
            ShiftRight => self.bitwise(|a, b| a >> (b & 63))?,

            Not => {
                let v = self.pop();
                self.push(Value::bool(v.is_falsey()))?;
            }
            Negate => {
                let v = self.pop();
                if !v.is_number() {
                    return Err(self.runtime_error("Operand must be a number."));
                }
                self.push(Value::number(-v.as_number()))?;
            }
            BitNot => {
                let v = self.pop();
                if !v.is_number() {
                    return Err(self.runtime_error("Operand must be a number."));
                }
                self.push(Value::number(!(v.as_number() as i64) as f64))?;
            }

            Jump => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            JumpIfFalse => {
                let offset = self.read_u16();
                if self.peek(0).is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            Loop => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }

            Call => {
                let argc = self.read_byte() as usize;
                let callee = self.peek(argc);
                return self.call_value(callee, argc);
            }
            Invoke => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let argc = self.read_byte() as usize;
                return self.invoke(name, argc);
            }
            SuperInvoke => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let argc = self.read_byte() as usize;
                let superclass = self.pop();
                return self.invoke_from_class(superclass.as_obj(), name, argc);
            }

            Closure => {
                let idx = self.read_byte();
                let function_value = self.read_constant(idx);
                let function_handle = function_value.as_obj();
                let upvalue_count = match self.heap.get(function_handle) {
                    Object::Function(f) => f.upvalue_count as usize,
                    _ => unreachable!(),
                };
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_byte();
                    if is_local {
                        let base = self.frames.last().unwrap().slots_base;
                        upvalues.push(self.capture_upvalue(base + index as usize));
                    } else {
                        let enclosing = self.frames.last().unwrap().closure;
                        let handle = match self.heap.get(enclosing) {
                            Object::Closure(c) => c.upvalues[index as usize],
                            _ => unreachable!(),
                        };
                        upvalues.push(handle);
                    }
                }
                let handle = self
                    .heap
                    .alloc(Object::Closure(ObjClosure { function: function_handle, upvalues }), 32);
                self.push(Value::obj(handle))?;
            }
            CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues_from(top);
                self.pop();
            }
            Return => {
                let result = self.pop();
                let frame = self.frames.pop().unwrap();
                self.close_upvalues_from(frame.slots_base);
                self.stack.truncate(frame.slots_base);
                if self.frames.len() <= base_frame_depth {
                    return self.finish_current_fiber(result);
                }
                self.push(result)?;
            }

            BuildList => {
                let count = self.read_byte() as usize;
                let items = self.stack.split_off(self.stack.len() - count);
                let handle = self.heap.alloc(Object::List(ObjList { items }), 24 + count * 8);
                self.push(Value::obj(handle))?;
            }
            BuildDict => {
                let count = self.read_byte() as usize * 2;
                let entries = self.stack.split_off(self.stack.len() - count);
                let mut table: Table<Value, Value> = Table::new();
                for pair in entries.chunks(2) {
                    table.insert(pair[0], pair[1]);
                }
                let handle = self.heap.alloc(Object::Dict(ObjDict { table }), 24 + count * 24);
                self.push(Value::obj(handle))?;
            }
            BuildSet => {
                let count = self.read_byte() as usize;
                let entries = self.stack.split_off(self.stack.len() - count);
                let mut table: Table<Value, ()> = Table::new();
                for v in entries {
                    table.insert(v, ());
                }
                let handle = self.heap.alloc(Object::Set(ObjSet { table }), 24 + count * 16);
                self.push(Value::obj(handle))?;
            }
            SubscriptGet => self.subscript_get()?,
            SubscriptGetNoPop => self.subscript_get_no_pop()?,
            SubscriptSet => self.subscript_set()?,
            SubscriptSlice => self.subscript_slice()?,

            Class => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let class_type = class_type_from_byte(self.read_byte());
                let class = ObjClass::new(name, None, class_type);
                let handle = self.heap.alloc(Object::Class(class), 64);
                self.push(Value::obj(handle))?;
            }
            Subclass => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let class_type = class_type_from_byte(self.read_byte());
                let superclass_value = self.pop();
                if !superclass_value.is_obj()
                    || !matches!(self.heap.get(superclass_value.as_obj()), Object::Class(_))
                {
                    return Err(self.runtime_error("Superclass must be a class."));
                }
                let superclass_handle = superclass_value.as_obj();
                let mut class = ObjClass::new(name, Some(superclass_handle), class_type);
                if let Object::Class(sc) = self.heap.get(superclass_handle) {
                    class.methods = sc.methods.clone();
                    class.private_methods = sc.private_methods.clone();
                    class.class_variables = sc.class_variables.clone();
                }
                let handle = self.heap.alloc(Object::Class(class), 64);
                self.push(Value::obj(handle))?;
            }
            // Pure bookkeeping boundary; every effect of compiling a class body
            // (method/use insertions) has already landed on the class object.
            EndClass => {}
            Method => self.method()?,
            Enum => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let handle = self
                    .heap
                    .alloc(Object::Enum(ObjEnum { name: Some(name), values: Table::new() }), 32);
                self.push(Value::obj(handle))?;
            }
            SetEnumValue => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let enum_value = self.peek(0);
                let ordinal = match self.heap.get(enum_value.as_obj()) {
                    Object::Enum(e) => e.values.len() as f64,
                    _ => return Err(self.runtime_error("Expected enum.")),
                };
                if let Object::Enum(e) = self.heap.get_mut(enum_value.as_obj()) {
                    e.values.insert(name, Value::number(ordinal));
                }
            }
            Use => self.use_trait()?,

            Import => {
                let idx = self.read_byte();
                let path = self.string_at(self.read_constant(idx).as_obj());
                let handle = self
                    .load_module(&path)
                    .map_err(|e| self.runtime_error(e))?;
                self.last_imported_module = Some(handle);
                self.push(Value::obj(handle))?;
            }
            ImportBuiltin => {
                let idx = self.read_byte();
                let name = self.string_at(self.read_constant(idx).as_obj());
                let handle = self
                    .load_module(&name)
                    .map_err(|e| self.runtime_error(e))?;
                self.last_imported_module = Some(handle);
                self.push(Value::obj(handle))?;
            }
            ImportVariable => {
                let idx = self.read_byte();
                let name = self.read_constant(idx).as_obj();
                let module = self
                    .last_imported_module
                    .ok_or_else(|| self.runtime_error("Internal error: no active import."))?;
                let value = match self.heap.get(module) {
                    Object::Module(m) => m.values.get(&name).copied(),
                    _ => None,
                };
                match value {
                    Some(v) => self.push(v)?,
                    None => {
                        let msg = format!(
                            "Undefined name '{}' in imported module.",
                            self.string_at(name)
                        );
                        return Err(self.runtime_error(msg));
                    }
                }
            }
            ImportEnd => {
                self.last_imported_module = None;
            }
        }
        Ok(CallOutcome::Continue)
    }

    // ---- arithmetic/comparison -------------------------------------------------

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        if a.is_number() && b.is_number() {
            self.push(Value::number(a.as_number() + b.as_number()))?;
            return Ok(());
        }
        if a.is_obj() && b.is_obj() {
            if let (Object::String(sa), Object::String(sb)) =
                (self.heap.get(a.as_obj()), self.heap.get(b.as_obj()))
            {
                let mut joined = sa.value.clone();
                joined.push_str(&sb.value);
                let handle = self.interner.intern(&mut self.heap, &joined);
                self.push(Value::obj(handle))?;
                return Ok(());
            }
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    fn arithmetic(&mut self, op_name: &str, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        if !a.is_number() || !b.is_number() {
            if op_name == "-" && a.is_obj() && matches!(self.heap.get(a.as_obj()), Object::String(_)) {
                return Err(self.runtime_error("Subtraction not defined on strings."));
            }
            return Err(self.runtime_error("Operands must be numbers."));
        }
        self.push(Value::number(f(a.as_number(), b.as_number())))?;
        Ok(())
    }

    fn bitwise(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        if !a.is_number() || !b.is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        let result = f(a.as_number() as i64, b.as_number() as i64);
        self.push(Value::number(result as f64))?;
        Ok(())
    }

    fn compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        if !a.is_number() || !b.is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        self.push(Value::bool(f(a.as_number(), b.as_number())))?;
        Ok(())
    }

    // ---- upvalues -------------------------------------------------

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjHandle {
        for &handle in &self.open_upvalues {
            if let Object::Upvalue(u) = self.heap.get(handle) {
                if let UpvalueLocation::Open { stack_index: existing, .. } = u.location {
                    if existing == stack_index {
                        return handle;
                    }
                }
            }
        }
        let fiber = self.current_fiber.expect("fiber active while capturing upvalue");
        let upvalue = ObjUpvalue {
            location: UpvalueLocation::Open { fiber, stack_index },
            closed: Value::nil(),
        };
        let handle = self.heap.alloc(Object::Upvalue(upvalue), 24);
        // Kept sorted by stack depth, deepest first, so closing a range of
        // locals on scope exit is a simple prefix scan.
        let pos = self
            .open_upvalues
            .iter()
            .position(|h| {
                matches!(self.heap.get(*h), Object::Upvalue(u) if matches!(u.location, UpvalueLocation::Open { stack_index: s, .. } if s < stack_index))
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, handle);
        handle
    }

    fn read_upvalue(&self, handle: ObjHandle) -> Value {
        match self.heap.get(handle) {
            Object::Upvalue(u) => match u.location {
                UpvalueLocation::Open { stack_index, .. } => self.stack[stack_index],
                UpvalueLocation::Closed => u.closed,
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, handle: ObjHandle, value: Value) {
        let stack_index = match self.heap.get(handle) {
            Object::Upvalue(u) => match u.location {
                UpvalueLocation::Open { stack_index, .. } => Some(stack_index),
                UpvalueLocation::Closed => None,
            },
            _ => unreachable!(),
        };
        match stack_index {
            Some(idx) => self.stack[idx] = value,
            None => {
                if let Object::Upvalue(u) = self.heap.get_mut(handle) {
                    u.closed = value;
                }
            }
        }
    }

    fn close_upvalues_from(&mut self, from_stack_index: usize) {
        while let Some(&handle) = self.open_upvalues.front() {
            let stack_index = match self.heap.get(handle) {
                Object::Upvalue(u) => match u.location {
                    UpvalueLocation::Open { stack_index, .. } => stack_index,
                    UpvalueLocation::Closed => break,
                },
                _ => unreachable!(),
            };
            if stack_index < from_stack_index {
                break;
            }
            let value = self.stack[stack_index];
            if let Object::Upvalue(u) = self.heap.get_mut(handle) {
                u.location = UpvalueLocation::Closed;
                u.closed = value;
            }
            self.open_upvalues.pop_front();
        }
    }

    // ---- calls -------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<CallOutcome, RuntimeError> {
        if !callee.is_obj() {
            return Err(self.runtime_error("Can only call functions and classes."));
        }
        let handle = callee.as_obj();
        match self.heap.get(handle) {
            Object::Closure(_) => self.call_closure(handle, argc),
            Object::Native(native) => {
                let native = *native;
                self.call_native(native, argc)
            }
            Object::Class(_) => self.call_class(handle, argc),
            Object::BoundMethod(bm) => {
                let bm = *bm;
                self.stack[self.stack.len() - 1 - argc] = bm.receiver;
                self.call_closure(bm.method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjHandle, argc: usize) -> Result<CallOutcome, RuntimeError> {
        let function = self.function_handle(closure);
        let (arity, arity_optional) = match self.heap.get(function) {
            Object::Function(f) => (f.arity, f.arity_optional),
            _ => unreachable!(),
        };
        let max_arity = arity as usize + arity_optional as usize;
        if argc < arity as usize || argc > max_arity {
            let msg = format!("Expected {} arguments but got {}.", arity, argc);
            return Err(self.runtime_error(msg));
        }
        for _ in argc..max_arity {
            self.push(Value::nil())?;
        }
        let slots_base = self.stack.len() - max_arity - 1;
        if self.frames.len() >= 1024 {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame { closure, ip: 0, slots_base });
        Ok(CallOutcome::Continue)
    }

    fn call_native(&mut self, native: ObjNative, argc: usize) -> Result<CallOutcome, RuntimeError> {
        if let Some(arity) = native.arity {
            if argc != arity as usize {
                let msg = format!("Expected {} arguments but got {}.", arity, argc);
                return Err(self.runtime_error(msg));
            }
        }
        let args: Vec<Value> = self.stack[self.stack.len() - argc..].to_vec();
        let result = (native.function)(self, argc, &args);
        self.stack.truncate(self.stack.len() - argc - 1);
        if let Some(message) = self.pending_error.take() {
            return Err(self.runtime_error(message));
        }
        self.push(result)?;
        Ok(CallOutcome::Continue)
    }

    fn call_class(&mut self, class_handle: ObjHandle, argc: usize) -> Result<CallOutcome, RuntimeError> {
        let class_type = match self.heap.get(class_handle) {
            Object::Class(c) => c.class_type,
            _ => unreachable!(),
        };
        if class_type == ClassType::Abstract {
            return Err(self.runtime_error("Cannot instantiate an abstract class."));
        }
        let instance = ObjInstance {
            class: Some(class_handle),
            public_fields: Table::new(),
            private_fields: Table::new(),
        };
        let instance_handle = self.heap.alloc(Object::Instance(instance), 48);
        let receiver_slot = self.stack.len() - 1 - argc;
        self.stack[receiver_slot] = Value::obj(instance_handle);

        let init_name = self.interner.intern(&mut self.heap, "init");
        let init_closure = match self.heap.get(class_handle) {
            Object::Class(c) => c.methods.get(&init_name).copied(),
            _ => unreachable!(),
        };
        match init_closure {
            Some(v) if v.is_obj() => self.call_closure(v.as_obj(), argc),
            _ => {
                if argc != 0 {
                    let msg = format!("Expected 0 arguments but got {argc}.");
                    return Err(self.runtime_error(msg));
                }
                self.stack.truncate(self.stack.len() - argc);
                Ok(CallOutcome::Continue)
            }
        }
    }

    fn invoke(&mut self, name: ObjHandle, argc: usize) -> Result<CallOutcome, RuntimeError> {
        let receiver = self.peek(argc);
        if !receiver.is_obj() {
            return Err(self.runtime_error("Only instances have methods."));
        }
        let receiver_handle = receiver.as_obj();
        match self.heap.get(receiver_handle) {
            Object::Instance(inst) => {
                if let Some(field) = inst.public_fields.get(&name).copied() {
                    let slot = self.stack.len() - 1 - argc;
                    self.stack[slot] = field;
                    return self.call_value(field, argc);
                }
                let class = inst.class.expect("instance always has a class");
                self.invoke_from_class(class, name, argc)
            }
            Object::Fiber(_) => self.invoke_fiber_method(receiver_handle, name, argc),
            Object::Class(c) => {
                let class_name = c.name;
                match class_name {
                    Some(n) if self.string_at(n) == "Fiber" => self.invoke_fiber_static(name, argc),
                    _ => Err(self.runtime_error("Only instances have methods.")),
                }
            }
            Object::Module(m) => match m.values.get(&name).copied() {
                Some(v) => {
                    let slot = self.stack.len() - 1 - argc;
                    self.stack[slot] = v;
                    self.call_value(v, argc)
                }
                None => Err(self.runtime_error(format!("Undefined property '{}'.", self.string_at(name)))),
            },
            _ => Err(self.runtime_error("Only instances have methods.")),
        }
    }

    fn invoke_from_class(&mut self, class: ObjHandle, name: ObjHandle, argc: usize) -> Result<CallOutcome, RuntimeError> {
        let method = match self.heap.get(class) {
            Object::Class(c) => c.methods.get(&name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(v) if v.is_obj() => self.call_closure(v.as_obj(), argc),
            _ => Err(self.runtime_error(format!("Undefined property '{}'.", self.string_at(name)))),
        }

    }

    fn method(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_byte();
        let name = self.read_constant(idx).as_obj();
        let visibility = self.read_byte();
        if visibility == 2 {
            let class_value = self.peek(0);
            if let Object::Class(c) = self.heap.get_mut(class_value.as_obj()) {
                c.abstract_methods.insert(name, Value::nil());
            }
            return Ok(());
        }
        let closure = self.pop();
        let class_value = self.peek(0);
        if let Object::Class(c) = self.heap.get_mut(class_value.as_obj()) {
            if visibility == 1 {
                c.private_methods.insert(name, closure);
            } else {
                c.methods.insert(name, closure);
            }
        }
        Ok(())
    }

    fn use_trait(&mut self) -> Result<(), RuntimeError> {
        let trait_value = self.pop();
        if !trait_value.is_obj() || !matches!(self.heap.get(trait_value.as_obj()), Object::Class(_)) {
            return Err(self.runtime_error("Can only use traits."));
        }
        let trait_methods = match self.heap.get(trait_value.as_obj()) {
            Object::Class(c) => c.methods.clone(),
            _ => unreachable!(),
        };
        let class_value = self.peek(0);
        if let Object::Class(c) = self.heap.get_mut(class_value.as_obj()) {
            for (name, closure) in trait_methods.iter() {
                if !c.methods.contains_key(name) {
                    c.methods.insert(*name, *closure);
                }
            }
        }
        Ok(())
    }

    // ---- properties -------------------------------------------------

    fn get_property(&mut self, no_pop: bool) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        if !receiver.is_obj() {
            return Err(self.runtime_error("Only instances have properties."));
        }
        let idx_or_name = self.read_byte();
        let name = self.read_constant(idx_or_name).as_obj();
        let handle = receiver.as_obj();
        let result = match self.heap.get(handle) {
            Object::Instance(inst) => {
                if let Some(v) = inst.public_fields.get(&name).copied() {
                    Some(v)
                } else {
                    let class = inst.class.expect("instance has a class");
                    self.bind_method(class, receiver, name)
                }
            }
            Object::Module(m) => m.values.get(&name).copied(),
            Object::Enum(e) => e.values.get(&name).copied(),
            Object::Class(c) => c.class_variables.get(&name).copied(),
            _ => None,
        };
        match result {
            Some(v) => {
                if !no_pop {
                    self.pop();
                }
                self.push(v)
            }
            None => Err(self.runtime_error(format!("Undefined property '{}'.", self.string_at(name)))),
        }
    }

    fn bind_method(&mut self, class: ObjHandle, receiver: Value, name: ObjHandle) -> Option<Value> {
        let method = match self.heap.get(class) {
            Object::Class(c) => c.methods.get(&name).copied(),
            _ => None,
        }?;
        let bound = ObjBoundMethod { receiver, method: method.as_obj() };
        let handle = self.heap.alloc(Object::BoundMethod(bound), 16);
        Some(Value::obj(handle))
    }

    fn set_property(&mut self, _private: bool) -> Result<(), RuntimeError> {
        let idx = self.read_byte();
        let name = self.read_constant(idx).as_obj();
        let value = self.pop();
        let receiver = self.peek(0);
        if !receiver.is_obj() {
            return Err(self.runtime_error("Only instances have fields."));
        }
        match self.heap.get_mut(receiver.as_obj()) {
            Object::Instance(inst) => {
                inst.public_fields.insert(name, value);
                Ok(())
            }
            _ => Err(self.runtime_error("Only instances have fields.")),
        }
    }

    fn get_private_property(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_byte();
        let name = self.read_constant(idx).as_obj();
        let receiver = self.pop();
        if !receiver.is_obj() {
            return Err(self.runtime_error("Only instances have properties."));
        }
        match self.heap.get(receiver.as_obj()) {
            Object::Instance(inst) => match inst.private_fields.get(&name).copied() {
                Some(v) => self.push(v),
                None => Err(self.runtime_error(format!("Undefined property '{}'.", self.string_at(name)))),
            },
            _ => Err(self.runtime_error("Only instances have properties.")),
        }
    }

    fn set_private_property(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_byte();
        let name = self.read_constant(idx).as_obj();
        let value = self.pop();
        let receiver = self.peek(0);
        match self.heap.get_mut(receiver.as_obj()) {
            Object::Instance(inst) => {
                inst.private_fields.insert(name, value);
                Ok(())
            }
            _ => Err(self.runtime_error("Only instances have fields.")),
        }
    }

    fn get_super(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_byte();
        let name = self.read_constant(idx).as_obj();
        let superclass = self.pop();
        let receiver = self.pop();
        match self.bind_method(superclass.as_obj(), receiver, name) {
            Some(v) => self.push(v),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", self.string_at(name)))),
        }
    }

    // ---- subscripting -------------------------------------------------

    fn subscript_get(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let container = self.pop();
        let value = self.subscript_read(container, index)?;
        self.push(value)
    }

    fn subscript_get_no_pop(&mut self) -> Result<(), RuntimeError> {
        let index = self.peek(0);
        let container = self.peek(1);
        let value = self.subscript_read(container, index)?;
        self.push(value)
    }

    fn subscript_read(&self, container: Value, index: Value) -> Result<Value, RuntimeError> {
        if !container.is_obj() {
            return Err(self.runtime_error("Only lists, dicts, and sets support indexing."));
        }
        match self.heap.get(container.as_obj()) {
            Object::List(l) => {
                let i = self.list_index(l.items.len(), index)?;
                Ok(l.items[i])
            }
            Object::Dict(d) => d
                .table
                .get(&index)
                .copied()
                .ok_or_else(|| self.runtime_error("Key not found.")),
            _ => Err(self.runtime_error("Only lists, dicts, and sets support indexing.")),
        }
    }

    fn list_index(&self, len: usize, index: Value) -> Result<usize, RuntimeError> {
        if !index.is_number() {
            return Err(self.runtime_error("List index must be a number."));
        }
        let raw = index.as_number() as i64;
        let resolved = if raw < 0 { raw + len as i64 } else { raw };
        if resolved < 0 || resolved as usize >= len {
            return Err(self.runtime_error("List index out of range."));
        }
        Ok(resolved as usize)
    }

    fn subscript_set(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let container = self.pop();
        if !container.is_obj() {
            return Err(self.runtime_error("Only lists and dicts support index assignment."));
        }
        match self.heap.get_mut(container.as_obj()) {
            Object::List(l) => {
                let len = l.items.len();
                if !index.is_number() {
                    return Err(self.runtime_error("List index must be a number."));
                }
                let raw = index.as_number() as i64;
                let resolved = if raw < 0 { raw + len as i64 } else { raw };
                if resolved < 0 || resolved as usize >= len {
                    return Err(self.runtime_error("List index out of range."));
                }
                l.items[resolved as usize] = value;
            }
            Object::Dict(d) => {
                d.table.insert(index, value);
            }
            _ => return Err(self.runtime_error("Only lists and dicts support index assignment.")),
        }
        self.push(value)
    }

    fn subscript_slice(&mut self) -> Result<(), RuntimeError> {
        let end = self.pop();
        let start = self.pop();
        let container = self.pop();
        if !container.is_obj() {
            return Err(self.runtime_error("Only lists support slicing."));
        }
        let len = match self.heap.get(container.as_obj()) {
            Object::List(l) => l.items.len(),
            _ => return Err(self.runtime_error("Only lists support slicing.")),
        };
        let start_idx = if start.is_nil() { 0 } else { self.slice_bound(start, len)? };
        let end_idx = if end.is_nil() { len } else { self.slice_bound(end, len)? };
        let (lo, hi) = if start_idx <= end_idx { (start_idx, end_idx) } else { (end_idx, start_idx) };
        let items = match self.heap.get(container.as_obj()) {
            Object::List(l) => l.items[lo.min(len)..hi.min(len)].to_vec(),
            _ => unreachable!(),
        };
        let handle = self.heap.alloc(Object::List(ObjList { items }), 24 + (hi - lo) * 8);
        self.push(Value::obj(handle))
    }

    fn slice_bound(&self, v: Value, len: usize) -> Result<usize, RuntimeError> {
        if !v.is_number() {
            return Err(self.runtime_error("Slice bound must be a number."));
        }
        let raw = v.as_number() as i64;
        let resolved = if raw < 0 { (raw + len as i64).max(0) } else { raw };
        Ok(resolved as usize)
    }

    // ---- fibers -------------------------------------------------

    fn invoke_fiber_method(
        &mut self,
        fiber_handle: ObjHandle,
        name: ObjHandle,
        argc: usize,
    ) -> Result<CallOutcome, RuntimeError> {
        let method_name = self.string_at(name);
        match method_name.as_str() {
            "call" => self.fiber_call(fiber_handle, argc),
            _ => Err(self.runtime_error(format!("Fiber has no method '{method_name}'."))),
        }
    }

    /// Dispatches `Fiber.new(...)`/`Fiber.yield(...)`, the two static
    /// entry points hung off the builtin `Fiber` global.
    fn invoke_fiber_static(&mut self, name: ObjHandle, argc: usize) -> Result<CallOutcome, RuntimeError> {
        let method_name = self.string_at(name);
        match method_name.as_str() {
            "new" => self.fiber_new(argc),
            "yield" => self.fiber_yield(argc),
            _ => Err(self.runtime_error(format!("Fiber has no static method '{method_name}'."))),
        }
    }

    fn fiber_new(&mut self, argc: usize) -> Result<CallOutcome, RuntimeError> {
        if argc != 1 {
            return Err(self.runtime_error(format!("Expected 1 argument but got {argc}.")));
        }
        let closure_value = self.peek(0);
        let is_closure = closure_value.is_obj() && matches!(self.heap.get(closure_value.as_obj()), Object::Closure(_));
        if !is_closure {
            return Err(self.runtime_error("Fiber.new() requires a function argument."));
        }
        let closure_handle = closure_value.as_obj();
        let handle = self.heap.alloc(Object::Fiber(ObjFiber::new(closure_handle)), 64);
        // `ObjFiber::new` leaves its stack empty; slot 0 at the frame's
        // `slots_base` must hold the closure itself, matching the
        // convention `interpret`/`load_module` seed their own root frame
        // with, so the first `.call()` sees a stack shaped like any other.
        if let Object::Fiber(f) = self.heap.get_mut(handle) {
            f.stack.push(Value::obj(closure_handle));
        }
        self.stack.truncate(self.stack.len() - argc - 1);
        self.push(Value::obj(handle))?;
        Ok(CallOutcome::Continue)
    }

    /// Suspends the running fiber at this point and transfers control back
    /// to its caller, `value` becoming the caller's pending `.call()` result.
    /// The fiber stays `Ready`, resumable later by another `.call()` which
    /// picks up with `value`'s eventual replacement sitting where this
    /// expression's result belongs.
    fn fiber_yield(&mut self, argc: usize) -> Result<CallOutcome, RuntimeError> {
        if argc > 1 {
            return Err(self.runtime_error(format!("Expected 0 or 1 arguments but got {argc}.")));
        }
        let value = if argc == 1 { self.pop() } else { Value::nil() };
        self.pop(); // the Fiber global itself

        let current = self.current_fiber.expect("a fiber is always active");
        let caller = match self.heap.get(current) {
            Object::Fiber(f) => f.caller,
            _ => unreachable!(),
        };
        let caller = match caller {
            Some(c) => c,
            None => return Err(self.runtime_error("Cannot yield from the root fiber.")),
        };

        let suspended_stack = std::mem::take(&mut self.stack);
        let suspended_frames = std::mem::take(&mut self.frames);
        let suspended_upvalues = std::mem::take(&mut self.open_upvalues);
        if let Object::Fiber(f) = self.heap.get_mut(current) {
            f.stack = suspended_stack;
            f.frames = suspended_frames;
            f.open_upvalues = suspended_upvalues.into_iter().collect();
            f.state = FiberState::Ready;
        }
        self.fiber_stack.pop();

        let (stack, frames, open_upvalues) = match self.heap.get(caller) {
            Object::Fiber(f) => (f.stack.clone(), f.frames.clone(), f.open_upvalues.clone()),
            _ => unreachable!(),
        };
        self.stack = stack;
        self.frames = frames;
        self.open_upvalues = open_upvalues.into_iter().collect();
        self.current_fiber = Some(caller);
        if let Object::Fiber(f) = self.heap.get_mut(caller) {
            f.state = FiberState::Running;
        }
        self.push(value)?;
        Ok(CallOutcome::Continue)
    }

    /// Handles a fiber's top-level closure returning naturally. If it has a
    /// caller (it was reached via `.call()`), that caller resumes with
    /// `result` as the call's value and the fiber moves to `Done`; otherwise
    /// this is the root fiber finishing and `run`'s loop should exit.
    fn finish_current_fiber(&mut self, result: Value) -> Result<CallOutcome, RuntimeError> {
        let caller = match self.current_fiber {
            Some(fh) => match self.heap.get(fh) {
                Object::Fiber(f) => f.caller,
                _ => None,
            },
            None => None,
        };
        let caller = match caller {
            Some(c) => c,
            None => return Ok(CallOutcome::Done(result)),
        };
        if let Some(fh) = self.current_fiber {
            if let Object::Fiber(f) = self.heap.get_mut(fh) {
                f.state = FiberState::Done;
            }
        }
        self.fiber_stack.pop();

        let (stack, frames, open_upvalues) = match self.heap.get(caller) {
            Object::Fiber(f) => (f.stack.clone(), f.frames.clone(), f.open_upvalues.clone()),
            _ => unreachable!(),
        };
        self.stack = stack;
        self.frames = frames;
        self.open_upvalues = open_upvalues.into_iter().collect();
        self.current_fiber = Some(caller);
        if let Object::Fiber(f) = self.heap.get_mut(caller) {
            f.state = FiberState::Running;
        }
        self.push(result)?;
        Ok(CallOutcome::Continue)
    }

    /// Switches the active stack/frames/open-upvalues to `fiber_handle`,
    /// suspending whatever fiber is currently running onto `fiber_stack`.
    fn fiber_call(&mut self, fiber_handle: ObjHandle, argc: usize) -> Result<CallOutcome, RuntimeError> {
        let state = match self.heap.get(fiber_handle) {
            Object::Fiber(f) => f.state,
            _ => unreachable!(),
        };
        if state == FiberState::Done {
            return Err(self.runtime_error("Cannot call a finished fiber."));
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        self.pop(); // the fiber receiver itself

        let caller = self.current_fiber.expect("a fiber is always active");
        let suspended_stack = std::mem::take(&mut self.stack);
        let suspended_frames = std::mem::take(&mut self.frames);
        let suspended_upvalues = std::mem::take(&mut self.open_upvalues);
        if let Object::Fiber(f) = self.heap.get_mut(caller) {
            f.stack = suspended_stack;
            f.frames = suspended_frames;
            f.open_upvalues = suspended_upvalues.into_iter().collect();
            f.state = FiberState::Ready;
        }
        self.fiber_stack.push(caller);

        let (mut stack, frames, open_upvalues) = match self.heap.get(fiber_handle) {
            Object::Fiber(f) => (f.stack.clone(), f.frames.clone(), f.open_upvalues.clone()),
            _ => unreachable!(),
        };
        stack.extend(args);
        self.stack = stack;
        self.frames = frames;
        self.open_upvalues = open_upvalues.into_iter().collect();
        self.current_fiber = Some(fiber_handle);
        if let Object::Fiber(f) = self.heap.get_mut(fiber_handle) {
            f.caller = Some(caller);
            f.state = FiberState::Running;
        }
        Ok(CallOutcome::Continue)
    }

    // ---- modules -------------------------------------------------

    fn load_module(&mut self, raw_name: &str) -> Result<ObjHandle, String> {
        let path = if raw_name.ends_with(".em") {
            raw_name.to_string()
        } else {
            format!("{raw_name}.em")
        };
        let path_handle = self.interner.intern(&mut self.heap, &path);
        if let Some(existing) = self.modules.get(&path_handle) {
            return Ok(*existing);
        }

        let source = std::fs::read_to_string(&path)
            .map_err(|e| format!("Could not open module '{path}': {e}"))?;
        let function = ember_compiler::compile(&source, &path, &mut self.heap, &mut self.interner)
            .map_err(|errs| {
                let joined: Vec<String> = errs.into_iter().map(|e| e.message).collect();
                format!("Error compiling module '{path}': {}", joined.join("; "))
            })?;
        let closure = self
            .heap
            .alloc(Object::Closure(ObjClosure { function, upvalues: Vec::new() }), 32);

        // The caller's stack/frames/upvalues have to stay GC-reachable for the
        // whole nested run below, so they're parked in a real heap object and
        // rooted via `fiber_stack` rather than sitting in local variables a
        // collection triggered mid-module-load couldn't see.
        let suspended_stack = std::mem::take(&mut self.stack);
        let suspended_frames =
            std::mem::replace(&mut self.frames, vec![CallFrame { closure, ip: 0, slots_base: 0 }]);
        let suspended_upvalues: Vec<ObjHandle> = std::mem::take(&mut self.open_upvalues).into_iter().collect();
        let snapshot = ObjFiber {
            stack: suspended_stack,
            frames: suspended_frames,
            open_upvalues: suspended_upvalues,
            state: FiberState::Ready,
            caller: None,
        };
        let snapshot_handle = self.heap.alloc(Object::Fiber(snapshot), 64);
        self.fiber_stack.push(snapshot_handle);
        // Module execution isn't a real fiber, so its own top-level `Return`
        // must never be mistaken for a yield/finish needing a fiber to
        // switch back to (see `finish_current_fiber`).
        let suspended_fiber = self.current_fiber.take();

        self.stack.push(Value::obj(closure));
        self.globals_stack.push(Table::new());

        let run_result = self.run();

        self.current_fiber = suspended_fiber;
        let module_globals = self.globals_stack.pop().expect("pushed before running module");
        self.fiber_stack.pop();
        let (stack, frames, open_upvalues) = match self.heap.get(snapshot_handle) {
            Object::Fiber(f) => (f.stack.clone(), f.frames.clone(), f.open_upvalues.clone()),
            _ => unreachable!(),
        };
        self.stack = stack;
        self.frames = frames;
        self.open_upvalues = open_upvalues.into_iter().collect();

        run_result.map_err(|e| e.to_string())?;

        let name_handle = self.interner.intern(&mut self.heap, raw_name);
        let module = ObjModule { name: Some(name_handle), path: path.clone(), values: module_globals };
        let module_handle = self.heap.alloc(Object::Module(module), 64);
        self.modules.insert(path_handle, module_handle);
        Ok(module_handle)
    }

    // ---- misc -------------------------------------------------

    fn string_at(&self, handle: ObjHandle) -> String {
        match self.heap.get(handle) {
            Object::String(s) => s.value.clone(),
            _ => String::new(),
        }
    }

    fn maybe_collect(&mut self) {
        if self.config.stress_gc {
            self.collect();
            return;
        }
        if self.heap.bytes_allocated > self.gc_threshold {
            self.collect();
            self.gc_threshold = self.heap.bytes_allocated * self.config.gc_growth_factor;
        }
    }

    fn collect(&mut self) {
        let mut root_values = self.stack.clone();
        root_values.extend_from_slice(&self.temp_roots);
        let mut root_handles: Vec<ObjHandle> = self.frames.iter().map(|f| f.closure).collect();
        root_handles.extend(self.open_upvalues.iter().copied());
        root_handles.extend(self.fiber_stack.iter().copied());
        if let Some(f) = self.current_fiber {
            root_handles.push(f);
        }
        if let Some(m) = self.last_imported_module {
            root_handles.push(m);
        }
        for table in &self.globals_stack {
            for (k, v) in table.iter() {
                root_handles.push(*k);
                root_values.push(*v);
            }
        }
        for (k, v) in self.modules.iter() {
            root_handles.push(*k);
            root_handles.push(*v);
        }

        let stats = gc::collect(&mut self.heap, &mut self.interner, &root_values, &root_handles);
        tracing::debug!(
            objects_freed = stats.objects_freed,
            bytes_freed = stats.bytes_freed,
            "garbage collection cycle complete"
        );
    }
}

impl VmContext for Vm {
    fn alloc(&mut self, object: Object) -> ObjHandle {
        let size = object.approx_size();
        self.heap.alloc(object, size)
    }

    fn raise(&mut self, message: String) {
        self.pending_error = Some(message);
    }

    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }
}

fn values_equal(a: Value, b: Value) -> bool {
    if a.is_number() && b.is_number() {
        return a.as_number() == b.as_number();
    }
    if a.is_obj() && b.is_obj() {
        let (ha, hb) = (a.as_obj(), b.as_obj());
        if ha == hb {
            return true;
        }
    }
    a == b
}

fn class_type_from_byte(byte: u8) -> ClassType {
    match byte {
        1 => ClassType::Abstract,
        2 => ClassType::Trait,
        _ => ClassType::Default,
    }
}
