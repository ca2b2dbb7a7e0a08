//! Single-pass Pratt parser + bytecode emitter.
//!
//! One [`Compiler`] drives the whole compilation; per-function state (locals,
//! upvalues, scope depth, loop stack) lives on an explicit stack of
//! [`FuncState`] frames rather than a chain of enclosing pointers, which
//! keeps ownership simple: no parent pointers to thread through the borrow
//! checker.

use ember_core::handle::{Heap, ObjHandle};
use ember_core::interner::Interner;
use ember_core::object::{
    Chunk, FunctionType, Object, ObjClass, ObjFunction, ClassType, UpvalueDesc,
};
use ember_core::value::Value;

use crate::opcode::OpCode;
use crate::scanner::{Scanner, Token, TokenKind};

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None = 0,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Equal | PlusEqual | MinusEqual | StarEqual | SlashEqual | PercentEqual => {
            Precedence::Assignment
        }
        Question => Precedence::Ternary,
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        Pipe => Precedence::BitOr,
        Caret => Precedence::BitXor,
        Amp => Precedence::BitAnd,
        LessLess | GreaterGreater => Precedence::Shift,
        Plus | Minus => Precedence::Term,
        Star | Slash | Percent | StarStar => Precedence::Factor,
        LeftParen | Dot | LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalSlot {
    /// Declared but initializer not yet evaluated: reading this name in its
    /// own initializer is a compile error.
    Uninitialized,
    Depth(i32),
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: LocalSlot,
    is_captured: bool,
}

#[derive(Debug, Clone)]
struct LoopCtx {
    /// Bytecode offset of the loop's condition check, for `continue`.
    loop_start: usize,
    /// Scope depth at loop entry, so break/continue know how many locals to
    /// pop before jumping.
    scope_depth: i32,
    /// Patch sites for `break` statements, resolved once the loop ends.
    break_jumps: Vec<usize>,
}

struct FuncState {
    name: String,
    fn_type: FunctionType,
    chunk: Chunk,
    arity: u8,
    arity_optional: u8,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
}

impl FuncState {
    fn new(name: String, fn_type: FunctionType) -> Self {
        // Slot 0 is reserved for the receiver (methods/initializers) or the
        // function itself.
        let reserved_name = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        FuncState {
            name,
            fn_type,
            chunk: Chunk::default(),
            arity: 0,
            arity_optional: 0,
            locals: vec![Local {
                name: reserved_name.to_string(),
                depth: LocalSlot::Depth(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
    class_type: ClassType,
}

/// Drives compilation of one source string into a top-level `Function`
/// object allocated on `heap`.
pub struct Compiler<'h> {
    scanner: Scanner,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    interner: &'h mut Interner,
    module_name: ObjHandle,
    funcs: Vec<FuncState>,
    classes: Vec<ClassCtx>,
}

type ParseResult = Result<(), ()>;

impl<'h> Compiler<'h> {
    pub fn compile(
        source: &str,
        module_name: &str,
        heap: &'h mut Heap,
        interner: &'h mut Interner,
    ) -> Result<ObjHandle, Vec<CompileError>> {
        let module_handle = interner.intern(heap, module_name);
        let dummy = Token {
            kind: TokenKind::Error,
            lexeme: String::new(),
            line: 0,
        };
        let mut compiler = Compiler {
            scanner: Scanner::new(source),
            previous: dummy.clone(),
            current: dummy,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            heap,
            interner,
            module_name: module_handle,
            funcs: vec![FuncState::new("script".to_string(), FunctionType::TopLevel)],
            classes: Vec::new(),
        };

        compiler.advance();
        while !compiler.check(TokenKind::Eof) {
            let _ = compiler.declaration();
        }
        compiler.emit_return();

        if compiler.had_error {
            return Err(compiler.errors);
        }

        let func_state = compiler.funcs.pop().expect("top-level function state");
        let function = ObjFunction {
            name: None,
            arity: func_state.arity,
            arity_optional: func_state.arity_optional,
            upvalue_count: func_state.upvalues.len() as u8,
            chunk: func_state.chunk,
            fn_type: FunctionType::TopLevel,
            upvalues: func_state.upvalues,
            module: Some(compiler.module_name),
        };
        let size = 64 + function.chunk.code.len();
        Ok(compiler.heap.alloc(Object::Function(function), size))
    }

    // ---- token stream helpers -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at(line, message);
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.error_at(line, message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError {
            message: message.to_string(),
            line,
        });
    }

    /// Consume tokens until a statement boundary, so one syntax error
    /// doesn't cascade into a wall of spurious diagnostics.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- emission helpers -------------------------------------------------

    fn current_fn(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("at least one function state")
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current_fn().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_two(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        // Bare `return` in an initializer yields the receiver (slot 0, `this`).
        if self.current_fn().fn_type == FunctionType::Initializer {
            self.emit_two(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_fn().chunk.add_constant(value) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                0
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.interner.intern(self.heap, name);
        self.make_constant(Value::obj(handle))
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_two(OpCode::Constant, idx);
    }

    /// Emit a jump with a placeholder 2-byte offset, returning the offset of
    /// the first placeholder byte for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_fn().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_fn().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        self.current_fn().chunk.code[offset] = bytes[0];
        self.current_fn().chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_fn().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // ---- scopes, locals, upvalues -----------------------------------------

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let f = self.current_fn();
            f.scope_depth -= 1;
            f.scope_depth
        };
        while let Some(local) = self.current_fn().locals.last() {
            let still_in_scope = matches!(local.depth, LocalSlot::Depth(d) if d > depth);
            if !still_in_scope {
                break;
            }
            if self.current_fn().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_fn().locals.pop();
        }
    }

    fn declare_variable(&mut self, name: &str) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth;
        for local in self.current_fn().locals.iter().rev() {
            if matches!(local.depth, LocalSlot::Depth(d) if d < depth) {
                break;
            }
            if local.name == name {
                self.error("Variable with this name already declared in this scope.");
                return;
            }
        }
        if self.current_fn().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_fn().locals.push(Local {
            name: name.to_string(),
            depth: LocalSlot::Uninitialized,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.current_fn().scope_depth == 0 {
            return;
        }
        let depth = self.current_fn().scope_depth;
        if let Some(local) = self.current_fn().locals.last_mut() {
            local.depth = LocalSlot::Depth(depth);
        }
    }

    fn resolve_local(&mut self, func_index: usize, name: &str) -> Result<Option<u8>, ()> {
        let f = &self.funcs[func_index];
        for (i, local) in f.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == LocalSlot::Uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                    return Err(());
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Result<Option<u8>, ()> {
        if func_index == 0 {
            return Ok(None);
        }
        let enclosing = func_index - 1;
        if let Some(local_idx) = self.resolve_local(enclosing, name)? {
            self.funcs[enclosing].locals[local_idx as usize].is_captured = true;
            return Ok(Some(self.add_upvalue(func_index, local_idx, true)));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name)? {
            return Ok(Some(self.add_upvalue(func_index, upvalue_idx, false)));
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        let f = &mut self.funcs[func_index];
        for (i, uv) in f.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        f.upvalues.push(UpvalueDesc { index, is_local });
        (f.upvalues.len() - 1) as u8
    }

    // ---- declarations -------------------------------------------------

    fn declaration(&mut self) -> ParseResult {
        let result = if self.matches(TokenKind::Class) {
            self.class_declaration(ClassType::Default)
        } else if self.matches(TokenKind::Abstract) {
            self.consume(TokenKind::Class, "Expect 'class' after 'abstract'.");
            self.class_declaration(ClassType::Abstract)
        } else if self.matches(TokenKind::Trait) {
            self.class_declaration(ClassType::Trait)
        } else if self.matches(TokenKind::Def) {
            self.fun_declaration()
        } else if self.matches(TokenKind::Var) {
            self.var_declaration()
        } else if self.matches(TokenKind::Enum) {
            self.enum_declaration()
        } else if self.matches(TokenKind::Import) {
            self.import_statement()
        } else if self.matches(TokenKind::From) {
            self.from_import_statement()
        } else {
            self.statement()
        };
        if result.is_err() {
            self.synchronize();
        }
        Ok(())
    }

    fn var_declaration(&mut self) -> ParseResult {
        self.consume(TokenKind::Identifier, "Expect variable name.");
        let name = self.previous.lexeme.clone();
        let global_const = self.declare_or_global(&name);

        if self.matches(TokenKind::Equal) {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global_const);
        Ok(())
    }

    /// Declares `name` as a local if inside a scope, otherwise returns the
    /// constant-pool index to use with `OP_DEFINE_GLOBAL`.
    fn declare_or_global(&mut self, name: &str) -> u8 {
        if self.current_fn().scope_depth > 0 {
            self.declare_variable(name);
            0
        } else {
            self.identifier_constant(name)
        }
    }

    fn define_variable(&mut self, global_const: u8) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_two(OpCode::DefineGlobal, global_const);
    }

    fn fun_declaration(&mut self) -> ParseResult {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.previous.lexeme.clone();
        let global_const = self.declare_or_global(&name);
        self.mark_initialized();
        self.function(FunctionType::Function, &name)?;
        self.define_variable(global_const);
        Ok(())
    }

    /// Compiles a function body (shared by `def` declarations, methods, and
    /// arrow functions) as a nested `FuncState`, then emits
    /// `OP_CLOSURE` with the resulting function constant.
    fn function(&mut self, fn_type: FunctionType, name: &str) -> ParseResult {
        self.funcs.push(FuncState::new(name.to_string(), fn_type));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut seen_optional = false;
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_fn().arity as usize + self.current_fn().arity_optional as usize
                    >= 255
                {
                    self.error("Can't have more than 255 parameters.");
                }
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let pname = self.previous.lexeme.clone();
                self.declare_variable(&pname);
                self.mark_initialized();

                if self.matches(TokenKind::Equal) {
                    seen_optional = true;
                    self.current_fn().arity_optional += 1;
                    // Trailing omitted args arrive as `nil` (call_closure pads
                    // them); test the slot itself and only assign the default
                    // when it's falsey, leaving a caller-supplied value alone.
                    let slot = (self.current_fn().locals.len() - 1) as u8;
                    self.emit_two(OpCode::GetLocal, slot);
                    let has_value_jump = self.emit_jump(OpCode::JumpIfFalse);
                    self.emit_op(OpCode::Pop);
                    let end_jump = self.emit_jump(OpCode::Jump);
                    self.patch_jump(has_value_jump);
                    self.emit_op(OpCode::Pop);
                    self.expression()?;
                    self.emit_two(OpCode::SetLocal, slot);
                    self.emit_op(OpCode::Pop);
                    self.patch_jump(end_jump);
                } else {
                    if seen_optional {
                        self.error("Required parameter cannot follow an optional parameter.");
                    }
                    self.current_fn().arity += 1;
                }

                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        if self.matches(TokenKind::Arrow) {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after arrow function body.");
            self.emit_op(OpCode::Return);
        } else {
            self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
            self.block()?;
            self.emit_return();
        }

        self.finish_function();
        Ok(())
    }

    fn finish_function(&mut self) {
        let func_state = self.funcs.pop().expect("pushed function state");
        let name_handle = self.interner.intern(self.heap, &func_state.name);
        let upvalue_count = func_state.upvalues.len() as u8;
        let function = ObjFunction {
            name: Some(name_handle),
            arity: func_state.arity,
            arity_optional: func_state.arity_optional,
            upvalue_count,
            chunk: func_state.chunk,
            fn_type: func_state.fn_type,
            upvalues: func_state.upvalues.clone(),
            module: Some(self.module_name),
        };
        let size = 64 + function.chunk.code.len();
        let handle = self.heap.alloc(Object::Function(function), size);
        let const_idx = self.make_constant(Value::obj(handle));
        self.emit_two(OpCode::Closure, const_idx);
        for uv in &func_state.upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn class_declaration(&mut self, class_type: ClassType) -> ParseResult {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&class_name);
        self.declare_variable(&class_name);

        let has_superclass = self.matches(TokenKind::Less);
        let mut super_name: Option<String> = None;
        if has_superclass {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let name = self.previous.lexeme.clone();
            if name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.variable(&name, false)?;
            self.emit_two(OpCode::Subclass, name_const);
            super_name = Some(name);
        } else {
            self.emit_two(OpCode::Class, name_const);
        }
        self.emit_byte(class_type as u8);
        self.define_variable(name_const);

        self.classes.push(ClassCtx {
            has_superclass,
            class_type,
        });

        if let Some(super_name) = &super_name {
            // A scope that lives only to hold the "super" local; closed
            // once the class body finishes compiling.
            self.begin_scope();
            self.variable(super_name, false)?;
            self.declare_variable("super");
            self.mark_initialized();
        }
        // Re-load the class onto the stack so methods can be attached.
        self.variable(&class_name, false)?;

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::Use) {
                self.consume(TokenKind::Identifier, "Expect trait name.");
                let trait_name = self.previous.lexeme.clone();
                self.variable(&trait_name, false)?;
                self.emit_op(OpCode::Use);
                while self.matches(TokenKind::Comma) {
                    self.consume(TokenKind::Identifier, "Expect trait name.");
                    let trait_name = self.previous.lexeme.clone();
                    self.variable(&trait_name, false)?;
                    self.emit_op(OpCode::Use);
                }
                self.consume(TokenKind::Semicolon, "Expect ';' after use clause.");
                continue;
            }
            self.method()?;
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::EndClass);
        self.emit_op(OpCode::Pop); // discard the class reference left for method attachment

        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
        Ok(())
    }

    fn method(&mut self) -> ParseResult {
        let is_static = self.matches(TokenKind::Static);
        let is_private = self.matches(TokenKind::Private);
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        let fn_type = if name == "init" && !is_static {
            FunctionType::Initializer
        } else if is_static {
            FunctionType::StaticMethod
        } else {
            FunctionType::Method
        };

        let is_abstract_class = matches!(
            self.classes.last(),
            Some(ClassCtx {
                class_type: ClassType::Abstract,
                ..
            })
        );
        if is_abstract_class && self.check(TokenKind::Semicolon) {
            self.advance();
            self.emit_two(OpCode::Method, name_const);
            self.emit_byte(2); // 2 = abstract signature, no body
            return Ok(());
        }

        self.function(fn_type, &name)?;
        self.emit_two(OpCode::Method, name_const);
        self.emit_byte(if is_private { 1 } else { 0 });
        Ok(())
    }

    fn enum_declaration(&mut self) -> ParseResult {
        self.consume(TokenKind::Identifier, "Expect enum name.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);
        self.declare_variable(&name);
        self.emit_two(OpCode::Enum, name_const);
        self.define_variable(name_const);

        self.consume(TokenKind::LeftBrace, "Expect '{' before enum body.");
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.consume(TokenKind::Identifier, "Expect enum value name.");
                let value_name = self.previous.lexeme.clone();
                let value_const = self.identifier_constant(&value_name);
                self.variable(&name, false)?;
                self.emit_two(OpCode::SetEnumValue, value_const);
                self.emit_op(OpCode::Pop);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after enum body.");
        Ok(())
    }

    fn import_statement(&mut self) -> ParseResult {
        if self.check(TokenKind::String) {
            self.advance();
            let path = self.previous.lexeme.clone();
            let const_idx = self.identifier_constant(&path);
            self.emit_two(OpCode::Import, const_idx);
            self.emit_op(OpCode::Pop);
        } else {
            self.consume(TokenKind::Identifier, "Expect module name or path.");
            let name = self.previous.lexeme.clone();
            let const_idx = self.identifier_constant(&name);
            self.emit_two(OpCode::ImportBuiltin, const_idx);
            let global_const = self.declare_or_global(&name);
            self.define_variable(global_const);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
        Ok(())
    }

    fn from_import_statement(&mut self) -> ParseResult {
        self.consume(TokenKind::Identifier, "Expect module name.");
        let module = self.previous.lexeme.clone();
        let module_const = self.identifier_constant(&module);
        self.consume(TokenKind::Import, "Expect 'import' after module name.");
        self.emit_two(OpCode::ImportBuiltin, module_const);
        self.emit_op(OpCode::Pop);

        loop {
            self.consume(TokenKind::Identifier, "Expect imported name.");
            let name = self.previous.lexeme.clone();
            let name_const = self.identifier_constant(&name);
            self.emit_two(OpCode::ImportVariable, name_const);
            let global_const = self.declare_or_global(&name);
            self.define_variable(global_const);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.emit_op(OpCode::ImportEnd);
        self.consume(TokenKind::Semicolon, "Expect ';' after import.");
        Ok(())
    }

    // ---- statements -------------------------------------------------

    fn statement(&mut self) -> ParseResult {
        if self.matches(TokenKind::If) {
            self.if_statement()
        } else if self.matches(TokenKind::While) {
            self.while_statement()
        } else if self.matches(TokenKind::For) {
            self.for_statement()
        } else if self.matches(TokenKind::Return) {
            self.return_statement()
        } else if self.matches(TokenKind::Break) {
            self.break_statement()
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement()
        } else if self.check(TokenKind::LeftBrace) {
            self.brace_statement()
        } else {
            self.expression_statement()
        }
    }

    /// Resolves the `{` block-vs-dict-literal ambiguity
    /// using the scanner's two-token lookahead instead of backtracking.
    fn brace_statement(&mut self) -> ParseResult {
        let looks_like_dict = {
            let first = self.scanner.peek_token().kind;
            if first == TokenKind::RightBrace {
                // `{}` - ambiguous in isolation; treat as an empty block,
                // matching ordinary block-statement expectations.
                false
            } else {
                let second = self.scanner.peek2_token().kind;
                matches!(first, TokenKind::String | TokenKind::Identifier)
                    && second == TokenKind::Colon
            }
        };
        if looks_like_dict {
            self.expression_statement()
        } else {
            self.advance(); // consume '{'
            self.begin_scope();
            self.block()?;
            self.end_scope();
            Ok(())
        }
    }

    fn block(&mut self) -> ParseResult {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration()?;
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
        Ok(())
    }

    fn expression_statement(&mut self) -> ParseResult {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> ParseResult {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement()?;

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump);
        Ok(())
    }

    fn while_statement(&mut self) -> ParseResult {
        let loop_start = self.current_fn().chunk.code.len();
        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx {
            loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement()?;
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
        Ok(())
    }

    fn for_statement(&mut self) -> ParseResult {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.current_fn().chunk.code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_fn().chunk.code.len();
            self.expression()?;
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.current_fn().scope_depth;
        self.current_fn().loops.push(LoopCtx {
            loop_start,
            scope_depth,
            break_jumps: Vec::new(),
        });

        self.statement()?;
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_loop();
        self.end_scope();
        Ok(())
    }

    fn end_loop(&mut self) {
        let loop_ctx = self.current_fn().loops.pop().expect("loop context pushed");
        for break_jump in loop_ctx.break_jumps {
            self.patch_jump(break_jump);
        }
    }

    fn return_statement(&mut self) -> ParseResult {
        if self.current_fn().fn_type == FunctionType::TopLevel {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_fn().fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
        Ok(())
    }

    fn break_statement(&mut self) -> ParseResult {
        if self.current_fn().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
            return Ok(());
        }
        self.pop_locals_for_loop_exit();
        let jump = self.emit_jump(OpCode::Jump);
        self.current_fn().loops.last_mut().unwrap().break_jumps.push(jump);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        Ok(())
    }

    fn continue_statement(&mut self) -> ParseResult {
        if self.current_fn().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return Ok(());
        }
        self.pop_locals_for_loop_exit();
        let loop_start = self.current_fn().loops.last().unwrap().loop_start;
        self.emit_loop(loop_start);
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        Ok(())
    }

    /// `break`/`continue` jump out of however many block scopes were
    /// entered since the loop started; pop their locals first so the value
    /// stack stays balanced (testable property: stack balance).
    fn pop_locals_for_loop_exit(&mut self) {
        let loop_depth = self.current_fn().loops.last().unwrap().scope_depth;
        let pops: Vec<bool> = self
            .current_fn()
            .locals
            .iter()
            .rev()
            .take_while(|l| matches!(l.depth, LocalSlot::Depth(d) if d > loop_depth))
            .map(|l| l.is_captured)
            .collect();
        for is_captured in pops {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    // ---- expressions -------------------------------------------------

    fn expression(&mut self) -> ParseResult {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> ParseResult {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(self.previous.kind, can_assign)?;

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign)?;
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
        Ok(())
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> ParseResult {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang | Tilde => self.unary(kind),
            Number => self.number(),
            String => self.string(),
            True | False | Nil => self.literal(kind),
            Identifier => {
                let name = self.previous.lexeme.clone();
                self.variable(&name, can_assign)
            }
            This => self.this_expr(),
            Super => self.super_expr(),
            LeftBracket => self.list_literal(),
            LeftBrace => self.brace_literal(),
            Def => self.anonymous_function(),
            _ => {
                self.error("Expect expression.");
                Err(())
            }
        }
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) -> ParseResult {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | Percent | StarStar | Amp | Pipe | Caret | LessLess
            | GreaterGreater | EqualEqual | BangEqual | Less | LessEqual | Greater
            | GreaterEqual => self.binary(kind),
            And => self.and_expr(),
            Or => self.or_expr(),
            Question => self.ternary(),
            LeftParen => self.call_expr(),
            Dot => self.dot_expr(can_assign),
            LeftBracket => self.subscript_expr(can_assign),
            Equal | PlusEqual | MinusEqual | StarEqual | SlashEqual | PercentEqual => {
                self.error("Invalid assignment target.");
                Err(())
            }
            _ => {
                self.error("Expect expression.");
                Err(())
            }
        }
    }

    fn grouping(&mut self) -> ParseResult {
        self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
        Ok(())
    }

    fn unary(&mut self, kind: TokenKind) -> ParseResult {
        self.parse_precedence(Precedence::Unary)?;
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self, kind: TokenKind) -> ParseResult {
        let prec = infix_precedence(kind);
        self.parse_precedence(prec.next())?;
        use TokenKind::*;
        match kind {
            Plus => self.emit_op(OpCode::Add),
            Minus => self.emit_op(OpCode::Subtract),
            Star => self.emit_op(OpCode::Multiply),
            Slash => self.emit_op(OpCode::Divide),
            Percent => self.emit_op(OpCode::Modulo),
            StarStar => self.emit_op(OpCode::Power),
            Amp => self.emit_op(OpCode::BitAnd),
            Pipe => self.emit_op(OpCode::BitOr),
            Caret => self.emit_op(OpCode::BitXor),
            LessLess => self.emit_op(OpCode::ShiftLeft),
            GreaterGreater => self.emit_op(OpCode::ShiftRight),
            EqualEqual => self.emit_op(OpCode::Equal),
            BangEqual => self.emit_op(OpCode::NotEqual),
            Less => self.emit_op(OpCode::Less),
            LessEqual => self.emit_op(OpCode::LessEqual),
            Greater => self.emit_op(OpCode::Greater),
            GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn and_expr(&mut self) -> ParseResult {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn or_expr(&mut self) -> ParseResult {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn ternary(&mut self) -> ParseResult {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment)?;
        let else_jump = self.emit_jump(OpCode::Jump);
        self.consume(TokenKind::Colon, "Expect ':' in ternary expression.");
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment)?;
        self.patch_jump(else_jump);
        Ok(())
    }

    fn number(&mut self) -> ParseResult {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::number(value));
        Ok(())
    }

    fn string(&mut self) -> ParseResult {
        let s = self.previous.lexeme.clone();
        let handle = self.interner.intern(self.heap, &s);
        self.emit_constant(Value::obj(handle));
        Ok(())
    }

    fn literal(&mut self, kind: TokenKind) -> ParseResult {
        match kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn anonymous_function(&mut self) -> ParseResult {
        self.function(FunctionType::Arrow, "<anonymous>")
    }

    fn variable(&mut self, name: &str, can_assign: bool) -> ParseResult {
        let func_index = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(func_index, name)? {
            self.variable_access(can_assign, OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(func_index, name)? {
            self.variable_access(can_assign, OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let slot = self.identifier_constant(name);
            self.variable_access(can_assign, OpCode::GetGlobal, OpCode::SetGlobal, slot)
        }
    }

    fn variable_access(
        &mut self,
        can_assign: bool,
        get_op: OpCode,
        set_op: OpCode,
        slot: u8,
    ) -> ParseResult {
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression()?;
            self.emit_two(set_op, slot);
        } else if can_assign && self.matches_compound_assign() {
            let compound_op = self.previous.kind;
            self.emit_two(get_op, slot);
            self.expression()?;
            self.emit_compound_op(compound_op);
            self.emit_two(set_op, slot);
        } else {
            self.emit_two(get_op, slot);
        }
        Ok(())
    }

    fn matches_compound_assign(&mut self) -> bool {
        use TokenKind::*;
        for kind in [PlusEqual, MinusEqual, StarEqual, SlashEqual, PercentEqual] {
            if self.matches(kind) {
                return true;
            }
        }
        false
    }

    fn emit_compound_op(&mut self, kind: TokenKind) {
        use TokenKind::*;
        match kind {
            PlusEqual => self.emit_op(OpCode::Add),
            MinusEqual => self.emit_op(OpCode::Subtract),
            StarEqual => self.emit_op(OpCode::Multiply),
            SlashEqual => self.emit_op(OpCode::Divide),
            PercentEqual => self.emit_op(OpCode::Modulo),
            _ => unreachable!(),
        }
    }

    fn this_expr(&mut self) -> ParseResult {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return Err(());
        }
        self.variable("this", false)
    }

    fn super_expr(&mut self) -> ParseResult {
        match self.classes.last() {
            None => {
                self.error("Can't use 'super' outside of a class.");
                return Err(());
            }
            Some(ctx) if !ctx.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
                return Err(());
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&method);

        self.variable("this", false)?;
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list()?;
            self.variable("super", false)?;
            self.emit_two(OpCode::SuperInvoke, name_const);
            self.emit_byte(argc);
        } else {
            self.variable("super", false)?;
            self.emit_two(OpCode::GetSuper, name_const);
        }
        Ok(())
    }

    fn call_expr(&mut self) -> ParseResult {
        let argc = self.argument_list()?;
        self.emit_two(OpCode::Call, argc);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, ()> {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression()?;
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        Ok(argc as u8)
    }

    fn dot_expr(&mut self, can_assign: bool) -> ParseResult {
        let is_private = self.matches(TokenKind::Private);
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.clone();
        let name_const = self.identifier_constant(&name);

        let (get_op, set_op) = if is_private {
            (OpCode::GetPrivateProperty, OpCode::SetPrivateProperty)
        } else {
            (OpCode::GetProperty, OpCode::SetProperty)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression()?;
            self.emit_two(set_op, name_const);
        } else if can_assign && self.matches_compound_assign() {
            let compound_op = self.previous.kind;
            self.emit_two(OpCode::GetPropertyNoPop, name_const);
            self.expression()?;
            self.emit_compound_op(compound_op);
            self.emit_two(set_op, name_const);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list()?;
            self.emit_two(OpCode::Invoke, name_const);
            self.emit_byte(argc);
        } else {
            self.emit_two(get_op, name_const);
        }
        Ok(())
    }

    fn subscript_expr(&mut self, can_assign: bool) -> ParseResult {
        let has_start = !self.check(TokenKind::Colon);
        if has_start {
            self.expression()?;
        } else {
            self.emit_op(OpCode::Nil);
        }

        if self.matches(TokenKind::Colon) {
            if !self.check(TokenKind::RightBracket) {
                self.expression()?;
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after slice.");
            self.emit_op(OpCode::SubscriptSlice);
            return Ok(());
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression()?;
            self.emit_op(OpCode::SubscriptSet);
        } else if can_assign && self.matches_compound_assign() {
            let compound_op = self.previous.kind;
            self.emit_op(OpCode::SubscriptGetNoPop);
            self.expression()?;
            self.emit_compound_op(compound_op);
            self.emit_op(OpCode::SubscriptSet);
        } else {
            self.emit_op(OpCode::SubscriptGet);
        }
        Ok(())
    }

    fn list_literal(&mut self) -> ParseResult {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression()?;
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        if count > 255 {
            self.error("Too many elements in list literal.");
        }
        self.emit_two(OpCode::BuildList, count as u8);
        Ok(())
    }

    /// Parses both dict (`{"a": 1}`) and set (`{1, 2}`) literals from a
    /// leading `{` in expression position. Disambiguated the same way
    /// `brace_statement` disambiguates block-vs-dict: an
    /// entry's key token is only ever a string or bare identifier, so one
    /// token of lookahead past it tells a dict entry from a set element.
    fn brace_literal(&mut self) -> ParseResult {
        if self.matches(TokenKind::RightBrace) {
            self.emit_two(OpCode::BuildDict, 0);
            return Ok(());
        }

        let first_is_dict_key = matches!(self.current.kind, TokenKind::String | TokenKind::Identifier)
            && self.scanner.peek_token().kind == TokenKind::Colon;

        if first_is_dict_key {
            let mut count: u16 = 0;
            loop {
                self.dict_key()?;
                self.consume(TokenKind::Colon, "Expect ':' after dict key.");
                self.expression()?;
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RightBrace, "Expect '}' after dict literal.");
            if count > 255 {
                self.error("Too many entries in dict literal.");
            }
            self.emit_two(OpCode::BuildDict, count as u8);
        } else {
            let mut count: u16 = 0;
            loop {
                self.expression()?;
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RightBrace, "Expect '}' after set literal.");
            if count > 255 {
                self.error("Too many elements in set literal.");
            }
            self.emit_two(OpCode::BuildSet, count as u8);
        }
        Ok(())
    }

    fn dict_key(&mut self) -> ParseResult {
        if self.check(TokenKind::String) {
            self.advance();
            self.string()
        } else {
            self.consume(TokenKind::Identifier, "Expect dict key.");
            let key = self.previous.lexeme.clone();
            let handle = self.interner.intern(self.heap, &key);
            self.emit_constant(Value::obj(handle));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::handle::Heap;
    use ember_core::interner::Interner;

    fn compile_ok(source: &str) -> (ObjFunction, Heap) {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let handle = Compiler::compile(source, "test", &mut heap, &mut interner)
            .unwrap_or_else(|errs| panic!("expected successful compile, got {errs:?}"));
        let function = match heap.get(handle) {
            Object::Function(f) => f.clone(),
            other => panic!("expected a function, got {other:?}"),
        };
        (function, heap)
    }

    fn compile_err(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        Compiler::compile(source, "test", &mut heap, &mut interner)
            .expect_err("expected a compile error")
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let (function, _heap) = compile_ok("1 + 2 * 3;");
        assert!(function.chunk.code.contains(&(OpCode::Add as u8)));
        assert!(function.chunk.code.contains(&(OpCode::Multiply as u8)));
        // Multiply must be emitted before Add: `2 * 3` is evaluated first.
        let mul_pos = function.chunk.code.iter().position(|&b| b == OpCode::Multiply as u8).unwrap();
        let add_pos = function.chunk.code.iter().position(|&b| b == OpCode::Add as u8).unwrap();
        assert!(mul_pos < add_pos);
    }

    #[test]
    fn var_declaration_emits_define_global_at_top_level() {
        let (function, _heap) = compile_ok("var x = 1;");
        assert!(function.chunk.code.contains(&(OpCode::DefineGlobal as u8)));
    }

    #[test]
    fn local_variables_use_slot_opcodes_not_globals() {
        let (function, _heap) = compile_ok("{ var x = 1; print x; }");
        assert!(!function.chunk.code.contains(&(OpCode::DefineGlobal as u8)));
        assert!(function.chunk.code.contains(&(OpCode::GetLocal as u8)));
    }

    #[test]
    fn function_declaration_compiles_to_a_closure_constant() {
        let (function, heap) = compile_ok("def add(a, b) { return a + b; }");
        assert!(function.chunk.code.contains(&(OpCode::Closure as u8)));
        let has_nested_function = function
            .chunk
            .constants
            .iter()
            .any(|v| v.is_obj() && matches!(heap.get(v.as_obj()), Object::Function(_)));
        assert!(has_nested_function, "expected the compiled `add` function as a constant");
    }

    #[test]
    fn optional_parameter_default_leaves_a_balanced_stack() {
        let (function, heap) = compile_ok("def greet(name = \"world\") { return name; }");
        let nested = function
            .chunk
            .constants
            .iter()
            .find_map(|v| {
                if v.is_obj() {
                    match heap.get(v.as_obj()) {
                        Object::Function(f) => Some(f.clone()),
                        _ => None,
                    }
                } else {
                    None
                }
            })
            .expect("expected the compiled `greet` function as a constant");
        assert_eq!(nested.arity, 0);
        assert_eq!(nested.arity_optional, 1);
        // GetLocal (read the slot to test) must precede the JumpIfFalse guard.
        let get_local_pos = nested.chunk.code.iter().position(|&b| b == OpCode::GetLocal as u8).unwrap();
        let jump_if_false_pos = nested.chunk.code.iter().position(|&b| b == OpCode::JumpIfFalse as u8).unwrap();
        assert!(get_local_pos < jump_if_false_pos);
        assert!(nested.chunk.code.contains(&(OpCode::SetLocal as u8)));
    }

    #[test]
    fn class_declaration_with_superclass_resolves_super_without_self_inheritance() {
        let errs_self_inherit = compile_err("class Oops < Oops {}");
        assert!(errs_self_inherit.iter().any(|e| e.message.contains("inherit from itself")));
    }

    #[test]
    fn undefined_break_outside_loop_is_a_compile_error() {
        let errs = compile_err("break;");
        assert!(!errs.is_empty());
    }

    #[test]
    fn brace_literal_with_colon_compiles_to_a_dict() {
        let (function, _heap) = compile_ok("var d = {\"a\": 1};");
        assert!(function.chunk.code.contains(&(OpCode::BuildDict as u8)));
    }

    #[test]
    fn bare_brace_statement_is_a_block_not_a_dict() {
        let (function, _heap) = compile_ok("{ print 1; }");
        assert!(!function.chunk.code.contains(&(OpCode::BuildDict as u8)));
    }

    #[test]
    fn set_literal_without_colon_is_not_a_dict() {
        let (function, _heap) = compile_ok("var s = {1, 2, 3};");
        assert!(function.chunk.code.contains(&(OpCode::BuildSet as u8)));
        assert!(!function.chunk.code.contains(&(OpCode::BuildDict as u8)));
    }
}
