//! Single-pass Pratt parser and bytecode emitter.
//!
//! There is no intermediate AST: every grammar rule emits bytecode directly
//! into the chunk of whichever function is currently being compiled. Nested
//! function bodies push a new [`FuncState`] onto `self.funcs`; the enclosing
//! state is simply the previous element, so upvalue resolution walks the
//! vector from the end instead of following an `enclosing` pointer.

use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};
use lox_core::Value;
use lox_runtime::{Chunk, Heap, ObjFunction, OpCode};
use std::ptr::NonNull;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, bool);

#[derive(Clone, Copy)]
struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn rule_for<'src>(kind: TokenKind) -> ParseRule<'src> {
    use TokenKind::*;
    let rule = |prefix, infix, precedence| ParseRule {
        prefix,
        infix,
        precedence,
    };
    match kind {
        LeftParen => rule(Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Dot => rule(None, Some(Compiler::dot), Precedence::Call),
        Minus => rule(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => rule(None, Some(Compiler::binary), Precedence::Term),
        Slash => rule(None, Some(Compiler::binary), Precedence::Factor),
        Star => rule(None, Some(Compiler::binary), Precedence::Factor),
        Bang => rule(Some(Compiler::unary), None, Precedence::None),
        BangEqual => rule(None, Some(Compiler::binary), Precedence::Equality),
        EqualEqual => rule(None, Some(Compiler::binary), Precedence::Equality),
        Greater => rule(None, Some(Compiler::binary), Precedence::Comparison),
        GreaterEqual => rule(None, Some(Compiler::binary), Precedence::Comparison),
        Less => rule(None, Some(Compiler::binary), Precedence::Comparison),
        LessEqual => rule(None, Some(Compiler::binary), Precedence::Comparison),
        Identifier => rule(Some(Compiler::variable), None, Precedence::None),
        String => rule(Some(Compiler::string), None, Precedence::None),
        Number => rule(Some(Compiler::number), None, Precedence::None),
        And => rule(None, Some(Compiler::and_), Precedence::And),
        Or => rule(None, Some(Compiler::or_), Precedence::Or),
        False | True | Nil => rule(Some(Compiler::literal), None, Precedence::None),
        This => rule(Some(Compiler::this_), None, Precedence::None),
        Super => rule(Some(Compiler::super_), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

struct Upvalue {
    index: u8,
    is_local: bool,
}

struct FuncState<'src> {
    function: NonNull<ObjFunction>,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'src> FuncState<'src> {
    fn new(function: NonNull<ObjFunction>, fn_type: FunctionType, synthetic_name: &'src str) -> Self {
        // Slot 0 is reserved: the receiver for methods/initializers, an
        // unnamed placeholder everywhere else. Depth 0 keeps it out of
        // reach of `resolve_local`'s "not yet initialized" check since it's
        // always already initialized.
        let receiver = Local {
            name: Token {
                kind: TokenKind::Identifier,
                lexeme: synthetic_name.as_bytes(),
                line: 0,
            },
            depth: 0,
            is_captured: false,
        };
        FuncState {
            function,
            fn_type,
            locals: vec![receiver],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    first_error: Option<CompileError>,
    funcs: Vec<FuncState<'src>>,
    classes: Vec<ClassState>,
    heap: &'src mut Heap,
    /// When set, a bare top-level expression statement that's the last
    /// thing in the source leaves its value on the stack instead of
    /// popping it, so the REPL can print it.
    repl: bool,
}

/// Compile `source` into a top-level script function. On success every
/// declared name has been resolved (local, upvalue, or global) and the
/// function's chunk ends in an implicit `nil; return`.
pub fn compile(source: &'_ str, heap: &mut Heap) -> Result<NonNull<ObjFunction>, CompileError> {
    // Safety-adjacent note: `heap` and `source` share no lifetime relation
    // requiring unsafe here; the borrow below is a plain reborrow for the
    // duration of the call.
    let mut compiler = Compiler::new(source, heap, false);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let (function, _upvalues) = compiler.end_function();
    if compiler.had_error {
        Err(compiler
            .first_error
            .unwrap_or(CompileError::Syntax("compilation failed".to_string())))
    } else {
        Ok(function)
    }
}

/// Compile one REPL line. Behaves like [`compile`], except a trailing bare
/// expression statement (e.g. `1 + 2;`) leaves its value on the stack
/// instead of discarding it; the returned `bool` says whether that
/// happened, so the caller knows whether the script's result is a real
/// value or the usual implicit `nil`.
pub fn compile_repl(
    source: &'_ str,
    heap: &mut Heap,
) -> Result<(NonNull<ObjFunction>, bool), CompileError> {
    let mut compiler = Compiler::new(source, heap, true);
    compiler.advance();
    let mut leaves_value = false;
    while !compiler.check(TokenKind::Eof) {
        leaves_value = compiler.top_level_declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let (function, _upvalues) = compiler.end_function_repl(leaves_value);
    if compiler.had_error {
        Err(compiler
            .first_error
            .unwrap_or(CompileError::Syntax("compilation failed".to_string())))
    } else {
        Ok((function, leaves_value))
    }
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str, heap: &'src mut Heap, repl: bool) -> Self {
        let function = heap.alloc_function(None);
        let dummy = Token {
            kind: TokenKind::Eof,
            lexeme: &[],
            line: 0,
        };
        Compiler {
            scanner: Scanner::new(source),
            current: dummy,
            previous: dummy,
            had_error: false,
            panic_mode: false,
            first_error: None,
            funcs: vec![FuncState::new(function, FunctionType::Script, "")],
            repl,
            classes: Vec::new(),
            heap,
        }
    }

    // == Token stream =========================================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme_str().to_string();
            self.error_at_current(CompileError::Syntax(message));
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
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
        self.error_at_current(CompileError::Syntax(message.to_string()));
    }

    // == Error reporting ======================================================

    fn error_at_current(&mut self, err: CompileError) {
        let token = self.current;
        self.error_at(token, err);
    }

    fn error(&mut self, err: CompileError) {
        let token = self.previous;
        self.error_at(token, err);
    }

    fn error_at(&mut self, token: Token<'src>, err: CompileError) {
        self.had_error = true;
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme_str()),
        };
        eprintln!("[line {}] Error{}: {}", token.line, location, err);
        tracing::debug!(line = token.line, %err, "compile error");
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    /// Panic-mode recovery: discard tokens until a likely statement
    /// boundary so one syntax error doesn't cascade into a wall of
    /// follow-on diagnostics.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // == Emission helpers =====================================================

    fn current_chunk(&mut self) -> &mut Chunk {
        let function = self.funcs.last().unwrap().function;
        unsafe { &mut (*function.as_ptr()).chunk }
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk().write_op(op, line);
    }

    fn emit_bytes(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error(CompileError::JumpTooLarge);
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.current_chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.current_chunk().patch_jump(offset).is_err() {
            self.error(CompileError::JumpTooLarge);
        }
    }

    fn emit_return(&mut self) {
        if self.funcs.last().unwrap().fn_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let idx = self.current_chunk().add_constant_deduped(value);
        if idx > u8::MAX as usize {
            self.error(CompileError::TooManyConstants);
            return 0;
        }
        idx as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_bytes(OpCode::Constant, idx);
    }

    fn identifier_constant(&mut self, name: &[u8]) -> u8 {
        let ptr = self.heap.copy_string(name);
        self.make_constant(Value::object(ptr.cast()))
    }

    // == Scopes ===============================================================

    fn begin_scope(&mut self) {
        self.funcs.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let func = self.funcs.last_mut().unwrap();
        func.scope_depth -= 1;
        let depth = func.scope_depth;
        loop {
            let should_close = match self.funcs.last().unwrap().locals.last() {
                Some(local) if local.depth > depth => Some(local.is_captured),
                _ => None,
            };
            match should_close {
                Some(true) => self.emit_op(OpCode::CloseUpvalue),
                Some(false) => self.emit_op(OpCode::Pop),
                None => break,
            }
            self.funcs.last_mut().unwrap().locals.pop();
        }
    }

    // == Variables ============================================================

    fn declare_variable(&mut self) {
        if self.funcs.last().unwrap().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let func = self.funcs.last().unwrap();
        let depth = func.scope_depth;
        for local in func.locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                self.error(CompileError::DuplicateLocal(name.lexeme_str().to_string()));
                return;
            }
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: Token<'src>) {
        let func = self.funcs.last_mut().unwrap();
        if func.locals.len() >= MAX_LOCALS {
            self.error(CompileError::TooManyLocals);
            return;
        }
        func.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let func = self.funcs.last_mut().unwrap();
        if func.scope_depth == 0 {
            return;
        }
        let depth = func.scope_depth;
        func.locals.last_mut().unwrap().depth = depth;
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.funcs.last().unwrap().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn define_variable(&mut self, global: u8) {
        if self.funcs.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, depth_from_top: usize, name: &[u8]) -> Option<u8> {
        let func = &self.funcs[self.funcs.len() - 1 - depth_from_top];
        for (i, local) in func.locals.iter().enumerate().rev() {
            if local.name.lexeme == name {
                if local.depth == -1 {
                    self.error(CompileError::ReadLocalInOwnInitializer(
                        String::from_utf8_lossy(name).to_string(),
                    ));
                }
                return Some(i as u8);
            }
        }
        None
    }

    /// Walk the enclosing-function chain looking for `name` as a local,
    /// threading an upvalue entry through every intermediate compiler.
    /// `depth_from_top` is how many frames up from the currently compiling
    /// function we're searching (0 = the function itself).
    fn resolve_upvalue(&mut self, depth_from_top: usize, name: &[u8]) -> Option<u8> {
        if depth_from_top + 1 >= self.funcs.len() {
            return None; // no enclosing function: this is the script
        }
        if let Some(local_slot) = self.resolve_local(depth_from_top + 1, name) {
            let idx = self.funcs.len() - 1 - (depth_from_top + 1);
            self.funcs[idx].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(depth_from_top, local_slot, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(depth_from_top + 1, name) {
            return Some(self.add_upvalue(depth_from_top, upvalue_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, depth_from_top: usize, index: u8, is_local: bool) -> u8 {
        let func_idx = self.funcs.len() - 1 - depth_from_top;
        let func = &mut self.funcs[func_idx];
        for (i, up) in func.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if func.upvalues.len() >= MAX_UPVALUES {
            self.error(CompileError::TooManyUpvalues);
            return 0;
        }
        func.upvalues.push(Upvalue { index, is_local });
        unsafe {
            (*func.function.as_ptr()).upvalue_count = func.upvalues.len();
        }
        (func.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &[u8], can_assign: bool) {
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(0, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(0, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    // == Declarations =========================================================

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    /// Top-level dispatch used only by [`compile_repl`]. Identical to
    /// [`Self::declaration`] except a bare expression statement that turns
    /// out to be the last thing in the source leaves its value on the stack
    /// rather than popping it. Only intercepts at this outer level — an
    /// expression statement nested inside `if`/`while`/`for`/a block still
    /// goes through the ordinary pop-discipline in [`Self::statement`], so
    /// every statement keeps its normal zero net stack effect there.
    fn top_level_declaration(&mut self) -> bool {
        let mut leaves_value = false;
        if self.repl && self.starts_bare_expression() {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
            if self.check(TokenKind::Eof) {
                leaves_value = true;
            } else {
                self.emit_op(OpCode::Pop);
            }
        } else {
            self.declaration();
        }
        if self.panic_mode {
            self.synchronize();
        }
        leaves_value
    }

    /// True when the current token cannot start a declaration or a
    /// statement other than an expression statement — i.e. `statement`
    /// would fall through to `expression_statement` for it.
    fn starts_bare_expression(&self) -> bool {
        !matches!(
            self.current.kind,
            TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::While
                | TokenKind::LeftBrace
        )
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable();
        self.emit_bytes(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme;
            self.variable(false);
            if super_name == name_token.lexeme {
                self.error(CompileError::Syntax(
                    "A class can't inherit from itself.".to_string(),
                ));
            }
            self.begin_scope();
            self.add_local(Token {
                kind: TokenKind::Identifier,
                lexeme: b"super",
                line: name_token.line,
            });
            self.define_variable(0);
            self.named_variable(name_token.lexeme, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name_token.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // the class itself, left by `named_variable` above

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);
        let fn_type = if name == b"init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_bytes(OpCode::Method, constant);
    }

    fn function(&mut self, fn_type: FunctionType) {
        let name_ptr = self.heap.copy_string(self.previous.lexeme);
        let function = self.heap.alloc_function(Some(name_ptr));
        let receiver_name = if fn_type == FunctionType::Function { "" } else { "this" };
        self.funcs.push(FuncState::new(function, fn_type, receiver_name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function_ptr = self.funcs.last().unwrap().function;
                unsafe {
                    let arity = (*function_ptr.as_ptr()).arity + 1;
                    if arity > 255 {
                        self.error_at_current(CompileError::Syntax(
                            "Can't have more than 255 parameters.".to_string(),
                        ));
                    }
                    (*function_ptr.as_ptr()).arity = arity;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (compiled, upvalues) = self.end_function();
        let func_idx = self.make_constant(Value::object(compiled.cast()));
        self.emit_bytes(OpCode::Closure, func_idx);
        for up in &upvalues {
            self.emit_byte(up.is_local as u8);
            self.emit_byte(up.index);
        }
    }

    /// Pops the finished `FuncState`, emitting the implicit return first.
    /// Returns the compiled function alongside its resolved upvalue list so
    /// the caller can emit `closure` operands into the *enclosing* chunk.
    fn end_function(&mut self) -> (NonNull<ObjFunction>, Vec<Upvalue>) {
        self.emit_return();
        let func = self.funcs.pop().unwrap();
        (func.function, func.upvalues)
    }

    /// Like [`Self::end_function`], but for [`compile_repl`]'s top-level
    /// function: when `leaves_value` is set, the script's last statement
    /// already left its result on the stack, so `Return` must not be
    /// preceded by the usual implicit `nil`.
    fn end_function_repl(&mut self, leaves_value: bool) -> (NonNull<ObjFunction>, Vec<Upvalue>) {
        if leaves_value {
            self.emit_op(OpCode::Return);
        } else {
            self.emit_return();
        }
        let func = self.funcs.pop().unwrap();
        (func.function, func.upvalues)
    }

    // == Statements ===========================================================

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.funcs.last().unwrap().fn_type == FunctionType::Script {
            self.error(CompileError::ReturnAtTopLevel);
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.funcs.last().unwrap().fn_type == FunctionType::Initializer {
                self.error(CompileError::ReturnValueFromInitializer);
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // == Expressions ==========================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            self.error(CompileError::Syntax("Expect expression.".to_string()));
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule_for(self.current.kind).precedence {
            self.advance();
            let infix = rule_for(self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error(CompileError::InvalidAssignmentTarget);
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let text = self.previous.lexeme_str();
        let value: f64 = text.parse().expect("scanner guarantees a valid number lexeme");
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let bytes = &raw[1..raw.len() - 1]; // strip surrounding quotes
        let ptr = self.heap.copy_string(bytes);
        self.emit_constant(Value::object(ptr.cast()));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("rule_for only routes literal kinds here"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("rule_for only routes unary kinds here"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let kind = self.previous.kind;
        let rule = rule_for(kind);
        self.parse_precedence(rule.precedence.next());
        match kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("rule_for only routes binary kinds here"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_bytes(OpCode::Invoke, name);
            self.emit_byte(argc);
        } else {
            self.emit_bytes(OpCode::GetProperty, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error(CompileError::Syntax("Can't have more than 255 arguments.".to_string()));
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error(CompileError::UnresolvedThis);
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error(CompileError::UnresolvedSuper);
        } else if !self.classes.last().unwrap().has_superclass {
            self.error(CompileError::Syntax(
                "Can't use 'super' in a class with no superclass.".to_string(),
            ));
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method = self.identifier_constant(self.previous.lexeme);

        self.named_variable(b"this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(b"super", false);
            self.emit_bytes(OpCode::SuperInvoke, method);
            self.emit_byte(argc);
        } else {
            self.named_variable(b"super", false);
            self.emit_bytes(OpCode::GetSuper, method);
        }
    }
}
