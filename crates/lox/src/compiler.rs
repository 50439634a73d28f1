//! A single-pass Pratt compiler: tokens are consumed one at a time and
//! bytecode is emitted directly as each construct is recognized. There is no
//! intermediate AST — by the time a statement finishes parsing, its
//! instructions already live in the current function's [`Chunk`].

use std::collections::HashMap;

use crate::chunk::ChunkBuilder;
use crate::error::Diagnostic;
use crate::heap::{FunctionObj, Heap, HeapData, HeapId};
use crate::lexer::{Lexer, Token, TokenKind, unescape};
use crate::op::Opcode;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    /// `-1` while the variable's own initializer is still being compiled.
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

#[derive(Debug, Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
    is_const: bool,
}

#[derive(Debug, Clone, Copy)]
struct ClassCtx {
    has_superclass: bool,
}

#[derive(Debug)]
struct LoopCtx {
    continue_target: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

#[derive(Debug)]
struct Frame {
    builder: ChunkBuilder,
    kind: FunctionKind,
    name: Option<HeapId>,
    arity: u8,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl Frame {
    fn new(kind: FunctionKind, name: Option<HeapId>) -> Self {
        // A call through `call_closure` leaves the callee itself sitting at
        // `slot_base + 0` on the stack, so a non-script frame must reserve
        // that slot to keep local-slot numbering aligned with the arguments,
        // which start at `slot_base + 1`. A method/initializer names that
        // reserved slot `this`; a plain function leaves it unnamed and
        // unreachable. The top-level script is never called through
        // `call_closure` (its frame is built directly in `Vm::interpret`),
        // so it reserves nothing and gets the full 256 slots for user locals.
        let locals = match kind {
            FunctionKind::Script => Vec::new(),
            FunctionKind::Function => {
                vec![Local { name: String::new(), depth: 0, is_captured: false, is_const: true }]
            }
            FunctionKind::Method | FunctionKind::Initializer => {
                vec![Local { name: "this".to_string(), depth: 0, is_captured: false, is_const: true }]
            }
        };
        Self { builder: ChunkBuilder::new(), kind, name, arity: 0, locals, upvalues: Vec::new(), scope_depth: 0 }
    }
}

pub struct Compiler<'src, 'h> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
    frames: Vec<Frame>,
    class_stack: Vec<ClassCtx>,
    loop_stack: Vec<LoopCtx>,
    global_kinds: HashMap<String, bool>,
    heap: &'h mut Heap,
}

/// Compiles `source` into a top-level script [`FunctionObj`], allocated onto
/// `heap` along with every string literal and nested function it contains.
pub fn compile(source: &str, heap: &mut Heap) -> Result<HeapId, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let script = compiler.end_script();
    if compiler.diagnostics.is_empty() { Ok(script) } else { Err(compiler.diagnostics) }
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 1 };
        Self {
            lexer: Lexer::new(source),
            previous: dummy,
            current: dummy,
            diagnostics: Vec::new(),
            panic_mode: false,
            frames: vec![Frame::new(FunctionKind::Script, None)],
            class_stack: Vec::new(),
            loop_stack: Vec::new(),
            global_kinds: HashMap::new(),
            heap,
        }
    }

    // ---- token stream plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.scan();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
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
        } else {
            self.error_at_current(message);
        }
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.error_at_line(line, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at_line(line, message);
    }

    fn error_at_line(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics.push(Diagnostic { line, message: message.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Echo
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Switch => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- frame/emission helpers -------------------------------------------------

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("compiler always has an active frame")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("compiler always has an active frame")
    }

    fn emit(&mut self, op: Opcode, line: u32) {
        self.current_frame_mut().builder.emit(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.current_frame_mut().builder.emit_byte(byte, line);
    }

    fn emit_jump(&mut self, op: Opcode, line: u32) -> usize {
        self.current_frame_mut().builder.emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.current_frame_mut().builder.patch_jump(offset) {
            self.error(&message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) {
        if let Err(message) = self.current_frame_mut().builder.emit_loop(loop_start, line) {
            self.error(&message);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.heap.intern_string(name);
        let idx = self.current_frame_mut().builder.chunk.add_constant(Value::Obj(id));
        u8::try_from(idx).unwrap_or_else(|_| {
            self.error("Too many constants in one chunk.");
            0
        })
    }

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_frame_mut().scope_depth -= 1;
        let line = self.previous.line;
        let depth = self.current_frame().scope_depth;
        while self.current_frame().locals.last().is_some_and(|l| l.depth > depth) {
            let captured = self.current_frame().locals.last().expect("checked above").is_captured;
            self.emit(if captured { Opcode::CloseUpvalue } else { Opcode::Pop }, line);
            self.current_frame_mut().locals.pop();
        }
    }

    /// Emits cleanup for a `break`/`continue` jump without actually popping
    /// the compiler's own local bookkeeping — the loop body is still being
    /// compiled, just this particular control path is leaving it early.
    fn emit_discard_locals_since(&mut self, depth: i32) {
        let line = self.previous.line;
        let captured_flags: Vec<bool> = self
            .current_frame()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > depth)
            .map(|l| l.is_captured)
            .collect();
        for captured in captured_flags {
            self.emit(if captured { Opcode::CloseUpvalue } else { Opcode::Pop }, line);
        }
    }

    // ---- variable resolution -------------------------------------------------

    fn resolve_local(&mut self, frame_idx: usize, name: &str) -> Option<(u8, bool)> {
        let frame = &self.frames[frame_idx];
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some((i as u8, local.is_const));
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<(u8, bool)> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing = frame_idx - 1;
        if let Some((slot, is_const)) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, slot, true, is_const));
        }
        if let Some((idx, is_const)) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_idx, idx, false, is_const));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool, is_const: bool) -> (u8, bool) {
        if let Some(i) =
            self.frames[frame_idx].upvalues.iter().position(|uv| uv.index == index && uv.is_local == is_local)
        {
            return (i as u8, self.frames[frame_idx].upvalues[i].is_const);
        }
        if self.frames[frame_idx].upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return (0, is_const);
        }
        self.frames[frame_idx].upvalues.push(UpvalueDesc { index, is_local, is_const });
        let idx = u8::try_from(self.frames[frame_idx].upvalues.len() - 1).unwrap_or(255);
        (idx, is_const)
    }

    fn declare_variable(&mut self, name: &str, is_const: bool) -> Option<u8> {
        if self.current_frame().scope_depth == 0 {
            if let Some(&existing_const) = self.global_kinds.get(name) {
                if existing_const && is_const {
                    self.error(&format!("Global constant '{name}' is already declared."));
                } else if existing_const != is_const {
                    self.error(&format!(
                        "Cannot redeclare '{name}' with different mutability than its existing declaration."
                    ));
                }
            }
            self.global_kinds.insert(name.to_string(), is_const);
            Some(self.identifier_constant(name))
        } else {
            let depth = self.current_frame().scope_depth;
            for local in self.current_frame().locals.iter().rev() {
                if local.depth != -1 && local.depth < depth {
                    break;
                }
                if local.name == name {
                    self.error(&format!("Already a variable named '{name}' in this scope."));
                    break;
                }
            }
            if self.current_frame().locals.len() >= 256 {
                self.error("Too many local variables in function.");
                return None;
            }
            self.current_frame_mut().locals.push(Local {
                name: name.to_string(),
                depth: -1,
                is_captured: false,
                is_const,
            });
            None
        }
    }

    fn mark_initialized(&mut self) {
        let depth = self.current_frame().scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.current_frame_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global_slot: Option<u8>, is_const: bool, line: u32) {
        if let Some(idx) = global_slot {
            self.emit(if is_const { Opcode::DefineGlobalConst } else { Opcode::DefineGlobal }, line);
            self.emit_byte(idx, line);
        } else {
            self.mark_initialized();
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let line = self.previous.line;
        let frame_idx = self.frames.len() - 1;
        let (get_op, set_op, arg, is_const) = if let Some((slot, is_const)) = self.resolve_local(frame_idx, name) {
            (Opcode::GetLocal, Opcode::SetLocal, slot, is_const)
        } else if let Some((idx, is_const)) = self.resolve_upvalue(frame_idx, name) {
            (Opcode::GetUpvalue, Opcode::SetUpvalue, idx, is_const)
        } else {
            let idx = self.identifier_constant(name);
            let is_const = self.global_kinds.get(name).copied().unwrap_or(false);
            (Opcode::GetGlobal, Opcode::SetGlobal, idx, is_const)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            if is_const {
                self.error(&format!("Cannot assign to const variable '{name}'."));
            }
            self.expression();
            self.emit(set_op, line);
            self.emit_byte(arg, line);
        } else {
            self.emit(get_op, line);
            self.emit_byte(arg, line);
        }
    }

    // ---- functions, methods, classes -------------------------------------------------

    fn function(&mut self, kind: FunctionKind, name: Option<&str>) {
        let name_id = name.map(|n| self.heap.intern_string(n));
        self.frames.push(Frame::new(kind, name_id));
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current_frame().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.current_frame_mut().arity += 1;
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let pname = self.previous.lexeme.to_string();
                self.declare_variable(&pname, false);
                self.mark_initialized();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.end_function();
    }

    fn end_function(&mut self) {
        let frame = self.frames.pop().expect("function frame pushed by caller");
        let line = self.previous.line;
        let mut builder = frame.builder;
        if frame.kind == FunctionKind::Initializer {
            builder.emit(Opcode::GetLocal, line);
            builder.emit_byte(0, line);
        } else {
            builder.emit(Opcode::Nil, line);
        }
        builder.emit(Opcode::Return, line);
        let function_obj = FunctionObj {
            name: frame.name,
            arity: frame.arity,
            upvalue_count: u8::try_from(frame.upvalues.len()).unwrap_or(255),
            chunk: builder.chunk,
        };
        let fn_id = self.heap.alloc_raw(HeapData::Function(function_obj));
        let upvalues = frame.upvalues;
        let const_idx = {
            let outer = self.current_frame_mut();
            u8::try_from(outer.builder.chunk.add_constant(Value::Obj(fn_id))).unwrap_or(0)
        };
        self.emit(Opcode::Closure, line);
        self.emit_byte(const_idx, line);
        for uv in upvalues {
            self.emit_byte(u8::from(uv.is_local), line);
            self.emit_byte(uv.index, line);
        }
    }

    fn end_script(&mut self) -> HeapId {
        let frame = self.frames.pop().expect("script frame");
        let line = self.previous.line;
        let mut builder = frame.builder;
        builder.emit(Opcode::Nil, line);
        builder.emit(Opcode::Return, line);
        let function_obj = FunctionObj { name: None, arity: 0, upvalue_count: 0, chunk: builder.chunk };
        self.heap.alloc_raw(HeapData::Function(function_obj))
    }

    fn method(&mut self) {
        self.match_token(TokenKind::Fun);
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let name_const = self.identifier_constant(&name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, Some(&name));
        self.emit(Opcode::Method, line);
        self.emit_byte(name_const, line);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let global_slot = self.declare_variable(&name, false);
        if global_slot.is_none() {
            self.mark_initialized();
        }
        self.function(FunctionKind::Function, Some(&name));
        self.define_variable(global_slot, false, line);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let name_const = self.identifier_constant(&class_name);
        let global_slot = self.declare_variable(&class_name, false);
        self.emit(Opcode::Class, line);
        self.emit_byte(name_const, line);
        self.define_variable(global_slot, false, line);

        let has_superclass = if self.match_token(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_string();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&super_name, false);
            self.begin_scope();
            let depth = self.current_frame().scope_depth;
            self.current_frame_mut().locals.push(Local {
                name: "super".to_string(),
                depth,
                is_captured: false,
                is_const: true,
            });
            self.named_variable(&class_name, false);
            self.emit(Opcode::Inherit, line);
            true
        } else {
            false
        };

        self.class_stack.push(ClassCtx { has_superclass });
        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(Opcode::Pop, line);

        if has_superclass {
            self.end_scope();
        }
        self.class_stack.pop();
    }

    // ---- statements -------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Const) {
            self.const_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect variable name.");
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let global_slot = self.declare_variable(&name, false);
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(Opcode::Nil, line);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global_slot, false, line);
    }

    fn const_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect constant name.");
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let global_slot = self.declare_variable(&name, true);
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.error("A const declaration must have an initializer.");
            self.emit(Opcode::Nil, line);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after constant declaration.");
        self.define_variable(global_slot, true, line);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Echo) || self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
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
        let line = self.previous.line;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(Opcode::Print, line);
    }

    fn expression_statement(&mut self) {
        self.expression();
        let line = self.previous.line;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(Opcode::Pop, line);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let line = self.previous.line;
        let then_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit(Opcode::Pop, line);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump, line);
        self.patch_jump(then_jump);
        self.emit(Opcode::Pop, line);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_frame().builder.chunk.code.len();
        self.loop_stack.push(LoopCtx {
            continue_target: loop_start,
            scope_depth: self.current_frame().scope_depth,
            break_jumps: Vec::new(),
        });
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let line = self.previous.line;
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit(Opcode::Pop, line);
        self.statement();
        self.emit_loop(loop_start, line);
        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop, line);
        let ctx = self.loop_stack.pop().expect("pushed above");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
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

        let mut loop_start = self.current_frame().builder.chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            let line = self.previous.line;
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse, line));
            self.emit(Opcode::Pop, line);
        }

        if !self.match_token(TokenKind::RightParen) {
            let line = self.previous.line;
            let body_jump = self.emit_jump(Opcode::Jump, line);
            let increment_start = self.current_frame().builder.chunk.code.len();
            self.expression();
            let line = self.previous.line;
            self.emit(Opcode::Pop, line);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start, line);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.loop_stack.push(LoopCtx {
            continue_target: loop_start,
            scope_depth: self.current_frame().scope_depth,
            break_jumps: Vec::new(),
        });
        self.statement();
        let line = self.previous.line;
        self.emit_loop(loop_start, line);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Opcode::Pop, line);
        }
        let ctx = self.loop_stack.pop().expect("pushed above");
        for jump in ctx.break_jumps {
            self.patch_jump(jump);
        }
        self.end_scope();
    }

    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps = Vec::new();
        let mut pending_false_jump: Option<usize> = None;

        loop {
            let line = self.previous.line;
            if let Some(nj) = pending_false_jump.take() {
                self.patch_jump(nj);
                self.emit(Opcode::Pop, line);
            }
            if self.match_token(TokenKind::Default) {
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                self.emit(Opcode::Pop, line);
                self.begin_scope();
                while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
                    self.declaration();
                }
                self.end_scope();
                break;
            } else if self.match_token(TokenKind::Case) {
                self.emit(Opcode::Dup, line);
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");
                self.emit(Opcode::Equal, line);
                let nj = self.emit_jump(Opcode::JumpIfFalse, line);
                self.emit(Opcode::Pop, line);
                self.emit(Opcode::Pop, line);
                self.begin_scope();
                while !self.check(TokenKind::Case)
                    && !self.check(TokenKind::Default)
                    && !self.check(TokenKind::RightBrace)
                    && !self.check(TokenKind::Eof)
                {
                    self.declaration();
                }
                self.end_scope();
                let ej = self.emit_jump(Opcode::Jump, line);
                end_jumps.push(ej);
                pending_false_jump = Some(nj);
            } else {
                break;
            }
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");
        let line = self.previous.line;
        if let Some(nj) = pending_false_jump.take() {
            self.patch_jump(nj);
            self.emit(Opcode::Pop, line);
            self.emit(Opcode::Pop, line);
        }
        for ej in end_jumps {
            self.patch_jump(ej);
        }
    }

    fn return_statement(&mut self) {
        if self.current_frame().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        let line = self.previous.line;
        if self.match_token(TokenKind::Semicolon) {
            if self.current_frame().kind == FunctionKind::Initializer {
                self.emit(Opcode::GetLocal, line);
                self.emit_byte(0, line);
            } else {
                self.emit(Opcode::Nil, line);
            }
        } else {
            if self.current_frame().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        }
        self.emit(Opcode::Return, line);
    }

    fn continue_statement(&mut self) {
        let line = self.previous.line;
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        let Some(ctx_depth_target) = self.loop_stack.last().map(|c| (c.scope_depth, c.continue_target)) else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        let (scope_depth, target) = ctx_depth_target;
        self.emit_discard_locals_since(scope_depth);
        self.emit_loop(target, line);
    }

    fn break_statement(&mut self) {
        let line = self.previous.line;
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let Some(scope_depth) = self.loop_stack.last().map(|c| c.scope_depth) else {
            self.error("Can't use 'break' outside of a loop.");
            return;
        };
        self.emit_discard_locals_since(scope_depth);
        let jump = self.emit_jump(Opcode::Jump, line);
        self.loop_stack.last_mut().expect("checked above").break_jumps.push(jump);
    }

    // ---- expressions (Pratt parser) -------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, min_prec: Precedence) {
        self.advance();
        let can_assign = min_prec <= Precedence::Assignment;
        if !self.parse_prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while min_prec <= self.precedence_of(self.current.kind) {
            self.advance();
            self.parse_infix(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn precedence_of(&self, kind: TokenKind) -> Precedence {
        match kind {
            TokenKind::Or => Precedence::Or,
            TokenKind::And => Precedence::And,
            TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
            TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
                Precedence::Comparison
            }
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::Star | TokenKind::Slash => Precedence::Factor,
            TokenKind::LeftParen | TokenKind::Dot | TokenKind::LeftBracket => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn parse_prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => {
                self.expression();
                self.consume(TokenKind::RightParen, "Expect ')' after expression.");
            }
            TokenKind::LeftBracket => self.list_literal(),
            TokenKind::LeftBrace => self.map_literal(),
            TokenKind::Minus | TokenKind::Bang | TokenKind::Not => self.unary(),
            TokenKind::Int => self.int_literal(),
            TokenKind::Number => self.number_literal(),
            TokenKind::String => self.string_literal(),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => {
                let name = self.previous.lexeme.to_string();
                self.named_variable(&name, can_assign);
            }
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn parse_infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Minus
            | TokenKind::Plus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => self.binary(kind),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::Dot => self.dot_expr(can_assign),
            TokenKind::LeftBracket => self.index_expr(can_assign),
            _ => {}
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        let line = self.previous.line;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit(Opcode::Negate, line),
            TokenKind::Bang | TokenKind::Not => self.emit(Opcode::Not, line),
            _ => unreachable!("unary() only dispatched for unary operator tokens"),
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        let line = self.previous.line;
        let prec = self.precedence_of(operator);
        self.parse_precedence(prec.next());
        match operator {
            TokenKind::Plus => self.emit(Opcode::Add, line),
            TokenKind::Minus => self.emit(Opcode::Subtract, line),
            TokenKind::Star => self.emit(Opcode::Multiply, line),
            TokenKind::Slash => self.emit(Opcode::Divide, line),
            TokenKind::EqualEqual => self.emit(Opcode::Equal, line),
            TokenKind::BangEqual => {
                self.emit(Opcode::Equal, line);
                self.emit(Opcode::Not, line);
            }
            TokenKind::Less => self.emit(Opcode::Less, line),
            TokenKind::LessEqual => {
                self.emit(Opcode::Greater, line);
                self.emit(Opcode::Not, line);
            }
            TokenKind::Greater => self.emit(Opcode::Greater, line),
            TokenKind::GreaterEqual => {
                self.emit(Opcode::Less, line);
                self.emit(Opcode::Not, line);
            }
            _ => unreachable!("binary() only dispatched for binary operator tokens"),
        }
    }

    fn and_expr(&mut self) {
        let line = self.previous.line;
        let end_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit(Opcode::Pop, line);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let line = self.previous.line;
        let else_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        let end_jump = self.emit_jump(Opcode::Jump, line);
        self.patch_jump(else_jump);
        self.emit(Opcode::Pop, line);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call_expr(&mut self) {
        let line = self.previous.line;
        let argc = self.argument_list();
        self.emit(Opcode::Call, line);
        self.emit_byte(argc, line);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let name_const = self.identifier_constant(&name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(Opcode::SetProperty, line);
            self.emit_byte(name_const, line);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit(Opcode::Invoke, line);
            self.emit_byte(name_const, line);
            self.emit_byte(argc, line);
        } else {
            self.emit(Opcode::GetProperty, line);
            self.emit_byte(name_const, line);
        }
    }

    fn index_expr(&mut self, can_assign: bool) {
        let line = self.previous.line;
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(Opcode::IndexSet, line);
        } else {
            self.emit(Opcode::IndexGet, line);
        }
    }

    fn list_literal(&mut self) {
        let line = self.previous.line;
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 elements in a list literal.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        self.emit(Opcode::BuildList, line);
        self.emit_byte(count as u8, line);
    }

    fn map_literal(&mut self) {
        let line = self.previous.line;
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after map key.");
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 entries in a map literal.");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after map entries.");
        self.emit(Opcode::BuildMap, line);
        self.emit_byte(count as u8, line);
    }

    fn this_expr(&mut self) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'this' outside of a class.");
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        if self.class_stack.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.class_stack.last().expect("checked above").has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_string();
        let line = self.previous.line;
        let name_const = self.identifier_constant(&name);
        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit(Opcode::SuperInvoke, line);
            self.emit_byte(name_const, line);
            self.emit_byte(argc, line);
        } else {
            self.named_variable("super", false);
            self.emit(Opcode::GetSuper, line);
            self.emit_byte(name_const, line);
        }
    }

    fn literal(&mut self) {
        let line = self.previous.line;
        match self.previous.kind {
            TokenKind::Nil => self.emit(Opcode::Nil, line),
            TokenKind::True => self.emit(Opcode::True, line),
            TokenKind::False => self.emit(Opcode::False, line),
            _ => unreachable!("literal() only dispatched for nil/true/false"),
        }
    }

    fn int_literal(&mut self) {
        let line = self.previous.line;
        let value: i64 = self.previous.lexeme.parse().unwrap_or(0);
        self.current_frame_mut().builder.emit_constant(Value::Int(value), line, Opcode::Constant, Opcode::ConstantLong);
    }

    fn number_literal(&mut self) {
        let line = self.previous.line;
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.current_frame_mut().builder.emit_constant(
            Value::Number(value),
            line,
            Opcode::Constant,
            Opcode::ConstantLong,
        );
    }

    fn string_literal(&mut self) {
        let line = self.previous.line;
        let lexeme = self.previous.lexeme;
        let body = &lexeme[1..lexeme.len() - 1];
        let unescaped = unescape(body);
        let id = self.heap.intern_string(&unescaped);
        self.current_frame_mut().builder.emit_constant(
            Value::Obj(id),
            line,
            Opcode::Constant,
            Opcode::ConstantLong,
        );
    }
}
