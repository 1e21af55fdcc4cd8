//! Single-pass Pratt compiler
//!
//! Parses the token stream and emits bytecode directly into the function
//! being compiled — no AST. A stack of [`FrameCompiler`]s mirrors the
//! nesting of function declarations; each frame tracks its locals, its
//! captured upvalues, and its scope depth so that variable references
//! resolve (local, then enclosing-function capture, then global) at the
//! moment they are parsed.
//!
//! Operands are one byte wherever they fit; emission switches to the WIDE
//! prefix form (two-byte big-endian operand) whenever a constant, local
//! slot, or build count needs it.

use quill_core::object::{FunctionData, Obj};
use quill_core::{Chunk, Heap, ObjId, OpCode, Table, Value};

use crate::scanner::{Scanner, Token, TokenKind};

const MAX_LOCALS: usize = 65536;
const MAX_UPVALUES: usize = 256;
/// Build counts are 16-bit operands, so a display holds at most 65535
/// items; one past that must be rejected, not wrapped.
const MAX_DISPLAY_ITEMS: usize = 65535;

/// Compile a source string into a script function owned by `heap`.
///
/// `globals` is the VM's global table, marked as a GC root if a collection
/// triggers mid-compile. Returns `None` if any compile error was reported.
pub fn compile(source: &str, heap: &mut Heap, globals: &Table) -> Option<ObjId> {
    let mut compiler = Compiler::new(source, heap, globals);
    compiler.run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // = += -= *= /= %= **=
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Power,      // ** (right associative)
    Call,       // ()
    Subscript,  // [] .
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
            Precedence::Unary => Precedence::Power,
            Precedence::Power => Precedence::Call,
            Precedence::Call => Precedence::Subscript,
            Precedence::Subscript | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

struct ParseRule<'src, 'vm> {
    prefix: Option<ParseFn<'src, 'vm>>,
    infix: Option<ParseFn<'src, 'vm>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Script,
}

#[derive(Debug, Clone, Copy)]
struct Local {
    name: Token,
    /// -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state; the `Vec` of these replaces an
/// enclosing-pointer chain.
struct FrameCompiler {
    function: ObjId,
    fn_type: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

/// Bookkeeping for the innermost enclosing loop; saved and restored around
/// each nested loop so `break` and `continue` always see their own.
struct LoopContext {
    start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

pub struct Compiler<'src, 'vm> {
    source: &'src str,
    scanner: Scanner<'src>,
    heap: &'vm mut Heap,
    globals: &'vm Table,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    frames: Vec<FrameCompiler>,
    loop_ctx: Option<LoopContext>,
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    fn new(source: &'src str, heap: &'vm mut Heap, globals: &'vm Table) -> Self {
        let mut compiler = Compiler {
            source,
            scanner: Scanner::new(source),
            heap,
            globals,
            previous: Token::empty(),
            current: Token::empty(),
            had_error: false,
            panic_mode: false,
            frames: Vec::new(),
            loop_ctx: None,
        };
        compiler.begin_function(FunctionType::Script);
        compiler
    }

    fn run(&mut self) -> Option<ObjId> {
        self.advance();
        while !self.matches(TokenKind::Eof) {
            self.declaration();
        }
        let (function, _) = self.end_function();
        if self.had_error { None } else { Some(function) }
    }

    // ---- token plumbing ----

    fn lexeme(&self, token: Token) -> &'src str {
        token.lexeme(self.source)
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.message.unwrap_or("Unknown scanning error.");
            self.error_at(self.current, message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
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

    // ---- error reporting ----

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", self.lexeme(token)),
        }
        eprintln!(": {message}");
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Fun
                | TokenKind::Let
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- heap access with collection scheduling ----

    /// Collect before allocating when the heap asks for it. Roots at
    /// compile time are every in-flight function plus the VM globals.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.function);
        }
        let globals = self.globals;
        self.heap.mark_table(globals);
        self.heap.collect();
    }

    fn alloc(&mut self, obj: Obj) -> ObjId {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    fn intern(&mut self, text: &str) -> ObjId {
        self.maybe_collect();
        self.heap.intern(text)
    }

    fn intern_owned(&mut self, text: String) -> ObjId {
        self.maybe_collect();
        self.heap.intern_owned(text)
    }

    // ---- emission ----

    fn frame(&self) -> &FrameCompiler {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut FrameCompiler {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn current_function(&self) -> ObjId {
        self.frame().function
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        let function = self.current_function();
        &mut self.heap.function_mut(function).chunk
    }

    fn chunk_len(&self) -> usize {
        self.heap.function(self.current_function()).chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line.max(1);
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    /// Emit an instruction whose operand may need the WIDE form.
    fn emit_with_operand(&mut self, op: OpCode, operand: u16) {
        if operand < 256 {
            self.emit_op(op);
            self.emit_byte(operand as u8);
        } else {
            self.emit_op(OpCode::Wide);
            self.emit_op(op);
            self.emit_byte((operand >> 8) as u8);
            self.emit_byte((operand & 0xff) as u8);
        }
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let constant = self.chunk_mut().add_constant(value);
        if constant > usize::from(u16::MAX) {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, constant);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the jump offset bytes themselves.
        let jump = self.chunk_len() - offset - 2;
        if jump > usize::from(u16::MAX) {
            self.error("Too much code to jump over.");
        }
        let chunk = self.chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > usize::from(u16::MAX) {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Lower `count` pops into `Pop` or chained `PopN` instructions.
    fn emit_pops(&mut self, mut count: usize) {
        if count == 1 {
            self.emit_op(OpCode::Pop);
            return;
        }
        while count > 0 {
            let batch = count.min(255);
            self.emit_op(OpCode::PopN);
            self.emit_byte(batch as u8);
            count -= batch;
        }
    }

    // ---- function frames & scopes ----

    fn begin_function(&mut self, fn_type: FunctionType) {
        let function = self.alloc(Obj::Function(FunctionData::new()));
        // Slot zero of every frame is reserved; its empty name can never
        // collide with a source identifier.
        let reserved = Local {
            name: Token::empty(),
            depth: 0,
            is_captured: false,
        };
        self.frames.push(FrameCompiler {
            function,
            fn_type,
            locals: vec![reserved],
            upvalues: Vec::new(),
            scope_depth: 0,
        });

        if fn_type != FunctionType::Script {
            let text = self.lexeme(self.previous);
            let name = self.intern(text);
            self.heap.function_mut(function).name = Some(name);
        }
    }

    fn end_function(&mut self) -> (ObjId, Vec<CompilerUpvalue>) {
        self.emit_return();
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => panic!("no function frame to end"),
        };

        #[cfg(feature = "print-code")]
        if !self.had_error {
            let name = match self.heap.function(frame.function).name {
                Some(name) => self.heap.as_str(name).to_string(),
                None => "<script>".to_string(),
            };
            quill_core::debug::disassemble_chunk(
                self.heap,
                &self.heap.function(frame.function).chunk,
                &name,
            );
        }

        (frame.function, frame.upvalues)
    }

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;

        let mut pops = 0;
        loop {
            let frame = self.frame();
            let (depth, captured) = match frame.locals.last() {
                Some(local) => (local.depth, local.is_captured),
                None => break,
            };
            if depth <= frame.scope_depth {
                break;
            }
            if captured {
                // Flush stored-up pops so the close sees its slot on top.
                self.emit_pops(pops);
                pops = 0;
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                pops += 1;
            }
            self.frame_mut().locals.pop();
        }
        self.emit_pops(pops);
    }

    // ---- variables ----

    fn identifier_constant(&mut self, name: Token) -> u16 {
        let text = self.lexeme(name);
        let id = self.intern(text);
        self.make_constant(Value::Obj(id))
    }

    fn resolve_local(&mut self, frame_index: usize, name: Token) -> Option<usize> {
        let text = self.lexeme(name);
        let mut uninitialized = false;
        let mut found = None;
        for (slot, local) in self.frames[frame_index].locals.iter().enumerate().rev() {
            if local.name.lexeme(self.source) == text {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(slot);
                break;
            }
        }
        if uninitialized {
            self.error("Cannot read local variable in its own initializer.");
        }
        found
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> usize {
        let existing = self.frames[frame_index]
            .upvalues
            .iter()
            .position(|up| up.index == index && up.is_local == is_local);
        if let Some(existing) = existing {
            return existing;
        }

        if self.frames[frame_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        self.frames[frame_index]
            .upvalues
            .push(CompilerUpvalue { index, is_local });
        let function = self.frames[frame_index].function;
        let count = self.frames[frame_index].upvalues.len();
        self.heap.function_mut(function).upvalue_count = count;
        count - 1
    }

    /// Resolve `name` as a variable captured from an enclosing function,
    /// threading an upvalue through every frame between the capture site
    /// and the local that owns the slot.
    fn resolve_upvalue(&mut self, frame_index: usize, name: Token) -> Option<usize> {
        if frame_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(frame_index - 1, name) {
            if local > usize::from(u8::MAX) {
                self.error("Cannot capture a local in a slot past 255.");
                return Some(0);
            }
            self.frames[frame_index - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(frame_index, local as u8, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(frame_index - 1, name) {
            return Some(self.add_upvalue(frame_index, upvalue as u8, false));
        }

        None
    }

    fn add_local(&mut self, name: Token) {
        if self.frame().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        // Globals are implicitly declared.
        if self.frame().scope_depth == 0 {
            return;
        }

        let name = self.previous;
        let text = self.lexeme(name);
        let mut duplicate = false;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < self.frame().scope_depth {
                break;
            }
            if local.name.lexeme(self.source) == text {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Variable with this name already declared in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.previous)
    }

    fn mark_initialized(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let depth = self.frame().scope_depth;
        if let Some(local) = self.frame_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u16) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_with_operand(OpCode::DefineGlobal, global);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Cannot have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.lexeme(self.previous).parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => {}
        }
    }

    /// Basic and template strings: decode escape sequences and intern.
    /// Template strings parse as plain text; interpolation is not a
    /// language feature.
    fn escaped_string(&mut self, _can_assign: bool) {
        let text = self.lexeme(self.previous);
        let inner = &text[1..text.len() - 1];

        let mut decoded = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                decoded.push(c);
                continue;
            }
            match chars.next() {
                Some('\\') => decoded.push('\\'),
                Some('\'') => decoded.push('\''),
                Some('"') => decoded.push('"'),
                Some('n') => decoded.push('\n'),
                Some('t') => decoded.push('\t'),
                // An escaped newline continues the line; unrecognized
                // escapes are dropped.
                _ => {}
            }
        }

        let id = self.intern_owned(decoded);
        self.emit_constant(Value::Obj(id));
    }

    fn raw_string(&mut self, _can_assign: bool) {
        let text = self.lexeme(self.previous);
        let inner = &text[1..text.len() - 1];
        let id = self.intern(inner);
        self.emit_constant(Value::Obj(id));
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn emit_variable_op(&mut self, op: OpCode, arg: u16) {
        if matches!(op, OpCode::GetUpvalue | OpCode::SetUpvalue) {
            // Upvalue slots never exceed a byte.
            self.emit_op(op);
            self.emit_byte(arg as u8);
        } else {
            self.emit_with_operand(op, arg);
        }
    }

    fn named_variable(&mut self, name: Token, can_assign: bool) {
        let frame_index = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(frame_index, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot as u16)
        } else if let Some(upvalue) = self.resolve_upvalue(frame_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue as u16)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_variable_op(set_op, arg);
            return;
        }

        let compound = match self.current.kind {
            TokenKind::PlusEqual => Some(OpCode::Add),
            TokenKind::MinusEqual => Some(OpCode::Subtract),
            TokenKind::StarEqual => Some(OpCode::Multiply),
            TokenKind::SlashEqual => Some(OpCode::Divide),
            TokenKind::PercentEqual => Some(OpCode::Modulo),
            TokenKind::StarStarEqual => Some(OpCode::Power),
            _ => None,
        };
        match compound {
            Some(op) if can_assign => {
                self.advance();
                self.emit_variable_op(get_op, arg);
                self.expression();
                self.emit_op(op);
                self.emit_variable_op(set_op, arg);
            }
            _ => self.emit_variable_op(get_op, arg),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;

        // Compile the operand.
        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = rule(operator).precedence;

        // `**` is right-associative: its right operand parses at the same
        // level instead of one higher.
        if operator == TokenKind::StarStar {
            self.parse_precedence(precedence);
        } else {
            self.parse_precedence(precedence.next());
        }

        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::StarStar => self.emit_op(OpCode::Power),
            _ => {}
        }
    }

    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn subscript(&mut self, can_assign: bool) {
        self.parse_precedence(Precedence::Or);
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::StoreSubscr);
        } else {
            self.emit_op(OpCode::IndexSubscr);
        }
    }

    /// `a.b` is sugar for `a["b"]`.
    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect identifier after '.'.");
        let text = self.lexeme(self.previous);
        let name = self.intern(text);
        self.emit_constant(Value::Obj(name));

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::StoreSubscr);
        } else {
            self.emit_op(OpCode::IndexSubscr);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                if self.check(TokenKind::RightBracket) {
                    // Trailing comma.
                    break;
                }
                self.parse_precedence(Precedence::Or);
                count += 1;
                if count > MAX_DISPLAY_ITEMS {
                    self.error("Cannot have more than 65535 items in a list display.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        self.emit_with_operand(OpCode::BuildList, count.min(MAX_DISPLAY_ITEMS) as u16);
    }

    /// A `{` in expression position opens a map display. In statement
    /// position it opens a block instead, so a map literal there needs
    /// parentheses.
    fn map(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                if self.check(TokenKind::RightBrace) {
                    // Trailing comma.
                    break;
                }
                self.parse_precedence(Precedence::Or);
                self.consume(
                    TokenKind::Colon,
                    "Expect ':' between key and value pair of map.",
                );
                self.parse_precedence(Precedence::Or);
                count += 1;
                if count > MAX_DISPLAY_ITEMS {
                    self.error("Cannot have more than 65535 items in a map display.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after map elements.");
        self.emit_with_operand(OpCode::BuildMap, count.min(MAX_DISPLAY_ITEMS) as u16);
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Let) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::LeftBrace) {
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

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function_body(FunctionType::Function);
        self.define_variable(global);
    }

    fn function_body(&mut self, fn_type: FunctionType) {
        self.begin_function(fn_type);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function = self.current_function();
                self.heap.function_mut(function).arity += 1;
                if self.heap.function(function).arity > 255 {
                    self.error_at_current("Cannot have more than 255 parameters.");
                }

                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // The frame's locals die with it; no explicit scope pop is needed.
        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_with_operand(OpCode::Closure, constant);

        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
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

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let enclosing = self.loop_ctx.take();
        let loop_start = self.chunk_len();
        self.loop_ctx = Some(LoopContext {
            start: loop_start,
            scope_depth: self.frame().scope_depth,
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.statement();

        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        self.close_loop(enclosing);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Let) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let enclosing = self.loop_ctx.take();
        let mut loop_start = self.chunk_len();
        self.loop_ctx = Some(LoopContext {
            start: loop_start,
            scope_depth: self.frame().scope_depth,
            break_jumps: Vec::new(),
        });

        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");

            // Jump out of the loop if the condition is false.
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop); // Condition.
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);

            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect a ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            // `continue` in the body must run the increment.
            if let Some(ctx) = &mut self.loop_ctx {
                ctx.start = increment_start;
            }
            self.patch_jump(body_jump);
        }

        self.statement();

        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop); // Condition.
        }

        self.close_loop(enclosing);
        self.end_scope();
    }

    /// Patch this loop's pending breaks and restore the enclosing context.
    fn close_loop(&mut self, enclosing: Option<LoopContext>) {
        if let Some(ctx) = self.loop_ctx.take() {
            for offset in ctx.break_jumps {
                self.patch_jump(offset);
            }
        }
        self.loop_ctx = enclosing;
    }

    /// Count the locals that must be discarded when control leaves the
    /// innermost loop from the current scope.
    fn loop_local_pops(&self, loop_scope_depth: i32) -> usize {
        self.frame()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > loop_scope_depth)
            .count()
    }

    fn break_statement(&mut self) {
        let Some(scope_depth) = self.loop_ctx.as_ref().map(|ctx| ctx.scope_depth) else {
            self.error("Cannot use 'break' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
            return;
        };

        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");

        // Discard any locals created inside the loop, then jump past its
        // end; the jump is patched when the loop closes.
        let pops = self.loop_local_pops(scope_depth);
        self.emit_pops(pops);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(ctx) = &mut self.loop_ctx {
            ctx.break_jumps.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        let Some((start, scope_depth)) = self
            .loop_ctx
            .as_ref()
            .map(|ctx| (ctx.start, ctx.scope_depth))
        else {
            self.error("Cannot use 'continue' outside of a loop.");
            self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
            return;
        };

        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");

        // Discard any locals created inside the loop, then jump back to
        // the top (or the increment clause) of the innermost loop.
        let pops = self.loop_local_pops(scope_depth);
        self.emit_pops(pops);
        self.emit_loop(start);
    }

    fn return_statement(&mut self) {
        if self.frame().fn_type == FunctionType::Script {
            self.error("Cannot return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

fn rule<'src, 'vm>(kind: TokenKind) -> ParseRule<'src, 'vm> {
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'vm>>,
        Option<ParseFn<'src, 'vm>>,
        Precedence,
    ) = match kind {
        TokenKind::LeftParen => (
            Some(Compiler::grouping),
            Some(Compiler::call),
            Precedence::Call,
        ),
        TokenKind::LeftBrace => (Some(Compiler::map), None, Precedence::None),
        TokenKind::LeftBracket => (
            Some(Compiler::list),
            Some(Compiler::subscript),
            Precedence::Subscript,
        ),
        TokenKind::Dot => (None, Some(Compiler::dot), Precedence::Subscript),
        TokenKind::Minus => (
            Some(Compiler::unary),
            Some(Compiler::binary),
            Precedence::Term,
        ),
        TokenKind::Plus => (None, Some(Compiler::binary), Precedence::Term),
        TokenKind::Slash | TokenKind::Percent | TokenKind::Star => {
            (None, Some(Compiler::binary), Precedence::Factor)
        }
        TokenKind::StarStar => (None, Some(Compiler::binary), Precedence::Power),
        TokenKind::Bang => (Some(Compiler::unary), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            (None, Some(Compiler::binary), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        TokenKind::BasicString | TokenKind::TemplateString => {
            (Some(Compiler::escaped_string), None, Precedence::None)
        }
        TokenKind::RawString => (Some(Compiler::raw_string), None, Precedence::None),
        TokenKind::Identifier => (Some(Compiler::variable), None, Precedence::None),
        TokenKind::Number => (Some(Compiler::number), None, Precedence::None),
        TokenKind::And => (None, Some(Compiler::and_op), Precedence::And),
        TokenKind::Or => (None, Some(Compiler::or_op), Precedence::Or),
        TokenKind::False | TokenKind::Nil | TokenKind::True => {
            (Some(Compiler::literal), None, Precedence::None)
        }
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> (Heap, Option<ObjId>) {
        let mut heap = Heap::new();
        let globals = Table::new();
        let function = compile(source, &mut heap, &globals);
        (heap, function)
    }

    fn op(code: OpCode) -> u8 {
        code.into()
    }

    #[test]
    fn test_arithmetic_emission() {
        let (heap, function) = compile_source("1 + 2 * 3;");
        let function = function.unwrap();
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                0,
                op(OpCode::Constant),
                1,
                op(OpCode::Constant),
                2,
                op(OpCode::Multiply),
                op(OpCode::Add),
                op(OpCode::Pop),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
        assert_eq!(
            chunk.constants,
            vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
        );
    }

    #[test]
    fn test_power_is_right_associative() {
        // 2 ** 3 ** 2 must compile as 2 ** (3 ** 2): both Power ops come
        // after all three constants.
        let (heap, function) = compile_source("2 ** 3 ** 2;");
        let chunk = &heap.function(function.unwrap()).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                0,
                op(OpCode::Constant),
                1,
                op(OpCode::Constant),
                2,
                op(OpCode::Power),
                op(OpCode::Power),
                op(OpCode::Pop),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
    }

    #[test]
    fn test_string_escapes_decoded_and_interned() {
        let (heap, function) = compile_source(r"'a\n\t\\\q';");
        let chunk = &heap.function(function.unwrap()).chunk;
        let Value::Obj(id) = chunk.constants[0] else {
            panic!("expected a string constant");
        };
        // \q is an unrecognized escape and is dropped.
        assert_eq!(heap.as_str(id), "a\n\t\\");
    }

    #[test]
    fn test_identical_literals_share_one_string() {
        let (heap, function) = compile_source("'dup'; \"dup\"; `dup`;");
        let chunk = &heap.function(function.unwrap()).chunk;
        let ids: Vec<_> = chunk
            .constants
            .iter()
            .filter_map(|c| c.as_obj())
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|&id| id == ids[0]));
    }

    #[test]
    fn test_global_compound_assignment() {
        let (heap, function) = compile_source("let x = 1; x += 2;");
        let chunk = &heap.function(function.unwrap()).chunk;
        let code = &chunk.code;
        // GET x, constant 2, ADD, SET x, POP before the implicit return.
        let tail = &code[code.len() - 10..];
        assert_eq!(tail[0], op(OpCode::GetGlobal));
        assert_eq!(tail[2], op(OpCode::Constant));
        assert_eq!(tail[4], op(OpCode::Add));
        assert_eq!(tail[5], op(OpCode::SetGlobal));
        assert_eq!(tail[7], op(OpCode::Pop));
        assert_eq!(tail[1], tail[6], "get and set name the same constant");
    }

    #[test]
    fn test_locals_resolve_to_slots() {
        let (heap, function) = compile_source("{ let a = 1; a; }");
        let chunk = &heap.function(function.unwrap()).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                0,
                op(OpCode::GetLocal),
                1,
                op(OpCode::Pop),
                op(OpCode::Pop),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
    }

    #[test]
    fn test_closure_upvalue_emission() {
        let source = "fun outer() { let a = 1; fun inner() { return a; } return inner; }";
        let (heap, function) = compile_source(source);
        let script = heap.function(function.unwrap());

        // Find the outer function among the script constants.
        let outer = script
            .chunk
            .constants
            .iter()
            .filter_map(|c| c.as_obj())
            .find(|&id| matches!(heap.get(id), Obj::Function(_)))
            .unwrap();
        let outer_fn = heap.function(outer);

        let inner = outer_fn
            .chunk
            .constants
            .iter()
            .filter_map(|c| c.as_obj())
            .find(|&id| matches!(heap.get(id), Obj::Function(_)))
            .unwrap();
        assert_eq!(heap.function(inner).upvalue_count, 1);

        // The closure instruction is followed by (is_local=1, index=1).
        let code = &outer_fn.chunk.code;
        let closure_at = code
            .iter()
            .position(|&b| b == op(OpCode::Closure))
            .unwrap();
        assert_eq!(code[closure_at + 2], 1);
        assert_eq!(code[closure_at + 3], 1);
    }

    #[test]
    fn test_wide_constant_path() {
        // Force more than 256 constants into one chunk; the 257th load
        // must go through the WIDE prefix.
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("{i};"));
        }
        let (heap, function) = compile_source(&source);
        let chunk = &heap.function(function.unwrap()).chunk;
        assert_eq!(chunk.constants.len(), 300);
        assert!(chunk.code.contains(&op(OpCode::Wide)));

        // Decode the stream and confirm the wide loads name the right
        // constants.
        let mut offset = 0;
        let mut loads = Vec::new();
        while offset < chunk.code.len() {
            let byte = chunk.code[offset];
            if byte == op(OpCode::Wide) {
                assert_eq!(chunk.code[offset + 1], op(OpCode::Constant));
                let index = (usize::from(chunk.code[offset + 2]) << 8)
                    | usize::from(chunk.code[offset + 3]);
                loads.push(index);
                offset += 5; // wide, constant, hi, lo, pop
            } else if byte == op(OpCode::Constant) {
                loads.push(usize::from(chunk.code[offset + 1]));
                offset += 3; // constant, operand, pop
            } else {
                offset += 1;
            }
        }
        assert_eq!(loads, (0..300).collect::<Vec<_>>());
    }

    // `nil` elements keep the constant pool empty, so only the display
    // count limit is in play.

    #[test]
    fn test_largest_legal_list_display_compiles() {
        let mut source = String::from("let xs = [");
        for _ in 0..65535 {
            source.push_str("nil,");
        }
        source.push_str("];");
        let (heap, function) = compile_source(&source);
        let code = &heap.function(function.unwrap()).chunk.code;
        // The build count is emitted through the WIDE path at its maximum;
        // the variable name is the only constant.
        let tail = &code[code.len() - 8..];
        assert_eq!(
            tail,
            &[
                op(OpCode::Wide),
                op(OpCode::BuildList),
                255,
                255,
                op(OpCode::DefineGlobal),
                0,
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
    }

    #[test]
    fn test_list_display_overflow_is_an_error() {
        // One more element than a 16-bit build count can name must be
        // rejected, not wrapped to BuildList 0.
        let mut source = String::from("let xs = [");
        for _ in 0..65536 {
            source.push_str("nil,");
        }
        source.push_str("];");
        let (_, function) = compile_source(&source);
        assert!(function.is_none());
    }

    #[test]
    fn test_map_display_overflow_is_an_error() {
        let mut source = String::from("let m = {");
        for _ in 0..65536 {
            source.push_str("nil:nil,");
        }
        source.push_str("};");
        let (_, function) = compile_source(&source);
        assert!(function.is_none());
    }

    #[test]
    fn test_scope_exit_batches_pops() {
        let mut source = String::from("{");
        for i in 0..300 {
            source.push_str(&format!("let v{i} = 0;"));
        }
        source.push('}');
        let (heap, function) = compile_source(&source);
        let code = &heap.function(function.unwrap()).chunk.code;
        let tail = &code[code.len() - 6..];
        assert_eq!(
            tail,
            &[
                op(OpCode::PopN),
                255,
                op(OpCode::PopN),
                45,
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
    }

    #[test]
    fn test_captured_local_closes_on_scope_exit() {
        let source = "{ let a = 1; fun f() { return a; } }";
        let (heap, function) = compile_source(source);
        let code = &heap.function(function.unwrap()).chunk.code;
        assert!(code.contains(&op(OpCode::CloseUpvalue)));
    }

    #[test]
    fn test_compile_errors_return_none() {
        let cases = [
            "1 = 2;",
            "break;",
            "continue;",
            "return 1;",
            "{ let a = 1; let a = 2; }",
            "{ let a = a; }",
            "let 1 = 2;",
            "(1;",
            "'unterminated",
            "fun f(a, a) {}",
        ];
        for source in cases {
            let (_, function) = compile_source(source);
            assert!(function.is_none(), "expected error for: {source}");
        }
    }

    // Each `true;` statement is two bytes, and the then-branch of an `if`
    // spans a pop, the body, and a three-byte exit jump: distance 2n + 4.

    #[test]
    fn test_jump_distance_overflow_is_an_error() {
        // n = 32766 puts the then-jump at 65536, one past the limit.
        let mut source = String::from("if (true) {");
        for _ in 0..32766 {
            source.push_str("true;");
        }
        source.push('}');
        let (_, function) = compile_source(&source);
        assert!(function.is_none());
    }

    #[test]
    fn test_largest_legal_jump_compiles() {
        // n = 32765 keeps the then-jump at 65534, inside 16 bits.
        let mut source = String::from("if (true) {");
        for _ in 0..32765 {
            source.push_str("true;");
        }
        source.push('}');
        let (_, function) = compile_source(&source);
        assert!(function.is_some());
    }

    #[test]
    fn test_loops_compile() {
        for source in [
            "while (true) { break; }",
            "while (true) { continue; }",
            "for (let i = 0; i < 3; i += 1) { i; }",
            "for (;;) { break; }",
            "while (true) { while (true) { break; } break; }",
        ] {
            let (_, function) = compile_source(source);
            assert!(function.is_some(), "expected success for: {source}");
        }
    }

    #[test]
    fn test_script_arity_and_name() {
        let (heap, function) = compile_source("fun greet(a, b) {}");
        let script = heap.function(function.unwrap());
        let inner = script
            .chunk
            .constants
            .iter()
            .filter_map(|c| c.as_obj())
            .find(|&id| matches!(heap.get(id), Obj::Function(_)))
            .unwrap();
        let greet = heap.function(inner);
        assert_eq!(greet.arity, 2);
        assert_eq!(heap.as_str(greet.name.unwrap()), "greet");
        assert!(script.name.is_none());
    }

    #[test]
    fn test_line_table_tracks_emission() {
        let (heap, function) = compile_source("1;\n\n2;");
        let chunk = &heap.function(function.unwrap()).chunk;
        assert_eq!(chunk.line_for(0), 1);
        // The second constant load sits on line 3.
        assert_eq!(chunk.line_for(3), 3);
    }
}
