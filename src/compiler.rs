//! Contains the Joker parser and bytecode compiler.
//!
//! There is no syntax tree: statements are parsed by recursive descent, expressions by a Pratt
//! parser, and both emit bytecode into the function being compiled as soon as they have seen
//! enough tokens.
use crate::chunk::{Chunk, OpCode, WrittenOpcode, UPVALUE_IS_LOCAL};
use crate::debug;
use crate::error::InterpretationError;
use crate::gc::Heap;
use crate::object::{Obj, ObjFn, ObjRef};
use crate::scanner::{tokenize, Lexeme, Token};
use crate::value::{NumericKind, Value};
use crate::vm::VM;

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given Joker source code and, if successful, returns the top-level function.
///
/// Strings and functions are allocated on the VM's heap as they are compiled. Diagnostics are
/// written to the VM's error sink before this returns.
pub fn compile(source: &str, vm: &mut VM) -> crate::Result<ObjRef> {
    let parser = Parser::new(source);
    let compiler = Compiler::new(parser, vm);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

/// Locals are addressed by a one-byte slot.
const MAX_LOCALS: usize = 256;
/// Upvalue descriptors keep their index in seven bits.
const MAX_UPVALUES: usize = 128;
const MAX_ARGUMENTS: usize = 255;

/// Precedence rules for [Token]s in Joker, lowest first.
///
/// Precedence rules have a well-defined partial ordering ([PartialOrd]), which is required for use
/// in the Pratt parsing algorithm.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// `=` and the compound assignments
    Assignment,
    /// `?:`
    Conditional,
    /// `or`
    Or,
    /// `and`
    And,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `&`
    BitAnd,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `<<` `>>`
    Shift,
    /// `+` `-`
    Term,
    /// `*` `/` `%`
    Factor,
    /// `!` `-` `~`
    Unary,
    /// `.` `()` `[]` `::`
    Call,
    /// Literals, and groupings
    Primary,
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

/// Any possible action taken from the parsing table. Actions take the entire compiler state, and
/// convert it, usually emitting bytecode.
type ParserFn = fn(&mut Compiler, bool) -> ();

/// Contains the parser state: the token list, the two lexemes the compiler looks at, and the
/// error status.
#[derive(Debug)]
struct Parser<'a> {
    tokens: Vec<Lexeme<'a>>,
    /// Index of the lexeme after `current`.
    position: usize,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
    /// Formatted diagnostics, flushed to the VM once compilation ends.
    diagnostics: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Lambda,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'a> {
    name: &'a str,
    /// `None` while the variable is declared but its initializer has not finished.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct UpvalueDescriptor {
    index: u8,
    is_local: bool,
}

#[derive(Debug)]
struct LoopContext {
    /// Where `continue` jumps to.
    continue_target: usize,
    /// Locals deeper than this are discarded by `break` and `continue`.
    scope_depth: usize,
    /// Jumps that `break` emitted; patched once the loop ends.
    breaks: Vec<usize>,
}

/// The state of one function being compiled.
#[derive(Debug)]
struct FnCompiler<'a> {
    function: ObjFn,
    kind: FunctionKind,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: usize,
    loops: Vec<LoopContext>,
    /// The body already ends in `Return`, so no implicit return is needed.
    returned: bool,
}

#[derive(Debug)]
struct ClassCompiler {
    has_superclass: bool,
}

/// Contains the compiler state: the [Parser], the VM whose heap receives the constants, and one
/// [FnCompiler] per function that is still being compiled.
struct Compiler<'a, 'vm> {
    parser: Parser<'a>,
    vm: &'vm mut VM,
    frames: Vec<FnCompiler<'a>>,
    classes: Vec<ClassCompiler>,
}

impl Precedence {
    /// Returns the next higher level of precedence.
    ///
    /// # Panics
    ///
    /// Panics if trying to obtain a higher-level of precedence than the maximum,
    /// [Precedence::Primary], which is the precedence of literals and l-values.
    #[inline]
    fn higher_precedence(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Conditional,
            Conditional => Or,
            Or => And,
            And => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Equality,
            Equality => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => panic!("Tried to get higher precedence than primary"),
        }
    }
}

impl ParserRule {
    /// Returns one level of precedence higher than the rule's precedence.
    /// See [Precedence::higher_precedence()].
    #[inline(always)]
    fn higher_precedence(&self) -> Precedence {
        self.precedence.higher_precedence()
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code, positioned on the first token.
    fn new(source: &'a str) -> Parser<'a> {
        let sentinel = Lexeme::synthetic("<before first token>");
        let mut parser = Parser {
            tokens: tokenize(source),
            position: 0,
            current: sentinel,
            previous: sentinel,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
        };
        parser.advance();
        parser
    }

    /// Update self.previous and self.current such that they move one token further in the token
    /// stream. Error lexemes are reported and skipped.
    fn advance(&mut self) {
        self.previous = self.current;

        loop {
            // The list always ends with Eof, and Eof is never stepped over.
            self.current = self.tokens[self.position];
            if self.current.token() != Token::Eof {
                self.position += 1;
            }
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text())
        }
    }

    /// The token `distance` lexemes after the current one.
    fn peek(&self, distance: usize) -> Token {
        self.tokens
            .get(self.position + distance - 1)
            .map_or(Token::Eof, |lexeme| lexeme.token())
    }

    /// Scan the next token. If the token is not of the desired type, an error is reported.
    fn consume(&mut self, desired_token: Token, message: &str) {
        if self.current.token() == desired_token {
            return self.advance();
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Advances if the current token matches `desired_token`. Returns whether it matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Report a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want to call, because the previous lexeme decided which [ParserRule]
    /// was accepted.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message)
    }

    /// Report a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message)
    }

    /// Report a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // *Attempt* to prevent a deluge of spurious syntax errors:
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        let location = match lexeme.token() {
            Token::Eof => " at end".to_owned(),
            Token::Error => String::new(),
            _ => format!(" at '{}'", lexeme.text()),
        };
        self.diagnostics
            .push(format!("[line {}] Error{location}: {message}", lexeme.line()));
    }

    /// Synchronize after being in panic mode.
    ///
    /// Discards tokens until we **think** we're at a statement boundary: just after a `;`, or
    /// just before a keyword that starts a declaration or statement.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token() != Token::Eof {
            if self.previous.token() == Token::Semicolon {
                return;
            }

            use Token::*;
            match self.current.token() {
                Class | Struct | Enum | Fn | Var | For | If | While | Loop | Match | Return
                | Break | Continue => return,
                _ => (), // continue panicking
            }

            self.advance();
        }
    }
}

impl<'a> FnCompiler<'a> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 holds the callee, or the receiver in methods.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "self",
            _ => "",
        };

        FnCompiler {
            function: ObjFn {
                name,
                ..ObjFn::default()
            },
            kind,
            locals: vec![Local {
                name: slot_zero,
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            returned: false,
        }
    }
}

/// Marks what the compiler is holding on to: the name and constants of every function that has
/// not been moved onto the heap yet.
fn mark_compiler_roots(heap: &mut Heap, frames: &[FnCompiler]) {
    for frame in frames {
        if let Some(name) = frame.function.name {
            heap.mark_object(name);
        }
        for &constant in frame.function.chunk.constants.iter() {
            heap.mark_value(constant);
        }
    }
}

/// The arithmetic opcode of a compound assignment token.
fn compound_operator(token: Token) -> Option<OpCode> {
    let opcode = match token {
        Token::PlusEqual => OpCode::Add,
        Token::MinusEqual => OpCode::Subtract,
        Token::StarEqual => OpCode::Multiply,
        Token::SlashEqual => OpCode::Divide,
        Token::PercentEqual => OpCode::Modulo,
        Token::AmpersandEqual => OpCode::BitAnd,
        Token::PipeEqual => OpCode::BitOr,
        Token::CaretEqual => OpCode::BitXor,
        Token::ShiftLeftEqual => OpCode::ShiftLeft,
        Token::ShiftRightEqual => OpCode::ShiftRight,
        _ => return None,
    };
    Some(opcode)
}

impl<'a, 'vm> Compiler<'a, 'vm> {
    /// Creates a new compiler with the given [Parser].
    fn new(parser: Parser<'a>, vm: &'vm mut VM) -> Self {
        Compiler {
            parser,
            vm,
            frames: vec![FnCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    /// Takes ownership of the compiler, and returns the top-level function.
    fn compile(mut self) -> crate::Result<ObjRef> {
        while !self.match_and_advance(Token::Eof) {
            self.declaration();
        }
        let (function, _) = self.end_function();

        for message in std::mem::take(&mut self.parser.diagnostics) {
            self.vm.report_error(&message);
        }
        if self.parser.had_error {
            return Err(InterpretationError::CompileError);
        }

        Ok(self.alloc(Obj::Fn(function)))
    }

    /// Finishes the innermost function and hands it back, with the upvalues it captures.
    fn end_function(&mut self) -> (ObjFn, Vec<UpvalueDescriptor>) {
        if !self.frame().returned {
            self.emit_return();
        }

        let frame = self
            .frames
            .pop()
            .expect("the compiler always has a function to finish");
        let mut function = frame.function;
        function.upvalue_count = frame.upvalues.len();

        // Print a listing of the bytecode to manually inspect compiled output.
        if self.vm.config().print_code && !self.parser.had_error {
            let name = match function.name {
                Some(name) => self.vm.heap.as_str(name),
                None => "<script>",
            };
            let mut listing = String::new();
            let _ = debug::disassemble_chunk(&mut listing, &self.vm.heap, &function.chunk, name);
            eprint!("{listing}");
        }

        (function, frame.upvalues)
    }

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;

        // First, figure out how to parse the prefix.
        if let Some(prefix_rule) = self.rule_from_previous().prefix {
            prefix_rule(self, can_assign);
        } else {
            self.parser.error("Expect expression.");
            return;
        }

        while precedence <= self.rule_from_current().precedence {
            // current is now previous:
            self.advance();
            let infix_rule = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");

            infix_rule(self, can_assign);
        }

        // Nobody consumed the `=`, so whatever is on its left cannot be assigned to.
        if can_assign
            && (self.parser.check(Token::Equal)
                || compound_operator(self.parser.current.token()).is_some())
        {
            self.advance();
            self.parser.error("Invalid assignment target.");
        }
    }

    ////////////////////////////////////////// Variables //////////////////////////////////////////

    /// Add the identifier text to the current chunk's constants table.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.intern(name);
        let index = self.make_constant(string.into());
        match u8::try_from(index) {
            Ok(index) => index,
            Err(_) => {
                self.parser.error("Too many constants in one chunk.");
                0
            }
        }
    }

    /// Consume the next identifer and declare it as a variable.
    /// Returns the constant for the identifier name, or 0 for locals.
    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.parser.consume(Token::Identifier, error_message);
        let name = self.parser.previous.text();

        self.declare_variable(name);
        if self.frame().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(name)
    }

    /// Records a local variable in the current scope. Globals are late-bound, so this does
    /// nothing at the top level.
    fn declare_variable(&mut self, name: &'a str) {
        let frame = self.frame();
        if frame.scope_depth == 0 {
            return;
        }

        let duplicate = frame
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |depth| depth >= frame.scope_depth))
            .any(|local| local.name == name);
        if duplicate {
            self.parser
                .error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: &'a str) {
        if self.frame().locals.len() == MAX_LOCALS {
            self.parser.error("Too many local variables in function.");
            return;
        }

        self.frame_mut().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    /// The most recent local can be used from now on.
    fn mark_initialized(&mut self) {
        let frame = self.frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        if let Some(local) = frame.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    /// Define a new variable: a global gets its value, a local becomes usable.
    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_instruction(OpCode::DefineGlobal)
            .with_operand(global);
    }

    /// Finds the slot of a local in the given frame, innermost first.
    fn resolve_local(&mut self, frame: usize, name: &str) -> Option<u8> {
        let (slot, depth) = self.frames[frame]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth))?;

        if depth.is_none() {
            self.parser
                .error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Finds a variable of an enclosing function, capturing it on the way down.
    fn resolve_upvalue(&mut self, frame: usize, name: &str) -> Option<u8> {
        if frame == 0 {
            return None;
        }
        let enclosing = frame - 1;

        if let Some(slot) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[slot as usize].is_captured = true;
            if slot as usize >= MAX_UPVALUES {
                self.parser
                    .error("Too many local variables to capture in one closure.");
                return Some(0);
            }
            return Some(self.add_upvalue(frame, slot, true));
        }

        let index = self.resolve_upvalue(enclosing, name)?;
        Some(self.add_upvalue(frame, index, false))
    }

    fn add_upvalue(&mut self, frame: usize, index: u8, is_local: bool) -> u8 {
        let descriptor = UpvalueDescriptor { index, is_local };
        let upvalues = &self.frames[frame].upvalues;
        if let Some(existing) = upvalues.iter().position(|&u| u == descriptor) {
            return existing as u8;
        }

        if upvalues.len() == MAX_UPVALUES {
            self.parser.error("Too many closure variables in function.");
            return 0;
        }

        let upvalues = &mut self.frames[frame].upvalues;
        upvalues.push(descriptor);
        (upvalues.len() - 1) as u8
    }

    /// Parse a variable. This could either be a variable access or an assignment, depending on
    /// `can_assign` and the syntactic context.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let innermost = self.frames.len() - 1;
        let (get, set, arg) = if let Some(slot) = self.resolve_local(innermost, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(innermost, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        // Peek ahead and look if we're assigning.
        // This only works if we're parsing at a lower or equal precedence to assignment.
        if can_assign && self.match_and_advance(Token::Equal) {
            self.expression();
            self.emit_instruction(set).with_operand(arg);
        } else if let Some(operator) = self.match_compound_operator(can_assign) {
            self.emit_instruction(get).with_operand(arg);
            self.expression();
            self.emit_instruction(operator);
            self.emit_instruction(set).with_operand(arg);
        } else {
            self.emit_instruction(get).with_operand(arg);
        }
    }

    /// Consumes a compound assignment operator, if assignment is possible here.
    fn match_compound_operator(&mut self, can_assign: bool) -> Option<OpCode> {
        if !can_assign {
            return None;
        }
        let operator = compound_operator(self.parser.current.token())?;
        self.advance();
        Some(operator)
    }

    /// Skips a type annotation. Returns its name.
    fn type_annotation(&mut self) -> &'a str {
        match self.parser.current.token() {
            Token::Identifier | Token::Fn | Token::NoneKeyword => {
                self.advance();
                self.parser.previous.text()
            }
            _ => {
                self.parser.error_at_current("Expect type name.");
                ""
            }
        }
    }

    ///////////////////////////////////////// Scopes //////////////////////////////////////////////

    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    /// Leaves a block scope, discarding its locals. Captured locals are moved to the heap.
    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;

        loop {
            let frame = self.frame();
            let opcode = match frame.locals.last() {
                Some(local) if local.depth.map_or(true, |depth| depth > frame.scope_depth) => {
                    if local.is_captured {
                        OpCode::CloseUpvalue
                    } else {
                        OpCode::Pop
                    }
                }
                _ => break,
            };
            self.emit_instruction(opcode);
            self.frame_mut().locals.pop();
        }
    }

    /// Emits the code that discards every local deeper than `depth`, without forgetting them.
    /// Used to jump out of a loop body.
    fn discard_locals_deeper_than(&mut self, depth: usize) {
        let opcodes: Vec<_> = self
            .frame()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d > depth))
            .map(|local| {
                if local.is_captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();

        for opcode in opcodes {
            self.emit_instruction(opcode);
        }
    }

    /////////////////////////////////////// Declarations //////////////////////////////////////////

    /// Parse a declaration.
    fn declaration(&mut self) {
        if self.match_and_advance(Token::Class) {
            self.class_declaration();
        } else if self.match_and_advance(Token::Struct) {
            self.struct_declaration();
        } else if self.match_and_advance(Token::Enum) {
            self.enum_declaration();
        } else if self.match_and_advance(Token::Fn) {
            self.fn_declaration();
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    /// Parse `var a: T = e, b;`. Assumes `var` has already been consumed.
    fn var_declaration(&mut self) {
        loop {
            let global = self.parse_variable("Expect variable name.");

            let conversion = if self.match_and_advance(Token::Colon) {
                NumericKind::from_type_name(self.type_annotation())
            } else {
                None
            };

            if self.match_and_advance(Token::Equal) {
                self.expression();
                if let Some(kind) = conversion {
                    self.emit_instruction(OpCode::Convert)
                        .with_operand(kind as u8);
                }
            } else {
                self.emit_instruction(OpCode::None);
            }

            self.define_variable(global);

            if !self.match_and_advance(Token::Comma) {
                break;
            }
        }

        self.parser
            .consume(Token::Semicolon, "Expect ';' after variable declaration.");
    }

    /// Parse `fn name(params) -> T { body }`. Assumes `fn` has already been consumed.
    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // The function may refer to itself.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compiles a parameter list and body into a new function, then emits the closure that
    /// creates it. The previous lexeme is the function's name.
    fn function(&mut self, kind: FunctionKind) {
        let name = self.intern(self.parser.previous.text());
        self.frames.push(FnCompiler::new(kind, Some(name)));
        self.begin_scope();

        self.parser
            .consume(Token::LeftParen, "Expect '(' after function name.");
        if !self.parser.check(Token::RightParen) {
            loop {
                self.parameter();
                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "Expect ')' after parameters.");
        if self.match_and_advance(Token::Arrow) {
            self.type_annotation();
        }

        self.parser
            .consume(Token::LeftBrace, "Expect '{' before function body.");
        self.block();

        self.emit_closure();
    }

    /// Parse one parameter, with an optional type annotation.
    fn parameter(&mut self) {
        let function = &mut self.frame_mut().function;
        if function.arity as usize == MAX_ARGUMENTS {
            self.parser
                .error_at_current("Can't have more than 255 parameters.");
        } else {
            function.arity += 1;
        }

        let constant = self.parse_variable("Expect parameter name.");
        if self.match_and_advance(Token::Colon) {
            self.type_annotation();
        }
        self.define_variable(constant);
    }

    /// Finishes the innermost function and emits [OpCode::Closure] for it in the enclosing one.
    fn emit_closure(&mut self) {
        let (function, upvalues) = self.end_function();
        let function = self.alloc(Obj::Fn(function));
        let index = self.make_constant(function.into());

        self.emit_instruction(OpCode::Closure)
            .with_short(index as u16);
        for upvalue in upvalues {
            let descriptor = if upvalue.is_local {
                UPVALUE_IS_LOCAL | upvalue.index
            } else {
                upvalue.index
            };
            self.emit_byte(descriptor);
        }
    }

    /// Parse `class A : B { fn m() {} }`. Assumes `class` has already been consumed.
    fn class_declaration(&mut self) {
        self.parser.consume(Token::Identifier, "Expect class name.");
        let class_name = self.parser.previous.text();
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable(class_name);

        self.emit_instruction(OpCode::Class)
            .with_operand(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_and_advance(Token::Colon) {
            self.parser
                .consume(Token::Identifier, "Expect superclass name.");
            let superclass = self.parser.previous.text();
            self.named_variable(superclass, false);
            if superclass == class_name {
                self.parser.error("A class can't inherit from itself.");
            }

            // Methods find the superclass in a local called `super`.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_instruction(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before class body.");
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.method();
        }
        self.parser
            .consume(Token::RightBrace, "Expect '}' after class body.");
        self.emit_instruction(OpCode::Pop);

        let class = self.classes.pop();
        if class.map_or(false, |class| class.has_superclass) {
            self.end_scope();
        }
    }

    /// Parse `fn name(params) { body }` inside a class body.
    fn method(&mut self) {
        self.parser
            .consume(Token::Fn, "Expect 'fn' before method name.");
        self.parser.consume(Token::Identifier, "Expect method name.");
        let name = self.parser.previous.text();
        let constant = self.identifier_constant(name);

        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_instruction(OpCode::Method)
            .with_operand(constant);
    }

    /// Parse `struct P : Q { x: i32, y }`. Assumes `struct` has already been consumed.
    fn struct_declaration(&mut self) {
        self.parser.consume(Token::Identifier, "Expect struct name.");
        let struct_name = self.parser.previous.text();
        let name_constant = self.identifier_constant(struct_name);
        self.declare_variable(struct_name);

        self.emit_instruction(OpCode::Struct)
            .with_operand(name_constant);
        self.define_variable(name_constant);

        if self.match_and_advance(Token::Colon) {
            self.parser
                .consume(Token::Identifier, "Expect parent struct name.");
            let parent = self.parser.previous.text();
            self.named_variable(parent, false);
            if parent == struct_name {
                self.parser.error("A struct can't inherit from itself.");
            }

            self.named_variable(struct_name, false);
            self.emit_instruction(OpCode::StructInherit);
        }

        self.named_variable(struct_name, false);
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before struct body.");
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.parser.consume(Token::Identifier, "Expect field name.");
            let field = self.identifier_constant(self.parser.previous.text());
            if self.match_and_advance(Token::Colon) {
                self.type_annotation();
            }

            self.emit_instruction(OpCode::None);
            self.emit_instruction(OpCode::Member).with_operand(field);

            if !self.match_and_advance(Token::Comma) {
                break;
            }
        }
        self.parser
            .consume(Token::RightBrace, "Expect '}' after struct body.");
        self.emit_instruction(OpCode::Pop);
    }

    /// Parse `enum E { A, B(i32, f64) }`. Assumes `enum` has already been consumed.
    fn enum_declaration(&mut self) {
        self.parser.consume(Token::Identifier, "Expect enum name.");
        let enum_name = self.parser.previous.text();
        let name_constant = self.identifier_constant(enum_name);
        self.declare_variable(enum_name);

        self.emit_instruction(OpCode::Enum)
            .with_operand(name_constant);
        self.define_variable(name_constant);

        self.named_variable(enum_name, false);
        self.parser
            .consume(Token::LeftBrace, "Expect '{' before enum body.");
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.parser.consume(Token::Identifier, "Expect member name.");
            let member = self.identifier_constant(self.parser.previous.text());

            // Only the number of payload types matters.
            let mut arity = 0usize;
            if self.match_and_advance(Token::LeftParen) {
                if !self.parser.check(Token::RightParen) {
                    loop {
                        self.type_annotation();
                        arity += 1;
                        if !self.match_and_advance(Token::Comma) {
                            break;
                        }
                    }
                }
                self.parser
                    .consume(Token::RightParen, "Expect ')' after member payload.");
            }
            if arity > MAX_ARGUMENTS {
                self.parser
                    .error("Can't have more than 255 values in one member.");
            }

            self.emit_instruction(OpCode::EnumMember)
                .with_operand(member)
                .with_operand(arity.min(MAX_ARGUMENTS) as u8);

            if !self.match_and_advance(Token::Comma) {
                break;
            }
        }
        self.parser
            .consume(Token::RightBrace, "Expect '}' after enum body.");
        self.emit_instruction(OpCode::Pop);
    }

    //////////////////////////////////////// Statements ///////////////////////////////////////////

    /// Parse a statement.
    fn statement(&mut self) {
        if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::Loop) {
            self.loop_statement();
        } else if self.match_and_advance(Token::Match) {
            self.match_statement();
        } else if self.match_and_advance(Token::Break) {
            self.break_statement();
        } else if self.match_and_advance(Token::Continue) {
            self.continue_statement();
        } else if self.match_and_advance(Token::Return) {
            self.return_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    /// Parse the declarations of a block. Assumes `{` has already been consumed.
    fn block(&mut self) {
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.declaration();
        }

        self.parser
            .consume(Token::RightBrace, "Expect '}' after block.");
    }

    /// Parse an expression statement (e.g., assignments, function calls).
    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expect ';' after expression.");
        // Statements have zero stack effect; throw away whatever the expression produced.
        self.emit_instruction(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.expression();

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_instruction(OpCode::Pop);
        if self.match_and_advance(Token::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.expression();

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_instruction(OpCode::Pop);

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_instruction(OpCode::Pop);
        self.end_loop();
    }

    fn loop_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        self.end_loop();
    }

    /// Parse `for (init; condition; increment) body`.
    ///
    /// ```text
    ///            init
    /// start:     condition; JumpIfFalse exit; Pop
    ///            Jump body
    /// increment: increment; Pop; Loop start
    /// body:      body; Loop increment
    /// exit:      Pop
    /// ```
    fn for_statement(&mut self) {
        self.begin_scope();

        self.parser
            .consume(Token::LeftParen, "Expect '(' after 'for'.");
        if self.match_and_advance(Token::Semicolon) {
            // No initializer.
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_instruction(OpCode::Pop);
        }

        if !self.match_and_advance(Token::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_instruction(OpCode::Pop);
            self.parser
                .consume(Token::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_instruction(OpCode::Pop);
        }
        self.end_loop();

        self.end_scope();
    }

    fn break_statement(&mut self) {
        let Some(depth) = self.frame().loops.last().map(|l| l.scope_depth) else {
            self.parser.error("Can't use 'break' outside of a loop.");
            return;
        };
        self.parser
            .consume(Token::Semicolon, "Expect ';' after 'break'.");

        self.discard_locals_deeper_than(depth);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(context) = self.frame_mut().loops.last_mut() {
            context.breaks.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        let Some((depth, target)) = self
            .frame()
            .loops
            .last()
            .map(|l| (l.scope_depth, l.continue_target))
        else {
            self.parser.error("Can't use 'continue' outside of a loop.");
            return;
        };
        self.parser
            .consume(Token::Semicolon, "Expect ';' after 'continue'.");

        self.discard_locals_deeper_than(depth);
        self.emit_loop(target);
    }

    fn return_statement(&mut self) {
        let kind = self.frame().kind;
        if kind == FunctionKind::Script {
            self.parser.error("Can't return from top-level code.");
        }

        if self.match_and_advance(Token::Semicolon) {
            self.emit_return();
        } else {
            if kind == FunctionKind::Initializer {
                self.parser
                    .error("Can't return a value from an initializer.");
            }

            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expect ';' after return value.");
            self.emit_instruction(OpCode::Return);
        }
    }

    /// Parse `match value { pattern => arm, ..., _ => arm }`.
    ///
    /// The value lives in a hidden local while the arms run. Each arm tests its pattern against it
    /// and jumps to the next arm on a mismatch; a matching arm jumps past the rest when done.
    fn match_statement(&mut self) {
        self.begin_scope();
        self.expression();
        // Spaces never appear in identifiers, so no program can name this local.
        self.add_local(" match");
        self.mark_initialized();

        self.parser
            .consume(Token::LeftBrace, "Expect '{' after match value.");

        let mut exits = Vec::new();
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            if self.match_and_advance(Token::Underscore) {
                self.parser
                    .consume(Token::FatArrow, "Expect '=>' after pattern.");
                self.match_arm();
                self.match_and_advance(Token::Comma);
                if !self.parser.check(Token::RightBrace) {
                    self.parser
                        .error_at_current("The wildcard arm must be the last arm of a match.");
                }
                break;
            }

            self.begin_scope();
            let next_arm = self.pattern();
            self.parser
                .consume(Token::FatArrow, "Expect '=>' after pattern.");
            self.match_arm();
            self.end_scope();

            exits.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(next_arm);
            self.match_and_advance(Token::Comma);
        }
        self.parser
            .consume(Token::RightBrace, "Expect '}' after match arms.");

        for exit in exits {
            self.patch_jump(exit);
        }
        self.end_scope();
    }

    /// Compiles the test of one match arm. Returns the jump taken when the pattern does not match.
    fn pattern(&mut self) -> usize {
        let is_enum_pattern = self.parser.check(Token::Identifier)
            && self.parser.peek(1) == Token::Layer
            && self.parser.peek(2) == Token::Identifier;
        if !is_enum_pattern {
            self.expression();
            return self.emit_jump(OpCode::JumpIfNotEqual);
        }

        // E::M or E::M(a, b)
        self.advance();
        self.named_variable(self.parser.previous.text(), false);
        self.advance();
        self.advance();
        let member = self.identifier_constant(self.parser.previous.text());

        self.emit_instruction(OpCode::EnumMatch)
            .with_operand(member)
            .with_short(u16::MAX);
        let next_arm = self.current_chunk().len() - 2;

        if self.match_and_advance(Token::LeftParen) {
            let mut count = 0usize;
            if !self.parser.check(Token::RightParen) {
                loop {
                    if self.match_and_advance(Token::Underscore) {
                        self.add_local("");
                    } else {
                        self.parser
                            .consume(Token::Identifier, "Expect binding name.");
                        self.declare_variable(self.parser.previous.text());
                    }
                    self.mark_initialized();
                    count += 1;
                    if !self.match_and_advance(Token::Comma) {
                        break;
                    }
                }
            }
            self.parser
                .consume(Token::RightParen, "Expect ')' after bindings.");

            if count > MAX_ARGUMENTS {
                self.parser.error("Too many bindings in one pattern.");
            }
            self.emit_instruction(OpCode::EnumBind)
                .with_operand(count.min(MAX_ARGUMENTS) as u8);
        }

        next_arm
    }

    /// The body of a match arm: a block, a statement, or an expression.
    fn match_arm(&mut self) {
        use Token::*;
        match self.parser.current.token() {
            LeftBrace => {
                self.advance();
                self.begin_scope();
                self.block();
                self.end_scope();
            }
            Return | Break | Continue | If | While | For | Loop | Match => self.statement(),
            _ => {
                self.expression();
                self.emit_instruction(OpCode::Pop);
                self.match_and_advance(Semicolon);
            }
        }
    }

    /// Parse an expression.
    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Parse a comma-separated argument list. Assumes `(` has already been consumed.
    fn argument_list(&mut self) -> u8 {
        let mut count = 0usize;
        if !self.parser.check(Token::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGUMENTS {
                    self.parser.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "Expect ')' after arguments.");
        count.min(MAX_ARGUMENTS) as u8
    }

    ////////////////////////////////////////// Loops //////////////////////////////////////////////

    fn begin_loop(&mut self, continue_target: usize) {
        let scope_depth = self.frame().scope_depth;
        self.frame_mut().loops.push(LoopContext {
            continue_target,
            scope_depth,
            breaks: Vec::new(),
        });
    }

    /// Points every `break` of the innermost loop here.
    fn end_loop(&mut self) {
        if let Some(context) = self.frame_mut().loops.pop() {
            for jump in context.breaks {
                self.patch_jump(jump);
            }
        }
    }

    ///////////////////////////////////////// Emitting ////////////////////////////////////////////

    /// Appends the implicit return: `self` in initializers, `None` everywhere else.
    fn emit_return(&mut self) {
        if self.frame().kind == FunctionKind::Initializer {
            self.emit_instruction(OpCode::GetLocal).with_operand(0);
        } else {
            self.emit_instruction(OpCode::None);
        }
        self.emit_instruction(OpCode::Return);
    }

    /// Appends [OpCode::Constant], or [OpCode::ConstantLong] once the pool is past 256 entries.
    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        match u8::try_from(index) {
            Ok(index) => {
                self.emit_instruction(OpCode::Constant).with_operand(index);
            }
            Err(_) => {
                self.emit_instruction(OpCode::ConstantLong)
                    .with_short(index as u16);
            }
        }
    }

    /// Appends a new constant to the current [Chunk].
    ///
    /// # Error
    ///
    /// When the constant index can no longer be represented as a u16, this signals a compiler
    /// error and returns `0`. The current [Chunk] can still be appended to, however, it is
    /// invalid, and should not be emitted as a valid program.
    fn make_constant(&mut self, value: Value) -> usize {
        let index = self.current_chunk().add_constant(value);
        if index > u16::MAX as usize {
            self.parser.error("Too many constants in one chunk.");
            return 0;
        }
        index
    }

    /// Emits a jump with a placeholder distance. Returns the offset of the distance, for
    /// [Compiler::patch_jump].
    fn emit_jump(&mut self, opcode: OpCode) -> usize {
        self.emit_instruction(opcode).with_short(u16::MAX);
        self.current_chunk().len() - 2
    }

    /// Makes the jump whose distance is at `offset` land on the next instruction emitted.
    fn patch_jump(&mut self, offset: usize) {
        // The distance is relative to the end of the operand.
        let distance = self.current_chunk().len() - offset - 2;
        match u16::try_from(distance) {
            Ok(distance) => self.current_chunk().patch_short(offset, distance),
            Err(_) => self.parser.error("Too much code to jump over."),
        }
    }

    /// Emits a backwards jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        // +3 for the Loop instruction itself and its operand.
        let distance = self.current_chunk().len() + 3 - loop_start;
        let distance = match u16::try_from(distance) {
            Ok(distance) => distance,
            Err(_) => {
                self.parser.error("Loop body too large.");
                0
            }
        };
        self.emit_instruction(OpCode::Loop).with_short(distance);
    }

    /// Writes an [OpCode] to the current [Chunk].
    /// Returns a [WrittenOpcode], with which you can write an operand.
    fn emit_instruction(&mut self, opcode: OpCode) -> WrittenOpcode {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_byte(byte, line);
    }

    ///////////////////////////////////////// Allocation //////////////////////////////////////////

    /// Allocates on the VM's heap, keeping the functions under construction alive.
    fn alloc(&mut self, obj: Obj) -> ObjRef {
        let frames = &self.frames;
        self.vm
            .alloc_with_roots(obj, |heap| mark_compiler_roots(heap, frames))
    }

    fn intern(&mut self, text: &str) -> ObjRef {
        let frames = &self.frames;
        self.vm
            .intern_with_roots(text, |heap| mark_compiler_roots(heap, frames))
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    /// Returns the function currently being compiled.
    #[inline(always)]
    fn frame(&self) -> &FnCompiler<'a> {
        self.frames
            .last()
            .expect("the compiler always has a function in progress")
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut FnCompiler<'a> {
        self.frames
            .last_mut()
            .expect("the compiler always has a function in progress")
    }

    /// Returns the current [Chunk].
    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frame_mut().function.chunk
    }

    /// Advance one token, such that:
    /// ```text
    /// (previous, current) = (current, next token)
    /// ```
    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    /// Returns the line number of the prefix token, a.k.a., `self.parser.previous`.
    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    /// Delegates to [Parser::match_and_advance]. Returns true if the token was matched.
    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    /// Returns the rule of the prefix in the process of being parsed.
    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        get_rule(self.previous_token())
    }

    /// Returns the rule of the token that would be parsed next.
    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        get_rule(self.parser.current.token())
    }

    /// Return the token (type) of the previous value. This is useful in prefix parser functions.
    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

#[rustfmt::skip]
fn get_rule(token: Token) -> ParserRule {
    use Token::*;
    match token {
        //                     Prefix            Infix             Precedence
        LeftParen    => rule!{ Some(grouping),   Some(call),       Precedence::Call },
        LeftBracket  => rule!{ Some(vector),     Some(index),      Precedence::Call },
        Dot          => rule!{ None,             Some(dot),        Precedence::Call },
        Layer        => rule!{ None,             Some(layer),      Precedence::Call },
        Question     => rule!{ None,             Some(ternary),    Precedence::Conditional },
        Minus        => rule!{ Some(unary),      Some(binary),     Precedence::Term },
        Plus         => rule!{ None,             Some(binary),     Precedence::Term },
        Slash        => rule!{ None,             Some(binary),     Precedence::Factor },
        Star         => rule!{ None,             Some(binary),     Precedence::Factor },
        Percent      => rule!{ None,             Some(binary),     Precedence::Factor },
        Ampersand    => rule!{ None,             Some(binary),     Precedence::BitAnd },
        Pipe         => rule!{ Some(lambda),     Some(binary),     Precedence::BitOr },
        Caret        => rule!{ None,             Some(binary),     Precedence::BitXor },
        ShiftLeft    => rule!{ None,             Some(binary),     Precedence::Shift },
        ShiftRight   => rule!{ None,             Some(binary),     Precedence::Shift },
        Tilde        => rule!{ Some(unary),      None,             Precedence::None },
        Bang         => rule!{ Some(unary),      None,             Precedence::None },
        BangEqual    => rule!{ None,             Some(binary),     Precedence::Equality },
        EqualEqual   => rule!{ None,             Some(binary),     Precedence::Equality },
        Greater      => rule!{ None,             Some(binary),     Precedence::Comparison },
        GreaterEqual => rule!{ None,             Some(binary),     Precedence::Comparison },
        Less         => rule!{ None,             Some(binary),     Precedence::Comparison },
        LessEqual    => rule!{ None,             Some(binary),     Precedence::Comparison },
        Identifier   => rule!{ Some(variable),   None,             Precedence::None },
        StrLiteral   => rule!{ Some(string),     None,             Precedence::None },
        I32Literal   => rule!{ Some(number),     None,             Precedence::None },
        I64Literal   => rule!{ Some(number),     None,             Precedence::None },
        F64Literal   => rule!{ Some(number),     None,             Precedence::None },
        And          => rule!{ None,             Some(and),        Precedence::And },
        Or           => rule!{ None,             Some(or),         Precedence::Or },
        False        => rule!{ Some(literal),    None,             Precedence::None },
        True         => rule!{ Some(literal),    None,             Precedence::None },
        NoneKeyword  => rule!{ Some(literal),    None,             Precedence::None },
        SelfKeyword  => rule!{ Some(self_),      None,             Precedence::None },
        Super        => rule!{ Some(super_),     None,             Precedence::None },
        _            => rule!{ None,             None,             Precedence::None },
    }
}

/// Parse '(' as a prefix. Assumes '(' has been consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightParen, "Expect ')' after expression.");
}

/// Parse a number literal as a prefix. Assumes number has been consumed.
fn number(compiler: &mut Compiler, _can_assign: bool) {
    let lexeme = compiler.parser.previous;
    let value = match lexeme.token() {
        Token::I32Literal => lexeme.text().parse().ok().map(Value::I32),
        Token::I64Literal => lexeme.text().parse().ok().map(Value::I64),
        Token::F64Literal => lexeme.text().parse().ok().map(Value::F64),
        _ => unreachable!(),
    };

    match value {
        Some(value) => compiler.emit_constant(value),
        None => compiler.parser.error("Invalid number literal."),
    }
}

/// Parse an unary operator as a prefix. Assumes the operator has been consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();

    // Compile the operand, so that it's placed on the stack.
    compiler.parse_precedence(Precedence::Unary);

    match operator {
        Token::Bang => compiler.emit_instruction(OpCode::Not),
        Token::Minus => compiler.emit_instruction(OpCode::Negate),
        Token::Tilde => compiler.emit_instruction(OpCode::BitNot),
        _ => unreachable!(),
    };
}

/// Parse a binary operator as an infix. Assumes the operator has been consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = get_rule(operator);

    compiler.parse_precedence(rule.higher_precedence());
    let opcode = match operator {
        Token::BangEqual => OpCode::NotEqual,
        Token::EqualEqual => OpCode::Equal,
        Token::Greater => OpCode::Greater,
        Token::GreaterEqual => OpCode::GreaterEqual,
        Token::Less => OpCode::Less,
        Token::LessEqual => OpCode::LessEqual,
        Token::Plus => OpCode::Add,
        Token::Minus => OpCode::Subtract,
        Token::Star => OpCode::Multiply,
        Token::Slash => OpCode::Divide,
        Token::Percent => OpCode::Modulo,
        Token::Ampersand => OpCode::BitAnd,
        Token::Pipe => OpCode::BitOr,
        Token::Caret => OpCode::BitXor,
        Token::ShiftLeft => OpCode::ShiftLeft,
        Token::ShiftRight => OpCode::ShiftRight,
        _ => unreachable!(),
    };
    compiler.emit_instruction(opcode);
}

/// Parse `and` as an infix. The left operand is already on the stack.
fn and(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(OpCode::JumpIfFalse);

    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);

    compiler.patch_jump(end_jump);
}

/// Parse `or` as an infix. The left operand is already on the stack.
fn or(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    let end_jump = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(else_jump);
    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::Or);

    compiler.patch_jump(end_jump);
}

/// Parse `condition ? a : b`. Both branches are right-associative.
fn ternary(compiler: &mut Compiler, _can_assign: bool) {
    let then_jump = compiler.emit_jump(OpCode::JumpIfFalse);
    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::Conditional);
    let else_jump = compiler.emit_jump(OpCode::Jump);

    compiler.patch_jump(then_jump);
    compiler.emit_instruction(OpCode::Pop);
    compiler.parser.consume(
        Token::Colon,
        "Expect ':' after then branch of conditional expression.",
    );
    compiler.parse_precedence(Precedence::Conditional);

    compiler.patch_jump(else_jump);
}

/// Parse a keyword literal as a prefix. Assumes the keyword has been consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_instruction(OpCode::False),
        Token::NoneKeyword => compiler.emit_instruction(OpCode::None),
        Token::True => compiler.emit_instruction(OpCode::True),
        _ => unreachable!(),
    };
}

/// Parse a string literal. Add it to the constant pool.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());

    // Access the string contents (without the quotes)
    let literal = compiler.parser.previous.text();
    debug_assert!(literal.len() >= 2);
    debug_assert!(literal.starts_with('"'));
    debug_assert!(literal.ends_with('"'));

    let last_index = literal.len() - 1;
    let contents = &literal[1..last_index];
    let string = compiler.intern(contents);
    compiler.emit_constant(string.into());
}

/// Parse a variable. It can be either a variable access or assignment, which is why `can_assign`
/// is required by all callbacks!
fn variable(compiler: &mut Compiler, can_assign: bool) {
    compiler.named_variable(compiler.parser.previous.text(), can_assign);
}

fn self_(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.classes.is_empty() {
        compiler.parser.error("Can't use 'self' outside of a class.");
        return;
    }

    // `self` is never assignable.
    variable(compiler, false);
}

/// Parse `super.method` or `super.method(args)`.
fn super_(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.classes.last() {
        None => compiler.parser.error("Can't use 'super' outside of a class."),
        Some(class) if !class.has_superclass => compiler
            .parser
            .error("Can't use 'super' in a class with no superclass."),
        _ => (),
    }

    compiler
        .parser
        .consume(Token::Dot, "Expect '.' after 'super'.");
    compiler
        .parser
        .consume(Token::Identifier, "Expect superclass method name.");
    let name = compiler.identifier_constant(compiler.parser.previous.text());

    compiler.named_variable("self", false);
    if compiler.match_and_advance(Token::LeftParen) {
        let argc = compiler.argument_list();
        compiler.named_variable("super", false);
        compiler
            .emit_instruction(OpCode::SuperInvoke)
            .with_operand(name)
            .with_operand(argc);
    } else {
        compiler.named_variable("super", false);
        compiler
            .emit_instruction(OpCode::GetSuper)
            .with_operand(name);
    }
}

/// Parse a call. The callee is already on the stack.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let argc = compiler.argument_list();
    compiler.emit_instruction(OpCode::Call).with_operand(argc);
}

/// Parse `.name`, `.name = value`, `.name op= value` or `.name(args)`.
fn dot(compiler: &mut Compiler, can_assign: bool) {
    compiler
        .parser
        .consume(Token::Identifier, "Expect property name after '.'.");
    let name = compiler.identifier_constant(compiler.parser.previous.text());

    if can_assign && compiler.match_and_advance(Token::Equal) {
        compiler.expression();
        compiler
            .emit_instruction(OpCode::SetProperty)
            .with_operand(name);
    } else if let Some(operator) = compiler.match_compound_operator(can_assign) {
        compiler.emit_instruction(OpCode::Dup);
        compiler
            .emit_instruction(OpCode::GetProperty)
            .with_operand(name);
        compiler.expression();
        compiler.emit_instruction(operator);
        compiler
            .emit_instruction(OpCode::SetProperty)
            .with_operand(name);
    } else if compiler.match_and_advance(Token::LeftParen) {
        let argc = compiler.argument_list();
        compiler
            .emit_instruction(OpCode::Invoke)
            .with_operand(name)
            .with_operand(argc);
    } else {
        compiler
            .emit_instruction(OpCode::GetProperty)
            .with_operand(name);
    }
}

/// Parse `::name` or `::name(args)`.
fn layer(compiler: &mut Compiler, _can_assign: bool) {
    compiler
        .parser
        .consume(Token::Identifier, "Expect member name after '::'.");
    let name = compiler.identifier_constant(compiler.parser.previous.text());

    if compiler.match_and_advance(Token::LeftParen) {
        let argc = compiler.argument_list();
        compiler
            .emit_instruction(OpCode::LayerCall)
            .with_operand(name)
            .with_operand(argc);
    } else {
        compiler
            .emit_instruction(OpCode::GetLayer)
            .with_operand(name);
    }
}

/// Parse `[a, b, c]`.
fn vector(compiler: &mut Compiler, _can_assign: bool) {
    let mut count = 0usize;
    while !compiler.parser.check(Token::RightBracket) {
        compiler.expression();
        if count == MAX_ARGUMENTS {
            compiler
                .parser
                .error("Can't have more than 255 elements in a vector literal.");
        }
        count += 1;
        if !compiler.match_and_advance(Token::Comma) {
            break;
        }
    }
    compiler
        .parser
        .consume(Token::RightBracket, "Expect ']' after vector elements.");

    compiler
        .emit_instruction(OpCode::VecNew)
        .with_operand(count.min(MAX_ARGUMENTS) as u8);
}

/// Parse `[index]` after a value, or `[index] = value`.
fn index(compiler: &mut Compiler, can_assign: bool) {
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightBracket, "Expect ']' after index.");

    if can_assign && compiler.match_and_advance(Token::Equal) {
        compiler.expression();
        compiler.emit_instruction(OpCode::IndexSet);
    } else if compiler.match_compound_operator(can_assign).is_some() {
        compiler
            .parser
            .error("Compound assignment to an index expression is not supported.");
    } else {
        compiler.emit_instruction(OpCode::IndexGet);
    }
}

/// Parse `|a, b| expression` or `|a| { block }`. Assumes the first `|` has been consumed.
fn lambda(compiler: &mut Compiler, _can_assign: bool) {
    let name = compiler.intern("lambda");
    compiler
        .frames
        .push(FnCompiler::new(FunctionKind::Lambda, Some(name)));
    compiler.begin_scope();

    if !compiler.match_and_advance(Token::Pipe) {
        loop {
            compiler.parameter();
            if !compiler.match_and_advance(Token::Comma) {
                break;
            }
        }
        compiler
            .parser
            .consume(Token::Pipe, "Expect '|' after lambda parameters.");
    }
    if compiler.match_and_advance(Token::Arrow) {
        compiler.type_annotation();
    }

    if compiler.match_and_advance(Token::LeftBrace) {
        compiler.block();
    } else {
        compiler.expression();
        compiler.emit_instruction(OpCode::Return);
        compiler.frame_mut().returned = true;
    }

    compiler.emit_closure();
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    /// Compiles `source`, returning the script function and whatever went to the error sink.
    fn compile_capturing(vm: &mut VM, source: &str) -> (crate::Result<ObjRef>, String) {
        vm.capture_output();
        let result = compile(source, vm);
        (result, vm.take_errors())
    }

    #[test]
    fn precedence_confidence_check() {
        // High-level precedence (C-like)
        assert!(Precedence::Assignment < Precedence::Conditional);
        assert!(Precedence::Conditional < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::And < Precedence::BitOr);
        assert!(Precedence::BitAnd < Precedence::Equality);
        assert!(Precedence::Equality < Precedence::Comparison);
        assert!(Precedence::Comparison < Precedence::Shift);
        assert!(Precedence::Shift < Precedence::Term);

        // PEDMAS
        // () has greater precedence than */
        assert!(Precedence::Call > Precedence::Factor);
        // */ has greater precedence than +-
        assert!(Precedence::Factor > Precedence::Term);

        // `and` should be one level of precedence higher than `or`
        assert_eq!(Precedence::And, Precedence::Or.higher_precedence());
        assert_eq!(Precedence::Factor, Precedence::Term.higher_precedence());
    }

    #[test]
    fn expression_statements_are_stack_neutral() {
        let mut vm = VM::default();
        let (result, errors) = compile_capturing(&mut vm, "1 + 2;");
        assert_eq!("", errors);
        let script = result.unwrap();
        let chunk = &vm.heap.function(script).chunk;

        assert_eq!(8, chunk.len());
        assert_eq!(Some(OpCode::Constant), chunk.opcode_at(0));
        assert_eq!(Value::I32(1), chunk.constant(chunk.read_byte(1) as usize));
        assert_eq!(Some(OpCode::Constant), chunk.opcode_at(2));
        assert_eq!(Value::I32(2), chunk.constant(chunk.read_byte(3) as usize));
        assert_eq!(Some(OpCode::Add), chunk.opcode_at(4));
        assert_eq!(Some(OpCode::Pop), chunk.opcode_at(5));
        assert_eq!(Some(OpCode::None), chunk.opcode_at(6));
        assert_eq!(Some(OpCode::Return), chunk.opcode_at(7));
    }

    #[test]
    fn numeric_annotations_convert() {
        let mut vm = VM::default();
        let (result, _) = compile_capturing(&mut vm, "var a: f64 = 1; var b: Vec = 2;");
        let script = result.unwrap();
        let chunk = &vm.heap.function(script).chunk;

        // The value comes first, then Convert, then DefineGlobal.
        assert_eq!(Some(OpCode::Convert), chunk.opcode_at(2));
        assert_eq!(NumericKind::F64 as u8, chunk.read_byte(3));
        assert_eq!(Some(OpCode::DefineGlobal), chunk.opcode_at(4));
        // No conversion for non-numeric annotations.
        assert_eq!(Some(OpCode::Constant), chunk.opcode_at(6));
        assert_eq!(Some(OpCode::DefineGlobal), chunk.opcode_at(8));
    }

    #[test]
    fn closures_describe_their_upvalues() {
        let mut vm = VM::default();
        let (result, errors) = compile_capturing(
            &mut vm,
            "fn outer() { var x = 1; fn inner() { return x; } }",
        );
        assert_eq!("", errors);
        let script = result.unwrap();

        // Script constants: "outer", then the function itself.
        let outer = vm.heap.function(script).chunk.constant(1).as_obj().unwrap();
        let chunk = &vm.heap.function(outer).chunk;
        assert_eq!(Some(OpCode::Closure), chunk.opcode_at(2));
        assert_eq!(1, chunk.read_short(3));
        // Local slot 1 (slot 0 is reserved).
        assert_eq!(UPVALUE_IS_LOCAL | 1, chunk.read_byte(5));

        let inner = chunk.constant(1).as_obj().unwrap();
        assert_eq!(1, vm.heap.function(inner).upvalue_count);
    }

    #[test]
    fn expression_lambdas_return_once() {
        let mut vm = VM::default();
        let (result, errors) = compile_capturing(&mut vm, "var f = |x| x;");
        assert_eq!("", errors);
        let script = result.unwrap();

        // Script constants: "f", then the lambda.
        let lambda = vm.heap.function(script).chunk.constant(1).as_obj().unwrap();
        let chunk = &vm.heap.function(lambda).chunk;
        assert_eq!(Some(OpCode::GetLocal), chunk.opcode_at(0));
        assert_eq!(Some(OpCode::Return), chunk.opcode_at(2));
        assert_eq!(3, chunk.len());
    }

    #[test]
    fn errors_report_their_location() {
        let mut vm = VM::default();
        let (result, errors) = compile_capturing(&mut vm, "var = 1;");
        assert_eq!(Err(InterpretationError::CompileError), result);
        assert_eq!("[line 1] Error at '=': Expect variable name.\n", errors);

        let (_, errors) = compile_capturing(&mut vm, "1 +");
        assert_eq!("[line 1] Error at end: Expect expression.\n", errors);

        let (_, errors) = compile_capturing(&mut vm, "\n\"oops");
        assert_eq!("[line 2] Error: Unterminated string.\n", errors);
    }

    #[test]
    fn panic_mode_reports_once_per_statement() {
        let mut vm = VM::default();
        let (_, errors) = compile_capturing(&mut vm, "var = 1 2 3;\nvar = 2;");
        assert_eq!(
            "[line 1] Error at '=': Expect variable name.\n\
             [line 2] Error at '=': Expect variable name.\n",
            errors
        );
    }

    #[test]
    fn semantic_errors() {
        let mut vm = VM::default();
        let cases = [
            ("1 = 2;", "Invalid assignment target."),
            ("a + b = 2;", "Invalid assignment target."),
            ("return 1;", "Can't return from top-level code."),
            ("self;", "Can't use 'self' outside of a class."),
            ("super.x;", "Can't use 'super' outside of a class."),
            ("class A { fn f() { super.f(); } }", "Can't use 'super' in a class with no superclass."),
            ("class A : A {}", "A class can't inherit from itself."),
            ("class A { fn init() { return 1; } }", "Can't return a value from an initializer."),
            ("break;", "Can't use 'break' outside of a loop."),
            ("fn f() { continue; }", "Can't use 'continue' outside of a loop."),
            ("{ var a = a; }", "Can't read local variable in its own initializer."),
            ("{ var a = 1; var a = 2; }", "Already a variable with this name in this scope."),
            ("var v = [1]; v[0] += 1;", "Compound assignment to an index expression is not supported."),
            ("match 1 { _ => 1, 2 => 2 }", "The wildcard arm must be the last arm of a match."),
            ("var x = 1; x ~= 1;", "Error at '~': Expect ';' after expression."),
        ];

        for (source, message) in cases {
            let (result, errors) = compile_capturing(&mut vm, source);
            assert!(result.is_err(), "{source} should not compile");
            assert!(
                errors.contains(message),
                "{source}: expected {message:?}, got {errors:?}"
            );
        }
    }

    #[test]
    fn too_many_locals() {
        let mut source = String::from("fn f() {");
        for i in 0..256 {
            source.push_str(&format!("var v{i};"));
        }
        source.push('}');

        let mut vm = VM::default();
        let (_, errors) = compile_capturing(&mut vm, &source);
        assert!(errors.contains("Too many local variables in function."));
    }

    #[test]
    fn many_constants_use_the_long_form() {
        let source: String = (0..300).map(|i| format!("{i}.5;")).collect();

        let mut vm = VM::default();
        let (result, errors) = compile_capturing(&mut vm, &source);
        assert_eq!("", errors);
        let script = result.unwrap();
        let chunk = &vm.heap.function(script).chunk;
        assert_eq!(300, chunk.constants.len());
        // The 257th statement is the first that needs a two-byte index.
        let offset = 256 * 3;
        assert_eq!(Some(OpCode::ConstantLong), chunk.opcode_at(offset));
        assert_eq!(256, chunk.read_short(offset + 1));
    }
}
