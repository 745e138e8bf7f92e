//! The bytecode virtual machine.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use enum_map::EnumMap;
use smallvec::SmallVec;

use crate::builtin::{checked_index, TypeSpec};
use crate::chunk::{OpCode, UPVALUE_IS_LOCAL};
use crate::config::Config;
use crate::error::{Fault, InterpretationError};
use crate::gc::Heap;
use crate::native::{Arity, NativeFn};
use crate::object::*;
use crate::operator::{self, BinaryOp, OperatorTable, UnaryOp};
use crate::table::{hash_string, Table};
use crate::value::{NumericKind, Value};
use crate::{builtin, compiler, debug, fault, native};

/// The result of anything that can fail while bytecode runs.
pub type Fallible<T> = Result<T, Fault>;

/// Used as the minimum capacity of the stack.
/// Since we're using a growable [Vec], the stack size can be arbitrarily large.
const STACK_SIZE: usize = 256;

/// One active function call.
#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjRef,
    /// The closure's function, cached.
    function: ObjRef,
    /// Index into the function's chunk of the next byte to be executed.
    ip: usize,
    /// Stack index of slot 0: the callee, or the receiver of a method.
    slots: usize,
}

/// Where program output and error reports go.
enum Sink {
    Stream(Box<dyn Write>),
    Buffer(String),
}

/// Maintains state for the Joker virtual machine.
pub struct VM {
    pub heap: Heap,
    /// Value stack -- modified as elements are pushed and popped from the stack.
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Type markers by name, created on demand by `type_of`.
    types: Table,
    /// Upvalues still pointing into the stack, ordered by slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    pub(crate) operators: EnumMap<ObjKind, OperatorTable>,
    /// The class holding the native methods of each builtin kind.
    builtin_classes: EnumMap<ObjKind, Option<ObjRef>>,
    config: Config,
    started: Instant,
    output: Sink,
    errors: Sink,
}

////////////////////////////////////////// Public API /////////////////////////////////////////////

impl VM {
    /// Creates a VM with the natives and builtin types installed.
    pub fn new(config: Config) -> VM {
        let mut heap = Heap::new(config.gc.clone());
        let init_string = heap.insert(Obj::String(ObjString {
            chars: "init".into(),
            hash: hash_string("init"),
        }));
        heap.add_interned(init_string);

        let mut vm = VM {
            heap,
            stack: Vec::with_capacity(STACK_SIZE),
            frames: Vec::with_capacity(config.max_frames),
            globals: Table::new(),
            types: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            operators: EnumMap::default(),
            builtin_classes: EnumMap::default(),
            config,
            started: Instant::now(),
            output: Sink::Stream(Box::new(io::stdout())),
            errors: Sink::Stream(Box::new(io::stderr())),
        };
        native::install(&mut vm);
        builtin::install(&mut vm);
        vm
    }

    /// Compiles and runs some Joker source code.
    ///
    /// Globals survive between calls, which is what the REPL relies on. After a runtime error the
    /// stack is reset, so the VM can be used again.
    pub fn interpret(&mut self, source: &str) -> crate::Result<()> {
        let function = compiler::compile(source, self)?;

        self.push(function.into());
        let closure = self.alloc(Obj::Closure(ObjClosure::new(function)));
        self.pop();
        self.push(closure.into());

        let result = self.call_closure(closure, 0).and_then(|()| self.run());
        if let Err(fault) = result {
            self.report_fault(&fault);
            self.reset();
            return Err(InterpretationError::RuntimeError);
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the value of a global variable, if it is defined.
    pub fn global(&self, name: &str) -> Option<Value> {
        let name = self.heap.find_interned(name, hash_string(name))?;
        self.globals.get(self.heap.key(name))
    }

    /// Redirects program output and error reports into buffers. See [VM::take_output] and
    /// [VM::take_errors].
    pub fn capture_output(&mut self) {
        self.output = Sink::Buffer(String::new());
        self.errors = Sink::Buffer(String::new());
    }

    /// Returns everything printed since the last call. Empty unless output is captured.
    pub fn take_output(&mut self) -> String {
        self.output.take()
    }

    /// Returns every error reported since the last call. Empty unless output is captured.
    pub fn take_errors(&mut self) -> String {
        self.errors.take()
    }

    /// Writes program output, such as the text of `print`.
    pub fn write_output(&mut self, text: &str) -> Fallible<()> {
        self.output
            .write(text)
            .map_err(|error| Fault::new(format!("Could not write output: {error}.")))
    }

    /// Time elapsed since the VM was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Pushes a [Value] on to the value stack. Anything on the stack survives garbage collection.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops and returns the top [Value] on the value stack.
    ///
    /// # Panics
    ///
    /// Panics when the value stack is empty. Given well-formed Joker bytecode, a pop cannot occur
    /// when the value stack is empty; therefore the interpreter panics if it is in this state.
    #[inline(always)]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack is empty")
    }

    /// Moves an object onto the heap, collecting garbage first if it is time to.
    ///
    /// Whatever the new object refers to is kept alive, but any other value the caller is holding
    /// must be reachable from the stack or the globals.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.alloc_with_roots(obj, |_| {})
    }

    /// Returns the interned string with these contents, creating it if needed.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        self.intern_with_roots(chars, |_| {})
    }

    /// Defines a global native function.
    pub fn define_native(&mut self, name: &str, arity: Arity, function: NativeFn) {
        let name_string = self.intern(name);
        self.push(name_string.into());
        let native = self.alloc(Obj::Native(ObjNative {
            name: name.into(),
            arity,
            function,
        }));
        self.push(native.into());

        let key = self.heap.key(name_string);
        self.globals.set(key, native.into());

        self.pop();
        self.pop();
    }

    /// Registers a builtin type: a global class holding its native methods, and a type marker
    /// with the same name. If the type describes an object kind, values of that kind find their
    /// methods in it and use its operators.
    pub fn register_type(&mut self, spec: TypeSpec) {
        let name = self.intern(spec.name);
        self.push(name.into());
        let class = self.alloc(Obj::Class(ObjClass::new(name)));
        self.push(class.into());

        for method in spec.methods {
            let method_name = self.intern(method.name);
            self.push(method_name.into());
            let native = self.alloc(Obj::Native(ObjNative {
                name: method.name.into(),
                arity: method.arity,
                function: method.function,
            }));
            let key = self.heap.key(method_name);
            self.heap.class_mut(class).methods.set(key, native.into());
            self.pop();
        }

        let marker = self.alloc(Obj::Type(ObjType {
            name,
            class: Some(class),
        }));
        let key = self.heap.key(name);
        self.types.set(key, marker.into());
        self.globals.set(key, class.into());

        if let Some(kind) = spec.kind {
            self.builtin_classes[kind] = Some(class);
            if let Some(operators) = &spec.operators {
                self.operators[kind].merge(operators);
            }
        }

        self.pop();
        self.pop();
    }

    /// Returns the type marker with this name, creating it if needed.
    pub fn type_marker(&mut self, name: &str) -> ObjRef {
        let name = self.intern(name);
        let key = self.heap.key(name);
        if let Some(Value::Obj(marker)) = self.types.get(key) {
            return marker;
        }

        self.push(name.into());
        let marker = self.alloc(Obj::Type(ObjType { name, class: None }));
        self.pop();
        self.types.set(key, marker.into());
        marker
    }
}

impl Default for VM {
    fn default() -> Self {
        VM::new(Config::default())
    }
}

///////////////////////////////////////// Garbage collection //////////////////////////////////////

impl VM {
    /// Like [VM::alloc], but lets the caller mark roots the VM does not know about.
    pub(crate) fn alloc_with_roots(
        &mut self,
        obj: Obj,
        extra_roots: impl FnOnce(&mut Heap),
    ) -> ObjRef {
        if self.heap.should_collect() {
            self.mark_roots();
            extra_roots(&mut self.heap);
            obj.for_each_reference(|value| self.heap.mark_value(value));
            self.heap.collect();
        }

        self.heap.insert(obj)
    }

    pub(crate) fn intern_with_roots(
        &mut self,
        chars: &str,
        extra_roots: impl FnOnce(&mut Heap),
    ) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.heap.find_interned(chars, hash) {
            return existing;
        }

        let string = self.alloc_with_roots(
            Obj::String(ObjString {
                chars: chars.into(),
                hash,
            }),
            extra_roots,
        );
        self.heap.add_interned(string);
        string
    }

    fn mark_roots(&mut self) {
        let heap = &mut self.heap;
        for &value in self.stack.iter() {
            heap.mark_value(value);
        }
        for frame in self.frames.iter() {
            heap.mark_object(frame.closure);
        }
        for &upvalue in self.open_upvalues.iter() {
            heap.mark_object(upvalue);
        }
        heap.mark_table(&self.globals);
        heap.mark_table(&self.types);
        heap.mark_object(self.init_string);
        for &class in self.builtin_classes.values().flatten() {
            heap.mark_object(class);
        }
    }
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl VM {
    /// The main opcode interpreter loop.
    fn run(&mut self) -> Fallible<()> {
        use OpCode::*;

        loop {
            if self.config.trace_execution {
                self.trace();
            }

            let byte = self.read_byte();
            let opcode = OpCode::try_from(byte).unwrap_or_else(|()| {
                panic!("fetched invalid opcode {byte} at {}", self.frame().ip - 1)
            });

            match opcode {
                Constant => {
                    let index = self.read_byte() as usize;
                    let constant = self.constant(index);
                    self.push(constant);
                }
                ConstantLong => {
                    let index = self.read_short() as usize;
                    let constant = self.constant(index);
                    self.push(constant);
                }
                None => self.push(Value::None),
                True => self.push(Value::Bool(true)),
                False => self.push(Value::Bool(false)),
                Pop => {
                    self.pop();
                }
                Dup => self.push(self.peek(0)),

                GetLocal => {
                    let slot = self.frame().slots + self.read_byte() as usize;
                    self.push(self.stack[slot]);
                }
                SetLocal => {
                    let slot = self.frame().slots + self.read_byte() as usize;
                    self.stack[slot] = self.peek(0);
                }
                GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(self.heap.key(name)) {
                        Some(value) => self.push(value),
                        Option::None => {
                            fault!("Undefined variable '{}'.", self.heap.as_str(name))
                        }
                    }
                }
                DefineGlobal => {
                    let name = self.read_string();
                    let key = self.heap.key(name);
                    self.globals.set(key, self.peek(0));
                    self.pop();
                }
                SetGlobal => {
                    let name = self.read_string();
                    let key = self.heap.key(name);
                    if self.globals.set(key, self.peek(0)) {
                        self.globals.delete(key);
                        fault!("Undefined variable '{}'.", self.heap.as_str(name));
                    }
                }
                GetUpvalue => {
                    let upvalue = self.frame_upvalue();
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                SetUpvalue => {
                    let upvalue = self.frame_upvalue();
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value)
                        }
                    }
                }

                GetProperty => {
                    let name = self.read_string();
                    let value = self.get_property(self.peek(0), name)?;
                    self.pop();
                    self.push(value);
                }
                SetProperty => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.set_property(self.peek(1), name, value)?;
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop_object();
                    let bound = self.bind_method(superclass, name, self.peek(0))?;
                    self.pop();
                    self.push(bound);
                }
                GetLayer => {
                    let name = self.read_string();
                    let value = self.get_layer(self.peek(0), name)?;
                    self.pop();
                    self.push(value);
                }

                Equal => self.binary_op(BinaryOp::Equal)?,
                NotEqual => self.binary_op(BinaryOp::NotEqual)?,
                Greater => self.binary_op(BinaryOp::Greater)?,
                GreaterEqual => self.binary_op(BinaryOp::GreaterEqual)?,
                Less => self.binary_op(BinaryOp::Less)?,
                LessEqual => self.binary_op(BinaryOp::LessEqual)?,
                Add => self.binary_op(BinaryOp::Add)?,
                Subtract => self.binary_op(BinaryOp::Subtract)?,
                Multiply => self.binary_op(BinaryOp::Multiply)?,
                Divide => self.binary_op(BinaryOp::Divide)?,
                Modulo => self.binary_op(BinaryOp::Modulo)?,
                BitAnd => self.binary_op(BinaryOp::BitAnd)?,
                BitOr => self.binary_op(BinaryOp::BitOr)?,
                BitXor => self.binary_op(BinaryOp::BitXor)?,
                ShiftLeft => self.binary_op(BinaryOp::ShiftLeft)?,
                ShiftRight => self.binary_op(BinaryOp::ShiftRight)?,
                Not => self.unary_op(UnaryOp::Not)?,
                Negate => self.unary_op(UnaryOp::Negate)?,
                BitNot => self.unary_op(UnaryOp::BitNot)?,
                Convert => {
                    let byte = self.read_byte();
                    let kind = NumericKind::try_from(byte)
                        .unwrap_or_else(|()| panic!("invalid numeric kind {byte}"));
                    let value = self.peek(0);
                    if value.is_number() {
                        let Some(converted) = value.convert(kind) else {
                            fault!("Cannot convert {value} to {}.", kind.name());
                        };
                        self.pop();
                        self.push(converted);
                    }
                }

                Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip += offset;
                }
                JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    match self.peek(0) {
                        Value::Bool(true) => (),
                        Value::Bool(false) => self.frame_mut().ip += offset,
                        other => fault!(
                            "Condition must be a boolean, found '{}'.",
                            self.heap.type_name(other)
                        ),
                    }
                }
                JumpIfNotEqual => {
                    let offset = self.read_short() as usize;
                    let (value, pattern) = (self.peek(1), self.peek(0));
                    let equal = operator::values_equal(self, value, pattern);
                    self.pop();
                    if !equal {
                        self.frame_mut().ip += offset;
                    }
                }
                Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_mut().ip -= offset;
                }

                Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(self.peek(argc), argc)?;
                }
                Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop_object();
                    self.invoke_from_class(superclass, name, argc)?;
                }
                LayerCall => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.layer_call(name, argc)?;
                }
                Closure => {
                    let index = self.read_short() as usize;
                    let Value::Obj(function) = self.constant(index) else {
                        panic!("closure constant is not a function");
                    };
                    self.make_closure(function);
                }
                CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("returning from a call frame");
                    self.close_upvalues(frame.slots);
                    self.stack.truncate(frame.slots);

                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }

                Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(ObjClass::new(name)));
                    self.push(class.into());
                }
                Method => {
                    let name = self.read_string();
                    let key = self.heap.key(name);
                    let method = self.peek(0);
                    let class = self.object_at(1);
                    self.heap.class_mut(class).methods.set(key, method);
                    self.pop();
                }
                Inherit => {
                    let superclass = self.peek(1);
                    if self.heap.kind_of(superclass) != Some(ObjKind::Class) {
                        fault!("Superclass must be a class.");
                    }
                    let methods = self.heap.class(self.object_at(1)).methods.clone();
                    let subclass = self.object_at(0);
                    methods.add_all(&mut self.heap.class_mut(subclass).methods);
                    self.pop();
                }
                Struct => {
                    let name = self.read_string();
                    let declaration = self.alloc(Obj::Struct(ObjStruct::new(name)));
                    self.push(declaration.into());
                }
                Member => {
                    let name = self.read_string();
                    let key = self.heap.key(name);
                    let value = self.peek(0);
                    let declaration = self.object_at(1);
                    let structure = self.heap.structure_mut(declaration);
                    if !structure.fields.contains_key(key) {
                        structure.field_names.push(name);
                    }
                    structure.fields.set(key, value);
                    self.pop();
                }
                StructInherit => {
                    if self.heap.kind_of(self.peek(1)) != Some(ObjKind::Struct) {
                        fault!("Superstruct must be a struct.");
                    }
                    let parent = self.heap.structure(self.object_at(1));
                    let (names, fields) = (parent.field_names.clone(), parent.fields.clone());
                    let child = self.object_at(0);
                    let structure = self.heap.structure_mut(child);
                    for name in names {
                        if !structure.field_names.contains(&name) {
                            structure.field_names.push(name);
                        }
                    }
                    fields.add_all(&mut structure.fields);
                    self.pop();
                    self.pop();
                }
                Enum => {
                    let name = self.read_string();
                    let enumeration = self.alloc(Obj::Enum(ObjEnum::new(name)));
                    self.push(enumeration.into());
                }
                EnumMember => {
                    let name = self.read_string();
                    let arity = self.read_byte();
                    let enumeration = self.object_at(0);
                    let ordinal = self.heap.enumeration(enumeration).member_names.len();
                    let pair = self.alloc(Obj::Pair(ObjPair {
                        first: Value::I32(ordinal as i32),
                        second: Value::I32(arity as i32),
                    }));
                    let key = self.heap.key(name);
                    let enumeration = self.heap.enumeration_mut(enumeration);
                    enumeration.member_names.push(name);
                    enumeration.members.set(key, pair.into());
                }
                EnumMatch => {
                    let name = self.read_string();
                    let offset = self.read_short() as usize;
                    if !self.enum_matches(name)? {
                        self.frame_mut().ip += offset;
                    }
                }
                EnumBind => {
                    let count = self.read_byte() as usize;
                    let instance = self.object_at(0);
                    let payload = self.heap.enum_instance(instance).payload.clone();
                    if payload.len() != count {
                        fault!(
                            "Pattern binds {count} values but the member carries {}.",
                            payload.len()
                        );
                    }
                    self.stack.extend(payload);
                }
                VecNew => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let elements = self.stack[start..].to_vec();
                    let vector = self.alloc(Obj::Vec(ObjVec { elements }));
                    self.stack.truncate(start);
                    self.push(vector.into());
                }
                IndexGet => {
                    let value = self.index_get(self.peek(1), self.peek(0))?;
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                IndexSet => {
                    let value = self.peek(0);
                    self.index_set(self.peek(2), self.peek(1), value)?;
                    self.stack.truncate(self.stack.len() - 3);
                    self.push(value);
                }
            }
        }
    }

    /// Prints the value stack and the next instruction to stderr.
    fn trace(&self) {
        let mut line = String::from("          ");
        for &value in self.stack.iter() {
            let _ = write!(line, "[ {} ]", self.heap.display(value));
        }
        eprintln!("{line}");

        let frame = self.frame();
        let chunk = &self.heap.function(frame.function).chunk;
        let mut listing = String::new();
        let _ = debug::disassemble_instruction(&mut listing, &self.heap, chunk, frame.ip);
        eprint!("{listing}");
    }

    /// Prints a runtime error with a stack trace, innermost call first.
    fn report_fault(&mut self, fault: &Fault) {
        let mut report = format!("{}\n", fault.message());
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let line = function
                .chunk
                .line_number_for(frame.ip.saturating_sub(1))
                .unwrap_or_default();
            let _ = match function.name {
                Some(name) => writeln!(report, "[line {line}] in {}()", self.heap.as_str(name)),
                None => writeln!(report, "[line {line}] in script"),
            };
        }
        self.report_error(report.trim_end());
    }

    /// Writes one diagnostic line to the error sink.
    pub(crate) fn report_error(&mut self, message: &str) {
        let _ = self.errors.write(&format!("{message}\n"));
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    ////////////////////////////////////////// Operators //////////////////////////////////////////

    /// Operands stay on the stack while the operator runs, since it may allocate.
    fn binary_op(&mut self, op: BinaryOp) -> Fallible<()> {
        let (lhs, rhs) = (self.peek(1), self.peek(0));
        let result = operator::binary(self, op, lhs, rhs)?;
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn unary_op(&mut self, op: UnaryOp) -> Fallible<()> {
        let operand = self.peek(0);
        let result = operator::unary(self, op, operand)?;
        self.pop();
        self.push(result);
        Ok(())
    }

    ////////////////////////////////////////// Properties /////////////////////////////////////////

    /// `receiver.name`: a field, else a method bound to the receiver.
    fn get_property(&mut self, receiver: Value, name: ObjRef) -> Fallible<Value> {
        let key = self.heap.key(name);
        let class = match receiver.as_obj().map(|reference| self.heap.get(reference)) {
            Some(Obj::Instance(instance)) => match instance.fields.get(key) {
                Some(value) => return Ok(value),
                None => instance.class,
            },
            Some(Obj::Struct(structure)) => match structure.fields.get(key) {
                Some(value) => return Ok(value),
                None => fault!(
                    "Undefined field '{}' in struct '{}'.",
                    self.heap.as_str(name),
                    self.heap.as_str(structure.name)
                ),
            },
            _ => match self.builtin_class(receiver) {
                Some(class) => class,
                None => fault!("Only instances and structs have properties."),
            },
        };

        self.bind_method(class, name, receiver)
    }

    /// `receiver.name = value`. Instances accept new fields; structs only have their declared
    /// ones.
    fn set_property(&mut self, receiver: Value, name: ObjRef, value: Value) -> Fallible<()> {
        let key = self.heap.key(name);
        let Some(reference) = receiver.as_obj() else {
            fault!("Only instances and structs have fields.");
        };

        match self.heap.get_mut(reference) {
            Obj::Instance(instance) => {
                instance.fields.set(key, value);
                return Ok(());
            }
            Obj::Struct(structure) if structure.fields.contains_key(key) => {
                structure.fields.set(key, value);
                return Ok(());
            }
            Obj::Struct(_) => (),
            _ => fault!("Only instances and structs have fields."),
        }

        let structure = self.heap.structure(reference);
        fault!(
            "Undefined field '{}' in struct '{}'.",
            self.heap.as_str(name),
            self.heap.as_str(structure.name)
        )
    }

    /// Looks a method up in `class` and binds it to `receiver`.
    fn bind_method(&mut self, class: ObjRef, name: ObjRef, receiver: Value) -> Fallible<Value> {
        let key = self.heap.key(name);
        let Some(method) = self.heap.class(class).methods.get(key) else {
            fault!("Undefined property '{}'.", self.heap.as_str(name));
        };

        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        Ok(bound.into())
    }

    /// The class with the native methods for this value's kind, if it has one.
    fn builtin_class(&self, value: Value) -> Option<ObjRef> {
        self.heap
            .kind_of(value)
            .and_then(|kind| self.builtin_classes[kind])
    }

    /// `Target::name` without a call: a payload-less enum member, or a class's method.
    fn get_layer(&mut self, target: Value, name: ObjRef) -> Fallible<Value> {
        match (self.heap.kind_of(target), target.as_obj()) {
            (Some(ObjKind::Enum), Some(enumeration)) => {
                let (ordinal, arity) = self.enum_member(enumeration, name)?;
                if arity != 0 {
                    fault!(
                        "Member '{}' carries {arity} values; construct it with a call.",
                        self.heap.as_str(name)
                    );
                }
                let instance = self.alloc(Obj::EnumInstance(ObjEnumInstance {
                    enumeration,
                    member: name,
                    ordinal,
                    payload: Vec::new(),
                }));
                Ok(instance.into())
            }
            (Some(ObjKind::Class | ObjKind::Type), Some(reference)) => {
                self.static_method(reference, name)
            }
            _ => fault!(
                "Only enums, classes and types have members, found '{}'.",
                self.heap.type_name(target)
            ),
        }
    }

    /// `Target::name(args)`: constructs an enum member, or calls a method with the class itself
    /// as the receiver.
    fn layer_call(&mut self, name: ObjRef, argc: usize) -> Fallible<()> {
        let target = self.peek(argc);
        match (self.heap.kind_of(target), target.as_obj()) {
            (Some(ObjKind::Enum), Some(enumeration)) => {
                let (ordinal, arity) = self.enum_member(enumeration, name)?;
                if arity != argc {
                    fault!(
                        "Member '{}' expects {arity} values but got {argc}.",
                        self.heap.as_str(name)
                    );
                }

                let start = self.stack.len() - argc;
                let payload = self.stack[start..].to_vec();
                let instance = self.alloc(Obj::EnumInstance(ObjEnumInstance {
                    enumeration,
                    member: name,
                    ordinal,
                    payload,
                }));
                self.stack.truncate(start - 1);
                self.push(instance.into());
                Ok(())
            }
            (Some(ObjKind::Class | ObjKind::Type), Some(reference)) => {
                let method = self.static_method(reference, name)?;
                self.call_method(method, argc)
            }
            _ => fault!(
                "Only enums, classes and types have members, found '{}'.",
                self.heap.type_name(target)
            ),
        }
    }

    /// The unbound method `name` of a class, or of the class behind a type marker.
    fn static_method(&self, target: ObjRef, name: ObjRef) -> Fallible<Value> {
        let class = match self.heap.get(target) {
            Obj::Type(marker) => marker.class,
            _ => Some(target),
        };

        let method = class.and_then(|class| {
            self.heap
                .class(class)
                .methods
                .get(self.heap.key(name))
        });
        match method {
            Some(method) => Ok(method),
            None => fault!("Undefined member '{}'.", self.heap.as_str(name)),
        }
    }

    /// Returns the ordinal and payload arity of an enum member.
    fn enum_member(&self, enumeration: ObjRef, name: ObjRef) -> Fallible<(i32, usize)> {
        let declaration = self.heap.enumeration(enumeration);
        let Some(Value::Obj(pair)) = declaration.members.get(self.heap.key(name)) else {
            fault!(
                "Undefined member '{}' in enum '{}'.",
                self.heap.as_str(name),
                self.heap.as_str(declaration.name)
            );
        };

        match *self.heap.pair(pair) {
            ObjPair {
                first: Value::I32(ordinal),
                second: Value::I32(arity),
            } => Ok((ordinal, arity as usize)),
            _ => unreachable!("enum members are (ordinal, arity) pairs"),
        }
    }

    /// Pops the enum of a pattern and tells whether the value below it is `Enum::name`.
    fn enum_matches(&mut self, name: ObjRef) -> Fallible<bool> {
        let target = self.pop();
        let Some(enumeration) = target
            .as_obj()
            .filter(|_| self.heap.kind_of(target) == Some(ObjKind::Enum))
        else {
            fault!(
                "Pattern must name an enum member, found '{}'.",
                self.heap.type_name(target)
            );
        };
        let (ordinal, _) = self.enum_member(enumeration, name)?;

        let scrutinee = self.peek(0);
        Ok(match (self.heap.kind_of(scrutinee), scrutinee.as_obj()) {
            (Some(ObjKind::EnumInstance), Some(reference)) => {
                let instance = self.heap.enum_instance(reference);
                instance.enumeration == enumeration && instance.ordinal == ordinal
            }
            _ => false,
        })
    }

    //////////////////////////////////////////// Indexing /////////////////////////////////////////

    fn index_get(&mut self, target: Value, index: Value) -> Fallible<Value> {
        let character = match target.as_obj().map(|reference| self.heap.get(reference)) {
            Some(Obj::Vec(vector)) => {
                let i = checked_index(index, vector.elements.len())?;
                return Ok(vector.elements[i]);
            }
            Some(Obj::String(string)) => {
                let i = checked_index(index, string.chars.chars().count())?;
                let Some(character) = string.chars.chars().nth(i) else {
                    unreachable!("index was checked against the length");
                };
                character
            }
            _ => fault!("Cannot index into '{}'.", self.heap.type_name(target)),
        };

        let mut buffer = [0; 4];
        Ok(self.intern(character.encode_utf8(&mut buffer)).into())
    }

    fn index_set(&mut self, target: Value, index: Value, value: Value) -> Fallible<()> {
        if self.heap.kind_of(target) != Some(ObjKind::Vec) {
            fault!(
                "Only Vec supports index assignment, found '{}'.",
                self.heap.type_name(target)
            );
        }
        let Some(reference) = target.as_obj() else {
            unreachable!("a Vec is an object");
        };

        let elements = &mut self.heap.vector_mut(reference).elements;
        let i = checked_index(index, elements.len())?;
        elements[i] = value;
        Ok(())
    }

    ///////////////////////////////////////////// Calls ///////////////////////////////////////////

    /// Calls whatever is `argc` slots below the top of the stack.
    fn call_value(&mut self, callee: Value, argc: usize) -> Fallible<()> {
        let Some(reference) = callee.as_obj() else {
            fault!("Can only call functions and classes.");
        };

        match self.heap.get(reference).kind() {
            ObjKind::Closure => self.call_closure(reference, argc),
            ObjKind::Native => self.call_native(reference, argc, false),
            ObjKind::BoundMethod => {
                let bound = self.heap.bound_method(reference);
                let (receiver, method) = (bound.receiver, bound.method);
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_method(method, argc)
            }
            ObjKind::Class => {
                // The class stays reachable through the instance.
                let instance = self.alloc(Obj::Instance(ObjInstance::new(reference)));
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = instance.into();

                let init = self.heap.key(self.init_string);
                match self.heap.class(reference).methods.get(init) {
                    Some(initializer) => self.call_method(initializer, argc),
                    None if argc != 0 => {
                        fault!("Expected 0 arguments but got {argc}.")
                    }
                    None => Ok(()),
                }
            }
            ObjKind::Struct => self.instantiate_struct(reference, argc),
            _ => fault!("Can only call functions and classes."),
        }
    }

    /// Calls a method whose receiver is already in the callee slot.
    fn call_method(&mut self, method: Value, argc: usize) -> Fallible<()> {
        match (self.heap.kind_of(method), method.as_obj()) {
            (Some(ObjKind::Native), Some(native)) => self.call_native(native, argc, true),
            _ => self.call_value(method, argc),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Fallible<()> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if argc != arity {
            fault!("Expected {arity} arguments but got {argc}.");
        }

        if self.frames.len() >= self.config.max_frames {
            fault!("Stack overflow.");
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    /// Runs a native to completion. Methods get their receiver as the first argument.
    fn call_native(&mut self, native: ObjRef, argc: usize, with_receiver: bool) -> Fallible<()> {
        let native = self.heap.native(native);
        let (arity, function) = (native.arity, native.function);
        if !arity.accepts(argc) {
            fault!("Expected {arity} arguments but got {argc}.");
        }

        let start = self.stack.len() - argc - usize::from(with_receiver);
        let args: SmallVec<[Value; 8]> = self.stack[start..].iter().copied().collect();
        let result = function(self, &args)?;

        self.stack.truncate(self.stack.len() - argc - 1);
        self.push(if result.is_null() { Value::None } else { result });
        Ok(())
    }

    /// `receiver.name(args)`. A field holding a callable wins over a method.
    fn invoke(&mut self, name: ObjRef, argc: usize) -> Fallible<()> {
        let receiver = self.peek(argc);
        let key = self.heap.key(name);

        let (field, class) = match receiver.as_obj().map(|reference| self.heap.get(reference)) {
            Some(Obj::Instance(instance)) => (instance.fields.get(key), Some(instance.class)),
            Some(Obj::Struct(structure)) => match structure.fields.get(key) {
                Some(field) => (Some(field), None),
                None => fault!(
                    "Undefined field '{}' in struct '{}'.",
                    self.heap.as_str(name),
                    self.heap.as_str(structure.name)
                ),
            },
            _ => (None, self.builtin_class(receiver)),
        };

        if let Some(field) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field;
            return self.call_value(field, argc);
        }
        match class {
            Some(class) => self.invoke_from_class(class, name, argc),
            None => fault!("Only instances have methods."),
        }
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: usize) -> Fallible<()> {
        let key = self.heap.key(name);
        let Some(method) = self.heap.class(class).methods.get(key) else {
            fault!("Undefined property '{}'.", self.heap.as_str(name));
        };
        self.call_method(method, argc)
    }

    /// Builds a struct value from a declaration and one argument per field.
    fn instantiate_struct(&mut self, declaration: ObjRef, argc: usize) -> Fallible<()> {
        let declaration = self.heap.structure(declaration);
        let (name, field_names) = (declaration.name, declaration.field_names.clone());
        if argc != field_names.len() {
            fault!("Expected {} arguments but got {argc}.", field_names.len());
        }

        let start = self.stack.len() - argc;
        let mut fields = Table::new();
        for (&field, &value) in field_names.iter().zip(self.stack[start..].iter()) {
            fields.set(self.heap.key(field), value);
        }

        let value = self.alloc(Obj::Struct(ObjStruct {
            name,
            field_names,
            fields,
        }));
        self.stack.truncate(start - 1);
        self.push(value.into());
        Ok(())
    }

    //////////////////////////////////////////// Closures /////////////////////////////////////////

    /// Creates a closure over `function`, capturing what its descriptor bytes ask for.
    fn make_closure(&mut self, function: ObjRef) {
        let closure = self.alloc(Obj::Closure(ObjClosure::new(function)));
        self.push(closure.into());

        for _ in 0..self.heap.function(function).upvalue_count {
            let descriptor = self.read_byte();
            let index = (descriptor & !UPVALUE_IS_LOCAL) as usize;
            let upvalue = if descriptor & UPVALUE_IS_LOCAL != 0 {
                self.capture_upvalue(self.frame().slots + index)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index]
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
    }

    /// Returns the open upvalue for a stack slot, creating it if no closure captured it yet.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let position = self
            .open_upvalues
            .partition_point(|&upvalue| self.open_slot(upvalue) < slot);
        if let Some(&existing) = self.open_upvalues.get(position) {
            if self.open_slot(existing) == slot {
                return existing;
            }
        }

        let created = self.alloc(Obj::Upvalue(ObjUpvalue {
            state: UpvalueState::Open(slot),
        }));
        self.open_upvalues.insert(position, created);
        created
    }

    /// Moves every open upvalue at or above `from_slot` off the stack.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&upvalue) = self.open_upvalues.last() {
            let slot = self.open_slot(upvalue);
            if slot < from_slot {
                break;
            }
            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(self.stack[slot]);
            self.open_upvalues.pop();
        }
    }

    fn open_slot(&self, upvalue: ObjRef) -> usize {
        match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => slot,
            UpvalueState::Closed(_) => unreachable!("closed upvalue in the open list"),
        }
    }

    ///////////////////////////////////////////// Aliases /////////////////////////////////////////

    #[inline(always)]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("there is an active call frame")
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("there is an active call frame")
    }

    /// Fetches the next byte of the current function, **AND** increments the instruction pointer.
    #[inline(always)]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("there is an active call frame");
        let byte = self.heap.function(frame.function).chunk.read_byte(frame.ip);
        frame.ip += 1;
        byte
    }

    #[inline(always)]
    fn read_short(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("there is an active call frame");
        let short = self.heap.function(frame.function).chunk.read_short(frame.ip);
        frame.ip += 2;
        short
    }

    #[inline]
    fn constant(&self, index: usize) -> Value {
        self.heap.function(self.frame().function).chunk.constant(index)
    }

    /// Reads a one-byte constant index and returns the name stored there.
    fn read_string(&mut self) -> ObjRef {
        let index = self.read_byte() as usize;
        match self.constant(index) {
            Value::Obj(name) => name,
            other => panic!("expected a name constant, found {other:?}"),
        }
    }

    /// Reads an upvalue index and returns that upvalue of the running closure.
    fn frame_upvalue(&mut self) -> ObjRef {
        let index = self.read_byte() as usize;
        self.heap.closure(self.frame().closure).upvalues[index]
    }

    /// Returns the value `distance` slots below the top of the stack.
    #[inline(always)]
    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// Like [VM::peek], for values the compiler guarantees are objects.
    fn object_at(&self, distance: usize) -> ObjRef {
        match self.peek(distance) {
            Value::Obj(reference) => reference,
            other => panic!("expected an object on the stack, found {other:?}"),
        }
    }

    fn pop_object(&mut self) -> ObjRef {
        let reference = self.object_at(0);
        self.pop();
        reference
    }
}

impl Sink {
    fn write(&mut self, text: &str) -> io::Result<()> {
        match self {
            Sink::Stream(stream) => {
                stream.write_all(text.as_bytes())?;
                stream.flush()
            }
            Sink::Buffer(buffer) => {
                buffer.push_str(text);
                Ok(())
            }
        }
    }

    fn take(&mut self) -> String {
        match self {
            Sink::Stream(_) => String::new(),
            Sink::Buffer(buffer) => std::mem::take(buffer),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Runs a program, returning its output or its error report.
    fn run(source: &str) -> Result<String, String> {
        let mut vm = VM::default();
        vm.capture_output();
        match vm.interpret(source) {
            Ok(()) => Ok(vm.take_output()),
            Err(_) => Err(vm.take_errors()),
        }
    }

    #[test]
    fn globals_persist_between_runs() {
        let mut vm = VM::default();
        vm.capture_output();
        vm.interpret("var a = 40;").unwrap();
        vm.interpret("a = a + 2;").unwrap();
        assert_eq!(Some(Value::I32(42)), vm.global("a"));
        assert_eq!(None, vm.global("b"));
    }

    #[test]
    fn runtime_errors_carry_a_stack_trace() {
        let error = run("fn f() {\n  return 1 + true;\n}\nf();").unwrap_err();
        assert_eq!(
            "Unsupported operand types for '+': 'i32' and 'bool'.\n\
             [line 2] in f()\n\
             [line 4] in script\n",
            error
        );
    }

    #[test]
    fn the_vm_recovers_after_a_runtime_error() {
        let mut vm = VM::default();
        vm.capture_output();
        assert_eq!(
            Err(InterpretationError::RuntimeError),
            vm.interpret("undefined;")
        );
        assert_eq!(
            "Undefined variable 'undefined'.\n[line 1] in script\n",
            vm.take_errors()
        );
        vm.interpret("println(1);").unwrap();
        assert_eq!("1\n", vm.take_output());
    }

    #[test]
    fn assigning_an_undefined_global_does_not_define_it() {
        let mut vm = VM::default();
        vm.capture_output();
        assert!(vm.interpret("x = 1;").is_err());
        assert_eq!(None, vm.global("x"));
    }

    #[test]
    fn conditions_must_be_booleans() {
        let error = run("if 1 { println(1); }").unwrap_err();
        assert!(error.starts_with("Condition must be a boolean, found 'i32'."));
    }

    #[test]
    fn deep_recursion_overflows() {
        let error = run("fn f(n) { return f(n + 1); } f(0);").unwrap_err();
        assert!(error.starts_with("Stack overflow.\n"));
    }

    #[test]
    fn arity_is_checked() {
        let error = run("fn f(a, b) {} f(1);").unwrap_err();
        assert!(error.starts_with("Expected 2 arguments but got 1."));
        let error = run("clock(1);").unwrap_err();
        assert!(error.starts_with("Expected 0 arguments but got 1."));
    }

    #[test]
    fn upvalues_are_shared_until_closed() {
        let output = run("
            fn pair() {
                var n = 0;
                fn inc() { n += 1; }
                fn get() { return n; }
                return [inc, get];
            }
            var p = pair();
            p[0]();
            p[0]();
            println(p[1]());
        ");
        assert_eq!(Ok("2\n".to_owned()), output);
    }

    #[test]
    fn stress_collection_keeps_live_values() {
        let config = Config {
            gc: crate::gc::GcConfig {
                stress: true,
                log: false,
                ..Default::default()
            },
            ..Config::default()
        };
        let mut vm = VM::new(config);
        vm.capture_output();
        vm.interpret(
            "
            class Node { fn init(value, next) { self.value = value; self.next = next; } }
            var list = None;
            for (var i = 0; i < 50; i += 1) { list = Node(\"n\" + i, list); }
            var total = 0;
            while list != None { total += 1; list = list.next; }
            println(total);
        ",
        )
        .unwrap();
        assert_eq!("50\n", vm.take_output());
        assert!(vm.heap.stats().collections > 0);
    }

    #[test]
    fn type_markers_are_shared() {
        let mut vm = VM::default();
        let a = vm.type_marker("i32");
        let b = vm.type_marker("i32");
        assert_eq!(a, b);
        assert_eq!("<type i32>", vm.heap.display(a.into()).to_string());
    }
}
