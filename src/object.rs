//! Heap objects: every value that is too big or too mutable to live on the stack.
//!
//! Objects live in the [Heap](crate::gc::Heap) arena and are referred to by [ObjRef] handles.
//! Each kind of object is its own struct; [Obj] is the sum of them all.

use enum_map::Enum;

use crate::chunk::Chunk;
use crate::native::{Arity, NativeFn};
use crate::table::Table;
use crate::value::Value;

/// A handle to an object in the [Heap](crate::gc::Heap).
///
/// Handles are plain indices: copying one does not keep anything alive. Only reachability from
/// the GC roots does that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

/// Every kind of heap object. The kind selects the object's operator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum ObjKind {
    String,
    Fn,
    Closure,
    Upvalue,
    Class,
    Instance,
    Struct,
    Enum,
    EnumInstance,
    Vec,
    Pair,
    BoundMethod,
    Native,
    Type,
}

/// A heap object.
#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Fn(ObjFn),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    Struct(ObjStruct),
    Enum(ObjEnum),
    EnumInstance(ObjEnumInstance),
    Vec(ObjVec),
    Pair(ObjPair),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
    Type(ObjType),
}

/// An immutable, interned string.
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function.
#[derive(Debug, Default)]
pub struct ObjFn {
    /// `None` for the top-level script.
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

/// A function together with the variables it captured.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// Where a captured variable currently lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueState {
    /// Still on the value stack, at this index.
    Open(usize),
    /// Copied off the stack once its scope ended.
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

/// A struct declaration, or a value built from one. Both have the same fixed field set.
#[derive(Debug)]
pub struct ObjStruct {
    pub name: ObjRef,
    /// Field names in declaration order (inherited fields first).
    pub field_names: Vec<ObjRef>,
    pub fields: Table,
}

#[derive(Debug)]
pub struct ObjEnum {
    pub name: ObjRef,
    /// Member names in declaration order; the position is the ordinal.
    pub member_names: Vec<ObjRef>,
    /// Member name to a [ObjPair] of `(ordinal, payload arity)`.
    pub members: Table,
}

#[derive(Debug)]
pub struct ObjEnumInstance {
    pub enumeration: ObjRef,
    pub member: ObjRef,
    pub ordinal: i32,
    pub payload: Vec<Value>,
}

#[derive(Debug, Default)]
pub struct ObjVec {
    pub elements: Vec<Value>,
}

#[derive(Debug)]
pub struct ObjPair {
    pub first: Value,
    pub second: Value,
}

/// A method that remembers which receiver it was looked up on.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    /// A closure or a native.
    pub method: Value,
}

/// A function implemented in Rust.
pub struct ObjNative {
    pub name: Box<str>,
    pub arity: Arity,
    pub function: NativeFn,
}

/// Marks a builtin type such as `Vec`. Its class (if any) carries the native methods.
#[derive(Debug)]
pub struct ObjType {
    pub name: ObjRef,
    pub class: Option<ObjRef>,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl ObjRef {
    /// Only the heap mints handles.
    #[inline(always)]
    pub(crate) fn from_index(index: usize) -> ObjRef {
        ObjRef(u32::try_from(index).expect("heap exceeded u32::MAX objects"))
    }

    /// The arena slot of this handle.
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Obj {
    /// Which kind of object this is.
    pub fn kind(&self) -> ObjKind {
        match self {
            Obj::String(_) => ObjKind::String,
            Obj::Fn(_) => ObjKind::Fn,
            Obj::Closure(_) => ObjKind::Closure,
            Obj::Upvalue(_) => ObjKind::Upvalue,
            Obj::Class(_) => ObjKind::Class,
            Obj::Instance(_) => ObjKind::Instance,
            Obj::Struct(_) => ObjKind::Struct,
            Obj::Enum(_) => ObjKind::Enum,
            Obj::EnumInstance(_) => ObjKind::EnumInstance,
            Obj::Vec(_) => ObjKind::Vec,
            Obj::Pair(_) => ObjKind::Pair,
            Obj::BoundMethod(_) => ObjKind::BoundMethod,
            Obj::Native(_) => ObjKind::Native,
            Obj::Type(_) => ObjKind::Type,
        }
    }

    /// Calls `visit` with every value this object refers to. This is what the collector follows
    /// when it blackens an object.
    pub fn for_each_reference(&self, mut visit: impl FnMut(Value)) {
        match self {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Fn(function) => {
                if let Some(name) = function.name {
                    visit(name.into());
                }
                function.chunk.constants.iter().copied().for_each(visit);
            }
            Obj::Closure(closure) => {
                visit(closure.function.into());
                closure.upvalues.iter().for_each(|&u| visit(u.into()));
            }
            Obj::Upvalue(upvalue) => {
                if let UpvalueState::Closed(value) = upvalue.state {
                    visit(value);
                }
            }
            Obj::Class(class) => {
                visit(class.name.into());
                class.methods.for_each_reference(&mut visit);
            }
            Obj::Instance(instance) => {
                visit(instance.class.into());
                instance.fields.for_each_reference(&mut visit);
            }
            Obj::Struct(structure) => {
                visit(structure.name.into());
                structure.field_names.iter().for_each(|&n| visit(n.into()));
                structure.fields.for_each_reference(&mut visit);
            }
            Obj::Enum(enumeration) => {
                visit(enumeration.name.into());
                enumeration.member_names.iter().for_each(|&n| visit(n.into()));
                enumeration.members.for_each_reference(&mut visit);
            }
            Obj::EnumInstance(instance) => {
                visit(instance.enumeration.into());
                visit(instance.member.into());
                instance.payload.iter().copied().for_each(visit);
            }
            Obj::Vec(vector) => vector.elements.iter().copied().for_each(visit),
            Obj::Pair(pair) => {
                visit(pair.first);
                visit(pair.second);
            }
            Obj::BoundMethod(bound) => {
                visit(bound.receiver);
                visit(bound.method);
            }
            Obj::Type(marker) => {
                visit(marker.name.into());
                if let Some(class) = marker.class {
                    visit(class.into());
                }
            }
        }
    }

    /// A rough count of the bytes this object owns, used to pace the collector.
    pub fn heap_size(&self) -> usize {
        use std::mem::size_of;
        let value = size_of::<Value>();
        let owned = match self {
            Obj::String(string) => string.chars.len(),
            Obj::Fn(function) => function.chunk.len() * 2 + function.chunk.constants.len() * value,
            Obj::Closure(closure) => closure.upvalues.len() * size_of::<ObjRef>(),
            Obj::Class(class) => class.methods.capacity() * 2 * value,
            Obj::Instance(instance) => instance.fields.capacity() * 2 * value,
            Obj::Struct(structure) => {
                structure.fields.capacity() * 2 * value
                    + structure.field_names.len() * size_of::<ObjRef>()
            }
            Obj::Enum(enumeration) => {
                enumeration.members.capacity() * 2 * value
                    + enumeration.member_names.len() * size_of::<ObjRef>()
            }
            Obj::EnumInstance(instance) => instance.payload.len() * value,
            Obj::Vec(vector) => vector.elements.capacity() * value,
            Obj::Native(native) => native.name.len(),
            Obj::Upvalue(_) | Obj::Pair(_) | Obj::BoundMethod(_) | Obj::Type(_) => 0,
        };
        size_of::<Obj>() + owned
    }
}

impl ObjKind {
    /// The name Joker programs see for objects of this kind.
    pub fn type_name(self) -> &'static str {
        match self {
            ObjKind::String => "str",
            ObjKind::Fn | ObjKind::Closure | ObjKind::BoundMethod | ObjKind::Native => "fn",
            ObjKind::Upvalue => "upvalue",
            ObjKind::Class => "class",
            ObjKind::Instance => "instance",
            ObjKind::Struct => "struct",
            ObjKind::Enum => "enum",
            ObjKind::EnumInstance => "enum instance",
            ObjKind::Vec => "Vec",
            ObjKind::Pair => "pair",
            ObjKind::Type => "type",
        }
    }
}

impl ObjClosure {
    /// A closure with no captured variables yet. The VM fills `upvalues` in.
    pub fn new(function: ObjRef) -> Self {
        ObjClosure {
            function,
            upvalues: Vec::new(),
        }
    }
}

impl ObjClass {
    pub fn new(name: ObjRef) -> Self {
        ObjClass {
            name,
            methods: Table::new(),
        }
    }
}

impl ObjInstance {
    pub fn new(class: ObjRef) -> Self {
        ObjInstance {
            class,
            fields: Table::new(),
        }
    }
}

impl ObjStruct {
    pub fn new(name: ObjRef) -> Self {
        ObjStruct {
            name,
            field_names: Vec::new(),
            fields: Table::new(),
        }
    }
}

impl ObjEnum {
    pub fn new(name: ObjRef) -> Self {
        ObjEnum {
            name,
            member_names: Vec::new(),
            members: Table::new(),
        }
    }
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn references_of_a_closure() {
        let closure = Obj::Closure(ObjClosure {
            function: ObjRef(1),
            upvalues: vec![ObjRef(2), ObjRef(3)],
        });

        let mut seen = vec![];
        closure.for_each_reference(|v| seen.push(v));
        assert_eq!(
            Vec::<Value>::from([ObjRef(1).into(), ObjRef(2).into(), ObjRef(3).into()]),
            seen
        );
    }

    #[test]
    fn open_upvalues_keep_nothing_alive() {
        let open = Obj::Upvalue(ObjUpvalue {
            state: UpvalueState::Open(4),
        });
        let mut count = 0;
        open.for_each_reference(|_| count += 1);
        assert_eq!(0, count);

        let closed = Obj::Upvalue(ObjUpvalue {
            state: UpvalueState::Closed(ObjRef(9).into()),
        });
        let mut seen = vec![];
        closed.for_each_reference(|v| seen.push(v));
        assert_eq!(vec![Value::Obj(ObjRef(9))], seen);
    }

    #[test]
    fn sizes_grow_with_contents() {
        let small = Obj::Vec(ObjVec::default());
        let big = Obj::Vec(ObjVec {
            elements: vec![Value::None; 100],
        });
        assert!(big.heap_size() > small.heap_size());
    }
}
