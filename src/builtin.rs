//! Builtin types: `Vec` and `str`, registered through the same [TypeSpec] mechanism an embedder
//! would use.

use crate::fault;
use crate::native::{Arity, NativeFn};
use crate::object::{Obj, ObjKind, ObjRef, ObjVec};
use crate::operator::{values_equal, BinaryOp, OperatorTable};
use crate::value::Value;
use crate::vm::{Fallible, VM};

/// Everything needed to register a type with [VM::register_type].
pub struct TypeSpec {
    /// The global name of the type.
    pub name: &'static str,
    /// The object kind this type describes, if any. Objects of this kind find their methods in
    /// this type.
    pub kind: Option<ObjKind>,
    /// Native methods. The receiver is passed as the first argument.
    pub methods: Vec<NativeMethod>,
    /// Operators for `kind`, merged over its current table.
    pub operators: Option<OperatorTable>,
}

pub struct NativeMethod {
    pub name: &'static str,
    pub arity: Arity,
    pub function: NativeFn,
}

impl NativeMethod {
    pub fn new(name: &'static str, arity: Arity, function: NativeFn) -> Self {
        NativeMethod {
            name,
            arity,
            function,
        }
    }
}

pub(crate) fn install(vm: &mut VM) {
    vm.register_type(vec_type());
    vm.register_type(str_type());
}

/// Checks that an index value is an integer inside `0..len`.
pub(crate) fn checked_index(index: Value, len: usize) -> Fallible<usize> {
    let Some(n) = index.as_integer() else {
        fault!("Index must be an integer, found '{}'.", index.scalar_type_name());
    };
    match usize::try_from(n) {
        Ok(i) if i < len => Ok(i),
        _ => fault!("Index {n} out of bounds (len={len})."),
    }
}

/////////////////////////////////////////////// Vec ///////////////////////////////////////////////

fn vec_type() -> TypeSpec {
    TypeSpec {
        name: "Vec",
        kind: Some(ObjKind::Vec),
        methods: vec![
            NativeMethod::new("new", Arity::Exact(0), vec_new),
            NativeMethod::new("get", Arity::Exact(1), vec_get),
            NativeMethod::new("set", Arity::Exact(2), vec_set),
            NativeMethod::new("push", Arity::Exact(1), vec_push),
            NativeMethod::new("pop", Arity::Exact(0), vec_pop),
            NativeMethod::new("insert", Arity::Exact(2), vec_insert),
            NativeMethod::new("remove", Arity::Exact(1), vec_remove),
            NativeMethod::new("extend", Arity::Exact(1), vec_extend),
            NativeMethod::new("clear", Arity::Exact(0), vec_clear),
            NativeMethod::new("reverse", Arity::Exact(0), vec_reverse),
            NativeMethod::new("len", Arity::Exact(0), vec_len),
            NativeMethod::new("first", Arity::Exact(0), vec_first),
            NativeMethod::new("last", Arity::Exact(0), vec_last),
            NativeMethod::new("contains", Arity::Exact(1), vec_contains),
        ],
        operators: Some(
            OperatorTable::new()
                .with_binary(BinaryOp::Add, vec_concat)
                .with_binary(BinaryOp::Equal, vec_equal)
                .with_binary(BinaryOp::NotEqual, vec_not_equal),
        ),
    }
}

/// Returns the receiver's elements, or fails if the receiver is not a Vec.
fn elements(vm: &mut VM, receiver: Value) -> Fallible<&mut Vec<Value>> {
    match vm.heap.kind_of(receiver).zip(receiver.as_obj()) {
        Some((ObjKind::Vec, reference)) => Ok(&mut vm.heap.vector_mut(reference).elements),
        _ => fault!(
            "Expected a Vec receiver, found '{}'.",
            vm.heap.type_name(receiver)
        ),
    }
}

fn as_vec(vm: &VM, value: Value) -> Option<ObjRef> {
    value
        .as_obj()
        .filter(|&reference| vm.heap.get(reference).kind() == ObjKind::Vec)
}

fn vec_new(vm: &mut VM, _args: &[Value]) -> Fallible<Value> {
    Ok(vm.alloc(Obj::Vec(ObjVec::default())).into())
}

fn vec_get(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let elements = elements(vm, args[0])?;
    let i = checked_index(args[1], elements.len())?;
    Ok(elements[i])
}

fn vec_set(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let elements = elements(vm, args[0])?;
    let i = checked_index(args[1], elements.len())?;
    elements[i] = args[2];
    Ok(Value::None)
}

fn vec_push(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    elements(vm, args[0])?.push(args[1]);
    Ok(Value::None)
}

fn vec_pop(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    Ok(elements(vm, args[0])?.pop().unwrap_or_default())
}

fn vec_insert(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let elements = elements(vm, args[0])?;
    // Inserting at the very end is allowed.
    let i = checked_index(args[1], elements.len() + 1)?;
    elements.insert(i, args[2]);
    Ok(Value::None)
}

fn vec_remove(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let elements = elements(vm, args[0])?;
    let i = checked_index(args[1], elements.len())?;
    Ok(elements.remove(i))
}

fn vec_extend(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let Some(other) = as_vec(vm, args[1]) else {
        fault!("extend() expects a Vec, found '{}'.", vm.heap.type_name(args[1]));
    };
    let extra = vm.heap.vector(other).elements.clone();
    elements(vm, args[0])?.extend(extra);
    Ok(Value::None)
}

fn vec_clear(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    elements(vm, args[0])?.clear();
    Ok(Value::None)
}

fn vec_reverse(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    elements(vm, args[0])?.reverse();
    Ok(Value::None)
}

fn vec_len(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let len = elements(vm, args[0])?.len();
    Ok(Value::I32(len as i32))
}

fn vec_first(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    Ok(elements(vm, args[0])?.first().copied().unwrap_or_default())
}

fn vec_last(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    Ok(elements(vm, args[0])?.last().copied().unwrap_or_default())
}

fn vec_contains(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let candidates = elements(vm, args[0])?.clone();
    let found = candidates
        .into_iter()
        .any(|element| values_equal(vm, element, args[1]));
    Ok(Value::Bool(found))
}

/// `a + b` for two Vecs: a new Vec with the elements of both.
fn vec_concat(vm: &mut VM, lhs: Value, rhs: Value) -> Fallible<Value> {
    let (Some(a), Some(b)) = (as_vec(vm, lhs), as_vec(vm, rhs)) else {
        fault!(
            "Can only concatenate Vec with Vec, found '{}' and '{}'.",
            vm.heap.type_name(lhs),
            vm.heap.type_name(rhs)
        );
    };
    let mut elements = vm.heap.vector(a).elements.clone();
    elements.extend_from_slice(&vm.heap.vector(b).elements);
    Ok(vm.alloc(Obj::Vec(ObjVec { elements })).into())
}

fn vec_equal(vm: &mut VM, lhs: Value, rhs: Value) -> Fallible<Value> {
    let (Some(a), Some(b)) = (as_vec(vm, lhs), as_vec(vm, rhs)) else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(vectors_equal(vm, a, b, &mut Vec::new())))
}

/// Element-wise equality. `comparing` holds the pairs of Vecs being compared further up; meeting
/// one of them again counts as equal, so Vecs that contain themselves still compare.
fn vectors_equal(
    vm: &mut VM,
    a: ObjRef,
    b: ObjRef,
    comparing: &mut Vec<(ObjRef, ObjRef)>,
) -> bool {
    if a == b || comparing.contains(&(a, b)) {
        return true;
    }

    let left = vm.heap.vector(a).elements.clone();
    let right = vm.heap.vector(b).elements.clone();
    if left.len() != right.len() {
        return false;
    }

    comparing.push((a, b));
    let equal = left
        .into_iter()
        .zip(right)
        .all(|(x, y)| match (as_vec(vm, x), as_vec(vm, y)) {
            (Some(x), Some(y)) => vectors_equal(vm, x, y, comparing),
            _ => values_equal(vm, x, y),
        });
    comparing.pop();
    equal
}

fn vec_not_equal(vm: &mut VM, lhs: Value, rhs: Value) -> Fallible<Value> {
    let equal = vec_equal(vm, lhs, rhs)?;
    Ok(Value::Bool(!matches!(equal, Value::Bool(true))))
}

/////////////////////////////////////////////// str ///////////////////////////////////////////////

fn str_type() -> TypeSpec {
    TypeSpec {
        name: "str",
        kind: Some(ObjKind::String),
        methods: vec![
            NativeMethod::new("len", Arity::Exact(0), str_len),
            NativeMethod::new("contains", Arity::Exact(1), str_contains),
        ],
        operators: Some(
            OperatorTable::new()
                .with_binary(BinaryOp::Add, str_concat)
                .with_binary(BinaryOp::Equal, str_equal)
                .with_binary(BinaryOp::NotEqual, str_not_equal),
        ),
    }
}

fn receiver_str(vm: &VM, receiver: Value) -> Fallible<&str> {
    match vm.heap.value_as_str(receiver) {
        Some(s) => Ok(s),
        None => fault!(
            "Expected a str receiver, found '{}'.",
            vm.heap.type_name(receiver)
        ),
    }
}

fn str_len(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let len = receiver_str(vm, args[0])?.chars().count();
    Ok(Value::I32(len as i32))
}

fn str_contains(vm: &mut VM, args: &[Value]) -> Fallible<Value> {
    let haystack = receiver_str(vm, args[0])?;
    let Some(needle) = vm.heap.value_as_str(args[1]) else {
        fault!("contains() expects a str, found '{}'.", vm.heap.type_name(args[1]));
    };
    Ok(Value::Bool(haystack.contains(needle)))
}

/// `+` with a string on either side concatenates the display forms.
fn str_concat(vm: &mut VM, lhs: Value, rhs: Value) -> Fallible<Value> {
    let text = format!("{}{}", vm.heap.display(lhs), vm.heap.display(rhs));
    Ok(vm.intern(&text).into())
}

/// Strings are interned, so equal contents means the same handle.
fn str_equal(_vm: &mut VM, lhs: Value, rhs: Value) -> Fallible<Value> {
    Ok(Value::Bool(lhs == rhs))
}

fn str_not_equal(_vm: &mut VM, lhs: Value, rhs: Value) -> Fallible<Value> {
    Ok(Value::Bool(lhs != rhs))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_checks() {
        assert_eq!(Ok(1), checked_index(Value::I32(1), 2));
        assert_eq!(Ok(0), checked_index(Value::I64(0), 1));
        assert!(checked_index(Value::I32(2), 2).is_err());
        assert!(checked_index(Value::I32(-1), 2).is_err());
        assert!(checked_index(Value::F64(0.0), 2).is_err());
    }

    #[test]
    fn string_concatenation_displays_both_sides() {
        let mut vm = VM::default();
        let a: Value = vm.intern("a").into();
        vm.push(a);
        let result = str_concat(&mut vm, Value::I32(1), a).unwrap();
        assert_eq!(Some("1a"), vm.heap.value_as_str(result));
        let result = str_concat(&mut vm, a, Value::F64(2.0)).unwrap();
        assert_eq!(Some("a2.0"), vm.heap.value_as_str(result));
    }

    #[test]
    fn vec_equality_is_element_wise() {
        let mut vm = VM::default();
        let mut vector = |elements| {
            let reference = vm.alloc(Obj::Vec(ObjVec { elements }));
            vm.push(reference.into());
            reference
        };
        let a = vector(vec![Value::I32(1), Value::F64(2.0)]);
        let b = vector(vec![Value::F64(1.0), Value::I32(2)]);
        let c = vector(vec![Value::I32(1)]);
        assert_eq!(Ok(Value::Bool(true)), vec_equal(&mut vm, a.into(), b.into()));
        assert_eq!(Ok(Value::Bool(true)), vec_not_equal(&mut vm, a.into(), c.into()));
        assert_eq!(Ok(Value::Bool(false)), vec_equal(&mut vm, a.into(), Value::None));
    }

    #[test]
    fn self_referencing_vecs_compare_without_recursing_forever() {
        let mut vm = VM::default();
        let mut vector = |elements| {
            let reference = vm.alloc(Obj::Vec(ObjVec { elements }));
            vm.push(reference.into());
            reference
        };
        let a = vector(vec![Value::I32(1)]);
        let b = vector(vec![Value::I32(1)]);
        let c = vector(vec![Value::I32(2)]);
        for v in [a, b, c] {
            vm.heap.vector_mut(v).elements.push(v.into());
        }

        assert_eq!(Ok(Value::Bool(true)), vec_equal(&mut vm, a.into(), b.into()));
        assert_eq!(Ok(Value::Bool(false)), vec_equal(&mut vm, a.into(), c.into()));
        assert_eq!(Ok(Value::Bool(true)), vec_not_equal(&mut vm, b.into(), c.into()));
    }
}
