//! Operator semantics.
//!
//! Every object kind has an [OperatorTable]. Binary operators are dispatched on the left operand
//! if it is an object, else on the right operand if that is one, else on the scalar rules in this
//! module. Empty slots mean "unsupported". Equality never fails: an object kind that does not
//! define `==` compares by identity.

use enum_map::{Enum, EnumMap};

use crate::error::Fault;
use crate::fault;
use crate::value::Value;
use crate::vm::{Fallible, VM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum UnaryOp {
    Negate,
    Not,
    BitNot,
}

pub type BinaryHandler = fn(&mut VM, Value, Value) -> Fallible<Value>;
pub type UnaryHandler = fn(&mut VM, Value) -> Fallible<Value>;

/// The operators one object kind supports. `None` slots are unsupported.
#[derive(Debug, Clone, Default)]
pub struct OperatorTable {
    pub binary: EnumMap<BinaryOp, Option<BinaryHandler>>,
    pub unary: EnumMap<UnaryOp, Option<UnaryHandler>>,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl BinaryOp {
    /// The operator as written in source code.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::ShiftLeft => "<<",
            BinaryOp::ShiftRight => ">>",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
        }
    }
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Negate => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        }
    }
}

impl OperatorTable {
    /// A table where everything is unsupported.
    pub fn new() -> Self {
        OperatorTable::default()
    }

    /// Builder-style: supports `op` with `handler`.
    pub fn with_binary(mut self, op: BinaryOp, handler: BinaryHandler) -> Self {
        self.binary[op] = Some(handler);
        self
    }

    pub fn with_unary(mut self, op: UnaryOp, handler: UnaryHandler) -> Self {
        self.unary[op] = Some(handler);
        self
    }

    /// Copies every supported slot of `other` over this table.
    pub fn merge(&mut self, other: &OperatorTable) {
        for (op, handler) in other.binary.iter() {
            if handler.is_some() {
                self.binary[op] = *handler;
            }
        }
        for (op, handler) in other.unary.iter() {
            if handler.is_some() {
                self.unary[op] = *handler;
            }
        }
    }
}

/// Applies a binary operator. Operands must still be reachable (on the stack) because handlers
/// may allocate.
pub fn binary(vm: &mut VM, op: BinaryOp, lhs: Value, rhs: Value) -> Fallible<Value> {
    let kind = vm.heap.kind_of(lhs).or_else(|| vm.heap.kind_of(rhs));
    let Some(kind) = kind else {
        return scalar_binary(op, lhs, rhs);
    };

    match (vm.operators[kind].binary[op], op) {
        (Some(handler), _) => handler(vm, lhs, rhs),
        (None, BinaryOp::Equal) => Ok(Value::Bool(lhs == rhs)),
        (None, BinaryOp::NotEqual) => Ok(Value::Bool(lhs != rhs)),
        (None, _) => fault!(
            "Unsupported operand types for '{}': '{}' and '{}'.",
            op.symbol(),
            vm.heap.type_name(lhs),
            vm.heap.type_name(rhs)
        ),
    }
}

/// Applies a unary operator.
pub fn unary(vm: &mut VM, op: UnaryOp, operand: Value) -> Fallible<Value> {
    let Some(kind) = vm.heap.kind_of(operand) else {
        return scalar_unary(op, operand);
    };

    match vm.operators[kind].unary[op] {
        Some(handler) => handler(vm, operand),
        None => fault!(
            "Unsupported operand type for '{}': '{}'.",
            op.symbol(),
            vm.heap.type_name(operand)
        ),
    }
}

/// Language-level equality.
pub fn values_equal(vm: &mut VM, lhs: Value, rhs: Value) -> bool {
    if lhs.as_obj().is_some() && lhs == rhs {
        return true;
    }
    matches!(binary(vm, BinaryOp::Equal, lhs, rhs), Ok(Value::Bool(true)))
}

//////////////////////////////////////////// Scalars //////////////////////////////////////////////

/// Promotes two numbers to the wider of their kinds.
fn promote(lhs: Value, rhs: Value) -> Option<(Value, Value)> {
    let kind = lhs.numeric_kind()?.max(rhs.numeric_kind()?);
    Some((lhs.convert(kind)?, rhs.convert(kind)?))
}

fn scalar_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Fallible<Value> {
    use BinaryOp::*;
    match op {
        Equal => Ok(Value::Bool(scalar_equal(lhs, rhs))),
        NotEqual => Ok(Value::Bool(!scalar_equal(lhs, rhs))),
        Less | LessEqual | Greater | GreaterEqual => compare(op, lhs, rhs),
        Add | Subtract | Multiply | Divide | Modulo => arithmetic(op, lhs, rhs),
        BitAnd | BitOr | BitXor | ShiftLeft | ShiftRight => bitwise(op, lhs, rhs),
    }
}

fn scalar_equal(lhs: Value, rhs: Value) -> bool {
    if let Some(pair) = promote(lhs, rhs) {
        return match pair {
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            _ => unreachable!("promotion yields matching kinds"),
        };
    }

    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::None, other) | (other, Value::None) => other.is_none(),
        _ => false,
    }
}

fn compare(op: BinaryOp, lhs: Value, rhs: Value) -> Fallible<Value> {
    let Some(pair) = promote(lhs, rhs) else {
        fault!(
            "Operands must be numbers, found '{}' and '{}'.",
            lhs.scalar_type_name(),
            rhs.scalar_type_name()
        );
    };

    let ordering = match pair {
        (Value::I32(a), Value::I32(b)) => a.partial_cmp(&b),
        (Value::I64(a), Value::I64(b)) => a.partial_cmp(&b),
        (Value::F32(a), Value::F32(b)) => a.partial_cmp(&b),
        (Value::F64(a), Value::F64(b)) => a.partial_cmp(&b),
        _ => unreachable!("promotion yields matching kinds"),
    };

    // Comparisons involving NaN are all false.
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };

    let result = match op {
        BinaryOp::Less => ordering.is_lt(),
        BinaryOp::LessEqual => ordering.is_le(),
        BinaryOp::Greater => ordering.is_gt(),
        BinaryOp::GreaterEqual => ordering.is_ge(),
        _ => unreachable!("not a comparison: {op:?}"),
    };
    Ok(Value::Bool(result))
}

/// Generates checked integer arithmetic for one integer type.
macro_rules! integer_arithmetic {
    ($name:ident, $int:ty) => {
        fn $name(op: BinaryOp, a: $int, b: $int) -> Fallible<$int> {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Divide | BinaryOp::Modulo if b == 0 => fault!("Division by zero."),
                BinaryOp::Divide => a.checked_div(b),
                BinaryOp::Modulo => a.checked_rem(b),
                _ => unreachable!("not arithmetic: {op:?}"),
            };
            result.ok_or_else(|| Fault::new("Integer overflow."))
        }
    };
}

integer_arithmetic!(arithmetic_i32, i32);
integer_arithmetic!(arithmetic_i64, i64);

/// Floats follow IEEE 754, except that dividing by zero is an error.
fn arithmetic_float(op: BinaryOp, a: f64, b: f64) -> Fallible<f64> {
    Ok(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide | BinaryOp::Modulo if b == 0.0 => fault!("Division by zero."),
        BinaryOp::Divide => a / b,
        BinaryOp::Modulo => a % b,
        _ => unreachable!("not arithmetic: {op:?}"),
    })
}

fn arithmetic(op: BinaryOp, lhs: Value, rhs: Value) -> Fallible<Value> {
    let Some(pair) = promote(lhs, rhs) else {
        fault!(
            "Operands must be numbers, found '{}' and '{}'.",
            lhs.scalar_type_name(),
            rhs.scalar_type_name()
        );
    };

    Ok(match pair {
        (Value::I32(a), Value::I32(b)) => Value::I32(arithmetic_i32(op, a, b)?),
        (Value::I64(a), Value::I64(b)) => Value::I64(arithmetic_i64(op, a, b)?),
        (Value::F32(a), Value::F32(b)) => {
            Value::F32(arithmetic_float(op, a as f64, b as f64)? as f32)
        }
        (Value::F64(a), Value::F64(b)) => Value::F64(arithmetic_float(op, a, b)?),
        _ => unreachable!("promotion yields matching kinds"),
    })
}

macro_rules! integer_bitwise {
    ($name:ident, $int:ty) => {
        fn $name(op: BinaryOp, a: $int, b: $int) -> Fallible<$int> {
            Ok(match op {
                BinaryOp::BitAnd => a & b,
                BinaryOp::BitOr => a | b,
                BinaryOp::BitXor => a ^ b,
                BinaryOp::ShiftLeft | BinaryOp::ShiftRight => {
                    let Some(amount) = u32::try_from(b).ok().filter(|&n| n < <$int>::BITS) else {
                        fault!(
                            "Shift amount {b} is out of range for {}.",
                            stringify!($int)
                        );
                    };
                    if op == BinaryOp::ShiftLeft {
                        a << amount
                    } else {
                        a >> amount
                    }
                }
                _ => unreachable!("not bitwise: {op:?}"),
            })
        }
    };
}

integer_bitwise!(bitwise_i32, i32);
integer_bitwise!(bitwise_i64, i64);

fn bitwise(op: BinaryOp, lhs: Value, rhs: Value) -> Fallible<Value> {
    if !(lhs.is_integer() && rhs.is_integer()) {
        fault!(
            "Operands of '{}' must be integers, found '{}' and '{}'.",
            op.symbol(),
            lhs.scalar_type_name(),
            rhs.scalar_type_name()
        );
    }

    match (lhs, rhs) {
        (Value::I32(a), Value::I32(b)) => Ok(Value::I32(bitwise_i32(op, a, b)?)),
        _ => match (lhs.as_integer(), rhs.as_integer()) {
            (Some(a), Some(b)) => Ok(Value::I64(bitwise_i64(op, a, b)?)),
            _ => unreachable!("operands were checked to be integers"),
        },
    }
}

fn scalar_unary(op: UnaryOp, operand: Value) -> Fallible<Value> {
    match (op, operand) {
        (UnaryOp::Negate, Value::I32(n)) => n
            .checked_neg()
            .map(Value::I32)
            .ok_or_else(|| Fault::new("Integer overflow.")),
        (UnaryOp::Negate, Value::I64(n)) => n
            .checked_neg()
            .map(Value::I64)
            .ok_or_else(|| Fault::new("Integer overflow.")),
        (UnaryOp::Negate, Value::F32(x)) => Ok(Value::F32(-x)),
        (UnaryOp::Negate, Value::F64(x)) => Ok(Value::F64(-x)),
        (UnaryOp::Negate, other) => fault!(
            "Operand must be a number, found '{}'.",
            other.scalar_type_name()
        ),

        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Not, other) => fault!(
            "Operand must be a boolean, found '{}'.",
            other.scalar_type_name()
        ),

        (UnaryOp::BitNot, Value::I32(n)) => Ok(Value::I32(!n)),
        (UnaryOp::BitNot, Value::I64(n)) => Ok(Value::I64(!n)),
        (UnaryOp::BitNot, other) => fault!(
            "Operand must be an integer, found '{}'.",
            other.scalar_type_name()
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn apply(op: BinaryOp, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Fallible<Value> {
        scalar_binary(op, lhs.into(), rhs.into())
    }

    #[test]
    fn promotion() {
        assert_eq!(Ok(Value::I32(3)), apply(BinaryOp::Add, 1, 2));
        assert_eq!(Ok(Value::I64(3)), apply(BinaryOp::Add, 1, 2i64));
        assert_eq!(Ok(Value::F64(3.0)), apply(BinaryOp::Add, 1, 2.0));
        assert_eq!(Ok(Value::F32(3.0)), apply(BinaryOp::Add, 1i64, 2.0f32));
        assert_eq!(Ok(Value::F64(3.5)), apply(BinaryOp::Add, 1.5f32, 2.0));
    }

    #[test]
    fn integer_overflow_is_an_error() {
        assert!(apply(BinaryOp::Add, i32::MAX, 1).is_err());
        assert!(apply(BinaryOp::Multiply, i64::MAX, 2i64).is_err());
        assert!(apply(BinaryOp::Divide, i32::MIN, -1).is_err());
        assert!(scalar_unary(UnaryOp::Negate, Value::I32(i32::MIN)).is_err());
        assert_eq!(
            Ok(Value::I64(i32::MAX as i64 + 1)),
            apply(BinaryOp::Add, i32::MAX as i64, 1)
        );
    }

    #[test]
    fn division_by_zero() {
        let error = apply(BinaryOp::Divide, 5, 0).unwrap_err();
        assert_eq!("Division by zero.", error.message());
        assert!(apply(BinaryOp::Modulo, 5i64, 0i64).is_err());
        assert!(apply(BinaryOp::Divide, 5.0, 0.0).is_err());
        assert_eq!(Ok(Value::F64(1.5)), apply(BinaryOp::Modulo, 5.5, 2.0));
        assert_eq!(Ok(Value::I32(-1)), apply(BinaryOp::Modulo, -7, 3));
    }

    #[test]
    fn bitwise_needs_integers() {
        assert_eq!(Ok(Value::I32(0b100)), apply(BinaryOp::ShiftLeft, 1, 2));
        assert_eq!(Ok(Value::I64(1 << 40)), apply(BinaryOp::ShiftLeft, 1i64, 40));
        assert_eq!(Ok(Value::I32(6)), apply(BinaryOp::BitXor, 5, 3));
        assert_eq!(Ok(Value::I64(1)), apply(BinaryOp::BitAnd, 3i64, 1));
        assert!(apply(BinaryOp::ShiftLeft, 1, 32).is_err());
        assert!(apply(BinaryOp::ShiftRight, 1, -1).is_err());
        assert!(apply(BinaryOp::BitOr, 1.0, 1).is_err());
        assert_eq!(Ok(Value::I32(-1)), scalar_unary(UnaryOp::BitNot, Value::I32(0)));
    }

    #[test]
    fn equality_never_fails() {
        assert_eq!(Ok(Value::Bool(true)), apply(BinaryOp::Equal, 1, 1.0));
        assert_eq!(Ok(Value::Bool(false)), apply(BinaryOp::Equal, true, 1));
        assert_eq!(Ok(Value::Bool(true)), apply(BinaryOp::Equal, Value::None, Value::None));
        assert_eq!(Ok(Value::Bool(true)), apply(BinaryOp::NotEqual, Value::None, 0));
        assert_eq!(Ok(Value::Bool(true)), apply(BinaryOp::Equal, false, false));
    }

    #[test]
    fn comparisons_need_numbers() {
        assert_eq!(Ok(Value::Bool(true)), apply(BinaryOp::Less, 1, 1.5));
        assert_eq!(Ok(Value::Bool(true)), apply(BinaryOp::GreaterEqual, 2i64, 2));
        assert_eq!(Ok(Value::Bool(false)), apply(BinaryOp::Less, f64::NAN, 1.0));
        assert!(apply(BinaryOp::Greater, true, false).is_err());
    }

    #[test]
    fn unary_operators() {
        assert_eq!(Ok(Value::F64(-2.5)), scalar_unary(UnaryOp::Negate, Value::F64(2.5)));
        assert_eq!(Ok(Value::Bool(false)), scalar_unary(UnaryOp::Not, Value::Bool(true)));
        assert!(scalar_unary(UnaryOp::Not, Value::I32(0)).is_err());
        assert!(scalar_unary(UnaryOp::Negate, Value::None).is_err());
    }
}
