//! Representation of values in Joker.

use crate::object::ObjRef;

extern crate static_assertions as sa;

/// A Joker runtime value.
///
/// Scalars are stored inline; everything else is an [ObjRef] handle into the
/// [Heap](crate::gc::Heap). Values are `Copy`, so pushing and popping them never touches the heap.
///
/// You can create a Joker value from its equivalent Rust type:
///
/// ```
/// # use joker::value::Value;
/// let v: Value = 42.into();
/// assert_eq!(Value::I32(42), v);
///
/// let v: Value = 0.5.into();
/// assert_eq!("0.5", v.to_string());
///
/// let v: Value = 3.0.into();
/// assert_eq!("3.0", v.to_string());
///
/// let v: Value = false.into();
/// assert_eq!("false", v.to_string());
/// ```
///
/// This even works with `Option<T>`: `None` turns into [Value::None].
///
/// ```
/// # use joker::value::Value;
/// let option: Option<i64> = None;
/// let v: Value = option.into();
/// assert_eq!("None", v.to_string());
/// ```
#[derive(Debug, Default, Copy, Clone)]
pub enum Value {
    /// A 32-bit integer. Integer literals that fit are always this type.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A 32-bit float. There is no literal syntax; produced by conversion.
    F32(f32),
    /// A 64-bit float.
    F64(f64),
    /// A boolean.
    Bool(bool),
    /// The language-level absence of a value.
    #[default]
    None,
    /// Internal sentinel: "nothing is stored here". Never visible to Joker programs.
    Null,
    /// A reference to a heap object.
    Obj(ObjRef),
}

// Values are copied around the stack constantly. Keep them small.
sa::assert_eq_size!(Value, [u64; 2]);
sa::assert_impl_all!(Value: Copy, Send, Sync);

/// The numeric kinds, ordered by promotion rank: mixing two kinds yields the greater one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NumericKind {
    I32,
    I64,
    F32,
    F64,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Value {
    /// Returns true if this value is a boolean.
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    /// Returns true if this value is `None`.
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Returns true if this is the internal "no value" sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true if this value is any of the four numeric kinds.
    pub fn is_number(&self) -> bool {
        self.numeric_kind().is_some()
    }

    /// Returns true if this value is an `i32` or `i64`.
    pub fn is_integer(&self) -> bool {
        matches!(self, Value::I32(_) | Value::I64(_))
    }

    /// Returns the object handle, if this value refers to a heap object.
    #[inline]
    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(reference) => Some(*reference),
            _ => None,
        }
    }

    /// Returns the boolean, if this is a boolean.
    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the value as an `i64` if it is one of the integer kinds.
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Value::I32(n) => Some(n as i64),
            Value::I64(n) => Some(n),
            _ => None,
        }
    }

    /// Returns the value as an `f64` if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::I32(n) => Some(n as f64),
            Value::I64(n) => Some(n as f64),
            Value::F32(n) => Some(n as f64),
            Value::F64(n) => Some(n),
            _ => None,
        }
    }

    /// Which numeric kind this value is, if any.
    pub fn numeric_kind(&self) -> Option<NumericKind> {
        match self {
            Value::I32(_) => Some(NumericKind::I32),
            Value::I64(_) => Some(NumericKind::I64),
            Value::F32(_) => Some(NumericKind::F32),
            Value::F64(_) => Some(NumericKind::F64),
            _ => None,
        }
    }

    /// Converts a numeric value to the given numeric kind.
    ///
    /// Widening always succeeds. Narrowing to an integer kind fails when the value does not fit
    /// (or is not finite). Non-numeric values return `None`.
    ///
    /// ```
    /// # use joker::value::{Value, NumericKind};
    /// assert_eq!(Some(Value::F64(1.0)), Value::I32(1).convert(NumericKind::F64));
    /// assert_eq!(Some(Value::I32(2)), Value::F64(2.9).convert(NumericKind::I32));
    /// assert_eq!(None, Value::I64(1 << 40).convert(NumericKind::I32));
    /// ```
    pub fn convert(&self, kind: NumericKind) -> Option<Value> {
        match kind {
            NumericKind::I32 => match *self {
                Value::I32(n) => Some(Value::I32(n)),
                Value::I64(n) => i32::try_from(n).ok().map(Value::I32),
                Value::F32(x) => float_to_int(x as f64, i32::MIN as f64, i32::MAX as f64)
                    .map(|n| Value::I32(n as i32)),
                Value::F64(x) => float_to_int(x, i32::MIN as f64, i32::MAX as f64)
                    .map(|n| Value::I32(n as i32)),
                _ => None,
            },
            NumericKind::I64 => match *self {
                Value::I32(n) => Some(Value::I64(n as i64)),
                Value::I64(n) => Some(Value::I64(n)),
                Value::F32(x) => float_to_int(x as f64, i64::MIN as f64, i64::MAX as f64)
                    .map(|n| Value::I64(n as i64)),
                Value::F64(x) => float_to_int(x, i64::MIN as f64, i64::MAX as f64)
                    .map(|n| Value::I64(n as i64)),
                _ => None,
            },
            NumericKind::F32 => match *self {
                Value::I32(n) => Some(Value::F32(n as f32)),
                Value::I64(n) => Some(Value::F32(n as f32)),
                Value::F32(x) => Some(Value::F32(x)),
                Value::F64(x) => Some(Value::F32(x as f32)),
                _ => None,
            },
            NumericKind::F64 => self.as_f64().map(Value::F64),
        }
    }

    /// The name of this value's type, for scalars. Objects report `"object"`; ask the heap for a
    /// more specific name.
    pub fn scalar_type_name(&self) -> &'static str {
        match self {
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bool(_) => "bool",
            Value::None => "None",
            Value::Null => "null",
            Value::Obj(_) => "object",
        }
    }
}

impl NumericKind {
    /// Parses the name of a numeric type annotation.
    pub fn from_type_name(name: &str) -> Option<NumericKind> {
        match name {
            "i32" => Some(NumericKind::I32),
            "i64" => Some(NumericKind::I64),
            "f32" => Some(NumericKind::F32),
            "f64" => Some(NumericKind::F64),
            _ => None,
        }
    }

    /// The name used in type annotations.
    pub fn name(self) -> &'static str {
        match self {
            NumericKind::I32 => "i32",
            NumericKind::I64 => "i64",
            NumericKind::F32 => "f32",
            NumericKind::F64 => "f64",
        }
    }

    /// Returns true for the two float kinds.
    pub fn is_float(self) -> bool {
        matches!(self, NumericKind::F32 | NumericKind::F64)
    }
}

impl TryFrom<u8> for NumericKind {
    type Error = ();

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(NumericKind::I32),
            1 => Ok(NumericKind::I64),
            2 => Ok(NumericKind::F32),
            3 => Ok(NumericKind::F64),
            _ => Err(()),
        }
    }
}

/// Truncates a float towards zero, if the result lands inside `[min, max]`.
fn float_to_int(x: f64, min: f64, max: f64) -> Option<f64> {
    let truncated = x.trunc();
    if truncated.is_finite() && truncated >= min && truncated <= max {
        Some(truncated)
    } else {
        None
    }
}

/// Formats a float the way Joker prints it: integral floats keep a trailing `.0`.
pub(crate) fn format_float<F>(f: &mut std::fmt::Formatter, float: F) -> std::fmt::Result
where
    F: Into<f64> + std::fmt::Display + Copy,
{
    let wide: f64 = float.into();
    if wide.is_finite() && wide.fract() == 0.0 && wide.abs() < 1e16 {
        write!(f, "{wide:.1}")
    } else {
        write!(f, "{float}")
    }
}

/// Displays scalars. Objects only show their handle; use
/// [Heap::display](crate::gc::Heap::display) to see what they contain.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Value::I32(n) => write!(f, "{n}"),
            Value::I64(n) => write!(f, "{n}"),
            Value::F32(x) => format_float(f, x),
            Value::F64(x) => format_float(f, x),
            Value::Bool(b) => write!(f, "{b}"),
            Value::None => write!(f, "None"),
            Value::Null => write!(f, "null"),
            Value::Obj(reference) => write!(f, "<object {}>", reference.index()),
        }
    }
}

/// Structural identity, used for tests and constant pools. Language-level `==` lives in
/// [crate::operator], where numeric promotion applies.
impl std::cmp::PartialEq for Value {
    fn eq(&self, rhs: &Value) -> bool {
        use Value::*;
        match (self, rhs) {
            (I32(a), I32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (F64(a), F64(b)) => a.to_bits() == b.to_bits(),
            (Bool(a), Bool(b)) => a == b,
            (None, None) => true,
            (Null, Null) => true,
            (Obj(a), Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl std::cmp::Eq for Value {}

impl From<i32> for Value {
    #[inline(always)]
    fn from(n: i32) -> Value {
        Value::I32(n)
    }
}

impl From<i64> for Value {
    #[inline(always)]
    fn from(n: i64) -> Value {
        Value::I64(n)
    }
}

impl From<f32> for Value {
    #[inline(always)]
    fn from(x: f32) -> Value {
        Value::F32(x)
    }
}

impl From<f64> for Value {
    #[inline(always)]
    fn from(x: f64) -> Value {
        Value::F64(x)
    }
}

impl From<bool> for Value {
    #[inline(always)]
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<ObjRef> for Value {
    #[inline(always)]
    fn from(reference: ObjRef) -> Value {
        Value::Obj(reference)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    #[inline]
    fn from(option: Option<T>) -> Value {
        option.map(Into::into).unwrap_or(Value::None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn floats_keep_their_decimal_point() {
        assert_eq!("3.0", Value::F64(3.0).to_string());
        assert_eq!("-0.25", Value::F64(-0.25).to_string());
        assert_eq!("1.5", Value::F32(1.5).to_string());
        assert_eq!("inf", Value::F64(f64::INFINITY).to_string());
        assert_eq!("NaN", Value::F64(f64::NAN).to_string());
    }

    #[test]
    fn structural_equality_is_kind_sensitive() {
        assert_eq!(Value::I32(1), Value::I32(1));
        assert_ne!(Value::I32(1), Value::I64(1));
        assert_ne!(Value::None, Value::Null);
        // NaN is identical to itself in a constant pool.
        assert_eq!(Value::F64(f64::NAN), Value::F64(f64::NAN));
    }

    #[test]
    fn promotion_rank() {
        assert!(NumericKind::I32 < NumericKind::I64);
        assert!(NumericKind::I64 < NumericKind::F32);
        assert!(NumericKind::F32 < NumericKind::F64);
        assert_eq!(
            Some(NumericKind::F64),
            Value::F64(1.0).numeric_kind().max(Value::I32(1).numeric_kind())
        );
    }

    #[test]
    fn conversion() {
        assert_eq!(Some(Value::I64(7)), Value::I32(7).convert(NumericKind::I64));
        assert_eq!(Some(Value::F32(0.5)), Value::F64(0.5).convert(NumericKind::F32));
        assert_eq!(None, Value::F64(f64::NAN).convert(NumericKind::I64));
        assert_eq!(None, Value::Bool(true).convert(NumericKind::F64));
        assert_eq!(Some(NumericKind::F32), NumericKind::from_type_name("f32"));
        assert_eq!(None, NumericKind::from_type_name("str"));
    }
}
