//! Runtime scalar values.

use core::fmt;

use crate::VmError;

/// A value on the operand stack or in a memory cell.
///
/// Characters and booleans are integers at runtime; the two-way tag exists
/// so float cells are never silently reinterpreted as integers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f32),
}

impl Value {
    /// Condition truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
        }
    }

    /// Integer content; bitwise and index contexts refuse floats.
    pub fn as_int(&self) -> Result<i64, VmError> {
        match self {
            Value::Int(v) => Ok(*v),
            Value::Float(_) => Err(VmError::IntegerExpected),
        }
    }

    /// Numeric content, promoting integers.
    pub fn as_f32(&self) -> f32 {
        match self {
            Value::Int(v) => *v as f32,
            Value::Float(v) => *v,
        }
    }

    /// Raw 32-bit representation, for byte-view reads of a cell.
    pub fn bits(&self) -> u32 {
        match self {
            Value::Int(v) => *v as u32,
            Value::Float(v) => v.to_bits(),
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, Value::Float(_))
    }

    pub fn add(self, other: Value) -> Result<Value, VmError> {
        self.arith(other, i64::wrapping_add, |x, y| x + y)
    }

    pub fn sub(self, other: Value) -> Result<Value, VmError> {
        self.arith(other, i64::wrapping_sub, |x, y| x - y)
    }

    pub fn mul(self, other: Value) -> Result<Value, VmError> {
        self.arith(other, i64::wrapping_mul, |x, y| x * y)
    }

    pub fn div(self, other: Value) -> Result<Value, VmError> {
        if self.is_float() || other.is_float() {
            let divisor = other.as_f32();
            if divisor == 0.0 {
                return Err(VmError::DivisionByZero);
            }
            return Ok(Value::Float(self.as_f32() / divisor));
        }
        let divisor = other.as_int()?;
        if divisor == 0 {
            return Err(VmError::DivisionByZero);
        }
        Ok(Value::Int(self.as_int()? / divisor))
    }

    pub fn rem(self, other: Value) -> Result<Value, VmError> {
        let divisor = other.as_int()?;
        if divisor == 0 {
            return Err(VmError::ModuloByZero);
        }
        Ok(Value::Int(self.as_int()?.rem_euclid(divisor)))
    }

    /// Three-way numeric comparison with integer-to-float promotion.
    pub fn compare(self, other: Value) -> core::cmp::Ordering {
        if self.is_float() || other.is_float() {
            self.as_f32()
                .partial_cmp(&other.as_f32())
                .unwrap_or(core::cmp::Ordering::Equal)
        } else {
            // Both integers by construction.
            let (Value::Int(a), Value::Int(b)) = (self, other) else {
                unreachable!()
            };
            a.cmp(&b)
        }
    }

    fn arith(
        self,
        other: Value,
        int_op: fn(i64, i64) -> i64,
        float_op: fn(f32, f32) -> f32,
    ) -> Result<Value, VmError> {
        if self.is_float() || other.is_float() {
            Ok(Value::Float(float_op(self.as_f32(), other.as_f32())))
        } else {
            Ok(Value::Int(int_op(self.as_int()?, other.as_int()?)))
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
        }
    }
}
