//! The semantic type model and conversion rules.

use core::fmt;

use crate::ast::{Primitive, TypeRef};

/// Resolved type of an expression or symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Int,
    Float,
    Char,
    Bool,
    Void,
    /// String literals and string-typed builtin parameters.
    Str,
    Struct(String),
    Union(String),
    Array(Box<Type>, u32),
    Pointer(Box<Type>),
}

impl Type {
    /// Pointer to `self`.
    pub fn pointer_to(self) -> Type {
        Type::Pointer(Box::new(self))
    }

    /// Arithmetic operand types.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Char)
    }

    /// Types `%`, shifts and bitwise operators accept.
    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int | Type::Char | Type::Bool)
    }

    /// Types an `if`/`while` condition accepts.
    pub fn is_condition(&self) -> bool {
        self.is_numeric() || matches!(self, Type::Bool | Type::Pointer(_))
    }

    /// Result type of mixed arithmetic: float wins, otherwise int.
    pub fn common(&self, other: &Type) -> Type {
        if *self == Type::Float || *other == Type::Float {
            Type::Float
        } else {
            Type::Int
        }
    }

    /// Whether a value of `self` is assignable to a slot of type `to`.
    pub fn convertible_to(&self, to: &Type) -> bool {
        if self == to {
            return true;
        }
        // Numeric types (and bool) interconvert.
        let numeric_ish = |t: &Type| t.is_numeric() || *t == Type::Bool;
        if numeric_ish(self) && numeric_ish(to) {
            return true;
        }
        match (self, to) {
            // Any pointer converts to and from void*.
            (Type::Pointer(a), Type::Pointer(b)) => {
                **a == Type::Void || **b == Type::Void || a == b
            }
            // Arrays decay to a pointer of their element type.
            (Type::Array(element, _), Type::Pointer(base)) => {
                element == base || **base == Type::Void
            }
            _ => false,
        }
    }

    /// Resolve a syntactic type reference.
    pub fn from_ref(ty: &TypeRef) -> Type {
        match ty {
            TypeRef::Primitive(Primitive::Int) => Type::Int,
            TypeRef::Primitive(Primitive::Float) => Type::Float,
            TypeRef::Primitive(Primitive::Char) => Type::Char,
            TypeRef::Primitive(Primitive::Bool) => Type::Bool,
            TypeRef::Primitive(Primitive::Void) => Type::Void,
            TypeRef::Struct(name) => Type::Struct(name.clone()),
            TypeRef::Union(name) => Type::Union(name.clone()),
            TypeRef::Array { element, size } => {
                Type::Array(Box::new(Type::from_ref(element)), size.unwrap_or(0))
            }
            TypeRef::Pointer { base, level } => {
                let mut ty = Type::from_ref(base);
                for _ in 0..*level {
                    ty = ty.pointer_to();
                }
                ty
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Char => write!(f, "char"),
            Type::Bool => write!(f, "bool"),
            Type::Void => write!(f, "void"),
            Type::Str => write!(f, "string"),
            Type::Struct(name) => write!(f, "struct {name}"),
            Type::Union(name) => write!(f, "union {name}"),
            Type::Array(element, size) => write!(f, "{element}[{size}]"),
            Type::Pointer(base) => write!(f, "{base}*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        assert!(Type::Int.convertible_to(&Type::Float));
        assert!(Type::Char.convertible_to(&Type::Int));
        assert!(Type::Bool.convertible_to(&Type::Int));
        assert!(!Type::Str.convertible_to(&Type::Int));
    }

    #[test]
    fn pointer_conversions() {
        let int_ptr = Type::Int.pointer_to();
        let void_ptr = Type::Void.pointer_to();
        assert!(int_ptr.convertible_to(&void_ptr));
        assert!(void_ptr.convertible_to(&int_ptr));
        assert!(int_ptr.convertible_to(&int_ptr.clone()));
        assert!(!int_ptr.convertible_to(&Type::Float.pointer_to()));
    }

    #[test]
    fn common_type_prefers_float() {
        assert_eq!(Type::Int.common(&Type::Float), Type::Float);
        assert_eq!(Type::Char.common(&Type::Int), Type::Int);
    }
}
