//! Interned IL constants.

use crate::context::Type;

/// Definition for a [`Const`](crate::context::Const), interned by
/// `(type, kind)`, so structurally equal constants share one identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConstKind {
    /// A constant the IL has no model for (aggregates, expressions, etc.),
    /// `tag` keeps distinct ones distinct.
    Unexposed { tag: u32 },

    Bool(bool),
    Int(i64),
    Fp(FpBits),
    Undef,
    Null,
}

/// Bit pattern of a floating-point constant, so that it can be hashed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FpBits(pub u64);

impl FpBits {
    pub fn from_f64(value: f64) -> Self {
        FpBits(value.to_bits())
    }

    pub fn to_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

impl ConstKind {
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            ConstKind::Int(value) => Some(value),
            ConstKind::Bool(value) => Some(value.into()),
            _ => None,
        }
    }
}
