//! Runtime values.
//!
//! A [`Value`] is what generated code passes around: either an immediate
//! primitive or a [`Handle`] naming an object owned by some region. Values
//! are `Copy`; copying a value never copies the object behind a handle.
//!
//! A [`Materialized`] value is the same shape with every handle resolved into
//! owned data. It belongs to no region and is used to compare value trees
//! across regions and to seed regions with test data.

use std::fmt;

use crate::RegionId;

/// Reference to an object owned by a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    region: RegionId,
    slot: u32,
}

impl Handle {
    pub(crate) const fn new(region: RegionId, slot: u32) -> Self {
        Self { region, slot }
    }

    /// The region that owns the object.
    #[inline]
    #[must_use]
    pub const fn region(&self) -> RegionId {
        self.region
    }

    /// Slot index inside the owning region.
    #[inline]
    #[must_use]
    pub const fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.region, self.slot)
    }
}

/// Kind of object stored behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Immutable UTF-8 string.
    Str,
    /// Array of values.
    Array,
    /// Raw struct payload.
    Blob,
    /// Runtime bookkeeping record (thread handles, result boxes).
    Record,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Str => "string",
            Self::Array => "array",
            Self::Blob => "struct",
            Self::Record => "record",
        };
        f.write_str(name)
    }
}

/// A tagged runtime value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// No value.
    Void,
    /// 64-bit integer (`int` and `long`).
    Int(i64),
    /// 64-bit float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Unsigned byte.
    Byte(u8),
    /// Unicode scalar.
    Char(char),
    /// String object.
    Str(Handle),
    /// Array object; elements may be any value, including nested arrays.
    Array(Handle),
    /// Raw struct payload.
    Struct(Handle),
}

impl Value {
    /// The handle carried by this value, if it refers to an object.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        match self {
            Self::Str(h) | Self::Array(h) | Self::Struct(h) => Some(*h),
            _ => None,
        }
    }

    /// Whether the value is immediate (no region object behind it).
    #[inline]
    #[must_use]
    pub const fn is_primitive(&self) -> bool {
        self.handle().is_none()
    }

    /// Short name of the value's kind, for diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::Bool(_) => "bool",
            Self::Byte(_) => "byte",
            Self::Char(_) => "char",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Struct(_) => "struct",
        }
    }

    /// The integer payload, if any.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The float payload, if any.
    #[must_use]
    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The boolean payload, if any.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// A value tree with all handles resolved into owned data.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    /// No value.
    Void,
    /// Integer.
    Int(i64),
    /// Float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Byte.
    Byte(u8),
    /// Character.
    Char(char),
    /// String contents.
    Str(String),
    /// Array elements.
    Array(Vec<Materialized>),
    /// Struct payload bytes.
    Struct(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_classification() {
        assert!(Value::Int(3).is_primitive());
        assert!(Value::Void.is_primitive());
        let h = Handle::new(RegionId::next(), 0);
        assert!(!Value::Str(h).is_primitive());
        assert_eq!(Value::Array(h).handle(), Some(h));
    }

    #[test]
    fn test_handle_display() {
        let id = RegionId::next();
        let h = Handle::new(id, 7);
        assert_eq!(h.to_string(), format!("{id}#7"));
    }
}
