//! Cross-region promotion.
//!
//! A thread in default or private mode allocates its result in a region that
//! is destroyed at sync. Promotion deep-copies the result into the caller's
//! region first, following every handle so nothing in the copy still points
//! into the doomed region.
//!
//! Two entry points:
//!
//! - [`Promote`] copies a value by inspecting it at runtime. This is how
//!   `any` values and their contents are handled, at any depth.
//! - [`promote_result`] copies a value according to its static
//!   [`ResultType`] and rejects values that do not match it.
//!
//! Objects already reachable from the destination (owned by it or one of its
//! ancestors) are returned as-is rather than copied.

use sn_rts_region::{Alignment, Handle, ObjectKind, Region, RegionError, Value};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

use crate::mode::ResultType;

/// Errors raised while promoting a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromoteError {
    /// Reading the source or allocating in the destination failed.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// The value does not have the declared result type.
    #[error("expected a {expected} result, found a {found} value")]
    TypeMismatch {
        /// Declared type at the point of mismatch.
        expected: ResultType,
        /// Kind of the value actually found.
        found: &'static str,
    },
    /// A struct result was declared with size zero.
    #[error("struct result declared with zero size")]
    ZeroSizedStruct,
    /// A struct payload does not match its declared size.
    #[error("struct result is {actual} bytes, declared {declared}")]
    StructSize {
        /// Declared size.
        declared: usize,
        /// Payload size.
        actual: usize,
    },
    /// Runtime bookkeeping records never leave their region.
    #[error("runtime record {handle} cannot be promoted")]
    Record {
        /// The record handle.
        handle: Handle,
    },
    /// A private-mode thread produced a heap result.
    #[error("private thread returned a {ty} result; private threads may only return primitives")]
    PrivateEscape {
        /// Declared result type.
        ty: ResultType,
    },
}

/// Values that can be deep-copied from one region into another.
pub trait Promote: Sized {
    /// Copy `self` and everything it references from `from` into `into`.
    fn promote(&self, from: &Region, into: &Region) -> Result<Self, PromoteError>;
}

impl Promote for Handle {
    fn promote(&self, from: &Region, into: &Region) -> Result<Self, PromoteError> {
        Promotion::new(from, into).handle(*self)
    }
}

impl Promote for Value {
    fn promote(&self, from: &Region, into: &Region) -> Result<Self, PromoteError> {
        Promotion::new(from, into).value(*self)
    }
}

/// A runtime-shape deep copy. Each source object is copied once, so shared
/// elements stay shared and self-containing arrays terminate.
struct Promotion<'r> {
    from: &'r Region,
    into: &'r Region,
    copies: FxHashMap<Handle, Handle>,
}

impl<'r> Promotion<'r> {
    fn new(from: &'r Region, into: &'r Region) -> Self {
        Self {
            from,
            into,
            copies: FxHashMap::default(),
        }
    }

    fn value(&mut self, value: Value) -> Result<Value, PromoteError> {
        Ok(match value {
            Value::Str(h) => Value::Str(self.handle(h)?),
            Value::Array(h) => Value::Array(self.handle(h)?),
            Value::Struct(h) => Value::Struct(self.handle(h)?),
            primitive => primitive,
        })
    }

    fn handle(&mut self, handle: Handle) -> Result<Handle, PromoteError> {
        if self.into.contains(handle) {
            return Ok(handle);
        }
        if let Some(&copy) = self.copies.get(&handle) {
            return Ok(copy);
        }
        let (from, into) = (self.from, self.into);
        let copy = match from.kind(handle)? {
            ObjectKind::Str => into.alloc_str(&from.read_str(handle)?)?,
            ObjectKind::Array => {
                let copy = into.alloc_array(Vec::new())?;
                self.copies.insert(handle, copy);
                for item in from.array_values(handle)? {
                    let item = self.value(item)?;
                    into.array_push(copy, item)?;
                }
                copy
            }
            ObjectKind::Blob => into.alloc_blob(&from.read_blob(handle)?, Alignment::Default)?,
            ObjectKind::Record => return Err(PromoteError::Record { handle }),
        };
        self.copies.insert(handle, copy);
        trace!(from = %handle, to = %copy, "promoted");
        Ok(copy)
    }
}

/// Promote a thread result of static type `ty` from `from` into `into`.
///
/// Fails if `into` has been destroyed, even for primitive results.
pub fn promote_result(
    value: Value,
    ty: &ResultType,
    from: &Region,
    into: &Region,
) -> Result<Value, PromoteError> {
    if !into.is_alive() {
        return Err(RegionError::Destroyed { region: into.id() }.into());
    }
    Promotion::new(from, into).typed(value, ty)
}

impl Promotion<'_> {
    fn typed(&mut self, value: Value, ty: &ResultType) -> Result<Value, PromoteError> {
        let (from, into) = (self.from, self.into);
        match (ty, value) {
            (ResultType::Void, _) => Ok(Value::Void),
            (ResultType::Int | ResultType::Long, Value::Int(_))
            | (ResultType::Double, Value::Double(_))
            | (ResultType::Bool, Value::Bool(_))
            | (ResultType::Byte, Value::Byte(_))
            | (ResultType::Char, Value::Char(_)) => Ok(value),
            (ResultType::Str, Value::Str(h)) => Ok(Value::Str(self.handle(h)?)),
            (ResultType::Array(elem), Value::Array(h)) => {
                if into.contains(h) {
                    return Ok(value);
                }
                if let Some(&copy) = self.copies.get(&h) {
                    return Ok(Value::Array(copy));
                }
                let copy = into.alloc_array(Vec::new())?;
                self.copies.insert(h, copy);
                for item in from.array_values(h)? {
                    let item = self.typed(item, elem)?;
                    into.array_push(copy, item)?;
                }
                Ok(Value::Array(copy))
            }
            (ResultType::Any, any) => self.value(any),
            (ResultType::Struct { size }, Value::Struct(h)) => {
                if *size == 0 {
                    return Err(PromoteError::ZeroSizedStruct);
                }
                let bytes = from.read_blob(h)?;
                if bytes.len() != *size {
                    return Err(PromoteError::StructSize {
                        declared: *size,
                        actual: bytes.len(),
                    });
                }
                if into.contains(h) {
                    return Ok(value);
                }
                Ok(Value::Struct(into.alloc_blob(&bytes, Alignment::Default)?))
            }
            (expected, found) => Err(PromoteError::TypeMismatch {
                expected: expected.clone(),
                found: found.kind_name(),
            }),
        }
    }
}
