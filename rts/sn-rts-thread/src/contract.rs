//! Facts the compiler hands the runtime for every spawn site.
//!
//! The type checker decides three things per `&fn(...)` expression: which
//! ownership mode to spawn in, which arguments the calling thread must not
//! write while the thread runs, and the static result type. [`SpawnSite`]
//! computes all three from the callee's declaration so the runtime and the
//! code generator agree on them.

use sn_rts_region::{Handle, Value};
use thiserror::Error;

use crate::mode::{OwnershipMode, ResultType};

/// Memory modifier written on a function declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionModifier {
    /// No modifier.
    #[default]
    Default,
    /// `shared fn`.
    Shared,
    /// `private fn`.
    Private,
}

impl From<FunctionModifier> for OwnershipMode {
    fn from(modifier: FunctionModifier) -> Self {
        match modifier {
            FunctionModifier::Default => Self::Default,
            FunctionModifier::Shared => Self::Shared,
            FunctionModifier::Private => Self::Private,
        }
    }
}

/// Static class of a spawn argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Numbers, booleans, bytes, chars.
    Primitive,
    /// `str`.
    Str,
    /// Any array type.
    Array,
}

/// Passing qualifier of the callee's parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamQualifier {
    /// Plain by-value parameter.
    #[default]
    Value,
    /// `as ref` parameter.
    AsRef,
}

/// Shape of one argument at a spawn site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgShape {
    /// The argument's static class.
    pub kind: ArgKind,
    /// The parameter's qualifier.
    pub qualifier: ParamQualifier,
}

impl ArgShape {
    /// A by-value primitive.
    #[must_use]
    pub const fn primitive() -> Self {
        Self {
            kind: ArgKind::Primitive,
            qualifier: ParamQualifier::Value,
        }
    }

    /// A string argument.
    #[must_use]
    pub const fn string() -> Self {
        Self {
            kind: ArgKind::Str,
            qualifier: ParamQualifier::Value,
        }
    }

    /// An array argument.
    #[must_use]
    pub const fn array() -> Self {
        Self {
            kind: ArgKind::Array,
            qualifier: ParamQualifier::Value,
        }
    }

    /// The same argument bound to an `as ref` parameter.
    #[must_use]
    pub const fn by_ref(self) -> Self {
        Self {
            kind: self.kind,
            qualifier: ParamQualifier::AsRef,
        }
    }

    /// Whether the caller must not write this argument while the thread runs.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        matches!(self.kind, ArgKind::Str | ArgKind::Array)
            || matches!(self.qualifier, ParamQualifier::AsRef)
    }
}

/// Violations of the spawn contract detectable from declarations alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    /// `private fn` with a heap-allocated return type.
    #[error("private function cannot return {ty}; private functions may only return primitive types")]
    PrivateHeapReturn {
        /// The offending return type.
        ty: ResultType,
    },
}

/// Everything the runtime needs to know about one spawn site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSite {
    mode: OwnershipMode,
    result_type: ResultType,
    frozen: Vec<usize>,
}

impl SpawnSite {
    /// Plan a spawn of a function declared with `modifier`.
    ///
    /// The mode follows the declared modifier only. A function that is
    /// implicitly shared because it returns heap data still spawns in
    /// default mode, so its result gets promoted.
    pub fn plan(
        modifier: FunctionModifier,
        result_type: ResultType,
        args: &[ArgShape],
    ) -> Result<Self, ContractError> {
        if modifier == FunctionModifier::Private && !result_type.is_primitive() {
            return Err(ContractError::PrivateHeapReturn { ty: result_type });
        }
        let frozen = args
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.is_frozen())
            .map(|(index, _)| index)
            .collect();
        Ok(Self {
            mode: modifier.into(),
            result_type,
            frozen,
        })
    }

    /// The ownership mode to spawn in.
    #[must_use]
    pub const fn mode(&self) -> OwnershipMode {
        self.mode
    }

    /// The static result type.
    #[must_use]
    pub const fn result_type(&self) -> &ResultType {
        &self.result_type
    }

    /// Indices of the arguments that are frozen for the caller.
    #[must_use]
    pub fn frozen_indices(&self) -> &[usize] {
        &self.frozen
    }

    /// Region objects among `args` that must be frozen at spawn.
    ///
    /// `as ref` primitives are frozen by the compiler's own bookkeeping and
    /// carry no region object, so they contribute nothing here.
    #[must_use]
    pub fn frozen_handles(&self, args: &[Value]) -> Vec<Handle> {
        self.frozen
            .iter()
            .filter_map(|&index| args.get(index).and_then(Value::handle))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_rts_region::Region;

    #[test]
    fn test_private_heap_return_rejected() {
        let err = SpawnSite::plan(FunctionModifier::Private, ResultType::Str, &[]).unwrap_err();
        assert_eq!(err, ContractError::PrivateHeapReturn { ty: ResultType::Str });

        let site = SpawnSite::plan(FunctionModifier::Private, ResultType::Int, &[]).unwrap();
        assert_eq!(site.mode(), OwnershipMode::Private);
    }

    #[test]
    fn test_implicitly_shared_spawns_default() {
        let site = SpawnSite::plan(
            FunctionModifier::Default,
            ResultType::array_of(ResultType::Str),
            &[],
        )
        .unwrap();
        assert_eq!(site.mode(), OwnershipMode::Default);
    }

    #[test]
    fn test_frozen_arguments() {
        let site = SpawnSite::plan(
            FunctionModifier::Shared,
            ResultType::Void,
            &[
                ArgShape::primitive(),
                ArgShape::string(),
                ArgShape::primitive().by_ref(),
                ArgShape::array(),
            ],
        )
        .unwrap();
        assert_eq!(site.frozen_indices(), &[1, 2, 3]);

        let region = Region::root();
        let s = region.alloc_str("s").unwrap();
        let a = region.alloc_array(vec![]).unwrap();
        let args = [Value::Int(1), Value::Str(s), Value::Int(2), Value::Array(a)];
        assert_eq!(site.frozen_handles(&args), vec![s, a]);
    }
}
