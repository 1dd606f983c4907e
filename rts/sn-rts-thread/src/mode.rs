//! Ownership modes and result type tags.

use std::fmt;

use sn_rts_region::{Region, RegionResult};

/// How a spawned thread relates to its caller's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OwnershipMode {
    /// The thread gets a child of the caller's region; results are promoted.
    #[default]
    Default,
    /// The thread allocates directly into the caller's region.
    Shared,
    /// The thread gets an isolated root region; only primitives escape.
    Private,
}

impl OwnershipMode {
    /// Decode the numeric mode used by generated code (0, 1, 2).
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Default),
            1 => Some(Self::Shared),
            2 => Some(Self::Private),
            _ => None,
        }
    }
}

impl fmt::Display for OwnershipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::Shared => "shared",
            Self::Private => "private",
        })
    }
}

/// The region a spawned thread works in, tagged by ownership.
#[derive(Debug, Clone)]
pub enum ThreadRegion {
    /// A child of the caller's region, owned and destroyed by the thread.
    Owned(Region),
    /// The caller's own region.
    Shared(Region),
    /// A fresh root region with no parent, owned by the thread.
    Isolated(Region),
}

impl ThreadRegion {
    pub(crate) fn select(mode: OwnershipMode, caller: &Region) -> RegionResult<Self> {
        Ok(match mode {
            OwnershipMode::Default => Self::Owned(Region::named(Some(caller), "thread")?),
            OwnershipMode::Shared => Self::Shared(caller.clone()),
            OwnershipMode::Private => Self::Isolated(Region::named(None, "private thread")?),
        })
    }

    /// The region the thread allocates into.
    #[must_use]
    pub fn working(&self) -> &Region {
        match self {
            Self::Owned(region) | Self::Shared(region) | Self::Isolated(region) => region,
        }
    }

    /// The region the thread must destroy when released, if it owns one.
    #[must_use]
    pub fn owned(&self) -> Option<&Region> {
        match self {
            Self::Owned(region) | Self::Isolated(region) => Some(region),
            Self::Shared(_) => None,
        }
    }

    /// The ownership mode this region was selected for.
    #[must_use]
    pub const fn mode(&self) -> OwnershipMode {
        match self {
            Self::Owned(_) => OwnershipMode::Default,
            Self::Shared(_) => OwnershipMode::Shared,
            Self::Isolated(_) => OwnershipMode::Private,
        }
    }
}

/// Static type of a spawned function's result.
///
/// Drives how [`promote_result`](crate::promote_result) copies the result
/// out of the thread's region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultType {
    /// No result.
    Void,
    /// `int`.
    Int,
    /// `long`.
    Long,
    /// `double`.
    Double,
    /// `bool`.
    Bool,
    /// `byte`.
    Byte,
    /// `char`.
    Char,
    /// `str`.
    Str,
    /// `T[]`, any depth.
    Array(Box<ResultType>),
    /// `any`: promoted by inspecting each runtime value.
    Any,
    /// Native struct of the given byte size.
    Struct {
        /// Declared size in bytes.
        size: usize,
    },
}

impl ResultType {
    /// `elem[]`.
    #[must_use]
    pub fn array_of(elem: ResultType) -> Self {
        Self::Array(Box::new(elem))
    }

    /// Whether values of this type never reference region objects.
    #[must_use]
    pub const fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Void
                | Self::Int
                | Self::Long
                | Self::Double
                | Self::Bool
                | Self::Byte
                | Self::Char
        )
    }

    /// Whether this is [`ResultType::Void`].
    #[must_use]
    pub const fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Decode the numeric result tag emitted by generated code.
    ///
    /// `struct_size` is only read for the struct tag.
    #[must_use]
    pub fn from_raw(tag: i32, struct_size: usize) -> Option<Self> {
        let nested = |depth: usize, elem: ResultType| {
            (0..depth).fold(elem, |inner, _| Self::array_of(inner))
        };
        Some(match tag {
            0 => Self::Void,
            1 => Self::Int,
            2 => Self::Long,
            3 => Self::Double,
            4 => Self::Bool,
            5 => Self::Byte,
            6 => Self::Char,
            7 => Self::Str,
            8 => nested(1, Self::Int),
            9 => nested(1, Self::Long),
            10 => nested(1, Self::Double),
            11 => nested(1, Self::Bool),
            12 => nested(1, Self::Byte),
            13 => nested(1, Self::Char),
            14 => nested(1, Self::Str),
            15 => nested(2, Self::Any),
            16 => nested(3, Self::Any),
            17 => nested(2, Self::Str),
            18 => nested(3, Self::Str),
            19 => nested(1, Self::Any),
            20 => Self::Struct { size: struct_size },
            _ => return None,
        })
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Int => f.write_str("int"),
            Self::Long => f.write_str("long"),
            Self::Double => f.write_str("double"),
            Self::Bool => f.write_str("bool"),
            Self::Byte => f.write_str("byte"),
            Self::Char => f.write_str("char"),
            Self::Str => f.write_str("str"),
            Self::Array(elem) => write!(f, "{elem}[]"),
            Self::Any => f.write_str("any"),
            Self::Struct { size } => write!(f, "struct({size} bytes)"),
        }
    }
}
