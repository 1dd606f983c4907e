//! Allocation accounting primitives for the Sindarin Runtime System.
//!
//! This crate holds the small vocabulary shared by every allocator in the
//! runtime: the error type returned when an allocation cannot be satisfied,
//! the statistics record each region keeps, and the alignment helpers used
//! when carving raw byte blocks.
//!
//! # Memory Regions
//!
//! All program memory in a Sindarin program lives in a region (see
//! `sn-rts-region`). Regions form a tree; destroying a region frees every
//! object it owns in one step. The runtime never tracks individual object
//! lifetimes, only region lifetimes, so the accounting here is coarse:
//! bytes in, bytes out, peaks and failures.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Alignment requirements for raw allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Default alignment (8 bytes on 64-bit systems).
    Default,
    /// Cache line alignment (64 bytes).
    CacheLine,
    /// Page alignment (4096 bytes).
    Page,
}

impl Alignment {
    /// Get the alignment value in bytes.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        match self {
            Self::Default => 8,
            Self::CacheLine => 64,
            Self::Page => 4096,
        }
    }
}

/// Result type for allocation operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors that can occur during allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Out of memory.
    OutOfMemory {
        /// Requested allocation size.
        requested: usize,
    },
    /// Invalid layout (e.g., zero size or invalid alignment).
    InvalidLayout(String),
    /// A fixed-capacity block cannot hold the request.
    BlockExhausted {
        /// Current block usage.
        current: usize,
        /// Block capacity.
        capacity: usize,
    },
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: failed to allocate {requested} bytes")
            }
            Self::InvalidLayout(msg) => write!(f, "invalid layout: {msg}"),
            Self::BlockExhausted { current, capacity } => {
                write!(
                    f,
                    "block exhausted: {current} bytes used of {capacity} bytes capacity"
                )
            }
        }
    }
}

impl std::error::Error for AllocError {}

/// Statistics for memory allocation tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Total bytes currently allocated.
    pub bytes_allocated: usize,
    /// Total number of allocations performed.
    pub allocation_count: usize,
    /// Total number of deallocations performed.
    pub deallocation_count: usize,
    /// Peak memory usage in bytes.
    pub peak_bytes: usize,
    /// Number of failed allocations.
    pub failed_allocations: usize,
}

impl AllocStats {
    /// Create new empty statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_allocated: 0,
            allocation_count: 0,
            deallocation_count: 0,
            peak_bytes: 0,
            failed_allocations: 0,
        }
    }

    /// Record an allocation.
    pub fn record_alloc(&mut self, size: usize) {
        self.bytes_allocated += size;
        self.allocation_count += 1;
        self.peak_bytes = self.peak_bytes.max(self.bytes_allocated);
    }

    /// Record a deallocation.
    pub fn record_dealloc(&mut self, size: usize) {
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        self.deallocation_count += 1;
    }

    /// Record a failed allocation.
    pub fn record_failure(&mut self) {
        self.failed_allocations += 1;
    }

    /// Number of allocations not yet matched by a deallocation.
    #[inline]
    #[must_use]
    pub const fn live_allocations(&self) -> usize {
        self.allocation_count.saturating_sub(self.deallocation_count)
    }
}

/// Utility function to align a size up to the given alignment.
#[inline]
#[must_use]
pub const fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Utility function to check if an offset is aligned.
#[inline]
#[must_use]
pub const fn is_aligned(offset: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    offset & (align - 1) == 0
}
