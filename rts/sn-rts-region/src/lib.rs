//! Hierarchical memory regions for the Sindarin Runtime System.
//!
//! Every heap object a Sindarin program creates is owned by a [`Region`].
//! Regions form a tree: a child region can read everything its ancestors
//! own, and destroying a region destroys its live children and frees every
//! object it owns in one step.
//!
//! # Features
//!
//! - **Thread-safe** - a region may be shared by the thread that created it
//!   and any number of spawned threads; all state sits behind one lock
//! - **Cleanup callbacks** - prioritized hooks that run at teardown while the
//!   region is still usable (this is how spawned threads are auto-joined)
//! - **Freezing** - per-object, per-thread write protection used while a
//!   spawned thread borrows an argument
//! - **Bump blocks** - raw struct payloads are packed into 64 KiB blocks
//!
//! # Usage
//!
//! ```ignore
//! use sn_rts_region::{with_region, Region, Value};
//!
//! with_region(|root| {
//!     let child = Region::child(root)?;
//!     let greeting = child.alloc_str("hello")?;
//!     assert_eq!(child.read_str(greeting)?, "hello");
//!     child.destroy();
//!     Ok::<_, sn_rts_region::RegionError>(())
//! })?;
//! ```
//!
//! # Lock Discipline
//!
//! At most one region lock is held at a time. Operations that move data
//! between regions copy out of the source, release its lock, then lock the
//! destination. Cleanup callbacks run with no region lock held.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod block;
pub mod value;

pub use block::DEFAULT_BLOCK_SIZE;
pub use sn_rts_alloc::{AllocError, AllocStats, Alignment};
pub use value::{Handle, Materialized, ObjectKind, Value};

use block::{BlobRef, BlockChain};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use thiserror::Error;
use tracing::{debug, trace};

/// Cleanup priority for callbacks that must run first (thread auto-join).
pub const CLEANUP_PRIORITY_HIGH: i32 = 0;
/// Cleanup priority for ordinary callbacks.
pub const CLEANUP_PRIORITY_NORMAL: i32 = 100;
/// Cleanup priority for callbacks that must run last.
pub const CLEANUP_PRIORITY_LOW: i32 = 200;

// ============================================================================
// Identifiers and Errors
// ============================================================================

/// Unique identifier for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({})", self.0)
    }
}

/// Identifies a registered cleanup callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupKey(u64);

/// Result type for region operations.
pub type RegionResult<T> = Result<T, RegionError>;

/// Errors reported by region operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    /// The region (or the region owning a handle) has been destroyed.
    #[error("{region} has been destroyed")]
    Destroyed {
        /// The destroyed region.
        region: RegionId,
    },
    /// The handle is owned by neither this region nor any ancestor.
    #[error("{handle} is not reachable from {region}")]
    Foreign {
        /// The unresolvable handle.
        handle: Handle,
        /// The region the lookup started from.
        region: RegionId,
    },
    /// The object was already released.
    #[error("{handle} has already been released")]
    Released {
        /// The released handle.
        handle: Handle,
    },
    /// The object is frozen for the writing thread.
    #[error("{handle} is frozen while a spawned thread borrows it")]
    Frozen {
        /// The frozen handle.
        handle: Handle,
    },
    /// `thaw` without a matching `freeze`.
    #[error("{handle} is not frozen by the given thread")]
    NotFrozen {
        /// The handle.
        handle: Handle,
    },
    /// The object behind the handle has a different kind.
    #[error("{handle} is a {found}, expected a {expected}")]
    KindMismatch {
        /// The handle.
        handle: Handle,
        /// Kind the operation needs.
        expected: ObjectKind,
        /// Kind actually stored.
        found: ObjectKind,
    },
    /// Array index past the end.
    #[error("index {index} out of bounds for array of length {len}")]
    OutOfBounds {
        /// Requested index.
        index: usize,
        /// Array length.
        len: usize,
    },
    /// The underlying allocator failed.
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug)]
enum Object {
    Str(Box<str>),
    Array(Vec<Value>),
    Blob(BlobRef),
    Record(&'static str),
}

impl Object {
    const fn kind(&self) -> ObjectKind {
        match self {
            Self::Str(_) => ObjectKind::Str,
            Self::Array(_) => ObjectKind::Array,
            Self::Blob(_) => ObjectKind::Blob,
            Self::Record(_) => ObjectKind::Record,
        }
    }

    fn footprint(&self) -> usize {
        match self {
            Self::Str(s) => s.len(),
            Self::Array(values) => values.len() * std::mem::size_of::<Value>(),
            Self::Blob(blob) => blob.len(),
            Self::Record(_) => std::mem::size_of::<usize>(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    object: Option<Object>,
    /// Threads that may not write this object, with nesting counts.
    freezes: Vec<(ThreadId, u32)>,
}

struct Cleanup {
    key: CleanupKey,
    priority: i32,
    run: Box<dyn FnOnce() + Send>,
}

struct RegionState {
    alive: bool,
    destroying: bool,
    slots: Vec<Slot>,
    blocks: BlockChain,
    cleanups: Vec<Cleanup>,
    next_cleanup: u64,
    children: Vec<Weak<RegionInner>>,
    stats: AllocStats,
}

impl RegionState {
    fn new() -> Self {
        Self {
            alive: true,
            destroying: false,
            slots: Vec::new(),
            blocks: BlockChain::new(DEFAULT_BLOCK_SIZE),
            cleanups: Vec::new(),
            next_cleanup: 0,
            children: Vec::new(),
            stats: AllocStats::new(),
        }
    }

    fn insert(&mut self, region: RegionId, object: Object) -> RegionResult<Handle> {
        let footprint = object.footprint();
        let Ok(slot) = u32::try_from(self.slots.len()) else {
            self.stats.record_failure();
            return Err(AllocError::OutOfMemory {
                requested: footprint,
            }
            .into());
        };
        self.stats.record_alloc(footprint);
        self.slots.push(Slot {
            object: Some(object),
            freezes: Vec::new(),
        });
        Ok(Handle::new(region, slot))
    }
}

struct RegionInner {
    id: RegionId,
    name: Box<str>,
    parent: Option<Region>,
    state: Mutex<RegionState>,
}

// ============================================================================
// Region
// ============================================================================

/// A shared handle to a memory region.
///
/// Cloning a `Region` clones the handle, not the region. A region stays
/// readable until [`Region::destroy`] is called on any of its handles (or on
/// an ancestor).
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

impl Region {
    /// Create a new root region.
    #[must_use]
    pub fn root() -> Self {
        Self::new_unlinked(None, "root")
    }

    /// Create a child of `parent`.
    pub fn child(parent: &Region) -> RegionResult<Self> {
        Self::named(Some(parent), "child")
    }

    /// Create a region with a diagnostic name, optionally under a parent.
    pub fn named(parent: Option<&Region>, name: &str) -> RegionResult<Self> {
        let region = Self::new_unlinked(parent, name);
        if let Some(parent) = parent {
            let mut state = parent.inner.state.lock();
            if !state.alive || state.destroying {
                return Err(RegionError::Destroyed {
                    region: parent.id(),
                });
            }
            state.children.retain(|child| child.strong_count() > 0);
            state.children.push(Arc::downgrade(&region.inner));
        }
        trace!(region = %region.id(), parent = ?parent.map(Region::id), region_name = name, "region created");
        Ok(region)
    }

    fn new_unlinked(parent: Option<&Region>, name: &str) -> Self {
        Self {
            inner: Arc::new(RegionInner {
                id: RegionId::next(),
                name: name.into(),
                parent: parent.cloned(),
                state: Mutex::new(RegionState::new()),
            }),
        }
    }

    /// The region's identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RegionId {
        self.inner.id
    }

    /// The diagnostic name given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The parent region, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Region> {
        self.inner.parent.as_ref()
    }

    /// Whether the region has not been destroyed yet.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.state.lock().alive
    }

    /// Whether two handles name the same region.
    #[must_use]
    pub fn ptr_eq(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether `self` is `other` or one of its ancestors.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Region) -> bool {
        let mut current = Some(other);
        while let Some(region) = current {
            if region.ptr_eq(self) {
                return true;
            }
            current = region.parent();
        }
        false
    }

    /// Allocation statistics.
    #[must_use]
    pub fn stats(&self) -> AllocStats {
        self.inner.state.lock().stats
    }

    /// Number of objects allocated and not yet released.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.object.is_some())
            .count()
    }

    /// Bytes reserved by the region's bump blocks.
    #[must_use]
    pub fn reserved_block_bytes(&self) -> usize {
        self.inner.state.lock().blocks.reserved()
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    fn insert(&self, object: Object) -> RegionResult<Handle> {
        let mut state = self.inner.state.lock();
        if !state.alive {
            state.stats.record_failure();
            return Err(RegionError::Destroyed { region: self.id() });
        }
        state.insert(self.id(), object)
    }

    /// Allocate a string.
    pub fn alloc_str(&self, s: &str) -> RegionResult<Handle> {
        self.insert(Object::Str(s.into()))
    }

    /// Allocate an array holding `values`.
    pub fn alloc_array(&self, values: Vec<Value>) -> RegionResult<Handle> {
        self.insert(Object::Array(values))
    }

    /// Copy a raw struct payload into the region's bump blocks.
    pub fn alloc_blob(&self, bytes: &[u8], align: Alignment) -> RegionResult<Handle> {
        let mut state = self.inner.state.lock();
        if !state.alive {
            state.stats.record_failure();
            return Err(RegionError::Destroyed { region: self.id() });
        }
        let blob = match state.blocks.alloc(bytes, align.as_usize()) {
            Ok(blob) => blob,
            Err(e) => {
                state.stats.record_failure();
                return Err(e.into());
            }
        };
        state.insert(self.id(), Object::Blob(blob))
    }

    /// Allocate an opaque bookkeeping record.
    pub fn alloc_record(&self, label: &'static str) -> RegionResult<Handle> {
        self.insert(Object::Record(label))
    }

    /// Release one object.
    ///
    /// Releasing twice is an error; the second call does nothing else.
    pub fn release(&self, handle: Handle) -> RegionResult<()> {
        let owner = self.owner_of(handle)?;
        let mut state = owner.inner.state.lock();
        let slot = Self::live_slot_mut(&mut state, owner, handle)?;
        let footprint = slot.object.as_ref().map_or(0, Object::footprint);
        slot.object = None;
        slot.freezes.clear();
        state.stats.record_dealloc(footprint);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    /// Find the region in this region's ancestry that owns `handle`.
    fn owner_of(&self, handle: Handle) -> RegionResult<&Region> {
        let mut current = Some(self);
        while let Some(region) = current {
            if region.id() == handle.region() {
                return Ok(region);
            }
            current = region.parent();
        }
        Err(RegionError::Foreign {
            handle,
            region: self.id(),
        })
    }

    fn live_slot_mut<'s>(
        state: &'s mut RegionState,
        owner: &Region,
        handle: Handle,
    ) -> RegionResult<&'s mut Slot> {
        if !state.alive {
            return Err(RegionError::Destroyed { region: owner.id() });
        }
        let slot = state
            .slots
            .get_mut(handle.slot() as usize)
            .ok_or(RegionError::Foreign {
                handle,
                region: owner.id(),
            })?;
        if slot.object.is_none() {
            return Err(RegionError::Released { handle });
        }
        Ok(slot)
    }

    fn with_object<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&Object, &BlockChain) -> RegionResult<R>,
    ) -> RegionResult<R> {
        let owner = self.owner_of(handle)?;
        let state = owner.inner.state.lock();
        if !state.alive {
            return Err(RegionError::Destroyed { region: owner.id() });
        }
        let object = state
            .slots
            .get(handle.slot() as usize)
            .ok_or(RegionError::Foreign {
                handle,
                region: owner.id(),
            })?
            .object
            .as_ref()
            .ok_or(RegionError::Released { handle })?;
        f(object, &state.blocks)
    }

    fn with_writable<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut Object) -> RegionResult<R>,
    ) -> RegionResult<R> {
        let owner = self.owner_of(handle)?;
        let mut state = owner.inner.state.lock();
        let slot = Self::live_slot_mut(&mut state, owner, handle)?;
        let me = thread::current().id();
        if slot.freezes.iter().any(|(thread, _)| *thread == me) {
            return Err(RegionError::Frozen { handle });
        }
        match slot.object.as_mut() {
            Some(object) => f(object),
            None => Err(RegionError::Released { handle }),
        }
    }

    /// Kind of the object behind `handle`.
    pub fn kind(&self, handle: Handle) -> RegionResult<ObjectKind> {
        self.with_object(handle, |object, _| Ok(object.kind()))
    }

    /// Whether `handle` resolves from this region to a live object.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.kind(handle).is_ok()
    }

    /// Copy a string's contents out of the region.
    pub fn read_str(&self, handle: Handle) -> RegionResult<String> {
        self.with_object(handle, |object, _| match object {
            Object::Str(s) => Ok(s.to_string()),
            other => Err(mismatch(handle, ObjectKind::Str, other)),
        })
    }

    /// Number of elements in an array.
    pub fn array_len(&self, handle: Handle) -> RegionResult<usize> {
        self.with_object(handle, |object, _| match object {
            Object::Array(values) => Ok(values.len()),
            other => Err(mismatch(handle, ObjectKind::Array, other)),
        })
    }

    /// One array element.
    pub fn array_get(&self, handle: Handle, index: usize) -> RegionResult<Value> {
        self.with_object(handle, |object, _| match object {
            Object::Array(values) => values.get(index).copied().ok_or(RegionError::OutOfBounds {
                index,
                len: values.len(),
            }),
            other => Err(mismatch(handle, ObjectKind::Array, other)),
        })
    }

    /// Snapshot of all array elements.
    pub fn array_values(&self, handle: Handle) -> RegionResult<Vec<Value>> {
        self.with_object(handle, |object, _| match object {
            Object::Array(values) => Ok(values.clone()),
            other => Err(mismatch(handle, ObjectKind::Array, other)),
        })
    }

    /// Overwrite one array element in place.
    ///
    /// A `value` the array's owner cannot reach is copied into the owner
    /// first, see [`adopt`](Region::adopt).
    pub fn array_set(&self, handle: Handle, index: usize, value: Value) -> RegionResult<()> {
        let value = self.owner_of(handle)?.adopt(value, self)?;
        self.with_writable(handle, |object| match object {
            Object::Array(values) => {
                let len = values.len();
                let slot = values
                    .get_mut(index)
                    .ok_or(RegionError::OutOfBounds { index, len })?;
                *slot = value;
                Ok(())
            }
            other => Err(mismatch(handle, ObjectKind::Array, other)),
        })
    }

    /// Append to an array in place, adopting `value` like [`array_set`].
    ///
    /// [`array_set`]: Region::array_set
    pub fn array_push(&self, handle: Handle, value: Value) -> RegionResult<()> {
        let value = self.owner_of(handle)?.adopt(value, self)?;
        self.with_writable(handle, |object| match object {
            Object::Array(values) => {
                values.push(value);
                Ok(())
            }
            other => Err(mismatch(handle, ObjectKind::Array, other)),
        })
    }

    /// Copy a struct payload out of the region.
    pub fn read_blob(&self, handle: Handle) -> RegionResult<Vec<u8>> {
        self.with_object(handle, |object, blocks| match object {
            Object::Blob(blob) => Ok(blocks.get(*blob).to_vec()),
            other => Err(mismatch(handle, ObjectKind::Blob, other)),
        })
    }

    /// Label of a bookkeeping record.
    pub fn record_label(&self, handle: Handle) -> RegionResult<&'static str> {
        self.with_object(handle, |object, _| match object {
            Object::Record(label) => Ok(*label),
            other => Err(mismatch(handle, ObjectKind::Record, other)),
        })
    }

    // ------------------------------------------------------------------------
    // Freezing
    // ------------------------------------------------------------------------

    /// Forbid `owner` from writing the object until a matching [`thaw`].
    ///
    /// Freezes nest: each call needs its own thaw.
    ///
    /// [`thaw`]: Region::thaw
    pub fn freeze(&self, handle: Handle, owner: ThreadId) -> RegionResult<()> {
        let region = self.owner_of(handle)?;
        let mut state = region.inner.state.lock();
        let slot = Self::live_slot_mut(&mut state, region, handle)?;
        match slot.freezes.iter_mut().find(|(thread, _)| *thread == owner) {
            Some((_, count)) => *count += 1,
            None => slot.freezes.push((owner, 1)),
        }
        trace!(%handle, ?owner, "frozen");
        Ok(())
    }

    /// Undo one [`freeze`](Region::freeze) by `owner`.
    pub fn thaw(&self, handle: Handle, owner: ThreadId) -> RegionResult<()> {
        let region = self.owner_of(handle)?;
        let mut state = region.inner.state.lock();
        let slot = Self::live_slot_mut(&mut state, region, handle)?;
        let index = slot
            .freezes
            .iter()
            .position(|(thread, _)| *thread == owner)
            .ok_or(RegionError::NotFrozen { handle })?;
        slot.freezes[index].1 -= 1;
        if slot.freezes[index].1 == 0 {
            slot.freezes.swap_remove(index);
        }
        trace!(%handle, ?owner, "thawed");
        Ok(())
    }

    /// Whether any thread currently holds a freeze on the object.
    pub fn is_frozen(&self, handle: Handle) -> RegionResult<bool> {
        let region = self.owner_of(handle)?;
        let mut state = region.inner.state.lock();
        let slot = Self::live_slot_mut(&mut state, region, handle)?;
        Ok(!slot.freezes.is_empty())
    }

    // ------------------------------------------------------------------------
    // Cleanup and Teardown
    // ------------------------------------------------------------------------

    /// Register a callback to run when the region is destroyed.
    ///
    /// Lower priorities run first; equal priorities run in registration
    /// order. Fails once destruction has begun.
    pub fn on_cleanup<F>(&self, priority: i32, f: F) -> RegionResult<CleanupKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.alive || state.destroying {
            return Err(RegionError::Destroyed { region: self.id() });
        }
        let key = CleanupKey(state.next_cleanup);
        state.next_cleanup += 1;
        state.cleanups.push(Cleanup {
            key,
            priority,
            run: Box::new(f),
        });
        Ok(key)
    }

    /// Unregister a cleanup callback. Returns whether it was still pending.
    pub fn remove_cleanup(&self, key: CleanupKey) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.cleanups.len();
        state.cleanups.retain(|cleanup| cleanup.key != key);
        state.cleanups.len() != before
    }

    /// Number of pending cleanup callbacks.
    #[must_use]
    pub fn pending_cleanups(&self) -> usize {
        self.inner.state.lock().cleanups.len()
    }

    /// Destroy the region.
    ///
    /// Runs cleanup callbacks (the region is still usable while they run),
    /// destroys live children, then frees every object. Calling it again,
    /// including from inside a callback, does nothing.
    pub fn destroy(&self) {
        let (mut cleanups, children) = {
            let mut state = self.inner.state.lock();
            if !state.alive || state.destroying {
                return;
            }
            state.destroying = true;
            (
                std::mem::take(&mut state.cleanups),
                std::mem::take(&mut state.children),
            )
        };

        cleanups.sort_by_key(|cleanup| cleanup.priority);
        debug!(
            region = %self.id(),
            region_name = %self.name(),
            cleanups = cleanups.len(),
            "destroying region"
        );
        for cleanup in cleanups {
            (cleanup.run)();
        }

        for child in children.iter().filter_map(Weak::upgrade) {
            Region { inner: child }.destroy();
        }

        let mut state = self.inner.state.lock();
        let footprints: Vec<usize> = state
            .slots
            .iter()
            .filter_map(|slot| slot.object.as_ref().map(Object::footprint))
            .collect();
        for footprint in footprints {
            state.stats.record_dealloc(footprint);
        }
        state.slots.clear();
        state.blocks.clear();
        state.alive = false;
    }

    // ------------------------------------------------------------------------
    // Value Trees
    // ------------------------------------------------------------------------

    /// Allocate a value tree into this region.
    pub fn build(&self, tree: &Materialized) -> RegionResult<Value> {
        Ok(match tree {
            Materialized::Void => Value::Void,
            Materialized::Int(v) => Value::Int(*v),
            Materialized::Double(v) => Value::Double(*v),
            Materialized::Bool(v) => Value::Bool(*v),
            Materialized::Byte(v) => Value::Byte(*v),
            Materialized::Char(v) => Value::Char(*v),
            Materialized::Str(s) => Value::Str(self.alloc_str(s)?),
            Materialized::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.build(item))
                    .collect::<RegionResult<Vec<_>>>()?;
                Value::Array(self.alloc_array(values)?)
            }
            Materialized::Struct(bytes) => Value::Struct(self.alloc_blob(bytes, Alignment::Default)?),
        })
    }

    /// Deep-copy `value` into this region unless it is already reachable
    /// from here. `from` is the region that resolves the value's handles.
    ///
    /// Shared structure and cycles among the copied objects are preserved.
    pub fn adopt(&self, value: Value, from: &Region) -> RegionResult<Value> {
        Adoption {
            from,
            into: self,
            copies: FxHashMap::default(),
        }
        .value(value)
    }

    /// Resolve a value and everything it references into owned data.
    pub fn materialize(&self, value: &Value) -> RegionResult<Materialized> {
        Ok(match *value {
            Value::Void => Materialized::Void,
            Value::Int(v) => Materialized::Int(v),
            Value::Double(v) => Materialized::Double(v),
            Value::Bool(v) => Materialized::Bool(v),
            Value::Byte(v) => Materialized::Byte(v),
            Value::Char(v) => Materialized::Char(v),
            Value::Str(h) => Materialized::Str(self.read_str(h)?),
            Value::Array(h) => Materialized::Array(
                self.array_values(h)?
                    .iter()
                    .map(|item| self.materialize(item))
                    .collect::<RegionResult<Vec<_>>>()?,
            ),
            Value::Struct(h) => Materialized::Struct(self.read_blob(h)?),
        })
    }
}

/// One deep copy, remembering what was already copied.
struct Adoption<'r> {
    from: &'r Region,
    into: &'r Region,
    copies: FxHashMap<Handle, Handle>,
}

impl Adoption<'_> {
    fn value(&mut self, value: Value) -> RegionResult<Value> {
        Ok(match value {
            Value::Str(h) => Value::Str(self.handle(h)?),
            Value::Array(h) => Value::Array(self.handle(h)?),
            Value::Struct(h) => Value::Struct(self.handle(h)?),
            primitive => primitive,
        })
    }

    fn handle(&mut self, handle: Handle) -> RegionResult<Handle> {
        if self.into.contains(handle) {
            return Ok(handle);
        }
        if let Some(&copy) = self.copies.get(&handle) {
            return Ok(copy);
        }
        let copy = match self.from.kind(handle)? {
            ObjectKind::Str => self.into.alloc_str(&self.from.read_str(handle)?)?,
            ObjectKind::Array => {
                // Registered before the elements so a cycle ends here.
                let copy = self.into.alloc_array(Vec::new())?;
                self.copies.insert(handle, copy);
                let mut items = Vec::new();
                for item in self.from.array_values(handle)? {
                    items.push(self.value(item)?);
                }
                self.into.with_writable(copy, |object| {
                    if let Object::Array(values) = object {
                        *values = items;
                    }
                    Ok(())
                })?;
                copy
            }
            ObjectKind::Blob => {
                self.into
                    .alloc_blob(&self.from.read_blob(handle)?, Alignment::Default)?
            }
            ObjectKind::Record => self.into.alloc_record(self.from.record_label(handle)?)?,
        };
        self.copies.insert(handle, copy);
        trace!(from = %handle, to = %copy, "adopted");
        Ok(copy)
    }
}

fn mismatch(handle: Handle, expected: ObjectKind, found: &Object) -> RegionError {
    RegionError::KindMismatch {
        handle,
        expected,
        found: found.kind(),
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Destroys the wrapped region on drop.
struct DestroyOnDrop(Region);

impl Drop for DestroyOnDrop {
    fn drop(&mut self) {
        self.0.destroy();
    }
}

/// Execute a function with a fresh root region, destroying it afterwards.
///
/// The region is destroyed even if `f` unwinds.
pub fn with_region<F, R>(f: F) -> R
where
    F: FnOnce(&Region) -> R,
{
    let guard = DestroyOnDrop(Region::root());
    f(&guard.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_region_ids_unique() {
        let a = Region::root();
        let b = Region::root();
        assert_ne!(a.id(), b.id());
        assert!(a.parent().is_none());
    }

    #[test]
    fn test_alloc_and_read_string() {
        let region = Region::root();
        let h = region.alloc_str("hello").unwrap();
        assert_eq!(region.read_str(h).unwrap(), "hello");
        assert_eq!(region.kind(h).unwrap(), ObjectKind::Str);
        assert_eq!(region.live_objects(), 1);
        assert_eq!(region.stats().bytes_allocated, 5);
    }

    #[test]
    fn test_kind_mismatch() {
        let region = Region::root();
        let h = region.alloc_str("x").unwrap();
        assert!(matches!(
            region.array_len(h),
            Err(RegionError::KindMismatch {
                expected: ObjectKind::Array,
                found: ObjectKind::Str,
                ..
            })
        ));
    }

    #[test]
    fn test_array_set_and_bounds() {
        let region = Region::root();
        let h = region
            .alloc_array(vec![Value::Int(1), Value::Int(2)])
            .unwrap();
        region.array_set(h, 1, Value::Int(20)).unwrap();
        region.array_push(h, Value::Int(30)).unwrap();
        assert_eq!(
            region.array_values(h).unwrap(),
            vec![Value::Int(1), Value::Int(20), Value::Int(30)]
        );
        assert_eq!(
            region.array_get(h, 5),
            Err(RegionError::OutOfBounds { index: 5, len: 3 })
        );
    }

    #[test]
    fn test_push_from_child_copies_into_owner() {
        let parent = Region::root();
        let child = Region::child(&parent).unwrap();
        let list = parent.alloc_array(vec![Value::Int(0)]).unwrap();

        let s = child.alloc_str("from child").unwrap();
        let inner = child.alloc_array(vec![Value::Str(s), Value::Str(s)]).unwrap();
        child.array_set(list, 0, Value::Array(inner)).unwrap();
        child.array_push(list, Value::Str(s)).unwrap();
        child.destroy();

        let Value::Array(copy) = parent.array_get(list, 0).unwrap() else {
            panic!("expected an array element");
        };
        assert_eq!(copy.region(), parent.id());
        let items = parent.array_values(copy).unwrap();
        assert_eq!(items[0], items[1]);
        assert_eq!(
            parent.materialize(&Value::Array(list)).unwrap(),
            Materialized::Array(vec![
                Materialized::Array(vec![
                    Materialized::Str("from child".into()),
                    Materialized::Str("from child".into()),
                ]),
                Materialized::Str("from child".into()),
            ])
        );
    }

    #[test]
    fn test_adopt_keeps_cycles() {
        let parent = Region::root();
        let child = Region::child(&parent).unwrap();
        let looped = child.alloc_array(vec![Value::Int(1)]).unwrap();
        child.array_push(looped, Value::Array(looped)).unwrap();

        let Value::Array(copy) = parent.adopt(Value::Array(looped), &child).unwrap() else {
            panic!("expected an array");
        };
        assert_eq!(
            parent.array_values(copy).unwrap(),
            vec![Value::Int(1), Value::Array(copy)]
        );

        let own = parent.alloc_str("mine").unwrap();
        assert_eq!(parent.adopt(Value::Str(own), &child), Ok(Value::Str(own)));
    }

    #[test]
    fn test_release_twice() {
        let region = Region::root();
        let h = region.alloc_record("thread handle").unwrap();
        assert_eq!(region.record_label(h).unwrap(), "thread handle");
        region.release(h).unwrap();
        assert_eq!(region.release(h), Err(RegionError::Released { handle: h }));
        assert_eq!(region.live_objects(), 0);
        assert_eq!(region.stats().deallocation_count, 1);
        assert_eq!(region.stats().live_allocations(), 0);
    }

    #[test]
    fn test_child_reads_ancestor_but_not_reverse() {
        let root = Region::root();
        let child = Region::child(&root).unwrap();
        let grandchild = Region::child(&child).unwrap();

        let in_root = root.alloc_str("root").unwrap();
        let in_grandchild = grandchild.alloc_str("deep").unwrap();

        assert_eq!(grandchild.read_str(in_root).unwrap(), "root");
        assert!(matches!(
            root.read_str(in_grandchild),
            Err(RegionError::Foreign { .. })
        ));
        assert!(root.is_ancestor_of(&grandchild));
        assert!(!grandchild.is_ancestor_of(&root));
    }

    #[test]
    fn test_destroy_cascades_to_children() {
        let root = Region::root();
        let child = Region::child(&root).unwrap();
        let h = child.alloc_str("gone").unwrap();

        root.destroy();
        assert!(!root.is_alive());
        assert!(!child.is_alive());
        assert_eq!(
            child.read_str(h),
            Err(RegionError::Destroyed { region: child.id() })
        );
        assert!(matches!(
            child.alloc_str("late"),
            Err(RegionError::Destroyed { .. })
        ));
        assert!(Region::child(&root).is_err());
    }

    #[test]
    fn test_destroy_idempotent() {
        let region = Region::root();
        region.alloc_str("a").unwrap();
        region.destroy();
        region.destroy();
        assert_eq!(region.stats().bytes_allocated, 0);
    }

    #[test]
    fn test_cleanup_priority_order() {
        let region = Region::root();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (priority, tag) in [
            (CLEANUP_PRIORITY_LOW, "low"),
            (CLEANUP_PRIORITY_HIGH, "high"),
            (CLEANUP_PRIORITY_NORMAL, "normal"),
            (CLEANUP_PRIORITY_HIGH, "high2"),
        ] {
            let order = Arc::clone(&order);
            region
                .on_cleanup(priority, move || order.lock().push(tag))
                .unwrap();
        }

        region.destroy();
        assert_eq!(*order.lock(), vec!["high", "high2", "normal", "low"]);
    }

    #[test]
    fn test_cleanup_sees_live_region() {
        let region = Region::root();
        let h = region.alloc_record("box").unwrap();
        let inner = region.clone();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        region
            .on_cleanup(CLEANUP_PRIORITY_HIGH, move || {
                if inner.release(h).is_ok() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                assert!(inner.on_cleanup(CLEANUP_PRIORITY_LOW, || {}).is_err());
            })
            .unwrap();
        region.destroy();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_cleanup() {
        let region = Region::root();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let key = region
            .on_cleanup(CLEANUP_PRIORITY_NORMAL, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(region.remove_cleanup(key));
        assert!(!region.remove_cleanup(key));
        region.destroy();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_freeze_blocks_owner_only() {
        let region = Region::root();
        let h = region.alloc_array(vec![Value::Int(0)]).unwrap();
        let me = thread::current().id();

        region.freeze(h, me).unwrap();
        region.freeze(h, me).unwrap();
        assert!(region.is_frozen(h).unwrap());
        assert_eq!(
            region.array_set(h, 0, Value::Int(1)),
            Err(RegionError::Frozen { handle: h })
        );

        // Another thread may still write.
        let other = region.clone();
        thread::spawn(move || other.array_set(h, 0, Value::Int(2)))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(region.array_get(h, 0).unwrap(), Value::Int(2));

        region.thaw(h, me).unwrap();
        assert!(region.is_frozen(h).unwrap());
        region.thaw(h, me).unwrap();
        assert!(!region.is_frozen(h).unwrap());
        region.array_set(h, 0, Value::Int(3)).unwrap();
        assert_eq!(region.thaw(h, me), Err(RegionError::NotFrozen { handle: h }));
    }

    #[test]
    fn test_blob_storage() {
        let region = Region::root();
        let a = region.alloc_blob(&[1, 2, 3, 4], Alignment::Default).unwrap();
        let b = region.alloc_blob(&[5; 16], Alignment::CacheLine).unwrap();
        assert_eq!(region.read_blob(a).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(region.read_blob(b).unwrap(), vec![5; 16]);
        assert_eq!(region.reserved_block_bytes(), DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_build_and_materialize() {
        let region = Region::root();
        let tree = Materialized::Array(vec![
            Materialized::Str("a".into()),
            Materialized::Array(vec![Materialized::Int(1), Materialized::Char('z')]),
            Materialized::Struct(vec![9, 8, 7]),
        ]);
        let value = region.build(&tree).unwrap();
        assert_eq!(region.materialize(&value).unwrap(), tree);
    }

    #[test]
    fn test_with_region_destroys() {
        let kept = with_region(|region| {
            region.alloc_str("x").unwrap();
            region.clone()
        });
        assert!(!kept.is_alive());
    }
}
