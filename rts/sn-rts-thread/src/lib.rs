//! Threads for the Sindarin runtime system.
//!
//! Sindarin spawns a function on a new OS thread with `&fn(...)` and joins it
//! with `!`. This crate implements both operators and the memory-ownership
//! rules that make them safe without a tracing collector:
//!
//! - **Ownership modes** - a spawn runs in default, shared or private mode,
//!   which decides the region the thread allocates into
//! - **Promotion** - results are deep-copied out of a thread's region into
//!   the caller's before that region is destroyed
//! - **Panic forwarding** - a panic inside a thread becomes the outcome of
//!   its sync and is re-raised in the syncing thread
//! - **Auto-join** - threads never synced are joined when the caller's
//!   region is torn down
//! - **Lock table** - per-variable mutexes backing `lock(var) => { ... }`
//!
//! # Spawning and Syncing
//!
//! ```ignore
//! use sn_rts_region::{Region, Value};
//! use sn_rts_thread::{ResultType, ThreadArgs, ThreadRuntime};
//!
//! let runtime = ThreadRuntime::default();
//! let caller = Region::root();
//!
//! let handle = runtime.spawn(
//!     &caller,
//!     ThreadArgs::new(|ctx, _| Value::Str(ctx.region().alloc_str("hi").unwrap()))
//!         .result_type(ResultType::Str),
//! )?;
//!
//! // The string now lives in `caller`; the thread's region is gone.
//! let value = runtime.sync(&handle)?.value();
//! ```
//!
//! # Ownership Modes
//!
//! | Mode    | Working region              | At sync                       |
//! |---------|-----------------------------|-------------------------------|
//! | default | new child of caller         | promote result, destroy child |
//! | shared  | the caller's region         | nothing to promote            |
//! | private | new isolated root           | primitives only, destroy it   |

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod context;
pub mod contract;
pub mod handle;
pub mod lock;
pub mod mode;
pub mod promote;
pub mod registry;
pub mod runtime;

pub use context::{
    current_region, current_region_or, current_thread, has_panic_context, raise, ThreadContext,
};
pub use contract::{ArgKind, ArgShape, ContractError, FunctionModifier, ParamQualifier, SpawnSite};
pub use handle::{SpawnId, ThreadHandle, ThreadState};
pub use lock::{LockError, LockGuard, LockKey, SyncLockTable};
pub use mode::{OwnershipMode, ResultType, ThreadRegion};
pub use promote::{promote_result, Promote, PromoteError};
pub use registry::ThreadRegistry;
pub use runtime::{
    is_done, DeferredSync, JoinError, SpawnError, SyncError, Synced, ThreadArgs, ThreadConfig,
    ThreadEntry, ThreadPanic, ThreadRuntime, ThreadStats,
};
