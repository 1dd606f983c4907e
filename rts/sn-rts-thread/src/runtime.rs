//! Spawn, join and sync.
//!
//! [`ThreadRuntime`] owns the thread registry and statistics and implements
//! the lifecycle of a spawned thread:
//!
//! ```text
//!  spawn ──► Running ──► Completed / Panicked ──► claimed ──► released
//!                                                   ▲
//!                  sync / join / auto-join / dispose┘
//! ```
//!
//! Exactly one party claims a thread. Whoever claims it waits for the
//! outcome, joins the OS thread, and releases the spawn's resources.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use sn_rts_region::{Handle, Region, RegionError, RegionId, Value, CLEANUP_PRIORITY_HIGH};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::context::{self, ThreadContext};
use crate::contract::{ContractError, SpawnSite};
use crate::handle::{Outcome, PanicPayload, SpawnId, ThreadHandle, ThreadShared};
use crate::mode::{OwnershipMode, ResultType, ThreadRegion};
use crate::promote::{promote_result, Promote, PromoteError};
use crate::registry::ThreadRegistry;

// ============================================================================
// Configuration and Stats
// ============================================================================

/// Configuration for spawned threads.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Stack size for spawned threads; the platform default when `None`.
    pub stack_size: Option<usize>,
    /// Block `spawn` until the new thread has taken its arguments.
    pub start_barrier: bool,
    /// Refuse to spawn beyond this many live threads.
    pub max_threads: Option<usize>,
    /// How long [`ThreadRuntime::shutdown`] waits for each running thread.
    pub shutdown_grace: Duration,
    /// Prefix for OS thread names.
    pub name_prefix: String,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            stack_size: None,
            start_barrier: true,
            max_threads: None,
            shutdown_grace: Duration::from_secs(1),
            name_prefix: "sn-thread".to_string(),
        }
    }
}

/// Statistics for spawned threads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Threads successfully launched.
    pub spawned: u64,
    /// Threads synced (including syncs that surfaced a panic).
    pub synced: u64,
    /// Syncs that surfaced a panic.
    pub panicked: u64,
    /// Threads joined by their caller region's teardown.
    pub auto_joined: u64,
    /// Fire-and-forget threads that disposed themselves.
    pub disposed: u64,
    /// Spawns rolled back because the thread could not be launched.
    pub launch_failures: u64,
    /// Threads still running when shutdown gave up on them.
    pub abandoned: u64,
}

// ============================================================================
// Errors and Results
// ============================================================================

/// Errors returned by [`ThreadRuntime::spawn`].
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The caller's region is already destroyed.
    #[error("cannot spawn from {region}: region has been destroyed")]
    CallerDestroyed {
        /// The destroyed region.
        region: RegionId,
    },
    /// Allocating the handle, result box or thread region failed.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// The spawn site violates the ownership contract.
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// The configured live-thread limit is reached.
    #[error("live thread limit of {limit} reached")]
    LimitReached {
        /// The configured limit.
        limit: usize,
    },
    /// The OS refused to start a thread.
    #[error("failed to launch thread: {0}")]
    Launch(#[source] std::io::Error),
}

/// Errors returned by [`ThreadRuntime::join`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The thread was already joined or synced.
    #[error("{thread} has already been joined")]
    AlreadyJoined {
        /// The thread.
        thread: SpawnId,
    },
}

/// A panic raised by a spawned thread, surfaced at its sync.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{thread} panicked: {message}")]
pub struct ThreadPanic {
    thread: SpawnId,
    message: String,
    promoted: Option<Handle>,
}

impl ThreadPanic {
    /// The thread that panicked.
    #[must_use]
    pub fn thread(&self) -> SpawnId {
        self.thread
    }

    /// The panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The message as a string in the caller's region, when it could be
    /// promoted there.
    #[must_use]
    pub fn promoted(&self) -> Option<Handle> {
        self.promoted
    }

    /// Re-raise the panic in the current thread.
    pub fn raise(self) -> ! {
        context::raise(self.message)
    }
}

/// Errors returned by the sync family.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The thread panicked.
    #[error(transparent)]
    Panicked(ThreadPanic),
    /// The result could not be promoted into the caller's region.
    #[error(transparent)]
    Promote(#[from] PromoteError),
}

/// Successful outcome of a sync.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Synced {
    /// The promoted result.
    Value(Value),
    /// The function returns nothing.
    Void,
    /// The handle had already been synced; nothing happened.
    AlreadySynced,
}

impl Synced {
    /// The result value, if there is one.
    #[must_use]
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Void | Self::AlreadySynced => None,
        }
    }
}

// ============================================================================
// Spawn Arguments
// ============================================================================

/// The function a spawned thread runs.
pub type ThreadEntry = Box<dyn FnOnce(&ThreadContext, Vec<Value>) -> Value + Send + 'static>;

/// Everything needed to spawn one thread.
pub struct ThreadArgs {
    entry: ThreadEntry,
    args: Vec<Value>,
    mode: OwnershipMode,
    result_type: ResultType,
    frozen: Vec<Handle>,
    detached: bool,
}

impl ThreadArgs {
    /// Spawn `entry` in default mode with a void result and no arguments.
    #[must_use]
    pub fn new<F>(entry: F) -> Self
    where
        F: FnOnce(&ThreadContext, Vec<Value>) -> Value + Send + 'static,
    {
        Self {
            entry: Box::new(entry),
            args: Vec::new(),
            mode: OwnershipMode::Default,
            result_type: ResultType::Void,
            frozen: Vec::new(),
            detached: false,
        }
    }

    /// Arguments for a planned spawn site: mode, result type and frozen
    /// arguments all come from `site`.
    #[must_use]
    pub fn from_site<F>(entry: F, site: &SpawnSite, args: Vec<Value>) -> Self
    where
        F: FnOnce(&ThreadContext, Vec<Value>) -> Value + Send + 'static,
    {
        let frozen = site.frozen_handles(&args);
        Self::new(entry)
            .mode(site.mode())
            .result_type(site.result_type().clone())
            .args(args)
            .freeze_all(frozen)
    }

    /// Arguments passed to the entry function.
    #[must_use]
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Ownership mode.
    #[must_use]
    pub fn mode(mut self, mode: OwnershipMode) -> Self {
        self.mode = mode;
        self
    }

    /// Declared result type.
    #[must_use]
    pub fn result_type(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }

    /// Freeze `handle` for the spawning thread until the sync.
    #[must_use]
    pub fn freeze(mut self, handle: Handle) -> Self {
        self.frozen.push(handle);
        self
    }

    /// Freeze several handles.
    #[must_use]
    pub fn freeze_all(mut self, handles: impl IntoIterator<Item = Handle>) -> Self {
        self.frozen.extend(handles);
        self
    }

    /// The thread disposes of itself when it finishes; nobody syncs it.
    #[must_use]
    pub fn fire_and_forget(mut self) -> Self {
        self.detached = true;
        self
    }
}

impl std::fmt::Debug for ThreadArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadArgs")
            .field("args", &self.args.len())
            .field("mode", &self.mode)
            .field("result_type", &self.result_type)
            .field("frozen", &self.frozen)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Start Barrier
// ============================================================================

/// One-shot latch the new thread opens once it owns its arguments.
#[derive(Default)]
struct StartBarrier {
    started: Mutex<bool>,
    condvar: Condvar,
}

impl StartBarrier {
    fn signal(&self) {
        *self.started.lock() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut started = self.started.lock();
        while !*started {
            self.condvar.wait(&mut started);
        }
    }
}

// ============================================================================
// Thread Runtime
// ============================================================================

/// State shared with running threads and cleanup callbacks.
#[derive(Default)]
struct Core {
    registry: ThreadRegistry,
    stats: RwLock<ThreadStats>,
}

/// Spawns and synchronizes runtime threads.
pub struct ThreadRuntime {
    config: ThreadConfig,
    core: Arc<Core>,
}

impl ThreadRuntime {
    /// Create a runtime with the given configuration.
    #[must_use]
    pub fn new(config: ThreadConfig) -> Self {
        Self {
            config,
            core: Arc::new(Core::default()),
        }
    }

    /// Create a runtime with default configuration.
    #[must_use]
    pub fn with_default_config() -> Self {
        Self::new(ThreadConfig::default())
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// Thread statistics.
    #[must_use]
    pub fn stats(&self) -> ThreadStats {
        self.core.stats.read().clone()
    }

    /// The registry of live threads.
    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.core.registry
    }

    /// Number of threads spawned and not yet synced or disposed.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.core.registry.len()
    }

    // ------------------------------------------------------------------------
    // Spawn
    // ------------------------------------------------------------------------

    /// Start a thread on behalf of code running in `caller`.
    ///
    /// The handle and result box are allocated in `caller`, the working
    /// region is chosen by the ownership mode, and the thread is registered
    /// for auto-join at `caller`'s teardown. Any failure rolls back every
    /// allocation made so far.
    pub fn spawn(&self, caller: &Region, args: ThreadArgs) -> Result<ThreadHandle, SpawnError> {
        if !caller.is_alive() {
            error!(region = %caller.id(), "spawn from a destroyed region");
            return Err(SpawnError::CallerDestroyed {
                region: caller.id(),
            });
        }

        let ThreadArgs {
            entry,
            args,
            mode,
            result_type,
            frozen,
            detached,
        } = args;
        let id = SpawnId::next();

        let handle_record = caller.alloc_record("thread handle")?;
        let result_record = match caller.alloc_record("result box") {
            Ok(record) => record,
            Err(e) => {
                let _ = caller.release(handle_record);
                return Err(e.into());
            }
        };
        let region = match ThreadRegion::select(mode, caller) {
            Ok(region) => region,
            Err(e) => {
                let _ = caller.release(result_record);
                let _ = caller.release(handle_record);
                return Err(e.into());
            }
        };

        let handle = ThreadHandle::new(ThreadShared::new(
            id,
            caller.clone(),
            region,
            result_type,
            detached,
            handle_record,
            result_record,
        ));
        let shared = &handle.shared;

        for arg in frozen {
            if let Err(e) = caller.freeze(arg, shared.spawner) {
                self.roll_back(&handle);
                return Err(e.into());
            }
            shared.frozen.lock().push(arg);
        }

        // Discoverable before the OS thread exists, so a fast fire-and-forget
        // thread always finds its own registration.
        if let Err(limit) = self
            .core
            .registry
            .try_insert(handle.clone(), self.config.max_threads)
        {
            warn!(thread = %id, limit, "live thread limit reached");
            self.roll_back(&handle);
            return Err(SpawnError::LimitReached { limit });
        }
        let auto_join = {
            let shared = Arc::downgrade(shared);
            let core = Arc::downgrade(&self.core);
            move || auto_join(&shared, &core)
        };
        match caller.on_cleanup(CLEANUP_PRIORITY_HIGH, auto_join) {
            Ok(key) => *shared.cleanup.lock() = Some(key),
            Err(e) => {
                self.roll_back(&handle);
                return Err(e.into());
            }
        }

        let barrier = self.config.start_barrier.then(|| Arc::new(StartBarrier::default()));
        let body = ThreadBody {
            shared: Arc::clone(shared),
            core: Arc::clone(&self.core),
            entry,
            args,
            barrier: barrier.clone(),
        };
        let mut builder =
            thread::Builder::new().name(format!("{}-{}", self.config.name_prefix, id.raw()));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        match builder.spawn(move || body.run()) {
            Ok(os) => *shared.os_thread.lock() = Some(os),
            Err(e) => {
                warn!(thread = %id, error = %e, "thread launch failed, rolling back");
                self.roll_back(&handle);
                self.core.stats.write().launch_failures += 1;
                return Err(SpawnError::Launch(e));
            }
        }

        if let Some(barrier) = barrier {
            barrier.wait();
        }
        self.core.stats.write().spawned += 1;
        debug!(thread = %id, %mode, caller = %caller.id(), detached, "thread spawned");
        Ok(handle)
    }

    /// Undo a spawn that never launched.
    fn roll_back(&self, handle: &ThreadHandle) {
        self.core.registry.remove(handle.id());
        handle.shared.claim();
        handle.shared.release();
    }

    // ------------------------------------------------------------------------
    // Join and Sync
    // ------------------------------------------------------------------------

    /// Wait for the outcome, join the OS thread and unregister.
    fn finish(&self, shared: &ThreadShared) -> Option<Outcome> {
        shared.wait();
        shared.reap();
        self.core.registry.remove(shared.id);
        shared.take_outcome()
    }

    /// Wait for the thread and return its raw result.
    ///
    /// No promotion, no panic check, no release: the value may still live in
    /// the thread's region, and [`release`](Self::release) must follow.
    /// Returns `None` when the thread panicked.
    pub fn join(&self, handle: &ThreadHandle) -> Result<Option<Value>, JoinError> {
        if !handle.shared.claim() {
            error!(thread = %handle.id(), "thread joined twice");
            return Err(JoinError::AlreadyJoined {
                thread: handle.id(),
            });
        }
        Ok(match self.finish(&handle.shared) {
            Some(Outcome::Value(value)) => Some(value),
            _ => None,
        })
    }

    /// Release a joined thread's resources. Returns whether anything was
    /// released.
    pub fn release(&self, handle: &ThreadHandle) -> bool {
        self.core.registry.remove(handle.id());
        handle.shared.release()
    }

    /// Wait for the thread, surface its panic or promote its result.
    ///
    /// A second sync on the same handle does nothing and reports
    /// [`Synced::AlreadySynced`].
    pub fn sync(&self, handle: &ThreadHandle) -> Result<Synced, SyncError> {
        let shared = &handle.shared;
        if !shared.claim() {
            trace!(thread = %shared.id, "already synced");
            return Ok(Synced::AlreadySynced);
        }
        let outcome = self.finish(shared);
        let result = match outcome {
            Some(Outcome::Panic(payload)) => Err(SyncError::Panicked(self.surface_panic(shared, payload))),
            Some(Outcome::Value(value)) => self.promote_value(shared, value).map_err(SyncError::from),
            None => Ok(Synced::Void),
        };
        shared.release();
        self.core.stats.write().synced += 1;
        result
    }

    /// [`sync`](Self::sync) for the `!` operator: panics are re-raised in
    /// the current thread and promotion failures are fatal.
    pub fn sync_or_raise(&self, handle: &ThreadHandle) -> Option<Value> {
        match self.sync(handle) {
            Ok(synced) => synced.value(),
            Err(SyncError::Panicked(panic)) => panic.raise(),
            Err(err) => {
                error!(thread = %handle.id(), error = %err, "sync failed");
                context::raise(err.to_string())
            }
        }
    }

    /// Sync every handle in order. Stops at the first failure; the remaining
    /// handles stay registered and are auto-joined with their caller region.
    pub fn sync_all(&self, handles: &[ThreadHandle]) -> Result<Vec<Synced>, SyncError> {
        handles.iter().map(|handle| self.sync(handle)).collect()
    }

    /// [`sync_all`](Self::sync_all) for `[a, b, c]!`.
    pub fn sync_all_or_raise(&self, handles: &[ThreadHandle]) -> Vec<Option<Value>> {
        handles.iter().map(|handle| self.sync_or_raise(handle)).collect()
    }

    /// Sync, but keep the thread's region alive so the caller can promote a
    /// composite result piece by piece.
    ///
    /// The region is destroyed when the returned guard is finished or
    /// dropped.
    pub fn sync_deferred(&self, handle: &ThreadHandle) -> Result<DeferredSync, SyncError> {
        let shared = &handle.shared;
        if !shared.claim() {
            return Ok(DeferredSync {
                shared: None,
                value: Synced::AlreadySynced,
            });
        }
        let outcome = self.finish(shared);
        self.core.stats.write().synced += 1;
        let value = match outcome {
            Some(Outcome::Panic(payload)) => {
                let panic = self.surface_panic(shared, payload);
                shared.release();
                return Err(SyncError::Panicked(panic));
            }
            Some(Outcome::Value(_)) if shared.result_type.is_void() => Synced::Void,
            Some(Outcome::Value(value)) => {
                if let ThreadRegion::Isolated(_) = shared.region {
                    if !shared.result_type.is_primitive() {
                        shared.release();
                        return Err(self.private_escape(shared).into());
                    }
                }
                Synced::Value(value)
            }
            None => Synced::Void,
        };
        Ok(DeferredSync {
            shared: Some(Arc::clone(shared)),
            value,
        })
    }

    fn surface_panic(&self, shared: &ThreadShared, payload: PanicPayload) -> ThreadPanic {
        let working = shared.region.working();
        let (message, promoted) = match payload {
            PanicPayload::InRegion(h) => {
                let message = working
                    .read_str(h)
                    .unwrap_or_else(|e| format!("<unreadable panic message: {e}>"));
                (message, h.promote(working, &shared.caller).ok())
            }
            PanicPayload::Text(message) => {
                let promoted = shared.caller.alloc_str(&message).ok();
                (message, promoted)
            }
        };
        self.core.stats.write().panicked += 1;
        debug!(thread = %shared.id, %message, "panic surfaced at sync");
        ThreadPanic {
            thread: shared.id,
            message,
            promoted,
        }
    }

    fn promote_value(&self, shared: &ThreadShared, value: Value) -> Result<Synced, PromoteError> {
        let ty = &shared.result_type;
        if ty.is_void() {
            return Ok(Synced::Void);
        }
        match &shared.region {
            ThreadRegion::Shared(_) => Ok(Synced::Value(value)),
            ThreadRegion::Isolated(_) if !ty.is_primitive() => Err(self.private_escape(shared)),
            region => {
                let promoted = promote_result(value, ty, region.working(), &shared.caller)?;
                Ok(Synced::Value(promoted))
            }
        }
    }

    fn private_escape(&self, shared: &ThreadShared) -> PromoteError {
        error!(
            thread = %shared.id,
            ty = %shared.result_type,
            "private thread cannot return a heap value"
        );
        PromoteError::PrivateEscape {
            ty: shared.result_type.clone(),
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop tracking every registered thread.
    ///
    /// Each thread gets up to `shutdown_grace` to finish. Finished threads
    /// are joined and released; threads still running are detached and
    /// their regions left alone, since a running thread cannot be stopped
    /// from outside.
    pub fn shutdown(&self) {
        let threads = self.core.registry.drain();
        debug!(threads = threads.len(), "thread runtime shutting down");
        for handle in threads {
            let shared = &handle.shared;
            if !shared.claim() {
                continue;
            }
            if shared.wait_timeout(self.config.shutdown_grace) {
                shared.reap();
                shared.take_outcome();
                shared.release();
            } else {
                warn!(thread = %shared.id, "abandoning thread still running at shutdown");
                shared.os_thread.lock().take();
                self.core.stats.write().abandoned += 1;
            }
        }
    }
}

impl Default for ThreadRuntime {
    fn default() -> Self {
        Self::with_default_config()
    }
}

impl std::fmt::Debug for ThreadRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRuntime")
            .field("config", &self.config)
            .field("live_threads", &self.live_threads())
            .finish()
    }
}

/// Whether a thread has finished. An absent handle counts as finished.
#[must_use]
pub fn is_done(handle: Option<&ThreadHandle>) -> bool {
    handle.map_or(true, ThreadHandle::is_done)
}

// ============================================================================
// Deferred Sync
// ============================================================================

/// A synced thread whose region is kept alive for field-wise promotion.
#[derive(Debug)]
pub struct DeferredSync {
    shared: Option<Arc<ThreadShared>>,
    value: Synced,
}

impl DeferredSync {
    /// The raw result, still owned by the thread's region.
    #[must_use]
    pub fn value(&self) -> Synced {
        self.value
    }

    /// The region the raw result lives in.
    #[must_use]
    pub fn source(&self) -> Option<&Region> {
        self.shared.as_ref().map(|shared| shared.region.working())
    }

    /// Promote one piece of the result into the caller's region.
    pub fn promote(&self, value: Value, ty: &ResultType) -> Result<Value, PromoteError> {
        match &self.shared {
            Some(shared) => promote_result(value, ty, shared.region.working(), &shared.caller),
            None => Ok(value),
        }
    }

    /// Destroy the thread's region now.
    pub fn finish(self) {}
}

impl Drop for DeferredSync {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

// ============================================================================
// Thread Body
// ============================================================================

struct ThreadBody {
    shared: Arc<ThreadShared>,
    core: Arc<Core>,
    entry: ThreadEntry,
    args: Vec<Value>,
    barrier: Option<Arc<StartBarrier>>,
}

impl ThreadBody {
    fn run(self) {
        let Self {
            shared,
            core,
            entry,
            args,
            barrier,
        } = self;

        let ctx = ThreadContext::new(
            shared.id,
            shared.region.working().clone(),
            shared.caller.clone(),
            shared.region.mode(),
        );
        context::install(ctx.clone());
        if let Some(barrier) = barrier {
            barrier.signal();
        }

        let result = catch_unwind(AssertUnwindSafe(|| entry(&ctx, args)));
        context::clear();

        let outcome = match result {
            Ok(value) => Outcome::Value(value),
            Err(payload) => {
                let message = context::panic_message(payload.as_ref());
                debug!(thread = %shared.id, %message, "thread panicked");
                match shared.region.working().alloc_str(&message) {
                    Ok(h) => Outcome::Panic(PanicPayload::InRegion(h)),
                    Err(_) => Outcome::Panic(PanicPayload::Text(message)),
                }
            }
        };
        shared.complete(outcome);

        if shared.detached {
            dispose(&shared, &core);
        }
    }
}

/// Self-cleanup of a fire-and-forget thread.
fn dispose(shared: &Arc<ThreadShared>, core: &Core) {
    if !shared.claim() {
        // The caller region is tearing down and already joining us.
        return;
    }
    core.registry.remove(shared.id);
    if let Some(Outcome::Panic(_)) = shared.take_outcome() {
        debug!(thread = %shared.id, "discarding panic of fire-and-forget thread");
    }
    shared.release();
    core.stats.write().disposed += 1;
}

/// Cleanup callback registered on the caller's region.
fn auto_join(shared: &Weak<ThreadShared>, core: &Weak<Core>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    if !shared.claim() {
        return;
    }
    shared.wait();
    shared.reap();
    if let Some(core) = core.upgrade() {
        core.registry.remove(shared.id);
        core.stats.write().auto_joined += 1;
    }
    if let Some(Outcome::Panic(_)) = shared.take_outcome() {
        debug!(thread = %shared.id, "discarding panic of auto-joined thread");
    }
    shared.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use sn_rts_region::Materialized;

    #[test]
    fn test_spawn_and_sync_int() {
        let rt = ThreadRuntime::default();
        let caller = Region::root();
        let handle = rt
            .spawn(
                &caller,
                ThreadArgs::new(|_, args| Value::Int(args[0].as_int().unwrap_or(0) * 2))
                    .args(vec![Value::Int(21)])
                    .result_type(ResultType::Int),
            )
            .unwrap();

        assert_eq!(rt.sync(&handle).unwrap(), Synced::Value(Value::Int(42)));
        assert!(handle.is_synced());
        assert!(handle.is_released());
        assert_eq!(caller.live_objects(), 0);
        assert_eq!(rt.live_threads(), 0);
    }

    #[test]
    fn test_second_sync_is_noop() {
        let rt = ThreadRuntime::default();
        let caller = Region::root();
        let handle = rt
            .spawn(
                &caller,
                ThreadArgs::new(|_, _| Value::Int(1)).result_type(ResultType::Int),
            )
            .unwrap();
        assert_eq!(rt.sync(&handle).unwrap(), Synced::Value(Value::Int(1)));
        assert_eq!(rt.sync(&handle).unwrap(), Synced::AlreadySynced);
        assert_eq!(rt.stats().synced, 1);
    }

    #[test]
    fn test_void_result() {
        let rt = ThreadRuntime::default();
        let caller = Region::root();
        let handle = rt.spawn(&caller, ThreadArgs::new(|_, _| Value::Void)).unwrap();
        assert_eq!(rt.sync(&handle).unwrap(), Synced::Void);
    }

    #[test]
    fn test_join_then_release() {
        let rt = ThreadRuntime::default();
        let caller = Region::root();
        let handle = rt
            .spawn(
                &caller,
                ThreadArgs::new(|ctx, _| Value::Str(ctx.region().alloc_str("raw").unwrap()))
                    .result_type(ResultType::Str),
            )
            .unwrap();

        let raw = rt.join(&handle).unwrap().unwrap();
        assert_eq!(
            handle.working_region().materialize(&raw).unwrap(),
            Materialized::Str("raw".into())
        );
        assert_eq!(
            rt.join(&handle),
            Err(JoinError::AlreadyJoined { thread: handle.id() })
        );
        assert_eq!(rt.sync(&handle).unwrap(), Synced::AlreadySynced);

        assert!(rt.release(&handle));
        assert!(!rt.release(&handle));
        assert!(!handle.working_region().is_alive());
    }

    #[test]
    fn test_is_done() {
        let rt = ThreadRuntime::default();
        let caller = Region::root();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_gate = Arc::clone(&gate);
        let handle = rt
            .spawn(
                &caller,
                ThreadArgs::new(move |_, _| {
                    let (open, cv) = &*thread_gate;
                    let mut open = open.lock();
                    while !*open {
                        cv.wait(&mut open);
                    }
                    Value::Void
                }),
            )
            .unwrap();

        assert!(!is_done(Some(&handle)));
        assert!(is_done(None));
        *gate.0.lock() = true;
        gate.1.notify_all();
        rt.sync(&handle).unwrap();
        assert!(is_done(Some(&handle)));
    }

    #[test]
    fn test_spawn_from_destroyed_region() {
        let rt = ThreadRuntime::default();
        let caller = Region::root();
        caller.destroy();
        assert!(matches!(
            rt.spawn(&caller, ThreadArgs::new(|_, _| Value::Void)),
            Err(SpawnError::CallerDestroyed { .. })
        ));
    }

    #[test]
    fn test_thread_limit_rolls_back() {
        let rt = ThreadRuntime::new(ThreadConfig {
            max_threads: Some(0),
            ..ThreadConfig::default()
        });
        let caller = Region::root();
        let arg = caller.alloc_array(vec![Value::Int(1)]).unwrap();

        let err = rt
            .spawn(&caller, ThreadArgs::new(|_, _| Value::Void).freeze(arg))
            .unwrap_err();
        assert!(matches!(err, SpawnError::LimitReached { limit: 0 }));

        // Only the argument survives; records are freed and it is thawed.
        assert_eq!(caller.live_objects(), 1);
        assert!(!caller.is_frozen(arg).unwrap());
        assert_eq!(caller.pending_cleanups(), 0);
        assert_eq!(rt.live_threads(), 0);
    }

    #[test]
    fn test_thread_limit_under_concurrent_spawns() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let rt = ThreadRuntime::new(ThreadConfig {
            max_threads: Some(4),
            ..ThreadConfig::default()
        });
        let caller = Region::root();
        let go = Arc::new(AtomicBool::new(false));

        let spawned: Vec<ThreadHandle> = thread::scope(|scope| {
            let spawners: Vec<_> = (0..16)
                .map(|_| {
                    let go = Arc::clone(&go);
                    let (rt, caller) = (&rt, &caller);
                    scope.spawn(move || {
                        rt.spawn(
                            caller,
                            ThreadArgs::new(move |_, _| {
                                while !go.load(Ordering::SeqCst) {
                                    thread::yield_now();
                                }
                                Value::Void
                            }),
                        )
                        .ok()
                    })
                })
                .collect();
            spawners
                .into_iter()
                .filter_map(|spawner| spawner.join().unwrap())
                .collect()
        });

        assert_eq!(spawned.len(), 4);
        assert_eq!(rt.live_threads(), 4);
        go.store(true, Ordering::SeqCst);
        for handle in &spawned {
            assert_eq!(rt.sync(handle), Ok(Synced::Void));
        }
        assert_eq!(rt.live_threads(), 0);
    }

    #[test]
    fn test_thread_names() {
        let rt = ThreadRuntime::new(ThreadConfig {
            name_prefix: "worker".to_string(),
            ..ThreadConfig::default()
        });
        let caller = Region::root();
        let handle = rt
            .spawn(
                &caller,
                ThreadArgs::new(|ctx, _| {
                    let name = thread::current().name().unwrap_or_default().to_string();
                    Value::Str(ctx.region().alloc_str(&name).unwrap())
                })
                .result_type(ResultType::Str),
            )
            .unwrap();
        let name = rt.sync(&handle).unwrap().value().unwrap();
        assert_eq!(
            caller.materialize(&name).unwrap(),
            Materialized::Str(format!("worker-{}", handle.id().raw()))
        );
    }
}
