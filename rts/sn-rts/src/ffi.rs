//! C ABI entry points for the Sindarin runtime system.
//!
//! These functions are called by compiled Sindarin programs.
//!
//! # Calling Convention
//!
//! All functions are `no_mangle`. Functions that may unwind, either because
//! they run generated code or because they re-raise a thread's panic, use
//! the `"C-unwind"` ABI; the rest use `"C"`.
//!
//! # Handles
//!
//! Regions cross the boundary as opaque pointers created by
//! [`sn_region_create`]. Threads cross it as their numeric runtime id; an
//! id that is no longer registered belongs to a thread that was already
//! synced, so syncing it again does nothing and [`sn_thread_is_done`]
//! reports it as finished.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::Arc;

use sn_rts_region::{Region, Value};
use sn_rts_thread::{context, OwnershipMode, ResultType, SpawnId, ThreadArgs, ThreadHandle};
use tracing::{error, trace};

use crate::{Runtime, RuntimeConfig};

/// Entry point of a spawned function returning an integer.
pub type SnEntryI64 = extern "C-unwind" fn(env: *mut c_void) -> i64;

/// Entry point of a spawned function returning nothing.
pub type SnEntryVoid = extern "C-unwind" fn(env: *mut c_void);

/// Closure environment handed to a spawned thread.
struct Env(*mut c_void);

// SAFETY: generated code transfers ownership of the environment to the
// spawned thread, which is its only user.
unsafe impl Send for Env {}

impl Env {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

fn runtime() -> Arc<Runtime> {
    match crate::global() {
        Some(runtime) => runtime,
        None => context::raise("sn_rts_init was not called"),
    }
}

/// Resolve the caller region; null means the runtime's root region.
///
/// # Safety
///
/// `region` must be null or a live pointer from [`sn_region_create`].
unsafe fn caller_region<'a>(runtime: &'a Runtime, region: *const Region) -> &'a Region {
    if region.is_null() {
        runtime.root()
    } else {
        // SAFETY: guaranteed by the caller.
        unsafe { &*region }
    }
}

fn lookup(runtime: &Runtime, thread: u64) -> Option<ThreadHandle> {
    let handle = runtime.threads().registry().get(SpawnId::from_raw(thread));
    if handle.is_none() {
        trace!(thread, "thread no longer registered");
    }
    handle
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Initialize the runtime from the environment.
///
/// Safe to call more than once; later calls are no-ops. An invalid
/// environment variable is reported and the defaults are used.
#[no_mangle]
pub extern "C" fn sn_rts_init() {
    let config = RuntimeConfig::from_env().unwrap_or_else(|e| {
        eprintln!("sn-rts: {e}; using defaults");
        RuntimeConfig::default()
    });
    crate::init(config);
}

/// Shut the runtime down.
#[no_mangle]
pub extern "C" fn sn_rts_shutdown() {
    crate::shutdown();
}

// ============================================================================
// Regions
// ============================================================================

/// Create a region. A null `parent` creates a child of the root region.
///
/// Returns null if the parent has been destroyed.
///
/// # Safety
///
/// `parent` must be null or a live pointer from [`sn_region_create`].
#[no_mangle]
pub unsafe extern "C-unwind" fn sn_region_create(parent: *const Region) -> *mut Region {
    let runtime = runtime();
    // SAFETY: guaranteed by the caller.
    let parent = unsafe { caller_region(&runtime, parent) };
    match Region::child(parent) {
        Ok(region) => Box::into_raw(Box::new(region)),
        Err(e) => {
            error!(error = %e, "region creation failed");
            std::ptr::null_mut()
        }
    }
}

/// Destroy a region and free its pointer.
///
/// Threads spawned from the region and never synced are joined first.
///
/// # Safety
///
/// `region` must be null or a pointer from [`sn_region_create`] that has not
/// been destroyed.
#[no_mangle]
pub unsafe extern "C-unwind" fn sn_region_destroy(region: *mut Region) {
    if region.is_null() {
        return;
    }
    // SAFETY: guaranteed by the caller.
    let region = unsafe { Box::from_raw(region) };
    region.destroy();
}

// ============================================================================
// Threads
// ============================================================================

/// # Safety
///
/// `caller` must be null or a live pointer from [`sn_region_create`].
unsafe fn spawn(caller: *const Region, mode: c_int, args: ThreadArgs) -> u64 {
    let runtime = runtime();
    let Some(mode) = OwnershipMode::from_raw(mode) else {
        error!(mode, "unknown ownership mode");
        return 0;
    };
    // SAFETY: guaranteed by the caller.
    let caller = unsafe { caller_region(&runtime, caller) };
    match runtime.threads().spawn(caller, args.mode(mode)) {
        Ok(handle) => handle.id().raw(),
        Err(e) => {
            error!(error = %e, "spawn failed");
            0
        }
    }
}

/// Spawn `entry(env)` returning an integer. Returns the thread id, or 0 if
/// the spawn failed.
///
/// # Safety
///
/// `caller` must be null or a live pointer from [`sn_region_create`]. `env`
/// must be safe to use from another thread.
#[no_mangle]
pub unsafe extern "C-unwind" fn sn_thread_spawn_i64(
    caller: *const Region,
    mode: c_int,
    entry: SnEntryI64,
    env: *mut c_void,
) -> u64 {
    let env = Env(env);
    let args = ThreadArgs::new(move |_, _| Value::Int(entry(env.get())))
        .result_type(ResultType::Long);
    // SAFETY: guaranteed by the caller.
    unsafe { spawn(caller, mode, args) }
}

/// Spawn `entry(env)` returning nothing. With `fire_and_forget` set the
/// thread disposes of itself and must not be synced.
///
/// # Safety
///
/// Same as [`sn_thread_spawn_i64`].
#[no_mangle]
pub unsafe extern "C-unwind" fn sn_thread_spawn_void(
    caller: *const Region,
    mode: c_int,
    entry: SnEntryVoid,
    env: *mut c_void,
    fire_and_forget: c_int,
) -> u64 {
    let env = Env(env);
    let mut args = ThreadArgs::new(move |_, _| {
        entry(env.get());
        Value::Void
    });
    if fire_and_forget != 0 {
        args = args.fire_and_forget();
    }
    // SAFETY: guaranteed by the caller.
    unsafe { spawn(caller, mode, args) }
}

/// Sync an integer thread. A panic in the thread is re-raised here.
#[no_mangle]
pub extern "C-unwind" fn sn_thread_sync_i64(thread: u64) -> i64 {
    let runtime = runtime();
    let Some(handle) = lookup(&runtime, thread) else {
        return 0;
    };
    runtime
        .threads()
        .sync_or_raise(&handle)
        .and_then(|value| value.as_int())
        .unwrap_or(0)
}

/// Sync a thread, discarding its result. A panic in the thread is re-raised
/// here.
#[no_mangle]
pub extern "C-unwind" fn sn_thread_sync(thread: u64) {
    let runtime = runtime();
    if let Some(handle) = lookup(&runtime, thread) {
        runtime.threads().sync_or_raise(&handle);
    }
}

/// 1 if the thread has finished (or is unknown), 0 if it is still running.
#[no_mangle]
pub extern "C" fn sn_thread_is_done(thread: u64) -> c_int {
    let Some(runtime) = crate::global() else {
        return 1;
    };
    c_int::from(sn_rts_thread::is_done(lookup(&runtime, thread).as_ref()))
}

/// 1 if a panic raised on this thread would be forwarded to a sync.
#[no_mangle]
pub extern "C" fn sn_thread_has_panic_context() -> c_int {
    c_int::from(context::has_panic_context())
}

// ============================================================================
// Locks and Panics
// ============================================================================

/// Enter a `lock(var)` block on the variable at `address`.
#[no_mangle]
pub extern "C-unwind" fn sn_sync_lock(address: *const c_void) {
    runtime().locks().acquire(address as usize);
}

/// Leave a `lock(var)` block. Returns 0 on success and -1 if the variable
/// was not locked.
#[no_mangle]
pub extern "C-unwind" fn sn_sync_unlock(address: *const c_void) -> c_int {
    match runtime().locks().release(address as usize) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Raise a runtime panic.
///
/// Inside a spawned thread the panic is forwarded to the thread's sync;
/// anywhere else the process prints `panic: <msg>` and exits with status 1.
///
/// # Safety
///
/// `msg` must be null or a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C-unwind" fn sn_panic(msg: *const c_char) -> ! {
    let message = if msg.is_null() {
        "runtime panic".to_string()
    } else {
        // SAFETY: guaranteed by the caller.
        let cstr = unsafe { CStr::from_ptr(msg) };
        cstr.to_string_lossy().into_owned()
    };
    context::raise(message)
}
