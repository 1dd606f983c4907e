//! The C ABI as generated code drives it.
//!
//! The process-level runtime is shared by every test in a binary, so the
//! whole lifecycle runs as one sequential test.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use sn_rts::ffi::*;
use sn_rts::thread::{SpawnId, SyncError};

static FINISHED: AtomicUsize = AtomicUsize::new(0);

extern "C-unwind" fn double(env: *mut c_void) -> i64 {
    // SAFETY: the test passes a pointer to an i64 that outlives the sync.
    let n = unsafe { *env.cast::<i64>() };
    n * 2
}

extern "C-unwind" fn fail(_env: *mut c_void) -> i64 {
    // SAFETY: the message is a null-terminated literal.
    unsafe { sn_panic(b"boom\0".as_ptr().cast()) }
}

extern "C-unwind" fn sync_failing_child(_env: *mut c_void) -> i64 {
    assert_eq!(sn_thread_has_panic_context(), 1);
    // SAFETY: a null caller selects the root region.
    let inner = unsafe { sn_thread_spawn_i64(ptr::null(), 0, fail, ptr::null_mut()) };
    sn_thread_sync_i64(inner)
}

extern "C-unwind" fn slow_finish(_env: *mut c_void) {
    thread::sleep(Duration::from_millis(20));
    FINISHED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_c_abi_lifecycle() {
    sn_rts_init();
    sn_rts_init();
    let rt = sn_rts::global().unwrap();
    assert_eq!(sn_thread_has_panic_context(), 0);

    // SAFETY: null parent selects the root region.
    let region = unsafe { sn_region_create(ptr::null()) };
    assert!(!region.is_null());

    // Spawn and sync an integer thread; the second sync is a no-op.
    let mut n: i64 = 21;
    // SAFETY: `region` is live and `n` outlives the sync.
    let id = unsafe { sn_thread_spawn_i64(region, 0, double, ptr::addr_of_mut!(n).cast()) };
    assert_ne!(id, 0);
    assert_eq!(sn_thread_sync_i64(id), 42);
    assert_eq!(sn_thread_sync_i64(id), 0);
    assert_eq!(sn_thread_is_done(id), 1);

    // Unknown ownership modes are refused.
    // SAFETY: as above.
    let refused = unsafe { sn_thread_spawn_i64(region, 7, double, ptr::addr_of_mut!(n).cast()) };
    assert_eq!(refused, 0);

    // A panic re-raised by a nested sync becomes the outer thread's panic.
    // SAFETY: `region` is live.
    let outer =
        unsafe { sn_thread_spawn_i64(region, 0, sync_failing_child, ptr::null_mut()) };
    let handle = rt.threads().registry().get(SpawnId::from_raw(outer)).unwrap();
    match rt.threads().sync(&handle) {
        Err(SyncError::Panicked(panic)) => assert_eq!(panic.message(), "boom"),
        other => panic!("expected a forwarded panic, got {other:?}"),
    }

    // Lock blocks.
    let var = 0_u64;
    let address = ptr::addr_of!(var).cast::<c_void>();
    sn_sync_lock(address);
    assert_eq!(sn_sync_unlock(address), 0);
    assert_eq!(sn_sync_unlock(address), -1);

    // Destroying the region joins a thread nobody synced.
    // SAFETY: `region` is live.
    let unsynced =
        unsafe { sn_thread_spawn_void(region, 1, slow_finish, ptr::null_mut(), 0) };
    assert_ne!(unsynced, 0);
    // SAFETY: `region` came from `sn_region_create` and is destroyed once.
    unsafe { sn_region_destroy(region) };
    assert_eq!(FINISHED.load(Ordering::SeqCst), 1);
    assert_eq!(sn_thread_is_done(unsynced), 1);
    assert_eq!(rt.stats().auto_joined, 1);

    sn_rts_shutdown();
    assert!(sn_rts::global().is_none());
    assert!(!rt.root().is_alive());
}
