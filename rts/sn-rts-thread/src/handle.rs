//! Thread handles and the shared state behind them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sn_rts_region::{CleanupKey, Handle, Region, Value};
use tracing::{trace, warn};

use crate::mode::{OwnershipMode, ResultType, ThreadRegion};

// ============================================================================
// Thread IDs and State
// ============================================================================

/// Unique identifier for a spawned thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpawnId(u64);

impl SpawnId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Rebuild an id received through the C ABI.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SpawnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Execution state of a spawned thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// The function is still running.
    Running,
    /// The function returned.
    Completed,
    /// The function panicked.
    Panicked,
}

/// Where a panic message ended up.
#[derive(Debug)]
pub(crate) enum PanicPayload {
    /// Allocated in the thread's working region.
    InRegion(Handle),
    /// The working region refused the allocation; kept on the Rust heap.
    Text(String),
}

/// What the spawned function produced. Written exactly once.
#[derive(Debug)]
pub(crate) enum Outcome {
    Value(Value),
    Panic(PanicPayload),
}

// ============================================================================
// Shared State
// ============================================================================

/// State shared between a handle, its OS thread, the registry and the
/// caller region's cleanup callback.
pub(crate) struct ThreadShared {
    pub(crate) id: SpawnId,
    pub(crate) caller: Region,
    pub(crate) region: ThreadRegion,
    pub(crate) result_type: ResultType,
    pub(crate) detached: bool,
    /// The OS thread that spawned this one; frozen arguments belong to it.
    pub(crate) spawner: ThreadId,
    /// The thread handle record in the caller's region.
    pub(crate) handle_record: Handle,
    /// The result box record in the caller's region.
    pub(crate) result_record: Handle,
    pub(crate) frozen: Mutex<Vec<Handle>>,
    pub(crate) cleanup: Mutex<Option<CleanupKey>>,
    pub(crate) os_thread: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<ThreadState>,
    done: Condvar,
    outcome: Mutex<Option<Outcome>>,
    /// Set by whoever takes responsibility for joining: sync, join,
    /// auto-join or self-disposal.
    claimed: AtomicBool,
    released: AtomicBool,
}

impl ThreadShared {
    pub(crate) fn new(
        id: SpawnId,
        caller: Region,
        region: ThreadRegion,
        result_type: ResultType,
        detached: bool,
        handle_record: Handle,
        result_record: Handle,
    ) -> Self {
        Self {
            id,
            caller,
            region,
            result_type,
            detached,
            spawner: thread::current().id(),
            handle_record,
            result_record,
            frozen: Mutex::new(Vec::new()),
            cleanup: Mutex::new(None),
            os_thread: Mutex::new(None),
            state: Mutex::new(ThreadState::Running),
            done: Condvar::new(),
            outcome: Mutex::new(None),
            claimed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Store the outcome and wake every waiter.
    pub(crate) fn complete(&self, outcome: Outcome) {
        let final_state = match outcome {
            Outcome::Value(_) => ThreadState::Completed,
            Outcome::Panic(_) => ThreadState::Panicked,
        };
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                warn!(thread = %self.id, "result box written twice; keeping the first outcome");
                return;
            }
            *slot = Some(outcome);
        }
        *self.state.lock() = final_state;
        self.done.notify_all();
    }

    pub(crate) fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    /// Take joining responsibility. Only the first caller gets `true`.
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Block until the thread has produced its outcome.
    pub(crate) fn wait(&self) {
        let mut state = self.state.lock();
        while *state == ThreadState::Running {
            self.done.wait(&mut state);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state == ThreadState::Running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.done.wait_for(&mut state, remaining).timed_out() {
                return *state != ThreadState::Running;
            }
        }
        true
    }

    /// Join the OS thread if it is still joinable.
    pub(crate) fn reap(&self) {
        let Some(os) = self.os_thread.lock().take() else {
            return;
        };
        if os.thread().id() == thread::current().id() {
            return;
        }
        if os.join().is_err() {
            warn!(thread = %self.id, "thread wrapper unwound after completing");
        }
    }

    pub(crate) fn take_outcome(&self) -> Option<Outcome> {
        self.outcome.lock().take()
    }

    /// Release everything the spawn allocated. Runs at most once.
    ///
    /// Thaws frozen arguments, unregisters the caller-region cleanup,
    /// frees the handle and result records, destroys an owned working
    /// region, and detaches the OS thread if nobody joined it.
    pub(crate) fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }

        for handle in std::mem::take(&mut *self.frozen.lock()) {
            if let Err(e) = self.caller.thaw(handle, self.spawner) {
                trace!(thread = %self.id, %handle, error = %e, "argument not thawed");
            }
        }
        if let Some(key) = self.cleanup.lock().take() {
            self.caller.remove_cleanup(key);
        }
        for record in [self.result_record, self.handle_record] {
            if let Err(e) = self.caller.release(record) {
                trace!(thread = %self.id, %record, error = %e, "record already gone");
            }
        }
        if let Some(region) = self.region.owned() {
            region.destroy();
        }
        self.os_thread.lock().take();
        trace!(thread = %self.id, "released");
        true
    }
}

impl fmt::Debug for ThreadShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadShared")
            .field("id", &self.id)
            .field("mode", &self.region.mode())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Thread Handle
// ============================================================================

/// A handle to a spawned thread.
///
/// Cloning the handle does not duplicate the thread; all clones observe the
/// same state and only one sync takes effect.
#[derive(Clone)]
pub struct ThreadHandle {
    pub(crate) shared: Arc<ThreadShared>,
}

impl ThreadHandle {
    pub(crate) fn new(shared: ThreadShared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    /// The thread's runtime id.
    #[must_use]
    pub fn id(&self) -> SpawnId {
        self.shared.id
    }

    /// The ownership mode the thread was spawned in.
    #[must_use]
    pub fn mode(&self) -> OwnershipMode {
        self.shared.region.mode()
    }

    /// The declared result type.
    #[must_use]
    pub fn result_type(&self) -> &ResultType {
        &self.shared.result_type
    }

    /// Current execution state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    /// Whether the spawned function has returned or panicked.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() != ThreadState::Running
    }

    /// Whether a sync (or join, or auto-join) has taken this handle.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.shared.is_claimed()
    }

    /// Whether the spawn's resources have been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.is_released()
    }

    /// Whether the thread cleans up after itself.
    #[must_use]
    pub fn is_fire_and_forget(&self) -> bool {
        self.shared.detached
    }

    /// The region of the code that spawned the thread.
    #[must_use]
    pub fn caller_region(&self) -> &Region {
        &self.shared.caller
    }

    /// The region the thread allocates into.
    #[must_use]
    pub fn working_region(&self) -> &Region {
        self.shared.region.working()
    }

    /// The handle record the spawn allocated in the caller's region.
    #[must_use]
    pub fn record(&self) -> Handle {
        self.shared.handle_record
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id())
            .field("mode", &self.mode())
            .field("state", &self.state())
            .field("synced", &self.is_synced())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for(caller: &Region) -> ThreadShared {
        let region = ThreadRegion::select(OwnershipMode::Default, caller).unwrap();
        ThreadShared::new(
            SpawnId::next(),
            caller.clone(),
            region,
            ResultType::Int,
            false,
            caller.alloc_record("thread handle").unwrap(),
            caller.alloc_record("result box").unwrap(),
        )
    }

    #[test]
    fn test_spawn_id_uniqueness() {
        let a = SpawnId::next();
        let b = SpawnId::next();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("Thread({})", a.raw()));
    }

    #[test]
    fn test_outcome_written_once() {
        let caller = Region::root();
        let shared = shared_for(&caller);
        assert_eq!(shared.state(), ThreadState::Running);

        shared.complete(Outcome::Value(Value::Int(1)));
        shared.complete(Outcome::Value(Value::Int(2)));
        assert_eq!(shared.state(), ThreadState::Completed);
        assert!(matches!(
            shared.take_outcome(),
            Some(Outcome::Value(Value::Int(1)))
        ));
    }

    #[test]
    fn test_claim_once() {
        let caller = Region::root();
        let shared = shared_for(&caller);
        assert!(shared.claim());
        assert!(!shared.claim());
    }

    #[test]
    fn test_wait_timeout() {
        let caller = Region::root();
        let shared = shared_for(&caller);
        assert!(!shared.wait_timeout(Duration::from_millis(10)));
        shared.complete(Outcome::Value(Value::Void));
        assert!(shared.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_release_runs_once() {
        let caller = Region::root();
        let shared = shared_for(&caller);
        let working = shared.region.working().clone();
        assert_eq!(caller.live_objects(), 2);

        assert!(shared.release());
        assert!(!shared.release());
        assert_eq!(caller.live_objects(), 0);
        assert!(!working.is_alive());
        assert!(caller.is_alive());
    }
}
