//! Per-thread execution context.
//!
//! Every spawned thread runs with a [`ThreadContext`] installed in
//! thread-local storage. It serves two purposes:
//!
//! - **Panic context** - while a context is installed, [`raise`] unwinds to
//!   the spawn wrapper, which records the message as the thread's outcome.
//!   Without one (the main thread, foreign threads), [`raise`] prints
//!   `panic: <message>` to stderr and exits the process with status 1.
//! - **Working region** - code that allocates on behalf of the thread, such
//!   as closures invoked from it, finds the thread's region through
//!   [`current_region_or`].

use std::any::Any;
use std::cell::RefCell;

use sn_rts_region::Region;
use tracing::error;

use crate::handle::SpawnId;
use crate::mode::OwnershipMode;

/// What a spawned thread knows about itself.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    thread: SpawnId,
    region: Region,
    caller: Region,
    mode: OwnershipMode,
}

impl ThreadContext {
    pub(crate) fn new(thread: SpawnId, region: Region, caller: Region, mode: OwnershipMode) -> Self {
        Self {
            thread,
            region,
            caller,
            mode,
        }
    }

    /// The runtime id of this thread.
    #[must_use]
    pub fn thread(&self) -> SpawnId {
        self.thread
    }

    /// The region this thread allocates into.
    #[must_use]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// The region of the code that spawned this thread.
    #[must_use]
    pub fn caller(&self) -> &Region {
        &self.caller
    }

    /// The ownership mode the thread was spawned in.
    #[must_use]
    pub fn mode(&self) -> OwnershipMode {
        self.mode
    }
}

/// Unwind payload carrying a message raised with [`raise`].
#[derive(Debug)]
pub(crate) struct RaisedPanic {
    pub(crate) message: String,
}

thread_local! {
    /// Context of the spawned thread running on this OS thread.
    static CONTEXT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };
}

pub(crate) fn install(context: ThreadContext) {
    CONTEXT.with(|slot| *slot.borrow_mut() = Some(context));
}

pub(crate) fn clear() {
    CONTEXT.with(|slot| *slot.borrow_mut() = None);
}

/// The current thread's context, if it was spawned by the runtime.
#[must_use]
pub fn current() -> Option<ThreadContext> {
    CONTEXT.with(|slot| slot.borrow().clone())
}

/// Whether a panic raised here would be caught and forwarded to a sync.
#[must_use]
pub fn has_panic_context() -> bool {
    CONTEXT.with(|slot| slot.borrow().is_some())
}

/// The runtime id of the current thread, if spawned by the runtime.
#[must_use]
pub fn current_thread() -> Option<SpawnId> {
    CONTEXT.with(|slot| slot.borrow().as_ref().map(ThreadContext::thread))
}

/// The current thread's working region, if spawned by the runtime.
#[must_use]
pub fn current_region() -> Option<Region> {
    CONTEXT.with(|slot| slot.borrow().as_ref().map(|ctx| ctx.region.clone()))
}

/// The current thread's working region, or `fallback` outside spawned threads.
#[must_use]
pub fn current_region_or(fallback: &Region) -> Region {
    current_region().unwrap_or_else(|| fallback.clone())
}

/// Raise a runtime panic.
///
/// Inside a spawned thread this unwinds to the spawn wrapper and becomes the
/// thread's outcome. Anywhere else it is fatal.
pub fn raise(message: impl Into<String>) -> ! {
    let message = message.into();
    if has_panic_context() {
        std::panic::resume_unwind(Box::new(RaisedPanic { message }));
    }
    error!(%message, "unhandled panic");
    eprintln!("panic: {message}");
    std::process::exit(1)
}

/// Extract a readable message from an unwind payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(raised) = payload.downcast_ref::<RaisedPanic>() {
        raised.message.clone()
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "thread panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::thread;

    fn context_for(region: &Region) -> ThreadContext {
        ThreadContext::new(SpawnId::next(), region.clone(), region.clone(), OwnershipMode::Shared)
    }

    #[test]
    fn test_no_context_by_default() {
        thread::spawn(|| {
            assert!(!has_panic_context());
            assert!(current_thread().is_none());
            let fallback = Region::root();
            assert!(current_region_or(&fallback).ptr_eq(&fallback));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_install_and_clear() {
        thread::spawn(|| {
            let region = Region::root();
            let ctx = context_for(&region);
            let id = ctx.thread();
            install(ctx);
            assert!(has_panic_context());
            assert_eq!(current_thread(), Some(id));
            assert!(current_region_or(&Region::root()).ptr_eq(&region));
            clear();
            assert!(!has_panic_context());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_raise_unwinds_with_message() {
        thread::spawn(|| {
            install(context_for(&Region::root()));
            let payload = catch_unwind(AssertUnwindSafe(|| raise("boom"))).unwrap_err();
            assert_eq!(panic_message(payload.as_ref()), "boom");
            clear();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7_u32);
        assert!(panic_message(other.as_ref()).contains("non-string"));
    }
}
