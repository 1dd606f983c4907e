//! The Sindarin runtime system.
//!
//! Compiled Sindarin programs link this crate as a static library. It ties
//! the region and thread crates together into one [`Runtime`] service and
//! exposes it to generated code through the C ABI in [`ffi`].
//!
//! Rust embedders construct a [`Runtime`] directly and own it. Only the C
//! ABI uses the process-level slot managed by [`init`], [`global`] and
//! [`shutdown`].
//!
//! # Configuration
//!
//! [`RuntimeConfig::from_env`] reads:
//!
//! | Variable               | Meaning                                   |
//! |------------------------|-------------------------------------------|
//! | `SN_RTS_STACK_SIZE`    | stack size of spawned threads, in bytes   |
//! | `SN_RTS_MAX_THREADS`   | live thread limit                         |
//! | `SN_RTS_START_BARRIER` | `0` to let spawn return before the thread starts |
//! | `SN_RTS_DEBUG`         | `1` for debug mode (debug-level logging)  |
//! | `SN_RTS_LOG`           | `tracing` filter directives               |

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod ffi;

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub use sn_rts_region as region;
pub use sn_rts_thread as thread;

use sn_rts_region::Region;
use sn_rts_thread::{SyncLockTable, ThreadConfig, ThreadRuntime, ThreadStats};

// ============================================================================
// Configuration
// ============================================================================

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "SN_RTS_LOG";

/// An environment variable held a value that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    /// The variable.
    pub var: &'static str,
    /// Its value.
    pub value: String,
}

/// Configuration for the runtime system.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Thread spawning configuration.
    pub thread: ThreadConfig,
    /// Enable debug mode.
    pub debug_mode: bool,
    /// Log filter directives; `None` leaves logging off unless debug mode
    /// is on.
    pub log_filter: Option<String>,
}

impl RuntimeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(size) = parse(&lookup, "SN_RTS_STACK_SIZE")? {
            config.thread.stack_size = Some(size);
        }
        if let Some(limit) = parse(&lookup, "SN_RTS_MAX_THREADS")? {
            config.thread.max_threads = Some(limit);
        }
        if let Some(barrier) = flag(&lookup, "SN_RTS_START_BARRIER")? {
            config.thread.start_barrier = barrier;
        }
        if let Some(debug) = flag(&lookup, "SN_RTS_DEBUG")? {
            config.debug_mode = debug;
        }
        config.log_filter = lookup(LOG_ENV).filter(|filter| !filter.is_empty());
        Ok(config)
    }

    /// The filter [`init_logging`] should install, if any.
    #[must_use]
    pub fn effective_log_filter(&self) -> Option<String> {
        match (&self.log_filter, self.debug_mode) {
            (Some(filter), _) => Some(filter.clone()),
            (None, true) => Some("debug".to_string()),
            (None, false) => None,
        }
    }
}

fn parse(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<usize>, ConfigError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError { var, value })
        })
        .transpose()
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    lookup(var)
        .map(|value| {
            let parsed = match value.trim() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            };
            parsed.ok_or(ConfigError { var, value })
        })
        .transpose()
}

/// Install a stderr `tracing` subscriber filtered by `filter`.
///
/// Returns `false` if the filter is invalid or a subscriber is already set.
pub fn init_logging(filter: &str) -> bool {
    let Ok(filter) = EnvFilter::try_new(filter) else {
        return false;
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

// ============================================================================
// Runtime
// ============================================================================

/// The runtime service: thread runtime, lock table and the root region.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    threads: ThreadRuntime,
    locks: SyncLockTable,
    root: Region,
}

impl Runtime {
    /// Create a runtime.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let threads = ThreadRuntime::new(config.thread.clone());
        Self {
            config,
            threads,
            locks: SyncLockTable::new(),
            root: Region::named(None, "main").unwrap_or_else(|_| Region::root()),
        }
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The thread runtime.
    #[must_use]
    pub fn threads(&self) -> &ThreadRuntime {
        &self.threads
    }

    /// The `lock` block table.
    #[must_use]
    pub fn locks(&self) -> &SyncLockTable {
        &self.locks
    }

    /// The program's root region.
    #[must_use]
    pub fn root(&self) -> &Region {
        &self.root
    }

    /// Thread statistics.
    #[must_use]
    pub fn stats(&self) -> ThreadStats {
        self.threads.stats()
    }

    /// Tear the runtime down: stop tracking threads, destroy the root region
    /// and clear the lock table.
    pub fn shutdown(&self) {
        self.threads.shutdown();
        self.root.destroy();
        self.locks.clear();
        debug!(stats = ?self.threads.stats(), "runtime shut down");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

// ============================================================================
// Process-level Runtime
// ============================================================================

static RUNTIME: RwLock<Option<Arc<Runtime>>> = parking_lot::const_rwlock(None);

/// Install the process-level runtime used by the C ABI.
///
/// If one is already installed it is returned unchanged and `config` is
/// ignored.
pub fn init(config: RuntimeConfig) -> Arc<Runtime> {
    let mut slot = RUNTIME.write();
    if let Some(runtime) = slot.as_ref() {
        return Arc::clone(runtime);
    }
    if let Some(filter) = config.effective_log_filter() {
        init_logging(&filter);
    }
    let runtime = Arc::new(Runtime::new(config));
    debug!(config = ?runtime.config(), "runtime initialized");
    *slot = Some(Arc::clone(&runtime));
    runtime
}

/// The process-level runtime, if installed.
#[must_use]
pub fn global() -> Option<Arc<Runtime>> {
    RUNTIME.read().clone()
}

/// Remove and shut down the process-level runtime. Returns whether one was
/// installed.
pub fn shutdown() -> bool {
    let runtime = RUNTIME.write().take();
    match runtime {
        Some(runtime) => {
            runtime.shutdown();
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.thread.start_barrier);
        assert_eq!(config.thread.max_threads, None);
        assert!(!config.debug_mode);
        assert_eq!(config.effective_log_filter(), None);
    }

    #[test]
    fn test_config_from_vars() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("SN_RTS_STACK_SIZE", "1048576"),
            ("SN_RTS_MAX_THREADS", " 16 "),
            ("SN_RTS_START_BARRIER", "0"),
            ("SN_RTS_DEBUG", "true"),
        ]))
        .unwrap();
        assert_eq!(config.thread.stack_size, Some(1 << 20));
        assert_eq!(config.thread.max_threads, Some(16));
        assert!(!config.thread.start_barrier);
        assert!(config.debug_mode);
        assert_eq!(config.effective_log_filter().as_deref(), Some("debug"));
    }

    #[test]
    fn test_config_log_filter_wins() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("SN_RTS_DEBUG", "1"),
            ("SN_RTS_LOG", "sn_rts_thread=trace"),
        ]))
        .unwrap();
        assert_eq!(
            config.effective_log_filter().as_deref(),
            Some("sn_rts_thread=trace")
        );
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = RuntimeConfig::from_lookup(lookup(&[("SN_RTS_MAX_THREADS", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError {
                var: "SN_RTS_MAX_THREADS",
                value: "many".to_string()
            }
        );
        assert!(RuntimeConfig::from_lookup(lookup(&[("SN_RTS_DEBUG", "maybe")])).is_err());
    }

    #[test]
    fn test_owned_runtime_shutdown() {
        let runtime = Runtime::default();
        let root = runtime.root().clone();
        let handle = runtime
            .threads()
            .spawn(
                &root,
                sn_rts_thread::ThreadArgs::new(|_, _| sn_rts_region::Value::Void),
            )
            .unwrap();
        runtime.locks().acquire(1_usize);
        runtime.locks().release(1_usize).unwrap();

        runtime.shutdown();
        assert!(!root.is_alive());
        assert!(handle.is_released());
        assert!(runtime.locks().is_empty());
    }
}
