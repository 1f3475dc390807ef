//! # uthread-core
//!
//! Portable user threads layered over the host thread primitive, plus
//! thread-local storage keys whose destructors fire when a thread exits.
//!
//! The host TLS slots are allocated without a native destructor callback, so
//! destructor delivery is emulated: every destructor-bearing key is recorded
//! in a process-wide registry which is drained by the detach hook each time a
//! thread terminates.
//!
//! Unsafe code is denied at the crate level and allowed per module where the
//! host primitives are called.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod runtime;
pub mod uthread;

pub use config::{ConfigError, RuntimeConfig};
pub use error::{Result, ThreadError};
pub use runtime::{init, init_with, is_initialized, shutdown};
pub use uthread::{
    DestroyFn, Key, NativeSlot, NativeThreadId, PriorityMap, Thread, ThreadPriority, TlsStats,
    create, create_full, current_id, detach_current_thread, exit, tls_stats, yield_now,
};

/// Lock shared by every test that touches process-wide state (registry,
/// runtime context, epoch). Unit tests in different modules run in parallel
/// inside one process, so they all serialize on this.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
