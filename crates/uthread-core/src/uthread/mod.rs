//! Threads, priorities and thread-local storage.
//!
//! - `native`: host TLS slots.
//! - `registry`: process-wide `(slot, destructor)` list.
//! - `tls`: keys, the detach hook and shutdown reclamation.
//! - `thread`: thread objects and the start shim.
//! - `priority`: the five-level ladder and its host mapping.

#[allow(unsafe_code)]
pub mod native;
pub mod priority;
#[allow(unsafe_code)]
mod registry;
#[allow(unsafe_code)]
pub mod thread;
#[allow(unsafe_code)]
pub mod tls;

pub use native::NativeSlot;
pub use priority::{PRIORITY_LEVELS, PriorityMap, ThreadPriority};
pub use thread::{NativeThreadId, Thread, create, create_full, current_id, exit, yield_now};
pub use tls::{DestroyFn, Key, TlsStats, detach_current_thread, tls_stats};
