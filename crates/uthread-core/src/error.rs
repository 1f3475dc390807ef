//! Error type shared by the thread and TLS operations.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ThreadError> = std::result::Result<T, E>;

/// Failure of a thread or TLS operation.
///
/// The C boundary collapses every variant to `NULL` or `-1`; the Rust API
/// keeps the cause.
#[derive(Debug, Error)]
pub enum ThreadError {
    /// A required argument was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// `join` was called on a thread created detached.
    #[error("thread was created detached and cannot be joined")]
    NotJoinable,
    /// The exit status was already collected by an earlier `join`.
    #[error("thread has already been joined")]
    AlreadyJoined,
    /// The host refused to start a new thread.
    #[error("failed to spawn native thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// The new thread died before reporting its native id.
    #[error("thread terminated before completing its startup handshake")]
    StartupLost,
    /// The start routine panicked instead of returning or calling `exit`.
    #[error("thread terminated by a panic")]
    Panicked,
    /// The thread has already finished, so its kernel id may belong to
    /// another task.
    #[error("thread has already terminated")]
    Terminated,
    /// The host rejected a scheduling priority change.
    #[error("failed to apply thread priority (errno {errno})")]
    Priority { errno: i32 },
    /// No native TLS slot could be allocated.
    #[error("native TLS slots exhausted (errno {errno})")]
    SlotExhausted { errno: i32 },
    /// The host returned a slot index too wide for a key binding. The slot
    /// was released again.
    #[error("native TLS slot {slot} is out of range for key bindings")]
    SlotOutOfRange { slot: u64 },
    /// A native TLS slot could not be released.
    #[error("failed to release native TLS slot (errno {errno})")]
    SlotRelease { errno: i32 },
    /// A value could not be stored into a native TLS slot.
    #[error("failed to store TLS value (errno {errno})")]
    SlotWrite { errno: i32 },
    /// The destructor registry head moved while a new entry was being
    /// published. The binding was rolled back; the next access retries.
    #[error("destructor registry changed concurrently; binding rolled back")]
    RegistryContended,
    /// The runtime configuration was rejected.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Last OS error number, or `0` when the host did not set one.
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
