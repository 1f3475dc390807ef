//! Thread objects over `std::thread`.
//!
//! Every library thread starts in a shim that:
//!
//! 1. reports its kernel thread id to the creator and waits until the
//!    creator has applied the requested priority,
//! 2. runs the start routine, catching both [`exit`] and panics,
//! 3. runs the TLS detach hook before the OS thread goes away.
//!
//! The exit status travels back through the `JoinHandle`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{Builder, JoinHandle};

use tracing::{debug, error, trace};

use super::priority::ThreadPriority;
use super::tls;
use crate::error::{Result, ThreadError};
use crate::runtime;

/// Kernel-level identity of a thread, unique among live threads of the
/// process. May be reused once the thread has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeThreadId(libc::pid_t);

impl NativeThreadId {
    #[must_use]
    pub const fn as_raw(self) -> libc::pid_t {
        self.0
    }
}

/// Unwind payload used by [`exit`]; caught by the start shim.
struct ThreadExit {
    code: i32,
}

/// `None` when the start routine panicked.
type ExitStatus = Option<i32>;

/// Cleared when the start shim returns. The kernel may hand the thread's id
/// to another task from then on.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A thread created by this crate.
///
/// Dropping a `Thread` releases the wrapper without joining; the OS thread
/// keeps running and its exit status is discarded.
#[derive(Debug)]
pub struct Thread {
    handle: Option<JoinHandle<ExitStatus>>,
    id: NativeThreadId,
    running: Arc<AtomicBool>,
    joinable: bool,
    prio: ThreadPriority,
}

impl Thread {
    /// Block until the thread terminates and return its exit code.
    ///
    /// Fails without blocking when the thread was created detached or was
    /// already joined.
    pub fn join(&mut self) -> Result<i32> {
        if !self.joinable {
            return Err(ThreadError::NotJoinable);
        }
        let handle = self.handle.take().ok_or(ThreadError::AlreadyJoined)?;
        match handle.join() {
            Ok(Some(code)) => {
                trace!(tid = self.id.0, code, "thread joined");
                Ok(code)
            }
            Ok(None) | Err(_) => {
                error!(tid = self.id.0, "joined thread terminated by a panic");
                Err(ThreadError::Panicked)
            }
        }
    }

    /// Apply `prio` to the running thread. The stored level only changes
    /// when the host accepts it. Fails with [`ThreadError::Terminated`]
    /// once the start routine has finished.
    pub fn set_priority(&mut self, prio: ThreadPriority) -> Result<()> {
        if !self.is_running() {
            return Err(ThreadError::Terminated);
        }
        apply_priority(self.id, prio)?;
        self.prio = prio;
        Ok(())
    }

    #[must_use]
    pub fn priority(&self) -> ThreadPriority {
        self.prio
    }

    /// `false` once the start routine (and the detach hook) have finished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_joinable(&self) -> bool {
        self.joinable
    }

    #[must_use]
    pub fn native_id(&self) -> NativeThreadId {
        self.id
    }
}

/// Start a thread running `f` at the default priority.
pub fn create<F>(f: F, joinable: bool) -> Result<Thread>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    create_full(f, joinable, ThreadPriority::Normal)
}

/// Start a thread running `f`.
///
/// `prio` is applied before `f` starts running. Failing to apply it is
/// logged and leaves the thread at its inherited priority; the thread is
/// still returned.
pub fn create_full<F>(f: F, joinable: bool, prio: ThreadPriority) -> Result<Thread>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    let (id_tx, id_rx) = mpsc::sync_channel::<NativeThreadId>(1);
    let (go_tx, go_rx) = mpsc::sync_channel::<()>(1);
    let running = Arc::new(AtomicBool::new(true));
    let running_flag = RunningFlag(Arc::clone(&running));

    let mut builder = Builder::new();
    if let Some(size) = runtime::stack_size() {
        builder = builder.stack_size(size);
    }

    let handle = builder
        .spawn(move || -> ExitStatus {
            let _running = running_flag;
            tls::register_exit_guard();
            if id_tx.send(current_id()).is_err() {
                return None;
            }
            // The creator dropping its sender means creation was abandoned.
            go_rx.recv().ok()?;
            run_start_routine(f)
        })
        .map_err(|err| {
            error!(%err, "failed to spawn native thread");
            ThreadError::Spawn(err)
        })?;

    let id = id_rx.recv().map_err(|_| {
        error!("new thread exited before reporting its id");
        ThreadError::StartupLost
    })?;

    let applied = match apply_priority(id, prio) {
        Ok(()) => prio,
        Err(err) => {
            error!(%err, tid = id.0, ?prio, "failed to apply priority to new thread");
            ThreadPriority::default()
        }
    };

    // The child is blocked in `recv` until this send.
    let _ = go_tx.send(());
    debug!(tid = id.0, joinable, prio = ?applied, "thread started");

    Ok(Thread {
        handle: joinable.then_some(handle),
        id,
        running,
        joinable,
        prio: applied,
    })
}

fn run_start_routine<F>(f: F) -> ExitStatus
where
    F: FnOnce() -> i32,
{
    let status = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => Some(code),
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => Some(exit.code),
            Err(_) => None,
        },
    };
    tls::detach_current_thread();
    status
}

/// Terminate the calling thread with `code`, which a later `join` returns.
///
/// Must be called from a thread started by [`create`] or [`create_full`].
/// Anywhere else it unwinds the thread like an uncaught panic.
pub fn exit(code: i32) -> ! {
    trace!(code, "thread exit requested");
    panic::resume_unwind(Box::new(ThreadExit { code }))
}

/// Give up the rest of the current time slice.
pub fn yield_now() {
    std::thread::yield_now();
}

/// Identity of the calling thread.
#[must_use]
pub fn current_id() -> NativeThreadId {
    NativeThreadId(host::gettid())
}

fn apply_priority(id: NativeThreadId, prio: ThreadPriority) -> Result<()> {
    // Hosts without a priority backend leave every thread at the default.
    if !host::HAS_PRIORITY && prio == ThreadPriority::Normal {
        return Ok(());
    }
    let native = runtime::priority_map().native(prio);
    host::set_nice(id.0, native).map_err(|errno| ThreadError::Priority { errno })
}

#[cfg(target_os = "linux")]
mod host {
    use crate::error::last_errno;

    pub(super) const HAS_PRIORITY: bool = true;

    pub(super) fn gettid() -> libc::pid_t {
        // SAFETY: gettid has no preconditions and cannot fail.
        unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
    }

    pub(super) fn set_nice(tid: libc::pid_t, nice: i32) -> Result<(), i32> {
        // SAFETY: plain syscall on a thread id; an invalid id yields ESRCH.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
        if rc == 0 { Ok(()) } else { Err(last_errno()) }
    }
}

#[cfg(not(target_os = "linux"))]
mod host {
    use core::cell::Cell;
    use core::sync::atomic::{AtomicI32, Ordering};

    pub(super) const HAS_PRIORITY: bool = false;

    static NEXT_ID: AtomicI32 = AtomicI32::new(1);

    thread_local! {
        static ID: Cell<libc::pid_t> = const { Cell::new(0) };
    }

    pub(super) fn gettid() -> libc::pid_t {
        ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
    }

    pub(super) fn set_nice(_tid: libc::pid_t, _nice: i32) -> Result<(), i32> {
        Err(libc::ENOTSUP)
    }
}
