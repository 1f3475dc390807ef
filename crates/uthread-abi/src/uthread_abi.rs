//! ABI layer for the `p_uthread_*` thread and TLS surface.

use std::ffi::{c_int, c_void};
use std::ptr;

use tracing::{error, warn};
use uthread_core::{Key, Thread, ThreadPriority};

/// Start routine. Its return value, truncated to `int`, is the exit code.
pub type PUThreadFunc = unsafe extern "C-unwind" fn(*mut c_void) -> *mut c_void;

/// TLS destructor, called with a thread's non-null value at thread exit.
pub type PDestroyFunc = unsafe extern "C" fn(*mut c_void);

/// Opaque thread handle.
pub type PUThread = Thread;

/// Opaque TLS key handle.
pub type PUThreadKey = Key;

/// Kernel thread id returned by [`p_uthread_current_id`].
pub type PUThreadId = libc::pid_t;

pub const P_UTHREAD_PRIORITY_LOWEST: c_int = ThreadPriority::Lowest.as_raw();
pub const P_UTHREAD_PRIORITY_LOW: c_int = ThreadPriority::Low.as_raw();
pub const P_UTHREAD_PRIORITY_NORMAL: c_int = ThreadPriority::Normal.as_raw();
pub const P_UTHREAD_PRIORITY_HIGH: c_int = ThreadPriority::High.as_raw();
pub const P_UTHREAD_PRIORITY_HIGHEST: c_int = ThreadPriority::Highest.as_raw();

/// User data moved onto the new thread.
struct StartArg(*mut c_void);

// SAFETY: the pointer is passed verbatim to the start routine; sharing
// whatever it points to is the C caller's responsibility.
unsafe impl Send for StartArg {}

impl StartArg {
    fn into_raw(self) -> *mut c_void {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the runtime with default settings. Returns `0`, or `-1` when
/// the runtime rejects them.
#[unsafe(no_mangle)]
pub extern "C" fn p_uthread_init() -> c_int {
    match uthread_core::init() {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Run the detach hook for the caller and release every TLS slot.
#[unsafe(no_mangle)]
pub extern "C" fn p_uthread_shutdown() {
    uthread_core::shutdown();
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Start `func(data)` on a new thread at `prio` (out-of-range values become
/// NORMAL). Returns null when `func` is null or the thread cannot start.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_create_full(
    func: Option<PUThreadFunc>,
    data: *mut c_void,
    joinable: c_int,
    prio: c_int,
) -> *mut PUThread {
    let Some(func) = func else {
        warn!("p_uthread_create_full called without a start routine");
        return ptr::null_mut();
    };
    let prio = ThreadPriority::coerce(prio);
    let arg = StartArg(data);
    let start = move || {
        // SAFETY: the caller supplied a valid start routine for `data`.
        let ret = unsafe { func(arg.into_raw()) };
        ret as isize as c_int
    };
    match uthread_core::create_full(start, joinable != 0, prio) {
        Ok(thread) => Box::into_raw(Box::new(thread)),
        Err(_) => ptr::null_mut(),
    }
}

/// [`p_uthread_create_full`] at NORMAL priority.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_create(
    func: Option<PUThreadFunc>,
    data: *mut c_void,
    joinable: c_int,
) -> *mut PUThread {
    // SAFETY: forwarded caller contract.
    unsafe { p_uthread_create_full(func, data, joinable, P_UTHREAD_PRIORITY_NORMAL) }
}

/// Terminate the calling library thread with `code`.
#[unsafe(no_mangle)]
pub extern "C-unwind" fn p_uthread_exit(code: c_int) -> ! {
    uthread_core::exit(code)
}

/// Wait for `thread` and return its exit code. `-1` for null, detached,
/// already joined, or panicked threads.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_join(thread: *mut PUThread) -> c_int {
    // SAFETY: non-null handles come from `p_uthread_create_full`.
    let Some(thread) = (unsafe { thread.as_mut() }) else {
        return -1;
    };
    thread.join().unwrap_or(-1)
}

/// Release a thread handle without joining. Null is ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_free(thread: *mut PUThread) {
    if thread.is_null() {
        return;
    }
    // SAFETY: non-null handles come from `Box::into_raw` in create.
    drop(unsafe { Box::from_raw(thread) });
}

#[unsafe(no_mangle)]
pub extern "C" fn p_uthread_yield() {
    uthread_core::yield_now();
}

/// Change the priority of `thread`. Out-of-range values become NORMAL.
/// Returns `0`, or `-1` for a null handle, a thread that has already
/// finished, or a host refusal.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_set_priority(thread: *mut PUThread, prio: c_int) -> c_int {
    // SAFETY: non-null handles come from `p_uthread_create_full`.
    let Some(thread) = (unsafe { thread.as_mut() }) else {
        return -1;
    };
    match thread.set_priority(ThreadPriority::coerce(prio)) {
        Ok(()) => 0,
        Err(err) => {
            error!(%err, tid = thread.native_id().as_raw(), "failed to set thread priority");
            -1
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn p_uthread_current_id() -> PUThreadId {
    uthread_core::current_id().as_raw()
}

// ---------------------------------------------------------------------------
// Thread-local storage
// ---------------------------------------------------------------------------

/// New unbound key. `free_func` may be null.
#[unsafe(no_mangle)]
pub extern "C" fn p_uthread_local_new(free_func: Option<PDestroyFunc>) -> *mut PUThreadKey {
    Box::into_raw(Box::new(Key::new(free_func)))
}

/// Release the key object. Its native slot and registry entry stay alive
/// until `p_uthread_shutdown`, so values stored through it are still
/// destroyed at thread exit.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_local_free(key: *mut PUThreadKey) {
    if key.is_null() {
        return;
    }
    // SAFETY: non-null keys come from `Box::into_raw` in `p_uthread_local_new`.
    drop(unsafe { Box::from_raw(key) });
}

/// Calling thread's value for `key`; null for a null or unbindable key.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_get_local(key: *mut PUThreadKey) -> *mut c_void {
    // SAFETY: non-null keys come from `p_uthread_local_new`.
    match unsafe { key.as_ref() } {
        Some(key) => key.get(),
        None => ptr::null_mut(),
    }
}

/// Store `value` without destroying the previous one.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_set_local(key: *mut PUThreadKey, value: *mut c_void) {
    // SAFETY: non-null keys come from `p_uthread_local_new`.
    let Some(key) = (unsafe { key.as_ref() }) else {
        return;
    };
    // SAFETY: the C caller owns `value` and its compatibility with the
    // key's destructor.
    let _ = unsafe { key.set(value) };
}

/// Destroy the previous value (when both it and the destructor are
/// non-null), then store `value`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn p_uthread_replace_local(key: *mut PUThreadKey, value: *mut c_void) {
    // SAFETY: non-null keys come from `p_uthread_local_new`.
    let Some(key) = (unsafe { key.as_ref() }) else {
        return;
    };
    // SAFETY: as for `p_uthread_set_local`.
    let _ = unsafe { key.replace(value) };
}
