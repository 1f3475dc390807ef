//! Host TLS slots.
//!
//! Slots come from `pthread_key_create` with a null destructor, so the host
//! never runs anything when a thread exits. Destructor delivery is entirely
//! the registry's job (see `tls.rs`).

use core::ffi::c_void;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ThreadError, last_errno};

/// Index of a host TLS slot.
pub type NativeSlot = libc::pthread_key_t;

static SLOTS_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static SLOTS_RELEASED: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh slot with no host destructor.
pub(crate) fn alloc_slot() -> Result<NativeSlot> {
    let mut slot: NativeSlot = 0;
    // SAFETY: `slot` is a valid out-pointer; a null destructor is allowed.
    let rc = unsafe { libc::pthread_key_create(&mut slot, None) };
    if rc != 0 {
        return Err(ThreadError::SlotExhausted { errno: rc });
    }
    SLOTS_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    Ok(slot)
}

/// Release a slot.
///
/// # Safety
///
/// `slot` must have come from [`alloc_slot`] and must not be used afterwards
/// by any key or registry entry.
pub(crate) unsafe fn free_slot(slot: NativeSlot) -> Result<()> {
    // SAFETY: caller guarantees `slot` is live and no longer referenced.
    let rc = unsafe { libc::pthread_key_delete(slot) };
    if rc != 0 {
        return Err(ThreadError::SlotRelease { errno: rc });
    }
    SLOTS_RELEASED.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Read the calling thread's value in `slot`. Null when never set.
pub(crate) fn get(slot: NativeSlot) -> *mut c_void {
    // SAFETY: reading a live key only touches the calling thread's table.
    unsafe { libc::pthread_getspecific(slot) }
}

/// Store `value` in the calling thread's `slot`.
pub(crate) fn set(slot: NativeSlot, value: *mut c_void) -> Result<()> {
    // SAFETY: writing a live key only touches the calling thread's table.
    let rc = unsafe { libc::pthread_setspecific(slot, value.cast_const()) };
    if rc != 0 {
        let errno = if rc > 0 { rc } else { last_errno() };
        return Err(ThreadError::SlotWrite { errno });
    }
    Ok(())
}

pub(crate) fn slot_counters() -> (u64, u64) {
    (
        SLOTS_ALLOCATED.load(Ordering::Relaxed),
        SLOTS_RELEASED.load(Ordering::Relaxed),
    )
}
