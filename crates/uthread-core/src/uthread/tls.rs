//! Thread-local storage keys with emulated destructors.
//!
//! ## Design
//!
//! - **Keys** start unbound and bind lazily to a host slot on first access.
//!   Binders serialize on `BINDER`; the binding word is published with
//!   release ordering so later fast-path reads see a fully registered slot.
//!
//! - **Registry**: each bound key with a destructor owns one entry in
//!   `REGISTRY`. Entries outlive the key object because threads that
//!   stored values through the key may still need them destroyed.
//!
//! - **Detach hook**: [`detach_current_thread`] walks the registry without
//!   taking `BINDER`, clears every non-null slot *before* handing its value
//!   to the destructor, and repeats until a whole pass destroys nothing.
//!
//! - **Epochs**: every binding is tagged with the runtime epoch. `shutdown`
//!   frees all slots and bumps the epoch, so keys rebind instead of reusing
//!   a released slot.
//!
//! ## Thread Integration
//!
//! Threads created by `thread.rs` call [`detach_current_thread`] after the
//! start routine returns (or calls `exit`, or panics). Other threads that
//! store a value through a destructor-bearing key arm a Rust thread-local
//! exit guard which runs the same hook when the thread's locals are torn
//! down. Library threads register that guard before their start routine
//! runs, so values stored by Rust locals torn down after the hook (or after
//! an explicit [`detach_current_thread`]) are destroyed as well.

use core::cell::Cell;
use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::native::{self, NativeSlot};
use super::registry::Registry;
use crate::error::{Result, ThreadError};
use crate::runtime;

/// Destructor invoked with a thread's non-null value when that thread exits.
pub type DestroyFn = unsafe extern "C" fn(*mut c_void);

/// Binding word of a key that has no slot in the current epoch.
const UNBOUND: u64 = u64::MAX;

const SLOT_MASK: u64 = 0xFFFF_FFFF;

// ---------------------------------------------------------------------------
// Global state
// ---------------------------------------------------------------------------

/// State guarded by the binder mutex.
struct BinderState {
    /// Slots bound by keys without a destructor. They never enter the
    /// registry but still have to be released at shutdown.
    plain_slots: Vec<NativeSlot>,
}

/// Serializes key binders against each other and against shutdown.
/// Never held while user code runs.
static BINDER: Mutex<BinderState> = Mutex::new(BinderState {
    plain_slots: Vec::new(),
});

static REGISTRY: Registry = Registry::new();

/// Bumped by every shutdown. Bindings from an older epoch are stale.
static EPOCH: AtomicU32 = AtomicU32::new(0);

/// Outermost detach passes currently traversing the registry.
static DRAINS_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

static BIND_RACES_LOST: AtomicU64 = AtomicU64::new(0);
static DESTRUCTOR_CALLS: AtomicU64 = AtomicU64::new(0);
static DETACH_PASSES: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static DRAIN_DEPTH: Cell<usize> = const { Cell::new(0) };
    static EXIT_GUARD: ExitGuard = const {
        ExitGuard {
            armed: Cell::new(false),
        }
    };
}

/// `None` when the host handed out a slot index wider than 32 bits.
fn encode(epoch: u32, slot: NativeSlot) -> Option<u64> {
    let slot = u32::try_from(slot).ok()?;
    let word = (u64::from(epoch) << 32) | u64::from(slot);
    // The all-ones word is reserved for `UNBOUND`.
    (word != UNBOUND).then_some(word)
}

fn decode(word: u64, epoch: u32) -> Option<NativeSlot> {
    if word == UNBOUND || (word >> 32) as u32 != epoch {
        return None;
    }
    Some((word & SLOT_MASK) as NativeSlot)
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A thread-local storage key.
///
/// The key itself holds no per-thread data: each thread's value lives in the
/// host slot the key is bound to. Values are raw pointers; the key's
/// destructor (if any) takes ownership of a thread's non-null value when
/// that thread exits.
///
/// Dropping a key does not release its slot or registry entry. Both are
/// reclaimed by [`crate::shutdown`].
#[derive(Debug)]
pub struct Key {
    binding: AtomicU64,
    destructor: Option<DestroyFn>,
}

impl Key {
    /// Create an unbound key. Usable in `static` items.
    #[must_use]
    pub const fn new(destructor: Option<DestroyFn>) -> Self {
        Self {
            binding: AtomicU64::new(UNBOUND),
            destructor,
        }
    }

    #[must_use]
    pub fn destructor(&self) -> Option<DestroyFn> {
        self.destructor
    }

    /// Host slot this key is bound to in the current epoch, if any.
    #[must_use]
    pub fn native_slot(&self) -> Option<NativeSlot> {
        decode(
            self.binding.load(Ordering::Acquire),
            EPOCH.load(Ordering::Acquire),
        )
    }

    fn ensure_bound(&self) -> Result<NativeSlot> {
        if let Some(slot) = self.native_slot() {
            return Ok(slot);
        }

        let mut binder = BINDER.lock();
        let epoch = EPOCH.load(Ordering::Acquire);
        // Another thread may have bound the key while we waited.
        if let Some(slot) = decode(self.binding.load(Ordering::Acquire), epoch) {
            return Ok(slot);
        }

        let slot = native::alloc_slot()
            .inspect_err(|err| error!(%err, "failed to allocate a native TLS slot"))?;
        let Some(word) = encode(epoch, slot) else {
            error!(slot, "native TLS slot index does not fit a key binding");
            // SAFETY: the slot was never published to a key or entry.
            if let Err(free_err) = unsafe { native::free_slot(slot) } {
                error!(%free_err, slot, "failed to release unusable TLS slot");
            }
            return Err(ThreadError::SlotOutOfRange { slot: slot as u64 });
        };

        match self.destructor {
            Some(destructor) => {
                if let Err(err) = REGISTRY.prepend(slot, destructor) {
                    BIND_RACES_LOST.fetch_add(1, Ordering::Relaxed);
                    error!(%err, slot, "failed to set up a TLS key destructor");
                    // SAFETY: the slot was never published to a key or entry.
                    if let Err(free_err) = unsafe { native::free_slot(slot) } {
                        error!(%free_err, slot, "failed to release rolled-back TLS slot");
                    }
                    return Err(err);
                }
            }
            None => binder.plain_slots.push(slot),
        }

        self.binding.store(word, Ordering::Release);
        trace!(
            slot,
            epoch,
            has_destructor = self.destructor.is_some(),
            "TLS key bound"
        );
        Ok(slot)
    }

    /// Calling thread's value, binding the key first if needed.
    pub fn try_get(&self) -> Result<*mut c_void> {
        let slot = self.ensure_bound()?;
        Ok(native::get(slot))
    }

    /// Calling thread's value; null when never set or when the key could
    /// not be bound.
    #[must_use]
    pub fn get(&self) -> *mut c_void {
        self.try_get().unwrap_or(ptr::null_mut())
    }

    /// Store `value` for the calling thread. The displaced value is not
    /// destroyed; the caller stays responsible for it.
    ///
    /// # Safety
    ///
    /// If the key has a destructor, a non-null `value` must be valid to pass
    /// to it, because it will be called with `value` when this thread exits
    /// unless the value is replaced first.
    pub unsafe fn set(&self, value: *mut c_void) -> Result<()> {
        let slot = self.ensure_bound()?;
        native::set(slot, value)
            .inspect_err(|err| error!(%err, slot, "failed to store TLS value"))?;
        if !value.is_null() && self.destructor.is_some() {
            arm_exit_guard();
        }
        Ok(())
    }

    /// Like [`Key::set`], but first destroys the current value when both the
    /// value and the key's destructor are non-null.
    ///
    /// # Safety
    ///
    /// Same contract as [`Key::set`]. Additionally the current value must not
    /// be aliased by `value`, since it is destroyed before `value` is stored.
    pub unsafe fn replace(&self, value: *mut c_void) -> Result<()> {
        let slot = self.ensure_bound()?;
        let old = native::get(slot);
        if !old.is_null() {
            if let Some(destructor) = self.destructor {
                // SAFETY: `old` was stored under the `set` contract.
                unsafe { destructor(old) };
            }
        }
        native::set(slot, value)
            .inspect_err(|err| error!(%err, slot, "failed to store replacement TLS value"))?;
        if !value.is_null() && self.destructor.is_some() {
            arm_exit_guard();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Detach hook
// ---------------------------------------------------------------------------

/// Runs the detach hook when the thread's Rust locals are destroyed, if a
/// destructor-bearing value was stored since the hook last ran.
struct ExitGuard {
    armed: Cell<bool>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.armed.replace(false) {
            run_destructors();
        }
    }
}

fn arm_exit_guard() {
    let _ = EXIT_GUARD.try_with(|guard| guard.armed.set(true));
}

/// Register the calling thread's exit guard ahead of any other Rust local.
/// Locals are destroyed in reverse registration order, so the guard then
/// outlives locals whose destructors still store into keys.
pub(crate) fn register_exit_guard() {
    let _ = EXIT_GUARD.try_with(|_| ());
}

/// Marks the calling thread as traversing the registry. Only the outermost
/// pass on a thread is counted, so a destructor that triggers a nested pass
/// does not hold up its own shutdown.
struct DrainGuard {
    outermost: bool,
}

impl DrainGuard {
    fn enter() -> Self {
        let depth = DRAIN_DEPTH
            .try_with(|depth| {
                let current = depth.get();
                depth.set(current + 1);
                current
            })
            .unwrap_or(0);
        let outermost = depth == 0;
        if outermost {
            DRAINS_IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
            // Order the announcement before the head load in `iter`.
            fence(Ordering::SeqCst);
        }
        Self { outermost }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let _ = DRAIN_DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(1)));
        if self.outermost {
            DRAINS_IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn inside_drain() -> bool {
    DRAIN_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

/// Drain the registry for the calling thread until a pass destroys nothing
/// (or the configured pass limit is reached). Returns the number of
/// destructor invocations.
pub(crate) fn run_destructors() -> usize {
    let _drain = DrainGuard::enter();
    let limit = runtime::max_destructor_passes();
    let mut total = 0usize;
    let mut passes = 0usize;

    loop {
        let mut ran = 0usize;
        // Re-snapshot the head every pass so entries prepended by a
        // destructor are visited.
        for (slot, destructor) in REGISTRY.iter() {
            let value = native::get(slot);
            if value.is_null() {
                continue;
            }
            if let Err(err) = native::set(slot, ptr::null_mut()) {
                error!(%err, slot, "failed to clear TLS slot before destruction");
                continue;
            }
            // SAFETY: the value was stored under the `Key::set` contract and
            // the slot no longer references it.
            unsafe { destructor(value) };
            ran += 1;
        }
        passes += 1;
        total += ran;

        if ran == 0 {
            break;
        }
        if let Some(limit) = limit {
            if passes >= limit.get() {
                warn!(
                    passes,
                    "TLS destructors kept installing values; giving up on the remaining ones"
                );
                break;
            }
        }
    }

    DETACH_PASSES.fetch_add(passes as u64, Ordering::Relaxed);
    DESTRUCTOR_CALLS.fetch_add(total as u64, Ordering::Relaxed);
    trace!(passes, destructors = total, "TLS detach drain finished");
    total
}

/// Detach hook for the calling thread.
///
/// Destroys every non-null value the thread holds in destructor-bearing
/// keys, repeating while destructors install new values. Threads created by
/// this crate run it automatically after their start routine; call it
/// directly only from a thread that is about to terminate on its own.
/// Returns the number of destructor invocations.
pub fn detach_current_thread() -> usize {
    let _ = EXIT_GUARD.try_with(|guard| guard.armed.set(false));
    run_destructors()
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// Drain the calling thread, unlink the registry, wait for other threads'
/// passes over it to finish, then free every entry and slot.
pub(crate) fn teardown() {
    run_destructors();

    let (detached, plain_slots) = {
        let mut binder = BINDER.lock();
        let detached = REGISTRY.take();
        let plain_slots = core::mem::take(&mut binder.plain_slots);
        EPOCH.fetch_add(1, Ordering::AcqRel);
        (detached, plain_slots)
    };
    // Order the unlink before reading the in-flight count.
    fence(Ordering::SeqCst);

    if inside_drain() {
        // The enclosing pass still walks the old list; leave it allocated.
        warn!("uthread shutdown requested from a TLS destructor; leaking the old registry");
        return;
    }
    while DRAINS_IN_FLIGHT.load(Ordering::SeqCst) > 0 {
        std::thread::yield_now();
    }

    // SAFETY: every pass that could have loaded the old head has finished.
    let mut slots = unsafe { detached.release() };
    slots.extend(plain_slots);
    let released = slots.len();
    for slot in slots {
        // SAFETY: the epoch bump makes every key rebind, so no key or entry
        // refers to these slots any more.
        if let Err(err) = unsafe { native::free_slot(slot) } {
            error!(%err, slot, "failed to release TLS slot");
        }
    }
    debug!(released, "TLS registry torn down");
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Counters describing TLS activity since process start.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlsStats {
    pub slots_allocated: u64,
    pub slots_released: u64,
    /// Entries currently in the registry.
    pub registry_entries: usize,
    pub bind_races_lost: u64,
    pub destructor_calls: u64,
    pub detach_passes: u64,
}

#[must_use]
pub fn tls_stats() -> TlsStats {
    let (slots_allocated, slots_released) = native::slot_counters();
    TlsStats {
        slots_allocated,
        slots_released,
        registry_entries: REGISTRY.len(),
        bind_races_lost: BIND_RACES_LOST.load(Ordering::Relaxed),
        destructor_calls: DESTRUCTOR_CALLS.load(Ordering::Relaxed),
        detach_passes: DETACH_PASSES.load(Ordering::Relaxed),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
