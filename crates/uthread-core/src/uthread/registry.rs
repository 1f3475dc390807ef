//! Process-wide destructor registry.
//!
//! A singly linked list of `(slot, destructor)` pairs, one per bound key that
//! carries a destructor.
//!
//! - **Insertion** happens only under the TLS binder mutex and publishes the
//!   new head with a single compare-and-swap against the head observed when
//!   the entry was built.
//! - **Traversal** (the detach hook) takes no lock: it loads the head once per
//!   pass and follows `next` links. Entries are immutable once published.
//! - **Reclamation** happens only at shutdown, after the head is detached and
//!   every traversal that could still see the old list has finished.

#[cfg(test)]
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::native::NativeSlot;
use super::tls::DestroyFn;
use crate::error::{Result, ThreadError};

struct RegistryEntry {
    slot: NativeSlot,
    destructor: DestroyFn,
    next: *mut RegistryEntry,
}

#[cfg(test)]
thread_local! {
    /// Entry published by another writer between the head load and the swap
    /// of this thread's next `prepend`.
    static INTERLOPER: Cell<Option<(NativeSlot, DestroyFn)>> = const { Cell::new(None) };
}

/// Make the calling thread's next `prepend` lose its swap to an entry for
/// `(slot, destructor)`.
#[cfg(test)]
pub(crate) fn interpose_next_prepend(slot: NativeSlot, destructor: DestroyFn) {
    INTERLOPER.with(|cell| cell.set(Some((slot, destructor))));
}

pub(crate) struct Registry {
    head: AtomicPtr<RegistryEntry>,
    len: AtomicUsize,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Prepend `(slot, destructor)`.
    ///
    /// Fails with [`ThreadError::RegistryContended`] when the head moved
    /// between the observation and the swap; nothing is published then.
    pub(crate) fn prepend(&self, slot: NativeSlot, destructor: DestroyFn) -> Result<()> {
        let observed = self.head.load(Ordering::Acquire);
        let entry = Box::new(RegistryEntry {
            slot,
            destructor,
            next: observed,
        });
        #[cfg(test)]
        if let Some((slot, destructor)) = INTERLOPER.with(Cell::take) {
            let head = self.head.load(Ordering::Acquire);
            let _ = self.publish(
                head,
                Box::new(RegistryEntry {
                    slot,
                    destructor,
                    next: head,
                }),
            );
        }
        self.publish(observed, entry)
    }

    fn publish(&self, observed: *mut RegistryEntry, entry: Box<RegistryEntry>) -> Result<()> {
        let raw = Box::into_raw(entry);
        match self
            .head
            .compare_exchange(observed, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.len.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                // SAFETY: `raw` was never published, so this is the only owner.
                drop(unsafe { Box::from_raw(raw) });
                Err(ThreadError::RegistryContended)
            }
        }
    }

    /// Snapshot of the list, head first.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            cur: self.head.load(Ordering::Acquire),
            _registry: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Unlink the whole list. New traversals see an empty registry; the
    /// returned list still has to be released once no traversal that started
    /// earlier is running.
    pub(crate) fn take(&self) -> DetachedList {
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        self.len.store(0, Ordering::Relaxed);
        DetachedList { head }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        let list = self.take();
        // SAFETY: `&mut self` excludes every concurrent traversal.
        let _ = unsafe { list.release() };
    }
}

/// Lock-free traversal over published entries.
pub(crate) struct Iter<'a> {
    cur: *const RegistryEntry,
    _registry: PhantomData<&'a Registry>,
}

impl Iterator for Iter<'_> {
    type Item = (NativeSlot, DestroyFn);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: published entries are immutable and are only freed by
        // `DetachedList::release`, which waits out running traversals.
        let entry = unsafe { &*self.cur };
        self.cur = entry.next;
        Some((entry.slot, entry.destructor))
    }
}

/// Entries unlinked by [`Registry::take`]. Dropping it without calling
/// [`DetachedList::release`] leaks the entries.
pub(crate) struct DetachedList {
    head: *mut RegistryEntry,
}

impl DetachedList {
    /// Free every entry and return the slots they described.
    ///
    /// # Safety
    ///
    /// No traversal that loaded the old head may still be running.
    pub(crate) unsafe fn release(self) -> Vec<NativeSlot> {
        let mut slots = Vec::new();
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: entries were created by `Box::into_raw` in `publish`
            // and the caller guarantees exclusive access.
            let entry = unsafe { Box::from_raw(cur) };
            slots.push(entry.slot);
            cur = entry.next;
        }
        slots
    }
}
