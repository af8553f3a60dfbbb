use crate::holder::{self, HazardSlot};
use crate::record::HazardRecord;
use crate::sync::atomic::AtomicUsize;
use crate::{Error, Result};
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Number of slots in a registry built with [`Registry::new`].
///
/// This bounds how many threads may be popping from stacks that share one registry at a time.
#[cfg(not(loom))]
pub const DEFAULT_CAPACITY: usize = 100;
#[cfg(loom)]
pub const DEFAULT_CAPACITY: usize = 4;

pub(crate) struct Records {
    records: Box<[HazardRecord]>,
    // Live `Registry` values. Claims cached by threads hold the table, but not a handle.
    handles: AtomicUsize,
}

impl Records {
    pub(crate) fn record(&self, index: usize) -> &HazardRecord {
        &self.records[index]
    }

    /// False once every `Registry` handle to this table is gone.
    pub(crate) fn has_handles(&self) -> bool {
        self.handles.load(Ordering::Acquire) != 0
    }
}

/// A fixed-size table of hazard pointer slots.
///
/// Every thread that wants to dereference nodes of a [`HazardStack`](crate::HazardStack) first
/// claims one slot here, and publishes into it the address of the node it is about to read. A
/// node that was unlinked from a stack is only freed once no slot in the stack's registry holds
/// its address.
///
/// `Registry` is a cheap handle: clones refer to the same table, so a single registry can be
/// injected into several stacks (their readers then share slots), or each stack can have one of
/// its own.
///
/// A thread owns at most one slot of a given registry. It is claimed on first use, either by
/// [`Registry::register`] or by [`Registry::with_thread_slot`] (which is what
/// [`HazardStack::pop`](crate::HazardStack::pop) uses), and every later request from the same
/// thread gets that same slot back. When all slots are owned by other threads, claiming fails
/// with [`Error::ReclamationCapacityExceeded`].
pub struct Registry {
    inner: Arc<Records>,
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        self.inner.handles.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.inner.handles.fetch_sub(1, Ordering::Release);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry with [`DEFAULT_CAPACITY`] slots.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a registry with room for `capacity` concurrently registered threads.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "a hazard pointer registry needs at least one slot");
        let records = (0..capacity).map(|_| HazardRecord::new()).collect();
        Self {
            inner: Arc::new(Records {
                records,
                handles: AtomicUsize::new(1),
            }),
        }
    }

    /// The number of slots in this registry.
    pub fn capacity(&self) -> usize {
        self.inner.records.len()
    }

    /// The number of slots currently owned by some thread.
    pub fn claimed(&self) -> usize {
        self.inner
            .records
            .iter()
            .filter(|record| record.is_claimed())
            .count()
    }

    /// The calling thread's slot in this registry, claimed now if the thread has none.
    ///
    /// The returned [`HazardSlot`] cannot leave the calling thread. All slots a thread gets from
    /// one registry are handles to the same claim, which is given back once the last of them is
    /// dropped, or when the thread exits if [`Registry::with_thread_slot`] has used it.
    pub fn register(&self) -> Result<HazardSlot> {
        holder::register(self)
    }

    /// Run `f` with the calling thread's slot in this registry, claiming one on first use.
    ///
    /// The slot stays claimed until the thread exits.
    pub fn with_thread_slot<R>(&self, f: impl FnOnce(&HazardSlot) -> R) -> Result<R> {
        holder::with_thread_slot(self, f)
    }

    /// Returns true if any slot currently publishes exactly `ptr`.
    ///
    /// This is a linear scan over every slot.
    pub fn is_protected<T>(&self, ptr: *const T) -> bool {
        let ptr = ptr as *mut u8;
        !ptr.is_null() && self.inner.records.iter().any(|record| record.load() == ptr)
    }

    /// Returns true if `self` and `other` are handles to the same table.
    pub fn same_as(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn table(&self) -> &Arc<Records> {
        &self.inner
    }

    /// Claim a free slot for `token`. Callers make sure `token` owns none yet.
    pub(crate) fn claim(&self, token: usize) -> Result<usize> {
        debug_assert!(
            !self.inner.records.iter().any(|r| r.is_owned_by(token)),
            "thread {token} already owns a slot in this registry"
        );
        for (index, record) in self.inner.records.iter().enumerate() {
            if record.try_claim(token) {
                debug!(slot = index, owner = token, "claimed hazard pointer slot");
                return Ok(index);
            }
        }

        let capacity = self.capacity();
        warn!(capacity, owner = token, "hazard pointer registry exhausted");
        Err(Error::ReclamationCapacityExceeded { capacity })
    }

    /// Snapshot of every non-null published address.
    pub(crate) fn protected(&self) -> BTreeSet<*mut u8> {
        self.inner
            .records
            .iter()
            .map(HazardRecord::load)
            .filter(|ptr| !ptr.is_null())
            .collect()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("capacity", &self.capacity())
            .field("claimed", &self.claimed())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::Registry;
    use crate::Error;
    use std::sync::{Arc, Barrier};

    #[test]
    fn a_thread_claims_at_most_one_slot() {
        let registry = Registry::with_capacity(3);
        let cached = registry.with_thread_slot(|slot| slot.index()).unwrap();
        let one = registry.register().unwrap();
        let two = registry.register().unwrap();
        assert_eq!(one.index(), cached);
        assert_eq!(two.index(), cached);
        assert_eq!(registry.claimed(), 1);

        // Another thread gets a slot of its own.
        let r = registry.clone();
        let theirs = std::thread::spawn(move || r.register().map(|slot| slot.index()))
            .join()
            .unwrap()
            .unwrap();
        assert_ne!(theirs, cached);
    }

    #[test]
    fn exhaustion_is_reported() {
        let registry = Registry::with_capacity(2);
        let claimed = Arc::new(Barrier::new(3));
        let finish = Arc::new(Barrier::new(3));
        let holders: Vec<_> = (0..2)
            .map(|_| {
                let r = registry.clone();
                let (claimed, finish) = (Arc::clone(&claimed), Arc::clone(&finish));
                std::thread::spawn(move || {
                    let _slot = r.register().unwrap();
                    claimed.wait();
                    finish.wait();
                })
            })
            .collect();

        claimed.wait();
        assert_eq!(registry.claimed(), 2);
        assert_eq!(
            registry.register().unwrap_err(),
            Error::ReclamationCapacityExceeded { capacity: 2 }
        );
        finish.wait();
        for holder in holders {
            holder.join().unwrap();
        }
        assert_eq!(registry.claimed(), 0);
        assert!(registry.register().is_ok());
    }

    #[test]
    fn is_protected_sees_published_addresses() {
        let registry = Registry::with_capacity(4);
        let mut x = 42u64;
        let px: *mut u64 = &mut x;

        assert!(!registry.is_protected(px));
        assert!(!registry.is_protected(core::ptr::null::<u64>()));

        let slot = registry.register().unwrap();
        slot.protect_raw(px);
        assert!(registry.is_protected(px));
        assert!(registry.protected().contains(&(px as *mut u8)));

        slot.reset_protection();
        assert!(!registry.is_protected(px));

        slot.protect_raw(px);
        drop(slot);
        assert!(!registry.is_protected(px), "release clears the published pointer");
    }

    #[test]
    fn clones_share_the_table() {
        let registry = Registry::with_capacity(1);
        let clone = registry.clone();
        assert!(registry.same_as(&clone));
        assert!(!registry.same_as(&Registry::with_capacity(1)));

        let slot = clone.register().unwrap();
        assert!(slot.is_from(&registry));
        assert_eq!(registry.register().unwrap().index(), slot.index());

        let r = registry.clone();
        let theirs = std::thread::spawn(move || r.register().map(|_| ()))
            .join()
            .unwrap();
        assert!(theirs.is_err());
    }

    #[test]
    fn handles_are_counted() {
        let registry = Registry::with_capacity(1);
        assert!(registry.table().has_handles());
        let table = Arc::clone(registry.table());
        let clone = registry.clone();
        drop(registry);
        assert!(table.has_handles());
        drop(clone);
        assert!(!table.has_handles());
    }

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn zero_capacity_is_rejected() {
        let _ = Registry::with_capacity(0);
    }
}
