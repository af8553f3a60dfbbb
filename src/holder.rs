use crate::record::HazardRecord;
use crate::registry::Records;
use crate::sync::atomic::AtomicPtr;
use crate::{Registry, Result};
use alloc::rc::{Rc, Weak};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::Ordering;
use tracing::debug;

// Plain std atomic: tokens only need to be unique, so loom need not model this.
static NEXT_TOKEN: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);

crate::sync::thread_local! {
    static TOKEN: usize = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// A thread's ownership of one record. The record goes back to its registry when this drops.
struct Claim {
    table: Arc<Records>,
    index: usize,
}

impl Claim {
    fn record(&self) -> &HazardRecord {
        self.table.record(self.index)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.record().release();
        debug!(slot = self.index, "released hazard pointer slot");
    }
}

/// One registry's entry in a thread's slot cache.
struct Cached {
    claim: Weak<Claim>,
    // Set once `with_thread_slot` has used the claim: it then lives as long as the thread.
    pinned: Option<Rc<Claim>>,
}

impl Cached {
    fn claim_in(&self, registry: &Registry) -> Option<Rc<Claim>> {
        self.claim
            .upgrade()
            .filter(|claim| Arc::ptr_eq(&claim.table, registry.table()))
    }

    /// Unpin claims on registries nobody holds any more. Returns false for dead entries.
    fn prune(&mut self) -> bool {
        if matches!(&self.pinned, Some(claim) if !claim.table.has_handles()) {
            self.pinned = None;
        }
        self.claim.strong_count() != 0
    }
}

crate::sync::thread_local! {
    static THREAD_SLOTS: RefCell<Vec<Cached>> = RefCell::new(Vec::new());
}

/// Non-zero token identifying the calling thread as a slot owner.
pub(crate) fn thread_token() -> usize {
    TOKEN.with(|token| *token)
}

/// A claimed slot in a [`Registry`], able to protect one address at a time.
///
/// A `HazardSlot` is a capability tied to the thread that claimed it: it is neither `Send` nor
/// `Sync`. A thread has at most one slot per registry, so every `HazardSlot` it holds for the
/// same registry refers to the same slot. The slot goes back to the registry once no handle
/// (and no [`Registry::with_thread_slot`] use on this thread) keeps it.
///
/// Obtain one with [`Registry::register`], or borrow the calling thread's cached slot with
/// [`Registry::with_thread_slot`].
pub struct HazardSlot {
    claim: Rc<Claim>,
}

impl HazardSlot {
    fn record(&self) -> &HazardRecord {
        self.claim.record()
    }

    /// Returns true if this slot was claimed from `registry`.
    pub fn is_from(&self, registry: &Registry) -> bool {
        Arc::ptr_eq(&self.claim.table, registry.table())
    }

    /// Position of this slot in its registry.
    pub fn index(&self) -> usize {
        self.claim.index
    }

    /// Publish `ptr` as in use by this thread.
    ///
    /// This does not check that `ptr` is still reachable; prefer the stacks' own `pop`, which
    /// re-validates the address after publishing it.
    pub fn protect_raw<T>(&self, ptr: *mut T) {
        self.record().protect(ptr as *mut u8);
    }

    /// Stop protecting whatever this slot currently publishes.
    pub fn reset_protection(&self) {
        self.record().reset();
    }

    /// Returns true if this slot currently publishes exactly `ptr`.
    pub fn is_protecting<T>(&self, ptr: *const T) -> bool {
        self.record().load() == ptr as *mut u8
    }

    /// Load `src` and protect the loaded address.
    ///
    /// 1. load the pointer currently stored in `src`
    /// 2. publish it in this slot
    /// 3. load `src` again; if it changed, goto 2 with the new value
    ///
    /// Once this returns, the returned address (if non-null) was reachable from `src` at a point
    /// where this slot already published it, so it cannot be freed by a reclaimer that checks
    /// the registry after unlinking it.
    pub(crate) fn protect<T>(&self, src: &AtomicPtr<T>) -> *mut T {
        let mut ptr = src.load(Ordering::Relaxed);
        loop {
            match self.try_protect(ptr, src) {
                Ok(ptr) => break ptr,
                Err(now) => ptr = now,
            }
        }
    }

    pub(crate) fn try_protect<T>(&self, ptr: *mut T, src: &AtomicPtr<T>) -> Result<*mut T, *mut T> {
        self.record().protect(ptr as *mut u8);

        crate::sync::light_barrier();

        let now = src.load(Ordering::Acquire);
        if ptr == now {
            Ok(ptr)
        } else {
            Err(now)
        }
    }
}

impl core::fmt::Debug for HazardSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HazardSlot")
            .field("index", &self.claim.index)
            .field("protected", &self.record().load())
            .finish()
    }
}

/// The calling thread's claim in `registry`, made now if it has none. With `pin`, the claim is
/// kept until the thread exits.
///
/// Claims pinned on registries that nobody holds a handle to any more are unpinned (and so
/// released) whenever this thread makes a new claim.
fn thread_claim(registry: &Registry, pin: bool) -> Result<Rc<Claim>> {
    THREAD_SLOTS.with(|slots| -> Result<Rc<Claim>> {
        let mut slots = slots.borrow_mut();
        for entry in slots.iter_mut() {
            if let Some(claim) = entry.claim_in(registry) {
                if pin && entry.pinned.is_none() {
                    entry.pinned = Some(Rc::clone(&claim));
                }
                return Ok(claim);
            }
        }

        slots.retain_mut(Cached::prune);
        let claim = Rc::new(Claim {
            table: Arc::clone(registry.table()),
            index: registry.claim(thread_token())?,
        });
        slots.push(Cached {
            claim: Rc::downgrade(&claim),
            pinned: pin.then(|| Rc::clone(&claim)),
        });
        Ok(claim)
    })
}

pub(crate) fn register(registry: &Registry) -> Result<HazardSlot> {
    Ok(HazardSlot {
        claim: thread_claim(registry, false)?,
    })
}

/// Run `f` with the calling thread's slot in `registry`, claiming one on first use.
///
/// The claim is released when the thread exits.
pub(crate) fn with_thread_slot<R>(
    registry: &Registry,
    f: impl FnOnce(&HazardSlot) -> R,
) -> Result<R> {
    let slot = HazardSlot {
        claim: thread_claim(registry, true)?,
    };
    Ok(f(&slot))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::thread_token;
    use crate::sync::atomic::AtomicPtr;
    use crate::{Error, Registry};
    use std::sync::{Arc, Barrier};

    #[test]
    fn tokens_are_per_thread() {
        let here = thread_token();
        assert_ne!(here, 0);
        assert_eq!(here, thread_token());
        let there = std::thread::spawn(thread_token).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn thread_slot_is_reused() {
        let registry = Registry::with_capacity(2);
        let first = registry.with_thread_slot(|slot| slot.index()).unwrap();
        let second = registry.with_thread_slot(|slot| slot.index()).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.claimed(), 1);

        // An explicit registration hands back the same claim instead of taking a second slot.
        let slot = registry.register().unwrap();
        assert_eq!(slot.index(), first);
        assert_eq!(registry.claimed(), 1);

        // The claim is pinned by `with_thread_slot`, so dropping the handle keeps it.
        drop(slot);
        assert_eq!(registry.claimed(), 1);
    }

    #[test]
    fn one_claim_per_thread() {
        let registry = Registry::with_capacity(3);
        let one = registry.register().unwrap();
        let two = registry.register().unwrap();
        assert_eq!(one.index(), two.index());
        assert_eq!(registry.claimed(), 1);

        // Popping through the thread slot uses that same claim too.
        let used = registry.with_thread_slot(|slot| slot.index()).unwrap();
        assert_eq!(used, one.index());
        assert_eq!(registry.claimed(), 1);
        drop((one, two));
        assert_eq!(registry.claimed(), 1);
    }

    #[test]
    fn explicit_claim_released_with_last_handle() {
        let registry = Registry::with_capacity(1);
        let one = registry.register().unwrap();
        let two = registry.register().unwrap();
        drop(one);
        assert_eq!(registry.claimed(), 1);
        drop(two);
        assert_eq!(registry.claimed(), 0);

        // Other threads can have it now.
        let r = registry.clone();
        std::thread::spawn(move || r.register().map(|_| ()))
            .join()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn busy_registry_refuses_other_threads() {
        let registry = Registry::with_capacity(1);
        let _mine = registry.register().unwrap();
        let r = registry.clone();
        let theirs = std::thread::spawn(move || r.register().map(|_| ()))
            .join()
            .unwrap();
        assert_eq!(theirs, Err(Error::ReclamationCapacityExceeded { capacity: 1 }));
    }

    #[test]
    fn thread_slot_released_on_thread_exit() {
        let registry = Registry::with_capacity(1);
        let r = registry.clone();
        std::thread::spawn(move || r.with_thread_slot(|_| ()).unwrap())
            .join()
            .unwrap();
        assert_eq!(registry.claimed(), 0);
        registry.with_thread_slot(|_| ()).unwrap();
    }

    #[test]
    fn dead_registries_are_pruned_on_every_thread() {
        let keep = Registry::with_capacity(2);
        let gone = Registry::with_capacity(2);
        let table = Arc::downgrade(gone.table());

        let pinned = Arc::new(Barrier::new(3));
        let dropped = Arc::new(Barrier::new(3));
        let pruned = Arc::new(Barrier::new(3));
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let (keep, gone) = (keep.clone(), gone.clone());
                let (pinned, dropped, pruned) =
                    (Arc::clone(&pinned), Arc::clone(&dropped), Arc::clone(&pruned));
                std::thread::spawn(move || {
                    gone.with_thread_slot(|_| ()).unwrap();
                    drop(gone);
                    pinned.wait();
                    dropped.wait();

                    // Claiming elsewhere unpins the slot of the registry nobody holds.
                    keep.with_thread_slot(|_| ()).unwrap();
                    super::THREAD_SLOTS.with(|slots| {
                        let slots = slots.borrow();
                        assert_eq!(slots.len(), 1);
                        assert!(slots[0].claim_in(&keep).is_some());
                    });
                    pruned.wait();
                    pruned.wait();
                })
            })
            .collect();

        pinned.wait();
        drop(gone);
        dropped.wait();
        pruned.wait();
        // Both threads are still alive, yet the table is gone.
        assert!(table.upgrade().is_none());
        pruned.wait();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn protect_follows_the_source() {
        let registry = Registry::with_capacity(1);
        let slot = registry.register().unwrap();

        let mut a = 1u32;
        let mut b = 2u32;
        let src = AtomicPtr::new(&mut a as *mut u32);

        assert_eq!(slot.protect(&src), &mut a as *mut u32);
        assert!(slot.is_protecting(&a as *const u32));

        // A stale guess is replaced by whatever the source holds now.
        src.store(&mut b, core::sync::atomic::Ordering::Relaxed);
        assert_eq!(slot.try_protect(&mut a as *mut u32, &src), Err(&mut b as *mut u32));
        assert_eq!(slot.protect(&src), &mut b as *mut u32);
        assert!(registry.is_protected(&b as *const u32));
        assert!(!registry.is_protected(&a as *const u32));
    }
}
