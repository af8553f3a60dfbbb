use crate::sync::atomic::{AtomicPtr, AtomicUsize};
use core::sync::atomic::Ordering;

/// Owner token of a record nobody has claimed.
pub(crate) const UNOWNED: usize = 0;

/// One slot of the registry: which thread owns it, and what that thread currently protects.
pub(crate) struct HazardRecord {
    pub(crate) owner: AtomicUsize,
    pub(crate) protected: AtomicPtr<u8>,
}

impl HazardRecord {
    pub(crate) fn new() -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            protected: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub(crate) fn try_claim(&self, token: usize) -> bool {
        debug_assert_ne!(token, UNOWNED);
        self.owner.load(Ordering::Relaxed) == UNOWNED
            && self
                .owner
                .compare_exchange(UNOWNED, token, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    pub(crate) fn protect(&self, ptr: *mut u8) {
        self.protected.store(ptr, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.protected.store(core::ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn load(&self) -> *mut u8 {
        self.protected.load(Ordering::Acquire)
    }

    pub(crate) fn is_owned_by(&self, token: usize) -> bool {
        self.owner.load(Ordering::Acquire) == token
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.owner.load(Ordering::Acquire) != UNOWNED
    }

    /// Give the record back to the registry.
    ///
    /// The protected pointer is cleared before the owner: the other way around, a new owner
    /// could claim the record while it still advertises a stale address.
    pub(crate) fn release(&self) {
        self.reset();
        self.owner.store(UNOWNED, Ordering::Release);
    }
}
