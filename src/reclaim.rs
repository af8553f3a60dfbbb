use crate::sync::atomic::{AtomicPtr, AtomicUsize};
use crate::sync::WithMut;
use crate::Registry;
use alloc::boxed::Box;
use core::sync::atomic::Ordering;
use tracing::trace;

/// Frees the object behind a type-erased address.
///
/// # Safety
///
/// Safe to call when it would be safe to free the originating allocation exactly once.
pub type Deleter = unsafe fn(*mut u8);

/// A [`Deleter`] for addresses that came from `Box::<T>::into_raw`.
///
/// # Safety
///
/// `ptr` must have been produced by `Box::<T>::into_raw` (or allocated with the global
/// allocator using `Layout::new::<T>()` and initialized), and must not be used afterwards.
pub unsafe fn drop_box<T>(ptr: *mut u8) {
    // Safety: by the contract above.
    let _ = unsafe { Box::from_raw(ptr.cast::<T>()) };
}

struct Retired {
    ptr: *mut u8,
    deleter: Deleter,
    next: AtomicPtr<Retired>,
}

/// A lock-free list of unlinked objects that could not be freed yet.
///
/// When a [`HazardStack`](crate::HazardStack) pops a node that some other thread still
/// protects, the node goes here. [`ReclaimList::drain_and_retry`] later frees every entry whose
/// address is no longer protected and puts the rest back, so the list only ever holds entries
/// that were protected at the time of the last pass.
pub struct ReclaimList {
    head: AtomicPtr<Retired>,
    pending: AtomicUsize,
}

impl Default for ReclaimList {
    fn default() -> Self {
        Self::new()
    }
}

impl ReclaimList {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Defer freeing `ptr` until no slot of the registry passed to
    /// [`ReclaimList::drain_and_retry`] protects it.
    ///
    /// # Safety
    ///
    /// 1. `ptr` is no longer reachable by threads that have not already protected it.
    /// 2. `deleter` may be called on `ptr`, once, from any thread.
    /// 3. `ptr` has not been handed to any other deleter or list.
    pub unsafe fn push(&self, ptr: *mut u8, deleter: Deleter) {
        let retired = Box::into_raw(Box::new(Retired {
            ptr,
            deleter,
            next: AtomicPtr::new(core::ptr::null_mut()),
        }));
        self.pending.fetch_add(1, Ordering::Relaxed);
        // Safety: a fresh single-element chain we own.
        unsafe { self.push_chain(retired, retired) };
    }

    /// # Safety
    ///
    /// `head..=tail` is a well-formed chain of `Retired` owned by the caller.
    unsafe fn push_chain(&self, head: *mut Retired, tail: *mut Retired) {
        if head.is_null() {
            return;
        }

        let mut now = self.head.load(Ordering::Acquire);
        loop {
            // Safety: we own the chain until the CAS publishes it.
            unsafe { &*tail }.next.store(now, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(now, head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(head_now) => now = head_now,
            }
        }
    }

    /// Free every pending entry no slot of `registry` protects; keep the others for later.
    ///
    /// The whole list is detached in one swap, so concurrent callers never process the same
    /// entries. Returns the number of entries freed.
    pub fn drain_and_retry(&self, registry: &Registry) -> usize {
        let mut node = self.head.swap(core::ptr::null_mut(), Ordering::Acquire);
        if node.is_null() {
            return 0;
        }

        crate::sync::heavy_barrier();
        let protected = registry.protected();

        let mut kept: *mut Retired = core::ptr::null_mut();
        let mut kept_tail: *mut Retired = core::ptr::null_mut();
        let (mut nreclaimed, mut nkept) = (0, 0);
        while !node.is_null() {
            // Safety: the swap above made us the only owner of this chain.
            let n = unsafe { &*node };
            let next = n.next.load(Ordering::Relaxed);
            debug_assert_ne!(node, next);

            if protected.contains(&n.ptr) {
                n.next.store(kept, Ordering::Relaxed);
                if kept_tail.is_null() {
                    kept_tail = node;
                }
                kept = node;
                nkept += 1;
            } else {
                // Safety: unreachable, unprotected, and owned by us alone.
                unsafe { Self::reclaim(node) };
                nreclaimed += 1;
            }
            node = next;
        }

        if nreclaimed != 0 {
            self.pending.fetch_sub(nreclaimed, Ordering::Relaxed);
        }
        // Safety: `kept..=kept_tail` was built above from nodes we own.
        unsafe { self.push_chain(kept, kept_tail) };

        trace!(reclaimed = nreclaimed, deferred = nkept, "reclaim pass");
        nreclaimed
    }

    /// Free every entry regardless of protection. Returns the number freed.
    ///
    /// `&mut self` rules out concurrent pushes and drains; the caller additionally vouches that
    /// no thread will read through any protected entry again.
    pub fn reclaim_all(&mut self) -> usize {
        let mut node = self.head.with_mut(|p| core::mem::replace(p, core::ptr::null_mut()));
        let mut n = 0;
        while !node.is_null() {
            // Safety: exclusive access to the list, and each entry is freed once.
            let next = unsafe { &*node }.next.load(Ordering::Relaxed);
            unsafe { Self::reclaim(node) };
            node = next;
            n += 1;
        }
        self.pending.fetch_sub(n, Ordering::Relaxed);
        n
    }

    /// The number of entries waiting to be freed.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// # Safety
    ///
    /// `retired` is owned by the caller and its object may be freed.
    unsafe fn reclaim(retired: *mut Retired) {
        let retired = unsafe { Box::from_raw(retired) };
        // Safety: the `push` contract makes this the one call of the deleter for `ptr`.
        unsafe { (retired.deleter)(retired.ptr) };
    }
}

impl Drop for ReclaimList {
    fn drop(&mut self) {
        self.reclaim_all();
    }
}
