use crate::reclaim::{drop_box, ReclaimList};
use crate::stack::{try_allocate, ConcurrentStack};
use crate::sync::atomic::AtomicPtr;
use crate::sync::WithMut;
use crate::{HazardSlot, Registry, Result};
use alloc::boxed::Box;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::sync::atomic::Ordering;
use tracing::debug;

struct Node<T> {
    value: ManuallyDrop<T>,
    // Written only before the node is published, never after.
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            next: core::ptr::null_mut(),
        }
    }
}

/// A lock-free LIFO stack whose popped nodes are reclaimed with hazard pointers.
///
/// Before `pop` reads through the current head, it publishes the head's address in the calling
/// thread's slot of the stack's [`Registry`]. A popped node is freed right away if no slot
/// publishes it; otherwise it is parked on a [`ReclaimList`] and freed by a later `pop` (or
/// [`HazardStack::reclaim`]) once nobody protects it any more.
///
/// The first `pop` on each thread claims a registry slot for that thread, which it keeps until
/// it exits. If the registry has no free slot, `pop` fails with
/// [`Error::ReclamationCapacityExceeded`](crate::Error::ReclamationCapacityExceeded).
///
/// ```
/// use reclaim_stack::HazardStack;
///
/// let stack = HazardStack::new();
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.pop().unwrap(), Some(2));
/// assert_eq!(stack.pop().unwrap(), Some(1));
/// assert_eq!(stack.pop().unwrap(), None);
/// ```
pub struct HazardStack<T> {
    head: AtomicPtr<Node<T>>,
    registry: Registry,
    retired: ReclaimList,
    #[cfg(test)]
    freed: std::sync::atomic::AtomicUsize,
    _owns: PhantomData<T>,
}

// Safety: values only ever move between threads, they are never shared.
unsafe impl<T: Send> Send for HazardStack<T> {}
unsafe impl<T: Send> Sync for HazardStack<T> {}

impl<T> Default for HazardStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HazardStack<T> {
    /// Create an empty stack with a registry of its own.
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Create an empty stack whose readers protect nodes through `registry`.
    ///
    /// Several stacks may share one registry; a thread then holds one slot for all of them.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
            registry,
            retired: ReclaimList::new(),
            #[cfg(test)]
            freed: std::sync::atomic::AtomicUsize::new(0),
            _owns: PhantomData,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node::new(value)));
        // Safety: fresh, unshared allocation.
        unsafe { self.link(node) };
    }

    /// Like [`HazardStack::push`], but returns
    /// [`Error::AllocationFailure`](crate::Error::AllocationFailure) instead of aborting when
    /// the node cannot be allocated.
    pub fn try_push(&self, value: T) -> Result<()> {
        // On failure `value` is still ours and is dropped on the way out.
        let node = try_allocate::<Node<T>>()?;
        // Safety: fresh, unshared allocation sized for one node.
        unsafe {
            node.write(Node::new(value));
            self.link(node);
        }
        Ok(())
    }

    /// # Safety
    ///
    /// `node` is valid and not yet reachable by any other thread.
    unsafe fn link(&self, node: *mut Node<T>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: nobody else can see `node` until the CAS succeeds.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }
    }

    /// Pop the top value, using the calling thread's registry slot.
    ///
    /// Returns `Ok(None)` if the stack is empty, and
    /// [`Error::ReclamationCapacityExceeded`](crate::Error::ReclamationCapacityExceeded) if
    /// this thread has no slot yet and none is free.
    pub fn pop(&self) -> Result<Option<T>> {
        self.registry.with_thread_slot(|slot| self.pop_with(slot))
    }

    /// Pop the top value, protecting the candidate node with `slot`.
    ///
    /// Whatever `slot` protected before is overwritten, and it protects nothing on return.
    ///
    /// # Panics
    ///
    /// Panics if `slot` was not claimed from this stack's registry.
    pub fn pop_with(&self, slot: &HazardSlot) -> Option<T> {
        assert!(
            slot.is_from(&self.registry),
            "hazard slot belongs to a different registry than the stack"
        );

        loop {
            let candidate = slot.protect(&self.head);
            if candidate.is_null() {
                slot.reset_protection();
                return None;
            }

            // Safety: `candidate` was still the head after `slot` published it, so it cannot
            // have been freed, and `next` does not change once a node is published.
            let next = unsafe { (*candidate).next };
            if self
                .head
                .compare_exchange(candidate, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // Safety: the CAS made us the only thread that will ever take this value. Other
            // readers of `candidate` only look at `next`.
            let value = unsafe {
                ManuallyDrop::into_inner(core::ptr::read(core::ptr::addr_of!((*candidate).value)))
            };
            slot.reset_protection();

            // Safety: unlinked by us, exactly once.
            unsafe { self.retire(candidate) };
            if !self.retired.is_empty() {
                self.reclaim();
            }
            return Some(value);
        }
    }

    /// # Safety
    ///
    /// `node` was unlinked from `head` by the caller, whose own protection is already cleared.
    unsafe fn retire(&self, node: *mut Node<T>) {
        crate::sync::heavy_barrier();
        if self.registry.is_protected(node) {
            // Safety: `node` is a `Box<Node<T>>` that nobody can reach from `head` any more.
            unsafe { self.retired.push(node.cast(), drop_box::<Node<T>>) };
        } else {
            // Safety: unreachable and unprotected, so nobody can be reading it.
            unsafe { drop_box::<Node<T>>(node.cast()) };
            self.note_freed(1);
        }
    }

    /// Free every parked node that is no longer protected. Returns how many were freed.
    pub fn reclaim(&self) -> usize {
        let n = self.retired.drain_and_retry(&self.registry);
        self.note_freed(n);
        n
    }

    /// The number of popped nodes still waiting to be freed.
    pub fn pending_reclaims(&self) -> usize {
        self.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    #[allow(unused_variables)]
    fn note_freed(&self, n: usize) {
        #[cfg(test)]
        self.freed.fetch_add(n, Ordering::Relaxed);
    }
}

impl<T: Send> ConcurrentStack<T> for HazardStack<T> {
    fn push(&self, value: T) {
        HazardStack::push(self, value)
    }

    fn try_push(&self, value: T) -> Result<()> {
        HazardStack::try_push(self, value)
    }

    fn pop(&self) -> Result<Option<T>> {
        HazardStack::pop(self)
    }

    fn is_empty(&self) -> bool {
        HazardStack::is_empty(self)
    }
}

impl<T> Drop for HazardStack<T> {
    fn drop(&mut self) {
        let mut node = self.head.with_mut(|p| core::mem::replace(p, core::ptr::null_mut()));
        let mut drained = 0;
        while !node.is_null() {
            // Safety: `&mut self` means no pop is in flight, so we own every linked node.
            let mut n = unsafe { Box::from_raw(node) };
            node = n.next;
            // Safety: still linked, so its value was never taken.
            unsafe { ManuallyDrop::drop(&mut n.value) };
            drained += 1;
        }
        self.note_freed(drained);

        let released = self.retired.reclaim_all();
        self.note_freed(released);
        debug!(drained, released, "dropped hazard pointer stack");
    }
}

impl<T> core::fmt::Debug for HazardStack<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HazardStack")
            .field("is_empty", &self.is_empty())
            .field("pending_reclaims", &self.pending_reclaims())
            .field("registry", &self.registry)
            .finish()
    }
}
