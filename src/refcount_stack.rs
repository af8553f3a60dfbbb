use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::stack::{try_allocate, ConcurrentStack};
use crate::sync::atomic::AtomicIsize;
use crate::Result;
use alloc::boxed::Box;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::sync::atomic::Ordering;
use tracing::debug;

struct Node<T> {
    value: ManuallyDrop<T>,
    internal_count: AtomicIsize,
    // Written only before the node is published, never after.
    next: CountedPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            internal_count: AtomicIsize::new(0),
            next: CountedPtr::null(),
        }
    }
}

/// A lock-free LIFO stack whose popped nodes are reclaimed with split reference counts.
///
/// The head is a `(external_count, pointer)` pair swapped as one unit. Every `pop` attempt
/// first bumps the external count of the head it is about to read through, which keeps that
/// node alive without any registry. Each node additionally carries an internal count: the
/// thread that unlinks a node folds the external count into it, every other reader decrements
/// it when done, and whoever brings it to exactly zero frees the node.
///
/// Unlike [`HazardStack`](crate::HazardStack), `pop` never fails.
///
/// The head is only lock-free where the target has a double-width compare-exchange; see
/// [`RefCountStack::is_lock_free`].
///
/// ```
/// use reclaim_stack::RefCountStack;
///
/// let stack = RefCountStack::new();
/// stack.push("a");
/// stack.push("b");
/// assert_eq!(stack.pop().unwrap(), Some("b"));
/// assert_eq!(stack.pop().unwrap(), Some("a"));
/// assert_eq!(stack.pop().unwrap(), None);
/// ```
pub struct RefCountStack<T> {
    head: AtomicCountedPtr<Node<T>>,
    #[cfg(test)]
    freed: std::sync::atomic::AtomicUsize,
    _owns: PhantomData<T>,
}

// Safety: values only ever move between threads, they are never shared.
unsafe impl<T: Send> Send for RefCountStack<T> {}
unsafe impl<T: Send> Sync for RefCountStack<T> {}

impl<T> Default for RefCountStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RefCountStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicCountedPtr::new(CountedPtr::null()),
            #[cfg(test)]
            freed: std::sync::atomic::AtomicUsize::new(0),
            _owns: PhantomData,
        }
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node::new(value)));
        // Safety: fresh, unshared allocation.
        unsafe { self.link(node) };
    }

    /// Like [`RefCountStack::push`], but returns
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
        // The list holds one reference to a node while it is linked.
        let new = CountedPtr::new(node, 1);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: nobody else can see `node` until the CAS succeeds.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }
    }

    /// Take a reference through the current head: bump its external count, retrying until the
    /// bump lands on whatever pair `head` holds. On return `old` is the pair as installed.
    fn increase_head_count(&self, old: &mut CountedPtr<Node<T>>) {
        loop {
            let new = CountedPtr::new(old.ptr, old.external_count + 1);
            match self
                .head
                .compare_exchange(*old, new, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => {
                    *old = new;
                    break;
                }
                Err(now) => *old = now,
            }
        }
    }

    /// Pop the top value. Returns `Ok(None)` if the stack is empty; never fails otherwise.
    pub fn pop(&self) -> Result<Option<T>> {
        Ok(self.take())
    }

    fn take(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            self.increase_head_count(&mut old_head);
            let ptr = old_head.ptr;
            if ptr.is_null() {
                return None;
            }

            // Safety: our external reference keeps `ptr` alive, and `next` does not change
            // once a node is published.
            let next = unsafe { (*ptr).next };
            match self
                .head
                .compare_exchange(old_head, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    // Safety: the CAS made us the only thread that will ever take this value.
                    // Other readers of `ptr` only touch `next` and `internal_count`.
                    let value = unsafe {
                        ManuallyDrop::into_inner(core::ptr::read(core::ptr::addr_of!(
                            (*ptr).value
                        )))
                    };

                    // One reference was the list's, one was ours; the rest belong to readers
                    // that have yet to give theirs back.
                    let count_increase = old_head.external_count as isize - 2;
                    // Safety: we still hold our reference, so the node is alive.
                    let internal = unsafe { &(*ptr).internal_count };
                    if internal.fetch_add(count_increase, Ordering::AcqRel) == -count_increase {
                        // Safety: every reference has been given back.
                        unsafe { self.free(ptr) };
                    }
                    return Some(value);
                }
                Err(now) => {
                    // Somebody else changed the head first; give back our reference.
                    // Safety: we still hold our reference, so the node is alive.
                    let internal = unsafe { &(*ptr).internal_count };
                    if internal.fetch_sub(1, Ordering::AcqRel) == 1 {
                        // Safety: the node was unlinked by another thread and ours was the
                        // last reference.
                        unsafe { self.free(ptr) };
                    }
                    old_head = now;
                }
            }
        }
    }

    /// # Safety
    ///
    /// `node` is unlinked, its value was taken, and no references to it remain.
    unsafe fn free(&self, node: *mut Node<T>) {
        // Safety: by the contract above; the value is `ManuallyDrop` and is not dropped here.
        drop(unsafe { Box::from_raw(node) });
        #[cfg(test)]
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).ptr.is_null()
    }

    /// Whether the `(count, pointer)` head is updated without locks on this machine.
    ///
    /// The head needs a double-width compare-exchange. Where the CPU has none (for example
    /// x86_64 parts without `cmpxchg16b`), it is emulated with a lock and this returns false.
    pub fn is_lock_free() -> bool {
        AtomicCountedPtr::<Node<T>>::is_lock_free()
    }
}

impl<T: Send> ConcurrentStack<T> for RefCountStack<T> {
    fn push(&self, value: T) {
        RefCountStack::push(self, value)
    }

    fn try_push(&self, value: T) -> Result<()> {
        RefCountStack::try_push(self, value)
    }

    fn pop(&self) -> Result<Option<T>> {
        RefCountStack::pop(self)
    }

    fn is_empty(&self) -> bool {
        RefCountStack::is_empty(self)
    }
}

impl<T> Drop for RefCountStack<T> {
    fn drop(&mut self) {
        // `&mut self`: no pop is in flight, so every linked node is ours alone.
        let mut node = self.head.load(Ordering::Acquire).ptr;
        let mut drained = 0usize;
        while !node.is_null() {
            // Safety: linked nodes are owned by the stack and still hold their value.
            let mut n = unsafe { Box::from_raw(node) };
            node = n.next.ptr;
            unsafe { ManuallyDrop::drop(&mut n.value) };
            drained += 1;
        }
        debug!(drained, "dropped reference-counted stack");
    }
}

impl<T> core::fmt::Debug for RefCountStack<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefCountStack")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}
