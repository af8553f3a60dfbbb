use crate::{Error, Result};
use core::alloc::Layout;

/// The contract shared by [`HazardStack`](crate::HazardStack) and
/// [`RefCountStack`](crate::RefCountStack).
///
/// Both are unbounded, lock-free, multi-producer multi-consumer LIFO stacks. The only ordering
/// they promise is LIFO with respect to the single linear order of successful updates to the
/// head; nothing about fairness between threads.
pub trait ConcurrentStack<T>: Send + Sync {
    /// Push `value` on top of the stack.
    ///
    /// Aborts through the global allocation error handler if no memory can be obtained for
    /// the node; use [`ConcurrentStack::try_push`] to observe that failure instead.
    fn push(&self, value: T);

    /// Push `value` on top of the stack, reporting allocation failure.
    ///
    /// On [`Error::AllocationFailure`] the stack is left unmodified and `value` is dropped.
    fn try_push(&self, value: T) -> Result<()>;

    /// Remove and return the top of the stack, or `Ok(None)` if it is empty.
    fn pop(&self) -> Result<Option<T>>;

    /// Whether the stack was empty at the moment of the check.
    fn is_empty(&self) -> bool;
}

/// Reserve uninitialized memory for one `N`, or report that none could be had.
///
/// The allocation uses `Layout::new::<N>()` from the global allocator, so once the caller has
/// written an `N` into it, it may be released with `Box::from_raw`. Nothing is moved in here: on
/// failure the caller still owns whatever it meant to store.
pub(crate) fn try_allocate<N>() -> Result<*mut N> {
    let layout = Layout::new::<N>();
    debug_assert_ne!(layout.size(), 0, "nodes always hold a link");
    // Safety: layout has non-zero size.
    let ptr = unsafe { std::alloc::alloc(layout) }.cast::<N>();
    if ptr.is_null() {
        return Err(Error::AllocationFailure);
    }
    Ok(ptr)
}
