#![cfg(not(loom))]

use reclaim_stack::*;

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The system allocator, except that it hands out nothing while the current thread is inside
/// [`refusing`].
struct Refusing;

thread_local! {
    static REFUSE: Cell<bool> = const { Cell::new(false) };
}

unsafe impl GlobalAlloc for Refusing {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if REFUSE.try_with(Cell::get).unwrap_or(false) {
            return std::ptr::null_mut();
        }
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static ALLOCATOR: Refusing = Refusing;

struct Allowing;
impl Drop for Allowing {
    fn drop(&mut self) {
        REFUSE.with(|r| r.set(false));
    }
}

fn refusing<R>(f: impl FnOnce() -> R) -> R {
    REFUSE.with(|r| r.set(true));
    let _reset = Allowing;
    f()
}

struct CountDrops(Arc<AtomicUsize>);
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn failed_push_leaves_stack_and_drops_value<S: ConcurrentStack<CountDrops>>(stack: S) {
    let drops = Arc::new(AtomicUsize::new(0));
    stack.push(CountDrops(Arc::clone(&drops)));

    let rejected = CountDrops(Arc::clone(&drops));
    let result = refusing(|| stack.try_push(rejected));
    assert_eq!(result, Err(Error::AllocationFailure));
    assert_eq!(drops.load(Ordering::SeqCst), 1, "rejected value dropped exactly once");

    // Only the value pushed before the failure is there.
    assert!(stack.pop().unwrap().is_some());
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    assert!(stack.pop().unwrap().is_none());
    assert!(stack.is_empty());

    // Allocation works again once the allocator does.
    stack.try_push(CountDrops(Arc::clone(&drops))).unwrap();
    drop(stack);
    assert_eq!(drops.load(Ordering::SeqCst), 3);
}

#[test]
fn hazard_failed_push() {
    failed_push_leaves_stack_and_drops_value(HazardStack::new());
}

#[test]
fn refcount_failed_push() {
    failed_push_leaves_stack_and_drops_value(RefCountStack::new());
}
