#[cfg(loom)]
pub(crate) mod atomic {
    pub(crate) use loom::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize};
}
#[cfg(loom)]
pub(crate) use loom::thread_local;

#[cfg(not(loom))]
pub(crate) mod atomic {
    pub(crate) use core::sync::atomic::{fence, AtomicIsize, AtomicPtr, AtomicUsize};
    pub(crate) use portable_atomic::AtomicU128;
}
#[cfg(not(loom))]
pub(crate) use std::thread_local;

use core::sync::atomic::Ordering;

/// Orders a hazard publication before the re-read of the source pointer.
pub(crate) fn light_barrier() {
    atomic::fence(Ordering::SeqCst);
}

/// Orders an unlink before the scan of published hazards.
pub(crate) fn heavy_barrier() {
    atomic::fence(Ordering::SeqCst);
}

// Make AtomicPtr usable with loom API.
pub(crate) trait WithMut<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut *mut T) -> R) -> R;
}

#[cfg(not(loom))]
impl<T> WithMut<T> for core::sync::atomic::AtomicPtr<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut *mut T) -> R) -> R {
        f(self.get_mut())
    }
}

#[cfg(loom)]
impl<T> WithMut<T> for loom::sync::atomic::AtomicPtr<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut *mut T) -> R) -> R {
        loom::sync::atomic::AtomicPtr::with_mut(self, f)
    }
}
