//! The `(external_count, pointer)` pair at the head of a split reference-counted list.
//!
//! The pair must be read and swapped as one unit. Normally that is a 128-bit word (count in the
//! high half, address in the low half). Under loom, which only models up to 64-bit atomics, the
//! count takes the top 16 bits and the address the low 48.
//!
//! Targets without a native 128-bit compare-exchange get `portable-atomic`'s lock-based
//! fallback, which keeps the pair correct but not lock-free.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;

/// A pointer together with the number of references taken through this copy of it.
pub(crate) struct CountedPtr<N> {
    pub(crate) external_count: usize,
    pub(crate) ptr: *mut N,
}

impl<N> Clone for CountedPtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<N> Copy for CountedPtr<N> {}

impl<N> PartialEq for CountedPtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.external_count == other.external_count && self.ptr == other.ptr
    }
}
impl<N> Eq for CountedPtr<N> {}

impl<N> core::fmt::Debug for CountedPtr<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CountedPtr")
            .field("external_count", &self.external_count)
            .field("ptr", &self.ptr)
            .finish()
    }
}

impl<N> CountedPtr<N> {
    pub(crate) const fn null() -> Self {
        Self {
            external_count: 0,
            ptr: core::ptr::null_mut(),
        }
    }

    pub(crate) const fn new(ptr: *mut N, external_count: usize) -> Self {
        Self {
            external_count,
            ptr,
        }
    }

    fn pack(self) -> repr::Bits {
        repr::pack(self.external_count, self.ptr as usize)
    }

    fn unpack(bits: repr::Bits) -> Self {
        let (external_count, addr) = repr::unpack(bits);
        Self {
            external_count,
            ptr: addr as *mut N,
        }
    }
}

#[cfg(not(loom))]
mod repr {
    pub(super) type Bits = u128;
    pub(super) use crate::sync::atomic::AtomicU128 as AtomicBits;

    pub(super) fn pack(count: usize, addr: usize) -> Bits {
        ((count as u128) << 64) | addr as u128
    }

    pub(super) fn unpack(bits: Bits) -> (usize, usize) {
        ((bits >> 64) as usize, bits as u64 as usize)
    }

    pub(super) fn is_lock_free() -> bool {
        AtomicBits::is_lock_free()
    }
}

#[cfg(loom)]
mod repr {
    pub(super) type Bits = u64;
    pub(super) use crate::sync::atomic::AtomicU64 as AtomicBits;

    const ADDRESS_BITS: u32 = 48;
    const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;

    pub(super) fn pack(count: usize, addr: usize) -> Bits {
        debug_assert_eq!(addr as u64 & !ADDRESS_MASK, 0, "address wider than 48 bits");
        debug_assert!((count as u64) < (1 << (64 - ADDRESS_BITS)), "external count overflow");
        ((count as u64) << ADDRESS_BITS) | addr as u64
    }

    pub(super) fn unpack(bits: Bits) -> (usize, usize) {
        ((bits >> ADDRESS_BITS) as usize, (bits & ADDRESS_MASK) as usize)
    }

    pub(super) fn is_lock_free() -> bool {
        true
    }
}

/// A [`CountedPtr`] that is loaded and compare-exchanged atomically as a whole.
pub(crate) struct AtomicCountedPtr<N> {
    bits: repr::AtomicBits,
    _marker: PhantomData<*mut N>,
}

impl<N> AtomicCountedPtr<N> {
    pub(crate) fn new(value: CountedPtr<N>) -> Self {
        Self {
            bits: repr::AtomicBits::new(value.pack()),
            _marker: PhantomData,
        }
    }

    /// False where the pair has to be emulated with a lock, on targets without a double-width
    /// compare-exchange.
    pub(crate) fn is_lock_free() -> bool {
        repr::is_lock_free()
    }

    pub(crate) fn load(&self, order: Ordering) -> CountedPtr<N> {
        CountedPtr::unpack(self.bits.load(order))
    }

    pub(crate) fn compare_exchange(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<N>, CountedPtr<N>> {
        self.bits
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(CountedPtr::unpack)
            .map_err(CountedPtr::unpack)
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<N>, CountedPtr<N>> {
        self.bits
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(CountedPtr::unpack)
            .map_err(CountedPtr::unpack)
    }
}
