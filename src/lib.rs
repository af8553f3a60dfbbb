//! Lock-free LIFO stacks with safe memory reclamation.
//!
//! A lock-free stack is easy to write until it has to free the nodes it pops: the moment a
//! thread unlinks the head, other threads may still be about to read through their own copy of
//! that pointer. This crate provides two stacks with the same contract
//! ([`ConcurrentStack`]) that solve this in different ways.
//!
//! - [`HazardStack`] uses [_hazard pointers_][hazptr]. Before reading through the head, a
//!   popping thread publishes its address in a slot of a [`Registry`]. A node is freed only
//!   once no slot publishes it; popped nodes that are still protected wait on a
//!   [`ReclaimList`] until a later pass finds them unprotected. Registries have a fixed number
//!   of slots, and a thread that cannot claim one gets
//!   [`Error::ReclamationCapacityExceeded`].
//! - [`RefCountStack`] uses _split reference counts_. The head is a `(count, pointer)` pair
//!   swapped as one unit; readers bump the count before dereferencing, and each node keeps an
//!   internal count that the unlinking thread and late readers settle between them. Whoever
//!   brings the total to zero frees the node. There is no registry and no capacity limit.
//!
//! Both are unbounded, and both are lock-free rather than wait-free: a given thread may retry
//! under contention, but some thread always makes progress. [`RefCountStack`] needs a 128-bit
//! compare-exchange for that; on targets without one its head falls back to a lock (see
//! [`RefCountStack::is_lock_free`]).
//!
//! ```
//! use reclaim_stack::{ConcurrentStack, HazardStack, RefCountStack};
//! use std::sync::Arc;
//!
//! fn exercise(stack: Arc<dyn ConcurrentStack<u32>>) {
//!     let workers: Vec<_> = (0..4)
//!         .map(|t| {
//!             let stack = Arc::clone(&stack);
//!             std::thread::spawn(move || {
//!                 for i in 0..100 {
//!                     stack.push(t * 100 + i);
//!                 }
//!                 let mut got = 0;
//!                 while got < 100 {
//!                     if stack.pop().unwrap().is_some() {
//!                         got += 1;
//!                     }
//!                 }
//!             })
//!         })
//!         .collect();
//!     for w in workers {
//!         w.join().unwrap();
//!     }
//!     assert!(stack.is_empty());
//! }
//!
//! exercise(Arc::new(HazardStack::<u32>::new()));
//! exercise(Arc::new(RefCountStack::<u32>::new()));
//! ```
//!
//! [hazptr]: https://citeseerx.ist.psu.edu/viewdoc/download?doi=10.1.1.395.378&rep=rep1&type=pdf

#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod counted;
mod error;
mod hazard_stack;
mod holder;
mod reclaim;
mod record;
mod refcount_stack;
mod registry;
mod stack;
mod sync;

pub use error::{Error, Result};
pub use hazard_stack::HazardStack;
pub use holder::HazardSlot;
pub use reclaim::{drop_box, Deleter, ReclaimList};
pub use refcount_stack::RefCountStack;
pub use registry::{Registry, DEFAULT_CAPACITY};
pub use stack::ConcurrentStack;
