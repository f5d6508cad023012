//! Lock-free containers over an atomic reference-counted pointer.
//!
//! The heart of the crate is [`Atomic<T>`][Atomic], a single-word atomic
//! cell of a shared, reference-counted payload. Unlike an
//! [`AtomicPtr`][std::sync::atomic::AtomicPtr], reading it yields a
//! [`Handle`] that keeps the payload alive for as long as the reader wants,
//! no matter how many times the cell is overwritten in the meantime. The
//! trick is packing a 16-bit in-flight-reader counter into the pointer word
//! itself, so a single `fetch_add` both reads the pointer and makes the
//! reader visible to any writer that would otherwise free the payload out
//! from under it. No epochs, no hazard pointers, no garbage lists.
//!
//! On top of the cell sit four containers, all built the same way: an
//! immutable, structurally-shared node graph whose root (or ends) live in
//! atomic cells, mutated by building a new version and committing it with a
//! compare-exchange retry loop.
//!
//! * [`ConStack`] — a Treiber stack.
//! * [`ConQueue`] — a Michael–Scott queue.
//! * [`TreapMap`] — an ordered map as a persistent treap.
//! * [`AvlMap`] — an ordered map as a persistent AVL tree.
//!
//! Everything is lock-free: a failed attempt anywhere means some other
//! operation succeeded. Readers of the maps traverse a consistent snapshot
//! and are never blocked or retried.
//!
//! # Examples
//!
//! ```rust
//! use conarc::TreapMap;
//! use crossbeam_utils::thread;
//!
//! let map = TreapMap::new();
//! thread::scope(|s| {
//!     s.spawn(|_| {
//!         map.upsert("hello", 1);
//!     });
//!     s.spawn(|_| {
//!         map.upsert("world", 2);
//!     });
//! })
//! .unwrap();
//! assert_eq!(Some(1), map.get("hello"));
//! assert_eq!(Some(2), map.get("world"));
//! ```
//!
//! # Limits
//!
//! The packed word leaves 48 bits for the pointer and 16 for the reader
//! counter, which assumes a 64-bit target with a user address space no
//! wider than 48 bits and fewer than 65,536 simultaneous readers racing a
//! single cell between two writes. Both match every current mainstream
//! 64-bit platform and workload; the counter bound is checked by a debug
//! assertion.

pub mod avl;
pub mod queue;
pub mod raw;
pub mod stack;
pub mod treap;

pub use crate::avl::AvlMap;
pub use crate::queue::ConQueue;
pub use crate::raw::handle::Handle;
pub use crate::raw::{Atomic, Guard};
pub use crate::stack::ConStack;
pub use crate::treap::TreapMap;
