//! The owned, reference-counted [`Handle`] and its backing control block.
//!
//! A control block is the unit of reclamation for the whole crate: it owns
//! the payload through a single indirection and carries the global reference
//! count. Handles are the only safe way to hold one; the slot in
//! [`raw`][crate::raw] holds another, implicit, reference and folds its
//! reader announcements into the same count.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// The shared record behind every handle: an owning payload pointer and the
/// global reference count.
///
/// The payload pointer is non-null for the block's entire lifetime; both are
/// freed together when the count drops to zero.
pub(crate) struct ControlBlock<T> {
    pub(crate) data: *mut T,
    pub(crate) ref_count: AtomicUsize,
}

/// Control blocks get a cache line of their own so the hot reference count
/// does not false-share with neighbouring allocations.
pub(crate) type Block<T> = CachePadded<ControlBlock<T>>;

pub(crate) fn allocate<T>(payload: T) -> *mut Block<T> {
    let data = Box::into_raw(Box::new(payload));
    Box::into_raw(Box::new(CachePadded::new(ControlBlock {
        data,
        ref_count: AtomicUsize::new(1),
    })))
}

/// Adds one reference to a block someone else is already keeping alive.
///
/// # Safety
///
/// The block must be live and the caller must be guaranteed at least one
/// reference for the duration of the call (its own handle, the slot's
/// reference, or an outstanding reader announcement).
pub(crate) unsafe fn retain<T>(block: *mut Block<T>) {
    let before = (&(*block)).ref_count.fetch_add(1, Ordering::Relaxed);
    assert!(before > 0, "retained a control block with no references");
}

/// Drops one reference, freeing payload and block on the last one.
///
/// # Safety
///
/// The caller must own the reference it is giving up.
pub(crate) unsafe fn release<T>(block: *mut Block<T>) {
    let before = (&(*block)).ref_count.fetch_sub(1, Ordering::Release);
    assert!(before > 0, "released a control block with no references");
    if before == 1 {
        // Synchronize with every preceding release-decrement before touching
        // the payload.
        atomic::fence(Ordering::Acquire);
        drop(Box::from_raw((&(*block)).data));
        drop(Box::from_raw(block));
    }
}

/// An owned, clonable reference to a shared payload, or null.
///
/// This is the value-type half of the crate: containers thread handles
/// through immutable node graphs and publish them through
/// [`Atomic`][crate::raw::Atomic] slots. Cloning bumps the shared count,
/// dropping the last handle (and the last slot reference) frees the payload.
///
/// Unlike [`Arc`][std::sync::Arc] a handle can be null; lookups return
/// [`None`] from [`as_ref`][Handle::as_ref] in that case. Cloning a null
/// handle yields another null handle.
pub struct Handle<T> {
    block: *mut Block<T>,
    _marker: PhantomData<ControlBlock<T>>,
}

unsafe impl<T: Send + Sync> Send for Handle<T> {}
unsafe impl<T: Send + Sync> Sync for Handle<T> {}

impl<T> Handle<T> {
    /// Creates a null handle.
    pub fn null() -> Self {
        Handle {
            block: ptr::null_mut(),
            _marker: PhantomData,
        }
    }

    /// Allocates a fresh control block owning `payload`, with one reference.
    pub fn new(payload: T) -> Self {
        Handle {
            block: allocate(payload),
            _marker: PhantomData,
        }
    }

    /// Adopts one already-counted reference to `block`.
    pub(crate) unsafe fn from_block(block: *mut Block<T>) -> Self {
        Handle {
            block,
            _marker: PhantomData,
        }
    }

    pub(crate) fn block_ptr(&self) -> *mut Block<T> {
        self.block
    }

    /// Surrenders the reference without dropping it; the caller takes over
    /// the count the handle held.
    pub(crate) fn into_block(self) -> *mut Block<T> {
        let block = self.block;
        mem::forget(self);
        block
    }

    /// Checks for the null handle.
    pub fn is_null(&self) -> bool {
        self.block.is_null()
    }

    /// Borrows the payload, or [`None`] for a null handle.
    pub fn as_ref(&self) -> Option<&T> {
        unsafe { self.block.as_ref().map(|block| &*block.data) }
    }

    /// The raw payload address (null for a null handle).
    ///
    /// This is the "expected" currency of
    /// [`Atomic::compare_exchange`][crate::raw::Atomic::compare_exchange].
    pub fn as_ptr(&self) -> *const T {
        if self.block.is_null() {
            ptr::null()
        } else {
            unsafe { (&(*self.block)).data }
        }
    }

    /// Mutable payload access, available only while this handle is the sole
    /// reference (a node built but not yet published).
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.block.is_null() {
            return None;
        }
        unsafe {
            if (&(*self.block)).ref_count.load(Ordering::Acquire) == 1 {
                Some(&mut *(&mut (*self.block)).data)
            } else {
                None
            }
        }
    }

    /// Whether two handles refer to the same control block.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        if !self.block.is_null() {
            unsafe { retain(self.block) };
        }
        Handle {
            block: self.block,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        if !self.block.is_null() {
            unsafe { release(self.block) };
        }
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Handle::null()
    }
}

impl<T: Debug> Debug for Handle<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        match self.as_ref() {
            Some(payload) => fmt.debug_tuple("Handle").field(payload).finish(),
            None => fmt.write_str("Handle(null)"),
        }
    }
}
