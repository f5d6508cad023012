//! The atomic slot engine the containers in this crate are built on.
//!
//! An [`Atomic`] is a single-word, multi-reader/multi-writer cell holding a
//! reference-counted payload. The word packs two fields:
//!
//! * the high 48 bits: the address of a control block (0 for an empty slot),
//! * the low 16 bits: the number of readers currently in the act of turning
//!   the slot's pointer into a counted reference of their own.
//!
//! A reader announces itself and captures the pointer with one `fetch_add`
//! on the word; it then secures a global reference on the block and retires
//! its announcement. A writer replacing the pointer inherits whatever
//! announcements are still pending and folds them into the departing block's
//! global count, minus one for the reference the slot itself held. Between
//! the two sides, every block reaches a zero count exactly once, without
//! hazard pointers or epoch machinery.
//!
//! The module is exposed so the slot can be used directly, the same way the
//! containers here use it: publish immutable structures through
//! [`store`][Atomic::store] or [`compare_exchange`][Atomic::compare_exchange]
//! and read them through [`load`][Atomic::load] or the cheaper
//! [`guard`][Atomic::guard].

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

pub mod handle;

use self::handle::{release, retain, Block, Handle};

/// Width of the in-flight-reader counter.
const COUNT_BITS: u32 = 16;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

// The packing only works while pointers fit the word's upper part.
const _: () = assert!(mem::size_of::<usize>() == mem::size_of::<u64>());

fn pack<T>(block: *mut Block<T>) -> u64 {
    let addr = block as u64;
    assert!(
        addr >> (64 - COUNT_BITS) == 0,
        "control block allocated outside the 48-bit address space"
    );
    addr << COUNT_BITS
}

fn unpack<T>(word: u64) -> *mut Block<T> {
    (word >> COUNT_BITS) as *mut Block<T>
}

fn readers(word: u64) -> u64 {
    word & COUNT_MASK
}

/// A single-word atomic cell of a reference-counted payload.
///
/// Readers get handles (or transient [`Guard`]s) that stay valid for as long
/// as they are held, no matter how many writers replace the slot's value in
/// the meantime. All operations are lock-free.
///
/// # Examples
///
/// ```rust
/// use conarc::{Atomic, Handle};
///
/// let slot = Atomic::new(1);
/// let one = slot.load();
/// slot.store(Handle::new(2));
/// // The old payload is still alive through the handle.
/// assert_eq!(Some(&1), one.as_ref());
/// assert_eq!(Some(&2), slot.load().as_ref());
/// ```
pub struct Atomic<T> {
    packed: CachePadded<AtomicU64>,
    _marker: PhantomData<Handle<T>>,
}

unsafe impl<T: Send + Sync> Send for Atomic<T> {}
unsafe impl<T: Send + Sync> Sync for Atomic<T> {}

impl<T> Atomic<T> {
    /// Creates an empty slot.
    pub fn null() -> Self {
        Atomic {
            packed: CachePadded::new(AtomicU64::new(0)),
            _marker: PhantomData,
        }
    }

    /// Creates a slot holding a fresh payload.
    pub fn new(payload: T) -> Self {
        Self::from_handle(Handle::new(payload))
    }

    /// Creates a slot taking over the handle's reference.
    pub fn from_handle(handle: Handle<T>) -> Self {
        Atomic {
            packed: CachePadded::new(AtomicU64::new(pack(handle.into_block()))),
            _marker: PhantomData,
        }
    }

    /// Takes a counted reference to the current value.
    ///
    /// The returned handle keeps the payload alive for arbitrarily long,
    /// independent of later writes to the slot.
    pub fn load(&self) -> Handle<T> {
        // One instruction both captures the pointer and announces us, so no
        // writer can free the block before we secure a reference below.
        let observed = self.packed.fetch_add(1, Ordering::Acquire);
        debug_assert!(readers(observed) < COUNT_MASK, "reader counter saturated");
        let block = unpack::<T>(observed);
        if block.is_null() {
            self.retire(block, observed + 1);
            return Handle::null();
        }
        unsafe { retain(block) };
        if self.retire(block, observed + 1) {
            // A writer swapped the slot mid-retirement and folded our
            // announcement into the global count; give the duplicate back.
            unsafe { release(block) };
        }
        unsafe { Handle::from_block(block) }
    }

    /// Borrows the current value without touching the global count.
    ///
    /// The reader announcement itself keeps the payload alive until the
    /// guard drops, which makes this roughly half the price of
    /// [`load`][Atomic::load] on the read side. Use it for traversals that
    /// finish quickly; hold a [`Handle`] for anything long-lived.
    pub fn guard(&self) -> Guard<'_, T> {
        let observed = self.packed.fetch_add(1, Ordering::Acquire);
        debug_assert!(readers(observed) < COUNT_MASK, "reader counter saturated");
        Guard {
            slot: self,
            block: unpack(observed),
            announced: observed + 1,
        }
    }

    /// Publishes a new value, reclaiming the previous one.
    pub fn store(&self, new: Handle<T>) {
        // AcqRel: release publishes the new block's contents, acquire lets
        // us touch the departing block's count below.
        let old = self.packed.swap(pack(new.into_block()), Ordering::AcqRel);
        unsafe { Self::reclaim(old) };
    }

    /// Replaces the value if the current payload address equals `expected`.
    ///
    /// This is a strong CAS on the payload: if the slot's payload address is
    /// `expected` and no concurrent writer publishes first, it succeeds. On
    /// failure the rejected handle is returned so the caller can retry with
    /// it.
    ///
    /// The new handle must not refer to the block currently held (a fresh
    /// node built by the caller always satisfies this).
    pub fn compare_exchange(&self, expected: *const T, new: Handle<T>) -> Result<(), Handle<T>> {
        let holder = self.load();
        if holder.as_ptr() != expected {
            return Err(new);
        }
        let held = holder.block_ptr();
        assert!(
            new.block_ptr().is_null() || new.block_ptr() != held,
            "compare_exchange needs a replacement distinct from the held block"
        );

        let desired = pack(new.block_ptr());
        let mut current = pack(held);
        loop {
            let pending = readers(current);
            if pending != 0 {
                // Drain the announcements into the global count before the
                // swap; the slot must never publish a counter it did not
                // account for. The add comes first and is undone on failure.
                if !held.is_null() {
                    unsafe {
                        (&(*held))
                            .ref_count
                            .fetch_add(pending as usize, Ordering::Relaxed);
                    }
                }
                match self.packed.compare_exchange_weak(
                    current,
                    current & !COUNT_MASK,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => current &= !COUNT_MASK,
                    Err(actual) => {
                        if !held.is_null() {
                            let before = unsafe {
                                (&(*held))
                                    .ref_count
                                    .fetch_sub(pending as usize, Ordering::Relaxed)
                            };
                            // `holder` pins the block, the undo cannot free.
                            assert!(
                                before > pending as usize,
                                "speculative drain undo emptied the count"
                            );
                        }
                        if unpack::<T>(actual) != held {
                            return Err(new);
                        }
                        current = actual;
                    }
                }
                continue;
            }
            match self.packed.compare_exchange_weak(
                current,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // The slot owns the new handle's reference now.
                    let _ = new.into_block();
                    unsafe { Self::reclaim(current) };
                    return Ok(());
                }
                Err(actual) => {
                    if unpack::<T>(actual) != held {
                        return Err(new);
                    }
                    current = actual;
                }
            }
        }
    }

    /// Retires one reader announcement from the word.
    ///
    /// Returns true if a writer got there first: the pointer field no longer
    /// matches (or the counter was already drained), meaning the writer
    /// folded the announcement into `block`'s global count and that
    /// reference now belongs to the caller.
    fn retire(&self, block: *mut Block<T>, mut current: u64) -> bool {
        loop {
            debug_assert!(readers(current) > 0, "retiring from a drained counter");
            match self.packed.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(actual) => {
                    if unpack::<T>(actual) != block || readers(actual) == 0 {
                        return true;
                    }
                    current = actual;
                }
            }
        }
    }

    /// Settles the accounts of a word that just left the slot.
    ///
    /// Each pending announcement is owed one global reference and the slot
    /// gives up its own, so the net adjustment is `readers - 1`. An empty
    /// word has nothing to settle (announcements on an empty slot carry no
    /// obligations).
    ///
    /// # Safety
    ///
    /// `old` must have been atomically removed from the slot by the caller,
    /// exactly once.
    unsafe fn reclaim(old: u64) {
        let block = unpack::<T>(old);
        if block.is_null() {
            return;
        }
        let pending = readers(old) as usize;
        if pending == 0 {
            release(block);
        } else if pending > 1 {
            let before = (&(*block)).ref_count.fetch_add(pending - 1, Ordering::Relaxed);
            assert!(before > 0, "folded readers into a dead control block");
        }
        // pending == 1: the lone announcement inherits the slot's reference.
    }
}

impl<T> Drop for Atomic<T> {
    fn drop(&mut self) {
        let word = *self.packed.get_mut();
        debug_assert_eq!(0, readers(word), "slot dropped with readers in flight");
        unsafe { Self::reclaim(word) };
    }
}

impl<T> Default for Atomic<T> {
    fn default() -> Self {
        Atomic::null()
    }
}

impl<T: Debug> Debug for Atomic<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_tuple("Atomic").field(&self.load()).finish()
    }
}

/// A transient borrow of a slot's current value.
///
/// Produced by [`Atomic::guard`]. The payload stays alive at least until the
/// guard drops, even if writers replace the slot's value in between.
pub struct Guard<'a, T> {
    slot: &'a Atomic<T>,
    block: *mut Block<T>,
    announced: u64,
}

impl<'a, T> Guard<'a, T> {
    /// Checks whether the slot was empty when the guard was taken.
    pub fn is_null(&self) -> bool {
        self.block.is_null()
    }

    /// Borrows the guarded payload.
    pub fn as_ref(&self) -> Option<&T> {
        unsafe { self.block.as_ref().map(|block| &*block.data) }
    }

    /// The guarded payload address (null for an empty slot).
    pub fn as_ptr(&self) -> *const T {
        if self.block.is_null() {
            std::ptr::null()
        } else {
            unsafe { (&(*self.block)).data }
        }
    }
}

impl<'a, T> Drop for Guard<'a, T> {
    fn drop(&mut self) {
        if self.slot.retire(self.block, self.announced) && !self.block.is_null() {
            // The swap folded our announcement into the global count; that
            // reference is ours to drop.
            unsafe { release(self.block) };
        }
    }
}
