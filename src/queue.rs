//! The [`ConQueue`] type, a lock-free FIFO queue.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::raw::handle::Handle;
use crate::raw::Atomic;

struct Node<T> {
    next: Atomic<Node<T>>,
    value: Option<T>,
    consumed: AtomicBool,
}

impl<T> Node<T> {
    fn carrying(value: T) -> Handle<Node<T>> {
        Handle::new(Node {
            next: Atomic::null(),
            value: Some(value),
            consumed: AtomicBool::new(false),
        })
    }

    /// The permanently-consumed node both ends start at, so the empty queue
    /// needs no special casing.
    fn sentinel() -> Handle<Node<T>> {
        Handle::new(Node {
            next: Atomic::null(),
            value: None,
            consumed: AtomicBool::new(true),
        })
    }
}

/// A lock-free queue.
///
/// Nodes are linked through [`Atomic`][crate::Atomic] slots; `head` and
/// `tail` are slots as well, both starting at a shared sentinel. A push
/// links its node into the last `next` slot and then helps swing `tail`
/// forward; a pop claims the first unconsumed node by a test-and-set of its
/// `consumed` flag, moving `head` past nodes that are already spent.
/// Claimed nodes fall out of `head` eventually and are reclaimed by the
/// slot protocol; nothing is freed by the queue itself.
///
/// # Examples
///
/// ```rust
/// use conarc::ConQueue;
///
/// let queue = ConQueue::new();
/// queue.push(1);
/// queue.push(2);
/// assert_eq!(Some(1), queue.pop());
/// assert_eq!(Some(2), queue.pop());
/// assert_eq!(None, queue.pop());
/// ```
pub struct ConQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
}

impl<T> ConQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        ConQueue {
            head: Atomic::from_handle(sentinel.clone()),
            tail: Atomic::from_handle(sentinel),
        }
    }

    /// Appends a value at the back.
    pub fn push(&self, value: T) {
        let node = Node::carrying(value);
        loop {
            let tail = self.tail.load();
            let tail_node = tail.as_ref().expect("the queue always holds its sentinel");
            match tail_node.next.compare_exchange(ptr::null(), node.clone()) {
                Ok(()) => {
                    // Losing this race is fine, someone else already helped.
                    let _ = self.tail.compare_exchange(tail.as_ptr(), node);
                    return;
                }
                Err(_) => {
                    // Another push linked first; help swing the tail to it
                    // before retrying.
                    let next = tail_node.next.load();
                    assert!(!next.is_null(), "a lost link race leaves a successor behind");
                    let _ = self.tail.compare_exchange(tail.as_ptr(), next);
                }
            }
        }
    }

    /// Removes the front value, or [`None`] if no unconsumed node is queued.
    pub fn pop(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut cur = self.head.load();
        loop {
            let node = cur.as_ref().expect("the queue always holds its sentinel");
            if !node.consumed.swap(true, Ordering::AcqRel) {
                return Some(
                    node.value
                        .as_ref()
                        .expect("an unconsumed node carries a value")
                        .clone(),
                );
            }
            let next = node.next.load();
            if next.is_null() {
                return None;
            }
            // Advancement is best-effort; correctness only needs the claim
            // above.
            let _ = self.head.compare_exchange(cur.as_ptr(), next);
            cur = self.head.load();
        }
    }
}

impl<T> Default for ConQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConQueue<T> {
    fn drop(&mut self) {
        // Walk the head forward node by node instead of letting the chain
        // drop recursively.
        loop {
            let head = self.head.load();
            let node = head.as_ref().expect("the queue always holds its sentinel");
            let next = node.next.load();
            if next.is_null() {
                break;
            }
            self.head.store(next);
        }
    }
}
