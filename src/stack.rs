//! The [`ConStack`] type, a lock-free LIFO stack.

use crate::raw::handle::Handle;
use crate::raw::Atomic;

struct Node<T> {
    next: Handle<Node<T>>,
    value: T,
}

/// A lock-free stack.
///
/// The top of the stack lives in one [`Atomic`][crate::Atomic] slot; pushes
/// and pops are CAS retry loops against it. Nodes are immutable once
/// published and shared between the stack and any in-flight readers, so
/// [`pop`][ConStack::pop] clones the value out.
///
/// Both operations linearize at their successful CAS: a failed attempt
/// always means another push or pop succeeded, so some operation completes
/// in every round of contention.
///
/// # Examples
///
/// ```rust
/// use conarc::ConStack;
/// use crossbeam_utils::thread;
///
/// let stack = ConStack::new();
/// thread::scope(|s| {
///     s.spawn(|_| stack.push(1));
///     s.spawn(|_| stack.push(2));
/// })
/// .unwrap();
/// let mut popped = vec![stack.pop().unwrap(), stack.pop().unwrap()];
/// popped.sort();
/// assert_eq!(vec![1, 2], popped);
/// assert_eq!(None, stack.pop());
/// ```
pub struct ConStack<T> {
    top: Atomic<Node<T>>,
}

impl<T> ConStack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        ConStack { top: Atomic::null() }
    }

    /// Pushes a value on top.
    pub fn push(&self, value: T) {
        let mut node = Handle::new(Node {
            next: self.top.load(),
            value,
        });
        loop {
            let expected = node.as_ref().expect("a fresh node is never null").next.as_ptr();
            match self.top.compare_exchange(expected, node) {
                Ok(()) => return,
                Err(rejected) => {
                    // Still unpublished, so rewiring in place is fine.
                    node = rejected;
                    let top = self.top.load();
                    node.get_mut().expect("an unpublished node is uniquely owned").next = top;
                }
            }
        }
    }

    /// Pops the most recently pushed value, or [`None`] on an empty stack.
    pub fn pop(&self) -> Option<T>
    where
        T: Clone,
    {
        loop {
            let top = self.top.guard();
            let node = match top.as_ref() {
                Some(node) => node,
                None => return None,
            };
            if self
                .top
                .compare_exchange(top.as_ptr(), node.next.clone())
                .is_ok()
            {
                return Some(node.value.clone());
            }
        }
    }
}

impl<T> Default for ConStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConStack<T> {
    fn drop(&mut self) {
        // Unlink node by node; dropping a long chain through the handles
        // would recurse once per element.
        loop {
            let top = self.top.load();
            let next = match top.as_ref() {
                Some(node) => node.next.clone(),
                None => break,
            };
            self.top.store(next);
        }
    }
}
