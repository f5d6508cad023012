//! The [`TreapMap`] type, a lock-free ordered map over a persistent treap.

use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::{Debug, Formatter, Result as FmtResult};

use rand::Rng;

use crate::raw::handle::Handle;
use crate::raw::Atomic;

struct Node<K, V> {
    left: Handle<Node<K, V>>,
    right: Handle<Node<K, V>>,
    key: K,
    value: V,
    size: usize,
}

impl<K, V> Node<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn size_of(node: &Handle<Node<K, V>>) -> usize {
        node.as_ref().map_or(0, |node| node.size)
    }

    fn branch(key: K, value: V, left: Handle<Node<K, V>>, right: Handle<Node<K, V>>) -> Handle<Self> {
        let size = Self::size_of(&left) + Self::size_of(&right) + 1;
        Handle::new(Node {
            left,
            right,
            key,
            value,
            size,
        })
    }

    /// Splits into the subtree of keys `< key` and the rest.
    ///
    /// Only the touched spine is rebuilt; untouched subtrees are shared with
    /// the input by handle clones.
    fn split_less<Q>(root: &Handle<Self>, key: &Q) -> (Handle<Self>, Handle<Self>)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let node = match root.as_ref() {
            Some(node) => node,
            None => return (Handle::null(), Handle::null()),
        };
        if node.key.borrow().cmp(key) == CmpOrdering::Less {
            let (mid, right) = Self::split_less(&node.right, key);
            let left = Self::branch(node.key.clone(), node.value.clone(), node.left.clone(), mid);
            (left, right)
        } else {
            let (left, mid) = Self::split_less(&node.left, key);
            let right = Self::branch(node.key.clone(), node.value.clone(), mid, node.right.clone());
            (left, right)
        }
    }

    /// Splits into the subtree of keys `<= key` and the rest.
    fn split_less_eq<Q>(root: &Handle<Self>, key: &Q) -> (Handle<Self>, Handle<Self>)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let node = match root.as_ref() {
            Some(node) => node,
            None => return (Handle::null(), Handle::null()),
        };
        if node.key.borrow().cmp(key) != CmpOrdering::Greater {
            let (mid, right) = Self::split_less_eq(&node.right, key);
            let left = Self::branch(node.key.clone(), node.value.clone(), node.left.clone(), mid);
            (left, right)
        } else {
            let (left, mid) = Self::split_less_eq(&node.left, key);
            let right = Self::branch(node.key.clone(), node.value.clone(), mid, node.right.clone());
            (left, right)
        }
    }

    /// Joins two trees where every key of `left` is below every key of
    /// `right`.
    ///
    /// The winning root is drawn with probability proportional to subtree
    /// size, which keeps the expected depth logarithmic without storing
    /// explicit priorities.
    fn merge(left: &Handle<Self>, right: &Handle<Self>) -> Handle<Self> {
        let l = match left.as_ref() {
            Some(node) => node,
            None => return right.clone(),
        };
        let r = match right.as_ref() {
            Some(node) => node,
            None => return left.clone(),
        };
        if rand::thread_rng().gen_range(0..l.size + r.size) < l.size {
            let merged = Self::merge(&l.right, right);
            Self::branch(l.key.clone(), l.value.clone(), l.left.clone(), merged)
        } else {
            let merged = Self::merge(left, &r.left);
            Self::branch(r.key.clone(), r.value.clone(), merged, r.right.clone())
        }
    }
}

/// A lock-free ordered map.
///
/// The map is a persistent treap whose root is published through one
/// [`Atomic`][crate::Atomic] slot. Mutations build a new tree sharing all
/// untouched subtrees with the old one and commit it by a root CAS, retrying
/// from a fresh snapshot on contention. Readers capture the root once and
/// traverse a fully consistent snapshot, completely undisturbed by
/// concurrent writers.
///
/// Keys and values are cloned into the rebuilt spines, so both must be
/// `Clone` (wrap large values in [`Arc`][std::sync::Arc] if cloning is a
/// concern).
///
/// # Examples
///
/// ```rust
/// use conarc::TreapMap;
///
/// let map = TreapMap::new();
/// map.upsert(5, 100);
/// map.upsert(7, 101);
/// assert_eq!(Some(100), map.get(&5));
/// map.remove(&7);
/// assert_eq!(None, map.get(&7));
/// ```
///
/// ```rust
/// use conarc::TreapMap;
/// use crossbeam_utils::thread;
///
/// let map = TreapMap::new();
/// thread::scope(|s| {
///     s.spawn(|_| map.upsert("hello", 1));
///     s.spawn(|_| map.upsert("world", 2));
/// })
/// .unwrap();
/// assert_eq!(Some(1), map.get("hello"));
/// assert_eq!(Some(2), map.get("world"));
/// ```
pub struct TreapMap<K, V> {
    root: Atomic<Node<K, V>>,
}

impl<K, V> TreapMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        TreapMap {
            root: Atomic::null(),
        }
    }
}

impl<K, V> TreapMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    /// Inserts a value, replacing any previous value under the same key.
    pub fn upsert(&self, key: K, value: V) {
        let leaf = Node::branch(key.clone(), value, Handle::null(), Handle::null());
        loop {
            let root = self.root.load();
            let (left, rest) = Node::split_less(&root, &key);
            // Drop the slice holding the old binding, if any.
            let (_replaced, right) = Node::split_less_eq(&rest, &key);
            let new_root = Node::merge(&left, &Node::merge(&leaf, &right));
            if self.root.compare_exchange(root.as_ptr(), new_root).is_ok() {
                return;
            }
        }
    }

    /// Looks up the value under a key in the snapshot current at call time.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let root = self.root.guard();
        let mut current = root.as_ref();
        while let Some(node) = current {
            current = match key.cmp(node.key.borrow()) {
                CmpOrdering::Less => node.left.as_ref(),
                CmpOrdering::Greater => node.right.as_ref(),
                CmpOrdering::Equal => return Some(node.value.clone()),
            };
        }
        None
    }

    /// Removes the binding under a key, if present.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        loop {
            let root = self.root.load();
            let (left, rest) = Node::split_less(&root, key);
            let (_removed, right) = Node::split_less_eq(&rest, key);
            let new_root = Node::merge(&left, &right);
            if self.root.compare_exchange(root.as_ptr(), new_root).is_ok() {
                return;
            }
        }
    }

    /// Number of bindings in the current snapshot.
    ///
    /// O(1): the root caches its subtree size.
    pub fn len(&self) -> usize {
        self.root.guard().as_ref().map_or(0, |node| node.size)
    }

    /// Checks the current snapshot for emptiness.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates a snapshot of the map in ascending key order.
    ///
    /// The snapshot is the one current when `iter` was called; concurrent
    /// writers do not affect it.
    pub fn iter(&self) -> Iter<K, V> {
        Iter::new(self.root.load())
    }
}

impl<K, V> Default for TreapMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for TreapMap<K, V>
where
    K: Ord + Clone + Debug,
    V: Clone + Debug,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V> IntoIterator for &'a TreapMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    type Item = (K, V);
    type IntoIter = Iter<K, V>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// In-order iterator over one consistent snapshot of a [`TreapMap`].
pub struct Iter<K, V> {
    spine: Vec<Handle<Node<K, V>>>,
}

impl<K, V> Iter<K, V> {
    fn new(root: Handle<Node<K, V>>) -> Self {
        let mut iter = Iter { spine: Vec::new() };
        iter.descend_left(root);
        iter
    }

    fn descend_left(&mut self, mut node: Handle<Node<K, V>>) {
        while !node.is_null() {
            let left = match node.as_ref() {
                Some(node) => node.left.clone(),
                None => break,
            };
            self.spine.push(node);
            node = left;
        }
    }
}

impl<K, V> Iterator for Iter<K, V>
where
    K: Clone,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let handle = self.spine.pop()?;
        let node = handle.as_ref().expect("the spine holds only live nodes");
        let item = (node.key.clone(), node.value.clone());
        let right = node.right.clone();
        self.descend_left(right);
        Some(item)
    }
}
