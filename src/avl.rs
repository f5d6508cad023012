//! The [`AvlMap`] type, a lock-free ordered map over a persistent AVL tree.

use std::borrow::Borrow;
use std::cmp;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::{Debug, Formatter, Result as FmtResult};

use crate::raw::handle::Handle;
use crate::raw::Atomic;

struct Node<K, V> {
    left: Handle<Node<K, V>>,
    right: Handle<Node<K, V>>,
    key: K,
    value: V,
    height: i32,
}

impl<K, V> Node<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn height_of(node: &Handle<Node<K, V>>) -> i32 {
        node.as_ref().map_or(0, |node| node.height)
    }

    fn branch(key: K, value: V, left: Handle<Node<K, V>>, right: Handle<Node<K, V>>) -> Handle<Self> {
        let height = cmp::max(Self::height_of(&left), Self::height_of(&right)) + 1;
        Handle::new(Node {
            left,
            right,
            key,
            value,
            height,
        })
    }

    /// Restores the height invariant of a freshly built node whose children
    /// differ by at most two levels.
    fn rebalance(root: &Handle<Self>) -> Handle<Self> {
        let node = root.as_ref().expect("rebalanced an empty subtree");
        let diff = Self::height_of(&node.left) - Self::height_of(&node.right);
        if diff.abs() < 2 {
            return root.clone();
        }
        assert!(diff.abs() < 3, "subtree drifted more than one level out of balance");
        if diff == 2 {
            let left = node.left.as_ref().expect("a left-heavy node has a left child");
            if Self::height_of(&left.right) <= Self::height_of(&left.left) {
                Self::rotate_right(root)
            } else {
                Self::double_rotate_right(root)
            }
        } else {
            let right = node.right.as_ref().expect("a right-heavy node has a right child");
            if Self::height_of(&right.left) <= Self::height_of(&right.right) {
                Self::rotate_left(root)
            } else {
                Self::double_rotate_left(root)
            }
        }
    }

    fn rotate_left(root: &Handle<Self>) -> Handle<Self> {
        let node = root.as_ref().expect("rotated an empty subtree");
        let right = node.right.as_ref().expect("left rotation needs a right child");
        let lowered = Self::branch(
            node.key.clone(),
            node.value.clone(),
            node.left.clone(),
            right.left.clone(),
        );
        Self::branch(
            right.key.clone(),
            right.value.clone(),
            lowered,
            right.right.clone(),
        )
    }

    fn rotate_right(root: &Handle<Self>) -> Handle<Self> {
        let node = root.as_ref().expect("rotated an empty subtree");
        let left = node.left.as_ref().expect("right rotation needs a left child");
        let lowered = Self::branch(
            node.key.clone(),
            node.value.clone(),
            left.right.clone(),
            node.right.clone(),
        );
        Self::branch(
            left.key.clone(),
            left.value.clone(),
            left.left.clone(),
            lowered,
        )
    }

    fn double_rotate_left(root: &Handle<Self>) -> Handle<Self> {
        let node = root.as_ref().expect("rotated an empty subtree");
        let right = node.right.as_ref().expect("left rotation needs a right child");
        let pivot = right.left.as_ref().expect("double rotation needs an inner grandchild");
        let low_left = Self::branch(
            node.key.clone(),
            node.value.clone(),
            node.left.clone(),
            pivot.left.clone(),
        );
        let low_right = Self::branch(
            right.key.clone(),
            right.value.clone(),
            pivot.right.clone(),
            right.right.clone(),
        );
        Self::branch(pivot.key.clone(), pivot.value.clone(), low_left, low_right)
    }

    fn double_rotate_right(root: &Handle<Self>) -> Handle<Self> {
        let node = root.as_ref().expect("rotated an empty subtree");
        let left = node.left.as_ref().expect("right rotation needs a left child");
        let pivot = left.right.as_ref().expect("double rotation needs an inner grandchild");
        let low_right = Self::branch(
            node.key.clone(),
            node.value.clone(),
            pivot.right.clone(),
            node.right.clone(),
        );
        let low_left = Self::branch(
            left.key.clone(),
            left.value.clone(),
            left.left.clone(),
            pivot.left.clone(),
        );
        Self::branch(pivot.key.clone(), pivot.value.clone(), low_left, low_right)
    }

    /// Rebuilds the spine down to `key` with the new binding in place.
    fn upsert_in(root: &Handle<Self>, key: &K, value: &V) -> Handle<Self> {
        let node = match root.as_ref() {
            Some(node) => node,
            None => {
                return Self::branch(key.clone(), value.clone(), Handle::null(), Handle::null())
            }
        };
        match key.cmp(&node.key) {
            CmpOrdering::Equal => Handle::new(Node {
                left: node.left.clone(),
                right: node.right.clone(),
                key: key.clone(),
                value: value.clone(),
                height: node.height,
            }),
            CmpOrdering::Greater => {
                let new_right = Self::upsert_in(&node.right, key, value);
                Self::rebalance(&Self::branch(
                    node.key.clone(),
                    node.value.clone(),
                    node.left.clone(),
                    new_right,
                ))
            }
            CmpOrdering::Less => {
                let new_left = Self::upsert_in(&node.left, key, value);
                Self::rebalance(&Self::branch(
                    node.key.clone(),
                    node.value.clone(),
                    new_left,
                    node.right.clone(),
                ))
            }
        }
    }

    /// Rebuilds the spine with `key` removed. Returns a clone of `root`
    /// itself when the key is absent, so callers can detect the no-op by
    /// pointer identity.
    fn remove_in<Q>(root: &Handle<Self>, key: &Q) -> Handle<Self>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let node = match root.as_ref() {
            Some(node) => node,
            None => return Handle::null(),
        };
        match node.key.borrow().cmp(key) {
            CmpOrdering::Less => {
                let new_right = Self::remove_in(&node.right, key);
                if Handle::ptr_eq(&new_right, &node.right) {
                    return root.clone();
                }
                Self::rebalance(&Self::branch(
                    node.key.clone(),
                    node.value.clone(),
                    node.left.clone(),
                    new_right,
                ))
            }
            CmpOrdering::Greater => {
                let new_left = Self::remove_in(&node.left, key);
                if Handle::ptr_eq(&new_left, &node.left) {
                    return root.clone();
                }
                Self::rebalance(&Self::branch(
                    node.key.clone(),
                    node.value.clone(),
                    new_left,
                    node.right.clone(),
                ))
            }
            CmpOrdering::Equal => Self::remove_here(node),
        }
    }

    /// Unlinks `node` (the tree's copy of the key being removed), pulling up
    /// the in-order neighbour from the taller side when both children exist.
    fn remove_here(node: &Self) -> Handle<Self> {
        if node.left.is_null() && node.right.is_null() {
            Handle::null()
        } else if node.right.is_null()
            || (!node.left.is_null()
                && Self::height_of(&node.left) > Self::height_of(&node.right))
        {
            // Replace with the in-order predecessor from the taller (left)
            // side, then remove it from there.
            let mut target = node.left.as_ref().expect("the taller side is non-empty");
            while let Some(next) = target.right.as_ref() {
                target = next;
            }
            let new_left = Self::remove_in(&node.left, &target.key);
            Self::rebalance(&Self::branch(
                target.key.clone(),
                target.value.clone(),
                new_left,
                node.right.clone(),
            ))
        } else {
            let mut target = node.right.as_ref().expect("the taller side is non-empty");
            while let Some(next) = target.left.as_ref() {
                target = next;
            }
            let new_right = Self::remove_in(&node.right, &target.key);
            Self::rebalance(&Self::branch(
                target.key.clone(),
                target.value.clone(),
                node.left.clone(),
                new_right,
            ))
        }
    }
}

/// A lock-free ordered map balanced as an AVL tree.
///
/// Same contract as [`TreapMap`][crate::TreapMap] with a deterministic
/// shape: every published snapshot keeps the heights of any node's children
/// within one of each other, so lookups are worst-case logarithmic rather
/// than expected. Mutations pay for that with rebalancing rotations along
/// the rebuilt spine.
///
/// # Examples
///
/// ```rust
/// use conarc::AvlMap;
///
/// let map = AvlMap::new();
/// map.upsert(5, 100);
/// map.upsert(7, 101);
/// assert_eq!(Some(100), map.get(&5));
/// map.remove(&7);
/// assert_eq!(None, map.get(&7));
/// ```
pub struct AvlMap<K, V> {
    root: Atomic<Node<K, V>>,
}

impl<K, V> AvlMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        AvlMap {
            root: Atomic::null(),
        }
    }
}

impl<K, V> AvlMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    /// Inserts a value, replacing any previous value under the same key.
    pub fn upsert(&self, key: K, value: V) {
        loop {
            let root = self.root.load();
            let new_root = Node::upsert_in(&root, &key, &value);
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
            debug_assert!(
                (Node::height_of(&node.left) - Node::height_of(&node.right)).abs() < 2,
                "unbalanced node reached by a lookup"
            );
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
            let new_root = Node::remove_in(&root, key);
            if Handle::ptr_eq(&new_root, &root) {
                // Nothing removed, nothing to publish.
                return;
            }
            if self.root.compare_exchange(root.as_ptr(), new_root).is_ok() {
                return;
            }
        }
    }

    /// Checks the current snapshot for emptiness.
    pub fn is_empty(&self) -> bool {
        self.root.guard().is_null()
    }

    /// Iterates a snapshot of the map in ascending key order.
    pub fn iter(&self) -> Iter<K, V> {
        Iter::new(self.root.load())
    }
}

impl<K, V> Default for AvlMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for AvlMap<K, V>
where
    K: Ord + Clone + Debug,
    V: Clone + Debug,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, K, V> IntoIterator for &'a AvlMap<K, V>
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

/// In-order iterator over one consistent snapshot of an [`AvlMap`].
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

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crossbeam_utils::thread;
    use rand::prelude::*;

    use super::*;
    use crate::raw::handle::tests::Counted;

    const TEST_THREADS: usize = 4;
    const TEST_BATCH: usize = 10_000;
    const LOCKSTEP_OPS: usize = 100_000;
    const KEY_SPACE: u32 = 100;

    /// Walks a snapshot checking heights, balance and key order.
    fn check_invariants<K: Ord + Clone, V: Clone>(node: &Handle<Node<K, V>>) -> i32 {
        let node = match node.as_ref() {
            Some(node) => node,
            None => return 0,
        };
        let left = check_invariants(&node.left);
        let right = check_invariants(&node.right);
        assert!((left - right).abs() <= 1, "children heights differ by more than one");
        assert_eq!(node.height, left.max(right) + 1, "stale cached height");
        if let Some(child) = node.left.as_ref() {
            assert!(child.key < node.key);
        }
        if let Some(child) = node.right.as_ref() {
            assert!(node.key < child.key);
        }
        node.height
    }

    fn assert_balanced<K: Ord + Clone, V: Clone>(map: &AvlMap<K, V>) {
        check_invariants(&map.root.load());
    }

    #[test]
    fn create_destroy() {
        let map: AvlMap<String, usize> = AvlMap::new();
        drop(map);
    }

    #[test]
    fn lookup_empty() {
        let map: AvlMap<u32, u32> = AvlMap::new();
        assert_eq!(None, map.get(&1));
        assert!(map.is_empty());
    }

    #[test]
    fn upsert_get_remove() {
        let map = AvlMap::new();
        map.upsert(5, 100);
        assert_eq!(Some(100), map.get(&5));
        map.upsert(7, 101);
        assert_eq!(Some(100), map.get(&5));
        map.upsert(6, 99);
        assert_eq!(Some(100), map.get(&5));
        assert_eq!(Some(99), map.get(&6));
        assert_eq!(Some(101), map.get(&7));
        map.remove(&7);
        assert_eq!(Some(100), map.get(&5));
        assert_eq!(None, map.get(&7));
        assert_balanced(&map);
    }

    #[test]
    fn upsert_overwrites() {
        let map = AvlMap::new();
        map.upsert(1, "one");
        map.upsert(1, "uno");
        assert_eq!(Some("uno"), map.get(&1));
    }

    #[test]
    fn remove_missing_is_noop() {
        let map = AvlMap::new();
        map.remove(&1);
        map.upsert(1, 1);
        map.remove(&2);
        assert_eq!(Some(1), map.get(&1));
        assert_balanced(&map);
    }

    #[test]
    fn borrowed_key_lookup() {
        let map = AvlMap::new();
        map.upsert("hello".to_string(), 1);
        assert_eq!(Some(1), map.get("hello"));
        map.remove("hello");
        assert_eq!(None, map.get("hello"));
    }

    /// Rotations and predecessor pull-ups clone and drop value handles;
    /// every binding must still be freed exactly once.
    #[test]
    fn drop_frees_all_nodes() {
        let drops = Arc::new(AtomicUsize::new(0));
        let map = AvlMap::new();
        for i in 0..TEST_BATCH {
            map.upsert(i, Arc::new(Counted(Arc::clone(&drops))));
        }
        for i in (0..TEST_BATCH).step_by(2) {
            map.remove(&i);
        }
        // A removed binding loses its last clone once the old spines are
        // retired.
        assert_eq!(TEST_BATCH / 2, drops.load(Ordering::SeqCst));
        drop(map);
        assert_eq!(TEST_BATCH, drops.load(Ordering::SeqCst));
    }

    #[test]
    fn stays_balanced_under_ordered_inserts() {
        let map = AvlMap::new();
        for i in 0..TEST_BATCH {
            map.upsert(i, i);
        }
        assert_balanced(&map);
        // An in-order insert degenerates an unbalanced tree to a list; the
        // cached height bounds the depth instead.
        let height = map.root.load().as_ref().map_or(0, |node| node.height);
        assert!(height <= 2 * (TEST_BATCH as f64).log2() as i32);
        for i in 0..TEST_BATCH {
            assert_eq!(Some(i), map.get(&i));
        }
    }

    #[test]
    fn removal_rebalances() {
        let map = AvlMap::new();
        for i in 0..TEST_BATCH {
            map.upsert(i, i);
        }
        for i in (0..TEST_BATCH).step_by(2) {
            map.remove(&i);
        }
        assert_balanced(&map);
        for i in 0..TEST_BATCH {
            let expected = if i % 2 == 0 { None } else { Some(i) };
            assert_eq!(expected, map.get(&i));
        }
    }

    #[test]
    fn iter_is_sorted() {
        let map = AvlMap::new();
        let mut keys = (0..TEST_BATCH).collect::<Vec<_>>();
        keys.shuffle(&mut StdRng::seed_from_u64(42));
        for key in keys {
            map.upsert(key, key * 2);
        }
        let collected = map.iter().collect::<Vec<_>>();
        assert_eq!(TEST_BATCH, collected.len());
        for (i, (key, value)) in collected.into_iter().enumerate() {
            assert_eq!(i, key);
            assert_eq!(i * 2, value);
        }
    }

    #[test]
    fn lockstep_with_reference_map() {
        let map = AvlMap::new();
        let mut reference = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..LOCKSTEP_OPS {
            let key = rng.gen_range(0..KEY_SPACE);
            match rng.gen_range(0..4) {
                0 => {
                    let value = rng.gen::<u32>();
                    map.upsert(key, value);
                    reference.insert(key, value);
                }
                1 => {
                    map.remove(&key);
                    reference.remove(&key);
                }
                _ => {}
            }
            assert_eq!(reference.get(&key).cloned(), map.get(&key));
        }
        assert_balanced(&map);
    }

    #[test]
    fn par_upsert_many() {
        let map: AvlMap<usize, usize> = AvlMap::new();
        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let map = &map;
                s.spawn(move |_| {
                    for i in 0..TEST_BATCH / 10 {
                        let num = t * TEST_BATCH + i;
                        map.upsert(num, num);
                    }
                });
            }
        })
        .unwrap();

        for t in 0..TEST_THREADS {
            for i in 0..TEST_BATCH / 10 {
                let num = t * TEST_BATCH + i;
                assert_eq!(Some(num), map.get(&num));
            }
        }
        assert_balanced(&map);
    }

    #[test]
    fn par_mixed_ops_keep_invariants() {
        let map: AvlMap<u32, u32> = AvlMap::new();
        thread::scope(|s| {
            for t in 0..TEST_THREADS {
                let map = &map;
                s.spawn(move |_| {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    for _ in 0..TEST_BATCH / 10 {
                        let key = rng.gen_range(0..KEY_SPACE);
                        match rng.gen_range(0..4) {
                            0 => map.upsert(key, key),
                            1 => map.remove(&key),
                            _ => {
                                map.get(&key);
                            }
                        }
                    }
                });
            }
        })
        .unwrap();
        assert_balanced(&map);
    }
}
