//! In these tests, we make sure both map flavours behave like a `BTreeMap`
//! in single threaded context, and sometimes in multithreaded too.
//!
//! To do that we simply generate a series of upserts, lookups and removals
//! and try them on the reference map and ours. They need to return the same
//! things.
//!
//! Furthermore, each test is run in several instances, with keys in
//! differently sized universes. The small ones exercise key reuse (and the
//! equal-key replacement paths), the large ones grow deeper trees.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;

use conarc::{AvlMap, TreapMap};
use proptest::collection::vec;
use proptest::prelude::*;
use rayon::prelude::*;

/// The surface both map flavours share.
trait OrderedMap<K, V> {
    fn upsert(&self, key: K, value: V);
    fn get(&self, key: &K) -> Option<V>;
    fn remove(&self, key: &K);
}

impl<K: Ord + Clone, V: Clone> OrderedMap<K, V> for TreapMap<K, V> {
    fn upsert(&self, key: K, value: V) {
        TreapMap::upsert(self, key, value);
    }
    fn get(&self, key: &K) -> Option<V> {
        TreapMap::get(self, key)
    }
    fn remove(&self, key: &K) {
        TreapMap::remove(self, key);
    }
}

impl<K: Ord + Clone, V: Clone> OrderedMap<K, V> for AvlMap<K, V> {
    fn upsert(&self, key: K, value: V) {
        AvlMap::upsert(self, key, value);
    }
    fn get(&self, key: &K) -> Option<V> {
        AvlMap::get(self, key)
    }
    fn remove(&self, key: &K) {
        AvlMap::remove(self, key);
    }
}

#[derive(Debug, Clone)]
enum Instruction<K, V> {
    Lookup(K),
    Remove(K),
    Upsert(K, V),
}

impl<K, V> Instruction<K, V>
where
    K: Arbitrary + Clone + Debug + Ord,
    V: Arbitrary + Clone + Debug + PartialEq,
{
    fn strategy() -> impl Strategy<Value = Self> {
        use Instruction::*;

        prop_oneof![
            any::<K>().prop_map(Lookup),
            any::<K>().prop_map(Remove),
            any::<(K, V)>().prop_map(|(k, v)| Upsert(k, v)),
        ]
    }

    fn run<M: OrderedMap<K, V>>(map: M, instructions: Vec<Self>) -> Result<(), TestCaseError> {
        use Instruction::*;

        let mut reference = BTreeMap::new();
        for ins in instructions {
            match ins {
                Lookup(key) => {
                    let expected = reference.get(&key).cloned();
                    let found = map.get(&key);
                    prop_assert_eq!(expected, found);
                }
                Remove(key) => {
                    let expected = reference.remove(&key);
                    let found = map.get(&key);
                    map.remove(&key);
                    prop_assert_eq!(expected, found);
                    prop_assert_eq!(None, map.get(&key));
                }
                Upsert(key, value) => {
                    reference.insert(key.clone(), value.clone());
                    map.upsert(key.clone(), value.clone());
                    prop_assert_eq!(Some(value), map.get(&key));
                }
            }
        }

        Ok(())
    }
}

fn upsert_parallel_test<M>(map: M, values: Vec<u16>) -> Result<(), TestCaseError>
where
    M: OrderedMap<u16, ()> + Sync,
{
    let unique: HashSet<_> = values.iter().cloned().collect();
    values.into_par_iter().for_each(|v| {
        map.upsert(v, ());
    });
    for v in unique {
        prop_assert!(map.get(&v).is_some());
    }

    Ok(())
}

proptest! {
    #[test]
    fn treap_small_keys(instructions in vec(Instruction::<u8, usize>::strategy(), 1..2_000)) {
        Instruction::run(TreapMap::new(), instructions)?;
    }

    #[test]
    fn treap_mid_keys(instructions in vec(Instruction::<u16, usize>::strategy(), 1..2_000)) {
        Instruction::run(TreapMap::new(), instructions)?;
    }

    #[test]
    fn treap_large_keys(instructions in vec(Instruction::<u64, usize>::strategy(), 1..2_000)) {
        Instruction::run(TreapMap::new(), instructions)?;
    }

    #[test]
    fn treap_string_keys(instructions in vec(Instruction::<String, usize>::strategy(), 1..100)) {
        Instruction::run(TreapMap::new(), instructions)?;
    }

    #[test]
    fn avl_small_keys(instructions in vec(Instruction::<u8, usize>::strategy(), 1..2_000)) {
        Instruction::run(AvlMap::new(), instructions)?;
    }

    #[test]
    fn avl_mid_keys(instructions in vec(Instruction::<u16, usize>::strategy(), 1..2_000)) {
        Instruction::run(AvlMap::new(), instructions)?;
    }

    #[test]
    fn avl_large_keys(instructions in vec(Instruction::<u64, usize>::strategy(), 1..2_000)) {
        Instruction::run(AvlMap::new(), instructions)?;
    }

    #[test]
    fn avl_string_keys(instructions in vec(Instruction::<String, usize>::strategy(), 1..100)) {
        Instruction::run(AvlMap::new(), instructions)?;
    }

    #[test]
    fn treap_upsert_all_parallel(values in vec(any::<u16>(), 1..2_000)) {
        upsert_parallel_test(TreapMap::new(), values)?;
    }

    #[test]
    fn avl_upsert_all_parallel(values in vec(any::<u16>(), 1..2_000)) {
        upsert_parallel_test(AvlMap::new(), values)?;
    }
}
