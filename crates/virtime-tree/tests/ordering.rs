//! Public-API exercise: bulk inserts and removals in shuffled order keep
//! the traversal sorted and the extrema honest.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::cmp::Ordering;
use virtime_tree::RbTree;

fn by_value(a: &u64, b: &u64) -> Ordering {
    a.cmp(b)
}

#[test]
fn shuffled_inserts_iterate_in_ascending_order() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut values: Vec<u64> = (0..4096).collect();
    values.shuffle(&mut rng);

    let mut tree = RbTree::new(by_value);
    for &v in &values {
        assert!(tree.insert(v));
    }
    assert_eq!(tree.len(), 4096);
    assert_eq!(tree.min(), Some(&0));
    assert_eq!(tree.max(), Some(&4095));

    let walked: Vec<u64> = tree.iter().copied().collect();
    let expected: Vec<u64> = (0..4096).collect();
    assert_eq!(walked, expected);
}

#[test]
fn shuffled_removals_drain_the_tree() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xfeed);
    let mut values: Vec<u64> = (0..2048).collect();
    values.shuffle(&mut rng);

    let mut tree = RbTree::new(by_value);
    for &v in &values {
        tree.insert(v);
    }

    values.shuffle(&mut rng);
    for (removed, &v) in values.iter().enumerate() {
        assert_eq!(tree.remove(&v), Some(v));
        assert_eq!(tree.len(), 2048 - removed - 1);
    }
    assert!(tree.is_empty());
    assert_eq!(tree.iter().next(), None);
}

#[test]
fn interleaved_inserts_and_removes_keep_order() {
    let mut tree = RbTree::new(by_value);
    for v in 0..512u64 {
        tree.insert(v);
    }
    for v in (0..512u64).step_by(2) {
        assert_eq!(tree.remove(&v), Some(v));
    }
    for v in 512..768u64 {
        tree.insert(v);
    }

    let walked: Vec<u64> = tree.iter().copied().collect();
    let mut expected: Vec<u64> = (0..512).filter(|v| v % 2 == 1).collect();
    expected.extend(512..768);
    assert_eq!(walked, expected);
}
