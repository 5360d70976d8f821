//! Exercises the tree-bin paths by forcing every key into one bucket.

use shoal::HashMap;
use std::hash::{BuildHasher, Hasher};

#[derive(Default)]
struct ZeroHasher;

impl Hasher for ZeroHasher {
    fn finish(&self) -> u64 {
        0
    }
    fn write(&mut self, _: &[u8]) {}
}

struct ZeroHashBuilder;

impl BuildHasher for ZeroHashBuilder {
    type Hasher = ZeroHasher;
    fn build_hasher(&self) -> ZeroHasher {
        ZeroHasher
    }
}

#[test]
fn one_bucket_all_positions() {
    let map = HashMap::<&'static str, usize, _>::with_hasher(ZeroHashBuilder);
    let guard = map.guard();

    // operations must work on the head, middle, and tail of a chain
    assert_eq!(map.insert("head", 0, &guard), None);
    assert_eq!(map.insert("middle", 10, &guard), None);
    assert_eq!(map.insert("tail", 100, &guard), None);
    assert_eq!(map.get("head", &guard), Some(&0));
    assert_eq!(map.get("middle", &guard), Some(&10));
    assert_eq!(map.get("tail", &guard), Some(&100));

    assert_eq!(map.insert("head", 1, &guard), Some(&0));
    assert_eq!(map.insert("middle", 11, &guard), Some(&10));
    assert_eq!(map.insert("tail", 101, &guard), Some(&100));

    assert_eq!(map.remove("middle", &guard), Some(&11));
    assert_eq!(map.remove("tail", &guard), Some(&101));
    assert_eq!(map.remove("head", &guard), Some(&1));
    assert!(map.is_empty());
}

#[test]
fn two_hundred_colliding_keys() {
    let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
    let mut reference = std::collections::HashMap::new();

    {
        let guard = map.guard();
        for i in 0..200 {
            map.insert(i, i * 3, &guard);
            reference.insert(i, i * 3);
        }
    }

    assert_eq!(map.len(), reference.len());
    let guard = map.guard();
    for (k, v) in &reference {
        assert_eq!(map.get(k, &guard), Some(v));
    }
    // membership must agree beyond the inserted range too
    for k in 200..300 {
        assert_eq!(map.contains_key(&k, &guard), reference.contains_key(&k));
    }
}

#[test]
fn collisions_survive_updates_and_removals() {
    let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
    let guard = map.guard();
    for i in 0..64 {
        map.insert(i, i, &guard);
    }
    // overwrite half of them through the tree path
    for i in 0..32 {
        assert_eq!(map.insert(i, i + 1000, &guard), Some(&i));
    }
    // remove every other key
    for i in (0..64).step_by(2) {
        assert!(map.remove(&i, &guard).is_some());
    }
    assert_eq!(map.len(), 32);
    for i in 0..64 {
        let expected = if i % 2 == 1 {
            Some(if i < 32 { i + 1000 } else { i })
        } else {
            None
        };
        assert_eq!(map.get(&i, &guard).copied(), expected);
    }
}

#[test]
fn treeify_untreeify_round_trip_preserves_keys() {
    let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
    let guard = map.guard();
    for i in 0..20 {
        map.insert(i, i, &guard);
    }
    let mut before: Vec<_> = map.keys(&guard).copied().collect();
    before.sort_unstable();

    // shrink the bucket below the untreeify threshold and back up
    for i in 0..16 {
        assert_eq!(map.remove(&i, &guard), Some(&i));
    }
    for i in 0..16 {
        assert_eq!(map.insert(i, i, &guard), None);
    }

    let mut after: Vec<_> = map.keys(&guard).copied().collect();
    after.sort_unstable();
    assert_eq!(before, after);
}

#[test]
fn colliding_keys_iterate_exactly_once() {
    let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
    let guard = map.guard();
    for i in 0..50 {
        map.insert(i, i, &guard);
    }
    let mut seen: Vec<_> = map.keys(&guard).copied().collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}
