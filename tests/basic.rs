use shoal::HashMap;

#[test]
fn new() {
    let _map = HashMap::<usize, usize>::new();
}

#[test]
fn insert() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    let old = map.insert(42, 0, &guard);
    assert!(old.is_none());
}

#[test]
fn get_empty() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert!(map.get(&42, &guard).is_none());
}

#[test]
fn remove_empty() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert!(map.remove(&42, &guard).is_none());
}

#[test]
fn insert_and_get() {
    let map = HashMap::<usize, usize>::new();
    map.insert(42, 0, &map.guard());

    let guard = map.guard();
    assert_eq!(map.get(&42, &guard), Some(&0));
    assert_eq!(map.get_key_value(&42, &guard), Some((&42, &0)));
    assert!(map.contains_key(&42, &guard));
    assert!(!map.contains_key(&43, &guard));
}

#[test]
fn insert_returns_previous() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.insert(42, 0, &guard), None);
    assert_eq!(map.insert(42, 1, &guard), Some(&0));
    assert_eq!(map.get(&42, &guard), Some(&1));
}

#[test]
fn insert_and_remove() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 0, &guard);
    assert_eq!(map.remove(&42, &guard), Some(&0));
    assert!(map.get(&42, &guard).is_none());
    // removing an absent key changes nothing
    assert_eq!(map.remove(&42, &guard), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn remove_entry_returns_both() {
    let map = HashMap::<usize, String>::new();
    let guard = map.guard();
    map.insert(1, String::from("one"), &guard);
    let (k, v) = map.remove_entry(&1, &guard).unwrap();
    assert_eq!((k, v.as_str()), (&1, "one"));
}

#[test]
fn put_if_absent_keeps_the_first_value() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.put_if_absent(1, 10, &guard), None);
    assert_eq!(map.put_if_absent(1, 20, &guard), Some(&10));
    assert_eq!(map.get(&1, &guard), Some(&10));
}

#[test]
fn try_insert_reports_the_conflict() {
    let map = HashMap::<usize, &'static str>::new();
    let guard = map.guard();
    assert_eq!(map.try_insert(42, "a", &guard), Ok(&"a"));
    let err = map.try_insert(42, "b", &guard).unwrap_err();
    assert_eq!(err.current, &"a");
    assert_eq!(err.not_inserted, "b");
    assert_eq!(map.get(&42, &guard), Some(&"a"));
}

#[test]
fn replace_requires_presence() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    // replace never inserts
    assert_eq!(map.replace(&1, 10, &guard), None);
    assert!(map.get(&1, &guard).is_none());

    map.insert(1, 1, &guard);
    assert_eq!(map.replace(&1, 10, &guard), Some(&1));
    assert_eq!(map.get(&1, &guard), Some(&10));
}

#[test]
fn conditional_replace_and_remove() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(1, 1, &guard);

    assert_eq!(map.replace_if(&1, &2, 10, &guard), None);
    assert_eq!(map.get(&1, &guard), Some(&1));
    assert_eq!(map.replace_if(&1, &1, 10, &guard), Some(&1));
    assert_eq!(map.get(&1, &guard), Some(&10));

    assert_eq!(map.remove_if(&1, &1, &guard), None);
    assert!(map.contains_key(&1, &guard));
    assert_eq!(map.remove_if(&1, &10, &guard), Some(&10));
    assert!(!map.contains_key(&1, &guard));
}

#[test]
fn len_tracks_inserts_and_removes() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert!(map.is_empty());
    for i in 0..10 {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.len(), 10);
    for i in 0..5 {
        map.remove(&i, &guard);
    }
    assert_eq!(map.len(), 5);
    assert!(!map.is_empty());
}

#[test]
fn hundred_keys_with_capacity_hint() {
    let map = HashMap::<usize, usize>::with_capacity(16);
    let guard = map.guard();
    for i in 0..100 {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.len(), 100);
    assert_eq!(map.get(&50, &guard), Some(&50));
    assert_eq!(map.remove(&50, &guard), Some(&50));
    assert_eq!(map.get(&50, &guard), None);
    assert_eq!(map.len(), 99);
}

#[test]
fn clear_empties_the_map() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..64 {
        map.insert(i, i, &guard);
    }
    map.clear(&guard);
    assert!(map.is_empty());
    assert!(map.get(&0, &guard).is_none());
    // the map stays usable
    map.insert(1, 1, &guard);
    assert_eq!(map.get(&1, &guard), Some(&1));
}

#[test]
fn retain_keeps_matching_entries() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..8 {
        map.insert(i, i * 10, &guard);
    }
    map.retain(|&k, _| k % 2 == 0, &guard);
    assert_eq!(map.len(), 4);
    for i in 0..8 {
        assert_eq!(map.contains_key(&i, &guard), i % 2 == 0);
    }
}

#[test]
fn retain_force_ignores_value_changes() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..8 {
        map.insert(i, i, &guard);
    }
    map.retain_force(|_, _| false, &guard);
    assert!(map.is_empty());
}

#[test]
fn iter_visits_every_entry() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..64 {
        map.insert(i, i + 1, &guard);
    }

    let mut seen: Vec<_> = map.iter(&guard).map(|(&k, &v)| (k, v)).collect();
    seen.sort_unstable();
    let expected: Vec<_> = (0..64).map(|i| (i, i + 1)).collect();
    assert_eq!(seen, expected);

    let mut keys: Vec<_> = map.keys(&guard).copied().collect();
    keys.sort_unstable();
    assert_eq!(keys, (0..64).collect::<Vec<_>>());

    let mut values: Vec<_> = map.values(&guard).copied().collect();
    values.sort_unstable();
    assert_eq!(values, (1..65).collect::<Vec<_>>());
}

#[test]
fn iteration_is_restartable() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..16 {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.iter(&guard).count(), 16);
    assert_eq!(map.iter(&guard).count(), 16);
}

#[test]
fn pinned_reference_mirrors_the_api() {
    let map = HashMap::<usize, usize>::new();
    let pinned = map.pin();
    assert_eq!(pinned.insert(1, 10), None);
    assert_eq!(pinned.insert(1, 11), Some(&10));
    assert_eq!(pinned.get(&1), Some(&11));
    assert_eq!(pinned.len(), 1);
    assert_eq!(pinned.remove(&1), Some(&11));
    assert!(pinned.is_empty());
}

#[test]
fn from_iterator_and_extend() {
    let map: HashMap<usize, usize> = (0..10).map(|i| (i, i)).collect();
    assert_eq!(map.len(), 10);

    let mut by_ref = &map;
    by_ref.extend((10..20).map(|i| (i, i)));
    assert_eq!(map.len(), 20);

    let guard = map.guard();
    for i in 0..20 {
        assert_eq!(map.get(&i, &guard), Some(&i));
    }
}

#[test]
fn maps_with_equal_contents_are_equal() {
    let a: HashMap<usize, usize> = (0..10).map(|i| (i, i)).collect();
    let b: HashMap<usize, usize> = (0..10).rev().map(|i| (i, i)).collect();
    assert_eq!(a, b);

    b.insert(10, 10, &b.guard());
    assert_ne!(a, b);
}

#[test]
fn clone_is_deep() {
    let map: HashMap<usize, usize> = (0..10).map(|i| (i, i)).collect();
    let copy = map.clone();
    map.insert(99, 99, &map.guard());
    assert_eq!(copy.len(), 10);
    assert!(copy.get(&99, &copy.guard()).is_none());
}

#[test]
fn debug_formats_entries() {
    let map = HashMap::<usize, usize>::new();
    map.insert(1, 2, &map.guard());
    assert_eq!(format!("{:?}", map), "{1: 2}");
}

#[test]
fn keys_borrowed_forms_work() {
    let map = HashMap::<String, usize>::new();
    let guard = map.guard();
    map.insert(String::from("hello"), 1, &guard);
    assert_eq!(map.get("hello", &guard), Some(&1));
    assert_eq!(map.remove("hello", &guard), Some(&1));
}

#[test]
fn compute_if_present_updates_in_place() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    // absent key: the closure must not run
    assert_eq!(
        map.compute_if_present(&1, |_, _| unreachable!("key is absent"), &guard),
        None
    );
    map.insert(1, 1, &guard);
    assert_eq!(map.compute_if_present(&1, |_, v| Some(v + 1), &guard), Some(&2));
    // returning None removes the entry
    assert_eq!(map.compute_if_present(&1, |_, _| None, &guard), None);
    assert!(!map.contains_key(&1, &guard));
    assert_eq!(map.len(), 0);
}
