//! Multi-threaded workloads: concurrent inserts, reads during resizes, and
//! racing conditional inserts.

use rand::Rng;
use shoal::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn thread_count() -> usize {
    num_cpus::get().clamp(2, 8)
}

#[test]
fn concurrent_inserts_are_all_visible() {
    const PER_THREAD: usize = 128;
    const ROUNDS: usize = 32;

    for _ in 0..ROUNDS {
        let map = Arc::new(HashMap::<u64, u64>::new());
        let mut handles = Vec::new();
        for _ in 0..thread_count() {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..PER_THREAD {
                    let key = rng.gen::<u64>();
                    map.insert(key, key, &map.guard());
                    assert!(map.contains_key(&key, &map.guard()));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("no thread panics");
        }
    }
}

#[test]
fn growth_under_concurrent_writers() {
    // far more keys than the starting capacity, so several resizes run
    // while writers keep inserting
    const KEYS: usize = 1 << 15;

    let map = Arc::new(HashMap::<usize, usize>::with_capacity(16));
    let threads = thread_count();
    let per_thread = KEYS / threads;

    let mut handles = Vec::new();
    for t in 0..threads {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let guard = map.guard();
            for i in (t * per_thread)..((t + 1) * per_thread) {
                map.insert(i, i, &guard);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no thread panics");
    }

    assert_eq!(map.len(), threads * per_thread);
    let guard = map.guard();
    for i in 0..threads * per_thread {
        assert_eq!(map.get(&i, &guard), Some(&i), "key {} lost in a resize", i);
    }
}

#[test]
fn reads_are_consistent_during_growth() {
    const KEYS: usize = 1 << 14;

    let map = Arc::new(HashMap::<usize, usize>::with_capacity(16));
    {
        let guard = map.guard();
        for i in 0..KEYS / 2 {
            map.insert(i, i, &guard);
        }
    }

    let mut handles = Vec::new();
    {
        // a writer that forces further resizes
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let guard = map.guard();
            for i in KEYS / 2..KEYS {
                map.insert(i, i, &guard);
            }
        }));
    }
    for _ in 0..thread_count() - 1 {
        // readers over the stable half
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for _ in 0..10_000 {
                let key = rng.gen_range(0..KEYS / 2);
                let guard = map.guard();
                assert_eq!(map.get(&key, &guard), Some(&key));
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no thread panics");
    }
}

#[test]
fn put_if_absent_races_have_one_winner() {
    const ROUNDS: usize = 256;

    for key in 0..ROUNDS {
        let map = Arc::new(HashMap::<usize, usize>::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for value in [1usize, 2] {
            let map = Arc::clone(&map);
            let winners = Arc::clone(&winners);
            handles.push(std::thread::spawn(move || {
                let guard = map.guard();
                match map.put_if_absent(key, value, &guard) {
                    None => {
                        // we won; the map must now hold our value
                        winners.fetch_add(1, Ordering::Relaxed);
                        assert_eq!(map.get(&key, &guard), Some(&value));
                    }
                    Some(existing) => {
                        // we lost; the observed value is the winner's
                        assert_ne!(existing, &value);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("no thread panics");
        }

        assert_eq!(winners.load(Ordering::Relaxed), 1);
        assert_eq!(map.len(), 1);
    }
}

#[test]
fn concurrent_removals_remove_each_key_once() {
    const KEYS: usize = 1 << 12;

    let map = Arc::new(HashMap::<usize, usize>::new());
    {
        let guard = map.guard();
        for i in 0..KEYS {
            map.insert(i, i, &guard);
        }
    }

    let removed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..thread_count() {
        let map = Arc::clone(&map);
        let removed = Arc::clone(&removed);
        handles.push(std::thread::spawn(move || {
            let guard = map.guard();
            for i in 0..KEYS {
                if map.remove(&i, &guard).is_some() {
                    removed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no thread panics");
    }

    assert_eq!(removed.load(Ordering::Relaxed), KEYS);
    assert!(map.is_empty());
}

#[test]
fn single_key_history_is_linearizable() {
    // one writer alternates values; readers must only ever observe values
    // the writer actually wrote, and `None` only before the first write
    const WRITES: usize = 10_000;

    let map = Arc::new(HashMap::<usize, usize>::new());
    let mut handles = Vec::new();
    {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let guard = map.guard();
            for i in 0..WRITES {
                map.insert(0, i, &guard);
            }
        }));
    }
    for _ in 0..2 {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let mut last_seen = None;
            for _ in 0..WRITES {
                let guard = map.guard();
                let seen = map.get(&0, &guard).copied();
                if let (Some(prev), Some(now)) = (last_seen, seen) {
                    // the single writer only counts up
                    assert!(now >= prev, "observed {} after {}", now, prev);
                }
                // a mapping never disappears once written
                assert!(seen.is_some() || last_seen.is_none());
                last_seen = seen;
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no thread panics");
    }
}

#[test]
fn iteration_during_writes_stays_sane() {
    const STABLE: usize = 1024;

    let map = Arc::new(HashMap::<usize, usize>::new());
    {
        let guard = map.guard();
        for i in 0..STABLE {
            map.insert(i, i, &guard);
        }
    }

    let mut handles = Vec::new();
    {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let guard = map.guard();
            for i in STABLE..STABLE * 4 {
                map.insert(i, i, &guard);
            }
        }));
    }
    {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            for _ in 0..64 {
                let guard = map.guard();
                let stable_seen = map
                    .iter(&guard)
                    .filter(|&(&k, &v)| {
                        assert_eq!(k, v);
                        k < STABLE
                    })
                    .count();
                // entries inserted before the iteration started are
                // always reported
                assert_eq!(stable_seen, STABLE);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("no thread panics");
    }
}
