//! The bucket array: a power-of-two slice of bucket heads, the shared
//! forwarding entry installed while this table is being drained into its
//! successor, and the pointer to that successor.

use crate::node::{BucketEntry, TreeBin};
use crate::reclaim::{self, Atomic, Collector, Guard, Linked, Shared};
use std::borrow::Borrow;
use std::sync::atomic::Ordering;

pub(crate) struct Table<K, V> {
    buckets: Box<[Atomic<BucketEntry<K, V>>]>,

    // a forwarding entry carries no per-bucket state, so one allocation is
    // shared by every migrated bucket of this table
    forward: Atomic<BucketEntry<K, V>>,

    // The table the forwarding entries lead to. Set once, when the first
    // bucket of this table is migrated, and never changed afterwards.
    //
    // safety: a thread that read a `Forward` out of this table did so under
    // a guard that it still holds. The resize that installed the entry
    // cannot have finished before that read (a finished resize replaces the
    // map's current table, making this one unreachable for new readers), so
    // `next` was the map's `next_table` or its current table at the time of
    // the read. Either way the successor table is retired strictly after
    // this table becomes unreachable, which cannot happen before the guard
    // drops. Following `next` chains under one guard is therefore sound.
    next: Atomic<Table<K, V>>,
}

unsafe impl<K, V> Send for Table<K, V>
where
    K: Send,
    V: Send,
{
}

unsafe impl<K, V> Sync for Table<K, V>
where
    K: Sync,
    V: Sync,
{
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(len: usize, collector: &Collector) -> Self {
        Self::from(vec![Atomic::null(); len], collector)
    }

    pub(crate) fn from(buckets: Vec<Atomic<BucketEntry<K, V>>>, collector: &Collector) -> Self {
        Self {
            buckets: buckets.into_boxed_slice(),
            forward: Atomic::from(Shared::boxed(BucketEntry::Forward, collector)),
            next: Atomic::null(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[inline]
    pub(crate) fn bucket_index(&self, hash: u64) -> usize {
        (hash & (self.buckets.len() as u64 - 1)) as usize
    }

    #[inline]
    pub(crate) fn bucket<'g>(
        &'g self,
        i: usize,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>> {
        self.buckets[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bucket<'g>(
        &'g self,
        i: usize,
        current: Shared<'_, BucketEntry<K, V>>,
        new: Shared<'g, BucketEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Result<Shared<'g, BucketEntry<K, V>>, reclaim::CompareExchangeError<'g, BucketEntry<K, V>>>
    {
        self.buckets[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn store_bucket(&self, i: usize, new: Shared<'_, BucketEntry<K, V>>) {
        self.buckets[i].store(new, Ordering::Release)
    }

    #[inline]
    pub(crate) fn next_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        self.next.load(Ordering::SeqCst, guard)
    }

    /// The shared forwarding entry for this table, associating `for_table`
    /// as the migration target on first use.
    pub(crate) fn forwarder<'g>(
        &'g self,
        for_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>> {
        match self.next_table(guard) {
            t if t.is_null() => {
                match self.next.compare_exchange(
                    Shared::null(),
                    for_table,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                    guard,
                ) {
                    Ok(_) => {}
                    Err(changed) => {
                        assert_eq!(
                            changed.current, for_table,
                            "tables forward to exactly one successor"
                        );
                    }
                }
            }
            t => {
                assert_eq!(t, for_table, "tables forward to exactly one successor");
            }
        }
        self.forward.load(Ordering::SeqCst, guard)
    }
}

impl<K, V> Table<K, V>
where
    K: Ord,
{
    /// Finds the entry for `key` starting from the given bucket head,
    /// following forwarding entries into successor tables as needed.
    pub(crate) fn find<'g, Q>(
        &'g self,
        head: &Linked<BucketEntry<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        match **head {
            BucketEntry::Node(_) => {
                let mut entry = head;
                loop {
                    let node = entry
                        .as_node()
                        .expect("chain nodes only link to chain nodes");
                    if node.hash == hash && node.key.borrow() == key {
                        return Shared::from(entry as *const Linked<BucketEntry<K, V>>);
                    }
                    let next = node.next.load(Ordering::SeqCst, guard);
                    if next.is_null() {
                        return Shared::null();
                    }
                    // safety: next was read under our guard and is only
                    // retired after becoming unreachable from its bucket
                    entry = unsafe { next.deref() };
                }
            }
            BucketEntry::Tree(_) => TreeBin::find(
                Shared::from(head as *const Linked<BucketEntry<K, V>>),
                hash,
                key,
                guard,
            ),
            // the claiming thread has not yet decided on a mapping, so
            // there is nothing to observe here
            BucketEntry::Reserved(_) => Shared::null(),
            BucketEntry::Forward => {
                // safety: see the comment on `next`
                let mut table = unsafe { self.next_table(guard).deref() };
                loop {
                    if table.is_empty() {
                        return Shared::null();
                    }
                    let bucket = table.bucket(table.bucket_index(hash), guard);
                    if bucket.is_null() {
                        return Shared::null();
                    }
                    // safety: bucket was read under our guard
                    let bucket = unsafe { bucket.deref() };
                    match **bucket {
                        BucketEntry::Forward => {
                            // safety: see the comment on `next`
                            table = unsafe { table.next_table(guard).deref() };
                        }
                        _ => return table.find(bucket, hash, key, guard),
                    }
                }
            }
            BucketEntry::TreeNode(_) => {
                unreachable!("a tree node is never the head of a bucket")
            }
        }
    }
}

impl<K, V> Table<K, V> {
    /// Frees every bucket of the table, including keys and values.
    ///
    /// Requires `&mut self`: no references into the table may remain.
    pub(crate) fn drop_buckets(&mut self) {
        // safety: we have &mut self, so no thread can be reading the table
        let guard = unsafe { reclaim::unprotected() };

        for bucket in Vec::from(std::mem::take(&mut self.buckets)) {
            let entry = bucket.load(Ordering::Relaxed, &guard);
            if entry.is_null() {
                continue;
            }
            // safety below: &mut self means every allocation reachable from
            // a bucket is owned by this table now
            let entry_ref = unsafe { entry.deref() };
            match **entry_ref {
                // the shared forwarding entry is freed once, in drop
                BucketEntry::Forward => {}
                BucketEntry::Node(_) => {
                    let mut head = unsafe { bucket.into_box() };
                    loop {
                        let node = match Linked::into_inner(*head) {
                            BucketEntry::Node(node) => node,
                            _ => unreachable!("chain nodes only link to chain nodes"),
                        };
                        let value = node.value.load(Ordering::Relaxed, &guard);
                        if !value.is_null() {
                            drop(unsafe { value.into_box() });
                        }
                        let next = node.next.load(Ordering::Relaxed, &guard);
                        if next.is_null() {
                            break;
                        }
                        head = unsafe { next.into_box() };
                    }
                }
                BucketEntry::Tree(_) => {
                    // TreeBin::drop frees the tree nodes and their values
                    drop(unsafe { bucket.into_box() });
                }
                // reservations live only for the duration of one compute
                // call, which borrows the map
                BucketEntry::Reserved(_) => {
                    drop(unsafe { bucket.into_box() });
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self
        let guard = unsafe { reclaim::unprotected() };

        // every bucket is either empty, already freed by drop_buckets, or
        // (after a resize) the shared forwarding entry
        if cfg!(debug_assertions) {
            for bucket in self.buckets.iter() {
                let entry = bucket.load(Ordering::Relaxed, &guard);
                if entry.is_null() {
                    continue;
                }
                // safety: we have exclusive access
                let entry_ref = unsafe { entry.deref() };
                match **entry_ref {
                    BucketEntry::Forward => {}
                    _ => unreachable!("dropped table with a live bucket"),
                }
            }
        }

        let forward = self.forward.swap(Shared::null(), Ordering::Relaxed, &guard);
        assert!(!forward.is_null(), "forward is allocated with the table");
        // safety: the forwarding entry is owned by this table alone
        drop(unsafe { forward.into_box() });

        // the successor table is not ours to free
    }
}
