use crate::counter::Counter;
use crate::iter::{Iter, Keys, Traverser, Values};
use crate::node::{BucketEntry, Node, Reservation, TreeBin, TreeNode};
use crate::reclaim::{self, Atomic, Collector, Guard, Linked, RetireShared, Shared};
use crate::table::Table;
use std::borrow::Borrow;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FromIterator;
use std::mem;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Once;

const ISIZE_BITS: usize = core::mem::size_of::<isize>() * 8;

/// The largest possible table capacity. Kept well below the addressable
/// range so capacity arithmetic (thresholds, doubling) can never overflow.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The default initial table capacity. Must be a power of two and at most
/// `MAXIMUM_CAPACITY`.
const DEFAULT_CAPACITY: usize = 16;

/// The bucket length at which a chain is replaced by a tree bin. Must be
/// well above `UNTREEIFY_THRESHOLD` so bins do not flip back and forth.
const TREEIFY_THRESHOLD: usize = 8;

/// The bucket length at or below which a split tree bin becomes a chain
/// again during a resize. Strictly smaller than `TREEIFY_THRESHOLD`.
const UNTREEIFY_THRESHOLD: usize = 6;

/// The smallest table capacity at which bins may be treeified; below it a
/// long chain triggers a resize instead, since collisions are then mostly
/// an artifact of the small mask.
const MIN_TREEIFY_CAPACITY: usize = 64;

/// Minimum number of buckets handed to one resize helper at a time; ranges
/// are subdivided further only when more parallelism is available.
const MIN_TRANSFER_STRIDE: isize = 16;

/// Bits of `size_ctl` used for the per-capacity resize stamp.
const RESIZE_STAMP_BITS: usize = ISIZE_BITS / 2;

/// The maximum number of threads that can cooperate on one resize. Must
/// fit in the bits of `size_ctl` below the stamp.
const MAX_RESIZERS: isize = (1 << (ISIZE_BITS - RESIZE_STAMP_BITS)) - 1;

/// The shift placing the resize stamp in the high half of `size_ctl`.
const RESIZE_STAMP_SHIFT: usize = ISIZE_BITS - RESIZE_STAMP_BITS;

/// User hashes occupy the non-negative half of the `u64` space.
const HASH_BITS: u64 = u64::MAX >> 1;

static NCPU_INIT: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

/// The number of hardware threads, fetched once.
pub(crate) fn num_cpus() -> usize {
    NCPU_INIT.call_once(|| NCPU.store(num_cpus::get(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}

macro_rules! load_factor {
    ($n:expr) => {
        // ¾ n = n - n/4
        $n - ($n >> 2)
    };
}

/// Folds the high bits of a hash into the low bits and clears the top bit.
///
/// Bucket indices keep only the low `log2(len)` bits of the hash, so hash
/// sets that differ only in high bits would otherwise collide into the
/// same few buckets of a small table.
pub(crate) fn spread(hash: u64) -> u64 {
    (hash ^ (hash >> 32)) & HASH_BITS
}

/// A concurrent hash map.
///
/// All operations go through a [`Guard`] tied to this map's collector; see
/// the crate-level documentation for the memory-reclamation model. Lookups
/// never block. Writers block only on the lock of their own bucket, and
/// cooperate on table resizes instead of waiting for them.
pub struct HashMap<K, V, S = crate::DefaultHashBuilder> {
    /// The bucket array. Lazily allocated on first insert; its length is
    /// always a power of two.
    table: Atomic<Table<K, V>>,

    /// The successor table; non-null only while a resize is in progress.
    next_table: Atomic<Table<K, V>>,

    /// The next bucket index (plus one) a resize helper may claim.
    transfer_index: AtomicIsize,

    /// Approximate element count.
    count: Counter,

    /// Table initialization and resizing control. Negative while the table
    /// is being initialized (−1) or resized (stamp plus one more than the
    /// number of active helpers). Otherwise, before the table exists, the
    /// requested initial capacity (or 0 for the default); once it exists,
    /// the element count at which to resize next.
    size_ctl: AtomicIsize,

    /// All guards used with this map must come from this collector, so an
    /// allocation can never outlive the map that retired it.
    collector: Collector,

    build_hasher: S,
}

unsafe impl<K, V, S> Send for HashMap<K, V, S>
where
    K: Send,
    V: Send,
    S: Send,
{
}

unsafe impl<K, V, S> Sync for HashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
}

#[derive(Debug)]
pub(crate) enum PutOutcome<'g, V> {
    Inserted {
        new: &'g V,
    },
    Replaced {
        old: &'g V,
        new: &'g V,
    },
    Occupied {
        current: &'g V,
        not_inserted: Box<Linked<V>>,
    },
}

impl<'g, V> PutOutcome<'g, V> {
    fn previous(&self) -> Option<&'g V> {
        match *self {
            PutOutcome::Inserted { .. } => None,
            PutOutcome::Replaced { old, .. } => Some(old),
            PutOutcome::Occupied { current, .. } => Some(current),
        }
    }
}

/// The error returned by [`HashMap::try_insert`] when the key already has a
/// value.
#[derive(Debug, PartialEq, Eq)]
pub struct TryInsertError<'g, V> {
    /// The value already mapped to the key.
    pub current: &'g V,
    /// The value that was not inserted.
    pub not_inserted: V,
}

impl<'g, V> Display for TryInsertError<'g, V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insert of \"{:?}\" failed as key was already present with value \"{:?}\"",
            self.not_inserted, self.current
        )
    }
}

impl<'g, V> Error for TryInsertError<'g, V> where V: Debug {}

impl<K, V> HashMap<K, V, crate::DefaultHashBuilder> {
    /// Creates an empty map with the default hasher and capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty map sized to hold `capacity` elements without
    /// resizing, assuming reasonably distributed hashes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, crate::DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty map which will use `hash_builder` to hash keys.
    ///
    /// Note that a hand-picked hasher trades away the collision resistance
    /// the randomized default provides.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            table: Atomic::null(),
            next_table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            count: Counter::new(),
            size_ctl: AtomicIsize::new(0),
            collector: Collector::new(),
            build_hasher: hash_builder,
        }
    }

    /// Creates an empty map with the given capacity hint and hasher.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        if capacity == 0 {
            return Self::with_hasher(hash_builder);
        }
        let mut map = Self::with_hasher(hash_builder);
        map.presize(capacity);
        map
    }

    /// Pins a [`Guard`] for use with this map.
    ///
    /// Holding a guard delays reclamation of everything the map unlinks
    /// while it is held; drop it when a batch of operations is done.
    pub fn guard(&self) -> Guard<'_> {
        self.collector.enter()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard<'_>) {
        if let Some(c) = guard.collector() {
            assert!(
                Collector::ptr_eq(c, &self.collector),
                "the guard was created by a different map"
            );
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// The value is a snapshot of a sharded counter: concurrent updates
    /// may or may not be included.
    pub fn len(&self) -> usize {
        let guard = self.collector.enter();
        self.count.sum(&guard).max(0) as usize
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn capacity(&self, guard: &Guard<'_>) -> usize {
        self.check_guard(guard);
        let table = self.table.load(Ordering::Relaxed, guard);
        if table.is_null() {
            0
        } else {
            // safety: the table was loaded under the guard
            unsafe { table.deref() }.len()
        }
    }

    /// The stamp recorded in `size_ctl` while resizing from a table of
    /// `n` buckets. Negative once shifted into the high half, and distinct
    /// for every capacity, so helpers can tell which resize they joined.
    fn resize_stamp(n: usize) -> isize {
        n.leading_zeros() as isize | (1 << (RESIZE_STAMP_BITS - 1))
    }

    /// An iterator over the map's entries, in no particular order.
    ///
    /// The sequence is weakly consistent: it reflects the table as the
    /// traversal passes through it, and may observe a mix of states that
    /// never coexisted.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'g>) -> Iter<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        Iter {
            traverser: Traverser::new(table, guard),
            guard,
        }
    }

    /// An iterator over the map's keys, in no particular order.
    pub fn keys<'g>(&'g self, guard: &'g Guard<'g>) -> Keys<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        Keys {
            traverser: Traverser::new(table, guard),
        }
    }

    /// An iterator over the map's values, in no particular order.
    pub fn values<'g>(&'g self, guard: &'g Guard<'g>) -> Values<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        Values {
            traverser: Traverser::new(table, guard),
            guard,
        }
    }

    /// Allocates the table on first use. Exactly one thread wins the
    /// `size_ctl` transition to the initializing state; everyone else
    /// yields until the table is published.
    fn init_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            // safety: the table was loaded under our guard and is retired
            // only after becoming unreachable
            if !table.is_null() && !unsafe { table.deref() }.is_empty() {
                break table;
            }

            let size_ctl = self.size_ctl.load(Ordering::SeqCst);
            if size_ctl < 0 {
                // lost the initialization race
                std::thread::yield_now();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(size_ctl, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let mut table = self.table.load(Ordering::SeqCst, guard);
            let mut next_threshold = size_ctl;
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                let n = if size_ctl > 0 {
                    size_ctl as usize
                } else {
                    DEFAULT_CAPACITY
                };
                let new_table =
                    Shared::boxed(Table::new(n, &self.collector), &self.collector);
                // publish the table before the threshold, so a racing
                // reader never sees a sized table with a stale threshold
                self.table.store(new_table, Ordering::SeqCst);
                table = new_table;
                next_threshold = load_factor!(n as isize);
            }
            self.size_ctl.store(next_threshold, Ordering::SeqCst);
            break table;
        }
    }

    /// Pre-sizes a map that no other thread can see yet.
    fn presize(&mut self, capacity: usize) {
        // safety: we have &mut self, so the map is not yet shared
        let guard = unsafe { reclaim::unprotected() };

        let requested = if capacity >= MAXIMUM_CAPACITY / 2 {
            MAXIMUM_CAPACITY
        } else {
            // next power of two from 1.5 × capacity + 1, so the threshold
            // lands at or above the requested element count
            let size = capacity + (capacity >> 1) + 1;
            usize::min(MAXIMUM_CAPACITY, size.next_power_of_two())
        };

        assert_eq!(self.size_ctl.load(Ordering::SeqCst), 0);
        assert!(self.table.load(Ordering::SeqCst, &guard).is_null());

        let table = Shared::boxed(Table::new(requested, &self.collector), &self.collector);
        self.table.store(table, Ordering::SeqCst);
        self.size_ctl
            .store(load_factor!(requested as isize), Ordering::SeqCst);
    }
}

// the methods below end up in `migrate`, which clones keys into the new
// table and rebuilds tree bins, hence Clone + Ord
impl<K, V, S> HashMap<K, V, S>
where
    K: Clone + Ord,
{
    /// Grows the table until the threshold accommodates `size` elements,
    /// initializing it first if necessary.
    fn try_grow_to(&self, size: usize, guard: &Guard<'_>) {
        let requested = if size >= MAXIMUM_CAPACITY / 2 {
            MAXIMUM_CAPACITY
        } else {
            let size = size + (size >> 1) + 1;
            usize::min(MAXIMUM_CAPACITY, size.next_power_of_two())
        } as isize;

        loop {
            let size_ctl = self.size_ctl.load(Ordering::SeqCst);
            if size_ctl < 0 {
                // someone else is initializing or resizing
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            let current_capacity = if table.is_null() {
                0
            } else {
                // safety: loaded under our guard
                unsafe { table.deref() }.len()
            };

            if current_capacity == 0 {
                // the table does not exist yet; create it at the larger of
                // the requested and the originally configured capacity
                let initial = size_ctl;
                let capacity = requested.max(initial) as usize;
                if self
                    .size_ctl
                    .compare_exchange(size_ctl, -1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                if self.table.load(Ordering::SeqCst, guard) != table {
                    // someone published a table while we acquired the
                    // initialization state; release it and retry
                    self.size_ctl.store(size_ctl, Ordering::SeqCst);
                    continue;
                }
                let new_table =
                    Shared::boxed(Table::new(capacity, &self.collector), &self.collector);
                let old = self.table.swap(new_table, Ordering::SeqCst, guard);
                assert!(old.is_null(), "tables are never allocated empty");
                self.size_ctl
                    .store(load_factor!(capacity as isize), Ordering::SeqCst);
            } else if requested <= size_ctl || current_capacity >= MAXIMUM_CAPACITY {
                // already large enough, or cannot grow further
                break;
            } else if table == self.table.load(Ordering::SeqCst, guard) {
                let stamp = Self::resize_stamp(current_capacity) << RESIZE_STAMP_SHIFT;
                if self
                    .size_ctl
                    .compare_exchange(size_ctl, stamp + 2, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.migrate(table, Shared::null(), guard);
                }
            }
        }
    }

    /// Moves every bucket of `table` into a table of twice the size,
    /// claiming strides of buckets through `transfer_index` so that any
    /// number of helpers can work disjoint ranges. The last helper out
    /// commits the new table.
    fn migrate<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        mut next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        // safety: the table was loaded under our guard; it is retired only
        // via this method's commit path, one full epoch later
        let n = unsafe { table.deref() }.len();
        let cpus = num_cpus();
        let stride = if cpus > 1 { (n >> 3) / cpus } else { n };
        let stride = isize::max(stride as isize, MIN_TRANSFER_STRIDE);

        if next_table.is_null() {
            // we are initiating the resize
            let new_table =
                Shared::boxed(Table::new(n << 1, &self.collector), &self.collector);
            let previous = self.next_table.swap(new_table, Ordering::SeqCst, guard);
            assert!(previous.is_null(), "a resize was already in progress");
            self.transfer_index.store(n as isize, Ordering::SeqCst);
            next_table = self.next_table.load(Ordering::Relaxed, guard);
        }

        // safety: as for table
        let next_n = unsafe { next_table.deref() }.len();
        let table_ref = unsafe { table.deref() };
        let next_ref = unsafe { next_table.deref() };

        let mut advance = true;
        let mut finishing = false;
        let mut i = 0isize;
        let mut bound = 0isize;
        loop {
            // claim the next stride of buckets, high indices first
            while advance {
                i -= 1;
                if i >= bound || finishing {
                    advance = false;
                    break;
                }

                let next_index = self.transfer_index.load(Ordering::SeqCst);
                if next_index <= 0 {
                    i = -1;
                    advance = false;
                    break;
                }

                let next_bound = if next_index > stride {
                    next_index - stride
                } else {
                    0
                };
                if self
                    .transfer_index
                    .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    bound = next_bound;
                    i = next_index - 1;
                    advance = false;
                    break;
                }
            }

            if i < 0 || i as usize >= n || i as usize + n >= next_n {
                // no more buckets for us to claim
                if finishing {
                    // only one helper takes this branch: commit the table
                    self.next_table.store(Shared::null(), Ordering::SeqCst);
                    let old = self.table.swap(next_table, Ordering::SeqCst, guard);
                    // safety: the old table is no longer reachable through
                    // the map; threads that still hold it found it under a
                    // guard that predates this retirement
                    unsafe { guard.retire_shared(old) };
                    self.size_ctl.store(
                        ((n as isize) << 1) - ((n as isize) >> 1),
                        Ordering::SeqCst,
                    );
                    return;
                }

                let sc = self.size_ctl.load(Ordering::SeqCst);
                if self
                    .size_ctl
                    .compare_exchange(sc, sc - 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    if (sc - 2) != Self::resize_stamp(n) << RESIZE_STAMP_SHIFT {
                        // other helpers are still working
                        return;
                    }
                    // we are the last helper: re-scan the whole range to
                    // make sure every bucket is forwarded, then commit
                    finishing = true;
                    advance = true;
                    i = n as isize;
                }
                continue;
            }
            let i = i as usize;

            let bucket = table_ref.bucket(i, guard);
            if bucket.is_null() {
                advance = table_ref
                    .cas_bucket(
                        i,
                        Shared::null(),
                        table_ref.forwarder(next_table, guard),
                        guard,
                    )
                    .is_ok();
                continue;
            }

            // safety: bucket heads are retired only after being replaced,
            // under a guard ordering with ours
            match **unsafe { bucket.deref() } {
                BucketEntry::Forward => {
                    // already migrated
                    advance = true;
                }
                BucketEntry::Reserved(ref reservation) => {
                    // wait for the claiming compute call to finish, then
                    // re-read the bucket
                    drop(reservation.lock.lock());
                }
                BucketEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    // the head may have changed before we took the lock
                    if table_ref.bucket(i, guard) != bucket {
                        continue;
                    }

                    // find the longest suffix of nodes that all land in the
                    // same half of the new table; those nodes move as-is
                    let mut run_bit = head.hash & n as u64;
                    let mut last_run = bucket;
                    let mut p = bucket;
                    loop {
                        // safety: chain nodes are retired only after their
                        // bucket forwards, which happens below under this lock
                        let node = unsafe { p.deref() }.as_node().unwrap();
                        let next = node.next.load(Ordering::SeqCst, guard);

                        let bit = node.hash & n as u64;
                        if bit != run_bit {
                            run_bit = bit;
                            last_run = p;
                        }

                        if next.is_null() {
                            break;
                        }
                        p = next;
                    }

                    let mut low = Shared::null();
                    let mut high = Shared::null();
                    if run_bit == 0 {
                        low = last_run;
                    } else {
                        high = last_run;
                    }

                    // the prefix is re-allocated, sharing the value
                    // allocations with the old nodes
                    let mut p = bucket;
                    while p != last_run {
                        // safety: as above
                        let node = unsafe { p.deref() }.as_node().unwrap();
                        let link = if node.hash & n as u64 == 0 {
                            &mut low
                        } else {
                            &mut high
                        };
                        *link = Shared::boxed(
                            BucketEntry::Node(Node::with_next(
                                node.hash,
                                node.key.clone(),
                                node.value.clone(),
                                Atomic::from(*link),
                            )),
                            &self.collector,
                        );
                        p = node.next.load(Ordering::SeqCst, guard);
                    }

                    next_ref.store_bucket(i, low);
                    next_ref.store_bucket(i + n, high);
                    table_ref.store_bucket(i, table_ref.forwarder(next_table, guard));

                    // the re-allocated prefix of the old chain is garbage;
                    // the suffix lives on in the new table
                    let mut p = bucket;
                    while p != last_run {
                        // safety: the old bucket now forwards, so the only
                        // threads that can still reach these nodes hold
                        // guards from before the store above
                        let next = unsafe { p.deref() }
                            .as_node()
                            .unwrap()
                            .next
                            .load(Ordering::SeqCst, guard);
                        unsafe { guard.retire_shared(p) };
                        p = next;
                    }

                    advance = true;
                    drop(head_lock);
                }
                BucketEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();

                    if table_ref.bucket(i, guard) != bucket {
                        continue;
                    }

                    // split the scan list into the low and high halves,
                    // building fresh tree nodes that share the values
                    let mut low = Shared::null();
                    let mut low_tail: Shared<'_, BucketEntry<K, V>> = Shared::null();
                    let mut high = Shared::null();
                    let mut high_tail: Shared<'_, BucketEntry<K, V>> = Shared::null();
                    let mut low_count = 0usize;
                    let mut high_count = 0usize;
                    let mut e = tree_bin.first.load(Ordering::Relaxed, guard);
                    while !e.is_null() {
                        // safety: tree entries live at least as long as
                        // their bin, which our guard protects
                        let tree_node = unsafe { TreeNode::get_tree_node(e) };
                        let hash = tree_node.node.hash;
                        let new_node = TreeNode::new(
                            hash,
                            tree_node.node.key.clone(),
                            tree_node.node.value.clone(),
                            Atomic::null(),
                            Atomic::null(),
                        );
                        if hash & n as u64 == 0 {
                            new_node.prev.store(low_tail, Ordering::Relaxed);
                            let new_node = Shared::boxed(
                                BucketEntry::TreeNode(new_node),
                                &self.collector,
                            );
                            if low_tail.is_null() {
                                low = new_node;
                            } else {
                                // safety: we just created low_tail ourselves
                                unsafe { TreeNode::get_tree_node(low_tail) }
                                    .node
                                    .next
                                    .store(new_node, Ordering::Relaxed);
                            }
                            low_tail = new_node;
                            low_count += 1;
                        } else {
                            new_node.prev.store(high_tail, Ordering::Relaxed);
                            let new_node = Shared::boxed(
                                BucketEntry::TreeNode(new_node),
                                &self.collector,
                            );
                            if high_tail.is_null() {
                                high = new_node;
                            } else {
                                // safety: we just created high_tail ourselves
                                unsafe { TreeNode::get_tree_node(high_tail) }
                                    .node
                                    .next
                                    .store(new_node, Ordering::Relaxed);
                            }
                            high_tail = new_node;
                            high_count += 1;
                        }
                        e = tree_node.node.next.load(Ordering::Relaxed, guard);
                    }

                    let mut reused_bin = false;
                    let low_bucket = if low_count <= UNTREEIFY_THRESHOLD {
                        // too small to stay a tree; the fresh tree nodes
                        // were never shared and can be freed directly
                        let linear = Self::untreeify(low, guard, &self.collector);
                        // safety: just created, never shared
                        unsafe { TreeBin::drop_unpublished(low, false, guard) };
                        linear
                    } else if high_count != 0 {
                        Shared::boxed(
                            BucketEntry::Tree(TreeBin::new(low, guard)),
                            &self.collector,
                        )
                    } else {
                        // everything landed in the low half; reuse the old
                        // bin, which stays valid behind the forwarder
                        reused_bin = true;
                        // safety: just created, never shared
                        unsafe { TreeBin::drop_unpublished(low, false, guard) };
                        bucket
                    };
                    let high_bucket = if high_count <= UNTREEIFY_THRESHOLD {
                        let linear = Self::untreeify(high, guard, &self.collector);
                        // safety: just created, never shared
                        unsafe { TreeBin::drop_unpublished(high, false, guard) };
                        linear
                    } else if low_count != 0 {
                        Shared::boxed(
                            BucketEntry::Tree(TreeBin::new(high, guard)),
                            &self.collector,
                        )
                    } else {
                        reused_bin = true;
                        // safety: just created, never shared
                        unsafe { TreeBin::drop_unpublished(high, false, guard) };
                        bucket
                    };

                    next_ref.store_bucket(i, low_bucket);
                    next_ref.store_bucket(i + n, high_bucket);
                    table_ref.store_bucket(i, table_ref.forwarder(next_table, guard));

                    if !reused_bin {
                        // the old bin's nodes are garbage, but the values
                        // were re-linked into the new bin
                        // safety: unreachable except through prior guards
                        unsafe { TreeBin::defer_drop_without_values(bucket, guard) };
                    }

                    advance = true;
                    drop(bin_lock);
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }
        }
    }

    /// Joins an in-progress resize if there is room for another helper.
    /// Returns the table to retry the caller's operation against.
    fn help_resize<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Table<K, V>> {
        if table.is_null() {
            return table;
        }

        // safety: the table was loaded under our guard
        let next_table = unsafe { table.deref() }.next_table(guard);
        if next_table.is_null() {
            return table;
        }

        // safety: as above
        let stamp = Self::resize_stamp(unsafe { table.deref() }.len()) << RESIZE_STAMP_SHIFT;

        while next_table == self.next_table.load(Ordering::SeqCst, guard)
            && table == self.table.load(Ordering::SeqCst, guard)
        {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || sc == stamp + MAX_RESIZERS
                || sc == stamp + 1
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                // the resize finished, ran out of helper slots, or has no
                // work left to hand out
                break;
            }

            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.migrate(table, next_table, guard);
                break;
            }
        }
        next_table
    }

    /// Applies a count delta and, when `resize_hint` is given, checks the
    /// threshold, starting or joining a resize as needed. The hint is the
    /// bucket length the writer observed; deletions pass `None`.
    fn update_count(&self, delta: isize, resize_hint: Option<usize>, guard: &Guard<'_>) {
        self.count.add(delta, &self.collector, guard);

        if resize_hint.is_none() {
            return;
        }

        let mut count = self.count.sum(guard).max(0) as usize;
        loop {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if (count as isize) < sc {
                // below the resize threshold
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            if table.is_null() {
                break;
            }

            // safety: loaded under our guard
            let n = unsafe { table.deref() }.len();
            if n >= MAXIMUM_CAPACITY {
                break;
            }

            let stamp = Self::resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                // a resize is running; join it if it still has capacity
                // for helpers and work to hand out
                if sc == stamp + MAX_RESIZERS || sc == stamp + 1 {
                    break;
                }
                let next_table = self.next_table.load(Ordering::SeqCst, guard);
                if next_table.is_null() {
                    break;
                }
                if self.transfer_index.load(Ordering::SeqCst) <= 0 {
                    break;
                }
                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.migrate(table, next_table, guard);
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, stamp + 2, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.migrate(table, Shared::null(), guard);
            }

            // under sustained writes one resize may not be enough
            count = self.count.sum(guard).max(0) as usize;
        }
    }

    /// Converts the bucket at `index` into a tree bin, unless the table is
    /// still small enough that growing it is the better response.
    fn treeify_bucket<'g>(&'g self, table: &Table<K, V>, index: usize, guard: &'g Guard<'_>) {
        let n = table.len();
        if n < MIN_TREEIFY_CAPACITY {
            self.try_grow_to(n << 1, guard);
            return;
        }

        let bucket = table.bucket(index, guard);
        if bucket.is_null() {
            return;
        }
        // safety: bucket heads are retired only after replacement
        match **unsafe { bucket.deref() } {
            BucketEntry::Node(ref head) => {
                let lock = head.lock.lock();
                if table.bucket(index, guard) != bucket {
                    return;
                }

                // rebuild the chain as a list of tree nodes sharing the
                // values, then hang a tree over it
                let mut e = bucket;
                let mut head_entry = Shared::null();
                let mut tail: Shared<'_, BucketEntry<K, V>> = Shared::null();
                while !e.is_null() {
                    // safety: chain reachable under the bucket lock
                    let node = unsafe { e.deref() }.as_node().unwrap();
                    let tree_node = TreeNode::new(
                        node.hash,
                        node.key.clone(),
                        node.value.clone(),
                        Atomic::null(),
                        Atomic::null(),
                    );
                    tree_node.prev.store(tail, Ordering::Relaxed);
                    let tree_node =
                        Shared::boxed(BucketEntry::TreeNode(tree_node), &self.collector);
                    if tail.is_null() {
                        head_entry = tree_node;
                    } else {
                        // safety: we just created tail ourselves
                        unsafe { tail.deref() }
                            .as_tree_node()
                            .unwrap()
                            .node
                            .next
                            .store(tree_node, Ordering::Relaxed);
                    }
                    tail = tree_node;
                    e = node.next.load(Ordering::SeqCst, guard);
                }

                table.store_bucket(
                    index,
                    Shared::boxed(
                        BucketEntry::Tree(TreeBin::new(head_entry, guard)),
                        &self.collector,
                    ),
                );
                drop(lock);

                // the old chain nodes are garbage; their values moved
                let mut e = bucket;
                while !e.is_null() {
                    // safety: the bucket was replaced, so only threads with
                    // prior guards can still reach these nodes
                    unsafe {
                        let next = e
                            .deref()
                            .as_node()
                            .unwrap()
                            .next
                            .load(Ordering::SeqCst, guard);
                        guard.retire_shared(e);
                        e = next;
                    }
                }
            }
            // the bucket was moved, emptied and reclaimed, or already
            // treeified between the caller's insert and this call; each of
            // those outcomes makes treeification moot
            BucketEntry::Forward | BucketEntry::Tree(_) | BucketEntry::Reserved(_) => {}
            BucketEntry::TreeNode(_) => {
                unreachable!("a tree node is never the head of a bucket")
            }
        }
    }

    /// Rebuilds a list of tree nodes as a plain chain, sharing the values.
    /// Does not free the tree nodes; they may still be reachable.
    fn untreeify<'g>(
        bin: Shared<'g, BucketEntry<K, V>>,
        guard: &'g Guard<'_>,
        collector: &Collector,
    ) -> Shared<'g, BucketEntry<K, V>> {
        let mut head = Shared::null();
        let mut tail: Shared<'_, BucketEntry<K, V>> = Shared::null();
        let mut q = bin;
        while !q.is_null() {
            // safety: either freshly created by the caller, or read from a
            // bin under the caller's bucket lock
            let tree_node = unsafe { TreeNode::get_tree_node(q) };
            let node = Shared::boxed(
                BucketEntry::Node(Node::with_next(
                    tree_node.node.hash,
                    tree_node.node.key.clone(),
                    tree_node.node.value.clone(),
                    Atomic::null(),
                )),
                collector,
            );
            if tail.is_null() {
                head = node;
            } else {
                // safety: we just created tail ourselves
                unsafe { tail.deref() }
                    .as_node()
                    .unwrap()
                    .next
                    .store(node, Ordering::Relaxed);
            }
            tail = node;
            q = tree_node.node.next.load(Ordering::Relaxed, guard);
        }
        head
    }

    /// Pre-allocates room for `additional` more entries.
    pub fn reserve(&self, additional: usize, guard: &Guard<'_>) {
        self.check_guard(guard);
        let absolute = self.len() + additional;
        self.try_grow_to(absolute, guard);
    }
}

// lookups only hash and compare, so they get away with much weaker bounds
// than the write path
impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Ord,
    S: BuildHasher,
{
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        spread(h.finish())
    }

    fn get_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        let hash = self.hash(key);
        let table = self.table.load(Ordering::SeqCst, guard);
        if table.is_null() {
            return None;
        }

        // safety: the table was loaded under our guard and is retired only
        // one epoch after being unlinked
        let table = unsafe { table.deref() };
        if table.is_empty() {
            return None;
        }

        let bucket = table.bucket(table.bucket_index(hash), guard);
        if bucket.is_null() {
            return None;
        }

        // safety: bucket heads are retired only after being replaced, and
        // we read this one under our guard
        let node = table.find(unsafe { bucket.deref() }, hash, key, guard);
        if node.is_null() {
            return None;
        }
        // safety: as above
        Some(match **unsafe { node.deref() } {
            BucketEntry::Node(ref node) => node,
            BucketEntry::TreeNode(ref tree_node) => &tree_node.node,
            _ => unreachable!("find returns only data entries"),
        })
    }

    /// Returns `true` if the map contains a value for the key.
    ///
    /// The key may be any borrowed form of the map's key type, with
    /// matching `Hash` and `Ord` implementations.
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard<'_>) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.get(key, guard).is_some()
    }

    /// Returns the value mapped to `key`, or `None` if there is none.
    ///
    /// The returned reference is valid until the guard is dropped.
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;

        let value = node.value.load(Ordering::SeqCst, guard);
        assert!(!value.is_null(), "mapped values are never null");
        // safety: the value is retired only after it is unlinked from its
        // node, which our guard predates
        Some(unsafe { &**value.deref() })
    }

    /// Returns the key and value for `key`, if present.
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;

        let value = node.value.load(Ordering::SeqCst, guard);
        assert!(!value.is_null(), "mapped values are never null");
        // safety: as for get
        Some((&node.key, unsafe { &**value.deref() }))
    }

    pub(crate) fn guarded_eq(
        &self,
        other: &Self,
        our_guard: &Guard<'_>,
        their_guard: &Guard<'_>,
    ) -> bool
    where
        V: PartialEq,
    {
        let mut theirs = 0;
        for (key, value) in other.iter(their_guard) {
            theirs += 1;
            if self.get(key, our_guard) != Some(value) {
                return false;
            }
        }
        self.iter(our_guard).count() == theirs
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    /// Maps `key` to `value`, returning the value previously mapped to the
    /// key, if any.
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        self.put(key, value, false, guard).previous()
    }

    /// Maps `key` to `value` unless the key is already present. Returns
    /// the current value if there is one (in which case `value` is
    /// dropped), or `None` if `value` was inserted.
    pub fn put_if_absent<'g>(&'g self, key: K, value: V, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        match self.put(key, value, true, guard) {
            PutOutcome::Occupied { current, .. } => Some(current),
            PutOutcome::Inserted { .. } => None,
            PutOutcome::Replaced { .. } => {
                unreachable!("put without replacement cannot replace")
            }
        }
    }

    /// Like [`put_if_absent`](HashMap::put_if_absent), but hands the value
    /// back on failure.
    pub fn try_insert<'g>(
        &'g self,
        key: K,
        value: V,
        guard: &'g Guard<'_>,
    ) -> Result<&'g V, TryInsertError<'g, V>> {
        self.check_guard(guard);
        match self.put(key, value, true, guard) {
            PutOutcome::Occupied {
                current,
                not_inserted,
            } => Err(TryInsertError {
                current,
                not_inserted: Linked::into_inner(*not_inserted),
            }),
            PutOutcome::Inserted { new } => Ok(new),
            PutOutcome::Replaced { .. } => {
                unreachable!("put without replacement cannot replace")
            }
        }
    }

    fn put<'g>(
        &'g self,
        mut key: K,
        value: V,
        no_replacement: bool,
        guard: &'g Guard<'_>,
    ) -> PutOutcome<'g, V> {
        let hash = self.hash(&key);
        let value = Shared::boxed(value, &self.collector);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut bucket_len;
        loop {
            // safety below: tables and bucket heads are loaded under our
            // guard and retired at least one epoch after being unlinked,
            // so the references stay valid while the guard lives
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }
            let t = unsafe { table.deref() };

            let i = t.bucket_index(hash);
            let bucket = t.bucket(i, guard);
            if bucket.is_null() {
                // empty bucket: one CAS installs the entry with no lock
                let node = Shared::boxed(
                    BucketEntry::Node(Node::new(hash, key, value)),
                    &self.collector,
                );
                match t.cas_bucket(i, Shared::null(), node, guard) {
                    Ok(_) => {
                        self.update_count(1, Some(0), guard);
                        // safety: the value was allocated under this guard
                        // and is now linked into the map
                        return PutOutcome::Inserted {
                            new: unsafe { &**value.deref() },
                        };
                    }
                    Err(changed) => {
                        assert!(!changed.current.is_null());
                        // safety: our node was never published
                        let node = unsafe { changed.new.into_box() };
                        match Linked::into_inner(*node) {
                            BucketEntry::Node(node) => key = node.key,
                            _ => unreachable!("we allocated a chain node"),
                        }
                        continue;
                    }
                }
            }

            let mut old_val = None;
            match **unsafe { bucket.deref() } {
                BucketEntry::Forward => {
                    table = self.help_resize(table, guard);
                    continue;
                }
                BucketEntry::Reserved(ref reservation) => {
                    // a compute call holds this bucket; it will replace the
                    // reservation before releasing the lock
                    drop(reservation.lock.lock());
                    continue;
                }
                BucketEntry::Node(ref head)
                    if no_replacement && head.hash == hash && head.key == key =>
                {
                    // short-circuit without the lock if the head matches
                    let current = head.value.load(Ordering::SeqCst, guard);
                    // safety (value): never shared, we still own it
                    return PutOutcome::Occupied {
                        current: unsafe { &**current.deref() },
                        not_inserted: unsafe { value.into_box() },
                    };
                }
                BucketEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();

                    // the head may have been replaced before we acquired
                    // the lock; only the current head's lock owns the bucket
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    bucket_len = 1;
                    let mut p = bucket;
                    old_val = loop {
                        // safety: chain reachable under the bucket lock
                        let n = unsafe { p.deref() }.as_node().unwrap();
                        if n.hash == hash && n.key == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            // safety: the value cannot be retired while we
                            // hold a guard from before it was unlinked
                            let current_ref = unsafe { &**current.deref() };
                            if no_replacement {
                                return PutOutcome::Occupied {
                                    current: current_ref,
                                    not_inserted: unsafe { value.into_box() },
                                };
                            }
                            let garbage = n.value.swap(value, Ordering::SeqCst, guard);
                            // safety: unlinked by the swap; only guards
                            // older than this one can still see it
                            unsafe { guard.retire_shared(garbage) };
                            break Some(current_ref);
                        }

                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            // reached the tail; append
                            let node = Shared::boxed(
                                BucketEntry::Node(Node::new(hash, key, value)),
                                &self.collector,
                            );
                            n.next.store(node, Ordering::SeqCst);
                            break None;
                        }
                        p = next;
                        bucket_len += 1;
                    };
                    drop(head_lock);
                }
                BucketEntry::Tree(ref tree_bin) => {
                    let head_lock = tree_bin.lock.lock();

                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    // tree bins never report a length that would re-trigger
                    // treeification
                    bucket_len = 2;
                    let p = tree_bin.find_or_insert(hash, key, value, guard, &self.collector);
                    if !p.is_null() {
                        // safety: tree entries live at least as long as the
                        // bin, which the bucket lock keeps in place
                        let tree_node = unsafe { TreeNode::get_tree_node(p) };
                        let current = tree_node.node.value.load(Ordering::SeqCst, guard);
                        // safety: as in the chain case
                        let current_ref = unsafe { &**current.deref() };
                        if no_replacement {
                            return PutOutcome::Occupied {
                                current: current_ref,
                                not_inserted: unsafe { value.into_box() },
                            };
                        }
                        let garbage =
                            tree_node.node.value.swap(value, Ordering::SeqCst, guard);
                        // safety: as in the chain case
                        unsafe { guard.retire_shared(garbage) };
                        old_val = Some(current_ref);
                    }
                    drop(head_lock);
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }

            debug_assert_ne!(bucket_len, 0);
            if bucket_len >= TREEIFY_THRESHOLD {
                // deliberately outside the bucket lock: if the bucket moved
                // or was already treeified in the meantime, treeify_bucket
                // re-checks and backs off
                self.treeify_bucket(t, i, guard);
            }
            if let Some(old) = old_val {
                return PutOutcome::Replaced {
                    old,
                    // safety: linked into the map under this guard
                    new: unsafe { &**value.deref() },
                };
            }
            break;
        }

        self.update_count(1, Some(bucket_len), guard);
        PutOutcome::Inserted {
            // safety: linked into the map under this guard
            new: unsafe { &**value.deref() },
        }
    }

    fn put_all<I: Iterator<Item = (K, V)>>(&self, iter: I, guard: &Guard<'_>) {
        for (key, value) in iter {
            self.put(key, value, false, guard);
        }
    }

    /// Returns the value for `key`, inserting the result of `init` if the
    /// key has no mapping yet. `init` runs at most once per call, and not
    /// at all if the key is present.
    ///
    /// While `init` runs for an empty bucket, the bucket is claimed by a
    /// reservation; other writers to the same bucket wait for it. `init`
    /// must not touch this map: a re-entrant call that lands in the same
    /// bucket deadlocks.
    pub fn compute_if_absent<'g, F>(
        &'g self,
        key: K,
        init: F,
        guard: &'g Guard<'_>,
    ) -> &'g V
    where
        F: FnOnce(&K) -> V,
    {
        self.check_guard(guard);
        let hash = self.hash(&key);
        let mut key = key;
        // bring init into the shape the reservation path computes with; the
        // current-value argument is always None on the paths that call it
        let mut remap = move |key: &K, _: Option<&V>| Some(init(key));
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut bucket_len;
        loop {
            // safety: as in put
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }
            let t = unsafe { table.deref() };

            let i = t.bucket_index(hash);
            let bucket = t.bucket(i, guard);
            if bucket.is_null() {
                match self.reserve_and_compute(t, i, remap, hash, key, guard) {
                    ReservationOutcome::Computed(value) => {
                        return value.expect("init always produces a value");
                    }
                    ReservationOutcome::Lost {
                        key: lost_key,
                        remap: lost_remap,
                    } => {
                        key = lost_key;
                        remap = lost_remap;
                        continue;
                    }
                }
            }

            let inserted_value;
            match **unsafe { bucket.deref() } {
                BucketEntry::Forward => {
                    table = self.help_resize(table, guard);
                    continue;
                }
                BucketEntry::Reserved(ref reservation) => {
                    drop(reservation.lock.lock());
                    continue;
                }
                BucketEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    bucket_len = 1;
                    let mut p = bucket;
                    inserted_value = loop {
                        // safety: chain reachable under the bucket lock
                        let n = unsafe { p.deref() }.as_node().unwrap();
                        if n.hash == hash && n.key == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            // safety: as in get
                            drop(head_lock);
                            return unsafe { &**current.deref() };
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            let value = remap(&key, None).expect("init always produces a value");
                            let value = Shared::boxed(value, &self.collector);
                            let node = Shared::boxed(
                                BucketEntry::Node(Node::new(hash, key, value)),
                                &self.collector,
                            );
                            n.next.store(node, Ordering::SeqCst);
                            break value;
                        }
                        p = next;
                        bucket_len += 1;
                    };
                    drop(head_lock);
                }
                BucketEntry::Tree(ref tree_bin) => {
                    let head_lock = tree_bin.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    bucket_len = 2;
                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let p = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, &key, guard)
                    };
                    if !p.is_null() {
                        // safety: tree entries live as long as the bin
                        let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                        let current = n.value.load(Ordering::SeqCst, guard);
                        drop(head_lock);
                        // safety: as in get
                        return unsafe { &**current.deref() };
                    }
                    let value = remap(&key, None).expect("init always produces a value");
                    let value = Shared::boxed(value, &self.collector);
                    let existing =
                        tree_bin.find_or_insert(hash, key, value, guard, &self.collector);
                    debug_assert!(
                        existing.is_null(),
                        "the key cannot appear while its bucket is locked"
                    );
                    inserted_value = value;
                    drop(head_lock);
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }

            if bucket_len >= TREEIFY_THRESHOLD {
                self.treeify_bucket(t, i, guard);
            }
            self.update_count(1, Some(bucket_len), guard);
            // safety: linked into the map under this guard
            return unsafe { &**inserted_value.deref() };
        }
    }

    /// If `key` has a value, computes a new mapping for it from the old
    /// one; `remap` returning `None` removes the entry. Returns the value
    /// the key maps to afterwards.
    ///
    /// `remap` runs under the bucket's lock: it runs at most once, but
    /// must not touch this map (see [`compute_if_absent`](Self::compute_if_absent)).
    pub fn compute_if_present<'g, Q, F>(
        &'g self,
        key: &Q,
        remap: F,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.check_guard(guard);
        let hash = self.hash(key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let new_val;
        let mut removed_node = false;
        let bucket_len;
        loop {
            // safety: as in put
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }
            let t = unsafe { table.deref() };

            let i = t.bucket_index(hash);
            let bucket = t.bucket(i, guard);
            if bucket.is_null() {
                // no bucket, no mapping
                return None;
            }

            match **unsafe { bucket.deref() } {
                BucketEntry::Forward => {
                    table = self.help_resize(table, guard);
                    continue;
                }
                BucketEntry::Reserved(ref reservation) => {
                    drop(reservation.lock.lock());
                    continue;
                }
                BucketEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    let mut len = 1;
                    let mut p = bucket;
                    let mut pred: Shared<'_, BucketEntry<K, V>> = Shared::null();
                    new_val = loop {
                        // safety: chain reachable under the bucket lock
                        let n = unsafe { p.deref() }.as_node().unwrap();
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == hash && n.key.borrow() == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            // safety: as in get
                            match remap(&n.key, unsafe { &**current.deref() }) {
                                Some(value) => {
                                    let value = Shared::boxed(value, &self.collector);
                                    let garbage =
                                        n.value.swap(value, Ordering::SeqCst, guard);
                                    // safety: unlinked by the swap
                                    unsafe { guard.retire_shared(garbage) };
                                    // safety: linked under this guard
                                    break Some(unsafe { &**value.deref() });
                                }
                                None => {
                                    removed_node = true;
                                    if !pred.is_null() {
                                        // safety: pred is still in the
                                        // locked chain
                                        unsafe { pred.deref() }
                                            .as_node()
                                            .unwrap()
                                            .next
                                            .store(next, Ordering::SeqCst);
                                    } else {
                                        t.store_bucket(i, next);
                                    }
                                    // safety: both are unlinked now
                                    unsafe {
                                        guard.retire_shared(p);
                                        guard.retire_shared(current);
                                    }
                                    break None;
                                }
                            }
                        }

                        pred = p;
                        if next.is_null() {
                            break None;
                        }
                        p = next;
                        len += 1;
                    };
                    bucket_len = len;
                    drop(head_lock);
                }
                BucketEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    bucket_len = 2;
                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    if root.is_null() {
                        // the bin is being dismantled under this lock
                        new_val = None;
                    } else {
                        let p = TreeNode::find_tree_node(root, hash, key, guard);
                        if p.is_null() {
                            new_val = None;
                        } else {
                            // safety: tree entries live as long as the bin
                            let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                            let current = n.value.load(Ordering::SeqCst, guard);
                            // safety: as in get
                            match remap(&n.key, unsafe { &**current.deref() }) {
                                Some(value) => {
                                    let value = Shared::boxed(value, &self.collector);
                                    let garbage =
                                        n.value.swap(value, Ordering::SeqCst, guard);
                                    // safety: unlinked by the swap
                                    unsafe { guard.retire_shared(garbage) };
                                    // safety: linked under this guard
                                    new_val = Some(unsafe { &**value.deref() });
                                }
                                None => {
                                    removed_node = true;
                                    // safety: we hold the bucket lock and p
                                    // is an element of this bin
                                    let untreeify_needed = unsafe {
                                        tree_bin.remove_tree_node(
                                            p,
                                            true,
                                            guard,
                                            &self.collector,
                                        )
                                    };
                                    if untreeify_needed {
                                        let linear = Self::untreeify(
                                            tree_bin.first.load(Ordering::SeqCst, guard),
                                            guard,
                                            &self.collector,
                                        );
                                        t.store_bucket(i, linear);
                                        // safety: the bin and the removed
                                        // node are unlinked; the values of
                                        // the remaining nodes moved to the
                                        // chain
                                        unsafe {
                                            TreeBin::defer_drop_without_values(bucket, guard);
                                            guard.retire_shared(p);
                                            guard.retire_shared(current);
                                        }
                                    }
                                    new_val = None;
                                }
                            }
                        }
                    }
                    drop(bin_lock);
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }
            break;
        }

        if removed_node {
            self.update_count(-1, Some(bucket_len), guard);
        }
        new_val
    }

    /// Computes a mapping for `key` from its current value, or from `None`
    /// if it has no mapping. `remap` returning `None` removes any existing
    /// entry. Returns the value the key maps to afterwards.
    ///
    /// `remap` runs while the key's bucket is claimed (locked or reserved);
    /// it runs exactly once, and must not touch this map (see
    /// [`compute_if_absent`](Self::compute_if_absent)).
    pub fn compute<'g, F>(&'g self, key: K, remap: F, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        self.check_guard(guard);
        let hash = self.hash(&key);
        let mut key = key;
        let mut remap = remap;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let new_val;
        let mut inserted = false;
        let mut removed = false;
        let bucket_len;
        loop {
            // safety: as in put
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }
            let t = unsafe { table.deref() };

            let i = t.bucket_index(hash);
            let bucket = t.bucket(i, guard);
            if bucket.is_null() {
                match self.reserve_and_compute(t, i, remap, hash, key, guard) {
                    ReservationOutcome::Computed(value) => return value,
                    ReservationOutcome::Lost {
                        key: lost_key,
                        remap: lost_remap,
                    } => {
                        key = lost_key;
                        remap = lost_remap;
                        continue;
                    }
                }
            }

            match **unsafe { bucket.deref() } {
                BucketEntry::Forward => {
                    table = self.help_resize(table, guard);
                    continue;
                }
                BucketEntry::Reserved(ref reservation) => {
                    drop(reservation.lock.lock());
                    continue;
                }
                BucketEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    let mut len = 1;
                    let mut p = bucket;
                    let mut pred: Shared<'_, BucketEntry<K, V>> = Shared::null();
                    new_val = loop {
                        // safety: chain reachable under the bucket lock
                        let n = unsafe { p.deref() }.as_node().unwrap();
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == hash && n.key == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            // safety: as in get
                            match remap(&n.key, Some(unsafe { &**current.deref() })) {
                                Some(value) => {
                                    let value = Shared::boxed(value, &self.collector);
                                    let garbage =
                                        n.value.swap(value, Ordering::SeqCst, guard);
                                    // safety: unlinked by the swap
                                    unsafe { guard.retire_shared(garbage) };
                                    // safety: linked under this guard
                                    break Some(unsafe { &**value.deref() });
                                }
                                None => {
                                    removed = true;
                                    if !pred.is_null() {
                                        // safety: pred is in the locked chain
                                        unsafe { pred.deref() }
                                            .as_node()
                                            .unwrap()
                                            .next
                                            .store(next, Ordering::SeqCst);
                                    } else {
                                        t.store_bucket(i, next);
                                    }
                                    // safety: both unlinked now
                                    unsafe {
                                        guard.retire_shared(p);
                                        guard.retire_shared(current);
                                    }
                                    break None;
                                }
                            }
                        }

                        pred = p;
                        if next.is_null() {
                            // absent: remap decides whether to insert
                            match remap(&key, None) {
                                Some(value) => {
                                    let value = Shared::boxed(value, &self.collector);
                                    let node = Shared::boxed(
                                        BucketEntry::Node(Node::new(hash, key, value)),
                                        &self.collector,
                                    );
                                    n.next.store(node, Ordering::SeqCst);
                                    inserted = true;
                                    // safety: linked under this guard
                                    break Some(unsafe { &**value.deref() });
                                }
                                None => break None,
                            }
                        }
                        p = next;
                        len += 1;
                    };
                    bucket_len = len;
                    drop(head_lock);
                }
                BucketEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    bucket_len = 2;
                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let p = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, &key, guard)
                    };
                    if p.is_null() {
                        match remap(&key, None) {
                            Some(value) => {
                                let value = Shared::boxed(value, &self.collector);
                                let existing = tree_bin
                                    .find_or_insert(hash, key, value, guard, &self.collector);
                                debug_assert!(
                                    existing.is_null(),
                                    "the key cannot appear while its bucket is locked"
                                );
                                inserted = true;
                                // safety: linked under this guard
                                new_val = Some(unsafe { &**value.deref() });
                            }
                            None => new_val = None,
                        }
                    } else {
                        // safety: tree entries live as long as the bin
                        let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                        let current = n.value.load(Ordering::SeqCst, guard);
                        // safety: as in get
                        match remap(&n.key, Some(unsafe { &**current.deref() })) {
                            Some(value) => {
                                let value = Shared::boxed(value, &self.collector);
                                let garbage = n.value.swap(value, Ordering::SeqCst, guard);
                                // safety: unlinked by the swap
                                unsafe { guard.retire_shared(garbage) };
                                // safety: linked under this guard
                                new_val = Some(unsafe { &**value.deref() });
                            }
                            None => {
                                removed = true;
                                // safety: we hold the bucket lock and p is
                                // an element of this bin
                                let untreeify_needed = unsafe {
                                    tree_bin.remove_tree_node(p, true, guard, &self.collector)
                                };
                                if untreeify_needed {
                                    let linear = Self::untreeify(
                                        tree_bin.first.load(Ordering::SeqCst, guard),
                                        guard,
                                        &self.collector,
                                    );
                                    t.store_bucket(i, linear);
                                    // safety: as in compute_if_present
                                    unsafe {
                                        TreeBin::defer_drop_without_values(bucket, guard);
                                        guard.retire_shared(p);
                                        guard.retire_shared(current);
                                    }
                                }
                                new_val = None;
                            }
                        }
                    }
                    drop(bin_lock);
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }
            break;
        }

        if inserted {
            if bucket_len >= TREEIFY_THRESHOLD {
                // safety: the table reference is still protected by guard
                let t = unsafe { table.deref() };
                self.treeify_bucket(t, t.bucket_index(hash), guard);
            }
            self.update_count(1, Some(bucket_len), guard);
        } else if removed {
            self.update_count(-1, Some(bucket_len), guard);
        }
        new_val
    }

    /// Maps `key` to `value` if absent; otherwise combines the current
    /// value with `value` through `remap`, removing the entry if `remap`
    /// returns `None`. Returns the value the key maps to afterwards.
    pub fn merge<'g, F>(
        &'g self,
        key: K,
        value: V,
        remap: F,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V>
    where
        F: FnOnce(&V, V) -> Option<V>,
    {
        self.compute(
            key,
            move |_, current| match current {
                None => Some(value),
                Some(current) => remap(current, value),
            },
            guard,
        )
    }

    /// Claims the empty bucket `i` with a reservation, runs `remap`, and
    /// publishes its result. If the CAS is lost the key is handed back for
    /// a retry. A panicking `remap` restores the empty bucket.
    fn reserve_and_compute<'g, F>(
        &'g self,
        t: &Table<K, V>,
        i: usize,
        remap: F,
        hash: u64,
        key: K,
        guard: &'g Guard<'_>,
    ) -> ReservationOutcome<'g, K, V, F>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        let reservation = Shared::boxed(
            BucketEntry::Reserved(Reservation::default()),
            &self.collector,
        );
        // safety: we just allocated it
        let reservation_ref = unsafe { reservation.deref() }
            .as_reservation()
            .expect("we allocated a reservation");

        // the lock is held from before publication to after replacement,
        // so writers that meet the reservation block, then see its
        // replacement when they re-read the bucket
        let claimed = reservation_ref.lock.lock();
        match t.cas_bucket(i, Shared::null(), reservation, guard) {
            Err(_) => {
                drop(claimed);
                // safety: never published
                drop(unsafe { reservation.into_box() });
                ReservationOutcome::Lost { key, remap }
            }
            Ok(_) => {
                let rollback = ReservationRollback {
                    table: t,
                    index: i,
                    reservation,
                    guard,
                };
                let computed = remap(&key, None);
                match computed {
                    Some(value) => {
                        mem::forget(rollback);
                        let value = Shared::boxed(value, &self.collector);
                        let node = Shared::boxed(
                            BucketEntry::Node(Node::new(hash, key, value)),
                            &self.collector,
                        );
                        t.store_bucket(i, node);
                        // safety: replaced in the bucket; visible only to
                        // guards from before the store
                        unsafe { guard.retire_shared(reservation) };
                        drop(claimed);
                        self.update_count(1, Some(0), guard);
                        // safety: linked under this guard
                        ReservationOutcome::Computed(Some(unsafe { &**value.deref() }))
                    }
                    None => {
                        // no mapping: restore the empty bucket
                        drop(rollback);
                        drop(claimed);
                        ReservationOutcome::Computed(None)
                    }
                }
            }
        }
    }

    /// Removes the entry for `key`, returning its value.
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.replace_or_remove(key, None, |_| true, guard)
            .map(|(_, value)| value)
    }

    /// Removes the entry for `key`, returning the key and value.
    pub fn remove_entry<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.replace_or_remove(key, None, |_| true, guard)
    }

    /// Removes the entry for `key` only if it currently maps to `expected`.
    /// Returns the removed value.
    pub fn remove_if<'g, Q>(
        &'g self,
        key: &Q,
        expected: &V,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        V: PartialEq,
    {
        self.check_guard(guard);
        self.replace_or_remove(key, None, |value| value == expected, guard)
            .map(|(_, value)| value)
    }

    /// Replaces the value for `key` only if the key has some mapping.
    /// Returns the previous value; `None` means no replacement happened.
    pub fn replace<'g, Q>(&'g self, key: &Q, value: V, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.replace_or_remove(key, Some(value), |_| true, guard)
            .map(|(_, previous)| previous)
    }

    /// Replaces the value for `key` only if it currently maps to
    /// `expected`. Returns the previous value if the swap happened.
    pub fn replace_if<'g, Q>(
        &'g self,
        key: &Q,
        expected: &V,
        value: V,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        V: PartialEq,
    {
        self.check_guard(guard);
        self.replace_or_remove(key, Some(value), |current| current == expected, guard)
            .map(|(_, previous)| previous)
    }

    /// The shared traversal for remove/replace: finds the entry for `key`,
    /// checks `condition` against its value, and then either swaps in
    /// `new_value` or unlinks the entry.
    fn replace_or_remove<'g, Q, F>(
        &'g self,
        key: &Q,
        new_value: Option<V>,
        mut condition: F,
        guard: &'g Guard<'_>,
    ) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnMut(&V) -> bool,
    {
        let hash = self.hash(key);
        let is_remove = new_value.is_none();
        let mut new_value = new_value;
        let mut old_val: Option<(&'g K, Shared<'g, V>)> = None;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            if table.is_null() {
                break;
            }
            // safety: as in put
            let t = unsafe { table.deref() };
            if t.is_empty() {
                break;
            }
            let i = t.bucket_index(hash);
            let bucket = t.bucket(i, guard);
            if bucket.is_null() {
                break;
            }

            match **unsafe { bucket.deref() } {
                BucketEntry::Forward => {
                    table = self.help_resize(table, guard);
                    continue;
                }
                BucketEntry::Reserved(ref reservation) => {
                    drop(reservation.lock.lock());
                    continue;
                }
                BucketEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    let mut e = bucket;
                    let mut pred: Shared<'_, BucketEntry<K, V>> = Shared::null();
                    loop {
                        // safety: chain reachable under the bucket lock
                        let n = unsafe { e.deref() }.as_node().unwrap();
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash == hash && n.key.borrow() == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            // safety: as in get
                            if condition(unsafe { &**current.deref() }) {
                                old_val = Some((&n.key, current));
                                if let Some(value) = new_value.take() {
                                    n.value.store(
                                        Shared::boxed(value, &self.collector),
                                        Ordering::SeqCst,
                                    );
                                    break;
                                }
                                if !pred.is_null() {
                                    // safety: pred is in the locked chain
                                    unsafe { pred.deref() }
                                        .as_node()
                                        .unwrap()
                                        .next
                                        .store(next, Ordering::SeqCst);
                                } else {
                                    t.store_bucket(i, next);
                                }
                                // safety: unlinked above; the value is
                                // retired at the bottom of this method
                                unsafe { guard.retire_shared(e) };
                            }
                            break;
                        }
                        pred = e;
                        if next.is_null() {
                            break;
                        }
                        e = next;
                    }
                    drop(head_lock);
                }
                BucketEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    if root.is_null() {
                        // the bin is being dismantled under this lock
                        break;
                    }
                    let p = TreeNode::find_tree_node(root, hash, key, guard);
                    if p.is_null() {
                        break;
                    }
                    // safety: tree entries live as long as the bin
                    let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                    let current = n.value.load(Ordering::SeqCst, guard);
                    // safety: as in get
                    if condition(unsafe { &**current.deref() }) {
                        old_val = Some((&n.key, current));
                        if let Some(value) = new_value.take() {
                            n.value
                                .store(Shared::boxed(value, &self.collector), Ordering::SeqCst);
                        } else {
                            // safety: we hold the bucket lock and p is an
                            // element of this bin; its value is retired at
                            // the bottom of this method
                            let untreeify_needed = unsafe {
                                tree_bin.remove_tree_node(p, false, guard, &self.collector)
                            };
                            if untreeify_needed {
                                let linear = Self::untreeify(
                                    tree_bin.first.load(Ordering::SeqCst, guard),
                                    guard,
                                    &self.collector,
                                );
                                t.store_bucket(i, linear);
                                // safety: as in compute_if_present
                                unsafe {
                                    TreeBin::defer_drop_without_values(bucket, guard);
                                    guard.retire_shared(p);
                                }
                            }
                        }
                    }
                    drop(bin_lock);
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }

            if let Some((key, value)) = old_val {
                if is_remove {
                    self.update_count(-1, None, guard);
                }
                // safety: replaced or unlinked above; only guards from
                // before can still reach it, and ours is one of them
                unsafe { guard.retire_shared(value) };
                return Some((key, unsafe { &**value.deref() }));
            }
            break;
        }
        None
    }

    /// Removes every entry from the map.
    pub fn clear(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        let mut removed: isize = 0;
        let mut i = 0usize;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            if table.is_null() {
                break;
            }
            // safety: as in put
            let t = unsafe { table.deref() };
            if t.is_empty() || i >= t.len() {
                break;
            }
            let bucket = t.bucket(i, guard);
            if bucket.is_null() {
                i += 1;
                continue;
            }
            match **unsafe { bucket.deref() } {
                BucketEntry::Forward => {
                    table = self.help_resize(table, guard);
                    // the table changed shape under us
                    i = 0;
                }
                BucketEntry::Reserved(ref reservation) => {
                    drop(reservation.lock.lock());
                }
                BucketEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }
                    t.store_bucket(i, Shared::null());
                    let mut p = bucket;
                    while !p.is_null() {
                        // safety: the chain is unlinked; we retire it node
                        // by node along with the values
                        let n = unsafe { p.deref() }.as_node().unwrap();
                        let next = n.next.load(Ordering::SeqCst, guard);
                        unsafe {
                            guard.retire_shared(n.value.load(Ordering::SeqCst, guard));
                            guard.retire_shared(p);
                        }
                        removed += 1;
                        p = next;
                    }
                    drop(head_lock);
                    i += 1;
                }
                BucketEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bucket(i, guard) != bucket {
                        continue;
                    }
                    t.store_bucket(i, Shared::null());
                    let mut p = tree_bin.first.load(Ordering::SeqCst, guard);
                    while !p.is_null() {
                        removed += 1;
                        // safety: tree entries live as long as the bin
                        p = unsafe { TreeNode::get_tree_node(p) }
                            .node
                            .next
                            .load(Ordering::SeqCst, guard);
                    }
                    // safety: unlinked above; dropping the bin frees its
                    // nodes and values
                    unsafe { guard.retire_shared(bucket) };
                    drop(bin_lock);
                    i += 1;
                }
                BucketEntry::TreeNode(_) => {
                    unreachable!("a tree node is never the head of a bucket")
                }
            }
        }
        if removed > 0 {
            self.update_count(-removed, None, guard);
        }
    }

    /// Retains only the entries the predicate approves of.
    ///
    /// An entry whose value changes concurrently between the check and the
    /// removal is kept; use [`retain_force`](Self::retain_force) to remove
    /// it regardless.
    pub fn retain<F>(&self, mut f: F, guard: &Guard<'_>)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        for (key, value) in self.iter(guard) {
            if !f(key, value) {
                self.replace_or_remove(key, None, |v| std::ptr::eq(v, value), guard);
            }
        }
    }

    /// Retains only the entries the predicate approves of, removing
    /// rejected keys even if their value changed in the meantime.
    pub fn retain_force<F>(&self, mut f: F, guard: &Guard<'_>)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        for (key, value) in self.iter(guard) {
            if !f(key, value) {
                self.replace_or_remove(key, None, |_| true, guard);
            }
        }
    }
}

enum ReservationOutcome<'g, K, V, F> {
    /// The reservation was installed and the callback ran to completion.
    Computed(Option<&'g V>),
    /// Another writer took the bucket first; the caller retries with the
    /// key and callback handed back.
    Lost { key: K, remap: F },
}

/// Restores an empty bucket if a compute callback panics (or declines to
/// produce a value) while its reservation is installed.
struct ReservationRollback<'a, 'g, 'c, K, V> {
    table: &'a Table<K, V>,
    index: usize,
    reservation: Shared<'g, BucketEntry<K, V>>,
    guard: &'a Guard<'c>,
}

impl<K, V> Drop for ReservationRollback<'_, '_, '_, K, V> {
    fn drop(&mut self) {
        self.table.store_bucket(self.index, Shared::null());
        // safety: the reservation is no longer reachable from the bucket,
        // and only guard-holding threads could have seen it
        unsafe { self.guard.retire_shared(self.reservation) };
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Ord,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.guarded_eq(other, &self.guard(), &other.guard())
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Ord,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Debug for HashMap<K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no outstanding references into the
        // map exist and no thread is mid-operation
        let guard = unsafe { reclaim::unprotected() };

        assert!(
            self.next_table.load(Ordering::Relaxed, &guard).is_null(),
            "a map cannot be dropped mid-resize"
        );
        let table = self.table.swap(Shared::null(), Ordering::Relaxed, &guard);
        if table.is_null() {
            // never even initialized
            return;
        }

        // safety: only we can reach the table now
        let mut table = unsafe { table.into_box() };
        table.drop_buckets();
        // retired-but-unreclaimed garbage is freed when the collector
        // (dropped with self) shuts down
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let guard = self.guard();
        self.put_all(iter.into_iter(), &guard);
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut iter = iter.into_iter();
        let Some(first) = iter.next() else {
            return Self::default();
        };

        let (lower, _) = iter.size_hint();
        let map = Self::with_capacity_and_hasher(lower.saturating_add(1), S::default());
        let guard = map.guard();
        map.put(first.0, first.1, false, &guard);
        map.put_all(iter, &guard);
        drop(guard);
        map
    }
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send + Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        let cloned = Self::with_capacity_and_hasher(self.len(), self.build_hasher.clone());
        {
            let our_guard = self.guard();
            let their_guard = cloned.guard();
            for (key, value) in self.iter(&our_guard) {
                cloned.put(key.clone(), value.clone(), false, &their_guard);
            }
        }
        cloned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_folds_high_bits() {
        let low = 0x0000_0000_dead_beefu64;
        let high = 0xdead_beef_0000_0000u64;
        assert_ne!(spread(low) & 0xffff, spread(low ^ high) & 0xffff);
    }

    #[test]
    fn spread_clears_the_top_bit() {
        assert_eq!(spread(u64::MAX) & !HASH_BITS, 0);
        assert_eq!(spread(1 << 63) & !HASH_BITS, 0);
    }

    #[test]
    fn resize_stamp_is_negative_when_shifted() {
        for n in [1usize, 2, 16, 64, 1 << 20, MAXIMUM_CAPACITY] {
            let stamp = HashMap::<usize, usize>::resize_stamp(n);
            assert!(stamp << RESIZE_STAMP_SHIFT < 0);
        }
    }

    #[test]
    fn resize_stamp_round_trips_through_size_ctl() {
        for n in [16usize, 64, 1 << 12, MAXIMUM_CAPACITY] {
            let stamp = HashMap::<usize, usize>::resize_stamp(n);
            // the initiating thread counts as the first helper
            let sc = (stamp << RESIZE_STAMP_SHIFT) + 2;
            assert!(sc < 0);
            // the stamp is recoverable while helpers come and go
            for helpers in 0..5isize {
                let state = sc + helpers;
                assert_eq!(
                    ((state as usize) >> RESIZE_STAMP_SHIFT) as isize,
                    stamp,
                    "stamp must survive helper-count arithmetic"
                );
            }
            // distinct capacities get distinct stamps
            assert_ne!(stamp, HashMap::<usize, usize>::resize_stamp(n << 1));
        }
    }

    #[test]
    fn reserve_grows_the_table() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();
        map.insert(42, 0, &guard);

        map.reserve(32, &guard);

        let capacity = map.capacity(&guard);
        assert!(capacity >= 16 + 32);
    }

    #[test]
    fn reserve_initializes_an_empty_map() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();

        map.reserve(32, &guard);

        let capacity = map.capacity(&guard);
        assert!(capacity >= 32);
    }

    #[test]
    fn capacity_hint_is_honored() {
        let map = HashMap::<usize, usize>::with_capacity(100);
        let guard = map.guard();
        // 100 elements at a 0.75 load factor need more than 128 buckets
        assert!(map.capacity(&guard) >= 128);
    }
}

#[cfg(test)]
mod tree_bucket_tests {
    use super::*;

    // Everything hashes to bucket zero, so a handful of inserts crosses
    // TREEIFY_THRESHOLD and exercises the tree-bin paths.
    pub(crate) struct ZeroHasher;

    impl Hasher for ZeroHasher {
        fn finish(&self) -> u64 {
            0
        }
        fn write(&mut self, _: &[u8]) {}
    }

    pub(crate) struct ZeroHashBuilder;

    impl BuildHasher for ZeroHashBuilder {
        type Hasher = ZeroHasher;
        fn build_hasher(&self) -> ZeroHasher {
            ZeroHasher
        }
    }

    fn assert_bucket_is_tree(map: &HashMap<usize, usize, ZeroHashBuilder>) {
        let guard = map.guard();
        let table = map.table.load(Ordering::Relaxed, &guard);
        let table = unsafe { table.deref() };
        let bucket = table.bucket(table.bucket_index(0), &guard);
        assert!(
            matches!(**unsafe { bucket.deref() }, BucketEntry::Tree(_)),
            "the collision bucket should have been treeified"
        );
    }

    fn assert_bucket_is_chain(map: &HashMap<usize, usize, ZeroHashBuilder>) {
        let guard = map.guard();
        let table = map.table.load(Ordering::Relaxed, &guard);
        let table = unsafe { table.deref() };
        let bucket = table.bucket(table.bucket_index(0), &guard);
        assert!(
            matches!(**unsafe { bucket.deref() }, BucketEntry::Node(_)),
            "the shrunken bucket should have reverted to a chain"
        );
    }

    #[test]
    fn colliding_inserts_treeify() {
        let map = HashMap::with_hasher(ZeroHashBuilder);
        // stay above MIN_TREEIFY_CAPACITY so insertion treeifies instead
        // of resizing
        {
            let guard = map.guard();
            map.reserve(2 * MIN_TREEIFY_CAPACITY, &guard);
            for i in 0..TREEIFY_THRESHOLD + 2 {
                map.insert(i, i, &guard);
            }
        }
        assert_bucket_is_tree(&map);
        let guard = map.guard();
        for i in 0..TREEIFY_THRESHOLD + 2 {
            assert_eq!(map.get(&i, &guard), Some(&i));
        }
    }

    #[test]
    fn removals_untreeify() {
        let map = HashMap::with_hasher(ZeroHashBuilder);
        {
            let guard = map.guard();
            map.reserve(2 * MIN_TREEIFY_CAPACITY, &guard);
            for i in 0..10 {
                map.insert(i, i, &guard);
            }
        }
        assert_bucket_is_tree(&map);

        {
            let guard = map.guard();
            for i in 0..9 {
                assert_eq!(map.remove(&i, &guard), Some(&i));
            }
        }
        assert_bucket_is_chain(&map);
        assert_eq!(map.len(), 1);

        let guard = map.guard();
        assert_eq!(map.get(&9, &guard), Some(&9));
    }

    #[test]
    fn compute_removals_untreeify() {
        let map = HashMap::with_hasher(ZeroHashBuilder);
        {
            let guard = map.guard();
            map.reserve(2 * MIN_TREEIFY_CAPACITY, &guard);
            for i in 0..10 {
                map.insert(i, i, &guard);
            }
        }
        assert_bucket_is_tree(&map);

        {
            let guard = map.guard();
            for i in 0..9 {
                assert_eq!(map.compute_if_present(&i, |_, _| None, &guard), None);
            }
        }
        assert_bucket_is_chain(&map);

        let guard = map.guard();
        assert_eq!(map.get(&9, &guard), Some(&9));
    }
}
