//! The node model: every slot of the table holds one [`BucketEntry`], a
//! tagged union over ordinary chain nodes, tree bins and their tree nodes,
//! the forwarding marker installed during a resize, and the reservation
//! placeholder used by the compute family.

use crate::reclaim::{Atomic, Collector, Guard, Linked, RetireShared, Shared};
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::Thread;

/// The content of one bucket.
///
/// The head of a non-empty bucket is a `Node`, a `Tree`, a `Forward`, or a
/// `Reserved`; `TreeNode` appears only behind a `Tree` head.
pub(crate) enum BucketEntry<K, V> {
    /// A key/value pair, first in a (possibly single-element) chain.
    Node(Node<K, V>),
    /// A red-black tree replacing a long chain.
    Tree(TreeBin<K, V>),
    /// One element of a tree bin.
    TreeNode(TreeNode<K, V>),
    /// The bucket's contents moved to the next table during a resize.
    Forward,
    /// The bucket is claimed while a compute-family callback runs.
    Reserved(Reservation),
}

unsafe impl<K, V> Send for BucketEntry<K, V>
where
    K: Send,
    V: Send,
{
}

unsafe impl<K, V> Sync for BucketEntry<K, V>
where
    K: Sync,
    V: Sync,
{
}

impl<K, V> BucketEntry<K, V> {
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        if let BucketEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    pub(crate) fn as_tree_node(&self) -> Option<&TreeNode<K, V>> {
        if let BucketEntry::TreeNode(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    pub(crate) fn as_tree_bin(&self) -> Option<&TreeBin<K, V>> {
        if let BucketEntry::Tree(ref bin) = *self {
            Some(bin)
        } else {
            None
        }
    }

    pub(crate) fn as_reservation(&self) -> Option<&Reservation> {
        if let BucketEntry::Reserved(ref r) = *self {
            Some(r)
        } else {
            None
        }
    }
}

/// A key/value entry in a chain.
pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BucketEntry<K, V>>,
    /// The lock scoped to this node's bucket while this node is its head.
    pub(crate) lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: Shared<'_, V>) -> Self {
        Self::with_next(hash, key, Atomic::from(value), Atomic::null())
    }

    pub(crate) fn with_next(
        hash: u64,
        key: K,
        value: Atomic<V>,
        next: Atomic<BucketEntry<K, V>>,
    ) -> Self {
        Node {
            hash,
            key,
            value,
            next,
            lock: Mutex::new(()),
        }
    }
}

/// Claims an empty bucket while a compute-family callback runs.
///
/// The claiming thread holds `lock` from before the reservation is published
/// until after it is replaced, so any other writer that encounters it simply
/// blocks on the lock and then retries its bucket read.
#[derive(Default)]
pub(crate) struct Reservation {
    pub(crate) lock: Mutex<()>,
}

/// An element of a tree bin: a chain node plus red-black tree linkage and a
/// `prev` pointer so the traversal list can be unspliced around it.
pub(crate) struct TreeNode<K, V> {
    pub(crate) node: Node<K, V>,
    parent: Atomic<BucketEntry<K, V>>,
    left: Atomic<BucketEntry<K, V>>,
    right: Atomic<BucketEntry<K, V>>,
    pub(crate) prev: Atomic<BucketEntry<K, V>>,
    red: AtomicBool,
}

impl<K, V> TreeNode<K, V> {
    pub(crate) fn new(
        hash: u64,
        key: K,
        value: Atomic<V>,
        next: Atomic<BucketEntry<K, V>>,
        parent: Atomic<BucketEntry<K, V>>,
    ) -> Self {
        TreeNode {
            node: Node::with_next(hash, key, value, next),
            parent,
            left: Atomic::null(),
            right: Atomic::null(),
            prev: Atomic::null(),
            red: AtomicBool::new(false),
        }
    }

    /// View a bucket entry as the tree node it must be.
    ///
    /// # Safety
    ///
    /// `entry` must be non-null and point to a `BucketEntry::TreeNode`. Tree
    /// linkage (`parent`/`left`/`right`/`prev`, and `next` below a `Tree`
    /// head) only ever points at tree nodes, so entries reached through it
    /// satisfy this.
    pub(crate) unsafe fn get_tree_node<'g>(
        entry: Shared<'g, BucketEntry<K, V>>,
    ) -> &'g TreeNode<K, V> {
        unsafe { entry.deref() }
            .as_tree_node()
            .expect("tree linkage points only at tree nodes")
    }
}

impl<K, V> TreeNode<K, V>
where
    K: Ord,
{
    /// Searches the subtree rooted at `from` for the entry with the given
    /// hash and key. Callers must either hold the tree's read lock or have
    /// otherwise excluded restructuring.
    pub(crate) fn find_tree_node<'g, Q>(
        from: Shared<'g, BucketEntry<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        let mut p = from;
        while !p.is_null() {
            // safety: p came from tree linkage read under our guard
            let pn = unsafe { TreeNode::get_tree_node(p) };
            let dir = hash
                .cmp(&pn.node.hash)
                .then_with(|| key.cmp(pn.node.key.borrow()));
            p = match dir {
                cmp::Ordering::Equal => return p,
                cmp::Ordering::Less => pn.left.load(Ordering::SeqCst, guard),
                cmp::Ordering::Greater => pn.right.load(Ordering::SeqCst, guard),
            };
        }
        Shared::null()
    }
}

// lock_state is either 0 (free), WRITER, a multiple of READER (that many
// concurrent tree searches), or a reader count with WAITER set (a writer is
// parked until the count drains).
const WRITER: i64 = 1;
const WAITER: i64 = 2;
const READER: i64 = 4;

/// A red-black tree ordered by (hash, key), plus a doubly-linked list over
/// the same nodes for lock-free linear scans.
///
/// Writers are already serialized by the outer bucket lock; `lock_state`
/// only arbitrates tree restructuring against concurrent tree readers.
/// Readers that find a writer active or queued fall back to the linked list
/// and are therefore never blocked.
pub(crate) struct TreeBin<K, V> {
    pub(crate) root: Atomic<BucketEntry<K, V>>,
    pub(crate) first: Atomic<BucketEntry<K, V>>,
    /// The bucket lock while this bin is a bucket head.
    pub(crate) lock: Mutex<()>,
    lock_state: AtomicI64,
    waiter: Atomic<Thread>,
}

impl<K, V> TreeBin<K, V>
where
    K: Ord,
{
    /// Builds a tree over the given list of freshly allocated, unshared tree
    /// nodes, linked through their `next` pointers.
    pub(crate) fn new(first: Shared<'_, BucketEntry<K, V>>, guard: &Guard<'_>) -> Self {
        let mut root = Shared::null();

        let mut x = first;
        while !x.is_null() {
            // safety: the nodes were just allocated by the caller and are
            // not yet visible to any other thread
            let xn = unsafe { TreeNode::get_tree_node(x) };
            let next = xn.node.next.load(Ordering::Relaxed, guard);
            xn.left.store(Shared::null(), Ordering::Relaxed);
            xn.right.store(Shared::null(), Ordering::Relaxed);

            if root.is_null() {
                xn.parent.store(Shared::null(), Ordering::Relaxed);
                xn.red.store(false, Ordering::Relaxed);
                root = x;
            } else {
                let hash = xn.node.hash;
                let mut p = root;
                loop {
                    let pn = unsafe { TreeNode::get_tree_node(p) };
                    let dir = hash
                        .cmp(&pn.node.hash)
                        .then_with(|| xn.node.key.cmp(&pn.node.key));
                    let child = match dir {
                        cmp::Ordering::Less | cmp::Ordering::Equal => &pn.left,
                        cmp::Ordering::Greater => &pn.right,
                    };
                    let c = child.load(Ordering::Relaxed, guard);
                    if c.is_null() {
                        xn.parent.store(p, Ordering::Relaxed);
                        child.store(x, Ordering::Relaxed);
                        root = Self::balance_insertion(root, x, guard);
                        break;
                    }
                    p = c;
                }
            }
            x = next;
        }

        TreeBin {
            root: Atomic::from(root),
            first: Atomic::from(first),
            lock: Mutex::new(()),
            lock_state: AtomicI64::new(0),
            waiter: Atomic::null(),
        }
    }

    /// Searches for the given key, preferring the tree when no writer is
    /// active or queued and falling back to the linear list otherwise.
    pub(crate) fn find<'g, Q>(
        bin: Shared<'g, BucketEntry<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        // safety: bin was read from a bucket under our guard
        let tree = unsafe { bin.deref() }
            .as_tree_bin()
            .expect("find called on a tree bin");

        let mut element = tree.first.load(Ordering::SeqCst, guard);
        while !element.is_null() {
            let state = tree.lock_state.load(Ordering::SeqCst);
            if state & (WRITER | WAITER) != 0 {
                // a writer holds or awaits the tree; take one step along the
                // list, which restructuring never invalidates
                let tn = unsafe { TreeNode::get_tree_node(element) };
                if tn.node.hash == hash && tn.node.key.borrow() == key {
                    return element;
                }
                element = tn.node.next.load(Ordering::SeqCst, guard);
            } else if tree
                .lock_state
                .compare_exchange(state, state + READER, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let root = tree.root.load(Ordering::SeqCst, guard);
                let p = if root.is_null() {
                    Shared::null()
                } else {
                    TreeNode::find_tree_node(root, hash, key, guard)
                };
                // the last reader out must wake a parked writer
                if tree.lock_state.fetch_sub(READER, Ordering::SeqCst) == (READER | WAITER) {
                    let waiter = tree.waiter.load(Ordering::SeqCst, guard);
                    if !waiter.is_null() {
                        // safety: the waiter is retired only via our guard's
                        // collector, after being unlinked
                        unsafe { waiter.deref() }.unpark();
                    }
                }
                return p;
            }
        }
        Shared::null()
    }

    /// Finds the entry for `key`, or inserts a new one.
    ///
    /// Returns the existing entry, or null if `value` was inserted. The
    /// caller must hold the outer bucket lock.
    pub(crate) fn find_or_insert<'g>(
        &'g self,
        hash: u64,
        key: K,
        value: Shared<'g, V>,
        guard: &'g Guard<'_>,
        collector: &Collector,
    ) -> Shared<'g, BucketEntry<K, V>> {
        let mut p = self.root.load(Ordering::SeqCst, guard);
        if p.is_null() {
            let entry = Shared::boxed(
                BucketEntry::TreeNode(TreeNode::new(
                    hash,
                    key,
                    Atomic::from(value),
                    Atomic::null(),
                    Atomic::null(),
                )),
                collector,
            );
            self.first.store(entry, Ordering::SeqCst);
            self.root.store(entry, Ordering::SeqCst);
            return Shared::null();
        }

        loop {
            // safety: tree entries are only retired together with the bin,
            // which the caller's bucket lock keeps alive
            let pn = unsafe { TreeNode::get_tree_node(p) };
            let dir = match hash
                .cmp(&pn.node.hash)
                .then_with(|| key.cmp(&pn.node.key))
            {
                cmp::Ordering::Equal => return p,
                dir => dir,
            };
            let child = if dir == cmp::Ordering::Less {
                &pn.left
            } else {
                &pn.right
            };
            let c = child.load(Ordering::SeqCst, guard);
            if !c.is_null() {
                p = c;
                continue;
            }

            // attach a leaf, linked at the head of the scan list. attaching
            // does not restructure, so concurrent tree readers stay valid
            // and the write lock is only taken if we have to rebalance.
            let first = self.first.load(Ordering::SeqCst, guard);
            let entry = Shared::boxed(
                BucketEntry::TreeNode(TreeNode::new(
                    hash,
                    key,
                    Atomic::from(value),
                    Atomic::from(first),
                    Atomic::from(p),
                )),
                collector,
            );
            self.first.store(entry, Ordering::SeqCst);
            if !first.is_null() {
                unsafe { TreeNode::get_tree_node(first) }
                    .prev
                    .store(entry, Ordering::SeqCst);
            }
            child.store(entry, Ordering::SeqCst);

            if !pn.red.load(Ordering::SeqCst) {
                unsafe { TreeNode::get_tree_node(entry) }
                    .red
                    .store(true, Ordering::SeqCst);
            } else {
                self.lock_root(guard, collector);
                let root = self.root.load(Ordering::SeqCst, guard);
                let root = Self::balance_insertion(root, entry, guard);
                self.root.store(root, Ordering::SeqCst);
                self.unlock_root();
            }
            return Shared::null();
        }
    }

    /// Unlinks `p` from the bin, splicing tree links rather than moving
    /// node contents, since concurrent list readers hold direct references.
    ///
    /// Returns true if the bin is now too small to stay a tree and should
    /// be untreeified by the caller (in which case `p` and its value are
    /// left for the caller to retire); otherwise retires `p` here, and its
    /// value too when `drop_value` is set.
    ///
    /// # Safety
    ///
    /// The caller must hold the outer bucket lock, and `p` must be an
    /// element of this bin.
    pub(crate) unsafe fn remove_tree_node<'g>(
        &'g self,
        p: Shared<'g, BucketEntry<K, V>>,
        drop_value: bool,
        guard: &'g Guard<'_>,
        collector: &Collector,
    ) -> bool {
        let pn = unsafe { TreeNode::get_tree_node(p) };
        let next = pn.node.next.load(Ordering::SeqCst, guard);
        let prev = pn.prev.load(Ordering::SeqCst, guard);

        // unlink from the scan list
        if prev.is_null() {
            self.first.store(next, Ordering::SeqCst);
        } else {
            unsafe { TreeNode::get_tree_node(prev) }
                .node
                .next
                .store(next, Ordering::SeqCst);
        }
        if !next.is_null() {
            unsafe { TreeNode::get_tree_node(next) }
                .prev
                .store(prev, Ordering::SeqCst);
        }

        if self.first.load(Ordering::SeqCst, guard).is_null() {
            self.root.store(Shared::null(), Ordering::SeqCst);
            return true;
        }

        // structurally too small: root or one of its first two levels is
        // missing a child, so the tree is not worth maintaining
        let root = self.root.load(Ordering::SeqCst, guard);
        let too_small = if root.is_null() {
            true
        } else {
            let r = unsafe { TreeNode::get_tree_node(root) };
            let rl = r.left.load(Ordering::SeqCst, guard);
            r.right.load(Ordering::SeqCst, guard).is_null()
                || rl.is_null()
                || unsafe { TreeNode::get_tree_node(rl) }
                    .left
                    .load(Ordering::SeqCst, guard)
                    .is_null()
        };
        if too_small {
            return true;
        }

        self.lock_root(guard, collector);
        let mut r = root;
        let pl = pn.left.load(Ordering::Relaxed, guard);
        let pr = pn.right.load(Ordering::Relaxed, guard);
        let replacement;
        if !pl.is_null() && !pr.is_null() {
            // interior node: exchange tree links with its successor
            let mut s = pr;
            loop {
                let sl = unsafe { TreeNode::get_tree_node(s) }
                    .left
                    .load(Ordering::Relaxed, guard);
                if sl.is_null() {
                    break;
                }
                s = sl;
            }
            let sn = unsafe { TreeNode::get_tree_node(s) };
            let c = sn.red.load(Ordering::Relaxed);
            sn.red.store(pn.red.load(Ordering::Relaxed), Ordering::Relaxed);
            pn.red.store(c, Ordering::Relaxed);
            let sr = sn.right.load(Ordering::Relaxed, guard);
            let pp = pn.parent.load(Ordering::Relaxed, guard);
            if s == pr {
                pn.parent.store(s, Ordering::Relaxed);
                sn.right.store(p, Ordering::Relaxed);
            } else {
                let sp = sn.parent.load(Ordering::Relaxed, guard);
                pn.parent.store(sp, Ordering::Relaxed);
                if !sp.is_null() {
                    let spn = unsafe { TreeNode::get_tree_node(sp) };
                    if s == spn.left.load(Ordering::Relaxed, guard) {
                        spn.left.store(p, Ordering::Relaxed);
                    } else {
                        spn.right.store(p, Ordering::Relaxed);
                    }
                }
                sn.right.store(pr, Ordering::Relaxed);
                unsafe { TreeNode::get_tree_node(pr) }
                    .parent
                    .store(s, Ordering::Relaxed);
            }
            pn.left.store(Shared::null(), Ordering::Relaxed);
            pn.right.store(sr, Ordering::Relaxed);
            if !sr.is_null() {
                unsafe { TreeNode::get_tree_node(sr) }
                    .parent
                    .store(p, Ordering::Relaxed);
            }
            sn.left.store(pl, Ordering::Relaxed);
            unsafe { TreeNode::get_tree_node(pl) }
                .parent
                .store(s, Ordering::Relaxed);
            sn.parent.store(pp, Ordering::Relaxed);
            if pp.is_null() {
                r = s;
            } else {
                let ppn = unsafe { TreeNode::get_tree_node(pp) };
                if p == ppn.left.load(Ordering::Relaxed, guard) {
                    ppn.left.store(s, Ordering::Relaxed);
                } else {
                    ppn.right.store(s, Ordering::Relaxed);
                }
            }
            replacement = if !sr.is_null() { sr } else { p };
        } else if !pl.is_null() {
            replacement = pl;
        } else if !pr.is_null() {
            replacement = pr;
        } else {
            replacement = p;
        }

        if replacement != p {
            let pp = pn.parent.load(Ordering::Relaxed, guard);
            unsafe { TreeNode::get_tree_node(replacement) }
                .parent
                .store(pp, Ordering::Relaxed);
            if pp.is_null() {
                r = replacement;
            } else {
                let ppn = unsafe { TreeNode::get_tree_node(pp) };
                if p == ppn.left.load(Ordering::Relaxed, guard) {
                    ppn.left.store(replacement, Ordering::Relaxed);
                } else {
                    ppn.right.store(replacement, Ordering::Relaxed);
                }
            }
            pn.left.store(Shared::null(), Ordering::Relaxed);
            pn.right.store(Shared::null(), Ordering::Relaxed);
            pn.parent.store(Shared::null(), Ordering::Relaxed);
        }

        let new_root = if pn.red.load(Ordering::Relaxed) {
            r
        } else {
            Self::balance_deletion(r, replacement, guard)
        };
        self.root.store(new_root, Ordering::SeqCst);

        if p == replacement {
            // p was a leaf; detach it from its parent
            let pp = pn.parent.load(Ordering::Relaxed, guard);
            if !pp.is_null() {
                let ppn = unsafe { TreeNode::get_tree_node(pp) };
                if p == ppn.left.load(Ordering::Relaxed, guard) {
                    ppn.left.store(Shared::null(), Ordering::Relaxed);
                } else if p == ppn.right.load(Ordering::Relaxed, guard) {
                    ppn.right.store(Shared::null(), Ordering::Relaxed);
                }
                pn.parent.store(Shared::null(), Ordering::Relaxed);
            }
        }
        self.unlock_root();

        // p is now unreachable from both the list and the tree
        unsafe {
            if drop_value {
                guard.retire_shared(pn.node.value.load(Ordering::SeqCst, guard));
            }
            guard.retire_shared(p);
        }
        false
    }

    /// Acquires the write lock for tree restructuring.
    fn lock_root(&self, guard: &Guard<'_>, collector: &Collector) {
        if self
            .lock_state
            .compare_exchange(0, WRITER, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            self.contended_lock(guard, collector);
        }
    }

    /// Releases the write lock.
    fn unlock_root(&self) {
        self.lock_state.store(0, Ordering::SeqCst);
    }

    /// Waits out the current readers, parking once the waiter flag is set.
    fn contended_lock(&self, guard: &Guard<'_>, collector: &Collector) {
        let mut waiting = false;
        loop {
            let state = self.lock_state.load(Ordering::SeqCst);
            if state & !WAITER == 0 {
                // no readers left; claim the write lock
                if self
                    .lock_state
                    .compare_exchange(state, WRITER, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    if waiting {
                        let waiter = self.waiter.swap(Shared::null(), Ordering::SeqCst, guard);
                        if !waiter.is_null() {
                            // safety: unlinked above; readers may still hold
                            // it under their guards
                            unsafe { guard.retire_shared(waiter) };
                        }
                    }
                    return;
                }
            } else if state & WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, state | WAITER, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    waiting = true;
                    let this = Shared::boxed(std::thread::current(), collector);
                    let previous = self.waiter.swap(this, Ordering::SeqCst, guard);
                    debug_assert!(previous.is_null());
                }
            } else if waiting {
                std::thread::park();
            }
        }
    }

    fn is_red(p: Shared<'_, BucketEntry<K, V>>) -> bool {
        // safety: only called on tree linkage under the write lock
        !p.is_null() && unsafe { TreeNode::get_tree_node(p) }.red.load(Ordering::Relaxed)
    }

    fn rotate_left<'g>(
        mut root: Shared<'g, BucketEntry<K, V>>,
        p: Shared<'g, BucketEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>> {
        if p.is_null() {
            return root;
        }
        let pn = unsafe { TreeNode::get_tree_node(p) };
        let r = pn.right.load(Ordering::Relaxed, guard);
        if r.is_null() {
            return root;
        }
        let rn = unsafe { TreeNode::get_tree_node(r) };
        let rl = rn.left.load(Ordering::Relaxed, guard);
        pn.right.store(rl, Ordering::Relaxed);
        if !rl.is_null() {
            unsafe { TreeNode::get_tree_node(rl) }
                .parent
                .store(p, Ordering::Relaxed);
        }
        let pp = pn.parent.load(Ordering::Relaxed, guard);
        rn.parent.store(pp, Ordering::Relaxed);
        if pp.is_null() {
            root = r;
            rn.red.store(false, Ordering::Relaxed);
        } else {
            let ppn = unsafe { TreeNode::get_tree_node(pp) };
            if ppn.left.load(Ordering::Relaxed, guard) == p {
                ppn.left.store(r, Ordering::Relaxed);
            } else {
                ppn.right.store(r, Ordering::Relaxed);
            }
        }
        rn.left.store(p, Ordering::Relaxed);
        pn.parent.store(r, Ordering::Relaxed);
        root
    }

    fn rotate_right<'g>(
        mut root: Shared<'g, BucketEntry<K, V>>,
        p: Shared<'g, BucketEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>> {
        if p.is_null() {
            return root;
        }
        let pn = unsafe { TreeNode::get_tree_node(p) };
        let l = pn.left.load(Ordering::Relaxed, guard);
        if l.is_null() {
            return root;
        }
        let ln = unsafe { TreeNode::get_tree_node(l) };
        let lr = ln.right.load(Ordering::Relaxed, guard);
        pn.left.store(lr, Ordering::Relaxed);
        if !lr.is_null() {
            unsafe { TreeNode::get_tree_node(lr) }
                .parent
                .store(p, Ordering::Relaxed);
        }
        let pp = pn.parent.load(Ordering::Relaxed, guard);
        ln.parent.store(pp, Ordering::Relaxed);
        if pp.is_null() {
            root = l;
            ln.red.store(false, Ordering::Relaxed);
        } else {
            let ppn = unsafe { TreeNode::get_tree_node(pp) };
            if ppn.right.load(Ordering::Relaxed, guard) == p {
                ppn.right.store(l, Ordering::Relaxed);
            } else {
                ppn.left.store(l, Ordering::Relaxed);
            }
        }
        ln.right.store(p, Ordering::Relaxed);
        pn.parent.store(l, Ordering::Relaxed);
        root
    }

    fn balance_insertion<'g>(
        mut root: Shared<'g, BucketEntry<K, V>>,
        mut x: Shared<'g, BucketEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>> {
        unsafe { TreeNode::get_tree_node(x) }
            .red
            .store(true, Ordering::Relaxed);

        loop {
            let xn = unsafe { TreeNode::get_tree_node(x) };
            let mut xp = xn.parent.load(Ordering::Relaxed, guard);
            if xp.is_null() {
                xn.red.store(false, Ordering::Relaxed);
                return x;
            }
            if !Self::is_red(xp) {
                return root;
            }
            let mut xpp = unsafe { TreeNode::get_tree_node(xp) }
                .parent
                .load(Ordering::Relaxed, guard);
            if xpp.is_null() {
                return root;
            }
            let xppn = unsafe { TreeNode::get_tree_node(xpp) };
            let xppl = xppn.left.load(Ordering::Relaxed, guard);
            if xp == xppl {
                let xppr = xppn.right.load(Ordering::Relaxed, guard);
                if Self::is_red(xppr) {
                    unsafe { TreeNode::get_tree_node(xppr) }
                        .red
                        .store(false, Ordering::Relaxed);
                    unsafe { TreeNode::get_tree_node(xp) }
                        .red
                        .store(false, Ordering::Relaxed);
                    xppn.red.store(true, Ordering::Relaxed);
                    x = xpp;
                } else {
                    if x == unsafe { TreeNode::get_tree_node(xp) }.right.load(Ordering::Relaxed, guard)
                    {
                        x = xp;
                        root = Self::rotate_left(root, x, guard);
                        xp = unsafe { TreeNode::get_tree_node(x) }
                            .parent
                            .load(Ordering::Relaxed, guard);
                        xpp = if xp.is_null() {
                            Shared::null()
                        } else {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .parent
                                .load(Ordering::Relaxed, guard)
                        };
                    }
                    if !xp.is_null() {
                        unsafe { TreeNode::get_tree_node(xp) }
                            .red
                            .store(false, Ordering::Relaxed);
                        if !xpp.is_null() {
                            unsafe { TreeNode::get_tree_node(xpp) }
                                .red
                                .store(true, Ordering::Relaxed);
                            root = Self::rotate_right(root, xpp, guard);
                        }
                    }
                }
            } else {
                if Self::is_red(xppl) {
                    unsafe { TreeNode::get_tree_node(xppl) }
                        .red
                        .store(false, Ordering::Relaxed);
                    unsafe { TreeNode::get_tree_node(xp) }
                        .red
                        .store(false, Ordering::Relaxed);
                    xppn.red.store(true, Ordering::Relaxed);
                    x = xpp;
                } else {
                    if x == unsafe { TreeNode::get_tree_node(xp) }.left.load(Ordering::Relaxed, guard)
                    {
                        x = xp;
                        root = Self::rotate_right(root, x, guard);
                        xp = unsafe { TreeNode::get_tree_node(x) }
                            .parent
                            .load(Ordering::Relaxed, guard);
                        xpp = if xp.is_null() {
                            Shared::null()
                        } else {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .parent
                                .load(Ordering::Relaxed, guard)
                        };
                    }
                    if !xp.is_null() {
                        unsafe { TreeNode::get_tree_node(xp) }
                            .red
                            .store(false, Ordering::Relaxed);
                        if !xpp.is_null() {
                            unsafe { TreeNode::get_tree_node(xpp) }
                                .red
                                .store(true, Ordering::Relaxed);
                            root = Self::rotate_left(root, xpp, guard);
                        }
                    }
                }
            }
        }
    }

    fn balance_deletion<'g>(
        mut root: Shared<'g, BucketEntry<K, V>>,
        mut x: Shared<'g, BucketEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, BucketEntry<K, V>> {
        loop {
            if x.is_null() || x == root {
                return root;
            }
            let xn = unsafe { TreeNode::get_tree_node(x) };
            let mut xp = xn.parent.load(Ordering::Relaxed, guard);
            if xp.is_null() {
                xn.red.store(false, Ordering::Relaxed);
                return x;
            }
            if xn.red.load(Ordering::Relaxed) {
                xn.red.store(false, Ordering::Relaxed);
                return root;
            }
            let xpn = unsafe { TreeNode::get_tree_node(xp) };
            let xpl = xpn.left.load(Ordering::Relaxed, guard);
            if xpl == x {
                let mut xpr = xpn.right.load(Ordering::Relaxed, guard);
                if Self::is_red(xpr) {
                    unsafe { TreeNode::get_tree_node(xpr) }
                        .red
                        .store(false, Ordering::Relaxed);
                    xpn.red.store(true, Ordering::Relaxed);
                    root = Self::rotate_left(root, xp, guard);
                    xp = unsafe { TreeNode::get_tree_node(x) }
                        .parent
                        .load(Ordering::Relaxed, guard);
                    xpr = if xp.is_null() {
                        Shared::null()
                    } else {
                        unsafe { TreeNode::get_tree_node(xp) }
                            .right
                            .load(Ordering::Relaxed, guard)
                    };
                }
                if xpr.is_null() {
                    x = xp;
                } else {
                    let xprn = unsafe { TreeNode::get_tree_node(xpr) };
                    let sl = xprn.left.load(Ordering::Relaxed, guard);
                    let sr = xprn.right.load(Ordering::Relaxed, guard);
                    if !Self::is_red(sr) && !Self::is_red(sl) {
                        xprn.red.store(true, Ordering::Relaxed);
                        x = xp;
                    } else {
                        if !Self::is_red(sr) {
                            if !sl.is_null() {
                                unsafe { TreeNode::get_tree_node(sl) }
                                    .red
                                    .store(false, Ordering::Relaxed);
                            }
                            xprn.red.store(true, Ordering::Relaxed);
                            root = Self::rotate_right(root, xpr, guard);
                            xp = unsafe { TreeNode::get_tree_node(x) }
                                .parent
                                .load(Ordering::Relaxed, guard);
                            xpr = if xp.is_null() {
                                Shared::null()
                            } else {
                                unsafe { TreeNode::get_tree_node(xp) }
                                    .right
                                    .load(Ordering::Relaxed, guard)
                            };
                        }
                        if !xpr.is_null() {
                            let xprn = unsafe { TreeNode::get_tree_node(xpr) };
                            let red = if xp.is_null() {
                                false
                            } else {
                                unsafe { TreeNode::get_tree_node(xp) }.red.load(Ordering::Relaxed)
                            };
                            xprn.red.store(red, Ordering::Relaxed);
                            let sr = xprn.right.load(Ordering::Relaxed, guard);
                            if !sr.is_null() {
                                unsafe { TreeNode::get_tree_node(sr) }
                                    .red
                                    .store(false, Ordering::Relaxed);
                            }
                        }
                        if !xp.is_null() {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .red
                                .store(false, Ordering::Relaxed);
                            root = Self::rotate_left(root, xp, guard);
                        }
                        x = root;
                    }
                }
            } else {
                let mut xpl = xpl;
                if Self::is_red(xpl) {
                    unsafe { TreeNode::get_tree_node(xpl) }
                        .red
                        .store(false, Ordering::Relaxed);
                    xpn.red.store(true, Ordering::Relaxed);
                    root = Self::rotate_right(root, xp, guard);
                    xp = unsafe { TreeNode::get_tree_node(x) }
                        .parent
                        .load(Ordering::Relaxed, guard);
                    xpl = if xp.is_null() {
                        Shared::null()
                    } else {
                        unsafe { TreeNode::get_tree_node(xp) }
                            .left
                            .load(Ordering::Relaxed, guard)
                    };
                }
                if xpl.is_null() {
                    x = xp;
                } else {
                    let xpln = unsafe { TreeNode::get_tree_node(xpl) };
                    let sl = xpln.left.load(Ordering::Relaxed, guard);
                    let sr = xpln.right.load(Ordering::Relaxed, guard);
                    if !Self::is_red(sl) && !Self::is_red(sr) {
                        xpln.red.store(true, Ordering::Relaxed);
                        x = xp;
                    } else {
                        if !Self::is_red(sl) {
                            if !sr.is_null() {
                                unsafe { TreeNode::get_tree_node(sr) }
                                    .red
                                    .store(false, Ordering::Relaxed);
                            }
                            xpln.red.store(true, Ordering::Relaxed);
                            root = Self::rotate_left(root, xpl, guard);
                            xp = unsafe { TreeNode::get_tree_node(x) }
                                .parent
                                .load(Ordering::Relaxed, guard);
                            xpl = if xp.is_null() {
                                Shared::null()
                            } else {
                                unsafe { TreeNode::get_tree_node(xp) }
                                    .left
                                    .load(Ordering::Relaxed, guard)
                            };
                        }
                        if !xpl.is_null() {
                            let xpln = unsafe { TreeNode::get_tree_node(xpl) };
                            let red = if xp.is_null() {
                                false
                            } else {
                                unsafe { TreeNode::get_tree_node(xp) }.red.load(Ordering::Relaxed)
                            };
                            xpln.red.store(red, Ordering::Relaxed);
                            let sl = xpln.left.load(Ordering::Relaxed, guard);
                            if !sl.is_null() {
                                unsafe { TreeNode::get_tree_node(sl) }
                                    .red
                                    .store(false, Ordering::Relaxed);
                            }
                        }
                        if !xp.is_null() {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .red
                                .store(false, Ordering::Relaxed);
                            root = Self::rotate_right(root, xp, guard);
                        }
                        x = root;
                    }
                }
            }
        }
    }
}

impl<K, V> TreeBin<K, V> {
    /// Retires this bin without freeing the values its nodes point to,
    /// for when the values were re-linked into a replacement bin.
    ///
    /// # Safety
    ///
    /// The bin must no longer be reachable from the table, and its values
    /// must remain owned elsewhere.
    pub(crate) unsafe fn defer_drop_without_values<'g>(
        bin: Shared<'g, BucketEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        unsafe { guard.retire_shared_with(bin, Self::drop_without_values) };
    }

    unsafe fn drop_without_values(mut link: seize::Link) {
        // safety: the reclaimer is invoked once the retired allocation is
        // no longer reachable by any guard-holding thread
        let entry = unsafe { Box::from_raw(link.cast::<BucketEntry<K, V>>()) };
        match Linked::into_inner(*entry) {
            BucketEntry::Tree(mut bin) => unsafe { bin.release_entries(false) },
            _ => unreachable!("retired through the tree-bin reclaimer"),
        }
    }

    /// Frees a list of tree entries that was built but never published.
    ///
    /// # Safety
    ///
    /// No other thread may have seen the entries.
    pub(crate) unsafe fn drop_unpublished<'g>(
        mut entry: Shared<'g, BucketEntry<K, V>>,
        drop_values: bool,
        guard: &'g Guard<'_>,
    ) {
        while !entry.is_null() {
            let boxed = unsafe { entry.into_box() };
            let tree_node = match Linked::into_inner(*boxed) {
                BucketEntry::TreeNode(tree_node) => tree_node,
                _ => unreachable!("unpublished tree lists contain only tree nodes"),
            };
            if drop_values {
                let value = tree_node.node.value.load(Ordering::Relaxed, guard);
                if !value.is_null() {
                    drop(unsafe { value.into_box() });
                }
            }
            entry = tree_node.node.next.load(Ordering::Relaxed, guard);
        }
    }

    /// Frees the scan list, and the values too when `drop_values` is set.
    ///
    /// # Safety
    ///
    /// Requires exclusive access to the bin (drop, or a reclaimer).
    unsafe fn release_entries(&mut self, drop_values: bool) {
        // safety: exclusive access per this function's contract
        let guard = unsafe { crate::reclaim::unprotected() };
        self.root.store(Shared::null(), Ordering::Relaxed);
        let mut entry = self.first.swap(Shared::null(), Ordering::Relaxed, &guard);
        while !entry.is_null() {
            let boxed = unsafe { entry.into_box() };
            let tree_node = match Linked::into_inner(*boxed) {
                BucketEntry::TreeNode(tree_node) => tree_node,
                _ => unreachable!("tree scan lists contain only tree nodes"),
            };
            if drop_values {
                let value = tree_node.node.value.load(Ordering::Relaxed, &guard);
                if !value.is_null() {
                    drop(unsafe { value.into_box() });
                }
            }
            entry = tree_node.node.next.load(Ordering::Relaxed, &guard);
        }
        let waiter = self.waiter.swap(Shared::null(), Ordering::Relaxed, &guard);
        if !waiter.is_null() {
            drop(unsafe { waiter.into_box() });
        }
    }
}

impl<K, V> Drop for TreeBin<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self
        unsafe { self.release_entries(true) };
    }
}
