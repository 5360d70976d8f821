//! Weakly-consistent iteration.
//!
//! The traverser walks the bucket array in index order; when it meets a
//! forwarded bucket it descends into the successor table for just the two
//! buckets the old one split into, using a save/restore stack so every
//! bucket is visited exactly once no matter how far the resize has
//! progressed. The sequence reflects some interleaving of concurrent
//! updates, never a torn entry.

use crate::node::{BucketEntry, Node, TreeNode};
use crate::reclaim::{Guard, Linked, Shared};
use crate::table::Table;
use std::fmt;
use std::sync::atomic::Ordering;

pub(crate) struct Traverser<'g, K, V> {
    /// Table currently being scanned; swapped while descending forwards.
    table: Option<&'g Linked<Table<K, V>>>,

    stack: Option<Box<Frame<'g, K, V>>>,
    spare: Option<Box<Frame<'g, K, V>>>,

    /// The entry most recently yielded.
    prev: Option<&'g Node<K, V>>,

    /// Next bucket in the current table.
    index: usize,

    /// Next bucket in the table the traversal started from.
    base_index: usize,

    /// Bound of `base_index`.
    base_limit: usize,

    /// Length of the table the traversal started from.
    base_size: usize,

    guard: &'g Guard<'g>,
}

/// A saved position in an outer table, restored once the forwarded pair of
/// buckets in the successor has been drained.
struct Frame<'g, K, V> {
    length: usize,
    index: usize,
    table: &'g Linked<Table<K, V>>,
    next: Option<Box<Frame<'g, K, V>>>,
}

impl<'g, K, V> Traverser<'g, K, V> {
    pub(crate) fn new(table: Shared<'g, Table<K, V>>, guard: &'g Guard<'g>) -> Self {
        let (table, len) = if table.is_null() {
            (None, 0)
        } else {
            // safety: the table was read under the guard and tables are
            // retired only after they become unreachable
            let table = unsafe { table.deref() };
            (Some(table), table.len())
        };

        Self {
            table,
            stack: None,
            spare: None,
            prev: None,
            index: 0,
            base_index: 0,
            base_limit: len,
            base_size: len,
            guard,
        }
    }

    fn push_state(&mut self, table: &'g Linked<Table<K, V>>, index: usize, length: usize) {
        let mut saved = self.spare.take();
        if let Some(ref mut saved) = saved {
            self.spare = saved.next.take();
        }

        let frame = Frame {
            table,
            length,
            index,
            next: self.stack.take(),
        };

        self.stack = match saved {
            Some(mut saved) => {
                *saved = frame;
                Some(saved)
            }
            None => Some(Box::new(frame)),
        };
    }

    fn recover_state(&mut self, mut length: usize) {
        while let Some(ref mut frame) = self.stack {
            if self.index + frame.length < length {
                // the high half of this split bucket is still unvisited;
                // stay in the inner table and scan it next
                self.index += frame.length;
                break;
            }

            let mut frame = self.stack.take().expect("while let Some");
            length = frame.length;
            self.index = frame.index;
            self.table = Some(frame.table);
            self.stack = frame.next.take();

            frame.next = self.spare.take();
            self.spare = Some(frame);
        }

        if self.stack.is_none() {
            self.index += self.base_size;
            if self.index >= length {
                self.base_index += 1;
                self.index = self.base_index;
            }
        }
    }
}

impl<'g, K, V> Iterator for Traverser<'g, K, V> {
    type Item = &'g Node<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut entry = None;
        if let Some(prev) = self.prev {
            let next = prev.next.load(Ordering::SeqCst, self.guard);
            if !next.is_null() {
                // safety: entries reachable from a live bucket are retired
                // only after the current guard drops
                entry = match **unsafe { next.deref() } {
                    BucketEntry::Node(ref node) => Some(node),
                    BucketEntry::TreeNode(ref tree_node) => Some(&tree_node.node),
                    _ => unreachable!("entry chains link only nodes and tree nodes"),
                };
            }
        }

        loop {
            if let Some(entry) = entry {
                self.prev = Some(entry);
                return Some(entry);
            }

            if self.base_index >= self.base_limit {
                self.prev = None;
                return None;
            }
            let table = match self.table {
                Some(table) if self.index < table.len() => table,
                _ => {
                    self.prev = None;
                    return None;
                }
            };

            let i = self.index;
            let length = table.len();
            let bucket = table.bucket(i, self.guard);
            if !bucket.is_null() {
                // safety: bucket heads are retired only after replacement,
                // and we hold the guard from before the load
                match **unsafe { bucket.deref() } {
                    BucketEntry::Forward => {
                        // descend into the successor table for this bucket,
                        // remembering where to come back to
                        // safety: see Table::next
                        self.table =
                            Some(unsafe { table.next_table(self.guard).deref() });
                        self.prev = None;
                        self.push_state(table, i, length);
                        continue;
                    }
                    BucketEntry::Node(ref node) => {
                        entry = Some(node);
                    }
                    BucketEntry::Tree(ref bin) => {
                        // scan tree bins through their linked list
                        let first = bin.first.load(Ordering::SeqCst, self.guard);
                        if !first.is_null() {
                            // safety: tree entries live at least as long as
                            // their bin, which the guard protects
                            entry = Some(&unsafe { TreeNode::get_tree_node(first) }.node);
                        }
                    }
                    // no mapping yet
                    BucketEntry::Reserved(_) => {}
                    BucketEntry::TreeNode(_) => {
                        unreachable!("a tree node is never the head of a bucket")
                    }
                }
            }

            if self.stack.is_some() {
                self.recover_state(length);
            } else {
                self.index = i + self.base_size;
                if self.index >= length {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            }
        }
    }
}

/// An iterator over a map's entries.
///
/// See [`HashMap::iter`](crate::HashMap::iter) for details.
pub struct Iter<'g, K, V> {
    pub(crate) traverser: Traverser<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.traverser.next()?;
        let value = node.value.load(Ordering::SeqCst, self.guard);
        // safety: values are retired only after their node is unreachable,
        // which cannot precede this guard
        Some((&node.key, unsafe { &**value.deref() }))
    }
}

/// An iterator over a map's keys.
///
/// See [`HashMap::keys`](crate::HashMap::keys) for details.
pub struct Keys<'g, K, V> {
    pub(crate) traverser: Traverser<'g, K, V>,
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.traverser.next()?;
        Some(&node.key)
    }
}

/// An iterator over a map's values.
///
/// See [`HashMap::values`](crate::HashMap::values) for details.
pub struct Values<'g, K, V> {
    pub(crate) traverser: Traverser<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.traverser.next()?;
        let value = node.value.load(Ordering::SeqCst, self.guard);
        // safety: as for Iter
        Some(unsafe { &**value.deref() })
    }
}

impl<K, V> fmt::Debug for Iter<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Iter { .. }")
    }
}

impl<K, V> fmt::Debug for Keys<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Keys { .. }")
    }
}

impl<K, V> fmt::Debug for Values<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Values { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::Collector;

    #[test]
    fn empty_table() {
        let collector = Collector::new();
        let guard = collector.enter();
        let traverser = Traverser::<usize, usize>::new(Shared::null(), &guard);
        assert_eq!(traverser.count(), 0);
    }

    #[test]
    fn unpopulated_buckets() {
        let collector = Collector::new();
        let table = Shared::boxed(Table::<usize, usize>::new(16, &collector), &collector);
        {
            let guard = collector.enter();
            let traverser = Traverser::new(table, &guard);
            assert_eq!(traverser.count(), 0);
        }
        // safety: the table was never shared
        unsafe { table.into_box() }.drop_buckets();
    }

    #[test]
    fn single_bucket() {
        let collector = Collector::new();
        let table = Table::<usize, usize>::new(16, &collector);
        let node = BucketEntry::Node(Node::new(5, 5usize, Shared::boxed(42usize, &collector)));
        table.store_bucket(5, Shared::boxed(node, &collector));
        let table = Shared::boxed(table, &collector);
        {
            let guard = collector.enter();
            let mut traverser = Traverser::new(table, &guard);
            let entry = traverser.next().expect("one entry");
            assert_eq!(entry.key, 5);
            assert!(traverser.next().is_none());
        }
        // safety: the table was never shared
        unsafe { table.into_box() }.drop_buckets();
    }

    #[test]
    fn follows_forwarding() {
        let collector = Collector::new();

        // successor table holding the only entry
        let deep = Table::<usize, usize>::new(32, &collector);
        let node = BucketEntry::Node(Node::new(8, 8usize, Shared::boxed(1usize, &collector)));
        deep.store_bucket(8, Shared::boxed(node, &collector));
        let deep = Shared::boxed(deep, &collector);

        // original table, fully forwarded
        let table = Table::<usize, usize>::new(16, &collector);
        let guard = collector.enter();
        for i in 0..16 {
            let forward = table.forwarder(deep, &guard);
            table.store_bucket(i, forward);
        }
        let table = Shared::boxed(table, &collector);
        {
            let mut traverser = Traverser::new(table, &guard);
            let entry = traverser.next().expect("one entry");
            assert_eq!(entry.key, 8);
            assert!(traverser.next().is_none());
        }
        drop(guard);

        // safety: neither table was shared outside this test
        unsafe {
            table.into_box().drop_buckets();
            deep.into_box().drop_buckets();
        }
    }

    #[test]
    fn spare_frames_are_reused() {
        let collector = Collector::new();
        let guard = collector.enter();
        let table = Table::<usize, usize>::new(4, &collector);
        let table_ref = Shared::boxed(table, &collector);
        {
            let mut traverser = Traverser::<usize, usize>::new(table_ref, &guard);
            // safety: the table is alive for the whole test
            let t = unsafe { table_ref.deref() };
            traverser.push_state(t, 0, 4);
            traverser.recover_state(4);
            assert!(traverser.stack.is_none());
            assert!(traverser.spare.is_some());
        }
        drop(guard);
        // safety: the table was never shared
        unsafe { table_ref.into_box() }.drop_buckets();
    }
}
