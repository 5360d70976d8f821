//! A sharded element counter: a base cell that absorbs uncontended updates,
//! plus a lazily allocated, power-of-two array of spill-over cells once
//! contention is detected. Totals are approximate while writers are active.

use crate::reclaim::{Atomic, Collector, Guard, RetireShared, Shared};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};

/// Source for the first probe of each thread; probes are never zero.
static PROBE_SEED: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static PROBE: Cell<u64> = const { Cell::new(0) };
}

/// This thread's probe value, mapping it to a counter cell.
fn probe() -> u64 {
    PROBE.with(|probe| {
        let mut h = probe.get();
        if h == 0 {
            // splitmix64 step over a global sequence
            let mut z = PROBE_SEED
                .fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
                .wrapping_add(0x9E37_79B9_7F4A_7C15);
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            h = (z ^ (z >> 31)) | 1;
            probe.set(h);
        }
        h
    })
}

/// Picks a different cell for this thread after a collision.
fn advance_probe() {
    PROBE.with(|probe| {
        let mut h = probe.get();
        h ^= h << 13;
        h ^= h >> 17;
        h ^= h << 5;
        probe.set(h);
    });
}

pub(crate) struct Counter {
    base: AtomicIsize,
    // null until the base cell sees contention; doubles up to the number of
    // hardware threads. slots attach lazily and are carried over (not
    // copied) when the array grows, so no increment is ever lost.
    cells: Atomic<Vec<Atomic<AtomicIsize>>>,
    busy: AtomicBool,
}

impl Counter {
    pub(crate) fn new() -> Self {
        Counter {
            base: AtomicIsize::new(0),
            cells: Atomic::null(),
            busy: AtomicBool::new(false),
        }
    }

    pub(crate) fn add(&self, x: isize, collector: &Collector, guard: &Guard<'_>) {
        let cells = self.cells.load(Ordering::SeqCst, guard);
        if cells.is_null() {
            let b = self.base.load(Ordering::SeqCst);
            if self
                .base
                .compare_exchange(b, b + x, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }

        let mut uncontended = true;
        if !cells.is_null() {
            // safety: the cell array is retired only through a guard
            let cells = unsafe { cells.deref() };
            let slot = cells[(cells.len() - 1) & probe() as usize].load(Ordering::SeqCst, guard);
            if !slot.is_null() {
                // safety: cells are freed only when the counter is dropped
                let cell = unsafe { slot.deref() };
                let v = cell.load(Ordering::SeqCst);
                uncontended = cell
                    .compare_exchange(v, v + x, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                if uncontended {
                    return;
                }
            }
        }

        self.accumulate(x, uncontended, collector, guard);
    }

    fn accumulate(&self, x: isize, mut uncontended: bool, collector: &Collector, guard: &Guard<'_>) {
        let mut collide = false;
        loop {
            let cells_ptr = self.cells.load(Ordering::SeqCst, guard);
            if !cells_ptr.is_null() {
                // safety: as in add
                let cells = unsafe { cells_ptr.deref() };
                let n = cells.len();
                let slot = cells[(n - 1) & probe() as usize].load(Ordering::SeqCst, guard);
                if slot.is_null() {
                    if !self.busy.load(Ordering::SeqCst) && self.try_lock() {
                        // attach a new cell, rechecking the slot under the lock
                        let cell = Shared::boxed(AtomicIsize::new(x), collector);
                        let mut created = false;
                        let current = self.cells.load(Ordering::SeqCst, guard);
                        if !current.is_null() {
                            // safety: as in add
                            let current = unsafe { current.deref() };
                            let j = (current.len() - 1) & probe() as usize;
                            if current[j].load(Ordering::SeqCst, guard).is_null() {
                                current[j].store(cell, Ordering::SeqCst);
                                created = true;
                            }
                        }
                        self.unlock();
                        if created {
                            return;
                        }
                        // the slot filled while we allocated; ours was never shared
                        drop(unsafe { cell.into_box() });
                        continue;
                    }
                    collide = false;
                } else if !uncontended {
                    // this probe already failed a CAS; rehash before retrying
                    uncontended = true;
                } else {
                    // safety: as in add
                    let cell = unsafe { slot.deref() };
                    let v = cell.load(Ordering::SeqCst);
                    if cell
                        .compare_exchange(v, v + x, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                    if self.cells.load(Ordering::SeqCst, guard) != cells_ptr
                        || n >= num_cpus::get()
                    {
                        // stale array, or already one cell per hardware thread
                        collide = false;
                    } else if !collide {
                        collide = true;
                    } else if self.try_lock() {
                        if self.cells.load(Ordering::SeqCst, guard) == cells_ptr {
                            // double the array; the cell allocations move over,
                            // so concurrent updates through the old array land
                            // in cells the new array also reaches
                            let mut grown = Vec::with_capacity(n << 1);
                            for slot in cells.iter() {
                                grown.push(Atomic::from(slot.load(Ordering::SeqCst, guard)));
                            }
                            grown.resize_with(n << 1, Atomic::null);
                            let grown = Shared::boxed(grown, collector);
                            let retired = self.cells.swap(grown, Ordering::SeqCst, guard);
                            // safety: unreachable to new readers; current readers
                            // hold guards
                            unsafe { guard.retire_shared(retired) };
                        }
                        self.unlock();
                        collide = false;
                        continue;
                    }
                }
                advance_probe();
            } else if self.cells.load(Ordering::SeqCst, guard).is_null() && self.try_lock() {
                // install the initial pair of cells
                let mut init = false;
                if self.cells.load(Ordering::SeqCst, guard).is_null() {
                    let mut cells = vec![Atomic::null(), Atomic::null()];
                    cells[(probe() & 1) as usize] =
                        Atomic::from(Shared::boxed(AtomicIsize::new(x), collector));
                    self.cells.store(Shared::boxed(cells, collector), Ordering::SeqCst);
                    init = true;
                }
                self.unlock();
                if init {
                    return;
                }
            } else {
                // fall back on the base cell
                let b = self.base.load(Ordering::SeqCst);
                if self
                    .base
                    .compare_exchange(b, b + x, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }

    /// The current total. Concurrent updates may or may not be included;
    /// callers must tolerate stale and transiently negative values.
    pub(crate) fn sum(&self, guard: &Guard<'_>) -> isize {
        let mut sum = self.base.load(Ordering::SeqCst);
        let cells = self.cells.load(Ordering::SeqCst, guard);
        if !cells.is_null() {
            // safety: as in add
            for slot in unsafe { cells.deref() }.iter() {
                let cell = slot.load(Ordering::SeqCst, guard);
                if !cell.is_null() {
                    // safety: as in add
                    sum += unsafe { cell.deref() }.load(Ordering::SeqCst);
                }
            }
        }
        sum
    }

    fn try_lock(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl Drop for Counter {
    fn drop(&mut self) {
        // safety: we have &mut self, so no other thread can touch the cells
        let guard = unsafe { crate::reclaim::unprotected() };
        let cells = self.cells.swap(Shared::null(), Ordering::Relaxed, &guard);
        if cells.is_null() {
            return;
        }
        // the current array reaches every live cell exactly once; retired
        // arrays only ever held a prefix of the same allocations
        let cells = unsafe { cells.into_box() };
        for slot in cells.iter() {
            let cell = slot.load(Ordering::Relaxed, &guard);
            if !cell.is_null() {
                drop(unsafe { cell.into_box() });
            }
        }
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::Collector;

    #[test]
    fn single_threaded_sum() {
        let collector = Collector::new();
        let counter = Counter::new();
        let guard = collector.enter();
        for _ in 0..100 {
            counter.add(1, &collector, &guard);
        }
        counter.add(-25, &collector, &guard);
        assert_eq!(counter.sum(&guard), 75);
    }

    #[test]
    fn concurrent_sum_converges() {
        const THREADS: usize = 8;
        const PER_THREAD: isize = 10_000;

        let collector = Collector::new();
        let counter = Counter::new();
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let guard = collector.enter();
                    for _ in 0..PER_THREAD {
                        counter.add(1, &collector, &guard);
                    }
                });
            }
        });
        let guard = collector.enter();
        assert_eq!(counter.sum(&guard), THREADS as isize * PER_THREAD);
    }

    #[test]
    fn probes_are_nonzero() {
        assert_ne!(super::probe(), 0);
    }
}
