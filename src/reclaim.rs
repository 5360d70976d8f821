//! Thin wrappers around [`seize`] that give the rest of the crate an
//! `Atomic`/`Shared` pointer vocabulary: guarded loads, compare-exchange over
//! boxed nodes, and explicit retirement of unlinked allocations.

pub(crate) use seize::{Collector, Guard, Linked};

use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::{fmt, ptr};

/// An atomic pointer to a collector-linked allocation.
///
/// All loads that can race with retirement must go through [`Atomic::load`]
/// with a guard from the owning map's collector.
pub(crate) struct Atomic<T>(seize::AtomicPtr<T>);

impl<T> Atomic<T> {
    pub(crate) fn null() -> Self {
        Self(seize::AtomicPtr::default())
    }

    pub(crate) fn load<'g>(&self, ordering: Ordering, guard: &'g Guard<'_>) -> Shared<'g, T> {
        guard.protect(&self.0, ordering).into()
    }

    pub(crate) fn store(&self, new: Shared<'_, T>, ordering: Ordering) {
        self.0.store(new.ptr, ordering);
    }

    pub(crate) fn swap<'g>(
        &self,
        new: Shared<'_, T>,
        ordering: Ordering,
        _: &'g Guard<'_>,
    ) -> Shared<'g, T> {
        self.0.swap(new.ptr, ordering).into()
    }

    pub(crate) fn compare_exchange<'g>(
        &self,
        current: Shared<'_, T>,
        new: Shared<'g, T>,
        success: Ordering,
        failure: Ordering,
        _: &'g Guard<'_>,
    ) -> Result<Shared<'g, T>, CompareExchangeError<'g, T>> {
        match self
            .0
            .compare_exchange(current.ptr, new.ptr, success, failure)
        {
            Ok(ptr) => Ok(ptr.into()),
            Err(current) => Err(CompareExchangeError {
                current: current.into(),
                new,
            }),
        }
    }

    /// Take sole ownership of the allocation behind this pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be valid, and no other thread may still reach the
    /// allocation.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.0.into_inner()) }
    }
}

impl<T> From<Shared<'_, T>> for Atomic<T> {
    fn from(shared: Shared<'_, T>) -> Self {
        Atomic(shared.ptr.into())
    }
}

impl<T> Clone for Atomic<T> {
    fn clone(&self) -> Self {
        Atomic(self.0.load(Ordering::Relaxed).into())
    }
}

impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0.load(Ordering::SeqCst))
    }
}

pub(crate) struct CompareExchangeError<'g, T> {
    pub(crate) current: Shared<'g, T>,
    pub(crate) new: Shared<'g, T>,
}

/// A pointer loaded under a guard; valid for at least the guard's lifetime.
pub(crate) struct Shared<'g, T> {
    ptr: *mut Linked<T>,
    _g: PhantomData<&'g ()>,
}

impl<'g, T> Shared<'g, T> {
    pub(crate) fn null() -> Self {
        Shared::from(ptr::null_mut())
    }

    pub(crate) fn boxed(value: T, collector: &Collector) -> Self {
        Shared::from(collector.link_boxed(value))
    }

    pub(crate) fn as_ptr(&self) -> *mut Linked<T> {
        self.ptr
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Take sole ownership of the allocation.
    ///
    /// # Safety
    ///
    /// The pointer must be valid, and no other thread may still reach the
    /// allocation.
    pub(crate) unsafe fn into_box(self) -> Box<Linked<T>> {
        unsafe { Box::from_raw(self.ptr) }
    }

    /// Dereference, yielding `None` for null.
    ///
    /// # Safety
    ///
    /// All requirements of dereferencing a shared raw pointer apply.
    pub(crate) unsafe fn as_ref(&self) -> Option<&'g Linked<T>> {
        unsafe { self.ptr.as_ref() }
    }

    /// Dereference the pointer.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, and all requirements of dereferencing a
    /// shared raw pointer apply.
    pub(crate) unsafe fn deref(&self) -> &'g Linked<T> {
        unsafe { &*self.ptr }
    }
}

impl<'g, T> PartialEq<Shared<'g, T>> for Shared<'g, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<'_, T> {}

impl<T> Clone for Shared<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<'_, T> {}

impl<T> From<*mut Linked<T>> for Shared<'_, T> {
    fn from(ptr: *mut Linked<T>) -> Self {
        Shared {
            ptr,
            _g: PhantomData,
        }
    }
}

impl<T> From<*const Linked<T>> for Shared<'_, T> {
    fn from(ptr: *const Linked<T>) -> Self {
        Shared::from(ptr as *mut Linked<T>)
    }
}

impl<T> fmt::Debug for Shared<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.ptr)
    }
}

pub(crate) trait RetireShared {
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>);

    unsafe fn retire_shared_with<T>(
        &self,
        shared: Shared<'_, T>,
        reclaim: unsafe fn(seize::Link),
    );
}

impl RetireShared for Guard<'_> {
    /// Queue the allocation for reclamation once all current guards drop.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null and no longer reachable by any thread
    /// that is not currently holding a guard. The current thread must not
    /// touch the allocation after its own guard drops.
    unsafe fn retire_shared<T>(&self, shared: Shared<'_, T>) {
        unsafe { self.retire(shared.ptr, seize::reclaim::boxed::<T>) }
    }

    /// As [`retire_shared`](RetireShared::retire_shared), with a custom
    /// reclaimer for allocations that must not free everything they point to.
    unsafe fn retire_shared_with<T>(
        &self,
        shared: Shared<'_, T>,
        reclaim: unsafe fn(seize::Link),
    ) {
        unsafe { self.retire(shared.ptr, reclaim) }
    }
}

/// A guard that does not protect anything.
///
/// # Safety
///
/// Loads made through this guard may be reclaimed at any point. It is only
/// sound where exclusive access rules out concurrent retirement, i.e. drop
/// code running under `&mut self`.
pub(crate) unsafe fn unprotected() -> Guard<'static> {
    unsafe { Guard::unprotected() }
}

pub(crate) enum GuardRef<'g> {
    Owned(Guard<'g>),
    Ref(&'g Guard<'g>),
}

impl<'g> Deref for GuardRef<'g> {
    type Target = Guard<'g>;

    #[inline]
    fn deref(&self) -> &Guard<'g> {
        match *self {
            GuardRef::Owned(ref guard) | GuardRef::Ref(&ref guard) => guard,
        }
    }
}
