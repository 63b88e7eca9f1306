//! Allocator-style adapter over a heap.
//!
//! [`HeapAllocator`] exposes the heap's raw allocate / construct /
//! destroy routines in the shape container implementations expect:
//! `allocate` hands out uninitialized deferred storage, `deallocate` and
//! `destroy` are no-ops (collection reclaims storage, registered
//! destructors run at collection time), and `construct` places a value
//! with the pre-construction destructor flush.
//!
//! The flush is what makes slot reuse sound: a container that pops an
//! element and pushes into the same index reuses a byte range whose
//! destructor has not fired yet. `construct` runs exactly that pending
//! destructor, once, before the new value goes in.
//!
//! Adapters are cheap handles; rebinding to another element type keeps
//! the heap identity, and two adapters compare equal exactly when they
//! target the same heap.

use std::marker::PhantomData;
use std::rc::Rc;

use tracing::debug;

use crate::heap::HeapState;
use crate::page::FindResult;
use crate::ptr::DeferredPtr;

/// An allocator-shaped handle to one [`Heap`](crate::Heap).
pub struct HeapAllocator<T> {
    state: Rc<HeapState>,
    _marker: PhantomData<*mut T>,
}

impl<T> HeapAllocator<T> {
    pub(crate) fn new(state: &Rc<HeapState>) -> Self {
        Self {
            state: state.clone(),
            _marker: PhantomData,
        }
    }

    /// Allocate raw, uninitialized storage for `n` contiguous `T`s.
    ///
    /// Nothing is constructed and no destructor is registered; pair with
    /// [`HeapAllocator::construct`]. Returns an attached null pointer if
    /// the heap's size ceiling denies the allocation.
    pub fn allocate(&self, n: usize) -> DeferredPtr<T> {
        match self.state.allocate_raw::<T>(n) {
            Ok(raw) => DeferredPtr::from_target(&self.state, raw.cast::<T>().as_ptr()),
            Err(err) => {
                debug!(%err, "adapter allocation failed");
                DeferredPtr::null_in(&self.state)
            }
        }
    }

    /// Release storage: deliberately a no-op. Collection reclaims the
    /// allocation once nothing points at it.
    pub fn deallocate(&self, _p: &DeferredPtr<T>, _n: usize) {}

    /// Construct `value` at the slot `p` points to.
    ///
    /// Any destructor still pending for that byte range runs first, then
    /// the value is placed and its own destructor registered.
    ///
    /// # Panics
    ///
    /// Panics if `p` is null or does not point into an allocation of
    /// this adapter's heap.
    pub fn construct(&self, p: &DeferredPtr<T>, value: T) {
        let dest = p.get();
        assert!(
            !dest.is_null(),
            "cannot construct through a null deferred pointer"
        );
        let in_heap = matches!(
            self.state.find_info(dest.cast::<u8>()),
            Some((_, info)) if info.found != FindResult::Unallocated
        );
        assert!(in_heap, "construct target is not allocated in this heap");
        self.state.construct(dest, value);
    }

    /// Destroy the value `p` points to: deliberately a no-op. The
    /// destructor registered at construction runs at collection (or
    /// heap teardown), exactly once.
    pub fn destroy(&self, p: &DeferredPtr<T>) {
        debug_assert!(
            !std::mem::needs_drop::<T>() || self.state.dtor_pending(p.get().cast::<u8>()),
            "destroy target has no registered destructor"
        );
    }

    /// This adapter, retargeted at another element type. The heap
    /// identity carries over.
    pub fn rebind<U>(&self) -> HeapAllocator<U> {
        HeapAllocator {
            state: self.state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for HeapAllocator<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for HeapAllocator<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl<T> Eq for HeapAllocator<T> {}

impl<T> std::fmt::Debug for HeapAllocator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("heap", &Rc::as_ptr(&self.state))
            .finish()
    }
}
