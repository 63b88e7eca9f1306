//! The deferred pointer type.
//!
//! A [`DeferredPtr<T>`] points at an object owned by a [`Heap`]. Unlike
//! `Rc`, it carries no count: liveness is decided by tracing, so cycles
//! of deferred pointers are collected like anything else. Every live
//! pointer is registered with its heap; creation, cloning, and dropping
//! keep the registration current, which is what lets the collector
//! enumerate the pointer graph.
//!
//! # States
//!
//! - **Unattached**: the default and the result of [`DeferredPtr::null`].
//!   Not registered with any heap, and necessarily null.
//! - **Attached**: registered with one specific heap. Once attached, a
//!   pointer stays with that heap (assigning from a pointer into a
//!   different heap is a contract violation), though its value may be
//!   null. A pointer attached to a heap that has been dropped reads as
//!   null and reverts to unattached on the next clone or assignment.
//!
//! # Mutation model
//!
//! Shared access only: `Deref` yields `&T` and payload mutability is
//! interior (`Cell`, `RefCell`), exactly as with `Rc`. Repointing goes
//! through [`DeferredPtr::set`] / [`DeferredPtr::set_null`], which take
//! `&self` so that pointers stored inside heap objects can be re-aimed
//! through a shared reference. During a collection the heap itself nulls
//! unreachable pointers before destroying anything, so a destructor
//! never sees a dangling deferred edge.
//!
//! A pointer living in deferred storage must be moved only by the heap
//! (bytewise relocation through `Cell::replace` or `std::ptr` escapes
//! the registry's view of it and is a contract violation).

use std::cell::RefCell;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Add, AddAssign, Deref, Index, Sub, SubAssign};
use std::ptr;
use std::rc::Rc;

use crate::heap::{HeapState, PtrId};

/// Registration handle: the owning heap and this pointer's id in its
/// registry.
#[derive(Clone)]
pub(crate) struct PtrLink {
    heap: Rc<HeapState>,
    id: PtrId,
}

/// A smart pointer into a [`Heap`](crate::Heap), reclaimed by tracing.
pub struct DeferredPtr<T> {
    /// Interior-mutable so lazy attach works through `&self` on
    /// pointers that live inside heap storage.
    link: RefCell<Option<PtrLink>>,
    _marker: PhantomData<*mut T>,
}

impl<T> DeferredPtr<T> {
    /// An unattached null pointer.
    pub fn null() -> Self {
        Self {
            link: RefCell::new(None),
            _marker: PhantomData,
        }
    }

    /// Register a new pointer to `target` on `state`.
    pub(crate) fn from_target(state: &Rc<HeapState>, target: *mut T) -> Self {
        let id = state.enregister(target.cast());
        Self {
            link: RefCell::new(Some(PtrLink {
                heap: state.clone(),
                id,
            })),
            _marker: PhantomData,
        }
    }

    /// An attached null pointer on `state`.
    pub(crate) fn null_in(state: &Rc<HeapState>) -> Self {
        Self::from_target(state, ptr::null_mut())
    }

    /// Refresh this pointer's recorded location and return its link if
    /// it is attached to a live heap.
    fn live_link(&self) -> Option<PtrLink> {
        let link = self.link.borrow().clone();
        match link {
            Some(l) if !l.heap.is_destroying() => {
                l.heap.note_ptr_location(l.id, self as *const Self as *const u8);
                Some(l)
            }
            _ => None,
        }
    }

    /// The raw target address. Null when the pointer is null, unattached,
    /// or its heap has been dropped.
    pub fn get(&self) -> *mut T {
        match self.live_link() {
            Some(l) => l.heap.target_of(l.id).cast(),
            None => ptr::null_mut(),
        }
    }

    /// Whether the pointer currently reads as null.
    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }

    /// Whether the pointer is registered with a live heap.
    pub fn is_attached(&self) -> bool {
        self.live_link().is_some()
    }

    /// Point this pointer at whatever `source` points at.
    ///
    /// An unattached target attaches to `source`'s heap ("lazy attach").
    /// Assigning from an unattached (or heap-outliving) source nulls the
    /// target without detaching it.
    ///
    /// # Panics
    ///
    /// Panics if both pointers are attached to different live heaps.
    pub fn set(&self, source: &DeferredPtr<T>) {
        let Some(src) = source.live_link() else {
            self.set_null();
            return;
        };
        let target = src.heap.target_of(src.id);

        match self.live_link() {
            Some(dst) => {
                assert!(
                    Rc::ptr_eq(&dst.heap, &src.heap),
                    "cannot assign deferred pointers into different deferred heaps"
                );
                dst.heap.set_target(dst.id, target);
            }
            None => {
                let id = src.heap.enregister(target);
                // Replace the link outright: either there was none, or
                // it referenced a heap that no longer exists.
                *self.link.borrow_mut() = Some(PtrLink {
                    heap: src.heap.clone(),
                    id,
                });
                src.heap
                    .note_ptr_location(id, self as *const Self as *const u8);
            }
        }
    }

    /// Null this pointer. An attached pointer stays attached to its
    /// heap; an unattached pointer is left alone.
    pub fn set_null(&self) {
        if let Some(l) = self.live_link() {
            l.heap.set_target(l.id, ptr::null_mut());
        }
    }

    /// A pointer to a member of the pointee, selected by `select`.
    ///
    /// The result is attached to the same heap and keeps the whole
    /// containing allocation reachable, exactly like the pointer it was
    /// projected from.
    ///
    /// # Panics
    ///
    /// Panics if this pointer is unattached or null, or (in debug
    /// builds) if `select` returns a reference outside the pointee's
    /// allocation.
    pub fn project<U, F>(&self, select: F) -> DeferredPtr<U>
    where
        F: FnOnce(&T) -> &U,
    {
        let link = self
            .live_link()
            .expect("cannot project through an unattached deferred pointer");
        let base = link.heap.target_of(link.id).cast::<T>();
        assert!(
            !base.is_null(),
            "cannot project through a null deferred pointer"
        );
        // SAFETY: non-null attached target; the allocation is kept live
        // by this very pointer.
        let member = select(unsafe { &*base }) as *const U;
        debug_assert!(
            link.heap.same_allocation(base.cast::<u8>(), member.cast::<u8>()),
            "projected member escapes its allocation"
        );
        DeferredPtr::from_target(&link.heap, member.cast_mut())
    }

    /// Reinterpret the pointee type.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the target is a valid `U` for
    /// every later dereference, as with any pointer cast.
    pub unsafe fn cast<U>(&self) -> DeferredPtr<U> {
        match self.live_link() {
            Some(l) => DeferredPtr::from_target(&l.heap, l.heap.target_of(l.id).cast()),
            None => DeferredPtr::null(),
        }
    }

    /// Move this pointer `count` elements within its allocation.
    ///
    /// The pointer must be non-null, and in debug builds both the old
    /// and new addresses must lie inside the same allocation (the
    /// one-past-the-end position counts as inside).
    ///
    /// # Panics
    ///
    /// Panics on a null or unattached pointer, on a zero-sized pointee,
    /// or (in debug builds) when the result leaves the allocation.
    pub fn advance(&self, count: isize) {
        let link = self
            .live_link()
            .expect("pointer arithmetic on an unattached deferred pointer");
        let cur = link.heap.target_of(link.id).cast::<T>();
        assert!(
            !cur.is_null(),
            "pointer arithmetic on a null deferred pointer"
        );
        assert!(
            mem::size_of::<T>() != 0,
            "pointer arithmetic on a zero-sized pointee"
        );
        let new = cur.wrapping_offset(count);
        #[cfg(debug_assertions)]
        assert!(
            link.heap.same_allocation(cur.cast::<u8>(), new.cast::<u8>()),
            "deferred pointer arithmetic left the allocation"
        );
        link.heap.set_target(link.id, new.cast());
    }

    /// A new pointer `count` elements away, with the same checks as
    /// [`DeferredPtr::advance`].
    pub fn offset(&self, count: isize) -> DeferredPtr<T> {
        let moved = self.clone();
        moved.advance(count);
        moved
    }

    /// Distance in elements between two pointers into the same
    /// allocation. Two null pointers compare at distance zero.
    ///
    /// # Panics
    ///
    /// Panics if exactly one side is null, on a zero-sized pointee, or
    /// (in debug builds) when the two pointers are not in the same
    /// allocation.
    pub fn offset_from(&self, other: &DeferredPtr<T>) -> isize {
        let a = self.get();
        let b = other.get();
        if a == b {
            return 0;
        }
        assert!(
            !a.is_null() && !b.is_null(),
            "cannot take the distance to a null deferred pointer"
        );
        assert!(
            mem::size_of::<T>() != 0,
            "pointer arithmetic on a zero-sized pointee"
        );
        #[cfg(debug_assertions)]
        {
            let link = self.live_link().expect("non-null pointer must be attached");
            assert!(
                link.heap.same_allocation(a.cast::<u8>(), b.cast::<u8>()),
                "cannot take the distance between allocations"
            );
        }
        (a as isize - b as isize) / mem::size_of::<T>() as isize
    }
}

impl<T> Default for DeferredPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Clone for DeferredPtr<T> {
    fn clone(&self) -> Self {
        match self.live_link() {
            Some(l) => DeferredPtr::from_target(&l.heap, l.heap.target_of(l.id).cast()),
            // Cloning an unattached pointer, or one whose heap has been
            // torn down, yields an unattached null.
            None => DeferredPtr::null(),
        }
    }
}

impl<T> Drop for DeferredPtr<T> {
    fn drop(&mut self) {
        if let Some(l) = self.link.get_mut().take() {
            // Deregistration is a no-op once the heap enters teardown,
            // so pointers that outlive their heap never touch it.
            l.heap.deregister(l.id);
        }
    }
}

impl<T> Deref for DeferredPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        let p = self.get();
        assert!(!p.is_null(), "attempt to dereference a null deferred pointer");
        // SAFETY: non-null targets are kept live by this pointer's own
        // registration for at least the duration of the borrow.
        unsafe { &*p }
    }
}

impl<T> Index<usize> for DeferredPtr<T> {
    type Output = T;

    fn index(&self, at: usize) -> &T {
        let elem = self.offset(at as isize);
        let p = elem.get();
        // SAFETY: `offset` verified the address stays in the allocation.
        unsafe { &*p }
    }
}

impl<T> AddAssign<isize> for DeferredPtr<T> {
    fn add_assign(&mut self, count: isize) {
        self.advance(count);
    }
}

impl<T> SubAssign<isize> for DeferredPtr<T> {
    fn sub_assign(&mut self, count: isize) {
        self.advance(-count);
    }
}

impl<T> Add<isize> for &DeferredPtr<T> {
    type Output = DeferredPtr<T>;

    fn add(self, count: isize) -> DeferredPtr<T> {
        self.offset(count)
    }
}

impl<T> Sub<isize> for &DeferredPtr<T> {
    type Output = DeferredPtr<T>;

    fn sub(self, count: isize) -> DeferredPtr<T> {
        self.offset(-count)
    }
}

impl<'b, T> Sub<&'b DeferredPtr<T>> for &DeferredPtr<T> {
    type Output = isize;

    fn sub(self, other: &'b DeferredPtr<T>) -> isize {
        self.offset_from(other)
    }
}

impl<T> PartialEq for DeferredPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.get(), other.get())
    }
}

impl<T> Eq for DeferredPtr<T> {}

impl<T> PartialOrd for DeferredPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DeferredPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.get() as usize).cmp(&(other.get() as usize))
    }
}

impl<T> std::fmt::Debug for DeferredPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredPtr")
            .field("target", &self.get())
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_null_is_unattached() {
        let p: DeferredPtr<u32> = DeferredPtr::null();
        assert!(p.is_null());
        assert!(!p.is_attached());
        assert!(p.get().is_null());
    }

    #[test]
    fn test_make_attaches() {
        let heap = Heap::new();
        let p = heap.make(5u32);
        assert!(p.is_attached());
        assert!(!p.is_null());
        assert_eq!(*p, 5);
    }

    #[test]
    fn test_clone_registers_independently() {
        let heap = Heap::new();
        let p = heap.make(5u32);
        let q = p.clone();
        assert_eq!(heap.pointer_count(), 2);
        assert_eq!(p, q);
        drop(p);
        assert_eq!(heap.pointer_count(), 1);
        assert_eq!(*q, 5);
    }

    #[test]
    fn test_set_null_stays_attached() {
        let heap = Heap::new();
        let p = heap.make(5u32);
        p.set_null();
        assert!(p.is_null());
        assert!(p.is_attached());
        // A null attached pointer can be re-aimed within the same heap.
        let q = heap.make(6u32);
        p.set(&q);
        assert_eq!(*p, 6);
    }

    #[test]
    fn test_lazy_attach_on_set() {
        let heap = Heap::new();
        let source = heap.make(9u32);
        let p: DeferredPtr<u32> = DeferredPtr::null();
        assert!(!p.is_attached());
        p.set(&source);
        assert!(p.is_attached());
        assert_eq!(*p, 9);
    }

    #[test]
    fn test_set_from_unattached_nulls_without_detaching() {
        let heap = Heap::new();
        let p = heap.make(5u32);
        p.set(&DeferredPtr::null());
        assert!(p.is_null());
        assert!(p.is_attached());
    }

    #[test]
    #[should_panic(expected = "different deferred heaps")]
    fn test_cross_heap_assignment_is_a_fault() {
        let heap_a = Heap::new();
        let heap_b = Heap::new();
        let a = heap_a.make(1u32);
        let b = heap_b.make(2u32);
        a.set(&b);
    }

    #[test]
    #[should_panic(expected = "dereference a null")]
    fn test_null_deref_is_a_fault() {
        let p: DeferredPtr<u32> = DeferredPtr::null();
        let _ = *p;
    }

    #[test]
    fn test_project_member() {
        struct Pair {
            a: u32,
            b: u64,
        }
        let heap = Heap::new();
        let p = heap.make(Pair { a: 1, b: 2 });
        let pa = p.project(|pair| &pair.a);
        let pb = p.project(|pair| &pair.b);
        assert_eq!(*pa, 1);
        assert_eq!(*pb, 2);
        // Member pointers keep the whole object alive on their own.
        drop(p);
        heap.collect();
        assert_eq!(*pa, 1);
        assert_eq!(*pb, 2);
    }

    #[test]
    fn test_array_arithmetic_walk() {
        let heap = Heap::new();
        let base = heap.make_array::<u32>(4);
        let mut walker = base.clone();
        for i in 0..4 {
            assert_eq!(walker.offset_from(&base), i as isize);
            walker += 1;
        }
        // One past the end is a legal position to hold and compare.
        assert_eq!(walker.offset_from(&base), 4);
        assert!(walker > base);
        walker -= 4;
        assert_eq!(walker, base);
    }

    #[test]
    fn test_subscript_reads_elements() {
        let heap = Heap::new();
        let p = heap.make_array::<u32>(3);
        assert_eq!(p[0], 0);
        assert_eq!(p[2], 0);
    }

    #[test]
    fn test_one_past_end_of_single_object() {
        let heap = Heap::new();
        let p = heap.make(41u64);
        let end = &p + 1;
        assert!(!end.is_null());
        assert_eq!(end.offset_from(&p), 1);
        assert_eq!((&end - &p), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "left the allocation")]
    fn test_escaping_the_allocation_is_a_fault() {
        let heap = Heap::new();
        let p = heap.make_array::<u32>(2);
        let _ = &p + 64;
    }

    #[test]
    fn test_comparisons_follow_address_order() {
        let heap = Heap::new();
        let base = heap.make_array::<u16>(3);
        let second = &base + 1;
        assert!(base < second);
        assert!(second > base);
        assert!(base <= base.clone());
        assert_ne!(base, second);
    }

    #[test]
    fn test_null_pointers_compare_equal() {
        let a: DeferredPtr<u8> = DeferredPtr::null();
        let b: DeferredPtr<u8> = DeferredPtr::null();
        assert_eq!(a, b);
        assert_eq!(a.offset_from(&b), 0);
    }

    #[test]
    fn test_cast_preserves_address() {
        let heap = Heap::new();
        let p = heap.make(0x1234_5678u32);
        // SAFETY: u32 and [u8; 4] have the same size and alignment 1 <= 4.
        let bytes = unsafe { p.cast::<[u8; 4]>() };
        assert_eq!(bytes.get() as usize, p.get() as usize);
    }
}
