//! The deferred heap: pages, pointer registry, and the collector.
//!
//! A [`Heap`] is an isolated bubble of memory. Objects created through
//! [`Heap::make`] live in the heap's [`Page`]s and refer to each other
//! through [`DeferredPtr`]s; nothing is reclaimed until [`Heap::collect`]
//! traces the live graph, or the heap itself is dropped.
//!
//! # Registry
//!
//! Every live pointer is registered with its heap under a small integer
//! id; the registry entry carries the pointer's target, its last observed
//! own address, and its mark level. A pointer whose own storage lies
//! outside every page is a *root*; one living inside a page is an
//! *interior* pointer, listed with that page so the collector can walk
//! references between heap objects. The distinction is purely by
//! address, refreshed on every pointer operation, so a container whose
//! buffer lives in the heap gets interior registration for its elements
//! without any special casing.
//!
//! # Collection
//!
//! `collect` runs five steps, strictly ordered:
//!
//! 1. Clear per-page mark bitmaps and interior mark levels.
//! 2. Mark breadth-first: roots first, then interior pointers by
//!    increasing distance, until a pass marks nothing.
//! 3. Null every unreachable interior pointer.
//! 4. Sweep: run pending destructors for each unreachable allocation,
//!    then return its locations to the page.
//! 5. Drop pages that ended up empty.
//!
//! Step 3 before step 4 is load-bearing: a destructor can never observe
//! a sibling object that is also condemned, because every pointer to it
//! already reads null. There is no finalizer concept and no
//! resurrection; destructors run once, with their outgoing edges cut.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::bitset::BitSet;
use crate::config::HeapConfig;
use crate::dtor::{self, DestructorTable};
use crate::error::AllocationError;
use crate::page::{ContainsInfo, FindResult, Page};
use crate::ptr::DeferredPtr;

/// Identifier of one registered pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PtrId(u64);

/// Identifier of one page; stable across page removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageId(u64);

/// Where a registered pointer's own storage was last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Outside every page (or not yet observed): tracked in the root set.
    Root,
    /// Inside the buffer of the identified page.
    Interior(PageId),
}

/// Registry entry for one live pointer.
struct PtrEntry {
    /// Address of the pointee; null for a null pointer.
    target: *mut u8,
    /// Last observed address of the pointer's own storage; null until
    /// first observed. Only interior placements rely on this value.
    self_addr: *const u8,
    placement: Placement,
    /// BFS distance from a root in the current collection; 0 = unreached.
    level: usize,
}

/// One page plus its per-collection tracing state.
struct PageEntry {
    id: PageId,
    page: Page,
    /// Allocation starts proven reachable in the current collection.
    live_starts: BitSet,
    /// Registered pointers whose own storage lies in this page.
    interior: Vec<PtrId>,
}

/// Shared state behind a [`Heap`] and all its pointers.
///
/// Pointers hold this through an `Rc`, so the state outlives the `Heap`
/// wrapper; after teardown the `destroying` flag makes every surviving
/// pointer read as null without touching freed storage.
pub(crate) struct HeapState {
    config: HeapConfig,
    pages: RefCell<Vec<PageEntry>>,
    roots: RefCell<HashSet<PtrId>>,
    ptrs: RefCell<HashMap<u64, PtrEntry>>,
    dtors: RefCell<DestructorTable>,
    next_ptr_id: Cell<u64>,
    next_page_id: Cell<u64>,
    /// Set at the start of teardown; never cleared.
    destroying: Cell<bool>,
    /// Guards against re-entering the collector from a destructor.
    collecting: Cell<bool>,
    collect_before_expand: Cell<bool>,
}

impl HeapState {
    fn new(config: HeapConfig) -> Self {
        Self {
            config,
            pages: RefCell::new(Vec::new()),
            roots: RefCell::new(HashSet::new()),
            ptrs: RefCell::new(HashMap::new()),
            dtors: RefCell::new(DestructorTable::new()),
            next_ptr_id: Cell::new(1),
            next_page_id: Cell::new(1),
            destroying: Cell::new(false),
            collecting: Cell::new(false),
            collect_before_expand: Cell::new(config.collect_before_expand),
        }
    }

    pub(crate) fn is_destroying(&self) -> bool {
        self.destroying.get()
    }

    // ── Pointer registry ─────────────────────────────────────────────

    /// Register a new pointer with the given target. The pointer's own
    /// address is not yet known; until observed it is conservatively a
    /// root.
    ///
    /// # Panics
    ///
    /// Panics if the heap is being destroyed: a destructor running at
    /// teardown must not mint pointers into the dying heap.
    pub(crate) fn enregister(&self, target: *mut u8) -> PtrId {
        assert!(
            !self.destroying.get(),
            "cannot register a deferred pointer on a heap that is being destroyed"
        );
        let id = PtrId(self.next_ptr_id.get());
        self.next_ptr_id.set(id.0 + 1);
        self.ptrs.borrow_mut().insert(
            id.0,
            PtrEntry {
                target,
                self_addr: ptr::null(),
                placement: Placement::Root,
                level: 0,
            },
        );
        self.roots.borrow_mut().insert(id);
        id
    }

    /// Drop a pointer's registration.
    ///
    /// Skipped during teardown (the whole registry is about to go).
    ///
    /// # Panics
    ///
    /// Panics if the pointer is not registered.
    pub(crate) fn deregister(&self, id: PtrId) {
        if self.destroying.get() {
            return;
        }
        let entry = self
            .ptrs
            .borrow_mut()
            .remove(&id.0)
            .expect("attempt to deregister an unregistered deferred pointer");
        match entry.placement {
            Placement::Root => {
                let removed = self.roots.borrow_mut().remove(&id);
                assert!(removed, "root pointer missing from the root set");
            }
            Placement::Interior(page_id) => {
                self.remove_interior(page_id, id);
            }
        }
    }

    /// Record the current address of a pointer's own storage and
    /// reclassify it as root or interior accordingly.
    ///
    /// Called from every pointer operation. Rust moves are invisible, so
    /// this lazy refresh is what keeps the registry's placement current:
    /// a pointer residing in a page can only be reached through
    /// operations that pass through here, and a pointer that has moved
    /// around the stack is still (correctly) a root wherever it lands.
    pub(crate) fn note_ptr_location(&self, id: PtrId, addr: *const u8) {
        if self.destroying.get() {
            return;
        }
        {
            let ptrs = self.ptrs.borrow();
            let entry = ptrs
                .get(&id.0)
                .expect("location note for an unregistered deferred pointer");
            if entry.self_addr == addr {
                return;
            }
        }

        let new_placement = match self.page_of(addr) {
            Some(page_id) => Placement::Interior(page_id),
            None => Placement::Root,
        };

        let mut ptrs = self.ptrs.borrow_mut();
        let entry = ptrs.get_mut(&id.0).expect("registry entry vanished");
        let old_placement = entry.placement;
        entry.self_addr = addr;
        entry.placement = new_placement;
        entry.level = 0;
        drop(ptrs);

        if old_placement == new_placement {
            return;
        }
        match old_placement {
            Placement::Root => {
                self.roots.borrow_mut().remove(&id);
            }
            Placement::Interior(page_id) => self.remove_interior(page_id, id),
        }
        match new_placement {
            Placement::Root => {
                self.roots.borrow_mut().insert(id);
            }
            Placement::Interior(page_id) => {
                let mut pages = self.pages.borrow_mut();
                if let Some(entry) = pages.iter_mut().find(|p| p.id == page_id) {
                    entry.interior.push(id);
                }
            }
        }
    }

    /// Current target of a registered pointer; null once the heap is
    /// torn down.
    pub(crate) fn target_of(&self, id: PtrId) -> *mut u8 {
        if self.destroying.get() {
            return ptr::null_mut();
        }
        self.ptrs
            .borrow()
            .get(&id.0)
            .expect("target read for an unregistered deferred pointer")
            .target
    }

    /// Repoint a registered pointer.
    pub(crate) fn set_target(&self, id: PtrId, target: *mut u8) {
        if self.destroying.get() {
            return;
        }
        self.ptrs
            .borrow_mut()
            .get_mut(&id.0)
            .expect("target write for an unregistered deferred pointer")
            .target = target;
    }

    fn remove_interior(&self, page_id: PageId, id: PtrId) {
        let mut pages = self.pages.borrow_mut();
        let Some(entry) = pages.iter_mut().find(|p| p.id == page_id) else {
            // The page was dropped after a collection emptied it; its
            // interior list went with it.
            return;
        };
        // Newer pointers die sooner, so scan from the back.
        let at = entry
            .interior
            .iter()
            .rposition(|&p| p == id)
            .expect("interior pointer missing from its page's list");
        entry.interior.swap_remove(at);
    }

    /// Id of the page whose buffer contains `addr`, if any.
    fn page_of(&self, addr: *const u8) -> Option<PageId> {
        self.pages
            .borrow()
            .iter()
            .find(|entry| entry.page.contains(addr))
            .map(|entry| entry.id)
    }

    /// Page id and classification for `addr`, if any page contains it.
    pub(crate) fn find_info(&self, addr: *const u8) -> Option<(PageId, ContainsInfo)> {
        self.pages.borrow().iter().find_map(|entry| {
            let info = entry.page.contains_info(addr);
            (info.found != FindResult::NotInRange).then_some((entry.id, info))
        })
    }

    /// Whether a destructor is pending for exactly this address.
    pub(crate) fn dtor_pending(&self, addr: *const u8) -> bool {
        self.dtors.borrow().is_stored(addr)
    }

    /// Whether `a` and `b` lie in the same allocation of the same page.
    /// Used by checked pointer arithmetic and projection.
    pub(crate) fn same_allocation(&self, a: *const u8, b: *const u8) -> bool {
        let Some((page_a, info_a)) = self.find_info(a) else {
            return false;
        };
        let Some((page_b, info_b)) = self.find_info(b) else {
            return false;
        };
        page_a == page_b
            && info_a.found != FindResult::Unallocated
            && info_b.found != FindResult::Unallocated
            && info_a.start_location == info_b.start_location
    }

    // ── Allocation ───────────────────────────────────────────────────

    /// Raw storage for `n` contiguous `T`s: try existing pages, then
    /// collect if so configured, then grow.
    pub(crate) fn allocate_raw<T>(&self, n: usize) -> Result<NonNull<u8>, AllocationError> {
        assert!(n > 0, "cannot request an empty allocation");
        assert!(
            !self.destroying.get(),
            "cannot allocate on a heap that is being destroyed"
        );
        let layout = Layout::array::<T>(n).expect("allocation size overflows");

        if let Some(p) = self.allocate_from_existing(layout) {
            return Ok(p);
        }

        if self.collect_before_expand.get() && !self.collecting.get() {
            self.collect();
            if let Some(p) = self.allocate_from_existing(layout) {
                return Ok(p);
            }
        }

        self.grow_for::<T>(layout)?;
        let p = self
            .allocate_from_existing(layout)
            .expect("freshly sized page failed to satisfy its allocation");
        Ok(p)
    }

    fn allocate_from_existing(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut pages = self.pages.borrow_mut();
        let collecting = self.collecting.get();
        for entry in pages.iter_mut() {
            if let Some(p) = entry.page.allocate(layout) {
                if collecting {
                    // An allocation made by a destructor mid-sweep must
                    // not be condemned by the rest of the pass.
                    let start = entry.page.contains_info(p.as_ptr()).start_location;
                    entry.live_starts.set(start, true);
                }
                return Some(p);
            }
        }
        None
    }

    /// Append a page sized for the failed request.
    fn grow_for<T>(&self, layout: Layout) -> Result<(), AllocationError> {
        let chunk = std::mem::size_of::<T>().max(self.config.min_chunk_bytes);
        let desired = layout
            .size()
            .saturating_mul(3)
            .max(self.config.min_page_bytes);
        // The page rounds its size up to a chunk multiple; mirror that
        // here so the ceiling check is exact.
        let effective = desired.div_ceil(chunk).saturating_mul(chunk);

        if let Some(limit) = self.config.max_heap_bytes {
            let current = self.page_bytes();
            if current.saturating_add(effective) > limit {
                return Err(AllocationError::LimitExceeded {
                    requested: layout.size(),
                    current,
                    limit,
                });
            }
        }

        let page = Page::new(desired, chunk);
        let locations = page.locations();
        let id = PageId(self.next_page_id.get());
        self.next_page_id.set(id.0 + 1);
        debug!(
            page = id.0,
            bytes = page.size(),
            chunk_bytes = chunk,
            "appending page"
        );
        self.pages.borrow_mut().push(PageEntry {
            id,
            page,
            live_starts: BitSet::new(locations, false),
            interior: Vec::new(),
        });
        Ok(())
    }

    /// Total bytes currently held in pages.
    pub(crate) fn page_bytes(&self) -> usize {
        self.pages.borrow().iter().map(|e| e.page.size()).sum()
    }

    // ── Construction ─────────────────────────────────────────────────

    /// Place `value` at `dest`, first flushing any destructor still
    /// pending for that byte range (a container adapter reusing a slot
    /// whose destructor has not fired yet, e.g. pop-then-push on the
    /// same index).
    pub(crate) fn construct<T>(&self, dest: *mut T, value: T) {
        self.flush_dtors_in(dest.cast::<u8>(), std::mem::size_of::<T>());
        // SAFETY: `dest` addresses owned, allocated storage for a `T`,
        // and any previous occupant's destructor has just been run.
        unsafe { dest.write(value) };
        self.dtors.borrow_mut().store(dest, 1);
    }

    /// Default-construct `n` values at `dest`. If a constructor panics,
    /// the already built prefix is destroyed (in reverse) and the panic
    /// propagates; destructors are registered in a single commit only
    /// after every element exists.
    pub(crate) fn construct_array<T: Default>(&self, dest: *mut T, n: usize) {
        assert!(n > 0, "cannot construct an empty array");
        self.flush_dtors_in(dest.cast::<u8>(), std::mem::size_of::<T>() * n);

        struct BuiltPrefix<T> {
            base: *mut T,
            built: usize,
        }
        impl<T> Drop for BuiltPrefix<T> {
            fn drop(&mut self) {
                for i in (0..self.built).rev() {
                    // SAFETY: elements 0..built were fully constructed.
                    unsafe { ptr::drop_in_place(self.base.add(i)) };
                }
            }
        }

        let mut guard = BuiltPrefix { base: dest, built: 0 };
        for i in 0..n {
            // SAFETY: `dest` addresses owned storage for `n` `T`s.
            unsafe { dest.add(i).write(T::default()) };
            guard.built = i + 1;
        }
        std::mem::forget(guard);

        self.dtors.borrow_mut().store(dest, n);
    }

    /// Run and remove every pending destructor in `[base, base + len)`.
    fn flush_dtors_in(&self, base: *mut u8, len: usize) {
        let extracted = {
            let mut dtors = self.dtors.borrow_mut();
            // SAFETY: one-past-the-end of a range we own.
            dtors.extract_range(base, unsafe { base.add(len.max(1)) })
        };
        // User destructors run with no registry borrow held.
        dtor::run_extracted(extracted);
    }

    // ── Collection ───────────────────────────────────────────────────

    /// Trace from the roots and reclaim everything unreachable.
    pub(crate) fn collect(&self) {
        if self.destroying.get() || self.collecting.get() {
            return;
        }
        self.collecting.set(true);
        trace!(
            pages = self.pages.borrow().len(),
            roots = self.roots.borrow().len(),
            "collect: begin"
        );

        // 1. Reset marks.
        {
            let mut pages = self.pages.borrow_mut();
            let mut ptrs = self.ptrs.borrow_mut();
            for entry in pages.iter_mut() {
                entry.live_starts.set_all(false);
                for id in &entry.interior {
                    if let Some(p) = ptrs.get_mut(&id.0) {
                        p.level = 0;
                    }
                }
            }
        }

        // 2. Mark breadth-first. Roots are level 1; an interior pointer
        // reached at level k marks its target's pointers at level k + 1.
        let mut level = 1usize;
        let root_ids: Vec<PtrId> = self.roots.borrow().iter().copied().collect();
        for id in root_ids {
            let target = self.ptrs.borrow().get(&id.0).map(|e| e.target);
            if let Some(target) = target {
                self.mark(target, level);
            }
        }
        loop {
            level += 1;
            let batch: Vec<*mut u8> = {
                let pages = self.pages.borrow();
                let ptrs = self.ptrs.borrow();
                pages
                    .iter()
                    .flat_map(|pg| pg.interior.iter())
                    .filter_map(|id| ptrs.get(&id.0))
                    .filter(|e| e.level == level - 1)
                    .map(|e| e.target)
                    .collect()
            };
            if batch.is_empty() {
                break;
            }
            for target in batch {
                self.mark(target, level);
            }
        }
        trace!(passes = level - 1, "collect: mark done");

        // 3. Null every unreachable interior pointer, before any
        // destructor can run. A condemned object's destructor therefore
        // reads all its deferred edges as null.
        {
            let pages = self.pages.borrow();
            let mut ptrs = self.ptrs.borrow_mut();
            for pg in pages.iter() {
                for id in &pg.interior {
                    if let Some(entry) = ptrs.get_mut(&id.0) {
                        if entry.level == 0 {
                            entry.target = ptr::null_mut();
                        }
                    }
                }
            }
        }

        // 4. Sweep. Destructors may panic; the pass continues and the
        // first panic resumes once the collection is complete.
        let mut first_panic = None;
        let mut swept = 0usize;
        let page_ids: Vec<PageId> = self.pages.borrow().iter().map(|e| e.id).collect();
        for page_id in page_ids {
            let mut at = 0usize;
            loop {
                let condemned = self.next_condemned(page_id, at);
                let Some((start, end, location)) = condemned else {
                    break;
                };
                let extracted = self.dtors.borrow_mut().extract_range(start, end);
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| dtor::run_extracted(extracted)))
                {
                    first_panic.get_or_insert(payload);
                }
                let mut pages = self.pages.borrow_mut();
                if let Some(entry) = pages.iter_mut().find(|e| e.id == page_id) {
                    entry.page.deallocate(start);
                }
                swept += 1;
                at = location + 1;
            }
        }

        // 5. Drop pages that are now empty.
        loop {
            let mut pages = self.pages.borrow_mut();
            let Some(pos) = pages.iter().position(|e| e.page.is_empty()) else {
                break;
            };
            let entry = pages.remove(pos);
            debug_assert!(
                entry.interior.is_empty(),
                "page with no allocations still has registered pointers"
            );
            debug!(page = entry.id.0, "collect: dropping empty page");
        }

        debug!(
            swept,
            pages = self.pages.borrow().len(),
            pending_dtors = self.dtors.borrow().len(),
            "collect: done"
        );
        self.collecting.set(false);
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }

    /// Mark the allocation containing `target` live and schedule the
    /// interior pointers stored inside it for the next mark pass.
    fn mark(&self, target: *mut u8, level: usize) {
        if target.is_null() {
            return;
        }
        let mut pages = self.pages.borrow_mut();
        let Some(pg) = pages.iter_mut().find(|e| e.page.contains(target)) else {
            // Not in this heap's storage (e.g. a pointer into another
            // heap held as a root here); nothing to trace.
            return;
        };
        let info = pg.page.contains_info(target);
        assert!(
            info.found != FindResult::Unallocated,
            "marked pointer targets unallocated memory"
        );
        pg.live_starts.set(info.start_location, true);

        let mut ptrs = self.ptrs.borrow_mut();
        for id in &pg.interior {
            let entry = ptrs
                .get_mut(&id.0)
                .expect("interior list references an unregistered pointer");
            let own = pg.page.contains_info(entry.self_addr);
            assert!(
                matches!(
                    own.found,
                    FindResult::AllocatedStart | FindResult::AllocatedMiddle
                ),
                "interior pointer stored in unallocated memory"
            );
            if own.start_location == info.start_location && entry.level == 0 {
                entry.level = level;
            }
        }
    }

    /// Next unreachable allocation in `page_id` at or after location
    /// `at`: its start address, end address, and start location.
    fn next_condemned(&self, page_id: PageId, at: usize) -> Option<(*mut u8, *const u8, usize)> {
        let pages = self.pages.borrow();
        let entry = pages.iter().find(|e| e.id == page_id)?;
        let locations = entry.page.locations();
        for i in at..locations {
            let info = entry.page.location_info(i);
            if !info.is_start || entry.live_starts.get(i) {
                continue;
            }
            // Extent runs to the next allocation start or the page end.
            let mut end = entry.page.extent().end;
            for j in i + 1..locations {
                let next = entry.page.location_info(j);
                if next.is_start {
                    end = next.pointer;
                    break;
                }
            }
            return Some((info.pointer, end, i));
        }
        None
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Destroy the heap: detach every pointer, run every pending
    /// destructor, release every page.
    fn teardown(&self) {
        debug!(
            pages = self.pages.borrow().len(),
            pointers = self.ptrs.borrow().len(),
            pending_dtors = self.dtors.borrow().len(),
            "heap teardown"
        );
        // The flag makes every surviving pointer read as null and turns
        // deregistration into a no-op; it also faults any attempt to
        // allocate or register from a destructor below.
        self.destroying.set(true);

        // Detach before destruction: destructors must not observe any
        // still-pointing deferred edge.
        for entry in self.ptrs.borrow_mut().values_mut() {
            entry.target = ptr::null_mut();
        }

        let mut first_panic = None;
        loop {
            let batch = self.dtors.borrow_mut().take_all();
            if batch.is_empty() {
                break;
            }
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| dtor::run_extracted(batch)))
            {
                first_panic.get_or_insert(payload);
            }
        }

        self.pages.borrow_mut().clear();
        self.roots.borrow_mut().clear();
        self.ptrs.borrow_mut().clear();
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }
}

/// An isolated deferred heap.
///
/// Dropping the heap detaches every surviving [`DeferredPtr`] (they read
/// as null afterwards) and runs every pending destructor exactly once.
///
/// A heap confines itself to one thread; it is deliberately neither
/// `Send` nor `Sync`.
pub struct Heap {
    state: Rc<HeapState>,
}

impl Heap {
    /// Create a heap with the default configuration.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Create a heap with an explicit configuration.
    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            state: Rc::new(HeapState::new(config)),
        }
    }

    /// Allocate and construct one `T`, returning a pointer registered as
    /// a root until it comes to rest somewhere else.
    ///
    /// Returns an attached null pointer if the heap's configured size
    /// ceiling denies the allocation.
    pub fn make<T>(&self, value: T) -> DeferredPtr<T> {
        match self.try_make(value) {
            Ok(p) => p,
            Err(err) => {
                debug!(%err, "make failed");
                DeferredPtr::null_in(&self.state)
            }
        }
    }

    /// Allocate and construct one `T`, reporting exhaustion as an error.
    pub fn try_make<T>(&self, value: T) -> Result<DeferredPtr<T>, AllocationError> {
        let raw = self.state.allocate_raw::<T>(1)?;
        let dest = raw.cast::<T>().as_ptr();
        // Root the slot before construction: construction can run user
        // destructors, and those may collect.
        let p = DeferredPtr::from_target(&self.state, dest);
        self.state.construct(dest, value);
        Ok(p)
    }

    /// Allocate and default-construct an array of `n` `T`s, returning a
    /// pointer to the first element.
    ///
    /// If a constructor panics, the already built prefix is destroyed
    /// and the panic propagates. Returns an attached null pointer if the
    /// configured size ceiling denies the allocation.
    pub fn make_array<T: Default>(&self, n: usize) -> DeferredPtr<T> {
        match self.try_make_array(n) {
            Ok(p) => p,
            Err(err) => {
                debug!(%err, "make_array failed");
                DeferredPtr::null_in(&self.state)
            }
        }
    }

    /// Allocate and default-construct an array, reporting exhaustion as
    /// an error.
    pub fn try_make_array<T: Default>(&self, n: usize) -> Result<DeferredPtr<T>, AllocationError> {
        let raw = self.state.allocate_raw::<T>(n)?;
        let dest = raw.cast::<T>().as_ptr();
        // Root the slot before construction, as in `try_make`.
        let p = DeferredPtr::from_target(&self.state, dest);
        self.state.construct_array(dest, n);
        Ok(p)
    }

    /// Trace from the roots and reclaim everything unreachable.
    pub fn collect(&self) {
        self.state.collect();
    }

    /// Whether a failed allocation collects and retries before the heap
    /// grows a new page.
    pub fn collect_before_expand(&self) -> bool {
        self.state.collect_before_expand.get()
    }

    /// Enable or disable collect-before-expand.
    pub fn set_collect_before_expand(&self, enable: bool) {
        self.state.collect_before_expand.set(enable);
    }

    /// An allocator-style adapter targeting this heap.
    pub fn allocator<T>(&self) -> crate::adapter::HeapAllocator<T> {
        crate::adapter::HeapAllocator::new(&self.state)
    }

    /// Number of pages currently backing the heap.
    pub fn page_count(&self) -> usize {
        self.state.pages.borrow().len()
    }

    /// Total bytes currently held in pages.
    pub fn allocated_bytes(&self) -> usize {
        self.state.page_bytes()
    }

    /// Number of registered pointers currently classified as roots.
    pub fn root_count(&self) -> usize {
        self.state.roots.borrow().len()
    }

    /// Number of registered pointers living inside the heap's pages.
    pub fn interior_count(&self) -> usize {
        self.state
            .pages
            .borrow()
            .iter()
            .map(|e| e.interior.len())
            .sum()
    }

    /// Total number of registered pointers.
    pub fn pointer_count(&self) -> usize {
        self.state.ptrs.borrow().len()
    }

    /// Number of destructors waiting to run at collection or teardown.
    pub fn pending_destructors(&self) -> usize {
        self.state.dtors.borrow().len()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.state.teardown();
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("pages", &self.page_count())
            .field("bytes", &self.allocated_bytes())
            .field("roots", &self.root_count())
            .field("interior", &self.interior_count())
            .field("pending_dtors", &self.pending_destructors())
            .finish()
    }
}
