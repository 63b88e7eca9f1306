//! End-to-end collection scenarios.
//!
//! Reachability is observed through an instance-counted payload: every
//! live `Counted` bumps a thread-local counter on construction and drops
//! it on destruction, so "n objects live" is a direct assertion.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

use deferred_heap::{DeferredPtr, Heap, HeapConfig};

thread_local! {
    static LIVE: Cell<usize> = const { Cell::new(0) };
    static DROPS: Cell<usize> = const { Cell::new(0) };
}

fn live() -> usize {
    LIVE.with(|c| c.get())
}

fn drops() -> usize {
    DROPS.with(|c| c.get())
}

fn reset_counters() {
    LIVE.with(|c| c.set(0));
    DROPS.with(|c| c.set(0));
}

/// Instance-counted payload.
struct Counted {
    id: u64,
}

impl Counted {
    fn new(id: u64) -> Self {
        LIVE.with(|c| c.set(c.get() + 1));
        Self { id }
    }
}

impl Drop for Counted {
    fn drop(&mut self) {
        LIVE.with(|c| c.set(c.get() - 1));
        DROPS.with(|c| c.set(c.get() + 1));
    }
}

/// Graph node with two outgoing deferred edges and a counted payload.
struct Node {
    next: DeferredPtr<Node>,
    other: DeferredPtr<Node>,
    payload: Counted,
}

impl Node {
    fn new(id: u64) -> Self {
        Self {
            next: DeferredPtr::null(),
            other: DeferredPtr::null(),
            payload: Counted::new(id),
        }
    }
}

#[test]
fn linear_chain_dies_when_parent_is_reset() {
    reset_counters();
    let heap = Heap::new();

    let a = heap.make(Node::new(1));
    let b = heap.make(Node::new(2));
    let c = heap.make(Node::new(3));
    a.next.set(&b);
    b.next.set(&c);
    drop(b);
    drop(c);

    assert_eq!(live(), 3);
    heap.collect();
    assert_eq!(live(), 3, "the chain is reachable through its root");

    a.set_null();
    heap.collect();
    assert_eq!(live(), 0);
    assert_eq!(
        heap.pending_destructors(),
        0,
        "no destructor record survives its object"
    );
}

#[test]
fn simple_cycle_is_collected() {
    reset_counters();
    let heap = Heap::new();

    let a = heap.make(Node::new(1));
    let b = heap.make(Node::new(2));
    a.next.set(&b);
    b.next.set(&a);
    drop(b);

    assert_eq!(live(), 2);
    heap.collect();
    assert_eq!(live(), 2, "the cycle hangs off the surviving root");

    a.set_null();
    heap.collect();
    assert_eq!(live(), 0, "an unreachable cycle is reclaimed");
    assert_eq!(heap.page_count(), 0);
}

#[test]
fn cycle_behind_surviving_root_stays_until_cut() {
    reset_counters();
    let heap = Heap::new();

    // A -> B, B -> C, B -> D, D -> B: a cycle (B <-> D) plus a leaf (C),
    // all behind the root A.
    let a = heap.make(Node::new(1));
    let b = heap.make(Node::new(2));
    let c = heap.make(Node::new(3));
    let d = heap.make(Node::new(4));
    a.next.set(&b);
    b.next.set(&c);
    b.other.set(&d);
    d.next.set(&b);
    drop(b);
    drop(c);
    drop(d);

    heap.collect();
    assert_eq!(live(), 4, "everything is reachable through A");

    // Cut A's edge into the subgraph: the cycle and the leaf go, A stays.
    a.next.set_null();
    heap.collect();
    assert_eq!(live(), 1);
    assert_eq!(a.payload.id, 1);
}

#[test]
fn reused_slot_fires_pending_destructor_before_construction() {
    reset_counters();
    let heap = Heap::new();
    let alloc = heap.allocator::<Counted>();

    // Construct into a raw slot, as a container adapter would for an
    // element index.
    let slot = alloc.allocate(1);
    alloc.construct(&slot, Counted::new(1));
    assert_eq!(live(), 1);
    assert_eq!(drops(), 0);

    // The element is popped (logically dead, destructor still pending)
    // and the index reused without an intervening collection. The old
    // destructor must fire exactly once, before the new value exists.
    alloc.construct(&slot, Counted::new(2));
    assert_eq!(drops(), 1, "pending destructor ran exactly once");
    assert_eq!(live(), 1, "old value was gone before the new one arrived");
    assert_eq!(slot.id, 2);
}

#[test]
fn collect_before_expand_reclaims_instead_of_growing() {
    reset_counters();
    // 64-byte pages with 8-byte chunks hold 8 locations; each `Counted`
    // (8 bytes) takes a payload location plus a padding location, so a
    // fresh page holds exactly 4 objects.
    let heap = Heap::with_config(
        HeapConfig::builder()
            .min_page_bytes(64)
            .collect_before_expand(true)
            .build(),
    );
    assert_eq!(std::mem::size_of::<Counted>(), 8);

    let mut roots = Vec::new();
    for i in 0..4 {
        roots.push(heap.make(Counted::new(i)));
    }
    assert_eq!(heap.page_count(), 1);
    assert_eq!(live(), 4);
    let bytes_before = heap.allocated_bytes();

    // Drop every root, then allocate a fifth object with no manual
    // collect: the heap must reclaim rather than grow.
    roots.clear();
    let survivor = heap.make(Counted::new(99));
    assert_eq!(live(), 1);
    assert_eq!(heap.page_count(), 1);
    assert_eq!(heap.allocated_bytes(), bytes_before);
    assert_eq!(survivor.id, 99);
}

#[test]
fn teardown_detaches_outliving_roots_and_runs_destructors_once() {
    reset_counters();
    let outer;
    let outer_clone;
    {
        let heap = Heap::new();
        outer = heap.make(Counted::new(7));
        outer_clone = outer.clone();
        assert_eq!(live(), 1);
        assert!(!outer.is_null());
    }
    // The heap is gone: every destructor ran exactly once and both
    // surviving pointers read as null.
    assert_eq!(live(), 0);
    assert_eq!(drops(), 1);
    assert!(outer.is_null());
    assert!(outer_clone.is_null());
    assert!(!outer.is_attached());
    // Dropping the survivors afterwards must not touch the dead heap.
    drop(outer);
    drop(outer_clone);
}

#[test]
fn destructors_observe_condemned_siblings_as_null() {
    thread_local! {
        static PEER_WAS_NULL: RefCell<Vec<bool>> = const { RefCell::new(Vec::new()) };
    }

    struct Observer {
        peer: DeferredPtr<Observer>,
    }

    impl Drop for Observer {
        fn drop(&mut self) {
            PEER_WAS_NULL.with(|log| log.borrow_mut().push(self.peer.is_null()));
        }
    }

    let heap = Heap::new();
    let a = heap.make(Observer {
        peer: DeferredPtr::null(),
    });
    let b = heap.make(Observer {
        peer: DeferredPtr::null(),
    });
    a.peer.set(&b);
    b.peer.set(&a);
    drop(b);
    a.set_null();
    heap.collect();

    let log = PEER_WAS_NULL.with(|log| std::mem::take(&mut *log.borrow_mut()));
    assert_eq!(log.len(), 2);
    assert!(
        log.iter().all(|&was_null| was_null),
        "every condemned sibling must already read null during destruction"
    );
}

#[test]
fn array_elements_destruct_in_reverse_storage_order() {
    thread_local! {
        static ORDER: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
        static NEXT_ID: Cell<u32> = const { Cell::new(0) };
    }

    struct Sequenced {
        id: u32,
    }

    impl Default for Sequenced {
        fn default() -> Self {
            let id = NEXT_ID.with(|c| {
                let id = c.get();
                c.set(id + 1);
                id
            });
            Self { id }
        }
    }

    impl Drop for Sequenced {
        fn drop(&mut self) {
            ORDER.with(|log| log.borrow_mut().push(self.id));
        }
    }

    let heap = Heap::new();
    let p = heap.make_array::<Sequenced>(4);
    assert_eq!(p[0].id, 0);
    assert_eq!(p[3].id, 3);

    p.set_null();
    heap.collect();

    let order = ORDER.with(|log| std::mem::take(&mut *log.borrow_mut()));
    assert_eq!(order, vec![3, 2, 1, 0]);
}

#[test]
fn failed_array_construction_unwinds_built_prefix_only() {
    reset_counters();

    struct ThirdTimeUnlucky {
        _payload: Counted,
    }

    impl Default for ThirdTimeUnlucky {
        fn default() -> Self {
            if live() == 2 {
                panic!("constructor failure");
            }
            Self {
                _payload: Counted::new(0),
            }
        }
    }

    let heap = Heap::new();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        heap.make_array::<ThirdTimeUnlucky>(5)
    }));
    assert!(result.is_err());
    // The two built elements were destroyed during the unwind and no
    // destructor was ever registered for the partial array.
    assert_eq!(live(), 0);
    assert_eq!(drops(), 2);
    assert_eq!(heap.pending_destructors(), 0);

    // The abandoned storage is unreachable garbage; collection clears it.
    heap.collect();
    assert_eq!(heap.page_count(), 0);
}

#[test]
fn destructor_may_register_roots_mid_collection() {
    thread_local! {
        static CHANNEL: RefCell<Option<DeferredPtr<u64>>> = const { RefCell::new(None) };
        static STASH: RefCell<Option<DeferredPtr<u64>>> = const { RefCell::new(None) };
    }

    struct Stasher;

    impl Drop for Stasher {
        fn drop(&mut self) {
            // Clone a pointer out of a side channel: registering a new
            // root while the sweep is running is allowed. (The dying
            // object's own deferred edges would read null here.)
            let extra = CHANNEL.with(|c| c.borrow().clone());
            STASH.with(|s| *s.borrow_mut() = extra);
        }
    }

    let heap = Heap::new();
    let value = heap.make(424242u64);
    CHANNEL.with(|c| *c.borrow_mut() = Some(value.clone()));

    let doomed = heap.make(Stasher);
    doomed.set_null();
    heap.collect();

    let stashed = STASH.with(|s| s.borrow_mut().take()).expect("stash filled");
    assert_eq!(*stashed, 424242);

    // The stashed pointer is a root in its own right.
    drop(value);
    CHANNEL.with(|c| *c.borrow_mut() = None);
    heap.collect();
    assert_eq!(*stashed, 424242, "the stashed root keeps its target alive");
}

#[test]
fn destructor_may_allocate_mid_collection() {
    thread_local! {
        static STASH: RefCell<Option<DeferredPtr<u64>>> = const { RefCell::new(None) };
    }

    struct Allocating {
        alloc: deferred_heap::HeapAllocator<u64>,
    }

    impl Drop for Allocating {
        fn drop(&mut self) {
            let p = self.alloc.allocate(1);
            if !p.is_null() {
                self.alloc.construct(&p, 31337);
                STASH.with(|s| *s.borrow_mut() = Some(p));
            }
        }
    }

    let heap = Heap::new();
    let doomed = heap.make(Allocating {
        alloc: heap.allocator::<u64>(),
    });
    doomed.set_null();
    heap.collect();

    // The mid-sweep allocation was not condemned by the pass that was
    // already running.
    let stashed = STASH.with(|s| s.borrow_mut().take()).expect("stash filled");
    assert_eq!(*stashed, 31337);
}

#[test]
fn null_roots_keep_nothing_alive() {
    reset_counters();
    let heap = Heap::new();
    let a = heap.make(Counted::new(1));
    let null_root: DeferredPtr<Counted> = DeferredPtr::null();
    drop(a);
    heap.collect();
    assert_eq!(live(), 0);
    assert!(null_root.is_null());
}

#[test]
fn interior_pointers_reclassify_as_roots_when_read_out() {
    // A pointer cloned out of a heap object onto the stack becomes a
    // root in its own right and keeps the target alive after the
    // original chain is cut.
    reset_counters();
    let heap = Heap::new();
    let a = heap.make(Node::new(1));
    let b = heap.make(Node::new(2));
    a.next.set(&b);
    drop(b);

    let rescued = a.next.clone();
    a.set_null();
    heap.collect();
    assert_eq!(live(), 1, "only the rescued node survives");
    assert_eq!(rescued.payload.id, 2);
}
