//! # Deferred Heap
//!
//! Deferred, tracing-collected object lifetime management: a fourth
//! alternative to scoped values, `Box`, and `Rc`. A [`Heap`] is an
//! isolated bubble of memory whose objects refer to each other through
//! [`DeferredPtr`]s; nothing is destroyed until an explicit
//! [`Heap::collect`] proves it unreachable, at which point destructors
//! run (exactly once, cycles included) and the storage returns to the
//! heap's pages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            HEAP                                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │    Pages     │  │   Pointer    │  │  Destructor  │           │
//! │  │  (page.rs)   │  │   registry   │  │    table     │           │
//! │  │              │  │  (heap.rs)   │  │  (dtor.rs)   │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                    │
//! │         └────────────┬────┴─────────────────┘                    │
//! │                      │                                           │
//! │           ┌──────────┴──────────┐      ┌──────────────┐          │
//! │           │  mark / sweep       │      │    BitSet    │          │
//! │           │  collector          │      │ (bitset.rs)  │          │
//! │           └─────────────────────┘      └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//!          ▲                                        ▲
//!          │ make / collect                         │ allocate / construct
//!    DeferredPtr<T> (ptr.rs)               HeapAllocator<T> (adapter.rs)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use deferred_heap::{DeferredPtr, Heap};
//!
//! #[derive(Default)]
//! struct Node {
//!     next: DeferredPtr<Node>,
//! }
//!
//! let heap = Heap::new();
//! let a = heap.make(Node::default());
//! let b = heap.make(Node::default());
//! a.next.set(&b);
//! b.next.set(&a); // a cycle; Rc would leak it
//!
//! drop(a);
//! drop(b);
//! heap.collect(); // both nodes destroyed, storage reclaimed
//! ```
//!
//! ## Guarantees
//!
//! - Destructors run exactly once; there is no separate finalizer
//!   concept and no resurrection.
//! - Before any destructor runs in a collection, every deferred pointer
//!   into condemned storage already reads null ("safe unordered
//!   destruction"): a destructor can never reach a sibling that is also
//!   being destroyed.
//! - Misuse (cross-heap assignment, null dereference, arithmetic that
//!   leaves an allocation) is a contract violation and panics.
//!
//! ## Non-guarantees
//!
//! A heap confines itself to one thread (`Heap` and `DeferredPtr` are
//! neither `Send` nor `Sync`), collection is stop-the-world within the
//! bubble, and the design favors clarity over scaling to millions of
//! pointers.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod adapter;
pub mod bitset;
pub mod config;
mod dtor;
pub mod error;
pub mod heap;
pub mod page;
pub mod ptr;

pub use adapter::HeapAllocator;
pub use bitset::BitSet;
pub use config::HeapConfig;
pub use error::AllocationError;
pub use heap::Heap;
pub use page::Page;
pub use ptr::DeferredPtr;
