//! Deferred destructor records.
//!
//! Objects in a deferred heap are destroyed at collection time, not at
//! pointer death, so the heap keeps a table of `(address, erased
//! destructor)` records. The erased destructor is a monomorphized
//! function pointer to a `drop_in_place` thunk: two words per record and
//! a single indirect call to run one, with no boxed closures.
//!
//! Reentrancy rule: a destructor may itself create and destroy deferred
//! pointers, so all structural changes to the table happen *before* any
//! destructor runs. Extraction copies the matching records into a local
//! buffer first; a drop guard then runs the buffer to completion even if
//! one of the destructors panics.
//!
//! Execution order: records run in reverse insertion order. Array
//! elements are registered first-to-last in one commit, so they destruct
//! last-to-first, the same order Rust uses for locals.

use std::mem;

/// Erased destructor entry point. The pointee must be a live, fully
/// constructed value of the type the thunk was instantiated for.
pub(crate) type DropFn = unsafe fn(*mut u8);

/// Calls `T`'s destructor on an erased address.
unsafe fn drop_thunk<T>(p: *mut u8) {
    // SAFETY: the caller promises `p` addresses a live `T`.
    unsafe { std::ptr::drop_in_place(p.cast::<T>()) }
}

/// One pending destructor.
#[derive(Clone, Copy)]
pub(crate) struct DtorRecord {
    addr: *mut u8,
    drop_fn: DropFn,
}

/// Ordered list of pending destructors for one heap.
#[derive(Default)]
pub(crate) struct DestructorTable {
    records: Vec<DtorRecord>,
}

impl DestructorTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append one record per element for `count` contiguous `T`s
    /// starting at `base`. A no-op for types without drop glue.
    pub(crate) fn store<T>(&mut self, base: *mut T, count: usize) {
        if !mem::needs_drop::<T>() {
            return;
        }
        for i in 0..count {
            self.records.push(DtorRecord {
                // SAFETY: caller owns `count` elements starting at `base`.
                addr: unsafe { base.add(i) }.cast::<u8>(),
                drop_fn: drop_thunk::<T>,
            });
        }
    }

    /// Whether a record is pending for exactly this address.
    pub(crate) fn is_stored(&self, addr: *const u8) -> bool {
        self.records.iter().any(|r| r.addr as *const u8 == addr)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove and return every record whose address lies in `[lo, hi)`,
    /// preserving insertion order. No destructor runs here.
    pub(crate) fn extract_range(&mut self, lo: *const u8, hi: *const u8) -> Vec<DtorRecord> {
        let mut extracted = Vec::new();
        self.records.retain(|r| {
            let p = r.addr as *const u8;
            if (lo as usize) <= (p as usize) && (p as usize) < (hi as usize) {
                extracted.push(*r);
                false
            } else {
                true
            }
        });
        extracted
    }

    /// Remove and return the whole table's contents. No destructor runs
    /// here.
    pub(crate) fn take_all(&mut self) -> Vec<DtorRecord> {
        mem::take(&mut self.records)
    }

    /// Run every record whose address lies in `[lo, hi)`, in reverse
    /// insertion order, removing them first. Returns whether any ran.
    pub(crate) fn remove_in_range(&mut self, lo: *const u8, hi: *const u8) -> bool {
        let extracted = self.extract_range(lo, hi);
        let any = !extracted.is_empty();
        run_extracted(extracted);
        any
    }

    /// Run every record in reverse insertion order and clear the table.
    ///
    /// Destructors that append further records are drained too, so the
    /// table is empty on return.
    pub(crate) fn run_all(&mut self) {
        loop {
            let batch = self.take_all();
            if batch.is_empty() {
                return;
            }
            run_extracted(batch);
        }
    }
}

/// Run extracted records back-to-front (reverse insertion order).
///
/// If a destructor panics, the guard keeps running the remaining records
/// while the panic unwinds; a second panic at that point aborts, as with
/// any panic during unwinding.
pub(crate) fn run_extracted(records: Vec<DtorRecord>) {
    struct Remaining(Vec<DtorRecord>);

    impl Drop for Remaining {
        fn drop(&mut self) {
            // Reached with records left only when a destructor panicked
            // out of the loop below; drain the rest during the unwind.
            while let Some(rec) = self.0.pop() {
                // SAFETY: as in the main loop.
                unsafe { (rec.drop_fn)(rec.addr) };
            }
        }
    }

    let mut pending = Remaining(records);
    while let Some(rec) = pending.0.pop() {
        // SAFETY: each record was created by `store` for a value that is
        // still live (records are removed before any mutation of the
        // underlying storage).
        unsafe { (rec.drop_fn)(rec.addr) };
    }
}
