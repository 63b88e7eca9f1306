//! Fixed-extent arena pages with a bitmap sub-allocator.
//!
//! A [`Page`] owns one contiguous byte buffer, divided into equal-sized
//! chunks ("locations"). Two parallel [`BitSet`]s track which locations
//! are in use and which begin an allocation; together they encode every
//! allocation's extent, which is exactly the information the collector
//! needs to walk a page without any per-object headers.
//!
//! Pages never grow. Exhaustion is a `None` return, never an error; the
//! owning heap reacts by collecting or by appending another page.
//!
//! # Layout of an allocation
//!
//! ```text
//! locations:  [ S | u | u | p ]   S = start (starts+inuse set)
//!                                 u = interior (inuse set)
//!                                 p = padding (inuse set, not a start)
//! ```
//!
//! Every allocation carries one trailing padding location so that a
//! one-past-the-end pointer still lands inside the same allocation's
//! extent instead of colliding with a neighbor.

use std::alloc::{self, Layout};
use std::ops::Range;
use std::ptr::NonNull;

use crate::bitset::BitSet;

/// Alignment of every page buffer.
///
/// Requests whose type alignment is at most this are satisfiable from
/// location zero; stricter alignments are handled by offsetting the
/// starting location inside the buffer.
const PAGE_BASE_ALIGN: usize = 64;

/// Classification of an address probed against a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    /// The address does not point into this page's buffer.
    NotInRange,
    /// In the buffer, but no allocation covers it.
    Unallocated,
    /// Inside an allocation, past its first location.
    AllocatedMiddle,
    /// The first location of an allocation.
    AllocatedStart,
}

/// Result of [`Page::contains_info`].
#[derive(Debug, Clone, Copy)]
pub struct ContainsInfo {
    /// How the probed address relates to this page.
    pub found: FindResult,
    /// Location index of the probed address (valid unless `NotInRange`).
    pub location: usize,
    /// Location index where the containing allocation starts (valid for
    /// the two `Allocated` results).
    pub start_location: usize,
}

/// Result of [`Page::location_info`].
#[derive(Debug, Clone, Copy)]
pub struct LocationInfo {
    /// Whether an allocation starts at this location.
    pub is_start: bool,
    /// Address of the location's first byte.
    pub pointer: *mut u8,
}

/// One contiguous allocation arena, sub-allocated at chunk granularity.
pub struct Page {
    storage: NonNull<u8>,
    /// Total buffer size in bytes; a multiple of `chunk_size`.
    total_size: usize,
    /// Granularity of the location grid, in bytes.
    chunk_size: usize,
    /// Location is in use (part of some allocation, including padding).
    inuse: BitSet,
    /// Location begins an allocation.
    starts: BitSet,
    /// Advisory upper bound on the largest byte length that could
    /// currently be satisfied. May underestimate free space, never
    /// overestimates: no request larger than this can succeed.
    request_bound: usize,
}

impl Page {
    /// Create a page of (at least) `desired_size` bytes, tracked at
    /// `chunk_size`-byte granularity. The effective size is rounded up
    /// to a multiple of the chunk size.
    ///
    /// # Panics
    ///
    /// Panics if `desired_size` is zero or `chunk_size` is zero.
    pub fn new(desired_size: usize, chunk_size: usize) -> Self {
        assert!(desired_size > 0, "page must hold at least one chunk");
        assert!(chunk_size > 0, "chunk size must be at least one byte");

        let total_size = match desired_size % chunk_size {
            0 => desired_size,
            rem => desired_size + (chunk_size - rem),
        };
        let locations = total_size / chunk_size;

        // The buffer comes from the global allocator at a fixed base
        // alignment; `Drop` releases it with the same layout.
        let layout = Layout::from_size_align(total_size, PAGE_BASE_ALIGN)
            .expect("page size overflows Layout");
        // SAFETY: layout has non-zero size (checked above).
        let raw = unsafe { alloc::alloc(layout) };
        let storage = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };

        Self {
            storage,
            total_size,
            chunk_size,
            inuse: BitSet::new(locations, false),
            starts: BitSet::new(locations, false),
            request_bound: total_size,
        }
    }

    /// Number of chunk-sized locations in the page.
    pub fn locations(&self) -> usize {
        self.total_size / self.chunk_size
    }

    /// Total buffer size in bytes.
    pub fn size(&self) -> usize {
        self.total_size
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Half-open range of the page's buffer addresses.
    pub fn extent(&self) -> Range<*const u8> {
        let base = self.storage.as_ptr() as *const u8;
        // SAFETY: one-past-the-end of the owned buffer.
        base..unsafe { base.add(self.total_size) }
    }

    /// Whether no location is in use.
    pub fn is_empty(&self) -> bool {
        let empty = self.inuse.all_false();
        debug_assert!(
            !empty || self.starts.all_false(),
            "page with no in-use locations still has allocation starts"
        );
        empty
    }

    /// Allocate space for `layout` (already scaled to the full array
    /// size by the caller). Returns the start address, or `None` if the
    /// request cannot be satisfied from this page.
    ///
    /// Zero-sized layouts occupy one byte so that every allocation has a
    /// distinct, probeable extent.
    pub fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let bytes = layout.size().max(1);

        // Fast fail: a prior failure or the running occupancy estimate
        // already proves this request cannot fit.
        if bytes > self.request_bound {
            return None;
        }

        let locations = self.locations();
        // One extra location backs one-past-the-end pointers.
        let needed = (bytes - 1) / self.chunk_size + 2;

        let (first, step) = match self.aligned_search_origin(layout.align()) {
            Some(origin) => origin,
            None => {
                self.note_failed_request(bytes);
                return None;
            }
        };

        if needed > locations || first > locations - needed {
            self.note_failed_request(bytes);
            return None;
        }

        // Scan candidates at the alignment stride; the first window with
        // no in-use location wins.
        let mut at = first;
        while at <= locations - needed {
            let conflict = self.inuse.find_next(at, at + needed, true);
            if conflict == at + needed {
                self.starts.set(at, true);
                self.inuse.set_range(at, at + needed, true);
                self.request_bound = self
                    .request_bound
                    .saturating_sub(self.chunk_size * needed);
                // SAFETY: `at` is a valid location index, so the offset
                // stays inside the owned buffer.
                return Some(unsafe {
                    NonNull::new_unchecked(self.storage.as_ptr().add(at * self.chunk_size))
                });
            }
            // Jump past the conflicting location, rounded up to the next
            // candidate on the alignment stride.
            let past = conflict + 1 - first;
            at = first + past.div_ceil(step) * step;
        }

        self.note_failed_request(bytes);
        None
    }

    /// Release the allocation starting at `p`.
    ///
    /// # Panics
    ///
    /// Panics unless `p` was previously returned by [`Page::allocate`]
    /// on this page and has not been deallocated since.
    pub fn deallocate(&mut self, p: *mut u8) {
        assert!(
            self.contains(p),
            "deallocate: address is not in this page"
        );
        let offset = p as usize - self.storage.as_ptr() as usize;
        let here = offset / self.chunk_size;

        assert!(
            self.starts.get(here) && self.inuse.get(here),
            "deallocate: address is not the start of a live allocation"
        );

        self.starts.set(here, false);

        // The allocation's in-use run ends at the first free location or
        // at the start of the following allocation, whichever is first.
        let locations = self.locations();
        let next_start = self.starts.find_next(here + 1, locations, true);
        let end = self.inuse.find_next(here, next_start, false);
        self.inuse.set_range(here, end, false);

        // Spill the advisory bound; the new hole may have merged with
        // its neighbors, so the exact largest hole is unknown.
        self.request_bound = self.total_size;
    }

    /// Whether `p` points into this page's buffer.
    pub fn contains(&self, p: *const u8) -> bool {
        let ext = self.extent();
        (ext.start as usize) <= (p as usize) && (p as usize) < (ext.end as usize)
    }

    /// Classify `p` against this page, resolving the start of the
    /// containing allocation when there is one.
    pub fn contains_info(&self, p: *const u8) -> ContainsInfo {
        if !self.contains(p) {
            return ContainsInfo {
                found: FindResult::NotInRange,
                location: 0,
                start_location: 0,
            };
        }

        let offset = p as usize - self.storage.as_ptr() as usize;
        let location = offset / self.chunk_size;

        if !self.inuse.get(location) {
            return ContainsInfo {
                found: FindResult::Unallocated,
                location,
                start_location: 0,
            };
        }

        if !self.starts.get(location) {
            // Walk back to the allocation's start bit.
            let mut start = location;
            while start > 0 && !self.starts.get(start - 1) {
                start -= 1;
            }
            assert!(start > 0, "in-use location has no allocation start");
            return ContainsInfo {
                found: FindResult::AllocatedMiddle,
                location,
                start_location: start - 1,
            };
        }

        ContainsInfo {
            found: FindResult::AllocatedStart,
            location,
            start_location: location,
        }
    }

    /// Start flag and address for location `at`.
    ///
    /// # Panics
    ///
    /// Panics if `at` is not a valid location index.
    pub fn location_info(&self, at: usize) -> LocationInfo {
        LocationInfo {
            is_start: self.starts.get(at),
            // SAFETY: `at < locations()` was checked by `starts.get`.
            pointer: unsafe { self.storage.as_ptr().add(at * self.chunk_size) },
        }
    }

    /// First candidate location and candidate stride for a request of
    /// the given alignment, or `None` if no location in this buffer can
    /// satisfy the alignment.
    fn aligned_search_origin(&self, align: usize) -> Option<(usize, usize)> {
        let step = align / gcd(align, self.chunk_size);
        let base = self.storage.as_ptr() as usize;
        if base % align == 0 {
            return Some((0, step.max(1)));
        }
        // Alignment exceeds the buffer's base alignment: probe one full
        // stride period for a location that lands on an align boundary.
        (0..step.max(1))
            .find(|i| (base + i * self.chunk_size) % align == 0)
            .map(|first| (first, step.max(1)))
    }

    /// Record that a request of `bytes` could not be satisfied.
    fn note_failed_request(&mut self, bytes: usize) {
        self.request_bound = self.request_bound.min(bytes - 1);
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.total_size, PAGE_BASE_ALIGN)
            .expect("page layout was validated at construction");
        // SAFETY: allocated in `Page::new` with this exact layout.
        unsafe { alloc::dealloc(self.storage.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("base", &self.storage.as_ptr())
            .field("total_size", &self.total_size)
            .field("chunk_size", &self.chunk_size)
            .field("request_bound", &self.request_bound)
            .finish()
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
