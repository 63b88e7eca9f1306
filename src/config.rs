//! Heap configuration.
//!
//! Two sizing floors, one growth policy flag, and an optional ceiling.
//! Configuration is purely programmatic: there are no environment
//! variables and no files.
//!
//! # Example
//!
//! ```rust,ignore
//! use deferred_heap::{Heap, HeapConfig};
//!
//! let heap = Heap::with_config(
//!     HeapConfig::builder()
//!         .min_page_bytes(4096)
//!         .collect_before_expand(true)
//!         .build(),
//! );
//! ```

/// Default minimum page size in bytes.
pub const DEFAULT_MIN_PAGE_BYTES: usize = 8 * 1024;

/// Default minimum chunk (location) size in bytes.
pub const DEFAULT_MIN_CHUNK_BYTES: usize = 4;

/// Configuration for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Floor for the size of a newly appended page. A page sized for a
    /// specific request may be larger, never smaller.
    pub min_page_bytes: usize,
    /// Floor for a new page's chunk size. The chunk size of a page sized
    /// for type `T` is `max(size_of::<T>(), min_chunk_bytes)`.
    pub min_chunk_bytes: usize,
    /// Run a collection and retry before appending a page when no
    /// existing page can satisfy an allocation.
    pub collect_before_expand: bool,
    /// Ceiling on the total bytes held in pages. `None` means unlimited.
    /// When appending a page would exceed the ceiling, the allocation
    /// fails recoverably instead.
    pub max_heap_bytes: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_page_bytes: DEFAULT_MIN_PAGE_BYTES,
            min_chunk_bytes: DEFAULT_MIN_CHUNK_BYTES,
            collect_before_expand: false,
            max_heap_bytes: None,
        }
    }
}

impl HeapConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> HeapConfigBuilder {
        HeapConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`HeapConfig`].
#[derive(Debug, Clone)]
pub struct HeapConfigBuilder {
    config: HeapConfig,
}

impl HeapConfigBuilder {
    /// Set the minimum page size in bytes.
    pub fn min_page_bytes(mut self, bytes: usize) -> Self {
        self.config.min_page_bytes = bytes;
        self
    }

    /// Set the minimum chunk size in bytes.
    pub fn min_chunk_bytes(mut self, bytes: usize) -> Self {
        self.config.min_chunk_bytes = bytes;
        self
    }

    /// Enable or disable collect-before-expand.
    pub fn collect_before_expand(mut self, enable: bool) -> Self {
        self.config.collect_before_expand = enable;
        self
    }

    /// Set the heap size ceiling in bytes.
    pub fn max_heap_bytes(mut self, bytes: usize) -> Self {
        self.config.max_heap_bytes = Some(bytes);
        self
    }

    /// Finish building.
    ///
    /// # Panics
    ///
    /// Panics if either sizing floor is zero.
    pub fn build(self) -> HeapConfig {
        assert!(
            self.config.min_page_bytes > 0,
            "minimum page size must be nonzero"
        );
        assert!(
            self.config.min_chunk_bytes > 0,
            "minimum chunk size must be nonzero"
        );
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HeapConfig::default();
        assert_eq!(config.min_page_bytes, DEFAULT_MIN_PAGE_BYTES);
        assert_eq!(config.min_chunk_bytes, DEFAULT_MIN_CHUNK_BYTES);
        assert!(!config.collect_before_expand);
        assert_eq!(config.max_heap_bytes, None);
    }

    #[test]
    fn test_builder_overrides() {
        let config = HeapConfig::builder()
            .min_page_bytes(128)
            .min_chunk_bytes(8)
            .collect_before_expand(true)
            .max_heap_bytes(1 << 20)
            .build();
        assert_eq!(config.min_page_bytes, 128);
        assert_eq!(config.min_chunk_bytes, 8);
        assert!(config.collect_before_expand);
        assert_eq!(config.max_heap_bytes, Some(1 << 20));
    }

    #[test]
    #[should_panic(expected = "minimum chunk size")]
    fn test_zero_chunk_floor_rejected() {
        let _ = HeapConfig::builder().min_chunk_bytes(0).build();
    }
}
