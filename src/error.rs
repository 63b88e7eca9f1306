//! Error types for the fallible allocation surface.
//!
//! Almost nothing in this crate is recoverable: misuse is a contract
//! violation and panics. The one recoverable condition is allocation
//! exhaustion against a configured heap ceiling, reported here.

use thiserror::Error;

/// Error returned when an allocation cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Growing the heap with another page would exceed the configured
    /// limit.
    #[error(
        "allocation of {requested} bytes would exceed the heap limit ({current} / {limit} bytes in pages)"
    )]
    LimitExceeded {
        /// Requested allocation size in bytes.
        requested: usize,
        /// Bytes currently held in pages.
        current: usize,
        /// Configured heap limit in bytes.
        limit: usize,
    },
}
