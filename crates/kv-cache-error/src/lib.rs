//! Error types for the prefix-sharing KV page cache.
//!
//! Only two conditions are recoverable runtime states; everything else
//! spec.md calls an invariant violation is a programmer error and panics
//! via `assert!`/`debug_assert!` at the point of violation rather than
//! being threaded through `Result`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Raised at construction time for a non-positive `tokens_per_page`.
    #[error("invalid argument: {what} ({reason})")]
    InvalidArgument { what: String, reason: String },

    /// Raised by `acquire_pages_for_tokens` when the pool cannot supply the
    /// requested page count even after LRU eviction of unreferenced leaves.
    #[error(
        "failed to allocate {requested_pages} page(s) after attempting LRU eviction \
         ({available_pages} available)"
    )]
    AllocationFailed {
        requested_pages: usize,
        available_pages: usize,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;
