//! Prefix-sharing paged cache for LLM attention KV state.
//!
//! A trie keyed by consecutive token blocks maps any token prefix to the
//! pages realizing it. Sequences that share a prefix (a system prompt,
//! few-shot examples, identical chat history) share the pages for that
//! prefix instead of each holding a private copy; pages are reclaimed from
//! unreferenced leaves, least-recently-used first, when the external pool
//! runs short.
//!
//! The page pool itself — the fixed array of physical pages, and how they
//! get filled with tensor data — is someone else's problem; see
//! [`kv_cache_pool::PagePool`]. This crate is the trie, the allocation
//! handle, and the acquire/publish/release/evict protocol that keeps
//! reference counts, trie membership, and pool accounting consistent
//! under a sequence of calls.
//!
//! The cache is specified as a single-threaded serialized component (see
//! spec.md §5): [`Cache`] may be cloned and shared across threads, but
//! every method call is globally serialized behind an internal mutex, not
//! interleaved at finer grain.

mod alloc;
mod arena;
mod cache;
mod node;

pub use alloc::Allocation;
pub use cache::Cache;

#[cfg(test)]
mod tests;
