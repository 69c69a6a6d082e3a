use std::sync::{Arc, Mutex};

use kv_cache_pool::{PageHandle, PagePool};
use kv_cache_types::Tokens;
use tracing::trace;

use crate::cache::CacheInner;
use crate::node::NodeId;

/// A caller's hold on a sequence's pages: some already shared via the
/// trie, some freshly acquired and not yet visible to anyone else.
///
/// Dropping an `Allocation` without calling [`Allocation::release_pages`]
/// still releases it — spec.md §5 calls an un-released drop "a leak of
/// one refcount" and "encourages tying release to scope exit", which is
/// exactly what `Drop` gives for free here, matching how this crate
/// family's transaction handles release their writer lock on drop if the
/// caller never committed.
pub struct Allocation<P: PagePool> {
    inner: Arc<Mutex<CacheInner<P>>>,
    tokens: Tokens,
    last_cached_node: NodeId,
    cached_pages: Vec<PageHandle>,
    newly_acquired_pages: Vec<PageHandle>,
    start_index: usize,
    released: bool,
}

impl<P: PagePool> Allocation<P> {
    pub(crate) fn new(
        inner: Arc<Mutex<CacheInner<P>>>,
        tokens: Tokens,
        last_cached_node: NodeId,
        cached_pages: Vec<PageHandle>,
        newly_acquired_pages: Vec<PageHandle>,
        start_index: usize,
    ) -> Self {
        Self {
            inner,
            tokens,
            last_cached_node,
            cached_pages,
            newly_acquired_pages,
            start_index,
            released: false,
        }
    }

    /// All pages this allocation carries, cached followed by newly-acquired,
    /// in sequence order.
    pub fn pages(&self) -> impl Iterator<Item = PageHandle> + '_ {
        self.cached_pages
            .iter()
            .chain(self.newly_acquired_pages.iter())
            .copied()
    }

    #[must_use]
    pub fn cached_pages(&self) -> &[PageHandle] {
        &self.cached_pages
    }

    #[must_use]
    pub fn newly_acquired_pages(&self) -> &[PageHandle] {
        &self.newly_acquired_pages
    }

    #[must_use]
    pub fn start_index(&self) -> usize {
        self.start_index
    }

    #[must_use]
    pub fn tokens(&self) -> &Tokens {
        &self.tokens
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Graft pages up to `up_to_page_index` into the trie, making them
    /// visible to future matches. Monotone: a call with an index at or
    /// below what has already been published is a no-op. See spec.md §4.4.
    pub fn publish_pages(&mut self, up_to_page_index: usize) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let tokens_per_page = inner.tokens_per_page;

        let publish_tokens = self
            .tokens
            .len()
            .min(up_to_page_index.saturating_mul(tokens_per_page));
        let start_token = self.cached_pages.len() * tokens_per_page;
        if publish_tokens <= start_token {
            return;
        }

        let blocks = self
            .tokens
            .whole_blocks_in_range(start_token, publish_tokens, tokens_per_page);
        let k = blocks.len().min(self.newly_acquired_pages.len());
        if k == 0 {
            return;
        }

        let mut cur = self.last_cached_node;
        let mut duplicates = Vec::new();
        let taken: Vec<PageHandle> = self.newly_acquired_pages.drain(..k).collect();
        for (block, page) in blocks.into_iter().take(k).zip(taken) {
            let (next, used, duplicate) = inner.graft(cur, block, page);
            if let Some(duplicate) = duplicate {
                duplicates.push(duplicate);
            }
            self.cached_pages.push(used);
            cur = next;
        }

        if !duplicates.is_empty() {
            trace!(count = duplicates.len(), "returning duplicate published pages to pool");
            inner.pool.free_pages(duplicates);
        }

        inner.arena.get_mut(self.last_cached_node).ref_count -= 1;
        inner.arena.get_mut(cur).ref_count += 1;
        self.last_cached_node = cur;
    }

    /// Idempotent: the first call decrements the held node's refcount and
    /// returns any never-published pages to the pool; later calls are a
    /// no-op.
    pub fn release_pages(&mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.arena.get_mut(self.last_cached_node).ref_count -= 1;

        // spec.md §4.5/§9 leaves the fate of never-published pages to host
        // contract; this crate's contract (SPEC_FULL.md §F.4) is that
        // release returns them itself rather than leaking them silently.
        if !self.newly_acquired_pages.is_empty() {
            let leftover = std::mem::take(&mut self.newly_acquired_pages);
            inner.pool.free_pages(leftover);
        }

        self.released = true;
    }
}

impl<P: PagePool> Drop for Allocation<P> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
