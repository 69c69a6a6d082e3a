use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use hashbrown::HashSet;
use kv_cache_error::{CacheError, Result};
use kv_cache_pool::{PageHandle, PagePool};
use kv_cache_types::{TokenBlock, Tokens};
use tracing::{debug, trace, warn};

use crate::alloc::Allocation;
use crate::arena::Arena;
use crate::node::NodeId;

/// The trie-structured, LRU-evicting prefix cache.
///
/// A thin handle around `Arc<Mutex<CacheInner>>` — matching the shape of
/// this family's single-writer pager, whose transaction handles likewise
/// hold a cloned `Arc<Mutex<PagerInner>>` rather than borrowing the pager.
/// Spec.md specifies the cache as a single-threaded serialized component;
/// the `Mutex` is how a (potentially multi-threaded) host satisfies that
/// contract without the cache needing to know its caller is concurrent.
pub struct Cache<P: PagePool> {
    inner: Arc<Mutex<CacheInner<P>>>,
}

impl<P: PagePool> Clone for Cache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct CacheInner<P: PagePool> {
    pub(crate) arena: Arena,
    pub(crate) leaves: HashSet<NodeId>,
    pub(crate) pool: P,
    pub(crate) tokens_per_page: usize,
    /// Logical clock, not wall time: incremented on every node touch, so
    /// ties in `access_time` are structurally impossible and eviction
    /// order is deterministic without needing a secondary tie-break key.
    clock: u64,
    evictions_total: u64,
}

impl<P: PagePool> Cache<P> {
    /// Construct a cache backed by `pool`. `tokens_per_page` must be positive.
    pub fn new(pool: P, tokens_per_page: usize) -> Result<Self> {
        if tokens_per_page == 0 {
            return Err(CacheError::InvalidArgument {
                what: "tokens_per_page".to_owned(),
                reason: "must be positive".to_owned(),
            });
        }
        let inner = CacheInner {
            arena: Arena::new(PageHandle::root()),
            leaves: HashSet::new(),
            pool,
            tokens_per_page,
            clock: 0,
            evictions_total: 0,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    #[must_use]
    pub fn tokens_per_page(&self) -> usize {
        self.lock().tokens_per_page
    }

    /// Total number of pages evicted over the cache's lifetime. Ambient
    /// observability, not part of the cache's correctness contract.
    #[must_use]
    pub fn evictions_total(&self) -> u64 {
        self.lock().evictions_total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<P>> {
        self.inner.lock().expect("cache mutex poisoned")
    }

    /// Match `tokens` against the trie, acquire pages for any uncached
    /// suffix (evicting LRU leaves if the pool is short), and return the
    /// resulting [`Allocation`]. See spec.md §4.3.
    pub fn acquire_pages_for_tokens(
        &self,
        tokens: Tokens,
        extra_token_slots: usize,
    ) -> Result<Allocation<P>> {
        let mut inner = self.lock();

        let (node, matched) = inner.match_tokens(&tokens);
        inner.arena.get_mut(node).ref_count += 1;

        let cached_tokens = matched.len() * inner.tokens_per_page;
        let need_tokens = tokens
            .len()
            .saturating_sub(cached_tokens)
            .saturating_add(extra_token_slots);
        let need_pages = if need_tokens == 0 {
            0
        } else {
            need_tokens.div_ceil(inner.tokens_per_page)
        };

        debug!(
            requested_tokens = tokens.len(),
            matched_pages = matched.len(),
            need_pages,
            "acquire_pages_for_tokens"
        );

        let new_pages = match inner.pool.acquire_free_pages(need_pages) {
            Some(pages) => pages,
            None => {
                let deficit = need_pages.saturating_sub(inner.pool.available_pages());
                inner.evict_pages(deficit);
                match inner.pool.acquire_free_pages(need_pages) {
                    Some(pages) => pages,
                    None => {
                        // Unwind the pin from the match step: the caller
                        // never receives an Allocation to release this
                        // through, so the matched node must not be left
                        // holding a phantom reference (spec.md §9).
                        inner.arena.get_mut(node).ref_count -= 1;
                        let available_pages = inner.pool.available_pages();
                        warn!(
                            need_pages,
                            available_pages, "allocation failed after LRU eviction"
                        );
                        return Err(CacheError::AllocationFailed {
                            requested_pages: need_pages,
                            available_pages,
                        });
                    }
                }
            }
        };

        let start_index = cached_tokens;
        Ok(Allocation::new(
            Arc::clone(&self.inner),
            tokens,
            node,
            matched,
            new_pages,
            start_index,
        ))
    }
}

impl<P: PagePool> CacheInner<P> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Walk the trie along `tokens`' whole blocks as far as it goes.
    /// Pure: no refcount or leaf-set mutation besides touching
    /// `access_time` on each matched node (the LRU signal).
    pub(crate) fn match_tokens(&mut self, tokens: &Tokens) -> (NodeId, Vec<PageHandle>) {
        let mut cur = NodeId::ROOT;
        let mut matched = Vec::new();
        for block in tokens.blocks(self.tokens_per_page) {
            let Some(&child) = self.arena.get(cur).children.get(&block) else {
                break;
            };
            let now = self.tick();
            let child_node = self.arena.get_mut(child);
            child_node.access_time = now;
            matched.push(child_node.page);
            cur = child;
        }
        (cur, matched)
    }

    /// Graft `(block, page)` under `parent`, or — if `parent` already has a
    /// child keyed by `block` — descend into that existing child and hand
    /// the now-duplicate `page` back for the caller to return to the pool.
    ///
    /// This is the fix for the publish-overwrite bug spec.md §9 flags in
    /// the inherited design: the naive `create_child` would silently
    /// replace the existing child, orphaning its subtree without
    /// reclaiming its refcounts or pages.
    ///
    /// Returns `(node_to_descend_into, page_actually_in_the_trie, duplicate_page_if_any)`.
    pub(crate) fn graft(
        &mut self,
        parent: NodeId,
        block: TokenBlock,
        page: PageHandle,
    ) -> (NodeId, PageHandle, Option<PageHandle>) {
        if let Some(&existing) = self.arena.get(parent).children.get(&block) {
            let existing_page = self.arena.get(existing).page;
            return (existing, existing_page, Some(page));
        }

        let was_leaf = parent != NodeId::ROOT && self.arena.get(parent).is_leaf();
        let now = self.tick();
        let child = self.arena.create_child(parent, block, page, now);
        if was_leaf {
            self.leaves.remove(&parent);
        }
        self.leaves.insert(child);
        (child, page, None)
    }

    /// LRU-evict unreferenced leaves until `max_pages` have been reclaimed
    /// or there are none left to evict. Returns the number evicted.
    pub(crate) fn evict_pages(&mut self, max_pages: usize) -> usize {
        if max_pages == 0 {
            return 0;
        }

        let mut heap: BinaryHeap<Reverse<(u64, NodeId)>> = self
            .leaves
            .iter()
            .copied()
            .filter(|&leaf| self.arena.get(leaf).ref_count == 0)
            .map(|leaf| Reverse((self.arena.get(leaf).access_time, leaf)))
            .collect();

        let mut evicted_pages = Vec::new();
        while evicted_pages.len() < max_pages {
            let Some(Reverse((_, leaf))) = heap.pop() else {
                break;
            };

            let page = self.arena.get(leaf).page;
            let parent = self.arena.get(leaf).parent;
            trace!(?leaf, "evicting leaf");

            self.arena.unlink(leaf);
            self.leaves.remove(&leaf);
            self.arena.reclaim(leaf);
            evicted_pages.push(page);

            if let Some(parent) = parent {
                if parent != NodeId::ROOT && self.arena.get(parent).is_leaf() {
                    self.leaves.insert(parent);
                    if self.arena.get(parent).ref_count == 0 {
                        let access_time = self.arena.get(parent).access_time;
                        heap.push(Reverse((access_time, parent)));
                    }
                }
            }
        }

        let evicted = evicted_pages.len();
        if evicted > 0 {
            self.evictions_total = self.evictions_total.saturating_add(evicted as u64);
            debug!(requested = max_pages, evicted, "_evict_pages");
            self.pool.free_pages(evicted_pages);
        }
        evicted
    }
}

#[cfg(test)]
impl<P: PagePool> Cache<P> {
    /// Evict up to `max_pages`. Exposed for tests only — hosts never call
    /// eviction directly; it is an internal consequence of acquisition.
    pub(crate) fn debug_evict_pages(&self, max_pages: usize) -> usize {
        self.lock().evict_pages(max_pages)
    }

    pub(crate) fn debug_leaf_count(&self) -> usize {
        self.lock().leaves.len()
    }

    /// Recompute the leaf set from scratch and compare it to the
    /// maintained `leaves` set — spec.md §8 invariant 1.
    pub(crate) fn debug_leaves_match_childless_non_root(&self) -> bool {
        let inner = self.lock();
        let recomputed: HashSet<NodeId> = inner
            .arena
            .iter_existing()
            .filter(|&id| id != NodeId::ROOT && inner.arena.get(id).is_leaf())
            .collect();
        recomputed == inner.leaves
    }

    /// Sum of `ref_count` over every node — spec.md §8 invariant 2.
    pub(crate) fn debug_sum_ref_counts(&self) -> u64 {
        let inner = self.lock();
        inner
            .arena
            .iter_existing()
            .map(|id| u64::from(inner.arena.get(id).ref_count))
            .sum()
    }

    /// Number of non-root nodes currently in the trie — used together with
    /// pool bookkeeping for spec.md §8 invariant 4.
    pub(crate) fn debug_trie_page_count(&self) -> usize {
        let inner = self.lock();
        inner
            .arena
            .iter_existing()
            .filter(|&id| id != NodeId::ROOT)
            .count()
    }

    pub(crate) fn debug_available_pages(&self) -> usize {
        self.lock().pool.available_pages()
    }
}
