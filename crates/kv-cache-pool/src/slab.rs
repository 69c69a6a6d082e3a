use kv_cache_types::PageIndex;
use tracing::{debug, trace};

use crate::{PageHandle, PagePool};

/// Reference `PagePool`: a fixed-capacity slab of page indices with a
/// free-list stack. Index `0` is never handed out — it is reserved for the
/// trie root's sentinel page, matching [`PageHandle::root`].
#[derive(Debug)]
pub struct SlabPagePool {
    capacity: usize,
    free: Vec<PageIndex>,
}

impl SlabPagePool {
    /// Build a pool with `capacity` allocatable pages (indices `1..=capacity`).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let free = (1..=capacity as u64).rev().map(PageIndex::new).collect();
        Self { capacity, free }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl PagePool for SlabPagePool {
    fn acquire_free_pages(&mut self, n: usize) -> Option<Vec<PageHandle>> {
        if n == 0 {
            return Some(Vec::new());
        }
        if self.free.len() < n {
            trace!(requested = n, available = self.free.len(), "pool short on pages");
            return None;
        }
        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            let index = self.free.pop().expect("checked len >= n above");
            pages.push(PageHandle {
                index,
                token_offset: 0,
                token_count: 0,
            });
        }
        debug!(acquired = n, remaining = self.free.len(), "acquire_free_pages");
        Some(pages)
    }

    fn free_pages(&mut self, pages: Vec<PageHandle>) {
        let freed = pages.len();
        for page in pages {
            debug_assert_ne!(
                page.index,
                PageIndex::ROOT,
                "root sentinel page must never be freed back into the pool"
            );
            self.free.push(page.index);
        }
        debug!(freed, available = self.free.len(), "free_pages");
    }

    fn available_pages(&self) -> usize {
        self.free.len()
    }
}
