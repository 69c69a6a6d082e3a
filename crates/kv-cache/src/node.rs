use hashbrown::HashMap;
use kv_cache_pool::PageHandle;
use kv_cache_types::TokenBlock;

/// Handle to a [`TrieNode`] inside a [`crate::arena::Arena`].
///
/// `NodeId(0)` always identifies the root. Arena slots are reused after
/// eviction, so a `NodeId` is only meaningful relative to the arena that
/// produced it — nothing about this type carries a generation check,
/// because the cache never exposes a `NodeId` outside itself long enough
/// for staleness to matter (callers only ever see `Allocation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) const ROOT: Self = Self(0);
}

/// A node in the block trie. Bound one-to-one to a physical page, except
/// the root which holds the pool's reserved sentinel.
#[derive(Debug)]
pub struct TrieNode {
    /// The exact token block this node's page realizes; empty only for the root.
    pub(crate) tokens: TokenBlock,
    pub(crate) page: PageHandle,
    pub(crate) children: HashMap<TokenBlock, NodeId>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) ref_count: u32,
    /// Logical clock value, not wall-clock time — see [`crate::cache::CacheInner::clock`].
    pub(crate) access_time: u64,
}

impl TrieNode {
    pub(crate) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}
