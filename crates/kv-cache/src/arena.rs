use kv_cache_pool::PageHandle;
use kv_cache_types::TokenBlock;

use crate::node::{NodeId, TrieNode};

/// Arena of trie nodes addressed by integer handle.
///
/// The natural representation for a tree with parent back-links in a
/// language without a tracing GC: nodes live in a `Vec`, freed slots are
/// recycled, and `NodeId` equality stands in for the pointer identity
/// `TrieNode` uses in the design this is grounded on (nodes compare equal
/// only by identity, never by token content — see `node.rs`).
#[derive(Debug)]
pub(crate) struct Arena {
    nodes: Vec<Option<TrieNode>>,
    free: Vec<NodeId>,
}

impl Arena {
    /// Build an arena containing only the root, bound to `root_page`.
    pub(crate) fn new(root_page: PageHandle) -> Self {
        let root = TrieNode {
            tokens: TokenBlock::empty(),
            page: root_page,
            children: hashbrown::HashMap::new(),
            parent: None,
            ref_count: 0,
            access_time: 0,
        };
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> &TrieNode {
        self.nodes[id.0 as usize]
            .as_ref()
            .expect("NodeId referenced a slot that was never populated or was reclaimed")
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut TrieNode {
        self.nodes[id.0 as usize]
            .as_mut()
            .expect("NodeId referenced a slot that was never populated or was reclaimed")
    }

    /// Insert a new child under `parent`, keyed by `tokens`. Precondition:
    /// `tokens` is not already a key in `parent`'s children (callers check
    /// this themselves — see the publish-collision handling in `cache.rs`
    /// — since the caller needs to branch on the answer either way).
    pub(crate) fn create_child(
        &mut self,
        parent: NodeId,
        tokens: TokenBlock,
        page: PageHandle,
        access_time: u64,
    ) -> NodeId {
        let node = TrieNode {
            tokens: tokens.clone(),
            page,
            children: hashbrown::HashMap::new(),
            parent: Some(parent),
            ref_count: 0,
            access_time,
        };
        let id = if let Some(id) = self.free.pop() {
            self.nodes[id.0 as usize] = Some(node);
            id
        } else {
            let id = NodeId(u32::try_from(self.nodes.len()).expect("arena stays well under u32"));
            self.nodes.push(Some(node));
            id
        };
        self.get_mut(parent).children.insert(tokens, id);
        id
    }

    /// Remove `id` from its parent's children and clear its parent link.
    /// No-op on the root.
    pub(crate) fn unlink(&mut self, id: NodeId) {
        if id == NodeId::ROOT {
            return;
        }
        let parent = self.get(id).parent;
        if let Some(parent) = parent {
            let tokens = self.get(id).tokens.clone();
            self.get_mut(parent).children.remove(&tokens);
        }
        self.get_mut(id).parent = None;
    }

    /// Free `id`'s arena slot for reuse. Callers must have already
    /// unlinked it and must guarantee no live reference (trie or
    /// Allocation) still names it.
    pub(crate) fn reclaim(&mut self, id: NodeId) {
        debug_assert_ne!(id, NodeId::ROOT, "the root is never reclaimed");
        self.nodes[id.0 as usize] = None;
        self.free.push(id);
    }

    /// All currently-populated node ids. Test-only introspection for the
    /// property tests in `tests.rs` (invariants 1, 2, and 4 in spec.md §8
    /// all quantify over "every node").
    #[cfg(test)]
    pub(crate) fn iter_existing(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(index, slot)| {
            slot.is_some()
                .then(|| NodeId(u32::try_from(index).expect("arena stays well under u32")))
        })
    }
}
