use smallvec::SmallVec;

/// A single token id. The cache never interprets these beyond equality.
pub type TokenId = u32;

/// The exact block of `tokens_per_page` token ids a page realizes.
///
/// Hashable and content-equal by design: two nodes anywhere in the trie may
/// legitimately carry the same block under different parents (see the
/// collision note in the cache's publish path), so `TokenBlock` identity is
/// never used to distinguish trie nodes, only to key a node's children map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenBlock(SmallVec<[TokenId; 16]>);

impl TokenBlock {
    #[must_use]
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    #[must_use]
    pub fn as_slice(&self) -> &[TokenId] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn from_slice(slice: &[TokenId]) -> Self {
        Self(SmallVec::from_slice(slice))
    }
}

/// The full token sequence a caller wants pages for.
///
/// Wraps a plain `Vec` and adds the one piece of domain logic every caller
/// of this type needs: segmenting into whole, `tokens_per_page`-sized
/// blocks while dropping a trailing partial block, since only whole blocks
/// are ever cacheable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokens(Vec<TokenId>);

impl Tokens {
    #[must_use]
    pub fn new(tokens: Vec<TokenId>) -> Self {
        Self(tokens)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[TokenId] {
        &self.0
    }

    /// Whole `tokens_per_page`-sized blocks, in order, dropping any
    /// trailing partial block.
    pub fn blocks(&self, tokens_per_page: usize) -> impl Iterator<Item = TokenBlock> + '_ {
        self.0
            .chunks(tokens_per_page)
            .filter(move |chunk| chunk.len() == tokens_per_page)
            .map(TokenBlock::from_slice)
    }

    /// Whole blocks whose token range falls within `[start_token, end_token)`.
    ///
    /// Used by publication, which grafts a specific absolute token range
    /// rather than the whole sequence.
    #[must_use]
    pub fn whole_blocks_in_range(
        &self,
        start_token: usize,
        end_token: usize,
        tokens_per_page: usize,
    ) -> Vec<TokenBlock> {
        if start_token >= end_token || start_token >= self.0.len() {
            return Vec::new();
        }
        let end_token = end_token.min(self.0.len());
        self.0[start_token..end_token]
            .chunks(tokens_per_page)
            .filter(|chunk| chunk.len() == tokens_per_page)
            .map(TokenBlock::from_slice)
            .collect()
    }
}
