//! Core value types shared by the page pool collaborator and the trie cache.
//!
//! Kept deliberately small and `Copy`/`Clone`-friendly, mirroring how the
//! rest of this family of crates separates plain data (`*-types`) from the
//! logic that operates on it.

mod page_index;
mod tokens;

pub use page_index::PageIndex;
pub use tokens::{TokenBlock, TokenId, Tokens};
