//! Document identity: the 128-bit content hash of an external DOCID string, and
//! the opaque 32-bit internal docid the Id Manager hands out (spec §3).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque internal document id.
pub type DocId = u32;

/// Content-addressed 128-bit key derived from an external DOCID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub u128);

impl ContentHash {
    /// Hashes the external DOCID string to a 128-bit key via blake3, truncated to
    /// its first 16 bytes (spec §3: "external DOCID ... hashed to a 128-bit key via
    /// a content hash").
    pub fn of(docid_str: &str) -> Self {
        let digest = blake3::hash(docid_str.as_bytes());
        let bytes: [u8; 16] = digest.as_bytes()[..16].try_into().expect("blake3 digest >= 16 bytes");
        Self(u128::from_le_bytes(bytes))
    }
}

/// Narrow contract for the out-of-scope id-mapping store (spec §3, §6).
///
/// Invariant upheld by implementations: for a given hash, at most one live docid.
#[async_trait]
pub trait IdManager: Send + Sync {
    /// Resolves a content hash to its currently live docid, if any.
    async fn resolve(&self, hash: ContentHash) -> Option<DocId>;

    /// Assigns a fresh docid for a hash that has never been seen, or whose prior
    /// docid was already deleted. Returns the previous docid (if this hash had one
    /// that is being superseded) alongside the freshly issued one.
    async fn assign_new(&self, hash: ContentHash) -> (Option<DocId>, DocId);

    /// Updates the mapping for `hash` whose previous docid was `old`. When
    /// `rtype` is true the docid is reused unchanged (spec §3: "R-type updates
    /// reuse the existing docid"); otherwise `old` is marked deleted and a fresh
    /// docid greater than the previous max is issued.
    async fn update_existing(&self, hash: ContentHash, old: DocId, rtype: bool) -> DocId;

    /// The highest docid this manager has ever issued.
    async fn max_docid(&self) -> DocId;

    /// Durably persists the hash→docid mapping table (spec §4.6: "flush document
    /// store and id manager").
    async fn flush(&self) -> crate::error::Result<()>;
}
