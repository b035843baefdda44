//! Trait contracts for the named external collaborators the spec treats as
//! out-of-scope storage engines (spec §6): the document store, the inverted-index
//! store, the language analyzer and the item-id generator. This crate only
//! depends on these narrow interfaces; concrete durable implementations live
//! outside this core. See [`crate::testing`] for in-memory fakes used in tests.

use async_trait::async_trait;

use crate::docid::DocId;
use crate::error::Result;
use crate::property::{Document, PropertyValue};

/// Out-of-scope document store (spec §6 `DocumentManager`).
#[async_trait]
pub trait DocumentManager: Send + Sync {
    async fn insert_document(&self, docid: DocId, doc: Document) -> Result<()>;
    async fn remove_document(&self, docid: DocId) -> Result<()>;
    /// Rewrites only the named properties of an existing document (R-type path).
    async fn update_partial_document(&self, docid: DocId, changed: Vec<(String, PropertyValue)>) -> Result<()>;
    async fn get_document(&self, docid: DocId) -> Result<Option<Document>>;
    async fn get_property_value(&self, docid: DocId, property: &str) -> Result<Option<PropertyValue>>;
    async fn get_max_docid(&self) -> Result<DocId>;
    async fn is_deleted(&self, docid: DocId) -> Result<bool>;
    async fn flush(&self) -> Result<()>;
}

/// Out-of-scope inverted-index store (spec §6 `IndexManager`).
#[async_trait]
pub trait IndexManager: Send + Sync {
    async fn insert_document(&self, docid: DocId, doc: &Document) -> Result<()>;
    async fn update_document(&self, docid: DocId, doc: &Document) -> Result<()>;
    /// Rewrites only filter/store columns named in `changed`, leaving forward
    /// indices (tokenized fields) untouched — the R-type fast path.
    async fn update_rtype_document(&self, docid: DocId, changed: &[(String, PropertyValue)]) -> Result<()>;
    async fn remove_document(&self, docid: DocId) -> Result<()>;
    async fn num_docs(&self) -> Result<u64>;
    async fn pause_merge(&self) -> Result<()>;
    async fn resume_merge(&self) -> Result<()>;
    async fn optimize_index(&self) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    /// Forces a commit regardless of the current index mode; used by the backup
    /// decision (spec §4.6: "force-commit the index and copy current→next").
    async fn commit(&self) -> Result<()>;
}

/// Granularity at which the language analyzer tokenizes a field (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisGranularity {
    Word,
    Sentence,
}

/// Out-of-scope language analyzer (spec §6 `LanguageAnalyzer`).
#[async_trait]
pub trait LanguageAnalyzer: Send + Sync {
    /// Tokenizes `text` and appends resolved term ids to `out`, resolving unseen
    /// terms through `id_mgr`-like term dictionaries owned by the analyzer itself.
    async fn term_id_list(
        &self,
        text: &str,
        analyzer_name: &str,
        out: &mut Vec<u64>,
        granularity: AnalysisGranularity,
    ) -> Result<()>;
}

/// Out-of-scope item-id generator used by the recommend pipeline (spec §6
/// `ItemIdGenerator`).
#[async_trait]
pub trait ItemIdGenerator: Send + Sync {
    async fn str_id_to_item_id(&self, item_str: &str) -> Option<u64>;
}

/// Hook invoked once per build pass after all files have been dispatched and the
/// index has been flushed/committed (spec §4.6 "trigger the indexing-finished
/// hook (abort on false return)"). Receives a microsecond-scale timestamp per the
/// resolved Open Question in DESIGN.md, while every store-facing API in this
/// crate uses second-scale `DateTime<Utc>`.
#[async_trait]
pub trait IndexingFinishedHook: Send + Sync {
    async fn on_indexing_finished(&self, timestamp_micros: i64) -> bool;
}

/// Mining/similarity collaborator invoked under a merge-pause at the end of a
/// build pass (spec §4.6 "under a merge-pause, invoke the mining collaborator").
#[async_trait]
pub trait MiningTaskService: Send + Sync {
    async fn mine(&self) -> Result<()>;
}

/// Per-category co-occurrence channel fed by the Recommend Task Service (spec
/// §6 `RecommendMatrix`): visit, purchase and co-visit updates.
#[async_trait]
pub trait RecommendMatrix: Send + Sync {
    async fn record_visit(&self, user: &str, item: u64) -> Result<()>;
    async fn record_purchase(&self, user: &str, items: &[u64]) -> Result<()>;
    async fn record_covisit(&self, item_a: u64, item_b: u64) -> Result<()>;
}

/// Purchase similarity matrix coordinator (spec §6 `UpdateRecommendBase`).
#[async_trait]
pub trait UpdateRecommendBase: Send + Sync {
    async fn build_purchase_sim_matrix(&self) -> Result<()>;
    async fn flush_recommend_matrix(&self) -> Result<()>;
    async fn need_rebuild_purchase_sim_matrix(&self) -> bool;
}
