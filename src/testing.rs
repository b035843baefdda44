//! In-memory fakes for the out-of-scope collaborator traits (spec §6), used by
//! this crate's own tests and exported for downstream integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collaborators::{
    AnalysisGranularity, DocumentManager, IndexManager, IndexingFinishedHook, ItemIdGenerator, LanguageAnalyzer,
    MiningTaskService, RecommendMatrix, UpdateRecommendBase,
};
use crate::docid::{ContentHash, DocId, IdManager};
use crate::error::{Error, Result};
use crate::property::{Document, PropertyValue};

#[derive(Default)]
pub struct InMemoryIdManager {
    inner: Mutex<InMemoryIdManagerState>,
}

#[derive(Default)]
struct InMemoryIdManagerState {
    by_hash: HashMap<ContentHash, DocId>,
    deleted: std::collections::HashSet<DocId>,
    next: u32,
    max: u32,
}

impl InMemoryIdManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdManager for InMemoryIdManager {
    async fn resolve(&self, hash: ContentHash) -> Option<DocId> {
        let state = self.inner.lock().expect("id manager mutex poisoned");
        state.by_hash.get(&hash).copied().filter(|d| !state.deleted.contains(d))
    }

    async fn assign_new(&self, hash: ContentHash) -> (Option<DocId>, DocId) {
        let mut state = self.inner.lock().expect("id manager mutex poisoned");
        let superseded = state.by_hash.get(&hash).copied();
        let docid = state.next;
        state.next += 1;
        state.max = state.max.max(docid);
        state.by_hash.insert(hash, docid);
        (superseded, docid)
    }

    async fn update_existing(&self, hash: ContentHash, old: DocId, rtype: bool) -> DocId {
        let mut state = self.inner.lock().expect("id manager mutex poisoned");
        if rtype {
            return old;
        }
        state.deleted.insert(old);
        let docid = state.next;
        state.next += 1;
        state.max = state.max.max(docid);
        state.by_hash.insert(hash, docid);
        docid
    }

    async fn max_docid(&self) -> DocId {
        self.inner.lock().expect("id manager mutex poisoned").max
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDocumentManager {
    docs: Mutex<HashMap<DocId, Document>>,
    deleted: Mutex<std::collections::HashSet<DocId>>,
    max_docid: AtomicU32,
}

impl InMemoryDocumentManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentManager for InMemoryDocumentManager {
    async fn insert_document(&self, docid: DocId, doc: Document) -> Result<()> {
        self.docs.lock().expect("document manager mutex poisoned").insert(docid, doc);
        self.max_docid.fetch_max(docid, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_document(&self, docid: DocId) -> Result<()> {
        self.docs.lock().expect("document manager mutex poisoned").remove(&docid);
        self.deleted.lock().expect("document manager mutex poisoned").insert(docid);
        Ok(())
    }

    async fn update_partial_document(&self, docid: DocId, changed: Vec<(String, PropertyValue)>) -> Result<()> {
        let mut docs = self.docs.lock().expect("document manager mutex poisoned");
        let doc = docs
            .get_mut(&docid)
            .ok_or_else(|| Error::store_error(format!("no document {docid} to partially update")))?;
        for (name, value) in changed {
            doc.insert(name, value);
        }
        Ok(())
    }

    async fn get_document(&self, docid: DocId) -> Result<Option<Document>> {
        Ok(self.docs.lock().expect("document manager mutex poisoned").get(&docid).cloned())
    }

    async fn get_property_value(&self, docid: DocId, property: &str) -> Result<Option<PropertyValue>> {
        Ok(self
            .docs
            .lock()
            .expect("document manager mutex poisoned")
            .get(&docid)
            .and_then(|d| d.get(property))
            .cloned())
    }

    async fn get_max_docid(&self) -> Result<DocId> {
        Ok(self.max_docid.load(Ordering::SeqCst))
    }

    async fn is_deleted(&self, docid: DocId) -> Result<bool> {
        Ok(self.deleted.lock().expect("document manager mutex poisoned").contains(&docid))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryIndexManager {
    docs: Mutex<HashMap<DocId, Document>>,
    merge_paused: Mutex<bool>,
}

impl InMemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexManager for InMemoryIndexManager {
    async fn insert_document(&self, docid: DocId, doc: &Document) -> Result<()> {
        self.docs.lock().expect("index manager mutex poisoned").insert(docid, doc.clone());
        Ok(())
    }

    async fn update_document(&self, docid: DocId, doc: &Document) -> Result<()> {
        self.docs.lock().expect("index manager mutex poisoned").insert(docid, doc.clone());
        Ok(())
    }

    async fn update_rtype_document(&self, docid: DocId, changed: &[(String, PropertyValue)]) -> Result<()> {
        let mut docs = self.docs.lock().expect("index manager mutex poisoned");
        let doc = docs
            .get_mut(&docid)
            .ok_or_else(|| Error::store_error(format!("no index entry {docid} to rtype-update")))?;
        for (name, value) in changed {
            doc.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove_document(&self, docid: DocId) -> Result<()> {
        self.docs.lock().expect("index manager mutex poisoned").remove(&docid);
        Ok(())
    }

    async fn num_docs(&self) -> Result<u64> {
        Ok(self.docs.lock().expect("index manager mutex poisoned").len() as u64)
    }

    async fn pause_merge(&self) -> Result<()> {
        *self.merge_paused.lock().expect("index manager mutex poisoned") = true;
        Ok(())
    }

    async fn resume_merge(&self) -> Result<()> {
        *self.merge_paused.lock().expect("index manager mutex poisoned") = false;
        Ok(())
    }

    async fn optimize_index(&self) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}

/// Trivial analyzer that tokenizes on whitespace and hashes each token with
/// blake3, truncated to 64 bits — deterministic and collision-unlikely enough
/// for tests.
#[derive(Default)]
pub struct WhitespaceAnalyzer;

#[async_trait]
impl LanguageAnalyzer for WhitespaceAnalyzer {
    async fn term_id_list(
        &self,
        text: &str,
        _analyzer_name: &str,
        out: &mut Vec<u64>,
        granularity: AnalysisGranularity,
    ) -> Result<()> {
        let chunks: Vec<&str> = match granularity {
            AnalysisGranularity::Word => text.split_whitespace().collect(),
            AnalysisGranularity::Sentence => text.split(['.', '!', '?']).map(str::trim).filter(|s| !s.is_empty()).collect(),
        };
        for chunk in chunks {
            let digest = blake3::hash(chunk.as_bytes());
            let bytes: [u8; 8] = digest.as_bytes()[..8].try_into().expect("blake3 digest >= 8 bytes");
            out.push(u64::from_le_bytes(bytes));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryItemIdGenerator {
    ids: Mutex<HashMap<String, u64>>,
    next: AtomicU32,
}

impl InMemoryItemIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ItemIdGenerator for InMemoryItemIdGenerator {
    async fn str_id_to_item_id(&self, item_str: &str) -> Option<u64> {
        let mut ids = self.ids.lock().expect("item id generator mutex poisoned");
        if let Some(id) = ids.get(item_str) {
            return Some(*id);
        }
        let id = self.next.fetch_add(1, Ordering::SeqCst) as u64;
        ids.insert(item_str.to_string(), id);
        Some(id)
    }
}

/// Records whether the hook fired and what timestamp it last saw; always
/// returns `true` (successful completion) unless `fail_next` is set.
#[derive(Default)]
pub struct RecordingIndexingFinishedHook {
    pub last_timestamp_micros: Mutex<Option<i64>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingIndexingFinishedHook {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexingFinishedHook for RecordingIndexingFinishedHook {
    async fn on_indexing_finished(&self, timestamp_micros: i64) -> bool {
        *self.last_timestamp_micros.lock().expect("hook mutex poisoned") = Some(timestamp_micros);
        !self.fail.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct CountingMiningTaskService {
    pub calls: AtomicU32,
}

impl CountingMiningTaskService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MiningTaskService for CountingMiningTaskService {
    async fn mine(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRecommendMatrix {
    pub visits: Mutex<Vec<(String, u64)>>,
    pub purchases: Mutex<Vec<(String, Vec<u64>)>>,
    pub covisits: Mutex<Vec<(u64, u64)>>,
}

impl InMemoryRecommendMatrix {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecommendMatrix for InMemoryRecommendMatrix {
    async fn record_visit(&self, user: &str, item: u64) -> Result<()> {
        self.visits.lock().unwrap().push((user.to_string(), item));
        Ok(())
    }

    async fn record_purchase(&self, user: &str, items: &[u64]) -> Result<()> {
        self.purchases.lock().unwrap().push((user.to_string(), items.to_vec()));
        Ok(())
    }

    async fn record_covisit(&self, item_a: u64, item_b: u64) -> Result<()> {
        self.covisits.lock().unwrap().push((item_a, item_b));
        Ok(())
    }
}

/// Reports `need_rebuild` until [`InMemoryUpdateRecommendBase::mark_fresh`] is
/// called, mirroring a real similarity matrix's staleness flag.
#[derive(Default)]
pub struct InMemoryUpdateRecommendBase {
    pub build_calls: AtomicU32,
    pub flush_calls: AtomicU32,
    need_rebuild: std::sync::atomic::AtomicBool,
}

impl InMemoryUpdateRecommendBase {
    pub fn new() -> Self {
        Self {
            need_rebuild: std::sync::atomic::AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn mark_fresh(&self) {
        self.need_rebuild.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpdateRecommendBase for InMemoryUpdateRecommendBase {
    async fn build_purchase_sim_matrix(&self) -> Result<()> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        self.need_rebuild.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn flush_recommend_matrix(&self) -> Result<()> {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn need_rebuild_purchase_sim_matrix(&self) -> bool {
        self.need_rebuild.load(Ordering::SeqCst)
    }
}
