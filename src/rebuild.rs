//! Rebuild Coordinator (C8): re-indexes every live document from a source
//! Document store into a fresh target store, bypassing the bundle file parser
//! entirely (spec §4.8).

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::collaborators::{AnalysisGranularity, DocumentManager, IndexManager, LanguageAnalyzer};
use crate::docid::{ContentHash, DocId, IdManager};
use crate::error::{Error, Result};
use crate::property::{canonical_date_string, Document, PropertyValue, DATE_PROPERTY, DOCID_PROPERTY};

#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub reindexed: u64,
    pub skipped_deleted: u64,
    pub skipped_errors: u64,
}

/// Walks docids `0..=max_docid_hint`, re-emitting each live document through
/// the insert path against a fresh target store (spec §4.8). The caller
/// supplies `max_docid_hint` (typically the source store's `get_max_docid()`)
/// since [`DocumentManager`] has no native "list all docids" operation.
pub struct RebuildCoordinator {
    source_doc_mgr: Arc<dyn DocumentManager>,
    target_doc_mgr: Arc<dyn DocumentManager>,
    target_index_mgr: Arc<dyn IndexManager>,
    target_id_mgr: Arc<dyn IdManager>,
    analyzer: Arc<dyn LanguageAnalyzer>,
}

impl RebuildCoordinator {
    pub fn new(
        source_doc_mgr: Arc<dyn DocumentManager>,
        target_doc_mgr: Arc<dyn DocumentManager>,
        target_index_mgr: Arc<dyn IndexManager>,
        target_id_mgr: Arc<dyn IdManager>,
        analyzer: Arc<dyn LanguageAnalyzer>,
    ) -> Self {
        Self {
            source_doc_mgr,
            target_doc_mgr,
            target_index_mgr,
            target_id_mgr,
            analyzer,
        }
    }

    pub async fn rebuild(&self, max_docid_hint: DocId) -> Result<RebuildReport> {
        let mut report = RebuildReport::default();

        for docid in 0..=max_docid_hint {
            if self.source_doc_mgr.is_deleted(docid).await? {
                report.skipped_deleted += 1;
                continue;
            }
            let Some(doc) = self.source_doc_mgr.get_document(docid).await? else {
                report.skipped_deleted += 1;
                continue;
            };

            match self.reindex_one(doc).await {
                Ok(()) => report.reindexed += 1,
                Err(e) => {
                    warn!(docid, error = %e, "skipping document during rebuild");
                    report.skipped_errors += 1;
                }
            }
        }

        self.target_doc_mgr.flush().await?;
        self.target_id_mgr.flush().await?;
        self.target_index_mgr.flush().await?;
        info!(
            reindexed = report.reindexed,
            skipped_deleted = report.skipped_deleted,
            skipped_errors = report.skipped_errors,
            "rebuild complete"
        );
        Ok(report)
    }

    async fn reindex_one(&self, mut doc: Document) -> Result<()> {
        let external_docid = match doc.get(DOCID_PROPERTY) {
            Some(PropertyValue::Str(s)) => s.clone(),
            _ => return Err(Error::schema_violation("document missing its DOCID property during rebuild")),
        };
        let hash = ContentHash::of(&external_docid);

        let (_, new_docid) = self.target_id_mgr.assign_new(hash).await;

        let synthesized = canonical_date_string(&Utc::now().naive_utc());
        doc.insert(DATE_PROPERTY.to_string(), PropertyValue::Str(synthesized));

        self.target_doc_mgr.insert_document(new_docid, doc.clone()).await?;
        self.target_index_mgr.insert_document(new_docid, &doc).await?;

        for (name, value) in &doc {
            if let PropertyValue::Str(text) = value {
                if name != DOCID_PROPERTY && name != DATE_PROPERTY {
                    let mut terms = Vec::new();
                    let _ = self.analyzer.term_id_list(text, "default", &mut terms, AnalysisGranularity::Word).await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryDocumentManager, InMemoryIdManager, InMemoryIndexManager, WhitespaceAnalyzer};

    #[tokio::test]
    async fn rebuild_skips_deleted_and_reissues_fresh_docids() {
        let source = Arc::new(InMemoryDocumentManager::new());
        let mut doc_a = Document::new();
        doc_a.insert(DOCID_PROPERTY.to_string(), PropertyValue::Str("A".to_string()));
        doc_a.insert("title".to_string(), PropertyValue::Str("hello world".to_string()));
        source.insert_document(0, doc_a).await.unwrap();

        let mut doc_b = Document::new();
        doc_b.insert(DOCID_PROPERTY.to_string(), PropertyValue::Str("B".to_string()));
        source.insert_document(1, doc_b).await.unwrap();
        source.remove_document(1).await.unwrap();

        let target_doc_mgr = Arc::new(InMemoryDocumentManager::new());
        let coordinator = RebuildCoordinator::new(
            source,
            target_doc_mgr.clone(),
            Arc::new(InMemoryIndexManager::new()),
            Arc::new(InMemoryIdManager::new()),
            Arc::new(WhitespaceAnalyzer),
        );

        let report = coordinator.rebuild(1).await.unwrap();
        assert_eq!(report.reindexed, 1);
        assert_eq!(report.skipped_deleted, 1);
        assert!(target_doc_mgr.get_document(0).await.unwrap().is_some());
    }
}
