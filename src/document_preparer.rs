//! Document Preparer (C5): classifies each raw bundle record into an insert,
//! full update or R-type update, parsing its properties into typed values along
//! the way (spec §4.5, §4.5.1).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::Mutex;

use crate::bundle::parser::RawRecord;
use crate::collaborators::DocumentManager;
use crate::docid::{ContentHash, DocId, IdManager};
use crate::error::{Error, Result};
use crate::property::{
    canonical_date_string, parse_fixed_timestamp, synth_date_from_build_timestamp, AnalyzerDescriptor,
    Document, PropertyType, PropertyValue, Schema, DATE_PROPERTY, DOCID_PROPERTY,
};

/// A field whose raw text still needs language analysis (forward index) and,
/// where the schema declares a [`crate::property::SummaryDescriptor`], the
/// sentence-offset blocks for snippet display (spec §4.5 step 1).
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardIndexInput {
    pub property: String,
    pub text: String,
    pub analyzer: AnalyzerDescriptor,
    pub summary_blocks: Option<Vec<(usize, usize)>>,
}

/// The classification and typed payload produced for one raw record.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    /// The document's properties, fully merged with any prior persisted values
    /// for a non-R-type update (spec §4.5 step 3).
    pub doc: Document,
    pub docid: DocId,
    pub old_docid: Option<DocId>,
    pub rtype: bool,
    /// The changed (property, value) pairs an R-type update rewrites; empty for
    /// inserts and full updates (spec §9 "returned as explicit pairs").
    pub rtype_changed: Vec<(String, PropertyValue)>,
    pub source: Option<String>,
    pub timestamp: Option<NaiveDateTime>,
    pub forward_index_inputs: Vec<ForwardIndexInput>,
}

/// Per-source document counters accumulated across a build pass (spec §10.5,
/// `productSourceField`).
#[derive(Debug, Default)]
pub struct SourceCounters {
    counts: Mutex<HashMap<String, u64>>,
}

impl SourceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, source: &str) {
        let mut counts = self.counts.lock().await;
        *counts.entry(source.to_string()).or_insert(0) += 1;
    }

    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.counts.lock().await.clone()
    }
}

/// Classifies and type-parses raw bundle records into [`PreparedDocument`]s
/// (spec §4.5).
pub struct DocumentPreparer {
    schema: Arc<Schema>,
    id_mgr: Arc<dyn IdManager>,
    doc_mgr: Arc<dyn DocumentManager>,
    source_counters: SourceCounters,
}

impl DocumentPreparer {
    pub fn new(schema: Arc<Schema>, id_mgr: Arc<dyn IdManager>, doc_mgr: Arc<dyn DocumentManager>) -> Self {
        Self {
            schema,
            id_mgr,
            doc_mgr,
            source_counters: SourceCounters::new(),
        }
    }

    pub async fn source_counts(&self) -> HashMap<String, u64> {
        self.source_counters.snapshot().await
    }

    /// Parses and classifies `raw`. `insert_mode` reflects the bundle file's own
    /// type tag (`I` vs `U`); the final insert/update decision additionally
    /// depends on whether the DOCID hash is already known (spec §4.5 step 1).
    pub async fn prepare(
        &self,
        raw: &RawRecord,
        insert_mode: bool,
        build_timestamp: Option<DateTime<Utc>>,
    ) -> Result<PreparedDocument> {
        let docid_raw = raw
            .properties
            .iter()
            .find(|(name, _)| name == DOCID_PROPERTY)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| Error::bad_format("record is missing its DOCID property"))?;
        let hash = ContentHash::of(&docid_raw);

        let mut new_values: Document = Document::new();
        new_values.insert(DOCID_PROPERTY.to_string(), PropertyValue::Str(docid_raw.clone()));
        let mut source: Option<String> = None;
        let mut timestamp: Option<NaiveDateTime> = None;
        let mut forward_index_inputs = Vec::new();
        let mut date_seen = false;

        for (name, raw_value) in &raw.properties {
            if name == DOCID_PROPERTY {
                continue;
            }
            if name == DATE_PROPERTY {
                let parsed = parse_fixed_timestamp(raw_value)
                    .ok_or_else(|| Error::bad_format(format!("bad DATE value {raw_value:?}")))?;
                timestamp = Some(parsed);
                date_seen = true;
                new_values.insert(DATE_PROPERTY.to_string(), PropertyValue::Str(canonical_date_string(&parsed)));
                continue;
            }

            let def = self
                .schema
                .get(name)
                .ok_or_else(|| Error::schema_violation(format!("unknown property {name:?}")))?;
            let value = PropertyValue::try_from_raw(raw_value, def.ty)?;

            if self.schema.product_source_field.as_deref() == Some(name.as_str()) {
                source = Some(raw_value.clone());
            }

            if def.ty == PropertyType::String && def.flags.is_analyzed {
                if let Some(analyzer) = &def.analyzer {
                    let summary_blocks = def
                        .summary
                        .map(|s| compute_summary_blocks(raw_value, s.display_length, s.summary_num));
                    forward_index_inputs.push(ForwardIndexInput {
                        property: name.clone(),
                        text: raw_value.clone(),
                        analyzer: analyzer.clone(),
                        summary_blocks,
                    });
                }
            }

            new_values.insert(name.clone(), value);
        }

        if !date_seen {
            if let Some(ts) = build_timestamp {
                let synthesized = synth_date_from_build_timestamp(ts);
                if let PropertyValue::Date(dt) = &synthesized {
                    timestamp = Some(*dt);
                    new_values.insert(DATE_PROPERTY.to_string(), PropertyValue::Str(canonical_date_string(dt)));
                }
            }
        }

        if let Some(source) = &source {
            self.source_counters.record(source).await;
        }

        let resolved = self.id_mgr.resolve(hash).await;

        let (docid, old_docid, rtype, rtype_changed, doc) = match (insert_mode, resolved) {
            (true, _) | (false, None) => {
                // Insert path: either the bundle said so, or an update targeted a
                // docid that isn't known yet, which spec §4.5.1 treats as "the
                // operation becomes an insert".
                let (superseded, docid) = self.id_mgr.assign_new(hash).await;
                let current_max = self.doc_mgr.get_max_docid().await?;
                if superseded.is_some() && docid <= current_max {
                    return Err(Error::id_conflict(format!("duplicate docid {docid}")));
                }
                (docid, None, false, Vec::new(), new_values)
            }
            (false, Some(old_docid)) => {
                let old_doc = self
                    .doc_mgr
                    .get_document(old_docid)
                    .await?
                    .ok_or_else(|| Error::store_error(format!("missing old document for docid {old_docid}")))?;
                let (rtype, changed) = classify_rtype(&self.schema, &new_values, &old_doc)?;
                let docid = self.id_mgr.update_existing(hash, old_docid, rtype).await;
                if rtype {
                    (docid, Some(old_docid), true, changed, new_values)
                } else {
                    let mut merged = old_doc;
                    merged.extend(new_values.clone());
                    (docid, Some(old_docid), false, Vec::new(), merged)
                }
            }
        };

        Ok(PreparedDocument {
            doc,
            docid,
            old_docid,
            rtype,
            rtype_changed,
            source,
            timestamp,
            forward_index_inputs,
        })
    }
}

/// R-type classification (spec §4.5.1): for each property that actually
/// changed from the persisted document, the change only qualifies for R-type
/// if every changed property's flags say so. Unchanged properties are skipped
/// entirely — they neither help nor hurt the classification.
fn classify_rtype(
    schema: &Schema,
    new_values: &Document,
    old_doc: &Document,
) -> Result<(bool, Vec<(String, PropertyValue)>)> {
    let mut changed = Vec::new();
    for (name, new_value) in new_values {
        if name == DOCID_PROPERTY || old_doc.get(name) == Some(new_value) {
            continue;
        }
        let def = schema
            .get(name)
            .ok_or_else(|| Error::schema_violation(format!("unknown property {name:?}")))?;
        if !def.flags.qualifies_for_rtype() {
            return Ok((false, Vec::new()));
        }
        changed.push((name.clone(), new_value.clone()));
    }
    Ok((true, changed))
}

/// Splits `text` into up to `summary_num` sentence-bounded `(start, end)` char
/// offset blocks, stopping once `display_length` characters are covered (spec
/// §4.5 step 1, summary/snippet computation). Falls back to a single truncated
/// block for text with no sentence-ending punctuation.
fn compute_summary_blocks(text: &str, display_length: usize, summary_num: usize) -> Vec<(usize, usize)> {
    let summary_num = summary_num.max(1);
    let mut blocks = Vec::new();
    let mut start = 0usize;
    let mut covered = 0usize;

    for sentence in split_sentences(text) {
        if blocks.len() >= summary_num || covered >= display_length {
            break;
        }
        let len = sentence.chars().count();
        let end = start + len;
        blocks.push((start, end));
        covered += len;
        start = end;
    }

    if blocks.is_empty() && !text.is_empty() {
        let end = text.chars().count().min(display_length.max(1));
        blocks.push((0, end));
    }
    blocks
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == '.' || c == '!' || c == '?' {
            sentences.push(&text[start..=i]);
            start = i + c.len_utf8();
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{PropertyDef, PropertyFlags};
    use crate::testing::{InMemoryDocumentManager, InMemoryIdManager};

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(
            vec![
                PropertyDef {
                    id: 1,
                    name: "title".to_string(),
                    ty: PropertyType::String,
                    flags: PropertyFlags {
                        is_index: true,
                        is_analyzed: true,
                        ..Default::default()
                    },
                    analyzer: Some(AnalyzerDescriptor { name: "default".to_string() }),
                    summary: Some(crate::property::SummaryDescriptor {
                        display_length: 80,
                        summary_num: 2,
                    }),
                },
                PropertyDef {
                    id: 2,
                    name: "price".to_string(),
                    ty: PropertyType::Int,
                    flags: PropertyFlags {
                        is_index: true,
                        is_filter: true,
                        ..Default::default()
                    },
                    analyzer: None,
                    summary: None,
                },
                PropertyDef {
                    id: 3,
                    name: "source".to_string(),
                    ty: PropertyType::Nominal,
                    flags: PropertyFlags::default(),
                    analyzer: None,
                    summary: None,
                },
            ],
            Some("source".to_string()),
        ))
    }

    fn record(docid: &str, title: &str, price: &str, source: &str) -> RawRecord {
        RawRecord {
            id: docid.to_string(),
            properties: vec![
                (DOCID_PROPERTY.to_string(), docid.to_string()),
                ("title".to_string(), title.to_string()),
                ("price".to_string(), price.to_string()),
                ("source".to_string(), source.to_string()),
            ],
        }
    }

    #[tokio::test]
    async fn insert_assigns_fresh_docid_and_collects_forward_index() {
        let doc_mgr = Arc::new(InMemoryDocumentManager::new());
        let id_mgr = Arc::new(InMemoryIdManager::new());
        let preparer = DocumentPreparer::new(schema(), id_mgr, doc_mgr);

        let prepared = preparer
            .prepare(&record("A", "Hello world. Second sentence.", "7", "feed1"), true, None)
            .await
            .unwrap();

        assert!(prepared.old_docid.is_none());
        assert!(!prepared.rtype);
        assert_eq!(prepared.source.as_deref(), Some("feed1"));
        assert_eq!(prepared.forward_index_inputs.len(), 1);
        assert_eq!(prepared.forward_index_inputs[0].summary_blocks.as_ref().unwrap().len(), 2);
        assert_eq!(preparer.source_counts().await.get("feed1"), Some(&1));
    }

    #[tokio::test]
    async fn update_on_unknown_docid_falls_back_to_insert() {
        let doc_mgr = Arc::new(InMemoryDocumentManager::new());
        let id_mgr = Arc::new(InMemoryIdManager::new());
        let preparer = DocumentPreparer::new(schema(), id_mgr, doc_mgr);

        let prepared = preparer
            .prepare(&record("A", "Hello.", "1", "feed1"), false, None)
            .await
            .unwrap();
        assert!(prepared.old_docid.is_none());
    }

    #[tokio::test]
    async fn filter_only_change_qualifies_for_rtype() {
        let doc_mgr = Arc::new(InMemoryDocumentManager::new());
        let id_mgr = Arc::new(InMemoryIdManager::new());
        let preparer = DocumentPreparer::new(schema(), id_mgr.clone(), doc_mgr.clone());

        let first = preparer.prepare(&record("A", "Hello.", "1", "feed1"), true, None).await.unwrap();
        doc_mgr.insert_document(first.docid, first.doc.clone()).await.unwrap();

        let second = preparer.prepare(&record("A", "Hello.", "2", "feed1"), false, None).await.unwrap();
        assert!(second.rtype);
        assert_eq!(second.docid, first.docid);
        assert_eq!(second.rtype_changed.len(), 1);
        assert_eq!(second.rtype_changed[0].0, "price");
    }

    #[tokio::test]
    async fn analyzed_field_change_falls_back_to_full_update() {
        let doc_mgr = Arc::new(InMemoryDocumentManager::new());
        let id_mgr = Arc::new(InMemoryIdManager::new());
        let preparer = DocumentPreparer::new(schema(), id_mgr.clone(), doc_mgr.clone());

        let first = preparer.prepare(&record("A", "Hello.", "1", "feed1"), true, None).await.unwrap();
        doc_mgr.insert_document(first.docid, first.doc.clone()).await.unwrap();

        let second = preparer
            .prepare(&record("A", "A different title entirely.", "1", "feed1"), false, None)
            .await
            .unwrap();
        assert!(!second.rtype);
        assert_eq!(second.docid, first.docid);
        assert!(second.doc.contains_key("title"));
    }

    #[tokio::test]
    async fn date_synthesized_from_build_timestamp_when_absent() {
        let doc_mgr = Arc::new(InMemoryDocumentManager::new());
        let id_mgr = Arc::new(InMemoryIdManager::new());
        let preparer = DocumentPreparer::new(schema(), id_mgr, doc_mgr);

        let build_ts = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap().with_timezone(&Utc);
        let prepared = preparer
            .prepare(&record("A", "Hello.", "1", "feed1"), true, Some(build_ts))
            .await
            .unwrap();
        assert!(prepared.timestamp.is_some());
        assert!(prepared.doc.contains_key(DATE_PROPERTY));
    }
}
