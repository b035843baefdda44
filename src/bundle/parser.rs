//! Bundle File Parser (C4): a lazy, restartable parser over a bundle file's
//! body (spec §4.4, §6). Records are delimited by a line beginning `<USERID>`
//! or `<DOCID>`; each subsequent `<PROPNAME>value` line belongs to that record
//! until the next delimiter line or EOF.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::{Error, Result};

/// The property name that starts a new record for document streams.
pub const DOCID_DELIMITER: &str = "DOCID";
/// The property name that starts a new record for user/order streams.
pub const USERID_DELIMITER: &str = "USERID";

/// One parsed record: its id-property value (the DOCID or USERID that started
/// it) plus the full ordered list of (property, raw value) pairs, including the
/// id property itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    pub properties: Vec<(String, String)>,
}

/// Splits a `<PROPNAME>value` line into its components. Returns `BadFormat` if
/// the line isn't delimited correctly (spec §4.4: "a record is truncated").
fn parse_property_line(line: &str) -> Result<(String, String)> {
    if !line.starts_with('<') {
        return Err(Error::bad_format(format!("malformed property line: {line:?}")));
    }
    let close = line
        .find('>')
        .ok_or_else(|| Error::bad_format(format!("malformed property line: {line:?}")))?;
    let name = &line[1..close];
    if name.is_empty() {
        return Err(Error::bad_format(format!("malformed property line: {line:?}")));
    }
    let value = &line[close + 1..];
    Ok((name.to_string(), value.to_string()))
}

fn is_record_delimiter(prop_name: &str) -> bool {
    prop_name == DOCID_DELIMITER || prop_name == USERID_DELIMITER
}

/// A restartable cursor over a bundle file's lines. "Lazy" in that it reads
/// line-by-line rather than materializing the whole file; "restartable" in
/// that a fresh parser opened against the same path and seeked to a prior
/// `offset` (in lines already consumed) resumes cleanly, since records never
/// span a parser instance's buffered state.
pub struct BundleFileParser {
    lines: tokio::io::Lines<BufReader<tokio::fs::File>>,
    pending: Option<(String, String)>,
    header_seen: bool,
}

impl BundleFileParser {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            pending: None,
            header_seen: false,
        })
    }

    /// Returns the next parsed document/user record, or `None` at EOF.
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let mut current: Option<RawRecord> = None;

        loop {
            let (name, value) = match self.pending.take() {
                Some(pair) => pair,
                None => match self.next_property_line().await? {
                    Some(pair) => pair,
                    None => break,
                },
            };

            if is_record_delimiter(&name) {
                if current.is_some() {
                    // Start of the next record; stash it for the following call.
                    self.pending = Some((name, value));
                    break;
                }
                self.header_seen = true;
                current = Some(RawRecord {
                    id: value.clone(),
                    properties: vec![(name, value)],
                });
            } else {
                match current.as_mut() {
                    Some(record) => record.properties.push((name, value)),
                    None => {
                        return Err(Error::bad_format(
                            "property line appears before any DOCID/USERID header",
                        ))
                    }
                }
            }
        }

        if current.is_none() && !self.header_seen {
            // We reached EOF having never seen a single record header: either
            // an empty file (fine, no records) or garbage-only content. We only
            // fail loudly if there was unparsed content that never resolved
            // into a header, which `next_property_line` already catches as a
            // malformed line.
            return Ok(None);
        }

        Ok(current)
    }

    async fn next_property_line(&mut self) -> Result<Option<(String, String)>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(parse_property_line(&line)?));
        }
    }

    /// Yields just the id-property values for a delete bundle, without parsing
    /// the rest of each record's properties (spec §4.4: "can additionally yield
    /// just the list of DOCID values without materializing full documents").
    pub async fn scan_ids(mut self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        while let Some((name, value)) = self.next_property_line().await? {
            if is_record_delimiter(&name) {
                ids.push(value);
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_bundle(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn parses_multiple_document_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(
            &dir,
            "doc.scd",
            "<DOCID>A\n<title>x\n<price>10\n<DOCID>B\n<title>y\n",
        )
        .await;

        let mut parser = BundleFileParser::open(&path).await.unwrap();
        let r1 = parser.next_record().await.unwrap().unwrap();
        assert_eq!(r1.id, "A");
        assert_eq!(
            r1.properties,
            vec![
                ("DOCID".to_string(), "A".to_string()),
                ("title".to_string(), "x".to_string()),
                ("price".to_string(), "10".to_string()),
            ]
        );

        let r2 = parser.next_record().await.unwrap().unwrap();
        assert_eq!(r2.id, "B");
        assert!(parser.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_property_line_is_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(&dir, "doc.scd", "<DOCID>A\ntitle-no-brackets\n").await;
        let mut parser = BundleFileParser::open(&path).await.unwrap();
        assert!(matches!(parser.next_record().await, Err(Error::BadFormat(_))));
    }

    #[tokio::test]
    async fn delete_bundle_scan_ids_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(&dir, "del.scd", "<DOCID>A\n<DOCID>B\n<DOCID>C\n").await;
        let parser = BundleFileParser::open(&path).await.unwrap();
        let ids = parser.scan_ids().await.unwrap();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn empty_file_yields_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bundle(&dir, "empty.scd", "").await;
        let mut parser = BundleFileParser::open(&path).await.unwrap();
        assert!(parser.next_record().await.unwrap().is_none());
    }
}
