//! Bundle file handling: filename grammar + scanner (C3) and body parser (C4),
//! per spec §4.3, §4.4 and the external interface grammar in §6.

pub mod parser;
pub mod scanner;

use std::cmp::Ordering;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// `T` component of the bundle filename: insert / update / delete / rebuild
/// (spec §6: `T ∈ {I,U,D,R}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleFileType {
    Insert,
    Update,
    Delete,
    Rebuild,
}

impl BundleFileType {
    fn from_code(c: char) -> Option<Self> {
        match c {
            'I' => Some(Self::Insert),
            'U' => Some(Self::Update),
            'D' => Some(Self::Delete),
            'R' => Some(Self::Rebuild),
            _ => None,
        }
    }
}

/// A parsed `B-NN-YYYYMMDDhhmm-ssuuu-T-C.SCD` bundle filename (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFileName {
    pub raw: String,
    pub sequence: u8,
    pub timestamp: String,
    pub file_type: BundleFileType,
    pub collection: String,
}

impl BundleFileName {
    /// Parses a bundle filename, returning `BadFormat` if it doesn't match the
    /// `B-NN-YYYYMMDDhhmm-ssuuu-T-C.SCD` grammar.
    pub fn parse(name: &str) -> Result<Self> {
        let stripped = name
            .strip_suffix(".SCD")
            .ok_or_else(|| Error::bad_format(format!("{name}: missing .SCD extension")))?;

        let parts: Vec<&str> = stripped.split('-').collect();
        let [marker, seq, ts, subsec, type_code, collection] = parts[..] else {
            return Err(Error::bad_format(format!("{name}: expected 6 dash-separated fields")));
        };

        if marker != "B" {
            return Err(Error::bad_format(format!("{name}: expected leading 'B' marker")));
        }
        let sequence: u8 = seq
            .parse()
            .map_err(|_| Error::bad_format(format!("{name}: bad sequence {seq:?}")))?;
        if ts.len() != 12 || !ts.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::bad_format(format!("{name}: bad timestamp {ts:?}")));
        }
        if subsec.len() != 5 || !subsec.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::bad_format(format!("{name}: bad sub-second field {subsec:?}")));
        }
        let mut type_chars = type_code.chars();
        let file_type = match (type_chars.next(), type_chars.next()) {
            (Some(c), None) => BundleFileType::from_code(c)
                .ok_or_else(|| Error::bad_format(format!("{name}: unknown type code {type_code:?}")))?,
            _ => return Err(Error::bad_format(format!("{name}: expected single-char type code"))),
        };
        if collection.is_empty() {
            return Err(Error::bad_format(format!("{name}: empty collection tag")));
        }

        Ok(Self {
            raw: name.to_string(),
            sequence,
            timestamp: format!("{ts}{subsec}"),
            file_type,
            collection: collection.to_string(),
        })
    }

    pub fn matches_collection(&self, collection: &str) -> bool {
        self.collection == collection
    }
}

impl PartialOrd for BundleFileName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BundleFileName {
    /// The canonical sort is lexicographic on the raw filename (spec §6), which
    /// happens to agree with chronological-by-timestamp-then-sequence because
    /// every numeric field is fixed-width and zero-padded.
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

pub(crate) fn file_name_str(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}
