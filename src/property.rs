//! Document schema and the property-value tagged union (spec §3, §9).
//!
//! All raw-to-typed conversions funnel through [`PropertyValue::try_from_raw`], per
//! the design note in spec §9 ("all conversions go through a single
//! `PropertyValue::tryFrom(raw, type)`").

use std::collections::BTreeMap;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type PropertyId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    String,
    Int,
    Float,
    Nominal,
    Date,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyFlags {
    pub is_index: bool,
    pub is_analyzed: bool,
    pub is_filter: bool,
    pub is_multi_value: bool,
    pub is_store_doc_len: bool,
}

impl PropertyFlags {
    /// Whether a property whose value differs qualifies for R-type treatment:
    /// indexed + filterable + not analyzed, OR not indexed at all (spec §3, §4.5.1).
    pub fn qualifies_for_rtype(&self) -> bool {
        (self.is_index && self.is_filter && !self.is_analyzed) || !self.is_index
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerDescriptor {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SummaryDescriptor {
    pub display_length: usize,
    pub summary_num: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDef {
    pub id: PropertyId,
    pub name: String,
    pub ty: PropertyType,
    pub flags: PropertyFlags,
    pub analyzer: Option<AnalyzerDescriptor>,
    pub summary: Option<SummaryDescriptor>,
}

/// The special properties the Document Preparer treats by name rather than by
/// generic schema lookup (spec §4.5 step 1): DOCID, DATE, and the product-source
/// counter field. Everything else is resolved through the schema.
pub const DOCID_PROPERTY: &str = "DOCID";
pub const DATE_PROPERTY: &str = "DATE";

#[derive(Debug, Clone)]
pub struct Schema {
    by_name: BTreeMap<String, PropertyDef>,
    /// Name of the optional per-source counter field (spec §4.5 step 1,
    /// `productSourceField`); `None` if the schema does not declare one.
    pub product_source_field: Option<String>,
}

impl Schema {
    pub fn new(properties: Vec<PropertyDef>, product_source_field: Option<String>) -> Self {
        let by_name = properties.into_iter().map(|p| (p.name.clone(), p)).collect();
        Self {
            by_name,
            product_source_field,
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyDef> {
        self.by_name.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyDef> {
        self.by_name.values()
    }
}

/// The multi-value separator priority order for numeric properties (spec §4.5
/// step 1: "detect multi-value separators in priority order `-`, `~`, `,`").
pub const MULTI_VALUE_SEPARATORS: [char; 3] = ['-', '~', ','];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Str(String),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Nominal(String),
    Date(NaiveDateTime),
}

impl PropertyValue {
    /// Parse a raw bundle-file value into a typed `PropertyValue` for `ty`,
    /// applying the numeric multi-value fallback described in spec §4.5 step 1.
    pub fn try_from_raw(raw: &str, ty: PropertyType) -> Result<Self> {
        match ty {
            PropertyType::String => Ok(Self::Str(raw.to_string())),
            PropertyType::Nominal => Ok(Self::Nominal(raw.to_string())),
            PropertyType::Date => parse_fixed_timestamp(raw)
                .map(Self::Date)
                .ok_or_else(|| Error::bad_format(format!("bad DATE value {raw:?}"))),
            PropertyType::Int => Ok(Self::Int(parse_int_multi(raw)?)),
            PropertyType::Float => Ok(Self::Float(parse_float_multi(raw)?)),
        }
    }
}

fn parse_int_multi(raw: &str) -> Result<Vec<i64>> {
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(vec![v]);
    }
    for sep in MULTI_VALUE_SEPARATORS {
        if raw.contains(sep) {
            let parts: Option<Vec<i64>> = raw.split(sep).map(|p| p.trim().parse::<i64>().ok()).collect();
            if let Some(values) = parts {
                if !values.is_empty() {
                    return Ok(values);
                }
            }
        }
    }
    // All separators failed: fall back to a float cast and truncate (spec §4.5 step 1).
    if let Ok(f) = raw.parse::<f64>() {
        return Ok(vec![f.trunc() as i64]);
    }
    Err(Error::bad_format(format!("cannot parse int value {raw:?}")))
}

fn parse_float_multi(raw: &str) -> Result<Vec<f64>> {
    if let Ok(v) = raw.parse::<f64>() {
        return Ok(vec![v]);
    }
    for sep in MULTI_VALUE_SEPARATORS {
        if raw.contains(sep) {
            let parts: Option<Vec<f64>> = raw.split(sep).map(|p| p.trim().parse::<f64>().ok()).collect();
            if let Some(values) = parts {
                if !values.is_empty() {
                    return Ok(values);
                }
            }
        }
    }
    Err(Error::bad_format(format!("cannot parse float value {raw:?}")))
}

/// Parses the fixed `YYYYMMDDhhmmss` bundle timestamp format (spec §4.5 step 1).
pub fn parse_fixed_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S").ok()
}

/// Canonicalized date string stored on the document, per spec §4.5 step 1.
pub fn canonical_date_string(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Synthesizes a `DATE` property from the build-supplied timestamp when the raw
/// document carried none (spec §4.5 step 2).
pub fn synth_date_from_build_timestamp(ts: chrono::DateTime<Utc>) -> PropertyValue {
    PropertyValue::Date(ts.naive_utc())
}

/// A parsed document: an ordered map from property name to typed value.
pub type Document = BTreeMap<String, PropertyValue>;
