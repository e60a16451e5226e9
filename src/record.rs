//! Content record data model and dataset snapshots
//!
//! A record is one content item; a subset of records is access-restricted,
//! either directly or inherited from a parent series. Restricted records
//! carry confidential fields that the sanitization gate replaces with
//! placeholders for callers who are not entitled to see them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Reference to a parent series whose restriction a record inherits
///
/// `restricted: None` means the parent could not be resolved; effective
/// restriction treats that as restricted (fail closed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    /// Parent series id (slug)
    pub id: String,
    /// Resolved restriction flag, `None` when the parent fetch failed
    pub restricted: Option<bool>,
}

/// Fields only visible to authenticated callers
///
/// Every field here is subject to placeholder substitution by the
/// sanitization gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialFields {
    /// Client or partner name for the engagement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Direct contact email for the engagement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    /// Internal notes never shown on public surfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_notes: Option<String>,
}

impl ConfidentialFields {
    /// Whether every present field equals the given placeholder
    pub fn all_placeholder(&self, placeholder: &str) -> bool {
        [&self.client_name, &self.contact_email, &self.internal_notes]
            .iter()
            .all(|f| match f {
                Some(v) => v == placeholder,
                None => true,
            })
    }

    /// Whether no field is present at all
    pub fn is_empty(&self) -> bool {
        self.client_name.is_none() && self.contact_email.is_none() && self.internal_notes.is_none()
    }
}

/// One content item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable id (slug)
    pub id: String,

    /// Ordering key within the dataset
    pub order: u32,

    /// Direct restriction flag
    #[serde(default)]
    pub restricted: bool,

    /// Optional parent series carrying an inheritable restriction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,

    /// Title, always public
    pub title: String,

    /// Short summary, always public
    #[serde(default)]
    pub summary: String,

    /// Tags, always public
    #[serde(default)]
    pub tags: Vec<String>,

    /// Confidential fields, subject to sanitization
    #[serde(default)]
    pub confidential: ConfidentialFields,
}

impl Record {
    /// Effective restriction: direct flag OR inherited from the parent
    ///
    /// Recomputed on every call; an unresolved parent restriction counts
    /// as restricted.
    pub fn effective_restriction(&self) -> bool {
        if self.restricted {
            return true;
        }
        match &self.parent {
            None => false,
            Some(parent) => parent.restricted.unwrap_or(true),
        }
    }
}

/// Uniform outcome for record resolution
///
/// Wrong auth, fetch failure, and a genuinely absent record all surface as
/// `NotFound`; which case occurred is deliberately not exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The record resolved and is safe to render
    Found(Record),
    /// Not found / requires access
    NotFound,
}

/// An ordered snapshot of the dataset plus fetch-shape metadata
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    /// Records in display order
    records: Vec<Record>,
    /// id -> position in `records`
    index: HashMap<String, usize>,
    /// Whether restricted records are present in the map at all
    pub includes_restricted: bool,
    /// Whether confidential fields on restricted records were redacted
    pub fields_sanitized: bool,
    /// Monotonically increasing staleness counter, assigned at install time
    pub epoch: u64,
}

impl DatasetSnapshot {
    /// Build a snapshot from records, sorting by ordering key then id
    pub fn new(mut records: Vec<Record>, includes_restricted: bool, fields_sanitized: bool) -> Self {
        records.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self {
            records,
            index,
            includes_restricted,
            fields_sanitized,
            epoch: 0,
        }
    }

    /// Empty snapshot with the given shape
    pub fn empty(includes_restricted: bool, fields_sanitized: bool) -> Self {
        Self::new(Vec::new(), includes_restricted, fields_sanitized)
    }

    /// Look up a record by id
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    /// Whether the id is present in the map
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Records in display order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Ids in display order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.id.as_str())
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Previous and next id in display order, wrapping circularly
    ///
    /// Empty and single-element datasets degenerate to the queried id
    /// itself. An unknown id in a populated dataset returns `None`.
    pub fn neighbors(&self, id: &str) -> Option<(String, String)> {
        if self.records.is_empty() {
            return Some((id.to_string(), id.to_string()));
        }
        let &pos = self.index.get(id)?;
        let n = self.records.len();
        let prev = self.records[(pos + n - 1) % n].id.clone();
        let next = self.records[(pos + 1) % n].id.clone();
        Some((prev, next))
    }

    /// Map over all records, producing a new snapshot with the same order
    /// and the given shape flags
    pub fn map_records<F>(&self, includes_restricted: bool, fields_sanitized: bool, f: F) -> Self
    where
        F: Fn(&Record) -> Record,
    {
        Self::new(
            self.records.iter().map(f).collect(),
            includes_restricted,
            fields_sanitized,
        )
    }

    /// Filter records, producing a new snapshot with the given shape flags
    pub fn filter_records<F>(&self, includes_restricted: bool, fields_sanitized: bool, f: F) -> Self
    where
        F: Fn(&Record) -> bool,
    {
        Self::new(
            self.records.iter().filter(|r| f(r)).cloned().collect(),
            includes_restricted,
            fields_sanitized,
        )
    }
}
