use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::core::types::{DocId, Document, Entity, Etag, FieldValue};
use crate::index::table::ReducedRow;

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,   // Ascending: 0 → 9, A → Z
    Desc,  // Descending: 9 → 0, Z → A
}

/// What rows are ordered by. Ties always fall back to the group key,
/// ascending, whatever the direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SortKey {
    GroupKey,
    Field(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Keeps rows whose `field` compares to `value` according to `op`.
/// Rows without the field never match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: FieldValue,
}

impl RowFilter {
    pub fn new(field: &str, op: FilterOp, value: impl Into<FieldValue>) -> Self {
        RowFilter {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitMode {
    /// Read whatever the index holds right now.
    Never,
    /// Wait until the index reflects every mutation committed before the
    /// query started. `None` uses the configured default timeout.
    NonStale { timeout: Option<Duration> },
}

/// Query against the reduced rows of one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexQuery {
    pub index: String,
    pub sort: SortKey,
    pub order: SortOrder,
    pub filters: Vec<RowFilter>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub wait: WaitMode,
    pub includes: Vec<String>,
}

impl IndexQuery {
    pub fn new(index: &str) -> Self {
        IndexQuery {
            index: index.to_string(),
            sort: SortKey::GroupKey,
            order: SortOrder::Asc,
            filters: Vec::new(),
            skip: 0,
            limit: None,
            wait: WaitMode::Never,
            includes: Vec::new(),
        }
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.sort = SortKey::Field(field.to_string());
        self.order = SortOrder::Asc;
        self
    }

    pub fn order_by_descending(mut self, field: &str) -> Self {
        self.sort = SortKey::Field(field.to_string());
        self.order = SortOrder::Desc;
        self
    }

    pub fn order_by_key(mut self, order: SortOrder) -> Self {
        self.sort = SortKey::GroupKey;
        self.order = order;
        self
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn take(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Load the documents whose ids appear in `field` of the returned rows
    /// along with the results.
    pub fn include(mut self, field: &str) -> Self {
        if !self.includes.iter().any(|f| f == field) {
            self.includes.push(field.to_string());
        }
        self
    }

    pub fn wait_for_non_stale_results(mut self) -> Self {
        self.wait = WaitMode::NonStale { timeout: None };
        self
    }

    pub fn wait_for_non_stale_results_within(mut self, timeout: Duration) -> Self {
        self.wait = WaitMode::NonStale { timeout: Some(timeout) };
        self
    }
}

/// Query results container
#[derive(Debug, Clone)]
pub struct QueryResults {
    pub rows: Vec<ReducedRow>,
    pub total_rows: usize,      // matches before skip/limit
    pub is_stale: bool,
    pub index_etag: Etag,
    pub took_ms: u64,
    pub includes: BTreeMap<DocId, Arc<Document>>,  // ids that no longer exist are left out
}

impl QueryResults {
    /// An included document, deserialized as `T`.
    pub fn included<T: Entity>(&self, id: &str) -> Result<T> {
        match self.includes.get(&DocId::new(id)) {
            Some(doc) if doc.is_in(T::COLLECTION) => doc.to_entity(),
            _ => Err(Error::not_found(format!("included document '{}' in {}", id, T::COLLECTION))),
        }
    }
}
