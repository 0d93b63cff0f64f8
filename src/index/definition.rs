use std::panic::{catch_unwind, AssertUnwindSafe};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::core::types::{Document, Row};

/// One (group key, partial value) pair produced by a map function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRow {
    pub key: String,
    pub value: Row,
}

impl MappedRow {
    pub fn new(key: impl Into<String>, value: Row) -> Self {
        MappedRow { key: key.into(), value }
    }
}

/// A map-reduce index definition.
///
/// `map` must be deterministic and free of hidden state: it is re-run for
/// every mutation of a document and again on full rebuilds. `reduce` must be
/// associative and commutative and must accept its own outputs as inputs;
/// the engine folds a previous reduced row together with fresh mapped rows.
pub trait MapReduceDefinition: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Bumped when map or reduce semantics change, which invalidates any
    /// persisted index state.
    fn version(&self) -> u32 {
        1
    }

    fn map(&self, doc: &Document) -> Result<Vec<MappedRow>>;

    fn reduce(&self, key: &str, values: &[Row]) -> Result<Row>;
}

/// Run `map`, turning a panic into a `MapReduce` error.
pub(crate) fn run_map(definition: &dyn MapReduceDefinition, doc: &Document) -> Result<Vec<MappedRow>> {
    match catch_unwind(AssertUnwindSafe(|| definition.map(doc))) {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(e)) => Err(Error::map_reduce(format!("map failed on '{}': {}", doc.id, e))),
        Err(panic) => Err(Error::map_reduce(format!(
            "map panicked on '{}': {}",
            doc.id,
            panic_message(panic.as_ref())
        ))),
    }
}

/// Run `reduce`, turning a panic into a `MapReduce` error.
pub(crate) fn run_reduce(definition: &dyn MapReduceDefinition, key: &str, values: &[Row]) -> Result<Row> {
    match catch_unwind(AssertUnwindSafe(|| definition.reduce(key, values))) {
        Ok(Ok(row)) => Ok(row),
        Ok(Err(e)) => Err(Error::map_reduce(format!("reduce failed for group '{}': {}", key, e))),
        Err(panic) => Err(Error::map_reduce(format!(
            "reduce panicked for group '{}': {}",
            key,
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
