use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use crate::core::types::{Etag, FieldValue, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    Building,   // full scan in progress, or a rebuild was cancelled
    Idle,       // caught up with the store
    Stale,      // change notifications pending
    Corrupted,  // map or reduce failed; needs a rebuild
}

/// Checkpoint and state published to waiting queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub checkpoint: Etag,
    pub state: IndexState,
}

/// Aggregation result for one group key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedRow {
    pub key: String,
    pub value: Row,
}

impl ReducedRow {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.value.get(field)
    }
}

/// The reduced rows of one index plus the checkpoint they reflect.
///
/// `state` only ever holds Building, Idle or Corrupted; Stale is derived by
/// comparing `checkpoint` with the store.
#[derive(Debug, Clone)]
pub struct ReducedTable {
    pub rows: BTreeMap<String, Row>,
    pub checkpoint: Etag,
    pub state: IndexState,
    pub error: Option<String>,
    pub contributing_documents: usize,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

impl ReducedTable {
    fn new() -> Self {
        ReducedTable {
            rows: BTreeMap::new(),
            checkpoint: Etag::ZERO,
            state: IndexState::Building,
            error: None,
            contributing_documents: 0,
            last_indexed_at: None,
        }
    }
}

/// State of one index shared between its worker (sole writer) and readers.
///
/// Readers take the read lock for the whole scan, so a query sees either
/// all of a notification's group updates or none of them.
pub struct IndexShared {
    pub name: String,
    table: RwLock<ReducedTable>,
    progress: watch::Sender<Progress>,
}

impl IndexShared {
    pub fn new(name: &str) -> Self {
        let (progress, _) = watch::channel(Progress {
            checkpoint: Etag::ZERO,
            state: IndexState::Building,
        });
        IndexShared {
            name: name.to_string(),
            table: RwLock::new(ReducedTable::new()),
            progress,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ReducedTable> {
        self.table.read()
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Mutate the table under the write lock, then publish the new progress.
    pub(crate) fn commit<F: FnOnce(&mut ReducedTable)>(&self, apply: F) {
        let progress = {
            let mut table = self.table.write();
            let before = table.checkpoint;
            apply(&mut table);
            debug_assert!(table.checkpoint >= before, "index checkpoint moved backwards");
            Progress {
                checkpoint: table.checkpoint,
                state: table.state,
            }
        };
        self.progress.send_replace(progress);
    }
}
