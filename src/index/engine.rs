use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use rayon::prelude::*;
use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, Etag, Row};
use crate::index::definition::{run_map, run_reduce, MapReduceDefinition, MappedRow};
use crate::index::table::{IndexShared, IndexState};
use crate::storage::checkpoint::IndexCheckpoint;
use crate::storage::document_store::{ChangeKind, ChangeNotification, StoreSnapshot};
use crate::storage::layout::StorageLayout;

/// Incremental maintenance of one map-reduce index.
///
/// Owned by the index worker thread, which makes it the only writer of the
/// shared reduced table. Besides the reduced rows it keeps the rows each
/// document last emitted and, per group key, the documents contributing to
/// it, so a mutation touches only the groups it can affect.
pub struct IndexEngine {
    definition: Arc<dyn MapReduceDefinition>,
    shared: Arc<IndexShared>,
    contributions: HashMap<DocId, Vec<MappedRow>>,
    members: HashMap<String, BTreeSet<DocId>>,
    checkpoint: Etag,
    state: IndexState,
    storage: Option<Arc<StorageLayout>>,
    checkpoint_interval: u64,
    rebuild_batch_size: usize,
    applied_since_persist: u64,
}

/// Group updates computed for one notification before anything is applied.
struct StagedChange {
    new_rows: Vec<MappedRow>,
    groups: Vec<(String, Option<Row>)>,   // None deletes the group's row
}

impl IndexEngine {
    pub fn new(
        definition: Arc<dyn MapReduceDefinition>,
        shared: Arc<IndexShared>,
        storage: Option<Arc<StorageLayout>>,
        checkpoint_interval: u64,
        rebuild_batch_size: usize,
    ) -> Self {
        IndexEngine {
            definition,
            shared,
            contributions: HashMap::new(),
            members: HashMap::new(),
            checkpoint: Etag::ZERO,
            state: IndexState::Building,
            storage,
            checkpoint_interval: checkpoint_interval.max(1),
            rebuild_batch_size: rebuild_batch_size.max(1),
            applied_since_persist: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn checkpoint(&self) -> Etag {
        self.checkpoint
    }

    /// Install persisted state if it reflects exactly `etag`.
    pub fn restore(&mut self, etag: Etag) -> bool {
        let Some(storage) = self.storage.clone() else {
            return false;
        };

        let checkpoint = match IndexCheckpoint::load(&storage, self.name()) {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(index = %self.name(), error = %e, "ignoring unreadable index checkpoint");
                return false;
            }
        };

        if checkpoint.name != self.name()
            || checkpoint.definition_version != self.definition.version()
            || checkpoint.etag != etag
        {
            tracing::info!(
                index = %self.name(),
                checkpoint_etag = checkpoint.etag.0,
                store_etag = etag.0,
                "persisted index checkpoint is out of date, rebuilding"
            );
            return false;
        }

        self.contributions = checkpoint.contributions.into_iter().collect();
        self.members = group_members(&self.contributions);
        self.install(checkpoint.rows, etag);
        tracing::info!(index = %self.name(), etag = etag.0, "index restored from checkpoint");
        true
    }

    /// Rebuild every reduced row from a full scan of `snapshot`.
    ///
    /// Nothing is published until the whole scan has succeeded. On
    /// cancellation the index stays `Building`; on a map or reduce failure it
    /// becomes `Corrupted`.
    pub fn build(&mut self, snapshot: &StoreSnapshot, cancel: &CancelToken) -> Result<()> {
        let started = Instant::now();
        self.state = IndexState::Building;
        self.shared.commit(|table| table.state = IndexState::Building);
        tracing::info!(index = %self.name(), documents = snapshot.documents.len(), etag = snapshot.etag.0, "building index");

        match self.scan(snapshot, cancel) {
            Ok((contributions, rows)) => {
                self.contributions = contributions;
                self.members = group_members(&self.contributions);
                let etag = snapshot.etag.max(self.checkpoint);
                self.install(rows, etag);
                tracing::info!(
                    index = %self.name(),
                    groups = self.shared.read().rows.len(),
                    etag = etag.0,
                    took_ms = started.elapsed().as_millis() as u64,
                    "index build complete"
                );
                self.persist_or_warn();
                Ok(())
            }
            Err(e) if e.is(ErrorKind::Cancelled) => {
                tracing::info!(index = %self.name(), "index build cancelled");
                Err(e)
            }
            Err(e) => {
                self.corrupt(&e);
                Err(e)
            }
        }
    }

    fn scan(
        &self,
        snapshot: &StoreSnapshot,
        cancel: &CancelToken,
    ) -> Result<(HashMap<DocId, Vec<MappedRow>>, BTreeMap<String, Row>)> {
        let definition = self.definition.as_ref();
        let cancelled = || Error::new(ErrorKind::Cancelled, format!("build of index '{}' cancelled", self.name()));

        let mut contributions = HashMap::new();
        for batch in snapshot.documents.chunks(self.rebuild_batch_size) {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            let mapped = batch
                .par_iter()
                .map(|doc| run_map(definition, doc).map(|rows| (doc.id.clone(), rows)))
                .collect::<Result<Vec<_>>>()?;
            for (id, rows) in mapped {
                if !rows.is_empty() {
                    contributions.insert(id, rows);
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let members = group_members(&contributions);
        let rows = members
            .par_iter()
            .map(|(key, ids)| {
                let inputs = collect_inputs(&contributions, key, ids.iter());
                run_reduce(definition, key, &inputs).map(|row| (key.clone(), row))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok((contributions, rows))
    }

    /// Apply one change notification.
    ///
    /// Notifications at or below the checkpoint are already reflected (they
    /// raced with the snapshot a build started from). While the index is not
    /// `Idle` notifications are dropped; the next build's snapshot covers them.
    pub fn apply(&mut self, change: &ChangeNotification) -> Result<()> {
        if self.state != IndexState::Idle || change.etag <= self.checkpoint {
            return Ok(());
        }

        match self.stage(change) {
            Ok(staged) => {
                tracing::debug!(
                    index = %self.name(),
                    doc = %change.id,
                    etag = change.etag.0,
                    dirty_groups = staged.groups.len(),
                    "applied change"
                );
                self.commit(&change.id, change.etag, staged);
                self.applied_since_persist += 1;
                if self.applied_since_persist >= self.checkpoint_interval {
                    self.persist_or_warn();
                }
                Ok(())
            }
            Err(e) => {
                self.corrupt(&e);
                Err(e)
            }
        }
    }

    fn stage(&self, change: &ChangeNotification) -> Result<StagedChange> {
        let definition = self.definition.as_ref();
        let new_rows = match &change.kind {
            ChangeKind::Put(doc) => run_map(definition, doc)?,
            ChangeKind::Delete => Vec::new(),
        };
        let old_rows: &[MappedRow] = self.contributions.get(&change.id).map(Vec::as_slice).unwrap_or(&[]);

        if old_rows == new_rows.as_slice() {
            return Ok(StagedChange { new_rows, groups: Vec::new() });
        }

        let old_keys: BTreeSet<&str> = old_rows.iter().map(|r| r.key.as_str()).collect();
        let new_keys: BTreeSet<&str> = new_rows.iter().map(|r| r.key.as_str()).collect();

        let table = self.shared.read();
        let mut groups = Vec::new();
        for key in old_keys.union(&new_keys) {
            let fresh: Vec<Row> = new_rows.iter().filter(|r| r.key == *key).map(|r| r.value.clone()).collect();

            let previous = table.rows.get(*key);
            let reduced = match previous {
                // The group only gains rows: fold them into its current value.
                Some(previous) if !old_keys.contains(key) => {
                    let mut inputs = Vec::with_capacity(fresh.len() + 1);
                    inputs.push(previous.clone());
                    inputs.extend(fresh);
                    Some(run_reduce(definition, key, &inputs)?)
                }
                _ => {
                    let others = self.members.get(*key).into_iter().flatten().filter(|id| **id != change.id);
                    let mut inputs = collect_inputs(&self.contributions, key, others);
                    inputs.extend(fresh);
                    if inputs.is_empty() {
                        None
                    } else {
                        Some(run_reduce(definition, key, &inputs)?)
                    }
                }
            };
            groups.push((key.to_string(), reduced));
        }

        Ok(StagedChange { new_rows, groups })
    }

    fn commit(&mut self, id: &DocId, etag: Etag, staged: StagedChange) {
        if let Some(old_rows) = self.contributions.remove(id) {
            for row in &old_rows {
                if let Some(ids) = self.members.get_mut(&row.key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.members.remove(&row.key);
                    }
                }
            }
        }
        for row in &staged.new_rows {
            self.members.entry(row.key.clone()).or_default().insert(id.clone());
        }
        if !staged.new_rows.is_empty() {
            self.contributions.insert(id.clone(), staged.new_rows);
        }

        let contributing = self.contributions.len();
        self.checkpoint = etag;
        self.shared.commit(|table| {
            for (key, row) in staged.groups {
                match row {
                    Some(row) => {
                        table.rows.insert(key, row);
                    }
                    None => {
                        table.rows.remove(&key);
                    }
                }
            }
            table.checkpoint = etag;
            table.contributing_documents = contributing;
            table.last_indexed_at = Some(Utc::now());
        });
    }

    fn install(&mut self, rows: BTreeMap<String, Row>, etag: Etag) {
        let contributing = self.contributions.len();
        self.checkpoint = etag;
        self.state = IndexState::Idle;
        self.applied_since_persist = 0;
        self.shared.commit(|table| {
            table.rows = rows;
            table.checkpoint = etag;
            table.state = IndexState::Idle;
            table.error = None;
            table.contributing_documents = contributing;
            table.last_indexed_at = Some(Utc::now());
        });
    }

    fn corrupt(&mut self, error: &Error) {
        tracing::error!(index = %self.name(), checkpoint = self.checkpoint.0, error = %error, "index corrupted");
        self.state = IndexState::Corrupted;
        let message = error.to_string();
        self.shared.commit(|table| {
            table.state = IndexState::Corrupted;
            table.error = Some(message);
        });
    }

    /// Write the current state to disk. No-op for in-memory databases and
    /// for indexes that are not `Idle`.
    pub fn persist(&mut self) -> Result<()> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };
        if self.state != IndexState::Idle {
            return Ok(());
        }

        let mut contributions: Vec<(DocId, Vec<MappedRow>)> = self
            .contributions
            .iter()
            .map(|(id, rows)| (id.clone(), rows.clone()))
            .collect();
        contributions.sort_by(|a, b| a.0.cmp(&b.0));

        let checkpoint = IndexCheckpoint {
            name: self.shared.name.clone(),
            definition_version: self.definition.version(),
            etag: self.checkpoint,
            rows: self.shared.read().rows.clone(),
            contributions,
            saved_at: Utc::now(),
        };
        checkpoint.save(storage)?;
        self.applied_since_persist = 0;
        tracing::debug!(index = %self.name(), etag = self.checkpoint.0, "index checkpoint saved");
        Ok(())
    }

    fn persist_or_warn(&mut self) {
        if let Err(e) = self.persist() {
            tracing::warn!(index = %self.name(), error = %e, "failed to save index checkpoint");
        }
    }
}

fn group_members(contributions: &HashMap<DocId, Vec<MappedRow>>) -> HashMap<String, BTreeSet<DocId>> {
    let mut members: HashMap<String, BTreeSet<DocId>> = HashMap::new();
    for (id, rows) in contributions {
        for row in rows {
            members.entry(row.key.clone()).or_default().insert(id.clone());
        }
    }
    members
}

/// Every row value `ids` emitted under `key`, in document id order.
fn collect_inputs<'a>(
    contributions: &HashMap<DocId, Vec<MappedRow>>,
    key: &str,
    ids: impl Iterator<Item = &'a DocId>,
) -> Vec<Row> {
    let mut inputs = Vec::new();
    for id in ids {
        if let Some(rows) = contributions.get(id) {
            inputs.extend(rows.iter().filter(|r| r.key == key).map(|r| r.value.clone()));
        }
    }
    inputs
}
