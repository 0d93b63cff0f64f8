use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::Utc;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, Document, Entity, Etag};
use crate::schema::schema::{CollectionSchema, SchemaRegistry};
use crate::storage::layout::StorageLayout;
use crate::storage::snapshot::{DocumentSnapshot, SnapshotDocument};
use crate::storage::wal::{Operation, SyncMode, WAL};

#[derive(Debug, Clone)]
pub enum ChangeKind {
    Put(Arc<Document>),
    Delete,
}

/// One committed mutation, delivered to every subscriber in etag order.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub id: DocId,
    pub etag: Etag,
    pub kind: ChangeKind,
}

/// Every live document as of `etag`.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub documents: Vec<Arc<Document>>,
    pub etag: Etag,
}

struct StoreInner {
    documents: HashMap<DocId, Arc<Document>>,
    wal: Option<WAL>,
    subscribers: Vec<Sender<ChangeNotification>>,
}

/// Document collection keyed by id with a global mutation sequence.
///
/// Mutations are serialized by a single write lock; the etag is assigned,
/// logged and broadcast while that lock is held, which is what gives the
/// change feed its strict ordering.
pub struct DocumentStore {
    inner: RwLock<StoreInner>,
    sequence: AtomicU64,
    schemas: RwLock<SchemaRegistry>,
    storage: Option<StorageLayout>,
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        DocumentStore {
            inner: RwLock::new(StoreInner {
                documents: HashMap::new(),
                wal: None,
                subscribers: Vec::new(),
            }),
            sequence: AtomicU64::new(0),
            schemas: RwLock::new(SchemaRegistry::new()),
            storage: None,
        }
    }

    /// Open a persistent store: load the document snapshot if there is one,
    /// then replay the write-ahead log entries that came after it.
    pub fn open(storage: &StorageLayout, sync_mode: SyncMode) -> Result<Self> {
        let mut documents = HashMap::new();
        let mut last = Etag::ZERO;
        if let Some(snapshot) = DocumentSnapshot::load(storage)? {
            for doc in snapshot.documents {
                let doc = doc.into_document()?;
                documents.insert(doc.id.clone(), Arc::new(doc));
            }
            last = snapshot.etag;
        }
        let base = last;

        let (wal, entries) = WAL::open(storage, sync_mode)?;
        for entry in entries {
            // Left over when a crash hit between snapshot and log reset.
            if entry.etag <= base {
                continue;
            }
            if entry.etag <= last {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("write-ahead log out of order: {} after {}", entry.etag, last),
                ));
            }
            last = entry.etag;
            match entry.operation {
                Operation::Put { id, collection, body } => {
                    let body: Value = serde_json::from_str(&body)?;
                    let doc = Document {
                        id: id.clone(),
                        collection,
                        body,
                        etag: entry.etag,
                        last_modified: entry.timestamp,
                    };
                    documents.insert(id, Arc::new(doc));
                }
                Operation::Delete(id) => {
                    documents.remove(&id);
                }
            }
        }

        tracing::info!(documents = documents.len(), snapshot_etag = base.0, etag = last.0, "document store recovered");

        Ok(DocumentStore {
            inner: RwLock::new(StoreInner {
                documents,
                wal: Some(wal),
                subscribers: Vec::new(),
            }),
            sequence: AtomicU64::new(last.0),
            schemas: RwLock::new(SchemaRegistry::new()),
            storage: Some(storage.clone()),
        })
    }

    /// Write every live document to the snapshot file and empty the WAL.
    ///
    /// Holds the write lock throughout, so no mutation lands between the
    /// snapshot and the log reset. No-op for in-memory stores.
    pub fn compact(&self) -> Result<()> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };

        let mut inner = self.inner.write();
        let etag = self.current_etag();
        let mut documents = inner
            .documents
            .values()
            .map(|doc| SnapshotDocument::from_document(doc))
            .collect::<Result<Vec<_>>>()?;
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        let count = documents.len();

        DocumentSnapshot { etag, documents, saved_at: Utc::now() }.save(storage)?;
        let wal_bytes = inner.wal.as_ref().map(|w| w.size_bytes()).unwrap_or(0);
        if let Some(wal) = inner.wal.as_mut() {
            wal.reset()?;
        }

        tracing::info!(documents = count, etag = etag.0, wal_bytes, "document store compacted");
        Ok(())
    }

    pub fn register_schema(&self, schema: CollectionSchema) {
        self.schemas.write().register(schema);
    }

    /// Insert or overwrite a document.
    pub fn put(&self, id: impl Into<DocId>, collection: &str, body: Value) -> Result<Etag> {
        let id = id.into();
        if id.as_str().is_empty() {
            return Err(Error::validation("document id must not be empty"));
        }
        self.schemas.read().validate(collection, &body)?;

        let mut inner = self.inner.write();
        let etag = Etag(self.sequence.load(Ordering::Acquire)).next();

        if let Some(wal) = inner.wal.as_mut() {
            wal.append(etag, Operation::Put {
                id: id.clone(),
                collection: collection.to_string(),
                body: serde_json::to_string(&body)?,
            })?;
        }

        let doc = Arc::new(Document {
            id: id.clone(),
            collection: collection.to_string(),
            body,
            etag,
            last_modified: Utc::now(),
        });
        inner.documents.insert(id.clone(), doc.clone());
        self.sequence.store(etag.0, Ordering::Release);

        broadcast(&mut inner.subscribers, ChangeNotification {
            id,
            etag,
            kind: ChangeKind::Put(doc),
        });

        Ok(etag)
    }

    pub fn put_entity<T: Entity>(&self, entity: &T) -> Result<Etag> {
        entity.validate()?;
        let body = serde_json::to_value(entity)?;
        self.put(entity.id(), T::COLLECTION, body)
    }

    pub fn get(&self, id: &DocId) -> Result<Arc<Document>> {
        self.inner
            .read()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("document '{}'", id)))
    }

    pub fn get_entity<T: Entity>(&self, id: &DocId) -> Result<T> {
        let doc = self.get(id)?;
        if !doc.is_in(T::COLLECTION) {
            return Err(Error::not_found(format!("document '{}' in {}", id, T::COLLECTION)));
        }
        doc.to_entity()
    }

    pub fn delete(&self, id: &DocId) -> Result<Etag> {
        let mut inner = self.inner.write();
        if !inner.documents.contains_key(id) {
            return Err(Error::not_found(format!("document '{}'", id)));
        }

        let etag = Etag(self.sequence.load(Ordering::Acquire)).next();
        if let Some(wal) = inner.wal.as_mut() {
            wal.append(etag, Operation::Delete(id.clone()))?;
        }

        inner.documents.remove(id);
        self.sequence.store(etag.0, Ordering::Release);

        broadcast(&mut inner.subscribers, ChangeNotification {
            id: id.clone(),
            etag,
            kind: ChangeKind::Delete,
        });

        Ok(etag)
    }

    /// Latest etag assigned across the whole store.
    pub fn current_etag(&self) -> Etag {
        Etag(self.sequence.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.inner.read().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start receiving change notifications for every later mutation.
    pub fn subscribe(&self) -> Receiver<ChangeNotification> {
        let (tx, rx) = unbounded();
        self.inner.write().subscribers.push(tx);
        rx
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read();
        let mut documents: Vec<Arc<Document>> = inner.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        StoreSnapshot {
            documents,
            etag: self.current_etag(),
        }
    }

    pub fn sync(&self) -> Result<()> {
        if let Some(wal) = self.inner.write().wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }

    pub fn wal_size_bytes(&self) -> u64 {
        self.inner.read().wal.as_ref().map(|w| w.size_bytes()).unwrap_or(0)
    }
}

// Receivers that went away (dropped indexes) are pruned here.
fn broadcast(subscribers: &mut Vec<Sender<ChangeNotification>>, notification: ChangeNotification) {
    subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_delete_assign_increasing_etags() {
        let store = DocumentStore::in_memory();
        let a = store.put("company/1", "Companies", json!({ "Name": "A" })).unwrap();
        let b = store.put("company/1", "Companies", json!({ "Name": "B" })).unwrap();
        assert!(b > a);
        assert_eq!(store.get(&DocId::new("company/1")).unwrap().body["Name"], "B");

        let c = store.delete(&DocId::new("company/1")).unwrap();
        assert!(c > b);
        assert_eq!(store.current_etag(), c);
        assert_eq!(store.get(&DocId::new("company/1")).unwrap_err().kind, ErrorKind::NotFound);
    }

    #[test]
    fn delete_missing_is_not_found_and_does_not_advance() {
        let store = DocumentStore::in_memory();
        let err = store.delete(&DocId::new("order/9")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(store.current_etag(), Etag::ZERO);
    }

    #[test]
    fn rejected_put_emits_nothing() {
        let store = DocumentStore::in_memory();
        let rx = store.subscribe();
        let err = store.put("order/1", "Orders", json!("not an object")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(store.current_etag(), Etag::ZERO);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribers_see_mutations_in_order() {
        let store = DocumentStore::in_memory();
        let rx = store.subscribe();
        store.put("a", "Notes", json!({})).unwrap();
        store.put("b", "Notes", json!({})).unwrap();
        store.delete(&DocId::new("a")).unwrap();

        let seen: Vec<(String, u64, bool)> = rx
            .try_iter()
            .map(|n| (n.id.0, n.etag.0, matches!(n.kind, ChangeKind::Delete)))
            .collect();
        assert_eq!(seen, vec![
            ("a".to_string(), 1, false),
            ("b".to_string(), 2, false),
            ("a".to_string(), 3, true),
        ]);
    }

    #[test]
    fn concurrent_writers_get_unique_etags() {
        let store = Arc::new(DocumentStore::in_memory());
        let rx = store.subscribe();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.put(format!("doc/{}-{}", t, i), "Notes", json!({ "i": i })).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let etags: Vec<u64> = rx.try_iter().map(|n| n.etag.0).collect();
        assert_eq!(etags, (1..=200).collect::<Vec<_>>());
        assert_eq!(store.current_etag(), Etag(200));
    }

    #[test]
    fn reopen_replays_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        {
            let store = DocumentStore::open(&layout, SyncMode::Immediate).unwrap();
            store.put("company/1", "Companies", json!({ "Name": "A" })).unwrap();
            store.put("company/2", "Companies", json!({ "Name": "B" })).unwrap();
            store.delete(&DocId::new("company/1")).unwrap();
        }

        let store = DocumentStore::open(&layout, SyncMode::Immediate).unwrap();
        assert_eq!(store.current_etag(), Etag(3));
        assert_eq!(store.len(), 1);
        let doc = store.get(&DocId::new("company/2")).unwrap();
        assert_eq!(doc.etag, Etag(2));
        assert_eq!(doc.body["Name"], "B");
        assert_eq!(store.put("company/3", "Companies", json!({})).unwrap(), Etag(4));
    }

    #[test]
    fn compaction_moves_history_into_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        {
            let store = DocumentStore::open(&layout, SyncMode::Immediate).unwrap();
            for i in 0..10 {
                store.put("company/1", "Companies", json!({ "Version": i })).unwrap();
            }
            store.put("company/2", "Companies", json!({ "Name": "B" })).unwrap();
            store.delete(&DocId::new("company/2")).unwrap();
            assert!(store.wal_size_bytes() > 0);

            store.compact().unwrap();
            assert_eq!(store.wal_size_bytes(), 0);
            store.put("company/3", "Companies", json!({ "Name": "C" })).unwrap();
        }

        let store = DocumentStore::open(&layout, SyncMode::Immediate).unwrap();
        assert_eq!(store.current_etag(), Etag(13));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&DocId::new("company/1")).unwrap().body["Version"], 9);
        assert_eq!(store.get(&DocId::new("company/1")).unwrap().etag, Etag(10));
        assert!(store.get(&DocId::new("company/2")).is_err());
        assert_eq!(store.put("company/4", "Companies", json!({})).unwrap(), Etag(14));
    }

    #[test]
    fn log_entries_covered_by_the_snapshot_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        {
            let store = DocumentStore::open(&layout, SyncMode::Immediate).unwrap();
            store.put("company/1", "Companies", json!({ "Name": "A" })).unwrap();
            store.put("company/2", "Companies", json!({ "Name": "B" })).unwrap();

            // Snapshot written but the log never reset, as after a crash
            // in the middle of compaction.
            let snapshot = store.snapshot();
            DocumentSnapshot {
                etag: snapshot.etag,
                documents: snapshot
                    .documents
                    .iter()
                    .map(|d| SnapshotDocument::from_document(d).unwrap())
                    .collect(),
                saved_at: Utc::now(),
            }
            .save(&layout)
            .unwrap();
            store.put("company/3", "Companies", json!({ "Name": "C" })).unwrap();
        }

        let store = DocumentStore::open(&layout, SyncMode::Immediate).unwrap();
        assert_eq!(store.current_etag(), Etag(3));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn compacting_an_in_memory_store_is_a_no_op() {
        let store = DocumentStore::in_memory();
        store.put("a", "Notes", json!({})).unwrap();
        store.compact().unwrap();
        assert_eq!(store.len(), 1);
    }
}
