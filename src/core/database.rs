use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use crate::core::cancel::CancelToken;
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{DatabaseStats, HealthCheck, HealthCheckResult, HealthStatus, IndexStatus};
use crate::core::types::{DocId, Document, Entity, Etag, FieldValue};
use crate::index::definition::MapReduceDefinition;
use crate::index::worker::IndexHandle;
use crate::query::executor::QueryExecutor;
use crate::query::types::{IndexQuery, QueryResults};
use crate::schema::schema::CollectionSchema;
use crate::storage::document_store::DocumentStore;
use crate::storage::layout::StorageLayout;

/// Document store plus the map-reduce indexes maintained over it.
///
/// Writes return as soon as the document is committed; every registered
/// index catches up asynchronously on its own worker thread. Queries either
/// read whatever an index holds now or wait for it to reflect every write
/// committed before the query started.
pub struct Database {
    config: Config,

    storage: Option<Arc<StorageLayout>>,

    store: Arc<DocumentStore>,
    indexes: RwLock<HashMap<String, Arc<IndexHandle>>>,
    executor: QueryExecutor,

    // Metrics
    start_time: DateTime<Utc>,
    started: Instant,
}

impl Database {
    pub fn open(config: Config) -> Result<Self> {
        let (storage, store) = match &config.storage_path {
            Some(path) => {
                let storage = Arc::new(StorageLayout::new(path.clone())?);
                let store = DocumentStore::open(&storage, config.wal_sync_mode)?;
                (Some(storage), store)
            }
            None => (None, DocumentStore::in_memory()),
        };

        tracing::info!(
            path = ?config.storage_path,
            documents = store.len(),
            etag = store.current_etag().0,
            "database opened"
        );

        Ok(Database {
            executor: QueryExecutor::new(config.default_wait_timeout),
            config,
            storage,
            store: Arc::new(store),
            indexes: RwLock::new(HashMap::new()),
            start_time: Utc::now(),
            started: Instant::now(),
        })
    }

    pub fn in_memory() -> Self {
        Database {
            executor: QueryExecutor::new(Config::in_memory().default_wait_timeout),
            config: Config::in_memory(),
            storage: None,
            store: Arc::new(DocumentStore::in_memory()),
            indexes: RwLock::new(HashMap::new()),
            start_time: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn register_schema(&self, schema: CollectionSchema) {
        self.store.register_schema(schema);
    }

    // ========== Documents ==========

    pub fn put(&self, id: impl Into<DocId>, collection: &str, body: Value) -> Result<Etag> {
        self.store.put(id, collection, body)
    }

    pub fn put_entity<T: Entity>(&self, entity: &T) -> Result<Etag> {
        self.store.put_entity(entity)
    }

    pub fn get(&self, id: &DocId) -> Result<Arc<Document>> {
        self.store.get(id)
    }

    pub fn get_entity<T: Entity>(&self, id: &DocId) -> Result<T> {
        self.store.get_entity(id)
    }

    pub fn delete(&self, id: &DocId) -> Result<Etag> {
        self.store.delete(id)
    }

    pub fn current_etag(&self) -> Etag {
        self.store.current_etag()
    }

    pub fn document_count(&self) -> usize {
        self.store.len()
    }

    // ========== Indexes ==========

    /// Register an index and start building it from the store's current
    /// contents. Returns immediately; the build runs in the background.
    pub fn register_index<D: MapReduceDefinition>(&self, definition: D) -> Result<()> {
        self.register_shared_index(Arc::new(definition))
    }

    pub fn register_shared_index(&self, definition: Arc<dyn MapReduceDefinition>) -> Result<()> {
        let name = definition.name().to_string();
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("index name must not be empty"));
        }

        let mut indexes = self.indexes.write();
        if indexes.contains_key(&name) {
            return Err(Error::invalid_argument(format!("index '{}' is already registered", name)));
        }

        let handle = IndexHandle::spawn(definition, self.store.clone(), self.storage.clone(), &self.config)?;
        tracing::info!(index = %name, "index registered");
        indexes.insert(name, Arc::new(handle));
        Ok(())
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn index_status(&self, name: &str) -> Result<IndexStatus> {
        let index = self.index(name)?;
        Ok(IndexStatus::capture(&index.shared, self.store.current_etag()))
    }

    /// Throw away an index's rows and rebuild them from a full scan.
    ///
    /// Blocks until the build completes. The only way out of `Corrupted`.
    pub fn rebuild_index(&self, name: &str, cancel: &CancelToken) -> Result<()> {
        let index = self.index(name)?;
        tracing::info!(index = %name, "rebuild requested");
        index.rebuild(cancel.clone())
    }

    fn index(&self, name: &str) -> Result<Arc<IndexHandle>> {
        self.indexes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("index '{}' is not registered", name)))
    }

    // ========== Queries ==========

    pub async fn query_async(&self, query: &IndexQuery, cancel: &CancelToken) -> Result<QueryResults> {
        let index = self.index(&query.index)?;
        let store = self.store.clone();
        let mut results = self
            .executor
            .execute(&index.shared, move || store.current_etag(), query, cancel)
            .await?;
        self.load_includes(&mut results, &query.includes);
        Ok(results)
    }

    fn load_includes(&self, results: &mut QueryResults, fields: &[String]) {
        for row in &results.rows {
            for field in fields {
                let Some(id) = row.get(field).and_then(FieldValue::as_text) else {
                    continue;
                };
                let id = DocId::new(id);
                if results.includes.contains_key(&id) {
                    continue;
                }
                if let Ok(doc) = self.store.get(&id) {
                    results.includes.insert(id, doc);
                }
            }
        }
    }

    /// Blocking form of [`Database::query_async`].
    ///
    /// Must not be called from inside a tokio runtime; use `query_async` there.
    pub fn query(&self, query: &IndexQuery) -> Result<QueryResults> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "blocking query called from within an async runtime; use query_async".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
        runtime.block_on(self.query_async(query, &CancelToken::new()))
    }

    // ========== Maintenance ==========

    /// Sync the WAL and persist every index at its current checkpoint.
    ///
    /// A WAL past `wal_compaction_threshold` is folded into a document
    /// snapshot first.
    pub fn flush(&self) -> Result<()> {
        if self.store.wal_size_bytes() >= self.config.wal_compaction_threshold {
            self.store.compact()?;
        } else {
            self.store.sync()?;
        }
        let indexes: Vec<Arc<IndexHandle>> = self.indexes.read().values().cloned().collect();
        for index in indexes {
            index.flush()?;
        }
        Ok(())
    }

    /// Write every live document to a snapshot and empty the WAL.
    pub fn compact(&self) -> Result<()> {
        self.store.compact()
    }

    pub fn stats(&self) -> DatabaseStats {
        let store_etag = self.store.current_etag();
        let mut indexes: Vec<IndexStatus> = self
            .indexes
            .read()
            .values()
            .map(|index| IndexStatus::capture(&index.shared, store_etag))
            .collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));

        DatabaseStats {
            uptime_secs: self.started.elapsed().as_secs(),
            start_time: self.start_time,
            document_count: self.store.len(),
            current_etag: store_etag,
            wal_size_bytes: self.store.wal_size_bytes(),
            indexes,
        }
    }

    pub fn health_check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let stats = self.stats();

        let mut checks = vec![HealthCheck {
            name: "document_store".to_string(),
            status: HealthStatus::Healthy,
            message: Some(format!("{} documents at etag {}", stats.document_count, stats.current_etag)),
            latency_ms: started.elapsed().as_millis() as u64,
        }];
        checks.extend(stats.indexes.iter().map(HealthCheck::for_index));

        HealthCheckResult::from_checks(checks)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        for (_, index) in self.indexes.write().drain() {
            index.shutdown();
        }
        if let Err(e) = self.store.sync() {
            tracing::warn!(error = %e, "failed to sync WAL on close");
        }
    }
}
