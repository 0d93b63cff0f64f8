pub mod core;
pub mod storage;
pub mod schema;
pub mod index;
pub mod query;
pub mod model;

pub use crate::core::cancel::CancelToken;
pub use crate::core::config::Config;
pub use crate::core::database::Database;
pub use crate::core::decimal::Decimal;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{DocId, Document, Entity, Etag, FieldValue, Row};
pub use crate::index::definition::{MapReduceDefinition, MappedRow};
pub use crate::index::table::{IndexState, ReducedRow};
pub use crate::query::types::{FilterOp, IndexQuery, QueryResults, RowFilter, SortOrder, WaitMode};

/*
┌────────────────────────────────────────────────────────────────────────────────────────────┐
│                              TALLYDB STRUCT ARCHITECTURE                                    │
└────────────────────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────────── CORE LAYER ──────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────────────────────────────────────────────────────────────────┐    │
│  │                               struct Database                                       │    │
│  │  ┌──────────────────────────────────────────────────────────────────────────────┐ │    │
│  │  │ config: Config                         // Database configuration             │ │    │
│  │  │ storage: Option<Arc<StorageLayout>>    // None when in memory                │ │    │
│  │  │ store: Arc<DocumentStore>              // Documents + etag sequence + WAL    │ │    │
│  │  │ indexes: RwLock<HashMap<IndexHandle>>  // One worker thread per index        │ │    │
│  │  │ executor: QueryExecutor                // Filter/sort/page + non-stale wait  │ │    │
│  │  │ start_time / started                   // Uptime for stats                   │ │    │
│  │  └──────────────────────────────────────────────────────────────────────────────┘ │    │
│  └────────────────────────────────────────────────────────────────────────────────────┘    │
│                                                                                              │
│  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────────────────────────────┐    │
│  │ struct Config    │  │ struct Document  │  │ struct DatabaseStats                  │    │
│  │ • storage_path   │  │ • id: DocId      │  │ • uptime_secs                         │    │
│  │ • wal_sync_mode  │  │ • collection     │  │ • document_count                      │    │
│  │ • default_wait_  │  │ • body: Value    │  │ • current_etag                        │    │
│  │   timeout        │  │ • etag: Etag     │  │ • wal_size_bytes                      │    │
│  │ • checkpoint_    │  │ • last_modified  │  │ • indexes: Vec<IndexStatus>           │    │
│  │   interval       │  └──────────────────┘  └───────────────────────────────────────┘    │
│  └──────────────────┘                                                                       │
│  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────────────────────────────┐    │
│  │ struct Decimal   │  │ enum FieldValue  │  │ struct CancelToken                    │    │
│  │ • 0: i64 (1e-4)  │  │ • Null / Boolean │  │ • cancelled: AtomicBool               │    │
│  └──────────────────┘  │ • Integer/Number │  │ • notify: tokio Notify                │    │
│                        │ • Decimal / Text │  └───────────────────────────────────────┘    │
│                        └──────────────────┘                                                 │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── STORAGE LAYER ──────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────┐  ┌──────────────────────┐  ┌───────────────────────┐          │
│  │ struct DocumentStore   │  │ struct WAL           │  │ struct IndexCheckpoint│          │
│  │ • documents: HashMap   │  │ • file: File         │  │ • name / version      │          │
│  │ • wal: Option<WAL>     │  │ • position: u64      │  │ • etag                │          │
│  │ • subscribers: Vec<Tx> │  │ • sync_mode          │  │ • rows                │          │
│  │ • sequence: AtomicU64  │  └──────────────────────┘  │ • contributions       │          │
│  │ • schemas: Registry    │                            └───────────────────────┘          │
│  └────────────────────────┘  ┌──────────────────────┐                                     │
│                               │ struct StorageLayout │                                     │
│                               │ • base_dir           │                                     │
│                               │ • wal_dir            │                                     │
│                               │ • index_dir          │                                     │
│                               └──────────────────────┘                                     │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌───────────────────────────────────── INDEX LAYER ───────────────────────────────────────────┐
│                                                                                              │
│  ┌────────────────────────┐  ┌──────────────────────┐  ┌───────────────────────┐          │
│  │ struct IndexHandle     │  │ struct IndexEngine   │  │ struct IndexShared    │          │
│  │ • shared: Arc<Shared>  │  │ • definition: Arc<>  │  │ • table: RwLock<>     │          │
│  │ • commands: Sender     │  │ • contributions: Map │  │ • progress: watch::Tx │          │
│  │ • thread: JoinHandle   │  │ • members: Map<Set>  │  └───────────────────────┘          │
│  └────────────────────────┘  │ • checkpoint: Etag   │                                     │
│                               └──────────────────────┘                                     │
└──────────────────────────────────────────────────────────────────────────────────────────────┘

┌────────────────────────────────── RELATIONSHIPS ────────────────────────────────────────────┐
│                                                                                              │
│  Database ──owns──> DocumentStore ──appends──> WAL                                          │
│     │                    │                                                                  │
│     │                    └──broadcasts──> ChangeNotification (crossbeam, etag order)        │
│     │                                              │                                        │
│     ├──owns──> IndexHandle ──runs──> IndexEngine <─┘                                        │
│     │               │                    │                                                  │
│     │               │                    ├──calls──> MapReduceDefinition::map / reduce      │
│     │               │                    └──saves──> IndexCheckpoint                        │
│     │               └──shares──> IndexShared ──publishes──> Progress (tokio watch)          │
│     │                                                          │                            │
│     └──owns──> QueryExecutor ──waits on──────────────────────-─┘                            │
│                                                                                              │
└──────────────────────────────────────────────────────────────────────────────────────────────┘
*/
