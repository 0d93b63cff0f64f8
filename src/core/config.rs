use std::path::PathBuf;
use std::time::Duration;
use crate::storage::wal::SyncMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_path: Option<PathBuf>,          // None keeps documents and indexes in memory
    pub wal_sync_mode: SyncMode,
    pub wal_compaction_threshold: u64,          // flush() snapshots documents and empties the WAL past this size

    pub default_wait_timeout: Duration,         // WaitMode::NonStale without an explicit timeout
    pub index_checkpoint_interval: u64,         // Persist index state every N applied changes
    pub rebuild_batch_size: usize,              // Documents mapped per rayon batch during a full build
}

impl Config {
    pub fn in_memory() -> Self {
        Config::default()
    }

    pub fn with_storage(path: impl Into<PathBuf>) -> Self {
        Config {
            storage_path: Some(path.into()),
            ..Config::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage_path: None,
            wal_sync_mode: SyncMode::Batch,
            wal_compaction_threshold: 64 * 1024 * 1024,
            default_wait_timeout: Duration::from_secs(15),
            index_checkpoint_interval: 1024,
            rebuild_batch_size: 512,
        }
    }
}
