use std::path::PathBuf;
use std::fs;
use crate::core::error::Result;

/// Directory structure for data files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,      // Root directory
    pub wal_dir: PathBuf,       // Document write-ahead log
    pub index_dir: PathBuf,     // Persisted map-reduce index checkpoints
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let wal_dir = base_dir.join("wal");
        let index_dir = base_dir.join("indexes");

        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&index_dir)?;

        Ok(StorageLayout {
            base_dir,
            wal_dir,
            index_dir,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.wal_dir.join("documents.log")
    }

    /// Snapshot of every live document; the WAL only holds what came after.
    pub fn documents_snapshot_path(&self) -> PathBuf {
        self.base_dir.join("documents.snap")
    }

    pub fn documents_snapshot_tmp_path(&self) -> PathBuf {
        self.base_dir.join("documents.snap.tmp")
    }

    pub fn index_checkpoint_path(&self, index_name: &str) -> PathBuf {
        self.index_dir.join(format!("{}.ckpt", file_stem(index_name)))
    }

    pub fn index_checkpoint_tmp_path(&self, index_name: &str) -> PathBuf {
        self.index_dir.join(format!("{}.ckpt.tmp", file_stem(index_name)))
    }
}

// Index names are user supplied: keep them to a portable file name, and
// suffix a hash of the raw name so names that sanitize alike stay apart.
fn file_stem(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}-{:08x}", sanitized, crc32fast::hash(name.as_bytes()))
}
