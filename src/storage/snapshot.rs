use std::fs::{self, File};
use std::io::Write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, Document, Etag};
use crate::storage::layout::StorageLayout;

const MAGIC: &[u8; 4] = b"TLYS";

/// One document as written to the snapshot. The body is JSON text for the
/// same reason as in the WAL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub id: DocId,
    pub collection: String,
    pub body: String,
    pub etag: Etag,
    pub last_modified: DateTime<Utc>,
}

impl SnapshotDocument {
    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(SnapshotDocument {
            id: doc.id.clone(),
            collection: doc.collection.clone(),
            body: serde_json::to_string(&doc.body)?,
            etag: doc.etag,
            last_modified: doc.last_modified,
        })
    }

    pub fn into_document(self) -> Result<Document> {
        Ok(Document {
            id: self.id,
            collection: self.collection,
            body: serde_json::from_str(&self.body)?,
            etag: self.etag,
            last_modified: self.last_modified,
        })
    }
}

/// Every live document as of `etag`, the store sequence when it was taken.
/// WAL entries at or below `etag` are already reflected here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub etag: Etag,
    pub documents: Vec<SnapshotDocument>,
    pub saved_at: DateTime<Utc>,
}

impl DocumentSnapshot {
    pub fn load(storage: &StorageLayout) -> Result<Option<Self>> {
        let path = storage.documents_snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        if data.len() < 8 || &data[..4] != MAGIC {
            return Err(Error::new(ErrorKind::Parse, format!("{} is not a document snapshot", path.display())));
        }
        let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[8..];
        if crc32fast::hash(payload) != checksum {
            return Err(Error::new(ErrorKind::Parse, format!("checksum mismatch in {}", path.display())));
        }

        let raw = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| Error::new(ErrorKind::Parse, format!("lz4: {}", e)))?;
        Ok(Some(bincode::deserialize(&raw)?))
    }

    /// Written to a temporary file and renamed into place.
    pub fn save(&self, storage: &StorageLayout) -> Result<()> {
        let raw = bincode::serialize(self)?;
        let payload = lz4_flex::compress_prepend_size(&raw);
        let checksum = crc32fast::hash(&payload);

        let tmp = storage.documents_snapshot_tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(MAGIC)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, storage.documents_snapshot_path())?;
        Ok(())
    }
}
