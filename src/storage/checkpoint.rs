use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocId, Etag, Row};
use crate::index::definition::MappedRow;
use crate::storage::layout::StorageLayout;

const MAGIC: &[u8; 4] = b"TLYC";

/// Persisted state of one map-reduce index at a fully applied etag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCheckpoint {
    pub name: String,
    pub definition_version: u32,
    pub etag: Etag,
    pub rows: BTreeMap<String, Row>,
    pub contributions: Vec<(DocId, Vec<MappedRow>)>,
    pub saved_at: DateTime<Utc>,
}

impl IndexCheckpoint {
    /// Load checkpoint from disk
    pub fn load(storage: &StorageLayout, name: &str) -> Result<Option<Self>> {
        let path = storage.index_checkpoint_path(name);
        if !path.exists() {
            return Ok(None);
        }

        let data = fs::read(&path)?;
        if data.len() < 8 || &data[..4] != MAGIC {
            return Err(Error::new(ErrorKind::Parse, format!("{} is not an index checkpoint", path.display())));
        }
        let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[8..];
        if crc32fast::hash(payload) != checksum {
            return Err(Error::new(ErrorKind::Parse, format!("checksum mismatch in {}", path.display())));
        }

        let raw = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| Error::new(ErrorKind::Parse, format!("lz4: {}", e)))?;
        let checkpoint: IndexCheckpoint = bincode::deserialize(&raw)?;
        Ok(Some(checkpoint))
    }

    /// Save checkpoint to disk.
    ///
    /// Written to a temporary file first and renamed over the old one, so a
    /// reader only ever sees a complete checkpoint.
    pub fn save(&self, storage: &StorageLayout) -> Result<()> {
        let raw = bincode::serialize(self)?;
        let payload = lz4_flex::compress_prepend_size(&raw);
        let checksum = crc32fast::hash(&payload);

        let tmp = storage.index_checkpoint_tmp_path(&self.name);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(MAGIC)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, storage.index_checkpoint_path(&self.name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decimal::Decimal;
    use crate::core::types::FieldValue;

    fn sample() -> IndexCheckpoint {
        let mut row = Row::new();
        row.insert("Total".to_string(), FieldValue::Decimal("18.5".parse::<Decimal>().unwrap()));
        IndexCheckpoint {
            name: "CompanyOrderTotal".to_string(),
            definition_version: 1,
            etag: Etag(42),
            rows: BTreeMap::from([("company/1".to_string(), row.clone())]),
            contributions: vec![(DocId::new("order/1"), vec![MappedRow::new("company/1", row)])],
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        assert!(IndexCheckpoint::load(&layout, "CompanyOrderTotal").unwrap().is_none());

        sample().save(&layout).unwrap();
        let loaded = IndexCheckpoint::load(&layout, "CompanyOrderTotal").unwrap().unwrap();
        assert_eq!(loaded.etag, Etag(42));
        assert_eq!(loaded.rows, sample().rows);
        assert_eq!(loaded.contributions, sample().contributions);
        assert!(!layout.index_checkpoint_tmp_path("CompanyOrderTotal").exists());
    }

    #[test]
    fn detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();
        sample().save(&layout).unwrap();

        let path = layout.index_checkpoint_path("CompanyOrderTotal");
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = IndexCheckpoint::load(&layout, "CompanyOrderTotal").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
    }
}
