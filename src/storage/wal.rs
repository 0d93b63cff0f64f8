use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::core::types::{DocId, Etag};
use crate::storage::layout::StorageLayout;
use crate::core::error::{Result, Error, ErrorKind};

const FRAME_HEADER: u64 = 8;
const MAX_ENTRY_LEN: usize = 64 * 1024 * 1024;

/// Write-ahead log for document mutations
pub struct WAL {
    file: File,
    position: u64,
    sync_mode: SyncMode,
    unsynced_bytes: u64,
    poisoned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Immediate,  // fsync after every write
    Batch,      // fsync once a megabyte has accumulated
    None,       // Let OS handle it
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WALEntry {
    pub etag: Etag,
    pub operation: Operation,
    pub timestamp: DateTime<Utc>,
}

/// Bodies are kept as JSON text: bincode cannot decode a self-describing
/// `serde_json::Value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Put { id: DocId, collection: String, body: String },
    Delete(DocId),
}

impl WAL {
    /// Open the log, returning every intact entry already in it.
    ///
    /// A torn or corrupt tail (crash mid-append) is cut off so new entries
    /// are appended after the last good frame.
    pub fn open(storage: &StorageLayout, sync_mode: SyncMode) -> Result<(Self, Vec<WALEntry>)> {
        let path = storage.wal_path();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let (entries, valid_len) = read_entries(&mut file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating torn write-ahead log tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok((
            WAL {
                file,
                position: valid_len,
                sync_mode,
                unsynced_bytes: 0,
                poisoned: false,
            },
            entries,
        ))
    }

    /// Append one entry at the end of the last good frame.
    ///
    /// On failure the file is cut back to where it was before the call, so
    /// a half-written frame can never sit in front of later entries. If even
    /// that fails the log is poisoned and refuses further appends.
    pub fn append(&mut self, etag: Etag, operation: Operation) -> Result<()> {
        if self.poisoned {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "write-ahead log is poisoned by an earlier failed rollback".to_string(),
            ));
        }

        let entry = WALEntry {
            etag,
            operation,
            timestamp: Utc::now(),
        };

        let data = bincode::serialize(&entry)?;
        let len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        let mut frame = Vec::with_capacity(FRAME_HEADER as usize + data.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(&data);

        if let Err(e) = self.write_frame(&frame) {
            if let Err(rollback) = self.rollback() {
                self.poisoned = true;
                tracing::error!(error = %e, rollback_error = %rollback, "write-ahead log rollback failed");
            }
            return Err(e);
        }

        self.position += frame.len() as u64;
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(frame)?;
        self.unsynced_bytes += frame.len() as u64;

        match self.sync_mode {
            SyncMode::Immediate => self.sync(),
            SyncMode::Batch if self.unsynced_bytes >= 1024 * 1024 => self.sync(),
            _ => Ok(()),
        }
    }

    /// Drop everything past the last good frame.
    fn rollback(&mut self) -> Result<()> {
        self.file.set_len(self.position)?;
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Empty the log once its entries are covered by a document snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        self.position = 0;
        self.unsynced_bytes = 0;
        self.poisoned = false;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.unsynced_bytes = 0;
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.position
    }
}

/// Read frames from the start of the file. Returns the decoded entries and
/// the byte length of the intact prefix.
fn read_entries(file: &mut File) -> Result<(Vec<WALEntry>, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut header = [0u8; FRAME_HEADER as usize];
        match reader.read_exact(&mut header) {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::new(ErrorKind::Io, format!("Failed to read WAL: {}", e))),
        }

        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_ENTRY_LEN {
            break;
        }

        let mut data = vec![0u8; len];
        if reader.read_exact(&mut data).is_err() {
            break;
        }
        if crc32fast::hash(&data) != checksum {
            break;
        }

        match bincode::deserialize::<WALEntry>(&data) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        valid_len += FRAME_HEADER + len as u64;
    }

    Ok((entries, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(id: &str) -> Operation {
        Operation::Put {
            id: DocId::new(id),
            collection: "Companies".to_string(),
            body: format!("{{\"Id\":\"{}\"}}", id),
        }
    }

    #[test]
    fn replays_appended_entries() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        {
            let (mut wal, entries) = WAL::open(&layout, SyncMode::Immediate).unwrap();
            assert!(entries.is_empty());
            wal.append(Etag(1), put("company/1")).unwrap();
            wal.append(Etag(2), Operation::Delete(DocId::new("company/1"))).unwrap();
        }

        let (_, entries) = WAL::open(&layout, SyncMode::None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].etag, Etag(1));
        assert!(matches!(entries[1].operation, Operation::Delete(ref id) if id.as_str() == "company/1"));
    }

    #[test]
    fn truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        let good_len = {
            let (mut wal, _) = WAL::open(&layout, SyncMode::Immediate).unwrap();
            wal.append(Etag(1), put("company/1")).unwrap();
            wal.size_bytes()
        };

        // Half-written frame: header promises more bytes than follow.
        {
            let mut file = OpenOptions::new().append(true).open(layout.wal_path()).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let (mut wal, entries) = WAL::open(&layout, SyncMode::Immediate).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(wal.size_bytes(), good_len);
        assert_eq!(std::fs::metadata(layout.wal_path()).unwrap().len(), good_len);

        wal.append(Etag(2), put("company/2")).unwrap();
        drop(wal);
        let (_, entries) = WAL::open(&layout, SyncMode::None).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn appends_after_a_failed_write_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        {
            let (mut wal, _) = WAL::open(&layout, SyncMode::Immediate).unwrap();
            wal.append(Etag(1), put("company/1")).unwrap();

            // What an interrupted write_all leaves behind.
            wal.file.write_all(&[0x2A, 0x00]).unwrap();

            wal.append(Etag(2), put("company/2")).unwrap();
            wal.append(Etag(3), put("company/3")).unwrap();
        }

        let (_, entries) = WAL::open(&layout, SyncMode::None).unwrap();
        let etags: Vec<Etag> = entries.iter().map(|e| e.etag).collect();
        assert_eq!(etags, vec![Etag(1), Etag(2), Etag(3)]);
    }

    #[test]
    fn rollback_cuts_back_to_last_good_frame() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        let (mut wal, _) = WAL::open(&layout, SyncMode::Immediate).unwrap();
        wal.append(Etag(1), put("company/1")).unwrap();
        let good_len = wal.size_bytes();

        wal.file.write_all(b"half a frame").unwrap();
        wal.rollback().unwrap();
        assert_eq!(std::fs::metadata(layout.wal_path()).unwrap().len(), good_len);
    }

    #[test]
    fn poisoned_log_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        let (mut wal, _) = WAL::open(&layout, SyncMode::Immediate).unwrap();
        wal.poisoned = true;
        let err = wal.append(Etag(1), put("company/1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(wal.size_bytes(), 0);
    }

    #[test]
    fn reset_empties_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().to_path_buf()).unwrap();

        {
            let (mut wal, _) = WAL::open(&layout, SyncMode::Immediate).unwrap();
            wal.append(Etag(1), put("company/1")).unwrap();
            wal.reset().unwrap();
            assert_eq!(wal.size_bytes(), 0);
            wal.append(Etag(2), put("company/2")).unwrap();
        }

        let (_, entries) = WAL::open(&layout, SyncMode::None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].etag, Etag(2));
    }
}
