pub mod layout;
pub mod wal;
pub mod document_store;
pub mod checkpoint;
pub mod snapshot;
