//! # picdex
//!
//! A content-addressed photo library indexer. Files are identified by a
//! 64-bit signature over their bytes excluding embedded metadata, so the
//! same photo found at several paths collapses into one record and
//! metadata-only edits keep their identity. Records, interned
//! directory/string tables and two append-only thumbnail blob stores are
//! persisted as one atomically-replaced snapshot that survives crashes and
//! partial writes.

pub mod arena;
pub mod cache;
pub mod data;
pub mod error;
pub mod events;
pub mod exif;
pub mod images;
pub mod indexer;
pub mod pool;
pub mod spatial;
pub mod store;

// Re-export main API types
pub use arena::SlotArena;
pub use cache::EvictionCache;
pub use data::{
	DirectoryRecord, FileRecord, ImageExtras, LibrarySettings, OptionalKey, SourceKey,
	SourceRecord, SyncSource,
};
pub use error::{IndexError, IndexResult, StoreError, StoreResult};
pub use events::{IndexerHooks, ScanBatch};
pub use exif::{ExifScan, ExifTag, ExifValue};
pub use images::{ImageThumbnailer, Rendered, Thumbnailer};
pub use indexer::{compute_signature, IndexOptions, PhotoIndexer};
pub use store::{default_data_dir, BlobFile, PhotoStore};
