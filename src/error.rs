//! Error types for the photo indexing engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the persistent index and its blob files.
///
/// Per-item problems (an unreadable photo, a corrupt metadata block) never
/// surface here; they are tolerated in place and at most flagged on the
/// affected record. `StoreError` covers whole-index operations: loading,
/// saving, and blob file access. A failed save leaves the previous on-disk
/// state intact because every write goes through a temp file and rename.
#[derive(Debug, Error)]
pub enum StoreError {
	/// Filesystem I/O errors around the index directory
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// Header or settings serialization errors
	#[error("Serialization error: {0}")]
	Encode(#[from] bincode::Error),

	/// The on-disk index was written by a newer version of the engine.
	/// Opening it anyway would risk silent data loss, so this is fatal.
	#[error("index version {found} is newer than supported version {supported}")]
	VersionTooNew { found: u32, supported: u32 },

	/// An index migration did not land on the current version
	#[error("index migration from version {from} failed")]
	Migration { from: u32 },

	/// A save produced a zero-length file; the target is left untouched
	#[error("refusing to replace index with empty file: {path}")]
	EmptyWrite { path: PathBuf },
}

/// Errors raised by an indexing run.
#[derive(Debug, Error)]
pub enum IndexError {
	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test_log::test]
	fn test_store_error_display() {
		let error = StoreError::VersionTooNew {
			found: 9,
			supported: 1,
		};
		assert_eq!(
			error.to_string(),
			"index version 9 is newer than supported version 1"
		);

		let error = StoreError::Migration { from: 0 };
		assert_eq!(error.to_string(), "index migration from version 0 failed");
	}

	#[test_log::test]
	fn test_error_conversion() {
		let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
		let store_error: StoreError = io_error.into();
		assert!(matches!(store_error, StoreError::Io(_)));

		let index_error: IndexError = StoreError::Migration { from: 0 }.into();
		assert!(matches!(index_error, IndexError::Store(_)));
	}
}
