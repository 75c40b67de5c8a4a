//! Injected callback interfaces between the engine and its host

use crate::data::{FileRecord, ImageExtras};
use std::collections::HashMap;

/// Everything one scan pass gathered before per-file processing starts:
/// records discovered on disk or contributed by external sources, plus
/// favorite annotations found in legacy sidecar files.
#[derive(Default)]
pub struct ScanBatch {
	pub records: Vec<FileRecord>,
	/// Whether this batch covers the whole library (enables source pruning)
	pub is_full: bool,
	/// Snapshot of the current annotations, for external sources to diff
	pub extras_out: HashMap<u64, ImageExtras>,
	/// Annotations keyed by signature, merged after the batch completes
	pub extras_in: HashMap<u64, ImageExtras>,
	/// Annotations keyed by (directory path, lowercased filename); resolved
	/// to signatures once the batch has been indexed
	pub extras_by_path: Vec<(String, String, ImageExtras)>,
}

impl ScanBatch {
	/// Merge an annotation, keeping the newer timestamp on conflict.
	pub fn add_extras(&mut self, sig: u64, extras: ImageExtras) {
		match self.extras_in.get(&sig) {
			Some(existing) if existing.timestamp > extras.timestamp => {}
			_ => {
				self.extras_in.insert(sig, extras);
			}
		}
	}
}

/// Callbacks the host wires up once at setup. Every hook is optional; a
/// missing hook simply disables that integration point. There is no
/// ambient registration; the indexer owns its hooks.
#[derive(Default)]
pub struct IndexerHooks {
	/// Indexing run started (`true`) or finished (`false`)
	pub on_indexing: Option<Box<dyn Fn(bool) + Send + Sync>>,
	/// Records were added or updated; read-side consumers should refresh
	pub on_update: Option<Box<dyn Fn() + Send + Sync>>,
	/// External synced sources append their records and annotations to the
	/// scan batch before per-file processing
	pub scan_sources: Option<Box<dyn Fn(&mut ScanBatch) + Send + Sync>>,
	/// Thumbnail pair provider for records on non-local sources
	pub remote_thumbnails:
		Option<Box<dyn Fn(&FileRecord) -> Option<(Vec<u8>, Vec<u8>)> + Send + Sync>>,
	/// Byte fetch fallback when no local path yields the file contents
	pub content_provider: Option<Box<dyn Fn(&FileRecord) -> Option<Vec<u8>> + Send + Sync>>,
}

impl IndexerHooks {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_on_indexing<F: Fn(bool) + Send + Sync + 'static>(mut self, f: F) -> Self {
		self.on_indexing = Some(Box::new(f));
		self
	}

	pub fn with_on_update<F: Fn() + Send + Sync + 'static>(mut self, f: F) -> Self {
		self.on_update = Some(Box::new(f));
		self
	}

	pub fn with_scan_sources<F: Fn(&mut ScanBatch) + Send + Sync + 'static>(
		mut self,
		f: F,
	) -> Self {
		self.scan_sources = Some(Box::new(f));
		self
	}

	pub fn with_remote_thumbnails<F>(mut self, f: F) -> Self
	where
		F: Fn(&FileRecord) -> Option<(Vec<u8>, Vec<u8>)> + Send + Sync + 'static,
	{
		self.remote_thumbnails = Some(Box::new(f));
		self
	}

	pub fn with_content_provider<F>(mut self, f: F) -> Self
	where
		F: Fn(&FileRecord) -> Option<Vec<u8>> + Send + Sync + 'static,
	{
		self.content_provider = Some(Box::new(f));
		self
	}

	pub(crate) fn indexing(&self, active: bool) {
		if let Some(hook) = &self.on_indexing {
			hook(active);
		}
	}

	pub(crate) fn update(&self) {
		if let Some(hook) = &self.on_update {
			hook();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_add_extras_keeps_newer() {
		let mut batch = ScanBatch::default();
		batch.add_extras(
			1,
			ImageExtras {
				favorite: true,
				timestamp: 100,
				..Default::default()
			},
		);
		// older entry must not overwrite
		batch.add_extras(
			1,
			ImageExtras {
				favorite: false,
				timestamp: 50,
				..Default::default()
			},
		);
		assert!(batch.extras_in[&1].favorite);

		// newer entry wins
		batch.add_extras(
			1,
			ImageExtras {
				favorite: false,
				timestamp: 200,
				..Default::default()
			},
		);
		assert!(!batch.extras_in[&1].favorite);
	}

	#[test]
	fn test_missing_hooks_are_noops() {
		let hooks = IndexerHooks::new();
		hooks.indexing(true);
		hooks.update();
	}
}
