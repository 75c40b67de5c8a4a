//! Persistent photo index: record table, interning arenas and the
//! append-only thumbnail blob files, saved atomically as one snapshot.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::arena::SlotArena;
use crate::data::{
	DirectoryRecord, FileRecord, ImageExtras, IndexHeader, IndexSettings, LibrarySettings,
	SourceKey, SourceRecord, SyncSource, CURRENT_HEADER_VERSION, FLAG_METADATA_REFRESH_REQUIRED,
};
use crate::error::{StoreError, StoreResult};

const INDEX_FILE: &str = "index.bin";
const SETTINGS_FILE: &str = "settings.bin";
const EXTRAS_FILE: &str = "favorites.bin";
const THUMBS_FILE: &str = "large.bin";
const MICROS_FILE: &str = "tiny.bin";
const TMP_SUFFIX: &str = ".tmp";

/// An append-only blob file addressed by (offset, length) pairs stored in
/// records. The write offset is tracked here rather than taken from the
/// file length so that a crashed run (data appended, header never saved)
/// resumes at the last persisted position and overwrites the orphan tail.
pub struct BlobFile {
	inner: Mutex<BlobInner>,
}

struct BlobInner {
	file: File,
	pos: u64,
}

impl BlobFile {
	pub fn open(dir: &Path, name: &str, pos: u64) -> StoreResult<BlobFile> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(dir.join(name))?;
		Ok(BlobFile {
			inner: Mutex::new(BlobInner { file, pos }),
		})
	}

	/// Append a blob and return the offset it was written at.
	pub fn write(&self, bytes: &[u8]) -> StoreResult<u64> {
		let mut inner = self.inner.lock().unwrap();
		let offset = inner.pos;
		inner.file.seek(SeekFrom::Start(offset))?;
		inner.file.write_all(bytes)?;
		inner.pos = offset + bytes.len() as u64;
		Ok(offset)
	}

	/// Read a stored blob; reading at or past the end of the file returns
	/// empty rather than erroring.
	pub fn read(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
		let mut inner = self.inner.lock().unwrap();
		if offset >= inner.file.metadata()?.len() {
			return Ok(Vec::new());
		}
		inner.file.seek(SeekFrom::Start(offset))?;
		let mut buf = vec![0u8; len];
		inner.file.read_exact(&mut buf)?;
		Ok(buf)
	}

	/// Reset to zero length; used when clearing the whole index.
	pub fn truncate(&self) -> StoreResult<()> {
		let mut inner = self.inner.lock().unwrap();
		inner.file.set_len(0)?;
		inner.pos = 0;
		Ok(())
	}

	pub fn flush(&self) -> StoreResult<()> {
		Ok(self.inner.lock().unwrap().file.flush()?)
	}

	pub fn position(&self) -> u64 {
		self.inner.lock().unwrap().pos
	}
}

fn tmp_path(path: &Path) -> PathBuf {
	let mut os = path.as_os_str().to_owned();
	os.push(TMP_SUFFIX);
	PathBuf::from(os)
}

// Cross-platform atomic rename: remove the target first on Windows
fn atomic_rename(from: &Path, to: &Path) -> StoreResult<()> {
	#[cfg(windows)]
	{
		if to.exists() {
			fs::remove_file(to)?;
		}
		fs::rename(from, to)?;
	}

	#[cfg(not(windows))]
	{
		fs::rename(from, to)?;
	}

	Ok(())
}

/// Serialize to a temp file, sync, then rename over the target. The target
/// is never observable in a partially written state.
fn atomic_write<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
	let tmp = tmp_path(path);
	let mut file = File::create(&tmp)?;
	bincode::serialize_into(&mut file, value)?;
	file.flush()?;
	file.sync_all()?;
	let len = file.metadata()?.len();
	drop(file);

	if len == 0 {
		return Err(StoreError::EmptyWrite {
			path: path.to_path_buf(),
		});
	}

	atomic_rename(&tmp, path)?;
	Ok(())
}

/// Load a serialized artifact, recovering from a crashed save: a
/// zero-length target is treated as absent, and a leftover temp file is
/// promoted to the real name and loaded in its place.
fn load_serialized<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
	for _ in 0..2 {
		if path.exists() {
			if fs::metadata(path)?.len() > 0 {
				let file = File::open(path)?;
				let value = bincode::deserialize_from(file)?;
				// a stale temp next to a good file is leftover garbage
				let _ = fs::remove_file(tmp_path(path));
				return Ok(Some(value));
			}
			fs::remove_file(path)?;
		}

		let tmp = tmp_path(path);
		if !tmp.exists() {
			return Ok(None);
		}
		atomic_rename(&tmp, path)?;
	}

	Ok(None)
}

/// Like [`load_serialized`], but structural corruption degrades to "absent"
/// instead of failing the open: a damaged index rebuilds, a crash loop
/// would not.
fn load_tolerant<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
	match load_serialized(path) {
		Ok(v) => Ok(v),
		Err(StoreError::Encode(e)) => {
			warn!("discarding corrupt file {}: {e}", path.display());
			Ok(None)
		}
		Err(e) => Err(e),
	}
}

struct StoreState {
	files: HashMap<u64, FileRecord>,
	by_source: HashMap<SourceKey, u64>,
	dirty: bool,
	sync_sources: Vec<SyncSource>,
	index_settings: IndexSettings,
}

/// The persistent index. Exclusively owns the record table and the blob
/// files; the indexing pipeline requests inserts and merges but never
/// mutates records in place.
pub struct PhotoStore {
	index_path: PathBuf,
	settings_path: PathBuf,
	extras_path: PathBuf,
	state: Mutex<StoreState>,
	pub directories: SlotArena<DirectoryRecord, (String, u32)>,
	pub strings: SlotArena<String, String>,
	thumbs: BlobFile,
	micros: BlobFile,
	/// Serializes blob-append + record-publish pairs so a record's offsets
	/// always point at its own bytes
	save_lock: Mutex<()>,
	settings: Mutex<LibrarySettings>,
	extras: Mutex<HashMap<u64, ImageExtras>>,
}

impl PhotoStore {
	/// Open (or create) the index rooted at `dir`. Tolerates a first run,
	/// zero-length files, leftover temp files and structurally corrupt
	/// snapshots; refuses only an index written by a newer engine version.
	pub fn open(dir: &Path) -> StoreResult<PhotoStore> {
		fs::create_dir_all(dir)?;

		let settings_path = dir.join(SETTINGS_FILE);
		let settings: LibrarySettings =
			load_tolerant(&settings_path)?.unwrap_or_default();

		let extras_path = dir.join(EXTRAS_FILE);
		let extras: HashMap<u64, ImageExtras> =
			load_tolerant(&extras_path)?.unwrap_or_default();

		let index_path = dir.join(INDEX_FILE);
		let mut header: IndexHeader = load_tolerant(&index_path)?.unwrap_or_default();

		if header.settings.version > CURRENT_HEADER_VERSION {
			return Err(StoreError::VersionTooNew {
				found: header.settings.version,
				supported: CURRENT_HEADER_VERSION,
			});
		}

		let mut dirty = false;
		if header.settings.version == 0 {
			// one-shot upgrade: older snapshots predate the metadata layout,
			// re-extract on the next run
			info!("migrating index from version 0");
			for file in &mut header.files {
				file.flags = 0;
				file.set_flag(FLAG_METADATA_REFRESH_REQUIRED);
			}
			header.settings.version = 1;
			dirty = true;
		}
		if header.settings.version != CURRENT_HEADER_VERSION {
			return Err(StoreError::Migration {
				from: header.settings.version,
			});
		}

		let directories = SlotArena::new(DirectoryRecord::arena_key);
		directories.set_all(header.directories);
		let strings: SlotArena<String, String> = SlotArena::new(|s: &String| s.clone());
		strings.set_all(header.strings);

		let mut files = HashMap::with_capacity(header.files.len());
		let mut by_source = HashMap::new();
		for file in header.files {
			for src in &file.sources {
				by_source.insert(src.key(), file.sig);
			}
			files.insert(file.sig, file);
		}
		debug!("loaded index with {} records", files.len());

		Ok(PhotoStore {
			index_path,
			settings_path,
			extras_path,
			state: Mutex::new(StoreState {
				files,
				by_source,
				dirty,
				sync_sources: header.sync_sources,
				index_settings: header.settings,
			}),
			directories,
			strings,
			thumbs: BlobFile::open(dir, THUMBS_FILE, header.thumbs_pos)?,
			micros: BlobFile::open(dir, MICROS_FILE, header.micros_pos)?,
			save_lock: Mutex::new(()),
			settings: Mutex::new(settings),
			extras: Mutex::new(extras),
		})
	}

	/// Replace a record, keeping the path lookup table consistent with the
	/// record's current source list.
	fn publish(state: &mut StoreState, record: FileRecord) {
		if let Some(old) = state.files.get(&record.sig) {
			for src in old.sources.clone() {
				state.by_source.remove(&src.key());
			}
		}
		for src in &record.sources {
			state.by_source.insert(src.key(), record.sig);
		}
		state.files.insert(record.sig, record);
		state.dirty = true;
	}

	/// Insert a new record or reconcile it with the existing record that
	/// owns the same signature.
	///
	/// Merging appends unknown sources; a source matching an existing one
	/// by path but not by timestamp replaces it in place, so a file
	/// re-saved at the same path does not grow a duplicate source entry.
	/// Mutable metadata (primary timestamp, optional attributes, the
	/// refresh flag) is then folded in, and the index is marked dirty only
	/// if anything actually changed.
	///
	/// Inserting a brand-new record that is not fully indexed is a caller
	/// bug, as is a record without a signature.
	pub fn add_or_merge(&self, item: FileRecord) {
		assert!(item.sig != 0, "record signature must be set");

		let mut state = self.state.lock().unwrap();

		let Some(existing) = state.files.get(&item.sig) else {
			assert!(
				item.is_indexed(),
				"inserting a record that is not fully indexed"
			);
			Self::publish(&mut state, item);
			return;
		};

		let mut merged = existing.clone();
		let mut changed = false;

		for src in &item.sources {
			let key = src.key();
			if merged.sources.iter().any(|s| s.key() == key) {
				continue;
			}
			if let Some(i) = merged
				.sources
				.iter()
				.position(|s| s.key().eq_by_path(&key))
			{
				// same path, different write time: the file was re-saved
				merged.sources[i] = src.clone();
			} else {
				merged.sources.push(src.clone());
			}
			changed = true;
		}

		if merged.taken != item.taken {
			merged.taken = item.taken;
			changed = true;
		}
		for (key, value) in item.optional_entries() {
			if merged.get_optional_raw(key) != value {
				merged.set_optional_raw(key, value);
				changed = true;
			}
		}
		if merged.get_flag(FLAG_METADATA_REFRESH_REQUIRED) {
			merged.reset_flag(FLAG_METADATA_REFRESH_REQUIRED);
			changed = true;
		}

		if changed {
			Self::publish(&mut state, merged);
		}
	}

	pub fn get_by_signature(&self, sig: u64) -> Option<FileRecord> {
		self.state.lock().unwrap().files.get(&sig).cloned()
	}

	pub fn get_by_source(&self, key: &SourceKey) -> Option<FileRecord> {
		let state = self.state.lock().unwrap();
		let sig = state.by_source.get(key)?;
		state.files.get(sig).cloned()
	}

	pub fn list_files(&self) -> Vec<FileRecord> {
		self.state.lock().unwrap().files.values().cloned().collect()
	}

	pub fn count(&self) -> usize {
		self.state.lock().unwrap().files.len()
	}

	pub fn is_dirty(&self) -> bool {
		self.state.lock().unwrap().dirty
	}

	/// Flag every record for metadata re-extraction on the next pass.
	pub fn flag_all_for_refresh(&self) {
		let mut state = self.state.lock().unwrap();
		for file in state.files.values_mut() {
			file.set_flag(FLAG_METADATA_REFRESH_REQUIRED);
		}
		state.dirty = true;
	}

	/// (directory slot, lowercased filename) → signature, for resolving
	/// path-keyed sidecar annotations after a batch.
	pub fn list_file_sources(&self) -> HashMap<(u32, String), u64> {
		let state = self.state.lock().unwrap();
		state
			.by_source
			.iter()
			.map(|(key, &sig)| ((key.dir, key.lower_name.clone()), sig))
			.collect()
	}

	/// Drop sources that disappeared from the library. A source survives if
	/// the scan still saw it, or if it lives in a protected directory: a
	/// local folder that could not be listed (when `protect_unreadable` is
	/// set and the folder is outside every readable root), or an external
	/// source that contributed nothing this run (sync failure, not
	/// deletion). Records left without any source become tombstones for
	/// [`PhotoStore::purge_orphans`].
	pub fn remove_missing_sources(&self, scanned: &[FileRecord], protect_unreadable: bool) {
		let complete: HashSet<SourceKey> = scanned
			.iter()
			.flat_map(|f| f.sources.iter().map(|s| s.key()))
			.collect();

		let seen_source_ids: HashSet<u32> = scanned
			.iter()
			.flat_map(|f| f.sources.iter())
			.filter_map(|s| self.directories.get(s.dir))
			.map(|d| d.source_id)
			.collect();

		let readable_roots: Vec<String> = {
			let settings = self.settings.lock().unwrap();
			settings
				.dirs
				.iter()
				.filter(|d| Path::new(d).is_dir())
				.cloned()
				.collect()
		};

		let mut protected: HashSet<u32> = HashSet::new();
		for (slot, dir) in self.directories.to_vec().into_iter().enumerate() {
			let Some(dir) = dir else { continue };
			let shield = if dir.is_local() {
				protect_unreadable
					&& !readable_roots.iter().any(|r| dir.is_subdirectory_of(r))
			} else {
				!seen_source_ids.contains(&dir.source_id)
			};
			if shield {
				protected.insert(slot as u32);
			}
		}

		let mut state = self.state.lock().unwrap();
		let records: Vec<FileRecord> = state.files.values().cloned().collect();
		for record in records {
			let kept: Vec<SourceRecord> = record
				.sources
				.iter()
				.filter(|s| complete.contains(&s.key()) || protected.contains(&s.dir))
				.cloned()
				.collect();
			if kept.len() != record.sources.len() {
				Self::publish(&mut state, record.with_sources(kept));
			}
		}
	}

	/// Remove an external source entirely: its directories leave the arena
	/// and every record sheds the sources that pointed into them.
	pub fn remove_source(&self, source_id: u32) {
		let mut removed_dirs = HashSet::new();
		for (slot, dir) in self.directories.to_vec().into_iter().enumerate() {
			if dir.map(|d| d.source_id) == Some(source_id) {
				self.directories.remove(slot as u32);
				removed_dirs.insert(slot as u32);
			}
		}

		let mut state = self.state.lock().unwrap();
		let records: Vec<FileRecord> = state.files.values().cloned().collect();
		for record in records {
			let kept: Vec<SourceRecord> = record
				.sources
				.iter()
				.filter(|s| !removed_dirs.contains(&s.dir))
				.cloned()
				.collect();
			if kept.len() != record.sources.len() {
				Self::publish(&mut state, record.with_sources(kept));
			}
		}
		state.sync_sources.retain(|s| s.id != source_id);
		state.dirty = true;
	}

	/// Delete records whose last source is gone. Returns how many were
	/// removed.
	pub fn purge_orphans(&self) -> usize {
		let mut state = self.state.lock().unwrap();
		let orphans: Vec<u64> = state
			.files
			.values()
			.filter(|f| f.sources.is_empty())
			.map(|f| f.sig)
			.collect();
		for sig in &orphans {
			state.files.remove(sig);
		}
		if !orphans.is_empty() {
			state.dirty = true;
			info!("purged {} orphaned records", orphans.len());
		}
		orphans.len()
	}

	/// Append both thumbnail blobs and stamp the record with their
	/// offsets and lengths.
	pub fn store_thumbnails(
		&self,
		record: &mut FileRecord,
		thumb: &[u8],
		micro: &[u8],
	) -> StoreResult<()> {
		let _guard = self.save_lock.lock().unwrap();
		record.thumb_offset = self.thumbs.write(thumb)?;
		record.thumb_len = thumb.len() as u32;
		record.micro_offset = self.micros.write(micro)?;
		record.micro_len = micro.len() as u32;
		Ok(())
	}

	pub fn read_thumbnail(&self, record: &FileRecord) -> StoreResult<Vec<u8>> {
		self.thumbs.read(record.thumb_offset, record.thumb_len as usize)
	}

	pub fn read_micro(&self, record: &FileRecord) -> StoreResult<Vec<u8>> {
		self.micros.read(record.micro_offset, record.micro_len as usize)
	}

	/// Snapshot everything into the header and write it atomically. The
	/// blob files are flushed first so the persisted offsets never point
	/// past durable data.
	pub fn save(&self) -> StoreResult<()> {
		let header = {
			let mut state = self.state.lock().unwrap();
			state.dirty = false;
			self.thumbs.flush()?;
			self.micros.flush()?;

			IndexHeader {
				files: state.files.values().cloned().collect(),
				thumbs_pos: self.thumbs.position(),
				micros_pos: self.micros.position(),
				directories: self.directories.to_vec(),
				strings: self.strings.to_vec(),
				sync_sources: state.sync_sources.clone(),
				settings: state.index_settings.clone(),
			}
		};

		atomic_write(&self.index_path, &header)?;
		debug!("saved index with {} records", header.files.len());
		Ok(())
	}

	pub fn save_if_dirty(&self) -> StoreResult<()> {
		if self.is_dirty() {
			self.save()?;
		}
		Ok(())
	}

	/// Drop every record and reset the blob files and arenas; the empty
	/// state is saved immediately.
	pub fn clear(&self) -> StoreResult<()> {
		{
			let mut state = self.state.lock().unwrap();
			state.files.clear();
			state.by_source.clear();
			self.directories.set_all(Vec::new());
			self.strings.set_all(Vec::new());
			self.thumbs.truncate()?;
			self.micros.truncate()?;
		}
		self.save()
	}

	// --- settings ---

	pub fn settings(&self) -> LibrarySettings {
		self.settings.lock().unwrap().clone()
	}

	pub fn set_settings(&self, settings: LibrarySettings) -> StoreResult<()> {
		*self.settings.lock().unwrap() = settings.clone();
		atomic_write(&self.settings_path, &settings)
	}

	// --- sync sources ---

	pub fn index_settings(&self) -> IndexSettings {
		self.state.lock().unwrap().index_settings.clone()
	}

	pub fn sync_sources(&self) -> Vec<SyncSource> {
		self.state.lock().unwrap().sync_sources.clone()
	}

	pub fn add_sync_source(&self, mut source: SyncSource) -> u32 {
		let mut state = self.state.lock().unwrap();
		let id = state
			.sync_sources
			.iter()
			.map(|s| s.id)
			.max()
			.unwrap_or(0)
			+ 1;
		source.id = id;
		state.sync_sources.push(source);
		state.dirty = true;
		id
	}

	/// Record a successful pass over the given source ids (0 is local).
	pub fn stamp_sync_times(&self, source_ids: &[u32], timestamp: i64) {
		let mut state = self.state.lock().unwrap();
		for source in &mut state.sync_sources {
			if source_ids.contains(&source.id) {
				source.last_good_sync = timestamp;
			}
		}
		if source_ids.contains(&0) {
			state.index_settings.last_good_local_sync = timestamp;
		}
	}

	// --- per-image annotations ---

	pub fn get_extras(&self, sig: u64) -> ImageExtras {
		self.extras
			.lock()
			.unwrap()
			.get(&sig)
			.copied()
			.unwrap_or_default()
	}

	/// Attach annotations to an indexed record. Entries carrying no
	/// information are removed rather than stored. Annotating a record
	/// that was never indexed is a caller bug.
	pub fn set_extras(&self, record: &FileRecord, extras: ImageExtras) -> StoreResult<()> {
		assert!(record.is_indexed(), "annotating an unindexed record");
		{
			let mut map = self.extras.lock().unwrap();
			if extras.is_empty() {
				map.remove(&record.sig);
			} else {
				map.insert(record.sig, extras);
			}
		}
		self.save_extras()
	}

	/// Merge imported annotations, newest timestamp wins. Returns whether
	/// anything changed.
	pub fn import_extras(&self, incoming: HashMap<u64, ImageExtras>) -> StoreResult<bool> {
		let mut changed = false;
		{
			let mut map = self.extras.lock().unwrap();
			for (sig, extras) in incoming {
				match map.get(&sig) {
					Some(existing)
						if existing.timestamp >= extras.timestamp || *existing == extras => {}
					_ => {
						map.insert(sig, extras);
						changed = true;
					}
				}
			}
		}
		if changed {
			self.save_extras()?;
		}
		Ok(changed)
	}

	pub fn export_extras(&self) -> HashMap<u64, ImageExtras> {
		self.extras.lock().unwrap().clone()
	}

	fn save_extras(&self) -> StoreResult<()> {
		let snapshot = self.extras.lock().unwrap().clone();
		atomic_write(&self.extras_path, &snapshot)
	}
}

/// Default index location, e.g.:
/// - Linux: ~/.local/share/picdex
/// - macOS: ~/Library/Application Support/picdex
/// - Windows: %APPDATA%\picdex
pub fn default_data_dir() -> Option<PathBuf> {
	dirs::data_dir().map(|mut p| {
		p.push("picdex");
		p
	})
}
