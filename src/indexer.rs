//! Indexing pipeline: scan → dedup-check → extract → thumbnail → persist

use md5::{Digest, Md5};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::data::{
	pack_degrees, pack_time, sniff_filename_time, DirectoryRecord, FileRecord, ImageExtras,
	OptionalKey, SourceKey, SourceRecord, FLAG_METADATA_REFRESH_REQUIRED,
};
use crate::error::IndexResult;
use crate::events::{IndexerHooks, ScanBatch};
use crate::exif::{ExifScan, ExifTag, ExifValue};
use crate::images::{is_known_extension, Thumbnailer};
use crate::pool::WorkerPool;
use crate::spatial::{nearest_place, GeoCoordinate};
use crate::store::PhotoStore;

/// Incremental saves start after this long and back off by doubling.
const SAVE_BACKOFF_START_MS: u128 = 3_000;
const SAVE_BACKOFF_MAX_MS: u128 = 60_000;

/// Legacy sidecar file carrying per-image star markers.
const SIDECAR_SUFFIX: &str = "picasa.ini";

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
	/// Re-extract embedded metadata for every known record
	pub force_meta_refresh: bool,
}

/// Compute the 64-bit content signature of an image byte buffer.
///
/// The embedded metadata segment is excluded from the hash so that
/// metadata-only edits (GPS stripped by a privacy feature, a rewritten
/// capture date) do not change the image's identity. A segment that claims
/// more than half the file is not trusted as a bound and everything is
/// hashed instead.
pub fn compute_signature(bytes: &[u8]) -> u64 {
	let scan = ExifScan::parse(bytes);
	let end = scan.end_offset();
	let content = if scan.found() && end > 0 && end < bytes.len() / 2 {
		&bytes[end..]
	} else {
		bytes
	};

	let digest = Md5::digest(content);
	let mut sig = [0u8; 8];
	sig.copy_from_slice(&digest[..8]);
	u64::from_le_bytes(sig)
}

/// Decrements the in-flight counter even if a worker job bails early.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
	fn enter(counter: &Arc<AtomicUsize>) -> InFlight {
		counter.fetch_add(1, Ordering::SeqCst);
		InFlight(Arc::clone(counter))
	}
}

impl Drop for InFlight {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Drives the background indexing of the configured library folders.
///
/// One run walks every root, reconciles what it finds against the store,
/// extracts metadata and content signatures for new files, and hands
/// thumbnail generation to a small low-priority worker pool. The run can be
/// cancelled cooperatively at per-file granularity and re-prioritized while
/// it is underway.
pub struct PhotoIndexer {
	store: Arc<PhotoStore>,
	thumbnailer: Arc<dyn Thumbnailer>,
	hooks: IndexerHooks,
	pool: WorkerPool,
	cancel: Arc<AtomicBool>,
	check_prio: AtomicBool,
	in_flight: Arc<AtomicUsize>,
	prio: Mutex<std::collections::HashMap<SourceKey, i64>>,
	status: Mutex<String>,
	protect_unreadable: bool,
}

impl PhotoIndexer {
	pub fn new(
		store: Arc<PhotoStore>,
		thumbnailer: Arc<dyn Thumbnailer>,
		hooks: IndexerHooks,
	) -> Self {
		Self {
			store,
			thumbnailer,
			hooks,
			pool: WorkerPool::new("thumb"),
			cancel: Arc::new(AtomicBool::new(false)),
			check_prio: AtomicBool::new(false),
			in_flight: Arc::new(AtomicUsize::new(0)),
			prio: Mutex::new(std::collections::HashMap::new()),
			status: Mutex::new(String::new()),
			protect_unreadable: false,
		}
	}

	/// Keep sources under folders that could not be listed this run instead
	/// of treating their files as deleted.
	pub fn with_protect_unreadable(mut self, protect: bool) -> Self {
		self.protect_unreadable = protect;
		self
	}

	/// Request cooperative cancellation; checked at every per-file boundary
	/// and inside the directory walk.
	pub fn cancel(&self) {
		self.cancel.store(true, Ordering::Relaxed);
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.load(Ordering::Relaxed)
	}

	/// A pending file became visible to the user; the queue is re-sorted by
	/// these ticks the next time the pipeline checks.
	pub fn bump_priority(&self, key: SourceKey, ticks: i64) {
		self.prio.lock().unwrap().insert(key, ticks);
		self.check_prio.store(true, Ordering::Relaxed);
	}

	pub fn work_status(&self) -> String {
		self.status.lock().unwrap().clone()
	}

	fn set_status(&self, text: &str, done: bool) {
		let mut status = self.status.lock().unwrap();
		*status = if done {
			text.to_string()
		} else {
			format!("...{text}...")
		};
	}

	/// Run one full indexing pass over the configured library.
	pub fn index_run(&self, opts: &IndexOptions) -> IndexResult<()> {
		self.cancel.store(false, Ordering::Relaxed);
		self.hooks.indexing(true);
		let started = pack_time(chrono::Utc::now().naive_utc());
		let result = self.index_library(opts, started);
		self.hooks.indexing(false);
		result
	}

	fn index_library(&self, opts: &IndexOptions, started: i64) -> IndexResult<()> {
		self.set_status("updating photo library", false);
		info!("indexing pass started");

		if opts.force_meta_refresh {
			self.store.flag_all_for_refresh();
		}

		let mut batch = ScanBatch {
			is_full: true,
			extras_out: self.store.export_extras(),
			..Default::default()
		};

		for root in self.store.settings().dirs {
			if self.is_cancelled() {
				break;
			}
			self.scan_dir(&mut batch, Path::new(&root), true, true);
		}

		if !self.is_cancelled() {
			if let Some(hook) = &self.hooks.scan_sources {
				hook(&mut batch);
			}
		}

		if !self.is_cancelled() && batch.is_full {
			self.store
				.remove_missing_sources(&batch.records, self.protect_unreadable);
		}

		self.index_batch(batch, started)?;

		self.set_status("photo library is up to date", true);
		info!("indexing pass finished");
		Ok(())
	}

	/// Enumerate one root, collecting image records and sidecar markers.
	/// Unreadable entries are logged and skipped; the walk itself is best
	/// effort.
	fn scan_dir(&self, batch: &mut ScanBatch, root: &Path, recurse: bool, sidecars: bool) {
		debug!("scanning {}", root.display());
		let mut walker = WalkDir::new(root);
		if !recurse {
			walker = walker.max_depth(1);
		}

		for entry in walker.into_iter() {
			if self.is_cancelled() {
				return;
			}
			let entry = match entry {
				Ok(e) => e,
				Err(e) => {
					warn!("walk error under {}: {e}", root.display());
					continue;
				}
			};
			if entry.file_type().is_dir() {
				continue;
			}

			let path = entry.path();
			if is_known_extension(path) {
				let metadata = match entry.metadata() {
					Ok(m) => m,
					Err(e) => {
						warn!("skipping {} (metadata error: {e})", path.display());
						continue;
					}
				};
				if let Some(record) = self.record_from_entry(path, &metadata) {
					trace!("found {}", path.display());
					batch.records.push(record);
				}
			} else if sidecars {
				let name = entry.file_name().to_string_lossy().to_lowercase();
				if name.ends_with(SIDECAR_SUFFIX) {
					self.parse_sidecar(batch, path);
				}
			}
		}
	}

	fn record_from_entry(&self, path: &Path, metadata: &fs::Metadata) -> Option<FileRecord> {
		let file_name = path.file_name()?.to_str()?.to_string();
		let parent = path.parent()?.to_str()?.to_string();

		let mtime = chrono::DateTime::<chrono::Utc>::from(metadata.modified().ok()?).naive_utc();
		let written = pack_time(mtime);

		let taken = match sniff_filename_time(&file_name, mtime) {
			Some(embedded) => pack_time(embedded),
			None => written,
		};

		let dir = self.store.directories.intern(DirectoryRecord::local(parent));
		Some(FileRecord {
			size: metadata.len() as i64,
			taken,
			sources: vec![SourceRecord {
				dir,
				file_name,
				last_write: written,
			}],
			..Default::default()
		})
	}

	/// Pull star markers out of a legacy sidecar file. Sections name a file
	/// in the same directory; a `star=yes` line marks it as a favorite.
	fn parse_sidecar(&self, batch: &mut ScanBatch, path: &Path) {
		let Ok(content) = fs::read_to_string(path) else {
			return;
		};
		let Some(parent) = path.parent().and_then(|p| p.to_str()) else {
			return;
		};
		let timestamp = fs::metadata(path)
			.and_then(|m| m.modified())
			.map(|t| pack_time(chrono::DateTime::<chrono::Utc>::from(t).naive_utc()))
			.unwrap_or(0);

		let mut current: Option<String> = None;
		for line in content.lines() {
			let line = line.trim();
			if line.starts_with('[') && line.ends_with(']') && line.contains('.') {
				current = Some(line[1..line.len() - 1].to_lowercase());
			} else if line == "star=yes" {
				if let Some(name) = current.take() {
					batch.extras_by_path.push((
						parent.to_string(),
						name,
						ImageExtras {
							favorite: true,
							timestamp,
							..Default::default()
						},
					));
				}
			}
		}
	}

	fn index_batch(&self, mut batch: ScanBatch, started: i64) -> IndexResult<()> {
		let mut files = std::mem::take(&mut batch.records);

		let involved: Vec<u32> = files
			.iter()
			.flat_map(|f| f.sources.iter())
			.filter_map(|s| self.store.directories.get(s.dir))
			.map(|d| d.source_id)
			.collect::<HashSet<_>>()
			.into_iter()
			.collect();

		// oldest first; the queue pops from the tail, so the newest photos
		// are processed first
		files.sort_by_key(|f| f.taken);

		let total = files.len();
		let mut counter = 0usize;
		let mut last_save = Instant::now();
		let mut backoff_ms = SAVE_BACKOFF_START_MS;

		while !self.is_cancelled() {
			let Some(item) = files.pop() else {
				break;
			};
			self.index_file(item);
			if self.is_cancelled() {
				break;
			}

			counter += 1;
			self.set_status(&format!("indexing: {counter}/{total} files"), false);

			// bound crash data loss without saving on every single file
			if self.store.is_dirty() && last_save.elapsed().as_millis() > backoff_ms {
				self.store.save_if_dirty()?;
				self.hooks.update();
				last_save = Instant::now();
				backoff_ms = (backoff_ms * 2).min(SAVE_BACKOFF_MAX_MS);
			}

			if self.check_prio.swap(false, Ordering::Relaxed) {
				let prio = self.prio.lock().unwrap().clone();
				for record in &mut files {
					if let Some(&ticks) =
						record.sources.first().and_then(|s| prio.get(&s.key()))
					{
						record.prio_ticks = ticks;
					}
				}
				files.sort_by_key(|f| f.prio_ticks);
			}
		}

		// already-dispatched thumbnail work keeps writing to the blob
		// files; the run is not over until it drains
		while self.in_flight.load(Ordering::SeqCst) > 0 {
			std::thread::sleep(Duration::from_millis(1));
		}

		if self.store.is_dirty() {
			if !self.is_cancelled() {
				self.store.stamp_sync_times(&involved, started);
			}
			self.store.save_if_dirty()?;
		}

		if !batch.extras_by_path.is_empty() {
			let lookup = self.store.list_file_sources();
			for (dir, lower_name, extras) in std::mem::take(&mut batch.extras_by_path) {
				let Some(slot) = self.store.directories.lookup(&DirectoryRecord::local(dir))
				else {
					continue;
				};
				if let Some(&sig) = lookup.get(&(slot, lower_name)) {
					batch.add_extras(sig, extras);
				}
			}
		}
		if !batch.extras_in.is_empty() {
			if self.store.import_extras(std::mem::take(&mut batch.extras_in))? {
				self.hooks.update();
			}
		}

		if !self.is_cancelled() {
			self.hooks.update();
		}
		Ok(())
	}

	/// Process one discovered file through dedup-check, extraction and
	/// thumbnail dispatch. Any per-file failure ends here; the batch
	/// continues regardless.
	fn index_file(&self, mut file: FileRecord) {
		// records arriving with a known signature only contribute sources
		if file.sig != 0 && self.store.get_by_signature(file.sig).is_some() {
			self.store.add_or_merge(file);
			return;
		}

		// every path already indexed with fresh metadata: skip without
		// touching the file
		let all_known = !file.sources.is_empty()
			&& file.sources.iter().all(|s| {
				self.store
					.get_by_source(&s.key())
					.is_some_and(|r| !r.get_flag(FLAG_METADATA_REFRESH_REQUIRED))
			});
		if all_known {
			return;
		}

		let local = file.sources.iter().any(|s| {
			self.store
				.directories
				.get(s.dir)
				.is_some_and(|d| d.is_local())
		});

		if !local {
			// externally synced content: thumbnails come from the source
			if file.sig == 0 {
				warn!("remote record without signature, skipping");
				return;
			}
			let Some(hook) = &self.hooks.remote_thumbnails else {
				return;
			};
			match hook(&file) {
				Some((thumb, micro)) => {
					Self::persist_thumbnails(
						&self.store,
						self.is_cancelled(),
						file,
						&thumb,
						&micro,
					);
				}
				None => file.decode_failed = true,
			}
			return;
		}

		let Some(bytes) = self.fetch_image_bytes(&file) else {
			debug!("no readable source for record, skipping");
			return;
		};

		file.sig = compute_signature(&bytes);
		self.fill_metadata(&mut file, &bytes);

		if self.store.get_by_signature(file.sig).is_some() {
			// a new path for content we already hold: merge and stop, no
			// re-decode and no new thumbnails
			self.store.add_or_merge(file);
			return;
		}

		let long_edge = self.store.settings().thumbnail_size;
		let store = Arc::clone(&self.store);
		let thumbnailer = Arc::clone(&self.thumbnailer);
		let cancel = Arc::clone(&self.cancel);
		let guard = InFlight::enter(&self.in_flight);

		self.pool.execute(move || {
			let _guard = guard;
			match thumbnailer.render(&bytes, long_edge) {
				Some(rendered) => {
					file.width = rendered.width;
					file.height = rendered.height;
					Self::persist_thumbnails(
						&store,
						cancel.load(Ordering::Relaxed),
						file,
						&rendered.thumbnail,
						&rendered.micro,
					);
				}
				None => {
					file.decode_failed = true;
					warn!("thumbnail generation failed for signature {:x}", file.sig);
				}
			}
		});
	}

	fn persist_thumbnails(
		store: &PhotoStore,
		cancelled: bool,
		mut file: FileRecord,
		thumb: &[u8],
		micro: &[u8],
	) {
		if thumb.is_empty() || micro.is_empty() {
			file.decode_failed = true;
			return;
		}
		if cancelled {
			return;
		}

		match store.store_thumbnails(&mut file, thumb, micro) {
			Ok(()) => store.add_or_merge(file),
			Err(e) => warn!("failed to persist thumbnails: {e}"),
		}
	}

	/// Fetch the full image bytes for a record: local paths are tried in
	/// order, then the injected content provider.
	pub fn fetch_image_bytes(&self, record: &FileRecord) -> Option<Vec<u8>> {
		for src in &record.sources {
			if let Some(dir) = self.store.directories.get(src.dir) {
				if dir.is_local() {
					match fs::read(dir.combine(&src.file_name)) {
						Ok(bytes) => return Some(bytes),
						Err(e) => debug!(
							"read failed for {}: {e}",
							dir.combine(&src.file_name).display()
						),
					}
				}
			}
		}

		self.hooks.content_provider.as_ref().and_then(|p| p(record))
	}

	/// Extract camera, capture-time and location attributes from the
	/// embedded metadata onto the record.
	fn fill_metadata(&self, file: &mut FileRecord, bytes: &[u8]) {
		let scan = ExifScan::parse(bytes);

		if let Some(make) = scan.single_text(ExifTag::Make) {
			let mut label = make.trim().to_string();
			if let Some(model) = scan.single_text(ExifTag::Model) {
				label = format!("{label} - {}", model.trim());
			}
			let slot = self.store.strings.intern(label);
			file.set_optional(OptionalKey::CameraModel, slot as i32);
		}

		if let Some(taken) = scan
			.single_timestamp(ExifTag::DateTimeOriginal)
			.or_else(|| scan.single_timestamp(ExifTag::DateTime))
		{
			file.taken = pack_time(taken);
		}

		let lat = dms_to_degrees(&scan.values(ExifTag::GpsLatitude));
		let lon = dms_to_degrees(&scan.values(ExifTag::GpsLongitude));
		if let (Some(mut latitude), Some(mut longitude)) = (lat, lon) {
			if scan.single_text(ExifTag::GpsLatitudeRef).as_deref() == Some("S") {
				latitude = -latitude;
			}
			if scan.single_text(ExifTag::GpsLongitudeRef).as_deref() == Some("W") {
				longitude = -longitude;
			}

			if GeoCoordinate::validate(latitude) && GeoCoordinate::validate(longitude) {
				file.set_optional(OptionalKey::Latitude, pack_degrees(latitude));
				file.set_optional(OptionalKey::Longitude, pack_degrees(longitude));

				let coord = GeoCoordinate {
					latitude,
					longitude,
				};
				if let Some(place) = nearest_place(&coord) {
					let name = self.store.strings.intern(place.name.clone());
					let country = self.store.strings.intern(place.country.clone());
					file.set_optional(OptionalKey::Place, name as i32);
					file.set_optional(OptionalKey::Country, country as i32);
				}
			}
		}
	}
}

/// Degrees/minutes/seconds triplet to decimal degrees; anything but three
/// rationals is rejected.
fn dms_to_degrees(values: &[ExifValue]) -> Option<f64> {
	match values {
		[ExifValue::Rational(d), ExifValue::Rational(m), ExifValue::Rational(s)] => {
			Some(d + m / 60.0 + s / 3600.0)
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::{unpack_degrees, LibrarySettings};
	use crate::exif::testutil::{ascii, build_exif, image_content, rationals, wrap_jpeg};
	use crate::images::Rendered;
	use std::sync::atomic::AtomicUsize;
	use tempfile::TempDir;

	const TAG_GPS_IFD: u16 = 0x8825;

	struct StubThumbnailer {
		renders: AtomicUsize,
		fail: bool,
	}

	impl StubThumbnailer {
		fn new() -> Self {
			Self {
				renders: AtomicUsize::new(0),
				fail: false,
			}
		}

		fn failing() -> Self {
			Self {
				renders: AtomicUsize::new(0),
				fail: true,
			}
		}
	}

	impl Thumbnailer for StubThumbnailer {
		fn render(&self, _bytes: &[u8], _long_edge: u32) -> Option<Rendered> {
			self.renders.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				return None;
			}
			Some(Rendered {
				width: 100,
				height: 80,
				thumbnail: vec![1; 64],
				micro: vec![2; 16],
			})
		}
	}

	fn gps_photo(lat_deg: u32, lon_deg: u32, lon_ref: &str, seed: u8) -> Vec<u8> {
		let exif = build_exif(
			&[
				ascii(ExifTag::Make.id(), "Acme"),
				ascii(ExifTag::Model.id(), "X100"),
				ascii(ExifTag::DateTimeOriginal.id(), "2023:05:01 10:00:00"),
			],
			&[(
				TAG_GPS_IFD,
				&[
					ascii(ExifTag::GpsLatitudeRef.id(), "N"),
					rationals(ExifTag::GpsLatitude.id(), &[(lat_deg, 1), (0, 1), (0, 1)]),
					ascii(ExifTag::GpsLongitudeRef.id(), lon_ref),
					rationals(ExifTag::GpsLongitude.id(), &[(lon_deg, 1), (0, 1), (0, 1)]),
				][..],
			)],
		);
		wrap_jpeg(&exif, &image_content(4096, seed))
	}

	struct Setup {
		_lib: TempDir,
		photos: TempDir,
		store: Arc<PhotoStore>,
	}

	fn setup() -> Setup {
		let lib = TempDir::new().unwrap();
		let photos = TempDir::new().unwrap();
		let store = Arc::new(PhotoStore::open(lib.path()).unwrap());
		store
			.set_settings(LibrarySettings {
				dirs: vec![photos.path().to_str().unwrap().to_string()],
				..Default::default()
			})
			.unwrap();
		Setup {
			_lib: lib,
			photos,
			store,
		}
	}

	fn indexer_with(setup: &Setup, thumbnailer: Arc<dyn Thumbnailer>) -> PhotoIndexer {
		PhotoIndexer::new(Arc::clone(&setup.store), thumbnailer, IndexerHooks::new())
	}

	#[test]
	fn test_end_to_end_gps_scenario() {
		let s = setup();
		fs::write(s.photos.path().join("shot.jpg"), gps_photo(37, 122, "W", 7)).unwrap();

		let indexer = indexer_with(&s, Arc::new(StubThumbnailer::new()));
		indexer.index_run(&IndexOptions::default()).unwrap();

		assert_eq!(s.store.count(), 1);
		let files = s.store.list_files();
		let rec = &files[0];
		assert!(rec.sig != 0);
		assert!(rec.is_indexed());
		assert_eq!((rec.width, rec.height), (100, 80));
		assert_eq!(rec.taken, 20230501_100000);

		let lat = unpack_degrees(rec.get_optional(OptionalKey::Latitude));
		let lon = unpack_degrees(rec.get_optional(OptionalKey::Longitude));
		assert!((lat - 37.0).abs() < 1e-5);
		assert!((lon - -122.0).abs() < 1e-5);

		let camera = s
			.store
			.strings
			.get(rec.get_optional(OptionalKey::CameraModel) as u32)
			.unwrap();
		assert_eq!(camera, "Acme - X100");

		let place = s
			.store
			.strings
			.get(rec.get_optional(OptionalKey::Place) as u32)
			.unwrap();
		assert_eq!(place, "San Francisco");

		// thumbnails landed in the blob files
		assert_eq!(s.store.read_thumbnail(rec).unwrap(), vec![1; 64]);
		assert_eq!(s.store.read_micro(rec).unwrap(), vec![2; 16]);
	}

	#[test]
	fn test_dedup_two_paths_one_record() {
		let s = setup();
		let bytes = gps_photo(37, 122, "W", 9);
		fs::write(s.photos.path().join("one.jpg"), &bytes).unwrap();

		let thumbs = Arc::new(StubThumbnailer::new());
		let indexer = indexer_with(&s, Arc::clone(&thumbs) as Arc<dyn Thumbnailer>);
		indexer.index_run(&IndexOptions::default()).unwrap();

		// the same content appears at a second path
		fs::write(s.photos.path().join("two.jpg"), &bytes).unwrap();
		indexer.index_run(&IndexOptions::default()).unwrap();

		assert_eq!(s.store.count(), 1);
		let files = s.store.list_files();
		let rec = &files[0];
		assert_eq!(rec.sources.len(), 2);
		// the duplicate path was merged without a second decode
		assert_eq!(thumbs.renders.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_metadata_only_edit_keeps_signature() {
		// same image content, different embedded GPS
		let a = gps_photo(37, 122, "W", 11);
		let b = gps_photo(51, 13, "E", 11);
		assert_ne!(a, b);
		assert_eq!(compute_signature(&a), compute_signature(&b));

		// different content does change the signature
		let c = gps_photo(37, 122, "W", 12);
		assert_ne!(compute_signature(&a), compute_signature(&c));
	}

	#[test]
	fn test_signature_of_plain_bytes() {
		// no metadata segment: the whole buffer is hashed
		let bytes = image_content(1024, 3);
		assert_ne!(compute_signature(&bytes), 0);
		assert_eq!(compute_signature(&bytes), compute_signature(&bytes));
	}

	#[test]
	fn test_second_run_skips_indexed_files() {
		let s = setup();
		fs::write(s.photos.path().join("shot.jpg"), gps_photo(37, 122, "W", 5)).unwrap();

		let thumbs = Arc::new(StubThumbnailer::new());
		let indexer = indexer_with(&s, Arc::clone(&thumbs) as Arc<dyn Thumbnailer>);
		indexer.index_run(&IndexOptions::default()).unwrap();
		indexer.index_run(&IndexOptions::default()).unwrap();

		assert_eq!(s.store.count(), 1);
		// the second pass never re-read or re-rendered the file
		assert_eq!(thumbs.renders.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_force_refresh_re_extracts_without_new_thumbnails() {
		let s = setup();
		fs::write(s.photos.path().join("shot.jpg"), gps_photo(37, 122, "W", 5)).unwrap();

		let thumbs = Arc::new(StubThumbnailer::new());
		let indexer = indexer_with(&s, Arc::clone(&thumbs) as Arc<dyn Thumbnailer>);
		indexer.index_run(&IndexOptions::default()).unwrap();

		indexer
			.index_run(&IndexOptions {
				force_meta_refresh: true,
			})
			.unwrap();

		assert_eq!(s.store.count(), 1);
		let files = s.store.list_files();
		let rec = &files[0];
		assert!(!rec.get_flag(FLAG_METADATA_REFRESH_REQUIRED));
		// refresh re-reads metadata but keeps the existing thumbnails
		assert_eq!(thumbs.renders.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_undecodable_file_is_tolerated() {
		let s = setup();
		fs::write(s.photos.path().join("broken.jpg"), b"not an image").unwrap();
		fs::write(s.photos.path().join("fine.jpg"), gps_photo(37, 122, "W", 5)).unwrap();

		struct Picky;
		impl Thumbnailer for Picky {
			fn render(&self, bytes: &[u8], _long_edge: u32) -> Option<Rendered> {
				if bytes.starts_with(b"not") {
					return None;
				}
				Some(Rendered {
					width: 10,
					height: 10,
					thumbnail: vec![1; 8],
					micro: vec![2; 4],
				})
			}
		}

		let indexer = indexer_with(&s, Arc::new(Picky));
		indexer.index_run(&IndexOptions::default()).unwrap();

		// the failed file is recorded nowhere; the good one made it
		assert_eq!(s.store.count(), 1);
	}

	#[test]
	fn test_all_failing_leaves_empty_store() {
		let s = setup();
		fs::write(s.photos.path().join("a.jpg"), image_content(256, 1)).unwrap();

		let indexer = indexer_with(&s, Arc::new(StubThumbnailer::failing()));
		indexer.index_run(&IndexOptions::default()).unwrap();

		assert_eq!(s.store.count(), 0);
	}

	#[test]
	fn test_deleted_file_becomes_orphan() {
		let s = setup();
		let keep = s.photos.path().join("keep.jpg");
		let gone = s.photos.path().join("gone.jpg");
		fs::write(&keep, gps_photo(37, 122, "W", 1)).unwrap();
		fs::write(&gone, gps_photo(51, 13, "E", 2)).unwrap();

		let indexer = indexer_with(&s, Arc::new(StubThumbnailer::new()));
		indexer.index_run(&IndexOptions::default()).unwrap();
		assert_eq!(s.store.count(), 2);

		fs::remove_file(&gone).unwrap();
		indexer.index_run(&IndexOptions::default()).unwrap();

		assert_eq!(s.store.purge_orphans(), 1);
		assert_eq!(s.store.count(), 1);
	}

	#[test]
	fn test_sidecar_favorites_resolve_to_signatures() {
		let s = setup();
		fs::write(s.photos.path().join("shot.jpg"), gps_photo(37, 122, "W", 3)).unwrap();
		fs::write(
			s.photos.path().join("picasa.ini"),
			"[SHOT.JPG]\nstar=yes\n[other.jpg]\ncaption=x\n",
		)
		.unwrap();

		let indexer = indexer_with(&s, Arc::new(StubThumbnailer::new()));
		indexer.index_run(&IndexOptions::default()).unwrap();

		let files = s.store.list_files();
		let rec = &files[0];
		assert!(s.store.get_extras(rec.sig).favorite);
	}

	#[test]
	fn test_cancel_flag() {
		let s = setup();
		let indexer = indexer_with(&s, Arc::new(StubThumbnailer::new()));
		assert!(!indexer.is_cancelled());
		indexer.cancel();
		assert!(indexer.is_cancelled());

		// a fresh run clears the flag
		indexer.index_run(&IndexOptions::default()).unwrap();
		assert!(!indexer.is_cancelled());
	}

	#[test]
	fn test_priority_bump_reorders_queue() {
		let s = setup();
		let indexer = indexer_with(&s, Arc::new(StubThumbnailer::new()));
		let key = SourceKey {
			dir: 1,
			lower_name: "a.jpg".to_string(),
			last_write: 0,
		};
		indexer.bump_priority(key, 42);
		assert!(indexer.check_prio.load(Ordering::Relaxed));
	}

	#[test]
	fn test_dms_conversion() {
		let values = [
			ExifValue::Rational(37.0),
			ExifValue::Rational(30.0),
			ExifValue::Rational(36.0),
		];
		let deg = dms_to_degrees(&values).unwrap();
		assert!((deg - 37.51).abs() < 1e-9);

		assert!(dms_to_degrees(&[]).is_none());
		assert!(dms_to_degrees(&[ExifValue::Rational(1.0)]).is_none());
	}

	#[test]
	fn test_local_sync_time_is_stamped() {
		let s = setup();
		fs::write(s.photos.path().join("shot.jpg"), gps_photo(37, 122, "W", 3)).unwrap();

		let indexer = indexer_with(&s, Arc::new(StubThumbnailer::new()));
		indexer.index_run(&IndexOptions::default()).unwrap();

		// persisted header carries the pass timestamp for the local source
		drop(indexer);
		let reopened = PhotoStore::open(s._lib.path()).unwrap();
		assert_eq!(reopened.count(), 1);
		assert!(reopened.index_settings().last_good_local_sync > 0);
	}
}
