//! Persisted data model: records, sources, directories and the index header

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Version tag written into the index header. Loading refuses anything
/// newer; anything older goes through a one-shot migration.
pub const CURRENT_HEADER_VERSION: u32 = 1;

/// The record needs its embedded metadata re-extracted on the next run.
pub const FLAG_METADATA_REFRESH_REQUIRED: u32 = 1;

/// Fixed-point scale for storing GPS degrees in an i32.
pub const DEGREE_SCALE: i32 = 1_000_000;

/// Closed key set for the optional per-record attribute map. String-valued
/// keys store a slot into the interned string arena; coordinate keys store
/// fixed-point degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OptionalKey {
	Latitude = 1,
	Longitude = 2,
	Place = 3,
	Country = 4,
	CameraModel = 5,
}

impl OptionalKey {
	pub fn is_string(self) -> bool {
		matches!(
			self,
			OptionalKey::Place | OptionalKey::Country | OptionalKey::CameraModel
		)
	}
}

/// One filesystem location where a record's content has been observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
	/// Directory slot in the directory arena
	pub dir: u32,
	pub file_name: String,
	/// Packed last-write time, see [`pack_time`]
	pub last_write: i64,
}

impl SourceRecord {
	pub fn key(&self) -> SourceKey {
		SourceKey {
			dir: self.dir,
			lower_name: self.file_name.to_lowercase(),
			last_write: self.last_write,
		}
	}
}

/// Identity key for source comparisons: (directory, lowercased filename)
/// identifies a path, the last-write time distinguishes file instances at
/// the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
	pub dir: u32,
	pub lower_name: String,
	pub last_write: i64,
}

impl SourceKey {
	/// Same path, ignoring the last-write time.
	pub fn eq_by_path(&self, other: &SourceKey) -> bool {
		self.dir == other.dir && self.lower_name == other.lower_name
	}
}

/// An interned directory. `source_id` 0 is the local filesystem; non-zero
/// ids refer to an external synced source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
	pub path: String,
	pub source_id: u32,
}

impl DirectoryRecord {
	pub fn local(path: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			source_id: 0,
		}
	}

	pub fn is_local(&self) -> bool {
		self.source_id == 0
	}

	pub fn is_subdirectory_of(&self, dir: &str) -> bool {
		let path = self.path.to_lowercase();
		path.starts_with(&dir.to_lowercase())
	}

	pub fn combine(&self, file_name: &str) -> PathBuf {
		Path::new(&self.path).join(file_name)
	}

	/// Arena key: case-insensitive path plus owning source.
	pub fn arena_key(rec: &DirectoryRecord) -> (String, u32) {
		(rec.path.to_lowercase(), rec.source_id)
	}
}

/// One entry per distinct content, identified by the 64-bit signature.
///
/// A record is *indexed* once the signature and both thumbnail lengths are
/// set; records created from directory enumeration start with signature 0
/// and must never be persisted in that state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRecord {
	pub flags: u32,
	pub size: i64,
	/// Primary timestamp, packed with [`pack_time`]
	pub taken: i64,
	pub width: u32,
	pub height: u32,
	pub thumb_offset: u64,
	pub thumb_len: u32,
	pub micro_offset: u64,
	pub micro_len: u32,
	pub sources: Vec<SourceRecord>,
	pub sig: u64,
	pub(crate) optional: BTreeMap<i32, i32>,

	/// Touch ordering for user-visible reprioritization; not persisted
	#[serde(skip)]
	pub prio_ticks: i64,
	/// Thumbnail generation failed during this run; not persisted
	#[serde(skip)]
	pub decode_failed: bool,
}

impl FileRecord {
	pub fn is_indexed(&self) -> bool {
		self.sig != 0 && self.thumb_len != 0 && self.micro_len != 0
	}

	pub fn get_flag(&self, flag: u32) -> bool {
		self.flags & flag != 0
	}

	pub fn set_flag(&mut self, flag: u32) {
		self.flags |= flag;
	}

	pub fn reset_flag(&mut self, flag: u32) {
		self.flags &= !flag;
	}

	pub fn get_optional(&self, key: OptionalKey) -> i32 {
		self.optional.get(&(key as i32)).copied().unwrap_or(0)
	}

	pub fn set_optional(&mut self, key: OptionalKey, value: i32) {
		self.optional.insert(key as i32, value);
	}

	pub(crate) fn get_optional_raw(&self, key: i32) -> i32 {
		self.optional.get(&key).copied().unwrap_or(0)
	}

	pub(crate) fn set_optional_raw(&mut self, key: i32, value: i32) {
		self.optional.insert(key, value);
	}

	pub fn optional_entries(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
		self.optional.iter().map(|(&k, &v)| (k, v))
	}

	/// Copy-on-write helper: clone the record with a replaced source list.
	/// The shared original is never mutated in place.
	pub fn with_sources(&self, sources: Vec<SourceRecord>) -> FileRecord {
		let mut clone = self.clone();
		clone.sources = sources;
		clone
	}
}

/// Per-external-source sync metadata carried in the index header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSource {
	pub id: u32,
	pub display_name: String,
	pub last_good_sync: i64,
	pub data: Vec<u8>,
}

/// Versioning and local-sync bookkeeping stored with the record list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
	pub version: u32,
	pub last_good_local_sync: i64,
}

impl Default for IndexSettings {
	fn default() -> Self {
		Self {
			version: CURRENT_HEADER_VERSION,
			last_good_local_sync: 0,
		}
	}
}

/// The full persisted snapshot of the index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexHeader {
	pub files: Vec<FileRecord>,
	pub thumbs_pos: u64,
	pub micros_pos: u64,
	pub directories: Vec<Option<DirectoryRecord>>,
	pub strings: Vec<Option<String>>,
	pub sync_sources: Vec<SyncSource>,
	pub settings: IndexSettings,
}

/// User-facing library configuration, persisted separately from the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarySettings {
	/// Root folders scanned by the indexer
	pub dirs: Vec<String>,
	/// Long-edge target for generated thumbnails, in pixels
	pub thumbnail_size: u32,
	pub created_utc: i64,
}

impl Default for LibrarySettings {
	fn default() -> Self {
		Self {
			dirs: Vec::new(),
			thumbnail_size: 512,
			created_utc: 0,
		}
	}
}

/// Mutable per-image annotations keyed by signature, persisted separately
/// so favorites survive a full index rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageExtras {
	/// Exif orientation override; 0/1 mean "as stored"
	pub orientation: u32,
	pub favorite: bool,
	pub timestamp: i64,
}

impl ImageExtras {
	/// Entries carrying no information are removed instead of stored.
	pub fn is_empty(&self) -> bool {
		self.orientation <= 1 && !self.favorite
	}
}

/// Pack a timestamp into the decimal literal `YYYYMMDDHHMMSS`. The packed
/// form sorts chronologically and stays human-readable in a hex dump.
pub fn pack_time(t: NaiveDateTime) -> i64 {
	t.year() as i64 * 10000_000000
		+ t.month() as i64 * 100_000000
		+ t.day() as i64 * 1_000000
		+ t.hour() as i64 * 1_0000
		+ t.minute() as i64 * 100
		+ t.second() as i64
}

/// Unpack a [`pack_time`] value; invalid encodings yield `None`.
pub fn unpack_time(v: i64) -> Option<NaiveDateTime> {
	if v <= 0 {
		return None;
	}
	let date = NaiveDate::from_ymd_opt(
		(v / 10000_000000) as i32,
		(v / 100_000000 % 100) as u32,
		(v / 1_000000 % 100) as u32,
	)?;
	date.and_hms_opt(
		(v / 1_0000 % 100) as u32,
		(v / 100 % 100) as u32,
		(v % 100) as u32,
	)
}

pub fn pack_degrees(d: f64) -> i32 {
	(d * DEGREE_SCALE as f64) as i32
}

pub fn unpack_degrees(v: i32) -> f64 {
	v as f64 / DEGREE_SCALE as f64
}

static FULL_DATE_IN_NAME: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\D(\d{8}[_-]\d{6})\D").unwrap());
static SHORT_DATE_IN_NAME: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"\D(\d{8})\D").unwrap());

/// Cameras and messengers embed the capture date in the filename
/// (`IMG_20230501_100000.jpg`). When such a date is plausible and disagrees
/// with the filesystem mtime by more than a threshold, it wins: the mtime
/// of a copied or re-synced file says nothing about when the photo was
/// taken.
pub fn sniff_filename_time(file_name: &str, mtime: NaiveDateTime) -> Option<NaiveDateTime> {
	fn plausible(dt: NaiveDateTime, mtime: NaiveDateTime, min_drift_hours: f64) -> bool {
		let drift = (mtime - dt).num_seconds().abs() as f64 / 3600.0;
		dt.year() > 1900 && dt.year() < 2100 && drift > min_drift_hours
	}

	if let Some(m) = FULL_DATE_IN_NAME.captures(file_name) {
		let text = m[1].replace('-', "_");
		if let Ok(dt) = NaiveDateTime::parse_from_str(&text, "%Y%m%d_%H%M%S") {
			if plausible(dt, mtime, 0.2) {
				return Some(dt);
			}
		}
	}

	if let Some(m) = SHORT_DATE_IN_NAME.captures(file_name) {
		if let Ok(date) = NaiveDate::parse_from_str(&m[1], "%Y%m%d") {
			let dt = date.and_hms_opt(0, 0, 0)?;
			if plausible(dt, mtime, 25.0) {
				return Some(dt);
			}
		}
	}

	None
}
