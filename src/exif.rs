//! Embedded metadata scanner: locates and decodes the tag-indexed binary
//! metadata block inside an image byte stream.
//!
//! The scanner is safe to run on arbitrary, truncated or adversarial input:
//! every failure mode degrades to "not found" or an empty value list, never
//! a panic. Value bytes are not copied while the tag catalogue is built;
//! each catalogued tag only remembers the offset of its directory entry and
//! is decoded on demand.

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// `Exif\0\0` followed by a big-endian TIFF marker.
const EXIF_PATTERN_BE: [u8; 10] = [0x45, 0x78, 0x69, 0x66, 0x00, 0x00, 0x4d, 0x4d, 0x00, 0x2a];
/// `Exif\0\0` followed by a little-endian TIFF marker.
const EXIF_PATTERN_LE: [u8; 10] = [0x45, 0x78, 0x69, 0x66, 0x00, 0x00, 0x49, 0x49, 0x2a, 0x00];

/// Brute-force search only looks at the start of the file.
const BRUTE_FORCE_WINDOW: usize = 128 << 10;

const TAG_SUB_IFD: u16 = 0x8769;
const TAG_GPS_IFD: u16 = 0x8825;

/// Placeholder timestamps some cameras write instead of leaving the field
/// out ("0000:00:00 00:00:00" and whitespace variants).
static NULL_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^[\s0]{4}[:\s][\s0]{2}[:\s][\s0]{5}[:\s][\s0]{2}[:\s][\s0]{2}$").unwrap()
});

/// Well-known tag ids. GPS tags live in their own directory and use the
/// low id range; they do not collide with the main directory's tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ExifTag {
	GpsVersionId = 0x0,
	GpsLatitudeRef = 0x1,
	GpsLatitude = 0x2,
	GpsLongitudeRef = 0x3,
	GpsLongitude = 0x4,
	GpsAltitudeRef = 0x5,
	GpsAltitude = 0x6,
	GpsTimestamp = 0x7,
	GpsMapDatum = 0x12,
	GpsDateStamp = 0x1D,

	ImageWidth = 0x100,
	ImageLength = 0x101,
	BitsPerSample = 0x102,
	Compression = 0x103,
	ImageDescription = 0x10E,
	Make = 0x10F,
	Model = 0x110,
	Orientation = 0x112,
	XResolution = 0x11A,
	YResolution = 0x11B,
	ResolutionUnit = 0x128,
	Software = 0x131,
	DateTime = 0x132,
	Artist = 0x13B,
	Copyright = 0x8298,

	ExposureTime = 0x829A,
	FNumber = 0x829D,
	ExposureProgram = 0x8822,
	IsoSpeedRatings = 0x8827,
	ExifVersion = 0x9000,
	DateTimeOriginal = 0x9003,
	DateTimeDigitized = 0x9004,
	ShutterSpeedValue = 0x9201,
	ApertureValue = 0x9202,
	BrightnessValue = 0x9203,
	ExposureBiasValue = 0x9204,
	MeteringMode = 0x9207,
	Flash = 0x9209,
	FocalLength = 0x920A,
	UserComment = 0x9286,
	ColorSpace = 0xA001,
	PixelXDimension = 0xA002,
	PixelYDimension = 0xA003,
	ExposureMode = 0xA402,
	WhiteBalance = 0xA403,
	DigitalZoomRatio = 0xA404,
	FocalLengthIn35mmFilm = 0xA405,
	SceneCaptureType = 0xA406,
	ImageUniqueId = 0xA420,
}

impl ExifTag {
	pub fn id(self) -> u16 {
		self as u16
	}
}

/// A decoded tag value. Rational types carry the already-divided quotient,
/// which is what every consumer of this scanner wants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExifValue {
	Bytes(Vec<u8>),
	Text(String),
	Timestamp(NaiveDateTime),
	UShort(u16),
	ULong(u32),
	SByte(i8),
	SShort(i16),
	SLong(i32),
	Rational(f64),
	Float(f32),
	Double(f64),
}

impl ExifValue {
	pub fn as_f64(&self) -> Option<f64> {
		match *self {
			ExifValue::UShort(v) => Some(v as f64),
			ExifValue::ULong(v) => Some(v as f64),
			ExifValue::SByte(v) => Some(v as f64),
			ExifValue::SShort(v) => Some(v as f64),
			ExifValue::SLong(v) => Some(v as f64),
			ExifValue::Rational(v) => Some(v),
			ExifValue::Float(v) => Some(v as f64),
			ExifValue::Double(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_u32(&self) -> Option<u32> {
		match *self {
			ExifValue::UShort(v) => Some(v as u32),
			ExifValue::ULong(v) => Some(v),
			_ => None,
		}
	}

	pub fn as_text(&self) -> Option<&str> {
		match self {
			ExifValue::Text(s) => Some(s),
			_ => None,
		}
	}

	pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
		match *self {
			ExifValue::Timestamp(t) => Some(t),
			_ => None,
		}
	}
}

/// Byte width of one component for each TIFF data type; unknown type codes
/// make that single tag undecodable.
fn field_length(tiff_type: u16) -> Option<usize> {
	match tiff_type {
		1 | 2 | 6 | 7 => Some(1),
		3 | 8 => Some(2),
		4 | 9 | 11 => Some(4),
		5 | 10 | 12 => Some(8),
		_ => None,
	}
}

/// The result of scanning a byte buffer for an embedded metadata segment.
pub struct ExifScan<'a> {
	data: &'a [u8],
	catalogue: HashMap<u16, usize>,
	found: bool,
	little_endian: bool,
	tiff_start: usize,
	end_of_exif: usize,
}

impl<'a> ExifScan<'a> {
	/// Scan a buffer. First the container structure is walked (a JPEG-style
	/// chain of length-prefixed segments); if that fails, the first 128 KiB
	/// are searched for a raw metadata signature. Both searches tolerate
	/// any input.
	pub fn parse(data: &'a [u8]) -> ExifScan<'a> {
		let mut scan = ExifScan {
			data,
			catalogue: HashMap::new(),
			found: false,
			little_endian: false,
			tiff_start: 0,
			end_of_exif: 0,
		};

		if let Some((payload, end)) = scan.jpeg_search() {
			scan.end_of_exif = end;
			scan.build_catalogue(payload);
		}
		if !scan.found {
			scan.brute_force();
		}
		if !scan.found {
			scan.end_of_exif = 0;
		}

		scan
	}

	/// Whether a metadata segment was located and its directory header was
	/// valid. A found scan may still have an empty catalogue.
	pub fn found(&self) -> bool {
		self.found
	}

	/// One past the end of the metadata segment; callers hash file content
	/// from this offset on so that metadata-only edits keep the identity.
	pub fn end_offset(&self) -> usize {
		self.end_of_exif
	}

	pub fn tags(&self) -> impl Iterator<Item = u16> + '_ {
		self.catalogue.keys().copied()
	}

	/// Walk the JPEG segment chain to the metadata segment. Returns the
	/// payload offset and the end of the segment.
	fn jpeg_search(&self) -> Option<(usize, usize)> {
		let data = self.data;
		if data.len() < 8 {
			return None;
		}
		if be_u16(data, 0)? != 0xFFD8 {
			return None;
		}

		let mut pos = 2usize;
		loop {
			// every marker plus its length must stay inside the buffer
			if pos + 4 > data.len() {
				return None;
			}
			if data[pos] != 0xFF || data[pos + 1] == 0xE1 {
				break;
			}
			let len = data[pos + 2] as usize * 256 + data[pos + 3] as usize;
			if data.len() - pos < len + 8 {
				return None;
			}
			pos += 2 + len;
		}

		if be_u16(data, pos)? != 0xFFE1 {
			return None;
		}
		let seg_len = be_u16(data, pos + 2)? as usize;
		let end = pos + 2 + seg_len;
		Some((pos + 4, end))
	}

	/// Look for a raw metadata signature near the start of the buffer.
	fn brute_force(&mut self) {
		let window = &self.data[..self.data.len().min(BRUTE_FORCE_WINDOW)];
		let idx = find_pattern(window, &EXIF_PATTERN_BE)
			.or_else(|| find_pattern(window, &EXIF_PATTERN_LE));

		if let Some(idx) = idx {
			if idx > 0 {
				self.build_catalogue(idx);
				if self.found && !self.catalogue.is_empty() {
					// no segment length available here; the last directory
					// entry bounds the metadata block instead
					let last = self.catalogue.values().copied().max().unwrap_or(0);
					self.end_of_exif = last + 12;
				}
			}
		}
	}

	/// Validate the metadata header at `start` and catalogue the main
	/// directory plus the camera (0x8769) and GPS (0x8825) sub-directories.
	fn build_catalogue(&mut self, start: usize) {
		let data = self.data;
		if data.len().saturating_sub(start) < 14 {
			return;
		}
		if &data[start..start + 4] != b"Exif" {
			return;
		}
		if data[start + 4] != 0 || data[start + 5] != 0 {
			return;
		}

		let tiff_start = start + 6;
		self.little_endian = match &data[tiff_start..tiff_start + 2] {
			b"II" => true,
			b"MM" => false,
			_ => return,
		};
		self.tiff_start = tiff_start;

		if self.u16_at(tiff_start + 2) != Some(0x2A) {
			return;
		}
		let Some(ifd_offset) = self.u32_at(tiff_start + 4) else {
			return;
		};

		self.found = true;

		let mut pos = tiff_start + ifd_offset as usize;
		self.catalogue_directory(&mut pos);

		// skip the thumbnail directory pointer that follows the entries
		if self.u32_at(pos).is_none() {
			return;
		}

		if let Some(sub) = self.single_u32_raw(TAG_SUB_IFD) {
			let mut pos = tiff_start + sub as usize;
			self.catalogue_directory(&mut pos);
		}

		if let Some(gps) = self.single_u32_raw(TAG_GPS_IFD) {
			let mut pos = tiff_start + gps as usize;
			self.catalogue_directory(&mut pos);
		}
	}

	/// Record tag id → entry offset for one directory. Directories that run
	/// past the buffer are catalogued as far as they reach.
	fn catalogue_directory(&mut self, pos: &mut usize) {
		let Some(entry_count) = self.u16_at(*pos) else {
			return;
		};
		*pos += 2;

		for _ in 0..entry_count {
			if self.data.len().saturating_sub(*pos) < 12 {
				return;
			}
			if let Some(tag) = self.u16_at(*pos) {
				self.catalogue.insert(tag, *pos);
			}
			*pos += 12;
		}
	}

	/// Decode all components of a tag. Unknown or malformed entries yield
	/// an empty vector without disturbing the rest of the catalogue.
	pub fn values(&self, tag: ExifTag) -> Vec<ExifValue> {
		self.values_raw(tag.id())
	}

	fn values_raw(&self, tag: u16) -> Vec<ExifValue> {
		self.try_values(tag).unwrap_or_default()
	}

	fn try_values(&self, tag: u16) -> Option<Vec<ExifValue>> {
		let entry = *self.catalogue.get(&tag)?;

		// re-read the entry; the catalogue only stored its position
		if self.u16_at(entry)? != tag {
			return None;
		}
		let tiff_type = self.u16_at(entry + 2)?;
		let count = self.u32_at(entry + 4)? as usize;
		if count == 0 {
			return None;
		}
		let field_len = field_length(tiff_type)?;
		let data_size = count.checked_mul(field_len)?;

		let bytes: &[u8] = if data_size > 4 {
			let rel = self.i32_at(entry + 8)?;
			if rel < 0 {
				return None;
			}
			let abs = self.tiff_start.checked_add(rel as usize)?;
			let end = abs.checked_add(data_size)?;
			if end > self.data.len() {
				return None;
			}
			&self.data[abs..end]
		} else {
			self.data.get(entry + 8..entry + 8 + data_size)?
		};

		// single-byte types come back as one value covering all components
		let components = if field_len == 1 { 1 } else { count };
		let mut res = Vec::with_capacity(components);
		for i in 0..components {
			let chunk = &bytes[i * field_len..];
			let value = match tiff_type {
				1 | 7 => ExifValue::Bytes(bytes.to_vec()),
				2 => text_or_timestamp(tag, bytes),
				3 => ExifValue::UShort(self.swap_u16(chunk)?),
				4 => ExifValue::ULong(self.swap_u32(chunk)?),
				5 => {
					let num = self.swap_u32(chunk)?;
					let den = self.swap_u32(&chunk[4..])?;
					ExifValue::Rational(num as f64 / den as f64)
				}
				6 => ExifValue::SByte(*chunk.first()? as i8),
				8 => ExifValue::SShort(self.swap_u16(chunk)? as i16),
				9 => ExifValue::SLong(self.swap_u32(chunk)? as i32),
				10 => {
					let num = self.swap_u32(chunk)? as i32;
					let den = self.swap_u32(&chunk[4..])? as i32;
					ExifValue::Rational(num as f64 / den as f64)
				}
				11 => ExifValue::Float(f32::from_bits(self.swap_u32(chunk)?)),
				12 => ExifValue::Double(f64::from_bits(self.swap_u64(chunk)?)),
				_ => return None,
			};
			res.push(value);
		}

		Some(res)
	}

	/// The tag's value when it decodes to exactly one component.
	pub fn single(&self, tag: ExifTag) -> Option<ExifValue> {
		let mut values = self.values(tag);
		if values.len() == 1 {
			values.pop()
		} else {
			None
		}
	}

	pub fn single_text(&self, tag: ExifTag) -> Option<String> {
		match self.single(tag)? {
			ExifValue::Text(s) => Some(s),
			_ => None,
		}
	}

	pub fn single_timestamp(&self, tag: ExifTag) -> Option<NaiveDateTime> {
		self.single(tag)?.as_timestamp()
	}

	pub fn single_u32(&self, tag: ExifTag) -> Option<u32> {
		self.single(tag)?.as_u32()
	}

	fn single_u32_raw(&self, tag: u16) -> Option<u32> {
		let values = self.values_raw(tag);
		match values.as_slice() {
			[only] => only.as_u32(),
			_ => None,
		}
	}

	// endian-aware reads against the detected byte order

	fn u16_at(&self, pos: usize) -> Option<u16> {
		self.swap_u16(self.data.get(pos..pos + 2)?)
	}

	fn u32_at(&self, pos: usize) -> Option<u32> {
		self.swap_u32(self.data.get(pos..pos + 4)?)
	}

	fn i32_at(&self, pos: usize) -> Option<i32> {
		Some(self.u32_at(pos)? as i32)
	}

	fn swap_u16(&self, bytes: &[u8]) -> Option<u16> {
		let b: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
		Some(if self.little_endian {
			u16::from_le_bytes(b)
		} else {
			u16::from_be_bytes(b)
		})
	}

	fn swap_u32(&self, bytes: &[u8]) -> Option<u32> {
		let b: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
		Some(if self.little_endian {
			u32::from_le_bytes(b)
		} else {
			u32::from_be_bytes(b)
		})
	}

	fn swap_u64(&self, bytes: &[u8]) -> Option<u64> {
		let b: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
		Some(if self.little_endian {
			u64::from_le_bytes(b)
		} else {
			u64::from_be_bytes(b)
		})
	}
}

/// Big-endian read used while walking the container, before the metadata
/// block's own byte order is known.
fn be_u16(data: &[u8], pos: usize) -> Option<u16> {
	let b: [u8; 2] = data.get(pos..pos + 2)?.try_into().ok()?;
	Some(u16::from_be_bytes(b))
}

fn find_pattern(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|w| w == needle)
}

const TIMESTAMP_TAGS: [u16; 3] = [0x132, 0x9003, 0x9004];

/// Strings are trimmed at the first NUL; the three timestamp tags are
/// additionally parsed with the two literal date formats the format allows.
fn text_or_timestamp(tag: u16, bytes: &[u8]) -> ExifValue {
	let mut text = String::from_utf8_lossy(bytes).into_owned();
	if let Some(nul) = text.find('\0') {
		text.truncate(nul);
	}

	if TIMESTAMP_TAGS.contains(&tag) {
		if let Some(dt) = parse_timestamp(&text) {
			return ExifValue::Timestamp(dt);
		}
	}

	ExifValue::Text(text)
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
	if text.is_empty() || NULL_TIMESTAMP.is_match(text) {
		return None;
	}

	let text = text.replace('/', ":");
	// plain dates are exactly 10 characters; everything else must be a
	// full date/time stamp
	if text.len() == 10 {
		return NaiveDate::parse_from_str(&text, "%Y:%m:%d")
			.ok()?
			.and_hms_opt(0, 0, 0);
	}

	NaiveDateTime::parse_from_str(&text, "%Y:%m:%d %H:%M:%S").ok()
}
