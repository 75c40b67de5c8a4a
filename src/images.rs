//! Thumbnail rendering collaborator: the engine itself never decodes
//! pixels, it hands bytes to a [`Thumbnailer`] and stores what comes back.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::trace;

/// File extensions the indexer considers image content.
pub const KNOWN_EXTENSIONS: &[&str] = &[
	"jpg", "jpeg", "gif", "webp", "heic", "png", "bmp", "dng",
];

/// Fixed edge of the micro thumbnail used for dense grid views.
pub const MICRO_THUMBNAIL_SIZE: u32 = 64;

const JPEG_QUALITY: u8 = 85;

pub fn is_known_extension(path: &std::path::Path) -> bool {
	path.extension()
		.and_then(|e| e.to_str())
		.map(|e| {
			let lower = e.to_lowercase();
			KNOWN_EXTENSIONS.iter().any(|k| *k == lower)
		})
		.unwrap_or(false)
}

/// The two encoded rasters produced for every indexed image, plus the
/// source dimensions recorded on the file record.
pub struct Rendered {
	pub width: u32,
	pub height: u32,
	pub thumbnail: Vec<u8>,
	pub micro: Vec<u8>,
}

/// Decode-and-resize capability consumed by the indexing pipeline.
/// Implementations return `None` for undecodable input instead of erroring;
/// a failed render only marks the one record.
pub trait Thumbnailer: Send + Sync {
	fn render(&self, bytes: &[u8], long_edge: u32) -> Option<Rendered>;
}

/// Default implementation backed by the `image` crate: proportional
/// long-edge downsize for the main thumbnail, centered square crop for the
/// micro thumbnail, both encoded as JPEG.
#[derive(Debug, Default)]
pub struct ImageThumbnailer;

impl Thumbnailer for ImageThumbnailer {
	fn render(&self, bytes: &[u8], long_edge: u32) -> Option<Rendered> {
		let img = match image::load_from_memory(bytes) {
			Ok(img) => img,
			Err(e) => {
				trace!("thumbnail decode failed: {e}");
				return None;
			}
		};

		let (width, height) = (img.width(), img.height());
		let thumb = if width.max(height) > long_edge {
			img.thumbnail(long_edge, long_edge)
		} else {
			img
		};
		let micro = thumb.resize_to_fill(
			MICRO_THUMBNAIL_SIZE,
			MICRO_THUMBNAIL_SIZE,
			FilterType::Triangle,
		);

		Some(Rendered {
			width,
			height,
			thumbnail: encode_jpeg(&thumb)?,
			micro: encode_jpeg(&micro)?,
		})
	}
}

fn encode_jpeg(img: &DynamicImage) -> Option<Vec<u8>> {
	let mut buf = Vec::new();
	let mut encoder = JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
	// JPEG has no alpha channel
	encoder.encode_image(&img.to_rgb8()).ok()?;
	Some(buf)
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::RgbImage;
	use std::io::Cursor;
	use std::path::Path;

	fn png_bytes(width: u32, height: u32) -> Vec<u8> {
		let img = RgbImage::from_fn(width, height, |x, y| {
			image::Rgb([(x * 7) as u8, (y * 13) as u8, 128])
		});
		let mut buf = Cursor::new(Vec::new());
		DynamicImage::ImageRgb8(img)
			.write_to(&mut buf, image::ImageFormat::Png)
			.unwrap();
		buf.into_inner()
	}

	#[test]
	fn test_known_extensions() {
		assert!(is_known_extension(Path::new("/photos/a.JPG")));
		assert!(is_known_extension(Path::new("shot.heic")));
		assert!(!is_known_extension(Path::new("notes.txt")));
		assert!(!is_known_extension(Path::new("no_extension")));
	}

	#[test]
	fn test_render_downsizes_long_edge() {
		let bytes = png_bytes(320, 160);
		let rendered = ImageThumbnailer.render(&bytes, 80).unwrap();

		assert_eq!(rendered.width, 320);
		assert_eq!(rendered.height, 160);
		assert!(!rendered.thumbnail.is_empty());
		assert!(!rendered.micro.is_empty());

		let thumb = image::load_from_memory(&rendered.thumbnail).unwrap();
		assert_eq!(thumb.width().max(thumb.height()), 80);

		let micro = image::load_from_memory(&rendered.micro).unwrap();
		assert_eq!(micro.width(), MICRO_THUMBNAIL_SIZE);
		assert_eq!(micro.height(), MICRO_THUMBNAIL_SIZE);
	}

	#[test]
	fn test_small_images_are_not_upscaled() {
		let bytes = png_bytes(40, 30);
		let rendered = ImageThumbnailer.render(&bytes, 512).unwrap();

		let thumb = image::load_from_memory(&rendered.thumbnail).unwrap();
		assert_eq!((thumb.width(), thumb.height()), (40, 30));
	}

	#[test]
	fn test_garbage_returns_none() {
		assert!(ImageThumbnailer.render(b"definitely not pixels", 512).is_none());
		assert!(ImageThumbnailer.render(&[], 512).is_none());
	}
}
