use crate::{
	decode_file,
	error::{Error, Result},
};

use std::{io::Cursor, path::Path};

use image::{
	codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, GenericImageView, Rgb,
	RgbImage,
};
use tracing::trace;

/// Generation parameters of a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenditionSpec {
	/// JPEG quality, 1 to 100
	pub quality: u8,
	/// Neither side of the output exceeds this many pixels
	pub max_dimension: u32,
}

impl RenditionSpec {
	fn check(self) -> Result<Self> {
		if self.quality == 0 || self.quality > 100 || self.max_dimension == 0 {
			return Err(Error::InvalidSpec {
				quality: self.quality,
				max_dimension: self.max_dimension,
			});
		}
		Ok(self)
	}
}

/// Scales `(width, height)` so that neither side exceeds `max_dimension`, keeping the aspect
/// ratio. Images that already fit are returned untouched, we never upscale.
pub fn scale_to_fit(width: u32, height: u32, max_dimension: u32) -> Result<(u32, u32)> {
	if width <= max_dimension && height <= max_dimension {
		return Ok((width, height));
	}

	let (w, h, max) = (u64::from(width), u64::from(height), u64::from(max_dimension));

	let (scaled_w, scaled_h) = if w >= h {
		(max, ((h * max + w / 2) / w).max(1))
	} else {
		(((w * max + h / 2) / h).max(1), max)
	};

	Ok((u32::try_from(scaled_w)?, u32::try_from(scaled_h)?))
}

/// Decodes the photo at `path` and renders it with [`render`].
///
/// This is CPU bound, callers on an async runtime must move it off the reactor.
pub fn render_file(path: impl AsRef<Path>, spec: RenditionSpec) -> Result<Vec<u8>> {
	render(decode_file(path)?, spec)
}

/// Resamples `img` to fit `spec.max_dimension`, flattens any transparency onto white and
/// encodes the result as JPEG at `spec.quality`.
pub fn render(img: DynamicImage, spec: RenditionSpec) -> Result<Vec<u8>> {
	let spec = spec.check()?;

	let (w, h) = img.dimensions();
	let (target_w, target_h) = scale_to_fit(w, h, spec.max_dimension)?;

	let img = if (target_w, target_h) == (w, h) {
		img
	} else {
		img.resize_exact(target_w, target_h, FilterType::Lanczos3)
	};

	let rgb = flatten(&img);

	let mut buf = Cursor::new(Vec::with_capacity(rgb.as_raw().len() / 8));
	rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, spec.quality))?;

	trace!(
		source_w = w,
		source_h = h,
		target_w,
		target_h,
		quality = spec.quality,
		bytes = buf.get_ref().len(),
		"Rendered photo;"
	);

	Ok(buf.into_inner())
}

/// JPEG has no alpha channel, so transparent pixels are composited over a white background.
fn flatten(img: &DynamicImage) -> RgbImage {
	if !img.color().has_alpha() {
		return img.to_rgb8();
	}

	let rgba = img.to_rgba8();
	let mut out = RgbImage::new(rgba.width(), rgba.height());

	for (src, dst) in rgba.pixels().zip(out.pixels_mut()) {
		let [r, g, b, a] = src.0;
		let alpha = u16::from(a);
		let blend = |channel: u8| {
			let value = (u16::from(channel) * alpha + 255 * (255 - alpha) + 127) / 255;
			u8::try_from(value).unwrap_or(u8::MAX)
		};
		*dst = Rgb([blend(r), blend(g), blend(b)]);
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	use image::{Rgba, RgbaImage};

	#[test]
	fn never_upscales() {
		assert_eq!(scale_to_fit(640, 480, 1024).unwrap(), (640, 480));
		assert_eq!(scale_to_fit(1024, 1024, 1024).unwrap(), (1024, 1024));
	}

	#[test]
	fn keeps_aspect_ratio_on_the_longest_side() {
		assert_eq!(scale_to_fit(4000, 3000, 1000).unwrap(), (1000, 750));
		assert_eq!(scale_to_fit(3000, 4000, 1000).unwrap(), (750, 1000));
		assert_eq!(scale_to_fit(10_000, 10, 100).unwrap(), (100, 1));
	}

	#[test]
	fn transparent_pixels_become_white() {
		let mut img = RgbaImage::new(2, 1);
		img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
		img.put_pixel(1, 0, Rgba([10, 20, 30, 255]));

		let flat = flatten(&DynamicImage::ImageRgba8(img));

		assert_eq!(flat.get_pixel(0, 0).0, [255, 255, 255]);
		assert_eq!(flat.get_pixel(1, 0).0, [10, 20, 30]);
	}

	#[test]
	fn renders_a_bounded_jpeg() {
		let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([120, 80, 40])));

		let bytes = render(
			img,
			RenditionSpec {
				quality: 80,
				max_dimension: 150,
			},
		)
		.unwrap();

		let decoded = image::load_from_memory(&bytes).unwrap();
		assert_eq!(decoded.dimensions(), (150, 100));
		assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
	}

	#[test]
	fn rejects_out_of_range_parameters() {
		let img = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
		let res = render(
			img,
			RenditionSpec {
				quality: 0,
				max_dimension: 10,
			},
		);
		assert!(matches!(res, Err(Error::InvalidSpec { .. })));
	}
}
