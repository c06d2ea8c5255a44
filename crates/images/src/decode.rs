use crate::{
	consts::{GENERIC_EXTENSIONS, MAXIMUM_FILE_SIZE, PASSTHROUGH_EXTENSIONS},
	error::{Error, Result},
};

use std::{fs::File, io::Read, path::Path};

use image::DynamicImage;

fn extension(path: &Path) -> Result<String> {
	path.extension()
		.map(|ext| ext.to_string_lossy().to_ascii_lowercase())
		.ok_or(Error::NoExtension)
}

/// Whether a file with this path could be decoded, judging by its extension only.
pub fn is_supported(path: impl AsRef<Path>) -> bool {
	extension(path.as_ref()).is_ok_and(|ext| GENERIC_EXTENSIONS.contains(&ext.as_str()))
}

/// Whether the file is a photo at all, decodable or not.
pub fn is_photo(path: impl AsRef<Path>) -> bool {
	extension(path.as_ref()).is_ok_and(|ext| {
		GENERIC_EXTENSIONS.contains(&ext.as_str()) || PASSTHROUGH_EXTENSIONS.contains(&ext.as_str())
	})
}

/// Reads and decodes the photo at `path`.
///
/// Files above [`MAXIMUM_FILE_SIZE`] are refused before being read.
pub fn decode_file(path: impl AsRef<Path>) -> Result<DynamicImage> {
	let path = path.as_ref();

	if !GENERIC_EXTENSIONS.contains(&extension(path)?.as_str()) {
		return Err(Error::Unsupported);
	}

	let mut file = File::open(path)?;
	let len = file.metadata()?.len();
	if len > MAXIMUM_FILE_SIZE {
		return Err(Error::TooLarge);
	}

	let mut data = Vec::with_capacity(usize::try_from(len)?);
	file.read_to_end(&mut data)?;

	Ok(image::load_from_memory(&data)?)
}
