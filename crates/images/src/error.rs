use std::num::TryFromIntError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("error while loading the image (via the `image` crate): {0}")]
	Image(#[from] image::ImageError),
	#[error("there was an i/o error: {0}")]
	Io(#[from] std::io::Error),
	#[error("the image provided is unsupported")]
	Unsupported,
	#[error("the image provided is too large")]
	TooLarge,
	#[error("invalid path provided (it had no file extension)")]
	NoExtension,
	#[error("invalid rendition parameters: quality {quality}, max dimension {max_dimension}")]
	InvalidSpec { quality: u8, max_dimension: u32 },
	#[error("error while parsing integers")]
	TryFromInt(#[from] TryFromIntError),
}
