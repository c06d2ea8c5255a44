#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	clippy::expect_used,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::as_conversions,
	clippy::dbg_macro
)]
#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod consts;
mod decode;
mod error;
mod rendition;

pub use consts::{
	GENERIC_EXTENSIONS, MAXIMUM_FILE_SIZE, PASSTHROUGH_EXTENSIONS, RENDITION_EXTENSION, RENDITION_MIME,
};
pub use decode::{decode_file, is_photo, is_supported};
pub use error::{Error, Result};
pub use rendition::{render, render_file, scale_to_fit, RenditionSpec};
