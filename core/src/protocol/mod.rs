//! Manifest, request validation and photo preparation shared by both transports.
//!
//! The streaming server and the P2P manager only differ in how they frame and move bytes,
//! everything they decide about a request goes through [`PhotoService`].

mod messages;
mod service;
mod validation;

pub use messages::*;
pub use service::{checksum, OriginalFile, OriginalsPlan, PhotoService, Prepared, PreparedPhoto};
pub use validation::{
	parse_photo_ids, parse_rendition_spec, ValidatedBatch, ValidationError, DEFAULT_MAX_BATCH_SIZE,
	DEFAULT_MAX_DIMENSION, DEFAULT_QUALITY, MAX_DIMENSION, MAX_QUALITY,
};
