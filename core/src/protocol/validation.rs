use super::ErrorCode;

use ps_images::RenditionSpec;

use serde_json::Value;
use thiserror::Error;

pub const MAX_QUALITY: u8 = 100;
pub const MAX_DIMENSION: u32 = 10_000;

// Used when a client leaves quality or maxDimension out
pub const DEFAULT_QUALITY: u8 = 80;
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
	#[error("{0}")]
	InvalidRequest(&'static str),
	#[error("batch of {requested} photos exceeds the limit of {cap}")]
	BatchTooLarge { requested: usize, cap: usize },
	#[error("quality must be an integer between 1 and 100")]
	InvalidQuality,
	#[error("maxDimension must be an integer between 1 and 10000")]
	InvalidDimension,
}

impl ValidationError {
	pub fn code(&self) -> ErrorCode {
		match self {
			Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
			Self::BatchTooLarge { .. } => ErrorCode::BatchTooLarge,
			Self::InvalidQuality => ErrorCode::InvalidQuality,
			Self::InvalidDimension => ErrorCode::InvalidDimension,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBatch {
	pub photo_ids: Vec<String>,
	pub spec: RenditionSpec,
}

/// `photoIds` must be a non-empty array of strings holding at most `cap` entries.
pub fn parse_photo_ids(value: Option<&Value>, cap: usize) -> Result<Vec<String>, ValidationError> {
	let Some(Value::Array(items)) = value else {
		return Err(ValidationError::InvalidRequest("photoIds must be an array"));
	};

	if items.is_empty() {
		return Err(ValidationError::InvalidRequest("photoIds must not be empty"));
	}

	if items.len() > cap {
		return Err(ValidationError::BatchTooLarge {
			requested: items.len(),
			cap,
		});
	}

	items
		.iter()
		.map(|item| match item {
			Value::String(id) if !id.is_empty() => Ok(id.clone()),
			_ => Err(ValidationError::InvalidRequest(
				"photoIds must only contain non-empty strings",
			)),
		})
		.collect()
}

pub fn parse_rendition_spec(
	quality: Option<&Value>,
	max_dimension: Option<&Value>,
) -> Result<RenditionSpec, ValidationError> {
	let quality = match quality {
		None | Some(Value::Null) => DEFAULT_QUALITY,
		Some(value) => value
			.as_u64()
			.filter(|q| (1..=u64::from(MAX_QUALITY)).contains(q))
			.and_then(|q| u8::try_from(q).ok())
			.ok_or(ValidationError::InvalidQuality)?,
	};

	let max_dimension = match max_dimension {
		None | Some(Value::Null) => DEFAULT_MAX_DIMENSION,
		Some(value) => value
			.as_u64()
			.filter(|d| (1..=u64::from(MAX_DIMENSION)).contains(d))
			.and_then(|d| u32::try_from(d).ok())
			.ok_or(ValidationError::InvalidDimension)?,
	};

	Ok(RenditionSpec {
		quality,
		max_dimension,
	})
}
