use crate::catalog::{FolderNode, PhotoRecord};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Public fields of a photo, the absolute path never leaves the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPhoto {
	pub id: String,
	pub filename: String,
	pub size: u64,
	pub modified: u64,
	pub width: u32,
	pub height: u32,
}

impl From<&PhotoRecord> for ManifestPhoto {
	fn from(record: &PhotoRecord) -> Self {
		Self {
			id: record.id.clone(),
			filename: record.filename.clone(),
			size: record.size,
			modified: record.modified,
			width: record.width,
			height: record.height,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
	pub photos: Vec<ManifestPhoto>,
	/// Changes whenever the set of ids changes, clients compare it to know when to re-sync
	pub hash: String,
	pub count: usize,
	pub generated_at: DateTime<Utc>,
}

/// Stable machine readable codes of request and per item failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	InvalidRequest,
	BatchTooLarge,
	InvalidQuality,
	InvalidDimension,
	PhotoNotFound,
	SourceMissing,
	ProcessingFailed,
}

impl ErrorCode {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::InvalidRequest => "INVALID_REQUEST",
			Self::BatchTooLarge => "BATCH_TOO_LARGE",
			Self::InvalidQuality => "INVALID_QUALITY",
			Self::InvalidDimension => "INVALID_DIMENSION",
			Self::PhotoNotFound => "PHOTO_NOT_FOUND",
			Self::SourceMissing => "SOURCE_MISSING",
			Self::ProcessingFailed => "PROCESSING_FAILED",
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

// Range checked fields are kept as raw json so a bad value maps to its own error code instead
// of failing the whole frame with INVALID_REQUEST

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
	#[serde(default)]
	pub photo_ids: Option<Value>,
	#[serde(default)]
	pub quality: Option<Value>,
	#[serde(default)]
	pub max_dimension: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalsRequest {
	#[serde(default)]
	pub photo_ids: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRequest {
	pub photo_id: String,
	#[serde(default)]
	pub quality: Option<Value>,
	#[serde(default)]
	pub max_dimension: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalRequest {
	pub photo_id: String,
}

/// Text frames a client sends over the streaming channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientRequest {
	Manifest,
	Batch(BatchRequest),
	Originals(OriginalsRequest),
	Photo(PhotoRequest),
	Original(OriginalRequest),
	Folders,
	Ping {
		#[serde(default)]
		timestamp: i64,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoStart {
	pub photo_id: String,
	pub name: String,
	pub size: u64,
	pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoComplete {
	pub photo_id: String,
	pub total_bytes: u64,
	/// Lowercase hex SHA-256 of every byte sent between start and complete
	pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoError {
	pub photo_id: String,
	pub code: ErrorCode,
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestChanged {
	pub reason: String,
	pub previous_count: usize,
	pub current_count: usize,
	pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRevoked {
	pub reason: String,
	pub message: String,
	pub timestamp: DateTime<Utc>,
}

/// Everything the host pushes to a streaming client, as `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
	tag = "event",
	content = "data",
	rename_all = "kebab-case",
	rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
	Manifest(Manifest),
	BatchStarted {
		total_photos: usize,
		/// Seconds
		estimated_time: u64,
	},
	OriginalsStarted {
		found: usize,
		not_found: usize,
		total_size: u64,
		estimated_time: u64,
	},
	PhotoStart(PhotoStart),
	PhotoComplete(PhotoComplete),
	PhotoError(PhotoError),
	BatchProgress {
		completed: usize,
		total: usize,
	},
	BatchComplete {
		total: usize,
		succeeded: usize,
		failed: usize,
	},
	RequestError {
		code: ErrorCode,
		message: String,
	},
	Folders {
		roots: Vec<FolderNode>,
	},
	Pong {
		timestamp: i64,
	},
	ManifestChanged(ManifestChanged),
	AuthRevoked(AuthRevoked),
}
