//! Turning a photo request into bytes on a target.
//!
//! [`deliver`] holds the framing both transports share: a start marker, the payload as one or
//! more binary frames, then a completion marker carrying the checksum. The streaming server
//! goes through the single [`TransferWorker`], the P2P manager calls [`deliver`] inline.

use crate::{
	cache::RenditionError,
	protocol::{
		ErrorCode, OriginalFile, PhotoComplete, PhotoError, PhotoService, PhotoStart, Prepared,
		ServerEvent,
	},
};

use ps_images::RenditionSpec;
use ps_utils::error::FileIOError;

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{io::AsyncReadExt, time::sleep};
use tracing::{debug, error, instrument, warn};

mod worker;

pub use worker::{JobHandle, TransferJob, TransferWorker};

/// Frame size used for originals on the streaming channel.
pub const ORIGINAL_FRAME_SIZE: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum DeliveryError {
	#[error("target disconnected")]
	Disconnected,
	#[error("target stopped reading for {0:?}")]
	Stalled(Duration),
	#[error("failed to write to target: {0}")]
	Write(String),
}

#[derive(Error, Debug)]
pub enum TransferError {
	#[error("photo not found: {0}")]
	PhotoNotFound(String),
	#[error("source photo is missing: {}", .0.display())]
	SourceMissing(PathBuf),
	#[error("processing failed: {0}")]
	Processing(String),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error(transparent)]
	Delivery(#[from] DeliveryError),
	#[error("transfer worker is not running")]
	WorkerStopped,
}

impl From<RenditionError> for TransferError {
	fn from(e: RenditionError) -> Self {
		match e {
			RenditionError::SourceMissing(path) => Self::SourceMissing(path),
			RenditionError::FileIO(e) => Self::FileIO(e),
			e @ (RenditionError::Render(_) | RenditionError::TaskJoin(_)) => {
				Self::Processing(e.to_string())
			}
		}
	}
}

impl TransferError {
	/// Code reported to the client for this photo, `None` when the target itself went away.
	pub fn code(&self) -> Option<ErrorCode> {
		match self {
			Self::PhotoNotFound(_) => Some(ErrorCode::PhotoNotFound),
			Self::SourceMissing(_) => Some(ErrorCode::SourceMissing),
			Self::Processing(_) | Self::FileIO(_) | Self::WorkerStopped => {
				Some(ErrorCode::ProcessingFailed)
			}
			Self::Delivery(_) => None,
		}
	}

	/// What the client gets to read, internal details only go to the logs.
	pub fn client_message(&self) -> &'static str {
		match self {
			Self::PhotoNotFound(_) => "Photo not found",
			Self::SourceMissing(_) => "Source file is no longer available",
			Self::Processing(_) | Self::FileIO(_) | Self::WorkerStopped => "Failed to process photo",
			Self::Delivery(_) => "Delivery failed",
		}
	}
}

/// Somewhere photos can be delivered to, a streaming session or a P2P peer.
#[async_trait]
pub trait TransferTarget: Send + Sync + 'static {
	fn label(&self) -> String;

	fn is_connected(&self) -> bool;

	async fn send_event(&self, event: ServerEvent) -> Result<(), DeliveryError>;

	async fn send_binary(&self, bytes: Bytes) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
	Compressed(RenditionSpec),
	Original,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
	pub photo_id: String,
	pub total_bytes: u64,
	pub checksum: String,
}

/// How payloads are cut into binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
	/// `None` sends a rendition as a single frame
	pub rendition_chunk: Option<usize>,
	pub original_chunk: usize,
	/// Pause between two frames, for links without enough buffering of their own
	pub pacing: Option<Duration>,
}

impl Framing {
	pub const STREAMING: Self = Self {
		rendition_chunk: None,
		original_chunk: ORIGINAL_FRAME_SIZE,
		pacing: None,
	};
}

/// Delivers one photo and reports per item failures to the target as `PhotoError`.
///
/// Delivery failures are returned as is, nothing is sent on a target we can't write to.
#[instrument(skip(service, target), fields(to = %target.label()), err(Debug))]
pub async fn deliver(
	service: &PhotoService,
	target: &dyn TransferTarget,
	kind: JobKind,
	photo_id: &str,
	framing: Framing,
) -> Result<TransferOutcome, TransferError> {
	if !target.is_connected() {
		return Err(DeliveryError::Disconnected.into());
	}

	let res = match kind {
		JobKind::Compressed(spec) => match service.prepare(photo_id, spec).await {
			Ok(Prepared::Rendition(prepared)) => {
				send_buffer(
					target,
					PhotoStart {
						photo_id: prepared.photo_id,
						name: prepared.name,
						size: prepared.bytes.len() as u64,
						mime: prepared.mime,
					},
					prepared.bytes,
					prepared.checksum,
					framing,
				)
				.await
			}
			Ok(Prepared::Original(original)) => send_file(target, original, framing).await,
			Err(e) => Err(e),
		},
		JobKind::Original => match service.open_original(photo_id).await {
			Ok(original) => send_file(target, original, framing).await,
			Err(e) => Err(e),
		},
	};

	if let Err(e) = &res {
		report_failure(target, photo_id, e).await;
	}

	res
}

async fn report_failure(target: &dyn TransferTarget, photo_id: &str, e: &TransferError) {
	let Some(code) = e.code() else {
		debug!(%photo_id, ?e, "Transfer aborted by target;");
		return;
	};

	match e {
		TransferError::PhotoNotFound(_) | TransferError::SourceMissing(_) => {
			warn!(%photo_id, ?e, "Photo can't be delivered;");
		}
		_ => error!(%photo_id, ?e, "Failed to process photo;"),
	}

	let event = ServerEvent::PhotoError(PhotoError {
		photo_id: photo_id.to_string(),
		code,
		message: e.client_message().to_string(),
	});

	if let Err(e) = target.send_event(event).await {
		debug!(%photo_id, ?e, "Unable to report photo error, target is gone;");
	}
}

async fn send_buffer(
	target: &dyn TransferTarget,
	start: PhotoStart,
	bytes: Bytes,
	checksum: String,
	framing: Framing,
) -> Result<TransferOutcome, TransferError> {
	let photo_id = start.photo_id.clone();
	let total_bytes = bytes.len() as u64;

	target.send_event(ServerEvent::PhotoStart(start)).await?;

	match framing.rendition_chunk {
		None => target.send_binary(bytes).await?,
		Some(chunk_size) => {
			let mut offset = 0;
			while offset < bytes.len() {
				let end = (offset + chunk_size).min(bytes.len());
				if offset > 0 {
					pace(framing).await;
				}
				target.send_binary(bytes.slice(offset..end)).await?;
				offset = end;
			}
		}
	}

	complete(target, photo_id, total_bytes, checksum).await
}

async fn send_file(
	target: &dyn TransferTarget,
	mut original: OriginalFile,
	framing: Framing,
) -> Result<TransferOutcome, TransferError> {
	let photo_id = original.photo_id.clone();

	target
		.send_event(ServerEvent::PhotoStart(PhotoStart {
			photo_id: original.photo_id,
			name: original.name,
			size: original.size,
			mime: original.mime,
		}))
		.await?;

	let mut hasher = Sha256::new();
	let mut total_bytes = 0u64;
	let mut first = true;

	loop {
		let mut buf = BytesMut::zeroed(framing.original_chunk);
		let mut filled = 0;

		// Fill whole frames so every frame but the last has the same size
		while filled < buf.len() {
			let read = original
				.file
				.read(&mut buf[filled..])
				.await
				.map_err(|e| {
					FileIOError::from_std_io_err_with_msg(&original.path, e, "reading original")
				})?;
			if read == 0 {
				break;
			}
			filled += read;
		}

		if filled == 0 {
			break;
		}

		buf.truncate(filled);
		hasher.update(&buf);
		total_bytes += filled as u64;

		if !first {
			pace(framing).await;
		}
		first = false;

		target.send_binary(buf.freeze()).await?;
	}

	complete(target, photo_id, total_bytes, hex::encode(hasher.finalize())).await
}

async fn complete(
	target: &dyn TransferTarget,
	photo_id: String,
	total_bytes: u64,
	checksum: String,
) -> Result<TransferOutcome, TransferError> {
	target
		.send_event(ServerEvent::PhotoComplete(PhotoComplete {
			photo_id: photo_id.clone(),
			total_bytes,
			checksum: checksum.clone(),
		}))
		.await?;

	Ok(TransferOutcome {
		photo_id,
		total_bytes,
		checksum,
	})
}

async fn pace(framing: Framing) {
	if let Some(delay) = framing.pacing {
		sleep(delay).await;
	}
}
