use crate::protocol::{
	BatchRequest, ErrorCode, Manifest, ManifestChanged, OriginalRequest, PhotoComplete, PhotoError,
	PhotoRequest, PhotoStart, ServerEvent,
};

use serde::{Deserialize, Serialize};

/// Text messages a peer sends over its data link.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerRequest {
	RequestManifest,
	RequestPhoto(PhotoRequest),
	RequestBatch(BatchRequest),
	RequestOriginal(OriginalRequest),
	Ping {
		#[serde(default)]
		timestamp: i64,
	},
	Pong {
		#[serde(default)]
		timestamp: i64,
	},
}

/// Text messages sent to a peer, flat objects tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
	Manifest(Manifest),
	PhotoStart(PhotoStart),
	PhotoComplete(PhotoComplete),
	PhotoError(PhotoError),
	ManifestChanged(ManifestChanged),
	Ping { timestamp: i64 },
	Pong { timestamp: i64 },
	Error { code: ErrorCode, message: String },
}

impl PeerMessage {
	/// The peer flavour of a streaming event, `None` for events peers don't take part in.
	pub fn from_event(event: ServerEvent) -> Option<Self> {
		match event {
			ServerEvent::Manifest(manifest) => Some(Self::Manifest(manifest)),
			ServerEvent::PhotoStart(start) => Some(Self::PhotoStart(start)),
			ServerEvent::PhotoComplete(complete) => Some(Self::PhotoComplete(complete)),
			ServerEvent::PhotoError(error) => Some(Self::PhotoError(error)),
			ServerEvent::ManifestChanged(changed) => Some(Self::ManifestChanged(changed)),
			ServerEvent::RequestError { code, message } => Some(Self::Error { code, message }),
			ServerEvent::Pong { timestamp } => Some(Self::Pong { timestamp }),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;

	#[test]
	fn messages_are_flat() {
		let message = PeerMessage::PhotoStart(PhotoStart {
			photo_id: "abc".to_string(),
			name: "a.jpg".to_string(),
			size: 10,
			mime: "image/jpeg".to_string(),
		});

		assert_eq!(
			serde_json::to_value(&message).unwrap(),
			json!({ "type": "photo-start", "photoId": "abc", "name": "a.jpg", "size": 10, "mime": "image/jpeg" })
		);
	}

	#[test]
	fn requests_reuse_the_streaming_shapes() {
		let request: PeerRequest = serde_json::from_value(json!({
			"type": "request-photo",
			"photoId": "abc",
			"maxDimension": 512
		}))
		.unwrap();

		let PeerRequest::RequestPhoto(photo) = request else {
			panic!("expected a photo request");
		};
		assert_eq!(photo.photo_id, "abc");
		assert_eq!(photo.max_dimension, Some(json!(512)));

		assert_eq!(
			serde_json::from_value::<PeerRequest>(json!({ "type": "request-manifest" })).unwrap(),
			PeerRequest::RequestManifest
		);
	}

	#[test]
	fn batch_bookkeeping_events_stay_on_the_streaming_side() {
		assert_eq!(
			PeerMessage::from_event(ServerEvent::BatchProgress {
				completed: 1,
				total: 2,
			}),
			None
		);
		assert_eq!(
			PeerMessage::from_event(ServerEvent::Pong { timestamp: 3 }),
			Some(PeerMessage::Pong { timestamp: 3 })
		);
	}
}
