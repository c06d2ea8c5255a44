use super::{P2pError, RoomId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Link negotiation payload relayed verbatim between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Signal {
	Offer {
		sdp: String,
	},
	Answer {
		sdp: String,
	},
	Candidate {
		candidate: String,
		sdp_mid: Option<String>,
		sdp_m_line_index: Option<u16>,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCommand {
	Signal { to: String, signal: Signal },
	KeepAlive,
	Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
	ParticipantJoined(String),
	ParticipantLeft(String),
	Signal { from: String, signal: Signal },
}

/// A live membership in a room. The relay closing `events` means the connection is lost.
#[derive(Debug)]
pub struct RelayConnection {
	pub commands: mpsc::Sender<RelayCommand>,
	pub events: mpsc::Receiver<RelayEvent>,
}

#[async_trait]
pub trait SignalingRelay: Send + Sync + 'static {
	async fn connect(&self, room: &RoomId) -> Result<RelayConnection, P2pError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;

	#[test]
	fn candidates_use_browser_field_names() {
		let signal = Signal::Candidate {
			candidate: "candidate:1 1 UDP 2122252543 192.168.1.4 53211 typ host".to_string(),
			sdp_mid: Some("0".to_string()),
			sdp_m_line_index: Some(0),
		};

		assert_eq!(
			serde_json::to_value(&signal).unwrap(),
			json!({
				"type": "candidate",
				"candidate": "candidate:1 1 UDP 2122252543 192.168.1.4 53211 typ host",
				"sdpMid": "0",
				"sdpMLineIndex": 0
			})
		);
	}
}
