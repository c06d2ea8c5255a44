use super::P2pError;

use ps_utils::error::FileIOError;

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

pub const ROOM_FILE_NAME: &str = "p2p_room";

const ROOM_ID_LEN: usize = 16;

/// Rendezvous this host waits in on the signaling relay, stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
	pub fn generate() -> Self {
		Self(hex::encode(rand::random::<[u8; ROOM_ID_LEN / 2]>()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Uses the configured id when there is one, otherwise the one kept in `data_dir`, creating
	/// it on first use.
	pub async fn load_or_create(configured: Option<&str>, data_dir: &Path) -> Result<Self, P2pError> {
		if let Some(configured) = configured {
			return configured.parse();
		}

		let path = data_dir.join(ROOM_FILE_NAME);

		match fs::read_to_string(&path).await {
			Ok(stored) => match stored.trim().parse() {
				Ok(room) => return Ok(room),
				Err(e) => warn!(?e, path = %path.display(), "Stored room id is invalid, replacing it;"),
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(FileIOError::from((&path, e)).into()),
		}

		let room = Self::generate();

		fs::create_dir_all(data_dir)
			.await
			.map_err(|e| FileIOError::from((data_dir, e)))?;
		fs::write(&path, room.as_str())
			.await
			.map_err(|e| FileIOError::from((&path, e)))?;

		info!(%room, "Created rendezvous room;");

		Ok(room)
	}
}

impl FromStr for RoomId {
	type Err = P2pError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.len() == ROOM_ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
			Ok(Self(s.to_string()))
		} else {
			Err(P2pError::InvalidRoomId(s.to_string()))
		}
	}
}

impl TryFrom<String> for RoomId {
	type Error = P2pError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		s.parse()
	}
}

impl From<RoomId> for String {
	fn from(room: RoomId) -> Self {
		room.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use tempfile::tempdir;

	#[tokio::test]
	async fn room_is_created_once_and_kept() {
		let dir = tempdir().unwrap();
		let data_dir = dir.path().join("data");

		let first = RoomId::load_or_create(None, &data_dir).await.unwrap();
		assert_eq!(first.as_str().len(), 16);

		let second = RoomId::load_or_create(None, &data_dir).await.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn configured_rooms_win_and_are_validated() {
		let dir = tempdir().unwrap();

		let room = RoomId::load_or_create(Some("0123456789abcdef"), dir.path())
			.await
			.unwrap();
		assert_eq!(room.as_str(), "0123456789abcdef");
		assert!(!dir.path().join(ROOM_FILE_NAME).exists());

		assert!(matches!(
			RoomId::load_or_create(Some("0123456789ABCDEF"), dir.path()).await,
			Err(P2pError::InvalidRoomId(_))
		));
	}

	#[tokio::test]
	async fn garbage_on_disk_is_replaced() {
		let dir = tempdir().unwrap();
		std::fs::write(dir.path().join(ROOM_FILE_NAME), "nope").unwrap();

		let room = RoomId::load_or_create(None, dir.path()).await.unwrap();
		assert_eq!(
			std::fs::read_to_string(dir.path().join(ROOM_FILE_NAME)).unwrap(),
			room.as_str()
		);
	}
}
