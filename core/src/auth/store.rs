use super::DeviceToken;

use ps_utils::error::FileIOError;

use std::{
	io,
	net::IpAddr,
	path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info};
use uuid::Uuid;

pub const TOKEN_STORE_FILE_NAME: &str = "device_tokens.json";

#[derive(Error, Debug)]
pub enum TokenStoreError {
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("malformed token store at {}: {source}", .path.display())]
	Malformed {
		path: PathBuf,
		source: serde_json::Error,
	},
	#[error("failed to serialize token store: {0}")]
	Serialize(#[from] serde_json::Error),
}

/// Where device tokens are persisted, written by pairing and administration, read by the core.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
	async fn load(&self) -> Result<Vec<DeviceToken>, TokenStoreError>;

	/// Bookkeeping after a successful authentication.
	async fn record_connection(
		&self,
		token: &str,
		ip: IpAddr,
		at: DateTime<Utc>,
	) -> Result<(), TokenStoreError>;

	/// File to watch for changes, stores without one are only polled.
	fn watch_path(&self) -> Option<&Path> {
		None
	}
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
	#[serde(default)]
	tokens: Vec<DeviceToken>,
}

/// Tokens kept as `{"tokens": [...]}` in a single JSON file.
#[derive(Debug)]
pub struct JsonTokenStore {
	path: PathBuf,
	write_lock: Mutex<()>,
}

impl JsonTokenStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			write_lock: Mutex::new(()),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	async fn read_file(&self) -> Result<TokenFile, TokenStoreError> {
		match fs::read(&self.path).await {
			Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Ok(TokenFile::default()),
			Ok(data) => {
				serde_json::from_slice(&data).map_err(|source| TokenStoreError::Malformed {
					path: self.path.clone(),
					source,
				})
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(TokenFile::default()),
			Err(e) => Err(FileIOError::from((&self.path, e)).into()),
		}
	}

	async fn write_file(&self, file: &TokenFile) -> Result<(), TokenStoreError> {
		let data = serde_json::to_vec_pretty(file)?;

		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)
				.await
				.map_err(|e| FileIOError::from((parent, e)))?;
		}

		let tmp_path = self
			.path
			.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

		fs::write(&tmp_path, data)
			.await
			.map_err(|e| FileIOError::from((&tmp_path, e)))?;

		if let Err(e) = fs::rename(&tmp_path, &self.path).await {
			fs::remove_file(&tmp_path).await.ok();
			return Err(FileIOError::from((&self.path, e)).into());
		}

		Ok(())
	}

	async fn update<T>(
		&self,
		f: impl FnOnce(&mut Vec<DeviceToken>) -> T + Send,
	) -> Result<T, TokenStoreError> {
		let _guard = self.write_lock.lock().await;

		let mut file = self.read_file().await?;
		let out = f(&mut file.tokens);
		self.write_file(&file).await?;

		Ok(out)
	}

	pub async fn insert(&self, token: DeviceToken) -> Result<(), TokenStoreError> {
		let device_id = token.device_id.clone();
		self.update(move |tokens| tokens.push(token)).await?;

		info!(%device_id, "Device token stored;");

		Ok(())
	}

	/// Revokes every token matching `token_or_device`, either the token itself or its device id.
	pub async fn revoke(&self, token_or_device: &str) -> Result<usize, TokenStoreError> {
		let now = Utc::now();

		let revoked = self
			.update(|tokens| {
				tokens
					.iter_mut()
					.filter(|t| {
						(t.token == token_or_device || t.device_id == token_or_device)
							&& !t.is_revoked()
					})
					.map(|t| {
						t.active = false;
						t.revoked_at = Some(now);
					})
					.count()
			})
			.await?;

		info!(revoked, "Device tokens revoked;");

		Ok(revoked)
	}
}

#[async_trait]
impl TokenStore for JsonTokenStore {
	async fn load(&self) -> Result<Vec<DeviceToken>, TokenStoreError> {
		self.read_file().await.map(|file| file.tokens)
	}

	async fn record_connection(
		&self,
		token: &str,
		ip: IpAddr,
		at: DateTime<Utc>,
	) -> Result<(), TokenStoreError> {
		let found = self
			.update(|tokens| {
				tokens
					.iter_mut()
					.find(|t| t.token == token)
					.map(|t| {
						t.last_used = Some(at);
						t.connection_count += 1;
						t.last_connected_ip = Some(ip.to_string());
					})
					.is_some()
			})
			.await?;

		if !found {
			debug!("Token vanished before its connection could be recorded;");
		}

		Ok(())
	}

	fn watch_path(&self) -> Option<&Path> {
		Some(&self.path)
	}
}
