//! Node configuration, persisted as TOML in the data directory

use crate::{
	auth::{DEFAULT_CACHE_TTL, DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW, TOKEN_STORE_FILE_NAME},
	cache::RENDITION_CACHE_DIR_NAME,
	protocol::DEFAULT_MAX_BATCH_SIZE,
};

use ps_utils::error::FileIOError;

use std::{
	fs,
	net::{Ipv4Addr, SocketAddr},
	path::{Path, PathBuf},
	time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "photostream.toml";
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("could not determine a data directory for this platform")]
	NoDataDir,
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("invalid configuration in {}: {source}", .path.display())]
	Parse {
		path: PathBuf,
		source: toml::de::Error,
	},
	#[error("failed to serialize configuration: {0}")]
	Serialize(#[from] toml::ser::Error),
}

/// Platform specific data directory
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
	ProjectDirs::from("", "", "photostream")
		.map(|dirs| dirs.data_local_dir().to_path_buf())
		.ok_or(ConfigError::NoDataDir)
}

/// Main node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
	/// Where the photos come from
	pub library: LibraryConfig,

	/// Authenticated streaming channel
	pub streaming: StreamingConfig,

	/// Device tokens and rate limiting
	pub auth: AuthConfig,

	/// Rendition cache
	pub cache: CacheConfig,

	/// Peer to peer channel
	pub p2p: P2pConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
	/// Directories scanned for photos
	pub roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
	pub bind: SocketAddr,

	/// Most photo ids a single batch request may carry
	pub max_batch_size: usize,

	/// Originals batches report progress every this many completed photos
	pub progress_interval: usize,

	/// Seconds between transport level pings
	pub transport_ping_secs: u64,
}

impl Default for StreamingConfig {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
			max_batch_size: DEFAULT_MAX_BATCH_SIZE,
			progress_interval: 10,
			transport_ping_secs: 30,
		}
	}
}

impl StreamingConfig {
	pub fn transport_ping(&self) -> Duration {
		Duration::from_secs(self.transport_ping_secs.max(1))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
	/// Token store file, defaults to `device_tokens.json` in the data directory
	pub token_store: Option<PathBuf>,

	/// How long a read of the token store is trusted, also the revocation check period
	pub cache_ttl_secs: u64,

	pub rate_limit_window_secs: u64,

	pub rate_limit_max_attempts: usize,
}

impl Default for AuthConfig {
	fn default() -> Self {
		Self {
			token_store: None,
			cache_ttl_secs: DEFAULT_CACHE_TTL.as_secs(),
			rate_limit_window_secs: DEFAULT_WINDOW.as_secs(),
			rate_limit_max_attempts: DEFAULT_MAX_ATTEMPTS,
		}
	}
}

impl AuthConfig {
	pub fn cache_ttl(&self) -> Duration {
		Duration::from_secs(self.cache_ttl_secs.max(1))
	}

	pub fn rate_limit_window(&self) -> Duration {
		Duration::from_secs(self.rate_limit_window_secs.max(1))
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	/// Rendition directory, defaults to `renditions` in the data directory
	pub dir: Option<PathBuf>,
}

/// Settings of [`crate::p2p::P2pManager`].
///
/// They only take effect through [`crate::Node::start_p2p`], which needs a signaling relay and
/// a data link transport from the embedding application. `ps-server` ships neither: it reads
/// `room_id` for its `room` command and otherwise ignores this section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
	/// Whether the embedding application should start P2P, nothing starts it on its own
	pub enabled: bool,

	/// Rendezvous id, generated and kept in the data directory when absent
	pub room_id: Option<String>,

	/// Seconds between keepalives on the signaling relay connection
	pub keepalive_secs: u64,

	/// Seconds between data channel pings to each peer
	pub heartbeat_secs: u64,

	/// Round trips above this many milliseconds are logged as high latency
	pub latency_warning_ms: u64,

	/// Bytes per binary chunk sent over a data link
	pub chunk_size: usize,

	/// Milliseconds to wait between two chunks
	pub pacing_ms: u64,

	/// Longest wait between two relay reconnection attempts
	pub reconnect_max_secs: u64,
}

impl Default for P2pConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			room_id: None,
			keepalive_secs: 25,
			heartbeat_secs: 5,
			latency_warning_ms: 1000,
			chunk_size: 16 * 1024,
			pacing_ms: 2,
			reconnect_max_secs: 30,
		}
	}
}

impl P2pConfig {
	pub fn keepalive(&self) -> Duration {
		Duration::from_secs(self.keepalive_secs.max(1))
	}

	pub fn heartbeat(&self) -> Duration {
		Duration::from_secs(self.heartbeat_secs.max(1))
	}

	pub fn latency_warning(&self) -> Duration {
		Duration::from_millis(self.latency_warning_ms)
	}

	pub fn pacing(&self) -> Duration {
		Duration::from_millis(self.pacing_ms)
	}

	pub fn reconnect_max(&self) -> Duration {
		Duration::from_secs(self.reconnect_max_secs.max(1))
	}
}

impl NodeConfig {
	/// Load configuration from a specific file
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();

		info!(path = %path.display(), "Loading config;");

		let text = fs::read_to_string(path).map_err(|e| FileIOError::from((path, e)))?;

		toml::from_str(&text).map_err(|source| ConfigError::Parse {
			path: path.to_path_buf(),
			source,
		})
	}

	/// Load the configuration of a data directory, writing the defaults when there is none yet
	pub fn load_or_create(data_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = data_dir.as_ref().join(CONFIG_FILE_NAME);

		if path.exists() {
			Self::load_from(&path)
		} else {
			warn!(path = %path.display(), "No config found, creating default;");
			let config = Self::default();
			config.save(&path)?;
			Ok(config)
		}
	}

	/// Save configuration to disk
	pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
		let path = path.as_ref();

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(|e| FileIOError::from((parent, e)))?;
		}

		fs::write(path, toml::to_string_pretty(self)?).map_err(|e| FileIOError::from((path, e)))?;

		info!(path = %path.display(), "Saved config;");

		Ok(())
	}

	pub fn token_store_path(&self, data_dir: &Path) -> PathBuf {
		self.auth
			.token_store
			.clone()
			.unwrap_or_else(|| data_dir.join(TOKEN_STORE_FILE_NAME))
	}

	pub fn cache_dir(&self, data_dir: &Path) -> PathBuf {
		self.cache
			.dir
			.clone()
			.unwrap_or_else(|| data_dir.join(RENDITION_CACHE_DIR_NAME))
	}

	/// Get the path for logs directory
	pub fn logs_dir(data_dir: &Path) -> PathBuf {
		data_dir.join("logs")
	}
}
