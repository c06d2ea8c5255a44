use super::{
	rate_limit::RateLimiter,
	store::{TokenStore, TokenStoreError},
	token::is_well_formed,
	DeviceToken,
};

use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
	#[error("token must be 64 lowercase hex characters")]
	InvalidFormat,
	#[error("unknown token")]
	TokenNotFound,
	#[error("token has been revoked")]
	TokenRevoked,
	#[error("token has expired")]
	TokenExpired,
	#[error("RateLimitExceeded:{retry_after_secs}")]
	RateLimitExceeded { retry_after_secs: u64 },
	#[error("token store unavailable: {0}")]
	Unavailable(String),
}

impl AuthRejection {
	pub fn code(&self) -> &'static str {
		match self {
			Self::InvalidFormat => "INVALID_FORMAT",
			Self::TokenNotFound => "TOKEN_NOT_FOUND",
			Self::TokenRevoked => "TOKEN_REVOKED",
			Self::TokenExpired => "TOKEN_EXPIRED",
			Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
			Self::Unavailable(_) => "AUTH_UNAVAILABLE",
		}
	}

	pub fn retry_after(&self) -> Option<u64> {
		match self {
			Self::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
			_ => None,
		}
	}
}

impl From<TokenStoreError> for AuthRejection {
	fn from(e: TokenStoreError) -> Self {
		Self::Unavailable(e.to_string())
	}
}

/// Credentials and declared identity a client presents when connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
	pub token: Option<String>,
	pub device_name: Option<String>,
	pub device_version: Option<String>,
	pub user_agent: Option<String>,
}

/// Hints about the client, only used in logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClass {
	pub is_ios: bool,
	pub is_android: bool,
	pub is_mobile: bool,
	pub is_desktop: bool,
}

impl DeviceClass {
	pub fn detect(declared: &str) -> Self {
		let declared = declared.to_ascii_lowercase();
		let has = |needles: &[&str]| needles.iter().any(|needle| declared.contains(needle));

		let is_ios = has(&["iphone", "ipad", "ipod", "ios"]);
		let is_android = has(&["android"]);
		let is_mobile = is_ios || is_android || has(&["mobile", "phone", "tablet"]);
		let is_desktop = !is_mobile && has(&["windows", "macintosh", "mac os", "linux", "desktop"]);

		Self {
			is_ios,
			is_android,
			is_mobile,
			is_desktop,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
	pub token: String,
	pub user_id: String,
	pub device_id: String,
	pub device_name: String,
	pub device_version: Option<String>,
	pub expires_at: Option<DateTime<Utc>>,
	pub device_class: DeviceClass,
}

#[derive(Debug)]
struct CachedTokens {
	loaded_at: Instant,
	tokens: Arc<HashMap<String, DeviceToken>>,
}

/// Validates bearer tokens against a short lived cached view of the token store.
pub struct Authenticator {
	store: Arc<dyn TokenStore>,
	limiter: RateLimiter,
	cache_ttl: Duration,
	cache: Mutex<Option<CachedTokens>>,
}

impl Authenticator {
	pub fn new(store: Arc<dyn TokenStore>, limiter: RateLimiter, cache_ttl: Duration) -> Self {
		Self {
			store,
			limiter,
			cache_ttl,
			cache: Mutex::new(None),
		}
	}

	pub fn store(&self) -> &Arc<dyn TokenStore> {
		&self.store
	}

	pub fn cache_ttl(&self) -> Duration {
		self.cache_ttl
	}

	#[instrument(skip(self, handshake), fields(device_name = ?handshake.device_name))]
	pub async fn authenticate(
		&self,
		handshake: &Handshake,
		source: IpAddr,
	) -> Result<SessionContext, AuthRejection> {
		if let Err(retry_after_secs) = self.limiter.check(source) {
			warn!(%source, retry_after_secs, "Authentication rate limited;");
			return Err(AuthRejection::RateLimitExceeded { retry_after_secs });
		}

		let token = handshake.token.as_deref().unwrap_or_default();
		let device = self.validate_token(token).await.inspect_err(|reason| {
			info!(%source, code = reason.code(), "Authentication rejected;");
		})?;

		if let Err(e) = self
			.store
			.record_connection(&device.token, source, Utc::now())
			.await
		{
			// The token checked out, failing the bookkeeping shouldn't lock the device out
			warn!(?e, device_id = %device.device_id, "Failed to record connection;");
		}

		let declared = [
			handshake.device_name.as_deref(),
			handshake.user_agent.as_deref(),
		]
		.into_iter()
		.flatten()
		.collect::<Vec<_>>()
		.join(" ");

		let context = SessionContext {
			token: device.token,
			user_id: device.user_id,
			device_id: device.device_id,
			device_name: handshake
				.device_name
				.clone()
				.unwrap_or(device.device_name),
			device_version: handshake.device_version.clone(),
			expires_at: device.expires_at,
			device_class: DeviceClass::detect(&declared),
		};

		info!(
			%source,
			device_id = %context.device_id,
			user_id = %context.user_id,
			device_class = ?context.device_class,
			"Device authenticated;"
		);

		Ok(context)
	}

	/// Checks a token in priority order: format, existence, revocation and then expiry.
	pub async fn validate_token(&self, token: &str) -> Result<DeviceToken, AuthRejection> {
		if !is_well_formed(token) {
			return Err(AuthRejection::InvalidFormat);
		}

		let tokens = self.tokens().await?;
		let device = tokens.get(token).ok_or(AuthRejection::TokenNotFound)?;

		if device.is_revoked() {
			return Err(AuthRejection::TokenRevoked);
		}

		if device.is_expired(Utc::now()) {
			return Err(AuthRejection::TokenExpired);
		}

		Ok(device.clone())
	}

	pub async fn invalidate_cache(&self) {
		self.cache.lock().await.take();
	}

	async fn tokens(&self) -> Result<Arc<HashMap<String, DeviceToken>>, AuthRejection> {
		let mut cache = self.cache.lock().await;

		if let Some(cached) = &*cache {
			if cached.loaded_at.elapsed() < self.cache_ttl {
				return Ok(Arc::clone(&cached.tokens));
			}
		}

		let tokens = Arc::new(
			self.store
				.load()
				.await?
				.into_iter()
				.map(|t| (t.token.clone(), t))
				.collect::<HashMap<_, _>>(),
		);

		debug!(count = tokens.len(), "Token cache refreshed;");

		*cache = Some(CachedTokens {
			loaded_at: Instant::now(),
			tokens: Arc::clone(&tokens),
		});

		Ok(tokens)
	}
}
