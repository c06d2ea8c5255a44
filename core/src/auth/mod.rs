//! Device token validation, rate limiting and live revocation.

mod authenticator;
mod rate_limit;
mod revocation;
mod store;
mod token;

pub use authenticator::{
	AuthRejection, Authenticator, DeviceClass, Handshake, SessionContext, DEFAULT_CACHE_TTL,
};
pub use rate_limit::{RateLimiter, DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW};
pub use revocation::{spawn_revocation_watch, sweep};
pub use store::{JsonTokenStore, TokenStore, TokenStoreError, TOKEN_STORE_FILE_NAME};
pub use token::{is_well_formed, DeviceToken, TOKEN_LEN};
