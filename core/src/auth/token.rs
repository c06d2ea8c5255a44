use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const TOKEN_BYTES: usize = 32;
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

/// A paired device's credential, as persisted by the token store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
	pub token: String,
	pub device_id: String,
	pub device_name: String,
	pub user_id: String,
	pub created_at: DateTime<Utc>,
	#[serde(default)]
	pub last_used: Option<DateTime<Utc>>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
	#[serde(default = "default_active")]
	pub active: bool,
	#[serde(default)]
	pub connection_count: u64,
	#[serde(default)]
	pub last_connected_ip: Option<String>,
	#[serde(default)]
	pub revoked_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
	true
}

impl DeviceToken {
	/// Issues a fresh random token for a device.
	pub fn issue(
		device_id: impl Into<String>,
		device_name: impl Into<String>,
		user_id: impl Into<String>,
		expires_at: Option<DateTime<Utc>>,
	) -> Self {
		let mut bytes = [0u8; TOKEN_BYTES];
		rand::thread_rng().fill_bytes(&mut bytes);

		Self {
			token: hex::encode(bytes),
			device_id: device_id.into(),
			device_name: device_name.into(),
			user_id: user_id.into(),
			created_at: Utc::now(),
			last_used: None,
			expires_at,
			active: true,
			connection_count: 0,
			last_connected_ip: None,
			revoked_at: None,
		}
	}

	pub fn is_revoked(&self) -> bool {
		!self.active || self.revoked_at.is_some()
	}

	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.is_some_and(|expires_at| expires_at <= now)
	}
}

/// Tokens are exactly 64 lowercase hex characters.
pub fn is_well_formed(token: &str) -> bool {
	token.len() == TOKEN_LEN
		&& token
			.bytes()
			.all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
	use super::*;

	use chrono::Duration;

	#[test]
	fn issued_tokens_are_well_formed() {
		let token = DeviceToken::issue("dev", "Phone", "user", None);
		assert!(is_well_formed(&token.token));
		assert!(!token.is_revoked());
		assert!(!token.is_expired(Utc::now()));
	}

	#[test]
	fn format_check() {
		assert!(is_well_formed(&"0a".repeat(32)));
		assert!(!is_well_formed(&"0a".repeat(31)));
		assert!(!is_well_formed(&"0A".repeat(32)));
		assert!(!is_well_formed(&"zz".repeat(32)));
		assert!(!is_well_formed(""));
	}

	#[test]
	fn expiry_and_revocation() {
		let mut token = DeviceToken::issue("dev", "Phone", "user", Some(Utc::now() - Duration::seconds(1)));
		assert!(token.is_expired(Utc::now()));

		token.revoked_at = Some(Utc::now());
		assert!(token.is_revoked());
	}

	#[test]
	fn missing_optional_fields_get_defaults() {
		let token: DeviceToken = serde_json::from_str(&format!(
			r#"{{"token":"{}","deviceId":"d","deviceName":"n","userId":"u","createdAt":"2024-01-01T00:00:00Z"}}"#,
			"b".repeat(64)
		))
		.unwrap();

		assert!(token.active);
		assert_eq!(token.connection_count, 0);
		assert!(token.expires_at.is_none());
	}
}
