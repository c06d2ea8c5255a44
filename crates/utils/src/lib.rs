pub mod error;

/// Milliseconds since the unix epoch for `time`, saturating on clocks set before 1970.
pub fn unix_millis(time: std::time::SystemTime) -> u64 {
	time.duration_since(std::time::UNIX_EPOCH)
		.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
		.unwrap_or_default()
}
