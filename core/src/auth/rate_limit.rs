use std::{
	collections::{HashMap, VecDeque},
	net::IpAddr,
	sync::Mutex,
	time::Duration,
};

use tokio::time::Instant;

pub const DEFAULT_MAX_ATTEMPTS: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Sliding window of authentication attempts per source address.
#[derive(Debug)]
pub struct RateLimiter {
	max_attempts: usize,
	window: Duration,
	attempts: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_WINDOW)
	}
}

impl RateLimiter {
	pub fn new(max_attempts: usize, window: Duration) -> Self {
		Self {
			max_attempts,
			window,
			attempts: Mutex::default(),
		}
	}

	/// Records an attempt from `source`, or returns how many seconds to wait before the next one
	/// is allowed. Rejected attempts don't extend the wait.
	pub fn check(&self, source: IpAddr) -> Result<(), u64> {
		let now = Instant::now();
		let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());

		// Forget addresses that went quiet so the map doesn't grow forever
		attempts.retain(|_, seen| {
			while seen
				.front()
				.is_some_and(|at| now.duration_since(*at) >= self.window)
			{
				seen.pop_front();
			}
			!seen.is_empty()
		});

		let seen = attempts.entry(source).or_default();

		if seen.len() >= self.max_attempts {
			let retry_after = seen
				.front()
				.map(|oldest| (*oldest + self.window).saturating_duration_since(now))
				.unwrap_or(self.window);

			return Err(retry_after.as_secs_f64().ceil().max(1.0) as u64);
		}

		seen.push_back(now);

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::net::Ipv4Addr;

	#[tokio::test(start_paused = true)]
	async fn blocks_after_max_attempts_until_the_window_slides() {
		let limiter = RateLimiter::new(3, Duration::from_secs(60));
		let a = IpAddr::from(Ipv4Addr::new(10, 0, 0, 1));
		let b = IpAddr::from(Ipv4Addr::new(10, 0, 0, 2));

		for _ in 0..3 {
			assert!(limiter.check(a).is_ok());
			tokio::time::advance(Duration::from_secs(10)).await;
		}

		let retry_after = limiter.check(a).unwrap_err();
		assert_eq!(retry_after, 30);
		assert!(limiter.check(b).is_ok());

		tokio::time::advance(Duration::from_secs(30)).await;
		assert!(limiter.check(a).is_ok());
	}

	#[tokio::test(start_paused = true)]
	async fn retry_after_is_at_least_one_second() {
		let limiter = RateLimiter::new(1, Duration::from_secs(60));
		let a = IpAddr::from(Ipv4Addr::LOCALHOST);

		assert!(limiter.check(a).is_ok());
		tokio::time::advance(Duration::from_millis(59_900)).await;
		assert_eq!(limiter.check(a), Err(1));
	}
}
