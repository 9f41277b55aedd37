//! Per-key token-bucket rate limiting. Keyed on the authenticated principal
//! when auth has already run for this request, else on client IP (§4.8/4.10).
//!
//! Per the design notes' third open question, "clear the whole map every 5
//! minutes" is documented as a placeholder for an LRU-with-TTL; this
//! implementation ships that replacement directly rather than carrying the
//! placeholder forward: `moka::sync::Cache` bounded at `max_buckets` with
//! idle-eviction gives the same interface (a bounded concurrent map) with
//! proper per-key fairness instead of a periodic blanket reset. See
//! DESIGN.md.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use parking_lot::Mutex;

use crate::config::RateLimitConfig;

struct TokenBucket {
	tokens: f64,
	last_refill: Instant,
}

impl TokenBucket {
	fn new(burst_size: u32) -> Self {
		Self {
			tokens: burst_size as f64,
			last_refill: Instant::now(),
		}
	}

	/// Greedy continuous refill, then tries to take one token.
	fn try_acquire(&mut self, rate_per_sec: f64, burst_size: u32) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.last_refill = now;
		self.tokens = (self.tokens + elapsed * rate_per_sec).min(burst_size as f64);
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	/// Seconds until at least one token will be available, for `Retry-After`.
	fn retry_after_secs(&self, rate_per_sec: f64) -> u64 {
		if rate_per_sec <= 0.0 {
			return 1;
		}
		let deficit = 1.0 - self.tokens;
		((deficit / rate_per_sec).ceil() as u64).max(1)
	}
}

pub enum RateLimitOutcome {
	Admitted,
	Rejected { retry_after_secs: u64 },
}

pub struct RateLimiter {
	enabled: bool,
	requests_per_second: f64,
	burst_size: u32,
	max_buckets: usize,
	buckets: Cache<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
	pub fn new(cfg: &RateLimitConfig) -> Self {
		Self {
			enabled: cfg.enabled,
			requests_per_second: cfg.requests_per_second,
			burst_size: cfg.burst_size,
			max_buckets: cfg.max_buckets,
			buckets: Cache::builder()
				.max_capacity(cfg.max_buckets as u64)
				.time_to_idle(cfg.sweep_interval)
				.build(),
		}
	}

	pub fn check(&self, key: &str) -> RateLimitOutcome {
		if !self.enabled {
			return RateLimitOutcome::Admitted;
		}

		if self.buckets.entry_count() as usize >= self.max_buckets && self.buckets.get(key).is_none() {
			return RateLimitOutcome::Rejected { retry_after_secs: 1 };
		}

		let bucket = self
			.buckets
			.get_with(key.to_string(), || Arc::new(Mutex::new(TokenBucket::new(self.burst_size))));

		let mut guard = bucket.lock();
		if guard.try_acquire(self.requests_per_second, self.burst_size) {
			RateLimitOutcome::Admitted
		} else {
			RateLimitOutcome::Rejected {
				retry_after_secs: guard.retry_after_secs(self.requests_per_second),
			}
		}
	}
}

/// Client IP resolution precedence: `X-Forwarded-For` first element →
/// `X-Real-IP` → transport remote address → `"unknown"`.
pub fn resolve_client_ip(forwarded_for: Option<&str>, real_ip: Option<&str>, remote_addr: Option<&str>) -> String {
	if let Some(xff) = forwarded_for {
		if let Some(first) = xff.split(',').next().map(str::trim).filter(|s| !s.is_empty()) {
			return first.to_string();
		}
	}
	if let Some(ip) = real_ip.filter(|s| !s.is_empty()) {
		return ip.to_string();
	}
	remote_addr.filter(|s| !s.is_empty()).unwrap_or("unknown").to_string()
}
