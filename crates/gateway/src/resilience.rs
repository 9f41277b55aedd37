//! The cross-cutting wrapper applied uniformly to the roles-service call and
//! the external policy call: timeout, retry-with-backoff, circuit breaker,
//! fallback — as a single combinator instead of scattering the same
//! boilerplate at each call site. Per the design note on annotations → an
//! explicit policy wrapper.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
	pub volume_threshold: u32,
	pub failure_ratio: f64,
	pub open_duration: Duration,
}

impl BreakerConfig {
	/// Matches the thresholds spec.md names for both RolesEnricher and
	/// PolicyEngine: 10-call volume window, 50% failure ratio, 10s open.
	pub fn standard() -> Self {
		Self {
			volume_threshold: 10,
			failure_ratio: 0.5,
			open_duration: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
	pub attempts: u32,
	pub base_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ResilienceConfig {
	pub timeout: Duration,
	pub retry: RetryConfig,
	pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
	Closed,
	Open,
	HalfOpen,
}

struct BreakerInner {
	state: State,
	opened_at: Option<Instant>,
	window: VecDeque<bool>,
	half_open_probe_in_flight: bool,
}

/// A sliding-window failure-ratio breaker: once `volume_threshold` calls
/// have landed in the window and the failure ratio exceeds `failure_ratio`,
/// it opens for `open_duration`; one probe call is let through afterward
/// to decide whether to close again.
pub struct CircuitBreaker {
	cfg: BreakerConfig,
	inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
	pub fn new(cfg: BreakerConfig) -> Self {
		Self {
			cfg,
			inner: Mutex::new(BreakerInner {
				state: State::Closed,
				opened_at: None,
				window: VecDeque::with_capacity(cfg.volume_threshold as usize * 2),
				half_open_probe_in_flight: false,
			}),
		}
	}

	/// Returns `true` if a call may proceed. Transitions Open → HalfOpen once
	/// `open_duration` has elapsed, admitting exactly one probe call.
	fn allow(&self) -> bool {
		let mut inner = self.inner.lock();
		match inner.state {
			State::Closed => true,
			State::HalfOpen => !inner.half_open_probe_in_flight && {
				inner.half_open_probe_in_flight = true;
				true
			},
			State::Open => {
				let Some(opened_at) = inner.opened_at else { return true };
				if opened_at.elapsed() >= self.cfg.open_duration {
					inner.state = State::HalfOpen;
					inner.half_open_probe_in_flight = true;
					true
				} else {
					false
				}
			},
		}
	}

	fn record(&self, success: bool) {
		let mut inner = self.inner.lock();
		match inner.state {
			State::HalfOpen => {
				inner.half_open_probe_in_flight = false;
				if success {
					inner.state = State::Closed;
					inner.window.clear();
					info!("circuit breaker closed after successful probe");
				} else {
					inner.state = State::Open;
					inner.opened_at = Some(Instant::now());
					warn!("circuit breaker probe failed, reopening");
				}
			},
			State::Closed => {
				inner.window.push_back(success);
				if inner.window.len() > self.cfg.volume_threshold as usize {
					inner.window.pop_front();
				}
				if inner.window.len() >= self.cfg.volume_threshold as usize {
					let failures = inner.window.iter().filter(|s| !**s).count();
					let ratio = failures as f64 / inner.window.len() as f64;
					if ratio > self.cfg.failure_ratio {
						inner.state = State::Open;
						inner.opened_at = Some(Instant::now());
						warn!(ratio, "circuit breaker opened");
					}
				}
			},
			State::Open => {},
		}
	}
}

#[derive(Debug)]
pub enum ResilienceOutcome<E> {
	BreakerOpen,
	TimedOut,
	Failed(E),
}

/// Runs `f` under (breaker, retry, timeout); `f` is called fresh on each
/// attempt since most failures are not safely retryable on the same future.
/// On breaker-open or retry exhaustion, returns the outcome for the caller
/// to turn into its fallback value — this function never decides the
/// fallback itself, since that value differs per call site.
pub async fn call<F, Fut, T, E>(breaker: &CircuitBreaker, cfg: &ResilienceConfig, mut f: F) -> Result<T, ResilienceOutcome<E>>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	if !breaker.allow() {
		return Err(ResilienceOutcome::BreakerOpen);
	}

	let mut last_err = None;
	for attempt in 0..=cfg.retry.attempts {
		match tokio::time::timeout(cfg.timeout, f()).await {
			Ok(Ok(v)) => {
				breaker.record(true);
				return Ok(v);
			},
			Ok(Err(e)) => {
				last_err = Some(ResilienceOutcome::Failed(e));
			},
			Err(_elapsed) => {
				last_err = Some(ResilienceOutcome::TimedOut);
			},
		}
		if attempt < cfg.retry.attempts {
			tokio::time::sleep(cfg.retry.base_delay * (attempt + 1)).await;
		}
	}
	breaker.record(false);
	Err(last_err.unwrap_or(ResilienceOutcome::TimedOut))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn cfg() -> ResilienceConfig {
		ResilienceConfig {
			timeout: Duration::from_millis(50),
			retry: RetryConfig {
				attempts: 1,
				base_delay: Duration::from_millis(1),
			},
			breaker: BreakerConfig {
				volume_threshold: 4,
				failure_ratio: 0.5,
				open_duration: Duration::from_millis(50),
			},
		}
	}

	#[tokio::test]
	async fn succeeds_without_retry() {
		let breaker = CircuitBreaker::new(cfg().breaker);
		let r: Result<i32, ResilienceOutcome<&str>> = call(&breaker, &cfg(), || async { Ok(1) }).await;
		assert_eq!(r.unwrap(), 1);
	}

	#[tokio::test]
	async fn retries_then_succeeds() {
		let breaker = CircuitBreaker::new(cfg().breaker);
		let attempts = AtomicU32::new(0);
		let r: Result<i32, ResilienceOutcome<&str>> = call(&breaker, &cfg(), || {
			let n = attempts.fetch_add(1, Ordering::SeqCst);
			async move { if n == 0 { Err("boom") } else { Ok(7) } }
		})
		.await;
		assert_eq!(r.unwrap(), 7);
	}

	#[tokio::test]
	async fn breaker_opens_after_volume_threshold_failures() {
		let breaker = CircuitBreaker::new(cfg().breaker);
		for _ in 0..4 {
			let _: Result<i32, ResilienceOutcome<&str>> = call(&breaker, &cfg(), || async { Err("boom") }).await;
		}
		let r: Result<i32, ResilienceOutcome<&str>> = call(&breaker, &cfg(), || async { Ok(1) }).await;
		assert!(matches!(r, Err(ResilienceOutcome::BreakerOpen)));
	}
}
