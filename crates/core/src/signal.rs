//! Shutdown coordination: a [`ShutdownTrigger`] that fires on SIGTERM/SIGINT
//! or an admin-initiated request, and a [`DrainWatcher`]/[`DrainGuard`] pair
//! that lets in-flight work delay process exit up to a grace window.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};

#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: Arc<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct ShutdownWatcher {
	rx: watch::Receiver<bool>,
}

pub fn new_shutdown() -> (ShutdownTrigger, ShutdownWatcher) {
	let (tx, rx) = watch::channel(false);
	(
		ShutdownTrigger { tx: Arc::new(tx) },
		ShutdownWatcher { rx },
	)
}

impl ShutdownTrigger {
	/// Request shutdown and wait for it to be observed. Callers on the admin
	/// path (`/quitquitquit`) await this directly; the process-level signal
	/// handler below fires it from a Unix signal.
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(true);
	}
}

impl ShutdownWatcher {
	pub async fn signaled(&mut self) {
		// Already shut down: return immediately instead of waiting for a
		// future edge that will never come.
		if *self.rx.borrow() {
			return;
		}
		let _ = self.rx.changed().await;
	}
}

/// Spawns a task that resolves `trigger` on SIGTERM or SIGINT (Ctrl-C).
pub fn shutdown_on_signal(trigger: ShutdownTrigger) {
	tokio::spawn(async move {
		let ctrl_c = tokio::signal::ctrl_c();
		#[cfg(unix)]
		{
			let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
				.expect("failed to install SIGTERM handler");
			tokio::select! {
				_ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
				_ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
			}
		}
		#[cfg(not(unix))]
		{
			let _ = ctrl_c.await;
			tracing::info!("received ctrl-c, shutting down");
		}
		trigger.shutdown_now().await;
	});
}

/// Tracks the number of in-flight requests so shutdown can wait for them to
/// drain (up to a grace window) instead of severing connections mid-response.
#[derive(Clone)]
pub struct DrainWatcher {
	sem: Arc<Semaphore>,
}

pub struct DrainGuard {
	_permit: tokio::sync::OwnedSemaphorePermit,
}

// `Semaphore::MAX_PERMITS` (~2^61) doesn't fit `u32`, and `acquire_many_owned`
// takes a `u32` count; truncating it would make `drain()` return immediately
// regardless of in-flight count. A bounded cap far above any real concurrency
// keeps both the initial capacity and the "acquire them all" call in range.
const MAX_IN_FLIGHT: u32 = 1 << 20;

impl DrainWatcher {
	pub fn new() -> Self {
		Self {
			sem: Arc::new(Semaphore::new(MAX_IN_FLIGHT as usize)),
		}
	}

	/// Registers one in-flight request; dropping the guard releases it.
	pub fn enter(&self) -> DrainGuard {
		let permit = self
			.sem
			.clone()
			.try_acquire_owned()
			.expect("in-flight permit pool exhausted");
		DrainGuard { _permit: permit }
	}

	/// Waits until every outstanding [`DrainGuard`] has been dropped, or
	/// `grace` elapses, whichever comes first.
	pub async fn drain(&self, grace: Duration) {
		let wait_all = self.sem.clone().acquire_many_owned(MAX_IN_FLIGHT);
		if tokio::time::timeout(grace, wait_all).await.is_err() {
			tracing::warn!(?grace, "drain grace period elapsed with requests still in flight");
		}
	}
}

impl Default for DrainWatcher {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn drain_returns_immediately_with_no_in_flight_guards() {
		let watcher = DrainWatcher::new();
		let started = tokio::time::Instant::now();
		watcher.drain(Duration::from_millis(200)).await;
		assert!(started.elapsed() < Duration::from_millis(100));
	}

	#[tokio::test]
	async fn drain_waits_for_outstanding_guard_to_drop() {
		let watcher = DrainWatcher::new();
		let guard = watcher.enter();
		let watcher2 = watcher.clone();
		let drain_task = tokio::spawn(async move { watcher2.drain(Duration::from_secs(5)).await });

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(!drain_task.is_finished());

		drop(guard);
		tokio::time::timeout(Duration::from_secs(1), drain_task).await.expect("drain task should finish shortly after guard drops").unwrap();
	}

	#[tokio::test]
	async fn drain_times_out_if_guard_never_drops() {
		let watcher = DrainWatcher::new();
		let _guard = watcher.enter();
		let started = tokio::time::Instant::now();
		watcher.drain(Duration::from_millis(50)).await;
		assert!(started.elapsed() >= Duration::from_millis(50));
	}

	#[tokio::test]
	async fn shutdown_watcher_observes_trigger() {
		let (trigger, mut watcher) = new_shutdown();
		let handle = tokio::spawn(async move {
			watcher.signaled().await;
		});
		trigger.shutdown_now().await;
		tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
	}
}
