//! tracing-subscriber bootstrap plus a runtime-adjustable log level, so the
//! admin endpoint can raise or lower verbosity without a restart.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static RELOAD_HANDLE: OnceLock<ReloadHandle> = OnceLock::new();
static DEFAULT_DIRECTIVE: OnceLock<String> = OnceLock::new();

/// Initializes the global subscriber. `json` selects structured JSON output
/// (used in production) over the human-readable format (used in local dev).
/// Must be called exactly once; subsequent calls are a no-op.
pub fn init(default_directive: &str, json: bool) {
	if RELOAD_HANDLE.get().is_some() {
		return;
	}
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
	let (filter, handle) = reload::Layer::new(filter);

	let fmt_layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = if json {
		Box::new(tracing_subscriber::fmt::layer().json().with_target(true))
	} else {
		Box::new(tracing_subscriber::fmt::layer().with_target(true))
	};

	tracing_subscriber::registry().with(filter).with(fmt_layer).init();

	let _ = RELOAD_HANDLE.set(handle);
	let _ = DEFAULT_DIRECTIVE.set(default_directive.to_string());
}

/// Returns the currently active filter directive string, or `None` if
/// [`init`] hasn't run (e.g. in unit tests that don't bootstrap telemetry).
pub fn get_current_loglevel() -> Option<String> {
	let handle = RELOAD_HANDLE.get()?;
	handle.with_current(|f| f.to_string()).ok()
}

/// Replaces the active filter. Pass `reset: true` to go back to the directive
/// `init` was called with, ignoring `directive`.
pub fn set_level(reset: bool, directive: &str) -> Result<(), String> {
	let handle = RELOAD_HANDLE.get().ok_or("telemetry not initialized")?;
	let directive = if reset {
		DEFAULT_DIRECTIVE.get().map(String::as_str).unwrap_or("info")
	} else {
		directive
	};
	let new_filter = EnvFilter::try_new(directive).map_err(|e| e.to_string())?;
	handle.reload(new_filter).map_err(|e| e.to_string())
}
