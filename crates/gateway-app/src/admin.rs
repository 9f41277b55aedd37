//! The admin sidecar listener: `/healthz`, `/readyz`, `/logging`,
//! `/quitquitquit`. Grounded on the teacher's `management/admin.rs` — same
//! endpoint names and the same `/logging` GET-lists/POST-changes contract,
//! rebuilt on `axum` instead of the teacher's hand-rolled hyper server since
//! this repo already standardizes on axum for its one other listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::StatusCode;
use serde_json::json;
use sidecar_core::signal::ShutdownTrigger;
use sidecar_core::telemetry;
use sidecar_core::version::BuildInfo;
use sidecar_gateway::ConfigModel;
use tracing::info;

struct AdminState {
	shutdown: ShutdownTrigger,
	config: ConfigModel,
	ready: Arc<AtomicBool>,
}

/// Shared with the binary's startup sequence: flips to `true` once the main
/// proxy listener is bound and serving, so `/readyz` can distinguish "process
/// alive" from "accepting traffic" per SPEC_FULL.md's AdminServer section.
pub fn ready_flag() -> Arc<AtomicBool> {
	Arc::new(AtomicBool::new(false))
}

pub fn router(shutdown: ShutdownTrigger, config: ConfigModel, ready: Arc<AtomicBool>) -> Router {
	let state = Arc::new(AdminState { shutdown, config, ready });
	Router::new()
		.route("/healthz", get(healthz))
		.route("/readyz", get(readyz))
		.route("/logging", get(list_loggers).post(change_logging))
		.route("/quitquitquit", axum::routing::post(quitquitquit))
		.route("/config_dump", get(config_dump))
		.with_state(state)
}

async fn config_dump(State(state): State<Arc<AdminState>>) -> Response {
	let body = json!({
		"version": BuildInfo::current(),
		"config": state.config,
	});
	(StatusCode::OK, axum::Json(body)).into_response()
}

async fn healthz() -> &'static str {
	"ok"
}

/// `200` once the main proxy listener is bound and accepting connections,
/// `503` while the process is still starting up.
async fn readyz(State(state): State<Arc<AdminState>>) -> Response {
	if state.ready.load(Ordering::Acquire) {
		(StatusCode::OK, "ready\n").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not ready\n").into_response()
	}
}

async fn list_loggers() -> Response {
	match telemetry::get_current_loglevel() {
		Some(level) => (StatusCode::OK, format!("current log level is {level}\n")).into_response(),
		None => (StatusCode::INTERNAL_SERVER_ERROR, "telemetry not initialized\n").into_response(),
	}
}

/// `POST /logging` with no query parameters lists the current level, same
/// as the teacher's handler; `?level=` or `?reset=` changes it.
async fn change_logging(Query(qp): Query<HashMap<String, String>>) -> Response {
	let level = qp.get("level").cloned();
	let reset = qp.contains_key("reset");
	if level.is_none() && !reset {
		return list_loggers().await;
	}
	match telemetry::set_level(reset, level.as_deref().unwrap_or_default()) {
		Ok(()) => (StatusCode::OK, "log level changed\n").into_response(),
		Err(e) => (StatusCode::BAD_REQUEST, format!("failed to set log level: {e}\n")).into_response(),
	}
}

async fn quitquitquit(State(state): State<Arc<AdminState>>) -> Response {
	info!("received shutdown request via /quitquitquit");
	state.shutdown.shutdown_now().await;
	(StatusCode::OK, "shutdown now\n").into_response()
}
