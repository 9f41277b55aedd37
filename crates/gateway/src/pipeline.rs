//! The ordered per-request filter chain (spec.md §4.8): request-id tag →
//! public-path short-circuit → rate limit → tenant resolve → token validate
//! → claim normalize → roles enrich → policy evaluate → proxy forward →
//! audit emit. Every stage converts its local failure into a `GatewayError`
//! and the pipeline turns that into a response immediately — nothing
//! propagates past [`Pipeline::handle`] as an exception (design note: sum
//! type instead of exceptions, realized here as early `return`s over a
//! `Result`).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, Request, StatusCode, header};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::ConfigModel;
use crate::errors::GatewayError;
use crate::jwt::TokenValidator;
use crate::model::{AuthContext, PolicyInput};
use crate::pathmatcher;
use crate::policy::PolicyEngine;
use crate::proxy::{Proxy, strip_hop_by_hop};
use crate::rate_limit::{RateLimiter, RateLimitOutcome, resolve_client_ip};
use crate::roles::RolesEnricher;
use crate::{claims, tenant};
use sidecar_core::signal::DrainWatcher;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct Pipeline {
	config: ConfigModel,
	token_validator: Option<TokenValidator>,
	roles: RolesEnricher,
	policy: Option<PolicyEngine>,
	proxy: Proxy,
	rate_limiter: RateLimiter,
	audit: AuditLogger,
	drain: DrainWatcher,
}

impl Pipeline {
	pub fn new(config: ConfigModel, token_validator: Option<TokenValidator>, roles: RolesEnricher, policy: Option<PolicyEngine>) -> Self {
		let proxy = Proxy::new(&config.proxy);
		let rate_limiter = RateLimiter::new(&config.rate_limit);
		let audit = AuditLogger::new(&config.audit);
		Self {
			config,
			token_validator,
			roles,
			policy,
			proxy,
			rate_limiter,
			audit,
			drain: DrainWatcher::new(),
		}
	}

	/// Lets the caller (the binary's shutdown sequence) wait for every
	/// in-flight request entered via [`Self::handle`] to complete, up to a
	/// grace window, before tearing down the HTTP client, policy watcher, and
	/// caches.
	pub fn drain_watcher(&self) -> DrainWatcher {
		self.drain.clone()
	}

	pub async fn handle(self: Arc<Self>, req: Request<Body>, remote: Option<SocketAddr>) -> Response {
		let _guard = self.drain.enter();
		let budget = self.config.request_budget;
		let started = Instant::now();

		// Captured up front so the timeout arm below can still emit an audit
		// record if `handle_inner` is cancelled mid-flight: spec.md §4.8 step 8
		// requires exactly one audit record per request, even aborted ones.
		let request_id = req
			.headers()
			.get("x-request-id")
			.and_then(|v| v.to_str().ok())
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.unwrap_or_else(|| Uuid::new_v4().to_string());
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let query = req.uri().query().map(str::to_string);
		let raw_headers = flatten_headers(req.headers());
		let remote_addr = remote.map(|a| a.ip().to_string());
		let client_ip = resolve_client_ip(
			raw_headers.get("x-forwarded-for").map(String::as_str),
			raw_headers.get("x-real-ip").map(String::as_str),
			remote_addr.as_deref(),
		);
		let user_agent = raw_headers.get("user-agent").cloned();

		match tokio::time::timeout(budget, self.clone().handle_inner(req, remote)).await {
			Ok(resp) => resp,
			Err(_) => {
				warn!(?budget, "request exceeded its time budget");
				let resp = error_response(&GatewayError::BudgetExceeded, Some(&request_id));
				self.finish(&request_id, &AuthContext::anonymous(), &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, resp)
					.await
			},
		}
	}

	async fn handle_inner(self: Arc<Self>, req: Request<Body>, remote: Option<SocketAddr>) -> Response {
		let started = Instant::now();
		let (parts, body) = req.into_parts();

		let request_id = parts
			.headers
			.get("x-request-id")
			.and_then(|v| v.to_str().ok())
			.filter(|s| !s.is_empty())
			.map(str::to_string)
			.unwrap_or_else(|| Uuid::new_v4().to_string());

		let method = parts.method.clone();
		let path = parts.uri.path().to_string();
		let query = parts.uri.query().map(str::to_string);
		let raw_headers = flatten_headers(&parts.headers);
		let remote_addr = remote.map(|a| a.ip().to_string());
		let client_ip = resolve_client_ip(
			raw_headers.get("x-forwarded-for").map(String::as_str),
			raw_headers.get("x-real-ip").map(String::as_str),
			remote_addr.as_deref(),
		);
		let user_agent = raw_headers.get("user-agent").cloned();

		let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
			Ok(b) => b,
			Err(e) => {
				return self
					.finish(&request_id, &AuthContext::anonymous(), &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, error_response(&GatewayError::Internal(e.to_string()), Some(&request_id)))
					.await;
			},
		};

		// Step 2: public-path / reserved-prefix short circuit. TokenValidator
		// is never invoked on this branch.
		if self.is_public(&path) {
			let resp = self.proxy_only(&method, &path, query.as_deref(), &parts.headers, body_bytes, &AuthContext::anonymous()).await;
			return self
				.finish(&request_id, &AuthContext::anonymous(), &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, resp)
				.await;
		}

		// Step 3: pre-auth rate limit, keyed by client IP (no AuthContext
		// exists yet at this point in the canonical ordering).
		if self.config.rate_limit.enabled {
			if let RateLimitOutcome::Rejected { retry_after_secs } = self.rate_limiter.check(&client_ip) {
				let resp = rate_limited_response(retry_after_secs);
				return self
					.finish(&request_id, &AuthContext::anonymous(), &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, resp)
					.await;
			}
		}

		// Steps 4-5: authenticate then enrich.
		let ctx = match self.authenticate(&parts.headers, &raw_headers).await {
			Ok(ctx) => self.roles.enrich(&ctx).await,
			Err(e) => {
				let resp = error_response(&e, Some(&request_id));
				return self
					.finish(&request_id, &AuthContext::anonymous(), &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, resp)
					.await;
			},
		};

		// Step 6: authorize.
		if let Some(policy) = &self.policy {
			if self.config.policy.enabled {
				let input = PolicyInput::build(&ctx, method.as_str(), &path, raw_headers.clone(), query_params(query.as_deref()), now_ms());
				match policy.evaluate(&input).await {
					Ok(decision) if !decision.allowed => {
						let reason = decision.reason.clone().unwrap_or_else(|| "Access denied".to_string());
						let details = if decision.violations.is_empty() { None } else { Some(decision.violations.clone()) };
						let resp = json_error(StatusCode::FORBIDDEN, "forbidden", &reason, details, Some(&request_id));
						return self
							.finish(&request_id, &ctx, &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, resp)
							.await;
					},
					Ok(_) => {},
					Err(e) => {
						let resp = error_response(&e, Some(&request_id));
						return self
							.finish(&request_id, &ctx, &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, resp)
							.await;
					},
				}
			}
		}

		// Step 7: proxy forward.
		let resp = self.proxy_only(&method, &path, query.as_deref(), &parts.headers, body_bytes, &ctx).await;
		self.finish(&request_id, &ctx, &method, &path, query.as_deref(), &client_ip, user_agent.as_deref(), &raw_headers, started, resp).await
	}

	fn is_public(&self, path: &str) -> bool {
		pathmatcher::matches_any(path, &self.config.auth.public_paths) || pathmatcher::matches_any(path, &self.config.auth.reserved_prefixes) || !self.config.auth.enabled
	}

	async fn authenticate(&self, headers: &HeaderMap, raw_headers: &BTreeMap<String, String>) -> Result<AuthContext, GatewayError> {
		let Some(validator) = &self.token_validator else {
			return Ok(AuthContext::anonymous());
		};

		let bearer = headers
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "))
			.ok_or(GatewayError::Unauthenticated)?;

		let tenant_header = raw_headers.get("x-tenant-id").map(String::as_str);
		let profile = tenant::resolve(tenant_header, Some(bearer));
		let verified = validator.validate(&profile, bearer).await?;
		Ok(claims::normalize(&verified, &profile))
	}

	async fn proxy_only(&self, method: &http::Method, path: &str, query: Option<&str>, headers: &HeaderMap, body: Bytes, ctx: &AuthContext) -> Response {
		let path_and_query = match query {
			Some(q) if !q.is_empty() => format!("{path}?{q}"),
			_ => path.to_string(),
		};
		match self.proxy.forward(method, &path_and_query, headers, body, ctx).await {
			Ok(proxied) => {
				let mut headers = proxied.headers;
				strip_hop_by_hop(&mut headers);
				let mut resp = Response::new(Body::from(proxied.body));
				*resp.status_mut() = proxied.status;
				*resp.headers_mut() = headers;
				resp
			},
			Err(e) => error_response(&e, None),
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn finish(
		&self,
		request_id: &str,
		ctx: &AuthContext,
		method: &http::Method,
		path: &str,
		query: Option<&str>,
		client_ip: &str,
		user_agent: Option<&str>,
		raw_headers: &BTreeMap<String, String>,
		started: Instant,
		mut resp: Response,
	) -> Response {
		let duration_ms = started.elapsed().as_millis() as u64;
		let status = resp.status().as_u16();
		resp.headers_mut().insert("x-request-id", status_header_value(request_id));
		self.audit.emit(request_id, ctx, method.as_str(), path, query, client_ip, user_agent, raw_headers, status, duration_ms);
		info!(request_id, status, duration_ms, path, "request completed");
		resp
	}
}

fn status_header_value(s: &str) -> http::HeaderValue {
	http::HeaderValue::from_str(s).unwrap_or_else(|_| http::HeaderValue::from_static("invalid"))
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
	let mut out = BTreeMap::new();
	for (name, value) in headers.iter() {
		if let Ok(v) = value.to_str() {
			out.insert(name.as_str().to_ascii_lowercase(), v.to_string());
		}
	}
	out
}

fn query_params(query: Option<&str>) -> BTreeMap<String, String> {
	let Some(q) = query else { return BTreeMap::new() };
	url::form_urlencoded::parse(q.as_bytes()).into_owned().collect()
}

fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

fn rate_limited_response(retry_after_secs: u64) -> Response {
	let mut resp = json_error(StatusCode::TOO_MANY_REQUESTS, "too_many_requests", "Too many requests", None, None);
	resp.headers_mut().insert(header::RETRY_AFTER, http::HeaderValue::from(retry_after_secs));
	resp
}

fn error_response(err: &GatewayError, request_id: Option<&str>) -> Response {
	let status = err.status();

	// Policy-subsystem and upstream failures render as the flat `{"error":
	// "Service Unavailable: <detail>"}` envelope per spec.md §4.9 and the
	// literal §8 scenario 6, not the general `{"code",...}` shape used by
	// every other error.
	if err.is_service_unavailable_envelope() {
		let body = json!({ "error": format!("Service Unavailable: {}", err.public_message()) });
		let mut resp = (status, axum::Json(body)).into_response();
		if let Some(id) = request_id {
			resp.headers_mut().insert("x-request-id", status_header_value(id));
		}
		return resp;
	}

	let mut resp = json_error(status, err.slug(), &err.public_message(), None, request_id);
	if status == StatusCode::UNAUTHORIZED {
		resp.headers_mut().insert(header::WWW_AUTHENTICATE, http::HeaderValue::from_static("Bearer"));
	}
	resp
}

fn json_error(status: StatusCode, code: &str, message: &str, details: Option<Vec<String>>, request_id: Option<&str>) -> Response {
	let body = json!({
		"code": code,
		"message": message,
		"details": details,
	});
	let mut resp = (status, axum::Json(body)).into_response();
	if let Some(id) = request_id {
		resp.headers_mut().insert("x-request-id", status_header_value(id));
	}
	resp
}

pub async fn handler(State(pipeline): State<Arc<Pipeline>>, connect_info: Option<ConnectInfo<SocketAddr>>, req: Request<Body>) -> Response {
	let remote = connect_info.map(|ConnectInfo(addr)| addr);
	pipeline.handle(req, remote).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn query_params_parses_form_encoded() {
		let qp = query_params(Some("a=1&b=two"));
		assert_eq!(qp.get("a").unwrap(), "1");
		assert_eq!(qp.get("b").unwrap(), "two");
	}

	#[test]
	fn query_params_none_is_empty() {
		assert!(query_params(None).is_empty());
	}
}
