//! One structured record per completed request, emitted to the `audit`
//! tracing target exactly as the teacher's admin PAT endpoints emit their
//! own audit trail (`tracing::info!(target: "audit", ...)`); a JSON log
//! formatter layer on that target is how the "dedicated audit sink" in
//! spec.md §4.11 is realized. Audit emission never fails the request: any
//! error while building the record is caught and logged separately.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crate::config::AuditConfig;
use crate::model::AuthContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
	Success,
	AuthenticationFailed,
	AuthorizationDenied,
	NotFound,
	RateLimited,
	ClientError,
	ServerError,
	Unknown,
}

impl Outcome {
	/// Status-code → outcome mapping from spec.md §4.11. Special-cased
	/// status codes take priority over the generic family bucket.
	pub fn from_status(status: u16) -> Self {
		match status {
			401 => Outcome::AuthenticationFailed,
			403 => Outcome::AuthorizationDenied,
			404 => Outcome::NotFound,
			429 => Outcome::RateLimited,
			200..=299 => Outcome::Success,
			400..=499 => Outcome::ClientError,
			500..=599 => Outcome::ServerError,
			_ => Outcome::Unknown,
		}
	}
}

#[derive(Debug, Serialize)]
struct AuditUser {
	id: String,
	email: Option<String>,
	tenant: Option<String>,
}

#[derive(Debug, Serialize)]
struct AuditRequest {
	method: String,
	path: String,
	query_string: Option<String>,
	remote_address: String,
	user_agent: Option<String>,
	headers: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct AuditResponse {
	status_code: u16,
	status_family: String,
	duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct AuditRecord {
	timestamp: String,
	request_id: String,
	event_type: &'static str,
	user: AuditUser,
	request: AuditRequest,
	response: AuditResponse,
	outcome: Outcome,
}

pub struct AuditLogger {
	enabled: bool,
	sensitive_headers: Vec<String>,
}

impl AuditLogger {
	pub fn new(cfg: &AuditConfig) -> Self {
		Self {
			enabled: cfg.enabled,
			sensitive_headers: cfg.sensitive_headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
		}
	}

	#[allow(clippy::too_many_arguments)]
	pub fn emit(
		&self,
		request_id: &str,
		ctx: &AuthContext,
		method: &str,
		path: &str,
		query_string: Option<&str>,
		remote_address: &str,
		user_agent: Option<&str>,
		raw_headers: &BTreeMap<String, String>,
		status: u16,
		duration_ms: u64,
	) {
		if !self.enabled {
			return;
		}

		let record = AuditRecord {
			timestamp: Utc::now().to_rfc3339(),
			request_id: request_id.to_string(),
			event_type: "request",
			user: AuditUser {
				id: ctx.user_id.clone(),
				email: ctx.email.clone(),
				tenant: ctx.tenant.clone(),
			},
			request: AuditRequest {
				method: method.to_string(),
				path: path.to_string(),
				query_string: query_string.map(str::to_string),
				remote_address: remote_address.to_string(),
				user_agent: user_agent.map(str::to_string),
				headers: self.redact(raw_headers),
			},
			response: AuditResponse {
				status_code: status,
				status_family: format!("{}xx", status / 100),
				duration_ms,
			},
			outcome: Outcome::from_status(status),
		};

		match serde_json::to_string(&record) {
			Ok(json) => info!(target: "audit", request_id = %request_id, record = %json, "request audit"),
			Err(e) => error!(request_id = %request_id, error = %e, "failed to serialize audit record"),
		}
	}

	fn redact(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
		headers
			.iter()
			.map(|(k, v)| {
				if self.sensitive_headers.contains(&k.to_ascii_lowercase()) {
					(k.clone(), "[REDACTED]".to_string())
				} else {
					(k.clone(), v.clone())
				}
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn outcome_from_status_special_cases() {
		assert_eq!(Outcome::from_status(401), Outcome::AuthenticationFailed);
		assert_eq!(Outcome::from_status(403), Outcome::AuthorizationDenied);
		assert_eq!(Outcome::from_status(404), Outcome::NotFound);
		assert_eq!(Outcome::from_status(429), Outcome::RateLimited);
		assert_eq!(Outcome::from_status(200), Outcome::Success);
		assert_eq!(Outcome::from_status(418), Outcome::ClientError);
		assert_eq!(Outcome::from_status(502), Outcome::ServerError);
	}

	#[test]
	fn redacts_sensitive_headers_case_insensitively() {
		let logger = AuditLogger::new(&AuditConfig {
			enabled: true,
			sensitive_headers: vec!["Authorization".to_string()],
		});
		let mut headers = BTreeMap::new();
		headers.insert("authorization".to_string(), "Bearer secret".to_string());
		headers.insert("x-other".to_string(), "value".to_string());
		let redacted = logger.redact(&headers);
		assert_eq!(redacted.get("authorization").unwrap(), "[REDACTED]");
		assert_eq!(redacted.get("x-other").unwrap(), "value");
	}

	#[test]
	fn disabled_logger_is_a_noop() {
		let logger = AuditLogger::new(&AuditConfig {
			enabled: false,
			sensitive_headers: vec![],
		});
		// Should not panic even with a half-built context.
		logger.emit("req-1", &AuthContext::anonymous(), "GET", "/x", None, "1.2.3.4", None, &BTreeMap::new(), 200, 5);
	}
}
