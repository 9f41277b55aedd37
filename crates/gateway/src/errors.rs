//! Error taxonomy for the pipeline. Every stage converts its local error into
//! one of these before it crosses back into the pipeline loop; nothing ever
//! propagates past `Pipeline::handle` as an exception. See
//! `pipeline::error_response` for the `GatewayError -> (status, JSON body)`
//! mapping.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
	#[error("malformed bearer token: {0}")]
	MalformedToken(String),
	#[error("token signed by an unknown key")]
	UnknownSigner,
	#[error("token signature verification failed")]
	BadSignature,
	#[error("token is expired")]
	Expired,
	#[error("token issuer does not match the expected issuer for this tenant profile")]
	WrongIssuer,
	#[error("token audience does not match any configured audience")]
	WrongAudience,
	#[error("authentication required")]
	Unauthenticated,

	#[error("policy subsystem unavailable: {detail}")]
	PolicySubsystemUnavailable { detail: String },

	#[error("upstream backend unavailable: {detail}")]
	UpstreamUnavailable { detail: String },

	#[error("request exceeded its time budget")]
	BudgetExceeded,

	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	/// The HTTP status this error maps to, per the error-handling taxonomy:
	/// validation errors are the caller's fault (401/429), dependency errors
	/// degrade or fail closed (503/504), gateway bugs never leak detail (500).
	/// Policy denial (403) is a clean evaluation outcome handled directly off
	/// `PolicyDecision` in `pipeline::handle_inner`, not modeled here.
	pub fn status(&self) -> http::StatusCode {
		use http::StatusCode as S;
		match self {
			GatewayError::MalformedToken(_)
			| GatewayError::UnknownSigner
			| GatewayError::BadSignature
			| GatewayError::Expired
			| GatewayError::WrongIssuer
			| GatewayError::WrongAudience
			| GatewayError::Unauthenticated => S::UNAUTHORIZED,
			GatewayError::PolicySubsystemUnavailable { .. } => S::SERVICE_UNAVAILABLE,
			GatewayError::UpstreamUnavailable { .. } => S::SERVICE_UNAVAILABLE,
			GatewayError::BudgetExceeded => S::GATEWAY_TIMEOUT,
			GatewayError::Internal(_) => S::INTERNAL_SERVER_ERROR,
		}
	}

	/// The `code` slug in the JSON error body (spec §6).
	pub fn slug(&self) -> &'static str {
		match self {
			GatewayError::MalformedToken(_)
			| GatewayError::UnknownSigner
			| GatewayError::BadSignature
			| GatewayError::Expired
			| GatewayError::WrongIssuer
			| GatewayError::WrongAudience
			| GatewayError::Unauthenticated => "unauthorized",
			GatewayError::PolicySubsystemUnavailable { .. } | GatewayError::UpstreamUnavailable { .. } => {
				"service_unavailable"
			},
			GatewayError::BudgetExceeded => "service_unavailable",
			GatewayError::Internal(_) => "internal_error",
		}
	}

	/// Caller-safe message. Never includes internal detail (dependency
	/// hostnames, stack context) even when the variant carries it for logs.
	pub fn public_message(&self) -> String {
		match self {
			GatewayError::Unauthenticated
			| GatewayError::MalformedToken(_)
			| GatewayError::UnknownSigner
			| GatewayError::BadSignature
			| GatewayError::Expired
			| GatewayError::WrongIssuer
			| GatewayError::WrongAudience => "Authentication required".to_string(),
			GatewayError::PolicySubsystemUnavailable { .. } => {
				"Policy subsystem unavailable. Access denied for security.".to_string()
			},
			GatewayError::UpstreamUnavailable { detail } => detail.clone(),
			GatewayError::BudgetExceeded => "Request exceeded its time budget".to_string(),
			GatewayError::Internal(_) => "Internal error".to_string(),
		}
	}

	/// True for the two 503 variants that spec.md §4.9/§8 scenario 6 render
	/// as the flat `{"error": "Service Unavailable: <detail>"}` envelope
	/// instead of the general `{"code","message","details"}` one.
	pub fn is_service_unavailable_envelope(&self) -> bool {
		matches!(self, GatewayError::PolicySubsystemUnavailable { .. } | GatewayError::UpstreamUnavailable { .. })
	}
}
