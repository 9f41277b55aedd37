//! Allow/deny evaluation against a policy bundle. Two interchangeable
//! backends — `embedded` (in-process WASM) and `external` (decision-service
//! HTTP) — are wrapped by the exact same cache + resilience combinator used
//! by `RolesEnricher`, and the system fails closed: any cache miss followed
//! by a breaker-open or exhausted retry denies the request.

pub mod embedded;
pub mod external;
pub mod loader;

use std::time::Duration;

use moka::future::Cache as MokaCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::{PolicyConfig, PolicyMode};
use crate::errors::GatewayError;
use crate::model::{PolicyDecision, PolicyInput};
use crate::resilience::{BreakerConfig, CircuitBreaker, ResilienceConfig, ResilienceOutcome, RetryConfig, call};

pub use embedded::EmbeddedBackend;
pub use external::ExternalBackend;
pub use loader::{CompiledPolicy, PolicyLoader};

enum Backend {
	Embedded(EmbeddedBackend),
	External(ExternalBackend),
}

pub struct PolicyEngine {
	backend: Backend,
	cache: MokaCache<[u8; 32], PolicyDecision>,
	breaker: CircuitBreaker,
	resilience: ResilienceConfig,
}

impl PolicyEngine {
	pub fn embedded(loader: &PolicyLoader, cfg: &PolicyConfig) -> Self {
		Self::new(Backend::Embedded(EmbeddedBackend::new(loader.current_handle())), cfg)
	}

	pub fn external(http: reqwest::Client, cfg: &PolicyConfig) -> Self {
		Self::new(Backend::External(ExternalBackend::new(http, cfg.decision_url.clone(), cfg.decision_path.clone())), cfg)
	}

	pub fn from_config(loader: Option<&PolicyLoader>, http: reqwest::Client, cfg: &PolicyConfig) -> Self {
		match cfg.mode {
			PolicyMode::Embedded => {
				let loader = loader.expect("embedded policy mode requires a PolicyLoader");
				Self::embedded(loader, cfg)
			},
			PolicyMode::External => Self::external(http, cfg),
		}
	}

	fn new(backend: Backend, cfg: &PolicyConfig) -> Self {
		Self {
			backend,
			cache: MokaCache::builder().time_to_live(cfg.cache_ttl).max_capacity(50_000).build(),
			breaker: CircuitBreaker::new(BreakerConfig::standard()),
			resilience: ResilienceConfig {
				timeout: cfg.timeout,
				retry: RetryConfig {
					attempts: 2,
					base_delay: Duration::from_millis(200),
				},
				breaker: BreakerConfig::standard(),
			},
		}
	}

	/// A clean `allow=false` decision from the backend is a 403, not a
	/// dependency failure — only breaker-open, timeout, and transport/decode
	/// errors fail closed as `PolicySubsystemUnavailable`, which the pipeline
	/// maps to a 503 (spec §7: "policy subsystem down → fail closed, default
	/// 503 `service_unavailable`", distinct from "policy denial: 403").
	pub async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyDecision, GatewayError> {
		let key = cache_key(input);
		if let Some(hit) = self.cache.get(&key).await {
			return Ok(hit);
		}

		let result = match &self.backend {
			Backend::Embedded(b) => {
				// No network suspension point; the "call" wrapper still gives
				// us uniform breaker bookkeeping and a timeout backstop
				// against a pathological policy program.
				call(&self.breaker, &self.resilience, || b.evaluate_once(input)).await
			},
			Backend::External(b) => call(&self.breaker, &self.resilience, || b.evaluate_once(input)).await,
		};

		let decision = match result {
			Ok(d) => d,
			Err(ResilienceOutcome::BreakerOpen) => {
				warn!("policy engine breaker open, failing closed");
				return Err(fail_closed("breaker open".to_string()));
			},
			Err(ResilienceOutcome::TimedOut) => {
				warn!("policy evaluation timed out, failing closed");
				return Err(fail_closed("evaluation timed out".to_string()));
			},
			Err(ResilienceOutcome::Failed(detail)) => {
				warn!(detail, "policy evaluation failed, failing closed");
				return Err(fail_closed(detail));
			},
		};

		self.cache.insert(key, decision.clone()).await;
		Ok(decision)
	}
}

fn fail_closed(detail: String) -> GatewayError {
	GatewayError::PolicySubsystemUnavailable { detail }
}

/// Canonical cache key: the full `PolicyInput` minus `context.timestamp`,
/// which is wall-clock and would otherwise make every lookup a miss (the
/// documented open question in the design notes).
fn cache_key(input: &PolicyInput) -> [u8; 32] {
	#[derive(Serialize)]
	struct Stable<'a> {
		request: &'a crate::model::PolicyInputRequest,
		user: &'a crate::model::PolicyInputUser,
		resource: &'a crate::model::PolicyInputResource,
	}
	let stable = Stable {
		request: &input.request,
		user: &input.user,
		resource: &input.resource,
	};
	let bytes = serde_json::to_vec(&stable).unwrap_or_default();
	let mut hasher = Sha256::new();
	hasher.update(&bytes);
	hasher.finalize().into()
}

/// The shape both backends parse their raw result into before applying the
/// interpretation rules in spec §4.6: bare boolean, or an object carrying
/// `allow`/`reason`/`violations`.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum RawResult {
	Bool(bool),
	Object {
		allow: bool,
		#[serde(default)]
		reason: Option<String>,
		#[serde(default)]
		violations: Vec<String>,
	},
}

pub fn interpret(raw: RawResult) -> PolicyDecision {
	match raw {
		RawResult::Bool(true) => PolicyDecision::allow(),
		RawResult::Bool(false) => PolicyDecision::deny("Access denied by policy"),
		RawResult::Object { allow: true, .. } => PolicyDecision::allow(),
		RawResult::Object {
			allow: false,
			reason,
			violations,
		} => PolicyDecision::deny_with_violations(reason.unwrap_or_else(|| "Access denied by policy".to_string()), violations),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cache_key_ignores_timestamp() {
		let mk = |ts: i64| crate::model::PolicyInput {
			request: crate::model::PolicyInputRequest {
				method: "GET".into(),
				path: "/api/x".into(),
				headers: Default::default(),
				query_params: Default::default(),
			},
			user: crate::model::PolicyInputUser {
				id: "u1".into(),
				email: None,
				roles: Default::default(),
				permissions: Default::default(),
				tenant: None,
			},
			resource: crate::model::PolicyInputResource {
				resource_type: Some("x".into()),
				id: None,
				action: "GET".into(),
			},
			context: crate::model::PolicyInputContext {
				timestamp: ts,
				source: "sidecar".into(),
			},
		};
		assert_eq!(cache_key(&mk(1)), cache_key(&mk(2)));
	}

	#[test]
	fn interpret_bare_bool() {
		assert!(interpret(RawResult::Bool(true)).allowed);
		assert!(!interpret(RawResult::Bool(false)).allowed);
	}

	#[test]
	fn deny_with_empty_violations_is_consistent() {
		let d = interpret(RawResult::Object {
			allow: false,
			reason: Some("no".into()),
			violations: vec![],
		});
		assert!(d.violations.is_empty());
	}
}
