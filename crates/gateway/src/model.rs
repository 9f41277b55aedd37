//! Immutable per-request data records. None of these carry shared mutable
//! state or global identity; every transform below yields a new value.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A validated-and-enriched caller for one request. Construction is the only
/// way to produce one; there is no setter. `userId == "anonymous"` iff
/// `is_authenticated()` is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
	pub user_id: String,
	pub email: Option<String>,
	pub name: Option<String>,
	pub preferred_username: Option<String>,
	pub issuer: String,
	pub audience: Vec<String>,
	pub roles: BTreeSet<String>,
	pub permissions: BTreeSet<String>,
	pub claims: BTreeMap<String, Value>,
	pub issued_at: i64,
	pub expires_at: i64,
	pub token_id: Option<String>,
	pub tenant: Option<String>,
}

pub const ANONYMOUS_USER_ID: &str = "anonymous";

impl AuthContext {
	pub fn anonymous() -> Self {
		Self {
			user_id: ANONYMOUS_USER_ID.to_string(),
			email: None,
			name: None,
			preferred_username: None,
			issuer: String::new(),
			audience: Vec::new(),
			roles: BTreeSet::new(),
			permissions: BTreeSet::new(),
			claims: BTreeMap::new(),
			issued_at: 0,
			expires_at: 0,
			token_id: None,
			tenant: None,
		}
	}

	pub fn is_authenticated(&self) -> bool {
		self.user_id != ANONYMOUS_USER_ID
	}

	/// Returns a new context with `roles`/`permissions` unioned in and
	/// `tenant` overridden when the enrichment supplied one. Used by
	/// `RolesEnricher`; every other field is copied verbatim.
	pub fn with_enrichment(&self, roles: &BTreeSet<String>, permissions: &BTreeSet<String>, tenant: Option<&str>) -> Self {
		let mut out = self.clone();
		out.roles.extend(roles.iter().cloned());
		out.permissions.extend(permissions.iter().cloned());
		if let Some(t) = tenant {
			out.tenant = Some(t.to_string());
		}
		out
	}
}

/// Roles/permissions as known by the external roles service for one
/// `(userId, tenant)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesResponse {
	pub user_id: String,
	#[serde(default)]
	pub roles: BTreeSet<String>,
	#[serde(default)]
	pub permissions: BTreeSet<String>,
	#[serde(default)]
	pub tenant: Option<String>,
}

impl RolesResponse {
	pub fn empty(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			roles: BTreeSet::new(),
			permissions: BTreeSet::new(),
			tenant: None,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInputRequest {
	pub method: String,
	pub path: String,
	pub headers: BTreeMap<String, String>,
	pub query_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInputUser {
	pub id: String,
	pub email: Option<String>,
	pub roles: BTreeSet<String>,
	pub permissions: BTreeSet<String>,
	pub tenant: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInputResource {
	#[serde(rename = "type")]
	pub resource_type: Option<String>,
	pub id: Option<String>,
	pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInputContext {
	pub timestamp: i64,
	pub source: String,
}

/// The authorization query document handed to the policy engine. `context`
/// carries the wall-clock timestamp and is therefore excluded from the
/// decision-cache key (see `policy::cache_key`) — see DESIGN.md's note on
/// the "Open question" about volatile cache key fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInput {
	pub request: PolicyInputRequest,
	pub user: PolicyInputUser,
	pub resource: PolicyInputResource,
	pub context: PolicyInputContext,
}

impl PolicyInput {
	pub fn build(ctx: &AuthContext, method: &str, path: &str, headers: BTreeMap<String, String>, query_params: BTreeMap<String, String>, now_ms: i64) -> Self {
		let (resource_type, resource_id) = extract_resource(path);
		PolicyInput {
			request: PolicyInputRequest {
				method: method.to_string(),
				path: path.to_string(),
				headers,
				query_params,
			},
			user: PolicyInputUser {
				id: ctx.user_id.clone(),
				email: ctx.email.clone(),
				roles: ctx.roles.clone(),
				permissions: ctx.permissions.clone(),
				tenant: ctx.tenant.clone(),
			},
			resource: PolicyInputResource {
				resource_type,
				id: resource_id,
				action: method.to_string(),
			},
			context: PolicyInputContext {
				timestamp: now_ms,
				source: "sidecar".to_string(),
			},
		}
	}
}

/// Extracts `(type, id)` from paths of the form `/api[/vN]/{type}[/{id}]` by
/// skipping empty segments, the literal `api`, and segments matching `v\d+`.
/// Returns `(None, None)` if no such segments remain.
fn extract_resource(path: &str) -> (Option<String>, Option<String>) {
	let is_version_segment = |s: &str| {
		s.len() > 1
			&& s.starts_with('v')
			&& s[1..].chars().all(|c| c.is_ascii_digit())
	};
	let segments: Vec<&str> = path
		.split('/')
		.filter(|s| !s.is_empty())
		.filter(|s| *s != "api")
		.filter(|s| !is_version_segment(s))
		.collect();
	match segments.len() {
		0 => (None, None),
		1 => (Some(segments[0].to_string()), None),
		_ => (Some(segments[0].to_string()), Some(segments[1].to_string())),
	}
}

/// `{allowed, reason, violations, metadata}`. The only constructors a caller
/// should use are `allow()` and `deny(..)`; `allowed=true` implies
/// `violations` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
	pub allowed: bool,
	pub reason: Option<String>,
	pub violations: Vec<String>,
	pub metadata: BTreeMap<String, Value>,
}

impl PolicyDecision {
	pub fn allow() -> Self {
		Self {
			allowed: true,
			reason: None,
			violations: Vec::new(),
			metadata: BTreeMap::new(),
		}
	}

	pub fn deny(reason: impl Into<String>) -> Self {
		Self {
			allowed: false,
			reason: Some(reason.into()),
			violations: Vec::new(),
			metadata: BTreeMap::new(),
		}
	}

	pub fn deny_with_violations(reason: impl Into<String>, violations: Vec<String>) -> Self {
		Self {
			allowed: false,
			reason: Some(reason.into()),
			violations,
			metadata: BTreeMap::new(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn anonymous_is_unauthenticated() {
		let ctx = AuthContext::anonymous();
		assert!(!ctx.is_authenticated());
		assert!(ctx.roles.is_empty());
	}

	#[test]
	fn extract_resource_skips_api_and_version() {
		assert_eq!(extract_resource("/api/v1/users/123"), (Some("users".into()), Some("123".into())));
		assert_eq!(extract_resource("/api/users"), (Some("users".into()), None));
		assert_eq!(extract_resource("/api/v2"), (None, None));
		assert_eq!(extract_resource("/"), (None, None));
	}

	#[test]
	fn enrichment_unions_roles_and_overrides_tenant() {
		let mut ctx = AuthContext::anonymous();
		ctx.user_id = "u1".into();
		ctx.roles.insert("user".into());
		let roles: BTreeSet<String> = ["admin".to_string()].into_iter().collect();
		let enriched = ctx.with_enrichment(&roles, &BTreeSet::new(), Some("acme"));
		assert!(enriched.roles.contains("user"));
		assert!(enriched.roles.contains("admin"));
		assert_eq!(enriched.tenant.as_deref(), Some("acme"));
	}
}
