//! Turns verified claims into an `AuthContext`, normalizing across the two
//! issuer dialects. Per the design note on runtime-reflective claim
//! extraction, this module treats the claim map as untyped input but
//! produces a typed, well-known-field record — the reflection stays at this
//! one boundary instead of leaking through the rest of the pipeline.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::jwt::VerifiedClaims;
use crate::model::AuthContext;
use crate::tenant::ENTRA_PROFILE;

/// `tenant_profile` is whichever profile `TenantResolver` picked (and
/// `TokenValidator` then verified against) — it selects which dialect's
/// extraction rules apply, independent of what the claims themselves say.
pub fn normalize(claims: &VerifiedClaims, tenant_profile: &str) -> AuthContext {
	let c = &claims.inner;

	let Some(subject) = subject_of(c, tenant_profile) else {
		return AuthContext::anonymous();
	};

	let email = str_claim(c, "email");
	let name = str_claim(c, "name");
	let preferred_username = str_claim(c, "preferred_username").or_else(|| str_claim(c, "upn"));
	let issuer = str_claim(c, "iss").unwrap_or_default();
	let audience = aud_claim(c);
	let roles = roles_of(c, tenant_profile);
	let tenant = tenant_of(c, tenant_profile);
	let issued_at = int_claim(c, "iat").unwrap_or(0);
	let expires_at = int_claim(c, "exp").unwrap_or(0);
	let token_id = str_claim(c, "jti");

	let mut claim_map = BTreeMap::new();
	for (k, v) in c.iter() {
		claim_map.insert(k.clone(), v.clone());
	}

	AuthContext {
		user_id: subject,
		email,
		name,
		preferred_username,
		issuer,
		audience,
		roles,
		permissions: BTreeSet::new(),
		claims: claim_map,
		issued_at,
		expires_at,
		token_id,
		tenant,
	}
}

fn subject_of(c: &serde_json::Map<String, Value>, tenant_profile: &str) -> Option<String> {
	if tenant_profile == ENTRA_PROFILE {
		str_claim(c, "oid").or_else(|| str_claim(c, "sub"))
	} else {
		str_claim(c, "sub").or_else(|| str_claim(c, "oid"))
	}
}

fn roles_of(c: &serde_json::Map<String, Value>, tenant_profile: &str) -> BTreeSet<String> {
	let mut roles = BTreeSet::new();
	if tenant_profile == ENTRA_PROFILE {
		roles.extend(str_list_claim(c, "roles"));
		roles.extend(str_list_claim(c, "groups"));
	} else {
		if let Some(Value::Object(realm_access)) = c.get("realm_access") {
			if let Some(Value::Array(rs)) = realm_access.get("roles") {
				roles.extend(rs.iter().filter_map(|v| v.as_str()).map(str::to_string));
			}
		}
		if let Some(Value::Object(resource_access)) = c.get("resource_access") {
			for (client_id, entry) in resource_access.iter() {
				if let Value::Object(entry) = entry {
					if let Some(Value::Array(rs)) = entry.get("roles") {
						for r in rs.iter().filter_map(|v| v.as_str()) {
							roles.insert(format!("{client_id}:{r}"));
						}
					}
				}
			}
		}
	}
	roles
}

fn tenant_of(c: &serde_json::Map<String, Value>, tenant_profile: &str) -> Option<String> {
	if tenant_profile == ENTRA_PROFILE {
		str_claim(c, "tid")
	} else {
		str_claim(c, "iss").and_then(|iss| iss.rsplit("/realms/").next().map(str::to_string).filter(|_| iss.contains("/realms/")))
	}
}

fn str_claim(c: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
	c.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn int_claim(c: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
	c.get(key).and_then(|v| v.as_i64())
}

fn aud_claim(c: &serde_json::Map<String, Value>) -> Vec<String> {
	match c.get("aud") {
		Some(Value::String(s)) => vec![s.clone()],
		Some(Value::Array(a)) => a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect(),
		_ => Vec::new(),
	}
}

fn str_list_claim(c: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
	match c.get(key) {
		Some(Value::Array(a)) => a.iter().filter_map(|v| v.as_str()).map(str::to_string).collect(),
		_ => Vec::new(),
	}
}
