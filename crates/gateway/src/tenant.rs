//! Picks an IdP profile from the inbound request without verifying
//! anything — signature checks happen downstream in `TokenValidator`. This
//! resolver never denies; a parse failure just falls back to `"default"`.

use base64::Engine;

pub const DEFAULT_PROFILE: &str = "default";
pub const ENTRA_PROFILE: &str = "entra";

/// `(a)` explicit `X-Tenant-ID` header wins; `(b)` else sniff the `iss`
/// claim out of the bearer token's unverified payload; `(c)` classify by
/// substring; `(d)` otherwise `"default"`.
pub fn resolve(tenant_header: Option<&str>, bearer_token: Option<&str>) -> String {
	if let Some(h) = tenant_header {
		let h = h.trim();
		if !h.is_empty() {
			return h.to_lowercase();
		}
	}

	let Some(token) = bearer_token else {
		return DEFAULT_PROFILE.to_string();
	};
	let Some(iss) = sniff_issuer(token) else {
		return DEFAULT_PROFILE.to_string();
	};

	if iss.contains("login.microsoftonline.com") || iss.contains("sts.windows.net") || iss.contains("login.microsoft.com") {
		ENTRA_PROFILE.to_string()
	} else if iss.contains("/realms/") || iss.contains("keycloak") {
		DEFAULT_PROFILE.to_string()
	} else {
		DEFAULT_PROFILE.to_string()
	}
}

/// Base64url-decodes the JWS payload segment and reads `iss`, without any
/// signature verification. Any malformed input yields `None`.
fn sniff_issuer(token: &str) -> Option<String> {
	let mut parts = token.split('.');
	let _header = parts.next()?;
	let payload = parts.next()?;
	let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload).ok()?;
	let v: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
	v.get("iss").and_then(|s| s.as_str()).map(str::to_string)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn token_with_iss(iss: &str) -> String {
		let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"RS256\"}");
		let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("{{\"iss\":\"{iss}\"}}"));
		format!("{header}.{payload}.sig")
	}

	#[test]
	fn header_wins_over_token() {
		let t = token_with_iss("https://login.microsoftonline.com/x/v2.0");
		assert_eq!(resolve(Some("Acme"), Some(&t)), "acme");
	}

	#[test]
	fn entra_issuer_classified() {
		let t = token_with_iss("https://login.microsoftonline.com/tenant/v2.0");
		assert_eq!(resolve(None, Some(&t)), ENTRA_PROFILE);
	}

	#[test]
	fn realm_issuer_classified() {
		let t = token_with_iss("https://idp.example.com/realms/acme");
		assert_eq!(resolve(None, Some(&t)), DEFAULT_PROFILE);
	}

	#[test]
	fn malformed_token_defaults() {
		assert_eq!(resolve(None, Some("not-a-jwt")), DEFAULT_PROFILE);
		assert_eq!(resolve(None, None), DEFAULT_PROFILE);
	}

	#[test]
	fn empty_header_falls_through_to_token() {
		let t = token_with_iss("https://login.microsoftonline.com/x/v2.0");
		assert_eq!(resolve(Some("  "), Some(&t)), ENTRA_PROFILE);
	}
}
