//! Shared harness for the end-to-end scenario tests in `scenarios.rs`:
//! signs tokens against a throwaway RSA keypair, stands up wiremock servers
//! for JWKS/roles/policy-decision/upstream, and assembles a real `Pipeline`
//! in external-policy-mode wired to them — the same "mock every HTTP
//! boundary, exercise the real pipeline" approach as the teacher's own
//! `tests/integration.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use sidecar_gateway::config::{AuditConfig, AuthConfig, ConfigModel, PolicyConfig, PolicyMode, ProxyConfig, RateLimitConfig, RolesServiceConfig, TenantProfileConfig};
use sidecar_gateway::jwt::{TenantProfile, TokenValidator};
use sidecar_gateway::pipeline::Pipeline;
use sidecar_gateway::policy::PolicyEngine;
use sidecar_gateway::roles::RolesEnricher;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_RSA_PRIVATE_PEM: &str = include_str!("../../testdata/test_rsa_key.pem");
const TEST_KID: &str = "test-key-1";
pub const TEST_ISSUER: &str = "https://issuer.example.com";
pub const TEST_AUDIENCE: &str = "my-aud";

fn jwk_body() -> serde_json::Value {
	// Same key pair as `jwt.rs`'s unit tests; n/e extracted once with `openssl rsa`.
	serde_json::json!({
		"keys": [{
			"kty": "RSA",
			"kid": TEST_KID,
			"alg": "RS256",
			"use": "sig",
			"n": "jlw5B2-qNXezE8_cBh26Ht7IFLvmwezgsBXH9E0p8Nr-RYeqmnAnmiQDpTQ1xVyXtHiqZ_VPn_Ou_qD0LkK96yZ-HlQaYEvziOjZAIB0Cu4TeaybuT2yevycjZmYnUBw1KOxixzJSX4RgMAxH32U_LJIyDqS1fOPcIf61hRTxa8thrUjsiiABjKBB7olF9qtdYg6mJtVvhG-qD0z-IuzQ2IKSmvxC3fPfS_GF8j8HPHEarXXBSIMdvk0j2J46EaQgqtZ2uLf8gUe1dbjNqGnqB4ZTdENXv7QbAnkFU72VCYmbMMke1mG1pLFpPvRQK-2QXcPdyjijyH8PEJM64iOyw",
			"e": "AQAB",
		}]
	})
}

/// Signs a compact RS256 JWT carrying `sub` and `realm_access.roles`
/// (the "default"/realm-IdP dialect `claims.rs` extracts roles from).
pub fn sign_token(sub: &str, roles: &[&str]) -> String {
	let key = EncodingKey::from_rsa_pem(TEST_RSA_PRIVATE_PEM.as_bytes()).unwrap();
	let mut header = Header::new(Algorithm::RS256);
	header.kid = Some(TEST_KID.to_string());
	let claims = serde_json::json!({
		"sub": sub,
		"iss": TEST_ISSUER,
		"aud": TEST_AUDIENCE,
		"iat": 1_700_000_000,
		"exp": 4_102_444_800i64,
		"realm_access": {"roles": roles},
	});
	encode(&header, &claims, &key).unwrap()
}

/// Mounts a JWKS endpoint on `server` and loads a `TenantProfile` against it.
pub async fn tenant_profile(server: &MockServer) -> TenantProfile {
	Mock::given(method("GET"))
		.and(path("/jwks.json"))
		.respond_with(ResponseTemplate::new(200).set_body_json(jwk_body()))
		.mount(server)
		.await;
	let cfg = TenantProfileConfig {
		issuer: TEST_ISSUER.to_string(),
		audiences: vec![TEST_AUDIENCE.to_string()],
		jwks_uri: format!("{}/jwks.json", server.uri()),
		algorithms: vec!["RS256".to_string()],
		jwks_refresh_interval: None,
	};
	TenantProfile::load(&cfg, reqwest::Client::new()).await.unwrap()
}

pub struct Harness {
	pub jwks_server: MockServer,
	pub policy_server: MockServer,
	pub upstream_server: MockServer,
	pub pipeline: Arc<Pipeline>,
}

/// Assembles a `Pipeline` wired to three wiremock servers (JWKS, external
/// policy decision, upstream backend) with auth, rate limiting, and (via
/// `configure`) policy behavior overridable per scenario.
pub async fn build_harness(configure: impl FnOnce(&mut ConfigModel)) -> Harness {
	let jwks_server = MockServer::start().await;
	let policy_server = MockServer::start().await;
	let upstream_server = MockServer::start().await;

	let profile = Arc::new(tenant_profile(&jwks_server).await);
	let mut profiles = HashMap::new();
	profiles.insert("default".to_string(), profile);
	let token_validator = TokenValidator::new(profiles);

	let http = reqwest::Client::new();

	let mut config = ConfigModel {
		proxy: ProxyConfig {
			target: upstream_server.uri(),
			..ProxyConfig::default()
		},
		auth: AuthConfig {
			enabled: true,
			tenants: HashMap::new(),
			..AuthConfig::default()
		},
		roles: RolesServiceConfig {
			enabled: false,
			..RolesServiceConfig::default()
		},
		policy: PolicyConfig {
			enabled: true,
			mode: PolicyMode::External,
			decision_url: policy_server.uri(),
			..PolicyConfig::default()
		},
		rate_limit: RateLimitConfig {
			enabled: false,
			..RateLimitConfig::default()
		},
		audit: AuditConfig::default(),
		..ConfigModel::default()
	};
	configure(&mut config);

	let roles = RolesEnricher::new(&config.roles, http.clone());
	let policy = PolicyEngine::from_config(None, http.clone(), &config.policy);
	let pipeline = Arc::new(Pipeline::new(config, Some(token_validator), roles, Some(policy)));

	Harness {
		jwks_server,
		policy_server,
		upstream_server,
		pipeline,
	}
}

/// Mounts a policy-decision endpoint that always returns `allow`.
pub async fn mount_policy_allow(server: &MockServer) {
	Mock::given(method("POST"))
		.and(path("/v1/data/authz/allow"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": true})))
		.mount(server)
		.await;
}

/// Mounts a policy-decision endpoint that always returns `deny`.
pub async fn mount_policy_deny(server: &MockServer) {
	Mock::given(method("POST"))
		.and(path("/v1/data/authz/allow"))
		.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": {"allow": false, "reason": "Access denied by policy"}})))
		.mount(server)
		.await;
}
