//! Bearer-token verification under a chosen IdP profile: JWKS-backed
//! signature check plus the standard claim checks (`exp`/`nbf`/`iat`,
//! `iss`, `aud`). Grounded on the teacher's `http/jwt.rs` — this module
//! keeps its `kid`-keyed decoding-key map and `decode_header`/`decode`
//! flow, generalized to hold one key set per tenant profile instead of one
//! set for the whole gateway.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use secrecy::SecretString;
use serde_json::{Map, Value};
use sidecar_core::Atomic;
use tracing::{debug, warn};

use crate::config::TenantProfileConfig;
use crate::errors::GatewayError;

#[derive(Clone)]
struct Jwk {
	decoding: DecodingKey,
	alg: Algorithm,
}

struct ProfileKeys {
	keys: HashMap<String, Jwk>,
}

/// One tenant's verification rules plus its atomically-refreshable key set.
pub struct TenantProfile {
	issuer: String,
	audiences: Vec<String>,
	algorithms: Vec<Algorithm>,
	jwks_uri: String,
	refresh_interval: Duration,
	keys: Atomic<ProfileKeys>,
	http: reqwest::Client,
}

/// The verified, parsed claim set a successful validation yields; consumed
/// by `ClaimNormalizer`. The raw compact token is kept behind `SecretString`
/// so a stray `{:?}` on this struct never leaks it, same discipline as the
/// teacher's `Claims::jwt` field.
#[derive(Clone)]
pub struct VerifiedClaims {
	pub inner: Map<String, Value>,
	pub raw: SecretString,
}

impl std::fmt::Debug for VerifiedClaims {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("VerifiedClaims").field("inner", &self.inner).finish()
	}
}

impl TenantProfile {
	pub async fn load(cfg: &TenantProfileConfig, http: reqwest::Client) -> Result<Self, GatewayError> {
		let algorithms = cfg
			.algorithms
			.iter()
			.map(|a| Algorithm::from_str(a).map_err(|_| GatewayError::Internal(format!("unsupported algorithm {a:?}"))))
			.collect::<Result<Vec<_>, _>>()?;

		let keys = fetch_jwks(&http, &cfg.jwks_uri).await?;
		Ok(Self {
			issuer: cfg.issuer.clone(),
			audiences: cfg.audiences.clone(),
			algorithms,
			jwks_uri: cfg.jwks_uri.clone(),
			refresh_interval: cfg.jwks_refresh_interval.unwrap_or(Duration::from_secs(3600)),
			keys: Arc::new(arc_swap::ArcSwap::from_pointee(keys)),
			http,
		})
	}

	/// Spawns a background task that re-fetches the JWKS on `refresh_interval`.
	pub fn spawn_refresher(self: &Arc<Self>) {
		let this = self.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(this.refresh_interval);
			loop {
				tick.tick().await;
				match fetch_jwks(&this.http, &this.jwks_uri).await {
					Ok(fresh) => this.keys.store(Arc::new(fresh)),
					Err(e) => warn!(issuer = %this.issuer, error = ?e, "periodic JWKS refresh failed, keeping stale key set"),
				}
			}
		});
	}

	/// Verifies one compact JWS. On an unknown `kid` triggers a single
	/// synchronous re-fetch before giving up, to absorb key rotation without
	/// waiting for the periodic refresher.
	pub async fn validate(&self, token: &str) -> Result<VerifiedClaims, GatewayError> {
		let header = decode_header(token).map_err(|e| GatewayError::MalformedToken(e.to_string()))?;
		let kid = header.kid.as_deref().ok_or_else(|| GatewayError::MalformedToken("missing kid".into()))?;

		if !self.algorithms.contains(&header.alg) {
			return Err(GatewayError::BadSignature);
		}

		let mut snapshot = self.keys.load_full();
		if !snapshot.keys.contains_key(kid) {
			debug!(%kid, issuer = %self.issuer, "unknown kid, triggering single-flight JWKS refresh");
			if let Ok(fresh) = fetch_jwks(&self.http, &self.jwks_uri).await {
				let fresh = Arc::new(fresh);
				self.keys.store(fresh.clone());
				snapshot = fresh;
			}
		}
		let jwk = snapshot.keys.get(kid).ok_or(GatewayError::UnknownSigner)?;

		let mut validation = Validation::new(jwk.alg);
		validation.set_issuer(std::slice::from_ref(&self.issuer));
		validation.set_audience(&self.audiences);
		validation.leeway = 30; // small clock-skew allowance on exp/nbf/iat

		let decoded = decode::<Map<String, Value>>(token, &jwk.decoding, &validation).map_err(|e| {
			use jsonwebtoken::errors::ErrorKind as K;
			match e.kind() {
				K::ExpiredSignature => GatewayError::Expired,
				K::InvalidIssuer => GatewayError::WrongIssuer,
				K::InvalidAudience => GatewayError::WrongAudience,
				K::InvalidSignature => GatewayError::BadSignature,
				_ => GatewayError::MalformedToken(e.to_string()),
			}
		})?;

		Ok(VerifiedClaims {
			inner: decoded.claims,
			raw: SecretString::new(token.into()),
		})
	}
}

async fn fetch_jwks(http: &reqwest::Client, uri: &str) -> Result<ProfileKeys, GatewayError> {
	let jwks: JwkSet = http
		.get(uri)
		.send()
		.await
		.map_err(|e| GatewayError::Internal(format!("JWKS fetch failed: {e}")))?
		.json()
		.await
		.map_err(|e| GatewayError::Internal(format!("JWKS parse failed: {e}")))?;

	let mut keys = HashMap::new();
	for jwk in jwks.keys {
		let Some(kid) = jwk.common.key_id.clone() else { continue };
		let decoding = match &jwk.algorithm {
			AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
				.map_err(|e| GatewayError::Internal(format!("bad RSA JWK {kid}: {e}")))?,
			AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
				.map_err(|e| GatewayError::Internal(format!("bad EC JWK {kid}: {e}")))?,
			_ => {
				warn!(%kid, "JWK uses an unsupported key type, skipping");
				continue;
			},
		};
		let alg = jwk
			.common
			.key_algorithm
			.and_then(|a| Algorithm::from_str(a.to_string().as_str()).ok())
			.unwrap_or(Algorithm::RS256);
		keys.insert(kid, Jwk { decoding, alg });
	}
	Ok(ProfileKeys { keys })
}

/// Multi-tenant front door: owns one `TenantProfile` per configured profile
/// name and dispatches `validate` to the right one.
pub struct TokenValidator {
	profiles: HashMap<String, Arc<TenantProfile>>,
}

impl TokenValidator {
	pub fn new(profiles: HashMap<String, Arc<TenantProfile>>) -> Self {
		Self { profiles }
	}

	pub async fn validate(&self, profile: &str, token: &str) -> Result<VerifiedClaims, GatewayError> {
		let p = self.profiles.get(profile).ok_or(GatewayError::WrongIssuer)?;
		p.validate(token).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use jsonwebtoken::{EncodingKey, Header, encode};
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	// A throwaway 2048-bit RSA keypair used only to sign/verify test tokens.
	const TEST_RSA_PRIVATE_PEM: &str = include_str!("../testdata/test_rsa_key.pem");
	const TEST_KID: &str = "test-key-1";

	fn jwk_body() -> serde_json::Value {
		// n/e correspond to TEST_RSA_PRIVATE_PEM, extracted once with `openssl rsa`.
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

	fn sign(claims: &serde_json::Value) -> String {
		let key = EncodingKey::from_rsa_pem(TEST_RSA_PRIVATE_PEM.as_bytes()).unwrap();
		let mut header = Header::new(Algorithm::RS256);
		header.kid = Some(TEST_KID.to_string());
		encode(&header, claims, &key).unwrap()
	}

	async fn profile_with_jwks(server: &MockServer, issuer: &str, audiences: Vec<String>) -> TenantProfile {
		Mock::given(method("GET"))
			.and(path("/jwks.json"))
			.respond_with(ResponseTemplate::new(200).set_body_json(jwk_body()))
			.mount(server)
			.await;
		let cfg = TenantProfileConfig {
			issuer: issuer.to_string(),
			audiences,
			jwks_uri: format!("{}/jwks.json", server.uri()),
			algorithms: vec!["RS256".to_string()],
			jwks_refresh_interval: None,
		};
		TenantProfile::load(&cfg, reqwest::Client::new()).await.unwrap()
	}

	#[tokio::test]
	async fn validates_well_formed_token() {
		let server = MockServer::start().await;
		let profile = profile_with_jwks(&server, "https://issuer.example.com", vec!["my-aud".to_string()]).await;

		let token = sign(&serde_json::json!({
			"sub": "u1",
			"iss": "https://issuer.example.com",
			"aud": "my-aud",
			"iat": 1_700_000_000,
			"exp": 4_102_444_800i64,
		}));

		let verified = profile.validate(&token).await.unwrap();
		assert_eq!(verified.inner.get("sub").and_then(|v| v.as_str()), Some("u1"));
	}

	#[tokio::test]
	async fn rejects_expired_token() {
		let server = MockServer::start().await;
		let profile = profile_with_jwks(&server, "https://issuer.example.com", vec!["my-aud".to_string()]).await;

		let token = sign(&serde_json::json!({
			"sub": "u1",
			"iss": "https://issuer.example.com",
			"aud": "my-aud",
			"iat": 1_600_000_000,
			"exp": 1_600_000_001,
		}));

		let err = profile.validate(&token).await.unwrap_err();
		assert!(matches!(err, GatewayError::Expired));
	}

	#[tokio::test]
	async fn rejects_wrong_issuer() {
		let server = MockServer::start().await;
		let profile = profile_with_jwks(&server, "https://issuer.example.com", vec!["my-aud".to_string()]).await;

		let token = sign(&serde_json::json!({
			"sub": "u1",
			"iss": "https://someone-else.example.com",
			"aud": "my-aud",
			"iat": 1_700_000_000,
			"exp": 4_102_444_800i64,
		}));

		let err = profile.validate(&token).await.unwrap_err();
		assert!(matches!(err, GatewayError::WrongIssuer));
	}

	#[tokio::test]
	async fn rejects_unknown_kid_after_single_flight_refresh_fails() {
		let server = MockServer::start().await;
		let profile = profile_with_jwks(&server, "https://issuer.example.com", vec!["my-aud".to_string()]).await;

		let key = EncodingKey::from_rsa_pem(TEST_RSA_PRIVATE_PEM.as_bytes()).unwrap();
		let mut header = Header::new(Algorithm::RS256);
		header.kid = Some("some-other-kid".to_string());
		let token = encode(
			&header,
			&serde_json::json!({"sub": "u1", "iss": "https://issuer.example.com", "aud": "my-aud", "iat": 0, "exp": 9_999_999_999i64}),
			&key,
		)
		.unwrap();

		let err = profile.validate(&token).await.unwrap_err();
		assert!(matches!(err, GatewayError::UnknownSigner));
	}

	#[tokio::test]
	async fn token_validator_dispatches_to_named_profile() {
		let server = MockServer::start().await;
		let profile = Arc::new(profile_with_jwks(&server, "https://issuer.example.com", vec!["my-aud".to_string()]).await);
		let mut profiles = HashMap::new();
		profiles.insert("default".to_string(), profile);
		let validator = TokenValidator::new(profiles);

		let token = sign(&serde_json::json!({
			"sub": "u1", "iss": "https://issuer.example.com", "aud": "my-aud", "iat": 1_700_000_000, "exp": 4_102_444_800i64,
		}));

		assert!(validator.validate("default", &token).await.is_ok());
		assert!(matches!(validator.validate("unknown-profile", &token).await, Err(GatewayError::WrongIssuer)));
	}
}
