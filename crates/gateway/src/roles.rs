//! Calls the external roles/permissions service to enrich an `AuthContext`,
//! wrapped in the standard resilience policy (cache, then breaker+retry+
//! timeout, then fallback).

use std::time::Duration;

use moka::future::Cache;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RolesServiceConfig;
use crate::model::{AuthContext, RolesResponse};
use crate::resilience::{BreakerConfig, CircuitBreaker, ResilienceConfig, ResilienceOutcome, RetryConfig, call};

#[derive(Deserialize)]
struct RolesServiceWireResponse {
	#[serde(rename = "userId")]
	user_id: String,
	#[serde(default)]
	roles: Vec<String>,
	#[serde(default)]
	permissions: Vec<String>,
	#[serde(default)]
	tenant: Option<String>,
}

impl From<RolesServiceWireResponse> for RolesResponse {
	fn from(w: RolesServiceWireResponse) -> Self {
		RolesResponse {
			user_id: w.user_id,
			roles: w.roles.into_iter().collect(),
			permissions: w.permissions.into_iter().collect(),
			tenant: w.tenant,
		}
	}
}

pub struct RolesEnricher {
	enabled: bool,
	base_url: String,
	http: reqwest::Client,
	cache: Option<Cache<(String, String), RolesResponse>>,
	breaker: CircuitBreaker,
	resilience: ResilienceConfig,
}

impl RolesEnricher {
	pub fn new(cfg: &RolesServiceConfig, http: reqwest::Client) -> Self {
		let cache = (!cfg.cache_disabled).then(|| {
			Cache::builder()
				.time_to_live(cfg.cache_ttl)
				.max_capacity(50_000)
				.build()
		});
		Self {
			enabled: cfg.enabled,
			base_url: cfg.base_url.clone(),
			http,
			cache,
			breaker: CircuitBreaker::new(BreakerConfig::standard()),
			resilience: ResilienceConfig {
				timeout: cfg.timeout,
				retry: RetryConfig {
					attempts: 2,
					base_delay: Duration::from_millis(500),
				},
				breaker: BreakerConfig::standard(),
			},
		}
	}

	/// `enrich(anonymous) = anonymous`; on any transport failure that
	/// bypasses the breaker, returns the original context unchanged so that
	/// token-derived roles survive an outage — only a breaker-open or
	/// retry-exhausted path falls back to `RolesResponse::empty`.
	pub async fn enrich(&self, ctx: &AuthContext) -> AuthContext {
		if !self.enabled || !ctx.is_authenticated() {
			return ctx.clone();
		}

		let tenant_key = ctx.tenant.clone().unwrap_or_default();
		let cache_key = (ctx.user_id.clone(), tenant_key.clone());

		if let Some(cache) = &self.cache {
			if let Some(hit) = cache.get(&cache_key).await {
				debug!(user_id = %ctx.user_id, "roles cache hit");
				return apply(ctx, &hit);
			}
		}

		let user_id = ctx.user_id.clone();
		let tenant = ctx.tenant.clone();
		let base_url = self.base_url.clone();
		let http = self.http.clone();

		let result = call(&self.breaker, &self.resilience, move || {
			let user_id = user_id.clone();
			let tenant = tenant.clone();
			let base_url = base_url.clone();
			let http = http.clone();
			async move { fetch_roles(&http, &base_url, &user_id, tenant.as_deref()).await }
		})
		.await;

		match result {
			Ok(resp) => {
				if let Some(cache) = &self.cache {
					cache.insert(cache_key, resp.clone()).await;
				}
				apply(ctx, &resp)
			},
			Err(ResilienceOutcome::BreakerOpen) => {
				warn!(user_id = %ctx.user_id, "roles service breaker open, falling back to token-only roles");
				ctx.clone()
			},
			Err(_) => {
				warn!(user_id = %ctx.user_id, "roles service call failed, falling back to token-only roles");
				ctx.clone()
			},
		}
	}
}

fn apply(ctx: &AuthContext, resp: &RolesResponse) -> AuthContext {
	ctx.with_enrichment(&resp.roles, &resp.permissions, resp.tenant.as_deref())
}

async fn fetch_roles(http: &reqwest::Client, base_url: &str, user_id: &str, tenant: Option<&str>) -> Result<RolesResponse, String> {
	let url = format!("{base_url}/api/v1/users/{user_id}/roles");
	let mut req = http.get(&url);
	if let Some(t) = tenant {
		if !t.is_empty() {
			req = req.header("X-Tenant-ID", t);
		}
	}
	let resp = req.send().await.map_err(|e| e.to_string())?;
	if !resp.status().is_success() {
		return Err(format!("roles service returned status {}", resp.status()));
	}
	let wire: RolesServiceWireResponse = resp.json().await.map_err(|e| e.to_string())?;
	Ok(wire.into())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeSet;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn enabled_cfg(base_url: String) -> RolesServiceConfig {
		RolesServiceConfig {
			enabled: true,
			base_url,
			timeout: Duration::from_millis(500),
			cache_ttl: Duration::from_secs(60),
			cache_disabled: false,
		}
	}

	#[tokio::test]
	async fn enrich_anonymous_is_noop() {
		let enricher = RolesEnricher::new(&enabled_cfg("http://127.0.0.1:1".into()), reqwest::Client::new());
		let anon = AuthContext::anonymous();
		let out = enricher.enrich(&anon).await;
		assert_eq!(out.user_id, anon.user_id);
	}

	#[tokio::test]
	async fn enrich_unions_roles_from_service() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/api/v1/users/u1/roles"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"userId": "u1",
				"roles": ["admin"],
				"permissions": ["read:x"],
				"tenant": "acme",
			})))
			.mount(&server)
			.await;

		let enricher = RolesEnricher::new(&enabled_cfg(server.uri()), reqwest::Client::new());
		let mut ctx = AuthContext::anonymous();
		ctx.user_id = "u1".into();
		ctx.roles = BTreeSet::from(["user".to_string()]);

		let out = enricher.enrich(&ctx).await;
		assert!(out.roles.contains("user"));
		assert!(out.roles.contains("admin"));
		assert!(out.permissions.contains("read:x"));
		assert_eq!(out.tenant.as_deref(), Some("acme"));
	}

	#[tokio::test]
	async fn enrich_falls_back_to_original_on_failure() {
		let enricher = RolesEnricher::new(&enabled_cfg("http://127.0.0.1:1".into()), reqwest::Client::new());
		let mut ctx = AuthContext::anonymous();
		ctx.user_id = "u1".into();
		ctx.roles = BTreeSet::from(["user".to_string()]);

		let out = enricher.enrich(&ctx).await;
		assert_eq!(out.roles, ctx.roles);
	}
}
