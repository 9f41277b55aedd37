//! The immutable configuration record. Read once at startup from a YAML
//! file; never mutated afterwards (hot-reload is limited to policy
//! artifacts, not config). Only the bootstrap flags in `gateway-app`'s
//! `Args` (config path, log level, listen addresses) are environment-
//! overridable via `clap`'s `env` attribute — the YAML body itself is not.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sidecar_core::duration::{serde_dur, serde_dur_option};

fn default_true() -> bool {
	true
}

fn default_proxy_target() -> String {
	"http://localhost:8081".to_string()
}

fn default_public_paths() -> Vec<String> {
	vec!["/api/public/**".to_string()]
}

fn default_reserved_prefixes() -> Vec<String> {
	vec![
		"/q/**".to_string(),
		"/health".to_string(),
		"/metrics".to_string(),
		"/ready".to_string(),
		"/live".to_string(),
	]
}

fn default_forward_headers() -> Vec<String> {
	vec![
		"X-Request-ID".to_string(),
		"X-Correlation-ID".to_string(),
		"X-Forwarded-For".to_string(),
		"X-Forwarded-Proto".to_string(),
	]
}

fn default_sensitive_headers() -> Vec<String> {
	vec!["Authorization".to_string(), "Cookie".to_string(), "X-Api-Key".to_string()]
}

fn default_decision_path() -> String {
	"/v1/data/authz/allow".to_string()
}

fn default_entrypoint() -> String {
	"authz/allow".to_string()
}

fn default_roles_timeout() -> Duration {
	Duration::from_millis(3000)
}

fn default_policy_timeout() -> Duration {
	Duration::from_secs(3)
}

fn default_proxy_timeout() -> Duration {
	Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
	Duration::from_secs(2)
}

fn default_request_budget() -> Duration {
	Duration::from_secs(10)
}

fn default_cache_ttl() -> Duration {
	Duration::from_secs(300)
}

fn default_reload_debounce() -> Duration {
	Duration::from_millis(500)
}

fn default_sweep_interval() -> Duration {
	Duration::from_secs(300)
}

fn default_shutdown_grace() -> Duration {
	Duration::from_secs(15)
}

fn default_max_buckets() -> usize {
	10_000
}

fn default_requests_per_second() -> f64 {
	10.0
}

fn default_burst_size() -> u32 {
	20
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
	#[default]
	Embedded,
	External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantProfileConfig {
	pub issuer: String,
	pub audiences: Vec<String>,
	pub jwks_uri: String,
	#[serde(default = "default_algorithms")]
	pub algorithms: Vec<String>,
	#[serde(default, with = "serde_dur_option")]
	pub jwks_refresh_interval: Option<Duration>,
}

fn default_algorithms() -> Vec<String> {
	vec!["RS256".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_public_paths")]
	pub public_paths: Vec<String>,
	#[serde(default = "default_reserved_prefixes")]
	pub reserved_prefixes: Vec<String>,
	pub tenants: HashMap<String, TenantProfileConfig>,
}

impl Default for AuthConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			public_paths: default_public_paths(),
			reserved_prefixes: default_reserved_prefixes(),
			tenants: HashMap::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesServiceConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub base_url: String,
	#[serde(default = "default_roles_timeout", with = "serde_dur")]
	pub timeout: Duration,
	#[serde(default = "default_cache_ttl", with = "serde_dur")]
	pub cache_ttl: Duration,
	#[serde(default)]
	pub cache_disabled: bool,
}

impl Default for RolesServiceConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			base_url: String::new(),
			timeout: default_roles_timeout(),
			cache_ttl: default_cache_ttl(),
			cache_disabled: false,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub mode: PolicyMode,
	/// Bind-mount policy directory, checked first.
	#[serde(default)]
	pub policy_dir: Option<String>,
	/// Dev-time fallback source directory.
	#[serde(default)]
	pub dev_policy_dir: Option<String>,
	/// Rego rule path passed to `opa build -e` when compiling sources.
	#[serde(default = "default_entrypoint")]
	pub entrypoint: String,
	#[serde(default)]
	pub decision_url: String,
	#[serde(default = "default_decision_path")]
	pub decision_path: String,
	#[serde(default = "default_policy_timeout", with = "serde_dur")]
	pub timeout: Duration,
	#[serde(default = "default_cache_ttl", with = "serde_dur")]
	pub cache_ttl: Duration,
}

impl Default for PolicyConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			mode: PolicyMode::Embedded,
			policy_dir: None,
			dev_policy_dir: None,
			entrypoint: default_entrypoint(),
			decision_url: String::new(),
			decision_path: default_decision_path(),
			timeout: default_policy_timeout(),
			cache_ttl: default_cache_ttl(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_requests_per_second")]
	pub requests_per_second: f64,
	#[serde(default = "default_burst_size")]
	pub burst_size: u32,
	#[serde(default = "default_max_buckets")]
	pub max_buckets: usize,
	#[serde(default = "default_sweep_interval", with = "serde_dur")]
	pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			requests_per_second: default_requests_per_second(),
			burst_size: default_burst_size(),
			max_buckets: default_max_buckets(),
			sweep_interval: default_sweep_interval(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_sensitive_headers")]
	pub sensitive_headers: Vec<String>,
}

impl Default for AuditConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			sensitive_headers: default_sensitive_headers(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
	#[serde(default = "default_proxy_target")]
	pub target: String,
	#[serde(default = "default_forward_headers")]
	pub forward_headers: Vec<String>,
	#[serde(default)]
	pub header_templates: Option<HashMap<String, String>>,
	#[serde(default = "default_proxy_timeout", with = "serde_dur")]
	pub read_timeout: Duration,
	#[serde(default = "default_connect_timeout", with = "serde_dur")]
	pub connect_timeout: Duration,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			target: default_proxy_target(),
			forward_headers: default_forward_headers(),
			header_templates: None,
			read_timeout: default_proxy_timeout(),
			connect_timeout: default_connect_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigModel {
	pub proxy: ProxyConfig,
	pub auth: AuthConfig,
	pub roles: RolesServiceConfig,
	pub policy: PolicyConfig,
	pub rate_limit: RateLimitConfig,
	pub audit: AuditConfig,
	#[serde(with = "serde_dur", default = "default_request_budget")]
	pub request_budget: Duration,
	#[serde(with = "serde_dur", default = "default_shutdown_grace")]
	pub shutdown_grace: Duration,
	#[serde(with = "serde_dur", default = "default_reload_debounce")]
	pub reload_debounce: Duration,
}

impl ConfigModel {
	pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
		serde_yaml::from_str(s)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_from_empty_document() {
		let cfg = ConfigModel::from_yaml("{}").unwrap();
		assert_eq!(cfg.proxy.target, "http://localhost:8081");
		assert!(cfg.auth.enabled);
		assert_eq!(cfg.rate_limit.max_buckets, 10_000);
	}

	#[test]
	fn parses_go_style_durations() {
		let yaml = r#"
policy:
  timeout: "5s"
rate_limit:
  sweep_interval: "1m"
"#;
		let cfg = ConfigModel::from_yaml(yaml).unwrap();
		assert_eq!(cfg.policy.timeout, Duration::from_secs(5));
		assert_eq!(cfg.rate_limit.sweep_interval, Duration::from_secs(60));
	}
}
