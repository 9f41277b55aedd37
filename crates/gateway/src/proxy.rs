//! Reverse-proxy forwarding to the loopback backend: header whitelist
//! propagation, `X-Auth-*` principal header injection, read/connect
//! timeouts, and a structured 503 fallback on any transport failure.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::config::ProxyConfig;
use crate::errors::GatewayError;
use crate::model::AuthContext;

/// Hop-by-hop headers the transport re-sets; stripped both directions per
/// spec.md §4.8's step 7.
const HOP_BY_HOP: &[&str] = &["transfer-encoding", "content-length", "connection", "keep-alive"];

pub struct Proxy {
	http: reqwest::Client,
	target: String,
	forward_headers: Vec<String>,
	header_templates: Option<HashMap<String, String>>,
}

pub struct ProxiedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl Proxy {
	pub fn new(cfg: &ProxyConfig) -> Self {
		let http = reqwest::Client::builder()
			.connect_timeout(cfg.connect_timeout)
			.timeout(cfg.read_timeout)
			.build()
			.expect("reqwest client with static timeouts should always build");
		Self {
			http,
			target: cfg.target.trim_end_matches('/').to_string(),
			forward_headers: cfg.forward_headers.clone(),
			header_templates: cfg.header_templates.clone(),
		}
	}

	pub async fn forward(
		&self,
		method: &Method,
		path_and_query: &str,
		inbound_headers: &HeaderMap,
		body: Bytes,
		ctx: &AuthContext,
	) -> Result<ProxiedResponse, GatewayError> {
		let url = format!("{}{}", self.target, path_and_query);
		let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).map_err(|e| GatewayError::Internal(e.to_string()))?;

		let mut builder = self.http.request(reqwest_method, &url);
		builder = builder.header(reqwest::header::CONTENT_TYPE, content_type_or_default(inbound_headers));

		for name in &self.forward_headers {
			if let Some(v) = inbound_headers.get(name.as_str()) {
				builder = builder.header(name.as_str(), v.as_bytes());
			}
		}
		if let Some(accept) = inbound_headers.get(http::header::ACCEPT) {
			builder = builder.header(http::header::ACCEPT.as_str(), accept.as_bytes());
		}
		for (name, value) in principal_headers(ctx, &self.header_templates) {
			builder = builder.header(name, value);
		}

		builder = builder.body(body);

		let resp = builder.send().await.map_err(|e| GatewayError::UpstreamUnavailable { detail: e.to_string() })?;

		let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
		let mut out_headers = HeaderMap::new();
		for (name, value) in resp.headers().iter() {
			if HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()) {
				continue;
			}
			if let (Ok(n), Ok(v)) = (HeaderName::from_bytes(name.as_str().as_bytes()), HeaderValue::from_bytes(value.as_bytes())) {
				out_headers.append(n, v);
			}
		}
		let body = resp.bytes().await.map_err(|e| GatewayError::UpstreamUnavailable { detail: e.to_string() })?;

		Ok(ProxiedResponse { status, headers: out_headers, body })
	}
}

fn content_type_or_default(headers: &HeaderMap) -> Vec<u8> {
	headers
		.get(http::header::CONTENT_TYPE)
		.map(|v| v.as_bytes().to_vec())
		.unwrap_or_else(|| b"application/octet-stream".to_vec())
}

/// Default principal headers per spec.md §4.9, or the configured templates
/// with `${user.id}`/`${user.email}`/`${user.roles}`/`${user.tenant}`/
/// `${user.name}` placeholders substituted (empty string for absent fields).
fn principal_headers(ctx: &AuthContext, templates: &Option<HashMap<String, String>>) -> Vec<(String, String)> {
	let roles = ctx.roles.iter().cloned().collect::<Vec<_>>().join(",");
	let values: BTreeMap<&str, String> = BTreeMap::from([
		("${user.id}", ctx.user_id.clone()),
		("${user.email}", ctx.email.clone().unwrap_or_default()),
		("${user.roles}", roles),
		("${user.tenant}", ctx.tenant.clone().unwrap_or_default()),
		("${user.name}", ctx.name.clone().unwrap_or_default()),
	]);

	if let Some(templates) = templates {
		templates
			.iter()
			.map(|(header, template)| {
				let mut rendered = template.clone();
				for (placeholder, value) in &values {
					rendered = rendered.replace(placeholder, value);
				}
				(header.clone(), rendered)
			})
			.collect()
	} else {
		vec![
			("X-Auth-User-Id".to_string(), values["${user.id}"].clone()),
			("X-Auth-User-Email".to_string(), values["${user.email}"].clone()),
			("X-Auth-User-Roles".to_string(), values["${user.roles}"].clone()),
			("X-Auth-Tenant".to_string(), values["${user.tenant}"].clone()),
		]
	}
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for name in HOP_BY_HOP {
		headers.remove(*name);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeSet;

	fn ctx() -> AuthContext {
		let mut c = AuthContext::anonymous();
		c.user_id = "u1".into();
		c.email = Some("u1@example.com".into());
		c.roles = BTreeSet::from(["admin".to_string(), "user".to_string()]);
		c.tenant = Some("acme".into());
		c
	}

	#[test]
	fn default_principal_headers() {
		let headers = principal_headers(&ctx(), &None);
		let map: HashMap<_, _> = headers.into_iter().collect();
		assert_eq!(map["X-Auth-User-Id"], "u1");
		assert_eq!(map["X-Auth-User-Email"], "u1@example.com");
		assert_eq!(map["X-Auth-User-Roles"], "admin,user");
		assert_eq!(map["X-Auth-Tenant"], "acme");
	}

	#[test]
	fn templated_principal_headers_substitute_placeholders() {
		let templates = HashMap::from([("X-Custom".to_string(), "${user.id}:${user.tenant}".to_string())]);
		let headers = principal_headers(&ctx(), &Some(templates));
		assert_eq!(headers[0].1, "u1:acme");
	}

	#[test]
	fn templated_headers_substitute_empty_for_absent_fields() {
		let anon = AuthContext::anonymous();
		let templates = HashMap::from([("X-Custom".to_string(), "[${user.email}]".to_string())]);
		let headers = principal_headers(&anon, &Some(templates));
		assert_eq!(headers[0].1, "[]");
	}
}
