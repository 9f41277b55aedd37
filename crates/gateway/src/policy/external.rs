//! External decision-service backend: POSTs `{"input": <PolicyInput>}` to
//! `<url><decisionPath>` and parses the response with the same interpretation
//! rules as the embedded backend.

use serde::Serialize;

use crate::model::PolicyInput;
use crate::policy::RawResult;

#[derive(Serialize)]
struct DecisionRequest<'a> {
	input: &'a PolicyInput,
}

pub struct ExternalBackend {
	http: reqwest::Client,
	url: String,
}

impl ExternalBackend {
	pub fn new(http: reqwest::Client, base_url: String, decision_path: String) -> Self {
		let url = format!("{}{}", base_url.trim_end_matches('/'), decision_path);
		Self { http, url }
	}

	pub async fn evaluate_once(&self, input: &PolicyInput) -> Result<crate::model::PolicyDecision, String> {
		let resp = self
			.http
			.post(&self.url)
			.json(&DecisionRequest { input })
			.send()
			.await
			.map_err(|e| e.to_string())?;

		if !resp.status().is_success() {
			return Err(format!("Decision service returned status {}", resp.status()));
		}

		#[derive(serde::Deserialize)]
		struct Envelope {
			result: RawResult,
		}
		let envelope: Envelope = resp.json().await.map_err(|e| e.to_string())?;
		Ok(crate::policy::interpret(envelope.result))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{PolicyInputContext, PolicyInputRequest, PolicyInputResource, PolicyInputUser};
	use wiremock::matchers::{body_json, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn input() -> PolicyInput {
		PolicyInput {
			request: PolicyInputRequest {
				method: "GET".into(),
				path: "/api/users/1".into(),
				headers: Default::default(),
				query_params: Default::default(),
			},
			user: PolicyInputUser {
				id: "u1".into(),
				email: None,
				roles: Default::default(),
				permissions: Default::default(),
				tenant: None,
			},
			resource: PolicyInputResource {
				resource_type: Some("users".into()),
				id: Some("1".into()),
				action: "GET".into(),
			},
			context: PolicyInputContext {
				timestamp: 0,
				source: "sidecar".into(),
			},
		}
	}

	#[tokio::test]
	async fn allow_bool_result() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/data/authz/allow"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": true})))
			.mount(&server)
			.await;

		let backend = ExternalBackend::new(reqwest::Client::new(), server.uri(), "/v1/data/authz/allow".into());
		let decision = backend.evaluate_once(&input()).await.unwrap();
		assert!(decision.allowed);
	}

	#[tokio::test]
	async fn non_200_is_error() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/data/authz/allow"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let backend = ExternalBackend::new(reqwest::Client::new(), server.uri(), "/v1/data/authz/allow".into());
		let err = backend.evaluate_once(&input()).await.unwrap_err();
		assert!(err.contains("500"));
	}

	#[tokio::test]
	async fn request_body_carries_input() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/data/authz/allow"))
			.and(body_json(serde_json::json!({"input": input()})))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": {"allow": false, "reason": "nope"}})))
			.mount(&server)
			.await;

		let backend = ExternalBackend::new(reqwest::Client::new(), server.uri(), "/v1/data/authz/allow".into());
		let decision = backend.evaluate_once(&input()).await.unwrap();
		assert!(!decision.allowed);
		assert_eq!(decision.reason.as_deref(), Some("nope"));
	}
}
