//! ARM-style REST control plane over HTTP
//!
//! `PUT {endpoint}{path}?api-version=..` creates or updates a resource and
//! `GET` reads it. A bearer token is taken from `HUBCTL_TOKEN` when set.

use converge::{ApplyRequest, ApplyResponse, CloudClient, CloudError, WriteOutcome};
use serde_json::Value;
use std::time::Duration;

pub const TOKEN_ENV: &str = "HUBCTL_TOKEN";
const API_VERSION: &str = "2024-05-01";

pub struct HttpCloud {
    agent: ureq::Agent,
    endpoint: String,
    /// Path part of the endpoint, e.g. `/subscriptions/../resourceGroups/hub`
    scope: String,
    token: Option<String>,
}

impl HttpCloud {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        // Status codes are classified here, not by ureq
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(120)))
            .build()
            .into();
        let endpoint: String = endpoint.into();
        let endpoint = endpoint.trim_end_matches('/').to_string();
        Self {
            agent,
            scope: endpoint_scope(&endpoint).to_string(),
            endpoint,
            token,
        }
    }

    /// Endpoint with the token from the environment
    pub fn from_env(endpoint: impl Into<String>) -> Self {
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            log::warn!("{TOKEN_ENV} is not set; sending unauthenticated requests");
        }
        Self::new(endpoint, token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?api-version={}", self.endpoint, path, API_VERSION)
    }

    fn authorization(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

/// Everything after the host: `https://h/subscriptions/s` gives `/subscriptions/s`.
fn endpoint_scope(endpoint: &str) -> &str {
    let rest = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    rest.find('/').map_or("", |i| &rest[i..])
}

fn transport_error(path: &str, err: &ureq::Error) -> CloudError {
    CloudError::Unknown {
        message: format!("request for {path} failed: {err}"),
    }
}

/// Seconds from a `Retry-After` header.
fn retry_after(response: &ureq::http::Response<ureq::Body>) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pull `error.message` out of an ARM error body, or use the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

fn classify(
    path: &str,
    mut response: ureq::http::Response<ureq::Body>,
) -> Result<(u16, Value), CloudError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        let body: Value = response
            .body_mut()
            .read_json()
            .map_err(|e| transport_error(path, &e))?;
        return Ok((status, body));
    }

    let hint = retry_after(&response);
    let text = response.body_mut().read_to_string().unwrap_or_default();
    Err(CloudError::from_status(status, path, error_message(&text), hint))
}

impl CloudClient for HttpCloud {
    fn create_or_update(&self, request: &ApplyRequest) -> Result<ApplyResponse, CloudError> {
        let url = self.url(&request.path);
        log::debug!("PUT {url}");

        let mut builder = self
            .agent
            .put(&url)
            .header("Content-Type", "application/json");
        if let Some(auth) = self.authorization() {
            builder = builder.header("Authorization", auth);
        }
        let response = builder
            .send_json(&request.document)
            .map_err(|e| transport_error(&request.path, &e))?;

        let (status, document) = classify(&request.path, response)?;
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| self.resource_id(&request.path), str::to_string);
        Ok(ApplyResponse {
            id,
            outcome: if status == 201 {
                WriteOutcome::Created
            } else {
                WriteOutcome::Updated
            },
            document,
        })
    }

    fn get(&self, kind: &str, path: &str) -> Result<Option<Value>, CloudError> {
        let url = self.url(path);
        log::debug!("GET {url} ({kind})");

        let mut builder = self.agent.get(&url);
        if let Some(auth) = self.authorization() {
            builder = builder.header("Authorization", auth);
        }
        let response = builder.call().map_err(|e| transport_error(path, &e))?;

        match classify(path, response) {
            Ok((_, document)) => Ok(Some(document)),
            Err(CloudError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn resource_id(&self, path: &str) -> String {
        format!("{}{}", self.scope, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let cloud = HttpCloud::new("https://cp.example.test/", None);
        assert_eq!(
            cloud.url("/ipGroups/g"),
            "https://cp.example.test/ipGroups/g?api-version=2024-05-01"
        );
        assert!(cloud.authorization().is_none());
    }

    #[test]
    fn test_resource_ids_carry_the_endpoint_scope() {
        let scoped = "https://management.example.test/subscriptions/s1/resourceGroups/hub/providers/Microsoft.Network/";
        let cloud = HttpCloud::new(scoped, None);
        assert_eq!(
            cloud.resource_id("/firewallPolicies/contoso-fw-policy"),
            "/subscriptions/s1/resourceGroups/hub/providers/Microsoft.Network/firewallPolicies/contoso-fw-policy"
        );

        let bare = HttpCloud::new("http://localhost:8080", None);
        assert_eq!(bare.resource_id("/ipGroups/g"), "/ipGroups/g");
    }

    #[test]
    fn test_id_references_resolve_to_scoped_ids() {
        use converge::{ExternalReference, KindRegistry, KindSpec, NodeSpec, resolve_all};

        let mut kinds = KindRegistry::new();
        kinds.register(KindSpec::new("firewallPolicies"));
        kinds.register(KindSpec::new("azureFirewalls"));
        let policy = kinds
            .construct(NodeSpec::new("policy", "firewallPolicies", "fw-policy").location("westeurope"))
            .unwrap();
        let firewall = kinds
            .construct(NodeSpec::new("fw", "azureFirewalls", "fw").location("westeurope"))
            .unwrap()
            .bind(
                "/properties/firewallPolicy/id",
                ExternalReference::id_of("policy", "firewallPolicies"),
            );
        let mut nodes = vec![policy, firewall];

        let cloud = HttpCloud::new("https://cp.example.test/subscriptions/s1/resourceGroups/hub", None);
        resolve_all(&mut nodes, &cloud).unwrap();
        assert_eq!(
            nodes[1].properties()["firewallPolicy"]["id"],
            "/subscriptions/s1/resourceGroups/hub/firewallPolicies/fw-policy"
        );
    }

    #[test]
    fn test_authorization_header() {
        let cloud = HttpCloud::new("http://localhost", Some("abc".into()));
        assert_eq!(cloud.authorization().as_deref(), Some("Bearer abc"));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":{"code":"AnotherOperationInProgress","message":"busy"}}"#),
            "busy"
        );
        assert_eq!(error_message("  plain text \n"), "plain text");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            CloudError::from_status(409, "/a", error_message("{}"), None),
            CloudError::Conflict { .. }
        ));
        assert!(CloudError::from_status(429, "/a", "", Some(Duration::from_secs(3))).is_retryable());
    }
}
