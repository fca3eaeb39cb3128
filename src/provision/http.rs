//! HTTP provisioner.
//!
//! Posts JSON to `<endpoint>/apply` and `<endpoint>/destroy`. Only `429 Too
//! Many Requests` is retried. Every other failure surfaces to the executor.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::ProvisionError;

use super::{DestroyRequest, ProvisionOutput, ProvisionRequest, Provisioner, StepResult};

/// Maximum number of attempts for rate-limited requests.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff when the server gives no `Retry-After`.
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Longest `Retry-After` honored before giving up.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// Provisioner backed by an HTTP control-plane endpoint.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpProvisioner {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> StepResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post<B, T>(&self, operation: &str, body: &B) -> StepResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(operation, body).await {
                Err(ProvisionError::RateLimited { retry_after_secs })
                    if attempt < MAX_ATTEMPTS && retry_after_secs <= MAX_RETRY_AFTER_SECS =>
                {
                    let delay = if retry_after_secs == 0 {
                        Duration::from_millis(DEFAULT_RETRY_DELAY_MS * u64::from(attempt))
                    } else {
                        Duration::from_secs(retry_after_secs)
                    };
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Provisioner rate limited, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn post_once<B, T>(&self, operation: &str, body: &B) -> StepResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}/{operation}", self.endpoint);
        trace!("POST {url}");

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProvisionError::network(format!("Request to {url} failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or_default();
            return Err(ProvisionError::RateLimited { retry_after_secs });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProvisionError::rejected(
                status.as_u16(),
                "Provisioner refused credentials",
            ));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::rejected(status.as_u16(), body));
        }

        if status == StatusCode::NO_CONTENT {
            return serde_json::from_value(serde_json::Value::Null).map_err(|e| {
                ProvisionError::InvalidResponse {
                    message: format!("Empty response from {url}: {e}"),
                }
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProvisionError::InvalidResponse {
                message: format!("Failed to parse response from {url}: {e}"),
            })
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn apply(&self, request: &ProvisionRequest) -> StepResult<ProvisionOutput> {
        debug!(module = %request.module, action = ?request.action, "Provisioning over HTTP");
        self.post("apply", request).await
    }

    async fn destroy(&self, request: &DestroyRequest) -> StepResult<()> {
        debug!(module = %request.module, "Destroying over HTTP");
        let _: serde_json::Value = self.post("destroy", request).await?;
        Ok(())
    }

    fn driver(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::ProvisionAction;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            environment: String::from("staging"),
            module: String::from("cluster"),
            kind: String::from("cluster"),
            action: ProvisionAction::Update,
            inputs: BTreeMap::from([(String::from("size"), json!(3))]),
            prior_fingerprint: Some(String::from("old")),
            fingerprint: String::from("new"),
            declared_outputs: vec![String::from("endpoint")],
        }
    }

    fn client(server: &MockServer) -> HttpProvisioner {
        HttpProvisioner::new(
            &format!("{}/", server.uri()),
            Some(String::from("s3cret")),
            Duration::from_secs(5),
        )
        .expect("client builds")
    }

    #[tokio::test]
    async fn test_apply_posts_request_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apply"))
            .and(header("authorization", "Bearer s3cret"))
            .and(body_partial_json(json!({
                "module": "cluster",
                "action": "update",
                "prior_fingerprint": "old",
                "inputs": { "size": 3 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": { "endpoint": "https://cluster.internal" },
                "fingerprint": "new"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let output = client(&server).apply(&request()).await.expect("apply succeeds");
        assert_eq!(output.outputs["endpoint"], json!("https://cluster.internal"));
        assert_eq!(output.fingerprint.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apply"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/apply"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": { "endpoint": "e" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let output = client(&server).apply(&request()).await.expect("succeeds after retry");
        assert_eq!(output.outputs["endpoint"], json!("e"));
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apply"))
            .respond_with(ResponseTemplate::new(500).set_body_string("quota exceeded"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).apply(&request()).await.unwrap_err();
        assert_eq!(err, ProvisionError::rejected(500, "quota exceeded"));
    }

    #[tokio::test]
    async fn test_destroy_accepts_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/destroy"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let request = DestroyRequest {
            environment: String::from("staging"),
            module: String::from("cluster"),
            kind: String::from("cluster"),
            prior_outputs: BTreeMap::new(),
            prior_fingerprint: String::from("old"),
        };
        client(&server).destroy(&request).await.expect("destroy succeeds");
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apply"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server).apply(&request()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidResponse { .. }));
    }
}
