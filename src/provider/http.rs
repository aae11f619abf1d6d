//! JSON REST provider.
//!
//! Routes:
//!
//! - `POST   /v1/resources/{kind}`       create
//! - `GET    /v1/resources/{kind}/{id}`  read
//! - `PATCH  /v1/resources/{kind}/{id}`  update
//! - `DELETE /v1/resources/{kind}/{id}`  delete
//! - `GET    /v1/schemas`                optional kind schemas
//!
//! Retries are not done here; the executor owns the retry policy.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::schema::{KindSchema, SchemaRegistry};
use super::types::{ProviderResource, ResourceRequest};
use super::Provider;
use crate::error::{ProviderError, Result};

/// Retry delay assumed when a 429 carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Provider backed by a JSON REST API.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// Bearer token.
    token: Option<String>,
}

/// Body of create and update calls.
#[derive(Debug, Serialize)]
struct ResourceBody<'a> {
    name: &'a str,
    attributes: &'a BTreeMap<String, Value>,
}

impl HttpProvider {
    /// Creates a new HTTP provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        trace!("{} {}", method, url);

        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");

        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        builder: RequestBuilder,
        operation: &str,
    ) -> std::result::Result<Response, ProviderError> {
        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    operation: operation.to_string(),
                }
            } else {
                ProviderError::network(format!("Request failed: {e}"))
            }
        })
    }

    /// Maps a non-success response to a provider error.
    async fn error_for(response: Response, kind: &str, id: Option<&str>) -> ProviderError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return ProviderError::RateLimited {
                retry_after_secs: retry_after,
            };
        }

        let body = response.text().await.unwrap_or_default();
        let message = extract_message(&body);

        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout {
                operation: format!("{kind} request ({status})"),
            },
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE => ProviderError::Unavailable {
                status: status.as_u16(),
                message,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::AuthenticationFailed { message }
            }
            StatusCode::NOT_FOUND => match id {
                Some(id) => ProviderError::NotFound {
                    kind: kind.to_string(),
                    id: id.to_string(),
                },
                None => ProviderError::UnsupportedKind {
                    kind: kind.to_string(),
                },
            },
            _ => ProviderError::api_error(status.as_u16(), message),
        }
    }

    async fn parse_resource(
        response: Response,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        response
            .json::<ProviderResource>()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                message: format!("Failed to parse resource: {e}"),
            })
    }

    async fn resource_call(
        &self,
        method: Method,
        path: String,
        request: Option<&ResourceRequest>,
        kind: &str,
        id: Option<&str>,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        let operation = format!("{method} {path}");
        let mut builder = self.request(method, &path);
        if let Some(request) = request {
            builder = builder.json(&ResourceBody {
                name: &request.name,
                attributes: &request.attributes,
            });
        }

        let response = Self::send(builder, &operation).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, kind, id).await);
        }
        Self::parse_resource(response).await
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn schemas(&self) -> std::result::Result<SchemaRegistry, ProviderError> {
        let response = Self::send(self.request(Method::GET, "/v1/schemas"), "GET /v1/schemas").await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Provider publishes no schemas, using built-in schemas");
            return Ok(SchemaRegistry::builtin());
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response, "schemas", None).await);
        }

        let published: Vec<KindSchema> =
            response.json().await.map_err(|e| ProviderError::InvalidResponse {
                message: format!("Failed to parse schemas: {e}"),
            })?;
        debug!("Provider published {} schema(s)", published.len());

        let mut registry = SchemaRegistry::builtin();
        registry.merge(SchemaRegistry::from_schemas(published));
        Ok(registry)
    }

    async fn create(
        &self,
        request: &ResourceRequest,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        self.resource_call(
            Method::POST,
            format!("/v1/resources/{}", request.kind),
            Some(request),
            &request.kind,
            None,
        )
        .await
    }

    async fn read(
        &self,
        kind: &str,
        id: &str,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        self.resource_call(
            Method::GET,
            format!("/v1/resources/{kind}/{id}"),
            None,
            kind,
            Some(id),
        )
        .await
    }

    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        self.resource_call(
            Method::PATCH,
            format!("/v1/resources/{}/{id}", request.kind),
            Some(request),
            &request.kind,
            Some(id),
        )
        .await
    }

    async fn delete(&self, kind: &str, id: &str) -> std::result::Result<(), ProviderError> {
        let path = format!("/v1/resources/{kind}/{id}");
        let operation = format!("DELETE {path}");
        let response = Self::send(self.request(Method::DELETE, &path), &operation).await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(response, kind, Some(id)).await)
        }
    }
}

/// Pulls a human-readable message out of an error body.
fn extract_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ResourceRequest {
        ResourceRequest {
            kind: String::from("network"),
            name: String::from("main"),
            attributes: BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
        }
    }

    async fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(String::from("secret")), 5).expect("client")
    }

    #[tokio::test]
    async fn test_create_sends_attributes_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources/network"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"name": "main", "attributes": {"cidr_block": "10.0.0.0/16"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "net-0001",
                "attributes": {"cidr_block": "10.0.0.0/16"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server).await.create(&request()).await.expect("created");
        assert_eq!(created.id, "net-0001");
        assert_eq!(created.attributes["cidr_block"], json!("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server).await.create(&request()).await.expect_err("rate limited");
        assert!(err.is_transient());
        assert_eq!(err.retry_after_secs(), Some(7));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/subnet/sub-1"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"message": "try later"})))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "bad cidr"})))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = provider(&server).await;

        let unavailable = provider.read("subnet", "sub-1").await.expect_err("503");
        assert!(matches!(unavailable, ProviderError::Unavailable { status: 503, ref message } if message == "try later"));

        let rejected = provider.update("net-1", &request()).await.expect_err("400");
        assert!(!rejected.is_transient());
        assert!(matches!(rejected, ProviderError::ApiRequestFailed { status: 400, ref message } if message == "bad cidr"));

        let missing = provider.delete("network", "net-1").await.expect_err("404");
        assert!(matches!(missing, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_schemas_fall_back_to_builtin() {
        let server = MockServer::start().await;
        let schemas = provider(&server).await.schemas().await.expect("schemas");
        assert_eq!(schemas, SchemaRegistry::builtin());
    }

    #[tokio::test]
    async fn test_published_schemas_are_merged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/schemas"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"kind": "dns_record", "immutable": ["zone"]}
            ])))
            .mount(&server)
            .await;

        let schemas = provider(&server).await.schemas().await.expect("schemas");
        assert!(schemas.is_immutable("dns_record", "zone"));
        assert!(schemas.contains("network"));
    }
}
