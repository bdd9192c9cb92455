//! Downstream dependency capabilities.
//!
//! A capability is the only thing a worker knows about a dependency: it takes
//! a payload and an attempt budget and returns a JSON result or an
//! [`InvokeError`] classified by [`FailureKind`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use conduit_core::{Error, FailureKind, InvokeError, InvokeResult, JobKind, Result};

/// A downstream dependency jobs are dispatched to.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Dependency name; also the circuit breaker key.
    fn name(&self) -> &str;

    /// Invoke for a single payload within `timeout`.
    async fn invoke(&self, kind: JobKind, payload: &JsonValue, timeout: Duration) -> InvokeResult;

    /// Invoke for several payloads in one call.
    ///
    /// The returned outcomes must be positionally aligned with `payloads`.
    /// The default fans out to [`Capability::invoke`] concurrently.
    async fn invoke_batch(
        &self,
        kind: JobKind,
        payloads: &[JsonValue],
        timeout: Duration,
    ) -> Vec<InvokeResult> {
        join_all(payloads.iter().map(|p| self.invoke(kind, p, timeout))).await
    }
}

/// Named set of capabilities available to workers.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its own name, replacing any previous one.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn get(&self, dependency: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(dependency).cloned()
    }

    pub fn contains(&self, dependency: &str) -> bool {
        self.capabilities.contains_key(dependency)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("dependencies", &self.names())
            .finish()
    }
}

/// Capability that returns its input, for smoke tests and local runs.
pub struct EchoCapability {
    name: String,
}

impl EchoCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, kind: JobKind, payload: &JsonValue, _timeout: Duration) -> InvokeResult {
        Ok(json!({ "job_kind": kind, "echo": payload }))
    }
}

// =============================================================================
// HTTP CAPABILITY
// =============================================================================

#[derive(Serialize)]
struct InvokeRequest<'a> {
    job_kind: JobKind,
    payload: &'a JsonValue,
}

#[derive(Serialize)]
struct BatchInvokeRequest<'a> {
    job_kind: JobKind,
    payloads: &'a [JsonValue],
}

#[derive(Deserialize)]
struct BatchInvokeResponse {
    results: Vec<BatchItem>,
}

/// One positional entry of a batch response.
#[derive(Deserialize)]
#[serde(untagged)]
enum BatchItem {
    Error { error: BatchItemError },
    Output { output: JsonValue },
}

#[derive(Deserialize)]
struct BatchItemError {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: String,
}

/// Capability backed by an HTTP endpoint.
///
/// Single calls POST `{"job_kind", "payload"}` to `endpoint` and treat a 2xx
/// JSON body as the result. When a batch endpoint is configured, batches POST
/// `{"job_kind", "payloads"}` there and expect `{"results": [...]}` with one
/// `{"output": ..}` or `{"error": {"status", "message"}}` per payload.
pub struct HttpCapability {
    name: String,
    endpoint: String,
    batch_endpoint: Option<String>,
    client: Client,
}

impl HttpCapability {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            batch_endpoint: None,
            client,
        })
    }

    pub fn with_batch_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.batch_endpoint = Some(endpoint.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn transport_error(err: reqwest::Error) -> InvokeError {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if let Some(status) = err.status() {
            FailureKind::from_status(status.as_u16())
        } else if err.is_decode() {
            FailureKind::ServerError
        } else {
            FailureKind::Connection
        };
        InvokeError::new(kind, format!("Request failed: {}", err))
    }

    async fn status_error(response: reqwest::Response) -> InvokeError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        InvokeError::new(
            FailureKind::from_status(status.as_u16()),
            format!("Dependency returned {}: {}", status, body.trim()),
        )
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> std::result::Result<reqwest::Response, InvokeError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Capability for HttpCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, kind: JobKind, payload: &JsonValue, timeout: Duration) -> InvokeResult {
        let request = InvokeRequest {
            job_kind: kind,
            payload,
        };
        let response = self.post(&self.endpoint, &request, timeout).await?;
        let bytes = response.bytes().await.map_err(Self::transport_error)?;
        if bytes.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            InvokeError::new(
                FailureKind::ServerError,
                format!("Failed to parse response: {}", e),
            )
        })
    }

    async fn invoke_batch(
        &self,
        kind: JobKind,
        payloads: &[JsonValue],
        timeout: Duration,
    ) -> Vec<InvokeResult> {
        let Some(batch_endpoint) = &self.batch_endpoint else {
            return join_all(payloads.iter().map(|p| self.invoke(kind, p, timeout))).await;
        };

        let request = BatchInvokeRequest {
            job_kind: kind,
            payloads,
        };
        let parsed = match self.post(batch_endpoint, &request, timeout).await {
            Ok(response) => response.json::<BatchInvokeResponse>().await.map_err(|e| {
                InvokeError::new(
                    FailureKind::ServerError,
                    format!("Failed to parse batch response: {}", e),
                )
            }),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(body) => {
                debug!(
                    subsystem = "jobs",
                    component = "capability",
                    dependency = %self.name,
                    requested = payloads.len(),
                    returned = body.results.len(),
                    "Batch call returned"
                );
                body.results
                    .into_iter()
                    .map(|item| match item {
                        BatchItem::Output { output } => Ok(output),
                        BatchItem::Error { error } => Err(InvokeError::new(
                            error
                                .status
                                .map(FailureKind::from_status)
                                .unwrap_or(FailureKind::ServerError),
                            error.message,
                        )),
                    })
                    .collect()
            }
            // A failed call fails every member the same way.
            Err(e) => payloads.iter().map(|_| Err(e.clone())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_round_trips_payload() {
        let echo = EchoCapability::new("echo");
        let out = echo
            .invoke(JobKind::Search, &json!({"q": "rust"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["echo"]["q"], "rust");
        assert_eq!(out["job_kind"], "search");
    }

    #[tokio::test]
    async fn test_default_batch_is_positional() {
        let echo = EchoCapability::new("echo");
        let payloads = vec![json!(1), json!(2), json!(3)];
        let out = echo
            .invoke_batch(JobKind::Embedding, &payloads, Duration::from_secs(1))
            .await;
        let echoed: Vec<JsonValue> = out.into_iter().map(|r| r.unwrap()["echo"].clone()).collect();
        assert_eq!(echoed, payloads);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(EchoCapability::new("b")));
        registry.register(Arc::new(EchoCapability::new("a")));
        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }
}
