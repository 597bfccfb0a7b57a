//! Typed client for the hybrid inference router.
//!
//! The router exposes its inference endpoint under several historical paths
//! depending on the deployment generation. This client walks the candidate
//! paths in a fixed order, treating 404 as "try the next path" and every
//! other failure as final. All outcomes are classified into [`RouterError`]
//! so callers can persist structured failure records instead of strings.

use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Candidate inference paths, probed in order. 404 moves to the next path;
/// any other outcome ends the walk.
pub const INFERENCE_PATHS: [&str; 4] = [
    "/inference",
    "/api/v1/inference",
    "/api/inference",
    "/v1/inference",
];

const DEFAULT_BASE_URL: &str = "https://project-beacon-production.up.railway.app";
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Maximum number of body bytes carried inside an [`RouterError::Http`].
const BODY_SNIPPET_LIMIT: usize = 2048;

// ============================================================================
// Configuration
// ============================================================================

/// Router connection settings, normally read from the environment.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Base URL of the router. Trailing slashes are trimmed.
    pub base_url: String,
    /// Request timeout applied to every HTTP call.
    pub timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl RouterConfig {
    /// Load from `HYBRID_ROUTER_URL` and `HYBRID_ROUTER_TIMEOUT` /
    /// `HYBRID_TIMEOUT` (seconds). `HYBRID_ROUTER_TIMEOUT` wins when both
    /// timeout variables are set.
    pub fn from_env() -> Self {
        let base_url = std::env::var("HYBRID_ROUTER_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let timeout_secs = std::env::var("HYBRID_ROUTER_TIMEOUT")
            .or_else(|_| std::env::var("HYBRID_TIMEOUT"))
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            base_url,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

// ============================================================================
// Request / Response types
// ============================================================================

/// A single inference call. The option set is closed; the router rejects
/// unknown fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_preference: Option<String>,
    pub cost_priority: bool,
}

/// Router response body. `success=false` is a router-layer failure, not a
/// transport failure, and is surfaced as [`RouterError::Router`] with the
/// full body attached so callers can persist the details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub success: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub provider_used: Option<String>,
    #[serde(default)]
    pub inference_time: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One entry from the router's `/providers` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub region: String,
    pub healthy: bool,
    #[serde(default)]
    pub cost_per_second: Option<f64>,
    #[serde(default)]
    pub avg_latency: Option<f64>,
    #[serde(default)]
    pub success_rate: Option<f64>,
    #[serde(default)]
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
}

// ============================================================================
// Errors
// ============================================================================

/// Classified router outcomes. Only `Timeout` maps an execution to the
/// `timeout` status; the rest map to `failed`.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Transport deadline exceeded.
    #[error("inference request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Transport failure other than a timeout.
    #[error("network error calling router: {0}")]
    Network(#[source] reqwest::Error),

    /// Every candidate path returned 404.
    #[error("no inference endpoint found (tried {tried:?})")]
    NotFound { tried: Vec<String> },

    /// Non-2xx, non-404 status. `body` is capped at 2 KiB; `metadata`
    /// carries rate-limit response headers when the router sent any.
    #[error("router returned HTTP {status} from {url}")]
    Http {
        status: u16,
        url: String,
        body: String,
        metadata: serde_json::Value,
    },

    /// 2xx with an undecodable body.
    #[error("failed to decode router response: {0}")]
    Json(#[source] reqwest::Error),

    /// 2xx with `success=false`. The full response body rides along so the
    /// caller can persist provider and timing details.
    #[error("router rejected request: {message}")]
    Router {
        message: String,
        response: Box<InferenceResponse>,
    },
}

impl RouterError {
    /// Whether a retry could plausibly succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            RouterError::Timeout { .. } | RouterError::Network(_) => true,
            RouterError::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            RouterError::NotFound { .. }
            | RouterError::Json(_)
            | RouterError::Router { .. } => false,
        }
    }

    /// Stable machine-readable code for failure records.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::Timeout { .. } => "ROUTER_TIMEOUT",
            RouterError::Network(_) => "ROUTER_NETWORK",
            RouterError::NotFound { .. } => "ROUTER_NOT_FOUND",
            RouterError::Http { .. } => "ROUTER_HTTP",
            RouterError::Json(_) => "ROUTER_BAD_RESPONSE",
            RouterError::Router { .. } => "ROUTER_REJECTED",
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client for the hybrid inference router.
#[derive(Debug, Clone)]
pub struct RouterClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl RouterClient {
    /// Build a client from config. Fails only if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(config: RouterConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
        })
    }

    /// The configured base URL (trailing slashes already trimmed).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST an inference request, walking the candidate paths.
    ///
    /// When `trace_id` is present it is propagated via the `X-Trace-Id`
    /// header so router-side spans join the caller's trace.
    pub async fn run_inference(
        &self,
        request: &InferenceRequest,
        trace_id: Option<&str>,
    ) -> Result<InferenceResponse, RouterError> {
        let mut tried = Vec::with_capacity(INFERENCE_PATHS.len());

        for path in INFERENCE_PATHS {
            let url = format!("{}{}", self.base_url, path);

            let mut req = self
                .http
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, "application/json")
                .json(request);
            if let Some(tid) = trace_id {
                req = req.header("X-Trace-Id", tid);
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    return Err(RouterError::Timeout {
                        timeout: self.timeout,
                    });
                }
                Err(e) => return Err(RouterError::Network(e)),
            };

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                debug!(url = %url, "inference path not found, trying next");
                tried.push(url);
                continue;
            }

            if !status.is_success() {
                let metadata = rate_limit_metadata(response.headers());
                let body = response.text().await.unwrap_or_default();
                return Err(RouterError::Http {
                    status: status.as_u16(),
                    url,
                    body: snippet(&body),
                    metadata,
                });
            }

            let body: InferenceResponse =
                response.json().await.map_err(RouterError::Json)?;

            if !body.success {
                let message = body
                    .error
                    .clone()
                    .unwrap_or_else(|| "router reported failure".to_string());
                return Err(RouterError::Router {
                    message,
                    response: Box::new(body),
                });
            }

            return Ok(body);
        }

        Err(RouterError::NotFound { tried })
    }

    /// GET the router's provider listing.
    pub async fn get_providers(&self) -> Result<Vec<ProviderInfo>, RouterError> {
        let url = format!("{}/providers", self.base_url);

        let response = match self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(RouterError::Timeout {
                    timeout: self.timeout,
                });
            }
            Err(e) => return Err(RouterError::Network(e)),
        };

        let status = response.status();
        if !status.is_success() {
            let metadata = rate_limit_metadata(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::Http {
                status: status.as_u16(),
                url,
                body: snippet(&body),
                metadata,
            });
        }

        response.json().await.map_err(RouterError::Json)
    }
}

/// Cap a response body at the snippet limit, respecting char boundaries.
fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_LIMIT {
        return body.to_string();
    }
    let mut end = BODY_SNIPPET_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Collect rate-limit response headers into a JSON object. Empty object when
/// the router sent none.
fn rate_limit_metadata(headers: &reqwest::header::HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for name in ["retry-after", "x-ratelimit-limit", "x-ratelimit-remaining", "x-ratelimit-reset"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            map.insert(name.to_string(), serde_json::Value::String(value.to_string()));
        }
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slashes_are_trimmed() {
        let client = RouterClient::new(RouterConfig {
            base_url: "http://router.internal///".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://router.internal");
    }

    #[test]
    fn config_default_points_at_production_router() {
        let config = RouterConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(config.base_url.starts_with("https://"));
    }

    #[test]
    fn snippet_caps_large_bodies() {
        let body = "x".repeat(10_000);
        assert_eq!(snippet(&body).len(), 2048);
        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn http_429_and_503_are_transient() {
        for status in [429u16, 503] {
            let err = RouterError::Http {
                status,
                url: "http://r/inference".to_string(),
                body: String::new(),
                metadata: serde_json::json!({}),
            };
            assert!(err.is_transient(), "status {status} should be transient");
        }
        let err = RouterError::Http {
            status: 500,
            url: "http://r/inference".to_string(),
            body: String::new(),
            metadata: serde_json::json!({}),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn router_rejection_is_not_transient() {
        let err = RouterError::Router {
            message: "Model not available".to_string(),
            response: Box::new(InferenceResponse {
                success: false,
                response: String::new(),
                error: Some("Model not available".to_string()),
                provider_used: None,
                inference_time: None,
                metadata: serde_json::Value::Null,
            }),
        };
        assert!(!err.is_transient());
        assert_eq!(err.code(), "ROUTER_REJECTED");
    }

    #[test]
    fn request_omits_absent_region_preference() {
        let request = InferenceRequest {
            model: "llama3.2-1b".to_string(),
            prompt: "Who are you?".to_string(),
            temperature: 0.0,
            max_tokens: 512,
            region_preference: None,
            cost_priority: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("region_preference").is_none());
    }
}
