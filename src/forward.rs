//! Loopback forwarding of front door requests to the background server
//!
//! The forwarder never retries. Every failure comes back as a [`ForwardError`]
//! so the caller can fall back to the route's original handler.

use crate::request::{ModelRequest, ModelResponse};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, CONTENT_LENGTH, HOST};
use hyper::{HeaderMap, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for forwarding
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Could not connect to or talk to the backend
    #[error("backend connection failed: {0}")]
    Connect(#[from] hyper_util::client::legacy::Error),
    /// Backend did not answer in time
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
    /// The outbound request could not be built
    #[error("request build error: {0}")]
    RequestBuild(String),
    /// The response body could not be read
    #[error("failed to read backend response body: {0}")]
    Body(#[from] hyper::Error),
}

/// Configuration for the forwarder
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:8000`
    pub base_url: String,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            connect_timeout: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for forwarded requests
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub attempts: AtomicU64,
    pub failures: AtomicU64,
}

impl ForwardStats {
    pub fn get_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Forwards buffered requests to the backend over loopback HTTP
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    config: ForwarderConfig,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        debug!(
            base_url = %config.base_url,
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            request_timeout_secs = config.request_timeout.as_secs(),
            "Forwarder initialized"
        );

        Self {
            client,
            config,
            stats: Arc::new(ForwardStats::default()),
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send an equivalent request to the backend and buffer its response.
    /// Any upstream status is a success.
    pub async fn forward(&self, req: &ModelRequest) -> Result<ModelResponse, ForwardError> {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let result = tokio::time::timeout(self.config.request_timeout, self.send(req))
            .await
            .unwrap_or(Err(ForwardError::Timeout(self.config.request_timeout)));

        if result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn send(&self, req: &ModelRequest) -> Result<ModelResponse, ForwardError> {
        let uri = format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            req.path_and_query()
        );

        let mut builder = Request::builder().method(req.method.clone()).uri(&uri);
        for (key, value) in req.headers.iter() {
            if is_hop_by_hop(key) || *key == HOST || *key == CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(Full::new(req.body.clone()))
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        debug!(method = %req.method, %uri, "Forwarding request to backend");

        let response = self.client.request(backend_req).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        Ok(ModelResponse {
            status: parts.status,
            headers: strip_hop_by_hop(parts.headers),
            body,
        })
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn strip_hop_by_hop(headers: HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use hyper::Method;

    #[test]
    fn test_forwarder_config_default() {
        let config = ForwarderConfig::default();
        assert_eq!(config.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.connect_timeout, Duration::from_millis(1000));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let stripped = strip_hop_by_hop(headers);
        assert!(stripped.get("connection").is_none());
        assert!(stripped.get("transfer-encoding").is_none());
        assert_eq!(stripped.get("content-type").unwrap(), "application/json");
        assert_eq!(stripped.get_all("set-cookie").iter().count(), 2);
    }

    #[tokio::test]
    async fn test_connection_refused_is_error() {
        // Bind then drop to get a port that is almost certainly closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = Forwarder::new(ForwarderConfig {
            base_url: format!("http://127.0.0.1:{}", port),
            connect_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
        });

        let result = forwarder.forward(&ModelRequest::new(Method::GET, "/health")).await;
        assert!(matches!(result, Err(ForwardError::Connect(_))));
        assert_eq!(forwarder.stats().get_attempts(), 1);
        assert_eq!(forwarder.stats().get_failures(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_error() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let forwarder = Forwarder::new(ForwarderConfig {
            base_url: format!("http://127.0.0.1:{}", port),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(300),
        });

        let result = forwarder.forward(&ModelRequest::new(Method::GET, "/health")).await;
        assert!(matches!(result, Err(ForwardError::Timeout(_))));
    }
}
