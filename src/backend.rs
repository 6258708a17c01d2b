//! The template asynchronous application the front door forwards to.
//!
//! Serves the prediction endpoints, a relay to a remotely hosted model, and
//! API documentation that works behind a path prefix.

use crate::config::{normalize_root_path, Config, RemoteConfig};
use crate::docs::{detect_root_path, docs_html, openapi, prefix_headers};
use crate::error::{json_error_response, GateErrorCode};
use crate::model_app::model_route;
use crate::predict::{predict, predict_range};
use crate::relay::{RelayError, RemoteRelay};
use crate::request::{ModelRequest, ModelResponse};
use crate::{PKG_NAME, VERSION};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const NOT_SET: &str = "not_set";

/// Paths served by the backend
const ROUTE_PATHS: &[&str] = &[
    "/",
    "/health",
    "/version",
    "/predict",
    "/model",
    "/remoteprediction",
    "/info",
    "/debug/paths",
    "/debug/headers",
    "/debug/echo",
    "/openapi.json",
    "/docs",
];

/// Platform environment reported by `/` and `/info`
#[derive(Debug, Clone, Default)]
pub struct DeploymentEnv {
    pub user: Option<String>,
    pub project_name: Option<String>,
    pub project_owner: Option<String>,
}

impl DeploymentEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            user: lookup("DOMINO_USER"),
            project_name: lookup("DOMINO_PROJECT_NAME"),
            project_owner: lookup("DOMINO_PROJECT_OWNER"),
        }
    }
}

fn or_not_set(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(NOT_SET)
}

/// Shared state for backend request handling
pub struct BackendState {
    root_path: String,
    relay: RemoteRelay,
    deployment: DeploymentEnv,
}

impl BackendState {
    pub fn new(root_path: &str, remote: RemoteConfig, deployment: DeploymentEnv) -> anyhow::Result<Self> {
        Ok(Self {
            root_path: normalize_root_path(root_path),
            relay: RemoteRelay::new(remote)?,
            deployment,
        })
    }

    /// State for the backend subcommand, reading the platform environment
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(&config.app.root_path, config.remote.clone(), DeploymentEnv::from_env())
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }
}

/// HTTP server for the template application
pub struct BackendServer {
    bind_addr: SocketAddr,
    state: Arc<BackendState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BackendServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<BackendState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            root_path = %self.state.root_path,
            docs = %format!("{}/docs", self.state.root_path),
            "Backend server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Backend connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept backend connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Backend server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<BackendState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let state = Arc::clone(&state);
        async move {
            let response = match ModelRequest::from_hyper(req).await {
                Ok(req) => handle(&state, req).await.into_hyper(),
                Err(e) => json_error_response(
                    GateErrorCode::InvalidBody,
                    format!("Failed to read request body: {}", e),
                ),
            };
            Ok::<_, hyper::Error>(with_cors(response))
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Backend connection error: {}", e))?;

    Ok(())
}

fn with_cors(mut response: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let headers = response.headers_mut();
    for name in [
        "access-control-allow-origin",
        "access-control-allow-methods",
        "access-control-allow-headers",
    ] {
        headers.insert(name, HeaderValue::from_static("*"));
    }
    response
}

/// Route a buffered request to its endpoint
pub async fn handle(state: &BackendState, req: ModelRequest) -> ModelResponse {
    debug!(method = %req.method, path = %req.path, "Backend request");

    if req.method == Method::OPTIONS {
        return ModelResponse {
            status: StatusCode::NO_CONTENT,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
    }

    match (&req.method, req.path.as_str()) {
        (&Method::GET, "/") => root(state),
        (&Method::GET, "/health") => ModelResponse::json(StatusCode::OK, &json!({ "status": "healthy" })),
        (&Method::GET, "/version") => {
            ModelResponse::json(StatusCode::OK, &json!({ "name": PKG_NAME, "version": VERSION }))
        }
        (&Method::POST, "/predict") => predict_endpoint(&req),
        (&Method::POST, "/model") => model_route(&req, &predict),
        (&Method::POST, "/remoteprediction") => remote_prediction(state, &req).await,
        (&Method::GET, "/info") => info_endpoint(state, &req),
        (&Method::GET, "/debug/paths") => debug_paths(state, &req),
        (&Method::GET, "/debug/headers") => debug_headers(&req),
        (&Method::POST, "/debug/echo") => debug_echo(&req),
        (&Method::GET, "/openapi.json") => ModelResponse::json(StatusCode::OK, &openapi(&state.root_path)),
        (&Method::GET, "/docs") => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
            ModelResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from(docs_html(&state.root_path)),
            }
        }
        (method, path) => {
            if ROUTE_PATHS.contains(&path) {
                ModelResponse::error(
                    GateErrorCode::MethodNotAllowed,
                    format!("Method {} not allowed for {}", method, path),
                )
            } else {
                ModelResponse::error(GateErrorCode::NotFound, format!("No route for {}", path))
            }
        }
    }
}

fn root(state: &BackendState) -> ModelResponse {
    ModelResponse::json(
        StatusCode::OK,
        &json!({
            "message": format!("{} template model server is running", PKG_NAME),
            "status": "healthy",
            "version": VERSION,
            "environment_vars": {
                "DOMINO_USER": or_not_set(&state.deployment.user),
                "DOMINO_PROJECT_NAME": or_not_set(&state.deployment.project_name),
            },
        }),
    )
}

/// Query `start` and `stop`, when both parse as numbers
fn query_bounds(req: &ModelRequest) -> Option<(f64, f64)> {
    let params = req.query_params();
    let start = params.get("start")?.trim().parse::<f64>().ok()?;
    let stop = params.get("stop")?.trim().parse::<f64>().ok()?;
    Some((start, stop))
}

fn predict_endpoint(req: &ModelRequest) -> ModelResponse {
    let body = match req.json() {
        Ok(body) => body,
        Err(e) => {
            return ModelResponse::error(
                GateErrorCode::InvalidBody,
                format!("Request body is not valid JSON: {}", e),
            );
        }
    };

    let prediction = match query_bounds(req) {
        Some((start, stop)) => {
            debug!(start, stop, "Using query parameters for prediction");
            predict_range(start, stop)
        }
        None => {
            let data = body
                .as_ref()
                .and_then(|b| b.get("data"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            predict(&data)
        }
    };

    ModelResponse::json(
        StatusCode::OK,
        &json!({
            "prediction": prediction,
            "metadata": {
                "server": "hyper",
                "framework": PKG_NAME,
                "deployment_type": "webapp",
                "request_received": true,
                "model_function": "predict::predict",
            },
        }),
    )
}

async fn remote_prediction(state: &BackendState, req: &ModelRequest) -> ModelResponse {
    let data = match req.json() {
        Ok(Some(body)) => match body.get("data") {
            Some(data @ Value::Object(_)) => data.clone(),
            _ => {
                return ModelResponse::error(
                    GateErrorCode::InvalidBody,
                    "Request body must be {\"data\": {...}}",
                );
            }
        },
        Ok(None) => {
            return ModelResponse::error(GateErrorCode::InvalidBody, "Request body is required");
        }
        Err(e) => {
            return ModelResponse::error(
                GateErrorCode::InvalidBody,
                format!("Request body is not valid JSON: {}", e),
            );
        }
    };

    match state.relay.relay(&data).await {
        Ok(value) => ModelResponse::json(StatusCode::OK, &value),
        Err(e) => {
            warn!(error = %e, "Remote prediction failed");
            match e {
                RelayError::NotConfigured => {
                    ModelResponse::error(GateErrorCode::RemoteConfigMissing, e.to_string())
                }
                RelayError::Transport(_) => ModelResponse::error(GateErrorCode::RemoteUnavailable, e.to_string()),
                RelayError::Remote { status, .. } => {
                    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                    ModelResponse::error_with_status(GateErrorCode::RemoteError, status, e.to_string())
                }
            }
        }
    }
}

fn info_endpoint(state: &BackendState, req: &ModelRequest) -> ModelResponse {
    let detected = detect_root_path(&req.path, &req.headers, &state.root_path);
    ModelResponse::json(
        StatusCode::OK,
        &json!({
            "framework": PKG_NAME,
            "server": "hyper",
            "version": VERSION,
            "environment": {
                "DOMINO_USER": or_not_set(&state.deployment.user),
                "DOMINO_PROJECT_NAME": or_not_set(&state.deployment.project_name),
                "DOMINO_PROJECT_OWNER": or_not_set(&state.deployment.project_owner),
            },
            "request_info": {
                "path": req.path,
                "root_path": state.root_path,
                "detected_root_path": detected,
            },
            "forwarded_headers": prefix_headers(&req.headers),
            "docs_url": format!("{}/docs", state.root_path),
            "openapi_url": format!("{}/openapi.json", state.root_path),
        }),
    )
}

fn debug_paths(state: &BackendState, req: &ModelRequest) -> ModelResponse {
    ModelResponse::json(
        StatusCode::OK,
        &json!({
            "path": req.path,
            "query": req.query,
            "configured_root_path": state.root_path,
            "detected_root_path": detect_root_path(&req.path, &req.headers, &state.root_path),
            "forwarded_headers": prefix_headers(&req.headers),
        }),
    )
}

fn header_map_json(req: &ModelRequest) -> Value {
    let headers: Map<String, Value> = req
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();
    Value::Object(headers)
}

fn debug_headers(req: &ModelRequest) -> ModelResponse {
    ModelResponse::json(StatusCode::OK, &json!({ "headers": header_map_json(req) }))
}

fn debug_echo(req: &ModelRequest) -> ModelResponse {
    let body = match req.json() {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(_) => Value::String(String::from_utf8_lossy(&req.body).into_owned()),
    };

    ModelResponse::json(
        StatusCode::OK,
        &json!({
            "method": req.method.as_str(),
            "path": req.path,
            "query_params": req.query_params(),
            "headers": header_map_json(req),
            "body": body,
        }),
    )
}
