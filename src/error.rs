//! Error handling and JSON error responses

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-readable error code
pub const X_GATE_ERROR: &str = "x-gate-error";

/// Error codes for gate and template application errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateErrorCode {
    /// No route for the requested path
    NotFound,
    /// Route exists but not for this method
    MethodNotAllowed,
    /// Request body could not be parsed
    InvalidBody,
    /// Remote model host or id is not configured
    RemoteConfigMissing,
    /// Remote model could not be reached
    RemoteUnavailable,
    /// Remote model answered with an error status
    RemoteError,
}

impl GateErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::NotFound => StatusCode::NOT_FOUND,
            GateErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GateErrorCode::InvalidBody => StatusCode::BAD_REQUEST,
            GateErrorCode::RemoteConfigMissing => StatusCode::INTERNAL_SERVER_ERROR,
            GateErrorCode::RemoteUnavailable => StatusCode::BAD_GATEWAY,
            GateErrorCode::RemoteError => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Gate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::NotFound => "NOT_FOUND",
            GateErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GateErrorCode::InvalidBody => "INVALID_BODY",
            GateErrorCode::RemoteConfigMissing => "REMOTE_CONFIG_MISSING",
            GateErrorCode::RemoteUnavailable => "REMOTE_UNAVAILABLE",
            GateErrorCode::RemoteError => "REMOTE_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GateErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response with the code's default status
    pub fn new(code: GateErrorCode, message: impl Into<String>) -> Self {
        Self::with_status(code, code.status_code(), message)
    }

    /// Create a new error response with an explicit status
    pub fn with_status(code: GateErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gate-Error header
pub fn json_error_response(code: GateErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_error_response_with_status(code, code.status_code(), message)
}

/// Create a JSON error response with an explicit status (e.g. a relayed remote status)
pub fn json_error_response_with_status(
    code: GateErrorCode,
    status: StatusCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let error = ErrorResponse::with_status(code, status, message);

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header(X_GATE_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode and static headers")
}
