//! Buffered request and response descriptors passed between the front door,
//! its route handlers and the forwarder

use crate::error::{ErrorResponse, GateErrorCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use std::collections::HashMap;

/// A fully buffered inbound request
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string without the leading '?'
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ModelRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Bytes::from(value.to_string());
        self
    }

    /// Buffer a hyper request
    pub async fn from_hyper(req: Request<Incoming>) -> Result<Self, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(String::from),
            headers: parts.headers,
            body,
        })
    }

    /// Path plus query string, as sent on the wire
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }

    /// Decoded query parameters (last value wins)
    pub fn query_params(&self) -> HashMap<String, String> {
        self.query
            .as_deref()
            .map(parse_query)
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    /// Parse the body as JSON; an empty body is `None`
    pub fn json(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&self.body).map(Some)
    }
}

/// A fully buffered response
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ModelResponse {
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Bytes::from(value.to_string()),
        }
    }

    pub fn error(code: GateErrorCode, message: impl Into<String>) -> Self {
        Self::error_with_status(code, code.status_code(), message)
    }

    /// Error response with an explicit status, e.g. one relayed from upstream
    pub fn error_with_status(code: GateErrorCode, status: StatusCode, message: impl Into<String>) -> Self {
        let error = ErrorResponse::with_status(code, status, message);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            crate::error::X_GATE_ERROR,
            HeaderValue::from_static(code.as_header_value()),
        );
        Self {
            status,
            headers,
            body: Bytes::from(error.to_json()),
        }
    }

    /// Parse the body as JSON
    pub fn json_body(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn into_hyper(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Decode an `application/x-www-form-urlencoded` query string
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_query() {
        let params = parse_query("start=1&stop=100&name=a+b%21&flag");
        assert_eq!(
            params,
            vec![
                ("start".to_string(), "1".to_string()),
                ("stop".to_string(), "100".to_string()),
                ("name".to_string(), "a b!".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_path_and_query() {
        let req = ModelRequest::new(Method::GET, "/predict");
        assert_eq!(req.path_and_query(), "/predict");

        let req = req.with_query("start=1&stop=2");
        assert_eq!(req.path_and_query(), "/predict?start=1&stop=2");
        assert_eq!(req.query_params().get("stop"), Some(&"2".to_string()));
    }

    #[test]
    fn test_request_json_body() {
        let req = ModelRequest::new(Method::POST, "/model");
        assert!(req.json().unwrap().is_none());

        let req = req.with_json(&json!({"data": {"start": 1}}));
        assert_eq!(req.json().unwrap(), Some(json!({"data": {"start": 1}})));
        assert_eq!(req.headers.get(CONTENT_TYPE).unwrap(), "application/json");

        let mut bad = ModelRequest::new(Method::POST, "/model");
        bad.body = Bytes::from_static(b"{not json");
        assert!(bad.json().is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let resp = ModelResponse::error(GateErrorCode::InvalidBody, "bad body");
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        let body = resp.json_body().unwrap();
        assert_eq!(body["code"], "INVALID_BODY");
        assert_eq!(body["status"], 400);
    }

    #[test]
    fn test_into_hyper_keeps_status_and_headers() {
        let resp = ModelResponse::json(StatusCode::CREATED, &json!({"ok": true})).into_hyper();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
    }
}
