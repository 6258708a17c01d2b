//! API documentation served by the backend, and root-path detection for
//! deployments behind a path prefix.

use crate::{PKG_NAME, VERSION};
use hyper::HeaderMap;
use serde_json::{json, Value};

const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";
const X_SCRIPT_NAME: &str = "x-script-name";

/// Work out the prefix this request was routed under.
///
/// An `/apps/<id>` pair in the path wins; otherwise the first non-empty of
/// `x-forwarded-prefix`, `x-script-name` and the configured root path.
pub fn detect_root_path(path: &str, headers: &HeaderMap, configured: &str) -> String {
    if let Some(prefix) = apps_prefix(path) {
        return prefix;
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    [header(X_FORWARDED_PREFIX), header(X_SCRIPT_NAME), configured.to_string()]
        .into_iter()
        .map(|p| p.trim_end_matches('/').to_string())
        .find(|p| !p.is_empty())
        .unwrap_or_default()
}

/// Everything up to and including the segment after `apps`
pub fn apps_prefix(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('/').collect();
    let index = segments.iter().position(|s| *s == "apps")?;
    let id = segments.get(index + 1).filter(|s| !s.is_empty())?;

    let mut prefix = segments[..index].join("/");
    prefix.push_str("/apps/");
    prefix.push_str(id);
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    Some(prefix)
}

/// Value of a forwarded-prefix header, for diagnostics
pub fn prefix_headers(headers: &HeaderMap) -> Value {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("not_present")
            .to_string()
    };
    json!({
        "x-forwarded-prefix": get(X_FORWARDED_PREFIX),
        "x-script-name": get(X_SCRIPT_NAME),
    })
}

/// OpenAPI 3 description of the backend endpoints
pub fn openapi(root_path: &str) -> Value {
    let server_url = if root_path.is_empty() { "/" } else { root_path };

    json!({
        "openapi": "3.0.3",
        "info": {
            "title": PKG_NAME,
            "description": "Template model server fronted by the model API wrapper",
            "version": VERSION,
        },
        "servers": [{ "url": server_url }],
        "paths": paths(),
        "components": { "schemas": schemas() },
    })
}

fn paths() -> Value {
    json!({
        "/": { "get": { "summary": "Service information", "responses": ok() } },
        "/health": { "get": { "summary": "Health check", "responses": ok() } },
        "/version": { "get": { "summary": "Package name and version", "responses": ok() } },
        "/predict": {
            "post": {
                "summary": "Random number between start and stop",
                "description": "Query parameters take precedence over the request body.",
                "parameters": [
                    { "name": "start", "in": "query", "required": false, "schema": { "type": "number" } },
                    { "name": "stop", "in": "query", "required": false, "schema": { "type": "number" } },
                ],
                "requestBody": {
                    "required": false,
                    "content": { "application/json": { "schema": { "$ref": "#/components/schemas/PredictionRequest" } } },
                },
                "responses": {
                    "200": {
                        "description": "Prediction",
                        "content": { "application/json": { "schema": { "$ref": "#/components/schemas/PredictionResponse" } } },
                    },
                    "400": { "description": "Body is not valid JSON" },
                },
            },
        },
        "/model": {
            "post": {
                "summary": "Model API compatible prediction",
                "requestBody": {
                    "content": { "application/json": { "schema": { "$ref": "#/components/schemas/PredictionRequest" } } },
                },
                "responses": ok(),
            },
        },
        "/remoteprediction": {
            "post": {
                "summary": "Relay a prediction to the remote model",
                "requestBody": {
                    "required": true,
                    "content": { "application/json": { "schema": { "$ref": "#/components/schemas/RemotePredictionRequest" } } },
                },
                "responses": {
                    "200": { "description": "Remote model response" },
                    "400": { "description": "Body missing a data object" },
                    "500": { "description": "Remote model not configured" },
                    "502": { "description": "Remote model unreachable" },
                },
            },
        },
        "/info": { "get": { "summary": "Deployment information", "responses": ok() } },
    })
}

fn schemas() -> Value {
    json!({
        "RandomNumberRequest": {
            "type": "object",
            "properties": { "start": { "type": "number" }, "stop": { "type": "number" } },
        },
        "PredictionRequest": {
            "type": "object",
            "properties": { "data": { "$ref": "#/components/schemas/RandomNumberRequest" } },
        },
        "PredictionResponse": {
            "type": "object",
            "properties": { "prediction": {}, "metadata": { "type": "object" } },
        },
        "RemotePredictionRequest": {
            "type": "object",
            "required": ["data"],
            "properties": { "data": { "type": "object" } },
        },
    })
}

fn ok() -> Value {
    json!({ "200": { "description": "Successful response" } })
}

/// Swagger UI page pointing at `<root_path>/openapi.json`
pub fn docs_html(root_path: &str) -> String {
    format!(
        r##"<!DOCTYPE html>
<html>
<head>
<title>{name} - API docs</title>
<link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/swagger-ui-dist@5/swagger-ui.css">
</head>
<body>
<div id="swagger-ui"></div>
<script src="https://cdn.jsdelivr.net/npm/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
<script>
SwaggerUIBundle({{ url: "{root}/openapi.json", dom_id: "#swagger-ui" }});
</script>
</body>
</html>
"##,
        name = PKG_NAME,
        root = root_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_apps_prefix() {
        assert_eq!(apps_prefix("/apps/abc/docs").as_deref(), Some("/apps/abc"));
        assert_eq!(apps_prefix("/proxy/apps/abc").as_deref(), Some("/proxy/apps/abc"));
        assert_eq!(apps_prefix("/apps/"), None);
        assert_eq!(apps_prefix("/predict"), None);
    }

    #[test]
    fn test_detect_prefers_apps_path() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_PREFIX, HeaderValue::from_static("/other"));
        assert_eq!(detect_root_path("/apps/xyz/info", &headers, "/cfg"), "/apps/xyz");
    }

    #[test]
    fn test_detect_header_order() {
        let mut headers = HeaderMap::new();
        headers.insert(X_SCRIPT_NAME, HeaderValue::from_static("/script/"));
        assert_eq!(detect_root_path("/info", &headers, "/cfg"), "/script");

        headers.insert(X_FORWARDED_PREFIX, HeaderValue::from_static("/prefix"));
        assert_eq!(detect_root_path("/info", &headers, "/cfg"), "/prefix");
    }

    #[test]
    fn test_detect_falls_back_to_configured() {
        let headers = HeaderMap::new();
        assert_eq!(detect_root_path("/info", &headers, "/cfg"), "/cfg");
        assert_eq!(detect_root_path("/info", &headers, ""), "");
    }

    #[test]
    fn test_openapi_server_url() {
        assert_eq!(openapi("")["servers"][0]["url"], "/");
        assert_eq!(openapi("/apps/demo")["servers"][0]["url"], "/apps/demo");
        assert!(openapi("")["paths"].get("/remoteprediction").is_some());
    }

    #[test]
    fn test_docs_html_links_openapi() {
        assert!(docs_html("/apps/demo").contains("\"/apps/demo/openapi.json\""));
        assert!(docs_html("").contains("\"/openapi.json\""));
    }
}
