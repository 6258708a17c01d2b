//! Relay of prediction requests to a separately hosted model

use crate::config::RemoteConfig;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Remote model configuration missing; set DOMINO_REMOTE_MODEL_HOST and DOMINO_REMOTE_MODEL_ID")]
    NotConfigured,
    #[error("Error calling remote model: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Remote model returned error {status}: {body}")]
    Remote { status: u16, body: String },
}

pub struct RemoteRelay {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl RemoteRelay {
    pub fn new(config: RemoteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Build the POST carrying `{"data": data}`, with basic auth when a token
    /// is configured
    pub fn build_request(&self, data: &Value) -> Result<reqwest::Request, RelayError> {
        let url = self.config.model_url().ok_or(RelayError::NotConfigured)?;

        let mut builder = self.client.post(url).json(&json!({ "data": data }));
        if let Some(token) = self.config.token() {
            builder = builder.basic_auth(token, Some(token));
        }

        Ok(builder.build()?)
    }

    /// Send `data` to the remote model and return its JSON (or raw text)
    pub async fn relay(&self, data: &Value) -> Result<Value, RelayError> {
        let request = self.build_request(data)?;
        debug!(url = %request.url(), authenticated = self.config.token().is_some(), "Relaying to remote model");

        let response = self.client.execute(request).await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        interpret_response(status, text)
    }
}

/// Error statuses become [`RelayError::Remote`]; non-JSON bodies are wrapped
/// as `{"raw_response": text}`
fn interpret_response(status: u16, text: String) -> Result<Value, RelayError> {
    if status >= 400 {
        return Err(RelayError::Remote { status, body: text });
    }

    Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw_response": text })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn configured(token: Option<&str>) -> RemoteConfig {
        RemoteConfig {
            host: Some("models.example.com".to_string()),
            model_id: Some("m-42".to_string()),
            token: token.map(String::from),
            ..RemoteConfig::default()
        }
    }

    #[test]
    fn test_request_without_token_has_no_auth() {
        let relay = RemoteRelay::new(configured(None)).unwrap();
        let req = relay.build_request(&json!({"start": 1, "stop": 2})).unwrap();

        assert_eq!(req.method().as_str(), "POST");
        assert_eq!(
            req.url().as_str(),
            "https://models.example.com/models/m-42/latest/model"
        );
        assert!(req.headers().get("authorization").is_none());

        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        let sent: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(sent, json!({"data": {"start": 1, "stop": 2}}));
    }

    #[test]
    fn test_request_with_token_uses_basic_auth() {
        let relay = RemoteRelay::new(configured(Some("tok"))).unwrap();
        let req = relay.build_request(&json!({})).unwrap();

        let expected = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("tok:tok")
        );
        assert_eq!(req.headers().get("authorization").unwrap(), expected.as_str());
    }

    #[test]
    fn test_empty_token_sends_no_auth() {
        let relay = RemoteRelay::new(configured(Some(""))).unwrap();
        let req = relay.build_request(&json!({})).unwrap();
        assert!(req.headers().get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_missing_config() {
        let relay = RemoteRelay::new(RemoteConfig::default()).unwrap();
        let result = relay.relay(&json!({})).await;
        assert!(matches!(result, Err(RelayError::NotConfigured)));
    }

    #[test]
    fn test_interpret_json_and_raw() {
        assert_eq!(
            interpret_response(200, r#"{"result": 3}"#.to_string()).unwrap(),
            json!({"result": 3})
        );
        assert_eq!(
            interpret_response(200, "plain text".to_string()).unwrap(),
            json!({"raw_response": "plain text"})
        );
    }

    #[test]
    fn test_interpret_error_status() {
        match interpret_response(403, "forbidden".to_string()) {
            Err(RelayError::Remote { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
