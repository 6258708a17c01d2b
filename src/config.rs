use hyper::Method;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable for the front door bind address
pub const ENV_FRONT_BIND: &str = "MODELGATE_FRONT_BIND";
/// Environment variable for the front door port
pub const ENV_FRONT_PORT: &str = "MODELGATE_FRONT_PORT";
/// Environment variable for the backend host
pub const ENV_BACKEND_HOST: &str = "MODELGATE_BACKEND_HOST";
/// Environment variable for the backend port
pub const ENV_BACKEND_PORT: &str = "MODELGATE_BACKEND_PORT";
/// Environment variable overriding the backend command line
pub const ENV_BACKEND_COMMAND: &str = "MODELGATE_BACKEND_COMMAND";
/// Environment variable for the remote model host
pub const ENV_REMOTE_HOST: &str = "DOMINO_REMOTE_MODEL_HOST";
/// Environment variable for the remote model id
pub const ENV_REMOTE_MODEL_ID: &str = "DOMINO_REMOTE_MODEL_ID";
/// Environment variable for the remote model access token
pub const ENV_REMOTE_TOKEN: &str = "DOMINO_REMOTE_MODEL_TOKEN";
/// Environment variable for the application root path
pub const ENV_APP_PATH: &str = "DOMINO_APP_PATH";

/// Global configuration for the gate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door (synchronous wrapper) settings
    #[serde(default)]
    pub front: FrontConfig,

    /// Background server settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Remote model used by the relay endpoint
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Settings of the template application
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_front_bind")]
    pub bind: String,

    /// Listen port (default: 8888)
    #[serde(default = "default_front_port")]
    pub port: u16,

    /// Routes rewritten to forward to the backend, as "METHOD /path".
    /// An empty list proxies every route of the application.
    #[serde(default = "default_proxied_routes")]
    pub proxied_routes: Vec<String>,

    /// Whole-request timeout for forwarded requests in seconds (default: 30)
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,

    /// Connect timeout for forwarded requests in milliseconds (default: 1000)
    #[serde(default = "default_forward_connect_timeout")]
    pub forward_connect_timeout_ms: u64,
}

impl FrontConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_secs)
    }

    pub fn forward_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_connect_timeout_ms)
    }

    /// Parse the configured proxied routes
    pub fn routes(&self) -> Result<Vec<(Method, String)>, String> {
        self.proxied_routes.iter().map(|r| parse_route(r)).collect()
    }
}

impl Default for FrontConfig {
    fn default() -> Self {
        Self {
            bind: default_front_bind(),
            port: default_front_port(),
            proxied_routes: default_proxied_routes(),
            forward_timeout_secs: default_forward_timeout(),
            forward_connect_timeout_ms: default_forward_connect_timeout(),
        }
    }
}

/// Configuration for the background server process
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Host the backend binds to and the front door forwards to
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port the backend listens on
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Spawn the backend as a child process (default: true).
    /// Disable when the backend is run externally.
    #[serde(default = "default_true")]
    pub spawn: bool,

    /// Command to execute (default: this executable with the `backend` subcommand)
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Discard the child's stdout/stderr instead of inheriting them
    #[serde(default)]
    pub quiet: bool,

    /// Readiness endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Interval between readiness checks in milliseconds (default: 500)
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,

    /// Number of readiness checks before giving up (default: 10)
    #[serde(default = "default_startup_poll_attempts")]
    pub startup_poll_attempts: u32,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendConfig {
    /// Base URL the front door forwards to
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid backend address {}:{}: {}", self.host, self.port, e))
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }

        if self.host.is_empty() {
            errors.push("backend: 'host' must not be empty".to_string());
        }

        if let Some(ref command) = self.command {
            if command.trim().is_empty() {
                errors.push("backend: 'command' must not be empty when set".to_string());
            }
        }

        if !self.health_path.starts_with('/') {
            errors.push(format!(
                "backend: 'health_path' must start with '/', got '{}'",
                self.health_path
            ));
        }

        if self.startup_poll_attempts == 0 {
            errors.push("backend: 'startup_poll_attempts' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            spawn: true,
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            quiet: false,
            health_path: default_health_path(),
            startup_poll_interval_ms: default_startup_poll_interval(),
            startup_poll_attempts: default_startup_poll_attempts(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// Coordinates of the remote model used by `/remoteprediction`
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    /// Remote host (without scheme or port)
    pub host: Option<String>,

    /// Remote model identifier
    pub model_id: Option<String>,

    /// Access token; used as both basic-auth username and password
    pub token: Option<String>,

    /// Relay timeout in seconds (default: 10)
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

impl RemoteConfig {
    /// Remote model URL, if both host and model id are configured
    pub fn model_url(&self) -> Option<String> {
        let host = self.host.as_deref().filter(|h| !h.is_empty())?;
        let model_id = self.model_id.as_deref().filter(|m| !m.is_empty())?;
        Some(format!("https://{}:443/models/{}/latest/model", host, model_id))
    }

    /// Access token, treating an empty string as absent
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            model_id: None,
            token: None,
            timeout_secs: default_remote_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// Path prefix the application is served under (normalized on load)
    #[serde(default)]
    pub root_path: String,
}

/// Normalize a root path: leading '/', no trailing '/', empty for the root itself
pub fn normalize_root_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Parse a "METHOD /path" route
pub fn parse_route(route: &str) -> Result<(Method, String), String> {
    let mut parts = route.split_whitespace();
    let (Some(method), Some(path), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("route '{}' must have the form 'METHOD /path'", route));
    };

    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("route '{}' has an invalid method", route))?;

    if !path.starts_with('/') {
        return Err(format!("route '{}' path must start with '/'", route));
    }

    Ok((method, path.to_string()))
}

// Default value functions
fn default_front_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_front_port() -> u16 {
    8888
}

fn default_proxied_routes() -> Vec<String> {
    vec![
        "POST /model".to_string(),
        "GET /health".to_string(),
        "GET /version".to_string(),
    ]
}

fn default_forward_timeout() -> u64 {
    30
}

fn default_forward_connect_timeout() -> u64 {
    1000
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_startup_poll_interval() -> u64 {
    500
}

fn default_startup_poll_attempts() -> u32 {
    10
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_remote_timeout() -> u64 {
    10
}

impl Config {
    /// Load from a TOML file. Environment overrides are applied separately.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.app.root_path = normalize_root_path(&config.app.root_path);
        config.validate()?;
        Ok(config)
    }

    /// Backend settings for a spawned child, carrying the remote model and
    /// root path through its environment. Entries already in `backend.env`
    /// take precedence.
    pub fn backend_launch_config(&self) -> BackendConfig {
        let mut backend = self.backend.clone();
        let inherited = [
            (ENV_REMOTE_HOST, self.remote.host.as_deref()),
            (ENV_REMOTE_MODEL_ID, self.remote.model_id.as_deref()),
            (ENV_REMOTE_TOKEN, self.remote.token()),
            (ENV_APP_PATH, Some(self.app.root_path.as_str()).filter(|p| !p.is_empty())),
        ];
        for (key, value) in inherited {
            if let Some(value) = value {
                backend
                    .env
                    .entry(key.to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        backend
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides using a custom variable lookup
    pub fn apply_env_with<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_FRONT_BIND) {
            self.front.bind = bind;
        }
        if let Some(port) = lookup(ENV_FRONT_PORT) {
            self.front.port = parse_port(ENV_FRONT_PORT, &port)?;
        }
        if let Some(host) = lookup(ENV_BACKEND_HOST) {
            self.backend.host = host;
        }
        if let Some(port) = lookup(ENV_BACKEND_PORT) {
            self.backend.port = parse_port(ENV_BACKEND_PORT, &port)?;
        }
        if let Some(command_line) = lookup(ENV_BACKEND_COMMAND) {
            let mut words = shell_words::split(&command_line)
                .map_err(|e| anyhow::anyhow!("Invalid {}: {}", ENV_BACKEND_COMMAND, e))?
                .into_iter();
            let command = words
                .next()
                .ok_or_else(|| anyhow::anyhow!("{} must not be empty", ENV_BACKEND_COMMAND))?;
            self.backend.command = Some(command);
            self.backend.args = words.collect();
        }
        if let Some(host) = lookup(ENV_REMOTE_HOST) {
            self.remote.host = Some(host);
        }
        if let Some(model_id) = lookup(ENV_REMOTE_MODEL_ID) {
            self.remote.model_id = Some(model_id);
        }
        if let Some(token) = lookup(ENV_REMOTE_TOKEN) {
            self.remote.token = Some(token);
        }
        if let Some(path) = lookup(ENV_APP_PATH) {
            self.app.root_path = normalize_root_path(&path);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.front.routes() {
            errors.push(format!("front: {}", e));
        }

        if let Err(mut backend_errors) = self.backend.validate() {
            errors.append(&mut backend_errors);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> anyhow::Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[front]
port = 9090
bind = "127.0.0.1"
proxied_routes = ["POST /model"]

[backend]
host = "127.0.0.1"
port = 8100
command = "/opt/model/serve"
args = ["--workers", "2", "--reload"]
health_path = "/healthz"

[backend.env]
LOG_LEVEL = "info"

[remote]
host = "models.example.com"
model_id = "abc123"

[app]
root_path = "apps/demo/"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.front.port, 9090);
        assert_eq!(config.front.proxied_routes, vec!["POST /model"]);
        assert_eq!(config.backend.port, 8100);
        assert_eq!(config.backend.command, Some("/opt/model/serve".to_string()));
        assert_eq!(config.backend.args.len(), 3);
        assert_eq!(config.backend.env.get("LOG_LEVEL"), Some(&"info".to_string()));
        assert_eq!(config.remote.model_id, Some("abc123".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.front.bind, "0.0.0.0");
        assert_eq!(config.front.port, 8888);
        assert_eq!(config.front.proxied_routes.len(), 3);
        assert_eq!(config.front.forward_timeout(), Duration::from_secs(30));
        assert_eq!(config.front.forward_connect_timeout(), Duration::from_millis(1000));
        assert_eq!(config.backend.host, "127.0.0.1");
        assert_eq!(config.backend.port, 8000);
        assert!(config.backend.spawn);
        assert_eq!(config.backend.health_path, "/health");
        assert_eq!(config.backend.startup_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.backend.startup_poll_attempts, 10);
        assert_eq!(config.remote.timeout(), Duration::from_secs(10));
        assert_eq!(config.app.root_path, "");
    }

    #[test]
    fn test_load_normalizes_root_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modelgate.toml");
        std::fs::write(&path, "[app]\nroot_path = \"apps/demo/\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.app.root_path, "/apps/demo");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load("/nonexistent/modelgate.toml").is_err());
    }

    #[test]
    fn test_normalize_root_path() {
        assert_eq!(normalize_root_path(""), "");
        assert_eq!(normalize_root_path("/"), "");
        assert_eq!(normalize_root_path("apps/x"), "/apps/x");
        assert_eq!(normalize_root_path("/apps/x/"), "/apps/x");
        assert_eq!(normalize_root_path("  /apps/x//  "), "/apps/x");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_with(lookup_from(&[
                (ENV_FRONT_PORT, "9999"),
                (ENV_BACKEND_HOST, "127.0.0.2"),
                (ENV_BACKEND_PORT, "8123"),
                (ENV_REMOTE_HOST, "remote.example.com"),
                (ENV_REMOTE_MODEL_ID, "m-1"),
                (ENV_REMOTE_TOKEN, "secret"),
                (ENV_APP_PATH, "apps/abc/"),
            ]))
            .unwrap();

        assert_eq!(config.front.port, 9999);
        assert_eq!(config.backend.host, "127.0.0.2");
        assert_eq!(config.backend.port, 8123);
        assert_eq!(config.backend.base_url(), "http://127.0.0.2:8123");
        assert_eq!(config.remote.token(), Some("secret"));
        assert_eq!(config.app.root_path, "/apps/abc");
    }

    #[test]
    fn test_env_invalid_port() {
        let mut config = Config::default();
        let result = config.apply_env_with(lookup_from(&[(ENV_BACKEND_PORT, "eighty")]));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains(ENV_BACKEND_PORT));
    }

    #[test]
    fn test_env_backend_command_is_split() {
        let mut config = Config::default();
        config
            .apply_env_with(lookup_from(&[(
                ENV_BACKEND_COMMAND,
                "uvicorn 'app:app' --workers 1",
            )]))
            .unwrap();

        assert_eq!(config.backend.command, Some("uvicorn".to_string()));
        assert_eq!(config.backend.args, vec!["app:app", "--workers", "1"]);
    }

    #[test]
    fn test_remote_model_url() {
        let mut remote = RemoteConfig::default();
        assert!(remote.model_url().is_none());

        remote.host = Some("models.example.com".to_string());
        assert!(remote.model_url().is_none());

        remote.model_id = Some("abc".to_string());
        assert_eq!(
            remote.model_url().unwrap(),
            "https://models.example.com:443/models/abc/latest/model"
        );
    }

    #[test]
    fn test_backend_launch_config_exports_remote_and_root_path() {
        let toml = r#"
[backend]
env = { DOMINO_APP_PATH = "/explicit" }

[remote]
host = "models.example.com"
model_id = "abc123"
token = "tok"

[app]
root_path = "apps/demo"
"#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.app.root_path = normalize_root_path(&config.app.root_path);

        let backend = config.backend_launch_config();
        assert_eq!(backend.env[ENV_REMOTE_HOST], "models.example.com");
        assert_eq!(backend.env[ENV_REMOTE_MODEL_ID], "abc123");
        assert_eq!(backend.env[ENV_REMOTE_TOKEN], "tok");
        assert_eq!(backend.env[ENV_APP_PATH], "/explicit");

        config.backend.env.clear();
        assert_eq!(config.backend_launch_config().env[ENV_APP_PATH], "/apps/demo");
    }

    #[test]
    fn test_backend_launch_config_skips_unset_values() {
        let config = Config::default();
        assert!(config.backend_launch_config().env.is_empty());
    }

    #[test]
    fn test_empty_token_is_absent() {
        let remote = RemoteConfig {
            token: Some(String::new()),
            ..RemoteConfig::default()
        };
        assert!(remote.token().is_none());
    }

    #[test]
    fn test_parse_route() {
        let (method, path) = parse_route("post /model").unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(path, "/model");

        assert!(parse_route("GET").is_err());
        assert!(parse_route("GET health").is_err());
        assert!(parse_route("GET /a /b").is_err());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.backend.port = 0;
        config.backend.health_path = "health".to_string();
        config.front.proxied_routes = vec!["bogus".to_string()];

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
        assert!(err.contains("'health_path' must start with '/'"));
        assert!(err.contains("front: route 'bogus'"));
    }
}
