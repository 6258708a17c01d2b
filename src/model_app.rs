//! The front door application: a route table of buffered handlers, plus the
//! factory that builds it.
//!
//! This mirrors the synchronous model wrapper a hosting platform constructs
//! around a prediction function. Routes are plain values so the activation
//! step can rewrite them after construction.

use crate::error::GateErrorCode;
use crate::predict::predict;
use crate::request::{ModelRequest, ModelResponse};
use crate::{PKG_NAME, VERSION};
use futures::future::BoxFuture;
use hyper::{Method, StatusCode};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// A route handler
pub type Handler = Arc<dyn Fn(ModelRequest) -> BoxFuture<'static, ModelResponse> + Send + Sync>;

/// Hook run on every application a factory builds
pub type BuildHook = Arc<dyn Fn(&mut ModelApp) + Send + Sync>;

/// Wrap an async function as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(ModelRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ModelResponse> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Prediction function signature used by the `/model` route
pub type PredictFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// A registered route
pub struct Route {
    pub method: Method,
    pub path: String,
    handler: Handler,
    proxied: bool,
}

impl Route {
    pub fn is_proxied(&self) -> bool {
        self.proxied
    }

    pub fn handler(&self) -> Handler {
        Arc::clone(&self.handler)
    }
}

/// A constructed front door application
pub struct ModelApp {
    id: Uuid,
    routes: Vec<Route>,
}

impl Default for ModelApp {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelApp {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            routes: Vec::new(),
        }
    }

    /// Unique id of this application instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register or replace a route
    pub fn route(&mut self, method: Method, path: impl Into<String>, handler: Handler) -> &mut Self {
        let path = path.into();
        match self
            .routes
            .iter_mut()
            .find(|r| r.method == method && r.path == path)
        {
            Some(existing) => {
                existing.handler = handler;
                existing.proxied = false;
            }
            None => self.routes.push(Route {
                method,
                path,
                handler,
                proxied: false,
            }),
        }
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn find(&self, method: &Method, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.method == *method && r.path == path)
    }

    pub fn is_proxied(&self, method: &Method, path: &str) -> bool {
        self.find(method, path).map(Route::is_proxied).unwrap_or(false)
    }

    pub fn proxied_count(&self) -> usize {
        self.routes.iter().filter(|r| r.proxied).count()
    }

    /// Replace the handler of every selected, not yet proxied route with
    /// `wrap(original)`. Returns the number of routes rewritten.
    pub fn rewrite_routes<S, W>(&mut self, select: S, wrap: W) -> usize
    where
        S: Fn(&Method, &str) -> bool,
        W: Fn(&Method, &str, Handler) -> Handler,
    {
        let mut rewritten = 0;
        for route in self.routes.iter_mut() {
            if route.proxied || !select(&route.method, &route.path) {
                continue;
            }
            let original = Arc::clone(&route.handler);
            route.handler = wrap(&route.method, &route.path, original);
            route.proxied = true;
            rewritten += 1;
        }
        rewritten
    }

    /// Route a request to its handler
    pub async fn dispatch(&self, req: ModelRequest) -> ModelResponse {
        if let Some(route) = self.find(&req.method, &req.path) {
            let handler = route.handler();
            return handler(req).await;
        }

        if self.routes.iter().any(|r| r.path == req.path) {
            return ModelResponse::error(
                GateErrorCode::MethodNotAllowed,
                format!("Method {} not allowed for {}", req.method, req.path),
            );
        }

        ModelResponse::error(GateErrorCode::NotFound, format!("No route for {}", req.path))
    }
}

/// Builds applications and runs registered hooks on each one
pub struct ModelAppFactory {
    make: Arc<dyn Fn() -> ModelApp + Send + Sync>,
    hooks: Vec<BuildHook>,
}

impl ModelAppFactory {
    pub fn new<F>(make: F) -> Self
    where
        F: Fn() -> ModelApp + Send + Sync + 'static,
    {
        Self {
            make: Arc::new(make),
            hooks: Vec::new(),
        }
    }

    /// Factory for the default model application
    pub fn for_model(predict_fn: PredictFn) -> Self {
        Self::new(move || make_model_app(Arc::clone(&predict_fn)))
    }

    /// Register a hook that runs on every application built afterwards
    pub fn on_build<H>(&mut self, hook: H) -> &mut Self
    where
        H: Fn(&mut ModelApp) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn build(&self) -> ModelApp {
        let mut app = (self.make)();
        for hook in &self.hooks {
            hook(&mut app);
        }
        app
    }
}

/// The template model wrapper: `POST /model`, `GET /health`, `GET /version`
pub fn make_model_app(predict_fn: PredictFn) -> ModelApp {
    let mut app = ModelApp::new();

    app.route(
        Method::POST,
        "/model",
        handler(move |req: ModelRequest| {
            let predict_fn = Arc::clone(&predict_fn);
            async move { model_route(&req, predict_fn.as_ref()) }
        }),
    );

    app.route(
        Method::GET,
        "/health",
        handler(|_req: ModelRequest| async {
            ModelResponse::json(StatusCode::OK, &json!({ "status": "ok" }))
        }),
    );

    app.route(
        Method::GET,
        "/version",
        handler(|_req: ModelRequest| async {
            ModelResponse::json(
                StatusCode::OK,
                &json!({ "name": PKG_NAME, "version": VERSION }),
            )
        }),
    );

    app
}

/// Default model application over the template prediction function
pub fn default_model_app() -> ModelApp {
    make_model_app(Arc::new(predict))
}

/// `{"data": ...}` in, `{"result": ...}` out
pub fn model_route(req: &ModelRequest, predict_fn: &(dyn Fn(&Value) -> Value + Send + Sync)) -> ModelResponse {
    let body = match req.json() {
        Ok(body) => body.unwrap_or(Value::Null),
        Err(e) => {
            return ModelResponse::error(
                GateErrorCode::InvalidBody,
                format!("Request body is not valid JSON: {}", e),
            );
        }
    };

    let data = body.get("data").cloned().unwrap_or(Value::Null);
    ModelResponse::json(StatusCode::OK, &json!({ "result": predict_fn(&data) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_model_route_predicts() {
        let app = default_model_app();
        let req = ModelRequest::new(Method::POST, "/model")
            .with_json(&json!({"data": {"start": 4, "stop": 4}}));

        let resp = app.dispatch(req).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.json_body().unwrap(), json!({"result": {"a_random_number": 4.0}}));
    }

    #[tokio::test]
    async fn test_model_route_empty_body() {
        let app = default_model_app();
        let resp = app.dispatch(ModelRequest::new(Method::POST, "/model")).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.json_body().unwrap()["result"]["prediction"], "example_result");
    }

    #[tokio::test]
    async fn test_model_route_invalid_json() {
        let app = default_model_app();
        let mut req = ModelRequest::new(Method::POST, "/model");
        req.body = hyper::body::Bytes::from_static(b"{oops");

        let resp = app.dispatch(req).await;
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let app = default_model_app();

        let resp = app.dispatch(ModelRequest::new(Method::GET, "/health")).await;
        assert_eq!(resp.json_body().unwrap(), json!({"status": "ok"}));

        let resp = app.dispatch(ModelRequest::new(Method::GET, "/version")).await;
        assert_eq!(resp.json_body().unwrap()["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method() {
        let app = default_model_app();

        let resp = app.dispatch(ModelRequest::new(Method::GET, "/nope")).await;
        assert_eq!(resp.status, StatusCode::NOT_FOUND);

        let resp = app.dispatch(ModelRequest::new(Method::GET, "/model")).await;
        assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_route_replacement_resets_proxied() {
        let mut app = default_model_app();
        let n = app.rewrite_routes(|_, _| true, |_, _, original| original);
        assert_eq!(n, 3);
        assert!(app.is_proxied(&Method::GET, "/health"));

        app.route(
            Method::GET,
            "/health",
            handler(|_req: ModelRequest| async {
                ModelResponse::json(StatusCode::OK, &json!({}))
            }),
        );
        assert!(!app.is_proxied(&Method::GET, "/health"));
        assert_eq!(app.routes().len(), 3);
    }

    #[test]
    fn test_rewrite_skips_proxied_and_unselected() {
        let mut app = default_model_app();
        let first = app.rewrite_routes(|m, _| *m == Method::POST, |_, _, h| h);
        let second = app.rewrite_routes(|_, _| true, |_, _, h| h);
        let third = app.rewrite_routes(|_, _| true, |_, _, h| h);

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 0);
        assert_eq!(app.proxied_count(), 3);
    }

    #[test]
    fn test_factory_runs_hooks_on_each_build() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut factory = ModelAppFactory::for_model(Arc::new(predict));
        let counter = Arc::clone(&calls);
        factory.on_build(move |_app| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let a = factory.build();
        let b = factory.build();
        assert_ne!(a.id(), b.id());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(factory.hook_count(), 1);
    }
}
