//! Activation: start the background server and turn front door routes into
//! forwarding proxies with a fallback to their original handlers.
//!
//! The composition root owns one [`Activation`] and reaches it through any of
//! three entry points. All of them go through [`Activation::ensure_activated`],
//! which patches each application instance at most once:
//!
//! - an application that is already built: call `ensure_activated` directly;
//! - applications a factory will build later: [`Activation::install`];
//! - a bare constructor: [`Activation::wrap`].

use crate::config::Config;
use crate::forward::{Forwarder, ForwarderConfig};
use crate::launcher::BackendLauncher;
use crate::model_app::{handler, Handler, ModelApp, ModelAppFactory};
use crate::request::ModelRequest;
use dashmap::DashSet;
use hyper::Method;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters for proxied routes
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Requests answered by the backend
    pub forwarded: AtomicU64,
    /// Requests answered by the original handler after a forwarding failure
    pub fallbacks: AtomicU64,
}

impl ProxyStats {
    pub fn get_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn get_fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }
}

pub struct Activation {
    launcher: Arc<BackendLauncher>,
    forwarder: Arc<Forwarder>,
    /// Routes to proxy; empty proxies every route
    routes: Vec<(Method, String)>,
    /// Application instances already patched
    patched: DashSet<Uuid>,
    stats: Arc<ProxyStats>,
}

impl Activation {
    pub fn new(
        launcher: Arc<BackendLauncher>,
        forwarder: Arc<Forwarder>,
        routes: Vec<(Method, String)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            forwarder,
            routes,
            patched: DashSet::new(),
            stats: Arc::new(ProxyStats::default()),
        })
    }

    /// Build the launcher, forwarder and activation described by `config`
    pub fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let routes = config
            .front
            .routes()
            .map_err(|e| anyhow::anyhow!("Invalid proxied route: {}", e))?;

        let launcher = BackendLauncher::new(config.backend_launch_config());
        let forwarder = Arc::new(Forwarder::new(ForwarderConfig {
            base_url: config.backend.base_url(),
            connect_timeout: config.front.forward_connect_timeout(),
            request_timeout: config.front.forward_timeout(),
        }));

        Ok(Self::new(launcher, forwarder, routes))
    }

    pub fn launcher(&self) -> &Arc<BackendLauncher> {
        &self.launcher
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_activated(&self, app: &ModelApp) -> bool {
        self.patched.contains(&app.id())
    }

    /// Number of application instances patched so far
    pub fn activated_count(&self) -> usize {
        self.patched.len()
    }

    /// Launch the backend and proxy the application's routes, once per
    /// application. Returns true if this call did the patching.
    pub fn ensure_activated(&self, app: &mut ModelApp) -> bool {
        if !self.patched.insert(app.id()) {
            debug!(app_id = %app.id(), "Application already activated");
            return false;
        }

        self.launcher.ensure_started();

        let rewritten = app.rewrite_routes(
            |method, path| self.selects(method, path),
            |method, path, original| self.proxy_handler(method, path, original),
        );

        info!(
            app_id = %app.id(),
            routes = rewritten,
            backend = %self.forwarder.config().base_url,
            "Front door routes now forward to the backend"
        );
        true
    }

    /// Activate every application `factory` builds from now on
    pub fn install(self: &Arc<Self>, factory: &mut ModelAppFactory) {
        let activation = Arc::clone(self);
        factory.on_build(move |app| {
            activation.ensure_activated(app);
        });
    }

    /// Wrap a constructor so the application it returns is activated
    pub fn wrap<F>(self: &Arc<Self>, make: F) -> impl Fn() -> ModelApp + Send + Sync + 'static
    where
        F: Fn() -> ModelApp + Send + Sync + 'static,
    {
        let activation = Arc::clone(self);
        move || {
            let mut app = make();
            activation.ensure_activated(&mut app);
            app
        }
    }

    fn selects(&self, method: &Method, path: &str) -> bool {
        self.routes.is_empty() || self.routes.iter().any(|(m, p)| m == method && p == path)
    }

    /// Forward first, fall back to `original` on any forwarding error
    fn proxy_handler(&self, method: &Method, path: &str, original: Handler) -> Handler {
        let launcher = Arc::clone(&self.launcher);
        let forwarder = Arc::clone(&self.forwarder);
        let stats = Arc::clone(&self.stats);
        debug!(%method, path, "Proxying route");

        handler(move |req: ModelRequest| {
            let launcher = Arc::clone(&launcher);
            let forwarder = Arc::clone(&forwarder);
            let stats = Arc::clone(&stats);
            let original = Arc::clone(&original);
            async move {
                launcher.ensure_started();

                match forwarder.forward(&req).await {
                    Ok(response) => {
                        stats.forwarded.fetch_add(1, Ordering::Relaxed);
                        response
                    }
                    Err(e) => {
                        stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            method = %req.method,
                            path = %req.path,
                            error = %e,
                            "Forwarding failed, answering from the front door handler"
                        );
                        original(req).await
                    }
                }
            }
        })
    }
}
