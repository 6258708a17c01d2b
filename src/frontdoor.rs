use crate::error::{json_error_response, GateErrorCode};
use crate::model_app::ModelApp;
use crate::request::ModelRequest;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Public HTTP server exposing a constructed [`ModelApp`].
///
/// Requests are buffered and dispatched through the application's route
/// table, so activated routes reach the backend and everything else is
/// served by the original handlers.
pub struct FrontDoor {
    bind_addr: SocketAddr,
    app: Arc<ModelApp>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontDoor {
    pub fn new(bind_addr: SocketAddr, app: Arc<ModelApp>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            app,
            shutdown_rx,
        }
    }

    pub fn app(&self) -> &Arc<ModelApp> {
        &self.app
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            routes = self.app.routes().len(),
            proxied = self.app.proxied_count(),
            "Front door listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let app = Arc::clone(&self.app);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, app).await {
                                    debug!(addr = %addr, error = %e, "Front door connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, addr: SocketAddr, app: Arc<ModelApp>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let app = Arc::clone(&app);
        async move {
            let start = Instant::now();
            let method = req.method().clone();
            let path = req.uri().path().to_string();

            let response = match ModelRequest::from_hyper(req).await {
                Ok(req) => app.dispatch(req).await.into_hyper(),
                Err(e) => json_error_response(
                    GateErrorCode::InvalidBody,
                    format!("Failed to read request body: {}", e),
                ),
            };

            debug!(
                client = %addr,
                %method,
                %path,
                status = response.status().as_u16(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Request completed"
            );
            Ok::<_, hyper::Error>(response)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
