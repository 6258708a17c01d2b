use modelgate::activation::Activation;
use modelgate::backend::{BackendServer, BackendState};
use modelgate::config::{normalize_root_path, Config};
use modelgate::frontdoor::FrontDoor;
use modelgate::launcher::BACKEND_SUBCOMMAND;
use modelgate::model_app::ModelAppFactory;
use modelgate::predict::predict;
use modelgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const FRONT_SUBCOMMAND: &str = "front";

/// Exit code for configuration and bind errors
const EXIT_FAILURE: u8 = 1;
/// Exit code for usage errors
const EXIT_USAGE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Front,
    Backend,
}

fn usage() -> String {
    format!(
        "usage: {name} <{front}|{backend}> [config.toml]",
        name = PKG_NAME,
        front = FRONT_SUBCOMMAND,
        backend = BACKEND_SUBCOMMAND
    )
}

fn parse_args(args: &[String]) -> Result<(Mode, Option<PathBuf>), String> {
    let mode = match args.first().map(String::as_str) {
        Some(FRONT_SUBCOMMAND) => Mode::Front,
        Some(BACKEND_SUBCOMMAND) => Mode::Backend,
        Some(other) => return Err(format!("unknown command '{}'", other)),
        None => return Err("missing command".to_string()),
    };

    match args.len() {
        1 => Ok((mode, None)),
        2 => Ok((mode, Some(PathBuf::from(&args[1])))),
        _ => Err("too many arguments".to_string()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (mode, config_path) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{}: {}\n{}", PKG_NAME, e, usage());
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let config = match load_config(config_path.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    info!(name = PKG_NAME, version = VERSION, mode = ?mode, "Starting");

    let result = match mode {
        Mode::Front => run_front(config).await,
        Mode::Backend => run_backend(config).await,
    };

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// File (or defaults), then environment overrides, then validation
fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => {
            let config = Config::load(path)
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", bind, port, e))
}

async fn run_front(config: Config) -> anyhow::Result<()> {
    info!(
        bind = %config.front.bind,
        port = config.front.port,
        backend = %config.backend.base_url(),
        spawn = config.backend.spawn,
        proxied_routes = ?config.front.proxied_routes,
        forward_timeout_secs = config.front.forward_timeout_secs,
        "Front door configuration"
    );

    let addr = socket_addr(&config.front.bind, config.front.port)?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

    let activation = Activation::from_config(&config)?;
    let mut factory = ModelAppFactory::for_model(Arc::new(predict));
    activation.install(&mut factory);
    let app = Arc::new(factory.build());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let front = FrontDoor::new(addr, app, shutdown_rx);
    let handle = tokio::spawn(front.serve(listener));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    activation.launcher().stop().await;

    let stats = activation.stats();
    info!(
        forwarded = stats.get_forwarded(),
        fallbacks = stats.get_fallbacks(),
        "Front door statistics"
    );

    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    Ok(())
}

async fn run_backend(config: Config) -> anyhow::Result<()> {
    let root_path = normalize_root_path(&config.app.root_path);
    info!(
        host = %config.backend.host,
        port = config.backend.port,
        root_path = %root_path,
        remote_configured = config.remote.model_url().is_some(),
        "Backend configuration"
    );

    let addr = config.backend.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

    let state = Arc::new(BackendState::from_config(&config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = BackendServer::new(addr, state, shutdown_rx);
    let handle = tokio::spawn(server.serve(listener));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}
