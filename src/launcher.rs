use crate::config::{BackendConfig, ENV_BACKEND_HOST, ENV_BACKEND_PORT};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Subcommand the default backend command runs
pub const BACKEND_SUBCOMMAND: &str = "backend";

/// Starts the background server at most once and tracks its readiness.
///
/// `BackendLauncher` is shared behind an `Arc`; [`new`](BackendLauncher::new)
/// returns `Arc<Self>` because launching spawns a readiness task that holds a
/// clone.
///
/// ```ignore
/// let launcher = BackendLauncher::new(config.backend.clone());
/// launcher.ensure_started(); // spawns
/// launcher.ensure_started(); // no-op
/// ```
pub struct BackendLauncher {
    config: BackendConfig,
    /// Set by the first `ensure_started`; never cleared
    launched: AtomicBool,
    /// Flips to true once the health endpoint answers 2xx
    ready_tx: watch::Sender<bool>,
    child: Mutex<Option<Child>>,
}

impl BackendLauncher {
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            launched: AtomicBool::new(false),
            ready_tx,
            child: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Whether a launch has been attempted in this process
    pub fn is_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    /// Whether the backend has answered its health endpoint
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// PID of the spawned child, if one is running
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(|c| c.id())
    }

    /// Launch the backend unless a launch was already attempted.
    ///
    /// Returns true if this call performed the launch. Never blocks and never
    /// fails; spawn errors are logged and leave the gate in fallback mode.
    /// Outside a Tokio runtime nothing is launched and the attempt is left
    /// for the next call made from within one.
    pub fn ensure_started(self: &Arc<Self>) -> bool {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No Tokio runtime on this thread, deferring backend launch to the first proxied request");
            return false;
        }

        if self
            .launched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Backend already launched");
            return false;
        }

        if self.config.spawn {
            match self.spawn_child() {
                Ok(child) => {
                    info!(
                        pid = child.id().unwrap_or(0),
                        host = %self.config.host,
                        port = self.config.port,
                        "Backend process spawned"
                    );
                    *self.child.lock() = Some(child);
                }
                Err(e) => {
                    error!(error = %e, "Failed to launch backend, serving front door handlers only");
                    return true;
                }
            }
        } else {
            info!(
                host = %self.config.host,
                port = self.config.port,
                "Backend spawning disabled, expecting an externally managed backend"
            );
        }

        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            launcher.poll_ready().await;
        });

        true
    }

    /// Build the command that runs the backend
    fn command(&self) -> anyhow::Result<Command> {
        let mut cmd = match self.config.command {
            Some(ref command) => {
                let mut cmd = Command::new(command);
                cmd.args(&self.config.args);
                cmd
            }
            None => {
                let exe = std::env::current_exe()
                    .map_err(|e| anyhow::anyhow!("Cannot locate current executable: {}", e))?;
                let mut cmd = Command::new(exe);
                cmd.arg(BACKEND_SUBCOMMAND);
                cmd.args(&self.config.args);
                cmd
            }
        };

        cmd.stdin(Stdio::null());
        if self.config.quiet {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.env(ENV_BACKEND_HOST, &self.config.host);
        cmd.env(ENV_BACKEND_PORT, self.config.port.to_string());
        cmd.kill_on_drop(true);

        Ok(cmd)
    }

    fn spawn_child(&self) -> anyhow::Result<Child> {
        let mut cmd = self.command()?;
        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn {:?}: {}", self.config.command, e))?;
        Ok(child)
    }

    /// Probe the health endpoint until it answers or attempts run out
    async fn poll_ready(&self) {
        let interval = self.config.startup_poll_interval();
        let attempts = self.config.startup_poll_attempts;

        for attempt in 1..=attempts {
            tokio::time::sleep(interval).await;

            if check_health(&self.config.host, self.config.port, &self.config.health_path).await {
                self.ready_tx.send_replace(true);
                info!(
                    url = %self.config.base_url(),
                    attempt,
                    "Backend is ready"
                );
                return;
            }
            debug!(attempt, attempts, "Backend not ready yet");
        }

        warn!(
            url = %self.config.base_url(),
            attempts,
            "Backend may not have started properly, requests will fall back when it is unreachable"
        );
    }

    /// Wait until the backend reports ready, or the timeout elapses
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_tx.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    /// Stop the child process: SIGTERM, then SIGKILL after the grace period
    pub async fn stop(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        self.ready_tx.send_replace(false);

        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to backend");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Backend process exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for backend to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

/// GET the health path and report whether it answered 2xx
async fn check_health(host: &str, port: u16, path: &str) -> bool {
    let host_port = format!("{}:{}", host, port);

    let mut stream = match tokio::time::timeout(
        Duration::from_secs(1),
        tokio::net::TcpStream::connect(&host_port),
    )
    .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host_port
    );

    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(Duration::from_secs(1), async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (200..300).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}
