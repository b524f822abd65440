//! A single tunnel process together with its config artifact

use crate::proxy::models::EndpointDescriptor;
use crate::proxy::tunnel::config::{build_config, write_artifact};
use crate::proxy::tunnel::TunnelError;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Process-level settings shared by every session of a run
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub binary: PathBuf,
    pub config_dir: PathBuf,
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub kill_grace: Duration,
}

/// A running tunnel bound to a local port
///
/// [`TunnelSession::shutdown`] is the teardown path: it stops the process
/// (SIGTERM, then SIGKILL after the grace period) and deletes the config.
/// Dropping a session without shutting it down still kills the process and
/// removes the config, but does not wait for the process to exit.
#[derive(Debug)]
pub struct TunnelSession {
    port: u16,
    config_path: Option<PathBuf>,
    child: Option<Child>,
    kill_grace: Duration,
}

impl TunnelSession {
    /// Write the config for `descriptor` and start the tunnel on `port`
    pub async fn open(
        descriptor: &EndpointDescriptor,
        port: u16,
        settings: &SessionSettings,
    ) -> Result<Self, TunnelError> {
        let config = build_config(descriptor, port)?;
        let config_path = write_artifact(&settings.config_dir, &config)?;

        let mut session = Self {
            port,
            config_path: Some(config_path),
            child: None,
            kill_grace: settings.kill_grace,
        };

        match Self::spawn(&settings.binary, session.config_path()) {
            Ok(child) => {
                debug!(port, pid = ?child.id(), "tunnel process started");
                session.child = Some(child);
                Ok(session)
            }
            Err(e) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }

    fn spawn(binary: &Path, config_path: &Path) -> Result<Child, TunnelError> {
        Command::new(binary)
            .arg("run")
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => TunnelError::BinaryNotFound(binary.to_path_buf()),
                _ => TunnelError::Spawn(e.to_string()),
            })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn config_path(&self) -> &Path {
        self.config_path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// SOCKS proxy URL for the local listener
    pub fn proxy_url(&self) -> String {
        format!("socks5h://127.0.0.1:{}", self.port)
    }

    /// Poll the local listener until it accepts a connection
    ///
    /// Fails early if the process exits, which is how a failed bind shows up.
    pub async fn wait_ready(&mut self, timeout: Duration, poll_interval: Duration) -> Result<(), TunnelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(TunnelError::ProcessExited(status.to_string()));
                }
            }

            let connect = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port));
            if let Ok(Ok(_stream)) = tokio::time::timeout(poll_interval, connect).await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(TunnelError::ReadyTimeout(timeout));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Stop the process and remove the config artifact
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            terminate(&mut child, self.kill_grace).await;
        }
        self.remove_config();
    }

    fn remove_config(&mut self) {
        if let Some(path) = self.config_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove tunnel config");
                }
            }
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        self.remove_config();
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let target = Pid::from_raw(pid as i32);
            if kill(target, Signal::SIGTERM).is_ok()
                && tokio::time::timeout(grace, child.wait()).await.is_ok()
            {
                return;
            }
            warn!(pid, "tunnel did not exit after SIGTERM, killing");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill tunnel process");
    }
}
