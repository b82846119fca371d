//! The control master: a long-lived multiplexed OpenSSH client process and
//! its Unix-domain rendezvous socket. Chat messages and lifecycle commands
//! piggy-back on the established connection via `ssh -S <sock> …`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::ssh;

/// How long to wait for the control socket to appear after spawn.
const SOCKET_WAIT_BUDGET: Duration = Duration::from_secs(5);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to spawn a control master for one session.
pub struct ControlTarget {
    pub session_id: Uuid,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key_openssh: String,
    /// Full host-key line to pin. When present the master runs with strict
    /// host-key checking against exactly this key.
    pub pinned_host_key: Option<String>,
}

/// A live multiplexed channel to one remote host.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn socket_path(&self) -> &Path;

    /// Lightweight `-O check` against the master.
    async fn check(&self) -> bool;

    /// Execute one remote command over the multiplexed connection and
    /// return its stdout.
    async fn run(&self, command: &str, timeout: Duration) -> Result<String>;

    /// Ask the master to exit; signal it after the grace period; remove the
    /// socket file regardless.
    async fn stop(&self, grace: Duration);
}

#[async_trait]
pub trait ControlLauncher: Send + Sync {
    async fn launch(&self, target: ControlTarget) -> Result<Arc<dyn ControlChannel>>;
}

/// Production launcher: `ssh -M -N -S <sock>` as a detached OS process.
pub struct OpensshLauncher {
    runtime_dir: PathBuf,
}

impl OpensshLauncher {
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self { runtime_dir }
    }
}

struct OpensshChannel {
    socket_path: PathBuf,
    destination: String,
    port: u16,
    child: Mutex<Child>,
}

impl OpensshChannel {
    fn mux_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.socket_path)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ControlChannel for OpensshChannel {
    fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn check(&self) -> bool {
        let mut cmd = self.mux_command();
        cmd.arg("-O")
            .arg("check")
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(Duration::from_secs(5), cmd.output()).await {
            Ok(Ok(output)) => output.status.success(),
            _ => false,
        }
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<String> {
        let mut cmd = self.mux_command();
        cmd.arg(&self.destination)
            .arg("--")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| AppError::SshConnect(format!("remote command timed out after {timeout:?}")))?
            .map_err(|e| AppError::SshConnect(format!("could not run ssh: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::SshConnect(
                stderr.lines().last().unwrap_or("remote command failed").to_string(),
            ))
        }
    }

    async fn stop(&self, grace: Duration) {
        let mut exit = self.mux_command();
        exit.arg("-O")
            .arg("exit")
            .arg(&self.destination)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Ok(Ok(output)) = tokio::time::timeout(grace, exit.output()).await
            && !output.status.success()
        {
            debug!(socket = %self.socket_path.display(), "mux exit command refused");
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(socket = %self.socket_path.display(), "control master survived grace period, killing");
                let _ = child.kill().await;
            }
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

#[async_trait]
impl ControlLauncher for OpensshLauncher {
    async fn launch(&self, target: ControlTarget) -> Result<Arc<dyn ControlChannel>> {
        ssh::ensure_runtime_dir(&self.runtime_dir)?;

        let socket_path = self.runtime_dir.join(format!("{}.sock", target.session_id));
        if socket_path.exists() {
            return Err(AppError::SshLaunch(format!(
                "control socket already exists for session {}",
                target.session_id
            )));
        }

        let key_path = ssh::write_key_file(
            &self.runtime_dir,
            &format!("{}.key", target.session_id),
            &target.private_key_openssh,
        )?;

        // With a pinned host key the master runs strict against a private
        // known_hosts file; first contact falls back to accept-new.
        let known_hosts_path = self.runtime_dir.join(format!("{}.known_hosts", target.session_id));
        let strict = match &target.pinned_host_key {
            Some(host_key) => {
                let line = ssh::known_hosts_line(&target.host, target.port, host_key);
                std::fs::write(&known_hosts_path, format!("{line}\n"))
                    .map_err(|e| AppError::SshLaunch(format!("could not write known_hosts: {e}")))?;
                true
            }
            None => false,
        };

        let destination = ssh::destination(&target.username, &target.host);
        let mut cmd = Command::new("ssh");
        cmd.arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(&socket_path)
            .arg("-i")
            .arg(&key_path)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("IdentitiesOnly=yes")
            .arg("-o")
            .arg("ClearAllForwardings=yes")
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-o")
            .arg(if strict {
                "StrictHostKeyChecking=yes"
            } else {
                "StrictHostKeyChecking=accept-new"
            })
            .arg("-o")
            .arg(format!(
                "UserKnownHostsFile={}",
                known_hosts_path.display()
            ))
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::SshLaunch(format!("could not spawn control master: {e}")))?;

        // Wait for the rendezvous socket, watching for early child death.
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT_BUDGET;
        let socket_appeared = loop {
            if socket_path.exists() {
                break true;
            }
            if let Ok(Some(status)) = child.try_wait() {
                ssh::shred_file(&key_path);
                let _ = std::fs::remove_file(&known_hosts_path);
                return Err(AppError::SshLaunch(format!(
                    "control master exited during startup ({status})"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        };

        if !socket_appeared {
            ssh::shred_file(&key_path);
            let _ = std::fs::remove_file(&known_hosts_path);
            let _ = child.kill().await;
            return Err(AppError::SshLaunch(
                "control socket did not appear within budget".into(),
            ));
        }

        let channel = OpensshChannel {
            socket_path: socket_path.clone(),
            destination,
            port: target.port,
            child: Mutex::new(child),
        };

        // The socket existing does not prove the handshake finished; probe
        // the master before declaring success.
        let healthy = channel.check().await;
        ssh::shred_file(&key_path);
        let _ = std::fs::remove_file(&known_hosts_path);

        if !healthy {
            channel.stop(Duration::from_secs(2)).await;
            return Err(AppError::SshLaunch(
                "control master did not answer mux check".into(),
            ));
        }

        debug!(socket = %socket_path.display(), "control master ready");
        Ok(Arc::new(channel))
    }
}
