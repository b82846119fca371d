//! One-shot connectivity test against a (host, user, port, key) tuple.
//!
//! The prober is purely functional: it never touches the store. Callers
//! persist the outcome themselves.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use crate::crypto;
use crate::ssh;

/// What to probe. The private key arrives decrypted; it only ever touches
/// disk as a mode-600 file that is shredded before the probe returns.
pub struct ProbeTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub private_key_openssh: &'a str,
    pub expected_fingerprint: Option<&'a str>,
    pub timeout: Duration,
}

/// Typed probe outcome, serialized verbatim as the `/connections/:id/test`
/// response. `Ok.host_key` carries the full host-key line so a caller may
/// pin it; it never leaves the server.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ok {
        latency_ms: u64,
        host_key_fingerprint: String,
        #[serde(skip)]
        host_key: String,
    },
    HostKeyChanged {
        old_fingerprint: String,
        new_fingerprint: String,
    },
    Failed {
        message: String,
    },
    Timeout {
        message: String,
    },
}

#[async_trait]
pub trait ConnectionProber: Send + Sync {
    async fn probe(&self, target: ProbeTarget<'_>) -> ProbeOutcome;
}

/// Production prober driving the OpenSSH client binaries: `ssh-keyscan`
/// for host-key discovery, then `ssh … true` for the handshake, auth and
/// trivial-command phases, all under the caller's deadline.
pub struct SshProber {
    runtime_dir: PathBuf,
}

impl SshProber {
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self { runtime_dir }
    }

    async fn scan_host_key(
        &self,
        host: &str,
        port: u16,
        budget: Duration,
    ) -> Result<String, ProbeOutcome> {
        let scan_secs = budget.as_secs().clamp(1, 30);
        let mut cmd = Command::new("ssh-keyscan");
        cmd.arg("-p")
            .arg(port.to_string())
            .arg("-T")
            .arg(scan_secs.to_string())
            .arg("-t")
            .arg("ed25519")
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(budget, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProbeOutcome::Failed {
                    message: format!("ssh-keyscan could not run: {e}"),
                });
            }
            Err(_) => {
                return Err(ProbeOutcome::Timeout {
                    message: "host key scan timed out".into(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if line.starts_with('#') {
                continue;
            }
            // "<host> <keytype> <base64>"
            let mut parts = line.split_whitespace();
            let _host = parts.next();
            if let (Some(keytype), Some(b64)) = (parts.next(), parts.next()) {
                return Ok(format!("{keytype} {b64}"));
            }
        }
        Err(ProbeOutcome::Failed {
            message: "host presented no ed25519 host key".into(),
        })
    }
}

#[async_trait]
impl ConnectionProber for SshProber {
    async fn probe(&self, target: ProbeTarget<'_>) -> ProbeOutcome {
        let deadline = Instant::now() + target.timeout;

        let host_key = match self
            .scan_host_key(target.host, target.port, target.timeout)
            .await
        {
            Ok(key) => key,
            Err(outcome) => return outcome,
        };
        let fingerprint = match crypto::fingerprint_openssh_line(&host_key) {
            Some(fp) => fp,
            None => {
                return ProbeOutcome::Failed {
                    message: "host key was not parseable".into(),
                };
            }
        };

        if let Some(expected) = target.expected_fingerprint
            && expected != fingerprint
        {
            return ProbeOutcome::HostKeyChanged {
                old_fingerprint: expected.to_string(),
                new_fingerprint: fingerprint,
            };
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ProbeOutcome::Timeout {
                message: "deadline exhausted before authentication".into(),
            };
        }

        let key_path = match ssh::write_key_file(
            &self.runtime_dir,
            &format!("probe-{}.key", Uuid::new_v4()),
            target.private_key_openssh,
        ) {
            Ok(path) => path,
            Err(e) => {
                return ProbeOutcome::Failed {
                    message: format!("could not stage key material: {e}"),
                };
            }
        };

        let connect_secs = remaining.as_secs().clamp(1, 30);
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&key_path)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("IdentitiesOnly=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_secs}"))
            // Host-key trust is decided above against the scanned key; the
            // process-wide known_hosts must not interfere.
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg(ssh::destination(target.username, target.host))
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let result = tokio::time::timeout(remaining, cmd.output()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        ssh::shred_file(&key_path);

        match result {
            Ok(Ok(output)) if output.status.success() => {
                debug!(host = target.host, latency_ms, "probe succeeded");
                ProbeOutcome::Ok {
                    latency_ms,
                    host_key_fingerprint: fingerprint,
                    host_key,
                }
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = stderr
                    .lines()
                    .last()
                    .unwrap_or("ssh exited with an error")
                    .to_string();
                ProbeOutcome::Failed { message }
            }
            Ok(Err(e)) => ProbeOutcome::Failed {
                message: format!("ssh could not run: {e}"),
            },
            Err(_) => ProbeOutcome::Timeout {
                message: format!("no response within {:?}", target.timeout),
            },
        }
    }
}
