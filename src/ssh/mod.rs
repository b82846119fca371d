//! SSH plumbing: the one-shot connectivity prober, the long-lived control
//! master, and the small filesystem helpers both share.
//!
//! Everything here drives the OpenSSH client as a subprocess; no SSH
//! protocol code lives in this crate.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::error::Result;

pub mod control;
pub mod prober;

pub use control::{ControlChannel, ControlLauncher, ControlTarget, OpensshLauncher};
pub use prober::{ConnectionProber, ProbeOutcome, ProbeTarget, SshProber};

/// Single-line installer the user runs on their host to authorize our key.
/// The public key is sh-quoted; the command shape is fixed.
pub fn install_command(public_key_openssh: &str) -> String {
    format!(
        "mkdir -p ~/.ssh && echo {} >> ~/.ssh/authorized_keys && chmod 700 ~/.ssh && chmod 600 ~/.ssh/authorized_keys",
        sh_quote(public_key_openssh)
    )
}

/// Quote a string for /bin/sh by wrapping in single quotes, escaping any
/// embedded single quote as `'\''`.
fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The `user@host` destination argument handed to the OpenSSH client.
pub fn destination(username: &str, host: &str) -> String {
    format!("{username}@{host}")
}

/// A known_hosts line pinning one host key. Non-default ports use the
/// bracketed form OpenSSH expects.
pub fn known_hosts_line(host: &str, port: u16, host_key: &str) -> String {
    if port == 22 {
        format!("{host} {host_key}")
    } else {
        format!("[{host}]:{port} {host_key}")
    }
}

/// Ensure the runtime directory exists, owner-only.
pub fn ensure_runtime_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).context("failed to create runtime dir")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .context("failed to set runtime dir permissions")?;
    }
    Ok(())
}

/// Write decrypted private-key material to a mode-600 file under the
/// runtime directory. Callers must pair this with [`shred_file`].
pub fn write_key_file(dir: &Path, name: &str, contents: &str) -> Result<PathBuf> {
    ensure_runtime_dir(dir)?;
    let path = dir.join(name);
    std::fs::write(&path, contents).context("failed to write key file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("failed to set key file permissions")?;
    }
    Ok(path)
}

/// Best-effort destruction of short-lived key material: overwrite with
/// zeros, then unlink. Absence is not an error.
pub fn shred_file(path: &Path) {
    if let Ok(meta) = std::fs::metadata(path) {
        let _ = std::fs::write(path, vec![0u8; meta.len() as usize]);
        let _ = std::fs::remove_file(path);
    }
}
