use crate::host::{AuthMethod, Host};
use crate::{CaravanError, ConnectFailure, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Authenticated remote shell session against one host.
///
/// All operations act on live remote state; there is no dry-run mode.
/// Callers pre-validate (e.g. `exec("test -e ...")`) before destructive
/// commands.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Fleet name of the host this session is bound to.
    fn host_name(&self) -> &str;

    /// Run a command to completion and return its stdout.
    async fn exec(&self, command: &str) -> Result<String>;

    /// Run a command whose stdout is piped incrementally into `sink`.
    /// Bounded by the sink's backing store (normally disk), never by
    /// process memory. Returns the number of bytes streamed.
    async fn stream_command(
        &self,
        command: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;

    /// Copy one local file to the remote path, overwriting the
    /// destination and preserving permissions where feasible.
    async fn upload_file(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Release the session. Safe to call after a failed connect.
    async fn disconnect(&self) -> Result<()>;
}

/// Produces connected sessions. The orchestrator, scheduler dispatch and
/// trust setup all go through this seam, which is what tests mock.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn RemoteExec>>;
}

/// Session backed by the system OpenSSH client. A ControlMaster socket is
/// established once at connect; every exec/upload multiplexes over it, so
/// per-command latency stays low and `disconnect` tears down one place.
pub struct SshSession {
    host: Host,
    control_path: PathBuf,
}

const CONNECT_TIMEOUT_SECS: u32 = 10;

impl SshSession {
    pub async fn connect(host: &Host, control_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(control_dir).await?;
        let control_path =
            control_dir.join(format!("{}-{}.sock", host.name, uuid::Uuid::new_v4()));
        let session = Self {
            host: host.clone(),
            control_path,
        };

        let mut cmd = session.ssh_command();
        cmd.arg("-o").arg("ControlMaster=yes");
        cmd.arg("-fN").arg(session.host.ssh.destination());
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!(host = %host.name, %stderr, "ssh control master failed");
            return Err(CaravanError::Connection {
                host: host.name.clone(),
                kind: classify_connect_failure(&stderr),
            });
        }
        debug!(host = %host.name, "ssh session established");
        Ok(session)
    }

    /// Base ssh invocation: non-interactive, fixed timeouts, multiplexed
    /// over the session's control socket. BatchMode is only safe with key
    /// auth; sshpass needs the password prompt to exist.
    fn ssh_command(&self) -> Command {
        let mut cmd = match &self.host.ssh.auth {
            AuthMethod::Password { password } => {
                let mut c = Command::new("sshpass");
                c.arg("-p").arg(password);
                c.arg("ssh");
                c
            }
            AuthMethod::Key { path } => {
                let mut c = Command::new("ssh");
                c.arg("-i").arg(path);
                c.arg("-o").arg("BatchMode=yes");
                c
            }
        };
        cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS));
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd.arg("-p").arg(self.host.ssh.port.to_string());
        cmd.stdin(Stdio::null());
        cmd
    }

    fn scp_command(&self) -> Command {
        let mut cmd = match &self.host.ssh.auth {
            AuthMethod::Password { password } => {
                let mut c = Command::new("sshpass");
                c.arg("-p").arg(password);
                c.arg("scp");
                c
            }
            AuthMethod::Key { path } => {
                let mut c = Command::new("scp");
                c.arg("-i").arg(path);
                c.arg("-o").arg("BatchMode=yes");
                c
            }
        };
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd.arg("-P").arg(self.host.ssh.port.to_string());
        cmd.stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl RemoteExec for SshSession {
    fn host_name(&self) -> &str {
        &self.host.name
    }

    async fn exec(&self, command: &str) -> Result<String> {
        debug!(host = %self.host.name, %command, "exec");
        let mut cmd = self.ssh_command();
        cmd.arg(self.host.ssh.destination()).arg("--").arg(command);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(CaravanError::Command {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn stream_command(
        &self,
        command: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        debug!(host = %self.host.name, %command, "stream");
        let mut cmd = self.ssh_command();
        cmd.arg(self.host.ssh.destination()).arg("--").arg(command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaravanError::TransferInterrupted("no stdout pipe".into()))?;

        let copied = tokio::io::copy(&mut stdout, sink)
            .await
            .map_err(|e| CaravanError::TransferInterrupted(e.to_string()))?;
        sink.flush()
            .await
            .map_err(|e| CaravanError::TransferInterrupted(e.to_string()))?;

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(CaravanError::TransferInterrupted(format!(
                "remote stream exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(copied)
    }

    async fn upload_file(&self, local: &Path, remote: &Path) -> Result<()> {
        debug!(host = %self.host.name, local = %local.display(), remote = %remote.display(), "upload");
        let mut cmd = self.scp_command();
        cmd.arg("-p"); // preserve mode and times
        cmd.arg(local);
        cmd.arg(format!(
            "{}:{}",
            self.host.ssh.destination(),
            remote.display()
        ));
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(CaravanError::Command {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.control_path.exists() {
            // Connect never completed; nothing to tear down.
            return Ok(());
        }
        let mut cmd = self.ssh_command();
        cmd.arg("-O").arg("exit").arg(self.host.ssh.destination());
        cmd.stderr(Stdio::null());
        let _ = cmd.status().await;
        let _ = tokio::fs::remove_file(&self.control_path).await;
        debug!(host = %self.host.name, "ssh session closed");
        Ok(())
    }
}

/// Factory wired into the orchestrator and scheduler at construction.
pub struct SshSessionFactory {
    control_dir: PathBuf,
}

impl SshSessionFactory {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            control_dir: state_dir.join("ssh"),
        }
    }
}

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn RemoteExec>> {
        let session = SshSession::connect(host, &self.control_dir).await?;
        Ok(Arc::new(session))
    }
}

fn classify_connect_failure(stderr: &str) -> ConnectFailure {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("authentication")
        || lower.contains("too many authentication failures")
    {
        ConnectFailure::AuthFailed
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ConnectFailure::Timeout
    } else {
        ConnectFailure::Unreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_are_classified() {
        assert_eq!(
            classify_connect_failure("root@10.0.0.1: Permission denied (publickey)"),
            ConnectFailure::AuthFailed
        );
        assert_eq!(
            classify_connect_failure("ssh: connect to host 10.0.0.1 port 22: Connection timed out"),
            ConnectFailure::Timeout
        );
        assert_eq!(
            classify_connect_failure("ssh: connect to host 10.0.0.1 port 22: No route to host"),
            ConnectFailure::Unreachable
        );
    }
}
