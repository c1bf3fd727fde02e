//! OpenSSH-backed remote session
//!
//! A single control master holds the authenticated connection; every command
//! and file transfer is multiplexed over its control socket, so a run pays for
//! authentication once.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::ProvisionError;
use crate::models::deployment::{CredentialRef, ServerDescriptor};
use crate::remote::session::{CommandOutput, RemoteSession, SessionConnector};
use crate::remote::stream::{self, OutputSink, StreamCapture, StreamKind};
use crate::storage::settings::SshSettings;
use crate::utils::sha256_hash;

/// Exit status the ssh client uses for its own failures
const SSH_CLIENT_FAILURE: i32 = 255;

/// Session over an OpenSSH control master
pub struct SshSession {
    server: ServerDescriptor,
    settings: SshSettings,
    control_path: PathBuf,
    password: Option<SecretString>,
    closed: AtomicBool,
}

impl SshSession {
    /// Authenticate and start the control master
    pub async fn connect(server: &ServerDescriptor, settings: &SshSettings) -> Result<Self, ProvisionError> {
        tokio::fs::create_dir_all(&settings.control_dir).await?;

        let password = match &server.credential {
            CredentialRef::PasswordEnv { var } => {
                let value = std::env::var(var).map_err(|_| {
                    ProvisionError::AuthError(format!("Password variable {} is not set", var))
                })?;
                Some(SecretString::from(value))
            }
            CredentialRef::IdentityFile { .. } | CredentialRef::Agent => None,
        };

        let session = Self {
            server: server.clone(),
            settings: settings.clone(),
            control_path: control_path(&settings.control_dir, server),
            password,
            closed: AtomicBool::new(false),
        };

        info!(
            "Connecting to {}@{}:{}",
            server.username, server.hostname, server.port
        );

        let mut cmd = session.ssh_command(true);
        cmd.arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(format!("ControlPersist={}s", settings.control_persist_secs))
            .arg("-N")
            .arg("-f")
            .arg(session.destination());

        // The backgrounded master keeps inherited pipes open, so its
        // diagnostics go to a file instead of a pipe we would wait on.
        let log_path = session.control_path.with_extension("log");
        let log_file = std::fs::File::create(&log_path)?;
        cmd.stdout(Stdio::null()).stderr(Stdio::from(log_file));

        // ssh enforces ConnectTimeout itself; the outer bound also covers auth
        let outer = settings.connect_timeout() + Duration::from_secs(5);
        let status = match tokio::time::timeout(outer, cmd.status()).await {
            Ok(status) => status?,
            Err(_) => {
                return Err(ProvisionError::ConnectionError(format!(
                    "Connecting to {} exceeded {:?}",
                    server.hostname, outer
                )))
            }
        };

        if !status.success() {
            let stderr = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
            return Err(classify_connect_failure(&stderr));
        }

        debug!("Control master ready at {}", session.control_path.display());
        Ok(session)
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.server.username, self.server.hostname)
    }

    /// `ssh` (or `sshpass -e ssh`) with the shared options applied
    fn ssh_command(&self, master: bool) -> Command {
        let mut cmd = self.client_command("ssh", master);
        cmd.arg("-p").arg(self.server.port.to_string());
        cmd
    }

    fn client_command(&self, program: &str, master: bool) -> Command {
        let mut cmd = match (&self.password, master) {
            (Some(password), true) => {
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password.expose_secret()).arg("-e").arg(program);
                cmd
            }
            _ => Command::new(program),
        };

        let host_key = if self.settings.strict_host_key_checking {
            "StrictHostKeyChecking=yes"
        } else {
            "StrictHostKeyChecking=accept-new"
        };

        cmd.arg("-o")
            .arg(host_key)
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.settings.connect_timeout_secs))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));

        if self.password.is_none() {
            cmd.arg("-o").arg("BatchMode=yes");
        }
        if let CredentialRef::IdentityFile { path } = &self.server.credential {
            cmd.arg("-i").arg(path);
        }
        if !master {
            cmd.arg("-o").arg("ControlMaster=no");
        }

        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Whether the control master still answers
    async fn master_alive(&self) -> bool {
        let mut cmd = self.ssh_command(false);
        cmd.arg("-O").arg("check").arg(self.destination());
        matches!(
            run_bounded(cmd, Duration::from_secs(5)).await,
            Ok(output) if output.status.success()
        )
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        sink: Arc<dyn OutputSink>,
    ) -> Result<CommandOutput, ProvisionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProvisionError::ConnectionError("Session already closed".to_string()));
        }

        debug!("Executing on {}: {}", self.server.hostname, command);

        let mut cmd = self.ssh_command(false);
        cmd.arg(self.destination())
            .arg("--")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ProvisionError::ConnectionError(format!("Failed to launch ssh: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProvisionError::Internal("ssh stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProvisionError::Internal("ssh stderr not captured".to_string()))?;

        let stdout = StreamCapture::spawn(StreamKind::Stdout, stdout, sink.clone());
        let stderr = StreamCapture::spawn(StreamKind::Stderr, stderr, sink);

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                // Local client only; the remote process may keep running
                let _ = child.start_kill();
                let captured = stream::collect(stdout, stderr, self.settings.drain_timeout()).await;
                return Err(ProvisionError::Timeout(format!(
                    "Command exceeded {:?}: {} (last output: {})",
                    timeout,
                    command,
                    last_line(&captured.stderr).or(last_line(&captured.stdout)).unwrap_or("none")
                )));
            }
        };

        let captured = stream::collect(stdout, stderr, self.settings.drain_timeout()).await;
        let exit_code = status.code().unwrap_or(-1);

        if exit_code == SSH_CLIENT_FAILURE && !self.master_alive().await {
            return Err(ProvisionError::ConnectionError(format!(
                "Connection to {} lost: {}",
                self.server.hostname,
                captured.stderr.trim()
            )));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
        })
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), ProvisionError> {
        info!(
            "Uploading {} to {}:{}",
            local_path.display(),
            self.server.hostname,
            remote_path
        );

        let mut cmd = self.client_command("scp", false);
        cmd.arg("-P")
            .arg(self.server.port.to_string())
            .arg(local_path)
            .arg(format!("{}:{}", self.destination(), remote_path));

        let output = run_bounded(cmd, self.settings.command_timeout()).await?;
        if !output.status.success() {
            return Err(ProvisionError::CommandError(format!(
                "scp to {} failed: {}",
                remote_path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ProvisionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut cmd = self.ssh_command(false);
        cmd.arg("-O").arg("exit").arg(self.destination());
        match run_bounded(cmd, Duration::from_secs(10)).await {
            Ok(_) => debug!("Closed session to {}", self.server.hostname),
            Err(e) => warn!("Failed to stop control master for {}: {}", self.server.hostname, e),
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            // Best effort; ControlPersist reaps the master eventually anyway
            let _ = std::process::Command::new("ssh")
                .arg("-o")
                .arg(format!("ControlPath={}", self.control_path.display()))
                .arg("-O")
                .arg("exit")
                .arg(self.destination())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
    }
}

/// Connector producing [`SshSession`]s
#[derive(Debug, Clone)]
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Arc<dyn RemoteSession>, ProvisionError> {
        let session = SshSession::connect(server, &self.settings).await?;
        Ok(Arc::new(session))
    }
}

async fn run_bounded(mut cmd: Command, bound: Duration) -> Result<Output, ProvisionError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    match tokio::time::timeout(bound, cmd.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(ProvisionError::Timeout(format!("ssh client exceeded {:?}", bound))),
    }
}

/// Socket path per user/host/port; hashed to stay under the unix socket limit
fn control_path(dir: &Path, server: &ServerDescriptor) -> PathBuf {
    let key = format!("{}@{}:{}", server.username, server.hostname, server.port);
    let digest = sha256_hash(key.as_bytes());
    dir.join(format!("cm-{}", &digest[..16]))
}

fn classify_connect_failure(stderr: &str) -> ProvisionError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication failed") {
        ProvisionError::AuthError(message)
    } else if lower.contains("timed out") {
        ProvisionError::ConnectionError(format!("Connection timed out: {}", message))
    } else if message.is_empty() {
        ProvisionError::ConnectionError("ssh exited without a message".to_string())
    } else {
        ProvisionError::ConnectionError(message)
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().find(|l| !l.trim().is_empty())
}
