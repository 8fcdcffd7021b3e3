use super::credentials::{CredentialResolver, ResolvedCredential};
use super::{CommandOutput, Session, Transport, TransportError};
use crate::config::SshConfig;
use crate::registry::HostDescriptor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs commands through the system `ssh` binary. Each session is a
/// `ControlMaster` process; probes are multiplexed over its control socket so
/// the host authenticates once per cycle.
pub struct OpenSshTransport {
    cfg: SshConfig,
    credentials: Arc<dyn CredentialResolver>,
    cleanup: Cleanup,
}

/// Master shutdowns started by dropped sessions, kept so the process can wait
/// for them before exiting.
#[derive(Clone, Default)]
struct Cleanup {
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Cleanup {
    fn push(&self, handle: JoinHandle<()>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    fn take(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl OpenSshTransport {
    pub fn new(cfg: SshConfig, credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            cfg,
            credentials,
            cleanup: Cleanup::default(),
        }
    }

    /// Waits for masters of abandoned sessions to be told to exit and for
    /// their control directories to be removed.
    pub async fn drain(&self) {
        let pending = self.cleanup.take();
        if !pending.is_empty() {
            debug!(sessions = pending.len(), "waiting for abandoned ssh masters");
        }
        for handle in pending {
            let _ = handle.await;
        }
    }

    fn master_command(
        &self,
        host: &HostDescriptor,
        credential: &ResolvedCredential,
        control_path: &Path,
        log_path: &Path,
        timeout: Duration,
    ) -> Command {
        let mut cmd = Command::new(&self.cfg.binary);
        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-S")
            .arg(control_path)
            .arg("-E")
            .arg(log_path)
            .arg("-o")
            .arg(format!("ControlPersist={}", self.cfg.control_persist_secs))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "StrictHostKeyChecking={}",
                self.cfg.strict_host_key_checking
            ))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .arg("-p")
            .arg(host.port.to_string())
            .arg("-l")
            .arg(&host.username);
        if let ResolvedCredential::IdentityFile(path) = credential {
            cmd.arg("-i")
                .arg(path)
                .arg("-o")
                .arg("IdentitiesOnly=yes");
        }
        cmd.arg("--")
            .arg(&host.address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn connect(
        &self,
        host: &HostDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, TransportError> {
        let credential = self.credentials.resolve(&host.credential)?;
        let dir = tempfile::Builder::new()
            .prefix("fleetmond-")
            .tempdir()
            .map_err(TransportError::Spawn)?;
        let control_path = dir.path().join("master.sock");
        let log_path = dir.path().join("master.log");

        debug!(
            host = %host.name,
            address = %host.address,
            credential = host.credential.kind(),
            "starting ssh master"
        );
        let mut cmd = self.master_command(host, &credential, &control_path, &log_path, timeout);
        let status = match time::timeout(timeout, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(TransportError::Spawn(err)),
            Err(_elapsed) => return Err(TransportError::Timeout(timeout)),
        };

        if !status.success() {
            let log = tokio::fs::read_to_string(&log_path)
                .await
                .unwrap_or_default();
            return Err(classify_master_failure(&log, status.code()));
        }

        Ok(Box::new(OpenSshSession {
            binary: self.cfg.binary.clone(),
            control_path,
            port: host.port,
            username: host.username.clone(),
            address: host.address.clone(),
            dir: Some(dir),
            closed: false,
            cleanup: self.cleanup.clone(),
        }))
    }
}

fn classify_master_failure(log: &str, code: Option<i32>) -> TransportError {
    let message = log
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| match code {
            Some(code) => format!("ssh exited with status {code}"),
            None => "ssh terminated by signal".to_string(),
        });
    let lower = log.to_lowercase();
    let auth_markers = [
        "permission denied",
        "host key verification failed",
        "too many authentication failures",
        "no supported authentication methods",
    ];
    if auth_markers.iter().any(|m| lower.contains(m)) {
        TransportError::Auth(message)
    } else {
        TransportError::Unreachable(message)
    }
}

pub struct OpenSshSession {
    binary: String,
    control_path: PathBuf,
    port: u16,
    username: String,
    address: String,
    dir: Option<TempDir>,
    closed: bool,
    cleanup: Cleanup,
}

impl OpenSshSession {
    fn client_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-l")
            .arg(&self.username)
            .kill_on_drop(true);
        cmd
    }

    fn exit_command(&self) -> Command {
        let mut cmd = self.client_command();
        cmd.arg("-O")
            .arg("exit")
            .arg("--")
            .arg(&self.address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl Session for OpenSshSession {
    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let mut cmd = self.client_command();
        cmd.arg("--")
            .arg(&self.address)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(TransportError::Spawn(err)),
            Err(_elapsed) => return Err(TransportError::Timeout(timeout)),
        };

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // 255 is reserved by ssh for its own failures.
        if output.status.code() == Some(255) {
            return Err(TransportError::SessionLost(stderr.trim().to_string()));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code: output.status.code(),
        })
    }

    async fn close(mut self: Box<Self>) {
        let mut cmd = self.exit_command();
        match time::timeout(CLOSE_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                warn!(address = %self.address, status = ?status.code(), "ssh master exit returned failure");
            }
            Ok(Err(err)) => warn!(address = %self.address, error = %err, "failed to stop ssh master"),
            Err(_elapsed) => warn!(address = %self.address, "timeout stopping ssh master"),
        }
        self.closed = true;
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(dir) = self.dir.take() else {
            return;
        };
        let mut cmd = self.exit_command();
        // Without a runtime the master is left to its ControlPersist idle timeout.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            self.cleanup.push(handle.spawn(async move {
                let _ = time::timeout(CLOSE_TIMEOUT, cmd.status()).await;
                drop(dir);
            }));
        }
    }
}
