//! Peer authentication for the command socket.
//!
//! Before any command is processed the helper resolves which process owns the
//! client end of the loopback connection and checks that its executable is the
//! expected, correctly signed client. The check is repeated whenever the
//! owning process changes mid-session.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AuthSettings;
use crate::process::{CommandRunner, PrivilegedCommand, SubprocessError};

/// The authenticated process on the far end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerIdentity {
    pub pid: u32,
    pub executable: PathBuf,
}

/// Error type for peer authentication. Always fatal for the connection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no process owns peer socket {0}")]
    NoOwner(SocketAddr),

    #[error("failed to inspect peer process")]
    Inspect(#[from] SubprocessError),

    #[error("could not resolve executable of pid {0}")]
    UnknownExecutable(u32),

    #[error("{executable:?} (pid {pid}) rejected: {reason}")]
    Rejected {
        pid: u32,
        executable: PathBuf,
        reason: String,
    },
}

/// Trait for authenticating the process behind a loopback connection.
pub trait PeerAuthenticator: Send + Sync + 'static {
    /// Resolve the process currently owning the client socket at `peer`.
    fn owner_pid(&self, peer: SocketAddr) -> impl Future<Output = Result<u32, AuthError>> + Send;

    /// Confirm that process `pid` is the expected, unmodified client.
    fn verify(&self, pid: u32) -> impl Future<Output = Result<OwnerIdentity, AuthError>> + Send;

    /// Resolve and verify the owner of `peer` in one step.
    fn authenticate(
        &self,
        peer: SocketAddr,
    ) -> impl Future<Output = Result<OwnerIdentity, AuthError>> + Send {
        async move {
            let pid = self.owner_pid(peer).await?;
            self.verify(pid).await
        }
    }
}

/// Authenticator using `lsof` to find the socket owner and `codesign` to
/// check the owner's executable against a designated requirement.
pub struct CodeSignAuthenticator<R> {
    runner: Arc<R>,
    settings: AuthSettings,
    timeout: Duration,
    own_pid: u32,
}

impl<R: CommandRunner> CodeSignAuthenticator<R> {
    pub fn new(runner: Arc<R>, settings: AuthSettings, timeout: Duration) -> Self {
        Self {
            runner,
            settings,
            timeout,
            own_pid: std::process::id(),
        }
    }

    async fn executable_of(&self, pid: u32) -> Result<PathBuf, AuthError> {
        let command = PrivilegedCommand::new(&self.settings.ps).args([
            "-o".to_string(),
            "comm=".to_string(),
            "-p".to_string(),
            pid.to_string(),
        ]);
        let output = self.runner.run(&command, self.timeout).await?;
        let path = PathBuf::from(output.trim());
        if path.is_absolute() {
            Ok(path)
        } else {
            Err(AuthError::UnknownExecutable(pid))
        }
    }
}

impl<R: CommandRunner> PeerAuthenticator for CodeSignAuthenticator<R> {
    async fn owner_pid(&self, peer: SocketAddr) -> Result<u32, AuthError> {
        // Matches both ends of the connection; our own end is filtered out below.
        let command = PrivilegedCommand::new(&self.settings.lsof).args([
            "-nP".to_string(),
            format!("-iTCP@{}:{}", peer.ip(), peer.port()),
            "-sTCP:ESTABLISHED".to_string(),
            "-Fp".to_string(),
        ]);
        let output = self.runner.run(&command, self.timeout).await?;

        parse_lsof_pids(&output)
            .find(|pid| *pid != self.own_pid)
            .ok_or(AuthError::NoOwner(peer))
    }

    async fn verify(&self, pid: u32) -> Result<OwnerIdentity, AuthError> {
        let executable = self.executable_of(pid).await?;
        debug!(pid, ?executable, "verifying client signature");

        let command = PrivilegedCommand::new(&self.settings.codesign)
            .args(["--verify", "--deep", "--strict"])
            .arg(format!("-R={}", self.settings.requirement))
            .arg(executable.as_os_str());

        match self.runner.run(&command, self.timeout).await {
            Ok(_) => Ok(OwnerIdentity { pid, executable }),
            Err(SubprocessError::Exit { stderr, .. }) => {
                warn!(pid, ?executable, "client signature rejected: {stderr}");
                Err(AuthError::Rejected {
                    pid,
                    executable,
                    reason: stderr,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Extract process ids from `lsof -Fp` output (`p<pid>` lines).
fn parse_lsof_pids(output: &str) -> impl Iterator<Item = u32> + '_ {
    output
        .lines()
        .filter_map(|line| line.strip_prefix('p'))
        .filter_map(|pid| pid.trim().parse().ok())
}
