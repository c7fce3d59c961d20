//! Authenticated command server.
//!
//! Connections are accepted on a loopback listener and served one at a time.
//! A session starts unauthenticated; the peer's owning process must pass the
//! [`PeerAuthenticator`] before any command is read. Before each command the
//! current owner of the peer socket is looked up again and, if it changed,
//! verified again. Authentication and framing failures close the session;
//! command failures are reported in the status byte and the session goes on.

pub mod install;

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{AuthError, OwnerIdentity, PeerAuthenticator};
use crate::config::Config;
use crate::dns::{DnsConfigurator, DnsProxySupervisor};
use crate::process::{CommandRunner, PrivilegedCommand};
use crate::protocol::{self, FramingError, Request, Status, Tag};

/// Why a session was closed early.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
}

/// Executes client commands against the system.
///
/// Owns the DNS proxy supervisor, so only the command path ever starts or
/// stops the proxy.
pub struct CommandServer<A, R> {
    config: Config,
    auth: A,
    runner: Arc<R>,
    supervisor: DnsProxySupervisor<R>,
    dns: DnsConfigurator<R>,
}

impl<A, R> CommandServer<A, R>
where
    A: PeerAuthenticator,
    R: CommandRunner,
{
    pub fn new(config: Config, auth: A, runner: Arc<R>) -> Self {
        let supervisor = DnsProxySupervisor::new(
            Arc::clone(&runner),
            config.dns.max_restarts,
            config.dns.restart_backoff(),
            config.timeouts.stop_grace(),
        );
        let dns = DnsConfigurator::new(Arc::clone(&runner), &config.dns, config.timeouts.command());

        Self {
            config,
            auth,
            runner,
            supervisor,
            dns,
        }
    }

    pub const fn supervisor(&self) -> &DnsProxySupervisor<R> {
        &self.supervisor
    }

    /// Accept and serve connections until the surrounding task is dropped.
    pub async fn run(&mut self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "command server listening");
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("failed to accept connection: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            metrics::counter!("helper_sessions_total").increment(1);
            match self.serve(stream, peer).await {
                Ok(commands) => info!(%peer, commands, "session closed"),
                Err(err) => warn!(%peer, "session closed: {err}"),
            }
        }
    }

    /// Serve one session until the client disconnects.
    ///
    /// Returns the number of commands answered.
    #[instrument(skip(self, stream))]
    pub async fn serve<S>(&mut self, mut stream: S, peer: SocketAddr) -> Result<u64, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut owner = self.auth.authenticate(peer).await.inspect_err(|_| {
            metrics::counter!("helper_auth_failures_total").increment(1);
        })?;
        info!(pid = owner.pid, executable = ?owner.executable, "client authenticated");

        let mut answered = 0;
        while let Some(tag) = protocol::read_tag(&mut stream).await? {
            self.confirm_owner(peer, &mut owner).await.inspect_err(|_| {
                metrics::counter!("helper_auth_failures_total").increment(1);
            })?;

            let request = self.read_request(tag, &mut stream).await?;
            let status = self.execute(request).await;
            protocol::write_status(&mut stream, status, self.config.timeouts.send()).await?;
            answered += 1;
        }
        Ok(answered)
    }

    /// Re-verify the peer if another process now owns its socket.
    async fn confirm_owner(
        &self,
        peer: SocketAddr,
        owner: &mut OwnerIdentity,
    ) -> Result<(), AuthError> {
        let current = self.auth.owner_pid(peer).await?;
        if current != owner.pid {
            warn!(previous = owner.pid, current, "peer socket owner changed, re-authenticating");
            *owner = self.auth.verify(current).await?;
            info!(pid = owner.pid, executable = ?owner.executable, "client re-authenticated");
        }
        Ok(())
    }

    async fn read_request<S>(&self, tag: Tag, stream: &mut S) -> Result<Request, FramingError>
    where
        S: AsyncRead + Unpin,
    {
        let max = self.config.max_field_len;
        Ok(match tag {
            Tag::InstallUpdate => {
                let staged_dir = protocol::read_path(stream, max).await?;
                let install_dir = protocol::read_path(stream, max).await?;
                Request::InstallUpdate {
                    staged_dir,
                    install_dir,
                }
            }
            Tag::BlockQuic => Request::BlockQuic,
            Tag::UnblockQuic => Request::UnblockQuic,
            Tag::StartDns => Request::StartDns {
                proxy_dir: protocol::read_path(stream, max).await?,
            },
            Tag::StopDns => Request::StopDns,
        })
    }

    /// Run one decoded request and produce its status.
    pub async fn execute(&mut self, request: Request) -> Status {
        let command = request.tag().name();
        let started = Instant::now();

        let status = match request {
            Request::InstallUpdate {
                staged_dir,
                install_dir,
            } => self.install_update(&staged_dir, &install_dir).await,
            Request::BlockQuic => self.block_quic().await,
            Request::UnblockQuic => self.unblock_quic().await,
            Request::StartDns { proxy_dir } => self.start_dns(&proxy_dir).await,
            Request::StopDns => self.stop_dns().await,
        };

        metrics::counter!(
            "helper_commands_total",
            "command" => command,
            "success" => if status.is_success() { "true" } else { "false" }
        )
        .increment(1);
        info!(command, ?status, elapsed = ?started.elapsed(), "command finished");
        status
    }

    async fn install_update(&self, staged_dir: &Path, install_dir: &Path) -> Status {
        if !is_usable_dir(staged_dir) || !is_usable_dir(install_dir) {
            warn!(?staged_dir, ?install_dir, "rejecting install with invalid paths");
            return Status::Failed;
        }
        info!(?staged_dir, ?install_dir, "installing update");

        install::plan(&self.config.install, staged_dir, install_dir)
            .run(&*self.runner, self.config.timeouts.long_command())
            .await
    }

    /// Loading the anchor replaces its rules, so repeating this is harmless.
    async fn block_quic(&self) -> Status {
        let firewall = &self.config.firewall;
        let command = PrivilegedCommand::new(&firewall.pfctl)
            .args(["-a", firewall.anchor.as_str(), "-f", "-"])
            .stdin(format!("{}\n", firewall.quic_rule));
        self.run_simple(&command, "block QUIC").await
    }

    /// Flushing an already empty anchor succeeds.
    async fn unblock_quic(&self) -> Status {
        let firewall = &self.config.firewall;
        let command = PrivilegedCommand::new(&firewall.pfctl).args([
            "-a",
            firewall.anchor.as_str(),
            "-F",
            "rules",
        ]);
        self.run_simple(&command, "unblock QUIC").await
    }

    async fn run_simple(&self, command: &PrivilegedCommand, what: &str) -> Status {
        match self.runner.run(command, self.config.timeouts.command()).await {
            Ok(_) => Status::Success,
            Err(err) => {
                warn!("failed to {what}: {err}");
                Status::Failed
            }
        }
    }

    async fn start_dns(&mut self, proxy_dir: &Path) -> Status {
        if !is_usable_dir(proxy_dir) {
            warn!(?proxy_dir, "rejecting DNS start with invalid path");
            return Status::Failed;
        }

        if self.supervisor.is_running() {
            debug!(pid = ?self.supervisor.pid(), "DNS proxy already running");
        } else {
            let command = proxy_command(proxy_dir, &self.config);
            if let Err(err) = self.supervisor.start(command).await {
                error!("failed to start DNS proxy: {err}");
                return Status::Failed;
            }
        }

        let local = self.config.dns.local_server.as_str();
        if self.dns.set_dns_with_retry(local).await > 0 {
            Status::Success
        } else {
            error!(server = local, "could not point DNS at the proxy");
            Status::Failed
        }
    }

    /// DNS is moved off the proxy before the proxy is stopped; if that move
    /// fails the proxy keeps running.
    async fn stop_dns(&mut self) -> Status {
        let default = self.config.dns.default_server.as_str();
        if self.dns.set_dns_with_retry(default).await == 0 {
            error!(server = default, "could not restore default DNS, leaving proxy running");
            let local = self.config.dns.local_server.as_str();
            if self.dns.set_dns(local).await == 0 {
                error!(server = local, "could not point DNS back at the proxy either");
            }
            return Status::Failed;
        }

        if let Some(exit) = self.supervisor.stop().await {
            debug!(?exit, "DNS proxy supervisor ended");
        }
        Status::Success
    }

    /// Restore default DNS and stop the proxy, if it is running.
    pub async fn shutdown(&mut self) {
        if !self.supervisor.is_running() {
            return;
        }
        info!("restoring DNS before exit");
        if self.stop_dns().await != Status::Success {
            warn!("DNS may still point at the proxy, stopping it anyway");
            self.supervisor.stop().await;
        }
    }
}

/// `<dir>/<proxy_binary> -config=<dir>/<proxy_config>`
fn proxy_command(proxy_dir: &Path, config: &Config) -> PrivilegedCommand {
    let mut config_flag = OsString::from("-config=");
    config_flag.push(proxy_dir.join(&config.dns.proxy_config));
    PrivilegedCommand::new(proxy_dir.join(&config.dns.proxy_binary)).arg(config_flag)
}

fn is_usable_dir(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.is_absolute()
}
