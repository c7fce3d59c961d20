//! DNS proxy process supervision.
//!
//! The proxy runs as a child process followed by a dedicated supervisory task
//! that logs its output. When reading the output fails (the child died or its
//! pipe broke) the child is killed and relaunched, up to a bounded number of
//! consecutive relaunches. Once all of those have failed too the supervisor
//! gives up: DNS resolution is then no longer guaranteed until a client starts
//! the proxy again.
//!
//! Only the owner of [`DnsProxySupervisor`] starts or stops the proxy. The
//! supervisory task never changes that decision; it only observes the
//! cancellation token and publishes the child's current pid. Anyone can follow
//! the state through [`DnsProxySupervisor::subscribe`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use crate::process::{
    CommandRunner, PrivilegedCommand, RetryPolicy, StreamingChild, SubprocessError,
};

/// Observable state of the supervised proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Running { pid: u32 },
    Stopping,
}

/// Why a supervisory task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Stopped on request.
    Stopped,
    /// Gave up after the initial launch and every allowed relaunch failed.
    Exhausted { failures: u32 },
}

/// Error type for supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("DNS proxy already running with pid {0}")]
    AlreadyRunning(u32),

    #[error("failed to launch DNS proxy")]
    Launch(#[from] SubprocessError),
}

type StateSender = Arc<watch::Sender<SupervisorState>>;

struct ActiveProxy {
    command: PrivilegedCommand,
    cancel: CancellationToken,
    task: JoinHandle<SupervisorExit>,
    // Cancels the task if the supervisor is dropped without stop().
    _guard: DropGuard,
}

/// Owns the lifecycle of the DNS proxy child process.
pub struct DnsProxySupervisor<R> {
    runner: Arc<R>,
    policy: RetryPolicy,
    stop_grace: Duration,
    state: StateSender,
    active: Option<ActiveProxy>,
}

impl<R: CommandRunner> DnsProxySupervisor<R> {
    /// Allows `max_restarts` consecutive relaunches, spaced by `backoff`,
    /// before giving up.
    pub fn new(
        runner: Arc<R>,
        max_restarts: u32,
        backoff: Duration,
        stop_grace: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            runner,
            policy: RetryPolicy::with_retries(max_restarts).with_backoff(backoff),
            stop_grace,
            state: Arc::new(state),
            active: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        let state = *self.state.borrow();
        match (&self.active, state) {
            // A task that died without publishing its exit is not running.
            (Some(active), SupervisorState::Running { .. }) if active.task.is_finished() => {
                SupervisorState::Stopped
            }
            (None, SupervisorState::Running { .. }) => SupervisorState::Stopped,
            _ => state,
        }
    }

    /// Follow state changes from outside the owner, e.g. while a stop is pending.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), SupervisorState::Running { .. })
    }

    /// Current pid of the proxy child, if it is running.
    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            SupervisorState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    /// Launch the proxy and start supervising it.
    ///
    /// A supervisor that previously gave up is replaced by a fresh one.
    pub async fn start(&mut self, command: PrivilegedCommand) -> Result<u32, SupervisorError> {
        if let SupervisorState::Running { pid } = self.state() {
            return Err(SupervisorError::AlreadyRunning(pid));
        }
        if let Some(finished) = self.active.take() {
            match finished.task.await {
                Ok(exit) => {
                    info!(?exit, command = %finished.command, "replacing ended DNS proxy supervisor");
                }
                Err(err) => warn!("previous DNS proxy supervisor failed: {err}"),
            }
        }

        let child = self.runner.spawn_streaming(&command)?;
        let pid = child.pid();
        info!(pid, %command, "started DNS proxy");
        self.state.send_replace(SupervisorState::Running { pid });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.runner),
            command.clone(),
            child,
            Arc::clone(&self.state),
            self.policy,
            cancel.clone(),
        ));

        self.active = Some(ActiveProxy {
            command,
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
        });
        Ok(pid)
    }

    /// Stop the proxy: interrupt the supervisory task's read and wait for it
    /// to kill the child and exit.
    ///
    /// Returns `None` if nothing was running.
    pub async fn stop(&mut self) -> Option<SupervisorExit> {
        let active = self.active.take()?;

        self.state.send_replace(SupervisorState::Stopping);
        active.cancel.cancel();
        let mut task = active.task;
        let exit = match tokio::time::timeout(self.stop_grace, &mut task).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(err)) => {
                error!("DNS proxy supervisor task failed: {err}");
                None
            }
            Err(_) => {
                // Aborting drops the child, which is killed on drop.
                warn!(grace = ?self.stop_grace, "DNS proxy supervisor did not stop in time");
                task.abort();
                None
            }
        };
        self.state.send_replace(SupervisorState::Stopped);
        info!(?exit, "stopped DNS proxy");
        exit
    }
}

async fn supervise<R: CommandRunner>(
    runner: Arc<R>,
    command: PrivilegedCommand,
    child: StreamingChild,
    state: StateSender,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> SupervisorExit {
    let mut child = Some(child);
    let mut failures = 0u32;

    let exit = loop {
        if let Some(current) = child.as_mut() {
            let line = tokio::select! {
                biased;
                () = cancel.cancelled() => break SupervisorExit::Stopped,
                line = current.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    failures = 0;
                    info!(target: "dns_proxy", "{line}");
                    continue;
                }
                Ok(None) => warn!(pid = current.pid(), "DNS proxy output ended"),
                Err(err) => warn!(pid = current.pid(), "problem reading DNS proxy output: {err}"),
            }

            if let Some(dead) = child.take() {
                dead.terminate().await;
            }
        }

        failures += 1;
        metrics::counter!("helper_dns_proxy_failures_total").increment(1);
        if !policy.allows_another(failures) {
            error!(
                failures,
                "DNS proxy keeps failing, giving up; DNS resolution is no longer guaranteed"
            );
            break SupervisorExit::Exhausted { failures };
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break SupervisorExit::Stopped,
            () = tokio::time::sleep(policy.backoff()) => {}
        }

        match runner.spawn_streaming(&command) {
            Ok(relaunched) => {
                let pid = relaunched.pid();
                info!(pid, failures, "relaunched DNS proxy");
                state.send_replace(SupervisorState::Running { pid });
                child = Some(relaunched);
            }
            Err(err) => warn!(failures, "failed to relaunch DNS proxy: {err}"),
        }
    };

    if let Some(child) = child.take() {
        child.terminate().await;
    }
    // A requested stop is published by the owner once it has joined the task.
    if let SupervisorExit::Exhausted { .. } = exit {
        state.send_replace(SupervisorState::Stopped);
    }
    exit
}
