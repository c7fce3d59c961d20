//! System DNS server configuration across network services.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::DnsSettings;
use crate::process::{CommandRunner, PrivilegedCommand, RetryPolicy, SubprocessError};

/// Points every network service's DNS at a given server.
///
/// Each service is updated independently: a failure on one is logged and
/// counted but never stops the others from being configured.
pub struct DnsConfigurator<R> {
    runner: Arc<R>,
    networksetup: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<R: CommandRunner> DnsConfigurator<R> {
    pub fn new(runner: Arc<R>, settings: &DnsSettings, timeout: Duration) -> Self {
        Self {
            runner,
            networksetup: settings.networksetup.clone(),
            timeout,
            retry: RetryPolicy::with_retries(settings.set_retries),
        }
    }

    /// List configured network services.
    pub async fn list_services(&self) -> Result<Vec<String>, SubprocessError> {
        let command = PrivilegedCommand::new(&self.networksetup).arg("-listallnetworkservices");
        let output = self.runner.run(&command, self.timeout).await?;
        Ok(parse_services(&output))
    }

    /// Set the DNS server of every service to `server`.
    ///
    /// Returns how many services were updated; zero means total failure.
    pub async fn set_dns(&self, server: &str) -> usize {
        let services = match self.list_services().await {
            Ok(services) => services,
            Err(err) => {
                warn!("failed to list network services: {err}");
                return 0;
            }
        };

        let mut updated = 0;
        let mut failed = 0;
        for service in &services {
            info!(service, server, "setting DNS server");
            match self.set_service_dns(service, server).await {
                Ok(()) => updated += 1,
                Err(err) => {
                    warn!(service, server, "failed to set DNS server: {err}");
                    failed += 1;
                }
            }
        }

        debug!(updated, failed, server, "set_dns finished");
        updated
    }

    /// [`set_dns`](Self::set_dns), repeated while it updates nothing.
    pub async fn set_dns_with_retry(&self, server: &str) -> usize {
        let (updated, attempts) = self
            .retry
            .run(|_| self.set_dns(server), |updated| *updated > 0)
            .await;
        if updated == 0 {
            warn!(server, attempts, "no network service accepted the DNS server");
        }
        updated
    }

    /// This command hangs intermittently, so a timeout earns one more try.
    async fn set_service_dns(&self, service: &str, server: &str) -> Result<(), SubprocessError> {
        let command = PrivilegedCommand::new(&self.networksetup).args([
            "-setdnsservers",
            service,
            server,
        ]);

        match self.runner.run(&command, self.timeout).await {
            Err(err) if err.is_timeout() => {
                debug!(service, "setdnsservers timed out, retrying once");
                self.runner.run(&command, self.timeout).await.map(drop)
            }
            other => other.map(drop),
        }
    }
}

/// Parse `networksetup -listallnetworkservices` output.
///
/// The first line is an explanatory header. Disabled services are prefixed
/// with `*` and are configured too.
fn parse_services(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(|line| line.trim().trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}
