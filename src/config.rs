//! Configuration loading and validation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Main configuration for the privileged helper.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Loopback address the command server listens on.
    #[serde(
        default = "default_listen_addr",
        deserialize_with = "deserialize_socket_addr"
    )]
    pub listen_addr: SocketAddr,

    /// Largest length a client may declare for a single request field.
    #[serde(default = "default_max_field_len")]
    pub max_field_len: usize,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub firewall: FirewallSettings,

    #[serde(default)]
    pub install: InstallSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub blocklist: BlocklistSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Hard wall-clock limits for privileged work.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Timeout for short privileged commands (pfctl, networksetup, kill).
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,

    /// Timeout for file moves and removals during update installation.
    #[serde(default = "default_long_command_secs")]
    pub long_command_secs: u64,

    /// Timeout for writing a response byte back to the client.
    #[serde(default = "default_send_secs")]
    pub send_secs: u64,

    /// How long a stop request waits for the proxy supervisor to wind down.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl TimeoutSettings {
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub const fn long_command(&self) -> Duration {
        Duration::from_secs(self.long_command_secs)
    }

    pub const fn send(&self) -> Duration {
        Duration::from_secs(self.send_secs)
    }

    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            long_command_secs: default_long_command_secs(),
            send_secs: default_send_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

/// DNS proxy and resolver configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSettings {
    /// Tool used to list network services and set their DNS servers.
    #[serde(default = "default_networksetup")]
    pub networksetup: PathBuf,

    /// File name of the proxy binary inside the directory sent by the client.
    #[serde(default = "default_proxy_binary")]
    pub proxy_binary: String,

    /// File name of the proxy configuration inside the same directory.
    #[serde(default = "default_proxy_config")]
    pub proxy_config: String,

    /// Server address pointing resolution at the local proxy.
    #[serde(default = "default_local_server")]
    pub local_server: String,

    /// Server value that restores the system default resolvers.
    #[serde(default = "default_default_server")]
    pub default_server: String,

    /// Whole-operation retries when no service could be updated.
    #[serde(default = "default_set_retries")]
    pub set_retries: u32,

    /// Consecutive proxy failures tolerated before supervision gives up.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Pause between a proxy failure and its relaunch.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

impl DnsSettings {
    pub const fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            networksetup: default_networksetup(),
            proxy_binary: default_proxy_binary(),
            proxy_config: default_proxy_config(),
            local_server: default_local_server(),
            default_server: default_default_server(),
            set_retries: default_set_retries(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }
}

/// Packet filter control settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallSettings {
    #[serde(default = "default_pfctl")]
    pub pfctl: PathBuf,

    /// Anchor holding the helper's rules, flushed on unblock.
    #[serde(default = "default_anchor")]
    pub anchor: String,

    /// Rule loaded into the anchor to drop QUIC traffic.
    #[serde(default = "default_quic_rule")]
    pub quic_rule: String,
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            pfctl: default_pfctl(),
            anchor: default_anchor(),
            quic_rule: default_quic_rule(),
        }
    }
}

/// Self-update installation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallSettings {
    /// Bundle name appended to both directories sent by the client.
    #[serde(default = "default_bundle_name")]
    pub bundle_name: String,

    #[serde(default = "default_rm")]
    pub rm: PathBuf,

    #[serde(default = "default_mv")]
    pub mv: PathBuf,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            bundle_name: default_bundle_name(),
            rm: default_rm(),
            mv: default_mv(),
        }
    }
}

/// Peer authentication settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSettings {
    #[serde(default = "default_lsof")]
    pub lsof: PathBuf,

    #[serde(default = "default_ps")]
    pub ps: PathBuf,

    #[serde(default = "default_codesign")]
    pub codesign: PathBuf,

    /// Code signing requirement the client binary must satisfy.
    #[serde(default = "default_requirement")]
    pub requirement: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            lsof: default_lsof(),
            ps: default_ps(),
            codesign: default_codesign(),
            requirement: default_requirement(),
        }
    }
}

/// Persisted blocklist settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlocklistSettings {
    #[serde(default = "default_blocklist_path")]
    pub path: PathBuf,
}

impl Default for BlocklistSettings {
    fn default() -> Self {
        Self {
            path: default_blocklist_path(),
        }
    }
}

/// Prometheus metrics settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(
        default = "default_metrics_listen",
        deserialize_with = "deserialize_socket_addr"
    )]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8312))
}

const fn default_max_field_len() -> usize {
    1024
}

const fn default_command_secs() -> u64 {
    10
}

const fn default_long_command_secs() -> u64 {
    60
}

const fn default_send_secs() -> u64 {
    5
}

const fn default_stop_grace_secs() -> u64 {
    5
}

fn default_networksetup() -> PathBuf {
    PathBuf::from("/usr/sbin/networksetup")
}

fn default_proxy_binary() -> String {
    "dnscrypt-proxy".to_string()
}

fn default_proxy_config() -> String {
    "dnscrypt-proxy.toml".to_string()
}

fn default_local_server() -> String {
    "127.0.0.1".to_string()
}

fn default_default_server() -> String {
    "empty".to_string()
}

const fn default_set_retries() -> u32 {
    5
}

const fn default_max_restarts() -> u32 {
    10
}

const fn default_restart_backoff_ms() -> u64 {
    500
}

fn default_pfctl() -> PathBuf {
    PathBuf::from("/sbin/pfctl")
}

fn default_anchor() -> String {
    "com.apple/appFirewall".to_string()
}

fn default_quic_rule() -> String {
    "block drop quick proto udp from any to any port 443".to_string()
}

fn default_bundle_name() -> String {
    "appFirewall.app".to_string()
}

fn default_rm() -> PathBuf {
    PathBuf::from("/bin/rm")
}

fn default_mv() -> PathBuf {
    PathBuf::from("/bin/mv")
}

fn default_lsof() -> PathBuf {
    PathBuf::from("/usr/sbin/lsof")
}

fn default_ps() -> PathBuf {
    PathBuf::from("/bin/ps")
}

fn default_codesign() -> PathBuf {
    PathBuf::from("/usr/bin/codesign")
}

fn default_requirement() -> String {
    "identifier \"com.leith.appFirewall\" and anchor apple generic".to_string()
}

fn default_blocklist_path() -> PathBuf {
    PathBuf::from("/var/db/firewall-helper/blocklist.dat")
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9464))
}

fn deserialize_socket_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_field_len: default_max_field_len(),
            timeouts: TimeoutSettings::default(),
            dns: DnsSettings::default(),
            firewall: FirewallSettings::default(),
            install: InstallSettings::default(),
            auth: AuthSettings::default(),
            blocklist: BlocklistSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.listen_addr.ip().is_loopback() {
            return Err(ValidationError::NonLoopbackListener(self.listen_addr).into());
        }

        if self.max_field_len == 0 {
            return Err(ValidationError::ZeroFieldLength.into());
        }

        let timeouts = [
            ("command_secs", self.timeouts.command_secs),
            ("long_command_secs", self.timeouts.long_command_secs),
            ("send_secs", self.timeouts.send_secs),
            ("stop_grace_secs", self.timeouts.stop_grace_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ValidationError::ZeroTimeout(*name).into());
        }

        let retries = [
            ("set_retries", self.dns.set_retries),
            ("max_restarts", self.dns.max_restarts),
        ];
        if let Some((name, _)) = retries.iter().find(|(_, count)| *count == 0) {
            return Err(ValidationError::ZeroRetryCount(*name).into());
        }

        let settings = [
            ("dns.proxy_binary", self.dns.proxy_binary.as_str()),
            ("dns.proxy_config", self.dns.proxy_config.as_str()),
            ("dns.local_server", self.dns.local_server.as_str()),
            ("dns.default_server", self.dns.default_server.as_str()),
            ("firewall.anchor", self.firewall.anchor.as_str()),
            ("firewall.quic_rule", self.firewall.quic_rule.as_str()),
            ("install.bundle_name", self.install.bundle_name.as_str()),
            ("auth.requirement", self.auth.requirement.as_str()),
        ];
        if let Some((name, _)) = settings.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ValidationError::EmptySetting(*name).into());
        }

        // The bundle name is appended to client paths and must stay a single component.
        if self.install.bundle_name.contains('/') || self.install.bundle_name.starts_with('.') {
            return Err(
                ValidationError::InvalidBundleName(self.install.bundle_name.clone()).into(),
            );
        }

        Ok(())
    }
}
