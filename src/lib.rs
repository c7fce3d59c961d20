//! Firewall helper - the privileged backend of a personal firewall.
//!
//! The helper runs with elevated permissions next to an unprivileged GUI. It
//! authenticates the GUI over a loopback socket, runs privileged actions on its
//! behalf (DNS redirection through a local proxy, QUIC blocking, self-update
//! installation) and keeps the set of blocked application/destination pairs.
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`protocol`]: Request/response wire format
//! - [`auth`]: Peer authentication of the GUI process
//! - [`process`]: Privileged subprocess execution and retry policy
//! - [`dns`]: DNS proxy supervision and system DNS configuration
//! - [`server`]: Accept loop, sessions and command handlers
//! - [`blocklist`]: Persisted store of block decisions
//! - [`metrics`]: Optional Prometheus exporter
//! - [`error`]: Error types
//!
//! # Testing
//!
//! System access goes through the [`process::CommandRunner`] and
//! [`auth::PeerAuthenticator`] traits, so the command server can be driven
//! end to end without privileges:
//!
//! ```rust
//! use firewall_helper::protocol::{Request, Tag};
//!
//! let frame = Request::StartDns { proxy_dir: "/opt/proxy".into() }.encode();
//! assert_eq!(frame[0], Tag::StartDns as u8);
//! assert_eq!(&frame[1..9], &10u64.to_le_bytes());
//! ```

pub mod auth;
pub mod blocklist;
pub mod config;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
