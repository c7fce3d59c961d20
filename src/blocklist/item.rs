//! Blocked application/destination records.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity key of a [`BlockItem`]: a SHA-256 digest over the process name
/// and the destination (domain when known, literal address otherwise).
///
/// Ports play no part, so repeated connections from one application to one
/// destination share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey([u8; 32]);

impl ItemKey {
    fn of(name: &str, destination: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(destination.to_ascii_lowercase().trim_end_matches('.').as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

/// One blocked application/destination pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockItem {
    /// Owning process name or path.
    pub name: String,
    /// Literal destination address.
    pub addr: String,
    /// Resolved destination domain, empty when unknown.
    #[serde(default)]
    pub domain: String,
}

impl BlockItem {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            domain: domain.into(),
        }
    }

    /// Block `name` from reaching `domain`, whatever address it resolves to.
    pub fn for_domain(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::new(name, String::new(), domain)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Display name of the destination: the domain if known, else the address.
    pub fn addr_name(&self) -> &str {
        if self.domain.is_empty() {
            &self.addr
        } else {
            &self.domain
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::of(&self.name, self.addr_name())
    }

    /// A record needs a process and some destination to be meaningful.
    pub(crate) fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.addr_name().is_empty()
    }
}

/// A connection observed by the capture path. Never stored itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub pid: u32,
    pub process_name: String,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub domain: Option<String>,
}

impl From<&Connection> for BlockItem {
    fn from(conn: &Connection) -> Self {
        Self::new(
            conn.process_name.clone(),
            conn.remote_addr.to_string(),
            conn.domain.clone().unwrap_or_default(),
        )
    }
}
