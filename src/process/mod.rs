//! Privileged subprocess execution.
//!
//! Every external tool the helper drives (pfctl, networksetup, mv, rm, the DNS
//! proxy) goes through a [`CommandRunner`], so handlers can be tested against a
//! recording mock instead of the real system.

pub mod retry;
pub mod runner;

pub use retry::RetryPolicy;
pub use runner::{CommandRunner, PrivilegedCommand, StreamingChild, SubprocessError, SystemRunner};
