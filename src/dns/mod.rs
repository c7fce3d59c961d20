//! DNS redirection: the local proxy process and system resolver settings.

pub mod configurator;
pub mod supervisor;

pub use configurator::DnsConfigurator;
pub use supervisor::{DnsProxySupervisor, SupervisorError, SupervisorExit, SupervisorState};
