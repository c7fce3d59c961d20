//! Prometheus exporter for helper counters.

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Start the exporter when enabled.
///
/// With metrics disabled this does nothing and every counter update in the
/// crate is a no-op.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    describe_counter!("helper_sessions_total", "Client connections accepted");
    describe_counter!(
        "helper_auth_failures_total",
        "Sessions closed because the peer failed authentication"
    );
    describe_counter!("helper_commands_total", "Commands executed, by command and outcome");
    describe_counter!(
        "helper_dns_proxy_failures_total",
        "DNS proxy output failures seen by the supervisor"
    );

    info!(listen = %config.listen, "metrics exporter started");
    Ok(())
}
