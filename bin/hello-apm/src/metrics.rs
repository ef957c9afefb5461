use std::net::UdpSocket;

use anyhow::Context as _;
use cadence::{StatsdClient, UdpMetricSink};
use tracing::info;

/// Creates the DogStatsD client used for emitting request counters.
///
/// Metrics are sent unprefixed, with `tags` attached to every metric.
///
/// # Errors
///
/// If `statsd_addr` cannot be resolved, or the local socket cannot be set up, an error is returned.
pub fn statsd_client(statsd_addr: &str, tags: &[(&str, String)]) -> anyhow::Result<StatsdClient> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind DogStatsD socket.")?;
    socket
        .set_nonblocking(true)
        .context("Failed to set DogStatsD socket to non-blocking.")?;

    let sink = UdpMetricSink::from(statsd_addr, socket)
        .with_context(|| format!("Failed to create DogStatsD sink for '{}'.", statsd_addr))?;

    let client = tags
        .iter()
        .fold(StatsdClient::builder("", sink), |builder, (key, value)| {
            builder.with_tag(*key, value.as_str())
        })
        .build();

    info!(address = statsd_addr, "Created DogStatsD client.");

    Ok(client)
}
