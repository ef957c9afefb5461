use std::time::Duration;

use anyhow::{bail, Context as _};
use reqwest::Client;
use tracing::info;

/// EC2 instance metadata endpoint for the private IPv4 address of the instance.
pub const ECS_METADATA_URL: &str = "http://169.254.169.254/latest/meta-data/local-ipv4";

const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates the HTTP client used for querying the instance metadata service.
pub fn metadata_client() -> anyhow::Result<Client> {
    Client::builder()
        .timeout(METADATA_REQUEST_TIMEOUT)
        .build()
        .context("Failed to create instance metadata HTTP client.")
}

/// Fetches the host address of the ECS container instance from the metadata service at `url`.
///
/// The trace agent runs on the container instance itself, so this address is where traces should be sent.
///
/// # Errors
///
/// If the request fails, the response status is not successful, or the response body is empty, an error is returned.
pub async fn fetch_ecs_host(client: &Client, url: &str) -> anyhow::Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to query instance metadata at '{}'.", url))?;

    let status = response.status();
    if !status.is_success() {
        bail!("Instance metadata at '{}' returned status {}.", url, status);
    }

    let body = response
        .text()
        .await
        .context("Failed to read instance metadata response body.")?;

    let host = body.trim();
    if host.is_empty() {
        bail!("Instance metadata at '{}' returned an empty host address.", url);
    }

    info!(host, "Discovered ECS host from instance metadata.");

    Ok(host.to_string())
}
