//! Individual reachability probes

use std::time::Duration;

use tokio::net::lookup_host;
use tracing::debug;
use url::Url;

use crate::errors::ProvisionError;
use crate::models::deployment::DeploymentMode;

/// Shell command reporting whether `service` is running
pub fn service_check_command(service: &str, mode: DeploymentMode) -> String {
    match mode {
        DeploymentMode::Standard => format!("systemctl is-active --quiet {}", service),
        DeploymentMode::Containerized => format!(
            "docker ps --filter name={svc} --filter status=running --format '{{{{.Names}}}}' | grep -q . || systemctl is-active --quiet {svc}",
            svc = service
        ),
    }
}

/// Loopback request through the local web server, printing only the status
pub fn loopback_command(scheme: &str, domain: &str, timeout: Duration) -> String {
    format!(
        "curl -sk -o /dev/null -w '%{{http_code}}' --max-time {} -H 'Host: {}' {}://127.0.0.1/",
        timeout.as_secs().max(1),
        domain,
        scheme
    )
}

/// Loopback request printing the body followed by the status on its own line
pub fn endpoint_command(scheme: &str, domain: &str, path: &str, timeout: Duration) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    format!(
        "curl -sk --max-time {} -H 'Host: {}' -w '\\n%{{http_code}}' {}://127.0.0.1{}",
        timeout.as_secs().max(1),
        domain,
        scheme,
        path
    )
}

/// Split curl output into (body, status); the status is the last line
pub fn parse_status_output(output: &str) -> Option<(String, u16)> {
    let trimmed = output.trim_end();
    let (body, status) = match trimmed.rsplit_once('\n') {
        Some((body, status)) => (body, status),
        None => ("", trimmed),
    };
    let status = status.trim().parse::<u16>().ok()?;
    Some((body.to_string(), status))
}

/// Whether a status means the site answered
pub fn is_reachable_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Resolve `domain` through DNS and request it from this machine
pub async fn external_probe(scheme: &str, domain: &str, timeout: Duration) -> Result<u16, ProvisionError> {
    let url = Url::parse(&format!("{}://{}/", scheme, domain))
        .map_err(|e| ProvisionError::ValidationError(format!("Invalid domain {:?}: {}", domain, e)))?;
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs: Vec<_> = tokio::time::timeout(timeout, lookup_host((domain, port)))
        .await
        .map_err(|_| ProvisionError::Timeout(format!("Resolving {}", domain)))??
        .collect();
    if addrs.is_empty() {
        return Err(ProvisionError::ConnectionError(format!("{} did not resolve", domain)));
    }
    debug!("{} resolved to {:?}", domain, addrs);

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.get(url).send().await?;
    Ok(response.status().as_u16())
}
