//! HTTP probe implementation.

use super::{with_deadline, ProbeError, ProbeSuccess};
use crate::registry::StatusSet;

use reqwest::{Client, Url};
use std::error::Error as _;
use std::time::{Duration, Instant};

/// Run an HTTP GET against `url`.
///
/// Succeeds when a response arrives within `timeout` with a status in
/// `accepted`. The body is read in full so transfer time is included.
pub async fn run_http_probe(
    client: &Client,
    url: &Url,
    accepted: &StatusSet,
    timeout: Duration,
) -> Result<ProbeSuccess, ProbeError> {
    with_deadline(timeout, async {
        let start = Instant::now();

        let response = client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_error(&e, timeout))?;

        let status = response.status();

        response
            .bytes()
            .await
            .map_err(|e| classify_error(&e, timeout))?;

        let latency = start.elapsed();

        if !accepted.contains(status.as_u16()) {
            return Err(ProbeError::Status(status.to_string()));
        }

        Ok(ProbeSuccess {
            detail: format!("HTTP {} in {} ms", status.as_u16(), latency.as_millis()),
            latency,
        })
    })
    .await
}

/// Map a reqwest error onto the failure categories operators care about.
fn classify_error(err: &reqwest::Error, timeout: Duration) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout(timeout);
    }

    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return ProbeError::Refused;
            }
        }
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }

    let lower = chain.to_ascii_lowercase();
    if lower.contains("connection refused") {
        ProbeError::Refused
    } else if lower.contains("dns error") || lower.contains("failed to lookup address") {
        ProbeError::Dns(chain)
    } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
        ProbeError::Tls(chain)
    } else {
        ProbeError::Network(chain)
    }
}
