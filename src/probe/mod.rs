//! Probe module for network monitoring.
//!
//! Supports HTTP(S) and raw TCP ("telnet") probes. A probe never returns an
//! error to its caller: every failure mode ends up in the detail of a
//! [`Outcome::Failure`](crate::models::Outcome::Failure) result.

mod http;
mod tcp;

pub use http::*;
pub use tcp::*;

use crate::models::CheckResult;
use crate::registry::{Target, TargetKind};

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused")]
    Refused,
    #[error("dns lookup failed: {0}")]
    Dns(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {0}")]
    Status(String),
    #[error("greeting mismatch: {0}")]
    Greeting(String),
}

/// What a successful probe measured.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSuccess {
    pub detail: String,
    pub latency: Duration,
}

/// Executes a single check against a target.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &Target) -> CheckResult;
}

/// Network-backed [`Probe`] sharing one HTTP client across a run.
#[derive(Debug, Clone)]
pub struct Checker {
    client: reqwest::Client,
}

impl Checker {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("uptrail/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for Checker {
    async fn probe(&self, target: &Target) -> CheckResult {
        let start_time = Utc::now();

        let result = match &target.kind {
            TargetKind::Http { url, accepted } => {
                run_http_probe(&self.client, url, accepted, target.timeout).await
            }
            TargetKind::Tcp {
                host,
                port,
                greeting,
            } => run_tcp_probe(host, *port, greeting.as_ref(), target.timeout).await,
        };

        match result {
            Ok(ok) => {
                tracing::debug!("Probe {}: {}", target.name, ok.detail);
                CheckResult::success(target.id.clone(), start_time, ok.detail, ok.latency)
            }
            Err(e) => {
                tracing::warn!("Probe failed for {}: {}", target.name, e);
                CheckResult::failure(target.id.clone(), start_time, e.to_string())
            }
        }
    }
}

/// Run `fut` under `timeout`, mapping expiry to [`ProbeError::Timeout`].
pub(crate) async fn with_deadline<F>(timeout: Duration, fut: F) -> Result<ProbeSuccess, ProbeError>
where
    F: std::future::Future<Output = Result<ProbeSuccess, ProbeError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
