//! TCP ("telnet") probe implementation.

use super::{with_deadline, ProbeError, ProbeSuccess};

use regex::bytes::Regex;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream};

/// Upper bound on banner bytes read while looking for the greeting.
const MAX_GREETING_BYTES: usize = 4096;

/// Connect to `host:port` and, when `greeting` is set, wait for a banner
/// matching it. DNS resolution, connect and banner read share `timeout`.
pub async fn run_tcp_probe(
    host: &str,
    port: u16,
    greeting: Option<&Regex>,
    timeout: Duration,
) -> Result<ProbeSuccess, ProbeError> {
    with_deadline(timeout, async {
        let start = Instant::now();

        let addrs: Vec<_> = lookup_host((host, port))
            .await
            .map_err(|e| ProbeError::Dns(format!("{}: {}", host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ProbeError::Dns(format!("{}: no addresses", host)));
        }

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let mut stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                return Err(ProbeError::Refused)
            }
            (None, Some(e)) => return Err(ProbeError::Network(e.to_string())),
            (None, None) => return Err(ProbeError::Network("no connection attempt".to_string())),
        };
        let latency = start.elapsed();

        let mut detail = format!("connected in {} ms", latency.as_millis());
        if let Some(pattern) = greeting {
            read_greeting(&mut stream, pattern).await?;
            detail.push_str(", greeting matched");
        }

        Ok(ProbeSuccess { detail, latency })
    })
    .await
}

async fn read_greeting(stream: &mut TcpStream, pattern: &Regex) -> Result<(), ProbeError> {
    let mut banner = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ProbeError::Network(format!("reading greeting: {}", e)))?;
        if n == 0 {
            return Err(ProbeError::Greeting(format!(
                "connection closed, received {:?}",
                preview(&banner)
            )));
        }

        banner.extend_from_slice(&chunk[..n]);
        if pattern.is_match(&banner) {
            return Ok(());
        }
        if banner.len() >= MAX_GREETING_BYTES {
            return Err(ProbeError::Greeting(format!(
                "no match in first {} bytes, received {:?}",
                MAX_GREETING_BYTES,
                preview(&banner)
            )));
        }
    }
}

fn preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().nth(80) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
