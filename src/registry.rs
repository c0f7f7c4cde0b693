//! Target registry.
//!
//! Turns the raw target entries of a configuration file into validated
//! [`Target`] values for one run. Bad entries are reported and skipped so the
//! remaining targets are still probed.

use crate::models::TargetId;

use regex::bytes::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;
use thiserror::Error;

/// Longest accepted per-target timeout: one day.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;

/// One target entry as it appears in the configuration file.
///
/// Every field is optional so that a single malformed entry is rejected by
/// [`Registry::build`] instead of failing the whole file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: Option<String>,
    /// `url` / `http` or `telnet` / `tcp`. Inferred from the address if absent.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub address: Option<String>,
    pub timeout_secs: Option<f64>,
    pub accepted_statuses: Option<Vec<StatusSpec>>,
    pub expect_greeting: Option<String>,
}

/// An accepted status entry: `200`, `"200-299"` or `"2xx"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusSpec {
    Code(i64),
    Text(String),
}

impl TargetSpec {
    /// Decode one raw entry. On failure the returned spec carries whatever
    /// name and address could be read, for reporting.
    pub fn from_value(value: &Value) -> Result<Self, (Self, RejectReason)> {
        Self::deserialize(value).map_err(|e| {
            let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
            let partial = Self {
                name: text("name"),
                address: text("address"),
                ..Default::default()
            };
            (partial, RejectReason::InvalidEntry(e.to_string()))
        })
    }
}

impl fmt::Display for StatusSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusSpec::Code(c) => write!(f, "{}", c),
            StatusSpec::Text(s) => f.write_str(s),
        }
    }
}

/// Set of HTTP status codes considered healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSet {
    ranges: Vec<RangeInclusive<u16>>,
}

impl Default for StatusSet {
    /// Everything below 500: only server errors count as an outage.
    fn default() -> Self {
        Self {
            ranges: vec![100..=499],
        }
    }
}

impl StatusSet {
    pub fn parse(specs: &[StatusSpec]) -> Result<Self, RejectReason> {
        if specs.is_empty() {
            return Err(RejectReason::InvalidStatus("empty status list".to_string()));
        }

        let ranges = specs
            .iter()
            .map(parse_status)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ranges })
    }

    pub fn contains(&self, status: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&status))
    }
}

fn parse_status(spec: &StatusSpec) -> Result<RangeInclusive<u16>, RejectReason> {
    let invalid = || RejectReason::InvalidStatus(spec.to_string());
    let code = |n: i64| -> Result<u16, RejectReason> {
        if (100..=599).contains(&n) {
            Ok(n as u16)
        } else {
            Err(invalid())
        }
    };

    match spec {
        StatusSpec::Code(n) => code(*n).map(|c| c..=c),
        StatusSpec::Text(text) => {
            let text = text.trim();
            if let Some(class) = text.strip_suffix("xx").or_else(|| text.strip_suffix("XX")) {
                let digit: i64 = class.parse().map_err(|_| invalid())?;
                if !(1..=5).contains(&digit) {
                    return Err(invalid());
                }
                let lo = (digit * 100) as u16;
                return Ok(lo..=lo + 99);
            }
            if let Some((lo, hi)) = text.split_once('-') {
                let lo = code(lo.trim().parse().map_err(|_| invalid())?)?;
                let hi = code(hi.trim().parse().map_err(|_| invalid())?)?;
                if lo > hi {
                    return Err(invalid());
                }
                return Ok(lo..=hi);
            }
            let c = code(text.parse().map_err(|_| invalid())?)?;
            Ok(c..=c)
        }
    }
}

/// How a target is probed.
#[derive(Debug, Clone)]
pub enum TargetKind {
    Http {
        url: Url,
        accepted: StatusSet,
    },
    Tcp {
        host: String,
        port: u16,
        /// Pattern the service banner must match before the probe succeeds.
        greeting: Option<Regex>,
    },
}

impl TargetKind {
    pub fn name(&self) -> &'static str {
        match self {
            TargetKind::Http { .. } => "url",
            TargetKind::Tcp { .. } => "telnet",
        }
    }
}

/// A validated monitoring target.
#[derive(Debug, Clone)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub address: String,
    pub kind: TargetKind,
    pub timeout: Duration,
}

/// Why a target entry was excluded from the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("malformed entry: {0}")]
    InvalidEntry(String),
    #[error("missing address")]
    MissingAddress,
    #[error("unknown target type {0:?}")]
    UnknownType(String),
    #[error("cannot determine type of {0:?}")]
    CannotInferType(String),
    #[error("invalid url {address:?}: {reason}")]
    InvalidUrl { address: String, reason: String },
    #[error("invalid host:port {0:?}")]
    InvalidHostPort(String),
    #[error("invalid accepted status {0:?}")]
    InvalidStatus(String),
    #[error("invalid greeting pattern: {0}")]
    InvalidGreeting(String),
    #[error("invalid timeout {0}")]
    InvalidTimeout(f64),
    #[error("{field} does not apply to {kind} targets")]
    FieldNotApplicable { field: &'static str, kind: &'static str },
    #[error("duplicate of target {0}")]
    Duplicate(TargetId),
}

/// A target entry that was excluded, with enough context to find it.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    /// Position of the entry in the input list.
    pub index: usize,
    pub name: Option<String>,
    pub address: Option<String>,
    pub reason: RejectReason,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target #{}", self.index + 1)?;
        match (&self.name, &self.address) {
            (Some(name), _) => write!(f, " ({})", name)?,
            (None, Some(address)) => write!(f, " ({})", address)?,
            (None, None) => {}
        }
        write!(f, ": {}", self.reason)
    }
}

/// Values applied to entries that leave them unset.
#[derive(Debug, Clone)]
pub struct RegistryDefaults {
    pub timeout: Duration,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// The usable targets of one run, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    targets: Vec<Target>,
}

impl Registry {
    /// Validate `specs`, returning the usable targets and the rejected entries.
    pub fn build(specs: &[TargetSpec], defaults: &RegistryDefaults) -> (Self, Vec<Rejected>) {
        Self::build_entries(specs.iter().cloned().map(Ok), defaults)
    }

    /// Like [`Registry::build`], decoding each raw entry on its own so a
    /// mistyped field only rejects that entry.
    pub fn from_values(entries: &[Value], defaults: &RegistryDefaults) -> (Self, Vec<Rejected>) {
        Self::build_entries(entries.iter().map(TargetSpec::from_value), defaults)
    }

    fn build_entries<I>(entries: I, defaults: &RegistryDefaults) -> (Self, Vec<Rejected>)
    where
        I: Iterator<Item = Result<TargetSpec, (TargetSpec, RejectReason)>>,
    {
        let mut targets = Vec::new();
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();

        for (index, entry) in entries.enumerate() {
            let (spec, validated) = match entry {
                Ok(spec) => {
                    let validated = validate(&spec, defaults);
                    (spec, validated)
                }
                Err((spec, reason)) => (spec, Err(reason)),
            };
            let reject = |reason| Rejected {
                index,
                name: spec.name.clone(),
                address: spec.address.clone(),
                reason,
            };

            let target = match validated {
                Ok(t) => t,
                Err(reason) => {
                    tracing::warn!("Registry: rejecting target #{}: {}", index + 1, reason);
                    rejected.push(reject(reason));
                    continue;
                }
            };

            if !seen.insert(target.id.clone()) {
                tracing::warn!("Registry: dropping duplicate target {}", target.id);
                rejected.push(reject(RejectReason::Duplicate(target.id)));
                continue;
            }

            targets.push(target);
        }

        (Self { targets }, rejected)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, id: &TargetId) -> Option<&Target> {
        self.targets.iter().find(|t| &t.id == id)
    }

    /// Human label for `id`, falling back to the id itself.
    pub fn label<'a>(&'a self, id: &'a TargetId) -> &'a str {
        self.get(id).map(|t| t.name.as_str()).unwrap_or(id.as_str())
    }

    /// Longest per-target timeout, used to bound the run.
    pub fn max_timeout(&self) -> Duration {
        self.targets
            .iter()
            .map(|t| t.timeout)
            .max()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Http,
    Tcp,
}

fn validate(spec: &TargetSpec, defaults: &RegistryDefaults) -> Result<Target, RejectReason> {
    let address = spec
        .address
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .ok_or(RejectReason::MissingAddress)?;

    let kind = match spec.kind.as_deref().map(|k| k.trim().to_ascii_lowercase()) {
        Some(k) if k == "url" || k == "http" || k == "https" => Kind::Http,
        Some(k) if k == "telnet" || k == "tcp" => Kind::Tcp,
        Some(k) => return Err(RejectReason::UnknownType(k)),
        None => infer_kind(address)?,
    };

    let timeout = match spec.timeout_secs {
        None => defaults.timeout,
        Some(secs) if secs > 0.0 && secs <= MAX_TIMEOUT_SECS => {
            Duration::try_from_secs_f64(secs).map_err(|_| RejectReason::InvalidTimeout(secs))?
        }
        Some(secs) => return Err(RejectReason::InvalidTimeout(secs)),
    };

    let (id, kind) = match kind {
        Kind::Http => {
            if spec.expect_greeting.is_some() {
                return Err(RejectReason::FieldNotApplicable {
                    field: "expect_greeting",
                    kind: "url",
                });
            }
            let url = parse_url(address)?;
            let accepted = match &spec.accepted_statuses {
                Some(list) => StatusSet::parse(list)?,
                None => StatusSet::default(),
            };
            (TargetId::new(url.as_str()), TargetKind::Http { url, accepted })
        }
        Kind::Tcp => {
            if spec.accepted_statuses.is_some() {
                return Err(RejectReason::FieldNotApplicable {
                    field: "accepted_statuses",
                    kind: "telnet",
                });
            }
            let (host, port) = parse_host_port(address)?;
            let greeting = spec
                .expect_greeting
                .as_deref()
                .map(|p| Regex::new(p).map_err(|e| RejectReason::InvalidGreeting(e.to_string())))
                .transpose()?;
            let id = if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            };
            (TargetId::new(id), TargetKind::Tcp { host, port, greeting })
        }
    };

    let name = spec
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(address)
        .to_string();

    Ok(Target {
        id,
        name,
        address: address.to_string(),
        kind,
        timeout,
    })
}

/// `http(s)://…` is a URL, `host:1234` is a TCP service.
fn infer_kind(address: &str) -> Result<Kind, RejectReason> {
    let lower = address.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Ok(Kind::Http);
    }
    match address.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            Ok(Kind::Tcp)
        }
        _ => Err(RejectReason::CannotInferType(address.to_string())),
    }
}

fn parse_url(address: &str) -> Result<Url, RejectReason> {
    let url = Url::parse(address).map_err(|e| RejectReason::InvalidUrl {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        "http" | "https" => Err(RejectReason::InvalidUrl {
            address: address.to_string(),
            reason: "missing host".to_string(),
        }),
        other => Err(RejectReason::InvalidUrl {
            address: address.to_string(),
            reason: format!("unsupported scheme {:?}", other),
        }),
    }
}

fn parse_host_port(address: &str) -> Result<(String, u16), RejectReason> {
    let invalid = || RejectReason::InvalidHostPort(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;

    let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(v6) => v6,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };
    if host.is_empty() || host.contains('/') {
        return Err(invalid());
    }

    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }

    Ok((host.to_ascii_lowercase(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(address: &str) -> TargetSpec {
        TargetSpec {
            address: Some(address.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_infers_type_from_address() {
        let (registry, rejected) = Registry::build(
            &[spec("https://example.com/health"), spec("mail.example.com:25")],
            &RegistryDefaults::default(),
        );
        assert!(rejected.is_empty());
        let kinds: Vec<_> = registry.iter().map(|t| t.kind.name()).collect();
        assert_eq!(kinds, vec!["url", "telnet"]);
    }

    #[test]
    fn test_rejects_without_blocking_others() {
        let specs = vec![
            spec("https://good.example.com"),
            TargetSpec::default(),
            spec("not a target"),
            TargetSpec {
                kind: Some("telnet".to_string()),
                ..spec("db.example.com:notaport")
            },
            spec("db.example.com:5432"),
        ];
        let (registry, rejected) = Registry::build(&specs, &RegistryDefaults::default());

        assert_eq!(registry.len(), 2);
        assert_eq!(rejected.len(), 3);
        assert_eq!(rejected[0].index, 1);
        assert_eq!(rejected[0].reason, RejectReason::MissingAddress);
        assert!(matches!(rejected[1].reason, RejectReason::CannotInferType(_)));
        assert!(matches!(rejected[2].reason, RejectReason::InvalidHostPort(_)));
    }

    #[test]
    fn test_duplicates_keep_first() {
        let first = TargetSpec {
            name: Some("first".to_string()),
            ..spec("MAIL.example.com:25")
        };
        let second = TargetSpec {
            name: Some("second".to_string()),
            ..spec("mail.example.com:25")
        };
        let (registry, rejected) = Registry::build(&[first, second], &RegistryDefaults::default());

        assert_eq!(registry.len(), 1);
        let id = TargetId::new("mail.example.com:25");
        assert_eq!(registry.label(&id), "first");
        assert_eq!(rejected[0].reason, RejectReason::Duplicate(id));
        assert_eq!(rejected[0].to_string(), "target #2 (second): duplicate of target mail.example.com:25");
    }

    #[test]
    fn test_fields_must_match_type() {
        let http_with_greeting = TargetSpec {
            expect_greeting: Some("^220".to_string()),
            ..spec("https://example.com")
        };
        let tcp_with_status = TargetSpec {
            accepted_statuses: Some(vec![StatusSpec::Code(200)]),
            ..spec("example.com:25")
        };
        let (registry, rejected) =
            Registry::build(&[http_with_greeting, tcp_with_status], &RegistryDefaults::default());
        assert!(registry.is_empty());
        assert!(rejected
            .iter()
            .all(|r| matches!(r.reason, RejectReason::FieldNotApplicable { .. })));
    }

    #[test]
    fn test_timeout_defaults_and_validation() {
        let defaults = RegistryDefaults {
            timeout: Duration::from_secs(3),
        };
        let custom = TargetSpec {
            timeout_secs: Some(0.5),
            ..spec("a.example.com:80")
        };
        let broken = TargetSpec {
            timeout_secs: Some(-1.0),
            ..spec("b.example.com:80")
        };
        let (registry, rejected) =
            Registry::build(&[spec("c.example.com:80"), custom, broken], &defaults);

        let timeouts: Vec<_> = registry.iter().map(|t| t.timeout).collect();
        assert_eq!(timeouts, vec![Duration::from_secs(3), Duration::from_millis(500)]);
        assert_eq!(registry.max_timeout(), Duration::from_secs(3));
        assert_eq!(rejected[0].reason, RejectReason::InvalidTimeout(-1.0));
    }

    #[test]
    fn test_oversized_timeouts_are_rejected() {
        let entries: Vec<_> = [1e20, 1e19, f64::INFINITY, f64::NAN, MAX_TIMEOUT_SECS + 1.0]
            .into_iter()
            .enumerate()
            .map(|(i, secs)| TargetSpec {
                timeout_secs: Some(secs),
                ..spec(&format!("big{}.example.com:80", i))
            })
            .chain([TargetSpec {
                timeout_secs: Some(MAX_TIMEOUT_SECS),
                ..spec("good.example.com:80")
            }])
            .collect();
        let (registry, rejected) = Registry::build(&entries, &RegistryDefaults::default());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.max_timeout(), Duration::from_secs(86_400));
        assert_eq!(rejected.len(), 5);
        assert!(rejected
            .iter()
            .all(|r| matches!(r.reason, RejectReason::InvalidTimeout(_))));
    }

    #[test]
    fn test_mistyped_entry_rejects_only_itself() {
        let entries: Vec<Value> = serde_json::from_str(
            r#"[
                {"name": "good", "address": "good.example.com:80"},
                {"name": "slow", "address": "slow.example.com:80", "timeout_secs": "ten"},
                {"address": "https://example.com", "accepted_statuses": [true]},
                "not an object",
                {"address": "https://example.org"}
            ]"#,
        )
        .unwrap();
        let (registry, rejected) = Registry::from_values(&entries, &RegistryDefaults::default());

        let names: Vec<_> = registry.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["good", "https://example.org"]);

        let indexes: Vec<_> = rejected.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert!(rejected
            .iter()
            .all(|r| matches!(r.reason, RejectReason::InvalidEntry(_))));
        assert_eq!(rejected[0].name.as_deref(), Some("slow"));
        assert!(rejected[0].to_string().starts_with("target #2 (slow): malformed entry"));
        assert_eq!(rejected[1].address.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_status_set_parsing() {
        let set = StatusSet::parse(&[
            StatusSpec::Text("2xx".to_string()),
            StatusSpec::Code(301),
            StatusSpec::Text("401-403".to_string()),
        ])
        .unwrap();
        assert!(set.contains(204));
        assert!(set.contains(301));
        assert!(set.contains(402));
        assert!(!set.contains(302));
        assert!(!set.contains(500));

        assert!(StatusSet::parse(&[StatusSpec::Code(700)]).is_err());
        assert!(StatusSet::parse(&[StatusSpec::Text("9xx".to_string())]).is_err());
        assert!(StatusSet::parse(&[StatusSpec::Text("300-200".to_string())]).is_err());
        assert!(StatusSet::parse(&[]).is_err());
    }

    #[test]
    fn test_default_status_set_tolerates_client_errors() {
        let set = StatusSet::default();
        assert!(set.contains(200));
        assert!(set.contains(404));
        assert!(!set.contains(503));
    }

    #[test]
    fn test_ipv6_and_bad_greeting() {
        let bad_greeting = TargetSpec {
            expect_greeting: Some("(".to_string()),
            ..spec("example.com:25")
        };
        let (registry, rejected) =
            Registry::build(&[spec("[::1]:2525"), bad_greeting], &RegistryDefaults::default());

        let target = registry.iter().next().unwrap();
        assert_eq!(target.id.as_str(), "[::1]:2525");
        match &target.kind {
            TargetKind::Tcp { host, port, .. } => {
                assert_eq!(host, "::1");
                assert_eq!(*port, 2525);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(matches!(rejected[0].reason, RejectReason::InvalidGreeting(_)));
    }

    #[test]
    fn test_spec_deserializes_mixed_statuses() {
        let json = r#"{"name":"site","type":"url","address":"https://example.com","accepted_statuses":["2xx",301]}"#;
        let spec: TargetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(
            spec.accepted_statuses,
            Some(vec![StatusSpec::Text("2xx".to_string()), StatusSpec::Code(301)])
        );
    }
}
