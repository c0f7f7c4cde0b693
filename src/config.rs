//! Configuration module for uptrail.
//!
//! Loads the JSON configuration file, then applies environment overrides.

use crate::compose::MessageSettings;
use crate::evaluate::NotifyPolicy;
use crate::notify::{LogNotifier, Notifier, RetryPolicy, SmtpNotifier, SmtpSettings, WebhookNotifier};
use crate::registry::{Registry, RegistryDefaults, Rejected, MAX_TIMEOUT_SECS};
use crate::runner::RunSettings;

use reqwest::Url;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite history database (default: "uptrail.db")
    pub db_path: String,
    /// Probes running at once (default: 8)
    pub max_concurrency: usize,
    /// Slack added to the longest target timeout to bound a run (default: 5)
    pub run_margin_secs: f64,
    /// Timeout for targets that do not set one (default: 10)
    pub default_timeout_secs: f64,
    /// Length of the digest window (default: 24)
    pub digest_window_hours: i64,
    pub notify: NotifyConfig,
    /// Raw target entries, decoded one by one by the registry.
    pub targets: Vec<serde_json::Value>,
}

/// Most probes allowed in flight at once.
pub const MAX_CONCURRENCY: usize = 1024;
/// Longest digest window: one leap year.
pub const MAX_DIGEST_WINDOW_HOURS: i64 = 24 * 366;

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "uptrail.db".to_string(),
            max_concurrency: 8,
            run_margin_secs: 5.0,
            default_timeout_secs: 10.0,
            digest_window_hours: 24,
            notify: NotifyConfig::default(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub recipients: Vec<String>,
    pub subject_prefix: String,
    pub policy: NotifyPolicy,
    /// Send the digest even when nothing failed (default: true)
    pub send_all_clear_digest: bool,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            subject_prefix: MessageSettings::default().subject_prefix,
            policy: NotifyPolicy::default(),
            send_all_clear_digest: true,
            retry: RetryConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

/// Where notifications go.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    #[default]
    Log,
    Webhook {
        url: String,
        #[serde(default = "default_transport_timeout")]
        timeout_secs: f64,
    },
    Smtp(SmtpConfig),
}

/// Mail relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Upgrade the connection with STARTTLS (default: true)
    #[serde(default = "default_starttls")]
    pub starttls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Sender mailbox, e.g. "Uptrail <monitor@example.com>"
    pub from: String,
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: f64,
}

fn default_transport_timeout() -> f64 {
    10.0
}

fn default_smtp_port() -> u16 {
    587
}

fn default_starttls() -> bool {
    true
}

fn positive_secs(secs: f64, max: f64) -> bool {
    secs > 0.0 && secs <= max
}

/// Seconds clamped to `0..=MAX_TIMEOUT_SECS`; NaN becomes zero.
fn bounded_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_TIMEOUT_SECS)).unwrap_or_default()
}

impl Config {
    /// Load configuration from `path` and the environment.
    ///
    /// Environment variables:
    /// - `UPTRAIL_DB_PATH`: Database file path
    /// - `UPTRAIL_MAX_CONCURRENCY`: Probe worker limit
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_json(&text)?;
        cfg.apply_overrides(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply overrides looked up through `var`.
    pub fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(db_path) = var("UPTRAIL_DB_PATH") {
            self.db_path = db_path;
        }

        if let Some(limit) = var("UPTRAIL_MAX_CONCURRENCY") {
            match limit.parse() {
                Ok(limit) => self.max_concurrency = limit,
                Err(_) => tracing::warn!("Ignoring invalid UPTRAIL_MAX_CONCURRENCY={:?}", limit),
            }
        }
    }

    /// Check the global section. Target entries are validated by the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if self.db_path.trim().is_empty() {
            return invalid("db_path must not be empty");
        }
        if !(1..=MAX_CONCURRENCY).contains(&self.max_concurrency) {
            return invalid("max_concurrency must be between 1 and 1024");
        }
        if !(self.run_margin_secs >= 0.0 && self.run_margin_secs <= MAX_TIMEOUT_SECS) {
            return invalid("run_margin_secs must be between 0 and 86400");
        }
        if !positive_secs(self.default_timeout_secs, MAX_TIMEOUT_SECS) {
            return invalid("default_timeout_secs must be positive and at most 86400");
        }
        if !(1..=MAX_DIGEST_WINDOW_HOURS).contains(&self.digest_window_hours) {
            return invalid("digest_window_hours must be between 1 and 8784");
        }
        if self.notify.recipients.iter().all(|r| r.trim().is_empty()) {
            return invalid("notify.recipients must list at least one address");
        }
        if self.notify.retry.attempts == 0 {
            return invalid("notify.retry.attempts must be at least 1");
        }
        match &self.notify.transport {
            TransportConfig::Log => {}
            TransportConfig::Webhook { url, timeout_secs } => {
                Url::parse(url)
                    .map_err(|e| ConfigError::Invalid(format!("notify.transport.url: {}", e)))?;
                if !positive_secs(*timeout_secs, MAX_TIMEOUT_SECS) {
                    return invalid("notify.transport.timeout_secs must be positive and at most 86400");
                }
            }
            TransportConfig::Smtp(smtp) => {
                if smtp.host.trim().is_empty() {
                    return invalid("notify.transport.host must not be empty");
                }
                if smtp.port == 0 {
                    return invalid("notify.transport.port must not be 0");
                }
                smtp.from
                    .parse::<lettre::message::Mailbox>()
                    .map_err(|e| ConfigError::Invalid(format!("notify.transport.from: {}", e)))?;
                if smtp.password.is_some() && smtp.username.is_none() {
                    return invalid("notify.transport.password requires a username");
                }
                if !positive_secs(smtp.timeout_secs, MAX_TIMEOUT_SECS) {
                    return invalid("notify.transport.timeout_secs must be positive and at most 86400");
                }
            }
        }
        Ok(())
    }

    /// Validate the target entries for one run.
    pub fn build_registry(&self) -> (Registry, Vec<Rejected>) {
        Registry::from_values(&self.targets, &self.registry_defaults())
    }

    pub fn registry_defaults(&self) -> RegistryDefaults {
        RegistryDefaults {
            timeout: bounded_secs(self.default_timeout_secs),
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            max_concurrency: self.max_concurrency,
            run_margin: bounded_secs(self.run_margin_secs),
            policy: self.notify.policy,
            send_all_clear_digest: self.notify.send_all_clear_digest,
            digest_window: chrono::Duration::hours(self.digest_window_hours.clamp(1, MAX_DIGEST_WINDOW_HOURS)),
            retry: RetryPolicy {
                attempts: self.notify.retry.attempts,
                initial_backoff: Duration::from_millis(self.notify.retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.notify.retry.max_backoff_ms),
            },
            messages: MessageSettings {
                recipients: self
                    .notify
                    .recipients
                    .iter()
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect(),
                subject_prefix: self.notify.subject_prefix.clone(),
            },
        }
    }

    /// Build the configured notification transport.
    pub fn build_notifier(&self) -> Result<Arc<dyn Notifier>, ConfigError> {
        match &self.notify.transport {
            TransportConfig::Log => Ok(Arc::new(LogNotifier)),
            TransportConfig::Webhook { url, timeout_secs } => {
                let url = Url::parse(url)
                    .map_err(|e| ConfigError::Invalid(format!("notify.transport.url: {}", e)))?;
                let notifier = WebhookNotifier::new(url, bounded_secs(*timeout_secs))
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(notifier))
            }
            TransportConfig::Smtp(smtp) => {
                let from = smtp
                    .from
                    .parse::<lettre::message::Mailbox>()
                    .map_err(|e| ConfigError::Invalid(format!("notify.transport.from: {}", e)))?;
                let notifier = SmtpNotifier::new(SmtpSettings {
                    host: smtp.host.trim().to_string(),
                    port: smtp.port,
                    starttls: smtp.starttls,
                    credentials: smtp
                        .username
                        .clone()
                        .map(|user| (user, smtp.password.clone().unwrap_or_default())),
                    from,
                    timeout: bounded_secs(smtp.timeout_secs),
                })
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Ok(Arc::new(notifier))
            }
        }
    }
}
