//! Configuration loading and validation for the sample service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or
//! invalid: running without a usable telemetry destination would silently
//! lose correlation data.

use anyhow::{Context, Result};
use correlation::Delivery;
use reqwest::Url;
use serde::Deserialize;

/// Validated service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// OTLP/gRPC endpoint of the collector, e.g. `http://otel-collector:4317`. **Required.**
    pub otel_exporter_otlp_endpoint: String,

    /// `service.name` stamped on every record and resource.
    #[serde(default = "default_service_name")]
    pub otel_service_name: String,

    /// `deployment.environment` resource attribute.
    #[serde(default = "default_environment")]
    pub otel_environment: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Diagnostic log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional HTTP ingestion URL of a log store. Logs are also written to stdout.
    #[serde(default)]
    pub log_store_url: Option<String>,

    /// Basic-auth user for the log store. Required when `log_store_url` is set.
    #[serde(default)]
    pub log_store_username: Option<String>,

    /// Basic-auth password for the log store. Required when `log_store_url` is set.
    #[serde(default)]
    pub log_store_password: Option<String>,

    /// `"buffered"` (drop on overflow) or `"synchronous"` (write inline).
    #[serde(default = "default_delivery")]
    pub telemetry_delivery: String,

    /// Queue depth of the buffered stdout sink.
    #[serde(default = "default_buffer_capacity")]
    pub telemetry_buffer_capacity: usize,

    /// TCP-probe the telemetry endpoints before serving traffic.
    #[serde(default = "default_true")]
    pub startup_probe: bool,

    /// Sleep for realistic durations inside simulated operations.
    #[serde(default = "default_true")]
    pub simulate_latency: bool,

    /// Probability (0.0–1.0) that a simulated database query fails.
    #[serde(default)]
    pub db_failure_rate: f64,
}

/// Resolved log-store destination.
#[derive(Debug, Clone)]
pub struct LogStore {
    pub url: Url,
    pub username: String,
    pub password: String,
}

fn default_service_name() -> String {
    "sample-app".into()
}
fn default_environment() -> String {
    "demo".into()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_delivery() -> String {
    "buffered".into()
}
fn default_buffer_capacity() -> usize {
    4096
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.otel_exporter_otlp_endpoint, "OTEL_EXPORTER_OTLP_ENDPOINT")?;
        ensure_non_empty(&self.otel_service_name, "OTEL_SERVICE_NAME")?;
        self.otlp_endpoint()?;
        self.delivery()?;
        self.log_store()?;

        if self.telemetry_buffer_capacity == 0 {
            anyhow::bail!("TELEMETRY_BUFFER_CAPACITY must be > 0");
        }
        if !(0.0..=1.0).contains(&self.db_failure_rate) {
            anyhow::bail!("DB_FAILURE_RATE must be between 0.0 and 1.0");
        }
        Ok(())
    }

    /// The OTLP endpoint as a URL.
    pub fn otlp_endpoint(&self) -> Result<Url> {
        parse_http_url(&self.otel_exporter_otlp_endpoint, "OTEL_EXPORTER_OTLP_ENDPOINT")
    }

    /// Delivery mode of the stdout log sink.
    pub fn delivery(&self) -> Result<Delivery> {
        match self.telemetry_delivery.trim().to_ascii_lowercase().as_str() {
            "buffered" => Ok(Delivery::Buffered {
                capacity: self.telemetry_buffer_capacity,
            }),
            "synchronous" => Ok(Delivery::Synchronous),
            other => anyhow::bail!(
                "TELEMETRY_DELIVERY must be \"buffered\" or \"synchronous\", got {other:?}"
            ),
        }
    }

    /// The log-store destination, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or credentials are missing.
    pub fn log_store(&self) -> Result<Option<LogStore>> {
        let Some(raw) = self.log_store_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let url = parse_http_url(raw, "LOG_STORE_URL")?;
        let username = required_credential(&self.log_store_username, "LOG_STORE_USERNAME")?;
        let password = required_credential(&self.log_store_password, "LOG_STORE_PASSWORD")?;
        Ok(Some(LogStore {
            url,
            username,
            password,
        }))
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

fn required_credential(value: &Option<String>, name: &str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_owned()),
        _ => anyhow::bail!("{name} is required when LOG_STORE_URL is set"),
    }
}

fn parse_http_url(raw: &str, name: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("{name} is not a valid URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("{name} must use http or https, got {}", url.scheme());
    }
    if url.host_str().is_none() {
        anyhow::bail!("{name} must include a host");
    }
    Ok(url)
}
