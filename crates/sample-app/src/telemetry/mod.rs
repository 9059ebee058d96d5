//! Telemetry wiring: where each signal kind leaves the process.
//!
//! - Logs: NDJSON on stdout, tailed by a node agent; OTLP/gRPC to the
//!   collector with native trace context; optionally shipped straight to an
//!   HTTP log store.
//! - Spans: OTLP/gRPC to the collector, identifiers preserved.
//! - Metrics: OTLP/gRPC to the collector; no trace identifiers.
//!
//! The service's own diagnostics go to stderr through `tracing` and are not
//! part of the correlated telemetry.

pub mod export;
pub mod init;
pub mod log_store;
pub mod probe;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use correlation::{Emitter, IdGenerator, NdjsonSink, Router, Sink, Tee};
use tracing::info;

use crate::config::Config;
use export::{OtlpLogSink, OtlpMetricSink, OtlpSpanSink};
use init::OtelPipelines;
use log_store::HttpLogSink;

pub use init::init_diagnostics;

/// How long a startup probe waits for a TCP connection.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Running telemetry pipelines and the emitter that feeds them.
pub struct Telemetry {
    emitter: Emitter,
    stdout: Arc<NdjsonSink>,
    log_store: Option<Arc<HttpLogSink>>,
    otel: OtelPipelines,
}

impl Telemetry {
    /// Probe destinations, install exporters, and build the emitter.
    ///
    /// # Errors
    ///
    /// Fails if a probed destination is unreachable, the OS random source is
    /// unavailable, or an exporter cannot be built. Each is fatal at startup.
    pub async fn start(cfg: &Config) -> Result<Self> {
        let endpoint = cfg.otlp_endpoint()?;
        let store = cfg.log_store()?;

        if cfg.startup_probe {
            probe::reachable(&endpoint, PROBE_TIMEOUT)
                .await
                .context("OTLP endpoint unreachable")?;
            if let Some(store) = &store {
                probe::reachable(&store.url, PROBE_TIMEOUT)
                    .await
                    .context("log store unreachable")?;
            }
            info!(endpoint = %endpoint, "telemetry destinations reachable");
        }

        let ids = IdGenerator::from_os_rng().context("cannot mint trace identifiers")?;

        let otel = OtelPipelines::install(
            cfg.otel_exporter_otlp_endpoint.trim(),
            init::service_resource(&cfg.otel_service_name, &cfg.otel_environment),
        )?;

        let stdout = Arc::new(NdjsonSink::stdout(cfg.delivery()?));
        let log_store = store
            .map(|s| HttpLogSink::spawn(s, cfg.telemetry_buffer_capacity))
            .transpose()?
            .map(Arc::new);

        let mut log_sinks: Vec<Arc<dyn Sink>> = Vec::new();
        log_sinks.push(stdout.clone());
        log_sinks.push(Arc::new(OtlpLogSink::new(
            otel.logger(&cfg.otel_service_name),
        )));
        if let Some(http) = &log_store {
            log_sinks.push(http.clone());
        }

        let router = Router::new()
            .logs(Arc::new(Tee::new(log_sinks)))
            .spans(Arc::new(OtlpSpanSink::new(otel.tracer())))
            .metrics(Arc::new(OtlpMetricSink::new(
                otel.meter(&cfg.otel_service_name),
            )));
        let emitter = Emitter::new(cfg.otel_service_name.clone(), ids, Arc::new(router));

        Ok(Self {
            emitter,
            stdout,
            log_store,
            otel,
        })
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Drain buffered log records and flush the OTLP pipelines.
    pub async fn shutdown(self) {
        self.stdout.flush().await;
        if let Some(http) = &self.log_store {
            http.flush().await;
        }
        let dropped = self.emitter.dropped();
        if dropped > 0 {
            tracing::warn!(dropped, "telemetry records were dropped during this run");
        }
        // The SDK's shutdown blocks on the final export.
        let otel = self.otel;
        if let Err(e) = tokio::task::spawn_blocking(move || otel.shutdown()).await {
            tracing::warn!(error = %e, "telemetry shutdown task failed");
        }
    }
}
