//! Diagnostics subscriber and OTLP pipeline initialisation.

use anyhow::{Context, Result};
use opentelemetry::{
    logs::LoggerProvider as _, metrics::Meter, metrics::MeterProvider as _, KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    logs::{Logger, LoggerProvider},
    metrics::SdkMeterProvider,
    runtime,
    trace::Tracer,
    Resource,
};
use opentelemetry_semantic_conventions::resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise the global `tracing` subscriber for the service's own diagnostics.
///
/// Output is JSON on stderr; stdout is reserved for correlated telemetry
/// records. `RUST_LOG` takes precedence over `log_level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_diagnostics(log_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(())
}

/// Installed OTLP trace, metric and log pipelines.
pub struct OtelPipelines {
    tracer: Tracer,
    meter_provider: SdkMeterProvider,
    logger_provider: LoggerProvider,
}

impl OtelPipelines {
    /// Install batch span and log export plus periodic metric export to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if any OTLP exporter cannot be built.
    pub fn install(endpoint: &str, resource: Resource) -> Result<Self> {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default().with_resource(resource.clone()),
            )
            .install_batch(runtime::Tokio)
            .context("failed to install OTLP tracing pipeline")?;

        let meter_provider = opentelemetry_otlp::new_pipeline()
            .metrics(runtime::Tokio)
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_resource(resource.clone())
            .build()
            .context("failed to install OTLP metrics pipeline")?;

        let logger_provider = opentelemetry_otlp::new_pipeline()
            .logging()
            .with_log_config(opentelemetry_sdk::logs::Config::default().with_resource(resource))
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(runtime::Tokio)
            .context("failed to install OTLP logs pipeline")?;

        Ok(Self {
            tracer,
            meter_provider,
            logger_provider,
        })
    }

    pub fn tracer(&self) -> Tracer {
        self.tracer.clone()
    }

    pub fn meter(&self, service: &str) -> Meter {
        self.meter_provider.meter(service.to_owned())
    }

    pub fn logger(&self, service: &str) -> Logger {
        self.logger_provider.logger(service.to_owned())
    }

    /// Export everything still buffered and stop the pipelines.
    pub fn shutdown(self) {
        for result in self.logger_provider.force_flush() {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to flush log provider");
            }
        }
        opentelemetry::global::shutdown_tracer_provider();
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "failed to shut down meter provider");
        }
    }
}

/// Resource attributes identifying this service instance.
pub fn service_resource(service: &str, environment: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new(resource::SERVICE_NAME, service.to_owned()),
        KeyValue::new(resource::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        KeyValue::new(
            resource::SERVICE_INSTANCE_ID,
            uuid::Uuid::new_v4().to_string(),
        ),
        KeyValue::new(resource::DEPLOYMENT_ENVIRONMENT, environment.to_owned()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{Key, Value};

    #[test]
    fn resource_identifies_service_and_instance() {
        let res = service_resource("sample-app", "demo");
        assert_eq!(
            res.get(Key::new(resource::SERVICE_NAME)),
            Some(Value::from("sample-app"))
        );
        assert_eq!(
            res.get(Key::new(resource::DEPLOYMENT_ENVIRONMENT)),
            Some(Value::from("demo"))
        );
        assert!(res.get(Key::new(resource::SERVICE_INSTANCE_ID)).is_some());

        let other = service_resource("sample-app", "demo");
        assert_ne!(
            res.get(Key::new(resource::SERVICE_INSTANCE_ID)),
            other.get(Key::new(resource::SERVICE_INSTANCE_ID))
        );
    }
}
