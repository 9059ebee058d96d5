//! OTLP export of spans, metrics and logs.
//!
//! Span records are replayed into the OpenTelemetry SDK with their original
//! identifiers and timestamps, so the trace store sees exactly the trace and
//! span ids that the log records carry. Log records sent over OTLP carry the
//! same ids as native trace context.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use correlation::{
    AttributeValue, Level, LogRecord, Metric, MetricValue, Signal, Sink, SpanRecord, SpanStatus,
};
use opentelemetry::{
    logs::{AnyValue, LogRecord as _, Logger as _, Severity},
    metrics::{Counter, Histogram, Meter},
    trace::{
        self as otel, Span as _, SpanBuilder, SpanContext, SpanKind, Status, TraceContextExt,
        TraceFlags, TraceState, Tracer as _,
    },
    Context, Key, KeyValue, Value,
};
use opentelemetry_sdk::{logs::Logger, trace::Tracer};

/// Exports [`Signal::Span`]s through an SDK tracer. Other signals are ignored.
pub struct OtlpSpanSink {
    tracer: Tracer,
}

impl OtlpSpanSink {
    pub fn new(tracer: Tracer) -> Self {
        Self { tracer }
    }
}

impl Sink for OtlpSpanSink {
    fn accept(&self, signal: Signal) {
        let Signal::Span(record) = signal else {
            return;
        };
        let end = SystemTime::from(record.end);
        let (builder, parent_cx) = span_builder(record);
        let mut span = self.tracer.build_with_context(builder, &parent_cx);
        span.end_with_timestamp(end);
    }
}

/// Translate a finished span into an SDK builder plus the context naming its parent.
fn span_builder(record: SpanRecord) -> (SpanBuilder, Context) {
    let trace_id = otel::TraceId::from_bytes(record.trace_id.to_bytes());
    let kind = if record.is_local_root() {
        SpanKind::Server
    } else {
        SpanKind::Internal
    };
    let parent_cx = match record.parent_span_id {
        Some(parent) => Context::new().with_remote_span_context(SpanContext::new(
            trace_id,
            otel::SpanId::from_bytes(parent.to_bytes()),
            TraceFlags::SAMPLED,
            record.parent_is_remote,
            TraceState::default(),
        )),
        None => Context::new(),
    };
    let status = match record.status {
        SpanStatus::Ok => Status::Ok,
        SpanStatus::Error { description } => Status::error(description),
    };

    let builder = SpanBuilder::from_name(record.name)
        .with_kind(kind)
        .with_trace_id(trace_id)
        .with_span_id(otel::SpanId::from_bytes(record.span_id.to_bytes()))
        .with_start_time(SystemTime::from(record.start))
        .with_attributes(
            record
                .attributes
                .into_iter()
                .map(|(key, value)| KeyValue::new(key, otel_value(value))),
        )
        .with_status(status);
    (builder, parent_cx)
}

fn otel_value(value: AttributeValue) -> Value {
    match value {
        AttributeValue::Bool(b) => Value::from(b),
        AttributeValue::Int(i) => Value::from(i),
        AttributeValue::Float(f) => Value::from(f),
        AttributeValue::String(s) => Value::from(s),
    }
}

/// Exports [`Signal::Log`]s through an SDK logger. Other signals are ignored.
pub struct OtlpLogSink {
    logger: Logger,
}

impl OtlpLogSink {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl Sink for OtlpLogSink {
    fn accept(&self, signal: Signal) {
        let Signal::Log(record) = signal else {
            return;
        };
        let parts = LogParts::from(record);
        let mut out = self.logger.create_log_record();
        out.set_timestamp(parts.timestamp);
        out.set_observed_timestamp(SystemTime::now());
        out.set_severity_number(parts.severity);
        out.set_severity_text(parts.severity_text.into());
        out.set_body(AnyValue::from(parts.body));
        for (key, value) in parts.attributes {
            out.add_attribute(key, value);
        }
        // The SDK stamps each record with the trace context current at emit.
        let _attached = parts.context.attach();
        self.logger.emit(out);
    }
}

/// A log record translated into OpenTelemetry terms.
struct LogParts {
    timestamp: SystemTime,
    severity: Severity,
    severity_text: &'static str,
    body: String,
    attributes: Vec<(Key, AnyValue)>,
    /// Holds the record's trace and span ids when it has them.
    context: Context,
}

impl From<LogRecord> for LogParts {
    fn from(record: LogRecord) -> Self {
        let (severity, severity_text) = match record.level {
            Level::Debug => (Severity::Debug, "DEBUG"),
            Level::Info => (Severity::Info, "INFO"),
            Level::Warn => (Severity::Warn, "WARN"),
            Level::Error => (Severity::Error, "ERROR"),
        };
        let context = match (record.trace_id, record.span_id) {
            (Some(trace_id), Some(span_id)) => {
                Context::new().with_remote_span_context(SpanContext::new(
                    otel::TraceId::from_bytes(trace_id.to_bytes()),
                    otel::SpanId::from_bytes(span_id.to_bytes()),
                    TraceFlags::SAMPLED,
                    false,
                    TraceState::default(),
                ))
            }
            _ => Context::new(),
        };
        Self {
            timestamp: SystemTime::from(record.timestamp),
            severity,
            severity_text,
            body: record.message,
            attributes: record
                .fields
                .into_iter()
                .map(|(key, value)| (Key::from(key), any_value(value)))
                .collect(),
            context,
        }
    }
}

fn any_value(value: AttributeValue) -> AnyValue {
    match value {
        AttributeValue::Bool(b) => AnyValue::Boolean(b),
        AttributeValue::Int(i) => AnyValue::Int(i),
        AttributeValue::Float(f) => AnyValue::Double(f),
        AttributeValue::String(s) => AnyValue::from(s),
    }
}

/// Records [`Signal::Metric`]s on OTLP instruments, one per metric name.
///
/// Counters become `u64` counters and timers become `f64` histograms, each
/// tagged with `service` and `operation`.
pub struct OtlpMetricSink {
    meter: Meter,
    counters: Mutex<HashMap<String, Counter<u64>>>,
    histograms: Mutex<HashMap<String, Histogram<f64>>>,
}

impl OtlpMetricSink {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            counters: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    fn counter(&self, name: &str) -> Counter<u64> {
        lock(&self.counters)
            .entry(name.to_owned())
            .or_insert_with(|| self.meter.u64_counter(name.to_owned()).init())
            .clone()
    }

    fn histogram(&self, name: &str) -> Histogram<f64> {
        lock(&self.histograms)
            .entry(name.to_owned())
            .or_insert_with(|| self.meter.f64_histogram(name.to_owned()).init())
            .clone()
    }
}

impl Sink for OtlpMetricSink {
    fn accept(&self, signal: Signal) {
        let Signal::Metric(metric) = signal else {
            return;
        };
        let attributes = metric_attributes(&metric);
        match metric.value {
            MetricValue::Counter { value } => self.counter(&metric.name).add(value, &attributes),
            MetricValue::Timer { millis } => {
                self.histogram(&metric.name).record(millis, &attributes)
            }
        }
    }
}

fn metric_attributes(metric: &Metric) -> [KeyValue; 2] {
    [
        KeyValue::new("service", metric.service.clone()),
        KeyValue::new("operation", metric.operation.clone()),
    ]
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
