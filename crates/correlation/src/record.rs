//! Telemetry records: log records, finished spans, and metrics.
//!
//! These are immutable values once handed to a sink. Relays may add or drop
//! attributes but the identifier fields are never rewritten.

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    attributes::{AttributeValue, Attributes},
    error::TelemetryError,
    ids::{SpanId, TraceId},
};

/// Keys owned by the log record envelope; operation fields may not use them.
pub const RESERVED_KEYS: [&str; 6] = ["timestamp", "level", "service", "message", "trace_id", "span_id"];

/// UTC timestamps with fixed microsecond precision.
///
/// The wire form is RFC 3339 with exactly six fractional digits and a `Z`
/// suffix, so a parsed value compares equal to the one that was written.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Render a timestamp in the wire format.
    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Parse the wire format (any RFC 3339 offset is normalised to UTC).
    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc).trunc_subsecs(6))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(de::Error::custom)
    }
}

/// Truncate a timestamp to the precision carried on the wire.
pub fn to_wire_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub service: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<SpanId>,
    /// Operation-specific fields, flattened beside the envelope keys.
    #[serde(flatten)]
    pub fields: Attributes,
}

impl LogRecord {
    /// A record emitted outside any unit of work (no trace fields).
    pub fn new(
        timestamp: DateTime<Utc>,
        level: Level,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: to_wire_precision(timestamp),
            level,
            service: service.into(),
            message: message.into(),
            trace_id: None,
            span_id: None,
            fields: Attributes::new(),
        }
    }

    /// Insert an operation field. Reserved keys are refused and the field is
    /// dropped; returns whether the field was stored.
    pub fn insert_field(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> bool {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            warn!(key = %key, "dropping log field that collides with a reserved key");
            return false;
        }
        self.fields.insert(key, value.into());
        true
    }

    /// Builder form of [`LogRecord::insert_field`].
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.insert_field(key, value);
        self
    }

    /// Serialise to one newline-terminated JSON line.
    pub fn to_ndjson(&self) -> Result<Bytes, TelemetryError> {
        ndjson_line(self)
    }
}

/// Outcome of a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error { description: String },
}

impl SpanStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error { .. })
    }
}

/// A finished span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    /// The parent lives in another process (adopted from an inbound header).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parent_is_remote: bool,
    pub name: String,
    #[serde(with = "timestamp")]
    pub start: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Attributes,
    pub status: SpanStatus,
}

impl SpanRecord {
    /// Elapsed time in fractional milliseconds (microsecond resolution).
    pub fn duration_ms(&self) -> f64 {
        millis_between(self.start, self.end)
    }

    /// `true` when this span has no parent in the local process.
    pub fn is_local_root(&self) -> bool {
        self.parent_span_id.is_none() || self.parent_is_remote
    }
}

/// Fractional milliseconds between two instants, zero if `end` precedes `start`.
pub fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let micros = (end - start).num_microseconds().unwrap_or(i64::MAX).max(0);
    micros as f64 / 1000.0
}

/// Value carried by a [`Metric`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricValue {
    Counter { value: u64 },
    Timer { millis: f64 },
}

/// An aggregatable measurement. Deliberately carries no trace identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub service: String,
    pub operation: String,
    #[serde(flatten)]
    pub value: MetricValue,
}

impl Metric {
    pub fn counter(
        name: impl Into<String>,
        service: impl Into<String>,
        operation: impl Into<String>,
        value: u64,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            operation: operation.into(),
            value: MetricValue::Counter { value },
        }
    }

    pub fn timer(
        name: impl Into<String>,
        service: impl Into<String>,
        operation: impl Into<String>,
        millis: f64,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            operation: operation.into(),
            value: MetricValue::Timer { millis },
        }
    }
}

/// Which kind of telemetry a [`Signal`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Log,
    Span,
    Metric,
}

/// A single unit of telemetry travelling from the emitter through relays.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Log(LogRecord),
    Span(SpanRecord),
    Metric(Metric),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Log(_) => SignalKind::Log,
            Signal::Span(_) => SignalKind::Span,
            Signal::Metric(_) => SignalKind::Metric,
        }
    }

    /// Trace id carried by this signal, if any. Metrics never carry one.
    pub fn trace_id(&self) -> Option<TraceId> {
        match self {
            Signal::Log(l) => l.trace_id,
            Signal::Span(s) => Some(s.trace_id),
            Signal::Metric(_) => None,
        }
    }

    /// Serialise the inner record to one newline-terminated JSON line.
    pub fn to_ndjson(&self) -> Result<Bytes, TelemetryError> {
        match self {
            Signal::Log(l) => ndjson_line(l),
            Signal::Span(s) => ndjson_line(s),
            Signal::Metric(m) => ndjson_line(m),
        }
    }
}

fn ndjson_line<T: Serialize>(value: &T) -> Result<Bytes, TelemetryError> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}
