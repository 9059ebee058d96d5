//! Cross-signal telemetry correlation.
//!
//! Every unit of work (one inbound request) gets one [`TraceContext`]. Its
//! log records and spans all carry that context, so they can be joined in
//! separate stores after travelling separate paths. Metrics are aggregated
//! and carry no trace identifiers.
//!
//! - [`ids`]: trace/span identifiers and their generator.
//! - [`context`]: trace context and `traceparent` propagation.
//! - [`emitter`]: units of work, spans, and structured log emission.
//! - [`sink`]: non-blocking destinations for emitted telemetry.
//! - [`conformance`]: relay topologies and correlation checks over landed data.

pub mod attributes;
pub mod conformance;
pub mod context;
pub mod emitter;
pub mod error;
pub mod ids;
pub mod record;
pub mod sink;

pub use attributes::{AttributeValue, Attributes};
pub use context::{TraceContext, TraceParent, TRACEPARENT_HEADER};
pub use emitter::{ActiveSpan, Emitter, Scope};
pub use error::TelemetryError;
pub use ids::{IdGenerator, SpanId, TraceId};
pub use record::{Level, LogRecord, Metric, MetricValue, Signal, SignalKind, SpanRecord, SpanStatus};
pub use sink::{Delivery, MemorySink, NdjsonSink, Router, Sink, Tee};
