//! Structured emission within a unit of work.
//!
//! An [`Emitter`] starts units of work. Each unit of work is represented by
//! its root [`ActiveSpan`]; child operations are opened from a span or from a
//! [`Scope`], the cloneable read-only view handed to request handlers.
//!
//! Context is threaded explicitly through these values. There is no ambient
//! or global "current span", so concurrent units of work cannot observe each
//! other's identifiers.
//!
//! # Emission order
//!
//! Every log record and span record is handed to the sink at the moment it
//! is produced, so within one unit of work the sink sees records in the
//! order they happened. When a root span ends it writes one closing log
//! record and then its own span record.
//!
//! A [`Scope`] outlives nothing: once its span has ended, logs and children
//! requested through any clone of it are refused.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    attributes::{AttributeValue, Attributes},
    context::{TraceContext, TraceParent},
    ids::{IdGenerator, SpanId},
    record::{
        millis_between, to_wire_precision, Level, LogRecord, Metric, Signal, SpanRecord, SpanStatus,
    },
    sink::Sink,
};

/// Description attached to spans closed by `Drop` rather than explicitly.
pub const DROPPED_SPAN_DESCRIPTION: &str = "span dropped before completion";

/// Creates units of work and routes their telemetry to a sink.
///
/// Cheap to clone; all clones share one identifier source and sink.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<Inner>,
}

struct Inner {
    service: String,
    ids: IdGenerator,
    sink: Arc<dyn Sink>,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("service", &self.inner.service)
            .finish_non_exhaustive()
    }
}

impl Emitter {
    /// Create an emitter for `service` writing to `sink`.
    pub fn new(service: impl Into<String>, ids: IdGenerator, sink: Arc<dyn Sink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: service.into(),
                ids,
                sink,
            }),
        }
    }

    /// Service name stamped on every record.
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Number of records the sink has had to drop so far.
    pub fn dropped(&self) -> u64 {
        self.inner.sink.dropped()
    }

    /// Start a unit of work and return its root span.
    ///
    /// If `inbound` is present its trace id is adopted and its parent id
    /// becomes the remote parent of the root span; otherwise a fresh trace
    /// id is minted.
    pub fn start_unit(&self, name: impl Into<String>, inbound: Option<&TraceParent>) -> ActiveSpan {
        let clock = Clock::start();
        let (trace_id, parent) = match inbound {
            Some(tp) => (tp.trace_id, Some(tp.parent_id)),
            None => (self.inner.ids.trace_id(), None),
        };
        let ctx = TraceContext {
            trace_id,
            span_id: self.inner.ids.span_id(),
        };
        let scope = Scope {
            emitter: self.clone(),
            ctx,
            clock,
            closed: Arc::new(AtomicBool::new(false)),
        };
        ActiveSpan::open(scope, name.into(), parent, parent.is_some(), true)
    }

    /// Emit a log record outside any unit of work (startup, shutdown).
    pub fn log_untraced(&self, level: Level, message: impl Into<String>) {
        let record = LogRecord::new(Utc::now(), level, self.service(), message);
        self.emit(Signal::Log(record));
    }

    /// Record a counter increment tagged with this service and `operation`.
    pub fn count(&self, name: &str, operation: &str, value: u64) {
        self.emit(Signal::Metric(Metric::counter(name, self.service(), operation, value)));
    }

    /// Record a timing in milliseconds tagged with this service and `operation`.
    pub fn time(&self, name: &str, operation: &str, millis: f64) {
        self.emit(Signal::Metric(Metric::timer(name, self.service(), operation, millis)));
    }

    fn emit(&self, signal: Signal) {
        self.inner.sink.accept(signal);
    }
}

/// Wall-clock anchor plus monotonic offset.
///
/// All timestamps of one unit of work come from the same anchor, so their
/// order follows the monotonic clock even if the system clock is stepped.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.mono.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        to_wire_precision(self.wall + offset)
    }
}

/// Read-only view of an active span: logs against it and opens children.
#[derive(Clone)]
pub struct Scope {
    emitter: Emitter,
    ctx: TraceContext,
    clock: Clock,
    /// Set once the viewed span has ended; shared by every clone.
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("ctx", &self.ctx).finish()
    }
}

impl Scope {
    /// The trace context records emitted through this scope carry.
    pub fn context(&self) -> TraceContext {
        self.ctx
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Current time on this unit of work's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether the span this scope views has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open a child span of the span this scope views.
    ///
    /// If that span has already ended the child is inert: it emits no
    /// span record and its scope refuses logs.
    pub fn child(&self, name: impl Into<String>) -> ActiveSpan {
        let name = name.into();
        let closed = self.is_closed();
        if closed {
            warn!(span = %name, parent = %self.ctx.span_id, "child requested after parent span ended; not recorded");
        }
        let scope = Scope {
            emitter: self.emitter.clone(),
            ctx: TraceContext {
                trace_id: self.ctx.trace_id,
                span_id: self.emitter.inner.ids.span_id(),
            },
            clock: self.clock,
            closed: Arc::new(AtomicBool::new(closed)),
        };
        let mut span = ActiveSpan::open(scope, name, Some(self.ctx.span_id), false, false);
        span.ended = closed;
        span
    }

    /// Emit a log record carrying this scope's trace and span ids.
    pub fn log_with<I, K>(&self, level: Level, message: impl Into<String>, fields: I)
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let message = message.into();
        if self.is_closed() {
            warn!(span = %self.ctx.span_id, %message, "log emitted after span ended; not recorded");
            return;
        }
        self.emit_log(level, message, fields);
    }

    fn emit_log<I, K>(&self, level: Level, message: String, fields: I)
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let mut record = LogRecord::new(self.clock.now(), level, self.emitter.service(), message);
        record.trace_id = Some(self.ctx.trace_id);
        record.span_id = Some(self.ctx.span_id);
        for (key, value) in fields {
            record.insert_field(key, value);
        }
        self.emitter.emit(Signal::Log(record));
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        self.log_with(level, message, std::iter::empty::<(String, AttributeValue)>());
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }
}

/// One open span. Ends exactly once, explicitly or on drop.
pub struct ActiveSpan {
    scope: Scope,
    parent: Option<SpanId>,
    parent_is_remote: bool,
    unit_root: bool,
    name: String,
    start: DateTime<Utc>,
    attributes: Attributes,
    closing_fields: Attributes,
    ended: bool,
}

impl fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("name", &self.name)
            .field("ctx", &self.scope.ctx)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl ActiveSpan {
    fn open(
        scope: Scope,
        name: String,
        parent: Option<SpanId>,
        parent_is_remote: bool,
        unit_root: bool,
    ) -> Self {
        let start = scope.clock.now();
        Self {
            scope,
            parent,
            parent_is_remote,
            unit_root,
            name,
            start,
            attributes: Attributes::new(),
            closing_fields: Attributes::new(),
            ended: false,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn context(&self) -> TraceContext {
        self.scope.ctx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Add a field to the closing log record of a unit of work.
    ///
    /// Has no effect on child spans, which write no closing record.
    pub fn set_closing_field(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.closing_fields.insert(key.into(), value.into());
    }

    /// Milliseconds since this span started.
    pub fn elapsed_ms(&self) -> f64 {
        millis_between(self.start, self.scope.clock.now())
    }

    pub fn child(&self, name: impl Into<String>) -> ActiveSpan {
        self.scope.child(name)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.scope.info(message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.scope.warn(message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.scope.error(message);
    }

    /// End with status ok.
    pub fn end_ok(mut self) {
        self.close(SpanStatus::Ok);
    }

    /// End with status error and the given description.
    pub fn end_error(mut self, description: impl Into<String>) {
        self.close(SpanStatus::Error {
            description: description.into(),
        });
    }

    /// End according to `result`, using the error's `Display` as description.
    pub fn end_with<T, E: fmt::Display>(self, result: &Result<T, E>) {
        match result {
            Ok(_) => self.end_ok(),
            Err(e) => self.end_error(e.to_string()),
        }
    }

    fn close(&mut self, status: SpanStatus) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.scope.closed.store(true, Ordering::Release);

        if self.unit_root {
            let mut fields = std::mem::take(&mut self.closing_fields);
            fields.insert(
                "duration_ms".into(),
                AttributeValue::Float(millis_between(self.start, self.scope.clock.now())),
            );
            let (level, message) = match &status {
                SpanStatus::Ok => (Level::Info, format!("{} completed", self.name)),
                SpanStatus::Error { description } => {
                    fields.insert("error".into(), AttributeValue::String(description.clone()));
                    (Level::Error, format!("{} failed", self.name))
                }
            };
            self.scope.emit_log(level, message, fields);
        }

        let record = SpanRecord {
            trace_id: self.scope.ctx.trace_id,
            span_id: self.scope.ctx.span_id,
            parent_span_id: self.parent,
            parent_is_remote: self.parent_is_remote,
            name: std::mem::take(&mut self.name),
            start: self.start,
            // Stamped after the closing log so the span covers it.
            end: self.scope.clock.now(),
            attributes: std::mem::take(&mut self.attributes),
            status,
        };
        self.scope.emitter.emit(Signal::Span(record));
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if !self.ended {
            self.close(SpanStatus::Error {
                description: DROPPED_SPAN_DESCRIPTION.into(),
            });
        }
    }
}
