//! Emission sinks.
//!
//! A [`Sink`] is the only resource shared between concurrent units of work.
//! `accept` must never block on I/O and never fail from the caller's point of
//! view: records that cannot be delivered are dropped and counted.
//!
//! Every record is serialised to a single line before it reaches any writer,
//! and each line is written with one `write_all`, so concurrent writers never
//! interleave or truncate records.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use bytes::Bytes;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tracing::warn;

use crate::{
    ids::TraceId,
    record::{LogRecord, Metric, Signal, SignalKind, SpanRecord},
};

/// Destination for emitted telemetry.
#[cfg_attr(test, mockall::automock)]
pub trait Sink: Send + Sync {
    /// Take ownership of one signal. Never blocks on I/O.
    fn accept(&self, signal: Signal);

    /// Records dropped so far because the destination could not keep up.
    fn dropped(&self) -> u64 {
        0
    }
}

/// How an [`NdjsonSink`] hands lines to its writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queue up to `capacity` lines for a background writer; drop on overflow.
    Buffered { capacity: usize },
    /// Write each line before `accept` returns.
    Synchronous,
}

enum Message {
    Line(Bytes),
    Flush(oneshot::Sender<()>),
}

enum Mode {
    Buffered(mpsc::Sender<Message>),
    Synchronous(Mutex<Box<dyn Write + Send>>),
}

/// Writes each signal as one line of JSON.
pub struct NdjsonSink {
    mode: Mode,
    /// Shared with the background writer, which counts failed writes.
    dropped: Arc<AtomicU64>,
}

impl NdjsonSink {
    /// Spawn a background writer task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn buffered<W>(writer: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(write_lines(writer, rx, dropped.clone()));
        Self {
            mode: Mode::Buffered(tx),
            dropped,
        }
    }

    /// Write lines inline, holding a lock for the duration of each write.
    pub fn synchronous<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            mode: Mode::Synchronous(Mutex::new(Box::new(writer))),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build a sink for `delivery` writing to the process's stdout.
    pub fn stdout(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Buffered { capacity } => Self::buffered(tokio::io::stdout(), capacity),
            Delivery::Synchronous => Self::synchronous(std::io::stdout()),
        }
    }

    /// Wait until every line accepted before this call has been written.
    pub async fn flush(&self) {
        match &self.mode {
            Mode::Buffered(tx) => {
                let (done_tx, done_rx) = oneshot::channel();
                if tx.send(Message::Flush(done_tx)).await.is_ok() {
                    let _ = done_rx.await;
                }
            }
            Mode::Synchronous(out) => {
                let _ = lock(out).flush();
            }
        }
    }

    fn record_drop(&self) {
        count_drop(&self.dropped);
    }
}

fn count_drop(dropped: &AtomicU64) {
    let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
    if n.is_power_of_two() {
        warn!(dropped = n, "telemetry sink cannot keep up; dropping records");
    }
}

impl Sink for NdjsonSink {
    fn accept(&self, signal: Signal) {
        let line = match signal.to_ndjson() {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialise telemetry record");
                self.record_drop();
                return;
            }
        };
        match &self.mode {
            Mode::Buffered(tx) => {
                if tx.try_send(Message::Line(line)).is_err() {
                    self.record_drop();
                }
            }
            Mode::Synchronous(out) => {
                let written = {
                    let mut out = lock(out);
                    out.write_all(&line).and_then(|()| out.flush())
                };
                if let Err(e) = written {
                    warn!(error = %e, "failed to write telemetry record");
                    self.record_drop();
                }
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while writing leaves the writer usable; keep going.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Background writer: runs until every sender is dropped.
async fn write_lines<W>(mut writer: W, mut rx: mpsc::Receiver<Message>, dropped: Arc<AtomicU64>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Line(line) => {
                if let Err(e) = writer.write_all(&line).await {
                    warn!(error = %e, "failed to write telemetry record");
                    count_drop(&dropped);
                    continue;
                }
                // Flush eagerly when the queue is idle so tailing agents see records promptly.
                if rx.is_empty() {
                    let _ = writer.flush().await;
                }
            }
            Message::Flush(done) => {
                let _ = writer.flush().await;
                let _ = done.send(());
            }
        }
    }
    let _ = writer.flush().await;
}

/// Sends each signal kind to its own destination.
///
/// Models the emitter side of multi-path routing: logs, spans and metrics
/// leave the process along independent paths. Kinds with no destination are
/// discarded.
#[derive(Clone, Default)]
pub struct Router {
    logs: Option<Arc<dyn Sink>>,
    spans: Option<Arc<dyn Sink>>,
    metrics: Option<Arc<dyn Sink>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(mut self, sink: Arc<dyn Sink>) -> Self {
        self.logs = Some(sink);
        self
    }

    pub fn spans(mut self, sink: Arc<dyn Sink>) -> Self {
        self.spans = Some(sink);
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn Sink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    fn destination(&self, kind: SignalKind) -> Option<&Arc<dyn Sink>> {
        match kind {
            SignalKind::Log => self.logs.as_ref(),
            SignalKind::Span => self.spans.as_ref(),
            SignalKind::Metric => self.metrics.as_ref(),
        }
    }
}

impl Sink for Router {
    fn accept(&self, signal: Signal) {
        if let Some(sink) = self.destination(signal.kind()) {
            sink.accept(signal);
        }
    }

    fn dropped(&self) -> u64 {
        [&self.logs, &self.spans, &self.metrics]
            .into_iter()
            .flatten()
            .map(|s| s.dropped())
            .sum()
    }
}

/// Forwards every signal to each of several sinks.
#[derive(Clone, Default)]
pub struct Tee {
    sinks: Vec<Arc<dyn Sink>>,
}

impl Tee {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }
}

impl Sink for Tee {
    fn accept(&self, signal: Signal) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.accept(signal.clone());
            }
            last.accept(signal);
        }
    }

    fn dropped(&self) -> u64 {
        self.sinks.iter().map(|s| s.dropped()).sum()
    }
}

/// Keeps every signal in memory, in arrival order.
#[derive(Clone, Default)]
pub struct MemorySink {
    signals: Arc<Mutex<Vec<Signal>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything accepted so far.
    pub fn signals(&self) -> Vec<Signal> {
        lock(&self.signals).clone()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        lock(&self.signals)
            .iter()
            .filter_map(|s| match s {
                Signal::Log(l) => Some(l.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        lock(&self.signals)
            .iter()
            .filter_map(|s| match s {
                Signal::Span(span) => Some(span.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn metrics(&self) -> Vec<Metric> {
        lock(&self.signals)
            .iter()
            .filter_map(|s| match s {
                Signal::Metric(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Log records of one unit of work, in emission order.
    pub fn logs_for(&self, trace_id: TraceId) -> Vec<LogRecord> {
        self.logs()
            .into_iter()
            .filter(|l| l.trace_id == Some(trace_id))
            .collect()
    }

    /// Spans of one unit of work, in the order they ended.
    pub fn spans_for(&self, trace_id: TraceId) -> Vec<SpanRecord> {
        self.spans()
            .into_iter()
            .filter(|s| s.trace_id == trace_id)
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.signals).clear();
    }
}

impl Sink for MemorySink {
    fn accept(&self, signal: Signal) {
        lock(&self.signals).push(signal);
    }
}
