//! Ships log records to an HTTP log store.
//!
//! Records are queued without blocking, batched by a background task, and
//! POSTed as NDJSON with basic auth. A batch that keeps failing is retried
//! with exponential backoff, then dropped with a diagnostic.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use correlation::{Signal, Sink};
use rand::Rng;
use reqwest::{header::CONTENT_TYPE, Client};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::LogStore;

/// Largest number of records sent in one request.
pub const MAX_BATCH: usize = 512;
/// Longest a record waits in a partial batch.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
/// Attempts after the first before a batch is dropped.
pub const MAX_RETRIES: u32 = 4;

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 5_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

enum Message {
    Line(Bytes),
    Flush(oneshot::Sender<()>),
}

/// [`Sink`] for log records bound for the log store. Other signals are ignored.
pub struct HttpLogSink {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

impl HttpLogSink {
    /// Spawn the shipping task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn spawn(store: LogStore, capacity: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build log store HTTP client")?;
        let dropped = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shipper = Shipper {
            client,
            store,
            dropped: dropped.clone(),
            batch: Vec::new(),
            backoff_base_ms: BACKOFF_BASE_MS,
        };
        tokio::spawn(shipper.run(rx));
        Ok(Self { tx, dropped })
    }

    /// Wait until every record accepted before this call has been shipped or dropped.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl Sink for HttpLogSink {
    fn accept(&self, signal: Signal) {
        if !matches!(signal, Signal::Log(_)) {
            return;
        }
        let queued = match signal.to_ndjson() {
            Ok(line) => self.tx.try_send(Message::Line(line)).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to serialise log record for log store");
                false
            }
        };
        if !queued {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                warn!(dropped = n, "log store queue full; dropping records");
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Shipper {
    client: Client,
    store: LogStore,
    dropped: Arc<AtomicU64>,
    batch: Vec<Bytes>,
    backoff_base_ms: u64,
}

impl Shipper {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        let start = tokio::time::Instant::now() + FLUSH_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, FLUSH_INTERVAL);
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(Message::Line(line)) => {
                        self.batch.push(line);
                        if self.batch.len() >= MAX_BATCH {
                            self.ship().await;
                        }
                    }
                    Some(Message::Flush(done)) => {
                        self.ship().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = ticker.tick() => self.ship().await,
            }
        }
        self.ship().await;
    }

    async fn ship(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.batch);
        let count = lines.len();
        let body = Bytes::from(lines.concat());

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(calculate_backoff(attempt, self.backoff_base_ms, BACKOFF_MAX_MS))
                    .await;
            }
            match self.post(body.clone()).await {
                Ok(()) => {
                    debug!(records = count, "shipped log batch");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "log store request failed"),
            }
        }

        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
        warn!(records = count, "giving up on log batch after retries");
    }

    async fn post(&self, body: Bytes) -> Result<(), reqwest::Error> {
        self.client
            .post(self.store.url.clone())
            .basic_auth(&self.store.username, Some(&self.store.password))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Exponential backoff capped at `max_ms`, plus up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(max_ms);
    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(delay_ms + jitter)
}
