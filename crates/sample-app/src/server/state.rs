//! Shared application state injected into every Axum handler.

use correlation::Emitter;

use crate::{db::Database, latency::Latency};

/// Application state shared across all request handlers.
///
/// Every field is cheap to clone, so Axum can clone the state per request.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Starts units of work and emits their telemetry.
    pub emitter: Emitter,
    /// Simulated database backing the API routes.
    pub db: Database,
    /// Simulated durations of in-process work.
    pub latency: Latency,
}

impl AppState {
    pub fn new(emitter: Emitter, db: Database, latency: Latency) -> Self {
        Self {
            emitter,
            db,
            latency,
        }
    }
}
