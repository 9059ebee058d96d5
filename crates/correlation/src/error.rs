//! Error types for the correlation layer.

use thiserror::Error;

/// Errors produced while setting up or parsing telemetry context.
///
/// None of these are ever returned from an emission call: emission is
/// infallible from the point of view of the unit of work being recorded.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The operating-system random source could not be read. Fatal at startup.
    #[error("random source unavailable: {0}")]
    RandomSourceUnavailable(String),

    /// A trace or span identifier was not valid lowercase hex of the expected width.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An inbound `traceparent` header could not be parsed.
    #[error("invalid traceparent: {0}")]
    InvalidTraceParent(String),

    /// A record could not be serialised to its wire format.
    #[error("serialisation failed: {0}")]
    Serialise(#[from] serde_json::Error),
}
