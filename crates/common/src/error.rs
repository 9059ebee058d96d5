//! Service error taxonomy.

use thiserror::Error;

/// Top-level service error type.
///
/// Both variants are returned to callers as HTTP 500.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The backing database query failed.
    #[error("database error: {0}")]
    Database(String),

    /// A deliberately injected failure used to exercise error telemetry.
    #[error("{0}")]
    Simulated(String),
}

impl ServiceError {
    /// Returns the HTTP status code that should be sent for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::Database(_) | ServiceError::Simulated(_) => 500,
        }
    }

    /// Short machine-readable code used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Database(_) => "database_error",
            ServiceError::Simulated(_) => "simulated_error",
        }
    }
}
