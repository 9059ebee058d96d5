//! Wire types and errors shared by the instrumented sample service and its tests.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
