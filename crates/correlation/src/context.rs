//! Trace context and W3C `traceparent` propagation.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::TelemetryError,
    ids::{SpanId, TraceId},
};

/// Name of the inbound/outbound propagation header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Identifies a unit of work and its currently active operation.
///
/// Copied by value into every record; nothing downstream mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl TraceContext {
    /// The `traceparent` value advertising this context to a downstream system.
    pub fn traceparent(&self) -> TraceParent {
        TraceParent {
            trace_id: self.trace_id,
            parent_id: self.span_id,
            sampled: true,
        }
    }
}

/// A parsed W3C `traceparent` header: `00-<trace id>-<parent id>-<flags>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub parent_id: SpanId,
    pub sampled: bool,
}

impl FromStr for TraceParent {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('-').collect();
        if parts.len() < 4 {
            return Err(TelemetryError::InvalidTraceParent(format!(
                "expected 4 segments, got {}",
                parts.len()
            )));
        }

        let version = parts[0];
        if !is_hex_byte(version) {
            return Err(TelemetryError::InvalidTraceParent(format!(
                "bad version {version:?}"
            )));
        }
        if version == "ff" {
            return Err(TelemetryError::InvalidTraceParent("version ff is forbidden".into()));
        }
        // Version 00 has exactly four segments; later versions may append more.
        if version == "00" && parts.len() != 4 {
            return Err(TelemetryError::InvalidTraceParent(
                "version 00 must have exactly 4 segments".into(),
            ));
        }

        let trace_id: TraceId = parts[1]
            .parse()
            .map_err(|e| TelemetryError::InvalidTraceParent(format!("trace id: {e}")))?;
        let parent_id: SpanId = parts[2]
            .parse()
            .map_err(|e| TelemetryError::InvalidTraceParent(format!("parent id: {e}")))?;

        let flags = parts[3];
        if !is_hex_byte(flags) {
            return Err(TelemetryError::InvalidTraceParent(format!("bad flags {flags:?}")));
        }
        let flags = u8::from_str_radix(flags, 16)
            .map_err(|e| TelemetryError::InvalidTraceParent(format!("flags: {e}")))?;

        Ok(Self {
            trace_id,
            parent_id,
            sampled: flags & 0x01 == 0x01,
        })
    }
}

/// Exactly two lowercase hex characters.
fn is_hex_byte(s: &str) -> bool {
    s.len() == 2 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = if self.sampled { "01" } else { "00" };
        write!(f, "00-{}-{}-{flags}", self.trace_id, self.parent_id)
    }
}
