//! Trace and span identifiers.
//!
//! Both identifiers are fixed-width opaque values rendered as lowercase hex:
//! a [`TraceId`] is 16 bytes (32 hex characters) and a [`SpanId`] is 8 bytes
//! (16 hex characters). The all-zero value is invalid for both, matching the
//! W3C Trace Context rules that downstream collectors enforce.

use std::{fmt, str::FromStr};

use rand::{rngs::OsRng, Rng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TelemetryError;

/// Number of hex characters in a rendered [`TraceId`].
pub const TRACE_ID_HEX_LEN: usize = 32;
/// Number of hex characters in a rendered [`SpanId`].
pub const SPAN_ID_HEX_LEN: usize = 16;

/// Identifier shared by every span and log record of one unit of work.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

/// Identifier of one operation within a unit of work.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl TraceId {
    /// Build a trace id from its big-endian byte form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    /// Big-endian byte form, as carried on the OTLP wire.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Returns `true` for the reserved all-zero value.
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl SpanId {
    /// Build a span id from its big-endian byte form.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Big-endian byte form, as carried on the OTLP wire.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Returns `true` for the reserved all-zero value.
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({self})")
    }
}

/// Validate that `s` is exactly `len` lowercase hex digits.
fn check_hex(s: &str, len: usize) -> Result<(), TelemetryError> {
    if s.len() != len {
        return Err(TelemetryError::InvalidId(format!(
            "expected {len} hex characters, got {}",
            s.len()
        )));
    }
    if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(TelemetryError::InvalidId(format!(
            "{s:?} is not lowercase hex"
        )));
    }
    Ok(())
}

impl FromStr for TraceId {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_hex(s, TRACE_ID_HEX_LEN)?;
        let value = u128::from_str_radix(s, 16)
            .map_err(|e| TelemetryError::InvalidId(e.to_string()))?;
        if value == 0 {
            return Err(TelemetryError::InvalidId("all-zero trace id".into()));
        }
        Ok(Self(value))
    }
}

impl FromStr for SpanId {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        check_hex(s, SPAN_ID_HEX_LEN)?;
        let value =
            u64::from_str_radix(s, 16).map_err(|e| TelemetryError::InvalidId(e.to_string()))?;
        if value == 0 {
            return Err(TelemetryError::InvalidId("all-zero span id".into()));
        }
        Ok(Self(value))
    }
}

macro_rules! hex_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

hex_serde!(TraceId);
hex_serde!(SpanId);

/// Source of fresh identifiers.
///
/// Construction proves that the OS random source is readable; after that,
/// generation cannot fail. Each call draws from the calling thread's CSPRNG
/// (seeded from the OS), so concurrent units of work never contend on a lock.
#[derive(Debug, Clone, Copy)]
pub struct IdGenerator {
    _probed: (),
}

impl IdGenerator {
    /// Probe the operating-system random source and return a generator.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::RandomSourceUnavailable`] if the OS source
    /// cannot be read. Callers must treat this as fatal.
    pub fn from_os_rng() -> Result<Self, TelemetryError> {
        let mut probe = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| TelemetryError::RandomSourceUnavailable(e.to_string()))?;
        Ok(Self { _probed: () })
    }

    /// Mint a new, non-zero trace id.
    pub fn trace_id(&self) -> TraceId {
        let mut rng = rand::thread_rng();
        loop {
            let value: u128 = rng.gen();
            if value != 0 {
                return TraceId(value);
            }
        }
    }

    /// Mint a new, non-zero span id.
    pub fn span_id(&self) -> SpanId {
        let mut rng = rand::thread_rng();
        loop {
            let value: u64 = rng.gen();
            if value != 0 {
                return SpanId(value);
            }
        }
    }
}
