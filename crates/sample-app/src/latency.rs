//! Simulated work durations.
//!
//! Each simulated operation draws its duration from a fixed range (seconds).
//! With latency disabled the draw still happens, so handlers report the same
//! values, but nothing sleeps.

use std::{ops::Range, time::Duration};

use rand::Rng;

pub const USERS_QUERY: Range<f64> = 0.01..0.05;
pub const ORDERS_QUERY: Range<f64> = 0.02..0.08;
pub const VALIDATE_REQUEST: Range<f64> = 0.005..0.01;
pub const ENRICH_ORDERS: Range<f64> = 0.01..0.03;
pub const SLOW_OPERATION: Range<f64> = 0.5..2.0;

#[derive(Debug, Clone, Copy)]
pub struct Latency {
    enabled: bool,
}

impl Latency {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Draw a duration from `range`, sleep for it if enabled, and return it in seconds.
    pub async fn pause(&self, range: Range<f64>) -> f64 {
        let secs = rand::thread_rng().gen_range(range);
        if self.enabled {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
        secs
    }
}
