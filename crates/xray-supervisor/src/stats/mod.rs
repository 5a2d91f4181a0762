// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-entity traffic statistics derived from the core's counters.

pub mod cache;
pub mod client;
pub mod collector;
pub mod traffic;

use serde::Serialize;
use tokio::time::Instant;

pub use self::cache::StatsCache;
pub use self::client::{Counter, CounterSource, XrayStatsClient};
pub use self::collector::{StatsCollector, StatsProvider};

/// Totals and instantaneous rates for one entity.
///
/// The rate is the last increment divided by the time since the previous
/// increment in the same direction, not an average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateCounter {
    rx: u64,
    tx: u64,
    rx_per_sec: u64,
    tx_per_sec: u64,
    #[serde(skip)]
    last_rx: Instant,
    #[serde(skip)]
    last_tx: Instant,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateCounter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Counter whose first increments are measured from `at`.
    pub fn starting_at(at: Instant) -> Self {
        Self {
            rx: 0,
            tx: 0,
            rx_per_sec: 0,
            tx_per_sec: 0,
            last_rx: at,
            last_tx: at,
        }
    }

    pub fn inc_rx(&mut self, v: u64) {
        self.inc_rx_at(v, Instant::now());
    }

    pub fn inc_tx(&mut self, v: u64) {
        self.inc_tx_at(v, Instant::now());
    }

    pub fn inc_rx_at(&mut self, v: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_rx).as_secs_f64();
        self.last_rx = now;
        self.rx = self.rx.saturating_add(v);
        self.rx_per_sec = per_second(v, elapsed);
    }

    pub fn inc_tx_at(&mut self, v: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tx).as_secs_f64();
        self.last_tx = now;
        self.tx = self.tx.saturating_add(v);
        self.tx_per_sec = per_second(v, elapsed);
    }

    /// Clears totals and rates and restarts both clocks from now.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn received(&self) -> u64 {
        self.rx
    }

    pub fn sent(&self) -> u64 {
        self.tx
    }

    pub fn received_per_sec(&self) -> u64 {
        self.rx_per_sec
    }

    pub fn sent_per_sec(&self) -> u64 {
        self.tx_per_sec
    }
}

// An increment with no measurable elapsed time counts as one second.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn per_second(v: u64, elapsed_secs: f64) -> u64 {
    if elapsed_secs > 0.0 {
        (v as f64 / elapsed_secs) as u64
    } else {
        v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    User,
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub kind: MetricKind,
    pub name: String,
    pub io: RateCounter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reset_then_increment_totals_equal_delta() {
        let mut io = RateCounter::new();
        io.inc_rx(10);
        io.inc_tx(5);
        io.reset();
        assert_eq!(io.received(), 0);
        assert_eq!(io.sent_per_sec(), 0);

        io.inc_rx(50);
        io.inc_tx(30);
        assert_eq!(io.received(), 50);
        assert_eq!(io.sent(), 30);
    }

    #[test]
    fn test_rate_over_elapsed_time() {
        let start = Instant::now();
        let mut io = RateCounter::starting_at(start);
        io.inc_rx_at(1000, start + Duration::from_secs(2));
        io.inc_tx_at(300, start + Duration::from_millis(500));

        assert_eq!(io.received_per_sec(), 500);
        assert_eq!(io.sent_per_sec(), 600);

        // rates are a snapshot of the last increment only
        io.inc_rx_at(100, start + Duration::from_secs(3));
        assert_eq!(io.received(), 1100);
        assert_eq!(io.received_per_sec(), 100);
    }

    #[test]
    fn test_zero_elapsed_counts_as_one_second() {
        let start = Instant::now();
        let mut io = RateCounter::starting_at(start);
        io.inc_rx_at(42, start);
        assert_eq!(io.received_per_sec(), 42);
    }

    #[test]
    fn test_totals_never_decrease() {
        let mut io = RateCounter::new();
        io.inc_rx(u64::MAX);
        io.inc_rx(1);
        assert_eq!(io.received(), u64::MAX);
    }

    #[test]
    fn test_snapshot_serializes_without_clocks() {
        let start = Instant::now();
        let mut io = RateCounter::starting_at(start);
        io.inc_rx_at(50, start + Duration::from_secs(1));
        let snapshot = MetricSnapshot {
            kind: MetricKind::Inbound,
            name: "vless-in".to_string(),
            io,
        };

        let value = serde_json::to_value(&snapshot).unwrap_or_default();
        assert_eq!(
            value,
            serde_json::json!({
                "kind": "inbound",
                "name": "vless-in",
                "io": {"rx": 50, "tx": 0, "rx_per_sec": 50, "tx_per_sec": 0},
            })
        );
    }
}
