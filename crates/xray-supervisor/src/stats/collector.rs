// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::StatsError;
use crate::stats::client::{Counter, CounterSource};
use crate::stats::traffic::{Traffic, TrafficSample};
use crate::stats::{MetricKind, MetricSnapshot, RateCounter};

/// Gap between the two counter queries of one collection.
pub const SAMPLE_GAP: Duration = Duration::from_secs(1);

/// Source of fresh per-entity snapshots.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    async fn stats(&self, cancel: &CancellationToken) -> Result<Vec<MetricSnapshot>, StatsError>;
}

/// Derives per-entity rates from two counter samples taken [`SAMPLE_GAP`]
/// apart.
pub struct StatsCollector {
    source: Arc<dyn CounterSource>,
    gap: Duration,
}

impl StatsCollector {
    pub fn new(source: Arc<dyn CounterSource>) -> Self {
        Self {
            source,
            gap: SAMPLE_GAP,
        }
    }

    async fn sample(&self, cancel: &CancellationToken) -> Result<Vec<Counter>, StatsError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StatsError::Cancelled),
            counters = self.source.query_counters(false) => counters,
        }
    }
}

#[async_trait]
impl StatsProvider for StatsCollector {
    async fn stats(&self, cancel: &CancellationToken) -> Result<Vec<MetricSnapshot>, StatsError> {
        let first = TrafficSample::from_counters(&self.sample(cancel).await?);
        let started = Instant::now();

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StatsError::Cancelled),
            () = tokio::time::sleep(self.gap) => {}
        }

        let second = TrafficSample::from_counters(&self.sample(cancel).await?);
        // rates cover the pacing gap only, not the time spent querying
        Ok(diff_samples(&first, &second, started, started + self.gap))
    }
}

fn snapshot(
    kind: MetricKind,
    name: String,
    prev: Traffic,
    next: Traffic,
    from: Instant,
    to: Instant,
) -> MetricSnapshot {
    let mut io = RateCounter::starting_at(from);
    // a counter that went down means the core restarted between samples
    io.inc_rx_at(next.received.saturating_sub(prev.received), to);
    io.inc_tx_at(next.sent.saturating_sub(prev.sent), to);
    MetricSnapshot { kind, name, io }
}

/// Snapshots for every entity present in both samples: users first, then
/// tags, each sorted by name.
pub fn diff_samples(
    prev: &TrafficSample,
    next: &TrafficSample,
    from: Instant,
    to: Instant,
) -> Vec<MetricSnapshot> {
    let mut users: Vec<_> = next
        .users
        .iter()
        .filter_map(|(name, traffic)| {
            prev.users
                .get(name)
                .map(|before| snapshot(MetricKind::User, name.clone(), *before, *traffic, from, to))
        })
        .collect();
    users.sort_by(|a, b| a.name.cmp(&b.name));

    let mut tags: Vec<_> = next
        .tags
        .iter()
        .filter_map(|(key, traffic)| prev.tags.get(key).map(|before| (key, *before, *traffic)))
        .collect();
    tags.sort_by(|a, b| a.0.cmp(b.0));

    users.extend(tags.into_iter().map(|((direction, tag), before, after)| {
        snapshot(direction.kind(), tag.clone(), before, after, from, to)
    }));
    users
}
