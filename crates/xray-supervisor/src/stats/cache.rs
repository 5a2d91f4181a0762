// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::StatsError;
use crate::stats::{MetricSnapshot, StatsProvider};

/// Latest set of snapshots, refreshed in the background so readers never wait
/// on the core's API.
pub struct StatsCache {
    provider: Arc<dyn StatsProvider>,
    poll_interval: Duration,
    snapshots: RwLock<Vec<MetricSnapshot>>,
}

impl StatsCache {
    pub fn new(provider: Arc<dyn StatsProvider>, poll_interval: Duration) -> Self {
        Self {
            provider,
            poll_interval,
            snapshots: RwLock::new(Vec::new()),
        }
    }

    /// Polls the provider every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.collect(&cancel).await,
            }
        }
        info!("Stats cache stopped");
    }

    /// Replaces the cached snapshots with a fresh collection. On failure the
    /// previous snapshots are kept.
    pub async fn collect(&self, cancel: &CancellationToken) {
        match self.provider.stats(cancel).await {
            Ok(snapshots) => {
                debug!("Collected {} stats snapshots", snapshots.len());
                *self.snapshots.write().await = snapshots;
            }
            Err(StatsError::Cancelled) => debug!("Stats collection cancelled"),
            Err(e) => error!("Failed to collect stats: {e}"),
        }
    }

    /// Copy of the latest snapshots.
    pub async fn stats_now(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<MetricSnapshot>, StatsError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StatsError::Cancelled),
            snapshots = self.snapshots.read() => Ok(snapshots.clone()),
        }
    }
}
