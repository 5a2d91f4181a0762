// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Management operations exposed to a transport.
//!
//! Every operation maps to one call a remote operator can make; the transport
//! only has to translate these results to its own messages.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config_store::{ConfigLoader, ConfigSaver, CoreConfiguration};
use crate::errors::{ConfigStoreError, HandlerError, SinkError, StatsError, TailError};
use crate::sinks::{AccessSink, ConnectionRecord, CoreSink};
use crate::stats::{MetricSnapshot, StatsCache};
use crate::supervisor::{CoreManagerHandle, CoreStatus};

/// Minimum time between two accepted restarts, and between two accepted
/// uploads.
pub const MANAGEMENT_CALL_INTERVAL: Duration = Duration::from_secs(5);

/// Accepts at most one call per interval.
#[derive(Debug)]
pub struct IntervalLimiter {
    interval: Duration,
    last_accepted: Mutex<Option<Instant>>,
}

impl IntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: Mutex::new(None),
        }
    }

    /// Returns true and records the call when the previous accepted call is at
    /// least one interval old.
    #[allow(clippy::expect_used)]
    pub fn in_limits(&self) -> bool {
        let mut last = self.last_accepted.lock().expect("lock poisoned");
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < self.interval) {
            return false;
        }
        *last = Some(now);
        true
    }
}

pub struct ManagementHandlers {
    manager: CoreManagerHandle,
    loader: Arc<dyn ConfigLoader>,
    saver: Arc<dyn ConfigSaver>,
    access: Arc<AccessSink>,
    core: Arc<CoreSink>,
    stats: Arc<StatsCache>,
    restart_limiter: IntervalLimiter,
    upload_limiter: IntervalLimiter,
}

impl ManagementHandlers {
    pub fn new(
        manager: CoreManagerHandle,
        loader: Arc<dyn ConfigLoader>,
        saver: Arc<dyn ConfigSaver>,
        access: Arc<AccessSink>,
        core: Arc<CoreSink>,
        stats: Arc<StatsCache>,
    ) -> Self {
        Self {
            manager,
            loader,
            saver,
            access,
            core,
            stats,
            restart_limiter: IntervalLimiter::new(MANAGEMENT_CALL_INTERVAL),
            upload_limiter: IntervalLimiter::new(MANAGEMENT_CALL_INTERVAL),
        }
    }

    pub fn core_status(&self) -> CoreStatus {
        let status = self.manager.status();
        debug!("Core status requested: working={}", status.working);
        status
    }

    pub fn core_restart(&self) -> Result<(), HandlerError> {
        if !self.restart_limiter.in_limits() {
            warn!("Core restart request rejected by rate limit");
            return Err(HandlerError::TooManyRequests);
        }
        info!("Core restart requested");
        self.manager.restart()?;
        Ok(())
    }

    /// The stored core configuration as compact JSON.
    pub fn get_config(&self) -> Result<String, HandlerError> {
        let config = self.loader.load_config()?;
        let data = config.to_vec()?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Replaces the stored configuration with `data`, dropping fields the core
    /// does not accept, and optionally restarts the core with it.
    pub fn upload_config(&self, data: &str, restart_core: bool) -> Result<(), HandlerError> {
        if !self.upload_limiter.in_limits() {
            warn!("Config upload rejected by rate limit");
            return Err(HandlerError::TooManyRequests);
        }

        let config = CoreConfiguration::from_slice(data.as_bytes()).map_err(|e| match e {
            ConfigStoreError::Decode(e) => {
                warn!("Invalid JSON config format: {e}");
                HandlerError::InvalidConfig(e)
            }
            other => other.into(),
        })?;

        info!("Config upload requested");
        self.saver.save_config(config)?;
        info!("Config saved");

        if restart_core {
            info!("Core restart requested");
            self.manager.restart()?;
        }
        Ok(())
    }

    /// The last `last` connections, oldest first, or all of them when `last`
    /// is not positive.
    pub async fn connection_journal(
        &self,
        last: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConnectionRecord>, HandlerError> {
        let access = self.access.clone();
        let task_cancel = cancel.clone();
        let records =
            tokio::task::spawn_blocking(move || access.last_connections(last, &task_cancel))
                .await?;
        match records {
            Err(SinkError::Tail(TailError::Cancelled)) => Err(HandlerError::Cancelled),
            other => Ok(other?),
        }
    }

    pub async fn network_stats(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<MetricSnapshot>, HandlerError> {
        match self.stats.stats_now(cancel).await {
            Err(StatsError::Cancelled) => Err(HandlerError::Cancelled),
            other => Ok(other?),
        }
    }

    /// Truncates both journals.
    pub fn rotate_journals(&self) -> Result<(), HandlerError> {
        self.access.rotate()?;
        self.core.rotate()?;
        info!("Journals rotated");
        Ok(())
    }
}
