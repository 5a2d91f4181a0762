// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock core runners and counter sources

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use xray_supervisor::config_store::CoreConfiguration;
use xray_supervisor::dispatcher::CoreRunner;
use xray_supervisor::errors::{DispatchError, StatsError};
use xray_supervisor::stats::{Counter, CounterSource};

/// Core that exits with a failure right after start, remembering the top-level
/// keys of every document it was given.
#[derive(Default)]
pub struct CrashingCore {
    pub launches: Mutex<Vec<Vec<String>>>,
}

impl CrashingCore {
    pub fn launches(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl CoreRunner for CrashingCore {
    async fn run(
        &self,
        _cancel: CancellationToken,
        config: CoreConfiguration,
        _log_level: &str,
    ) -> Result<(), DispatchError> {
        self.launches
            .lock()
            .unwrap()
            .push(config.keys().map(str::to_string).collect());
        Err(DispatchError::MissingPipe("stdout"))
    }
}

/// Returns the queued counter samples in order, repeating the last one.
pub struct QueuedCounters {
    samples: Mutex<VecDeque<Vec<Counter>>>,
}

impl QueuedCounters {
    pub fn new(samples: Vec<Vec<(&str, u64)>>) -> Self {
        Self {
            samples: Mutex::new(
                samples
                    .into_iter()
                    .map(|sample| {
                        sample
                            .into_iter()
                            .map(|(name, value)| Counter {
                                name: name.to_string(),
                                value,
                            })
                            .collect()
                    })
                    .collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl CounterSource for QueuedCounters {
    async fn query_counters(&self, _reset: bool) -> Result<Vec<Counter>, StatsError> {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() > 1 {
            Ok(samples.pop_front().unwrap_or_default())
        } else {
            Ok(samples.front().cloned().unwrap_or_default())
        }
    }
}
