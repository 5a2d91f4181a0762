// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keeps a single core process alive.
//!
//! [`CoreManager`] owns the restart loop and is driven by `run()` on its own
//! task. [`CoreManagerHandle`] is the cheap, cloneable side used to request
//! restarts and read the core's status. Restart requests go through a queue of
//! depth one: a request made while another is still pending is dropped.
//!
//! A run that fails schedules a crash restart after [`crash_backoff`]; a run
//! that returns cleanly leaves the core reported as working.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config_store::ConfigLoader;
use crate::dispatcher::CoreRunner;
use crate::errors::SupervisorError;
use crate::sinks::LastLogProvider;

const BACKOFF_BASE_SECS: u64 = 10;
const BACKOFF_STEP_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    Manual,
    Crash,
}

/// Delay before restarting after `crash_count` consecutive crashes.
pub fn crash_backoff(crash_count: u32) -> Duration {
    Duration::from_secs(
        BACKOFF_BASE_SECS.saturating_add(BACKOFF_STEP_SECS.saturating_mul(u64::from(crash_count))),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreStatus {
    pub working: bool,
    pub last_log: String,
    /// Time since the last start, zero while not working.
    pub uptime: Duration,
}

#[derive(Debug, Default)]
struct ManagerState {
    working: bool,
    last_start: Option<Instant>,
    crash_count: u32,
    run_cancel: Option<CancellationToken>,
    // Bumped on every restart attempt so a superseded run can't overwrite the state.
    generation: u64,
    closed: bool,
}

type SharedState = Arc<Mutex<ManagerState>>;

#[allow(clippy::expect_used)]
fn lock(state: &SharedState) -> MutexGuard<'_, ManagerState> {
    state.lock().expect("lock poisoned")
}

#[derive(Clone)]
pub struct CoreManagerHandle {
    tx: mpsc::Sender<RestartKind>,
    state: SharedState,
    last_log: Arc<dyn LastLogProvider>,
}

impl CoreManagerHandle {
    pub fn start(&self) -> Result<(), SupervisorError> {
        self.restart()
    }

    /// Requests a manual restart. Returns immediately; the request is dropped
    /// when another one is already queued.
    pub fn restart(&self) -> Result<(), SupervisorError> {
        if lock(&self.state).closed {
            return Err(SupervisorError::Closed);
        }
        match self.tx.try_send(RestartKind::Manual) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Restart already pending, request coalesced");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(SupervisorError::Closed),
        }
    }

    pub fn status(&self) -> CoreStatus {
        let state = lock(&self.state);
        let uptime = match (state.working, state.last_start) {
            (true, Some(started)) => started.elapsed(),
            _ => Duration::ZERO,
        };
        CoreStatus {
            working: state.working,
            last_log: self.last_log.last_log(),
            uptime,
        }
    }

    /// Number of crashes since the last clean run or manual restart.
    pub fn crash_count(&self) -> u32 {
        lock(&self.state).crash_count
    }
}

pub struct CoreManager {
    runner: Arc<dyn CoreRunner>,
    loader: Arc<dyn ConfigLoader>,
    log_level: Arc<str>,
    state: SharedState,
    tx: mpsc::Sender<RestartKind>,
    rx: mpsc::Receiver<RestartKind>,
    cancel: CancellationToken,
    runs: TaskTracker,
}

impl CoreManager {
    pub fn new(
        cancel: CancellationToken,
        runner: Arc<dyn CoreRunner>,
        loader: Arc<dyn ConfigLoader>,
        last_log: Arc<dyn LastLogProvider>,
        log_level: &str,
    ) -> (Self, CoreManagerHandle) {
        let (tx, rx) = mpsc::channel(1);
        let state = SharedState::default();

        let handle = CoreManagerHandle {
            tx: tx.clone(),
            state: state.clone(),
            last_log,
        };
        let manager = Self {
            runner,
            loader,
            log_level: Arc::from(log_level),
            state,
            tx,
            rx,
            cancel,
            runs: TaskTracker::new(),
        };
        (manager, handle)
    }

    /// Serves restart requests until the root token is cancelled, then stops the
    /// running core and waits for its run to finish.
    pub async fn run(mut self) {
        debug!("Core manager started");

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(kind) = self.rx.recv() => {
                    if kind == RestartKind::Crash {
                        let delay = crash_backoff(lock(&self.state).crash_count);
                        error!("Core crashed, restarting in {}s", delay.as_secs());
                        tokio::select! {
                            biased;
                            () = self.cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    self.restart(kind);
                }
            }
        }

        {
            let mut state = lock(&self.state);
            state.closed = true;
            if let Some(run_cancel) = state.run_cancel.take() {
                run_cancel.cancel();
            }
        }
        self.runs.close();
        self.runs.wait().await;
        info!("Core manager exit");
    }

    fn restart(&self, kind: RestartKind) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        if kind == RestartKind::Manual {
            state.crash_count = 0;
        }
        if let Some(previous) = state.run_cancel.take() {
            previous.cancel();
        }
        state.generation += 1;
        let generation = state.generation;

        let config = match self.loader.load_config() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load core config: {e}");
                state.working = false;
                return;
            }
        };

        let run_cancel = self.cancel.child_token();
        state.run_cancel = Some(run_cancel.clone());
        state.working = true;
        state.last_start = Some(Instant::now());
        drop(state);

        let runner = self.runner.clone();
        let log_level = self.log_level.clone();
        let shared = self.state.clone();
        let tx = self.tx.clone();
        self.runs.spawn(async move {
            info!("Running core with log level {log_level}");
            let result = runner.run(run_cancel, config, &log_level).await;

            let mut state = lock(&shared);
            if state.generation != generation || state.closed {
                debug!("Ignoring result of superseded core run");
                return;
            }
            match result {
                Ok(()) => {
                    state.working = true;
                    state.crash_count = 0;
                }
                Err(e) => {
                    error!("Core run failed: {e}");
                    state.working = false;
                    state.crash_count = state.crash_count.saturating_add(1);
                    drop(state);
                    if tx.try_send(RestartKind::Crash).is_err() {
                        debug!("Restart already pending, crash restart coalesced");
                    }
                }
            }
        });
    }
}
