// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process::ExitCode, sync::Arc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use xray_supervisor::{
    config::SupervisorConfig,
    config_store::FileConfigStore,
    dispatcher::XrayDispatcher,
    handlers::ManagementHandlers,
    sinks::{AccessSink, CoreSink},
    stats::{StatsCache, StatsCollector, XrayStatsClient},
    supervisor::CoreManager,
    CORE_API_LISTEN,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("XRAYMON_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,tower=off,tonic=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match SupervisorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on xraymon startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match FileConfigStore::open(&config.settings_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Unable to open settings: {e}");
            return ExitCode::FAILURE;
        }
    };
    let access = match AccessSink::open(&config.access_log) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Unable to open access journal: {e}");
            return ExitCode::FAILURE;
        }
    };
    let core = match CoreSink::open(&config.core_log) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Unable to open core journal: {e}");
            return ExitCode::FAILURE;
        }
    };

    let stats_client = match XrayStatsClient::new(CORE_API_LISTEN) {
        Ok(c) => c,
        Err(e) => {
            error!("Unable to create stats client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let dispatcher = XrayDispatcher::new(&config.cores_dir, access.clone(), core.clone());
    info!("Using core binary {}", dispatcher.bin().display());

    let (manager, manager_handle) = CoreManager::new(
        cancel.clone(),
        Arc::new(dispatcher),
        store.clone(),
        core.clone(),
        &config.core_log_level,
    );
    tracker.spawn(manager.run());

    let stats_cache = Arc::new(StatsCache::new(
        Arc::new(StatsCollector::new(Arc::new(stats_client))),
        config.stats_interval,
    ));
    {
        let stats_cache = stats_cache.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move { stats_cache.run(cancel).await });
    }

    let handlers = Arc::new(ManagementHandlers::new(
        manager_handle.clone(),
        store.clone(),
        store,
        access,
        core,
        stats_cache,
    ));

    if let Err(e) = manager_handle.start() {
        error!("Unable to start core: {e}");
        cancel.cancel();
        return ExitCode::FAILURE;
    }
    info!("Core manager started");

    tracker.spawn(heartbeat(
        handlers.clone(),
        config.stats_interval,
        cancel.clone(),
    ));
    #[cfg(unix)]
    tracker.spawn(rotate_on_hangup(handlers, cancel.clone()));
    tracker.close();

    if let Err(e) = wait_for_shutdown_signal().await {
        error!("{e}");
    }

    info!("Shutting down xraymon");
    cancel.cancel();

    match tokio::time::timeout(config.shutdown_timeout, tracker.wait()).await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(_) => {
            error!(
                "Workers did not stop within {}s, exiting",
                config.shutdown_timeout.as_secs()
            );
            ExitCode::FAILURE
        }
    }
}

async fn heartbeat(handlers: Arc<ManagementHandlers>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let status = handlers.core_status();
                let snapshots = handlers
                    .network_stats(&cancel)
                    .await
                    .map(|s| s.len())
                    .unwrap_or_default();
                debug!(
                    "Core working={} uptime={}s snapshots={}",
                    status.working,
                    status.uptime.as_secs(),
                    snapshots
                );
            }
        }
    }
}

#[cfg(unix)]
async fn rotate_on_hangup(handlers: Arc<ManagementHandlers>, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("SIGHUP handler failed: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                if let Err(e) = handlers.rotate_journals() {
                    error!("Failed to rotate journals: {e}");
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<(), String> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term =
            signal(SignalKind::terminate()).map_err(|e| format!("SIGTERM handler failed: {e}"))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Ctrl+C handler failed: {e}"))
    }
}
