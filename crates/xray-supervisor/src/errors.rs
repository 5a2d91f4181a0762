// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process::ExitStatus;

/// Errors raised while reading the supervisor's own settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while loading or saving the core configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("core settings can't be named 'config.json': {0}")]
    ReservedName(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode config: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("invalid JSON for key {key:?}")]
    InvalidField { key: String },

    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors returned by a single run of the core process.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to spawn core {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        source: std::io::Error,
    },

    #[error("core process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to render core config: {0}")]
    Config(#[from] ConfigStoreError),

    #[error("failed to feed config to core: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("failed to wait for core: {0}")]
    Wait(#[source] std::io::Error),

    #[error("core exited with {0}")]
    Exited(ExitStatus),

    #[error("failed to forward core output: {0}")]
    Sink(#[from] SinkError),
}

/// Errors raised by the journal sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to open journal {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write journal record: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to encode journal record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Tail(#[from] TailError),
}

/// Errors raised while reading the end of a journal backwards.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("journal read cancelled")]
    Cancelled,

    #[error("failed to read journal: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("core manager closed")]
    Closed,
}

/// Errors raised while sampling the core's traffic counters.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("stats collection cancelled")]
    Cancelled,

    #[error("invalid core api address {addr}: {source}")]
    Endpoint {
        addr: String,
        source: tonic::transport::Error,
    },

    #[error("core api is not ready: {0}")]
    NotReady(String),

    #[error("core api call failed: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Errors surfaced to callers of the management handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("too many requests")]
    TooManyRequests,

    #[error("invalid JSON config format: {0}")]
    InvalidConfig(#[source] serde_json::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    ConfigStore(#[from] ConfigStoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Invalid("stats interval must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: stats interval must be positive"
        );

        let error = ConfigStoreError::InvalidField {
            key: "routing".to_string(),
        };
        assert_eq!(error.to_string(), "invalid JSON for key \"routing\"");
        assert_eq!(SupervisorError::Closed.to_string(), "core manager closed");
        assert_eq!(HandlerError::TooManyRequests.to_string(), "too many requests");
    }

    #[test]
    fn test_tail_error_converts_into_sink_error() {
        let error: SinkError = TailError::Cancelled.into();
        assert!(matches!(error, SinkError::Tail(TailError::Cancelled)));
        assert_eq!(error.to_string(), "journal read cancelled");
    }
}
