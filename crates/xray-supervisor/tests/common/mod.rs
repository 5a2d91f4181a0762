// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the integration tests

pub mod mocks;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use xray_supervisor::config_store::FileConfigStore;
use xray_supervisor::sinks::{AccessSink, CoreSink};

pub const SETTINGS: &str = r#"{
    "inbounds": [{"tag": "vless-in", "protocol": "vless", "port": 443}],
    "outbounds": [{"tag": "direct", "protocol": "freedom"}],
    "comment": "dropped on load"
}"#;

/// Settings file and journals inside a temporary directory.
pub struct Workspace {
    #[allow(dead_code)]
    pub dir: TempDir,
    pub store: Arc<FileConfigStore>,
    pub access: Arc<AccessSink>,
    pub core: Arc<CoreSink>,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let settings = dir.path().join("settings.json");
        std::fs::write(&settings, SETTINGS).unwrap();

        Self {
            store: Arc::new(FileConfigStore::open(settings).unwrap()),
            access: Arc::new(AccessSink::open(dir.path().join("access.log")).unwrap()),
            core: Arc::new(CoreSink::open(dir.path().join("core.log")).unwrap()),
            dir,
        }
    }
}

/// Polls `check` every 50ms until it holds or `limit` has passed.
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
