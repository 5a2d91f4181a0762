// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs the core process once: renders its configuration onto stdin and routes
//! every stdout line to the access or core journal.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config_store::CoreConfiguration;
use crate::errors::DispatchError;
use crate::sinks::LineSink;
use crate::{CORE_API_LISTEN, CORE_API_SERVICES, CORE_API_TAG};

const ACCESS_MARKER: &str = "accepted";
const LOG_LEVELS: [&str; 4] = ["debug", "info", "warning", "error"];
const DEFAULT_LOG_LEVEL: &str = "info";

/// One lifetime of the core process.
#[async_trait]
pub trait CoreRunner: Send + Sync {
    /// Runs the core until it exits or `cancel` fires. Returns `Ok` when the
    /// core exited with status 0 or was cancelled.
    async fn run(
        &self,
        cancel: CancellationToken,
        config: CoreConfiguration,
        log_level: &str,
    ) -> Result<(), DispatchError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogObject<'a> {
    access: &'a str,
    error: &'a str,
    loglevel: &'a str,
    dns_log: bool,
    mask_address: &'a str,
}

#[derive(Serialize)]
struct StatsObject {}

#[derive(Serialize)]
struct ApiObject<'a> {
    tag: &'a str,
    listen: &'a str,
    services: &'a [&'a str],
}

/// Maps the levels the core understands to themselves and anything else to
/// `info`.
pub fn normalize_log_level(level: &str) -> &'static str {
    LOG_LEVELS
        .iter()
        .find(|known| **known == level)
        .copied()
        .unwrap_or(DEFAULT_LOG_LEVEL)
}

/// Overwrites the `log`, `stats` and `api` objects with the ones the supervisor
/// relies on: output on stdout, counters enabled and the management API on
/// loopback.
pub fn inject_runtime_objects(
    config: &mut CoreConfiguration,
    log_level: &str,
) -> Result<(), DispatchError> {
    config.set(
        "log",
        &LogObject {
            access: "",
            error: "",
            loglevel: normalize_log_level(log_level),
            dns_log: false,
            mask_address: "",
        },
    )?;
    config.set("stats", &StatsObject {})?;
    config.set(
        "api",
        &ApiObject {
            tag: CORE_API_TAG,
            listen: CORE_API_LISTEN,
            services: &CORE_API_SERVICES,
        },
    )?;
    Ok(())
}

fn release_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

fn release_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// File name of the core release built for the running platform, for example
/// `Xray-linux-amd64`.
pub fn core_binary_name() -> String {
    format!(
        "Xray-{}-{}{}",
        release_os(std::env::consts::OS),
        release_arch(std::env::consts::ARCH),
        std::env::consts::EXE_SUFFIX
    )
}

pub struct XrayDispatcher {
    bin: PathBuf,
    args: Vec<String>,
    access: Arc<dyn LineSink>,
    core: Arc<dyn LineSink>,
}

impl XrayDispatcher {
    /// Dispatcher for the platform's core release inside `cores_dir`.
    pub fn new(cores_dir: &Path, access: Arc<dyn LineSink>, core: Arc<dyn LineSink>) -> Self {
        Self::with_binary(cores_dir.join(core_binary_name()), access, core)
    }

    pub fn with_binary(
        bin: impl Into<PathBuf>,
        access: Arc<dyn LineSink>,
        core: Arc<dyn LineSink>,
    ) -> Self {
        Self {
            bin: bin.into(),
            args: Vec::new(),
            access,
            core,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    fn forward(&self, line: &str) -> Result<(), DispatchError> {
        if line.contains(ACCESS_MARKER) {
            self.access.write_line(line)?;
        } else {
            self.core.write_line(line)?;
        }
        Ok(())
    }

    fn spawn(&self) -> Result<Child, DispatchError> {
        Command::new(&self.bin)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DispatchError::Spawn {
                bin: self.bin.clone(),
                source,
            })
    }
}

#[async_trait]
impl CoreRunner for XrayDispatcher {
    async fn run(
        &self,
        cancel: CancellationToken,
        mut config: CoreConfiguration,
        log_level: &str,
    ) -> Result<(), DispatchError> {
        inject_runtime_objects(&mut config, log_level)?;
        let rendered = config.to_vec()?;

        let mut child = self.spawn()?;
        info!("Started core {} (pid {:?})", self.bin.display(), child.id());

        let stdin = child.stdin.take().ok_or(DispatchError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(DispatchError::MissingPipe("stdout"))?;

        // stdout is drained while the document is still being written
        let (tx, mut rx) = mpsc::channel::<String>(1);
        let reader = tokio::spawn(read_lines(stdout, tx));
        let mut feeder = tokio::spawn(feed_stdin(stdin, rendered));
        let mut fed = false;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    feeder.abort();
                    reader.abort();
                    kill(&mut child).await;
                    debug!("Core stopped on cancellation");
                    return Ok(());
                }
                result = &mut feeder, if !fed => {
                    fed = true;
                    let result = result.unwrap_or_else(|e| Err(std::io::Error::other(e)));
                    if let Err(e) = result {
                        reader.abort();
                        kill(&mut child).await;
                        return Err(DispatchError::Stdin(e));
                    }
                }
                line = rx.recv() => match line {
                    Some(line) => {
                        if let Err(e) = self.forward(&line) {
                            feeder.abort();
                            reader.abort();
                            kill(&mut child).await;
                            return Err(e);
                        }
                    }
                    None => break,
                },
            }
        }
        feeder.abort();

        let status: ExitStatus = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                kill(&mut child).await;
                return Ok(());
            }
            status = child.wait() => status.map_err(DispatchError::Wait)?,
        };

        if status.success() {
            info!("Core exited cleanly");
            Ok(())
        } else {
            Err(DispatchError::Exited(status))
        }
    }
}

async fn feed_stdin(mut stdin: ChildStdin, rendered: Vec<u8>) -> std::io::Result<()> {
    stdin.write_all(&rendered).await?;
    stdin.shutdown().await
}

async fn read_lines(stdout: ChildStdout, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = buf
                    .strip_suffix(b"\n")
                    .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
                    .unwrap_or(buf.as_slice());
                if tx
                    .send(String::from_utf8_lossy(line).into_owned())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read core output: {e}");
                break;
            }
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Failed to signal core: {e}");
    }
    if let Err(e) = child.wait().await {
        debug!("Failed to reap core: {e}");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_log_level() {
        assert_eq!(normalize_log_level("debug"), "debug");
        assert_eq!(normalize_log_level("warning"), "warning");
        assert_eq!(normalize_log_level("warn"), "info");
        assert_eq!(normalize_log_level(""), "info");
        assert_eq!(normalize_log_level("ERROR"), "info");
    }

    #[test]
    fn test_release_names() {
        assert_eq!(release_os("macos"), "darwin");
        assert_eq!(release_os("linux"), "linux");
        assert_eq!(release_os("windows"), "windows");
        assert_eq!(release_arch("x86_64"), "amd64");
        assert_eq!(release_arch("aarch64"), "arm64");
        assert_eq!(release_arch("x86"), "386");
        assert_eq!(release_arch("arm"), "arm");
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn test_core_binary_name_on_linux() {
        assert_eq!(core_binary_name(), "Xray-linux-amd64");
    }

    #[test]
    fn test_inject_runtime_objects() {
        let mut config = CoreConfiguration::from_slice(
            br#"{"log":{"loglevel":"debug","access":"/var/log/a"},"routing":{"rules":[]}}"#,
        )
        .unwrap();
        inject_runtime_objects(&mut config, "nonsense").unwrap();

        let rendered: serde_json::Value = serde_json::from_slice(&config.to_vec().unwrap()).unwrap();
        assert_eq!(
            rendered["log"],
            serde_json::json!({
                "access": "",
                "error": "",
                "loglevel": "info",
                "dnsLog": false,
                "maskAddress": "",
            })
        );
        assert_eq!(rendered["stats"], serde_json::json!({}));
        assert_eq!(rendered["api"]["tag"], "api");
        assert_eq!(rendered["api"]["listen"], "127.0.0.1:3000");
        assert_eq!(rendered["api"]["services"].as_array().unwrap().len(), 4);
        assert_eq!(rendered["routing"], serde_json::json!({"rules": []}));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::errors::SinkError;
        use serial_test::serial;
        use std::sync::Mutex;
        use std::time::Duration;
        use tempfile::TempDir;

        #[derive(Default)]
        struct RecordingSink {
            lines: Mutex<Vec<String>>,
        }

        impl RecordingSink {
            fn lines(&self) -> Vec<String> {
                self.lines.lock().unwrap().clone()
            }
        }

        impl LineSink for RecordingSink {
            fn write_line(&self, line: &str) -> Result<(), SinkError> {
                self.lines.lock().unwrap().push(line.to_string());
                Ok(())
            }
        }

        fn shell(script: &str) -> (XrayDispatcher, Arc<RecordingSink>, Arc<RecordingSink>) {
            let access = Arc::new(RecordingSink::default());
            let core = Arc::new(RecordingSink::default());
            let dispatcher = XrayDispatcher::with_binary("/bin/sh", access.clone(), core.clone())
                .with_args(["-c", script]);
            (dispatcher, access, core)
        }

        #[tokio::test]
        #[serial]
        async fn test_feeds_config_on_stdin() {
            let dir = TempDir::new().unwrap();
            let out = dir.path().join("fed.json");
            let (dispatcher, _, _) = shell(&format!("cat > '{}'", out.display()));

            let config = CoreConfiguration::from_slice(br#"{"outbounds":[{"protocol":"freedom"}]}"#)
                .unwrap();
            dispatcher
                .run(CancellationToken::new(), config, "warning")
                .await
                .unwrap();

            let fed: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
            assert_eq!(fed["log"]["loglevel"], "warning");
            assert_eq!(fed["outbounds"][0]["protocol"], "freedom");
            assert_eq!(fed["api"]["listen"], "127.0.0.1:3000");
        }

        #[tokio::test]
        #[serial]
        async fn test_routes_lines_by_marker() {
            let (dispatcher, access, core) = shell(
                "cat > /dev/null; \
                 echo '2024/05/01 10:00:00 [Info] core: started'; \
                 echo 'from 1.2.3.4:5 accepted tcp:example.com:443 [in >> out]'; \
                 printf 'no newline at end'",
            );
            dispatcher
                .run(CancellationToken::new(), CoreConfiguration::new(), "info")
                .await
                .unwrap();

            assert_eq!(
                access.lines(),
                vec!["from 1.2.3.4:5 accepted tcp:example.com:443 [in >> out]"]
            );
            assert_eq!(
                core.lines(),
                vec!["2024/05/01 10:00:00 [Info] core: started", "no newline at end"]
            );
        }

        #[tokio::test]
        #[serial]
        async fn test_non_zero_exit_is_an_error() {
            let (dispatcher, _, _) = shell("cat > /dev/null; exit 3");
            let err = dispatcher
                .run(CancellationToken::new(), CoreConfiguration::new(), "info")
                .await
                .unwrap_err();
            match err {
                DispatchError::Exited(status) => assert_eq!(status.code(), Some(3)),
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        #[serial]
        async fn test_cancel_kills_core() {
            let (dispatcher, _, core) = shell("cat > /dev/null; echo ready; exec sleep 30");
            let dispatcher = Arc::new(dispatcher);
            let cancel = CancellationToken::new();

            let run = {
                let dispatcher = dispatcher.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    dispatcher
                        .run(cancel, CoreConfiguration::new(), "info")
                        .await
                })
            };

            for _ in 0..500 {
                if !core.lines().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();

            let result = tokio::time::timeout(Duration::from_secs(5), run)
                .await
                .expect("core was not stopped promptly")
                .unwrap();
            assert!(result.is_ok());
            assert_eq!(core.lines(), vec!["ready"]);
        }

        #[tokio::test]
        #[serial]
        async fn test_cancel_while_core_ignores_stdin() {
            // larger than any pipe buffer, so the write can only finish if the
            // core reads it
            let mut config = CoreConfiguration::new();
            config.insert_raw("routing", format!("\"{}\"", "x".repeat(1 << 20)));

            let (dispatcher, _, _) = shell("exec sleep 30");
            let cancel = CancellationToken::new();
            let run = {
                let cancel = cancel.clone();
                tokio::spawn(async move { dispatcher.run(cancel, config, "info").await })
            };

            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();

            let result = tokio::time::timeout(Duration::from_secs(3), run)
                .await
                .expect("core was not stopped promptly")
                .unwrap();
            assert!(result.is_ok());
        }

        #[tokio::test]
        #[serial]
        async fn test_output_is_read_while_config_is_fed() {
            // the core fills its stdout before it starts reading stdin
            let mut config = CoreConfiguration::new();
            config.insert_raw("routing", format!("\"{}\"", "x".repeat(1 << 20)));

            let (dispatcher, _, core) =
                shell("i=0; while [ $i -lt 4000 ]; do echo \"line $i padding padding padding\"; i=$((i+1)); done; cat > /dev/null");
            let result = tokio::time::timeout(
                Duration::from_secs(10),
                dispatcher.run(CancellationToken::new(), config, "info"),
            )
            .await
            .expect("core output and config feeding deadlocked");
            assert!(result.is_ok());
            assert_eq!(core.lines().len(), 4000);
        }

        #[tokio::test]
        #[serial]
        async fn test_missing_binary() {
            let access = Arc::new(RecordingSink::default());
            let core = Arc::new(RecordingSink::default());
            let dispatcher =
                XrayDispatcher::with_binary("/nonexistent/Xray-none", access, core);
            let err = dispatcher
                .run(CancellationToken::new(), CoreConfiguration::new(), "info")
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::Spawn { .. }));
        }
    }
}
