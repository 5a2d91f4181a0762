// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::SinkError;
use crate::sinks::{JournalFile, LastLogProvider, LineSink};

const CORE_MSG: &str = "core log";

lazy_static! {
    /// `<token>... [<Severity>] <payload>`, usually `<date> <time> [Info] ...`
    static ref CORE_LINE_REGEX: Regex =
        Regex::new(r"^(?:\S+\s+)+?\[([A-Za-z]+)\]\s+(.+)$").expect("failed creating regex");
}

/// One line of the core's own diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreLogLine {
    #[serde(rename = "core_level")]
    pub level: String,
    #[serde(rename = "data")]
    pub payload: String,
}

pub fn parse_core_line(line: &str) -> Option<CoreLogLine> {
    let caps = CORE_LINE_REGEX.captures(line)?;
    Some(CoreLogLine {
        level: caps[1].to_string(),
        payload: caps[2].to_string(),
    })
}

/// Journal of core diagnostics that also remembers the last raw line seen.
#[derive(Debug)]
pub struct CoreSink {
    journal: Mutex<JournalFile>,
    last_line: RwLock<String>,
}

impl CoreSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        Ok(Self {
            journal: Mutex::new(JournalFile::open(path)?),
            last_line: RwLock::new(String::new()),
        })
    }

    #[allow(clippy::expect_used)]
    pub fn path(&self) -> PathBuf {
        self.journal
            .lock()
            .expect("lock poisoned")
            .path()
            .to_path_buf()
    }

    #[allow(clippy::expect_used)]
    pub fn rotate(&self) -> Result<(), SinkError> {
        let mut journal = self.journal.lock().expect("lock poisoned");
        journal.rotate()?;
        debug!("Rotated core journal {}", journal.path().display());
        Ok(())
    }
}

impl LineSink for CoreSink {
    #[allow(clippy::expect_used)]
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        {
            let mut last = self.last_line.write().expect("lock poisoned");
            last.clear();
            last.push_str(line);
        }

        let Some(parsed) = parse_core_line(line) else {
            return Ok(());
        };
        self.journal
            .lock()
            .expect("lock poisoned")
            .append(CORE_MSG, &parsed)
    }
}

impl LastLogProvider for CoreSink {
    #[allow(clippy::expect_used)]
    fn last_log(&self) -> String {
        self.last_line.read().expect("lock poisoned").clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_core_line() {
        let parsed =
            parse_core_line("2024/05/01 10:00:00.123456 [Warning] core: Xray 1.8.4 started").unwrap();
        assert_eq!(parsed.level, "Warning");
        assert_eq!(parsed.payload, "core: Xray 1.8.4 started");

        assert!(parse_core_line("Xray 1.8.4 (Xray, Penetrates Everything.)").is_none());
        assert!(parse_core_line("").is_none());
    }

    #[test]
    fn test_parse_core_line_any_number_of_leading_tokens() {
        let one = parse_core_line("10:00:00 [Info] message text").unwrap();
        assert_eq!(one.level, "Info");
        assert_eq!(one.payload, "message text");

        let three = parse_core_line("2024/05/01 10:00:00 tag [Info] message text").unwrap();
        assert_eq!(three.level, "Info");
        assert_eq!(three.payload, "message text");

        // the first bracketed severity wins, later brackets stay in the payload
        let nested = parse_core_line("2024/05/01 10:00:00 [Debug] [Info] inner").unwrap();
        assert_eq!(nested.level, "Debug");
        assert_eq!(nested.payload, "[Info] inner");

        assert!(parse_core_line("[Info] no leading token").is_none());
    }

    #[test]
    fn test_last_log_tracks_every_line() {
        let dir = TempDir::new().unwrap();
        let sink = CoreSink::open(dir.path().join("core.log")).unwrap();
        assert_eq!(sink.last_log(), "");

        sink.write_line("2024/05/01 10:00:00 [Info] first").unwrap();
        assert_eq!(sink.last_log(), "2024/05/01 10:00:00 [Info] first");

        // unparsable lines are remembered but not journaled
        sink.write_line("A unified platform for anti-censorship.").unwrap();
        assert_eq!(sink.last_log(), "A unified platform for anti-censorship.");

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(contents.trim_end()).unwrap();
        assert_eq!(value["msg"], "core log");
        assert_eq!(value["core_level"], "Info");
        assert_eq!(value["data"], "first");
    }

    #[test]
    fn test_rotate_keeps_last_log() {
        let dir = TempDir::new().unwrap();
        let sink = CoreSink::open(dir.path().join("core.log")).unwrap();
        sink.write_line("2024/05/01 10:00:00 [Error] boom").unwrap();
        sink.rotate().unwrap();

        assert_eq!(std::fs::metadata(sink.path()).unwrap().len(), 0);
        assert_eq!(sink.last_log(), "2024/05/01 10:00:00 [Error] boom");
    }
}
