// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Mutex;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{SinkError, TailError};
use crate::sinks::{JournalFile, LineSink};
use crate::tail::{tail_json_lines, TAIL_BLOCK_SIZE};

/// Identity recorded for connections that carry no `email:` suffix.
pub const UNKNOWN_USER: &str = "UNKNOWN";

const ACCESS_MSG: &str = "new connection";

lazy_static! {
    /// `from <client> accepted <target> [<inbound> >> <outbound>] email: <user>`
    static ref ACCESS_LINE_REGEX: Regex = Regex::new(
        r"from (?P<client>[^ ]+)\s+accepted\s+(?P<target>[^ ]+)\s+\[(?P<inbound>[^ ]+)\s*(?:>>|=>|->)\s*(?P<outbound>[^ \]]+)\](?:\s+email:\s*(?P<email>\S+))?"
    )
    .expect("failed creating regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
}

impl Protocol {
    /// Protocol of an access target such as `tcp:example.com:443`.
    pub fn from_target(target: &str) -> Self {
        if target.starts_with("udp") {
            Protocol::Udp
        } else if target.starts_with("tcp") {
            Protocol::Tcp
        } else {
            Protocol::Http
        }
    }
}

/// One accepted connection, as journaled and as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub client: String,
    pub server: String,
    pub proto: Protocol,
    pub inbound: String,
    pub outbound: String,
    pub user: String,
}

/// Parses one access line, returning `None` when it does not describe an
/// accepted connection.
pub fn parse_access_line(line: &str) -> Option<ConnectionRecord> {
    let caps = ACCESS_LINE_REGEX.captures(line)?;
    let target = &caps["target"];
    Some(ConnectionRecord {
        client: caps["client"].to_string(),
        server: target.to_string(),
        proto: Protocol::from_target(target),
        inbound: caps["inbound"].to_string(),
        outbound: caps["outbound"].to_string(),
        user: caps
            .name("email")
            .map_or_else(|| UNKNOWN_USER.to_string(), |m| m.as_str().to_string()),
    })
}

/// Journal of accepted connections.
#[derive(Debug)]
pub struct AccessSink {
    journal: Mutex<JournalFile>,
}

impl AccessSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        Ok(Self {
            journal: Mutex::new(JournalFile::open(path)?),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path().to_path_buf()
    }

    pub fn record(&self, record: &ConnectionRecord) -> Result<(), SinkError> {
        self.lock().append(ACCESS_MSG, record)
    }

    /// Truncates the journal. Records written afterwards start a fresh file.
    pub fn rotate(&self) -> Result<(), SinkError> {
        let mut journal = self.lock();
        journal.rotate()?;
        debug!("Rotated access journal {}", journal.path().display());
        Ok(())
    }

    /// Returns the last `n` journaled connections, oldest first, or every
    /// connection when `n <= 0`. Lines that fail to decode are skipped.
    pub fn last_connections(
        &self,
        n: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConnectionRecord>, SinkError> {
        let mut file = self.open_reader()?;

        let lines = match usize::try_from(n) {
            Ok(n) if n > 0 => tail_json_lines(&mut file, n, TAIL_BLOCK_SIZE, cancel)?,
            _ => scan_all(file, cancel)?,
        };

        Ok(lines
            .iter()
            .filter_map(|line| serde_json::from_slice::<ConnectionRecord>(line).ok())
            .collect())
    }

    /// Independent read handle on the journal. The journal lock is only held
    /// while resolving the path, so scans never block writers.
    fn open_reader(&self) -> Result<File, SinkError> {
        let path = self.path();
        File::open(&path).map_err(|source| SinkError::Open { path, source })
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, JournalFile> {
        self.journal.lock().expect("lock poisoned")
    }
}

fn scan_all(file: File, cancel: &CancellationToken) -> Result<Vec<Vec<u8>>, TailError> {
    let mut lines = Vec::new();
    for line in BufReader::new(file).split(b'\n') {
        if cancel.is_cancelled() {
            return Err(TailError::Cancelled);
        }
        let line = line?;
        if !line.trim_ascii().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

impl LineSink for AccessSink {
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        match parse_access_line(line) {
            Some(record) => self.record(&record),
            None => Ok(()),
        }
    }
}
